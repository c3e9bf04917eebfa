//! Progress reporting for `write`-family transfers.
//!
//! Three output styles are supported: a human progress bar on the terminal,
//! bare percentage lines consumable by `dialog --gauge`, and an extended
//! "xgauge" variant that also updates the dialog prompt with a transfer
//! status line. The reporter is fed the byte count of every completed USB
//! chunk; with a reporter active the write path shrinks its chunk size so
//! updates fire more often.

use std::fmt;
use std::io::{self, Write};
use std::time::Instant;

use kdam::{tqdm, Bar, BarExt};

/// Progress output style.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressStyle {
    /// Terminal progress bar.
    Bar,
    /// Percentage lines for `dialog --gauge`.
    Gauge,
    /// `XXX`-framed gauge blocks that also update the prompt.
    XGauge,
}

/// An active progress report over a known total byte count.
///
/// The total may span several files (`multiwrite` sums its file sizes up
/// front), so one reporter outlives individual transfers.
pub struct Progress {
    style: ProgressStyle,
    total: usize,
    done: usize,
    start: Instant,
    bar: Option<Bar>,
    last_percent: i32,
}

impl fmt::Debug for Progress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Progress")
            .field("style", &self.style)
            .field("total", &self.total)
            .field("done", &self.done)
            .finish()
    }
}

impl Progress {
    /// Starts a progress report for `total` bytes.
    pub fn start(style: ProgressStyle, total: usize) -> Progress {
        let bar = match style {
            ProgressStyle::Bar => Some(tqdm!(
                total = total,
                unit = "B",
                unit_scale = true,
                unit_divisor = 1024
            )),
            _ => None,
        };
        Progress {
            style,
            total,
            done: 0,
            start: Instant::now(),
            bar,
            last_percent: -1,
        }
    }

    /// Accounts for `bytes` more transferred bytes and refreshes the output.
    pub fn update(&mut self, bytes: usize) {
        self.done += bytes;
        let percent = self.percent();
        match self.style {
            ProgressStyle::Bar => {
                if let Some(ref mut bar) = self.bar {
                    let _ = bar.update(bytes);
                }
            }
            ProgressStyle::Gauge => {
                // dialog(1) redraws on every line; only emit changes.
                if percent != self.last_percent {
                    println!("{}", percent);
                    let _ = io::stdout().flush();
                }
            }
            ProgressStyle::XGauge => {
                print!(
                    "XXX\n{}\n{} of {} bytes, {:.1} kB/s\nXXX\n",
                    percent,
                    self.done,
                    self.total,
                    self.rate_kb()
                );
                let _ = io::stdout().flush();
            }
        }
        self.last_percent = percent;
    }

    fn percent(&self) -> i32 {
        if self.total == 0 {
            100
        } else {
            ((self.done as f64 / self.total as f64) * 100.0) as i32
        }
    }

    fn rate_kb(&self) -> f64 {
        let elapsed = self.start.elapsed();
        let secs = elapsed.as_secs() as f64 + f64::from(elapsed.subsec_millis()) / 1000.0;
        if secs > 0.0 {
            (self.done as f64 / 1024.0) / secs
        } else {
            0.0
        }
    }
}

/// Emits a `dialog --gauge` compatible caption block, updating the prompt
/// without changing the percentage.
pub fn echo_gauge(text: &str) {
    print!("XXX\n0\n{}\nXXX\n", text);
    let _ = io::stdout().flush();
}
