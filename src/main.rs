//! `sunxi-fel` command-line tool.
//!
//! Parses the option prefix, opens the FEL device, and then reduces the
//! command stream left to right against the library. Exit codes: `0` on
//! success, `1` on command or validation errors, `2` on USB failures.

#![forbid(anonymous_parameters)]
#![deny(
    unused_results,
    unused_qualifications,
    unsafe_code,
    trivial_numeric_casts,
    trivial_casts
)]

use std::fs;
use std::io::{self, Write};
use std::process;

use clap::{CommandFactory, Parser};
use clap_num::maybe_hex;
use failure::{bail, format_err, Error, ResultExt};
use log::{info, LevelFilter};

use sunxi_fel::image::{self, ImageType};
use sunxi_fel::progress::{echo_gauge, Progress, ProgressStyle};
use sunxi_fel::{Fel, FelError, FelHandle, UsbTransport};

const COMMANDS_HELP: &str = "COMMANDS:
    spl file                      Load and execute U-Boot SPL
        If file additionally contains a main U-Boot binary
        (u-boot-sunxi-with-spl.bin), this command also transfers that
        to memory (default address from image), but won't execute it.
    uboot file-with-spl           Like \"spl\", but actually starts U-Boot
        U-Boot execution will take place when the fel utility exits.
        This allows combining \"uboot\" with further \"write\" commands
        (to transfer other files needed for the boot).
    hex[dump] address length      Dumps memory region in hex
    dump address length           Binary memory dump
    exe[cute] address             Call function address
    reset64 address               RMR request for AArch64 warm boot
    readl address                 Read 32-bit value from device memory
    writel address value          Write 32-bit value to device memory
    read address length file      Write memory contents into file
    write address file            Store file contents into memory
    write-with-progress addr file \"write\" with progress bar
    write-with-gauge addr file    Output progress for \"dialog --gauge\"
    write-with-xgauge addr file   Extended gauge output (updates prompt)
    multi[write] # addr file ...  \"write-with-progress\" multiple files,
                                  sharing a common progress status
    multi[write]-with-gauge ...   Like their \"write-with-*\" counterpart,
    multi[write]-with-xgauge ...    but following the 'multi' syntax:
                                    <#> addr file [addr file [...]]
    echo-gauge \"some text\"        Update prompt/caption for gauge output
    ver[sion]                     Show BROM version
    sid                           Retrieve and output 128-bit SID key
    clear address length          Clear memory
    fill address length value     Fill memory
";

/// Allwinner FEL device manipulation tool.
#[derive(Parser, Debug)]
#[command(name = "sunxi-fel", version, after_help = COMMANDS_HELP)]
struct Args {
    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// "write" transfers show a progress bar
    #[arg(short, long)]
    progress: bool,

    /// Use a specific USB bus and device number
    #[arg(short, long, value_name = "BUS:DEVNUM", value_parser = parse_dev)]
    dev: Option<(u8, u8)>,

    /// Commands and their arguments, executed left to right
    #[arg(trailing_var_arg = true, value_name = "COMMAND")]
    commands: Vec<String>,
}

fn parse_dev(arg: &str) -> Result<(u8, u8), String> {
    let mut parts = arg.splitn(2, ':');
    let bus = parts.next().and_then(|p| p.parse::<u8>().ok());
    let devnum = parts.next().and_then(|p| p.parse::<u8>().ok());
    match (bus, devnum) {
        (Some(bus), Some(devnum)) if bus > 0 && devnum > 0 => Ok((bus, devnum)),
        _ => Err(format!("expected 'bus:devnum', got '{}'", arg)),
    }
}

fn main() {
    let args = Args::parse();
    env_logger::Builder::new()
        .filter_level(if args.verbose {
            LevelFilter::Info
        } else {
            LevelFilter::Warn
        })
        .format_timestamp(None)
        .init();

    if args.commands.is_empty() {
        let _ = Args::command().print_help();
        return;
    }

    if let Err(e) = run(&args) {
        eprintln!("ERROR: {}", e);
        for cause in e.iter_chain().skip(1) {
            eprintln!("  caused by: {}", cause);
        }
        process::exit(exit_code(&e));
    }
}

/// Maps an error chain to the process exit code: USB-layer failures
/// (transfer errors, bad `AWUS` framing) exit with 2, everything else with 1.
fn exit_code(error: &Error) -> i32 {
    for cause in error.iter_chain() {
        if let Some(fel_error) = cause.downcast_ref::<FelError>() {
            match *fel_error {
                FelError::UsbTransfer { .. } | FelError::Response { .. } => return 2,
                _ => {}
            }
        }
    }
    1
}

fn run(args: &Args) -> Result<(), Error> {
    let fel = Fel::new()?;
    if let Some((bus, devnum)) = args.dev {
        info!("selecting USB bus {:03} device {:03}", bus, devnum);
    }
    let handle = fel.open_device(args.dev)?;

    let mut autostart = false;
    let cmds = &args.commands;
    let mut i = 0;
    while i < cmds.len() {
        let cmd = cmds[i].as_str();
        match cmd {
            "readl" => {
                let addr = num_arg(cmds, i, 1, cmd)?;
                println!("{:#010x}", handle.readl(addr)?);
                i += 2;
            }
            "writel" => {
                let addr = num_arg(cmds, i, 1, cmd)?;
                let val = num_arg(cmds, i, 2, cmd)?;
                handle.writel(addr, val)?;
                i += 3;
            }
            "dump" => {
                let addr = num_arg(cmds, i, 1, cmd)?;
                let len = num_arg(cmds, i, 2, cmd)?;
                let mut buf = vec![0_u8; len as usize];
                handle.fel_read(addr, &mut buf)?;
                io::stdout()
                    .write_all(&buf)
                    .context("unable to write to stdout")?;
                i += 3;
            }
            "reset64" => {
                let addr = num_arg(cmds, i, 1, cmd)?;
                handle.rmr_request(addr, true)?;
                // Cancel U-Boot autostart, and stop processing commands.
                autostart = false;
                break;
            }
            "sid" => {
                match handle.read_sid()? {
                    Some(sid) => {
                        println!("{:08x}:{:08x}:{:08x}:{:08x}", sid[0], sid[1], sid[2], sid[3])
                    }
                    None => println!(
                        "SID registers for your SoC (id={:04x}) are unknown or inaccessible.",
                        handle.get_version_info().get_id()
                    ),
                }
                i += 1;
            }
            "read" => {
                let addr = num_arg(cmds, i, 1, cmd)?;
                let len = num_arg(cmds, i, 2, cmd)?;
                let filename = str_arg(cmds, i, 3, cmd)?;
                let mut buf = vec![0_u8; len as usize];
                handle.fel_read(addr, &mut buf)?;
                fs::write(filename, &buf)
                    .with_context(|_| format!("unable to write file '{}'", filename))?;
                i += 4;
            }
            "write" => {
                let style = if args.progress {
                    Some(ProgressStyle::Bar)
                } else {
                    None
                };
                file_upload(&handle, 1, &cmds[i + 1..], style)?;
                i += 3;
            }
            "write-with-progress" => {
                file_upload(&handle, 1, &cmds[i + 1..], Some(ProgressStyle::Bar))?;
                i += 3;
            }
            "write-with-gauge" => {
                file_upload(&handle, 1, &cmds[i + 1..], Some(ProgressStyle::Gauge))?;
                i += 3;
            }
            "write-with-xgauge" => {
                file_upload(&handle, 1, &cmds[i + 1..], Some(ProgressStyle::XGauge))?;
                i += 3;
            }
            "multiwrite" | "multi" => {
                let count = num_arg(cmds, i, 1, cmd)? as usize;
                file_upload(&handle, count, &cmds[i + 2..], Some(ProgressStyle::Bar))?;
                i += 2 + 2 * count;
            }
            "multiwrite-with-gauge" | "multi-with-gauge" => {
                let count = num_arg(cmds, i, 1, cmd)? as usize;
                file_upload(&handle, count, &cmds[i + 2..], Some(ProgressStyle::Gauge))?;
                i += 2 + 2 * count;
            }
            "multiwrite-with-xgauge" | "multi-with-xgauge" => {
                let count = num_arg(cmds, i, 1, cmd)? as usize;
                file_upload(&handle, count, &cmds[i + 2..], Some(ProgressStyle::XGauge))?;
                i += 2 + 2 * count;
            }
            "echo-gauge" => {
                echo_gauge(str_arg(cmds, i, 1, cmd)?);
                i += 2;
            }
            "clear" => {
                let addr = num_arg(cmds, i, 1, cmd)?;
                let len = num_arg(cmds, i, 2, cmd)?;
                handle.fel_fill(addr, len, 0)?;
                i += 3;
            }
            "fill" => {
                let addr = num_arg(cmds, i, 1, cmd)?;
                let len = num_arg(cmds, i, 2, cmd)?;
                let val = num_arg(cmds, i, 3, cmd)?;
                handle.fel_fill(addr, len, val as u8)?;
                i += 4;
            }
            "spl" => {
                let filename = str_arg(cmds, i, 1, cmd)?;
                let buf = load_file(filename)?;
                handle.process_spl_and_uboot(&buf)?;
                i += 2;
            }
            "uboot" => {
                let filename = str_arg(cmds, i, 1, cmd)?;
                let buf = load_file(filename)?;
                handle.process_spl_and_uboot(&buf)?;
                autostart = handle.uboot_region().is_some();
                if !autostart {
                    println!(
                        "Warning: \"uboot\" command failed to detect image! Can't execute U-Boot."
                    );
                }
                i += 2;
            }
            _ if cmd.starts_with("hex") => {
                let addr = num_arg(cmds, i, 1, cmd)?;
                let len = num_arg(cmds, i, 2, cmd)?;
                let mut buf = vec![0_u8; len as usize];
                handle.fel_read(addr, &mut buf)?;
                hexdump(&buf, addr);
                i += 3;
            }
            _ if cmd.starts_with("exe") => {
                let addr = num_arg(cmds, i, 1, cmd)?;
                handle.fel_execute(addr)?;
                i += 2;
            }
            _ if cmd.starts_with("ver") => {
                println!("{}", handle.get_version_info());
                i += 1;
            }
            _ => bail!("invalid command '{}'", cmd),
        }
    }

    // Auto-start U-Boot if requested (by the "uboot" command).
    if autostart {
        if let Some((entry, _)) = handle.uboot_region() {
            info!("starting U-Boot ({:#010x})", entry);
            handle.fel_execute(entry)?;
        }
    }

    Ok(())
}

/// Uploads `count` files given as `addr file` argument pairs, sharing one
/// progress total. Script and `uEnv.txt` style uploads additionally pass
/// their location to U-Boot through the sunxi SPL header.
fn file_upload<T: UsbTransport>(
    handle: &FelHandle<T>,
    count: usize,
    args: &[String],
    style: Option<ProgressStyle>,
) -> Result<(), Error> {
    if args.len() < count * 2 {
        bail!("too few arguments for uploading {} file(s)", count);
    }

    // Get all file sizes first, to track a shared total.
    let mut total = 0_usize;
    for n in 0..count {
        let filename = &args[n * 2 + 1];
        let metadata = fs::metadata(filename)
            .with_context(|_| format!("unable to stat file '{}'", filename))?;
        if !metadata.is_file() {
            bail!("'{}' is not a regular file", filename);
        }
        total += metadata.len() as usize;
    }
    if let Some(style) = style {
        handle.set_progress(Some(Progress::start(style, total)));
    }

    // Now transfer each file in turn.
    for n in 0..count {
        let offset = maybe_hex::<u32>(&args[n * 2])
            .map_err(|e| format_err!("invalid address '{}': {}", args[n * 2], e))?;
        let buf = load_file(&args[n * 2 + 1])?;
        if buf.is_empty() {
            continue;
        }
        handle.write_buffer(offset, &buf, style.is_some())?;

        // If we transferred a script or uEnv-style data, try to inform U-Boot
        // about its address.
        if image::image_type(&buf) == ImageType::Type(image::IH_TYPE_SCRIPT) {
            handle.pass_fel_information(offset, 0)?;
        }
        if image::is_uenv(&buf) {
            handle.pass_fel_information(offset, buf.len() as u32)?;
        }
    }

    handle.set_progress(None);
    Ok(())
}

fn load_file(filename: &str) -> Result<Vec<u8>, Error> {
    Ok(fs::read(filename).with_context(|_| format!("unable to read file '{}'", filename))?)
}

fn str_arg<'a>(cmds: &'a [String], i: usize, n: usize, cmd: &str) -> Result<&'a str, Error> {
    cmds.get(i + n)
        .map(String::as_str)
        .ok_or_else(|| format_err!("missing argument {} for command '{}'", n, cmd))
}

fn num_arg(cmds: &[String], i: usize, n: usize, cmd: &str) -> Result<u32, Error> {
    let arg = str_arg(cmds, i, n, cmd)?;
    maybe_hex::<u32>(arg)
        .map_err(|e| format_err!("invalid numeric argument '{}' for '{}': {}", arg, cmd, e))
}

/// Prints a memory region like the classic `hexdump -C`, padding cells past
/// the end of the buffer with `__` and `.`.
fn hexdump(buf: &[u8], offset: u32) {
    let mut j = 0;
    while j < buf.len() {
        let mut line = format!("{:08x}: ", offset as usize + j);
        for i in 0..16 {
            if j + i < buf.len() {
                line.push_str(&format!("{:02x} ", buf[j + i]));
            } else {
                line.push_str("__ ");
            }
        }
        line.push(' ');
        for i in 0..16 {
            if j + i >= buf.len() {
                line.push('.');
            } else {
                let byte = buf[j + i];
                line.push(if byte.is_ascii_graphic() || byte == b' ' {
                    char::from(byte)
                } else {
                    '.'
                });
            }
        }
        println!("{}", line);
        j += 16;
    }
}
