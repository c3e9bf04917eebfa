//! Protocol-level tests against the emulated FEL device: version probing,
//! raw memory transfers, thunked word access and its chunking boundaries,
//! the SID read, the RMR request, and the U-Boot overwrite guard.

mod common;

use common::{make_mkimage, Event, MockFelDevice};
use sunxi_fel::{FelError, FelHandle};

#[test]
fn version_probe_decodes_soc_id() {
    let mock = MockFelDevice::new(0x1623);
    let handle = FelHandle::from_transport(&mock).unwrap();

    assert_eq!(handle.get_version_info().get_id(), 0x1623);
    let printed = handle.get_version_info().to_string();
    assert!(
        printed.starts_with("AWUSBFEX soc=00001623(A10) "),
        "unexpected version line: {}",
        printed
    );
    assert_eq!(mock.events(), vec![Event::Version]);
}

#[test]
fn unknown_soc_is_soft_for_version_only() {
    let mock = MockFelDevice::new(0x9999);
    let handle = FelHandle::from_transport(&mock).unwrap();

    // The version reply is available...
    assert_eq!(handle.get_version_info().get_id(), 0x9999);
    // ...but operations that need the SoC record fail.
    assert!(handle.get_soc_info().is_err());
    assert!(handle.readl(0x1000).is_err());
}

#[test]
fn fel_write_read_round_trip() {
    let mock = MockFelDevice::new(0x1623);
    let handle = FelHandle::from_transport(&mock).unwrap();

    let data: Vec<u8> = (0..321_u32).map(|i| (i * 7) as u8).collect();
    handle.write_buffer(0x4200_0000, &data, false).unwrap();

    let mut readback = vec![0_u8; data.len()];
    handle.fel_read(0x4200_0000, &mut readback).unwrap();
    assert_eq!(readback, data);
}

#[test]
fn readl_uses_a_48_byte_thunk_at_the_scratch_area() {
    let mock = MockFelDevice::new(0x1623);
    let handle = FelHandle::from_transport(&mock).unwrap();
    mock.write_mem(0x4000_0000, &0xCAFE_BABE_u32.to_le_bytes());
    mock.clear_events();

    assert_eq!(handle.readl(0x4000_0000).unwrap(), 0xCAFE_BABE);

    // A10 scratch area is at 0x1000: 12 instruction words uploaded, executed,
    // and 4 result bytes read back from right after the code.
    assert_eq!(
        mock.events(),
        vec![
            Event::FelWrite {
                addr: 0x1000,
                len: 48
            },
            Event::Exec { addr: 0x1000 },
            Event::FelRead {
                addr: 0x1000 + 48,
                len: 4
            },
        ]
    );
}

#[test]
fn writel_readl_round_trip() {
    let mock = MockFelDevice::new(0x1623);
    let handle = FelHandle::from_transport(&mock).unwrap();

    handle.writel(0x01C2_0000, 0x1234_5678).unwrap();
    assert_eq!(handle.readl(0x01C2_0000).unwrap(), 0x1234_5678);
}

#[test]
fn word_transfer_chunking_boundaries() {
    let mock = MockFelDevice::new(0x1623);
    let handle = FelHandle::from_transport(&mock).unwrap();

    // 0 words: a no-op, no USB traffic at all.
    mock.clear_events();
    handle.read_words(0x4000_0000, &mut []).unwrap();
    assert!(mock.events().is_empty());

    // 1 word and 244 words (the exact cap): one round trip each.
    mock.clear_events();
    handle.read_words(0x4000_0000, &mut [0_u32; 1]).unwrap();
    assert_eq!(mock.exec_count(), 1);
    mock.clear_events();
    handle.read_words(0x4000_0000, &mut [0_u32; 244]).unwrap();
    assert_eq!(mock.exec_count(), 1);

    // 245 words: the wrapper splits into two rounds.
    mock.clear_events();
    handle.read_words(0x4000_0000, &mut [0_u32; 245]).unwrap();
    assert_eq!(mock.exec_count(), 2);

    // Many chunks: ceil(10000 / 244) = 41 rounds.
    mock.clear_events();
    let mut big = vec![0_u32; 10000];
    handle.read_words(0x4000_0000, &mut big).unwrap();
    assert_eq!(mock.exec_count(), 41);
}

#[test]
fn chunked_writes_land_at_advancing_addresses() {
    let mock = MockFelDevice::new(0x1623);
    let handle = FelHandle::from_transport(&mock).unwrap();

    let words: Vec<u32> = (0..500).collect();
    handle.write_words(0x4000_0000, &words).unwrap();

    for (i, &word) in words.iter().enumerate() {
        assert_eq!(
            mock.read_mem_word(0x4000_0000 + (i as u32) * 4),
            word,
            "word {} corrupted",
            i
        );
    }
}

#[test]
fn sid_is_read_through_the_word_thunk() {
    let mock = MockFelDevice::new(0x1623);
    let handle = FelHandle::from_transport(&mock).unwrap();
    // A10 SID registers live at 0x01C23800.
    for (i, word) in [0x0162_3000_u32, 0x5555_AAAA, 0x0BAD_F00D, 0x0000_0042]
        .iter()
        .enumerate()
    {
        mock.write_mem(0x01C2_3800 + (i as u32) * 4, &word.to_le_bytes());
    }

    assert_eq!(
        handle.read_sid().unwrap(),
        Some([0x0162_3000, 0x5555_AAAA, 0x0BAD_F00D, 0x0000_0042])
    );
}

#[test]
fn rmr_request_is_skipped_without_rvbar() {
    // A10 has no known RVBAR address.
    let mock = MockFelDevice::new(0x1623);
    let handle = FelHandle::from_transport(&mock).unwrap();
    mock.clear_events();

    handle.rmr_request(0x4400_0000, true).unwrap();
    assert_eq!(mock.exec_count(), 0);
    assert_eq!(mock.rmr_request(), None);
}

#[test]
fn rmr_request_programs_rvbar_and_requests_aarch64() {
    // A64 supports the RVBAR warm reset.
    let mock = MockFelDevice::new(0x1689);
    let handle = FelHandle::from_transport(&mock).unwrap();

    handle.rmr_request(0x4400_0000, true).unwrap();
    // RR bit plus the AA64 flag.
    assert_eq!(mock.rmr_request(), Some((0x0170_00A0, 0x4400_0000, 3)));
}

#[test]
fn overwrite_guard_fires_before_any_usb_transfer() {
    let mock = MockFelDevice::new(0x1623);
    let handle = FelHandle::from_transport(&mock).unwrap();

    // Upload a U-Boot image: load address 0x4A000000, 0x80000 data bytes.
    let image = make_mkimage(&vec![0xA5_u8; 0x80000], 0x4A00_0000, 0x05);
    let (entry, size) = handle.write_uboot_image(&image).unwrap();
    assert_eq!((entry, size), (0x4A00_0000, 0x80000));
    assert_eq!(handle.uboot_region(), Some((0x4A00_0000, 0x80000)));

    // A write inside the recorded region must fail without touching the USB.
    let transfers_before = mock.transfer_count();
    let result = handle.write_buffer(0x4A04_0000, &[0_u8; 16], false);
    let error = result.unwrap_err();
    let guard_error = error
        .iter_chain()
        .filter_map(|cause| cause.downcast_ref::<FelError>())
        .next()
        .expect("expected a FelError in the chain");
    assert!(matches!(guard_error, FelError::UbootOverwrite { .. }));
    assert_eq!(mock.transfer_count(), transfers_before);

    // Writes clear of the region still work.
    handle.write_buffer(0x4B00_0000, &[0_u8; 16], false).unwrap();
}
