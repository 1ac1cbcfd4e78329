//! Kernel-backed integration tests. These need a kernel with io_uring support (5.1+); on
//! older kernels every test that would touch the ring skips itself.

#![cfg(target_os = "linux")]

use std::collections::HashSet;
use std::io::{Read, Seek, SeekFrom, Write};

use linux_iou::{
    ClaimError, EnterFlags, PinnedBuffer, Ring, RingFile, SetupError,
};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Create a ring, or skip the test on kernels without io_uring.
fn ring_or_skip(entries: u32) -> Option<Ring> {
    match Ring::new(entries) {
        Ok(ring) => Some(ring),
        Err(SetupError::Setup(ref err))
            if err.raw_os_error() == Some(libc::ENOSYS)
                || err.raw_os_error() == Some(libc::EPERM) =>
        {
            eprintln!("kernel does not support io_uring, skipping");
            None
        }
        Err(err) => panic!("failed to create ring: {}", err),
    }
}

#[test]
fn setup_reports_negotiated_geometry() {
    init_logger();
    let ring = match ring_or_skip(2048) {
        Some(ring) => ring,
        None => return,
    };

    assert!(ring.fd() >= 0);
    assert_eq!(ring.sq_capacity(), 2048);
    assert!(ring.cq_capacity() >= 2048);

    assert_eq!(ring.submit_head(), Some(0));
    assert_eq!(ring.submit_tail(), Some(0));
    assert_eq!(ring.complete_head(), Some(0));
    assert_eq!(ring.complete_tail(), Some(0));
    assert_eq!(ring.sq_dropped(), Some(0));
    assert_eq!(ring.cq_overflow(), Some(0));

    ring.close().expect("teardown failed");
    assert_eq!(ring.fd(), -1);
}

#[test]
fn unsupported_capacity_is_rejected_without_leaking() {
    init_logger();
    match Ring::new(99999) {
        Err(SetupError::InvalidEntryCount(99999)) => {}
        other => panic!("expected InvalidEntryCount, got {:?}", other.map(|_| ())),
    }
    match Ring::new(0) {
        Err(SetupError::InvalidEntryCount(0)) => {}
        other => panic!("expected InvalidEntryCount, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn nop_batch_yields_every_tag() {
    init_logger();
    let ring = match ring_or_skip(8) {
        Some(ring) => ring,
        None => return,
    };

    for tag in 0..8u64 {
        let mut slot = ring.claim_slot().expect("ring has capacity for 8");
        slot.prep_nop(tag);
        slot.commit();
    }

    let accepted = ring
        .enter(8, 8, EnterFlags::GETEVENTS)
        .expect("enter failed");
    assert_eq!(accepted, 8);

    let completions: Vec<_> = ring.drain().unwrap().collect();
    assert_eq!(completions.len(), 8);

    let tags: HashSet<u64> = completions.iter().map(|c| c.user_data).collect();
    assert_eq!(tags, (0..8u64).collect::<HashSet<u64>>());
    for completion in &completions {
        assert!(completion.result >= 0, "nop failed: {:?}", completion);
    }

    ring.close().unwrap();
}

#[test]
fn claims_beyond_capacity_report_full() {
    init_logger();
    let ring = match ring_or_skip(8) {
        Some(ring) => ring,
        None => return,
    };

    let mut slots = Vec::new();
    for _ in 0..8 {
        slots.push(ring.claim_slot().expect("within capacity"));
    }
    match ring.claim_slot() {
        Err(ClaimError::Full) => {}
        Ok(_) => panic!("ninth claim on an 8-entry ring succeeded"),
        Err(err) => panic!("expected Full, got {}", err),
    }

    // The earlier claims are unaffected: fill, commit, and reap all of them.
    for (tag, slot) in slots.iter_mut().enumerate() {
        slot.prep_nop(tag as u64);
    }
    drop(slots);

    ring.enter(8, 8, EnterFlags::GETEVENTS).unwrap();
    assert_eq!(ring.drain().unwrap().count(), 8);

    ring.close().unwrap();
}

#[test]
fn write_fixed_round_trips_registered_bytes() {
    init_logger();
    let ring = match ring_or_skip(8) {
        Some(ring) => ring,
        None => return,
    };

    let mut buffer = PinnedBuffer::zeroed(100);
    for (i, byte) in buffer.as_mut_slice().iter_mut().enumerate() {
        *byte = i as u8;
    }
    let expected = buffer.as_slice().to_vec();
    ring.register_buffers(vec![buffer])
        .expect("buffer registration failed");

    let mut file = tempfile::tempfile().unwrap();
    let (addr, len) = ring.fixed_buffer(0).unwrap();
    assert_eq!(len, 100);

    let tag = ring.id();
    {
        use std::os::unix::io::AsRawFd;
        let mut slot = ring.claim_slot().unwrap();
        // The region is pinned by the ring for its whole lifetime.
        unsafe {
            slot.prep_write_fixed(file.as_raw_fd(), addr, 100, 0, 0, tag);
        }
        slot.commit();
    }

    ring.enter(1, 1, EnterFlags::GETEVENTS).unwrap();
    let completion = ring.wait_for(tag).unwrap();
    assert_eq!(completion.io_result().unwrap(), 100);

    let mut written = Vec::new();
    file.seek(SeekFrom::Start(0)).unwrap();
    file.read_to_end(&mut written).unwrap();
    assert_eq!(written, expected);

    ring.close().unwrap();
}

#[test]
fn read_fixed_fills_registered_buffer() {
    init_logger();
    let ring = match ring_or_skip(8) {
        Some(ring) => ring,
        None => return,
    };

    let mut file = tempfile::tempfile().unwrap();
    file.write_all(b"fixed buffer payload").unwrap();

    ring.register_buffers(vec![PinnedBuffer::zeroed(64)]).unwrap();
    let (addr, _) = ring.fixed_buffer(0).unwrap();

    let tag = ring.id();
    {
        use std::os::unix::io::AsRawFd;
        let mut slot = ring.claim_slot().unwrap();
        unsafe {
            slot.prep_read_fixed(file.as_raw_fd(), addr, 20, 0, 0, tag);
        }
        slot.commit();
    }

    ring.enter(1, 1, EnterFlags::GETEVENTS).unwrap();
    let completion = ring.wait_for(tag).unwrap();
    assert_eq!(completion.io_result().unwrap(), 20);

    ring.with_fixed_buffer(0, |bytes| {
        assert_eq!(&bytes[..20], b"fixed buffer payload");
    })
    .unwrap();

    ring.close().unwrap();
}

#[test]
fn wait_for_parks_unrelated_completions() {
    init_logger();
    let ring = match ring_or_skip(8) {
        Some(ring) => ring,
        None => return,
    };

    for tag in [10u64, 11, 12].iter() {
        let mut slot = ring.claim_slot().unwrap();
        slot.prep_nop(*tag);
        slot.commit();
    }
    ring.enter(3, 3, EnterFlags::GETEVENTS).unwrap();

    // Waiting for the last tag forces the other completions to be parked, not dropped.
    let completion = ring.wait_for(12).unwrap();
    assert_eq!(completion.user_data, 12);

    let leftover: HashSet<u64> = ring.drain().unwrap().map(|c| c.user_data).collect();
    assert_eq!(leftover, vec![10u64, 11].into_iter().collect());

    ring.close().unwrap();
}

#[test]
fn registering_a_file_twice_returns_the_same_index() {
    init_logger();
    let ring = match ring_or_skip(8) {
        Some(ring) => ring,
        None => return,
    };

    use std::os::unix::io::AsRawFd;
    let file = tempfile::tempfile().unwrap();
    let other = tempfile::tempfile().unwrap();

    let first = ring.register_file(file.as_raw_fd()).unwrap();
    let second = ring.register_file(other.as_raw_fd()).unwrap();
    assert_ne!(first, second);
    assert_eq!(ring.register_file(file.as_raw_fd()).unwrap(), first);

    ring.close().unwrap();
}

#[test]
fn file_adapter_round_trips() {
    init_logger();
    let ring = match ring_or_skip(8) {
        Some(ring) => ring,
        None => return,
    };

    let file = tempfile::tempfile().unwrap();
    let mut ring_file = RingFile::new(&ring, file).expect("file registration failed");

    assert_eq!(ring_file.write(b"hello ring world").unwrap(), 16);
    assert_eq!(ring_file.position(), 16);
    ring_file.flush().unwrap();

    ring_file.seek(SeekFrom::Start(0)).unwrap();
    let mut readback = [0u8; 16];
    ring_file.read_exact(&mut readback).unwrap();
    assert_eq!(&readback, b"hello ring world");

    assert_eq!(ring_file.seek(SeekFrom::End(-5)).unwrap(), 11);
    let mut tail = [0u8; 5];
    ring_file.read_exact(&mut tail).unwrap();
    assert_eq!(&tail, b"world");

    ring_file.close();
    ring.close().unwrap();
}

#[test]
fn closed_ring_reports_errors_instead_of_crashing() {
    init_logger();
    let ring = match ring_or_skip(8) {
        Some(ring) => ring,
        None => return,
    };

    ring.close().unwrap();

    match ring.claim_slot() {
        Err(ClaimError::Closed) => {}
        Ok(_) => panic!("claim succeeded on a closed ring"),
        Err(err) => panic!("expected Closed, got {}", err),
    }
    assert!(ring.enter(0, 0, EnterFlags::empty()).is_err());
    assert!(ring.drain().is_err());
    assert!(ring.register_file(0).is_err());
    assert_eq!(ring.submit_head(), None);

    // Idempotent.
    ring.close().unwrap();
}
