//! SPSC ring round-trip under concurrency: a writer thread streams framed
//! messages through a small ring while a reader drains and verifies them.

use std::time::Duration;

use seqlink::ring::{Reclaim, Ring, RingConfig, Topology, WaitStrategy};

const RING_SIZE: usize = 8192;
const MSG_LEN: usize = 128;
// 128-byte payloads frame to 136 bytes; 1024 frames are an exact number of
// ring revolutions, so the final offsets land back on the initial ones.
const MSG_COUNT: u64 = 1024;

fn config(mirror: bool) -> RingConfig {
    RingConfig {
        name: None,
        size: RING_SIZE,
        topology: Topology::Spsc,
        mirror,
        reclaim: Reclaim::Lenient,
        wait: WaitStrategy::SpinThenPark { spin: 256 },
    }
}

fn pattern(index: u64) -> Vec<u8> {
    let mut payload = vec![0u8; MSG_LEN];
    payload[..8].copy_from_slice(&index.to_le_bytes());
    for (offset, byte) in payload.iter_mut().enumerate().skip(8) {
        *byte = (index as usize + offset) as u8;
    }
    payload
}

fn round_trip(mirror: bool) {
    let _ = env_logger::builder().is_test(true).try_init();
    let ring = Ring::open(config(mirror)).expect("open ring");
    let mut reader = ring.attach().expect("attach");
    let initial = ring.stats();

    let writer_ring = ring.clone();
    let writer_thread = std::thread::spawn(move || {
        let mut writer = writer_ring.writer().expect("writer");
        for index in 0..MSG_COUNT {
            writer
                .push_bytes(&pattern(index), Some(Duration::from_secs(10)))
                .expect("push");
        }
    });

    for index in 0..MSG_COUNT {
        reader
            .recv(Some(Duration::from_secs(10)), |payload| {
                assert_eq!(payload, &pattern(index)[..], "corrupt message {index}");
            })
            .expect("recv");
    }
    writer_thread.join().expect("writer thread");

    // No further data; head and tail meet again.
    assert!(reader.shift().expect("drained").is_none());
    let end = ring.stats();
    assert_eq!(end.head, end.tail);
    if mirror {
        // Frames are an exact number of revolutions, so the control words
        // return to their initial offsets modulo the ring size. (With wrap
        // records the fillers perturb the offsets.)
        assert_eq!(end.tail % RING_SIZE as u64, initial.tail % RING_SIZE as u64);
        assert_eq!(end.head % RING_SIZE as u64, initial.head % RING_SIZE as u64);
    }
}

#[test]
fn spsc_round_trip_mirrored() {
    round_trip(true);
}

#[test]
fn spsc_round_trip_wrap_records() {
    round_trip(false);
}

#[test]
fn eof_ends_the_stream_after_drain() {
    let ring = Ring::open(config(true)).expect("open ring");
    let mut reader = ring.attach().expect("attach");
    let writer_ring = ring.clone();

    let writer_thread = std::thread::spawn(move || {
        let mut writer = writer_ring.writer().expect("writer");
        for index in 0..10u64 {
            writer
                .push_bytes(&pattern(index), Some(Duration::from_secs(10)))
                .expect("push");
        }
        writer_ring.eof(true).expect("eof");
    });

    let mut seen = 0u64;
    loop {
        match reader.recv(Some(Duration::from_secs(10)), |payload| {
            assert_eq!(payload, &pattern(seen)[..]);
        }) {
            Ok(()) => seen += 1,
            Err(seqlink::Error::EndOfFile) => break,
            Err(err) => panic!("unexpected error: {err}"),
        }
    }
    assert_eq!(seen, 10);
    writer_thread.join().expect("writer thread");
}
