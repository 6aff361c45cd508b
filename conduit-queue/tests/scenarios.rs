//! End-to-end producer/consumer scenarios across real threads.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use conduit_queue::mpsc::{self, TryRecvError};
use conduit_queue::spsc::{self, Full};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

#[test]
fn ring_buffer_keeps_one_slot_free() {
    init_tracing();

    let (mut tx, mut rx) = spsc::ring_buffer::<u32>(8);

    for i in 0..7 {
        assert!(tx.push(i).is_ok(), "push {i} should fit");
    }
    assert_eq!(tx.push(7), Err(Full(7)));

    assert_eq!(rx.pop(), Some(0));
    assert!(tx.push(7).is_ok());

    let rest: Vec<_> = std::iter::from_fn(|| rx.pop()).collect();
    assert_eq!(rest, (1..8).collect::<Vec<_>>());
}

#[test]
fn ring_buffer_ping_pong() {
    init_tracing();

    const ROUNDS: u64 = 10_000;

    let (mut fwd_tx, mut fwd_rx) = spsc::ring_buffer::<u64>(4);
    let (mut ret_tx, mut ret_rx) = spsc::ring_buffer::<u64>(4);

    let echo = thread::spawn(move || {
        for _ in 0..ROUNDS {
            let v = loop {
                if let Some(v) = fwd_rx.pop() {
                    break v;
                }
                thread::yield_now();
            };
            while ret_tx.push(v + 1).is_err() {
                thread::yield_now();
            }
        }
    });

    for i in 0..ROUNDS {
        while fwd_tx.push(i).is_err() {
            thread::yield_now();
        }
        let back = loop {
            if let Some(v) = ret_rx.pop() {
                break v;
            }
            thread::yield_now();
        };
        assert_eq!(back, i + 1);
    }

    echo.join().unwrap();
}

#[test]
fn two_tagged_producers_drain_to_two_thousand() {
    init_tracing();

    const PER_PRODUCER: u32 = 1000;

    let (tx, mut rx) = mpsc::unbounded::<u32>();
    let done = Arc::new(AtomicUsize::new(0));

    let producers: Vec<_> = (0..2u32)
        .map(|tag| {
            let tx = tx.clone();
            let done = Arc::clone(&done);
            thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    tx.push((tag << 16) | i);
                }
                done.fetch_add(1, Ordering::Release);
            })
        })
        .collect();
    drop(tx);

    let mut per_tag: [Vec<u32>; 2] = [Vec::new(), Vec::new()];
    loop {
        match rx.pop() {
            Some(v) => per_tag[(v >> 16) as usize].push(v & 0xFFFF),
            None if done.load(Ordering::Acquire) == 2 && rx.is_empty() => break,
            None => thread::yield_now(),
        }
    }

    for p in producers {
        p.join().unwrap();
    }

    assert_eq!(per_tag[0].len() + per_tag[1].len(), 2000);
    for seq in &per_tag {
        assert!(seq.windows(2).all(|w| w[0] < w[1]), "subsequence not monotonic");
    }
    assert_eq!(rx.try_recv(), Err(TryRecvError::Disconnected));
}

#[test]
fn interleaved_producers_no_loss_no_duplication() {
    init_tracing();

    const PRODUCERS: usize = 8;
    const PER_PRODUCER: usize = 5_000;

    let (tx, mut rx) = mpsc::unbounded::<usize>();

    let handles: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let tx = tx.clone();
            thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    tx.push(p * PER_PRODUCER + i);
                    if i % 64 == 0 {
                        thread::yield_now();
                    }
                }
            })
        })
        .collect();
    drop(tx);

    let mut seen = vec![false; PRODUCERS * PER_PRODUCER];
    loop {
        match rx.try_recv() {
            Ok(v) => {
                assert!(!seen[v], "duplicate {v}");
                seen[v] = true;
            }
            Err(TryRecvError::Empty) => thread::yield_now(),
            Err(TryRecvError::Disconnected) => break,
        }
    }

    for h in handles {
        h.join().unwrap();
    }
    assert!(seen.iter().all(|&s| s), "lost elements");
}
