//! Thread demonstrations, selected with `--tt <n>`.
//!
//! These are the classic classroom exercises: a yield storm, a bounded
//! buffer over a condition variable, rendezvous channels with unbalanced
//! senders and receivers, and the priority-inversion scenario that priority
//! donation exists to solve.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rios::sync::{Channel, Condition, Lock};
use rios::thread::scheduler::MAX_PRIORITY;
use rios::thread::{Current, ThreadBuilder};

pub fn run(which: usize) -> Result<(), String> {
    match which {
        0 => simple(),
        1 => producer_consumer(),
        2 => channels(),
        3 => priority_inversion(),
        other => return Err(format!("no thread test {other}")),
    }
    Ok(())
}

/// A handful of threads counting and yielding at each other.
fn simple() {
    let handles: Vec<_> = (0..5)
        .map(|i| {
            ThreadBuilder::new(format!("simple-{i}")).spawn(move || {
                for round in 0..4 {
                    mirage::println!("thread {} round {}", i, round);
                    Current::yield_now();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join();
    }
}

/// Producers and consumers over a bounded buffer.
fn producer_consumer() {
    const ITEMS: usize = 40;
    const CAPACITY: usize = 4;
    let buffer = Arc::new(Lock::new("buffer", VecDeque::new()));
    let not_empty = Arc::new(Condition::new("not-empty"));
    let not_full = Arc::new(Condition::new("not-full"));

    let producer = {
        let (buffer, not_empty, not_full) = (buffer.clone(), not_empty.clone(), not_full.clone());
        ThreadBuilder::new("producer").spawn(move || {
            for item in 0..ITEMS {
                let mut guard = not_full.wait_while(&buffer, |q| q.len() == CAPACITY);
                guard.push_back(item);
                drop(guard);
                not_empty.signal();
            }
        })
    };

    let consumer = {
        let (buffer, not_empty, not_full) = (buffer, not_empty, not_full);
        ThreadBuilder::new("consumer").spawn(move || {
            for expected in 0..ITEMS {
                let mut guard = not_empty.wait_while(&buffer, |q: &mut VecDeque<usize>| q.is_empty());
                let item = guard.pop_front().unwrap();
                drop(guard);
                not_full.signal();
                assert_eq!(item, expected);
            }
            mirage::println!("consumed {} items in order", ITEMS);
        })
    };

    producer.join();
    consumer.join();
}

/// Five senders, two receivers, one channel; every message rendezvouses.
fn channels() {
    const PER_RECEIVER: usize = 10;
    let channel = Arc::new(Channel::new("demo"));
    let delivered = Arc::new(AtomicUsize::new(0));

    let receivers: Vec<_> = (0..2)
        .map(|i| {
            let (channel, delivered) = (channel.clone(), delivered.clone());
            ThreadBuilder::new(format!("receiver-{i}")).spawn(move || {
                for _ in 0..PER_RECEIVER {
                    let value = channel.receive();
                    mirage::println!("receiver {} got {}", i, value);
                    delivered.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();

    for i in 0..5 {
        let channel = channel.clone();
        ThreadBuilder::new(format!("sender-{i}")).spawn(move || {
            for n in 0..4 {
                channel.send((i * 100 + n) as i32);
            }
        });
    }

    for handle in receivers {
        handle.join();
    }
    assert_eq!(delivered.load(Ordering::SeqCst), 2 * PER_RECEIVER);
    mirage::println!("all {} messages delivered", 2 * PER_RECEIVER);
}

/// Low-priority holder, medium-priority spinners, high-priority waiter.
/// With donation the holder runs anyway and the waiter completes.
fn priority_inversion() {
    let lock = Arc::new(Lock::new("inversion", ()));
    let done = Arc::new(AtomicUsize::new(0));

    let low = {
        let (lock, done) = (lock.clone(), done.clone());
        ThreadBuilder::new("low").priority(0).spawn(move || {
            let guard = lock.acquire();
            Current::yield_now();
            drop(guard);
            done.fetch_add(1, Ordering::SeqCst);
            mirage::println!("low-priority task done");
        })
    };
    Current::yield_now();

    for i in 0..2 {
        let done = done.clone();
        ThreadBuilder::new(format!("medium-{i}"))
            .priority(3)
            .spawn(move || {
                while done.load(Ordering::SeqCst) < 2 {
                    Current::yield_now();
                }
            });
    }

    let high = {
        let (lock, done) = (lock, done.clone());
        ThreadBuilder::new("high").priority(MAX_PRIORITY).spawn(move || {
            let guard = lock.acquire();
            drop(guard);
            done.fetch_add(1, Ordering::SeqCst);
            mirage::println!("high-priority task done");
        })
    };

    high.join();
    low.join();
    mirage::println!("no inversion: both critical tasks finished");
}
