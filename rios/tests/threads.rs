//! Thread and synchronization tests, each on a freshly booted machine.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use mirage::spinlock::SpinLock;
use rios::sync::{Channel, Condition, Lock, RwLock, Semaphore};
use rios::system::{boot, BootOptions};
use rios::thread::scheduler::{set_priority_donation, MAX_PRIORITY};
use rios::thread::{Current, ThreadBuilder};

fn kernel_test(f: impl FnOnce()) {
    boot(BootOptions::default(), f);
}

/// An event log shared by the threads of one test.
#[derive(Clone)]
struct EventLog(Arc<SpinLock<Vec<&'static str>>>);

impl EventLog {
    fn new() -> Self {
        Self(Arc::new(SpinLock::new(Vec::new())))
    }

    fn push(&self, event: &'static str) {
        let mut g = self.0.lock();
        g.push(event);
        g.unlock();
    }

    fn events(&self) -> Vec<&'static str> {
        let g = self.0.lock();
        let events = g.clone();
        g.unlock();
        events
    }

    fn position(&self, event: &'static str) -> usize {
        self.events()
            .iter()
            .position(|e| *e == event)
            .unwrap_or_else(|| panic!("event {event} never happened"))
    }
}

/// Yield until `counter` reaches `target`, then a little longer so the
/// thread that bumped it reaches its blocking point. Thread startup does
/// disk I/O (pinning the working directory), so tests that need "that
/// thread is now blocked over there" wait on an explicit arrival mark
/// rather than counting yields.
fn settle(counter: &AtomicUsize, target: usize) {
    while counter.load(Ordering::SeqCst) < target {
        Current::yield_now();
    }
    for _ in 0..5 {
        Current::yield_now();
    }
}

#[test]
fn join_returns_the_exit_status() {
    kernel_test(|| {
        let ok = ThreadBuilder::new("ok").spawn(|| {});
        assert_eq!(ok.join(), 0);
        let coded = ThreadBuilder::new("coded").spawn(|| Current::exit(7));
        assert_eq!(coded.join(), 7);
    });
}

#[test]
fn semaphore_blocks_until_signaled() {
    kernel_test(|| {
        let sem = Arc::new(Semaphore::new("test", 0));
        let turns = Arc::new(AtomicUsize::new(0));
        let handle = {
            let (sem, turns) = (sem.clone(), turns.clone());
            ThreadBuilder::new("waiter").spawn(move || {
                sem.wait();
                turns.fetch_add(1, Ordering::SeqCst);
            })
        };
        // Let the waiter block.
        for _ in 0..5 {
            Current::yield_now();
        }
        assert_eq!(turns.load(Ordering::SeqCst), 0);
        sem.signal();
        assert_eq!(handle.join(), 0);
        assert_eq!(turns.load(Ordering::SeqCst), 1);
    });
}

#[test]
fn semaphore_wakes_waiters_in_blocking_order() {
    kernel_test(|| {
        let sem = Arc::new(Semaphore::new("fifo", 0));
        let log = EventLog::new();
        let arrived = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for (i, name) in ["first", "second", "third"].into_iter().enumerate() {
            let (sem, log, arrived_clone) = (sem.clone(), log.clone(), arrived.clone());
            handles.push(ThreadBuilder::new(name).spawn(move || {
                arrived_clone.fetch_add(1, Ordering::SeqCst);
                sem.wait();
                log.push(name);
            }));
            // Each waiter blocks before the next is spawned.
            settle(&arrived, i + 1);
        }
        for _ in 0..3 {
            sem.signal();
        }
        for handle in handles {
            handle.join();
        }
        assert_eq!(log.events(), vec!["first", "second", "third"]);
    });
}

#[test]
#[should_panic(expected = "re-acquired")]
fn lock_is_not_reentrant() {
    kernel_test(|| {
        let lock = Lock::new("reentrant", ());
        let _guard = lock.acquire();
        let _second = lock.acquire();
    });
}

#[test]
fn lock_serializes_a_counter() {
    kernel_test(|| {
        const THREADS: usize = 8;
        const ROUNDS: usize = 50;
        let counter = Arc::new(Lock::new("counter", 0usize));
        let handles: Vec<_> = (0..THREADS)
            .map(|i| {
                let counter = counter.clone();
                ThreadBuilder::new(format!("adder-{i}")).spawn(move || {
                    for _ in 0..ROUNDS {
                        let mut guard = counter.acquire();
                        let seen = *guard;
                        Current::yield_now();
                        *guard = seen + 1;
                        drop(guard);
                    }
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join(), 0);
        }
        let guard = counter.acquire();
        assert_eq!(*guard, THREADS * ROUNDS);
    });
}

#[test]
fn condition_wait_while_sees_the_predicate_change() {
    kernel_test(|| {
        let state = Arc::new(Lock::new("state", 0usize));
        let cond = Arc::new(Condition::new("state"));
        let handle = {
            let (state, cond) = (state.clone(), cond.clone());
            ThreadBuilder::new("waiter").spawn(move || {
                let guard = cond.wait_while(&state, |v| *v < 3);
                assert_eq!(*guard, 3);
            })
        };
        for _ in 0..3 {
            for _ in 0..3 {
                Current::yield_now();
            }
            let mut guard = state.acquire();
            *guard += 1;
            drop(guard);
            // Mesa semantics: the waiter must re-test, so signaling on every
            // bump is correct even though only the last one matters.
            cond.signal();
        }
        assert_eq!(handle.join(), 0);
    });
}

#[test]
fn condition_broadcast_wakes_everyone() {
    kernel_test(|| {
        const WAITERS: usize = 4;
        let gate = Arc::new(Lock::new("gate", false));
        let cond = Arc::new(Condition::new("gate"));
        let handles: Vec<_> = (0..WAITERS)
            .map(|i| {
                let (gate, cond) = (gate.clone(), cond.clone());
                ThreadBuilder::new(format!("waiter-{i}")).spawn(move || {
                    let guard = cond.wait_while(&gate, |open| !*open);
                    assert!(*guard);
                })
            })
            .collect();
        for _ in 0..10 {
            Current::yield_now();
        }
        let mut guard = gate.acquire();
        *guard = true;
        drop(guard);
        cond.broadcast();
        for handle in handles {
            assert_eq!(handle.join(), 0);
        }
    });
}

#[test]
fn rwlock_prefers_a_pending_writer_over_new_readers() {
    kernel_test(|| {
        let rw = Arc::new(RwLock::new("pref"));
        let log = EventLog::new();
        let arrived = Arc::new(AtomicUsize::new(0));

        rw.read_acquire();
        let writer = {
            let (rw, log, arrived) = (rw.clone(), log.clone(), arrived.clone());
            ThreadBuilder::new("writer").spawn(move || {
                arrived.fetch_add(1, Ordering::SeqCst);
                rw.write_acquire();
                log.push("writer");
                rw.write_release();
            })
        };
        // Let the writer queue up on the lock before the reader arrives.
        settle(&arrived, 1);
        let late_reader = {
            let (rw, log, arrived) = (rw.clone(), log.clone(), arrived.clone());
            ThreadBuilder::new("late-reader").spawn(move || {
                arrived.fetch_add(1, Ordering::SeqCst);
                rw.read_acquire();
                log.push("late-reader");
                rw.read_release();
            })
        };
        settle(&arrived, 2);
        // Nobody got in while we hold the read lock.
        assert!(log.events().is_empty());
        rw.read_release();
        writer.join();
        late_reader.join();
        // The late reader queued behind the pending writer.
        assert!(log.position("writer") < log.position("late-reader"));
    });
}

#[test]
fn rwlock_admits_concurrent_readers() {
    kernel_test(|| {
        let rw = Arc::new(RwLock::new("shared"));
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let (rw, inside, peak) = (rw.clone(), inside.clone(), peak.clone());
                ThreadBuilder::new(format!("reader-{i}")).spawn(move || {
                    rw.read_acquire();
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    for _ in 0..5 {
                        Current::yield_now();
                    }
                    inside.fetch_sub(1, Ordering::SeqCst);
                    rw.read_release();
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join(), 0);
        }
        assert!(peak.load(Ordering::SeqCst) > 1, "readers never overlapped");
    });
}

#[test]
fn channel_rendezvous_passes_the_message_both_ways() {
    kernel_test(|| {
        let chan = Arc::new(Channel::new("pair"));
        // Sender first.
        let sender = {
            let chan = chan.clone();
            ThreadBuilder::new("sender").spawn(move || chan.send(99))
        };
        for _ in 0..5 {
            Current::yield_now();
        }
        assert_eq!(chan.receive(), 99);
        sender.join();

        // Receiver first.
        let receiver = {
            let chan = chan.clone();
            ThreadBuilder::new("receiver").spawn(move || assert_eq!(chan.receive(), -5))
        };
        for _ in 0..5 {
            Current::yield_now();
        }
        chan.send(-5);
        assert_eq!(receiver.join(), 0);
    });
}

#[test]
fn channel_many_senders_and_receivers_lose_nothing() {
    kernel_test(|| {
        const SENDERS: usize = 5;
        const PER_SENDER: usize = 4;
        const RECEIVERS: usize = 2;
        const PER_RECEIVER: usize = SENDERS * PER_SENDER / RECEIVERS;

        let chan = Arc::new(Channel::new("many"));
        let received = Arc::new(SpinLock::new(Vec::new()));

        let receivers: Vec<_> = (0..RECEIVERS)
            .map(|i| {
                let (chan, received) = (chan.clone(), received.clone());
                ThreadBuilder::new(format!("receiver-{i}")).spawn(move || {
                    for _ in 0..PER_RECEIVER {
                        let value = chan.receive();
                        let mut g = received.lock();
                        g.push(value);
                        g.unlock();
                    }
                })
            })
            .collect();
        let senders: Vec<_> = (0..SENDERS)
            .map(|i| {
                let chan = chan.clone();
                ThreadBuilder::new(format!("sender-{i}")).spawn(move || {
                    for n in 0..PER_SENDER {
                        chan.send((i * PER_SENDER + n) as i32);
                    }
                })
            })
            .collect();
        for handle in senders.into_iter().chain(receivers) {
            assert_eq!(handle.join(), 0);
        }

        let g = received.lock();
        let mut values = g.clone();
        g.unlock();
        values.sort_unstable();
        let expected: Vec<i32> = (0..(SENDERS * PER_SENDER) as i32).collect();
        assert_eq!(values, expected, "messages lost or duplicated");
    });
}

/// The priority-inversion scenario: low-priority holder, finite
/// medium-priority spinner, high-priority waiter.
fn inversion_scenario(donation: bool) -> Vec<&'static str> {
    let log = EventLog::new();
    let lock = Arc::new(Lock::new("inversion", ()));
    let holding = Arc::new(AtomicUsize::new(0));

    let low = {
        let (lock, log, holding) = (lock.clone(), log.clone(), holding.clone());
        ThreadBuilder::new("low").priority(0).spawn(move || {
            let guard = lock.acquire();
            holding.fetch_add(1, Ordering::SeqCst);
            Current::yield_now();
            // Logged before the release so the unblocked waiter cannot
            // outrace the record of its own unblocking.
            log.push("low-done");
            drop(guard);
        })
    };
    // Let low take the lock.
    settle(&holding, 1);
    set_priority_donation(donation);

    let high = {
        let (lock, log) = (lock.clone(), log.clone());
        ThreadBuilder::new("high").priority(MAX_PRIORITY).spawn(move || {
            let guard = lock.acquire();
            drop(guard);
            log.push("high-done");
        })
    };
    let medium = {
        let log = log.clone();
        ThreadBuilder::new("medium").priority(3).spawn(move || {
            for _ in 0..300 {
                Current::yield_now();
            }
            log.push("medium-done");
        })
    };

    high.join();
    medium.join();
    low.join();
    set_priority_donation(true);
    log.events()
}

#[test]
fn priority_donation_defeats_inversion() {
    kernel_test(|| {
        let events = inversion_scenario(true);
        let release = events.iter().position(|e| *e == "low-done").unwrap();
        let high = events.iter().position(|e| *e == "high-done").unwrap();
        let medium = events.iter().position(|e| *e == "medium-done").unwrap();
        // The boosted holder ran first; the high thread finished without
        // waiting out the medium spinner.
        assert!(release < high && high < medium, "order was {events:?}");
    });
}

#[test]
fn without_donation_the_medium_thread_starves_the_holder() {
    kernel_test(|| {
        let events = inversion_scenario(false);
        let release = events.iter().position(|e| *e == "low-done").unwrap();
        let medium = events.iter().position(|e| *e == "medium-done").unwrap();
        assert!(medium < release, "order was {events:?}");
    });
}
