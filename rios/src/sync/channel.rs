//! Rendezvous channel.

use std::collections::VecDeque;
use std::sync::Arc;

use mirage::spinlock::SpinLock;

use super::Semaphore;

#[derive(Clone, Copy, PartialEq, Eq)]
enum WaiterKind {
    Sender,
    Receiver,
}

struct Waiter {
    kind: WaiterKind,
    slot: Arc<Slot>,
}

struct Slot {
    /// The message: placed by the sender, taken by the receiver.
    value: SpinLock<Option<i32>>,
    /// Signaled when the rendezvous completes.
    done: Semaphore,
}

impl Slot {
    fn new(value: Option<i32>) -> Arc<Self> {
        Arc::new(Self {
            value: SpinLock::new(value),
            done: Semaphore::new("channel-slot", 0),
        })
    }
}

/// An unbuffered rendezvous channel carrying an `i32`.
///
/// [`send`](Self::send) and [`receive`](Self::receive) pair off one-to-one;
/// each call completes only once its partner has arrived. One spinlocked
/// FIFO holds whichever side arrived early (it can only ever hold one kind
/// at a time — a mixed pair would have matched immediately), so message
/// delivery is FIFO-fair across any number of concurrent senders and
/// receivers, and no message is ever lost or duplicated.
pub struct Channel {
    name: &'static str,
    waiters: SpinLock<VecDeque<Waiter>>,
}

impl Channel {
    /// A fresh channel named `name` (for traces).
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            waiters: SpinLock::new(VecDeque::new()),
        }
    }

    /// Deliver `message` to a receiver, blocking until one takes it.
    pub fn send(&self, message: i32) {
        let mut g = self.waiters.lock();
        if g.front().is_some_and(|w| w.kind == WaiterKind::Receiver) {
            let receiver = g.pop_front().unwrap();
            g.unlock();
            mirage::trace!('s', "channel {}: send matched a waiting receiver", self.name);
            let mut v = receiver.slot.value.lock();
            *v = Some(message);
            v.unlock();
            receiver.slot.done.signal();
        } else {
            let slot = Slot::new(Some(message));
            g.push_back(Waiter {
                kind: WaiterKind::Sender,
                slot: slot.clone(),
            });
            g.unlock();
            slot.done.wait();
        }
    }

    /// Receive a message, blocking until a sender provides one.
    pub fn receive(&self) -> i32 {
        let mut g = self.waiters.lock();
        if g.front().is_some_and(|w| w.kind == WaiterKind::Sender) {
            let sender = g.pop_front().unwrap();
            g.unlock();
            mirage::trace!('s', "channel {}: receive matched a waiting sender", self.name);
            let mut v = sender.slot.value.lock();
            let message = v.take().expect("sender slot empty");
            v.unlock();
            sender.slot.done.signal();
            message
        } else {
            let slot = Slot::new(None);
            g.push_back(Waiter {
                kind: WaiterKind::Receiver,
                slot: slot.clone(),
            });
            g.unlock();
            slot.done.wait();
            let mut v = slot.value.lock();
            let message = v.take().expect("woken with empty slot");
            v.unlock();
            message
        }
    }
}
