// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded message queues with priority-tagged delivery.
//!
//! Slot size and count are const parameters; payloads are copied in and
//! out of the queue's own storage, so messages have no lifetime ties to
//! the sender. Delivery order is tag-descending, FIFO within a tag.
//!
//! Blocked senders and receivers are not handed messages directly:
//! whoever frees the resource wakes the head waiter, which loops and
//! retries its transfer. Timed variants keep their original absolute
//! deadline across retries.

use abi::{Kind, WakeReason};

use crate::lock::KCell;
use crate::sched::Kernel;
use crate::startup::with_kernel;
use crate::wait::{self, Deadline, Progress, WaitList};

/// Exclusive upper bound for message priority tags.
pub const PRIO_LIMIT: u8 = 32;

pub(crate) struct MqState<const MSG: usize, const SLOTS: usize> {
    ring: kerncore::MsgRing<SLOTS>,
    store: [[u8; MSG]; SLOTS],
    lens: [u16; SLOTS],
    senders: WaitList,
    receivers: WaitList,
}

impl<const MSG: usize, const SLOTS: usize> MqState<MSG, SLOTS> {
    pub(crate) const fn new() -> Self {
        assert!(MSG > 0 && MSG <= u16::MAX as usize);
        assert!(SLOTS > 0);
        Self {
            ring: kerncore::MsgRing::new(),
            store: [[0; MSG]; SLOTS],
            lens: [0; SLOTS],
            senders: WaitList::new(),
            receivers: WaitList::new(),
        }
    }

    /// One send attempt: copy the payload into a free slot and queue it,
    /// or report `WouldBlock` when full.
    pub(crate) fn try_send(
        &mut self,
        k: &mut Kernel,
        msg: &[u8],
        prio: u8,
    ) -> abi::Result<()> {
        if prio >= PRIO_LIMIT || msg.len() > MSG {
            return Err(Kind::Invalid);
        }
        let Some(slot) = self.ring.take_slot() else {
            return Err(Kind::WouldBlock);
        };
        let s = slot as usize;
        self.store[s][..msg.len()].copy_from_slice(msg);
        self.lens[s] = msg.len() as u16;
        if self.ring.commit(slot, prio).is_err() {
            // A slot was free, so the delivery queue cannot be full.
            self.ring.abandon(slot);
            uassert!(false);
        }
        self.receivers.wake_one(k, WakeReason::Ok);
        Ok(())
    }

    /// One receive attempt: copy the head message out, or report
    /// `WouldBlock` when empty. Returns `(length, priority)`.
    pub(crate) fn try_receive(
        &mut self,
        k: &mut Kernel,
        buf: &mut [u8],
    ) -> abi::Result<(usize, u8)> {
        if buf.len() < MSG {
            return Err(Kind::Invalid);
        }
        let Some((slot, prio)) = self.ring.pop() else {
            return Err(Kind::WouldBlock);
        };
        let s = slot as usize;
        let len = self.lens[s] as usize;
        buf[..len].copy_from_slice(&self.store[s][..len]);
        self.ring.release(slot);
        self.senders.wake_one(k, WakeReason::Ok);
        Ok((len, prio))
    }

    pub(crate) fn len(&self) -> usize {
        self.ring.len()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.ring.is_full()
    }

    pub(crate) fn waiting_senders(&self) -> usize {
        self.senders.waiters()
    }

    pub(crate) fn waiting_receivers(&self) -> usize {
        self.receivers.waiters()
    }

    fn park_sender(&mut self, k: &mut Kernel, until: Option<u64>) {
        self.senders.park(k, until);
    }

    fn park_receiver(&mut self, k: &mut Kernel, until: Option<u64>) {
        self.receivers.park(k, until);
    }
}

/// A bounded queue of `SLOTS` messages of up to `MSG` bytes each.
pub struct MsgQueue<const MSG: usize, const SLOTS: usize> {
    state: KCell<MqState<MSG, SLOTS>>,
}

impl<const MSG: usize, const SLOTS: usize> MsgQueue<MSG, SLOTS> {
    pub const fn new() -> Self {
        Self {
            state: KCell::new(MqState::new()),
        }
    }

    /// Copies `msg` into the queue with priority tag `prio` (`0..32`),
    /// blocking while the queue is full.
    pub fn send(&'static self, msg: &[u8], prio: u8) -> abi::Result<()> {
        self.send_inner(msg, prio, Deadline::Forever)
    }

    /// Non-blocking send. Interrupt-safe; wakes (and possibly preempts
    /// into) a blocked receiver.
    pub fn try_send(&self, msg: &[u8], prio: u8) -> abi::Result<()> {
        with_kernel(|k, cs| self.state.borrow_mut(cs).try_send(k, msg, prio))
    }

    /// Timed send; zero ticks is the polling form.
    pub fn timed_send(
        &'static self,
        msg: &[u8],
        prio: u8,
        ticks: u64,
    ) -> abi::Result<()> {
        self.send_inner(msg, prio, Deadline::after(ticks))
    }

    fn send_inner(
        &'static self,
        msg: &[u8],
        prio: u8,
        deadline: Deadline,
    ) -> abi::Result<()> {
        // The deadline is fixed once, not per retry.
        let until = match deadline {
            Deadline::Poll => return self.try_send(msg, prio),
            Deadline::Forever => None,
            Deadline::After(t) => Some(with_kernel(|k, _| k.ticks + t)),
        };
        loop {
            let progress = with_kernel(|k, cs| {
                let mut q = self.state.borrow_mut(cs);
                match q.try_send(k, msg, prio) {
                    Ok(()) => Ok(Progress::Done(())),
                    Err(Kind::WouldBlock) => {
                        k.begin_block()?;
                        if let Some(d) = until {
                            if d <= k.ticks {
                                return Err(Kind::Timeout);
                            }
                        }
                        q.park_sender(k, until);
                        Ok(Progress::Parked)
                    }
                    Err(e) => Err(e),
                }
            })?;
            match progress {
                Progress::Done(()) => return Ok(()),
                // Space may have appeared; retry under the same deadline.
                Progress::Parked => wait::block_result()?,
            }
        }
    }

    /// Receives the most important pending message into `buf` (which must
    /// hold `MSG` bytes), blocking while the queue is empty. Returns the
    /// message length and its priority tag.
    pub fn receive(&'static self, buf: &mut [u8]) -> abi::Result<(usize, u8)> {
        self.receive_inner(buf, Deadline::Forever)
    }

    /// Non-blocking receive. Interrupt-safe; wakes a blocked sender.
    pub fn try_receive(&self, buf: &mut [u8]) -> abi::Result<(usize, u8)> {
        with_kernel(|k, cs| self.state.borrow_mut(cs).try_receive(k, buf))
    }

    /// Timed receive; zero ticks is the polling form.
    pub fn timed_receive(
        &'static self,
        buf: &mut [u8],
        ticks: u64,
    ) -> abi::Result<(usize, u8)> {
        self.receive_inner(buf, Deadline::after(ticks))
    }

    fn receive_inner(
        &'static self,
        buf: &mut [u8],
        deadline: Deadline,
    ) -> abi::Result<(usize, u8)> {
        let until = match deadline {
            Deadline::Poll => return self.try_receive(buf),
            Deadline::Forever => None,
            Deadline::After(t) => Some(with_kernel(|k, _| k.ticks + t)),
        };
        loop {
            let progress = with_kernel(|k, cs| {
                let mut q = self.state.borrow_mut(cs);
                match q.try_receive(k, buf) {
                    Ok(got) => Ok(Progress::Done(got)),
                    Err(Kind::WouldBlock) => {
                        k.begin_block()?;
                        if let Some(d) = until {
                            if d <= k.ticks {
                                return Err(Kind::Timeout);
                            }
                        }
                        q.park_receiver(k, until);
                        Ok(Progress::Parked)
                    }
                    Err(e) => Err(e),
                }
            })?;
            match progress {
                Progress::Done(got) => return Ok(got),
                Progress::Parked => wait::block_result()?,
            }
        }
    }

    /// Number of messages currently stored.
    pub fn len(&self) -> usize {
        with_kernel(|_, cs| self.state.borrow_mut(cs).len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub const fn capacity(&self) -> usize {
        SLOTS
    }

    pub const fn msg_size(&self) -> usize {
        MSG
    }

    /// Threads blocked in `send` waiting for space.
    pub fn waiting_senders(&self) -> usize {
        with_kernel(|_, cs| self.state.borrow_mut(cs).waiting_senders())
    }

    /// Threads blocked in `receive` waiting for a message.
    pub fn waiting_receivers(&self) -> usize {
        with_kernel(|_, cs| self.state.borrow_mut(cs).waiting_receivers())
    }
}

impl<const MSG: usize, const SLOTS: usize> Default for MsgQueue<MSG, SLOTS> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::testing::ready_kernel;
    use abi::{Priority, ThreadState};

    #[test]
    fn messages_round_trip_with_length() {
        let (mut k, _) = ready_kernel(&[("a", Priority::NORMAL)]);
        let mut q = MqState::<8, 2>::new();
        q.try_send(&mut k, b"ping", 0).unwrap();
        let mut buf = [0u8; 8];
        let (len, prio) = q.try_receive(&mut k, &mut buf).unwrap();
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(prio, 0);
    }

    #[test]
    fn delivery_is_priority_then_fifo() {
        let (mut k, _) = ready_kernel(&[("a", Priority::NORMAL)]);
        let mut q = MqState::<4, 4>::new();
        q.try_send(&mut k, b"lo1", 1).unwrap();
        q.try_send(&mut k, b"hi", 9).unwrap();
        q.try_send(&mut k, b"lo2", 1).unwrap();
        let mut buf = [0u8; 4];
        let mut order = vec![];
        while let Ok((len, _)) = q.try_receive(&mut k, &mut buf) {
            order.push(buf[..len].to_vec());
        }
        assert_eq!(order, vec![b"hi".to_vec(), b"lo1".to_vec(), b"lo2".to_vec()]);
    }

    #[test]
    fn tag_range_and_size_are_validated() {
        let (mut k, _) = ready_kernel(&[("a", Priority::NORMAL)]);
        let mut q = MqState::<4, 2>::new();
        assert_eq!(
            q.try_send(&mut k, b"x", PRIO_LIMIT),
            Err(Kind::Invalid)
        );
        assert_eq!(q.try_send(&mut k, b"toolong", 0), Err(Kind::Invalid));
        let mut small = [0u8; 2];
        assert_eq!(q.try_receive(&mut k, &mut small), Err(Kind::Invalid));
    }

    #[test]
    fn full_queue_would_block_and_wakes_sender_on_drain() {
        let (mut k, sender) = ready_kernel(&[
            ("sender", Priority::NORMAL),
            ("rx", Priority::NORMAL),
            ("idle", Priority::IDLE),
        ]);
        let mut q = MqState::<4, 1>::new();
        q.try_send(&mut k, b"one", 0).unwrap();
        assert!(q.is_full());
        assert_eq!(q.try_send(&mut k, b"two", 0), Err(Kind::WouldBlock));

        // Sender parks awaiting space.
        q.park_sender(&mut k, None);
        k.reschedule();
        assert_ne!(k.current, sender);

        // Receiver drains; the parked sender is woken to retry.
        let mut buf = [0u8; 4];
        q.try_receive(&mut k, &mut buf).unwrap();
        assert_eq!(k.threads[sender].state, ThreadState::Ready);
        assert_eq!(k.threads[sender].wake_reason, WakeReason::Ok);
    }

    #[test]
    fn empty_receive_would_block_and_wakes_on_send() {
        let (mut k, rx) = ready_kernel(&[
            ("rx", Priority::NORMAL),
            ("tx", Priority::NORMAL),
            ("idle", Priority::IDLE),
        ]);
        let mut q = MqState::<4, 2>::new();
        let mut buf = [0u8; 4];
        assert_eq!(q.try_receive(&mut k, &mut buf), Err(Kind::WouldBlock));
        q.park_receiver(&mut k, None);
        k.reschedule();

        q.try_send(&mut k, b"m", 0).unwrap();
        assert_eq!(k.threads[rx].state, ThreadState::Ready);
    }

    #[test]
    fn cancelled_receiver_leaves_queue_unchanged() {
        let (mut k, rx) = ready_kernel(&[
            ("rx", Priority::NORMAL),
            ("idle", Priority::IDLE),
        ]);
        let mut q = MqState::<4, 2>::new();
        q.park_receiver(&mut k, None);
        k.reschedule();

        // Cancellation wakes the receiver with Interrupted; no message
        // moved, no slot consumed.
        assert!(k.wake(rx, WakeReason::Interrupted));
        assert_eq!(k.threads[rx].wake_reason, WakeReason::Interrupted);
        assert_eq!(q.len(), 0);
        assert!(!q.is_full());
        q.try_send(&mut k, b"ok", 0).unwrap();
        assert_eq!(q.len(), 1);
    }
}
