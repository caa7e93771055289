// Copyright (C) 2019-2021  Pierre Krieger
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Bounded single-producer single-consumer rings shared between two parties.
//!
//! A [`Ring`] is a fixed-capacity circular array of descriptors plus a
//! [`RingHeader`] holding the head index, the tail index and a
//! notify-suppression flag. The two parties may run on different cores with
//! nothing but shared memory between them, so every index advance is a
//! release store and every index observation an acquire load: a descriptor
//! is guaranteed visible before the index that publishes it.
//!
//! Neither operation ever blocks. `enqueue` reports a full ring, `dequeue`
//! an empty one, and it is up to the caller to decide what to do about it.
//!
//! # Notification suppression
//!
//! Cross-party notifications are delivered out of band (the transport is
//! not this crate's business). To avoid a notification storm, the consumer
//! of a ring may call [`cancel_signal`](Ring::cancel_signal) while it is
//! actively polling, and [`request_signal`](Ring::request_signal) before it
//! goes back to sleep; the producer checks
//! [`signal_requested`](Ring::signal_requested) after enqueuing and only
//! notifies when it returns `true`.
//!
//! A consumer that re-arms the flag *must* re-check emptiness afterwards
//! and, if the ring turned out to be non-empty, resume polling: a producer
//! may have pushed a descriptor in the window between the last poll and the
//! flag store, and will not send another notification for it. Skipping that
//! re-check loses wakeups.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::{ReqDescriptor, Request, RespDescriptor, Response};

/// Head/tail indices and signal flag of one ring, shared by both parties.
///
/// Indices are kept wrapped into `[0, num_slots)`. One slot is always left
/// empty so that `head == tail` unambiguously means "empty"; a ring over
/// `n` slots therefore holds at most `n - 1` descriptors.
#[repr(C)]
pub struct RingHeader {
    /// Index of the next descriptor to consume. Written by the consumer.
    head: AtomicU32,
    /// Index of the next free slot. Written by the producer.
    tail: AtomicU32,
    /// Non-zero if the consumer wants a notification for the next enqueue.
    signal: AtomicU32,
}

impl RingHeader {
    /// Builds a header for an empty ring, with notifications requested.
    pub const fn new() -> RingHeader {
        RingHeader {
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
            signal: AtomicU32::new(1),
        }
    }
}

/// One descriptor slot of a ring.
///
/// Slots are raced between the two parties by design; the index protocol in
/// [`Ring`] guarantees that a given slot is only ever touched by one party
/// at a time.
#[repr(transparent)]
pub struct Slot<T>(UnsafeCell<T>);

unsafe impl<T: Copy + Send> Sync for Slot<T> {}

impl<T: Copy + Default> Slot<T> {
    fn new() -> Slot<T> {
        Slot(UnsafeCell::new(T::default()))
    }
}

/// Returned by [`Ring::enqueue`] when no slot is free.
#[derive(Debug, Copy, Clone, PartialEq, Eq, derive_more::Display)]
#[display(fmt = "ring is full")]
pub struct RingFull;

/// One party's handle onto one direction of a queue.
///
/// Exactly one party must use the producing operations ([`enqueue`])
/// and exactly one other party the consuming operations ([`peek`],
/// [`consume`], [`dequeue`]); the ring is single-producer single-consumer
/// and nothing here checks that the discipline is respected.
///
/// [`enqueue`]: Ring::enqueue
/// [`peek`]: Ring::peek
/// [`consume`]: Ring::consume
/// [`dequeue`]: Ring::dequeue
pub struct Ring<'a, T: Copy> {
    header: &'a RingHeader,
    slots: &'a [Slot<T>],
}

impl<'a, T: Copy> Ring<'a, T> {
    /// Builds a handle from the shared ring state.
    ///
    /// # Panic
    ///
    /// Panics if there are fewer than two slots, as the empty-slot
    /// convention would leave no usable capacity.
    pub fn new(header: &'a RingHeader, slots: &'a [Slot<T>]) -> Ring<'a, T> {
        assert!(slots.len() >= 2);
        assert!(slots.len() <= u32::max_value() as usize);
        Ring { header, slots }
    }

    fn num_slots(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Maximum number of descriptors the ring can hold at once.
    pub fn capacity(&self) -> usize {
        self.slots.len() - 1
    }

    /// Number of descriptors currently enqueued.
    pub fn len(&self) -> usize {
        let head = self.header.head.load(Ordering::Acquire);
        let tail = self.header.tail.load(Ordering::Acquire);
        (tail.wrapping_sub(head).wrapping_add(self.num_slots()) % self.num_slots()) as usize
    }

    /// True if there is nothing to consume.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if nothing more can be produced.
    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    /// Pushes a descriptor. Fails, leaving the ring untouched, if no slot
    /// is free.
    pub fn enqueue(&mut self, value: T) -> Result<(), RingFull> {
        let tail = self.header.tail.load(Ordering::Relaxed);
        let head = self.header.head.load(Ordering::Acquire);
        let next = tail.wrapping_add(1) % self.num_slots();
        if next == head {
            return Err(RingFull);
        }
        // Sole producer: between the fullness check above and the tail store
        // below, the consumer never reads this slot.
        unsafe {
            *self.slots[tail as usize].0.get() = value;
        }
        self.header.tail.store(next, Ordering::Release);
        Ok(())
    }

    /// Reads the descriptor at the head of the ring without consuming it.
    ///
    /// Combined with [`consume`](Ring::consume), this lets a consumer leave
    /// a descriptor in place when it cannot service it yet.
    pub fn peek(&self) -> Option<T> {
        let head = self.header.head.load(Ordering::Relaxed);
        let tail = self.header.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        // The acquire load of `tail` above orders this read after the
        // producer's write of the slot.
        Some(unsafe { *self.slots[head as usize].0.get() })
    }

    /// Releases the slot returned by the last [`peek`](Ring::peek).
    pub fn consume(&mut self) {
        let head = self.header.head.load(Ordering::Relaxed);
        let tail = self.header.tail.load(Ordering::Acquire);
        debug_assert_ne!(head, tail);
        if head == tail {
            return;
        }
        let next = head.wrapping_add(1) % self.num_slots();
        self.header.head.store(next, Ordering::Release);
    }

    /// Pops the descriptor at the head of the ring, if any.
    pub fn dequeue(&mut self) -> Option<T> {
        let value = self.peek()?;
        self.consume();
        Some(value)
    }

    /// Asks the producer to send a notification for the next enqueue.
    ///
    /// See the module documentation for the mandatory emptiness re-check
    /// after calling this.
    pub fn request_signal(&self) {
        self.header.signal.store(1, Ordering::SeqCst);
    }

    /// Tells the producer that notifications are not needed for now.
    pub fn cancel_signal(&self) {
        self.header.signal.store(0, Ordering::SeqCst);
    }

    /// Producer side: true if the consumer asked to be notified.
    pub fn signal_requested(&self) -> bool {
        self.header.signal.load(Ordering::SeqCst) != 0
    }
}

/// Owned backing memory for one ring.
///
/// The environment that sets up a queue allocates the storage once, then
/// hands a [`Ring`] to each of the two parties. Deployments that map the
/// ring into foreign address spaces lay out the same `#[repr(C)]`
/// structures in the shared region instead.
pub struct RingStorage<T: Copy> {
    header: RingHeader,
    slots: Box<[Slot<T>]>,
}

impl<T: Copy + Default> RingStorage<T> {
    /// Allocates storage for a ring holding up to `capacity` descriptors.
    pub fn new(capacity: usize) -> RingStorage<T> {
        assert!(capacity >= 1);
        let slots = (0..capacity + 1).map(|_| Slot::new()).collect::<Vec<_>>();
        RingStorage {
            header: RingHeader::new(),
            slots: slots.into_boxed_slice(),
        }
    }

    /// Obtains a handle onto the ring. The caller is responsible for the
    /// single-producer single-consumer discipline across all handles.
    pub fn ring(&self) -> Ring<'_, T> {
        Ring::new(&self.header, &self.slots)
    }
}

/// Owned backing memory for a request/response queue pair.
///
/// Both rings have the same capacity, as required by the protocol.
pub struct QueueStorage {
    req: RingStorage<ReqDescriptor>,
    resp: RingStorage<RespDescriptor>,
}

impl QueueStorage {
    /// Allocates a queue pair holding up to `capacity` descriptors per
    /// direction.
    pub fn new(capacity: usize) -> QueueStorage {
        QueueStorage {
            req: RingStorage::new(capacity),
            resp: RingStorage::new(capacity),
        }
    }

    /// Obtains a handle onto the queue pair.
    pub fn handle(&self) -> QueueHandle<'_> {
        QueueHandle::new(self.req.ring(), self.resp.ring())
    }
}

/// The two rings of one queue, as held by one party.
///
/// The submitting party produces onto the request ring and consumes the
/// response ring; the serving party does the opposite. Both use the same
/// handle type and simply stick to their half of the operations.
pub struct QueueHandle<'a> {
    req: Ring<'a, ReqDescriptor>,
    resp: Ring<'a, RespDescriptor>,
}

impl<'a> QueueHandle<'a> {
    /// Builds a handle from the two rings of the queue.
    pub fn new(req: Ring<'a, ReqDescriptor>, resp: Ring<'a, RespDescriptor>) -> QueueHandle<'a> {
        QueueHandle { req, resp }
    }

    /// Pushes a request onto the request ring.
    pub fn enqueue_request(&mut self, rq: Request) -> Result<(), RingFull> {
        self.req.enqueue(ReqDescriptor::from(rq))
    }

    /// Pops a raw request descriptor off the request ring.
    pub fn dequeue_request(&mut self) -> Option<ReqDescriptor> {
        self.req.dequeue()
    }

    /// Pushes a response onto the response ring.
    pub fn enqueue_response(&mut self, rp: Response) -> Result<(), RingFull> {
        self.resp.enqueue(RespDescriptor::from(rp))
    }

    /// Pops a raw response descriptor off the response ring.
    pub fn dequeue_response(&mut self) -> Option<RespDescriptor> {
        self.resp.dequeue()
    }

    /// Access to the request ring.
    pub fn requests(&mut self) -> &mut Ring<'a, ReqDescriptor> {
        &mut self.req
    }

    /// Access to the response ring.
    pub fn responses(&mut self) -> &mut Ring<'a, RespDescriptor> {
        &mut self.resp
    }

    /// True if no further request can be submitted right now.
    pub fn request_ring_full(&self) -> bool {
        self.req.is_full()
    }

    /// Maximum number of requests the request ring can hold at once.
    pub fn request_capacity(&self) -> usize {
        self.req.capacity()
    }

    /// True if no response is waiting.
    pub fn response_ring_empty(&self) -> bool {
        self.resp.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::{QueueStorage, RingStorage};
    use crate::{Operation, Request, ReqDescriptor};

    #[test]
    fn empty_then_full() {
        let storage = RingStorage::<ReqDescriptor>::new(3);
        let mut ring = storage.ring();
        assert!(ring.is_empty());
        assert_eq!(ring.capacity(), 3);

        for i in 0..3 {
            ring.enqueue(ReqDescriptor {
                id: i,
                ..Default::default()
            })
            .unwrap();
        }
        assert!(ring.is_full());
        assert!(ring.enqueue(ReqDescriptor::default()).is_err());
        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn fifo_across_wraparound() {
        let storage = RingStorage::<ReqDescriptor>::new(2);
        let mut producer = storage.ring();
        let mut consumer = storage.ring();

        for round in 0..10u64 {
            producer
                .enqueue(ReqDescriptor {
                    id: round,
                    ..Default::default()
                })
                .unwrap();
            assert_eq!(consumer.dequeue().unwrap().id, round);
        }
        assert!(consumer.dequeue().is_none());
    }

    #[test]
    fn peek_does_not_consume() {
        let storage = RingStorage::<ReqDescriptor>::new(4);
        let mut ring = storage.ring();
        ring.enqueue(ReqDescriptor {
            id: 7,
            ..Default::default()
        })
        .unwrap();

        assert_eq!(ring.peek().unwrap().id, 7);
        assert_eq!(ring.peek().unwrap().id, 7);
        assert_eq!(ring.len(), 1);
        ring.consume();
        assert!(ring.is_empty());
    }

    #[test]
    fn signal_flag_round_trip() {
        let storage = RingStorage::<ReqDescriptor>::new(2);
        let ring = storage.ring();
        assert!(ring.signal_requested());
        ring.cancel_signal();
        assert!(!ring.signal_requested());
        ring.request_signal();
        assert!(ring.signal_requested());
    }

    #[test]
    fn queue_pair_round_trip() {
        let storage = QueueStorage::new(8);
        let mut client = storage.handle();
        let mut server = storage.handle();

        client
            .enqueue_request(Request {
                operation: Operation::Read,
                addr: 0x1000,
                block_number: 5,
                count: 1,
                id: 99,
            })
            .unwrap();

        let desc = server.dequeue_request().unwrap();
        assert_eq!(desc.block_number, 5);
        assert_eq!(desc.id, 99);
        assert!(server.dequeue_request().is_none());
    }
}
