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

//! Bookkeeping of requests that are in flight at the driver.
//!
//! When the virtualizer forwards a client request to the driver it strips
//! everything the driver doesn't need and parks it here, keyed by a
//! [`RequestId`] that rides along in the driver request and comes back in
//! the driver response. Both directions are O(1): slots live in a
//! fixed-capacity arena threaded through an index-based free list, so no
//! operation ever walks the table.
//!
//! A [`RequestId`] is never handed out twice while its slot is live. This
//! is the invariant that makes response attribution safe: whatever order
//! the driver completes requests in, an ID uniquely designates one parked
//! context, and therefore one owning client.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;

use lodestone_block_interface::Operation;

use crate::platform::{ClientAddr, ClientId, DriverAddr};

/// Identifier assigned by [`Ledger::alloc`], carried through the driver's
/// request/response exchange.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    /// Reconstructs an identifier from its on-wire representation. The
    /// result is only as trustworthy as the wire it came from;
    /// [`Ledger::retrieve_and_free`] rejects values it never issued.
    pub fn from_wire(raw: u64) -> RequestId {
        RequestId(raw)
    }

    /// The on-wire representation of this identifier.
    pub fn to_wire(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

/// Everything the virtualizer needs to finish a request once the driver
/// responds.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RequestContext {
    /// Client the request belongs to.
    pub client: ClientId,
    /// The client's own identifier for the request, echoed back verbatim
    /// in its response.
    pub tag: u64,
    /// The client's buffer.
    pub client_addr: ClientAddr,
    /// The staged buffer handed to the driver. For operations without a
    /// payload this mirrors the client's address and designates nothing.
    pub driver_addr: DriverAddr,
    /// Length of the transfer in units.
    pub count: u16,
    /// What the request does.
    pub operation: Operation,
}

/// Returned by [`Ledger::alloc`] when every slot is taken.
#[derive(Debug, Copy, Clone, PartialEq, Eq, derive_more::Display)]
#[display(fmt = "all request slots are in flight")]
pub struct LedgerFull;

struct Slot {
    context: Option<RequestContext>,
    /// Index of the next free slot, meaningful only while this slot is
    /// free and not the tail of the free list.
    next_free: u32,
}

/// Fixed-capacity table of in-flight request contexts.
pub struct Ledger {
    slots: Box<[Slot]>,
    /// First free slot, meaningful while `num_free > 0`.
    free_head: u32,
    /// Last free slot, meaningful while `num_free > 0`.
    free_tail: u32,
    num_free: usize,
}

impl Ledger {
    /// Builds a ledger with room for `capacity` simultaneous in-flight
    /// requests.
    ///
    /// # Panic
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Ledger {
        assert!(capacity >= 1);
        assert!(capacity <= u32::max_value() as usize);
        let slots = (0..capacity)
            .map(|i| Slot {
                context: None,
                next_free: (i as u32).wrapping_add(1),
            })
            .collect::<Vec<_>>();
        Ledger {
            slots: slots.into_boxed_slice(),
            free_head: 0,
            free_tail: capacity as u32 - 1,
            num_free: capacity,
        }
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// True if [`alloc`](Ledger::alloc) would fail.
    pub fn is_full(&self) -> bool {
        self.num_free == 0
    }

    /// Number of requests currently parked.
    pub fn in_flight(&self) -> usize {
        self.slots.len() - self.num_free
    }

    /// Parks a context and returns the identifier under which it can be
    /// retrieved.
    pub fn alloc(&mut self, context: RequestContext) -> Result<RequestId, LedgerFull> {
        if self.num_free == 0 {
            return Err(LedgerFull);
        }
        let index = self.free_head;
        let slot = &mut self.slots[index as usize];
        debug_assert!(slot.context.is_none());
        slot.context = Some(context);
        self.free_head = slot.next_free;
        self.num_free -= 1;
        Ok(RequestId(u64::from(index)))
    }

    /// Retrieves a parked context and releases its slot.
    ///
    /// Returns `None` if `id` doesn't designate a live slot, which means
    /// the caller was handed an identifier this ledger never issued. That
    /// is a protocol violation by whoever produced the identifier, not a
    /// backpressure condition.
    pub fn retrieve_and_free(&mut self, id: RequestId) -> Option<RequestContext> {
        if id.0 >= self.slots.len() as u64 {
            return None;
        }
        let index = id.0 as u32;
        let context = self.slots[index as usize].context.take()?;
        if self.num_free == 0 {
            self.free_head = index;
        } else {
            self.slots[self.free_tail as usize].next_free = index;
        }
        self.free_tail = index;
        self.num_free += 1;
        Some(context)
    }
}

#[cfg(test)]
mod tests {
    use super::{Ledger, LedgerFull, RequestContext, RequestId};
    use crate::platform::{ClientAddr, ClientId, DriverAddr};
    use lodestone_block_interface::Operation;

    fn context(tag: u64) -> RequestContext {
        RequestContext {
            client: ClientId(0),
            tag,
            client_addr: ClientAddr(0x1000),
            driver_addr: DriverAddr(0x2000),
            count: 1,
            operation: Operation::Read,
        }
    }

    #[test]
    fn round_trip() {
        let mut ledger = Ledger::new(4);
        let id = ledger.alloc(context(7)).unwrap();
        assert_eq!(ledger.in_flight(), 1);
        let ctx = ledger.retrieve_and_free(id).unwrap();
        assert_eq!(ctx.tag, 7);
        assert_eq!(ledger.in_flight(), 0);
    }

    #[test]
    fn ids_unique_while_live() {
        let mut ledger = Ledger::new(64);
        let mut seen = hashbrown::HashSet::new();
        for i in 0..64 {
            let id = ledger.alloc(context(i)).unwrap();
            assert!(seen.insert(id.to_wire()));
        }
        assert!(ledger.is_full());
        assert_eq!(ledger.alloc(context(99)), Err(LedgerFull));
    }

    #[test]
    fn slots_recycle_after_free() {
        let mut ledger = Ledger::new(2);
        let a = ledger.alloc(context(1)).unwrap();
        let _b = ledger.alloc(context(2)).unwrap();
        assert!(ledger.is_full());

        assert_eq!(ledger.retrieve_and_free(a).unwrap().tag, 1);
        let c = ledger.alloc(context(3)).unwrap();
        assert_eq!(c, a);
        assert!(ledger.is_full());
    }

    #[test]
    fn unknown_ids_rejected() {
        let mut ledger = Ledger::new(2);
        assert!(ledger.retrieve_and_free(RequestId::from_wire(0)).is_none());
        assert!(ledger.retrieve_and_free(RequestId::from_wire(17)).is_none());

        let id = ledger.alloc(context(1)).unwrap();
        assert!(ledger.retrieve_and_free(id).is_some());
        // Double free.
        assert!(ledger.retrieve_and_free(id).is_none());
    }

    #[test]
    fn interleaved_alloc_free() {
        let mut ledger = Ledger::new(3);
        for round in 0..50u64 {
            let x = ledger.alloc(context(round)).unwrap();
            let y = ledger.alloc(context(round + 1000)).unwrap();
            assert_eq!(ledger.retrieve_and_free(x).unwrap().tag, round);
            assert_eq!(
                ledger.retrieve_and_free(y).unwrap().tag,
                round + 1000
            );
        }
        assert_eq!(ledger.in_flight(), 0);
    }
}
