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

//! Block storage interface.
//!
//! This crate defines the protocol spoken between a block storage provider
//! and its consumers. Both sides of the conversation share a pair of bounded
//! single-producer single-consumer rings (one carrying requests, one carrying
//! responses, see the [`queue`] module) plus one [`StorageInfoCell`]
//! describing the storage behind the rings. A consumer submits a
//! [`Request`], rings the provider's notification channel, and later finds a
//! [`Response`] carrying the same `id` value in its response ring.
//!
//! Data never travels through the rings themselves. A request designates a
//! buffer by address, and the transfer happens directly between that buffer
//! and the storage provider. All sizes are expressed in *transfer units*,
//! the fixed allocation granule advertised in [`StorageInfo::block_size`].
//!
//! The same types are used on both sides of a virtualized setup: clients
//! talk to the virtualizer with these rings, and the virtualizer talks to
//! the device driver with these rings.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use core::convert::TryFrom;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

pub use client::{ClientHandle, SendError};
pub use queue::{QueueHandle, QueueStorage, Ring, RingFull, RingHeader, RingStorage, Slot};

pub mod client;
pub mod queue;

/// What a request asks the storage to do.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Transfer data from the storage into the buffer.
    Read,
    /// Transfer data from the buffer onto the storage.
    Write,
    /// Commit previously-written data to the medium. Carries no data.
    Flush,
    /// Order all writes submitted before this request ahead of all writes
    /// submitted after it. Carries no data.
    Barrier,
}

impl Operation {
    /// Numeric code of this operation on the wire.
    pub fn code(self) -> u32 {
        match self {
            Operation::Read => 0,
            Operation::Write => 1,
            Operation::Flush => 2,
            Operation::Barrier => 3,
        }
    }

    /// Decodes a wire code. The other side of a ring is not necessarily
    /// trusted, which is why this can fail.
    pub fn from_code(code: u32) -> Result<Self, InvalidCode> {
        match code {
            0 => Ok(Operation::Read),
            1 => Ok(Operation::Write),
            2 => Ok(Operation::Flush),
            3 => Ok(Operation::Barrier),
            other => Err(InvalidCode(other)),
        }
    }

    /// True for the operations that move data and therefore designate a
    /// meaningful buffer.
    pub fn has_payload(self) -> bool {
        match self {
            Operation::Read | Operation::Write => true,
            Operation::Flush | Operation::Barrier => false,
        }
    }
}

/// Outcome of a request, as reported in a [`Response`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Status {
    /// The request was carried out in full.
    Success,
    /// The requested range could not be addressed.
    // When the providers start reporting more detailed error conditions,
    // new variants will be added here.
    SeekError,
}

impl Status {
    /// Numeric code of this status on the wire.
    pub fn code(self) -> u32 {
        match self {
            Status::Success => 0,
            Status::SeekError => 1,
        }
    }

    /// Decodes a wire code.
    pub fn from_code(code: u32) -> Result<Self, InvalidCode> {
        match code {
            0 => Ok(Status::Success),
            1 => Ok(Status::SeekError),
            other => Err(InvalidCode(other)),
        }
    }
}

/// A numeric code found on the wire doesn't correspond to any known value.
#[derive(Debug, Copy, Clone, PartialEq, Eq, derive_more::Display)]
#[display(fmt = "invalid wire code: {}", _0)]
pub struct InvalidCode(pub u32);

/// One submission travelling through a request ring.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Request {
    /// What to do.
    pub operation: Operation,
    /// Address of the buffer the data is read from or written to. Only
    /// meaningful to the party that owns the buffer; it crosses the ring as
    /// an opaque integer.
    pub addr: u64,
    /// First transfer unit on the storage that the request applies to.
    pub block_number: u64,
    /// Number of transfer units to process.
    pub count: u16,
    /// Opaque value chosen by the submitter. The matching [`Response`]
    /// carries it back unchanged.
    pub id: u64,
}

/// One completion travelling through a response ring.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Response {
    /// Outcome of the request.
    pub status: Status,
    /// Number of transfer units successfully processed.
    pub count: u16,
    /// The `id` of the [`Request`] this responds to, byte-for-byte.
    pub id: u64,
}

/// Exact layout of a request descriptor within a ring.
///
/// Fields are ordered so that the struct has no implicit padding, as the
/// memory holding it can be shared between separately-built parties.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
#[repr(C)]
pub struct ReqDescriptor {
    pub addr: u64,
    pub block_number: u64,
    pub id: u64,
    pub code: u32,
    pub count: u16,
    pub _reserved: u16,
}

/// Exact layout of a response descriptor within a ring.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
#[repr(C)]
pub struct RespDescriptor {
    pub id: u64,
    pub status: u32,
    pub count: u16,
    pub _reserved: u16,
}

impl From<Request> for ReqDescriptor {
    fn from(rq: Request) -> ReqDescriptor {
        ReqDescriptor {
            addr: rq.addr,
            block_number: rq.block_number,
            id: rq.id,
            code: rq.operation.code(),
            count: rq.count,
            _reserved: 0,
        }
    }
}

impl TryFrom<ReqDescriptor> for Request {
    type Error = InvalidCode;

    fn try_from(desc: ReqDescriptor) -> Result<Request, InvalidCode> {
        Ok(Request {
            operation: Operation::from_code(desc.code)?,
            addr: desc.addr,
            block_number: desc.block_number,
            count: desc.count,
            id: desc.id,
        })
    }
}

impl From<Response> for RespDescriptor {
    fn from(rp: Response) -> RespDescriptor {
        RespDescriptor {
            id: rp.id,
            status: rp.status.code(),
            count: rp.count,
            _reserved: 0,
        }
    }
}

impl TryFrom<RespDescriptor> for Response {
    type Error = InvalidCode;

    fn try_from(desc: RespDescriptor) -> Result<Response, InvalidCode> {
        Ok(Response {
            status: Status::from_code(desc.status)?,
            count: desc.count,
            id: desc.id,
        })
    }
}

/// Properties of a storage, as published by its provider.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StorageInfo {
    /// Size in bytes of one sector of the underlying medium.
    pub sector_size: u32,
    /// Size in bytes of one transfer unit. Requests address the storage in
    /// multiples of this.
    pub block_size: u32,
    /// Total size of the storage, in transfer units.
    pub capacity: u64,
    /// `true` if write requests will be refused by the medium.
    pub read_only: bool,
}

/// Shared cell through which a provider publishes its [`StorageInfo`].
///
/// The cell lives in memory visible to both parties. The provider fills in
/// every field and then flips `ready`; consumers must not submit any request
/// before [`is_ready`](StorageInfoCell::is_ready) returns `true`. The
/// release/acquire pairing on `ready` is what makes the other fields safe to
/// read without further synchronization.
#[repr(C)]
pub struct StorageInfoCell {
    sector_size: AtomicU32,
    block_size: AtomicU32,
    capacity: AtomicU64,
    read_only: AtomicU32,
    ready: AtomicU32,
}

impl StorageInfoCell {
    /// Builds a cell with `ready` unset.
    pub const fn new() -> StorageInfoCell {
        StorageInfoCell {
            sector_size: AtomicU32::new(0),
            block_size: AtomicU32::new(0),
            capacity: AtomicU64::new(0),
            read_only: AtomicU32::new(0),
            ready: AtomicU32::new(0),
        }
    }

    /// Fills in the cell and marks it ready.
    pub fn publish(&self, info: StorageInfo) {
        self.sector_size.store(info.sector_size, Ordering::Relaxed);
        self.block_size.store(info.block_size, Ordering::Relaxed);
        self.capacity.store(info.capacity, Ordering::Relaxed);
        self.read_only
            .store(if info.read_only { 1 } else { 0 }, Ordering::Relaxed);
        self.ready.store(1, Ordering::Release);
    }

    /// True once the provider has published the storage properties.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire) != 0
    }

    /// Reads the published properties, or `None` if the cell isn't ready
    /// yet.
    pub fn get(&self) -> Option<StorageInfo> {
        if !self.is_ready() {
            return None;
        }
        Some(StorageInfo {
            sector_size: self.sector_size.load(Ordering::Relaxed),
            block_size: self.block_size.load(Ordering::Relaxed),
            capacity: self.capacity.load(Ordering::Relaxed),
            read_only: self.read_only.load(Ordering::Relaxed) != 0,
        })
    }
}

impl Default for StorageInfoCell {
    fn default() -> Self {
        StorageInfoCell::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{Operation, Request, ReqDescriptor, Status, StorageInfo, StorageInfoCell};
    use core::convert::TryFrom;

    #[test]
    fn operation_codes_round_trip() {
        for op in &[
            Operation::Read,
            Operation::Write,
            Operation::Flush,
            Operation::Barrier,
        ] {
            assert_eq!(Operation::from_code(op.code()), Ok(*op));
        }
        assert!(Operation::from_code(17).is_err());
        assert!(Status::from_code(2).is_err());
    }

    #[test]
    fn request_descriptor_round_trip() {
        let rq = Request {
            operation: Operation::Write,
            addr: 0xdead_beef,
            block_number: 42,
            count: 3,
            id: 0x0123_4567_89ab_cdef,
        };
        assert_eq!(Request::try_from(ReqDescriptor::from(rq)), Ok(rq));
    }

    #[test]
    fn info_cell_not_ready_by_default() {
        let cell = StorageInfoCell::new();
        assert!(!cell.is_ready());
        assert!(cell.get().is_none());

        cell.publish(StorageInfo {
            sector_size: 512,
            block_size: 4096,
            capacity: 256,
            read_only: true,
        });
        assert!(cell.is_ready());
        let info = cell.get().unwrap();
        assert_eq!(info.block_size, 4096);
        assert!(info.read_only);
    }
}
