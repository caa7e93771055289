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

//! Consumer-side convenience wrapper around a queue pair.
//!
//! A block storage consumer holds a [`ClientHandle`] over its queue and its
//! provider's [`StorageInfoCell`]. The handle refuses to submit anything
//! until the provider has published its storage properties, and otherwise
//! adds nothing on top of the ring protocol: no blocking, no retries, no
//! pacing. A consumer that outruns its provider sees its request ring fill
//! up and must back off by itself.

use core::convert::TryFrom;

use crate::queue::QueueHandle;
use crate::{InvalidCode, Request, Response, StorageInfo, StorageInfoCell};

/// Why a request could not be submitted.
#[derive(Debug, Copy, Clone, PartialEq, Eq, derive_more::Display)]
pub enum SendError {
    /// The provider hasn't published its storage properties yet.
    #[display(fmt = "storage provider is not ready")]
    NotReady,
    /// The request ring is full. Trying again later, after the provider has
    /// drained the ring, may succeed.
    #[display(fmt = "request ring is full")]
    QueueFull,
}

/// The consumer's end of a block storage connection.
pub struct ClientHandle<'a> {
    queue: QueueHandle<'a>,
    info: &'a StorageInfoCell,
}

impl<'a> ClientHandle<'a> {
    /// Builds a handle from the consumer's queue pair and the provider's
    /// storage descriptor cell.
    pub fn new(queue: QueueHandle<'a>, info: &'a StorageInfoCell) -> ClientHandle<'a> {
        ClientHandle { queue, info }
    }

    /// True once the provider accepts requests.
    pub fn ready(&self) -> bool {
        self.info.is_ready()
    }

    /// Properties of the storage, once published.
    pub fn storage_info(&self) -> Option<StorageInfo> {
        self.info.get()
    }

    /// Submits a request.
    pub fn send_request(&mut self, rq: Request) -> Result<(), SendError> {
        if !self.info.is_ready() {
            return Err(SendError::NotReady);
        }
        self.queue
            .enqueue_request(rq)
            .map_err(|_| SendError::QueueFull)
    }

    /// Pops the next completion, if any.
    ///
    /// An `Err` means the provider put a status code on the wire that this
    /// consumer doesn't know about.
    pub fn poll_response(&mut self) -> Option<Result<Response, InvalidCode>> {
        let desc = self.queue.dequeue_response()?;
        Some(Response::try_from(desc))
    }

    /// True if the provider asked to be notified about new requests.
    ///
    /// After a successful [`send_request`](ClientHandle::send_request), the
    /// consumer should ring the provider's notification channel when this
    /// returns `true`.
    pub fn signal_required(&mut self) -> bool {
        self.queue.requests().signal_requested()
    }
}

#[cfg(test)]
mod tests {
    use super::{ClientHandle, SendError};
    use crate::queue::QueueStorage;
    use crate::{Operation, Request, StorageInfo, StorageInfoCell};

    fn request() -> Request {
        Request {
            operation: Operation::Read,
            addr: 0,
            block_number: 0,
            count: 1,
            id: 1,
        }
    }

    #[test]
    fn refuses_requests_until_ready() {
        let storage = QueueStorage::new(4);
        let info = StorageInfoCell::new();
        let mut client = ClientHandle::new(storage.handle(), &info);

        assert_eq!(client.send_request(request()), Err(SendError::NotReady));

        info.publish(StorageInfo {
            sector_size: 512,
            block_size: 4096,
            capacity: 16,
            read_only: false,
        });
        assert!(client.send_request(request()).is_ok());
    }

    #[test]
    fn reports_full_ring() {
        let storage = QueueStorage::new(1);
        let info = StorageInfoCell::new();
        info.publish(StorageInfo {
            sector_size: 512,
            block_size: 4096,
            capacity: 16,
            read_only: false,
        });
        let mut client = ClientHandle::new(storage.handle(), &info);

        assert!(client.send_request(request()).is_ok());
        assert_eq!(client.send_request(request()), Err(SendError::QueueFull));
    }
}
