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

//! Block storage virtualization.
//!
//! This crate contains the heart of the lodestone storage stack: a
//! [`Virtualizer`](virt::Virtualizer) sitting between one physical block
//! device driver and several mutually-untrusted clients, each of which is
//! shown what looks like its own private disk.
//!
//! The virtualizer, the driver and the clients run as separately-scheduled
//! components that share nothing but bounded rings (see the
//! `lodestone-block-interface` crate) and a staging memory region. The
//! virtualizer itself is strictly single-threaded and non-blocking: it
//! reacts to inbound notifications, performs a bounded amount of work, and
//! goes back to sleep. Every interaction with its environment that the
//! rings can't express (sending notifications, moving bytes between
//! address spaces, cache maintenance) goes through the
//! [`Platform`](platform::Platform) trait.
//!
//! At start-up the virtualizer reads the partition table from the first
//! sector of the device and assigns one partition to each client, in table
//! order. From then on every client request is bounds-checked against its
//! partition and rewritten into driver terms before it is forwarded; no
//! client can ever address another client's storage.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod buffer_pool;
pub mod ledger;
pub mod mbr;
pub mod platform;
pub mod virt;
