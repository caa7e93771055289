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

//! Hooks into the environment hosting the virtualizer, plus the handful of
//! small identifier types shared by the whole crate.
//!
//! Addresses come in two flavours that must never be mixed up: a
//! [`ClientAddr`] designates a buffer inside some client's data region,
//! while a [`DriverAddr`] designates a location inside the staging region
//! that the driver transfers to and from. They are distinct types precisely
//! so that handing one to a function expecting the other is a compile-time
//! error; crossing from one space to the other always goes through the
//! [`Platform`] copy hooks.

use core::fmt;

/// Address of a buffer inside a client's data region.
///
/// Only meaningful to the client that owns the region and to the
/// [`Platform`] implementation; the virtualizer itself never dereferences
/// it.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientAddr(pub u64);

/// Address inside the staging region shared with the driver.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DriverAddr(pub u64);

/// A 512-byte sector number on the underlying medium.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Sector(pub u64);

/// Identifier of one attached client. Assigned densely from 0 at start-up
/// and valid for the lifetime of the virtualizer.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct ClientId(pub u32);

/// Identifier of a notification channel, as understood by
/// [`Platform::notify`].
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Channel(pub u32);

impl fmt::Debug for ClientAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ClientAddr({:#x})", self.0)
    }
}

impl fmt::Debug for DriverAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "DriverAddr({:#x})", self.0)
    }
}

impl fmt::Debug for Sector {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Sector({})", self.0)
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "channel#{}", self.0)
    }
}

/// Access to everything the virtualizer needs from its environment.
///
/// The virtualizer is portable across microkernels and hosted test
/// environments; whatever actually delivers notifications and maps the
/// data regions implements this trait. All methods are infallible: by the
/// time the virtualizer invokes them it has already validated the
/// addresses involved, and an environment that can't honour them has a
/// configuration bug, not a runtime error.
pub trait Platform {
    /// Rings a notification channel. The component at the other end will
    /// eventually be scheduled and observe whatever was published before
    /// this call.
    fn notify(&self, channel: Channel);

    /// Copies `len` bytes from a client-owned buffer into the staging
    /// region.
    fn copy_from_client(&self, src: ClientAddr, dst: DriverAddr, len: usize);

    /// Copies `len` bytes from the staging region into a client-owned
    /// buffer.
    fn copy_to_client(&self, src: DriverAddr, dst: ClientAddr, len: usize);

    /// Reads bytes from the staging region into local memory. Used once at
    /// bring-up to fetch the partition table.
    fn read_staging(&self, src: DriverAddr, dst: &mut [u8]);

    /// Writes back any cache lines covering the given staging range, so
    /// that the device observes the data. A no-op on cache-coherent
    /// platforms.
    fn cache_clean(&self, addr: DriverAddr, len: usize);

    /// Invalidates any cache lines covering the given staging range, so
    /// that subsequent reads observe what the device wrote. A no-op on
    /// cache-coherent platforms.
    fn cache_invalidate(&self, addr: DriverAddr, len: usize);
}
