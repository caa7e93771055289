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

//! Allocator of transfer buffers inside the staging region.
//!
//! The staging region is a single physically-contiguous area, owned by the
//! virtualizer and visible to the driver, divided into fixed-size *transfer
//! units*. Requests are staged in contiguous runs of units; a bitmap tracks
//! which units are taken.
//!
//! Allocation is all-or-nothing: either a full run of the requested length
//! is carved out, or the pool is left exactly as it was. A first-fit scan
//! starts from a cursor that advances past each successful allocation and
//! wraps around, which spreads allocations over the region instead of
//! hammering its start.

use alloc::boxed::Box;
use alloc::vec;

use crate::platform::DriverAddr;

/// Returned by [`BufferPool::alloc`] when no contiguous run of the
/// requested length is free.
#[derive(Debug, Copy, Clone, PartialEq, Eq, derive_more::Display)]
#[display(fmt = "no contiguous run of transfer units available")]
pub struct PoolExhausted;

/// Bitmap allocator over the staging region.
pub struct BufferPool {
    /// Address of the first transfer unit.
    base: DriverAddr,
    /// Size in bytes of one transfer unit.
    unit_size: u32,
    /// Total number of units in the region.
    units: usize,
    /// One bit per unit; a set bit means the unit is taken.
    words: Box<[u64]>,
    /// Unit index where the next scan starts.
    cursor: usize,
    /// Number of units currently free.
    available: usize,
}

impl BufferPool {
    /// Builds a pool over a staging region of `units` transfer units of
    /// `unit_size` bytes each, starting at `base`.
    ///
    /// # Panic
    ///
    /// Panics if the region is empty.
    pub fn new(base: DriverAddr, unit_size: u32, units: usize) -> BufferPool {
        assert!(units >= 1);
        assert!(unit_size >= 1);
        let num_words = (units + 63) / 64;
        BufferPool {
            base,
            unit_size,
            units,
            words: vec![0u64; num_words].into_boxed_slice(),
            cursor: 0,
            available: units,
        }
    }

    /// Size in bytes of one transfer unit.
    pub fn unit_size(&self) -> u32 {
        self.unit_size
    }

    /// Number of units currently free. Not necessarily contiguous.
    pub fn available(&self) -> usize {
        self.available
    }

    /// True if [`alloc`](BufferPool::alloc) would fail for a run of
    /// `count` units.
    pub fn is_full(&self, count: u16) -> bool {
        self.find_run(usize::from(count)).is_none()
    }

    /// Carves out a contiguous run of `count` units and returns the
    /// address of its first byte. On failure the pool is left untouched.
    pub fn alloc(&mut self, count: u16) -> Result<DriverAddr, PoolExhausted> {
        let count = usize::from(count);
        debug_assert!(count >= 1);
        let start = self.find_run(count).ok_or(PoolExhausted)?;
        for unit in start..start + count {
            self.set_taken(unit);
        }
        self.available -= count;
        self.cursor = (start + count) % self.units;
        Ok(DriverAddr(
            self.base.0 + start as u64 * u64::from(self.unit_size),
        ))
    }

    /// Returns a run previously obtained from [`alloc`](BufferPool::alloc).
    ///
    /// # Panic
    ///
    /// Panics if the run is not inside the region or contains units that
    /// are not currently taken; either means the caller's bookkeeping has
    /// diverged from the pool's, which is not recoverable.
    pub fn free(&mut self, addr: DriverAddr, count: u16) {
        let count = usize::from(count);
        let offset = addr.0.checked_sub(self.base.0).expect("run below the pool base");
        assert_eq!(offset % u64::from(self.unit_size), 0);
        let start = (offset / u64::from(self.unit_size)) as usize;
        assert!(start + count <= self.units);
        for unit in start..start + count {
            assert!(self.is_taken(unit));
            self.set_free(unit);
        }
        self.available += count;
    }

    /// First-fit scan for `count` contiguous free units, starting at the
    /// cursor and wrapping around once. Runs never straddle the end of the
    /// region.
    fn find_run(&self, count: usize) -> Option<usize> {
        if count == 0 || count > self.available {
            return None;
        }
        let starts = (self.cursor..self.units).chain(0..self.cursor);
        'candidates: for start in starts {
            if start + count > self.units {
                continue;
            }
            for unit in start..start + count {
                if self.is_taken(unit) {
                    continue 'candidates;
                }
            }
            return Some(start);
        }
        None
    }

    fn is_taken(&self, unit: usize) -> bool {
        self.words[unit / 64] & (1u64 << (unit % 64)) != 0
    }

    fn set_taken(&mut self, unit: usize) {
        self.words[unit / 64] |= 1u64 << (unit % 64);
    }

    fn set_free(&mut self, unit: usize) {
        self.words[unit / 64] &= !(1u64 << (unit % 64));
    }
}
