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

//! Decoding of the master boot record found in sector 0 of the device.
//!
//! The layout is the classic one: 446 bytes of boot code (ignored), four
//! 16-byte partition entries, and the `0xAA55` signature in the last two
//! bytes of the sector. Each entry carries a status byte and legacy CHS
//! coordinates, none of which matter here; only the type byte (`0x00`
//! marks an unused entry), the little-endian 32-bit start LBA and the
//! little-endian 32-bit sector count are read.
//!
//! Partition assignment happens once, at bring-up, and its failure modes
//! are all boot-fatal: a bad signature, fewer usable partitions than
//! attached clients, or a partition that doesn't start on a transfer-unit
//! boundary each leave the virtualizer unable to serve anyone.

use alloc::vec::Vec;

use crate::platform::Sector;

/// Size in bytes of one sector of the medium, and of the boot record
/// itself.
pub const SECTOR_SIZE: usize = 512;

const MAX_PRIMARY_PARTITIONS: usize = 4;
const PARTITIONS_OFFSET: usize = 446;
const ENTRY_SIZE: usize = 16;
const SIGNATURE_OFFSET: usize = 510;
const SIGNATURE: u16 = 0xaa55;
const ENTRY_TYPE_EMPTY: u8 = 0x00;

/// A contiguous sector range assigned to one client.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Partition {
    /// First sector of the partition.
    pub lba_start: Sector,
    /// Length of the partition in sectors.
    pub sectors: u64,
}

/// Why partition assignment failed. All of these are boot-fatal.
#[derive(Debug, Copy, Clone, PartialEq, Eq, derive_more::Display)]
pub enum PartitionError {
    /// The sector doesn't end in the boot record signature; whatever is on
    /// the medium, it isn't a partition table.
    #[display(fmt = "invalid boot record signature: {:#06x}", found)]
    InvalidSignature { found: u16 },
    /// The table holds fewer usable partitions than there are clients to
    /// serve.
    #[display(fmt = "only {} usable partition(s) for {} client(s)", usable, clients)]
    NotEnoughPartitions { usable: usize, clients: usize },
    /// An assigned partition doesn't start on a transfer-unit boundary,
    /// which would break the unit-granular address translation.
    #[display(fmt = "partition entry {} starts at unaligned sector {}", entry, "lba_start.0")]
    Misaligned { entry: usize, lba_start: Sector },
}

/// Decodes the boot record and picks one partition per client.
///
/// Empty entries are skipped; the remaining ones are assigned to clients
/// in table order. `sectors_per_unit` is the transfer-unit size expressed
/// in sectors; every assigned partition must start at a multiple of it.
pub fn assign_partitions(
    sector: &[u8; SECTOR_SIZE],
    num_clients: usize,
    sectors_per_unit: u64,
) -> Result<Vec<Partition>, PartitionError> {
    debug_assert!(sectors_per_unit >= 1);

    let found = u16::from_le_bytes([sector[SIGNATURE_OFFSET], sector[SIGNATURE_OFFSET + 1]]);
    if found != SIGNATURE {
        return Err(PartitionError::InvalidSignature { found });
    }

    let mut assigned = Vec::with_capacity(num_clients);
    let mut usable = 0;
    for entry in 0..MAX_PRIMARY_PARTITIONS {
        let off = PARTITIONS_OFFSET + entry * ENTRY_SIZE;
        if sector[off + 4] == ENTRY_TYPE_EMPTY {
            continue;
        }
        usable += 1;
        if assigned.len() == num_clients {
            continue;
        }

        let lba_start = u32::from_le_bytes([
            sector[off + 8],
            sector[off + 9],
            sector[off + 10],
            sector[off + 11],
        ]);
        let sectors = u32::from_le_bytes([
            sector[off + 12],
            sector[off + 13],
            sector[off + 14],
            sector[off + 15],
        ]);

        if u64::from(lba_start) % sectors_per_unit != 0 {
            return Err(PartitionError::Misaligned {
                entry,
                lba_start: Sector(u64::from(lba_start)),
            });
        }

        assigned.push(Partition {
            lba_start: Sector(u64::from(lba_start)),
            sectors: u64::from(sectors),
        });
    }

    if usable < num_clients {
        return Err(PartitionError::NotEnoughPartitions {
            usable,
            clients: num_clients,
        });
    }

    Ok(assigned)
}
