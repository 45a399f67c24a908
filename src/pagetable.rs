// Copyright The Citadel SM Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Sv39 page table geometry and the software walker used while an enclave
//! is being staged.
//!
//! Until `init_enclave` seals an enclave, the monitor owns its page tables:
//! every `load_page_table`/`load_page` call edits them through this module.
//! After sealing, the tables belong to the enclave and the monitor never
//! walks them again.

use crate::dram::{Dram, PhysAddr};
use bitflags::bitflags;

/// Number of address bits that don't undergo translation.
pub const PAGE_SHIFT: u32 = 12;

/// Page size in bytes.
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Number of page table levels. Level 0 holds the leaves.
pub const PAGE_TABLE_LEVELS: usize = 3;

/// Address bits translated by one page table level.
pub const LEVEL_SHIFT: u32 = 9;

/// log2 of the size of a page table entry in bytes.
pub const ENTRY_SHIFT: u32 = 3;

/// Total number of virtual address bits covered by the page table.
pub const TRANSLATED_BITS: u32 = PAGE_SHIFT + PAGE_TABLE_LEVELS as u32 * LEVEL_SHIFT;

bitflags! {
    /// Access control bits of a page table entry.
    ///
    /// The monitor masks caller-supplied ACLs down to the entry's flag bits
    /// and forces `VALID` on when writing an entry during staging.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct PteAcl: u64 {
        /// Entry is present.
        const VALID = 1 << 0;
        /// Readable.
        const READ = 1 << 1;
        /// Writable.
        const WRITE = 1 << 2;
        /// Executable.
        const EXECUTE = 1 << 3;
        /// Accessible to user mode.
        const USER = 1 << 4;
        /// Global mapping.
        const GLOBAL = 1 << 5;
        /// Accessed.
        const ACCESSED = 1 << 6;
        /// Dirty.
        const DIRTY = 1 << 7;
    }
}

/// Mask selecting the bits of an entry that may carry access control flags.
pub const ACL_MASK: u64 = PAGE_SIZE - 1;

/// The size of a page table at any level, in bytes.
pub const fn table_size(_level: usize) -> u64 {
    (1 << LEVEL_SHIFT) << ENTRY_SHIFT
}

/// True if the entry has its valid bit set.
pub const fn entry_is_valid(entry: u64) -> bool {
    entry & PteAcl::VALID.bits() != 0
}

/// The physical destination of an entry: either the next level table or the
/// translated page.
pub const fn entry_target(entry: u64) -> u64 {
    entry & !ACL_MASK
}

/// Builds an entry from a target address and caller-supplied ACL bits.
///
/// Non-ACL bits of `acl` are masked off and the valid bit is forced set, so
/// a caller can never fabricate an entry the walker would misparse.
pub const fn make_entry(target: u64, acl: u64) -> u64 {
    entry_target(target) | (acl & ACL_MASK) | PteAcl::VALID.bits()
}

/// Walks the tables rooted at `ptb` and returns the address of the entry
/// for `virtual_addr` at `level`.
///
/// `level` must be below [`PAGE_TABLE_LEVELS`]. Returns `None` if the walk
/// hits an invalid intermediate entry, or if `ptb` itself is unset. All
/// tables reached from `ptb` must be accessible DRAM; this only holds
/// before the enclave is initialised, while the monitor controls what has
/// been loaded.
pub fn walk_to_entry(dram: &Dram, ptb: u64, virtual_addr: u64, level: usize) -> Option<PhysAddr> {
    if ptb == 0 {
        return None;
    }

    let mut addr_shift = TRANSLATED_BITS;
    let mut table_addr = ptb;
    let mut walk_level = PAGE_TABLE_LEVELS;
    loop {
        walk_level -= 1;
        addr_shift -= LEVEL_SHIFT;
        let entry_offset = (virtual_addr >> addr_shift) & ((1 << LEVEL_SHIFT) - 1);
        let entry_addr = PhysAddr::new(table_addr + (entry_offset << ENTRY_SHIFT));
        if walk_level == level {
            return Some(entry_addr);
        }
        let entry = dram.read_word(entry_addr);
        if !entry_is_valid(entry) {
            return None;
        }
        table_addr = entry_target(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_codec() {
        let entry = make_entry(0x8007_1000, PteAcl::READ.bits() | PteAcl::EXECUTE.bits());
        assert!(entry_is_valid(entry));
        assert_eq!(entry_target(entry), 0x8007_1000);
        assert_eq!(entry & ACL_MASK, 0b1011);
    }

    #[test]
    fn acl_cannot_redirect_target() {
        // ACL bits above the page offset must not survive into the entry.
        let entry = make_entry(0x8007_1000, u64::MAX);
        assert_eq!(entry_target(entry), 0x8007_1000);
    }

    #[test]
    fn geometry() {
        assert_eq!(TRANSLATED_BITS, 39);
        assert_eq!(table_size(0), PAGE_SIZE);
    }
}
