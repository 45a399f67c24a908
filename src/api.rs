// Copyright The Citadel SM Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Types and constants of the monitor calling convention.
//!
//! Calls reach the monitor through an environment call from S-mode (the OS
//! surface) or from enclave user mode (the enclave surface). The function
//! identifier travels in the first argument register, the operands in the
//! following ones, and every call produces a single return word.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// The return word for a call that completed with full effect.
pub const MONITOR_OK: u64 = 0;

/// The error half of the monitor call ABI.
///
/// The discriminants are the exact words written back to the caller, and are
/// part of the attestation-compatible ABI. They are deliberately distinct
/// from POSIX error numbers.
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u64)]
pub enum MonitorError {
    /// An argument failed a static precondition (alignment, range, enum
    /// domain). Caller bug.
    InvalidValue = 1,
    /// The operation is not allowed in the current state of the target.
    InvalidState = 2,
    /// The caller does not own the target of the operation.
    AccessDenied = 3,
    /// Structurally impossible in this build of the monitor.
    Unsupported = 4,
    /// A required lock was held by another core. Transient; retry.
    ConcurrentCall = 5,
}

/// Result type used by every fallible monitor operation.
///
/// A call that returns `Err` has had no observable effect.
pub type MonitorResult<T = ()> = Result<T, MonitorError>;

/// Collapses a result into the single return word of the call ABI.
pub fn result_word(result: MonitorResult) -> u64 {
    match result {
        Ok(()) => MONITOR_OK,
        Err(error) => error.into(),
    }
}

/// The externally visible state of a DRAM region.
///
/// `dram_region_state` returns these tags directly instead of an error word;
/// `Locked` reports transient lock contention without blocking the caller.
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoPrimitive)]
#[repr(u64)]
pub enum RegionStateTag {
    /// The region index is out of range.
    Invalid = 0,
    /// The region is not owned by anyone and can be assigned.
    Free = 1,
    /// The region is blocked and awaiting TLB-flush confirmation.
    Blocked = 2,
    /// The region is owned by the OS, an enclave, or the monitor's metadata.
    Owned = 3,
    /// The region's lock was held; retry for an authoritative answer.
    Locked = 4,
}

/// Identifiers for the attestation fields baked into the monitor at boot.
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u64)]
pub enum SmField {
    /// The device public key (32 bytes).
    DevicePublicKey = 0,
    /// The measurement of the security monitor itself (64 bytes).
    SmMeasurement = 1,
    /// The monitor public key (32 bytes).
    SmPublicKey = 2,
    /// The device's signature over the monitor (64 bytes).
    DeviceSignature = 3,
}

impl SmField {
    /// The exact size of the field, in bytes. Caller buffers must be at
    /// least this large.
    pub fn size(self) -> usize {
        match self {
            Self::DevicePublicKey | Self::SmPublicKey => 32,
            Self::SmMeasurement | Self::DeviceSignature => 64,
        }
    }
}

/// Function identifiers on the OS call surface.
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u64)]
pub enum OsCall {
    /// `set_dma_range(base, mask)`
    SetDmaRange = 0x100,
    /// `dram_region_state(region)`
    DramRegionState = 0x101,
    /// `dram_region_owner(region)`
    DramRegionOwner = 0x102,
    /// `assign_dram_region(region, new_owner)`
    AssignDramRegion = 0x103,
    /// `free_dram_region(region)`
    FreeDramRegion = 0x104,
    /// `flush_cached_dram_regions()`
    FlushCachedDramRegions = 0x105,
    /// `create_metadata_region(region)`
    CreateMetadataRegion = 0x106,
    /// `metadata_region_pages()`
    MetadataRegionPages = 0x107,
    /// `metadata_region_start()`
    MetadataRegionStart = 0x108,
    /// `thread_metadata_pages()`
    ThreadMetadataPages = 0x109,
    /// `enclave_metadata_pages(mailbox_count)`
    EnclaveMetadataPages = 0x10a,
    /// `block_dram_region(region)`; the owner check makes this safe to
    /// expose to the OS as well as to enclaves
    BlockDramRegion = 0x10b,
    /// `create_enclave(id, ev_base, ev_mask, mailbox_count, debug)`
    CreateEnclave = 0x110,
    /// `load_page_table(id, phys, virt, level, acl)`
    LoadPageTable = 0x111,
    /// `load_page(id, phys, virt, os_addr, acl)`
    LoadPage = 0x112,
    /// `load_thread(id, thread, entry_pc, entry_sp, fault_pc, fault_sp)`
    LoadThread = 0x113,
    /// `assign_thread(id, thread)`
    AssignThread = 0x114,
    /// `init_enclave(id)`
    InitEnclave = 0x115,
    /// `enter_enclave(id, thread)`
    EnterEnclave = 0x116,
    /// `delete_thread(id, thread)`
    DeleteThread = 0x117,
    /// `delete_enclave(id)`
    DeleteEnclave = 0x118,
    /// `copy_debug_enclave_page(id, enclave_addr, os_addr, read_from_enclave)`
    CopyDebugEnclavePage = 0x119,
    /// `fetch_field(field, out_addr, out_len)`
    FetchField = 0x120,
}

/// Function identifiers on the enclave call surface.
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u64)]
pub enum EnclaveCall {
    /// `block_dram_region(region)`
    BlockDramRegion = 0x200,
    /// `dram_region_check_ownership(region)`
    DramRegionCheckOwnership = 0x201,
    /// `accept_thread(thread, init_info_addr)`
    AcceptThread = 0x202,
    /// `exit_enclave()`
    ExitEnclave = 0x203,
    /// `get_attestation_key(out_addr)`
    GetAttestationKey = 0x204,
    /// `accept_message(mailbox, sender_id)`
    AcceptMessage = 0x205,
    /// `read_message(mailbox, out_addr)`
    ReadMessage = 0x206,
    /// `send_message(dest_id, mailbox, msg_addr)`
    SendMessage = 0x207,
    /// `fetch_field(field, out_addr, out_len)`
    FetchField = 0x208,
}

/// The execution context captured by the trap entry code when a lower
/// privilege level calls into the monitor.
///
/// The trap glue saves the caller's registers into this layout before
/// dispatching, and restores from it on the way out. `enter_enclave` stashes
/// it in the target thread so that `exit_enclave` can resume the caller.
#[derive(Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct ExecState {
    /// Program counter to resume at.
    pub pc: u64,
    /// Stack pointer.
    pub stack: u64,
    /// The remaining general purpose registers, x1-x13 and x15-x31.
    pub gprs: [u64; 29],
}

impl ExecState {
    /// An all-zero execution state.
    pub const EMPTY: Self = Self {
        pc: 0,
        stack: 0,
        gprs: [0; 29],
    };
}

/// Thread initialisation parameters read from an enclave-owned page by
/// `accept_thread`.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct ThreadInitInfo {
    /// Virtual address of the thread's entry point.
    pub entry_pc: u64,
    /// Virtual address of the thread's stack top.
    pub entry_stack: u64,
    /// Virtual address of the thread's fault handler.
    pub fault_pc: u64,
    /// Virtual address of the fault handler's stack top.
    pub fault_stack: u64,
    /// Page table base the thread will run with.
    pub eptbr: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_words_are_stable() {
        assert_eq!(u64::from(MonitorError::InvalidValue), 1);
        assert_eq!(u64::from(MonitorError::InvalidState), 2);
        assert_eq!(u64::from(MonitorError::AccessDenied), 3);
        assert_eq!(u64::from(MonitorError::Unsupported), 4);
        assert_eq!(u64::from(MonitorError::ConcurrentCall), 5);
    }

    #[test]
    fn result_word_collapses() {
        assert_eq!(result_word(Ok(())), MONITOR_OK);
        assert_eq!(result_word(Err(MonitorError::ConcurrentCall)), 5);
    }

    #[test]
    fn field_sizes() {
        assert_eq!(SmField::DevicePublicKey.size(), 32);
        assert_eq!(SmField::SmMeasurement.size(), 64);
        assert!(SmField::try_from(9u64).is_err());
    }
}
