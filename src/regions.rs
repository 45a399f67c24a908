// Copyright The Citadel SM Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! The DRAM region manager.
//!
//! Owns the region table and everything that moves regions between owners:
//! assignment, blocking, the generation-clock free protocol, the DMA fence,
//! and metadata region creation. Every mutation happens under the region's
//! try-lock; when a second region must be locked the target is always taken
//! first, and any contention unwinds completely and reports
//! `ConcurrentCall` so the caller can retry.

use crate::{
    api::{MonitorError, MonitorResult, RegionStateTag},
    dram::PhysAddr,
    enclave::EnclaveId,
    hardware::HardwareOps,
    monitor::Monitor,
    sync::TryLock,
};
use core::sync::atomic::{AtomicU64, Ordering};

/// Owner word for regions held by the OS.
pub const OWNER_OS: u64 = 0;
/// Owner word for blocked regions awaiting TLB-flush confirmation.
pub const OWNER_BLOCKED: u64 = 1;
/// Owner word for regions holding monitor metadata.
pub const OWNER_METADATA: u64 = 2;
/// Owner word for unowned regions.
pub const OWNER_FREE: u64 = 3;

/// A typed view of a region's owner word.
///
/// Enclave metadata addresses are page-aligned, which leaves the low bits
/// free for the special owner values.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegionOwner {
    /// Owned by the operating system.
    Os,
    /// Blocked; not yet safe to reuse.
    Blocked,
    /// Holds monitor metadata.
    Metadata,
    /// Unowned.
    Free,
    /// Owned by the enclave with this metadata address.
    Enclave(EnclaveId),
}

impl RegionOwner {
    /// Decodes an owner word.
    pub fn from_raw(raw: u64) -> Self {
        match raw {
            OWNER_OS => Self::Os,
            OWNER_BLOCKED => Self::Blocked,
            OWNER_METADATA => Self::Metadata,
            OWNER_FREE => Self::Free,
            id => Self::Enclave(EnclaveId(id)),
        }
    }
}

/// One entry of the region table.
///
/// All fields except the lock are guarded by it; `blocked_at` is compared
/// against per-core flush clocks that other cores publish with release
/// stores.
pub struct RegionInfo {
    lock: TryLock,
    owner: AtomicU64,
    previous_owner: AtomicU64,
    pinned_pages: AtomicU64,
    blocked_at: AtomicU64,
}

impl RegionInfo {
    /// An unowned region.
    pub fn free() -> Self {
        Self::with_owner(OWNER_FREE)
    }

    /// A region starting life with the given owner word.
    pub fn with_owner(owner: u64) -> Self {
        Self {
            lock: TryLock::new(),
            owner: AtomicU64::new(owner),
            previous_owner: AtomicU64::new(OWNER_OS),
            pinned_pages: AtomicU64::new(0),
            blocked_at: AtomicU64::new(0),
        }
    }
}

/// Exclusive access to one region's bookkeeping, released on drop.
pub struct RegionGuard<'m> {
    region: &'m RegionInfo,
    index: usize,
}

impl RegionGuard<'_> {
    /// The guarded region's index.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The raw owner word.
    pub fn owner_raw(&self) -> u64 {
        self.region.owner.load(Ordering::Relaxed)
    }

    /// The decoded owner.
    pub fn owner(&self) -> RegionOwner {
        RegionOwner::from_raw(self.owner_raw())
    }

    pub(crate) fn set_owner_raw(&self, owner: u64) {
        self.region.owner.store(owner, Ordering::Relaxed);
    }

    pub(crate) fn set_previous_owner(&self, owner: u64) {
        self.region.previous_owner.store(owner, Ordering::Relaxed);
    }

    /// Number of metadata pages of this region currently in live use.
    pub fn pinned_pages(&self) -> u64 {
        self.region.pinned_pages.load(Ordering::Relaxed)
    }

    pub(crate) fn add_pinned_pages(&self, count: u64) {
        self.region.pinned_pages.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn sub_pinned_pages(&self, count: u64) {
        self.region.pinned_pages.fetch_sub(count, Ordering::Relaxed);
    }

    pub(crate) fn set_pinned_pages(&self, count: u64) {
        self.region.pinned_pages.store(count, Ordering::Relaxed);
    }

    /// The generation stamp taken when this region was blocked.
    pub fn blocked_at(&self) -> u64 {
        self.region.blocked_at.load(Ordering::Relaxed)
    }

    pub(crate) fn set_blocked_at(&self, stamp: u64) {
        self.region.blocked_at.store(stamp, Ordering::Relaxed);
    }
}

impl Drop for RegionGuard<'_> {
    fn drop(&mut self) {
        self.region.lock.release();
    }
}

impl<H: HardwareOps> Monitor<H> {
    /// Acquires a region's lock without blocking, or reports contention.
    pub(crate) fn try_lock_region(&self, index: usize) -> MonitorResult<RegionGuard<'_>> {
        let region = &self.regions[index];
        if region.lock.try_acquire() {
            Ok(RegionGuard { region, index })
        } else {
            Err(MonitorError::ConcurrentCall)
        }
    }

    /// Reports the state of a DRAM region without blocking.
    ///
    /// Returns `Locked` on lock contention; the caller retries if it wants
    /// an authoritative answer.
    pub fn dram_region_state(&self, region: usize) -> RegionStateTag {
        if !self.geometry.is_valid_region(region) {
            return RegionStateTag::Invalid;
        }
        let Ok(guard) = self.try_lock_region(region) else {
            return RegionStateTag::Locked;
        };
        match guard.owner() {
            RegionOwner::Free => RegionStateTag::Free,
            RegionOwner::Blocked => RegionStateTag::Blocked,
            RegionOwner::Os | RegionOwner::Metadata | RegionOwner::Enclave(_) => {
                RegionStateTag::Owned
            }
        }
    }

    /// Reports the owner word of a region, or 0 for blocked and free
    /// regions as well as on lock contention.
    pub fn dram_region_owner(&self, region: usize) -> u64 {
        if !self.geometry.is_valid_region(region) {
            return OWNER_OS;
        }
        let Ok(guard) = self.try_lock_region(region) else {
            return OWNER_OS;
        };
        match guard.owner_raw() {
            OWNER_BLOCKED | OWNER_FREE => OWNER_OS,
            owner => owner,
        }
    }

    /// Gives a free region to a new owner: the OS, or an enclave named by
    /// its metadata address.
    pub fn assign_dram_region(&self, region: usize, new_owner: u64) -> MonitorResult {
        if !self.geometry.is_valid_region(region) {
            return Err(MonitorError::InvalidValue);
        }
        let guard = self.try_lock_region(region)?;
        if guard.owner_raw() != OWNER_FREE {
            return Err(MonitorError::InvalidState);
        }

        // The new owner's bookkeeping region: region 0 for the OS, the
        // metadata region holding the EnclaveInfo otherwise. If it collides
        // with the target the second acquisition fails and the caller sees
        // ConcurrentCall; over-conservative but harmless.
        let owner_region = self
            .geometry
            .clamped_region_for(PhysAddr::new(new_owner));
        let owner_guard = self.try_lock_region(owner_region)?;

        if new_owner == OWNER_OS {
            guard.set_owner_raw(OWNER_OS);
            self.os_bitmap_set(region, true);
            self.apply_os_bitmap();
        } else {
            if owner_guard.owner_raw() != OWNER_METADATA {
                return Err(MonitorError::InvalidValue);
            }
            let id = self.checked_enclave_id(new_owner)?;
            guard.set_owner_raw(new_owner);
            self.set_enclave_bitmap_bit(id, region, true);
            // SAFETY: `checked_enclave_id` verified the metadata map entry
            // under the metadata region lock we hold, so a live EnclaveInfo
            // sits at this address.
            let info = unsafe { self.enclave_info_unchecked(id) };
            info.add_dram_region();
            // This is an OS call, so no enclave region bitmap is live in
            // the page walker; nothing to reprogram.
        }
        Ok(())
    }

    /// Blocks a region so it can later be freed. Only the current owner
    /// may block, and the region must not back pinned metadata or overlap
    /// the DMA range.
    pub fn block_dram_region(&self, region: usize) -> MonitorResult {
        if !self.geometry.is_dynamic_region(region) {
            return Err(MonitorError::InvalidValue);
        }
        let guard = self.try_lock_region(region)?;

        let owner_raw = guard.owner_raw();
        if owner_raw != self.caller_owner_raw() {
            return Err(MonitorError::AccessDenied);
        }
        if guard.pinned_pages() != 0 {
            return Err(MonitorError::InvalidState);
        }

        // The owner's bookkeeping region is always distinct from the
        // target: region 0 is never dynamic, and an enclave's metadata
        // region is pinned and so never reaches this point as the target.
        let owner_region = self
            .geometry
            .clamped_region_for(PhysAddr::new(owner_raw));
        let _owner_guard = self.try_lock_region(owner_region)?;

        if owner_raw == OWNER_OS && self.dma_overlaps_region(region) {
            return Err(MonitorError::InvalidState);
        }

        guard.set_previous_owner(owner_raw);
        guard.set_owner_raw(OWNER_BLOCKED);
        let stamp = self.block_clock.fetch_add(1, Ordering::AcqRel) + 1;
        guard.set_blocked_at(stamp);

        if owner_raw == OWNER_OS {
            self.os_bitmap_set(region, false);
            self.apply_os_bitmap();
        } else {
            let id = EnclaveId(owner_raw);
            self.set_enclave_bitmap_bit(id, region, false);
            // SAFETY: The caller is this enclave, so its metadata pages are
            // pinned while it runs.
            let info = unsafe { self.enclave_info_unchecked(id) };
            info.sub_dram_region();
            // The caller is the running enclave, so its bitmap is live in
            // the page walker and must stop matching the blocked region.
            self.apply_enclave_bitmap(id);
        }
        Ok(())
    }

    /// Returns a blocked region to the free pool once every core has
    /// flushed its TLB past the blocking stamp. Metadata regions are freed
    /// directly once nothing in them is pinned.
    pub fn free_dram_region(&self, region: usize) -> MonitorResult {
        if !self.geometry.is_valid_region(region) {
            return Err(MonitorError::InvalidValue);
        }
        let guard = self.try_lock_region(region)?;

        match guard.owner_raw() {
            OWNER_BLOCKED => {
                let blocked_at = guard.blocked_at();
                // Mappings of the region must have been flushed everywhere:
                // a core that has not advanced past the blocking stamp may
                // still hold a live TLB entry into this region.
                for core in &self.cores {
                    if core.flushed_at.load(Ordering::Acquire) < blocked_at {
                        return Err(MonitorError::InvalidState);
                    }
                }
                guard.set_owner_raw(OWNER_FREE);
                guard.set_blocked_at(0);
                Ok(())
            }
            OWNER_METADATA => {
                // Metadata regions never have TLB mappings; they only need
                // to be empty of live metadata.
                if guard.pinned_pages() != 0 {
                    return Err(MonitorError::InvalidState);
                }
                guard.set_owner_raw(OWNER_FREE);
                Ok(())
            }
            _ => Err(MonitorError::InvalidState),
        }
    }

    /// Flushes the calling core's TLB and publishes the generation stamp,
    /// unblocking frees of regions blocked before the stamp.
    pub fn flush_cached_dram_regions(&self) {
        self.hw.flush_tlbs();
        // The counter must advance only after the flush: the moment it
        // does, a blocked region may be freed and handed to someone else.
        let clock = self.block_clock.load(Ordering::Acquire);
        self.core_state().flushed_at.store(clock, Ordering::Release);
    }

    /// Turns a free region into a metadata region with an empty page map.
    pub fn create_metadata_region(&self, region: usize) -> MonitorResult {
        if !self.geometry.is_valid_region(region) {
            return Err(MonitorError::InvalidValue);
        }
        let guard = self.try_lock_region(region)?;
        if guard.owner_raw() != OWNER_FREE {
            return Err(MonitorError::InvalidState);
        }

        guard.set_owner_raw(OWNER_METADATA);
        guard.set_pinned_pages(0);
        self.dram.zero(
            self.geometry.region_start(region),
            self.geometry.metadata_region_start << crate::pagetable::PAGE_SHIFT,
        );
        Ok(())
    }

    /// Enclave query: does the calling enclave own this region?
    pub fn dram_region_check_ownership(&self, region: usize) -> MonitorResult {
        if !self.geometry.is_dynamic_region(region) {
            return Err(MonitorError::InvalidValue);
        }
        let guard = self.try_lock_region(region)?;
        if guard.owner_raw() == self.caller_owner_raw() {
            Ok(())
        } else {
            Err(MonitorError::InvalidState)
        }
    }

    /// Reprograms the DMA fence. Every stripe the new range touches must
    /// currently belong to the OS.
    pub fn set_dma_range(&self, base: u64, mask: u64) -> MonitorResult {
        if !crate::bits::is_valid_range(base, mask) {
            return Err(MonitorError::InvalidValue);
        }
        // The base is size-aligned, so base | mask is the last byte.
        if !self.geometry.is_dram_address(PhysAddr::new(base))
            || !self.geometry.is_dram_address(PhysAddr::new(base | mask))
        {
            return Err(MonitorError::InvalidValue);
        }

        // Region 0's lock is what serialises changes to the set of
        // OS-owned regions, so holding it pins that set while we scan.
        let guard0 = self.try_lock_region(0)?;

        let range_end = (base | mask) + 1;
        let mut addr = base;
        while addr < range_end {
            self.check_os_owns_stripe(&guard0, PhysAddr::new(addr))?;
            addr += self.geometry.stripe_size;
        }
        self.check_os_owns_stripe(&guard0, PhysAddr::new(range_end - 1))?;

        self.dma_range_start.store(base, Ordering::Relaxed);
        self.dma_range_end.store(range_end, Ordering::Relaxed);
        self.hw.set_dmar_base(base);
        // The hardware register stores the mask negated; it simplifies the
        // fence comparison.
        self.hw.set_dmar_mask(!mask);
        Ok(())
    }

    /// Checks that the stripe containing `addr` belongs to an OS region.
    ///
    /// Each region lock is dropped right after its check instead of being
    /// accumulated: region 0's lock is held throughout, which is enough to
    /// keep regions from joining or leaving the OS-owned set.
    fn check_os_owns_stripe(&self, guard0: &RegionGuard, addr: PhysAddr) -> MonitorResult {
        let region = self.geometry.region_for(addr);
        let owner = if region == 0 {
            guard0.owner_raw()
        } else {
            self.try_lock_region(region)?.owner_raw()
        };
        if owner == OWNER_OS {
            Ok(())
        } else {
            Err(MonitorError::InvalidState)
        }
    }

    /// True if any stripe of `region` falls inside the active DMA range.
    fn dma_overlaps_region(&self, region: usize) -> bool {
        let start = self.dma_range_start.load(Ordering::Relaxed);
        let end = self.dma_range_end.load(Ordering::Relaxed);
        if start >= end {
            return false;
        }
        let mut addr = start;
        while addr < end {
            if self.geometry.region_for(PhysAddr::new(addr)) == region {
                return true;
            }
            addr += self.geometry.stripe_size;
        }
        self.geometry.region_for(PhysAddr::new(end - 1)) == region
    }
}
