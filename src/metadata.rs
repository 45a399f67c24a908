// Copyright The Citadel SM Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Metadata regions: page-granular allocation of the monitor's own
//! bookkeeping structures.
//!
//! A metadata region is a DRAM region dedicated to EnclaveInfo and
//! ThreadInfo storage, so the monitor can manage enclaves without touching
//! their LLC lines. Its first pages hold a flat map with one word per page
//! of the region; each word packs the owning enclave's (page-aligned)
//! metadata address with a two-bit page type. The map is what makes a
//! caller-supplied "enclave id" checkable: an id is only accepted if its
//! map entry says an EnclaveInfo begins there.

use crate::{
    api::{MonitorError, MonitorResult},
    dram::PhysAddr,
    enclave::{EnclaveGuard, EnclaveId, EnclaveInfo},
    hardware::HardwareOps,
    monitor::Monitor,
    regions::{OWNER_METADATA, RegionGuard},
};

/// The data type stored in a metadata page, packed into the low bits of a
/// map entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u64)]
pub enum MetadataPageType {
    /// Unused, or granted to an enclave but not yet accepted.
    Empty = 0,
    /// A continuation page of a multi-page structure.
    Inner = 1,
    /// First page of an `EnclaveInfo`.
    Enclave = 2,
    /// First page of a `ThreadInfo`.
    Thread = 3,
}

/// Packs a map entry from an owner address and a page type. Works because
/// owner addresses are page-aligned, leaving the low bits free.
pub const fn page_info(owner: u64, page_type: MetadataPageType) -> u64 {
    owner | page_type as u64
}

impl<H: HardwareOps> Monitor<H> {
    /// Total metadata pages a region can hold, map included.
    pub fn metadata_region_pages(&self) -> u64 {
        self.geometry.metadata_region_pages
    }

    /// Index of the first allocatable page of a metadata region.
    pub fn metadata_region_start(&self) -> u64 {
        self.geometry.metadata_region_start
    }

    /// The address of the map entry covering `addr`.
    fn metadata_entry_addr(&self, addr: PhysAddr) -> PhysAddr {
        let region_start = self.geometry.region_start(self.geometry.region_for(addr));
        region_start.add(self.geometry.region_page_for(addr) * size_of::<u64>() as u64)
    }

    pub(crate) fn read_metadata_entry(&self, addr: PhysAddr) -> u64 {
        self.dram.read_word(self.metadata_entry_addr(addr))
    }

    fn write_metadata_entry(&self, addr: PhysAddr, entry: u64) {
        self.dram.write_word(self.metadata_entry_addr(addr), entry);
    }

    /// Locks the metadata region containing `addr`.
    ///
    /// This is the gate in front of every metadata operation: the address
    /// must be a page-aligned DRAM address and its region must actually be
    /// a metadata region. The returned guard keeps the region's map stable.
    pub(crate) fn lock_metadata_region_for(
        &self,
        addr: PhysAddr,
    ) -> MonitorResult<RegionGuard<'_>> {
        if !addr.is_page_aligned() || !self.geometry.is_dram_address(addr) {
            return Err(MonitorError::InvalidValue);
        }
        let guard = self.try_lock_region(self.geometry.region_for(addr))?;
        if guard.owner_raw() != OWNER_METADATA {
            return Err(MonitorError::InvalidState);
        }
        Ok(guard)
    }

    /// Writes `page_count` map entries starting at `addr`, requiring every
    /// existing entry to equal `expected`. The first page gets
    /// `(owner, page_type)`, the continuation pages `(owner, Inner)`.
    ///
    /// The caller holds the metadata region's lock and keeps it until the
    /// structure behind the pages is fully initialised.
    fn assign_metadata_pages(
        &self,
        addr: PhysAddr,
        page_count: u64,
        owner: EnclaveId,
        page_type: MetadataPageType,
        expected: u64,
    ) -> MonitorResult {
        self.check_metadata_run(addr, page_count)?;
        let entry_addr = self.metadata_entry_addr(addr);
        for i in 0..page_count {
            let word_addr = entry_addr.add(i * size_of::<u64>() as u64);
            if self.dram.read_word(word_addr) != expected {
                return Err(MonitorError::InvalidState);
            }
        }
        self.write_metadata_entry(addr, page_info(owner.0, page_type));
        for i in 1..page_count {
            let word_addr = entry_addr.add(i * size_of::<u64>() as u64);
            self.dram
                .write_word(word_addr, page_info(owner.0, MetadataPageType::Inner));
        }
        Ok(())
    }

    /// A metadata allocation must stay inside one stripe and inside the
    /// allocatable window of the region (the map itself is off limits).
    fn check_metadata_run(&self, addr: PhysAddr, page_count: u64) -> MonitorResult {
        if page_count == 0
            || self.geometry.stripe_page_for(addr) + page_count > self.geometry.stripe_pages
        {
            return Err(MonitorError::InvalidValue);
        }
        let first_page = self.geometry.region_page_for(addr);
        if first_page < self.geometry.metadata_region_start
            || first_page + page_count > self.geometry.metadata_region_pages
        {
            return Err(MonitorError::InvalidValue);
        }
        Ok(())
    }

    /// Claims free pages for a new metadata structure.
    pub(crate) fn reserve_metadata_pages(
        &self,
        addr: PhysAddr,
        page_count: u64,
        owner: EnclaveId,
        page_type: MetadataPageType,
    ) -> MonitorResult {
        self.assign_metadata_pages(addr, page_count, owner, page_type, 0)
    }

    /// Converts pages previously granted to `owner` into a live structure.
    pub(crate) fn accept_metadata_pages(
        &self,
        addr: PhysAddr,
        page_count: u64,
        owner: EnclaveId,
        page_type: MetadataPageType,
    ) -> MonitorResult {
        self.assign_metadata_pages(
            addr,
            page_count,
            owner,
            page_type,
            page_info(owner.0, MetadataPageType::Empty),
        )
    }

    /// Pre-assigns free pages to `owner` without giving them a type yet.
    /// The enclave turns them into a structure later via an accept call.
    pub(crate) fn grant_metadata_pages(
        &self,
        addr: PhysAddr,
        page_count: u64,
        owner: EnclaveId,
    ) -> MonitorResult {
        self.check_metadata_run(addr, page_count)?;
        let entry_addr = self.metadata_entry_addr(addr);
        for i in 0..page_count {
            let word_addr = entry_addr.add(i * size_of::<u64>() as u64);
            if self.dram.read_word(word_addr) != 0 {
                return Err(MonitorError::InvalidState);
            }
        }
        for i in 0..page_count {
            let word_addr = entry_addr.add(i * size_of::<u64>() as u64);
            self.dram
                .write_word(word_addr, page_info(owner.0, MetadataPageType::Empty));
        }
        Ok(())
    }

    /// Releases a metadata structure's map entries back to `Empty`.
    pub(crate) fn release_metadata_pages(&self, addr: PhysAddr, page_count: u64) {
        let entry_addr = self.metadata_entry_addr(addr);
        for i in 0..page_count {
            self.dram
                .write_word(entry_addr.add(i * size_of::<u64>() as u64), 0);
        }
    }

    /// Validates that `raw` names a live enclave: page-aligned, in DRAM,
    /// and its map entry marks the start of an `EnclaveInfo`.
    ///
    /// The caller must hold the metadata region's lock.
    pub(crate) fn checked_enclave_id(&self, raw: u64) -> MonitorResult<EnclaveId> {
        let addr = PhysAddr::new(raw);
        if !addr.is_page_aligned() || !self.geometry.is_dram_address(addr) {
            return Err(MonitorError::InvalidValue);
        }
        if self.read_metadata_entry(addr) != page_info(raw, MetadataPageType::Enclave) {
            return Err(MonitorError::InvalidValue);
        }
        Ok(EnclaveId(raw))
    }

    /// The only way to turn an untrusted enclave id into an
    /// [`EnclaveGuard`]: validate the metadata map under the region lock,
    /// then take the enclave's own lock.
    pub fn lock_enclave(&self, id: u64) -> MonitorResult<EnclaveGuard<'_>> {
        let (_region, enclave) = self.lock_enclave_with_region(id)?;
        Ok(enclave)
    }

    /// As [`Monitor::lock_enclave`], but additionally keeps the metadata
    /// region locked. Needed by operations that go on to edit the map.
    pub(crate) fn lock_enclave_with_region(
        &self,
        id: u64,
    ) -> MonitorResult<(RegionGuard<'_>, EnclaveGuard<'_>)> {
        let addr = PhysAddr::new(id);
        let region_guard = self.lock_metadata_region_for(addr)?;
        let id = self.checked_enclave_id(id)?;
        // SAFETY: The map entry read under the region lock proves an
        // EnclaveInfo was installed at `addr` and is still live; its pages
        // are pinned for as long as the entry exists.
        let info: &EnclaveInfo = unsafe { self.dram.obj_ref(addr) };
        if !info.lock.try_acquire() {
            return Err(MonitorError::ConcurrentCall);
        }
        Ok((region_guard, EnclaveGuard::new(info, id)))
    }

    /// Reaches the `EnclaveInfo` of an id that has already been validated,
    /// without taking the enclave lock.
    ///
    /// # Safety
    ///
    /// The caller must know the id is live: either it holds the metadata
    /// region lock and has checked the map entry, or the id names the
    /// enclave running on the current core (whose metadata is pinned while
    /// it runs). Only the atomic fields of the result may be used without
    /// the enclave lock.
    pub(crate) unsafe fn enclave_info_unchecked(&self, id: EnclaveId) -> &EnclaveInfo {
        // SAFETY: Liveness is the caller's contract, as documented above.
        unsafe { self.dram.obj_ref(PhysAddr::new(id.0)) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{pagetable::PAGE_SHIFT, platform::test::test_monitor};

    #[test]
    fn map_entries_track_region_pages() {
        let monitor = test_monitor();
        monitor.create_metadata_region(2).unwrap();

        let page = monitor.geometry.region_start(2).add(0x3000);
        assert_eq!(monitor.read_metadata_entry(page), 0);

        let owner = EnclaveId(page.value());
        {
            let _guard = monitor.lock_metadata_region_for(page).unwrap();
            monitor
                .reserve_metadata_pages(page, 2, owner, MetadataPageType::Enclave)
                .unwrap();
        }
        assert_eq!(
            monitor.read_metadata_entry(page),
            page_info(owner.0, MetadataPageType::Enclave)
        );
        assert_eq!(
            monitor.read_metadata_entry(page.add(0x1000)),
            page_info(owner.0, MetadataPageType::Inner)
        );
    }

    #[test]
    fn reserve_requires_empty_entries() {
        let monitor = test_monitor();
        monitor.create_metadata_region(2).unwrap();
        let page = monitor.geometry.region_start(2).add(0x3000);
        let owner = EnclaveId(page.value());
        let _guard = monitor.lock_metadata_region_for(page).unwrap();
        monitor
            .reserve_metadata_pages(page, 2, owner, MetadataPageType::Thread)
            .unwrap();
        assert_eq!(
            monitor.reserve_metadata_pages(page.add(0x1000), 1, owner, MetadataPageType::Thread),
            Err(MonitorError::InvalidState)
        );
    }

    #[test]
    fn accept_requires_granted_entries() {
        let monitor = test_monitor();
        monitor.create_metadata_region(2).unwrap();
        let page = monitor.geometry.region_start(2).add(0x3000);
        let owner = EnclaveId(monitor.geometry.region_start(2).add(0x1000).value());
        let _guard = monitor.lock_metadata_region_for(page).unwrap();

        // Not granted yet.
        assert_eq!(
            monitor.accept_metadata_pages(page, 1, owner, MetadataPageType::Thread),
            Err(MonitorError::InvalidState)
        );

        monitor.grant_metadata_pages(page, 1, owner).unwrap();
        assert_eq!(
            monitor.accept_metadata_pages(page, 1, owner, MetadataPageType::Thread),
            Ok(())
        );
        assert_eq!(
            monitor.read_metadata_entry(page),
            page_info(owner.0, MetadataPageType::Thread)
        );
    }

    #[test]
    fn allocations_cannot_cover_the_map() {
        let monitor = test_monitor();
        monitor.create_metadata_region(2).unwrap();
        let map_page = monitor.geometry.region_start(2);
        let owner = EnclaveId(map_page.add(0x1000).value());
        let _guard = monitor.lock_metadata_region_for(map_page).unwrap();
        assert_eq!(
            monitor.reserve_metadata_pages(map_page, 1, owner, MetadataPageType::Enclave),
            Err(MonitorError::InvalidValue)
        );
    }

    #[test]
    fn allocations_cannot_cross_a_stripe() {
        let monitor = test_monitor();
        monitor.create_metadata_region(2).unwrap();
        let last_page = monitor
            .geometry
            .region_start(2)
            .add((monitor.geometry.stripe_pages - 1) << PAGE_SHIFT);
        let owner = EnclaveId(last_page.value());
        let _guard = monitor.lock_metadata_region_for(last_page).unwrap();
        assert_eq!(
            monitor.reserve_metadata_pages(last_page, 2, owner, MetadataPageType::Enclave),
            Err(MonitorError::InvalidValue)
        );
    }

    #[test]
    fn lock_enclave_rejects_forged_ids() {
        let monitor = test_monitor();
        monitor.create_metadata_region(2).unwrap();

        // Misaligned.
        assert_eq!(
            monitor.lock_enclave(monitor.geometry.region_start(2).value() + 4).err(),
            Some(MonitorError::InvalidValue)
        );
        // Outside DRAM.
        assert_eq!(
            monitor.lock_enclave(0x1000).err(),
            Some(MonitorError::InvalidValue)
        );
        // Not a metadata region.
        assert_eq!(
            monitor.lock_enclave(monitor.geometry.region_start(3).value()).err(),
            Some(MonitorError::InvalidState)
        );
        // Metadata region, but no enclave at that page.
        assert_eq!(
            monitor
                .lock_enclave(monitor.geometry.region_start(2).add(0x2000).value())
                .err(),
            Some(MonitorError::InvalidValue)
        );
    }
}
