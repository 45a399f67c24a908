// Copyright The Citadel SM Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! The monitor state object.
//!
//! Every piece of mutable monitor state lives in one [`Monitor`] value
//! built during boot and shared by all cores: the region table, the
//! per-core table, the generation clock, the OS region bitmap, and the DMA
//! range. After boot only lock-guarded fields change.

use crate::{
    attestation::AttestationData,
    bits,
    dram::{Dram, DramGeometry},
    enclave::EnclaveId,
    hardware::HardwareOps,
    regions::RegionInfo,
};
use arrayvec::ArrayVec;
use core::sync::atomic::{AtomicU64, Ordering};
use log::info;

/// Upper bound on the number of DRAM regions any supported platform
/// derives. The real count is computed at boot.
pub const MAX_DRAM_REGIONS: usize = 128;

/// Upper bound on the number of cores.
pub const MAX_CORES: usize = 16;

/// Words in a region bitmap sized for `MAX_DRAM_REGIONS`.
pub const MAX_REGION_BITMAP_WORDS: usize = MAX_DRAM_REGIONS / bits::BITS_PER_WORD;

/// Per-core accounting.
///
/// Most fields are only written by the core they describe; `flushed_at` is
/// read by other cores when they decide whether a blocked region may be
/// freed, so it is the one field with cross-core ordering requirements.
pub struct CoreState {
    /// Metadata address of the enclave running on this core, or 0 when the
    /// core is executing OS code.
    pub(crate) enclave_id: AtomicU64,
    /// Metadata address of the running thread, 0 when none.
    pub(crate) thread_id: AtomicU64,
    /// The value of `block_clock` when this core's TLB was last flushed.
    pub(crate) flushed_at: AtomicU64,
}

impl CoreState {
    const fn new() -> Self {
        Self {
            enclave_id: AtomicU64::new(0),
            thread_id: AtomicU64::new(0),
            flushed_at: AtomicU64::new(0),
        }
    }
}

/// The security monitor.
///
/// Constructed once at boot; all entry points take `&self` and serialise
/// through per-region, per-enclave, and per-thread try-locks.
pub struct Monitor<H: HardwareOps> {
    pub(crate) hw: H,
    pub(crate) geometry: DramGeometry,
    pub(crate) dram: Dram,
    pub(crate) regions: ArrayVec<RegionInfo, MAX_DRAM_REGIONS>,
    pub(crate) cores: ArrayVec<CoreState, MAX_CORES>,
    /// Monotone counter incremented on every region block; gates TLB-safe
    /// freeing.
    pub(crate) block_clock: AtomicU64,
    /// One bit per region the OS may touch. Guarded by region 0's lock.
    os_region_bitmap: [AtomicU64; MAX_REGION_BITMAP_WORDS],
    /// Start of the span the DMA master may touch. Guarded by region 0's
    /// lock.
    pub(crate) dma_range_start: AtomicU64,
    /// Exclusive end of the DMA span.
    pub(crate) dma_range_end: AtomicU64,
    pub(crate) attestation: AttestationData,
}

impl<H: HardwareOps> Monitor<H> {
    /// Builds the boot state: region 0 held by the OS for the monitor and
    /// OS images, every other region free, all cores idle.
    pub fn new(
        hw: H,
        geometry: DramGeometry,
        dram: Dram,
        attestation: AttestationData,
        core_count: usize,
    ) -> Self {
        assert!(geometry.region_count <= MAX_DRAM_REGIONS);
        assert!(core_count > 0 && core_count <= MAX_CORES);

        let mut regions = ArrayVec::new();
        regions.push(RegionInfo::with_owner(crate::regions::OWNER_OS));
        for _ in 1..geometry.region_count {
            regions.push(RegionInfo::free());
        }

        let mut cores = ArrayVec::new();
        for _ in 0..core_count {
            cores.push(CoreState::new());
        }

        let monitor = Self {
            hw,
            geometry,
            dram,
            regions,
            cores,
            block_clock: AtomicU64::new(0),
            os_region_bitmap: [const { AtomicU64::new(0) }; MAX_REGION_BITMAP_WORDS],
            dma_range_start: AtomicU64::new(0),
            dma_range_end: AtomicU64::new(0),
            attestation,
        };
        monitor.os_bitmap_set(0, true);
        monitor
    }

    /// Programs the boot-time protection: the address fence around the
    /// monitor image, the cache index rotation, the OS region bitmap, and
    /// a one-byte DMA range just above the monitor.
    pub fn apply_boot_protection(&self, monitor_top: u64) {
        let geometry = &self.geometry;
        assert!(monitor_top > geometry.dram_base);
        let monitor_size = bits::ceil_power_of_two(monitor_top - geometry.dram_base);
        assert!(
            monitor_size <= geometry.stripe_size,
            "the monitor image must fit into the first DRAM stripe"
        );

        self.hw.set_par_base(geometry.dram_base);
        self.hw.set_par_mask(!(monitor_size - 1));
        self.hw.set_cache_index_shift(geometry.cache_index_shift());
        self.apply_os_bitmap();

        // Allow DMA transfers for one byte at the top of the monitor until
        // the OS configures a real range.
        let dma_start = geometry.dram_base + monitor_size;
        self.dma_range_start.store(dma_start, Ordering::Relaxed);
        self.dma_range_end.store(dma_start + 1, Ordering::Relaxed);
        self.hw.set_dmar_base(dma_start);
        self.hw.set_dmar_mask(!0);

        info!(
            "monitor protected: [{:#x}, {:#x}), {} cores",
            geometry.dram_base,
            geometry.dram_base + monitor_size,
            self.cores.len()
        );
    }

    /// The state of the calling core.
    pub(crate) fn core_state(&self) -> &CoreState {
        &self.cores[self.hw.current_core()]
    }

    /// The enclave running on the calling core, or `None` for the OS.
    pub(crate) fn current_enclave(&self) -> Option<EnclaveId> {
        match self.core_state().enclave_id.load(Ordering::Relaxed) {
            0 => None,
            id => Some(EnclaveId(id)),
        }
    }

    /// The caller's identity as a raw region owner word.
    pub(crate) fn caller_owner_raw(&self) -> u64 {
        self.core_state().enclave_id.load(Ordering::Relaxed)
    }

    /// Sets or clears one bit of the OS region bitmap. The caller must
    /// hold region 0's lock.
    pub(crate) fn os_bitmap_set(&self, region: usize, value: bool) {
        let (word, mask) = bits::bitmap_position(region);
        if value {
            self.os_region_bitmap[word].fetch_or(mask, Ordering::Relaxed);
        } else {
            self.os_region_bitmap[word].fetch_and(!mask, Ordering::Relaxed);
        }
    }

    /// Locks a caller-owned buffer of `len` bytes: the span must be DRAM,
    /// stay within one region, and that region must belong to the caller.
    pub(crate) fn lock_caller_buffer(
        &self,
        addr: crate::dram::PhysAddr,
        len: u64,
    ) -> crate::api::MonitorResult<crate::regions::RegionGuard<'_>> {
        if !self.geometry.is_dram_range(addr, len) {
            return Err(crate::api::MonitorError::InvalidValue);
        }
        let region = self.geometry.region_for(addr);
        if self.geometry.region_for(addr.add(len - 1)) != region {
            return Err(crate::api::MonitorError::InvalidValue);
        }
        let guard = self.try_lock_region(region)?;
        if guard.owner_raw() != self.caller_owner_raw() {
            return Err(crate::api::MonitorError::AccessDenied);
        }
        Ok(guard)
    }

    /// Loads the OS region bitmap into the page walker.
    pub(crate) fn apply_os_bitmap(&self) {
        let mut words = [0u64; MAX_REGION_BITMAP_WORDS];
        for (word, atomic) in words.iter_mut().zip(&self.os_region_bitmap) {
            *word = atomic.load(Ordering::Relaxed);
        }
        self.hw
            .set_os_region_bitmap(&words[..self.geometry.region_bitmap_words]);
    }
}
