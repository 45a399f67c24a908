// Copyright The Citadel SM Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Physical DRAM: address arithmetic over the region/stripe partition, and
//! the accessor the monitor uses for every byte it reads or writes outside
//! its own image.
//!
//! DRAM is cut into `region_count` equal regions, one per last-level cache
//! color. A region is not contiguous: it is the union of page-aligned
//! stripes placed `2^stripe_shift` bytes apart, so that every region maps
//! to a disjoint set of LLC indices.

use crate::{
    bits,
    pagetable::PAGE_SHIFT,
    platform::Platform,
};
use core::fmt::{self, Debug, Formatter};
use log::{info, warn};
use zerocopy::{FromBytes, Immutable, IntoBytes};

/// A physical address.
///
/// Physical addresses are never dereferenced directly; every access goes
/// through [`Dram`], and every typed projection is gated on the metadata
/// page map.
#[derive(Copy, Clone, Eq, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct PhysAddr(u64);

impl PhysAddr {
    /// Wraps a raw physical address.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw address value.
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The address `offset` bytes above this one.
    pub const fn add(self, offset: u64) -> Self {
        Self(self.0 + offset)
    }

    /// True if the address is page-aligned.
    pub const fn is_page_aligned(self) -> bool {
        bits::is_page_aligned(self.0)
    }
}

impl Debug for PhysAddr {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}

/// The DRAM partition constants derived once at boot.
///
/// Immutable after construction; everything here is a pure function of the
/// platform's DRAM span and LLC geometry.
#[derive(Clone, Debug)]
pub struct DramGeometry {
    /// First physical address of DRAM.
    pub dram_base: u64,
    /// Size of DRAM in bytes; a power of two.
    pub dram_size: u64,
    /// log2 of the stripe size. A stripe is one contiguous run of a region.
    pub region_shift: u32,
    /// log2 of the distance between two stripes of the same region.
    pub stripe_shift: u32,
    /// Number of DRAM regions; one per LLC color.
    pub region_count: usize,
    /// Size of one stripe in bytes.
    pub stripe_size: u64,
    /// Number of pages in one stripe.
    pub stripe_pages: u64,
    /// Number of 64-bit words in a region bitmap.
    pub region_bitmap_words: usize,
    /// Pages per region, which is also the number of page map entries in a
    /// metadata region. May be clipped so the map fits one stripe.
    pub metadata_region_pages: u64,
    /// Index of the first usable page in a metadata region; the pages below
    /// it hold the page map itself.
    pub metadata_region_start: u64,
    region_mask: u64,
    stripe_page_mask: u64,
}

impl DramGeometry {
    /// Derives the partition constants from the platform description.
    ///
    /// Panics if the platform cannot be partitioned: these are boot
    /// invariants, not runtime errors.
    pub fn compute<P: Platform>() -> Self {
        for level in 0..P::CACHE_LEVELS - 1 {
            assert!(
                !P::cache_is_shared(level),
                "only the last-level cache may be shared between cores"
            );
        }
        assert!(
            bits::is_power_of_two(P::DRAM_SIZE),
            "DRAM size must be a power of two"
        );
        assert!(
            bits::is_power_of_two(P::LLC_LINE_SIZE) && bits::is_power_of_two(P::LLC_SET_COUNT),
            "LLC line size and set count must be powers of two"
        );

        let dram_address_bits = bits::address_bits_for(P::DRAM_SIZE);
        let line_bits = bits::address_bits_for(P::LLC_LINE_SIZE);
        let set_bits = bits::address_bits_for(P::LLC_SET_COUNT);
        let cache_bits = set_bits + line_bits;
        assert!(
            cache_bits > PAGE_SHIFT,
            "address translation reaches every LLC index bit; cannot partition"
        );
        let region_bits = cache_bits - PAGE_SHIFT;

        let mut stripe_page_bits = dram_address_bits - cache_bits;
        if stripe_page_bits > P::MAX_CACHE_INDEX_SHIFT {
            // Regions will not be contiguous.
            stripe_page_bits = P::MAX_CACHE_INDEX_SHIFT;
        }
        assert!(
            stripe_page_bits >= P::MIN_CACHE_INDEX_SHIFT,
            "DRAM cannot use the entire LLC on this platform"
        );

        let region_shift = PAGE_SHIFT + stripe_page_bits;
        let stripe_shift = region_shift + region_bits;
        let region_count = 1usize << region_bits;

        // Pages per region; the metadata page map has one word per page and
        // must fit inside a single stripe.
        let mut metadata_region_pages = P::DRAM_SIZE >> (region_bits + PAGE_SHIFT);
        let stripe_size = 1u64 << region_shift;
        let word_size = size_of::<u64>() as u64;
        if metadata_region_pages * word_size > stripe_size {
            metadata_region_pages = stripe_size / word_size;
            warn!(
                "clipping metadata region capacity to {} pages so the page map fits one stripe",
                metadata_region_pages
            );
        }
        let metadata_region_start = bits::pages_needed_for(metadata_region_pages * word_size);

        let geometry = Self {
            dram_base: P::DRAM_BASE,
            dram_size: P::DRAM_SIZE,
            region_shift,
            stripe_shift,
            region_count,
            stripe_size,
            stripe_pages: 1 << stripe_page_bits,
            region_bitmap_words: region_count.div_ceil(bits::BITS_PER_WORD),
            metadata_region_pages,
            metadata_region_start,
            region_mask: ((region_count as u64) - 1) << region_shift,
            stripe_page_mask: ((1u64 << stripe_page_bits) - 1) << PAGE_SHIFT,
        };
        info!(
            "DRAM partition: {} regions of {} stripes x {} KiB",
            geometry.region_count,
            geometry.dram_size >> geometry.stripe_shift,
            geometry.stripe_size >> 10,
        );
        geometry
    }

    /// True if the address lies inside DRAM.
    pub fn is_dram_address(&self, addr: PhysAddr) -> bool {
        addr.0 >= self.dram_base && addr.0 - self.dram_base < self.dram_size
    }

    /// True if `addr..addr + len` lies entirely inside DRAM.
    pub fn is_dram_range(&self, addr: PhysAddr, len: u64) -> bool {
        len > 0
            && self.is_dram_address(addr)
            && len <= self.dram_size
            && self.is_dram_address(addr.add(len - 1))
    }

    /// True for valid region indices. Relies on constant state only, so it
    /// can be called without holding any lock.
    pub fn is_valid_region(&self, region: usize) -> bool {
        region < self.region_count
    }

    /// True for regions that can be freed and re-assigned. Region 0 holds
    /// the monitor and OS images and only ever belongs to the OS.
    pub fn is_dynamic_region(&self, region: usize) -> bool {
        region != 0 && self.is_valid_region(region)
    }

    /// The region index for an address. Addresses outside DRAM yield a
    /// valid but meaningless index.
    pub fn region_for(&self, addr: PhysAddr) -> usize {
        ((addr.0.wrapping_sub(self.dram_base) & self.region_mask) >> self.region_shift) as usize
    }

    /// The region index for an address, clamped to region 0 for addresses
    /// outside DRAM.
    pub fn clamped_region_for(&self, addr: PhysAddr) -> usize {
        if self.is_dram_address(addr) {
            self.region_for(addr)
        } else {
            0
        }
    }

    /// The start of a region's first stripe.
    pub fn region_start(&self, region: usize) -> PhysAddr {
        PhysAddr(self.dram_base + ((region as u64) << self.region_shift))
    }

    /// The page index of an address within its stripe.
    pub fn stripe_page_for(&self, addr: PhysAddr) -> u64 {
        (addr.0.wrapping_sub(self.dram_base) & self.stripe_page_mask) >> PAGE_SHIFT
    }

    /// The stripe index of an address within its region.
    pub fn stripe_for(&self, addr: PhysAddr) -> u64 {
        addr.0.wrapping_sub(self.dram_base) >> self.stripe_shift
    }

    /// The page index of an address within its region.
    ///
    /// Unique across the whole region, unlike the stripe page index which
    /// repeats once per stripe.
    pub fn region_page_for(&self, addr: PhysAddr) -> u64 {
        self.stripe_page_for(addr) | (self.stripe_for(addr) << (self.region_shift - PAGE_SHIFT))
    }

    /// Number of stripes making up one region.
    pub fn stripes_per_region(&self) -> u64 {
        self.dram_size >> self.stripe_shift
    }

    /// The start address of one stripe of a region.
    pub fn stripe_start(&self, region: usize, stripe: u64) -> PhysAddr {
        PhysAddr(self.dram_base + (stripe << self.stripe_shift))
            .add((region as u64) << self.region_shift)
    }

    /// log2 of the number of pages per stripe, programmed into the cache
    /// index rotation at boot.
    pub fn cache_index_shift(&self) -> u32 {
        self.region_shift - PAGE_SHIFT
    }
}

/// The monitor's window onto physical DRAM.
///
/// On hardware this is an identity mapping of the DRAM span; under test it
/// is a host-allocated arena. Either way, all loads and stores the monitor
/// performs on OS, enclave, or metadata memory funnel through here.
pub struct Dram {
    base: u64,
    size: u64,
    ptr: *mut u8,
}

// SAFETY: `Dram` hands out access to raw memory that the monitor's locking
// protocol partitions between cores; the accessor itself carries no state
// beyond the mapping.
unsafe impl Send for Dram {}
// SAFETY: See above.
unsafe impl Sync for Dram {}

impl Dram {
    /// Creates an accessor for the physical span `base..base + size`,
    /// reachable at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr..ptr + size` must be valid for reads and writes for the life of
    /// the monitor and must not be accessed except through the returned
    /// accessor and the hardware-mediated accesses the monitor authorises.
    pub unsafe fn new(base: u64, size: u64, ptr: *mut u8) -> Self {
        Self { base, size, ptr }
    }

    fn host_ptr(&self, addr: PhysAddr, len: u64) -> *mut u8 {
        let offset = addr.0.checked_sub(self.base).expect("address below DRAM");
        assert!(offset + len <= self.size, "access beyond DRAM");
        // SAFETY: The offset was just bounds-checked against the mapping.
        unsafe { self.ptr.add(offset as usize) }
    }

    /// Reads one 64-bit word.
    pub fn read_word(&self, addr: PhysAddr) -> u64 {
        let ptr = self.host_ptr(addr, size_of::<u64>() as u64);
        // SAFETY: `host_ptr` bounds-checked the access; unaligned reads are
        // tolerated so callers don't have to prove alignment for packed
        // structures.
        unsafe { ptr.cast::<u64>().read_unaligned() }
    }

    /// Writes one 64-bit word.
    pub fn write_word(&self, addr: PhysAddr, value: u64) {
        let ptr = self.host_ptr(addr, size_of::<u64>() as u64);
        // SAFETY: `host_ptr` bounds-checked the access.
        unsafe { ptr.cast::<u64>().write_unaligned(value) }
    }

    /// Reads a plain-data object out of DRAM.
    pub fn read_obj<T: FromBytes>(&self, addr: PhysAddr) -> T {
        let ptr = self.host_ptr(addr, size_of::<T>() as u64);
        // SAFETY: `host_ptr` bounds-checked the access, and `T: FromBytes`
        // makes any bit pattern a valid value.
        unsafe { ptr.cast::<T>().read_unaligned() }
    }

    /// Writes a plain-data object into DRAM.
    pub fn write_obj<T: IntoBytes + Immutable>(&self, addr: PhysAddr, value: &T) {
        let bytes = value.as_bytes();
        let ptr = self.host_ptr(addr, bytes.len() as u64);
        // SAFETY: `host_ptr` bounds-checked the access; the source is a
        // plain byte view of `value`.
        unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len()) }
    }

    /// Writes a byte slice into DRAM.
    pub fn write_bytes(&self, addr: PhysAddr, bytes: &[u8]) {
        let ptr = self.host_ptr(addr, bytes.len() as u64);
        // SAFETY: `host_ptr` bounds-checked the access.
        unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len()) }
    }

    /// Fills `addr..addr + len` with zeros.
    pub fn zero(&self, addr: PhysAddr, len: u64) {
        let ptr = self.host_ptr(addr, len);
        // SAFETY: `host_ptr` bounds-checked the access.
        unsafe { core::ptr::write_bytes(ptr, 0, len as usize) }
    }

    /// Copies `len` bytes between two non-overlapping DRAM spans.
    pub fn copy(&self, dest: PhysAddr, source: PhysAddr, len: u64) {
        debug_assert!(dest.0.abs_diff(source.0) >= len, "overlapping DRAM copy");
        let src = self.host_ptr(source, len);
        let dst = self.host_ptr(dest, len);
        // SAFETY: Both spans were bounds-checked and the caller keeps them
        // disjoint.
        unsafe { core::ptr::copy_nonoverlapping(src, dst, len as usize) }
    }

    /// Yields a shared reference to a `T` living in DRAM.
    ///
    /// # Safety
    ///
    /// A valid `T` must have been placed at `addr` (by [`Dram::install`])
    /// and must not be moved, dropped, or mutably aliased while the
    /// reference lives. The monitor's metadata page map plus the lock
    /// protocol are what establish this.
    pub unsafe fn obj_ref<T>(&self, addr: PhysAddr) -> &T {
        let ptr = self.host_ptr(addr, size_of::<T>() as u64);
        debug_assert!(ptr as usize % align_of::<T>() == 0);
        // SAFETY: Bounds were checked; validity and aliasing are the
        // caller's contract.
        unsafe { &*ptr.cast::<T>() }
    }

    /// Places a value into DRAM, overwriting whatever was there.
    ///
    /// # Safety
    ///
    /// `addr` must be aligned for `T` and nothing may hold a reference into
    /// the destination span.
    pub unsafe fn install<T>(&self, addr: PhysAddr, value: T) {
        let ptr = self.host_ptr(addr, size_of::<T>() as u64);
        assert!(ptr as usize % align_of::<T>() == 0);
        // SAFETY: Bounds and alignment were checked; exclusivity is the
        // caller's contract.
        unsafe { ptr.cast::<T>().write(value) }
    }
}
