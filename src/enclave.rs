// Copyright The Citadel SM Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Enclave lifecycle: creation, measured loading, sealing, thread
//! management, entry and exit, debug access, and destruction.
//!
//! An enclave is named by the physical address of its [`EnclaveInfo`],
//! which lives at the head of a metadata allocation and is followed by the
//! enclave's DRAM region bitmap and its mailbox array. Any reference to an
//! `EnclaveInfo` is obtained through [`Monitor::lock_enclave`], which
//! checks the metadata page map before taking the enclave's lock; callers
//! can therefore never conjure a reference out of a forged id.

use crate::{
    api::{ExecState, MonitorError, MonitorResult, ThreadInitInfo},
    bits,
    dram::PhysAddr,
    hardware::HardwareOps,
    mailbox::Mailbox,
    measure::Measurement,
    metadata::{MetadataPageType, page_info},
    monitor::{MAX_DRAM_REGIONS, MAX_REGION_BITMAP_WORDS, Monitor},
    pagetable::{self, PAGE_SHIFT, PAGE_SIZE, PAGE_TABLE_LEVELS},
    regions::{OWNER_OS, RegionGuard},
    sync::TryLock,
};
use arrayvec::ArrayVec;
use core::{
    cell::UnsafeCell,
    fmt::{self, Debug, Formatter},
    sync::atomic::{AtomicU64, Ordering},
};
use static_assertions::const_assert;

/// The metadata address an enclave is named by. Page-aligned by
/// construction; 0 never names an enclave (it stands for the OS in owner
/// words).
#[derive(Copy, Clone, Eq, PartialEq)]
#[repr(transparent)]
pub struct EnclaveId(pub u64);

impl Debug for EnclaveId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "EnclaveId({:#x})", self.0)
    }
}

/// Per-enclave accounting, stored at the head of the enclave's metadata
/// allocation and followed by the region bitmap and mailboxes.
///
/// Word fields are atomics so that the few cross-lock readers (running
/// counters, region counts) stay defined; everything else is only touched
/// under the enclave lock, which [`EnclaveGuard`] encapsulates. The
/// measurement state is behind an `UnsafeCell` because hashing needs
/// mutable access that the lock, not the type system, serialises.
#[repr(C)]
pub struct EnclaveInfo {
    /// Protects the non-atomic state. Acquired only via
    /// [`Monitor::lock_enclave`].
    pub(crate) lock: TryLock,
    mailbox_count: AtomicU64,
    is_initialized: AtomicU64,
    is_debug: AtomicU64,
    /// Thread metadata structures assigned to the enclave. Must reach zero
    /// before the enclave can be deleted.
    thread_count: AtomicU64,
    /// Threads currently executing on some core.
    running_threads: AtomicU64,
    /// DRAM regions assigned to the enclave.
    dram_region_count: AtomicU64,
    ev_base: AtomicU64,
    ev_mask: AtomicU64,
    /// Page table root fixed by the first top-level `load_page_table`.
    load_eptbr: AtomicU64,
    /// Highest physical address loaded so far; successive loads must
    /// strictly increase it, which pins the canonical measurement order.
    last_load_addr: AtomicU64,
    measurement: UnsafeCell<Measurement>,
}

// SAFETY: The UnsafeCell contents are only reached through EnclaveGuard,
// which requires holding the enclave's test-and-set lock; all other fields
// are atomics.
unsafe impl Sync for EnclaveInfo {}

impl EnclaveInfo {
    fn new(ev_base: u64, ev_mask: u64, mailbox_count: u64, debug: bool) -> Self {
        Self {
            lock: TryLock::new(),
            mailbox_count: AtomicU64::new(mailbox_count),
            is_initialized: AtomicU64::new(0),
            is_debug: AtomicU64::new(debug as u64),
            thread_count: AtomicU64::new(0),
            running_threads: AtomicU64::new(0),
            dram_region_count: AtomicU64::new(0),
            ev_base: AtomicU64::new(ev_base),
            ev_mask: AtomicU64::new(ev_mask),
            load_eptbr: AtomicU64::new(0),
            last_load_addr: AtomicU64::new(0),
            measurement: UnsafeCell::new(Measurement::init(
                ev_base,
                ev_mask,
                mailbox_count,
                debug,
            )),
        }
    }

    /// True once `init_enclave` has sealed the enclave.
    pub(crate) fn is_initialized(&self) -> bool {
        self.is_initialized.load(Ordering::Relaxed) != 0
    }

    fn set_initialized(&self) {
        self.is_initialized.store(1, Ordering::Relaxed);
    }

    /// True for debug enclaves, whose memory the OS may copy in and out.
    pub(crate) fn is_debug(&self) -> bool {
        self.is_debug.load(Ordering::Relaxed) != 0
    }

    pub(crate) fn mailbox_count(&self) -> u64 {
        self.mailbox_count.load(Ordering::Relaxed)
    }

    pub(crate) fn thread_count(&self) -> u64 {
        self.thread_count.load(Ordering::Relaxed)
    }

    fn inc_thread_count(&self) {
        self.thread_count.fetch_add(1, Ordering::Relaxed);
    }

    fn dec_thread_count(&self) {
        self.thread_count.fetch_sub(1, Ordering::Relaxed);
    }

    fn inc_running_threads(&self) {
        self.running_threads.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn dec_running_threads(&self) {
        self.running_threads.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn add_dram_region(&self) {
        self.dram_region_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn sub_dram_region(&self) {
        self.dram_region_count.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn dram_region_count(&self) -> u64 {
        self.dram_region_count.load(Ordering::Relaxed)
    }

    pub(crate) fn ev_base(&self) -> u64 {
        self.ev_base.load(Ordering::Relaxed)
    }

    pub(crate) fn ev_mask(&self) -> u64 {
        self.ev_mask.load(Ordering::Relaxed)
    }

    pub(crate) fn load_eptbr(&self) -> u64 {
        self.load_eptbr.load(Ordering::Relaxed)
    }

    fn set_load_eptbr(&self, value: u64) {
        self.load_eptbr.store(value, Ordering::Relaxed);
    }

    fn last_load_addr(&self) -> u64 {
        self.last_load_addr.load(Ordering::Relaxed)
    }

    fn set_last_load_addr(&self, value: u64) {
        self.last_load_addr.store(value, Ordering::Relaxed);
    }

    /// True if `virtual_addr` falls inside the enclave's virtual range.
    fn accepts_virtual(&self, virtual_addr: u64) -> bool {
        virtual_addr & !self.ev_mask() == self.ev_base()
    }

    /// The finalised measurement of a sealed enclave.
    pub(crate) fn sealed_measurement(&self) -> [u8; crate::measure::MEASUREMENT_SIZE] {
        debug_assert!(self.is_initialized());
        // SAFETY: Measurements are only written while the enclave is
        // unsealed; once sealed the value is frozen, so a shared read
        // needs no lock.
        unsafe { *(*self.measurement.get()).value() }
    }
}

/// Exclusive access to an enclave's lock-guarded state. Releases the
/// enclave lock on drop.
pub struct EnclaveGuard<'m> {
    info: &'m EnclaveInfo,
    id: EnclaveId,
}

impl<'m> EnclaveGuard<'m> {
    pub(crate) fn new(info: &'m EnclaveInfo, id: EnclaveId) -> Self {
        Self { info, id }
    }

    /// The guarded enclave's id.
    pub fn id(&self) -> EnclaveId {
        self.id
    }

    pub(crate) fn info(&self) -> &EnclaveInfo {
        self.info
    }

    /// The measurement state, readable under the lock.
    pub(crate) fn measurement(&self) -> &Measurement {
        // SAFETY: Holding the guard means holding the enclave lock, which
        // serialises all access to the cell.
        unsafe { &*self.info.measurement.get() }
    }

    /// The measurement state, writable under the lock.
    pub(crate) fn measurement_mut(&mut self) -> &mut Measurement {
        // SAFETY: As above; `&mut self` additionally prevents a second
        // projection from this guard.
        unsafe { &mut *self.info.measurement.get() }
    }
}

impl core::ops::Deref for EnclaveGuard<'_> {
    type Target = EnclaveInfo;

    fn deref(&self) -> &EnclaveInfo {
        self.info
    }
}

impl Drop for EnclaveGuard<'_> {
    fn drop(&mut self) {
        self.info.lock.release();
    }
}

/// Per-thread metadata, one allocation per enclave hardware thread.
///
/// The lock is taken by `enter_enclave` and held until the matching
/// `exit_enclave`, so a held lock means "running (or being mutated)".
#[repr(C)]
pub(crate) struct ThreadInfo {
    pub(crate) lock: TryLock,
    entry_pc: AtomicU64,
    entry_stack: AtomicU64,
    fault_pc: AtomicU64,
    fault_stack: AtomicU64,
    eptbr: AtomicU64,
    /// The caller context saved by `enter_enclave`, restored on exit.
    exit_state: UnsafeCell<ExecState>,
    /// Enclave context saved on an asynchronous exit. Filled by the fault
    /// path in the trap glue.
    #[allow(dead_code)]
    aex_state: UnsafeCell<ExecState>,
    /// Non-zero when `aex_state` holds a resumable context.
    can_resume: AtomicU64,
}

// SAFETY: The UnsafeCell fields are only accessed while holding the
// thread's test-and-set lock; the rest are atomics.
unsafe impl Sync for ThreadInfo {}

const_assert!(size_of::<ThreadInitInfo>() as u64 <= PAGE_SIZE);

impl ThreadInfo {
    fn new(init: &ThreadInitInfo) -> Self {
        Self {
            lock: TryLock::new(),
            entry_pc: AtomicU64::new(init.entry_pc),
            entry_stack: AtomicU64::new(init.entry_stack),
            fault_pc: AtomicU64::new(init.fault_pc),
            fault_stack: AtomicU64::new(init.fault_stack),
            eptbr: AtomicU64::new(init.eptbr),
            exit_state: UnsafeCell::new(ExecState::EMPTY),
            aex_state: UnsafeCell::new(ExecState::EMPTY),
            can_resume: AtomicU64::new(0),
        }
    }

    fn entry_pc(&self) -> u64 {
        self.entry_pc.load(Ordering::Relaxed)
    }

    fn entry_stack(&self) -> u64 {
        self.entry_stack.load(Ordering::Relaxed)
    }

    fn eptbr(&self) -> u64 {
        self.eptbr.load(Ordering::Relaxed)
    }

    /// Stores the caller's context for the eventual exit. The caller must
    /// hold the thread lock.
    fn save_exit_state(&self, state: &ExecState) {
        // SAFETY: The thread lock is held, serialising access to the cell.
        unsafe { *self.exit_state.get() = state.clone() };
    }

    /// Reads back the saved caller context. The caller must hold the
    /// thread lock.
    fn exit_state(&self) -> ExecState {
        // SAFETY: The thread lock is held, serialising access to the cell.
        unsafe { (*self.exit_state.get()).clone() }
    }

    fn clear_resume(&self) {
        self.can_resume.store(0, Ordering::Relaxed);
    }
}

impl<H: HardwareOps> Monitor<H> {
    /// Pages needed for one thread's metadata.
    pub fn thread_metadata_pages(&self) -> u64 {
        bits::pages_needed_for(size_of::<ThreadInfo>() as u64)
    }

    /// Pages needed for an enclave's metadata allocation, or `None` if the
    /// mailbox count is absurd enough to overflow.
    pub fn enclave_metadata_pages(&self, mailbox_count: u64) -> Option<u64> {
        self.enclave_info_size(mailbox_count)
            .map(bits::pages_needed_for)
    }

    /// Byte size of EnclaveInfo + region bitmap + mailbox array.
    fn enclave_info_size(&self, mailbox_count: u64) -> Option<u64> {
        let mailboxes = mailbox_count.checked_mul(size_of::<Mailbox>() as u64)?;
        self.enclave_mailboxes_offset().checked_add(mailboxes)
    }

    fn enclave_bitmap_addr(&self, id: EnclaveId) -> PhysAddr {
        PhysAddr::new(id.0 + size_of::<EnclaveInfo>() as u64)
    }

    fn enclave_mailboxes_offset(&self) -> u64 {
        size_of::<EnclaveInfo>() as u64
            + (self.geometry.region_bitmap_words * size_of::<u64>()) as u64
    }

    /// The address of one mailbox in an enclave's metadata allocation.
    pub(crate) fn mailbox_addr(&self, id: EnclaveId, mailbox: u64) -> PhysAddr {
        PhysAddr::new(id.0 + self.enclave_mailboxes_offset())
            .add(mailbox * size_of::<Mailbox>() as u64)
    }

    /// Sets or clears one bit of an enclave's region bitmap. The caller
    /// holds the enclave's metadata region lock.
    pub(crate) fn set_enclave_bitmap_bit(&self, id: EnclaveId, region: usize, value: bool) {
        let (word, mask) = bits::bitmap_position(region);
        let word_addr = self
            .enclave_bitmap_addr(id)
            .add((word * size_of::<u64>()) as u64);
        let mut bits = self.dram.read_word(word_addr);
        if value {
            bits |= mask;
        } else {
            bits &= !mask;
        }
        self.dram.write_word(word_addr, bits);
    }

    /// Reads one bit of an enclave's region bitmap.
    pub(crate) fn read_enclave_bitmap_bit(&self, id: EnclaveId, region: usize) -> bool {
        let (word, mask) = bits::bitmap_position(region);
        let word_addr = self
            .enclave_bitmap_addr(id)
            .add((word * size_of::<u64>()) as u64);
        self.dram.read_word(word_addr) & mask != 0
    }

    /// Loads an enclave's region bitmap into the page walker.
    pub(crate) fn apply_enclave_bitmap(&self, id: EnclaveId) {
        let mut words = [0u64; MAX_REGION_BITMAP_WORDS];
        let base = self.enclave_bitmap_addr(id);
        for (i, word) in words[..self.geometry.region_bitmap_words]
            .iter_mut()
            .enumerate()
        {
            *word = self.dram.read_word(base.add((i * size_of::<u64>()) as u64));
        }
        self.hw
            .set_enclave_region_bitmap(&words[..self.geometry.region_bitmap_words]);
    }

    /// Creates an enclave: reserves its metadata allocation at `id` inside
    /// a metadata region and starts its measurement.
    pub fn create_enclave(
        &self,
        id: u64,
        ev_base: u64,
        ev_mask: u64,
        mailbox_count: u64,
        debug: bool,
    ) -> MonitorResult {
        if !bits::is_valid_range(ev_base, ev_mask) {
            return Err(MonitorError::InvalidValue);
        }
        // The enclave's virtual range must hold at least one page.
        if ev_mask < PAGE_SIZE - 1 {
            return Err(MonitorError::InvalidValue);
        }

        let addr = PhysAddr::new(id);
        let region_guard = self.lock_metadata_region_for(addr)?;
        let pages = self
            .enclave_metadata_pages(mailbox_count)
            .ok_or(MonitorError::InvalidValue)?;
        self.reserve_metadata_pages(addr, pages, EnclaveId(id), MetadataPageType::Enclave)?;
        region_guard.add_pinned_pages(pages);

        // The allocation must start out clear: the region bitmap and the
        // mailbox states are read before they are ever written.
        self.dram.zero(addr, pages << PAGE_SHIFT);
        // SAFETY: The pages were just reserved under the region lock and
        // nothing can reference them yet.
        unsafe {
            self.dram
                .install(addr, EnclaveInfo::new(ev_base, ev_mask, mailbox_count, debug));
        }
        Ok(())
    }

    /// Loads one page table during staging and measures the operation.
    pub fn load_page_table(
        &self,
        id: u64,
        phys: u64,
        virtual_addr: u64,
        level: u64,
        acl: u64,
    ) -> MonitorResult {
        let phys_addr = PhysAddr::new(phys);
        if !self.geometry.is_dram_address(phys_addr) || !phys_addr.is_page_aligned() {
            return Err(MonitorError::InvalidValue);
        }
        // The level bound also bounds the walk below.
        let level = level as usize;
        if level >= PAGE_TABLE_LEVELS {
            return Err(MonitorError::InvalidValue);
        }

        let mut enclave = self.lock_enclave(id)?;
        if enclave.is_initialized() {
            return Err(MonitorError::InvalidState);
        }
        if phys <= enclave.last_load_addr() {
            return Err(MonitorError::InvalidValue);
        }
        let table_size = pagetable::table_size(level);
        if !self.geometry.is_dram_range(phys_addr, table_size) {
            return Err(MonitorError::InvalidValue);
        }
        if level != PAGE_TABLE_LEVELS - 1 && !enclave.accepts_virtual(virtual_addr) {
            return Err(MonitorError::InvalidValue);
        }

        // Every page of the table must sit in a region the enclave owns.
        // The regions cannot be blocked out from under us: blocking
        // requires the owner to call, and the owner is not running yet.
        let mut table_page = phys;
        while table_page < phys + table_size {
            let region = self.geometry.region_for(PhysAddr::new(table_page));
            if !self.read_enclave_bitmap_bit(enclave.id(), region) {
                return Err(MonitorError::InvalidValue);
            }
            table_page += PAGE_SIZE;
        }

        if level == PAGE_TABLE_LEVELS - 1 {
            // The first top-level table becomes the fixed root; the
            // virtual address argument is ignored but still measured.
            if enclave.load_eptbr() != 0 {
                return Err(MonitorError::InvalidState);
            }
            enclave.info().set_load_eptbr(phys);
        } else {
            // Editing a level-N table means walking to level N+1 and
            // hooking the new table into an entry that is not yet valid.
            let entry_addr =
                pagetable::walk_to_entry(&self.dram, enclave.load_eptbr(), virtual_addr, level + 1)
                    .ok_or(MonitorError::InvalidState)?;
            if pagetable::entry_is_valid(self.dram.read_word(entry_addr)) {
                return Err(MonitorError::InvalidState);
            }
            self.dram
                .write_word(entry_addr, pagetable::make_entry(phys, acl));
        }

        // last_load_addr names the last loaded page, not the table's end.
        enclave.info().set_last_load_addr(phys + table_size - PAGE_SIZE);
        self.dram.zero(phys_addr, table_size);
        enclave
            .measurement_mut()
            .extend_with_page_table(virtual_addr, acl, level as u64);
        Ok(())
    }

    /// Loads one data page from OS memory during staging and measures the
    /// operation and the page contents.
    pub fn load_page(
        &self,
        id: u64,
        phys: u64,
        virtual_addr: u64,
        os_addr: u64,
        acl: u64,
    ) -> MonitorResult {
        let phys_addr = PhysAddr::new(phys);
        let os_phys = PhysAddr::new(os_addr);
        if !self.geometry.is_dram_address(phys_addr)
            || !self.geometry.is_dram_address(os_phys)
            || !phys_addr.is_page_aligned()
            || !os_phys.is_page_aligned()
        {
            return Err(MonitorError::InvalidValue);
        }

        let mut enclave = self.lock_enclave(id)?;
        if enclave.is_initialized() {
            return Err(MonitorError::InvalidState);
        }
        if phys <= enclave.last_load_addr() {
            return Err(MonitorError::InvalidValue);
        }
        if !enclave.accepts_virtual(virtual_addr) {
            return Err(MonitorError::InvalidValue);
        }
        let region = self.geometry.region_for(phys_addr);
        if !self.read_enclave_bitmap_bit(enclave.id(), region) {
            return Err(MonitorError::InvalidValue);
        }

        let entry_addr =
            pagetable::walk_to_entry(&self.dram, enclave.load_eptbr(), virtual_addr, 0)
                .ok_or(MonitorError::InvalidState)?;
        if pagetable::entry_is_valid(self.dram.read_word(entry_addr)) {
            return Err(MonitorError::InvalidState);
        }

        // The source region stays locked while the page is copied so it
        // cannot be reassigned mid-copy.
        {
            let os_guard = self.try_lock_region(self.geometry.region_for(os_phys))?;
            if os_guard.owner_raw() != OWNER_OS {
                return Err(MonitorError::AccessDenied);
            }
            self.dram
                .write_word(entry_addr, pagetable::make_entry(phys, acl));
            enclave.info().set_last_load_addr(phys);
            self.dram.copy(phys_addr, os_phys, PAGE_SIZE);
        }
        enclave
            .measurement_mut()
            .extend_with_page(virtual_addr, acl, &self.dram, phys_addr);
        Ok(())
    }

    /// Seals an enclave: finalises the measurement and enables entry.
    /// Staging calls fail from here on.
    pub fn init_enclave(&self, id: u64) -> MonitorResult {
        let mut enclave = self.lock_enclave(id)?;
        if enclave.is_initialized() {
            return Err(MonitorError::InvalidState);
        }
        enclave.measurement_mut().finalize();
        enclave.info().set_initialized();
        Ok(())
    }

    /// OS staging call: creates a thread with monitor-provided entry
    /// points and measures it. Only possible after the page table root
    /// exists and before the enclave is sealed.
    pub fn load_thread(
        &self,
        id: u64,
        thread: u64,
        entry_pc: u64,
        entry_stack: u64,
        fault_pc: u64,
        fault_stack: u64,
    ) -> MonitorResult {
        let mut enclave = self.lock_enclave(id)?;
        let thread_addr = PhysAddr::new(thread);
        let region_guard = self.lock_metadata_region_for(thread_addr)?;
        if enclave.is_initialized() || enclave.load_eptbr() == 0 {
            return Err(MonitorError::InvalidState);
        }
        let pages = self.checked_thread_run(thread_addr)?;
        self.reserve_metadata_pages(thread_addr, pages, enclave.id(), MetadataPageType::Thread)?;
        region_guard.add_pinned_pages(pages);
        enclave.info().inc_thread_count();

        let init = ThreadInitInfo {
            entry_pc,
            entry_stack,
            fault_pc,
            fault_stack,
            eptbr: enclave.load_eptbr(),
        };
        // SAFETY: The pages were just reserved under the region lock.
        unsafe { self.dram.install(thread_addr, ThreadInfo::new(&init)) };

        enclave
            .measurement_mut()
            .extend_with_thread(entry_pc, entry_stack, fault_pc, fault_stack);
        Ok(())
    }

    /// OS call after sealing: grants an initialised enclave the metadata
    /// pages for one more thread. The enclave fills them in with
    /// `accept_thread`. Not measured.
    pub fn assign_thread(&self, id: u64, thread: u64) -> MonitorResult {
        let enclave = self.lock_enclave(id)?;
        let thread_addr = PhysAddr::new(thread);
        let region_guard = self.lock_metadata_region_for(thread_addr)?;
        if !enclave.is_initialized() {
            return Err(MonitorError::InvalidState);
        }
        let pages = self.checked_thread_run(thread_addr)?;
        self.grant_metadata_pages(thread_addr, pages, enclave.id())?;
        region_guard.add_pinned_pages(pages);
        enclave.info().inc_thread_count();
        Ok(())
    }

    /// Enclave call: turns pages granted by `assign_thread` into a live
    /// thread, with parameters read from an enclave-owned page.
    ///
    /// The thread was already counted by `assign_thread`, so the count
    /// stays put here.
    pub fn accept_thread(&self, thread: u64, init_info_addr: u64) -> MonitorResult {
        let Some(caller) = self.current_enclave() else {
            return Err(MonitorError::AccessDenied);
        };
        let init_phys = PhysAddr::new(init_info_addr);
        if !init_phys.is_page_aligned() || !self.geometry.is_dram_address(init_phys) {
            return Err(MonitorError::InvalidValue);
        }

        // Lock the init page's region and make sure it is really ours.
        let init_guard = self.try_lock_region(self.geometry.region_for(init_phys))?;
        if init_guard.owner_raw() != caller.0 {
            return Err(MonitorError::InvalidValue);
        }

        let thread_addr = PhysAddr::new(thread);
        let _region_guard = self.lock_metadata_region_for(thread_addr)?;
        let pages = self.checked_thread_run(thread_addr)?;
        self.accept_metadata_pages(thread_addr, pages, caller, MetadataPageType::Thread)?;

        let init: ThreadInitInfo = self.dram.read_obj(init_phys);
        // SAFETY: The pages were just accepted under the region lock.
        unsafe { self.dram.install(thread_addr, ThreadInfo::new(&init)) };
        Ok(())
    }

    /// OS call: tears down a thread that is not running and returns its
    /// metadata pages.
    pub fn delete_thread(&self, id: u64, thread: u64) -> MonitorResult {
        let enclave = self.lock_enclave(id)?;
        let thread_addr = PhysAddr::new(thread);
        let region_guard = self.lock_metadata_region_for(thread_addr)?;
        if self.read_metadata_entry(thread_addr)
            != page_info(enclave.id().0, MetadataPageType::Thread)
        {
            return Err(MonitorError::InvalidValue);
        }
        let pages = self.thread_metadata_pages();

        {
            // A running thread holds its lock from entry to exit, so a
            // failed acquisition means the thread is in use.
            // SAFETY: The map entry verified above proves a ThreadInfo
            // lives at this address while we hold the region lock.
            let thread_info: &ThreadInfo = unsafe { self.dram.obj_ref(thread_addr) };
            if !thread_info.lock.try_acquire() {
                return Err(MonitorError::ConcurrentCall);
            }
            // No release: the lock ceases to exist with the pages below.
        }

        self.release_metadata_pages(thread_addr, pages);
        region_guard.sub_pinned_pages(pages);
        enclave.info().dec_thread_count();
        self.dram.zero(thread_addr, pages << PAGE_SHIFT);
        Ok(())
    }

    /// Thread allocations must not cross a stripe; a build whose
    /// ThreadInfo would need that is structurally unsupported.
    fn checked_thread_run(&self, thread_addr: PhysAddr) -> MonitorResult<u64> {
        let pages = self.thread_metadata_pages();
        if self.geometry.stripe_page_for(thread_addr) + pages > self.geometry.stripe_pages {
            return Err(MonitorError::Unsupported);
        }
        Ok(pages)
    }

    /// Dispatches the calling core into an enclave thread: binds the core,
    /// programs the translation fences, and returns the thread's entry
    /// point and stack for the trap glue to install.
    pub fn enter_enclave(
        &self,
        id: u64,
        thread: u64,
        caller_state: &ExecState,
    ) -> MonitorResult<(u64, u64)> {
        let enclave = self.lock_enclave(id)?;
        if !enclave.is_initialized() {
            return Err(MonitorError::InvalidState);
        }
        let thread_addr = PhysAddr::new(thread);
        let _region_guard = self.lock_metadata_region_for(thread_addr)?;
        if self.read_metadata_entry(thread_addr)
            != page_info(enclave.id().0, MetadataPageType::Thread)
        {
            return Err(MonitorError::InvalidValue);
        }

        // SAFETY: The map entry verified above proves a ThreadInfo lives
        // here; its pages stay pinned until delete_thread, which needs the
        // lock we are about to take.
        let thread_info: &ThreadInfo = unsafe { self.dram.obj_ref(thread_addr) };
        // Held until exit_enclave; also excludes double entry.
        if !thread_info.lock.try_acquire() {
            return Err(MonitorError::ConcurrentCall);
        }

        thread_info.save_exit_state(caller_state);
        thread_info.clear_resume();
        enclave.info().inc_running_threads();

        let core = self.core_state();
        core.enclave_id.store(id, Ordering::Relaxed);
        core.thread_id.store(thread, Ordering::Relaxed);

        self.hw.set_ev_base(enclave.ev_base());
        self.hw.set_ev_mask(enclave.ev_mask());
        self.hw.set_epar_base(id);
        let info_size = self
            .enclave_info_size(enclave.mailbox_count())
            .unwrap_or(PAGE_SIZE);
        self.hw
            .set_epar_mask(!(bits::ceil_power_of_two(info_size) - 1));
        self.apply_enclave_bitmap(enclave.id());
        self.hw.set_eptbr(thread_info.eptbr());

        Ok((thread_info.entry_pc(), thread_info.entry_stack()))
    }

    /// Returns the calling core from enclave execution to its saved OS
    /// context. Lock-free apart from releasing the thread lock.
    ///
    /// No TLB flush happens here: zeroing the EV mask makes the enclave
    /// registers unselectable in the page walker, and the OS can always
    /// follow up with `flush_cached_dram_regions`.
    pub fn exit_enclave(&self) -> MonitorResult<ExecState> {
        let core = self.core_state();
        let id = core.enclave_id.load(Ordering::Relaxed);
        if id == 0 {
            return Err(MonitorError::InvalidState);
        }
        let thread = core.thread_id.load(Ordering::Relaxed);

        // SAFETY: The running thread's metadata is pinned while it runs,
        // and this core has held the thread lock since entry.
        let thread_info: &ThreadInfo = unsafe { self.dram.obj_ref(PhysAddr::new(thread)) };
        let state = thread_info.exit_state();

        core.enclave_id.store(0, Ordering::Relaxed);
        core.thread_id.store(0, Ordering::Relaxed);

        // A base of one page with a zero mask can never match an address,
        // so the enclave registers drop out of the walker entirely.
        self.hw.set_ev_base(PAGE_SIZE);
        self.hw.set_ev_mask(0);
        self.hw.set_eptbr(0);
        self.apply_os_bitmap();

        // SAFETY: `id` named the enclave this core was just running, so
        // its metadata is still pinned.
        let info = unsafe { self.enclave_info_unchecked(EnclaveId(id)) };
        info.dec_running_threads();
        thread_info.lock.release();
        Ok(state)
    }

    /// Destroys an enclave with no threads left: frees and zeroes every
    /// region it owns and releases its metadata allocation.
    pub fn delete_enclave(&self, id: u64) -> MonitorResult {
        let (region_guard, enclave) = self.lock_enclave_with_region(id)?;
        if enclave.thread_count() != 0 {
            return Err(MonitorError::InvalidState);
        }
        let pages = self
            .enclave_metadata_pages(enclave.mailbox_count())
            .ok_or(MonitorError::InvalidState)?;

        // All-or-nothing: take every owned region's lock before touching
        // anything, releasing the lot on any contention.
        let mut owned: ArrayVec<RegionGuard, MAX_DRAM_REGIONS> = ArrayVec::new();
        for region in 0..self.geometry.region_count {
            if !self.read_enclave_bitmap_bit(enclave.id(), region) {
                continue;
            }
            match self.try_lock_region(region) {
                Ok(guard) => owned.push(guard),
                Err(error) => return Err(error),
            }
        }

        for guard in &owned {
            guard.set_owner_raw(crate::regions::OWNER_FREE);
            guard.set_pinned_pages(0);
            self.zero_region(guard.index());
        }
        drop(owned);

        let addr = PhysAddr::new(enclave.id().0);
        // The enclave lock ceases to exist with its pages; forget the
        // guard so drop doesn't write into released memory.
        core::mem::forget(enclave);
        self.dram.zero(addr, pages << PAGE_SHIFT);
        self.release_metadata_pages(addr, pages);
        region_guard.sub_pinned_pages(pages);
        Ok(())
    }

    /// Copies one page between a debug enclave and OS memory, in either
    /// direction.
    pub fn copy_debug_enclave_page(
        &self,
        id: u64,
        enclave_addr: u64,
        os_addr: u64,
        read_from_enclave: bool,
    ) -> MonitorResult {
        let enclave_phys = PhysAddr::new(enclave_addr);
        let os_phys = PhysAddr::new(os_addr);
        if !enclave_phys.is_page_aligned() || !os_phys.is_page_aligned() {
            return Err(MonitorError::InvalidValue);
        }
        if !self.geometry.is_dram_address(enclave_phys) || !self.geometry.is_dram_address(os_phys) {
            return Err(MonitorError::InvalidValue);
        }

        let enclave = self.lock_enclave(id)?;
        if !enclave.is_debug() {
            return Err(MonitorError::InvalidState);
        }

        let enclave_region = self.geometry.region_for(enclave_phys);
        let os_region = self.geometry.region_for(os_phys);
        let os_guard = self.try_lock_region(os_region)?;
        if os_guard.owner_raw() != OWNER_OS {
            return Err(MonitorError::InvalidValue);
        }
        // Holding the enclave-side region lock keeps the owner from
        // blocking it out from under the copy. A region owned by the
        // enclave is never also OS-owned, so distinct indices are implied
        // by the two ownership checks.
        let _enclave_region_guard = if enclave_region != os_region {
            Some(self.try_lock_region(enclave_region)?)
        } else {
            None
        };
        if !self.read_enclave_bitmap_bit(enclave.id(), enclave_region) {
            return Err(MonitorError::InvalidValue);
        }

        if read_from_enclave {
            self.dram.copy(os_phys, enclave_phys, PAGE_SIZE);
        } else {
            self.dram.copy(enclave_phys, os_phys, PAGE_SIZE);
        }
        Ok(())
    }

    /// Zeroes every stripe of a region.
    fn zero_region(&self, region: usize) {
        for stripe in 0..self.geometry.stripes_per_region() {
            self.dram.zero(
                self.geometry.stripe_start(region, stripe),
                self.geometry.stripe_size,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::RegionStateTag,
        hardware::fake::FakeHardware,
        measure::Measurement,
        platform::test::test_monitor,
    };

    const EV_BASE: u64 = 0x4000_0000;
    const EV_MASK: u64 = 0x0fff_ffff;

    /// One staged enclave: metadata in region 2, data in a region of its
    /// own, three page table levels, one data page, one thread.
    struct Staged {
        id: u64,
        thread: u64,
        os_page: PhysAddr,
        data_region: usize,
    }

    fn metadata_page(monitor: &Monitor<FakeHardware>, index: u64) -> u64 {
        monitor.geometry.region_start(2).add(index << PAGE_SHIFT).value()
    }

    /// Builds an enclave through the canonical lifecycle, stopping before
    /// `init_enclave`.
    fn stage_enclave(
        monitor: &Monitor<FakeHardware>,
        id_page: u64,
        thread_page: u64,
        data_region: usize,
        debug: bool,
    ) -> Staged {
        let _ = monitor.create_metadata_region(2);
        let id = metadata_page(monitor, id_page);
        let thread = metadata_page(monitor, thread_page);
        monitor.create_enclave(id, EV_BASE, EV_MASK, 1, debug).unwrap();
        monitor.assign_dram_region(data_region, id).unwrap();

        let table = |page: u64| {
            monitor
                .geometry
                .region_start(data_region)
                .add(page << PAGE_SHIFT)
                .value()
        };
        monitor.load_page_table(id, table(0), 0, 2, 0).unwrap();
        monitor.load_page_table(id, table(1), EV_BASE, 1, 0x7).unwrap();
        monitor.load_page_table(id, table(2), EV_BASE, 0, 0x7).unwrap();

        // A recognisable OS page to copy in.
        let os_page = PhysAddr::new(monitor.geometry.dram_base + 0x3000);
        for word in 0..(PAGE_SIZE / 8) {
            monitor.dram.write_word(os_page.add(word * 8), word ^ 0x5a5a);
        }
        monitor
            .load_page(id, table(3), EV_BASE, os_page.value(), 0xf)
            .unwrap();

        monitor
            .load_thread(id, thread, EV_BASE, EV_BASE + 0x8000, EV_BASE + 0x100, EV_BASE + 0x9000)
            .unwrap();

        Staged {
            id,
            thread,
            os_page,
            data_region,
        }
    }

    #[test]
    fn canonical_lifecycle_measurement_replays() {
        let monitor = test_monitor();
        let staged = stage_enclave(&monitor, 1, 2, 7, false);
        monitor.init_enclave(staged.id).unwrap();

        // Replay the same trace through a reference measurement.
        let mut reference = Measurement::init(EV_BASE, EV_MASK, 1, false);
        reference.extend_with_page_table(0, 0, 2);
        reference.extend_with_page_table(EV_BASE, 0x7, 1);
        reference.extend_with_page_table(EV_BASE, 0x7, 0);
        reference.extend_with_page(EV_BASE, 0xf, &monitor.dram, staged.os_page);
        reference.extend_with_thread(
            EV_BASE,
            EV_BASE + 0x8000,
            EV_BASE + 0x100,
            EV_BASE + 0x9000,
        );
        reference.finalize();

        let enclave = monitor.lock_enclave(staged.id).unwrap();
        assert_eq!(enclave.measurement().value(), reference.value());
    }

    #[test]
    fn loaded_page_carries_os_contents() {
        let monitor = test_monitor();
        let staged = stage_enclave(&monitor, 1, 2, 7, false);
        let copied = monitor
            .geometry
            .region_start(staged.data_region)
            .add(3 << PAGE_SHIFT);
        assert_eq!(monitor.dram.read_word(copied), 0x5a5a);
        assert_eq!(
            monitor.dram.read_word(copied.add(8)),
            1 ^ 0x5a5a
        );
    }

    #[test]
    fn out_of_order_loads_are_rejected() {
        let monitor = test_monitor();
        let staged = stage_enclave(&monitor, 1, 2, 7, false);
        let earlier = monitor.geometry.region_start(staged.data_region).value();
        assert_eq!(
            monitor.load_page(staged.id, earlier, EV_BASE + 0x1000, staged.os_page.value(), 0xf),
            Err(MonitorError::InvalidValue)
        );
    }

    #[test]
    fn sealing_stops_staging() {
        let monitor = test_monitor();
        let staged = stage_enclave(&monitor, 1, 2, 7, false);
        monitor.init_enclave(staged.id).unwrap();

        let next = monitor
            .geometry
            .region_start(staged.data_region)
            .add(4 << PAGE_SHIFT)
            .value();
        assert_eq!(
            monitor.load_page_table(staged.id, next, EV_BASE, 0, 0x7),
            Err(MonitorError::InvalidState)
        );
        assert_eq!(
            monitor.load_page(staged.id, next, EV_BASE + 0x1000, staged.os_page.value(), 0xf),
            Err(MonitorError::InvalidState)
        );
        assert_eq!(
            monitor.init_enclave(staged.id),
            Err(MonitorError::InvalidState)
        );
    }

    #[test]
    fn debug_flag_changes_measurement_and_gates_copies() {
        let monitor = test_monitor();
        let debug = stage_enclave(&monitor, 1, 2, 7, true);
        let production = stage_enclave(&monitor, 3, 4, 8, false);
        monitor.init_enclave(debug.id).unwrap();
        monitor.init_enclave(production.id).unwrap();

        let debug_hash = {
            let enclave = monitor.lock_enclave(debug.id).unwrap();
            *enclave.measurement().value()
        };
        let production_hash = {
            let enclave = monitor.lock_enclave(production.id).unwrap();
            *enclave.measurement().value()
        };
        assert_ne!(debug_hash, production_hash);

        // The OS can reach into the debug enclave, but not the other.
        let debug_page = monitor.geometry.region_start(debug.data_region).add(3 << PAGE_SHIFT);
        let os_page = PhysAddr::new(monitor.geometry.dram_base + 0x4000);
        assert_eq!(
            monitor.copy_debug_enclave_page(debug.id, debug_page.value(), os_page.value(), true),
            Ok(())
        );
        assert_eq!(monitor.dram.read_word(os_page), 0x5a5a);

        let production_page = monitor
            .geometry
            .region_start(production.data_region)
            .add(3 << PAGE_SHIFT);
        assert_eq!(
            monitor.copy_debug_enclave_page(
                production.id,
                production_page.value(),
                os_page.value(),
                true
            ),
            Err(MonitorError::InvalidState)
        );
    }

    #[test]
    fn bitmap_matches_ownership() {
        let monitor = test_monitor();
        let staged = stage_enclave(&monitor, 1, 2, 7, false);
        monitor.assign_dram_region(9, staged.id).unwrap();

        let id = EnclaveId(staged.id);
        for region in 0..monitor.geometry.region_count {
            let owned = monitor.dram_region_owner(region) == staged.id;
            assert_eq!(
                monitor.read_enclave_bitmap_bit(id, region),
                owned,
                "region {region}"
            );
        }
        // SAFETY: The enclave exists and nothing else runs in this test.
        let info = unsafe { monitor.enclave_info_unchecked(id) };
        assert_eq!(info.dram_region_count(), 2);
    }

    #[test]
    fn failed_calls_leave_no_trace() {
        let monitor = test_monitor();
        let staged = stage_enclave(&monitor, 1, 2, 7, false);
        let control = stage_enclave(&monitor, 3, 4, 8, false);

        // A load from a non-OS source page must not advance anything.
        let enclave_owned = monitor.geometry.region_start(7).add(5 << PAGE_SHIFT);
        let next = monitor.geometry.region_start(7).add(4 << PAGE_SHIFT).value();
        assert_eq!(
            monitor.load_page(staged.id, next, EV_BASE + 0x1000, enclave_owned.value(), 0xf),
            Err(MonitorError::AccessDenied)
        );

        monitor.init_enclave(staged.id).unwrap();
        monitor.init_enclave(control.id).unwrap();
        let staged_hash = {
            let enclave = monitor.lock_enclave(staged.id).unwrap();
            *enclave.measurement().value()
        };
        let control_hash = {
            let enclave = monitor.lock_enclave(control.id).unwrap();
            *enclave.measurement().value()
        };
        assert_eq!(staged_hash, control_hash);
    }

    #[test]
    fn enter_and_exit_program_the_walker() {
        let monitor = test_monitor();
        let staged = stage_enclave(&monitor, 1, 2, 7, false);
        monitor.init_enclave(staged.id).unwrap();

        let mut caller = ExecState::EMPTY;
        caller.pc = 0xc0de;
        caller.stack = 0xbeef;
        let (pc, stack) = monitor
            .enter_enclave(staged.id, staged.thread, &caller)
            .unwrap();
        assert_eq!(pc, EV_BASE);
        assert_eq!(stack, EV_BASE + 0x8000);

        let registers = monitor.hw.registers();
        assert_eq!(registers.ev_base, EV_BASE);
        assert_eq!(registers.ev_mask, EV_MASK);
        assert_eq!(registers.epar_base, staged.id);
        assert_eq!(
            registers.eptbr,
            monitor.geometry.region_start(7).value() | (8 << 60)
        );
        assert_eq!(registers.enclave_region_bitmap, std::vec![1 << 7]);

        // Entering the same thread again collides with the held lock.
        assert_eq!(
            monitor.enter_enclave(staged.id, staged.thread, &caller),
            Err(MonitorError::ConcurrentCall)
        );

        // The enclave can verify its own holdings now.
        assert_eq!(monitor.dram_region_check_ownership(7), Ok(()));
        assert_eq!(
            monitor.dram_region_check_ownership(8),
            Err(MonitorError::InvalidState)
        );

        let restored = monitor.exit_enclave().unwrap();
        assert_eq!(restored.pc, 0xc0de);
        assert_eq!(restored.stack, 0xbeef);
        let registers = monitor.hw.registers();
        assert_eq!(registers.ev_base, PAGE_SIZE);
        assert_eq!(registers.ev_mask, 0);
        assert_eq!(registers.os_region_bitmap, std::vec![1]);

        // A second exit has nothing to return from.
        assert_eq!(monitor.exit_enclave(), Err(MonitorError::InvalidState));
    }

    #[test]
    fn enclave_blocks_its_own_region() {
        let monitor = test_monitor();
        let staged = stage_enclave(&monitor, 1, 2, 7, false);
        monitor.init_enclave(staged.id).unwrap();
        monitor.assign_dram_region(9, staged.id).unwrap();

        // The OS is not the owner.
        assert_eq!(
            monitor.block_dram_region(9),
            Err(MonitorError::AccessDenied)
        );

        let caller = ExecState::EMPTY;
        monitor
            .enter_enclave(staged.id, staged.thread, &caller)
            .unwrap();
        assert_eq!(monitor.block_dram_region(9), Ok(()));
        assert_eq!(monitor.dram_region_state(9), RegionStateTag::Blocked);
        // The live bitmap no longer matches the blocked region.
        assert_eq!(
            monitor.hw.registers().enclave_region_bitmap,
            std::vec![1 << 7]
        );
        monitor.exit_enclave().unwrap();
    }

    #[test]
    fn thread_grant_and_accept() {
        let monitor = test_monitor();
        let staged = stage_enclave(&monitor, 1, 2, 7, false);

        // Post-init only.
        let second_thread = metadata_page(&monitor, 3);
        assert_eq!(
            monitor.assign_thread(staged.id, second_thread),
            Err(MonitorError::InvalidState)
        );
        monitor.init_enclave(staged.id).unwrap();
        monitor.assign_thread(staged.id, second_thread).unwrap();

        // Accepting requires running as the enclave.
        let init_page = monitor.geometry.region_start(7).add(5 << PAGE_SHIFT);
        assert_eq!(
            monitor.accept_thread(second_thread, init_page.value()),
            Err(MonitorError::AccessDenied)
        );

        let caller = ExecState::EMPTY;
        monitor
            .enter_enclave(staged.id, staged.thread, &caller)
            .unwrap();
        let init = ThreadInitInfo {
            entry_pc: EV_BASE + 0x2000,
            entry_stack: EV_BASE + 0xa000,
            fault_pc: EV_BASE + 0x2100,
            fault_stack: EV_BASE + 0xb000,
            eptbr: monitor.geometry.region_start(7).value(),
        };
        monitor.dram.write_obj(init_page, &init);
        monitor
            .accept_thread(second_thread, init_page.value())
            .unwrap();
        monitor.exit_enclave().unwrap();

        // The accepted thread is enterable.
        let (pc, _) = monitor
            .enter_enclave(staged.id, second_thread, &caller)
            .unwrap();
        assert_eq!(pc, EV_BASE + 0x2000);
        monitor.exit_enclave().unwrap();
    }

    #[test]
    fn delete_requires_no_threads_then_scrubs() {
        let monitor = test_monitor();
        let staged = stage_enclave(&monitor, 1, 2, 7, false);
        monitor.init_enclave(staged.id).unwrap();

        assert_eq!(
            monitor.delete_enclave(staged.id),
            Err(MonitorError::InvalidState)
        );
        monitor.delete_thread(staged.id, staged.thread).unwrap();
        monitor.delete_enclave(staged.id).unwrap();

        // The data region is free again and scrubbed.
        assert_eq!(monitor.dram_region_state(7), RegionStateTag::Free);
        let copied = monitor.geometry.region_start(7).add(3 << PAGE_SHIFT);
        assert_eq!(monitor.dram.read_word(copied), 0);

        // The id no longer names an enclave, and the metadata region can
        // go away entirely.
        assert_eq!(
            monitor.lock_enclave(staged.id).err(),
            Some(MonitorError::InvalidValue)
        );
        assert_eq!(monitor.free_dram_region(2), Ok(()));
    }

    #[test]
    fn delete_thread_refuses_running_threads() {
        let monitor = test_monitor();
        let staged = stage_enclave(&monitor, 1, 2, 7, false);
        monitor.init_enclave(staged.id).unwrap();

        let caller = ExecState::EMPTY;
        monitor
            .enter_enclave(staged.id, staged.thread, &caller)
            .unwrap();
        monitor.hw.set_current_core(1);
        assert_eq!(
            monitor.delete_thread(staged.id, staged.thread),
            Err(MonitorError::ConcurrentCall)
        );
        monitor.hw.set_current_core(0);
        monitor.exit_enclave().unwrap();
        assert_eq!(monitor.delete_thread(staged.id, staged.thread), Ok(()));
    }

    #[test]
    fn load_thread_needs_a_page_table_root() {
        let monitor = test_monitor();
        monitor.create_metadata_region(2).unwrap();
        let id = metadata_page(&monitor, 1);
        monitor.create_enclave(id, EV_BASE, EV_MASK, 1, false).unwrap();
        assert_eq!(
            monitor.load_thread(id, metadata_page(&monitor, 2), 0, 0, 0, 0),
            Err(MonitorError::InvalidState)
        );
    }

    #[test]
    fn create_enclave_validates_the_virtual_range() {
        let monitor = test_monitor();
        monitor.create_metadata_region(2).unwrap();
        let id = metadata_page(&monitor, 1);
        assert_eq!(
            monitor.create_enclave(id, 0x4000_1000, EV_MASK, 1, false),
            Err(MonitorError::InvalidValue)
        );
        assert_eq!(
            monitor.create_enclave(id, EV_BASE, 0x7ff, 1, false),
            Err(MonitorError::InvalidValue)
        );
    }

    #[test]
    fn metadata_region_tracks_pinning() {
        let monitor = test_monitor();
        let staged = stage_enclave(&monitor, 1, 2, 7, false);

        // Enclave info and one thread are pinned, so the region cannot go.
        assert_eq!(
            monitor.free_dram_region(2),
            Err(MonitorError::InvalidState)
        );
        monitor.init_enclave(staged.id).unwrap();
        monitor.delete_thread(staged.id, staged.thread).unwrap();
        assert_eq!(
            monitor.free_dram_region(2),
            Err(MonitorError::InvalidState)
        );
        monitor.delete_enclave(staged.id).unwrap();
        assert_eq!(monitor.free_dram_region(2), Ok(()));
    }
}
