// Copyright The Citadel SM Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! A recording fake of the isolation hardware for unit tests.
//!
//! Every façade effect is captured so tests can assert on the exact
//! register programming an operation produced. The current core index is
//! settable, which lets a single-threaded test exercise the multi-core
//! protocols (generation clock advancement, per-core bindings).

use super::HardwareOps;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::mutex::SpinMutex;
use std::vec::Vec;

/// The register state captured by the fake.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FakeRegisters {
    /// Last EVBASE write.
    pub ev_base: u64,
    /// Last EVMASK write.
    pub ev_mask: u64,
    /// Last EPARBASE write.
    pub epar_base: u64,
    /// Last EPARMASK write.
    pub epar_mask: u64,
    /// Last PARBASE write.
    pub par_base: u64,
    /// Last PARMASK write.
    pub par_mask: u64,
    /// Last EPTBR write, mode nibble included.
    pub eptbr: u64,
    /// Last OS region bitmap load.
    pub os_region_bitmap: Vec<u64>,
    /// Last enclave region bitmap load.
    pub enclave_region_bitmap: Vec<u64>,
    /// Last DMARBASE write.
    pub dmar_base: u64,
    /// Last DMARMASK write.
    pub dmar_mask: u64,
    /// Last cache index shift write.
    pub cache_index_shift: u32,
    /// Number of TLB flushes issued, any core.
    pub tlb_flushes: u64,
}

/// Fake hardware instance handed to a test `Monitor`.
pub struct FakeHardware {
    registers: SpinMutex<FakeRegisters>,
    current_core: AtomicUsize,
}

impl FakeHardware {
    /// Creates a fake with all registers zeroed and core 0 current.
    pub fn new() -> Self {
        Self {
            registers: SpinMutex::new(FakeRegisters::default()),
            current_core: AtomicUsize::new(0),
        }
    }

    /// Makes subsequent monitor calls appear to come from `core`.
    pub fn set_current_core(&self, core: usize) {
        self.current_core.store(core, Ordering::Relaxed);
    }

    /// A copy of the captured register state.
    pub fn registers(&self) -> FakeRegisters {
        self.registers.lock().clone()
    }
}

impl Default for FakeHardware {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwareOps for FakeHardware {
    fn current_core(&self) -> usize {
        self.current_core.load(Ordering::Relaxed)
    }

    fn set_ev_base(&self, value: u64) {
        self.registers.lock().ev_base = value;
    }

    fn set_ev_mask(&self, value: u64) {
        self.registers.lock().ev_mask = value;
    }

    fn set_epar_base(&self, value: u64) {
        self.registers.lock().epar_base = value;
    }

    fn set_epar_mask(&self, value: u64) {
        self.registers.lock().epar_mask = value;
    }

    fn set_par_base(&self, value: u64) {
        self.registers.lock().par_base = value;
    }

    fn set_par_mask(&self, value: u64) {
        self.registers.lock().par_mask = value;
    }

    fn set_eptbr(&self, value: u64) {
        self.registers.lock().eptbr = (value & (u64::MAX >> 4)) | (8 << 60);
    }

    fn set_os_region_bitmap(&self, words: &[u64]) {
        self.registers.lock().os_region_bitmap = words.to_vec();
    }

    fn set_enclave_region_bitmap(&self, words: &[u64]) {
        self.registers.lock().enclave_region_bitmap = words.to_vec();
    }

    fn set_dmar_base(&self, value: u64) {
        self.registers.lock().dmar_base = value;
    }

    fn set_dmar_mask(&self, value: u64) {
        self.registers.lock().dmar_mask = value;
    }

    fn set_cache_index_shift(&self, shift: u32) {
        self.registers.lock().cache_index_shift = shift;
    }

    fn flush_tlbs(&self) {
        self.registers.lock().tlb_flushes += 1;
    }
}
