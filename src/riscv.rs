// Copyright The Citadel SM Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Thin wrappers over RISC-V instructions the monitor needs outside the
//! CSR façade.

#[cfg(target_arch = "riscv64")]
use core::arch::asm;

/// Waits for an interrupt.
#[cfg(target_arch = "riscv64")]
pub fn wfi() {
    // SAFETY: wfi has no memory-safety preconditions.
    unsafe { asm!("wfi", options(nostack, nomem)) }
}
