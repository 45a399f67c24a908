// Copyright The Citadel SM Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! The Riscy research SoC: one hart, 2 GiB of DRAM, and a 2 MiB shared L2
//! acting as the last-level cache.

use super::Platform;
use crate::{attestation::AttestationData, logger::LockedWriter};
use core::fmt::{self, Write};

// Provisioned by the device blob and located by the linker script.
unsafe extern "C" {
    static CITADEL_DEVICE_PUBLIC_KEY: [u8; 32];
    static CITADEL_SM_MEASUREMENT: [u8; 64];
    static CITADEL_SM_PUBLIC_KEY: [u8; 32];
    static CITADEL_SM_SECRET_KEY: [u8; 64];
    static CITADEL_DEVICE_SIGNATURE: [u8; 64];
    static __monitor_end: u8;
}

const HTIF_TOHOST: *mut u64 = 0x4000_0000 as *mut u64;

/// Console writer backed by the host-target interface register.
pub struct HtifConsole;

impl Write for HtifConsole {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            // SAFETY: The HTIF register is a device location the platform
            // reserves for console output; writes have no other effect.
            unsafe {
                HTIF_TOHOST.write_volatile((1 << 56) | (1 << 48) | u64::from(byte));
            }
        }
        Ok(())
    }
}

/// The Riscy platform.
pub struct Riscy;

impl Platform for Riscy {
    const CORE_COUNT: usize = 1;
    const DRAM_BASE: u64 = 0x8000_0000;
    const DRAM_SIZE: u64 = 0x8000_0000;
    const CACHE_LEVELS: usize = 2;
    const LLC_LINE_SIZE: u64 = 64;
    const LLC_SET_COUNT: u64 = 4096;
    const MIN_CACHE_INDEX_SHIFT: u32 = 0;
    const MAX_CACHE_INDEX_SHIFT: u32 = 16;

    type LogSinkImpl = LockedWriter<HtifConsole>;

    fn cache_is_shared(level: usize) -> bool {
        // Only the L2 is shared.
        level == 1
    }

    fn attestation_data() -> AttestationData {
        // SAFETY: The statics are read-only data placed by the boot blob
        // before the monitor starts; nothing ever writes them.
        unsafe {
            AttestationData {
                device_public_key: CITADEL_DEVICE_PUBLIC_KEY,
                sm_measurement: CITADEL_SM_MEASUREMENT,
                sm_public_key: CITADEL_SM_PUBLIC_KEY,
                sm_secret_key: CITADEL_SM_SECRET_KEY,
                device_signature: CITADEL_DEVICE_SIGNATURE,
            }
        }
    }

    fn monitor_image_top() -> u64 {
        // SAFETY: Only the symbol's address is taken, never its contents.
        let end = unsafe { &raw const __monitor_end };
        end as usize as u64
    }
}
