// Copyright The Citadel SM Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! A fake platform for unit tests: four cores, a 4 MiB DRAM arena on the
//! host heap, and an LLC geometry that yields exactly 64 regions of one
//! 64 KiB stripe each.

use super::Platform;
use crate::{
    attestation::AttestationData,
    dram::{Dram, DramGeometry},
    hardware::fake::FakeHardware,
    logger::LogSink,
    monitor::Monitor,
};
use core::fmt;
use std::io::{Write, stdout};
use std::{boxed::Box, vec};

/// A fake platform for unit tests.
pub struct TestPlatform;

impl Platform for TestPlatform {
    const CORE_COUNT: usize = 4;
    const DRAM_BASE: u64 = 0x8000_0000;
    const DRAM_SIZE: u64 = 0x40_0000;
    const CACHE_LEVELS: usize = 2;
    const LLC_LINE_SIZE: u64 = 64;
    const LLC_SET_COUNT: u64 = 4096;
    const MIN_CACHE_INDEX_SHIFT: u32 = 0;
    const MAX_CACHE_INDEX_SHIFT: u32 = 16;

    type LogSinkImpl = StdOutSink;

    fn cache_is_shared(level: usize) -> bool {
        level == 1
    }

    fn attestation_data() -> AttestationData {
        AttestationData {
            device_public_key: [0xd0; 32],
            sm_measurement: [0x5a; 64],
            sm_public_key: [0xd5; 32],
            sm_secret_key: [0x6b; 64],
            device_signature: [0x51; 64],
        }
    }

    fn monitor_image_top() -> u64 {
        // Pretend the monitor image occupies the first two pages of DRAM.
        Self::DRAM_BASE + 0x2000
    }
}

/// A log sink for tests which writes logs to standard output.
pub struct StdOutSink;

impl LogSink for StdOutSink {
    fn write_fmt(&self, args: fmt::Arguments) {
        stdout().write_fmt(args).unwrap();
    }
}

/// Allocates a fresh zeroed DRAM arena and leaks it for the life of the
/// test process.
pub fn test_dram() -> Dram {
    let arena = Box::leak(vec![0u8; TestPlatform::DRAM_SIZE as usize].into_boxed_slice());
    // SAFETY: The leaked arena is exclusively owned by the returned
    // accessor and lives forever.
    unsafe {
        Dram::new(
            TestPlatform::DRAM_BASE,
            TestPlatform::DRAM_SIZE,
            arena.as_mut_ptr(),
        )
    }
}

/// Builds a freshly booted monitor over fake hardware and a private arena.
pub fn test_monitor() -> Monitor<FakeHardware> {
    let geometry = DramGeometry::compute::<TestPlatform>();
    Monitor::new(
        FakeHardware::new(),
        geometry,
        test_dram(),
        TestPlatform::attestation_data(),
        TestPlatform::CORE_COUNT,
    )
}
