// Copyright The Citadel SM Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Compile-time platform description.
//!
//! A platform contributes the constants the boot sequence derives the DRAM
//! partition from, a log sink, and the device-provisioned attestation
//! material. The monitor core never reads hardware discovery registers at
//! runtime; everything is fixed here.

#[cfg(not(test))]
pub(crate) mod riscy;
#[cfg(not(test))]
pub use riscy::Riscy as PlatformImpl;

#[cfg(test)]
pub mod test;
#[cfg(test)]
pub use test::TestPlatform as PlatformImpl;

use crate::{attestation::AttestationData, logger::LogSink};

/// The hooks implemented by all platforms.
pub trait Platform {
    /// The number of CPU cores.
    const CORE_COUNT: usize;

    /// First physical address of DRAM.
    const DRAM_BASE: u64;

    /// Size of DRAM in bytes. Must be a power of two.
    const DRAM_SIZE: u64;

    /// Number of cache levels.
    const CACHE_LEVELS: usize;

    /// Line size of the last-level cache, in bytes.
    const LLC_LINE_SIZE: u64;

    /// Number of sets in the last-level cache.
    const LLC_SET_COUNT: u64;

    /// Smallest cache index shift the hardware rotation supports.
    const MIN_CACHE_INDEX_SHIFT: u32;

    /// Largest cache index shift the hardware rotation supports.
    const MAX_CACHE_INDEX_SHIFT: u32;

    /// Platform dependent LogSink implementation type.
    type LogSinkImpl: LogSink;

    /// True if the given cache level is shared between cores. The monitor
    /// requires that only the last level is.
    fn cache_is_shared(level: usize) -> bool;

    /// The attestation material provisioned on this device: keys, the
    /// monitor measurement, and the device signature over it.
    fn attestation_data() -> AttestationData;

    /// First physical address above the monitor's own image. Everything
    /// below it is fenced off from the OS by the protected address range.
    fn monitor_image_top() -> u64;
}
