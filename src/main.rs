// Copyright The Citadel SM Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Citadel SM: a cache-partitioning security monitor for RISC-V M-mode.

#![cfg_attr(not(test), no_main)]
#![cfg_attr(not(test), no_std)]

mod api;
mod attestation;
mod bits;
mod calls;
mod debug;
mod dram;
mod enclave;
mod hardware;
mod logger;
mod mailbox;
mod measure;
mod metadata;
mod monitor;
mod pagetable;
mod platform;
mod regions;
mod riscv;
mod sync;

#[cfg(all(not(test), target_arch = "riscv64"))]
mod boot {
    use crate::{
        api::ExecState,
        calls::CALL_ARG_COUNT,
        dram::{Dram, DramGeometry},
        hardware::MachineCsrs,
        logger,
        monitor::Monitor,
        platform::{Platform, PlatformImpl},
        riscv::wfi,
    };
    use log::info;
    use spin::Once;

    static MONITOR: Once<Monitor<MachineCsrs>> = Once::new();

    fn monitor() -> &'static Monitor<MachineCsrs> {
        MONITOR.get().expect("monitor not booted")
    }

    /// Cold-boot entry, reached from the boot loader after the
    /// root-of-trust check with a zeroed BSS and a valid stack.
    #[unsafe(no_mangle)]
    extern "C" fn sm_main(hart_id: u64, device_tree: u64) -> ! {
        let _ = logger::init(logger::LockedWriter::new(crate::platform::riscy::HtifConsole));
        info!("citadel-sm starting on hart {hart_id}, dtb {device_tree:#x}");

        let geometry = DramGeometry::compute::<PlatformImpl>();
        // SAFETY: DRAM is identity-mapped for the monitor and nothing else
        // runs yet; the accessor becomes the single owner of the span.
        let dram = unsafe {
            Dram::new(
                PlatformImpl::DRAM_BASE,
                PlatformImpl::DRAM_SIZE,
                PlatformImpl::DRAM_BASE as *mut u8,
            )
        };
        let monitor = MONITOR.call_once(|| {
            Monitor::new(
                MachineCsrs,
                geometry,
                dram,
                PlatformImpl::attestation_data(),
                PlatformImpl::CORE_COUNT,
            )
        });
        monitor.apply_boot_protection(PlatformImpl::monitor_image_top());
        info!("handing off to the OS");

        // The trap glue takes over from here; this hart idles until the
        // first environment call arrives.
        loop {
            wfi();
        }
    }

    /// Environment call entry for the OS, invoked by the trap glue with
    /// the saved argument registers and execution context.
    #[unsafe(no_mangle)]
    extern "C" fn sm_os_ecall(regs: &[u64; CALL_ARG_COUNT], exec: &mut ExecState) -> u64 {
        monitor().handle_os_call(regs, exec)
    }

    /// Environment call entry for enclave user mode.
    #[unsafe(no_mangle)]
    extern "C" fn sm_enclave_ecall(regs: &[u64; CALL_ARG_COUNT], exec: &mut ExecState) -> u64 {
        monitor().handle_enclave_call(regs, exec)
    }
}
