// Copyright The Citadel SM Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Dispatch from the trap glue into monitor operations.
//!
//! The trap entry code saves the caller's registers, identifies which
//! privilege level trapped, and hands the argument registers here. The
//! function identifier travels in the first register, operands in the
//! rest; the return value is a single word written back to the caller's
//! first register. `enter_enclave` and `exit_enclave` additionally redirect
//! the saved execution context.

use crate::{
    api::{EnclaveCall, ExecState, MONITOR_OK, MonitorError, OsCall, result_word},
    hardware::HardwareOps,
    monitor::Monitor,
};

/// Number of argument registers the trap glue captures for a call.
pub const CALL_ARG_COUNT: usize = 8;

impl<H: HardwareOps> Monitor<H> {
    /// Handles an environment call from the OS (S-mode).
    ///
    /// `exec` is the caller's saved context; entering an enclave redirects
    /// it to the thread's entry point.
    pub fn handle_os_call(&self, regs: &[u64; CALL_ARG_COUNT], exec: &mut ExecState) -> u64 {
        let Ok(call) = OsCall::try_from(regs[0]) else {
            return MonitorError::Unsupported.into();
        };

        match call {
            OsCall::SetDmaRange => result_word(self.set_dma_range(regs[1], regs[2])),
            OsCall::DramRegionState => self.dram_region_state(regs[1] as usize).into(),
            OsCall::DramRegionOwner => self.dram_region_owner(regs[1] as usize),
            OsCall::AssignDramRegion => {
                result_word(self.assign_dram_region(regs[1] as usize, regs[2]))
            }
            OsCall::FreeDramRegion => result_word(self.free_dram_region(regs[1] as usize)),
            OsCall::FlushCachedDramRegions => {
                self.flush_cached_dram_regions();
                MONITOR_OK
            }
            OsCall::CreateMetadataRegion => {
                result_word(self.create_metadata_region(regs[1] as usize))
            }
            OsCall::MetadataRegionPages => self.metadata_region_pages(),
            OsCall::MetadataRegionStart => self.metadata_region_start(),
            OsCall::ThreadMetadataPages => self.thread_metadata_pages(),
            OsCall::EnclaveMetadataPages => self.enclave_metadata_pages(regs[1]).unwrap_or(0),
            OsCall::BlockDramRegion => result_word(self.block_dram_region(regs[1] as usize)),
            OsCall::CreateEnclave => result_word(self.create_enclave(
                regs[1],
                regs[2],
                regs[3],
                regs[4],
                regs[5] != 0,
            )),
            OsCall::LoadPageTable => {
                result_word(self.load_page_table(regs[1], regs[2], regs[3], regs[4], regs[5]))
            }
            OsCall::LoadPage => {
                result_word(self.load_page(regs[1], regs[2], regs[3], regs[4], regs[5]))
            }
            OsCall::LoadThread => result_word(self.load_thread(
                regs[1], regs[2], regs[3], regs[4], regs[5], regs[6],
            )),
            OsCall::AssignThread => result_word(self.assign_thread(regs[1], regs[2])),
            OsCall::InitEnclave => result_word(self.init_enclave(regs[1])),
            OsCall::EnterEnclave => match self.enter_enclave(regs[1], regs[2], exec) {
                Ok((pc, stack)) => {
                    exec.pc = pc;
                    exec.stack = stack;
                    MONITOR_OK
                }
                Err(error) => error.into(),
            },
            OsCall::DeleteThread => result_word(self.delete_thread(regs[1], regs[2])),
            OsCall::DeleteEnclave => result_word(self.delete_enclave(regs[1])),
            OsCall::CopyDebugEnclavePage => result_word(self.copy_debug_enclave_page(
                regs[1],
                regs[2],
                regs[3],
                regs[4] != 0,
            )),
            OsCall::FetchField => result_word(self.fetch_field(regs[1], regs[2], regs[3])),
        }
    }

    /// Handles an environment call from enclave user mode.
    ///
    /// Exiting an enclave replaces `exec` with the context saved when the
    /// thread was entered.
    pub fn handle_enclave_call(&self, regs: &[u64; CALL_ARG_COUNT], exec: &mut ExecState) -> u64 {
        let Ok(call) = EnclaveCall::try_from(regs[0]) else {
            return MonitorError::Unsupported.into();
        };

        match call {
            EnclaveCall::BlockDramRegion => result_word(self.block_dram_region(regs[1] as usize)),
            EnclaveCall::DramRegionCheckOwnership => {
                result_word(self.dram_region_check_ownership(regs[1] as usize))
            }
            EnclaveCall::AcceptThread => result_word(self.accept_thread(regs[1], regs[2])),
            EnclaveCall::ExitEnclave => match self.exit_enclave() {
                Ok(state) => {
                    *exec = state;
                    MONITOR_OK
                }
                Err(error) => error.into(),
            },
            EnclaveCall::GetAttestationKey => result_word(self.get_attestation_key(regs[1])),
            EnclaveCall::AcceptMessage => result_word(self.accept_message(regs[1], regs[2])),
            EnclaveCall::ReadMessage => result_word(self.read_message(regs[1], regs[2])),
            EnclaveCall::SendMessage => {
                result_word(self.send_message(regs[1], regs[2], regs[3]))
            }
            EnclaveCall::FetchField => result_word(self.fetch_field(regs[1], regs[2], regs[3])),
        }
    }
}
