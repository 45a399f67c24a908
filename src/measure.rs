// Copyright The Citadel SM Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! The enclave measurement pipeline.
//!
//! Every measured operation serialises into one fixed-layout 64-byte block
//! which extends a SHA3-512 state by exactly that block; a loaded page
//! additionally contributes its contents block by block. The block layout
//! and the opcode constants are part of the attestation ABI and must not
//! change. Fields are cleared again after each extension, so a block never
//! leaks stale operands into the next operation.

use crate::dram::{Dram, PhysAddr};
use sha3::{Digest, Sha3_512};
use static_assertions::const_assert_eq;
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

/// Size of one measurement block in bytes.
pub const MEASUREMENT_BLOCK_SIZE: usize = 64;

/// Size of a finalised measurement in bytes.
pub const MEASUREMENT_SIZE: usize = 64;

/// Opcode measured by `create_enclave`.
pub const ENCLAVE_INIT_OPCODE: u64 = 0xAAAA_AAAA;
/// Opcode measured by `load_page_table`.
pub const LOAD_PAGE_TABLE_OPCODE: u64 = 0xBBBB_BBBB;
/// Opcode measured by `load_page`.
pub const LOAD_PAGE_OPCODE: u64 = 0xCCCC_CCCC;
/// Opcode measured by `load_thread`.
pub const LOAD_THREAD_OPCODE: u64 = 0xDDDD_DDDD;
/// Opcode measured by `init_enclave`.
pub const FINALIZE_ENCLAVE_OPCODE: u64 = 0xEEEE_EEEE;

/// The fixed layout every measured operation is serialised into.
///
/// Little-endian, field offsets frozen for attestation compatibility. The
/// operand fields an operation does not use stay zero.
#[derive(Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct MeasurementBlock {
    opcode: u64,
    ptr1: u64,
    ptr2: u64,
    ptr3: u64,
    ptr4: u64,
    size1: u64,
    size2: u64,
    reserved: u64,
}

const_assert_eq!(size_of::<MeasurementBlock>(), MEASUREMENT_BLOCK_SIZE);

/// The measurement hash of one enclave: a running SHA3-512 state, the
/// working block, and the finalised value.
///
/// Lives inside the enclave's metadata allocation; the enclave lock guards
/// all access.
pub struct Measurement {
    hasher: Sha3_512,
    block: MeasurementBlock,
    value: [u8; MEASUREMENT_SIZE],
}

impl Measurement {
    /// Starts a measurement with the enclave creation parameters.
    pub fn init(ev_base: u64, ev_mask: u64, mailbox_count: u64, debug: bool) -> Self {
        let mut measurement = Self {
            hasher: Sha3_512::new(),
            block: MeasurementBlock::new_zeroed(),
            value: [0; MEASUREMENT_SIZE],
        };
        measurement.block.opcode = ENCLAVE_INIT_OPCODE;
        measurement.block.ptr1 = ev_base;
        measurement.block.ptr2 = ev_mask;
        measurement.block.size1 = mailbox_count;
        measurement.block.size2 = debug as u64;
        measurement.extend();
        measurement.block.ptr1 = 0;
        measurement.block.ptr2 = 0;
        measurement.block.size1 = 0;
        measurement.block.size2 = 0;
        measurement
    }

    fn extend(&mut self) {
        self.hasher.update(self.block.as_bytes());
    }

    /// Measures a `load_page_table` operation.
    pub fn extend_with_page_table(&mut self, virtual_addr: u64, acl: u64, level: u64) {
        self.block.opcode = LOAD_PAGE_TABLE_OPCODE;
        self.block.ptr1 = virtual_addr;
        self.block.ptr2 = acl;
        self.block.size1 = level;
        self.extend();
        self.block.ptr1 = 0;
        self.block.ptr2 = 0;
        self.block.size1 = 0;
    }

    /// Measures a `load_page` operation followed by the page's contents.
    ///
    /// The physical address is deliberately not measured; only the mapping
    /// and the bytes are.
    pub fn extend_with_page(&mut self, virtual_addr: u64, acl: u64, dram: &Dram, page: PhysAddr) {
        self.block.opcode = LOAD_PAGE_OPCODE;
        self.block.ptr1 = virtual_addr;
        self.block.ptr2 = acl;
        self.extend();
        self.block.ptr1 = 0;
        self.block.ptr2 = 0;

        let block_size = MEASUREMENT_BLOCK_SIZE as u64;
        let mut offset = 0;
        while offset < crate::pagetable::PAGE_SIZE {
            let chunk: [u8; MEASUREMENT_BLOCK_SIZE] = dram.read_obj(page.add(offset));
            self.hasher.update(chunk);
            offset += block_size;
        }
    }

    /// Measures a `load_thread` operation.
    pub fn extend_with_thread(
        &mut self,
        entry_pc: u64,
        entry_stack: u64,
        fault_pc: u64,
        fault_stack: u64,
    ) {
        self.block.opcode = LOAD_THREAD_OPCODE;
        self.block.ptr1 = entry_pc;
        self.block.ptr2 = entry_stack;
        self.block.ptr3 = fault_pc;
        self.block.ptr4 = fault_stack;
        self.extend();
        self.block.ptr1 = 0;
        self.block.ptr2 = 0;
        self.block.ptr3 = 0;
        self.block.ptr4 = 0;
    }

    /// Seals the measurement. No further extension is possible afterwards.
    pub fn finalize(&mut self) {
        self.block.opcode = FINALIZE_ENCLAVE_OPCODE;
        self.extend();
        self.value.copy_from_slice(&self.hasher.finalize_reset());
    }

    /// The finalised measurement. All zeros until [`Measurement::finalize`]
    /// has run.
    pub fn value(&self) -> &[u8; MEASUREMENT_SIZE] {
        &self.value
    }
}
