// Copyright The Citadel SM Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Attestation material and its retrieval calls.
//!
//! The device provisions the monitor with its keys, its own measurement,
//! and the device signature over it; the monitor only ever copies the
//! public fields out. The one derived secret the monitor hands anywhere is
//! the per-enclave attestation key, bound to both the monitor secret and
//! the requesting enclave's measurement.

use crate::{
    api::{MonitorError, MonitorResult, SmField},
    dram::PhysAddr,
    hardware::HardwareOps,
    monitor::Monitor,
};
use sha3::{Digest, Sha3_256};

/// Bytes in a derived attestation key.
pub const ATTESTATION_KEY_SIZE: usize = 32;

/// Keys and measurements provisioned by the device at boot.
pub struct AttestationData {
    /// The device public key.
    pub device_public_key: [u8; 32],
    /// The measurement of the monitor image.
    pub sm_measurement: [u8; 64],
    /// The monitor's public key.
    pub sm_public_key: [u8; 32],
    /// The monitor's secret key. Never leaves the monitor.
    pub sm_secret_key: [u8; 64],
    /// The device's signature over the monitor.
    pub device_signature: [u8; 64],
}

impl<H: HardwareOps> Monitor<H> {
    /// Copies one public attestation field into a caller-owned buffer.
    /// Available to the OS and to enclaves alike.
    pub fn fetch_field(&self, field: u64, out_addr: u64, out_len: u64) -> MonitorResult {
        let field = SmField::try_from(field).map_err(|_| MonitorError::InvalidValue)?;
        let size = field.size() as u64;
        if out_len < size {
            return Err(MonitorError::InvalidValue);
        }
        let out = PhysAddr::new(out_addr);
        let _out_guard = self.lock_caller_buffer(out, size)?;

        let bytes: &[u8] = match field {
            SmField::DevicePublicKey => &self.attestation.device_public_key,
            SmField::SmMeasurement => &self.attestation.sm_measurement,
            SmField::SmPublicKey => &self.attestation.sm_public_key,
            SmField::DeviceSignature => &self.attestation.device_signature,
        };
        self.dram.write_bytes(out, bytes);
        Ok(())
    }

    /// Enclave call: derives the caller's attestation key and writes it to
    /// an enclave-owned buffer.
    ///
    /// The key is bound to the enclave's measurement, so two different
    /// pieces of enclave software can never derive each other's key.
    pub fn get_attestation_key(&self, out_addr: u64) -> MonitorResult {
        let Some(caller) = self.current_enclave() else {
            return Err(MonitorError::AccessDenied);
        };
        let out = PhysAddr::new(out_addr);
        let _out_guard = self.lock_caller_buffer(out, ATTESTATION_KEY_SIZE as u64)?;

        // SAFETY: The caller is the enclave running on this core, so its
        // metadata is pinned and its measurement sealed.
        let info = unsafe { self.enclave_info_unchecked(caller) };
        let mut hasher = Sha3_256::new();
        hasher.update(self.attestation.sm_secret_key);
        hasher.update(info.sealed_measurement());
        let mut key = [0u8; ATTESTATION_KEY_SIZE];
        key.copy_from_slice(&hasher.finalize());

        self.dram.write_bytes(out, &key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::test::test_monitor;

    #[test]
    fn fetch_fields_into_os_memory() {
        let monitor = test_monitor();
        monitor.assign_dram_region(9, 0).unwrap();
        let out = monitor.geometry.region_start(9);

        assert_eq!(
            monitor.fetch_field(SmField::DevicePublicKey.into(), out.value(), 32),
            Ok(())
        );
        let copied: [u8; 32] = monitor.dram.read_obj(out);
        assert_eq!(copied, [0xd0; 32]);

        assert_eq!(
            monitor.fetch_field(SmField::SmMeasurement.into(), out.value(), 64),
            Ok(())
        );
        let copied: [u8; 64] = monitor.dram.read_obj(out);
        assert_eq!(copied, [0x5a; 64]);
    }

    #[test]
    fn fetch_field_checks_buffer_size() {
        let monitor = test_monitor();
        monitor.assign_dram_region(9, 0).unwrap();
        let out = monitor.geometry.region_start(9).value();
        assert_eq!(
            monitor.fetch_field(SmField::SmMeasurement.into(), out, 32),
            Err(MonitorError::InvalidValue)
        );
        assert_eq!(
            monitor.fetch_field(7, out, 64),
            Err(MonitorError::InvalidValue)
        );
    }

    #[test]
    fn fetch_field_requires_owned_memory() {
        let monitor = test_monitor();
        // Region 9 is free, so the OS does not own it.
        let out = monitor.geometry.region_start(9).value();
        assert_eq!(
            monitor.fetch_field(SmField::SmPublicKey.into(), out, 32),
            Err(MonitorError::AccessDenied)
        );
    }

    #[test]
    fn attestation_key_needs_an_enclave() {
        let monitor = test_monitor();
        monitor.assign_dram_region(9, 0).unwrap();
        let out = monitor.geometry.region_start(9).value();
        assert_eq!(
            monitor.get_attestation_key(out),
            Err(MonitorError::AccessDenied)
        );
    }
}
