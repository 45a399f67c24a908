// Copyright The Citadel SM Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Fixed-size mailboxes for enclave-to-enclave messages.
//!
//! A mailbox belongs to its receiving enclave and lives in the enclave's
//! metadata allocation, after the region bitmap. The receiver arms a
//! mailbox with the identity it is willing to hear from; a send only goes
//! through when both the sender's OS-assigned id and its measurement match
//! what the receiver armed. All mailbox state is guarded by the receiving
//! enclave's lock.

use crate::{
    api::{MonitorError, MonitorResult},
    dram::PhysAddr,
    enclave::EnclaveGuard,
    hardware::HardwareOps,
    measure::MEASUREMENT_SIZE,
    monitor::Monitor,
};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Bytes in one mailbox message.
pub const MAILBOX_MESSAGE_SIZE: usize = 256;

const MAILBOX_EMPTY: u64 = 0;
const MAILBOX_FULL: u64 = 1;

/// One mailbox as stored in the enclave's metadata allocation.
#[derive(Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct Mailbox {
    state: u64,
    /// The OS-assigned id of the expected sender. Names the sender, but
    /// cannot be trusted to identify its software.
    sender_id: u64,
    /// The expected sender's measurement; the secure identifier of the
    /// software allowed to write here.
    sender_hash: [u8; MEASUREMENT_SIZE],
    message: [u8; MAILBOX_MESSAGE_SIZE],
}

impl<H: HardwareOps> Monitor<H> {
    fn mailbox_slot(&self, enclave: &EnclaveGuard, mailbox: u64) -> MonitorResult<PhysAddr> {
        if mailbox >= enclave.mailbox_count() {
            return Err(MonitorError::InvalidValue);
        }
        Ok(self.mailbox_addr(enclave.id(), mailbox))
    }

    /// Enclave call: arms one of the caller's mailboxes to accept a
    /// message from `sender`, capturing the sender's measurement as the
    /// identity that must match at send time.
    pub fn accept_message(&self, mailbox: u64, sender: u64) -> MonitorResult {
        let Some(caller) = self.current_enclave() else {
            return Err(MonitorError::AccessDenied);
        };
        let receiver = self.lock_enclave(caller.0)?;
        let slot = self.mailbox_slot(&receiver, mailbox)?;

        // The sender's measurement only exists once it is sealed. Arming a
        // mailbox for oneself fails on the second lock; acceptable.
        let sender_guard = self.lock_enclave(sender)?;
        if !sender_guard.is_initialized() {
            return Err(MonitorError::InvalidState);
        }

        let armed = Mailbox {
            state: MAILBOX_EMPTY,
            sender_id: sender,
            sender_hash: *sender_guard.measurement().value(),
            message: [0; MAILBOX_MESSAGE_SIZE],
        };
        self.dram.write_obj(slot, &armed);
        Ok(())
    }

    /// Enclave call: delivers a message into `dest`'s mailbox, provided
    /// the mailbox was armed for exactly this sender.
    pub fn send_message(&self, dest: u64, mailbox: u64, msg_addr: u64) -> MonitorResult {
        let Some(caller) = self.current_enclave() else {
            return Err(MonitorError::AccessDenied);
        };
        let msg_phys = PhysAddr::new(msg_addr);
        let _msg_guard = self.lock_caller_buffer(msg_phys, MAILBOX_MESSAGE_SIZE as u64)?;

        let receiver = self.lock_enclave(dest)?;
        if !receiver.is_initialized() {
            return Err(MonitorError::InvalidState);
        }
        let slot = self.mailbox_slot(&receiver, mailbox)?;
        let mut slot_value: Mailbox = self.dram.read_obj(slot);
        if slot_value.state != MAILBOX_EMPTY {
            return Err(MonitorError::InvalidState);
        }

        // Both halves of the armed identity must match the caller.
        // SAFETY: The caller is the enclave running on this core, so its
        // metadata is pinned; it is sealed, so its measurement is frozen.
        let caller_info = unsafe { self.enclave_info_unchecked(caller) };
        if slot_value.sender_id != caller.0
            || slot_value.sender_hash != caller_info.sealed_measurement()
        {
            return Err(MonitorError::AccessDenied);
        }

        slot_value.message = self.dram.read_obj(msg_phys);
        slot_value.state = MAILBOX_FULL;
        self.dram.write_obj(slot, &slot_value);
        Ok(())
    }

    /// Enclave call: reads a delivered message out of one of the caller's
    /// mailboxes and empties it.
    pub fn read_message(&self, mailbox: u64, out_addr: u64) -> MonitorResult {
        let Some(caller) = self.current_enclave() else {
            return Err(MonitorError::AccessDenied);
        };
        let out_phys = PhysAddr::new(out_addr);
        let _out_guard = self.lock_caller_buffer(out_phys, MAILBOX_MESSAGE_SIZE as u64)?;

        let receiver = self.lock_enclave(caller.0)?;
        let slot = self.mailbox_slot(&receiver, mailbox)?;
        let mut slot_value: Mailbox = self.dram.read_obj(slot);
        if slot_value.state != MAILBOX_FULL {
            return Err(MonitorError::InvalidState);
        }

        self.dram.write_obj(out_phys, &slot_value.message);
        slot_value.state = MAILBOX_EMPTY;
        self.dram.write_obj(slot, &slot_value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::ExecState,
        hardware::fake::FakeHardware,
        monitor::Monitor,
        pagetable::PAGE_SHIFT,
        platform::test::test_monitor,
    };

    const EV_BASE: u64 = 0x4000_0000;
    const EV_MASK: u64 = 0x0fff_ffff;

    /// Builds a sealed single-thread enclave with one mailbox, backed by
    /// the given data region.
    fn sealed_enclave(
        monitor: &Monitor<FakeHardware>,
        id_page: u64,
        thread_page: u64,
        data_region: usize,
    ) -> (u64, u64) {
        let _ = monitor.create_metadata_region(2);
        let page = |index: u64| {
            monitor
                .geometry
                .region_start(2)
                .add(index << PAGE_SHIFT)
                .value()
        };
        let id = page(id_page);
        let thread = page(thread_page);
        monitor.create_enclave(id, EV_BASE, EV_MASK, 1, false).unwrap();
        monitor.assign_dram_region(data_region, id).unwrap();
        let root = monitor.geometry.region_start(data_region).value();
        monitor.load_page_table(id, root, 0, 2, 0).unwrap();
        monitor.load_thread(id, thread, EV_BASE, 0, 0, 0).unwrap();
        monitor.init_enclave(id).unwrap();
        (id, thread)
    }

    /// Runs `f` with the enclave entered on the given core.
    fn as_enclave<T>(
        monitor: &Monitor<FakeHardware>,
        core: usize,
        id: u64,
        thread: u64,
        f: impl FnOnce() -> T,
    ) -> T {
        monitor.hw.set_current_core(core);
        monitor
            .enter_enclave(id, thread, &ExecState::EMPTY)
            .unwrap();
        let result = f();
        monitor.exit_enclave().unwrap();
        result
    }

    #[test]
    fn message_round_trip() {
        let monitor = test_monitor();
        let (receiver, receiver_thread) = sealed_enclave(&monitor, 1, 2, 7);
        let (sender, sender_thread) = sealed_enclave(&monitor, 3, 4, 8);

        // The receiver arms mailbox 0 for the sender.
        as_enclave(&monitor, 0, receiver, receiver_thread, || {
            monitor.accept_message(0, sender).unwrap();
        });

        // The sender writes a message in its own memory and delivers it.
        let msg_addr = monitor.geometry.region_start(8).add(2 << PAGE_SHIFT);
        let payload = [0xabu8; MAILBOX_MESSAGE_SIZE];
        monitor.dram.write_obj(msg_addr, &payload);
        as_enclave(&monitor, 1, sender, sender_thread, || {
            monitor.send_message(receiver, 0, msg_addr.value()).unwrap();
            // The mailbox is full now; a second send must wait for a read.
            assert_eq!(
                monitor.send_message(receiver, 0, msg_addr.value()),
                Err(MonitorError::InvalidState)
            );
        });

        // The receiver drains it.
        let out_addr = monitor.geometry.region_start(7).add(2 << PAGE_SHIFT);
        as_enclave(&monitor, 0, receiver, receiver_thread, || {
            monitor.read_message(0, out_addr.value()).unwrap();
            // Drained; reading again reports an empty mailbox.
            assert_eq!(
                monitor.read_message(0, out_addr.value()),
                Err(MonitorError::InvalidState)
            );
        });
        let received: [u8; MAILBOX_MESSAGE_SIZE] = monitor.dram.read_obj(out_addr);
        assert_eq!(received, payload);
    }

    #[test]
    fn unexpected_senders_are_rejected() {
        let monitor = test_monitor();
        let (receiver, receiver_thread) = sealed_enclave(&monitor, 1, 2, 7);
        let (sender, sender_thread) = sealed_enclave(&monitor, 3, 4, 8);
        let (interloper, interloper_thread) = sealed_enclave(&monitor, 5, 6, 9);

        as_enclave(&monitor, 0, receiver, receiver_thread, || {
            monitor.accept_message(0, sender).unwrap();
        });

        // The interloper is not who the mailbox was armed for, even with a
        // validly owned buffer.
        let msg_addr = monitor.geometry.region_start(9).add(2 << PAGE_SHIFT);
        monitor
            .dram
            .write_obj(msg_addr, &[0u8; MAILBOX_MESSAGE_SIZE]);
        as_enclave(&monitor, 1, interloper, interloper_thread, || {
            assert_eq!(
                monitor.send_message(receiver, 0, msg_addr.value()),
                Err(MonitorError::AccessDenied)
            );
        });
    }

    #[test]
    fn mailbox_calls_are_enclave_only() {
        let monitor = test_monitor();
        let (receiver, _) = sealed_enclave(&monitor, 1, 2, 7);
        assert_eq!(
            monitor.accept_message(0, receiver),
            Err(MonitorError::AccessDenied)
        );
        assert_eq!(
            monitor.send_message(receiver, 0, 0x8000_3000),
            Err(MonitorError::AccessDenied)
        );
        assert_eq!(
            monitor.read_message(0, 0x8000_3000),
            Err(MonitorError::AccessDenied)
        );
    }

    #[test]
    fn mailbox_index_is_bounded() {
        let monitor = test_monitor();
        let (receiver, receiver_thread) = sealed_enclave(&monitor, 1, 2, 7);
        as_enclave(&monitor, 0, receiver, receiver_thread, || {
            assert_eq!(
                monitor.accept_message(1, receiver),
                Err(MonitorError::InvalidValue)
            );
        });
    }
}
