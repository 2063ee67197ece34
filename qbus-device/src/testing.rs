// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A fake wire engine: plays the wire-engine side of the mailbox
//! handshake under full test control, the way `sys/kern`'s `arch::fake`
//! stands in for real hardware in host-side unit tests. Lets the end-to-
//! end scenarios drive DMA/INTR/INIT/power/slave-access events without a
//! real bus interface engine underneath.

use std::sync::Arc;
use std::time::Duration;

use qbus_adapter::mailbox::MailboxHandle;
use qbus_proto::{
    CycleKind, DeviceHandle, DmaStatus, EventChannels, RawSlaveAccessRecord, SlaveAccessRecord,
    WireCommand,
};

const WAIT_TIMEOUT: Duration = Duration::from_secs(2);

pub struct FakeWireEngine {
    mailbox: Arc<MailboxHandle>,
}

impl FakeWireEngine {
    pub fn new(mailbox: Arc<MailboxHandle>) -> FakeWireEngine {
        FakeWireEngine { mailbox }
    }

    /// Block until the host posts a command, then take and return it
    /// (clearing `mb.command`, matching the at-most-one-outstanding
    /// invariant).
    pub fn take_command(&self) -> Option<WireCommand> {
        let mut guard = self.mailbox.wait_for_host_command(WAIT_TIMEOUT);
        guard.command.take()
    }

    /// Complete the active DMA chunk: deliver `status`/`current_address`,
    /// and for reads, the words the fake engine "read off the bus".
    pub fn complete_dma(&self, status: DmaStatus, current_address: u32, data: &[u16]) {
        self.mailbox.with(|mb| {
            mb.dma.status = status;
            mb.dma.current_address = current_address;
            if !data.is_empty() {
                mb.dma.data[..data.len()].copy_from_slice(data);
            }
            mb.events.raise(EventChannels::DMA_COMPLETE);
        });
        self.mailbox.notify_wire_events();
    }

    /// Complete the INTR currently pushed for `level_index` (0=BR4..3=BR7).
    pub fn complete_intr(&self, level_index: u8) {
        let channel = match level_index {
            0 => EventChannels::INTR_BR4,
            1 => EventChannels::INTR_BR5,
            2 => EventChannels::INTR_BR6,
            3 => EventChannels::INTR_BR7,
            _ => panic!("invalid interrupt level index {level_index}"),
        };
        self.mailbox.with(|mb| mb.events.raise(channel));
        self.mailbox.notify_wire_events();
    }

    /// Drive an INIT level change (one logical edge per call).
    pub fn raise_init(&self, asserted: bool) {
        self.mailbox.with(|mb| {
            mb.init.signal_current = asserted;
            mb.events.raise(EventChannels::INIT);
        });
        self.mailbox.notify_wire_events();
    }

    /// Drive a power-sequencing transition.
    pub fn raise_power(&self, previous: qbus_proto::PowerSignals, current: qbus_proto::PowerSignals) {
        self.mailbox.with(|mb| {
            mb.power.previous = previous;
            mb.power.current = current;
            mb.events.raise(EventChannels::POWER);
        });
        self.mailbox.notify_wire_events();
    }

    /// Present a slave-access event to the event loop.
    #[allow(clippy::too_many_arguments)]
    pub fn raise_slave_access(
        &self,
        device_handle: DeviceHandle,
        register_index: u16,
        address: u32,
        data: u16,
        cycle_kind: CycleKind,
    ) {
        let raw = RawSlaveAccessRecord {
            device_handle: device_handle.0,
            register_index: register_index as u8,
            cycle_kind: cycle_kind as u8,
            _pad: 0,
            address,
            data,
            _pad2: 0,
        };
        // `iopage_base` is only consulted for the alternate-bus encoding;
        // the fake engine always presents a plain absolute address.
        let record = SlaveAccessRecord::from_raw(&raw, 0);
        self.mailbox.with(|mb| {
            mb.slave_access = Some(record);
            mb.events.raise(EventChannels::SLAVE_ACCESS);
        });
        self.mailbox.notify_wire_events();
    }

    /// Present a byte-lane write (`CycleKind::WriteByteLow`/`WriteByteHigh`)
    /// to a slave register. `byte` is placed in the lane the cycle kind
    /// names, matching how a real byte-addressed bus cycle presents data:
    /// the low byte for `WriteByteLow`, the high byte for `WriteByteHigh`.
    pub fn raise_slave_access_byte(
        &self,
        device_handle: DeviceHandle,
        register_index: u16,
        address: u32,
        byte: u8,
        cycle_kind: CycleKind,
    ) {
        let data = match cycle_kind {
            CycleKind::WriteByteLow => byte as u16,
            CycleKind::WriteByteHigh => (byte as u16) << 8,
            _ => panic!("raise_slave_access_byte is for byte-lane writes only"),
        };
        self.raise_slave_access(device_handle, register_index, address, data, cycle_kind);
    }

    /// Present a CPU-interrupt-reception event; `mb.intr.vector` must
    /// already hold the vector the event loop should forward (it does,
    /// left over from the grant this responds to).
    pub fn raise_cpu_interrupt(&self) {
        self.mailbox
            .with(|mb| mb.events.raise(EventChannels::CPU_INTERRUPT));
        self.mailbox.notify_wire_events();
    }

    /// Block until the host has acknowledged `channel`.
    pub fn wait_for_ack(&self, channel: EventChannels) {
        let deadline = std::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            let acked = self.mailbox.with(|mb| !mb.events.is_pending(channel));
            if acked {
                return;
            }
            assert!(std::time::Instant::now() < deadline, "timed out waiting for ack");
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}
