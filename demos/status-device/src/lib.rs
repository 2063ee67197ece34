// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A line-clock-style status device: a single control/status register,
//! one BR6 interrupt, no DMA. Grounded on the LTC half of the DL11-W
//! (`LKS`, a single word carrying an interrupt-enable bit and a monitor
//! bit the device flips on each tick) — the smallest device shape that
//! still exercises install, active-register writes, and INTR re-raise.

use std::sync::Arc;

use qbus_adapter::{CycleKind, Device, DeviceBase, IntrRequest, Level, RegisterSpec, Scheduler};

const LKS: u16 = 0;

const LKS_INT_MON: u16 = 0o200;
const LKS_INT_ENB: u16 = 0o100;

const REGISTER_SPECS: [RegisterSpec; 1] = [RegisterSpec {
    name: "LKS",
    reset_value: 0,
    writable_mask: LKS_INT_ENB,
    active_on_read: false,
    active_on_write: true,
}];

pub struct StatusDevice {
    base: DeviceBase,
    base_address: u32,
    slot: u8,
    level: Level,
    vector: u16,
    request: Arc<IntrRequest>,
    scheduler: Arc<Scheduler>,
}

impl StatusDevice {
    pub fn new(
        base: DeviceBase,
        base_address: u32,
        slot: u8,
        level: Level,
        vector: u16,
        scheduler: Arc<Scheduler>,
    ) -> StatusDevice {
        StatusDevice {
            base,
            base_address,
            slot,
            level,
            vector,
            request: IntrRequest::new(None, slot, level),
            scheduler,
        }
    }

    /// Advance the clock by one period: flip the monitor bit and raise
    /// the interrupt if enabled. A re-raise while the previous one is
    /// still outstanding on the same slot+vector merges silently.
    pub fn tick(&self) {
        let lks = self.base.read_shadow(LKS) ^ LKS_INT_MON;
        self.base.set_read_value(LKS, lks);
        if lks & LKS_INT_ENB != 0 {
            self.scheduler.intr(&self.request, self.vector, None);
        }
    }
}

impl Device for StatusDevice {
    fn name(&self) -> &str {
        "status-device"
    }

    fn base(&self) -> &DeviceBase {
        &self.base
    }

    fn register_specs(&self) -> &[RegisterSpec] {
        &REGISTER_SPECS
    }

    fn base_address(&self) -> u32 {
        self.base_address
    }

    fn priority_slot(&self) -> u8 {
        self.slot
    }

    fn interrupt_level(&self) -> Option<Level> {
        Some(self.level)
    }

    fn interrupt_vector(&self) -> Option<u16> {
        Some(self.vector)
    }

    fn on_register_access(&self, register_index: u16, cycle: CycleKind) {
        if register_index == LKS && cycle.is_write() {
            let written = self.base.get_written_value(LKS) & LKS_INT_ENB;
            let mon = self.base.read_shadow(LKS) & LKS_INT_MON;
            self.base.set_read_value(LKS, mon | written);
        }
    }

    fn on_init_change(&self, asserted: bool) {
        if asserted {
            self.base.set_read_value(LKS, 0);
        }
    }
}
