// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bus facade (C10): the thin, device-agnostic convenience surface —
//! `init()`, `power_cycle()`, a controller-less `dma()`, address-width
//! configuration, and address/cycle text formatting — that hides the
//! scheduler and event loop from code that is not itself a device.

use std::sync::{Arc, Mutex};

use qbus_proto::{CycleKind, DmaCycle, Edge};

use crate::registry::DeviceRegistry;
use crate::request::DmaRequest;
use crate::scheduler::Scheduler;

/// Bus address width, fixing the I/O-page base and total address space.
/// Mirrors the teacher's plain, `Copy` configuration-struct convention
/// (`sys/abi::App`) rather than a stringly-typed config map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
pub enum AddressWidth {
    Bits16,
    Bits18,
    Bits22,
}

/// Size, in bytes, of the standard PDP-11 I/O page (the top 8KW of the
/// address space on every width this core supports).
const IOPAGE_BYTES: u32 = 0o20000;

/// Bus-wide configuration: address width only, for now. A `Copy` struct
/// passed once at construction, per §10.3 — not a general settings map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
pub struct BusConfig {
    pub address_width: AddressWidth,
}

impl BusConfig {
    pub fn address_space_size(&self) -> u32 {
        match self.address_width {
            AddressWidth::Bits16 => 1 << 16,
            AddressWidth::Bits18 => 1 << 18,
            AddressWidth::Bits22 => 1 << 22,
        }
    }

    pub fn iopage_base(&self) -> u32 {
        self.address_space_size() - IOPAGE_BYTES
    }

    /// Octal digits a formatted address should be padded to: 6 for 16/18
    /// bit addressing (legacy UNIBUS octal convention), 8 for 22 bit.
    fn octal_digits(&self) -> usize {
        match self.address_width {
            AddressWidth::Bits16 | AddressWidth::Bits18 => 6,
            AddressWidth::Bits22 => 8,
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        BusConfig {
            address_width: AddressWidth::Bits18,
        }
    }
}

/// The reserved slot controller-less bus accesses (this facade's `dma()`,
/// and the CPU's single-word path) are pinned to.
pub const RESERVED_DMA_SLOT: u8 = qbus_proto::CPU_DATA_TRANSFER_SLOT;

/// Which half of a power-sequencing transition `power_cycle` should drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerPhase {
    /// ACLO/DCLO assert: power is failing or not yet up.
    Fail,
    /// ACLO/DCLO negate: power is good.
    Restore,
}

/// Thin façade over the scheduler and registry for callers that are not a
/// registered device: a test harness driving the bus directly, or the
/// emulated CPU's own memory-access path.
pub struct BusFacade {
    config: BusConfig,
    scheduler: Arc<Scheduler>,
    registry: Arc<Mutex<DeviceRegistry>>,
}

impl BusFacade {
    pub fn new(
        config: BusConfig,
        scheduler: Arc<Scheduler>,
        registry: Arc<Mutex<DeviceRegistry>>,
    ) -> BusFacade {
        BusFacade {
            config,
            scheduler,
            registry,
        }
    }

    pub fn config(&self) -> BusConfig {
        self.config
    }

    /// Pulse INIT: assert, then negate. Each half goes through the same
    /// scheduler + registry calls the event loop makes from the mailbox's
    /// INIT channel in a real deployment; this direct call is for test
    /// harnesses and embedders with no wire engine underneath them at all.
    pub fn init(&self) {
        self.scheduler.set_init_asserted(true);
        self.registry.lock().unwrap().broadcast_init_change(true);
        self.scheduler.set_init_asserted(false);
        self.registry.lock().unwrap().broadcast_init_change(false);
    }

    /// Drive one phase of a power-sequencing transition: broadcast the
    /// edge to every installed device, and on a DCLO raising edge (power
    /// failing), cancel all scheduled requests, matching the event loop's
    /// own handling of a DCLO edge arriving from the wire engine.
    pub fn power_cycle(&self, phase: PowerPhase) {
        let (aclo_edge, dclo_edge) = match phase {
            PowerPhase::Fail => (Edge::Falling, Edge::Raising),
            PowerPhase::Restore => (Edge::Raising, Edge::Falling),
        };
        self.registry
            .lock()
            .unwrap()
            .broadcast_power_change(aclo_edge, dclo_edge);
        if matches!(dclo_edge, Edge::Raising) {
            self.scheduler.cancel_all(false);
        }
    }

    /// Controller-less DMA, pinned to the reserved slot. `blocking`
    /// selects condvar-wait vs. return-immediately; this path is never
    /// CPU-polled (that is `cpu_data_transfer`'s job).
    pub fn dma(&self, blocking: bool, cycle: DmaCycle, addr: u32, buffer: &mut [u16], word_count: u32) {
        let request = DmaRequest::new(None, RESERVED_DMA_SLOT, false);
        self.scheduler
            .dma(&request, blocking, cycle, addr, buffer, word_count);
    }

    /// The emulated CPU's single-word memory-access path: pinned to the
    /// same reserved slot, but always `is_cpu_access` (busy-polled, never
    /// preempted by anything other than INIT clearing the active pointer).
    pub fn cpu_data_transfer(&self, cycle: CycleKind, address: u32, buffer: &mut [u16]) {
        let dma_cycle = match cycle {
            CycleKind::Read => DmaCycle::Read,
            CycleKind::WriteWord => DmaCycle::Write,
            CycleKind::WriteByteLow | CycleKind::WriteByteHigh => DmaCycle::ByteWrite,
        };
        let request = DmaRequest::new(None, RESERVED_DMA_SLOT, true);
        self.scheduler
            .dma(&request, true, dma_cycle, address, buffer, 1);
    }

    /// Format an address as the configured width's octal convention.
    pub fn format_address(&self, addr: u32) -> String {
        format!("{:0width$o}", addr, width = self.config.octal_digits())
    }

    pub fn format_cycle(&self, cycle: CycleKind) -> &'static str {
        match cycle {
            CycleKind::Read => "DATI",
            CycleKind::WriteWord => "DATO",
            CycleKind::WriteByteLow | CycleKind::WriteByteHigh => "DATOB",
        }
    }
}
