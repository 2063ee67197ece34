// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device base & register model (C8): the polymorphic device abstraction,
//! per-device register descriptors, and the publish/read helpers devices
//! use to talk to the shared I/O page without racing the wire engine.

use std::sync::{Arc, Mutex};

use qbus_proto::{CycleKind, DeviceHandle, Edge, Level, RegisterHandle};

use crate::iopage::IoPageMap;

/// Static per-register configuration a device advertises; the registry
/// turns these into installed [`DeviceRegister`]s with assigned handles
/// and addresses.
#[derive(Debug, Clone, Copy)]
pub struct RegisterSpec {
    pub name: &'static str,
    pub reset_value: u16,
    pub writable_mask: u16,
    pub active_on_read: bool,
    pub active_on_write: bool,
}

impl RegisterSpec {
    /// It is illegal to be active-on-read but passive-on-write while
    /// having any writable bits: the shared value would be overwritten by
    /// the read shadow before the device ever saw what was written.
    pub fn is_valid(&self) -> bool {
        !(self.active_on_read && !self.active_on_write && self.writable_mask != 0)
    }
}

/// An installed, per-device view of one register.
#[derive(Debug, Clone)]
pub struct DeviceRegister {
    pub name: &'static str,
    pub index: u16,
    pub address: u32,
    pub reset_value: u16,
    pub writable_mask: u16,
    pub active_on_read: bool,
    pub active_on_write: bool,
    pub handle: RegisterHandle,
    read_shadow: u16,
    write_shadow: u16,
}

impl DeviceRegister {
    fn new(spec: &RegisterSpec, index: u16, address: u32, handle: RegisterHandle) -> DeviceRegister {
        DeviceRegister {
            name: spec.name,
            index,
            address,
            reset_value: spec.reset_value,
            writable_mask: spec.writable_mask,
            active_on_read: spec.active_on_read,
            active_on_write: spec.active_on_write,
            handle,
            read_shadow: spec.reset_value,
            write_shadow: spec.reset_value,
        }
    }
}

/// Bounded record of a `set_read_value` call, for post-mortem inspection.
/// `qbus-device::debug` is the concrete ring-buffer-backed sink; the core
/// only knows the trait, to keep the dependency edge pointed the right way
/// (adapter core does not depend on the device-facing helper crate).
#[derive(Debug, Clone, Copy)]
pub struct DebugEvent {
    pub device: DeviceHandle,
    pub register_index: u16,
    pub value: u16,
}

pub trait DebugSink: Send + Sync {
    fn record(&self, event: DebugEvent);
}

pub struct NullDebugSink;

impl DebugSink for NullDebugSink {
    fn record(&self, _event: DebugEvent) {}
}

/// Embeddable per-device state: the installed register array and the
/// plumbing to publish read values / inspect written values against the
/// shared I/O page. Concrete device models embed one of these and
/// delegate the [`Device`] register-access methods to it.
pub struct DeviceBase {
    handle: Mutex<DeviceHandle>,
    registers: Mutex<Vec<DeviceRegister>>,
    iopage: Arc<Mutex<IoPageMap>>,
    debug: Arc<dyn DebugSink>,
}

impl DeviceBase {
    pub fn new(iopage: Arc<Mutex<IoPageMap>>, debug: Arc<dyn DebugSink>) -> DeviceBase {
        DeviceBase {
            handle: Mutex::new(DeviceHandle::NONE),
            registers: Mutex::new(Vec::new()),
            iopage,
            debug,
        }
    }

    pub fn handle(&self) -> DeviceHandle {
        *self.handle.lock().unwrap()
    }

    pub(crate) fn install(
        &self,
        handle: DeviceHandle,
        specs: &[RegisterSpec],
        base_address: u32,
        first_reg_handle: u8,
    ) {
        *self.handle.lock().unwrap() = handle;
        let mut regs = Vec::with_capacity(specs.len());
        for (i, spec) in specs.iter().enumerate() {
            let reg_handle = RegisterHandle(first_reg_handle + i as u8);
            regs.push(DeviceRegister::new(
                spec,
                i as u16,
                base_address + 2 * i as u32,
                reg_handle,
            ));
        }
        *self.registers.lock().unwrap() = regs;
    }

    pub(crate) fn uninstall(&self) {
        *self.handle.lock().unwrap() = DeviceHandle::NONE;
        self.registers.lock().unwrap().clear();
    }

    pub fn register_count(&self) -> usize {
        self.registers.lock().unwrap().len()
    }

    pub fn register_address(&self, index: u16) -> u32 {
        self.registers.lock().unwrap()[index as usize].address
    }

    pub fn register_handle(&self, index: u16) -> RegisterHandle {
        self.registers.lock().unwrap()[index as usize].handle
    }

    pub fn find_register_by_name(&self, name: &str) -> Option<u16> {
        self.registers
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.name == name)
            .map(|r| r.index)
    }

    pub fn find_register_by_address(&self, addr: u32) -> Option<u16> {
        self.registers
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.address == addr)
            .map(|r| r.index)
    }

    /// Publish a new read-side value. Always updates the read shadow and
    /// the shared descriptor value (not atomically against bus-side
    /// writes — device code must read back the read shadow, never the
    /// shared value), and triggers a debug record.
    pub fn set_read_value(&self, register_index: u16, value: u16) {
        let handle = {
            let mut regs = self.registers.lock().unwrap();
            let reg = &mut regs[register_index as usize];
            reg.read_shadow = value;
            reg.handle
        };
        if let Some(desc) = self.iopage.lock().unwrap().descriptor_mut(handle) {
            desc.value = value;
        }
        self.debug.record(DebugEvent {
            device: self.handle(),
            register_index,
            value,
        });
    }

    pub fn read_shadow(&self, register_index: u16) -> u16 {
        self.registers.lock().unwrap()[register_index as usize].read_shadow
    }

    pub fn write_shadow(&self, register_index: u16) -> u16 {
        self.registers.lock().unwrap()[register_index as usize].write_shadow
    }

    /// `(active_on_read, active_on_write, writable_mask)` for the event
    /// loop's slave-access dispatch.
    pub fn register_flags(&self, register_index: u16) -> (bool, bool, u16) {
        let regs = self.registers.lock().unwrap();
        let reg = &regs[register_index as usize];
        (reg.active_on_read, reg.active_on_write, reg.writable_mask)
    }

    /// Most recently written value: the write shadow for active-on-write
    /// registers, else the shared descriptor's current value.
    pub fn get_written_value(&self, register_index: u16) -> u16 {
        let (active_on_write, write_shadow, handle) = {
            let regs = self.registers.lock().unwrap();
            let reg = &regs[register_index as usize];
            (reg.active_on_write, reg.write_shadow, reg.handle)
        };
        if active_on_write {
            write_shadow
        } else {
            self.iopage
                .lock()
                .unwrap()
                .descriptor(handle)
                .map(|d| d.value)
                .unwrap_or(0)
        }
    }

    /// Called by the event loop when applying a bus write to an
    /// active-on-write register: stores the (already byte-spliced,
    /// write-mask-respected) word into the write shadow, then restores
    /// the read shadow into the shared value so a later passive read
    /// returns the pre-write value.
    pub(crate) fn apply_write(&self, register_index: u16, word: u16) {
        let (handle, read_shadow) = {
            let mut regs = self.registers.lock().unwrap();
            let reg = &mut regs[register_index as usize];
            reg.write_shadow = word;
            (reg.handle, reg.read_shadow)
        };
        if let Some(desc) = self.iopage.lock().unwrap().descriptor_mut(handle) {
            desc.value = read_shadow;
        }
    }

    pub fn reset_registers(&self) {
        let mut regs = self.registers.lock().unwrap();
        let mut iopage = self.iopage.lock().unwrap();
        for reg in regs.iter_mut() {
            reg.read_shadow = reg.reset_value;
            reg.write_shadow = reg.reset_value;
            if let Some(desc) = iopage.descriptor_mut(reg.handle) {
                desc.value = reg.reset_value;
            }
        }
    }
}

/// The polymorphic device abstraction. Device, DMA request, and INTR
/// request are polymorphic over small capability sets; this is that set
/// for devices, represented as a trait rather than a deep inheritance
/// hierarchy.
pub trait Device: Send + Sync {
    fn name(&self) -> &str;
    fn base(&self) -> &DeviceBase;
    fn register_specs(&self) -> &[RegisterSpec];
    fn base_address(&self) -> u32;
    fn priority_slot(&self) -> u8;
    fn interrupt_level(&self) -> Option<Level> {
        None
    }
    fn interrupt_vector(&self) -> Option<u16> {
        None
    }
    fn is_cpu(&self) -> bool {
        false
    }

    fn on_before_install(&self) -> bool {
        true
    }
    fn on_after_install(&self) {}
    fn on_before_uninstall(&self) {}
    fn on_after_uninstall(&self) {}

    fn on_init_change(&self, _asserted: bool) {}
    fn on_power_change(&self, _aclo: Edge, _dclo: Edge) {}

    /// Invoked by the event loop while the wire engine holds the bus
    /// handshake for this access. Must be brief and must not call back
    /// into `dma`/`intr` (that would try to reacquire the scheduler lock
    /// recursively and deadlock).
    fn on_register_access(&self, register_index: u16, cycle: CycleKind);

    /// Only meaningful if `is_cpu()` is true: forward a granted interrupt
    /// vector to the emulated CPU.
    fn on_cpu_interrupt(&self, _vector: u16) {}
}
