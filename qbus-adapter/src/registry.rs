// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device registry (C3): the set of installed devices, handle assignment,
//! register-handle allocation, address-conflict detection, and
//! INIT/ACLO/DCLO lifecycle distribution.

use std::sync::Arc;

use qbus_proto::{DeviceHandle, Edge, RegisterHandle};

use crate::device::Device;
use crate::err::ConfigError;
use crate::iopage::{IoPageMap, SharedRegisterDescriptor};

struct Installed {
    device: Arc<dyn Device>,
}

/// Devices indexed by handle (1..MAX); index 0 is never used so a handle
/// value doubles as a 1-based index into this table.
pub struct DeviceRegistry {
    devices: Vec<Option<Installed>>,
    cpu_handle: Option<DeviceHandle>,
}

impl DeviceRegistry {
    pub fn new() -> DeviceRegistry {
        DeviceRegistry {
            devices: Vec::new(),
            cpu_handle: None,
        }
    }

    pub fn get(&self, handle: DeviceHandle) -> Option<&Arc<dyn Device>> {
        self.devices
            .get(handle.0 as usize - 1)
            .and_then(|slot| slot.as_ref())
            .map(|i| &i.device)
    }

    pub fn find_by_priority_slot(&self, slot: u8) -> Option<&Arc<dyn Device>> {
        self.devices
            .iter()
            .flatten()
            .map(|i| &i.device)
            .find(|d| d.priority_slot() == slot)
    }

    pub fn iter_installed(&self) -> impl Iterator<Item = &Arc<dyn Device>> {
        self.devices.iter().flatten().map(|i| &i.device)
    }

    fn next_free_index(&self) -> usize {
        self.devices.iter().position(|s| s.is_none()).unwrap_or(self.devices.len())
    }

    pub fn install(
        &mut self,
        device: Arc<dyn Device>,
        iopage: &mut IoPageMap,
    ) -> Result<DeviceHandle, ConfigError> {
        let specs = device.register_specs();
        for (i, spec) in specs.iter().enumerate() {
            if !spec.is_valid() {
                return Err(ConfigError::InvalidRegisterActivity { index: i });
            }
        }

        let base = device.base_address();
        for i in 0..specs.len() {
            let addr = base + 2 * i as u32;
            iopage.validate_address(addr)?;
            let existing = iopage.lookup(addr);
            if !existing.is_none() && !existing.is_rom() {
                return Err(ConfigError::AddressConflict { address: addr });
            }
        }

        if device.is_cpu() && self.cpu_handle.is_some() {
            return Err(ConfigError::DuplicateCpu);
        }

        let first_handle = iopage.allocate_range(specs.len())?;

        for (i, spec) in specs.iter().enumerate() {
            let addr = base + 2 * i as u32;
            let reg_handle = RegisterHandle(first_handle + i as u8);
            // `index_slot` below is the 1-based device slot we're about
            // to assign; filled in once we know it.
            iopage.set_device_entry(addr, reg_handle).expect("pre-checked above");
        }

        let index = self.next_free_index();
        let handle = DeviceHandle((index + 1) as u8);

        for (i, spec) in specs.iter().enumerate() {
            let reg_handle = RegisterHandle(first_handle + i as u8);
            if let Some(desc) = iopage.descriptor_mut(reg_handle) {
                *desc = SharedRegisterDescriptor {
                    value: spec.reset_value,
                    writable_mask: spec.writable_mask,
                    trap_on_read: spec.active_on_read,
                    trap_on_write: spec.active_on_write,
                    owner: Some((handle, i as u16)),
                };
            }
        }

        device.base().install(handle, specs, base, first_handle);

        if index == self.devices.len() {
            self.devices.push(None);
        }
        self.devices[index] = Some(Installed {
            device: device.clone(),
        });

        if device.is_cpu() {
            self.cpu_handle = Some(handle);
        }

        tracing::debug!(device = device.name(), handle = handle.0, "device installed");
        Ok(handle)
    }

    pub fn uninstall(&mut self, handle: DeviceHandle, iopage: &mut IoPageMap) {
        let index = handle.0 as usize - 1;
        let Some(installed) = self.devices.get_mut(index).and_then(Option::take) else {
            return;
        };
        let specs = installed.device.register_specs();
        let base = installed.device.base_address();
        for i in 0..specs.len() {
            iopage
                .clear_entry(base + 2 * i as u32)
                .expect("address was validated at install time");
        }
        installed.device.base().uninstall();
        if self.cpu_handle == Some(handle) {
            self.cpu_handle = None;
        }
        tracing::debug!(device = installed.device.name(), handle = handle.0, "device uninstalled");
    }

    pub fn cpu_handle(&self) -> Option<DeviceHandle> {
        self.cpu_handle
    }

    /// Broadcast an INIT edge to every installed device, in handle order.
    pub fn broadcast_init_change(&self, asserted: bool) {
        for device in self.iter_installed() {
            device.on_init_change(asserted);
        }
    }

    /// Broadcast a power edge to every installed device, in handle order.
    pub fn broadcast_power_change(&self, aclo_edge: Edge, dclo_edge: Edge) {
        for device in self.iter_installed() {
            device.on_power_change(aclo_edge, dclo_edge);
        }
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
