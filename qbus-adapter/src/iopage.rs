// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! I/O-page register map (C2): a dense table from even I/O-page address to
//! register handle, plus the companion shared register descriptor table
//! every slave bus access is resolved against.

use qbus_proto::{DeviceHandle, RegisterHandle, MAX_REGISTER_HANDLES, NO_REGISTER, ROM_SENTINEL};

use crate::err::ConfigError;

/// Descriptor shared with the wire engine for one installed device
/// register. Lives at index `handle - 1` of [`IoPageMap`]'s descriptor
/// table.
#[derive(Debug, Clone, Copy, Default)]
pub struct SharedRegisterDescriptor {
    pub value: u16,
    pub writable_mask: u16,
    pub trap_on_read: bool,
    pub trap_on_write: bool,
    /// Owning device and register index within it; `None` for a
    /// descriptor slot that is not currently assigned to any device.
    pub owner: Option<(DeviceHandle, u16)>,
}

impl SharedRegisterDescriptor {
    pub fn is_active(&self) -> bool {
        self.trap_on_read || self.trap_on_write
    }
}

pub struct IoPageMap {
    iopage_base: u32,
    entries: Vec<RegisterHandle>,
    descriptors: Vec<SharedRegisterDescriptor>,
}

impl IoPageMap {
    /// `word_count` is the number of addressable 16-bit cells in the I/O
    /// page, i.e. `address_space_size / 2`.
    pub fn new(iopage_base: u32, word_count: usize) -> IoPageMap {
        IoPageMap {
            iopage_base,
            entries: vec![RegisterHandle::NONE; word_count],
            descriptors: vec![SharedRegisterDescriptor::default(); MAX_REGISTER_HANDLES],
        }
    }

    /// Word index for `addr`, or `None` if `addr` lies before
    /// `iopage_base` or beyond the mapped word count. Tolerates odd
    /// addresses (floor division), since runtime slave-access resolution
    /// (`lookup`/`is_rom`) must cope with byte-addressed bus cycles.
    fn raw_index_of(&self, addr: u32) -> Option<usize> {
        let idx = (addr.checked_sub(self.iopage_base)? / 2) as usize;
        (idx < self.entries.len()).then_some(idx)
    }

    /// Like `raw_index_of`, but rejects odd addresses outright: spec §4.7
    /// requires ROM and device-register addresses to be even and inside
    /// the I/O page.
    fn checked_index_of(&self, addr: u32) -> Result<usize, ConfigError> {
        if addr % 2 != 0 {
            return Err(ConfigError::InvalidRegisterAddress { address: addr });
        }
        self.raw_index_of(addr)
            .ok_or(ConfigError::InvalidRegisterAddress { address: addr })
    }

    /// Confirm `addr` is even and inside the I/O page, without touching
    /// any entry. Used by the registry to validate every register address
    /// a device advertises before any handle allocation takes place.
    pub fn validate_address(&self, addr: u32) -> Result<(), ConfigError> {
        self.checked_index_of(addr).map(|_| ())
    }

    /// Resolve an I/O-page address to a register handle. Odd addresses
    /// resolve to the same cell as the preceding even address (a ROM or
    /// device register never sits on an odd boundary, so this never
    /// spuriously yields the ROM sentinel for an odd address that wasn't
    /// deliberately installed there).
    pub fn lookup(&self, addr: u32) -> RegisterHandle {
        self.raw_index_of(addr)
            .and_then(|idx| self.entries.get(idx))
            .copied()
            .unwrap_or(RegisterHandle::NONE)
    }

    pub fn descriptor(&self, handle: RegisterHandle) -> Option<&SharedRegisterDescriptor> {
        handle.device_index().map(|i| &self.descriptors[i])
    }

    pub fn descriptor_mut(&mut self, handle: RegisterHandle) -> Option<&mut SharedRegisterDescriptor> {
        handle.device_index().map(move |i| &mut self.descriptors[i])
    }

    /// Allocate `count` contiguous register handles. Picks `max_used + 1`
    /// with no hole-filling, matching the device lifetime model (coarse:
    /// handles are reused only when a whole device re-installs).
    pub fn allocate_range(&mut self, count: usize) -> Result<u8, ConfigError> {
        if count == 0 {
            return Ok(0);
        }
        let max_used = self
            .descriptors
            .iter()
            .enumerate()
            .filter(|(_, d)| d.owner.is_some())
            .map(|(i, _)| i + 1)
            .max()
            .unwrap_or(0);
        let first = max_used + 1;
        let available = MAX_REGISTER_HANDLES.saturating_sub(max_used);
        if available < count {
            return Err(ConfigError::OutOfRegisterHandles {
                requested: count,
                available,
            });
        }
        Ok(first as u8)
    }

    pub fn set_device_entry(&mut self, addr: u32, handle: RegisterHandle) -> Result<(), ConfigError> {
        let idx = self.checked_index_of(addr)?;
        let existing = self.entries[idx];
        if !existing.is_none() && !existing.is_rom() {
            return Err(ConfigError::AddressConflict { address: addr });
        }
        self.entries[idx] = handle;
        Ok(())
    }

    pub fn clear_entry(&mut self, addr: u32) -> Result<(), ConfigError> {
        let idx = self.checked_index_of(addr)?;
        self.entries[idx] = RegisterHandle::NONE;
        Ok(())
    }

    /// Mark `addr` as a ROM cell, unless a device register already
    /// occupies it (the device register wins; the ROM reappears when the
    /// device uninstalls).
    pub fn set_rom(&mut self, addr: u32) -> Result<(), ConfigError> {
        let idx = self.checked_index_of(addr)?;
        let existing = self.entries[idx];
        if existing.is_rom() {
            return Err(ConfigError::RomAlreadyInstalled { address: addr });
        }
        if existing.is_none() {
            self.entries[idx] = RegisterHandle::ROM;
        }
        Ok(())
    }

    /// Clear the ROM sentinel at `addr`, unless it currently holds a
    /// device register (no-op then: the device will clear it itself on
    /// uninstall) or is already empty (no-op).
    pub fn clear_rom(&mut self, addr: u32) -> Result<(), ConfigError> {
        let idx = self.checked_index_of(addr)?;
        if self.entries[idx].is_rom() {
            self.entries[idx] = RegisterHandle::NONE;
        }
        Ok(())
    }

    pub fn is_rom(&self, addr: u32) -> bool {
        self.raw_index_of(addr)
            .and_then(|idx| self.entries.get(idx))
            .is_some_and(|h| h.is_rom())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> IoPageMap {
        IoPageMap::new(0o760000, 4096)
    }

    #[test]
    fn lookup_defaults_to_none() {
        let m = map();
        assert_eq!(m.lookup(0o760100), RegisterHandle::NONE);
    }

    #[test]
    fn rom_install_and_shadow_by_device() {
        let mut m = map();
        m.set_rom(0o760100).unwrap();
        assert!(m.is_rom(0o760100));
        m.set_device_entry(0o760100, RegisterHandle(5)).unwrap();
        assert!(!m.is_rom(0o760100));
        m.clear_rom(0o760100).unwrap();
        assert!(!m.is_rom(0o760100));
        m.clear_entry(0o760100).unwrap();
        m.set_rom(0o760100).unwrap();
        assert!(m.is_rom(0o760100));
    }

    #[test]
    fn odd_address_rejected() {
        let mut m = map();
        assert_eq!(
            m.set_rom(0o760101),
            Err(ConfigError::InvalidRegisterAddress { address: 0o760101 })
        );
        assert_eq!(
            m.set_device_entry(0o760101, RegisterHandle(1)),
            Err(ConfigError::InvalidRegisterAddress { address: 0o760101 })
        );
        // Lookup and is_rom stay tolerant of odd addresses (byte-addressed
        // bus cycles resolve to the enclosing even cell).
        assert_eq!(m.lookup(0o760101), RegisterHandle::NONE);
        assert!(!m.is_rom(0o760101));
    }

    #[test]
    fn out_of_range_address_rejected() {
        let mut m = map();
        let below = 0o760000 - 2;
        let above = 0o760000 + 2 * 4096;
        assert_eq!(
            m.set_rom(below),
            Err(ConfigError::InvalidRegisterAddress { address: below })
        );
        assert_eq!(
            m.set_rom(above),
            Err(ConfigError::InvalidRegisterAddress { address: above })
        );
        assert_eq!(m.lookup(below), RegisterHandle::NONE);
        assert_eq!(m.lookup(above), RegisterHandle::NONE);
    }

    #[test]
    fn address_conflict_rejected() {
        let mut m = map();
        m.set_device_entry(0o760100, RegisterHandle(1)).unwrap();
        assert_eq!(
            m.set_device_entry(0o760100, RegisterHandle(2)),
            Err(ConfigError::AddressConflict { address: 0o760100 })
        );
    }

    #[test]
    fn allocate_range_exhaustion() {
        let mut m = map();
        assert_eq!(m.allocate_range(200).unwrap(), 1);
        // Pretend those 200 got installed by writing owners directly.
        for i in 0..200 {
            m.descriptors[i].owner = Some((DeviceHandle(1), i as u16));
        }
        assert_eq!(
            m.allocate_range(60),
            Err(ConfigError::OutOfRegisterHandles {
                requested: 60,
                available: 54
            })
        );
        assert_eq!(m.allocate_range(54).unwrap(), 201);
    }
}
