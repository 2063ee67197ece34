// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The adapter core: priority-arbitration scheduler, shared I/O-page
//! register map, DMA/INTR request lifecycle, and the event loop that
//! couples host-side device models with the wire engine over a shared
//! mailbox.
//!
//! Deliberately out of scope (per the module-level docs on each piece):
//! the wire engine itself, concrete device models, the embedded CPU
//! emulator's instruction logic, and any CLI/shell layer — this crate is
//! the composition root those things are built on top of.

pub mod bus;
pub mod device;
pub mod err;
mod event_loop;
pub mod iopage;
pub mod mailbox;
pub mod registry;
pub mod request;
pub mod rom;
pub mod scheduler;

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

pub use qbus_proto::{CycleKind, DeviceHandle, DmaCycle, Level, RegisterHandle};

pub use bus::{AddressWidth, BusConfig, BusFacade, PowerPhase};
pub use device::{Device, DeviceBase, DebugEvent, DebugSink, NullDebugSink, RegisterSpec};
pub use err::{ConfigError, ProtocolViolation};
pub use request::{DmaRequest, IntrRequest};
pub use rom::RomImage;
pub use scheduler::Scheduler;

use event_loop::EventLoop;
use iopage::IoPageMap;
use mailbox::MailboxHandle;
use registry::DeviceRegistry;

/// Everything the adapter core owns: mailbox, I/O-page map, device
/// registry, scheduler, event loop, ROM images, and the bus facade handed
/// to non-device callers. The single composition root described in §9's
/// "Global singletons" note — one explicit owned object, not a set of
/// process globals.
pub struct AdapterCore {
    mailbox: Arc<MailboxHandle>,
    iopage: Arc<Mutex<IoPageMap>>,
    registry: Arc<Mutex<DeviceRegistry>>,
    scheduler: Arc<Scheduler>,
    event_loop: Arc<EventLoop>,
    event_loop_thread: Mutex<Option<JoinHandle<()>>>,
    roms: Mutex<Vec<RomImage>>,
    config: BusConfig,
}

impl AdapterCore {
    /// Build the core for the given bus configuration. Does not spawn the
    /// event-loop thread; call `start` once the caller is ready to accept
    /// wire-engine traffic (a `FakeWireEngine`-driven test typically skips
    /// `start` and drains the mailbox itself instead).
    pub fn new(config: BusConfig) -> AdapterCore {
        let mailbox = Arc::new(MailboxHandle::new());
        let address_space_size = config.address_space_size();
        let iopage = Arc::new(Mutex::new(IoPageMap::new(
            config.iopage_base(),
            (address_space_size / 2) as usize,
        )));
        let registry = Arc::new(Mutex::new(DeviceRegistry::new()));
        let scheduler = Arc::new(Scheduler::new(
            mailbox.clone(),
            iopage.clone(),
            registry.clone(),
            address_space_size,
        ));
        let event_loop = Arc::new(EventLoop::new(
            mailbox.clone(),
            registry.clone(),
            scheduler.clone(),
        ));
        AdapterCore {
            mailbox,
            iopage,
            registry,
            scheduler,
            event_loop,
            event_loop_thread: Mutex::new(None),
            roms: Mutex::new(Vec::new()),
            config,
        }
    }

    pub fn config(&self) -> BusConfig {
        self.config
    }

    pub fn mailbox(&self) -> &Arc<MailboxHandle> {
        &self.mailbox
    }

    /// The shared I/O-page map, for constructing a [`DeviceBase`] before
    /// the device is installed.
    pub fn iopage(&self) -> &Arc<Mutex<IoPageMap>> {
        &self.iopage
    }

    pub fn bus(&self) -> BusFacade {
        BusFacade::new(self.config, self.scheduler.clone(), self.registry.clone())
    }

    /// A handle to the scheduler, for device models that own their own
    /// DMA/INTR requests and submit work on their own slot (as opposed to
    /// the facade's controller-less, reserved-slot calls).
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Spawn the event-loop thread. Idempotent: a second call is a no-op
    /// if one is already running.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.event_loop_thread.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let event_loop = self.event_loop.clone();
        *guard = Some(
            std::thread::Builder::new()
                .name("qbus-event-loop".into())
                .spawn(move || event_loop.run())
                .expect("spawn event loop thread"),
        );
    }

    /// Signal the event-loop thread to stop and join it. A no-op if the
    /// loop was never started.
    pub fn stop(&self) {
        let handle = self.event_loop_thread.lock().unwrap().take();
        if let Some(handle) = handle {
            self.event_loop.stop();
            let _ = handle.join();
        }
    }

    /// Install a device: allocate its handle and register-handle range,
    /// populate the I/O page, run its install hooks, then fire a
    /// synthetic DCLO power pulse as reset (§3's device lifecycle).
    pub fn register_device(&self, device: Arc<dyn Device>) -> Result<DeviceHandle, ConfigError> {
        if !device.on_before_install() {
            return Err(ConfigError::AddressConflict {
                address: device.base_address(),
            });
        }
        let handle = {
            let mut registry = self.registry.lock().unwrap();
            let mut iopage = self.iopage.lock().unwrap();
            registry.install(device.clone(), &mut iopage)?
        };
        device.base().reset_registers();
        device.on_after_install();
        Ok(handle)
    }

    pub fn unregister_device(&self, device: &Arc<dyn Device>) {
        device.on_before_uninstall();
        {
            let mut registry = self.registry.lock().unwrap();
            let mut iopage = self.iopage.lock().unwrap();
            registry.uninstall(device.base().handle(), &mut iopage);
        }
        device.on_after_uninstall();
    }

    /// Register a ROM word at `addr` (even, inside the I/O page) backed
    /// by `image`. Fails if `addr` is already a ROM cell; a device
    /// register already at `addr` silently supersedes the ROM (§4.7).
    pub fn register_rom(&self, addr: u32, image: RomImage) -> Result<(), ConfigError> {
        self.iopage.lock().unwrap().set_rom(addr)?;
        self.roms.lock().unwrap().push(image);
        Ok(())
    }

    pub fn unregister_rom(&self, addr: u32) {
        let _ = self.iopage.lock().unwrap().clear_rom(addr);
        self.roms.lock().unwrap().retain(|r| !r.contains(addr));
    }

    pub fn is_rom(&self, addr: u32) -> bool {
        self.iopage.lock().unwrap().is_rom(addr)
    }
}

impl Drop for AdapterCore {
    fn drop(&mut self) {
        self.stop();
    }
}
