// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Event loop (C6): the single real-time thread that drains mailbox
//! events in a fixed order and calls back into device models and the
//! scheduler.
//!
//! Every drain step acquires the mailbox lock just long enough to read
//! and acknowledge one event, then releases it before calling into the
//! scheduler or registry — those in turn push the next mailbox command
//! themselves. Holding the mailbox lock across such a call would
//! deadlock, since `MailboxHandle::with` is not reentrant.
//!
//! INIT ordering: a falling (negated) edge is handled immediately, in
//! position, so any device broadcast it causes happens before this
//! pass's slave-access/DMA/INTR steps. A raising (asserted) edge is
//! detected up front but its consequences — cancellation, the device
//! broadcast, and the channel's acknowledgement — are deferred to the
//! end of the pass, so any slave cycle already in flight this pass
//! finishes first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use qbus_proto::{CycleKind, Edge, EdgeDetector, EventChannels, Level};

use crate::registry::DeviceRegistry;
use crate::scheduler::Scheduler;
use crate::mailbox::MailboxHandle;

const POLL_TIMEOUT: Duration = Duration::from_millis(50);

pub struct EventLoop {
    mailbox: Arc<MailboxHandle>,
    registry: Arc<Mutex<DeviceRegistry>>,
    scheduler: Arc<Scheduler>,
    init_edge: Mutex<EdgeDetector>,
    shutdown: AtomicBool,
}

impl EventLoop {
    pub fn new(
        mailbox: Arc<MailboxHandle>,
        registry: Arc<Mutex<DeviceRegistry>>,
        scheduler: Arc<Scheduler>,
    ) -> EventLoop {
        EventLoop {
            mailbox,
            registry,
            scheduler,
            init_edge: Mutex::new(EdgeDetector::default()),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Run until `stop` is called. Intended to be the body of the
    /// dedicated event-loop thread.
    pub fn run(&self) {
        while !self.shutdown.load(Ordering::Relaxed) {
            drop(self.mailbox.wait_for_events(POLL_TIMEOUT));
            self.drain_pass();
        }
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.mailbox.notify_wire_events();
    }

    fn drain_pass(&self) {
        let mut pending_assert = false;

        if let Some(edge) = self.read_init_edge() {
            match edge {
                Edge::Falling => {
                    self.scheduler.set_init_asserted(false);
                    self.ack_init();
                    self.registry.lock().unwrap().broadcast_init_change(false);
                }
                Edge::Raising => {
                    pending_assert = true;
                }
                Edge::None => {
                    self.ack_init();
                    tracing::warn!("stray INIT event with no detected edge; debounced");
                }
            }
        }

        self.drain_power();
        self.drain_slave_access();
        self.drain_dma_complete();
        for level in Level::INTR_LEVELS {
            self.drain_intr_complete(level);
        }
        self.drain_cpu_interrupt();

        if pending_assert {
            self.scheduler.set_init_asserted(true);
            self.registry.lock().unwrap().broadcast_init_change(true);
            self.ack_init();
        }
    }

    fn read_init_edge(&self) -> Option<Edge> {
        self.mailbox.with(|mb| {
            if !mb.events.is_pending(EventChannels::INIT) {
                return None;
            }
            let current = mb.init.signal_current;
            Some(self.init_edge.lock().unwrap().update(current))
        })
    }

    fn ack_init(&self) {
        self.mailbox.with(|mb| mb.events.ack(EventChannels::INIT));
    }

    fn drain_power(&self) -> bool {
        let record = self.mailbox.with(|mb| {
            if !mb.events.is_pending(EventChannels::POWER) {
                return None;
            }
            let record = mb.power;
            mb.events.ack(EventChannels::POWER);
            Some(record)
        });
        let Some(record) = record else {
            return false;
        };
        let aclo_edge = record.aclo_edge();
        let dclo_edge = record.dclo_edge();
        self.registry
            .lock()
            .unwrap()
            .broadcast_power_change(aclo_edge, dclo_edge);
        if matches!(dclo_edge, Edge::Raising) {
            // Power loss: cancel locally, but don't issue a wire-level
            // INTR-cancel — the bus itself is about to go unpowered.
            self.scheduler.cancel_all(false);
        }
        true
    }

    fn drain_slave_access(&self) -> bool {
        let record = self.mailbox.with(|mb| {
            if !mb.events.is_pending(EventChannels::SLAVE_ACCESS) {
                return None;
            }
            let record = mb.slave_access.take();
            mb.events.ack(EventChannels::SLAVE_ACCESS);
            record
        });
        let Some(record) = record else {
            return false;
        };

        let device = {
            let registry = self.registry.lock().unwrap();
            registry.get(record.device_handle).cloned()
        };
        let Some(device) = device else {
            return true;
        };

        let base = device.base();
        let reg_idx = record.register_index;
        let (active_on_read, active_on_write, writable_mask) = base.register_flags(reg_idx);

        match record.cycle_kind {
            CycleKind::Read => {
                if active_on_read {
                    device.on_register_access(reg_idx, CycleKind::Read);
                }
            }
            write_kind if active_on_write => {
                let masked = record.data & writable_mask;
                let spliced = match write_kind {
                    CycleKind::WriteWord => masked,
                    CycleKind::WriteByteLow => {
                        (base.write_shadow(reg_idx) & 0xff00) | (masked & 0x00ff)
                    }
                    CycleKind::WriteByteHigh => {
                        (base.write_shadow(reg_idx) & 0x00ff) | (masked & 0xff00)
                    }
                    CycleKind::Read => unreachable!(),
                };
                base.apply_write(reg_idx, spliced);
                device.on_register_access(reg_idx, CycleKind::WriteWord);
            }
            _ => {
                tracing::trace!(
                    device = device.name(),
                    reg_idx,
                    "write to passive register; no device callback"
                );
            }
        }
        true
    }

    fn drain_dma_complete(&self) -> bool {
        let completion = self.mailbox.with(|mb| {
            if !mb.events.is_pending(EventChannels::DMA_COMPLETE) {
                return None;
            }
            let status = mb.dma.status;
            let current_address = mb.dma.current_address;
            let inbound = mb.dma.data;
            mb.events.ack(EventChannels::DMA_COMPLETE);
            Some((status, current_address, inbound))
        });
        let Some((status, current_address, inbound)) = completion else {
            return false;
        };
        self.scheduler
            .dma_chunk_complete(status, current_address, &inbound);
        true
    }

    fn drain_intr_complete(&self, level: Level) -> bool {
        let channel = EventChannels::for_level(level);
        let fired = self.mailbox.with(|mb| {
            if mb.events.is_pending(channel) {
                mb.events.ack(channel);
                true
            } else {
                false
            }
        });
        if fired {
            self.scheduler.intr_level_complete(level);
        }
        fired
    }

    /// The wire engine raises this once the emulated CPU has fetched the
    /// vector of the interrupt it was just granted (`mb.intr.vector`
    /// still holds that vector — a CPU-interrupt event is only ever
    /// raised in direct response to a grant this core just pushed).
    fn drain_cpu_interrupt(&self) -> bool {
        let vector = self.mailbox.with(|mb| {
            if !mb.events.is_pending(EventChannels::CPU_INTERRUPT) {
                return None;
            }
            let vector = mb.intr.vector;
            mb.events.ack(EventChannels::CPU_INTERRUPT);
            Some(vector)
        });
        let Some(vector) = vector else {
            return false;
        };
        let cpu = {
            let registry = self.registry.lock().unwrap();
            registry
                .cpu_handle()
                .and_then(|h| registry.get(h).cloned())
        };
        if let Some(cpu) = cpu {
            cpu.on_cpu_interrupt(vector);
        }
        true
    }
}
