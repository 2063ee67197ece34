// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Request scheduler (C5): accepts DMA and INTR requests from device
//! threads, places them into the priority request tables, chooses the
//! next active request via lowest-set-bit of the slot bitmask, pushes
//! work to the mailbox, recognizes completion, chunks long DMAs, and
//! enforces DMA-vs-INTR exclusion and cross-level priority.
//!
//! Exactly one [`std::sync::Mutex`] (`Tables`) protects the five priority
//! tables and their in-flight pointers, matching the original's single
//! `requests_mutex`. It is held only for small sections and never across
//! a wire-engine round-trip.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use qbus_proto::{
    CancelLevels, DeviceHandle, DmaCycle, DmaStatus, Level, RegisterHandle, WireCommand,
    WIRE_CHUNK_CAP,
};

use crate::err::ProtocolViolation;
use crate::iopage::IoPageMap;
use crate::mailbox::MailboxHandle;
use crate::protocol_violation;
use crate::registry::DeviceRegistry;
use crate::request::{DmaRequest, IntrRequest, LevelTable};

struct Tables {
    npr: LevelTable<DmaRequest>,
    intr: [LevelTable<IntrRequest>; 4],
}

impl Tables {
    fn new() -> Tables {
        Tables {
            npr: LevelTable::new(),
            intr: [
                LevelTable::new(),
                LevelTable::new(),
                LevelTable::new(),
                LevelTable::new(),
            ],
        }
    }

    /// True if any level at or above `level` (NPR outranks every INTR
    /// level) currently has a request executing on the wire. Used to
    /// decide whether an INTR's side-effect write can ride along
    /// atomically with the grant, or must be applied immediately.
    fn blocking_active_at_or_above(&self, level: Level) -> bool {
        if self.npr.active.is_some() {
            return true;
        }
        Level::INTR_LEVELS
            .iter()
            .filter(|l| l.start_priority() >= level.start_priority())
            .any(|l| self.intr[l.index()].active.is_some())
    }

}

pub struct Scheduler {
    tables: Mutex<Tables>,
    mailbox: Arc<MailboxHandle>,
    iopage: Arc<Mutex<IoPageMap>>,
    registry: Arc<Mutex<DeviceRegistry>>,
    address_space_size: u32,
    init_asserted: AtomicBool,
}

impl Scheduler {
    pub fn new(
        mailbox: Arc<MailboxHandle>,
        iopage: Arc<Mutex<IoPageMap>>,
        registry: Arc<Mutex<DeviceRegistry>>,
        address_space_size: u32,
    ) -> Scheduler {
        Scheduler {
            tables: Mutex::new(Tables::new()),
            mailbox,
            iopage,
            registry,
            address_space_size,
            init_asserted: AtomicBool::new(false),
        }
    }

    pub fn is_init_asserted(&self) -> bool {
        self.init_asserted.load(Ordering::SeqCst)
    }

    // ---- DMA path --------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn dma(
        &self,
        request: &Arc<DmaRequest>,
        blocking: bool,
        cycle: DmaCycle,
        start_addr: u32,
        buffer: &mut [u16],
        word_count: u32,
    ) {
        assert!(word_count >= 1, "dma word_count must be >= 1");
        assert!(
            start_addr as u64 + 2 * word_count as u64 <= self.address_space_size as u64,
            "dma range exceeds address space"
        );
        if !(1..=31).contains(&request.slot) {
            protocol_violation!(ProtocolViolation::InvalidSlot { slot: request.slot });
        }

        if self.is_init_asserted() {
            request.completion_signal_failed();
            return;
        }

        let write_data = matches!(cycle, DmaCycle::Write | DmaCycle::ByteWrite)
            .then(|| &buffer[..word_count as usize]);
        request.reset_for_start(
            cycle,
            start_addr,
            word_count,
            write_data,
            WIRE_CHUNK_CAP as u32,
        );

        {
            let mut tables = self.tables.lock().unwrap();
            if tables.npr.get(request.slot).is_some() {
                drop(tables);
                protocol_violation!(ProtocolViolation::DmaSlotBusy { slot: request.slot });
            }
            tables.npr.insert(request.slot, request.clone());
            if tables.npr.active.is_none() {
                self.activate_dma(&mut tables);
            }
        }

        if request.is_cpu_access {
            while !request.is_complete() {
                std::thread::yield_now();
            }
        } else if blocking {
            request.wait();
        } else {
            return;
        }

        if matches!(cycle, DmaCycle::Read) {
            request.read_result(&mut buffer[..word_count as usize]);
        }
    }

    /// Caller holds `tables`. Picks the lowest pending NPR slot and pushes
    /// its next chunk to the wire engine.
    fn activate_dma(&self, tables: &mut Tables) {
        let Some(slot) = tables.npr.lowest_pending_slot() else {
            return;
        };
        let request = tables.npr.get(slot).unwrap().clone();
        tables.npr.active = Some(request.clone());

        let mut state = request.state.lock().unwrap();
        state.executing = true;
        let done_words = (state.chunk_start - state.start_addr) / 2;
        let remaining = state.word_count - done_words;
        let chunk_words = state.chunk_max.min(remaining);
        state.chunk_words = chunk_words;
        let chunk_start = state.chunk_start;
        let cycle = state.cycle;
        let offset = done_words as usize;
        let write_payload = match cycle {
            DmaCycle::Read => None,
            _ => Some(state.buffer[offset..offset + chunk_words as usize].to_vec()),
        };
        drop(state);

        self.mailbox.with(|mb| {
            mb.dma.start_address = chunk_start;
            mb.dma.cycle = cycle;
            mb.dma.word_count = chunk_words;
            mb.dma.cpu_access = request.is_cpu_access;
            mb.dma.status = DmaStatus::InProgress;
            if let Some(payload) = write_payload {
                mb.dma.data[..payload.len()].copy_from_slice(&payload);
            }
            mb.command = Some(WireCommand::Dma);
        });
        self.mailbox.notify_host_command();
        tracing::trace!(slot, chunk_start, chunk_words, "dma chunk pushed");
    }

    /// Called by the event loop when the mailbox reports a DMA-complete
    /// event (non-CPU DMA only; CPU DMA is polled by the caller).
    pub fn dma_chunk_complete(&self, status: DmaStatus, current_address: u32, inbound: &[u16]) {
        let mut tables = self.tables.lock().unwrap();
        let Some(request) = tables.npr.active.clone() else {
            return;
        };

        let (finished, success) = {
            let mut state = request.state.lock().unwrap();
            state.end_addr = current_address;
            if matches!(state.cycle, DmaCycle::Read) {
                let offset = ((state.chunk_start - state.start_addr) / 2) as usize;
                let n = state.chunk_words as usize;
                state.buffer[offset..offset + n].copy_from_slice(&inbound[..n]);
            }
            let timed_out = matches!(status, DmaStatus::BusTimeout);
            let done_words = (state.chunk_start - state.start_addr) / 2 + state.chunk_words;
            let all_done = done_words >= state.word_count;
            if timed_out {
                state.success = false;
                state.executing = false;
                (true, false)
            } else if all_done {
                state.success = true;
                state.executing = false;
                (true, true)
            } else {
                state.chunk_start += 2 * state.chunk_words;
                (false, true)
            }
        };

        if finished {
            tables.npr.remove(request.slot);
            tables.npr.active = None;
            if !success {
                // already recorded above
            }
            drop(tables);
            request.completion.signal();
            if !request.is_cpu_access {
                tracing::debug!(slot = request.slot, success, "dma request complete");
            }
        } else {
            tables.npr.active = None;
            self.activate_dma(&mut tables);
        }
    }

    // ---- INTR path --------------------------------------------------

    pub fn intr(
        &self,
        request: &Arc<IntrRequest>,
        vector: u16,
        side_effect: Option<(RegisterHandle, u16)>,
    ) {
        if !(1..=31).contains(&request.slot) {
            protocol_violation!(ProtocolViolation::InvalidSlot { slot: request.slot });
        }
        if !request.level.is_intr() {
            protocol_violation!(ProtocolViolation::InvalidLevel { level: 0 });
        }
        if vector % 4 != 0 {
            protocol_violation!(ProtocolViolation::MisalignedVector { vector });
        }

        if self.is_init_asserted() {
            request.completion.signal();
            return;
        }

        let mut tables = self.tables.lock().unwrap();
        let level = request.level;
        let table = &mut tables.intr[level.index()];

        if let Some(existing) = table.get(request.slot) {
            let same_request_identity = Arc::ptr_eq(existing, request);
            let same_logical_source =
                existing.device == request.device && existing.vector() == vector;
            if same_request_identity || same_logical_source {
                let mut state = existing.state.lock().unwrap();
                state.vector = vector;
                if let Some((reg, val)) = side_effect {
                    state.side_effect_register = Some(reg);
                    state.side_effect_value = val;
                }
                return;
            }
            drop(tables);
            protocol_violation!(ProtocolViolation::IntrSlotConflict {
                slot: request.slot,
                level,
            });
        }

        {
            let mut state = request.state.lock().unwrap();
            state.vector = vector;
            state.executing = false;
        }

        let blocking = tables.blocking_active_at_or_above(level);
        if blocking {
            if let Some((reg, val)) = side_effect {
                self.publish_side_effect(request.device, reg, val);
            }
        } else if let Some((reg, val)) = side_effect {
            let mut state = request.state.lock().unwrap();
            state.side_effect_register = Some(reg);
            state.side_effect_value = val;
        }

        tables.intr[level.index()].insert(request.slot, request.clone());
        if tables.intr[level.index()].active.is_none() {
            self.activate_intr(&mut tables, level);
        }
    }

    fn activate_intr(&self, tables: &mut Tables, level: Level) {
        let table = &mut tables.intr[level.index()];
        let Some(slot) = table.lowest_pending_slot() else {
            return;
        };
        let request = table.get(slot).unwrap().clone();
        table.active = Some(request.clone());

        let mut state = request.state.lock().unwrap();
        state.executing = true;
        let vector = state.vector;
        let side_effect_register = state.side_effect_register.take().unwrap_or(RegisterHandle::NONE);
        let side_effect_value = state.side_effect_value;
        drop(state);

        self.mailbox.with(|mb| {
            mb.intr.level_index = level.index() as u8;
            mb.intr.vector = vector;
            mb.intr.side_effect_register = side_effect_register;
            mb.intr.side_effect_value = side_effect_value;
            mb.command = Some(WireCommand::Intr);
        });
        self.mailbox.notify_host_command();
        tracing::debug!(?level, slot, vector, "intr pushed");
    }

    /// Called by the event loop on a per-level INTR-completion event.
    pub fn intr_level_complete(&self, level: Level) {
        let mut tables = self.tables.lock().unwrap();
        let table = &mut tables.intr[level.index()];
        let Some(active) = table.active.take() else {
            return;
        };
        table.remove(active.slot);
        active.completion.signal();
        self.activate_intr(&mut tables, level);
    }

    pub fn cancel_intr(&self, request: &Arc<IntrRequest>) {
        let mut tables = self.tables.lock().unwrap();
        let level = request.level;
        let table = &mut tables.intr[level.index()];
        let is_active = table
            .active
            .as_ref()
            .is_some_and(|a| Arc::ptr_eq(a, request));
        if is_active {
            table.remove(request.slot);
            table.active = None;
            self.mailbox.with(|mb| {
                mb.intr.cancel_mask = CancelLevels::for_level(level);
                mb.command = Some(WireCommand::IntrCancel);
            });
            self.mailbox.notify_host_command();
            self.activate_intr(&mut tables, level);
        } else {
            table.remove(request.slot);
        }
        request.completion.signal();
    }

    fn publish_side_effect(&self, owner: Option<DeviceHandle>, handle: RegisterHandle, value: u16) {
        let iopage = self.iopage.lock().unwrap();
        let Some(desc) = iopage.descriptor(handle) else {
            return;
        };
        let Some((owning_device, reg_index)) = desc.owner else {
            return;
        };
        drop(iopage);
        // Open question #3: the source permits a side-effect register
        // belonging to a different device than the INTR's owner and does
        // not document whether that is by design. Treated as undefined
        // here: we apply the write regardless (a controller raising on
        // behalf of a sibling chip is plausible), but assert the common
        // case in debug builds so a real mismatch is caught during
        // development rather than silently accepted.
        if let Some(owner) = owner {
            debug_assert_eq!(owner, owning_device, "intr side-effect register owner mismatch");
        }
        let registry = self.registry.lock().unwrap();
        if let Some(device) = registry.get(owning_device) {
            device.base().set_read_value(reg_index, value);
        }
    }

    // ---- INIT / power cancellation ----------------------------------

    pub fn set_init_asserted(&self, asserted: bool) {
        self.init_asserted.store(asserted, Ordering::SeqCst);
        if asserted {
            self.cancel_all(true);
        }
    }

    /// Cancel every pending and active request across all five levels.
    /// `send_wire_cancel` additionally issues an INTR-cancel command for
    /// all four BR levels (done for INIT; DCLO cancellation is purely
    /// local bookkeeping, matching the original's narrower DCLO handling).
    pub fn cancel_all(&self, send_wire_cancel: bool) {
        let mut tables = self.tables.lock().unwrap();
        let dma_drained = tables.npr.drain_all();
        let mut intr_drained = Vec::new();
        for table in tables.intr.iter_mut() {
            intr_drained.extend(table.drain_all());
        }
        drop(tables);

        for request in &dma_drained {
            let mut state = request.state.lock().unwrap();
            state.executing = false;
            state.success = false;
            drop(state);
            request.completion.signal();
        }
        for request in &intr_drained {
            let mut state = request.state.lock().unwrap();
            state.executing = false;
            drop(state);
            request.completion.signal();
        }

        if send_wire_cancel {
            self.mailbox.with(|mb| {
                mb.intr.cancel_mask = CancelLevels::ALL;
                mb.command = Some(WireCommand::IntrCancel);
            });
            self.mailbox.notify_host_command();
        }

        tracing::debug!(
            dma_cancelled = dma_drained.len(),
            intr_cancelled = intr_drained.len(),
            "cancelled all pending/active requests"
        );
    }
}
