// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Request types (C7) and the priority request table (C4).
//!
//! A priority request is polymorphic over two concrete forms, DMA and
//! INTR; rather than a shared base class, each is its own type and the
//! per-level table is generic over which one it holds (NPR holds DMA
//! requests, BR4..BR7 hold INTR requests — never mixed, so no runtime
//! type tag is needed).
//!
//! Devices own their requests (`Arc<DmaRequest>`/`Arc<IntrRequest>`); the
//! scheduler's tables hold clones of the same `Arc` — shared ownership is
//! the idiomatic Rust translation of the original's non-owning back
//! pointers, which relied on the device outliving the table entry by
//! convention alone.

use std::sync::{Arc, Condvar, Mutex};

use qbus_proto::{DeviceHandle, DmaCycle, EdgeDetector, Level, RegisterHandle, PRIORITY_SLOT_COUNT};

/// Completion signalling, deliberately distinct from the scheduler lock:
/// a completing thread can signal while a waiter wakes without having to
/// reacquire the scheduler's global mutex.
#[derive(Default)]
pub(crate) struct Completion {
    complete: Mutex<bool>,
    cond: Condvar,
}

impl Completion {
    fn reset(&self) {
        *self.complete.lock().unwrap() = false;
    }

    pub(crate) fn signal(&self) {
        let mut complete = self.complete.lock().unwrap();
        *complete = true;
        self.cond.notify_all();
    }

    fn wait_until_complete(&self) {
        let mut complete = self.complete.lock().unwrap();
        while !*complete {
            complete = self.cond.wait(complete).unwrap();
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        *self.complete.lock().unwrap()
    }
}

pub(crate) struct DmaState {
    pub cycle: DmaCycle,
    pub buffer: Vec<u16>,
    pub start_addr: u32,
    pub end_addr: u32,
    pub word_count: u32,
    pub chunk_max: u32,
    pub chunk_start: u32,
    pub chunk_words: u32,
    pub success: bool,
    pub executing: bool,
}

impl Default for DmaState {
    fn default() -> Self {
        DmaState {
            cycle: DmaCycle::Read,
            buffer: Vec::new(),
            start_addr: 0,
            end_addr: 0,
            word_count: 0,
            chunk_max: 0,
            chunk_start: 0,
            chunk_words: 0,
            success: false,
            executing: false,
        }
    }
}

/// A DMA request: direction, address range, buffer, word count, chunk
/// bookkeeping, success flag. `is_cpu_access` requests are serialized with
/// ordinary DMA but pinned to the lowest-priority slot and polled rather
/// than signalled.
pub struct DmaRequest {
    pub device: Option<DeviceHandle>,
    pub slot: u8,
    pub is_cpu_access: bool,
    pub(crate) state: Mutex<DmaState>,
    pub(crate) completion: Completion,
}

impl DmaRequest {
    pub fn new(device: Option<DeviceHandle>, slot: u8, is_cpu_access: bool) -> Arc<DmaRequest> {
        Arc::new(DmaRequest {
            device,
            slot,
            is_cpu_access,
            state: Mutex::new(DmaState::default()),
            completion: Completion::default(),
        })
    }

    pub fn success(&self) -> bool {
        self.state.lock().unwrap().success
    }

    pub fn end_address(&self) -> u32 {
        self.state.lock().unwrap().end_addr
    }

    pub fn is_complete(&self) -> bool {
        self.completion.is_complete()
    }

    pub fn wait(&self) {
        self.completion.wait_until_complete();
    }

    /// Copy the buffer accumulated so far out to `out`. Used for reads,
    /// both blocking (called right after `wait`) and non-blocking (called
    /// by the device once it has observed `is_complete()`).
    pub fn read_result(&self, out: &mut [u16]) {
        let state = self.state.lock().unwrap();
        let n = out.len().min(state.buffer.len());
        out[..n].copy_from_slice(&state.buffer[..n]);
    }

    /// INIT was already asserted when `dma()` was called: complete
    /// immediately with `success=false`, no table insertion.
    pub(crate) fn completion_signal_failed(&self) {
        let mut state = self.state.lock().unwrap();
        state.success = false;
        state.executing = false;
        drop(state);
        self.completion.signal();
    }

    pub(crate) fn reset_for_start(
        &self,
        cycle: DmaCycle,
        start_addr: u32,
        word_count: u32,
        write_data: Option<&[u16]>,
        chunk_cap: u32,
    ) {
        self.completion.reset();
        let mut state = self.state.lock().unwrap();
        state.cycle = cycle;
        state.start_addr = start_addr;
        state.end_addr = start_addr;
        state.word_count = word_count;
        state.success = false;
        state.executing = false;
        state.chunk_start = start_addr;
        state.chunk_max = chunk_cap.min(word_count.max(1));
        state.chunk_words = 0;
        state.buffer = match write_data {
            Some(data) => data.to_vec(),
            None => vec![0u16; word_count as usize],
        };
    }
}

pub(crate) struct IntrState {
    pub vector: u16,
    pub side_effect_register: Option<RegisterHandle>,
    pub side_effect_value: u16,
    pub executing: bool,
}

impl Default for IntrState {
    fn default() -> Self {
        IntrState {
            vector: 0,
            side_effect_register: None,
            side_effect_value: 0,
            executing: false,
        }
    }
}

/// An INTR request: level, vector, optional side-effect register+value,
/// and an edge detector the device may use to decide when to (re-)raise.
pub struct IntrRequest {
    pub device: Option<DeviceHandle>,
    pub slot: u8,
    pub level: Level,
    pub(crate) state: Mutex<IntrState>,
    pub(crate) completion: Completion,
    edge: Mutex<EdgeDetector>,
}

impl IntrRequest {
    pub fn new(device: Option<DeviceHandle>, slot: u8, level: Level) -> Arc<IntrRequest> {
        Arc::new(IntrRequest {
            device,
            slot,
            level,
            state: Mutex::new(IntrState::default()),
            completion: Completion::default(),
            edge: Mutex::new(EdgeDetector::default()),
        })
    }

    pub fn is_complete(&self) -> bool {
        self.completion.is_complete()
    }

    pub fn wait(&self) {
        self.completion.wait_until_complete();
    }

    pub fn update_edge(&self, new_level: bool) -> qbus_proto::Edge {
        self.edge.lock().unwrap().update(new_level)
    }

    pub fn vector(&self) -> u16 {
        self.state.lock().unwrap().vector
    }
}

/// Per-level table: a 32-slot array of pending requests, a bitmask, and
/// the request currently owned by the wire engine, if any. Invariant:
/// `mask == 0` iff `active.is_none()` and every slot is empty.
pub(crate) struct LevelTable<R> {
    slots: [Option<Arc<R>>; PRIORITY_SLOT_COUNT],
    mask: u32,
    pub(crate) active: Option<Arc<R>>,
}

impl<R> LevelTable<R> {
    pub(crate) fn new() -> LevelTable<R> {
        LevelTable {
            slots: std::array::from_fn(|_| None),
            mask: 0,
            active: None,
        }
    }

    pub(crate) fn get(&self, slot: u8) -> Option<&Arc<R>> {
        self.slots[slot as usize].as_ref()
    }

    pub(crate) fn insert(&mut self, slot: u8, request: Arc<R>) {
        self.slots[slot as usize] = Some(request);
        self.mask |= 1 << slot;
    }

    pub(crate) fn remove(&mut self, slot: u8) -> Option<Arc<R>> {
        let removed = self.slots[slot as usize].take();
        if removed.is_some() {
            self.mask &= !(1 << slot);
        }
        removed
    }

    pub(crate) fn lowest_pending_slot(&self) -> Option<u8> {
        if self.mask == 0 {
            None
        } else {
            Some(self.mask.trailing_zeros() as u8)
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.mask == 0 && self.active.is_none()
    }

    /// Drain everything (used on INIT): clears every slot and the active
    /// pointer, returning every request that was present so the caller can
    /// cancel each exactly once. `active`, when set, always names an
    /// entry still physically present in `slots` (it is never removed
    /// from the table until completion), so it is never collected twice.
    pub(crate) fn drain_all(&mut self) -> Vec<Arc<R>> {
        let drained: Vec<Arc<R>> = self.slots.iter_mut().filter_map(|s| s.take()).collect();
        self.mask = 0;
        self.active = None;
        drained
    }
}
