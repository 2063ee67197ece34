// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire-level types shared between the adapter core and the wire engine.
//!
//! Everything here describes the *mailbox* contract (`Mailbox`): the
//! fixed-layout shared-memory region through which the host-side adapter
//! core and the auxiliary real-time wire engine exchange DMA/INTR/slave-
//! access events. Nothing in this crate depends on how either side is
//! implemented; a firmware build of the wire engine would plausibly link
//! against exactly this crate.

#![no_std]

use bitflags::bitflags;
use zerocopy::{AsBytes, FromBytes, Unaligned};

/// Number of parallel priority arbitration levels (BR4, BR5, BR6, BR7, NPR).
pub const PRIORITY_LEVEL_COUNT: usize = 5;

/// Backplane slots per level. Slot 0 is reserved; usable slots are 1..31.
pub const PRIORITY_SLOT_COUNT: usize = 32;

/// Minimum (and, here, exact) number of words carried per DMA chunk.
pub const WIRE_CHUNK_CAP: usize = 512;

/// Largest usable register handle; 0 means unoccupied, `ROM_SENTINEL`
/// (0xFF) is reserved, so usable device-register handles are 1..=254.
pub const MAX_REGISTER_HANDLES: usize = 254;

/// Register handle value meaning "no device register here".
pub const NO_REGISTER: u8 = 0;

/// Register handle sentinel meaning "this cell is a ROM word".
pub const ROM_SENTINEL: u8 = 0xFF;

/// The slot the adapter core pins CPU-issued data transfers to.
pub const CPU_DATA_TRANSFER_SLOT: u8 = 31;

/// A register handle: `0` = none, `0xFF` = ROM, else an index into the
/// shared register descriptor table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, FromBytes, AsBytes, Unaligned)]
#[repr(transparent)]
pub struct RegisterHandle(pub u8);

impl RegisterHandle {
    pub const NONE: RegisterHandle = RegisterHandle(NO_REGISTER);
    pub const ROM: RegisterHandle = RegisterHandle(ROM_SENTINEL);

    pub fn is_none(self) -> bool {
        self.0 == NO_REGISTER
    }

    pub fn is_rom(self) -> bool {
        self.0 == ROM_SENTINEL
    }

    /// Index into the device-register descriptor table, if this handle
    /// names a real device register (neither none nor the ROM sentinel).
    pub fn device_index(self) -> Option<usize> {
        if self.is_none() || self.is_rom() {
            None
        } else {
            Some((self.0 - 1) as usize)
        }
    }
}

/// A device handle assigned by the registry. `0` means not installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, FromBytes, AsBytes, Unaligned)]
#[repr(transparent)]
pub struct DeviceHandle(pub u8);

impl DeviceHandle {
    pub const NONE: DeviceHandle = DeviceHandle(0);

    pub fn is_installed(self) -> bool {
        self.0 != 0
    }
}

/// One of the five parallel priority arbitration levels.
///
/// Cross-level start order is `Npr > Br7 > Br6 > Br5 > Br4`; this is only
/// the order in which the scheduler picks what to *start* next, never a
/// preemption of an in-flight wire-engine operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Level {
    Br4 = 0,
    Br5 = 1,
    Br6 = 2,
    Br7 = 3,
    Npr = 4,
}

impl Level {
    pub const INTR_LEVELS: [Level; 4] = [Level::Br4, Level::Br5, Level::Br6, Level::Br7];
    pub const ALL: [Level; PRIORITY_LEVEL_COUNT] =
        [Level::Br4, Level::Br5, Level::Br6, Level::Br7, Level::Npr];

    pub fn index(self) -> usize {
        self as u8 as usize
    }

    pub fn from_index(index: usize) -> Option<Level> {
        Self::ALL.get(index).copied()
    }

    /// Cross-level start priority: higher value starts first.
    pub fn start_priority(self) -> u8 {
        match self {
            Level::Npr => 4,
            Level::Br7 => 3,
            Level::Br6 => 2,
            Level::Br5 => 1,
            Level::Br4 => 0,
        }
    }

    pub fn is_intr(self) -> bool {
        !matches!(self, Level::Npr)
    }
}

/// Cycle kind as seen on a slave (device-register) bus access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CycleKind {
    Read = 0,
    WriteWord = 1,
    WriteByteLow = 2,
    WriteByteHigh = 3,
}

impl CycleKind {
    pub fn is_write(self) -> bool {
        !matches!(self, CycleKind::Read)
    }
}

/// Cycle kind as seen on a DMA request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DmaCycle {
    Read = 0,
    Write = 1,
    ByteWrite = 2,
}

/// Status of the DMA descriptor currently on the wire, as reported by the
/// wire engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DmaStatus {
    Ready = 0,
    InProgress = 1,
    BusTimeout = 2,
}

bitflags! {
    /// One bit per mailbox event channel. "Pending" for a channel is
    /// `raised XOR ack`ed — see [`EventFlags`].
    #[derive(Default)]
    pub struct EventChannels: u16 {
        const INIT          = 1 << 0;
        const POWER         = 1 << 1;
        const SLAVE_ACCESS  = 1 << 2;
        const DMA_COMPLETE  = 1 << 3;
        const INTR_BR4      = 1 << 4;
        const INTR_BR5      = 1 << 5;
        const INTR_BR6      = 1 << 6;
        const INTR_BR7      = 1 << 7;
        const CPU_INTERRUPT = 1 << 8;
    }
}

impl EventChannels {
    pub fn for_level(level: Level) -> EventChannels {
        match level {
            Level::Br4 => EventChannels::INTR_BR4,
            Level::Br5 => EventChannels::INTR_BR5,
            Level::Br6 => EventChannels::INTR_BR6,
            Level::Br7 => EventChannels::INTR_BR7,
            Level::Npr => EventChannels::DMA_COMPLETE,
        }
    }
}

/// Raise/ack discipline over the event channels. The wire engine only ever
/// sets bits in `raised`; the host only ever sets bits in `ack`. A channel
/// is pending while `raised XOR ack` is set for its bit.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventFlags {
    pub raised: EventChannels,
    pub ack: EventChannels,
}

impl EventFlags {
    pub fn pending(&self) -> EventChannels {
        EventChannels::from_bits_truncate(self.raised.bits() ^ self.ack.bits())
    }

    pub fn is_pending(&self, channel: EventChannels) -> bool {
        !(self.pending() & channel).is_empty()
    }

    /// Wire-engine side: raise a channel.
    pub fn raise(&mut self, channel: EventChannels) {
        self.raised.insert(channel);
    }

    /// Host side: acknowledge a channel (toggle its ack bit to match raised).
    pub fn ack(&mut self, channel: EventChannels) {
        if self.raised.contains(channel) {
            self.ack.insert(channel);
        } else {
            self.ack.remove(channel);
        }
    }
}

/// Electrical edge detected between two observations of a level/flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Raising,
    Falling,
    None,
}

/// Tracks the last-seen level of a boolean signal and reports edges.
#[derive(Debug, Clone, Copy, Default)]
pub struct EdgeDetector {
    last: bool,
}

impl EdgeDetector {
    pub fn new(initial: bool) -> Self {
        EdgeDetector { last: initial }
    }

    pub fn update(&mut self, new_level: bool) -> Edge {
        let edge = match (self.last, new_level) {
            (false, true) => Edge::Raising,
            (true, false) => Edge::Falling,
            _ => Edge::None,
        };
        self.last = new_level;
        edge
    }

    pub fn level(&self) -> bool {
        self.last
    }
}

/// `init_signal_current` from the mailbox: the new electrical INIT level.
/// On buses that present INIT as a pulse, the host synthesizes an
/// asserted-then-negated pair of edges from one such event.
#[derive(Debug, Clone, Copy, Default)]
pub struct InitEventRecord {
    pub signal_current: bool,
}

bitflags! {
    /// Power-sequencing signal bits, already normalized to the abstract
    /// ACLO/DCLO polarity regardless of which physical bus variant is in
    /// use (on the alternate bus, POK/DCOK arrive inverted and are
    /// normalized by the wire engine before this record is filled in).
    #[derive(Default)]
    pub struct PowerSignals: u8 {
        const ACLO = 1 << 0;
        const DCLO = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PowerEventRecord {
    pub previous: PowerSignals,
    pub current: PowerSignals,
}

impl PowerEventRecord {
    pub fn aclo_edge(&self) -> Edge {
        edge_of(
            self.previous.contains(PowerSignals::ACLO),
            self.current.contains(PowerSignals::ACLO),
        )
    }

    pub fn dclo_edge(&self) -> Edge {
        edge_of(
            self.previous.contains(PowerSignals::DCLO),
            self.current.contains(PowerSignals::DCLO),
        )
    }
}

fn edge_of(previous: bool, current: bool) -> Edge {
    match (previous, current) {
        (false, true) => Edge::Raising,
        (true, false) => Edge::Falling,
        _ => Edge::None,
    }
}

/// Raw, byte-exact slave access record as it would travel over the wire.
/// Kept zerocopy-friendly (fixed layout, no padding ambiguity) since this
/// is the one mailbox record a firmware wire engine writes byte-by-byte;
/// higher-level records above are convenience types built from it.
#[derive(Debug, Clone, Copy, Default, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct RawSlaveAccessRecord {
    pub device_handle: u8,
    pub register_index: u8,
    pub cycle_kind: u8,
    pub _pad: u8,
    /// Low 13 bits carry the address on the alternate (byte-addressed) bus,
    /// plus an I/O-page flag bit; already resolved into a plain address by
    /// the time [`SlaveAccessRecord::from_raw`] is used.
    pub address: u32,
    pub data: u16,
    pub _pad2: u16,
}

/// The I/O-page flag bit carried alongside the address on the alternate,
/// byte-addressed bus variant (see `Mailbox::decode_slave_access`).
pub const ALTERNATE_BUS_IOPAGE_FLAG: u32 = 1 << 13;

#[derive(Debug, Clone, Copy)]
pub struct SlaveAccessRecord {
    pub device_handle: DeviceHandle,
    pub register_index: u16,
    pub address: u32,
    pub data: u16,
    pub cycle_kind: CycleKind,
}

impl SlaveAccessRecord {
    /// Resolve a raw wire record into a plain, already-decoded record: the
    /// alternate-bus I/O-page flag bit is masked into the address once,
    /// here, and never inspected again downstream.
    pub fn from_raw(raw: &RawSlaveAccessRecord, iopage_base: u32) -> SlaveAccessRecord {
        // On the alternate, byte-addressed bus, the low 13 bits of `address`
        // carry an I/O-page-relative offset and bit 13 flags membership;
        // on every other bus `address` is already the plain absolute
        // address and is used unmodified.
        let address = if raw.address & ALTERNATE_BUS_IOPAGE_FLAG != 0 {
            iopage_base + (raw.address & (ALTERNATE_BUS_IOPAGE_FLAG - 1))
        } else {
            raw.address
        };
        SlaveAccessRecord {
            device_handle: DeviceHandle(raw.device_handle),
            register_index: raw.register_index as u16,
            address,
            data: raw.data,
            cycle_kind: match raw.cycle_kind {
                1 => CycleKind::WriteWord,
                2 => CycleKind::WriteByteLow,
                3 => CycleKind::WriteByteHigh,
                _ => CycleKind::Read,
            },
        }
    }
}

/// DMA descriptor: the host fills `start_address`/`cycle`/`word_count`/
/// `cpu_access` and the payload (for writes) before raising the DMA
/// command; the wire engine fills `status`/`current_address` and the
/// payload (for reads) before raising DMA-complete.
#[derive(Clone)]
pub struct DmaDescriptor {
    pub start_address: u32,
    pub cycle: DmaCycle,
    pub word_count: u32,
    pub cpu_access: bool,
    pub status: DmaStatus,
    pub current_address: u32,
    pub data: [u16; WIRE_CHUNK_CAP],
}

impl Default for DmaDescriptor {
    fn default() -> Self {
        DmaDescriptor {
            start_address: 0,
            cycle: DmaCycle::Read,
            word_count: 0,
            cpu_access: false,
            status: DmaStatus::Ready,
            current_address: 0,
            data: [0; WIRE_CHUNK_CAP],
        }
    }
}

impl core::fmt::Debug for DmaDescriptor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DmaDescriptor")
            .field("start_address", &self.start_address)
            .field("cycle", &self.cycle)
            .field("word_count", &self.word_count)
            .field("cpu_access", &self.cpu_access)
            .field("status", &self.status)
            .field("current_address", &self.current_address)
            .finish()
    }
}

bitflags! {
    /// Which of the four interrupt levels an INTR-cancel command applies to.
    #[derive(Default)]
    pub struct CancelLevels: u8 {
        const BR4 = 1 << 0;
        const BR5 = 1 << 1;
        const BR6 = 1 << 2;
        const BR7 = 1 << 3;
    }
}

impl CancelLevels {
    pub const ALL: CancelLevels = CancelLevels::BR4
        .union(CancelLevels::BR5)
        .union(CancelLevels::BR6)
        .union(CancelLevels::BR7);

    pub fn for_level(level: Level) -> CancelLevels {
        match level {
            Level::Br4 => CancelLevels::BR4,
            Level::Br5 => CancelLevels::BR5,
            Level::Br6 => CancelLevels::BR6,
            Level::Br7 => CancelLevels::BR7,
            Level::Npr => CancelLevels::empty(),
        }
    }
}

/// INTR descriptor: host fills `level_index`/`vector`/side-effect fields
/// before raising the INTR command (or `cancel_mask` before raising
/// INTR-cancel).
#[derive(Debug, Clone, Copy, Default)]
pub struct IntrDescriptor {
    pub level_index: u8,
    pub vector: u16,
    pub side_effect_register: RegisterHandle,
    pub side_effect_value: u16,
    pub cancel_mask: CancelLevels,
}

/// CPU arbitration state, relevant only when a CPU device is registered.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuArbitrationState {
    pub priority_level: u8,
    pub fetching_vector: bool,
    pub grant_gate: bool,
}

/// Command slots the host writes to instruct the wire engine. At most one
/// is outstanding at a time per the scheduler's "never hold a lock across
/// a round-trip" rule — the scheduler emits at most one of these per
/// table mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireCommand {
    Dma,
    Intr,
    IntrCancel,
    CpuEnable,
    GrantInterruptRequests,
}

/// The fixed-layout mailbox shared between the adapter core and the wire
/// engine. Field semantics are normative (§6.1); the exact byte layout is
/// whatever a given wire-engine build expects and is out of scope here —
/// both sides of a deployment must agree on it at build time. This type
/// models the semantic contract, not a specific ABI encoding.
#[derive(Debug, Clone, Default)]
pub struct Mailbox {
    pub events: EventFlags,
    pub init: InitEventRecord,
    pub power: PowerEventRecord,
    pub slave_access: Option<SlaveAccessRecord>,
    pub dma: DmaDescriptor,
    pub intr: IntrDescriptor,
    pub cpu: CpuArbitrationState,
    pub command: Option<WireCommand>,
}
