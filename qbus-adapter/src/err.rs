// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types for the adapter core.
//!
//! Configuration errors are ordinary `Result`s: `register_device` and
//! `install_rom` can fail synchronously and the caller decides what to do.
//! Protocol violations are programming errors a device must never trigger
//! in practice; like the original `FATAL(...)` macro they end the process,
//! but routed through a named, logged path instead of an opaque abort.

use thiserror::Error;

/// Errors surfaced synchronously from device/ROM registration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("address {address:#o} already claimed by another device")]
    AddressConflict { address: u32 },

    #[error("out of register handles: {requested} requested, {available} available")]
    OutOfRegisterHandles { requested: usize, available: usize },

    #[error("register {index} is active-on-read but passive-on-write with writable bits set")]
    InvalidRegisterActivity { index: usize },

    #[error("a CPU device is already registered")]
    DuplicateCpu,

    #[error("address {address:#o} already holds a ROM cell")]
    RomAlreadyInstalled { address: u32 },

    #[error("address {address:#o} is not even and inside the I/O page")]
    InvalidRegisterAddress { address: u32 },
}

/// Programming errors that would silently corrupt arbitration if allowed
/// to continue. These are reported and then the process ends via
/// [`protocol_violation`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("slot {slot} on NPR already has a pending DMA request")]
    DmaSlotBusy { slot: u8 },

    #[error("slot {slot} on level {level:?} has a conflicting pending INTR")]
    IntrSlotConflict { slot: u8, level: qbus_proto::Level },

    #[error("invalid priority slot {slot} (must be 1..31)")]
    InvalidSlot { slot: u8 },

    #[error("invalid interrupt level {level} (must be 4..7)")]
    InvalidLevel { level: u8 },

    #[error("interrupt vector {vector:#o} is not a multiple of 4")]
    MisalignedVector { vector: u16 },
}

/// Log a [`ProtocolViolation`] at error level and end the process.
///
/// Mirrors `qunibusadapter.cpp`'s `FATAL(...)` calls: these conditions are
/// device bugs that would corrupt arbitration state if execution
/// continued, so they are not recoverable `Result`s.
#[macro_export]
macro_rules! protocol_violation {
    ($violation:expr) => {{
        let violation: $crate::err::ProtocolViolation = $violation;
        tracing::error!(error = %violation, "protocol violation");
        panic!("protocol violation: {violation}");
    }};
}
