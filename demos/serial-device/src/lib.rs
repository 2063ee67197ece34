// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A console serial line unit, modelled on the DL11-W: receiver
//! control/status + buffer, transmitter control/status + buffer, each
//! half raising its own BR4 interrupt on adjacent slots. Exercises the
//! active-register read/write-shadow split and INTR re-raise/cancel
//! against real register semantics instead of synthetic test fixtures.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use qbus_adapter::{CycleKind, Device, DeviceBase, IntrRequest, Level, RegisterSpec, Scheduler};

const RCSR: u16 = 0;
const RBUF: u16 = 1;
const XCSR: u16 = 2;
const XBUF: u16 = 3;

const RCVR_DONE: u16 = 0o200;
const RCVR_INT_ENB: u16 = 0o100;

const XMIT_RDY: u16 = 0o200;
const XMIT_INT_ENB: u16 = 0o100;

const REGISTER_SPECS: [RegisterSpec; 4] = [
    RegisterSpec {
        name: "RCSR",
        reset_value: 0,
        writable_mask: RCVR_INT_ENB,
        active_on_read: false,
        active_on_write: true,
    },
    RegisterSpec {
        name: "RBUF",
        reset_value: 0,
        writable_mask: 0,
        active_on_read: true,
        active_on_write: false,
    },
    RegisterSpec {
        name: "XCSR",
        reset_value: XMIT_RDY,
        writable_mask: XMIT_INT_ENB,
        active_on_read: false,
        active_on_write: true,
    },
    RegisterSpec {
        name: "XBUF",
        reset_value: 0,
        writable_mask: 0o377,
        active_on_read: false,
        active_on_write: true,
    },
];

/// A DL11-W-style console line. `rcv_slot`/`xmt_slot` (adjacent) and
/// `vector` (receiver; transmitter is `vector + 4`) follow the device's
/// own arbitration assignment, matching the original's one-level,
/// two-adjacent-slots layout.
pub struct SerialDevice {
    base: DeviceBase,
    base_address: u32,
    rcv_slot: u8,
    xmt_slot: u8,
    vector: u16,
    rcv_request: Arc<IntrRequest>,
    xmt_request: Arc<IntrRequest>,
    scheduler: Arc<Scheduler>,
    transmitted: Mutex<Vec<u8>>,
    rcv_pending: AtomicBool,
}

impl SerialDevice {
    pub fn new(base: DeviceBase, base_address: u32, rcv_slot: u8, vector: u16, scheduler: Arc<Scheduler>) -> SerialDevice {
        let xmt_slot = rcv_slot + 1;
        SerialDevice {
            base,
            base_address,
            rcv_slot,
            xmt_slot,
            vector,
            rcv_request: IntrRequest::new(None, rcv_slot, Level::Br4),
            xmt_request: IntrRequest::new(None, xmt_slot, Level::Br4),
            scheduler,
            transmitted: Mutex::new(Vec::new()),
            rcv_pending: AtomicBool::new(false),
        }
    }

    /// Bytes handed to the host via XBUF so far, oldest first.
    pub fn transmitted(&self) -> Vec<u8> {
        self.transmitted.lock().unwrap().clone()
    }

    /// Simulate a byte arriving on the line: latch it into RBUF, set
    /// RCVR_DONE, and raise the receiver interrupt if enabled.
    pub fn receive_char(&self, ch: u8) {
        self.base.set_read_value(RBUF, ch as u16);
        let rcsr = self.base.write_shadow(RCSR);
        self.base.set_read_value(RCSR, rcsr | RCVR_DONE);
        self.rcv_pending.store(true, Ordering::SeqCst);
        if rcsr & RCVR_INT_ENB != 0 {
            self.raise_rcv_intr();
        }
    }

    fn raise_rcv_intr(&self) {
        self.scheduler.intr(&self.rcv_request, self.vector, None);
    }

    fn raise_xmt_intr(&self) {
        self.scheduler.intr(&self.xmt_request, self.vector + 4, None);
    }
}

impl Device for SerialDevice {
    fn name(&self) -> &str {
        "serial-device"
    }

    fn base(&self) -> &DeviceBase {
        &self.base
    }

    fn register_specs(&self) -> &[RegisterSpec] {
        &REGISTER_SPECS
    }

    fn base_address(&self) -> u32 {
        self.base_address
    }

    fn priority_slot(&self) -> u8 {
        self.rcv_slot
    }

    fn interrupt_level(&self) -> Option<Level> {
        Some(Level::Br4)
    }

    fn interrupt_vector(&self) -> Option<u16> {
        Some(self.vector)
    }

    fn on_register_access(&self, register_index: u16, cycle: CycleKind) {
        match register_index {
            RBUF if matches!(cycle, CycleKind::Read) => {
                // Reading the buffer clears receiver-done and retires the
                // interrupt if it is still outstanding.
                let rcsr = self.base.write_shadow(RCSR);
                self.base.set_read_value(RCSR, rcsr & !RCVR_DONE);
                if self.rcv_pending.swap(false, Ordering::SeqCst) {
                    self.scheduler.cancel_intr(&self.rcv_request);
                }
            }
            RCSR if cycle.is_write() => {
                let rcsr = self.base.get_written_value(RCSR);
                let rcsr_read = self.base.read_shadow(RCSR);
                self.base.set_read_value(RCSR, (rcsr_read & RCVR_DONE) | (rcsr & RCVR_INT_ENB));
                if rcsr & RCVR_INT_ENB != 0 && rcsr_read & RCVR_DONE != 0 {
                    self.raise_rcv_intr();
                }
            }
            XCSR if cycle.is_write() => {
                let xcsr = self.base.get_written_value(XCSR);
                let ready = self.base.read_shadow(XCSR) & XMIT_RDY != 0;
                self.base.set_read_value(XCSR, (if ready { XMIT_RDY } else { 0 }) | (xcsr & XMIT_INT_ENB));
                if xcsr & XMIT_INT_ENB != 0 && ready {
                    self.raise_xmt_intr();
                }
            }
            XBUF if cycle.is_write() => {
                let byte = (self.base.get_written_value(XBUF) & 0o377) as u8;
                self.transmitted.lock().unwrap().push(byte);
                // This demo's line is instantaneous: the transmitter is
                // ready again as soon as the write lands.
                let xcsr = self.base.read_shadow(XCSR) | XMIT_RDY;
                self.base.set_read_value(XCSR, xcsr);
                if xcsr & XMIT_INT_ENB != 0 {
                    self.raise_xmt_intr();
                }
            }
            _ => {}
        }
    }

    fn on_init_change(&self, asserted: bool) {
        if asserted {
            self.rcv_pending.store(false, Ordering::SeqCst);
            self.base.set_read_value(RCSR, 0);
            self.base.set_read_value(XCSR, XMIT_RDY);
        }
    }
}
