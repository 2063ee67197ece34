// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A bounded, most-recent-first record of register publish events, for
//! post-mortem inspection — the host-side analogue of the teacher's
//! `ringbuf` crate, which instruments embedded tasks the same way but
//! relies on a static, compile-time-sized buffer; here a plain
//! `Mutex<VecDeque<_>>` plays the same role for a hosted binary.

use std::collections::VecDeque;
use std::sync::Mutex;

use qbus_adapter::{DebugEvent, DebugSink};

pub struct RingDebugSink {
    capacity: usize,
    entries: Mutex<VecDeque<DebugEvent>>,
}

impl RingDebugSink {
    pub fn new(capacity: usize) -> RingDebugSink {
        RingDebugSink {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Snapshot of the buffer, oldest first.
    pub fn snapshot(&self) -> Vec<DebugEvent> {
        self.entries.lock().unwrap().iter().copied().collect()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}

impl DebugSink for RingDebugSink {
    fn record(&self, event: DebugEvent) {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(event);
        tracing::trace!(
            device = event.device.0,
            register_index = event.register_index,
            value = event.value,
            "register published"
        );
    }
}
