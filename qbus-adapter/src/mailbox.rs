// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mailbox driver (C1): the fixed-layout shared-memory region between the
//! adapter core and the wire engine, plus the two condition variables that
//! stand in for the two physical notification lines a real deployment
//! would use (one host-to-wire-engine "new command" line, one
//! wire-engine-to-host "new events" line).

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use qbus_proto::Mailbox;

/// Shared mailbox state plus its two notification condition variables.
/// Neither side ever writes the other's direction of the event/ack
/// protocol; see [`qbus_proto::EventFlags`].
pub struct MailboxHandle {
    mailbox: Mutex<Mailbox>,
    host_signal: Condvar,
    wire_signal: Condvar,
}

impl MailboxHandle {
    pub fn new() -> MailboxHandle {
        MailboxHandle {
            mailbox: Mutex::new(Mailbox::default()),
            host_signal: Condvar::new(),
            wire_signal: Condvar::new(),
        }
    }

    /// Run `f` with exclusive access to the mailbox. Used by the scheduler
    /// to post commands and by the event loop/fake wire engine to drain or
    /// produce events.
    pub fn with<T>(&self, f: impl FnOnce(&mut Mailbox) -> T) -> T {
        let mut guard = self.mailbox.lock().unwrap();
        f(&mut guard)
    }

    /// Host side: a command was just posted; wake anything waiting to
    /// service it (the real wire engine, or a `FakeWireEngine` in tests).
    pub fn notify_host_command(&self) {
        self.host_signal.notify_all();
    }

    /// Wire-engine side: new events were just raised; wake the event loop.
    pub fn notify_wire_events(&self) {
        self.wire_signal.notify_all();
    }

    /// Wire-engine side: block until a host command is posted or
    /// `timeout` elapses, returning the locked mailbox either way.
    pub fn wait_for_host_command(&self, timeout: Duration) -> MutexGuard<'_, Mailbox> {
        let guard = self.mailbox.lock().unwrap();
        let (guard, _) = self
            .host_signal
            .wait_timeout_while(guard, timeout, |mb| mb.command.is_none())
            .unwrap();
        guard
    }

    /// Event-loop side: block until the wire engine raises some pending
    /// event or `timeout` elapses (bounded so shutdown stays prompt).
    pub fn wait_for_events(&self, timeout: Duration) -> MutexGuard<'_, Mailbox> {
        let guard = self.mailbox.lock().unwrap();
        let (guard, _) = self
            .wire_signal
            .wait_timeout_while(guard, timeout, |mb| mb.events.pending().is_empty())
            .unwrap();
        guard
    }
}

impl Default for MailboxHandle {
    fn default() -> Self {
        Self::new()
    }
}
