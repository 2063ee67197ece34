// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device-author-facing helpers built on top of `qbus-adapter`: a bounded
//! debug sink and a fake wire engine for driving the bus in tests without
//! real hardware underneath. The core itself does not depend on this
//! crate — the dependency edge points one way.

pub mod debug;
pub mod testing;

pub use debug::RingDebugSink;
pub use testing::FakeWireEngine;
