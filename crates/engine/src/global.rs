// BPDB - Blueprint Graph Debugger
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Process-scoped session.
//!
//! Hosts that cannot thread a session handle through their own code keep one
//! here. The slot is initialized on first use and emptied by [`teardown`],
//! which also shuts the session down, so no paused VM thread outlives it.

use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tracing::info;

use crate::DebugSession;

static SESSION: Lazy<RwLock<Option<Arc<DebugSession>>>> = Lazy::new(|| RwLock::new(None));

/// The current session, creating it with `init` if there is none (or the
/// previous one was shut down).
pub fn get_or_init(init: impl FnOnce() -> Arc<DebugSession>) -> Arc<DebugSession> {
    if let Some(session) = SESSION.read().as_ref().filter(|s| !s.is_closed()) {
        return session.clone();
    }

    let mut slot = SESSION.write();
    match slot.as_ref() {
        Some(session) if !session.is_closed() => session.clone(),
        _ => {
            let session = init();
            *slot = Some(session.clone());
            info!("Process debug session installed");
            session
        }
    }
}

/// The current session, if any.
pub fn current() -> Option<Arc<DebugSession>> {
    SESSION.read().as_ref().filter(|s| !s.is_closed()).cloned()
}

/// Shut down and drop the current session. Returns whether there was one.
pub fn teardown() -> bool {
    let session = SESSION.write().take();
    match session {
        Some(session) => {
            session.shutdown();
            info!("Process debug session torn down");
            true
        }
        None => false,
    }
}
