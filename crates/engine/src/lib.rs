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

//! BPDB engine: live debugging of node-graph script execution.
//!
//! The engine sits between a host VM and a debugging front-end. The VM reports
//! node entry and exit through [`ExecutionObserver`]; the engine keeps a call
//! stack per execution context, checks breakpoints, blocks the VM thread while
//! paused, and answers watch reads through the host's reflection layer.
//!
//! Front-ends drive everything through [`DebugSession`].

pub mod breakpoint;
pub use breakpoint::*;

pub mod error;
pub use error::*;

pub mod global;

pub mod host;
pub use host::*;

pub mod index;
pub use index::*;

pub mod inspect;
pub use inspect::*;

pub mod pause;
pub use pause::*;

pub mod publisher;
pub use publisher::*;

pub mod recorder;
pub use recorder::*;

pub mod session;
pub use session::*;

pub mod watch;
pub use watch::*;
