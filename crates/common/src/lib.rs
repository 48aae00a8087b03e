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

//! BPDB Common - Shared functionality for BPDB components
//!
//! This crate provides the host-independent vocabulary shared by the debugger
//! engine and its front-ends: graph and breakpoint descriptions, reflected
//! values, session events, configuration, and logging setup.

/// Common types used throughout the BPDB ecosystem including graph descriptors, breakpoints, values and session events
pub mod types;

/// Debugger configuration loaded from TOML
pub mod config;
/// Logging setup and utilities for consistent logging across BPDB components
pub mod logging;

pub use config::*;
