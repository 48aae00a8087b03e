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

//! Error types of the debugging engine.
//!
//! Nothing here ever crosses into the VM: hook entry points swallow and log
//! errors, and command errors are also reported as session notices.

use bpdb_common::types::{BreakpointKey, ExecutionContextId, GraphId, NodeId, ObjectHandle};
use thiserror::Error;

use crate::ConditionError;

/// Result alias used throughout the engine.
pub type Result<T, E = DebuggerError> = std::result::Result<T, E>;

/// Errors returned by [`crate::DebugSession`] commands.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DebuggerError {
    /// The host asset system could not resolve a graph.
    #[error("failed to resolve graph {graph}: {source}")]
    AssetResolution {
        /// Graph being resolved
        graph: GraphId,
        /// Underlying asset error
        #[source]
        source: AssetError,
    },

    /// A property or pin could not be read through reflection.
    #[error("failed to read {target}: {source}")]
    ReflectionRead {
        /// What was being read
        target: String,
        /// Underlying reflection error
        #[source]
        source: ReflectionError,
    },

    /// A breakpoint condition failed to evaluate.
    #[error("condition of breakpoint {key} failed: {source}")]
    ConditionEvaluation {
        /// Breakpoint whose condition failed
        key: BreakpointKey,
        /// Underlying evaluation error
        #[source]
        source: ConditionError,
    },

    /// The context finished or was aborted; the command had no effect.
    #[error("execution context {0} has finished or was aborted")]
    DetachedContext(ExecutionContextId),

    /// The context was never seen by this session.
    #[error("unknown execution context {0}")]
    UnknownContext(ExecutionContextId),

    /// The node does not exist in the graph.
    #[error("node {node} not found in graph {graph}")]
    UnknownNode {
        /// Graph searched
        graph: GraphId,
        /// Missing node
        node: NodeId,
    },

    /// No breakpoint exists at the location.
    #[error("no breakpoint at {0}")]
    UnknownBreakpoint(BreakpointKey),

    /// The context is running; the command needs it paused.
    #[error("execution context {0} is not paused")]
    NotPaused(ExecutionContextId),

    /// The breakpoint request is malformed.
    #[error("invalid breakpoint: {0}")]
    InvalidBreakpoint(String),

    /// The session has been shut down.
    #[error("debug session has been shut down")]
    SessionClosed,
}

/// Errors reported by an [`crate::AssetResolver`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AssetError {
    /// No asset with this id.
    #[error("graph asset {0} not found")]
    NotFound(GraphId),

    /// The asset exists but its structure is unusable.
    #[error("graph asset {graph} is invalid: {reason}")]
    Invalid {
        /// Offending graph
        graph: GraphId,
        /// What is wrong with it
        reason: String,
    },
}

/// Errors reported by a [`crate::Reflection`] implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReflectionError {
    /// The object handle does not name a live object.
    #[error("object {0} not found")]
    UnknownObject(ObjectHandle),

    /// The object has no such property.
    #[error("property `{0}` not found")]
    UnknownProperty(String),

    /// The property exists but cannot be read.
    #[error("property `{name}` of type {type_name} is inaccessible")]
    Inaccessible {
        /// Property name
        name: String,
        /// Host type name
        type_name: String,
    },

    /// The pin has not produced a value in this context.
    #[error("pin `{pin}` has no value")]
    NoPinValue {
        /// Pin name
        pin: String,
    },
}
