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

//! Interfaces between the engine and the host it debugs.
//!
//! The host provides three collaborators:
//!
//! - [`AssetResolver`] - graph asset structure, for the graph index
//! - [`Reflection`] - generic property and pin reads, for watches and the variable inspector
//! - [`VmHookRegistry`] - a way to attach an [`ExecutionObserver`] to the running VM
//!
//! [`MemoryHost`] implements all three in memory and [`SimVm`] executes graphs
//! against it; both back the tests and the scenario runner.

use std::sync::Arc;

use auto_impl::auto_impl;
use bpdb_common::types::{
    ContextEnd, ExecutionContextId, GraphId, NodeDescriptor, NodeRef, ObjectHandle, PropertyInfo,
    Value,
};
use serde::{Deserialize, Serialize};

use crate::{AssetError, ReflectionError};

mod memory;
pub use memory::*;

mod sim;
pub use sim::*;

/// Structure of a graph asset as the host's asset system reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphAsset {
    /// Asset path
    pub path: String,
    /// Nodes in execution order
    pub nodes: Vec<NodeDescriptor>,
}

/// Resolves graph asset ids to their structure.
#[auto_impl(&, Arc, Box)]
pub trait AssetResolver: Send + Sync {
    /// Look up the current structure of a graph asset.
    fn resolve_graph(&self, graph: GraphId) -> Result<GraphAsset, AssetError>;
}

/// Generic property and pin access on host objects.
#[auto_impl(&, Arc, Box)]
pub trait Reflection: Send + Sync {
    /// Read a member variable of an object.
    fn read_variable(&self, object: ObjectHandle, name: &str) -> Result<Value, ReflectionError>;

    /// Read the value a pin holds in one execution context.
    fn read_pin(
        &self,
        object: ObjectHandle,
        context: ExecutionContextId,
        node: NodeRef,
        pin: &str,
    ) -> Result<Value, ReflectionError>;

    /// List the reflected properties of an object, in declaration order.
    fn properties(&self, object: ObjectHandle) -> Result<Vec<PropertyInfo>, ReflectionError>;

    /// Whether the object lives in a running world (as opposed to an editor preview).
    fn is_in_running_world(&self, object: ObjectHandle) -> bool;
}

/// What a hook tells the VM to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookOutcome {
    /// Carry on executing.
    Continue,
    /// Abort the invocation; the context was detached while paused.
    Abort,
}

/// Receiver of VM execution events.
///
/// All methods are called on the VM's own execution thread and must never
/// unwind into it.
pub trait ExecutionObserver: Send + Sync {
    /// A graph invocation starts. The VM owns context ids and never reuses a live one.
    fn begin_context(&self, context: ExecutionContextId, graph: GraphId, object: ObjectHandle);

    /// A node is about to execute. May block while the context is paused.
    fn on_node_enter(&self, context: ExecutionContextId, node: NodeRef) -> HookOutcome;

    /// A node finished executing.
    fn on_node_exit(&self, context: ExecutionContextId, node: NodeRef) -> HookOutcome;

    /// The invocation completed or was aborted.
    fn end_context(&self, context: ExecutionContextId, end: ContextEnd);
}

/// Registration point for execution observers on a running VM.
#[auto_impl(&, Arc, Box)]
pub trait VmHookRegistry: Send + Sync {
    /// Install an observer, replacing any previous one.
    fn register_observer(&self, observer: Arc<dyn ExecutionObserver>);

    /// Remove the installed observer, if any.
    fn unregister_observer(&self);
}
