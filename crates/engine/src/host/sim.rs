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

//! A small graph interpreter driving the observer hooks like a real VM would.
//!
//! Nodes of a graph execute in order. Before a node is entered its input pins
//! receive their default literals; after the entry hook returns the node's
//! effect is applied:
//!
//! - `Literal` copies each output's default to the output pin
//! - `VariableGet` copies the variable to its first output pin
//! - `VariableSet` writes its first value input to the variable and mirrors it on the outputs
//! - `CallFunction` runs the callee graph one level deeper in the same context
//!
//! Everything else has no effect.

use std::{
    sync::Arc,
    thread::{self, JoinHandle},
};

use bpdb_common::types::{
    ContextEnd, ExecutionContextId, GraphId, NodeDescriptor, NodeKind, NodeRef, ObjectHandle,
    PinType, Value,
};
use tracing::{debug, warn};

use super::{ExecutionObserver, HookOutcome, MemoryHost};
use crate::AssetError;

/// Default bound on nested calls.
pub const DEFAULT_MAX_CALL_DEPTH: usize = 32;

/// What happened to one simulated invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    /// Context the invocation ran as
    pub context: ExecutionContextId,
    /// How it ended
    pub end: ContextEnd,
    /// Node executions, including nested calls
    pub executed: u64,
}

enum Flow {
    Continue,
    Abort,
}

/// Simulated VM running graphs of a [`MemoryHost`].
#[derive(Debug, Clone)]
pub struct SimVm {
    host: Arc<MemoryHost>,
    max_call_depth: usize,
}

struct Run<'a> {
    host: &'a MemoryHost,
    observer: Option<Arc<dyn ExecutionObserver>>,
    context: ExecutionContextId,
    object: ObjectHandle,
    max_call_depth: usize,
    executed: u64,
}

impl SimVm {
    /// Create a VM over a host.
    pub fn new(host: Arc<MemoryHost>) -> Self {
        Self { host, max_call_depth: DEFAULT_MAX_CALL_DEPTH }
    }

    /// Set the bound on nested calls.
    pub fn with_max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth;
        self
    }

    /// Host this VM runs on.
    pub fn host(&self) -> &Arc<MemoryHost> {
        &self.host
    }

    /// Run a graph on an object on the calling thread, allocating a fresh context.
    pub fn run(&self, graph: GraphId, object: ObjectHandle) -> Result<RunReport, AssetError> {
        self.run_as(self.host.next_context_id(), graph, object)
    }

    /// Run a graph as a given context on the calling thread.
    pub fn run_as(
        &self,
        context: ExecutionContextId,
        graph: GraphId,
        object: ObjectHandle,
    ) -> Result<RunReport, AssetError> {
        let asset = self.host.graph(graph).ok_or(AssetError::NotFound(graph))?;
        let observer = self.host.observer();
        if let Some(observer) = &observer {
            observer.begin_context(context, graph, object);
        }

        let mut run = Run {
            host: &self.host,
            observer: observer.clone(),
            context,
            object,
            max_call_depth: self.max_call_depth,
            executed: 0,
        };
        let end = match run.execute(graph, &asset.nodes, 0) {
            Flow::Continue => ContextEnd::Completed,
            Flow::Abort => ContextEnd::Aborted,
        };
        debug!(ctx = %context, graph = %graph, ?end, executed = run.executed, "Simulated run finished");

        if let Some(observer) = &observer {
            observer.end_context(context, end);
        }
        Ok(RunReport { context, end, executed: run.executed })
    }

    /// Run a graph on a new named worker thread.
    pub fn spawn(
        &self,
        graph: GraphId,
        object: ObjectHandle,
    ) -> std::io::Result<(ExecutionContextId, JoinHandle<Result<RunReport, AssetError>>)> {
        let context = self.host.next_context_id();
        let vm = self.clone();
        let handle = thread::Builder::new()
            .name(format!("vm-worker-{}", context.0))
            .spawn(move || vm.run_as(context, graph, object))?;
        Ok((context, handle))
    }
}

impl Run<'_> {
    fn execute(&mut self, graph: GraphId, nodes: &[NodeDescriptor], depth: usize) -> Flow {
        for node in nodes {
            let node_ref = NodeRef::new(graph, node.id);
            self.load_inputs(node_ref, node);

            if let Some(observer) = &self.observer {
                if observer.on_node_enter(self.context, node_ref) == HookOutcome::Abort {
                    return Flow::Abort;
                }
            }
            self.executed += 1;

            if let Flow::Abort = self.apply(node_ref, node, depth) {
                return Flow::Abort;
            }

            if let Some(observer) = &self.observer {
                if observer.on_node_exit(self.context, node_ref) == HookOutcome::Abort {
                    return Flow::Abort;
                }
            }
        }
        Flow::Continue
    }

    fn load_inputs(&self, node_ref: NodeRef, node: &NodeDescriptor) {
        for pin in node.inputs.iter().filter(|p| p.pin_type != PinType::Exec) {
            if let Some(default) = &pin.default_value {
                let value = Value::from_literal(pin.pin_type, default);
                self.host.set_pin(self.context, node_ref, &pin.name, value);
            }
        }
    }

    fn apply(&mut self, node_ref: NodeRef, node: &NodeDescriptor, depth: usize) -> Flow {
        let values = node.outputs.iter().filter(|p| p.pin_type != PinType::Exec);
        match &node.kind {
            NodeKind::Literal => {
                for pin in values {
                    let value = pin
                        .default_value
                        .as_deref()
                        .map(|d| Value::from_literal(pin.pin_type, d))
                        .unwrap_or_default();
                    self.host.set_pin(self.context, node_ref, &pin.name, value);
                }
            }
            NodeKind::VariableGet { variable } => {
                let value = self.host.variable(self.object, variable).unwrap_or_default();
                if let Some(pin) = node.outputs.iter().find(|p| p.pin_type != PinType::Exec) {
                    self.host.set_pin(self.context, node_ref, &pin.name, value);
                }
            }
            NodeKind::VariableSet { variable } => {
                let input = node.inputs.iter().find(|p| p.pin_type != PinType::Exec);
                let value = input
                    .and_then(|p| p.default_value.as_deref().map(|d| Value::from_literal(p.pin_type, d)))
                    .unwrap_or_default();
                self.host.set_variable(self.object, variable, value.clone());
                for pin in values {
                    self.host.set_pin(self.context, node_ref, &pin.name, value.clone());
                }
            }
            NodeKind::CallFunction { callee } => {
                if depth + 1 >= self.max_call_depth {
                    warn!(
                        ctx = %self.context,
                        callee = %callee,
                        depth,
                        "Call depth limit reached, skipping call"
                    );
                    return Flow::Continue;
                }
                let Some(asset) = self.host.graph(*callee) else {
                    warn!(ctx = %self.context, callee = %callee, "Callee graph not found, skipping call");
                    return Flow::Continue;
                };
                return self.execute(*callee, &asset.nodes, depth + 1);
            }
            _ => {}
        }
        Flow::Continue
    }
}
