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

//! Static description of graph assets: nodes, pins and source metadata.
//!
//! A [`GraphDescriptor`] is immutable once built. When the host recompiles the
//! asset, the engine drops the descriptor and builds a new one with a larger
//! generation number.

use std::collections::HashMap;

use eyre::{bail, Result};
use serde::{Deserialize, Serialize};

use super::{GraphId, NodeId, NodeRef};

/// Closed set of node kinds, resolved once when the descriptor is built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeKind {
    /// Entry point triggered by the host (BeginPlay, Tick, ...).
    Event,
    /// Entry node of a function graph.
    FunctionEntry,
    /// Result/return node of a function graph.
    FunctionResult,
    /// Invocation of another graph (possibly the same one, recursively).
    CallFunction {
        /// Graph executed by this call.
        callee: GraphId,
    },
    /// Read of a member variable.
    VariableGet {
        /// Variable being read.
        variable: String,
    },
    /// Write of a member variable.
    VariableSet {
        /// Variable being written.
        variable: String,
    },
    /// Conditional branch.
    Branch,
    /// Ordered fan-out of execution.
    Sequence,
    /// Constant value producer.
    Literal,
    /// Any other node class known to the host.
    Generic {
        /// Host class name of the node.
        class_name: String,
    },
}

impl NodeKind {
    /// Graph invoked by this node, if it is a call.
    pub fn callee(&self) -> Option<GraphId> {
        match self {
            Self::CallFunction { callee } => Some(*callee),
            _ => None,
        }
    }

    /// Short label used in logs and traces.
    pub fn label(&self) -> &str {
        match self {
            Self::Event => "event",
            Self::FunctionEntry => "function-entry",
            Self::FunctionResult => "function-result",
            Self::CallFunction { .. } => "call",
            Self::VariableGet { .. } => "get",
            Self::VariableSet { .. } => "set",
            Self::Branch => "branch",
            Self::Sequence => "sequence",
            Self::Literal => "literal",
            Self::Generic { class_name } => class_name,
        }
    }
}

/// Direction of a pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinDirection {
    /// Consumes a value.
    Input,
    /// Produces a value.
    Output,
}

/// Value category carried by a pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinType {
    /// Execution flow, carries no value.
    Exec,
    /// Boolean.
    Bool,
    /// Integer.
    Int,
    /// Floating point.
    Float,
    /// String.
    String,
    /// Interned name.
    Name,
    /// Object reference.
    Object,
    /// Struct value.
    Struct,
    /// Array container.
    Array,
    /// Set container.
    Set,
    /// Map container.
    Map,
    /// Anything the host does not categorize.
    Other,
}

/// One input or output slot of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PinDescriptor {
    /// Pin name, unique per node and direction.
    pub name: String,
    /// Input or output.
    pub direction: PinDirection,
    /// Value category.
    pub pin_type: PinType,
    /// Default literal as the host stores it, if any.
    #[serde(default)]
    pub default_value: Option<String>,
}

impl PinDescriptor {
    /// Create an input pin.
    pub fn input(name: impl Into<String>, pin_type: PinType) -> Self {
        Self { name: name.into(), direction: PinDirection::Input, pin_type, default_value: None }
    }

    /// Create an output pin.
    pub fn output(name: impl Into<String>, pin_type: PinType) -> Self {
        Self { name: name.into(), direction: PinDirection::Output, pin_type, default_value: None }
    }

    /// Attach a default literal.
    pub fn with_default(mut self, value: impl Into<String>) -> Self {
        self.default_value = Some(value.into());
        self
    }
}

/// Where a node lives in the editor, for UI highlighting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceLocation {
    /// Asset path of the owning graph.
    pub graph_path: String,
    /// Node title as displayed in the editor.
    pub node_title: String,
    /// Editor canvas position.
    pub position: (i32, i32),
}

/// Static description of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Stable node id.
    pub id: NodeId,
    /// Node kind.
    pub kind: NodeKind,
    /// Input pins, in editor order.
    pub inputs: Vec<PinDescriptor>,
    /// Output pins, in editor order.
    pub outputs: Vec<PinDescriptor>,
    /// Source metadata.
    pub source: SourceLocation,
}

impl NodeDescriptor {
    /// Create a node without pins.
    pub fn new(id: NodeId, kind: NodeKind) -> Self {
        Self { id, kind, inputs: Vec::new(), outputs: Vec::new(), source: SourceLocation::default() }
    }

    /// Add a pin, routed by its direction.
    pub fn with_pin(mut self, pin: PinDescriptor) -> Self {
        match pin.direction {
            PinDirection::Input => self.inputs.push(pin),
            PinDirection::Output => self.outputs.push(pin),
        }
        self
    }

    /// Set the editor title.
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.source.node_title = title.into();
        self
    }

    /// Find a pin by name, outputs first.
    pub fn pin(&self, name: &str) -> Option<&PinDescriptor> {
        self.outputs.iter().chain(self.inputs.iter()).find(|p| p.name == name)
    }

    /// Iterate over all pins (inputs then outputs).
    pub fn pins(&self) -> impl Iterator<Item = &PinDescriptor> {
        self.inputs.iter().chain(self.outputs.iter())
    }

    /// Human-readable title, falling back to the kind label.
    pub fn title(&self) -> &str {
        if self.source.node_title.is_empty() {
            self.kind.label()
        } else {
            &self.source.node_title
        }
    }
}

/// Immutable description of a graph asset at one generation.
#[derive(Debug, Clone, Serialize)]
pub struct GraphDescriptor {
    /// Graph identity.
    pub id: GraphId,
    /// Asset path.
    pub path: String,
    /// Build generation; strictly increases each time the asset is re-indexed.
    pub generation: u64,
    nodes: Vec<NodeDescriptor>,
    #[serde(skip)]
    positions: HashMap<NodeId, usize>,
}

impl GraphDescriptor {
    /// Build a descriptor, indexing nodes by id.
    ///
    /// Fails if two nodes share an id.
    pub fn new(
        id: GraphId,
        path: impl Into<String>,
        generation: u64,
        mut nodes: Vec<NodeDescriptor>,
    ) -> Result<Self> {
        let path = path.into();
        let mut positions = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter_mut().enumerate() {
            if positions.insert(node.id, i).is_some() {
                bail!("Duplicate node id {} in graph {id}", node.id);
            }
            if node.source.graph_path.is_empty() {
                node.source.graph_path = path.clone();
            }
        }
        Ok(Self { id, path, generation, nodes, positions })
    }

    /// Look up a node by id.
    pub fn node(&self, id: NodeId) -> Option<&NodeDescriptor> {
        self.positions.get(&id).map(|i| &self.nodes[*i])
    }

    /// Position of a node in graph order.
    pub fn position(&self, id: NodeId) -> Option<usize> {
        self.positions.get(&id).copied()
    }

    /// Whether the graph contains the node.
    pub fn contains(&self, id: NodeId) -> bool {
        self.positions.contains_key(&id)
    }

    /// Nodes in graph order.
    pub fn nodes(&self) -> &[NodeDescriptor] {
        &self.nodes
    }

    /// Reference to one of this graph's nodes.
    pub fn node_ref(&self, id: NodeId) -> NodeRef {
        NodeRef::new(self.id, id)
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: u128) -> NodeDescriptor {
        NodeDescriptor::new(NodeId(id), NodeKind::Generic { class_name: "K2Node_Test".into() })
    }

    #[test]
    fn test_descriptor_indexes_nodes() {
        let graph =
            GraphDescriptor::new(GraphId(1), "/Game/BP_Door", 0, vec![node(1), node(2)]).unwrap();
        assert_eq!(graph.len(), 2);
        assert_eq!(graph.position(NodeId(2)), Some(1));
        assert!(graph.contains(NodeId(1)));
        assert!(graph.node(NodeId(3)).is_none());
        assert_eq!(graph.node(NodeId(1)).unwrap().source.graph_path, "/Game/BP_Door");
    }

    #[test]
    fn test_descriptor_rejects_duplicate_ids() {
        assert!(GraphDescriptor::new(GraphId(1), "/Game/BP", 0, vec![node(1), node(1)]).is_err());
    }

    #[test]
    fn test_pin_lookup_prefers_outputs() {
        let n = node(1)
            .with_pin(PinDescriptor::input("Value", PinType::Int))
            .with_pin(PinDescriptor::output("Value", PinType::Float));
        assert_eq!(n.pin("Value").unwrap().direction, PinDirection::Output);
        assert_eq!(n.pins().count(), 2);
    }

    #[test]
    fn test_title_falls_back_to_kind() {
        let n = NodeDescriptor::new(NodeId(1), NodeKind::Branch);
        assert_eq!(n.title(), "branch");
        assert_eq!(n.with_title("Is Open?").title(), "Is Open?");
    }

    #[test]
    fn test_callee() {
        assert_eq!(NodeKind::CallFunction { callee: GraphId(5) }.callee(), Some(GraphId(5)));
        assert_eq!(NodeKind::Literal.callee(), None);
    }
}
