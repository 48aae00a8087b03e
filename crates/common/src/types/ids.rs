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

//! Identifier newtypes for graphs, nodes, objects and execution contexts.
//!
//! All identifiers are `Copy` so that the hot path of the execution hooks can
//! build lookup keys without allocating.

use std::{fmt, str::FromStr};

use derive_more::{Display, From};
use eyre::{eyre, Error, Result};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// Identity of an instantiable graph asset, as handed out by the host's asset system.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, From,
)]
#[display("{_0}")]
pub struct GraphId(pub u64);

/// Stable node identifier. Survives graph edits whenever the host keeps the node's GUID.
///
/// Serialized as its hex text so that JSON and TOML consumers do not need
/// 128-bit integer support.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, From)]
pub struct NodeId(pub u128);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({self})")
    }
}

impl FromStr for NodeId {
    type Err = Error;

    /// Accepts plain hex (`00ab...`), `0x`-prefixed hex, or hyphenated GUID text.
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let hex: String = trimmed
            .strip_prefix("0x")
            .unwrap_or(trimmed)
            .chars()
            .filter(|c| *c != '-')
            .collect();
        if hex.is_empty() || hex.len() > 32 {
            return Err(eyre!("Invalid node id: {s}"));
        }
        u128::from_str_radix(&hex, 16).map(Self).map_err(|e| eyre!("Invalid node id {s}: {e}"))
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(de::Error::custom)
    }
}

/// Handle of a live host object (the instance a graph runs on).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, From,
)]
#[display("obj#{_0}")]
pub struct ObjectHandle(pub u64);

/// Identifier of one live graph invocation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, From,
)]
#[display("ctx#{_0}")]
pub struct ExecutionContextId(pub u64);

/// A node addressed within a specific graph.
///
/// Execution hooks receive a `NodeRef` rather than a bare [`NodeId`] so that
/// subgraph and recursive invocations can be expressed: the frame's graph is
/// always the graph named here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeRef {
    /// Graph owning the node.
    pub graph: GraphId,
    /// Node within that graph.
    pub node: NodeId,
}

impl NodeRef {
    /// Create a new node reference.
    pub fn new(graph: GraphId, node: NodeId) -> Self {
        Self { graph, node }
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.graph, self.node)
    }
}

impl FromStr for NodeRef {
    type Err = Error;

    /// Parses `<graph>:<node>`.
    fn from_str(s: &str) -> Result<Self> {
        let (graph, node) =
            s.trim().split_once(':').ok_or_else(|| eyre!("Expected <graph>:<node>, got: {s}"))?;
        let graph = graph.trim().parse::<u64>().map_err(|e| eyre!("Invalid graph id: {e}"))?;
        Ok(Self { graph: GraphId(graph), node: node.parse()? })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_display_is_padded_hex() {
        assert_eq!(NodeId(0xab).to_string(), "000000000000000000000000000000ab");
    }

    #[test]
    fn test_node_id_from_str_formats() {
        assert_eq!("ab".parse::<NodeId>().unwrap(), NodeId(0xab));
        assert_eq!("0xAB".parse::<NodeId>().unwrap(), NodeId(0xab));
        assert_eq!(
            "00000000-0000-0000-0000-0000000000ab".parse::<NodeId>().unwrap(),
            NodeId(0xab)
        );
        assert!("".parse::<NodeId>().is_err());
        assert!("xyz".parse::<NodeId>().is_err());
        assert!("1".repeat(33).parse::<NodeId>().is_err());
    }

    #[test]
    fn test_node_ref_round_trip_through_text() {
        let node_ref = NodeRef::new(GraphId(7), NodeId(3));
        let parsed: NodeRef = node_ref.to_string().parse().unwrap();
        assert_eq!(parsed, node_ref);
        assert!("7".parse::<NodeRef>().is_err());
        assert!("x:3".parse::<NodeRef>().is_err());
    }

    #[test]
    fn test_node_id_serializes_as_hex_text() {
        let json = serde_json::to_string(&NodeId(0x1a)).unwrap();
        assert_eq!(json, "\"0000000000000000000000000000001a\"");
        assert_eq!(serde_json::from_str::<NodeId>("\"1a\"").unwrap(), NodeId(0x1a));
    }

    #[test]
    fn test_id_display() {
        assert_eq!(GraphId(4).to_string(), "4");
        assert_eq!(ObjectHandle(9).to_string(), "obj#9");
        assert_eq!(ExecutionContextId(2).to_string(), "ctx#2");
    }
}
