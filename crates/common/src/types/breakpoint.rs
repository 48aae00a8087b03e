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

use std::{fmt::Display, str::FromStr};

use eyre::{bail, Error, Result};
use serde::{Deserialize, Serialize};

use super::{GraphId, NodeId, NodeRef};

/// Normalize an expression by collapsing any run of whitespace into a single space.
pub fn normalize_condition(expr: &str) -> String {
    expr.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Key of a breakpoint: one node of one graph.
pub type BreakpointKey = NodeRef;

/// Optional gate on how many hits are required before the breakpoint pauses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HitCondition {
    /// Pause only on the n-th hit.
    Equal(u64),
    /// Pause on every hit from the n-th on.
    AtLeast(u64),
    /// Pause on every n-th hit.
    Multiple(u64),
}

impl HitCondition {
    /// Whether a breakpoint with this gate pauses on hit number `hits` (1-based).
    pub fn allows(&self, hits: u64) -> bool {
        match *self {
            Self::Equal(n) => hits == n,
            Self::AtLeast(n) => hits >= n,
            Self::Multiple(0) => false,
            Self::Multiple(n) => hits % n == 0,
        }
    }
}

impl Display for HitCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Equal(n) => write!(f, "={n}"),
            Self::AtLeast(n) => write!(f, ">={n}"),
            Self::Multiple(n) => write!(f, "%{n}"),
        }
    }
}

impl FromStr for HitCondition {
    type Err = Error;

    /// Parses `=N`, `>=N` or `%N`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (ctor, rest): (fn(u64) -> Self, &str) = if let Some(rest) = s.strip_prefix(">=") {
            (Self::AtLeast, rest)
        } else if let Some(rest) = s.strip_prefix('=') {
            (Self::Equal, rest)
        } else if let Some(rest) = s.strip_prefix('%') {
            (Self::Multiple, rest)
        } else {
            bail!("Invalid hit condition, expected =N, >=N or %N: {s}");
        };
        let n = rest.trim().parse::<u64>().map_err(|e| eyre::eyre!("Invalid hit count: {e}"))?;
        Ok(ctor(n))
    }
}

/// A user-defined breakpoint as seen from the command surface.
///
/// The engine keeps its own runtime entry (with a parsed condition and an
/// atomic hit counter); this type is the serializable view of it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Breakpoint {
    /// Node the breakpoint is attached to.
    pub key: BreakpointKey,
    /// Whether the breakpoint is armed.
    pub enabled: bool,
    /// Optional condition expression that must evaluate to true for the breakpoint to trigger.
    pub condition: Option<String>,
    /// Optional hit-count gate.
    pub hit_condition: Option<HitCondition>,
    /// Number of times execution reached the node while the breakpoint was armed.
    pub hit_count: u64,
    /// Set when the graph was re-indexed and the node could not be matched yet.
    pub orphaned: bool,
    /// Graph generation the breakpoint was validated against.
    pub generation: u64,
}

impl Display for Breakpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "@{}", self.key)?;
        if let Some(hits) = &self.hit_condition {
            write!(f, " hits {hits}")?;
        }
        if let Some(cond) = &self.condition {
            write!(f, " if ${cond}")?;
        }
        Ok(())
    }
}

impl FromStr for Breakpoint {
    type Err = Error;

    /// Parses a breakpoint from a string.
    /// Format: `@<graph>:<node> [hits <gate>] [if $<condition>]`
    /// Examples:
    /// - `@3:1a` - Breakpoint on node `0x1a` of graph 3
    /// - `@3:1a if $ Health < 10` - Conditional breakpoint
    /// - `@3:1a hits >=2 if $Open` - Hit-count gate plus condition
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let Some(rest) = trimmed.strip_prefix('@') else {
            bail!("Invalid breakpoint format. Expected @<graph>:<node> [if $<condition>], got: {s}");
        };

        let (head, condition) = match rest.find(" if ") {
            Some(pos) => {
                let condition_str = rest[pos + 4..].trim();
                let Some(expr) = condition_str.strip_prefix('$') else {
                    bail!("Condition expression does not start with $");
                };
                let expr = normalize_condition(expr);
                if expr.is_empty() {
                    bail!("Empty condition expression");
                }
                (&rest[..pos], Some(expr))
            }
            None => (rest, None),
        };

        let (loc, hit_condition) = match head.find(" hits ") {
            Some(pos) => (&head[..pos], Some(head[pos + 6..].parse::<HitCondition>()?)),
            None => (head, None),
        };

        let key = loc.trim().parse::<NodeRef>()?;
        Ok(Self::new(key.graph, key.node, condition, hit_condition))
    }
}

impl Breakpoint {
    /// Creates an enabled breakpoint with no hits.
    pub fn new(
        graph: GraphId,
        node: NodeId,
        condition: Option<String>,
        hit_condition: Option<HitCondition>,
    ) -> Self {
        Self {
            key: NodeRef::new(graph, node),
            enabled: true,
            condition: condition.map(|c| normalize_condition(&c)),
            hit_condition,
            hit_count: 0,
            orphaned: false,
            generation: 0,
        }
    }

    /// Update the condition of the breakpoint.
    pub fn set_condition(&mut self, condition: &str) {
        self.condition = Some(normalize_condition(condition));
    }

    /// Whether the breakpoint can currently pause execution.
    pub fn is_armed(&self) -> bool {
        self.enabled && !self.orphaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breakpoint_from_str_location_only() {
        let bp = Breakpoint::from_str("@3:1a").unwrap();
        assert_eq!(bp.key, NodeRef::new(GraphId(3), NodeId(0x1a)));
        assert!(bp.condition.is_none());
        assert!(bp.hit_condition.is_none());
        assert!(bp.enabled);
        assert!(bp.is_armed());
    }

    #[test]
    fn test_breakpoint_from_str_location_and_condition() {
        let bp = Breakpoint::from_str("  @3:1a  if $  Health   <  10  ").unwrap();
        assert_eq!(bp.condition, Some("Health < 10".to_string()));
    }

    #[test]
    fn test_breakpoint_from_str_hits_and_condition() {
        let bp = Breakpoint::from_str("@3:1a hits >=2 if $Open == true").unwrap();
        assert_eq!(bp.hit_condition, Some(HitCondition::AtLeast(2)));
        assert_eq!(bp.condition, Some("Open == true".to_string()));
    }

    #[test]
    fn test_breakpoint_from_str_invalid() {
        // Missing @
        assert!(Breakpoint::from_str("3:1a").is_err());
        // Missing node
        assert!(Breakpoint::from_str("@3").is_err());
        // Condition without $
        assert!(Breakpoint::from_str("@3:1a if Health < 10").is_err());
        // Empty condition
        assert!(Breakpoint::from_str("@3:1a if $   ").is_err());
        // Bad gate
        assert!(Breakpoint::from_str("@3:1a hits ~2").is_err());
    }

    #[test]
    fn test_breakpoint_display_round_trip() {
        let bp = Breakpoint::new(
            GraphId(3),
            NodeId(0x1a),
            Some("Health  < 10".into()),
            Some(HitCondition::Multiple(3)),
        );
        let text = bp.to_string();
        assert_eq!(text, "@3:0000000000000000000000000000001a hits %3 if $Health < 10");
        assert_eq!(Breakpoint::from_str(&text).unwrap(), bp);
    }

    #[test]
    fn test_hit_condition_allows() {
        assert!(HitCondition::Equal(2).allows(2));
        assert!(!HitCondition::Equal(2).allows(3));
        assert!(HitCondition::AtLeast(2).allows(5));
        assert!(!HitCondition::AtLeast(2).allows(1));
        assert!(HitCondition::Multiple(3).allows(6));
        assert!(!HitCondition::Multiple(3).allows(4));
        assert!(!HitCondition::Multiple(0).allows(0));
    }

    #[test]
    fn test_orphaned_breakpoint_is_not_armed() {
        let mut bp = Breakpoint::new(GraphId(1), NodeId(1), None, None);
        bp.orphaned = true;
        assert!(!bp.is_armed());
        bp.orphaned = false;
        bp.enabled = false;
        assert!(!bp.is_armed());
    }

    #[test]
    fn test_normalize_condition() {
        assert_eq!(normalize_condition("a  \t\n  b \r\n c"), "a b c");
        assert_eq!(normalize_condition("   "), "");
    }
}
