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

//! Reflected values as read from the host object model.
//!
//! A [`Value`] is a host-independent snapshot of a pin or property. Values are
//! produced by the host's reflection layer, compared by the condition
//! language, hashed by the variable inspector for change detection, and
//! rendered to text for the UI.

use std::{
    collections::hash_map::DefaultHasher,
    fmt,
    hash::{Hash, Hasher},
    str::FromStr,
};

use eyre::{eyre, Error, Result};
use serde::{Deserialize, Serialize};

use super::{NodeId, PinType};

/// Reference to a host object as it appears inside a value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    /// Object name.
    pub name: String,
    /// Name of the object's class.
    pub class: String,
}

/// A reflected value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    /// Not initialized yet, or no longer readable.
    #[default]
    Unset,
    /// Boolean.
    Bool(bool),
    /// Integer.
    Int(i64),
    /// Floating point.
    Float(f64),
    /// String.
    String(String),
    /// Interned name.
    Name(String),
    /// Object reference; `None` for a null reference.
    Object(Option<ObjectRef>),
    /// Struct with named fields in declaration order.
    Struct {
        /// Struct type name.
        type_name: String,
        /// Fields in declaration order.
        fields: Vec<(String, Value)>,
    },
    /// Array elements.
    Array(Vec<Value>),
    /// Set elements.
    Set(Vec<Value>),
    /// Map entries.
    Map(Vec<(Value, Value)>),
    /// A value whose type cannot be rendered generically.
    Opaque {
        /// Host type name.
        type_name: String,
    },
}

impl Value {
    /// Whether this value is [`Value::Unset`].
    pub fn is_unset(&self) -> bool {
        matches!(self, Self::Unset)
    }

    /// Boolean view of the value, if it is a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Numeric view of the value, if it is an integer or a float.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Text view of the value, if it is a string or a name.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) | Self::Name(s) => Some(s),
            _ => None,
        }
    }

    /// Short type label used in error messages and tooltips.
    pub fn type_name(&self) -> &str {
        match self {
            Self::Unset => "unset",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Name(_) => "name",
            Self::Object(_) => "object",
            Self::Struct { type_name, .. } => type_name,
            Self::Array(_) => "array",
            Self::Set(_) => "set",
            Self::Map(_) => "map",
            Self::Opaque { type_name } => type_name,
        }
    }

    /// Whether the value is a container whose elements render inline.
    pub fn is_container(&self) -> bool {
        matches!(self, Self::Array(_) | Self::Set(_) | Self::Map(_))
    }

    /// Hash used for change detection.
    ///
    /// Containers and structs combine the hashes of their children, so a change
    /// in any nested element changes the parent's hash.
    pub fn value_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        std::mem::discriminant(self).hash(&mut hasher);
        match self {
            Self::Unset => {}
            Self::Bool(b) => b.hash(&mut hasher),
            Self::Int(i) => i.hash(&mut hasher),
            Self::Float(f) => f.to_bits().hash(&mut hasher),
            Self::String(s) | Self::Name(s) => s.hash(&mut hasher),
            Self::Object(obj) => obj.hash(&mut hasher),
            Self::Struct { type_name, fields } => {
                type_name.hash(&mut hasher);
                for (name, value) in fields {
                    name.hash(&mut hasher);
                    value.value_hash().hash(&mut hasher);
                }
            }
            Self::Array(items) | Self::Set(items) => {
                items.len().hash(&mut hasher);
                for item in items {
                    item.value_hash().hash(&mut hasher);
                }
            }
            Self::Map(entries) => {
                entries.len().hash(&mut hasher);
                for (k, v) in entries {
                    k.value_hash().hash(&mut hasher);
                    v.value_hash().hash(&mut hasher);
                }
            }
            Self::Opaque { type_name } => type_name.hash(&mut hasher),
        }
        hasher.finish()
    }

    /// Parse a pin default literal according to the pin's type.
    ///
    /// Unparseable literals yield [`Value::Unset`]; types without a literal
    /// form yield an opaque marker.
    pub fn from_literal(pin_type: PinType, text: &str) -> Self {
        let text = text.trim();
        match pin_type {
            PinType::Bool => match text.to_ascii_lowercase().as_str() {
                "true" => Self::Bool(true),
                "false" => Self::Bool(false),
                _ => Self::Unset,
            },
            PinType::Int => text.parse().map(Self::Int).unwrap_or(Self::Unset),
            PinType::Float => text.parse().map(Self::Float).unwrap_or(Self::Unset),
            PinType::String => Self::String(text.to_string()),
            PinType::Name => Self::Name(text.to_string()),
            PinType::Object if text.is_empty() || text == "None" => Self::Object(None),
            PinType::Exec => Self::Unset,
            other => Self::Opaque { type_name: format!("{other:?}") },
        }
    }
}

impl fmt::Display for Value {
    /// Renders the value the way the live variable view shows it: objects as
    /// `Name (Class: X)`, newlines flattened, containers inline.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unset => write!(f, "<unset>"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::String(s) | Self::Name(s) => write!(f, "{}", s.replace('\n', " ")),
            Self::Object(Some(obj)) => write!(f, "{} (Class: {})", obj.name, obj.class),
            Self::Object(None) => write!(f, "None"),
            // Structs expand into child rows, their own summary stays empty.
            Self::Struct { .. } => Ok(()),
            Self::Array(items) | Self::Set(items) => {
                if items.is_empty() {
                    return write!(f, "[empty]");
                }
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Self::Map(entries) => {
                if entries.is_empty() {
                    return write!(f, "[empty]");
                }
                write!(f, "[")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "]")
            }
            Self::Opaque { type_name } => write!(f, "<{type_name}>"),
        }
    }
}

/// What a watch reads: a pin of a node in the frame's graph, or a variable of
/// the object the context runs on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WatchRef {
    /// A node pin.
    Pin {
        /// Node owning the pin.
        node: NodeId,
        /// Pin name.
        pin: String,
    },
    /// A member variable of the context's object.
    Variable {
        /// Variable name.
        name: String,
    },
}

impl WatchRef {
    /// Watch a pin.
    pub fn pin(node: NodeId, pin: impl Into<String>) -> Self {
        Self::Pin { node, pin: pin.into() }
    }

    /// Watch a variable.
    pub fn variable(name: impl Into<String>) -> Self {
        Self::Variable { name: name.into() }
    }
}

impl fmt::Display for WatchRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pin { node, pin } => write!(f, "{node}.{pin}"),
            Self::Variable { name } => write!(f, "var.{name}"),
        }
    }
}

impl FromStr for WatchRef {
    type Err = Error;

    /// Parses `var.<name>` or `<node>.<pin>`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(name) = s.strip_prefix("var.") {
            if name.is_empty() {
                return Err(eyre!("Empty variable name in watch: {s}"));
            }
            return Ok(Self::variable(name));
        }
        let (node, pin) =
            s.split_once('.').ok_or_else(|| eyre!("Expected var.<name> or <node>.<pin>, got: {s}"))?;
        if pin.is_empty() {
            return Err(eyre!("Empty pin name in watch: {s}"));
        }
        Ok(Self::pin(node.parse()?, pin))
    }
}

/// Result of a watch read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchReading {
    /// The value read, or [`Value::Unset`].
    pub value: Value,
    /// Step counter of the context when the value was read.
    pub step: u64,
    /// The referenced frame is neither live nor retained for post-mortem inspection.
    pub stale: bool,
    /// The value comes from the most recently exited frame.
    pub post_mortem: bool,
}

impl WatchReading {
    /// A stale reading.
    pub fn stale(step: u64) -> Self {
        Self { value: Value::Unset, step, stale: true, post_mortem: false }
    }
}

/// Access level of a reflected property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PropertyAccess {
    /// Visible to everyone.
    #[default]
    Public,
    /// Visible to subclasses.
    Protected,
    /// Visible to the owning graph only.
    Private,
}

/// Reflection metadata of one property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyInfo {
    /// Property name.
    pub name: String,
    /// `Category` metadata as authored, if any.
    #[serde(default)]
    pub category: Option<String>,
    /// Access level.
    #[serde(default)]
    pub access: PropertyAccess,
    /// Whether the property is declared in (and visible to) a graph.
    #[serde(default = "default_true")]
    pub graph_visible: bool,
}

fn default_true() -> bool {
    true
}

impl PropertyInfo {
    /// A public, graph-visible property without category.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), category: None, access: PropertyAccess::Public, graph_visible: true }
    }

    /// Set the category metadata.
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Set the access level.
    pub fn with_access(mut self, access: PropertyAccess) -> Self {
        self.access = access;
        self
    }
}
