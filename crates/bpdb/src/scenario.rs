//! Scenario files: the graphs and objects a simulated host exposes, the
//! invocations to run, and the scripted debugger commands to issue.

use std::{fs, path::Path, str::FromStr};

use bpdb_common::types::{
    Breakpoint, GraphId, NodeDescriptor, NodeId, NodeKind, NodeRef, ObjectHandle, PinDescriptor,
    PinType, PropertyAccess, PropertyInfo, Value, WatchRef,
};
use bpdb_engine::{HostObject, MemoryHost};
use eyre::{Result, WrapErr};
use serde::Deserialize;

/// A parsed scenario file.
#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    /// Graph assets known to the host.
    pub graphs: Vec<GraphSpec>,
    /// Objects graphs run on.
    #[serde(default)]
    pub objects: Vec<ObjectSpec>,
    /// Invocations, started by [`Command::Start`] or once the command list is exhausted.
    #[serde(default)]
    pub runs: Vec<RunSpec>,
    /// Debugger commands, issued in order.
    #[serde(default)]
    pub commands: Vec<Command>,
}

/// One graph asset.
#[derive(Debug, Clone, Deserialize)]
pub struct GraphSpec {
    /// Graph id.
    pub id: GraphId,
    /// Asset path.
    pub path: String,
    /// Nodes in execution order.
    pub nodes: Vec<NodeSpec>,
}

/// One node of a graph.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeSpec {
    /// Node id, as hex text.
    pub id: NodeId,
    /// Editor title.
    #[serde(default)]
    pub title: Option<String>,
    /// Kind, flattened: `kind = "call_function"`, `callee = 2`.
    #[serde(flatten)]
    pub kind: NodeKind,
    /// Pins.
    #[serde(default)]
    pub pins: Vec<PinDescriptor>,
}

impl NodeSpec {
    fn descriptor(&self) -> NodeDescriptor {
        let mut node = NodeDescriptor::new(self.id, self.kind.clone());
        if let Some(title) = &self.title {
            node = node.with_title(title);
        }
        self.pins.iter().cloned().fold(node, NodeDescriptor::with_pin)
    }
}

/// One host object.
#[derive(Debug, Clone, Deserialize)]
pub struct ObjectSpec {
    /// Object handle.
    pub handle: ObjectHandle,
    /// Object name.
    pub name: String,
    /// Class name.
    pub class: String,
    /// Whether the object lives in a running world.
    #[serde(default = "default_running")]
    pub running: bool,
    /// Member variables.
    #[serde(default)]
    pub variables: Vec<VariableSpec>,
}

fn default_running() -> bool {
    true
}

/// One member variable, with its initial value as a literal of its type.
#[derive(Debug, Clone, Deserialize)]
pub struct VariableSpec {
    /// Variable name.
    pub name: String,
    /// Value type.
    #[serde(rename = "type")]
    pub pin_type: PinType,
    /// Initial value literal.
    #[serde(default)]
    pub value: String,
    /// Category metadata.
    #[serde(default)]
    pub category: Option<String>,
    /// Access level.
    #[serde(default)]
    pub access: PropertyAccess,
}

impl ObjectSpec {
    fn host_object(&self) -> HostObject {
        let mut object = HostObject::new(&self.name, &self.class);
        if !self.running {
            object = object.in_editor_world();
        }
        self.variables.iter().fold(object, |object, var| {
            let mut info = PropertyInfo::new(&var.name).with_access(var.access);
            if let Some(category) = &var.category {
                info = info.with_category(category);
            }
            object.with_property(info, Value::from_literal(var.pin_type, &var.value))
        })
    }
}

/// One graph invocation.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RunSpec {
    /// Graph to run.
    pub graph: GraphId,
    /// Object to run it on.
    pub object: ObjectHandle,
}

/// A scripted debugger command.
///
/// `target` fields use the breakpoint text form (`@<graph>:<node> [hits <gate>]
/// [if $<expr>]`); commands acting on "the" paused context use the focused one
/// and wait for a pause if there is none yet.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum Command {
    /// Start one run by index, or every run not started yet.
    Start {
        /// Index into `runs`.
        #[serde(default)]
        run: Option<usize>,
    },
    /// Set a breakpoint.
    Break {
        /// Breakpoint text.
        target: String,
    },
    /// Remove a breakpoint.
    Clear {
        /// Breakpoint location.
        target: String,
    },
    /// Enable a breakpoint.
    Enable {
        /// Breakpoint location.
        target: String,
    },
    /// Disable a breakpoint.
    Disable {
        /// Breakpoint location.
        target: String,
    },
    /// Resume the focused context.
    Continue,
    /// Step into from the focused context.
    StepInto,
    /// Step over from the focused context.
    StepOver,
    /// Step out from the focused context.
    StepOut,
    /// Read a watch in the focused context.
    Watch {
        /// `var.<name>` or `<node>.<pin>`.
        watch: String,
    },
    /// Inspect an object's variables.
    Vars {
        /// Object to inspect.
        object: ObjectHandle,
    },
    /// Drop a graph's descriptor, orphaning its breakpoints until re-indexed.
    Invalidate {
        /// Graph to invalidate.
        graph: GraphId,
    },
    /// Remove every orphaned breakpoint.
    RemoveOrphaned,
    /// Print a session snapshot.
    Snapshot,
}

impl Command {
    /// Name as written in the scenario.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Break { .. } => "break",
            Self::Clear { .. } => "clear",
            Self::Enable { .. } => "enable",
            Self::Disable { .. } => "disable",
            Self::Continue => "continue",
            Self::StepInto => "step-into",
            Self::StepOver => "step-over",
            Self::StepOut => "step-out",
            Self::Watch { .. } => "watch",
            Self::Vars { .. } => "vars",
            Self::Invalidate { .. } => "invalidate",
            Self::RemoveOrphaned => "remove-orphaned",
            Self::Snapshot => "snapshot",
        }
    }

    /// Whether the command acts on the focused paused context.
    pub fn needs_pause(&self) -> bool {
        matches!(self, Self::Continue | Self::StepInto | Self::StepOver | Self::StepOut | Self::Watch { .. })
    }
}

/// Parse a breakpoint target.
pub fn parse_breakpoint(target: &str) -> Result<Breakpoint> {
    Breakpoint::from_str(target)
}

/// Parse a breakpoint location, with or without the leading `@`.
pub fn parse_location(target: &str) -> Result<NodeRef> {
    let target = target.trim();
    target.strip_prefix('@').unwrap_or(target).parse()
}

/// Parse a watch.
pub fn parse_watch(watch: &str) -> Result<WatchRef> {
    watch.parse()
}

impl Scenario {
    /// Parse a scenario from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).wrap_err("Failed to parse scenario")
    }

    /// Load a scenario file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .wrap_err_with(|| format!("Failed to read scenario {}", path.display()))?;
        Self::from_toml_str(&text)
    }

    /// Populate a host with the scenario's graphs and objects.
    pub fn install(&self, host: &MemoryHost) {
        for graph in &self.graphs {
            host.put_graph(graph.id, &graph.path, graph.nodes.iter().map(NodeSpec::descriptor).collect());
        }
        for object in &self.objects {
            host.put_object(object.handle, object.host_object());
        }
    }
}
