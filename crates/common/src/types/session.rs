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

//! Session-level types exchanged between the engine and its consumers:
//! pause notifications, trace digests, snapshots and inspector rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    Breakpoint, BreakpointKey, ExecutionContextId, GraphId, NodeRef, ObjectHandle,
    SourceLocation,
};

/// Kind of single-step command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Stop at the next node entry, at any depth.
    Into,
    /// Stop at the next node entry at the same or a shallower depth.
    Over,
    /// Stop at the next node entry at a shallower depth.
    Out,
}

/// Why a context is paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "at", rename_all = "snake_case")]
pub enum PauseReason {
    /// A user breakpoint fired.
    Breakpoint(BreakpointKey),
    /// A step command reached its target.
    Step(StepKind),
}

/// Outcome handed back to the VM thread when a pause ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseOutcome {
    /// Execution may continue.
    Resumed,
    /// The context was detached while paused; the VM should abort the invocation.
    Aborted,
}

/// How an execution context ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextEnd {
    /// Ran to completion.
    Completed,
    /// Aborted by the host or by the debugger.
    Aborted,
}

/// Command that released a paused context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeCommand {
    /// Run until the next breakpoint.
    Continue,
    /// Single-step.
    Step(StepKind),
}

/// Run state of an execution context as seen by the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextState {
    /// Executing.
    Running,
    /// Blocked on the pause controller.
    Paused,
    /// Ended or aborted; no further commands apply.
    Detached,
}

/// One entry of a context's call stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameView {
    /// Node executing in this frame.
    pub node: NodeRef,
    /// Node title for display.
    pub title: String,
    /// Source location for editor highlighting.
    pub source: SourceLocation,
    /// Stack depth, 1 for the outermost frame.
    pub depth: usize,
    /// Step counter value when the frame was entered.
    pub entered_at_step: u64,
}

/// Per-context trace summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceStats {
    /// Node entries observed.
    pub steps: u64,
    /// Deepest stack observed.
    pub max_depth: usize,
    /// Breakpoint pauses.
    pub breakpoint_hits: u64,
}

/// A paused context, as reported to the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PauseInfo {
    /// Paused context.
    pub context: ExecutionContextId,
    /// Graph the context was started on.
    pub graph: GraphId,
    /// Object the context runs on.
    pub object: ObjectHandle,
    /// Why it paused.
    pub reason: PauseReason,
    /// Node about to execute.
    pub node: NodeRef,
    /// Current stack depth.
    pub depth: usize,
    /// Step counter at the pause.
    pub step: u64,
    /// Call stack, outermost first.
    pub stack: Vec<FrameView>,
    /// Wall-clock time of the pause.
    pub paused_at: DateTime<Utc>,
}

/// Live activity of one context in a trace digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextTrace {
    /// Context.
    pub context: ExecutionContextId,
    /// Node currently on top of the stack, if any.
    pub current: Option<NodeRef>,
    /// Stack depth.
    pub depth: usize,
    /// Cumulative statistics.
    pub stats: TraceStats,
}

/// Coalesced trace activity emitted at most once per publish interval.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceDigest {
    /// Node entries since the previous digest, all contexts combined.
    pub steps: u64,
    /// Contexts that made progress since the previous digest, by latest state.
    pub contexts: Vec<ContextTrace>,
    /// Contexts that ended since the previous digest.
    pub ended: Vec<(ExecutionContextId, ContextEnd)>,
}

impl TraceDigest {
    /// Whether the digest carries anything worth publishing.
    pub fn is_empty(&self) -> bool {
        self.steps == 0 && self.contexts.is_empty() && self.ended.is_empty()
    }
}

/// Severity of a user notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    /// Informational.
    Info,
    /// Something the user should look at.
    Warning,
    /// A command failed.
    Error,
}

/// User-facing failure or remark, delivered through the event stream instead
/// of crossing the VM boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserNotice {
    /// Severity.
    pub level: NoticeLevel,
    /// Human-readable message.
    pub message: String,
    /// Related context, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ExecutionContextId>,
    /// Related breakpoint, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breakpoint: Option<BreakpointKey>,
}

impl UserNotice {
    /// A warning notice.
    pub fn warning(message: impl Into<String>) -> Self {
        Self { level: NoticeLevel::Warning, message: message.into(), context: None, breakpoint: None }
    }

    /// An error notice.
    pub fn error(message: impl Into<String>) -> Self {
        Self { level: NoticeLevel::Error, message: message.into(), context: None, breakpoint: None }
    }

    /// An informational notice.
    pub fn info(message: impl Into<String>) -> Self {
        Self { level: NoticeLevel::Info, message: message.into(), context: None, breakpoint: None }
    }

    /// Attach the related context.
    pub fn for_context(mut self, context: ExecutionContextId) -> Self {
        self.context = Some(context);
        self
    }

    /// Attach the related breakpoint.
    pub fn for_breakpoint(mut self, key: BreakpointKey) -> Self {
        self.breakpoint = Some(key);
        self
    }
}

/// Event delivered to session subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A context paused. Never debounced.
    Paused(PauseInfo),
    /// A paused context was released. Never debounced.
    Resumed {
        /// Released context.
        context: ExecutionContextId,
        /// Command that released it.
        command: ResumeCommand,
    },
    /// A context was detached while paused, or ended while known to the UI.
    Detached {
        /// Detached context.
        context: ExecutionContextId,
        /// How it ended.
        end: ContextEnd,
    },
    /// Coalesced trace activity.
    Trace(TraceDigest),
    /// The breakpoint list changed.
    BreakpointsChanged {
        /// Full list after the change.
        breakpoints: Vec<Breakpoint>,
    },
    /// A breakpoint lost its node after a graph rebuild.
    BreakpointOrphaned {
        /// Affected breakpoint.
        key: BreakpointKey,
    },
    /// A user-facing remark.
    Notice(UserNotice),
}

impl SessionEvent {
    /// Short event name, as serialized in the `event` tag.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Paused(_) => "paused",
            Self::Resumed { .. } => "resumed",
            Self::Detached { .. } => "detached",
            Self::Trace(_) => "trace",
            Self::BreakpointsChanged { .. } => "breakpoints_changed",
            Self::BreakpointOrphaned { .. } => "breakpoint_orphaned",
            Self::Notice(_) => "notice",
        }
    }
}

/// A live context in a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextView {
    /// Context.
    pub id: ExecutionContextId,
    /// Graph the context was started on.
    pub graph: GraphId,
    /// Object the context runs on.
    pub object: ObjectHandle,
    /// Run state.
    pub state: ContextState,
    /// Call stack, outermost first.
    pub stack: Vec<FrameView>,
    /// Trace summary.
    pub stats: TraceStats,
}

/// Coherent view of the whole session at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// The paused context exposed to the UI, if any.
    pub focused: Option<PauseInfo>,
    /// Other paused contexts, in arrival order.
    pub paused_queue: Vec<ExecutionContextId>,
    /// All breakpoints.
    pub breakpoints: Vec<Breakpoint>,
    /// All live contexts.
    pub contexts: Vec<ContextView>,
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
}

/// One row of the variable inspector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableRow {
    /// Dotted path from the object, e.g. `Stats.Health`.
    pub path: String,
    /// Property or field name.
    pub name: String,
    /// Nesting level, 0 for top-level properties.
    pub depth: usize,
    /// Type label.
    pub type_name: String,
    /// Rendered value.
    pub display: String,
    /// Change-detection hash of the value.
    pub hash: u64,
    /// Highlight intensity in `[0, 1]`; 1 right after a change, fading to 0.
    pub highlight: f32,
}

/// A category of inspector rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableCategory {
    /// Category name.
    pub name: String,
    /// Shown only in advanced display.
    pub advanced: bool,
    /// Rows, in property order with struct children following their parent.
    pub rows: Vec<VariableRow>,
}

/// The variable inspector's view of one object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectVariables {
    /// Inspected object.
    pub object: ObjectHandle,
    /// Whether the object lives in a running world.
    pub running: bool,
    /// Categories sorted by name.
    pub categories: Vec<VariableCategory>,
}

impl ObjectVariables {
    /// Find a row by its dotted path.
    pub fn row(&self, path: &str) -> Option<&VariableRow> {
        self.categories.iter().flat_map(|c| c.rows.iter()).find(|r| r.path == path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeId;

    #[test]
    fn test_event_serializes_with_tag() {
        let event = SessionEvent::Resumed {
            context: ExecutionContextId(3),
            command: ResumeCommand::Step(StepKind::Over),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "resumed");
        assert_eq!(json["context"], 3);
        assert_eq!(event.name(), "resumed");
    }

    #[test]
    fn test_pause_reason_serialization() {
        let key = NodeRef::new(GraphId(1), NodeId(2));
        let json = serde_json::to_value(PauseReason::Breakpoint(key)).unwrap();
        assert_eq!(json["kind"], "breakpoint");
        let back: PauseReason = serde_json::from_value(json).unwrap();
        assert_eq!(back, PauseReason::Breakpoint(key));
    }

    #[test]
    fn test_empty_digest() {
        let mut digest = TraceDigest::default();
        assert!(digest.is_empty());
        digest.ended.push((ExecutionContextId(1), ContextEnd::Completed));
        assert!(!digest.is_empty());
    }

    #[test]
    fn test_notice_builders() {
        let n = UserNotice::warning("bad").for_context(ExecutionContextId(1));
        assert_eq!(n.level, NoticeLevel::Warning);
        assert_eq!(n.context, Some(ExecutionContextId(1)));
        let json = serde_json::to_value(&UserNotice::info("x")).unwrap();
        assert!(json.get("breakpoint").is_none());
    }
}
