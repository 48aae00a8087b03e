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

//! Debug session: the engine's command surface and VM observer.
//!
//! A [`DebugSession`] owns every engine component and wires them together:
//!
//! - As an [`ExecutionObserver`] it receives node entry and exit from VM
//!   threads, records the trace, checks breakpoints and step targets, and
//!   blocks the calling thread while its context is paused.
//! - As the command surface it serves breakpoint edits, resume and step
//!   commands, watch reads and variable inspection to the UI.
//!
//! No hook ever unwinds into the VM: panics are caught and logged, and every
//! failure degrades to "carry on executing". Command failures are returned to
//! the caller and also published as [`SessionEvent::Notice`].
//!
//! # Example
//!
//! ```ignore
//! let host = Arc::new(MemoryHost::new());
//! let session = DebugSession::new(DebuggerConfig::default(), host.clone(), host.clone());
//! session.attach(host.clone())?;
//! session.set_breakpoint(Breakpoint::new(graph, node, None, None))?;
//! ```

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};

use bpdb_common::{
    types::{
        Breakpoint, BreakpointKey, ContextEnd, ExecutionContextId, GraphDescriptor, GraphId,
        HitCondition, NodeRef, ObjectHandle, ObjectVariables, PauseInfo, PauseOutcome, PauseReason,
        ResumeCommand, SessionEvent, SessionSnapshot, StepKind, UserNotice, WatchReading,
        WatchRef,
    },
    DebuggerConfig,
};
use chrono::Utc;
use parking_lot::Mutex;
use tokio::{runtime::Handle, sync::broadcast, task::JoinHandle};
use tracing::{debug, error, info, trace, warn};

use crate::{
    AssetError, AssetResolver, BreakpointEntry, BreakpointSpec, BreakpointTable, Condition,
    DebuggerError, ExecutionContext, ExecutionObserver, FocusQueue, GraphIndex, HookOutcome,
    Reflection, Result, SessionPublisher, StepCheck, TraceRecorder, VariableInspector,
    VmHookRegistry, WatchEvaluator,
};

/// A live debugging session over one host.
pub struct DebugSession {
    config: DebuggerConfig,
    index: GraphIndex,
    breakpoints: BreakpointTable,
    recorder: Arc<TraceRecorder>,
    watches: WatchEvaluator,
    inspector: VariableInspector,
    publisher: Arc<SessionPublisher>,
    focus: FocusQueue,
    registry: Mutex<Option<Arc<dyn VmHookRegistry>>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for DebugSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugSession")
            .field("breakpoints", &self.breakpoints.len())
            .field("contexts", &self.recorder.live().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl DebugSession {
    /// Create a session. If called inside a tokio runtime, the publisher's
    /// debounce ticker starts right away.
    pub fn new(
        config: DebuggerConfig,
        resolver: Arc<dyn AssetResolver>,
        reflection: Arc<dyn Reflection>,
    ) -> Arc<Self> {
        let recorder = Arc::new(TraceRecorder::new(config.post_mortem_retention()));
        let publisher = Arc::new(SessionPublisher::new(
            config.publish_interval(),
            config.event_channel_capacity,
            recorder.clone(),
        ));
        let session = Arc::new(Self {
            index: GraphIndex::new(resolver),
            breakpoints: BreakpointTable::new(),
            recorder,
            watches: WatchEvaluator::new(reflection.clone(), config.post_mortem_retention()),
            inspector: VariableInspector::new(reflection, &config),
            publisher,
            focus: FocusQueue::new(),
            registry: Mutex::new(None),
            ticker: Mutex::new(None),
            closed: AtomicBool::new(false),
            config,
        });
        session.spawn_publisher();
        info!(
            publish_interval_ms = session.config.publish_interval_ms,
            retention_ms = session.config.post_mortem_retention_ms,
            "Debug session created"
        );
        session
    }

    /// Start the publisher's ticker on the current tokio runtime, if any.
    /// Returns whether a ticker is running.
    pub fn spawn_publisher(&self) -> bool {
        let mut ticker = self.ticker.lock();
        if ticker.as_ref().is_some_and(|t| !t.is_finished()) {
            return true;
        }
        match Handle::try_current() {
            Ok(_) => {
                *ticker = Some(self.publisher.spawn_ticker());
                true
            }
            Err(_) => {
                debug!("No tokio runtime, trace digests are only emitted on flush");
                false
            }
        }
    }

    /// Settings in effect.
    pub fn config(&self) -> &DebuggerConfig {
        &self.config
    }

    /// Graph index.
    pub fn index(&self) -> &GraphIndex {
        &self.index
    }

    /// Trace recorder.
    pub fn recorder(&self) -> &TraceRecorder {
        &self.recorder
    }

    /// Event publisher.
    pub fn publisher(&self) -> &Arc<SessionPublisher> {
        &self.publisher
    }

    /// Whether [`Self::shutdown`] was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Install this session as the VM's observer.
    pub fn attach(self: &Arc<Self>, registry: Arc<dyn VmHookRegistry>) -> Result<()> {
        self.ensure_open()?;
        let mut slot = self.registry.lock();
        if let Some(previous) = slot.take() {
            previous.unregister_observer();
        }
        registry.register_observer(self.clone());
        *slot = Some(registry);
        info!("Debug session attached to VM");
        Ok(())
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.publisher.subscribe()
    }

    // ----- breakpoints -----

    /// Set (or replace) a breakpoint.
    ///
    /// The condition is parsed and the node is checked against the graph's
    /// descriptor. If the graph cannot be resolved the breakpoint is kept as
    /// orphaned and the resolution error is returned.
    pub fn set_breakpoint(&self, request: Breakpoint) -> Result<Breakpoint> {
        let result = self.ensure_open().and_then(|_| self.try_set_breakpoint(request));
        self.report(result)
    }

    fn try_set_breakpoint(&self, request: Breakpoint) -> Result<Breakpoint> {
        let key = request.key;
        let condition = request
            .condition
            .as_deref()
            .map(Condition::parse)
            .transpose()
            .map_err(|e| DebuggerError::InvalidBreakpoint(format!("condition of {key}: {e}")))?;
        if let Some(gate @ (HitCondition::Equal(0) | HitCondition::Multiple(0))) = request.hit_condition {
            return Err(DebuggerError::InvalidBreakpoint(format!("hit gate {gate} of {key} never fires")));
        }

        let mut spec = BreakpointSpec {
            key,
            enabled: request.enabled,
            condition,
            hit_condition: request.hit_condition,
            generation: 0,
            orphaned: false,
        };

        match self.resolve_graph(key.graph) {
            Ok(graph) => {
                if !graph.contains(key.node) {
                    return Err(DebuggerError::UnknownNode { graph: key.graph, node: key.node });
                }
                spec.generation = graph.generation;
                let view = self.breakpoints.set(spec);
                info!(breakpoint = %key, generation = view.generation, "Breakpoint set");
                self.publish_breakpoints();
                Ok(view)
            }
            Err(source) => {
                spec.orphaned = true;
                self.breakpoints.set(spec);
                warn!(breakpoint = %key, %source, "Breakpoint set on unresolvable graph, orphaned");
                self.publisher.publish_now(SessionEvent::BreakpointOrphaned { key });
                Err(DebuggerError::AssetResolution { graph: key.graph, source })
            }
        }
    }

    /// Remove a breakpoint.
    pub fn clear_breakpoint(&self, key: BreakpointKey) -> Result<Breakpoint> {
        let result = self.breakpoints.clear(&key).ok_or(DebuggerError::UnknownBreakpoint(key));
        if result.is_ok() {
            info!(breakpoint = %key, "Breakpoint cleared");
            self.publish_breakpoints();
        }
        self.report(result)
    }

    /// Enable a breakpoint.
    pub fn enable_breakpoint(&self, key: BreakpointKey) -> Result<Breakpoint> {
        self.set_enabled(key, true)
    }

    /// Disable a breakpoint without removing it.
    pub fn disable_breakpoint(&self, key: BreakpointKey) -> Result<Breakpoint> {
        self.set_enabled(key, false)
    }

    fn set_enabled(&self, key: BreakpointKey, enabled: bool) -> Result<Breakpoint> {
        let result =
            self.breakpoints.set_enabled(&key, enabled).ok_or(DebuggerError::UnknownBreakpoint(key));
        if result.is_ok() {
            debug!(breakpoint = %key, enabled, "Breakpoint toggled");
            self.publish_breakpoints();
        }
        self.report(result)
    }

    /// All breakpoints, sorted by location.
    pub fn list_breakpoints(&self) -> Vec<Breakpoint> {
        self.breakpoints.list()
    }

    /// Remove every orphaned breakpoint. This is the user's confirmation that
    /// breakpoints lost to a graph rebuild may go.
    pub fn remove_orphaned(&self) -> Vec<BreakpointKey> {
        let removed = self.breakpoints.remove_orphaned();
        if !removed.is_empty() {
            info!(count = removed.len(), "Orphaned breakpoints removed");
            self.publish_breakpoints();
        }
        removed
    }

    /// Drop the cached descriptor of a graph, typically after a recompile.
    ///
    /// Every breakpoint of the graph is flagged orphaned. On the next
    /// reference the graph is re-indexed and breakpoints whose node survived
    /// are re-armed.
    pub fn invalidate_graph(&self, graph: GraphId) -> Vec<BreakpointKey> {
        // Orphan before dropping the descriptor: the rebuild that follows must see the orphans.
        let orphaned = self.breakpoints.orphan_graph(graph);
        self.index.invalidate(graph);
        for key in &orphaned {
            self.publisher.publish_now(SessionEvent::BreakpointOrphaned { key: *key });
        }
        orphaned
    }

    /// Resolve a graph. A fresh build re-validates the graph's orphaned breakpoints.
    fn resolve_graph(&self, graph: GraphId) -> std::result::Result<Arc<GraphDescriptor>, AssetError> {
        let resolved = self.index.resolve_tracked(graph)?;
        if resolved.fresh && self.breakpoints.needs_revalidation(graph, resolved.graph.generation) {
            self.revalidate(&resolved.graph);
        }
        Ok(resolved.graph)
    }

    fn revalidate(&self, graph: &GraphDescriptor) {
        let outcome = self.breakpoints.revalidate(graph);
        if !outcome.rearmed.is_empty() {
            info!(graph = %graph.id, count = outcome.rearmed.len(), "Breakpoints re-armed after rebuild");
            self.publish_breakpoints();
        }
        for key in outcome.still_orphaned {
            self.publisher.publish_now(SessionEvent::Notice(
                UserNotice::warning(format!(
                    "breakpoint {key} no longer matches a node of {}; remove it to confirm",
                    graph.path
                ))
                .for_breakpoint(key),
            ));
        }
    }

    fn publish_breakpoints(&self) {
        self.publisher
            .publish_now(SessionEvent::BreakpointsChanged { breakpoints: self.breakpoints.list() });
    }

    // ----- execution control -----

    /// Resume a paused context until the next breakpoint.
    pub fn resume(&self, context: ExecutionContextId) -> Result<()> {
        self.release(context, ResumeCommand::Continue)
    }

    /// Pause at the next node entry, at any depth.
    pub fn step_into(&self, context: ExecutionContextId) -> Result<()> {
        self.release(context, ResumeCommand::Step(StepKind::Into))
    }

    /// Run the current node's calls with breakpoints muted. Back at the paused
    /// depth, breakpoints apply again: the context pauses at the next one, or
    /// runs to completion.
    pub fn step_over(&self, context: ExecutionContextId) -> Result<()> {
        self.release(context, ResumeCommand::Step(StepKind::Over))
    }

    /// Pause at the next node entry of the caller.
    pub fn step_out(&self, context: ExecutionContextId) -> Result<()> {
        self.release(context, ResumeCommand::Step(StepKind::Out))
    }

    fn release(&self, id: ExecutionContextId, command: ResumeCommand) -> Result<()> {
        let result = self.recorder.lookup(id, Instant::now()).and_then(|context| {
            context.pause.release(command, || {
                self.focus.remove(id);
                self.publisher.publish_now(SessionEvent::Resumed { context: id, command });
            })
        });
        self.report(result)
    }

    /// Expose a paused context to the UI.
    pub fn focus(&self, id: ExecutionContextId) -> Result<PauseInfo> {
        let result = self.recorder.lookup(id, Instant::now()).and_then(|context| {
            if context.pause.is_detached() {
                return Err(DebuggerError::DetachedContext(id));
            }
            let info = context.pause.pause_info().ok_or(DebuggerError::NotPaused(id))?;
            if !self.focus.focus(id) {
                return Err(DebuggerError::NotPaused(id));
            }
            Ok(info)
        });
        self.report(result)
    }

    /// The paused context exposed to the UI, if any.
    pub fn focused(&self) -> Option<PauseInfo> {
        let id = self.focus.focused()?;
        self.recorder.get(id)?.pause.pause_info()
    }

    // ----- inspection -----

    /// Read a pin or variable in a context.
    ///
    /// Reading a frame that is neither live nor retained gives a stale
    /// reading and a warning notice.
    pub fn read_watch(&self, id: ExecutionContextId, watch: &WatchRef) -> Result<WatchReading> {
        let context = self.report(self.recorder.lookup(id, Instant::now()))?;
        let reading = self.watches.read(&context, watch);
        if reading.stale {
            self.publisher.publish_now(SessionEvent::Notice(
                UserNotice::warning(format!("watch {watch} refers to a frame that is no longer live"))
                    .for_context(id),
            ));
        }
        Ok(reading)
    }

    /// Categorized variables of an object.
    pub fn inspect_variables(&self, object: ObjectHandle) -> Result<ObjectVariables> {
        self.report(self.inspector.inspect(object))
    }

    /// Coherent view of the whole session.
    pub fn snapshot(&self) -> SessionSnapshot {
        // Copy the focus state first: never hold the focus lock while taking a pause lock.
        let (focused, paused_queue) = self.focus.snapshot();
        let focused = focused.and_then(|id| self.recorder.get(id)).and_then(|c| c.pause.pause_info());
        SessionSnapshot {
            focused,
            paused_queue,
            breakpoints: self.breakpoints.list(),
            contexts: self.recorder.live().iter().map(|c| c.view()).collect(),
            taken_at: Utc::now(),
        }
    }

    // ----- lifecycle -----

    /// End the session: detach from the VM, abort every paused context and
    /// stop the publisher. Running contexts run to completion unobserved.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(registry) = self.registry.lock().take() {
            registry.unregister_observer();
        }

        let mut aborted = 0;
        for context in self.recorder.live() {
            if context.pause.disarm() {
                aborted += 1;
                self.publisher.publish_now(SessionEvent::Detached {
                    context: context.id,
                    end: ContextEnd::Aborted,
                });
            }
        }
        self.focus.clear();
        self.publisher.shutdown();
        if let Some(ticker) = self.ticker.lock().take() {
            ticker.abort();
        }
        info!(aborted, "Debug session shut down");
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(DebuggerError::SessionClosed)
        } else {
            Ok(())
        }
    }

    /// Publish a command failure as a notice and hand the result back.
    fn report<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            debug!(%err, "Command failed");
            self.publisher.publish_now(SessionEvent::Notice(notice_for(err)));
        }
        result
    }

    // ----- hooks -----

    fn enter(&self, id: ExecutionContextId, node: NodeRef) -> HookOutcome {
        let Some(context) = self.recorder.get(id) else {
            trace!(ctx = %id, "Node entry for an untracked context");
            return HookOutcome::Continue;
        };
        if context.pause.is_detached() {
            return HookOutcome::Abort;
        }
        if self.is_closed() {
            return HookOutcome::Continue;
        }

        let graph = match self.resolve_graph(node.graph) {
            Ok(graph) => Some(graph),
            Err(err) => {
                debug!(ctx = %id, node = %node, %err, "Graph unresolved, breakpoint check skipped");
                None
            }
        };
        let generation = graph.as_ref().map(|g| g.generation);
        let (step, depth) = context.enter(node, graph);

        let stepping = context.pause.check_step(depth);
        if stepping == StepCheck::Muted {
            trace!(ctx = %id, node = %node, depth, "Inside a stepped-over call");
            return HookOutcome::Continue;
        }
        let mut reason = None;
        if let Some(generation) = generation {
            if let Some(entry) = self.breakpoints.lookup(&node) {
                if entry.is_armed_for(generation) && self.condition_holds(&context, &entry) {
                    let hits = entry.record_hit();
                    if entry.gate_allows(hits) {
                        reason = Some(PauseReason::Breakpoint(node));
                    } else {
                        trace!(breakpoint = %node, hits, "Hit gate not reached");
                    }
                }
            }
        }
        if let (None, StepCheck::Pause(kind)) = (&reason, stepping) {
            reason = Some(PauseReason::Step(kind));
        }
        let Some(reason) = reason else {
            return HookOutcome::Continue;
        };

        if let PauseReason::Breakpoint(_) = reason {
            context.record_breakpoint_hit();
        }
        let info = PauseInfo {
            context: id,
            graph: context.graph,
            object: context.object,
            reason,
            node,
            depth,
            step,
            stack: context.stack(),
            paused_at: Utc::now(),
        };
        let outcome = context.pause.pause(info, |info| {
            self.focus.push(id);
            self.publisher.publish_now(SessionEvent::Paused(info.clone()));
        });
        match outcome {
            PauseOutcome::Resumed => HookOutcome::Continue,
            PauseOutcome::Aborted => HookOutcome::Abort,
        }
    }

    /// Evaluate a breakpoint condition. Failures count as false.
    fn condition_holds(&self, context: &ExecutionContext, entry: &BreakpointEntry) -> bool {
        let Some(condition) = &entry.condition else {
            return true;
        };
        let Some(frame) = context.current() else {
            return false;
        };
        match condition.evaluate(&self.watches.frame_scope(context, &frame)) {
            Ok(holds) => holds,
            Err(source) => {
                let err = DebuggerError::ConditionEvaluation { key: entry.key, source };
                warn!(ctx = %context.id, %err, "Breakpoint condition failed, not breaking");
                self.publisher.publish_now(SessionEvent::Notice(
                    UserNotice::warning(err.to_string())
                        .for_context(context.id)
                        .for_breakpoint(entry.key),
                ));
                false
            }
        }
    }

    fn exit(&self, id: ExecutionContextId, node: NodeRef) -> HookOutcome {
        let Some(context) = self.recorder.get(id) else {
            return HookOutcome::Continue;
        };
        if context.pause.is_detached() {
            return HookOutcome::Abort;
        }
        match context.exit(node) {
            Ok(frame) => context.watches.invalidate_node(frame.node.node),
            Err(err) => self.recorder.report_unbalanced(id, node, err),
        }
        HookOutcome::Continue
    }
}

/// Run a hook body, turning a panic into `fallback`.
fn guarded<T>(hook: &'static str, fallback: T, body: impl FnOnce() -> T) -> T {
    match catch_unwind(AssertUnwindSafe(body)) {
        Ok(value) => value,
        Err(_) => {
            error!(hook, "Debugger hook panicked, execution continues undebugged");
            fallback
        }
    }
}

fn notice_for(err: &DebuggerError) -> UserNotice {
    let notice = match err {
        DebuggerError::DetachedContext(_) | DebuggerError::NotPaused(_) => {
            UserNotice::warning(err.to_string())
        }
        _ => UserNotice::error(err.to_string()),
    };
    match err {
        DebuggerError::DetachedContext(id)
        | DebuggerError::UnknownContext(id)
        | DebuggerError::NotPaused(id) => notice.for_context(*id),
        DebuggerError::UnknownBreakpoint(key) | DebuggerError::ConditionEvaluation { key, .. } => {
            notice.for_breakpoint(*key)
        }
        _ => notice,
    }
}

impl ExecutionObserver for DebugSession {
    fn begin_context(&self, context: ExecutionContextId, graph: GraphId, object: ObjectHandle) {
        if self.is_closed() {
            return;
        }
        guarded("begin_context", (), || {
            self.recorder.begin(context, graph, object);
        })
    }

    fn on_node_enter(&self, context: ExecutionContextId, node: NodeRef) -> HookOutcome {
        guarded("on_node_enter", HookOutcome::Continue, || self.enter(context, node))
    }

    fn on_node_exit(&self, context: ExecutionContextId, node: NodeRef) -> HookOutcome {
        guarded("on_node_exit", HookOutcome::Continue, || self.exit(context, node))
    }

    fn end_context(&self, context: ExecutionContextId, end: ContextEnd) {
        guarded("end_context", (), || {
            let Some(ctx) = self.recorder.retire(context, end) else {
                return;
            };
            if ctx.pause.detach(end) {
                self.focus.remove(context);
                self.publisher.publish_now(SessionEvent::Detached { context, end });
            }
            self.publisher.record_end(context, end, ctx.take_progress());
            debug!(ctx = %context, ?end, "Context ended");
        })
    }
}
