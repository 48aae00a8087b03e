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

//! Execution trace recorder.
//!
//! One [`ExecutionContext`] exists per live graph invocation. Node entries push
//! an [`ActiveFrame`] and bump the step counter; exits pop it. The frame stack
//! is guarded by a per-context mutex that is never held across a pause, so
//! contexts never contend with each other and the UI can always read a stack.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread::{self, ThreadId},
    time::{Duration, Instant},
};

use bpdb_common::types::{
    ContextEnd, ContextState, ContextTrace, ContextView, ExecutionContextId, FrameView,
    GraphDescriptor, GraphId, NodeId, NodeRef, ObjectHandle, SourceLocation, TraceStats,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::{DebuggerError, PauseController, Progress, Result, TraceSource, WatchCache};

/// A node currently executing in a context.
#[derive(Debug, Clone)]
pub struct ActiveFrame {
    /// Executing node
    pub node: NodeRef,
    /// Descriptor of the node's graph, when it could be resolved
    pub graph: Option<Arc<GraphDescriptor>>,
    /// Step counter value at entry
    pub entered_at_step: u64,
}

impl ActiveFrame {
    /// Display form of the frame at a stack depth.
    pub fn view(&self, depth: usize) -> FrameView {
        let node = self.graph.as_ref().and_then(|g| g.node(self.node.node));
        let mut source = node.map(|n| n.source.clone()).unwrap_or_else(SourceLocation::default);
        if source.graph_path.is_empty() {
            if let Some(graph) = &self.graph {
                source.graph_path = graph.path.clone();
            }
        }
        FrameView {
            node: self.node,
            title: node.map(|n| n.title().to_string()).unwrap_or_else(|| self.node.node.to_string()),
            source,
            depth,
            entered_at_step: self.entered_at_step,
        }
    }

    /// Generation of the frame's graph descriptor.
    pub fn generation(&self) -> Option<u64> {
        self.graph.as_ref().map(|g| g.generation)
    }
}

/// Why an exit hook was ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnbalancedExit {
    /// Nothing is on the stack.
    EmptyStack,
    /// The top frame runs a different node.
    Mismatch {
        /// Node on top of the stack
        expected: NodeRef,
    },
}

#[derive(Debug, Default)]
struct Trace {
    frames: Vec<ActiveFrame>,
    step: u64,
    stats: TraceStats,
    last_exited: Option<(ActiveFrame, Instant)>,
}

/// A live graph invocation.
#[derive(Debug)]
pub struct ExecutionContext {
    /// Context id, supplied by the VM
    pub id: ExecutionContextId,
    /// Graph the invocation started on
    pub graph: GraphId,
    /// Object the invocation runs on
    pub object: ObjectHandle,
    /// Thread that began the invocation
    pub thread: ThreadId,
    /// Pause state machine
    pub pause: PauseController,
    /// Cached watch reads
    pub watches: WatchCache,
    trace: Mutex<Trace>,
    /// Steps already handed to the publisher. Only grows.
    published_steps: AtomicU64,
}

impl ExecutionContext {
    /// Start tracking an invocation on the current thread.
    pub fn new(id: ExecutionContextId, graph: GraphId, object: ObjectHandle) -> Self {
        Self {
            id,
            graph,
            object,
            thread: thread::current().id(),
            pause: PauseController::new(id),
            watches: WatchCache::default(),
            trace: Mutex::new(Trace::default()),
            published_steps: AtomicU64::new(0),
        }
    }

    /// Push a frame. Returns the new step counter and stack depth.
    pub fn enter(&self, node: NodeRef, graph: Option<Arc<GraphDescriptor>>) -> (u64, usize) {
        let mut trace = self.trace.lock();
        trace.step += 1;
        let step = trace.step;
        trace.frames.push(ActiveFrame { node, graph, entered_at_step: step });
        let depth = trace.frames.len();
        trace.stats.steps += 1;
        trace.stats.max_depth = trace.stats.max_depth.max(depth);
        (step, depth)
    }

    /// Pop the frame of `node`. Unbalanced exits leave the stack untouched.
    pub fn exit(&self, node: NodeRef) -> std::result::Result<ActiveFrame, UnbalancedExit> {
        let mut trace = self.trace.lock();
        if let Some(top) = trace.frames.last() {
            if top.node != node {
                return Err(UnbalancedExit::Mismatch { expected: top.node });
            }
        }
        let frame = trace.frames.pop().ok_or(UnbalancedExit::EmptyStack)?;
        trace.last_exited = Some((frame.clone(), Instant::now()));
        Ok(frame)
    }

    /// Count a breakpoint pause.
    pub fn record_breakpoint_hit(&self) {
        self.trace.lock().stats.breakpoint_hits += 1;
    }

    /// Step counter.
    pub fn step(&self) -> u64 {
        self.trace.lock().step
    }

    /// Stack depth.
    pub fn depth(&self) -> usize {
        self.trace.lock().frames.len()
    }

    /// Top of the stack.
    pub fn current(&self) -> Option<ActiveFrame> {
        self.trace.lock().frames.last().cloned()
    }

    /// Innermost live frame running `node` of the given graph-local id.
    pub fn live_frame(&self, node: NodeId) -> Option<ActiveFrame> {
        self.trace.lock().frames.iter().rev().find(|f| f.node.node == node).cloned()
    }

    /// Most recently exited frame, if it exited within `retention`.
    pub fn last_exited(&self, retention: Duration, now: Instant) -> Option<ActiveFrame> {
        let trace = self.trace.lock();
        let (frame, at) = trace.last_exited.as_ref()?;
        (now.saturating_duration_since(*at) <= retention).then(|| frame.clone())
    }

    /// Call stack, outermost first.
    pub fn stack(&self) -> Vec<FrameView> {
        let trace = self.trace.lock();
        trace.frames.iter().enumerate().map(|(i, f)| f.view(i + 1)).collect()
    }

    /// Trace statistics.
    pub fn stats(&self) -> TraceStats {
        self.trace.lock().stats
    }

    /// Digest entry for the publisher.
    pub fn trace(&self) -> ContextTrace {
        let trace = self.trace.lock();
        ContextTrace {
            context: self.id,
            current: trace.frames.last().map(|f| f.node),
            depth: trace.frames.len(),
            stats: trace.stats,
        }
    }

    /// Progress since the last call, or `None` if no node was entered since.
    pub fn take_progress(&self) -> Option<Progress> {
        let trace = self.trace();
        let steps = trace.stats.steps;
        let before = self.published_steps.fetch_max(steps, Ordering::AcqRel);
        (steps > before).then(|| Progress { steps: steps - before, trace })
    }

    /// Snapshot view.
    pub fn view(&self) -> ContextView {
        ContextView {
            id: self.id,
            graph: self.graph,
            object: self.object,
            state: self.pause.state(),
            stack: self.stack(),
            stats: self.stats(),
        }
    }
}

/// Registry of live and recently ended execution contexts.
#[derive(Debug)]
pub struct TraceRecorder {
    live: DashMap<ExecutionContextId, Arc<ExecutionContext>>,
    /// Ended contexts, kept for post-mortem reads until the retention elapses.
    retired: DashMap<ExecutionContextId, (Arc<ExecutionContext>, Instant)>,
    /// How every ended context ended. Outlives `retired`.
    ended: DashMap<ExecutionContextId, ContextEnd>,
    retention: Duration,
}

impl TraceRecorder {
    /// Create a recorder keeping ended contexts for `retention`.
    pub fn new(retention: Duration) -> Self {
        Self { live: DashMap::new(), retired: DashMap::new(), ended: DashMap::new(), retention }
    }

    /// Post-mortem retention.
    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Start tracking a context.
    pub fn begin(
        &self,
        id: ExecutionContextId,
        graph: GraphId,
        object: ObjectHandle,
    ) -> Arc<ExecutionContext> {
        let context = Arc::new(ExecutionContext::new(id, graph, object));
        self.retired.remove(&id);
        self.ended.remove(&id);
        if let Some(previous) = self.live.insert(id, context.clone()) {
            warn!(ctx = %id, "Context id reused while live, replacing");
            previous.pause.detach(ContextEnd::Aborted);
        }
        debug!(ctx = %id, graph = %graph, object = %object, "Context started");
        context
    }

    /// A live context.
    pub fn get(&self, id: ExecutionContextId) -> Option<Arc<ExecutionContext>> {
        self.live.get(&id).map(|c| c.clone())
    }

    /// A live context, or an ended one still within retention.
    pub fn lookup(&self, id: ExecutionContextId, now: Instant) -> Result<Arc<ExecutionContext>> {
        if let Some(context) = self.get(id) {
            return Ok(context);
        }
        self.prune(now);
        if let Some(entry) = self.retired.get(&id) {
            return Ok(entry.0.clone());
        }
        if self.ended.contains_key(&id) {
            Err(DebuggerError::DetachedContext(id))
        } else {
            Err(DebuggerError::UnknownContext(id))
        }
    }

    /// How a context ended, if it has.
    pub fn end_of(&self, id: ExecutionContextId) -> Option<ContextEnd> {
        self.ended.get(&id).map(|e| *e)
    }

    /// Stop tracking a context. It stays readable for the retention period.
    pub fn retire(&self, id: ExecutionContextId, end: ContextEnd) -> Option<Arc<ExecutionContext>> {
        let (_, context) = self.live.remove(&id)?;
        self.ended.insert(id, end);
        self.retired.insert(id, (context.clone(), Instant::now()));
        debug!(ctx = %id, ?end, steps = context.stats().steps, "Context retired");
        Some(context)
    }

    /// Forget ended contexts past retention.
    pub fn prune(&self, now: Instant) {
        self.retired.retain(|_, (_, at)| now.saturating_duration_since(*at) <= self.retention);
    }

    /// Live contexts sorted by id.
    pub fn live(&self) -> Vec<Arc<ExecutionContext>> {
        let mut contexts: Vec<_> = self.live.iter().map(|c| c.value().clone()).collect();
        contexts.sort_by_key(|c| c.id);
        contexts
    }

    /// Paused live contexts sorted by id.
    pub fn paused(&self) -> Vec<Arc<ExecutionContext>> {
        self.live().into_iter().filter(|c| c.pause.state() == ContextState::Paused).collect()
    }

    /// Log an unbalanced exit hook.
    pub fn report_unbalanced(&self, id: ExecutionContextId, node: NodeRef, err: UnbalancedExit) {
        match err {
            UnbalancedExit::EmptyStack => {
                error!(ctx = %id, node = %node, "Node exit with empty stack, ignored")
            }
            UnbalancedExit::Mismatch { expected } => {
                error!(ctx = %id, node = %node, expected = %expected, "Mismatched node exit, ignored")
            }
        }
    }
}

impl TraceSource for TraceRecorder {
    fn drain_progress(&self) -> Vec<Progress> {
        self.live.iter().filter_map(|c| c.value().take_progress()).collect()
    }
}
