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

//! Session publisher.
//!
//! Trace activity is high-frequency: every node entry of every context would
//! otherwise be an event. Node entries only bump their context's own
//! counters; the publisher pulls progress from a [`TraceSource`] and emits at
//! most one [`SessionEvent::Trace`] per interval from a tokio ticker task.
//! Pause and resume transitions bypass the debounce through
//! [`SessionPublisher::publish_now`], which flushes pending progress first so
//! subscribers see trace activity and transitions in order.

use std::{
    collections::{btree_map::Entry, BTreeMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use auto_impl::auto_impl;
use bpdb_common::types::{ContextEnd, ContextTrace, ExecutionContextId, SessionEvent, TraceDigest};
use parking_lot::Mutex;
use tokio::{sync::broadcast, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, trace};

/// Trace activity of one context since it was last published.
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    /// Node entries not yet published
    pub steps: u64,
    /// Latest state of the context
    pub trace: ContextTrace,
}

/// Where the publisher pulls trace progress from.
#[auto_impl(&, Arc, Box)]
pub trait TraceSource: Send + Sync {
    /// Progress of every live context since its last publication. Each step is
    /// reported once.
    fn drain_progress(&self) -> Vec<Progress>;
}

/// Progress of contexts that ended since the last digest; they are no
/// longer visible to the source.
#[derive(Debug, Default)]
struct Pending {
    steps: u64,
    contexts: Vec<ContextTrace>,
    ended: Vec<(ExecutionContextId, ContextEnd)>,
    last_emit: Option<Instant>,
}

fn merge(contexts: &mut BTreeMap<ExecutionContextId, ContextTrace>, trace: ContextTrace) {
    match contexts.entry(trace.context) {
        Entry::Vacant(entry) => {
            entry.insert(trace);
        }
        Entry::Occupied(mut entry) => {
            if trace.stats.steps >= entry.get().stats.steps {
                entry.insert(trace);
            }
        }
    }
}

/// Fan-out of session events to subscribers.
pub struct SessionPublisher {
    events: broadcast::Sender<SessionEvent>,
    shutdown_tx: broadcast::Sender<()>,
    interval: Duration,
    source: Arc<dyn TraceSource>,
    pending: Mutex<Pending>,
    closed: AtomicBool,
}

impl std::fmt::Debug for SessionPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPublisher")
            .field("interval", &self.interval)
            .field("subscribers", &self.events.receiver_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SessionPublisher {
    /// Create a publisher with a debounce interval and channel capacity,
    /// pulling trace progress from `source`.
    pub fn new(interval: Duration, capacity: usize, source: Arc<dyn TraceSource>) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            events,
            shutdown_tx,
            interval: interval.max(Duration::from_millis(1)),
            source,
            pending: Mutex::new(Pending::default()),
            closed: AtomicBool::new(false),
        }
    }

    /// Debounce interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Fold a context end, and its last unpublished progress, into the next digest.
    pub fn record_end(&self, context: ExecutionContextId, end: ContextEnd, progress: Option<Progress>) {
        let mut pending = self.pending.lock();
        if let Some(progress) = progress {
            pending.steps += progress.steps;
            pending.contexts.push(progress.trace);
        }
        pending.ended.push((context, end));
    }

    /// Gather ended-context progress and live progress into one digest.
    fn collect(&self, pending: &mut Pending) -> TraceDigest {
        let mut steps = std::mem::take(&mut pending.steps);
        let mut contexts = BTreeMap::new();
        for trace in pending.contexts.drain(..) {
            merge(&mut contexts, trace);
        }
        for progress in self.source.drain_progress() {
            steps += progress.steps;
            merge(&mut contexts, progress.trace);
        }
        TraceDigest {
            steps,
            contexts: contexts.into_values().collect(),
            ended: std::mem::take(&mut pending.ended),
        }
    }

    /// Emit the pending digest if the interval has elapsed since the last one.
    pub fn tick(&self, now: Instant) -> Option<TraceDigest> {
        let digest = {
            let mut pending = self.pending.lock();
            if pending.last_emit.is_some_and(|at| now.saturating_duration_since(at) < self.interval) {
                return None;
            }
            let digest = self.collect(&mut pending);
            if digest.is_empty() {
                return None;
            }
            pending.last_emit = Some(now);
            digest
        };
        trace!(steps = digest.steps, contexts = digest.contexts.len(), "Publishing trace digest");
        self.send(SessionEvent::Trace(digest.clone()));
        Some(digest)
    }

    /// Emit the pending digest regardless of the interval.
    pub fn flush(&self) -> Option<TraceDigest> {
        let digest = {
            let mut pending = self.pending.lock();
            let digest = self.collect(&mut pending);
            if digest.is_empty() {
                return None;
            }
            pending.last_emit = Some(Instant::now());
            digest
        };
        self.send(SessionEvent::Trace(digest.clone()));
        Some(digest)
    }

    /// Send an event immediately, after flushing pending trace activity.
    pub fn publish_now(&self, event: SessionEvent) {
        self.flush();
        debug!(event = event.name(), "Publishing event");
        self.send(event);
    }

    /// Start the debounce ticker on the current tokio runtime.
    pub fn spawn_ticker(self: &Arc<Self>) -> JoinHandle<()> {
        let publisher = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(publisher.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        publisher.tick(Instant::now());
                    }
                    _ = shutdown_rx.recv() => {
                        publisher.flush();
                        debug!("Publisher ticker stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Stop the ticker. Later events are dropped.
    pub fn shutdown(&self) {
        if self.is_closed() {
            return;
        }
        self.flush();
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown_tx.send(());
    }

    /// Whether [`Self::shutdown`] was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn send(&self, event: SessionEvent) {
        if self.is_closed() {
            return;
        }
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
