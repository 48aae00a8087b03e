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

//! Watch evaluation.
//!
//! A watch reads a pin of a node or a variable of the context's object through
//! the host's reflection layer. Reads are only meaningful while the frame they
//! refer to is live (on the stack of a paused context) or was the last frame
//! to exit, within the post-mortem retention. Anything else reads as stale.
//!
//! Readings are cached per context keyed by step counter: repeated UI refreshes
//! at the same step cost one reflection call.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use bpdb_common::types::{ContextState, NodeId, NodeRef, Value, WatchReading, WatchRef};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::{
    ActiveFrame, ConditionError, ConditionScope, ExecutionContext, Reflection, ReflectionError,
};

#[derive(Debug, Clone)]
struct CachedRead {
    post_mortem: bool,
    reading: WatchReading,
}

/// Per-context cache of watch readings.
#[derive(Debug, Default)]
pub struct WatchCache {
    entries: Mutex<HashMap<WatchRef, CachedRead>>,
}

impl WatchCache {
    /// Cached reading taken at `step` in the same liveness mode.
    pub fn get(&self, watch: &WatchRef, step: u64, post_mortem: bool) -> Option<WatchReading> {
        let entries = self.entries.lock();
        let cached = entries.get(watch)?;
        (cached.reading.step == step && cached.post_mortem == post_mortem)
            .then(|| cached.reading.clone())
    }

    /// Store a reading.
    pub fn put(&self, watch: WatchRef, reading: WatchReading) {
        let post_mortem = reading.post_mortem;
        self.entries.lock().insert(watch, CachedRead { post_mortem, reading });
    }

    /// Drop the readings of a node's pins. Called when the node's frame exits.
    pub fn invalidate_node(&self, node: NodeId) {
        self.entries
            .lock()
            .retain(|watch, _| !matches!(watch, WatchRef::Pin { node: n, .. } if *n == node));
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of cached readings.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Where a watch is read from.
enum Target<'a> {
    /// A pin of a live or post-mortem frame.
    Pin(NodeRef, &'a str),
    /// A variable of the context's object.
    Variable(&'a str),
}

/// Reads watches through the host's reflection layer.
pub struct WatchEvaluator {
    reflection: Arc<dyn Reflection>,
    retention: Duration,
}

impl std::fmt::Debug for WatchEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchEvaluator").field("retention", &self.retention).finish()
    }
}

impl WatchEvaluator {
    /// Create an evaluator with a post-mortem retention.
    pub fn new(reflection: Arc<dyn Reflection>, retention: Duration) -> Self {
        Self { reflection, retention }
    }

    /// Read a watch now.
    pub fn read(&self, context: &ExecutionContext, watch: &WatchRef) -> WatchReading {
        self.read_at(context, watch, Instant::now())
    }

    /// Read a watch as of `now`.
    pub fn read_at(&self, context: &ExecutionContext, watch: &WatchRef, now: Instant) -> WatchReading {
        let step = context.step();
        let paused = context.pause.state() == ContextState::Paused;

        let (target, post_mortem) = match watch {
            WatchRef::Pin { node, pin } => {
                let live = if paused { context.live_frame(*node) } else { None };
                match live {
                    Some(frame) => (Target::Pin(frame.node, pin), false),
                    None => match context.last_exited(self.retention, now) {
                        Some(frame) if frame.node.node == *node => (Target::Pin(frame.node, pin), true),
                        _ => return WatchReading::stale(step),
                    },
                }
            }
            WatchRef::Variable { name } => {
                if paused {
                    (Target::Variable(name), false)
                } else if context.last_exited(self.retention, now).is_some() {
                    (Target::Variable(name), true)
                } else {
                    return WatchReading::stale(step);
                }
            }
        };

        if let Some(cached) = context.watches.get(watch, step, post_mortem) {
            trace!(ctx = %context.id, %watch, step, "Watch served from cache");
            return cached;
        }

        let result = match target {
            Target::Pin(node, pin) => self.reflection.read_pin(context.object, context.id, node, pin),
            Target::Variable(name) => self.reflection.read_variable(context.object, name),
        };
        let value = degrade(watch, result);

        let reading = WatchReading { value, step, stale: false, post_mortem };
        context.watches.put(watch.clone(), reading.clone());
        reading
    }

    /// Name resolution for a condition evaluated against a frame about to execute.
    pub fn frame_scope<'a>(
        &'a self,
        context: &'a ExecutionContext,
        frame: &'a ActiveFrame,
    ) -> FrameScope<'a> {
        FrameScope { reflection: self.reflection.as_ref(), context, frame }
    }
}

/// Map a reflection result to a displayable value. Nothing here fails.
fn degrade(watch: &WatchRef, result: Result<Value, ReflectionError>) -> Value {
    match result {
        Ok(value) => value,
        Err(ReflectionError::Inaccessible { type_name, .. }) => Value::Opaque { type_name },
        Err(ReflectionError::NoPinValue { .. }) => Value::Unset,
        Err(err) => {
            debug!(%watch, %err, "Watch read failed");
            Value::Unset
        }
    }
}

/// [`ConditionScope`] over the frame about to execute.
pub struct FrameScope<'a> {
    reflection: &'a dyn Reflection,
    context: &'a ExecutionContext,
    frame: &'a ActiveFrame,
}

impl ConditionScope for FrameScope<'_> {
    fn pin(&self, name: &str) -> Result<Value, ConditionError> {
        if let Some(graph) = &self.frame.graph {
            let declared = graph.node(self.frame.node.node).is_some_and(|n| n.pin(name).is_some());
            if !declared {
                return Err(ConditionError::UnknownName(name.to_string()));
            }
        }
        match self.reflection.read_pin(self.context.object, self.context.id, self.frame.node, name) {
            Ok(value) => Ok(value),
            Err(ReflectionError::NoPinValue { .. }) => Ok(Value::Unset),
            Err(err) => Err(ConditionError::Read { name: name.to_string(), reason: err.to_string() }),
        }
    }

    fn variable(&self, name: &str) -> Result<Value, ConditionError> {
        match self.reflection.read_variable(self.context.object, name) {
            Ok(value) => Ok(value),
            Err(ReflectionError::UnknownProperty(_)) => {
                Err(ConditionError::UnknownName(format!("var.{name}")))
            }
            Err(err) => Err(ConditionError::Read { name: format!("var.{name}"), reason: err.to_string() }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HostObject, MemoryHost};
    use bpdb_common::types::{
        ExecutionContextId, GraphDescriptor, GraphId, NodeDescriptor, NodeKind, ObjectHandle,
        PinDescriptor, PinType, PropertyInfo,
    };

    fn setup() -> (Arc<MemoryHost>, WatchEvaluator, ExecutionContext) {
        let host = Arc::new(MemoryHost::new());
        host.put_object(
            ObjectHandle(1),
            HostObject::new("Door_1", "BP_Door_C")
                .with_property(PropertyInfo::new("Health"), Value::Int(3)),
        );
        let evaluator = WatchEvaluator::new(host.clone(), Duration::from_secs(60));
        let context = ExecutionContext::new(ExecutionContextId(1), GraphId(1), ObjectHandle(1));
        (host, evaluator, context)
    }

    #[test]
    fn test_running_context_reads_stale() {
        let (_, evaluator, context) = setup();
        let reading = evaluator.read(&context, &WatchRef::variable("Health"));
        assert!(reading.stale);
        assert_eq!(reading.value, Value::Unset);
    }

    #[test]
    fn test_post_mortem_pin_read() {
        let (host, evaluator, context) = setup();
        let node = NodeRef::new(GraphId(1), NodeId(5));
        context.enter(node, None);
        host.set_pin(context.id, node, "Value", Value::Int(9));
        context.exit(node).unwrap();

        let watch = WatchRef::pin(NodeId(5), "Value");
        let reading = evaluator.read(&context, &watch);
        assert!(reading.post_mortem);
        assert!(!reading.stale);
        assert_eq!(reading.value, Value::Int(9));

        let reads = host.read_count();
        evaluator.read(&context, &watch);
        assert_eq!(host.read_count(), reads, "same step is served from the cache");

        context.watches.invalidate_node(NodeId(5));
        assert!(context.watches.is_empty());

        let expired = evaluator.read_at(&context, &watch, Instant::now() + Duration::from_secs(120));
        assert!(expired.stale);

        let other = evaluator.read(&context, &WatchRef::pin(NodeId(6), "Value"));
        assert!(other.stale);
    }

    #[test]
    fn test_degrade() {
        let watch = WatchRef::variable("Secret");
        let opaque = degrade(
            &watch,
            Err(ReflectionError::Inaccessible { name: "Secret".into(), type_name: "FHandle".into() }),
        );
        assert_eq!(opaque, Value::Opaque { type_name: "FHandle".into() });
        assert_eq!(degrade(&watch, Err(ReflectionError::UnknownProperty("Secret".into()))), Value::Unset);
    }

    #[test]
    fn test_frame_scope() {
        let (host, evaluator, context) = setup();
        let graph = Arc::new(
            GraphDescriptor::new(
                GraphId(1),
                "/Game/BP_Door",
                0,
                vec![NodeDescriptor::new(NodeId(1), NodeKind::Branch)
                    .with_pin(PinDescriptor::input("Condition", PinType::Bool))],
            )
            .unwrap(),
        );
        let node = NodeRef::new(GraphId(1), NodeId(1));
        context.enter(node, Some(graph));
        let frame = context.current().unwrap();
        let scope = evaluator.frame_scope(&context, &frame);

        assert_eq!(scope.pin("Condition"), Ok(Value::Unset));
        host.set_pin(context.id, node, "Condition", Value::Bool(true));
        assert_eq!(scope.pin("Condition"), Ok(Value::Bool(true)));
        assert_eq!(scope.pin("Other"), Err(ConditionError::UnknownName("Other".into())));
        assert_eq!(scope.variable("Health"), Ok(Value::Int(3)));
        assert_eq!(scope.variable("Armor"), Err(ConditionError::UnknownName("var.Armor".into())));
    }
}
