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

//! In-memory host: graph assets, objects with reflected properties, pin values
//! and a single observer slot.

use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc,
};

use bpdb_common::types::{
    ExecutionContextId, GraphId, NodeDescriptor, NodeRef, ObjectHandle, PropertyInfo, Value,
};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{AssetResolver, ExecutionObserver, GraphAsset, Reflection, VmHookRegistry};
use crate::{AssetError, ReflectionError};

/// A reflected object of the in-memory host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostObject {
    /// Object name
    pub name: String,
    /// Class name
    pub class: String,
    /// Whether the object lives in a running world
    pub running: bool,
    /// Properties with their current values, in declaration order
    pub properties: Vec<(PropertyInfo, Value)>,
}

impl HostObject {
    /// A running object without properties.
    pub fn new(name: impl Into<String>, class: impl Into<String>) -> Self {
        Self { name: name.into(), class: class.into(), running: true, properties: Vec::new() }
    }

    /// Add a property.
    pub fn with_property(mut self, info: PropertyInfo, value: Value) -> Self {
        self.properties.push((info, value));
        self
    }

    /// Mark the object as living in an editor world.
    pub fn in_editor_world(mut self) -> Self {
        self.running = false;
        self
    }
}

/// Host implementation backed by concurrent maps.
#[derive(Default)]
pub struct MemoryHost {
    graphs: DashMap<GraphId, GraphAsset>,
    objects: DashMap<ObjectHandle, HostObject>,
    pins: DashMap<(ExecutionContextId, NodeRef, String), Value>,
    observer: RwLock<Option<Arc<dyn ExecutionObserver>>>,
    next_context: AtomicU64,
    resolves: AtomicUsize,
    reads: AtomicUsize,
}

impl std::fmt::Debug for MemoryHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryHost")
            .field("graphs", &self.graphs.len())
            .field("objects", &self.objects.len())
            .field("observed", &self.observer.read().is_some())
            .finish()
    }
}

impl MemoryHost {
    /// Create an empty host.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a graph asset. Replacing models a recompile.
    pub fn put_graph(&self, id: GraphId, path: impl Into<String>, nodes: Vec<NodeDescriptor>) {
        self.graphs.insert(id, GraphAsset { path: path.into(), nodes });
    }

    /// Remove a graph asset.
    pub fn remove_graph(&self, id: GraphId) -> bool {
        self.graphs.remove(&id).is_some()
    }

    /// Current structure of a graph, bypassing the resolve counter.
    pub fn graph(&self, id: GraphId) -> Option<GraphAsset> {
        self.graphs.get(&id).map(|g| g.clone())
    }

    /// Add or replace an object.
    pub fn put_object(&self, handle: ObjectHandle, object: HostObject) {
        self.objects.insert(handle, object);
    }

    /// Class and name of an object, as an object reference value.
    pub fn object_value(&self, handle: ObjectHandle) -> Value {
        Value::Object(self.objects.get(&handle).map(|o| bpdb_common::types::ObjectRef {
            name: o.name.clone(),
            class: o.class.clone(),
        }))
    }

    /// Current value of a variable, if the object and property exist.
    pub fn variable(&self, object: ObjectHandle, name: &str) -> Option<Value> {
        let obj = self.objects.get(&object)?;
        obj.properties.iter().find(|(info, _)| info.name == name).map(|(_, v)| v.clone())
    }

    /// Write a variable. Unknown properties are added as uncategorized public ones.
    pub fn set_variable(&self, object: ObjectHandle, name: &str, value: Value) -> bool {
        let Some(mut obj) = self.objects.get_mut(&object) else {
            return false;
        };
        match obj.properties.iter_mut().find(|(info, _)| info.name == name) {
            Some((_, slot)) => *slot = value,
            None => obj.properties.push((PropertyInfo::new(name), value)),
        }
        true
    }

    /// Move an object between running and editor worlds.
    pub fn set_running(&self, object: ObjectHandle, running: bool) {
        if let Some(mut obj) = self.objects.get_mut(&object) {
            obj.running = running;
        }
    }

    /// Record the value a pin holds in a context.
    pub fn set_pin(&self, context: ExecutionContextId, node: NodeRef, pin: &str, value: Value) {
        self.pins.insert((context, node, pin.to_string()), value);
    }

    /// Drop every pin value of a context.
    pub fn clear_pins(&self, context: ExecutionContextId) {
        self.pins.retain(|(ctx, _, _), _| *ctx != context);
    }

    /// Allocate a fresh execution context id.
    pub fn next_context_id(&self) -> ExecutionContextId {
        ExecutionContextId(self.next_context.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Installed observer, if any.
    pub fn observer(&self) -> Option<Arc<dyn ExecutionObserver>> {
        self.observer.read().clone()
    }

    /// Number of asset resolutions served.
    pub fn resolve_count(&self) -> usize {
        self.resolves.load(Ordering::Relaxed)
    }

    /// Number of reflection reads served (variables and pins).
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }
}

impl AssetResolver for MemoryHost {
    fn resolve_graph(&self, graph: GraphId) -> Result<GraphAsset, AssetError> {
        self.resolves.fetch_add(1, Ordering::Relaxed);
        self.graphs.get(&graph).map(|g| g.clone()).ok_or(AssetError::NotFound(graph))
    }
}

impl Reflection for MemoryHost {
    fn read_variable(&self, object: ObjectHandle, name: &str) -> Result<Value, ReflectionError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let obj = self.objects.get(&object).ok_or(ReflectionError::UnknownObject(object))?;
        obj.properties
            .iter()
            .find(|(info, _)| info.name == name)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| ReflectionError::UnknownProperty(name.to_string()))
    }

    fn read_pin(
        &self,
        object: ObjectHandle,
        context: ExecutionContextId,
        node: NodeRef,
        pin: &str,
    ) -> Result<Value, ReflectionError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        if !self.objects.contains_key(&object) {
            return Err(ReflectionError::UnknownObject(object));
        }
        self.pins
            .get(&(context, node, pin.to_string()))
            .map(|v| v.clone())
            .ok_or_else(|| ReflectionError::NoPinValue { pin: pin.to_string() })
    }

    fn properties(&self, object: ObjectHandle) -> Result<Vec<PropertyInfo>, ReflectionError> {
        let obj = self.objects.get(&object).ok_or(ReflectionError::UnknownObject(object))?;
        Ok(obj.properties.iter().map(|(info, _)| info.clone()).collect())
    }

    fn is_in_running_world(&self, object: ObjectHandle) -> bool {
        self.objects.get(&object).is_some_and(|o| o.running)
    }
}

impl VmHookRegistry for MemoryHost {
    fn register_observer(&self, observer: Arc<dyn ExecutionObserver>) {
        debug!("Observer registered");
        *self.observer.write() = Some(observer);
    }

    fn unregister_observer(&self) {
        debug!("Observer unregistered");
        self.observer.write().take();
    }
}
