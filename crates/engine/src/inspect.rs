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

//! Variable inspector: categorized, change-highlighted view of an object's
//! reflected properties.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::{Duration, Instant},
};

use bpdb_common::{
    types::{
        ObjectHandle, ObjectVariables, PropertyAccess, PropertyInfo, Value, VariableCategory,
        VariableRow,
    },
    DebuggerConfig, VariableVisibility, WhenToShowVariables,
};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::{DebuggerError, Reflection, ReflectionError, Result};

/// Category of properties declared without `Category` metadata.
pub const HIDDEN_CATEGORY: &str = "Private Implementation Variables";

#[derive(Debug, Clone, Copy)]
struct Memo {
    hash: u64,
    changed_at: Option<Instant>,
}

/// Builds [`ObjectVariables`] and remembers value hashes between calls.
pub struct VariableInspector {
    reflection: Arc<dyn Reflection>,
    when_to_show: WhenToShowVariables,
    visibility: VariableVisibility,
    show_hidden: bool,
    highlight: Option<Duration>,
    max_struct_depth: usize,
    memo: Mutex<HashMap<(ObjectHandle, String), Memo>>,
}

impl std::fmt::Debug for VariableInspector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VariableInspector")
            .field("when_to_show", &self.when_to_show)
            .field("visibility", &self.visibility)
            .field("tracked", &self.memo.lock().len())
            .finish()
    }
}

impl VariableInspector {
    /// Create an inspector with the display settings of `config`.
    pub fn new(reflection: Arc<dyn Reflection>, config: &DebuggerConfig) -> Self {
        Self {
            reflection,
            when_to_show: config.when_to_show_variables,
            visibility: config.visibility,
            show_hidden: config.show_hidden_implementation_variables,
            highlight: config.highlight_changed_values.then(|| config.highlight_duration()),
            max_struct_depth: config.max_struct_depth,
            memo: Mutex::new(HashMap::new()),
        }
    }

    /// Inspect an object now.
    pub fn inspect(&self, object: ObjectHandle) -> Result<ObjectVariables> {
        self.inspect_at(object, Instant::now())
    }

    /// Inspect an object as of `now`.
    pub fn inspect_at(&self, object: ObjectHandle, now: Instant) -> Result<ObjectVariables> {
        let running = self.reflection.is_in_running_world(object);
        if !running && self.when_to_show == WhenToShowVariables::OnlyWhenRunning {
            trace!(%object, "Object not in a running world, variables hidden");
            return Ok(ObjectVariables { object, running, categories: Vec::new() });
        }

        let properties = self.reflection.properties(object).map_err(|source| {
            DebuggerError::ReflectionRead { target: object.to_string(), source }
        })?;

        let mut categories: BTreeMap<String, VariableCategory> = BTreeMap::new();
        for info in properties.iter().filter(|p| self.is_visible(p)) {
            let (name, advanced) = match &info.category {
                Some(category) => (category.replace('|', " "), false),
                None => (HIDDEN_CATEGORY.to_string(), true),
            };
            if advanced && !self.show_hidden {
                continue;
            }

            let value = match self.reflection.read_variable(object, &info.name) {
                Ok(value) => value,
                Err(ReflectionError::Inaccessible { type_name, .. }) => Value::Opaque { type_name },
                Err(err) => {
                    debug!(%object, property = %info.name, %err, "Property read failed");
                    Value::Unset
                }
            };

            let category = categories.entry(name.clone()).or_insert_with(|| VariableCategory {
                name,
                advanced,
                rows: Vec::new(),
            });
            self.push_rows(object, &info.name, &info.name, &value, 0, now, &mut category.rows);
        }

        Ok(ObjectVariables { object, running, categories: categories.into_values().collect() })
    }

    /// Forget the change history of an object.
    pub fn forget(&self, object: ObjectHandle) {
        self.memo.lock().retain(|(o, _), _| *o != object);
    }

    fn is_visible(&self, info: &PropertyInfo) -> bool {
        if !info.graph_visible {
            return false;
        }
        match self.visibility {
            VariableVisibility::PublicOnly => info.access == PropertyAccess::Public,
            VariableVisibility::PublicAndProtected => info.access != PropertyAccess::Private,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn push_rows(
        &self,
        object: ObjectHandle,
        path: &str,
        name: &str,
        value: &Value,
        depth: usize,
        now: Instant,
        rows: &mut Vec<VariableRow>,
    ) {
        let hash = value.value_hash();
        rows.push(VariableRow {
            path: path.to_string(),
            name: name.to_string(),
            depth,
            type_name: value.type_name().to_string(),
            display: value.to_string(),
            hash,
            highlight: self.highlight(object, path, hash, now),
        });

        if let Value::Struct { fields, .. } = value {
            if depth + 1 < self.max_struct_depth {
                for (field, child) in fields {
                    let child_path = format!("{path}.{field}");
                    self.push_rows(object, &child_path, field, child, depth + 1, now, rows);
                }
            }
        }
    }

    /// Record the hash of a row and return its highlight intensity.
    fn highlight(&self, object: ObjectHandle, path: &str, hash: u64, now: Instant) -> f32 {
        let mut memo = self.memo.lock();
        let entry = memo
            .entry((object, path.to_string()))
            .or_insert(Memo { hash, changed_at: None });
        if entry.hash != hash {
            entry.hash = hash;
            entry.changed_at = Some(now);
        }

        let (Some(duration), Some(changed_at)) = (self.highlight, entry.changed_at) else {
            return 0.0;
        };
        if duration.is_zero() {
            return 0.0;
        }
        let elapsed = now.saturating_duration_since(changed_at).as_secs_f32();
        (1.0 - elapsed / duration.as_secs_f32()).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HostObject, MemoryHost};

    fn door() -> HostObject {
        HostObject::new("Door_1", "BP_Door_C")
            .with_property(PropertyInfo::new("Open").with_category("State"), Value::Bool(false))
            .with_property(
                PropertyInfo::new("Stats").with_category("Gameplay|Combat"),
                Value::Struct {
                    type_name: "FStats".into(),
                    fields: vec![
                        ("Health".into(), Value::Int(10)),
                        (
                            "Inner".into(),
                            Value::Struct {
                                type_name: "FInner".into(),
                                fields: vec![("Deep".into(), Value::Int(1))],
                            },
                        ),
                    ],
                },
            )
            .with_property(
                PropertyInfo::new("Secret")
                    .with_category("State")
                    .with_access(PropertyAccess::Protected),
                Value::Int(5),
            )
            .with_property(PropertyInfo::new("Scratch"), Value::String("a\nb".into()))
    }

    fn inspector(host: &Arc<MemoryHost>, config: DebuggerConfig) -> VariableInspector {
        VariableInspector::new(host.clone(), &config)
    }

    #[test]
    fn test_categories_and_visibility() {
        let host = Arc::new(MemoryHost::new());
        host.put_object(ObjectHandle(1), door());

        let view = inspector(&host, DebuggerConfig::default()).inspect(ObjectHandle(1)).unwrap();
        let names: Vec<_> = view.categories.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Gameplay Combat", "State"]);
        assert!(view.row("Secret").is_none());
        assert!(view.row("Scratch").is_none());
        assert_eq!(view.row("Stats.Health").unwrap().depth, 1);
        assert_eq!(view.row("Stats").unwrap().display, "");

        let config = DebuggerConfig::default()
            .with_visibility(VariableVisibility::PublicAndProtected)
            .with_hidden_implementation_variables(true);
        let view = inspector(&host, config).inspect(ObjectHandle(1)).unwrap();
        assert!(view.row("Secret").is_some());
        let hidden = view.categories.iter().find(|c| c.name == HIDDEN_CATEGORY).unwrap();
        assert!(hidden.advanced);
        assert_eq!(hidden.rows[0].display, "a b");
    }

    #[test]
    fn test_struct_depth_limit() {
        let host = Arc::new(MemoryHost::new());
        host.put_object(ObjectHandle(1), door());
        let mut config = DebuggerConfig::default();
        config.max_struct_depth = 2;
        let view = inspector(&host, config).inspect(ObjectHandle(1)).unwrap();
        assert!(view.row("Stats.Inner").is_some());
        assert!(view.row("Stats.Inner.Deep").is_none());
    }

    #[test]
    fn test_editor_world_objects_hidden() {
        let host = Arc::new(MemoryHost::new());
        host.put_object(ObjectHandle(1), door().in_editor_world());
        let view = inspector(&host, DebuggerConfig::default()).inspect(ObjectHandle(1)).unwrap();
        assert!(!view.running);
        assert!(view.categories.is_empty());

        let config = DebuggerConfig::default().with_when_to_show_variables(WhenToShowVariables::Always);
        let view = inspector(&host, config).inspect(ObjectHandle(1)).unwrap();
        assert!(!view.categories.is_empty());
    }

    #[test]
    fn test_change_highlight_decays() {
        let host = Arc::new(MemoryHost::new());
        host.put_object(ObjectHandle(1), door());
        let inspector = inspector(&host, DebuggerConfig::default());
        let t0 = Instant::now();

        let first = inspector.inspect_at(ObjectHandle(1), t0).unwrap();
        assert_eq!(first.row("Open").unwrap().highlight, 0.0, "first sight is not a change");

        host.set_variable(ObjectHandle(1), "Open", Value::Bool(true));
        let changed = inspector.inspect_at(ObjectHandle(1), t0).unwrap();
        assert_eq!(changed.row("Open").unwrap().highlight, 1.0);
        assert_eq!(changed.row("Stats").unwrap().highlight, 0.0);

        let half = inspector.inspect_at(ObjectHandle(1), t0 + Duration::from_millis(1000)).unwrap();
        let h = half.row("Open").unwrap().highlight;
        assert!((h - 0.5).abs() < 1e-3, "highlight was {h}");

        let faded = inspector.inspect_at(ObjectHandle(1), t0 + Duration::from_secs(5)).unwrap();
        assert_eq!(faded.row("Open").unwrap().highlight, 0.0);
    }

    #[test]
    fn test_unknown_object() {
        let host = Arc::new(MemoryHost::new());
        let config = DebuggerConfig::default().with_when_to_show_variables(WhenToShowVariables::Always);
        let err = inspector(&host, config).inspect(ObjectHandle(7)).unwrap_err();
        assert!(matches!(err, DebuggerError::ReflectionRead { .. }));
    }
}
