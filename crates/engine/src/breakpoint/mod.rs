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

//! Breakpoint table.
//!
//! The table is a persistent hash trie behind a read-write lock. Readers (VM
//! threads, on every node entry) take the read lock just long enough to clone
//! an `Arc` out of the trie; writers (user commands) build a new trie from the
//! current one and swap it in, so a reader never sees a half-updated entry.
//! Entries are immutable once published except for their hit counter, which
//! is an atomic shared by every rewrite of the same breakpoint.

use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc,
};

use bpdb_common::types::{Breakpoint, BreakpointKey, GraphDescriptor, GraphId, HitCondition};
use parking_lot::RwLock;
use rpds::HashTrieMapSync;
use tracing::{debug, info};

mod condition;
pub use condition::*;

/// Runtime state of one breakpoint.
#[derive(Debug)]
pub struct BreakpointEntry {
    /// Location
    pub key: BreakpointKey,
    /// Armed by the user
    pub enabled: bool,
    /// Parsed condition, if any
    pub condition: Option<Arc<Condition>>,
    /// Hit-count gate, if any
    pub hit_condition: Option<HitCondition>,
    /// Node could not be matched after the graph was re-indexed
    pub orphaned: bool,
    /// Graph generation the entry was validated against
    pub generation: u64,
    hits: Arc<AtomicU64>,
}

impl BreakpointEntry {
    /// Whether the entry can fire for a frame of the given graph generation.
    pub fn is_armed_for(&self, generation: u64) -> bool {
        self.enabled && !self.orphaned && self.generation == generation
    }

    /// Count a hit and return the new total.
    pub fn record_hit(&self) -> u64 {
        self.hits.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Hits so far.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Whether hit number `hits` passes the gate.
    pub fn gate_allows(&self, hits: u64) -> bool {
        self.hit_condition.is_none_or(|gate| gate.allows(hits))
    }

    /// Serializable view.
    pub fn view(&self) -> Breakpoint {
        Breakpoint {
            key: self.key,
            enabled: self.enabled,
            condition: self.condition.as_ref().map(|c| c.source().to_string()),
            hit_condition: self.hit_condition,
            hit_count: self.hits(),
            orphaned: self.orphaned,
            generation: self.generation,
        }
    }

    fn armed(&self) -> bool {
        self.enabled && !self.orphaned
    }

    fn is_stale_for(&self, generation: u64) -> bool {
        self.generation <= generation && (self.orphaned || self.generation < generation)
    }

    fn rewrite(&self, f: impl FnOnce(&mut Self)) -> Self {
        let mut next = Self {
            key: self.key,
            enabled: self.enabled,
            condition: self.condition.clone(),
            hit_condition: self.hit_condition,
            orphaned: self.orphaned,
            generation: self.generation,
            hits: self.hits.clone(),
        };
        f(&mut next);
        next
    }
}

/// What [`BreakpointTable::set`] installs.
#[derive(Debug, Clone)]
pub struct BreakpointSpec {
    /// Location
    pub key: BreakpointKey,
    /// Armed
    pub enabled: bool,
    /// Parsed condition
    pub condition: Option<Condition>,
    /// Hit-count gate
    pub hit_condition: Option<HitCondition>,
    /// Graph generation the location was validated against
    pub generation: u64,
    /// The location could not be validated
    pub orphaned: bool,
}

type Entries = HashTrieMapSync<BreakpointKey, Arc<BreakpointEntry>>;

/// Outcome of re-validating a graph's orphaned breakpoints.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Revalidation {
    /// Breakpoints whose node still exists, now armed at the new generation
    pub rearmed: Vec<BreakpointKey>,
    /// Breakpoints whose node is gone
    pub still_orphaned: Vec<BreakpointKey>,
}

/// Process-wide registry of breakpoints keyed by (graph, node).
#[derive(Debug, Default)]
pub struct BreakpointTable {
    entries: RwLock<Entries>,
    /// Number of enabled, non-orphaned entries. Lets lookups skip the lock when zero.
    armed: AtomicUsize,
}

impl BreakpointTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Hot-path lookup.
    pub fn lookup(&self, key: &BreakpointKey) -> Option<Arc<BreakpointEntry>> {
        if self.armed.load(Ordering::Acquire) == 0 {
            return None;
        }
        self.entries.read().get(key).cloned()
    }

    /// Lookup regardless of armed state.
    pub fn get(&self, key: &BreakpointKey) -> Option<Arc<BreakpointEntry>> {
        self.entries.read().get(key).cloned()
    }

    /// Install or replace a breakpoint. The hit counter survives replacement.
    pub fn set(&self, spec: BreakpointSpec) -> Breakpoint {
        self.update(|entries| {
            let hits = entries
                .get(&spec.key)
                .map(|e| e.hits.clone())
                .unwrap_or_else(|| Arc::new(AtomicU64::new(0)));
            let entry = Arc::new(BreakpointEntry {
                key: spec.key,
                enabled: spec.enabled,
                condition: spec.condition.map(Arc::new),
                hit_condition: spec.hit_condition,
                orphaned: spec.orphaned,
                generation: spec.generation,
                hits,
            });
            let view = entry.view();
            entries.insert_mut(spec.key, entry);
            view
        })
    }

    /// Remove a breakpoint.
    pub fn clear(&self, key: &BreakpointKey) -> Option<Breakpoint> {
        self.update(|entries| {
            let removed = entries.get(key).map(|e| e.view());
            entries.remove_mut(key);
            removed
        })
    }

    /// Enable or disable a breakpoint.
    pub fn set_enabled(&self, key: &BreakpointKey, enabled: bool) -> Option<Breakpoint> {
        self.rewrite_one(key, |e| e.enabled = enabled)
    }

    /// All breakpoints, sorted by location.
    pub fn list(&self) -> Vec<Breakpoint> {
        let entries = self.entries.read().clone();
        let mut list: Vec<_> = entries.values().map(|e| e.view()).collect();
        list.sort_by_key(|bp| bp.key);
        list
    }

    /// Number of breakpoints.
    pub fn len(&self) -> usize {
        self.entries.read().size()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flag every breakpoint of a graph as orphaned. Returns the keys that were
    /// not orphaned before.
    pub fn orphan_graph(&self, graph: GraphId) -> Vec<BreakpointKey> {
        let orphaned = self.update(|entries| {
            let targets: Vec<_> = entries
                .values()
                .filter(|e| e.key.graph == graph && !e.orphaned)
                .cloned()
                .collect();
            for entry in &targets {
                entries.insert_mut(entry.key, Arc::new(entry.rewrite(|e| e.orphaned = true)));
            }
            let mut keys: Vec<_> = targets.iter().map(|e| e.key).collect();
            keys.sort();
            keys
        });
        if !orphaned.is_empty() {
            info!(graph = %graph, count = orphaned.len(), "Breakpoints orphaned");
        }
        orphaned
    }

    /// Whether a freshly built descriptor of `graph` at `generation` has
    /// breakpoints to re-validate: orphaned ones, or ones validated against an
    /// older build.
    pub fn needs_revalidation(&self, graph: GraphId, generation: u64) -> bool {
        self.entries.read().values().any(|e| e.key.graph == graph && e.is_stale_for(generation))
    }

    /// Re-validate a graph's breakpoints against a freshly built descriptor:
    /// orphaned or outdated entries whose node survived are re-armed at its
    /// generation, the others are orphaned. Entries already validated against a
    /// newer build are left alone, so a late re-validation never rolls back.
    pub fn revalidate(&self, graph: &GraphDescriptor) -> Revalidation {
        let generation = graph.generation;
        let outcome = self.update(|entries| {
            let mut outcome = Revalidation::default();
            let targets: Vec<_> = entries
                .values()
                .filter(|e| e.key.graph == graph.id && e.is_stale_for(generation))
                .cloned()
                .collect();
            for entry in targets {
                if graph.contains(entry.key.node) {
                    entries.insert_mut(
                        entry.key,
                        Arc::new(entry.rewrite(|e| {
                            e.orphaned = false;
                            e.generation = generation;
                        })),
                    );
                    outcome.rearmed.push(entry.key);
                } else {
                    if !entry.orphaned {
                        entries.insert_mut(entry.key, Arc::new(entry.rewrite(|e| e.orphaned = true)));
                    }
                    outcome.still_orphaned.push(entry.key);
                }
            }
            outcome.rearmed.sort();
            outcome.still_orphaned.sort();
            outcome
        });
        debug!(
            graph = %graph.id,
            generation,
            rearmed = outcome.rearmed.len(),
            still_orphaned = outcome.still_orphaned.len(),
            "Revalidated breakpoints"
        );
        outcome
    }

    /// Remove every orphaned breakpoint.
    pub fn remove_orphaned(&self) -> Vec<BreakpointKey> {
        self.update(|entries| {
            let mut keys: Vec<_> = entries.values().filter(|e| e.orphaned).map(|e| e.key).collect();
            keys.sort();
            for key in &keys {
                entries.remove_mut(key);
            }
            keys
        })
    }

    /// Remove everything.
    pub fn clear_all(&self) {
        self.update(|entries| *entries = Entries::new_sync());
    }

    fn rewrite_one(
        &self,
        key: &BreakpointKey,
        f: impl FnOnce(&mut BreakpointEntry),
    ) -> Option<Breakpoint> {
        self.update(|entries| {
            let next = Arc::new(entries.get(key)?.rewrite(f));
            let view = next.view();
            entries.insert_mut(*key, next);
            Some(view)
        })
    }

    /// Copy-on-write update: mutate a private copy, then publish it.
    fn update<T>(&self, f: impl FnOnce(&mut Entries) -> T) -> T {
        let mut guard = self.entries.write();
        let mut next = guard.clone();
        let result = f(&mut next);
        let armed = next.values().filter(|e| e.armed()).count();
        *guard = next;
        self.armed.store(armed, Ordering::Release);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bpdb_common::types::{NodeDescriptor, NodeId, NodeKind, NodeRef};

    fn key(node: u128) -> BreakpointKey {
        NodeRef::new(GraphId(1), NodeId(node))
    }

    fn spec(node: u128) -> BreakpointSpec {
        BreakpointSpec {
            key: key(node),
            enabled: true,
            condition: None,
            hit_condition: None,
            generation: 0,
            orphaned: false,
        }
    }

    #[test]
    fn test_set_lookup_clear() {
        let table = BreakpointTable::new();
        assert!(table.lookup(&key(1)).is_none());
        table.set(spec(1));
        let entry = table.lookup(&key(1)).unwrap();
        assert!(entry.is_armed_for(0));
        assert!(!entry.is_armed_for(1));
        assert_eq!(table.len(), 1);
        assert!(table.clear(&key(1)).is_some());
        assert!(table.clear(&key(1)).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_disabled_table_skips_lookup() {
        let table = BreakpointTable::new();
        table.set(spec(1));
        table.set_enabled(&key(1), false).unwrap();
        assert!(table.lookup(&key(1)).is_none());
        assert!(table.get(&key(1)).is_some());
        table.set_enabled(&key(1), true).unwrap();
        assert!(table.lookup(&key(1)).is_some());
        assert!(table.set_enabled(&key(9), true).is_none());
    }

    #[test]
    fn test_hits_survive_rewrites() {
        let table = BreakpointTable::new();
        table.set(spec(1));
        let entry = table.lookup(&key(1)).unwrap();
        assert_eq!(entry.record_hit(), 1);
        assert_eq!(entry.record_hit(), 2);
        table.set_enabled(&key(1), false);
        table.set(BreakpointSpec { condition: Some(Condition::parse("Open").unwrap()), ..spec(1) });
        let view = table.list().pop().unwrap();
        assert_eq!(view.hit_count, 2);
        assert!(view.enabled);
        assert_eq!(view.condition.as_deref(), Some("Open"));
        // The reader's old snapshot is untouched.
        assert!(entry.condition.is_none());
    }

    #[test]
    fn test_gate() {
        let table = BreakpointTable::new();
        table.set(BreakpointSpec { hit_condition: Some(HitCondition::Equal(2)), ..spec(1) });
        let entry = table.lookup(&key(1)).unwrap();
        assert!(!entry.gate_allows(1));
        assert!(entry.gate_allows(2));
        table.set(spec(2));
        assert!(table.lookup(&key(2)).unwrap().gate_allows(1));
    }

    #[test]
    fn test_orphan_and_revalidate() {
        let table = BreakpointTable::new();
        table.set(spec(1));
        table.set(spec(2));
        table.set(BreakpointSpec { key: NodeRef::new(GraphId(2), NodeId(1)), ..spec(1) });

        assert_eq!(table.orphan_graph(GraphId(1)), vec![key(1), key(2)]);
        assert!(table.orphan_graph(GraphId(1)).is_empty());
        assert!(table.needs_revalidation(GraphId(1), 0));
        assert!(!table.needs_revalidation(GraphId(2), 0));
        assert!(table.needs_revalidation(GraphId(2), 1), "armed at an older build");
        assert!(table.lookup(&key(1)).is_none_or(|e| !e.is_armed_for(0)));
        assert_eq!(table.len(), 3, "orphaned breakpoints are kept");

        let rebuilt = GraphDescriptor::new(
            GraphId(1),
            "/Game/BP",
            1,
            vec![NodeDescriptor::new(NodeId(1), NodeKind::Event)],
        )
        .unwrap();
        let outcome = table.revalidate(&rebuilt);
        assert_eq!(outcome.rearmed, vec![key(1)]);
        assert_eq!(outcome.still_orphaned, vec![key(2)]);
        assert!(table.lookup(&key(1)).unwrap().is_armed_for(1));

        assert_eq!(table.remove_orphaned(), vec![key(2)]);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_late_revalidation_never_rolls_back() {
        let table = BreakpointTable::new();
        table.set(spec(1));
        let build = |generation| {
            GraphDescriptor::new(
                GraphId(1),
                "/Game/BP",
                generation,
                vec![NodeDescriptor::new(NodeId(1), NodeKind::Event)],
            )
            .unwrap()
        };

        table.orphan_graph(GraphId(1));
        assert_eq!(table.revalidate(&build(2)).rearmed, vec![key(1)]);
        // A slower thread finishing with the build before it.
        assert_eq!(table.revalidate(&build(1)), Revalidation::default());
        assert!(table.lookup(&key(1)).unwrap().is_armed_for(2));
        assert!(!table.needs_revalidation(GraphId(1), 2));

        // An armed entry from an older build whose node is gone gets orphaned.
        let empty = GraphDescriptor::new(GraphId(1), "/Game/BP", 3, Vec::new()).unwrap();
        assert_eq!(table.revalidate(&empty).still_orphaned, vec![key(1)]);
        assert!(table.get(&key(1)).unwrap().orphaned);
    }

    #[test]
    fn test_list_is_sorted() {
        let table = BreakpointTable::new();
        table.set(spec(3));
        table.set(spec(1));
        table.set(spec(2));
        let keys: Vec<_> = table.list().into_iter().map(|b| b.key).collect();
        assert_eq!(keys, vec![key(1), key(2), key(3)]);
        table.clear_all();
        assert!(table.is_empty());
    }
}
