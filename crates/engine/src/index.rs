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

//! Graph index: lazily built, cached graph descriptors.
//!
//! Descriptors are built on first reference and shared as `Arc`s, so execution
//! hooks only pay for a concurrent map lookup. Invalidating a graph drops its
//! descriptor; the next reference rebuilds it with a strictly larger
//! generation.

use std::sync::Arc;

use bpdb_common::types::{GraphDescriptor, GraphId};
use dashmap::{mapref::entry::Entry, DashMap};
use tracing::{debug, info};

use crate::{AssetError, AssetResolver};

/// A resolved descriptor, and whether this call built it.
#[derive(Debug, Clone)]
pub struct Resolved {
    /// The descriptor
    pub graph: Arc<GraphDescriptor>,
    /// Built by this call rather than served from the cache
    pub fresh: bool,
}

/// Cache of graph descriptors keyed by graph id.
pub struct GraphIndex {
    resolver: Arc<dyn AssetResolver>,
    cache: DashMap<GraphId, Arc<GraphDescriptor>>,
    /// Failed resolutions, tagged with the epoch they were observed in.
    failures: DashMap<GraphId, (u64, AssetError)>,
    /// Bumped on every invalidation. A build started in an older epoch is not cached.
    epochs: DashMap<GraphId, u64>,
    /// Last generation issued per graph, kept across invalidations.
    generations: DashMap<GraphId, u64>,
}

impl std::fmt::Debug for GraphIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphIndex")
            .field("cached", &self.cache.len())
            .field("failed", &self.failures.len())
            .finish()
    }
}

impl GraphIndex {
    /// Create an empty index over an asset resolver.
    pub fn new(resolver: Arc<dyn AssetResolver>) -> Self {
        Self {
            resolver,
            cache: DashMap::new(),
            failures: DashMap::new(),
            epochs: DashMap::new(),
            generations: DashMap::new(),
        }
    }

    /// Resolve a graph, building and caching its descriptor on first use.
    pub fn resolve(&self, graph: GraphId) -> Result<Arc<GraphDescriptor>, AssetError> {
        self.resolve_tracked(graph).map(|r| r.graph)
    }

    /// Like [`Self::resolve`], also reporting whether the descriptor was just built.
    ///
    /// The host resolver runs without any map lock held. Concurrent callers may
    /// both build, but only the first to publish its descriptor gets it cached
    /// and reported as fresh. Failures are remembered until the graph is
    /// invalidated, so an unresolvable graph costs one host call per epoch.
    pub fn resolve_tracked(&self, graph: GraphId) -> Result<Resolved, AssetError> {
        loop {
            if let Some(cached) = self.cache.get(&graph) {
                return Ok(Resolved { graph: cached.clone(), fresh: false });
            }
            let epoch = self.epoch(graph);
            if let Some(failure) = self.failures.get(&graph) {
                if failure.0 == epoch {
                    return Err(failure.1.clone());
                }
            }

            let mut descriptor = match self.build(graph) {
                Ok(descriptor) => descriptor,
                Err(err) => {
                    debug!(graph = %graph, %err, "Graph resolution failed");
                    self.failures.insert(graph, (epoch, err.clone()));
                    return Err(err);
                }
            };

            match self.cache.entry(graph) {
                Entry::Occupied(entry) => {
                    return Ok(Resolved { graph: entry.get().clone(), fresh: false })
                }
                Entry::Vacant(entry) => {
                    // Invalidated while building: the asset may predate the recompile.
                    if self.epoch(graph) != epoch {
                        continue;
                    }
                    descriptor.generation = self.next_generation(graph);
                    let descriptor = Arc::new(descriptor);
                    entry.insert(descriptor.clone());
                    debug!(
                        graph = %graph,
                        generation = descriptor.generation,
                        nodes = descriptor.len(),
                        "Indexed graph"
                    );
                    return Ok(Resolved { graph: descriptor, fresh: true });
                }
            }
        }
    }

    fn build(&self, graph: GraphId) -> Result<GraphDescriptor, AssetError> {
        let asset = self.resolver.resolve_graph(graph)?;
        GraphDescriptor::new(graph, asset.path, 0, asset.nodes)
            .map_err(|e| AssetError::Invalid { graph, reason: e.to_string() })
    }

    fn epoch(&self, graph: GraphId) -> u64 {
        self.epochs.get(&graph).map(|e| *e).unwrap_or(0)
    }

    fn next_generation(&self, graph: GraphId) -> u64 {
        *self.generations.entry(graph).and_modify(|g| *g += 1).or_insert(0)
    }

    /// Drop the cached descriptor (or remembered failure) of a graph.
    /// Returns whether a descriptor was cached.
    pub fn invalidate(&self, graph: GraphId) -> bool {
        *self.epochs.entry(graph).or_insert(0) += 1;
        self.failures.remove(&graph);
        let dropped = self.cache.remove(&graph).is_some();
        if dropped {
            info!(graph = %graph, "Graph index invalidated");
        }
        dropped
    }

    /// Cached descriptor, without building.
    pub fn get(&self, graph: GraphId) -> Option<Arc<GraphDescriptor>> {
        self.cache.get(&graph).map(|g| g.clone())
    }

    /// Generation of the cached descriptor, if any.
    pub fn generation(&self, graph: GraphId) -> Option<u64> {
        self.cache.get(&graph).map(|g| g.generation)
    }

    /// Ids of all cached graphs, sorted.
    pub fn cached_graphs(&self) -> Vec<GraphId> {
        let mut ids: Vec<_> = self.cache.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryHost;
    use bpdb_common::types::{NodeDescriptor, NodeId, NodeKind};

    fn setup() -> (Arc<MemoryHost>, GraphIndex) {
        let host = Arc::new(MemoryHost::new());
        host.put_graph(
            GraphId(1),
            "/Game/BP_Door",
            vec![
                NodeDescriptor::new(NodeId(1), NodeKind::Event),
                NodeDescriptor::new(NodeId(2), NodeKind::Branch),
            ],
        );
        let index = GraphIndex::new(host.clone());
        (host, index)
    }

    #[test]
    fn test_resolve_builds_once() {
        let (host, index) = setup();
        let first = index.resolve_tracked(GraphId(1)).unwrap();
        let second = index.resolve_tracked(GraphId(1)).unwrap();
        assert!(first.fresh);
        assert!(!second.fresh);
        assert!(Arc::ptr_eq(&first.graph, &second.graph));
        assert_eq!(host.resolve_count(), 1);
        assert_eq!(index.cached_graphs(), vec![GraphId(1)]);
    }

    #[test]
    fn test_rebuild_gets_larger_generation() {
        let (host, index) = setup();
        assert_eq!(index.resolve(GraphId(1)).unwrap().generation, 0);
        assert!(index.invalidate(GraphId(1)));
        assert!(!index.invalidate(GraphId(1)));
        assert!(index.get(GraphId(1)).is_none());
        assert_eq!(index.generation(GraphId(1)), None);

        host.put_graph(GraphId(1), "/Game/BP_Door", vec![NodeDescriptor::new(NodeId(1), NodeKind::Event)]);
        let rebuilt = index.resolve(GraphId(1)).unwrap();
        assert_eq!(rebuilt.generation, 1);
        assert!(!rebuilt.contains(NodeId(2)));
        assert_eq!(index.generation(GraphId(1)), Some(1));
    }

    #[test]
    fn test_failed_resolution_is_remembered_until_invalidated() {
        let (host, index) = setup();
        assert_eq!(index.resolve(GraphId(7)).unwrap_err(), AssetError::NotFound(GraphId(7)));
        assert_eq!(index.resolve(GraphId(7)).unwrap_err(), AssetError::NotFound(GraphId(7)));
        assert_eq!(host.resolve_count(), 1);

        host.put_graph(GraphId(7), "/Game/BP_Late", vec![NodeDescriptor::new(NodeId(1), NodeKind::Event)]);
        assert!(index.resolve(GraphId(7)).is_err(), "still cached as missing");
        assert!(!index.invalidate(GraphId(7)));
        let built = index.resolve_tracked(GraphId(7)).unwrap();
        assert!(built.fresh);
        assert_eq!(built.graph.generation, 0);
        assert_eq!(host.resolve_count(), 2);
    }

    #[test]
    fn test_concurrent_resolves_publish_one_descriptor() {
        let (_, index) = setup();
        let index = Arc::new(index);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let index = index.clone();
                std::thread::spawn(move || index.resolve_tracked(GraphId(1)).unwrap())
            })
            .collect();
        let resolved: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(resolved.iter().filter(|r| r.fresh).count(), 1);
        assert!(resolved.iter().all(|r| Arc::ptr_eq(&r.graph, &resolved[0].graph)));
        assert_eq!(index.generation(GraphId(1)), Some(0));
    }

    #[test]
    fn test_resolve_failures() {
        let (host, index) = setup();
        assert_eq!(index.resolve(GraphId(9)).unwrap_err(), AssetError::NotFound(GraphId(9)));
        assert!(index.get(GraphId(9)).is_none());

        host.put_graph(
            GraphId(2),
            "/Game/BP_Bad",
            vec![
                NodeDescriptor::new(NodeId(1), NodeKind::Event),
                NodeDescriptor::new(NodeId(1), NodeKind::Event),
            ],
        );
        assert!(matches!(index.resolve(GraphId(2)), Err(AssetError::Invalid { .. })));
    }
}
