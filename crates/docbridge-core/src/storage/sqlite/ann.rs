//! In-memory ANN indexes over vector columns.
//!
//! SQLite has no ANN access method, so an index is built from the vector
//! column when it is created and rebuilt on the next search after any write
//! through the connection. Searches take candidates from the index and
//! re-rank them exactly in SQL.
//!
//! Both structures are deterministic: HNSW levels come from a fixed-seed
//! SplitMix64 sequence and IVF centroids are seeded from evenly spaced rows.

use crate::error::{Error, Result};
use crate::vector::{DistanceMetric, VectorIndexType};
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};
use std::sync::{Arc, Mutex};

/// SQLite `rowid` of an indexed row.
pub(crate) type RowId = i64;

/// Lloyd iterations when training IVF centroids.
const IVF_TRAINING_ROUNDS: usize = 10;

/// A candidate ordered so that the closest one is the greatest.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Scored {
    distance: f64,
    id: RowId,
}

impl Eq for Scored {}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .distance
            .partial_cmp(&self.distance)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// Nearest first, lower row id on ties.
fn sort_nearest(scored: &mut [Scored]) {
    scored.sort_by(|a, b| b.cmp(a));
}

struct Vectors {
    metric: DistanceMetric,
    rows: BTreeMap<RowId, Vec<f32>>,
}

impl Vectors {
    fn distance(&self, query: &[f32], id: RowId) -> Option<f64> {
        self.rows.get(&id).map(|v| self.metric.distance(query, v))
    }
}

// -----------------------------------------------------------------------------
// HNSW
// -----------------------------------------------------------------------------

struct Hnsw {
    m: usize,
    ef_construction: usize,
    ml: f64,
    /// Neighbour sets per layer of every node
    nodes: BTreeMap<RowId, Vec<BTreeSet<RowId>>>,
    entry: Option<RowId>,
    max_level: usize,
    counter: u64,
}

impl Hnsw {
    const SEED: u64 = 42;

    fn new(m: usize, ef_construction: usize) -> Self {
        let m = m.max(2);
        Self {
            m,
            ef_construction: ef_construction.max(1),
            ml: 1.0 / (m as f64).ln(),
            nodes: BTreeMap::new(),
            entry: None,
            max_level: 0,
            counter: 0,
        }
    }

    fn max_connections(&self, layer: usize) -> usize {
        if layer == 0 {
            self.m * 2
        } else {
            self.m
        }
    }

    fn splitmix64(mut x: u64) -> u64 {
        x = x.wrapping_add(0x9e3779b97f4a7c15);
        x = (x ^ (x >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
        x = (x ^ (x >> 27)).wrapping_mul(0x94d049bb133111eb);
        x ^ (x >> 31)
    }

    fn assign_level(&mut self) -> usize {
        self.counter += 1;
        let hash = Self::splitmix64(Self::SEED.wrapping_add(self.counter));
        let uniform = ((hash as f64) / (u64::MAX as f64)).max(1e-15);
        (-uniform.ln() * self.ml) as usize
    }

    fn neighbours(&self, id: RowId, layer: usize) -> impl Iterator<Item = RowId> + '_ {
        self.nodes
            .get(&id)
            .and_then(|layers| layers.get(layer))
            .into_iter()
            .flat_map(|set| set.iter().copied())
    }

    /// Beam search of one layer; up to `ef` nodes, nearest first.
    fn search_layer(&self, vectors: &Vectors, query: &[f32], entry: RowId, ef: usize, layer: usize) -> Vec<Scored> {
        let Some(distance) = vectors.distance(query, entry) else {
            return Vec::new();
        };
        let start = Scored { distance, id: entry };
        let mut visited = BTreeSet::from([entry]);
        let mut candidates = BinaryHeap::from([start]);
        let mut results = BinaryHeap::from([Reverse(start)]);

        while let Some(nearest) = candidates.pop() {
            if let Some(Reverse(worst)) = results.peek() {
                if nearest.distance > worst.distance && results.len() >= ef {
                    break;
                }
            }
            for neighbour in self.neighbours(nearest.id, layer) {
                if !visited.insert(neighbour) {
                    continue;
                }
                let Some(distance) = vectors.distance(query, neighbour) else {
                    continue;
                };
                let worst = results.peek().map(|Reverse(s)| s.distance).unwrap_or(f64::INFINITY);
                if results.len() < ef || distance < worst {
                    let scored = Scored { distance, id: neighbour };
                    candidates.push(scored);
                    results.push(Reverse(scored));
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        let mut found: Vec<Scored> = results.into_iter().map(|Reverse(s)| s).collect();
        sort_nearest(&mut found);
        found
    }

    /// Greedy descent from `from` down to `to`, one best neighbour at a time.
    fn descend(&self, vectors: &Vectors, query: &[f32], entry: RowId, from: usize, to: usize) -> RowId {
        let mut current = entry;
        for layer in (to..=from).rev() {
            let Some(mut best) = vectors.distance(query, current) else {
                return current;
            };
            loop {
                let mut next = current;
                for neighbour in self.neighbours(current, layer) {
                    if let Some(distance) = vectors.distance(query, neighbour) {
                        if distance < best || (distance == best && neighbour < next) {
                            best = distance;
                            next = neighbour;
                        }
                    }
                }
                if next == current {
                    break;
                }
                current = next;
            }
        }
        current
    }

    fn prune(&mut self, vectors: &Vectors, id: RowId, layer: usize) {
        let Some(own) = vectors.rows.get(&id) else {
            return;
        };
        let mut scored: Vec<Scored> = self
            .neighbours(id, layer)
            .filter_map(|n| vectors.distance(own, n).map(|distance| Scored { distance, id: n }))
            .collect();
        sort_nearest(&mut scored);
        let keep: BTreeSet<RowId> = scored
            .iter()
            .take(self.max_connections(layer))
            .map(|s| s.id)
            .collect();
        if let Some(set) = self.nodes.get_mut(&id).and_then(|layers| layers.get_mut(layer)) {
            *set = keep;
        }
    }

    fn insert(&mut self, vectors: &Vectors, id: RowId) {
        let Some(vector) = vectors.rows.get(&id) else {
            return;
        };
        let level = self.assign_level();
        self.nodes.insert(id, vec![BTreeSet::new(); level + 1]);

        let Some(entry) = self.entry else {
            self.entry = Some(id);
            self.max_level = level;
            return;
        };

        let mut current = entry;
        if self.max_level > level {
            current = self.descend(vectors, vector, entry, self.max_level, level + 1);
        }

        for layer in (0..=level.min(self.max_level)).rev() {
            let candidates = self.search_layer(vectors, vector, current, self.ef_construction, layer);
            let selected: Vec<RowId> = candidates
                .iter()
                .filter(|s| s.id != id)
                .take(self.m)
                .map(|s| s.id)
                .collect();

            if let Some(set) = self.nodes.get_mut(&id).and_then(|layers| layers.get_mut(layer)) {
                set.extend(selected.iter().copied());
            }
            let limit = self.max_connections(layer);
            for &neighbour in &selected {
                let overfull = match self.nodes.get_mut(&neighbour).and_then(|l| l.get_mut(layer)) {
                    Some(set) => {
                        set.insert(id);
                        set.len() > limit
                    }
                    None => false,
                };
                if overfull {
                    self.prune(vectors, neighbour, layer);
                }
            }
            if let Some(closest) = candidates.first() {
                current = closest.id;
            }
        }

        if level > self.max_level {
            self.entry = Some(id);
            self.max_level = level;
        }
    }

    fn search(&self, vectors: &Vectors, query: &[f32], k: usize) -> Vec<Scored> {
        let Some(entry) = self.entry else {
            return Vec::new();
        };
        let mut current = entry;
        if self.max_level > 0 {
            current = self.descend(vectors, query, entry, self.max_level, 1);
        }
        let mut found = self.search_layer(vectors, query, current, self.ef_construction.max(k), 0);
        found.truncate(k);
        found
    }
}

// -----------------------------------------------------------------------------
// IVF-flat
// -----------------------------------------------------------------------------

struct IvfFlat {
    centroids: Vec<Vec<f32>>,
    lists: Vec<Vec<RowId>>,
    lists_searched: usize,
}

impl IvfFlat {
    fn nearest_centroid(centroids: &[Vec<f32>], metric: DistanceMetric, vector: &[f32]) -> usize {
        let mut best = (f64::INFINITY, 0);
        for (i, centroid) in centroids.iter().enumerate() {
            let distance = metric.distance(vector, centroid);
            if distance < best.0 {
                best = (distance, i);
            }
        }
        best.1
    }

    fn build(vectors: &Vectors, lists: usize) -> Self {
        let rows: Vec<(&RowId, &Vec<f32>)> = vectors.rows.iter().collect();
        let count = lists.clamp(1, rows.len().max(1));
        let step = rows.len() / count;
        let mut centroids: Vec<Vec<f32>> = (0..count)
            .filter_map(|i| rows.get(i * step.max(1)).map(|(_, v)| (*v).clone()))
            .collect();
        let mut assignment = vec![0usize; rows.len()];

        for _ in 0..IVF_TRAINING_ROUNDS {
            let mut moved = false;
            for (slot, (_, vector)) in assignment.iter_mut().zip(&rows) {
                let nearest = Self::nearest_centroid(&centroids, vectors.metric, vector);
                moved |= *slot != nearest;
                *slot = nearest;
            }
            for (i, centroid) in centroids.iter_mut().enumerate() {
                let members: Vec<&Vec<f32>> = rows
                    .iter()
                    .zip(&assignment)
                    .filter(|(_, a)| **a == i)
                    .map(|((_, v), _)| *v)
                    .collect();
                if members.is_empty() {
                    continue;
                }
                for (d, value) in centroid.iter_mut().enumerate() {
                    *value = members.iter().map(|m| m[d]).sum::<f32>() / members.len() as f32;
                }
            }
            if !moved {
                break;
            }
        }

        let mut lists = vec![Vec::new(); centroids.len()];
        for ((id, vector), _) in rows.iter().zip(&assignment) {
            let nearest = Self::nearest_centroid(&centroids, vectors.metric, vector);
            if let Some(list) = lists.get_mut(nearest) {
                list.push(**id);
            }
        }
        let lists_searched = ((centroids.len() as f64).sqrt().ceil() as usize).max(1);
        Self {
            centroids,
            lists,
            lists_searched,
        }
    }

    fn search(&self, vectors: &Vectors, query: &[f32], k: usize) -> Vec<Scored> {
        let mut order: Vec<Scored> = self
            .centroids
            .iter()
            .enumerate()
            .map(|(i, c)| Scored {
                distance: vectors.metric.distance(query, c),
                id: i as RowId,
            })
            .collect();
        sort_nearest(&mut order);

        let mut found = Vec::new();
        for (visited, list) in order.iter().enumerate() {
            if visited >= self.lists_searched && found.len() >= k {
                break;
            }
            let Some(members) = self.lists.get(list.id as usize) else {
                continue;
            };
            found.extend(
                members
                    .iter()
                    .filter_map(|&id| vectors.distance(query, id).map(|distance| Scored { distance, id })),
            );
        }
        sort_nearest(&mut found);
        found.truncate(k);
        found
    }
}

// -----------------------------------------------------------------------------
// Index and registry
// -----------------------------------------------------------------------------

enum Structure {
    Hnsw(Hnsw),
    IvfFlat(IvfFlat),
}

/// A built ANN index over one vector column.
pub(crate) struct AnnIndex {
    vectors: Vectors,
    structure: Structure,
}

impl AnnIndex {
    pub fn build(kind: VectorIndexType, metric: DistanceMetric, rows: Vec<(RowId, Vec<f32>)>) -> Self {
        let vectors = Vectors {
            metric,
            rows: rows.into_iter().collect(),
        };
        let structure = match kind {
            VectorIndexType::Hnsw { m, ef_construction } => {
                let mut graph = Hnsw::new(m as usize, ef_construction as usize);
                let ids: Vec<RowId> = vectors.rows.keys().copied().collect();
                for id in ids {
                    graph.insert(&vectors, id);
                }
                Structure::Hnsw(graph)
            }
            VectorIndexType::IvfFlat { lists } => Structure::IvfFlat(IvfFlat::build(&vectors, lists as usize)),
        };
        Self { vectors, structure }
    }

    pub fn len(&self) -> usize {
        self.vectors.rows.len()
    }

    /// Up to `k` approximate nearest rows, closest first.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(RowId, f64)> {
        if k == 0 || self.vectors.rows.is_empty() {
            return Vec::new();
        }
        let found = match &self.structure {
            Structure::Hnsw(graph) => graph.search(&self.vectors, query, k),
            Structure::IvfFlat(ivf) => ivf.search(&self.vectors, query, k),
        };
        found.into_iter().map(|s| (s.id, s.distance)).collect()
    }
}

/// Write position of the connection an index was built at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Stamp {
    pub data_version: i64,
    pub total_changes: i64,
}

struct Cached {
    stamp: Stamp,
    definition: String,
    index: Arc<AnnIndex>,
}

/// Built indexes of one database, keyed by table and column.
#[derive(Default)]
pub(crate) struct AnnRegistry {
    entries: Mutex<HashMap<String, Cached>>,
}

impl AnnRegistry {
    fn key(table: &str, column: &str) -> String {
        format!("{}.{}", table, column)
    }

    /// The cached index when it was built at `stamp` for `definition`,
    /// otherwise a freshly built one.
    pub fn get_or_build<F>(
        &self,
        table: &str,
        column: &str,
        definition: &str,
        stamp: Stamp,
        build: F,
    ) -> Result<Arc<AnnIndex>>
    where
        F: FnOnce() -> Result<AnnIndex>,
    {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| Error::Other(anyhow::anyhow!("ANN registry lock poisoned")))?;
        let key = Self::key(table, column);
        if let Some(cached) = entries.get(&key) {
            if cached.stamp == stamp && cached.definition == definition {
                return Ok(cached.index.clone());
            }
        }
        let index = Arc::new(build()?);
        tracing::debug!("built ANN index over {} vectors for {}", index.len(), key);
        entries.insert(
            key,
            Cached {
                stamp,
                definition: definition.to_string(),
                index: index.clone(),
            },
        );
        Ok(index)
    }

    pub fn evict(&self, table: &str, column: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(&Self::key(table, column));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(n: usize) -> Vec<(RowId, Vec<f32>)> {
        (0..n)
            .map(|i| {
                let angle = i as f32 * 0.37;
                (i as RowId + 1, vec![angle.cos(), angle.sin(), (i % 7) as f32 * 0.1])
            })
            .collect()
    }

    fn exact(rows: &[(RowId, Vec<f32>)], metric: DistanceMetric, query: &[f32], k: usize) -> Vec<RowId> {
        let mut scored: Vec<Scored> = rows
            .iter()
            .map(|(id, v)| Scored {
                distance: metric.distance(query, v),
                id: *id,
            })
            .collect();
        sort_nearest(&mut scored);
        scored.into_iter().take(k).map(|s| s.id).collect()
    }

    #[test]
    fn test_hnsw_matches_exact_on_small_sets() {
        let rows = grid(60);
        let index = AnnIndex::build(VectorIndexType::hnsw(), DistanceMetric::L2, rows.clone());
        assert_eq!(index.len(), 60);
        for query in [[1.0, 0.0, 0.0], [-0.5, 0.5, 0.3], [0.1, -0.9, 0.6]] {
            let found: Vec<RowId> = index.search(&query, 5).into_iter().map(|(id, _)| id).collect();
            assert_eq!(found, exact(&rows, DistanceMetric::L2, &query, 5));
        }
    }

    #[test]
    fn test_hnsw_levels_are_deterministic() {
        let rows = grid(30);
        let a = AnnIndex::build(VectorIndexType::hnsw(), DistanceMetric::Cosine, rows.clone());
        let b = AnnIndex::build(VectorIndexType::hnsw(), DistanceMetric::Cosine, rows);
        assert_eq!(a.search(&[0.3, 0.7, 0.0], 10), b.search(&[0.3, 0.7, 0.0], 10));
    }

    #[test]
    fn test_ivfflat_searches_all_lists_when_few() {
        let rows = grid(40);
        let index = AnnIndex::build(VectorIndexType::IvfFlat { lists: 2 }, DistanceMetric::Cosine, rows.clone());
        let query = [0.2, 0.9, 0.1];
        let found: Vec<RowId> = index.search(&query, 4).into_iter().map(|(id, _)| id).collect();
        assert_eq!(found, exact(&rows, DistanceMetric::Cosine, &query, 4));
    }

    #[test]
    fn test_ivfflat_more_lists_than_rows() {
        let rows = grid(3);
        let index = AnnIndex::build(VectorIndexType::ivfflat(), DistanceMetric::L2, rows);
        assert_eq!(index.search(&[1.0, 0.0, 0.0], 10).len(), 3);
        assert!(index.search(&[1.0, 0.0, 0.0], 0).is_empty());
    }

    #[test]
    fn test_registry_rebuilds_on_new_stamp() {
        let registry = AnnRegistry::default();
        let stamp = Stamp {
            data_version: 1,
            total_changes: 5,
        };
        let build = || Ok(AnnIndex::build(VectorIndexType::hnsw(), DistanceMetric::L2, grid(4)));
        let first = registry.get_or_build("t", "c", "def", stamp, build).unwrap();
        let again = registry
            .get_or_build("t", "c", "def", stamp, || panic!("must reuse the cached index"))
            .unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        let moved = Stamp {
            total_changes: 6,
            ..stamp
        };
        let rebuilt = registry
            .get_or_build("t", "c", "def", moved, || {
                Ok(AnnIndex::build(VectorIndexType::hnsw(), DistanceMetric::L2, grid(2)))
            })
            .unwrap();
        assert_eq!(rebuilt.len(), 2);

        registry.evict("t", "c");
        let fresh = registry.get_or_build("t", "c", "def", moved, build).unwrap();
        assert_eq!(fresh.len(), 4);
    }
}
