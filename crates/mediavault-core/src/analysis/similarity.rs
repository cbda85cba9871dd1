//! Nearest-neighbour search over 64-bit perceptual hashes.
//!
//! A BK-tree keyed by Hamming distance. Readers work on an `Arc` snapshot of
//! the tree, writers clone-on-write through `Arc::make_mut`, and a rebuild
//! builds a fresh tree off to the side before swapping it in, so a query
//! never sees a half-built index.

use crate::error::Result;
use crate::hasher::ContentHash;
use crate::registry::LocationRegistry;
use ahash::AHashMap;
use serde::Serialize;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

pub fn hamming_distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SimilarityMatch {
    pub content_hash: ContentHash,
    pub distance: u32,
}

#[derive(Debug, Clone)]
struct Node {
    phash: u64,
    /// Assets sharing this exact perceptual hash. May be empty after an asset
    /// moved to another hash; the node still routes queries.
    assets: Vec<ContentHash>,
    children: BTreeMap<u32, Node>,
}

impl Node {
    fn new(phash: u64, asset: ContentHash) -> Self {
        Self {
            phash,
            assets: vec![asset],
            children: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Tree {
    root: Option<Node>,
    entries: AHashMap<ContentHash, u64>,
}

impl Tree {
    fn insert(&mut self, asset: &ContentHash, phash: u64) -> bool {
        match self.entries.get(asset) {
            Some(&current) if current == phash => return false,
            Some(&current) => self.detach(asset, current),
            None => {}
        }
        self.entries.insert(asset.clone(), phash);

        let Some(mut node) = self.root.as_mut() else {
            self.root = Some(Node::new(phash, asset.clone()));
            return true;
        };
        loop {
            let distance = hamming_distance(node.phash, phash);
            if distance == 0 {
                node.assets.push(asset.clone());
                node.assets.sort();
                return true;
            }
            match node.children.entry(distance) {
                Entry::Vacant(slot) => {
                    slot.insert(Node::new(phash, asset.clone()));
                    return true;
                }
                Entry::Occupied(slot) => node = slot.into_mut(),
            }
        }
    }

    fn detach(&mut self, asset: &ContentHash, phash: u64) {
        let mut node = self.root.as_mut();
        while let Some(current) = node {
            let distance = hamming_distance(current.phash, phash);
            if distance == 0 {
                current.assets.retain(|a| a != asset);
                return;
            }
            node = current.children.get_mut(&distance);
        }
    }

    fn query(&self, phash: u64, max_distance: u32) -> Vec<SimilarityMatch> {
        let mut matches = Vec::new();
        let mut stack: Vec<&Node> = self.root.iter().collect();
        while let Some(node) = stack.pop() {
            let distance = hamming_distance(node.phash, phash);
            if distance <= max_distance {
                matches.extend(node.assets.iter().map(|asset| SimilarityMatch {
                    content_hash: asset.clone(),
                    distance,
                }));
            }
            let low = distance.saturating_sub(max_distance);
            let high = distance.saturating_add(max_distance);
            stack.extend(node.children.range(low..=high).map(|(_, child)| child));
        }
        matches.sort_by(|a, b| {
            a.distance
                .cmp(&b.distance)
                .then_with(|| a.content_hash.cmp(&b.content_hash))
        });
        matches
    }
}

/// Concurrent perceptual-hash index.
#[derive(Debug, Default)]
pub struct SimilarityIndex {
    tree: RwLock<Arc<Tree>>,
}

impl SimilarityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an index from every perceptual hash the registry holds.
    pub fn from_registry(registry: &LocationRegistry) -> Result<Self> {
        let index = Self::new();
        index.rebuild_from_registry(registry)?;
        Ok(index)
    }

    fn snapshot(&self) -> Arc<Tree> {
        Arc::clone(&self.tree.read().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn len(&self) -> usize {
        self.snapshot().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, asset: &ContentHash) -> Option<u64> {
        self.snapshot().entries.get(asset).copied()
    }

    /// Add or re-key one asset. Re-adding an unchanged entry is a no-op.
    pub fn add(&self, asset: &ContentHash, phash: u64) {
        let mut guard = self.tree.write().unwrap_or_else(|e| e.into_inner());
        if Arc::make_mut(&mut guard).insert(asset, phash) {
            debug!("Indexed {} as {:016x}", asset.short(), phash);
        }
    }

    /// Assets within `max_distance` of `phash`, nearest first, ties by hash.
    pub fn query(&self, phash: u64, max_distance: u32) -> Vec<SimilarityMatch> {
        self.snapshot().query(phash, max_distance)
    }

    /// Replace the whole index. Queries keep using the old tree until the
    /// new one is complete.
    pub fn rebuild(&self, entries: impl IntoIterator<Item = (ContentHash, u64)>) -> usize {
        let mut fresh = Tree::default();
        for (asset, phash) in entries {
            fresh.insert(&asset, phash);
        }
        let count = fresh.entries.len();
        *self.tree.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(fresh);
        count
    }

    pub fn rebuild_from_registry(&self, registry: &LocationRegistry) -> Result<usize> {
        let count = self.rebuild(registry.perceptual_hashes()?);
        info!("Similarity index rebuilt with {} assets", count);
        Ok(count)
    }
}
