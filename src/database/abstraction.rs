// =============================================================================
// Palaver Matrix Homeserver - Database Abstraction Module
// =============================================================================
//
// Project: Palaver - Federated Matrix Homeserver Core
// Author: Palaver Development Team
// Date: 2025-11-08
// Version: 0.3.0
// License: Apache 2.0 / MIT
//
// Description:
//   Ordered key-value tree abstraction behind which all persistence sits,
//   and the bundled in-process memory engine. On-disk engines plug in behind
//   the same two traits.
//
// Features:
//   • Ordered iteration and prefix scans
//   • Atomic counter increments
//   • Engine-agnostic tree handles
//
// Dependencies:
//   • Tokio async runtime
//
// References:
//   • Matrix spec: https://spec.matrix.org/
//
// =============================================================================

use std::{
    collections::BTreeMap,
    ops::Bound,
    sync::{Arc, RwLock},
};

use crate::{Config, Result};

pub trait KeyValueDatabaseEngine: Send + Sync {
    fn open(config: &Config) -> Result<Self>
    where
        Self: Sized;

    fn open_tree(&self, name: &'static str) -> Result<Arc<dyn KvTree>>;

    fn flush(&self) -> Result<()>;
}

pub trait KvTree: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn insert(&self, key: &[u8], value: &[u8]) -> Result<()>;

    fn remove(&self, key: &[u8]) -> Result<()>;

    /// All entries in key order.
    fn iter<'a>(&'a self) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a>;

    /// Entries starting at `from` inclusive, ascending or descending.
    fn iter_from<'a>(
        &'a self,
        from: &[u8],
        backwards: bool,
    ) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a>;

    /// Entries whose key starts with `prefix`, in key order.
    fn scan_prefix<'a>(
        &'a self,
        prefix: Vec<u8>,
    ) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a>;

    /// Atomically increments the u64 stored at `key`, returning the new value.
    fn increment(&self, key: &[u8]) -> Result<Vec<u8>>;
}

/// The bundled engine: ordered trees in process memory. Serves tests and
/// single-node operation; durable engines implement the same traits.
pub struct MemoryEngine;

impl KeyValueDatabaseEngine for MemoryEngine {
    fn open(_config: &Config) -> Result<Self> {
        Ok(MemoryEngine)
    }

    fn open_tree(&self, _name: &'static str) -> Result<Arc<dyn KvTree>> {
        Ok(Arc::new(MemoryTree::default()))
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryTree {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl KvTree for MemoryTree {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map.read().unwrap().get(key).cloned())
    }

    fn insert(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.map.write().unwrap().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &[u8]) -> Result<()> {
        self.map.write().unwrap().remove(key);
        Ok(())
    }

    fn iter<'a>(&'a self) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a> {
        let snapshot: Vec<_> = self
            .map
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Box::new(snapshot.into_iter())
    }

    fn iter_from<'a>(
        &'a self,
        from: &[u8],
        backwards: bool,
    ) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a> {
        let map = self.map.read().unwrap();
        let snapshot: Vec<_> = if backwards {
            map.range::<Vec<u8>, _>((Bound::Unbounded, Bound::Included(from.to_vec())))
                .rev()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        } else {
            map.range::<Vec<u8>, _>((Bound::Included(from.to_vec()), Bound::Unbounded))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        Box::new(snapshot.into_iter())
    }

    fn scan_prefix<'a>(
        &'a self,
        prefix: Vec<u8>,
    ) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a> {
        let map = self.map.read().unwrap();
        let snapshot: Vec<_> = map
            .range::<Vec<u8>, _>((Bound::Included(prefix.clone()), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Box::new(snapshot.into_iter())
    }

    fn increment(&self, key: &[u8]) -> Result<Vec<u8>> {
        let mut map = self.map.write().unwrap();
        let old = map
            .get(key)
            .and_then(|v| crate::utils::u64_from_bytes(v).ok())
            .unwrap_or(0);
        let new = (old + 1).to_be_bytes().to_vec();
        map.insert(key.to_vec(), new.clone());
        Ok(new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let tree = MemoryTree::default();
        tree.insert(b"key", b"value").unwrap();
        assert_eq!(tree.get(b"key").unwrap().as_deref(), Some(&b"value"[..]));
        tree.remove(b"key").unwrap();
        assert_eq!(tree.get(b"key").unwrap(), None);
    }

    #[test]
    fn scan_prefix_is_bounded() {
        let tree = MemoryTree::default();
        tree.insert(b"a/1", b"1").unwrap();
        tree.insert(b"a/2", b"2").unwrap();
        tree.insert(b"b/1", b"3").unwrap();

        let keys: Vec<_> = tree.scan_prefix(b"a/".to_vec()).map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b"a/1".to_vec(), b"a/2".to_vec()]);
    }

    #[test]
    fn iter_from_respects_direction() {
        let tree = MemoryTree::default();
        for k in [b"1", b"2", b"3", b"4"] {
            tree.insert(k, b"x").unwrap();
        }

        let forward: Vec<_> = tree.iter_from(b"2", false).map(|(k, _)| k).collect();
        assert_eq!(forward, vec![b"2".to_vec(), b"3".to_vec(), b"4".to_vec()]);

        let backward: Vec<_> = tree.iter_from(b"3", true).map(|(k, _)| k).collect();
        assert_eq!(backward, vec![b"3".to_vec(), b"2".to_vec(), b"1".to_vec()]);
    }

    #[test]
    fn increment_is_monotone() {
        let tree = MemoryTree::default();
        let one = tree.increment(b"counter").unwrap();
        let two = tree.increment(b"counter").unwrap();
        assert_eq!(crate::utils::u64_from_bytes(&one).unwrap(), 1);
        assert_eq!(crate::utils::u64_from_bytes(&two).unwrap(), 2);
    }
}
