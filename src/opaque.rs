//! Opaque minting and response correlation.
//!
//! Every outbound request carries a locally minted opaque; the registry
//! remembers which (external opaque, partition) conversation each one
//! belongs to, from stream creation until acceptance or teardown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::message::Vbid;

/// Monotonic mint for request opaques.
#[derive(Debug, Default)]
pub struct OpaqueCounter(AtomicU32);

impl OpaqueCounter {
    pub fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    pub fn next(&self) -> u32 {
        self.0.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }
}

/// Local opaque → (external opaque, partition).
#[derive(Debug, Default)]
pub struct OpaqueRegistry {
    map: Mutex<HashMap<u32, (u32, Vbid)>>,
}

impl OpaqueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, local: u32, external: u32, vbid: Vbid) {
        self.map
            .lock()
            .expect("opaque registry lock poisoned")
            .insert(local, (external, vbid));
    }

    pub fn get(&self, local: u32) -> Option<(u32, Vbid)> {
        self.map
            .lock()
            .expect("opaque registry lock poisoned")
            .get(&local)
            .copied()
    }

    pub fn remove(&self, local: u32) -> Option<(u32, Vbid)> {
        self.map
            .lock()
            .expect("opaque registry lock poisoned")
            .remove(&local)
    }

    pub fn is_empty(&self) -> bool {
        self.map
            .lock()
            .expect("opaque registry lock poisoned")
            .is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_is_monotonic_from_one() {
        let counter = OpaqueCounter::new();
        assert_eq!(counter.next(), 1);
        assert_eq!(counter.next(), 2);
        assert_eq!(counter.next(), 3);
    }

    #[test]
    fn registry_tracks_conversations() {
        let registry = OpaqueRegistry::new();
        registry.insert(1, 99, Vbid::new(4));
        assert_eq!(registry.get(1), Some((99, Vbid::new(4))));
        assert_eq!(registry.remove(1), Some((99, Vbid::new(4))));
        assert_eq!(registry.get(1), None);
        assert!(registry.is_empty());
    }
}
