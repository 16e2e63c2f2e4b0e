use std::sync::atomic::{AtomicUsize, Ordering};

use xxhash_rust::xxh3::xxh3_64;

use crate::record::CompositeKey;

use super::membership::PeerAddress;

/// Policy choosing which peer receives a dispatched record.
#[derive(Debug)]
pub enum Selector {
    /// Same key, same peer, for as long as the peer list is unchanged.
    /// Required wherever the receiver aggregates by key.
    Hash,
    /// Spreads records evenly with no key affinity.
    RoundRobin(AtomicUsize),
}

impl Selector {
    pub fn hash() -> Self {
        Self::Hash
    }

    pub fn round_robin() -> Self {
        Self::RoundRobin(AtomicUsize::new(0))
    }

    /// Index into `peers` of the receiver, computed from this snapshot.
    /// `None` when there are no peers.
    pub fn select(&self, key: &CompositeKey, peers: &[PeerAddress]) -> Option<usize> {
        if peers.is_empty() {
            return None;
        }

        let idx = match self {
            Self::Hash => {
                let hash = xxh3_64(key.to_string().as_bytes());
                (hash % peers.len() as u64) as usize
            }
            Self::RoundRobin(counter) => counter.fetch_add(1, Ordering::Relaxed) % peers.len(),
        };

        Some(idx)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn peers(n: u16) -> Vec<PeerAddress> {
        (0..n)
            .map(|i| PeerAddress::new("10.0.0.1", 11800 + i, i == 0))
            .collect()
    }

    #[test]
    fn test_hash_is_stable_for_fixed_peers() {
        let selector = Selector::hash();
        let list = peers(5);
        let key = CompositeKey::new(202405061010, "checkout");

        let first = selector.select(&key, &list).unwrap();
        for _ in 0..1000 {
            assert_eq!(selector.select(&key, &list), Some(first));
        }
    }

    #[test]
    fn test_hash_follows_current_peer_list() {
        let selector = Selector::hash();
        let key = CompositeKey::new(202405061010, "checkout");
        let expected = |n: u16| (xxh3_64(key.to_string().as_bytes()) % u64::from(n)) as usize;

        for n in 1..=7 {
            assert_eq!(selector.select(&key, &peers(n)), Some(expected(n)));
        }
    }

    #[test]
    fn test_hash_spreads_keys() {
        let selector = Selector::hash();
        let list = peers(4);
        let used: HashSet<usize> = (0..200)
            .filter_map(|i| selector.select(&CompositeKey::new(202405061010, format!("svc-{i}")), &list))
            .collect();
        assert_eq!(used.len(), 4);
    }

    #[test]
    fn test_round_robin_cycles() {
        let selector = Selector::round_robin();
        let list = peers(3);
        let key = CompositeKey::new(1, "x");
        let picks: Vec<usize> = (0..6).filter_map(|_| selector.select(&key, &list)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_no_peers() {
        assert_eq!(Selector::hash().select(&CompositeKey::new(1, "x"), &[]), None);
    }
}
