//! LFU cache for block headers
//!
//! Congestion calculation walks the same N-block window on every
//! estimation; memoising headers turns N RPC calls into at most a handful.
//! Eviction is least-frequently-used with the lowest block number breaking
//! ties, so the oldest cold entry goes first.

use crate::chain::BlockHeader;

use std::collections::HashMap;
use std::sync::Mutex;
use tracing::trace;

struct CacheItem {
    header: BlockHeader,
    frequency: u64,
}

/// Least-frequently-used block header cache
pub struct HeaderCache {
    capacity: usize,
    inner: Mutex<HashMap<u64, CacheItem>>,
}

impl HeaderCache {
    /// Capacity should equal the block window configured for estimation
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity: capacity.max(1) as usize,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Retrieve a header, bumping its use count on a hit
    pub fn get(&self, block_number: u64) -> Option<BlockHeader> {
        let mut cache = self.inner.lock().unwrap();
        if let Some(item) = cache.get_mut(&block_number) {
            item.frequency += 1;
            trace!(block = block_number, "Header cache hit");
            return Some(item.header.clone());
        }
        None
    }

    /// Insert or refresh a header, evicting on overflow
    pub fn set(&self, header: BlockHeader) {
        let mut cache = self.inner.lock().unwrap();
        let number = header.number;

        if let Some(existing) = cache.get_mut(&number) {
            let frequency = existing.frequency + 1;
            *existing = CacheItem { header, frequency };
            return;
        }

        if cache.len() >= self.capacity {
            Self::evict(&mut cache);
        }
        trace!(block = number, "Caching header");
        cache.insert(number, CacheItem { header, frequency: 1 });
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict(cache: &mut HashMap<u64, CacheItem>) {
        let victim = cache
            .iter()
            .min_by_key(|(number, item)| (item.frequency, **number))
            .map(|(number, _)| *number);
        if let Some(number) = victim {
            trace!(block = number, "Evicting header from cache");
            cache.remove(&number);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::U256;

    fn header(number: u64) -> BlockHeader {
        BlockHeader {
            number,
            gas_used: U256::from(number * 10),
            gas_limit: U256::from(1_000u64),
            base_fee: U256::from(7u64),
        }
    }

    #[test]
    fn get_miss_then_hit() {
        let cache = HeaderCache::new(4);
        assert!(cache.get(1).is_none());
        cache.set(header(1));
        assert_eq!(cache.get(1).unwrap().number, 1);
    }

    #[test]
    fn never_exceeds_capacity() {
        let cache = HeaderCache::new(3);
        for n in 0..10 {
            cache.set(header(n));
        }
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn evicts_least_frequently_used() {
        let cache = HeaderCache::new(2);
        cache.set(header(1));
        cache.set(header(2));
        // block 2 becomes hot
        cache.get(2);
        cache.get(2);
        cache.set(header(3));
        assert!(cache.get(1).is_none(), "cold entry should have been evicted");
        assert!(cache.get(2).is_some());
        assert!(cache.get(3).is_some());
    }

    #[test]
    fn frequency_tie_evicts_oldest_block() {
        let cache = HeaderCache::new(2);
        cache.set(header(5));
        cache.set(header(9));
        // both at frequency 1; block 5 is older and must go
        cache.set(header(11));
        assert!(cache.get(5).is_none());
        assert!(cache.get(9).is_some());
        assert!(cache.get(11).is_some());
    }

    #[test]
    fn refresh_keeps_entry_hot() {
        let cache = HeaderCache::new(2);
        cache.set(header(1));
        cache.set(header(1)); // refresh bumps frequency
        cache.set(header(2));
        cache.set(header(3));
        assert!(cache.get(1).is_some());
        assert!(cache.get(2).is_none());
    }
}
