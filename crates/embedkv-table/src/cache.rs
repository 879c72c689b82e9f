//! Batch caches ranking ids for eviction.
//!
//! The eviction engine consults one cache per tier transition. Ids enter
//! through `touch` (on lookup) or through the prefetch path:
//! `add_to_prefetch_list` records ids expected to be hot soon without
//! counting them toward `size()`, and a later `add_to_cache` commits
//! them as members. Prefetch sightings still accumulate frequency, so
//! under LFU a prefetched id ranks hotter than an untouched one the
//! moment it is committed.
//!
//! A single mutex per cache is enough: callers batch their updates at
//! lookup-return and eviction-sweep boundaries rather than per key.

use hashbrown::HashMap;
use parking_lot::Mutex;

use embedkv_core::config::CacheStrategy;

/// Ranking cache consumed by the eviction engine.
pub trait BatchCache: Send + Sync {
    /// Records `count` accesses of `id`, inserting it if absent and
    /// promoting it in the ordering.
    fn touch(&self, id: i64, count: i64);

    /// Records one access per element, in sequence order.
    fn update(&self, ids: &[i64]) {
        for &id in ids {
            self.touch(id, 1);
        }
    }

    /// Records ids expected to be hot soon. They do not count toward
    /// `size()` until committed via [`BatchCache::add_to_cache`].
    fn add_to_prefetch_list(&self, ids: &[i64]);

    /// Commits prefetch-tagged ids (and any new ones) as cache members.
    fn add_to_cache(&self, ids: &[i64]);

    /// Removes and returns up to `k` eviction victims, coldest first.
    fn get_evict_ids(&self, k: usize) -> Vec<i64>;

    /// Enumerates up to `max` current members, hottest first, with their
    /// accumulated counts.
    fn get_cached_ids(&self, max: usize) -> (Vec<i64>, Vec<i64>);

    /// Number of committed members.
    fn size(&self) -> usize;
}

/// Builds the cache for a configured strategy.
pub fn create_cache(strategy: CacheStrategy) -> Box<dyn BatchCache> {
    match strategy {
        CacheStrategy::Lru => Box::new(LruCache::new()),
        CacheStrategy::Lfu => Box::new(LfuCache::new()),
    }
}

const NIL: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Cached,
    Prefetch,
}

struct LruNode {
    id: i64,
    freq: i64,
    prev: usize,
    next: usize,
    state: NodeState,
}

struct LruInner {
    nodes: Vec<LruNode>,
    free: Vec<usize>,
    index: HashMap<i64, usize>,
    /// Most recently used end of the list.
    head: usize,
    /// Least recently used end of the list.
    tail: usize,
    cached: usize,
}

impl LruInner {
    fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            head: NIL,
            tail: NIL,
            cached: 0,
        }
    }

    fn alloc_node(&mut self, id: i64, state: NodeState) -> usize {
        let node = LruNode {
            id,
            freq: 0,
            prev: NIL,
            next: NIL,
            state,
        };
        match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = node;
                idx
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);
        if prev != NIL {
            self.nodes[prev].next = next;
        } else if self.head == idx {
            self.head = next;
        }
        if next != NIL {
            self.nodes[next].prev = prev;
        } else if self.tail == idx {
            self.tail = prev;
        }
        self.nodes[idx].prev = NIL;
        self.nodes[idx].next = NIL;
    }

    fn push_front(&mut self, idx: usize) {
        self.nodes[idx].prev = NIL;
        self.nodes[idx].next = self.head;
        if self.head != NIL {
            self.nodes[self.head].prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }

    /// Inserts or promotes `id` as a committed member at the MRU end.
    fn touch(&mut self, id: i64, count: i64) {
        match self.index.get(&id).copied() {
            Some(idx) => {
                self.nodes[idx].freq += count;
                match self.nodes[idx].state {
                    NodeState::Cached => {
                        self.unlink(idx);
                        self.push_front(idx);
                    }
                    NodeState::Prefetch => {
                        // A real access commits a prefetch seed.
                        self.nodes[idx].state = NodeState::Cached;
                        self.cached += 1;
                        self.push_front(idx);
                    }
                }
            }
            None => {
                let idx = self.alloc_node(id, NodeState::Cached);
                self.nodes[idx].freq = count;
                self.index.insert(id, idx);
                self.push_front(idx);
                self.cached += 1;
            }
        }
    }

    fn prefetch(&mut self, id: i64) {
        match self.index.get(&id).copied() {
            Some(idx) => {
                self.nodes[idx].freq += 1;
                if self.nodes[idx].state == NodeState::Cached {
                    // Prefetched-and-already-cached counts as a recent
                    // touch for ranking purposes.
                    self.unlink(idx);
                    self.push_front(idx);
                }
            }
            None => {
                let idx = self.alloc_node(id, NodeState::Prefetch);
                self.nodes[idx].freq = 1;
                self.index.insert(id, idx);
            }
        }
    }

    fn evict(&mut self, k: usize) -> Vec<i64> {
        let mut out = Vec::with_capacity(k.min(self.cached));
        while out.len() < k && self.tail != NIL {
            let idx = self.tail;
            let id = self.nodes[idx].id;
            self.unlink(idx);
            self.index.remove(&id);
            self.free.push(idx);
            self.cached -= 1;
            out.push(id);
        }
        out
    }

    fn cached_ids(&self, max: usize) -> (Vec<i64>, Vec<i64>) {
        let mut ids = Vec::new();
        let mut freqs = Vec::new();
        let mut idx = self.head;
        while idx != NIL && ids.len() < max {
            ids.push(self.nodes[idx].id);
            freqs.push(self.nodes[idx].freq);
            idx = self.nodes[idx].next;
        }
        (ids, freqs)
    }
}

/// LRU cache: victims are the ids whose latest touch is earliest.
pub struct LruCache {
    inner: Mutex<LruInner>,
}

impl LruCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LruInner::new()),
        }
    }
}

impl Default for LruCache {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchCache for LruCache {
    fn touch(&self, id: i64, count: i64) {
        self.inner.lock().touch(id, count);
    }

    fn add_to_prefetch_list(&self, ids: &[i64]) {
        let mut inner = self.inner.lock();
        for &id in ids {
            inner.prefetch(id);
        }
    }

    fn add_to_cache(&self, ids: &[i64]) {
        let mut inner = self.inner.lock();
        for &id in ids {
            inner.touch(id, 1);
        }
    }

    fn get_evict_ids(&self, k: usize) -> Vec<i64> {
        self.inner.lock().evict(k)
    }

    fn get_cached_ids(&self, max: usize) -> (Vec<i64>, Vec<i64>) {
        self.inner.lock().cached_ids(max)
    }

    fn size(&self) -> usize {
        self.inner.lock().cached
    }
}

struct LfuEntry {
    freq: i64,
    last_touch: u64,
    state: NodeState,
}

struct LfuInner {
    entries: HashMap<i64, LfuEntry>,
    tick: u64,
    cached: usize,
}

impl LfuInner {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            tick: 0,
            cached: 0,
        }
    }

    fn touch(&mut self, id: i64, count: i64, commit: bool) {
        self.tick += 1;
        let tick = self.tick;
        match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.freq += count;
                entry.last_touch = tick;
                if commit && entry.state == NodeState::Prefetch {
                    entry.state = NodeState::Cached;
                    self.cached += 1;
                }
            }
            None => {
                let state = if commit {
                    self.cached += 1;
                    NodeState::Cached
                } else {
                    NodeState::Prefetch
                };
                self.entries.insert(
                    id,
                    LfuEntry {
                        freq: count,
                        last_touch: tick,
                        state,
                    },
                );
            }
        }
    }

    fn evict(&mut self, k: usize) -> Vec<i64> {
        let mut candidates: Vec<(i64, i64, u64)> = self
            .entries
            .iter()
            .filter(|(_, e)| e.state == NodeState::Cached)
            .map(|(&id, e)| (id, e.freq, e.last_touch))
            .collect();
        // Smallest accumulated count first; ties broken by the oldest
        // latest touch.
        candidates.sort_by(|a, b| a.1.cmp(&b.1).then(a.2.cmp(&b.2)));
        candidates.truncate(k);

        let mut out = Vec::with_capacity(candidates.len());
        for (id, _, _) in candidates {
            self.entries.remove(&id);
            self.cached -= 1;
            out.push(id);
        }
        out
    }

    fn cached_ids(&self, max: usize) -> (Vec<i64>, Vec<i64>) {
        let mut members: Vec<(i64, i64, u64)> = self
            .entries
            .iter()
            .filter(|(_, e)| e.state == NodeState::Cached)
            .map(|(&id, e)| (id, e.freq, e.last_touch))
            .collect();
        members.sort_by(|a, b| b.1.cmp(&a.1).then(b.2.cmp(&a.2)));
        members.truncate(max);
        let ids = members.iter().map(|m| m.0).collect();
        let freqs = members.iter().map(|m| m.1).collect();
        (ids, freqs)
    }
}

/// LFU cache: victims are the ids with the smallest accumulated counts,
/// ties broken by the oldest latest touch.
pub struct LfuCache {
    inner: Mutex<LfuInner>,
}

impl LfuCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LfuInner::new()),
        }
    }
}

impl Default for LfuCache {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchCache for LfuCache {
    fn touch(&self, id: i64, count: i64) {
        self.inner.lock().touch(id, count, true);
    }

    fn add_to_prefetch_list(&self, ids: &[i64]) {
        let mut inner = self.inner.lock();
        for &id in ids {
            inner.touch(id, 1, false);
        }
    }

    fn add_to_cache(&self, ids: &[i64]) {
        let mut inner = self.inner.lock();
        for &id in ids {
            inner.touch(id, 1, true);
        }
    }

    fn get_evict_ids(&self, k: usize) -> Vec<i64> {
        self.inner.lock().evict(k)
    }

    fn get_cached_ids(&self, max: usize) -> (Vec<i64>, Vec<i64>) {
        self.inner.lock().cached_ids(max)
    }

    fn size(&self) -> usize {
        self.inner.lock().cached
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Round-robin touches of `num_ids` ids, `num_access` in total.
    fn round_robin(cache: &dyn BatchCache, num_ids: i64, num_access: i64) {
        let ids: Vec<i64> = (0..num_access).map(|i| i % num_ids).collect();
        cache.update(&ids);
    }

    #[test]
    fn test_lru_round_robin_evicts_in_touch_order() {
        let cache = LruCache::new();
        round_robin(&cache, 30, 100);

        let evicted = cache.get_evict_ids(50);
        assert_eq!(evicted.len(), 30);
        assert_eq!(cache.size(), 0);
        for (i, id) in evicted.iter().enumerate() {
            assert_eq!(*id, (100 % 30 + i as i64) % 30);
        }
    }

    #[test]
    fn test_lfu_round_robin_evicts_least_frequent() {
        let cache = LfuCache::new();
        round_robin(&cache, 30, 100);

        // Ids 0..9 were touched 4 times, ids 10..29 three times; the
        // less frequent group leaves first, ordered by oldest last touch.
        let evicted = cache.get_evict_ids(50);
        assert_eq!(evicted.len(), 30);
        assert_eq!(cache.size(), 0);
        for (i, id) in evicted.iter().enumerate() {
            assert_eq!(*id, (100 % 30 + i as i64) % 30);
        }
    }

    /// Prefetch sequence used by the prefetch tests: id `i` appears `i`
    /// times for i in 1..=5.
    fn triangular(ids: std::ops::RangeInclusive<i64>, reverse: bool) -> Vec<i64> {
        let mut out = Vec::new();
        let range: Vec<i64> = if reverse {
            ids.rev().collect()
        } else {
            ids.collect()
        };
        for id in range {
            for _ in 0..id {
                out.push(id);
            }
        }
        out
    }

    #[test]
    fn test_lru_prefetch_does_not_count_or_evict() {
        let cache = LruCache::new();
        cache.add_to_prefetch_list(&triangular(1..=5, false));
        assert_eq!(cache.size(), 0);
        assert!(cache.get_evict_ids(5).is_empty());

        cache.add_to_cache(&triangular(1..=2, false));
        assert_eq!(cache.size(), 2);
        assert_eq!(cache.get_evict_ids(5).len(), 2);

        cache.add_to_cache(&triangular(3..=5, true));
        assert_eq!(cache.size(), 3);
        // Commit order was 5s, then 4s, then 3s; LRU evicts the two
        // whose latest touch is oldest.
        let evicted = cache.get_evict_ids(2);
        assert_eq!(evicted, vec![5, 4]);
        assert_eq!(cache.size(), 1);
    }

    #[test]
    fn test_lfu_prefetch_counts_carry_into_cache() {
        let cache = LfuCache::new();
        cache.add_to_prefetch_list(&triangular(1..=5, false));
        assert_eq!(cache.size(), 0);
        assert!(cache.get_evict_ids(5).is_empty());

        cache.add_to_cache(&triangular(1..=2, false));
        assert_eq!(cache.size(), 2);
        assert_eq!(cache.get_evict_ids(5).len(), 2);

        cache.add_to_cache(&triangular(3..=5, true));
        assert_eq!(cache.size(), 3);
        // Accumulated counts: 5 holds 10, 4 holds 8, 3 holds 6; the least frequent
        // leave first.
        let evicted = cache.get_evict_ids(2);
        assert_eq!(evicted, vec![3, 4]);
        assert_eq!(cache.size(), 1);
    }

    #[test]
    fn test_lru_get_cached_ids() {
        let cache = LruCache::new();
        round_robin(&cache, 30, 100);
        assert_eq!(cache.size(), 30);

        let (ids, freqs) = cache.get_cached_ids(20);
        assert_eq!(ids.len(), 20);
        assert_eq!(freqs.len(), 20);

        cache.get_evict_ids(15);
        assert_eq!(cache.size(), 15);
        let (ids, _) = cache.get_cached_ids(20);
        assert_eq!(ids.len(), 15);
    }

    #[test]
    fn test_lfu_get_cached_ids() {
        let cache = LfuCache::new();
        round_robin(&cache, 30, 100);
        assert_eq!(cache.size(), 30);

        let (ids, freqs) = cache.get_cached_ids(20);
        assert_eq!(ids.len(), 20);
        // Hottest first: the 4-touch group (ids 0..9) leads.
        for id in ids.iter().take(10) {
            assert!(*id < 10, "expected a 4-touch id first, got {id}");
        }
        assert!(freqs.windows(2).all(|w| w[0] >= w[1]));

        cache.get_evict_ids(15);
        assert_eq!(cache.size(), 15);
        let (ids, _) = cache.get_cached_ids(20);
        assert_eq!(ids.len(), 15);
    }

    #[test]
    fn test_touch_with_batched_count() {
        let cache = LfuCache::new();
        cache.touch(1, 5);
        cache.touch(2, 1);
        let (ids, freqs) = cache.get_cached_ids(10);
        assert_eq!(ids[0], 1);
        assert_eq!(freqs[0], 5);
        assert_eq!(cache.size(), 2);
    }

    #[test]
    fn test_lru_touch_promotes() {
        let cache = LruCache::new();
        cache.update(&[1, 2, 3]);
        cache.touch(1, 1);
        // 2 is now the coldest.
        assert_eq!(cache.get_evict_ids(1), vec![2]);
    }

    #[test]
    fn test_create_cache_by_strategy() {
        let lru = create_cache(CacheStrategy::Lru);
        lru.update(&[1, 2]);
        assert_eq!(lru.size(), 2);

        let lfu = create_cache(CacheStrategy::Lfu);
        lfu.update(&[1, 2]);
        assert_eq!(lfu.size(), 2);
    }
}
