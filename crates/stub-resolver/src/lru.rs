//! A bounded, least-recently-used answer cache.
//!
//! Better than the simple cache for processes doing very large
//! numbers of resolutions: it has a maximum number of entries, and
//! when it is full the least-recently-used entry is removed to make
//! space for a new one.
//!
//! The recency list is a circular doubly-linked list threaded through
//! an arena of nodes by index, with a sentinel at index zero: the node
//! after the sentinel is the most recently used, the node before it is
//! the eviction victim.  Index links sidestep the ownership questions
//! a pointer-linked cyclic list would raise.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::SystemTime;

use crate::answer::Answer;
use crate::cache::{AnswerCache, CacheKey, MUTEX_POISON_MESSAGE};

/// How many entries an `LruCache` holds unless configured otherwise.
pub const DEFAULT_MAX_SIZE: usize = 100_000;

const SENTINEL: usize = 0;

/// A thread-safe, bounded, least-recently-used answer cache.
#[derive(Debug)]
pub struct LruCache {
    inner: Mutex<LruInner>,
}

#[derive(Debug)]
struct LruInner {
    /// INVARIANT: maps exactly the keys of the linked nodes to their
    /// arena indices.
    map: HashMap<CacheKey, usize>,

    /// The arena.  Index 0 is the sentinel, which never holds an
    /// entry.
    nodes: Vec<Node>,

    /// Arena indices free for reuse.
    free: Vec<usize>,

    /// INVARIANT: `map.len() <= max_size` and `max_size >= 1`.
    max_size: usize,
}

#[derive(Debug)]
struct Node {
    prev: usize,
    next: usize,
    entry: Option<(CacheKey, Answer)>,
}

impl LruCache {
    pub fn new() -> Self {
        Self::with_max_size(DEFAULT_MAX_SIZE)
    }

    /// Create a cache holding at most `max_size` entries.  Sizes below
    /// one are clamped to one.
    pub fn with_max_size(max_size: usize) -> Self {
        LruCache {
            inner: Mutex::new(LruInner {
                map: HashMap::new(),
                nodes: vec![Node {
                    prev: SENTINEL,
                    next: SENTINEL,
                    entry: None,
                }],
                free: Vec::new(),
                max_size: max_size.max(1),
            }),
        }
    }

    /// Change the bound.  A smaller bound takes effect on the next
    /// `put`.
    pub fn set_max_size(&self, max_size: usize) {
        let mut inner = self.inner.lock().expect(MUTEX_POISON_MESSAGE);
        inner.max_size = max_size.max(1);
    }
}

impl Default for LruCache {
    fn default() -> Self {
        Self::new()
    }
}

impl LruInner {
    fn unlink(&mut self, index: usize) {
        let (prev, next) = (self.nodes[index].prev, self.nodes[index].next);
        self.nodes[prev].next = next;
        self.nodes[next].prev = prev;
    }

    /// Splice a node in just after the sentinel, making it the most
    /// recently used.
    fn link_front(&mut self, index: usize) {
        let head = self.nodes[SENTINEL].next;
        self.nodes[index].prev = SENTINEL;
        self.nodes[index].next = head;
        self.nodes[head].prev = index;
        self.nodes[SENTINEL].next = index;
    }

    fn alloc(&mut self, key: CacheKey, answer: Answer) -> usize {
        let entry = Some((key, answer));
        if let Some(index) = self.free.pop() {
            self.nodes[index].entry = entry;
            index
        } else {
            self.nodes.push(Node {
                prev: SENTINEL,
                next: SENTINEL,
                entry,
            });
            self.nodes.len() - 1
        }
    }

    /// Drop an already-unlinked node and its map entry.
    fn release(&mut self, index: usize) {
        if let Some((key, _)) = self.nodes[index].entry.take() {
            self.map.remove(&key);
        }
        self.nodes[index].prev = index;
        self.nodes[index].next = index;
        self.free.push(index);
    }
}

impl AnswerCache for LruCache {
    fn get(&self, key: &CacheKey) -> Option<Answer> {
        let mut inner = self.inner.lock().expect(MUTEX_POISON_MESSAGE);

        let index = *inner.map.get(key)?;

        // unlink now: the node either moves to the front or is freed
        inner.unlink(index);

        let fresh = match &inner.nodes[index].entry {
            Some((_, answer)) => answer.is_fresh(SystemTime::now()),
            None => false,
        };
        if !fresh {
            inner.release(index);
            return None;
        }

        inner.link_front(index);
        inner.nodes[index]
            .entry
            .as_ref()
            .map(|(_, answer)| answer.clone())
    }

    fn put(&self, key: CacheKey, answer: Answer) {
        let mut inner = self.inner.lock().expect(MUTEX_POISON_MESSAGE);

        let existing = inner.map.get(&key).copied();
        if let Some(index) = existing {
            inner.unlink(index);
            inner.release(index);
        }

        while inner.map.len() >= inner.max_size {
            let victim = inner.nodes[SENTINEL].prev;
            inner.unlink(victim);
            inner.release(victim);
        }

        let index = inner.alloc(key.clone(), answer);
        inner.link_front(index);
        inner.map.insert(key, index);
    }

    fn flush(&self, key: Option<&CacheKey>) {
        let mut inner = self.inner.lock().expect(MUTEX_POISON_MESSAGE);

        match key {
            Some(key) => {
                let existing = inner.map.get(key).copied();
                if let Some(index) = existing {
                    inner.unlink(index);
                    inner.release(index);
                }
            }
            None => {
                // rebuild the arena rather than walk it: this breaks
                // every link at once so entries are released promptly
                inner.map = HashMap::new();
                inner.nodes = vec![Node {
                    prev: SENTINEL,
                    next: SENTINEL,
                    entry: None,
                }];
                inner.free = Vec::new();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use dns_model::test_util::*;

    use crate::cache::test_util::*;

    use super::*;

    #[test]
    fn lru_put_can_get() {
        let cache = LruCache::new();
        cache.put(
            key("www.example.com."),
            answer_with_ttl("www.example.com.", Duration::from_secs(300)),
        );

        assert!(cache.get(&key("www.example.com.")).is_some());
        assert_invariants(&cache);
    }

    #[test]
    fn lru_never_exceeds_max_size() {
        let cache = LruCache::with_max_size(3);

        for i in 0..10 {
            let name = format!("host{i}.example.com.");
            cache.put(key(&name), answer_with_ttl(&name, Duration::from_secs(300)));

            let inner = cache.inner.lock().unwrap();
            assert!(inner.map.len() <= 3);
            drop(inner);
            assert_invariants(&cache);
        }
    }

    #[test]
    fn lru_evicts_least_recently_used() {
        let cache = LruCache::with_max_size(2);
        cache.put(
            key("a.example.com."),
            answer_with_ttl("a.example.com.", Duration::from_secs(300)),
        );
        cache.put(
            key("b.example.com."),
            answer_with_ttl("b.example.com.", Duration::from_secs(300)),
        );

        // touch a, so b becomes the victim
        assert!(cache.get(&key("a.example.com.")).is_some());

        cache.put(
            key("c.example.com."),
            answer_with_ttl("c.example.com.", Duration::from_secs(300)),
        );

        assert!(cache.get(&key("a.example.com.")).is_some());
        assert!(cache.get(&key("b.example.com.")).is_none());
        assert!(cache.get(&key("c.example.com.")).is_some());
        assert_invariants(&cache);
    }

    #[test]
    fn lru_get_drops_expired_entries() {
        let cache = LruCache::new();
        cache.put(
            key("www.example.com."),
            answer_with_ttl("www.example.com.", Duration::ZERO),
        );

        assert!(cache.get(&key("www.example.com.")).is_none());

        let inner = cache.inner.lock().unwrap();
        assert!(inner.map.is_empty());
    }

    #[test]
    fn lru_put_replaces_existing_key() {
        let cache = LruCache::with_max_size(2);
        cache.put(
            key("www.example.com."),
            answer_with_ttl("www.example.com.", Duration::from_secs(100)),
        );
        cache.put(
            key("www.example.com."),
            answer_with_ttl("www.example.com.", Duration::from_secs(300)),
        );

        let inner = cache.inner.lock().unwrap();
        assert_eq!(1, inner.map.len());
        drop(inner);
        assert_invariants(&cache);
    }

    #[test]
    fn lru_zero_size_clamps_to_one() {
        let cache = LruCache::with_max_size(0);
        cache.put(
            key("a.example.com."),
            answer_with_ttl("a.example.com.", Duration::from_secs(300)),
        );
        cache.put(
            key("b.example.com."),
            answer_with_ttl("b.example.com.", Duration::from_secs(300)),
        );

        let inner = cache.inner.lock().unwrap();
        assert_eq!(1, inner.map.len());
    }

    #[test]
    fn lru_flush_one_key() {
        let cache = LruCache::new();
        cache.put(
            key("a.example.com."),
            answer_with_ttl("a.example.com.", Duration::from_secs(300)),
        );
        cache.put(
            key("b.example.com."),
            answer_with_ttl("b.example.com.", Duration::from_secs(300)),
        );

        cache.flush(Some(&key("a.example.com.")));

        assert!(cache.get(&key("a.example.com.")).is_none());
        assert!(cache.get(&key("b.example.com.")).is_some());
        assert_invariants(&cache);
    }

    #[test]
    fn lru_flush_everything() {
        let cache = LruCache::new();
        for i in 0..10 {
            let name = format!("host{i}.example.com.");
            cache.put(key(&name), answer_with_ttl(&name, Duration::from_secs(300)));
        }

        cache.flush(None);

        let inner = cache.inner.lock().unwrap();
        assert!(inner.map.is_empty());
        assert_eq!(1, inner.nodes.len());
        drop(inner);
        assert_invariants(&cache);
    }

    #[test]
    fn lru_random_workload_maintains_invariants() {
        let cache = LruCache::with_max_size(8);

        for _ in 0..200 {
            let rrset = arbitrary_rrset();
            let name = rrset.name.to_dotted_string();
            let cache_key = (rrset.name.clone(), rrset.rtype, rrset.rclass);
            cache.put(
                cache_key.clone(),
                answer_with_rrset(&name, rrset, Duration::from_secs(300)),
            );
            cache.get(&cache_key);
            assert_invariants(&cache);
        }
    }

    /// The recency list is circular through the sentinel and holds
    /// exactly the nodes the map points at.
    fn assert_invariants(cache: &LruCache) {
        let inner = cache.inner.lock().unwrap();

        assert!(inner.map.len() <= inner.max_size);

        let mut seen = 0;
        let mut index = inner.nodes[SENTINEL].next;
        while index != SENTINEL {
            let node = &inner.nodes[index];
            let (node_key, _) = node.entry.as_ref().unwrap();
            assert_eq!(Some(&index), inner.map.get(node_key));

            assert_eq!(index, inner.nodes[node.next].prev);
            assert_eq!(index, inner.nodes[node.prev].next);

            seen += 1;
            index = node.next;
            assert!(seen <= inner.map.len(), "list longer than map");
        }

        assert_eq!(inner.map.len(), seen);
    }
}
