//! A simple expiry-based answer cache, shared between resolvers.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use dns_model::name::DomainName;
use dns_model::rr::{RecordClass, RecordType};

use crate::answer::Answer;

/// What answers are cached under: the question name, type, and class.
pub type CacheKey = (DomainName, RecordType, RecordClass);

/// The operations a resolver needs from an answer cache.  Both
/// [`Cache`] and [`crate::lru::LruCache`] implement this, so a
/// resolver can hold either behind an `Arc<dyn AnswerCache>`.
pub trait AnswerCache: Send + Sync {
    /// Get a live answer, or `None`.  Never returns a stale entry.
    fn get(&self, key: &CacheKey) -> Option<Answer>;

    /// Associate a key with an answer.
    fn put(&self, key: CacheKey, answer: Answer);

    /// Drop one entry, or every entry when no key is given.
    fn flush(&self, key: Option<&CacheKey>);
}

/// How often expired entries are swept out, unless configured
/// otherwise.
pub const DEFAULT_CLEANING_INTERVAL: Duration = Duration::from_secs(300);

pub(crate) const MUTEX_POISON_MESSAGE: &str =
    "[INTERNAL ERROR] cache mutex poisoned, cannot recover from this - aborting";

/// A thread-safe answer cache with periodic cleaning.
///
/// Entries are dropped lazily: a sweep runs when a `get` or `put`
/// notices the cleaning interval has elapsed, and `get` additionally
/// checks the freshness of the specific entry it returns.
#[derive(Debug)]
pub struct Cache {
    inner: Mutex<CacheInner>,
}

#[derive(Debug)]
struct CacheInner {
    data: HashMap<CacheKey, Answer>,
    cleaning_interval: Duration,
    next_cleaning: SystemTime,
}

impl Cache {
    pub fn new() -> Self {
        Self::with_cleaning_interval(DEFAULT_CLEANING_INTERVAL)
    }

    pub fn with_cleaning_interval(cleaning_interval: Duration) -> Self {
        Cache {
            inner: Mutex::new(CacheInner {
                data: HashMap::new(),
                cleaning_interval,
                next_cleaning: SystemTime::now() + cleaning_interval,
            }),
        }
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheInner {
    /// Sweep out expired entries if it's time to do so.
    fn maybe_clean(&mut self) {
        let now = SystemTime::now();
        if self.next_cleaning <= now {
            self.data.retain(|_, answer| answer.is_fresh(now));
            self.next_cleaning = SystemTime::now() + self.cleaning_interval;
        }
    }
}

impl AnswerCache for Cache {
    fn get(&self, key: &CacheKey) -> Option<Answer> {
        let mut inner = self.inner.lock().expect(MUTEX_POISON_MESSAGE);
        inner.maybe_clean();
        inner
            .data
            .get(key)
            .filter(|answer| answer.is_fresh(SystemTime::now()))
            .cloned()
    }

    fn put(&self, key: CacheKey, answer: Answer) {
        let mut inner = self.inner.lock().expect(MUTEX_POISON_MESSAGE);
        inner.maybe_clean();
        inner.data.insert(key, answer);
    }

    fn flush(&self, key: Option<&CacheKey>) {
        let mut inner = self.inner.lock().expect(MUTEX_POISON_MESSAGE);
        match key {
            Some(key) => {
                inner.data.remove(key);
            }
            None => {
                inner.data = HashMap::new();
                inner.next_cleaning = SystemTime::now() + inner.cleaning_interval;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use dns_model::rr::Rrset;
    use dns_model::test_util::*;

    use super::*;

    /// A positive answer with the given time left to live.
    pub fn answer_with_ttl(name: &str, ttl_left: Duration) -> Answer {
        let rrset = a_rrset(name, "1.2.3.4", 300);
        answer_with_rrset(name, rrset, ttl_left)
    }

    pub fn answer_with_rrset(name: &str, rrset: Rrset, ttl_left: Duration) -> Answer {
        Answer {
            qname: domain(name),
            rtype: rrset.rtype,
            rclass: RecordClass::IN,
            canonical_name: rrset.name.clone(),
            rrset: Some(rrset.clone()),
            response: response(name, rrset.rtype, std::slice::from_ref(&rrset), &[]),
            expiration: SystemTime::now() + ttl_left,
            nameserver: None,
            port: None,
        }
    }

    pub fn key(name: &str) -> CacheKey {
        (domain(name), RecordType::A, RecordClass::IN)
    }
}

#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;

    #[test]
    fn cache_put_can_get() {
        let cache = Cache::new();
        cache.put(
            key("www.example.com."),
            answer_with_ttl("www.example.com.", Duration::from_secs(300)),
        );

        let answer = cache.get(&key("www.example.com.")).unwrap();
        assert_eq!(answer.qname, key("www.example.com.").0);
    }

    #[test]
    fn cache_get_misses_unknown_key() {
        let cache = Cache::new();
        assert!(cache.get(&key("www.example.com.")).is_none());
    }

    #[test]
    fn cache_get_never_returns_stale_entries() {
        // a long cleaning interval, so only the per-entry check can
        // keep the stale answer from escaping
        let cache = Cache::with_cleaning_interval(Duration::from_secs(3600));
        cache.put(
            key("www.example.com."),
            answer_with_ttl("www.example.com.", Duration::ZERO),
        );

        assert!(cache.get(&key("www.example.com.")).is_none());
    }

    #[test]
    fn cache_cleaning_sweeps_expired_entries() {
        let cache = Cache::with_cleaning_interval(Duration::ZERO);
        cache.put(
            key("stale.example.com."),
            answer_with_ttl("stale.example.com.", Duration::ZERO),
        );
        cache.put(
            key("live.example.com."),
            answer_with_ttl("live.example.com.", Duration::from_secs(300)),
        );

        // the sweep runs on this put, evicting the expired entry
        cache.put(
            key("other.example.com."),
            answer_with_ttl("other.example.com.", Duration::from_secs(300)),
        );

        let inner = cache.inner.lock().unwrap();
        assert!(!inner.data.contains_key(&key("stale.example.com.")));
        assert!(inner.data.contains_key(&key("live.example.com.")));
    }

    #[test]
    fn cache_flush_one_key() {
        let cache = Cache::new();
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
    }

    #[test]
    fn cache_flush_everything() {
        let cache = Cache::new();
        cache.put(
            key("a.example.com."),
            answer_with_ttl("a.example.com.", Duration::from_secs(300)),
        );

        cache.flush(None);

        assert!(cache.get(&key("a.example.com.")).is_none());
    }
}
