use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hickory_proto::op::Message;
use moka::sync::Cache;
use rustc_hash::FxHasher;

use crate::message;

/// Cached response plus the fields needed to verify a hash collision and to
/// decide freshness. Expiry lives in the entry rather than in moka's TTL so
/// an expired entry can still be served optimistically.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    response: Message,
    expires_at: Instant,
    upstream_id: Option<i32>,
    qname: Arc<str>,
    qtype: u16,
    qclass: u16,
    checking_disabled: bool,
}

/// Outcome of a lookup. `expired` is meaningful only when `entry` hit.
pub struct CacheHit {
    pub response: Message,
    pub upstream_id: Option<i32>,
    pub expired: bool,
}

#[derive(Clone)]
pub struct ResponseCache {
    inner: Option<Cache<u64, Arc<CacheEntry>>>,
}

struct QuestionKey {
    qname: String,
    qtype: u16,
    qclass: u16,
    checking_disabled: bool,
}

impl QuestionKey {
    fn of(request: &Message) -> Option<Self> {
        let question = request.queries().first()?;
        Some(Self {
            qname: message::normalize_domain(question.name()),
            qtype: u16::from(question.query_type()),
            qclass: u16::from(question.query_class()),
            checking_disabled: request.checking_disabled(),
        })
    }

    fn hash(&self) -> u64 {
        let mut h = FxHasher::default();
        self.qname.hash(&mut h);
        self.qtype.hash(&mut h);
        self.qclass.hash(&mut h);
        self.checking_disabled.hash(&mut h);
        h.finish()
    }

    fn matches(&self, entry: &CacheEntry) -> bool {
        entry.qtype == self.qtype
            && entry.qclass == self.qclass
            && entry.checking_disabled == self.checking_disabled
            && entry.qname.as_ref() == self.qname
    }
}

impl ResponseCache {
    /// Capacity 0 disables the cache entirely.
    pub fn new(capacity: u64) -> Self {
        let inner = (capacity > 0).then(|| Cache::builder().max_capacity(capacity).build());
        Self { inner }
    }

    /// Look the request's question up. The returned response carries the
    /// request's transaction id.
    pub fn get(&self, request: &Message) -> Option<CacheHit> {
        let key = QuestionKey::of(request)?;
        let mut hit = self.lookup_key(&key)?;
        hit.response.set_id(request.id());
        Some(hit)
    }

    /// Hot-path lookup from a quick-parsed question (normalized qname, no
    /// trailing dot). The caller rewrites the transaction id.
    pub fn lookup(
        &self,
        qname: &str,
        qtype: u16,
        qclass: u16,
        checking_disabled: bool,
    ) -> Option<CacheHit> {
        let key = QuestionKey {
            qname: qname.to_ascii_lowercase(),
            qtype,
            qclass,
            checking_disabled,
        };
        self.lookup_key(&key)
    }

    fn lookup_key(&self, key: &QuestionKey) -> Option<CacheHit> {
        let cache = self.inner.as_ref()?;
        let entry = cache.get(&key.hash())?;
        if !key.matches(&entry) {
            return None;
        }
        Some(CacheHit {
            response: entry.response.clone(),
            upstream_id: entry.upstream_id,
            expired: Instant::now() >= entry.expires_at,
        })
    }

    /// Store a response under the request's question. Responses without a
    /// positive minimum TTL are not cached.
    pub fn put(&self, request: &Message, response: Message, upstream_id: Option<i32>) {
        let Some(cache) = self.inner.as_ref() else { return };
        let Some(key) = QuestionKey::of(request) else { return };
        let ttl = message::min_ttl(&response).unwrap_or(0);
        if ttl == 0 {
            return;
        }
        let entry = CacheEntry {
            response,
            expires_at: Instant::now() + Duration::from_secs(ttl as u64),
            upstream_id,
            qname: Arc::from(key.qname.as_str()),
            qtype: key.qtype,
            qclass: key.qclass,
            checking_disabled: key.checking_disabled,
        };
        cache.insert(key.hash(), Arc::new(entry));
    }

    pub fn erase(&self, request: &Message) {
        let Some(cache) = self.inner.as_ref() else { return };
        if let Some(key) = QuestionKey::of(request) {
            cache.invalidate(&key.hash());
        }
    }

    pub fn clear(&self) {
        if let Some(cache) = self.inner.as_ref() {
            cache.invalidate_all();
        }
    }
}
