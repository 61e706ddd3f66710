//! URL canonicalization and the bounded verification cache.
//!
//! [`canonicalize`] is the single normalization function in the entire
//! engine: the cache key for a candidate and the address later fetched to
//! verify it are both derived from it, so the two can never diverge.
//! Re-deriving either through any other path is a bug.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use url::Url;

use ditta_shared::Candidate;

// ---------------------------------------------------------------------------
// Canonicalization
// ---------------------------------------------------------------------------

/// Normalize a URL or bare domain to one stable form: scheme stripped,
/// leading `www.` stripped, host lowercased, query/fragment dropped,
/// trailing slash removed. Idempotent.
pub fn canonicalize(raw: &str) -> String {
    let trimmed = raw.trim();
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };

    match Url::parse(&with_scheme) {
        Ok(url) => {
            let host = url.host_str().unwrap_or("").to_lowercase();
            let host = host.strip_prefix("www.").unwrap_or(&host);
            let path = url.path().trim_end_matches('/');
            format!("{host}{path}")
        }
        Err(_) => trimmed.trim_end_matches('/').to_lowercase(),
    }
}

/// The one address ever fetched for a canonical key. Keeping this next to
/// [`canonicalize`] is what guarantees cache key and verification target
/// always agree.
pub fn fetch_url(canonical: &str) -> String {
    format!("https://{canonical}")
}

// ---------------------------------------------------------------------------
// VerificationCache
// ---------------------------------------------------------------------------

/// Outcome of verifying a candidate URL against a company's signals.
#[derive(Debug, Clone)]
pub enum CacheOutcome {
    /// The page matched the company; the candidate is reusable as-is.
    Verified(Candidate),
    /// The page was reachable but did not match; don't re-verify.
    Rejected,
}

struct Entry {
    outcome: CacheOutcome,
    inserted_at: Instant,
}

struct CacheInner {
    map: HashMap<String, Entry>,
    /// Insertion order for capacity eviction.
    order: VecDeque<String>,
}

/// Bounded verification cache with both TTL and capacity eviction.
pub struct VerificationCache {
    capacity: usize,
    ttl: Duration,
    inner: Mutex<CacheInner>,
}

impl VerificationCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            inner: Mutex::new(CacheInner {
                map: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// Look up a canonical key. Expired entries are dropped on read.
    pub fn get(&self, canonical: &str) -> Option<CacheOutcome> {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        match inner.map.get(canonical) {
            Some(entry) => {
                if entry.inserted_at.elapsed() < self.ttl {
                    return Some(entry.outcome.clone());
                }
            }
            None => return None,
        }
        inner.map.remove(canonical);
        None
    }

    /// Insert an outcome under a canonical key, evicting the oldest entries
    /// once over capacity.
    pub fn insert(&self, canonical: &str, outcome: CacheOutcome) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");

        if inner.map.insert(
            canonical.to_string(),
            Entry {
                outcome,
                inserted_at: Instant::now(),
            },
        )
        .is_none()
        {
            inner.order.push_back(canonical.to_string());
        }

        while inner.map.len() > self.capacity {
            match inner.order.pop_front() {
                Some(oldest) => {
                    inner.map.remove(&oldest);
                }
                None => break,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache lock poisoned").map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
