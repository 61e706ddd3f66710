//! Entity deduplication and trust-ranked field merge.
//!
//! The registry keeps three parallel indices from normalized key to the
//! canonical record id: VAT number, phone digits, and name+locality
//! fingerprint. Duplicate detection walks them most-authoritative-first.
//! Indices grow monotonically for the duration of a batch run; a record is
//! registered exactly once, after its first successful identity confirmation.

pub mod normalize;

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use tracing::debug;

use ditta_shared::{CompanyRecord, EnrichField, EnrichmentResult, FieldResult, RecordId};

use crate::normalize::{fingerprint, name_similarity, normalize_name, phone_digits, vat_digits};

/// Fuzzy-match acceptance ratio (advisory matches only).
const FUZZY_THRESHOLD: f64 = 0.9;

// ---------------------------------------------------------------------------
// Duplicate matches
// ---------------------------------------------------------------------------

/// Which index produced a duplicate match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKey {
    Vat,
    Phone,
    Fingerprint,
}

/// A confirmed duplicate: the canonical record id and the index that matched.
#[derive(Debug, Clone)]
pub struct DuplicateMatch {
    pub canonical: RecordId,
    pub matched_on: MatchKey,
}

// ---------------------------------------------------------------------------
// EntityRegistry
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Indices {
    by_vat: HashMap<String, RecordId>,
    by_phone: HashMap<String, RecordId>,
    by_fingerprint: HashMap<String, RecordId>,
    /// (normalized name, city key, id) rows for advisory fuzzy matching.
    names: Vec<(String, String, RecordId)>,
    registered: HashSet<RecordId>,
}

/// Injectable, internally synchronized duplicate index. One instance per
/// batch run; many workers consult it concurrently.
#[derive(Default)]
pub struct EntityRegistry {
    inner: Mutex<Indices>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find an already-registered duplicate of `record`. Exact keys only,
    /// most authoritative first: VAT → phone digits → name+city fingerprint.
    pub fn find_duplicate(&self, record: &CompanyRecord) -> Option<DuplicateMatch> {
        let indices = self.inner.lock().expect("registry lock poisoned");

        if let Some(vat) = record.vat_number.as_deref() {
            let key = vat_digits(vat);
            if !key.is_empty() {
                if let Some(id) = indices.by_vat.get(&key) {
                    return Some(DuplicateMatch {
                        canonical: id.clone(),
                        matched_on: MatchKey::Vat,
                    });
                }
            }
        }

        if let Some(phone) = record.phone.as_deref() {
            let key = phone_digits(phone);
            if key.len() >= 6 {
                if let Some(id) = indices.by_phone.get(&key) {
                    return Some(DuplicateMatch {
                        canonical: id.clone(),
                        matched_on: MatchKey::Phone,
                    });
                }
            }
        }

        let fp = fingerprint(&record.name, &record.city);
        if let Some(id) = indices.by_fingerprint.get(&fp) {
            return Some(DuplicateMatch {
                canonical: id.clone(),
                matched_on: MatchKey::Fingerprint,
            });
        }

        None
    }

    /// Advisory fuzzy match: same city, edit-distance ratio >= 0.9 after
    /// suffix stripping. Used only when exact keys found nothing; never
    /// authoritative on its own.
    pub fn fuzzy_candidate(&self, record: &CompanyRecord) -> Option<RecordId> {
        let name = normalize_name(&record.name);
        let city_key: String = record
            .city
            .chars()
            .filter(|c| c.is_alphanumeric())
            .flat_map(|c| c.to_lowercase())
            .collect();

        let indices = self.inner.lock().expect("registry lock poisoned");
        indices
            .names
            .iter()
            .filter(|(_, city, _)| *city == city_key)
            .map(|(candidate, _, id)| (name_similarity(&name, candidate), id))
            .filter(|(score, _)| *score >= FUZZY_THRESHOLD)
            .max_by(|(a, _), (b, _)| a.total_cmp(b))
            .map(|(_, id)| id.clone())
    }

    /// Register a record under every key it supplies. Idempotent: a record id
    /// is indexed at most once, and an existing key is never overwritten (the
    /// first registrant stays canonical).
    pub fn register(&self, record: &CompanyRecord, id: &RecordId) {
        let mut indices = self.inner.lock().expect("registry lock poisoned");
        if !indices.registered.insert(id.clone()) {
            return;
        }

        if let Some(vat) = record.vat_number.as_deref() {
            let key = vat_digits(vat);
            if !key.is_empty() {
                indices.by_vat.entry(key).or_insert_with(|| id.clone());
            }
        }

        if let Some(phone) = record.phone.as_deref() {
            let key = phone_digits(phone);
            if key.len() >= 6 {
                indices.by_phone.entry(key).or_insert_with(|| id.clone());
            }
        }

        let fp = fingerprint(&record.name, &record.city);
        indices.by_fingerprint.entry(fp).or_insert_with(|| id.clone());

        let city_key: String = record
            .city
            .chars()
            .filter(|c| c.is_alphanumeric())
            .flat_map(|c| c.to_lowercase())
            .collect();
        let name = normalize_name(&record.name);
        indices.names.push((name, city_key, id.clone()));

        debug!(record_id = %id, "entity registered");
    }

    /// Number of registered entities (for run summaries).
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .registered
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

/// Merge two enrichment results claiming the same entity. Per field, the
/// static trust ranking decides which value survives: a field is only
/// overwritten by a value from a source ranked at least as trustworthy as the
/// field's current provenance. Non-destructive for fields the incoming result
/// does not supply.
pub fn merge(existing: &EnrichmentResult, incoming: &EnrichmentResult) -> EnrichmentResult {
    let mut merged = existing.clone();

    for field in EnrichField::ALL {
        let Some(theirs) = incoming.get(field) else {
            continue;
        };
        if theirs.value().is_none() {
            continue;
        }

        let winner = match merged.get(field) {
            Some(ours) if ours.value().is_some() => {
                if rank(theirs) >= rank(ours) {
                    theirs.clone()
                } else {
                    ours.clone()
                }
            }
            _ => theirs.clone(),
        };
        merged.set(field, winner);
    }

    merged
}

/// Comparable rank for a field result: trust first, full-confidence outcomes
/// over low-confidence ones, then raw confidence.
fn rank(result: &FieldResult) -> (u8, bool, f64) {
    (
        result.source().map(|s| s.trust()).unwrap_or(0),
        result.is_found(),
        result.confidence().unwrap_or(0.0),
    )
}
