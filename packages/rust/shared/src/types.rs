//! Core domain types for the ditta resolution engine.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// RecordId
// ---------------------------------------------------------------------------

/// Deterministic identifier for a company record, derived from the normalized
/// name + city + address. The same physical company always maps to the same
/// id, which is what makes job enqueueing idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub String);

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl RecordId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// CorrelationId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper shared by all jobs in one batch run (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    /// Generate a new time-sortable correlation identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for CorrelationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// CompanyRecord
// ---------------------------------------------------------------------------

/// Input business record. Immutable once a job starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanyRecord {
    /// Legal or trade name as supplied.
    pub name: String,
    /// Street address.
    #[serde(default)]
    pub address: String,
    /// Municipality.
    pub city: String,
    /// Province code (e.g., "MI").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub province: Option<String>,
    /// Phone number in any formatting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    /// Pre-known VAT number (partita IVA), if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vat_number: Option<String>,
    /// Pre-known official website, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
}

impl CompanyRecord {
    /// Derive the deterministic record id from normalized name + city + address.
    pub fn record_id(&self) -> RecordId {
        let mut hasher = Sha256::new();
        hasher.update(squash(&self.name));
        hasher.update("|");
        hasher.update(squash(&self.city));
        hasher.update("|");
        hasher.update(squash(&self.address));
        let digest = hasher.finalize();
        // 16 bytes of the digest is plenty for batch-scale uniqueness.
        RecordId(digest[..16].iter().map(|b| format!("{b:02x}")).collect())
    }

    /// A record is structurally valid when it carries at least a name and a city.
    pub fn is_structurally_valid(&self) -> bool {
        !self.name.trim().is_empty() && !self.city.trim().is_empty()
    }
}

/// Lowercase alphanumerics only. Used exclusively for id derivation so that
/// punctuation and spacing differences never split one company into two jobs.
fn squash(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

// ---------------------------------------------------------------------------
// Enrichable fields
// ---------------------------------------------------------------------------

/// The fields the engine tries to resolve for every record.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EnrichField {
    Website,
    VatNumber,
    Revenue,
    Employees,
    PecEmail,
}

impl EnrichField {
    /// All target fields, in resolution order.
    pub const ALL: [EnrichField; 5] = [
        EnrichField::Website,
        EnrichField::VatNumber,
        EnrichField::Revenue,
        EnrichField::Employees,
        EnrichField::PecEmail,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Website => "website",
            Self::VatNumber => "vat_number",
            Self::Revenue => "revenue",
            Self::Employees => "employees",
            Self::PecEmail => "pec_email",
        }
    }
}

impl std::fmt::Display for EnrichField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Source & trust ranking
// ---------------------------------------------------------------------------

/// Provenance of a resolved value. The ordering of `trust()` is the static
/// trust hierarchy used during merge: a field is only overwritten by a value
/// from a source ranked at least as trustworthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// Official company registry (camera di commercio).
    OfficialRegistry,
    /// Validated VAT identifier service.
    VatRegistry,
    /// The company's own website (includes verified domain guesses).
    CompanyWebsite,
    /// Search-engine result, verified but not on the company's own property.
    SearchEngine,
    /// Business directory listing.
    Directory,
    /// Language-model inference or estimate.
    AiInference,
}

impl Source {
    /// Static trust rank. Higher wins during merge.
    pub fn trust(&self) -> u8 {
        match self {
            Self::OfficialRegistry => 50,
            Self::VatRegistry => 40,
            Self::CompanyWebsite => 30,
            Self::SearchEngine => 20,
            Self::Directory => 10,
            Self::AiInference => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OfficialRegistry => "official_registry",
            Self::VatRegistry => "vat_registry",
            Self::CompanyWebsite => "company_website",
            Self::SearchEngine => "search_engine",
            Self::Directory => "directory",
            Self::AiInference => "ai_inference",
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// BlockKind
// ---------------------------------------------------------------------------

/// Closed taxonomy of block/error kinds produced by the failure classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Captcha,
    WafBlock,
    RateLimited,
    ChallengePage,
    Timeout,
    ConnectionRefused,
    EmptyResponse,
    None,
}

impl BlockKind {
    /// Whether this kind represents an actual block/error (anything but `None`).
    pub fn is_block(&self) -> bool {
        !matches!(self, Self::None)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Captcha => "captcha",
            Self::WafBlock => "waf_block",
            Self::RateLimited => "rate_limited",
            Self::ChallengePage => "challenge_page",
            Self::Timeout => "timeout",
            Self::ConnectionRefused => "connection_refused",
            Self::EmptyResponse => "empty_response",
            Self::None => "none",
        }
    }
}

impl std::fmt::Display for BlockKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ReasonCode
// ---------------------------------------------------------------------------

/// Why a field is absent, or why a job terminated the way it did. Every
/// absence and every dead letter carries one of these; nothing disappears
/// without a recorded reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    /// No strategy produced any candidate.
    NoCandidate,
    /// The field's time/cost budget ran out before a candidate was accepted.
    BudgetExhausted,
    /// A strategy confirmed the negative (e.g., target is not a business).
    DefinitiveNegative,
    /// Every relevant target was blocked or too hot to contact.
    TargetBlocked,
    /// The input record failed structural validation.
    InvalidRecord,
    /// The job exhausted its retry attempts on transient failures.
    MaxAttemptsExceeded,
    /// The record was resolved by reusing an already-known duplicate.
    DuplicateOf,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoCandidate => "no_candidate",
            Self::BudgetExhausted => "budget_exhausted",
            Self::DefinitiveNegative => "definitive_negative",
            Self::TargetBlocked => "target_blocked",
            Self::InvalidRecord => "invalid_record",
            Self::MaxAttemptsExceeded => "max_attempts_exceeded",
            Self::DuplicateOf => "duplicate_of",
        }
    }
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Candidate
// ---------------------------------------------------------------------------

/// The output of one strategy for one field. Ephemeral: produced and consumed
/// within a single waterfall run; only the accepted candidate is persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub value: String,
    /// Confidence in [0, 1].
    pub confidence: f64,
    pub source: Source,
    /// Raw evidence the strategy saw (page title, snippet, registry row).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_signal: Option<String>,
}

impl Candidate {
    pub fn new(value: impl Into<String>, confidence: f64, source: Source) -> Self {
        Self {
            value: value.into(),
            confidence: confidence.clamp(0.0, 1.0),
            source,
            raw_signal: None,
        }
    }

    pub fn with_signal(mut self, signal: impl Into<String>) -> Self {
        self.raw_signal = Some(signal.into());
        self
    }
}

// ---------------------------------------------------------------------------
// FieldResult
// ---------------------------------------------------------------------------

/// Final per-field outcome. Either a value with provenance, a best-effort
/// sub-threshold value, or an explicit absence with a reason code — never
/// silently missing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FieldResult {
    Found {
        value: String,
        source: Source,
        confidence: f64,
    },
    LowConfidence {
        value: String,
        source: Source,
        confidence: f64,
    },
    Absent {
        reason: ReasonCode,
    },
}

impl FieldResult {
    pub fn is_found(&self) -> bool {
        matches!(self, Self::Found { .. })
    }

    /// The resolved value, if any (found or low-confidence).
    pub fn value(&self) -> Option<&str> {
        match self {
            Self::Found { value, .. } | Self::LowConfidence { value, .. } => Some(value),
            Self::Absent { .. } => None,
        }
    }

    pub fn source(&self) -> Option<Source> {
        match self {
            Self::Found { source, .. } | Self::LowConfidence { source, .. } => Some(*source),
            Self::Absent { .. } => None,
        }
    }

    pub fn confidence(&self) -> Option<f64> {
        match self {
            Self::Found { confidence, .. } | Self::LowConfidence { confidence, .. } => {
                Some(*confidence)
            }
            Self::Absent { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// EnrichmentResult
// ---------------------------------------------------------------------------

/// Final per-record output: one [`FieldResult`] per target field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentResult {
    pub record_id: RecordId,
    pub correlation_id: CorrelationId,
    pub fields: BTreeMap<EnrichField, FieldResult>,
    pub resolved_at: DateTime<Utc>,
}

impl EnrichmentResult {
    /// Start a result with every field explicitly absent. Waterfalls then
    /// upgrade fields they resolve; the invariant that every field is
    /// accounted for holds from construction.
    pub fn new(record_id: RecordId, correlation_id: CorrelationId) -> Self {
        let fields = EnrichField::ALL
            .iter()
            .map(|f| {
                (
                    *f,
                    FieldResult::Absent {
                        reason: ReasonCode::NoCandidate,
                    },
                )
            })
            .collect();
        Self {
            record_id,
            correlation_id,
            fields,
            resolved_at: Utc::now(),
        }
    }

    pub fn set(&mut self, field: EnrichField, result: FieldResult) {
        self.fields.insert(field, result);
    }

    pub fn get(&self, field: EnrichField) -> Option<&FieldResult> {
        self.fields.get(&field)
    }

    /// True when every target field has an entry.
    pub fn accounts_for_all_fields(&self) -> bool {
        EnrichField::ALL.iter().all(|f| self.fields.contains_key(f))
    }
}

// ---------------------------------------------------------------------------
// Job state machine
// ---------------------------------------------------------------------------

/// Queue-side lifecycle of a resolution job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Active,
    Succeeded,
    Retrying,
    DeadLettered,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::DeadLettered)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Active => "active",
            Self::Succeeded => "succeeded",
            Self::Retrying => "retrying",
            Self::DeadLettered => "dead_lettered",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One failed attempt, kept for the dead-letter history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub error: String,
    pub at: DateTime<Utc>,
}

/// A company record wrapped with its queue bookkeeping. Created by the
/// scheduler, mutated only by the worker that owns it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionJob {
    pub id: RecordId,
    pub record: CompanyRecord,
    pub attempt: u32,
    pub max_attempts: u32,
    pub correlation_id: CorrelationId,
    pub state: JobState,
    /// Failed-attempt history, carried into the dead-letter queue.
    #[serde(default)]
    pub history: Vec<AttemptRecord>,
}
