//! Website resolution strategies.
//!
//! All candidate URLs pass through one verification helper that derives both
//! the cache key and the fetch target from [`canonicalize`], so the two can
//! never disagree.

use async_trait::async_trait;
use scraper::Html;
use serde::Deserialize;
use tracing::debug;

use ditta_shared::{Candidate, CompanyRecord, Result, Source};

use crate::cache::{CacheOutcome, canonicalize, fetch_url};
use crate::strategy::{ResolveContext, Strategy, StrategyOutcome};

/// Minimum verification score for a page to count as the company's site.
const MIN_VERIFY_SCORE: f64 = 0.45;

/// Hosts that are directories/aggregators, never a company's own site.
const DIRECTORY_HOSTS: &[&str] = &[
    "paginegialle.it",
    "paginebianche.it",
    "registroimprese.it",
    "facebook.com",
    "instagram.com",
    "linkedin.com",
    "wikipedia.org",
    "tripadvisor.it",
    "yelp.it",
];

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

/// A candidate URL that verified against the record's signals.
pub(crate) struct Verification {
    pub canonical: String,
    pub score: f64,
    pub signal: String,
}

/// Verify that the page behind `raw_url` belongs to `record`.
///
/// The canonical form of `raw_url` is the cache key AND (via [`fetch_url`])
/// the address fetched — the one normalization shared by both paths.
pub(crate) async fn verify_candidate(
    record: &CompanyRecord,
    raw_url: &str,
    source_label: &str,
    cx: &ResolveContext,
) -> Result<Option<Verification>> {
    let key = canonicalize(raw_url);
    if key.is_empty() {
        return Ok(None);
    }

    if let Some(outcome) = cx.cache.get(&key) {
        debug!(key = %key, "verification cache hit");
        return Ok(match outcome {
            CacheOutcome::Verified(c) => Some(Verification {
                canonical: key,
                score: c.confidence,
                signal: "cached verification".into(),
            }),
            CacheOutcome::Rejected => None,
        });
    }

    let page = cx.governed_fetch(&fetch_url(&key), source_label).await?;
    let (score, signal) = score_page(record, &page.body);

    if score >= MIN_VERIFY_SCORE {
        cx.cache.insert(
            &key,
            CacheOutcome::Verified(Candidate::new(&key, score, Source::CompanyWebsite)),
        );
        Ok(Some(Verification {
            canonical: key,
            score,
            signal,
        }))
    } else {
        cx.cache.insert(&key, CacheOutcome::Rejected);
        Ok(None)
    }
}

/// Score a fetched page against the record's identity signals.
/// Returns the score and a human-readable account of what matched.
fn score_page(record: &CompanyRecord, body: &str) -> (f64, String) {
    let doc = Html::parse_document(body);
    let text = doc.root_element().text().collect::<String>().to_lowercase();
    let text_digits: String = text.chars().filter(|c| c.is_ascii_digit()).collect();

    let mut score = 0.0;
    let mut matched: Vec<String> = Vec::new();

    let tokens = name_tokens(&record.name);
    if !tokens.is_empty() {
        let present = tokens.iter().filter(|t| text.contains(t.as_str())).count();
        let fraction = present as f64 / tokens.len() as f64;
        score += fraction * 0.5;
        if present > 0 {
            matched.push(format!("name {present}/{}", tokens.len()));
        }
    }

    let city = record.city.to_lowercase();
    if !city.is_empty() && text.contains(&city) {
        score += 0.15;
        matched.push("city".into());
    }

    if let Some(phone) = record.phone.as_deref() {
        let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
        if digits.len() >= 6 && text_digits.contains(&digits) {
            score += 0.25;
            matched.push("phone".into());
        }
    }

    if let Some(vat) = record.vat_number.as_deref() {
        let digits: String = vat.chars().filter(|c| c.is_ascii_digit()).collect();
        if digits.len() >= 8 && text_digits.contains(&digits) {
            score += 0.2;
            matched.push("vat".into());
        }
    }

    (score.min(1.0), matched.join(", "))
}

/// Significant lowercase tokens of a company name, legal forms dropped.
fn name_tokens(name: &str) -> Vec<String> {
    const LEGAL_FORMS: &[&str] = &["srl", "srls", "spa", "snc", "sas", "sapa"];
    name.to_lowercase()
        .replace('.', "")
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 2 && !LEGAL_FORMS.contains(t))
        .map(str::to_string)
        .collect()
}

fn is_directory(url: &str) -> bool {
    let host = crate::strategy::host_of(url);
    DIRECTORY_HOSTS.iter().any(|d| host.ends_with(d))
}

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

/// Strategy 0: verify the pre-known website, if the record carries one.
/// A verification-cache hit here is what short-circuits the whole waterfall.
pub struct KnownWebsite;

#[async_trait]
impl Strategy for KnownWebsite {
    fn name(&self) -> &'static str {
        "known-website"
    }

    async fn run(&self, record: &CompanyRecord, cx: &ResolveContext) -> Result<StrategyOutcome> {
        let Some(known) = record.website.as_deref() else {
            return Ok(StrategyOutcome::Miss);
        };

        match verify_candidate(record, known, self.name(), cx).await? {
            Some(v) => Ok(StrategyOutcome::Candidate(
                Candidate::new(v.canonical, v.score, Source::CompanyWebsite).with_signal(v.signal),
            )),
            None => Ok(StrategyOutcome::Miss),
        }
    }
}

/// Strategy 1: deterministic domain guessing from the normalized name.
pub struct DomainGuess;

impl DomainGuess {
    fn guesses(record: &CompanyRecord) -> Vec<String> {
        let tokens = name_tokens(&record.name);
        if tokens.is_empty() {
            return Vec::new();
        }

        let joined = tokens.concat();
        let dashed = tokens.join("-");
        let first = tokens[0].clone();

        let mut guesses = Vec::new();
        for stem in [joined, dashed, first] {
            for tld in [".it", ".com"] {
                let guess = format!("{stem}{tld}");
                if !guesses.contains(&guess) {
                    guesses.push(guess);
                }
            }
        }
        guesses.truncate(5);
        guesses
    }
}

#[async_trait]
impl Strategy for DomainGuess {
    fn name(&self) -> &'static str {
        "domain-guess"
    }

    async fn run(&self, record: &CompanyRecord, cx: &ResolveContext) -> Result<StrategyOutcome> {
        for guess in Self::guesses(record) {
            match verify_candidate(record, &guess, self.name(), cx).await {
                Ok(Some(v)) => {
                    return Ok(StrategyOutcome::Candidate(
                        Candidate::new(v.canonical, v.score, Source::CompanyWebsite)
                            .with_signal(v.signal),
                    ));
                }
                Ok(None) => {}
                Err(e) => {
                    // One unreachable guess must not kill the rest.
                    debug!(guess = %guess, error = %e, "guess fetch failed");
                }
            }
        }
        Ok(StrategyOutcome::Miss)
    }
}

/// Strategy 2: web search plus result verification.
pub struct WebSearch;

#[async_trait]
impl Strategy for WebSearch {
    fn name(&self) -> &'static str {
        "web-search"
    }

    async fn run(&self, record: &CompanyRecord, cx: &ResolveContext) -> Result<StrategyOutcome> {
        let query = format!("\"{}\" {} sito ufficiale", record.name, record.city);
        let target = cx.search.target().to_string();
        let hits = cx
            .governed_call(&target, cx.search.search(&query))
            .await?;

        let own_site_hits: Vec<_> = hits
            .iter()
            .filter(|h| !is_directory(&h.url))
            .take(3)
            .collect();

        for hit in own_site_hits {
            match verify_candidate(record, &hit.url, self.name(), cx).await {
                Ok(Some(v)) => {
                    return Ok(StrategyOutcome::Candidate(
                        Candidate::new(v.canonical, v.score, Source::SearchEngine)
                            .with_signal(format!("{}; {}", hit.title, v.signal)),
                    ));
                }
                Ok(None) => {}
                Err(e) => {
                    debug!(url = %hit.url, error = %e, "search hit verification failed");
                }
            }
        }
        Ok(StrategyOutcome::Miss)
    }
}

/// Strategy 3: public-registry identity lookup by name + locality.
pub struct RegistryIdentity;

#[async_trait]
impl Strategy for RegistryIdentity {
    fn name(&self) -> &'static str {
        "registry-identity"
    }

    async fn run(&self, record: &CompanyRecord, cx: &ResolveContext) -> Result<StrategyOutcome> {
        let target = cx.registry.target().to_string();
        let profile = cx
            .governed_call(&target, cx.registry.search_by_name(&record.name, &record.city))
            .await?;

        let Some(profile) = profile else {
            return Ok(StrategyOutcome::Miss);
        };
        let Some(website) = profile.website.as_deref() else {
            return Ok(StrategyOutcome::Miss);
        };

        let mut candidate =
            Candidate::new(canonicalize(website), 0.9, Source::OfficialRegistry);
        if let Some(legal_name) = &profile.legal_name {
            candidate = candidate.with_signal(format!("registry: {legal_name}"));
        }
        Ok(StrategyOutcome::Candidate(candidate))
    }
}

/// Strategy 4: language-model oracle, last resort. The completion is
/// shape-validated and the proposed site is verified like any other
/// candidate; hallucinated domains die in verification.
pub struct OracleWebsite;

/// Expected completion shape.
#[derive(Debug, Deserialize)]
struct OracleWebsiteAnswer {
    #[serde(default)]
    website: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
}

#[async_trait]
impl Strategy for OracleWebsite {
    fn name(&self) -> &'static str {
        "oracle-website"
    }

    async fn run(&self, record: &CompanyRecord, cx: &ResolveContext) -> Result<StrategyOutcome> {
        let prompt = format!(
            "Qual è il sito web ufficiale di questa azienda italiana?\n\
             Nome: {}\nIndirizzo: {}, {}\n\
             Rispondi solo JSON: {{\"website\": string|null, \"confidence\": number}}",
            record.name, record.address, record.city
        );

        let target = cx.oracle.target().to_string();
        let Some(value) = cx
            .governed_call(&target, cx.oracle.complete_structured(&prompt))
            .await?
        else {
            return Ok(StrategyOutcome::Miss);
        };

        let answer: OracleWebsiteAnswer = match serde_json::from_value(value) {
            Ok(answer) => answer,
            Err(e) => {
                debug!(error = %e, "oracle answer failed shape validation");
                return Ok(StrategyOutcome::Miss);
            }
        };

        let Some(website) = answer.website.filter(|w| !w.trim().is_empty()) else {
            return Ok(StrategyOutcome::Miss);
        };

        match verify_candidate(record, &website, self.name(), cx).await {
            Ok(Some(v)) => Ok(StrategyOutcome::Candidate(
                Candidate::new(v.canonical, v.score, Source::AiInference).with_signal(v.signal),
            )),
            // Unverifiable oracle output stays a weak candidate at best.
            Ok(None) | Err(_) => {
                let confidence = answer.confidence.unwrap_or(0.5).clamp(0.0, 1.0) * 0.4;
                Ok(StrategyOutcome::Candidate(
                    Candidate::new(canonicalize(&website), confidence, Source::AiInference)
                        .with_signal("unverified oracle answer"),
                ))
            }
        }
    }
}
