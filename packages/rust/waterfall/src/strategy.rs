//! The confidence-gated strategy waterfall.
//!
//! A waterfall is data: an ordered list of strategies plus an acceptance
//! threshold and a soft time budget. Strategies run strictly in priority
//! order, never concurrently — each result informs whether the next should
//! run at all, which is what keeps call costs under control.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use ditta_governor::{FailureClassifier, RateGovernor};
use ditta_shared::{
    BlockKind, Candidate, CompanyRecord, DittaError, EnrichField, FieldResult, ReasonCode, Result,
};

use crate::cache::{VerificationCache, canonicalize};
use crate::providers::{FetchedPage, Oracle, PageFetcher, RegistryProvider, SearchProvider};

// ---------------------------------------------------------------------------
// ResolveContext
// ---------------------------------------------------------------------------

/// Everything a strategy may touch: the shared governor, classifier, and
/// cache, plus the external collaborators. Explicitly owned and injected —
/// no globals, so isolated tests and concurrent batch runs don't
/// cross-contaminate.
pub struct ResolveContext {
    pub governor: Arc<RateGovernor>,
    pub classifier: Arc<FailureClassifier>,
    pub cache: Arc<VerificationCache>,
    pub fetcher: Arc<dyn PageFetcher>,
    pub search: Arc<dyn SearchProvider>,
    pub registry: Arc<dyn RegistryProvider>,
    pub vat_service: Arc<dyn RegistryProvider>,
    pub oracle: Arc<dyn Oracle>,
}

impl ResolveContext {
    /// Fetch a page under full governance: hot-target advisory check, rate
    /// slot, classification of the outcome, and success/failure reporting —
    /// all keyed on the target host so other targets are unaffected.
    pub async fn governed_fetch(&self, url: &str, source: &str) -> Result<FetchedPage> {
        let host = host_of(url);

        if self.classifier.is_hot(&host) {
            debug!(target = %host, "target is hot, refusing call");
            return Err(DittaError::Blocked {
                kind: BlockKind::RateLimited,
                target: host,
            });
        }

        self.governor.wait_for_slot(&host).await;

        match self.fetcher.fetch(url).await {
            Ok(page) => {
                let signature = self.classifier.classify(page.status, &page.body, &host, source);
                if signature.kind.is_block() {
                    self.governor.report_failure(&host);
                    warn!(target = %host, kind = %signature.kind, signal = %signature.raw_signal, "call blocked");
                    return Err(DittaError::Blocked {
                        kind: signature.kind,
                        target: host,
                    });
                }
                self.governor.report_success(&host);
                Ok(page)
            }
            Err(e) => {
                let signature = self.classifier.classify_error(&e, &host, source);
                self.governor.report_failure(&host);
                warn!(target = %host, kind = %signature.kind, error = %e, "call failed");
                Err(e)
            }
        }
    }

    /// Run a governed call against a named (non-host) target such as a search
    /// backend or registry API.
    pub async fn governed_call<T, F>(&self, target: &str, call: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        if self.classifier.is_hot(target) {
            debug!(target, "target is hot, refusing call");
            return Err(DittaError::Blocked {
                kind: BlockKind::RateLimited,
                target: target.to_string(),
            });
        }

        self.governor.wait_for_slot(target).await;

        match call.await {
            Ok(value) => {
                self.governor.report_success(target);
                Ok(value)
            }
            Err(e) => {
                self.classifier.classify_error(&e, target, target);
                self.governor.report_failure(target);
                Err(e)
            }
        }
    }

}

/// Canonical host of a URL — the rate-governor key for page fetches.
pub fn host_of(url: &str) -> String {
    let canonical = canonicalize(url);
    canonical
        .split('/')
        .next()
        .unwrap_or(&canonical)
        .to_string()
}

// ---------------------------------------------------------------------------
// Strategy
// ---------------------------------------------------------------------------

/// What one strategy produced for one field.
#[derive(Debug, Clone)]
pub enum StrategyOutcome {
    /// A proposed value with confidence and provenance.
    Candidate(Candidate),
    /// Definitive negative: stop the waterfall, the field does not exist
    /// (e.g., target confirmed not to be a business).
    Negative,
    /// Nothing found; try the next strategy.
    Miss,
}

/// One resolution strategy for a single field.
#[async_trait]
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;
    async fn run(&self, record: &CompanyRecord, cx: &ResolveContext) -> Result<StrategyOutcome>;
}

// ---------------------------------------------------------------------------
// Waterfall
// ---------------------------------------------------------------------------

/// Ordered, confidence-gated strategy list for one field.
pub struct Waterfall {
    pub field: EnrichField,
    /// Acceptance threshold; a candidate at or above it stops the run.
    pub threshold: f64,
    /// Soft budget: on expiry no further strategy is launched, but an
    /// in-flight call is allowed to finish.
    pub budget: Duration,
    pub strategies: Vec<Arc<dyn Strategy>>,
}

impl Waterfall {
    /// Run the waterfall for `record`.
    #[instrument(skip_all, fields(field = %self.field, record = %record.record_id()))]
    pub async fn resolve(&self, record: &CompanyRecord, cx: &ResolveContext) -> FieldResult {
        let deadline = Instant::now() + self.budget;
        let mut best: Option<Candidate> = None;
        let mut attempted = 0usize;
        let mut blocked = 0usize;
        let mut budget_expired = false;

        for strategy in &self.strategies {
            if Instant::now() >= deadline {
                budget_expired = true;
                debug!(strategy = strategy.name(), "field budget exhausted, not launching");
                break;
            }
            attempted += 1;

            match strategy.run(record, cx).await {
                Ok(StrategyOutcome::Candidate(candidate)) => {
                    debug!(
                        strategy = strategy.name(),
                        value = %candidate.value,
                        confidence = candidate.confidence,
                        "candidate produced"
                    );
                    if candidate.confidence >= self.threshold {
                        info!(
                            strategy = strategy.name(),
                            value = %candidate.value,
                            confidence = candidate.confidence,
                            "candidate accepted"
                        );
                        return FieldResult::Found {
                            value: candidate.value,
                            source: candidate.source,
                            confidence: candidate.confidence,
                        };
                    }
                    if best
                        .as_ref()
                        .is_none_or(|b| candidate.confidence > b.confidence)
                    {
                        best = Some(candidate);
                    }
                }
                Ok(StrategyOutcome::Negative) => {
                    info!(strategy = strategy.name(), "definitive negative");
                    return FieldResult::Absent {
                        reason: ReasonCode::DefinitiveNegative,
                    };
                }
                Ok(StrategyOutcome::Miss) => {
                    debug!(strategy = strategy.name(), "miss");
                }
                Err(e) => {
                    if matches!(e, DittaError::Blocked { .. }) {
                        blocked += 1;
                    }
                    warn!(
                        strategy = strategy.name(),
                        error = %e,
                        "strategy failed, continuing waterfall"
                    );
                }
            }
        }

        if let Some(candidate) = best {
            return FieldResult::LowConfidence {
                value: candidate.value,
                source: candidate.source,
                confidence: candidate.confidence,
            };
        }

        let reason = if budget_expired {
            ReasonCode::BudgetExhausted
        } else if attempted > 0 && blocked == attempted {
            ReasonCode::TargetBlocked
        } else {
            ReasonCode::NoCandidate
        };
        FieldResult::Absent { reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::testing::{NullOracle, NullRegistry, NullSearch, ScriptedFetcher};

    fn context() -> ResolveContext {
        ResolveContext {
            governor: Arc::new(RateGovernor::new(crate::testing::fast_governor_config())),
            classifier: Arc::new(FailureClassifier::default()),
            cache: Arc::new(VerificationCache::new(64, Duration::from_secs(60))),
            fetcher: Arc::new(ScriptedFetcher::default()),
            search: Arc::new(NullSearch),
            registry: Arc::new(NullRegistry),
            vat_service: Arc::new(NullRegistry),
            oracle: Arc::new(NullOracle),
        }
    }

    fn record() -> CompanyRecord {
        CompanyRecord {
            name: "Rossi Snc".into(),
            address: "Via Roma 1".into(),
            city: "Milano".into(),
            province: None,
            phone: None,
            vat_number: None,
            website: None,
        }
    }

    /// Test strategy returning a fixed outcome and counting invocations.
    struct Fixed {
        name: &'static str,
        outcome: StdMutex<Option<StrategyOutcome>>,
        calls: AtomicUsize,
    }

    impl Fixed {
        fn candidate(name: &'static str, confidence: f64) -> Arc<Self> {
            Arc::new(Self {
                name,
                outcome: StdMutex::new(Some(StrategyOutcome::Candidate(Candidate::new(
                    "rossi.it",
                    confidence,
                    ditta_shared::Source::SearchEngine,
                )))),
                calls: AtomicUsize::new(0),
            })
        }

        fn miss(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                outcome: StdMutex::new(Some(StrategyOutcome::Miss)),
                calls: AtomicUsize::new(0),
            })
        }

        fn negative(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                outcome: StdMutex::new(Some(StrategyOutcome::Negative)),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Strategy for Fixed {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn run(&self, _: &CompanyRecord, _: &ResolveContext) -> Result<StrategyOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .outcome
                .lock()
                .unwrap()
                .clone()
                .expect("outcome configured"))
        }
    }

    #[tokio::test]
    async fn accepts_second_strategy_and_never_runs_third() {
        let below = Fixed::candidate("below", 0.5);
        let above = Fixed::candidate("above", 0.9);
        let never = Fixed::candidate("never", 1.0);

        let waterfall = Waterfall {
            field: EnrichField::Website,
            threshold: 0.8,
            budget: Duration::from_secs(10),
            strategies: vec![below.clone(), above.clone(), never.clone()],
        };

        let result = waterfall.resolve(&record(), &context()).await;
        assert!(matches!(result, FieldResult::Found { confidence, .. } if confidence == 0.9));
        assert_eq!(below.calls.load(Ordering::SeqCst), 1);
        assert_eq!(above.calls.load(Ordering::SeqCst), 1);
        assert_eq!(never.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn sub_threshold_best_becomes_low_confidence() {
        let waterfall = Waterfall {
            field: EnrichField::Website,
            threshold: 0.8,
            budget: Duration::from_secs(10),
            strategies: vec![
                Fixed::candidate("a", 0.4),
                Fixed::candidate("b", 0.6),
                Fixed::miss("c"),
            ],
        };

        let result = waterfall.resolve(&record(), &context()).await;
        assert!(
            matches!(result, FieldResult::LowConfidence { confidence, .. } if confidence == 0.6)
        );
    }

    #[tokio::test]
    async fn definitive_negative_stops_early() {
        let tail = Fixed::candidate("tail", 0.99);
        let waterfall = Waterfall {
            field: EnrichField::Website,
            threshold: 0.8,
            budget: Duration::from_secs(10),
            strategies: vec![Fixed::negative("neg"), tail.clone()],
        };

        let result = waterfall.resolve(&record(), &context()).await;
        assert!(matches!(
            result,
            FieldResult::Absent {
                reason: ReasonCode::DefinitiveNegative
            }
        ));
        assert_eq!(tail.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn all_misses_is_no_candidate() {
        let waterfall = Waterfall {
            field: EnrichField::Website,
            threshold: 0.8,
            budget: Duration::from_secs(10),
            strategies: vec![Fixed::miss("a"), Fixed::miss("b")],
        };

        let result = waterfall.resolve(&record(), &context()).await;
        assert!(matches!(
            result,
            FieldResult::Absent {
                reason: ReasonCode::NoCandidate
            }
        ));
    }

    /// Strategy that sleeps, to exercise the soft budget.
    struct Slow;

    #[async_trait]
    impl Strategy for Slow {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn run(&self, _: &CompanyRecord, _: &ResolveContext) -> Result<StrategyOutcome> {
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok(StrategyOutcome::Miss)
        }
    }

    #[tokio::test]
    async fn budget_expiry_stops_launching_new_strategies() {
        let tail = Fixed::candidate("tail", 0.99);
        let waterfall = Waterfall {
            field: EnrichField::Website,
            threshold: 0.8,
            budget: Duration::from_millis(20),
            strategies: vec![Arc::new(Slow), tail.clone()],
        };

        let result = waterfall.resolve(&record(), &context()).await;
        // The slow in-flight strategy finished (soft deadline), but the tail
        // was never launched.
        assert!(matches!(
            result,
            FieldResult::Absent {
                reason: ReasonCode::BudgetExhausted
            }
        ));
        assert_eq!(tail.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn host_of_uses_canonical_form() {
        assert_eq!(host_of("https://www.rossi.it/chi-siamo"), "rossi.it");
        assert_eq!(host_of("rossi.it"), "rossi.it");
    }

    #[tokio::test]
    async fn captcha_block_backs_off_only_the_blocked_target() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        fetcher.serve(
            "https://blocked.example",
            403,
            "<html>please solve this reCAPTCHA</html>",
        );

        let cx = ResolveContext {
            fetcher: fetcher.clone(),
            ..context()
        };

        let err = cx
            .governed_fetch("https://blocked.example", "test")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DittaError::Blocked {
                kind: BlockKind::Captcha,
                ..
            }
        ));

        // The failure widened only the blocked target's delay.
        let min = cx.governor.current_delay("healthy.example");
        assert!(cx.governor.current_delay("blocked.example") > min);
    }
}
