//! Job execution engine: idempotent queue, worker pool, and the record-level
//! resolution orchestrator.
//!
//! Each worker is an independent sequential pipeline — one job at a time,
//! end-to-end — while multiple workers run in parallel over the shared
//! rate-governed resource pool. Concurrency is bounded by the worker count.

pub mod orchestrator;
pub mod queue;

pub use orchestrator::Orchestrator;
pub use queue::{DeadLetter, JobQueue, QueueConfig, QueueStats};

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use ditta_shared::{DittaError, JobState, ReasonCode, Result};

/// Outcome of a drained batch run.
#[derive(Debug, Clone, Copy)]
pub struct RunSummary {
    pub succeeded: usize,
    pub dead_lettered: usize,
    pub elapsed: Duration,
}

/// Start `workers` parallel workers and run until the queue is drained.
pub async fn run_workers(
    queue: Arc<JobQueue>,
    orchestrator: Arc<Orchestrator>,
    workers: u32,
) -> Result<RunSummary> {
    let started = Instant::now();
    let worker_count = workers.max(1);
    info!(workers = worker_count, correlation_id = %queue.correlation_id(), "starting worker pool");

    let mut handles = Vec::with_capacity(worker_count as usize);
    for worker in 0..worker_count {
        let queue = Arc::clone(&queue);
        let orchestrator = Arc::clone(&orchestrator);
        handles.push(tokio::spawn(worker_loop(worker, queue, orchestrator)));
    }

    for handle in handles {
        handle
            .await
            .map_err(|e| DittaError::logic(format!("worker panicked: {e}")))?;
    }

    let stats = queue.stats();
    let summary = RunSummary {
        succeeded: stats.succeeded,
        dead_lettered: stats.dead_lettered,
        elapsed: started.elapsed(),
    };
    info!(
        succeeded = summary.succeeded,
        dead_lettered = summary.dead_lettered,
        elapsed_ms = summary.elapsed.as_millis() as u64,
        "batch drained"
    );
    Ok(summary)
}

/// One worker: pull a job, resolve it end-to-end, acknowledge or fail it.
/// No interleaving of orchestration steps from different jobs.
async fn worker_loop(worker: u32, queue: Arc<JobQueue>, orchestrator: Arc<Orchestrator>) {
    while let Some(job) = queue.dispatch().await {
        let started = Instant::now();

        match orchestrator.resolve_job(&job).await {
            Ok(result) => {
                let elapsed = started.elapsed().as_millis() as u64;
                match queue.complete(&job.id, &result) {
                    Ok(()) => {
                        orchestrator
                            .log_attempt(&job, JobState::Succeeded.as_str(), elapsed, None)
                            .await;
                    }
                    Err(e) => {
                        error!(worker, job_id = %job.id, error = %e, "failed to acknowledge job");
                    }
                }
            }
            Err(job_error) => {
                let elapsed = started.elapsed().as_millis() as u64;
                warn!(worker, job_id = %job.id, attempt = job.attempt, error = %job_error, "job attempt failed");

                match queue.fail(&job.id, &job_error) {
                    Ok(JobState::DeadLettered) => {
                        let reason = if matches!(job_error, DittaError::Validation { .. }) {
                            ReasonCode::InvalidRecord
                        } else {
                            ReasonCode::MaxAttemptsExceeded
                        };
                        // The queue's snapshot carries the full attempt history.
                        let snapshot = queue.get(&job.id).unwrap_or_else(|| job.clone());
                        orchestrator
                            .record_dead_letter(&snapshot, reason, elapsed)
                            .await;
                    }
                    Ok(_) => {
                        orchestrator
                            .log_attempt(
                                &job,
                                JobState::Retrying.as_str(),
                                elapsed,
                                Some(error_code(&job_error)),
                            )
                            .await;
                    }
                    Err(e) => {
                        error!(worker, job_id = %job.id, error = %e, "failed to record job failure");
                    }
                }
            }
        }
    }

    debug!(worker, "worker drained");
}

/// Short reason code for audit-log rows.
fn error_code(error: &DittaError) -> &'static str {
    match error {
        DittaError::Network(_) => "network",
        DittaError::Blocked { .. } => "blocked",
        DittaError::Validation { .. } => "invalid_record",
        DittaError::Budget { .. } => "budget",
        DittaError::Storage(_) => "storage",
        DittaError::Oracle(_) => "oracle",
        DittaError::Config { .. } => "config",
        DittaError::Logic(_) => "logic",
        DittaError::Io { .. } => "io",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use std::path::PathBuf;

    use ditta_governor::{FailureClassifier, GovernorConfig, RateGovernor};
    use ditta_resolver::EntityRegistry;
    use ditta_shared::{
        CompanyRecord, CorrelationId, EnrichField, Source, WaterfallSettings,
    };
    use ditta_storage::Storage;
    use ditta_waterfall::{
        FetchedPage, Oracle, PageFetcher, RegistryProfile, RegistryProvider, ResolveContext,
        SearchHit, SearchProvider, financial_waterfall, website_waterfall,
    };

    // -- collaborator doubles ------------------------------------------------

    struct NoPages;

    #[async_trait]
    impl PageFetcher for NoPages {
        async fn fetch(&self, _url: &str) -> ditta_shared::Result<FetchedPage> {
            Ok(FetchedPage {
                status: 404,
                body: String::new(),
            })
        }
    }

    struct NoSearch;

    #[async_trait]
    impl SearchProvider for NoSearch {
        fn target(&self) -> &str {
            "search-test"
        }

        async fn search(&self, _query: &str) -> ditta_shared::Result<Vec<SearchHit>> {
            Ok(Vec::new())
        }
    }

    struct NoOracle;

    #[async_trait]
    impl Oracle for NoOracle {
        fn target(&self) -> &str {
            "oracle-test"
        }

        async fn complete_structured(
            &self,
            _prompt: &str,
        ) -> ditta_shared::Result<Option<serde_json::Value>> {
            Ok(None)
        }

        fn tokens_spent(&self) -> u64 {
            0
        }
    }

    /// Registry that knows every company by name, with a full profile.
    struct KnowsEveryone;

    #[async_trait]
    impl RegistryProvider for KnowsEveryone {
        fn target(&self) -> &str {
            "registry-test"
        }

        async fn lookup_by_vat(
            &self,
            vat: &str,
        ) -> ditta_shared::Result<Option<RegistryProfile>> {
            Ok(Some(RegistryProfile {
                legal_name: Some("By VAT".into()),
                vat_number: Some(vat.to_string()),
                website: Some("https://www.rossi.it/".into()),
                pec_email: Some("rossi@pec.it".into()),
                revenue_eur: Some(900_000),
                employees: Some(8),
            }))
        }

        async fn search_by_name(
            &self,
            name: &str,
            _city: &str,
        ) -> ditta_shared::Result<Option<RegistryProfile>> {
            Ok(Some(RegistryProfile {
                legal_name: Some(name.to_string()),
                vat_number: Some("01234567890".into()),
                website: Some("https://www.rossi.it/".into()),
                pec_email: Some("rossi@pec.it".into()),
                revenue_eur: Some(900_000),
                employees: Some(8),
            }))
        }
    }

    struct EmptyRegistry;

    #[async_trait]
    impl RegistryProvider for EmptyRegistry {
        fn target(&self) -> &str {
            "registry-empty"
        }

        async fn lookup_by_vat(
            &self,
            _vat: &str,
        ) -> ditta_shared::Result<Option<RegistryProfile>> {
            Ok(None)
        }

        async fn search_by_name(
            &self,
            _name: &str,
            _city: &str,
        ) -> ditta_shared::Result<Option<RegistryProfile>> {
            Ok(None)
        }
    }

    // -- harness -------------------------------------------------------------

    fn fast_governor() -> GovernorConfig {
        GovernorConfig {
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_factor: 2.0,
            recovery_factor: 0.5,
            jitter: Duration::ZERO,
            cooldown_threshold: 3,
            cooldown_cap: Duration::from_millis(10),
        }
    }

    async fn harness(tag: &str) -> (Arc<JobQueue>, Arc<Orchestrator>, Arc<Storage>, PathBuf) {
        let dir = std::env::temp_dir().join(format!("ditta-engine-{tag}-{}", uuid::Uuid::now_v7()));
        let storage = Arc::new(Storage::open(&dir.join("test.db")).await.expect("storage"));

        let settings = WaterfallSettings::default();
        let cx = ResolveContext {
            governor: Arc::new(RateGovernor::new(fast_governor())),
            classifier: Arc::new(FailureClassifier::default()),
            cache: Arc::new(ditta_waterfall::VerificationCache::new(
                64,
                Duration::from_secs(60),
            )),
            fetcher: Arc::new(NoPages),
            search: Arc::new(NoSearch),
            registry: Arc::new(KnowsEveryone),
            vat_service: Arc::new(EmptyRegistry),
            oracle: Arc::new(NoOracle),
        };

        let orchestrator = Arc::new(Orchestrator::new(
            cx,
            website_waterfall(&settings),
            financial_waterfall(&settings),
            Arc::new(EntityRegistry::new()),
            storage.clone(),
        ));

        let queue = Arc::new(JobQueue::new(
            QueueConfig {
                max_attempts: 3,
                backoff_base: Duration::from_millis(5),
                backoff_cap: Duration::from_millis(40),
                jitter: Duration::ZERO,
            },
            CorrelationId::new(),
        ));

        (queue, orchestrator, storage, dir)
    }

    fn record(name: &str, city: &str, phone: Option<&str>) -> CompanyRecord {
        CompanyRecord {
            name: name.into(),
            address: "Via Roma 1".into(),
            city: city.into(),
            province: None,
            phone: phone.map(Into::into),
            vat_number: None,
            website: None,
        }
    }

    // -- tests ---------------------------------------------------------------

    #[tokio::test]
    async fn batch_resolves_and_persists() {
        let (queue, orchestrator, storage, dir) = harness("batch").await;

        let id_a = queue.enqueue(record("Rossi Snc", "Milano", Some("02 12345")));
        let id_b = queue.enqueue(record("Bianchi Srl", "Torino", None));

        let summary = run_workers(queue.clone(), orchestrator, 2).await.unwrap();
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.dead_lettered, 0);

        for id in [&id_a, &id_b] {
            let (_, result) = storage
                .get_company(id)
                .await
                .unwrap()
                .expect("result persisted");
            assert!(result.accounts_for_all_fields());
            // Registry knows everyone: website + financials resolved.
            assert_eq!(
                result.get(EnrichField::Website).and_then(|f| f.value()),
                Some("rossi.it")
            );
            assert_eq!(
                result.get(EnrichField::VatNumber).map(|f| f.is_found()),
                Some(true)
            );
            let log = storage.job_log(id).await.unwrap();
            assert_eq!(log.last().map(|(s, _, _)| s.as_str()), Some("succeeded"));
        }

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn duplicate_record_reuses_canonical_resolution() {
        let (queue, orchestrator, storage, dir) = harness("dup").await;

        // Same phone, different name/city → distinct job ids, same entity.
        queue.enqueue(record("Rossi Snc", "Milano", Some("02 1234567")));
        let summary = run_workers(queue.clone(), orchestrator.clone(), 1)
            .await
            .unwrap();
        assert_eq!(summary.succeeded, 1);

        let queue2 = Arc::new(JobQueue::new(
            QueueConfig {
                max_attempts: 3,
                backoff_base: Duration::from_millis(5),
                backoff_cap: Duration::from_millis(40),
                jitter: Duration::ZERO,
            },
            queue.correlation_id().clone(),
        ));
        let dup_id = queue2.enqueue(record("Fratelli Rossi", "Roma", Some("+39 02 1234567")));
        let summary = run_workers(queue2, orchestrator, 1).await.unwrap();
        assert_eq!(summary.succeeded, 1);

        let (_, dup_result) = storage
            .get_company(&dup_id)
            .await
            .unwrap()
            .expect("duplicate persisted");
        // The duplicate reused the canonical entity's resolution.
        assert_eq!(
            dup_result.get(EnrichField::Website).and_then(|f| f.value()),
            Some("rossi.it")
        );
        assert_eq!(
            dup_result.get(EnrichField::Website).and_then(|f| f.source()),
            Some(Source::OfficialRegistry)
        );

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn invalid_record_dead_letters_with_reason() {
        let (queue, orchestrator, storage, dir) = harness("invalid").await;

        let id = queue.enqueue(record("Senza Città", "", None));
        let summary = run_workers(queue.clone(), orchestrator, 1).await.unwrap();
        assert_eq!(summary.succeeded, 0);
        assert_eq!(summary.dead_lettered, 1);

        // In-memory DLQ carries the reason...
        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, ReasonCode::InvalidRecord);
        // ...and the persisted DLQ is inspectable after the run.
        let letters = storage.list_dead_letters().await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].job_id, id.to_string());
        assert_eq!(letters[0].reason_code, "invalid_record");
        assert!(!letters[0].history.is_empty());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
