//! Record-level resolution: composes the per-field waterfalls, consults the
//! entity registry to avoid re-resolving known duplicates, and persists the
//! merged outcome.
//!
//! Field dependencies are enforced here: the financial waterfall's branch is
//! selected by the VAT id known at the time it runs (pre-supplied on the
//! record or discovered by the website path's registry strategy).

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, instrument, warn};

use ditta_resolver::EntityRegistry;
use ditta_shared::{
    CompanyRecord, DittaError, EnrichField, EnrichmentResult, FieldResult, ReasonCode,
    ResolutionJob, Result,
};
use ditta_storage::Storage;
use ditta_waterfall::{FinancialWaterfall, ResolveContext, Waterfall};

/// Per-batch resolution orchestrator, shared by all workers.
pub struct Orchestrator {
    cx: ResolveContext,
    website: Waterfall,
    financial: FinancialWaterfall,
    entities: Arc<EntityRegistry>,
    storage: Arc<Storage>,
}

impl Orchestrator {
    pub fn new(
        cx: ResolveContext,
        website: Waterfall,
        financial: FinancialWaterfall,
        entities: Arc<EntityRegistry>,
        storage: Arc<Storage>,
    ) -> Self {
        Self {
            cx,
            website,
            financial,
            entities,
            storage,
        }
    }

    /// Resolve one job end-to-end. Never returns a partial result: the
    /// outcome accounts for every target field or the call errors.
    #[instrument(skip_all, fields(job_id = %job.id, attempt = job.attempt))]
    pub async fn resolve_job(&self, job: &ResolutionJob) -> Result<EnrichmentResult> {
        let started = Instant::now();
        let record = &job.record;

        if !record.is_structurally_valid() {
            return Err(DittaError::validation(
                "record must carry at least a name and a city",
            ));
        }

        // Duplicate short-circuit: an already-resolved entity is reused, not
        // re-resolved — its result is merged in under the trust hierarchy.
        if let Some(duplicate) = self.entities.find_duplicate(record) {
            if let Some((_, canonical)) = self.storage.get_company(&duplicate.canonical).await? {
                info!(
                    canonical = %duplicate.canonical,
                    matched_on = ?duplicate.matched_on,
                    "duplicate of known entity, reusing resolution"
                );
                let mut result =
                    EnrichmentResult::new(job.id.clone(), job.correlation_id.clone());
                for field in EnrichField::ALL {
                    result.set(
                        field,
                        FieldResult::Absent {
                            reason: ReasonCode::DuplicateOf,
                        },
                    );
                }
                let result = ditta_resolver::merge(&result, &canonical);
                self.storage.upsert_company(record, &result).await?;
                return Ok(result);
            }
            debug!(
                canonical = %duplicate.canonical,
                "duplicate index hit but canonical result not stored yet, resolving fresh"
            );
        }

        let mut result = EnrichmentResult::new(job.id.clone(), job.correlation_id.clone());

        // Field 1: website.
        let website = self.website.resolve(record, &self.cx).await;
        result.set(EnrichField::Website, website);

        // Fields 2-5: financial bundle, branch gated on VAT availability.
        let vat_hint = record.vat_number.clone();
        let financial = self
            .financial
            .resolve(record, vat_hint.as_deref(), &self.cx)
            .await;
        for (field, outcome) in financial {
            result.set(field, outcome);
        }

        if !result.accounts_for_all_fields() {
            return Err(DittaError::logic(
                "resolution produced a result that does not account for every field",
            ));
        }

        // Register the entity once its identity is confirmed by a resolved
        // VAT id or website, so later duplicates in the batch short-circuit.
        let vat_value = result
            .get(EnrichField::VatNumber)
            .filter(|f| f.is_found())
            .and_then(|f| f.value())
            .map(str::to_string);
        let identity_confirmed = vat_value.is_some()
            || result
                .get(EnrichField::Website)
                .is_some_and(|f| f.is_found());
        if identity_confirmed {
            let mut registered = record.clone();
            if registered.vat_number.is_none() {
                registered.vat_number = vat_value;
            }
            self.entities.register(&registered, &job.id);
        }

        self.storage.upsert_company(record, &result).await?;

        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            resolved = result
                .fields
                .values()
                .filter(|f| f.is_found())
                .count(),
            "record resolved"
        );
        Ok(result)
    }

    /// Persist a dead letter and its audit-log row. Failures here are logged,
    /// never raised — a storage hiccup must not mask the original error.
    pub async fn record_dead_letter(
        &self,
        job: &ResolutionJob,
        reason: ReasonCode,
        duration_ms: u64,
    ) {
        if let Err(e) = self.storage.insert_dead_letter(job, reason).await {
            warn!(job_id = %job.id, error = %e, "failed to persist dead letter");
        }
        if let Err(e) = self
            .storage
            .append_job_log(
                &job.id,
                &job.correlation_id.to_string(),
                "dead_lettered",
                duration_ms,
                Some(reason.as_str()),
            )
            .await
        {
            warn!(job_id = %job.id, error = %e, "failed to log dead letter");
        }
    }

    /// Append one attempt-outcome row to the audit trail.
    pub async fn log_attempt(
        &self,
        job: &ResolutionJob,
        status: &str,
        duration_ms: u64,
        reason: Option<&str>,
    ) {
        if let Err(e) = self
            .storage
            .append_job_log(
                &job.id,
                &job.correlation_id.to_string(),
                status,
                duration_ms,
                reason,
            )
            .await
        {
            warn!(job_id = %job.id, error = %e, "failed to append job log");
        }
    }
}
