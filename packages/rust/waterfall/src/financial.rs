//! Financial-data waterfall: VAT number, revenue, headcount, PEC address.
//!
//! Branches on whether a VAT id is already known: a known id jumps straight
//! to targeted registry lookups by id; otherwise the registries are searched
//! by name + locality. Registry responses arrive as a profile bundle and are
//! mapped into per-field candidates under the shared acceptance threshold.
//! The oracle contributes a headcount estimate only, always marked estimated
//! and never presented as authoritative.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use ditta_shared::{
    Candidate, CompanyRecord, EnrichField, FieldResult, ReasonCode, Source,
};

use crate::providers::{RegistryProvider, RegistryProfile};
use crate::strategy::ResolveContext;

/// The fields this waterfall resolves.
pub const FINANCIAL_FIELDS: [EnrichField; 4] = [
    EnrichField::VatNumber,
    EnrichField::Revenue,
    EnrichField::Employees,
    EnrichField::PecEmail,
];

/// Headcount estimates are capped below any sane acceptance threshold so
/// they can only ever surface as `LowConfidence`.
const ESTIMATE_CONFIDENCE_CAP: f64 = 0.5;

// ---------------------------------------------------------------------------
// Waterfall configuration
// ---------------------------------------------------------------------------

/// The financial waterfall as data: ordered registry tiers plus thresholds.
pub struct FinancialWaterfall {
    pub threshold: f64,
    pub budget: Duration,
}

/// Per-field confidence a registry tier's bundle carries.
fn tier_confidence(primary: bool, field: EnrichField) -> f64 {
    match (primary, field) {
        (true, EnrichField::VatNumber | EnrichField::PecEmail) => 0.95,
        (true, _) => 0.9,
        (false, EnrichField::VatNumber | EnrichField::PecEmail) => 0.85,
        (false, _) => 0.75,
    }
}

impl FinancialWaterfall {
    /// Resolve the financial fields for `record`. `vat_hint` is the VAT id
    /// discovered so far (pre-known or surfaced by the website waterfall);
    /// it selects the direct-lookup branch.
    #[instrument(skip_all, fields(record = %record.record_id(), direct = vat_hint.is_some()))]
    pub async fn resolve(
        &self,
        record: &CompanyRecord,
        vat_hint: Option<&str>,
        cx: &ResolveContext,
    ) -> BTreeMap<EnrichField, FieldResult> {
        let deadline = Instant::now() + self.budget;
        let mut best: BTreeMap<EnrichField, Candidate> = BTreeMap::new();
        let mut out: BTreeMap<EnrichField, FieldResult> = BTreeMap::new();

        // Registry tiers, most authoritative first.
        let tiers: [(Arc<dyn RegistryProvider>, bool, Source); 2] = [
            (cx.registry.clone(), true, Source::OfficialRegistry),
            (cx.vat_service.clone(), false, Source::VatRegistry),
        ];

        for (provider, primary, source) in tiers {
            if FINANCIAL_FIELDS.iter().all(|f| out.contains_key(f)) {
                break;
            }
            if Instant::now() >= deadline {
                debug!(target = provider.target(), "financial budget exhausted");
                for field in FINANCIAL_FIELDS {
                    out.entry(field).or_insert(FieldResult::Absent {
                        reason: ReasonCode::BudgetExhausted,
                    });
                }
                break;
            }

            let target = provider.target().to_string();
            let lookup = match vat_hint {
                Some(vat) => cx.governed_call(&target, provider.lookup_by_vat(vat)).await,
                None => {
                    cx.governed_call(
                        &target,
                        provider.search_by_name(&record.name, &record.city),
                    )
                    .await
                }
            };

            match lookup {
                Ok(Some(profile)) => {
                    info!(target = %target, "registry profile found");
                    self.apply_profile(&profile, primary, source, &mut out, &mut best);
                }
                Ok(None) => {
                    debug!(target = %target, "registry miss");
                }
                Err(e) => {
                    warn!(target = %target, error = %e, "registry tier failed, continuing");
                }
            }
        }

        // Last resort for headcount only: an explicitly-estimated oracle guess.
        if !out.contains_key(&EnrichField::Employees)
            && !best.contains_key(&EnrichField::Employees)
            && Instant::now() < deadline
        {
            if let Some(candidate) = self.estimate_employees(record, cx).await {
                best.insert(EnrichField::Employees, candidate);
            }
        }

        // Sub-threshold candidates surface as LowConfidence; everything else
        // is an explicit absence.
        for field in FINANCIAL_FIELDS {
            if out.contains_key(&field) {
                continue;
            }
            let result = match best.remove(&field) {
                Some(c) => FieldResult::LowConfidence {
                    value: c.value,
                    source: c.source,
                    confidence: c.confidence,
                },
                None => FieldResult::Absent {
                    reason: ReasonCode::NoCandidate,
                },
            };
            out.insert(field, result);
        }

        out
    }

    /// Map a registry profile bundle into per-field outcomes.
    fn apply_profile(
        &self,
        profile: &RegistryProfile,
        primary: bool,
        source: Source,
        out: &mut BTreeMap<EnrichField, FieldResult>,
        best: &mut BTreeMap<EnrichField, Candidate>,
    ) {
        let values: [(EnrichField, Option<String>); 4] = [
            (EnrichField::VatNumber, profile.vat_number.clone()),
            (
                EnrichField::Revenue,
                profile.revenue_eur.map(|r| r.to_string()),
            ),
            (
                EnrichField::Employees,
                profile.employees.map(|e| e.to_string()),
            ),
            (EnrichField::PecEmail, profile.pec_email.clone()),
        ];

        for (field, value) in values {
            let Some(value) = value else { continue };
            if out.contains_key(&field) {
                continue;
            }

            let confidence = tier_confidence(primary, field);
            let candidate = Candidate::new(value, confidence, source);
            if confidence >= self.threshold {
                out.insert(
                    field,
                    FieldResult::Found {
                        value: candidate.value,
                        source: candidate.source,
                        confidence: candidate.confidence,
                    },
                );
            } else if best
                .get(&field)
                .is_none_or(|b| candidate.confidence > b.confidence)
            {
                best.insert(field, candidate);
            }
        }
    }

    /// Ask the oracle for a headcount estimate. Shape-validated; malformed
    /// output is simply no estimate.
    async fn estimate_employees(
        &self,
        record: &CompanyRecord,
        cx: &ResolveContext,
    ) -> Option<Candidate> {
        #[derive(Debug, Deserialize)]
        struct EmployeeEstimate {
            employees: Option<u32>,
            #[serde(default)]
            confidence: Option<f64>,
        }

        let prompt = format!(
            "Stima il numero di dipendenti di questa azienda italiana.\n\
             Nome: {}\nCittà: {}\nSettore ignoto.\n\
             Rispondi solo JSON: {{\"employees\": number, \"confidence\": number}}",
            record.name, record.city
        );

        let target = cx.oracle.target().to_string();
        let value = match cx
            .governed_call(&target, cx.oracle.complete_structured(&prompt))
            .await
        {
            Ok(Some(value)) => value,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "employee estimate failed");
                return None;
            }
        };

        let estimate: EmployeeEstimate = match serde_json::from_value(value) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(error = %e, "estimate failed shape validation");
                return None;
            }
        };

        let employees = estimate.employees?;
        let confidence = estimate
            .confidence
            .unwrap_or(0.3)
            .clamp(0.0, ESTIMATE_CONFIDENCE_CAP);
        Some(
            Candidate::new(employees.to_string(), confidence, Source::AiInference)
                .with_signal("estimated"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use ditta_governor::{FailureClassifier, RateGovernor};

    use crate::cache::VerificationCache;
    use crate::testing::{
        NullOracle, ScriptedFetcher, ScriptedOracle, ScriptedRegistry, ScriptedSearch,
        fast_governor_config,
    };

    fn record(vat: Option<&str>) -> CompanyRecord {
        CompanyRecord {
            name: "Rossi Snc".into(),
            address: "Via Roma 1".into(),
            city: "Milano".into(),
            province: None,
            phone: Some("0212345".into()),
            vat_number: vat.map(Into::into),
            website: None,
        }
    }

    fn context(
        registry: Arc<ScriptedRegistry>,
        vat_service: Arc<ScriptedRegistry>,
        oracle: Arc<dyn crate::providers::Oracle>,
    ) -> ResolveContext {
        ResolveContext {
            governor: Arc::new(RateGovernor::new(fast_governor_config())),
            classifier: Arc::new(FailureClassifier::default()),
            cache: Arc::new(VerificationCache::new(64, Duration::from_secs(60))),
            fetcher: Arc::new(ScriptedFetcher::default()),
            search: Arc::new(ScriptedSearch::empty()),
            registry,
            vat_service,
            oracle,
        }
    }

    fn waterfall() -> FinancialWaterfall {
        FinancialWaterfall {
            threshold: 0.7,
            budget: Duration::from_secs(10),
        }
    }

    fn full_profile() -> RegistryProfile {
        RegistryProfile {
            legal_name: Some("Rossi Snc".into()),
            vat_number: Some("01234567890".into()),
            website: None,
            pec_email: Some("rossi@pec.it".into()),
            revenue_eur: Some(1_250_000),
            employees: Some(12),
        }
    }

    #[tokio::test]
    async fn known_vat_takes_direct_lookup_branch() {
        let registry = Arc::new(ScriptedRegistry::with_vat_profile(full_profile()));
        let secondary = Arc::new(ScriptedRegistry::empty());
        let cx = context(registry.clone(), secondary, Arc::new(NullOracle));

        let out = waterfall()
            .resolve(&record(Some("01234567890")), Some("01234567890"), &cx)
            .await;

        assert_eq!(registry.vat_lookups(), 1);
        assert_eq!(registry.name_searches(), 0);
        assert!(out[&EnrichField::VatNumber].is_found());
        assert!(out[&EnrichField::Revenue].is_found());
        assert!(out[&EnrichField::Employees].is_found());
        assert!(out[&EnrichField::PecEmail].is_found());
    }

    #[tokio::test]
    async fn missing_vat_takes_name_search_branch() {
        let registry = Arc::new(ScriptedRegistry::with_name_profile(full_profile()));
        let secondary = Arc::new(ScriptedRegistry::empty());
        let cx = context(registry.clone(), secondary, Arc::new(NullOracle));

        let out = waterfall().resolve(&record(None), None, &cx).await;

        assert_eq!(registry.vat_lookups(), 0);
        assert_eq!(registry.name_searches(), 1);
        assert!(out[&EnrichField::VatNumber].is_found());
        assert_eq!(
            out[&EnrichField::VatNumber].source(),
            Some(Source::OfficialRegistry)
        );
    }

    #[tokio::test]
    async fn secondary_registry_fills_primary_misses() {
        let registry = Arc::new(ScriptedRegistry::empty());
        let secondary = Arc::new(ScriptedRegistry::with_name_profile(full_profile()));
        let cx = context(registry, secondary.clone(), Arc::new(NullOracle));

        let out = waterfall().resolve(&record(None), None, &cx).await;

        assert_eq!(secondary.name_searches(), 1);
        assert!(out[&EnrichField::VatNumber].is_found());
        assert_eq!(
            out[&EnrichField::VatNumber].source(),
            Some(Source::VatRegistry)
        );
    }

    #[tokio::test]
    async fn oracle_estimate_is_never_authoritative() {
        let registry = Arc::new(ScriptedRegistry::empty());
        let secondary = Arc::new(ScriptedRegistry::empty());
        let oracle = Arc::new(ScriptedOracle::with_value(serde_json::json!({
            "employees": 15,
            "confidence": 0.95
        })));
        let cx = context(registry, secondary, oracle);

        let out = waterfall().resolve(&record(None), None, &cx).await;

        match &out[&EnrichField::Employees] {
            FieldResult::LowConfidence {
                value,
                source,
                confidence,
            } => {
                assert_eq!(value, "15");
                assert_eq!(*source, Source::AiInference);
                // Even a cocky oracle is capped below acceptance.
                assert!(*confidence <= ESTIMATE_CONFIDENCE_CAP);
            }
            other => panic!("expected low-confidence estimate, got {other:?}"),
        }

        // Other fields are explicit absences, never silently missing.
        assert!(matches!(
            out[&EnrichField::Revenue],
            FieldResult::Absent {
                reason: ReasonCode::NoCandidate
            }
        ));
    }

    #[tokio::test]
    async fn malformed_oracle_output_is_an_absence() {
        let registry = Arc::new(ScriptedRegistry::empty());
        let secondary = Arc::new(ScriptedRegistry::empty());
        let oracle = Arc::new(ScriptedOracle::with_value(serde_json::json!({
            "employees": "circa quindici"
        })));
        let cx = context(registry, secondary, oracle);

        let out = waterfall().resolve(&record(None), None, &cx).await;
        assert!(matches!(
            out[&EnrichField::Employees],
            FieldResult::Absent { .. }
        ));
    }

    #[tokio::test]
    async fn every_field_is_accounted_for() {
        let cx = context(
            Arc::new(ScriptedRegistry::empty()),
            Arc::new(ScriptedRegistry::empty()),
            Arc::new(NullOracle),
        );
        let out = waterfall().resolve(&record(None), None, &cx).await;
        for field in FINANCIAL_FIELDS {
            assert!(out.contains_key(&field), "missing {field}");
        }
    }

    #[tokio::test]
    async fn zero_budget_reports_budget_exhausted() {
        let registry = Arc::new(ScriptedRegistry::with_name_profile(full_profile()));
        let cx = context(registry.clone(), Arc::new(ScriptedRegistry::empty()), Arc::new(NullOracle));

        let tight = FinancialWaterfall {
            threshold: 0.7,
            budget: Duration::ZERO,
        };
        let out = tight.resolve(&record(None), None, &cx).await;

        assert_eq!(registry.name_searches(), 0);
        assert!(matches!(
            out[&EnrichField::VatNumber],
            FieldResult::Absent {
                reason: ReasonCode::BudgetExhausted
            }
        ));
    }
}
