//! Confidence-gated strategy waterfalls for field resolution.
//!
//! This crate provides:
//! - [`cache`] — the single URL canonicalization function and the bounded
//!   verification cache keyed by it
//! - [`providers`] — contracts for the page fetcher, search backends,
//!   public registries, and the language-model oracle
//! - [`strategy`] — the [`Waterfall`] execution engine and [`Strategy`] trait
//! - [`website`] — the website waterfall's strategies
//! - [`financial`] — the VAT/revenue/headcount/PEC waterfall

pub mod cache;
pub mod financial;
pub mod providers;
pub mod strategy;
pub mod website;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;
use std::time::Duration;

use ditta_shared::{EnrichField, WaterfallSettings};

pub use cache::{CacheOutcome, VerificationCache, canonicalize, fetch_url};
pub use financial::{FINANCIAL_FIELDS, FinancialWaterfall};
pub use providers::{
    DisabledOracle, FetchedPage, HttpFetcher, HttpRegistryProvider, OpenRouterOracle, Oracle,
    PageFetcher, RegistryProfile, RegistryProvider, SearchApiProvider, SearchHit, SearchProvider,
};
pub use strategy::{ResolveContext, Strategy, StrategyOutcome, Waterfall, host_of};

/// Build the standard website waterfall: cached/known check → domain guess →
/// web search → registry identity → oracle last resort.
pub fn website_waterfall(settings: &WaterfallSettings) -> Waterfall {
    Waterfall {
        field: EnrichField::Website,
        threshold: settings.website_threshold,
        budget: Duration::from_millis(settings.field_budget_ms),
        strategies: vec![
            Arc::new(website::KnownWebsite),
            Arc::new(website::DomainGuess),
            Arc::new(website::WebSearch),
            Arc::new(website::RegistryIdentity),
            Arc::new(website::OracleWebsite),
        ],
    }
}

/// Build the standard financial waterfall.
pub fn financial_waterfall(settings: &WaterfallSettings) -> FinancialWaterfall {
    FinancialWaterfall {
        threshold: settings.financial_threshold,
        budget: Duration::from_millis(settings.field_budget_ms),
    }
}
