//! Shared types, error model, and configuration for ditta.
//!
//! This crate is the foundation depended on by all other ditta crates.
//! It provides:
//! - [`DittaError`] — the unified error type
//! - Domain types ([`CompanyRecord`], [`Candidate`], [`EnrichmentResult`], [`ResolutionJob`])
//! - Configuration ([`AppConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DefaultsConfig, OpenRouterConfig, RateConfig, RegistryConfig, SearchConfig,
    WaterfallSettings, config_dir, config_file_path, init_config, load_config, load_config_from,
    validate_oracle_key,
};
pub use error::{DittaError, Result};
pub use types::{
    AttemptRecord, BlockKind, Candidate, CompanyRecord, CorrelationId, EnrichField,
    EnrichmentResult, FieldResult, JobState, ReasonCode, RecordId, ResolutionJob, Source,
};
