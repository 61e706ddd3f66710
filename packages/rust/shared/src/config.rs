//! Application configuration for ditta.
//!
//! User config lives at `~/.ditta/ditta.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DittaError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "ditta.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".ditta";

// ---------------------------------------------------------------------------
// Config structs (matching ditta.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Scheduler/worker defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Per-target rate governing.
    #[serde(default)]
    pub rate: RateConfig,

    /// Waterfall thresholds, budgets, and cache bounds.
    #[serde(default)]
    pub waterfall: WaterfallSettings,

    /// Search backend settings.
    #[serde(default)]
    pub search: SearchConfig,

    /// Public registry endpoints.
    #[serde(default)]
    pub registry: RegistryConfig,

    /// OpenRouter oracle settings.
    #[serde(default)]
    pub openrouter: OpenRouterConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Number of parallel workers.
    #[serde(default = "default_workers")]
    pub workers: u32,

    /// Maximum attempts per job before dead-lettering.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base retry delay in ms (doubled per attempt).
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Path to the embedded database.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            db_path: default_db_path(),
        }
    }
}

fn default_workers() -> u32 {
    4
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    2_000
}
fn default_db_path() -> String {
    "~/.ditta/ditta.db".into()
}

/// `[rate]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateConfig {
    /// Starting/minimum delay per target in ms.
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,

    /// Delay cap per target in ms.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Delay multiplier on failure (>= 1.5).
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Delay multiplier on success (< 1).
    #[serde(default = "default_recovery_factor")]
    pub recovery_factor: f64,

    /// Max random jitter added to inter-call spacing, in ms.
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,

    /// Consecutive failures before a target enters cooldown.
    #[serde(default = "default_cooldown_threshold")]
    pub cooldown_threshold: u32,

    /// Absolute cap on a cooldown window, in seconds.
    #[serde(default = "default_cooldown_cap_secs")]
    pub cooldown_cap_secs: u64,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
            recovery_factor: default_recovery_factor(),
            jitter_ms: default_jitter_ms(),
            cooldown_threshold: default_cooldown_threshold(),
            cooldown_cap_secs: default_cooldown_cap_secs(),
        }
    }
}

fn default_min_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_backoff_factor() -> f64 {
    2.0
}
fn default_recovery_factor() -> f64 {
    0.5
}
fn default_jitter_ms() -> u64 {
    250
}
fn default_cooldown_threshold() -> u32 {
    3
}
fn default_cooldown_cap_secs() -> u64 {
    120
}

/// `[waterfall]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaterfallSettings {
    /// Acceptance threshold for website candidates.
    #[serde(default = "default_website_threshold")]
    pub website_threshold: f64,

    /// Acceptance threshold for financial-profile candidates.
    #[serde(default = "default_financial_threshold")]
    pub financial_threshold: f64,

    /// Soft per-field time budget in ms.
    #[serde(default = "default_field_budget_ms")]
    pub field_budget_ms: u64,

    /// Verification cache capacity (entries).
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// Verification cache TTL in seconds.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Block signatures within the rolling window before a target is "hot".
    #[serde(default = "default_hot_threshold")]
    pub hot_threshold: usize,
}

impl Default for WaterfallSettings {
    fn default() -> Self {
        Self {
            website_threshold: default_website_threshold(),
            financial_threshold: default_financial_threshold(),
            field_budget_ms: default_field_budget_ms(),
            cache_capacity: default_cache_capacity(),
            cache_ttl_secs: default_cache_ttl_secs(),
            hot_threshold: default_hot_threshold(),
        }
    }
}

fn default_website_threshold() -> f64 {
    0.8
}
fn default_financial_threshold() -> f64 {
    0.7
}
fn default_field_budget_ms() -> u64 {
    45_000
}
fn default_cache_capacity() -> usize {
    2_048
}
fn default_cache_ttl_secs() -> u64 {
    3_600
}
fn default_hot_threshold() -> usize {
    5
}

/// `[search]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Search API endpoint.
    #[serde(default = "default_search_endpoint")]
    pub endpoint: String,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_search_key_env")]
    pub api_key_env: String,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            endpoint: default_search_endpoint(),
            api_key_env: default_search_key_env(),
        }
    }
}

fn default_search_endpoint() -> String {
    "https://api.search.brave.com/res/v1/web/search".into()
}
fn default_search_key_env() -> String {
    "DITTA_SEARCH_API_KEY".into()
}

/// `[registry]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Primary (official) registry lookup endpoint.
    #[serde(default = "default_primary_registry")]
    pub primary_endpoint: String,

    /// Secondary identifier-service endpoint.
    #[serde(default = "default_secondary_registry")]
    pub secondary_endpoint: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            primary_endpoint: default_primary_registry(),
            secondary_endpoint: default_secondary_registry(),
        }
    }
}

fn default_primary_registry() -> String {
    "https://registry.ditta.local/v1/companies".into()
}
fn default_secondary_registry() -> String {
    "https://vat.ditta.local/v1/lookup".into()
}

/// `[openrouter]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRouterConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Default model for last-resort oracle strategies.
    #[serde(default = "default_model")]
    pub default_model: String,
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            default_model: default_model(),
        }
    }
}

fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_model() -> String {
    "moonshotai/kimi-k2.5".into()
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.ditta/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| DittaError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.ditta/ditta.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| DittaError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| DittaError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| DittaError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| DittaError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| DittaError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Check that the oracle API key env var is set and non-empty.
pub fn validate_oracle_key(config: &AppConfig) -> Result<()> {
    let var_name = &config.openrouter.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(()),
        _ => Err(DittaError::config(format!(
            "oracle API key not found. Set the {var_name} environment variable."
        ))),
    }
}
