//! External collaborator contracts and their default HTTP implementations.
//!
//! Everything the engine learns from the outside world crosses one of these
//! traits. Responses are validated against an explicit expected shape at the
//! boundary and converted to internal types immediately — unvalidated
//! external data never flows past this module.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use ditta_shared::{DittaError, Result};

/// User-Agent string for outbound requests.
const USER_AGENT: &str = concat!("ditta/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// PageFetcher — the browser-automation boundary
// ---------------------------------------------------------------------------

/// A fetched page. Non-2xx statuses are data for the failure classifier,
/// not errors.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: u16,
    pub body: String,
}

/// Boundary to the page-retrieval layer (plain HTTP here; a headless-browser
/// implementation honors the same contract: timeouts respected, transport
/// failures surfaced as classifiable errors).
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPage>;
}

/// Default `reqwest`-backed fetcher.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(Duration::from_secs(20))
            .build()
            .map_err(|e| DittaError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| map_reqwest_error(url, &e))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| DittaError::Network(format!("{url}: body read failed: {e}")))?;

        Ok(FetchedPage { status, body })
    }
}

fn map_reqwest_error(url: &str, e: &reqwest::Error) -> DittaError {
    if e.is_timeout() {
        DittaError::Network(format!("{url}: timed out"))
    } else if e.is_connect() {
        DittaError::Network(format!("{url}: connection refused"))
    } else {
        DittaError::Network(format!("{url}: {e}"))
    }
}

// ---------------------------------------------------------------------------
// SearchProvider
// ---------------------------------------------------------------------------

/// One search result.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub url: String,
    pub title: String,
    pub snippet: String,
}

/// Interchangeable search backend. `target()` is the rate-governor key, so
/// each backend is paced independently.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    fn target(&self) -> &str;
    async fn search(&self, query: &str) -> Result<Vec<SearchHit>>;
}

/// JSON search API backend (Brave-compatible response shape).
pub struct SearchApiProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl SearchApiProvider {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| DittaError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
        })
    }
}

/// Expected response shape — validated here, at the boundary.
#[derive(Debug, Deserialize)]
struct SearchApiResponse {
    #[serde(default)]
    web: Option<SearchApiWeb>,
}

#[derive(Debug, Deserialize)]
struct SearchApiWeb {
    #[serde(default)]
    results: Vec<SearchApiResult>,
}

#[derive(Debug, Deserialize)]
struct SearchApiResult {
    url: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

#[async_trait]
impl SearchProvider for SearchApiProvider {
    fn target(&self) -> &str {
        "search-api"
    }

    async fn search(&self, query: &str) -> Result<Vec<SearchHit>> {
        let mut request = self.client.get(&self.endpoint).query(&[("q", query)]);
        if let Some(key) = &self.api_key {
            request = request.header("X-Subscription-Token", key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| map_reqwest_error(&self.endpoint, &e))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(DittaError::Blocked {
                kind: ditta_shared::BlockKind::RateLimited,
                target: self.target().to_string(),
            });
        }
        if !status.is_success() {
            return Err(DittaError::Network(format!(
                "search API: HTTP {status}"
            )));
        }

        let parsed: SearchApiResponse = response
            .json()
            .await
            .map_err(|e| DittaError::Network(format!("search API: invalid response: {e}")))?;

        let hits = parsed
            .web
            .map(|w| w.results)
            .unwrap_or_default()
            .into_iter()
            .map(|r| SearchHit {
                url: r.url,
                title: r.title.unwrap_or_default(),
                snippet: r.description.unwrap_or_default(),
            })
            .collect();

        Ok(hits)
    }
}

// ---------------------------------------------------------------------------
// RegistryProvider
// ---------------------------------------------------------------------------

/// A company profile as returned by a public registry.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegistryProfile {
    #[serde(default)]
    pub legal_name: Option<String>,
    #[serde(default)]
    pub vat_number: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub pec_email: Option<String>,
    #[serde(default)]
    pub revenue_eur: Option<u64>,
    #[serde(default)]
    pub employees: Option<u32>,
}

impl RegistryProfile {
    /// A profile that carries no data at all is treated as a miss.
    pub fn is_empty(&self) -> bool {
        self.vat_number.is_none()
            && self.website.is_none()
            && self.pec_email.is_none()
            && self.revenue_eur.is_none()
            && self.employees.is_none()
    }
}

/// Public company registry, queryable by VAT id or by name+locality.
#[async_trait]
pub trait RegistryProvider: Send + Sync {
    fn target(&self) -> &str;
    async fn lookup_by_vat(&self, vat: &str) -> Result<Option<RegistryProfile>>;
    async fn search_by_name(&self, name: &str, city: &str) -> Result<Option<RegistryProfile>>;
}

/// JSON registry API backend.
pub struct HttpRegistryProvider {
    client: reqwest::Client,
    endpoint: String,
    target: String,
}

impl HttpRegistryProvider {
    pub fn new(endpoint: impl Into<String>, target: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| DittaError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            target: target.into(),
        })
    }

    async fn query(&self, params: &[(&str, &str)]) -> Result<Option<RegistryProfile>> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(params)
            .send()
            .await
            .map_err(|e| map_reqwest_error(&self.endpoint, &e))?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Ok(None);
        }
        if status.as_u16() == 429 {
            return Err(DittaError::Blocked {
                kind: ditta_shared::BlockKind::RateLimited,
                target: self.target.clone(),
            });
        }
        if !status.is_success() {
            return Err(DittaError::Network(format!(
                "{}: HTTP {status}",
                self.target
            )));
        }

        let profile: RegistryProfile = response.json().await.map_err(|e| {
            DittaError::Network(format!("{}: invalid response: {e}", self.target))
        })?;

        if profile.is_empty() {
            debug!(target = %self.target, "registry returned empty profile");
            return Ok(None);
        }
        Ok(Some(profile))
    }
}

#[async_trait]
impl RegistryProvider for HttpRegistryProvider {
    fn target(&self) -> &str {
        &self.target
    }

    async fn lookup_by_vat(&self, vat: &str) -> Result<Option<RegistryProfile>> {
        self.query(&[("vat", vat)]).await
    }

    async fn search_by_name(&self, name: &str, city: &str) -> Result<Option<RegistryProfile>> {
        self.query(&[("name", name), ("city", city)]).await
    }
}

// ---------------------------------------------------------------------------
// Oracle
// ---------------------------------------------------------------------------

/// Language-model oracle, used only inside designated last-resort strategies.
/// Every call is cost-tracked; malformed output is `None`, never a crash.
#[async_trait]
pub trait Oracle: Send + Sync {
    fn target(&self) -> &str;
    async fn complete_structured(&self, prompt: &str) -> Result<Option<serde_json::Value>>;
    /// Total tokens spent across all calls so far.
    fn tokens_spent(&self) -> u64;
}

/// OpenRouter-style chat-completions oracle.
pub struct OpenRouterOracle {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    tokens: AtomicU64,
}

impl OpenRouterOracle {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        Self::with_endpoint(
            "https://openrouter.ai/api/v1/chat/completions",
            api_key,
            model,
        )
    }

    pub fn with_endpoint(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| DittaError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            model: model.into(),
            tokens: AtomicU64::new(0),
        })
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<CompletionUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct CompletionUsage {
    #[serde(default)]
    total_tokens: u64,
}

#[async_trait]
impl Oracle for OpenRouterOracle {
    fn target(&self) -> &str {
        "oracle-openrouter"
    }

    async fn complete_structured(&self, prompt: &str) -> Result<Option<serde_json::Value>> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "response_format": {"type": "json_object"},
        });

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| DittaError::Oracle(format!("transport: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DittaError::Oracle(format!("HTTP {status}")));
        }

        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| DittaError::Oracle(format!("invalid completion envelope: {e}")))?;

        if let Some(usage) = &parsed.usage {
            self.tokens.fetch_add(usage.total_tokens, Ordering::Relaxed);
        }

        let Some(choice) = parsed.choices.first() else {
            warn!("oracle returned no choices");
            return Ok(None);
        };

        // Malformed model output is a miss, not an error.
        match serde_json::from_str::<serde_json::Value>(choice.message.content.trim()) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(error = %e, "oracle returned non-JSON content");
                Ok(None)
            }
        }
    }

    fn tokens_spent(&self) -> u64 {
        self.tokens.load(Ordering::Relaxed)
    }
}

/// Oracle stand-in for runs without an API key: every last-resort strategy
/// simply misses instead of erroring.
pub struct DisabledOracle;

#[async_trait]
impl Oracle for DisabledOracle {
    fn target(&self) -> &str {
        "oracle-disabled"
    }

    async fn complete_structured(&self, _prompt: &str) -> Result<Option<serde_json::Value>> {
        debug!("oracle disabled, skipping completion");
        Ok(None)
    }

    fn tokens_spent(&self) -> u64 {
        0
    }
}
