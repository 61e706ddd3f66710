//! Scripted collaborator doubles shared by the waterfall test suites.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use ditta_governor::GovernorConfig;
use ditta_shared::Result;

use crate::providers::{
    FetchedPage, Oracle, PageFetcher, RegistryProfile, RegistryProvider, SearchHit,
    SearchProvider,
};

/// Governor config with near-zero delays so tests don't sleep.
pub(crate) fn fast_governor_config() -> GovernorConfig {
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

/// A page that carries strong identity signals for the given company.
pub(crate) fn rich_page(name: &str, city: &str, phone: &str) -> String {
    format!(
        "<html><head><title>{name} {city}</title></head><body>\
         <h1>{name}</h1><p>Azienda storica di {city}.</p>\
         <p>Telefono: {phone}</p>\
         <p>{}</p></body></html>",
        "Prodotti e servizi di qualità. ".repeat(20)
    )
}

// ---------------------------------------------------------------------------
// ScriptedFetcher
// ---------------------------------------------------------------------------

/// In-memory page fetcher: URL → (status, body); unknown URLs 404.
#[derive(Default)]
pub(crate) struct ScriptedFetcher {
    pages: Mutex<HashMap<String, (u16, String)>>,
    count: AtomicUsize,
}

impl ScriptedFetcher {
    pub(crate) fn serve(&self, url: &str, status: u16, body: &str) {
        self.pages
            .lock()
            .unwrap()
            .insert(url.to_string(), (status, body.to_string()));
    }

    pub(crate) fn fetch_count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PageFetcher for ScriptedFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage> {
        self.count.fetch_add(1, Ordering::SeqCst);
        let (status, body) = self
            .pages
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .unwrap_or((404, String::new()));
        Ok(FetchedPage { status, body })
    }
}

// ---------------------------------------------------------------------------
// Search doubles
// ---------------------------------------------------------------------------

pub(crate) struct NullSearch;

#[async_trait]
impl SearchProvider for NullSearch {
    fn target(&self) -> &str {
        "search-null"
    }

    async fn search(&self, _query: &str) -> Result<Vec<SearchHit>> {
        Ok(Vec::new())
    }
}

pub(crate) struct ScriptedSearch {
    hits: Vec<SearchHit>,
}

impl ScriptedSearch {
    pub(crate) fn empty() -> Self {
        Self { hits: Vec::new() }
    }

    pub(crate) fn with_hits(hits: Vec<(&str, &str)>) -> Self {
        Self {
            hits: hits
                .into_iter()
                .map(|(url, title)| SearchHit {
                    url: url.to_string(),
                    title: title.to_string(),
                    snippet: String::new(),
                })
                .collect(),
        }
    }
}

#[async_trait]
impl SearchProvider for ScriptedSearch {
    fn target(&self) -> &str {
        "search-scripted"
    }

    async fn search(&self, _query: &str) -> Result<Vec<SearchHit>> {
        Ok(self.hits.clone())
    }
}

// ---------------------------------------------------------------------------
// Registry doubles
// ---------------------------------------------------------------------------

pub(crate) struct NullRegistry;

#[async_trait]
impl RegistryProvider for NullRegistry {
    fn target(&self) -> &str {
        "registry-null"
    }

    async fn lookup_by_vat(&self, _vat: &str) -> Result<Option<RegistryProfile>> {
        Ok(None)
    }

    async fn search_by_name(&self, _name: &str, _city: &str) -> Result<Option<RegistryProfile>> {
        Ok(None)
    }
}

#[derive(Default)]
pub(crate) struct ScriptedRegistry {
    vat_profile: Option<RegistryProfile>,
    name_profile: Option<RegistryProfile>,
    vat_calls: AtomicUsize,
    name_calls: AtomicUsize,
}

impl ScriptedRegistry {
    pub(crate) fn empty() -> Self {
        Self::default()
    }

    pub(crate) fn with_vat_profile(profile: RegistryProfile) -> Self {
        Self {
            vat_profile: Some(profile),
            ..Self::default()
        }
    }

    pub(crate) fn with_name_profile(profile: RegistryProfile) -> Self {
        Self {
            name_profile: Some(profile),
            ..Self::default()
        }
    }

    pub(crate) fn vat_lookups(&self) -> usize {
        self.vat_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn name_searches(&self) -> usize {
        self.name_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RegistryProvider for ScriptedRegistry {
    fn target(&self) -> &str {
        "registry-scripted"
    }

    async fn lookup_by_vat(&self, _vat: &str) -> Result<Option<RegistryProfile>> {
        self.vat_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.vat_profile.clone())
    }

    async fn search_by_name(&self, _name: &str, _city: &str) -> Result<Option<RegistryProfile>> {
        self.name_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.name_profile.clone())
    }
}

// ---------------------------------------------------------------------------
// Oracle doubles
// ---------------------------------------------------------------------------

pub(crate) struct NullOracle;

#[async_trait]
impl Oracle for NullOracle {
    fn target(&self) -> &str {
        "oracle-null"
    }

    async fn complete_structured(&self, _prompt: &str) -> Result<Option<serde_json::Value>> {
        Ok(None)
    }

    fn tokens_spent(&self) -> u64 {
        0
    }
}

pub(crate) struct ScriptedOracle {
    value: Option<serde_json::Value>,
}

impl ScriptedOracle {
    pub(crate) fn with_value(value: serde_json::Value) -> Self {
        Self { value: Some(value) }
    }
}

#[async_trait]
impl Oracle for ScriptedOracle {
    fn target(&self) -> &str {
        "oracle-scripted"
    }

    async fn complete_structured(&self, _prompt: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.value.clone())
    }

    fn tokens_spent(&self) -> u64 {
        0
    }
}
