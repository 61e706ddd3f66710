//! Failure classifier: maps raw HTTP/network/content signals onto the closed
//! [`BlockKind`] taxonomy.
//!
//! Explicit status codes take precedence over body-content heuristics.
//! Every non-`None` signature feeds a per-target rolling counter; a target
//! whose counter crosses the threshold is "hot" — an advisory the waterfall
//! and orchestrator consult before issuing more calls. Backoff itself is the
//! rate governor's job, not the classifier's.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::debug;

use ditta_shared::{BlockKind, DittaError};

/// A 2xx body shorter than this (after trimming) is implausible for a real page.
const MIN_PLAUSIBLE_BODY: usize = 256;

/// Body fragments that indicate a CAPTCHA interstitial.
const CAPTCHA_MARKERS: &[&str] = &[
    "captcha",
    "recaptcha",
    "hcaptcha",
    "are you a robot",
    "non sei un robot",
];

/// Body fragments that indicate a bot-challenge page.
const CHALLENGE_MARKERS: &[&str] = &[
    "checking your browser",
    "just a moment",
    "attention required",
    "cf-browser-verification",
    "ddos protection",
];

/// Body fragments that indicate an outright WAF denial.
const DENIED_MARKERS: &[&str] = &[
    "access denied",
    "request blocked",
    "forbidden",
    "accesso negato",
];

// ---------------------------------------------------------------------------
// Signature
// ---------------------------------------------------------------------------

/// The classified outcome of one external call.
#[derive(Debug, Clone)]
pub struct Signature {
    pub kind: BlockKind,
    pub target: String,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    /// The raw signal that drove the classification (status line, marker,
    /// or error text), kept for audit logs.
    pub raw_signal: String,
}

// ---------------------------------------------------------------------------
// FailureClassifier
// ---------------------------------------------------------------------------

/// Shared, internally synchronized classifier with per-target rolling counters.
pub struct FailureClassifier {
    /// Rolling window over which block signatures count toward "hot".
    window: Duration,
    /// Signatures within the window before a target is considered hot.
    hot_threshold: usize,
    counters: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl FailureClassifier {
    pub fn new(hot_threshold: usize) -> Self {
        Self {
            window: Duration::from_secs(600),
            hot_threshold: hot_threshold.max(1),
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Classify an HTTP response. Status codes win over body heuristics.
    pub fn classify(&self, status: u16, body: &str, target: &str, source: &str) -> Signature {
        let lower = body.to_lowercase();

        let (kind, raw_signal) = match status {
            429 => (BlockKind::RateLimited, format!("HTTP {status}")),
            403 => {
                if let Some(marker) = find_marker(&lower, CAPTCHA_MARKERS) {
                    (BlockKind::Captcha, format!("HTTP 403 + \"{marker}\""))
                } else {
                    (BlockKind::WafBlock, "HTTP 403".into())
                }
            }
            408 | 504 => (BlockKind::Timeout, format!("HTTP {status}")),
            200..=299 => classify_body(&lower, body),
            _ => {
                // Other statuses: body heuristics only; a plain 5xx is not a block.
                if let Some(marker) = find_marker(&lower, CHALLENGE_MARKERS) {
                    (
                        BlockKind::ChallengePage,
                        format!("HTTP {status} + \"{marker}\""),
                    )
                } else {
                    (BlockKind::None, format!("HTTP {status}"))
                }
            }
        };

        self.finish(kind, target, source, raw_signal)
    }

    /// Classify a transport-level error.
    pub fn classify_error(&self, error: &DittaError, target: &str, source: &str) -> Signature {
        let kind = match error {
            DittaError::Blocked { kind, .. } => *kind,
            DittaError::Network(msg) => {
                let lower = msg.to_lowercase();
                if lower.contains("timed out") || lower.contains("timeout") {
                    BlockKind::Timeout
                } else {
                    BlockKind::ConnectionRefused
                }
            }
            _ => BlockKind::None,
        };

        self.finish(kind, target, source, error.to_string())
    }

    /// Whether the target has crossed the hot threshold within the window.
    /// Advisory only — the rate governor owns backoff.
    pub fn is_hot(&self, target: &str) -> bool {
        let mut counters = self.counters.lock().expect("classifier lock poisoned");
        let Some(hits) = counters.get_mut(target) else {
            return false;
        };
        prune(hits, self.window);
        hits.len() >= self.hot_threshold
    }

    /// Current block-signature count within the window, for logging.
    pub fn pressure(&self, target: &str) -> usize {
        let mut counters = self.counters.lock().expect("classifier lock poisoned");
        match counters.get_mut(target) {
            Some(hits) => {
                prune(hits, self.window);
                hits.len()
            }
            None => 0,
        }
    }

    fn finish(&self, kind: BlockKind, target: &str, source: &str, raw_signal: String) -> Signature {
        if kind.is_block() {
            let mut counters = self.counters.lock().expect("classifier lock poisoned");
            let hits = counters.entry(target.to_string()).or_default();
            prune(hits, self.window);
            hits.push_back(Instant::now());
            debug!(target, %kind, pressure = hits.len(), "block signature recorded");
        }

        Signature {
            kind,
            target: target.to_string(),
            source: source.to_string(),
            timestamp: Utc::now(),
            raw_signal,
        }
    }
}

impl Default for FailureClassifier {
    fn default() -> Self {
        Self::new(5)
    }
}

/// Body-content heuristics for 2xx responses.
fn classify_body(lower: &str, body: &str) -> (BlockKind, String) {
    if let Some(marker) = find_marker(lower, CAPTCHA_MARKERS) {
        return (BlockKind::Captcha, format!("body: \"{marker}\""));
    }
    if let Some(marker) = find_marker(lower, CHALLENGE_MARKERS) {
        return (BlockKind::ChallengePage, format!("body: \"{marker}\""));
    }
    if let Some(marker) = find_marker(lower, DENIED_MARKERS) {
        return (BlockKind::WafBlock, format!("body: \"{marker}\""));
    }
    if body.trim().len() < MIN_PLAUSIBLE_BODY {
        return (
            BlockKind::EmptyResponse,
            format!("body length {}", body.trim().len()),
        );
    }
    (BlockKind::None, "2xx".into())
}

fn find_marker<'a>(lower: &str, markers: &[&'a str]) -> Option<&'a str> {
    markers.iter().find(|m| lower.contains(**m)).copied()
}

fn prune(hits: &mut VecDeque<Instant>, window: Duration) {
    let cutoff = Instant::now().checked_sub(window);
    if let Some(cutoff) = cutoff {
        while hits.front().is_some_and(|t| *t < cutoff) {
            hits.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plausible_page() -> String {
        format!("<html><body>{}</body></html>", "contenuto ".repeat(50))
    }

    #[test]
    fn status_429_is_rate_limited() {
        let classifier = FailureClassifier::default();
        let sig = classifier.classify(429, "slow down", "example.com", "search");
        assert_eq!(sig.kind, BlockKind::RateLimited);
    }

    #[test]
    fn status_403_with_captcha_body_is_captcha_not_waf() {
        let classifier = FailureClassifier::default();
        let sig = classifier.classify(
            403,
            "<html>please solve this reCAPTCHA to continue</html>",
            "registroimprese.it",
            "registry",
        );
        assert_eq!(sig.kind, BlockKind::Captcha);
        assert!(sig.raw_signal.contains("recaptcha"));
    }

    #[test]
    fn status_403_without_markers_is_waf_block() {
        let classifier = FailureClassifier::default();
        let sig = classifier.classify(403, "<html>no</html>", "example.com", "site");
        assert_eq!(sig.kind, BlockKind::WafBlock);
    }

    #[test]
    fn short_2xx_body_is_empty_response() {
        let classifier = FailureClassifier::default();
        let sig = classifier.classify(200, "<html></html>", "example.com", "site");
        assert_eq!(sig.kind, BlockKind::EmptyResponse);
    }

    #[test]
    fn healthy_2xx_body_is_none() {
        let classifier = FailureClassifier::default();
        let sig = classifier.classify(200, &plausible_page(), "example.com", "site");
        assert_eq!(sig.kind, BlockKind::None);
        assert_eq!(classifier.pressure("example.com"), 0);
    }

    #[test]
    fn challenge_body_wins_on_2xx() {
        let classifier = FailureClassifier::default();
        let body = format!("Just a moment... {}", plausible_page());
        let sig = classifier.classify(200, &body, "example.com", "site");
        assert_eq!(sig.kind, BlockKind::ChallengePage);
    }

    #[test]
    fn network_errors_map_to_transport_kinds() {
        let classifier = FailureClassifier::default();
        let sig = classifier.classify_error(
            &DittaError::Network("operation timed out".into()),
            "example.com",
            "site",
        );
        assert_eq!(sig.kind, BlockKind::Timeout);

        let sig = classifier.classify_error(
            &DittaError::Network("connection refused".into()),
            "example.com",
            "site",
        );
        assert_eq!(sig.kind, BlockKind::ConnectionRefused);
    }

    #[test]
    fn target_goes_hot_after_threshold() {
        let classifier = FailureClassifier::new(3);
        for _ in 0..2 {
            classifier.classify(429, "", "hot.example", "search");
        }
        assert!(!classifier.is_hot("hot.example"));
        classifier.classify(429, "", "hot.example", "search");
        assert!(classifier.is_hot("hot.example"));
        // Other targets are unaffected.
        assert!(!classifier.is_hot("cool.example"));
    }
}
