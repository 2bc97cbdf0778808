//! Candidate module path extraction and validation.
//!
//! Free-form reference URLs in CVEs are turned into candidate module paths by
//! progressively trimming trailing path segments, then validated against the
//! package metadata service with a HEAD probe. Probes are rate limited and
//! memoized for the lifetime of the process.

use crate::error::Result;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::info;

/// Reserved module path denoting the platform standard library, which has no
/// normal module path of its own.
pub const STDLIB_MODULE_PATH: &str = "stdlib";

/// The default package metadata service.
pub const PKGSITE_URL: &str = "https://pkg.go.dev";

/// Hosts whose repositories are rooted three path segments deep.
const VCS_HOSTS: [&str; 6] = [
    "bitbucket.org",
    "gitea.com",
    "gitee.com",
    "github.com",
    "gitlab.com",
    "golang.org",
];

/// URL substrings that indicate standard-library discussion or code.
const STDLIB_KEYWORDS: [&str; 4] = [
    "github.com/golang",
    "golang-announce",
    "golang-nuts",
    "golang.org",
];

/// What a reference URL may resolve to before probing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlClassification {
    /// The URL points at the standard library. `package` is set when the URL
    /// names a specific stdlib package (e.g. a pkg.go.dev package page).
    Stdlib { package: Option<String> },
    /// Candidate module paths, longest first, to validate via the metadata
    /// service.
    Candidates(Vec<String>),
}

/// Classify a reference URL into a stdlib short-circuit or a candidate list.
pub fn classify_reference_url(url: &str) -> UrlClassification {
    if STDLIB_KEYWORDS.iter().any(|k| url.contains(k)) && !url.contains("golang.org/x/") {
        return UrlClassification::Stdlib { package: None };
    }

    let host_path = strip_scheme(url);
    let (host, rest) = match host_path.split_once('/') {
        Some((h, r)) => (h, r),
        None => (host_path, ""),
    };

    // Package index pages name the module (or stdlib package) directly after
    // the host; generate candidates from the remainder instead.
    if host == "pkg.go.dev" && !rest.is_empty() {
        let first = rest.split('/').next().unwrap_or("");
        if !first.contains('.') {
            return UrlClassification::Stdlib {
                package: Some(rest.trim_end_matches('/').to_string()),
            };
        }
        return UrlClassification::Candidates(candidate_module_paths(rest));
    }

    UrlClassification::Candidates(candidate_module_paths(host_path))
}

/// Generate candidate module paths from a `host/path` string, longest first,
/// down to three segments for known VCS hosts and two otherwise.
pub fn candidate_module_paths(host_path: &str) -> Vec<String> {
    let cleaned = strip_noise(host_path);
    let parts: Vec<&str> = cleaned.split('/').filter(|s| !s.is_empty()).collect();
    if parts.is_empty() {
        return Vec::new();
    }
    let min_len = if VCS_HOSTS.contains(&parts[0]) { 3 } else { 2 };
    if parts.len() < min_len {
        return Vec::new();
    }
    (min_len..=parts.len())
        .rev()
        .map(|n| parts[..n].join("/"))
        .collect()
}

fn strip_scheme(url: &str) -> &str {
    match url.split_once("://") {
        Some((_, rest)) => rest,
        None => url,
    }
}

fn strip_noise(host_path: &str) -> &str {
    let s = host_path
        .split(['#', '?'])
        .next()
        .unwrap_or(host_path);
    s.trim_end_matches('/')
}

/// Token-bucket limiter: one probe per `interval` with a small burst.
pub struct RateLimiter {
    state: Mutex<LimiterState>,
    interval: Duration,
    burst: f64,
}

struct LimiterState {
    tokens: f64,
    last: Instant,
}

impl RateLimiter {
    pub fn new(interval: Duration, burst: u32) -> Self {
        Self {
            state: Mutex::new(LimiterState {
                tokens: burst as f64,
                last: Instant::now(),
            }),
            interval,
            burst: burst as f64,
        }
    }

    /// Wait until a request slot is available. Waiters are serialized, which
    /// keeps spacing between probes at least the configured interval once the
    /// burst is spent.
    pub async fn acquire(&self) {
        let mut state = self.state.lock().await;
        loop {
            let now = Instant::now();
            let elapsed = now.duration_since(state.last).as_secs_f64();
            let refill = elapsed / self.interval.as_secs_f64();
            state.tokens = (state.tokens + refill).min(self.burst);
            state.last = now;
            if state.tokens >= 1.0 {
                state.tokens -= 1.0;
                return;
            }
            let deficit = 1.0 - state.tokens;
            let wait = self.interval.mul_f64(deficit);
            tokio::time::sleep(wait).await;
        }
    }
}

/// Client for the package metadata service.
///
/// Holds the process-wide memoization table and rate limiter, so the
/// composition root constructs one instance and shares it (no hidden
/// singletons).
pub struct PkgsiteClient {
    base: String,
    client: reqwest::Client,
    seen: Mutex<HashMap<String, bool>>,
    limiter: RateLimiter,
    known: Option<HashSet<String>>,
}

impl PkgsiteClient {
    /// Create a client probing the given service base URL.
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            client: reqwest::Client::new(),
            seen: Mutex::new(HashMap::new()),
            // Limit probes to 2 qps (once every 500ms) with a small burst.
            limiter: RateLimiter::new(Duration::from_millis(500), 3),
            known: None,
        }
    }

    /// Use a preloaded set of known modules instead of the network.
    pub fn with_known_modules(mut self, modules: HashSet<String>) -> Self {
        self.known = Some(modules);
        self
    }

    /// Report whether the metadata service knows `module_path` as a module.
    pub async fn known_module(&self, module_path: &str) -> Result<bool> {
        if let Some(known) = &self.known {
            return Ok(known.contains(module_path));
        }
        {
            let seen = self.seen.lock().await;
            if let Some(&known) = seen.get(module_path) {
                return Ok(known);
            }
        }
        self.limiter.acquire().await;
        let start = Instant::now();
        let url = format!("{}/mod/{}", self.base, module_path);
        let resp = self.client.head(&url).send().await?;
        info!(
            url = %url,
            status = %resp.status(),
            latency_ms = start.elapsed().as_millis() as u64,
            "HEAD probe"
        );
        let known = resp.status() == reqwest::StatusCode::OK;
        self.seen.lock().await.insert(module_path.to_string(), known);
        Ok(known)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_trim_longest_first() {
        assert_eq!(
            candidate_module_paths("bitbucket.org/foo/bar/baz/v2"),
            vec![
                "bitbucket.org/foo/bar/baz/v2",
                "bitbucket.org/foo/bar/baz",
                "bitbucket.org/foo/bar",
            ]
        );
        assert_eq!(
            candidate_module_paths("bitbucket.org/foo/bar"),
            vec!["bitbucket.org/foo/bar"]
        );
        // Too few segments for a VCS host.
        assert!(candidate_module_paths("bitbucket.org/foo").is_empty());
        // Unknown hosts trim down to two segments.
        assert_eq!(
            candidate_module_paths("example.com/a/b"),
            vec!["example.com/a/b", "example.com/a"]
        );
    }

    #[test]
    fn candidates_ignore_fragments_and_slashes() {
        assert_eq!(
            candidate_module_paths("github.com/foo/bar/issues/12#issuecomment"),
            vec![
                "github.com/foo/bar/issues/12",
                "github.com/foo/bar/issues",
                "github.com/foo/bar",
            ]
        );
        assert_eq!(
            candidate_module_paths("github.com/foo/bar/"),
            vec!["github.com/foo/bar"]
        );
    }

    #[test]
    fn stdlib_keyword_short_circuit() {
        for url in [
            "https://groups.google.com/forum/#!topic/golang-nuts/1234",
            "https://github.com/golang/go/issues/123",
            "https://golang.org/pkg/net/http",
        ] {
            assert_eq!(
                classify_reference_url(url),
                UrlClassification::Stdlib { package: None },
                "{url}"
            );
        }
        // golang.org/x/ repositories are regular modules, not stdlib.
        assert_eq!(
            classify_reference_url("https://golang.org/x/mod"),
            UrlClassification::Candidates(vec!["golang.org/x/mod".to_string()])
        );
    }

    #[test]
    fn pkgsite_urls_strip_the_host() {
        assert_eq!(
            classify_reference_url("https://pkg.go.dev/golang.org/x/mod"),
            UrlClassification::Candidates(vec!["golang.org/x/mod".to_string()])
        );
        assert_eq!(
            classify_reference_url("https://pkg.go.dev/net/http"),
            UrlClassification::Stdlib {
                package: Some("net/http".to_string())
            }
        );
    }

    #[tokio::test]
    async fn preloaded_known_modules_bypass_the_network() {
        let client = PkgsiteClient::new("http://pkgsite.invalid")
            .with_known_modules(["golang.org/x/mod".to_string()].into());
        assert!(client.known_module("golang.org/x/mod").await.unwrap());
        assert!(!client.known_module("github.com/nobody/nothing").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limiter_spaces_requests_after_burst() {
        let limiter = RateLimiter::new(Duration::from_millis(500), 3);
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(100));
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(500));
    }
}
