//! Configuration for the scanner and the triage worker.
//!
//! Both tools read their environment on startup; flags layer on top of the
//! values resolved here.

use crate::client::DEFAULT_DB_HOST;
use crate::error::{Error, Result};
use crate::modpath::PKGSITE_URL;
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;

/// Environment variable naming the vulnerability database sources,
/// comma-separated (`https://…`, `http://…`, or `file://…`).
pub const ENV_VULNDB: &str = "GOVULNDB";

/// Scanner configuration.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Vulnerability database source URIs.
    pub db_sources: Vec<String>,
    /// Directory for the HTTP cache.
    pub cache_dir: PathBuf,
}

impl ScanConfig {
    /// Load configuration from environment variables.
    ///
    /// - `GOVULNDB` — comma-separated DB source URIs (default: the public host)
    /// - `VULNREACH_CACHE_DIR` — HTTP cache directory (default: under the
    ///   system temp directory)
    pub fn from_env() -> Self {
        dotenv().ok();
        let db_sources = db_sources_from_env();
        let cache_dir = env::var("VULNREACH_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| env::temp_dir().join("vulnreach").join("dbcache"));
        Self {
            db_sources,
            cache_dir,
        }
    }
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// `owner/repo` to create issues in.
    pub issue_repo: Option<String>,
    /// Access token for the issue tracker.
    pub github_token: Option<String>,
    /// Base URL of the package metadata service.
    pub pkgsite_url: String,
    /// Vulnerability database source URIs (for the known-CVE set).
    pub db_sources: Vec<String>,
    /// Path of the store file for command-line runs.
    pub store_path: PathBuf,
    /// When set, logs go to daily files in this directory.
    pub log_dir: Option<PathBuf>,
}

impl WorkerConfig {
    /// Load configuration from environment variables.
    ///
    /// - `VULN_WORKER_ISSUE_REPO` — `owner/repo` for created issues
    /// - `VULN_WORKER_PKGSITE_URL` — metadata service base (default pkg.go.dev)
    /// - `VULN_WORKER_STORE_PATH` — store file for command-line runs
    /// - `VULN_WORKER_LOG_DIR` — log to daily files instead of stderr
    /// - `GOVULNDB` — DB source URIs for the known-CVE short-circuit
    pub fn from_env() -> Self {
        dotenv().ok();
        Self {
            issue_repo: env::var("VULN_WORKER_ISSUE_REPO").ok().filter(|s| !s.is_empty()),
            github_token: None,
            pkgsite_url: env::var("VULN_WORKER_PKGSITE_URL")
                .unwrap_or_else(|_| PKGSITE_URL.to_string()),
            db_sources: db_sources_from_env(),
            store_path: env::var("VULN_WORKER_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("vulnreach-worker.store.json")),
            log_dir: env::var("VULN_WORKER_LOG_DIR").ok().map(PathBuf::from),
        }
    }

    /// Validate that issue creation is configured.
    pub fn validate_for_issues(&self) -> Result<(&str, &str)> {
        let repo = self.issue_repo.as_deref().ok_or_else(|| {
            Error::usage("issue repo is required (set VULN_WORKER_ISSUE_REPO)")
        })?;
        let token = self.github_token.as_deref().ok_or_else(|| {
            Error::usage("issue tracker token is required (use -ghtokenfile)")
        })?;
        Ok((repo, token))
    }
}

fn db_sources_from_env() -> Vec<String> {
    match env::var(ENV_VULNDB) {
        Ok(v) if !v.trim().is_empty() => v
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        _ => vec![DEFAULT_DB_HOST.to_string()],
    }
}
