//! Vulnerability database client.
//!
//! The expected database layout is the same for HTTP and local sources: an
//! `index.json` at the root mapping module paths to the time their entries
//! were last modified, and one `{modulePath}.json` file per module holding an
//! array of OSV entries.
//!
//! A single [`Client`] can be configured with multiple sources (combined via
//! comma in the `GOVULNDB` environment variable). When looking up modules,
//! every source is consulted and the results are concatenated. Any transport
//! error is fatal to the call; partial results are never returned.

use crate::error::{Error, Result};
use crate::osv::{DbIndex, Entry};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures_util::StreamExt;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// The public vulnerability database host.
pub const DEFAULT_DB_HOST: &str = "https://vuln.go.dev";

/// How long a cached index is served without revalidation.
const DEFAULT_INDEX_TTL_SECS: i64 = 2 * 60 * 60;

/// Fan-out bound for bulk entry reads.
const BULK_CONCURRENCY: usize = 4;

/// Cache for HTTP sources, keyed by database name (hostname).
pub trait Cache: Send + Sync {
    fn read_index(&self, db: &str) -> Result<Option<(DbIndex, DateTime<Utc>)>>;
    fn write_index(&self, db: &str, index: &DbIndex, retrieved: DateTime<Utc>) -> Result<()>;
    fn read_entries(&self, db: &str, module: &str) -> Result<Vec<Entry>>;
    fn write_entries(&self, db: &str, module: &str, entries: &[Entry]) -> Result<()>;
}

/// In-memory cache, used in tests and short-lived scans.
#[derive(Default)]
pub struct MemCache {
    inner: Mutex<MemCacheInner>,
}

#[derive(Default)]
struct MemCacheInner {
    indexes: HashMap<String, (DbIndex, DateTime<Utc>)>,
    entries: HashMap<(String, String), Vec<Entry>>,
}

impl MemCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Cache for MemCache {
    fn read_index(&self, db: &str) -> Result<Option<(DbIndex, DateTime<Utc>)>> {
        Ok(self.inner.lock().unwrap().indexes.get(db).cloned())
    }

    fn write_index(&self, db: &str, index: &DbIndex, retrieved: DateTime<Utc>) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .indexes
            .insert(db.to_string(), (index.clone(), retrieved));
        Ok(())
    }

    fn read_entries(&self, db: &str, module: &str) -> Result<Vec<Entry>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .entries
            .get(&(db.to_string(), module.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    fn write_entries(&self, db: &str, module: &str, entries: &[Entry]) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .entries
            .insert((db.to_string(), module.to_string()), entries.to_vec());
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct CachedIndex {
    retrieved: DateTime<Utc>,
    index: DbIndex,
}

/// Filesystem cache storing JSON under `{dir}/{db}/`.
pub struct FsCache {
    dir: PathBuf,
}

impl FsCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn index_path(&self, db: &str) -> PathBuf {
        self.dir.join(db).join("index").join("index.json")
    }

    fn entries_path(&self, db: &str, module: &str) -> PathBuf {
        self.dir.join(db).join(format!("{module}.json"))
    }

    fn read_json<T: serde::de::DeserializeOwned>(path: &PathBuf) -> Result<Option<T>> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_json<T: Serialize>(path: &PathBuf, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec(value)?)?;
        Ok(())
    }
}

impl Cache for FsCache {
    fn read_index(&self, db: &str) -> Result<Option<(DbIndex, DateTime<Utc>)>> {
        let cached: Option<CachedIndex> = Self::read_json(&self.index_path(db))?;
        Ok(cached.map(|c| (c.index, c.retrieved)))
    }

    fn write_index(&self, db: &str, index: &DbIndex, retrieved: DateTime<Utc>) -> Result<()> {
        Self::write_json(
            &self.index_path(db),
            &CachedIndex {
                retrieved,
                index: index.clone(),
            },
        )
    }

    fn read_entries(&self, db: &str, module: &str) -> Result<Vec<Entry>> {
        Ok(Self::read_json(&self.entries_path(db, module))?.unwrap_or_default())
    }

    fn write_entries(&self, db: &str, module: &str, entries: &[Entry]) -> Result<()> {
        Self::write_json(&self.entries_path(db, module), &entries.to_vec())
    }
}

#[async_trait]
trait Source: Send + Sync {
    async fn index(&self) -> Result<DbIndex>;
    async fn get(&self, modules: &[String]) -> Result<Vec<Entry>>;
}

struct LocalSource {
    dir: PathBuf,
}

#[async_trait]
impl Source for LocalSource {
    async fn index(&self) -> Result<DbIndex> {
        let bytes = std::fs::read(self.dir.join("index.json"))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn get(&self, modules: &[String]) -> Result<Vec<Entry>> {
        let mut entries = Vec::new();
        for module in modules {
            let path = self.dir.join(format!("{module}.json"));
            match std::fs::read(&path) {
                Ok(bytes) => {
                    let mut e: Vec<Entry> = serde_json::from_slice(&bytes)?;
                    entries.append(&mut e);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(entries)
    }
}

struct HttpSource {
    base: String,
    db_name: String,
    client: reqwest::Client,
    cache: Option<Arc<dyn Cache>>,
    index_ttl: Duration,
}

impl HttpSource {
    async fn fetch_index(&self) -> Result<DbIndex> {
        let mut cached_retrieved: Option<DateTime<Utc>> = None;
        let mut cached_index: Option<DbIndex> = None;

        if let Some(cache) = &self.cache {
            if let Some((index, retrieved)) = cache.read_index(&self.db_name)? {
                if Utc::now() - retrieved < self.index_ttl {
                    return Ok(index);
                }
                cached_retrieved = Some(retrieved);
                cached_index = Some(index);
            }
        }

        let mut req = self.client.get(format!("{}/index.json", self.base));
        if let Some(retrieved) = cached_retrieved {
            req = req.header(
                reqwest::header::IF_MODIFIED_SINCE,
                retrieved.format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
            );
        }
        let resp = req.send().await?;
        if cached_retrieved.is_some() && resp.status() == StatusCode::NOT_MODIFIED {
            return Ok(cached_index.expect("cached index present on 304"));
        }
        if resp.status() != StatusCode::OK {
            return Err(Error::data(
                &self.db_name,
                format!("unexpected status code: {}", resp.status()),
            ));
        }
        let index: DbIndex = resp.json().await?;
        if let Some(cache) = &self.cache {
            cache.write_index(&self.db_name, &index, Utc::now())?;
        }
        Ok(index)
    }
}

#[async_trait]
impl Source for HttpSource {
    async fn index(&self) -> Result<DbIndex> {
        self.fetch_index().await
    }

    async fn get(&self, modules: &[String]) -> Result<Vec<Entry>> {
        let index = self.fetch_index().await?;

        let mut entries = Vec::new();
        let mut still_need = Vec::new();
        for module in modules {
            let Some(last_modified) = index.get(module) else {
                // Not listed in the index: no known vulnerabilities.
                continue;
            };
            if let Some(cache) = &self.cache {
                let cached = cache.read_entries(&self.db_name, module)?;
                if !cached.is_empty() {
                    let stale = cached
                        .iter()
                        .any(|e| e.modified.map_or(true, |m| m < *last_modified));
                    if !stale {
                        entries.extend(cached);
                        continue;
                    }
                }
            }
            still_need.push(module.clone());
        }

        for module in still_need {
            let resp = self
                .client
                .get(format!("{}/{}.json", self.base, module))
                .send()
                .await?;
            if resp.status() == StatusCode::NOT_FOUND {
                // Listed in the index but missing on the server.
                continue;
            }
            if resp.status() != StatusCode::OK {
                return Err(Error::data(
                    &self.db_name,
                    format!("unexpected status code for {module}: {}", resp.status()),
                ));
            }
            let e: Vec<Entry> = resp.json().await?;
            debug!(module = %module, entries = e.len(), "fetched module entries");
            if let Some(cache) = &self.cache {
                cache.write_entries(&self.db_name, &module, &e)?;
            }
            entries.extend(e);
        }
        Ok(entries)
    }
}

/// Options for constructing a [`Client`].
#[derive(Default)]
pub struct ClientOptions {
    /// HTTP client to use; a default client is built when absent.
    pub http_client: Option<reqwest::Client>,
    /// Cache for HTTP sources; uncached when absent.
    pub cache: Option<Arc<dyn Cache>>,
    /// Index freshness window; defaults to two hours.
    pub index_ttl: Option<Duration>,
}

/// Multi-source vulnerability database client.
pub struct Client {
    sources: Vec<Box<dyn Source>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("sources", &self.sources.len())
            .finish()
    }
}

impl Client {
    /// Build a client from source URIs (`file://path`, `http://…`,
    /// `https://…`). Trailing slashes are trimmed.
    pub fn new(uris: &[String], options: ClientOptions) -> Result<Self> {
        let http_client = options.http_client.unwrap_or_default();
        let index_ttl = options
            .index_ttl
            .unwrap_or_else(|| Duration::seconds(DEFAULT_INDEX_TTL_SECS));

        let mut sources: Vec<Box<dyn Source>> = Vec::new();
        for uri in uris {
            let uri = uri.trim_end_matches('/');
            if let Some(dir) = uri.strip_prefix("file://") {
                sources.push(Box::new(LocalSource {
                    dir: PathBuf::from(dir),
                }));
            } else if uri.starts_with("http://") || uri.starts_with("https://") {
                let host = uri
                    .split("://")
                    .nth(1)
                    .and_then(|rest| rest.split('/').next())
                    .filter(|h| !h.is_empty())
                    .ok_or_else(|| Error::usage(format!("source {uri:?} has no host")))?;
                sources.push(Box::new(HttpSource {
                    base: uri.to_string(),
                    db_name: host.to_string(),
                    client: http_client.clone(),
                    cache: options.cache.clone(),
                    index_ttl,
                }));
            } else {
                return Err(Error::usage(format!(
                    "source {uri:?} has unsupported scheme"
                )));
            }
        }
        Ok(Self { sources })
    }

    /// Fetch the OSV entries for the given modules from every source.
    pub async fn get(&self, modules: &[String]) -> Result<Vec<Entry>> {
        let mut entries = Vec::new();
        for source in &self.sources {
            entries.extend(source.get(modules).await?);
        }
        Ok(entries)
    }

    /// The most recent index modification time across all sources.
    pub async fn last_modified(&self) -> Result<Option<DateTime<Utc>>> {
        let mut latest = None;
        for source in &self.sources {
            let index = source.index().await?;
            for t in index.values() {
                if latest.map_or(true, |l| *t > l) {
                    latest = Some(*t);
                }
            }
        }
        Ok(latest)
    }

    /// Collect every CVE alias recorded in the databases, reading module
    /// entries with bounded fan-out. Used by the triage worker to
    /// short-circuit CVEs the databases already cover.
    pub async fn known_cve_ids(&self) -> Result<HashSet<String>> {
        let mut ids = HashSet::new();
        for source in &self.sources {
            let index = source.index().await?;
            let modules: Vec<String> = index.into_keys().collect();
            let mut fetches = futures_util::stream::iter(
                modules
                    .chunks(64)
                    .map(|chunk| source.get(chunk))
                    .collect::<Vec<_>>(),
            )
            .buffer_unordered(BULK_CONCURRENCY);
            while let Some(batch) = fetches.next().await {
                for entry in batch? {
                    ids.extend(entry.cve_aliases().map(str::to_string));
                }
            }
        }
        Ok(ids)
    }
}
