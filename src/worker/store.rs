//! Store interface and records for the triage worker.
//!
//! The backing document store is external; this module defines the record
//! types, the transactional interface the update pipeline runs against, and
//! an in-memory implementation used by tests and local runs. Transaction
//! bodies may be retried by a real store, so they must be idempotent and
//! report their counters as return values rather than mutating shared state.

use crate::cveschema::Cve;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

/// Sentinel directory hash marking a directory whose processing has started
/// but not finished. It can never equal a real tree hash, so a crashed pass
/// reprocesses the directory instead of skipping it.
pub const DIRECTORY_HASH_IN_PROGRESS: &str = "in progress";

/// Lifecycle label of a CVE record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriageState {
    /// The CVE needs a review ticket.
    NeedsIssue,
    /// The CVE does not concern this ecosystem.
    NoActionNeeded,
    /// A review ticket was created.
    IssueCreated,
    /// The CVE content changed after its ticket was created.
    UpdatedSinceIssueCreation,
}

impl fmt::Display for TriageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TriageState::NeedsIssue => "NeedsIssue",
            TriageState::NoActionNeeded => "NoActionNeeded",
            TriageState::IssueCreated => "IssueCreated",
            TriageState::UpdatedSinceIssueCreation => "UpdatedSinceIssueCreation",
        };
        f.write_str(s)
    }
}

impl FromStr for TriageState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "NeedsIssue" => Ok(TriageState::NeedsIssue),
            "NoActionNeeded" => Ok(TriageState::NoActionNeeded),
            "IssueCreated" => Ok(TriageState::IssueCreated),
            "UpdatedSinceIssueCreation" => Ok(TriageState::UpdatedSinceIssueCreation),
            _ => Err(Error::usage(format!("bad triage state: {s:?}"))),
        }
    }
}

/// A CVE record in the store, created on first sighting and mutated in
/// place. Records are never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CveRecord {
    /// CVE identifier.
    pub id: String,
    /// Hash of the source blob this record reflects.
    pub blob_hash: String,
    /// Repo-relative path of the source file.
    pub path: String,
    /// The commit the record was last processed at.
    pub commit_hash: String,
    /// CVE state (PUBLIC, RESERVED, REJECT, …).
    pub cve_state: String,
    pub triage_state: TriageState,
    /// Why the record is in its triage state, when not obvious.
    #[serde(default)]
    pub triage_state_reason: String,
    /// The possibly affected module path, when one was found.
    #[serde(default)]
    pub module: String,
    /// Cached raw CVE payload; only kept while the record needs an issue.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cve: Option<Cve>,
    /// Reference to the created issue (e.g. a tracker URL).
    #[serde(default)]
    pub issue_reference: String,
    /// When the issue was created.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue_created_at: Option<DateTime<Utc>>,
}

impl CveRecord {
    /// Create a record for a CVE at first sighting.
    pub fn new(cve: &Cve, path: impl Into<String>, blob_hash: impl Into<String>) -> Self {
        Self {
            id: cve.id().to_string(),
            blob_hash: blob_hash.into(),
            path: path.into(),
            commit_hash: String::new(),
            cve_state: cve.state().to_string(),
            triage_state: TriageState::NoActionNeeded,
            triage_state_reason: String::new(),
            module: String::new(),
            cve: None,
            issue_reference: String::new(),
            issue_created_at: None,
        }
    }
}

/// One update pass over a commit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommitUpdateRecord {
    /// Store-assigned identifier.
    pub id: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub commit_hash: String,
    pub commit_time: Option<DateTime<Utc>>,
    pub num_total: usize,
    pub num_processed: usize,
    pub num_added: usize,
    pub num_modified: usize,
    /// Terminal error message, empty on success.
    #[serde(default)]
    pub error: String,
}

/// Counters computed by a transaction body, accumulated by the caller only
/// after the transaction commits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxStats {
    pub added: usize,
    pub modified: usize,
}

/// Operations available inside a transaction.
pub trait StoreTransaction {
    /// Read the records whose IDs fall in `[start_id, end_id]`.
    fn get_cve_records(&mut self, start_id: &str, end_id: &str) -> Result<Vec<CveRecord>>;
    /// Create a new record; fails if the ID already exists.
    fn create_cve_record(&mut self, record: CveRecord) -> Result<()>;
    /// Overwrite an existing record; fails if the ID does not exist.
    fn set_cve_record(&mut self, record: CveRecord) -> Result<()>;
}

/// A transaction body. May be invoked more than once if the store retries.
pub type TransactionBody<'a> =
    &'a mut (dyn FnMut(&mut dyn StoreTransaction) -> Result<TxStats> + Send);

/// The document store used by the triage worker.
#[async_trait]
pub trait Store: Send + Sync {
    /// Create a commit update record, assigning its ID.
    async fn create_commit_update_record(&self, record: &mut CommitUpdateRecord) -> Result<()>;
    /// Overwrite an existing commit update record.
    async fn set_commit_update_record(&self, record: &CommitUpdateRecord) -> Result<()>;
    /// List commit update records, newest first. `limit = 0` means all.
    async fn list_commit_update_records(&self, limit: usize) -> Result<Vec<CommitUpdateRecord>>;
    /// The stored hash for a repo directory, if any.
    async fn get_directory_hash(&self, dir_path: &str) -> Result<Option<String>>;
    /// Replace the stored hash for a repo directory.
    async fn set_directory_hash(&self, dir_path: &str, hash: &str) -> Result<()>;
    /// List CVE records in the given triage state, ordered by ID.
    async fn list_cve_records_with_triage_state(
        &self,
        state: TriageState,
    ) -> Result<Vec<CveRecord>>;
    /// Run a transaction. Writes are applied atomically iff the body
    /// returns success.
    async fn run_transaction(&self, body: TransactionBody<'_>) -> Result<TxStats>;
}

/// In-memory store for tests and local runs.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<MemStoreInner>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MemStoreInner {
    cve_records: BTreeMap<String, CveRecord>,
    update_records: Vec<CommitUpdateRecord>,
    dir_hashes: BTreeMap<String, String>,
    next_update_id: u64,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All CVE records, keyed by ID. Test helper.
    pub fn cve_records(&self) -> BTreeMap<String, CveRecord> {
        self.inner.lock().unwrap().cve_records.clone()
    }

    fn snapshot(&self) -> MemStoreInner {
        self.inner.lock().unwrap().clone()
    }

    fn restore(state: MemStoreInner) -> Self {
        Self {
            inner: Mutex::new(state),
        }
    }
}

struct MemTransaction<'a> {
    records: &'a BTreeMap<String, CveRecord>,
    staged: Vec<(bool, CveRecord)>,
}

impl StoreTransaction for MemTransaction<'_> {
    fn get_cve_records(&mut self, start_id: &str, end_id: &str) -> Result<Vec<CveRecord>> {
        Ok(self
            .records
            .range(start_id.to_string()..=end_id.to_string())
            .map(|(_, r)| r.clone())
            .collect())
    }

    fn create_cve_record(&mut self, record: CveRecord) -> Result<()> {
        if self.records.contains_key(&record.id)
            || self.staged.iter().any(|(_, r)| r.id == record.id)
        {
            return Err(Error::store(format!("record {} already exists", record.id)));
        }
        self.staged.push((true, record));
        Ok(())
    }

    fn set_cve_record(&mut self, record: CveRecord) -> Result<()> {
        if !self.records.contains_key(&record.id)
            && !self.staged.iter().any(|(_, r)| r.id == record.id)
        {
            return Err(Error::store(format!("record {} does not exist", record.id)));
        }
        self.staged.push((false, record));
        Ok(())
    }
}

#[async_trait]
impl Store for MemStore {
    async fn create_commit_update_record(&self, record: &mut CommitUpdateRecord) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_update_id += 1;
        record.id = inner.next_update_id;
        inner.update_records.push(record.clone());
        Ok(())
    }

    async fn set_commit_update_record(&self, record: &CommitUpdateRecord) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.update_records.iter_mut().find(|r| r.id == record.id) {
            Some(slot) => {
                *slot = record.clone();
                Ok(())
            }
            None => Err(Error::store(format!(
                "commit update record {} does not exist",
                record.id
            ))),
        }
    }

    async fn list_commit_update_records(&self, limit: usize) -> Result<Vec<CommitUpdateRecord>> {
        let inner = self.inner.lock().unwrap();
        let mut records = inner.update_records.clone();
        records.sort_by(|a, b| b.id.cmp(&a.id));
        if limit > 0 {
            records.truncate(limit);
        }
        Ok(records)
    }

    async fn get_directory_hash(&self, dir_path: &str) -> Result<Option<String>> {
        Ok(self.inner.lock().unwrap().dir_hashes.get(dir_path).cloned())
    }

    async fn set_directory_hash(&self, dir_path: &str, hash: &str) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .dir_hashes
            .insert(dir_path.to_string(), hash.to_string());
        Ok(())
    }

    async fn list_cve_records_with_triage_state(
        &self,
        state: TriageState,
    ) -> Result<Vec<CveRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .cve_records
            .values()
            .filter(|r| r.triage_state == state)
            .cloned()
            .collect())
    }

    async fn run_transaction(&self, body: TransactionBody<'_>) -> Result<TxStats> {
        let mut inner = self.inner.lock().unwrap();
        let mut tx = MemTransaction {
            records: &inner.cve_records,
            staged: Vec::new(),
        };
        let stats = body(&mut tx)?;
        let staged = tx.staged;
        for (_, record) in staged {
            inner.cve_records.insert(record.id.clone(), record);
        }
        Ok(stats)
    }
}

/// A store persisted to a single JSON file. Suitable for command-line runs
/// against a local mirror; the production deployment binds a remote document
/// store behind the same trait.
pub struct FileStore {
    mem: MemStore,
    path: std::path::PathBuf,
}

impl FileStore {
    /// Open the store file, creating an empty store if it does not exist.
    pub fn open(path: impl Into<std::path::PathBuf>) -> Result<Self> {
        let path = path.into();
        let mem = match std::fs::read(&path) {
            Ok(bytes) => MemStore::restore(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => MemStore::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { mem, path })
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec(&self.mem.snapshot())?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[async_trait]
impl Store for FileStore {
    async fn create_commit_update_record(&self, record: &mut CommitUpdateRecord) -> Result<()> {
        self.mem.create_commit_update_record(record).await?;
        self.save()
    }

    async fn set_commit_update_record(&self, record: &CommitUpdateRecord) -> Result<()> {
        self.mem.set_commit_update_record(record).await?;
        self.save()
    }

    async fn list_commit_update_records(&self, limit: usize) -> Result<Vec<CommitUpdateRecord>> {
        self.mem.list_commit_update_records(limit).await
    }

    async fn get_directory_hash(&self, dir_path: &str) -> Result<Option<String>> {
        self.mem.get_directory_hash(dir_path).await
    }

    async fn set_directory_hash(&self, dir_path: &str, hash: &str) -> Result<()> {
        self.mem.set_directory_hash(dir_path, hash).await?;
        self.save()
    }

    async fn list_cve_records_with_triage_state(
        &self,
        state: TriageState,
    ) -> Result<Vec<CveRecord>> {
        self.mem.list_cve_records_with_triage_state(state).await
    }

    async fn run_transaction(&self, body: TransactionBody<'_>) -> Result<TxStats> {
        let stats = self.mem.run_transaction(body).await?;
        self.save()?;
        Ok(stats)
    }
}
