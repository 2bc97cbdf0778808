//! One update pass of the triage store against a repository commit.
//!
//! Reading an old record, deciding its next state, and writing it back must
//! be atomic, but processing a whole commit in one transaction would exceed
//! the backing store's write limit, so CVE files are processed in batches of
//! at most [`MAX_TRANSACTION_WRITES`], one transaction per batch. Directories
//! whose tree hash has not changed since the last successful pass are skipped
//! entirely.

use crate::cancel::CancellationToken;
use crate::cveschema::{Cve, STATE_PUBLIC};
use crate::error::Result;
use crate::modpath::PkgsiteClient;
use crate::repo::{group_files_by_directory, repo_cve_files, CommitInfo, CveRepo, RepoFile};
use crate::worker::store::{
    CommitUpdateRecord, CveRecord, Store, TriageState, TxStats, DIRECTORY_HASH_IN_PROGRESS,
};
use crate::worker::triage::{triage_cve, TriageResult};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

/// The backing store supports a bounded number of writes per transaction
/// (Firestore's limit is 500).
pub const MAX_TRANSACTION_WRITES: usize = 500;

/// Reason recorded on records whose CVE the databases already cover.
const REASON_KNOWN_ID: &str = "already in vuln DB";

/// Reason recorded on records whose CVE schema version is unsupported.
const REASON_UNSUPPORTED_VERSION: &str = "unsupported CVE version";

pub(crate) struct Updater<'a> {
    pub repo: &'a dyn CveRepo,
    pub commit: CommitInfo,
    pub store: &'a dyn Store,
    pub pkgsite: &'a PkgsiteClient,
    pub known_ids: &'a HashSet<String>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, Default)]
struct DirStats {
    processed: usize,
    added: usize,
    modified: usize,
}

/// How a changed file was classified, computed outside the write
/// transaction (classification depends only on blob content).
enum TriageOutcome {
    Classified(Option<TriageResult>),
    /// The CVE schema version is unsupported; refresh the record's metadata
    /// but leave its triage state alone.
    Unsupported,
}

struct FilePlan {
    file: RepoFile,
    cve: Cve,
    outcome: TriageOutcome,
}

impl Updater<'_> {
    /// Update the store to match the repo at the commit, triaging new or
    /// changed CVEs. The commit update record tracks progress and, on
    /// failure, the terminal error, so the next run can resume.
    pub async fn update(&self) -> Result<CommitUpdateRecord> {
        info!(commit = %self.commit.hash, "update starting");

        // It is cheaper to enumerate all files up front and compare with the
        // store in bulk than to process each file individually.
        let files = repo_cve_files(self.repo, &self.commit)?;
        let groups = group_files_by_directory(files)?;
        let num_total = groups.iter().map(Vec::len).sum();

        let mut record = CommitUpdateRecord {
            started_at: Some(Utc::now()),
            commit_hash: self.commit.hash.clone(),
            commit_time: Some(self.commit.time),
            num_total,
            ..Default::default()
        };
        self.store.create_commit_update_record(&mut record).await?;

        for dir_files in &groups {
            match self.update_directory(dir_files).await {
                Ok(stats) => {
                    record.num_processed += stats.processed;
                    record.num_added += stats.added;
                    record.num_modified += stats.modified;
                    self.store.set_commit_update_record(&record).await?;
                }
                Err(e) => {
                    record.error = e.to_string();
                    if let Err(e2) = self.store.set_commit_update_record(&record).await {
                        warn!(error = %e2, "could not record update failure");
                    }
                    return Err(e);
                }
            }
        }

        record.ended_at = Some(Utc::now());
        self.store.set_commit_update_record(&record).await?;
        info!(processed = record.num_processed, "update succeeded");
        Ok(record)
    }

    async fn update_directory(&self, dir_files: &[RepoFile]) -> Result<DirStats> {
        self.cancel.check()?;
        let dir_path = &dir_files[0].dir_path;
        let dir_hash = &dir_files[0].tree_hash;

        // A stored hash equal to the current tree hash means the directory
        // was fully processed in a previous pass.
        if self.store.get_directory_hash(dir_path).await?.as_deref() == Some(dir_hash.as_str()) {
            debug!(dir = %dir_path, "skipping directory, hashes match");
            return Ok(DirStats::default());
        }
        // Set the hash to something that can't match until we fully process
        // this directory. A crash mid-directory leaves the sentinel and the
        // directory is reprocessed next run.
        self.store
            .set_directory_hash(dir_path, DIRECTORY_HASH_IN_PROGRESS)
            .await?;

        let mut stats = DirStats::default();
        for batch in dir_files.chunks(MAX_TRANSACTION_WRITES) {
            self.cancel.check()?;
            let tx_stats = self.update_batch(batch).await?;
            stats.processed += batch.len();
            // Accumulated here rather than inside the transaction body,
            // which may be executed multiple times.
            stats.added += tx_stats.added;
            stats.modified += tx_stats.modified;
        }

        self.store.set_directory_hash(dir_path, dir_hash).await?;
        Ok(stats)
    }

    async fn update_batch(&self, batch: &[RepoFile]) -> Result<TxStats> {
        let start_id = batch[0].id().to_string();
        let end_id = batch[batch.len() - 1].id().to_string();
        debug!(start = %start_id, end = %end_id, "update transaction started");

        // Read the existing state to decide which files changed. The entries
        // are sorted, so a single ID range covers the batch.
        let mut existing = Vec::new();
        self.store
            .run_transaction(&mut |tx| {
                existing = tx.get_cve_records(&start_id, &end_id)?;
                Ok(TxStats::default())
            })
            .await?;
        let old_hashes: HashMap<&str, &str> = existing
            .iter()
            .map(|r| (r.id.as_str(), r.blob_hash.as_str()))
            .collect();

        // Classify changed files before the write transaction; triage does
        // rate-limited HTTP and the outcome depends only on blob content.
        let mut plans = Vec::new();
        for file in batch {
            let id = file.id();
            if old_hashes.get(id) == Some(&file.blob_hash.as_str()) {
                continue;
            }
            let bytes = self.repo.blob(&file.blob_hash)?;
            let cve: Cve = match serde_json::from_slice(&bytes) {
                Ok(cve) => cve,
                Err(e) => {
                    warn!(path = %file.path(), error = %e, "skipping malformed CVE file");
                    continue;
                }
            };
            let outcome = if cve.state() == STATE_PUBLIC && !self.known_ids.contains(id) {
                match triage_cve(&cve, self.pkgsite).await {
                    Ok(result) => TriageOutcome::Classified(result),
                    Err(e) if e.is_cve_version_unsupported() => {
                        warn!(path = %file.path(), error = %e, "cannot triage CVE");
                        TriageOutcome::Unsupported
                    }
                    Err(e) => return Err(e),
                }
            } else {
                TriageOutcome::Classified(None)
            };
            plans.push(FilePlan {
                file: file.clone(),
                cve,
                outcome,
            });
        }
        if plans.is_empty() {
            return Ok(TxStats::default());
        }

        let stats = self
            .store
            .run_transaction(&mut |tx| {
                let mut stats = TxStats::default();
                let current = tx.get_cve_records(&start_id, &end_id)?;
                let by_id: HashMap<String, CveRecord> =
                    current.into_iter().map(|r| (r.id.clone(), r)).collect();
                for plan in &plans {
                    let old = by_id.get(plan.file.id());
                    if old.map(|r| r.blob_hash.as_str()) == Some(plan.file.blob_hash.as_str()) {
                        continue;
                    }
                    let (added, record) = self.next_record(old, plan);
                    if added {
                        tx.create_cve_record(record)?;
                        stats.added += 1;
                    } else {
                        tx.set_cve_record(record)?;
                        stats.modified += 1;
                    }
                }
                Ok(stats)
            })
            .await?;
        debug!(
            start = %start_id,
            end = %end_id,
            adds = stats.added,
            mods = stats.modified,
            "update transaction finished"
        );
        Ok(stats)
    }

    /// Decide the next store state for a single changed CVE. Pure given the
    /// old record and the precomputed classification.
    fn next_record(&self, old: Option<&CveRecord>, plan: &FilePlan) -> (bool, CveRecord) {
        let file = &plan.file;
        let Some(old) = old else {
            let mut record = CveRecord::new(&plan.cve, file.path(), &file.blob_hash);
            record.commit_hash = self.commit.hash.clone();
            match &plan.outcome {
                TriageOutcome::Classified(Some(result)) => {
                    record.triage_state = TriageState::NeedsIssue;
                    record.module = result.module_path.clone();
                    record.cve = Some(plan.cve.clone());
                }
                TriageOutcome::Classified(None) => {
                    record.triage_state = TriageState::NoActionNeeded;
                    if self.known_ids.contains(file.id()) {
                        record.triage_state_reason = REASON_KNOWN_ID.to_string();
                    }
                }
                TriageOutcome::Unsupported => {
                    record.triage_state = TriageState::NoActionNeeded;
                    record.triage_state_reason = REASON_UNSUPPORTED_VERSION.to_string();
                }
            }
            return (true, record);
        };

        let mut record = old.clone();
        record.path = file.path();
        record.blob_hash = file.blob_hash.clone();
        record.cve_state = plan.cve.state().to_string();
        record.commit_hash = self.commit.hash.clone();

        let result = match &plan.outcome {
            TriageOutcome::Classified(result) => result,
            // The record stays at its prior triage state; only the changed
            // metadata above is refreshed.
            TriageOutcome::Unsupported => return (false, record),
        };
        match old.triage_state {
            TriageState::NoActionNeeded => {
                if let Some(result) = result {
                    // Didn't need an issue before, does now.
                    record.triage_state = TriageState::NeedsIssue;
                    record.module = result.module_path.clone();
                    record.cve = Some(plan.cve.clone());
                }
            }
            TriageState::NeedsIssue => {
                if result.is_none() {
                    // Needed an issue, no longer does.
                    record.triage_state = TriageState::NoActionNeeded;
                    record.module.clear();
                    record.cve = None;
                }
            }
            TriageState::IssueCreated | TriageState::UpdatedSinceIssueCreation => {
                // An issue was filed, so a person should revisit this CVE.
                record.triage_state = TriageState::UpdatedSinceIssueCreation;
                let module_path = result.as_ref().map(|r| r.module_path.as_str()).unwrap_or("");
                record.triage_state_reason =
                    format!("CVE changed; affected module = {module_path:?}");
            }
        }
        (false, record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::store::MemStore;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const GOLANG_MOD: &str = "golang.org/x/mod";

    fn cve_json(id: &str, state: &str, ref_url: &str) -> String {
        let references = if ref_url.is_empty() {
            String::new()
        } else {
            format!(r#""references": {{"reference_data": [{{"url": "{ref_url}"}}]}},"#)
        };
        format!(
            r#"{{
                "data_type": "CVE",
                "data_format": "MITRE",
                "data_version": "4.0",
                "CVE_data_meta": {{"ID": "{id}", "STATE": "{state}"}},
                {references}
                "description": {{"description_data": [{{"lang": "eng", "value": "desc {id}"}}]}}
            }}"#
        )
    }

    fn basic_repo() -> crate::repo::MemRepo {
        let files: BTreeMap<String, Vec<u8>> = [
            (
                "2021/0xxx/CVE-2021-0001.json",
                cve_json("CVE-2021-0001", "PUBLIC", "https://golang.org/x/mod"),
            ),
            (
                "2021/0xxx/CVE-2021-0010.json",
                cve_json("CVE-2021-0010", "RESERVED", ""),
            ),
            (
                "2021/1xxx/CVE-2021-1384.json",
                cve_json("CVE-2021-1384", "PUBLIC", "https://example.com/not/a/module"),
            ),
            (
                "2020/9xxx/CVE-2020-9283.json",
                cve_json("CVE-2020-9283", "PUBLIC", "https://golang.org/x/crypto"),
            ),
        ]
        .into_iter()
        .map(|(p, c)| (p.to_string(), c.into_bytes()))
        .collect();
        crate::repo::MemRepo::new(files, Utc::now())
    }

    fn pkgsite() -> PkgsiteClient {
        PkgsiteClient::new("http://pkgsite.invalid")
            .with_known_modules([GOLANG_MOD.to_string()].into())
    }

    fn known_ids() -> HashSet<String> {
        ["CVE-2020-9283".to_string()].into()
    }

    async fn run_update(repo: &crate::repo::MemRepo, store: &dyn Store) -> CommitUpdateRecord {
        let pkgsite = pkgsite();
        let known = known_ids();
        let updater = Updater {
            repo,
            commit: repo.head_commit().clone(),
            store,
            pkgsite: &pkgsite,
            known_ids: &known,
            cancel: CancellationToken::new(),
        };
        updater.update().await.unwrap()
    }

    async fn seed_records(store: &MemStore, records: Vec<CveRecord>) {
        store
            .run_transaction(&mut |tx| {
                for r in records.clone() {
                    tx.create_cve_record(r)?;
                }
                Ok(TxStats::default())
            })
            .await
            .unwrap();
    }

    /// The records the basic repo produces when added to an empty store.
    fn expected_records(repo: &crate::repo::MemRepo) -> BTreeMap<String, CveRecord> {
        let files = repo_cve_files(repo, repo.head_commit()).unwrap();
        let commit_hash = repo.head_commit().hash.clone();
        let mut want = BTreeMap::new();
        for file in files {
            let cve: Cve = serde_json::from_slice(&repo.blob(&file.blob_hash).unwrap()).unwrap();
            let mut r = CveRecord::new(&cve, file.path(), &file.blob_hash);
            r.commit_hash = commit_hash.clone();
            match file.id() {
                "CVE-2021-0001" => {
                    r.triage_state = TriageState::NeedsIssue;
                    r.module = GOLANG_MOD.to_string();
                    r.cve = Some(cve);
                }
                "CVE-2020-9283" => {
                    r.triage_state_reason = REASON_KNOWN_ID.to_string();
                }
                _ => {}
            }
            want.insert(r.id.clone(), r);
        }
        want
    }

    #[tokio::test]
    async fn update_of_empty_store_creates_records() {
        let repo = basic_repo();
        let store = MemStore::new();
        let record = run_update(&repo, &store).await;

        assert_eq!(record.num_total, 4);
        assert_eq!(record.num_processed, 4);
        assert_eq!(record.num_added, 4);
        assert_eq!(record.num_modified, 0);
        assert!(record.ended_at.is_some());
        assert!(record.error.is_empty());

        assert_eq!(store.cve_records(), expected_records(&repo));
    }

    #[tokio::test]
    async fn update_with_no_changes_is_a_noop() {
        let repo = basic_repo();
        let store = MemStore::new();
        run_update(&repo, &store).await;
        let record = run_update(&repo, &store).await;
        assert_eq!(record.num_added, 0);
        assert_eq!(record.num_modified, 0);
        assert_eq!(store.cve_records(), expected_records(&repo));
    }

    #[tokio::test]
    async fn pre_issue_reclassification() {
        let repo = basic_repo();
        let want = expected_records(&repo);
        let store = MemStore::new();
        // Stale blob hashes force every record to be reprocessed.
        let stale = |id: &str, state: TriageState| {
            let mut r = want[id].clone();
            r.blob_hash.push('x');
            r.commit_hash = "?".to_string();
            r.triage_state = state;
            r
        };
        seed_records(
            &store,
            vec![
                // NoActionNeeded -> NeedsIssue
                stale("CVE-2021-0001", TriageState::NoActionNeeded),
                // NeedsIssue -> NoActionNeeded (the CVE is RESERVED)
                {
                    let mut r = stale("CVE-2021-0010", TriageState::NeedsIssue);
                    r.module = "something".to_string();
                    r
                },
                // Stays NoActionNeeded, other fields refreshed.
                stale("CVE-2021-1384", TriageState::NoActionNeeded),
            ],
        )
        .await;

        run_update(&repo, &store).await;
        assert_eq!(store.cve_records(), want);
    }

    #[tokio::test]
    async fn post_issue_changes_move_to_updated() {
        let repo = basic_repo();
        let want = expected_records(&repo);
        let store = MemStore::new();
        let stale = |id: &str, state: TriageState| {
            let mut r = want[id].clone();
            r.blob_hash.push('x');
            r.commit_hash = "?".to_string();
            r.triage_state = state;
            r
        };
        seed_records(
            &store,
            vec![
                stale("CVE-2021-0001", TriageState::IssueCreated),
                stale("CVE-2021-0010", TriageState::UpdatedSinceIssueCreation),
            ],
        )
        .await;

        run_update(&repo, &store).await;
        let got = store.cve_records();

        let r1 = &got["CVE-2021-0001"];
        assert_eq!(r1.triage_state, TriageState::UpdatedSinceIssueCreation);
        assert_eq!(
            r1.triage_state_reason,
            format!("CVE changed; affected module = {GOLANG_MOD:?}")
        );
        let r10 = &got["CVE-2021-0010"];
        assert_eq!(r10.triage_state, TriageState::UpdatedSinceIssueCreation);
        assert_eq!(r10.triage_state_reason, "CVE changed; affected module = \"\"");
    }

    /// Store wrapper counting write transactions, to observe directory skips.
    struct CountingStore {
        inner: MemStore,
        transactions: AtomicUsize,
    }

    #[async_trait]
    impl Store for CountingStore {
        async fn create_commit_update_record(
            &self,
            record: &mut CommitUpdateRecord,
        ) -> Result<()> {
            self.inner.create_commit_update_record(record).await
        }
        async fn set_commit_update_record(&self, record: &CommitUpdateRecord) -> Result<()> {
            self.inner.set_commit_update_record(record).await
        }
        async fn list_commit_update_records(
            &self,
            limit: usize,
        ) -> Result<Vec<CommitUpdateRecord>> {
            self.inner.list_commit_update_records(limit).await
        }
        async fn get_directory_hash(&self, dir_path: &str) -> Result<Option<String>> {
            self.inner.get_directory_hash(dir_path).await
        }
        async fn set_directory_hash(&self, dir_path: &str, hash: &str) -> Result<()> {
            self.inner.set_directory_hash(dir_path, hash).await
        }
        async fn list_cve_records_with_triage_state(
            &self,
            state: TriageState,
        ) -> Result<Vec<CveRecord>> {
            self.inner.list_cve_records_with_triage_state(state).await
        }
        async fn run_transaction(
            &self,
            body: crate::worker::store::TransactionBody<'_>,
        ) -> Result<TxStats> {
            self.transactions.fetch_add(1, Ordering::SeqCst);
            self.inner.run_transaction(body).await
        }
    }

    #[tokio::test]
    async fn unchanged_directories_run_zero_transactions() {
        let repo = basic_repo();
        let store = CountingStore {
            inner: MemStore::new(),
            transactions: AtomicUsize::new(0),
        };
        run_update(&repo, &store).await;
        assert!(store.transactions.load(Ordering::SeqCst) > 0);
        store.transactions.store(0, Ordering::SeqCst);

        run_update(&repo, &store).await;
        assert_eq!(store.transactions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancellation_aborts_and_records_the_error() {
        let repo = basic_repo();
        let store = MemStore::new();
        let pkgsite = pkgsite();
        let known = known_ids();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let updater = Updater {
            repo: &repo,
            commit: repo.head_commit().clone(),
            store: &store,
            pkgsite: &pkgsite,
            known_ids: &known,
            cancel,
        };
        let err = updater.update().await.unwrap_err();
        assert!(matches!(err, crate::error::Error::Cancelled));
        let records = store.list_commit_update_records(1).await.unwrap();
        assert_eq!(records[0].error, "operation cancelled");
        assert!(store.cve_records().is_empty());
    }

    #[tokio::test]
    async fn malformed_cve_files_are_skipped_not_fatal() {
        let mut files: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        files.insert(
            "2021/0xxx/CVE-2021-0001.json".to_string(),
            b"{not json".to_vec(),
        );
        files.insert(
            "2021/0xxx/CVE-2021-0002.json".to_string(),
            cve_json("CVE-2021-0002", "PUBLIC", "https://golang.org/x/mod").into_bytes(),
        );
        let repo = crate::repo::MemRepo::new(files, Utc::now());
        let store = MemStore::new();
        let record = run_update(&repo, &store).await;
        assert!(record.error.is_empty());
        let got = store.cve_records();
        assert_eq!(got.len(), 1);
        assert_eq!(got["CVE-2021-0002"].triage_state, TriageState::NeedsIssue);
    }

    #[tokio::test]
    async fn unsupported_version_keeps_prior_state() {
        let raw = r#"{
            "data_version": "5.0",
            "CVE_data_meta": {"ID": "CVE-2021-0003", "STATE": "PUBLIC"}
        }"#;
        let files: BTreeMap<String, Vec<u8>> = [(
            "2021/0xxx/CVE-2021-0003.json".to_string(),
            raw.as_bytes().to_vec(),
        )]
        .into();
        let repo = crate::repo::MemRepo::new(files, Utc::now());
        let store = MemStore::new();
        let record = run_update(&repo, &store).await;
        assert!(record.error.is_empty());
        let got = store.cve_records();
        assert_eq!(got["CVE-2021-0003"].triage_state, TriageState::NoActionNeeded);
        assert_eq!(
            got["CVE-2021-0003"].triage_state_reason,
            REASON_UNSUPPORTED_VERSION
        );
    }
}
