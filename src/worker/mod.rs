//! The triage worker: mirror the CVE list repository into the store,
//! classify each CVE, and file review tickets exactly once per CVE.
//!
//! This module has the public API of the worker, used by the worker binary.

pub mod issue;
pub mod store;
pub mod triage;
mod update;

pub use issue::{
    create_issues, parse_github_repo, GithubIssueClient, Issue, IssueClient,
};
pub use triage::{triage_cve, TriageResult};
pub use update::MAX_TRANSACTION_WRITES;

use crate::cancel::CancellationToken;
use crate::client::Client;
use crate::error::{Error, Result};
use crate::modpath::PkgsiteClient;
use crate::repo::{CommitInfo, CveRepo};
use chrono::Utc;
use std::collections::HashSet;
use store::{CommitUpdateRecord, Store};
use update::Updater;

/// Perform an update on the store using the given commit.
///
/// Unless `force` is true, the update is checked against the latest commit
/// update record first; a failed precondition surfaces as
/// [`Error::Precondition`], which the caller may bypass with `-force`.
pub async fn update_commit(
    repo: &dyn CveRepo,
    commit_hash: &str,
    store: &dyn Store,
    pkgsite: &PkgsiteClient,
    known_ids: &HashSet<String>,
    force: bool,
    cancel: CancellationToken,
) -> Result<CommitUpdateRecord> {
    let commit = repo.commit(commit_hash)?;
    if !force {
        check_update(&commit, store).await?;
    }
    let updater = Updater {
        repo,
        commit,
        store,
        pkgsite,
        known_ids,
        cancel,
    };
    updater.update().await
}

/// Sanity checks for a potential update: no update may be in progress, the
/// previous update must have succeeded, and commit time must be
/// monotonically non-decreasing across runs.
pub async fn check_update(commit: &CommitInfo, store: &dyn Store) -> Result<()> {
    let latest = store.list_commit_update_records(1).await?;
    let Some(last) = latest.first() else {
        // No updates yet.
        return Ok(());
    };
    if last.ended_at.is_none() {
        let ago = last
            .started_at
            .map(|s| (Utc::now() - s).num_seconds())
            .unwrap_or_default();
        return Err(Error::Precondition(format!(
            "latest update started {ago}s ago and has not finished"
        )));
    }
    if !last.error.is_empty() {
        return Err(Error::Precondition(format!(
            "latest update finished with error {:?}",
            last.error
        )));
    }
    if let Some(last_time) = last.commit_time {
        if commit.time < last_time {
            return Err(Error::Precondition(format!(
                "commit {} time {} is before latest update commit {} time {}",
                commit.hash,
                commit.time.to_rfc3339(),
                last.commit_hash,
                last_time.to_rfc3339()
            )));
        }
    }
    Ok(())
}

/// The set of CVE IDs already covered by the vulnerability databases.
/// CVEs in this set short-circuit triage to "no action needed".
pub async fn read_vuln_db_ids(client: &Client) -> Result<HashSet<String>> {
    client.known_cve_ids().await
}
