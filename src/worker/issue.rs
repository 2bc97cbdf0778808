//! Review ticket creation for CVEs that need one.
//!
//! Sweeps store records in the `NeedsIssue` state and files one ticket per
//! record. A crash between ticket submission and the store update may
//! duplicate tickets on restart; that is accepted, and nothing worse happens
//! (no CVE is missed).

use crate::cancel::CancellationToken;
use crate::error::{Error, Result};
use crate::worker::store::{Store, TriageState, TxStats};
use async_trait::async_trait;
use chrono::Utc;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info};

/// The upstream CVE list repository, linked from ticket bodies.
const CVE_LIST_REPO_URL: &str = "https://github.com/CVEProject/cvelist";

/// A ticket to file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Issue {
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
}

/// Client for the external issue tracker.
#[async_trait]
pub trait IssueClient: Send + Sync {
    /// File an issue and return its number.
    async fn create_issue(&self, issue: &Issue) -> Result<u64>;
    /// A stable reference string for an issue number.
    fn reference(&self, number: u64) -> String;
    /// Where issues go, for logging.
    fn destination(&self) -> String;
}

/// Issue client backed by the GitHub REST API.
pub struct GithubIssueClient {
    owner: String,
    repo: String,
    token: String,
    client: ClientWithMiddleware,
}

/// Parse an `owner/repo` spec.
pub fn parse_github_repo(spec: &str) -> Result<(String, String)> {
    match spec.split_once('/') {
        Some((owner, repo)) if !owner.is_empty() && !repo.is_empty() && !repo.contains('/') => {
            Ok((owner.to_string(), repo.to_string()))
        }
        _ => Err(Error::usage(format!(
            "issue repo must be of the form owner/repo, got {spec:?}"
        ))),
    }
}

impl GithubIssueClient {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>, token: impl Into<String>) -> Self {
        let base_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .user_agent("vulnreach-worker/0.1")
            .build()
            .expect("failed to build HTTP client");
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
        let client = ClientBuilder::new(base_client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();
        Self {
            owner: owner.into(),
            repo: repo.into(),
            token: token.into(),
            client,
        }
    }
}

#[derive(Deserialize)]
struct CreatedIssue {
    number: u64,
}

#[async_trait]
impl IssueClient for GithubIssueClient {
    async fn create_issue(&self, issue: &Issue) -> Result<u64> {
        let url = format!(
            "https://api.github.com/repos/{}/{}/issues",
            self.owner, self.repo
        );
        let resp = self
            .client
            .post(&url)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .header(
                reqwest::header::AUTHORIZATION,
                format!("token {}", self.token),
            )
            .json(issue)
            .send()
            .await?;
        if resp.status() != reqwest::StatusCode::CREATED {
            return Err(Error::Issue(format!(
                "creating issue in {}/{}: HTTP {}",
                self.owner,
                self.repo,
                resp.status()
            )));
        }
        let created: CreatedIssue = resp.json().await?;
        Ok(created.number)
    }

    fn reference(&self, number: u64) -> String {
        format!(
            "https://github.com/{}/{}/issues/{}",
            self.owner, self.repo, number
        )
    }

    fn destination(&self) -> String {
        format!("https://github.com/{}/{}", self.owner, self.repo)
    }
}

/// Create issues for CVE records in the `NeedsIssue` state, up to `limit`
/// (0 means unlimited).
pub async fn create_issues(
    store: &dyn Store,
    client: &dyn IssueClient,
    limit: usize,
    cancel: &CancellationToken,
) -> Result<()> {
    info!(destination = %client.destination(), "create_issues starting");
    let needs_issue = store
        .list_cve_records_with_triage_state(TriageState::NeedsIssue)
        .await?;
    let mut num_created = 0usize;
    for record in needs_issue {
        if limit > 0 && num_created >= limit {
            break;
        }
        cancel.check()?;
        if !record.issue_reference.is_empty() || record.issue_created_at.is_some() {
            error!(
                id = %record.id,
                reference = %record.issue_reference,
                "triage state is NeedsIssue but issue fields are set; skipping"
            );
            continue;
        }

        let issue = Issue {
            title: format!(
                "x/vulndb: potential Go vulnerability found from CVE List: {}",
                record.id
            ),
            body: new_body(&record)?,
            labels: vec!["Needs Triage".to_string()],
        };
        let number = client
            .create_issue(&issue)
            .await
            .map_err(|e| Error::Issue(format!("creating issue for {}: {e}", record.id)))?;
        // A crash here files a ticket without recording that fact, which can
        // duplicate tickets on restart but never loses a CVE.
        let reference = client.reference(number);
        info!(id = %record.id, reference = %reference, "created issue");

        let id = record.id.clone();
        store
            .run_transaction(&mut |tx| {
                let mut records = tx.get_cve_records(&id, &id)?;
                let Some(mut fresh) = records.pop() else {
                    return Err(Error::store(format!("record {id} disappeared")));
                };
                fresh.triage_state = TriageState::IssueCreated;
                fresh.issue_reference = reference.clone();
                fresh.issue_created_at = Some(Utc::now());
                tx.set_cve_record(fresh)?;
                Ok(TxStats::default())
            })
            .await?;
        num_created += 1;
    }
    info!(limit, num_created, "create_issues done");
    Ok(())
}

/// Render the ticket body: a heading linking the CVE source file, followed
/// by the report skeleton a reviewer fills in.
fn new_body(record: &crate::worker::store::CveRecord) -> Result<String> {
    let report = crate::report::Report::from_cve_record(record);
    Ok(format!(
        "One or more of the reference URLs in [{id}]({repo}/tree/{commit}/{path}) refers to a Go module.\n\n{skeleton}",
        id = record.id,
        repo = CVE_LIST_REPO_URL,
        commit = record.commit_hash,
        path = record.path,
        skeleton = report.to_yaml()?,
    ))
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::sync::Mutex;

    /// In-memory issue client recording created issues.
    #[derive(Default)]
    pub struct FakeIssueClient {
        pub created: Mutex<Vec<Issue>>,
    }

    #[async_trait]
    impl IssueClient for FakeIssueClient {
        async fn create_issue(&self, issue: &Issue) -> Result<u64> {
            let mut created = self.created.lock().unwrap();
            created.push(issue.clone());
            Ok(created.len() as u64)
        }

        fn reference(&self, number: u64) -> String {
            format!("inMemory: #{number}")
        }

        fn destination(&self) -> String {
            "in memory".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeIssueClient;
    use super::*;
    use crate::cveschema::{Cve, Description, LangString, Metadata};
    use crate::worker::store::{CveRecord, MemStore};

    fn needs_issue_record(id: &str, module: &str) -> CveRecord {
        CveRecord {
            id: id.to_string(),
            blob_hash: "bh".into(),
            path: format!("2021/0xxx/{id}.json"),
            commit_hash: "abc123".into(),
            cve_state: "PUBLIC".into(),
            triage_state: TriageState::NeedsIssue,
            triage_state_reason: String::new(),
            module: module.to_string(),
            cve: Some(Cve {
                data_version: "4.0".into(),
                metadata: Metadata {
                    id: id.to_string(),
                    state: "PUBLIC".into(),
                    ..Default::default()
                },
                description: Description {
                    description_data: vec![LangString {
                        lang: "eng".into(),
                        value: format!("description of {id}"),
                    }],
                },
                ..Default::default()
            }),
            issue_reference: String::new(),
            issue_created_at: None,
        }
    }

    async fn seed(store: &MemStore, records: Vec<CveRecord>) {
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

    #[tokio::test]
    async fn files_one_ticket_per_record() {
        let store = MemStore::new();
        seed(
            &store,
            vec![
                needs_issue_record("CVE-2021-0001", "golang.org/x/mod"),
                needs_issue_record("CVE-2021-0002", "example.com/m"),
            ],
        )
        .await;
        let client = FakeIssueClient::default();
        create_issues(&store, &client, 0, &CancellationToken::new())
            .await
            .unwrap();

        let created = client.created.lock().unwrap();
        assert_eq!(created.len(), 2);
        assert!(created[0].title.contains("CVE-2021-0001"));
        assert!(created[0].body.contains("module: golang.org/x/mod"));
        assert!(created[0].body.contains("description of CVE-2021-0001"));
        assert_eq!(created[0].labels, vec!["Needs Triage"]);

        for record in store.cve_records().values() {
            assert_eq!(record.triage_state, TriageState::IssueCreated);
            assert!(!record.issue_reference.is_empty());
            assert!(record.issue_created_at.is_some());
        }
    }

    #[tokio::test]
    async fn limit_bounds_the_sweep() {
        let store = MemStore::new();
        seed(
            &store,
            vec![
                needs_issue_record("CVE-2021-0001", "a.example/m"),
                needs_issue_record("CVE-2021-0002", "b.example/m"),
                needs_issue_record("CVE-2021-0003", "c.example/m"),
            ],
        )
        .await;
        let client = FakeIssueClient::default();
        create_issues(&store, &client, 2, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(client.created.lock().unwrap().len(), 2);
        let remaining = store
            .list_cve_records_with_triage_state(TriageState::NeedsIssue)
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
    }

    #[tokio::test]
    async fn inconsistent_records_are_skipped() {
        let store = MemStore::new();
        let mut bad = needs_issue_record("CVE-2021-0001", "a.example/m");
        bad.issue_reference = "inMemory: #99".into();
        seed(&store, vec![bad]).await;
        let client = FakeIssueClient::default();
        create_issues(&store, &client, 0, &CancellationToken::new())
            .await
            .unwrap();
        assert!(client.created.lock().unwrap().is_empty());
        // The record keeps its state for a human to reconcile.
        let records = store.cve_records();
        assert_eq!(
            records["CVE-2021-0001"].triage_state,
            TriageState::NeedsIssue
        );
    }

    #[test]
    fn github_repo_spec_parsing() {
        assert_eq!(
            parse_github_repo("golang/vulndb").unwrap(),
            ("golang".to_string(), "vulndb".to_string())
        );
        assert!(parse_github_repo("nope").is_err());
        assert!(parse_github_repo("a/b/c").is_err());
    }
}
