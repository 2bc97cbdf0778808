//! vulnreach-worker: mirror the CVE list into the triage store and file
//! review tickets.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use vulnreach::client::{Client, ClientOptions};
use vulnreach::repo::MemRepo;
use vulnreach::worker::store::{FileStore, Store, TriageState};
use vulnreach::worker::{self, GithubIssueClient};
use vulnreach::{logging, CancellationToken, PkgsiteClient, WorkerConfig};

#[derive(Parser)]
#[command(name = "vulnreach-worker")]
#[command(version)]
#[command(about = "Triage worker for the CVE list", long_about = None)]
#[command(after_help = "ENVIRONMENT:
    VULN_WORKER_ISSUE_REPO    owner/repo to create issues in
    VULN_WORKER_PKGSITE_URL   package metadata service base URL
    VULN_WORKER_STORE_PATH    store file for command-line runs
    VULN_WORKER_LOG_DIR       log to daily files in this directory
    GOVULNDB                  vulnerability DB URIs for the known-CVE set")]
struct Cli {
    /// Limit on number of things to list or issues to create (0 means
    /// unlimited)
    #[arg(long, default_value_t = 0)]
    limit: usize,

    /// Force an update to happen
    #[arg(long)]
    force: bool,

    /// Path to a local checkout of the CVE list repo
    #[arg(long = "local-cve-repo")]
    local_cve_repo: Option<PathBuf>,

    /// Path to a file containing the issue-tracker access token
    #[arg(long = "ghtokenfile")]
    ghtokenfile: Option<PathBuf>,

    /// File with the list of all known modules, bypassing metadata probes
    #[arg(long = "known-module-file")]
    known_module_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Perform an update operation for a commit
    Update { commit: String },
    /// Display info about update operations
    ListUpdates,
    /// Display info about CVE records in a triage state
    ListCves { triage_state: String },
    /// Create issues for CVEs that need them
    CreateIssues,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let mut config = WorkerConfig::from_env();
    let _guard = logging::init_logging(config.log_dir.as_deref());

    if let Some(token_file) = &cli.ghtokenfile {
        match std::fs::read_to_string(token_file) {
            Ok(token) => config.github_token = Some(token.trim().to_string()),
            Err(e) => {
                eprintln!("vulnreach-worker: reading {}: {e}", token_file.display());
                return ExitCode::from(1);
            }
        }
    }

    match run(cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("vulnreach-worker: {e:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli, config: WorkerConfig) -> Result<()> {
    let store = FileStore::open(&config.store_path)
        .with_context(|| format!("opening store {}", config.store_path.display()))?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            cancel.cancel();
        });
    }

    match &cli.command {
        Some(Command::Update { commit }) => update_command(&cli, &config, &store, commit, cancel).await,
        Some(Command::ListUpdates) => list_updates_command(&cli, &store).await,
        Some(Command::ListCves { triage_state }) => {
            list_cves_command(&cli, &store, triage_state).await
        }
        Some(Command::CreateIssues) => create_issues_command(&cli, &config, &store, &cancel).await,
        None => Err(anyhow!(
            "no subcommand; use one of: update COMMIT, list-updates, list-cves TRIAGE_STATE, create-issues"
        )),
    }
}

async fn update_command(
    cli: &Cli,
    config: &WorkerConfig,
    store: &FileStore,
    commit: &str,
    cancel: CancellationToken,
) -> Result<()> {
    let repo_path = cli.local_cve_repo.as_deref().ok_or_else(|| {
        anyhow!("update requires -local-cve-repo pointing at a CVE list checkout")
    })?;
    let repo = MemRepo::from_dir(repo_path)
        .with_context(|| format!("reading repo {}", repo_path.display()))?;

    let mut pkgsite = PkgsiteClient::new(&config.pkgsite_url);
    if let Some(file) = &cli.known_module_file {
        let modules = read_file_lines(file)?;
        println!("set {} known modules", modules.len());
        pkgsite = pkgsite.with_known_modules(modules.into_iter().collect());
    }

    let client = Client::new(&config.db_sources, ClientOptions::default())?;
    let known_ids: HashSet<String> = worker::read_vuln_db_ids(&client)
        .await
        .context("reading known IDs from the vulnerability DB")?;

    let result = worker::update_commit(
        &repo,
        commit,
        store,
        &pkgsite,
        &known_ids,
        cli.force,
        cancel,
    )
    .await;
    match result {
        Ok(record) => {
            println!(
                "processed {}/{} (added {}, modified {})",
                record.num_processed, record.num_total, record.num_added, record.num_modified
            );
            Ok(())
        }
        Err(e) if e.is_precondition() => Err(anyhow!("{e}; use -force to override")),
        Err(e) => Err(e.into()),
    }
}

const TIME_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

async fn list_updates_command(cli: &Cli, store: &FileStore) -> Result<()> {
    let records = store.list_commit_update_records(cli.limit).await?;
    println!("Start\tEnd\tCommit\tCVEs Processed");
    for r in records {
        let start = r
            .started_at
            .map(|t| t.format(TIME_FORMAT).to_string())
            .unwrap_or_default();
        let end = r
            .ended_at
            .map(|t| t.format(TIME_FORMAT).to_string())
            .unwrap_or_else(|| "unfinished".to_string());
        println!(
            "{start}\t{end}\t{}\t{}/{} (added {}, modified {})",
            r.commit_hash, r.num_processed, r.num_total, r.num_added, r.num_modified
        );
    }
    Ok(())
}

async fn list_cves_command(cli: &Cli, store: &FileStore, triage_state: &str) -> Result<()> {
    let state: TriageState = triage_state.parse()?;
    let records = store.list_cve_records_with_triage_state(state).await?;
    println!("ID\tCVEState\tCommit\tReason\tModule\tIssue\tIssue Created");
    for (i, r) in records.iter().enumerate() {
        if cli.limit > 0 && i >= cli.limit {
            break;
        }
        let created = r
            .issue_created_at
            .map(|t| t.format(TIME_FORMAT).to_string())
            .unwrap_or_default();
        println!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}",
            r.id, r.cve_state, r.commit_hash, r.triage_state_reason, r.module,
            r.issue_reference, created
        );
    }
    Ok(())
}

async fn create_issues_command(
    cli: &Cli,
    config: &WorkerConfig,
    store: &FileStore,
    cancel: &CancellationToken,
) -> Result<()> {
    let (repo_spec, token) = config.validate_for_issues()?;
    let (owner, repo) = worker::parse_github_repo(repo_spec)?;
    let client = GithubIssueClient::new(owner, repo, token);
    worker::create_issues(store, &client, cli.limit, cancel).await?;
    Ok(())
}

/// Read lines from a file, trimming whitespace and skipping blank lines and
/// lines beginning with '#'.
fn read_file_lines(path: &Path) -> Result<Vec<String>> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect())
}
