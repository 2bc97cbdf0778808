//! # vulnreach
//!
//! A vulnerability-aware program analysis library with two cores that share
//! a data model and pipeline shape:
//!
//! - **Reachability**: given a build (a package graph and call graph from the
//!   compiler front-end, or a compiled binary's embedded metadata) and a
//!   vulnerability database, report which known-vulnerable symbols the
//!   program actually reaches, with a representative call stack for each.
//! - **Triage**: continuously mirror the CVE list repository into a document
//!   store, classify each CVE as affecting this ecosystem or not by probing
//!   a package metadata service, and file review tickets exactly once per
//!   CVE.
//!
//! Shared between the two: the OSV record model ([`osv`]), semver range
//! containment ([`semver`]), and module-path extraction from free-form URLs
//! ([`modpath`]).
//!
//! ## Scanning
//!
//! ```rust,ignore
//! use vulnreach::{client::{Client, ClientOptions}, scan};
//!
//! let client = Client::new(&dbs, ClientOptions::default())?;
//! let findings = scan::scan_source(&client, &packages, &call_graph).await?;
//! let result = scan::result::assemble(config, findings);
//! ```
//!
//! ## Triage
//!
//! ```rust,ignore
//! use vulnreach::{worker, modpath::PkgsiteClient, cancel::CancellationToken};
//!
//! let pkgsite = PkgsiteClient::new(pkgsite_url);
//! worker::update_commit(&repo, commit, &store, &pkgsite, &known, force, token).await?;
//! worker::create_issues(&store, &issue_client, limit, &token).await?;
//! ```

pub mod cancel;
pub mod client;
pub mod config;
pub mod cveschema;
pub mod error;
pub mod logging;
pub mod modpath;
pub mod osv;
pub mod repo;
pub mod report;
pub mod scan;
pub mod semver;
pub mod worker;

// Re-export main types
pub use cancel::CancellationToken;
pub use client::{Client, ClientOptions, DEFAULT_DB_HOST};
pub use config::{ScanConfig, WorkerConfig};
pub use error::{Error, Result};
pub use modpath::{PkgsiteClient, PKGSITE_URL, STDLIB_MODULE_PATH};
