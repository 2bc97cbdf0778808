//! Scanning: which known vulnerabilities does this build actually reach?
//!
//! Source mode walks the supplied call graph and computes representative
//! stacks; binary mode has no call graph and degrades to symbol presence.

pub mod binary;
pub mod matcher;
pub mod packages;
pub mod reachability;
pub mod result;

use crate::client::Client;
use crate::error::Result;
use crate::scan::binary::read_binary_metadata;
use crate::scan::matcher::{fetch_vulnerabilities, vulnerable_symbols, VulnSymbols};
use crate::scan::packages::PackageGraph;
use crate::scan::reachability::{
    summarize_call_stack, update_init_positions, CallGraph, CallGraphData, CallStack,
    MAX_SUMMARIES_PER_GROUP,
};
use crate::scan::result::{CallStackInfo, Finding};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::info;

/// The interchange document the compiler front-end and IR builder emit for
/// one build: the typed package graph plus the interprocedural call graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildBundle {
    pub packages: PackageGraph,
    #[serde(default)]
    pub call_graph: CallGraphData,
}

impl BuildBundle {
    pub fn load(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Scan a source build: the package graph and call graph come from the
/// external front-end and IR builder.
pub async fn scan_source(
    client: &Client,
    packages: &PackageGraph,
    graph: &CallGraph,
) -> Result<Vec<Finding>> {
    packages.validate()?;
    let modules = packages.module_versions();
    info!(modules = modules.len(), "fetching vulnerabilities");
    let mod_vulns = fetch_vulnerabilities(client, &modules).await?;

    let top_packages: HashSet<String> = packages.top_packages();
    let mut findings = Vec::new();
    for mv in &mod_vulns {
        for entry in &mv.entries {
            for candidate in vulnerable_symbols(entry, &mv.module) {
                let stacks = candidate_stacks(graph, &candidate, packages);
                let infos = stack_infos(stacks, &top_packages, &candidate.package);
                findings.push(Finding {
                    entry: entry.clone(),
                    module: mv.module.clone(),
                    package: candidate.package,
                    call_stacks: infos,
                });
            }
        }
    }
    Ok(findings)
}

/// Scan a compiled artifact via its embedded metadata.
pub async fn scan_binary(client: &Client, data: &[u8]) -> Result<Vec<Finding>> {
    let meta = read_binary_metadata(data)?;
    let modules = meta.module_versions();
    info!(modules = modules.len(), "fetching vulnerabilities");
    let mod_vulns = fetch_vulnerabilities(client, &modules).await?;
    let referenced = meta.symbols_by_package();

    let mut findings = Vec::new();
    for mv in &mod_vulns {
        for entry in &mv.entries {
            for candidate in vulnerable_symbols(entry, &mv.module) {
                // The package is part of the binary only if some of its
                // symbols are referenced.
                let Some(present) = referenced.get(&candidate.package) else {
                    continue;
                };
                let mut matched: Vec<String> = if candidate.symbols.is_empty() {
                    present.iter().cloned().collect()
                } else {
                    candidate
                        .symbols
                        .iter()
                        .filter(|s| present.contains(*s))
                        .cloned()
                        .collect()
                };
                if matched.is_empty() {
                    continue;
                }
                matched.sort();
                findings.push(Finding {
                    entry: entry.clone(),
                    module: mv.module.clone(),
                    package: candidate.package,
                    // No call graph in binary mode: a degenerate stack
                    // carrying only the symbol.
                    call_stacks: matched
                        .into_iter()
                        .map(|symbol| CallStackInfo {
                            symbol,
                            summary: None,
                            frames: Vec::new(),
                        })
                        .collect(),
                });
            }
        }
    }
    Ok(findings)
}

/// Representative stacks for one vulnerable-symbol candidate, with init
/// positions patched.
fn candidate_stacks(
    graph: &CallGraph,
    candidate: &VulnSymbols,
    packages: &PackageGraph,
) -> Vec<CallStack> {
    let symbol_map: HashMap<String, HashSet<String>> = [(
        candidate.package.clone(),
        candidate.symbols.iter().cloned().collect(),
    )]
    .into();
    let mut stacks = Vec::new();
    for node in graph.vulnerable_nodes(&symbol_map) {
        if let Some(stack) = graph.call_stack(node) {
            stacks.push(stack);
        }
    }
    update_init_positions(&mut stacks, packages);
    stacks
}

/// Summarize stacks, deduplicate by summary, and bound the group size.
fn stack_infos(
    stacks: Vec<CallStack>,
    top_packages: &HashSet<String>,
    vuln_package: &str,
) -> Vec<CallStackInfo> {
    let mut infos: Vec<CallStackInfo> = stacks
        .into_iter()
        .map(|stack| CallStackInfo {
            symbol: stack
                .last()
                .map(|f| f.function.symbol())
                .unwrap_or_default(),
            summary: summarize_call_stack(&stack, top_packages, vuln_package),
            frames: stack,
        })
        .collect();
    infos.sort_by(|a, b| match (&a.summary, &b.summary) {
        (Some(x), Some(y)) => x.cmp(y),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });
    infos.dedup_by(|a, b| a.summary.is_some() && a.summary == b.summary);
    infos.truncate(MAX_SUMMARIES_PER_GROUP);
    infos
}
