//! Matching build modules against the vulnerability database.

use crate::client::Client;
use crate::error::Result;
use crate::modpath::STDLIB_MODULE_PATH;
use crate::osv::{Affected, Entry};
use crate::semver::affects_semver;
use futures_util::StreamExt;
use std::collections::HashMap;

/// Fan-out bound for per-module database fetches.
const FETCH_CONCURRENCY: usize = 4;

/// A module of the build with its resolved version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleVersion {
    pub path: String,
    pub version: String,
}

/// The vulnerabilities affecting one module at its built version.
#[derive(Debug, Clone)]
pub struct ModVulns {
    pub module: ModuleVersion,
    pub entries: Vec<Entry>,
}

/// One vulnerable import derived from an OSV affected record: the package
/// and its vulnerable symbols. An empty symbol list means the entire
/// package is considered vulnerable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VulnSymbols {
    pub package: String,
    pub symbols: Vec<String>,
}

/// Fetch the OSV entries affecting the given modules, filtered by version
/// containment. Fetches fan out with bounded concurrency; any fetch error is
/// fatal to the call.
pub async fn fetch_vulnerabilities(
    client: &Client,
    modules: &HashMap<String, String>,
) -> Result<Vec<ModVulns>> {
    let module_list: Vec<ModuleVersion> = modules
        .iter()
        .map(|(path, version)| ModuleVersion {
            path: path.clone(),
            version: version.clone(),
        })
        .collect();

    let mut fetches = futures_util::stream::iter(module_list.into_iter().map(|module| async move {
        let entries = client.get(std::slice::from_ref(&module.path)).await?;
        Ok::<_, crate::error::Error>((module, entries))
    }))
    .buffer_unordered(FETCH_CONCURRENCY);

    let mut results = Vec::new();
    while let Some(fetched) = fetches.next().await {
        let (module, entries) = fetched?;
        let affecting: Vec<Entry> = entries
            .into_iter()
            .filter(|entry| !affected_records(entry, &module).is_empty())
            .collect();
        if !affecting.is_empty() {
            results.push(ModVulns {
                module,
                entries: affecting,
            });
        }
    }
    results.sort_by(|a, b| a.module.path.cmp(&b.module.path));
    Ok(results)
}

/// The affected records of an entry that name the module and contain its
/// version. For the stdlib sentinel, affected records name package paths
/// instead of the module path.
pub fn affected_records<'e>(entry: &'e Entry, module: &ModuleVersion) -> Vec<&'e Affected> {
    entry
        .affected
        .iter()
        .filter(|a| {
            let named = if module.path == STDLIB_MODULE_PATH {
                a.package.name == STDLIB_MODULE_PATH || is_stdlib_package(&a.package.name)
            } else {
                a.package.name == module.path
            };
            named && affects_semver(&a.ranges, &module.version)
        })
        .collect()
}

/// Enumerate the vulnerable `(package, symbols)` candidates of an entry for
/// a module.
pub fn vulnerable_symbols(entry: &Entry, module: &ModuleVersion) -> Vec<VulnSymbols> {
    let mut candidates = Vec::new();
    for affected in affected_records(entry, module) {
        for import in &affected.ecosystem_specific.imports {
            candidates.push(VulnSymbols {
                package: import.path.clone(),
                symbols: import.symbols.clone(),
            });
        }
    }
    candidates
}

/// A package path is in the standard library when its first segment has no
/// dot (it is not a host name).
pub fn is_stdlib_package(path: &str) -> bool {
    match path.split('/').next() {
        Some(first) if !first.is_empty() => !first.contains('.'),
        _ => false,
    }
}
