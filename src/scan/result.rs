//! Structured scan results.
//!
//! The JSON output model groups findings by OSV entry, then module, then
//! package, with a representative call stack per vulnerable symbol.

use crate::osv::Entry;
use crate::scan::matcher::{affected_records, ModuleVersion};
use crate::scan::reachability::CallStack;
use crate::semver;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The analysis the scanner performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnalysisKind {
    Source,
    Binary,
}

/// Tool and data-source information echoed into the output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    pub name: String,
    pub version: String,
    pub data_sources: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    pub analysis: AnalysisKind,
}

/// The result of a scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    pub config: OutputConfig,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vulns: Vec<VulnFinding>,
}

/// One OSV entry with the modules through which it enters the build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VulnFinding {
    pub osv: Entry,
    pub modules: Vec<ModuleFinding>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleFinding {
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub found_version: String,
    /// The latest fixed version across the entry's ranges; empty when no fix
    /// is available.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub fixed_version: String,
    /// Unique GOOS/GOARCH pairs the entry is limited to; empty when it
    /// affects all platforms.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub platforms: String,
    pub packages: Vec<PackageFinding>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageFinding {
    pub path: String,
    /// Representative call stacks, one per called vulnerable symbol. Empty
    /// when the package is imported but its vulnerable symbols are not
    /// reached. In binary mode only the symbol is populated.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub call_stacks: Vec<CallStackInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallStackInfo {
    /// The vulnerable symbol, following the OSV naming convention.
    pub symbol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub frames: CallStack,
}

impl VulnFinding {
    /// Whether any vulnerable symbol of this entry is reached (or, in
    /// binary mode, present).
    pub fn is_called(&self) -> bool {
        self.modules
            .iter()
            .flat_map(|m| &m.packages)
            .any(|p| !p.call_stacks.is_empty())
    }
}

/// One raw finding before grouping: an OSV entry observed via a module, for
/// one vulnerable package.
#[derive(Debug, Clone)]
pub struct Finding {
    pub entry: Entry,
    pub module: ModuleVersion,
    pub package: String,
    pub call_stacks: Vec<CallStackInfo>,
}

/// Group raw findings by `(OSV id, module, package)`, sorted by package
/// path, and fill in the version and platform columns.
pub fn assemble(config: OutputConfig, findings: Vec<Finding>) -> ScanResult {
    // osv id -> module path -> package findings
    let mut by_id: BTreeMap<String, (Entry, BTreeMap<String, ModuleGroup>)> = BTreeMap::new();
    for finding in findings {
        let (_, modules) = by_id
            .entry(finding.entry.id.clone())
            .or_insert_with(|| (finding.entry.clone(), BTreeMap::new()));
        let group = modules
            .entry(finding.module.path.clone())
            .or_insert_with(|| ModuleGroup {
                module: finding.module.clone(),
                packages: BTreeMap::new(),
            });
        let package = group
            .packages
            .entry(finding.package.clone())
            .or_insert_with(Vec::new);
        package.extend(finding.call_stacks);
    }

    let vulns = by_id
        .into_values()
        .map(|(entry, modules)| VulnFinding {
            modules: modules
                .into_values()
                .map(|group| {
                    let fixed = fixed_version(&entry, &group.module);
                    ModuleFinding {
                        path: group.module.path.clone(),
                        found_version: group.module.version.clone(),
                        fixed_version: fixed,
                        platforms: platforms(&entry),
                        packages: group
                            .packages
                            .into_iter()
                            .map(|(path, call_stacks)| PackageFinding { path, call_stacks })
                            .collect(),
                    }
                })
                .collect(),
            osv: entry,
        })
        .collect();
    ScanResult { config, vulns }
}

struct ModuleGroup {
    module: ModuleVersion,
    packages: BTreeMap<String, Vec<CallStackInfo>>,
}

/// The latest `fixed` version among the affected records matching the
/// module, under semver ordering.
fn fixed_version(entry: &Entry, module: &ModuleVersion) -> String {
    let mut ranges = Vec::new();
    for affected in affected_records(entry, module) {
        ranges.extend(affected.ranges.iter().cloned());
    }
    semver::latest_fixed(&ranges)
        .map(|v| semver::canonicalize_prefix(&v))
        .unwrap_or_default()
}

/// The GOOS/GOARCH pairs the entry is limited to, comma-joined, or the
/// empty string when it affects all platforms.
fn platforms(entry: &Entry) -> String {
    let mut pairs = std::collections::BTreeSet::new();
    for affected in &entry.affected {
        for import in &affected.ecosystem_specific.imports {
            for goos in &import.goos {
                if import.goarch.is_empty() {
                    pairs.insert(goos.clone());
                    continue;
                }
                for goarch in &import.goarch {
                    pairs.insert(format!("{goos}/{goarch}"));
                }
            }
            if import.goos.is_empty() {
                for goarch in &import.goarch {
                    pairs.insert(goarch.clone());
                }
            }
        }
    }
    pairs.into_iter().collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::osv::{Affected, AffectsRange, EcosystemSpecific, ImportInfo, Package, RangeEvent, RangeKind};

    fn entry() -> Entry {
        Entry {
            id: "GO-2021-0001".into(),
            affected: vec![Affected {
                package: Package {
                    name: "example.com/m".into(),
                    ecosystem: "Go".into(),
                },
                ranges: vec![AffectsRange {
                    kind: RangeKind::Semver,
                    events: vec![
                        RangeEvent::Introduced("0".into()),
                        RangeEvent::Fixed("1.1.0".into()),
                        RangeEvent::Introduced("1.2.0".into()),
                        RangeEvent::Fixed("1.2.3".into()),
                    ],
                }],
                ecosystem_specific: EcosystemSpecific {
                    imports: vec![ImportInfo {
                        path: "example.com/m/pkg".into(),
                        goos: vec!["linux".into(), "windows".into()],
                        goarch: vec!["amd64".into()],
                        symbols: vec!["F".into()],
                    }],
                },
            }],
            ..Default::default()
        }
    }

    fn config() -> OutputConfig {
        OutputConfig {
            name: "vulnreach".into(),
            version: "0.1.0".into(),
            data_sources: vec!["file:///db".into()],
            last_modified: None,
            analysis: AnalysisKind::Source,
        }
    }

    fn finding(package: &str, stacks: Vec<CallStackInfo>) -> Finding {
        Finding {
            entry: entry(),
            module: ModuleVersion {
                path: "example.com/m".into(),
                version: "v1.0.0".into(),
            },
            package: package.into(),
            call_stacks: stacks,
        }
    }

    #[test]
    fn groups_fill_versions_and_platforms() {
        let result = assemble(
            config(),
            vec![finding(
                "example.com/m/pkg",
                vec![CallStackInfo {
                    symbol: "F".into(),
                    summary: Some("app.main calls pkg.F".into()),
                    frames: vec![],
                }],
            )],
        );
        assert_eq!(result.vulns.len(), 1);
        let vuln = &result.vulns[0];
        assert!(vuln.is_called());
        let module = &vuln.modules[0];
        assert_eq!(module.found_version, "v1.0.0");
        assert_eq!(module.fixed_version, "v1.2.3");
        assert_eq!(module.platforms, "linux/amd64, windows/amd64");
        assert_eq!(module.packages[0].path, "example.com/m/pkg");
    }

    #[test]
    fn imported_only_findings_are_not_called() {
        let result = assemble(config(), vec![finding("example.com/m/pkg", vec![])]);
        assert!(!result.vulns[0].is_called());
    }

    #[test]
    fn packages_sort_by_path_within_a_group() {
        let result = assemble(
            config(),
            vec![
                finding("example.com/m/zebra", vec![]),
                finding("example.com/m/alpha", vec![]),
            ],
        );
        let packages: Vec<&str> = result.vulns[0].modules[0]
            .packages
            .iter()
            .map(|p| p.path.as_str())
            .collect();
        assert_eq!(packages, vec!["example.com/m/alpha", "example.com/m/zebra"]);
    }
}
