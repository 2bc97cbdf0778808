//! OSV vulnerability record model.
//!
//! This module defines the typed representation of Open Source Vulnerability
//! records as served by the vulnerability database: one JSON file per module,
//! each containing an array of [`Entry`] values, plus a root `index.json`
//! mapping module paths to their last modification time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The database index: module path to the time its entries last changed.
pub type DbIndex = HashMap<String, DateTime<Utc>>;

/// A single OSV vulnerability entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Entry {
    /// Unique identifier (e.g. "GO-2021-0064").
    pub id: String,
    /// Alternative identifiers, notably CVE IDs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    /// Detailed human-readable description of the vulnerability.
    #[serde(default)]
    pub details: String,
    /// When the entry was first published.
    pub published: Option<DateTime<Utc>>,
    /// When the entry was last modified.
    pub modified: Option<DateTime<Utc>>,
    /// When the entry was withdrawn, if it was.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub withdrawn: Option<DateTime<Utc>>,
    /// Affected packages and version ranges.
    #[serde(default)]
    pub affected: Vec<Affected>,
    /// References to external resources (advisories, fixes, reports).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<Reference>,
}

/// An affected record binding a package to ranges and symbol data.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Affected {
    pub package: Package,
    /// Version ranges affected. An absent list means all versions affected.
    #[serde(default)]
    pub ranges: Vec<AffectsRange>,
    /// Ecosystem payload enumerating the vulnerable imports.
    #[serde(default)]
    pub ecosystem_specific: EcosystemSpecific,
}

/// The package (module) named by an affected record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Package {
    pub name: String,
    #[serde(default)]
    pub ecosystem: String,
}

/// A sequence of events encoding an inclusion set over versions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AffectsRange {
    #[serde(rename = "type")]
    pub kind: RangeKind,
    #[serde(default)]
    pub events: Vec<RangeEvent>,
}

/// Range types. Only semver ranges participate in version containment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RangeKind {
    Semver,
    /// Fallback for unspecified or unrecognized range types.
    #[default]
    #[serde(other)]
    Unspecified,
}

/// A range event. Exactly one of introduced/fixed is set per event; the
/// sentinel `introduced = "0"` denotes the beginning of time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeEvent {
    Introduced(String),
    Fixed(String),
}

impl RangeEvent {
    /// The version the event anchors on.
    pub fn version(&self) -> &str {
        match self {
            RangeEvent::Introduced(v) | RangeEvent::Fixed(v) => v,
        }
    }
}

/// A typed reference URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reference {
    #[serde(rename = "type")]
    pub kind: ReferenceKind,
    pub url: String,
}

/// Reference types as defined in the OSV schema.
/// Uses `#[serde(other)]` to gracefully handle unknown variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReferenceKind {
    Advisory,
    Fix,
    Report,
    Web,
    /// Fallback for unknown/future reference types.
    #[default]
    #[serde(other)]
    Other,
}

/// Ecosystem-specific payload: which imports are vulnerable, and where.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EcosystemSpecific {
    #[serde(default)]
    pub imports: Vec<ImportInfo>,
}

/// One vulnerable import: package path, platforms, and symbol names.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportInfo {
    pub path: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub goos: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub goarch: Vec<String>,
    /// Vulnerable symbol names, possibly of the form `Type.Method`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub symbols: Vec<String>,
}

impl Entry {
    /// The CVE aliases of this entry.
    pub fn cve_aliases(&self) -> impl Iterator<Item = &str> {
        self.aliases
            .iter()
            .filter(|a| a.starts_with("CVE-"))
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_osv_wire_format() {
        let raw = r#"{
            "id": "GO-2021-0064",
            "aliases": ["CVE-2020-8565"],
            "details": "Tokens may be logged.",
            "affected": [{
                "package": {"name": "k8s.io/client-go", "ecosystem": "Go"},
                "ranges": [{
                    "type": "SEMVER",
                    "events": [{"introduced": "0"}, {"fixed": "0.20.0"}]
                }],
                "ecosystem_specific": {
                    "imports": [{
                        "path": "k8s.io/client-go/transport",
                        "symbols": ["logging.tryReflectError"]
                    }]
                }
            }],
            "references": [
                {"type": "FIX", "url": "https://github.com/kubernetes/kubernetes/pull/95316"},
                {"type": "SOMETHING_NEW", "url": "https://example.com"}
            ]
        }"#;
        let e: Entry = serde_json::from_str(raw).unwrap();
        assert_eq!(e.id, "GO-2021-0064");
        assert_eq!(e.cve_aliases().collect::<Vec<_>>(), vec!["CVE-2020-8565"]);
        let a = &e.affected[0];
        assert_eq!(a.ranges[0].kind, RangeKind::Semver);
        assert_eq!(
            a.ranges[0].events,
            vec![
                RangeEvent::Introduced("0".into()),
                RangeEvent::Fixed("0.20.0".into())
            ]
        );
        assert_eq!(
            a.ecosystem_specific.imports[0].symbols,
            vec!["logging.tryReflectError"]
        );
        // Unknown reference kinds fall back to Other instead of failing.
        assert_eq!(e.references[1].kind, ReferenceKind::Other);
    }

    #[test]
    fn events_roundtrip_as_single_key_objects() {
        let ev = RangeEvent::Fixed("1.2.3".into());
        let js = serde_json::to_string(&ev).unwrap();
        assert_eq!(js, r#"{"fixed":"1.2.3"}"#);
        let back: RangeEvent = serde_json::from_str(&js).unwrap();
        assert_eq!(back, ev);
    }
}
