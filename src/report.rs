//! Vulnerability report skeletons.
//!
//! The triage tool emits a YAML skeleton per CVE that a human reviewer
//! fills in. Self-issued CVEs additionally carry a `cve_metadata` block.

use crate::error::Result;
use crate::worker::store::CveRecord;
use serde::{Deserialize, Serialize};

/// A vulnerability report, the unit of human review.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Report {
    pub module: String,
    pub package: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stdlib: bool,
    pub versions: Vec<VersionRange>,
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cve: String,
    pub credit: String,
    pub symbols: Vec<String>,
    pub published: String,
    pub links: Links,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cve_metadata: Option<CveMetadata>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VersionRange {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub introduced: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub fixed: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Links {
    #[serde(default)]
    pub commit: String,
    #[serde(default)]
    pub pr: String,
    #[serde(default)]
    pub context: Vec<String>,
}

/// Metadata for CVEs issued from a report, rather than referenced by one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CveMetadata {
    pub id: String,
    #[serde(default)]
    pub cwe: String,
    #[serde(default)]
    pub description: String,
}

impl Report {
    /// Prefill a report from a triaged CVE record.
    pub fn from_cve_record(record: &CveRecord) -> Self {
        let description = record
            .cve
            .as_ref()
            .and_then(|c| c.description_eng())
            .unwrap_or_default()
            .to_string();
        Self {
            module: record.module.clone(),
            description,
            cve: record.id.clone(),
            ..Default::default()
        }
    }

    /// Serialize the report as YAML.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml_ng::to_string(self)?)
    }
}
