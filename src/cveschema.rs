//! CVE JSON 4.0 record model.
//!
//! Mirrors the CVE list JSON format, keyed by `data_version`. Only the
//! fields the triage pipeline reads are modeled; everything else is carried
//! opaquely by the raw payload cached on the store record.

use serde::{Deserialize, Serialize};

/// CVE state constants.
pub const STATE_PUBLIC: &str = "PUBLIC";
pub const STATE_RESERVED: &str = "RESERVED";
pub const STATE_REJECTED: &str = "REJECT";

/// A CVE record in the 4.0 JSON format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cve {
    #[serde(default)]
    pub data_type: String,
    #[serde(default)]
    pub data_format: String,
    #[serde(default)]
    pub data_version: String,
    #[serde(rename = "CVE_data_meta", default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub description: Description,
    #[serde(default)]
    pub references: References,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(rename = "ID", default)]
    pub id: String,
    #[serde(rename = "ASSIGNER", default, skip_serializing_if = "String::is_empty")]
    pub assigner: String,
    #[serde(rename = "STATE", default)]
    pub state: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Description {
    #[serde(default)]
    pub description_data: Vec<LangString>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LangString {
    #[serde(default)]
    pub lang: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct References {
    #[serde(default)]
    pub reference_data: Vec<Reference>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reference {
    #[serde(default)]
    pub url: String,
}

const ENGLISH_LANG: &str = "eng";

impl Cve {
    /// The CVE identifier.
    pub fn id(&self) -> &str {
        &self.metadata.id
    }

    /// The CVE state (PUBLIC, RESERVED, REJECT, …).
    pub fn state(&self) -> &str {
        &self.metadata.state
    }

    /// The English description, if present.
    pub fn description_eng(&self) -> Option<&str> {
        self.description
            .description_data
            .iter()
            .find(|d| d.lang == ENGLISH_LANG)
            .map(|d| d.value.as_str())
    }
}
