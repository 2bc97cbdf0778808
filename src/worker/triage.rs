//! CVE triage: does this CVE refer to a module of our ecosystem?

use crate::cveschema::Cve;
use crate::error::{Error, Result};
use crate::modpath::{
    classify_reference_url, PkgsiteClient, UrlClassification, STDLIB_MODULE_PATH,
};

/// The outcome of triaging a CVE that refers to a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriageResult {
    /// The possibly affected module path (or stdlib package path).
    pub module_path: String,
    /// Whether the path belongs to the standard library.
    pub stdlib: bool,
}

/// Triage a CVE: report the affected module, if any reference URL resolves
/// to one. Only CVE JSON 4.0 records are supported; other versions yield
/// [`Error::CveVersionUnsupported`].
pub async fn triage_cve(cve: &Cve, pkgsite: &PkgsiteClient) -> Result<Option<TriageResult>> {
    match cve.data_version.as_str() {
        "4.0" => cve_module_path(cve, pkgsite).await,
        version => Err(Error::CveVersionUnsupported {
            id: cve.id().to_string(),
            version: version.to_string(),
        }),
    }
}

/// Find a module path for a CVE by walking its reference URLs. The first
/// reference that short-circuits to the standard library or yields a known
/// candidate wins.
async fn cve_module_path(cve: &Cve, pkgsite: &PkgsiteClient) -> Result<Option<TriageResult>> {
    for reference in &cve.references.reference_data {
        if reference.url.is_empty() {
            continue;
        }
        match classify_reference_url(&reference.url) {
            UrlClassification::Stdlib { package } => {
                return Ok(Some(TriageResult {
                    module_path: package.unwrap_or_else(|| STDLIB_MODULE_PATH.to_string()),
                    stdlib: true,
                }));
            }
            UrlClassification::Candidates(candidates) => {
                for module_path in candidates {
                    if pkgsite.known_module(&module_path).await? {
                        return Ok(Some(TriageResult {
                            module_path,
                            stdlib: false,
                        }));
                    }
                }
            }
        }
    }
    Ok(None)
}
