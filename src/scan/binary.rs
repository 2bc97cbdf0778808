//! Binary metadata extraction.
//!
//! Compiled artifacts embed a metadata section: a magic marker, a big-endian
//! u32 payload length, and a JSON payload naming the toolchain stamp, the
//! module versions baked into the build (including `replace` redirections),
//! and the package-qualified symbols the binary references. No call graph is
//! available in binary mode; reachability degrades to symbol presence.

use crate::error::{Error, Result};
use crate::modpath::STDLIB_MODULE_PATH;
use crate::scan::packages::Module;
use crate::semver::semver_from_go_version;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Marker preceding the embedded metadata payload.
pub const METADATA_MAGIC: &[u8] = b"\xff vulnreach.meta\x00";

/// The embedded metadata payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BinaryMetadata {
    /// Toolchain stamp, e.g. `go1.18.1`. May be empty or unparsable.
    #[serde(default)]
    pub toolchain: String,
    #[serde(default)]
    pub modules: Vec<Module>,
    /// Package-qualified symbol names: `pkg/path.Func` or
    /// `pkg/path.Type.Method`.
    #[serde(default)]
    pub symbols: Vec<String>,
}

/// Scan an artifact for the metadata section and parse it.
pub fn read_binary_metadata(data: &[u8]) -> Result<BinaryMetadata> {
    let start = find_magic(data).ok_or_else(|| {
        Error::data("binary", "no build metadata section found")
    })?;
    let after = &data[start + METADATA_MAGIC.len()..];
    if after.len() < 4 {
        return Err(Error::data("binary", "truncated metadata length"));
    }
    let len = u32::from_be_bytes([after[0], after[1], after[2], after[3]]) as usize;
    let payload = after
        .get(4..4 + len)
        .ok_or_else(|| Error::data("binary", "truncated metadata payload"))?;
    serde_json::from_slice(payload)
        .map_err(|e| Error::data("binary", format!("bad metadata payload: {e}")))
}

fn find_magic(data: &[u8]) -> Option<usize> {
    data.windows(METADATA_MAGIC.len())
        .position(|w| w == METADATA_MAGIC)
}

impl BinaryMetadata {
    /// Module path to effective version, including a synthesized entry for
    /// the standard library derived from the toolchain stamp. The stdlib
    /// version may be empty when the stamp is a development build.
    pub fn module_versions(&self) -> HashMap<String, String> {
        let mut versions: HashMap<String, String> = self
            .modules
            .iter()
            .map(|m| (m.path.clone(), m.resolved().version.clone()))
            .collect();
        versions.insert(
            STDLIB_MODULE_PATH.to_string(),
            semver_from_go_version(&self.toolchain).unwrap_or_default(),
        );
        versions
    }

    /// Referenced symbols grouped by package path.
    pub fn symbols_by_package(&self) -> HashMap<String, HashSet<String>> {
        let mut by_package: HashMap<String, HashSet<String>> = HashMap::new();
        for qualified in &self.symbols {
            if let Some((package, symbol)) = split_package_symbol(qualified) {
                by_package
                    .entry(package.to_string())
                    .or_default()
                    .insert(symbol.to_string());
            }
        }
        by_package
    }
}

/// Split a qualified symbol into package path and symbol name. The package
/// path ends at the first dot after the last slash, so method names of the
/// form `Type.Method` stay intact.
pub fn split_package_symbol(qualified: &str) -> Option<(&str, &str)> {
    let after_slash = qualified.rfind('/').map_or(0, |i| i + 1);
    let dot = qualified[after_slash..].find('.')? + after_slash;
    let (package, symbol) = qualified.split_at(dot);
    let symbol = &symbol[1..];
    if package.is_empty() || symbol.is_empty() {
        None
    } else {
        Some((package, symbol))
    }
}

/// Build a synthetic artifact around a metadata payload. Used by tests and
/// by the toolchain shim that stamps binaries.
pub fn encode_metadata(meta: &BinaryMetadata) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(meta)?;
    let mut out = Vec::with_capacity(METADATA_MAGIC.len() + 4 + payload.len());
    out.extend_from_slice(METADATA_MAGIC);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}
