//! Package graph adapter.
//!
//! The compiler front-end parses sources and type-checks packages; this core
//! consumes its output as an interchange document: per-package import paths,
//! module bindings (honoring `replace`), and just enough syntax positions
//! (package clauses, import statements) to patch init-function frames later.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// An arbitrary source position. A position is valid if its line is > 0.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub line: u32,
    #[serde(default)]
    pub column: u32,
}

impl Position {
    pub fn is_valid(&self) -> bool {
        self.line > 0
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// A module binding. `replace` carries the effective module when the build
/// redirects this path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub path: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replace: Option<Box<Module>>,
}

impl Module {
    /// The module that actually provides the code, following `replace`.
    pub fn resolved(&self) -> &Module {
        self.replace.as_deref().unwrap_or(self)
    }
}

/// One source file's positions of interest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceFile {
    pub path: String,
    /// Position of the `package P` clause.
    #[serde(default)]
    pub package_clause: Position,
    /// Import declarations with their positions.
    #[serde(default)]
    pub imports: Vec<ImportDecl>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportDecl {
    pub path: String,
    #[serde(default)]
    pub position: Position,
}

/// A type-checked package as supplied by the front-end.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Package {
    pub path: String,
    #[serde(default)]
    pub imports: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<Module>,
    #[serde(default)]
    pub files: Vec<SourceFile>,
    /// Per-package load diagnostics from the front-end.
    #[serde(default)]
    pub diagnostics: Vec<String>,
}

/// The package graph for one build, with the user's root packages.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackageGraph {
    pub packages: Vec<Package>,
    #[serde(default)]
    pub roots: Vec<String>,
}

impl PackageGraph {
    /// Deserialize and validate a graph document.
    pub fn load(bytes: &[u8]) -> Result<Self> {
        let graph: PackageGraph = serde_json::from_slice(bytes)?;
        graph.validate()?;
        Ok(graph)
    }

    /// Surface front-end diagnostics as a single aggregated error.
    pub fn validate(&self) -> Result<()> {
        let mut diagnostics = Vec::new();
        for package in &self.packages {
            for d in &package.diagnostics {
                diagnostics.push(format!("{}: {}", package.path, d));
            }
        }
        if diagnostics.is_empty() {
            Ok(())
        } else {
            Err(Error::data(
                "package load",
                format!("packages contain errors:\n{}", diagnostics.join("\n")),
            ))
        }
    }

    /// The distinct modules of the build, keyed by declared path.
    pub fn modules(&self) -> Vec<Module> {
        let mut seen = HashSet::new();
        let mut modules = Vec::new();
        for package in &self.packages {
            if let Some(module) = &package.module {
                if seen.insert(module.path.clone()) {
                    modules.push(module.clone());
                }
            }
        }
        modules
    }

    /// Map module path to its effective version (honoring `replace`).
    pub fn module_versions(&self) -> HashMap<String, String> {
        self.modules()
            .into_iter()
            .map(|m| {
                let version = m.resolved().version.clone();
                (m.path, version)
            })
            .collect()
    }

    /// The user's top-level package paths.
    pub fn top_packages(&self) -> HashSet<String> {
        self.roots.iter().cloned().collect()
    }

    /// Look up a package by import path.
    pub fn package(&self, path: &str) -> Option<&Package> {
        self.packages.iter().find(|p| p.path == path)
    }
}
