//! vulnreach: report known vulnerabilities that affect a given build.
//!
//! Uses the call graph of a build bundle, or a binary's symbol table, to
//! narrow reports down to vulnerabilities that potentially affect the
//! application.

use anyhow::Result;
use clap::Parser;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use vulnreach::client::{Client, ClientOptions, FsCache};
use vulnreach::scan::binary::METADATA_MAGIC;
use vulnreach::scan::reachability::CallGraph;
use vulnreach::scan::result::{
    assemble, AnalysisKind, OutputConfig, ScanResult, VulnFinding,
};
use vulnreach::scan::{scan_binary, scan_source, BuildBundle};
use vulnreach::{logging, Error, ScanConfig, STDLIB_MODULE_PATH};

#[derive(Parser)]
#[command(name = "vulnreach")]
#[command(version)]
#[command(about = "Identify known vulnerabilities by call graph traversal", long_about = None)]
#[command(after_help = "EXIT CODES:
    0  No vulnerabilities found
    1  Usage or runtime error
    3  Vulnerabilities found

ENVIRONMENT:
    GOVULNDB              Comma-separated vulnerability DB URIs
                          (http://, https://, or file://). Entries from
                          multiple databases are merged.
    VULNREACH_CACHE_DIR   HTTP cache directory.

EXAMPLES:
    # Scan a build bundle produced by the compiler front-end
    vulnreach ./bundle.json

    # Scan a compiled binary
    vulnreach ./bin/server")]
struct Cli {
    /// Print vulnerability findings in JSON format
    #[arg(long)]
    json: bool,

    /// Print a full call stack for each vulnerability
    #[arg(short = 'v')]
    verbose: bool,

    /// Analyze test files. Only valid for source scans
    #[arg(long)]
    test: bool,

    /// Comma-separated list of build tags. Only valid for source scans
    #[arg(long, value_delimiter = ',')]
    tags: Vec<String>,

    /// Build bundle files, or a single binary path
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _guard = logging::init_logging(None);
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => match e.downcast_ref::<Error>() {
            Some(Error::VulnerabilitiesFound) => ExitCode::from(3),
            _ => {
                eprintln!("vulnreach: {e:#}");
                ExitCode::from(1)
            }
        },
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = ScanConfig::from_env();
    let client = Client::new(
        &config.db_sources,
        ClientOptions {
            cache: Some(Arc::new(FsCache::new(&config.cache_dir))),
            ..Default::default()
        },
    )?;

    let binary_mode = cli.inputs.len() == 1 && is_binary_artifact(&cli.inputs[0])?;
    if binary_mode {
        if cli.test {
            return Err(Error::usage("the -test flag is invalid for binaries").into());
        }
        if !cli.tags.is_empty() {
            return Err(Error::usage("the -tags flag is invalid for binaries").into());
        }
    }

    let (analysis, findings) = if binary_mode {
        let data = std::fs::read(&cli.inputs[0])?;
        (AnalysisKind::Binary, scan_binary(&client, &data).await?)
    } else {
        let mut findings = Vec::new();
        for input in &cli.inputs {
            let bundle = BuildBundle::load(&std::fs::read(input)?)?;
            let graph = CallGraph::from_data(bundle.call_graph)?;
            findings.extend(scan_source(&client, &bundle.packages, &graph).await?);
        }
        (AnalysisKind::Source, findings)
    };

    let output_config = OutputConfig {
        name: "vulnreach".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        data_sources: config.db_sources.clone(),
        last_modified: client.last_modified().await.ok().flatten(),
        analysis,
    };
    let result = assemble(output_config, findings);

    let source_mode = analysis == AnalysisKind::Source;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_text(&mut std::io::stdout(), &result, cli.verbose, source_mode)?;
    }

    // In source mode only vulnerabilities with a reaching call stack count
    // toward the exit status; in binary mode every finding does.
    let found = result
        .vulns
        .iter()
        .any(|v| if source_mode { v.is_called() } else { true });
    if found {
        return Err(Error::VulnerabilitiesFound.into());
    }
    Ok(())
}

/// A single input is a binary artifact when it embeds a metadata section.
fn is_binary_artifact(path: &Path) -> Result<bool> {
    let data = std::fs::read(path)?;
    Ok(data
        .windows(METADATA_MAGIC.len())
        .any(|w| w == METADATA_MAGIC))
}

fn print_text(
    w: &mut impl Write,
    result: &ScanResult,
    verbose: bool,
    source_mode: bool,
) -> Result<()> {
    let (affected, unaffected): (Vec<&VulnFinding>, Vec<&VulnFinding>) = result
        .vulns
        .iter()
        .partition(|v| !source_mode || v.is_called());

    if affected.is_empty() {
        writeln!(w, "No vulnerabilities found.")?;
    }
    for (i, vuln) in affected.iter().enumerate() {
        writeln!(w, "Vulnerability #{}: {}", i + 1, vuln.osv.id)?;
        if !vuln.osv.details.is_empty() {
            writeln!(w, "  {}", vuln.osv.details.trim())?;
        }
        for module in &vuln.modules {
            let path = display_module_path(vuln, module.path.as_str());
            writeln!(w, "  Found in: {}@{}", path, module.found_version)?;
            if module.fixed_version.is_empty() {
                writeln!(w, "  Fixed in: N/A")?;
            } else {
                writeln!(w, "  Fixed in: {}@{}", path, module.fixed_version)?;
            }
            if !module.platforms.is_empty() {
                writeln!(w, "  Platforms: {}", module.platforms)?;
            }
            for package in &module.packages {
                if package.call_stacks.is_empty() {
                    continue;
                }
                if verbose {
                    for (n, stack) in package.call_stacks.iter().enumerate() {
                        writeln!(w, "  Call stack #{} for {}:", n + 1, stack.symbol)?;
                        for frame in &stack.frames {
                            write!(w, "    {}", frame.function.display_name())?;
                            if let Some(pos) = &frame.function.position {
                                if pos.is_valid() {
                                    write!(w, " ({pos})")?;
                                }
                            }
                            writeln!(w)?;
                        }
                    }
                } else {
                    for stack in &package.call_stacks {
                        if let Some(summary) = &stack.summary {
                            writeln!(w, "    {summary}")?;
                        }
                    }
                }
            }
        }
        writeln!(w)?;
    }

    if !unaffected.is_empty() {
        writeln!(w, "=== Informational ===")?;
        writeln!(
            w,
            "The vulnerabilities below are in packages that you import, but your code\ndoes not appear to call any vulnerable functions."
        )?;
        for vuln in &unaffected {
            for module in &vuln.modules {
                let path = display_module_path(vuln, module.path.as_str());
                writeln!(
                    w,
                    "  {}: {}@{}",
                    vuln.osv.id, path, module.found_version
                )?;
            }
        }
    }
    Ok(())
}

/// For stdlib vulnerabilities, show a package path rather than the
/// confusing module sentinel.
fn display_module_path<'a>(vuln: &'a VulnFinding, module_path: &'a str) -> &'a str {
    if module_path == STDLIB_MODULE_PATH {
        if let Some(module) = vuln.modules.iter().find(|m| m.path == module_path) {
            if let Some(package) = module.packages.first() {
                return &package.path;
            }
        }
    }
    module_path
}
