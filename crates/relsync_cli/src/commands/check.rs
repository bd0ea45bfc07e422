//! Check command implementation.

use relsync_engine::{EngineConfig, PolicySpec, ResolverRegistry};
use relsync_protocol::ChangeDetection;
use serde::Serialize;
use std::path::Path;

/// Summary of a valid configuration.
#[derive(Debug, Serialize)]
pub struct CheckResult {
    /// Node id.
    pub node_id: String,
    /// Pairs with their tables.
    pub pairs: Vec<PairSummary>,
    /// Peer ids.
    pub peers: Vec<String>,
    /// Listen address, if any.
    pub listen: Option<String>,
    /// Ledger URL, if any.
    pub ledger: Option<String>,
}

/// One pair of a valid configuration.
#[derive(Debug, Serialize)]
pub struct PairSummary {
    /// Pair id.
    pub id: String,
    /// Source store.
    pub source: String,
    /// Target store.
    pub target: String,
    /// Watch interval in milliseconds.
    pub watch_interval_ms: u64,
    /// Tables as `name (detection, policy)`.
    pub tables: Vec<String>,
}

fn policy_name(policy: &PolicySpec) -> String {
    match policy {
        PolicySpec::LastWriteWins => "last-write-wins".to_string(),
        PolicySpec::Custom(merge) => format!("custom:{}", merge),
    }
}

/// Validates `config` and summarizes it.
///
/// The CLI has no merge functions of its own, so custom policies fail here
/// just as they would fail `run`.
pub fn summarize(config: &EngineConfig) -> Result<CheckResult, Box<dyn std::error::Error>> {
    config.validate()?;
    config.check_resolvers(&ResolverRegistry::new())?;

    let mut pairs = Vec::with_capacity(config.pairs.len());
    for pair in &config.pairs {
        let mut tables = Vec::with_capacity(pair.tables.len());
        for table in &pair.tables {
            let detection = match &table.detection {
                ChangeDetection::VersionColumn(column) => format!("version {}", column),
                ChangeDetection::ContentHash => "content hash".to_string(),
            };
            let policy = policy_name(&pair.policy_for(table)?);
            tables.push(format!("{} ({}, {})", table.name, detection, policy));
        }
        pairs.push(PairSummary {
            id: pair.id.clone(),
            source: pair.source.clone(),
            target: pair.target.clone(),
            watch_interval_ms: pair.watch_interval.as_millis() as u64,
            tables,
        });
    }

    Ok(CheckResult {
        node_id: config.node_id.clone(),
        pairs,
        peers: config.peers.iter().map(|p| p.peer_id.clone()).collect(),
        listen: config.listen.map(|a| a.to_string()),
        ledger: config.ledger.clone(),
    })
}

/// Runs the check command.
pub fn run(config_path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = EngineConfig::from_file(config_path)?;
    let result = summarize(&config)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(config_path, &result);
        }
    }

    Ok(())
}

fn print_text_output(path: &Path, result: &CheckResult) {
    println!("Configuration OK: {}", path.display());
    println!();
    println!("Node: {}", result.node_id);
    println!();
    println!("Pairs:");
    for pair in &result.pairs {
        println!(
            "  {} ({} -> {}, every {} ms)",
            pair.id, pair.source, pair.target, pair.watch_interval_ms
        );
        for table in &pair.tables {
            println!("    - {}", table);
        }
    }
    if !result.peers.is_empty() {
        println!();
        println!("Peers: {}", result.peers.join(", "));
    }
    if let Some(listen) = &result.listen {
        println!("Listen: {}", listen);
    }
    println!("Ledger: {}", result.ledger.as_deref().unwrap_or("memory"));
}
