//! keyburn station CLI
//!
//! Provisions the device attached to an OpenOCD debug server, and inspects
//! the key store between runs.

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use keyburn_core::{logging, KeyFileName, PoolSelection, ProvisionConfig};
use keyburn_provision::{
    list_unused_keys, reconcile, OpenOcdProbe, ProvisioningDatabase, Provisioner,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::error;

#[derive(Debug, Parser)]
#[command(author, version, about = "Manufacturing key provisioning station")]
struct Cli {
    /// TOML configuration file (defaults apply when omitted).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    json_logs: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Provision the device attached to the debug probe.
    Provision(ProvisionArgs),
    /// Cross-check key pool, archive and database.
    Check(CheckArgs),
    /// List unused key files.
    Pool(PoolArgs),
}

/// Key store location overrides.
#[derive(Debug, Args)]
struct StoreArgs {
    /// Directory of unused key files.
    #[arg(long)]
    key_dir: Option<PathBuf>,
    /// Directory receiving committed key files.
    #[arg(long)]
    archive_dir: Option<PathBuf>,
    /// Provisioning database (CSV).
    #[arg(long)]
    database: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ProvisionArgs {
    #[command(flatten)]
    store: StoreArgs,
    /// OpenOCD TCL-RPC endpoint.
    #[arg(long, value_name = "HOST:PORT")]
    openocd: Option<String>,
    /// Draw keys in ascending name order.
    #[arg(long)]
    sorted: bool,
    /// Print the outcome as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct CheckArgs {
    #[command(flatten)]
    store: StoreArgs,
    /// Print the report as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct PoolArgs {
    #[command(flatten)]
    store: StoreArgs,
    /// Print the listing as JSON.
    #[arg(long)]
    json: bool,
}

/// JSON output for the pool command
#[derive(Debug, Serialize)]
struct PoolOutput {
    dir: PathBuf,
    count: usize,
    unused: Vec<KeyFileName>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if cli.json_logs {
        logging::init_json();
    } else {
        logging::init();
    }

    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!(error = %format!("{:#}", e), "keyburn failed");
            eprintln!("error: {:#}", e);
            ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> Result<u8> {
    let mut config = load_config(cli.config.as_deref())?;
    match cli.command {
        Command::Provision(args) => {
            apply_store(&mut config, &args.store);
            if let Some(endpoint) = &args.openocd {
                let (host, port) = parse_endpoint(endpoint)?;
                config.probe.host = host;
                config.probe.port = port;
            }
            if args.sorted {
                config.pool.selection = PoolSelection::Sorted;
            }
            Ok(cmd_provision(&config, args.json))
        }
        Command::Check(args) => {
            apply_store(&mut config, &args.store);
            cmd_check(&config, args.json)
        }
        Command::Pool(args) => {
            apply_store(&mut config, &args.store);
            cmd_pool(&config, args.json)
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<ProvisionConfig> {
    match path {
        Some(path) => ProvisionConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => Ok(ProvisionConfig::default_config()),
    }
}

fn apply_store(config: &mut ProvisionConfig, store: &StoreArgs) {
    if let Some(dir) = &store.key_dir {
        config.paths.key_dir = dir.clone();
    }
    if let Some(dir) = &store.archive_dir {
        config.paths.archive_dir = dir.clone();
    }
    if let Some(path) = &store.database {
        config.paths.database = path.clone();
    }
}

fn parse_endpoint(endpoint: &str) -> Result<(String, u16)> {
    let (host, port) = endpoint
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("expected HOST:PORT, got {:?}", endpoint))?;
    if host.is_empty() {
        return Err(anyhow!("missing host in {:?}", endpoint));
    }
    let port = port
        .parse::<u16>()
        .with_context(|| format!("invalid port in {:?}", endpoint))?;
    Ok((host.to_string(), port))
}

/// Provision one device. Fatal errors are reported here so the JSON mode
/// always prints exactly one object.
fn cmd_provision(config: &ProvisionConfig, json: bool) -> u8 {
    let result = Provisioner::open(config).and_then(|mut provisioner| {
        let mut probe = OpenOcdProbe::new(config.probe.clone());
        provisioner.run(&mut probe)
    });

    match result {
        Ok(outcome) => {
            if json {
                match serde_json::to_string(&outcome) {
                    Ok(line) => println!("{}", line),
                    Err(e) => eprintln!("error: cannot encode outcome: {}", e),
                }
            } else {
                println!("{}", outcome.status_line());
            }
            outcome.exit_code()
        }
        Err(e) => {
            if json {
                println!(
                    "{}",
                    serde_json::json!({ "status": "fatal", "error": e.to_string() })
                );
            } else {
                println!("FATAL {}", e);
            }
            1
        }
    }
}

fn cmd_check(config: &ProvisionConfig, json: bool) -> Result<u8> {
    let paths = &config.paths;
    let database = ProvisioningDatabase::load(&paths.database)
        .with_context(|| format!("Failed to load {}", paths.database.display()))?;
    let report = reconcile(&database, &paths.key_dir, &paths.archive_dir)
        .context("Failed to scan key store")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("records: {}", database.len());
        for key in &report.orphaned_archive {
            println!("orphaned archive key: {}", key);
        }
        for (uid, key) in &report.missing_from_archive {
            println!("missing from archive: {} ({})", key, uid);
        }
        for key in &report.pool_conflicts {
            println!("already assigned or archived but still in pool: {}", key);
        }
        if let Some(line) = report.torn_tail_line {
            println!("torn database row at line {}", line);
        }
        if report.is_clean() {
            println!("clean");
        }
    }

    Ok(if report.is_clean() { 0 } else { 1 })
}

fn cmd_pool(config: &ProvisionConfig, json: bool) -> Result<u8> {
    let dir = config.paths.key_dir.clone();
    let mut unused = list_unused_keys(&dir)
        .with_context(|| format!("Failed to list {}", dir.display()))?;
    unused.sort();

    if json {
        let output = PoolOutput {
            dir,
            count: unused.len(),
            unused,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        for key in &unused {
            println!("{}", key);
        }
        println!("{} unused key file(s) in {}", unused.len(), dir.display());
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoint() {
        assert_eq!(
            parse_endpoint("127.0.0.1:6666").unwrap(),
            ("127.0.0.1".to_string(), 6666)
        );
        assert!(parse_endpoint("localhost").is_err());
        assert!(parse_endpoint(":6666").is_err());
        assert!(parse_endpoint("localhost:openocd").is_err());
    }

    #[test]
    fn test_cli_parses_provision_flags() {
        let cli = Cli::parse_from([
            "keyburn",
            "--json-logs",
            "provision",
            "--key-dir",
            "/srv/keys",
            "--openocd",
            "bench-3:6666",
            "--sorted",
            "--json",
        ]);
        assert!(cli.json_logs);
        match cli.command {
            Command::Provision(args) => {
                assert_eq!(args.store.key_dir, Some(PathBuf::from("/srv/keys")));
                assert_eq!(args.openocd.as_deref(), Some("bench-3:6666"));
                assert!(args.sorted);
                assert!(args.json);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_store_overrides() {
        let mut config = ProvisionConfig::default_config();
        apply_store(
            &mut config,
            &StoreArgs {
                key_dir: None,
                archive_dir: Some(PathBuf::from("/srv/used")),
                database: None,
            },
        );
        assert_eq!(config.paths.archive_dir, PathBuf::from("/srv/used"));
        assert_eq!(config.paths.key_dir, PathBuf::from("keys"));
    }
}
