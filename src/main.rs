//! Keystone log administration tool
//!
//! Inspects and maintains a transaction log directory offline:
//! - `status`: list transactions the log still holds
//! - `keypoint`: compact the log down to live transactions
//! - `config`: print the effective configuration as JSON

use std::path::PathBuf;

use log::info;

use keystone::txlog::{live_transactions, DurableLog, FileLog};
use keystone::TmConfig;

fn print_help() {
    println!("Keystone - transaction log administration");
    println!();
    println!("Usage: keystone [OPTIONS] <status|keypoint|config>");
    println!();
    println!("Options:");
    println!("  -d, --log-dir DIR     Transaction log directory (default: ./txlog)");
    println!("  -s, --server NAME     Server whose records to show (default: keystone)");
    println!("  -i, --instance NAME   Instance name (default: server)");
    println!("  -c, --config FILE     JSON configuration file");
    println!("  -h, --help            Show this help");
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();

    let mut config = TmConfig::default();
    let mut log_dir: Option<PathBuf> = None;
    let mut server: Option<String> = None;
    let mut instance: Option<String> = None;
    let mut command: Option<String> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config = TmConfig::from_file(&PathBuf::from(&args[i + 1]))?;
                    i += 1;
                }
            }
            "--log-dir" | "-d" => {
                if i + 1 < args.len() {
                    log_dir = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--server" | "-s" => {
                if i + 1 < args.len() {
                    server = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--instance" | "-i" => {
                if i + 1 < args.len() {
                    instance = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            other if !other.starts_with('-') => command = Some(other.to_string()),
            other => {
                eprintln!("Unknown option: {}", other);
                print_help();
                std::process::exit(2);
            }
        }
        i += 1;
    }

    // flags override the configuration file
    if let Some(dir) = log_dir {
        config.tx_log_dir = dir;
    }
    if let Some(name) = server {
        config.server_name = name;
    }
    if let Some(name) = instance {
        config.instance_name = name;
    }
    config.validate()?;

    match command.as_deref() {
        Some("status") => {
            let log = FileLog::from_config(&config)?;
            let live = live_transactions(&log.read_all(&config.server_name)?);
            println!(
                "{} live transaction(s) for server '{}' in {}",
                live.len(),
                config.server_name,
                log.path().display()
            );
            for txn in &live {
                println!(
                    "  {} local={} decision={:?} heuristic={:?} branches={}",
                    txn.xid,
                    txn.local_id,
                    txn.decision,
                    txn.heuristic,
                    txn.branches.len()
                );
                for branch in &txn.branches {
                    println!("    {} on {}", branch.branch, branch.resource_manager);
                }
            }
        }
        Some("keypoint") => {
            let log = FileLog::from_config(&config)?;
            log.keypoint()?;
            info!("Keypoint written to {}", log.path().display());
        }
        Some("config") => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Some(other) => {
            eprintln!("Unknown command: {}", other);
            print_help();
            std::process::exit(2);
        }
        None => print_help(),
    }

    Ok(())
}
