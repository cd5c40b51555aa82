//! # CLI - Partition Shell
//!
//! A REPL over one partition directory. Reads commands from stdin, runs
//! them against the partition and prints results to stdout, so it works
//! both interactively and with commands piped in.
//!
//! ## Commands
//!
//! ```text
//! UPDATE version     Fetch and merge up to `version`
//! VERSION            Print the current local version
//! FILES              List the partition's bases and deltas
//! GET key_hash       Look up a hex-encoded key hash (prints value or "(nil)")
//! RECOVER            Remove leftovers of an interrupted update
//! EXIT / QUIT        Leave the shell
//! ```
//!
//! ## Configuration
//!
//! Read from the environment by [`PartitionConfig::from_env`]:
//!
//! ```text
//! PARTITION_ROOT              local partition directory (default: "data/partition")
//! PARTITION_REMOTE_ROOT       directory to fetch from   (UPDATE needs it)
//! PARTITION_KEY_HASH_SIZE     key hash width            (default: 8)
//! PARTITION_OFFSET_SIZE       index pointer width       (default: 5)
//! PARTITION_HASH_INDEX_BITS   index bucket bits         (default: 8)
//! PARTITION_VALUE_LENGTH_SIZE value length width        (default: 4)
//! PARTITION_COMPRESSION       none | lz4                (default: none)
//! RUST_LOG                    log filter                (default: "warn")
//! ```
//!
//! ## Example
//!
//! ```text
//! $ PARTITION_REMOTE_ROOT=/mnt/remote cargo run -p cli
//! partition shell (root=data/partition, version=none)
//! > UPDATE 3
//! OK version=3 merged=[2, 3] fetched=6 deleted=4
//! > GET 0000000000000001
//! hello
//! > EXIT
//! bye
//! ```

use anyhow::{bail, Result};
use config::PartitionConfig;
use std::io::{self, BufRead, Write};
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use updater::{
    recover, LocalFileSource, PartitionFiles, PartitionReader, PartitionUpdater, UpdateError,
};

fn main() -> Result<()> {
    // Logs go to stderr so stdout stays parseable.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(io::stderr),
        )
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let config = PartitionConfig::from_env()?;
    let mut updater = match LocalFileSource::from_config(&config) {
        Some(source) => Some(PartitionUpdater::new(config.clone(), source)?),
        None => None,
    };

    println!(
        "partition shell (root={}, version={})",
        config.local_partition_root.display(),
        version_label(&config)?
    );
    println!("Commands: UPDATE version | VERSION | FILES | GET key_hash | RECOVER | EXIT");
    print!("> ");
    io::stdout().flush().ok();

    let stdin = io::stdin();

    for line in stdin.lock().lines() {
        let line = line?;
        let mut parts = line.split_whitespace();
        if let Some(cmd) = parts.next() {
            match cmd.to_uppercase().as_str() {
                "UPDATE" => match (parts.next().map(str::parse::<u64>), updater.as_mut()) {
                    (Some(Ok(target)), Some(updater)) => match updater.update(target) {
                        Ok(outcome) if outcome.is_noop() => {
                            println!("OK (already at {})", outcome.version)
                        }
                        Ok(outcome) => println!(
                            "OK version={} merged={:?} fetched={} deleted={}",
                            outcome.version,
                            outcome.merged_deltas,
                            outcome.fetched.len(),
                            outcome.deleted.len()
                        ),
                        Err(e) => {
                            warn!(version = target, error = %e, "update failed");
                            println!("ERR update failed: {}", describe(&e))
                        }
                    },
                    (Some(Ok(_)), None) => {
                        println!("ERR no remote configured (set PARTITION_REMOTE_ROOT)")
                    }
                    _ => println!("ERR usage: UPDATE version"),
                },
                "VERSION" => match version_label(&config) {
                    Ok(v) => println!("{}", v),
                    Err(e) => println!("ERR scan failed: {}", e),
                },
                "FILES" => match PartitionFiles::scan(&config.local_partition_root) {
                    Ok(files) if files.files().is_empty() => println!("(empty)"),
                    Ok(files) => {
                        for file in files.files() {
                            println!("{}", file);
                        }
                        println!("({} files)", files.files().len());
                    }
                    Err(e) => println!("ERR scan failed: {}", e),
                },
                "GET" => match parts.next() {
                    Some(hex) => match get(&config, hex) {
                        Ok(Some(v)) => println!("{}", String::from_utf8_lossy(&v)),
                        Ok(None) => println!("(nil)"),
                        Err(e) => println!("ERR read failed: {:#}", e),
                    },
                    None => println!("ERR usage: GET key_hash"),
                },
                "RECOVER" => match recover(&config.local_partition_root) {
                    Ok(report) => println!(
                        "OK removed={} version={}",
                        report.removed.len(),
                        report
                            .generation
                            .map_or_else(|| "none".to_string(), |g| g.version.to_string())
                    ),
                    Err(e) => println!("ERR recover failed: {}", e),
                },
                "EXIT" | "QUIT" => {
                    println!("bye");
                    break;
                }
                other => {
                    println!("unknown command: {}", other);
                }
            }
        }

        print!("> ");
        io::stdout().flush().ok();
    }

    Ok(())
}

fn version_label(config: &PartitionConfig) -> io::Result<String> {
    Ok(PartitionFiles::scan(&config.local_partition_root)?
        .current_generation()
        .map_or_else(|| "none".to_string(), |g| g.version.to_string()))
}

fn describe(e: &UpdateError) -> String {
    match e.committed_version() {
        Some(v) => format!("{} (version {} is committed)", e, v),
        None if e.requires_operator() => format!("{} (operator attention needed)", e),
        None if e.is_retryable() => format!("{} (retryable)", e),
        None => e.to_string(),
    }
}

/// Opens the current generation and looks up one hex-encoded key hash.
fn get(config: &PartitionConfig, hex: &str) -> Result<Option<Vec<u8>>> {
    let key_hash = decode_hex(hex)?;
    if key_hash.len() != config.key_hash_size {
        bail!(
            "key hash is {} bytes, partition uses {}",
            key_hash.len(),
            config.key_hash_size
        );
    }
    PartitionReader::open(config)?.get(&key_hash)
}

fn decode_hex(s: &str) -> Result<Vec<u8>> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.len() % 2 != 0 {
        bail!("odd number of hex digits in {:?}", s);
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            s.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| anyhow::anyhow!("invalid hex {:?}", s))
        })
        .collect()
}
