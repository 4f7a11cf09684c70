//! Samyama KV CLI: command-line access to a local Samyama KV data directory
//!
//! Every command opens the storage, runs in its own transaction and closes
//! the storage again.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use comfy_table::{ContentArrangement, Table};
use samyama_kv::{KvIterator, Storage, StorageOptions, Version};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "samyama-kv", version, about = "Samyama KV storage CLI")]
struct Cli {
    /// Data directory
    #[arg(long, default_value = "./samyama-data", global = true, env = "SAMYAMA_KV_DIR")]
    data_dir: PathBuf,

    /// YAML file with storage options
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, clap::ValueEnum)]
enum OutputFormat {
    Table,
    Json,
    Csv,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a key
    Put {
        key: String,
        value: String,

        /// Fail if the key already exists
        #[arg(long)]
        insert: bool,
    },
    /// Read a key
    Get {
        key: String,

        /// Read at this version instead of the latest one
        #[arg(long)]
        at: Option<u64>,
    },
    /// Delete a key
    Delete { key: String },
    /// List keys in [start, end)
    Scan {
        #[arg(long, default_value = "")]
        start: String,

        #[arg(long, default_value = "")]
        end: String,

        #[arg(long, default_value_t = 100)]
        limit: usize,

        /// Descending order
        #[arg(long)]
        reverse: bool,
    },
    /// Run one garbage collection round
    Gc,
    /// Show engine counters
    Stats,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let options = match &cli.config {
        Some(path) => StorageOptions::from_yaml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => StorageOptions::default(),
    };
    // Commands are short lived; collect only on request.
    let options = StorageOptions {
        gc_enabled: false,
        ..options
    };
    let storage = Storage::open(&cli.data_dir, options)
        .with_context(|| format!("opening {}", cli.data_dir.display()))?;

    let result = match cli.command {
        Commands::Put { key, value, insert } => run_put(&storage, &key, &value, insert),
        Commands::Get { key, at } => run_get(&storage, &key, at, &cli.format),
        Commands::Delete { key } => run_delete(&storage, &key),
        Commands::Scan {
            start,
            end,
            limit,
            reverse,
        } => run_scan(&storage, &start, &end, limit, reverse, &cli.format),
        Commands::Gc => run_gc(&storage, &cli.format),
        Commands::Stats => run_stats(&storage, &cli.format),
    };
    storage.close()?;
    result
}

fn run_put(storage: &Storage, key: &str, value: &str, insert: bool) -> anyhow::Result<()> {
    if value.is_empty() {
        bail!("value must not be empty");
    }
    let mut txn = storage.begin()?;
    if insert {
        txn.insert(key.as_bytes(), value.as_bytes())?;
    } else {
        txn.set(key.as_bytes(), value.as_bytes())?;
    }
    let version = txn.commit()?;
    println!("OK (version {})", version);
    Ok(())
}

fn run_get(storage: &Storage, key: &str, at: Option<u64>, format: &OutputFormat) -> anyhow::Result<()> {
    let value = match at {
        Some(ver) => match storage.snapshot(Version(ver))?.get(key.as_bytes()) {
            Ok(value) => Some(value),
            Err(err) if err.is_not_exist() => None,
            Err(err) => return Err(err.into()),
        },
        None => storage.begin()?.get(key.as_bytes())?,
    };
    let rows: Vec<(String, String)> = value
        .map(|v| vec![(key.to_string(), display_bytes(&v))])
        .unwrap_or_default();
    print_pairs(&rows, format)
}

fn run_delete(storage: &Storage, key: &str) -> anyhow::Result<()> {
    storage.run_in_txn(|txn| txn.delete(key.as_bytes()))?;
    println!("OK");
    Ok(())
}

fn run_scan(
    storage: &Storage,
    start: &str,
    end: &str,
    limit: usize,
    reverse: bool,
    format: &OutputFormat,
) -> anyhow::Result<()> {
    let txn = storage.begin()?;
    let mut iter = if reverse {
        txn.iter_reverse(start.as_bytes(), end.as_bytes())?
    } else {
        txn.iter(start.as_bytes(), end.as_bytes())?
    };
    let mut rows = Vec::new();
    while iter.valid() && rows.len() < limit {
        rows.push((display_bytes(iter.key()), display_bytes(iter.value())));
        iter.next()?;
    }
    print_pairs(&rows, format)
}

fn run_gc(storage: &Storage, format: &OutputFormat) -> anyhow::Result<()> {
    let stats = storage.gc_now()?;
    let value = serde_json::json!({
        "keys_scanned": stats.keys_scanned,
        "versions_deleted": stats.versions_deleted,
        "locks_resolved": stats.locks_resolved,
    });
    print_object(&value, format)
}

fn run_stats(storage: &Storage, format: &OutputFormat) -> anyhow::Result<()> {
    let mut value = serde_json::to_value(storage.metrics())?;
    if let serde_json::Value::Object(map) = &mut value {
        map.insert(
            "current_version".to_string(),
            serde_json::json!(storage.current_version().as_u64()),
        );
    }
    print_object(&value, format)
}

fn print_pairs(rows: &[(String, String)], format: &OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => {
            let items: Vec<serde_json::Value> = rows
                .iter()
                .map(|(k, v)| serde_json::json!({ "key": k, "value": v }))
                .collect();
            println!("{}", serde_json::to_string_pretty(&items)?);
        }
        OutputFormat::Csv => {
            println!("key,value");
            for (k, v) in rows {
                println!("{},{}", csv_field(k), csv_field(v));
            }
        }
        OutputFormat::Table => {
            if rows.is_empty() {
                println!("(no results)");
                return Ok(());
            }
            let mut table = Table::new();
            table.set_content_arrangement(ContentArrangement::Dynamic);
            table.set_header(vec!["key", "value"]);
            for (k, v) in rows {
                table.add_row(vec![k.clone(), v.clone()]);
            }
            println!("{}", table);
            println!("{} row(s)", rows.len());
        }
    }
    Ok(())
}

fn print_object(value: &serde_json::Value, format: &OutputFormat) -> anyhow::Result<()> {
    let map = match value {
        serde_json::Value::Object(map) => map,
        other => bail!("expected an object, found {}", other),
    };
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Csv => {
            println!("name,value");
            for (name, v) in map {
                println!("{},{}", name, v);
            }
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table.set_content_arrangement(ContentArrangement::Dynamic);
            table.set_header(vec!["name", "value"]);
            for (name, v) in map {
                table.add_row(vec![name.clone(), v.to_string()]);
            }
            println!("{}", table);
        }
    }
    Ok(())
}

/// Printable ASCII as is, anything else as hex.
fn display_bytes(bytes: &[u8]) -> String {
    if bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
        String::from_utf8_lossy(bytes).into_owned()
    } else {
        let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
        format!("0x{}", hex)
    }
}

fn csv_field(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}
