//! talkstore CLI
//!
//! Operational commands against the configured storage backend.
//!
//! # Usage
//!
//! ```bash
//! # List backends
//! talkstore types
//!
//! # Check configuration for a backend
//! talkstore validate --backend postgres
//!
//! # Health and statistics of the configured backend
//! talkstore health
//! talkstore stats
//!
//! # Snapshot every collection
//! talkstore export --output backup.json
//!
//! # Load documents: {"events": [{...}], "talks": [{...}]}
//! talkstore seed seed.json
//! ```
//!
//! Configuration comes from the environment (and `.env`), see
//! `talkstore::StorageConfig::from_env`.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::Value;
use talkstore::{
    supported_types, Collection, StorageConfig, StorageError, StorageFactory, StorageHandle,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "talkstore")]
#[command(about = "Storage backend operations", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List supported backends
    Types,
    /// Validate the configuration
    Validate {
        /// Backend to validate instead of DATABASE_TYPE
        #[arg(long)]
        backend: Option<String>,
    },
    /// Show backend health
    Health,
    /// Show record counts and query statistics
    Stats,
    /// Export every collection as JSON
    Export {
        /// Write to this file instead of stdout
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Create documents from a JSON file keyed by collection
    Seed {
        /// Seed file
        file: PathBuf,
    },
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn open(config: StorageConfig) -> anyhow::Result<StorageHandle> {
    StorageHandle::open(StorageFactory::new(), config)
        .await
        .context("failed to open storage")
}

async fn seed(handle: &StorageHandle, file: &Path) -> anyhow::Result<usize> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let value: Value = serde_json::from_str(&raw).context("seed file is not valid JSON")?;
    let Value::Object(collections) = value else {
        bail!("seed file must be an object keyed by collection");
    };

    let backend = handle.backend();
    let mut created = 0;
    for (name, docs) in collections {
        let collection: Collection = name.parse()?;
        let Value::Array(docs) = docs else {
            bail!("{name} must be an array of documents");
        };
        for doc in docs {
            let Value::Object(fields) = doc else {
                bail!("{name} contains a non-object document");
            };
            match backend.create(collection, fields).await {
                Ok(_) => created += 1,
                Err(StorageError::DuplicateKey { id, .. }) => {
                    tracing::warn!(collection = %collection, id = %id, "already exists, skipped");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
    Ok(created)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();
    init_tracing(cli.verbose);

    let config = StorageConfig::from_env().context("invalid storage configuration")?;

    match cli.command {
        Commands::Types => {
            println!("{}", serde_json::to_string_pretty(&supported_types())?);
        }
        Commands::Validate { backend } => {
            let report = StorageFactory::new().validate_configuration(&config, backend.as_deref());
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.valid {
                std::process::exit(1);
            }
        }
        Commands::Health => {
            let handle = open(config).await?;
            let health = handle.backend().health().await?;
            println!("{}", serde_json::to_string_pretty(&health)?);
            handle.close().await?;
        }
        Commands::Stats => {
            let handle = open(config).await?;
            let stats = handle.backend().performance_stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            handle.close().await?;
        }
        Commands::Export { output } => {
            let handle = open(config).await?;
            let export = handle.backend().export_data().await?;
            let json = serde_json::to_string_pretty(&export)?;
            match output {
                Some(path) => std::fs::write(&path, json)
                    .with_context(|| format!("failed to write {}", path.display()))?,
                None => println!("{json}"),
            }
            handle.close().await?;
        }
        Commands::Seed { file } => {
            let handle = open(config).await?;
            let result = seed(&handle, &file).await;
            handle.close().await?;
            let created = result?;
            println!("created {created} documents");
        }
    }

    Ok(())
}
