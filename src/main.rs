// ABOUTME: CLI entry point for object-replicator
// ABOUTME: Validates mapping files and replicates JSON-lines records into a store snapshot

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use object_replicator::{MappingFile, MemoryStore, ObjectStore, ReplicationRun, Value};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "object-replicator")]
#[command(about = "Declarative upsert of flat records into an object store", long_about = None)]
#[command(version)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that a mapping file describes a valid replication
    Validate {
        /// Path to the mapping TOML file
        #[arg(long, env = "OBJECT_REPLICATOR_CONFIG")]
        config: PathBuf,
    },
    /// Replicate records into a store snapshot
    Run {
        /// Path to the mapping TOML file
        #[arg(long, env = "OBJECT_REPLICATOR_CONFIG")]
        config: PathBuf,
        /// JSON-lines file with one {"record", "field", "value"} object per line
        #[arg(long)]
        input: PathBuf,
        /// JSON store snapshot, created when missing
        #[arg(long)]
        store: PathBuf,
        /// Id of the object every record is linked to through the parent association
        #[arg(long)]
        parent_id: Option<u64>,
        /// Replicate without saving the store
        #[arg(long)]
        dry_run: bool,
    },
}

/// One staged value from the input file.
#[derive(Debug, Deserialize)]
struct InputLine {
    record: String,
    field: String,
    #[serde(default)]
    value: serde_json::Value,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --log
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    match cli.command {
        Commands::Validate { config } => validate(&config),
        Commands::Run {
            config,
            input,
            store,
            parent_id,
            dry_run,
        } => run(&config, &input, &store, parent_id, dry_run).await,
    }
}

fn validate(config: &Path) -> anyhow::Result<()> {
    let settings = MappingFile::load(config)?
        .into_settings()
        .with_context(|| format!("Mapping file {:?} is not valid", config))?;
    tracing::info!(
        "Mapping {:?} is valid: {} fields into {} ({} associations)",
        config,
        settings.routes().count(),
        settings.main().object_type(),
        settings.associations().count()
    );
    println!("Mapping is valid");
    Ok(())
}

async fn run(
    config: &Path,
    input: &Path,
    store_path: &Path,
    parent_id: Option<u64>,
    dry_run: bool,
) -> anyhow::Result<()> {
    let mut settings = MappingFile::load(config)?
        .into_settings()
        .with_context(|| format!("Mapping file {:?} is not valid", config))?;
    if parent_id.is_some() {
        settings.set_parent_object_id(parent_id)?;
    }

    let lines = tokio::fs::read_to_string(input)
        .await
        .with_context(|| format!("Failed to read input file {:?}", input))?;
    let store = Arc::new(MemoryStore::load_or_default(store_path).await?);
    let handle: Arc<dyn ObjectStore> = Arc::clone(&store) as Arc<dyn ObjectStore>;

    let mut replication = ReplicationRun::start(settings, handle).await?;
    for (index, line) in lines.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let parsed: InputLine = serde_json::from_str(line)
            .with_context(|| format!("Invalid record on line {} of {:?}", index + 1, input))?;
        let value = json_to_value(parsed.value)
            .with_context(|| format!("Invalid value on line {} of {:?}", index + 1, input))?;
        replication
            .add_value(&parsed.record, &parsed.field, value)
            .await?;
    }
    let statistics = replication.finish().await?;

    if dry_run {
        tracing::info!("Dry run, store {:?} left untouched", store_path);
    } else {
        store.save(store_path).await?;
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&statistics).context("Failed to serialize statistics")?
    );
    Ok(())
}

/// Raw value for a JSON input value. Numbers stay untyped until the member
/// type coerces them.
fn json_to_value(value: serde_json::Value) -> anyhow::Result<Value> {
    Ok(match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(v) => Value::Boolean(v),
        serde_json::Value::Number(number) => match number.as_i64() {
            Some(v) => Value::Long(v),
            None => match number.as_f64() {
                Some(v) => Value::Float(v),
                None => bail!("Number {} is out of range", number),
            },
        },
        serde_json::Value::String(v) => Value::String(v),
        other => bail!("Unsupported value {}, expected a scalar", other),
    })
}
