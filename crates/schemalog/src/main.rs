//! schemalog maintenance tool
//!
//! Offline commands that work directly on log files and schema files.
//!
//! ## Usage
//!
//! ```bash
//! # Rebuild the registry state from a file log
//! schemalog replay --log /var/lib/schemalog/_schemas.log
//!
//! # Print the canonical form and fingerprint of a schema
//! schemalog canonicalize --type protobuf --file order.proto
//!
//! # Compare a reader schema with a writer schema
//! schemalog compat --type avro --reader v1.avsc --writer v2.avsc
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use schemalog::compatibility::compare;
use schemalog::config::{LogBackend, LogConfig, RegistryConfig};
use schemalog::log::{CommitLog, FileLog};
use schemalog::model::ParsedSchema;
use schemalog::reader::{LogReader, ReaderState};
use schemalog::SchemaType;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "schemalog")]
#[command(
    author,
    version,
    about = "schemalog - log-replicated schema registry tools"
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// JSON registry config; flags override its values
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a file log and print the resulting registry state
    Replay {
        /// Log file path (default: the config's file backend)
        #[arg(short, long)]
        log: Option<PathBuf>,

        /// Topic name recorded for the log
        #[arg(long)]
        topic: Option<String>,

        /// Seconds to wait for the replay to finish
        #[arg(long, default_value = "60")]
        timeout: u64,
    },

    /// Print the canonical form and fingerprint of a schema
    Canonicalize {
        /// Schema type (avro, json, protobuf)
        #[arg(short = 't', long = "type", default_value = "avro")]
        schema_type: SchemaType,

        /// Schema file path
        #[arg(short = 'f', long)]
        file: PathBuf,
    },

    /// Compare a reader schema with a writer schema
    Compat {
        /// Schema type (avro, json, protobuf)
        #[arg(short = 't', long = "type", default_value = "avro")]
        schema_type: SchemaType,

        /// Schema used to read
        #[arg(long)]
        reader: PathBuf,

        /// Schema the data was written with
        #[arg(long)]
        writer: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // stdout carries command output
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Replay {
            log,
            topic,
            timeout,
        } => {
            let mut config = match &cli.config {
                Some(path) => RegistryConfig::from_file(path)?.log,
                None => LogConfig::default(),
            };
            if let Some(topic) = topic {
                config.topic = topic;
            }
            let path = match (log, &config.backend) {
                (Some(path), _) => path,
                (None, LogBackend::File { path, .. }) => path.clone(),
                (None, LogBackend::Memory) => {
                    anyhow::bail!("no log file: pass --log or a config with a file backend")
                }
            };
            replay(path, config, Duration::from_secs(timeout)).await
        }
        Commands::Canonicalize { schema_type, file } => canonicalize(schema_type, &file),
        Commands::Compat {
            schema_type,
            reader,
            writer,
        } => compat(schema_type, &reader, &writer),
    }
}

async fn replay(path: PathBuf, config: LogConfig, timeout: Duration) -> anyhow::Result<()> {
    let log = FileLog::open(&path, config.topic.clone(), false)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    let log: Arc<dyn CommitLog> = Arc::new(log);
    let high_watermark = log.high_watermark().await?;
    info!(path = %path.display(), records = high_watermark, "Replaying log");

    let reader = Arc::new(LogReader::new(log, config));
    let handle = reader.start();
    let ready = reader.wait_until_ready(timeout).await;
    reader.shutdown();
    let _ = handle.await;

    let status = reader.status();
    let state = reader.snapshot();
    println!("reader:   {}", describe(&status));
    println!("offset:   {}", reader.next_offset());
    println!("schemas:  {}", state.schema_count());
    println!("subjects:");
    for subject in state.subjects(true) {
        let live = state.versions(&subject, false).unwrap_or_default();
        let all = state.versions(&subject, true).unwrap_or_default();
        println!(
            "  {} live={:?} deleted={:?} compatibility={}",
            subject,
            live,
            all.iter().filter(|v| !live.contains(v)).collect::<Vec<_>>(),
            state
                .compatibility(Some(&subject))
                .map(|l| l.to_string())
                .unwrap_or_else(|| "-".to_string()),
        );
    }

    ready.with_context(|| format!("replay of {} did not complete", path.display()))?;
    Ok(())
}

fn describe(status: &ReaderState) -> String {
    match status {
        ReaderState::CatchingUp => "catching up".to_string(),
        ReaderState::Ready => "ready".to_string(),
        ReaderState::Failed { offset, reason } => format!("failed at offset {}: {}", offset, reason),
    }
}

fn canonicalize(schema_type: SchemaType, file: &PathBuf) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let parsed = ParsedSchema::parse(schema_type, &text, &[])?;
    println!("{}", parsed.canonical_form());
    println!("fingerprint: {}", parsed.fingerprint(&[]).sha256_hex());
    Ok(())
}

fn compat(schema_type: SchemaType, reader: &PathBuf, writer: &PathBuf) -> anyhow::Result<()> {
    let load = |path: &PathBuf| -> anyhow::Result<ParsedSchema> {
        let text =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Ok(ParsedSchema::parse(schema_type, &text, &[])?)
    };
    let result = compare(&load(reader)?, &load(writer)?)?;

    for record in &result.records {
        println!("{}", serde_json::to_string(record)?);
    }
    if result.is_compatible() {
        println!("compatible");
        Ok(())
    } else {
        anyhow::bail!(
            "incompatible: {} breaking change(s)",
            result.incompatibilities().count()
        )
    }
}
