//! tessera-bulk — apply a JSON array of documents to a RocksDB store.
//!
//! ```text
//! tessera-bulk <DB_DIR> <DOCS_JSON> [--replicate] [--rev-limit N]
//! ```
//!
//! Prints one result per document, in input order, as a JSON array.
//! Attachment files go to `<db-dir>/<db-name>_file`.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info};
use serde_json::Value;
use tessera_store::{
    doc_id, result_to_json, AttachmentConfig, AttachmentStore, BatchOptions, BulkWriter,
    DocumentStore, StoreConfig,
};

#[derive(Parser)]
#[command(name = "tessera-bulk")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Apply a JSON array of documents to a tessera store")]
struct Cli {
    /// Database directory (created if missing)
    #[arg(value_name = "DB_DIR")]
    db: PathBuf,

    /// JSON file holding an array of documents
    #[arg(value_name = "DOCS_JSON")]
    input: PathBuf,

    /// Apply documents as replicated history instead of new edits
    #[arg(long)]
    replicate: bool,

    /// Generations kept per revision path (0 means the default)
    #[arg(long, value_name = "N", default_value_t = tessera_core::DEFAULT_REV_LIMIT)]
    rev_limit: usize,
}

impl Cli {
    fn batch_options(&self) -> BatchOptions {
        BatchOptions {
            new_edits: !self.replicate,
            rev_limit: self.rev_limit,
            ..BatchOptions::default()
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(msg) => {
            error!("{msg}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Cli) -> Result<(), String> {
    let raw = tokio::fs::read(&args.input)
        .await
        .map_err(|e| format!("cannot read {}: {e}", args.input.display()))?;
    let docs: Vec<Value> =
        serde_json::from_slice(&raw).map_err(|e| format!("input is not a JSON array: {e}"))?;

    let name = args
        .db
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "db".to_string());
    let base = args.db.parent().map(PathBuf::from).unwrap_or_default();

    let store = DocumentStore::open(StoreConfig {
        path: args.db.clone(),
        sync_writes: true,
        ..StoreConfig::default()
    })
    .map_err(|e| e.to_string())?;
    let attachments = AttachmentStore::open(AttachmentConfig::for_database(&base, &name))
        .await
        .map_err(|e| e.to_string())?;
    let writer = BulkWriter::new(store, attachments);

    let ids: Vec<Option<String>> = docs.iter().map(|d| doc_id(d).map(str::to_string)).collect();
    let outcome = writer.bulk_docs(docs, &args.batch_options()).await;

    let rows: Vec<Value> = ids
        .iter()
        .zip(&outcome.results)
        .map(|(id, result)| result_to_json(id.as_deref(), result))
        .collect();
    let out = serde_json::to_string_pretty(&rows).map_err(|e| e.to_string())?;
    println!("{out}");

    info!(
        "Applied {} documents, count delta {}, {} live documents",
        rows.len(),
        outcome.doc_count_delta,
        writer.backend().doc_count()
    );
    Ok(())
}
