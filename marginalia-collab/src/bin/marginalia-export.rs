//! Print the boundary-split regions of a persisted document as JSON lines.
//!
//! ```text
//! marginalia-export <DATA_DIR> <KEY> <CHAR_LEN> [BOUNDARIES]...
//! ```
//!
//! Other settings (collapse threshold, RocksDB options) come from the
//! `MARGINALIA_*` environment variables. `RUST_LOG` controls logging.

use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::info;
use marginalia_collab::{lock_store, DocumentRegistry, DocumentStore, EngineConfig, SnapshotStore, StoreError};
use marginalia_core::{split_checked, DocumentInfo};

#[derive(Debug, Parser)]
#[command(name = "marginalia-export")]
#[command(about = "Print the boundary-split highlight regions of a stored document")]
struct Args {
    /// RocksDB directory the engine persisted into.
    #[arg(value_name = "DATA_DIR")]
    data_dir: PathBuf,
    /// Document key.
    #[arg(value_name = "KEY")]
    key: String,
    /// Length of the document text in characters.
    #[arg(value_name = "CHAR_LEN")]
    char_len: usize,
    /// Structural boundaries (paragraph starts) to split regions at.
    #[arg(value_name = "BOUNDARIES")]
    boundaries: Vec<usize>,
}

fn run(args: Args) -> Result<usize, Box<dyn std::error::Error>> {
    let mut config = EngineConfig::from_env();
    config.store.path = args.data_dir;

    let backend = Arc::new(DocumentStore::open(config.store.clone())?);
    if backend.load_metadata(&args.key)?.is_none() {
        return Err(StoreError::NotFound(args.key).into());
    }

    let registry = DocumentRegistry::with_presence_config(backend, config.presence);
    let store = registry.open(&args.key, DocumentInfo::new(args.char_len))?;
    let spans = lock_store(&store).spans();

    let regions = config.resolver().resolve(&spans);
    let pieces = split_checked(&regions, &args.boundaries)?;
    info!(
        "Exporting {}: {} highlights, {} regions, {} split regions",
        args.key,
        spans.len(),
        regions.len(),
        pieces.len()
    );

    let mut out = BufWriter::new(io::stdout().lock());
    for piece in &pieces {
        serde_json::to_writer(&mut out, piece)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(pieces.len())
}

fn main() -> ExitCode {
    env_logger::init();

    // Usage errors exit with status 2 from inside clap.
    let args = Args::parse();

    match run(args) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("marginalia-export: {e}");
            ExitCode::FAILURE
        }
    }
}
