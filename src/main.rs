//! # CPF claim verifier CLI (`cpfbot`)
//!
//! Builds the knowledge base from the corpus folders, answers claims from
//! the command line and starts the HTTP surface.
//!
//! ## Usage
//!
//! ```bash
//! cpfbot --config ./config/cpfbot.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `cpfbot init` | Create the corpus folders, the database and its schema |
//! | `cpfbot index` | Rebuild the index from `sample_docs` and `uploads` |
//! | `cpfbot search "<query>"` | Show the retrieved chunks only |
//! | `cpfbot ask "<claim>"` | Verify a claim and print the cited answer |
//! | `cpfbot documents` | List corpus files and index status |
//! | `cpfbot upload <file>` | Copy a PDF, text or markdown file into `uploads` |
//! | `cpfbot serve` | Start the HTTP server |
//!
//! Command output goes to stdout; logs go to stderr (`RUST_LOG` controls
//! the level).

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use cpfbot::answer::{AskRequest, Verifier};
use cpfbot::config::{self, Config};
use cpfbot::export;
use cpfbot::index::IndexStore;
use cpfbot::ingest::IndexReport;
use cpfbot::loader;
use cpfbot::logging;
use cpfbot::server;

/// CPF claim verifier: document-grounded answers with citations.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/cpfbot.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "cpfbot",
    about = "Verify claims about CPF policies against a curated document corpus",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/cpfbot.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the corpus folders, database and schema.
    ///
    /// Safe to run more than once.
    Init,

    /// Load the corpus, chunk, embed and store it.
    Index {
        /// Keep existing entries and replace only the documents found now.
        #[arg(long)]
        append: bool,
    },

    /// Retrieve the chunks most similar to a query, without generating an answer.
    Search {
        query: String,

        /// Number of chunks to retrieve (default `[retrieval].top_k`).
        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Verify a claim and print the answer with its sources.
    Ask {
        claim: String,

        /// Number of chunks to retrieve (default `[retrieval].top_k`).
        #[arg(long)]
        top_k: Option<usize>,

        /// Evidence summary to give the model alongside the claim.
        #[arg(long)]
        evidence: Option<String>,

        /// Also produce a bullet summary of the retrieved context.
        #[arg(long)]
        summarize: bool,

        /// Write the response to this file.
        #[arg(long)]
        export: Option<PathBuf>,
    },

    /// List corpus files and the state of the index.
    Documents,

    /// Copy a document into the uploads folder.
    Upload {
        path: PathBuf,

        /// Add the document to the index right away.
        #[arg(long)]
        index: bool,
    },

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();
    let cli = Cli::parse();

    config::load_env_files(&cli.config);
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => run_init(&cfg).await?,
        Commands::Index { append } => run_index(cfg, append).await?,
        Commands::Search { query, top_k } => run_search(cfg, &query, top_k).await?,
        Commands::Ask {
            claim,
            top_k,
            evidence,
            summarize,
            export,
        } => {
            let request = AskRequest {
                claim,
                top_k,
                evidence,
                summarize,
            };
            run_ask(cfg, &request, export.as_deref()).await?;
        }
        Commands::Documents => run_documents(&cfg).await?,
        Commands::Upload { path, index } => run_upload(cfg, &path, index).await?,
        Commands::Serve => server::run_server(cfg).await?,
    }

    Ok(())
}

async fn run_init(cfg: &Config) -> anyhow::Result<()> {
    cfg.ensure_directories()
        .context("Failed to create corpus directories")?;
    let store = IndexStore::open(cfg).await?;
    store.close().await;

    println!("Database initialized successfully.");
    println!("  index: {}", cfg.index.path.display());
    println!("  sample_docs: {}", cfg.corpus.sample_docs.display());
    println!("  uploads: {}", cfg.corpus.uploads.display());
    Ok(())
}

async fn run_index(cfg: Config, append: bool) -> anyhow::Result<()> {
    let verifier = Verifier::open(cfg).await?;
    let report = if append {
        let corpus = loader::load_corpus(verifier.config())?;
        let mut report = verifier.append(&corpus.documents).await?;
        report.skipped = corpus.skipped;
        report
    } else {
        verifier.rebuild().await?
    };
    print_report(&report);
    verifier.store().close().await;
    Ok(())
}

fn print_report(report: &IndexReport) {
    let mode = match report.mode {
        cpfbot::ingest::BuildMode::Rebuild => "rebuild",
        cpfbot::ingest::BuildMode::Append => "append",
    };
    println!("index {} ({})", report.collection, mode);
    println!("  documents: {}", report.documents);
    println!("  chunks embedded: {}", report.embedded);
    println!("  chunks in index: {}", report.total_chunks);
    println!("  embedding model: {}", report.embedding_model);
    println!("  generation: {}", report.generation);
    for s in &report.skipped {
        println!("  skipped: {}/{} ({})", s.folder, s.file, s.reason);
    }
    if report.total_chunks == 0 {
        println!("  notice: the corpus is empty; add documents to sample_docs or uploads and re-run `cpfbot index`");
    }
    println!("ok");
}

async fn run_search(cfg: Config, query: &str, top_k: Option<usize>) -> anyhow::Result<()> {
    let verifier = Verifier::open(cfg).await?;
    let results = verifier.search(query, top_k).await?;

    for (i, r) in results.iter().enumerate() {
        println!(
            "{}. [{:.3}] {} (chunk {})",
            i + 1,
            r.score,
            r.chunk.source_id,
            r.chunk.chunk_index
        );
        println!("    {}", snippet(&r.chunk.text, 200));
    }
    verifier.store().close().await;
    Ok(())
}

async fn run_ask(cfg: Config, request: &AskRequest, export_path: Option<&Path>) -> anyhow::Result<()> {
    let verifier = Verifier::open(cfg).await?;
    let record = verifier.ask(request).await?;

    for warning in &record.warnings {
        println!("Warning: {}", warning);
    }
    println!("Answer:");
    println!("{}", record.answer);

    if let Some(summary) = &record.summary {
        println!();
        println!("Evidence summary:");
        println!("{}", summary);
    }

    println!();
    println!("Sources:");
    for (i, c) in record.citations.iter().enumerate() {
        println!(
            "  {}. {} (chunk {}) score {:.3}",
            i + 1,
            c.source_id,
            c.chunk_index,
            c.score
        );
    }

    if let Some(path) = export_path {
        let written = export::write_to(path, &record)?;
        println!();
        println!("Exported to {}", written.display());
    }

    verifier.store().close().await;
    Ok(())
}

async fn run_documents(cfg: &Config) -> anyhow::Result<()> {
    let entries = loader::list_documents(cfg)?;
    if entries.is_empty() {
        println!("No documents found.");
    } else {
        println!("{:<40} {:<12} {:>10}", "FILE", "FOLDER", "SIZE_KB");
        for e in &entries {
            println!("{:<40} {:<12} {:>10.2}", e.file, e.folder, e.size_kb);
        }
    }

    let store = IndexStore::open(cfg).await?;
    match store.collection_info(&cfg.index.collection).await? {
        Some(info) => println!(
            "index: {} chunks, model {} ({} dims), generation {}",
            info.chunk_count, info.embedding_model, info.dims, info.generation
        ),
        None => println!("index: not built (run `cpfbot index`)"),
    }
    store.close().await;
    Ok(())
}

async fn run_upload(cfg: Config, path: &Path, index: bool) -> anyhow::Result<()> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let saved = loader::save_upload(&cfg, &filename, &bytes)?;
    println!("Saved {} ({} bytes)", saved.display(), bytes.len());

    if index {
        let doc = loader::load_file(&saved, &cfg.corpus.uploads, "uploads")?;
        let verifier = Verifier::open(cfg).await?;
        let report = verifier.append(&[doc]).await?;
        print_report(&report);
        verifier.store().close().await;
    }
    Ok(())
}

/// First `max` characters of `text` on one line.
fn snippet(text: &str, max: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max {
        flat
    } else {
        format!("{}...", flat.chars().take(max).collect::<String>())
    }
}
