//! # sourcebase CLI (`sb`)
//!
//! The `sb` binary drives the engine from the command line: corpus
//! initialization, document ingestion and deletion, listing, semantic
//! search, cited chat, and the repair sweep.
//!
//! ## Usage
//!
//! ```bash
//! sb --config ./sourcebase.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `sb init` | Create the database and storage directories |
//! | `sb ingest <file> --title ...` | Ingest a document |
//! | `sb update <id> <file>` | Replace a document's content |
//! | `sb list` | List indexed documents |
//! | `sb get <id>` | Show one document's metadata and chunks |
//! | `sb delete <id>` | Delete a document everywhere |
//! | `sb search "<query>"` | Semantic search with optional filters |
//! | `sb chat "<question>"` | Ask a question, get a cited answer |
//! | `sb repair` | Run the reconciliation sweep |

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

use sourcebase::catalog::MetadataPatch;
use sourcebase::config;
use sourcebase::models::{DeclaredMetadata, DocumentFilter, DocumentType, PublicationDate};
use sourcebase::Engine;

/// sourcebase — a personal-corpus RAG engine with verifiable citations.
#[derive(Parser)]
#[command(
    name = "sb",
    about = "sourcebase — ingest your documents, search them semantically, and chat with citations",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./sourcebase.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the corpus: database schema and blob directory.
    ///
    /// Idempotent — running it again is safe.
    Init,

    /// Ingest a document file.
    Ingest {
        /// Path to the document (pdf, docx, html, txt).
        file: PathBuf,

        /// Document title.
        #[arg(long)]
        title: String,

        /// Author name.
        #[arg(long)]
        author: Option<String>,

        /// Publication date, `YYYY` or `YYYY-MM-DD`.
        #[arg(long)]
        date: Option<String>,

        /// Document type; inferred from the file extension when omitted.
        #[arg(long = "type")]
        doc_type: Option<String>,
    },

    /// Replace an existing document's content (and declared metadata).
    Update {
        /// Document UUID.
        id: String,

        /// Path to the replacement file.
        file: PathBuf,

        /// New title; the old one is kept when omitted.
        #[arg(long)]
        title: Option<String>,

        /// New author.
        #[arg(long)]
        author: Option<String>,

        /// New publication date, `YYYY` or `YYYY-MM-DD`.
        #[arg(long)]
        date: Option<String>,
    },

    /// Edit a document's metadata without re-ingesting content.
    Edit {
        /// Document UUID.
        id: String,

        #[arg(long)]
        title: Option<String>,

        #[arg(long)]
        author: Option<String>,

        /// Publication date, `YYYY` or `YYYY-MM-DD`.
        #[arg(long)]
        date: Option<String>,
    },

    /// List indexed documents, newest first.
    List {
        /// Filter by author (exact match).
        #[arg(long)]
        author: Option<String>,

        /// Filter by type (pdf, docx, html, txt).
        #[arg(long = "type")]
        doc_type: Option<String>,

        /// Only documents published on or after this date.
        #[arg(long)]
        from: Option<String>,

        /// Only documents published on or before this date.
        #[arg(long)]
        to: Option<String>,

        /// Maximum number of rows.
        #[arg(long, default_value_t = 50)]
        limit: u32,

        /// Rows to skip (pagination).
        #[arg(long, default_value_t = 0)]
        offset: u32,
    },

    /// Show one document's metadata and chunks.
    Get {
        /// Document UUID.
        id: String,
    },

    /// Delete a document from content store, catalog, and index.
    Delete {
        /// Document UUID.
        id: String,
    },

    /// Semantic search over the corpus.
    Search {
        /// The query text.
        query: String,

        #[arg(long)]
        author: Option<String>,

        #[arg(long = "type")]
        doc_type: Option<String>,

        #[arg(long)]
        from: Option<String>,

        #[arg(long)]
        to: Option<String>,

        /// Number of results.
        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Ask a question; the answer carries citations into your documents.
    Chat {
        /// The question.
        question: String,

        #[arg(long)]
        author: Option<String>,

        #[arg(long = "type")]
        doc_type: Option<String>,

        #[arg(long)]
        from: Option<String>,

        #[arg(long)]
        to: Option<String>,

        /// Evidence chunks to retrieve.
        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Run the reconciliation sweep: collect orphans, fix vector drift.
    Repair,
}

fn parse_filter(
    author: Option<String>,
    doc_type: Option<String>,
    from: Option<String>,
    to: Option<String>,
) -> Result<DocumentFilter> {
    Ok(DocumentFilter {
        author,
        doc_type: doc_type.as_deref().map(DocumentType::parse).transpose()?,
        date_from: from.as_deref().map(PublicationDate::parse).transpose()?,
        date_to: to.as_deref().map(PublicationDate::parse).transpose()?,
    })
}

fn parse_id(id: &str) -> Result<Uuid> {
    Uuid::parse_str(id).with_context(|| format!("'{id}' is not a valid document UUID"))
}

fn doc_type_for(file: &std::path::Path, declared: Option<&str>) -> Result<DocumentType> {
    if let Some(declared) = declared {
        return Ok(DocumentType::parse(declared)?);
    }
    let ext = file
        .extension()
        .and_then(|e| e.to_str())
        .context("file has no extension; pass --type")?;
    Ok(DocumentType::parse(ext)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("sourcebase=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    let engine = Engine::open(cfg).await?;

    let result = run(&engine, cli.command).await;
    engine.close().await;
    result
}

async fn run(engine: &Engine, command: Commands) -> Result<()> {
    match command {
        Commands::Init => {
            // Engine::open created the schema and directories already.
            println!("corpus initialized");
        }

        Commands::Ingest {
            file,
            title,
            author,
            date,
            doc_type,
        } => {
            let doc_type = doc_type_for(&file, doc_type.as_deref())?;
            let bytes = std::fs::read(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let metadata = DeclaredMetadata {
                title,
                author,
                publication_date: date.as_deref().map(PublicationDate::parse).transpose()?,
                doc_type,
            };
            let id = engine.ingest(&bytes, &metadata).await?;
            let doc = engine.get(id).await?;
            println!("ingested {}", id);
            println!("  chunks: {}", doc.chunk_count);
        }

        Commands::Update {
            id,
            file,
            title,
            author,
            date,
        } => {
            let id = parse_id(&id)?;
            let existing = engine.get(id).await?;
            let doc_type = doc_type_for(&file, None).unwrap_or(existing.doc_type);
            let bytes = std::fs::read(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let metadata = DeclaredMetadata {
                title: title.unwrap_or(existing.title),
                author: author.or(existing.author),
                publication_date: date
                    .as_deref()
                    .map(PublicationDate::parse)
                    .transpose()?
                    .or(existing.publication_date),
                doc_type,
            };
            engine.reingest(id, &bytes, &metadata).await?;
            let doc = engine.get(id).await?;
            println!("updated {}", id);
            println!("  chunks: {}", doc.chunk_count);
        }

        Commands::Edit {
            id,
            title,
            author,
            date,
        } => {
            let id = parse_id(&id)?;
            let patch = MetadataPatch {
                title,
                author,
                publication_date: date.as_deref().map(PublicationDate::parse).transpose()?,
            };
            let doc = engine.update_metadata(id, &patch).await?;
            println!("updated metadata for {}", doc.id);
        }

        Commands::List {
            author,
            doc_type,
            from,
            to,
            limit,
            offset,
        } => {
            let filter = parse_filter(author, doc_type, from, to)?;
            let docs = engine.list(&filter, limit, offset).await?;
            if docs.is_empty() {
                println!("No documents.");
                return Ok(());
            }
            for doc in docs {
                let author = doc.author.as_deref().unwrap_or("-");
                let date = doc
                    .publication_date
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{}  [{}] {} / {} / {}  ({} chunks, added {})",
                    doc.id,
                    doc.doc_type,
                    doc.title,
                    author,
                    date,
                    doc.chunk_count,
                    doc.date_added.format("%Y-%m-%d"),
                );
            }
        }

        Commands::Get { id } => {
            let id = parse_id(&id)?;
            let doc = engine.get(id).await?;
            println!("{}", serde_json::to_string_pretty(&doc)?);
            let chunks = engine.get_chunks(id).await?;
            for chunk in chunks {
                let page = chunk
                    .anchor
                    .page
                    .map(|p| format!(" p.{p}"))
                    .unwrap_or_default();
                println!(
                    "--- chunk {} [{}..{}{}]",
                    chunk.id.seq, chunk.anchor.start, chunk.anchor.end, page
                );
                println!("{}", chunk.text);
            }
        }

        Commands::Delete { id } => {
            let id = parse_id(&id)?;
            engine.delete(id).await?;
            println!("deleted {}", id);
        }

        Commands::Search {
            query,
            author,
            doc_type,
            from,
            to,
            top_k,
        } => {
            let filter = parse_filter(author, doc_type, from, to)?;
            let results = engine.search(&query, &filter, top_k).await?;
            if results.is_empty() {
                println!("No results.");
                return Ok(());
            }
            for result in results {
                let page = result
                    .anchor
                    .page
                    .map(|p| format!(", p.{p}"))
                    .unwrap_or_default();
                println!(
                    "{}. [{:.3}] {} (chunk {}{})",
                    result.rank, result.score, result.title, result.chunk_id.seq, page
                );
                println!("    excerpt: \"{}\"", result.snippet.replace('\n', " "));
                println!("    id: {}", result.document_id);
                println!();
            }
        }

        Commands::Chat {
            question,
            author,
            doc_type,
            from,
            to,
            top_k,
        } => {
            let filter = parse_filter(author, doc_type, from, to)?;
            let answer = engine.chat(&question, &filter, top_k).await?;
            println!("{}", answer.answer);
            if !answer.citations.is_empty() {
                println!();
                println!("Sources:");
                for citation in &answer.citations {
                    let page = citation
                        .anchor
                        .page
                        .map(|p| format!(", p.{p}"))
                        .unwrap_or_default();
                    println!(
                        "  [{}] {} (chunk {}{}): {}",
                        citation.marker, citation.title, citation.chunk_seq, page,
                        citation.document_id
                    );
                }
            }
        }

        Commands::Repair => {
            let report = engine.repair().await?;
            if report.is_clean() {
                println!("corpus is consistent");
            } else {
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
        }
    }

    Ok(())
}
