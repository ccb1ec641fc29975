//! # sourcebase
//!
//! A personal-corpus RAG engine: ingest your own documents, index them for
//! hybrid retrieval, and query them through an LLM with every answer
//! traceable back to specific source passages.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────────────────────────┐   ┌───────────────┐
//! │  bytes + │──▶│     Ingestion Coordinator      │──▶│ Content Store  │
//! │ metadata │   │ extract → chunk → embed →      │   ├───────────────┤
//! └──────────┘   │ publish vectors → commit row   │──▶│ Vector Index   │
//!                └───────────────────────────────┘   ├───────────────┤
//!                                                 ──▶│ Metadata       │
//!                ┌───────────────────────────────┐   │ Catalog        │
//! ┌──────────┐   │   Retrieval / RAG Orchestrator │◀──┴───────────────┘
//! │ question │──▶│ pre-filter → k-NN → dedup →    │
//! └──────────┘   │ grounded prompt → citations    │
//!                └───────────────────────────────┘
//! ```
//!
//! The three stores are kept consistent by write ordering: the catalog row
//! is written last during ingestion and removed last during deletion, so a
//! document is only ever fully visible or not visible at all.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and backend selection |
//! | [`error`] | Typed error taxonomy with machine-readable kinds |
//! | [`models`] | Core data types |
//! | [`content`] | Content (blob) store backends |
//! | [`catalog`] | Relational metadata catalog backends |
//! | [`extract`] | Per-format text extraction |
//! | [`chunker`] | Offset-anchored chunking strategies |
//! | [`embedding`] | Embedding providers and gateway |
//! | [`llm`] | LLM completion providers |
//! | [`index`] | Vector index backends |
//! | [`ingest`] | Ingestion saga / coordinator |
//! | [`retrieve`] | Hybrid retrieval |
//! | [`rag`] | Grounded prompting and citation resolution |
//! | [`reconcile`] | Repair sweep |
//! | [`engine`] | Composition root and exposed operations |

pub mod catalog;
pub mod chunker;
pub mod config;
pub mod content;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod extract;
pub mod index;
pub mod ingest;
pub mod llm;
pub mod models;
pub mod rag;
pub mod reconcile;
pub mod retrieve;

pub use engine::Engine;
pub use error::{Error, Result};
