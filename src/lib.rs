//! # CPF Bot
//!
//! A retrieval-augmented claim verifier for Singapore CPF policy documents.
//!
//! CPF Bot loads a curated corpus of PDF, text and markdown files, splits it
//! into overlapping chunks, embeds them into a local SQLite index and answers
//! user claims with a cited, document-grounded response.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌──────────┐
//! │   Loader    │──▶│   Ingest    │──▶│  SQLite  │
//! │ sample_docs │   │ Chunk+Embed │   │  chunks  │
//! │   uploads   │   └─────────────┘   └────┬─────┘
//! └─────────────┘                          │ retrieve
//!                                          ▼
//!                 ┌──────────┐       ┌──────────┐
//!  claim ────────▶│ Screening│──────▶│  Answer  │──▶ AnswerRecord
//!                 └──────────┘       │  (chat)  │        │
//!                                    └──────────┘        ▼
//!                                  CLI / HTTP ◀──── export
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! cpfbot init                   # create folders and database
//! cpfbot index                  # rebuild the knowledge base
//! cpfbot ask "The minimum retirement sum increases annually"
//! cpfbot serve                  # start the web UI and JSON API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and `.env` loading |
//! | [`models`] | Core data types |
//! | [`extract`] | Text extraction from PDF, text and markdown |
//! | [`loader`] | Corpus discovery and uploads |
//! | [`chunk`] | Overlapping character chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | Persistent vector collection |
//! | [`ingest`] | Rebuild and append pipeline |
//! | [`retrieve`] | Top-k cosine similarity search |
//! | [`screening`] | Length limit and injection denylist |
//! | [`generation`] | Chat completion providers |
//! | [`answer`] | Prompt assembly and the [`answer::Verifier`] facade |
//! | [`export`] | Plain-text response export |
//! | [`auth`] | App and admin password gates |
//! | [`server`] | HTTP server and UI |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod answer;
pub mod auth;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod export;
pub mod extract;
pub mod generation;
pub mod index;
pub mod ingest;
pub mod loader;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod retrieve;
pub mod screening;
pub mod server;
