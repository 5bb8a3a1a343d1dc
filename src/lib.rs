//! # kbchat
//!
//! A multi-tenant retrieval-augmented chat backend. Every user has a private
//! knowledge base (ingested documents and web pages) and a durable
//! conversation; each chat turn is answered from that knowledge base and the
//! turns before it.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐   ┌─────────────┐   ┌──────────────────┐
//! │ PDF / URL /   │──▶│  Ingestor   │──▶│ per-user index   │
//! │ markdown      │   │ Chunk+Embed │   │ user_<id>.sqlite │
//! └───────────────┘   └─────────────┘   └────────┬─────────┘
//!                                                │ retrieve
//!  chat turn ──▶ reformulate ──▶ retrieve ──▶ generate ──▶ persist
//!                     ▲                                      │
//!                     └──────── history (cache + log) ◀──────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] / [`migrate`] | SQLite connections and schema |
//! | [`embedding`] | Embedding providers |
//! | [`llm`] | Chat-completion providers |
//! | [`extract`] | PDF and web-page extraction |
//! | [`seed`] | Seed corpus loaded into new indexes |
//! | [`sqlite_index`] | Per-user SQLite knowledge index |
//! | [`knowledge`] | Index lifecycle, upsert and query |
//! | [`ingest`] | Ingestion pipeline |
//! | [`sqlite_history`] | SQLite chat log |
//! | [`history`] | Cached conversation history |
//! | [`responder`] | Retrieval-augmented answering |
//! | [`identity`] | Session tokens |
//! | [`service`] | Façade used by the CLI and server |
//! | [`server`] | HTTP server |
//! | [`logging`] | tracing-subscriber setup |

pub mod config;
pub mod db;
pub mod embedding;
pub mod extract;
pub mod history;
pub mod http;
pub mod identity;
pub mod ingest;
pub mod knowledge;
pub mod llm;
pub mod logging;
pub mod migrate;
pub mod responder;
pub mod seed;
pub mod server;
pub mod service;
pub mod sqlite_history;
pub mod sqlite_index;
