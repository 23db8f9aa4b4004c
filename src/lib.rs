//! # emitter
//!
//! Maps human-entered German product and activity descriptions onto a
//! fixed life-cycle-inventory catalogue and computes CO₂-equivalent
//! emission factors, driven by hybrid retrieval and an LLM decision
//! oracle.
//!
//! ## Architecture
//!
//! Each input row runs through the same pipeline:
//!
//! ```text
//!                    ┌──────────────┐
//!                    │  Input Row    │
//!                    └──────┬───────┘
//!                           │ normalise (text, region, unit)
//!                           ▼
//!              ┌─────────────────────────┐
//!              │   Hybrid Retrieval       │
//!              │  BM25 + 384-dim vectors  │
//!              │  RRF (k=60), pool 100    │
//!              │  region + unit re-rank   │
//!              │  top 20 candidates       │
//!              └────────────┬────────────┘
//!                           │
//!                           ▼
//!              ┌─────────────────────────┐
//!              │   LLM Decision Oracle    │
//!              │  match | ambiguous |     │
//!              │  decompose (3-10 parts)  │
//!              └──┬────────┬─────────┬───┘
//!                 │        │         │
//!          match  │  ambiguous   decompose
//!                 │        │         │
//!                 │   review: suspend│ per component:
//!                 │   auto: rank 1   │ retrieve + decide
//!                 │        │         │ (no nesting)
//!                 ▼        ▼         ▼
//!              ┌─────────────────────────┐
//!              │   Unit Reconciliation    │
//!              │  LLM multiplier when the │
//!              │  dataset unit differs    │
//!              └────────────┬────────────┘
//!                           │
//!                           ▼
//!              ┌─────────────────────────┐
//!              │   Emission Calculation   │
//!              │  factor × q (/1000 → t)  │
//!              │  Beschreibung, Quelle,   │
//!              │  detailed provenance     │
//!              └─────────────────────────┘
//! ```
//!
//! Rows are processed by a fixed worker pool; one process-wide token
//! bucket paces all LLM calls. Ambiguous rows suspend until an external
//! resolution picks one of the saved candidates.
//!
//! ## Module Overview
//!
//! - [`config`] - Environment-based configuration for data paths, LLM and retrieval settings
//! - [`models`] - Shared data types: catalogue entries, jobs, rows, decisions, results
//! - [`error`] - The row-level error domain
//! - [`normalize`] - Text/region/unit normalisation and German→English term expansion
//! - [`catalog`] - Read-only catalogue store over the precomputed artifacts
//! - [`search::bm25`] - Lexical index powered by tantivy
//! - [`search::vector`] - In-memory vector index with cosine similarity and disk persistence
//! - [`search::retrieve`] - Hybrid retrieval with reciprocal rank fusion and re-ranking
//! - [`llm`] - Chat transport, decision oracle, unit conversion and embeddings
//! - [`pipeline`] - Emission arithmetic, output formatting, row orchestration, batch scheduling
//! - [`jobs`] - SQLite-backed job store

pub mod catalog;
pub mod config;
pub mod error;
pub mod jobs;
pub mod llm;
pub mod models;
pub mod normalize;
pub mod pipeline;
pub mod search;
