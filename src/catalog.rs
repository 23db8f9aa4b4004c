//! Read-only access to the reference catalogue and its precomputed
//! search artifacts.
//!
//! Three artifacts live in the data directory, all produced by the
//! external index build step: `catalogue.json` (the dataset rows), a
//! tantivy index over the searchable rows (the BM25 artifact) and
//! `vectors/vectors.json` (the embedding artifact). The store is loaded
//! once at startup and shared behind an `Arc`; nothing here mutates
//! after load.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;

use crate::models::CatalogueEntry;
use crate::search::bm25::Bm25Index;
use crate::search::vector::VectorStore;

pub struct CatalogStore {
    entries: Vec<CatalogueEntry>,
    by_uuid: HashMap<String, usize>,
    bm25: Bm25Index,
    vectors: VectorStore,
}

impl CatalogStore {
    /// Load the catalogue rows and open both search artifacts.
    pub fn load(catalogue_path: &Path, index_dir: &Path, vector_dir: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(catalogue_path).with_context(|| {
            format!("Failed to read catalogue from {}", catalogue_path.display())
        })?;
        let entries: Vec<CatalogueEntry> =
            serde_json::from_str(&data).context("Failed to parse catalogue JSON")?;

        let mut by_uuid = HashMap::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            if by_uuid.insert(entry.uuid.clone(), i).is_some() {
                anyhow::bail!("Duplicate catalogue uuid: {}", entry.uuid);
            }
        }

        let bm25 = Bm25Index::open_or_create(index_dir)?;
        let vectors = VectorStore::open_or_create(vector_dir)?;

        let searchable = entries.iter().filter(|e| !e.is_market).count();
        tracing::info!(
            total = entries.len(),
            searchable,
            "Catalogue loaded ({} market rows excluded from search)",
            entries.len() - searchable
        );

        Ok(Self {
            entries,
            by_uuid,
            bm25,
            vectors,
        })
    }

    pub fn by_uuid(&self, uuid: &str) -> Option<&CatalogueEntry> {
        self.by_uuid.get(uuid).map(|&i| &self.entries[i])
    }

    /// Top-k lexical hits as `(uuid, bm25_score)`, best first.
    pub fn lexical_search(&self, query: &str, k: usize) -> Result<Vec<(String, f32)>> {
        self.bm25.search(query, k)
    }

    /// Top-k cosine hits as `(uuid, score)`, best first.
    pub fn vector_search(&self, query_embedding: &[f32], k: usize) -> Vec<(String, f32)> {
        self.vectors.search(query_embedding, k)
    }

    /// All non-market rows, in catalogue order.
    pub fn all_searchable(&self) -> impl Iterator<Item = &CatalogueEntry> {
        self.entries.iter().filter(|e| !e.is_market)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
