use anyhow::{Context, Result};
use std::path::Path;
use tantivy::collector::TopDocs;
use tantivy::query::QueryParser;
use tantivy::schema::*;
use tantivy::{doc, Index, IndexWriter, ReloadPolicy};

use crate::models::CatalogueEntry;

/// BM25 index over the searchable (non-market) catalogue rows, built on
/// tantivy. In production the index directory is a precomputed artifact;
/// `index_entries` exists for the build step and for tests.
pub struct Bm25Index {
    index: Index,
    f_uuid: Field,
    f_text: Field,
}

impl Bm25Index {
    /// Create or open the index at the given directory.
    pub fn open_or_create(index_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(index_dir)?;

        let mut schema_builder = Schema::builder();
        let f_uuid = schema_builder.add_text_field("uuid", STRING | STORED);
        let f_text = schema_builder.add_text_field("text", TEXT);
        let schema = schema_builder.build();

        let index = if index_dir.join("meta.json").exists() {
            Index::open_in_dir(index_dir).context("Failed to open existing tantivy index")?
        } else {
            Index::create_in_dir(index_dir, schema).context("Failed to create tantivy index")?
        };

        Ok(Self {
            index,
            f_uuid,
            f_text,
        })
    }

    /// Index a batch of catalogue entries. Market rows are skipped so the
    /// index only ever yields searchable activities.
    pub fn index_entries(&self, entries: &[CatalogueEntry]) -> Result<()> {
        let mut writer: IndexWriter = self
            .index
            .writer(50_000_000)
            .context("Failed to create index writer")?;

        for entry in entries.iter().filter(|e| !e.is_market) {
            writer.add_document(doc!(
                self.f_uuid => entry.uuid.clone(),
                self.f_text => entry.searchable_text.clone(),
            ))?;
        }

        writer.commit().context("Failed to commit index")?;
        Ok(())
    }

    /// Search the index, returning `(uuid, bm25_score)` pairs best-first.
    pub fn search(&self, query_str: &str, limit: usize) -> Result<Vec<(String, f32)>> {
        let sanitized = sanitize_query(query_str);
        if sanitized.is_empty() {
            return Ok(Vec::new());
        }

        let reader = self
            .index
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommitWithDelay)
            .try_into()
            .context("Failed to create reader")?;

        let searcher = reader.searcher();

        let query_parser = QueryParser::for_index(&self.index, vec![self.f_text]);
        let query = query_parser
            .parse_query(&sanitized)
            .context("Failed to parse search query")?;

        let top_docs = searcher
            .search(&query, &TopDocs::with_limit(limit))
            .context("Search failed")?;

        let mut hits = Vec::with_capacity(top_docs.len());
        for (score, doc_address) in top_docs {
            let doc: TantivyDocument = searcher
                .doc(doc_address)
                .context("Failed to retrieve document")?;
            let uuid = doc
                .get_first(self.f_uuid)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            if uuid.is_empty() {
                continue;
            }
            hits.push((uuid, score));
        }

        Ok(hits)
    }
}

/// Strip query-syntax characters so free text never trips the parser.
fn sanitize_query(query: &str) -> String {
    let cleaned: String = query
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}
