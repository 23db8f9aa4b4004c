//! Hybrid candidate retrieval: lexical BM25 and semantic embedding
//! search, merged by reciprocal rank fusion, then re-ranked by region
//! priority and reference-unit preference.

use crate::catalog::CatalogStore;
use crate::config::RetrievalConfig;
use crate::llm::embeddings::Embedder;
use crate::models::Candidate;
use crate::normalize::expand_terms;

/// The normalised view of one row (or one decomposition component) that
/// retrieval works on.
#[derive(Debug, Clone)]
pub struct RetrievalInput<'a> {
    pub bezeichnung_norm: &'a str,
    pub produktinfo_norm: Option<&'a str>,
    pub scope: Option<&'a str>,
    pub region_norm: &'a str,
    pub unit_norm: &'a str,
}

/// One fused hit before it becomes a `Candidate`.
#[derive(Debug, Clone)]
struct FusedHit {
    uuid: String,
    rrf_score: f64,
    bm25_rank: Option<usize>,
    vector_rank: Option<usize>,
}

impl FusedHit {
    fn best_rank(&self) -> usize {
        match (self.bm25_rank, self.vector_rank) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => usize::MAX,
        }
    }
}

/// Scope hint appended to the retrieval query, never surfaced anywhere
/// else. The catalogue names combustion datasets "... burned in ...",
/// supply datasets "market/production ...", hence the vocabulary.
pub fn scope_hint(scope: Option<&str>) -> Option<&'static str> {
    let scope = scope?;
    if scope.contains('1') {
        Some("combustion burned fuel")
    } else if scope.contains('2') {
        Some("electricity heat steam supply")
    } else if scope.contains('3') {
        Some("production manufacturing at plant")
    } else {
        None
    }
}

/// Assemble the retrieval query text: term-expanded descriptor and
/// product info, then the scope hint.
pub fn build_query(input: &RetrievalInput<'_>) -> String {
    let mut parts = vec![expand_terms(input.bezeichnung_norm)];
    if let Some(info) = input.produktinfo_norm {
        parts.push(expand_terms(info));
    }
    if let Some(hint) = scope_hint(input.scope) {
        parts.push(hint.to_string());
    }
    parts.join(" ")
}

/// Reciprocal rank fusion of the two result lists. Ranks are 1-indexed;
/// a uuid missing from one list simply contributes no term for it.
/// Ordering is deterministic: score descending, ties broken by the lower
/// best rank, then by uuid.
fn rrf_fuse(
    bm25: &[(String, f32)],
    vector: &[(String, f32)],
    rrf_k: usize,
) -> Vec<FusedHit> {
    use std::collections::HashMap;

    let mut score_map: HashMap<String, FusedHit> = HashMap::new();

    for (rank0, (uuid, _)) in bm25.iter().enumerate() {
        let rank = rank0 + 1;
        let entry = score_map.entry(uuid.clone()).or_insert_with(|| FusedHit {
            uuid: uuid.clone(),
            rrf_score: 0.0,
            bm25_rank: None,
            vector_rank: None,
        });
        entry.rrf_score += 1.0 / (rrf_k as f64 + rank as f64);
        entry.bm25_rank.get_or_insert(rank);
    }

    for (rank0, (uuid, _)) in vector.iter().enumerate() {
        let rank = rank0 + 1;
        let entry = score_map.entry(uuid.clone()).or_insert_with(|| FusedHit {
            uuid: uuid.clone(),
            rrf_score: 0.0,
            bm25_rank: None,
            vector_rank: None,
        });
        entry.rrf_score += 1.0 / (rrf_k as f64 + rank as f64);
        entry.vector_rank.get_or_insert(rank);
    }

    let mut hits: Vec<FusedHit> = score_map.into_values().collect();
    hits.sort_by(|a, b| {
        b.rrf_score
            .partial_cmp(&a.rrf_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.best_rank().cmp(&b.best_rank()))
            .then_with(|| a.uuid.cmp(&b.uuid))
    });
    hits
}

/// Priority of a candidate's geography for the requested region:
/// 0 exact, 1 global, 2 rest-of-world, 3 everything else.
fn region_priority(geography: &str, region_norm: &str) -> u8 {
    if geography == region_norm {
        0
    } else if geography == "GLO" {
        1
    } else if geography == "RoW" {
        2
    } else {
        3
    }
}

/// Run the full retrieval pipeline for one input. An embedding failure
/// degrades to lexical-only retrieval; an empty result is the caller's
/// problem (`NoCandidates`).
pub async fn retrieve(
    catalog: &CatalogStore,
    embedder: &dyn Embedder,
    input: &RetrievalInput<'_>,
    params: &RetrievalConfig,
) -> anyhow::Result<Vec<Candidate>> {
    let query = build_query(input);

    let bm25_hits = catalog.lexical_search(&query, params.pool)?;

    let vector_hits = match embedder.embed(&query).await {
        Ok(embedding) => catalog.vector_search(&embedding, params.pool),
        Err(e) => {
            tracing::warn!("Embedding failed, lexical-only retrieval for '{query}': {e}");
            Vec::new()
        }
    };

    tracing::debug!(
        bm25 = bm25_hits.len(),
        vector = vector_hits.len(),
        "Retrieval for '{query}'"
    );

    let fused = rrf_fuse(&bm25_hits, &vector_hits, params.rrf_k);

    // Resolve to catalogue rows; both indexes only cover searchable
    // entries, so every hit resolves to a non-market row.
    let mut scored: Vec<(FusedHit, u8, &crate::models::CatalogueEntry)> = fused
        .into_iter()
        .filter_map(|hit| {
            let entry = catalog.by_uuid(&hit.uuid)?;
            let prio = region_priority(&entry.geography, input.region_norm);
            Some((hit, prio, entry))
        })
        .collect();

    // Stable: preserves the fused order within each priority class.
    scored.sort_by_key(|(_, prio, _)| *prio);

    // Stable unit partition: matching reference unit first, original
    // order preserved within both halves.
    let (matching, other): (Vec<_>, Vec<_>) = scored
        .into_iter()
        .partition(|(_, _, entry)| entry.unit.eq_ignore_ascii_case(input.unit_norm));

    let candidates = matching
        .into_iter()
        .chain(other)
        .take(params.top_k)
        .enumerate()
        .map(|(i, (hit, _, entry))| {
            let mut provenance = Vec::new();
            if let Some(r) = hit.bm25_rank {
                provenance.push(format!("bm25 #{r}"));
            }
            if let Some(r) = hit.vector_rank {
                provenance.push(format!("vector #{r}"));
            }
            Candidate {
                uuid: entry.uuid.clone(),
                activity_name: entry.activity_name.clone(),
                product_name: entry.product_name.clone(),
                geography: entry.geography.clone(),
                unit: entry.unit.clone(),
                rank: i + 1,
                rationale: format!(
                    "{} | {} ({}, {}); {}",
                    entry.activity_name,
                    entry.product_name,
                    entry.geography,
                    entry.unit,
                    provenance.join(", ")
                ),
            }
        })
        .collect();

    Ok(candidates)
}
