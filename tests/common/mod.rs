//! Shared fixtures: a small catalogue, a deterministic embedder and a
//! scripted chat transport, wired into a full pipeline environment.
#![allow(dead_code)]

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use emitter::catalog::CatalogStore;
use emitter::config::{LlmConfig, RetrievalConfig};
use emitter::jobs::JobStore;
use emitter::llm::embeddings::Embedder;
use emitter::llm::oracle::DecisionOracle;
use emitter::llm::transport::{ChatTransport, TransportError};
use emitter::models::{CatalogueEntry, InputRowCreate};
use emitter::pipeline::pacing::RateGate;
use emitter::pipeline::row::PipelineContext;
use emitter::pipeline::scheduler::BatchScheduler;
use emitter::search::bm25::Bm25Index;
use emitter::search::vector::VectorStore;

// ── catalogue fixture ───────────────────────────────────

pub const STEEL_DE: &str = "steel-de-0001";
pub const STEEL_MARKET: &str = "steel-market-0001";
pub const DIESEL_BUILDING: &str = "diesel-building-0001";
pub const DIESEL_FISHING: &str = "diesel-fishing-0001";
pub const ELECTRICITY_DE: &str = "electricity-de-0001";
pub const BEEF_GLO: &str = "beef-glo-0001";
pub const WHEAT_GLO: &str = "wheat-glo-0001";
pub const CHEESE_GLO: &str = "cheese-glo-0001";
pub const VEGETABLES_GLO: &str = "vegetables-glo-0001";
pub const PACKAGING_GLO: &str = "packaging-glo-0001";

pub fn entry(
    uuid: &str,
    activity: &str,
    product: &str,
    geography: &str,
    unit: &str,
    biogenic: f64,
    common: f64,
    is_market: bool,
) -> CatalogueEntry {
    CatalogueEntry {
        uuid: uuid.to_string(),
        activity_name: activity.to_string(),
        product_name: product.to_string(),
        geography: geography.to_string(),
        unit: unit.to_string(),
        biogenic_factor: biogenic,
        common_factor: common,
        is_market,
        searchable_text: format!("{} {}", activity.to_lowercase(), product.to_lowercase()),
    }
}

pub fn fixture_entries() -> Vec<CatalogueEntry> {
    vec![
        entry(
            STEEL_DE,
            "steel production, converter, low-alloyed",
            "steel, low-alloyed",
            "DE",
            "kg",
            0.002,
            1.8,
            false,
        ),
        entry(
            STEEL_MARKET,
            "market for steel, low-alloyed",
            "steel, low-alloyed",
            "GLO",
            "kg",
            0.002,
            2.1,
            true,
        ),
        entry(
            DIESEL_BUILDING,
            "diesel, burned in building machine",
            "diesel, burned in building machine",
            "GLO",
            "MJ",
            0.0001,
            0.075,
            false,
        ),
        entry(
            DIESEL_FISHING,
            "diesel, burned in fishing vessel",
            "diesel, burned in fishing vessel",
            "GLO",
            "MJ",
            0.0001,
            0.078,
            false,
        ),
        entry(
            ELECTRICITY_DE,
            "electricity production, hard coal",
            "electricity, high voltage",
            "DE",
            "kWh",
            0.0003,
            0.9,
            false,
        ),
        entry(
            BEEF_GLO,
            "cattle production for slaughtering, beef",
            "beef cattle, live weight",
            "GLO",
            "kg",
            0.4,
            24.0,
            false,
        ),
        entry(
            WHEAT_GLO,
            "wheat production",
            "wheat grain bun bread",
            "GLO",
            "kg",
            0.05,
            0.6,
            false,
        ),
        entry(
            CHEESE_GLO,
            "cheese production, from cow milk",
            "cheese",
            "GLO",
            "kg",
            0.2,
            9.0,
            false,
        ),
        entry(
            VEGETABLES_GLO,
            "vegetable production, lettuce tomato onion",
            "vegetables",
            "GLO",
            "kg",
            0.01,
            0.4,
            false,
        ),
        entry(
            PACKAGING_GLO,
            "packaging film production, polyethylene",
            "packaging film",
            "GLO",
            "kg",
            0.0,
            2.2,
            false,
        ),
    ]
}

// ── deterministic embedder ──────────────────────────────

/// Bag-of-words hashing into a small fixed dimension: overlapping tokens
/// produce cosine similarity, no model needed.
pub fn hash_embed(text: &str) -> Vec<f32> {
    let mut v = vec![0f32; 32];
    for token in text.split_whitespace() {
        let mut h: u32 = 2166136261;
        for b in token.bytes() {
            h ^= b as u32;
            h = h.wrapping_mul(16777619);
        }
        v[(h % 32) as usize] += 1.0;
    }
    v
}

pub struct HashEmbedder;

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        Ok(hash_embed(text))
    }
}

/// An embedder that always fails, for lexical-only degradation tests.
pub struct BrokenEmbedder;

#[async_trait]
impl Embedder for BrokenEmbedder {
    async fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
        anyhow::bail!("encoder offline")
    }
}

// ── scripted chat transport ─────────────────────────────

/// Answers with the first rule whose needle occurs in the user prompt.
/// Prompts without a matching rule fail the call with a non-retryable
/// error, which fails the row quickly and loudly.
pub struct StubChat {
    rules: Mutex<Vec<(String, String)>>,
    pub calls: Mutex<Vec<(Instant, String)>>,
    /// Optional artificial latency per call, for cancellation tests.
    pub delay: Duration,
}

impl StubChat {
    pub fn new(rules: Vec<(&str, String)>) -> Arc<Self> {
        Self::with_delay(rules, Duration::ZERO)
    }

    pub fn with_delay(rules: Vec<(&str, String)>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            rules: Mutex::new(
                rules
                    .into_iter()
                    .map(|(needle, response)| (needle.to_string(), response))
                    .collect(),
            ),
            calls: Mutex::new(Vec::new()),
            delay,
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn call_instants(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().iter().map(|(t, _)| *t).collect()
    }
}

#[async_trait]
impl ChatTransport for StubChat {
    async fn complete(&self, _system: &str, user: &str) -> Result<String, TransportError> {
        self.calls
            .lock()
            .unwrap()
            .push((Instant::now(), user.to_string()));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let rules = self.rules.lock().unwrap();
        for (needle, response) in rules.iter() {
            if user.contains(needle.as_str()) {
                return Ok(response.clone());
            }
        }
        let preview: String = user.chars().take(120).collect();
        Err(TransportError::Client {
            status: 400,
            body: format!("no stub rule matches prompt: {preview}"),
        })
    }
}

// ── canned responses ────────────────────────────────────

pub fn match_response(uuid: &str) -> String {
    format!(r#"{{"decision": "match", "match": {{"uuid": "{uuid}", "rationale": "best fit"}}}}"#)
}

pub fn ambiguous_response(options: &[(&str, &str)]) -> String {
    let opts: Vec<String> = options
        .iter()
        .map(|(uuid, why)| format!(r#"{{"uuid": "{uuid}", "why_short": "{why}"}}"#))
        .collect();
    format!(
        r#"{{"decision": "ambiguous", "ambiguous": {{"options": [{}], "rationale": "several fit"}}}}"#,
        opts.join(",")
    )
}

pub fn decompose_response(components: &[(&str, f64, &str)]) -> String {
    let comps: Vec<String> = components
        .iter()
        .map(|(name, quantity, category)| {
            format!(r#"{{"name": "{name}", "quantity": {quantity}, "category": "{category}"}}"#)
        })
        .collect();
    format!(
        r#"{{"decision": "decompose", "decompose": {{"components": [{}]}}}}"#,
        comps.join(",")
    )
}

pub fn conversion_response(factor: f64, explanation: &str) -> String {
    format!(r#"{{"conversion_factor": {factor}, "explanation": "{explanation}"}}"#)
}

// ── environment assembly ────────────────────────────────

pub struct TestEnv {
    pub scheduler: Arc<BatchScheduler>,
    pub jobs: Arc<JobStore>,
}

/// Write the catalogue artifacts into `dir` and assemble a scheduler
/// around the given transport, exactly the way production wiring does.
pub async fn build_env(dir: &Path, chat: Arc<StubChat>, gate_interval: Duration) -> TestEnv {
    build_env_with_embedder(dir, chat, gate_interval, Arc::new(HashEmbedder)).await
}

pub async fn build_env_with_embedder(
    dir: &Path,
    chat: Arc<StubChat>,
    gate_interval: Duration,
    embedder: Arc<dyn Embedder>,
) -> TestEnv {
    let entries = fixture_entries();

    let catalogue_path = dir.join("catalogue.json");
    std::fs::write(&catalogue_path, serde_json::to_string(&entries).unwrap()).unwrap();

    let index_dir = dir.join("index");
    let bm25 = Bm25Index::open_or_create(&index_dir).unwrap();
    bm25.index_entries(&entries).unwrap();

    let vector_dir = dir.join("vectors");
    let vectors = VectorStore::open_or_create(&vector_dir).unwrap();
    let searchable: Vec<&CatalogueEntry> = entries.iter().filter(|e| !e.is_market).collect();
    let uuids: Vec<String> = searchable.iter().map(|e| e.uuid.clone()).collect();
    let embeddings: Vec<Vec<f32>> = searchable
        .iter()
        .map(|e| hash_embed(&e.searchable_text))
        .collect();
    vectors.add_entries(&uuids, embeddings).unwrap();

    let catalog = Arc::new(CatalogStore::load(&catalogue_path, &index_dir, &vector_dir).unwrap());

    let jobs = Arc::new(JobStore::open(&dir.join("jobs.db"), 5).await.unwrap());

    let llm_config = LlmConfig {
        backoff_base_ms: 1,
        ..LlmConfig::default()
    };
    let gate = Arc::new(RateGate::new(gate_interval));
    let oracle = Arc::new(DecisionOracle::new(chat, gate, llm_config.clone()));

    let ctx = Arc::new(PipelineContext {
        catalog,
        embedder,
        oracle,
        jobs: jobs.clone(),
        retrieval: RetrievalConfig::default(),
        catalogue_version: "ecoinvent 3.11".to_string(),
        llm_model: llm_config.model,
    });

    TestEnv {
        scheduler: Arc::new(BatchScheduler::new(ctx, 4)),
        jobs,
    }
}

// ── input rows ──────────────────────────────────────────

pub fn input_row(bezeichnung: &str, referenzeinheit: &str) -> InputRowCreate {
    InputRowCreate {
        bezeichnung: bezeichnung.to_string(),
        referenzeinheit: referenzeinheit.to_string(),
        produktinformationen: None,
        scope: None,
        kategorie: None,
        unterkategorie: None,
        region: None,
        referenzjahr: None,
    }
}

pub fn input_row_full(
    bezeichnung: &str,
    referenzeinheit: &str,
    region: Option<&str>,
    scope: Option<&str>,
) -> InputRowCreate {
    InputRowCreate {
        bezeichnung: bezeichnung.to_string(),
        referenzeinheit: referenzeinheit.to_string(),
        produktinformationen: None,
        scope: scope.map(str::to_string),
        kategorie: None,
        unterkategorie: None,
        region: region.map(str::to_string),
        referenzjahr: None,
    }
}
