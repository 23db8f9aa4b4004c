use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Where the catalogue artifacts and the job database live
    pub data_dir: PathBuf,
    /// Catalogue release string, used verbatim in the Quelle output
    pub catalogue_version: String,
    /// LLM endpoint configuration
    pub llm: LlmConfig,
    /// Embedding endpoint configuration
    pub embedding: EmbeddingConfig,
    /// Retrieval parameters
    pub retrieval: RetrievalConfig,
    /// Number of concurrent row workers
    pub workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Base URL for the OpenAI-compatible chat API
    pub base_url: String,
    /// Model name for decision and conversion calls
    pub model: String,
    /// API key (only needed for cloud providers)
    pub api_key: Option<String>,
    pub temperature: f32,
    pub top_p: f32,
    /// Hard per-call timeout in seconds
    pub timeout_secs: u64,
    /// Minimum delay between any two LLM calls, process-wide
    pub min_call_interval_secs: f64,
    /// First backoff delay for transport retries, in milliseconds
    pub backoff_base_ms: u64,
    /// Maximum attempts for transport-level failures
    pub max_transport_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// "ollama" or "openai"
    pub provider: String,
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    /// Expected vector dimension; responses with another dimension are rejected
    pub dim: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Size of the returned candidate set
    pub top_k: usize,
    /// Depth of each of the two retrieval lists before fusion
    pub pool: usize,
    /// Reciprocal-rank-fusion constant
    pub rrf_k: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            catalogue_version: "ecoinvent 3.11".to_string(),
            llm: LlmConfig::default(),
            embedding: EmbeddingConfig::default(),
            retrieval: RetrievalConfig::default(),
            workers: 4,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "llama3.2".to_string(),
            api_key: None,
            temperature: 0.0,
            top_p: 0.2,
            timeout_secs: 60,
            min_call_interval_secs: 15.0,
            backoff_base_ms: 1_000,
            max_transport_attempts: 5,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            base_url: "http://localhost:11434".to_string(),
            model: "paraphrase-multilingual-minilm-l12-v2".to_string(),
            api_key: None,
            dim: 384,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 20,
            pool: 100,
            rrf_k: 60,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("EMITTER_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(version) = std::env::var("EMITTER_CATALOGUE_VERSION") {
            config.catalogue_version = version;
        }
        if let Ok(url) = std::env::var("LLM_BASE_URL") {
            config.llm.base_url = url;
        }
        if let Ok(model) = std::env::var("LLM_MODEL") {
            config.llm.model = model;
        }
        if let Ok(key) = std::env::var("LLM_API_KEY") {
            config.llm.api_key = Some(key);
        }
        if let Ok(val) = std::env::var("LLM_TIMEOUT_SECS") {
            if let Ok(v) = val.parse() {
                config.llm.timeout_secs = v;
            }
        }
        if let Ok(val) = std::env::var("LLM_MIN_CALL_INTERVAL_SECS") {
            if let Ok(v) = val.parse() {
                config.llm.min_call_interval_secs = v;
            }
        }
        if let Ok(provider) = std::env::var("EMBEDDING_PROVIDER") {
            config.embedding.provider = provider;
        }
        if let Ok(url) = std::env::var("EMBEDDING_BASE_URL") {
            config.embedding.base_url = url;
        }
        if let Ok(model) = std::env::var("EMBEDDING_MODEL") {
            config.embedding.model = model;
        }
        if let Ok(key) = std::env::var("EMBEDDING_API_KEY") {
            config.embedding.api_key = Some(key);
        }
        if let Ok(val) = std::env::var("EMBEDDING_DIM") {
            if let Ok(v) = val.parse() {
                config.embedding.dim = v;
            }
        }
        if let Ok(val) = std::env::var("EMITTER_TOP_K") {
            if let Ok(v) = val.parse() {
                config.retrieval.top_k = v;
            }
        }
        if let Ok(val) = std::env::var("EMITTER_POOL") {
            if let Ok(v) = val.parse() {
                config.retrieval.pool = v;
            }
        }
        if let Ok(val) = std::env::var("EMITTER_RRF_K") {
            if let Ok(v) = val.parse() {
                config.retrieval.rrf_k = v;
            }
        }
        if let Ok(val) = std::env::var("EMITTER_WORKERS") {
            if let Ok(v) = val.parse() {
                config.workers = v;
            }
        }

        config
    }

    pub fn catalogue_path(&self) -> PathBuf {
        self.data_dir.join("catalogue.json")
    }

    pub fn index_dir(&self) -> PathBuf {
        self.data_dir.join("index")
    }

    pub fn vector_dir(&self) -> PathBuf {
        self.data_dir.join("vectors")
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("jobs.db")
    }
}
