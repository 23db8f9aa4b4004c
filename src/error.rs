use thiserror::Error;

/// Row-level failure. No variant ever crosses a row boundary: the
/// orchestrator converts it into `status = error` plus `error_message`
/// and the job carries on with the remaining rows.
#[derive(Error, Debug)]
pub enum RowError {
    #[error("UnknownUnit: '{0}' cannot be mapped to a catalogue unit")]
    UnknownUnit(String),

    #[error("NoCandidates: retrieval returned no candidates for '{0}'")]
    NoCandidates(String),

    #[error("LlmTransport: {message} (after {attempts} attempts)")]
    LlmTransport { message: String, attempts: u32 },

    #[error("LlmMalformed: {0}")]
    LlmMalformed(String),

    #[error("DecompositionInvalid: {0}")]
    DecompositionInvalid(String),

    #[error("UnitConversionFailed: {0}")]
    UnitConversionFailed(String),

    #[error("ComponentFailed: component '{name}': {source}")]
    ComponentFailed {
        name: String,
        #[source]
        source: Box<RowError>,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("Store: {0}")]
    Store(#[from] sqlx::Error),

    #[error("Search: {0}")]
    Search(anyhow::Error),
}

impl RowError {
    /// Stable kind tag, used in logs and assertions.
    pub fn kind(&self) -> &'static str {
        match self {
            RowError::UnknownUnit(_) => "UnknownUnit",
            RowError::NoCandidates(_) => "NoCandidates",
            RowError::LlmTransport { .. } => "LlmTransport",
            RowError::LlmMalformed(_) => "LlmMalformed",
            RowError::DecompositionInvalid(_) => "DecompositionInvalid",
            RowError::UnitConversionFailed(_) => "UnitConversionFailed",
            RowError::ComponentFailed { .. } => "ComponentFailed",
            RowError::Cancelled => "Cancelled",
            RowError::Store(_) => "Store",
            RowError::Search(_) => "Search",
        }
    }
}

pub type Result<T> = std::result::Result<T, RowError>;
