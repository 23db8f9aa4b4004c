use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One row of the reference catalogue. Immutable after load.
///
/// `biogenic_factor` and `common_factor` are kg CO₂-eq per one `unit` of
/// the reference product.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogueEntry {
    pub uuid: String,
    pub activity_name: String,
    pub product_name: String,
    pub geography: String,
    pub unit: String,
    pub biogenic_factor: f64,
    pub common_factor: f64,
    pub is_market: bool,
    /// Concatenated lowercase activity + product text used for lexical indexing.
    pub searchable_text: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobMode {
    Auto,
    Review,
}

impl JobMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobMode::Auto => "auto",
            JobMode::Review => "review",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(JobMode::Auto),
            "review" => Some(JobMode::Review),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Created,
    Running,
    AwaitingResolution,
    Completed,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::Running => "running",
            JobStatus::AwaitingResolution => "awaiting_resolution",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(JobStatus::Created),
            "running" => Some(JobStatus::Running),
            "awaiting_resolution" => Some(JobStatus::AwaitingResolution),
            "completed" => Some(JobStatus::Completed),
            "error" => Some(JobStatus::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub mode: JobMode,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub total_rows: i64,
    pub done_rows: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RowStatus {
    Pending,
    Searching,
    LlmDeciding,
    Ambiguous,
    Decomposing,
    Matched,
    Calculated,
    Error,
}

impl RowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowStatus::Pending => "pending",
            RowStatus::Searching => "searching",
            RowStatus::LlmDeciding => "llm_deciding",
            RowStatus::Ambiguous => "ambiguous",
            RowStatus::Decomposing => "decomposing",
            RowStatus::Matched => "matched",
            RowStatus::Calculated => "calculated",
            RowStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RowStatus::Pending),
            "searching" => Some(RowStatus::Searching),
            "llm_deciding" => Some(RowStatus::LlmDeciding),
            "ambiguous" => Some(RowStatus::Ambiguous),
            "decomposing" => Some(RowStatus::Decomposing),
            "matched" => Some(RowStatus::Matched),
            "calculated" => Some(RowStatus::Calculated),
            "error" => Some(RowStatus::Error),
            _ => None,
        }
    }

    /// Terminal or suspended: the scheduler will not touch this row again
    /// without an external event.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            RowStatus::Calculated | RowStatus::Error | RowStatus::Ambiguous
        )
    }
}

/// A row as handed to the core by the upload collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputRowCreate {
    pub bezeichnung: String,
    pub referenzeinheit: String,
    #[serde(default)]
    pub produktinformationen: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub kategorie: Option<String>,
    #[serde(default)]
    pub unterkategorie: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub referenzjahr: Option<String>,
}

/// A persisted input row, with normalised shadow fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputRow {
    pub id: i64,
    pub job_id: String,
    pub row_index: i64,
    pub bezeichnung: String,
    pub referenzeinheit: String,
    pub produktinformationen: Option<String>,
    pub scope: Option<String>,
    pub kategorie: Option<String>,
    pub unterkategorie: Option<String>,
    pub region: Option<String>,
    pub referenzjahr: Option<String>,
    pub bezeichnung_norm: Option<String>,
    pub produktinfo_norm: Option<String>,
    pub region_norm: String,
    pub status: RowStatus,
    pub error_message: Option<String>,
}

/// One entry of a ranked candidate set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub uuid: String,
    pub activity_name: String,
    pub product_name: String,
    pub geography: String,
    pub unit: String,
    /// 1-based position after fusion and re-ranking.
    pub rank: usize,
    pub rationale: String,
}

/// One plausible option inside an ambiguous decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlausibleOption {
    pub uuid: String,
    pub why_short: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ComponentCategory {
    Materials,
    Energy,
    Packaging,
    Transport,
    Processes,
}

impl ComponentCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentCategory::Materials => "materials",
            ComponentCategory::Energy => "energy",
            ComponentCategory::Packaging => "packaging",
            ComponentCategory::Transport => "transport",
            ComponentCategory::Processes => "processes",
        }
    }
}

/// One component of a decomposition, as proposed by the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Component {
    pub name: String,
    /// Fraction of one reference unit of the parent product.
    pub quantity: f64,
    pub category: ComponentCategory,
    #[serde(default)]
    pub note: Option<String>,
}

/// The oracle's classification of an input row.
#[derive(Debug, Clone)]
pub enum Decision {
    Match {
        selected_uuid: String,
        rationale: String,
    },
    Ambiguous {
        plausible: Vec<PlausibleOption>,
        rationale: String,
    },
    Decompose {
        components: Vec<Component>,
    },
}

impl Decision {
    pub fn kind(&self) -> DecisionType {
        match self {
            Decision::Match { .. } => DecisionType::Match,
            Decision::Ambiguous { .. } => DecisionType::Ambiguous,
            Decision::Decompose { .. } => DecisionType::Decompose,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecisionType {
    Match,
    Ambiguous,
    Decompose,
}

impl DecisionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionType::Match => "match",
            DecisionType::Ambiguous => "ambiguous",
            DecisionType::Decompose => "decompose",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "match" => Some(DecisionType::Match),
            "ambiguous" => Some(DecisionType::Ambiguous),
            "decompose" => Some(DecisionType::Decompose),
            _ => None,
        }
    }
}

/// A multiplier obtained from the unit-conversion oracle call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitConversion {
    pub factor: f64,
    pub explanation: String,
}

/// A decomposition component after its sub-search resolved it to a
/// catalogue entry and its emissions were computed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedComponent {
    pub name: String,
    pub quantity: f64,
    pub category: ComponentCategory,
    pub matched_uuid: String,
    pub matched_activity: String,
    pub matched_geography: String,
    #[serde(default)]
    pub conversion: Option<UnitConversion>,
    pub biogenic_kg: f64,
    pub common_kg: f64,
}

/// Terminal output for a calculated (or suspended-ambiguous) row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowResult {
    pub input_row_id: i64,
    pub decision_type: DecisionType,
    pub selected_uuid: Option<String>,
    pub candidates: Option<Vec<Candidate>>,
    pub components: Option<Vec<ResolvedComponent>>,
    /// Formatted for the UI: comma decimal separator, truncated at 10 decimals.
    pub biogenic_t: Option<String>,
    pub common_t: Option<String>,
    pub beschreibung: Option<String>,
    pub quelle: Option<String>,
    pub detailed_calc: Option<String>,
    pub provenance_json: Option<String>,
}

/// Aggregate per-job counters reported to the outside.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobCounters {
    pub total: i64,
    pub pending: i64,
    pub processing: i64,
    pub calculated: i64,
    pub ambiguous: i64,
    pub errors: i64,
}
