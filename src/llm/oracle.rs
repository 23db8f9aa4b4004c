//! The decision oracle: classifies an input row against its candidate
//! set as match / ambiguous / decompose, and converts units. Wraps the
//! chat transport with prompt construction, strict JSON validation and
//! correction retries.

use serde::Deserialize;
use std::sync::Arc;

use crate::config::LlmConfig;
use crate::error::RowError;
use crate::llm::transport::{paced_complete, ChatTransport};
use crate::models::{Candidate, Component, ComponentCategory, Decision, PlausibleOption, UnitConversion};
use crate::pipeline::pacing::RateGate;

/// Component quantities must sum to 1.0 within this tolerance.
pub const SUM_TOLERANCE: f64 = 0.02;
pub const MIN_COMPONENTS: usize = 3;
pub const MAX_COMPONENTS: usize = 10;
/// Conversion factors above this are certainly hallucinated.
const MAX_CONVERSION_FACTOR: f64 = 1e6;
/// Schema-violation retries (correction prompts) per decide/convert call.
const MAX_PARSE_ATTEMPTS: u32 = 3;

const SYSTEM_PROMPT: &str = "You are an emission-accounting assistant. You map product and \
activity descriptions onto entries of a life-cycle-inventory catalogue. You always answer \
with a single JSON object and nothing else. You never invent UUIDs: every UUID you return \
must be copied verbatim from the candidate list you were given.";

/// The input context shown to the LLM alongside the candidates.
#[derive(Debug, Clone)]
pub struct DecisionInput<'a> {
    pub bezeichnung: &'a str,
    pub produktinformationen: Option<&'a str>,
    pub referenzeinheit: &'a str,
    pub region: &'a str,
    pub scope: Option<&'a str>,
    pub kategorie: Option<&'a str>,
    pub unterkategorie: Option<&'a str>,
}

pub struct DecisionOracle {
    transport: Arc<dyn ChatTransport>,
    gate: Arc<RateGate>,
    config: LlmConfig,
}

impl DecisionOracle {
    pub fn new(transport: Arc<dyn ChatTransport>, gate: Arc<RateGate>, config: LlmConfig) -> Self {
        Self {
            transport,
            gate,
            config,
        }
    }

    /// Classify `input` against `candidates`. With `allow_decompose =
    /// false` the decompose option is omitted from the prompt and
    /// rejected on parse.
    pub async fn decide(
        &self,
        input: &DecisionInput<'_>,
        candidates: &[Candidate],
        allow_decompose: bool,
    ) -> Result<Decision, RowError> {
        let base_prompt = build_decide_prompt(input, candidates, allow_decompose);
        let mut prompt = base_prompt.clone();
        let mut last_violation: Option<Violation> = None;

        for attempt in 1..=MAX_PARSE_ATTEMPTS {
            let raw = paced_complete(
                self.transport.as_ref(),
                &self.gate,
                &self.config,
                SYSTEM_PROMPT,
                &prompt,
            )
            .await?;

            match parse_decision(&raw, candidates, allow_decompose) {
                Ok(decision) => return Ok(decision),
                Err(violation) => {
                    tracing::warn!(
                        attempt,
                        "Oracle response rejected: {}",
                        violation.message
                    );
                    prompt = format!(
                        "{base_prompt}\n\nYour previous response was invalid: {}\n\
                         Return ONLY the corrected JSON object in the required schema.",
                        violation.message
                    );
                    last_violation = Some(violation);
                }
            }
        }

        let violation = last_violation.expect("loop ran at least once");
        if violation.decomposition {
            Err(RowError::DecompositionInvalid(violation.message))
        } else {
            Err(RowError::LlmMalformed(violation.message))
        }
    }

    /// Ask for the multiplier `q` such that 1 `from_unit` of the
    /// described product equals `q` `to_unit`. One correction retry on an
    /// unusable answer, then the row fails.
    pub async fn convert_unit(
        &self,
        description: &str,
        from_unit: &str,
        to_unit: &str,
    ) -> Result<UnitConversion, RowError> {
        let base_prompt = build_convert_prompt(description, from_unit, to_unit);
        let mut prompt = base_prompt.clone();
        let mut last_error = String::new();

        for _ in 0..2 {
            let raw = paced_complete(
                self.transport.as_ref(),
                &self.gate,
                &self.config,
                SYSTEM_PROMPT,
                &prompt,
            )
            .await?;

            match parse_conversion(&raw) {
                Ok(conversion) => return Ok(conversion),
                Err(message) => {
                    tracing::warn!("Unit conversion rejected: {message}");
                    prompt = format!(
                        "{base_prompt}\n\nYour previous response was invalid: {message}\n\
                         Return ONLY the corrected JSON object."
                    );
                    last_error = message;
                }
            }
        }

        Err(RowError::UnitConversionFailed(format!(
            "{from_unit} -> {to_unit}: {last_error}"
        )))
    }
}

// ─── Prompt construction ─────────────────────────────────

fn build_decide_prompt(
    input: &DecisionInput<'_>,
    candidates: &[Candidate],
    allow_decompose: bool,
) -> String {
    let candidates_json: Vec<serde_json::Value> = candidates
        .iter()
        .map(|c| {
            serde_json::json!({
                "index": c.rank,
                "uuid": c.uuid,
                "activity_name": c.activity_name,
                "product_name": c.product_name,
                "geography": c.geography,
                "unit": c.unit,
            })
        })
        .collect();

    let mut context = format!(
        "Input row:\n- Bezeichnung: \"{}\"\n- Produktinformationen: \"{}\"\n\
         - Referenzeinheit: \"{}\"\n- Region: \"{}\"",
        input.bezeichnung,
        input.produktinformationen.unwrap_or(""),
        input.referenzeinheit,
        input.region,
    );
    if let Some(scope) = input.scope {
        context.push_str(&format!("\n- Scope: \"{scope}\""));
    }
    if let Some(kategorie) = input.kategorie {
        context.push_str(&format!("\n- Kategorie: \"{kategorie}\""));
    }
    if let Some(unterkategorie) = input.unterkategorie {
        context.push_str(&format!("\n- Unterkategorie: \"{unterkategorie}\""));
    }

    let candidates_block =
        serde_json::to_string_pretty(&candidates_json).unwrap_or_else(|_| "[]".to_string());

    let mut rules = String::from(
        "Rules:\n\
         - Prefer cradle-to-gate production processes.\n\
         - Prefer region order: requested region > GLO > RoW.\n\
         - Prefer candidates whose unit matches the Referenzeinheit.\n\
         - If exactly ONE candidate reasonably fits, choose \"match\" and return its UUID.\n\
         - If TWO OR MORE candidates are plausible, choose \"ambiguous\" and list each \
           plausible one with a short reason.\n",
    );

    let schema = if allow_decompose {
        rules.push_str(
            "- Choose \"decompose\" ONLY if no candidate reasonably fits AND the product is a \
             compound of several materials or processes. Simple activities (diesel, petrol, \
             electricity, transport, heating, basic materials) are NEVER decomposed.\n\
             - Decompositions have 3 to 10 components, each a fraction of exactly 1 \
             Referenzeinheit of the product; the quantities MUST sum to 1.0.\n\
             - Component categories: materials, energy, packaging, transport, processes.\n",
        );
        "{\n\
         \x20 \"decision\": \"match\" | \"ambiguous\" | \"decompose\",\n\
         \x20 \"match\": {\"uuid\": \"...\", \"rationale\": \"...\"},\n\
         \x20 \"ambiguous\": {\"options\": [{\"uuid\": \"...\", \"why_short\": \"...\"}, ...], \"rationale\": \"...\"},\n\
         \x20 \"decompose\": {\"components\": [{\"name\": \"...\", \"quantity\": 0.35, \"category\": \"materials\", \"note\": \"...\"}, ...]}\n\
         }"
    } else {
        rules.push_str(
            "- Decomposition is NOT allowed. You MUST pick from the provided candidates.\n",
        );
        "{\n\
         \x20 \"decision\": \"match\" | \"ambiguous\",\n\
         \x20 \"match\": {\"uuid\": \"...\", \"rationale\": \"...\"},\n\
         \x20 \"ambiguous\": {\"options\": [{\"uuid\": \"...\", \"why_short\": \"...\"}, ...], \"rationale\": \"...\"}\n\
         }"
    };

    format!(
        "Task: select the best emission dataset for this input row.\n\n{context}\n\n\
         Candidates (rows from the catalogue; do not modify any string):\n{candidates_block}\n\n\
         {rules}\n\
         Respond with ONLY this JSON structure, including only the section for your decision:\n\n{schema}"
    )
}

fn build_convert_prompt(description: &str, from_unit: &str, to_unit: &str) -> String {
    format!(
        "Task: unit conversion for emission accounting.\n\n\
         Product: {description}\n\
         Source unit: {from_unit}\n\
         Target unit: {to_unit}\n\n\
         Calculate how many {to_unit} correspond to exactly 1 {from_unit} of this product. \
         Use physical properties (energy content, density, weight) where needed. \
         Example: 1 liter of diesel contains approximately 36 MJ (lower heating value).\n\n\
         Respond with ONLY this JSON:\n\n\
         {{\n  \"conversion_factor\": <number>,\n  \"explanation\": \"how the factor was derived\"\n}}"
    )
}

// ─── Response parsing ────────────────────────────────────

#[derive(Debug)]
struct Violation {
    message: String,
    /// True when the component invariants (count, sum) were violated;
    /// these surface as DecompositionInvalid instead of LlmMalformed.
    decomposition: bool,
}

impl Violation {
    fn malformed(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            decomposition: false,
        }
    }

    fn decomposition(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            decomposition: true,
        }
    }
}

#[derive(Deserialize)]
struct RawDecision {
    decision: String,
    #[serde(rename = "match")]
    match_: Option<RawMatch>,
    ambiguous: Option<RawAmbiguous>,
    decompose: Option<RawDecompose>,
}

#[derive(Deserialize)]
struct RawMatch {
    uuid: String,
    #[serde(default)]
    rationale: String,
}

#[derive(Deserialize)]
struct RawAmbiguous {
    options: Vec<RawOption>,
    #[serde(default)]
    rationale: String,
}

#[derive(Deserialize)]
struct RawOption {
    uuid: String,
    #[serde(default)]
    why_short: String,
}

#[derive(Deserialize)]
struct RawDecompose {
    components: Vec<RawComponent>,
}

#[derive(Deserialize)]
struct RawComponent {
    name: String,
    quantity: f64,
    category: String,
    #[serde(default)]
    note: Option<String>,
}

/// Strip a surrounding markdown code fence, if present.
fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        if let Some(inner) = rest.trim_start_matches('\n').strip_suffix("```") {
            return inner.trim();
        }
    }
    trimmed
}

fn parse_category(raw: &str) -> Option<ComponentCategory> {
    match raw.trim().to_lowercase().as_str() {
        "materials" => Some(ComponentCategory::Materials),
        "energy" => Some(ComponentCategory::Energy),
        "packaging" => Some(ComponentCategory::Packaging),
        "transport" => Some(ComponentCategory::Transport),
        "processes" => Some(ComponentCategory::Processes),
        _ => None,
    }
}

fn parse_decision(
    raw_text: &str,
    candidates: &[Candidate],
    allow_decompose: bool,
) -> Result<Decision, Violation> {
    let text = strip_code_fences(raw_text);
    let raw: RawDecision = serde_json::from_str(text)
        .map_err(|e| Violation::malformed(format!("response is not valid JSON: {e}")))?;

    let known_uuid = |uuid: &str| candidates.iter().any(|c| c.uuid == uuid);

    match raw.decision.as_str() {
        "match" => {
            let m = raw
                .match_
                .ok_or_else(|| Violation::malformed("decision is \"match\" but the \"match\" section is missing"))?;
            if !known_uuid(&m.uuid) {
                return Err(Violation::malformed(format!(
                    "UUID {} is not in the candidate list",
                    m.uuid
                )));
            }
            Ok(Decision::Match {
                selected_uuid: m.uuid,
                rationale: m.rationale,
            })
        }
        "ambiguous" => {
            let a = raw.ambiguous.ok_or_else(|| {
                Violation::malformed("decision is \"ambiguous\" but the \"ambiguous\" section is missing")
            })?;
            if a.options.len() < 2 {
                return Err(Violation::malformed(format!(
                    "an ambiguous decision needs at least 2 plausible options, got {}",
                    a.options.len()
                )));
            }
            for opt in &a.options {
                if !known_uuid(&opt.uuid) {
                    return Err(Violation::malformed(format!(
                        "UUID {} is not in the candidate list",
                        opt.uuid
                    )));
                }
            }
            Ok(Decision::Ambiguous {
                plausible: a
                    .options
                    .into_iter()
                    .map(|o| PlausibleOption {
                        uuid: o.uuid,
                        why_short: o.why_short,
                    })
                    .collect(),
                rationale: a.rationale,
            })
        }
        "decompose" => {
            if !allow_decompose {
                return Err(Violation::malformed(
                    "decomposition is not allowed for this input; choose match or ambiguous",
                ));
            }
            let d = raw.decompose.ok_or_else(|| {
                Violation::malformed("decision is \"decompose\" but the \"decompose\" section is missing")
            })?;

            if d.components.len() < MIN_COMPONENTS || d.components.len() > MAX_COMPONENTS {
                return Err(Violation::decomposition(format!(
                    "a decomposition needs {MIN_COMPONENTS} to {MAX_COMPONENTS} components, got {}",
                    d.components.len()
                )));
            }

            let mut components = Vec::with_capacity(d.components.len());
            let mut sum = 0.0f64;
            for rc in d.components {
                if !rc.quantity.is_finite() || rc.quantity <= 0.0 {
                    return Err(Violation::decomposition(format!(
                        "component '{}' has a non-positive quantity {}",
                        rc.name, rc.quantity
                    )));
                }
                let category = parse_category(&rc.category).ok_or_else(|| {
                    Violation::malformed(format!(
                        "component '{}' has unknown category '{}'",
                        rc.name, rc.category
                    ))
                })?;
                sum += rc.quantity;
                components.push(Component {
                    name: rc.name,
                    quantity: rc.quantity,
                    category,
                    note: rc.note,
                });
            }

            if (sum - 1.0).abs() > SUM_TOLERANCE {
                let listing = components
                    .iter()
                    .map(|c| format!("{}: {}", c.name, c.quantity))
                    .collect::<Vec<_>>()
                    .join(", ");
                return Err(Violation::decomposition(format!(
                    "component quantities sum to {sum:.3}, but must sum to 1.0 \
                     (tolerance {SUM_TOLERANCE}); components: {listing}"
                )));
            }

            Ok(Decision::Decompose { components })
        }
        other => Err(Violation::malformed(format!(
            "unknown decision type: \"{other}\""
        ))),
    }
}

#[derive(Deserialize)]
struct RawConversion {
    conversion_factor: f64,
    #[serde(default)]
    explanation: String,
}

fn parse_conversion(raw_text: &str) -> Result<UnitConversion, String> {
    let text = strip_code_fences(raw_text);
    let raw: RawConversion =
        serde_json::from_str(text).map_err(|e| format!("response is not valid JSON: {e}"))?;

    let q = raw.conversion_factor;
    if !q.is_finite() {
        return Err(format!("conversion factor {q} is not finite"));
    }
    if q <= 0.0 {
        return Err(format!("conversion factor {q} is not positive"));
    }
    if q > MAX_CONVERSION_FACTOR {
        return Err(format!(
            "conversion factor {q} exceeds the plausibility bound {MAX_CONVERSION_FACTOR}"
        ));
    }

    Ok(UnitConversion {
        factor: q,
        explanation: raw.explanation,
    })
}
