//! Per-row orchestration: normalise, retrieve, classify, reconcile
//! units, compute and persist. One orchestrator owns one row at a time;
//! errors never cross row boundaries.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::catalog::CatalogStore;
use crate::config::RetrievalConfig;
use crate::error::RowError;
use crate::jobs::JobStore;
use crate::llm::embeddings::Embedder;
use crate::llm::oracle::{DecisionInput, DecisionOracle};
use crate::models::{
    Candidate, Component, Decision, DecisionType, InputRow, JobMode, PlausibleOption,
    ResolvedComponent, RowResult, RowStatus, UnitConversion,
};
use crate::normalize::{normalize_row, normalize_text, NormalizedRow};
use crate::pipeline::calc::{
    compute_decomposition, compute_match, format_number, DecompCalc, MatchCalc,
};
use crate::pipeline::output;
use crate::search::retrieve::{build_query, retrieve, RetrievalInput};

/// Everything a row orchestration needs, shared across workers.
pub struct PipelineContext {
    pub catalog: Arc<CatalogStore>,
    pub embedder: Arc<dyn Embedder>,
    pub oracle: Arc<DecisionOracle>,
    pub jobs: Arc<JobStore>,
    pub retrieval: RetrievalConfig,
    pub catalogue_version: String,
    pub llm_model: String,
}

/// Drive one row to a terminal or suspended state. All failures are
/// absorbed into `status = error` on the row.
pub async fn process_row(
    ctx: &PipelineContext,
    row: &InputRow,
    mode: JobMode,
    cancel: &CancellationToken,
) {
    match run_row(ctx, row, mode, cancel).await {
        Ok(outcome) => {
            tracing::info!(row_id = row.id, outcome = outcome.as_str(), "Row settled");
        }
        Err(e) => {
            tracing::warn!(row_id = row.id, kind = e.kind(), "Row failed: {e}");
            let _ = ctx
                .jobs
                .update_row_status(row.id, RowStatus::Error, Some(&e.to_string()))
                .await;
        }
    }
}

async fn run_row(
    ctx: &PipelineContext,
    row: &InputRow,
    mode: JobMode,
    cancel: &CancellationToken,
) -> Result<RowStatus, RowError> {
    check_cancel(cancel)?;

    // C1: normalise. An unmappable unit is fatal for the row.
    let norms = normalize_row(row)?;
    ctx.jobs.update_row_norms(row.id, &norms).await?;

    // C3: candidate retrieval.
    ctx.jobs
        .update_row_status(row.id, RowStatus::Searching, None)
        .await?;

    let retrieval_input = RetrievalInput {
        bezeichnung_norm: &norms.bezeichnung_norm,
        produktinfo_norm: norms.produktinfo_norm.as_deref(),
        scope: row.scope.as_deref(),
        region_norm: &norms.region_norm,
        unit_norm: &norms.unit_norm,
    };
    let candidates = retrieve(
        &ctx.catalog,
        ctx.embedder.as_ref(),
        &retrieval_input,
        &ctx.retrieval,
    )
    .await
    .map_err(RowError::Search)?;

    if candidates.is_empty() {
        return Err(RowError::NoCandidates(row.bezeichnung.clone()));
    }

    // C4: classification.
    ctx.jobs
        .update_row_status(row.id, RowStatus::LlmDeciding, None)
        .await?;

    let decision_input = DecisionInput {
        bezeichnung: &row.bezeichnung,
        produktinformationen: row.produktinformationen.as_deref(),
        referenzeinheit: &norms.unit_norm,
        region: &norms.region_norm,
        scope: row.scope.as_deref(),
        kategorie: row.kategorie.as_deref(),
        unterkategorie: row.unterkategorie.as_deref(),
    };

    check_cancel(cancel)?;
    let mut decision = ctx.oracle.decide(&decision_input, &candidates, true).await?;

    // A match pointing at a market entry is invalid. Retry the decision
    // once; if it persists, degrade to an ambiguity over the top
    // candidates instead of failing the row.
    if let Decision::Match { selected_uuid, .. } = &decision {
        if is_market(ctx, selected_uuid) {
            tracing::warn!(row_id = row.id, uuid = %selected_uuid, "Match selected a market entry, retrying decide");
            check_cancel(cancel)?;
            decision = ctx.oracle.decide(&decision_input, &candidates, true).await?;
            if let Decision::Match { selected_uuid, .. } = &decision {
                if is_market(ctx, selected_uuid) {
                    decision = degrade_to_ambiguous(&candidates);
                }
            }
        }
    }

    match decision {
        Decision::Match { selected_uuid, .. } => {
            finish_match(ctx, row, &norms, &selected_uuid, cancel).await
        }
        Decision::Ambiguous { plausible, .. } => match mode {
            JobMode::Auto => {
                // Auto mode never suspends: take the option the LLM
                // ranked first.
                let top = plausible[0].uuid.clone();
                finish_match(ctx, row, &norms, &top, cancel).await
            }
            JobMode::Review => suspend_ambiguous(ctx, row, &norms, &plausible, &candidates).await,
        },
        Decision::Decompose { components } => {
            finish_decomposition(ctx, row, &norms, components, cancel).await
        }
    }
}

fn check_cancel(cancel: &CancellationToken) -> Result<(), RowError> {
    if cancel.is_cancelled() {
        Err(RowError::Cancelled)
    } else {
        Ok(())
    }
}

fn is_market(ctx: &PipelineContext, uuid: &str) -> bool {
    ctx.catalog
        .by_uuid(uuid)
        .map(|e| e.is_market)
        .unwrap_or(true)
}

/// Build an ambiguity from the head of the candidate list, used when the
/// oracle keeps insisting on an invalid match.
fn degrade_to_ambiguous(candidates: &[Candidate]) -> Decision {
    let plausible = candidates
        .iter()
        .take(5)
        .map(|c| PlausibleOption {
            uuid: c.uuid.clone(),
            why_short: "top retrieval candidate".to_string(),
        })
        .collect();
    Decision::Ambiguous {
        plausible,
        rationale: "degraded after repeated invalid match".to_string(),
    }
}

/// Unit reconciliation for a selected entry: identical units need no
/// conversion, anything else asks the oracle for the multiplier.
async fn reconcile_unit(
    ctx: &PipelineContext,
    description: &str,
    unit_norm: &str,
    entry_unit: &str,
    cancel: &CancellationToken,
) -> Result<(f64, Option<UnitConversion>), RowError> {
    if entry_unit.eq_ignore_ascii_case(unit_norm) {
        return Ok((1.0, None));
    }
    check_cancel(cancel)?;
    let conversion = ctx
        .oracle
        .convert_unit(description, unit_norm, entry_unit)
        .await?;
    Ok((conversion.factor, Some(conversion)))
}

/// The tail of every match: unit reconciliation, computation, output
/// formatting and persistence. Also used by the resolve path, which is
/// why it never re-invokes `decide`.
pub(crate) async fn finish_match(
    ctx: &PipelineContext,
    row: &InputRow,
    norms: &NormalizedRow,
    selected_uuid: &str,
    cancel: &CancellationToken,
) -> Result<RowStatus, RowError> {
    let entry = ctx
        .catalog
        .by_uuid(selected_uuid)
        .ok_or_else(|| RowError::LlmMalformed(format!("selected UUID {selected_uuid} not in catalogue")))?
        .clone();

    let description = match &row.produktinformationen {
        Some(info) => format!("{} ({})", row.bezeichnung, info),
        None => row.bezeichnung.clone(),
    };
    let (quantity, conversion) =
        reconcile_unit(ctx, &description, &norms.unit_norm, &entry.unit, cancel).await?;

    ctx.jobs
        .update_row_status(row.id, RowStatus::Matched, None)
        .await?;

    let calc = compute_match(&entry, quantity, conversion);
    persist_match(ctx, row, norms, &calc).await?;

    ctx.jobs
        .update_row_status(row.id, RowStatus::Calculated, None)
        .await?;
    Ok(RowStatus::Calculated)
}

async fn persist_match(
    ctx: &PipelineContext,
    row: &InputRow,
    norms: &NormalizedRow,
    calc: &MatchCalc,
) -> Result<(), RowError> {
    let retrieval_input = RetrievalInput {
        bezeichnung_norm: &norms.bezeichnung_norm,
        produktinfo_norm: norms.produktinfo_norm.as_deref(),
        scope: row.scope.as_deref(),
        region_norm: &norms.region_norm,
        unit_norm: &norms.unit_norm,
    };
    let query = build_query(&retrieval_input);

    let mut stored_row = row.clone();
    stored_row.bezeichnung_norm = Some(norms.bezeichnung_norm.clone());
    stored_row.produktinfo_norm = norms.produktinfo_norm.clone();
    stored_row.region_norm = norms.region_norm.clone();

    let uuids = vec![calc.uuid.clone()];
    let provenance = output::build_provenance(
        &stored_row,
        DecisionType::Match.as_str(),
        &query,
        ctx.retrieval.top_k,
        &uuids,
        &[calc.quantity],
        &ctx.llm_model,
    );

    let result = RowResult {
        input_row_id: row.id,
        decision_type: DecisionType::Match,
        selected_uuid: Some(calc.uuid.clone()),
        candidates: None,
        components: None,
        biogenic_t: Some(format_number(calc.biogenic_t)),
        common_t: Some(format_number(calc.common_t)),
        beschreibung: Some(output::build_beschreibung_match(&stored_row, calc)),
        quelle: Some(output::build_quelle(&ctx.catalogue_version, &uuids)),
        detailed_calc: Some(output::build_detailed_match(&stored_row, calc)),
        provenance_json: serde_json::to_string(&provenance).ok(),
    };
    ctx.jobs.save_result(&result).await?;
    Ok(())
}

/// Store the plausible options and suspend the row until an external
/// resolution arrives.
async fn suspend_ambiguous(
    ctx: &PipelineContext,
    row: &InputRow,
    norms: &NormalizedRow,
    plausible: &[PlausibleOption],
    candidates: &[Candidate],
) -> Result<RowStatus, RowError> {
    let saved: Vec<Candidate> = plausible
        .iter()
        .enumerate()
        .filter_map(|(i, option)| {
            candidates.iter().find(|c| c.uuid == option.uuid).map(|c| Candidate {
                rank: i + 1,
                rationale: if option.why_short.is_empty() {
                    c.rationale.clone()
                } else {
                    option.why_short.clone()
                },
                ..c.clone()
            })
        })
        .collect();

    ctx.jobs.save_candidates(row.id, &saved).await?;

    let mut stored_row = row.clone();
    stored_row.bezeichnung_norm = Some(norms.bezeichnung_norm.clone());
    stored_row.produktinfo_norm = norms.produktinfo_norm.clone();
    stored_row.region_norm = norms.region_norm.clone();

    let result = RowResult {
        input_row_id: row.id,
        decision_type: DecisionType::Ambiguous,
        selected_uuid: None,
        candidates: Some(saved),
        components: None,
        biogenic_t: None,
        common_t: None,
        beschreibung: None,
        quelle: None,
        detailed_calc: None,
        provenance_json: None,
    };
    ctx.jobs.save_result(&result).await?;
    ctx.jobs
        .update_row_status(row.id, RowStatus::Ambiguous, None)
        .await?;
    Ok(RowStatus::Ambiguous)
}

/// Resolve every component through its own retrieval and (restricted)
/// decision, then aggregate. Any component failure fails the parent.
async fn finish_decomposition(
    ctx: &PipelineContext,
    row: &InputRow,
    norms: &NormalizedRow,
    components: Vec<Component>,
    cancel: &CancellationToken,
) -> Result<RowStatus, RowError> {
    ctx.jobs
        .update_row_status(row.id, RowStatus::Decomposing, None)
        .await?;

    let mut resolved = Vec::with_capacity(components.len());
    for component in &components {
        let r = resolve_component(ctx, row, norms, component, cancel).await;
        match r {
            Ok(rc) => resolved.push(rc),
            Err(RowError::Cancelled) => return Err(RowError::Cancelled),
            Err(e) => {
                return Err(RowError::ComponentFailed {
                    name: component.name.clone(),
                    source: Box::new(e),
                });
            }
        }
    }

    let calc = compute_decomposition(resolved);
    persist_decomposition(ctx, row, norms, &calc).await?;

    ctx.jobs
        .update_row_status(row.id, RowStatus::Calculated, None)
        .await?;
    Ok(RowStatus::Calculated)
}

/// One decomposition sub-row: inherit region, scope and category from
/// the parent, retrieve, decide with decomposition disabled, reconcile
/// the unit and scale by the component fraction. A sub-ambiguity is
/// always auto-picked; components never suspend.
async fn resolve_component(
    ctx: &PipelineContext,
    row: &InputRow,
    norms: &NormalizedRow,
    component: &Component,
    cancel: &CancellationToken,
) -> Result<ResolvedComponent, RowError> {
    check_cancel(cancel)?;

    let name_norm = normalize_text(&component.name);
    let retrieval_input = RetrievalInput {
        bezeichnung_norm: &name_norm,
        produktinfo_norm: None,
        scope: row.scope.as_deref(),
        region_norm: &norms.region_norm,
        unit_norm: &norms.unit_norm,
    };
    let candidates = retrieve(
        &ctx.catalog,
        ctx.embedder.as_ref(),
        &retrieval_input,
        &ctx.retrieval,
    )
    .await
    .map_err(RowError::Search)?;

    if candidates.is_empty() {
        return Err(RowError::NoCandidates(component.name.clone()));
    }

    let decision_input = DecisionInput {
        bezeichnung: &component.name,
        produktinformationen: component.note.as_deref(),
        referenzeinheit: &norms.unit_norm,
        region: &norms.region_norm,
        scope: row.scope.as_deref(),
        kategorie: row.kategorie.as_deref(),
        unterkategorie: None,
    };

    check_cancel(cancel)?;
    let decision = ctx
        .oracle
        .decide(&decision_input, &candidates, false)
        .await?;

    let selected_uuid = match decision {
        Decision::Match { selected_uuid, .. } => selected_uuid,
        // Component ambiguities never block: the first-listed option wins.
        Decision::Ambiguous { plausible, .. } => plausible[0].uuid.clone(),
        Decision::Decompose { .. } => {
            // parse rejects this when allow_decompose is false
            return Err(RowError::LlmMalformed(
                "nested decomposition is not supported".to_string(),
            ));
        }
    };

    let entry = ctx
        .catalog
        .by_uuid(&selected_uuid)
        .ok_or_else(|| RowError::LlmMalformed(format!("selected UUID {selected_uuid} not in catalogue")))?
        .clone();

    let (factor, conversion) =
        reconcile_unit(ctx, &component.name, &norms.unit_norm, &entry.unit, cancel).await?;

    // The component fraction multiplies on top of any unit conversion.
    let quantity_total = factor * component.quantity;

    Ok(ResolvedComponent {
        name: component.name.clone(),
        quantity: component.quantity,
        category: component.category,
        matched_uuid: entry.uuid.clone(),
        matched_activity: entry.activity_name.clone(),
        matched_geography: entry.geography.clone(),
        conversion,
        biogenic_kg: entry.biogenic_factor * quantity_total,
        common_kg: entry.common_factor * quantity_total,
    })
}

async fn persist_decomposition(
    ctx: &PipelineContext,
    row: &InputRow,
    norms: &NormalizedRow,
    calc: &DecompCalc,
) -> Result<(), RowError> {
    let retrieval_input = RetrievalInput {
        bezeichnung_norm: &norms.bezeichnung_norm,
        produktinfo_norm: norms.produktinfo_norm.as_deref(),
        scope: row.scope.as_deref(),
        region_norm: &norms.region_norm,
        unit_norm: &norms.unit_norm,
    };
    let query = build_query(&retrieval_input);

    let mut stored_row = row.clone();
    stored_row.bezeichnung_norm = Some(norms.bezeichnung_norm.clone());
    stored_row.produktinfo_norm = norms.produktinfo_norm.clone();
    stored_row.region_norm = norms.region_norm.clone();

    let uuids: Vec<String> = calc
        .components
        .iter()
        .map(|c| c.matched_uuid.clone())
        .collect();
    let quantities: Vec<f64> = calc.components.iter().map(|c| c.quantity).collect();

    let provenance = output::build_provenance(
        &stored_row,
        DecisionType::Decompose.as_str(),
        &query,
        ctx.retrieval.top_k,
        &uuids,
        &quantities,
        &ctx.llm_model,
    );

    let result = RowResult {
        input_row_id: row.id,
        decision_type: DecisionType::Decompose,
        selected_uuid: uuids.first().cloned(),
        candidates: None,
        components: Some(calc.components.clone()),
        biogenic_t: Some(format_number(calc.biogenic_t)),
        common_t: Some(format_number(calc.common_t)),
        beschreibung: Some(output::build_beschreibung_decomposition(&stored_row, calc)),
        quelle: Some(output::build_quelle(&ctx.catalogue_version, &uuids)),
        detailed_calc: Some(output::build_detailed_decomposition(&stored_row, calc)),
        provenance_json: serde_json::to_string(&provenance).ok(),
    };
    ctx.jobs.save_result(&result).await?;
    Ok(())
}

/// The post-ambiguity tail run on external resolution: no `decide`, only
/// unit reconciliation and computation for the chosen uuid.
pub async fn finish_resolved_row(
    ctx: &PipelineContext,
    row: &InputRow,
    selected_uuid: &str,
) -> Result<(), RowError> {
    let norms = normalize_row(row)?;
    let cancel = CancellationToken::new();
    finish_match(ctx, row, &norms, selected_uuid, &cancel).await?;
    Ok(())
}
