//! Output strings for a finished row: Beschreibung (one-line summary),
//! Quelle (source UUID list) and the unbounded detailed calculation.

use chrono::Utc;

use crate::models::InputRow;
use crate::pipeline::calc::{format_number, DecompCalc, MatchCalc};

/// Hard cap for Beschreibung and Quelle, dictated by the export format.
pub const MAX_CHARS: usize = 1000;
/// At most this many source UUIDs are listed in Quelle.
pub const MAX_QUELLE_UUIDS: usize = 10;

/// Truncate on a char boundary at `max` bytes.
fn clamp(text: String, max: usize) -> String {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

pub fn build_beschreibung_match(row: &InputRow, calc: &MatchCalc) -> String {
    let conversion_note = calc
        .conversion
        .as_ref()
        .map(|c| format!(" [Umrechnung: {}]", c.explanation))
        .unwrap_or_default();

    let multiplier = if (calc.quantity - 1.0).abs() > f64::EPSILON {
        format!(" × {}", calc.quantity)
    } else {
        String::new()
    };

    let desc = format!(
        "1 {} = {} ({}){}; Common: {} t CO2-Eq; Biogen: {} t CO2-Eq; Einheit: {}{}",
        row.referenzeinheit,
        calc.activity_name,
        calc.geography,
        multiplier,
        format_number(calc.common_t),
        format_number(calc.biogenic_t),
        calc.unit,
        conversion_note,
    );
    clamp(desc.split_whitespace().collect::<Vec<_>>().join(" "), MAX_CHARS)
}

pub fn build_beschreibung_decomposition(row: &InputRow, calc: &DecompCalc) -> String {
    let parts: Vec<String> = calc
        .components
        .iter()
        .map(|comp| {
            let activity_short = if comp.matched_activity.len() > 40 {
                format!("{}...", clamp(comp.matched_activity.clone(), 40))
            } else {
                comp.matched_activity.clone()
            };
            format!("{} ({} {})", activity_short, comp.quantity, row.referenzeinheit)
        })
        .collect();

    let desc = format!(
        "1 {} = Zerlegung: {}; Common: {} t CO2-Eq; Biogen: {} t CO2-Eq",
        row.referenzeinheit,
        parts.join(" + "),
        format_number(calc.common_t),
        format_number(calc.biogenic_t),
    );
    clamp(desc.split_whitespace().collect::<Vec<_>>().join(" "), MAX_CHARS)
}

/// "catalogue version; UUIDs: a, b, c" with order-preserving dedup.
/// At most `MAX_QUELLE_UUIDS` are listed; a trailing ellipsis marks
/// dropped sources.
pub fn build_quelle(catalogue_version: &str, uuids: &[String]) -> String {
    let mut seen = std::collections::HashSet::new();
    let deduped: Vec<&String> = uuids.iter().filter(|u| seen.insert(u.as_str())).collect();

    let truncated = deduped.len() > MAX_QUELLE_UUIDS;
    let listed: Vec<&str> = deduped
        .iter()
        .take(MAX_QUELLE_UUIDS)
        .map(|u| u.as_str())
        .collect();

    let mut quelle = format!("{catalogue_version}; UUIDs: {}", listed.join(", "));
    if truncated {
        quelle.push('…');
    }
    clamp(quelle, MAX_CHARS)
}

pub fn build_detailed_match(row: &InputRow, calc: &MatchCalc) -> String {
    let mut lines = vec![
        "=== Detailed Calculation ===".to_string(),
        String::new(),
        format!("Input: {}", row.bezeichnung),
        format!(
            "Produktinformationen: {}",
            row.produktinformationen.as_deref().unwrap_or("")
        ),
        format!("Referenzeinheit: {}", row.referenzeinheit),
        format!("Region: {}", row.region_norm),
        String::new(),
        "--- Matched Dataset ---".to_string(),
        format!("UUID: {}", calc.uuid),
        format!("Activity: {}", calc.activity_name),
        format!("Geography: {}", calc.geography),
        format!("Unit: {}", calc.unit),
        format!("Quantity: {}", calc.quantity),
    ];

    if let Some(conversion) = &calc.conversion {
        lines.extend([
            String::new(),
            "--- Unit Conversion ---".to_string(),
            format!("Reference unit: {}", row.referenzeinheit),
            format!("Dataset unit: {}", calc.unit),
            format!("Conversion factor: {}", conversion.factor),
            format!("Explanation: {}", conversion.explanation),
        ]);
    }

    lines.extend([
        String::new(),
        "--- Calculation ---".to_string(),
        format!("Biogenic [kg CO2-Eq]: {}", calc.biogenic_kg),
        format!("  = DB value × {} = {} kg", calc.quantity, calc.biogenic_kg),
        format!("  = {} / 1000 = {} t CO2-Eq", calc.biogenic_kg, calc.biogenic_t),
        format!("  Formatted: {} t CO2-Eq", format_number(calc.biogenic_t)),
        String::new(),
        format!("Common (excl. biogenic) [kg CO2-Eq]: {}", calc.common_kg),
        format!("  = DB value × {} = {} kg", calc.quantity, calc.common_kg),
        format!("  = {} / 1000 = {} t CO2-Eq", calc.common_kg, calc.common_t),
        format!("  Formatted: {} t CO2-Eq", format_number(calc.common_t)),
    ]);

    lines.join("\n")
}

pub fn build_detailed_decomposition(row: &InputRow, calc: &DecompCalc) -> String {
    let mut lines = vec![
        "=== Detailed Calculation (Decomposition) ===".to_string(),
        String::new(),
        format!("Input: {}", row.bezeichnung),
        format!(
            "Produktinformationen: {}",
            row.produktinformationen.as_deref().unwrap_or("")
        ),
        format!("Referenzeinheit: {}", row.referenzeinheit),
        format!("Region: {}", row.region_norm),
        String::new(),
        "--- Components ---".to_string(),
    ];

    for comp in &calc.components {
        lines.extend([
            String::new(),
            format!("  [{}] ({})", comp.name, comp.category.as_str()),
            format!("  UUID: {}", comp.matched_uuid),
            format!("  Activity: {}", comp.matched_activity),
            format!("  Geography: {}", comp.matched_geography),
            format!("  Quantity: {} {}", comp.quantity, row.referenzeinheit),
        ]);
        if let Some(conversion) = &comp.conversion {
            lines.push(format!(
                "  Conversion: × {} ({})",
                conversion.factor, conversion.explanation
            ));
        }
        lines.extend([
            format!("  Biogenic: {} kg CO2-Eq", comp.biogenic_kg),
            format!("  Common: {} kg CO2-Eq", comp.common_kg),
        ]);
    }

    lines.extend([
        String::new(),
        "--- Totals ---".to_string(),
        format!("Sum biogenic [kg]: {}", calc.biogenic_kg_sum),
        format!("Sum common [kg]: {}", calc.common_kg_sum),
        String::new(),
        format!(
            "Biogenic [t CO2-Eq]: {} / 1000 = {}",
            calc.biogenic_kg_sum, calc.biogenic_t
        ),
        format!("  Formatted: {}", format_number(calc.biogenic_t)),
        format!(
            "Common [t CO2-Eq]: {} / 1000 = {}",
            calc.common_kg_sum, calc.common_t
        ),
        format!("  Formatted: {}", format_number(calc.common_t)),
    ]);

    lines.join("\n")
}

/// Audit record persisted alongside each result.
pub fn build_provenance(
    row: &InputRow,
    decision_type: &str,
    search_query: &str,
    candidates_shown: usize,
    uuids: &[String],
    quantities: &[f64],
    llm_model: &str,
) -> serde_json::Value {
    serde_json::json!({
        "timestamp": Utc::now().to_rfc3339(),
        "input_row": {
            "bezeichnung": row.bezeichnung,
            "produktinformationen": row.produktinformationen,
            "referenzeinheit": row.referenzeinheit,
            "region": row.region,
            "referenzjahr": row.referenzjahr,
        },
        "normalized_input": {
            "bezeichnung_norm": row.bezeichnung_norm,
            "produktinfo_norm": row.produktinfo_norm,
            "region_norm": row.region_norm,
        },
        "search_query": search_query,
        "candidates_shown_to_llm": candidates_shown,
        "llm_decision_type": decision_type,
        "selected_uuids": uuids,
        "quantities": quantities,
        "llm_model": llm_model,
    })
}
