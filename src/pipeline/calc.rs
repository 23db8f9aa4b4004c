//! Emission arithmetic: scale catalogue factors by the unit-conversion
//! multiplier and the component quantity, convert kg to tonnes, and
//! format numbers for the UI.

use crate::models::{CatalogueEntry, ResolvedComponent, UnitConversion};

/// Result of a direct-match calculation.
#[derive(Debug, Clone)]
pub struct MatchCalc {
    pub uuid: String,
    pub activity_name: String,
    pub geography: String,
    pub unit: String,
    /// The applied multiplier (1.0 when units matched).
    pub quantity: f64,
    pub conversion: Option<UnitConversion>,
    pub biogenic_kg: f64,
    pub common_kg: f64,
    pub biogenic_t: f64,
    pub common_t: f64,
}

/// Totals over a decomposition.
#[derive(Debug, Clone)]
pub struct DecompCalc {
    pub components: Vec<ResolvedComponent>,
    pub biogenic_kg_sum: f64,
    pub common_kg_sum: f64,
    pub biogenic_t: f64,
    pub common_t: f64,
}

/// Emissions of one reference unit, scaled by `quantity` (the conversion
/// factor for direct matches, conversion × component fraction for
/// decomposition components).
pub fn compute_match(
    entry: &CatalogueEntry,
    quantity: f64,
    conversion: Option<UnitConversion>,
) -> MatchCalc {
    let biogenic_kg = entry.biogenic_factor * quantity;
    let common_kg = entry.common_factor * quantity;
    MatchCalc {
        uuid: entry.uuid.clone(),
        activity_name: entry.activity_name.clone(),
        geography: entry.geography.clone(),
        unit: entry.unit.clone(),
        quantity,
        conversion,
        biogenic_kg,
        common_kg,
        biogenic_t: biogenic_kg / 1000.0,
        common_t: common_kg / 1000.0,
    }
}

/// Sum per-component emissions. Components must already carry their
/// scaled kg values.
pub fn compute_decomposition(components: Vec<ResolvedComponent>) -> DecompCalc {
    let biogenic_kg_sum: f64 = components.iter().map(|c| c.biogenic_kg).sum();
    let common_kg_sum: f64 = components.iter().map(|c| c.common_kg).sum();
    DecompCalc {
        components,
        biogenic_kg_sum,
        common_kg_sum,
        biogenic_t: biogenic_kg_sum / 1000.0,
        common_t: common_kg_sum / 1000.0,
    }
}

/// Truncate (not round) a value to the given number of decimal places.
fn truncate_to_decimals(value: f64, decimals: u32) -> f64 {
    if value.is_nan() || value.is_infinite() {
        return value;
    }
    let factor = 10f64.powi(decimals as i32);
    if value >= 0.0 {
        (value * factor).floor() / factor
    } else {
        (value * factor).ceil() / factor
    }
}

/// Format a number for the UI: comma as decimal separator, at most 10
/// decimals, truncated, trailing zeros stripped (keeping "0,0" style
/// output for whole values).
pub fn format_number(value: f64) -> String {
    let truncated = truncate_to_decimals(value, 10);
    let formatted = format!("{truncated:.10}");
    let (integer_part, decimal_part) = formatted
        .split_once('.')
        .expect("fixed-precision format always has a decimal point");
    let trimmed = decimal_part.trim_end_matches('0');
    let decimal_part = if trimmed.is_empty() { "0" } else { trimmed };
    format!("{integer_part},{decimal_part}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CatalogueEntry;

    fn entry(biogenic: f64, common: f64) -> CatalogueEntry {
        CatalogueEntry {
            uuid: "u".to_string(),
            activity_name: "steel production".to_string(),
            product_name: "steel".to_string(),
            geography: "DE".to_string(),
            unit: "kg".to_string(),
            biogenic_factor: biogenic,
            common_factor: common,
            is_market: false,
            searchable_text: String::new(),
        }
    }

    #[test]
    fn test_compute_match_unit_quantity() {
        let calc = compute_match(&entry(0.2, 1.8), 1.0, None);
        assert!((calc.biogenic_kg - 0.2).abs() < 1e-12);
        assert!((calc.common_kg - 1.8).abs() < 1e-12);
        assert!((calc.biogenic_t - 0.0002).abs() < 1e-12);
        assert!((calc.common_t - 0.0018).abs() < 1e-12);
    }

    #[test]
    fn test_compute_match_with_conversion_factor() {
        // 1 liter of diesel ≈ 36 MJ: factors per MJ get multiplied by 36
        let calc = compute_match(&entry(0.001, 0.075), 36.0, None);
        assert!((calc.common_kg - 2.7).abs() < 1e-12);
        assert!((calc.common_t - 0.0027).abs() < 1e-12);
    }

    #[test]
    fn test_compute_decomposition_sums_components() {
        let comp = |bio: f64, common: f64| ResolvedComponent {
            name: "c".to_string(),
            quantity: 0.5,
            category: crate::models::ComponentCategory::Materials,
            matched_uuid: "u".to_string(),
            matched_activity: "a".to_string(),
            matched_geography: "DE".to_string(),
            conversion: None,
            biogenic_kg: bio,
            common_kg: common,
        };
        let calc = compute_decomposition(vec![comp(0.1, 1.0), comp(0.3, 2.5)]);
        assert!((calc.biogenic_kg_sum - 0.4).abs() < 1e-12);
        assert!((calc.common_kg_sum - 3.5).abs() < 1e-12);
        assert!((calc.biogenic_t - 0.0004).abs() < 1e-12);
        assert!((calc.common_t - 0.0035).abs() < 1e-12);
    }

    #[test]
    fn test_format_number_comma_separator() {
        assert_eq!(format_number(0.0018), "0,0018");
        assert_eq!(format_number(2.5), "2,5");
    }

    #[test]
    fn test_format_number_whole_value_keeps_one_decimal() {
        assert_eq!(format_number(3.0), "3,0");
        assert_eq!(format_number(0.0), "0,0");
    }

    #[test]
    fn test_format_number_truncates_not_rounds() {
        // 0.12345678999 truncated at 10 decimals: 0.1234567899
        assert_eq!(format_number(0.12345678999), "0,1234567899");
        // rounding would give 0,2; truncation keeps 0,1999999999
        assert_eq!(format_number(0.19999999999), "0,1999999999");
    }

    #[test]
    fn test_format_number_negative() {
        assert_eq!(format_number(-0.25), "-0,25");
    }

    #[test]
    fn test_truncate_to_decimals_negative_truncates_towards_zero() {
        assert!((truncate_to_decimals(-0.129, 2) - (-0.12)).abs() < 1e-12);
    }
}
