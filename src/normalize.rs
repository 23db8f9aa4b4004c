//! Input normalisation: free text, region codes, units and German→English
//! search-term expansion. Everything here is a pure function.

use crate::error::RowError;
use crate::models::InputRow;

/// Lowercase, trim, transliterate German umlauts and collapse whitespace.
pub fn normalize_text(text: &str) -> String {
    let lowered = text.trim().to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    for ch in lowered.chars() {
        match ch {
            'ä' => out.push('a'),
            'ö' => out.push('o'),
            'ü' => out.push('u'),
            'ß' => out.push_str("ss"),
            _ => out.push(ch),
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Region aliases as entered by users. Unknown values pass through
/// uppercased; empty input maps to the global region.
const REGION_ALIASES: &[(&str, &str)] = &[
    ("europa", "RER"),
    ("europe", "RER"),
    ("eu", "RER"),
    ("deutschland", "DE"),
    ("germany", "DE"),
    ("schweiz", "CH"),
    ("switzerland", "CH"),
    ("oesterreich", "AT"),
    ("austria", "AT"),
    ("frankreich", "FR"),
    ("france", "FR"),
    ("italien", "IT"),
    ("italy", "IT"),
    ("spanien", "ES"),
    ("niederlande", "NL"),
    ("polen", "PL"),
    ("usa", "US"),
    ("vereinigte staaten", "US"),
    ("china", "CN"),
    ("indien", "IN"),
    ("japan", "JP"),
    ("welt", "GLO"),
    ("weltweit", "GLO"),
    ("global", "GLO"),
];

pub fn normalize_region(region: Option<&str>) -> String {
    let raw = region.map(str::trim).unwrap_or("");
    if raw.is_empty() {
        return "GLO".to_string();
    }
    let key = normalize_text(raw);
    for (alias, code) in REGION_ALIASES {
        if *alias == key {
            return (*code).to_string();
        }
    }
    raw.to_uppercase()
}

/// User unit → catalogue unit. Keys are pre-normalised (lowercase,
/// transliterated). Catalogue units map to themselves so already-correct
/// input survives the lookup.
const UNIT_MAP: &[(&str, &str)] = &[
    // Catalogue units (identity)
    ("kg", "kg"),
    ("kwh", "kWh"),
    ("mj", "MJ"),
    ("m2", "m2"),
    ("m3", "m3"),
    ("l", "l"),
    ("km", "km"),
    ("ha", "ha"),
    ("hour", "hour"),
    ("m", "m"),
    ("unit", "unit"),
    ("kg*km", "kg*km"),
    ("metric ton*km", "metric ton*km"),
    ("person*km", "person*km"),
    ("guest night", "guest night"),
    // German names and common abbreviations
    ("stuck", "unit"),
    ("stueck", "unit"),
    ("stk", "unit"),
    ("stk.", "unit"),
    ("pcs", "unit"),
    ("piece", "unit"),
    ("liter", "l"),
    ("kilogramm", "kg"),
    ("kilowattstunde", "kWh"),
    ("megajoule", "MJ"),
    ("meter", "m"),
    ("quadratmeter", "m2"),
    ("sqm", "m2"),
    ("kubikmeter", "m3"),
    ("cbm", "m3"),
    ("kilometer", "km"),
    ("hektar", "ha"),
    ("stunde", "hour"),
    ("stunden", "hour"),
    ("kgkm", "kg*km"),
    ("kg km", "kg*km"),
    ("tkm", "metric ton*km"),
    ("t km", "metric ton*km"),
    ("tonnenkilometer", "metric ton*km"),
    ("pkm", "person*km"),
    ("personenkilometer", "person*km"),
    ("ubernachtung", "guest night"),
];

/// Map a user-entered unit onto its catalogue form.
pub fn map_unit(raw: &str) -> Result<String, RowError> {
    let key = normalize_text(raw);
    for (alias, unit) in UNIT_MAP {
        if *alias == key {
            return Ok((*unit).to_string());
        }
    }
    Err(RowError::UnknownUnit(raw.to_string()))
}

/// German term → English catalogue vocabulary. The catalogue's activity
/// names are English; German descriptors need their equivalents appended
/// for the lexical leg of retrieval to bite. Keys are pre-normalised.
const TERM_TRANSLATIONS: &[(&str, &str)] = &[
    // Fuels & combustibles
    ("benzin", "petrol gasoline"),
    ("diesel", "diesel"),
    ("dieselkraftstoff", "diesel"),
    ("heizol", "heating oil light fuel oil"),
    ("erdgas", "natural gas"),
    ("kerosin", "kerosene jet fuel"),
    ("flussiggas", "liquefied petroleum gas LPG"),
    ("propan", "propane liquefied petroleum gas"),
    ("biogas", "biogas"),
    ("biodiesel", "biodiesel"),
    ("holzpellets", "wood pellets"),
    ("hackschnitzel", "wood chips"),
    ("braunkohle", "lignite brown coal"),
    ("steinkohle", "hard coal"),
    ("kohle", "coal"),
    ("brennholz", "firewood fuel wood"),
    ("wasserstoff", "hydrogen"),
    // Energy
    ("strom", "electricity"),
    ("elektrizitat", "electricity"),
    ("okostrom", "electricity wind solar hydro"),
    ("solarstrom", "electricity photovoltaic solar"),
    ("photovoltaik", "photovoltaic solar electricity"),
    ("fernwarme", "district heat"),
    ("warmepumpe", "heat pump"),
    ("blockheizkraftwerk", "combined heat power cogeneration CHP"),
    ("druckluft", "compressed air"),
    ("dampf", "steam heat"),
    ("geothermie", "geothermal heat"),
    // Transport & logistics
    ("lkw", "lorry truck transport freight"),
    ("pkw", "passenger car transport"),
    ("auto", "passenger car transport"),
    ("lastwagen", "lorry truck transport freight"),
    ("transporter", "van light commercial transport"),
    ("flugzeug", "aircraft flight"),
    ("flug", "aircraft flight transport air"),
    ("schiff", "ship vessel barge freight"),
    ("containerschiff", "container ship transoceanic freight"),
    ("bahn", "train rail transport freight"),
    ("zug", "train rail transport freight"),
    ("bus", "bus transport passenger"),
    ("spedition", "freight transport lorry"),
    ("logistik", "transport freight logistics"),
    // Metals
    ("stahl", "steel"),
    ("edelstahl", "stainless steel chromium"),
    ("aluminium", "aluminium"),
    ("kupfer", "copper"),
    ("eisen", "iron pig iron cast iron"),
    ("zink", "zinc"),
    ("blei", "lead"),
    ("nickel", "nickel"),
    ("messing", "brass copper zinc"),
    // Plastics & polymers
    ("kunststoff", "plastic polyethylene polypropylene"),
    ("plastik", "plastic polyethylene"),
    ("polyethylen", "polyethylene"),
    ("polypropylen", "polypropylene"),
    ("polystyrol", "polystyrene"),
    ("pvc", "polyvinylchloride PVC"),
    ("pet", "polyethylene terephthalate PET"),
    ("polyurethan", "polyurethane"),
    ("gummi", "synthetic rubber"),
    ("styropor", "polystyrene expandable EPS"),
    ("folie", "film packaging polyethylene"),
    // Chemicals
    ("ammoniak", "ammonia"),
    ("chlor", "chlorine"),
    ("salzsaure", "hydrochloric acid"),
    ("schwefelsaure", "sulfuric acid"),
    ("natronlauge", "sodium hydroxide"),
    ("sauerstoff", "oxygen"),
    ("stickstoff", "nitrogen"),
    ("kohlendioxid", "carbon dioxide"),
    ("losungsmittel", "solvent organic"),
    ("reinigungsmittel", "cleaning agent detergent"),
    ("schmierol", "lubricating oil"),
    ("kaltemittel", "refrigerant"),
    // Construction materials
    ("beton", "concrete"),
    ("zement", "cement"),
    ("ziegel", "brick"),
    ("gips", "gypsum plaster"),
    ("kies", "gravel"),
    ("sand", "sand"),
    ("asphalt", "asphalt bitumen"),
    ("dammung", "insulation"),
    ("mineralwolle", "rock wool mineral wool insulation"),
    ("fenster", "window flat glass"),
    ("farbe", "paint alkyd acrylic"),
    ("lack", "paint varnish coating"),
    ("kleber", "adhesive"),
    // Wood, paper, glass, textiles
    ("holz", "wood timber sawnwood"),
    ("bauholz", "sawnwood timber construction"),
    ("sperrholz", "plywood"),
    ("spanplatte", "particle board"),
    ("papier", "paper"),
    ("karton", "cardboard"),
    ("pappe", "cardboard corrugated board"),
    ("wellpappe", "corrugated board"),
    ("verpackung", "packaging"),
    ("zellstoff", "pulp"),
    ("glas", "glass flat glass"),
    ("baumwolle", "cotton"),
    ("wolle", "wool"),
    ("polyester", "polyester PET fibre"),
    ("leder", "leather bovine"),
    // Food & agriculture
    ("fleisch", "meat cattle pig poultry"),
    ("rindfleisch", "beef cattle"),
    ("schweinefleisch", "pork pig swine"),
    ("geflugel", "poultry chicken"),
    ("fisch", "fish"),
    ("milch", "milk dairy cow"),
    ("kase", "cheese dairy"),
    ("butter", "butter dairy"),
    ("eier", "egg hen"),
    ("weizen", "wheat grain"),
    ("mais", "maize corn grain"),
    ("reis", "rice paddy grain"),
    ("soja", "soybean"),
    ("zucker", "sugar beet cane"),
    ("kartoffel", "potato"),
    ("tomate", "tomato"),
    ("kaffee", "coffee"),
    ("brot", "bread wheat"),
    ("bier", "beer barley"),
    ("wein", "wine grape"),
    ("dunger", "fertiliser fertilizer"),
    ("pestizid", "pesticide"),
    // Water & waste
    ("wasser", "water tap water"),
    ("trinkwasser", "tap water drinking water"),
    ("abwasser", "wastewater treatment"),
    ("abfall", "waste treatment disposal"),
    ("mull", "waste municipal solid"),
    ("restmull", "waste municipal solid incineration"),
    ("mullverbrennung", "waste incineration municipal"),
    ("deponie", "landfill disposal"),
    ("sondermull", "hazardous waste treatment"),
    ("schrott", "scrap metal recycling"),
    ("altpapier", "waste paper recycling"),
    ("kompost", "composting biowaste"),
    // Electronics & machinery
    ("computer", "computer desktop"),
    ("laptop", "laptop notebook computer"),
    ("server", "computer server rack"),
    ("bildschirm", "display screen LCD"),
    ("drucker", "printer"),
    ("smartphone", "mobile phone smartphone"),
    ("batterie", "battery"),
    ("akku", "battery rechargeable lithium"),
    ("kabel", "cable electric"),
    ("leiterplatte", "printed circuit board PCB"),
    ("solarmodul", "photovoltaic panel module"),
    ("motor", "engine motor combustion"),
    ("pumpe", "pump"),
    ("klimaanlage", "air conditioning"),
    ("heizkessel", "boiler heating"),
    ("kuhlschrank", "refrigerator"),
    // Processes
    ("verbrennung", "combustion burned burning"),
    ("herstellung", "production manufacturing"),
    ("produktion", "production manufacturing"),
    ("fertigung", "manufacturing production"),
    ("montage", "assembly"),
    ("entsorgung", "disposal waste treatment"),
    ("recycling", "recycling"),
    ("transport", "transport freight"),
    ("heizung", "heating heat"),
    ("trocknen", "drying"),
    ("schweissen", "welding"),
    ("giessen", "casting foundry"),
    ("walzen", "rolling metal"),
    ("spritzgiessen", "injection moulding"),
    ("galvanisieren", "electroplating zinc chromium"),
    ("verzinken", "zinc coating galvanising"),
    // Office & services
    ("buro", "office"),
    ("hotel", "hotel guest night accommodation"),
    ("ubernachtung", "hotel guest night"),
    ("kantine", "meal restaurant catering"),
    ("gebaude", "building construction"),
];

/// Append English equivalents of known German terms; the original text is
/// preserved. Expects pre-normalised input.
pub fn expand_terms(text: &str) -> String {
    let mut additions: Vec<&str> = Vec::new();
    for word in text.split_whitespace() {
        let clean: String = word
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '*' || *c == '.')
            .collect();
        for (term, english) in TERM_TRANSLATIONS {
            if *term == clean && !additions.contains(english) {
                additions.push(english);
            }
        }
    }
    if additions.is_empty() {
        text.to_string()
    } else {
        format!("{} {}", text, additions.join(" "))
    }
}

/// The normalised view of an input row consumed by retrieval and matching.
#[derive(Debug, Clone)]
pub struct NormalizedRow {
    pub bezeichnung_norm: String,
    pub produktinfo_norm: Option<String>,
    pub region_norm: String,
    pub unit_norm: String,
}

/// Normalise all free-text fields of a row. Fails only on an unmappable
/// reference unit.
pub fn normalize_row(row: &InputRow) -> Result<NormalizedRow, RowError> {
    let unit_norm = map_unit(&row.referenzeinheit)?;
    Ok(NormalizedRow {
        bezeichnung_norm: normalize_text(&row.bezeichnung),
        produktinfo_norm: row
            .produktinformationen
            .as_deref()
            .map(normalize_text)
            .filter(|s| !s.is_empty()),
        region_norm: normalize_region(row.region.as_deref()),
        unit_norm,
    })
}
