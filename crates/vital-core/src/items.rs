//! Canonical structured medication / supplement items.
//!
//! Storage format (JSON text in DB):
//! `[{"name": "Candesartan", "dose": "4mg", "timing": "morning"}, ...]`
//!
//! Legacy string arrays and semicolon/newline separated text are accepted on
//! read and normalised to the structured shape. Generic placeholders such as
//! "my meds" or "morning supplements" are never stored.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StructuredItem {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub dose: String,
    #[serde(default)]
    pub timing: String,
}

impl StructuredItem {
    pub fn new(name: impl Into<String>, dose: impl Into<String>, timing: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dose: dose.into(),
            timing: timing.into(),
        }
    }

    /// Human-readable rendering: `Name (dose) — timing`.
    pub fn display(&self) -> String {
        let mut out = self.name.clone();
        if !self.dose.is_empty() {
            out.push_str(&format!(" ({})", self.dose));
        }
        if !self.timing.is_empty() {
            out.push_str(&format!(" - {}", self.timing));
        }
        out
    }
}

static DOSE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d[\d,.\s]*(mcg|mg|g|kg|iu|ml|units?|tabs?|caps?|drops?))\b").unwrap()
});
static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)[a-z0-9]+").unwrap());
static DOSE_FRAGMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+\s*(drops?|daily|caps?|tabs?)").unwrap());
static GENERIC_MED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(my\s+)?(morning|evening|night|bedtime|daily)?\s*(med|meds|medication|medications)$")
        .unwrap()
});
static GENERIC_SUPP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(my\s+)?(morning|evening|night|daily)?\s*(supplement|supplements|vitamin|vitamins)$")
        .unwrap()
});

const SUPP_STOPWORDS: &[&str] = &[
    "vitamin", "supplement", "daily", "dose", "extra", "strength", "plus", "with", "per", "and",
    "the", "for", "take", "taking",
];
const SHORT_SUPP_TOKENS: &[&str] = &["d3", "b12", "coq10", "q10", "omega3", "omega"];

const MEDICATION_KEYWORDS: &[&str] = &[
    "ezetimibe",
    "statin",
    "metformin",
    "lisinopril",
    "losartan",
    "candesartan",
    "amlodipine",
    "hydrochlorothiazide",
    "atorvastatin",
    "rosuvastatin",
    "simvastatin",
    "levothyroxine",
    "insulin",
    "semaglutide",
];

const GENERIC_MEDICATION_PHRASES: &[&str] = &[
    "med",
    "meds",
    "medication",
    "medications",
    "my med",
    "my meds",
    "my medication",
    "my medications",
    "morning med",
    "morning meds",
    "morning medication",
    "morning medications",
    "evening med",
    "evening meds",
    "night med",
    "night meds",
    "blood pressure med",
    "blood pressure meds",
    "blood pressure medication",
    "blood pressure medications",
    "bp med",
    "bp meds",
    "bp medication",
    "bp medications",
];

const GENERIC_SUPPLEMENT_PHRASES: &[&str] = &[
    "supplement",
    "supplements",
    "my supplement",
    "my supplements",
    "vitamin",
    "vitamins",
    "my vitamin",
    "my vitamins",
    "morning supplements",
    "evening supplements",
    "daily supplements",
];

const FAMILY_KEYWORDS: &[(&str, &[&str])] = &[
    ("omega3", &["omega3", "omega-3", "omega 3"]),
    ("d3", &["d3", "vitamin d", "vit d"]),
    ("b12", &["b12", "vitamin b12", "vit b12"]),
    ("coq10", &["coq10", "q10"]),
];

const SUPP_ALIASES: &[(&str, &str)] = &[
    ("d3", "Vitamin D3"),
    ("vit d3", "Vitamin D3"),
    ("vitamin d", "Vitamin D3"),
    ("b12", "Vitamin B12"),
    ("vit b12", "Vitamin B12"),
    ("coq10", "Coenzyme Q10"),
    ("omega3", "Omega-3"),
    ("omega 3", "Omega-3"),
    ("omega-3", "Omega-3"),
];

fn normalize(value: &str) -> String {
    value.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn family_from_text(text: &str) -> Option<&'static str> {
    let t = text.to_lowercase();
    FAMILY_KEYWORDS
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| t.contains(k)))
        .map(|(family, _)| *family)
}

pub fn family_matches_item(family: &str, item_name: &str) -> bool {
    let low = item_name.to_lowercase();
    FAMILY_KEYWORDS
        .iter()
        .find(|(f, _)| *f == family)
        .map(|(_, keywords)| keywords.iter().any(|k| low.contains(k)))
        .unwrap_or(false)
}

fn supp_tokens(text: &str) -> HashSet<String> {
    let mut out = HashSet::new();
    for m in TOKEN_RE.find_iter(&text.to_lowercase()) {
        let t = m.as_str();
        if t == "omega3" {
            out.insert("omega3".to_string());
            out.insert("omega".to_string());
            continue;
        }
        if SUPP_STOPWORDS.contains(&t) {
            continue;
        }
        if t.len() >= 3 || SHORT_SUPP_TOKENS.contains(&t) {
            out.insert(t.to_string());
        }
    }
    out
}

/// True for orphan fragments like "drops", "omega 3", "4 daily".
pub fn is_low_signal(name: &str) -> bool {
    let t = normalize(name);
    let tokens = supp_tokens(&t);
    if tokens.is_empty() {
        return true;
    }
    if tokens.len() == 1 {
        let only = tokens.iter().next().map(String::as_str).unwrap_or_default();
        if SHORT_SUPP_TOKENS.contains(&only) {
            return true;
        }
    }
    DOSE_FRAGMENT_RE.is_match(&t)
}

pub fn looks_like_medication(name: &str) -> bool {
    let t = name.to_lowercase();
    MEDICATION_KEYWORDS.iter().any(|k| t.contains(k))
}

pub fn is_generic_medication_name(name: &str) -> bool {
    let t = normalize(name);
    if t.is_empty() || GENERIC_MEDICATION_PHRASES.contains(&t.as_str()) {
        return true;
    }
    if GENERIC_MED_RE.is_match(&t) {
        return true;
    }
    t.contains("med") && !looks_like_medication(&t)
}

pub fn is_generic_supplement_name(name: &str) -> bool {
    let t = normalize(name);
    if t.is_empty() || GENERIC_SUPPLEMENT_PHRASES.contains(&t.as_str()) {
        return true;
    }
    GENERIC_SUPP_RE.is_match(&t)
}

fn alias_expand(name: &str) -> String {
    let key = name.to_lowercase();
    SUPP_ALIASES
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v.to_string())
        .unwrap_or_else(|| name.to_string())
}

/// Convert a legacy string or JSON object into a StructuredItem.
/// Strings like "Candesartan 4mg" are split into name + dose.
pub fn to_structured(entry: &Value) -> StructuredItem {
    if let Value::Object(map) = entry {
        return StructuredItem::new(
            map.get("name").and_then(Value::as_str).unwrap_or("").trim(),
            map.get("dose").and_then(Value::as_str).unwrap_or("").trim(),
            map.get("timing").and_then(Value::as_str).unwrap_or("").trim(),
        );
    }

    let text = match entry {
        Value::String(s) => normalize_preserve_case(s),
        other => normalize_preserve_case(&other.to_string()),
    };

    if let Some(m) = DOSE_RE.find(&text) {
        let dose = m.as_str().trim().to_string();
        let mut name = format!("{}{}", &text[..m.start()], &text[m.end()..])
            .trim()
            .to_string();
        name = name
            .trim_end_matches(|c: char| c == '+' || c == '-' || c == ',' || c.is_whitespace())
            .trim_start_matches(|c: char| c == '+' || c == '-' || c == ',' || c.is_whitespace())
            .to_string();
        if name.is_empty() {
            return StructuredItem::new(dose, "", "");
        }
        return StructuredItem::new(name, dose, "");
    }

    StructuredItem::new(text, "", "")
}

fn normalize_preserve_case(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parse DB JSON text into a list of StructuredItem.
/// Handles legacy string arrays, structured arrays, and `;`/newline text.
pub fn parse_structured_list(raw: Option<&str>) -> Vec<StructuredItem> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    let txt = raw.trim();
    if txt.is_empty() {
        return Vec::new();
    }

    if txt.starts_with('[') {
        if let Ok(Value::Array(arr)) = serde_json::from_str::<Value>(txt) {
            return arr
                .iter()
                .filter(|v| match v {
                    Value::String(s) => !s.trim().is_empty(),
                    Value::Object(_) => true,
                    _ => false,
                })
                .map(to_structured)
                .collect();
        }
    }

    // Avoid comma splitting because doses like "1,200 mcg" are common.
    if txt.contains(';') || txt.contains('\n') {
        return txt
            .split([';', '\n'])
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| to_structured(&Value::String(p.to_string())))
            .collect();
    }

    vec![to_structured(&Value::String(txt.to_string()))]
}

pub fn serialize_structured_list(items: &[StructuredItem]) -> Option<String> {
    if items.is_empty() {
        return None;
    }
    serde_json::to_string(items).ok()
}

fn merge_fields(target: &mut StructuredItem, dose: &str, timing: &str) {
    if !dose.is_empty() {
        target.dose = dose.to_string();
    }
    if !timing.is_empty() {
        target.timing = timing.to_string();
    }
}

/// Merge new items into an existing structured list.
///
/// Matching order: exact name, supplement family, token overlap. Richer names
/// win; non-empty dose/timing win; low-signal fragments are absorbed into
/// matching parents; orphans get alias expansion before insertion.
pub fn merge_structured_items(
    existing_json: Option<&str>,
    new_items: &[StructuredItem],
) -> Option<String> {
    let mut merged = parse_structured_list(existing_json);

    for new in new_items {
        let new_name = new.name.trim();
        if new_name.is_empty() {
            continue;
        }
        let new_dose = new.dose.trim();
        let new_timing = new.timing.trim();
        let new_family = family_from_text(new_name);
        let new_tokens = supp_tokens(new_name);
        let mut handled = false;

        for existing in merged.iter_mut() {
            let ex_name = existing.name.clone();

            if ex_name.to_lowercase() == new_name.to_lowercase() {
                merge_fields(existing, new_dose, new_timing);
                handled = true;
                break;
            }

            let ex_family = family_from_text(&ex_name);
            if let (Some(nf), Some(ef)) = (new_family, ex_family) {
                if nf == ef {
                    if is_low_signal(new_name) {
                        if !new_dose.is_empty() && existing.dose.is_empty() {
                            existing.dose = new_dose.to_string();
                        }
                        if !new_timing.is_empty() {
                            existing.timing = new_timing.to_string();
                        }
                    } else if is_low_signal(&ex_name) {
                        existing.name = new_name.to_string();
                        merge_fields(existing, new_dose, new_timing);
                    } else {
                        if new_name.len() > ex_name.len() {
                            existing.name = new_name.to_string();
                        }
                        merge_fields(existing, new_dose, new_timing);
                    }
                    handled = true;
                    break;
                }
            }

            let common = new_tokens.intersection(&supp_tokens(&ex_name)).count();
            if common >= 2 || (common == 1 && new_tokens.len() <= 2) {
                if is_low_signal(new_name) {
                    merge_fields(existing, new_dose, new_timing);
                } else {
                    if new_name.len() > ex_name.len() {
                        existing.name = new_name.to_string();
                    }
                    merge_fields(existing, new_dose, new_timing);
                }
                handled = true;
                break;
            }
        }

        if handled {
            continue;
        }

        if is_low_signal(new_name) {
            if let Some(family) = new_family {
                if let Some(parent) = merged
                    .iter_mut()
                    .find(|item| family_matches_item(family, &item.name))
                {
                    merge_fields(parent, new_dose, new_timing);
                    continue;
                }
            }
            merged.push(StructuredItem::new(alias_expand(new_name), new_dose, new_timing));
        } else {
            merged.push(StructuredItem::new(new_name, new_dose, new_timing));
        }
    }

    serialize_structured_list(&merged)
}

/// Parse, deduplicate, absorb orphan fragments, return cleaned JSON.
/// Re-running on its own output is a fixed point.
pub fn cleanup_structured_list(raw: Option<&str>) -> Option<String> {
    let items = parse_structured_list(raw);
    if items.is_empty() {
        return raw.map(str::to_string);
    }

    let mut cleaned: Vec<StructuredItem> = Vec::new();
    for item in items {
        let name = item.name.trim().to_string();
        if name.is_empty() {
            continue;
        }
        let dose = item.dose.trim().to_string();
        let timing = item.timing.trim().to_string();
        let family = family_from_text(&name);
        let mut merged = false;

        for existing in cleaned.iter_mut() {
            let ex_family = family_from_text(&existing.name);
            if let (Some(f), Some(ef)) = (family, ex_family) {
                if f == ef {
                    if name.len() > existing.name.len() {
                        existing.name = name.clone();
                    }
                    if !dose.is_empty() && (existing.dose.is_empty() || dose.len() > existing.dose.len())
                    {
                        existing.dose = dose.clone();
                    }
                    if !timing.is_empty() {
                        existing.timing = timing.clone();
                    }
                    merged = true;
                    break;
                }
            }
            if existing.name.to_lowercase() == name.to_lowercase() {
                merge_fields(existing, &dose, &timing);
                merged = true;
                break;
            }
        }

        if merged {
            continue;
        }

        if is_low_signal(&name) {
            if let Some(f) = family {
                if let Some(parent) = cleaned
                    .iter_mut()
                    .find(|item| family_matches_item(f, &item.name))
                {
                    merge_fields(parent, &dose, &timing);
                    continue;
                }
            }
            cleaned.push(StructuredItem::new(alias_expand(&name), dose, timing));
        } else {
            cleaned.push(StructuredItem::new(name, dose, timing));
        }
    }

    let new_json = serde_json::to_string(&cleaned).ok()?;
    match raw {
        Some(existing) if existing == new_json => Some(existing.to_string()),
        _ => Some(new_json),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn splits_name_and_dose_from_legacy_string() {
        let item = to_structured(&json!("Candesartan 4mg"));
        assert_eq!(item.name, "Candesartan");
        assert_eq!(item.dose, "4mg");
        assert_eq!(item.timing, "");
    }

    #[test]
    fn object_entries_pass_through() {
        let item = to_structured(&json!({"name": "Omega-3", "dose": "1g", "timing": "morning"}));
        assert_eq!(item, StructuredItem::new("Omega-3", "1g", "morning"));
    }

    #[test]
    fn generic_phrases_are_detected() {
        assert!(is_generic_medication_name("my morning meds"));
        assert!(is_generic_medication_name("bp meds"));
        assert!(!is_generic_medication_name("Candesartan"));
        assert!(is_generic_supplement_name("my vitamins"));
        assert!(!is_generic_supplement_name("Vitamin D3 drops"));
    }

    #[test]
    fn low_signal_fragments_absorb_into_family_parent() {
        let existing = serde_json::to_string(&[StructuredItem::new(
            "Jamieson Vitamin D3 drops",
            "",
            "",
        )])
        .unwrap();
        let merged = merge_structured_items(
            Some(&existing),
            &[StructuredItem::new("d3", "1000 IU", "morning")],
        )
        .unwrap();
        let items = parse_structured_list(Some(&merged));
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name, "Jamieson Vitamin D3 drops");
        assert_eq!(items[0].dose, "1000 IU");
        assert_eq!(items[0].timing, "morning");
    }

    #[test]
    fn orphan_fragment_gets_alias_expansion() {
        let merged =
            merge_structured_items(None, &[StructuredItem::new("omega 3", "1g", "")]).unwrap();
        let items = parse_structured_list(Some(&merged));
        assert_eq!(items[0].name, "Omega-3");
    }

    #[test]
    fn cleanup_is_a_fixed_point() {
        let raw = r#"["Candesartan 4mg", {"name": "d3"}, {"name": "Jamieson Vitamin D3", "dose": "1000 IU"}]"#;
        let once = cleanup_structured_list(Some(raw)).unwrap();
        let twice = cleanup_structured_list(Some(&once)).unwrap();
        assert_eq!(once, twice);

        // Round-trip law: parse → serialize is stable on canonical JSON.
        let items = parse_structured_list(Some(&once));
        let reserialized = serialize_structured_list(&items).unwrap();
        assert_eq!(once, reserialized);
    }

    #[test]
    fn legacy_semicolon_lists_parse() {
        let items = parse_structured_list(Some("Candesartan 4mg; Metformin 500mg"));
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].name, "Candesartan");
        assert_eq!(items[1].dose, "500mg");
    }

    #[test]
    fn commas_inside_doses_do_not_split() {
        let items = parse_structured_list(Some("B12 1,200 mcg"));
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].dose, "1,200 mcg");
    }
}
