//! Structured log extraction: one prompt per logging category, a
//! deterministic fallback when the model is unavailable or answers badly,
//! and a confidence assessment over the parsed payload.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{json, Map, Value};
use tracing::warn;
use vital_core::jsonx::parse_loose_object;
use vital_core::types::{Confidence, IntentCategory};
use vital_provider::{AiProvider, ChatMessage, ChatRequest};

use crate::scope::{ModelTier, TurnScope};

pub const FALLBACK_NOTE: &str = "Deterministic fallback parse";

const PARSE_FOOD_PROMPT: &str = r#"Extract structured food logging data from this message. The user is logging what they ate or drank.

Return ONLY valid JSON with this structure:
{
    "logged_at": "ISO datetime or HH:MM or null",
    "meal_label": "Meal 1" or "Snack" or "Lunch" etc.,
    "items": [{"name": "food name", "quantity": "amount", "unit": "g/oz/cups/etc"}],
    "calories": estimated total calories (number),
    "protein_g": estimated grams (number),
    "carbs_g": estimated grams (number),
    "fat_g": estimated grams (number),
    "fiber_g": estimated grams (number),
    "sodium_mg": estimated mg (number),
    "notes": "any relevant notes"
}

Be as accurate as possible with nutritional estimates. If unsure, provide reasonable estimates and note they are estimated."#;

const PARSE_VITALS_PROMPT: &str = r#"Extract structured vitals data from this message.

Return ONLY valid JSON with this structure:
{
    "logged_at": "ISO datetime or HH:MM or null",
    "weight_kg": number or null,
    "bp_systolic": number or null,
    "bp_diastolic": number or null,
    "heart_rate": number or null,
    "blood_glucose": number or null,
    "temperature_c": number or null,
    "spo2": number or null,
    "notes": "any relevant notes"
}

Convert units if needed (lbs to kg: divide by 2.205, °F to °C: (F-32)*5/9).
Only include fields that were mentioned."#;

const PARSE_EXERCISE_PROMPT: &str = r#"Extract structured exercise data from this message.

Return ONLY valid JSON with this structure:
{
    "logged_at": "ISO datetime or HH:MM or null",
    "exercise_type": "zone2_cardio" | "strength" | "hiit" | "mobility" | "walk" | "run" | "cycling" | "swimming" | "yoga" | "other",
    "duration_minutes": number,
    "details": {"exercises": [], "sets": null, "reps": null, "weight": null, "distance": null, "incline": null, "speed": null},
    "max_hr": number or null,
    "avg_hr": number or null,
    "calories_burned": estimated number or null,
    "notes": "any relevant notes"
}"#;

const PARSE_SUPPLEMENT_PROMPT: &str = r#"Extract structured supplement/medication intake data from this message.

Return ONLY valid JSON with this structure:
{
    "logged_at": "ISO datetime or HH:MM or null",
    "supplements": [{"name": "supplement name", "dose": "amount with unit"}],
    "timing": "morning" | "with_meal" | "evening" | "pre_workout" | "post_workout",
    "notes": "any relevant notes"
}"#;

const PARSE_FASTING_PROMPT: &str = r#"Extract fasting intent from this message.

Return ONLY valid JSON with this structure:
{
    "action": "start" | "end",
    "fast_start": "ISO datetime or HH:MM or null",
    "fast_end": "ISO datetime or HH:MM or null",
    "fast_type": "training_day" | "recovery_day" | "extended" | null,
    "notes": "any relevant notes"
}"#;

const PARSE_SLEEP_PROMPT: &str = r#"Extract sleep data from this message.

Return ONLY valid JSON with this structure:
{
    "action": "start" | "end" | "auto",
    "sleep_start": "HH:MM" or null,
    "sleep_end": "HH:MM" or null,
    "duration_minutes": number or null,
    "quality": "poor" | "fair" | "good" | "excellent" | null,
    "notes": "any relevant notes"
}

Rules:
- If user indicates going to bed/sleeping now, set action to "start".
- If user indicates waking up or ending sleep, set action to "end".
- If no explicit clock time is provided, leave sleep_start/sleep_end as null.
- If uncertain, use action = "auto"."#;

const PARSE_HYDRATION_PROMPT: &str = r#"Extract hydration data from this message.

Return ONLY valid JSON with this structure:
{
    "logged_at": "ISO datetime or HH:MM or null",
    "amount_ml": number (convert cups to ml: 1 cup = 250ml, 1 glass = 250ml, 1 bottle = 500ml, 1 liter = 1000ml),
    "source": "water" | "coffee" | "tea" | "broth" | "juice" | "other",
    "notes": "any relevant notes"
}"#;

fn prompt_for(category: IntentCategory) -> Option<&'static str> {
    match category {
        IntentCategory::LogFood => Some(PARSE_FOOD_PROMPT),
        IntentCategory::LogVitals => Some(PARSE_VITALS_PROMPT),
        IntentCategory::LogExercise => Some(PARSE_EXERCISE_PROMPT),
        IntentCategory::LogSupplement => Some(PARSE_SUPPLEMENT_PROMPT),
        IntentCategory::LogFasting => Some(PARSE_FASTING_PROMPT),
        IntentCategory::LogSleep => Some(PARSE_SLEEP_PROMPT),
        IntentCategory::LogHydration => Some(PARSE_HYDRATION_PROMPT),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Clock-token helpers
// ---------------------------------------------------------------------------

static TIME_TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d{1,2}:\d{2}\s?(?:am|pm)?|\d{1,2}\s?(?:am|pm))\b").unwrap()
});

pub fn extract_time_token(message: &str) -> Option<String> {
    TIME_TOKEN_RE
        .captures(message)
        .map(|c| c[1].trim().to_string())
}

pub fn extract_time_tokens(message: &str) -> Vec<String> {
    TIME_TOKEN_RE
        .captures_iter(message)
        .map(|c| c[1].trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

fn clock_token_to_minutes(token: &str) -> Option<i64> {
    let time = vital_core::timeinfer::parse_explicit_time(&token.trim().to_lowercase())?;
    use chrono::Timelike;
    Some(time.hour() as i64 * 60 + time.minute() as i64)
}

/// Minutes between two clock tokens, rolling over midnight when needed.
fn duration_minutes_from_tokens(start: Option<&str>, end: Option<&str>) -> Option<i64> {
    let start_min = clock_token_to_minutes(start?)?;
    let mut end_min = clock_token_to_minutes(end?)?;
    if end_min < start_min {
        end_min += 24 * 60;
    }
    Some((end_min - start_min).max(0))
}

// ---------------------------------------------------------------------------
// Deterministic fallbacks
// ---------------------------------------------------------------------------

fn normalize(text: &str) -> String {
    text.trim().split_whitespace().collect::<Vec<_>>().join(" ")
}

fn time_token_value(message: &str) -> Value {
    match extract_time_token(message) {
        Some(token) => json!(token),
        None => Value::Null,
    }
}

static CALORIES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{1,4})\s*(?:kcal|cal|calories?)\b").unwrap());
static SPLIT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i),|\band\b").unwrap());
static MEAL_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bfor (breakfast|lunch|dinner|snack)\b").unwrap());

fn deterministic_food_parse(message: &str) -> Value {
    let text = normalize(message);
    let lowered = text.to_lowercase();
    let meal_label = if lowered.contains("breakfast") {
        "Breakfast"
    } else if lowered.contains("lunch") {
        "Lunch"
    } else if lowered.contains("dinner") {
        "Dinner"
    } else if lowered.contains("snack") {
        "Snack"
    } else {
        "Meal"
    };

    let mut base = text.clone();
    for cue in ["i had ", "i ate ", "i drank "] {
        if let Some(idx) = lowered.find(cue) {
            base = text[idx + cue.len()..].to_string();
            break;
        }
    }
    base = MEAL_TAG_RE.replace_all(&base, "").trim_matches([' ', '.']).to_string();
    if base.is_empty() {
        base = text.clone();
    }

    let mut items: Vec<Value> = SPLIT_RE
        .split(&base)
        .map(|raw| normalize(raw).trim_matches([' ', '.']).to_string())
        .filter(|name| !name.is_empty())
        .map(|name| json!({"name": name, "quantity": "", "unit": ""}))
        .collect();
    if items.is_empty() {
        items = vec![json!({"name": base, "quantity": "", "unit": ""})];
    }

    let calories = CALORIES_RE
        .captures(&lowered)
        .and_then(|c| c[1].parse::<f64>().ok());

    json!({
        "logged_at": time_token_value(message),
        "meal_label": meal_label,
        "items": items,
        "calories": calories,
        "protein_g": null,
        "carbs_g": null,
        "fat_g": null,
        "fiber_g": null,
        "sodium_mg": null,
        "notes": FALLBACK_NOTE,
    })
}

static BP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{2,3})\s*/\s*(\d{2,3})\b").unwrap());
static WEIGHT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{2,3}(?:\.\d+)?)\s*(kg|lbs?)\b").unwrap());
static HR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:heart rate|hr)\s*(?:is|at|:)?\s*(\d{2,3})\b").unwrap());

fn deterministic_vitals_parse(message: &str) -> Value {
    let lowered = message.to_lowercase();
    let (bp_sys, bp_dia) = BP_RE
        .captures(&lowered)
        .map(|c| {
            (
                c[1].parse::<i64>().ok(),
                c[2].parse::<i64>().ok(),
            )
        })
        .unwrap_or((None, None));

    let weight = WEIGHT_RE.captures(&lowered).and_then(|c| {
        let value = c[1].parse::<f64>().ok()?;
        Some(if c[2].starts_with("lb") {
            (vital_core::units::lb_to_kg(value) * 1000.0).round() / 1000.0
        } else {
            value
        })
    });

    let hr = HR_RE.captures(&lowered).and_then(|c| c[1].parse::<i64>().ok());

    json!({
        "logged_at": time_token_value(message),
        "weight_kg": weight,
        "bp_systolic": bp_sys,
        "bp_diastolic": bp_dia,
        "heart_rate": hr,
        "blood_glucose": null,
        "temperature_c": null,
        "spo2": null,
        "notes": FALLBACK_NOTE,
    })
}

static DURATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{1,3})\s*(?:min|mins|minutes)\b").unwrap());

fn deterministic_exercise_parse(message: &str) -> Value {
    let lowered = message.to_lowercase();
    let mapping = [
        ("strength", "strength"),
        ("hiit", "hiit"),
        ("walk", "walk"),
        ("run", "run"),
        ("cycling", "cycling"),
        ("bike", "cycling"),
        ("swim", "swimming"),
        ("yoga", "yoga"),
        ("mobility", "mobility"),
        ("zone 2", "zone2_cardio"),
    ];
    let exercise_type = mapping
        .iter()
        .find(|(cue, _)| lowered.contains(cue))
        .map(|(_, t)| *t)
        .unwrap_or("other");

    let duration = DURATION_RE
        .captures(&lowered)
        .and_then(|c| c[1].parse::<i64>().ok());

    json!({
        "logged_at": time_token_value(message),
        "exercise_type": exercise_type,
        "duration_minutes": duration,
        "details": {},
        "max_hr": null,
        "avg_hr": null,
        "calories_burned": null,
        "notes": FALLBACK_NOTE,
    })
}

fn deterministic_supplement_parse(message: &str) -> Option<Value> {
    let text = normalize(message);
    let lowered = text.to_lowercase();
    let mut base = text.clone();
    for cue in ["i took ", "took my ", "had my ", "i had ", "i take "] {
        if let Some(idx) = lowered.find(cue) {
            base = text[idx + cue.len()..].to_string();
            break;
        }
    }
    let base = base.trim_matches([' ', '.']).to_string();
    if base.is_empty() {
        return None;
    }

    let supplements: Vec<Value> = SPLIT_RE
        .split(&base)
        .map(|raw| normalize(raw).trim_matches([' ', '.']).to_string())
        .filter(|name| !name.is_empty())
        .map(|name| json!({"name": name, "dose": ""}))
        .collect();
    if supplements.is_empty() {
        return None;
    }

    let timing = if lowered.contains("morning") {
        "morning"
    } else if lowered.contains("lunch") || lowered.contains("dinner") {
        "with_meal"
    } else if lowered.contains("evening") || lowered.contains("bedtime") {
        "evening"
    } else {
        ""
    };

    Some(json!({
        "logged_at": time_token_value(message),
        "supplements": supplements,
        "timing": timing,
        "notes": FALLBACK_NOTE,
    }))
}

fn deterministic_fasting_parse(message: &str) -> Value {
    let lowered = message.to_lowercase();
    let time_tokens = extract_time_tokens(message);
    let has_last_first_meal =
        lowered.contains("last meal") && lowered.contains("first meal") && time_tokens.len() >= 2;
    let end_cues = [
        "end fast",
        "broke my fast",
        "break fast",
        "finished fast",
        "stop fast",
        "first meal",
    ];
    let action = if has_last_first_meal || end_cues.iter().any(|k| lowered.contains(k)) {
        "end"
    } else {
        "start"
    };

    let (fast_start, fast_end): (Option<String>, Option<String>) = if has_last_first_meal {
        (Some(time_tokens[0].clone()), Some(time_tokens[1].clone()))
    } else if action == "start" {
        (extract_time_token(message), None)
    } else if time_tokens.len() >= 2
        && lowered.contains("from")
        && (lowered.contains("to") || lowered.contains("until") || lowered.contains("till"))
    {
        (Some(time_tokens[0].clone()), Some(time_tokens[1].clone()))
    } else {
        (None, extract_time_token(message))
    };

    json!({
        "action": action,
        "fast_start": fast_start,
        "fast_end": fast_end,
        "fast_type": null,
        "notes": FALLBACK_NOTE,
    })
}

const SLEEP_END_CUES: [&str; 5] = ["woke up", "wake up", "got up", "slept", "sleep end"];
const SLEEP_START_CUES: [&str; 7] = [
    "going to bed",
    "go to bed",
    "bedtime",
    "sleep now",
    "going to sleep",
    "went to bed",
    "fell asleep",
];

fn deterministic_sleep_parse(message: &str) -> Value {
    let lowered = message.to_lowercase();
    let time_tokens = extract_time_tokens(message);
    let has_end_cue = SLEEP_END_CUES.iter().any(|k| lowered.contains(k));
    let has_start_cue = SLEEP_START_CUES.iter().any(|k| lowered.contains(k));
    let action = if has_end_cue {
        "end"
    } else if has_start_cue {
        "start"
    } else {
        "auto"
    };

    let mut sleep_start: Option<String> = None;
    let mut sleep_end: Option<String> = None;
    if has_start_cue && has_end_cue && time_tokens.len() >= 2 {
        let start_pos = SLEEP_START_CUES
            .iter()
            .filter_map(|cue| lowered.find(cue))
            .min();
        let end_pos = SLEEP_END_CUES
            .iter()
            .filter_map(|cue| lowered.find(cue))
            .min();
        // When the wake-up clause comes first, the first token is the end time.
        if matches!((start_pos, end_pos), (Some(s), Some(e)) if e < s) {
            sleep_end = Some(time_tokens[0].clone());
            sleep_start = Some(time_tokens[1].clone());
        } else {
            sleep_start = Some(time_tokens[0].clone());
            sleep_end = Some(time_tokens[1].clone());
        }
    } else if action == "start" && !time_tokens.is_empty() {
        sleep_start = Some(time_tokens[0].clone());
    } else if action == "end" && !time_tokens.is_empty() {
        sleep_end = Some(time_tokens[0].clone());
    }

    let duration_minutes =
        duration_minutes_from_tokens(sleep_start.as_deref(), sleep_end.as_deref());

    json!({
        "action": action,
        "sleep_start": sleep_start,
        "sleep_end": sleep_end,
        "duration_minutes": duration_minutes,
        "quality": null,
        "notes": FALLBACK_NOTE,
    })
}

static HYDRATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(\d+(?:\.\d+)?)\s*(ml|milliliters?|l|liters?|oz|ounces?|cups?|glass(?:es)?|bottles?)\b",
    )
    .unwrap()
});

fn deterministic_hydration_parse(message: &str) -> Value {
    let lowered = message.to_lowercase();
    let mut amount_ml = 250.0_f64;
    if let Some(c) = HYDRATION_RE.captures(&lowered) {
        if let Ok(value) = c[1].parse::<f64>() {
            let unit = &c[2];
            amount_ml = if unit.starts_with("ml") || unit.starts_with("millil") {
                value
            } else if unit.starts_with('l') {
                value * 1000.0
            } else if unit.starts_with("oz") || unit.starts_with("ounce") {
                value * 29.5735
            } else if unit.starts_with("cup") || unit.starts_with("glass") {
                value * 250.0
            } else {
                // bottles
                value * 500.0
            };
        }
    }

    let source = if lowered.contains("coffee") {
        "coffee"
    } else if lowered.contains("tea") {
        "tea"
    } else if lowered.contains("juice") {
        "juice"
    } else {
        "water"
    };

    json!({
        "logged_at": time_token_value(message),
        "amount_ml": (amount_ml * 100.0).round() / 100.0,
        "source": source,
        "notes": FALLBACK_NOTE,
    })
}

pub fn deterministic_parse(message: &str, category: IntentCategory) -> Option<Value> {
    match category {
        IntentCategory::LogFood => Some(deterministic_food_parse(message)),
        IntentCategory::LogVitals => Some(deterministic_vitals_parse(message)),
        IntentCategory::LogExercise => Some(deterministic_exercise_parse(message)),
        IntentCategory::LogSupplement => deterministic_supplement_parse(message),
        IntentCategory::LogFasting => Some(deterministic_fasting_parse(message)),
        IntentCategory::LogSleep => Some(deterministic_sleep_parse(message)),
        IntentCategory::LogHydration => Some(deterministic_hydration_parse(message)),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Model parse
// ---------------------------------------------------------------------------

/// Parse structured data from a free-form message with the utility model,
/// falling back to the deterministic extractors.
pub async fn parse_log_data(
    provider: &dyn AiProvider,
    message: &str,
    category: IntentCategory,
    user_profile_hint: &str,
    allow_model_call: bool,
    scope: &mut TurnScope,
) -> Option<Value> {
    let prompt = prompt_for(category)?;
    if !allow_model_call {
        return deterministic_parse(message, category);
    }

    let context = if user_profile_hint.is_empty() {
        String::new()
    } else {
        format!("\nUser context: {user_profile_hint}\n")
    };
    let operation = format!("log_parse:{category}");
    let req = ChatRequest::new(
        provider.utility_model(),
        "You are a data extraction assistant. Return only valid JSON, no explanation.",
        vec![ChatMessage::user(format!("{prompt}{context}\n\nMessage: {message}"))],
    );

    match provider.chat(&req).await {
        Ok(resp) => {
            scope.record_call(ModelTier::Utility, resp.tokens_in, resp.tokens_out);
            match parse_loose_object(&resp.content) {
                Some(map) => Some(Value::Object(map)),
                None => {
                    warn!(%category, "log parsing returned non-object; falling back");
                    scope.record_failure(ModelTier::Utility, &operation, "non-object answer");
                    deterministic_parse(message, category)
                }
            }
        }
        Err(e) => {
            warn!(%category, error = %e, "log parsing failed; falling back");
            scope.record_failure(ModelTier::Utility, &operation, &e.to_string());
            deterministic_parse(message, category)
        }
    }
}

// ---------------------------------------------------------------------------
// Confidence assessment
// ---------------------------------------------------------------------------

fn critical_fields(category: IntentCategory) -> &'static [&'static str] {
    match category {
        IntentCategory::LogFood => &["items"],
        IntentCategory::LogExercise => &["exercise_type"],
        IntentCategory::LogSupplement => &["supplements"],
        IntentCategory::LogHydration => &["amount_ml"],
        // Any single vital is useful; action alone is useful for sleep/fasting.
        _ => &[],
    }
}

fn notable_fields(category: IntentCategory) -> &'static [&'static str] {
    match category {
        IntentCategory::LogFood => &["items", "calories", "protein_g", "carbs_g", "fat_g", "fiber_g"],
        IntentCategory::LogVitals => &[
            "weight_kg",
            "bp_systolic",
            "bp_diastolic",
            "heart_rate",
            "blood_glucose",
        ],
        IntentCategory::LogExercise => &["exercise_type", "duration_minutes", "calories_burned"],
        IntentCategory::LogSupplement => &["supplements"],
        IntentCategory::LogHydration => &["amount_ml", "source"],
        IntentCategory::LogSleep => &["sleep_start", "sleep_end", "duration_minutes", "quality"],
        IntentCategory::LogFasting => &["fast_start", "fast_end", "duration_minutes"],
        _ => &[],
    }
}

fn is_empty_value(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Array(a)) => a.is_empty(),
        _ => false,
    }
}

/// Score parse quality: `(confidence, missing notable field names)`.
/// A fallback marker or missing critical field forces `low`. These
/// annotations gate the time-confirmation flow; saves are never rejected on
/// confidence alone.
pub fn assess_parse_confidence(
    parsed: &Map<String, Value>,
    category: IntentCategory,
) -> (Confidence, Vec<String>) {
    let notes = parsed
        .get("notes")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_lowercase();
    let is_fallback = notes.contains("deterministic fallback") || notes.contains("low-confidence");

    let critical = critical_fields(category);
    let notable = notable_fields(category);

    let critical_missing = critical
        .iter()
        .any(|f| is_empty_value(parsed.get(*f)));
    let notable_missing: Vec<String> = notable
        .iter()
        .filter(|f| is_empty_value(parsed.get(**f)))
        .map(|f| f.replace('_', " "))
        .collect();
    let notable_present = notable.len() - notable_missing.len();

    if is_fallback || critical_missing {
        return (Confidence::Low, notable_missing);
    }
    if !notable.is_empty() && notable_present * 2 <= notable.len() {
        return (Confidence::Medium, notable_missing);
    }
    (Confidence::High, notable_missing)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(value: &Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn food_fallback_extracts_items_and_label() {
        let parsed = deterministic_food_parse("I had oatmeal and coffee for breakfast");
        assert_eq!(parsed["meal_label"], "Breakfast");
        let names: Vec<&str> = parsed["items"]
            .as_array()
            .unwrap()
            .iter()
            .map(|i| i["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["oatmeal", "coffee"]);
        assert_eq!(parsed["notes"], FALLBACK_NOTE);
    }

    #[test]
    fn vitals_fallback_reads_bp_pair_and_weight() {
        let parsed = deterministic_vitals_parse("bp 128/84 hr 72 just now");
        assert_eq!(parsed["bp_systolic"], 128);
        assert_eq!(parsed["bp_diastolic"], 84);
        assert_eq!(parsed["heart_rate"], 72);

        let with_weight = deterministic_vitals_parse("weighed 180 lbs this morning");
        let kg = with_weight["weight_kg"].as_f64().unwrap();
        assert!((kg - 81.633).abs() < 0.01, "kg = {kg}");
    }

    #[test]
    fn hydration_fallback_applies_unit_table() {
        let parsed = deterministic_hydration_parse("drank 2 cups of water");
        assert_eq!(parsed["amount_ml"], 500.0);
        let bottle = deterministic_hydration_parse("had a 1 bottle of water");
        assert_eq!(bottle["amount_ml"], 500.0);
        let coffee = deterministic_hydration_parse("drank 8 oz coffee");
        assert_eq!(coffee["source"], "coffee");
        let ml = coffee["amount_ml"].as_f64().unwrap();
        assert!((ml - 236.59).abs() < 0.01);
    }

    #[test]
    fn fasting_fallback_reads_last_and_first_meal_pair() {
        let parsed =
            deterministic_fasting_parse("last meal was 8pm, first meal today at 12:30pm");
        assert_eq!(parsed["action"], "end");
        assert_eq!(parsed["fast_start"], "8pm");
        assert_eq!(parsed["fast_end"], "12:30pm");
    }

    #[test]
    fn sleep_fallback_computes_midnight_crossing_duration() {
        let parsed = deterministic_sleep_parse("went to bed at 11pm and woke up at 7am");
        assert_eq!(parsed["action"], "end");
        assert_eq!(parsed["sleep_start"], "11pm");
        assert_eq!(parsed["sleep_end"], "7am");
        assert_eq!(parsed["duration_minutes"], 480);
    }

    #[test]
    fn sleep_fallback_handles_wake_first_order() {
        let parsed = deterministic_sleep_parse("woke up at 7am after going to bed at 11pm");
        assert_eq!(parsed["sleep_start"], "11pm");
        assert_eq!(parsed["sleep_end"], "7am");
    }

    #[test]
    fn fallback_marker_forces_low_confidence() {
        let parsed = obj(&deterministic_food_parse("I had oatmeal for breakfast"));
        let (confidence, missing) = assess_parse_confidence(&parsed, IntentCategory::LogFood);
        assert_eq!(confidence, Confidence::Low);
        assert!(missing.contains(&"calories".to_string()));
    }

    #[test]
    fn rich_model_parse_scores_high() {
        let parsed = obj(&json!({
            "logged_at": "2026-02-21T15:00:00Z",
            "meal_label": "Lunch",
            "items": [{"name": "chicken bowl"}],
            "calories": 650, "protein_g": 45, "carbs_g": 60, "fat_g": 20, "fiber_g": 9,
            "sodium_mg": 900,
            "notes": "estimated from typical bowl",
        }));
        let (confidence, missing) = assess_parse_confidence(&parsed, IntentCategory::LogFood);
        assert_eq!(confidence, Confidence::High);
        assert!(missing.is_empty());
    }

    #[test]
    fn missing_critical_field_is_low() {
        let parsed = obj(&json!({"items": [], "notes": "model parse"}));
        let (confidence, _) = assess_parse_confidence(&parsed, IntentCategory::LogFood);
        assert_eq!(confidence, Confidence::Low);
    }

    #[test]
    fn sparse_vitals_parse_is_medium() {
        let parsed = obj(&json!({
            "bp_systolic": 128, "bp_diastolic": 84,
            "weight_kg": null, "heart_rate": null, "blood_glucose": null,
            "notes": "model parse",
        }));
        let (confidence, _) = assess_parse_confidence(&parsed, IntentCategory::LogVitals);
        assert_eq!(confidence, Confidence::Medium);
    }

    #[test]
    fn time_tokens_are_found_in_order() {
        let tokens = extract_time_tokens("from 8:30pm until 12:15 pm next day");
        assert_eq!(tokens, vec!["8:30pm", "12:15 pm"]);
        assert_eq!(extract_time_token("no clock here"), None);
    }
}
