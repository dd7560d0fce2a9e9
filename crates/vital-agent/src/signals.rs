//! Meal response signal capture: energy and GI keywords in chat become
//! structured signals linked to a meal template or food log.

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use serde_json::{json, Value};
use tracing::warn;
use vital_core::config::VitalConfig;
use vital_store::logs;

use crate::error::Result;
use crate::tools::{ToolContext, ToolRegistry};

const GI_SYMPTOM_KEYWORDS: &[(&str, &[&str])] = &[
    ("bloating", &["bloating", "bloated"]),
    ("gas", &["gas", "gassy", "flatulence"]),
    ("reflux", &["reflux", "heartburn"]),
    ("nausea", &["nausea", "nauseous"]),
    ("diarrhea", &["diarrhea", "loose stool", "loose stools"]),
    ("constipation", &["constipation", "constipated"]),
    ("cramps", &["cramps", "cramping", "stomach cramp"]),
    ("stomach_pain", &["stomach pain", "stomach ache", "abdominal pain"]),
];

const MEAL_CONTEXT_KEYWORDS: &[&str] = &[
    "meal",
    "ate",
    "eating",
    "after eating",
    "post meal",
    "breakfast",
    "lunch",
    "dinner",
    "snack",
    "food",
];

fn normalize(text: &str) -> String {
    text.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Energy level on the -2..2 scale, None when no energy cue is present.
pub fn extract_energy_level(message: &str) -> Option<i64> {
    let text = normalize(message);
    let strong_low = ["exhausted", "very tired", "crashed", "drained", "no energy"];
    let mild_low = ["tired", "low energy", "sluggish", "sleepy"];
    let mild_high = ["good energy", "energized", "more energy", "felt good"];
    let strong_high = ["great energy", "very energized", "excellent energy", "super energetic"];
    if strong_low.iter().any(|k| text.contains(k)) {
        return Some(-2);
    }
    if mild_low.iter().any(|k| text.contains(k)) {
        return Some(-1);
    }
    if strong_high.iter().any(|k| text.contains(k)) {
        return Some(2);
    }
    if mild_high.iter().any(|k| text.contains(k)) {
        return Some(1);
    }
    None
}

/// GI symptom tags plus a keyword-derived 1-5 severity.
pub fn extract_gi_signals(message: &str) -> (Vec<String>, Option<i64>) {
    let text = normalize(message);
    let tags: Vec<String> = GI_SYMPTOM_KEYWORDS
        .iter()
        .filter(|(_, variants)| variants.iter().any(|v| text.contains(v)))
        .map(|(tag, _)| tag.to_string())
        .collect();

    if tags.is_empty() {
        return (tags, None);
    }
    let severity = if ["severe", "very bad", "awful"].iter().any(|w| text.contains(w)) {
        5
    } else if ["bad", "painful", "significant"].iter().any(|w| text.contains(w)) {
        4
    } else if text.contains("moderate") {
        3
    } else if ["mild", "slight", "little"].iter().any(|w| text.contains(w)) {
        2
    } else {
        3
    };
    (tags, Some(severity))
}

fn has_meal_context(message: &str) -> bool {
    let text = normalize(message);
    MEAL_CONTEXT_KEYWORDS.iter().any(|k| text.contains(k))
}

/// Find the template (and food log) this signal most plausibly refers to:
/// explicit template-name resolution first, then the most recent
/// template-linked food log inside 12h (meal context required).
fn resolve_recent_template(
    conn: &Connection,
    registry: &ToolRegistry,
    config: &VitalConfig,
    user_id: i64,
    message: &str,
    reference_utc: DateTime<Utc>,
) -> Result<(Option<i64>, Option<i64>)> {
    let ctx = ToolContext::new(conn, user_id, "orchestrator", reference_utc, config);
    if let Ok(resolved) = registry.execute(
        "meal_template_resolve_name",
        &json!({ "query": message }),
        &ctx,
    ) {
        if let Some(matches) = resolved.get("matches").and_then(Value::as_array) {
            for top in matches.iter().take(3) {
                let score = top.get("score").and_then(Value::as_f64).unwrap_or(0.0);
                let reason = top.get("reason").and_then(Value::as_str).unwrap_or("");
                if score < 0.8 && reason != "exact_name_match" && reason != "contains_match" {
                    continue;
                }
                let Some(template_id) = top
                    .get("template")
                    .and_then(|t| t.get("id"))
                    .and_then(Value::as_i64)
                else {
                    continue;
                };
                let latest_log =
                    logs::latest_food_log_for_template(conn, user_id, template_id)?;
                return Ok((Some(template_id), latest_log.map(|l| l.id)));
            }
        }
    }

    if !has_meal_context(message) {
        return Ok((None, None));
    }
    let cutoff = reference_utc - Duration::hours(12);
    if let Some(row) = logs::latest_template_food_log_since(conn, user_id, cutoff)? {
        return Ok((row.meal_template_id, Some(row.id)));
    }
    Ok((None, None))
}

/// Capture an energy/GI signal from chat if one is present and bindable to a
/// meal. Returns true when a signal row was written.
pub fn capture_meal_response_signal(
    conn: &Connection,
    registry: &ToolRegistry,
    config: &VitalConfig,
    user_id: i64,
    message: &str,
    source_message_id: Option<i64>,
    reference_utc: DateTime<Utc>,
) -> Result<bool> {
    let energy = extract_energy_level(message);
    let (gi_tags, gi_severity) = extract_gi_signals(message);
    if energy.is_none() && gi_tags.is_empty() {
        return Ok(false);
    }
    // Generic energy chatter without meal context never binds to a meal.
    if gi_tags.is_empty() && energy.is_some() && !has_meal_context(message) {
        return Ok(false);
    }

    let (template_id, food_log_id) =
        resolve_recent_template(conn, registry, config, user_id, message, reference_utc)?;
    if template_id.is_none() && food_log_id.is_none() {
        return Ok(false);
    }

    let notes: String = message.trim().chars().take(300).collect();
    let mut payload = json!({
        "meal_template_id": template_id,
        "food_log_id": food_log_id,
        "energy_level": energy,
        "gi_symptom_tags": gi_tags,
        "gi_severity": gi_severity,
        "notes": notes,
    });
    if let Some(mid) = source_message_id {
        payload["source_message_id"] = json!(mid);
    }

    let ctx = ToolContext::new(conn, user_id, "orchestrator", reference_utc, config);
    match registry.execute("meal_response_signal_write", &payload, &ctx) {
        Ok(_) => Ok(true),
        Err(e) => {
            warn!(error = %e, "meal response signal write failed");
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vital_store::users::create_user;
    use vital_store::Store;

    #[test]
    fn energy_and_gi_extraction() {
        assert_eq!(extract_energy_level("feeling very tired after lunch"), Some(-2));
        assert_eq!(extract_energy_level("good energy today"), Some(1));
        assert_eq!(extract_energy_level("nothing notable"), None);

        let (tags, severity) = extract_gi_signals("mild bloating and some gas after dinner");
        assert!(tags.contains(&"bloating".to_string()));
        assert!(tags.contains(&"gas".to_string()));
        assert_eq!(severity, Some(2));

        let (tags, severity) = extract_gi_signals("severe heartburn");
        assert_eq!(tags, vec!["reflux".to_string()]);
        assert_eq!(severity, Some(5));
    }

    #[test]
    fn signal_binds_to_recent_template_meal() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let user = create_user(&conn, "a", "A").unwrap();
        let registry = ToolRegistry::with_default_tools();
        let config = VitalConfig::default();
        let now = Utc::now();

        let (template_id, _) = vital_store::meals::upsert_template(
            &conn,
            user.id,
            &vital_store::meals::TemplateUpsert {
                name: "Power Pancakes",
                normalized_name: "power pancakes",
                aliases_json: None,
                ingredients_json: None,
                servings: 1.0,
                calories: Some(400.0),
                protein_g: None,
                carbs_g: None,
                fat_g: None,
                fiber_g: None,
                sodium_mg: None,
                notes: None,
            },
        )
        .unwrap();
        logs::insert_food_log(
            &conn,
            &logs::NewFoodLog {
                user_id: user.id,
                meal_template_id: Some(template_id),
                logged_at: now - Duration::hours(2),
                meal_label: Some("Breakfast"),
                items_json: "[]",
                calories: None,
                protein_g: None,
                carbs_g: None,
                fat_g: None,
                fiber_g: None,
                sodium_mg: None,
                notes: None,
            },
        )
        .unwrap();

        let captured = capture_meal_response_signal(
            &conn,
            &registry,
            &config,
            user.id,
            "feeling bloated after eating the power pancakes",
            None,
            now,
        )
        .unwrap();
        assert!(captured);
        let signals = vital_store::meals::meal_signals_since(&conn, user.id, now - Duration::hours(1))
            .unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].meal_template_id, Some(template_id));
    }

    #[test]
    fn generic_energy_without_meal_context_is_skipped() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let user = create_user(&conn, "a", "A").unwrap();
        let registry = ToolRegistry::with_default_tools();
        let config = VitalConfig::default();
        let captured = capture_meal_response_signal(
            &conn, &registry, &config, user.id, "feeling tired today", None, Utc::now(),
        )
        .unwrap();
        assert!(!captured);
    }
}
