//! Checklist sync from chat: combine extraction matches with the resolver
//! tool to mark today's medication/supplement items completed.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde_json::{json, Value};
use tracing::warn;
use vital_core::config::VitalConfig;
use vital_core::items::{
    is_generic_medication_name, is_generic_supplement_name, parse_structured_list,
};
use vital_core::timeinfer::infer_target_date_iso;
use vital_store::users;

use crate::error::Result;
use crate::profile_sync::known_name_matches;
use crate::tools::health::BP_MED_HINTS;
use crate::tools::{ToolContext, ToolRegistry};

const TOOK_SIGNALS: &[&str] = &[
    "took",
    "taken",
    "had my",
    "i did my",
    "this morning",
    "this evening",
    "just took",
];

const SUPPLEMENT_INTAKE_PHRASES: &[&str] = &[
    "supplement",
    "supplements",
    "vitamin",
    "vitamins",
    "multivitamin",
    "stack",
    "fat burner",
    "omega",
    "coq10",
    "creatine",
];

fn normalize(text: &str) -> String {
    text.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

fn normalize_alnum(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

fn has_took_signal(text: &str) -> bool {
    let t = text.to_lowercase();
    TOOK_SIGNALS.iter().any(|k| t.contains(k))
}

fn looks_like_medication_intake(text: &str, med_names: &[String]) -> bool {
    let normalized = normalize(text);
    let alnum = normalize_alnum(text);
    if med_names.iter().any(|name| {
        normalized.contains(&name.to_lowercase()) || alnum.contains(&normalize_alnum(name))
    }) {
        return true;
    }
    [
        "medication",
        "medications",
        "med",
        "meds",
        "blood pressure",
        "bp meds",
        "bp medications",
    ]
    .iter()
    .any(|p| normalized.contains(p))
}

fn looks_like_supplement_intake(text: &str, supp_names: &[String]) -> bool {
    let normalized = normalize(text);
    let alnum = normalize_alnum(text);
    if supp_names.iter().any(|name| {
        normalized.contains(&name.to_lowercase()) || alnum.contains(&normalize_alnum(name))
    }) {
        return true;
    }
    SUPPLEMENT_INTAKE_PHRASES.iter().any(|p| normalized.contains(p))
}

fn resolver_targets(
    registry: &ToolRegistry,
    ctx: &ToolContext<'_>,
    tool: &str,
    query: &str,
    allowed: &[String],
) -> Vec<String> {
    let mut targets = Vec::new();
    match registry.execute(tool, &json!({ "query": query }), ctx) {
        Ok(out) => {
            if let Some(matches) = out.get("matches").and_then(Value::as_array) {
                for m in matches {
                    let Some(name) = m.get("name").and_then(Value::as_str).map(str::trim) else {
                        continue;
                    };
                    if allowed.iter().any(|a| a == name) && !targets.iter().any(|t| t == name) {
                        targets.push(name.to_string());
                    }
                }
            }
        }
        Err(e) => warn!(tool, error = %e, "resolver tool failed"),
    }
    targets
}

fn mark(
    registry: &ToolRegistry,
    ctx: &ToolContext<'_>,
    item_type: &str,
    targets: &[String],
    target_date: &str,
) {
    let args = json!({
        "item_type": item_type,
        "names": targets,
        "target_date": target_date,
        "completed": true,
    });
    if let Err(e) = registry.execute("checklist_mark_taken", &args, ctx) {
        warn!(item_type, error = %e, "checklist write tool failed");
    }
}

/// Mark today's medication checklist items completed based on message intent.
#[allow(clippy::too_many_arguments)]
pub fn mark_checklist_for_medications(
    conn: &Connection,
    registry: &ToolRegistry,
    config: &VitalConfig,
    user_id: i64,
    combined_input: &str,
    reference_utc: DateTime<Utc>,
    extracted_matches: &[String],
) -> Result<()> {
    if !has_took_signal(combined_input) {
        return Ok(());
    }
    let settings = users::get_settings(conn, user_id)?;
    let med_names: Vec<String> = parse_structured_list(settings.medications.as_deref())
        .into_iter()
        .map(|m| m.name)
        .filter(|n| !n.is_empty() && !is_generic_medication_name(n))
        .collect();
    if med_names.is_empty() || !looks_like_medication_intake(combined_input, &med_names) {
        return Ok(());
    }

    let text = combined_input.to_lowercase();
    let ctx = ToolContext::new(conn, user_id, "orchestrator", reference_utc, config);

    let extracted = known_name_matches(extracted_matches, &med_names);
    let mentioned: Vec<String> = med_names
        .iter()
        .filter(|n| text.contains(&n.to_lowercase()))
        .cloned()
        .collect();
    let mut targets = if !extracted.is_empty() {
        extracted
    } else if !mentioned.is_empty() {
        mentioned
    } else {
        resolver_targets(
            registry,
            &ctx,
            "medication_resolve_reference",
            combined_input,
            &med_names,
        )
    };

    // Last resort: an explicit BP phrase expands to the BP meds.
    if targets.is_empty() && (text.contains("blood pressure") || format!("{text} ").contains("bp ")) {
        targets = med_names
            .iter()
            .filter(|n| {
                let low = n.to_lowercase();
                BP_MED_HINTS.iter().any(|k| low.contains(k))
            })
            .cloned()
            .collect();
    }
    if targets.is_empty() {
        return Ok(());
    }

    let target_date = infer_target_date_iso(
        combined_input,
        Some(reference_utc),
        settings.timezone.as_deref(),
    );
    mark(registry, &ctx, "medication", &targets, &target_date);
    Ok(())
}

/// Mark today's supplement checklist items completed based on intake intent.
#[allow(clippy::too_many_arguments)]
pub fn mark_checklist_for_supplements(
    conn: &Connection,
    registry: &ToolRegistry,
    config: &VitalConfig,
    user_id: i64,
    combined_input: &str,
    reference_utc: DateTime<Utc>,
    extracted_matches: &[String],
) -> Result<()> {
    if !has_took_signal(combined_input) {
        return Ok(());
    }
    let settings = users::get_settings(conn, user_id)?;
    let supp_names: Vec<String> = parse_structured_list(settings.supplements.as_deref())
        .into_iter()
        .map(|s| s.name.trim().to_string())
        .filter(|n| !n.is_empty() && !is_generic_supplement_name(n))
        .collect();
    if supp_names.is_empty() || !looks_like_supplement_intake(combined_input, &supp_names) {
        return Ok(());
    }

    let text = combined_input.to_lowercase();
    let norm_text = normalize_alnum(combined_input);
    let ctx = ToolContext::new(conn, user_id, "orchestrator", reference_utc, config);

    let extracted = known_name_matches(extracted_matches, &supp_names);
    let mut targets: Vec<String> = if !extracted.is_empty() {
        extracted
    } else {
        // Direct / normalized match handles short entries like "IM8".
        supp_names
            .iter()
            .filter(|name| {
                let low = name.to_lowercase();
                let norm = normalize_alnum(name);
                text.contains(&low) || (!norm.is_empty() && norm_text.contains(&norm))
            })
            .cloned()
            .collect()
    };

    if targets.is_empty() {
        targets = resolver_targets(
            registry,
            &ctx,
            "supplement_resolve_reference",
            combined_input,
            &supp_names,
        );
    }

    // Explicit group phrases expand to the full list.
    if targets.is_empty()
        && (text.contains("my supplements") || text.contains("my vitamin") || text.contains("my vitamins"))
    {
        targets = supp_names.clone();
    }
    if targets.is_empty() {
        return Ok(());
    }

    let target_date = infer_target_date_iso(
        combined_input,
        Some(reference_utc),
        settings.timezone.as_deref(),
    );
    mark(registry, &ctx, "supplement", &targets, &target_date);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vital_store::users::{create_user, set_settings_field};
    use vital_store::Store;

    fn setup_with_meds() -> (Store, i64, ToolRegistry, VitalConfig) {
        let store = Store::open_in_memory().unwrap();
        let user_id = {
            let conn = store.conn();
            let user = create_user(&conn, "a", "A").unwrap();
            set_settings_field(&conn, user.id, "timezone", Some("America/Edmonton")).unwrap();
            set_settings_field(
                &conn,
                user.id,
                "medications",
                Some(r#"[{"name":"Candesartan","dose":"4mg","timing":"morning"},
                         {"name":"Metformin","dose":"500mg","timing":"with dinner"}]"#),
            )
            .unwrap();
            set_settings_field(
                &conn,
                user.id,
                "supplements",
                Some(r#"[{"name":"Omega-3","dose":"1g","timing":"morning"},
                         {"name":"IM8","dose":"1 scoop","timing":"morning"}]"#),
            )
            .unwrap();
            user.id
        };
        (store, user_id, ToolRegistry::with_default_tools(), VitalConfig::default())
    }

    #[test]
    fn bp_med_phrase_marks_previous_local_day_after_midnight() {
        let (store, user_id, registry, config) = setup_with_meds();
        let conn = store.conn();
        // 2026-02-22 01:30 local in Edmonton (UTC-7) = 08:30 UTC.
        let reference = chrono::DateTime::parse_from_rfc3339("2026-02-22T08:30:00Z")
            .unwrap()
            .with_timezone(&Utc);

        mark_checklist_for_medications(
            &conn,
            &registry,
            &config,
            user_id,
            "Took my blood pressure meds at 8:30pm",
            reference,
            &[],
        )
        .unwrap();

        let items =
            vital_store::checklist::items_for_date(&conn, user_id, "2026-02-21").unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].item_name, "Candesartan");
        assert!(items[0].completed);
    }

    #[test]
    fn group_phrase_marks_all_supplements() {
        let (store, user_id, registry, config) = setup_with_meds();
        let conn = store.conn();
        let reference = Utc::now();
        mark_checklist_for_supplements(
            &conn,
            &registry,
            &config,
            user_id,
            "just took my supplements",
            reference,
            &[],
        )
        .unwrap();
        let tz = vital_core::timeinfer::resolve_tz(Some("America/Edmonton"));
        let today = reference.with_timezone(&tz).date_naive().format("%Y-%m-%d").to_string();
        let items = vital_store::checklist::items_for_date(&conn, user_id, &today).unwrap();
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn no_took_signal_means_no_writes() {
        let (store, user_id, registry, config) = setup_with_meds();
        let conn = store.conn();
        mark_checklist_for_medications(
            &conn, &registry, &config, user_id, "what are my medications?", Utc::now(), &[],
        )
        .unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM daily_checklist_items", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn normalized_name_match_handles_compact_entries() {
        let (store, user_id, registry, config) = setup_with_meds();
        let conn = store.conn();
        // 09:00 local on 2026-02-21 in Edmonton.
        let reference = chrono::DateTime::parse_from_rfc3339("2026-02-21T16:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        mark_checklist_for_supplements(
            &conn, &registry, &config, user_id, "took my I M 8 this morning", reference, &[],
        )
        .unwrap();
        let items = vital_store::checklist::items_for_date(&conn, user_id, "2026-02-21").unwrap();
        assert!(items.iter().any(|i| i.item_name == "IM8"));
    }
}
