//! Read-side tools: profile, med/supplement reference resolution, meal
//! templates, meal response insights, and conversation search.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use chrono::{Duration, Utc};
use regex::Regex;
use serde_json::{json, Map, Value};
use vital_core::items::parse_structured_list;
use vital_store::types::MealTemplateRow;
use vital_store::{logs, meals, messages};

use super::{arg_i64, arg_str, require_str, ToolContext, ToolError, ToolRegistry, ToolResult, ToolSpec};

pub(crate) const BP_MED_HINTS: &[&str] = &[
    "candesartan",
    "lisinopril",
    "losartan",
    "amlodipine",
    "hydrochlorothiazide",
    "hctz",
    "metoprolol",
    "atenolol",
    "valsartan",
];

const VITAMIN_HINTS: &[&str] = &["vitamin", "multi", "multivitamin", "b12", "d3", "omega", "coq10"];

const TIMING_HINTS: &[(&str, &[&str])] = &[
    ("morning", &["morning", "with breakfast"]),
    ("evening", &["evening", "with dinner", "bedtime"]),
    ("lunch", &["with lunch"]),
    ("breakfast", &["with breakfast"]),
    ("dinner", &["with dinner"]),
    ("bedtime", &["bedtime"]),
];

static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[a-z0-9]+").unwrap());

fn normalize(text: &str) -> String {
    text.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

fn tokens(text: &str) -> HashSet<String> {
    TOKEN_RE
        .find_iter(&normalize(text))
        .map(|m| m.as_str().to_string())
        .collect()
}

fn query_timing_targets(query: &str) -> HashSet<String> {
    let q = normalize(query);
    let mut out = HashSet::new();
    for (hint, timings) in TIMING_HINTS {
        if q.contains(hint) {
            out.extend(timings.iter().map(|t| t.to_string()));
        }
    }
    out
}

fn item_matches_timing(timing: &str, targets: &HashSet<String>) -> bool {
    if targets.is_empty() {
        return false;
    }
    let t = normalize(timing);
    !t.is_empty() && targets.contains(&t)
}

/// Resolve phrases like "morning meds" / "blood pressure meds" / "my
/// vitamins" against the user's canonical structured list. Matches carry a
/// score and reason; the best per name wins.
pub(crate) fn resolve_structured_reference(
    query: &str,
    items: &[vital_core::items::StructuredItem],
    domain: &str,
) -> Vec<Value> {
    if items.is_empty() {
        return Vec::new();
    }

    let q_norm = normalize(query);
    let q_tokens = tokens(query);
    let q_timing = query_timing_targets(query);
    let mut matches: Vec<Value> = Vec::new();
    fn push(
        matches: &mut Vec<Value>,
        item: &vital_core::items::StructuredItem,
        score: f64,
        reason: &str,
    ) {
        matches.push(json!({
            "name": item.name,
            "dose": item.dose,
            "timing": item.timing,
            "score": (score * 1000.0).round() / 1000.0,
            "reason": reason,
        }));
    }

    if domain == "medication" && (q_norm.contains("blood pressure") || q_norm.contains("bp med")) {
        for item in items {
            let name = normalize(&item.name);
            if BP_MED_HINTS.iter().any(|k| name.contains(k)) {
                push(&mut matches, item, 0.95, "bp_keyword");
            }
        }
    }
    if domain == "supplement" && (q_norm.contains("vitamin") || q_norm.contains("vitamins")) {
        for item in items {
            let name = normalize(&item.name);
            if VITAMIN_HINTS.iter().any(|k| name.contains(k)) {
                push(&mut matches, item, 0.9, "vitamin_keyword");
            }
        }
    }

    for item in items {
        if item.name.is_empty() {
            continue;
        }
        let n_norm = normalize(&item.name);

        if !n_norm.is_empty() && q_norm.contains(&n_norm) {
            push(&mut matches, item, 1.0, "direct_name_match");
            continue;
        }

        if item_matches_timing(&item.timing, &q_timing) {
            let domain_mentioned = (domain == "medication"
                && (q_norm.contains("med") || q_norm.contains("medication")))
                || (domain == "supplement"
                    && (q_norm.contains("supplement") || q_norm.contains("vitamin")));
            if domain_mentioned {
                push(&mut matches, item, 0.85, "timing_group_match");
                continue;
            }
        }

        let n_tokens = tokens(&item.name);
        if n_tokens.is_empty() {
            continue;
        }
        let overlap = q_tokens.intersection(&n_tokens).count();
        if overlap == 0 {
            continue;
        }
        let score = overlap as f64 / n_tokens.len().max(1) as f64;
        if score >= 0.34 {
            push(&mut matches, item, score, "token_overlap");
        }
    }

    // Generic group phrases land only when nothing else matched.
    if matches.is_empty() {
        let generic_med = domain == "medication"
            && (q_norm.contains("my meds") || q_norm.contains("my medication"));
        let generic_supp = domain == "supplement"
            && (q_norm.contains("my supplements")
                || q_norm.contains("my vitamin")
                || q_norm.contains("my vitamins"));
        if generic_med || generic_supp {
            let reason = if generic_med {
                "generic_med_group"
            } else {
                "generic_supp_group"
            };
            for item in items {
                if !q_timing.is_empty() && !item_matches_timing(&item.timing, &q_timing) {
                    continue;
                }
                push(&mut matches, item, 0.6, reason);
            }
        }
    }

    // Best score per canonical name, ordered high to low.
    let mut best: HashMap<String, Value> = HashMap::new();
    for m in matches {
        let name = m["name"].as_str().unwrap_or("").to_string();
        if name.is_empty() {
            continue;
        }
        let score = m["score"].as_f64().unwrap_or(0.0);
        match best.get(&name) {
            Some(existing) if existing["score"].as_f64().unwrap_or(0.0) >= score => {}
            _ => {
                best.insert(name, m);
            }
        }
    }
    let mut ordered: Vec<Value> = best.into_values().collect();
    ordered.sort_by(|a, b| {
        b["score"]
            .as_f64()
            .unwrap_or(0.0)
            .partial_cmp(&a["score"].as_f64().unwrap_or(0.0))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    ordered
}

/// Meal-name normalization shared with the write tools.
pub(crate) fn normalize_meal_name(text: &str) -> String {
    normalize(text)
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub(crate) fn json_or_csv_list(raw: Option<&str>) -> Vec<String> {
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
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
    }
    txt.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub(crate) fn serialize_template(row: &MealTemplateRow) -> Value {
    json!({
        "id": row.id,
        "name": row.name,
        "normalized_name": row.normalized_name,
        "aliases": json_or_csv_list(row.aliases.as_deref()),
        "ingredients": json_or_csv_list(row.ingredients.as_deref()),
        "servings": row.servings,
        "macros_per_serving": {
            "calories": row.calories,
            "protein_g": row.protein_g,
            "carbs_g": row.carbs_g,
            "fat_g": row.fat_g,
            "fiber_g": row.fiber_g,
            "sodium_mg": row.sodium_mg,
        },
        "notes": row.notes,
        "is_archived": row.is_archived,
        "archived_at": row.archived_at.map(|d| d.to_rfc3339()),
        "created_at": row.created_at.to_rfc3339(),
        "updated_at": row.updated_at.to_rfc3339(),
    })
}

pub(crate) fn resolve_template_row(
    args: &Map<String, Value>,
    ctx: &ToolContext<'_>,
    include_archived: bool,
) -> Result<MealTemplateRow, ToolError> {
    let row = if let Some(template_id) = arg_i64(args, "template_id")? {
        meals::get_template(ctx.conn, ctx.user_id, template_id)?
    } else if let Some(name) = arg_str(args, "template_name") {
        meals::get_template_by_normalized_name(ctx.conn, ctx.user_id, &normalize_meal_name(name))?
    } else {
        return Err(ToolError::Validation(
            "Provide `template_id` or `template_name`".to_string(),
        ));
    };
    match row {
        Some(row) if include_archived || !row.is_archived => Ok(row),
        _ => Err(ToolError::NotFound("Meal template not found".to_string())),
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

fn tool_profile_read(_args: &Map<String, Value>, ctx: &ToolContext<'_>) -> ToolResult {
    let s = ctx.settings()?;
    Ok(json!({
        "profile": {
            "age": s.age,
            "sex": s.sex,
            "height_cm": s.height_cm,
            "current_weight_kg": s.current_weight_kg,
            "goal_weight_kg": s.goal_weight_kg,
            "height_unit": s.height_unit,
            "weight_unit": s.weight_unit,
            "hydration_unit": s.hydration_unit,
            "fitness_level": s.fitness_level,
            "timezone": s.timezone,
            "medical_conditions": json_or_csv_list(s.medical_conditions.as_deref()),
            "dietary_preferences": json_or_csv_list(s.dietary_preferences.as_deref()),
            "health_goals": json_or_csv_list(s.health_goals.as_deref()),
            "family_history": json_or_csv_list(s.family_history.as_deref()),
            "medications": parse_structured_list(s.medications.as_deref()),
            "supplements": parse_structured_list(s.supplements.as_deref()),
        }
    }))
}

fn tool_medication_resolve_reference(args: &Map<String, Value>, ctx: &ToolContext<'_>) -> ToolResult {
    let query = require_str(args, "query")?;
    let items = parse_structured_list(ctx.settings()?.medications.as_deref());
    let matches = resolve_structured_reference(query, &items, "medication");
    Ok(json!({ "query": query, "matches": matches }))
}

fn tool_supplement_resolve_reference(args: &Map<String, Value>, ctx: &ToolContext<'_>) -> ToolResult {
    let query = require_str(args, "query")?;
    let items = parse_structured_list(ctx.settings()?.supplements.as_deref());
    let matches = resolve_structured_reference(query, &items, "supplement");
    Ok(json!({ "query": query, "matches": matches }))
}

fn tool_meal_template_list(args: &Map<String, Value>, ctx: &ToolContext<'_>) -> ToolResult {
    let include_archived = super::arg_bool(args, "include_archived", false);
    let rows = meals::templates_for_user(ctx.conn, ctx.user_id, include_archived)?;
    let mut templates = Vec::with_capacity(rows.len());
    for row in rows {
        let mut payload = serialize_template(&row);
        let (usage_count, last_logged_at) = meals::template_usage(ctx.conn, ctx.user_id, row.id)?;
        payload["usage_count"] = json!(usage_count);
        payload["last_logged_at"] = json!(last_logged_at.map(|d| d.to_rfc3339()));
        templates.push(payload);
    }
    Ok(json!({ "templates": templates }))
}

fn tool_meal_template_get(args: &Map<String, Value>, ctx: &ToolContext<'_>) -> ToolResult {
    let row = resolve_template_row(args, ctx, true)?;
    let mut payload = serialize_template(&row);
    let (usage_count, last_logged_at) = meals::template_usage(ctx.conn, ctx.user_id, row.id)?;
    payload["usage_count"] = json!(usage_count);
    payload["last_logged_at"] = json!(last_logged_at.map(|d| d.to_rfc3339()));
    Ok(json!({ "template": payload }))
}

fn tool_meal_template_versions(args: &Map<String, Value>, ctx: &ToolContext<'_>) -> ToolResult {
    let row = resolve_template_row(args, ctx, true)?;
    let versions = meals::template_versions(ctx.conn, ctx.user_id, row.id)?;
    let items: Vec<Value> = versions
        .iter()
        .map(|v| {
            json!({
                "id": v.id,
                "version_number": v.version_number,
                "change_note": v.change_note,
                "snapshot": serde_json::from_str::<Value>(&v.snapshot_json)
                    .unwrap_or_else(|_| json!({})),
                "created_at": v.created_at.to_rfc3339(),
            })
        })
        .collect();
    Ok(json!({ "template_id": row.id, "name": row.name, "versions": items }))
}

fn tool_meal_template_resolve_name(args: &Map<String, Value>, ctx: &ToolContext<'_>) -> ToolResult {
    let query = require_str(args, "query")?;
    let rows = meals::templates_for_user(ctx.conn, ctx.user_id, false)?;
    if rows.is_empty() {
        return Ok(json!({ "query": query, "matches": [] }));
    }

    let norm_query = normalize_meal_name(query);
    let q_tokens = tokens(&norm_query);
    let mut matches: Vec<Value> = Vec::new();

    for row in &rows {
        let mut names = vec![row.name.clone()];
        names.extend(json_or_csv_list(row.aliases.as_deref()));
        let mut best_score = 0.0_f64;
        let mut best_reason = "token_overlap";
        for candidate in &names {
            let norm_name = normalize_meal_name(candidate);
            if norm_name.is_empty() {
                continue;
            }
            if norm_name == norm_query {
                best_score = 1.0;
                best_reason = "exact_name_match";
                break;
            }
            if norm_name.contains(&norm_query) || norm_query.contains(&norm_name) {
                if best_score < 0.92 {
                    best_score = 0.92;
                    best_reason = "contains_match";
                }
                continue;
            }
            let c_tokens = tokens(&norm_name);
            if c_tokens.is_empty() {
                continue;
            }
            let overlap = q_tokens.intersection(&c_tokens).count();
            if overlap > 0 {
                let score = overlap as f64 / c_tokens.len().max(1) as f64;
                if score > best_score {
                    best_score = score;
                    best_reason = "token_overlap";
                }
            }
        }

        if best_score >= 0.34 {
            matches.push(json!({
                "template": serialize_template(row),
                "score": (best_score * 1000.0).round() / 1000.0,
                "reason": best_reason,
            }));
        }
    }

    matches.sort_by(|a, b| {
        b["score"]
            .as_f64()
            .unwrap_or(0.0)
            .partial_cmp(&a["score"].as_f64().unwrap_or(0.0))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    Ok(json!({ "query": query, "matches": matches }))
}

fn tool_meal_response_insights(args: &Map<String, Value>, ctx: &ToolContext<'_>) -> ToolResult {
    let since_days = arg_i64(args, "since_days")?
        .filter(|d| (7..=365).contains(d))
        .unwrap_or(90);
    let only_template_id = arg_i64(args, "template_id")?;
    let since = Utc::now() - Duration::days(since_days);

    let templates = meals::templates_for_user(ctx.conn, ctx.user_id, true)?;
    let template_by_id: HashMap<i64, &MealTemplateRow> =
        templates.iter().map(|t| (t.id, t)).collect();
    if let Some(tid) = only_template_id {
        if !template_by_id.contains_key(&tid) {
            return Err(ToolError::NotFound("Meal template not found".to_string()));
        }
    }

    // Daily weight averages for next-day delta computation.
    let vitals = logs::vitals_logs_between(ctx.conn, ctx.user_id, since, Utc::now())?;
    let mut weight_bucket: HashMap<String, Vec<f64>> = HashMap::new();
    for row in &vitals {
        if let Some(w) = row.weight_kg {
            weight_bucket
                .entry(row.logged_at.date_naive().to_string())
                .or_default()
                .push(w);
        }
    }
    let weight_map: HashMap<String, f64> = weight_bucket
        .into_iter()
        .map(|(k, vals)| {
            let avg = vals.iter().sum::<f64>() / vals.len() as f64;
            (k, avg)
        })
        .collect();

    #[derive(Default)]
    struct Agg {
        usage_count: i64,
        signal_count: i64,
        energy_values: Vec<i64>,
        gi_events: i64,
        gi_severity_values: Vec<i64>,
        gi_tag_counts: HashMap<String, i64>,
        weight_deltas: Vec<f64>,
    }
    let mut by_template: HashMap<i64, Agg> = HashMap::new();

    let usage_rows = logs::food_logs_between(ctx.conn, ctx.user_id, since, Utc::now())?;
    for row in usage_rows {
        let Some(tid) = row.meal_template_id else { continue };
        if only_template_id.is_some_and(|only| only != tid) {
            continue;
        }
        let agg = by_template.entry(tid).or_default();
        agg.usage_count += 1;
        let day = row.logged_at.date_naive();
        let next = (day + Duration::days(1)).to_string();
        if let (Some(today_w), Some(next_w)) =
            (weight_map.get(&day.to_string()), weight_map.get(&next))
        {
            agg.weight_deltas.push(next_w - today_w);
        }
    }

    for row in meals::meal_signals_since(ctx.conn, ctx.user_id, since)? {
        let Some(tid) = row.meal_template_id else { continue };
        if only_template_id.is_some_and(|only| only != tid) {
            continue;
        }
        let agg = by_template.entry(tid).or_default();
        agg.signal_count += 1;
        if let Some(e) = row.energy_level {
            agg.energy_values.push(e);
        }
        let tags = json_or_csv_list(row.gi_symptom_tags.as_deref());
        if !tags.is_empty() || row.gi_severity.is_some() {
            agg.gi_events += 1;
        }
        for tag in tags {
            *agg.gi_tag_counts.entry(tag.to_lowercase()).or_default() += 1;
        }
        if let Some(s) = row.gi_severity {
            agg.gi_severity_values.push(s);
        }
    }

    let mut items: Vec<Value> = Vec::new();
    for (tid, agg) in &by_template {
        let Some(template) = template_by_id.get(tid) else { continue };
        let avg = |vals: &[i64]| -> Option<f64> {
            if vals.is_empty() {
                None
            } else {
                Some(vals.iter().sum::<i64>() as f64 / vals.len() as f64)
            }
        };
        let avg_energy = avg(&agg.energy_values);
        let gi_event_rate = (agg.signal_count > 0)
            .then(|| agg.gi_events as f64 / agg.signal_count as f64);
        let avg_gi_severity = avg(&agg.gi_severity_values);
        let avg_weight_delta = if agg.weight_deltas.is_empty() {
            None
        } else {
            Some(agg.weight_deltas.iter().sum::<f64>() / agg.weight_deltas.len() as f64)
        };
        let mut top_tags: Vec<(&String, &i64)> = agg.gi_tag_counts.iter().collect();
        top_tags.sort_by(|a, b| b.1.cmp(a.1));

        items.push(json!({
            "template_id": tid,
            "template_name": template.name,
            "is_archived": template.is_archived,
            "usage_count": agg.usage_count,
            "signal_count": agg.signal_count,
            "energy_avg": avg_energy.map(|v| (v * 1000.0).round() / 1000.0),
            "gi_event_rate": gi_event_rate.map(|v| (v * 1000.0).round() / 1000.0),
            "gi_severity_avg": avg_gi_severity.map(|v| (v * 1000.0).round() / 1000.0),
            "weight_delta_next_day_kg_avg": avg_weight_delta.map(|v| (v * 10000.0).round() / 10000.0),
            "weight_delta_sample_size": agg.weight_deltas.len(),
            "top_gi_tags": top_tags.iter().take(5)
                .map(|(tag, count)| json!({"tag": tag, "count": count}))
                .collect::<Vec<_>>(),
        }));
    }
    items.sort_by(|a, b| {
        let key = |v: &Value| {
            (
                v["usage_count"].as_i64().unwrap_or(0),
                v["signal_count"].as_i64().unwrap_or(0),
            )
        };
        key(b).cmp(&key(a))
    });

    Ok(json!({ "since_days": since_days, "items": items }))
}

fn tool_health_search(args: &Map<String, Value>, ctx: &ToolContext<'_>) -> ToolResult {
    let query = require_str(args, "query")?;
    let q = normalize(query);
    let since_days = arg_i64(args, "since_days")?
        .filter(|d| (1..=365).contains(d))
        .unwrap_or(30);
    let since = Utc::now() - Duration::days(since_days);

    let rows = messages::user_messages_between(ctx.conn, ctx.user_id, since, Utc::now(), 150)?;
    let hits: Vec<Value> = rows
        .iter()
        .filter(|m| normalize(&m.content).contains(&q))
        .take(50)
        .map(|m| {
            let content: String = m.content.chars().take(500).collect();
            json!({
                "message_id": m.id,
                "role": m.role,
                "created_at": m.created_at.to_rfc3339(),
                "content": content,
            })
        })
        .collect();

    Ok(json!({ "query": query, "since_days": since_days, "hits": hits }))
}

pub fn register_health_tools(registry: &mut ToolRegistry) {
    registry.register(
        ToolSpec {
            name: "profile_read",
            description: "Read normalized user profile, goals, meds, supplements, and preferences.",
            required_fields: &[],
            read_only: true,
            allowed_specialists: None,
            tags: &["profile", "read"],
        },
        tool_profile_read,
    );
    registry.register(
        ToolSpec {
            name: "medication_resolve_reference",
            description: "Resolve phrases like `morning meds` or `blood pressure meds` to profile medications.",
            required_fields: &["query"],
            read_only: true,
            allowed_specialists: None,
            tags: &["medication", "resolve"],
        },
        tool_medication_resolve_reference,
    );
    registry.register(
        ToolSpec {
            name: "supplement_resolve_reference",
            description: "Resolve supplement phrases like `my vitamins` to profile supplements.",
            required_fields: &["query"],
            read_only: true,
            allowed_specialists: None,
            tags: &["supplement", "resolve"],
        },
        tool_supplement_resolve_reference,
    );
    registry.register(
        ToolSpec {
            name: "meal_template_list",
            description: "List user-defined named meals (meal templates).",
            required_fields: &[],
            read_only: true,
            allowed_specialists: None,
            tags: &["meal_template", "read"],
        },
        tool_meal_template_list,
    );
    registry.register(
        ToolSpec {
            name: "meal_template_get",
            description: "Get one meal template by template id or name, with usage stats.",
            required_fields: &[],
            read_only: true,
            allowed_specialists: None,
            tags: &["meal_template", "read"],
        },
        tool_meal_template_get,
    );
    registry.register(
        ToolSpec {
            name: "meal_template_versions",
            description: "List saved version snapshots for a meal template.",
            required_fields: &[],
            read_only: true,
            allowed_specialists: None,
            tags: &["meal_template", "read"],
        },
        tool_meal_template_versions,
    );
    registry.register(
        ToolSpec {
            name: "meal_template_resolve_name",
            description: "Resolve a named meal phrase like `power pancakes` to known meal templates.",
            required_fields: &["query"],
            read_only: true,
            allowed_specialists: None,
            tags: &["meal_template", "resolve"],
        },
        tool_meal_template_resolve_name,
    );
    registry.register(
        ToolSpec {
            name: "meal_response_insights",
            description: "Analyze meal response trends (weight, GI symptoms, energy) per meal template.",
            required_fields: &[],
            read_only: true,
            allowed_specialists: None,
            tags: &["meal_response", "read"],
        },
        tool_meal_response_insights,
    );
    registry.register(
        ToolSpec {
            name: "health_search",
            description: "Search recent health conversation history for a text query.",
            required_fields: &["query"],
            read_only: true,
            allowed_specialists: None,
            tags: &["search"],
        },
        tool_health_search,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use vital_core::items::StructuredItem;

    fn meds() -> Vec<StructuredItem> {
        vec![
            StructuredItem::new("Candesartan", "4mg", "morning"),
            StructuredItem::new("Metformin", "500mg", "with dinner"),
        ]
    }

    #[test]
    fn bp_phrase_resolves_to_bp_medication() {
        let matches = resolve_structured_reference("took my blood pressure meds", &meds(), "medication");
        assert_eq!(matches[0]["name"], "Candesartan");
        assert_eq!(matches[0]["reason"], "bp_keyword");
    }

    #[test]
    fn timing_phrase_resolves_group() {
        let matches = resolve_structured_reference("took my morning meds", &meds(), "medication");
        assert!(matches
            .iter()
            .any(|m| m["name"] == "Candesartan" && m["reason"] == "timing_group_match"));
        assert!(!matches.iter().any(|m| m["name"] == "Metformin"));
    }

    #[test]
    fn direct_mention_outranks_everything() {
        let matches = resolve_structured_reference("took metformin with dinner", &meds(), "medication");
        assert_eq!(matches[0]["name"], "Metformin");
        assert_eq!(matches[0]["reason"], "direct_name_match");
        assert_eq!(matches[0]["score"], 1.0);
    }

    #[test]
    fn generic_phrase_expands_to_full_list() {
        let matches = resolve_structured_reference("took my meds", &meds(), "medication");
        assert_eq!(matches.len(), 2);
        assert!(matches.iter().all(|m| m["reason"] == "generic_med_group"));
    }

    #[test]
    fn meal_name_normalization_strips_punctuation() {
        assert_eq!(normalize_meal_name("Power-Pancakes!  v2"), "power pancakes v2");
    }
}
