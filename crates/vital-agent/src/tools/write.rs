//! Write-side tools. Every handler validates before mutating and scopes all
//! SQL by the context's user id; the caller owns the transaction.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::{json, Map, Value};
use vital_core::items::{
    cleanup_structured_list, merge_structured_items, parse_structured_list, to_structured,
    StructuredItem,
};
use vital_core::timeinfer::resolve_tz;
use vital_store::{checklist, frameworks, logs, meals, notifications, users};

use super::health::{
    json_or_csv_list, normalize_meal_name, resolve_structured_reference, resolve_template_row,
};
use super::{
    arg_bool, arg_f64, arg_i64, arg_str, arg_string_list, require_str, resolve_time_arg,
    ToolContext, ToolError, ToolRegistry, ToolResult, ToolSpec,
};

const VALID_NOTIFICATION_CATEGORIES: &[&str] = &["info", "reminder", "warning", "system"];
const VALID_CHECKLIST_TYPES: &[&str] = &["medication", "supplement"];
const VALID_SEX: &[&str] = &["male", "female", "other"];
const VALID_FITNESS: &[&str] = &[
    "sedentary",
    "lightly_active",
    "moderately_active",
    "very_active",
    "extremely_active",
];

static DATE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").unwrap());

fn event_time(args: &Map<String, Value>, ctx: &ToolContext<'_>) -> DateTime<Utc> {
    resolve_time_arg(args, "logged_at", ctx)
        .or_else(|| resolve_time_arg(args, "event_time", ctx))
        .unwrap_or(ctx.reference_utc)
}

fn notes_arg(args: &Map<String, Value>) -> Option<String> {
    arg_str(args, "notes").map(str::to_string)
}

fn structured_item_arg(args: &Map<String, Value>, field: &str) -> Result<StructuredItem, ToolError> {
    let value = args
        .get(field)
        .ok_or_else(|| ToolError::Validation(format!("`{field}` is required")))?;
    let item = to_structured(value);
    if item.name.is_empty() {
        return Err(ToolError::Validation("Structured item requires `name`".to_string()));
    }
    Ok(item)
}

fn structured_items_arg(
    args: &Map<String, Value>,
    field: &str,
) -> Result<Vec<StructuredItem>, ToolError> {
    let raw = match args.get(field) {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(v) => v,
    };
    let entries: Vec<Value> = match raw {
        Value::Array(arr) => arr.clone(),
        Value::String(text) => {
            let text = text.trim();
            if text.is_empty() {
                return Ok(Vec::new());
            }
            if text.starts_with('[') {
                match serde_json::from_str::<Value>(text) {
                    Ok(Value::Array(arr)) => arr,
                    _ => text.split(',').map(|p| json!(p.trim())).collect(),
                }
            } else {
                text.split(',').map(|p| json!(p.trim())).collect()
            }
        }
        _ => {
            return Err(ToolError::Validation(format!(
                "`{field}` must be a JSON array, list, or comma-separated string"
            )))
        }
    };
    let mut out = Vec::with_capacity(entries.len());
    for entry in &entries {
        let item = to_structured(entry);
        if item.name.is_empty() {
            return Err(ToolError::Validation("Structured item requires `name`".to_string()));
        }
        out.push(item);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Profile / structured lists
// ---------------------------------------------------------------------------

fn tool_profile_patch(args: &Map<String, Value>, ctx: &ToolContext<'_>) -> ToolResult {
    let Some(Value::Object(patch)) = args.get("patch") else {
        return Err(ToolError::Validation("`patch` must be a non-empty object".to_string()));
    };
    if patch.is_empty() {
        return Err(ToolError::Validation("`patch` must be a non-empty object".to_string()));
    }

    const ALLOWED: &[&str] = &[
        "age",
        "sex",
        "height_cm",
        "current_weight_kg",
        "goal_weight_kg",
        "height_unit",
        "weight_unit",
        "hydration_unit",
        "fitness_level",
        "timezone",
        "medical_conditions",
        "dietary_preferences",
        "health_goals",
        "family_history",
    ];
    let unknown: Vec<&str> = patch
        .keys()
        .map(String::as_str)
        .filter(|k| !ALLOWED.contains(k))
        .collect();
    if !unknown.is_empty() {
        return Err(ToolError::Validation(format!(
            "Unsupported fields in patch: {}",
            unknown.join(", ")
        )));
    }

    let mut changed: Vec<&str> = Vec::new();
    for (key, value) in patch {
        match key.as_str() {
            "age" => {
                let age = match value {
                    Value::Null => None,
                    v => {
                        let age = vital_core::jsonx::as_i64(Some(v))
                            .ok_or_else(|| ToolError::Validation("`age` must be an integer".to_string()))?;
                        if !(1..=120).contains(&age) {
                            return Err(ToolError::Validation(
                                "`age` must be between 1 and 120".to_string(),
                            ));
                        }
                        Some(age as f64)
                    }
                };
                users::set_settings_number(ctx.conn, ctx.user_id, "age", age)?;
                changed.push("age");
            }
            "sex" => {
                let sex = match value.as_str().map(str::trim) {
                    None | Some("") => None,
                    Some(raw) => {
                        let v = raw.to_lowercase();
                        if !VALID_SEX.contains(&v.as_str()) {
                            return Err(ToolError::Validation(
                                "`sex` must be one of male, female, other".to_string(),
                            ));
                        }
                        Some(v)
                    }
                };
                users::set_settings_field(ctx.conn, ctx.user_id, "sex", sex.as_deref())?;
                changed.push("sex");
            }
            "height_cm" | "current_weight_kg" | "goal_weight_kg" => {
                let numeric = match value {
                    Value::Null => None,
                    v => Some(vital_core::jsonx::as_f64(Some(v)).ok_or_else(|| {
                        ToolError::Validation(format!("`{key}` must be a number"))
                    })?),
                };
                users::set_settings_number(ctx.conn, ctx.user_id, key, numeric)?;
                changed.push(ALLOWED.iter().copied().find(|k| *k == key).unwrap());
            }
            "height_unit" | "weight_unit" | "hydration_unit" => {
                let Some(raw) = value.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
                    continue;
                };
                let v = raw.to_lowercase();
                let valid = match key.as_str() {
                    "height_unit" => ["cm", "ft"].contains(&v.as_str()),
                    "weight_unit" => ["kg", "lb"].contains(&v.as_str()),
                    _ => ["ml", "oz"].contains(&v.as_str()),
                };
                if !valid {
                    return Err(ToolError::Validation(format!("Invalid `{key}`: {raw}")));
                }
                users::set_settings_field(ctx.conn, ctx.user_id, key, Some(&v))?;
                changed.push(ALLOWED.iter().copied().find(|k| *k == key).unwrap());
            }
            "fitness_level" => {
                let level = match value.as_str().map(str::trim) {
                    None | Some("") => None,
                    Some(raw) => {
                        let v = raw.to_lowercase();
                        if !VALID_FITNESS.contains(&v.as_str()) {
                            return Err(ToolError::Validation("Invalid `fitness_level`".to_string()));
                        }
                        Some(v)
                    }
                };
                users::set_settings_field(ctx.conn, ctx.user_id, "fitness_level", level.as_deref())?;
                changed.push("fitness_level");
            }
            "timezone" => {
                let tz = match value.as_str().map(str::trim) {
                    None | Some("") => None,
                    Some(raw) => {
                        if raw.parse::<chrono_tz::Tz>().is_err() {
                            return Err(ToolError::Validation("Invalid timezone name".to_string()));
                        }
                        Some(raw.to_string())
                    }
                };
                users::set_settings_field(ctx.conn, ctx.user_id, "timezone", tz.as_deref())?;
                changed.push("timezone");
            }
            "medical_conditions" | "dietary_preferences" | "health_goals" | "family_history" => {
                let stored = match value {
                    Value::Null => None,
                    _ => {
                        let mut wrapper = Map::new();
                        wrapper.insert(key.clone(), value.clone());
                        let values = arg_string_list(&wrapper, key)?;
                        (!values.is_empty()).then(|| serde_json::to_string(&values)).transpose()?
                    }
                };
                users::set_settings_field(ctx.conn, ctx.user_id, key, stored.as_deref())?;
                changed.push(ALLOWED.iter().copied().find(|k| *k == key).unwrap());
            }
            _ => unreachable!("validated above"),
        }
    }

    Ok(json!({ "changed_fields": changed }))
}

fn tool_medication_upsert(args: &Map<String, Value>, ctx: &ToolContext<'_>) -> ToolResult {
    let item = structured_item_arg(args, "item")?;
    let settings = ctx.settings()?;
    let merged = merge_structured_items(settings.medications.as_deref(), &[item]);
    let cleaned = cleanup_structured_list(merged.as_deref());
    users::set_settings_field(ctx.conn, ctx.user_id, "medications", cleaned.as_deref())?;
    Ok(json!({ "medications": parse_structured_list(cleaned.as_deref()) }))
}

fn tool_supplement_upsert(args: &Map<String, Value>, ctx: &ToolContext<'_>) -> ToolResult {
    let item = structured_item_arg(args, "item")?;
    let settings = ctx.settings()?;
    let merged = merge_structured_items(settings.supplements.as_deref(), &[item]);
    let cleaned = cleanup_structured_list(merged.as_deref());
    users::set_settings_field(ctx.conn, ctx.user_id, "supplements", cleaned.as_deref())?;
    Ok(json!({ "supplements": parse_structured_list(cleaned.as_deref()) }))
}

fn tool_medication_set(args: &Map<String, Value>, ctx: &ToolContext<'_>) -> ToolResult {
    let items = structured_items_arg(args, "items")?;
    let stored = if items.is_empty() {
        None
    } else {
        cleanup_structured_list(serde_json::to_string(&items).ok().as_deref())
    };
    users::set_settings_field(ctx.conn, ctx.user_id, "medications", stored.as_deref())?;
    Ok(json!({ "medications": parse_structured_list(stored.as_deref()) }))
}

fn tool_supplement_set(args: &Map<String, Value>, ctx: &ToolContext<'_>) -> ToolResult {
    let items = structured_items_arg(args, "items")?;
    let stored = if items.is_empty() {
        None
    } else {
        cleanup_structured_list(serde_json::to_string(&items).ok().as_deref())
    };
    users::set_settings_field(ctx.conn, ctx.user_id, "supplements", stored.as_deref())?;
    Ok(json!({ "supplements": parse_structured_list(stored.as_deref()) }))
}

fn tool_goal_upsert(args: &Map<String, Value>, ctx: &ToolContext<'_>) -> ToolResult {
    let mut values = arg_string_list(args, "goals")?;
    if values.is_empty() {
        if let Some(goal) = arg_str(args, "goal") {
            values.push(goal.to_string());
        }
    }
    let settings = ctx.settings()?;
    let mut merged = json_or_csv_list(settings.health_goals.as_deref());
    for value in values {
        if !merged.iter().any(|m| m.eq_ignore_ascii_case(&value)) {
            merged.push(value);
        }
    }
    let stored = (!merged.is_empty())
        .then(|| serde_json::to_string(&merged))
        .transpose()?;
    users::set_settings_field(ctx.conn, ctx.user_id, "health_goals", stored.as_deref())?;
    Ok(json!({ "health_goals": merged }))
}

// ---------------------------------------------------------------------------
// Checklist
// ---------------------------------------------------------------------------

fn tool_checklist_mark_taken(args: &Map<String, Value>, ctx: &ToolContext<'_>) -> ToolResult {
    let item_type = require_str(args, "item_type")?.to_lowercase();
    if !VALID_CHECKLIST_TYPES.contains(&item_type.as_str()) {
        return Err(ToolError::Validation(
            "`item_type` must be medication or supplement".to_string(),
        ));
    }

    let mut targets = arg_string_list(args, "names")?;
    if let Some(reference_query) = arg_str(args, "reference_query") {
        let settings = ctx.settings()?;
        let source = if item_type == "medication" {
            parse_structured_list(settings.medications.as_deref())
        } else {
            parse_structured_list(settings.supplements.as_deref())
        };
        for m in resolve_structured_reference(reference_query, &source, &item_type) {
            if let Some(name) = m["name"].as_str().map(str::trim).filter(|n| !n.is_empty()) {
                if !targets.iter().any(|t| t.eq_ignore_ascii_case(name)) {
                    targets.push(name.to_string());
                }
            }
        }
    }
    if targets.is_empty() {
        return Err(ToolError::Validation("No checklist targets resolved".to_string()));
    }

    let target_date = match arg_str(args, "target_date") {
        Some(raw) => {
            if !DATE_RE.is_match(raw) {
                return Err(ToolError::Validation("`target_date` must be YYYY-MM-DD".to_string()));
            }
            raw.to_string()
        }
        None => {
            let tz = resolve_tz(ctx.timezone().as_deref());
            ctx.reference_utc
                .with_timezone(&tz)
                .date_naive()
                .format("%Y-%m-%d")
                .to_string()
        }
    };

    let completed = arg_bool(args, "completed", true);
    for name in &targets {
        checklist::mark_item(ctx.conn, ctx.user_id, &target_date, &item_type, name, completed)?;
    }

    Ok(json!({
        "item_type": item_type,
        "target_date": target_date,
        "updated_items": targets,
        "completed": completed,
    }))
}

// ---------------------------------------------------------------------------
// Log writes
// ---------------------------------------------------------------------------

fn tool_food_log_write(args: &Map<String, Value>, ctx: &ToolContext<'_>) -> ToolResult {
    let meal_label = arg_str(args, "meal_label").map(str::to_string);
    let items: Vec<Value> = match args.get("items") {
        Some(Value::Array(arr)) => arr.clone(),
        Some(Value::String(text)) => match serde_json::from_str::<Value>(text) {
            Ok(Value::Array(arr)) => arr,
            _ => vec![json!({ "name": text })],
        },
        _ => return Err(ToolError::Validation("`items` must be a list or JSON string".to_string())),
    };

    // Template auto-resolution: template_name → meal_label → first item name,
    // matched against normalized names and aliases.
    let mut query_name = arg_str(args, "template_name")
        .map(str::to_string)
        .or_else(|| meal_label.clone())
        .unwrap_or_default();
    if query_name.is_empty() {
        if let Some(first) = items.first() {
            query_name = match first {
                Value::Object(o) => o
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .trim()
                    .to_string(),
                other => other.as_str().unwrap_or("").trim().to_string(),
            };
        }
    }

    let mut resolved_template = None;
    if !query_name.is_empty() {
        let norm_query = normalize_meal_name(&query_name);
        for row in meals::templates_for_user(ctx.conn, ctx.user_id, false)? {
            if row.normalized_name == norm_query {
                resolved_template = Some(row);
                break;
            }
            let aliases = json_or_csv_list(row.aliases.as_deref());
            if aliases.iter().any(|a| normalize_meal_name(a) == norm_query) {
                resolved_template = Some(row);
                break;
            }
        }
    }

    let logged_at = event_time(args, ctx);
    let notes = notes_arg(args);

    if let Some(template) = resolved_template {
        if arg_bool(args, "use_template_if_found", true) {
            let servings = arg_f64(args, "servings")?.unwrap_or(1.0);
            if servings <= 0.0 {
                return Err(ToolError::Validation("`servings` must be > 0".to_string()));
            }
            let base_servings = if template.servings > 0.0 {
                template.servings
            } else {
                1.0
            };
            let mult = servings / base_servings;
            let ingredients = json_or_csv_list(template.ingredients.as_deref());
            let template_items: Vec<Value> = if ingredients.is_empty() {
                vec![json!({ "name": template.name })]
            } else {
                ingredients.iter().map(|x| json!({ "name": x })).collect()
            };
            let scaled = |v: Option<f64>| v.map(|x| x * mult);
            let id = logs::insert_food_log(
                ctx.conn,
                &logs::NewFoodLog {
                    user_id: ctx.user_id,
                    meal_template_id: Some(template.id),
                    logged_at,
                    meal_label: Some(meal_label.as_deref().unwrap_or(&template.name)),
                    items_json: &serde_json::to_string(&template_items)?,
                    calories: scaled(template.calories),
                    protein_g: scaled(template.protein_g),
                    carbs_g: scaled(template.carbs_g),
                    fat_g: scaled(template.fat_g),
                    fiber_g: scaled(template.fiber_g),
                    sodium_mg: scaled(template.sodium_mg),
                    notes: notes.as_deref(),
                },
            )?;
            return Ok(json!({
                "food_log_id": id,
                "used_template": true,
                "meal_template_id": template.id,
            }));
        }
    }

    let id = logs::insert_food_log(
        ctx.conn,
        &logs::NewFoodLog {
            user_id: ctx.user_id,
            meal_template_id: None,
            logged_at,
            meal_label: meal_label.as_deref(),
            items_json: &serde_json::to_string(&items)?,
            calories: arg_f64(args, "calories")?,
            protein_g: arg_f64(args, "protein_g")?,
            carbs_g: arg_f64(args, "carbs_g")?,
            fat_g: arg_f64(args, "fat_g")?,
            fiber_g: arg_f64(args, "fiber_g")?,
            sodium_mg: arg_f64(args, "sodium_mg")?,
            notes: notes.as_deref(),
        },
    )?;
    Ok(json!({ "food_log_id": id, "used_template": false }))
}

fn tool_vitals_log_write(args: &Map<String, Value>, ctx: &ToolContext<'_>) -> ToolResult {
    let weight_kg = arg_f64(args, "weight_kg")?;
    let bp_systolic = arg_i64(args, "bp_systolic")?;
    let bp_diastolic = arg_i64(args, "bp_diastolic")?;
    let heart_rate = arg_i64(args, "heart_rate")?;
    let blood_glucose = arg_f64(args, "blood_glucose")?;
    let temperature_c = arg_f64(args, "temperature_c")?;
    let spo2 = arg_f64(args, "spo2")?;

    if weight_kg.is_none()
        && bp_systolic.is_none()
        && bp_diastolic.is_none()
        && heart_rate.is_none()
        && blood_glucose.is_none()
        && temperature_c.is_none()
        && spo2.is_none()
    {
        return Err(ToolError::Validation(
            "At least one vitals metric is required".to_string(),
        ));
    }

    let id = logs::insert_vitals_log(
        ctx.conn,
        &logs::NewVitalsLog {
            user_id: ctx.user_id,
            logged_at: event_time(args, ctx),
            weight_kg,
            bp_systolic,
            bp_diastolic,
            heart_rate,
            blood_glucose,
            temperature_c,
            spo2,
            notes: notes_arg(args).as_deref(),
        },
    )?;

    // Weight readings keep the profile's current weight in sync.
    if let Some(weight) = weight_kg {
        users::set_settings_number(ctx.conn, ctx.user_id, "current_weight_kg", Some(weight))?;
    }

    Ok(json!({ "vitals_log_id": id }))
}

fn tool_exercise_log_write(args: &Map<String, Value>, ctx: &ToolContext<'_>) -> ToolResult {
    let exercise_type = require_str(args, "exercise_type")?;
    let details = match args.get("details") {
        Some(Value::Object(_)) | Some(Value::Array(_)) => {
            Some(serde_json::to_string(args.get("details").unwrap())?)
        }
        Some(Value::String(s)) => Some(s.clone()),
        _ => None,
    };
    let id = logs::insert_exercise_log(
        ctx.conn,
        ctx.user_id,
        event_time(args, ctx),
        exercise_type,
        arg_i64(args, "duration_minutes")?,
        details.as_deref(),
        arg_i64(args, "max_hr")?,
        arg_i64(args, "avg_hr")?,
        arg_f64(args, "calories_burned")?,
        notes_arg(args).as_deref(),
    )?;
    Ok(json!({ "exercise_log_id": id }))
}

fn tool_hydration_log_write(args: &Map<String, Value>, ctx: &ToolContext<'_>) -> ToolResult {
    let amount_ml = arg_f64(args, "amount_ml")?
        .filter(|v| *v > 0.0)
        .ok_or_else(|| ToolError::Validation("`amount_ml` must be > 0".to_string()))?;
    let source = arg_str(args, "source").unwrap_or("water");
    let id = logs::insert_hydration_log(
        ctx.conn,
        ctx.user_id,
        event_time(args, ctx),
        amount_ml,
        Some(source),
        notes_arg(args).as_deref(),
    )?;
    Ok(json!({ "hydration_log_id": id }))
}

fn tool_supplement_log_write(args: &Map<String, Value>, ctx: &ToolContext<'_>) -> ToolResult {
    let supplements: Vec<Value> = match args.get("supplements") {
        Some(Value::Array(arr)) => arr.clone(),
        Some(Value::String(text)) => match serde_json::from_str::<Value>(text) {
            Ok(Value::Array(arr)) => arr,
            _ => vec![json!(text)],
        },
        _ => {
            return Err(ToolError::Validation(
                "`supplements` must be a list or JSON string".to_string(),
            ))
        }
    };
    let id = logs::insert_supplement_log(
        ctx.conn,
        ctx.user_id,
        event_time(args, ctx),
        &serde_json::to_string(&supplements)?,
        arg_str(args, "timing"),
        notes_arg(args).as_deref(),
    )?;
    Ok(json!({ "supplement_log_id": id }))
}

fn tool_sleep_log_write(args: &Map<String, Value>, ctx: &ToolContext<'_>) -> ToolResult {
    let sleep_start = resolve_time_arg(args, "sleep_start", ctx);
    let sleep_end = resolve_time_arg(args, "sleep_end", ctx);
    let mut duration = arg_i64(args, "duration_minutes")?;
    if duration.is_none() {
        if let (Some(start), Some(end)) = (sleep_start, sleep_end) {
            let mut minutes = (end - start).num_minutes();
            // A bare-clock bedtime after the wake clock means the night
            // crossed midnight.
            if minutes < 0 {
                minutes += 24 * 60;
            }
            duration = Some(minutes.max(0));
        }
    }
    let id = logs::insert_sleep_log(
        ctx.conn,
        ctx.user_id,
        sleep_start,
        sleep_end,
        duration,
        arg_str(args, "quality"),
        notes_arg(args).as_deref(),
    )?;
    Ok(json!({ "sleep_log_id": id }))
}

fn tool_fasting_manage(args: &Map<String, Value>, ctx: &ToolContext<'_>) -> ToolResult {
    let action = require_str(args, "action")?.to_lowercase();
    match action.as_str() {
        "start" => {
            // A second start with a fast already open returns the existing
            // open row unchanged; a user can never hold two open fasts.
            if let Some(active) = logs::active_fast(ctx.conn, ctx.user_id)? {
                return Ok(json!({
                    "status": "already_active",
                    "fasting_log_id": active.id,
                    "fast_start": active.fast_start.to_rfc3339(),
                }));
            }
            let fast_start = resolve_time_arg(args, "fast_start", ctx).unwrap_or(ctx.reference_utc);
            let id = logs::insert_fasting_start(
                ctx.conn,
                ctx.user_id,
                fast_start,
                arg_str(args, "fast_type"),
                notes_arg(args).as_deref(),
            )?;
            Ok(json!({
                "status": "started",
                "fasting_log_id": id,
                "fast_start": fast_start.to_rfc3339(),
            }))
        }
        "end" => {
            let Some(active) = logs::active_fast(ctx.conn, ctx.user_id)? else {
                return Ok(json!({ "status": "no_active_fast" }));
            };
            let fast_end = resolve_time_arg(args, "fast_end", ctx).unwrap_or(ctx.reference_utc);
            let closed = logs::close_fast(ctx.conn, ctx.user_id, active.id, fast_end)?;
            Ok(json!({
                "status": "ended",
                "fasting_log_id": closed.id,
                "duration_minutes": closed.duration_minutes,
            }))
        }
        _ => Err(ToolError::Validation("`action` must be `start` or `end`".to_string())),
    }
}

fn tool_exercise_plan_upsert(args: &Map<String, Value>, ctx: &ToolContext<'_>) -> ToolResult {
    let target_date = require_str(args, "target_date")?;
    if !DATE_RE.is_match(target_date) {
        return Err(ToolError::Validation("`target_date` must be YYYY-MM-DD".to_string()));
    }
    let plan_type_raw = arg_str(args, "plan_type").unwrap_or("mixed").to_lowercase();
    let plan_type = if ["rest_day", "hiit", "strength", "zone2", "mobility", "mixed"]
        .contains(&plan_type_raw.as_str())
    {
        plan_type_raw
    } else {
        "mixed".to_string()
    };
    let title = arg_str(args, "title").unwrap_or("Today's Exercise Plan");
    let (id, created) = logs::upsert_exercise_plan(
        ctx.conn,
        ctx.user_id,
        target_date,
        &plan_type,
        title,
        arg_str(args, "description"),
        arg_i64(args, "target_minutes")?,
        arg_str(args, "source").unwrap_or("ai"),
    )?;
    Ok(json!({ "exercise_plan_id": id, "created": created }))
}

// ---------------------------------------------------------------------------
// Meal templates
// ---------------------------------------------------------------------------

fn template_snapshot(row: &vital_store::types::MealTemplateRow) -> Value {
    json!({
        "name": row.name,
        "normalized_name": row.normalized_name,
        "aliases": json_or_csv_list(row.aliases.as_deref()),
        "ingredients": json_or_csv_list(row.ingredients.as_deref()),
        "servings": row.servings,
        "calories": row.calories,
        "protein_g": row.protein_g,
        "carbs_g": row.carbs_g,
        "fat_g": row.fat_g,
        "fiber_g": row.fiber_g,
        "sodium_mg": row.sodium_mg,
        "notes": row.notes,
        "is_archived": row.is_archived,
    })
}

fn tool_meal_template_upsert(args: &Map<String, Value>, ctx: &ToolContext<'_>) -> ToolResult {
    let name = require_str(args, "name")?;
    let normalized_name = normalize_meal_name(name);
    if normalized_name.is_empty() {
        return Err(ToolError::Validation("Invalid `name`".to_string()));
    }

    let aliases = arg_string_list(args, "aliases")?;
    let ingredients = arg_string_list(args, "ingredients")?;
    let servings = arg_f64(args, "servings")?.unwrap_or(1.0);
    if servings <= 0.0 {
        return Err(ToolError::Validation("`servings` must be > 0".to_string()));
    }

    let before = meals::get_template_by_normalized_name(ctx.conn, ctx.user_id, &normalized_name)?
        .map(|row| template_snapshot(&row));

    let aliases_json = (!aliases.is_empty())
        .then(|| serde_json::to_string(&aliases))
        .transpose()?;
    let ingredients_json = (!ingredients.is_empty())
        .then(|| serde_json::to_string(&ingredients))
        .transpose()?;
    let (id, created) = meals::upsert_template(
        ctx.conn,
        ctx.user_id,
        &meals::TemplateUpsert {
            name,
            normalized_name: &normalized_name,
            aliases_json: aliases_json.as_deref(),
            ingredients_json: ingredients_json.as_deref(),
            servings,
            calories: arg_f64(args, "calories")?,
            protein_g: arg_f64(args, "protein_g")?,
            carbs_g: arg_f64(args, "carbs_g")?,
            fat_g: arg_f64(args, "fat_g")?,
            fiber_g: arg_f64(args, "fiber_g")?,
            sodium_mg: arg_f64(args, "sodium_mg")?,
            notes: arg_str(args, "notes"),
        },
    )?;

    // Version every accepted creation/change.
    let after = meals::get_template(ctx.conn, ctx.user_id, id)?
        .map(|row| template_snapshot(&row))
        .unwrap_or_else(|| json!({}));
    let change_note = arg_str(args, "change_note")
        .map(str::to_string)
        .unwrap_or_else(|| {
            if created {
                "Created template".to_string()
            } else {
                "Updated template".to_string()
            }
        });
    let version_number = if created || before.as_ref() != Some(&after) {
        Some(meals::insert_template_version(
            ctx.conn,
            ctx.user_id,
            id,
            &after.to_string(),
            Some(&change_note),
        )?)
    } else {
        None
    };

    Ok(json!({
        "meal_template_id": id,
        "created": created,
        "name": name,
        "version_number": version_number,
    }))
}

fn tool_meal_template_archive(args: &Map<String, Value>, ctx: &ToolContext<'_>) -> ToolResult {
    let row = resolve_template_row(args, ctx, true)?;
    let archive = arg_bool(args, "archive", true);
    if archive != row.is_archived {
        let note = if archive {
            "Archived template"
        } else {
            "Restored template"
        };
        meals::insert_template_version(
            ctx.conn,
            ctx.user_id,
            row.id,
            &template_snapshot(&row).to_string(),
            Some(note),
        )?;
        meals::set_template_archived(ctx.conn, ctx.user_id, row.id, archive)?;
    }
    Ok(json!({ "meal_template_id": row.id, "archived": archive }))
}

fn tool_meal_template_delete(args: &Map<String, Value>, ctx: &ToolContext<'_>) -> ToolResult {
    let row = resolve_template_row(args, ctx, true)?;
    meals::delete_template(ctx.conn, ctx.user_id, row.id)?;
    Ok(json!({ "deleted": true, "meal_template_id": row.id, "name": row.name }))
}

fn tool_meal_log_from_template(args: &Map<String, Value>, ctx: &ToolContext<'_>) -> ToolResult {
    let row = resolve_template_row(args, ctx, true)?;
    let servings = arg_f64(args, "servings")?.unwrap_or(1.0);
    if servings <= 0.0 {
        return Err(ToolError::Validation("`servings` must be > 0".to_string()));
    }
    let base_servings = if row.servings > 0.0 { row.servings } else { 1.0 };
    let mult = servings / base_servings;

    let ingredients = json_or_csv_list(row.ingredients.as_deref());
    let meal_items: Vec<Value> = if ingredients.is_empty() {
        vec![json!({ "name": row.name })]
    } else {
        ingredients.iter().map(|x| json!({ "name": x })).collect()
    };
    let scaled = |v: Option<f64>| v.map(|x| x * mult);
    let meal_label = arg_str(args, "meal_label").unwrap_or(&row.name);

    let id = logs::insert_food_log(
        ctx.conn,
        &logs::NewFoodLog {
            user_id: ctx.user_id,
            meal_template_id: Some(row.id),
            logged_at: event_time(args, ctx),
            meal_label: Some(meal_label),
            items_json: &serde_json::to_string(&meal_items)?,
            calories: scaled(row.calories),
            protein_g: scaled(row.protein_g),
            carbs_g: scaled(row.carbs_g),
            fat_g: scaled(row.fat_g),
            fiber_g: scaled(row.fiber_g),
            sodium_mg: scaled(row.sodium_mg),
            notes: notes_arg(args).as_deref(),
        },
    )?;
    Ok(json!({ "food_log_id": id, "meal_template_id": row.id, "servings": servings }))
}

fn tool_meal_response_signal_write(args: &Map<String, Value>, ctx: &ToolContext<'_>) -> ToolResult {
    let mut meal_template_id = arg_i64(args, "meal_template_id")?;
    let food_log_id = arg_i64(args, "food_log_id")?;
    let source_message_id = arg_i64(args, "source_message_id")?;

    if let Some(tid) = meal_template_id {
        if meals::get_template(ctx.conn, ctx.user_id, tid)?.is_none() {
            return Err(ToolError::NotFound(
                "Meal template not found for this user".to_string(),
            ));
        }
    }
    let food_log_row = match food_log_id {
        Some(fid) => {
            let row = logs::get_food_log(ctx.conn, ctx.user_id, fid)?.ok_or_else(|| {
                ToolError::NotFound("Food log not found for this user".to_string())
            })?;
            Some(row)
        }
        None => None,
    };
    if let Some(linked) = food_log_row.as_ref().and_then(|r| r.meal_template_id) {
        match meal_template_id {
            None => meal_template_id = Some(linked),
            Some(tid) if tid != linked => {
                return Err(ToolError::Validation(
                    "`meal_template_id` does not match the provided `food_log_id`".to_string(),
                ))
            }
            _ => {}
        }
    }

    let energy_level = arg_i64(args, "energy_level")?;
    if energy_level.is_some_and(|e| !(-2..=2).contains(&e)) {
        return Err(ToolError::Validation(
            "`energy_level` must be between -2 and 2".to_string(),
        ));
    }
    let gi_severity = arg_i64(args, "gi_severity")?;
    if gi_severity.is_some_and(|s| !(1..=5).contains(&s)) {
        return Err(ToolError::Validation(
            "`gi_severity` must be between 1 and 5".to_string(),
        ));
    }
    let tags = arg_string_list(args, "gi_symptom_tags")?;
    let tags_json = (!tags.is_empty())
        .then(|| serde_json::to_string(&tags))
        .transpose()?;

    let id = meals::insert_meal_signal(
        ctx.conn,
        &meals::NewMealSignal {
            user_id: ctx.user_id,
            meal_template_id,
            food_log_id,
            source_message_id,
            energy_level,
            gi_symptom_tags_json: tags_json.as_deref(),
            gi_severity,
            notes: notes_arg(args).as_deref(),
        },
    )?;
    Ok(json!({ "meal_response_signal_id": id }))
}

// ---------------------------------------------------------------------------
// Notifications / frameworks
// ---------------------------------------------------------------------------

fn tool_notification_create(args: &Map<String, Value>, ctx: &ToolContext<'_>) -> ToolResult {
    let title = require_str(args, "title")?;
    let message = require_str(args, "message")?;
    let category = arg_str(args, "category").unwrap_or("info").to_lowercase();
    if !VALID_NOTIFICATION_CATEGORIES.contains(&category.as_str()) {
        return Err(ToolError::Validation(format!(
            "`category` must be one of {}",
            VALID_NOTIFICATION_CATEGORIES.join(", ")
        )));
    }
    let payload_json = match args.get("payload") {
        None | Some(Value::Null) => None,
        Some(value) => Some(serde_json::to_string(value)?),
    };
    let id = notifications::insert_notification(
        ctx.conn,
        ctx.user_id,
        &category,
        title,
        message,
        payload_json.as_deref(),
    )?;
    Ok(json!({ "notification_id": id }))
}

fn tool_notification_list(args: &Map<String, Value>, ctx: &ToolContext<'_>) -> ToolResult {
    let unread_only = arg_bool(args, "unread_only", false);
    let limit = arg_i64(args, "limit")?.unwrap_or(30).clamp(1, 200) as usize;
    let rows = notifications::list_notifications(ctx.conn, ctx.user_id, unread_only, limit)?;
    let out: Vec<Value> = rows
        .iter()
        .map(|row| {
            let payload = row
                .payload
                .as_deref()
                .and_then(|p| serde_json::from_str::<Value>(p).ok())
                .unwrap_or(Value::Null);
            json!({
                "id": row.id,
                "category": row.category,
                "title": row.title,
                "message": row.message,
                "payload": payload,
                "is_read": row.is_read,
                "created_at": row.created_at.to_rfc3339(),
                "read_at": row.read_at.map(|d| d.to_rfc3339()),
            })
        })
        .collect();
    Ok(json!({ "notifications": out }))
}

fn tool_notification_mark_read(args: &Map<String, Value>, ctx: &ToolContext<'_>) -> ToolResult {
    let notification_id = arg_i64(args, "notification_id")?
        .ok_or_else(|| ToolError::Validation("`notification_id` must be an integer".to_string()))?;
    notifications::mark_read(ctx.conn, ctx.user_id, notification_id, ctx.reference_utc)
        .map_err(|_| ToolError::NotFound("Notification not found".to_string()))?;
    Ok(json!({ "notification_id": notification_id, "is_read": true }))
}

/// Profile-driven framework activation: known strategy names mentioned in the
/// user's dietary preferences or health goals become active framework rows.
fn tool_framework_sync_from_profile(_args: &Map<String, Value>, ctx: &ToolContext<'_>) -> ToolResult {
    const STRATEGY_HINTS: &[(&str, &str, &str)] = &[
        ("keto", "dietary", "Keto"),
        ("dash", "dietary", "DASH"),
        ("mediterranean", "dietary", "Mediterranean"),
        ("carnivore", "dietary", "Carnivore"),
        ("low-fodmap", "dietary", "Low-FODMAP"),
        ("low fodmap", "dietary", "Low-FODMAP"),
        ("hiit", "training", "HIIT"),
        ("zone 2", "training", "Zone 2"),
        ("strength", "training", "Strength Progression"),
        ("crossfit", "training", "CrossFit"),
        ("intermittent fasting", "metabolic_timing", "Intermittent Fasting"),
        ("time-restricted", "metabolic_timing", "Time-Restricted Eating"),
        ("time restricted", "metabolic_timing", "Time-Restricted Eating"),
        ("carb cycling", "metabolic_timing", "Carb Cycling"),
    ];

    frameworks::ensure_default_frameworks(ctx.conn, ctx.user_id)?;
    let settings = ctx.settings()?;
    let mut haystack = json_or_csv_list(settings.dietary_preferences.as_deref());
    haystack.extend(json_or_csv_list(settings.health_goals.as_deref()));
    let haystack = haystack.join(" | ").to_lowercase();

    let mut synced: Vec<String> = Vec::new();
    for (hint, framework_type, name) in STRATEGY_HINTS {
        if !haystack.contains(hint) {
            continue;
        }
        if synced.iter().any(|s| s == name) {
            continue;
        }
        frameworks::upsert_framework(
            ctx.conn,
            ctx.user_id,
            &frameworks::FrameworkUpsert {
                framework_type,
                name,
                priority_score: None,
                is_active: Some(true),
                source: "intake",
                rationale: Some("Mentioned in profile preferences/goals"),
                metadata_json: None,
            },
        )?;
        synced.push(name.to_string());
    }
    Ok(json!({ "synced": synced }))
}

pub fn register_write_tools(registry: &mut ToolRegistry) {
    registry.register(
        ToolSpec {
            name: "profile_patch",
            description: "Patch selected profile fields with validation and normalized storage.",
            required_fields: &["patch"],
            read_only: false,
            allowed_specialists: None,
            tags: &["profile", "write"],
        },
        tool_profile_patch,
    );
    registry.register(
        ToolSpec {
            name: "medication_upsert",
            description: "Upsert a medication entry into the user's structured medication list.",
            required_fields: &["item"],
            read_only: false,
            allowed_specialists: None,
            tags: &["medication", "write"],
        },
        tool_medication_upsert,
    );
    registry.register(
        ToolSpec {
            name: "medication_set",
            description: "Replace the full medication list using structured storage.",
            required_fields: &["items"],
            read_only: false,
            allowed_specialists: None,
            tags: &["medication", "write"],
        },
        tool_medication_set,
    );
    registry.register(
        ToolSpec {
            name: "supplement_upsert",
            description: "Upsert a supplement entry into the user's structured supplement list.",
            required_fields: &["item"],
            read_only: false,
            allowed_specialists: None,
            tags: &["supplement", "write"],
        },
        tool_supplement_upsert,
    );
    registry.register(
        ToolSpec {
            name: "supplement_set",
            description: "Replace the full supplement list using structured storage.",
            required_fields: &["items"],
            read_only: false,
            allowed_specialists: None,
            tags: &["supplement", "write"],
        },
        tool_supplement_set,
    );
    registry.register(
        ToolSpec {
            name: "goal_upsert",
            description: "Add one or more health goals into the user's profile goals.",
            required_fields: &[],
            read_only: false,
            allowed_specialists: None,
            tags: &["goals", "write"],
        },
        tool_goal_upsert,
    );
    registry.register(
        ToolSpec {
            name: "checklist_mark_taken",
            description: "Mark medication/supplement checklist entries completed for a date by names or reference query.",
            required_fields: &["item_type"],
            read_only: false,
            allowed_specialists: None,
            tags: &["checklist", "write"],
        },
        tool_checklist_mark_taken,
    );
    registry.register(
        ToolSpec {
            name: "food_log_write",
            description: "Write a food log entry (can auto-resolve to named meal template).",
            required_fields: &["items"],
            read_only: false,
            allowed_specialists: None,
            tags: &["food", "write"],
        },
        tool_food_log_write,
    );
    registry.register(
        ToolSpec {
            name: "vitals_log_write",
            description: "Write a vitals log entry (weight, BP, HR, glucose, temperature, SpO2).",
            required_fields: &[],
            read_only: false,
            allowed_specialists: None,
            tags: &["vitals", "write"],
        },
        tool_vitals_log_write,
    );
    registry.register(
        ToolSpec {
            name: "exercise_log_write",
            description: "Write an exercise log entry.",
            required_fields: &["exercise_type"],
            read_only: false,
            allowed_specialists: None,
            tags: &["exercise", "write"],
        },
        tool_exercise_log_write,
    );
    registry.register(
        ToolSpec {
            name: "hydration_log_write",
            description: "Write a hydration log entry.",
            required_fields: &["amount_ml"],
            read_only: false,
            allowed_specialists: None,
            tags: &["hydration", "write"],
        },
        tool_hydration_log_write,
    );
    registry.register(
        ToolSpec {
            name: "supplement_log_write",
            description: "Write a supplement intake log entry.",
            required_fields: &["supplements"],
            read_only: false,
            allowed_specialists: None,
            tags: &["supplement", "write"],
        },
        tool_supplement_log_write,
    );
    registry.register(
        ToolSpec {
            name: "sleep_log_write",
            description: "Write a sleep log entry.",
            required_fields: &[],
            read_only: false,
            allowed_specialists: None,
            tags: &["sleep", "write"],
        },
        tool_sleep_log_write,
    );
    registry.register(
        ToolSpec {
            name: "fasting_manage",
            description: "Start or end fasting log.",
            required_fields: &["action"],
            read_only: false,
            allowed_specialists: None,
            tags: &["fasting", "write"],
        },
        tool_fasting_manage,
    );
    registry.register(
        ToolSpec {
            name: "exercise_plan_upsert",
            description: "Create or update daily exercise plan.",
            required_fields: &["target_date", "plan_type", "title"],
            read_only: false,
            allowed_specialists: None,
            tags: &["exercise_plan", "write"],
        },
        tool_exercise_plan_upsert,
    );
    registry.register(
        ToolSpec {
            name: "meal_template_upsert",
            description: "Create or update a named meal template with ingredients and macros.",
            required_fields: &["name"],
            read_only: false,
            allowed_specialists: None,
            tags: &["meal_template", "write"],
        },
        tool_meal_template_upsert,
    );
    registry.register(
        ToolSpec {
            name: "meal_template_archive",
            description: "Archive or restore a meal template by id or name.",
            required_fields: &[],
            read_only: false,
            allowed_specialists: None,
            tags: &["meal_template", "write"],
        },
        tool_meal_template_archive,
    );
    registry.register(
        ToolSpec {
            name: "meal_template_delete",
            description: "Delete a meal template by id or name.",
            required_fields: &[],
            read_only: false,
            allowed_specialists: None,
            tags: &["meal_template", "write"],
        },
        tool_meal_template_delete,
    );
    registry.register(
        ToolSpec {
            name: "meal_log_from_template",
            description: "Create a food log entry from a saved meal template by template id or name.",
            required_fields: &[],
            read_only: false,
            allowed_specialists: None,
            tags: &["meal_template", "write"],
        },
        tool_meal_log_from_template,
    );
    registry.register(
        ToolSpec {
            name: "meal_response_signal_write",
            description: "Write a meal response signal (energy/GI outcomes) for user-level meal analysis.",
            required_fields: &[],
            read_only: false,
            allowed_specialists: None,
            tags: &["meal_response", "write"],
        },
        tool_meal_response_signal_write,
    );
    registry.register(
        ToolSpec {
            name: "notification_create",
            description: "Create a user notification/reminder entry.",
            required_fields: &["title", "message"],
            read_only: false,
            allowed_specialists: None,
            tags: &["notification", "write"],
        },
        tool_notification_create,
    );
    registry.register(
        ToolSpec {
            name: "notification_list",
            description: "List user notifications.",
            required_fields: &[],
            read_only: true,
            allowed_specialists: None,
            tags: &["notification", "read"],
        },
        tool_notification_list,
    );
    registry.register(
        ToolSpec {
            name: "notification_mark_read",
            description: "Mark a notification as read.",
            required_fields: &["notification_id"],
            read_only: false,
            allowed_specialists: None,
            tags: &["notification", "write"],
        },
        tool_notification_mark_read,
    );
    registry.register(
        ToolSpec {
            name: "framework_sync_from_profile",
            description: "Activate health frameworks mentioned in the user's profile fields.",
            required_fields: &[],
            read_only: false,
            allowed_specialists: None,
            tags: &["framework", "write"],
        },
        tool_framework_sync_from_profile,
    );
}

#[cfg(test)]
mod tests {
    use super::super::testutil::test_config;
    use super::super::{ToolContext, ToolRegistry};
    use chrono::Utc;
    use serde_json::json;
    use vital_store::users::create_user;
    use vital_store::Store;

    fn setup() -> (Store, i64, ToolRegistry) {
        let store = Store::open_in_memory().unwrap();
        let user_id = {
            let conn = store.conn();
            create_user(&conn, "a", "A").unwrap().id
        };
        (store, user_id, ToolRegistry::with_default_tools())
    }

    #[test]
    fn checklist_mark_taken_is_idempotent() {
        let (store, user_id, registry) = setup();
        let conn = store.conn();
        let ctx = ToolContext::new(&conn, user_id, "orchestrator", Utc::now(), test_config());
        let args = json!({
            "item_type": "medication",
            "names": ["Candesartan"],
            "target_date": "2026-02-21",
            "completed": true,
        });
        for _ in 0..3 {
            registry.execute("checklist_mark_taken", &args, &ctx).unwrap();
        }
        let rows =
            vital_store::checklist::items_for_date(&conn, user_id, "2026-02-21").unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].completed);
    }

    #[test]
    fn checklist_resolves_reference_queries() {
        let (store, user_id, registry) = setup();
        let conn = store.conn();
        vital_store::users::set_settings_field(
            &conn,
            user_id,
            "medications",
            Some(r#"[{"name":"Candesartan","dose":"4mg","timing":"morning"},
                     {"name":"Metformin","dose":"500mg","timing":"with dinner"}]"#),
        )
        .unwrap();
        let ctx = ToolContext::new(&conn, user_id, "orchestrator", Utc::now(), test_config());
        let out = registry
            .execute(
                "checklist_mark_taken",
                &json!({
                    "item_type": "medication",
                    "reference_query": "took my blood pressure meds",
                    "target_date": "2026-02-21",
                }),
                &ctx,
            )
            .unwrap();
        let updated: Vec<&str> = out["updated_items"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        assert_eq!(updated, vec!["Candesartan"]);
    }

    #[test]
    fn fasting_start_is_single_open_and_end_closes_it() {
        let (store, user_id, registry) = setup();
        let conn = store.conn();
        let ctx = ToolContext::new(&conn, user_id, "orchestrator", Utc::now(), test_config());

        let first = registry
            .execute("fasting_manage", &json!({"action": "start"}), &ctx)
            .unwrap();
        assert_eq!(first["status"], "started");
        let first_id = first["fasting_log_id"].as_i64().unwrap();

        // A second start never opens a second row.
        let second = registry
            .execute("fasting_manage", &json!({"action": "start"}), &ctx)
            .unwrap();
        assert_eq!(second["status"], "already_active");
        assert_eq!(second["fasting_log_id"].as_i64().unwrap(), first_id);
        assert_eq!(vital_store::logs::open_fast_count(&conn, user_id).unwrap(), 1);

        let ended = registry
            .execute("fasting_manage", &json!({"action": "end"}), &ctx)
            .unwrap();
        assert_eq!(ended["status"], "ended");
        assert_eq!(vital_store::logs::open_fast_count(&conn, user_id).unwrap(), 0);

        // Ending again reports no active fast rather than erroring.
        let again = registry
            .execute("fasting_manage", &json!({"action": "end"}), &ctx)
            .unwrap();
        assert_eq!(again["status"], "no_active_fast");
    }

    #[test]
    fn food_log_resolves_template_and_scales_macros() {
        let (store, user_id, registry) = setup();
        let conn = store.conn();
        let ctx = ToolContext::new(&conn, user_id, "orchestrator", Utc::now(), test_config());

        registry
            .execute(
                "meal_template_upsert",
                &json!({
                    "name": "Power Pancakes",
                    "ingredients": ["oats", "eggs", "banana"],
                    "servings": 2.0,
                    "calories": 520.0,
                    "protein_g": 32.0,
                }),
                &ctx,
            )
            .unwrap();

        let out = registry
            .execute(
                "food_log_write",
                &json!({
                    "meal_label": "power pancakes",
                    "items": [{"name": "power pancakes"}],
                    "servings": 1.0,
                    "use_template_if_found": true,
                }),
                &ctx,
            )
            .unwrap();
        assert_eq!(out["used_template"], true);
        let food_log_id = out["food_log_id"].as_i64().unwrap();
        let row = vital_store::logs::get_food_log(&conn, user_id, food_log_id)
            .unwrap()
            .unwrap();
        // 1 serving of a 2-serving template halves the macros.
        assert_eq!(row.calories, Some(260.0));
        assert_eq!(row.protein_g, Some(16.0));
    }

    #[test]
    fn vitals_write_updates_profile_weight() {
        let (store, user_id, registry) = setup();
        let conn = store.conn();
        let ctx = ToolContext::new(&conn, user_id, "orchestrator", Utc::now(), test_config());
        registry
            .execute(
                "vitals_log_write",
                &json!({"bp_systolic": 128, "bp_diastolic": 84, "heart_rate": 72, "weight_kg": 82.5}),
                &ctx,
            )
            .unwrap();
        let settings = vital_store::users::get_settings(&conn, user_id).unwrap();
        assert_eq!(settings.current_weight_kg, Some(82.5));

        // Empty vitals payloads are rejected before any write.
        assert!(registry
            .execute("vitals_log_write", &json!({"notes": "feeling fine"}), &ctx)
            .is_err());
    }

    #[test]
    fn medication_upsert_canonicalizes_round_trip() {
        let (store, user_id, registry) = setup();
        let conn = store.conn();
        let ctx = ToolContext::new(&conn, user_id, "orchestrator", Utc::now(), test_config());
        registry
            .execute(
                "medication_upsert",
                &json!({"item": "Candesartan 4mg"}),
                &ctx,
            )
            .unwrap();
        let settings = vital_store::users::get_settings(&conn, user_id).unwrap();
        let stored = settings.medications.unwrap();
        // Round-trip law: parse → serialize is a fixed point.
        let items = vital_core::items::parse_structured_list(Some(&stored));
        assert_eq!(items[0].name, "Candesartan");
        assert_eq!(items[0].dose, "4mg");
        let reserialized = vital_core::items::serialize_structured_list(&items).unwrap();
        assert_eq!(stored, reserialized);
    }

    #[test]
    fn profile_patch_rejects_unknown_fields() {
        let (store, user_id, registry) = setup();
        let conn = store.conn();
        let ctx = ToolContext::new(&conn, user_id, "orchestrator", Utc::now(), test_config());
        assert!(registry
            .execute("profile_patch", &json!({"patch": {"role": "admin"}}), &ctx)
            .is_err());
        registry
            .execute(
                "profile_patch",
                &json!({"patch": {"timezone": "America/Edmonton", "age": 44}}),
                &ctx,
            )
            .unwrap();
        let settings = vital_store::users::get_settings(&conn, user_id).unwrap();
        assert_eq!(settings.timezone.as_deref(), Some("America/Edmonton"));
        assert_eq!(settings.age, Some(44));
    }

    #[test]
    fn framework_sync_activates_mentioned_strategies() {
        let (store, user_id, registry) = setup();
        let conn = store.conn();
        vital_store::users::set_settings_field(
            &conn,
            user_id,
            "dietary_preferences",
            Some(r#"["Mediterranean diet", "intermittent fasting 16:8"]"#),
        )
        .unwrap();
        let ctx = ToolContext::new(&conn, user_id, "orchestrator", Utc::now(), test_config());
        let out = registry
            .execute("framework_sync_from_profile", &json!({}), &ctx)
            .unwrap();
        let synced: Vec<&str> = out["synced"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        assert!(synced.contains(&"Mediterranean"));
        assert!(synced.contains(&"Intermittent Fasting"));
        let active = vital_store::frameworks::active_frameworks(&conn, user_id).unwrap();
        assert!(active.len() >= 2);
    }
}
