//! Chat-driven menu template actions: save/update intent detection, the
//! upsert against the latest food log, and post-write follow-up hints.

use std::sync::LazyLock;

use regex::Regex;
use rusqlite::Connection;
use serde_json::{json, Value};
use vital_core::config::VitalConfig;
use vital_store::types::FoodLogRow;
use vital_store::{logs, meals, messages};

use crate::error::Result;
use crate::tools::{ToolContext, ToolRegistry};

const MENU_SAVE_KEYWORDS: &[&str] = &[
    "save to menu",
    "save this to menu",
    "save this meal",
    "save it as",
    "save as",
    "add to menu",
    "add this to menu",
    "make this a menu item",
    "menu item",
];
const MENU_UPDATE_KEYWORDS: &[&str] = &[
    "update base meal",
    "update the base meal",
    "update my menu",
    "save changes to",
    "save this change to",
    "update it",
    "apply this to",
    "update menu item",
];
const MENU_CONFIRM_WORDS: &[&str] = &[
    "yes", "y", "yep", "yeah", "sure", "ok", "okay", "do it", "save it", "add it",
];
const MODIFICATION_CUES: &[&str] = &[
    "added ",
    "add ",
    "without ",
    "no ",
    "minus ",
    "instead ",
    "swap ",
    "substitute ",
    "extra ",
    "reduced ",
    "less ",
];

static TEMPLATE_NAME_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)(?:call it|name it|save (?:it|this|this meal) as|add (?:it|this|this meal) as)\s+([a-zA-Z0-9][^.!?\n]+)",
        r"(?i)(?:template name is|menu name is)\s+([a-zA-Z0-9][^.!?\n]+)",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});
static SAVE_TO_MENU_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:save|add)\b.{0,80}\bto your menu\b").unwrap());

fn normalize(text: &str) -> String {
    text.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

fn assistant_requested_menu_save(conn: &Connection, user_id: i64) -> Result<bool> {
    let Some(last) = messages::last_assistant_message(conn, user_id)? else {
        return Ok(false);
    };
    let text = normalize(&last.content);
    if text.contains("save this meal to your menu")
        || text.contains("save this to your menu")
        || text.contains("add this to your menu")
    {
        return Ok(true);
    }
    Ok(SAVE_TO_MENU_RE.is_match(&text))
}

fn assistant_requested_menu_update(conn: &Connection, user_id: i64) -> Result<bool> {
    let Some(last) = messages::last_assistant_message(conn, user_id)? else {
        return Ok(false);
    };
    let text = normalize(&last.content);
    Ok(text.contains("update your base menu item") || text.contains("update the base meal template"))
}

pub fn has_menu_save_intent(conn: &Connection, user_id: i64, message: &str) -> Result<bool> {
    let norm = normalize(message);
    if MENU_SAVE_KEYWORDS.iter().any(|k| norm.contains(k)) {
        return Ok(true);
    }
    if assistant_requested_menu_save(conn, user_id)? {
        if MENU_CONFIRM_WORDS.contains(&norm.as_str())
            || norm.starts_with("yes")
            || norm.contains("save")
            || norm.contains("add it")
        {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn has_menu_update_intent(conn: &Connection, user_id: i64, message: &str) -> Result<bool> {
    let norm = normalize(message);
    if MENU_UPDATE_KEYWORDS.iter().any(|k| norm.contains(k)) {
        return Ok(true);
    }
    if assistant_requested_menu_update(conn, user_id)? {
        if MENU_CONFIRM_WORDS.contains(&norm.as_str())
            || norm.starts_with("yes")
            || norm.contains("update")
            || norm.contains("base meal")
        {
            return Ok(true);
        }
    }
    Ok(false)
}

/// True when the message itself reads as a food log, so a menu keyword inside
/// it is a side note rather than a pure command.
pub fn looks_like_food_logging_message(message: &str) -> bool {
    let text = normalize(message);
    let strong_cues = [
        "i had ",
        "i ate ",
        "i drank ",
        "for lunch",
        "for breakfast",
        "for dinner",
        "for snack",
        "my lunch was",
        "my breakfast was",
        "my dinner was",
    ];
    if strong_cues.iter().any(|c| text.contains(c)) {
        return true;
    }
    let quantity_tokens = [
        " cup", " cups", " tbsp", " tsp", " oz", " ml", " g ", " gram", " grams", " scoop",
        " scoops",
    ];
    text.contains(',') && quantity_tokens.iter().any(|t| text.contains(t))
}

pub fn has_modification_cues(message: &str) -> bool {
    let text = normalize(message);
    MODIFICATION_CUES.iter().any(|c| text.contains(c))
}

fn extract_template_name(message: &str) -> Option<String> {
    for re in TEMPLATE_NAME_RES.iter() {
        if let Some(c) = re.captures(message.trim()) {
            let candidate = c[1].trim().trim_matches(['"', '\'']).to_string();
            let candidate = candidate.split_whitespace().collect::<Vec<_>>().join(" ");
            if !candidate.is_empty() {
                return Some(candidate.chars().take(80).collect());
            }
        }
    }
    None
}

fn parse_food_items(food_log: &FoodLogRow) -> Vec<String> {
    serde_json::from_str::<Value>(&food_log.items)
        .ok()
        .and_then(|v| {
            v.as_array().map(|arr| {
                arr.iter()
                    .filter_map(|item| match item {
                        Value::Object(o) => o
                            .get("name")
                            .and_then(Value::as_str)
                            .map(str::trim)
                            .filter(|s| !s.is_empty())
                            .map(str::to_string),
                        Value::String(s) => Some(s.trim().to_string()),
                        _ => None,
                    })
                    .collect()
            })
        })
        .unwrap_or_default()
}

fn template_payload_from_food_log(food_log: &FoodLogRow, name_override: Option<&str>) -> Value {
    let ingredient_names = parse_food_items(food_log);
    let name = name_override
        .map(str::to_string)
        .or_else(|| food_log.meal_label.clone().filter(|l| !l.trim().is_empty()))
        .or_else(|| ingredient_names.first().cloned())
        .unwrap_or_else(|| "Saved Meal".to_string());

    json!({
        "name": name,
        "ingredients": ingredient_names,
        "servings": 1.0,
        "calories": food_log.calories,
        "protein_g": food_log.protein_g,
        "carbs_g": food_log.carbs_g,
        "fat_g": food_log.fat_g,
        "fiber_g": food_log.fiber_g,
        "sodium_mg": food_log.sodium_mg,
        "notes": food_log.notes.as_deref().map(str::trim).filter(|n| !n.is_empty()),
    })
}

/// Attempt a save/update of a menu template against the source (or most
/// recent) food log. Returns None when no menu intent is present; otherwise a
/// status object for the menu context block.
pub fn try_handle_menu_template_action(
    conn: &Connection,
    registry: &ToolRegistry,
    config: &VitalConfig,
    user_id: i64,
    message: &str,
    source_food_log: Option<&FoodLogRow>,
    reference_utc: chrono::DateTime<chrono::Utc>,
) -> Result<Option<Value>> {
    let save_intent = has_menu_save_intent(conn, user_id, message)?;
    let update_intent = has_menu_update_intent(conn, user_id, message)?;
    if !save_intent && !update_intent {
        return Ok(None);
    }
    let action = if update_intent { "update" } else { "save" };

    let latest = match source_food_log {
        Some(row) => Some(row.clone()),
        None => logs::latest_food_log(conn, user_id, 72)?,
    };
    let Some(latest) = latest else {
        return Ok(Some(json!({
            "status": "failed",
            "action": action,
            "reason": "No recent food log found to build a menu item.",
        })));
    };

    let template_name = extract_template_name(message);
    let mut payload = template_payload_from_food_log(&latest, template_name.as_deref());
    if update_intent && template_name.is_none() {
        if let Some(template_id) = latest.meal_template_id {
            if let Some(existing) = meals::get_template(conn, user_id, template_id)? {
                payload["name"] = json!(existing.name);
            }
        }
    }
    payload["change_note"] = json!(if update_intent {
        "Updated from chat-confirmed base meal adjustment"
    } else {
        "Created from chat food log"
    });

    let ctx = ToolContext::new(conn, user_id, "orchestrator", reference_utc, config);
    match registry.execute("meal_template_upsert", &payload, &ctx) {
        Ok(out) => Ok(Some(json!({
            "status": "success",
            "action": action,
            "result": out,
            "template_name": payload["name"],
        }))),
        Err(e) => Ok(Some(json!({
            "status": "failed",
            "action": action,
            "reason": e.to_string(),
        }))),
    }
}

/// Post-write hint: ask to save a non-template meal, or to update the base
/// template after a modified template log.
pub fn build_menu_followup_hint(
    conn: &Connection,
    user_id: i64,
    category_is_food: bool,
    message: &str,
    parsed_log: Option<&Value>,
    saved_out: Option<&Value>,
    menu_action_result: Option<&Value>,
) -> Result<Option<Value>> {
    if !category_is_food {
        return Ok(None);
    }
    let Some(saved) = saved_out else {
        return Ok(None);
    };
    if menu_action_result
        .and_then(|m| m.get("status"))
        .and_then(Value::as_str)
        == Some("success")
    {
        return Ok(None);
    }

    let used_template = saved
        .get("used_template")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if !used_template {
        let mut meal_name = parsed_log
            .and_then(|p| p.get("meal_label"))
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or("")
            .to_string();
        if meal_name.is_empty() {
            if let Some(latest) = logs::latest_food_log(conn, user_id, 24)? {
                meal_name = latest.meal_label.unwrap_or_default();
            }
        }
        return Ok(Some(json!({ "type": "ask_save_menu", "meal_name": meal_name })));
    }

    if has_modification_cues(message) {
        return Ok(Some(json!({
            "type": "ask_update_base",
            "meal_template_id": saved.get("meal_template_id"),
        })));
    }
    Ok(None)
}

/// Render the Menu Action / Menu Follow-Up context block.
pub fn format_menu_context(menu_action: Option<&Value>, followup_hint: Option<&Value>) -> String {
    let mut lines: Vec<String> = Vec::new();
    if let Some(action) = menu_action {
        let status = action.get("status").and_then(Value::as_str).unwrap_or("");
        let act = action.get("action").and_then(Value::as_str).unwrap_or("save");
        lines.push("## Menu Action".to_string());
        lines.push(format!("- Action: {act}"));
        if status == "success" {
            lines.push("- Status: success".to_string());
            if let Some(name) = action.get("template_name").and_then(Value::as_str) {
                lines.push(format!("- Template: {name}"));
            }
            lines.push("Acknowledge that the menu item was updated.".to_string());
        } else {
            lines.push("- Status: failed".to_string());
            let reason = action
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error");
            lines.push(format!("- Reason: {reason}"));
            lines.push("Explain briefly what failed and ask for clarification.".to_string());
        }
    }

    if let Some(hint) = followup_hint {
        lines.push("## Menu Follow-Up".to_string());
        match hint.get("type").and_then(Value::as_str) {
            Some("ask_save_menu") => {
                let meal_name = hint.get("meal_name").and_then(Value::as_str).unwrap_or("");
                if meal_name.is_empty() {
                    lines.push("The user logged a meal that is not in menu templates.".to_string());
                } else {
                    lines.push(format!(
                        "The user logged a meal (`{meal_name}`) that is not in menu templates."
                    ));
                }
                lines.push(
                    "Ask one short follow-up question: do they want to save it to their menu?"
                        .to_string(),
                );
            }
            Some("ask_update_base") => {
                lines.push("The user logged a template meal with modifications.".to_string());
                lines.push(
                    "Ask one short follow-up question: should this adjustment update the base \
                     menu item or stay one-off?"
                        .to_string(),
                );
            }
            _ => {}
        }
    }

    lines.join("\n").trim().to_string()
}

/// Follow-up chunk appended after the stream when the model forgot to ask.
pub fn followup_line_from_hint(followup_hint: Option<&Value>) -> String {
    let Some(hint) = followup_hint else {
        return String::new();
    };
    match hint.get("type").and_then(Value::as_str) {
        Some("ask_save_menu") => {
            let meal_name = hint.get("meal_name").and_then(Value::as_str).unwrap_or("");
            if meal_name.is_empty() {
                "Do you want me to save this meal to your menu for quick future logging?".to_string()
            } else {
                format!("Do you want me to save `{meal_name}` to your menu for quick future logging?")
            }
        }
        Some("ask_update_base") => {
            "Do you want this adjustment to update the base menu item, or keep it as a one-off \
             change today?"
                .to_string()
        }
        _ => String::new(),
    }
}

pub fn response_already_has_followup(full_response: &str, followup_hint: Option<&Value>) -> bool {
    let Some(hint) = followup_hint else {
        return true;
    };
    let text = normalize(full_response);
    match hint.get("type").and_then(Value::as_str) {
        Some("ask_save_menu") => {
            text.contains("save") && text.contains("menu") && full_response.contains('?')
        }
        Some("ask_update_base") => {
            text.contains("update")
                && (text.contains("base meal") || text.contains("one-off"))
                && full_response.contains('?')
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolRegistry;
    use chrono::Utc;
    use vital_store::users::create_user;
    use vital_store::Store;

    fn insert_food(conn: &Connection, user_id: i64, label: &str) -> i64 {
        logs::insert_food_log(
            conn,
            &logs::NewFoodLog {
                user_id,
                meal_template_id: None,
                logged_at: Utc::now(),
                meal_label: Some(label),
                items_json: r#"[{"name":"oats"},{"name":"eggs"}]"#,
                calories: Some(420.0),
                protein_g: Some(28.0),
                carbs_g: None,
                fat_g: None,
                fiber_g: None,
                sodium_mg: None,
                notes: None,
            },
        )
        .unwrap()
    }

    #[test]
    fn save_command_builds_template_from_latest_food_log() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let user = create_user(&conn, "a", "A").unwrap();
        insert_food(&conn, user.id, "Breakfast");
        let registry = ToolRegistry::with_default_tools();
        let config = vital_core::config::VitalConfig::default();

        let out = try_handle_menu_template_action(
            &conn,
            &registry,
            &config,
            user.id,
            "save this meal as Power Breakfast",
            None,
            Utc::now(),
        )
        .unwrap()
        .unwrap();
        assert_eq!(out["status"], "success");
        assert_eq!(out["template_name"], "Power Breakfast");

        let row = meals::get_template_by_normalized_name(&conn, user.id, "power breakfast")
            .unwrap()
            .unwrap();
        assert_eq!(row.calories, Some(420.0));
    }

    #[test]
    fn save_without_food_history_fails_gracefully() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let user = create_user(&conn, "a", "A").unwrap();
        let registry = ToolRegistry::with_default_tools();
        let config = vital_core::config::VitalConfig::default();

        let out = try_handle_menu_template_action(
            &conn, &registry, &config, user.id, "save this to menu", None, Utc::now(),
        )
        .unwrap()
        .unwrap();
        assert_eq!(out["status"], "failed");
    }

    #[test]
    fn non_menu_messages_return_none() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let user = create_user(&conn, "a", "A").unwrap();
        let registry = ToolRegistry::with_default_tools();
        let config = vital_core::config::VitalConfig::default();
        let out = try_handle_menu_template_action(
            &conn, &registry, &config, user.id, "I had eggs for breakfast", None, Utc::now(),
        )
        .unwrap();
        assert!(out.is_none());
    }

    #[test]
    fn followup_hint_asks_to_save_unknown_meals() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let user = create_user(&conn, "a", "A").unwrap();
        let hint = build_menu_followup_hint(
            &conn,
            user.id,
            true,
            "I had a chicken bowl for lunch",
            Some(&json!({"meal_label": "Lunch"})),
            Some(&json!({"food_log_id": 1, "used_template": false})),
            None,
        )
        .unwrap()
        .unwrap();
        assert_eq!(hint["type"], "ask_save_menu");
        assert_eq!(hint["meal_name"], "Lunch");

        let line = followup_line_from_hint(Some(&hint));
        assert!(line.contains("save `Lunch`"));
        assert!(!response_already_has_followup("Logged it!", Some(&hint)));
        assert!(response_already_has_followup(
            "Logged. Want me to save this to your menu?",
            Some(&hint)
        ));
    }

    #[test]
    fn modified_template_log_asks_to_update_base() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let user = create_user(&conn, "a", "A").unwrap();
        let hint = build_menu_followup_hint(
            &conn,
            user.id,
            true,
            "power pancakes without banana",
            None,
            Some(&json!({"food_log_id": 1, "used_template": true, "meal_template_id": 3})),
            None,
        )
        .unwrap()
        .unwrap();
        assert_eq!(hint["type"], "ask_update_base");
    }

    #[test]
    fn food_logging_text_is_not_a_pure_menu_command() {
        assert!(looks_like_food_logging_message("I had oats for breakfast, 1 cup"));
        assert!(!looks_like_food_logging_message("save this meal as Lunch Bowl"));
    }
}
