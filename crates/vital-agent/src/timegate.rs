//! Low-confidence time confirmation: notification persistence and the
//! ack / reject / correction state machine driven by the next user message.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use rusqlite::Connection;
use serde_json::{json, Value};
use tracing::warn;
use vital_core::jsonx::parse_loose_json;
use vital_core::timeinfer::{has_explicit_date_token, infer_event_datetime};
use vital_core::types::{Confidence, IntentCategory};
use vital_store::{logs, notifications};

use crate::error::Result;
use crate::parser::extract_time_token;

pub const TIME_CONFIRMATION_KIND: &str = "time_confirmation";

/// Metadata keys the orchestrator attaches to parsed payloads after time
/// inference. Never persisted to log rows.
pub const INFERRED_CONFIDENCE_KEY: &str = "_inferred_time_confidence";
pub const INFERRED_REASON_KEY: &str = "_inferred_time_reason";

const ACK_TERMS: &[&str] = &[
    "yes",
    "y",
    "yep",
    "yeah",
    "correct",
    "confirmed",
    "thats right",
    "that's right",
    "right",
    "sounds right",
    "looks right",
];
const REJECT_TERMS: &[&str] = &[
    "no",
    "nope",
    "wrong",
    "incorrect",
    "not right",
    "thats wrong",
    "that's wrong",
];

static CLEAN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-z0-9:\s]").unwrap());

fn clean_confirmation_text(text: &str) -> String {
    let lowered = text.to_lowercase();
    let cleaned = CLEAN_RE.replace_all(&lowered, " ");
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn is_confirmation_ack(message: &str) -> bool {
    let cleaned = clean_confirmation_text(message);
    if cleaned.is_empty() {
        return false;
    }
    ACK_TERMS
        .iter()
        .any(|term| cleaned == *term || cleaned.starts_with(&format!("{term} ")))
}

pub fn is_confirmation_reject(message: &str) -> bool {
    let cleaned = clean_confirmation_text(message);
    if cleaned.is_empty() {
        return false;
    }
    REJECT_TERMS
        .iter()
        .any(|term| cleaned == *term || cleaned.starts_with(&format!("{term} ")))
}

/// A short standalone confirmation consumes the turn (no new log parse).
/// Conjunctions, commas, or length beyond ~12 words mean new intent.
pub fn should_consume_message(message: &str) -> bool {
    let normalized = message.trim().to_lowercase();
    if normalized.is_empty() {
        return false;
    }
    if normalized.contains(" and ") || normalized.contains(',') || normalized.contains(';') {
        return false;
    }
    normalized.split_whitespace().count() <= 12
}

/// (table, id key, field) targeted by a confirmation for a category/action.
fn confirmation_target(
    category: IntentCategory,
    action: Option<&str>,
) -> Option<(&'static str, &'static str, &'static str)> {
    match category {
        IntentCategory::LogFood => Some(("food_log", "food_log_id", "logged_at")),
        IntentCategory::LogVitals => Some(("vitals_log", "vitals_log_id", "logged_at")),
        IntentCategory::LogExercise => Some(("exercise_log", "exercise_log_id", "logged_at")),
        IntentCategory::LogHydration => Some(("hydration_log", "hydration_log_id", "logged_at")),
        IntentCategory::LogSupplement => Some(("supplement_log", "supplement_log_id", "logged_at")),
        IntentCategory::LogFasting => {
            let field = if action == Some("end") { "fast_end" } else { "fast_start" };
            Some(("fasting_log", "fasting_log_id", field))
        }
        IntentCategory::LogSleep => {
            let field = if action == Some("end") { "sleep_end" } else { "sleep_start" };
            Some(("sleep_log", "sleep_log_id", field))
        }
        _ => None,
    }
}

fn table_for_category(category: &str) -> Option<&'static str> {
    match category {
        "log_food" => Some("food_log"),
        "log_vitals" => Some("vitals_log"),
        "log_exercise" => Some("exercise_log"),
        "log_hydration" => Some("hydration_log"),
        "log_supplement" => Some("supplement_log"),
        "log_fasting" => Some("fasting_log"),
        "log_sleep" => Some("sleep_log"),
        _ => None,
    }
}

/// After a successful `log_*` write with low inferred confidence, create (or
/// refresh) the single pending confirmation notification for the saved row.
pub fn persist_low_confidence_confirmation(
    conn: &Connection,
    user_id: i64,
    category: IntentCategory,
    parsed_payload: &Value,
    saved_out: &Value,
) -> Result<Option<i64>> {
    let confidence = parsed_payload
        .get(INFERRED_CONFIDENCE_KEY)
        .and_then(Value::as_str)
        .and_then(Confidence::parse);
    if confidence != Some(Confidence::Low) {
        return Ok(None);
    }

    let action = parsed_payload.get("action").and_then(Value::as_str);
    let Some((_, id_key, field)) = confirmation_target(category, action) else {
        return Ok(None);
    };
    let Some(record_id) = saved_out.get(id_key).and_then(Value::as_i64) else {
        return Ok(None);
    };
    let recorded_iso = parsed_payload
        .get(field)
        .or_else(|| parsed_payload.get("logged_at"))
        .or_else(|| parsed_payload.get("event_time"))
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or("");
    if recorded_iso.is_empty() {
        return Ok(None);
    }
    let reason = parsed_payload
        .get(INFERRED_REASON_KEY)
        .and_then(Value::as_str)
        .filter(|r| !r.is_empty())
        .unwrap_or("unknown");

    let payload = json!({
        "kind": TIME_CONFIRMATION_KIND,
        "status": "pending",
        "category": category.as_str(),
        "record_id": record_id,
        "field": field,
        "inferred_iso": recorded_iso,
        "reason": reason,
        "confidence": "low",
    });
    const TITLE: &str = "Confirm logged time";
    const MESSAGE: &str =
        "I inferred this event time with low confidence. Please confirm or provide a corrected time.";

    // Refresh an existing pending note for the same row instead of stacking.
    for row in notifications::list_notifications(conn, user_id, true, 25)? {
        if row.category != "system" {
            continue;
        }
        let Some(existing) = row.payload.as_deref().and_then(parse_loose_json) else {
            continue;
        };
        if existing.get("kind").and_then(Value::as_str) == Some(TIME_CONFIRMATION_KIND)
            && existing.get("category").and_then(Value::as_str) == Some(category.as_str())
            && existing.get("record_id").and_then(Value::as_i64) == Some(record_id)
            && existing.get("field").and_then(Value::as_str) == Some(field)
        {
            notifications::update_payload(
                conn,
                user_id,
                row.id,
                &payload.to_string(),
                Some(TITLE),
                Some(MESSAGE),
            )?;
            return Ok(Some(row.id));
        }
    }

    let id = notifications::insert_notification(
        conn,
        user_id,
        "system",
        TITLE,
        MESSAGE,
        Some(&payload.to_string()),
    )?;
    Ok(Some(id))
}

/// The newest unread pending confirmation, if any.
pub fn latest_pending_confirmation(
    conn: &Connection,
    user_id: i64,
) -> Result<Option<(i64, Value)>> {
    for row in notifications::list_notifications(conn, user_id, true, 50)? {
        if row.category != "system" {
            continue;
        }
        let Some(payload) = row.payload.as_deref().and_then(parse_loose_json) else {
            continue;
        };
        let is_pending = payload
            .get("status")
            .and_then(Value::as_str)
            .map(|s| s == "pending")
            .unwrap_or(true);
        if payload.get("kind").and_then(Value::as_str) == Some(TIME_CONFIRMATION_KIND) && is_pending
        {
            return Ok(Some((row.id, payload)));
        }
    }
    Ok(None)
}

pub struct GateOutcome {
    pub context: String,
    pub skip_log_parse: bool,
}

impl GateOutcome {
    fn pass() -> Self {
        Self {
            context: String::new(),
            skip_log_parse: false,
        }
    }
}

fn pending_context(payload: &Value) -> String {
    let category = payload
        .get("category")
        .and_then(Value::as_str)
        .unwrap_or("event")
        .replace("log_", "")
        .replace('_', " ");
    let field = payload
        .get("field")
        .and_then(Value::as_str)
        .unwrap_or("time")
        .replace('_', " ");
    let inferred = payload
        .get("inferred_iso")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or("unknown");
    let reason = payload
        .get("reason")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or("unknown");
    format!(
        "## Pending Time Confirmation\n\
         There is an unresolved low-confidence event time.\n\
         - Event type: {category}\n\
         - Field: {field}\n\
         - Currently recorded: {inferred}\n\
         - Inference reason: {reason}\n\
         - Ask the user to confirm this time or provide a corrected date/time in this reply.\n\
         - Do not describe this timestamp as final until confirmed."
    )
}

/// Run the confirmation gate against the incoming message.
///
/// Transitions: ack → confirmed (marks read); explicit clock/date →
/// corrected (rewrites the prior row's field, marks read); reject → stays
/// pending with an ask-for-exact-time prompt; anything else re-injects the
/// pending context. An explicit clock/date always wins over an ack phrase.
pub fn handle_pending_confirmation(
    conn: &Connection,
    user_id: i64,
    message: &str,
    reference_utc: DateTime<Utc>,
    tz_name: Option<&str>,
) -> Result<GateOutcome> {
    let Some((note_id, mut payload)) = latest_pending_confirmation(conn, user_id)? else {
        return Ok(GateOutcome::pass());
    };

    let has_clock_or_date = extract_time_token(message).is_some() || has_explicit_date_token(message);

    if is_confirmation_ack(message) && !has_clock_or_date {
        payload["status"] = json!("confirmed");
        payload["confirmed_at"] = json!(reference_utc.to_rfc3339());
        notifications::update_payload(conn, user_id, note_id, &payload.to_string(), None, None)?;
        notifications::mark_read(conn, user_id, note_id, reference_utc)?;
        return Ok(GateOutcome {
            context: "## Time Confirmation\nThe user has confirmed a previously inferred event \
                      time. Acknowledge confirmation briefly."
                .to_string(),
            skip_log_parse: should_consume_message(message),
        });
    }

    if has_clock_or_date {
        let corrected = infer_event_datetime(message, Some(reference_utc), tz_name);
        let applied = apply_correction(conn, user_id, &payload, corrected.event_utc)?;
        if applied {
            payload["status"] = json!("corrected");
            payload["corrected_iso"] = json!(corrected.event_utc.to_rfc3339());
            payload["corrected_at"] = json!(reference_utc.to_rfc3339());
            notifications::update_payload(conn, user_id, note_id, &payload.to_string(), None, None)?;
            notifications::mark_read(conn, user_id, note_id, reference_utc)?;
            return Ok(GateOutcome {
                context: format!(
                    "## Time Correction Applied\nUser corrected the prior event time. Updated \
                     value: {}.\nAcknowledge the correction and continue.",
                    corrected.event_utc.to_rfc3339()
                ),
                skip_log_parse: should_consume_message(message),
            });
        }
        warn!(note_id, "time correction target row missing");
    }

    if is_confirmation_reject(message) {
        return Ok(GateOutcome {
            context: "## Pending Time Confirmation\nUser rejected a previously inferred event \
                      time.\n- Ask for the exact date/time now.\n- Keep the current value as \
                      provisional until corrected."
                .to_string(),
            skip_log_parse: false,
        });
    }

    Ok(GateOutcome {
        context: pending_context(&payload),
        skip_log_parse: false,
    })
}

fn apply_correction(
    conn: &Connection,
    user_id: i64,
    payload: &Value,
    corrected_utc: DateTime<Utc>,
) -> Result<bool> {
    let category = payload.get("category").and_then(Value::as_str).unwrap_or("");
    let field = payload.get("field").and_then(Value::as_str).unwrap_or("");
    let Some(record_id) = payload.get("record_id").and_then(Value::as_i64) else {
        return Ok(false);
    };
    let Some(table) = table_for_category(category) else {
        return Ok(false);
    };
    Ok(logs::apply_time_correction(
        conn,
        user_id,
        table,
        record_id,
        field,
        corrected_utc,
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use vital_store::users::create_user;
    use vital_store::Store;

    fn seed_low_confidence_food(conn: &Connection, user_id: i64) -> (i64, i64) {
        let logged_at = Utc::now() - Duration::hours(3);
        let food_id = logs::insert_food_log(
            conn,
            &logs::NewFoodLog {
                user_id,
                meal_template_id: None,
                logged_at,
                meal_label: Some("Snack"),
                items_json: r#"[{"name":"protein shake"}]"#,
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

        let parsed = json!({
            "logged_at": logged_at.to_rfc3339(),
            INFERRED_CONFIDENCE_KEY: "low",
            INFERRED_REASON_KEY: "date:low,time:low",
        });
        let saved = json!({ "food_log_id": food_id });
        let note_id = persist_low_confidence_confirmation(
            conn,
            user_id,
            IntentCategory::LogFood,
            &parsed,
            &saved,
        )
        .unwrap()
        .unwrap();
        (food_id, note_id)
    }

    #[test]
    fn low_confidence_write_creates_exactly_one_pending_note() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let user = create_user(&conn, "a", "A").unwrap();
        let (food_id, note_id) = seed_low_confidence_food(&conn, user.id);

        let (pending_id, payload) = latest_pending_confirmation(&conn, user.id).unwrap().unwrap();
        assert_eq!(pending_id, note_id);
        assert_eq!(payload["kind"], TIME_CONFIRMATION_KIND);
        assert_eq!(payload["record_id"], food_id);
        assert_eq!(payload["field"], "logged_at");

        // A second low-confidence write for the same row refreshes, not stacks.
        let parsed = json!({
            "logged_at": Utc::now().to_rfc3339(),
            INFERRED_CONFIDENCE_KEY: "low",
            INFERRED_REASON_KEY: "date:low,time:low",
        });
        let again = persist_low_confidence_confirmation(
            &conn,
            user.id,
            IntentCategory::LogFood,
            &parsed,
            &json!({ "food_log_id": food_id }),
        )
        .unwrap()
        .unwrap();
        assert_eq!(again, note_id);
        let unread = notifications::list_notifications(&conn, user.id, true, 10).unwrap();
        assert_eq!(unread.len(), 1);
    }

    #[test]
    fn medium_confidence_creates_no_note() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let user = create_user(&conn, "a", "A").unwrap();
        let parsed = json!({
            "logged_at": Utc::now().to_rfc3339(),
            INFERRED_CONFIDENCE_KEY: "medium",
        });
        let out = persist_low_confidence_confirmation(
            &conn,
            user.id,
            IntentCategory::LogFood,
            &parsed,
            &json!({ "food_log_id": 1 }),
        )
        .unwrap();
        assert!(out.is_none());
    }

    #[test]
    fn ack_marks_confirmed_and_consumes_short_message() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let user = create_user(&conn, "a", "A").unwrap();
        seed_low_confidence_food(&conn, user.id);

        let out = handle_pending_confirmation(&conn, user.id, "yes", Utc::now(), Some("UTC")).unwrap();
        assert!(out.skip_log_parse);
        assert!(out.context.contains("confirmed"));
        assert!(latest_pending_confirmation(&conn, user.id).unwrap().is_none());
    }

    #[test]
    fn clock_token_corrects_the_saved_row() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let user = create_user(&conn, "a", "A").unwrap();
        let (food_id, _) = seed_low_confidence_food(&conn, user.id);

        let reference = Utc::now();
        let out = handle_pending_confirmation(
            &conn,
            user.id,
            "it was at 9:15am",
            reference,
            Some("UTC"),
        )
        .unwrap();
        assert!(out.context.contains("Time Correction Applied"));
        assert!(out.skip_log_parse);

        let row = logs::get_food_log(&conn, user.id, food_id).unwrap().unwrap();
        use chrono::Timelike;
        assert_eq!((row.logged_at.hour(), row.logged_at.minute()), (9, 15));
        assert!(latest_pending_confirmation(&conn, user.id).unwrap().is_none());
    }

    #[test]
    fn reject_keeps_the_note_pending() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let user = create_user(&conn, "a", "A").unwrap();
        seed_low_confidence_food(&conn, user.id);

        let out = handle_pending_confirmation(&conn, user.id, "no that's wrong", Utc::now(), None)
            .unwrap();
        assert!(!out.skip_log_parse);
        assert!(out.context.contains("rejected"));
        assert!(latest_pending_confirmation(&conn, user.id).unwrap().is_some());
    }

    #[test]
    fn long_messages_are_not_consumed() {
        assert!(should_consume_message("yes"));
        assert!(should_consume_message("that's right thanks"));
        assert!(!should_consume_message("yes, and I also had a banana"));
        assert!(!should_consume_message(
            "yes that is right but let me also tell you about everything else I ate today ok"
        ));
    }
}
