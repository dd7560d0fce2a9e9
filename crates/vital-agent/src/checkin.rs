//! Low-signal proactive check-in: short greeting phrases get a deterministic
//! plan-aware reply with no model call and no log mutation.

use std::sync::LazyLock;

use chrono::Utc;
use regex::Regex;
use rusqlite::Connection;
use vital_core::timeinfer::resolve_tz;
use vital_store::{checklist, logs, users};

use crate::error::Result;

const LOW_SIGNAL_PHRASES: &[&str] = &[
    "hi",
    "hello",
    "hey",
    "morning",
    "good morning",
    "good afternoon",
    "good evening",
    "hello coach",
    "hi coach",
    "hey coach",
    "check in",
    "checking in",
    "what now",
    "whats next",
    "what's next",
    "start",
    "start today",
];

static COMPACT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^\w\s']").unwrap());

pub fn is_low_signal_checkin(message: &str) -> bool {
    let normalized = message.trim().to_lowercase();
    let normalized = normalized.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.is_empty() {
        return false;
    }
    let compact = COMPACT_RE.replace_all(&normalized, "");
    let compact = compact.trim();
    if compact.len() > 48 {
        return false;
    }
    LOW_SIGNAL_PHRASES.contains(&compact)
}

struct PlanTask {
    title: String,
    target: Option<String>,
    metric: &'static str,
}

/// Today's plan snapshot from deterministic state: pending checklist items
/// and the day's exercise plan.
struct PlanSnapshot {
    tasks: Vec<PlanTask>,
    completed: usize,
    total: usize,
}

fn plan_snapshot(conn: &Connection, user_id: i64) -> Result<PlanSnapshot> {
    let settings = users::get_settings(conn, user_id)?;
    let tz = resolve_tz(settings.timezone.as_deref());
    let today = Utc::now().with_timezone(&tz).date_naive().format("%Y-%m-%d").to_string();

    let items = checklist::items_for_date(conn, user_id, &today)?;
    let completed = items.iter().filter(|i| i.completed).count();
    let mut total = items.len();

    let mut tasks: Vec<PlanTask> = Vec::new();
    let pending_meds: Vec<&str> = items
        .iter()
        .filter(|i| !i.completed && i.item_type == "medication")
        .map(|i| i.item_name.as_str())
        .collect();
    if !pending_meds.is_empty() {
        tasks.push(PlanTask {
            title: format!("Take scheduled medications ({})", pending_meds.join(", ")),
            target: None,
            metric: "medication_adherence",
        });
    }
    let pending_supps: Vec<&str> = items
        .iter()
        .filter(|i| !i.completed && i.item_type == "supplement")
        .map(|i| i.item_name.as_str())
        .collect();
    if !pending_supps.is_empty() {
        tasks.push(PlanTask {
            title: format!("Take scheduled supplements ({})", pending_supps.join(", ")),
            target: None,
            metric: "supplement_adherence",
        });
    }

    if let Some(plan) = logs::exercise_plan_for_date(conn, user_id, &today)? {
        if plan.plan_type != "rest_day" {
            total += 1;
            tasks.push(PlanTask {
                title: plan.title.clone(),
                target: plan.target_minutes.map(|m| format!("{m} min")),
                metric: "exercise_minutes",
            });
        }
    }

    Ok(PlanSnapshot {
        tasks,
        completed,
        total,
    })
}

fn first_action_prompt(task: Option<&PlanTask>) -> &'static str {
    match task.map(|t| t.metric) {
        Some("medication_adherence") => {
            "confirm whether you took your scheduled medications, and I'll mark the checklist now."
        }
        Some("supplement_adherence") => {
            "confirm whether you took your scheduled supplements, and I'll mark the checklist now."
        }
        Some("exercise_minutes") => {
            "confirm today's workout type and minutes now so we lock in today's movement target."
        }
        Some(_) => "confirm one task you can complete in the next 10 minutes, and I'll mark progress with you.",
        None => "tell me the first thing you've had to eat or drink today, and I'll log it now.",
    }
}

/// Deterministic plan-aware check-in reply. Never calls a model, never
/// mutates logs.
pub fn compose_proactive_reply(conn: &Connection, user_id: i64) -> Result<String> {
    let snapshot = plan_snapshot(conn, user_id)?;
    let mut lines = vec!["Great check-in. We are in execution mode.".to_string()];

    if snapshot.tasks.is_empty() {
        lines.push(
            "No pending tasks are visible right now, so we'll start with one high-impact log and \
             rebuild momentum."
                .to_string(),
        );
    } else {
        lines.push("Today's top priorities:".to_string());
        for (idx, task) in snapshot.tasks.iter().take(3).enumerate() {
            match &task.target {
                Some(target) => {
                    lines.push(format!("{}. {} (target: {target})", idx + 1, task.title))
                }
                None => lines.push(format!("{}. {}", idx + 1, task.title)),
            }
        }
    }

    if snapshot.total > 0 {
        lines.push(format!(
            "Progress today: {}/{} tasks completed.",
            snapshot.completed, snapshot.total
        ));
    }

    lines.push(format!(
        "Let's start now: {}",
        first_action_prompt(snapshot.tasks.first())
    ));
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use vital_store::users::create_user;
    use vital_store::Store;

    #[test]
    fn short_greetings_match_and_real_messages_do_not() {
        assert!(is_low_signal_checkin("hi"));
        assert!(is_low_signal_checkin("Good morning!"));
        assert!(is_low_signal_checkin("what's next"));
        assert!(!is_low_signal_checkin("hi, I had eggs for breakfast"));
        assert!(!is_low_signal_checkin("good morning, bp was 128/84"));
        assert!(!is_low_signal_checkin(""));
    }

    #[test]
    fn reply_surfaces_pending_checklist_items() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let user = create_user(&conn, "a", "A").unwrap();
        let today = Utc::now().date_naive().format("%Y-%m-%d").to_string();
        checklist::mark_item(&conn, user.id, &today, "medication", "Candesartan", false).unwrap();

        let reply = compose_proactive_reply(&conn, user.id).unwrap();
        assert!(reply.contains("Candesartan"));
        assert!(reply.contains("Progress today: 0/1"));
        assert!(reply.contains("mark the checklist now"));
    }

    #[test]
    fn empty_state_asks_for_a_first_log() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let user = create_user(&conn, "a", "A").unwrap();
        let reply = compose_proactive_reply(&conn, user.id).unwrap();
        assert!(reply.contains("first thing you've had to eat or drink"));
    }
}
