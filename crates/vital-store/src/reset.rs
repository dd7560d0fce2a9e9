use rusqlite::Connection;
use tracing::info;

use crate::error::Result;
use crate::users::bump_token_version;

/// Delete every row owned by a user, leaving the user row itself in place.
/// Session invalidation is part of the contract: token_version is bumped so
/// outstanding credentials stop working.
pub fn reset_user_data(conn: &Connection, user_id: i64) -> Result<()> {
    // Children before parents (template versions/signals reference templates,
    // proposals reference runs, telemetry references messages).
    const OWNED_TABLES: &[&str] = &[
        "ai_turn_telemetry",
        "request_telemetry_events",
        "analysis_proposals",
        "analysis_runs",
        "meal_template_versions",
        "meal_response_signals",
        "food_log",
        "meal_templates",
        "hydration_log",
        "vitals_log",
        "exercise_log",
        "supplement_log",
        "fasting_log",
        "sleep_log",
        "exercise_plans",
        "daily_checklist_items",
        "notifications",
        "user_goals",
        "health_frameworks",
        "summaries",
        "model_usage_events",
        "messages",
    ];

    let mut deleted = 0usize;
    for table in OWNED_TABLES {
        deleted += conn.execute(&format!("DELETE FROM {table} WHERE user_id = ?1"), [user_id])?;
    }
    conn.execute(
        "DELETE FROM feedback_entries WHERE created_by_user_id = ?1",
        [user_id],
    )?;
    bump_token_version(conn, user_id)?;
    info!(user_id, deleted, "user data reset");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::users::{create_user, get_user};
    use chrono::Utc;

    #[test]
    fn reset_clears_owned_rows_and_bumps_token_version() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let user = create_user(&conn, "a", "A").unwrap();

        crate::messages::insert_message(
            &conn,
            &crate::messages::NewMessage::user(user.id, "hi", false),
        )
        .unwrap();
        crate::logs::insert_hydration_log(&conn, user.id, Utc::now(), 250.0, None, None).unwrap();
        crate::checklist::mark_item(&conn, user.id, "2026-02-21", "medication", "X", true).unwrap();

        reset_user_data(&conn, user.id).unwrap();

        let msgs = crate::messages::recent_messages(&conn, user.id, 10).unwrap();
        assert!(msgs.is_empty());
        let items = crate::checklist::items_for_date(&conn, user.id, "2026-02-21").unwrap();
        assert!(items.is_empty());
        assert_eq!(get_user(&conn, user.id).unwrap().token_version, 1);
    }
}
