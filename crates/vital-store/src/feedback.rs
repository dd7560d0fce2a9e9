use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::types::ts;

/// Insert an agent-captured feedback entry unless a near-identical one exists
/// inside the dedupe window. Returns the new row id, or None when deduped.
pub fn insert_agent_feedback(
    conn: &Connection,
    user_id: i64,
    specialist_id: &str,
    specialist_name: &str,
    feedback_type: &str,
    title: &str,
    details: Option<&str>,
    dedupe_after: DateTime<Utc>,
) -> Result<Option<i64>> {
    let dup: Option<i64> = conn
        .query_row(
            "SELECT id FROM feedback_entries
             WHERE source = 'agent' AND specialist_id = ?1 AND feedback_type = ?2
               AND title = ?3 AND created_at >= ?4
             LIMIT 1",
            params![specialist_id, feedback_type, title, ts(dedupe_after)],
            |r| r.get(0),
        )
        .optional()?;
    if dup.is_some() {
        return Ok(None);
    }

    conn.execute(
        "INSERT INTO feedback_entries
         (feedback_type, title, details, source, specialist_id, specialist_name,
          created_by_user_id, created_at)
         VALUES (?1, ?2, ?3, 'agent', ?4, ?5, ?6, ?7)",
        params![
            feedback_type,
            title,
            details,
            specialist_id,
            specialist_name,
            user_id,
            ts(Utc::now()),
        ],
    )?;
    Ok(Some(conn.last_insert_rowid()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::users::create_user;
    use chrono::Duration;

    #[test]
    fn near_duplicates_are_suppressed_in_window() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let user = create_user(&conn, "a", "A").unwrap();
        let cutoff = Utc::now() - Duration::minutes(30);

        let first = insert_agent_feedback(
            &conn, user.id, "nutritionist", "Nutritionist", "bug",
            "Macros not updating", None, cutoff,
        )
        .unwrap();
        assert!(first.is_some());

        let second = insert_agent_feedback(
            &conn, user.id, "nutritionist", "Nutritionist", "bug",
            "Macros not updating", Some("details"), cutoff,
        )
        .unwrap();
        assert!(second.is_none());

        // Different specialist is not a duplicate.
        let third = insert_agent_feedback(
            &conn, user.id, "sleep_expert", "Sleep Expert", "bug",
            "Macros not updating", None, cutoff,
        )
        .unwrap();
        assert!(third.is_some());
    }
}
