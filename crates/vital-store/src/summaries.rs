use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::types::ts;

/// Latest narrative of a summary type ("daily" / "weekly"), if any.
pub fn latest_narrative(
    conn: &Connection,
    user_id: i64,
    summary_type: &str,
) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT full_narrative FROM summaries
             WHERE user_id = ?1 AND summary_type = ?2 AND full_narrative IS NOT NULL
             ORDER BY period_end DESC, id DESC LIMIT 1",
            params![user_id, summary_type],
            |r| r.get::<_, Option<String>>(0),
        )
        .optional()?
        .flatten())
}

pub fn insert_summary(
    conn: &Connection,
    user_id: i64,
    summary_type: &str,
    period_start: &str,
    period_end: &str,
    full_narrative: &str,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO summaries
         (user_id, summary_type, period_start, period_end, full_narrative, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            user_id,
            summary_type,
            period_start,
            period_end,
            full_narrative,
            ts(Utc::now())
        ],
    )?;
    Ok(conn.last_insert_rowid())
}
