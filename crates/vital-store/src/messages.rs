use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::types::{parse_ts, ts, MessageRow};

pub struct NewMessage<'a> {
    pub user_id: i64,
    pub role: &'a str,
    pub content: &'a str,
    pub specialist_used: Option<&'a str>,
    pub model_used: Option<&'a str>,
    pub tokens_in: Option<i64>,
    pub tokens_out: Option<i64>,
    pub has_image: bool,
    pub created_at: Option<DateTime<Utc>>,
}

impl<'a> NewMessage<'a> {
    pub fn user(user_id: i64, content: &'a str, has_image: bool) -> Self {
        Self {
            user_id,
            role: "user",
            content,
            specialist_used: None,
            model_used: None,
            tokens_in: None,
            tokens_out: None,
            has_image,
            created_at: None,
        }
    }

    pub fn assistant(
        user_id: i64,
        content: &'a str,
        specialist: &'a str,
        model: &'a str,
        tokens_in: i64,
        tokens_out: i64,
    ) -> Self {
        Self {
            user_id,
            role: "assistant",
            content,
            specialist_used: Some(specialist),
            model_used: Some(model),
            tokens_in: Some(tokens_in),
            tokens_out: Some(tokens_out),
            has_image: false,
            created_at: None,
        }
    }
}

pub fn insert_message(conn: &Connection, msg: &NewMessage<'_>) -> Result<i64> {
    let created = ts(msg.created_at.unwrap_or_else(Utc::now));
    conn.execute(
        "INSERT INTO messages
         (user_id, role, content, specialist_used, model_used, tokens_in, tokens_out,
          has_image, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            msg.user_id,
            msg.role,
            msg.content,
            msg.specialist_used,
            msg.model_used,
            msg.tokens_in,
            msg.tokens_out,
            msg.has_image as i64,
            created,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        role: row.get(2)?,
        content: row.get(3)?,
        specialist_used: row.get(4)?,
        model_used: row.get(5)?,
        tokens_in: row.get(6)?,
        tokens_out: row.get(7)?,
        has_image: row.get::<_, i64>(8)? != 0,
        created_at: parse_ts(&row.get::<_, String>(9)?).unwrap_or_else(Utc::now),
    })
}

/// Recent messages, oldest first (for conversational context).
pub fn recent_messages(conn: &Connection, user_id: i64, limit: usize) -> Result<Vec<MessageRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, user_id, role, content, specialist_used, model_used, tokens_in,
                tokens_out, has_image, created_at
         FROM messages WHERE user_id = ?1
         ORDER BY created_at DESC, id DESC LIMIT ?2",
    )?;
    let mut rows: Vec<MessageRow> = stmt
        .query_map(params![user_id, limit as i64], row_to_message)?
        .filter_map(|r| r.ok())
        .collect();
    rows.reverse();
    Ok(rows)
}

pub fn last_assistant_message(conn: &Connection, user_id: i64) -> Result<Option<MessageRow>> {
    Ok(conn
        .query_row(
            "SELECT id, user_id, role, content, specialist_used, model_used, tokens_in,
                    tokens_out, has_image, created_at
             FROM messages WHERE user_id = ?1 AND role = 'assistant'
             ORDER BY created_at DESC, id DESC LIMIT 1",
            [user_id],
            row_to_message,
        )
        .optional()?)
}

/// User-authored messages inside a window, newest first, capped.
pub fn user_messages_between(
    conn: &Connection,
    user_id: i64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    limit: usize,
) -> Result<Vec<MessageRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, user_id, role, content, specialist_used, model_used, tokens_in,
                tokens_out, has_image, created_at
         FROM messages
         WHERE user_id = ?1 AND role = 'user' AND created_at >= ?2 AND created_at <= ?3
         ORDER BY created_at DESC, id DESC LIMIT ?4",
    )?;
    let result = stmt
        .query_map(
            params![user_id, ts(start), ts(end), limit as i64],
            row_to_message,
        )?
        .filter_map(|r| r.ok())
        .collect();
    Ok(result)
}

pub fn record_model_usage(
    conn: &Connection,
    user_id: i64,
    usage_type: &str,
    operation: &str,
    model_used: &str,
    tokens_in: i64,
    tokens_out: i64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO model_usage_events
         (user_id, usage_type, operation, model_used, tokens_in, tokens_out, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            user_id,
            usage_type,
            operation,
            model_used,
            tokens_in,
            tokens_out,
            ts(Utc::now()),
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::users::create_user;

    #[test]
    fn recent_messages_are_oldest_first() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let user = create_user(&conn, "a", "A").unwrap();
        for i in 0..5 {
            let content = format!("m{i}");
            insert_message(&conn, &NewMessage::user(user.id, &content, false)).unwrap();
        }
        let recent = recent_messages(&conn, user.id, 3).unwrap();
        let texts: Vec<_> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(texts, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn last_assistant_message_skips_user_rows() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let user = create_user(&conn, "a", "A").unwrap();
        insert_message(&conn, &NewMessage::user(user.id, "hi", false)).unwrap();
        assert!(last_assistant_message(&conn, user.id).unwrap().is_none());
        insert_message(
            &conn,
            &NewMessage::assistant(user.id, "hello", "orchestrator", "m", 1, 2),
        )
        .unwrap();
        let last = last_assistant_message(&conn, user.id).unwrap().unwrap();
        assert_eq!(last.content, "hello");
    }
}
