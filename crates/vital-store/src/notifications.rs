use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Result, StoreError};
use crate::types::{parse_ts, parse_ts_opt, ts, NotificationRow};

const COLS: &str = "id, user_id, category, title, message, payload, is_read, created_at, read_at";

fn row_to_notification(row: &rusqlite::Row<'_>) -> rusqlite::Result<NotificationRow> {
    Ok(NotificationRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        category: row.get(2)?,
        title: row.get(3)?,
        message: row.get(4)?,
        payload: row.get(5)?,
        is_read: row.get::<_, i64>(6)? != 0,
        created_at: parse_ts(&row.get::<_, String>(7)?).unwrap_or_else(Utc::now),
        read_at: parse_ts_opt(row.get(8)?),
    })
}

pub fn insert_notification(
    conn: &Connection,
    user_id: i64,
    category: &str,
    title: &str,
    message: &str,
    payload_json: Option<&str>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO notifications (user_id, category, title, message, payload, is_read, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
        params![user_id, category, title, message, payload_json, ts(Utc::now())],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn list_notifications(
    conn: &Connection,
    user_id: i64,
    unread_only: bool,
    limit: usize,
) -> Result<Vec<NotificationRow>> {
    let sql = if unread_only {
        format!(
            "SELECT {COLS} FROM notifications WHERE user_id = ?1 AND is_read = 0
             ORDER BY created_at DESC, id DESC LIMIT ?2"
        )
    } else {
        format!(
            "SELECT {COLS} FROM notifications WHERE user_id = ?1
             ORDER BY created_at DESC, id DESC LIMIT ?2"
        )
    };
    let mut stmt = conn.prepare(&sql)?;
    let result = stmt
        .query_map(params![user_id, limit as i64], row_to_notification)?
        .filter_map(|r| r.ok())
        .collect();
    Ok(result)
}

pub fn get_notification(
    conn: &Connection,
    user_id: i64,
    id: i64,
) -> Result<Option<NotificationRow>> {
    Ok(conn
        .query_row(
            &format!("SELECT {COLS} FROM notifications WHERE user_id = ?1 AND id = ?2"),
            params![user_id, id],
            row_to_notification,
        )
        .optional()?)
}

pub fn mark_read(
    conn: &Connection,
    user_id: i64,
    id: i64,
    read_at: DateTime<Utc>,
) -> Result<()> {
    let n = conn.execute(
        "UPDATE notifications SET is_read = 1, read_at = ?3 WHERE user_id = ?1 AND id = ?2",
        params![user_id, id, ts(read_at)],
    )?;
    if n == 0 {
        return Err(StoreError::NotFound {
            entity: "notification",
            id,
        });
    }
    Ok(())
}

pub fn update_payload(
    conn: &Connection,
    user_id: i64,
    id: i64,
    payload_json: &str,
    title: Option<&str>,
    message: Option<&str>,
) -> Result<()> {
    let n = conn.execute(
        "UPDATE notifications
         SET payload = ?3,
             title = COALESCE(?4, title),
             message = COALESCE(?5, message)
         WHERE user_id = ?1 AND id = ?2",
        params![user_id, id, payload_json, title, message],
    )?;
    if n == 0 {
        return Err(StoreError::NotFound {
            entity: "notification",
            id,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::users::create_user;

    #[test]
    fn unread_filter_and_mark_read() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let user = create_user(&conn, "a", "A").unwrap();
        let id = insert_notification(&conn, user.id, "system", "t", "m", None).unwrap();
        insert_notification(&conn, user.id, "info", "t2", "m2", None).unwrap();

        assert_eq!(list_notifications(&conn, user.id, true, 10).unwrap().len(), 2);
        mark_read(&conn, user.id, id, Utc::now()).unwrap();
        let unread = list_notifications(&conn, user.id, true, 10).unwrap();
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].title, "t2");

        let read = get_notification(&conn, user.id, id).unwrap().unwrap();
        assert!(read.is_read);
        assert!(read.read_at.is_some());
    }
}
