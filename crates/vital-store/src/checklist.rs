use chrono::Utc;
use rusqlite::{params, Connection};

use crate::error::Result;
use crate::types::{ts, ChecklistItemRow};

/// Upsert a checklist completion. The unique index on
/// (user_id, target_date, item_type, item_name) makes repeats idempotent.
pub fn mark_item(
    conn: &Connection,
    user_id: i64,
    target_date: &str,
    item_type: &str,
    item_name: &str,
    completed: bool,
) -> Result<()> {
    let now = ts(Utc::now());
    conn.execute(
        "INSERT INTO daily_checklist_items
         (user_id, target_date, item_type, item_name, completed, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
         ON CONFLICT(user_id, target_date, item_type, item_name)
         DO UPDATE SET completed = ?5, updated_at = ?6",
        params![user_id, target_date, item_type, item_name, completed as i64, now],
    )?;
    Ok(())
}

pub fn items_for_date_range(
    conn: &Connection,
    user_id: i64,
    start_date: &str,
    end_date: &str,
) -> Result<Vec<ChecklistItemRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, user_id, target_date, item_type, item_name, completed
         FROM daily_checklist_items
         WHERE user_id = ?1 AND target_date >= ?2 AND target_date <= ?3
         ORDER BY target_date ASC, item_type ASC, item_name ASC",
    )?;
    let result = stmt
        .query_map(params![user_id, start_date, end_date], |row| {
            Ok(ChecklistItemRow {
                id: row.get(0)?,
                user_id: row.get(1)?,
                target_date: row.get(2)?,
                item_type: row.get(3)?,
                item_name: row.get(4)?,
                completed: row.get::<_, i64>(5)? != 0,
            })
        })?
        .filter_map(|r| r.ok())
        .collect();
    Ok(result)
}

pub fn items_for_date(
    conn: &Connection,
    user_id: i64,
    target_date: &str,
) -> Result<Vec<ChecklistItemRow>> {
    items_for_date_range(conn, user_id, target_date, target_date)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::users::create_user;

    #[test]
    fn repeated_marks_yield_one_row() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let user = create_user(&conn, "a", "A").unwrap();
        for _ in 0..3 {
            mark_item(&conn, user.id, "2026-02-21", "medication", "Candesartan", true).unwrap();
        }
        let items = items_for_date(&conn, user.id, "2026-02-21").unwrap();
        assert_eq!(items.len(), 1);
        assert!(items[0].completed);

        mark_item(&conn, user.id, "2026-02-21", "medication", "Candesartan", false).unwrap();
        let items = items_for_date(&conn, user.id, "2026-02-21").unwrap();
        assert_eq!(items.len(), 1);
        assert!(!items[0].completed);
    }

    #[test]
    fn rows_are_scoped_by_date_and_type() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let user = create_user(&conn, "a", "A").unwrap();
        mark_item(&conn, user.id, "2026-02-21", "medication", "Candesartan", true).unwrap();
        mark_item(&conn, user.id, "2026-02-21", "supplement", "Candesartan", true).unwrap();
        mark_item(&conn, user.id, "2026-02-22", "medication", "Candesartan", true).unwrap();
        let all = items_for_date_range(&conn, user.id, "2026-02-21", "2026-02-22").unwrap();
        assert_eq!(all.len(), 3);
    }
}
