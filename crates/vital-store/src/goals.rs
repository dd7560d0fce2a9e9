use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Result, StoreError};
use crate::types::{ts, UserGoalRow};

const COLS: &str = "id, user_id, title, description, goal_type, target_value, target_unit,
                    baseline_value, current_value, target_date, status, priority, why, created_by";

fn row_to_goal(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserGoalRow> {
    Ok(UserGoalRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        goal_type: row.get(4)?,
        target_value: row.get(5)?,
        target_unit: row.get(6)?,
        baseline_value: row.get(7)?,
        current_value: row.get(8)?,
        target_date: row.get(9)?,
        status: row.get(10)?,
        priority: row.get(11)?,
        why: row.get(12)?,
        created_by: row.get(13)?,
    })
}

pub struct NewGoal<'a> {
    pub title: &'a str,
    pub description: Option<&'a str>,
    pub goal_type: &'a str,
    pub target_value: Option<f64>,
    pub target_unit: Option<&'a str>,
    pub baseline_value: Option<f64>,
    pub target_date: Option<&'a str>,
    pub priority: i64,
    pub why: Option<&'a str>,
}

pub fn insert_goal(conn: &Connection, user_id: i64, goal: &NewGoal<'_>) -> Result<UserGoalRow> {
    let now = ts(Utc::now());
    conn.execute(
        "INSERT INTO user_goals
         (user_id, title, description, goal_type, target_value, target_unit, baseline_value,
          current_value, target_date, status, priority, why, created_by, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, ?8, 'active', ?9, ?10, 'coach', ?11, ?11)",
        params![
            user_id,
            goal.title,
            goal.description,
            goal.goal_type,
            goal.target_value,
            goal.target_unit,
            goal.baseline_value,
            goal.target_date,
            goal.priority,
            goal.why,
            now,
        ],
    )?;
    let id = conn.last_insert_rowid();
    get_goal(conn, user_id, id)?.ok_or(StoreError::NotFound {
        entity: "user_goal",
        id,
    })
}

pub fn get_goal(conn: &Connection, user_id: i64, id: i64) -> Result<Option<UserGoalRow>> {
    Ok(conn
        .query_row(
            &format!("SELECT {COLS} FROM user_goals WHERE user_id = ?1 AND id = ?2"),
            params![user_id, id],
            row_to_goal,
        )
        .optional()?)
}

pub fn goals_by_status(
    conn: &Connection,
    user_id: i64,
    status: Option<&str>,
) -> Result<Vec<UserGoalRow>> {
    let sql = match status {
        Some(_) => format!(
            "SELECT {COLS} FROM user_goals WHERE user_id = ?1 AND status = ?2
             ORDER BY priority ASC, created_at ASC"
        ),
        None => format!(
            "SELECT {COLS} FROM user_goals WHERE user_id = ?1
             ORDER BY priority ASC, created_at ASC"
        ),
    };
    let mut stmt = conn.prepare(&sql)?;
    let rows = match status {
        Some(s) => stmt.query_map(params![user_id, s], row_to_goal)?,
        None => stmt.query_map(params![user_id], row_to_goal)?,
    };
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub struct GoalPatch<'a> {
    pub title: Option<&'a str>,
    pub description: Option<Option<&'a str>>,
    pub goal_type: Option<&'a str>,
    pub target_value: Option<f64>,
    pub target_unit: Option<Option<&'a str>>,
    pub baseline_value: Option<f64>,
    pub current_value: Option<f64>,
    pub target_date: Option<Option<&'a str>>,
    pub status: Option<&'a str>,
    pub priority: Option<i64>,
    pub why: Option<Option<&'a str>>,
}

impl Default for GoalPatch<'_> {
    fn default() -> Self {
        Self {
            title: None,
            description: None,
            goal_type: None,
            target_value: None,
            target_unit: None,
            baseline_value: None,
            current_value: None,
            target_date: None,
            status: None,
            priority: None,
            why: None,
        }
    }
}

pub fn update_goal(
    conn: &Connection,
    user_id: i64,
    goal_id: i64,
    patch: &GoalPatch<'_>,
) -> Result<UserGoalRow> {
    let existing = get_goal(conn, user_id, goal_id)?.ok_or(StoreError::NotFound {
        entity: "user_goal",
        id: goal_id,
    })?;

    let title = patch.title.unwrap_or(&existing.title);
    let description = match patch.description {
        Some(d) => d.map(str::to_string),
        None => existing.description.clone(),
    };
    let goal_type = patch.goal_type.unwrap_or(&existing.goal_type);
    let target_value = patch.target_value.or(existing.target_value);
    let target_unit = match patch.target_unit {
        Some(u) => u.map(str::to_string),
        None => existing.target_unit.clone(),
    };
    let baseline_value = patch.baseline_value.or(existing.baseline_value);
    let current_value = patch.current_value.or(existing.current_value);
    let target_date = match patch.target_date {
        Some(d) => d.map(str::to_string),
        None => existing.target_date.clone(),
    };
    let status = patch.status.unwrap_or(&existing.status);
    let priority = patch.priority.unwrap_or(existing.priority);
    let why = match patch.why {
        Some(w) => w.map(str::to_string),
        None => existing.why.clone(),
    };

    conn.execute(
        "UPDATE user_goals
         SET title = ?3, description = ?4, goal_type = ?5, target_value = ?6, target_unit = ?7,
             baseline_value = ?8, current_value = ?9, target_date = ?10, status = ?11,
             priority = ?12, why = ?13, updated_at = ?14
         WHERE user_id = ?1 AND id = ?2",
        params![
            user_id,
            goal_id,
            title,
            description,
            goal_type,
            target_value,
            target_unit,
            baseline_value,
            current_value,
            target_date,
            status,
            priority,
            why,
            ts(Utc::now()),
        ],
    )?;
    get_goal(conn, user_id, goal_id)?.ok_or(StoreError::NotFound {
        entity: "user_goal",
        id: goal_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::users::create_user;

    #[test]
    fn insert_starts_active_with_baseline_as_current() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let user = create_user(&conn, "a", "A").unwrap();
        let goal = insert_goal(
            &conn,
            user.id,
            &NewGoal {
                title: "Reach 82 kg",
                description: None,
                goal_type: "weight_loss",
                target_value: Some(82.0),
                target_unit: Some("kg"),
                baseline_value: Some(90.0),
                target_date: Some("2026-06-01"),
                priority: 1,
                why: None,
            },
        )
        .unwrap();
        assert_eq!(goal.status, "active");
        assert_eq!(goal.current_value, Some(90.0));
    }

    #[test]
    fn update_patches_only_supplied_fields() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let user = create_user(&conn, "a", "A").unwrap();
        let goal = insert_goal(
            &conn,
            user.id,
            &NewGoal {
                title: "Walk daily",
                description: None,
                goal_type: "habit",
                target_value: None,
                target_unit: None,
                baseline_value: None,
                target_date: None,
                priority: 3,
                why: None,
            },
        )
        .unwrap();
        let updated = update_goal(
            &conn,
            user.id,
            goal.id,
            &GoalPatch {
                status: Some("paused"),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(updated.status, "paused");
        assert_eq!(updated.title, "Walk daily");
    }
}
