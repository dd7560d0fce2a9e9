use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Result, StoreError};
use crate::types::{parse_ts_opt, ts, SpecialistConfigRow, User, UserSettings};

pub fn create_user(conn: &Connection, username: &str, display_name: &str) -> Result<User> {
    let now = ts(Utc::now());
    let normalized = username.trim().to_lowercase();
    conn.execute(
        "INSERT INTO users (username, username_normalized, display_name, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?4)",
        params![username.trim(), normalized, display_name, now],
    )?;
    let id = conn.last_insert_rowid();
    conn.execute(
        "INSERT INTO user_settings (user_id, updated_at) VALUES (?1, ?2)",
        params![id, now],
    )?;
    conn.execute(
        "INSERT INTO specialist_config (user_id, updated_at) VALUES (?1, ?2)",
        params![id, now],
    )?;
    get_user(conn, id)
}

pub fn get_user(conn: &Connection, user_id: i64) -> Result<User> {
    conn.query_row(
        "SELECT id, username, display_name, role, token_version, force_password_change
         FROM users WHERE id = ?1",
        [user_id],
        |row| {
            Ok(User {
                id: row.get(0)?,
                username: row.get(1)?,
                display_name: row.get(2)?,
                role: row.get(3)?,
                token_version: row.get(4)?,
                force_password_change: row.get::<_, i64>(5)? != 0,
            })
        },
    )
    .optional()?
    .ok_or(StoreError::NotFound {
        entity: "user",
        id: user_id,
    })
}

/// Bump token_version — invalidates all outstanding sessions for the user.
pub fn bump_token_version(conn: &Connection, user_id: i64) -> Result<i64> {
    conn.execute(
        "UPDATE users SET token_version = token_version + 1, updated_at = ?2 WHERE id = ?1",
        params![user_id, ts(Utc::now())],
    )?;
    Ok(conn.query_row(
        "SELECT token_version FROM users WHERE id = ?1",
        [user_id],
        |r| r.get(0),
    )?)
}

pub fn get_settings(conn: &Connection, user_id: i64) -> Result<UserSettings> {
    conn.query_row(
        "SELECT user_id, ai_provider, api_key_sealed, reasoning_model, utility_model,
                deep_thinking_model, age, sex, height_cm, current_weight_kg, goal_weight_kg,
                height_unit, weight_unit, hydration_unit, fitness_level, timezone,
                medical_conditions, dietary_preferences, health_goals, family_history,
                medications, supplements, updated_at
         FROM user_settings WHERE user_id = ?1",
        [user_id],
        |row| {
            Ok(UserSettings {
                user_id: row.get(0)?,
                ai_provider: row.get(1)?,
                api_key_sealed: row.get(2)?,
                reasoning_model: row.get(3)?,
                utility_model: row.get(4)?,
                deep_thinking_model: row.get(5)?,
                age: row.get(6)?,
                sex: row.get(7)?,
                height_cm: row.get(8)?,
                current_weight_kg: row.get(9)?,
                goal_weight_kg: row.get(10)?,
                height_unit: row.get(11)?,
                weight_unit: row.get(12)?,
                hydration_unit: row.get(13)?,
                fitness_level: row.get(14)?,
                timezone: row.get(15)?,
                medical_conditions: row.get(16)?,
                dietary_preferences: row.get(17)?,
                health_goals: row.get(18)?,
                family_history: row.get(19)?,
                medications: row.get(20)?,
                supplements: row.get(21)?,
                updated_at: parse_ts_opt(row.get(22)?),
            })
        },
    )
    .optional()?
    .ok_or(StoreError::NotFound {
        entity: "user_settings",
        id: user_id,
    })
}

/// Update one settings column (TEXT affinity). Touches `updated_at` so the
/// stable-context cache key rolls over.
pub fn set_settings_field(
    conn: &Connection,
    user_id: i64,
    field: &str,
    value: Option<&str>,
) -> Result<()> {
    const ALLOWED: &[&str] = &[
        "ai_provider",
        "api_key_sealed",
        "reasoning_model",
        "utility_model",
        "deep_thinking_model",
        "sex",
        "height_unit",
        "weight_unit",
        "hydration_unit",
        "fitness_level",
        "timezone",
        "medical_conditions",
        "dietary_preferences",
        "health_goals",
        "family_history",
        "medications",
        "supplements",
    ];
    if !ALLOWED.contains(&field) {
        return Err(StoreError::Integrity(format!(
            "settings field not writable: {field}"
        )));
    }
    let sql = format!("UPDATE user_settings SET {field} = ?2, updated_at = ?3 WHERE user_id = ?1");
    conn.execute(&sql, params![user_id, value, ts(Utc::now())])?;
    Ok(())
}

pub fn set_settings_number(
    conn: &Connection,
    user_id: i64,
    field: &str,
    value: Option<f64>,
) -> Result<()> {
    const ALLOWED: &[&str] = &["age", "height_cm", "current_weight_kg", "goal_weight_kg"];
    if !ALLOWED.contains(&field) {
        return Err(StoreError::Integrity(format!(
            "settings field not writable: {field}"
        )));
    }
    let sql = format!("UPDATE user_settings SET {field} = ?2, updated_at = ?3 WHERE user_id = ?1");
    conn.execute(&sql, params![user_id, value, ts(Utc::now())])?;
    Ok(())
}

pub fn get_specialist_config(conn: &Connection, user_id: i64) -> Result<SpecialistConfigRow> {
    Ok(conn
        .query_row(
            "SELECT user_id, active_specialist, specialist_overrides, updated_at
             FROM specialist_config WHERE user_id = ?1",
            [user_id],
            |row| {
                Ok(SpecialistConfigRow {
                    user_id: row.get(0)?,
                    active_specialist: row.get(1)?,
                    specialist_overrides: row.get(2)?,
                    updated_at: parse_ts_opt(row.get(3)?),
                })
            },
        )
        .optional()?
        .unwrap_or(SpecialistConfigRow {
            user_id,
            active_specialist: "auto".to_string(),
            specialist_overrides: None,
            updated_at: None,
        }))
}

pub fn set_active_specialist(conn: &Connection, user_id: i64, specialist: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO specialist_config (user_id, active_specialist, updated_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(user_id) DO UPDATE SET active_specialist = ?2, updated_at = ?3",
        params![user_id, specialist, ts(Utc::now())],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[test]
    fn create_seeds_settings_and_specialist_config() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let user = create_user(&conn, "Robin", "Robin").unwrap();
        let settings = get_settings(&conn, user.id).unwrap();
        assert_eq!(settings.ai_provider, "anthropic");
        assert_eq!(settings.weight_unit, "kg");
        let sc = get_specialist_config(&conn, user.id).unwrap();
        assert_eq!(sc.active_specialist, "auto");
    }

    #[test]
    fn settings_updates_touch_updated_at() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let user = create_user(&conn, "a", "A").unwrap();
        let before = get_settings(&conn, user.id).unwrap().updated_at;
        std::thread::sleep(std::time::Duration::from_millis(5));
        set_settings_field(&conn, user.id, "timezone", Some("America/Edmonton")).unwrap();
        let after = get_settings(&conn, user.id).unwrap();
        assert_eq!(after.timezone.as_deref(), Some("America/Edmonton"));
        assert!(after.updated_at > before);
    }

    #[test]
    fn unknown_settings_field_is_rejected() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let user = create_user(&conn, "a", "A").unwrap();
        assert!(set_settings_field(&conn, user.id, "role; DROP TABLE users", Some("x")).is_err());
    }

    #[test]
    fn active_specialist_upserts() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let user = create_user(&conn, "a", "A").unwrap();
        set_active_specialist(&conn, user.id, "sleep_expert").unwrap();
        let sc = get_specialist_config(&conn, user.id).unwrap();
        assert_eq!(sc.active_specialist, "sleep_expert");
        set_active_specialist(&conn, user.id, "auto").unwrap();
        let sc = get_specialist_config(&conn, user.id).unwrap();
        assert_eq!(sc.active_specialist, "auto");
    }

    #[test]
    fn token_version_bumps_monotonically() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let user = create_user(&conn, "a", "A").unwrap();
        assert_eq!(bump_token_version(&conn, user.id).unwrap(), 1);
        assert_eq!(bump_token_version(&conn, user.id).unwrap(), 2);
    }
}
