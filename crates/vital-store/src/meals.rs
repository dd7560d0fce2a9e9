use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Result, StoreError};
use crate::types::{
    parse_ts, parse_ts_opt, ts, MealResponseSignalRow, MealTemplateRow, MealTemplateVersionRow,
};

const TEMPLATE_COLS: &str = "id, user_id, name, normalized_name, aliases, ingredients, servings,
                             calories, protein_g, carbs_g, fat_g, fiber_g, sodium_mg, notes,
                             is_archived, archived_at, created_at, updated_at";

fn row_to_template(row: &rusqlite::Row<'_>) -> rusqlite::Result<MealTemplateRow> {
    Ok(MealTemplateRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        normalized_name: row.get(3)?,
        aliases: row.get(4)?,
        ingredients: row.get(5)?,
        servings: row.get(6)?,
        calories: row.get(7)?,
        protein_g: row.get(8)?,
        carbs_g: row.get(9)?,
        fat_g: row.get(10)?,
        fiber_g: row.get(11)?,
        sodium_mg: row.get(12)?,
        notes: row.get(13)?,
        is_archived: row.get::<_, i64>(14)? != 0,
        archived_at: parse_ts_opt(row.get(15)?),
        created_at: parse_ts(&row.get::<_, String>(16)?).unwrap_or_else(Utc::now),
        updated_at: parse_ts(&row.get::<_, String>(17)?).unwrap_or_else(Utc::now),
    })
}

pub fn templates_for_user(
    conn: &Connection,
    user_id: i64,
    include_archived: bool,
) -> Result<Vec<MealTemplateRow>> {
    let sql = if include_archived {
        format!(
            "SELECT {TEMPLATE_COLS} FROM meal_templates WHERE user_id = ?1
             ORDER BY updated_at DESC, created_at DESC"
        )
    } else {
        format!(
            "SELECT {TEMPLATE_COLS} FROM meal_templates WHERE user_id = ?1 AND is_archived = 0
             ORDER BY updated_at DESC, created_at DESC"
        )
    };
    let mut stmt = conn.prepare(&sql)?;
    let result = stmt
        .query_map([user_id], row_to_template)?
        .filter_map(|r| r.ok())
        .collect();
    Ok(result)
}

pub fn get_template(conn: &Connection, user_id: i64, id: i64) -> Result<Option<MealTemplateRow>> {
    Ok(conn
        .query_row(
            &format!("SELECT {TEMPLATE_COLS} FROM meal_templates WHERE user_id = ?1 AND id = ?2"),
            params![user_id, id],
            row_to_template,
        )
        .optional()?)
}

pub fn get_template_by_normalized_name(
    conn: &Connection,
    user_id: i64,
    normalized_name: &str,
) -> Result<Option<MealTemplateRow>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {TEMPLATE_COLS} FROM meal_templates
                 WHERE user_id = ?1 AND normalized_name = ?2"
            ),
            params![user_id, normalized_name],
            row_to_template,
        )
        .optional()?)
}

pub struct TemplateUpsert<'a> {
    pub name: &'a str,
    pub normalized_name: &'a str,
    pub aliases_json: Option<&'a str>,
    pub ingredients_json: Option<&'a str>,
    pub servings: f64,
    pub calories: Option<f64>,
    pub protein_g: Option<f64>,
    pub carbs_g: Option<f64>,
    pub fat_g: Option<f64>,
    pub fiber_g: Option<f64>,
    pub sodium_mg: Option<f64>,
    pub notes: Option<&'a str>,
}

/// Insert or fully overwrite by normalized name. Returns (id, created).
/// Upserting un-archives the row.
pub fn upsert_template(
    conn: &Connection,
    user_id: i64,
    payload: &TemplateUpsert<'_>,
) -> Result<(i64, bool)> {
    let now = ts(Utc::now());
    let existing = get_template_by_normalized_name(conn, user_id, payload.normalized_name)?;
    match existing {
        Some(row) => {
            conn.execute(
                "UPDATE meal_templates
                 SET name = ?2, aliases = ?3, ingredients = ?4, servings = ?5, calories = ?6,
                     protein_g = ?7, carbs_g = ?8, fat_g = ?9, fiber_g = ?10, sodium_mg = ?11,
                     notes = ?12, is_archived = 0, archived_at = NULL, updated_at = ?13
                 WHERE id = ?1",
                params![
                    row.id,
                    payload.name,
                    payload.aliases_json,
                    payload.ingredients_json,
                    payload.servings,
                    payload.calories,
                    payload.protein_g,
                    payload.carbs_g,
                    payload.fat_g,
                    payload.fiber_g,
                    payload.sodium_mg,
                    payload.notes,
                    now,
                ],
            )?;
            Ok((row.id, false))
        }
        None => {
            conn.execute(
                "INSERT INTO meal_templates
                 (user_id, name, normalized_name, aliases, ingredients, servings, calories,
                  protein_g, carbs_g, fat_g, fiber_g, sodium_mg, notes, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)",
                params![
                    user_id,
                    payload.name,
                    payload.normalized_name,
                    payload.aliases_json,
                    payload.ingredients_json,
                    payload.servings,
                    payload.calories,
                    payload.protein_g,
                    payload.carbs_g,
                    payload.fat_g,
                    payload.fiber_g,
                    payload.sodium_mg,
                    payload.notes,
                    now,
                ],
            )?;
            Ok((conn.last_insert_rowid(), true))
        }
    }
}

pub fn set_template_archived(
    conn: &Connection,
    user_id: i64,
    template_id: i64,
    archived: bool,
) -> Result<()> {
    let now = ts(Utc::now());
    let archived_at = archived.then(|| now.clone());
    let n = conn.execute(
        "UPDATE meal_templates SET is_archived = ?3, archived_at = ?4, updated_at = ?5
         WHERE user_id = ?1 AND id = ?2",
        params![user_id, template_id, archived as i64, archived_at, now],
    )?;
    if n == 0 {
        return Err(StoreError::NotFound {
            entity: "meal_template",
            id: template_id,
        });
    }
    Ok(())
}

/// Delete a template, detaching dependent rows first.
pub fn delete_template(conn: &Connection, user_id: i64, template_id: i64) -> Result<()> {
    conn.execute(
        "DELETE FROM meal_template_versions WHERE meal_template_id = ?1",
        [template_id],
    )?;
    conn.execute(
        "UPDATE meal_response_signals SET meal_template_id = NULL WHERE meal_template_id = ?1",
        [template_id],
    )?;
    conn.execute(
        "UPDATE food_log SET meal_template_id = NULL WHERE meal_template_id = ?1",
        [template_id],
    )?;
    let n = conn.execute(
        "DELETE FROM meal_templates WHERE user_id = ?1 AND id = ?2",
        params![user_id, template_id],
    )?;
    if n == 0 {
        return Err(StoreError::NotFound {
            entity: "meal_template",
            id: template_id,
        });
    }
    Ok(())
}

pub fn insert_template_version(
    conn: &Connection,
    user_id: i64,
    template_id: i64,
    snapshot_json: &str,
    change_note: Option<&str>,
) -> Result<i64> {
    let next: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version_number), 0) + 1 FROM meal_template_versions
         WHERE meal_template_id = ?1",
        [template_id],
        |r| r.get(0),
    )?;
    conn.execute(
        "INSERT INTO meal_template_versions
         (user_id, meal_template_id, version_number, snapshot_json, change_note, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            user_id,
            template_id,
            next,
            snapshot_json,
            change_note,
            ts(Utc::now())
        ],
    )?;
    Ok(next)
}

pub fn template_versions(
    conn: &Connection,
    user_id: i64,
    template_id: i64,
) -> Result<Vec<MealTemplateVersionRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, meal_template_id, version_number, snapshot_json, change_note, created_at
         FROM meal_template_versions
         WHERE user_id = ?1 AND meal_template_id = ?2
         ORDER BY version_number DESC",
    )?;
    let result = stmt
        .query_map(params![user_id, template_id], |row| {
            Ok(MealTemplateVersionRow {
                id: row.get(0)?,
                meal_template_id: row.get(1)?,
                version_number: row.get(2)?,
                snapshot_json: row.get(3)?,
                change_note: row.get(4)?,
                created_at: parse_ts(&row.get::<_, String>(5)?).unwrap_or_else(Utc::now),
            })
        })?
        .filter_map(|r| r.ok())
        .collect();
    Ok(result)
}

pub fn template_usage(
    conn: &Connection,
    user_id: i64,
    template_id: i64,
) -> Result<(i64, Option<DateTime<Utc>>)> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM food_log WHERE user_id = ?1 AND meal_template_id = ?2",
        params![user_id, template_id],
        |r| r.get(0),
    )?;
    let last: Option<String> = conn
        .query_row(
            "SELECT MAX(logged_at) FROM food_log WHERE user_id = ?1 AND meal_template_id = ?2",
            params![user_id, template_id],
            |r| r.get(0),
        )
        .optional()?
        .flatten();
    Ok((count, last.as_deref().and_then(parse_ts)))
}

// ---------------------------------------------------------------------------
// Meal response signals
// ---------------------------------------------------------------------------

pub struct NewMealSignal<'a> {
    pub user_id: i64,
    pub meal_template_id: Option<i64>,
    pub food_log_id: Option<i64>,
    pub source_message_id: Option<i64>,
    pub energy_level: Option<i64>,
    pub gi_symptom_tags_json: Option<&'a str>,
    pub gi_severity: Option<i64>,
    pub notes: Option<&'a str>,
}

pub fn insert_meal_signal(conn: &Connection, signal: &NewMealSignal<'_>) -> Result<i64> {
    conn.execute(
        "INSERT INTO meal_response_signals
         (user_id, meal_template_id, food_log_id, source_message_id, energy_level,
          gi_symptom_tags, gi_severity, notes, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            signal.user_id,
            signal.meal_template_id,
            signal.food_log_id,
            signal.source_message_id,
            signal.energy_level,
            signal.gi_symptom_tags_json,
            signal.gi_severity,
            signal.notes,
            ts(Utc::now()),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn meal_signals_since(
    conn: &Connection,
    user_id: i64,
    since: DateTime<Utc>,
) -> Result<Vec<MealResponseSignalRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, user_id, meal_template_id, food_log_id, source_message_id, energy_level,
                gi_symptom_tags, gi_severity, notes, created_at
         FROM meal_response_signals
         WHERE user_id = ?1 AND created_at >= ?2 AND meal_template_id IS NOT NULL
         ORDER BY created_at ASC",
    )?;
    let result = stmt
        .query_map(params![user_id, ts(since)], |row| {
            Ok(MealResponseSignalRow {
                id: row.get(0)?,
                user_id: row.get(1)?,
                meal_template_id: row.get(2)?,
                food_log_id: row.get(3)?,
                source_message_id: row.get(4)?,
                energy_level: row.get(5)?,
                gi_symptom_tags: row.get(6)?,
                gi_severity: row.get(7)?,
                notes: row.get(8)?,
                created_at: parse_ts(&row.get::<_, String>(9)?).unwrap_or_else(Utc::now),
            })
        })?
        .filter_map(|r| r.ok())
        .collect();
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::users::create_user;

    fn sample_upsert<'a>() -> TemplateUpsert<'a> {
        TemplateUpsert {
            name: "Power Pancakes",
            normalized_name: "power pancakes",
            aliases_json: None,
            ingredients_json: Some(r#"["oats","eggs","banana"]"#),
            servings: 2.0,
            calories: Some(520.0),
            protein_g: Some(32.0),
            carbs_g: Some(60.0),
            fat_g: Some(14.0),
            fiber_g: Some(8.0),
            sodium_mg: Some(300.0),
            notes: None,
        }
    }

    #[test]
    fn upsert_creates_then_updates_by_normalized_name() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let user = create_user(&conn, "a", "A").unwrap();
        let (id, created) = upsert_template(&conn, user.id, &sample_upsert()).unwrap();
        assert!(created);
        let mut again = sample_upsert();
        again.calories = Some(600.0);
        let (id2, created2) = upsert_template(&conn, user.id, &again).unwrap();
        assert_eq!(id, id2);
        assert!(!created2);
        let row = get_template(&conn, user.id, id).unwrap().unwrap();
        assert_eq!(row.calories, Some(600.0));
    }

    #[test]
    fn version_numbers_increment() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let user = create_user(&conn, "a", "A").unwrap();
        let (id, _) = upsert_template(&conn, user.id, &sample_upsert()).unwrap();
        assert_eq!(insert_template_version(&conn, user.id, id, "{}", None).unwrap(), 1);
        assert_eq!(
            insert_template_version(&conn, user.id, id, "{}", Some("edit")).unwrap(),
            2
        );
        let versions = template_versions(&conn, user.id, id).unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].version_number, 2);
    }

    #[test]
    fn delete_detaches_food_logs() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let user = create_user(&conn, "a", "A").unwrap();
        let (id, _) = upsert_template(&conn, user.id, &sample_upsert()).unwrap();
        crate::logs::insert_food_log(
            &conn,
            &crate::logs::NewFoodLog {
                user_id: user.id,
                meal_template_id: Some(id),
                logged_at: Utc::now(),
                meal_label: Some("Breakfast"),
                items_json: r#"[{"name":"power pancakes"}]"#,
                calories: Some(520.0),
                protein_g: None,
                carbs_g: None,
                fat_g: None,
                fiber_g: None,
                sodium_mg: None,
                notes: None,
            },
        )
        .unwrap();
        delete_template(&conn, user.id, id).unwrap();
        let latest = crate::logs::latest_food_log(&conn, user.id, 24).unwrap().unwrap();
        assert_eq!(latest.meal_template_id, None);
    }
}
