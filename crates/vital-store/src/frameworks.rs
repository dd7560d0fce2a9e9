use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Result, StoreError};
use crate::types::{parse_ts, ts, FrameworkRow};

/// Framework types and their classifier labels, in seed order.
pub const FRAMEWORK_TYPES: &[(&str, &str)] = &[
    ("dietary", "Dietary Strategy"),
    ("training", "Training Protocol"),
    ("metabolic_timing", "Metabolic Timing Strategy"),
    ("micronutrient", "Micronutrient Strategy"),
    ("expert_derived", "Expert-Derived Framework"),
];

/// Default inactive seeds created for every user.
const DEFAULT_SEEDS: &[(&str, &str)] = &[
    ("dietary", "Mediterranean"),
    ("dietary", "DASH"),
    ("training", "Zone 2"),
    ("training", "Strength Progression"),
    ("metabolic_timing", "Time-Restricted Eating"),
    ("micronutrient", "Micronutrient Density Focus"),
];

pub fn classifier_label(framework_type: &str) -> &'static str {
    FRAMEWORK_TYPES
        .iter()
        .find(|(t, _)| *t == framework_type)
        .map(|(_, label)| *label)
        .unwrap_or("Framework")
}

pub fn is_valid_type(framework_type: &str) -> bool {
    FRAMEWORK_TYPES.iter().any(|(t, _)| *t == framework_type)
}

pub fn normalize_framework_name(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

const COLS: &str = "id, user_id, framework_type, classifier_label, name, normalized_name,
                    priority_score, is_active, source, rationale, metadata_json, updated_at";

fn row_to_framework(row: &rusqlite::Row<'_>) -> rusqlite::Result<FrameworkRow> {
    Ok(FrameworkRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        framework_type: row.get(2)?,
        classifier_label: row.get(3)?,
        name: row.get(4)?,
        normalized_name: row.get(5)?,
        priority_score: row.get(6)?,
        is_active: row.get::<_, i64>(7)? != 0,
        source: row.get(8)?,
        rationale: row.get(9)?,
        metadata_json: row.get(10)?,
        updated_at: parse_ts(&row.get::<_, String>(11)?).unwrap_or_else(Utc::now),
    })
}

/// Seed the default framework catalogue for a user (idempotent).
pub fn ensure_default_frameworks(conn: &Connection, user_id: i64) -> Result<()> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM health_frameworks WHERE user_id = ?1",
        [user_id],
        |r| r.get(0),
    )?;
    if count > 0 {
        return Ok(());
    }
    let now = ts(Utc::now());
    for (framework_type, name) in DEFAULT_SEEDS {
        conn.execute(
            "INSERT OR IGNORE INTO health_frameworks
             (user_id, framework_type, classifier_label, name, normalized_name, priority_score,
              is_active, source, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 50, 0, 'seed', ?6, ?6)",
            params![
                user_id,
                framework_type,
                classifier_label(framework_type),
                name,
                normalize_framework_name(name),
                now,
            ],
        )?;
    }
    Ok(())
}

pub fn active_frameworks(conn: &Connection, user_id: i64) -> Result<Vec<FrameworkRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLS} FROM health_frameworks
         WHERE user_id = ?1 AND is_active = 1
         ORDER BY priority_score DESC, name ASC"
    ))?;
    let result = stmt
        .query_map([user_id], row_to_framework)?
        .filter_map(|r| r.ok())
        .collect();
    Ok(result)
}

pub fn get_framework(conn: &Connection, user_id: i64, id: i64) -> Result<Option<FrameworkRow>> {
    Ok(conn
        .query_row(
            &format!("SELECT {COLS} FROM health_frameworks WHERE user_id = ?1 AND id = ?2"),
            params![user_id, id],
            row_to_framework,
        )
        .optional()?)
}

pub fn get_framework_by_name(
    conn: &Connection,
    user_id: i64,
    normalized_name: &str,
) -> Result<Option<FrameworkRow>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {COLS} FROM health_frameworks
                 WHERE user_id = ?1 AND normalized_name = ?2"
            ),
            params![user_id, normalized_name],
            row_to_framework,
        )
        .optional()?)
}

pub fn max_updated_at(conn: &Connection, user_id: i64) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT MAX(updated_at) FROM health_frameworks WHERE user_id = ?1",
            [user_id],
            |r| r.get(0),
        )
        .optional()?
        .flatten())
}

pub struct FrameworkUpsert<'a> {
    pub framework_type: &'a str,
    pub name: &'a str,
    pub priority_score: Option<i64>,
    pub is_active: Option<bool>,
    pub source: &'a str,
    pub rationale: Option<&'a str>,
    pub metadata_json: Option<&'a str>,
}

/// Insert or update by normalized name. Returns (row, created).
pub fn upsert_framework(
    conn: &Connection,
    user_id: i64,
    payload: &FrameworkUpsert<'_>,
) -> Result<(FrameworkRow, bool)> {
    if !is_valid_type(payload.framework_type) {
        return Err(StoreError::Integrity(format!(
            "unknown framework_type: {}",
            payload.framework_type
        )));
    }
    let normalized = normalize_framework_name(payload.name);
    if normalized.is_empty() {
        return Err(StoreError::Integrity("framework name is empty".to_string()));
    }
    let now = ts(Utc::now());
    let existing = get_framework_by_name(conn, user_id, &normalized)?;
    match existing {
        Some(row) => {
            let priority = payload
                .priority_score
                .unwrap_or(row.priority_score)
                .clamp(0, 100);
            let active = payload.is_active.unwrap_or(row.is_active);
            conn.execute(
                "UPDATE health_frameworks
                 SET framework_type = ?2, classifier_label = ?3, name = ?4, priority_score = ?5,
                     is_active = ?6, source = ?7, rationale = COALESCE(?8, rationale),
                     metadata_json = COALESCE(?9, metadata_json), updated_at = ?10
                 WHERE id = ?1",
                params![
                    row.id,
                    payload.framework_type,
                    classifier_label(payload.framework_type),
                    payload.name,
                    priority,
                    active as i64,
                    payload.source,
                    payload.rationale,
                    payload.metadata_json,
                    now,
                ],
            )?;
            let updated = get_framework(conn, user_id, row.id)?.ok_or(StoreError::NotFound {
                entity: "health_framework",
                id: row.id,
            })?;
            Ok((updated, false))
        }
        None => {
            let priority = payload.priority_score.unwrap_or(50).clamp(0, 100);
            let active = payload.is_active.unwrap_or(true);
            conn.execute(
                "INSERT INTO health_frameworks
                 (user_id, framework_type, classifier_label, name, normalized_name,
                  priority_score, is_active, source, rationale, metadata_json,
                  created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
                params![
                    user_id,
                    payload.framework_type,
                    classifier_label(payload.framework_type),
                    payload.name,
                    normalized,
                    priority,
                    active as i64,
                    payload.source,
                    payload.rationale,
                    payload.metadata_json,
                    now,
                ],
            )?;
            let id = conn.last_insert_rowid();
            let row = get_framework(conn, user_id, id)?.ok_or(StoreError::NotFound {
                entity: "health_framework",
                id,
            })?;
            Ok((row, true))
        }
    }
}

pub struct FrameworkUpdate<'a> {
    pub framework_type: Option<&'a str>,
    pub name: Option<&'a str>,
    pub priority_score: Option<i64>,
    pub is_active: Option<bool>,
    pub source: Option<&'a str>,
    pub rationale: Option<&'a str>,
    pub metadata_json: Option<&'a str>,
}

pub fn update_framework(
    conn: &Connection,
    user_id: i64,
    framework_id: i64,
    patch: &FrameworkUpdate<'_>,
) -> Result<FrameworkRow> {
    let existing = get_framework(conn, user_id, framework_id)?.ok_or(StoreError::NotFound {
        entity: "health_framework",
        id: framework_id,
    })?;

    let framework_type = patch.framework_type.unwrap_or(&existing.framework_type);
    if !is_valid_type(framework_type) {
        return Err(StoreError::Integrity(format!(
            "unknown framework_type: {framework_type}"
        )));
    }
    let name = patch.name.unwrap_or(&existing.name);
    let normalized = normalize_framework_name(name);
    let priority = patch
        .priority_score
        .unwrap_or(existing.priority_score)
        .clamp(0, 100);
    let active = patch.is_active.unwrap_or(existing.is_active);
    let source = patch.source.unwrap_or(&existing.source);

    conn.execute(
        "UPDATE health_frameworks
         SET framework_type = ?3, classifier_label = ?4, name = ?5, normalized_name = ?6,
             priority_score = ?7, is_active = ?8, source = ?9,
             rationale = COALESCE(?10, rationale),
             metadata_json = COALESCE(?11, metadata_json), updated_at = ?12
         WHERE user_id = ?1 AND id = ?2",
        params![
            user_id,
            framework_id,
            framework_type,
            classifier_label(framework_type),
            name,
            normalized,
            priority,
            active as i64,
            source,
            patch.rationale,
            patch.metadata_json,
            ts(Utc::now()),
        ],
    )?;
    get_framework(conn, user_id, framework_id)?.ok_or(StoreError::NotFound {
        entity: "health_framework",
        id: framework_id,
    })
}

pub fn delete_framework(conn: &Connection, user_id: i64, framework_id: i64) -> Result<()> {
    let n = conn.execute(
        "DELETE FROM health_frameworks WHERE user_id = ?1 AND id = ?2",
        params![user_id, framework_id],
    )?;
    if n == 0 {
        return Err(StoreError::NotFound {
            entity: "health_framework",
            id: framework_id,
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
    fn seeding_is_idempotent_and_inactive() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let user = create_user(&conn, "a", "A").unwrap();
        ensure_default_frameworks(&conn, user.id).unwrap();
        ensure_default_frameworks(&conn, user.id).unwrap();
        assert!(active_frameworks(&conn, user.id).unwrap().is_empty());
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM health_frameworks WHERE user_id = ?1",
                [user.id],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(count, DEFAULT_SEEDS.len() as i64);
    }

    #[test]
    fn upsert_matches_on_normalized_name() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let user = create_user(&conn, "a", "A").unwrap();
        let (row, created) = upsert_framework(
            &conn,
            user.id,
            &FrameworkUpsert {
                framework_type: "dietary",
                name: "Low-FODMAP",
                priority_score: Some(70),
                is_active: Some(true),
                source: "intake",
                rationale: None,
                metadata_json: None,
            },
        )
        .unwrap();
        assert!(created);
        let (row2, created2) = upsert_framework(
            &conn,
            user.id,
            &FrameworkUpsert {
                framework_type: "dietary",
                name: "low fodmap",
                priority_score: Some(90),
                is_active: None,
                source: "adaptive",
                rationale: Some("GI symptom pattern"),
                metadata_json: None,
            },
        )
        .unwrap();
        assert!(!created2);
        assert_eq!(row.id, row2.id);
        assert_eq!(row2.priority_score, 90);
        assert!(row2.is_active);
    }

    #[test]
    fn invalid_type_is_rejected() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let user = create_user(&conn, "a", "A").unwrap();
        let err = upsert_framework(
            &conn,
            user.id,
            &FrameworkUpsert {
                framework_type: "astrology",
                name: "Star Diet",
                priority_score: None,
                is_active: None,
                source: "user",
                rationale: None,
                metadata_json: None,
            },
        );
        assert!(err.is_err());
    }
}
