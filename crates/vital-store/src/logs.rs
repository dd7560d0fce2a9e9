use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use crate::error::{Result, StoreError};
use crate::types::{
    parse_ts, parse_ts_opt, ts, ExerciseLogRow, ExercisePlanRow, FastingLogRow, FoodLogRow,
    HydrationLogRow, SleepLogRow, SupplementLogRow, VitalsLogRow,
};

/// Open fasts older than this are forcibly closed on read.
const MAX_OPEN_FAST_HOURS: i64 = 36;

// ---------------------------------------------------------------------------
// Food
// ---------------------------------------------------------------------------

pub struct NewFoodLog<'a> {
    pub user_id: i64,
    pub meal_template_id: Option<i64>,
    pub logged_at: DateTime<Utc>,
    pub meal_label: Option<&'a str>,
    pub items_json: &'a str,
    pub calories: Option<f64>,
    pub protein_g: Option<f64>,
    pub carbs_g: Option<f64>,
    pub fat_g: Option<f64>,
    pub fiber_g: Option<f64>,
    pub sodium_mg: Option<f64>,
    pub notes: Option<&'a str>,
}

pub fn insert_food_log(conn: &Connection, log: &NewFoodLog<'_>) -> Result<i64> {
    conn.execute(
        "INSERT INTO food_log
         (user_id, meal_template_id, logged_at, meal_label, items, calories, protein_g,
          carbs_g, fat_g, fiber_g, sodium_mg, notes, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            log.user_id,
            log.meal_template_id,
            ts(log.logged_at),
            log.meal_label,
            log.items_json,
            log.calories,
            log.protein_g,
            log.carbs_g,
            log.fat_g,
            log.fiber_g,
            log.sodium_mg,
            log.notes,
            ts(Utc::now()),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn row_to_food(row: &rusqlite::Row<'_>) -> rusqlite::Result<FoodLogRow> {
    Ok(FoodLogRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        meal_template_id: row.get(2)?,
        logged_at: parse_ts(&row.get::<_, String>(3)?).unwrap_or_else(Utc::now),
        meal_label: row.get(4)?,
        items: row.get(5)?,
        calories: row.get(6)?,
        protein_g: row.get(7)?,
        carbs_g: row.get(8)?,
        fat_g: row.get(9)?,
        fiber_g: row.get(10)?,
        sodium_mg: row.get(11)?,
        notes: row.get(12)?,
    })
}

const FOOD_COLS: &str = "id, user_id, meal_template_id, logged_at, meal_label, items, calories,
                         protein_g, carbs_g, fat_g, fiber_g, sodium_mg, notes";

pub fn food_logs_between(
    conn: &Connection,
    user_id: i64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<FoodLogRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {FOOD_COLS} FROM food_log
         WHERE user_id = ?1 AND logged_at >= ?2 AND logged_at <= ?3
         ORDER BY logged_at ASC"
    ))?;
    let result = stmt
        .query_map(params![user_id, ts(start), ts(end)], row_to_food)?
        .filter_map(|r| r.ok())
        .collect();
    Ok(result)
}

pub fn latest_food_log(
    conn: &Connection,
    user_id: i64,
    lookback_hours: i64,
) -> Result<Option<FoodLogRow>> {
    let cutoff = Utc::now() - Duration::hours(lookback_hours.max(1));
    Ok(conn
        .query_row(
            &format!(
                "SELECT {FOOD_COLS} FROM food_log
                 WHERE user_id = ?1 AND logged_at >= ?2
                 ORDER BY logged_at DESC, id DESC LIMIT 1"
            ),
            params![user_id, ts(cutoff)],
            row_to_food,
        )
        .optional()?)
}

pub fn get_food_log(conn: &Connection, user_id: i64, id: i64) -> Result<Option<FoodLogRow>> {
    Ok(conn
        .query_row(
            &format!("SELECT {FOOD_COLS} FROM food_log WHERE user_id = ?1 AND id = ?2"),
            params![user_id, id],
            row_to_food,
        )
        .optional()?)
}

pub fn latest_food_log_for_template(
    conn: &Connection,
    user_id: i64,
    template_id: i64,
) -> Result<Option<FoodLogRow>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {FOOD_COLS} FROM food_log
                 WHERE user_id = ?1 AND meal_template_id = ?2
                 ORDER BY logged_at DESC, id DESC LIMIT 1"
            ),
            params![user_id, template_id],
            row_to_food,
        )
        .optional()?)
}

pub fn latest_template_food_log_since(
    conn: &Connection,
    user_id: i64,
    since: DateTime<Utc>,
) -> Result<Option<FoodLogRow>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {FOOD_COLS} FROM food_log
                 WHERE user_id = ?1 AND meal_template_id IS NOT NULL AND logged_at >= ?2
                 ORDER BY logged_at DESC, id DESC LIMIT 1"
            ),
            params![user_id, ts(since)],
            row_to_food,
        )
        .optional()?)
}

// ---------------------------------------------------------------------------
// Hydration / vitals / exercise / supplements
// ---------------------------------------------------------------------------

pub fn insert_hydration_log(
    conn: &Connection,
    user_id: i64,
    logged_at: DateTime<Utc>,
    amount_ml: f64,
    source: Option<&str>,
    notes: Option<&str>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO hydration_log (user_id, logged_at, amount_ml, source, notes, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![user_id, ts(logged_at), amount_ml, source, notes, ts(Utc::now())],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn hydration_logs_between(
    conn: &Connection,
    user_id: i64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<HydrationLogRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, user_id, logged_at, amount_ml, source, notes FROM hydration_log
         WHERE user_id = ?1 AND logged_at >= ?2 AND logged_at <= ?3
         ORDER BY logged_at ASC",
    )?;
    let result = stmt
        .query_map(params![user_id, ts(start), ts(end)], |row| {
            Ok(HydrationLogRow {
                id: row.get(0)?,
                user_id: row.get(1)?,
                logged_at: parse_ts(&row.get::<_, String>(2)?).unwrap_or_else(Utc::now),
                amount_ml: row.get(3)?,
                source: row.get(4)?,
                notes: row.get(5)?,
            })
        })?
        .filter_map(|r| r.ok())
        .collect();
    Ok(result)
}

pub struct NewVitalsLog<'a> {
    pub user_id: i64,
    pub logged_at: DateTime<Utc>,
    pub weight_kg: Option<f64>,
    pub bp_systolic: Option<i64>,
    pub bp_diastolic: Option<i64>,
    pub heart_rate: Option<i64>,
    pub blood_glucose: Option<f64>,
    pub temperature_c: Option<f64>,
    pub spo2: Option<f64>,
    pub notes: Option<&'a str>,
}

pub fn insert_vitals_log(conn: &Connection, log: &NewVitalsLog<'_>) -> Result<i64> {
    conn.execute(
        "INSERT INTO vitals_log
         (user_id, logged_at, weight_kg, bp_systolic, bp_diastolic, heart_rate,
          blood_glucose, temperature_c, spo2, notes, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            log.user_id,
            ts(log.logged_at),
            log.weight_kg,
            log.bp_systolic,
            log.bp_diastolic,
            log.heart_rate,
            log.blood_glucose,
            log.temperature_c,
            log.spo2,
            log.notes,
            ts(Utc::now()),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn row_to_vitals(row: &rusqlite::Row<'_>) -> rusqlite::Result<VitalsLogRow> {
    Ok(VitalsLogRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        logged_at: parse_ts(&row.get::<_, String>(2)?).unwrap_or_else(Utc::now),
        weight_kg: row.get(3)?,
        bp_systolic: row.get(4)?,
        bp_diastolic: row.get(5)?,
        heart_rate: row.get(6)?,
        blood_glucose: row.get(7)?,
        temperature_c: row.get(8)?,
        spo2: row.get(9)?,
        notes: row.get(10)?,
    })
}

const VITALS_COLS: &str = "id, user_id, logged_at, weight_kg, bp_systolic, bp_diastolic,
                           heart_rate, blood_glucose, temperature_c, spo2, notes";

pub fn vitals_logs_between(
    conn: &Connection,
    user_id: i64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<VitalsLogRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {VITALS_COLS} FROM vitals_log
         WHERE user_id = ?1 AND logged_at >= ?2 AND logged_at <= ?3
         ORDER BY logged_at ASC"
    ))?;
    let result = stmt
        .query_map(params![user_id, ts(start), ts(end)], row_to_vitals)?
        .filter_map(|r| r.ok())
        .collect();
    Ok(result)
}

pub fn latest_vitals_between(
    conn: &Connection,
    user_id: i64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Option<VitalsLogRow>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {VITALS_COLS} FROM vitals_log
                 WHERE user_id = ?1 AND logged_at >= ?2 AND logged_at <= ?3
                 ORDER BY logged_at DESC, id DESC LIMIT 1"
            ),
            params![user_id, ts(start), ts(end)],
            row_to_vitals,
        )
        .optional()?)
}

pub fn insert_exercise_log(
    conn: &Connection,
    user_id: i64,
    logged_at: DateTime<Utc>,
    exercise_type: &str,
    duration_minutes: Option<i64>,
    details_json: Option<&str>,
    max_hr: Option<i64>,
    avg_hr: Option<i64>,
    calories_burned: Option<f64>,
    notes: Option<&str>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO exercise_log
         (user_id, logged_at, exercise_type, duration_minutes, details, max_hr, avg_hr,
          calories_burned, notes, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            user_id,
            ts(logged_at),
            exercise_type,
            duration_minutes,
            details_json,
            max_hr,
            avg_hr,
            calories_burned,
            notes,
            ts(Utc::now()),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn exercise_logs_between(
    conn: &Connection,
    user_id: i64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<ExerciseLogRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, user_id, logged_at, exercise_type, duration_minutes, details, max_hr,
                avg_hr, calories_burned, notes
         FROM exercise_log
         WHERE user_id = ?1 AND logged_at >= ?2 AND logged_at <= ?3
         ORDER BY logged_at ASC",
    )?;
    let result = stmt
        .query_map(params![user_id, ts(start), ts(end)], |row| {
            Ok(ExerciseLogRow {
                id: row.get(0)?,
                user_id: row.get(1)?,
                logged_at: parse_ts(&row.get::<_, String>(2)?).unwrap_or_else(Utc::now),
                exercise_type: row.get(3)?,
                duration_minutes: row.get(4)?,
                details: row.get(5)?,
                max_hr: row.get(6)?,
                avg_hr: row.get(7)?,
                calories_burned: row.get(8)?,
                notes: row.get(9)?,
            })
        })?
        .filter_map(|r| r.ok())
        .collect();
    Ok(result)
}

pub fn insert_supplement_log(
    conn: &Connection,
    user_id: i64,
    logged_at: DateTime<Utc>,
    supplements_json: &str,
    timing: Option<&str>,
    notes: Option<&str>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO supplement_log
         (user_id, logged_at, supplements, timing, notes, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            user_id,
            ts(logged_at),
            supplements_json,
            timing,
            notes,
            ts(Utc::now()),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn supplement_logs_between(
    conn: &Connection,
    user_id: i64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<SupplementLogRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, user_id, logged_at, supplements, timing, notes FROM supplement_log
         WHERE user_id = ?1 AND logged_at >= ?2 AND logged_at <= ?3
         ORDER BY logged_at ASC",
    )?;
    let result = stmt
        .query_map(params![user_id, ts(start), ts(end)], |row| {
            Ok(SupplementLogRow {
                id: row.get(0)?,
                user_id: row.get(1)?,
                logged_at: parse_ts(&row.get::<_, String>(2)?).unwrap_or_else(Utc::now),
                supplements: row.get(3)?,
                timing: row.get(4)?,
                notes: row.get(5)?,
            })
        })?
        .filter_map(|r| r.ok())
        .collect();
    Ok(result)
}

// ---------------------------------------------------------------------------
// Fasting
// ---------------------------------------------------------------------------

fn row_to_fast(row: &rusqlite::Row<'_>) -> rusqlite::Result<FastingLogRow> {
    Ok(FastingLogRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        fast_start: parse_ts(&row.get::<_, String>(2)?).unwrap_or_else(Utc::now),
        fast_end: parse_ts_opt(row.get(3)?),
        duration_minutes: row.get(4)?,
        fast_type: row.get(5)?,
        notes: row.get(6)?,
    })
}

const FAST_COLS: &str = "id, user_id, fast_start, fast_end, duration_minutes, fast_type, notes";

pub fn insert_fasting_start(
    conn: &Connection,
    user_id: i64,
    fast_start: DateTime<Utc>,
    fast_type: Option<&str>,
    notes: Option<&str>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO fasting_log (user_id, fast_start, fast_type, notes, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![user_id, ts(fast_start), fast_type, notes, ts(Utc::now())],
    )?;
    Ok(conn.last_insert_rowid())
}

/// The single open fast, if any. Stale fasts (> 36h) are force-closed with
/// `fast_end = fast_start + 36h` before the lookup returns.
pub fn active_fast(conn: &Connection, user_id: i64) -> Result<Option<FastingLogRow>> {
    close_stale_fasts(conn, user_id)?;
    Ok(conn
        .query_row(
            &format!(
                "SELECT {FAST_COLS} FROM fasting_log
                 WHERE user_id = ?1 AND fast_end IS NULL
                 ORDER BY fast_start DESC, id DESC LIMIT 1"
            ),
            [user_id],
            row_to_fast,
        )
        .optional()?)
}

fn close_stale_fasts(conn: &Connection, user_id: i64) -> Result<()> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {FAST_COLS} FROM fasting_log WHERE user_id = ?1 AND fast_end IS NULL"
    ))?;
    let open: Vec<FastingLogRow> = stmt
        .query_map([user_id], row_to_fast)?
        .filter_map(|r| r.ok())
        .collect();

    let now = Utc::now();
    for fast in open {
        if now - fast.fast_start > Duration::hours(MAX_OPEN_FAST_HOURS) {
            let forced_end = fast.fast_start + Duration::hours(MAX_OPEN_FAST_HOURS);
            warn!(fast_id = fast.id, user_id, "auto-closing stale fast");
            conn.execute(
                "UPDATE fasting_log SET fast_end = ?2, duration_minutes = ?3 WHERE id = ?1",
                params![fast.id, ts(forced_end), MAX_OPEN_FAST_HOURS * 60],
            )?;
        }
    }
    Ok(())
}

pub fn close_fast(
    conn: &Connection,
    user_id: i64,
    fast_id: i64,
    fast_end: DateTime<Utc>,
) -> Result<FastingLogRow> {
    let fast = conn
        .query_row(
            &format!("SELECT {FAST_COLS} FROM fasting_log WHERE user_id = ?1 AND id = ?2"),
            params![user_id, fast_id],
            row_to_fast,
        )
        .optional()?
        .ok_or(StoreError::NotFound {
            entity: "fasting_log",
            id: fast_id,
        })?;
    let minutes = ((fast_end - fast.fast_start).num_seconds() / 60).max(0);
    conn.execute(
        "UPDATE fasting_log SET fast_end = ?2, duration_minutes = ?3 WHERE id = ?1",
        params![fast_id, ts(fast_end), minutes],
    )?;
    conn.query_row(
        &format!("SELECT {FAST_COLS} FROM fasting_log WHERE id = ?1"),
        [fast_id],
        row_to_fast,
    )
    .map_err(Into::into)
}

pub fn open_fast_count(conn: &Connection, user_id: i64) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM fasting_log WHERE user_id = ?1 AND fast_end IS NULL",
        [user_id],
        |r| r.get(0),
    )?)
}

pub fn fasting_logs_started_between(
    conn: &Connection,
    user_id: i64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<FastingLogRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {FAST_COLS} FROM fasting_log
         WHERE user_id = ?1 AND fast_start >= ?2 AND fast_start <= ?3
         ORDER BY fast_start ASC"
    ))?;
    let result = stmt
        .query_map(params![user_id, ts(start), ts(end)], row_to_fast)?
        .filter_map(|r| r.ok())
        .collect();
    Ok(result)
}

// ---------------------------------------------------------------------------
// Sleep
// ---------------------------------------------------------------------------

fn row_to_sleep(row: &rusqlite::Row<'_>) -> rusqlite::Result<SleepLogRow> {
    Ok(SleepLogRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        sleep_start: parse_ts_opt(row.get(2)?),
        sleep_end: parse_ts_opt(row.get(3)?),
        duration_minutes: row.get(4)?,
        quality: row.get(5)?,
        notes: row.get(6)?,
        created_at: parse_ts(&row.get::<_, String>(7)?).unwrap_or_else(Utc::now),
    })
}

const SLEEP_COLS: &str =
    "id, user_id, sleep_start, sleep_end, duration_minutes, quality, notes, created_at";

pub fn insert_sleep_log(
    conn: &Connection,
    user_id: i64,
    sleep_start: Option<DateTime<Utc>>,
    sleep_end: Option<DateTime<Utc>>,
    duration_minutes: Option<i64>,
    quality: Option<&str>,
    notes: Option<&str>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO sleep_log
         (user_id, sleep_start, sleep_end, duration_minutes, quality, notes, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            user_id,
            sleep_start.map(ts),
            sleep_end.map(ts),
            duration_minutes,
            quality,
            notes,
            ts(Utc::now()),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Sleep rows overlapping a window: a row matches when its end, start, or
/// creation stamp falls inside the window (midnight-crossing nights count for
/// the morning's day).
pub fn sleep_logs_overlapping(
    conn: &Connection,
    user_id: i64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<SleepLogRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SLEEP_COLS} FROM sleep_log
         WHERE user_id = ?1 AND (
             (sleep_end IS NOT NULL AND sleep_end >= ?2 AND sleep_end <= ?3)
             OR (sleep_start IS NOT NULL AND sleep_start >= ?2 AND sleep_start <= ?3)
             OR (sleep_start IS NULL AND sleep_end IS NULL
                 AND created_at >= ?2 AND created_at <= ?3)
         )
         ORDER BY created_at DESC, id DESC"
    ))?;
    let result = stmt
        .query_map(params![user_id, ts(start), ts(end)], row_to_sleep)?
        .filter_map(|r| r.ok())
        .collect();
    Ok(result)
}

// ---------------------------------------------------------------------------
// Time correction — rewrite a prior row's event field.
// ---------------------------------------------------------------------------

/// Overwrite one time field on a log row and recompute derived durations.
/// The (table, field) pair is constrained to the known correction targets.
pub fn apply_time_correction(
    conn: &Connection,
    user_id: i64,
    table: &str,
    row_id: i64,
    field: &str,
    corrected: DateTime<Utc>,
) -> Result<bool> {
    let allowed: &[(&str, &[&str])] = &[
        ("food_log", &["logged_at"]),
        ("vitals_log", &["logged_at"]),
        ("exercise_log", &["logged_at"]),
        ("hydration_log", &["logged_at"]),
        ("supplement_log", &["logged_at"]),
        ("fasting_log", &["fast_start", "fast_end"]),
        ("sleep_log", &["sleep_start", "sleep_end"]),
    ];
    let Some((_, fields)) = allowed.iter().find(|(t, _)| *t == table) else {
        return Ok(false);
    };
    if !fields.contains(&field) {
        return Ok(false);
    }

    let n = conn.execute(
        &format!("UPDATE {table} SET {field} = ?3 WHERE id = ?1 AND user_id = ?2"),
        params![row_id, user_id, ts(corrected)],
    )?;
    if n == 0 {
        return Ok(false);
    }

    // Recompute duration_minutes when both ends of a span are known.
    if table == "sleep_log" {
        conn.execute(
            "UPDATE sleep_log
             SET duration_minutes = MAX(0,
                 CAST(ROUND((julianday(sleep_end) - julianday(sleep_start)) * 1440) AS INTEGER))
             WHERE id = ?1 AND sleep_start IS NOT NULL AND sleep_end IS NOT NULL",
            [row_id],
        )?;
    }
    if table == "fasting_log" {
        conn.execute(
            "UPDATE fasting_log
             SET duration_minutes = MAX(0,
                 CAST(ROUND((julianday(fast_end) - julianday(fast_start)) * 1440) AS INTEGER))
             WHERE id = ?1 AND fast_start IS NOT NULL AND fast_end IS NOT NULL",
            [row_id],
        )?;
    }
    Ok(true)
}

// ---------------------------------------------------------------------------
// Exercise plans
// ---------------------------------------------------------------------------

pub fn upsert_exercise_plan(
    conn: &Connection,
    user_id: i64,
    target_date: &str,
    plan_type: &str,
    title: &str,
    description: Option<&str>,
    target_minutes: Option<i64>,
    source: &str,
) -> Result<(i64, bool)> {
    let now = ts(Utc::now());
    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM exercise_plans WHERE user_id = ?1 AND target_date = ?2",
            params![user_id, target_date],
            |r| r.get(0),
        )
        .optional()?;
    match existing {
        Some(id) => {
            conn.execute(
                "UPDATE exercise_plans
                 SET plan_type = ?2, title = ?3, description = ?4, target_minutes = ?5,
                     source = ?6, updated_at = ?7
                 WHERE id = ?1",
                params![id, plan_type, title, description, target_minutes, source, now],
            )?;
            Ok((id, false))
        }
        None => {
            conn.execute(
                "INSERT INTO exercise_plans
                 (user_id, target_date, plan_type, title, description, target_minutes,
                  source, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    user_id,
                    target_date,
                    plan_type,
                    title,
                    description,
                    target_minutes,
                    source,
                    now
                ],
            )?;
            Ok((conn.last_insert_rowid(), true))
        }
    }
}

pub fn exercise_plan_for_date(
    conn: &Connection,
    user_id: i64,
    target_date: &str,
) -> Result<Option<ExercisePlanRow>> {
    Ok(conn
        .query_row(
            "SELECT id, user_id, target_date, plan_type, title, description, target_minutes, source
             FROM exercise_plans WHERE user_id = ?1 AND target_date = ?2",
            params![user_id, target_date],
            |row| {
                Ok(ExercisePlanRow {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    target_date: row.get(2)?,
                    plan_type: row.get(3)?,
                    title: row.get(4)?,
                    description: row.get(5)?,
                    target_minutes: row.get(6)?,
                    source: row.get(7)?,
                })
            },
        )
        .optional()?)
}
