use rusqlite::Connection;

use crate::error::Result;

/// Initialise all tables. Safe to call on every startup (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    create_user_tables(conn)?;
    create_message_tables(conn)?;
    create_log_tables(conn)?;
    create_meal_tables(conn)?;
    create_checklist_table(conn)?;
    create_notification_table(conn)?;
    create_goal_table(conn)?;
    create_framework_table(conn)?;
    create_analysis_tables(conn)?;
    create_feedback_table(conn)?;
    create_summary_table(conn)?;
    create_websearch_cache_table(conn)?;
    create_telemetry_tables(conn)?;
    Ok(())
}

fn create_user_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS users (
            id                    INTEGER PRIMARY KEY AUTOINCREMENT,
            username              TEXT NOT NULL UNIQUE,
            username_normalized   TEXT NOT NULL UNIQUE,
            display_name          TEXT NOT NULL,
            role                  TEXT NOT NULL DEFAULT 'user',
            token_version         INTEGER NOT NULL DEFAULT 0,
            force_password_change INTEGER NOT NULL DEFAULT 0,
            created_at            TEXT NOT NULL,
            updated_at            TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS user_settings (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id             INTEGER NOT NULL UNIQUE REFERENCES users(id),
            ai_provider         TEXT NOT NULL DEFAULT 'anthropic',
            api_key_sealed      TEXT,
            reasoning_model     TEXT,
            utility_model       TEXT,
            deep_thinking_model TEXT,
            age                 INTEGER,
            sex                 TEXT,
            height_cm           REAL,
            current_weight_kg   REAL,
            goal_weight_kg      REAL,
            height_unit         TEXT NOT NULL DEFAULT 'cm',
            weight_unit         TEXT NOT NULL DEFAULT 'kg',
            hydration_unit      TEXT NOT NULL DEFAULT 'ml',
            fitness_level       TEXT,
            timezone            TEXT,
            medical_conditions  TEXT,
            dietary_preferences TEXT,
            health_goals        TEXT,
            family_history      TEXT,
            medications         TEXT,
            supplements         TEXT,
            usage_reset_at      TEXT,
            intake_completed_at TEXT,
            intake_skipped_at   TEXT,
            updated_at          TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS specialist_config (
            id                   INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id              INTEGER NOT NULL UNIQUE REFERENCES users(id),
            active_specialist    TEXT NOT NULL DEFAULT 'auto',
            specialist_overrides TEXT,
            updated_at           TEXT NOT NULL
        );",
    )?;
    Ok(())
}

fn create_message_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS messages (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id         INTEGER NOT NULL REFERENCES users(id),
            role            TEXT NOT NULL,
            content         TEXT NOT NULL,
            specialist_used TEXT,
            model_used      TEXT,
            tokens_in       INTEGER,
            tokens_out      INTEGER,
            has_image       INTEGER NOT NULL DEFAULT 0,
            created_at      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_messages_user
            ON messages(user_id, created_at DESC);
        CREATE TABLE IF NOT EXISTS model_usage_events (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id    INTEGER NOT NULL REFERENCES users(id),
            usage_type TEXT NOT NULL DEFAULT 'utility',
            operation  TEXT,
            model_used TEXT NOT NULL,
            tokens_in  INTEGER NOT NULL DEFAULT 0,
            tokens_out INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );",
    )?;
    Ok(())
}

fn create_log_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS food_log (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id          INTEGER NOT NULL REFERENCES users(id),
            meal_template_id INTEGER REFERENCES meal_templates(id),
            logged_at        TEXT NOT NULL,
            meal_label       TEXT,
            items            TEXT NOT NULL,
            calories         REAL,
            protein_g        REAL,
            carbs_g          REAL,
            fat_g            REAL,
            fiber_g          REAL,
            sodium_mg        REAL,
            notes            TEXT,
            created_at       TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_food_user_time
            ON food_log(user_id, logged_at DESC);
        CREATE TABLE IF NOT EXISTS hydration_log (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id    INTEGER NOT NULL REFERENCES users(id),
            logged_at  TEXT NOT NULL,
            amount_ml  REAL NOT NULL,
            source     TEXT,
            notes      TEXT,
            created_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS vitals_log (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id       INTEGER NOT NULL REFERENCES users(id),
            logged_at     TEXT NOT NULL,
            weight_kg     REAL,
            bp_systolic   INTEGER,
            bp_diastolic  INTEGER,
            heart_rate    INTEGER,
            blood_glucose REAL,
            temperature_c REAL,
            spo2          REAL,
            notes         TEXT,
            created_at    TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS exercise_log (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id          INTEGER NOT NULL REFERENCES users(id),
            logged_at        TEXT NOT NULL,
            exercise_type    TEXT NOT NULL,
            duration_minutes INTEGER,
            details          TEXT,
            max_hr           INTEGER,
            avg_hr           INTEGER,
            calories_burned  REAL,
            notes            TEXT,
            created_at       TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS supplement_log (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id     INTEGER NOT NULL REFERENCES users(id),
            logged_at   TEXT NOT NULL,
            supplements TEXT NOT NULL,
            timing      TEXT,
            notes       TEXT,
            created_at  TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS fasting_log (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id          INTEGER NOT NULL REFERENCES users(id),
            fast_start       TEXT NOT NULL,
            fast_end         TEXT,
            duration_minutes INTEGER,
            fast_type        TEXT,
            notes            TEXT,
            created_at       TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS sleep_log (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id          INTEGER NOT NULL REFERENCES users(id),
            sleep_start      TEXT,
            sleep_end        TEXT,
            duration_minutes INTEGER,
            quality          TEXT,
            notes            TEXT,
            created_at       TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS exercise_plans (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id        INTEGER NOT NULL REFERENCES users(id),
            target_date    TEXT NOT NULL,
            plan_type      TEXT NOT NULL,
            title          TEXT NOT NULL,
            description    TEXT,
            target_minutes INTEGER,
            source         TEXT NOT NULL DEFAULT 'ai',
            created_at     TEXT NOT NULL,
            updated_at     TEXT NOT NULL,
            UNIQUE(user_id, target_date)
        );",
    )?;
    Ok(())
}

fn create_meal_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS meal_templates (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id         INTEGER NOT NULL REFERENCES users(id),
            name            TEXT NOT NULL,
            normalized_name TEXT NOT NULL,
            aliases         TEXT,
            ingredients     TEXT,
            servings        REAL NOT NULL DEFAULT 1.0,
            calories        REAL,
            protein_g       REAL,
            carbs_g         REAL,
            fat_g           REAL,
            fiber_g         REAL,
            sodium_mg       REAL,
            notes           TEXT,
            is_archived     INTEGER NOT NULL DEFAULT 0,
            archived_at     TEXT,
            created_at      TEXT NOT NULL,
            updated_at      TEXT NOT NULL,
            UNIQUE(user_id, normalized_name)
        );
        CREATE TABLE IF NOT EXISTS meal_template_versions (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id          INTEGER NOT NULL REFERENCES users(id),
            meal_template_id INTEGER NOT NULL REFERENCES meal_templates(id),
            version_number   INTEGER NOT NULL,
            snapshot_json    TEXT NOT NULL,
            change_note      TEXT,
            created_at       TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS meal_response_signals (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id           INTEGER NOT NULL REFERENCES users(id),
            meal_template_id  INTEGER REFERENCES meal_templates(id),
            food_log_id       INTEGER REFERENCES food_log(id),
            source_message_id INTEGER REFERENCES messages(id),
            energy_level      INTEGER,
            gi_symptom_tags   TEXT,
            gi_severity       INTEGER,
            notes             TEXT,
            created_at        TEXT NOT NULL
        );",
    )?;
    Ok(())
}

fn create_checklist_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS daily_checklist_items (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id     INTEGER NOT NULL REFERENCES users(id),
            target_date TEXT NOT NULL,
            item_type   TEXT NOT NULL,
            item_name   TEXT NOT NULL,
            completed   INTEGER NOT NULL DEFAULT 0,
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL,
            UNIQUE(user_id, target_date, item_type, item_name)
        );",
    )?;
    Ok(())
}

fn create_notification_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS notifications (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id    INTEGER NOT NULL REFERENCES users(id),
            category   TEXT NOT NULL DEFAULT 'info',
            title      TEXT NOT NULL,
            message    TEXT NOT NULL,
            payload    TEXT,
            is_read    INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            read_at    TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_notifications_user
            ON notifications(user_id, created_at DESC);",
    )?;
    Ok(())
}

fn create_goal_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS user_goals (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id        INTEGER NOT NULL REFERENCES users(id),
            title          TEXT NOT NULL,
            description    TEXT,
            goal_type      TEXT NOT NULL DEFAULT 'custom',
            target_value   REAL,
            target_unit    TEXT,
            baseline_value REAL,
            current_value  REAL,
            target_date    TEXT,
            status         TEXT NOT NULL DEFAULT 'active',
            priority       INTEGER NOT NULL DEFAULT 3,
            why            TEXT,
            created_by     TEXT NOT NULL DEFAULT 'coach',
            created_at     TEXT NOT NULL,
            updated_at     TEXT NOT NULL
        );",
    )?;
    Ok(())
}

fn create_framework_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS health_frameworks (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id          INTEGER NOT NULL REFERENCES users(id),
            framework_type   TEXT NOT NULL,
            classifier_label TEXT NOT NULL,
            name             TEXT NOT NULL,
            normalized_name  TEXT NOT NULL,
            priority_score   INTEGER NOT NULL DEFAULT 50,
            is_active        INTEGER NOT NULL DEFAULT 0,
            source           TEXT NOT NULL DEFAULT 'seed',
            rationale        TEXT,
            metadata_json    TEXT,
            created_at       TEXT NOT NULL,
            updated_at       TEXT NOT NULL,
            UNIQUE(user_id, normalized_name)
        );",
    )?;
    Ok(())
}

fn create_analysis_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS analysis_runs (
            id                   INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id              INTEGER NOT NULL REFERENCES users(id),
            run_type             TEXT NOT NULL,
            period_start         TEXT NOT NULL,
            period_end           TEXT NOT NULL,
            status               TEXT NOT NULL DEFAULT 'running',
            confidence           REAL,
            used_utility_model   TEXT,
            used_reasoning_model TEXT,
            used_deep_model      TEXT,
            metrics_json         TEXT,
            missing_data_json    TEXT,
            risk_flags_json      TEXT,
            synthesis_json       TEXT,
            summary_markdown     TEXT,
            error_message        TEXT,
            created_at           TEXT NOT NULL,
            completed_at         TEXT,
            UNIQUE(user_id, run_type, period_start, period_end)
        );
        CREATE TABLE IF NOT EXISTS analysis_proposals (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id           INTEGER NOT NULL REFERENCES users(id),
            analysis_run_id   INTEGER NOT NULL REFERENCES analysis_runs(id),
            proposal_kind     TEXT NOT NULL,
            status            TEXT NOT NULL DEFAULT 'pending',
            title             TEXT NOT NULL,
            rationale         TEXT NOT NULL,
            confidence        REAL,
            requires_approval INTEGER NOT NULL DEFAULT 1,
            proposal_json     TEXT NOT NULL,
            diff_markdown     TEXT,
            created_at        TEXT NOT NULL,
            reviewed_at       TEXT,
            reviewer_user_id  INTEGER REFERENCES users(id),
            review_note       TEXT,
            applied_at        TEXT
        );",
    )?;
    Ok(())
}

fn create_feedback_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS feedback_entries (
            id                 INTEGER PRIMARY KEY AUTOINCREMENT,
            feedback_type      TEXT NOT NULL DEFAULT 'other',
            title              TEXT NOT NULL,
            details            TEXT,
            source             TEXT NOT NULL DEFAULT 'user',
            specialist_id      TEXT,
            specialist_name    TEXT,
            created_by_user_id INTEGER REFERENCES users(id),
            created_at         TEXT NOT NULL
        );",
    )?;
    Ok(())
}

fn create_summary_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS summaries (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id        INTEGER NOT NULL REFERENCES users(id),
            summary_type   TEXT NOT NULL,
            period_start   TEXT NOT NULL,
            period_end     TEXT NOT NULL,
            full_narrative TEXT,
            created_at     TEXT NOT NULL
        );",
    )?;
    Ok(())
}

fn create_websearch_cache_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS web_search_cache (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            query_key    TEXT NOT NULL UNIQUE,
            query        TEXT NOT NULL,
            provider     TEXT NOT NULL,
            results_json TEXT NOT NULL,
            fetched_at   TEXT NOT NULL,
            created_at   TEXT NOT NULL
        );",
    )?;
    Ok(())
}

fn create_telemetry_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS request_telemetry_events (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id          INTEGER REFERENCES users(id),
            request_group    TEXT NOT NULL,
            path             TEXT NOT NULL,
            method           TEXT NOT NULL,
            status_code      INTEGER NOT NULL,
            duration_ms      REAL NOT NULL,
            db_query_count   INTEGER NOT NULL DEFAULT 0,
            db_query_time_ms REAL NOT NULL DEFAULT 0,
            created_at       TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS ai_turn_telemetry (
            id                     INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id                INTEGER NOT NULL REFERENCES users(id),
            message_id             INTEGER REFERENCES messages(id),
            specialist_id          TEXT NOT NULL,
            intent_category        TEXT NOT NULL,
            first_token_latency_ms REAL,
            total_latency_ms       REAL NOT NULL DEFAULT 0,
            utility_calls          INTEGER NOT NULL DEFAULT 0,
            reasoning_calls        INTEGER NOT NULL DEFAULT 0,
            deep_calls             INTEGER NOT NULL DEFAULT 0,
            utility_tokens_in      INTEGER NOT NULL DEFAULT 0,
            utility_tokens_out     INTEGER NOT NULL DEFAULT 0,
            reasoning_tokens_in    INTEGER NOT NULL DEFAULT 0,
            reasoning_tokens_out   INTEGER NOT NULL DEFAULT 0,
            deep_tokens_in         INTEGER NOT NULL DEFAULT 0,
            deep_tokens_out        INTEGER NOT NULL DEFAULT 0,
            failure_count          INTEGER NOT NULL DEFAULT 0,
            failures_json          TEXT,
            created_at             TEXT NOT NULL
        );",
    )?;
    Ok(())
}
