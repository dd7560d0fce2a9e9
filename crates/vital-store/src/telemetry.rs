use chrono::Utc;
use rusqlite::{params, Connection};

use crate::error::Result;
use crate::types::{ts, AiTurnEvent, RequestEvent};

pub fn persist_ai_turn_event(conn: &Connection, event: &AiTurnEvent) -> Result<i64> {
    conn.execute(
        "INSERT INTO ai_turn_telemetry
         (user_id, message_id, specialist_id, intent_category, first_token_latency_ms,
          total_latency_ms, utility_calls, reasoning_calls, deep_calls, utility_tokens_in,
          utility_tokens_out, reasoning_tokens_in, reasoning_tokens_out, deep_tokens_in,
          deep_tokens_out, failure_count, failures_json, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
        params![
            event.user_id,
            event.message_id,
            event.specialist_id,
            event.intent_category,
            event.first_token_latency_ms,
            event.total_latency_ms,
            event.utility_calls,
            event.reasoning_calls,
            event.deep_calls,
            event.utility_tokens_in,
            event.utility_tokens_out,
            event.reasoning_tokens_in,
            event.reasoning_tokens_out,
            event.deep_tokens_in,
            event.deep_tokens_out,
            event.failure_count,
            event.failures_json,
            ts(Utc::now()),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn persist_request_event(conn: &Connection, event: &RequestEvent) -> Result<i64> {
    conn.execute(
        "INSERT INTO request_telemetry_events
         (user_id, request_group, path, method, status_code, duration_ms, db_query_count,
          db_query_time_ms, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            event.user_id,
            event.request_group,
            event.path,
            event.method,
            event.status_code,
            event.duration_ms.max(0.0),
            event.db_query_count.max(0),
            event.db_query_time_ms.max(0.0),
            ts(Utc::now()),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn ai_turn_event_count(conn: &Connection, user_id: i64) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM ai_turn_telemetry WHERE user_id = ?1",
        [user_id],
        |r| r.get(0),
    )?)
}
