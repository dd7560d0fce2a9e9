use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::types::ts;

/// Cached results for a query key, if fetched after the cutoff.
pub fn read_cache(
    conn: &Connection,
    query_key: &str,
    cutoff: DateTime<Utc>,
) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT results_json FROM web_search_cache
             WHERE query_key = ?1 AND fetched_at >= ?2
             ORDER BY fetched_at DESC LIMIT 1",
            params![query_key, ts(cutoff)],
            |r| r.get(0),
        )
        .optional()?)
}

pub fn write_cache(
    conn: &Connection,
    query_key: &str,
    query: &str,
    provider: &str,
    results_json: &str,
) -> Result<()> {
    let now = ts(Utc::now());
    conn.execute(
        "INSERT INTO web_search_cache (query_key, query, provider, results_json, fetched_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)
         ON CONFLICT(query_key) DO UPDATE
         SET query = ?2, provider = ?3, results_json = ?4, fetched_at = ?5",
        params![query_key, query, provider, results_json, now],
    )?;
    Ok(())
}
