use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Result, StoreError};
use crate::types::{parse_ts, parse_ts_opt, ts, AnalysisProposalRow, AnalysisRunRow};

const RUN_COLS: &str = "id, user_id, run_type, period_start, period_end, status, confidence,
                        used_utility_model, used_reasoning_model, used_deep_model, metrics_json,
                        missing_data_json, risk_flags_json, synthesis_json, summary_markdown,
                        error_message, created_at, completed_at";

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<AnalysisRunRow> {
    Ok(AnalysisRunRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        run_type: row.get(2)?,
        period_start: row.get(3)?,
        period_end: row.get(4)?,
        status: row.get(5)?,
        confidence: row.get(6)?,
        used_utility_model: row.get(7)?,
        used_reasoning_model: row.get(8)?,
        used_deep_model: row.get(9)?,
        metrics_json: row.get(10)?,
        missing_data_json: row.get(11)?,
        risk_flags_json: row.get(12)?,
        synthesis_json: row.get(13)?,
        summary_markdown: row.get(14)?,
        error_message: row.get(15)?,
        created_at: parse_ts(&row.get::<_, String>(16)?).unwrap_or_else(Utc::now),
        completed_at: parse_ts_opt(row.get(17)?),
    })
}

pub fn find_run_for_window(
    conn: &Connection,
    user_id: i64,
    run_type: &str,
    period_start: &str,
    period_end: &str,
) -> Result<Option<AnalysisRunRow>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {RUN_COLS} FROM analysis_runs
                 WHERE user_id = ?1 AND run_type = ?2 AND period_start = ?3 AND period_end = ?4
                 ORDER BY created_at DESC, id DESC LIMIT 1"
            ),
            params![user_id, run_type, period_start, period_end],
            row_to_run,
        )
        .optional()?)
}

pub fn get_run(conn: &Connection, user_id: i64, id: i64) -> Result<Option<AnalysisRunRow>> {
    Ok(conn
        .query_row(
            &format!("SELECT {RUN_COLS} FROM analysis_runs WHERE user_id = ?1 AND id = ?2"),
            params![user_id, id],
            row_to_run,
        )
        .optional()?)
}

/// Insert a new running row for the window. Unique-index violations surface as
/// StoreError so callers can reload the winner.
pub fn insert_running(
    conn: &Connection,
    user_id: i64,
    run_type: &str,
    period_start: &str,
    period_end: &str,
    queued_note: &str,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO analysis_runs
         (user_id, run_type, period_start, period_end, status, summary_markdown, created_at)
         VALUES (?1, ?2, ?3, ?4, 'running', ?5, ?6)",
        params![user_id, run_type, period_start, period_end, queued_note, ts(Utc::now())],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Reset an existing row back to `running` for a forced re-run, clearing its
/// previous output and proposals.
pub fn reset_to_running(conn: &Connection, run_id: i64, queued_note: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM analysis_proposals WHERE analysis_run_id = ?1",
        [run_id],
    )?;
    conn.execute(
        "UPDATE analysis_runs
         SET status = 'running', confidence = NULL, metrics_json = NULL,
             missing_data_json = NULL, risk_flags_json = NULL, synthesis_json = NULL,
             summary_markdown = ?2, completed_at = NULL, error_message = NULL,
             used_utility_model = NULL, used_reasoning_model = NULL, used_deep_model = NULL,
             created_at = ?3
         WHERE id = ?1",
        params![run_id, queued_note, ts(Utc::now())],
    )?;
    Ok(())
}

pub struct RunCompletion<'a> {
    pub confidence: f64,
    pub metrics_json: &'a str,
    pub missing_data_json: &'a str,
    pub risk_flags_json: &'a str,
    pub synthesis_json: &'a str,
    pub summary_markdown: &'a str,
    pub used_utility_model: Option<&'a str>,
    pub used_reasoning_model: Option<&'a str>,
    pub used_deep_model: Option<&'a str>,
}

pub fn complete_run(conn: &Connection, run_id: i64, out: &RunCompletion<'_>) -> Result<()> {
    conn.execute(
        "UPDATE analysis_runs
         SET status = 'completed', confidence = ?2, metrics_json = ?3, missing_data_json = ?4,
             risk_flags_json = ?5, synthesis_json = ?6, summary_markdown = ?7,
             used_utility_model = ?8, used_reasoning_model = ?9, used_deep_model = ?10,
             completed_at = ?11, error_message = NULL
         WHERE id = ?1",
        params![
            run_id,
            out.confidence,
            out.metrics_json,
            out.missing_data_json,
            out.risk_flags_json,
            out.synthesis_json,
            out.summary_markdown,
            out.used_utility_model,
            out.used_reasoning_model,
            out.used_deep_model,
            ts(Utc::now()),
        ],
    )?;
    Ok(())
}

pub fn fail_run(
    conn: &Connection,
    run_id: i64,
    error_message: &str,
    metrics_json: Option<&str>,
    missing_data_json: Option<&str>,
    risk_flags_json: Option<&str>,
) -> Result<()> {
    conn.execute(
        "UPDATE analysis_runs
         SET status = 'failed', error_message = ?2, completed_at = ?3,
             metrics_json = COALESCE(?4, metrics_json),
             missing_data_json = COALESCE(?5, missing_data_json),
             risk_flags_json = COALESCE(?6, risk_flags_json)
         WHERE id = ?1",
        params![
            run_id,
            error_message,
            ts(Utc::now()),
            metrics_json,
            missing_data_json,
            risk_flags_json,
        ],
    )?;
    Ok(())
}

/// Last completed period_end for a run type (used by due-target enumeration).
pub fn last_completed_period_end(
    conn: &Connection,
    user_id: i64,
    run_type: &str,
) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT period_end FROM analysis_runs
             WHERE user_id = ?1 AND run_type = ?2 AND status = 'completed'
             ORDER BY period_end DESC LIMIT 1",
            params![user_id, run_type],
            |r| r.get(0),
        )
        .optional()?)
}

// ---------------------------------------------------------------------------
// Proposals
// ---------------------------------------------------------------------------

const PROPOSAL_COLS: &str = "id, user_id, analysis_run_id, proposal_kind, status, title,
                             rationale, confidence, requires_approval, proposal_json,
                             diff_markdown, created_at, reviewed_at, reviewer_user_id,
                             review_note, applied_at";

fn row_to_proposal(row: &rusqlite::Row<'_>) -> rusqlite::Result<AnalysisProposalRow> {
    Ok(AnalysisProposalRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        analysis_run_id: row.get(2)?,
        proposal_kind: row.get(3)?,
        status: row.get(4)?,
        title: row.get(5)?,
        rationale: row.get(6)?,
        confidence: row.get(7)?,
        requires_approval: row.get::<_, i64>(8)? != 0,
        proposal_json: row.get(9)?,
        diff_markdown: row.get(10)?,
        created_at: parse_ts(&row.get::<_, String>(11)?).unwrap_or_else(Utc::now),
        reviewed_at: parse_ts_opt(row.get(12)?),
        reviewer_user_id: row.get(13)?,
        review_note: row.get(14)?,
        applied_at: parse_ts_opt(row.get(15)?),
    })
}

pub fn insert_proposal(
    conn: &Connection,
    user_id: i64,
    analysis_run_id: i64,
    proposal_kind: &str,
    title: &str,
    rationale: &str,
    confidence: Option<f64>,
    proposal_json: &str,
    diff_markdown: Option<&str>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO analysis_proposals
         (user_id, analysis_run_id, proposal_kind, status, title, rationale, confidence,
          requires_approval, proposal_json, diff_markdown, created_at)
         VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6, 1, ?7, ?8, ?9)",
        params![
            user_id,
            analysis_run_id,
            proposal_kind,
            title,
            rationale,
            confidence,
            proposal_json,
            diff_markdown,
            ts(Utc::now()),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_proposal(
    conn: &Connection,
    user_id: i64,
    id: i64,
) -> Result<AnalysisProposalRow> {
    conn.query_row(
        &format!("SELECT {PROPOSAL_COLS} FROM analysis_proposals WHERE user_id = ?1 AND id = ?2"),
        params![user_id, id],
        row_to_proposal,
    )
    .optional()?
    .ok_or(StoreError::NotFound {
        entity: "analysis_proposal",
        id,
    })
}

pub fn proposals_by_status(
    conn: &Connection,
    user_id: i64,
    statuses: &[&str],
    limit: usize,
) -> Result<Vec<AnalysisProposalRow>> {
    let placeholders = statuses
        .iter()
        .enumerate()
        .map(|(i, _)| format!("?{}", i + 2))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "SELECT {PROPOSAL_COLS} FROM analysis_proposals
         WHERE user_id = ?1 AND status IN ({placeholders})
         ORDER BY COALESCE(reviewed_at, created_at) DESC, id DESC
         LIMIT {limit}"
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut params_vec: Vec<&dyn rusqlite::ToSql> = vec![&user_id];
    for s in statuses {
        params_vec.push(s);
    }
    let result = stmt
        .query_map(params_vec.as_slice(), row_to_proposal)?
        .filter_map(|r| r.ok())
        .collect();
    Ok(result)
}

pub fn pending_proposals_for_run(
    conn: &Connection,
    user_id: i64,
    run_id: i64,
) -> Result<Vec<AnalysisProposalRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PROPOSAL_COLS} FROM analysis_proposals
         WHERE user_id = ?1 AND analysis_run_id = ?2 AND status = 'pending'
         ORDER BY id ASC"
    ))?;
    let result = stmt
        .query_map(params![user_id, run_id], row_to_proposal)?
        .filter_map(|r| r.ok())
        .collect();
    Ok(result)
}

pub fn pending_proposals_newest_first(
    conn: &Connection,
    user_id: i64,
) -> Result<Vec<AnalysisProposalRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PROPOSAL_COLS} FROM analysis_proposals
         WHERE user_id = ?1 AND status = 'pending'
         ORDER BY created_at DESC, id DESC"
    ))?;
    let result = stmt
        .query_map([user_id], row_to_proposal)?
        .filter_map(|r| r.ok())
        .collect();
    Ok(result)
}

pub fn delete_proposal(conn: &Connection, user_id: i64, id: i64) -> Result<()> {
    conn.execute(
        "DELETE FROM analysis_proposals WHERE user_id = ?1 AND id = ?2",
        params![user_id, id],
    )?;
    Ok(())
}

pub struct ProposalReviewUpdate<'a> {
    pub status: &'a str,
    pub requires_approval: bool,
    pub reviewer_user_id: i64,
    pub review_note: Option<&'a str>,
    pub proposal_json: Option<&'a str>,
    pub applied: Option<bool>,
}

pub fn update_proposal_review(
    conn: &Connection,
    user_id: i64,
    id: i64,
    update: &ProposalReviewUpdate<'_>,
) -> Result<()> {
    let now = ts(Utc::now());
    let applied_at = match update.applied {
        Some(true) => Some(now.clone()),
        Some(false) => None,
        None => None,
    };
    // `applied` None keeps the existing applied_at.
    if update.applied.is_some() {
        conn.execute(
            "UPDATE analysis_proposals
             SET status = ?3, requires_approval = ?4, reviewed_at = ?5, reviewer_user_id = ?6,
                 review_note = ?7, proposal_json = COALESCE(?8, proposal_json), applied_at = ?9
             WHERE user_id = ?1 AND id = ?2",
            params![
                user_id,
                id,
                update.status,
                update.requires_approval as i64,
                now,
                update.reviewer_user_id,
                update.review_note,
                update.proposal_json,
                applied_at,
            ],
        )?;
    } else {
        conn.execute(
            "UPDATE analysis_proposals
             SET status = ?3, requires_approval = ?4, reviewed_at = ?5, reviewer_user_id = ?6,
                 review_note = ?7, proposal_json = COALESCE(?8, proposal_json)
             WHERE user_id = ?1 AND id = ?2",
            params![
                user_id,
                id,
                update.status,
                update.requires_approval as i64,
                now,
                update.reviewer_user_id,
                update.review_note,
                update.proposal_json,
            ],
        )?;
    }
    Ok(())
}

pub fn update_proposal_content(
    conn: &Connection,
    user_id: i64,
    id: i64,
    proposal_json: &str,
    rationale: &str,
    confidence: Option<f64>,
    diff_markdown: Option<&str>,
) -> Result<()> {
    conn.execute(
        "UPDATE analysis_proposals
         SET proposal_json = ?3, rationale = ?4, confidence = ?5,
             diff_markdown = COALESCE(diff_markdown, ?6)
         WHERE user_id = ?1 AND id = ?2",
        params![user_id, id, proposal_json, rationale, confidence, diff_markdown],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::users::create_user;

    #[test]
    fn duplicate_window_insert_is_a_unique_violation() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let user = create_user(&conn, "a", "A").unwrap();
        insert_running(&conn, user.id, "daily", "2026-02-20", "2026-02-20", "queued").unwrap();
        let err = insert_running(&conn, user.id, "daily", "2026-02-20", "2026-02-20", "queued")
            .unwrap_err();
        assert!(err.is_unique_violation());
    }

    #[test]
    fn find_run_returns_same_row_for_same_window() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let user = create_user(&conn, "a", "A").unwrap();
        let id = insert_running(&conn, user.id, "weekly", "2026-02-14", "2026-02-20", "q").unwrap();
        let found = find_run_for_window(&conn, user.id, "weekly", "2026-02-14", "2026-02-20")
            .unwrap()
            .unwrap();
        assert_eq!(found.id, id);
        assert_eq!(found.status, "running");
    }
}
