//! Proposal lifecycle: normalization, dedupe-merge, review state machine,
//! framework apply/undo, and the approved-guidance context block.

use rusqlite::Connection;
use serde_json::{json, Value};
use tracing::warn;
use vital_core::jsonx::{as_f64, parse_loose_json};
use vital_store::types::{AnalysisProposalRow, FrameworkRow};
use vital_store::{analysis, frameworks};

use crate::error::{AnalysisError, Result};
use crate::similarity::title_similarity;

pub const PROPOSAL_KINDS: &[&str] = &["guidance_update", "prompt_adjustment", "experiment"];
pub const PROPOSAL_STATUSES: &[&str] = &["pending", "approved", "rejected", "applied", "expired"];
const TITLE_SIMILARITY_THRESHOLD: f64 = 0.82;

pub fn normalize_kind(raw: &str) -> &'static str {
    PROPOSAL_KINDS
        .iter()
        .copied()
        .find(|k| *k == raw.trim().to_lowercase())
        .unwrap_or("guidance_update")
}

/// Coerce a raw proposal payload into an object.
pub fn normalize_payload(payload: Option<&Value>) -> Value {
    match payload {
        Some(Value::Object(map)) => Value::Object(map.clone()),
        Some(Value::String(s)) => {
            let txt = s.trim();
            if txt.starts_with('{') {
                if let Some(Value::Object(map)) = parse_loose_json(txt) {
                    return Value::Object(map);
                }
            }
            json!({ "raw": txt })
        }
        Some(other) => json!({ "raw": other.to_string() }),
        None => json!({}),
    }
}

fn payload_target(payload: &Value) -> String {
    payload
        .get("target")
        .and_then(Value::as_str)
        .map(|s| s.trim().to_lowercase())
        .unwrap_or_default()
}

fn payload_of(row: &AnalysisProposalRow) -> Value {
    parse_loose_json(&row.proposal_json).unwrap_or_else(|| json!({}))
}

fn proposals_are_similar(left: &AnalysisProposalRow, right: &AnalysisProposalRow) -> bool {
    if left.proposal_kind != right.proposal_kind {
        return false;
    }
    let l_target = payload_target(&payload_of(left));
    let r_target = payload_target(&payload_of(right));
    if !l_target.is_empty() && !r_target.is_empty() && l_target != r_target {
        return false;
    }
    title_similarity(&left.title, &right.title) >= TITLE_SIMILARITY_THRESHOLD
}

fn merge_into_survivor(
    conn: &Connection,
    survivor: &AnalysisProposalRow,
    duplicate: &AnalysisProposalRow,
) -> Result<()> {
    let mut payload = payload_of(survivor);
    if !payload.is_object() {
        payload = json!({});
    }

    let mut merged: Vec<Value> = payload
        .get("_merged_proposals")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    merged.push(json!({
        "proposal_id": duplicate.id,
        "analysis_run_id": duplicate.analysis_run_id,
        "title": duplicate.title,
        "confidence": duplicate.confidence,
        "created_at": duplicate.created_at.to_rfc3339(),
    }));
    // Keep a compact, stable dedupe trace.
    if merged.len() > 40 {
        merged = merged.split_off(merged.len() - 40);
    }

    let mut run_ids: Vec<i64> = merged
        .iter()
        .filter_map(|m| m.get("analysis_run_id").and_then(Value::as_i64))
        .chain(std::iter::once(survivor.analysis_run_id))
        .collect();
    run_ids.sort_unstable();
    run_ids.dedup();

    let merge_count = payload
        .get("_merge_count")
        .and_then(Value::as_i64)
        .unwrap_or(0)
        + 1;

    payload["_merged_proposals"] = Value::Array(merged);
    payload["_merge_count"] = json!(merge_count);
    payload["_merged_run_ids"] = json!(run_ids);

    let confidence = match (survivor.confidence, duplicate.confidence) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    };

    let dup_rationale = duplicate.rationale.trim();
    let rationale = if !dup_rationale.is_empty() && !survivor.rationale.contains(dup_rationale) {
        format!("{} | {}", survivor.rationale.trim(), dup_rationale)
            .trim_matches([' ', '|'])
            .to_string()
    } else {
        survivor.rationale.clone()
    };

    analysis::update_proposal_content(
        conn,
        survivor.user_id,
        survivor.id,
        &payload.to_string(),
        &rationale,
        confidence,
        duplicate.diff_markdown.as_deref(),
    )?;
    analysis::delete_proposal(conn, duplicate.user_id, duplicate.id)?;
    Ok(())
}

/// Merge "similar" pending proposals: same kind, same target when present,
/// title similarity over the threshold. Returns (merged, remaining).
pub fn combine_similar_pending(conn: &Connection, user_id: i64) -> Result<(usize, usize)> {
    let rows = analysis::pending_proposals_newest_first(conn, user_id)?;
    let mut survivors: Vec<AnalysisProposalRow> = Vec::new();
    let mut merged = 0usize;

    for row in rows {
        match survivors.iter().find(|s| proposals_are_similar(s, &row)) {
            Some(survivor) => {
                merge_into_survivor(conn, survivor, &row)?;
                merged += 1;
            }
            None => survivors.push(row),
        }
    }
    Ok((merged, survivors.len()))
}

/// Insert proposal rows produced by a synthesis payload.
pub fn insert_proposals_from_synthesis(
    conn: &Connection,
    user_id: i64,
    run_id: i64,
    raw_proposals: &[Value],
) -> Result<usize> {
    let mut inserted = 0;
    for item in raw_proposals {
        let Some(obj) = item.as_object() else {
            continue;
        };
        let kind = normalize_kind(
            obj.get("proposal_kind")
                .and_then(Value::as_str)
                .unwrap_or("guidance_update"),
        );
        let title = obj
            .get("title")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or("Adaptive guidance proposal");
        let rationale = obj
            .get("rationale")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or("Generated from longitudinal analysis.");
        let confidence = as_f64(obj.get("confidence"));
        let payload = normalize_payload(obj.get("payload"));
        let diff = obj
            .get("diff_markdown")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|d| !d.is_empty());

        analysis::insert_proposal(
            conn,
            user_id,
            run_id,
            kind,
            title,
            rationale,
            confidence,
            &payload.to_string(),
            diff,
        )?;
        inserted += 1;
    }
    Ok(inserted)
}

// ---------------------------------------------------------------------------
// Framework apply / undo
// ---------------------------------------------------------------------------

fn snapshot_framework(row: &FrameworkRow) -> Value {
    json!({
        "framework_id": row.id,
        "framework_type": row.framework_type,
        "name": row.name,
        "priority_score": row.priority_score,
        "is_active": row.is_active,
        "source": row.source,
        "rationale": row.rationale.clone().unwrap_or_default(),
        "metadata": parse_loose_json(row.metadata_json.as_deref().unwrap_or("{}"))
            .unwrap_or_else(|| json!({})),
    })
}

struct ApplyOutcome {
    applied: usize,
    errors: Vec<String>,
    undo_operations: Vec<Value>,
}

fn apply_framework_operations(
    conn: &Connection,
    user_id: i64,
    payload: &Value,
) -> Result<ApplyOutcome> {
    let Some(operations) = payload.get("operations").and_then(Value::as_array) else {
        return Ok(ApplyOutcome {
            applied: 0,
            errors: vec!["Missing framework operations payload".to_string()],
            undo_operations: Vec::new(),
        });
    };

    let mut applied = 0usize;
    let mut errors: Vec<String> = Vec::new();
    let mut undo_operations: Vec<Value> = Vec::new();
    let metadata = json!({ "applied_by": "analysis_proposal" }).to_string();

    for (idx, op) in operations.iter().enumerate() {
        let Some(obj) = op.as_object() else {
            errors.push(format!("Operation {idx} is not an object"));
            continue;
        };
        let op_kind = obj
            .get("op")
            .and_then(Value::as_str)
            .unwrap_or("upsert")
            .trim()
            .to_lowercase();
        if op_kind == "delete" {
            errors.push(format!(
                "Operation {idx}: delete is not allowed for adaptive framework updates"
            ));
            continue;
        }

        let outcome = if op_kind == "update" {
            let Some(framework_id) = obj.get("framework_id").and_then(Value::as_i64) else {
                errors.push(format!("Operation {idx}: missing framework_id"));
                continue;
            };
            match frameworks::get_framework(conn, user_id, framework_id)? {
                Some(before) => {
                    undo_operations
                        .push(json!({ "op": "restore", "snapshot": snapshot_framework(&before) }));
                    frameworks::update_framework(
                        conn,
                        user_id,
                        framework_id,
                        &frameworks::FrameworkUpdate {
                            framework_type: obj.get("framework_type").and_then(Value::as_str),
                            name: obj.get("name").and_then(Value::as_str),
                            priority_score: obj.get("priority_score").and_then(Value::as_i64),
                            is_active: obj.get("is_active").and_then(Value::as_bool),
                            source: Some("adaptive"),
                            rationale: obj.get("rationale").and_then(Value::as_str),
                            metadata_json: Some(&metadata),
                        },
                    )
                    .map(|_| ())
                }
                None => {
                    errors.push(format!(
                        "Operation {idx}: framework_id {framework_id} not found"
                    ));
                    continue;
                }
            }
        } else {
            let framework_type = obj
                .get("framework_type")
                .and_then(Value::as_str)
                .unwrap_or("");
            let name = obj.get("name").and_then(Value::as_str).unwrap_or("");
            let normalized = frameworks::normalize_framework_name(name);
            let before = if normalized.is_empty() {
                None
            } else {
                frameworks::get_framework_by_name(conn, user_id, &normalized)?
            };
            if let Some(before_row) = &before {
                undo_operations
                    .push(json!({ "op": "restore", "snapshot": snapshot_framework(before_row) }));
            }
            let result = frameworks::upsert_framework(
                conn,
                user_id,
                &frameworks::FrameworkUpsert {
                    framework_type,
                    name,
                    priority_score: obj.get("priority_score").and_then(Value::as_i64),
                    is_active: obj.get("is_active").and_then(Value::as_bool),
                    source: "adaptive",
                    rationale: obj.get("rationale").and_then(Value::as_str),
                    metadata_json: Some(&metadata),
                },
            );
            match result {
                Ok((row, _)) => {
                    if before.is_none() {
                        undo_operations.push(json!({ "op": "delete", "framework_id": row.id }));
                    }
                    Ok(())
                }
                Err(e) => Err(e),
            }
        };

        match outcome {
            Ok(()) => applied += 1,
            Err(e) => errors.push(format!("Operation {idx}: {e}")),
        }
    }

    Ok(ApplyOutcome {
        applied,
        errors,
        undo_operations,
    })
}

fn undo_framework_operations(
    conn: &Connection,
    user_id: i64,
    payload: &Value,
) -> Result<(usize, Vec<String>)> {
    let Some(undo_ops) = payload.get("_undo_operations").and_then(Value::as_array) else {
        return Ok((0, vec!["No undo operations available for this proposal".to_string()]));
    };

    let mut applied = 0usize;
    let mut errors: Vec<String> = Vec::new();
    for (idx, op) in undo_ops.iter().rev().enumerate() {
        let Some(obj) = op.as_object() else {
            errors.push(format!("Undo operation {idx} is not an object"));
            continue;
        };
        let op_kind = obj.get("op").and_then(Value::as_str).unwrap_or("").trim();
        match op_kind {
            "delete" => {
                let Some(framework_id) = obj.get("framework_id").and_then(Value::as_i64) else {
                    errors.push(format!("Undo operation {idx}: missing framework_id"));
                    continue;
                };
                match frameworks::delete_framework(conn, user_id, framework_id) {
                    Ok(()) => applied += 1,
                    Err(_) => errors.push(format!(
                        "Undo operation {idx}: framework_id {framework_id} was not found"
                    )),
                }
            }
            "restore" => {
                let Some(snapshot) = obj.get("snapshot").and_then(Value::as_object) else {
                    errors.push(format!("Undo operation {idx}: missing snapshot"));
                    continue;
                };
                let framework_id = snapshot
                    .get("framework_id")
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                let metadata = snapshot
                    .get("metadata")
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| "{}".to_string());
                let existing = if framework_id > 0 {
                    frameworks::get_framework(conn, user_id, framework_id)?
                } else {
                    None
                };
                let result = if existing.is_some() {
                    frameworks::update_framework(
                        conn,
                        user_id,
                        framework_id,
                        &frameworks::FrameworkUpdate {
                            framework_type: snapshot.get("framework_type").and_then(Value::as_str),
                            name: snapshot.get("name").and_then(Value::as_str),
                            priority_score: snapshot.get("priority_score").and_then(Value::as_i64),
                            is_active: snapshot.get("is_active").and_then(Value::as_bool),
                            source: snapshot.get("source").and_then(Value::as_str),
                            rationale: snapshot.get("rationale").and_then(Value::as_str),
                            metadata_json: Some(&metadata),
                        },
                    )
                    .map(|_| ())
                } else {
                    frameworks::upsert_framework(
                        conn,
                        user_id,
                        &frameworks::FrameworkUpsert {
                            framework_type: snapshot
                                .get("framework_type")
                                .and_then(Value::as_str)
                                .unwrap_or(""),
                            name: snapshot.get("name").and_then(Value::as_str).unwrap_or(""),
                            priority_score: snapshot.get("priority_score").and_then(Value::as_i64),
                            is_active: snapshot.get("is_active").and_then(Value::as_bool),
                            source: snapshot.get("source").and_then(Value::as_str).unwrap_or("adaptive"),
                            rationale: snapshot.get("rationale").and_then(Value::as_str),
                            metadata_json: Some(&metadata),
                        },
                    )
                    .map(|_| ())
                };
                match result {
                    Ok(()) => applied += 1,
                    Err(e) => errors.push(format!("Undo operation {idx}: {e}")),
                }
            }
            other => errors.push(format!("Undo operation {idx}: unsupported op '{other}'")),
        }
    }
    Ok((applied, errors))
}

// ---------------------------------------------------------------------------
// Review state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewAction {
    Approve,
    Reject,
    Apply,
    Undo,
}

impl ReviewAction {
    pub fn parse(value: &str) -> Option<ReviewAction> {
        match value.trim().to_lowercase().as_str() {
            "approve" => Some(ReviewAction::Approve),
            "reject" => Some(ReviewAction::Reject),
            "apply" => Some(ReviewAction::Apply),
            "undo" => Some(ReviewAction::Undo),
            _ => None,
        }
    }
}

/// Apply a review action. `pending → approved|rejected|applied`; `undo`
/// converts approved/applied back to rejected, replaying framework undo
/// operations for applied framework proposals. Unknown payload targets are
/// approved rather than applied.
pub fn review_proposal(
    conn: &Connection,
    user_id: i64,
    proposal_id: i64,
    action: ReviewAction,
    note: Option<&str>,
) -> Result<AnalysisProposalRow> {
    let proposal = analysis::get_proposal(conn, user_id, proposal_id)?;
    let payload = payload_of(&proposal);
    let mut apply_note: Option<String> = None;

    let (status, requires_approval, payload_update, applied_flag): (
        &str,
        bool,
        Option<String>,
        Option<bool>,
    ) = match action {
        ReviewAction::Approve => ("approved", true, None, None),
        ReviewAction::Reject => ("rejected", true, None, None),
        ReviewAction::Apply => {
            if payload_target(&payload) == "framework" {
                let outcome = apply_framework_operations(conn, user_id, &payload)?;
                if !outcome.errors.is_empty() {
                    apply_note = Some(outcome.errors.join("; "));
                }
                let mut updated = payload.clone();
                updated["_undo_operations"] = Value::Array(outcome.undo_operations);
                if outcome.applied == 0 {
                    // Nothing landed: fall back to approved with no applied_at.
                    ("approved", false, Some(updated.to_string()), Some(false))
                } else {
                    ("applied", false, Some(updated.to_string()), Some(true))
                }
            } else {
                // Unknown payload target: approve rather than apply.
                ("approved", false, None, Some(false))
            }
        }
        ReviewAction::Undo => {
            if proposal.status != "approved" && proposal.status != "applied" {
                return Err(AnalysisError::Invalid(
                    "Only approved/applied proposals can be undone".to_string(),
                ));
            }
            if proposal.status == "applied" && payload_target(&payload) == "framework" {
                let (_, errors) = undo_framework_operations(conn, user_id, &payload)?;
                if !errors.is_empty() {
                    apply_note = Some(errors.join("; "));
                }
            }
            ("rejected", false, None, Some(false))
        }
    };

    let note_parts: Vec<&str> = [note.unwrap_or("").trim(), apply_note.as_deref().unwrap_or("")]
        .into_iter()
        .filter(|p| !p.is_empty())
        .collect();
    let review_note = (!note_parts.is_empty()).then(|| note_parts.join(" | "));

    analysis::update_proposal_review(
        conn,
        user_id,
        proposal_id,
        &analysis::ProposalReviewUpdate {
            status,
            requires_approval,
            reviewer_user_id: user_id,
            review_note: review_note.as_deref(),
            proposal_json: payload_update.as_deref(),
            applied: applied_flag,
        },
    )?;
    if status != "applied" && proposal.status == "applied" {
        warn!(proposal_id, "proposal moved out of applied state");
    }
    analysis::get_proposal(conn, user_id, proposal_id).map_err(Into::into)
}

/// Bullet list of approved/applied proposals for the context builder.
pub fn approved_guidance_block(conn: &Connection, user_id: i64, limit: usize) -> Result<String> {
    let rows = analysis::proposals_by_status(conn, user_id, &["approved", "applied"], limit)?;
    if rows.is_empty() {
        return Ok(String::new());
    }
    let mut lines = vec!["## Approved Adaptive Guidance".to_string()];
    for row in rows {
        let payload = payload_of(&row);
        let target = payload_target(&payload);
        let mut line = format!("- [{}] {}", row.proposal_kind, row.title);
        if !target.is_empty() {
            line.push_str(&format!(" (target: {target})"));
        }
        lines.push(line);
        if let Some(changes) = payload.get("changes").and_then(Value::as_array) {
            for change in changes.iter().take(3) {
                if let Some(c) = change.as_str().map(str::trim).filter(|c| !c.is_empty()) {
                    lines.push(format!("  - {c}"));
                }
            }
        }
        if let Some(operations) = payload.get("operations").and_then(Value::as_array) {
            for op in operations.iter().take(3) {
                let Some(obj) = op.as_object() else { continue };
                let op_kind = obj.get("op").and_then(Value::as_str).unwrap_or("upsert");
                let op_name = obj.get("name").and_then(Value::as_str).unwrap_or("").trim();
                if op_name.is_empty() {
                    continue;
                }
                let mut detail = format!("{op_kind} {op_name}");
                if let Some(t) = obj.get("framework_type").and_then(Value::as_str) {
                    if !t.trim().is_empty() {
                        detail.push_str(&format!(" ({})", t.trim()));
                    }
                }
                if let Some(score) = obj.get("priority_score").and_then(Value::as_i64) {
                    detail.push_str(&format!(" score={score}"));
                }
                lines.push(format!("  - {detail}"));
            }
        }
    }
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use vital_store::users::create_user;
    use vital_store::Store;

    fn seed_run(conn: &Connection, user_id: i64) -> i64 {
        analysis::insert_running(conn, user_id, "daily", "2026-02-20", "2026-02-20", "q").unwrap()
    }

    #[test]
    fn similar_pending_proposals_merge_with_trace() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let user = create_user(&conn, "a", "A").unwrap();
        let run = seed_run(&conn, user.id);

        for title in ["Reduce sodium intake", "Reduce your sodium intake"] {
            analysis::insert_proposal(
                &conn, user.id, run, "guidance_update", title, "r", Some(0.6),
                r#"{"target":"domain"}"#, None,
            )
            .unwrap();
        }
        let (merged, remaining) = combine_similar_pending(&conn, user.id).unwrap();
        assert_eq!(merged, 1);
        assert_eq!(remaining, 1);

        let survivors = analysis::pending_proposals_newest_first(&conn, user.id).unwrap();
        assert_eq!(survivors.len(), 1);
        let payload = parse_loose_json(&survivors[0].proposal_json).unwrap();
        assert_eq!(payload["_merge_count"], 1);
        assert_eq!(payload["_merged_proposals"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn different_kinds_do_not_merge() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let user = create_user(&conn, "a", "A").unwrap();
        let run = seed_run(&conn, user.id);
        analysis::insert_proposal(
            &conn, user.id, run, "guidance_update", "Reduce sodium intake", "r", None, "{}", None,
        )
        .unwrap();
        analysis::insert_proposal(
            &conn, user.id, run, "experiment", "Reduce sodium intake", "r", None, "{}", None,
        )
        .unwrap();
        let (merged, remaining) = combine_similar_pending(&conn, user.id).unwrap();
        assert_eq!(merged, 0);
        assert_eq!(remaining, 2);
    }

    #[test]
    fn apply_framework_proposal_records_undo_and_undoes() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let user = create_user(&conn, "a", "A").unwrap();
        let run = seed_run(&conn, user.id);
        let payload = json!({
            "target": "framework",
            "operations": [
                {"op": "upsert", "framework_type": "dietary", "name": "DASH",
                 "priority_score": 80, "is_active": true, "rationale": "bp trend"}
            ],
        });
        let id = analysis::insert_proposal(
            &conn, user.id, run, "guidance_update", "Activate DASH", "r", Some(0.7),
            &payload.to_string(), None,
        )
        .unwrap();

        let reviewed =
            review_proposal(&conn, user.id, id, ReviewAction::Apply, Some("ship it")).unwrap();
        assert_eq!(reviewed.status, "applied");
        assert!(reviewed.applied_at.is_some());
        let active = frameworks::active_frameworks(&conn, user.id).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].name, "DASH");

        let undone = review_proposal(&conn, user.id, id, ReviewAction::Undo, None).unwrap();
        assert_eq!(undone.status, "rejected");
        assert!(frameworks::active_frameworks(&conn, user.id).unwrap().is_empty());
    }

    #[test]
    fn undo_requires_approved_or_applied() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let user = create_user(&conn, "a", "A").unwrap();
        let run = seed_run(&conn, user.id);
        let id = analysis::insert_proposal(
            &conn, user.id, run, "guidance_update", "T", "r", None, "{}", None,
        )
        .unwrap();
        assert!(review_proposal(&conn, user.id, id, ReviewAction::Undo, None).is_err());
    }

    #[test]
    fn approved_guidance_block_lists_recent() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let user = create_user(&conn, "a", "A").unwrap();
        let run = seed_run(&conn, user.id);
        let id = analysis::insert_proposal(
            &conn, user.id, run, "guidance_update", "Front-load protein", "r", None,
            r#"{"target":"domain","changes":["protein at breakfast"]}"#, None,
        )
        .unwrap();
        review_proposal(&conn, user.id, id, ReviewAction::Approve, None).unwrap();

        let block = approved_guidance_block(&conn, user.id, 6).unwrap();
        assert!(block.contains("Approved Adaptive Guidance"));
        assert!(block.contains("Front-load protein"));
        assert!(block.contains("protein at breakfast"));
    }
}
