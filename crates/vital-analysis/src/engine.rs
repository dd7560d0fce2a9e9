//! Windowed longitudinal analysis: deterministic metrics, LLM synthesis,
//! proposal persistence, and due-window catch-up.

use chrono::{NaiveDate, Timelike, Utc};
use chrono_tz::Tz;
use serde_json::{json, Value};
use tracing::{info, warn};
use vital_core::config::AnalysisConfig;
use vital_core::jsonx::{as_f64, parse_loose_object};
use vital_core::secrets::KeySealer;
use vital_core::timeinfer::resolve_tz;
use vital_provider::{
    create_provider, AiProvider, ChatMessage, ChatRequest, ModelSelection, ProviderError,
};
use vital_store::types::{AnalysisRunRow, UserSettings};
use vital_store::{analysis, users, Store};

use crate::error::{AnalysisError, Result};
use crate::metrics::{collect_notes_for_signals, collect_period_metrics, PeriodMetrics};
use crate::proposals::{combine_similar_pending, insert_proposals_from_synthesis, review_proposal, ReviewAction};
use crate::windows::{candidate_due_targets, window_for, AnalysisWindow, RunType};

const UTILITY_SIGNAL_PROMPT: &str = r#"Extract short longitudinal signal annotations from these notes.
Return JSON only:
{
  "energy_signals": ["short statements"],
  "stress_signals": ["short statements"],
  "symptom_signals": ["short statements"],
  "adherence_signals": ["short statements"],
  "confidence": 0.0
}
Rules:
- Use only provided notes.
- Keep each statement <= 20 words.
- If nothing is relevant, return empty arrays and low confidence."#;

const REASONING_SYNTHESIS_PROMPT: &str = r#"You are a longitudinal health analytics assistant.
Analyze the supplied user metrics and produce adaptation proposals.

Return JSON only:
{
  "confidence": 0.0,
  "summary_markdown": "markdown summary",
  "risk_flags": [
    {"code": "short_code", "severity": "low|medium|high", "title": "title", "detail": "detail"}
  ],
  "recommendations": [
    {"title": "title", "detail": "detail", "priority": "low|medium|high", "requires_user_confirmation": true}
  ],
  "proposals": [
    {
      "proposal_kind": "guidance_update|experiment|prompt_adjustment",
      "title": "title",
      "rationale": "why",
      "confidence": 0.0,
      "payload": {"target": "domain|framework", "changes": ["concrete change"]},
      "diff_markdown": "optional prompt diff markdown"
    }
  ]
}
Rules:
- Never claim certainty beyond provided data.
- Missing data must reduce confidence and be mentioned in summary.
- Do not include direct medication changes unless framed as ask-user-to-confirm with clinician.
- If active frameworks are present, align recommendations with them or explicitly explain conflicts.
- Framework proposals must only add, reprioritize, or deactivate; never delete.
- If proposing framework changes, use payload:
  {"target":"framework","operations":[{"op":"upsert|update","framework_type":"...","name":"...","priority_score":0-100,"is_active":true|false,"rationale":"..."}]}
- Keep safety-focused tone and objective language."#;

const DEEP_SYNTHESIS_PROMPT: &str = r#"You are doing monthly root-cause synthesis.
Given existing monthly synthesis output, generate additional high-value hypotheses and optional prompt tuning proposals.

Return JSON only:
{
  "root_causes": ["hypothesis 1", "hypothesis 2"],
  "prompt_adjustment_proposals": [
    {
      "title": "title",
      "rationale": "why this prompt change helps",
      "confidence": 0.0,
      "payload": {"specialist_id": "nutritionist|movement_coach|sleep_expert|supplement_auditor|safety_clinician|orchestrator", "changes": ["change"]},
      "diff_markdown": "```diff\n...\n```"
    }
  ],
  "confidence": 0.0
}
Rules:
- Keep outputs concise and specific."#;

fn user_tz(settings: &UserSettings) -> Tz {
    resolve_tz(settings.timezone.as_deref())
}

fn profile_summary(settings: &UserSettings) -> String {
    let mut lines = Vec::new();
    if let Some(age) = settings.age {
        lines.push(format!("- Age: {age}"));
    }
    if let Some(sex) = &settings.sex {
        lines.push(format!("- Sex: {sex}"));
    }
    if let Some(weight) = settings.current_weight_kg {
        lines.push(format!("- Current weight: {weight:.1} kg"));
    }
    if let Some(goal) = settings.goal_weight_kg {
        lines.push(format!("- Goal weight: {goal:.1} kg"));
    }
    if lines.is_empty() {
        "No profile configured yet.".to_string()
    } else {
        lines.join("\n")
    }
}

async fn chat_json(
    provider: &dyn AiProvider,
    model: &str,
    system: &str,
    content: String,
) -> std::result::Result<(serde_json::Map<String, Value>, u32, u32), ProviderError> {
    let req = ChatRequest::new(model, system, vec![ChatMessage::user(content)]);
    let resp = provider.chat(&req).await?;
    let parsed = parse_loose_object(&resp.content).unwrap_or_default();
    Ok((parsed, resp.tokens_in, resp.tokens_out))
}

fn build_provider_for_user(
    settings: &UserSettings,
    sealer: &KeySealer,
) -> Option<Box<dyn AiProvider>> {
    let sealed = settings.api_key_sealed.as_deref()?;
    let api_key = sealer.open(sealed).ok()?;
    create_provider(
        &settings.ai_provider,
        api_key,
        ModelSelection {
            reasoning: settings.reasoning_model.clone(),
            utility: settings.utility_model.clone(),
            deep_thinking: settings.deep_thinking_model.clone(),
        },
    )
    .ok()
}

/// Acquire the window's run row in `running` state, or return the finished
/// winner. Handles the unique-index race by reloading.
fn acquire_run_row(
    store: &Store,
    user_id: i64,
    window: &AnalysisWindow,
    trigger: &str,
    force: bool,
) -> Result<(i64, bool)> {
    let run_type = window.run_type.as_str();
    let start = window.period_start.format("%Y-%m-%d").to_string();
    let end = window.period_end.format("%Y-%m-%d").to_string();
    let note = format!("Analysis queued by {trigger}.");

    // A running row older than one provider request timeout is presumed
    // orphaned (crashed worker) and is retried on re-request.
    let is_stale_running = |row: &vital_store::types::AnalysisRunRow| {
        row.status == "running"
            && (Utc::now() - row.created_at).num_seconds()
                > vital_provider::REQUEST_TIMEOUT_SECS as i64
    };

    let conn = store.conn();
    if let Some(existing) = analysis::find_run_for_window(&conn, user_id, run_type, &start, &end)? {
        if !force
            && (existing.status == "running" || existing.status == "completed")
            && !is_stale_running(&existing)
        {
            return Ok((existing.id, false));
        }
        analysis::reset_to_running(&conn, existing.id, &note)?;
        return Ok((existing.id, true));
    }

    match analysis::insert_running(&conn, user_id, run_type, &start, &end, &note) {
        Ok(id) => Ok((id, true)),
        Err(e) if e.is_unique_violation() => {
            // Lost the race: reload the winner.
            let winner = analysis::find_run_for_window(&conn, user_id, run_type, &start, &end)?
                .ok_or_else(|| AnalysisError::Invalid("run row vanished under race".to_string()))?;
            if !force
                && (winner.status == "running" || winner.status == "completed")
                && !is_stale_running(&winner)
            {
                return Ok((winner.id, false));
            }
            analysis::reset_to_running(&conn, winner.id, &note)?;
            Ok((winner.id, true))
        }
        Err(e) => Err(e.into()),
    }
}

/// Run one windowed analysis. Returns the (possibly pre-existing) run row.
pub async fn run_longitudinal_analysis(
    store: &Store,
    config: &AnalysisConfig,
    sealer: &KeySealer,
    user_id: i64,
    run_type: RunType,
    target_date: Option<NaiveDate>,
    trigger: &str,
    force: bool,
) -> Result<AnalysisRunRow> {
    let settings = {
        let conn = store.conn();
        users::get_settings(&conn, user_id)?
    };
    let tz = user_tz(&settings);
    let target_day = target_date.unwrap_or_else(|| Utc::now().with_timezone(&tz).date_naive());
    let window = window_for(run_type, target_day);

    let (run_id, owns_run) = acquire_run_row(store, user_id, &window, trigger, force)?;
    if !owns_run {
        let conn = store.conn();
        return analysis::get_run(&conn, user_id, run_id)?
            .ok_or_else(|| AnalysisError::Invalid("run row vanished".to_string()));
    }

    let PeriodMetrics {
        metrics,
        missing_domains,
        risk_flags: base_risk_flags,
    } = {
        let conn = store.conn();
        collect_period_metrics(&conn, user_id, &settings, &window, tz)?
    };

    let mut risk_flags: Vec<Value> = base_risk_flags
        .iter()
        .map(|code| {
            json!({
                "code": code,
                "severity": if code.contains("elevated") { "medium" } else { "low" },
                "title": code.replace('_', " "),
                "detail": "Detected from deterministic metrics.",
            })
        })
        .collect();

    let mut synthesis: Value = json!({ "recommendations": [], "proposals": [] });
    let mut summary_markdown = String::new();
    let mut confidence = if missing_domains.is_empty() { 0.6 } else { 0.4 };
    let mut used_utility = None;
    let mut used_reasoning = None;
    let mut used_deep = None;

    let llm_result: Result<()> = async {
        let Some(provider) = build_provider_for_user(&settings, sealer) else {
            summary_markdown = "API key not configured. Generated deterministic metrics only."
                .to_string();
            return Ok(());
        };
        used_utility = Some(provider.utility_model().to_string());
        used_reasoning = Some(provider.reasoning_model().to_string());
        used_deep = Some(provider.deep_thinking_model().to_string());

        // Utility pass: condense free-text notes into signal annotations.
        let notes = {
            let conn = store.conn();
            collect_notes_for_signals(&conn, user_id, &window, tz)?
        };
        let signal_annotations = if notes.is_empty() {
            json!({
                "energy_signals": [], "stress_signals": [], "symptom_signals": [],
                "adherence_signals": [], "confidence": 0.2,
            })
        } else {
            let payload = json!({
                "period_start": window.period_start.format("%Y-%m-%d").to_string(),
                "period_end": window.period_end.format("%Y-%m-%d").to_string(),
                "notes": notes,
            });
            let (parsed, tin, tout) = chat_json(
                provider.as_ref(),
                provider.utility_model(),
                "Return strict JSON only.",
                format!("{UTILITY_SIGNAL_PROMPT}\n\nData:\n{payload}"),
            )
            .await?;
            {
                let conn = store.conn();
                let _ = vital_store::messages::record_model_usage(
                    &conn,
                    user_id,
                    "utility",
                    &format!("analysis_utility_extract:{run_type}"),
                    provider.utility_model(),
                    tin as i64,
                    tout as i64,
                );
            }
            Value::Object(parsed)
        };

        // Reasoning pass: strict-JSON synthesis over metrics + annotations.
        let synthesis_input = json!({
            "window": {
                "run_type": run_type.as_str(),
                "period_start": window.period_start.format("%Y-%m-%d").to_string(),
                "period_end": window.period_end.format("%Y-%m-%d").to_string(),
                "timezone": tz.name(),
                "trigger": trigger,
            },
            "profile": profile_summary(&settings),
            "metrics": metrics,
            "missing_domains": missing_domains,
            "base_risk_flags": base_risk_flags,
            "signal_annotations": signal_annotations,
        });
        let (parsed, tin, tout) = chat_json(
            provider.as_ref(),
            provider.reasoning_model(),
            "Return strict JSON only.",
            format!("{REASONING_SYNTHESIS_PROMPT}\n\nInput:\n{synthesis_input}"),
        )
        .await?;
        {
            let conn = store.conn();
            let _ = vital_store::messages::record_model_usage(
                &conn,
                user_id,
                "reasoning",
                &format!("analysis_reasoning_synthesis:{run_type}"),
                provider.reasoning_model(),
                tin as i64,
                tout as i64,
            );
        }
        synthesis = Value::Object(parsed);
        summary_markdown = synthesis
            .get("summary_markdown")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string();
        if let Some(c) = as_f64(synthesis.get("confidence")) {
            confidence = c;
        }
        if let Some(ai_flags) = synthesis.get("risk_flags").and_then(Value::as_array) {
            risk_flags.extend(ai_flags.iter().filter(|f| f.is_object()).cloned());
        }

        // Monthly only: deep-thinking root-cause pass, folded into proposals.
        if run_type == RunType::Monthly {
            let deep_input = json!({
                "metrics": metrics,
                "current_synthesis": synthesis,
                "missing_domains": missing_domains,
                "profile": profile_summary(&settings),
            });
            let (deep, tin, tout) = chat_json(
                provider.as_ref(),
                provider.deep_thinking_model(),
                "Return strict JSON only.",
                format!("{DEEP_SYNTHESIS_PROMPT}\n\nInput:\n{deep_input}"),
            )
            .await?;
            {
                let conn = store.conn();
                let _ = vital_store::messages::record_model_usage(
                    &conn,
                    user_id,
                    "deep_thinking",
                    "analysis_deep_synthesis:monthly",
                    provider.deep_thinking_model(),
                    tin as i64,
                    tout as i64,
                );
            }
            let deep = Value::Object(deep);
            if let Some(c) = as_f64(deep.get("confidence")) {
                confidence = confidence.max(c);
            }
            let prompt_props: Vec<Value> = deep
                .get("prompt_adjustment_proposals")
                .and_then(Value::as_array)
                .map(|arr| {
                    arr.iter()
                        .filter_map(Value::as_object)
                        .map(|p| {
                            let mut p = p.clone();
                            p.insert(
                                "proposal_kind".to_string(),
                                json!("prompt_adjustment"),
                            );
                            Value::Object(p)
                        })
                        .collect()
                })
                .unwrap_or_default();
            synthesis["deep_thinking"] = deep;
            if !prompt_props.is_empty() {
                if !synthesis.get("proposals").map(Value::is_array).unwrap_or(false) {
                    synthesis["proposals"] = Value::Array(Vec::new());
                }
                if let Some(arr) = synthesis
                    .get_mut("proposals")
                    .and_then(Value::as_array_mut)
                {
                    arr.extend(prompt_props);
                }
            }
        }
        Ok(())
    }
    .await;

    if let Err(exc) = llm_result {
        warn!(user_id, run_id, %exc, "longitudinal analysis failed");
        let conn = store.conn();
        analysis::fail_run(
            &conn,
            run_id,
            &exc.to_string(),
            Some(&metrics.to_string()),
            Some(&serde_json::to_string(&missing_domains)?),
            Some(&serde_json::to_string(&risk_flags)?),
        )?;
        return Err(exc);
    }

    let proposals_raw: Vec<Value> = synthesis
        .get("proposals")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    {
        let conn = store.conn();
        analysis::complete_run(
            &conn,
            run_id,
            &analysis::RunCompletion {
                confidence: confidence.clamp(0.0, 1.0),
                metrics_json: &metrics.to_string(),
                missing_data_json: &serde_json::to_string(&missing_domains)?,
                risk_flags_json: &serde_json::to_string(&risk_flags)?,
                synthesis_json: &synthesis.to_string(),
                summary_markdown: if summary_markdown.is_empty() {
                    "No summary generated."
                } else {
                    &summary_markdown
                },
                used_utility_model: used_utility.as_deref(),
                used_reasoning_model: used_reasoning.as_deref(),
                used_deep_model: used_deep.as_deref(),
            },
        )?;
        insert_proposals_from_synthesis(&conn, user_id, run_id, &proposals_raw)?;
        // Combine repetitive pending proposals so users don't see duplicates
        // across daily/weekly/monthly windows with similar intent.
        combine_similar_pending(&conn, user_id)?;

        if config.analysis_auto_apply_proposals {
            let pending = analysis::pending_proposals_for_run(&conn, user_id, run_id)?;
            for proposal in pending {
                if let Err(exc) = review_proposal(
                    &conn,
                    user_id,
                    proposal.id,
                    ReviewAction::Apply,
                    Some("Auto-applied by adaptation engine"),
                ) {
                    warn!(proposal_id = proposal.id, run_id, %exc, "auto-apply failed");
                }
            }
        }
    }

    info!(user_id, run_id, run_type = %run_type, "analysis run completed");
    let conn = store.conn();
    analysis::get_run(&conn, user_id, run_id)?
        .ok_or_else(|| AnalysisError::Invalid("run row vanished after completion".to_string()))
}

/// Enumerate due windows per run type and execute each one (non-force).
/// Windows already covered by a completed run are skipped.
pub async fn run_due_analyses(
    store: &Store,
    config: &AnalysisConfig,
    sealer: &KeySealer,
    user_id: i64,
    trigger: &str,
) -> Result<Vec<AnalysisRunRow>> {
    if !config.enable_longitudinal_analysis {
        return Ok(Vec::new());
    }
    let settings = {
        let conn = store.conn();
        users::get_settings(&conn, user_id)?
    };
    let tz = user_tz(&settings);
    let now_local = Utc::now().with_timezone(&tz);
    let mut reference_day = now_local.date_naive();
    if (now_local.time().hour() as u32) < config.analysis_daily_hour_local {
        reference_day -= chrono::Duration::days(1);
    }

    let is_chat_trigger = trigger.trim().to_lowercase().starts_with("chat");
    let configured_max = if is_chat_trigger {
        config.analysis_max_catchup_windows_chat
    } else {
        config.analysis_max_catchup_windows
    };
    let max_windows = configured_max.clamp(1, 60);
    let weekly_weekday = config.analysis_weekly_weekday_local.min(6);
    let monthly_day = config.analysis_monthly_day_local.clamp(1, 31);

    let mut runs = Vec::new();
    for run_type in RunType::ALL {
        let last_completed = {
            let conn = store.conn();
            analysis::last_completed_period_end(&conn, user_id, run_type.as_str())?
                .and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok())
        };
        let candidates =
            candidate_due_targets(run_type, reference_day, max_windows, weekly_weekday, monthly_day)
                .into_iter()
                .filter(|day| last_completed.map_or(true, |done| *day > done));
        for target_day in candidates {
            match run_longitudinal_analysis(
                store,
                config,
                sealer,
                user_id,
                run_type,
                Some(target_day),
                trigger,
                false,
            )
            .await
            {
                Ok(run) => runs.push(run),
                Err(exc) => {
                    warn!(user_id, run_type = %run_type, %target_day, %exc, "due analysis failed");
                }
            }
        }
    }
    Ok(runs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vital_store::users::create_user;

    #[tokio::test]
    async fn analysis_without_api_key_is_deterministic_only() {
        let store = Store::open_in_memory().unwrap();
        let user_id = {
            let conn = store.conn();
            create_user(&conn, "a", "A").unwrap().id
        };
        let config = AnalysisConfig::default();
        let sealer = KeySealer::from_master_key_b64("").unwrap();

        let run = run_longitudinal_analysis(
            &store,
            &config,
            &sealer,
            user_id,
            RunType::Daily,
            Some(NaiveDate::from_ymd_opt(2026, 2, 20).unwrap()),
            "manual",
            false,
        )
        .await
        .unwrap();
        assert_eq!(run.status, "completed");
        assert!(run
            .summary_markdown
            .as_deref()
            .unwrap()
            .contains("API key not configured"));
        assert!(run.metrics_json.is_some());
    }

    #[tokio::test]
    async fn second_non_force_run_returns_same_row() {
        let store = Store::open_in_memory().unwrap();
        let user_id = {
            let conn = store.conn();
            create_user(&conn, "a", "A").unwrap().id
        };
        let config = AnalysisConfig::default();
        let sealer = KeySealer::from_master_key_b64("").unwrap();
        let day = NaiveDate::from_ymd_opt(2026, 2, 20).unwrap();

        let first = run_longitudinal_analysis(
            &store, &config, &sealer, user_id, RunType::Daily, Some(day), "manual", false,
        )
        .await
        .unwrap();
        let second = run_longitudinal_analysis(
            &store, &config, &sealer, user_id, RunType::Daily, Some(day), "chat", false,
        )
        .await
        .unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn due_runs_skip_completed_windows() {
        let store = Store::open_in_memory().unwrap();
        let user_id = {
            let conn = store.conn();
            create_user(&conn, "a", "A").unwrap().id
        };
        let config = AnalysisConfig::default();
        let sealer = KeySealer::from_master_key_b64("").unwrap();

        let first = run_due_analyses(&store, &config, &sealer, user_id, "chat").await.unwrap();
        assert!(!first.is_empty());
        let second = run_due_analyses(&store, &config, &sealer, user_id, "chat").await.unwrap();
        // All windows completed by the first pass are filtered out.
        for run in &second {
            assert!(!first.iter().any(|f| f.id == run.id));
        }
    }
}
