//! The turn orchestrator: one user message in, a streamed assistant reply
//! and a set of idempotent structured side effects out.
//!
//! Ordering guarantees inside a turn: structured writes commit before the
//! reasoning model is asked; the user message is persisted before streaming
//! starts; the assistant message and turn telemetry are persisted after the
//! stream terminates, in that order.

use std::sync::{Arc, LazyLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};
use vital_analysis::AnalysisDispatcher;
use vital_core::config::VitalConfig;
use vital_core::secrets::KeySealer;
use vital_core::timeinfer::infer_event_datetime;
use vital_core::types::{Confidence, IntentCategory, VerbosityMode};
use vital_core::units::kg_to_lb;
use vital_provider::{
    create_provider, AiProvider, ChatMessage, ChatRequest, ModelSelection, ProviderError, Role,
    StreamEvent,
};
use vital_store::types::UserSettings;
use vital_store::{messages, telemetry, users, Store};

use crate::checkin;
use crate::checklist_sync;
use crate::context::ContextBuilder;
use crate::error::Result;
use crate::feedback;
use crate::goal_sync::{self, GoalSyncOutcome};
use crate::menu;
use crate::parser::{self, assess_parse_confidence};
use crate::profile_sync::{self, ProfileSyncOutcome};
use crate::router;
use crate::scope::{ModelTier, TurnScope, UtilityBudget};
use crate::signals;
use crate::specialists;
use crate::timegate::{self, INFERRED_CONFIDENCE_KEY, INFERRED_REASON_KEY};
use crate::tools::{ToolContext, ToolRegistry};

/// Events streamed to the client for one turn.
#[derive(Debug, Clone)]
pub enum TurnEvent {
    Chunk { text: String },
    Error { text: String },
    Done {
        specialist: String,
        category: IntentCategory,
    },
}

pub type ProviderFactory = Arc<
    dyn Fn(&UserSettings, String) -> std::result::Result<Box<dyn AiProvider>, ProviderError>
        + Send
        + Sync,
>;

const WEB_SEARCH_CATEGORIES: &[IntentCategory] = &[
    IntentCategory::AskNutrition,
    IntentCategory::AskExercise,
    IntentCategory::AskSleep,
    IntentCategory::AskSupplement,
    IntentCategory::AskMedical,
];
const WEB_SEARCH_TRIGGERS: &[&str] = &[
    "search",
    "look up",
    "latest",
    "recent",
    "new",
    "today",
    "current",
    "guideline",
    "guidelines",
    "evidence",
    "study",
    "studies",
    "research",
    "news",
];

static TIME_QUERY_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"\bwhat\s+time\s+is\s+it\b",
        r"\bwhat(?:'s| is)?\s+the\s+time\b",
        r"\bcurrent\s+time\b",
        r"\btell\s+me\s+the\s+time\b",
        r"\btime\s+now\b",
        r"\bwhat\s+day\s+is\s+it\b",
        r"\bwhat(?:'s| is)?\s+today(?:'s)?\s+date\b",
        r"\bcurrent\s+date\b",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

const SLEEP_START_CUES: &[&str] = &[
    "heading to bed",
    "going to bed",
    "go to bed",
    "bed now",
    "sleep now",
    "going to sleep",
    "good night",
];
const SLEEP_END_CUES: &[&str] = &["woke up", "wake up", "waking up", "awake now", "got up", "morning"];

pub struct Agent {
    store: Arc<Store>,
    config: Arc<VitalConfig>,
    sealer: Arc<KeySealer>,
    registry: Arc<ToolRegistry>,
    context_builder: Arc<ContextBuilder>,
    dispatcher: Arc<AnalysisDispatcher>,
    provider_factory: ProviderFactory,
}

impl Agent {
    pub fn new(store: Arc<Store>, config: Arc<VitalConfig>, sealer: Arc<KeySealer>) -> Self {
        let dispatcher = AnalysisDispatcher::new(config.analysis.clone());
        Self {
            store,
            config,
            sealer,
            registry: Arc::new(ToolRegistry::with_default_tools()),
            context_builder: Arc::new(ContextBuilder::new()),
            dispatcher,
            provider_factory: Arc::new(|settings, api_key| {
                create_provider(
                    &settings.ai_provider,
                    api_key,
                    ModelSelection {
                        reasoning: settings.reasoning_model.clone(),
                        utility: settings.utility_model.clone(),
                        deep_thinking: settings.deep_thinking_model.clone(),
                    },
                )
            }),
        }
    }

    /// Test seam: swap the provider construction.
    pub fn with_provider_factory(mut self, factory: ProviderFactory) -> Self {
        self.provider_factory = factory;
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Spawn the turn and return the event stream.
    pub fn chat_stream(
        self: &Arc<Self>,
        user_id: i64,
        message: String,
        image_bytes: Option<Vec<u8>>,
        verbosity: Option<String>,
    ) -> ReceiverStream<TurnEvent> {
        let (tx, rx) = mpsc::channel(64);
        let agent = Arc::clone(self);
        tokio::spawn(async move {
            agent
                .process_chat(user_id, &message, image_bytes.as_deref(), verbosity.as_deref(), tx)
                .await;
        });
        ReceiverStream::new(rx)
    }

    /// Run one full turn, emitting [`TurnEvent`]s on `tx`.
    pub async fn process_chat(
        &self,
        user_id: i64,
        message: &str,
        image_bytes: Option<&[u8]>,
        verbosity: Option<&str>,
        tx: mpsc::Sender<TurnEvent>,
    ) {
        if let Err(e) = self
            .process_chat_inner(user_id, message, image_bytes, verbosity, &tx)
            .await
        {
            warn!(user_id, error = %e, "turn failed");
            let _ = tx
                .send(TurnEvent::Error {
                    text: "I encountered an internal error. Please try again.".to_string(),
                })
                .await;
        }
    }

    async fn process_chat_inner(
        &self,
        user_id: i64,
        message: &str,
        image_bytes: Option<&[u8]>,
        verbosity: Option<&str>,
        tx: &mpsc::Sender<TurnEvent>,
    ) -> Result<()> {
        // Pre-flight: no API key means a single error chunk and nothing else.
        let (user, settings) = {
            let conn = self.store.conn();
            let user = users::get_user(&conn, user_id)?;
            let settings = users::get_settings(&conn, user_id)?;
            (user, settings)
        };
        let Some(sealed_key) = settings.api_key_sealed.as_deref() else {
            let _ = tx
                .send(TurnEvent::Error {
                    text: "Please configure your API key in Settings before chatting.".to_string(),
                })
                .await;
            return Ok(());
        };
        let api_key = match self.sealer.open(sealed_key) {
            Ok(key) => key,
            Err(e) => {
                warn!(user_id, error = %e, "api key unseal failed");
                let _ = tx
                    .send(TurnEvent::Error {
                        text: "Your stored API key could not be read. Please re-enter it in Settings.".to_string(),
                    })
                    .await;
                return Ok(());
            }
        };
        let provider = match (self.provider_factory)(&settings, api_key) {
            Ok(p) => p,
            Err(e) => {
                let _ = tx
                    .send(TurnEvent::Error {
                        text: format!("Provider setup failed: {e}"),
                    })
                    .await;
                return Ok(());
            }
        };

        let message_received_utc = Utc::now();
        let mut scope = TurnScope::start(user_id);
        let tz_name = settings.timezone.clone();

        // Image pre-analysis: non-fatal, appended as bracketed context.
        let mut image_context = String::new();
        if let Some(bytes) = image_bytes {
            let req = ChatRequest::new(
                provider.utility_model(),
                "",
                vec![ChatMessage::user(
                    "Describe the salient health-related details of this image (food, labels, \
                     readings, amounts). Be concise.",
                )],
            );
            match provider.chat_with_vision(&req, bytes).await {
                Ok(resp) => {
                    scope.record_vision(resp.tokens_in, resp.tokens_out);
                    if !resp.content.trim().is_empty() {
                        image_context = format!("\n[Image analysis: {}]", resp.content.trim());
                    }
                }
                Err(e) => {
                    warn!(error = %e, "image analysis failed; continuing text-only");
                    scope.record_failure(ModelTier::Utility, "image_analysis", &e.to_string());
                }
            }
        }
        let combined_input = format!("{message}{image_context}");

        // Time-confirmation gate against the previous low-confidence write.
        let gate = {
            let conn = self.store.conn();
            timegate::handle_pending_confirmation(
                &conn,
                user_id,
                message,
                message_received_utc,
                tz_name.as_deref(),
            )?
        };

        // Intent classification (heuristic fallback under budget/errors).
        let (specialist_override, enabled_specialists, overrides) = {
            let conn = self.store.conn();
            let sc = users::get_specialist_config(&conn, user_id)?;
            let overrides = specialists::parse_overrides(sc.specialist_overrides.as_deref());
            let enabled = specialists::enabled_specialist_ids(&overrides);
            let active = (sc.active_specialist != "auto").then(|| sc.active_specialist.clone());
            (active, enabled, overrides)
        };
        let classify_allow_model =
            (scope.utility_calls as u32) < self.config.budget.limit_for(false);
        let intent = router::classify_intent(
            provider.as_ref(),
            &combined_input,
            specialist_override.as_deref(),
            &enabled_specialists,
            classify_allow_model,
            &mut scope,
        )
        .await;
        let category = intent.category;
        let specialist = intent.specialist.clone();
        scope.set_intent(&specialist, category);
        let specialist_name = specialists::resolve_specialist_name(&overrides, &specialist);
        let budget = UtilityBudget::for_category(&self.config.budget, category);

        // Low-signal proactive check-in: deterministic reply, no model call,
        // no log mutation.
        if checkin::is_low_signal_checkin(message) && category == IntentCategory::GeneralChat {
            let reply = {
                let conn = self.store.conn();
                checkin::compose_proactive_reply(&conn, user_id)?
            };
            let assistant_id = {
                let conn = self.store.conn();
                messages::insert_message(&conn, &messages::NewMessage::user(user_id, message, image_bytes.is_some()))?;
                messages::insert_message(
                    &conn,
                    &messages::NewMessage::assistant(
                        user_id,
                        &reply,
                        &specialist,
                        "rule_based_checkin",
                        0,
                        0,
                    ),
                )?
            };
            scope.mark_first_token();
            let _ = tx.send(TurnEvent::Chunk { text: reply }).await;
            let _ = tx
                .send(TurnEvent::Done {
                    specialist: specialist.clone(),
                    category,
                })
                .await;
            self.flush_telemetry(scope, Some(assistant_id));
            return Ok(());
        }

        // Auto-capture product feedback attributed to the active specialist.
        feedback::capture_feedback_if_needed(
            &self.store,
            provider.as_ref(),
            user_id,
            message,
            &specialist,
            &specialist_name,
            &budget,
            &mut scope,
        )
        .await?;

        // Pure menu commands skip the log-parse path entirely.
        let (menu_save, menu_update) = {
            let conn = self.store.conn();
            (
                menu::has_menu_save_intent(&conn, user_id, message)?,
                menu::has_menu_update_intent(&conn, user_id, message)?,
            )
        };
        let menu_command_only =
            (menu_save || menu_update) && !menu::looks_like_food_logging_message(message);
        let mut menu_action_result: Option<Value> = if menu_command_only {
            let conn = self.store.conn();
            let latest = vital_store::logs::latest_food_log(&conn, user_id, 72)?;
            menu::try_handle_menu_template_action(
                &conn,
                &self.registry,
                &self.config,
                user_id,
                message,
                latest.as_ref(),
                message_received_utc,
            )?
        } else {
            None
        };

        // Structured log parse + single-transaction write.
        let mut parsed_log: Option<Value> = None;
        let mut saved_out: Option<Value> = None;
        let mut write_error: Option<String> = None;
        if category.is_log() && !menu_command_only && !gate.skip_log_parse {
            let profile_hint = match settings.current_weight_kg {
                Some(kg) if settings.weight_unit == "lb" => {
                    format!("Weight: {:.1}lb", kg_to_lb(kg))
                }
                Some(kg) => format!("Weight: {kg}kg"),
                None => String::new(),
            };
            let mut payload = parser::parse_log_data(
                provider.as_ref(),
                &combined_input,
                category,
                &profile_hint,
                budget.can_call(&scope, &format!("log_parse:{category}")),
                &mut scope,
            )
            .await;

            if category == IntentCategory::LogSleep {
                payload = payload.map(|p| normalize_sleep_payload(message, p));
            }
            payload = payload.map(|p| {
                apply_inferred_event_time(
                    category,
                    message,
                    p,
                    message_received_utc,
                    tz_name.as_deref(),
                )
            });

            if let Some(payload) = payload {
                if let Some(obj) = payload.as_object() {
                    let (parse_confidence, missing) = assess_parse_confidence(obj, category);
                    tracing::debug!(
                        %category,
                        confidence = %parse_confidence,
                        missing = missing.len(),
                        "parse confidence assessed"
                    );
                }
                match self.save_structured_log(user_id, category, &payload, message_received_utc) {
                    Ok(out) => saved_out = Some(out),
                    Err(e) => {
                        warn!(%category, error = %e, "structured log write failed");
                        write_error = Some(e.to_string());
                    }
                }
                parsed_log = Some(payload);
            }
        }

        // Menu actions driven by the current turn's food log.
        if menu_action_result.is_none() {
            let conn = self.store.conn();
            let source = saved_out
                .as_ref()
                .and_then(|o| o.get("food_log_id"))
                .and_then(Value::as_i64)
                .and_then(|id| vital_store::logs::get_food_log(&conn, user_id, id).ok().flatten());
            menu_action_result = menu::try_handle_menu_template_action(
                &conn,
                &self.registry,
                &self.config,
                user_id,
                message,
                source.as_ref(),
                message_received_utc,
            )?;
        }
        let menu_followup_hint = {
            let conn = self.store.conn();
            menu::build_menu_followup_hint(
                &conn,
                user_id,
                category == IntentCategory::LogFood,
                message,
                parsed_log.as_ref(),
                saved_out.as_ref(),
                menu_action_result.as_ref(),
            )?
        };

        // Profile auto-sync (confidence-gated for non-log categories).
        let mut profile_refs = ProfileSyncOutcome::default();
        let mut should_profile_sync = image_bytes.is_some()
            || matches!(
                category,
                IntentCategory::LogSupplement
                    | IntentCategory::AskSupplement
                    | IntentCategory::AskMedical
                    | IntentCategory::AskNutrition
                    | IntentCategory::GeneralChat
            );
        if should_profile_sync
            && image_bytes.is_none()
            && !category.is_log()
            && intent.confidence < 0.6
        {
            should_profile_sync = false;
        }
        if should_profile_sync {
            profile_refs = profile_sync::apply_profile_updates(
                &self.store,
                &self.registry,
                &self.config,
                provider.as_ref(),
                user_id,
                message,
                &combined_input,
                category,
                message_received_utc,
                &budget,
                &mut scope,
            )
            .await?;
        }

        // Checklist sync (meds + supplements) from merged extraction output.
        {
            let conn = self.store.conn();
            checklist_sync::mark_checklist_for_medications(
                &conn,
                &self.registry,
                &self.config,
                user_id,
                &combined_input,
                message_received_utc,
                &profile_refs.matched_medications,
            )?;
            checklist_sync::mark_checklist_for_supplements(
                &conn,
                &self.registry,
                &self.config,
                user_id,
                &combined_input,
                message_received_utc,
                &profile_refs.matched_supplements,
            )?;
        }

        // Goal sync.
        let goal_sync_result: GoalSyncOutcome = goal_sync::apply_goal_updates(
            &self.store,
            &self.registry,
            &self.config,
            provider.as_ref(),
            user_id,
            message,
            message_received_utc,
            &budget,
            &mut scope,
        )
        .await
        .unwrap_or_else(|e| {
            warn!(error = %e, "goal sync from chat failed");
            GoalSyncOutcome::default()
        });

        // Optional live web search on a worker thread.
        let mut web_results: Vec<Value> = Vec::new();
        if self.should_use_web_search(message, category, &specialist) {
            let store = Arc::clone(&self.store);
            let registry = Arc::clone(&self.registry);
            let config = Arc::clone(&self.config);
            let query = message.to_string();
            let specialist_for_search = specialist.clone();
            let max_results = self.config.web_search.web_search_max_results as i64;
            let search = tokio::task::spawn_blocking(move || {
                let conn = store.conn();
                let ctx = ToolContext::new(
                    &conn,
                    user_id,
                    &specialist_for_search,
                    Utc::now(),
                    &config,
                );
                registry.execute(
                    "web_search",
                    &json!({ "query": query, "max_results": max_results }),
                    &ctx,
                )
            })
            .await;
            match search {
                Ok(Ok(out)) => {
                    web_results = out
                        .get("results")
                        .and_then(Value::as_array)
                        .cloned()
                        .unwrap_or_default();
                }
                Ok(Err(e)) => warn!(error = %e, "web_search tool failed"),
                Err(e) => warn!(error = %e, "web_search worker failed"),
            }
        }

        // Authoritative time context when the user asks for the time/date.
        let mut time_context = String::new();
        if should_include_time_context(message) {
            let conn = self.store.conn();
            let ctx = ToolContext::new(&conn, user_id, &specialist, message_received_utc, &self.config);
            match self.registry.execute("time_now", &json!({}), &ctx) {
                Ok(out) => time_context = format_time_context(&out),
                Err(e) => warn!(error = %e, "time_now tool failed"),
            }
        }

        // Debounced background analysis dispatch. Never blocks the turn.
        self.dispatcher
            .maybe_dispatch(Arc::clone(&self.store), Arc::clone(&self.sealer), user_id)
            .await;

        // Context assembly: built sections + dynamic turn blocks.
        let mut system_context = {
            let conn = self.store.conn();
            let settings = users::get_settings(&conn, user_id)?;
            let sc = users::get_specialist_config(&conn, user_id)?;
            self.context_builder.build_context(
                &conn,
                &user,
                &settings,
                &sc,
                &specialist,
                Some(category),
            )?
        };
        let mut append = |block: String| {
            if !block.trim().is_empty() {
                system_context.push_str("\n\n");
                system_context.push_str(block.trim());
            }
        };
        append(format_web_search_context(&web_results));
        append(time_context);
        append(menu::format_menu_context(
            menu_action_result.as_ref(),
            menu_followup_hint.as_ref(),
        ));
        append(build_log_write_context(
            category,
            parsed_log.as_ref(),
            saved_out.as_ref(),
            write_error.as_deref(),
        ));
        append(build_time_inference_context(parsed_log.as_ref()));
        append(gate.context.clone());
        append(verbosity_style_context(VerbosityMode::parse(verbosity)));
        if goal_sync_result.created > 0 || goal_sync_result.updated > 0 {
            append(format!(
                "[Goal sync completed this turn: created={}, updated={}. Acknowledge changes succinctly.]",
                goal_sync_result.created, goal_sync_result.updated
            ));
        }

        // Conversation history + the current turn.
        let mut chat_messages: Vec<ChatMessage> = {
            let conn = self.store.conn();
            messages::recent_messages(&conn, user_id, 20)?
                .iter()
                .map(|m| ChatMessage {
                    role: if m.role == "assistant" {
                        Role::Assistant
                    } else {
                        Role::User
                    },
                    content: m.content.clone(),
                })
                .collect()
        };
        chat_messages.push(ChatMessage::user(combined_input.clone()));

        // Persist the user message before streaming starts.
        let user_message_id = {
            let conn = self.store.conn();
            messages::insert_message(
                &conn,
                &messages::NewMessage::user(user_id, message, image_bytes.is_some()),
            )?
        };

        // Energy/GI chatter becomes a meal response signal when bindable.
        {
            let conn = self.store.conn();
            if let Err(e) = signals::capture_meal_response_signal(
                &conn,
                &self.registry,
                &self.config,
                user_id,
                message,
                Some(user_message_id),
                message_received_utc,
            ) {
                warn!(error = %e, "meal response capture failed");
            }
        }

        // Streaming generation with the reasoning model.
        let reasoning_model = provider.reasoning_model().to_string();
        let request = ChatRequest::new(&reasoning_model, &system_context, chat_messages);
        let (stream_tx, mut stream_rx) = mpsc::channel::<StreamEvent>(64);

        let mut full_response = String::new();
        let mut tokens_in = 0u32;
        let mut tokens_out = 0u32;
        let mut stream_failed = false;

        let stream_result = tokio::join!(
            provider.chat_stream(&request, stream_tx),
            async {
                while let Some(event) = stream_rx.recv().await {
                    match event {
                        StreamEvent::Chunk { text } => {
                            if !text.is_empty() {
                                scope.mark_first_token();
                                full_response.push_str(&text);
                                let _ = tx.send(TurnEvent::Chunk { text }).await;
                            }
                        }
                        StreamEvent::Done {
                            tokens_in: tin,
                            tokens_out: tout,
                            ..
                        } => {
                            tokens_in = tin;
                            tokens_out = tout;
                        }
                        StreamEvent::Error { message } => {
                            warn!(error = %message, "stream error event");
                            stream_failed = true;
                        }
                    }
                }
            }
        );

        if let Err(e) = stream_result.0 {
            warn!(error = %e, "ai generation failed");
            scope.record_failure(ModelTier::Reasoning, "chat_generate", &e.to_string());
            let error_msg = "I encountered an error generating a response. Please try again.";
            full_response = error_msg.to_string();
            let _ = tx
                .send(TurnEvent::Error {
                    text: error_msg.to_string(),
                })
                .await;
            let _ = tx
                .send(TurnEvent::Done {
                    specialist: specialist.clone(),
                    category,
                })
                .await;
        } else if stream_failed {
            scope.record_failure(ModelTier::Reasoning, "chat_generate", "stream error event");
            let error_msg = "The response stream was interrupted. Please try again.";
            if full_response.is_empty() {
                full_response = error_msg.to_string();
            }
            let _ = tx
                .send(TurnEvent::Error {
                    text: error_msg.to_string(),
                })
                .await;
            let _ = tx
                .send(TurnEvent::Done {
                    specialist: specialist.clone(),
                    category,
                })
                .await;
        } else {
            scope.record_call(ModelTier::Reasoning, tokens_in, tokens_out);

            // Post-stream amendments the model may have skipped.
            let followup_line = menu::followup_line_from_hint(menu_followup_hint.as_ref());
            if !followup_line.is_empty()
                && !menu::response_already_has_followup(&full_response, menu_followup_hint.as_ref())
            {
                let append_text = if full_response.is_empty() {
                    followup_line
                } else {
                    format!("\n\n{followup_line}")
                };
                full_response.push_str(&append_text);
                let _ = tx.send(TurnEvent::Chunk { text: append_text }).await;
            }
            if let Some(goal_followup) =
                goal_sync::goal_sync_followup_text(&goal_sync_result, &full_response)
            {
                let append_text = if full_response.is_empty() {
                    goal_followup
                } else {
                    format!("\n\n{goal_followup}")
                };
                full_response.push_str(&append_text);
                let _ = tx.send(TurnEvent::Chunk { text: append_text }).await;
            }

            let _ = tx
                .send(TurnEvent::Done {
                    specialist: specialist.clone(),
                    category,
                })
                .await;
        }

        // Assistant message, then turn telemetry, in that order.
        let assistant_id = {
            let conn = self.store.conn();
            messages::insert_message(
                &conn,
                &messages::NewMessage::assistant(
                    user_id,
                    &full_response,
                    &specialist,
                    &reasoning_model,
                    tokens_in as i64,
                    tokens_out as i64,
                ),
            )?
        };
        info!(
            user_id,
            specialist = %specialist,
            category = %category,
            chars = full_response.len(),
            "turn complete"
        );
        self.flush_telemetry(scope, Some(assistant_id));
        Ok(())
    }

    fn flush_telemetry(&self, scope: TurnScope, message_id: Option<i64>) {
        let event = scope.into_event(message_id);
        let conn = self.store.conn();
        if let Err(e) = telemetry::persist_ai_turn_event(&conn, &event) {
            warn!(error = %e, "ai turn telemetry persistence failed");
        }
    }

    /// Run the category-specific write tool inside one transaction, and
    /// attach the low-confidence time-confirmation notification in the same
    /// commit.
    fn save_structured_log(
        &self,
        user_id: i64,
        category: IntentCategory,
        payload: &Value,
        reference_utc: DateTime<Utc>,
    ) -> std::result::Result<Value, crate::tools::ToolError> {
        let (tool, args) = match category {
            IntentCategory::LogFood => (
                "food_log_write",
                json!({
                    "logged_at": payload.get("logged_at").or(payload.get("event_time")),
                    "meal_label": payload.get("meal_label"),
                    "items": payload.get("items").cloned().unwrap_or_else(|| json!([])),
                    "calories": payload.get("calories"),
                    "protein_g": payload.get("protein_g"),
                    "carbs_g": payload.get("carbs_g"),
                    "fat_g": payload.get("fat_g"),
                    "fiber_g": payload.get("fiber_g"),
                    "sodium_mg": payload.get("sodium_mg"),
                    "notes": payload.get("notes"),
                    "servings": payload.get("servings"),
                    "use_template_if_found": true,
                }),
            ),
            IntentCategory::LogVitals => (
                "vitals_log_write",
                json!({
                    "logged_at": payload.get("logged_at").or(payload.get("event_time")),
                    "weight_kg": payload.get("weight_kg"),
                    "bp_systolic": payload.get("bp_systolic"),
                    "bp_diastolic": payload.get("bp_diastolic"),
                    "heart_rate": payload.get("heart_rate"),
                    "blood_glucose": payload.get("blood_glucose"),
                    "temperature_c": payload.get("temperature_c"),
                    "spo2": payload.get("spo2"),
                    "notes": payload.get("notes"),
                }),
            ),
            IntentCategory::LogExercise => (
                "exercise_log_write",
                json!({
                    "logged_at": payload.get("logged_at").or(payload.get("event_time")),
                    "exercise_type": payload.get("exercise_type").cloned().unwrap_or_else(|| json!("other")),
                    "duration_minutes": payload.get("duration_minutes"),
                    "details": payload.get("details"),
                    "max_hr": payload.get("max_hr"),
                    "avg_hr": payload.get("avg_hr"),
                    "calories_burned": payload.get("calories_burned"),
                    "notes": payload.get("notes"),
                }),
            ),
            IntentCategory::LogSupplement => (
                "supplement_log_write",
                json!({
                    "logged_at": payload.get("logged_at").or(payload.get("event_time")),
                    "supplements": payload.get("supplements").cloned().unwrap_or_else(|| json!([])),
                    "timing": payload.get("timing"),
                    "notes": payload.get("notes"),
                }),
            ),
            IntentCategory::LogFasting => (
                "fasting_manage",
                json!({
                    "action": payload.get("action").cloned().unwrap_or_else(|| json!("start")),
                    "fast_start": payload.get("fast_start"),
                    "fast_end": payload.get("fast_end"),
                    "fast_type": payload.get("fast_type"),
                    "notes": payload.get("notes"),
                }),
            ),
            IntentCategory::LogSleep => (
                "sleep_log_write",
                json!({
                    "action": payload.get("action"),
                    "sleep_start": payload.get("sleep_start"),
                    "sleep_end": payload.get("sleep_end"),
                    "duration_minutes": payload.get("duration_minutes"),
                    "quality": payload.get("quality"),
                    "notes": payload.get("notes"),
                }),
            ),
            IntentCategory::LogHydration => (
                "hydration_log_write",
                json!({
                    "logged_at": payload.get("logged_at").or(payload.get("event_time")),
                    "amount_ml": payload.get("amount_ml").cloned().unwrap_or_else(|| json!(250)),
                    "source": payload.get("source").cloned().unwrap_or_else(|| json!("water")),
                    "notes": payload.get("notes"),
                }),
            ),
            _ => {
                return Err(crate::tools::ToolError::Validation(format!(
                    "{category} is not a logging category"
                )))
            }
        };

        let mut guard = self.store.conn();
        let conn: &mut rusqlite::Connection = &mut guard;
        let sp = conn.transaction().map_err(vital_store::StoreError::from)?;
        let out = {
            let ctx = ToolContext::new(&sp, user_id, "orchestrator", reference_utc, &self.config);
            let out = self.registry.execute(tool, &args, &ctx)?;
            timegate::persist_low_confidence_confirmation(&sp, user_id, category, payload, &out)
                .map_err(|e| {
                    crate::tools::ToolError::Validation(format!("confirmation persist failed: {e}"))
                })?;
            out
        };
        sp.commit().map_err(vital_store::StoreError::from)?;
        Ok(out)
    }

    fn should_use_web_search(
        &self,
        message: &str,
        category: IntentCategory,
        specialist_id: &str,
    ) -> bool {
        let ws = &self.config.web_search;
        if !ws.enable_web_search {
            return false;
        }
        if !ws
            .web_search_allowed_specialists
            .iter()
            .any(|s| s == specialist_id)
        {
            return false;
        }
        let text = message.to_lowercase();
        if WEB_SEARCH_TRIGGERS.iter().any(|t| text.contains(t)) {
            return true;
        }
        WEB_SEARCH_CATEGORIES.contains(&category)
    }
}

// ---------------------------------------------------------------------------
// Payload post-processing
// ---------------------------------------------------------------------------

/// Post-normalize a parsed sleep payload against text cues and clock tokens.
fn normalize_sleep_payload(message: &str, mut payload: Value) -> Value {
    let Some(obj) = payload.as_object_mut() else {
        return payload;
    };
    let text = message.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ");

    let mut action = obj
        .get("action")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_lowercase();
    if !["start", "end", "auto"].contains(&action.as_str()) {
        let has_start = SLEEP_START_CUES.iter().any(|c| text.contains(c));
        let has_end = SLEEP_END_CUES.iter().any(|c| text.contains(c));
        action = if has_end && !has_start {
            "end".to_string()
        } else if has_start && !has_end {
            "start".to_string()
        } else {
            "auto".to_string()
        };
    }
    obj.insert("action".to_string(), json!(action));

    if let Some(token) = parser::extract_time_token(&text) {
        let is_empty = |key: &str| {
            obj.get(key)
                .map(|v| v.is_null() || v.as_str().map(|s| s.is_empty()).unwrap_or(false))
                .unwrap_or(true)
        };
        if action == "start" && is_empty("sleep_start") {
            obj.insert("sleep_start".to_string(), json!(token));
        } else if action == "end" && is_empty("sleep_end") {
            obj.insert("sleep_end".to_string(), json!(token));
        }
    }
    payload
}

/// Fill missing event time fields from inference and tag the payload with the
/// inference confidence + reason.
fn apply_inferred_event_time(
    category: IntentCategory,
    message: &str,
    mut payload: Value,
    reference_utc: DateTime<Utc>,
    tz_name: Option<&str>,
) -> Value {
    let Some(obj) = payload.as_object_mut() else {
        return payload;
    };
    let inference = infer_event_datetime(message, Some(reference_utc), tz_name);
    let inferred_iso = inference.event_utc.to_rfc3339();

    let is_empty = |obj: &serde_json::Map<String, Value>, key: &str| {
        obj.get(key)
            .map(|v| v.is_null() || v.as_str().map(|s| s.trim().is_empty()).unwrap_or(false))
            .unwrap_or(true)
    };
    let mut attach = false;

    match category {
        IntentCategory::LogFood
        | IntentCategory::LogVitals
        | IntentCategory::LogExercise
        | IntentCategory::LogHydration
        | IntentCategory::LogSupplement => {
            if is_empty(obj, "logged_at") && is_empty(obj, "event_time") {
                obj.insert("logged_at".to_string(), json!(inferred_iso));
                attach = true;
            }
        }
        IntentCategory::LogFasting => {
            let action = obj.get("action").and_then(Value::as_str).unwrap_or("");
            if action == "start" && is_empty(obj, "fast_start") {
                obj.insert("fast_start".to_string(), json!(inferred_iso));
                attach = true;
            } else if action == "end" && is_empty(obj, "fast_end") {
                obj.insert("fast_end".to_string(), json!(inferred_iso));
                attach = true;
            }
        }
        IntentCategory::LogSleep => {
            let action = obj.get("action").and_then(Value::as_str).unwrap_or("");
            if action == "start" && is_empty(obj, "sleep_start") {
                obj.insert("sleep_start".to_string(), json!(inferred_iso));
                attach = true;
            } else if action == "end" && is_empty(obj, "sleep_end") {
                obj.insert("sleep_end".to_string(), json!(inferred_iso));
                attach = true;
            }
        }
        _ => {}
    }

    if attach {
        obj.insert(
            INFERRED_CONFIDENCE_KEY.to_string(),
            json!(inference.confidence.as_str()),
        );
        obj.insert(INFERRED_REASON_KEY.to_string(), json!(inference.reason));
    }
    payload
}

// ---------------------------------------------------------------------------
// Dynamic context blocks
// ---------------------------------------------------------------------------

fn build_log_write_context(
    category: IntentCategory,
    parsed_log: Option<&Value>,
    saved_out: Option<&Value>,
    write_error: Option<&str>,
) -> String {
    if !category.is_log() {
        return String::new();
    }
    if saved_out.is_some() {
        return "## Write Status\n- Structured log write: success\n- You may confirm this event as saved."
            .to_string();
    }
    if parsed_log.is_some() {
        let reason = write_error.unwrap_or("unknown").trim();
        let reason = if reason.is_empty() { "unknown" } else { reason };
        return format!(
            "## Write Status\n- Structured log write: failed\n- Failure reason: {reason}\n\
             - Do not claim this event was saved.\n- Tell the user save failed and ask them to retry."
        );
    }
    "## Write Status\n- No structured payload could be extracted for this logging intent.\n\
     - Do not claim this event was saved."
        .to_string()
}

fn build_time_inference_context(parsed_log: Option<&Value>) -> String {
    let Some(payload) = parsed_log else {
        return String::new();
    };
    let confidence = payload
        .get(INFERRED_CONFIDENCE_KEY)
        .and_then(Value::as_str)
        .and_then(Confidence::parse);
    if confidence != Some(Confidence::Low) {
        return String::new();
    }
    let reason = payload
        .get(INFERRED_REASON_KEY)
        .and_then(Value::as_str)
        .filter(|r| !r.is_empty())
        .unwrap_or("unknown");
    format!(
        "## Time Confirmation\nEvent time was inferred with low confidence.\n\
         - Inference reason: {reason}\n\
         - In your reply, include one short confirmation question about the logged time/date.\n\
         - Keep the log as recorded unless the user corrects it."
    )
}

fn verbosity_style_context(mode: VerbosityMode) -> String {
    match mode {
        VerbosityMode::Summarized => "## Response Style Override\n\
             Use summarized mode for this reply.\n\
             - Be concise and easy to scan.\n\
             - Prefer short bullets or very short sections.\n\
             - Keep only the most relevant context and actions.\n\
             - Avoid motivational filler or long explanations.\n\
             - If this is a logging response, still include totals/macros when applicable.\n\
             - End with one concrete next step."
            .to_string(),
        VerbosityMode::Straight => "## Response Style Override\n\
             Use straight-to-the-point mode for this reply.\n\
             - Be direct, minimal, and actionable.\n\
             - Default to 2-4 short lines.\n\
             - No long preambles, no motivational filler, no emoji.\n\
             - Avoid numbered lists unless the user explicitly asks for a list.\n\
             - Keep explanation to essentials unless safety requires more detail.\n\
             - If this is a logging response, still include totals/macros when applicable.\n\
             - End with one concrete next step."
            .to_string(),
        VerbosityMode::Normal => String::new(),
    }
}

fn should_include_time_context(message: &str) -> bool {
    let text = message.to_lowercase();
    TIME_QUERY_RES.iter().any(|re| re.is_match(&text))
}

fn format_time_context(result: &Value) -> String {
    let timezone = result.get("timezone").and_then(Value::as_str).unwrap_or("UTC");
    let offset = result
        .get("utc_offset")
        .and_then(Value::as_str)
        .unwrap_or("UTC+00:00");
    let local_date = result.get("local_date").and_then(Value::as_str).unwrap_or("");
    let time_12h = result
        .get("local_time_12h")
        .and_then(Value::as_str)
        .unwrap_or("");
    let time_24h = result
        .get("local_time_24h")
        .and_then(Value::as_str)
        .unwrap_or("");
    let iso_local = result.get("iso_local").and_then(Value::as_str).unwrap_or("");
    if local_date.is_empty() && time_12h.is_empty() && time_24h.is_empty() {
        return String::new();
    }

    let mut lines = vec![
        "## Current Time".to_string(),
        "Use this as the authoritative current date/time for this response.".to_string(),
        format!("- Timezone: {timezone} ({offset})"),
    ];
    if !local_date.is_empty() {
        lines.push(format!("- Local date: {local_date}"));
    }
    if !time_12h.is_empty() {
        lines.push(format!("- Local time (12h): {time_12h}"));
    }
    if !time_24h.is_empty() {
        lines.push(format!("- Local time (24h): {time_24h}"));
    }
    if !iso_local.is_empty() {
        lines.push(format!("- ISO local: {iso_local}"));
    }
    lines.join("\n")
}

fn format_web_search_context(results: &[Value]) -> String {
    if results.is_empty() {
        return String::new();
    }
    let mut lines = vec![
        "## Live Web Search Results".to_string(),
        "Use these current references when relevant. Cite URLs when making claims from these results."
            .to_string(),
    ];
    for (idx, row) in results.iter().enumerate() {
        let title = row
            .get("title")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("Result {}", idx + 1));
        lines.push(format!("{}. {title}", idx + 1));
        if let Some(source) = row.get("source").and_then(Value::as_str).filter(|s| !s.is_empty()) {
            lines.push(format!("   Source: {source}"));
        }
        if let Some(url) = row.get("url").and_then(Value::as_str).filter(|s| !s.is_empty()) {
            lines.push(format!("   URL: {url}"));
        }
        if let Some(snippet) = row
            .get("snippet")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
        {
            lines.push(format!("   Snippet: {snippet}"));
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Timelike;
    use vital_core::timeinfer::resolve_tz;
    use vital_provider::ChatResponse;
    use vital_store::users::{create_user, set_settings_field};

    /// Scripted provider: answers are selected by the calling prompt's
    /// system text, streaming emits fixed chunks.
    struct ScriptedProvider {
        classify: String,
        stream_chunks: Vec<&'static str>,
        fail_stream: bool,
    }

    impl ScriptedProvider {
        fn new(classify: &str) -> Self {
            Self {
                classify: classify.to_string(),
                stream_chunks: vec!["Got it. ", "Logged and noted."],
                fail_stream: false,
            }
        }
    }

    #[async_trait]
    impl AiProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }
        fn reasoning_model(&self) -> &str {
            "reason-1"
        }
        fn utility_model(&self) -> &str {
            "util-1"
        }
        fn deep_thinking_model(&self) -> &str {
            "deep-1"
        }

        async fn chat(
            &self,
            req: &ChatRequest,
        ) -> std::result::Result<ChatResponse, ProviderError> {
            let content = if req.system.contains("classification assistant") {
                self.classify.clone()
            } else if req.system.contains("strict data extraction") {
                r#"{"medications":[],"supplements":[],"matched_medications":[],
                    "matched_supplements":[],"medical_conditions":[],
                    "dietary_preferences":[],"health_goals":[],"family_history":[]}"#
                    .to_string()
            } else if req.system.contains("data extraction assistant") {
                // Force the deterministic parser fallback.
                "not json".to_string()
            } else if req.system.contains("Extract goal create/update") {
                r#"{"action":"none","create_goals":[],"update_goals":[]}"#.to_string()
            } else if req.system.contains("product feedback") {
                r#"{"entries":[]}"#.to_string()
            } else {
                "ok".to_string()
            };
            Ok(ChatResponse {
                content,
                model: req.model.clone(),
                tokens_in: 10,
                tokens_out: 10,
            })
        }

        async fn chat_stream(
            &self,
            req: &ChatRequest,
            tx: mpsc::Sender<StreamEvent>,
        ) -> std::result::Result<(), ProviderError> {
            if self.fail_stream {
                return Err(ProviderError::Api {
                    status: 500,
                    message: "stream down".to_string(),
                });
            }
            for chunk in &self.stream_chunks {
                let _ = tx
                    .send(StreamEvent::Chunk {
                        text: chunk.to_string(),
                    })
                    .await;
            }
            let _ = tx
                .send(StreamEvent::Done {
                    model: req.model.clone(),
                    tokens_in: 40,
                    tokens_out: 12,
                })
                .await;
            Ok(())
        }

        async fn chat_with_vision(
            &self,
            req: &ChatRequest,
            _image: &[u8],
        ) -> std::result::Result<ChatResponse, ProviderError> {
            self.chat(req).await
        }

        async fn validate_key(&self) -> std::result::Result<bool, ProviderError> {
            Ok(true)
        }
    }

    fn test_agent(provider: ScriptedProvider) -> (Arc<Agent>, Arc<Store>, i64) {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let user_id = {
            let conn = store.conn();
            let user = create_user(&conn, "robin", "Robin").unwrap();
            set_settings_field(&conn, user.id, "api_key_sealed", Some("sk-test")).unwrap();
            set_settings_field(&conn, user.id, "timezone", Some("America/Edmonton")).unwrap();
            user.id
        };
        let mut config = VitalConfig::default();
        config.analysis.analysis_autorun_on_chat = false;
        let sealer = Arc::new(KeySealer::from_master_key_b64("").unwrap());
        let provider = Arc::new(provider);
        let agent = Agent::new(Arc::clone(&store), Arc::new(config), sealer)
            .with_provider_factory(Arc::new(move |_settings, _key| {
                let p = Arc::clone(&provider);
                Ok(Box::new(SharedProvider(p)) as Box<dyn AiProvider>)
            }));
        (Arc::new(agent), store, user_id)
    }

    /// Cheap clone-able wrapper so one scripted provider serves many turns.
    struct SharedProvider(Arc<ScriptedProvider>);

    #[async_trait]
    impl AiProvider for SharedProvider {
        fn name(&self) -> &str {
            self.0.name()
        }
        fn reasoning_model(&self) -> &str {
            self.0.reasoning_model()
        }
        fn utility_model(&self) -> &str {
            self.0.utility_model()
        }
        fn deep_thinking_model(&self) -> &str {
            self.0.deep_thinking_model()
        }
        async fn chat(
            &self,
            req: &ChatRequest,
        ) -> std::result::Result<ChatResponse, ProviderError> {
            self.0.chat(req).await
        }
        async fn chat_stream(
            &self,
            req: &ChatRequest,
            tx: mpsc::Sender<StreamEvent>,
        ) -> std::result::Result<(), ProviderError> {
            self.0.chat_stream(req, tx).await
        }
        async fn chat_with_vision(
            &self,
            req: &ChatRequest,
            image: &[u8],
        ) -> std::result::Result<ChatResponse, ProviderError> {
            self.0.chat_with_vision(req, image).await
        }
        async fn validate_key(&self) -> std::result::Result<bool, ProviderError> {
            self.0.validate_key().await
        }
    }

    async fn run_turn(agent: &Arc<Agent>, user_id: i64, message: &str) -> Vec<TurnEvent> {
        let (tx, mut rx) = mpsc::channel(64);
        agent.process_chat(user_id, message, None, None, tx).await;
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    fn chunk_text(events: &[TurnEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                TurnEvent::Chunk { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn preflight_without_key_emits_single_error() {
        let (agent, store, user_id) = test_agent(ScriptedProvider::new("{}"));
        {
            let conn = store.conn();
            set_settings_field(&conn, user_id, "api_key_sealed", None).unwrap();
        }
        let events = run_turn(&agent, user_id, "hello").await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], TurnEvent::Error { .. }));
        let conn = store.conn();
        assert!(messages::recent_messages(&conn, user_id, 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn food_log_turn_writes_row_and_streams() {
        let (agent, store, user_id) = test_agent(ScriptedProvider::new(
            r#"{"category":"log_food","specialist":"nutritionist","confidence":0.9}"#,
        ));
        let events = run_turn(&agent, user_id, "I had oatmeal and coffee for breakfast").await;

        // Streaming contract: chunks then a terminal done, no errors.
        assert!(matches!(
            events.last(),
            Some(TurnEvent::Done { category: IntentCategory::LogFood, .. })
        ));
        assert!(!events.iter().any(|e| matches!(e, TurnEvent::Error { .. })));

        let conn = store.conn();
        let foods = vital_store::logs::latest_food_log(&conn, user_id, 24)
            .unwrap()
            .expect("food log row written");
        assert_eq!(foods.meal_label.as_deref(), Some("Breakfast"));
        assert!(foods.items.contains("oatmeal"));
        assert!(foods.items.contains("coffee"));

        // Inferred breakfast time lands at 08:00 local (medium confidence),
        // so no time-confirmation notification exists.
        let tz = resolve_tz(Some("America/Edmonton"));
        assert_eq!(foods.logged_at.with_timezone(&tz).hour(), 8);
        assert!(timegate::latest_pending_confirmation(&conn, user_id)
            .unwrap()
            .is_none());

        // Chunks concatenate into the persisted assistant message.
        let history = messages::recent_messages(&conn, user_id, 10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, "user");
        assert_eq!(history[1].role, "assistant");
        assert_eq!(history[1].content, chunk_text(&events));

        // Budget containment for a log turn: at most one utility call.
        let utility_calls: i64 = conn
            .query_row(
                "SELECT utility_calls FROM ai_turn_telemetry WHERE user_id = ?1",
                [user_id],
                |r| r.get(0),
            )
            .unwrap();
        assert!(utility_calls <= 1, "utility_calls = {utility_calls}");
    }

    #[tokio::test]
    async fn low_confidence_time_triggers_confirmation_then_ack() {
        let (agent, store, user_id) = test_agent(ScriptedProvider::new(
            r#"{"category":"log_food","specialist":"nutritionist","confidence":0.9}"#,
        ));
        run_turn(&agent, user_id, "I drank a protein shake earlier").await;

        {
            let conn = store.conn();
            let (_, payload) = timegate::latest_pending_confirmation(&conn, user_id)
                .unwrap()
                .expect("pending confirmation created");
            assert_eq!(payload["field"], "logged_at");
            assert_eq!(payload["category"], "log_food");
            assert_eq!(payload["confidence"], "low");
        }

        // The next short "yes" confirms and marks the notification read.
        run_turn(&agent, user_id, "yes").await;
        let conn = store.conn();
        assert!(timegate::latest_pending_confirmation(&conn, user_id)
            .unwrap()
            .is_none());
        let notes = vital_store::notifications::list_notifications(&conn, user_id, false, 10)
            .unwrap();
        let confirmed = notes
            .iter()
            .find(|n| n.payload.as_deref().unwrap_or("").contains("time_confirmation"))
            .unwrap();
        assert!(confirmed.is_read);
        assert!(confirmed.payload.as_deref().unwrap().contains("\"confirmed\""));
    }

    #[tokio::test]
    async fn vitals_turn_records_bp_and_syncs_weight() {
        let (agent, store, user_id) = test_agent(ScriptedProvider::new(
            r#"{"category":"log_vitals","specialist":"safety_clinician","confidence":0.92}"#,
        ));
        run_turn(&agent, user_id, "weighed 82.5 kg, bp 128/84 hr 72 just now").await;

        let conn = store.conn();
        let now = Utc::now();
        let vitals = vital_store::logs::latest_vitals_between(
            &conn,
            user_id,
            now - chrono::Duration::hours(1),
            now + chrono::Duration::minutes(1),
        )
        .unwrap()
        .expect("vitals row written");
        assert_eq!(vitals.bp_systolic, Some(128));
        assert_eq!(vitals.bp_diastolic, Some(84));
        assert_eq!(vitals.heart_rate, Some(72));
        assert_eq!(vitals.weight_kg, Some(82.5));
        assert!((now - vitals.logged_at).num_minutes() < 2);

        let settings = users::get_settings(&conn, user_id).unwrap();
        assert_eq!(settings.current_weight_kg, Some(82.5));
    }

    #[tokio::test]
    async fn fasting_turns_never_double_open() {
        let (agent, store, user_id) = test_agent(ScriptedProvider::new(
            r#"{"category":"log_fasting","specialist":"nutritionist","confidence":0.9}"#,
        ));
        run_turn(&agent, user_id, "starting a fast").await;
        run_turn(&agent, user_id, "starting a fast").await;
        {
            let conn = store.conn();
            assert_eq!(vital_store::logs::open_fast_count(&conn, user_id).unwrap(), 1);
        }

        run_turn(&agent, user_id, "broke my fast").await;
        let conn = store.conn();
        assert_eq!(vital_store::logs::open_fast_count(&conn, user_id).unwrap(), 0);
        let rows = vital_store::logs::fasting_logs_started_between(
            &conn,
            user_id,
            Utc::now() - chrono::Duration::hours(1),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].duration_minutes.is_some());
    }

    #[tokio::test]
    async fn stream_failure_persists_best_effort_assistant_message() {
        let mut provider = ScriptedProvider::new(
            r#"{"category":"general_chat","specialist":"orchestrator","confidence":0.4}"#,
        );
        provider.fail_stream = true;
        let (agent, store, user_id) = test_agent(provider);
        let events = run_turn(&agent, user_id, "how are you").await;

        assert!(events.iter().any(|e| matches!(e, TurnEvent::Error { .. })));
        // Even error turns terminate with a done marker.
        assert!(matches!(events.last(), Some(TurnEvent::Done { .. })));

        let conn = store.conn();
        let history = messages::recent_messages(&conn, user_id, 10).unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[1].content.contains("error"));

        let failure_count: i64 = conn
            .query_row(
                "SELECT failure_count FROM ai_turn_telemetry WHERE user_id = ?1",
                [user_id],
                |r| r.get(0),
            )
            .unwrap();
        assert!(failure_count >= 1);
    }

    #[tokio::test]
    async fn proactive_checkin_answers_without_reasoning_call() {
        let (agent, store, user_id) = test_agent(ScriptedProvider::new(
            r#"{"category":"general_chat","specialist":"orchestrator","confidence":0.3}"#,
        ));
        let events = run_turn(&agent, user_id, "good morning").await;
        assert!(matches!(events.last(), Some(TurnEvent::Done { .. })));
        let text = chunk_text(&events);
        assert!(text.contains("Great check-in"));

        let conn = store.conn();
        let history = messages::recent_messages(&conn, user_id, 10).unwrap();
        assert_eq!(history[1].model_used.as_deref(), Some("rule_based_checkin"));
        let reasoning_calls: i64 = conn
            .query_row(
                "SELECT reasoning_calls FROM ai_turn_telemetry WHERE user_id = ?1",
                [user_id],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(reasoning_calls, 0);
    }

    #[tokio::test]
    async fn nonlog_turn_stays_within_utility_budget() {
        let (agent, store, user_id) = test_agent(ScriptedProvider::new(
            r#"{"category":"general_chat","specialist":"orchestrator","confidence":0.9}"#,
        ));
        run_turn(
            &agent,
            user_id,
            "let's talk about my health goals and targets for this month",
        )
        .await;
        let conn = store.conn();
        let utility_calls: i64 = conn
            .query_row(
                "SELECT utility_calls FROM ai_turn_telemetry WHERE user_id = ?1",
                [user_id],
                |r| r.get(0),
            )
            .unwrap();
        assert!(utility_calls <= 3, "utility_calls = {utility_calls}");
    }

    #[tokio::test]
    async fn chat_stream_spawns_and_terminates() {
        let (agent, _store, user_id) = test_agent(ScriptedProvider::new(
            r#"{"category":"general_chat","specialist":"orchestrator","confidence":0.7}"#,
        ));
        use tokio_stream::StreamExt;
        let mut stream = agent.chat_stream(
            user_id,
            "tell me something useful".to_string(),
            None,
            Some("straight".to_string()),
        );
        let mut saw_done = false;
        while let Some(event) = stream.next().await {
            if matches!(event, TurnEvent::Done { .. }) {
                saw_done = true;
            }
        }
        assert!(saw_done);
    }

    #[test]
    fn sleep_payload_normalization_fills_action_and_clock() {
        let payload = json!({"action": "weird", "sleep_start": null, "sleep_end": null});
        let out = normalize_sleep_payload("went to bed at 11pm", payload);
        assert_eq!(out["action"], "start");
        assert_eq!(out["sleep_start"], "11pm");

        let payload = json!({"action": null});
        let out = normalize_sleep_payload("woke up at 7am feeling fine", payload);
        assert_eq!(out["action"], "end");
        assert_eq!(out["sleep_end"], "7am");
    }

    #[test]
    fn inferred_time_only_fills_missing_fields() {
        let reference = DateTime::parse_from_rfc3339("2026-02-21T16:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        // Explicit logged_at is preserved untouched.
        let payload = json!({"logged_at": "2026-02-20T10:00:00Z", "items": []});
        let out = apply_inferred_event_time(
            IntentCategory::LogFood,
            "I had eggs",
            payload,
            reference,
            Some("UTC"),
        );
        assert_eq!(out["logged_at"], "2026-02-20T10:00:00Z");
        assert!(out.get(INFERRED_CONFIDENCE_KEY).is_none());

        // Missing logged_at gets the inference plus metadata.
        let payload = json!({"logged_at": null, "items": []});
        let out = apply_inferred_event_time(
            IntentCategory::LogFood,
            "I had eggs for breakfast",
            payload,
            reference,
            Some("America/Edmonton"),
        );
        assert_eq!(out[INFERRED_CONFIDENCE_KEY], "medium");
        assert!(out["logged_at"].as_str().unwrap().contains("2026-02-21"));
    }

    #[test]
    fn write_status_blocks_reflect_outcome() {
        let ok = build_log_write_context(
            IntentCategory::LogFood,
            Some(&json!({})),
            Some(&json!({"food_log_id": 1})),
            None,
        );
        assert!(ok.contains("success"));

        let failed = build_log_write_context(
            IntentCategory::LogFood,
            Some(&json!({})),
            None,
            Some("`amount_ml` must be > 0"),
        );
        assert!(failed.contains("failed"));
        assert!(failed.contains("amount_ml"));

        let none = build_log_write_context(IntentCategory::LogFood, None, None, None);
        assert!(none.contains("No structured payload"));

        assert!(build_log_write_context(IntentCategory::GeneralChat, None, None, None).is_empty());
    }

    #[test]
    fn time_query_patterns_match() {
        assert!(should_include_time_context("hey, what time is it?"));
        assert!(should_include_time_context("what's today's date"));
        assert!(!should_include_time_context("log my lunch at 1pm"));
    }
}
