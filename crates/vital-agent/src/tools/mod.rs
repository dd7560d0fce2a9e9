//! Tool registry: every structured mutation (and most structured reads on AI
//! paths) flows through a named, validated, read/write-tagged operation.
//!
//! Handlers are synchronous and run against the connection (or transaction)
//! in the [`ToolContext`]; commit/rollback belongs to the caller. User
//! scoping is applied inside each tool, never by the caller.

pub mod goals;
pub mod health;
pub mod time;
pub mod web;
pub mod write;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;
use vital_core::config::VitalConfig;

/// Tools the LLM may invoke through `<tool_call>` blocks. Everything else is
/// host-initiated only.
pub const AI_CALLABLE_TOOLS: &[&str] = &["create_goal", "update_goal"];

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{0}")]
    Validation(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Tool `{tool}` is not available to specialist `{specialist}`")]
    NotAllowed { tool: String, specialist: String },

    #[error("{0}")]
    NotFound(String),

    #[error("Store error: {0}")]
    Store(#[from] vital_store::StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type ToolResult = std::result::Result<Value, ToolError>;

pub struct ToolContext<'a> {
    pub conn: &'a Connection,
    pub user_id: i64,
    pub specialist_id: &'a str,
    pub reference_utc: DateTime<Utc>,
    pub config: &'a VitalConfig,
}

impl<'a> ToolContext<'a> {
    pub fn new(
        conn: &'a Connection,
        user_id: i64,
        specialist_id: &'a str,
        reference_utc: DateTime<Utc>,
        config: &'a VitalConfig,
    ) -> Self {
        Self {
            conn,
            user_id,
            specialist_id,
            reference_utc,
            config,
        }
    }

    pub fn settings(&self) -> Result<vital_store::types::UserSettings, ToolError> {
        Ok(vital_store::users::get_settings(self.conn, self.user_id)?)
    }

    pub fn timezone(&self) -> Option<String> {
        self.settings().ok().and_then(|s| s.timezone)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub required_fields: &'static [&'static str],
    pub read_only: bool,
    /// None = any specialist. The web_search tool additionally enforces the
    /// configured allow-list at execution time.
    pub allowed_specialists: Option<&'static [&'static str]>,
    pub tags: &'static [&'static str],
}

type ToolHandler = fn(&Map<String, Value>, &ToolContext<'_>) -> ToolResult;

struct ToolEntry {
    spec: ToolSpec,
    handler: ToolHandler,
}

pub struct ToolRegistry {
    entries: HashMap<&'static str, ToolEntry>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Registry with every built-in tool installed.
    pub fn with_default_tools() -> Self {
        let mut registry = Self::new();
        health::register_health_tools(&mut registry);
        write::register_write_tools(&mut registry);
        goals::register_goal_tools(&mut registry);
        time::register_time_tools(&mut registry);
        web::register_web_tools(&mut registry);
        registry
    }

    pub fn register(&mut self, spec: ToolSpec, handler: ToolHandler) {
        debug_assert!(
            !self.entries.contains_key(spec.name),
            "duplicate tool name: {}",
            spec.name
        );
        self.entries.insert(spec.name, ToolEntry { spec, handler });
    }

    pub fn spec(&self, name: &str) -> Option<&ToolSpec> {
        self.entries.get(name).map(|e| &e.spec)
    }

    pub fn tool_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.entries.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Validate and run a tool. Validation errors surface before any
    /// mutation; the surrounding transaction rolls back on error.
    pub fn execute(&self, name: &str, args: &Value, ctx: &ToolContext<'_>) -> ToolResult {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;

        if let Some(allowed) = entry.spec.allowed_specialists {
            if !allowed.contains(&ctx.specialist_id) {
                return Err(ToolError::NotAllowed {
                    tool: name.to_string(),
                    specialist: ctx.specialist_id.to_string(),
                });
            }
        }

        let args = match args {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            _ => {
                return Err(ToolError::Validation(
                    "tool arguments must be an object".to_string(),
                ))
            }
        };

        for field in entry.spec.required_fields {
            let missing = match args.get(*field) {
                None | Some(Value::Null) => true,
                Some(Value::String(s)) => s.trim().is_empty(),
                _ => false,
            };
            if missing {
                return Err(ToolError::Validation(format!(
                    "`{field}` is required for tool `{name}`"
                )));
            }
        }

        debug!(tool = name, specialist = ctx.specialist_id, "executing tool");
        (entry.handler)(&args, ctx)
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::with_default_tools()
    }
}

// ---------------------------------------------------------------------------
// Shared argument coercion helpers
// ---------------------------------------------------------------------------

pub(crate) fn arg_str<'a>(args: &'a Map<String, Value>, field: &str) -> Option<&'a str> {
    args.get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

pub(crate) fn require_str<'a>(
    args: &'a Map<String, Value>,
    field: &str,
) -> Result<&'a str, ToolError> {
    arg_str(args, field)
        .ok_or_else(|| ToolError::Validation(format!("`{field}` must be a non-empty string")))
}

pub(crate) fn arg_f64(args: &Map<String, Value>, field: &str) -> Result<Option<f64>, ToolError> {
    match args.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => vital_core::jsonx::as_f64(Some(value))
            .map(Some)
            .ok_or_else(|| ToolError::Validation(format!("`{field}` must be a number"))),
    }
}

pub(crate) fn arg_i64(args: &Map<String, Value>, field: &str) -> Result<Option<i64>, ToolError> {
    match args.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => vital_core::jsonx::as_i64(Some(value))
            .map(Some)
            .ok_or_else(|| ToolError::Validation(format!("`{field}` must be an integer"))),
    }
}

pub(crate) fn arg_bool(args: &Map<String, Value>, field: &str, default: bool) -> bool {
    args.get(field).and_then(Value::as_bool).unwrap_or(default)
}

/// Parse a string-list argument: JSON array, comma-separated string, or list
/// of values. Deduplicates while preserving order.
pub(crate) fn arg_string_list(
    args: &Map<String, Value>,
    field: &str,
) -> Result<Vec<String>, ToolError> {
    let raw = match args.get(field) {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(v) => v,
    };
    fn push(out: &mut Vec<String>, s: &str) {
        let cleaned = s.trim().to_string();
        if !cleaned.is_empty() && !out.iter().any(|x| x == &cleaned) {
            out.push(cleaned);
        }
    }

    let mut out: Vec<String> = Vec::new();
    match raw {
        Value::Array(arr) => {
            for v in arr {
                match v {
                    Value::String(s) => push(&mut out, s),
                    other => push(&mut out, &other.to_string()),
                }
            }
        }
        Value::String(text) => {
            let text = text.trim();
            if text.starts_with('[') {
                if let Ok(Value::Array(arr)) = serde_json::from_str::<Value>(text) {
                    for v in arr {
                        if let Value::String(s) = v {
                            push(&mut out, &s);
                        }
                    }
                    return Ok(out);
                }
            }
            for part in text.split(',') {
                push(&mut out, part);
            }
        }
        _ => {
            return Err(ToolError::Validation(format!(
                "`{field}` must be a list of strings"
            )))
        }
    }
    Ok(out)
}

/// Resolve a time argument (ISO UTC, ISO local, or bare clock token) against
/// the user's timezone and the turn's reference instant.
pub(crate) fn resolve_time_arg(
    args: &Map<String, Value>,
    field: &str,
    ctx: &ToolContext<'_>,
) -> Option<DateTime<Utc>> {
    let raw = arg_str(args, field)?;
    vital_core::timeinfer::resolve_time_field(raw, ctx.reference_utc, ctx.timezone().as_deref())
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use std::sync::OnceLock;

    pub fn test_config() -> &'static VitalConfig {
        static CONFIG: OnceLock<VitalConfig> = OnceLock::new();
        CONFIG.get_or_init(|| {
            let mut config = VitalConfig::default();
            config.web_search.enable_web_search = false;
            config
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use vital_store::users::create_user;
    use vital_store::Store;

    #[test]
    fn unknown_tool_and_missing_args_error_before_mutation() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let user = create_user(&conn, "a", "A").unwrap();
        let registry = ToolRegistry::with_default_tools();
        let ctx = ToolContext::new(&conn, user.id, "orchestrator", Utc::now(), testutil::test_config());

        assert!(matches!(
            registry.execute("definitely_not_a_tool", &json!({}), &ctx),
            Err(ToolError::UnknownTool(_))
        ));
        assert!(matches!(
            registry.execute("checklist_mark_taken", &json!({}), &ctx),
            Err(ToolError::Validation(_))
        ));
        // Nothing was written.
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM daily_checklist_items", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn registry_lists_required_contract_tools() {
        let registry = ToolRegistry::with_default_tools();
        for name in [
            "profile_read",
            "profile_patch",
            "medication_resolve_reference",
            "supplement_resolve_reference",
            "medication_set",
            "medication_upsert",
            "supplement_set",
            "supplement_upsert",
            "goal_upsert",
            "create_goal",
            "update_goal",
            "list_goals",
            "checklist_mark_taken",
            "food_log_write",
            "vitals_log_write",
            "exercise_log_write",
            "hydration_log_write",
            "supplement_log_write",
            "sleep_log_write",
            "fasting_manage",
            "exercise_plan_upsert",
            "meal_template_list",
            "meal_template_get",
            "meal_template_versions",
            "meal_template_resolve_name",
            "meal_template_upsert",
            "meal_template_archive",
            "meal_template_delete",
            "meal_log_from_template",
            "meal_response_insights",
            "meal_response_signal_write",
            "health_search",
            "notification_create",
            "notification_list",
            "notification_mark_read",
            "framework_sync_from_profile",
            "web_search",
            "time_now",
        ] {
            assert!(registry.spec(name).is_some(), "missing tool: {name}");
        }
        // AI-callable tools are a strict subset of the registry.
        for name in AI_CALLABLE_TOOLS {
            assert!(registry.spec(name).is_some());
        }
    }

    #[test]
    fn read_only_flags_partition_the_registry() {
        let registry = ToolRegistry::with_default_tools();
        assert!(registry.spec("profile_read").unwrap().read_only);
        assert!(registry.spec("web_search").unwrap().read_only);
        assert!(!registry.spec("food_log_write").unwrap().read_only);
        assert!(!registry.spec("fasting_manage").unwrap().read_only);
    }
}
