use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Result, VitalError};

/// Top-level config (vital.toml + VITAL_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VitalConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub web_search: WebSearchConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub secrets: SecretsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Per-turn utility-tier call budgets. The budget spans intent classification,
/// log parsing, feedback extraction, profile extraction, and goal sync; the
/// reasoning response and deep-thinking analysis calls are never counted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default = "default_budget_log")]
    pub utility_call_budget_log_turn: u32,
    #[serde(default = "default_budget_nonlog")]
    pub utility_call_budget_nonlog_turn: u32,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            utility_call_budget_log_turn: default_budget_log(),
            utility_call_budget_nonlog_turn: default_budget_nonlog(),
        }
    }
}

impl BudgetConfig {
    /// Budget for one turn given the routed category. Clamped to >= 1.
    pub fn limit_for(&self, is_log_category: bool) -> u32 {
        let raw = if is_log_category {
            self.utility_call_budget_log_turn
        } else {
            self.utility_call_budget_nonlog_turn
        };
        raw.max(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSearchConfig {
    #[serde(default)]
    pub enable_web_search: bool,
    #[serde(default = "default_search_specialists")]
    pub web_search_allowed_specialists: Vec<String>,
    #[serde(default = "default_search_max_results")]
    pub web_search_max_results: u32,
    #[serde(default = "default_search_timeout")]
    pub web_search_timeout_seconds: u32,
    #[serde(default = "default_circuit_threshold")]
    pub web_search_circuit_fail_threshold: u32,
    #[serde(default = "default_circuit_open")]
    pub web_search_circuit_open_seconds: u32,
    #[serde(default = "default_search_cache_ttl")]
    pub web_search_cache_ttl_hours: u32,
}

impl Default for WebSearchConfig {
    fn default() -> Self {
        Self {
            enable_web_search: false,
            web_search_allowed_specialists: default_search_specialists(),
            web_search_max_results: default_search_max_results(),
            web_search_timeout_seconds: default_search_timeout(),
            web_search_circuit_fail_threshold: default_circuit_threshold(),
            web_search_circuit_open_seconds: default_circuit_open(),
            web_search_cache_ttl_hours: default_search_cache_ttl(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default = "bool_true")]
    pub enable_longitudinal_analysis: bool,
    #[serde(default = "bool_true")]
    pub analysis_autorun_on_chat: bool,
    #[serde(default = "default_analysis_debounce")]
    pub analysis_autorun_debounce_seconds: u32,
    #[serde(default = "default_daily_hour")]
    pub analysis_daily_hour_local: u32,
    /// 0 = Monday .. 6 = Sunday.
    #[serde(default)]
    pub analysis_weekly_weekday_local: u32,
    #[serde(default = "default_monthly_day")]
    pub analysis_monthly_day_local: u32,
    #[serde(default = "default_catchup_chat")]
    pub analysis_max_catchup_windows_chat: u32,
    #[serde(default = "default_catchup")]
    pub analysis_max_catchup_windows: u32,
    #[serde(default)]
    pub analysis_auto_apply_proposals: bool,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            enable_longitudinal_analysis: true,
            analysis_autorun_on_chat: true,
            analysis_autorun_debounce_seconds: default_analysis_debounce(),
            analysis_daily_hour_local: default_daily_hour(),
            analysis_weekly_weekday_local: 0,
            analysis_monthly_day_local: default_monthly_day(),
            analysis_max_catchup_windows_chat: default_catchup_chat(),
            analysis_max_catchup_windows: default_catchup(),
            analysis_auto_apply_proposals: false,
        }
    }
}

/// Master key material for sealing user API keys at rest.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SecretsConfig {
    /// Base64-encoded 32-byte AES-256-GCM key. Empty disables sealing
    /// (keys are then stored/loaded verbatim — dev mode only).
    #[serde(default)]
    pub master_key_b64: String,
}

fn bool_true() -> bool {
    true
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.vital/vital.db", home)
}
fn default_budget_log() -> u32 {
    1
}
fn default_budget_nonlog() -> u32 {
    3
}
fn default_search_specialists() -> Vec<String> {
    vec![
        "nutritionist".to_string(),
        "movement_coach".to_string(),
        "sleep_expert".to_string(),
        "supplement_auditor".to_string(),
        "safety_clinician".to_string(),
    ]
}
fn default_search_max_results() -> u32 {
    5
}
fn default_search_timeout() -> u32 {
    8
}
fn default_circuit_threshold() -> u32 {
    3
}
fn default_circuit_open() -> u32 {
    120
}
fn default_search_cache_ttl() -> u32 {
    24
}
fn default_analysis_debounce() -> u32 {
    20
}
fn default_daily_hour() -> u32 {
    3
}
fn default_monthly_day() -> u32 {
    1
}
fn default_catchup_chat() -> u32 {
    1
}
fn default_catchup() -> u32 {
    6
}

impl VitalConfig {
    /// Load config from a TOML file with VITAL_* env var overrides.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: VitalConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("VITAL_").split("__"))
            .extract()
            .map_err(|e| VitalError::Config(e.to_string()))?;

        tracing::debug!(%path, "config loaded");
        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.vital/vital.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_budgets() {
        let cfg = VitalConfig::default();
        assert_eq!(cfg.budget.limit_for(true), 1);
        assert_eq!(cfg.budget.limit_for(false), 3);
    }

    #[test]
    fn budget_limit_is_clamped_to_one() {
        let budget = BudgetConfig {
            utility_call_budget_log_turn: 0,
            utility_call_budget_nonlog_turn: 0,
        };
        assert_eq!(budget.limit_for(true), 1);
        assert_eq!(budget.limit_for(false), 1);
    }

    #[test]
    fn analysis_defaults_are_sane() {
        let cfg = AnalysisConfig::default();
        assert!(cfg.enable_longitudinal_analysis);
        assert!(cfg.analysis_autorun_on_chat);
        assert!(cfg.analysis_autorun_debounce_seconds >= 5);
        assert_eq!(cfg.analysis_max_catchup_windows_chat, 1);
    }
}
