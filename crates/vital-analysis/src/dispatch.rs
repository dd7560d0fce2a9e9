//! Debounced, single-flight background dispatch of due analyses.
//!
//! At most one dispatch decision happens at a time process-wide; at most one
//! runner is in flight per user; repeated chat turns inside the debounce
//! window are dropped. Cancellation of the triggering request never cancels
//! the spawned runner.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;
use tracing::warn;
use vital_core::config::AnalysisConfig;
use vital_core::secrets::KeySealer;
use vital_store::Store;

use crate::engine::run_due_analyses;

const MIN_DEBOUNCE_SECS: u64 = 5;

#[derive(Default)]
struct DispatchState {
    last_dispatch: HashMap<i64, Instant>,
    inflight: HashSet<i64>,
}

pub struct AnalysisDispatcher {
    config: AnalysisConfig,
    state: Mutex<DispatchState>,
}

impl AnalysisDispatcher {
    pub fn new(config: AnalysisConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(DispatchState::default()),
        })
    }

    /// Dispatch a background due-analysis runner for the user if allowed.
    /// Returns true when a runner was spawned.
    pub async fn maybe_dispatch(
        self: &Arc<Self>,
        store: Arc<Store>,
        sealer: Arc<KeySealer>,
        user_id: i64,
    ) -> bool {
        if !self.config.enable_longitudinal_analysis || !self.config.analysis_autorun_on_chat {
            return false;
        }
        let debounce = std::time::Duration::from_secs(
            (self.config.analysis_autorun_debounce_seconds as u64).max(MIN_DEBOUNCE_SECS),
        );

        {
            let mut state = self.state.lock().await;
            if state.inflight.contains(&user_id) {
                return false;
            }
            if let Some(last) = state.last_dispatch.get(&user_id) {
                if last.elapsed() < debounce {
                    return false;
                }
            }
            state.last_dispatch.insert(user_id, Instant::now());
            state.inflight.insert(user_id);
        }

        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(exc) = run_due_analyses(
                &store,
                &dispatcher.config,
                &sealer,
                user_id,
                "chat_async",
            )
            .await
            {
                warn!(user_id, %exc, "due longitudinal analysis dispatch failed");
            }
            let mut state = dispatcher.state.lock().await;
            state.inflight.remove(&user_id);
        });
        true
    }

    /// Test hook: whether a runner is currently in flight for the user.
    pub async fn is_inflight(&self, user_id: i64) -> bool {
        self.state.lock().await.inflight.contains(&user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vital_store::users::create_user;

    fn test_setup() -> (Arc<Store>, Arc<KeySealer>, i64) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let user_id = {
            let conn = store.conn();
            create_user(&conn, "a", "A").unwrap().id
        };
        let sealer = Arc::new(KeySealer::from_master_key_b64("").unwrap());
        (store, sealer, user_id)
    }

    #[tokio::test]
    async fn debounce_suppresses_rapid_second_dispatch() {
        let (store, sealer, user_id) = test_setup();
        let dispatcher = AnalysisDispatcher::new(AnalysisConfig::default());

        let first = dispatcher
            .maybe_dispatch(Arc::clone(&store), Arc::clone(&sealer), user_id)
            .await;
        assert!(first);
        // Second dispatch one tick later is dropped regardless of the runner
        // state: either still in flight or inside the debounce window.
        let second = dispatcher
            .maybe_dispatch(Arc::clone(&store), Arc::clone(&sealer), user_id)
            .await;
        assert!(!second);
    }

    #[tokio::test]
    async fn disabled_config_never_dispatches() {
        let (store, sealer, user_id) = test_setup();
        let config = AnalysisConfig {
            analysis_autorun_on_chat: false,
            ..Default::default()
        };
        let dispatcher = AnalysisDispatcher::new(config);
        assert!(!dispatcher.maybe_dispatch(store, sealer, user_id).await);
    }

    #[tokio::test]
    async fn dispatch_runs_produce_analysis_rows() {
        let (store, sealer, user_id) = test_setup();
        let dispatcher = AnalysisDispatcher::new(AnalysisConfig::default());
        assert!(
            dispatcher
                .maybe_dispatch(Arc::clone(&store), Arc::clone(&sealer), user_id)
                .await
        );
        // Wait for the background runner to drain.
        for _ in 0..100 {
            if !dispatcher.is_inflight(user_id).await {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let conn = store.conn();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM analysis_runs WHERE user_id = ?1",
                [user_id],
                |r| r.get(0),
            )
            .unwrap();
        assert!(count >= 1);
    }
}
