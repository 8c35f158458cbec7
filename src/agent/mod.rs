//! Session registry
//!
//! Process-wide map of active sessions. Each active session owns one agent
//! loop task (`runner`), a cancel token, and a shared info block the HTTP
//! surface can inspect. The registry enforces the max-concurrent-agents
//! cap: when a new session arrives at the cap, the oldest idle session is
//! wound down to make room.

pub mod prompts;
mod runner;

pub use runner::AgentDeps;

use crate::cancel::{cancel_pair, CancelHandle};
use crate::providers::Turn;
use crate::store::SessionRow;
use crate::util::now_epoch_ms;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Why an agent loop is being asked to stop. Decides the final session
/// status: hook-initiated cancels leave the session `active`, idle
/// wind-downs and completion hooks mark it `completed`, fatal errors mark
/// it `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindDownReason {
    /// A plain hook cancel; the session stays `active`.
    Hook,
    /// Completion hook after drain, or idle timeout.
    Complete,
    /// Unrecoverable agent error.
    Fatal,
}

/// Mutable per-session agent state, shared between the loop and the
/// registry/HTTP surface.
#[derive(Debug)]
pub struct ActiveSessionInfo {
    pub session_db_id: i64,
    pub content_session_id: String,
    pub memory_session_id: Option<String>,
    pub project: String,
    pub user_prompt: Option<String>,
    pub last_prompt_number: Option<i64>,
    pub conversation_history: Vec<Turn>,
    pub cumulative_input_tokens: u64,
    pub cumulative_output_tokens: u64,
    /// Ids currently claimed by this agent, oldest first.
    pub processing_message_ids: Vec<i64>,
    /// Enqueue time of the message being processed, captured at claim.
    pub earliest_pending_timestamp: Option<i64>,
    pub start_time: i64,
    /// Set by whoever requests the wind-down, read by the loop on exit.
    pub wind_down_reason: Option<WindDownReason>,
}

impl ActiveSessionInfo {
    pub(crate) fn from_session(session: &SessionRow) -> Self {
        Self {
            session_db_id: session.id,
            content_session_id: session.content_session_id.clone(),
            memory_session_id: session.memory_session_id.clone(),
            project: session.project.clone(),
            user_prompt: session.user_prompt.clone(),
            last_prompt_number: None,
            conversation_history: Vec::new(),
            cumulative_input_tokens: 0,
            cumulative_output_tokens: 0,
            processing_message_ids: Vec::new(),
            earliest_pending_timestamp: None,
            start_time: now_epoch_ms(),
            wind_down_reason: None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.processing_message_ids.is_empty()
    }
}

pub type SharedSessionInfo = Arc<Mutex<ActiveSessionInfo>>;

struct ActiveSessionHandle {
    info: SharedSessionInfo,
    cancel: CancelHandle,
    task: JoinHandle<()>,
    admitted_at: i64,
}

/// Process-wide session registry.
pub struct SessionRegistry {
    deps: Arc<AgentDeps>,
    max_concurrent: usize,
    sessions: Mutex<HashMap<i64, ActiveSessionHandle>>,
    wakers: Mutex<HashMap<i64, Arc<Notify>>>,
}

impl SessionRegistry {
    pub fn new(deps: Arc<AgentDeps>, max_concurrent: usize) -> Arc<Self> {
        Arc::new(Self {
            deps,
            max_concurrent: max_concurrent.max(1),
            sessions: Mutex::new(HashMap::new()),
            wakers: Mutex::new(HashMap::new()),
        })
    }

    /// The enqueue-side waker for a session. Created on demand; shared with
    /// the agent loop's queue wait.
    pub fn waker(&self, session_db_id: i64) -> Arc<Notify> {
        self.wakers
            .lock()
            .unwrap()
            .entry(session_db_id)
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Make sure an agent loop is running for the session, admitting it
    /// under the concurrency cap, then wake its queue wait.
    pub fn ensure_agent(self: &Arc<Self>, session: &SessionRow) {
        {
            let mut sessions = self.sessions.lock().unwrap();
            sessions.retain(|_, handle| !handle.task.is_finished());

            if !sessions.contains_key(&session.id) {
                if sessions.len() >= self.max_concurrent {
                    // Wind down the oldest idle session to free a slot. If
                    // none is idle the new session still gets admitted; the
                    // cap bounds steady-state, not a transient burst.
                    let oldest_idle = sessions
                        .iter()
                        .filter(|(_, h)| h.info.lock().unwrap().is_idle())
                        .min_by_key(|(_, h)| h.admitted_at)
                        .map(|(id, _)| *id);
                    if let Some(id) = oldest_idle {
                        tracing::info!("Winding down idle session {} to admit {}", id, session.id);
                        if let Some(handle) = sessions.remove(&id) {
                            handle
                                .info
                                .lock()
                                .unwrap()
                                .wind_down_reason
                                .get_or_insert(WindDownReason::Complete);
                            handle.cancel.cancel();
                        }
                    }
                }

                let info: SharedSessionInfo =
                    Arc::new(Mutex::new(ActiveSessionInfo::from_session(session)));
                let (cancel_handle, cancel_signal) = cancel_pair();
                let waker = self.waker(session.id);
                let task = tokio::spawn(runner::run_agent(
                    self.deps.clone(),
                    info.clone(),
                    cancel_signal,
                    waker,
                ));
                sessions.insert(
                    session.id,
                    ActiveSessionHandle {
                        info,
                        cancel: cancel_handle,
                        task,
                        admitted_at: now_epoch_ms(),
                    },
                );
                tracing::info!(
                    "Agent started for session {} (project {})",
                    session.id,
                    session.project
                );
            }
        }

        self.waker(session.id).notify_one();
    }

    /// Request a wind-down with the given reason. Returns false when the
    /// session has no running agent.
    pub fn wind_down(&self, session_db_id: i64, reason: WindDownReason) -> bool {
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.remove(&session_db_id) {
            Some(handle) => {
                handle
                    .info
                    .lock()
                    .unwrap()
                    .wind_down_reason
                    .get_or_insert(reason);
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Snapshot of a session's live info, if its agent is running.
    #[allow(dead_code)] // Reserved for a session introspection endpoint
    pub fn session_info(&self, session_db_id: i64) -> Option<SharedSessionInfo> {
        self.sessions
            .lock()
            .unwrap()
            .get(&session_db_id)
            .map(|h| h.info.clone())
    }

    pub fn active_count(&self) -> usize {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.retain(|_, handle| !handle.task.is_finished());
        sessions.len()
    }

    /// Cancel every agent. Used at process shutdown.
    pub fn shutdown(&self) {
        let mut sessions = self.sessions.lock().unwrap();
        for (_, handle) in sessions.drain() {
            handle
                .info
                .lock()
                .unwrap()
                .wind_down_reason
                .get_or_insert(WindDownReason::Hook);
            handle.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelSignal;
    use crate::config::ProviderKind;
    use crate::events::frame_channel;
    use crate::modes::Mode;
    use crate::processor::ResponseProcessor;
    use crate::providers::{Provider, ProviderChain, ProviderError, TurnOutput};
    use crate::store::Store;
    use crate::vector::VectorMirror;
    use async_trait::async_trait;
    use std::time::Duration;

    struct NeverProvider;

    #[async_trait]
    impl Provider for NeverProvider {
        fn name(&self) -> &'static str {
            "never"
        }
        fn captures_session_id(&self) -> bool {
            true
        }
        async fn run_turn(
            &self,
            _history: &[Turn],
            _memory_session_id: Option<&str>,
            _cancel: &CancelSignal,
        ) -> Result<TurnOutput, ProviderError> {
            Err(ProviderError::EmptyReply)
        }
    }

    fn registry_with_cap(dir: &std::path::Path, store: Store, cap: usize) -> Arc<SessionRegistry> {
        let mirror = Arc::new(VectorMirror::new(dir.join("vectors.db")));
        let processor = Arc::new(ResponseProcessor::new(
            store.clone(),
            mirror,
            frame_channel(),
        ));
        let deps = Arc::new(AgentDeps {
            store,
            chain: Arc::new(ProviderChain::new(Arc::new(NeverProvider))),
            processor,
            mode: Arc::new(Mode::builtin()),
            provider_kind: ProviderKind::Claude,
            idle_timeout: Duration::from_secs(60),
        });
        SessionRegistry::new(deps, cap)
    }

    #[tokio::test]
    async fn cap_winds_down_oldest_idle_session() {
        let (dir, store) = Store::open_temp();
        let s1 = store.create_session("c1", "demo", None, None, None).unwrap();
        let s2 = store.create_session("c2", "demo", None, None, None).unwrap();
        let registry = registry_with_cap(dir.path(), store.clone(), 1);

        registry.ensure_agent(&store.get_session(s1).unwrap().unwrap());
        assert_eq!(registry.active_count(), 1);

        // Admitting a second session at cap 1 evicts the idle first one.
        registry.ensure_agent(&store.get_session(s2).unwrap().unwrap());
        assert!(registry.session_info(s2).is_some());
        assert!(registry.session_info(s1).is_none());

        registry.shutdown();
    }

    #[tokio::test]
    async fn ensure_agent_is_idempotent() {
        let (dir, store) = Store::open_temp();
        let s1 = store.create_session("c1", "demo", None, None, None).unwrap();
        let registry = registry_with_cap(dir.path(), store.clone(), 2);

        let session = store.get_session(s1).unwrap().unwrap();
        registry.ensure_agent(&session);
        registry.ensure_agent(&session);
        assert_eq!(registry.active_count(), 1);

        assert!(registry.wind_down(s1, WindDownReason::Hook));
        assert!(!registry.wind_down(s1, WindDownReason::Hook));
        registry.shutdown();
    }
}
