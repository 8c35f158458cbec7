//! Per-session agent loop
//!
//! One task per active session: claim queued messages in order, run a
//! provider turn for each, hand the reply to the response processor, and
//! wind the session down on idle or cancellation. A message is only ever
//! confirmed by the processor's store transaction; every failure path
//! leaves it `processing` for stale recovery to recycle.

use super::{prompts, SharedSessionInfo, WindDownReason};
use crate::cancel::CancelSignal;
use crate::config::ProviderKind;
use crate::modes::Mode;
use crate::processor::{ProcessOutcome, ResponseProcessor};
use crate::providers::{ProviderChain, ProviderError, Turn};
use crate::store::{PendingMessage, SessionStatus, Store};
use crate::util::{estimate_read_tokens, now_epoch_ms};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Poll fallback for the queue wait; catches rows the stale-recovery sweep
/// reset without an enqueue notification.
const QUEUE_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Error backoff bounds for claim failures.
const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Upper bound on retained conversation turns; the init turn survives.
const HISTORY_LIMIT: usize = 40;

/// Everything an agent loop needs, shared across sessions.
pub struct AgentDeps {
    pub store: Store,
    pub chain: Arc<ProviderChain>,
    pub processor: Arc<ResponseProcessor>,
    pub mode: Arc<Mode>,
    pub provider_kind: ProviderKind,
    pub idle_timeout: Duration,
}

enum WaitOutcome {
    Message(Box<PendingMessage>),
    Idle,
    Cancelled,
}

/// Run the agent loop for one session until idle, cancel, or fatal error.
pub async fn run_agent(
    deps: Arc<AgentDeps>,
    info: SharedSessionInfo,
    cancel: CancelSignal,
    waker: Arc<Notify>,
) {
    let (session_db_id, project) = {
        let info = info.lock().unwrap();
        (info.session_db_id, info.project.clone())
    };

    // Providers that do not manage their own session state get a
    // synthesized memory id up front; Claude reports its own with the
    // first reply.
    if !deps.chain.primary().captures_session_id() {
        let needs_id = info.lock().unwrap().memory_session_id.is_none();
        if needs_id {
            let content_session_id = info.lock().unwrap().content_session_id.clone();
            let synthesized = format!(
                "{}-{}-{}",
                deps.provider_kind.as_str(),
                content_session_id,
                now_epoch_ms()
            );
            if let Err(e) = deps
                .store
                .register_memory_session_id(session_db_id, &synthesized)
            {
                tracing::error!("Session {}: cannot register memory id: {}", session_db_id, e);
                finalize(&deps, &info, Some(WindDownReason::Fatal));
                return;
            }
            info.lock().unwrap().memory_session_id = Some(synthesized);
        }
    }

    loop {
        match wait_for_message(&deps, session_db_id, &cancel, &waker).await {
            WaitOutcome::Message(message) => {
                if let Err(reason) =
                    process_message(&deps, &info, &project, *message, &cancel).await
                {
                    finalize(&deps, &info, Some(reason));
                    return;
                }
            }
            WaitOutcome::Idle => {
                tracing::info!("Session {} idle; winding down", session_db_id);
                finalize(&deps, &info, Some(WindDownReason::Complete));
                return;
            }
            WaitOutcome::Cancelled => {
                finalize(&deps, &info, None);
                return;
            }
        }
    }
}

/// Block until a message is claimed, the idle deadline passes, or the
/// session is cancelled. Claim errors back off exponentially.
async fn wait_for_message(
    deps: &AgentDeps,
    session_db_id: i64,
    cancel: &CancelSignal,
    waker: &Notify,
) -> WaitOutcome {
    let idle_deadline = tokio::time::Instant::now() + deps.idle_timeout;
    let mut backoff = BACKOFF_START;

    loop {
        if cancel.is_cancelled() {
            return WaitOutcome::Cancelled;
        }
        match deps.store.claim_next(session_db_id) {
            Ok(Some(message)) => return WaitOutcome::Message(Box::new(message)),
            Ok(None) => {
                tokio::select! {
                    _ = waker.notified() => {}
                    _ = tokio::time::sleep(QUEUE_POLL_INTERVAL) => {}
                    _ = tokio::time::sleep_until(idle_deadline) => return WaitOutcome::Idle,
                    _ = cancel.cancelled() => return WaitOutcome::Cancelled,
                }
            }
            Err(e) => {
                tracing::warn!(
                    "Session {}: queue claim failed ({}); backing off {:?}",
                    session_db_id,
                    e,
                    backoff
                );
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancel.cancelled() => return WaitOutcome::Cancelled,
                }
                backoff = (backoff * 2).min(BACKOFF_CAP);
            }
        }
    }
}

/// Process one claimed message. Returns the fatal wind-down reason when the
/// loop cannot continue.
async fn process_message(
    deps: &AgentDeps,
    info: &SharedSessionInfo,
    project: &str,
    message: PendingMessage,
    cancel: &CancelSignal,
) -> Result<(), WindDownReason> {
    let session_db_id = message.session_db_id;

    // Claim bookkeeping, visible to the HTTP surface.
    {
        let mut info = info.lock().unwrap();
        info.processing_message_ids.push(message.id);
        if info.earliest_pending_timestamp.is_none() {
            info.earliest_pending_timestamp = Some(message.created_at_epoch);
        }
        if message.prompt_number.is_some() {
            info.last_prompt_number = message.prompt_number;
        }
    }

    let release = |info: &SharedSessionInfo| {
        let mut info = info.lock().unwrap();
        info.processing_message_ids.retain(|id| *id != message.id);
        if info.processing_message_ids.is_empty() {
            info.earliest_pending_timestamp = None;
        }
    };

    // Build the user turn. The first turn carries the session framing.
    let user_turn = {
        let info = info.lock().unwrap();
        let body = prompts::message_prompt(&deps.mode, &message);
        if info.conversation_history.is_empty() {
            let init = prompts::initial_prompt(&deps.mode, project, info.user_prompt.as_deref());
            format!("{init}\n\n{body}")
        } else {
            body
        }
    };

    let (history, memory_session_id) = {
        let mut info = info.lock().unwrap();
        info.conversation_history.push(Turn::user(user_turn));
        trim_history(&mut info.conversation_history);
        (info.conversation_history.clone(), info.memory_session_id.clone())
    };

    let output = match deps
        .chain
        .run_turn(&history, memory_session_id.as_deref(), cancel)
        .await
    {
        Ok(output) => output,
        Err(ProviderError::Cancelled) => {
            release(info);
            return Ok(()); // cancel signal also ends the queue wait next
        }
        Err(ProviderError::EmptyReply) => {
            // Do not confirm: the message stays processing and stale
            // recovery recycles it.
            tracing::warn!("Session {}: empty reply for message {}", session_db_id, message.id);
            release(info);
            return Ok(());
        }
        Err(e) => {
            tracing::warn!(
                "Session {}: provider failed on message {} ({}); left for recovery",
                session_db_id,
                message.id,
                e
            );
            release(info);
            return Ok(());
        }
    };

    // Token accounting: precise split when reported, 70/30 estimate of the
    // turn size otherwise.
    let (input_tokens, output_tokens) = match (output.input_tokens, output.output_tokens) {
        (Some(i), Some(o)) => (i, o),
        _ => {
            let estimated: u64 = history
                .iter()
                .map(|t| estimate_read_tokens(&t.text))
                .sum::<u64>()
                + estimate_read_tokens(&output.text);
            crate::providers::split_estimated_tokens(estimated)
        }
    };

    // The memory id must exist before children can be stored. Claude hands
    // it back with the first reply.
    let memory_session_id = match memory_session_id {
        Some(id) => id,
        None => match &output.memory_session_id {
            Some(id) => {
                if let Err(e) = deps.store.register_memory_session_id(session_db_id, id) {
                    tracing::error!(
                        "Session {}: memory id registration failed: {}",
                        session_db_id,
                        e
                    );
                    release(info);
                    return Err(WindDownReason::Fatal);
                }
                info.lock().unwrap().memory_session_id = Some(id.clone());
                id.clone()
            }
            None => {
                tracing::error!(
                    "Session {}: provider returned no memory session id; cannot store",
                    session_db_id
                );
                release(info);
                return Err(WindDownReason::Fatal);
            }
        },
    };

    {
        let mut info = info.lock().unwrap();
        info.conversation_history.push(Turn::assistant(output.text.clone()));
        info.cumulative_input_tokens += input_tokens;
        info.cumulative_output_tokens += output_tokens;
    }

    let discovery_tokens = input_tokens + output_tokens;
    match deps.processor.process_reply(
        &deps.mode,
        &message,
        &memory_session_id,
        project,
        &output.text,
        discovery_tokens,
    ) {
        Ok(ProcessOutcome::Stored { observation_ids, summary_id }) => {
            tracing::debug!(
                "Session {}: message {} stored ({} observations{})",
                session_db_id,
                message.id,
                observation_ids.len(),
                if summary_id.is_some() { ", summary" } else { "" }
            );
        }
        Ok(ProcessOutcome::ParseFailed) => {
            // No confirm; stale recovery owns the retry.
        }
        Err(e) => {
            tracing::warn!(
                "Session {}: store failed for message {} ({}); left for recovery",
                session_db_id,
                message.id,
                e
            );
        }
    }

    release(info);
    Ok(())
}

/// Drop middle turns when the history grows past the cap, keeping the
/// framing turn and the most recent exchanges.
fn trim_history(history: &mut Vec<Turn>) {
    while history.len() > HISTORY_LIMIT {
        history.remove(1);
    }
}

/// Apply the final session status per the wind-down cause.
fn finalize(deps: &AgentDeps, info: &SharedSessionInfo, fallback_reason: Option<WindDownReason>) {
    let (session_db_id, reason) = {
        let mut info = info.lock().unwrap();
        let reason = info.wind_down_reason.or(fallback_reason);
        info.wind_down_reason = reason;
        (info.session_db_id, reason)
    };

    let status = match reason {
        Some(WindDownReason::Complete) => Some(SessionStatus::Completed),
        Some(WindDownReason::Fatal) => Some(SessionStatus::Failed),
        // Hook-initiated cancels leave the session active until an
        // explicit completion hook.
        Some(WindDownReason::Hook) | None => None,
    };
    if let Some(status) = status {
        if let Err(e) = deps.store.set_session_status(session_db_id, status) {
            tracing::warn!("Session {}: status update failed: {}", session_db_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ActiveSessionInfo;
    use crate::cancel::cancel_pair;
    use crate::events::frame_channel;
    use crate::providers::{Provider, TurnOutput};
    use crate::store::{MessageType, NewPendingMessage};
    use crate::vector::VectorMirror;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ScriptedProvider {
        replies: Mutex<Vec<Result<TurnOutput, ProviderError>>>,
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn name(&self) -> &'static str {
            "scripted"
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
            self.replies
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(Err(ProviderError::EmptyReply))
        }
    }

    fn deps_with_provider(
        store: Store,
        mirror_dir: &std::path::Path,
        replies: Vec<Result<TurnOutput, ProviderError>>,
    ) -> Arc<AgentDeps> {
        let mirror = Arc::new(VectorMirror::new(mirror_dir.join("vectors.db")));
        let processor = Arc::new(ResponseProcessor::new(
            store.clone(),
            mirror,
            frame_channel(),
        ));
        Arc::new(AgentDeps {
            store,
            chain: Arc::new(ProviderChain::new(Arc::new(ScriptedProvider {
                replies: Mutex::new(replies),
            }))),
            processor,
            mode: Arc::new(Mode::builtin()),
            provider_kind: ProviderKind::Claude,
            idle_timeout: Duration::from_millis(300),
        })
    }

    fn observation_reply(memory_id: &str) -> Result<TurnOutput, ProviderError> {
        Ok(TurnOutput {
            text: "<observation><type>discovery</type><title>T</title><narrative>N</narrative></observation>".into(),
            input_tokens: Some(100),
            output_tokens: Some(40),
            memory_session_id: Some(memory_id.to_string()),
        })
    }

    #[tokio::test]
    async fn processes_message_then_winds_down_idle() {
        let (dir, store) = Store::open_temp();
        let sid = store.create_session("c1", "demo", Some("hello"), None, None).unwrap();
        store
            .enqueue(&NewPendingMessage {
                session_db_id: sid,
                content_session_id: "c1".into(),
                message_type: MessageType::Observation,
                tool_name: Some("Read".into()),
                tool_input: Some(r#"{"file":"a.ts"}"#.into()),
                tool_response: Some("{}".into()),
                cwd: None,
                last_assistant_message: None,
                prompt_number: Some(1),
            })
            .unwrap();

        let deps = deps_with_provider(store.clone(), dir.path(), vec![observation_reply("mem-1")]);
        let session = store.get_session(sid).unwrap().unwrap();
        let info = Arc::new(Mutex::new(ActiveSessionInfo::from_session(&session)));
        let (_handle, signal) = cancel_pair();
        let waker = Arc::new(Notify::new());

        run_agent(deps, info.clone(), signal, waker).await;

        // Observation stored under the captured memory id, message
        // confirmed, session completed by the idle wind-down.
        let observations = store
            .recent_observations(&["demo".to_string()], None, None, 10)
            .unwrap();
        assert_eq!(observations.len(), 1);
        assert_eq!(observations[0].memory_session_id, "mem-1");
        assert_eq!(store.queue_stats().unwrap().processed, 1);

        let session = store.get_session(sid).unwrap().unwrap();
        assert_eq!(session.memory_session_id.as_deref(), Some("mem-1"));
        assert_eq!(session.status, SessionStatus::Completed);

        let info = info.lock().unwrap();
        assert!(info.processing_message_ids.is_empty());
        assert_eq!(info.cumulative_input_tokens, 100);
        assert_eq!(info.cumulative_output_tokens, 40);
    }

    #[tokio::test]
    async fn empty_reply_leaves_message_processing() {
        let (dir, store) = Store::open_temp();
        let sid = store.create_session("c1", "demo", None, None, None).unwrap();
        store.register_memory_session_id(sid, "m1").unwrap();
        store
            .enqueue(&NewPendingMessage {
                session_db_id: sid,
                content_session_id: "c1".into(),
                message_type: MessageType::Observation,
                tool_name: None,
                tool_input: None,
                tool_response: None,
                cwd: None,
                last_assistant_message: None,
                prompt_number: None,
            })
            .unwrap();

        let deps = deps_with_provider(
            store.clone(),
            dir.path(),
            vec![Err(ProviderError::EmptyReply)],
        );
        let session = store.get_session(sid).unwrap().unwrap();
        let info = Arc::new(Mutex::new(ActiveSessionInfo::from_session(&session)));
        let (_handle, signal) = cancel_pair();

        run_agent(deps, info, signal, Arc::new(Notify::new())).await;

        // Not confirmed: eligible for stale recovery.
        assert_eq!(store.queue_stats().unwrap().processing, 1);
    }

    #[tokio::test]
    async fn cancel_leaves_session_active() {
        let (dir, store) = Store::open_temp();
        let sid = store.create_session("c1", "demo", None, None, None).unwrap();
        store.register_memory_session_id(sid, "m1").unwrap();

        let deps = deps_with_provider(store.clone(), dir.path(), vec![]);
        let session = store.get_session(sid).unwrap().unwrap();
        let info = Arc::new(Mutex::new(ActiveSessionInfo::from_session(&session)));
        let (handle, signal) = cancel_pair();

        let task = tokio::spawn(run_agent(deps, info, signal, Arc::new(Notify::new())));
        handle.cancel();
        task.await.unwrap();

        let session = store.get_session(sid).unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Active);
    }
}
