//! Response processor
//!
//! Takes the raw assistant text from a provider turn and lands it:
//! parse, validate against the active mode's vocabulary, store all records
//! and the queue confirmation in one transaction, then best-effort mirror
//! and broadcast. Commit-then-mirror ordering is what SSE subscribers and
//! the vector mirror are allowed to assume.

mod parse;

pub use parse::{parse_reply, ParsedObservation, ParsedReply, ParsedSummary};

use crate::events::{FrameSender, ObservationFrame, ObservationPayload};
use crate::modes::Mode;
use crate::store::{NewObservation, NewSummary, PendingMessage, Store, StoredBatch};
use crate::vector::VectorMirror;
use std::sync::Arc;

/// Outcome of processing one provider reply.
#[derive(Debug)]
pub enum ProcessOutcome {
    /// Records stored (possibly zero) and the message confirmed.
    Stored { observation_ids: Vec<i64>, summary_id: Option<i64> },
    /// The reply had markers but nothing usable; message left processing
    /// for stale recovery.
    ParseFailed,
}

pub struct ResponseProcessor {
    store: Store,
    mirror: Arc<VectorMirror>,
    frames: FrameSender,
}

impl ResponseProcessor {
    pub fn new(store: Store, mirror: Arc<VectorMirror>, frames: FrameSender) -> Self {
        Self { store, mirror, frames }
    }

    /// Process one reply for one claimed message.
    ///
    /// Store failure propagates as an error (the transaction rolled back,
    /// the message stays `processing`); parse failure returns
    /// `ParseFailed` without confirming.
    #[allow(clippy::too_many_arguments)]
    pub fn process_reply(
        &self,
        mode: &Mode,
        message: &PendingMessage,
        memory_session_id: &str,
        project: &str,
        reply_text: &str,
        discovery_tokens: u64,
    ) -> anyhow::Result<ProcessOutcome> {
        let parsed = parse_reply(reply_text);

        if parsed.observations.is_empty()
            && parsed.summary.is_none()
            && parse::has_markers(reply_text)
        {
            tracing::warn!(
                "Reply for message {} had markers but no parseable blocks",
                message.id
            );
            return Ok(ProcessOutcome::ParseFailed);
        }

        let observations: Vec<NewObservation> = parsed
            .observations
            .iter()
            .map(|o| validate_observation(mode, o))
            .collect();
        let summary = parsed.summary.as_ref().map(summary_to_new);

        if observations.is_empty() && summary.is_none() {
            // Valid empty reply: nothing worth remembering, but the work
            // is done. Confirm so the message does not recycle forever.
            if !self.store.confirm_message(message.id)? {
                anyhow::bail!("message {} no longer processing", message.id);
            }
            return Ok(ProcessOutcome::Stored {
                observation_ids: Vec::new(),
                summary_id: None,
            });
        }

        let batch = self.store.store_observations(
            memory_session_id,
            project,
            &observations,
            summary.as_ref(),
            message.prompt_number,
            discovery_tokens as i64,
            None,
            Some(message.id),
        )?;

        // Relational commit is done; everything after is best-effort.
        self.mirror_and_broadcast(&batch);

        Ok(ProcessOutcome::Stored {
            observation_ids: batch.observation_ids,
            summary_id: batch.summary_id,
        })
    }

    fn mirror_and_broadcast(&self, batch: &StoredBatch) {
        for id in &batch.observation_ids {
            if batch.deduplicated.contains(id) {
                continue; // already mirrored and announced the first time
            }
            match self.store.get_observation(*id) {
                Ok(Some(obs)) => {
                    let frame = ObservationFrame::new(
                        ObservationPayload {
                            id: obs.id,
                            memory_session_id: obs.memory_session_id.clone(),
                            project: obs.project.clone(),
                            observation_type: obs.observation_type.clone(),
                            title: obs.title.clone(),
                            subtitle: obs.subtitle.clone(),
                            narrative: obs.narrative.clone(),
                            created_at_epoch: obs.created_at_epoch,
                        },
                        batch.created_at_epoch,
                    );
                    // A send only fails with zero subscribers; that is fine.
                    let _ = self.frames.send(frame);
                    self.mirror.sync_observation(&obs);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("Could not re-read observation {}: {}", id, e),
            }
        }

        if let Some(summary_id) = batch.summary_id {
            match self.store.get_summary(summary_id) {
                Ok(Some(summary)) => self.mirror.sync_summary(&summary),
                Ok(None) => {}
                Err(e) => tracing::warn!("Could not re-read summary {}: {}", summary_id, e),
            }
        }
    }
}

/// Apply the mode vocabulary: unknown type maps to the default, concepts
/// outside the vocabulary are dropped.
fn validate_observation(mode: &Mode, parsed: &ParsedObservation) -> NewObservation {
    let allowed_concepts = mode.concept_ids();
    NewObservation {
        observation_type: mode.resolve_type(&parsed.observation_type).to_string(),
        title: parsed.title.clone(),
        subtitle: parsed.subtitle.clone(),
        facts: parsed.facts.clone(),
        narrative: parsed.narrative.clone(),
        concepts: parsed
            .concepts
            .iter()
            .filter(|c| allowed_concepts.contains(c))
            .cloned()
            .collect(),
        files_read: parsed.files_read.clone(),
        files_modified: parsed.files_modified.clone(),
    }
}

fn summary_to_new(parsed: &ParsedSummary) -> NewSummary {
    NewSummary {
        request: parsed.request.clone(),
        investigated: parsed.investigated.clone(),
        learned: parsed.learned.clone(),
        completed: parsed.completed.clone(),
        next_steps: parsed.next_steps.clone(),
        files_read: parsed.files_read.clone(),
        files_edited: parsed.files_edited.clone(),
        notes: parsed.notes.clone(),
    }
}
