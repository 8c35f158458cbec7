//! Worker state shared across HTTP handlers

use crate::agent::SessionRegistry;
use crate::compose::Composer;
use crate::config::Settings;
use crate::events::FrameSender;
use crate::modes::Mode;
use crate::store::Store;
use crate::vector::VectorMirror;
use std::sync::Arc;

/// Shared state for the worker HTTP surface. Writes go through the queue;
/// reads go straight to the store, so no handler can block an agent loop.
#[derive(Clone)]
pub struct WorkerState {
    pub store: Store,
    pub registry: Arc<SessionRegistry>,
    pub composer: Arc<Composer>,
    pub mirror: Arc<VectorMirror>,
    pub frames: FrameSender,
    pub mode: Arc<Mode>,
    /// Startup settings; display settings are re-resolved per request.
    pub settings: Arc<Settings>,
}
