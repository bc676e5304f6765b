//! Pipeline event bus: progress reporting for every stage.
//!
//! The [`EventBus`] is a `tokio::sync::broadcast` channel carrying
//! [`PipelineEvent`] values stamped with the run that produced them. UIs and
//! logs subscribe independently; with no subscribers, events are dropped.

use crate::builder::BuilderStage;
use crate::prover::ProofStatus;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Default buffer for a bus created by the pipeline itself.
pub const DEFAULT_CAPACITY: usize = 64;

/// Everything the pipeline reports while it runs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PipelineEvent {
    /// The request builder moved to a new stage.
    StageChanged { stage: BuilderStage },
    /// A manifest was downloaded and parsed.
    ManifestFetched { id: String, url: String },
    /// Outcome of the companion script lookup.
    CompanionScript { url: String, found: bool },
    /// A capture surface was opened on the target page.
    SurfacePresented { target: String },
    /// The surface delivered a capture.
    ArtifactsDelivered {
        attempt: u32,
        cookies: usize,
        dom_bytes: usize,
    },
    /// The preparation script failed; extraction continues on the raw capture.
    PreparationFailed { reason: String },
    /// Extraction failed on one delivery.
    ExtractionFailed {
        attempt: u32,
        variable: String,
        reason: String,
    },
    /// The manifest is ready for proof generation.
    ManifestResolved { id: String },
    /// Proof generation progress.
    ProofStatus { status: ProofStatus },
    /// The pipeline ended with an error.
    PipelineFailed { code: String, message: String },
}

/// An event together with the run that emitted it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub run_id: String,
    pub timestamp: String,
    #[serde(flatten)]
    pub event: PipelineEvent,
}

/// Broadcast bus for pipeline events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    /// Create a new event bus with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    /// Emitter bound to a single run.
    pub fn emitter(&self, run_id: impl Into<String>) -> Emitter {
        Emitter {
            run_id: run_id.into(),
            sender: self.sender.clone(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Emits events stamped with one run id.
#[derive(Clone)]
pub struct Emitter {
    run_id: String,
    sender: broadcast::Sender<EventEnvelope>,
}

impl Emitter {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Emit an event. Silently ignored if nobody is listening.
    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.sender.send(EventEnvelope {
            run_id: self.run_id.clone(),
            timestamp: now_timestamp(),
            event,
        });
    }
}

/// Fresh run identifier.
pub fn new_run_id() -> String {
    format!("run-{}", uuid::Uuid::new_v4())
}

/// RFC 3339 timestamp for the current time.
pub fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}
