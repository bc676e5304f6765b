//! Proof orchestration: resolve a manifest, then hand it to the prover.
//!
//! The prover itself is external; this module only sequences it after the
//! request builder and bounds both steps with a single timeout.

use crate::builder::{report, BuilderStage, ManifestSource, RequestBuilder};
use crate::config::PipelineConfig;
use crate::error::{AttestError, AttestResult};
use crate::events::{new_run_id, Emitter, EventBus, PipelineEvent};
use crate::host::BrowserHost;
use crate::manifest::Manifest;
use crate::prepare::PreparationScript;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, info_span, warn, Instrument};

/// Proof generation progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofStatus {
    Constructing,
    Generating,
    Generated,
    Failed,
}

/// Opaque proof produced by the prover.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofResult {
    pub manifest_id: String,
    pub proof: String,
}

/// Failure reported by the prover, with its native code.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("[{code}] {message}")]
pub struct ProverError {
    pub code: String,
    pub message: String,
}

impl ProverError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<ProverError> for AttestError {
    fn from(e: ProverError) -> Self {
        AttestError::Prover {
            code: e.code,
            message: e.message,
        }
    }
}

/// The notarization engine that turns a resolved manifest into a proof.
#[async_trait]
pub trait Prover: Send + Sync {
    async fn generate_proof(&self, manifest: &Manifest) -> Result<String, ProverError>;
}

/// One proof request.
#[derive(Debug, Clone)]
pub struct ProofRequest {
    pub source: ManifestSource,
    /// Overrides the companion script.
    pub prepare_js: Option<PreparationScript>,
    /// Overrides the configured bound.
    pub timeout: Option<Duration>,
}

impl ProofRequest {
    pub fn new(source: impl Into<ManifestSource>) -> Self {
        Self {
            source: source.into(),
            prepare_js: None,
            timeout: None,
        }
    }

    pub fn from_url(url: impl Into<String>) -> Self {
        Self::new(ManifestSource::Url(url.into()))
    }

    pub fn with_prepare_js(mut self, script: impl Into<String>) -> Self {
        self.prepare_js = Some(PreparationScript::new(script));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Composes the request builder with a prover.
pub struct ProofOrchestrator {
    host: Arc<dyn BrowserHost>,
    prover: Arc<dyn Prover>,
    config: PipelineConfig,
    events: EventBus,
}

impl ProofOrchestrator {
    pub fn new(host: Arc<dyn BrowserHost>, prover: Arc<dyn Prover>, config: PipelineConfig) -> Self {
        Self {
            host,
            prover,
            config,
            events: EventBus::default(),
        }
    }

    /// Publish events on an existing bus.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Resolve `source` and generate a proof, all within `timeout`.
    pub async fn generate(
        &self,
        source: impl Into<ManifestSource>,
        timeout: Duration,
    ) -> AttestResult<ProofResult> {
        self.run(ProofRequest::new(source).with_timeout(timeout)).await
    }

    /// Fetch a manifest from `url` and generate a proof under the configured bound.
    pub async fn generate_from_url(&self, url: &str) -> AttestResult<ProofResult> {
        self.run(ProofRequest::from_url(url)).await
    }

    /// Run a full proof request.
    pub async fn run(&self, request: ProofRequest) -> AttestResult<ProofResult> {
        let bound = request.timeout.unwrap_or_else(|| self.config.timeout());
        let emitter = self.events.emitter(new_run_id());
        let span = info_span!("proof", run_id = %emitter.run_id());

        let result = match tokio::time::timeout(bound, self.resolve_and_prove(request, &emitter))
            .instrument(span)
            .await
        {
            Ok(result) => result,
            Err(_) => {
                warn!(run_id = %emitter.run_id(), "proof generation timed out after {}ms", bound.as_millis());
                Err(AttestError::Timeout { after: bound })
            }
        };

        if result.is_err() {
            status(&emitter, ProofStatus::Failed);
            report(&emitter, &result);
        }
        result
    }

    async fn resolve_and_prove(
        &self,
        request: ProofRequest,
        emitter: &Emitter,
    ) -> AttestResult<ProofResult> {
        status(emitter, ProofStatus::Constructing);
        let manifest = RequestBuilder::new(self.host.as_ref())
            .with_config(self.config.clone())
            .source(request.source)
            .preparation_script(request.prepare_js)
            .build_unbounded(emitter)
            .await?;
        stage_done(emitter);

        status(emitter, ProofStatus::Generating);
        info!(manifest_id = %manifest.id, "generating proof");
        let proof = self.prover.generate_proof(&manifest).await?;

        status(emitter, ProofStatus::Generated);
        info!(manifest_id = %manifest.id, bytes = proof.len(), "proof generated");
        Ok(ProofResult {
            manifest_id: manifest.id,
            proof,
        })
    }
}

fn stage_done(emitter: &Emitter) {
    emitter.emit(PipelineEvent::StageChanged {
        stage: BuilderStage::Done,
    });
}

fn status(emitter: &Emitter, status: ProofStatus) {
    emitter.emit(PipelineEvent::ProofStatus { status });
}
