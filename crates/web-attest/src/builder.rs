//! Request builder: turns a manifest (or its URL) into a resolved manifest.
//!
//! ```text
//! Start → FetchingManifest? → Direct ───────────────────────────→ Done
//!                           ↘ Presenting → Resolving ⟲ (redelivery) → Done
//!                                                              ↘ Errored
//! ```
//!
//! Every run produces exactly one result. The whole run is bounded by a
//! timeout; when it fires, the in-flight fetch or capture is dropped and
//! the capture surface is released with it.

use crate::capture::CaptureSession;
use crate::config::{PipelineConfig, RedeliveryPolicy};
use crate::error::{AttestError, AttestResult};
use crate::events::{new_run_id, Emitter, EventBus, PipelineEvent};
use crate::extract;
use crate::fetch::ResourceFetcher;
use crate::host::{BrowserHost, HostCapability};
use crate::manifest::Manifest;
use crate::prepare::{PreparationOutcome, PreparationScript};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, info_span, warn, Instrument};

/// Where a build is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuilderStage {
    Start,
    FetchingManifest,
    /// No capture needed; the manifest is passed through.
    Direct,
    Presenting,
    Resolving,
    Done,
    Errored,
}

/// Where the manifest comes from.
#[derive(Debug, Clone)]
pub enum ManifestSource {
    Inline(Manifest),
    Url(String),
}

impl From<Manifest> for ManifestSource {
    fn from(m: Manifest) -> Self {
        ManifestSource::Inline(m)
    }
}

/// Builds one resolved manifest.
pub struct RequestBuilder<'h> {
    host: &'h dyn BrowserHost,
    config: PipelineConfig,
    source: Option<ManifestSource>,
    prepare_js: Option<PreparationScript>,
    timeout: Option<Duration>,
    events: Option<EventBus>,
    fetcher: Option<ResourceFetcher>,
}

impl<'h> RequestBuilder<'h> {
    pub fn new(host: &'h dyn BrowserHost) -> Self {
        Self {
            host,
            config: PipelineConfig::default(),
            source: None,
            prepare_js: None,
            timeout: None,
            events: None,
            fetcher: None,
        }
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Use this manifest directly; no fetch happens.
    pub fn manifest(mut self, manifest: Manifest) -> Self {
        self.source = Some(ManifestSource::Inline(manifest));
        self
    }

    /// Fetch the manifest (and its companion script) from `url`.
    pub fn manifest_url(mut self, url: impl Into<String>) -> Self {
        self.source = Some(ManifestSource::Url(url.into()));
        self
    }

    pub fn source(mut self, source: ManifestSource) -> Self {
        self.source = Some(source);
        self
    }

    /// Preparation script to use instead of the companion script.
    pub fn prepare_js(mut self, script: impl Into<String>) -> Self {
        let script = PreparationScript::new(script);
        self.prepare_js = (!script.is_blank()).then_some(script);
        self
    }

    pub fn preparation_script(mut self, script: Option<PreparationScript>) -> Self {
        self.prepare_js = script.filter(|s| !s.is_blank());
        self
    }

    /// Override the configured overall bound.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn events(mut self, bus: &EventBus) -> Self {
        self.events = Some(bus.clone());
        self
    }

    pub fn fetcher(mut self, fetcher: ResourceFetcher) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Run the pipeline under its timeout.
    pub async fn build(self) -> AttestResult<Manifest> {
        let bound = self.timeout.unwrap_or_else(|| self.config.timeout());
        let emitter = self.emitter();
        let span = info_span!("request_builder", run_id = %emitter.run_id());

        let result = match tokio::time::timeout(bound, self.run(&emitter))
            .instrument(span)
            .await
        {
            Ok(result) => result,
            Err(_) => {
                warn!(run_id = %emitter.run_id(), "request builder timed out after {}ms", bound.as_millis());
                Err(AttestError::Timeout { after: bound })
            }
        };
        report(&emitter, &result);
        result
    }

    /// Run without a timeout or final report; the caller owns both.
    pub(crate) async fn build_unbounded(self, emitter: &Emitter) -> AttestResult<Manifest> {
        self.run(emitter).await
    }

    fn emitter(&self) -> Emitter {
        self.events
            .clone()
            .unwrap_or_default()
            .emitter(new_run_id())
    }

    async fn run(self, emitter: &Emitter) -> AttestResult<Manifest> {
        stage(emitter, BuilderStage::Start);

        if let HostCapability::Unsupported(reason) = self.host.capability() {
            return Err(AttestError::UnsupportedPlatform(reason));
        }

        let fetcher = self
            .fetcher
            .clone()
            .unwrap_or_else(|| ResourceFetcher::new(&self.config));

        let (manifest, manifest_url) = match self.source {
            Some(ManifestSource::Inline(m)) => (m, None),
            Some(ManifestSource::Url(url)) => {
                stage(emitter, BuilderStage::FetchingManifest);
                let m = fetcher.fetch_manifest(&url).await?;
                emitter.emit(PipelineEvent::ManifestFetched {
                    id: m.id.clone(),
                    url: url.clone(),
                });
                (m, Some(url))
            }
            None => return Err(AttestError::MissingInput),
        };

        if !manifest.requires_capture() {
            info!(manifest_id = %manifest.id, "no prepareUrl; manifest used as-is");
            stage(emitter, BuilderStage::Direct);
            return Ok(manifest);
        }

        let script = match (self.prepare_js, manifest_url) {
            (Some(script), _) => Some(script),
            (None, Some(url)) => {
                let found = fetcher.fetch_companion_script(&url).await;
                emitter.emit(PipelineEvent::CompanionScript {
                    url: fetcher
                        .companion_url_for(&url)
                        .map(|u| u.to_string())
                        .unwrap_or_default(),
                    found: found.is_some(),
                });
                found
            }
            (None, None) => None,
        };

        capture_and_resolve(self.host, &manifest, script, self.config.redelivery, emitter).await
    }
}

async fn capture_and_resolve(
    host: &dyn BrowserHost,
    manifest: &Manifest,
    script: Option<PreparationScript>,
    policy: RedeliveryPolicy,
    emitter: &Emitter,
) -> AttestResult<Manifest> {
    stage(emitter, BuilderStage::Presenting);
    let mut session = CaptureSession::new(host, manifest)?;
    session.present().await?;
    emitter.emit(PipelineEvent::SurfacePresented {
        target: session.target().url.clone(),
    });

    let mut last_error: Option<AttestError> = None;
    loop {
        let Some(artifacts) = session.next_artifacts().await? else {
            return Err(last_error.unwrap_or_else(|| {
                AttestError::CaptureFailure("surface closed before a capture was delivered".into())
            }));
        };

        let attempt = session.deliveries();
        emitter.emit(PipelineEvent::ArtifactsDelivered {
            attempt,
            cookies: artifacts.cookies.len(),
            dom_bytes: artifacts.dom.len(),
        });
        stage(emitter, BuilderStage::Resolving);

        let (resolved, outcome) =
            extract::resolve_prepared(&mut session, manifest, artifacts, script.as_ref()).await;
        if let PreparationOutcome::Failed(reason) = outcome {
            emitter.emit(PipelineEvent::PreparationFailed { reason });
        }

        match resolved {
            Ok(resolved) => {
                session.complete().await;
                emitter.emit(PipelineEvent::ManifestResolved {
                    id: resolved.id.clone(),
                });
                info!(manifest_id = %resolved.id, attempt, "manifest resolved");
                return Ok(resolved);
            }
            Err(e) => {
                if let AttestError::Extraction { variable, reason } = &e {
                    emitter.emit(PipelineEvent::ExtractionFailed {
                        attempt,
                        variable: variable.clone(),
                        reason: reason.to_string(),
                    });
                }
                let retry = match policy {
                    RedeliveryPolicy::Terminal => false,
                    RedeliveryPolicy::RetryOnUpdate { max_attempts } => attempt < max_attempts,
                };
                if !retry {
                    session.cancel().await;
                    return Err(e);
                }
                info!(attempt, "extraction failed ({e}); waiting for the next capture");
                last_error = Some(e);
            }
        }
    }
}

fn stage(emitter: &Emitter, stage: BuilderStage) {
    tracing::debug!(?stage, "request builder stage");
    emitter.emit(PipelineEvent::StageChanged { stage });
}

/// Emit the terminal stage for a finished run.
pub(crate) fn report<T>(emitter: &Emitter, result: &AttestResult<T>) {
    match result {
        Ok(_) => stage(emitter, BuilderStage::Done),
        Err(e) => {
            stage(emitter, BuilderStage::Errored);
            emitter.emit(PipelineEvent::PipelineFailed {
                code: e.code().to_string(),
                message: e.to_string(),
            });
        }
    }
}
