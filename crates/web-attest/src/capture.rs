//! Browser capture session.
//!
//! A session presents one surface for one manifest and republishes every
//! capture the surface delivers. It knows nothing about extraction.
//!
//! States: `Idle → Presenting → Capturing → Completed | Failed`. Any error
//! moves the session to `Failed` and drops the surface; completion and
//! cancellation close it. Dropping the session drops the surface, so an
//! abandoned session never leaks a presented page.

use crate::error::{AttestError, AttestResult};
use crate::host::{BrowserHost, CookieRecord, HostSurface, RawCapture, SurfaceTarget};
use crate::manifest::Manifest;
use crate::prepare::ScriptContext;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Where a capture session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Presenting,
    Capturing,
    Completed,
    Failed,
}

/// Snapshot handed to extraction after a capture signal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapturedArtifacts {
    /// Cookies by name, merged across deliveries (latest wins).
    pub cookies: BTreeMap<String, CookieRecord>,
    /// DOM text as of the latest delivery.
    pub dom: String,
    /// Variable values supplied by a preparation script.
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
}

impl CapturedArtifacts {
    /// Build artifacts from one raw capture. Duplicate cookie names resolve
    /// to the last record.
    pub fn from_raw(raw: RawCapture) -> Self {
        let mut artifacts = Self {
            dom: raw.dom,
            ..Default::default()
        };
        for cookie in raw.cookies {
            artifacts.cookies.insert(cookie.name.clone(), cookie);
        }
        artifacts
    }

    pub fn cookie_value(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(|c| c.value.as_str())
    }
}

/// One capture attempt against a host surface.
pub struct CaptureSession<'h> {
    host: &'h dyn BrowserHost,
    target: SurfaceTarget,
    surface: Option<Box<dyn HostSurface>>,
    state: SessionState,
    failure: Option<String>,
    cookies: BTreeMap<String, CookieRecord>,
    deliveries: u32,
}

impl<'h> CaptureSession<'h> {
    /// Prepare a session for `manifest`. Fails when the manifest has no
    /// page to capture.
    pub fn new(host: &'h dyn BrowserHost, manifest: &Manifest) -> AttestResult<Self> {
        let url = manifest.prepare_url.clone().ok_or_else(|| {
            AttestError::CaptureFailure(format!(
                "manifest `{}` has no prepareUrl to capture",
                manifest.id
            ))
        })?;
        Ok(Self {
            host,
            target: SurfaceTarget {
                url,
                manifest_id: manifest.id.clone(),
                title: manifest.title.clone(),
            },
            surface: None,
            state: SessionState::Idle,
            failure: None,
            cookies: BTreeMap::new(),
            deliveries: 0,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Cause of the failure, once the session is `Failed`.
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn target(&self) -> &SurfaceTarget {
        &self.target
    }

    /// Number of captures delivered so far.
    pub fn deliveries(&self) -> u32 {
        self.deliveries
    }

    /// Open the surface on the target page.
    pub async fn present(&mut self) -> AttestResult<()> {
        if self.state != SessionState::Idle {
            return Err(AttestError::CaptureFailure(format!(
                "cannot present a session in state {:?}",
                self.state
            )));
        }
        match self.host.open_surface(&self.target).await {
            Ok(surface) => {
                info!(url = %self.target.url, manifest_id = %self.target.manifest_id, "capture surface presented");
                self.surface = Some(surface);
                self.state = SessionState::Presenting;
                Ok(())
            }
            Err(e) => Err(self.fail(format!("failed to present {}: {e}", self.target.url))),
        }
    }

    /// Wait for the next capture.
    ///
    /// Returns `Ok(None)` once the user closes the surface.
    pub async fn next_artifacts(&mut self) -> AttestResult<Option<CapturedArtifacts>> {
        if !matches!(self.state, SessionState::Presenting | SessionState::Capturing) {
            return Err(AttestError::CaptureFailure(format!(
                "no capture available in state {:?}",
                self.state
            )));
        }
        let surface = self
            .surface
            .as_mut()
            .ok_or_else(|| AttestError::CaptureFailure("surface already released".into()))?;

        match surface.next_capture().await {
            Ok(Some(raw)) => {
                self.state = SessionState::Capturing;
                self.deliveries += 1;
                for cookie in raw.cookies {
                    self.cookies.insert(cookie.name.clone(), cookie);
                }
                debug!(
                    delivery = self.deliveries,
                    cookies = self.cookies.len(),
                    dom_bytes = raw.dom.len(),
                    "capture delivered"
                );
                Ok(Some(CapturedArtifacts {
                    cookies: self.cookies.clone(),
                    dom: raw.dom,
                    vars: BTreeMap::new(),
                }))
            }
            Ok(None) => {
                info!(url = %self.target.url, "capture surface closed by user");
                self.surface = None;
                self.state = SessionState::Completed;
                Ok(None)
            }
            Err(e) => Err(self.fail(format!("capture surface failed: {e}"))),
        }
    }

    /// All remaining captures as a stream. Ends after the surface closes or
    /// after the first error.
    pub fn artifacts(&mut self) -> BoxStream<'_, AttestResult<CapturedArtifacts>> {
        Box::pin(async_stream::stream! {
            loop {
                match self.next_artifacts().await {
                    Ok(Some(a)) => yield Ok(a),
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
        })
    }

    /// Finish the session and close the surface.
    pub async fn complete(mut self) {
        self.state = SessionState::Completed;
        self.release().await;
    }

    /// Abandon the session and close the surface.
    pub async fn cancel(mut self) {
        self.state = SessionState::Failed;
        self.failure = Some("cancelled".into());
        self.release().await;
    }

    async fn release(&mut self) {
        if let Some(surface) = self.surface.take() {
            if let Err(e) = surface.close().await {
                warn!("failed to close capture surface: {e}");
            }
        }
    }

    fn fail(&mut self, cause: String) -> AttestError {
        warn!(url = %self.target.url, "{cause}");
        self.surface = None;
        self.state = SessionState::Failed;
        self.failure = Some(cause.clone());
        AttestError::CaptureFailure(cause)
    }
}

#[async_trait]
impl ScriptContext for CaptureSession<'_> {
    async fn evaluate(&mut self, script: &str) -> AttestResult<serde_json::Value> {
        let surface = self
            .surface
            .as_mut()
            .ok_or_else(|| AttestError::CaptureFailure("surface already released".into()))?;
        surface
            .run_script(script)
            .await
            .map_err(|e| AttestError::CaptureFailure(e.to_string()))
    }
}

impl Drop for CaptureSession<'_> {
    fn drop(&mut self) {
        if self.surface.is_some() {
            debug!(url = %self.target.url, "capture session dropped; releasing surface");
        }
    }
}
