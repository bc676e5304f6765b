//! A host that replays a fixed sequence of captures.
//!
//! Used to resolve manifests against recorded sessions without a browser,
//! and to drive the pipeline deterministically in tests.

use super::{BrowserHost, HostCapability, HostError, HostResult, HostSurface, RawCapture, SurfaceTarget};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One scripted surface event.
#[derive(Debug, Clone)]
pub enum ScriptedStep {
    /// Deliver a capture.
    Capture(RawCapture),
    /// Deliver a capture after a delay.
    Delayed(Duration, RawCapture),
    /// Fail with a host error.
    Fail(String),
    /// The user closes the surface.
    Close,
}

/// How `run_script` answers.
#[derive(Debug, Clone)]
pub enum ScriptReply {
    Value(serde_json::Value),
    Fail(String),
}

/// Counters shared by a scripted host and its surfaces.
#[derive(Debug, Default)]
pub struct ScriptedStats {
    opened: AtomicUsize,
    closed: AtomicUsize,
    released: AtomicUsize,
    targets: Mutex<Vec<SurfaceTarget>>,
    scripts: Mutex<Vec<String>>,
}

impl ScriptedStats {
    /// Surfaces opened.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Surfaces closed through `close`.
    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Surfaces torn down by any path (graceful close or drop).
    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Targets surfaces were opened on.
    pub fn targets(&self) -> Vec<SurfaceTarget> {
        self.targets.lock().map(|t| t.clone()).unwrap_or_default()
    }

    /// Scripts evaluated, in order.
    pub fn scripts(&self) -> Vec<String> {
        self.scripts.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

/// A [`BrowserHost`] whose surfaces replay `steps`. Once the steps run out
/// the surface waits forever, like a user who never finishes.
pub struct ScriptedHost {
    steps: Vec<ScriptedStep>,
    reply: ScriptReply,
    capability: HostCapability,
    open_error: Option<String>,
    stats: Arc<ScriptedStats>,
}

impl ScriptedHost {
    pub fn new(steps: Vec<ScriptedStep>) -> Self {
        Self {
            steps,
            reply: ScriptReply::Value(serde_json::Value::Null),
            capability: HostCapability::Supported,
            open_error: None,
            stats: Arc::new(ScriptedStats::default()),
        }
    }

    /// Replay a single recorded capture, then report the surface closed.
    pub fn replay(capture: RawCapture) -> Self {
        Self::new(vec![ScriptedStep::Capture(capture), ScriptedStep::Close])
    }

    pub fn with_script_reply(mut self, reply: ScriptReply) -> Self {
        self.reply = reply;
        self
    }

    pub fn with_capability(mut self, capability: HostCapability) -> Self {
        self.capability = capability;
        self
    }

    /// Make `open_surface` fail, e.g. to simulate a navigation failure.
    pub fn failing_open(mut self, reason: impl Into<String>) -> Self {
        self.open_error = Some(reason.into());
        self
    }

    pub fn stats(&self) -> Arc<ScriptedStats> {
        Arc::clone(&self.stats)
    }
}

#[async_trait]
impl BrowserHost for ScriptedHost {
    fn capability(&self) -> HostCapability {
        self.capability.clone()
    }

    async fn open_surface(&self, target: &SurfaceTarget) -> HostResult<Box<dyn HostSurface>> {
        if let Some(reason) = &self.open_error {
            return Err(HostError::Navigation(reason.clone()));
        }
        self.stats.opened.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut targets) = self.stats.targets.lock() {
            targets.push(target.clone());
        }
        Ok(Box::new(ScriptedSurface {
            steps: self.steps.iter().cloned().collect(),
            reply: self.reply.clone(),
            stats: Arc::clone(&self.stats),
        }))
    }
}

struct ScriptedSurface {
    steps: VecDeque<ScriptedStep>,
    reply: ScriptReply,
    stats: Arc<ScriptedStats>,
}

#[async_trait]
impl HostSurface for ScriptedSurface {
    async fn next_capture(&mut self) -> HostResult<Option<RawCapture>> {
        match self.steps.pop_front() {
            Some(ScriptedStep::Capture(raw)) => Ok(Some(raw)),
            Some(ScriptedStep::Delayed(delay, raw)) => {
                tokio::time::sleep(delay).await;
                Ok(Some(raw))
            }
            Some(ScriptedStep::Fail(reason)) => Err(HostError::Other(reason)),
            Some(ScriptedStep::Close) => Ok(None),
            None => futures::future::pending().await,
        }
    }

    async fn run_script(&mut self, script: &str) -> HostResult<serde_json::Value> {
        if let Ok(mut scripts) = self.stats.scripts.lock() {
            scripts.push(script.to_string());
        }
        match &self.reply {
            ScriptReply::Value(v) => Ok(v.clone()),
            ScriptReply::Fail(reason) => Err(HostError::Script(reason.clone())),
        }
    }

    async fn close(self: Box<Self>) -> HostResult<()> {
        self.stats.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for ScriptedSurface {
    fn drop(&mut self) {
        self.stats.released.fetch_add(1, Ordering::SeqCst);
    }
}
