//! Preparation scripts: opaque JS run in the captured page before extraction.
//!
//! The script's completion value may annotate the capture. When it evaluates
//! to an object, these keys are honored:
//!
//! - `dom`: string replacing the DOM snapshot
//! - `cookies`: `{ name: value }` merged into the cookie map
//! - `vars`: `{ name: value }` used as the variable's source text; the
//!   rule's regex still applies when it has one
//!
//! Anything else is ignored. A failing script never discards the capture.

use crate::capture::CapturedArtifacts;
use crate::error::AttestResult;
use crate::host::CookieRecord;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

/// Script source, never parsed by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparationScript(String);

impl PreparationScript {
    pub fn new(source: impl Into<String>) -> Self {
        Self(source.into())
    }

    pub fn source(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

/// Somewhere a preparation script can be evaluated.
#[async_trait]
pub trait ScriptContext: Send {
    async fn evaluate(&mut self, script: &str) -> AttestResult<Value>;
}

/// What happened when the preparation script ran.
#[derive(Debug, Clone, PartialEq)]
pub enum PreparationOutcome {
    /// No script, or a blank one.
    Skipped,
    /// The script completed; `annotated` is true when it changed the capture.
    Applied { annotated: bool },
    /// The script failed; the capture is unchanged.
    Failed(String),
}

/// Run `script` in `ctx` and apply its annotations to `artifacts`.
pub async fn run_preparation(
    ctx: &mut dyn ScriptContext,
    script: Option<&PreparationScript>,
    mut artifacts: CapturedArtifacts,
) -> (CapturedArtifacts, PreparationOutcome) {
    let script = match script {
        Some(s) if !s.is_blank() => s,
        _ => return (artifacts, PreparationOutcome::Skipped),
    };

    match ctx.evaluate(script.source()).await {
        Ok(value) => {
            let annotated = annotate(&mut artifacts, &value);
            debug!(annotated, "preparation script completed");
            (artifacts, PreparationOutcome::Applied { annotated })
        }
        Err(e) => {
            warn!("preparation script failed: {e}");
            (artifacts, PreparationOutcome::Failed(e.to_string()))
        }
    }
}

fn annotate(artifacts: &mut CapturedArtifacts, value: &Value) -> bool {
    let Some(obj) = value.as_object() else {
        return false;
    };
    let mut changed = false;

    match obj.get("dom") {
        Some(Value::String(dom)) => {
            artifacts.dom = dom.clone();
            changed = true;
        }
        Some(other) => warn!("ignoring non-string `dom` annotation: {other}"),
        None => {}
    }

    if let Some(cookies) = obj.get("cookies").and_then(Value::as_object) {
        for (name, v) in cookies {
            let Some(value) = scalar_text(v) else {
                warn!(cookie = %name, "ignoring non-scalar cookie annotation");
                continue;
            };
            artifacts
                .cookies
                .entry(name.clone())
                .and_modify(|c| c.value = value.clone())
                .or_insert_with(|| CookieRecord::new(name.clone(), value.clone()));
            changed = true;
        }
    }

    if let Some(vars) = obj.get("vars").and_then(Value::as_object) {
        for (name, v) in vars {
            let Some(value) = scalar_text(v) else {
                warn!(variable = %name, "ignoring non-scalar variable annotation");
                continue;
            };
            artifacts.vars.insert(name.clone(), value);
            changed = true;
        }
    }

    changed
}

fn scalar_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
