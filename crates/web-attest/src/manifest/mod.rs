//! Manifest model: parsing, validation, and placeholder introspection.

pub mod template;
pub mod types;

pub use types::*;

use crate::error::{AttestError, AttestResult};
use std::collections::BTreeSet;

impl Manifest {
    /// Parse a manifest from its JSON wire format.
    ///
    /// Unknown request methods fail with [`AttestError::InvalidMethod`];
    /// every other missing or mistyped required field fails with
    /// [`AttestError::Parse`].
    pub fn parse(raw: &str) -> AttestResult<Self> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        Self::from_value(value)
    }

    /// Build a manifest from an already-decoded JSON value.
    pub fn from_value(value: serde_json::Value) -> AttestResult<Self> {
        check_methods(&value)?;
        let manifest: Manifest = serde_json::from_value(value)?;
        Ok(manifest)
    }

    /// Serialize to the JSON wire format.
    pub fn to_json(&self) -> AttestResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Whether a live browser capture must happen before proof generation.
    pub fn requires_capture(&self) -> bool {
        self.prepare_url.is_some()
    }

    /// Every variable name referenced by a placeholder anywhere in the
    /// request template, including the override.
    pub fn placeholders(&self) -> BTreeSet<String> {
        self.request
            .templated_fields()
            .flat_map(template::placeholders)
            .map(str::to_string)
            .collect()
    }

    /// A manifest is resolved when no placeholders or extraction rules remain.
    pub fn is_resolved(&self) -> bool {
        self.placeholders().is_empty()
            && self.request.vars.as_ref().map_or(true, |v| v.is_empty())
    }
}

impl RequestTemplate {
    /// All string fields that may carry placeholders.
    pub(crate) fn templated_fields(&self) -> impl Iterator<Item = &str> {
        let base = std::iter::once(self.url.as_str())
            .chain(self.headers.iter().flat_map(|(k, v)| [k.as_str(), v.as_str()]))
            .chain(self.body.as_deref());
        let extra = self.extra.iter().flat_map(|e| {
            e.url
                .as_deref()
                .into_iter()
                .chain(
                    e.headers
                        .iter()
                        .flatten()
                        .flat_map(|(k, v)| [k.as_str(), v.as_str()]),
                )
                .chain(e.body.as_deref())
        });
        base.chain(extra)
    }
}

fn check_methods(value: &serde_json::Value) -> AttestResult<()> {
    let request = value.get("request");
    let candidates = [
        request.and_then(|r| r.get("method")),
        request
            .and_then(|r| r.get("extra"))
            .and_then(|e| e.get("method")),
    ];
    for method in candidates.into_iter().flatten() {
        if let Some(m) = method.as_str() {
            m.parse::<Method>().map_err(AttestError::InvalidMethod)?;
        }
    }
    Ok(())
}
