//! Manifest and companion script retrieval over HTTP.
//!
//! Plain GETs, no retries. A missing companion script is never an error.

use crate::config::PipelineConfig;
use crate::error::{AttestError, AttestResult};
use crate::manifest::Manifest;
use crate::prepare::PreparationScript;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// HTTP client for manifest resources.
#[derive(Clone)]
pub struct ResourceFetcher {
    client: reqwest::Client,
    timeout: Duration,
    companion_filename: String,
}

impl ResourceFetcher {
    /// Create a fetcher from pipeline configuration.
    pub fn new(config: &PipelineConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.fetch_timeout())
            .redirect(reqwest::redirect::Policy::limited(5))
            .user_agent(config.user_agent.as_str())
            .build()
            .unwrap_or_default();

        Self {
            client,
            timeout: config.fetch_timeout(),
            companion_filename: config.companion_filename.clone(),
        }
    }

    /// Download and parse a manifest.
    ///
    /// Any transport failure, non-success status, non-UTF-8 body or parse
    /// failure is reported as [`AttestError::Fetch`].
    pub async fn fetch_manifest(&self, url: &str) -> AttestResult<Manifest> {
        info!(url = %url, "fetching manifest");
        let body = self.get_text(url).await.map_err(|cause| AttestError::Fetch {
            url: url.to_string(),
            cause,
        })?;

        let manifest = Manifest::parse(&body).map_err(|e| AttestError::Fetch {
            url: url.to_string(),
            cause: e.to_string(),
        })?;
        debug!(url = %url, id = %manifest.id, "manifest parsed");
        Ok(manifest)
    }

    /// Fetch the optional companion script that sits next to a manifest.
    ///
    /// Returns `None` on any failure: bad URL, transport error, non-success
    /// status, a body that is not UTF-8, or an empty body.
    pub async fn fetch_companion_script(&self, manifest_url: &str) -> Option<PreparationScript> {
        let url = match companion_url(manifest_url, &self.companion_filename) {
            Some(u) => u,
            None => {
                warn!(url = %manifest_url, "cannot derive companion script URL");
                return None;
            }
        };

        match self.get_text(url.as_str()).await {
            Ok(body) if !body.trim().is_empty() => {
                debug!(url = %url, bytes = body.len(), "companion script found");
                Some(PreparationScript::new(body))
            }
            Ok(_) => {
                debug!(url = %url, "companion script is empty; ignoring");
                None
            }
            Err(cause) => {
                debug!(url = %url, %cause, "no companion script");
                None
            }
        }
    }

    /// The companion script URL for a manifest URL, if derivable.
    pub fn companion_url_for(&self, manifest_url: &str) -> Option<Url> {
        companion_url(manifest_url, &self.companion_filename)
    }

    async fn get_text(&self, url: &str) -> Result<String, String> {
        let resp = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = resp.status();
        if !status.is_success() {
            return Err(format!("server returned {}", status.as_u16()));
        }

        let bytes = resp.bytes().await.map_err(|e| e.to_string())?;
        String::from_utf8(bytes.to_vec()).map_err(|e| format!("body is not valid UTF-8: {e}"))
    }
}

/// Replace the last path segment of `manifest_url` with `filename`.
///
/// A trailing slash means the last segment is empty, so the filename is
/// appended. Query and fragment are dropped.
pub fn companion_url(manifest_url: &str, filename: &str) -> Option<Url> {
    let mut url = Url::parse(manifest_url).ok()?;
    if url.cannot_be_a_base() {
        return None;
    }
    {
        let mut segments = url.path_segments_mut().ok()?;
        segments.pop().push(filename);
    }
    url.set_query(None);
    url.set_fragment(None);
    Some(url)
}
