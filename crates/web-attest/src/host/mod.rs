//! Browser host abstraction.
//!
//! Defines the `BrowserHost` and `HostSurface` traits that abstract over the
//! browser the user authenticates in (Chromium via chromiumoxide behind the
//! `chromium` feature, or a scripted host for replays and tests).

#[cfg(feature = "chromium")]
pub mod chromium;
pub mod scripted;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Errors raised by a host surface.
#[derive(thiserror::Error, Debug)]
pub enum HostError {
    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("surface was destroyed")]
    SurfaceDestroyed,

    #[error("script execution failed: {0}")]
    Script(String),

    #[error("browser unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Other(String),
}

pub type HostResult<T> = Result<T, HostError>;

/// Whether a host can run captures on this platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCapability {
    Supported,
    Unsupported(String),
}

/// What the surface should show.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurfaceTarget {
    /// Page the user authenticates on.
    pub url: String,
    pub manifest_id: String,
    pub title: String,
}

/// One cookie as read from the surface's cookie jar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CookieRecord {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default = "default_cookie_path")]
    pub path: String,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
    /// Expiry as seconds since the epoch; `None` for session cookies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<f64>,
}

fn default_cookie_path() -> String {
    "/".to_string()
}

impl CookieRecord {
    /// A session cookie with default attributes.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: String::new(),
            path: default_cookie_path(),
            secure: false,
            http_only: false,
            expires: None,
        }
    }
}

/// Cookies and DOM read together at one capture signal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawCapture {
    #[serde(default)]
    pub cookies: Vec<CookieRecord>,
    #[serde(default)]
    pub dom: String,
}

/// A browser that can open capture surfaces.
#[async_trait]
pub trait BrowserHost: Send + Sync {
    /// Probe whether captures can run here at all.
    fn capability(&self) -> HostCapability;
    /// Open a surface on the target page.
    async fn open_surface(&self, target: &SurfaceTarget) -> HostResult<Box<dyn HostSurface>>;
}

/// A live page the user interacts with.
///
/// Dropping a surface must release it, whether or not `close` was called.
#[async_trait]
pub trait HostSurface: Send {
    /// Wait for the next capture signal and read cookies and DOM together.
    /// `Ok(None)` means the user closed the surface.
    async fn next_capture(&mut self) -> HostResult<Option<RawCapture>>;
    /// Evaluate a script in the page and return its JSON result.
    async fn run_script(&mut self, script: &str) -> HostResult<serde_json::Value>;
    /// Tear the surface down.
    async fn close(self: Box<Self>) -> HostResult<()>;
}

/// A host for platforms where captures are not available.
pub struct UnsupportedHost {
    reason: String,
}

impl UnsupportedHost {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl BrowserHost for UnsupportedHost {
    fn capability(&self) -> HostCapability {
        HostCapability::Unsupported(self.reason.clone())
    }

    async fn open_surface(&self, _target: &SurfaceTarget) -> HostResult<Box<dyn HostSurface>> {
        Err(HostError::Unavailable(self.reason.clone()))
    }
}
