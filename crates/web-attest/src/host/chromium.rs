//! Chromium host using chromiumoxide.
//!
//! A surface is one page. The first capture is taken once `prepareUrl` has
//! loaded; every later main-frame navigation (the user submitting a login
//! form, being redirected, ...) produces another one.

use super::{
    BrowserHost, CookieRecord, HostCapability, HostError, HostResult, HostSurface, RawCapture,
    SurfaceTarget,
};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::page::EventFrameNavigated;
use chromiumoxide::page::Page;
use futures::stream::{BoxStream, Stream};
use futures::{FutureExt, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const CHROMIUM_PATH_ENV: &str = "WEB_ATTEST_CHROMIUM_PATH";

/// Executables tried on `PATH`, in order.
const SYSTEM_BINARIES: &[&str] = &["google-chrome", "chromium", "chromium-browser"];

const MACOS_APP_BINARY: &str = "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome";

/// Locate a Chromium executable for this machine.
pub fn find_chromium() -> Option<PathBuf> {
    locate_chromium(
        std::env::var_os(CHROMIUM_PATH_ENV).map(PathBuf::from),
        dirs::home_dir(),
    )
}

/// Lookup order: an explicit override, a browser unpacked under
/// `~/.web-attest/chromium`, the system `PATH`, then the macOS app bundle.
/// Only paths that exist on disk are returned.
fn locate_chromium(explicit: Option<PathBuf>, home: Option<PathBuf>) -> Option<PathBuf> {
    let unpacked = home
        .map(|home| unpacked_binaries(&home.join(".web-attest").join("chromium")))
        .unwrap_or_default();

    explicit
        .into_iter()
        .chain(unpacked)
        .find(|path| path.is_file())
        .or_else(|| SYSTEM_BINARIES.iter().find_map(|name| which::which(name).ok()))
        .or_else(|| {
            let app = PathBuf::from(MACOS_APP_BINARY);
            (cfg!(target_os = "macos") && app.is_file()).then_some(app)
        })
}

/// Where a Chrome for Testing download lands once unpacked into `dir`.
fn unpacked_binaries(dir: &Path) -> Vec<PathBuf> {
    let platform: &[&str] = if cfg!(target_os = "macos") {
        &[
            "chrome-mac-arm64/Google Chrome for Testing.app/Contents/MacOS/Google Chrome for Testing",
            "chrome-mac-x64/Google Chrome for Testing.app/Contents/MacOS/Google Chrome for Testing",
        ]
    } else {
        &["chrome-linux64/chrome"]
    };
    platform
        .iter()
        .chain(&["chrome"])
        .map(|rel| dir.join(rel))
        .collect()
}

/// Browser launch options.
#[derive(Debug, Clone)]
pub struct ChromiumConfig {
    /// Explicit executable; falls back to [`find_chromium`].
    pub executable: Option<PathBuf>,
    /// Headed by default: a person has to log in.
    pub headless: bool,
    pub window_size: (u32, u32),
    pub navigation_timeout: Duration,
}

impl Default for ChromiumConfig {
    fn default() -> Self {
        Self {
            executable: None,
            headless: false,
            window_size: (1280, 900),
            navigation_timeout: Duration::from_secs(30),
        }
    }
}

/// A launched Chromium instance.
pub struct ChromiumHost {
    browser: Browser,
    navigation_timeout: Duration,
}

impl ChromiumHost {
    /// Launch Chromium with `config`.
    pub async fn launch(config: ChromiumConfig) -> HostResult<Self> {
        let chrome_path = config.executable.clone().or_else(find_chromium).ok_or_else(|| {
            HostError::Unavailable(format!(
                "Chromium not found; set {CHROMIUM_PATH_ENV} or install Chrome"
            ))
        })?;

        let (width, height) = config.window_size;
        let mut builder = BrowserConfig::builder()
            .chrome_executable(chrome_path)
            .window_size(width, height)
            .arg("--disable-extensions")
            .arg("--disable-background-networking");
        if config.headless {
            builder = builder.arg("--headless=new").arg("--disable-gpu");
        } else {
            builder = builder.with_head();
        }
        let browser_config = builder
            .build()
            .map_err(|e| HostError::Unavailable(format!("failed to build browser config: {e}")))?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| HostError::Unavailable(format!("failed to launch Chromium: {e}")))?;

        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("chromium handler: {e}");
                }
            }
        });

        Ok(Self {
            browser,
            navigation_timeout: config.navigation_timeout,
        })
    }

    /// Close the browser.
    pub async fn shutdown(mut self) -> HostResult<()> {
        self.browser
            .close()
            .await
            .map(|_| ())
            .map_err(|e| HostError::Other(e.to_string()))
    }
}

#[async_trait]
impl BrowserHost for ChromiumHost {
    fn capability(&self) -> HostCapability {
        if cfg!(any(target_os = "android", target_os = "ios")) {
            HostCapability::Unsupported("captures need a desktop browser".into())
        } else {
            HostCapability::Supported
        }
    }

    async fn open_surface(&self, target: &SurfaceTarget) -> HostResult<Box<dyn HostSurface>> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| HostError::Navigation(e.to_string()))?;

        let frames = page
            .event_listener::<EventFrameNavigated>()
            .await
            .map_err(|e| HostError::Other(format!("failed to listen for navigations: {e}")))?
            .boxed();

        debug!(url = %target.url, manifest_id = %target.manifest_id, "opened chromium surface");
        Ok(Box::new(ChromiumSurface {
            page: Some(page),
            target: target.clone(),
            loaded: false,
            frames,
            navigation_timeout: self.navigation_timeout,
        }))
    }
}

/// One page presented to the user.
pub struct ChromiumSurface {
    page: Option<Page>,
    target: SurfaceTarget,
    loaded: bool,
    frames: BoxStream<'static, Arc<EventFrameNavigated>>,
    navigation_timeout: Duration,
}

impl ChromiumSurface {
    fn page(&self) -> HostResult<&Page> {
        self.page.as_ref().ok_or(HostError::SurfaceDestroyed)
    }

    async fn load_target(&mut self) -> HostResult<()> {
        let page = self.page()?.clone();
        match tokio::time::timeout(self.navigation_timeout, page.goto(self.target.url.as_str())).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(HostError::Navigation(e.to_string())),
            Err(_) => Err(HostError::Navigation(format!(
                "timed out loading {} after {}ms",
                self.target.url,
                self.navigation_timeout.as_millis()
            ))),
        }
    }

    /// Wait for the next completed main-frame navigation. `false` when the
    /// page went away.
    async fn wait_main_frame(&mut self) -> HostResult<bool> {
        while let Some(event) = self.frames.next().await {
            if event.frame.parent_id.is_some() {
                continue;
            }
            let page = self.page.as_ref().ok_or(HostError::SurfaceDestroyed)?;
            if let Err(e) = page.wait_for_navigation().await {
                warn!("navigation did not settle: {e}");
            }
            return Ok(true);
        }
        Ok(false)
    }

    async fn snapshot(&mut self) -> HostResult<RawCapture> {
        let page = self.page()?;
        let cookies = page
            .get_cookies()
            .await
            .map_err(|e| HostError::Other(format!("failed to read cookies: {e}")))?
            .into_iter()
            .map(|c| CookieRecord {
                name: c.name,
                value: c.value,
                domain: c.domain,
                path: c.path,
                secure: c.secure,
                http_only: c.http_only,
                expires: (!c.session).then_some(c.expires),
            })
            .collect();
        let dom = page
            .content()
            .await
            .map_err(|e| HostError::Other(format!("failed to read DOM: {e}")))?;
        Ok(RawCapture { cookies, dom })
    }
}

/// Discard every item the stream can yield without waiting.
fn drain_ready<S: Stream + Unpin>(stream: &mut S) -> usize {
    let mut drained = 0;
    while let Some(Some(_)) = stream.next().now_or_never() {
        drained += 1;
    }
    drained
}

#[async_trait]
impl HostSurface for ChromiumSurface {
    async fn next_capture(&mut self) -> HostResult<Option<RawCapture>> {
        if !self.loaded {
            self.load_target().await?;
            self.loaded = true;
            // The initial load already produced navigation events; they
            // must not count as later captures.
            let stale = drain_ready(&mut self.frames);
            debug!(stale, "skipped navigation events from the initial load");
        } else if !self.wait_main_frame().await? {
            return Ok(None);
        }
        self.snapshot().await.map(Some)
    }

    async fn run_script(&mut self, script: &str) -> HostResult<serde_json::Value> {
        let result = self
            .page()?
            .evaluate(script)
            .await
            .map_err(|e| HostError::Script(e.to_string()))?;
        result
            .into_value()
            .map_err(|e| HostError::Script(format!("failed to convert script result: {e:?}")))
    }

    async fn close(mut self: Box<Self>) -> HostResult<()> {
        match self.page.take() {
            Some(page) => page.close().await.map_err(|e| HostError::Other(e.to_string())),
            None => Ok(()),
        }
    }
}

impl Drop for ChromiumSurface {
    fn drop(&mut self) {
        let Some(page) = self.page.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = page.close().await {
                        debug!("failed to close abandoned page: {e}");
                    }
                });
            }
            Err(_) => warn!(url = %self.target.url, "no runtime to close abandoned page"),
        }
    }
}
