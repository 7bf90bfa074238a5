//! The browser connection: the [`Browser`] boundary and its Chrome
//! implementation over `headless_chrome`.

use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::{Browser as Chrome, LaunchOptions, Tab};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::dom::{CaptureReply, DomSnapshot, ElementLocator, snapshot_script};
use crate::error::BrowserError;

/// Primitive operations over one live page.
///
/// Element operations take a frame-scoped [`ElementLocator`]; implementations
/// must enter every listed frame before matching the selector.
#[async_trait]
pub trait Browser: Send {
    async fn navigate(&mut self, url: &str) -> Result<(), BrowserError>;
    async fn click(&mut self, target: &ElementLocator) -> Result<(), BrowserError>;
    async fn type_text(&mut self, target: &ElementLocator, text: &str) -> Result<(), BrowserError>;
    async fn press_key(&mut self, key: &str) -> Result<(), BrowserError>;
    /// Text of the target element, or of the whole page when `None`.
    async fn extract(&mut self, target: Option<&ElementLocator>) -> Result<String, BrowserError>;
    async fn snapshot(&mut self) -> Result<DomSnapshot, BrowserError>;
    /// PNG bytes of the visible viewport.
    async fn screenshot(&mut self) -> Result<Vec<u8>, BrowserError>;
    async fn current_url(&mut self) -> Result<String, BrowserError>;
    async fn close(&mut self) -> Result<(), BrowserError>;
}

const EXTRACT_LIMIT: usize = 20_000;

/// Chrome reached over the DevTools protocol.
pub struct ChromeBrowser {
    chrome: Option<Chrome>,
    tab: Arc<Tab>,
    /// Held for the whole of each blocking tab call.
    busy: Arc<Mutex<()>>,
    timeout: Duration,
}

impl ChromeBrowser {
    /// Attach to the Chrome listening on `config.cdp_url`, or launch one with
    /// a dedicated profile when nothing is listening.
    ///
    /// Launched browsers get the flags that expose cross-origin frame
    /// documents. An attached browser must have been started with
    /// `--disable-web-security --disable-site-isolation-trials` for the same.
    pub async fn connect(config: &AgentConfig) -> Result<Self> {
        // 1. Attach mode
        info!(cdp_url = %config.cdp_url, "attempting to attach to existing Chrome");
        match debugger_url(&config.cdp_url).await {
            Ok(ws_url) => {
                let (chrome, tab) = tokio::task::spawn_blocking(move || -> Result<(Chrome, Arc<Tab>)> {
                    let chrome = Chrome::connect(ws_url)?;
                    let tab = first_tab(&chrome)?;
                    Ok((chrome, tab))
                })
                .await
                .context("attach task panicked")??;
                info!("attached to existing Chrome");
                return Ok(Self::new(chrome, tab, config.action_timeout()));
            }
            Err(err) => warn!(error = %format!("{err:#}"), "could not attach; launching Chrome"),
        }

        // 2. Launch mode
        let profile = match config.profile_dir.clone() {
            Some(dir) => dir,
            None => default_profile_dir()?,
        };
        std::fs::create_dir_all(&profile)
            .with_context(|| format!("creating profile dir {}", profile.display()))?;
        let headless = config.headless;
        let (chrome, tab) = tokio::task::spawn_blocking(move || launch(profile, headless))
            .await
            .context("launch task panicked")??;
        info!("Chrome launched");
        Ok(Self::new(chrome, tab, config.action_timeout()))
    }

    fn new(chrome: Chrome, tab: Arc<Tab>, timeout: Duration) -> Self {
        Self {
            chrome: Some(chrome),
            tab,
            busy: Arc::new(Mutex::new(())),
            timeout,
        }
    }

    /// Run a blocking tab call on the blocking pool, bounded by the action timeout.
    /// Calls are serialized: a new call waits for a timed-out one to finish.
    async fn on_tab<T, F>(&self, what: &'static str, call: F) -> Result<T, BrowserError>
    where
        T: Send + 'static,
        F: FnOnce(&Tab) -> Result<T> + Send + 'static,
    {
        if self.chrome.is_none() {
            return Err(BrowserError::ConnectionLost("browser already closed".into()));
        }
        let tab = Arc::clone(&self.tab);
        let busy = Arc::clone(&self.busy);
        let task = async move {
            // The guard moves into the blocking call, so a call that outlives
            // its timeout keeps the tab until it returns.
            let guard = busy.lock_owned().await;
            tokio::task::spawn_blocking(move || {
                let _guard = guard;
                call(&tab)
            })
            .await
        };
        match tokio::time::timeout(self.timeout, task).await {
            Err(_) => Err(BrowserError::Timeout(format!(
                "{what} exceeded {}s",
                self.timeout.as_secs()
            ))),
            Ok(Err(join)) => Err(BrowserError::ConnectionLost(format!("{what} task failed: {join}"))),
            Ok(Ok(result)) => result.map_err(|err| classify(what, &err)),
        }
    }

    /// Evaluate a locator script and decode its `{ok, reason, text}` reply.
    async fn run_locator_script(
        &self,
        what: &'static str,
        target: &ElementLocator,
        body: &str,
    ) -> Result<ScriptReply, BrowserError> {
        let script = locator_script(target, body);
        let value = self
            .on_tab(what, move |tab| Ok(tab.evaluate(&script, false)?.value))
            .await?;
        let raw = value
            .as_ref()
            .and_then(|v| v.as_str())
            .ok_or_else(|| BrowserError::Rejected(format!("{what}: script returned no value")))?;
        let reply: ScriptReply = serde_json::from_str(raw)
            .map_err(|err| BrowserError::Rejected(format!("{what}: bad script reply: {err}")))?;
        if !reply.ok {
            let reason = reply.reason.unwrap_or_else(|| "unknown".to_string());
            return Err(BrowserError::ElementNotFound(format!("{target}: {reason}")));
        }
        Ok(reply)
    }
}

#[async_trait]
impl Browser for ChromeBrowser {
    async fn navigate(&mut self, url: &str) -> Result<(), BrowserError> {
        let url = url.to_string();
        self.on_tab("navigate", move |tab| {
            tab.navigate_to(&url)?.wait_until_navigated()?;
            Ok(())
        })
        .await
    }

    async fn click(&mut self, target: &ElementLocator) -> Result<(), BrowserError> {
        self.run_locator_script(
            "click",
            target,
            "el.scrollIntoView({block: 'center'}); el.click(); return JSON.stringify({ok: true});",
        )
        .await
        .map(|_| ())
    }

    async fn type_text(&mut self, target: &ElementLocator, text: &str) -> Result<(), BrowserError> {
        self.run_locator_script(
            "focus",
            target,
            "el.scrollIntoView({block: 'center'}); el.focus(); return JSON.stringify({ok: true});",
        )
        .await?;
        let text = text.to_string();
        self.on_tab("type", move |tab| {
            tab.type_str(&text)?;
            Ok(())
        })
        .await
    }

    async fn press_key(&mut self, key: &str) -> Result<(), BrowserError> {
        let key = key.to_string();
        self.on_tab("press key", move |tab| {
            tab.press_key(&key)?;
            Ok(())
        })
        .await
    }

    async fn extract(&mut self, target: Option<&ElementLocator>) -> Result<String, BrowserError> {
        let body = format!(
            "return JSON.stringify({{ok: true, text: (el.innerText || el.value || '').slice(0, {EXTRACT_LIMIT})}});"
        );
        let page = ElementLocator::top_level("body");
        let reply = self
            .run_locator_script("extract", target.unwrap_or(&page), &body)
            .await?;
        Ok(reply.text.unwrap_or_default())
    }

    async fn snapshot(&mut self) -> Result<DomSnapshot, BrowserError> {
        let value = self
            .on_tab("snapshot", |tab| Ok(tab.evaluate(snapshot_script(), false)?.value))
            .await?;
        let raw = value
            .as_ref()
            .and_then(|v| v.as_str())
            .ok_or_else(|| BrowserError::Rejected("snapshot script returned no value".into()))?;
        let reply: CaptureReply = serde_json::from_str(raw)
            .map_err(|err| BrowserError::Rejected(format!("unreadable snapshot: {err}")))?;
        Ok(reply.into_snapshot())
    }

    async fn screenshot(&mut self) -> Result<Vec<u8>, BrowserError> {
        self.on_tab("screenshot", |tab| {
            tab.capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true)
        })
        .await
    }

    async fn current_url(&mut self) -> Result<String, BrowserError> {
        self.on_tab("current url", |tab| Ok(tab.get_url())).await
    }

    async fn close(&mut self) -> Result<(), BrowserError> {
        // Dropping the handle disconnects; a Chrome we launched is shut down too.
        if let Some(chrome) = self.chrome.take() {
            tokio::task::spawn_blocking(move || drop(chrome))
                .await
                .map_err(|err| BrowserError::ConnectionLost(format!("close task failed: {err}")))?;
            info!("browser connection released");
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ScriptReply {
    ok: bool,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

/// Wrap `body` so it runs with `el` bound to the located element. Each frame
/// is entered through its `contentDocument` before the selector is matched.
fn locator_script(target: &ElementLocator, body: &str) -> String {
    let frames = serde_json::to_string(&target.frames).unwrap_or_else(|_| "[]".to_string());
    let selector = serde_json::to_string(&target.selector).unwrap_or_else(|_| "\"\"".to_string());
    format!(
        r#"(() => {{
  let doc = document;
  for (const f of {frames}) {{
    const frame = f.id !== undefined ? doc.getElementById(f.id) : doc.querySelector(f.path);
    if (!frame) return JSON.stringify({{ok: false, reason: 'frame not found'}});
    let inner = null;
    try {{ inner = frame.contentDocument; }} catch (e) {{}}
    if (!inner) return JSON.stringify({{ok: false, reason: 'frame document not accessible'}});
    doc = inner;
  }}
  const el = doc.querySelector({selector});
  if (!el) return JSON.stringify({{ok: false, reason: 'element not found'}});
  {body}
}})()"#
    )
}

/// Map a `headless_chrome` failure onto the agent's error taxonomy.
fn classify(what: &str, err: &anyhow::Error) -> BrowserError {
    let text = format!("{err:#}");
    let lower = text.to_lowercase();
    if lower.contains("connection is closed")
        || lower.contains("connection closed")
        || lower.contains("websocket")
    {
        BrowserError::ConnectionLost(format!("{what}: {text}"))
    } else if lower.contains("timed out") || lower.contains("timeout") || lower.contains("never came") {
        BrowserError::Timeout(format!("{what}: {text}"))
    } else if lower.contains("no element") || lower.contains("could not find node") {
        BrowserError::ElementNotFound(format!("{what}: {text}"))
    } else {
        BrowserError::Rejected(format!("{what}: {text}"))
    }
}

#[derive(Debug, Deserialize)]
struct VersionInfo {
    #[serde(rename = "webSocketDebuggerUrl")]
    web_socket_debugger_url: String,
}

/// Ask the remote debugging endpoint for its browser websocket url.
async fn debugger_url(cdp_url: &str) -> Result<String> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(3))
        .build()?;
    let endpoint = format!("{}/json/version", cdp_url.trim_end_matches('/'));
    let info: VersionInfo = client
        .get(&endpoint)
        .send()
        .await
        .with_context(|| format!("requesting {endpoint}"))?
        .error_for_status()?
        .json()
        .await?;
    debug!(ws = %info.web_socket_debugger_url, "found debugger url");
    Ok(info.web_socket_debugger_url)
}

fn first_tab(chrome: &Chrome) -> Result<Arc<Tab>> {
    let existing = {
        let tabs = chrome
            .get_tabs()
            .lock()
            .map_err(|_| anyhow!("tab list lock poisoned"))?;
        tabs.first().cloned()
    };
    match existing {
        Some(tab) => {
            debug!("using existing tab");
            Ok(tab)
        }
        None => {
            debug!("no tabs found, creating a new one");
            chrome.new_tab()
        }
    }
}

fn launch(profile: PathBuf, headless: bool) -> Result<(Chrome, Arc<Tab>)> {
    let options = LaunchOptions {
        headless,
        user_data_dir: Some(profile),
        args: vec![
            OsStr::new("--no-first-run"),
            OsStr::new("--no-default-browser-check"),
            // Frame documents must be readable across origins.
            OsStr::new("--disable-web-security"),
            OsStr::new("--disable-site-isolation-trials"),
            OsStr::new("--disable-features=IsolateOrigins,site-per-process"),
            OsStr::new("--password-store=basic"),
        ],
        idle_browser_timeout: Duration::from_secs(600),
        ..Default::default()
    };
    let chrome = Chrome::new(options).map_err(|err| anyhow!("browser launch failed: {err}"))?;
    let tab = chrome.new_tab()?;
    tab.navigate_to("about:blank")?;
    Ok((chrome, tab))
}

fn default_profile_dir() -> Result<PathBuf> {
    let base = dirs::data_local_dir().ok_or_else(|| anyhow!("no local data directory"))?;
    Ok(base.join("browser-pilot").join("profile"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::FrameSelector;

    #[test]
    fn locator_script_enters_frames_in_order() {
        let target = ElementLocator {
            frames: vec![
                FrameSelector::Id("gsft_main".into()),
                FrameSelector::Path("html > body > iframe".into()),
            ],
            selector: "html > body > textarea".into(),
        };
        let script = locator_script(&target, "return 1;");
        assert!(script.contains(r#"[{"id":"gsft_main"},{"path":"html > body > iframe"}]"#));
        assert!(script.contains(r#"doc.querySelector("html > body > textarea")"#));
        assert!(script.trim_end().ends_with("})()"));
    }

    #[test]
    fn connection_errors_are_fatal() {
        let err = anyhow!("Unable to make method calls because underlying connection is closed");
        assert!(classify("click", &err).is_fatal());
        let err = anyhow!("The event waited for never came");
        assert!(matches!(classify("navigate", &err), BrowserError::Timeout(_)));
        assert!(matches!(
            classify("click", &anyhow!("Node is detached")),
            BrowserError::Rejected(_)
        ));
    }
}
