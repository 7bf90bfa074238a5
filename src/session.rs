//! The session coordinator: sole owner of the browser connection and of the
//! selector map built from its latest snapshot.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::dom::{DomSnapshot, ElementLocator};
use crate::error::BrowserError;
use crate::hands::Browser;
use crate::types::{Action, ActionRecord, Observation, PageState, clip};

/// Longest single `Wait` the executor may request.
const MAX_WAIT: Duration = Duration::from_secs(10);

/// Result of one executed action.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionOutcome {
    pub observation: Observation,
    /// Locator the action was dispatched against.
    pub target: Option<ElementLocator>,
}

impl ActionOutcome {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            observation: Observation::failed(error),
            target: None,
        }
    }
}

/// Errors returned from this type are always fatal for the run; everything
/// recoverable comes back as a failed [`Observation`].
pub struct Session<B: Browser> {
    browser: B,
    /// `None` once an action may have changed the page.
    snapshot: Option<DomSnapshot>,
    retries: u32,
    retry_delay: Duration,
    timeout: Duration,
    max_page_chars: usize,
    max_result_chars: usize,
    closed: bool,
}

impl<B: Browser> Session<B> {
    pub fn new(browser: B, config: &AgentConfig) -> Self {
        Self {
            browser,
            snapshot: None,
            retries: config.action_retries,
            retry_delay: config.retry_delay(),
            timeout: config.action_timeout(),
            max_page_chars: config.max_page_chars,
            max_result_chars: config.max_result_chars,
            closed: false,
        }
    }

    pub fn browser(&self) -> &B {
        &self.browser
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Current snapshot, capturing a fresh one if the last was invalidated.
    pub async fn snapshot(&mut self) -> Result<&DomSnapshot, BrowserError> {
        let snapshot = match self.snapshot.take() {
            Some(snapshot) => snapshot,
            None => self.capture().await?,
        };
        let snapshot: &DomSnapshot = self.snapshot.insert(snapshot);
        Ok(snapshot)
    }

    /// Fresh snapshot rendered for the executor. A page that cannot be
    /// inspected yields a state carrying the error instead.
    pub async fn observe(&mut self) -> Result<PageState, BrowserError> {
        self.snapshot = None;
        let limit = self.max_page_chars;
        let failure = match self.snapshot().await {
            Ok(snapshot) => return Ok(snapshot.page_state(limit)),
            Err(err) => err,
        };
        if failure.is_fatal() {
            return Err(failure);
        }
        warn!(error = %failure, "page could not be inspected");
        let url = match self.browser.current_url().await {
            Ok(url) => url,
            Err(err) if err.is_fatal() => return Err(err),
            Err(_) => String::new(),
        };
        Ok(PageState::unavailable(url, failure.to_string()))
    }

    /// Locator currently at `index`, rebuilding the selector map if stale.
    pub async fn locator_at(&mut self, index: u32) -> Result<Option<ElementLocator>, BrowserError> {
        match self.snapshot().await {
            Ok(snapshot) => Ok(snapshot.resolve(index).ok().map(|h| h.locator.clone())),
            Err(err) if err.is_fatal() => Err(err),
            Err(_) => Ok(None),
        }
    }

    /// Execute an action chosen against the current selector map.
    pub async fn execute(&mut self, action: &Action) -> Result<ActionOutcome, BrowserError> {
        let target = match action.target_index() {
            Some(index) => {
                let lookup = match self.snapshot().await {
                    Ok(snapshot) => snapshot.resolve(index).map(|h| h.locator.clone()),
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(err) => {
                        return Ok(ActionOutcome::failed(format!(
                            "page could not be inspected: {err}"
                        )));
                    }
                };
                match lookup {
                    Ok(locator) => Some(locator),
                    Err(err) => {
                        info!(index, "index not in selector map");
                        return Ok(ActionOutcome::failed(err.to_string()));
                    }
                }
            }
            None => None,
        };
        self.run(action, target).await
    }

    /// Re-execute a recorded action. The element is found again by its
    /// recorded locator, waiting for it to appear if the page is still loading.
    pub async fn replay(&mut self, record: &ActionRecord) -> Result<Observation, BrowserError> {
        let target = match (&record.target, record.action.target_index()) {
            (Some(locator), _) => {
                if !self.await_target(locator).await? {
                    return Ok(Observation::failed(format!(
                        "recorded element {locator} is not on the page"
                    )));
                }
                Some(locator.clone())
            }
            (None, Some(index)) => {
                return Ok(Observation::failed(format!(
                    "no element was recorded for index {index}"
                )));
            }
            (None, None) => None,
        };
        Ok(self.run(&record.action, target).await?.observation)
    }

    /// Screenshot of the current page; `None` when it cannot be taken.
    pub async fn frame(&mut self) -> Result<Option<Vec<u8>>, BrowserError> {
        let result = match tokio::time::timeout(self.timeout, self.browser.screenshot()).await {
            Ok(result) => result,
            Err(_) => Err(BrowserError::Timeout("screenshot".into())),
        };
        match result {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                warn!(error = %err, "screenshot skipped");
                Ok(None)
            }
        }
    }

    /// Release the connection. Safe to call more than once.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.snapshot = None;
        if let Err(err) = self.browser.close().await {
            warn!(error = %err, "closing the browser connection failed");
        }
    }

    async fn run(
        &mut self,
        action: &Action,
        target: Option<ElementLocator>,
    ) -> Result<ActionOutcome, BrowserError> {
        let result = self.dispatch(action, target.as_ref()).await;
        if action.mutates_page() {
            self.snapshot = None;
        }
        let observation = match result {
            Ok(content) => Observation::succeeded(content),
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => Observation::failed(err.to_string()),
        };
        let url = match self.browser.current_url().await {
            Ok(url) => Some(url),
            Err(err) if err.is_fatal() => return Err(err),
            Err(_) => None,
        };
        Ok(ActionOutcome {
            observation: observation.at(url, action.mutates_page()),
            target,
        })
    }

    /// One action with per-call timeout and bounded retry on transient failures.
    /// Only one attempt is ever in flight.
    async fn dispatch(
        &mut self,
        action: &Action,
        target: Option<&ElementLocator>,
    ) -> Result<Option<String>, BrowserError> {
        let mut attempt = 0;
        loop {
            let result = match tokio::time::timeout(self.timeout, self.perform(action, target)).await {
                Ok(result) => result,
                Err(_) => Err(BrowserError::Timeout(action.summary())),
            };
            match result {
                Ok(content) => return Ok(content),
                Err(err) if attempt >= self.retries || !retryable(action, &err) => return Err(err),
                Err(err) => {
                    attempt += 1;
                    warn!(attempt, action = %action.summary(), error = %err, "action failed; retrying");
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
    }

    async fn perform(
        &mut self,
        action: &Action,
        target: Option<&ElementLocator>,
    ) -> Result<Option<String>, BrowserError> {
        let required = || {
            target.ok_or_else(|| BrowserError::ElementNotFound("no element resolved for action".into()))
        };
        match action {
            Action::Navigate { url } => self.browser.navigate(url).await.map(|_| None),
            Action::Click { .. } => self.browser.click(required()?).await.map(|_| None),
            Action::TypeText { text, .. } => {
                self.browser.type_text(required()?, text).await.map(|_| None)
            }
            Action::PressKey { key } => self.browser.press_key(key).await.map(|_| None),
            Action::Extract { .. } => {
                let limit = self.max_result_chars;
                let text = self.browser.extract(target).await?;
                Ok(Some(clip(&text, limit)))
            }
            Action::Wait { ms } => {
                tokio::time::sleep(Duration::from_millis(*ms).min(MAX_WAIT)).await;
                Ok(None)
            }
            Action::Done { .. } => Ok(None),
        }
    }

    async fn capture(&mut self) -> Result<DomSnapshot, BrowserError> {
        let mut attempt = 0;
        loop {
            let result = match tokio::time::timeout(self.timeout, self.browser.snapshot()).await {
                Ok(result) => result,
                Err(_) => Err(BrowserError::Timeout("snapshot".into())),
            };
            match result {
                Ok(snapshot) => {
                    debug!(url = %snapshot.url, elements = snapshot.selector_map.len(), "selector map rebuilt");
                    for frame in snapshot.tree.unreadable_frames() {
                        let src = snapshot.tree.node(frame).and_then(|n| n.attr("src")).unwrap_or("");
                        warn!(
                            url = %snapshot.url,
                            src,
                            "frame could not be read; attached Chrome needs --disable-web-security --disable-site-isolation-trials"
                        );
                    }
                    return Ok(snapshot);
                }
                Err(err) if err.is_fatal() || attempt >= self.retries => return Err(err),
                Err(err) => {
                    attempt += 1;
                    warn!(attempt, error = %err, "snapshot failed; retrying");
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
    }

    async fn await_target(&mut self, locator: &ElementLocator) -> Result<bool, BrowserError> {
        for attempt in 0..=self.retries {
            if attempt > 0 {
                tokio::time::sleep(self.retry_delay).await;
                self.snapshot = None;
            }
            match self.snapshot().await {
                Ok(snapshot) => {
                    if snapshot.tree.locate(locator).is_some() {
                        return Ok(true);
                    }
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(_) => {}
            }
            debug!(attempt, %locator, "recorded element not present yet");
        }
        Ok(false)
    }
}

/// A missing element means nothing was dispatched. After a timeout or a
/// rejection the action may already have landed, so only repeatable actions
/// run again.
fn retryable(action: &Action, err: &BrowserError) -> bool {
    match err {
        BrowserError::ConnectionLost(_) => false,
        BrowserError::ElementNotFound(_) => true,
        BrowserError::Timeout(_) | BrowserError::Rejected(_) => action.is_repeatable(),
    }
}
