#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use browser_pilot::brain::{ExecutorModel, ExecutorOutput, PlannerModel};
use browser_pilot::dom::{DomSnapshot, DomTree, ElementLocator, RawNode};
use browser_pilot::error::{BrowserError, ModelError};
use browser_pilot::hands::Browser;
use browser_pilot::history::{HistoryStore, RunLayout};
use browser_pilot::types::{Action, Message, PageState, Task};
use browser_pilot::{AgentConfig, StepScheduler};

pub const HOME: &str = "https://app.test/home";
pub const FORM: &str = "https://app.test/form";
pub const FRAMED: &str = "https://app.test/incident";

/// Home: link to the form [0], refresh button [1], search box [2].
fn home_page() -> RawNode {
    RawNode::element("html").child(
        RawNode::element("body")
            .child(RawNode::element("a").attr("href", FORM).text("Open form"))
            .child(RawNode::element("button").text("Refresh"))
            .child(RawNode::element("input").attr("name", "q")),
    )
}

/// Form: title [0], body [1], save [2], link back home [3].
fn form_page() -> RawNode {
    RawNode::element("html").child(
        RawNode::element("body")
            .child(RawNode::element("input").attr("name", "title"))
            .child(RawNode::element("textarea").attr("name", "body"))
            .child(RawNode::element("div").attr("onclick", "save()").text("Save"))
            .child(RawNode::element("a").attr("href", HOME).text("Back")),
    )
}

/// Incident form hosted inside `iframe#gsft_main`: short description [0],
/// submit [1].
fn framed_page() -> RawNode {
    let inner = RawNode::element("html").child(
        RawNode::element("body")
            .child(RawNode::element("input").attr("name", "short_description"))
            .child(RawNode::element("button").text("Submit")),
    );
    RawNode::element("html").child(
        RawNode::element("body")
            .child(RawNode::element("h1").text("New incident"))
            .child(RawNode::element("iframe").attr("id", "gsft_main").child(inner)),
    )
}

pub type CallLog = Arc<Mutex<Vec<String>>>;

/// Failure injected into the next browser action.
pub enum Fault {
    /// The call fails without touching the page.
    Before(BrowserError),
    /// The call takes effect, then reports the error.
    After(BrowserError),
}

/// In-memory browser over a few linked pages. Links navigate on click.
pub struct FakeBrowser {
    pages: HashMap<String, (String, RawNode)>,
    url: String,
    pub log: CallLog,
    pub closed: Arc<AtomicBool>,
    /// Text typed so far, keyed by rendered locator.
    pub fields: Arc<Mutex<HashMap<String, String>>>,
    actions: usize,
    lose_connection_after: Option<usize>,
    faults: VecDeque<Fault>,
}

impl FakeBrowser {
    pub fn new() -> Self {
        let mut pages = HashMap::new();
        pages.insert(HOME.to_string(), ("Home".to_string(), home_page()));
        pages.insert(FORM.to_string(), ("New record".to_string(), form_page()));
        pages.insert(FRAMED.to_string(), ("Incident".to_string(), framed_page()));
        Self {
            pages,
            url: HOME.to_string(),
            log: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(AtomicBool::new(false)),
            fields: Arc::new(Mutex::new(HashMap::new())),
            actions: 0,
            lose_connection_after: None,
            faults: VecDeque::new(),
        }
    }

    /// Start on `url` instead of the home page.
    pub fn at(mut self, url: &str) -> Self {
        self.url = url.to_string();
        self
    }

    /// The next actions fail with `faults`, one each, in order.
    pub fn with_faults(mut self, faults: Vec<Fault>) -> Self {
        self.faults = faults.into();
        self
    }

    /// Every call fails with a lost connection once `actions` actions ran.
    pub fn losing_connection_after(mut self, actions: usize) -> Self {
        self.lose_connection_after = Some(actions);
        self
    }

    fn check(&self) -> Result<(), BrowserError> {
        match self.lose_connection_after {
            Some(limit) if self.actions >= limit => {
                Err(BrowserError::ConnectionLost("websocket closed".into()))
            }
            _ => Ok(()),
        }
    }

    /// Log an action. Returns the error to report once it has taken effect.
    fn act(&mut self, entry: String) -> Result<Option<BrowserError>, BrowserError> {
        self.check()?;
        self.actions += 1;
        self.log.lock().unwrap().push(entry);
        match self.faults.pop_front() {
            Some(Fault::Before(err)) => Err(err),
            Some(Fault::After(err)) => Ok(Some(err)),
            None => Ok(None),
        }
    }

    fn tree(&self) -> DomTree {
        DomTree::from_raw(self.pages[&self.url].1.clone())
    }

    fn find(&self, target: &ElementLocator) -> Result<Option<String>, BrowserError> {
        let tree = self.tree();
        let id = tree
            .locate(target)
            .ok_or_else(|| BrowserError::ElementNotFound(target.to_string()))?;
        Ok(tree
            .node(id)
            .and_then(|node| node.attr("href"))
            .map(str::to_string))
    }
}

#[async_trait]
impl Browser for FakeBrowser {
    async fn navigate(&mut self, url: &str) -> Result<(), BrowserError> {
        let late = self.act(format!("navigate {url}"))?;
        if !self.pages.contains_key(url) {
            return Err(BrowserError::Rejected(format!("net::ERR_NAME_NOT_RESOLVED {url}")));
        }
        self.url = url.to_string();
        late.map_or(Ok(()), Err)
    }

    async fn click(&mut self, target: &ElementLocator) -> Result<(), BrowserError> {
        let late = self.act(format!("click {target}"))?;
        if let Some(href) = self.find(target)? {
            self.url = href;
        }
        late.map_or(Ok(()), Err)
    }

    async fn type_text(&mut self, target: &ElementLocator, text: &str) -> Result<(), BrowserError> {
        let late = self.act(format!("type {target} {text}"))?;
        self.find(target)?;
        self.fields
            .lock()
            .unwrap()
            .entry(target.to_string())
            .or_default()
            .push_str(text);
        late.map_or(Ok(()), Err)
    }

    async fn press_key(&mut self, key: &str) -> Result<(), BrowserError> {
        let late = self.act(format!("press {key}"))?;
        late.map_or(Ok(()), Err)
    }

    async fn extract(&mut self, target: Option<&ElementLocator>) -> Result<String, BrowserError> {
        let late = self.act("extract".to_string())?;
        let text = match target {
            Some(target) => self.find(target).map(|_| format!("text of {target}"))?,
            None => format!("contents of {}", self.url),
        };
        late.map_or(Ok(text), Err)
    }

    async fn snapshot(&mut self) -> Result<DomSnapshot, BrowserError> {
        self.check()?;
        let title = self.pages[&self.url].0.clone();
        Ok(DomSnapshot::new(self.url.clone(), title, self.tree()))
    }

    async fn screenshot(&mut self) -> Result<Vec<u8>, BrowserError> {
        self.check()?;
        Ok(vec![0x89, b'P', b'N', b'G'])
    }

    async fn current_url(&mut self) -> Result<String, BrowserError> {
        self.check()?;
        Ok(self.url.clone())
    }

    async fn close(&mut self) -> Result<(), BrowserError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Executor replaying a fixed script, then repeating `fallback`.
pub struct ScriptedExecutor {
    replies: Mutex<VecDeque<Vec<Action>>>,
    fallback: Vec<Action>,
    pub calls: Arc<AtomicUsize>,
    pub transcripts: Arc<Mutex<Vec<Vec<Message>>>>,
    /// Whether each call came with a screenshot.
    pub framed: Arc<Mutex<Vec<bool>>>,
}

impl ScriptedExecutor {
    pub fn new(replies: Vec<Vec<Action>>, fallback: Vec<Action>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            fallback,
            calls: Arc::new(AtomicUsize::new(0)),
            transcripts: Arc::new(Mutex::new(Vec::new())),
            framed: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl ExecutorModel for ScriptedExecutor {
    async fn next_actions(
        &self,
        _task: &Task,
        transcript: &[Message],
        _page: &PageState,
        frame: Option<&[u8]>,
    ) -> Result<ExecutorOutput, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.framed.lock().unwrap().push(frame.is_some());
        self.transcripts.lock().unwrap().push(transcript.to_vec());
        let actions = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        Ok(ExecutorOutput {
            thought: format!("turn {}", self.calls.load(Ordering::SeqCst)),
            actions,
        })
    }
}

pub struct ScriptedPlanner {
    pub calls: Arc<AtomicUsize>,
    pub seen: Arc<Mutex<Vec<Vec<Message>>>>,
    /// Call numbers (1-based) that fail with an API error.
    failing: Vec<usize>,
}

impl ScriptedPlanner {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            seen: Arc::new(Mutex::new(Vec::new())),
            failing: Vec::new(),
        }
    }

    pub fn failing_on(calls: Vec<usize>) -> Self {
        Self {
            failing: calls,
            ..Self::new()
        }
    }
}

#[async_trait]
impl PlannerModel for ScriptedPlanner {
    async fn plan(
        &self,
        _task: &Task,
        transcript: &[Message],
        _frame: Option<&[u8]>,
    ) -> Result<String, ModelError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.seen.lock().unwrap().push(transcript.to_vec());
        if self.failing.contains(&n) {
            return Err(ModelError::Api {
                status: 503,
                message: "overloaded".into(),
            });
        }
        Ok(format!("Guidance #{n}"))
    }
}

pub fn config() -> AgentConfig {
    AgentConfig {
        retry_delay_ms: 0,
        action_retries: 1,
        model_retries: 0,
        ..AgentConfig::default()
    }
}

pub fn task() -> Task {
    Task::new("file a weekly report", "Never delete records.")
}

pub fn done(summary: &str) -> Action {
    Action::Done {
        summary: summary.to_string(),
        success: true,
    }
}

pub fn click(index: u32) -> Action {
    Action::Click { index }
}

/// Handles to the fakes a scheduler was built from.
pub struct Harness {
    pub scheduler: StepScheduler<FakeBrowser>,
    pub log: CallLog,
    pub closed: Arc<AtomicBool>,
    pub executor_calls: Arc<AtomicUsize>,
    pub executor_transcripts: Arc<Mutex<Vec<Vec<Message>>>>,
    pub planner_calls: Arc<AtomicUsize>,
    pub planner_seen: Arc<Mutex<Vec<Vec<Message>>>>,
    pub executor_framed: Arc<Mutex<Vec<bool>>>,
    pub fields: Arc<Mutex<HashMap<String, String>>>,
}

pub fn harness(
    root: &Path,
    config: AgentConfig,
    browser: FakeBrowser,
    executor: ScriptedExecutor,
) -> Harness {
    harness_with_planner(root, config, browser, executor, ScriptedPlanner::new())
}

pub fn harness_with_planner(
    root: &Path,
    config: AgentConfig,
    browser: FakeBrowser,
    executor: ScriptedExecutor,
    planner: ScriptedPlanner,
) -> Harness {
    let history = HistoryStore::create(RunLayout::new(root), &task()).unwrap();
    let log = browser.log.clone();
    let closed = browser.closed.clone();
    let fields = browser.fields.clone();
    let executor_framed = executor.framed.clone();
    let executor_calls = executor.calls.clone();
    let executor_transcripts = executor.transcripts.clone();
    let planner_calls = planner.calls.clone();
    let planner_seen = planner.seen.clone();
    let scheduler = StepScheduler::new(
        config,
        browser,
        Arc::new(executor),
        Arc::new(planner),
        history,
    );
    Harness {
        scheduler,
        log,
        closed,
        executor_calls,
        executor_transcripts,
        planner_calls,
        planner_seen,
        executor_framed,
        fields,
    }
}
