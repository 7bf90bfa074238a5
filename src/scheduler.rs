//! The step scheduler: the control loop alternating executor actions with
//! periodic planner guidance, persisting every step and resuming from a
//! recorded history.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::brain::{ACTION_TOOL, ExecutorModel, ExecutorOutput, PlannerModel};
use crate::config::AgentConfig;
use crate::dom::ElementLocator;
use crate::error::{AgentError, ModelError};
use crate::hands::Browser;
use crate::history::{HistoryDump, HistoryStore, StepArtifacts};
use crate::masker;
use crate::session::Session;
use crate::types::{
    Action, ActionRecord, Message, PageState, PageSummary, PlannerDirective, RunStatus, Step, Task,
    ToolCall, clip,
};

/// How the recorded steps of a resumed run played back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplaySummary {
    pub steps: u32,
    pub actions: u32,
    /// Element count of the last recorded page, if one was recorded.
    pub recorded_elements: Option<usize>,
    pub replayed_elements: usize,
    pub within_tolerance: bool,
}

/// Final outcome of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalResult {
    pub status: RunStatus,
    /// The executor's own verdict when it signalled completion.
    pub success: bool,
    pub message: String,
    /// Live steps executed in this process.
    pub steps_taken: u32,
    pub replayed_steps: u32,
    pub last_seq: Option<u64>,
    pub final_output: Option<String>,
    /// History file that can seed a resume of this run.
    pub history_path: Option<PathBuf>,
    pub replay: Option<ReplaySummary>,
    pub total_time_ms: u64,
}

impl TerminalResult {
    fn new(status: RunStatus, message: String) -> Self {
        Self {
            status,
            success: false,
            message,
            steps_taken: 0,
            replayed_steps: 0,
            last_seq: None,
            final_output: None,
            history_path: None,
            replay: None,
            total_time_ms: 0,
        }
    }

    pub fn done(summary: &str, success: bool) -> Self {
        let mut result = Self::new(RunStatus::Done, summary.to_string());
        result.success = success;
        result.final_output = Some(summary.to_string());
        result
    }

    pub fn exhausted(limit: u32) -> Self {
        Self::new(
            RunStatus::Exhausted,
            format!("Reached maximum steps limit: {limit}"),
        )
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(RunStatus::Failed, message.into())
    }

    pub fn cancelled() -> Self {
        Self::new(RunStatus::Cancelled, "Run cancelled".to_string())
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Done && self.success
    }
}

/// Run-wide mutable state, owned by the scheduler for one `run` call.
struct AgentSession {
    next_seq: u64,
    live_steps: u32,
    replayed_steps: u32,
    transcript: Vec<Message>,
    status: RunStatus,
    directive: Option<PlannerDirective>,
    /// Step at which the planner was last consulted in this process.
    last_planned_seq: Option<u64>,
    /// Last observed page, still backed by the session's selector map.
    page: Option<PageState>,
    /// Screenshot taken after the last step, kept only when vision is on.
    frame: Option<Vec<u8>>,
}

impl AgentSession {
    fn new(task: &Task) -> Self {
        Self {
            next_seq: 1,
            live_steps: 0,
            replayed_steps: 0,
            transcript: vec![Message::user(format!("Task: {}", task.goal))],
            status: RunStatus::Running,
            directive: None,
            last_planned_seq: None,
            page: None,
            frame: None,
        }
    }

    fn finish(&mut self, result: TerminalResult) -> TerminalResult {
        self.status = result.status;
        result
    }
}

pub struct StepScheduler<B: Browser> {
    config: AgentConfig,
    session: Session<B>,
    executor: Arc<dyn ExecutorModel>,
    planner: Arc<dyn PlannerModel>,
    history: HistoryStore,
    cancel: CancellationToken,
}

impl<B: Browser> StepScheduler<B> {
    pub fn new(
        config: AgentConfig,
        browser: B,
        executor: Arc<dyn ExecutorModel>,
        planner: Arc<dyn PlannerModel>,
        history: HistoryStore,
    ) -> Self {
        let session = Session::new(browser, &config);
        Self {
            config,
            session,
            executor,
            planner,
            history,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn session(&self) -> &Session<B> {
        &self.session
    }

    /// Drive the task to a terminal state. The browser session is closed on
    /// every exit path.
    pub async fn run(&mut self, task: &Task, resume: Option<HistoryDump>) -> TerminalResult {
        let started = Instant::now();
        let mut run = AgentSession::new(task);
        let mut replay = None;

        let outcome = self.drive(task, resume, &mut run, &mut replay).await;
        let mut result = match outcome {
            Ok(result) => result,
            Err(err) => {
                error!(step = run.next_seq, error = %err, "run failed");
                run.finish(TerminalResult::failed(err.to_string()))
            }
        };
        self.session.close().await;

        result.steps_taken = run.live_steps;
        result.replayed_steps = run.replayed_steps;
        result.last_seq = self.history.last_seq();
        result.history_path = result
            .last_seq
            .map(|_| self.history.layout().latest_file());
        result.replay = replay;
        result.total_time_ms = started.elapsed().as_millis() as u64;
        info!(
            status = ?run.status,
            steps = result.steps_taken,
            replayed = result.replayed_steps,
            last_guidance = ?run.directive.as_ref().map(|d| d.issued_at),
            "run finished"
        );
        result
    }

    async fn drive(
        &mut self,
        task: &Task,
        resume: Option<HistoryDump>,
        run: &mut AgentSession,
        replay: &mut Option<ReplaySummary>,
    ) -> Result<TerminalResult, AgentError> {
        // 1. Bring the live session up to where the recorded run stopped
        if let Some(dump) = resume {
            *replay = Some(self.replay(&dump, run).await?);
            self.history.seed(&dump)?;
        }

        // 2. Live steps until a terminal condition
        loop {
            if self.cancel.is_cancelled() {
                info!(step = run.next_seq, "cancellation requested");
                return Ok(run.finish(TerminalResult::cancelled()));
            }
            if run.live_steps >= self.config.max_steps {
                warn!(step = run.next_seq, limit = self.config.max_steps, "step limit reached");
                return Ok(run.finish(TerminalResult::exhausted(self.config.max_steps)));
            }

            let step = self.step(task, run).await?;
            run.live_steps += 1;
            run.next_seq = step.seq + 1;

            let frame = self.session.frame().await?;
            if self.config.use_vision {
                run.frame = frame.clone();
            }
            self.history.record(
                &step,
                StepArtifacts {
                    frame,
                    transcript: run.transcript.clone(),
                },
            )?;

            if let Some((summary, success)) = step.done_signal() {
                info!(step = step.seq, success, "task reported done");
                return Ok(run.finish(TerminalResult::done(summary, success)));
            }
        }
    }

    /// One live iteration: observe, maybe plan, ask the executor, act.
    async fn step(&mut self, task: &Task, run: &mut AgentSession) -> Result<Step, AgentError> {
        let seq = run.next_seq;
        let mut step = Step::new(seq);

        let page = match run.page.take() {
            Some(page) => page,
            None => self.session.observe().await?,
        };
        debug!(step = seq, url = %page.url, elements = page.element_count, "observed page");

        let frame = match run.frame.take() {
            Some(frame) => Some(frame),
            None if self.config.use_vision => self.session.frame().await?,
            None => None,
        };
        let frame = frame.as_deref();

        if self.planner_due(run, seq) {
            run.last_planned_seq = Some(seq);
            match self.consult_planner(task, run, &page, frame).await {
                Ok(guidance) => {
                    info!(step = seq, "planner issued guidance");
                    let directive = PlannerDirective {
                        issued_at: seq,
                        guidance,
                    };
                    run.transcript.push(guidance_message(&directive));
                    step.directive = Some(directive.clone());
                    run.directive = Some(directive);
                }
                Err(err) => warn!(step = seq, error = %err, "planner unavailable; keeping previous guidance"),
            }
        }

        let output = match self.consult_executor(task, run, &page, frame).await {
            Ok(output) => output,
            Err(err) => {
                error!(step = seq, error = %err, "executor gave no usable reply");
                step.error = Some(err.to_string());
                step.page = Some(PageSummary::from(&page));
                fold_step(&mut run.transcript, &step, self.config.max_result_chars);
                run.page = Some(page);
                return Ok(step);
            }
        };

        if !output.thought.trim().is_empty() {
            step.thought = Some(output.thought.trim().to_string());
        }
        let mut actions = output.actions;
        if actions.is_empty() {
            warn!(step = seq, "executor proposed no actions");
            step.error = Some("no actions were proposed".to_string());
        }
        if actions.len() > self.config.max_actions_per_step {
            warn!(
                step = seq,
                proposed = actions.len(),
                cap = self.config.max_actions_per_step,
                "truncating proposed actions"
            );
            actions.truncate(self.config.max_actions_per_step);
        }

        self.act(&mut step, &actions, &page).await?;

        let after = self.session.observe().await?;
        step.page = Some(PageSummary::from(&after));
        run.page = Some(after);
        fold_step(&mut run.transcript, &step, self.config.max_result_chars);
        Ok(step)
    }

    /// Execute `actions` in order, stopping early when continuing would act on
    /// a page the executor has not seen.
    async fn act(
        &mut self,
        step: &mut Step,
        actions: &[Action],
        page: &PageState,
    ) -> Result<(), AgentError> {
        let seq = step.seq;
        // Locators as they were in the page the executor chose from
        let mut baseline: Vec<Option<ElementLocator>> = Vec::with_capacity(actions.len());
        for action in actions {
            baseline.push(match action.target_index() {
                Some(index) => self.session.locator_at(index).await?,
                None => None,
            });
        }

        let mut url = page.url.clone();
        for (i, action) in actions.iter().enumerate() {
            let remaining = actions.len() - i - 1;

            if i > 0 {
                if let (Some(index), Some(expected)) = (action.target_index(), &baseline[i]) {
                    let current = self.session.locator_at(index).await?;
                    if current.as_ref() != Some(expected) {
                        info!(step = seq, index, "target moved after earlier actions");
                        step.halted = Some(format!(
                            "element [{index}] changed after earlier actions; {} action(s) not executed",
                            remaining + 1
                        ));
                        break;
                    }
                }
            }

            info!(step = seq, action = %action.summary(), "executing action");
            let outcome = self.session.execute(action).await?;
            let success = outcome.observation.success;
            let new_url = outcome.observation.url.clone();
            if !success {
                warn!(
                    step = seq,
                    action = %action.summary(),
                    error = outcome.observation.error.as_deref().unwrap_or_default(),
                    "action failed"
                );
            }
            step.actions.push(ActionRecord {
                action: action.clone(),
                target: outcome.target,
                observation: outcome.observation,
            });

            if action.is_done() || remaining == 0 {
                break;
            }
            if !success {
                step.halted = Some(format!(
                    "previous action failed; {remaining} action(s) not executed"
                ));
                break;
            }
            if let Some(new_url) = new_url {
                if new_url != url && !matches!(action, Action::Navigate { .. }) {
                    info!(step = seq, url = %new_url, "page navigated during action chain");
                    step.halted = Some(format!(
                        "page changed to {new_url}; {remaining} action(s) not executed"
                    ));
                    break;
                }
                url = new_url;
            }
        }
        Ok(())
    }

    /// Re-execute every recorded step without consulting either model.
    async fn replay(
        &mut self,
        dump: &HistoryDump,
        run: &mut AgentSession,
    ) -> Result<ReplaySummary, AgentError> {
        let steps = dump.replay_plan()?;
        info!(steps = steps.len(), "replaying recorded history");

        let mut actions = 0;
        for step in &steps {
            for record in &step.actions {
                if record.action.is_done() {
                    continue;
                }
                debug!(step = step.seq, action = %record.action.summary(), "replaying action");
                let observation = self.session.replay(record).await?;
                actions += 1;
                if !observation.success && record.observation.success {
                    let reason = format!(
                        "{} failed on replay: {}",
                        record.action.summary(),
                        observation.error.unwrap_or_default()
                    );
                    return Err(AgentError::ResumeIntegrity {
                        seq: step.seq,
                        reason,
                    });
                }
            }

            if let Some(directive) = &step.directive {
                run.transcript.push(guidance_message(directive));
                run.directive = Some(directive.clone());
            }
            fold_step(&mut run.transcript, step, self.config.max_result_chars);
            run.replayed_steps += 1;
            run.next_seq = step.seq + 1;
        }

        let page = self.session.observe().await?;
        let recorded_elements = steps
            .iter()
            .rev()
            .find_map(|step| step.page.as_ref())
            .map(|summary| summary.element_count);
        let within_tolerance = match recorded_elements {
            Some(recorded) => recorded.abs_diff(page.element_count) <= self.config.replay_tolerance,
            None => true,
        };
        if !within_tolerance {
            warn!(
                step = run.next_seq,
                recorded = recorded_elements.unwrap_or_default(),
                replayed = page.element_count,
                "replayed page differs from the recorded one"
            );
        }
        let summary = ReplaySummary {
            steps: run.replayed_steps,
            actions,
            recorded_elements,
            replayed_elements: page.element_count,
            within_tolerance,
        };
        run.page = Some(page);
        info!(next = run.next_seq, "replay complete; continuing live");
        Ok(summary)
    }

    fn planner_due(&self, run: &AgentSession, seq: u64) -> bool {
        let interval = u64::from(self.config.planner_interval);
        if interval == 0 {
            return false;
        }
        match run.last_planned_seq {
            None => true,
            Some(last) => seq.saturating_sub(last) >= interval,
        }
    }

    async fn consult_planner(
        &self,
        task: &Task,
        run: &AgentSession,
        page: &PageState,
        frame: Option<&[u8]>,
    ) -> Result<String, ModelError> {
        let mut context = masker::mask_with_limit(&run.transcript, self.config.max_result_chars);
        context.push(Message::user(format!(
            "Current page: {} ({}), {} interactive elements",
            page.url, page.title, page.element_count
        )));
        let planner = &*self.planner;
        let context = &context[..];
        self.call_model(run.next_seq, "planner", move || {
            planner.plan(task, context, frame)
        })
        .await
    }

    async fn consult_executor(
        &self,
        task: &Task,
        run: &AgentSession,
        page: &PageState,
        frame: Option<&[u8]>,
    ) -> Result<ExecutorOutput, ModelError> {
        let executor = &*self.executor;
        let transcript = &run.transcript[..];
        self.call_model(run.next_seq, "executor", move || {
            executor.next_actions(task, transcript, page, frame)
        })
        .await
    }

    /// One model call with the configured timeout, re-requested on failure.
    async fn call_model<T, F, Fut>(&self, seq: u64, role: &str, mut call: F) -> Result<T, ModelError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ModelError>>,
    {
        let limit = self.config.model_timeout();
        let mut attempt = 0;
        loop {
            let result = match tokio::time::timeout(limit, call()).await {
                Ok(result) => result,
                Err(_) => Err(ModelError::Timeout(limit.as_secs())),
            };
            match result {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= self.config.model_retries => return Err(err),
                Err(err) => {
                    attempt += 1;
                    warn!(step = seq, role, attempt, error = %err, "model call failed; retrying");
                    tokio::time::sleep(self.config.retry_delay()).await;
                }
            }
        }
    }
}

fn guidance_message(directive: &PlannerDirective) -> Message {
    Message::user(format!("Planner guidance: {}", directive.guidance))
}

/// Append a step to the executor transcript as a tool call plus its result.
fn fold_step(transcript: &mut Vec<Message>, step: &Step, max_result_chars: usize) {
    if step.actions.is_empty() {
        if let Some(err) = &step.error {
            transcript.push(Message::user(format!(
                "Step {} produced no actions: {err}",
                step.seq
            )));
        }
        return;
    }

    let call_id = format!("step-{}", step.seq);
    let actions: Vec<&Action> = step.actions.iter().map(|record| &record.action).collect();
    transcript.push(Message::Assistant {
        content: step.thought.clone().unwrap_or_default(),
        tool_calls: vec![ToolCall {
            id: call_id.clone(),
            name: ACTION_TOOL.to_string(),
            arguments: json!({ "actions": actions }),
        }],
    });

    let mut lines: Vec<String> = step
        .actions
        .iter()
        .enumerate()
        .map(|(i, record)| {
            format!(
                "{}. {}: {}",
                i + 1,
                record.action.summary(),
                clip(&record.observation.describe(), max_result_chars)
            )
        })
        .collect();
    if let Some(halted) = &step.halted {
        lines.push(format!("Stopped: {halted}"));
    }
    if let Some(page) = &step.page {
        lines.push(format!(
            "Page is now {} with {} interactive elements",
            page.url, page.element_count
        ));
    }
    transcript.push(Message::Tool {
        call_id,
        content: lines.join("\n"),
    });
}
