use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dom::ElementLocator;

/// The goal of one run plus the operating guidelines supplied with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub goal: String,
    #[serde(default)]
    pub guidelines: String,
    /// Appended to the executor's system prompt.
    #[serde(default)]
    pub extend_system_message: Option<String>,
    /// Appended to the planner's system prompt.
    #[serde(default)]
    pub extend_planner_system_message: Option<String>,
}

impl Task {
    pub fn new(goal: impl Into<String>, guidelines: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            guidelines: guidelines.into(),
            extend_system_message: None,
            extend_planner_system_message: None,
        }
    }
}

/// A single atomic browser operation the executor asks for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum Action {
    Navigate {
        url: String,
    },
    Click {
        index: u32,
    },
    TypeText {
        index: u32,
        text: String,
    },
    PressKey {
        key: String,
    },
    Extract {
        #[serde(default)]
        index: Option<u32>,
    },
    Wait {
        ms: u64,
    },
    Done {
        summary: String,
        #[serde(default = "default_success")]
        success: bool,
    },
}

fn default_success() -> bool {
    true
}

impl Action {
    /// Selector-map index this action points at, if any.
    pub fn target_index(&self) -> Option<u32> {
        match self {
            Action::Click { index } | Action::TypeText { index, .. } => Some(*index),
            Action::Extract { index } => *index,
            _ => None,
        }
    }

    /// Whether the action may change the DOM, which invalidates the selector map.
    pub fn mutates_page(&self) -> bool {
        matches!(
            self,
            Action::Navigate { .. }
                | Action::Click { .. }
                | Action::TypeText { .. }
                | Action::PressKey { .. }
        )
    }

    /// Safe to run a second time after an attempt whose outcome is unknown.
    pub fn is_repeatable(&self) -> bool {
        !matches!(
            self,
            Action::Click { .. } | Action::TypeText { .. } | Action::PressKey { .. }
        )
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Action::Done { .. })
    }

    /// One-line human summary, used in transcripts and logs.
    pub fn summary(&self) -> String {
        match self {
            Action::Navigate { url } => format!("navigate to {url}"),
            Action::Click { index } => format!("click element [{index}]"),
            Action::TypeText { index, text } => {
                format!("type {:?} into element [{index}]", clip(text, 80))
            }
            Action::PressKey { key } => format!("press {key}"),
            Action::Extract { index: Some(index) } => format!("extract text of element [{index}]"),
            Action::Extract { index: None } => "extract page text".to_string(),
            Action::Wait { ms } => format!("wait {ms}ms"),
            Action::Done { summary, success } => {
                format!("finish (success={success}): {}", clip(summary, 200))
            }
        }
    }
}

/// Outcome of executing one action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    /// Page content returned by the action (extraction results).
    #[serde(default)]
    pub content: Option<String>,
    /// Page url after the action ran.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub page_changed: bool,
}

impl Observation {
    pub fn succeeded(content: Option<String>) -> Self {
        Self {
            success: true,
            content,
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn at(mut self, url: Option<String>, page_changed: bool) -> Self {
        self.url = url;
        self.page_changed = page_changed;
        self
    }

    /// Short restatement fed back to the executor.
    pub fn describe(&self) -> String {
        match (&self.error, &self.content) {
            (Some(err), _) => format!("failed: {err}"),
            (None, Some(content)) => format!("ok, extracted: {content}"),
            (None, None) => "ok".to_string(),
        }
    }
}

/// What the executor is shown of the current page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageState {
    pub url: String,
    pub title: String,
    /// One line per indexed element: `[index]<tag ...>text</tag>`.
    pub elements: String,
    pub element_count: usize,
    /// Set when the page could not be inspected.
    #[serde(default)]
    pub error: Option<String>,
}

impl PageState {
    pub fn unavailable(url: String, reason: String) -> Self {
        Self {
            url,
            error: Some(reason),
            ..Default::default()
        }
    }

    pub fn describe(&self) -> String {
        let mut text = format!(
            "Page URL: {}\nTitle: {}\nInteractive elements ({}):\n{}",
            self.url, self.title, self.element_count, self.elements
        );
        if let Some(ref err) = self.error {
            text.push_str(&format!("\n\nThe page could not be inspected: {err}"));
        }
        text
    }
}

/// The part of a page state kept in history for replay comparison.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSummary {
    pub url: String,
    pub element_count: usize,
}

impl From<&PageState> for PageSummary {
    fn from(page: &PageState) -> Self {
        Self {
            url: page.url.clone(),
            element_count: page.element_count,
        }
    }
}

/// An executed action together with the element it was dispatched against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub action: Action,
    /// Locator resolved from the selector map at execution time. Replay uses
    /// this instead of the index, which is meaningless in a fresh session.
    #[serde(default)]
    pub target: Option<ElementLocator>,
    pub observation: Observation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannerDirective {
    /// Sequence number of the step that requested it.
    pub issued_at: u64,
    pub guidance: String,
}

/// One iteration of the control loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub seq: u64,
    #[serde(default)]
    pub thought: Option<String>,
    #[serde(default)]
    pub actions: Vec<ActionRecord>,
    #[serde(default)]
    pub directive: Option<PlannerDirective>,
    /// Page after the step's actions ran.
    #[serde(default)]
    pub page: Option<PageSummary>,
    /// Executor failure that left the step without actions.
    #[serde(default)]
    pub error: Option<String>,
    /// Why the remaining proposed actions were not executed.
    #[serde(default)]
    pub halted: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Step {
    pub fn new(seq: u64) -> Self {
        Self {
            seq,
            thought: None,
            actions: Vec::new(),
            directive: None,
            page: None,
            error: None,
            halted: None,
            timestamp: Utc::now(),
        }
    }

    /// The completion signal carried by this step, as `(summary, success)`.
    pub fn done_signal(&self) -> Option<(&str, bool)> {
        self.actions.iter().find_map(|record| match &record.action {
            Action::Done { summary, success } => Some((summary.as_str(), *success)),
            _ => None,
        })
    }
}

/// A proposed tool invocation attached to an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// A message in the conversation the executor works from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    Tool {
        call_id: String,
        content: String,
    },
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Message::User {
            content: content.into(),
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Message::System { content }
            | Message::User { content }
            | Message::Assistant { content, .. }
            | Message::Tool { content, .. } => content,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Done,
    Exhausted,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

/// Truncate to `max` characters, noting how much was dropped.
pub fn clip(text: &str, max: usize) -> String {
    let total = text.chars().count();
    if total <= max {
        return text.to_string();
    }
    let kept: String = text.chars().take(max).collect();
    format!("{kept}... [truncated, {total} total chars]")
}
