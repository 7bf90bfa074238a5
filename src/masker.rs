//! Compaction of the executor transcript before the planner reads it.
//!
//! Tool-call payloads and raw tool results are replaced by one-line
//! restatements. Masked messages carry no tool calls and no tool role, so a
//! second pass leaves them untouched.

use crate::types::{Action, Message, ToolCall, clip};

pub const PROPOSED_PREFIX: &str = "An action was proposed: ";
pub const RESULT_PREFIX: &str = "The action's result was: ";

/// Default bound on a restated tool result or on the reasoning kept beside
/// a proposed action.
pub const MAX_RESULT_CHARS: usize = 2_000;

pub fn mask(transcript: &[Message]) -> Vec<Message> {
    mask_with_limit(transcript, MAX_RESULT_CHARS)
}

pub fn mask_with_limit(transcript: &[Message], max_result_chars: usize) -> Vec<Message> {
    transcript
        .iter()
        .map(|message| mask_message(message, max_result_chars))
        .collect()
}

fn mask_message(message: &Message, max_result_chars: usize) -> Message {
    match message {
        Message::Assistant {
            content,
            tool_calls,
        } if !tool_calls.is_empty() => {
            let summary = tool_calls
                .iter()
                .map(summarize_call)
                .collect::<Vec<_>>()
                .join("; ");
            let reasoning = clip(content.trim(), max_result_chars);
            let content = if reasoning.is_empty() {
                format!("{PROPOSED_PREFIX}{summary}")
            } else {
                format!("{reasoning}\n{PROPOSED_PREFIX}{summary}")
            };
            Message::Assistant {
                content,
                tool_calls: Vec::new(),
            }
        }
        Message::Tool { content, .. } => Message::User {
            content: format!("{RESULT_PREFIX}{}", clip(content.trim(), max_result_chars)),
        },
        other => other.clone(),
    }
}

fn summarize_call(call: &ToolCall) -> String {
    let actions = call
        .arguments
        .get("actions")
        .cloned()
        .and_then(|value| serde_json::from_value::<Vec<Action>>(value).ok());
    match actions {
        Some(actions) if !actions.is_empty() => actions
            .iter()
            .map(Action::summary)
            .collect::<Vec<_>>()
            .join(", then "),
        _ => format!("{}({})", call.name, clip(&call.arguments.to_string(), 300)),
    }
}
