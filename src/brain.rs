//! Executor and planner model boundaries, and their implementation over an
//! OpenAI-compatible chat-completions API.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::config::AgentConfig;
use crate::error::ModelError;
use crate::types::{Action, Message, PageState, Task};

/// Name of the single tool the executor calls.
pub const ACTION_TOOL: &str = "browser_actions";

const EXECUTOR_PROMPT: &str = r#"You are a browser automation agent. You control a real Chrome browser by calling the browser_actions tool.

Available actions (each an object in the "actions" array):
- {"action":"Navigate","url":"https://..."}
- {"action":"Click","index":3}
- {"action":"TypeText","index":3,"text":"search query"}
- {"action":"PressKey","key":"Enter"}
- {"action":"Extract","index":3}   (omit index to read the whole page)
- {"action":"Wait","ms":2000}
- {"action":"Done","summary":"what was achieved","success":true}

Rules:
1. Target elements by the [N] index shown in the current page listing. Indices change after every page change.
2. You may chain several actions in one call; the chain stops at the first failure or page change.
3. Follow the planner guidance in the conversation when present.
4. When the task is accomplished, call Done with a summary. If it cannot be accomplished, call Done with success=false."#;

const PLANNER_PROMPT: &str = r#"You are the planning partner of a browser automation agent. You see a compacted log of what the agent proposed and what happened.
Reply with a short assessment of progress, the overall plan, and the immediate next few steps the agent should take. Be concrete about pages, buttons and text to use."#;

/// What the executor asks for in one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorOutput {
    #[serde(default)]
    pub thought: String,
    #[serde(default)]
    pub actions: Vec<Action>,
}

/// The model proposing concrete browser actions.
///
/// `frame` is a PNG screenshot of the page, present when vision is enabled.
#[async_trait]
pub trait ExecutorModel: Send + Sync {
    async fn next_actions(
        &self,
        task: &Task,
        transcript: &[Message],
        page: &PageState,
        frame: Option<&[u8]>,
    ) -> Result<ExecutorOutput, ModelError>;
}

/// The model issuing periodic high-level guidance.
#[async_trait]
pub trait PlannerModel: Send + Sync {
    async fn plan(
        &self,
        task: &Task,
        transcript: &[Message],
        frame: Option<&[u8]>,
    ) -> Result<String, ModelError>;
}

/// JSON schema of [`ACTION_TOOL`].
pub fn action_tool_schema() -> Value {
    json!({
        "type": "function",
        "function": {
            "name": ACTION_TOOL,
            "description": "Perform one or more browser actions in order.",
            "parameters": {
                "type": "object",
                "properties": {
                    "thought": { "type": "string", "description": "Short reasoning for this step." },
                    "actions": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "action": {
                                    "type": "string",
                                    "enum": ["Navigate", "Click", "TypeText", "PressKey", "Extract", "Wait", "Done"]
                                },
                                "url": { "type": "string" },
                                "index": { "type": "integer" },
                                "text": { "type": "string" },
                                "key": { "type": "string" },
                                "ms": { "type": "integer" },
                                "summary": { "type": "string" },
                                "success": { "type": "boolean" }
                            },
                            "required": ["action"]
                        }
                    }
                },
                "required": ["actions"]
            }
        }
    })
}

/// Thin chat-completions client shared by both models.
#[derive(Clone)]
pub struct OpenAiClient {
    client: Client,
    api_key: String,
    api_base: String,
    model: String,
}

impl OpenAiClient {
    pub fn new(api_key: impl Into<String>, api_base: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            api_base: api_base.into(),
            model: model.into(),
        }
    }

    /// Client for `model` using `OPENAI_API_KEY` from the environment.
    pub fn from_env(config: &AgentConfig, model: &str) -> anyhow::Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY not set in environment"))?;
        Ok(Self::new(api_key, config.api_base.clone(), model))
    }

    /// Send one completion request and return the reply message object.
    async fn complete(&self, messages: Vec<Value>, tools: Option<Value>) -> Result<Value, ModelError> {
        let mut body = json!({
            "model": self.model,
            "messages": messages,
        });
        if let Some(tools) = tools {
            body["tools"] = tools;
            body["tool_choice"] = json!("required");
        }

        let response = self
            .client
            .post(format!("{}/chat/completions", self.api_base.trim_end_matches('/')))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| ModelError::Transport(err.to_string()))?;

        let status = response.status();
        let reply: Value = response
            .json()
            .await
            .map_err(|err| ModelError::Transport(err.to_string()))?;

        if !status.is_success() {
            let message = reply["error"]["message"]
                .as_str()
                .unwrap_or("Unknown API error")
                .to_string();
            return Err(ModelError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let message = reply["choices"][0]["message"].clone();
        if message.is_null() {
            return Err(ModelError::Malformed(format!("no message in response: {reply}")));
        }
        debug!(model = %self.model, "model replied");
        Ok(message)
    }
}

/// Convert a transcript message to the chat-completions wire shape.
pub fn to_wire(message: &Message) -> Value {
    match message {
        Message::System { content } => json!({ "role": "system", "content": content }),
        Message::User { content } => json!({ "role": "user", "content": content }),
        Message::Assistant {
            content,
            tool_calls,
        } if tool_calls.is_empty() => json!({ "role": "assistant", "content": content }),
        Message::Assistant {
            content,
            tool_calls,
        } => {
            let calls: Vec<Value> = tool_calls
                .iter()
                .map(|call| {
                    json!({
                        "id": call.id,
                        "type": "function",
                        "function": { "name": call.name, "arguments": call.arguments.to_string() }
                    })
                })
                .collect();
            json!({ "role": "assistant", "content": content, "tool_calls": calls })
        }
        Message::Tool { call_id, content } => {
            json!({ "role": "tool", "tool_call_id": call_id, "content": content })
        }
    }
}

/// Decode the executor's reply: the tool-call arguments, or failing that a
/// JSON object in the message content.
pub fn parse_executor_reply(message: &Value) -> Result<ExecutorOutput, ModelError> {
    if let Some(arguments) = message["tool_calls"][0]["function"]["arguments"].as_str() {
        return serde_json::from_str(arguments)
            .map_err(|err| ModelError::Malformed(format!("bad tool arguments: {err}")));
    }

    let content = message["content"].as_str().unwrap_or_default();
    // Strip possible markdown fences the model might add
    let cleaned = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    serde_json::from_str(cleaned)
        .map_err(|err| ModelError::Malformed(format!("no tool call and unparsable content ({err})")))
}

/// A user message carrying `text`, plus the screenshot as an `image_url`
/// part when there is one.
pub fn user_message(text: String, frame: Option<&[u8]>) -> Value {
    match frame {
        None => json!({ "role": "user", "content": text }),
        Some(png) => json!({
            "role": "user",
            "content": [
                { "type": "text", "text": text },
                {
                    "type": "image_url",
                    "image_url": { "url": format!("data:image/png;base64,{}", STANDARD.encode(png)) }
                }
            ]
        }),
    }
}

fn system_message(prompt: &str, task: &Task, extension: Option<&str>) -> Value {
    let mut content = prompt.to_string();
    if !task.guidelines.trim().is_empty() {
        content.push_str("\n\nOperating guidelines:\n");
        content.push_str(task.guidelines.trim());
    }
    if let Some(extension) = extension.map(str::trim).filter(|e| !e.is_empty()) {
        content.push_str("\n\n");
        content.push_str(extension);
    }
    json!({ "role": "system", "content": content })
}

pub struct OpenAiExecutor {
    client: OpenAiClient,
}

impl OpenAiExecutor {
    pub fn new(client: OpenAiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ExecutorModel for OpenAiExecutor {
    async fn next_actions(
        &self,
        task: &Task,
        transcript: &[Message],
        page: &PageState,
        frame: Option<&[u8]>,
    ) -> Result<ExecutorOutput, ModelError> {
        let mut messages = vec![system_message(
            EXECUTOR_PROMPT,
            task,
            task.extend_system_message.as_deref(),
        )];
        messages.extend(transcript.iter().map(to_wire));
        messages.push(user_message(
            format!("Current page:\n{}\n\nWhat are your next actions?", page.describe()),
            frame,
        ));

        let reply = self
            .client
            .complete(messages, Some(json!([action_tool_schema()])))
            .await?;
        parse_executor_reply(&reply)
    }
}

pub struct OpenAiPlanner {
    client: OpenAiClient,
}

impl OpenAiPlanner {
    pub fn new(client: OpenAiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PlannerModel for OpenAiPlanner {
    async fn plan(
        &self,
        task: &Task,
        transcript: &[Message],
        frame: Option<&[u8]>,
    ) -> Result<String, ModelError> {
        let mut messages = vec![system_message(
            PLANNER_PROMPT,
            task,
            task.extend_planner_system_message.as_deref(),
        )];
        messages.extend(transcript.iter().map(to_wire));
        if frame.is_some() {
            messages.push(user_message("Screenshot of the current page.".to_string(), frame));
        }

        let reply = self.client.complete(messages, None).await?;
        let guidance = reply["content"].as_str().unwrap_or_default().trim().to_string();
        if guidance.is_empty() {
            return Err(ModelError::Malformed("planner returned no text".into()));
        }
        Ok(guidance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolCall;

    #[test]
    fn tool_call_arguments_are_parsed() {
        let message = json!({
            "role": "assistant",
            "content": null,
            "tool_calls": [{
                "id": "call_1",
                "type": "function",
                "function": {
                    "name": ACTION_TOOL,
                    "arguments": "{\"thought\":\"open it\",\"actions\":[{\"action\":\"Click\",\"index\":2}]}"
                }
            }]
        });
        let output = parse_executor_reply(&message).unwrap();
        assert_eq!(output.thought, "open it");
        assert_eq!(output.actions, vec![Action::Click { index: 2 }]);
    }

    #[test]
    fn fenced_content_is_accepted() {
        let message = json!({
            "role": "assistant",
            "content": "```json\n{\"actions\":[{\"action\":\"Done\",\"summary\":\"ok\"}]}\n```"
        });
        let output = parse_executor_reply(&message).unwrap();
        assert!(output.actions[0].is_done());
    }

    #[test]
    fn prose_is_malformed() {
        let message = json!({ "role": "assistant", "content": "I will click the button." });
        assert!(matches!(
            parse_executor_reply(&message),
            Err(ModelError::Malformed(_))
        ));
    }

    #[test]
    fn assistant_tool_calls_keep_their_ids_on_the_wire() {
        let message = Message::Assistant {
            content: "go".into(),
            tool_calls: vec![ToolCall {
                id: "step-4".into(),
                name: ACTION_TOOL.into(),
                arguments: json!({"actions": []}),
            }],
        };
        let wire = to_wire(&message);
        assert_eq!(wire["tool_calls"][0]["id"], "step-4");
        assert_eq!(wire["tool_calls"][0]["function"]["arguments"], "{\"actions\":[]}");

        let tool = to_wire(&Message::Tool {
            call_id: "step-4".into(),
            content: "ok".into(),
        });
        assert_eq!(tool["tool_call_id"], "step-4");
    }

    #[test]
    fn system_message_appends_guidelines_then_extension() {
        let task = Task {
            extend_system_message: Some("Prefer the classic UI.".into()),
            ..Task::new("create a test", "  Never delete records.\n")
        };
        let message = system_message(EXECUTOR_PROMPT, &task, task.extend_system_message.as_deref());
        let content = message["content"].as_str().unwrap();
        assert!(content.starts_with(EXECUTOR_PROMPT));
        assert!(content.ends_with(
            "\n\nOperating guidelines:\nNever delete records.\n\nPrefer the classic UI."
        ));

        let bare = system_message(PLANNER_PROMPT, &Task::new("goal", ""), Some("   "));
        assert_eq!(bare["content"], PLANNER_PROMPT);
    }

    #[test]
    fn screenshot_rides_along_as_an_image_part() {
        let plain = user_message("Current page".into(), None);
        assert_eq!(plain["content"], "Current page");

        let with_frame = user_message("Current page".into(), Some(&[0x89, b'P', b'N', b'G'][..]));
        let parts = with_frame["content"].as_array().unwrap();
        assert_eq!(parts[0], json!({ "type": "text", "text": "Current page" }));
        assert_eq!(parts[1]["type"], "image_url");
        assert_eq!(parts[1]["image_url"]["url"], "data:image/png;base64,iVBORw==");
    }
}
