//! Run configuration.
//!
//! Defaults are overridden by `AGENT_*` environment variables (a `.env` file is
//! honoured by the binary), which the command line can override in turn.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Live steps allowed in one run (replayed steps do not count).
    pub max_steps: u32,
    /// The planner is consulted every `planner_interval` steps; 0 disables it.
    pub planner_interval: u32,
    pub max_actions_per_step: usize,
    /// Extra attempts for a transient browser failure within one step.
    pub action_retries: u32,
    /// Extra attempts for a rejected or failed model call.
    pub model_retries: u32,
    pub action_timeout_secs: u64,
    pub model_timeout_secs: u64,
    pub retry_delay_ms: u64,
    /// Allowed difference in interactive element count between a recorded
    /// step and its replay.
    pub replay_tolerance: usize,
    /// Bound on a single action result in transcripts and planner context.
    pub max_result_chars: usize,
    /// Bound on the element listing handed to the executor.
    pub max_page_chars: usize,
    /// Attach the latest screenshot to executor and planner requests.
    pub use_vision: bool,
    pub cdp_url: String,
    pub headless: bool,
    /// Chrome profile used when no running browser can be attached.
    pub profile_dir: Option<PathBuf>,
    pub api_base: String,
    pub executor_model: String,
    pub planner_model: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: 100,
            planner_interval: 4,
            max_actions_per_step: 20,
            action_retries: 2,
            model_retries: 1,
            action_timeout_secs: 30,
            model_timeout_secs: 120,
            retry_delay_ms: 500,
            replay_tolerance: 5,
            max_result_chars: 2_000,
            max_page_chars: 40_000,
            use_vision: true,
            cdp_url: "http://localhost:9222".to_string(),
            headless: false,
            profile_dir: None,
            api_base: "https://api.openai.com/v1".to_string(),
            executor_model: "gpt-5.2".to_string(),
            planner_model: "gpt-5.2".to_string(),
        }
    }
}

impl AgentConfig {
    /// Defaults overlaid with whatever `AGENT_*` variables are set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        override_from_env(&mut config.max_steps, "AGENT_MAX_STEPS");
        override_from_env(&mut config.planner_interval, "AGENT_PLANNER_INTERVAL");
        override_from_env(&mut config.max_actions_per_step, "AGENT_MAX_ACTIONS_PER_STEP");
        override_from_env(&mut config.action_retries, "AGENT_ACTION_RETRIES");
        override_from_env(&mut config.model_retries, "AGENT_MODEL_RETRIES");
        override_from_env(&mut config.action_timeout_secs, "AGENT_ACTION_TIMEOUT_SECS");
        override_from_env(&mut config.model_timeout_secs, "AGENT_MODEL_TIMEOUT_SECS");
        override_from_env(&mut config.retry_delay_ms, "AGENT_RETRY_DELAY_MS");
        override_from_env(&mut config.replay_tolerance, "AGENT_REPLAY_TOLERANCE");
        override_from_env(&mut config.max_result_chars, "AGENT_MAX_RESULT_CHARS");
        override_from_env(&mut config.max_page_chars, "AGENT_MAX_PAGE_CHARS");
        override_from_env(&mut config.use_vision, "AGENT_USE_VISION");
        override_from_env(&mut config.cdp_url, "AGENT_CDP_URL");
        override_from_env(&mut config.headless, "AGENT_HEADLESS");
        override_from_env(&mut config.api_base, "AGENT_API_BASE");
        override_from_env(&mut config.executor_model, "AGENT_EXECUTOR_MODEL");
        override_from_env(&mut config.planner_model, "AGENT_PLANNER_MODEL");
        if let Ok(dir) = std::env::var("AGENT_PROFILE_DIR") {
            config.profile_dir = Some(PathBuf::from(dir));
        }
        config
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.action_timeout_secs)
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_secs(self.model_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

fn override_from_env<T: FromStr>(slot: &mut T, key: &str) {
    let Ok(raw) = std::env::var(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *slot = value,
        Err(_) => warn!(key, value = %raw, "ignoring unparsable environment override"),
    }
}
