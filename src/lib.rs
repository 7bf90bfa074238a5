//! Browser automation agent: an executor model acts on a live page step by
//! step while a planner model periodically reviews progress.

pub mod brain;
pub mod config;
pub mod dom;
pub mod error;
pub mod hands;
pub mod history;
pub mod masker;
pub mod scheduler;
pub mod session;
pub mod types;

pub use brain::{ExecutorModel, ExecutorOutput, PlannerModel};
pub use config::AgentConfig;
pub use dom::{DomSnapshot, DomTree, ElementHandle, ElementLocator, resolve};
pub use error::{AgentError, BrowserError, HistoryError, ModelError, ResolveError};
pub use hands::{Browser, ChromeBrowser};
pub use history::{HistoryDump, HistoryRecord, HistoryStore, RunLayout};
pub use scheduler::{StepScheduler, TerminalResult};
pub use session::Session;
pub use types::{Action, Message, Observation, PageState, RunStatus, Step, Task};
