//! The agent loop: turn execution, tool dispatch, steering, and context
//! compaction on top of the provider and store crates.

pub mod compaction;
pub mod dispatch;
pub mod error;
pub mod process;
pub mod queue;
pub mod registry;
pub mod runner;
pub mod sanitize;
pub mod tokens;
pub mod tools;

pub use compaction::{CompactionConfig, CompactionOutcome, Compactor};
pub use dispatch::Dispatcher;
pub use error::EngineError;
pub use queue::{Lane, MessageQueue, QueueMode, QueuedMessage};
pub use registry::{ToolRegistry, ToolSource};
pub use runner::{AgentRunner, RunnerConfig, SessionGate, TurnParams, TurnResult, TurnRunner};
pub use tools::create_default_registry;
