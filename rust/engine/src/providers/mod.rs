//! Built-in providers.
//!
//! One provider per check type: `ai` (pluggable agent backend with a
//! simulation default), `command` (shell execution), `http` (REST
//! calls), `script` (in-process expression programs), `memory` (store
//! operations), `workflow` (nested engine runs), and `noop`.

mod ai;
mod command;
mod http;
mod memory;
mod noop;
mod script;
mod workflow;

pub use ai::{AgentBackend, AgentReply, AiProvider};
pub use command::CommandProvider;
pub use http::HttpProvider;
pub use memory::MemoryProvider;
pub use noop::NoopProvider;
pub use script::ScriptProvider;
pub use workflow::WorkflowProvider;
