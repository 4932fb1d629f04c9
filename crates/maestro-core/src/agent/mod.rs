//! Agents as seen by the engine: the capability catalog and the executor port.

pub mod executor;
pub mod registry;

pub use executor::{AgentExecutor, BoxAgentExecutor};
pub use registry::AgentRegistry;
