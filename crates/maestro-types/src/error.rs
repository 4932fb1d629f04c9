use thiserror::Error;

/// Errors from repository operations (used by trait definitions in maestro-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

/// Errors raised by the agent registry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("agent '{0}' not found")]
    NotFound(String),

    #[error("a global agent registry is already installed")]
    AlreadyInstalled,
}

/// Errors raised while composing an agent descriptor from fragments.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("agent descriptor id must not be empty")]
    EmptyId,

    #[error("default timeout must be greater than zero for agent '{0}'")]
    ZeroTimeout(String),
}

/// Errors returned by an agent executor for a single unit of work.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AgentError {
    /// The agent ran and reported a failure.
    #[error("agent failed: {0}")]
    Failed(String),

    /// The agent observed its cancellation token and stopped early.
    #[error("agent cancelled")]
    Cancelled,

    /// The agent gave up because its own deadline passed.
    #[error("agent timed out after {0}s")]
    TimedOut(u64),

    /// The input payload did not satisfy the agent's input schema.
    #[error("invalid agent input: {0}")]
    InvalidInput(String),
}

/// Errors raised when writing to an execution context.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContextError {
    #[error("step '{0}' already has a terminal result")]
    AlreadyRecorded(String),

    #[error("step '{0}' result is not terminal")]
    NotTerminal(String),
}
