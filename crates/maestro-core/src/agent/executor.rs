//! Agent executor port and its type-erased wrapper.
//!
//! The orchestrator never runs agent logic itself. Each step hands an
//! [`AgentRequest`] to an [`AgentExecutor`] together with a cancellation
//! token and the step's effective timeout. Implementations must honour both;
//! the orchestrator additionally races the call against the token and its
//! own timer, so a misbehaving executor cannot hold a step past its deadline.
//!
//! `BoxAgentExecutor` follows the same blanket-impl pattern used for other
//! RPITIT ports: an object-safe `AgentExecutorDyn` with boxed futures,
//! blanket-implemented for every `AgentExecutor`.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use maestro_types::agent::{AgentOutput, AgentRequest};
use maestro_types::error::AgentError;
use tokio_util::sync::CancellationToken;

/// Runs one unit of agent work to completion or failure.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait AgentExecutor: Send + Sync + 'static {
    fn execute(
        &self,
        request: AgentRequest,
        cancel: CancellationToken,
        timeout: Duration,
    ) -> impl Future<Output = Result<AgentOutput, AgentError>> + Send;
}

/// Object-safe version of [`AgentExecutor`] with a boxed future.
pub trait AgentExecutorDyn: Send + Sync {
    fn execute_boxed(
        &self,
        request: AgentRequest,
        cancel: CancellationToken,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<AgentOutput, AgentError>> + Send + '_>>;
}

impl<T: AgentExecutor> AgentExecutorDyn for T {
    fn execute_boxed(
        &self,
        request: AgentRequest,
        cancel: CancellationToken,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<AgentOutput, AgentError>> + Send + '_>> {
        Box::pin(self.execute(request, cancel, timeout))
    }
}

/// Type-erased agent executor for runtime selection.
pub struct BoxAgentExecutor {
    inner: Box<dyn AgentExecutorDyn>,
}

impl BoxAgentExecutor {
    pub fn new<T: AgentExecutor>(executor: T) -> Self {
        Self {
            inner: Box::new(executor),
        }
    }
}

impl AgentExecutor for BoxAgentExecutor {
    fn execute(
        &self,
        request: AgentRequest,
        cancel: CancellationToken,
        timeout: Duration,
    ) -> impl Future<Output = Result<AgentOutput, AgentError>> + Send {
        self.inner.execute_boxed(request, cancel, timeout)
    }
}

impl std::fmt::Debug for BoxAgentExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxAgentExecutor").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    struct Upper;

    impl AgentExecutor for Upper {
        async fn execute(
            &self,
            request: AgentRequest,
            cancel: CancellationToken,
            _timeout: Duration,
        ) -> Result<AgentOutput, AgentError> {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            let text = request.input["text"].as_str().unwrap_or_default();
            Ok(AgentOutput::new(json!({"text": text.to_uppercase()})))
        }
    }

    fn request() -> AgentRequest {
        AgentRequest {
            execution_id: Uuid::now_v7(),
            step_id: "s".to_string(),
            agent_id: "upper".to_string(),
            input: json!({"text": "hi"}),
        }
    }

    #[tokio::test]
    async fn boxed_executor_delegates() {
        let boxed = BoxAgentExecutor::new(Upper);
        let out = boxed
            .execute(request(), CancellationToken::new(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(out.payload, json!({"text": "HI"}));
    }

    #[tokio::test]
    async fn boxed_executor_passes_token_through() {
        let boxed = BoxAgentExecutor::new(Upper);
        let token = CancellationToken::new();
        token.cancel();
        let err = boxed
            .execute(request(), token, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, AgentError::Cancelled);
    }
}
