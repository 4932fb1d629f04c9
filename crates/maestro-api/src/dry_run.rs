//! Dry-run agent executor used by the CLI.
//!
//! Real agent work lives outside the engine. The CLI stands in an executor
//! that echoes each resolved input back, tagged with the agent id and the
//! tools its descriptor declares, so a definition can be walked end to end.

use std::sync::Arc;
use std::time::Duration;

use maestro_core::agent::{AgentExecutor, AgentRegistry};
use maestro_types::agent::{AgentOutput, AgentRequest, ResourceUsage};
use maestro_types::error::AgentError;
use serde_json::json;
use tokio_util::sync::CancellationToken;

pub struct DryRunExecutor {
    registry: Arc<AgentRegistry>,
}

impl DryRunExecutor {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self { registry }
    }
}

impl AgentExecutor for DryRunExecutor {
    async fn execute(
        &self,
        request: AgentRequest,
        cancel: CancellationToken,
        _timeout: Duration,
    ) -> Result<AgentOutput, AgentError> {
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        let tools = self
            .registry
            .find(&request.agent_id)
            .map(|d| d.tools.clone())
            .map_err(|e| AgentError::Failed(e.to_string()))?;

        tracing::debug!(
            step_id = request.step_id.as_str(),
            agent_id = request.agent_id.as_str(),
            "dry-run agent call"
        );

        let input_size = request.input.to_string().len() as u64;
        let payload = json!({
            "agent_id": request.agent_id,
            "tools": tools,
            "input": request.input,
        });
        Ok(AgentOutput {
            payload,
            usage: ResourceUsage {
                input_tokens: input_size.div_ceil(4),
                ..ResourceUsage::default()
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_types::agent::AgentDescriptor;
    use uuid::Uuid;

    fn request(agent_id: &str) -> AgentRequest {
        AgentRequest {
            execution_id: Uuid::now_v7(),
            step_id: "draft".into(),
            agent_id: agent_id.into(),
            input: json!({ "topic": "tides" }),
        }
    }

    fn executor() -> DryRunExecutor {
        let mut writer = AgentDescriptor::new("writer");
        writer.tools = vec!["search".into()];
        DryRunExecutor::new(Arc::new(AgentRegistry::from_descriptors([writer])))
    }

    #[tokio::test]
    async fn echoes_input_with_agent_and_tools() {
        let output = executor()
            .execute(request("writer"), CancellationToken::new(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(
            output.payload,
            json!({ "agent_id": "writer", "tools": ["search"], "input": { "topic": "tides" } })
        );
        assert!(output.usage.input_tokens > 0);
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let token = CancellationToken::new();
        token.cancel();
        let err = executor()
            .execute(request("writer"), token, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
    }

    #[tokio::test]
    async fn unknown_agent_fails() {
        let err = executor()
            .execute(request("ghost"), CancellationToken::new(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Failed(_)));
    }
}
