//! Application state shared by the command handlers.
//!
//! AppState resolves the data directory and engine config once. The SQLite
//! store is opened lazily so that commands which never touch persisted
//! executions (`validate`, `agents`, `run --ephemeral`) leave no database
//! behind.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use maestro_core::agent::AgentRegistry;
use maestro_core::repository::ExecutionStore;
use maestro_core::workflow::Orchestrator;
use maestro_infra::catalog::load_agent_catalog;
use maestro_infra::config::{load_engine_config, resolve_data_dir};
use maestro_infra::sqlite::SqliteExecutionStore;
use maestro_infra::sqlite::pool::{DatabasePool, database_url};
use maestro_types::agent::AgentDescriptor;
use maestro_types::config::EngineConfig;
use maestro_types::workflow::WorkflowDefinition;

use crate::dry_run::DryRunExecutor;

/// Orchestrator flavour the CLI drives: any store, dry-run agents.
pub type CliOrchestrator<S> = Orchestrator<S, DryRunExecutor>;

pub struct AppState {
    pub data_dir: PathBuf,
    pub config: EngineConfig,
}

impl AppState {
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;
        let config = load_engine_config(&data_dir).await;
        tracing::debug!(data_dir = %data_dir.display(), ?config, "application state ready");
        Ok(Self { data_dir, config })
    }

    /// Open (and migrate) the execution database in the data directory.
    pub async fn sqlite_store(&self) -> anyhow::Result<SqliteExecutionStore> {
        let pool = DatabasePool::new(&database_url(&self.data_dir))
            .await
            .context("failed to open execution database")?;
        Ok(SqliteExecutionStore::new(pool))
    }

    pub fn orchestrator<S: ExecutionStore>(
        &self,
        store: S,
        registry: Arc<AgentRegistry>,
    ) -> CliOrchestrator<S> {
        let executor = DryRunExecutor::new(Arc::clone(&registry));
        Orchestrator::new(store, executor, registry, self.config.clone())
    }
}

/// Build the registry for a run.
///
/// With a catalog, exactly the catalog's agents are registered. Without one,
/// every agent the workflow references gets a bare descriptor so that a
/// dry run can walk the whole definition.
pub async fn build_registry(
    catalog: Option<&Path>,
    def: Option<&WorkflowDefinition>,
) -> anyhow::Result<Arc<AgentRegistry>> {
    let descriptors = match catalog {
        Some(path) => load_agent_catalog(path).await?,
        None => def.map(referenced_agents).unwrap_or_default(),
    };
    Ok(Arc::new(AgentRegistry::from_descriptors(descriptors)))
}

fn referenced_agents(def: &WorkflowDefinition) -> Vec<AgentDescriptor> {
    let mut ids: Vec<&str> = def.all_steps().into_iter().filter_map(|s| s.agent_id()).collect();
    ids.sort_unstable();
    ids.dedup();
    tracing::info!(agents = ?ids, "no agent catalog given, registering referenced agents");
    ids.into_iter().map(AgentDescriptor::new).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_core::workflow::WorkflowBuilder;

    #[tokio::test]
    async fn registry_falls_back_to_referenced_agents() {
        let def = WorkflowBuilder::new("brief", "1.0.0")
            .sequential("draft", "writer")
            .sequential("polish", "writer")
            .sequential("check", "reviewer")
            .build()
            .unwrap();

        let registry = build_registry(None, Some(&def)).await.unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.find("writer").is_ok());
        assert!(registry.find("reviewer").is_ok());
    }

    #[tokio::test]
    async fn catalog_wins_over_referenced_agents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agents.yaml");
        tokio::fs::write(&path, "agents:\n  - id: writer\n    tools: [search]\n")
            .await
            .unwrap();
        let def = WorkflowBuilder::new("brief", "1.0.0")
            .sequential("draft", "writer")
            .sequential("check", "reviewer")
            .build()
            .unwrap();

        let registry = build_registry(Some(&path), Some(&def)).await.unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.find("reviewer").is_err());
    }
}
