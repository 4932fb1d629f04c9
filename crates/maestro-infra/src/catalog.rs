//! YAML agent catalogs.
//!
//! A catalog lists base descriptors under `agents` and, optionally,
//! specialised `variants` composed from a base plus ordered override
//! fragments:
//!
//! ```yaml
//! agents:
//!   - id: writer
//!     capability_tags: [drafting]
//!     tools: [search]
//! variants:
//!   - id: legal-writer
//!     base: writer
//!     overrides:
//!       - name: legal
//!         capability_tags: [legal]
//!         default_timeout_secs: 600
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use maestro_types::agent::{AgentDescriptor, AgentDescriptorBuilder, DescriptorOverride};
use maestro_types::error::DescriptorError;
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("failed to read agent catalog {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid agent catalog YAML: {0}")]
    Parse(#[from] serde_yaml_ng::Error),

    #[error("variant '{variant}' extends unknown agent '{base}'")]
    UnknownBase { variant: String, base: String },

    #[error("duplicate agent id '{0}'")]
    DuplicateId(String),

    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    agents: Vec<AgentDescriptor>,
    #[serde(default)]
    variants: Vec<VariantEntry>,
}

#[derive(Debug, Deserialize)]
struct VariantEntry {
    id: String,
    base: String,
    #[serde(default)]
    overrides: Vec<DescriptorOverride>,
}

/// Parse a catalog into descriptors: bases first, then variants, each in file order.
pub fn parse_agent_catalog(yaml: &str) -> Result<Vec<AgentDescriptor>, CatalogError> {
    let file: CatalogFile = serde_yaml_ng::from_str(yaml)?;
    let mut seen = HashSet::new();
    let mut descriptors = Vec::with_capacity(file.agents.len() + file.variants.len());

    for agent in file.agents {
        let checked = AgentDescriptorBuilder::from_base(&agent).build()?;
        if !seen.insert(checked.id.clone()) {
            return Err(CatalogError::DuplicateId(checked.id));
        }
        descriptors.push(checked);
    }

    for variant in &file.variants {
        let base = descriptors
            .iter()
            .find(|d| d.id == variant.base)
            .ok_or_else(|| CatalogError::UnknownBase {
                variant: variant.id.clone(),
                base: variant.base.clone(),
            })?;
        let mut builder = AgentDescriptorBuilder::from_base(base).id(&variant.id);
        for fragment in &variant.overrides {
            builder = builder.apply(fragment);
        }
        tracing::debug!(
            agent_id = variant.id.as_str(),
            base = variant.base.as_str(),
            overrides = ?builder.applied(),
            "composed agent variant"
        );
        let descriptor = builder.build()?;
        if !seen.insert(descriptor.id.clone()) {
            return Err(CatalogError::DuplicateId(descriptor.id));
        }
        descriptors.push(descriptor);
    }

    Ok(descriptors)
}

/// Read and parse a catalog file.
pub async fn load_agent_catalog(path: &Path) -> Result<Vec<AgentDescriptor>, CatalogError> {
    let yaml = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    let descriptors = parse_agent_catalog(&yaml)?;
    tracing::info!(path = %path.display(), agents = descriptors.len(), "loaded agent catalog");
    Ok(descriptors)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"
agents:
  - id: writer
    description: Drafts copy
    capability_tags: [drafting]
    tools: [search]
  - id: reviewer
    capability_tags: [review]
    default_timeout_secs: 60
variants:
  - id: legal-writer
    base: writer
    overrides:
      - name: legal
        capability_tags: [legal]
        tools: [search, case-law]
        default_timeout_secs: 600
"#;

    #[test]
    fn parses_bases_and_variants_in_order() {
        let agents = parse_agent_catalog(CATALOG).unwrap();
        let ids: Vec<&str> = agents.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["writer", "reviewer", "legal-writer"]);

        let legal = &agents[2];
        assert!(legal.has_capability("drafting"));
        assert!(legal.has_capability("legal"));
        assert_eq!(legal.tools, vec!["search", "case-law"]);
        assert_eq!(legal.default_timeout_secs, Some(600));
        assert_eq!(legal.description.as_deref(), Some("Drafts copy"));
    }

    #[test]
    fn unknown_base_is_rejected() {
        let yaml = "variants:\n  - id: x\n    base: ghost\n";
        let err = parse_agent_catalog(yaml).unwrap_err();
        assert!(matches!(err, CatalogError::UnknownBase { .. }));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let yaml = "agents:\n  - id: a\n  - id: a\n";
        let err = parse_agent_catalog(yaml).unwrap_err();
        assert!(matches!(err, CatalogError::DuplicateId(id) if id == "a"));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let yaml = "agents:\n  - id: a\n    default_timeout_secs: 0\n";
        let err = parse_agent_catalog(yaml).unwrap_err();
        assert!(matches!(err, CatalogError::Descriptor(DescriptorError::ZeroTimeout(_))));
    }

    #[tokio::test]
    async fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agents.yaml");
        tokio::fs::write(&path, CATALOG).await.unwrap();

        let agents = load_agent_catalog(&path).await.unwrap();
        assert_eq!(agents.len(), 3);

        let err = load_agent_catalog(&dir.path().join("missing.yaml"))
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::Io { .. }));
    }
}
