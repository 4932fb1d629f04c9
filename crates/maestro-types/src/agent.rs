//! Agent capability descriptors and executor payload types.
//!
//! An [`AgentDescriptor`] is pure data: the id an agent is addressed by, the
//! capability tags it can be discovered through, the shape of input it
//! accepts, the tools it declares, and its default step timeout.
//!
//! Specialised variants (per vertical, region, language) are composed from a
//! base descriptor plus named [`DescriptorOverride`] fragments through
//! [`AgentDescriptorBuilder`], never by mutating a registered descriptor.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DescriptorError;

// ---------------------------------------------------------------------------
// AgentDescriptor
// ---------------------------------------------------------------------------

/// Immutable capability descriptor for one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub capability_tags: BTreeSet<String>,

    /// JSON Schema (or any structural hint) for the accepted input payload.
    #[serde(default)]
    pub input_schema: serde_json::Value,

    /// Tools the agent may call while running.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_timeout_secs: Option<u64>,
}

impl AgentDescriptor {
    /// Minimal descriptor with only an id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: None,
            capability_tags: BTreeSet::new(),
            input_schema: serde_json::Value::Null,
            tools: Vec::new(),
            default_timeout_secs: None,
        }
    }

    pub fn has_capability(&self, tag: &str) -> bool {
        self.capability_tags.contains(tag)
    }
}

// ---------------------------------------------------------------------------
// Override fragments + builder
// ---------------------------------------------------------------------------

/// A named fragment layered on top of a base descriptor.
///
/// Set-like fields are additive; scalar fields replace the base value when present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DescriptorOverride {
    pub name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capability_tags: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_timeout_secs: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl DescriptorOverride {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.capability_tags.push(tag.into());
        self
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tools.push(tool.into());
        self
    }

    pub fn with_input_schema(mut self, schema: serde_json::Value) -> Self {
        self.input_schema = Some(schema);
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.default_timeout_secs = Some(secs);
        self
    }
}

/// Composes an [`AgentDescriptor`] from a base descriptor and ordered fragments.
#[derive(Debug, Clone)]
pub struct AgentDescriptorBuilder {
    current: AgentDescriptor,
    applied: Vec<String>,
}

impl AgentDescriptorBuilder {
    /// Start from a copy of `base`. The base itself is never modified.
    pub fn from_base(base: &AgentDescriptor) -> Self {
        Self {
            current: base.clone(),
            applied: Vec::new(),
        }
    }

    /// Give the specialised descriptor its own id.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.current.id = id.into();
        self
    }

    /// Layer one fragment. Later fragments win on scalar fields.
    pub fn apply(mut self, fragment: &DescriptorOverride) -> Self {
        self.current
            .capability_tags
            .extend(fragment.capability_tags.iter().cloned());

        for tool in &fragment.tools {
            if !self.current.tools.contains(tool) {
                self.current.tools.push(tool.clone());
            }
        }

        if let Some(schema) = &fragment.input_schema {
            self.current.input_schema = schema.clone();
        }
        if let Some(secs) = fragment.default_timeout_secs {
            self.current.default_timeout_secs = Some(secs);
        }
        if let Some(desc) = &fragment.description {
            self.current.description = Some(desc.clone());
        }

        self.applied.push(fragment.name.clone());
        self
    }

    /// Names of fragments applied so far, in order.
    pub fn applied(&self) -> &[String] {
        &self.applied
    }

    pub fn build(self) -> Result<AgentDescriptor, DescriptorError> {
        if self.current.id.trim().is_empty() {
            return Err(DescriptorError::EmptyId);
        }
        if self.current.default_timeout_secs == Some(0) {
            return Err(DescriptorError::ZeroTimeout(self.current.id));
        }
        Ok(self.current)
    }
}

// ---------------------------------------------------------------------------
// Executor payloads
// ---------------------------------------------------------------------------

/// One unit of work handed to an agent executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRequest {
    pub execution_id: Uuid,
    pub step_id: String,
    pub agent_id: String,
    pub input: serde_json::Value,
}

/// Token and tool usage reported by an agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub tool_calls: u32,
}

/// Successful result of one agent call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOutput {
    pub payload: serde_json::Value,
    #[serde(default)]
    pub usage: ResourceUsage,
}

impl AgentOutput {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            payload,
            usage: ResourceUsage::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base() -> AgentDescriptor {
        AgentDescriptor {
            id: "support".to_string(),
            description: Some("General support agent".to_string()),
            capability_tags: ["support".to_string()].into_iter().collect(),
            input_schema: json!({"type": "object"}),
            tools: vec!["search".to_string()],
            default_timeout_secs: Some(60),
        }
    }

    #[test]
    fn test_builder_layers_fragments_over_base() {
        let region = DescriptorOverride::named("eu")
            .with_tag("region:eu")
            .with_tool("gdpr-lookup")
            .with_tool("search");
        let language = DescriptorOverride::named("de")
            .with_tag("lang:de")
            .with_timeout_secs(90);

        let builder = AgentDescriptorBuilder::from_base(&base())
            .id("support-eu-de")
            .apply(&region)
            .apply(&language);
        assert_eq!(builder.applied(), ["eu", "de"]);

        let descriptor = builder.build().unwrap();
        assert_eq!(descriptor.id, "support-eu-de");
        assert!(descriptor.has_capability("support"));
        assert!(descriptor.has_capability("region:eu"));
        assert!(descriptor.has_capability("lang:de"));
        assert_eq!(descriptor.tools, vec!["search", "gdpr-lookup"]);
        assert_eq!(descriptor.default_timeout_secs, Some(90));
        assert_eq!(descriptor.input_schema, json!({"type": "object"}));
    }

    #[test]
    fn test_builder_does_not_touch_base() {
        let base = base();
        let _ = AgentDescriptorBuilder::from_base(&base)
            .apply(&DescriptorOverride::named("x").with_tag("extra"))
            .build()
            .unwrap();
        assert!(!base.has_capability("extra"));
    }

    #[test]
    fn test_builder_later_fragment_wins_on_schema() {
        let descriptor = AgentDescriptorBuilder::from_base(&base())
            .apply(&DescriptorOverride::named("a").with_input_schema(json!({"a": 1})))
            .apply(&DescriptorOverride::named("b").with_input_schema(json!({"b": 2})))
            .build()
            .unwrap();
        assert_eq!(descriptor.input_schema, json!({"b": 2}));
    }

    #[test]
    fn test_builder_rejects_empty_id_and_zero_timeout() {
        let err = AgentDescriptorBuilder::from_base(&base()).id("  ").build().unwrap_err();
        assert_eq!(err, DescriptorError::EmptyId);

        let err = AgentDescriptorBuilder::from_base(&base())
            .apply(&DescriptorOverride::named("z").with_timeout_secs(0))
            .build()
            .unwrap_err();
        assert_eq!(err, DescriptorError::ZeroTimeout("support".to_string()));
    }

    #[test]
    fn test_descriptor_yaml_defaults() {
        let yaml = "id: writer\ncapability_tags: [drafting]\n";
        let descriptor: AgentDescriptor = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(descriptor.id, "writer");
        assert!(descriptor.has_capability("drafting"));
        assert!(descriptor.tools.is_empty());
        assert!(descriptor.default_timeout_secs.is_none());
        assert_eq!(descriptor.input_schema, serde_json::Value::Null);
    }
}
