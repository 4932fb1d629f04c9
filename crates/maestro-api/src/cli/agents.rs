//! `maestro agents`: inspect an agent catalog.

use std::path::Path;

use anyhow::Result;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use maestro_core::agent::AgentRegistry;
use maestro_infra::catalog::load_agent_catalog;

pub async fn list(file: &Path, capability: Option<&str>, json: bool) -> Result<()> {
    let registry = AgentRegistry::from_descriptors(load_agent_catalog(file).await?);
    let agents = match capability {
        Some(tag) => registry.find_by_capability(tag),
        None => registry.list(),
    };

    if json {
        let out: Vec<_> = agents.iter().map(|a| a.as_ref()).collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if agents.is_empty() {
        println!();
        match capability {
            Some(tag) => println!("  No agents with capability '{tag}'."),
            None => println!("  No agents in {}.", file.display()),
        }
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Agent").fg(Color::Cyan),
            Cell::new("Capabilities"),
            Cell::new("Tools"),
            Cell::new("Timeout"),
            Cell::new("Description"),
        ]);
    for agent in &agents {
        let tags: Vec<&str> = agent.capability_tags.iter().map(String::as_str).collect();
        let timeout = agent
            .default_timeout_secs
            .map(|s| format!("{s}s"))
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            Cell::new(&agent.id),
            Cell::new(tags.join(", ")),
            Cell::new(agent.tools.join(", ")),
            Cell::new(timeout),
            Cell::new(agent.description.as_deref().unwrap_or("-")),
        ]);
    }

    println!();
    println!("  Agents in {}", style(file.display()).cyan());
    println!();
    println!("{table}");
    println!();
    Ok(())
}
