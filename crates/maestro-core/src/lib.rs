//! Orchestration engine and repository trait definitions for Maestro.
//!
//! This crate defines the "ports" (agent executor and execution store
//! traits) that collaborators implement, plus the workflow builder, the
//! agent registry, and the orchestrator itself. It depends only on
//! `maestro-types` -- never on `maestro-infra` or any database/IO crate.

pub mod agent;
pub mod event;
pub mod repository;
pub mod workflow;
