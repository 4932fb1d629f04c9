//! Shared domain types for Maestro.
//!
//! This crate contains the data model used across the workflow engine:
//! agent descriptors, workflow definitions, execution records, progress
//! events, engine configuration, and their associated error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod agent;
pub mod config;
pub mod error;
pub mod event;
pub mod execution;
pub mod workflow;
