//! Infrastructure layer for Maestro.
//!
//! Contains the implementations behind the ports defined in `maestro-core`:
//! the SQLite execution store, engine config loading, data directory
//! resolution, and YAML agent catalogs.

pub mod catalog;
pub mod config;
pub mod sqlite;
