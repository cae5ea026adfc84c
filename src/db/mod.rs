//! Database module: row models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: query-shaped structs returned by repositories.
//! - `repo`: SQL-only functions that map rows into entities.
//!
//! External modules import from `counsel_edge::db`; the repository API and
//! the row models are re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{AccessTokenRow, DatabaseHealth, OutboxTask, PlaintextToken};
