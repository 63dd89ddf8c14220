//! Persistence layer for loca: SQLite schema, connection pool and typed
//! queries over agents, tasks, workflows and token usage.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
