//! Torale: a scheduled monitoring engine.
//!
//! Users declare a natural-language search query, a condition, and a cron
//! schedule; the engine periodically runs the query through an external
//! search agent, persists what it found, and delivers notifications when the
//! condition is met.

pub mod config;
pub mod db;
pub mod error;
pub mod routes;
pub mod services;

use config::Config;

/// Shared state for the internal HTTP surface.
pub struct AppState {
    pub db: sqlx::SqlitePool,
    pub config: Config,
}

#[cfg(test)]
pub(crate) mod testutil;
