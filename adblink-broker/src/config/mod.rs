//! Configuration for the adblink broker
//!
//! Loaded once at initialization; the broker keeps an immutable copy for
//! its whole lifetime.

mod defaults;
mod loader;
mod schema;

pub use defaults::DEFAULT_CONFIG_TOML;
pub use loader::ConfigLoader;
pub use schema::*;
