//! Configuration module for bgstrip
//!
//! Loads config from `$XDG_CONFIG_HOME/bgstrip/config.toml` or `~/.config/bgstrip/config.toml`.
//! Falls back to embedded defaults if file doesn't exist.
//! Partial configs are merged with defaults using serde's default attributes.
//!
//! # Example
//!
//! ```no_run
//! use bgstrip::config::Config;
//!
//! let config = Config::load().expect("Failed to load config");
//! println!("Models directory: {}", config.models.dir.display());
//! println!("Default model: {}", config.models.default);
//! ```

pub mod schema;

pub use schema::Config;
