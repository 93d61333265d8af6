#![allow(clippy::multiple_crate_versions)]

pub mod app;
pub mod batch;
pub mod collection;
pub mod config;
pub mod controller;
pub mod error;
pub mod inference;
pub mod logging;
pub mod models;
pub mod output;

pub use error::{BgError, Result};
