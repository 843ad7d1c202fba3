//! # gemforge
//!
//! A self-hostable code forge. Repositories are browsed and administered
//! over Gemini, with client certificates standing in for browser sessions,
//! and transferred with git over smart HTTP or SSH.
//!
//! ## Library Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use gemforge::config::Config;
//! use gemforge::server::{AppState, http};
//!
//! let (config, _) = Config::load(None)?;
//! let state = Arc::new(AppState::open(config)?);
//! let router = http::create_router(state);
//! // Serve with axum...
//! ```
//!
//! ## Feature Flags
//!
//! - `cli` (default): builds the `gemforge` binary.

pub mod auth;
pub mod config;
pub mod error;
pub mod git;
pub mod identity;
pub mod server;
pub mod store;
#[cfg(test)]
mod test_support;
pub mod types;
pub mod validation;
