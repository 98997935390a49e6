//! # Core Runtime Module
//!
//! Runtime infrastructure shared by the federation engine:
//! - Logging and tracing infrastructure
//! - Configuration management (`FederationConfig`)
//! - Event bus system
//!
//! ## Overview
//!
//! This crate establishes how collaborators are injected, how the engine logs,
//! and how progress is broadcast to the host. It holds no federation logic.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
