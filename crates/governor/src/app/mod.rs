//! Application module
//!
//! Wires the governance engine to its device feed, orchestrator, policy file
//! and HTTP API, and manages the lifecycle of the background tasks.

pub mod builder;
pub mod core;
pub mod services;
pub mod tasks;

pub use builder::ApplicationBuilder;
pub use core::Application;
pub use services::ApplicationServices;
