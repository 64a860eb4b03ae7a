//! HomeMatic CCU event bridge.
//!
//! Receives XML-RPC callbacks from a CCU, filters them down to monitored
//! devices, mirrors tracked parameters into an in-memory state cache,
//! persists the latest value per `(device, parameter)` and fires an outbound
//! notification when a window state changes.

pub mod access;
pub mod bridge;
pub mod config;
pub mod listener;
pub mod notifier;
pub mod pipeline;
pub mod registration;
pub mod state;
pub mod watchdog;

pub use bridge::{build_pipeline, Bridge, StartupError};
pub use config::{load_config, Config};
