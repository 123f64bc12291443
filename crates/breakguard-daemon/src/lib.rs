//! BreakGuard Daemon - runs break enforcement on the workstation
//!
//! This crate provides:
//! - The enforcement task owning the lock controller, driven by a 1s tick
//! - Background camera capture and monitor power workers
//! - Config file loading and data directory resolution
//! - A persisted attempt budget for code-gated maintenance commands
//! - A stdin console and terminal lock/notification surfaces

pub mod authorize;
pub mod camera;
pub mod config;
pub mod console;
pub mod error;
pub mod power;
pub mod service;
pub mod surfaces;

pub use authorize::authorize;
pub use camera::CommandCamera;
pub use error::{DaemonError, Result};
pub use power::{CommandSwitch, TokioPowerDispatch};
pub use service::{Command, Enforcer, EnforcerHandle};
pub use surfaces::{ConsoleDisplay, ConsoleNotifier};
