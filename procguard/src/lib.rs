//! Process-lifecycle guard: centralized registration and ordered execution
//! of cleanup callbacks when the process receives a termination signal, an
//! uncaught panic, or a reported unrecoverable task failure. One guard owns
//! the host subscriptions, runs each cleanup list strictly in registration
//! order, and decides how the process terminates afterward (re-raised
//! signal vs. error exit code), so independent cleanup actions never
//! install competing signal handlers or race each other.

mod cleanup;
mod error;
mod guard;
mod host;
mod metrics;
mod signal;

pub use cleanup::FailurePolicy;
pub use error::{CleanupFailure, ConfigError};
pub use guard::{create_guard, FaultHandle, Guard, GuardConfig, GuardOptions, SignalSelection};
pub use host::{Fault, ProcessHost, SystemHost, WatchId};
pub use signal::{Signal, SignalPreset};
