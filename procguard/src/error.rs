//! Guard error types.

use thiserror::Error;

/// Invalid or incomplete guard configuration. Always synchronous and always
/// fatal to the call that triggered it.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The signal preset name is not one of the known presets.
    #[error("unknown signal preset '{0}' (expected 'default' or 'extended')")]
    UnknownPreset(String),

    /// The signal name is not one of the supported `SIG*` names.
    #[error("unknown signal '{0}'")]
    UnknownSignal(String),

    /// Routine cleanup is enabled but the signal set is empty at arming time.
    #[error("routine cleanup requires at least one subscribed signal")]
    NoRoutineSignals,

    /// A routine cleanup was registered on a guard without routine cleanup enabled.
    #[error("routine cleanup is not enabled on this guard")]
    RoutineCleanupDisabled,

    /// An exception cleanup was registered on a guard without exception cleanup enabled.
    #[error("exception cleanup is not enabled on this guard")]
    ExceptionCleanupDisabled,
}

/// A cleanup callback returned an error. The guard does not recover these;
/// depending on the configured [`FailurePolicy`](crate::FailurePolicy) the
/// remaining cleanups in the list either still run or are skipped, and every
/// failure is logged and counted after the run.
#[derive(Debug, Error)]
#[error("cleanup #{index} failed: {source}")]
pub struct CleanupFailure {
    /// Position of the failed cleanup in its list (registration order).
    pub index: usize,
    #[source]
    pub source: anyhow::Error,
}
