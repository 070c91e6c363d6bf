//! The guard state machine: arming and disarming host subscriptions,
//! serialized cleanup execution, re-entrancy protection, and the terminal
//! action once cleanups have run.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cleanup::{self, boxed, Cleanup, FailurePolicy};
use crate::error::{CleanupFailure, ConfigError};
use crate::host::{Fault, ProcessHost, WatchId};
use crate::metrics;
use crate::signal::{Signal, SignalPreset};

/// Exit status used after the exception path: resuming is unsafe, so the
/// process always exits, and never with success.
const FAULT_EXIT_CODE: i32 = 1;

/// Capacity of the per-arm event channels. An overflowed trigger is dropped,
/// the same fate the state machine gives any trigger after the first.
const EVENT_CHANNEL_CAPACITY: usize = 8;

/// Guard configuration, immutable once the guard is constructed.
#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// Run routine cleanups when a subscribed signal arrives.
    pub routine_cleanup_enabled: bool,
    /// Signals that trigger the routine path. Must be non-empty at arming
    /// time when routine cleanup is enabled.
    pub routine_signals: Vec<Signal>,
    /// Run exception cleanups on uncaught panics and reported task errors.
    pub exception_cleanup_enabled: bool,
    /// What a cleanup list does when one of its entries fails.
    pub failure_policy: FailurePolicy,
    /// Bound on the routine cleanup run. Falls back to the host's
    /// per-signal forced-kill grace when unset.
    pub shutdown_timeout: Option<Duration>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        GuardConfig {
            routine_cleanup_enabled: true,
            routine_signals: SignalPreset::Default.signals(),
            exception_cleanup_enabled: true,
            failure_policy: FailurePolicy::default(),
            shutdown_timeout: None,
        }
    }
}

impl GuardConfig {
    /// Both cleanup categories enabled, the default signal preset, the
    /// `Continue` failure policy, and no shutdown timeout.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_routine_cleanup(mut self, enabled: bool) -> Self {
        self.routine_cleanup_enabled = enabled;
        self
    }

    pub fn with_routine_signals(mut self, signals: Vec<Signal>) -> Self {
        self.routine_signals = signals;
        self
    }

    pub fn with_exception_cleanup(mut self, enabled: bool) -> Self {
        self.exception_cleanup_enabled = enabled;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Max time the routine cleanup run gets after a signal before the
    /// guard stops waiting and proceeds to terminate. Does not cancel the
    /// slow cleanup's side effects, only the wait for them.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = Some(timeout);
        self
    }
}

struct Armed {
    signal_watch: Option<WatchId>,
    fault_watch: Option<WatchId>,
    fault_tx: Option<mpsc::Sender<Fault>>,
    stop: CancellationToken,
}

struct Shared {
    host: Arc<dyn ProcessHost>,
    config: GuardConfig,
    routine_cleanups: Mutex<Vec<Cleanup<Signal>>>,
    exception_cleanups: Mutex<Vec<Cleanup<Fault>>>,
    exit_cleanups: Mutex<Vec<Cleanup<i32>>>,
    // Sole re-entrancy protection: set with compare-and-set before any
    // asynchronous work starts, reset only by the next successful `up()`.
    signal_handler_running: AtomicBool,
    exception_handler_running: AtomicBool,
    armed: Mutex<Option<Armed>>,
}

/// Process-lifecycle guard: owns the host subscriptions for a set of
/// termination signals and for process faults, runs the registered cleanup
/// lists strictly in registration order when one fires, and then either
/// re-raises the signal (so the host's default disposition applies) or
/// exits with an error code.
///
/// One guard runs at most one shutdown sequence per trigger class between
/// [`up`](Guard::up) and [`down`](Guard::down); any further trigger while a
/// sequence is in flight is dropped, not queued.
///
/// ```no_run
/// # async fn example() -> Result<(), procguard::ConfigError> {
/// use std::sync::Arc;
/// use procguard::{Guard, GuardConfig, SystemHost};
///
/// let host = Arc::new(SystemHost::new());
/// let mut guard = Guard::new(host, GuardConfig::new());
/// guard.on_routine(|signal| async move {
///     tracing::info!(%signal, "closing listeners");
///     Ok(())
/// })?;
/// guard.up()?;
/// # Ok(())
/// # }
/// ```
pub struct Guard {
    shared: Arc<Shared>,
}

impl Guard {
    /// Construct an unarmed guard. Configuration problems surface at
    /// [`up`](Guard::up) (or in [`create_guard`] for preset names), not here.
    pub fn new(host: Arc<dyn ProcessHost>, config: GuardConfig) -> Self {
        Guard {
            shared: Arc::new(Shared {
                host,
                config,
                routine_cleanups: Mutex::new(Vec::new()),
                exception_cleanups: Mutex::new(Vec::new()),
                exit_cleanups: Mutex::new(Vec::new()),
                signal_handler_running: AtomicBool::new(false),
                exception_handler_running: AtomicBool::new(false),
                armed: Mutex::new(None),
            }),
        }
    }

    /// Append a routine cleanup, run with the triggering signal when a
    /// subscribed signal arrives. Registration order is execution order.
    pub fn on_routine<F, Fut>(&mut self, cleanup: F) -> Result<&mut Self, ConfigError>
    where
        F: FnMut(Signal) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if !self.shared.config.routine_cleanup_enabled {
            return Err(ConfigError::RoutineCleanupDisabled);
        }
        self.shared
            .routine_cleanups
            .lock()
            .expect("cleanup list lock poisoned")
            .push(boxed(cleanup));
        Ok(self)
    }

    /// Append an exception cleanup, run with the triggering fault.
    pub fn on_exception<F, Fut>(&mut self, cleanup: F) -> Result<&mut Self, ConfigError>
    where
        F: FnMut(Fault) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if !self.shared.config.exception_cleanup_enabled {
            return Err(ConfigError::ExceptionCleanupDisabled);
        }
        self.shared
            .exception_cleanups
            .lock()
            .expect("cleanup list lock poisoned")
            .push(boxed(cleanup));
        Ok(self)
    }

    /// Append an exit cleanup, run with the exit code when the guard itself
    /// terminates the process (the exception path, or a failed re-raise).
    /// Not run before a re-raise: a signal death is not an orderly exit.
    pub fn on_exit<F, Fut>(&mut self, cleanup: F) -> &mut Self
    where
        F: FnMut(i32) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.shared
            .exit_cleanups
            .lock()
            .expect("cleanup list lock poisoned")
            .push(boxed(cleanup));
        self
    }

    /// Handle for reporting an unrecoverable asynchronous failure into the
    /// armed guard, the analog of an unhandled rejection. Reports while the
    /// guard is disarmed (or exception cleanup is disabled) are dropped.
    pub fn fault_handle(&self) -> FaultHandle {
        FaultHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn is_armed(&self) -> bool {
        self.shared
            .armed
            .lock()
            .expect("armed state lock poisoned")
            .is_some()
    }

    /// Arm the guard: subscribe to the configured host events and start the
    /// watcher that drives cleanup execution. Idempotent while armed.
    /// Resets the re-entrancy flags, so a re-armed guard can run a fresh
    /// shutdown sequence.
    ///
    /// Must be called from within a tokio runtime.
    pub fn up(&mut self) -> Result<(), ConfigError> {
        let mut armed = self.shared.armed.lock().expect("armed state lock poisoned");
        if armed.is_some() {
            return Ok(());
        }
        let config = &self.shared.config;
        if config.routine_cleanup_enabled && config.routine_signals.is_empty() {
            return Err(ConfigError::NoRoutineSignals);
        }

        self.shared
            .signal_handler_running
            .store(false, Ordering::SeqCst);
        self.shared
            .exception_handler_running
            .store(false, Ordering::SeqCst);

        let stop = CancellationToken::new();
        let (signal_tx, signal_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (fault_tx, fault_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let signal_watch = config
            .routine_cleanup_enabled
            .then(|| self.shared.host.watch_signals(&config.routine_signals, signal_tx));
        let fault_watch = config
            .exception_cleanup_enabled
            .then(|| self.shared.host.watch_faults(fault_tx.clone()));

        *armed = Some(Armed {
            signal_watch,
            fault_watch,
            fault_tx: config.exception_cleanup_enabled.then_some(fault_tx),
            stop: stop.clone(),
        });
        drop(armed);

        debug!(
            pid = self.shared.host.pid(),
            signals = ?self.shared.config.routine_signals,
            "guard armed"
        );
        tokio::spawn(run_watcher(self.shared.clone(), signal_rx, fault_rx, stop));
        Ok(())
    }

    /// Disarm the guard: remove every host subscription installed by
    /// [`up`](Guard::up) and stop the watcher. Idempotent; a no-op on a
    /// guard that was never armed. Does not reset the re-entrancy flags;
    /// those reset only on the next successful `up()`.
    pub fn down(&mut self) {
        disarm(&self.shared);
    }
}

/// Clonable handle for reporting an unrecoverable asynchronous failure to
/// the guard it came from. Rust has no global unhandled-rejection hook;
/// application code calls [`report`](FaultHandle::report) where it would
/// otherwise let a fatal task error go unobserved.
#[derive(Clone)]
pub struct FaultHandle {
    shared: Arc<Shared>,
}

impl FaultHandle {
    pub fn report(&self, reason: impl Into<String>) {
        let fault = Fault::TaskError {
            reason: reason.into(),
        };
        let armed = self.shared.armed.lock().expect("armed state lock poisoned");
        match armed.as_ref().and_then(|a| a.fault_tx.as_ref()) {
            Some(tx) => {
                if let Err(e) = tx.try_send(fault) {
                    debug!(error = %e, "fault channel unavailable, report dropped");
                }
            }
            None => debug!(%fault, "fault reported while guard disarmed, dropped"),
        }
    }
}

fn disarm(shared: &Arc<Shared>) {
    let mut armed = shared.armed.lock().expect("armed state lock poisoned");
    let Some(state) = armed.take() else {
        return;
    };
    if let Some(id) = state.signal_watch {
        shared.host.unwatch_signals(id);
    }
    if let Some(id) = state.fault_watch {
        shared.host.unwatch_faults(id);
    }
    state.stop.cancel();
    debug!("guard disarmed");
}

async fn run_watcher(
    shared: Arc<Shared>,
    mut signal_rx: mpsc::Receiver<Signal>,
    mut fault_rx: mpsc::Receiver<Fault>,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            _ = stop.cancelled() => return,
            Some(signal) = signal_rx.recv() => handle_signal(&shared, signal).await,
            Some(fault) = fault_rx.recv() => handle_fault(&shared, fault).await,
        }
    }
}

async fn handle_signal(shared: &Arc<Shared>, signal: Signal) {
    if shared.exception_handler_running.load(Ordering::SeqCst) {
        debug!(signal = %signal, "signal dropped, exception handling in progress");
        return;
    }
    if shared
        .signal_handler_running
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        debug!(signal = %signal, "signal dropped, shutdown already in progress");
        return;
    }

    info!(signal = %signal, trigger_reason = "signal", "shutdown initiated");
    metrics::emit_shutdown_initiated("signal", signal.name());

    let cleanups = drain(&shared.routine_cleanups);
    let total = cleanups.len();
    let timeout = shared
        .config
        .shutdown_timeout
        .or_else(|| shared.host.forced_kill_grace(signal));

    let started = Instant::now();
    let failures = match timeout {
        Some(limit) => {
            let run = cleanup::run_serial(cleanups, signal, shared.config.failure_policy);
            match tokio::time::timeout(limit, run).await {
                Ok(failures) => failures,
                Err(_) => {
                    warn!(
                        signal = %signal,
                        limit_secs = limit.as_secs_f64(),
                        "shutdown timeout reached, abandoning remaining cleanups"
                    );
                    metrics::emit_cleanup_timeout("routine");
                    Vec::new()
                }
            }
        }
        None => cleanup::run_serial(cleanups, signal, shared.config.failure_policy).await,
    };
    surface_failures("routine", total, &failures, started);

    disarm(shared);
    terminate(shared, Termination::ReRaise(signal)).await;
}

async fn handle_fault(shared: &Arc<Shared>, fault: Fault) {
    if shared
        .exception_handler_running
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        debug!(%fault, "fault dropped, exception handling already in progress");
        return;
    }

    warn!(%fault, trigger_reason = fault.kind(), "unrecoverable fault, shutting down");
    metrics::emit_shutdown_initiated("fault", fault.kind());

    let cleanups = drain(&shared.exception_cleanups);
    let total = cleanups.len();
    let started = Instant::now();
    let failures = cleanup::run_serial(cleanups, fault, shared.config.failure_policy).await;
    surface_failures("exception", total, &failures, started);

    disarm(shared);
    // Resuming after an uncaught fault is unsafe; exit is the only terminal action.
    terminate(shared, Termination::Exit(FAULT_EXIT_CODE)).await;
}

/// Terminal transition of an armed guard.
enum Termination {
    /// Let the host apply the signal's default disposition.
    ReRaise(Signal),
    /// Exit with the code, after running exit cleanups with it.
    Exit(i32),
}

async fn terminate(shared: &Arc<Shared>, termination: Termination) {
    match termination {
        Termination::ReRaise(signal) => {
            info!(
                signal = %signal,
                pid = shared.host.pid(),
                "re-raising signal for its default disposition"
            );
            metrics::emit_terminated("reraise");
            if let Err(error) = shared.host.reraise(signal) {
                warn!(signal = %signal, %error, "re-raise failed, exiting instead");
                exit_with(shared, signal.default_exit_code()).await;
            }
        }
        Termination::Exit(code) => {
            metrics::emit_terminated("exit");
            exit_with(shared, code).await;
        }
    }
}

async fn exit_with(shared: &Arc<Shared>, code: i32) {
    let cleanups = drain(&shared.exit_cleanups);
    let total = cleanups.len();
    let started = Instant::now();
    let failures = cleanup::run_serial(cleanups, code, shared.config.failure_policy).await;
    surface_failures("exit", total, &failures, started);
    info!(code, "exiting");
    shared.host.exit(code);
}

fn drain<P>(list: &Mutex<Vec<Cleanup<P>>>) -> Vec<Cleanup<P>> {
    std::mem::take(&mut *list.lock().expect("cleanup list lock poisoned"))
}

fn surface_failures(path: &str, total: usize, failures: &[CleanupFailure], started: Instant) {
    metrics::emit_cleanup_duration(path, started.elapsed().as_secs_f64());
    for failure in failures {
        metrics::emit_cleanup_failure(path);
        warn!(
            path,
            index = failure.index,
            total,
            error = %failure.source,
            "cleanup failed"
        );
    }
}

/// Options accepted by [`create_guard`]: the friendlier construction
/// surface, with named signal presets instead of explicit signal lists.
#[derive(Debug, Clone)]
pub struct GuardOptions {
    pub routine_cleanup: bool,
    pub signals: SignalSelection,
    pub exception_cleanup: bool,
    pub failure_policy: FailurePolicy,
    pub shutdown_timeout: Option<Duration>,
}

impl Default for GuardOptions {
    fn default() -> Self {
        GuardOptions {
            routine_cleanup: true,
            signals: SignalSelection::Preset("default".to_string()),
            exception_cleanup: true,
            failure_policy: FailurePolicy::default(),
            shutdown_timeout: None,
        }
    }
}

/// How [`create_guard`] picks the routine signal set.
#[derive(Debug, Clone)]
pub enum SignalSelection {
    /// A named preset: `"default"` or `"extended"`.
    Preset(String),
    /// An explicit signal list, used as given.
    Explicit(Vec<Signal>),
}

/// Translate [`GuardOptions`] into a [`GuardConfig`] and construct the
/// guard. Fails with [`ConfigError::UnknownPreset`] for preset names it
/// does not recognize. Carries no state-machine logic of its own.
pub fn create_guard(
    host: Arc<dyn ProcessHost>,
    options: GuardOptions,
) -> Result<Guard, ConfigError> {
    let routine_signals = resolve_signal_selection(&options)?;
    Ok(Guard::new(
        host,
        GuardConfig {
            routine_cleanup_enabled: options.routine_cleanup,
            routine_signals,
            exception_cleanup_enabled: options.exception_cleanup,
            failure_policy: options.failure_policy,
            shutdown_timeout: options.shutdown_timeout,
        },
    ))
}

fn resolve_signal_selection(options: &GuardOptions) -> Result<Vec<Signal>, ConfigError> {
    if !options.routine_cleanup {
        return Ok(Vec::new());
    }
    match &options.signals {
        SignalSelection::Explicit(signals) => Ok(signals.clone()),
        SignalSelection::Preset(name) => Ok(name.parse::<SignalPreset>()?.signals()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preset_names_resolve_to_their_signal_sets() {
        let options = GuardOptions::default();
        assert_eq!(
            resolve_signal_selection(&options).unwrap(),
            SignalPreset::Default.signals()
        );

        let options = GuardOptions {
            signals: SignalSelection::Preset("extended".to_string()),
            ..GuardOptions::default()
        };
        assert_eq!(
            resolve_signal_selection(&options).unwrap(),
            SignalPreset::Extended.signals()
        );
    }

    #[test]
    fn unknown_preset_name_is_a_config_error() {
        let options = GuardOptions {
            signals: SignalSelection::Preset("aggressive".to_string()),
            ..GuardOptions::default()
        };
        assert!(matches!(
            resolve_signal_selection(&options),
            Err(ConfigError::UnknownPreset(name)) if name == "aggressive"
        ));
    }

    #[test]
    fn explicit_signal_list_is_used_as_given() {
        let options = GuardOptions {
            signals: SignalSelection::Explicit(vec![Signal::Quit, Signal::Terminate]),
            ..GuardOptions::default()
        };
        assert_eq!(
            resolve_signal_selection(&options).unwrap(),
            vec![Signal::Quit, Signal::Terminate]
        );
    }

    #[test]
    fn disabled_routine_cleanup_resolves_to_no_signals() {
        let options = GuardOptions {
            routine_cleanup: false,
            // Bogus preset name must not matter when the path is disabled.
            signals: SignalSelection::Preset("nonsense".to_string()),
            ..GuardOptions::default()
        };
        assert_eq!(resolve_signal_selection(&options).unwrap(), Vec::new());
    }
}
