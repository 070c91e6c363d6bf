//! The host process boundary: signal and fault subscriptions, re-raising,
//! and exiting. The guard only ever talks to a [`ProcessHost`], so tests can
//! inject a recording fake and drive the state machine deterministically.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::signal::Signal;

/// Identifies one subscription installed through a [`ProcessHost`]. Issued
/// by the host, removed with the matching `unwatch_*` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

impl WatchId {
    pub fn new(raw: u64) -> Self {
        WatchId(raw)
    }
}

/// Trigger of the exception path: a condition after which resuming normal
/// execution is unsafe. The only thing a guard does with one is run the
/// exception cleanups and exit non-zero.
#[derive(Debug, Clone)]
pub enum Fault {
    /// An uncaught panic, captured by the system host's panic hook.
    Panic {
        message: String,
        location: Option<String>,
    },
    /// An unrecoverable failure reported through a
    /// [`FaultHandle`](crate::FaultHandle).
    TaskError { reason: String },
}

impl Fault {
    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Fault::Panic { .. } => "panic",
            Fault::TaskError { .. } => "task_error",
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::Panic {
                message,
                location: Some(location),
            } => write!(f, "panic at {location}: {message}"),
            Fault::Panic {
                message,
                location: None,
            } => write!(f, "panic: {message}"),
            Fault::TaskError { reason } => write!(f, "task error: {reason}"),
        }
    }
}

/// Capability the guard uses to talk to its host process. Production code
/// uses [`SystemHost`]; the integration tests use a fake that records every
/// call in order.
pub trait ProcessHost: Send + Sync + 'static {
    /// Deliver every platform-supported signal in `signals` to `sender`
    /// until the returned watch is removed. One watch covers the whole set.
    fn watch_signals(&self, signals: &[Signal], sender: mpsc::Sender<Signal>) -> WatchId;

    fn unwatch_signals(&self, id: WatchId);

    /// Deliver process faults (uncaught panics, reported task errors) to
    /// `sender` until the returned watch is removed.
    fn watch_faults(&self, sender: mpsc::Sender<Fault>) -> WatchId;

    fn unwatch_faults(&self, id: WatchId);

    /// Re-deliver `signal` to the process itself with its default
    /// disposition, as if no listener had ever been installed.
    fn reraise(&self, signal: Signal) -> io::Result<()>;

    /// Terminate the process with `code`.
    fn exit(&self, code: i32);

    /// Current process id.
    fn pid(&self) -> u32;

    /// Grace period the platform allows after `signal` before it kills the
    /// process on its own. When set, it bounds the routine cleanup run.
    fn forced_kill_grace(&self, _signal: Signal) -> Option<Duration> {
        None
    }
}

/// [`ProcessHost`] backed by the real process: one tokio signal stream per
/// subscribed signal, a chaining panic hook for fault delivery, and
/// signal-hook's default-disposition emulation for re-raising.
///
/// `watch_signals` spawns listener tasks, so a `SystemHost` must be used
/// from within a tokio runtime.
pub struct SystemHost {
    next_id: AtomicU64,
    signal_watches: Mutex<HashMap<WatchId, Vec<JoinHandle<()>>>>,
    faults: Arc<FaultRouter>,
    panic_hook: Once,
}

struct FaultRouter {
    watchers: Mutex<HashMap<WatchId, mpsc::Sender<Fault>>>,
}

impl FaultRouter {
    /// Runs inside the panic hook; must never panic itself, so a poisoned
    /// lock means the fault is dropped rather than aborting the process.
    fn dispatch(&self, fault: Fault) {
        let Ok(watchers) = self.watchers.lock() else {
            return;
        };
        for sender in watchers.values() {
            if let Err(e) = sender.try_send(fault.clone()) {
                debug!(error = %e, "fault watcher unavailable, fault dropped");
            }
        }
    }
}

impl SystemHost {
    pub fn new() -> Self {
        SystemHost {
            next_id: AtomicU64::new(1),
            signal_watches: Mutex::new(HashMap::new()),
            faults: Arc::new(FaultRouter {
                watchers: Mutex::new(HashMap::new()),
            }),
            panic_hook: Once::new(),
        }
    }

    fn next_watch(&self) -> WatchId {
        WatchId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Install the panic hook once per host. It forwards the panic to every
    /// fault watcher, then runs whatever hook was installed before it, so
    /// default panic output (and any other library's hook) is preserved.
    fn install_panic_hook(&self) {
        let router = self.faults.clone();
        self.panic_hook.call_once(move || {
            let previous = std::panic::take_hook();
            std::panic::set_hook(Box::new(move |info| {
                let message = info
                    .payload()
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| info.payload().downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "panic with non-string payload".to_string());
                let location = info.location().map(|l| l.to_string());
                router.dispatch(Fault::Panic { message, location });
                previous(info);
            }));
        });
    }
}

impl Default for SystemHost {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessHost for SystemHost {
    fn watch_signals(&self, signals: &[Signal], sender: mpsc::Sender<Signal>) -> WatchId {
        let id = self.next_watch();
        let mut tasks = Vec::with_capacity(signals.len());
        for &signal in signals {
            match spawn_signal_listener(signal, sender.clone()) {
                Some(task) => tasks.push(task),
                None => {
                    debug!(signal = %signal, "signal unsupported on this platform, no listener installed")
                }
            }
        }
        self.signal_watches
            .lock()
            .expect("signal watch lock poisoned")
            .insert(id, tasks);
        id
    }

    fn unwatch_signals(&self, id: WatchId) {
        let tasks = self
            .signal_watches
            .lock()
            .expect("signal watch lock poisoned")
            .remove(&id);
        for task in tasks.into_iter().flatten() {
            task.abort();
        }
    }

    fn watch_faults(&self, sender: mpsc::Sender<Fault>) -> WatchId {
        self.install_panic_hook();
        let id = self.next_watch();
        self.faults
            .watchers
            .lock()
            .expect("fault watcher lock poisoned")
            .insert(id, sender);
        id
    }

    fn unwatch_faults(&self, id: WatchId) {
        self.faults
            .watchers
            .lock()
            .expect("fault watcher lock poisoned")
            .remove(&id);
    }

    #[cfg(unix)]
    fn reraise(&self, signal: Signal) -> io::Result<()> {
        signal_hook::low_level::emulate_default_handler(signal.number())
    }

    #[cfg(not(unix))]
    fn reraise(&self, signal: Signal) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("cannot re-raise {signal} on this platform"),
        ))
    }

    fn exit(&self, code: i32) {
        std::process::exit(code);
    }

    fn pid(&self) -> u32 {
        std::process::id()
    }

    fn forced_kill_grace(&self, signal: Signal) -> Option<Duration> {
        // Windows kills the process unconditionally about 10 seconds after
        // the console window closes; leave headroom under that.
        if cfg!(windows) && signal == Signal::Hangup {
            return Some(Duration::from_secs(6));
        }
        None
    }
}

#[cfg(unix)]
fn spawn_signal_listener(signal: Signal, sender: mpsc::Sender<Signal>) -> Option<JoinHandle<()>> {
    use tokio::signal::unix::{signal as unix_signal, SignalKind};

    let kind = match signal {
        Signal::Terminate => SignalKind::terminate(),
        Signal::Interrupt => SignalKind::interrupt(),
        Signal::Hangup => SignalKind::hangup(),
        Signal::Quit => SignalKind::quit(),
        // SIGBREAK is a Windows console signal.
        Signal::Break => return None,
    };
    let mut stream = match unix_signal(kind) {
        Ok(stream) => stream,
        Err(error) => {
            warn!(signal = %signal, %error, "failed to install signal listener");
            return None;
        }
    };
    Some(tokio::spawn(async move {
        while stream.recv().await.is_some() {
            if let Err(e) = sender.try_send(signal) {
                debug!(signal = %signal, error = %e, "signal channel unavailable, delivery dropped");
            }
        }
    }))
}

#[cfg(windows)]
fn spawn_signal_listener(signal: Signal, sender: mpsc::Sender<Signal>) -> Option<JoinHandle<()>> {
    use tokio::signal::windows;

    macro_rules! forward {
        ($stream:expr) => {{
            let mut stream = match $stream {
                Ok(stream) => stream,
                Err(error) => {
                    warn!(signal = %signal, %error, "failed to install signal listener");
                    return None;
                }
            };
            Some(tokio::spawn(async move {
                while stream.recv().await.is_some() {
                    if let Err(e) = sender.try_send(signal) {
                        debug!(signal = %signal, error = %e, "signal channel unavailable, delivery dropped");
                    }
                }
            }))
        }};
    }

    match signal {
        Signal::Interrupt => forward!(windows::ctrl_c()),
        Signal::Break => forward!(windows::ctrl_break()),
        Signal::Hangup => forward!(windows::ctrl_close()),
        // No SIGTERM/SIGQUIT equivalents on Windows consoles.
        Signal::Terminate | Signal::Quit => None,
    }
}
