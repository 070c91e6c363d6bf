//! Supported process signals and named signal presets.

use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// The subset of process signals a guard can subscribe to. A platform that
/// lacks one of these silently gets no listener for it (`Break` on Unix,
/// `Terminate` and `Quit` on Windows).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// SIGTERM.
    Terminate,
    /// SIGINT, what Ctrl-C delivers.
    Interrupt,
    /// SIGHUP, sent when the controlling terminal or console window closes.
    Hangup,
    /// SIGQUIT.
    Quit,
    /// SIGBREAK, the Windows console Ctrl-Break signal.
    Break,
}

impl Signal {
    /// Conventional name, e.g. `"SIGTERM"`.
    pub fn name(self) -> &'static str {
        match self {
            Signal::Terminate => "SIGTERM",
            Signal::Interrupt => "SIGINT",
            Signal::Hangup => "SIGHUP",
            Signal::Quit => "SIGQUIT",
            Signal::Break => "SIGBREAK",
        }
    }

    pub(crate) fn number(self) -> i32 {
        match self {
            Signal::Hangup => 1,
            Signal::Interrupt => 2,
            Signal::Quit => 3,
            Signal::Terminate => 15,
            Signal::Break => 21,
        }
    }

    /// Exit status a process killed by this signal conventionally reports
    /// (128 + signal number). Used as the fallback exit code when re-raising
    /// is unavailable on the current platform.
    pub fn default_exit_code(self) -> i32 {
        128 + self.number()
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Signal {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SIGTERM" => Ok(Signal::Terminate),
            "SIGINT" => Ok(Signal::Interrupt),
            "SIGHUP" => Ok(Signal::Hangup),
            "SIGQUIT" => Ok(Signal::Quit),
            "SIGBREAK" => Ok(Signal::Break),
            other => Err(ConfigError::UnknownSignal(other.to_string())),
        }
    }
}

/// Named signal sets accepted by [`create_guard`](crate::create_guard).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalPreset {
    /// SIGTERM, SIGHUP, SIGINT.
    Default,
    /// SIGTERM, SIGINT, SIGHUP, SIGQUIT.
    Extended,
}

impl SignalPreset {
    /// The signals in this preset, in subscription order.
    pub fn signals(self) -> Vec<Signal> {
        match self {
            SignalPreset::Default => vec![Signal::Terminate, Signal::Hangup, Signal::Interrupt],
            SignalPreset::Extended => vec![
                Signal::Terminate,
                Signal::Interrupt,
                Signal::Hangup,
                Signal::Quit,
            ],
        }
    }
}

impl FromStr for SignalPreset {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(SignalPreset::Default),
            "extended" => Ok(SignalPreset::Extended),
            other => Err(ConfigError::UnknownPreset(other.to_string())),
        }
    }
}
