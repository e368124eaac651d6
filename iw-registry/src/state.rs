use serde::{Deserialize, Serialize};

/// [`State`] is the operational state every registered component reports.
/// Transitions are not enforced, but components follow
/// `Inactive -> Busy -> Ready` on startup and
/// `Ready -> Degraded -> (Busy -> Ready | Fatal)` while recovering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    /// Ready for operation
    Ready,
    /// Actively handling a request or setting itself up
    Busy,
    /// Loaded but currently unused or stopped
    Inactive,
    /// A possibly recoverable problem, service may be inhibited for now
    Degraded,
    /// The component can not continue providing its service
    Fatal,
}

impl State {
    pub fn name(&self) -> &'static str {
        match self {
            State::Ready => "ready",
            State::Busy => "busy",
            State::Inactive => "inactive",
            State::Degraded => "degraded",
            State::Fatal => "fatal",
        }
    }

    /// Severity used when logging a transition into this state
    pub fn log_level(&self) -> log::Level {
        match self {
            State::Degraded => log::Level::Warn,
            State::Fatal => log::Level::Error,
            _ => log::Level::Info,
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
