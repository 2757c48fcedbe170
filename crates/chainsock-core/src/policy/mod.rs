//! Connection policies: retry spacing for `connect()` and the listener fault policy.

pub mod backoff;

pub use backoff::{Backoff, BackoffPolicy};

/// What the message listener does with an error from its read/classify pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerFaultPolicy {
    /// Fail every waiter on the connection and stop the listener.
    Strict,
    /// Log the error, reset the framing buffer, keep listening.
    Lenient,
}

impl ListenerFaultPolicy {
    /// Maps the `silence_listener_task_exceptions` flag onto a policy.
    pub fn from_silenced(silenced: bool) -> Self {
        if silenced {
            Self::Lenient
        } else {
            Self::Strict
        }
    }
}

impl std::fmt::Display for ListenerFaultPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Strict => write!(f, "strict"),
            Self::Lenient => write!(f, "lenient"),
        }
    }
}
