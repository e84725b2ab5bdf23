//! Crate-wide error type and the I/O triage used by `session` and `server`
//! to decide which failures are expected mid-stream noise and which are
//! worth a log line.

use std::io;

/// Errors that can surface out of the proxy's core components.
///
/// Ban/auth/origin-unreachable outcomes aren't modeled as variants here:
/// `session` handles those by writing the appropriate bytes directly and
/// returning `Ok`, so there's nothing for a caller to match on. Only
/// [`Error::Unexpected`] is meant to be logged with detail; the rest close
/// the session silently.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("client sent a malformed request: {0}")]
    ClientMalformed(String),

    #[error("unexpected error: {0}")]
    Unexpected(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Unexpected(msg.to_string())
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Unexpected(msg)
    }
}

/// Outcome of classifying an I/O error for the purposes of §7's error
/// triage. `server` and `session` both funnel through this instead of
/// matching `ErrorKind` ad hoc so the rules stay in one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorTriage {
    /// Expected mid-stream termination (reset, broken pipe, incomplete
    /// read, timeout). Close quietly, no log.
    PeerClosed,
    /// A known OS errno that should simply be swallowed.
    Ignore,
    /// A known OS errno whose transport should be aborted rather than
    /// drained gracefully.
    ForceClose,
    /// Nothing matched; log with detail before closing.
    Unexpected,
}

// Errno values the source's `loop_exception_handler` special-cased.
// Windows-only codes (WSAENOTSOCK, ERROR_SEM_TIMEOUT) are kept even though
// this crate mostly runs on Unix, since the set is a cross-platform
// allowlist and a misclassification here only costs a missing log line.
const IGNORE_ERRNO: &[i32] = &[10038, 121];
/// `EHOSTUNREACH` ("No route to host").
const FORCE_CLOSE_ERRNO: &[i32] = &[113];

/// Classify an I/O error the way §4.5/§7 describe: peer resets and broken
/// pipes are expected noise, a short allowlist of OS errnos is swallowed or
/// forces the transport closed, and everything else is unexpected.
pub fn classify_io_error(err: &io::Error) -> ErrorTriage {
    use io::ErrorKind::*;

    if matches!(
        err.kind(),
        ConnectionReset | BrokenPipe | ConnectionAborted | NotConnected | UnexpectedEof | TimedOut
    ) {
        return ErrorTriage::PeerClosed;
    }

    if let Some(errno) = err.raw_os_error() {
        if IGNORE_ERRNO.contains(&errno) {
            return ErrorTriage::Ignore;
        }
        if FORCE_CLOSE_ERRNO.contains(&errno) {
            return ErrorTriage::ForceClose;
        }
    }

    ErrorTriage::Unexpected
}
