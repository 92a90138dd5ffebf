//! Retry policy
//!
//! Every physical attempt that fails is reduced to a [`Failure`] by the I/O
//! layer that observed it. Whether the transport tries again is then a pure
//! function of the policy, the failure class and whether the connection had
//! been reused, see [`RetryPolicy::should_retry`].

use std::io;

use crate::error::{BoxError, TimedOut};

/// How many times, and after which failures, a request is retried.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub(crate) max_tries: u32,
    pub(crate) retry_after_timeout: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_tries: crate::options::DEFAULT_MAX_TRIES,
            retry_after_timeout: true,
        }
    }
}

impl RetryPolicy {
    /// Create a policy allowing `max_tries` attempts.
    pub fn new(max_tries: u32, retry_after_timeout: bool) -> RetryPolicy {
        RetryPolicy {
            max_tries,
            retry_after_timeout,
        }
    }

    /// Maximum attempts per logical request; `0` means a single attempt.
    pub fn max_tries(&self) -> u32 {
        self.max_tries
    }

    /// Whether probably-safe failures are retried at all.
    pub fn retry_after_timeout(&self) -> bool {
        self.retry_after_timeout
    }

    /// The number of physical attempts a logical request may make.
    pub(crate) fn attempts_allowed(&self) -> u32 {
        self.max_tries.max(1)
    }

    /// Decide whether attempt number `attempts` (1-based) may be followed by
    /// another one.
    pub(crate) fn should_retry(&self, failure: Failure, reused: bool, attempts: u32) -> bool {
        attempts < self.attempts_allowed() && self.is_retryable(failure, reused)
    }

    /// The classification alone, ignoring the attempt budget.
    pub(crate) fn is_retryable(&self, failure: Failure, reused: bool) -> bool {
        if !self.retry_after_timeout {
            return false;
        }

        match failure {
            Failure::Timeout | Failure::Canceled | Failure::Connect => true,
            // Only an idle connection that the peer dropped while we were
            // not looking is known not to have processed the request.
            Failure::Reset => reused,
            Failure::Malformed | Failure::Other => false,
        }
    }
}

/// The class of a failed attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Failure {
    /// A dial, pool wait, header wait or per-request clock fired.
    Timeout,
    /// The peer reset or closed the connection.
    Reset,
    /// The transport abandoned the request before it was sent.
    Canceled,
    /// The upstream could not be reached.
    Connect,
    /// The response could not be parsed.
    Malformed,
    /// Anything else, never retried.
    Other,
}

impl Failure {
    /// Classify an error produced by the HTTP/1.1 connection.
    pub(crate) fn from_hyper(err: &hyper::Error) -> Failure {
        if err.is_timeout() {
            Failure::Timeout
        } else if err.is_parse() {
            Failure::Malformed
        } else if err.is_canceled() {
            Failure::Canceled
        } else if err.is_incomplete_message() || err.is_closed() {
            Failure::Reset
        } else {
            Failure::from_source(err)
        }
    }

    /// Classify an I/O error surfaced by a socket.
    pub(crate) fn from_io(err: &io::Error) -> Failure {
        match err.kind() {
            io::ErrorKind::TimedOut => Failure::Timeout,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => Failure::Reset,
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::NotConnected
            | io::ErrorKind::AddrNotAvailable => Failure::Connect,
            io::ErrorKind::InvalidData => Failure::Malformed,
            _ => Failure::Other,
        }
    }

    fn from_source(err: &(dyn std::error::Error + 'static)) -> Failure {
        let mut source = err.source();
        while let Some(err) = source {
            if err.is::<TimedOut>() {
                return Failure::Timeout;
            }
            if let Some(io) = err.downcast_ref::<io::Error>() {
                return Failure::from_io(io);
            }
            source = err.source();
        }
        Failure::Other
    }

    pub(crate) fn from_boxed(err: &BoxError) -> Failure {
        if err.is::<TimedOut>() {
            return Failure::Timeout;
        }
        if let Some(io) = err.downcast_ref::<io::Error>() {
            return Failure::from_io(io);
        }
        Failure::from_source(&**err)
    }
}

/// An error together with the class the I/O layer assigned to it.
#[derive(Debug)]
pub(crate) struct Classified {
    pub(crate) failure: Failure,
    pub(crate) error: crate::Error,
}

impl Classified {
    pub(crate) fn new(failure: Failure, error: crate::Error) -> Classified {
        Classified { failure, error }
    }
}
