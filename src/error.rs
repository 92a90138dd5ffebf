use std::{error::Error as StdError, fmt, io};

use crate::Url;

/// A `Result` alias where the `Err` case is `rehttp::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// A boxed error type that can be used for dynamic error handling.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// The Errors that may occur when processing a `Request`.
///
/// Note: Errors may include the full URL used to make the `Request`. If the URL
/// contains sensitive information (e.g. an API key as a query parameter), be
/// sure to remove it ([`without_url`](Error::without_url))
pub struct Error {
    inner: Box<Inner>,
}

struct Inner {
    kind: Kind,
    source: Option<BoxError>,
    url: Option<Url>,
}

impl Error {
    pub(crate) fn new<E>(kind: Kind, source: Option<E>) -> Error
    where
        E: Into<BoxError>,
    {
        Error {
            inner: Box::new(Inner {
                kind,
                source: source.map(Into::into),
                url: None,
            }),
        }
    }

    pub(crate) fn builder<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Builder, Some(e))
    }

    pub(crate) fn dial<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Dial, Some(e))
    }

    pub(crate) fn pool_exhausted<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::PoolExhausted, Some(e))
    }

    pub(crate) fn retry_exhausted(attempts: u32, last: Error) -> Error {
        Error::new(Kind::RetryBudgetExceeded { attempts }, Some(last))
    }

    pub(crate) fn client_timeout() -> Error {
        Error::new(Kind::ClientTimeout, Some(TimedOut))
    }

    pub(crate) fn protocol<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Protocol, Some(e))
    }

    pub(crate) fn request<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Request, Some(e))
    }

    pub(crate) fn body<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Body, Some(e))
    }

    pub(crate) fn decode<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Decode, Some(e))
    }

    pub(crate) fn redirect<E: Into<BoxError>>(e: E, url: Url) -> Error {
        Error::new(Kind::Redirect, Some(e)).with_url(url)
    }

    pub(crate) fn url_bad_scheme(url: Url) -> Error {
        Error::new(Kind::Builder, Some(BadScheme)).with_url(url)
    }
}

impl Error {
    /// Returns a possible URL related to this error.
    pub fn url(&self) -> Option<&Url> {
        self.inner.url.as_ref()
    }

    /// Returns a mutable reference to the URL related to this error
    ///
    /// This is useful if you need to remove sensitive information from the URL
    /// (e.g. an API key in the query), but do not want to remove the URL
    /// entirely.
    pub fn url_mut(&mut self) -> Option<&mut Url> {
        self.inner.url.as_mut()
    }

    /// Add a url related to this error (overwriting any existing)
    pub fn with_url(mut self, url: Url) -> Self {
        self.inner.url = Some(url);
        self
    }

    /// Strip the related url from this error (if, for example, it contains
    /// sensitive information)
    pub fn without_url(mut self) -> Self {
        self.inner.url = None;
        self
    }

    /// Returns true if the error is from a type Builder.
    pub fn is_builder(&self) -> bool {
        matches!(self.inner.kind, Kind::Builder)
    }

    /// Returns true if the error was raised while establishing a connection,
    /// either directly or as the last cause of an exhausted retry budget.
    pub fn is_dial(&self) -> bool {
        self.any_kind(|kind| matches!(kind, Kind::Dial))
    }

    /// Returns true if no pooled connection became available in time.
    pub fn is_pool_exhausted(&self) -> bool {
        self.any_kind(|kind| matches!(kind, Kind::PoolExhausted))
    }

    /// Returns true if the transport gave up on the request.
    ///
    /// Use [`attempts`](Error::attempts) to learn how many physical attempts
    /// were made, and [`source`](StdError::source) for the last cause.
    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self.inner.kind, Kind::RetryBudgetExceeded { .. })
    }

    /// Returns the number of attempts made before the transport gave up.
    pub fn attempts(&self) -> Option<u32> {
        match self.inner.kind {
            Kind::RetryBudgetExceeded { attempts } => Some(attempts),
            _ => None,
        }
    }

    /// Returns true if the whole-client deadline fired.
    pub fn is_client_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::ClientTimeout)
    }

    /// Returns true if the peer produced a malformed exchange.
    pub fn is_protocol(&self) -> bool {
        self.any_kind(|kind| matches!(kind, Kind::Protocol))
    }

    /// Returns true if the error is related to a timeout.
    pub fn is_timeout(&self) -> bool {
        if self.is_client_timeout() {
            return true;
        }

        let mut source = self.source();

        while let Some(err) = source {
            if err.is::<TimedOut>() {
                return true;
            }
            if let Some(hyper_err) = err.downcast_ref::<hyper::Error>() {
                if hyper_err.is_timeout() {
                    return true;
                }
            }
            if let Some(io) = err.downcast_ref::<io::Error>() {
                if io.kind() == io::ErrorKind::TimedOut {
                    return true;
                }
            }
            source = err.source();
        }

        false
    }

    /// Returns true if the error is related to a connection reset.
    pub fn is_connection_reset(&self) -> bool {
        let mut source = self.source();

        while let Some(err) = source {
            if let Some(io) = err.downcast_ref::<io::Error>() {
                if io.kind() == io::ErrorKind::ConnectionReset {
                    return true;
                }
            }
            source = err.source();
        }

        false
    }

    /// Returns true if the error is related to the request
    pub fn is_request(&self) -> bool {
        self.any_kind(|kind| matches!(kind, Kind::Request))
    }

    /// Returns true if the error is related to the request or response body
    pub fn is_body(&self) -> bool {
        matches!(self.inner.kind, Kind::Body)
    }

    /// Returns true if the error is related to decoding the response's body
    pub fn is_decode(&self) -> bool {
        matches!(self.inner.kind, Kind::Decode)
    }

    /// Returns true if the error is from a redirect policy.
    pub fn is_redirect(&self) -> bool {
        matches!(self.inner.kind, Kind::Redirect)
    }

    // Checks this error and every `rehttp::Error` further down the chain.
    fn any_kind(&self, f: impl Fn(&Kind) -> bool) -> bool {
        if f(&self.inner.kind) {
            return true;
        }

        let mut source = self.source();

        while let Some(err) = source {
            if let Some(err) = err.downcast_ref::<Error>() {
                if f(&err.inner.kind) {
                    return true;
                }
            }
            source = err.source();
        }

        false
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct("rehttp::Error");

        builder.field("kind", &self.inner.kind);

        if let Some(ref url) = self.inner.url {
            builder.field("url", &url.as_str());
        }

        if let Some(ref source) = self.inner.source {
            builder.field("source", source);
        }

        builder.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.inner.kind {
            Kind::Builder => f.write_str("builder error")?,
            Kind::Dial => f.write_str("error dialing upstream")?,
            Kind::PoolExhausted => f.write_str("no pooled connection available")?,
            Kind::RetryBudgetExceeded { attempts } => {
                write!(f, "request failed after {attempts} attempt(s)")?
            }
            Kind::ClientTimeout => f.write_str("client timeout")?,
            Kind::Protocol => f.write_str("protocol error")?,
            Kind::Request => f.write_str("error sending request")?,
            Kind::Body => f.write_str("request or response body error")?,
            Kind::Decode => f.write_str("error decoding response body")?,
            Kind::Redirect => f.write_str("error following redirect")?,
        };

        if let Some(url) = &self.inner.url {
            write!(f, " for url ({})", url.as_str())?;
        }

        if let Some(e) = &self.inner.source {
            write!(f, ": {e}")?;
        }

        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.source.as_ref().map(|e| &**e as _)
    }
}

#[derive(Debug)]
pub(crate) enum Kind {
    Builder,
    Dial,
    PoolExhausted,
    RetryBudgetExceeded { attempts: u32 },
    ClientTimeout,
    Protocol,
    Request,
    Body,
    Decode,
    Redirect,
}

#[derive(Debug)]
pub(crate) struct TimedOut;

impl fmt::Display for TimedOut {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("operation timed out")
    }
}

impl StdError for TimedOut {}

#[derive(Debug)]
pub(crate) struct BadScheme;

impl fmt::Display for BadScheme {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("URL scheme is not allowed")
    }
}

impl StdError for BadScheme {}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn test_source_chain() {
        let root = Error::new(Kind::Request, None::<Error>);
        assert!(root.source().is_none());

        let link = Error::body(root);
        assert!(link.source().is_some());
        assert_send::<Error>();
        assert_sync::<Error>();
    }

    #[test]
    fn mem_size_of() {
        use std::mem::size_of;
        assert_eq!(size_of::<Error>(), size_of::<usize>());
    }

    #[test]
    fn is_timeout() {
        let err = Error::request(super::TimedOut);
        assert!(err.is_timeout());

        let io = io::Error::from(io::ErrorKind::TimedOut);
        let nested = Error::request(io);
        assert!(nested.is_timeout());

        assert!(Error::client_timeout().is_timeout());
    }

    #[test]
    fn retry_exhausted_exposes_last_cause() {
        let last = Error::dial(io::Error::from(io::ErrorKind::TimedOut));
        let err = Error::retry_exhausted(3, last);

        assert!(err.is_retry_exhausted());
        assert_eq!(err.attempts(), Some(3));
        assert!(err.is_dial());
        assert!(err.is_timeout());
        assert!(!err.is_protocol());
        assert_eq!(
            err.to_string(),
            "request failed after 3 attempt(s): error dialing upstream: timed out"
        );
    }

    #[test]
    fn is_connection_reset() {
        let err = Error::request(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "connection reset",
        ));
        assert!(err.is_connection_reset());

        let nested = Error::retry_exhausted(1, err);
        assert!(nested.is_connection_reset());
        assert!(nested.is_request());
    }
}
