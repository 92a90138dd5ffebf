use std::{
    error::Error as StdError,
    fmt, io,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use futures_util::future::Either;
use http::uri::Authority;
use log::{debug, trace, warn};
use socket2::{SockRef, TcpKeepalive};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};

use crate::error::{BoxError, TimedOut};
use crate::options::DialConfig;
use crate::retry::Failure;
#[cfg(feature = "__rustls")]
use crate::tls::TlsConnector;

/// Everything the dialer needs to open a connection to the upstream.
///
/// Built once with the client and never mutated afterwards.
#[derive(Clone, Debug)]
pub(crate) struct DialSpec {
    pub(crate) timeout: Option<Duration>,
    pub(crate) deadline: Option<Instant>,
    pub(crate) keep_alive: Option<Duration>,
    pub(crate) dual_stack: bool,
    pub(crate) fallback_delay: Duration,
    pub(crate) host: String,
    pub(crate) port: u16,
}

impl DialSpec {
    pub(crate) fn new(config: &DialConfig, address: &str, port: u16) -> crate::Result<DialSpec> {
        if address.is_empty() {
            return Err(crate::Error::builder("empty upstream address"));
        }

        // Validates the pair the same way an URL authority would be.
        let authority = if address.contains(':') && !address.starts_with('[') {
            format!("[{address}]:{port}")
        } else {
            format!("{address}:{port}")
        };
        let authority = Authority::try_from(authority.as_str()).map_err(crate::Error::builder)?;

        Ok(DialSpec {
            timeout: config.timeout,
            deadline: config.deadline,
            keep_alive: config.keep_alive,
            dual_stack: config.dual_stack,
            fallback_delay: config.fallback_delay,
            host: authority.host().to_owned(),
            port,
        })
    }

    /// The host without IPv6 brackets, as handed to the resolver.
    fn bare_host(&self) -> &str {
        self.host.trim_start_matches('[').trim_end_matches(']')
    }

    /// The tighter of `timeout` and the time left until `deadline`.
    ///
    /// `Some(Duration::ZERO)` means the deadline already passed.
    pub(crate) fn budget(&self, now: Instant) -> Option<Duration> {
        let left = self
            .deadline
            .map(|deadline| deadline.saturating_duration_since(now));

        match (self.timeout, left) {
            (Some(timeout), Some(left)) => Some(timeout.min(left)),
            (Some(timeout), None) => Some(timeout),
            (None, left) => left,
        }
    }
}

/// Opens raw, optionally TLS wrapped, connections to the upstream.
#[derive(Clone, Debug)]
pub(crate) struct Dialer {
    spec: DialSpec,
    #[cfg(feature = "__rustls")]
    tls: Option<TlsConnector>,
}

impl Dialer {
    pub(crate) fn new(spec: DialSpec) -> Dialer {
        Dialer {
            spec,
            #[cfg(feature = "__rustls")]
            tls: None,
        }
    }

    #[cfg(feature = "__rustls")]
    pub(crate) fn with_tls(mut self, tls: TlsConnector) -> Dialer {
        self.tls = Some(tls);
        self
    }

    pub(crate) fn spec(&self) -> &DialSpec {
        &self.spec
    }

    /// Dial the upstream once. Retrying is the transport's business.
    pub(crate) async fn dial(&self) -> Result<MaybeHttpsStream, ConnectError> {
        let fut = self.dial_inner();
        match self.spec.budget(Instant::now()) {
            Some(budget) if budget.is_zero() => {
                Err(ConnectError::new("dial deadline exceeded", TimedOut))
            }
            Some(budget) => match tokio::time::timeout(budget, fut).await {
                Ok(res) => res,
                Err(_elapsed) => Err(ConnectError::new("dial timed out", TimedOut)),
            },
            None => fut.await,
        }
    }

    async fn dial_inner(&self) -> Result<MaybeHttpsStream, ConnectError> {
        let addrs = tokio::net::lookup_host((self.spec.bare_host(), self.spec.port))
            .await
            .map_err(ConnectError::dns)?
            .collect::<Vec<_>>();

        let tcp = ConnectingTcp::new(addrs, &self.spec).connect().await?;

        if let Err(_e) = tcp.set_nodelay(true) {
            warn!("tcp set_nodelay error: {_e}");
        }

        if let Some(period) = self.spec.keep_alive.filter(|p| !p.is_zero()) {
            let keepalive = TcpKeepalive::new().with_time(period);
            if let Err(_e) = SockRef::from(&tcp).set_tcp_keepalive(&keepalive) {
                warn!("tcp set_keepalive error: {_e}");
            }
        }

        #[cfg(feature = "__rustls")]
        if let Some(tls) = &self.tls {
            trace!("starting tls handshake with {}", self.spec.host);
            let stream = tls.connect(tcp).await.map_err(ConnectError::tls)?;
            return Ok(MaybeHttpsStream::Https(Box::new(stream)));
        }

        Ok(MaybeHttpsStream::Http(tcp))
    }
}

/// Splits resolved addresses into the family of the first one and the rest.
fn split_by_preference(addrs: Vec<SocketAddr>) -> (Vec<SocketAddr>, Vec<SocketAddr>) {
    let preferring_v6 = addrs.first().map(SocketAddr::is_ipv6).unwrap_or(false);
    addrs
        .into_iter()
        .partition::<Vec<_>, _>(|addr| addr.is_ipv6() == preferring_v6)
}

struct ConnectingTcp {
    preferred: Vec<SocketAddr>,
    fallback: Option<(Duration, Vec<SocketAddr>)>,
}

impl ConnectingTcp {
    fn new(addrs: Vec<SocketAddr>, spec: &DialSpec) -> ConnectingTcp {
        if !spec.dual_stack {
            return ConnectingTcp {
                preferred: addrs,
                fallback: None,
            };
        }

        let (preferred, fallback) = split_by_preference(addrs);
        if fallback.is_empty() {
            ConnectingTcp {
                preferred,
                fallback: None,
            }
        } else {
            ConnectingTcp {
                preferred,
                fallback: Some((spec.fallback_delay, fallback)),
            }
        }
    }

    async fn connect(self) -> Result<TcpStream, ConnectError> {
        match self.fallback {
            None => connect_serial(&self.preferred).await,
            Some((delay, fallback)) => {
                let preferred_fut = connect_serial(&self.preferred);
                futures_util::pin_mut!(preferred_fut);

                let fallback_fut = async {
                    tokio::time::sleep(delay).await;
                    trace!("starting fallback connect after {:?}", delay);
                    connect_serial(&fallback).await
                };
                futures_util::pin_mut!(fallback_fut);

                // The loser is dropped, which closes any half-open socket.
                let (result, other) =
                    match futures_util::future::select(preferred_fut, fallback_fut).await {
                        Either::Left((result, fallback_fut)) => (result, Either::Left(fallback_fut)),
                        Either::Right((result, preferred_fut)) => {
                            (result, Either::Right(preferred_fut))
                        }
                    };

                if result.is_err() {
                    other.await
                } else {
                    result
                }
            }
        }
    }
}

async fn connect_serial(addrs: &[SocketAddr]) -> Result<TcpStream, ConnectError> {
    let mut err = None;
    for addr in addrs {
        debug!("connecting to {}", addr);
        match TcpStream::connect(addr).await {
            Ok(tcp) => {
                debug!("connected to {}", addr);
                return Ok(tcp);
            }
            Err(e) => {
                // Only return the first error; assume it's the most relevant.
                if err.is_none() {
                    let mut e = ConnectError::new("tcp connect error", e);
                    e.addr = Some(*addr);
                    err = Some(e);
                }
            }
        }
    }

    match err {
        Some(e) => Err(e),
        None => Err(ConnectError::new(
            "tcp connect error",
            io::Error::new(io::ErrorKind::NotConnected, "no addresses to connect to"),
        )),
    }
}

/// A connection produced by the dialer.
pub(crate) enum MaybeHttpsStream {
    /// A raw HTTP stream.
    Http(TcpStream),
    /// A TLS-wrapped HTTP stream.
    #[cfg(feature = "__rustls")]
    Https(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl fmt::Debug for MaybeHttpsStream {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            MaybeHttpsStream::Http(..) => f.pad("Http(..)"),
            #[cfg(feature = "__rustls")]
            MaybeHttpsStream::Https(..) => f.pad("Https(..)"),
        }
    }
}

impl AsyncRead for MaybeHttpsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeHttpsStream::Http(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(feature = "__rustls")]
            MaybeHttpsStream::Https(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeHttpsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeHttpsStream::Http(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(feature = "__rustls")]
            MaybeHttpsStream::Https(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeHttpsStream::Http(s) => Pin::new(s).poll_flush(cx),
            #[cfg(feature = "__rustls")]
            MaybeHttpsStream::Https(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeHttpsStream::Http(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(feature = "__rustls")]
            MaybeHttpsStream::Https(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

// Not publicly exported (so missing_docs doesn't trigger).
pub(crate) struct ConnectError {
    msg: &'static str,
    addr: Option<SocketAddr>,
    tls: bool,
    cause: Option<BoxError>,
}

impl ConnectError {
    pub(crate) fn new<E>(msg: &'static str, cause: E) -> ConnectError
    where
        E: Into<BoxError>,
    {
        ConnectError {
            msg,
            addr: None,
            tls: false,
            cause: Some(cause.into()),
        }
    }

    fn dns<E>(cause: E) -> ConnectError
    where
        E: Into<BoxError>,
    {
        ConnectError::new("dns error", cause)
    }

    #[cfg(feature = "__rustls")]
    fn tls<E>(cause: E) -> ConnectError
    where
        E: Into<BoxError>,
    {
        let mut err = ConnectError::new("tls handshake error", cause);
        err.tls = true;
        err
    }

    /// The retry class of this failure.
    ///
    /// Handshake failures are deterministic and never worth repeating.
    pub(crate) fn failure(&self) -> Failure {
        if self.tls {
            return match self.cause.as_ref() {
                Some(cause) if Failure::from_boxed(cause) == Failure::Timeout => Failure::Timeout,
                _ => Failure::Other,
            };
        }

        match self.cause.as_ref().map(Failure::from_boxed) {
            Some(Failure::Timeout) => Failure::Timeout,
            _ => Failure::Connect,
        }
    }
}

impl fmt::Debug for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut b = f.debug_tuple("ConnectError");
        b.field(&self.msg);
        if let Some(ref addr) = self.addr {
            b.field(addr);
        }
        if let Some(ref cause) = self.cause {
            b.field(cause);
        }
        b.finish()
    }
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.msg)?;
        if let Some(ref addr) = self.addr {
            write!(f, " ({addr})")?;
        }
        if let Some(ref cause) = self.cause {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

impl StdError for ConnectError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause.as_ref().map(|e| &**e as _)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(timeout: Option<Duration>, deadline: Option<Instant>) -> DialSpec {
        DialSpec {
            timeout,
            deadline,
            keep_alive: None,
            dual_stack: false,
            fallback_delay: Duration::from_millis(300),
            host: "127.0.0.1".into(),
            port: 1,
        }
    }

    #[test]
    fn tighter_clock_wins() {
        let now = Instant::now();
        let s = spec(Some(Duration::from_secs(5)), Some(now + Duration::from_secs(1)));
        assert_eq!(s.budget(now), Some(Duration::from_secs(1)));

        let s = spec(Some(Duration::from_secs(1)), Some(now + Duration::from_secs(5)));
        assert_eq!(s.budget(now), Some(Duration::from_secs(1)));

        let s = spec(None, Some(now + Duration::from_secs(2)));
        assert_eq!(s.budget(now), Some(Duration::from_secs(2)));

        assert_eq!(spec(None, None).budget(now), None);
    }

    #[test]
    fn passed_deadline_leaves_no_budget() {
        let now = Instant::now();
        let s = spec(Some(Duration::from_secs(5)), Some(now));
        assert_eq!(s.budget(now + Duration::from_secs(1)), Some(Duration::ZERO));
    }

    #[test]
    fn invalid_addresses_are_rejected() {
        let config = crate::Options::new().dial;
        assert!(DialSpec::new(&config, "", 80).is_err());
        assert!(DialSpec::new(&config, "bad host", 80).is_err());

        let v6 = DialSpec::new(&config, "::1", 8080).unwrap();
        assert_eq!(v6.bare_host(), "::1");
        let name = DialSpec::new(&config, "example.com", 443).unwrap();
        assert_eq!(name.host, "example.com");
    }

    #[test]
    fn split_keeps_first_family_preferred() {
        let v6: SocketAddr = "[::1]:80".parse().unwrap();
        let v4: SocketAddr = "127.0.0.1:80".parse().unwrap();
        let v4b: SocketAddr = "127.0.0.2:80".parse().unwrap();

        let (preferred, fallback) = split_by_preference(vec![v4, v6, v4b]);
        assert_eq!(preferred, vec![v4, v4b]);
        assert_eq!(fallback, vec![v6]);
    }

    #[test]
    fn connect_error_classes() {
        let refused = ConnectError::new(
            "tcp connect error",
            io::Error::from(io::ErrorKind::ConnectionRefused),
        );
        assert_eq!(refused.failure(), Failure::Connect);

        let timed_out = ConnectError::new("dial timed out", TimedOut);
        assert_eq!(timed_out.failure(), Failure::Timeout);

        let mut handshake = ConnectError::new("tls handshake error", "bad certificate");
        handshake.tls = true;
        assert_eq!(handshake.failure(), Failure::Other);
    }

    #[tokio::test]
    async fn refused_dial_is_a_connect_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut s = spec(Some(Duration::from_secs(2)), None);
        s.port = port;
        let err = Dialer::new(s).dial().await.unwrap_err();
        assert_eq!(err.failure(), Failure::Connect);
    }

    #[tokio::test]
    async fn expired_deadline_fails_fast() {
        let s = spec(Some(Duration::from_secs(5)), Some(Instant::now()));
        let err = Dialer::new(s).dial().await.unwrap_err();
        assert_eq!(err.failure(), Failure::Timeout);
    }

    #[tokio::test]
    async fn dual_stack_falls_back_to_reachable_family() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Nothing listens on the v6 loopback, so the preferred family fails.
        let unreachable: SocketAddr = SocketAddr::new("::1".parse().unwrap(), addr.port());
        let addrs = vec![unreachable, addr];

        let mut s = spec(None, None);
        s.dual_stack = true;
        s.fallback_delay = Duration::from_millis(10);

        let tcp = ConnectingTcp::new(addrs, &s).connect().await.unwrap();
        assert_eq!(tcp.peer_addr().unwrap(), addr);
    }
}
