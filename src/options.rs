//! Client configuration.
//!
//! [`Options`] is the single snapshot every component reads from. It is
//! cloned into the [`Client`](crate::Client) at construction and never
//! mutated afterwards, so one `Options` value can seed many clients.

use std::fmt;
use std::time::{Duration, Instant};

use http::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, USER_AGENT};
use log::warn;

use crate::redirect;
use crate::retry::RetryPolicy;
#[cfg(feature = "__rustls")]
use crate::tls::Certificate;

/// Default `User-Agent` attached to every request.
pub const DEFAULT_USER_AGENT: &str = concat!("rehttp/", env!("CARGO_PKG_VERSION"));

/// Default connect timeout.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(30);
/// Default TCP keep-alive period.
pub const DEFAULT_DIAL_KEEP_ALIVE: Duration = Duration::from_secs(30);
/// Default delay before racing the secondary address family.
pub const DEFAULT_DIAL_FALLBACK_DELAY: Duration = Duration::from_millis(300);
/// Default number of attempts per logical request.
pub const DEFAULT_MAX_TRIES: u32 = 3;
/// Default idle connections kept for the upstream.
pub const DEFAULT_MAX_IDLE_CONNS_PER_HOST: usize = 2;
/// Default whole-client timeout.
pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(60);
/// Default number of connections dialed at construction.
pub const DEFAULT_POOL_INITIAL: usize = 2;
/// Default upper bound of live connections.
pub const DEFAULT_POOL_MAX: usize = 5;

/// Connection establishment settings, consumed by the dialer.
#[derive(Clone, Debug)]
pub(crate) struct DialConfig {
    pub(crate) timeout: Option<Duration>,
    pub(crate) deadline: Option<Instant>,
    pub(crate) keep_alive: Option<Duration>,
    pub(crate) dual_stack: bool,
    pub(crate) fallback_delay: Duration,
}

/// The independent clocks of a request.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Timeouts {
    pub(crate) per_request: Option<Duration>,
    pub(crate) response_header: Option<Duration>,
    pub(crate) pool_acquire: Option<Duration>,
    pub(crate) client: Option<Duration>,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct TlsOptions {
    pub(crate) enabled: bool,
    pub(crate) insecure_skip_verify: bool,
    pub(crate) server_name: Option<String>,
    #[cfg(feature = "__rustls")]
    pub(crate) root_certs: Vec<Certificate>,
}

/// Configuration for a [`Client`](crate::Client).
///
/// Every tunable is independently settable; anything left alone keeps the
/// default documented on its setter.
///
/// ```
/// use std::time::Duration;
///
/// let options = rehttp::Options::new()
///     .max_tries(5)
///     .response_header_timeout(Duration::from_secs(2))
///     .pool_max_size(8)
///     .user_agent("my-service/1.0");
/// ```
#[must_use]
#[derive(Clone)]
pub struct Options {
    pub(crate) dial: DialConfig,
    pub(crate) retry: RetryPolicy,
    pub(crate) timeouts: Timeouts,
    pub(crate) disable_keep_alives: bool,
    pub(crate) disable_compression: bool,
    pub(crate) max_idle_conns_per_host: usize,
    pub(crate) pool_initial: usize,
    pub(crate) pool_max: usize,
    pub(crate) tls: TlsOptions,
    pub(crate) redirect: redirect::Policy,
    pub(crate) headers: HeaderMap,
}

impl Default for Options {
    fn default() -> Self {
        Self::new()
    }
}

impl Options {
    /// Options initialized with default values.
    pub fn new() -> Options {
        let mut headers = HeaderMap::with_capacity(2);
        headers.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));
        headers.insert(CONNECTION, HeaderValue::from_static("Keep-Alive"));

        Options {
            dial: DialConfig {
                timeout: Some(DEFAULT_DIAL_TIMEOUT),
                deadline: Some(Instant::now() + DEFAULT_DIAL_TIMEOUT),
                keep_alive: Some(DEFAULT_DIAL_KEEP_ALIVE),
                dual_stack: false,
                fallback_delay: DEFAULT_DIAL_FALLBACK_DELAY,
            },
            retry: RetryPolicy::default(),
            timeouts: Timeouts {
                client: Some(DEFAULT_CLIENT_TIMEOUT),
                ..Timeouts::default()
            },
            disable_keep_alives: false,
            disable_compression: false,
            max_idle_conns_per_host: DEFAULT_MAX_IDLE_CONNS_PER_HOST,
            pool_initial: DEFAULT_POOL_INITIAL,
            pool_max: DEFAULT_POOL_MAX,
            tls: TlsOptions::default(),
            redirect: redirect::Policy::default(),
            headers,
        }
    }

    // Dialer options

    /// Maximum time a dial waits for a connect (and TLS handshake) to complete.
    ///
    /// Default is 30 seconds. `None` or a zero duration leaves it to the
    /// operating system.
    pub fn dial_timeout<D>(mut self, timeout: D) -> Options
    where
        D: Into<Option<Duration>>,
    {
        self.dial.timeout = non_zero(timeout.into());
        self
    }

    /// Absolute point in time after which dials fail.
    ///
    /// When both a timeout and a deadline are set, the tighter one wins.
    /// Default is 30 seconds after the `Options` were created.
    pub fn dial_deadline<I>(mut self, deadline: I) -> Options
    where
        I: Into<Option<Instant>>,
    {
        self.dial.deadline = deadline.into();
        self
    }

    /// Keep-alive period for established TCP connections.
    ///
    /// Default is 30 seconds. `None` disables TCP keep-alive probes.
    pub fn dial_keep_alive<D>(mut self, period: D) -> Options
    where
        D: Into<Option<Duration>>,
    {
        self.dial.keep_alive = period.into();
        self
    }

    /// Race IPv4 and IPv6 connects when the upstream resolves to both.
    ///
    /// Default is `false`.
    pub fn dial_dual_stack(mut self, enabled: bool) -> Options {
        self.dial.dual_stack = enabled;
        self
    }

    /// How long the preferred address family gets a head start when dual
    /// stack dialing is enabled.
    ///
    /// A zero duration selects the default of 300 milliseconds.
    pub fn dial_fallback_delay(mut self, delay: Duration) -> Options {
        self.dial.fallback_delay = if delay.is_zero() {
            DEFAULT_DIAL_FALLBACK_DELAY
        } else {
            delay
        };
        self
    }

    // Transport options

    /// Maximum number of attempts per logical request.
    ///
    /// `0` disables retries (exactly one attempt). Default is 3.
    pub fn max_tries(mut self, tries: u32) -> Options {
        self.retry.max_tries = tries;
        self
    }

    /// Retry failures that are probably, but not certainly, safe to retry:
    /// timeouts, cancellations originating in the transport, connect
    /// failures and resets of reused idle connections.
    ///
    /// Default is `true`.
    pub fn retry_after_timeout(mut self, enabled: bool) -> Options {
        self.retry.retry_after_timeout = enabled;
        self
    }

    /// Prevent re-use of connections between requests.
    ///
    /// Default is `false`.
    pub fn disable_keep_alives(mut self, disabled: bool) -> Options {
        self.disable_keep_alives = disabled;
        let value = if disabled { "close" } else { "Keep-Alive" };
        self.headers.insert(CONNECTION, HeaderValue::from_static(value));
        self
    }

    /// Stop requesting gzip compression from the upstream.
    ///
    /// Default is `false`.
    pub fn disable_compression(mut self, disabled: bool) -> Options {
        self.disable_compression = disabled;
        self
    }

    /// Maximum number of idle connections kept around for reuse.
    ///
    /// `0` selects the default of 2.
    pub fn max_idle_conns_per_host(mut self, max: usize) -> Options {
        self.max_idle_conns_per_host = if max == 0 {
            DEFAULT_MAX_IDLE_CONNS_PER_HOST
        } else {
            max
        };
        self
    }

    /// Time budget of a single attempt, from connection checkout until the
    /// response body has been read.
    ///
    /// Default is no timeout. A zero duration also means no timeout.
    pub fn per_request_timeout<D>(mut self, timeout: D) -> Options
    where
        D: Into<Option<Duration>>,
    {
        self.timeouts.per_request = non_zero(timeout.into());
        self
    }

    /// Time to wait for the response headers once the request has been
    /// handed to the connection.
    ///
    /// Default is no timeout. A zero duration also means no timeout.
    pub fn response_header_timeout<D>(mut self, timeout: D) -> Options
    where
        D: Into<Option<Duration>>,
    {
        self.timeouts.response_header = non_zero(timeout.into());
        self
    }

    /// How long a request waits for a connection when the pool is full.
    ///
    /// The per-request timeout still applies. Default is no separate limit,
    /// and a zero duration means the same.
    pub fn pool_acquire_timeout<D>(mut self, timeout: D) -> Options
    where
        D: Into<Option<Duration>>,
    {
        self.timeouts.pool_acquire = non_zero(timeout.into());
        self
    }

    // Client options

    /// Deadline covering a whole `execute` call: dialing, every retry,
    /// redirects and reading the response body.
    ///
    /// Default is 60 seconds. `None` or a zero duration disables it.
    pub fn timeout<D>(mut self, timeout: D) -> Options
    where
        D: Into<Option<Duration>>,
    {
        self.timeouts.client = non_zero(timeout.into());
        self
    }

    /// Redirect policy applied by the client.
    ///
    /// Default will follow redirects up to a maximum of 10.
    pub fn redirect(mut self, policy: redirect::Policy) -> Options {
        self.redirect = policy;
        self
    }

    // Pool options

    /// Number of connections dialed when the client is created.
    ///
    /// Default is 2.
    pub fn pool_initial_size(mut self, size: usize) -> Options {
        self.pool_initial = size;
        self
    }

    /// Upper bound of live (idle and in-use) connections.
    ///
    /// `0` disables pooling: every attempt dials a fresh connection.
    /// Default is 5.
    pub fn pool_max_size(mut self, size: usize) -> Options {
        self.pool_max = size;
        self
    }

    // TLS options

    /// Wrap pooled connections in TLS.
    ///
    /// Default is `false`.
    #[cfg(feature = "__rustls")]
    #[cfg_attr(docsrs, doc(cfg(feature = "rustls-tls")))]
    pub fn tls(mut self, enabled: bool) -> Options {
        self.tls.enabled = enabled;
        self
    }

    /// Server name presented for SNI and certificate verification.
    ///
    /// Defaults to the address the client was created with.
    #[cfg(feature = "__rustls")]
    #[cfg_attr(docsrs, doc(cfg(feature = "rustls-tls")))]
    pub fn tls_server_name(mut self, name: impl Into<String>) -> Options {
        self.tls.server_name = Some(name.into());
        self
    }

    /// Add a custom root certificate.
    #[cfg(feature = "__rustls")]
    #[cfg_attr(docsrs, doc(cfg(feature = "rustls-tls")))]
    pub fn add_root_certificate(mut self, cert: Certificate) -> Options {
        self.tls.root_certs.push(cert);
        self
    }

    /// Skip verification of the server's certificate chain and host name.
    ///
    /// # Warning
    ///
    /// You should think very carefully before using this method. If
    /// invalid certificates are trusted, *any* certificate for *any* site
    /// will be trusted for use.
    ///
    /// Default is `false`.
    pub fn tls_insecure_skip_verify(mut self, skip: bool) -> Options {
        self.tls.insecure_skip_verify = skip;
        self
    }

    // Request options

    /// Set a header sent with every request unless the request sets it.
    pub fn header<K, V>(mut self, key: K, value: V) -> crate::Result<Options>
    where
        HeaderName: TryFrom<K>,
        <HeaderName as TryFrom<K>>::Error: Into<http::Error>,
        HeaderValue: TryFrom<V>,
        <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
    {
        let key = HeaderName::try_from(key)
            .map_err(|e| crate::Error::builder(Into::<http::Error>::into(e)))?;
        let value = HeaderValue::try_from(value)
            .map_err(|e| crate::Error::builder(Into::<http::Error>::into(e)))?;
        self.headers.insert(key, value);
        Ok(self)
    }

    /// Set the `User-Agent` sent with every request.
    ///
    /// Invalid header values are ignored and the previous agent is kept.
    pub fn user_agent<V>(mut self, value: V) -> Options
    where
        V: TryInto<HeaderValue>,
    {
        match value.try_into() {
            Ok(value) => {
                self.headers.insert(USER_AGENT, value);
            }
            Err(_) => warn!("ignoring invalid user agent"),
        }
        self
    }

    /// The retry policy applied by the transport.
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// The headers attached to every request.
    pub fn default_headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The configured `User-Agent`, or the crate default when unset.
    pub fn user_agent_str(&self) -> &str {
        self.headers
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .filter(|ua| !ua.is_empty())
            .unwrap_or(DEFAULT_USER_AGENT)
    }
}

fn non_zero(timeout: Option<Duration>) -> Option<Duration> {
    timeout.filter(|d| !d.is_zero())
}

struct Secs(Option<Duration>);

impl fmt::Display for Secs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(d) => write!(f, "{:.3}s", d.as_secs_f64()),
            None => f.write_str("none"),
        }
    }
}

impl fmt::Display for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let deadline = self
            .dial
            .deadline
            .map(|d| d.saturating_duration_since(Instant::now()));

        writeln!(f, "PoolInitialSize {}", self.pool_initial)?;
        writeln!(f, "PoolMaxSize {}", self.pool_max)?;
        writeln!(f, "DialTimeout {}", Secs(self.dial.timeout))?;
        writeln!(f, "DialDeadlineIn {}", Secs(deadline))?;
        writeln!(f, "DialDualStack {}", self.dial.dual_stack)?;
        writeln!(f, "DialKeepAlive {}", Secs(self.dial.keep_alive))?;
        writeln!(f, "DialFallbackDelay {}", Secs(Some(self.dial.fallback_delay)))?;
        writeln!(f, "MaxTries {}", self.retry.max_tries)?;
        writeln!(f, "RetryAfterTimeout {}", self.retry.retry_after_timeout)?;
        writeln!(f, "DisableKeepAlives {}", self.disable_keep_alives)?;
        writeln!(f, "DisableCompression {}", self.disable_compression)?;
        writeln!(f, "MaxIdleConnsPerHost {}", self.max_idle_conns_per_host)?;
        writeln!(f, "PerRequestTimeout {}", Secs(self.timeouts.per_request))?;
        writeln!(f, "ResponseHeaderTimeout {}", Secs(self.timeouts.response_header))?;
        writeln!(f, "PoolAcquireTimeout {}", Secs(self.timeouts.pool_acquire))?;
        writeln!(f, "ClientTimeout {}", Secs(self.timeouts.client))?;
        writeln!(f, "TlsEnabled {}", self.tls.enabled)?;
        writeln!(f, "TlsInsecureSkipVerify {}", self.tls.insecure_skip_verify)?;
        write!(f, "Headers {:?}", self.headers)
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("dial", &self.dial)
            .field("retry", &self.retry)
            .field("timeouts", &self.timeouts)
            .field("disable_keep_alives", &self.disable_keep_alives)
            .field("disable_compression", &self.disable_compression)
            .field("max_idle_conns_per_host", &self.max_idle_conns_per_host)
            .field("pool_initial", &self.pool_initial)
            .field("pool_max", &self.pool_max)
            .field("tls_enabled", &self.tls.enabled)
            .field("tls_insecure_skip_verify", &self.tls.insecure_skip_verify)
            .field("redirect", &self.redirect)
            .field("headers", &self.headers)
            .finish()
    }
}
