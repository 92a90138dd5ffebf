//! The retrying transport.
//!
//! One logical request becomes up to `max_tries` physical attempts. Each
//! attempt checks a connection out of the pool, writes the request and waits
//! for the response head. A failed attempt is reduced to a [`Failure`] and
//! the [`RetryPolicy`] decides whether another attempt follows.

use futures_util::future::poll_fn;
#[cfg(feature = "gzip")]
use http::{
    header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH, RANGE},
    HeaderValue,
};
use hyper::body::Incoming;
use log::{debug, trace};
use tokio::time::Instant;

use crate::{
    conn::HttpConnector,
    connect::{DialSpec, Dialer},
    error::{Error, TimedOut},
    options::{Options, Timeouts},
    pool::{Pool, Pooled},
    retry::{Classified, Failure, RetryPolicy},
    Body, Request, Response,
};

pub(crate) struct Transport {
    pool: Pool<HttpConnector>,
    retry: RetryPolicy,
    timeouts: Timeouts,
    keep_alive: bool,
    #[cfg_attr(not(feature = "gzip"), allow(dead_code))]
    compression: bool,
    tls: bool,
}

/// A failed attempt.
struct Attempt {
    failure: Failure,
    error: Error,
    reused: bool,
    /// The request, when it is known not to have been written.
    unsent: Option<Request>,
}

impl Attempt {
    fn new(classified: Classified, reused: bool, unsent: Option<Request>) -> Attempt {
        Attempt {
            failure: classified.failure,
            error: classified.error,
            reused,
            unsent,
        }
    }

    fn hyper(err: hyper::Error, reused: bool, unsent: Option<Request>) -> Attempt {
        let failure = if unsent.is_some() {
            // Handed back before a single byte went out.
            Failure::Canceled
        } else {
            Failure::from_hyper(&err)
        };
        let error = match failure {
            Failure::Malformed => Error::protocol(err),
            _ => Error::request(err),
        };
        Attempt {
            failure,
            error,
            reused,
            unsent,
        }
    }

    fn timeout(reused: bool) -> Attempt {
        Attempt {
            failure: Failure::Timeout,
            error: Error::request(TimedOut),
            reused,
            unsent: None,
        }
    }
}

impl Transport {
    pub(crate) fn new(options: &Options, address: &str, port: u16) -> crate::Result<Transport> {
        let spec = DialSpec::new(&options.dial, address, port)?;
        let dialer = Dialer::new(spec);

        #[cfg(feature = "__rustls")]
        let dialer = if options.tls.enabled {
            let tls = crate::tls::TlsConnector::new(&options.tls, &dialer.spec().host)?;
            dialer.with_tls(tls)
        } else {
            dialer
        };

        let pool = Pool::new(
            HttpConnector::new(dialer),
            options.pool_initial,
            options.pool_max,
            options.max_idle_conns_per_host,
        );

        Ok(Transport {
            pool,
            retry: options.retry,
            timeouts: options.timeouts,
            keep_alive: !options.disable_keep_alives,
            compression: !options.disable_compression,
            tls: options.tls.enabled,
        })
    }

    pub(crate) fn pool(&self) -> &Pool<HttpConnector> {
        &self.pool
    }

    /// Sends `req`, retrying per the policy.
    ///
    /// Every failure that ends the request, retried or not, is reported as a
    /// retry budget error carrying the attempt count and the last cause.
    pub(crate) async fn round_trip(&self, req: Request) -> crate::Result<Response> {
        let url = req.url().clone();
        let expected = if self.tls { "https" } else { "http" };
        if url.scheme() != expected {
            return Err(Error::url_bad_scheme(url));
        }

        let allowed = self.retry.attempts_allowed();
        let mut req = req;
        let accept_gzip = self.accept_gzip(&mut req);
        let mut attempts = 0;

        loop {
            attempts += 1;

            // Kept aside in case the attempt consumes the request.
            let spare = if attempts < allowed && self.retry.retry_after_timeout() {
                req.try_clone()
            } else {
                None
            };

            let failed = match self.attempt(req, accept_gzip).await {
                Ok(res) => return Ok(res),
                Err(failed) => failed,
            };

            let next = failed.unsent.or(spare);
            match next {
                Some(next) if self.retry.should_retry(failed.failure, failed.reused, attempts) => {
                    debug!(
                        "retrying {} after {:?} failure (attempt {}/{}): {}",
                        url, failed.failure, attempts, allowed, failed.error
                    );
                    req = next;
                }
                _ => {
                    trace!("giving up on {} after {} attempt(s)", url, attempts);
                    return Err(Error::retry_exhausted(attempts, failed.error).with_url(url));
                }
            }
        }
    }

    async fn attempt(&self, req: Request, accept_gzip: bool) -> Result<Response, Attempt> {
        let deadline = self.timeouts.per_request.map(|t| Instant::now() + t);

        let mut res = match deadline {
            Some(deadline) => {
                match tokio::time::timeout_at(deadline, self.exchange(req, accept_gzip, Some(deadline))).await {
                    Ok(res) => res?,
                    Err(_elapsed) => return Err(Attempt::timeout(false)),
                }
            }
            None => self.exchange(req, accept_gzip, None).await?,
        };

        if let Some(deadline) = deadline {
            res.set_deadline(deadline);
        }
        Ok(res)
    }

    async fn exchange(
        &self,
        req: Request,
        accept_gzip: bool,
        deadline: Option<Instant>,
    ) -> Result<Response, Attempt> {
        let patience = earliest(
            self.timeouts.pool_acquire.map(|t| Instant::now() + t),
            deadline,
        );

        let mut pooled = match self.pool.acquire(patience).await {
            Ok(pooled) => pooled,
            Err(failed) => return Err(Attempt::new(failed, false, Some(req))),
        };
        let reused = pooled.is_reused();

        if let Err(e) = pooled.ready().await {
            self.pool.release(pooled, false);
            return Err(Attempt::hyper(e, reused, Some(req)));
        }

        let (url, http_req) = match req.into_http() {
            Ok(parts) => parts,
            Err(error) => {
                self.pool.release(pooled, true);
                return Err(Attempt {
                    failure: Failure::Other,
                    error,
                    reused,
                    unsent: None,
                });
            }
        };

        let sent = pooled.try_send_request(http_req);
        let sent = match self.timeouts.response_header {
            Some(wait) => match tokio::time::timeout(wait, sent).await {
                Ok(sent) => sent,
                Err(_elapsed) => {
                    trace!("no response head within {:?}", wait);
                    self.pool.release(pooled, false);
                    return Err(Attempt::timeout(reused));
                }
            },
            None => sent.await,
        };

        let res = match sent {
            Ok(res) => res,
            Err(mut e) => {
                let unsent = e.take_message().map(|r| Request::from_http(url, r));
                self.pool.release(pooled, false);
                return Err(Attempt::hyper(e.into_error(), reused, unsent));
            }
        };

        self.release_when_idle(pooled);
        Ok(Response::new(self.decode(res, accept_gzip), url))
    }

    /// Asks for a gzip body unless the caller negotiates encodings itself.
    #[cfg(feature = "gzip")]
    fn accept_gzip(&self, req: &mut Request) -> bool {
        let headers = req.headers_mut();
        if !self.compression || headers.contains_key(ACCEPT_ENCODING) || headers.contains_key(RANGE)
        {
            return false;
        }
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        true
    }

    #[cfg(not(feature = "gzip"))]
    fn accept_gzip(&self, _req: &mut Request) -> bool {
        false
    }

    /// Hands the connection back once the response body is done with it.
    fn release_when_idle(&self, mut pooled: Pooled<HttpConnector>) {
        let keep_alive = self.keep_alive;

        if pooled.is_ready() {
            self.pool.release(pooled, keep_alive);
            return;
        }

        let pool = self.pool.clone();
        tokio::spawn(async move {
            let healthy = poll_fn(|cx| pooled.poll_ready(cx)).await.is_ok();
            pool.release(pooled, healthy && keep_alive);
        });
    }

    #[cfg(feature = "gzip")]
    fn decode(&self, res: http::Response<Incoming>, accept_gzip: bool) -> http::Response<Body> {
        use http_body::Body as _;

        let (mut parts, body) = res.into_parts();

        let gzipped = accept_gzip
            && parts
                .headers
                .get(CONTENT_ENCODING)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.trim().eq_ignore_ascii_case("gzip"));

        if !gzipped || body.is_end_stream() {
            return http::Response::from_parts(parts, Body::wrap(body));
        }

        parts.headers.remove(CONTENT_ENCODING);
        parts.headers.remove(CONTENT_LENGTH);
        http::Response::from_parts(parts, gzip_body(body))
    }

    #[cfg(not(feature = "gzip"))]
    fn decode(&self, res: http::Response<Incoming>, _accept_gzip: bool) -> http::Response<Body> {
        res.map(Body::wrap)
    }
}

#[cfg(feature = "gzip")]
fn gzip_body(body: Incoming) -> Body {
    use std::io;

    use async_compression::tokio::bufread::GzipDecoder;
    use futures_util::TryStreamExt;
    use http_body_util::BodyStream;
    use tokio_util::io::{ReaderStream, StreamReader};

    let frames = BodyStream::new(body)
        .try_filter_map(|frame| futures_util::future::ok(frame.into_data().ok()))
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e));

    let mut decoder = GzipDecoder::new(StreamReader::new(frames));
    decoder.multiple_members(true);

    Body::wrap_stream(ReaderStream::new(decoder).map_err(Error::decode))
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}
