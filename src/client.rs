use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use http::{HeaderMap, Method};
use log::{debug, trace};
use tokio::time::Instant;

use crate::{
    error::Error,
    into_url::IntoUrl,
    options::Options,
    redirect::{self, ActionKind},
    transport::Transport,
    Body, Request, RequestBuilder, Response,
};

/// Redirect bodies up to this size are read so the connection can be reused.
const MAX_REDIRECT_DRAIN: u64 = 2048;

/// An asynchronous `Client` to make Requests with.
///
/// A `Client` is bound to one upstream address. It owns a pool of
/// connections to that address, so it should be created once and reused;
/// cloning is cheap and shares the pool.
///
/// Connections are pre-dialed in the background when the client is created
/// inside a Tokio runtime.
///
/// ```no_run
/// # async fn run() -> Result<(), rehttp::Error> {
/// let client = rehttp::Client::new(rehttp::Options::new(), "127.0.0.1", 8080)?;
///
/// let body = client
///     .get("http://127.0.0.1:8080/status")
///     .send()
///     .await?
///     .text()
///     .await?;
/// # drop(body);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientRef>,
}

struct ClientRef {
    options: Options,
    transport: Transport,
    address: String,
    port: u16,
}

impl Client {
    /// Constructs a new `Client` for `address:port`.
    ///
    /// # Errors
    ///
    /// This method fails if the address is invalid or the TLS configuration
    /// cannot be loaded.
    pub fn new(options: Options, address: &str, port: u16) -> crate::Result<Client> {
        let transport = Transport::new(&options, address, port)?;

        let client = Client {
            inner: Arc::new(ClientRef {
                options,
                transport,
                address: address.to_owned(),
                port,
            }),
        };
        client.spawn_prewarm();
        Ok(client)
    }

    fn spawn_prewarm(&self) {
        let pool = self.inner.transport.pool().clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    pool.prewarm().await;
                });
            }
            Err(_) => trace!("no runtime to pre-warm the pool on, dialing on demand"),
        }
    }

    /// Dials connections until the configured initial pool size is reached.
    ///
    /// Returns how many connections were opened. Dial failures are logged
    /// and end the warm up early, they are not returned.
    pub async fn warm_up(&self) -> usize {
        self.inner.transport.pool().prewarm().await
    }

    /// Convenience method to make a `GET` request to a URL.
    ///
    /// # Errors
    ///
    /// This method fails whenever the supplied `Url` cannot be parsed.
    pub fn get<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::GET, url)
    }

    /// Convenience method to make a `HEAD` request to a URL.
    ///
    /// # Errors
    ///
    /// This method fails whenever the supplied `Url` cannot be parsed.
    pub fn head<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::HEAD, url)
    }

    /// Convenience method to make a `POST` request to a URL.
    ///
    /// # Errors
    ///
    /// This method fails whenever the supplied `Url` cannot be parsed.
    pub fn post<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::POST, url)
    }

    /// Convenience method to make a `PUT` request to a URL.
    ///
    /// # Errors
    ///
    /// This method fails whenever the supplied `Url` cannot be parsed.
    pub fn put<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::PUT, url)
    }

    /// Convenience method to make a `PATCH` request to a URL.
    ///
    /// # Errors
    ///
    /// This method fails whenever the supplied `Url` cannot be parsed.
    pub fn patch<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::PATCH, url)
    }

    /// Convenience method to make a `DELETE` request to a URL.
    ///
    /// # Errors
    ///
    /// This method fails whenever the supplied `Url` cannot be parsed.
    pub fn delete<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::DELETE, url)
    }

    /// Start building a `Request` with the `Method` and `Url`.
    ///
    /// Returns a `RequestBuilder`, which will allow setting headers and
    /// the request body before sending.
    ///
    /// # Errors
    ///
    /// This method fails whenever the supplied `Url` cannot be parsed.
    pub fn request<U: IntoUrl>(&self, method: Method, url: U) -> RequestBuilder {
        let req = url.into_url().map(move |url| Request::new(method, url));
        RequestBuilder::new(self.clone(), req)
    }

    /// Build a ready to send `Request` in one call.
    ///
    /// The default headers are attached, and so is the `Content-Length` of
    /// a body whose size is known.
    pub fn new_request<U: IntoUrl>(
        &self,
        method: Method,
        url: U,
        body: Option<Body>,
    ) -> crate::Result<Request> {
        let mut req = Request::new(method, url.into_url()?);
        *req.body_mut() = body;
        req.apply_defaults(self.default_headers());
        Ok(req)
    }

    /// Executes a `Request`.
    ///
    /// A `Request` can be built manually with `Request::new()` or obtained
    /// from a RequestBuilder with `RequestBuilder::build()`.
    ///
    /// The whole-client timeout covers every attempt, every redirect and
    /// reading the body.
    ///
    /// # Errors
    ///
    /// This method fails if there was an error while sending request,
    /// every allowed attempt failed, or the redirect limit was exhausted.
    pub fn execute(&self, request: Request) -> Pending {
        self.execute_request(request)
    }

    /// Sends a `Request` through the retrying transport only.
    ///
    /// Neither the whole-client timeout nor the redirect policy apply, and
    /// the request is sent with exactly the headers it carries.
    pub fn round_trip(&self, request: Request) -> Pending {
        let inner = self.inner.clone();
        Pending::new(async move { inner.transport.round_trip(request).await })
    }

    /// The options this client was built with.
    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    pub(crate) fn default_headers(&self) -> &HeaderMap {
        &self.inner.options.headers
    }

    fn execute_request(&self, mut req: Request) -> Pending {
        req.apply_defaults(self.default_headers());
        let inner = self.inner.clone();
        Pending::new(async move { inner.execute(req).await })
    }
}

impl ClientRef {
    async fn execute(&self, req: Request) -> crate::Result<Response> {
        let Some(timeout) = self.options.timeouts.client else {
            return self.follow_redirects(req).await;
        };

        let url = req.url().clone();
        let deadline = Instant::now() + timeout;

        match tokio::time::timeout_at(deadline, self.follow_redirects(req)).await {
            Ok(Ok(mut res)) => {
                res.set_deadline(deadline);
                Ok(res)
            }
            Ok(Err(err)) => Err(err),
            Err(_elapsed) => Err(Error::client_timeout().with_url(url)),
        }
    }

    async fn follow_redirects(&self, req: Request) -> crate::Result<Response> {
        let policy = &self.options.redirect;
        if policy.is_none() {
            return self.transport.round_trip(req).await;
        }

        let mut req = req;
        let mut urls = Vec::new();

        loop {
            let method = req.method().clone();
            let headers = req.headers().clone();
            let replay = req.try_clone();

            let res = self.transport.round_trip(req).await?;
            let Some(next) = redirect::location(&res) else {
                return Ok(res);
            };

            let status = res.status();
            let previous = res.url().clone();
            urls.push(previous.clone());

            match policy.check(status, &next, &urls) {
                ActionKind::Follow => {}
                ActionKind::Stop => return Ok(res),
                ActionKind::Error(err) => return Err(Error::redirect(err, previous)),
            }

            if next.scheme() != previous.scheme() {
                return Err(Error::redirect(Error::url_bad_scheme(next.clone()), previous));
            }

            let Some(next_req) =
                redirect::next_request(status, &method, &headers, replay, next.clone(), &urls)
            else {
                debug!("cannot replay the body of {} for a {} redirect", previous, status);
                return Ok(res);
            };

            if res
                .content_length()
                .is_some_and(|len| len <= MAX_REDIRECT_DRAIN)
            {
                let _ = res.bytes().await;
            }

            debug!("redirecting '{}' to '{}'", previous, next);
            req = next_req;
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Client")
            .field("address", &self.inner.address)
            .field("port", &self.inner.port)
            .field("pool", self.inner.transport.pool())
            .field("options", &self.inner.options)
            .finish()
    }
}

impl tower_service::Service<Request> for Client {
    type Response = Response;
    type Error = Error;
    type Future = Pending;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request) -> Self::Future {
        self.execute_request(req)
    }
}

impl tower_service::Service<Request> for &'_ Client {
    type Response = Response;
    type Error = Error;
    type Future = Pending;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request) -> Self::Future {
        self.execute_request(req)
    }
}

/// A `Future` that will resolve to a `Response`.
#[must_use = "futures do nothing unless polled"]
pub struct Pending {
    inner: PendingInner,
}

enum PendingInner {
    Request(Pin<Box<dyn Future<Output = crate::Result<Response>> + Send>>),
    Error(Option<Error>),
}

impl Pending {
    fn new<F>(fut: F) -> Pending
    where
        F: Future<Output = crate::Result<Response>> + Send + 'static,
    {
        Pending {
            inner: PendingInner::Request(Box::pin(fut)),
        }
    }

    pub(crate) fn error(err: Error) -> Pending {
        Pending {
            inner: PendingInner::Error(Some(err)),
        }
    }
}

impl Future for Pending {
    type Output = crate::Result<Response>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.inner {
            PendingInner::Request(ref mut fut) => fut.as_mut().poll(cx),
            PendingInner::Error(ref mut err) => Poll::Ready(Err(err
                .take()
                .expect("Pending error polled more than once"))),
        }
    }
}

impl fmt::Debug for Pending {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.inner {
            PendingInner::Request(..) => f.pad("Pending"),
            PendingInner::Error(ref err) => f.debug_struct("Pending").field("error", err).finish(),
        }
    }
}
