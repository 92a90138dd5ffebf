use std::{convert::TryFrom, fmt, future::Future};

use http::{
    header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, HOST, TRANSFER_ENCODING},
    Method, Uri, Version,
};
use url::{Position, Url};

use crate::{client::Pending, Body, Client, Error, Response};

/// A request which can be executed with `Client::execute()`.
pub struct Request {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Option<Body>,
    version: Version,
}

/// A builder to construct the properties of a `Request`.
///
/// To construct a `RequestBuilder`, refer to the `Client` documentation.
#[must_use = "RequestBuilder does nothing until you 'send' it"]
pub struct RequestBuilder {
    client: Client,
    request: crate::Result<Request>,
}

impl Request {
    /// Constructs a new request.
    #[inline]
    pub fn new(method: Method, url: Url) -> Self {
        Request {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            version: Version::HTTP_11,
        }
    }

    /// Get the method.
    #[inline]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Get a mutable reference to the method.
    #[inline]
    pub fn method_mut(&mut self) -> &mut Method {
        &mut self.method
    }

    /// Get the url.
    #[inline]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Get a mutable reference to the url.
    #[inline]
    pub fn url_mut(&mut self) -> &mut Url {
        &mut self.url
    }

    /// Get the headers.
    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Get a mutable reference to the headers.
    #[inline]
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Get the body.
    #[inline]
    pub fn body(&self) -> Option<&Body> {
        self.body.as_ref()
    }

    /// Get a mutable reference to the body.
    #[inline]
    pub fn body_mut(&mut self) -> &mut Option<Body> {
        &mut self.body
    }

    /// Get the http version.
    #[inline]
    pub fn version(&self) -> Version {
        self.version
    }

    /// Get a mutable reference to the http version.
    #[inline]
    pub fn version_mut(&mut self) -> &mut Version {
        &mut self.version
    }

    /// Attempt to clone the request.
    ///
    /// `None` is returned if the request can not be cloned, i.e. if the body is a stream.
    pub fn try_clone(&self) -> Option<Request> {
        let body = match self.body() {
            Some(body) => Some(body.try_clone()?),
            None => None,
        };
        let mut req = Request::new(self.method().clone(), self.url().clone());
        *req.headers_mut() = self.headers().clone();
        *req.version_mut() = self.version();
        *req.body_mut() = body;
        Some(req)
    }

    /// Fills in every default header the caller left unset, and the
    /// `Content-Length` of a body whose size is known.
    pub(crate) fn apply_defaults(&mut self, defaults: &HeaderMap) {
        for name in defaults.keys() {
            if !self.headers.contains_key(name) {
                for value in defaults.get_all(name) {
                    self.headers.append(name.clone(), value.clone());
                }
            }
        }

        if self.headers.contains_key(CONTENT_LENGTH) || self.headers.contains_key(TRANSFER_ENCODING)
        {
            return;
        }

        if let Some(len) = self.body.as_ref().and_then(Body::content_length) {
            self.headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
        }
    }

    /// Converts into the origin-form request written on the wire.
    pub(crate) fn into_http(self) -> crate::Result<(Url, http::Request<Body>)> {
        let origin = &self.url[Position::BeforePath..Position::AfterQuery];
        let uri = Uri::try_from(origin).map_err(|e| Error::builder(e).with_url(self.url.clone()))?;

        let mut headers = self.headers;
        if !headers.contains_key(HOST) {
            let host = host_header(&self.url)?;
            headers.insert(HOST, host);
        }

        let mut req = http::Request::new(self.body.unwrap_or_default());
        *req.method_mut() = self.method;
        *req.uri_mut() = uri;
        *req.version_mut() = self.version;
        *req.headers_mut() = headers;
        Ok((self.url, req))
    }

    /// Rebuilds a request that the connection handed back unsent.
    pub(crate) fn from_http(url: Url, req: http::Request<Body>) -> Request {
        let (parts, body) = req.into_parts();
        Request {
            method: parts.method,
            url,
            headers: parts.headers,
            body: Some(body),
            version: parts.version,
        }
    }
}

fn host_header(url: &Url) -> crate::Result<HeaderValue> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::url_bad_scheme(url.clone()))?;
    let value = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_owned(),
    };
    HeaderValue::try_from(value).map_err(|e| Error::builder(e).with_url(url.clone()))
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("headers", &self.headers)
            .finish()
    }
}

impl RequestBuilder {
    pub(crate) fn new(client: Client, request: crate::Result<Request>) -> RequestBuilder {
        RequestBuilder { client, request }
    }

    /// Assemble a builder starting from an existing `Client` and a `Request`.
    pub fn from_parts(client: Client, request: Request) -> RequestBuilder {
        RequestBuilder {
            client,
            request: Ok(request),
        }
    }

    /// Add a `Header` to this Request.
    ///
    /// If the header is already present, the value will be replaced.
    pub fn header<K, V>(mut self, key: K, value: V) -> RequestBuilder
    where
        HeaderName: TryFrom<K>,
        <HeaderName as TryFrom<K>>::Error: Into<http::Error>,
        HeaderValue: TryFrom<V>,
        <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
    {
        let mut error = None;
        if let Ok(ref mut req) = self.request {
            match <HeaderName as TryFrom<K>>::try_from(key) {
                Ok(key) => match <HeaderValue as TryFrom<V>>::try_from(value) {
                    Ok(value) => {
                        req.headers_mut().insert(key, value);
                    }
                    Err(e) => error = Some(Error::builder(Into::<http::Error>::into(e))),
                },
                Err(e) => error = Some(Error::builder(Into::<http::Error>::into(e))),
            };
        }
        if let Some(err) = error {
            self.request = Err(err);
        }
        self
    }

    /// Add a set of Headers to the existing ones on this Request.
    ///
    /// The headers will be merged in to any already set.
    pub fn headers(mut self, headers: HeaderMap) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            for (key, value) in headers.iter() {
                req.headers_mut().insert(key.clone(), value.clone());
            }
        }
        self
    }

    /// Set the request body.
    pub fn body<T: Into<Body>>(mut self, body: T) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            *req.body_mut() = Some(body.into());
        }
        self
    }

    /// Set HTTP version
    pub fn version(mut self, version: Version) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            *req.version_mut() = version;
        }
        self
    }

    /// Build a `Request`, which can be inspected, modified and executed with
    /// `Client::execute()`.
    ///
    /// The client's default headers are filled in here, so they show up on
    /// the built request.
    pub fn build(self) -> crate::Result<Request> {
        let mut req = self.request?;
        req.apply_defaults(self.client.default_headers());
        Ok(req)
    }

    /// Build a `Request`, which can be inspected, modified and executed with
    /// `Client::execute()`.
    ///
    /// This is similar to [`RequestBuilder::build()`], but also returns the
    /// embedded `Client`.
    pub fn build_split(self) -> (Client, crate::Result<Request>) {
        let RequestBuilder { client, request } = self;
        let request = request.map(|mut req| {
            req.apply_defaults(client.default_headers());
            req
        });
        (client, request)
    }

    /// Constructs the Request and sends it to the target URL, returning a
    /// future Response.
    ///
    /// # Errors
    ///
    /// This method fails if there was an error while sending request,
    /// every allowed attempt failed, or the redirect limit was exhausted.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # async fn run() -> Result<(), rehttp::Error> {
    /// let client = rehttp::Client::new(rehttp::Options::new(), "127.0.0.1", 8080)?;
    /// let response = client.get("http://127.0.0.1:8080/").send().await?;
    /// # drop(response);
    /// # Ok(())
    /// # }
    /// ```
    pub fn send(self) -> impl Future<Output = crate::Result<Response>> {
        match self.request {
            Ok(req) => self.client.execute(req),
            Err(err) => Pending::error(err),
        }
    }

    /// Attempt to clone the RequestBuilder.
    ///
    /// `None` is returned if the RequestBuilder can not be cloned,
    /// i.e. if the request body is a stream.
    pub fn try_clone(&self) -> Option<RequestBuilder> {
        self.request
            .as_ref()
            .ok()
            .and_then(|req| req.try_clone())
            .map(|req| RequestBuilder {
                client: self.client.clone(),
                request: Ok(req),
            })
    }
}

impl fmt::Debug for RequestBuilder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct("RequestBuilder");
        match self.request {
            Ok(ref req) => builder
                .field("method", &req.method)
                .field("url", &req.url.as_str())
                .field("headers", &req.headers)
                .finish(),
            Err(ref err) => builder.field("error", err).finish(),
        }
    }
}
