use std::fmt;

use bytes::Bytes;
use http::{HeaderMap, StatusCode, Version};
use http_body_util::BodyExt;
use tokio::time::Instant;
use url::Url;

use crate::body::{into_body_error, Body};

/// A Response to a submitted `Request`.
///
/// The body must be read to the end, or the response dropped, before the
/// underlying connection goes back to the pool.
pub struct Response {
    res: http::Response<Body>,
    url: Box<Url>,
}

impl Response {
    pub(crate) fn new(res: http::Response<Body>, url: Url) -> Response {
        Response {
            res,
            url: Box::new(url),
        }
    }

    /// Bounds the rest of the body by `deadline`.
    pub(crate) fn set_deadline(&mut self, deadline: Instant) {
        let body = std::mem::take(self.res.body_mut());
        *self.res.body_mut() = body.with_deadline(deadline);
    }

    /// Get the `StatusCode` of this `Response`.
    #[inline]
    pub fn status(&self) -> StatusCode {
        self.res.status()
    }

    /// Get the HTTP `Version` of this `Response`.
    #[inline]
    pub fn version(&self) -> Version {
        self.res.version()
    }

    /// Get the `Headers` of this `Response`.
    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        self.res.headers()
    }

    /// Get a mutable reference to the `Headers` of this `Response`.
    #[inline]
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        self.res.headers_mut()
    }

    /// Get the final `Url` of this `Response`, after any redirect.
    #[inline]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Get the content length of the response, if it is known.
    ///
    /// This value does not directly represents the value of the `Content-Length`
    /// header, but rather the size of the response's body. To read the header's
    /// value, please use the [`Response::headers`] method instead.
    ///
    /// Reasons it may not be known:
    ///
    /// - The response does not include a body (e.g. it responds to a `HEAD` request).
    /// - The response is gzipped and automatically decoded (thus changing the actual decoded
    ///   length).
    #[inline]
    pub fn content_length(&self) -> Option<u64> {
        http_body::Body::size_hint(self.res.body()).exact()
    }

    /// Get the full response text.
    ///
    /// Invalid UTF-8 sequences are replaced with
    /// [`char::REPLACEMENT_CHARACTER`].
    pub async fn text(self) -> crate::Result<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Get the full response body as `Bytes`.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # async fn run(client: rehttp::Client) -> Result<(), rehttp::Error> {
    /// let bytes = client.get("http://127.0.0.1:8080/ip").send().await?.bytes().await?;
    ///
    /// println!("bytes: {bytes:?}");
    /// # Ok(())
    /// # }
    /// ```
    pub async fn bytes(self) -> crate::Result<Bytes> {
        let url = *self.url;
        BodyExt::collect(self.res.into_body())
            .await
            .map(|buf| buf.to_bytes())
            .map_err(|e| into_body_error(e).with_url(url))
    }

    /// Stream a chunk of the response body.
    ///
    /// When the response body has been exhausted, this will return `None`.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # async fn run(client: rehttp::Client) -> Result<(), rehttp::Error> {
    /// let mut res = client.get("http://127.0.0.1:8080/").send().await?;
    ///
    /// while let Some(chunk) = res.chunk().await? {
    ///     println!("Chunk: {chunk:?}");
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub async fn chunk(&mut self) -> crate::Result<Option<Bytes>> {
        // loop to ignore unrecognized frames
        loop {
            if let Some(res) = self.res.body_mut().frame().await {
                let frame = res.map_err(|e| into_body_error(e).with_url((*self.url).clone()))?;
                if let Ok(buf) = frame.into_data() {
                    return Ok(Some(buf));
                }
                // else continue
            } else {
                return Ok(None);
            }
        }
    }

    /// Consumes the response, returning the body.
    pub fn into_body(self) -> Body {
        self.res.into_body()
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Response")
            .field("url", &self.url().as_str())
            .field("status", &self.status())
            .field("headers", self.headers())
            .finish()
    }
}

impl From<Response> for http::Response<Body> {
    fn from(r: Response) -> http::Response<Body> {
        r.res
    }
}
