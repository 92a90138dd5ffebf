#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(test, deny(warnings))]

//! # rehttp
//!
//! The `rehttp` crate provides a pooled, retrying HTTP/1.1 [`Client`][client]
//! bound to a single upstream address.
//!
//! It is meant for services that talk to one backend over and over:
//!
//! - A bounded pool of keep-alive connections, pre-dialed at construction
//! - Automatic retry of failures that are known to be safe to repeat
//! - Independent dial, pool, response header, per-request and whole-client
//!   timeouts
//! - Customizable [redirect policy](#redirect-policies)
//! - Optional [TLS](#tls) and transparent gzip decoding
//!
//! ## Making a GET request
//!
//! ```rust
//! # async fn run() -> Result<(), rehttp::Error> {
//! let client = rehttp::Client::new(rehttp::Options::new(), "127.0.0.1", 8080)?;
//!
//! let body = client
//!     .get("http://127.0.0.1:8080/health")
//!     .send()
//!     .await?
//!     .text()
//!     .await?;
//!
//! println!("body = {:?}", body);
//! # Ok(())
//! # }
//! ```
//!
//! **NOTE**: A `Client` owns its connection pool. Create it once and clone
//! it, cloning is cheap and shares the pool.
//!
//! ## Making POST requests (or setting request bodies)
//!
//! The body is set with the `body()` method of a [`RequestBuilder`][builder].
//! It accepts various types, including `String`, `Vec<u8>` and `Bytes`.
//! In-memory bodies get a `Content-Length` and can be replayed on retry and
//! on `307`/`308` redirects; streaming bodies cannot.
//!
//! ```rust
//! # async fn run(client: rehttp::Client) -> Result<(), rehttp::Error> {
//! let res = client
//!     .post("http://127.0.0.1:8080/post")
//!     .body("the exact body that is sent")
//!     .send()
//!     .await?;
//! # drop(res);
//! # Ok(())
//! # }
//! ```
//!
//! ## Retries
//!
//! A logical request is attempted up to [`Options::max_tries`] times. Dial
//! failures, pool exhaustion and requests the connection handed back unsent
//! are always retried. Timeouts and failures on reused connections are only
//! retried with [`Options::retry_after_timeout`]. Once attempts run out the
//! error reports [`Error::attempts`] and carries the last cause.
//!
//! ## Redirect Policies
//!
//! By default, a `Client` will automatically handle HTTP redirects, having a
//! maximum redirect chain of 10 hops. To customize this behavior, a
//! [`redirect::Policy`][redirect] can be used with [`Options::redirect`].
//!
//! ## TLS
//!
//! With the `rustls-tls` feature, [`Options::tls`] wraps every pooled
//! connection in TLS. The request URLs must then use the `https` scheme.
//!
//! ## Optional Features
//!
//! - **rustls-tls** *(enabled by default)*: TLS via `rustls` with the
//!   `webpki-roots` trust anchors.
//! - **rustls-tls-manual-roots**: TLS via `rustls` trusting only the
//!   certificates added with [`Options::add_root_certificate`].
//! - **gzip** *(enabled by default)*: Provides response body gzip
//!   decompression.
//!
//! [client]: ./struct.Client.html
//! [builder]: ./struct.RequestBuilder.html
//! [redirect]: crate::redirect

pub use http::header;
pub use http::Method;
pub use http::{StatusCode, Version};
pub use url::Url;

mod error;
mod into_url;

pub use self::body::Body;
pub use self::client::{Client, Pending};
pub use self::error::{BoxError, Error, Result};
pub use self::into_url::IntoUrl;
pub use self::options::Options;
pub use self::request::{Request, RequestBuilder};
pub use self::response::Response;
pub use self::retry::RetryPolicy;
#[cfg(feature = "__rustls")]
pub use self::tls::Certificate;

mod body;
mod client;
mod conn;
mod connect;
pub mod options;
mod pool;
pub mod redirect;
mod request;
mod response;
mod retry;
#[cfg(feature = "__rustls")]
mod tls;
mod transport;

fn _assert_impls() {
    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}
    fn assert_clone<T: Clone>() {}

    assert_send::<Client>();
    assert_sync::<Client>();
    assert_clone::<Client>();

    assert_send::<Request>();
    assert_send::<RequestBuilder>();
    assert_send::<Response>();
    assert_send::<Pending>();

    assert_clone::<Options>();

    assert_send::<Error>();
    assert_sync::<Error>();
}
