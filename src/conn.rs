use std::{
    fmt,
    future::Future,
    task::{Context, Poll},
};

use hyper::client::conn::{
    http1::{self, SendRequest},
    TrySendError,
};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use log::{debug, trace};

use crate::{
    connect::Dialer,
    error::Error,
    pool::{Connect, Poolable},
    retry::{Classified, Failure},
    Body,
};

/// Opens HTTP/1.1 connections to the upstream for the pool.
#[derive(Clone, Debug)]
pub(crate) struct HttpConnector {
    dialer: Dialer,
}

impl HttpConnector {
    pub(crate) fn new(dialer: Dialer) -> HttpConnector {
        HttpConnector { dialer }
    }
}

impl Connect for HttpConnector {
    type Conn = PoolClient;

    fn connect(&self) -> impl Future<Output = Result<PoolClient, Classified>> + Send {
        let dialer = self.dialer.clone();
        async move {
            let io = dialer.dial().await.map_err(|e| {
                let failure = e.failure();
                Classified::new(failure, Error::dial(e))
            })?;

            let (tx, conn) = http1::handshake::<_, Body>(TokioIo::new(io))
                .await
                .map_err(|e| Classified::new(Failure::from_hyper(&e), Error::dial(e)))?;

            tokio::spawn(async move {
                match conn.await {
                    Ok(()) => trace!("connection closed"),
                    Err(e) => debug!("client connection error: {}", e),
                }
            });

            Ok(PoolClient { tx })
        }
    }
}

/// The sending half of one HTTP/1.1 connection.
///
/// The connection task itself runs on the executor and ends once this
/// handle is dropped or the peer goes away.
pub(crate) struct PoolClient {
    tx: SendRequest<Body>,
}

impl PoolClient {
    pub(crate) fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<hyper::Result<()>> {
        self.tx.poll_ready(cx)
    }

    pub(crate) async fn ready(&mut self) -> hyper::Result<()> {
        self.tx.ready().await
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.tx.is_ready()
    }

    pub(crate) fn try_send_request(
        &mut self,
        req: http::Request<Body>,
    ) -> impl Future<Output = Result<http::Response<Incoming>, TrySendError<http::Request<Body>>>>
    {
        self.tx.try_send_request(req)
    }
}

impl Poolable for PoolClient {
    fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

impl fmt::Debug for PoolClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolClient")
            .field("ready", &self.tx.is_ready())
            .finish()
    }
}
