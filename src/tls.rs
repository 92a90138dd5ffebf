//! TLS configuration
//!
//! Certificate validation is delegated entirely to `rustls`; this module only
//! assembles the root store, applies the skip-verify switch and performs the
//! handshake on behalf of the dialer.

use std::{fmt, io::Cursor, sync::Arc, time::SystemTime};

use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{ClientConfig, RootCertStore, ServerName};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

use crate::options::TlsOptions;

/// Represents a server X509 certificate.
#[derive(Clone)]
pub struct Certificate {
    der: Vec<u8>,
}

impl Certificate {
    /// Create a `Certificate` from a binary DER encoded certificate
    ///
    /// # Examples
    ///
    /// ```
    /// # use std::fs::File;
    /// # use std::io::Read;
    /// # fn cert() -> Result<(), Box<dyn std::error::Error>> {
    /// let mut buf = Vec::new();
    /// File::open("my_cert.der")?
    ///     .read_to_end(&mut buf)?;
    /// let cert = rehttp::Certificate::from_der(&buf)?;
    /// # drop(cert);
    /// # Ok(())
    /// # }
    /// ```
    pub fn from_der(der: &[u8]) -> crate::Result<Certificate> {
        if der.is_empty() {
            return Err(crate::Error::builder("empty DER certificate"));
        }
        Ok(Certificate { der: der.to_vec() })
    }

    /// Create a `Certificate` from a PEM encoded certificate.
    ///
    /// Only the first certificate of the input is used, see
    /// [`from_pem_bundle`](Certificate::from_pem_bundle) for chains.
    pub fn from_pem(pem: &[u8]) -> crate::Result<Certificate> {
        Self::from_pem_bundle(pem)?
            .into_iter()
            .next()
            .ok_or_else(|| crate::Error::builder("no certificate found in PEM"))
    }

    /// Create a collection of `Certificate`s from a PEM encoded bundle.
    pub fn from_pem_bundle(pem: &[u8]) -> crate::Result<Vec<Certificate>> {
        let mut reader = Cursor::new(pem);
        let certs = rustls_pemfile::certs(&mut reader).map_err(crate::Error::builder)?;
        Ok(certs.into_iter().map(|der| Certificate { der }).collect())
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("len", &self.der.len())
            .finish()
    }
}

/// Performs the client side of the handshake for one upstream.
#[derive(Clone)]
pub(crate) struct TlsConnector {
    inner: tokio_rustls::TlsConnector,
    server_name: ServerName,
}

impl TlsConnector {
    pub(crate) fn new(opts: &TlsOptions, default_host: &str) -> crate::Result<TlsConnector> {
        let mut roots = RootCertStore::empty();

        #[cfg(feature = "rustls-tls-webpki-roots")]
        roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
            rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
                ta.subject,
                ta.spki,
                ta.name_constraints,
            )
        }));

        for cert in &opts.root_certs {
            roots
                .add(&rustls::Certificate(cert.der.clone()))
                .map_err(crate::Error::builder)?;
        }

        let mut config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots)
            .with_no_client_auth();

        if opts.insecure_skip_verify {
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(NoVerifier));
        }

        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        let host = opts.server_name.as_deref().unwrap_or(default_host);
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let server_name = ServerName::try_from(host).map_err(crate::Error::builder)?;

        Ok(TlsConnector {
            inner: tokio_rustls::TlsConnector::from(Arc::new(config)),
            server_name,
        })
    }

    pub(crate) async fn connect(&self, tcp: TcpStream) -> std::io::Result<TlsStream<TcpStream>> {
        self.inner.connect(self.server_name.clone(), tcp).await
    }
}

impl fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TlsConnector")
            .field("server_name", &self.server_name)
            .finish()
    }
}

struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn certificate_from_der_invalid() {
        Certificate::from_der(b"").unwrap_err();
    }

    #[test]
    fn certificate_from_pem_without_certs() {
        let err = Certificate::from_pem(b"not a pem file").unwrap_err();
        assert!(err.is_builder());
    }

    #[test]
    fn connector_accepts_ip_and_dns_names() {
        let opts = TlsOptions::default();
        TlsConnector::new(&opts, "example.com").unwrap();
        TlsConnector::new(&opts, "127.0.0.1").unwrap();
        TlsConnector::new(&opts, "[::1]").unwrap();
    }

    #[test]
    fn server_name_override_is_validated() {
        let opts = TlsOptions {
            server_name: Some("not a hostname!".into()),
            ..TlsOptions::default()
        };
        let err = TlsConnector::new(&opts, "127.0.0.1").unwrap_err();
        assert!(err.is_builder());
    }
}
