// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! TLS material loading and the TLS accept loop.
//!
//! Credentials are loaded once at construction and immutable thereafter;
//! certificate provisioning is out of scope. Bad paths or unparseable PEM
//! are fatal at startup.

use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::RootCertStore;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::ClientTls;
use crate::config::ServerConfig;

/// Install the ring crypto provider. Safe to call repeatedly.
pub(crate) fn ensure_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("open certificate file {}", path.display()))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parse certificates in {}", path.display()))?;
    anyhow::ensure!(!certs.is_empty(), "no certificates found in {}", path.display());
    Ok(certs)
}

fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file =
        std::fs::File::open(path).with_context(|| format!("open key file {}", path.display()))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .with_context(|| format!("parse private key in {}", path.display()))?
        .with_context(|| format!("no private key found in {}", path.display()))
}

fn load_roots(path: &Path) -> anyhow::Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots.add(cert).context("add CA certificate to root store")?;
    }
    Ok(roots)
}

/// Build the server-side rustls config from the configured PEM paths.
///
/// `ssl_verify` switches on client-certificate verification against the
/// CA bundle; without it the bundle is unused on the server side.
pub fn server_tls_config(config: &ServerConfig) -> anyhow::Result<rustls::ServerConfig> {
    ensure_crypto_provider();

    let certfile =
        config.ssl_certfile.as_deref().context("--ssl-enabled requires --ssl-certfile")?;
    let keyfile = config.ssl_keyfile.as_deref().context("--ssl-enabled requires --ssl-keyfile")?;
    let certs = load_certs(certfile)?;
    let key = load_key(keyfile)?;

    let builder = if config.ssl_verify {
        let ca = config.ssl_ca_certs.as_deref().context("--ssl-verify requires --ssl-ca-certs")?;
        let roots = load_roots(ca)?;
        let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .context("build client certificate verifier")?;
        rustls::ServerConfig::builder().with_client_cert_verifier(verifier)
    } else {
        rustls::ServerConfig::builder().with_no_client_auth()
    };

    let mut tls = builder.with_single_cert(certs, key).context("build rustls ServerConfig")?;
    // WebSocket upgrades ride HTTP/1.1.
    tls.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(tls)
}

/// Build the client-side rustls config for the mirror option set.
///
/// Only called when a custom CA bundle, a client certificate, or hostname
/// verification opt-out is configured; the stock connector covers the
/// native-root case.
pub fn client_tls_config(tls: &ClientTls) -> anyhow::Result<rustls::ClientConfig> {
    ensure_crypto_provider();

    let ca = tls.ca_certs.as_deref().context("custom TLS options require ssl_ca_certs")?;
    let roots = Arc::new(load_roots(ca)?);

    let builder = rustls::ClientConfig::builder().with_root_certificates(Arc::clone(&roots));
    let mut config = match (&tls.certfile, &tls.keyfile) {
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(load_certs(cert)?, load_key(key)?)
            .context("build client certificate")?,
        (None, None) => builder.with_no_client_auth(),
        _ => anyhow::bail!("ssl_certfile and ssl_keyfile must be set together"),
    };

    if !tls.check_hostname {
        let inner = rustls::client::WebPkiServerVerifier::builder(roots)
            .build()
            .context("build server certificate verifier")?;
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoHostnameVerification { inner }));
    }

    Ok(config)
}

/// Chain verification without the hostname check: delegates to webpki and
/// maps only the name mismatch to success.
#[derive(Debug)]
struct NoHostnameVerification {
    inner: Arc<rustls::client::WebPkiServerVerifier>,
}

impl rustls::client::danger::ServerCertVerifier for NoHostnameVerification {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        use rustls::CertificateError;
        match self.inner.verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Err(rustls::Error::InvalidCertificate(
                CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. },
            )) => Ok(rustls::client::danger::ServerCertVerified::assertion()),
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Accept loop for TLS listeners: rustls handshake per connection, then
/// hand the stream to hyper with upgrade support so WebSockets work.
pub(crate) async fn serve_tls(
    listener: TcpListener,
    tls: Arc<rustls::ServerConfig>,
    app: Router,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let acceptor = tokio_rustls::TlsAcceptor::from(tls);
    let mut make_service = app.into_make_service_with_connect_info::<SocketAddr>();

    loop {
        let (stream, addr) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    debug!(err = %e, "accept failed");
                    continue;
                }
            },
        };

        let acceptor = acceptor.clone();
        let service = <_ as tower::Service<SocketAddr>>::call(&mut make_service, addr)
            .await
            .unwrap_or_else(|infallible| match infallible {});

        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(s) => s,
                Err(e) => {
                    debug!(%addr, err = %e, "TLS handshake failed");
                    return;
                }
            };
            let io = hyper_util::rt::TokioIo::new(tls_stream);
            let hyper_service = hyper_util::service::TowerToHyperService::new(service);
            if let Err(e) =
                hyper_util::server::conn::auto::Builder::new(hyper_util::rt::TokioExecutor::new())
                    .serve_connection_with_upgrades(io, hyper_service)
                    .await
            {
                debug!(%addr, err = %e, "connection error");
            }
        });
    }
}

#[cfg(test)]
#[path = "tls_tests.rs"]
mod tests;
