//! Transport streams: plain TCP, TLS, or anything the caller hands in.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};

use super::io::deadline;
use super::options::{Options, TlsConfig};
use crate::error::{Error, Result};

/// Byte stream a `Client` can run on.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Transport for T {}

/// Stream returned by `dial`: plain TCP, or TCP wrapped in rustls when
/// `Options::tls` is set. Reads and writes forward to the inner stream.
#[allow(clippy::large_enum_variant)]
pub enum ChStream {
    Tcp(TcpStream),
    Tls(TlsStream<TcpStream>),
}

impl AsyncRead for ChStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ChStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            ChStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ChStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ChStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            ChStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ChStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            ChStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ChStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            ChStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Host part of `host:port`, without IPv6 brackets.
fn host_of(addr: &str) -> &str {
    let host = match addr.rsplit_once(':') {
        Some((h, port)) if port.chars().all(|c| c.is_ascii_digit()) => h,
        _ => addr,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}

/// Dial `addr`, wrapping in TLS when configured.
pub async fn dial(addr: &str, opts: &Options) -> Result<ChStream> {
    let tcp = deadline(
        async { Ok(TcpStream::connect(addr).await?) },
        "dial",
        opts.dial_timeout,
    )
    .await?;
    tcp.set_nodelay(true)?;

    let Some(tls) = &opts.tls else {
        return Ok(ChStream::Tcp(tcp));
    };
    let connector = TlsConnector::from(Arc::new(client_config(tls)?));
    let name = tls
        .server_name
        .clone()
        .unwrap_or_else(|| host_of(addr).to_string());
    let server_name = ServerName::try_from(name.clone())
        .map_err(|_| Error::InvalidInput(format!("invalid TLS server name {:?}", name)))?;
    let stream = deadline(
        async { Ok(connector.connect(server_name, tcp).await?) },
        "TLS handshake",
        opts.dial_timeout,
    )
    .await?;
    tracing::debug!(server_name = %name, "TLS established");
    Ok(ChStream::Tls(stream))
}

fn client_config(tls: &TlsConfig) -> Result<ClientConfig> {
    let mut roots = RootCertStore::empty();
    match &tls.ca_cert_pem {
        Some(pem) => {
            for cert in rustls_pemfile::certs(&mut pem.as_slice()).filter_map(|r| r.ok()) {
                let _ = roots.add(cert);
            }
        }
        None => {
            for cert in rustls_native_certs::load_native_certs().certs {
                let _ = roots.add(cert);
            }
        }
    }
    let builder = ClientConfig::builder().with_root_certificates(roots);

    match (&tls.client_cert_pem, &tls.client_key_pem) {
        (Some(cert), Some(key)) => {
            let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert.as_slice())
                .filter_map(|r| r.ok())
                .collect();
            let key = rustls_pemfile::private_key(&mut key.as_slice())
                .map_err(|e| Error::InvalidInput(format!("invalid client key: {}", e)))?
                .ok_or_else(|| Error::InvalidInput("no private key found in PEM".to_string()))?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| Error::InvalidInput(format!("invalid client cert/key: {}", e)))
        }
        (None, None) => Ok(builder.with_no_client_auth()),
        _ => Err(Error::InvalidInput(
            "client certificate and key must be given together".to_string(),
        )),
    }
}
