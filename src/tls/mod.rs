//! TLS termination.
//!
//! The certificate context is chosen per virtual host *before* the
//! handshake: the raw ClientHello is sniffed for its SNI hostname
//! ([`sni`]), the matching `rustls::ServerConfig` is looked up, and only
//! then is a TLS engine created. Record crypto, handshake status driving
//! and delegated tasks all live inside `tokio-rustls`.

pub mod sni;

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::Context as _;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::server::TlsStream;

use crate::tls::sni::Sniff;
use crate::vhost::VirtualHosts;

/// Upper bound on bytes buffered while waiting for a complete first TLS
/// record; a ClientHello larger than this is treated as hostile.
const MAX_SNIFF_BYTES: usize = 16 * 1024;

/// Builds a rustls server config from PEM-encoded certificate chain and
/// private key files.
pub fn load_server_config(cert_path: &str, key_path: &str) -> anyhow::Result<Arc<ServerConfig>> {
    let mut cert_reader = io::BufReader::new(
        std::fs::File::open(cert_path).with_context(|| format!("open cert file {cert_path}"))?,
    );
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parse certs from {cert_path}"))?;

    let mut key_reader = io::BufReader::new(
        std::fs::File::open(key_path).with_context(|| format!("open key file {key_path}"))?,
    );
    let key = rustls_pemfile::private_key(&mut key_reader)
        .with_context(|| format!("parse key from {key_path}"))?
        .ok_or_else(|| anyhow::anyhow!("no private key found in {key_path}"))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("build TLS config")?;
    Ok(Arc::new(config))
}

/// Stream adapter replaying the bytes consumed by the SNI sniff ahead of
/// the live socket, so the TLS engine sees the full ClientHello.
pub struct Prefixed<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> Prefixed<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Prefixed<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        if !me.prefix.is_empty() {
            let n = me.prefix.len().min(buf.remaining());
            let chunk = me.prefix.split_to(n);
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut me.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Prefixed<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Sniffs the SNI hostname, resolves the virtual host's TLS context and
/// completes the handshake.
///
/// Fatal conditions (malformed hello, no context for the name, EOF before
/// a full record) surface as errors; the caller closes the socket without
/// a response, since nothing interpretable as HTTP has arrived.
pub async fn accept(
    mut stream: TcpStream,
    hosts: &VirtualHosts,
) -> anyhow::Result<(TlsStream<Prefixed<TcpStream>>, Option<String>)> {
    let mut buf = BytesMut::with_capacity(4096);

    let hostname = loop {
        match sni::sniff(&buf) {
            Sniff::Done(name) => break name,
            Sniff::Malformed(reason) => anyhow::bail!("malformed ClientHello: {reason}"),
            Sniff::Incomplete => {
                if buf.len() >= MAX_SNIFF_BYTES {
                    anyhow::bail!("first TLS record exceeds {MAX_SNIFF_BYTES} bytes");
                }
                let n = stream.read_buf(&mut buf).await?;
                if n == 0 {
                    anyhow::bail!("connection closed during TLS sniff");
                }
            }
        }
    };

    let config = hosts
        .tls_context(hostname.as_deref())
        .ok_or_else(|| anyhow::anyhow!("no TLS context for host {:?}", hostname))?;

    let acceptor = TlsAcceptor::from(config);
    let tls = acceptor
        .accept(Prefixed::new(buf.freeze(), stream))
        .await
        .context("TLS handshake")?;
    Ok((tls, hostname))
}
