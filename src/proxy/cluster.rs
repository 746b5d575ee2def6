//! Descriptors the data plane consumes: the virtual cluster, the upstream
//! chooser, and the facts about one client connection that filters and
//! `NetFilter` implementations can read.
//!
//! None of this is owned by the proxy core. The embedding layer builds a
//! [`VirtualCluster`] per exposed cluster and a [`NetFilter`] that picks the
//! broker (and filter chain) for each incoming connection.

use std::net::SocketAddr;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use rustls::RootCertStore;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::proxy::error::{ProxyError, Result};
use crate::proxy::filter::Filter;

/// What the proxy knows about one client connection. Populated by the
/// frontend as the connection bootstraps (PROXY preamble, TLS SNI,
/// `ApiVersions` interception, authentication) and exposed read-only to the
/// `NetFilter` and to filter hooks.
#[derive(Debug, Clone, Default)]
pub struct ConnectionInfo {
    /// Name of the virtual cluster the client connected to.
    pub virtual_cluster: String,
    /// Human-readable channel description, for logging.
    pub channel: String,
    /// Peer address of the client socket.
    pub src_address: Option<SocketAddr>,
    /// Local address the client connected to.
    pub local_address: Option<SocketAddr>,
    /// Source address reported by a PROXY-protocol preamble, when present.
    pub proxy_source: Option<SocketAddr>,
    /// SNI hostname from the client's TLS hello, when the outer layer
    /// terminated TLS and passed it along.
    pub sni_hostname: Option<String>,
    /// Client software name from the `ApiVersions` request.
    pub client_software_name: Option<String>,
    /// Client software version from the `ApiVersions` request.
    pub client_software_version: Option<String>,
    /// Authenticated identity, when authentication happened.
    pub authorized_id: Option<String>,
}

impl ConnectionInfo {
    /// The client's host as filters should see it: the PROXY-protocol
    /// source when a load balancer reported one, the socket peer otherwise.
    pub fn client_host(&self) -> Option<String> {
        self.proxy_source
            .or(self.src_address)
            .map(|addr| addr.ip().to_string())
    }

    /// The client's port, with the same PROXY-protocol preference.
    pub fn client_port(&self) -> Option<u16> {
        self.proxy_source.or(self.src_address).map(|addr| addr.port())
    }
}

/// The externally-visible representation of a target cluster.
#[derive(Clone, Default)]
pub struct VirtualCluster {
    pub name: String,
    /// TLS context for broker connections; plain TCP when absent.
    pub upstream_tls: Option<UpstreamTls>,
    /// Log connection-level events.
    pub log_network: bool,
    /// Log every frame moving through the proxy.
    pub log_frames: bool,
}

impl VirtualCluster {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_upstream_tls(mut self, tls: UpstreamTls) -> Self {
        self.upstream_tls = Some(tls);
        self
    }

    pub fn with_logging(mut self, log_network: bool, log_frames: bool) -> Self {
        self.log_network = log_network;
        self.log_frames = log_frames;
        self
    }
}

/// TLS context for upstream broker connections.
#[derive(Clone)]
pub struct UpstreamTls {
    connector: TlsConnector,
}

impl UpstreamTls {
    /// Trust the CAs in a PEM bundle.
    pub fn from_ca_pem(path: impl AsRef<Path>) -> Result<Self> {
        let pem = std::fs::read(path.as_ref())?;
        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
            let cert = cert.map_err(|e| {
                ProxyError::upstream_connect("tls", format!("bad CA certificate: {e}"))
            })?;
            roots.add(cert).map_err(|e| {
                ProxyError::upstream_connect("tls", format!("unusable CA certificate: {e}"))
            })?;
        }
        Ok(Self::from_root_store(roots))
    }

    pub fn from_root_store(roots: RootCertStore) -> Self {
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Self {
            connector: TlsConnector::from(Arc::new(config)),
        }
    }

    async fn handshake(&self, host: &str, tcp: TcpStream) -> Result<TlsStream<TcpStream>> {
        let server_name = ServerName::try_from(host.to_string()).map_err(|_| {
            ProxyError::upstream_connect(host, "host is not a valid TLS server name")
        })?;
        self.connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| ProxyError::upstream_connect(host, format!("TLS handshake: {e}")))
    }
}

/// A broker connection, plain or TLS.
pub enum BrokerStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for BrokerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            BrokerStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            BrokerStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for BrokerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            BrokerStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            BrokerStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            BrokerStream::Plain(s) => Pin::new(s).poll_flush(cx),
            BrokerStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            BrokerStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            BrokerStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Dial the upstream broker, with TLS when the cluster asks for it.
pub(crate) async fn connect_upstream(
    cluster: &VirtualCluster,
    host: &str,
    port: u16,
    connect_timeout: Duration,
) -> Result<BrokerStream> {
    let remote = format!("{host}:{port}");
    let tcp = match tokio::time::timeout(connect_timeout, TcpStream::connect(&remote)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(ProxyError::upstream_connect(&remote, e.to_string())),
        Err(_) => return Err(ProxyError::upstream_connect(&remote, "connect timeout")),
    };
    tcp.set_nodelay(true)
        .map_err(|e| ProxyError::upstream_connect(&remote, e.to_string()))?;

    match &cluster.upstream_tls {
        None => Ok(BrokerStream::Plain(tcp)),
        Some(tls) => {
            debug!(%remote, "starting upstream TLS handshake");
            let stream = tls.handshake(host, tcp).await?;
            Ok(BrokerStream::Tls(Box::new(stream)))
        }
    }
}

/// The upstream a `NetFilter` picked for one connection, along with the
/// filter chain to install in front of it.
pub struct UpstreamTarget {
    pub host: String,
    pub port: u16,
    pub filters: Vec<(String, Box<dyn Filter>)>,
}

impl UpstreamTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            filters: Vec::new(),
        }
    }

    pub fn with_filter(mut self, name: impl Into<String>, filter: Box<dyn Filter>) -> Self {
        self.filters.push((name.into(), filter));
        self
    }
}

/// Chooses the upstream broker for each incoming connection.
///
/// Called once per connection when the first non-`ApiVersions` request
/// arrives; the returned target carries the address to dial and the filter
/// chain for the connection. Implementations may do I/O (DNS, metadata
/// lookups) to decide.
#[async_trait]
pub trait NetFilter: Send + Sync {
    async fn select_server(&self, info: &ConnectionInfo) -> Result<UpstreamTarget>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_host_prefers_proxy_protocol_source() {
        let mut info = ConnectionInfo {
            src_address: Some("10.0.0.9:41000".parse().unwrap()),
            ..ConnectionInfo::default()
        };
        assert_eq!(info.client_host().as_deref(), Some("10.0.0.9"));
        assert_eq!(info.client_port(), Some(41000));

        info.proxy_source = Some("192.168.1.2:5555".parse().unwrap());
        assert_eq!(info.client_host().as_deref(), Some("192.168.1.2"));
        assert_eq!(info.client_port(), Some(5555));
    }

    #[test]
    fn virtual_cluster_builder() {
        let cluster = VirtualCluster::new("demo").with_logging(true, false);
        assert_eq!(cluster.name, "demo");
        assert!(cluster.log_network);
        assert!(!cluster.log_frames);
        assert!(cluster.upstream_tls.is_none());
    }
}
