use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::config::Connection;
use crate::{Error, Result};

pub(crate) trait AsyncStream:
    tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send
{
}
impl<T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send> AsyncStream for T {}

pub(crate) type BoxStream = Box<dyn AsyncStream>;

/// One entry of a connection's source list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceAddr {
    Unix(PathBuf),
    Tcp(String),
    Tls(String),
    Http(String),
}

impl SourceAddr {
    pub fn parse(source: &str) -> SourceAddr {
        if let Some(rest) = source.strip_prefix("tls://") {
            return SourceAddr::Tls(rest.to_string());
        }
        if let Some(rest) = source.strip_prefix("tcp://") {
            return SourceAddr::Tcp(rest.to_string());
        }
        if source.starts_with("http://") || source.starts_with("https://") {
            return SourceAddr::Http(source.to_string());
        }
        // "host:port" is TCP, anything else is a unix socket path.
        if source.contains(':') && !source.contains('/') {
            return SourceAddr::Tcp(source.to_string());
        }
        SourceAddr::Unix(PathBuf::from(source))
    }
}

impl std::fmt::Display for SourceAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceAddr::Unix(p) => write!(f, "{}", p.display()),
            SourceAddr::Tcp(a) => write!(f, "tcp://{a}"),
            SourceAddr::Tls(a) => write!(f, "tls://{a}"),
            SourceAddr::Http(u) => f.write_str(u),
        }
    }
}

/// Opens backend streams and drives single request/response exchanges.
/// HTTP sources are not handled here, they go through the tunnel.
pub(crate) struct Connector {
    connect_timeout: Duration,
    net_timeout: Duration,
    tls: Option<TlsConnector>,
}

impl Connector {
    pub fn new(
        connect_timeout: Duration,
        net_timeout: Duration,
        peer_config: &Connection,
    ) -> Result<Self> {
        let needs_tls = peer_config
            .source
            .iter()
            .any(|s| matches!(SourceAddr::parse(s), SourceAddr::Tls(_)));
        let tls = if needs_tls {
            Some(TlsConnector::from(Arc::new(client_tls_config(peer_config)?)))
        } else {
            None
        };
        Ok(Self {
            connect_timeout,
            net_timeout,
            tls,
        })
    }

    pub async fn connect(&self, source: &SourceAddr) -> Result<BoxStream> {
        let fut = self.connect_inner(source);
        timeout(self.connect_timeout, fut)
            .await
            .map_err(|_| Error::Timeout("connect"))?
    }

    async fn connect_inner(&self, source: &SourceAddr) -> Result<BoxStream> {
        match source {
            SourceAddr::Unix(path) => {
                let stream = UnixStream::connect(path).await.map_err(|e| Error::Connect {
                    addr: path.display().to_string(),
                    source: e,
                })?;
                Ok(Box::new(stream))
            }
            SourceAddr::Tcp(addr) => {
                let stream = TcpStream::connect(addr).await.map_err(|e| Error::Connect {
                    addr: addr.clone(),
                    source: e,
                })?;
                stream.set_nodelay(true).ok();
                Ok(Box::new(stream))
            }
            SourceAddr::Tls(addr) => {
                let connector = self
                    .tls
                    .as_ref()
                    .ok_or_else(|| Error::Config(format!("no tls config for {addr}")))?;
                let stream = TcpStream::connect(addr).await.map_err(|e| Error::Connect {
                    addr: addr.clone(),
                    source: e,
                })?;
                stream.set_nodelay(true).ok();
                let host = addr.split(':').next().unwrap_or(addr).to_string();
                let server_name = ServerName::try_from(host)
                    .map_err(|e| Error::Config(format!("invalid tls host in {addr}: {e}")))?;
                let stream = connector
                    .connect(server_name, stream)
                    .await
                    .map_err(|e| Error::Tls {
                        addr: addr.clone(),
                        source: e,
                    })?;
                Ok(Box::new(stream))
            }
            SourceAddr::Http(url) => Err(Error::Config(format!(
                "http source {url} cannot be used as a socket"
            ))),
        }
    }

    /// One Livestatus exchange. The request must ask for a fixed16 header,
    /// which every request built by the updater and the passthrough path
    /// does. Returns the response body.
    pub async fn request(&self, stream: &mut BoxStream, request: &str) -> Result<Vec<u8>> {
        debug!(len = request.len(), "sending backend request");
        timeout(self.net_timeout, async {
            stream
                .write_all(request.as_bytes())
                .await
                .map_err(Error::Write)?;
            stream.flush().await.map_err(Error::Write)?;
            read_fixed16_response(stream).await
        })
        .await
        .map_err(|_| Error::Timeout("request"))?
    }
}

pub(crate) async fn read_fixed16_response(stream: &mut BoxStream) -> Result<Vec<u8>> {
    let mut header = [0u8; 16];
    stream.read_exact(&mut header).await.map_err(Error::Read)?;
    let text = std::str::from_utf8(&header)
        .map_err(|_| Error::PeerResponseParse("non-utf8 response header".into()))?;
    let code: u16 = text[..3]
        .trim()
        .parse()
        .map_err(|_| Error::PeerResponseParse(format!("bad response header: {text:?}")))?;
    let length: usize = text[3..15]
        .trim()
        .parse()
        .map_err(|_| Error::PeerResponseParse(format!("bad response header: {text:?}")))?;
    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).await.map_err(Error::Read)?;
    if code != 200 {
        return Err(Error::Response {
            code,
            message: String::from_utf8_lossy(&body).trim_end().to_string(),
        });
    }
    Ok(body)
}

fn client_tls_config(peer_config: &Connection) -> Result<rustls::ClientConfig> {
    let ca_path = peer_config.tls_ca.as_deref().ok_or_else(|| {
        Error::Config(format!(
            "connection {:?} uses tls:// but sets no tls_ca",
            peer_config.id
        ))
    })?;
    let mut roots = rustls::RootCertStore::empty();
    for cert in load_certs(ca_path)? {
        roots
            .add(cert)
            .map_err(|e| Error::Config(format!("invalid ca in {ca_path}: {e}")))?;
    }
    let builder = rustls::ClientConfig::builder().with_root_certificates(roots);
    let config = match (&peer_config.tls_certificate, &peer_config.tls_key) {
        (Some(cert_path), Some(key_path)) => {
            let certs = load_certs(cert_path)?;
            let key = load_key(key_path)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| Error::Config(format!("invalid client cert: {e}")))?
        }
        _ => builder.with_no_client_auth(),
    };
    Ok(config)
}

pub(crate) fn load_certs(path: &str) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let data = std::fs::read(path)
        .map_err(|e| Error::Config(format!("cannot read certificate {path}: {e}")))?;
    rustls_pemfile::certs(&mut data.as_slice())
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| Error::Config(format!("invalid certificate {path}: {e}")))
}

pub(crate) fn load_key(path: &str) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let data = std::fs::read(path)
        .map_err(|e| Error::Config(format!("cannot read key {path}: {e}")))?;
    rustls_pemfile::private_key(&mut data.as_slice())
        .map_err(|e| Error::Config(format!("invalid key {path}: {e}")))?
        .ok_or_else(|| Error::Config(format!("no private key in {path}")))
}
