use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, UnixListener};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug_span, error_span, info, warn};

use crate::config::Config;
use crate::connector::{load_certs, load_key, SourceAddr};
use crate::frontend;
use crate::session::Session;
use crate::spawn_utils::spawn_with_cancel;
use crate::{Error, Result};

/// Bind every configured frontend endpoint and spawn its accept loop.
pub(crate) async fn start_listeners(session: &Arc<Session>) -> Result<Vec<JoinHandle<()>>> {
    let config = session.config();
    let needs_tls = config
        .listen
        .iter()
        .any(|e| matches!(SourceAddr::parse(e), SourceAddr::Tls(_)));
    let acceptor = if needs_tls {
        Some(TlsAcceptor::from(Arc::new(server_tls_config(&config)?)))
    } else {
        None
    };

    let mut handles = Vec::new();
    for endpoint in &config.listen {
        let span = error_span!("listen", addr = endpoint);
        let cancel = session.cancellation_token();
        let handle = match SourceAddr::parse(endpoint) {
            SourceAddr::Unix(path) => {
                // A stale socket from a previous run blocks the bind.
                match std::fs::remove_file(&path) {
                    Ok(()) => warn!(path = %path.display(), "removed stale socket"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(Error::Config(format!(
                            "cannot remove stale socket {}: {e}",
                            path.display()
                        )))
                    }
                }
                let listener = UnixListener::bind(&path).map_err(|e| {
                    Error::Config(format!("cannot listen on {}: {e}", path.display()))
                })?;
                info!(path = %path.display(), "listening for client connections");
                let session = session.clone();
                spawn_with_cancel(span, cancel, async move {
                    accept_unix(listener, session).await
                })
            }
            SourceAddr::Tcp(addr) => {
                let listener = TcpListener::bind(&addr)
                    .await
                    .map_err(|e| Error::Config(format!("cannot listen on {addr}: {e}")))?;
                info!(addr, "listening for client connections");
                let session = session.clone();
                spawn_with_cancel(span, cancel, async move {
                    accept_tcp(listener, session, None).await
                })
            }
            SourceAddr::Tls(addr) => {
                let listener = TcpListener::bind(&addr)
                    .await
                    .map_err(|e| Error::Config(format!("cannot listen on {addr}: {e}")))?;
                let acceptor = acceptor.clone().expect("built above");
                info!(addr, "listening for tls client connections");
                let session = session.clone();
                spawn_with_cancel(span, cancel, async move {
                    accept_tcp(listener, session, Some(acceptor)).await
                })
            }
            SourceAddr::Http(url) => {
                return Err(Error::Config(format!("cannot listen on http url {url}")))
            }
        };
        handles.push(handle);
    }
    Ok(handles)
}

async fn accept_unix(listener: UnixListener, session: Arc<Session>) -> anyhow::Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => spawn_client(&session, stream),
            Err(e) => {
                // Usually fd exhaustion; back off instead of spinning.
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn accept_tcp(
    listener: TcpListener,
    session: Arc<Session>,
    acceptor: Option<TlsAcceptor>,
) -> anyhow::Result<()> {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        stream.set_nodelay(true).ok();
        match &acceptor {
            None => spawn_client(&session, stream),
            Some(acceptor) => match acceptor.accept(stream).await {
                Ok(stream) => spawn_client(&session, stream),
                Err(e) => warn!(%addr, error = %e, "tls handshake failed"),
            },
        }
    }
}

fn spawn_client<S>(session: &Arc<Session>, stream: S)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let session = session.clone();
    let cancel = session.cancellation_token();
    spawn_with_cancel(debug_span!("client"), cancel, async move {
        frontend::handle_client(stream, session).await
    });
}

fn server_tls_config(config: &Config) -> Result<rustls::ServerConfig> {
    let cert_path = config
        .tls_certificate
        .as_deref()
        .ok_or_else(|| Error::Config("tls listener without TLSCertificate".into()))?;
    let key_path = config
        .tls_key
        .as_deref()
        .ok_or_else(|| Error::Config("tls listener without TLSKey".into()))?;
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let builder = rustls::ServerConfig::builder();
    let builder = if config.tls_client_pems.is_empty() {
        builder.with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        for pem in &config.tls_client_pems {
            for cert in load_certs(pem)? {
                roots
                    .add(cert)
                    .map_err(|e| Error::Config(format!("invalid client pem {pem}: {e}")))?;
            }
        }
        let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| Error::Config(format!("cannot build client verifier: {e}")))?;
        builder.with_client_cert_verifier(verifier)
    };
    builder
        .with_single_cert(certs, key)
        .map_err(|e| Error::Config(format!("invalid server certificate: {e}")))
}
