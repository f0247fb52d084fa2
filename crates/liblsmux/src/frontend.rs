use std::sync::Arc;
use std::time::Instant;

use livestatus::{frame_response, Request, ResponseHeader};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::query;
use crate::session::Session;

/// Drive one frontend connection: read requests until the client closes,
/// keepalive is off, or the idle timeout fires.
pub(crate) async fn handle_client<S>(stream: S, session: Arc<Session>) -> anyhow::Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
{
    session.count_frontend_connection();
    let config = session.config();
    let (read_half, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    loop {
        let text = match timeout(config.listen_timeout(), read_request(&mut reader)).await {
            Err(_) => {
                debug!("client idle timeout");
                return Ok(());
            }
            Ok(Err(e)) => {
                debug!(error = %e, "client read failed");
                return Ok(());
            }
            Ok(Ok(None)) => return Ok(()),
            Ok(Ok(Some(text))) => text,
        };
        session.count_frontend_received(text.len());

        let request = match Request::parse(&text) {
            Ok(request) => request,
            Err(e) => {
                // The parse failed, so whether fixed16 was requested is
                // only visible in the raw text.
                let header = if text.contains("ResponseHeader: fixed16") {
                    ResponseHeader::Fixed16
                } else {
                    ResponseHeader::Off
                };
                let body = format!("{e}\n").into_bytes();
                let reply = frame_response(header, 400, &body);
                writer.write_all(&reply).await.ok();
                writer.flush().await.ok();
                session.count_frontend_sent(reply.len());
                return Ok(());
            }
        };
        let keepalive = request.keepalive;
        if let Some(localtime) = request.localtime {
            let skew = (crate::unix_now() - localtime).abs();
            if skew > 10 {
                warn!(skew, "client clock differs");
            }
        }

        let started = Instant::now();
        // Abandon the query if the client hangs up while we work on it;
        // bytes of a pipelined next request are left unconsumed.
        let disconnected = async {
            loop {
                match reader.fill_buf().await {
                    Ok(buf) if buf.is_empty() => return,
                    Ok(_) => std::future::pending::<()>().await,
                    Err(_) => return,
                }
            }
        };
        let response = tokio::select! {
            response = query::respond(&session, &request) => response,
            _ = disconnected => {
                debug!("client disconnected mid-query");
                return Ok(());
            }
        };
        let (code, body) = match response {
            Ok((code, body)) => (code, body),
            Err(e) => (e.status_code(), format!("{e}\n").into_bytes()),
        };
        let elapsed = started.elapsed();
        if elapsed.as_secs() >= config.log_slow_query_threshold {
            warn!(
                elapsed = ?elapsed,
                request = text.trim_end(),
                "slow query"
            );
        }

        let reply = frame_response(request.response_header, code, &body);
        writer.write_all(&reply).await?;
        writer.flush().await?;
        session.count_frontend_sent(reply.len());

        if !keepalive {
            return Ok(());
        }
    }
}

/// Read one request: lines up to a blank line, or a single COMMAND line,
/// which is complete on its own. None means the client closed before
/// sending anything.
async fn read_request<R>(reader: &mut R) -> std::io::Result<Option<String>>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut text = String::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok((!text.is_empty()).then_some(text));
        }
        let is_blank = line.trim_end_matches(['\r', '\n']).is_empty();
        if is_blank {
            if text.is_empty() {
                continue;
            }
            return Ok(Some(text));
        }
        text.push_str(&line);
        if text.starts_with("COMMAND ") {
            return Ok(Some(text));
        }
    }
}
