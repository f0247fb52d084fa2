use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::Connection;
use crate::{Error, Result};

/// Livestatus-over-HTTP transport. Queries travel as a JSON envelope in
/// the POST form field `data`; the remote side either honors our
/// `Accept: application/livestatus` and replies with the raw wire bytes,
/// or wraps them in a `{rc, output}` JSON object.
pub struct HttpTunnel {
    client: reqwest::Client,
    url: String,
    credential: String,
    remote_name: Option<String>,
}

#[derive(Serialize)]
struct Envelope<'a> {
    credential: &'a str,
    options: EnvelopeOptions<'a>,
}

#[derive(Serialize)]
struct EnvelopeOptions<'a> {
    action: &'a str,
    sub: &'a str,
    args: Vec<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    backends: Option<Vec<&'a str>>,
}

#[derive(Deserialize)]
struct WrappedReply {
    rc: i64,
    #[serde(default)]
    output: Vec<serde_json::Value>,
}

/// A site announced by a federated peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubPeerInfo {
    pub id: String,
    pub name: String,
    pub section: String,
}

impl HttpTunnel {
    pub fn new(config: &Connection, connect_timeout: Duration, net_timeout: Duration) -> Result<Self> {
        let url = config
            .source
            .iter()
            .find(|s| s.starts_with("http://") || s.starts_with("https://"))
            .cloned()
            .ok_or_else(|| {
                Error::Config(format!(
                    "http connection {:?} has no http source",
                    config.id
                ))
            })?;
        let mut builder = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(net_timeout);
        if let Some(ca) = &config.tls_ca {
            let pem = std::fs::read(ca)
                .map_err(|e| Error::Config(format!("cannot read tls_ca {ca}: {e}")))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| Error::Config(format!("invalid tls_ca {ca}: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder
            .build()
            .map_err(|e| Error::Config(format!("cannot build http client: {e}")))?;
        Ok(Self {
            client,
            url,
            credential: config.auth.clone().unwrap_or_default(),
            remote_name: config.remote_name.clone(),
        })
    }

    /// Send one raw Livestatus request. `remote_id` routes to a specific
    /// sub-site behind a federated endpoint.
    pub async fn raw_query(&self, raw: &str, remote_id: Option<&str>) -> Result<Vec<u8>> {
        let body = self
            .exchange("raw", "_raw_query", vec![raw], remote_id)
            .await?;
        strip_fixed16(body)
    }

    pub async fn discover_sub_peers(&self) -> Result<Vec<SubPeerInfo>> {
        let body = self.exchange("raw", "get_processinfo", vec![], None).await?;
        let parsed: serde_json::Value = serde_json::from_slice(&body)
            .map_err(|e| Error::PeerResponseParse(format!("bad processinfo: {e}")))?;
        let map = parsed
            .as_object()
            .ok_or_else(|| Error::PeerResponseParse("processinfo is not an object".into()))?;
        let mut peers: Vec<SubPeerInfo> = map
            .iter()
            .map(|(id, info)| SubPeerInfo {
                id: id.clone(),
                name: info
                    .get("peer_name")
                    .or_else(|| info.get("name"))
                    .and_then(|v| v.as_str())
                    .unwrap_or(id)
                    .to_string(),
                section: info
                    .get("section")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
            })
            .collect();
        // A configured remote_name pins the connection to one announced
        // site instead of the whole federation.
        if let Some(remote) = &self.remote_name {
            peers.retain(|p| &p.id == remote || &p.name == remote);
        }
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(peers)
    }

    async fn exchange(
        &self,
        action: &str,
        sub: &str,
        args: Vec<&str>,
        remote_id: Option<&str>,
    ) -> Result<Vec<u8>> {
        let envelope = Envelope {
            credential: &self.credential,
            options: EnvelopeOptions {
                action,
                sub,
                args,
                backends: remote_id.map(|id| vec![id]),
            },
        };
        let payload = serde_json::to_string(&envelope)
            .map_err(|e| Error::PeerResponseParse(format!("cannot encode envelope: {e}")))?;

        let send = || async {
            self.client
                .post(&self.url)
                .header(reqwest::header::ACCEPT, "application/livestatus")
                .form(&[("data", payload.as_str())])
                .send()
                .await?
                .error_for_status()
        };
        // Transient gateway hiccups are common in front of federated
        // sites, one retry round covers them without masking real outages.
        let response = send
            .retry(ExponentialBuilder::default().with_max_times(2))
            .await?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let bytes = response.bytes().await?;
        debug!(len = bytes.len(), content_type, "tunnel reply");

        if content_type.starts_with("application/livestatus") {
            return Ok(bytes.to_vec());
        }
        let wrapped: WrappedReply = serde_json::from_slice(&bytes)
            .map_err(|e| Error::PeerResponseParse(format!("bad tunnel reply: {e}")))?;
        if wrapped.rc != 0 {
            return Err(Error::HttpTunnelRc {
                rc: wrapped.rc,
                output: wrapped
                    .output
                    .first()
                    .map(|v| v.to_string())
                    .unwrap_or_default(),
            });
        }
        match wrapped.output.into_iter().next() {
            Some(serde_json::Value::String(s)) => Ok(s.into_bytes()),
            Some(other) => Ok(other.to_string().into_bytes()),
            None => Ok(Vec::new()),
        }
    }
}

/// Tunnelled replies may still carry the fixed16 frame the inner request
/// asked for; unwrap it and surface non-200 codes.
fn strip_fixed16(body: Vec<u8>) -> Result<Vec<u8>> {
    if body.len() < 16 || !body[0].is_ascii_digit() || body[15] != b'\n' {
        return Ok(body);
    }
    let header = match std::str::from_utf8(&body[..16]) {
        Ok(h) => h,
        Err(_) => return Ok(body),
    };
    let (Ok(code), Ok(length)) = (
        header[..3].trim().parse::<u16>(),
        header[3..15].trim().parse::<usize>(),
    ) else {
        return Ok(body);
    };
    if body.len() < 16 + length {
        return Err(Error::PeerResponseParse(format!(
            "truncated tunnel reply: want {length}, have {}",
            body.len() - 16
        )));
    }
    let payload = body[16..16 + length].to_vec();
    if code != 200 {
        return Err(Error::Response {
            code,
            message: String::from_utf8_lossy(&payload).trim_end().to_string(),
        });
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_fixed16_unwraps_frames() {
        let framed = format!("200 {:>11}\n[[1]]\n", 6).into_bytes();
        assert_eq!(strip_fixed16(framed).unwrap(), b"[[1]]\n");
        // Unframed bodies pass through.
        assert_eq!(strip_fixed16(b"[[1]]\n".to_vec()).unwrap(), b"[[1]]\n");
    }

    #[test]
    fn strip_fixed16_surfaces_errors() {
        let framed = format!("404 {:>11}\nno such table\n", 14).into_bytes();
        match strip_fixed16(framed).unwrap_err() {
            Error::Response { code, message } => {
                assert_eq!(code, 404);
                assert_eq!(message, "no such table");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
