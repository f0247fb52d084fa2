use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use livestatus::Request;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::debug;

use crate::config::{Config, Connection};

pub fn setup_test_logging() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "debug");
    }
    let _ = tracing_subscriber::fmt::try_init();
}

/// In-memory state served by a [`MockSite`]. Rows are JSON objects keyed
/// by column name; requested columns the row lacks come back as null.
#[derive(Default)]
pub struct MockSiteState {
    pub tables: HashMap<String, Vec<serde_json::Value>>,
    pub broken_commands: bool,
}

impl MockSiteState {
    pub fn with_hosts(hosts: &[(&str, i64)]) -> Self {
        let mut state = MockSiteState::default();
        state.set_program_start(1700000000);
        state.tables.insert(
            "hosts".into(),
            hosts
                .iter()
                .map(|(name, host_state)| {
                    serde_json::json!({
                        "name": name,
                        "alias": name,
                        "state": host_state,
                        "has_been_checked": 1,
                        "last_check": 1700000100,
                        "last_state_change": 1700000100,
                        "contacts": ["admin"],
                        "groups": ["all"],
                    })
                })
                .collect(),
        );
        state
    }

    pub fn add_services(&mut self, services: &[(&str, &str, i64)]) {
        let rows = services
            .iter()
            .map(|(host, description, svc_state)| {
                serde_json::json!({
                    "host_name": host,
                    "description": description,
                    "state": svc_state,
                    "has_been_checked": 1,
                    "last_check": 1700000100,
                    "last_state_change": 1700000100,
                    "contacts": ["admin"],
                })
            })
            .collect();
        self.tables.insert("services".into(), rows);
    }

    pub fn set_program_start(&mut self, program_start: i64) {
        self.tables.insert(
            "status".into(),
            vec![serde_json::json!({
                "program_start": program_start,
                "last_command_check": 0,
                "last_log_rotation": 0,
                "program_version": "9.9.9",
                "livestatus_version": "mock",
                "nagios_pid": 42,
                "interval_length": 60,
            })],
        );
    }
}

/// A fake Livestatus site listening on a unix socket in a tempdir. Speaks
/// just enough of the protocol to feed the updater: projected columns as
/// json rows with a fixed16 frame, and the usual silence (or complaint)
/// for commands.
pub struct MockSite {
    pub socket: PathBuf,
    pub state: Arc<Mutex<MockSiteState>>,
}

impl MockSite {
    pub fn start(dir: &Path, name: &str, state: MockSiteState) -> MockSite {
        let socket = dir.join(format!("{name}.sock"));
        let listener = UnixListener::bind(&socket).expect("bind mock socket");
        let state = Arc::new(Mutex::new(state));
        let serve_state = state.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let state = serve_state.clone();
                tokio::spawn(async move { serve_connection(stream, state).await });
            }
        });
        MockSite { socket, state }
    }

    pub fn source(&self) -> String {
        self.socket.display().to_string()
    }
}

async fn serve_connection(stream: UnixStream, state: Arc<Mutex<MockSiteState>>) {
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    loop {
        let mut text = String::new();
        loop {
            let mut line = String::new();
            match reader.read_line(&mut line).await {
                Ok(0) => return,
                Ok(_) => {}
                Err(_) => return,
            }
            if line.trim_end().is_empty() {
                break;
            }
            text.push_str(&line);
            if text.starts_with("COMMAND ") {
                break;
            }
        }
        if text.is_empty() {
            return;
        }
        debug!(request = text.trim_end(), "mock site request");

        if text.starts_with("COMMAND ") {
            if text.contains("test_broken") && state.lock().broken_commands {
                writer.write_all(b"400: command broken\n").await.ok();
            }
            // Real cores drop the connection after a command.
            return;
        }

        let reply = match Request::parse(&text) {
            Ok(req) => render_rows(&state, &req),
            Err(e) => {
                let body = format!("{e}\n");
                format!("400 {:>11}\n{body}", body.len()).into_bytes()
            }
        };
        if writer.write_all(&reply).await.is_err() {
            return;
        }
        writer.flush().await.ok();
    }
}

fn render_rows(state: &Mutex<MockSiteState>, req: &Request) -> Vec<u8> {
    let state = state.lock();
    let rows = state
        .tables
        .get(&req.table)
        .cloned()
        .unwrap_or_default();
    let projected: Vec<serde_json::Value> = rows
        .iter()
        .map(|row| {
            serde_json::Value::Array(
                req.columns
                    .iter()
                    .map(|col| row.get(col).cloned().unwrap_or(serde_json::Value::Null))
                    .collect(),
            )
        })
        .collect();
    let mut body = serde_json::to_vec(&serde_json::Value::Array(projected)).unwrap();
    body.push(b'\n');
    let mut reply = format!("200 {:>11}\n", body.len()).into_bytes();
    reply.extend_from_slice(&body);
    reply
}

/// A config with short intervals pointing at the given unix-socket peers.
pub fn test_config(listen: Vec<String>, peers: &[(&str, String)]) -> Config {
    Config {
        listen,
        update_interval: 1,
        connect_timeout: 2,
        net_timeout: 5,
        listen_timeout: 30,
        connections: peers
            .iter()
            .map(|(id, source)| Connection {
                name: format!("site {id}"),
                id: id.to_string(),
                source: vec![source.clone()],
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    }
}

/// Poll until `check` passes or the deadline hits.
pub async fn wait_until(what: &str, timeout: Duration, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
