use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use livestatus::Value;
use tracing::{debug, info, warn};

use crate::catalog::{catalog, Column, Table};
use crate::config::Config;
use crate::connector::{BoxStream, SourceAddr};
use crate::peer::{Peer, PeerState};
use crate::session::Session;
use crate::store::DataTable;
use crate::{unix_now, Error, Result};

/// Failures before Up degrades to Warning / Down.
const WARNING_THRESHOLD: u32 = 1;
const DOWN_THRESHOLD: u32 = 3;
/// Peer-side garbage tolerated before the peer is quarantined as Broken.
const PARSE_ERROR_THRESHOLD: u32 = 3;
/// Seconds subtracted from delta markers to absorb clock skew between us
/// and the peer.
const DELTA_SAFETY_SECS: i64 = 2;

// Capped at ten intervals so a flapping peer is probed at a useful rate.
fn backoff(interval: Duration) -> ExponentialBackoff {
    ExponentialBuilder::new()
        .with_min_delay(interval)
        .with_factor(2.)
        .with_max_delay(interval.saturating_mul(10))
        .without_max_times()
        .build()
}

/// Per-peer refresh driver. Exactly one of these runs per peer at a time;
/// it is the only writer of the peer's tables and status.
pub(crate) struct Updater {
    peer: Arc<Peer>,
    session: Weak<Session>,
    config: Arc<Config>,
    /// Kept-alive backend connection, dropped on any error.
    conn: Option<BoxStream>,
    recorded_program_start: i64,
    /// Lower bound for the next delta filter, in peer-clock seconds.
    delta_time: i64,
    last_full: i64,
    /// (row count, max id) per id-keyed table, to detect membership moves.
    id_signatures: HashMap<&'static str, (usize, i64)>,
    /// Columns this peer rejected, per table.
    unsupported: HashMap<&'static str, HashSet<&'static str>>,
    failures: u32,
    parse_errors: u32,
    backoff: ExponentialBackoff,
}

impl Updater {
    pub fn new(peer: Arc<Peer>, session: Weak<Session>, config: Arc<Config>) -> Self {
        let backoff = backoff(config.update_interval());
        Self {
            peer,
            session,
            config,
            conn: None,
            recorded_program_start: 0,
            delta_time: 0,
            last_full: 0,
            id_signatures: HashMap::new(),
            unsupported: HashMap::new(),
            failures: 0,
            parse_errors: 0,
            backoff,
        }
    }

    fn reset_backoff(&mut self) {
        self.backoff = backoff(self.config.update_interval());
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        loop {
            if self.peer.cancel.is_cancelled() {
                return Ok(());
            }
            let started = Instant::now();
            match self.tick().await {
                Ok(()) => {
                    self.failures = 0;
                    self.reset_backoff();
                    let now = unix_now();
                    self.peer.with_status_mut(|st| {
                        st.state = PeerState::Up;
                        st.last_error.clear();
                        st.last_update = now;
                        st.last_online = now;
                        st.response_time = started.elapsed().as_secs_f64();
                    });
                }
                Err(e) => {
                    if self.handle_failure(e) {
                        // Broken peers sit still until the next reload.
                        self.peer.cancel.cancelled().await;
                        return Ok(());
                    }
                }
            }
            let delay = self.next_delay();
            tokio::select! {
                _ = self.peer.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn tick(&mut self) -> Result<()> {
        if self.peer.parent_id.is_none()
            && self.peer.is_http()
            && self.peer.config.has_flag("MultiBackend")
        {
            return self.discover_sub_peers().await;
        }

        let now = unix_now();
        let program_start = self.refresh_status(now).await?;

        let full_due = self.config.full_update_interval > 0
            && now - self.last_full >= self.config.full_update_interval as i64;
        if self.recorded_program_start == 0
            || program_start != self.recorded_program_start
            || full_due
        {
            if self.recorded_program_start != 0 && program_start != self.recorded_program_start {
                info!(
                    peer = self.peer.id,
                    program_start, "site restarted, forcing full refresh"
                );
            }
            self.full_refresh(program_start, now).await?;
        } else {
            self.delta_refresh(now).await?;
        }
        self.peer.refresh_notify.notify_waiters();
        Ok(())
    }

    /// Refresh the status table and mirror the interesting bits into the
    /// peer status. Returns the peer's program_start.
    async fn refresh_status(&mut self, now: i64) -> Result<i64> {
        let table = catalog().table("status").expect("status table exists");
        let (rows, columns) = self.fetch_table(table, "").await?;
        let dt = DataTable::from_rows(table, columns, rows, now);
        let get = |col: &str| -> Value {
            table
                .column(col)
                .and_then(|c| dt.value_at(0, c))
                .unwrap_or(Value::Nil)
        };
        if dt.row_count() != 1 {
            return Err(Error::PeerResponseParse(format!(
                "status table has {} rows",
                dt.row_count()
            )));
        }
        let program_start = get("program_start").as_int().unwrap_or(0);
        let last_command_check = get("last_command_check").as_int().unwrap_or(0);
        let last_log_rotation = get("last_log_rotation").as_int().unwrap_or(0);
        let version = match (get("program_version"), get("livestatus_version")) {
            (Value::Str(p), Value::Str(l)) if !p.is_empty() => format!("{p} ({l})"),
            (_, Value::Str(l)) => l,
            _ => String::new(),
        };
        self.peer.set_table("status", dt);
        self.peer.with_status_mut(|st| {
            st.program_start = program_start;
            st.last_command_check = last_command_check;
            st.last_log_rotation = last_log_rotation;
            st.core_version = version;
        });
        Ok(program_start)
    }

    async fn full_refresh(&mut self, program_start: i64, now: i64) -> Result<()> {
        // Mark before fetching so changes racing the fetch are re-read by
        // the first delta instead of lost.
        let next_delta_time = now - DELTA_SAFETY_SECS;
        for table in catalog().tables().iter().filter(|t| t.is_fetched()) {
            if table.name == "status" {
                continue;
            }
            let (rows, columns) = self.fetch_table(table, "").await?;
            if let Some(sig) = id_signature(table, &columns, &rows) {
                self.id_signatures.insert(table.name, sig);
            }
            let dt = DataTable::from_rows(table, columns, rows, now);
            debug!(peer = self.peer.id, table = table.name, rows = dt.row_count(), "full refresh");
            self.peer.set_table(table.name, dt);
        }
        self.recorded_program_start = program_start;
        self.last_full = now;
        self.delta_time = next_delta_time;
        self.peer.with_status_mut(|st| st.last_full_update = now);
        Ok(())
    }

    async fn delta_refresh(&mut self, now: i64) -> Result<()> {
        let since = self.delta_time - DELTA_SAFETY_SECS;
        let next_delta_time = now;
        for table in catalog().tables().iter().filter(|t| t.is_fetched()) {
            if table.name == "status" {
                continue;
            }
            let Some(handle) = self.peer.table(table.name) else {
                continue;
            };
            if table.has_change_markers() {
                let filter = format!(
                    "Filter: last_check >= {since}\nFilter: last_state_change >= {since}\nOr: 2\n"
                );
                let (rows, columns) = self.fetch_delta_columns(table, &filter).await?;
                let updated = handle.write().apply_delta(&columns, &rows, now);
                debug!(peer = self.peer.id, table = table.name, updated, "delta refresh");
            } else if table.primary_key == ["id"] {
                // No change markers on comments and downtimes; re-fetch
                // them whole when their id set moved.
                if self.id_set_changed(table).await? {
                    let (rows, columns) = self.fetch_table(table, "").await?;
                    if let Some(sig) = id_signature(table, &columns, &rows) {
                        self.id_signatures.insert(table.name, sig);
                    }
                    let dt = DataTable::from_rows(table, columns, rows, now);
                    info!(peer = self.peer.id, table = table.name, rows = dt.row_count(), "id set changed, re-fetched");
                    self.peer.set_table(table.name, dt);
                }
            } else if table.dynamic_columns().next().is_some() {
                // Small tables with dynamic state (timeperiods, contacts)
                // are cheap enough to refresh unfiltered.
                let (rows, columns) = self.fetch_delta_columns(table, "").await?;
                handle.write().apply_delta(&columns, &rows, now);
            }
        }
        self.delta_time = next_delta_time;
        Ok(())
    }

    async fn id_set_changed(&mut self, table: &'static Table) -> Result<bool> {
        let id_col = table.column("id").expect("id-keyed table has id");
        let columns = vec![id_col];
        let request = build_request(table.name, &columns, "");
        let body = self.exchange(&request).await?;
        let rows = decode_rows(&body, &columns)?;
        let sig = id_signature(table, &columns, &rows).unwrap_or((0, 0));
        Ok(self.id_signatures.get(table.name) != Some(&sig))
    }

    /// Fetch all fetchable columns of a table, probing away columns the
    /// peer rejects. Returns the rows plus the column set they arrived in.
    async fn fetch_table(
        &mut self,
        table: &'static Table,
        extra_headers: &str,
    ) -> Result<(Vec<Vec<Value>>, Vec<&'static Column>)> {
        let columns: Vec<&'static Column> = table
            .fetchable_columns()
            .filter(|c| !self.is_unsupported(table.name, c.name))
            .collect();
        self.fetch_with_probing(table, columns, extra_headers).await
    }

    /// Fetch natural key plus dynamic columns only.
    async fn fetch_delta_columns(
        &mut self,
        table: &'static Table,
        extra_headers: &str,
    ) -> Result<(Vec<Vec<Value>>, Vec<&'static Column>)> {
        let mut columns: Vec<&'static Column> = table
            .primary_key
            .iter()
            .filter_map(|k| table.column(k))
            .collect();
        for col in table.dynamic_columns() {
            if !columns.iter().any(|c| c.name == col.name)
                && !self.is_unsupported(table.name, col.name)
            {
                columns.push(col);
            }
        }
        self.fetch_with_probing(table, columns, extra_headers).await
    }

    async fn fetch_with_probing(
        &mut self,
        table: &'static Table,
        mut columns: Vec<&'static Column>,
        extra_headers: &str,
    ) -> Result<(Vec<Vec<Value>>, Vec<&'static Column>)> {
        // A handful of probe rounds is plenty; anything beyond that is not
        // a column problem.
        for _ in 0..10 {
            let request = build_request(table.name, &columns, extra_headers);
            match self.exchange(&request).await {
                Ok(body) => {
                    let rows = decode_rows(&body, &columns)?;
                    return Ok((rows, columns));
                }
                Err(Error::Response { code: 400, message }) => {
                    let Some(pos) = columns.iter().position(|c| {
                        !table.primary_key.contains(&c.name) && names_column(&message, c.name)
                    }) else {
                        return Err(Error::Response { code: 400, message });
                    };
                    let dropped = columns.remove(pos);
                    warn!(
                        peer = self.peer.id,
                        table = table.name,
                        column = dropped.name,
                        "peer does not expose column, dropping"
                    );
                    self.unsupported
                        .entry(table.name)
                        .or_default()
                        .insert(dropped.name);
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::PeerResponseParse(format!(
            "peer keeps rejecting columns of table {}",
            table.name
        )))
    }

    fn is_unsupported(&self, table: &'static str, column: &str) -> bool {
        self.unsupported
            .get(table)
            .map(|set| set.contains(column))
            .unwrap_or(false)
    }

    /// One request/response against this peer, over whichever transport it
    /// uses, with source failover for socket peers.
    async fn exchange(&mut self, request: &str) -> Result<Vec<u8>> {
        if let Some(tunnel) = &self.peer.tunnel {
            let body = tunnel
                .raw_query(request, self.peer.remote_id.as_deref())
                .await?;
            self.peer.count_sent(request.len());
            self.peer.count_received(body.len());
            return Ok(body);
        }

        let connector = self.peer.connector.clone().ok_or(Error::PeerNotReady)?;
        if self.conn.is_none() {
            let mut last_err = Error::PeerNotReady;
            for (idx, source) in self.peer.config.source.iter().enumerate() {
                match connector.connect(&SourceAddr::parse(source)).await {
                    Ok(stream) => {
                        if self.peer.status_snapshot().active_source != Some(idx) {
                            info!(peer = self.peer.id, source, "connected");
                        }
                        self.peer
                            .with_status_mut(|st| st.active_source = Some(idx));
                        self.conn = Some(stream);
                        break;
                    }
                    Err(e) => {
                        debug!(peer = self.peer.id, source, error = %e, "source failed");
                        last_err = e;
                    }
                }
            }
            if self.conn.is_none() {
                return Err(last_err);
            }
        }

        let mut conn = self.conn.take().expect("connected above");
        match connector.request(&mut conn, request).await {
            Ok(body) => {
                if self.config.backend_keepalive {
                    self.conn = Some(conn);
                }
                self.peer.count_sent(request.len());
                self.peer.count_received(body.len() + 16);
                Ok(body)
            }
            Err(e @ Error::Response { .. }) => {
                // The response was fully read, the stream is still usable.
                if self.config.backend_keepalive {
                    self.conn = Some(conn);
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn discover_sub_peers(&mut self) -> Result<()> {
        let tunnel = self.peer.tunnel.clone().ok_or(Error::PeerNotReady)?;
        let infos = tunnel.discover_sub_peers().await?;
        let session = self.session.upgrade().ok_or(Error::Shutdown)?;
        session.sync_sub_peers(&self.peer, infos)?;
        Ok(())
    }

    /// Returns true when the peer is quarantined and the task must park.
    fn handle_failure(&mut self, error: Error) -> bool {
        self.failures += 1;
        self.conn = None;
        if matches!(error, Error::Parse(_) | Error::PeerResponseParse(_)) {
            self.parse_errors += 1;
        }
        let broken = self.parse_errors > PARSE_ERROR_THRESHOLD;
        let failures = self.failures;
        let stale_after = self.config.stale_backend_timeout as i64;
        let now = unix_now();
        self.peer.with_status_mut(|st| {
            st.last_error = format!("{error}");
            let stale = st.last_online > 0 && now - st.last_online > stale_after;
            st.state = if broken {
                PeerState::Broken
            } else if failures >= DOWN_THRESHOLD || stale {
                PeerState::Down
            } else if st.state == PeerState::Up && failures >= WARNING_THRESHOLD {
                PeerState::Warning
            } else {
                st.state
            };
        });
        warn!(
            peer = self.peer.id,
            failures,
            state = %self.peer.state(),
            error = %error,
            "refresh failed"
        );
        broken
    }

    /// Normal cadence while healthy; while failing, walk the exponential
    /// backoff schedule instead.
    fn next_delay(&mut self) -> Duration {
        let base = self.config.update_interval();
        if self.failures == 0 {
            return base;
        }
        self.backoff
            .next()
            .unwrap_or_else(|| base.saturating_mul(10))
    }
}

fn build_request(table: &str, columns: &[&Column], extra_headers: &str) -> String {
    let names: Vec<&str> = columns.iter().map(|c| c.name).collect();
    format!(
        "GET {table}\nColumns: {}\n{extra_headers}OutputFormat: json\nResponseHeader: fixed16\n\n",
        names.join(" ")
    )
}

fn decode_rows(body: &[u8], columns: &[&'static Column]) -> Result<Vec<Vec<Value>>> {
    let raw: Vec<Vec<serde_json::Value>> = serde_json::from_slice(body)
        .map_err(|e| Error::PeerResponseParse(format!("bad json rows: {e}")))?;
    Ok(raw
        .into_iter()
        .map(|row| {
            columns
                .iter()
                .enumerate()
                .map(|(i, col)| {
                    row.get(i)
                        .map(|cell| col.data_type.value_from_json(cell))
                        .unwrap_or_else(|| col.data_type.empty_value())
                })
                .collect()
        })
        .collect())
}

fn id_signature(
    table: &Table,
    columns: &[&'static Column],
    rows: &[Vec<Value>],
) -> Option<(usize, i64)> {
    if table.primary_key != ["id"] {
        return None;
    }
    let pos = columns.iter().position(|c| c.name == "id")?;
    let max_id = rows
        .iter()
        .filter_map(|r| r.get(pos).and_then(|v| v.as_int()))
        .max()
        .unwrap_or(0);
    Some((rows.len(), max_id))
}

/// True when an error message names exactly this column, not one that
/// merely contains it as a substring.
fn names_column(message: &str, column: &str) -> bool {
    message
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .any(|tok| tok == column)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_name_matching_is_word_exact() {
        let msg = "Table 'hosts' has no column named 'state'";
        assert!(names_column(msg, "state"));
        assert!(!names_column(msg, "last_state_change"));
        assert!(!names_column("no column named 'last_state_change'", "state"));
    }

    #[test]
    fn decode_rows_pads_and_converts() {
        let cat = catalog();
        let cols: Vec<&Column> = vec![
            cat.column("hosts", "name").unwrap(),
            cat.column("hosts", "state").unwrap(),
            cat.column("hosts", "groups").unwrap(),
        ];
        let body = br#"[["web01", 1, ["linux"]], ["web02"]]"#;
        let rows = decode_rows(body, &cols).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][1], Value::Int(1));
        assert_eq!(rows[1][1], Value::Int(0));
        assert_eq!(rows[1][2], Value::StrList(vec![]));
    }

    #[test]
    fn id_signatures_detect_changes() {
        let table = catalog().table("comments").unwrap();
        let cols = vec![table.column("id").unwrap()];
        let a = id_signature(table, &cols, &[vec![Value::Int(1)], vec![Value::Int(2)]]);
        let b = id_signature(table, &cols, &[vec![Value::Int(1)], vec![Value::Int(3)]]);
        assert_ne!(a, b);
        assert_eq!(a, Some((2, 2)));
    }
}
