mod exec;
mod wait;

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use itertools::Itertools;
use livestatus::{Request, ResultSet, StatsOp, Value};
use tracing::{debug, warn};

use crate::catalog::{catalog, Table};
use crate::peer::Peer;
use crate::session::Session;
use crate::{Error, Result};

pub(crate) use exec::{PeerOutput, StatsGroups};

/// Answer one parsed request. Returns the response status code and body;
/// the caller frames it (fixed16) and writes it out.
pub async fn respond(session: &Arc<Session>, req: &Request) -> Result<(u16, Vec<u8>)> {
    if req.is_command() {
        let replies = run_command(session, req).await?;
        let mut body = Vec::new();
        for line in replies {
            body.extend_from_slice(line.as_bytes());
            body.push(b'\n');
        }
        return Ok((200, body));
    }
    let (code, result) = run_query(session, req).await?;
    if result.rows.len() >= session.config().log_huge_query_threshold as usize {
        warn!(
            table = req.table,
            rows = result.rows.len(),
            "huge query result"
        );
    }
    Ok((code, result.render(req)))
}

/// Route a COMMAND line to every selected peer in parallel. The returned
/// lines are the diagnostics of peers that rejected it, deduplicated.
async fn run_command(session: &Arc<Session>, req: &Request) -> Result<Vec<String>> {
    let line = req.command.as_deref().unwrap_or_default();
    let peers = select_peers(session, req, false);
    if peers.is_empty() {
        return Err(Error::PeerNotFound("no matching backend".into()));
    }
    let results = join_all(peers.iter().map(|peer| {
        let peer = peer.clone();
        async move { (peer.id.clone(), peer.send_command(line).await) }
    }))
    .await;

    let mut replies = Vec::new();
    for (id, result) in results {
        match result {
            Ok(None) => {}
            Ok(Some(reply)) => {
                debug!(peer = id, reply, "command rejected");
                if !replies.contains(&reply) {
                    replies.push(reply);
                }
            }
            Err(e) => {
                warn!(peer = id, error = %e, "command failed");
                let reply = format!("400: {e}");
                if !replies.contains(&reply) {
                    replies.push(reply);
                }
            }
        }
    }
    Ok(replies)
}

pub(crate) async fn run_query(
    session: &Arc<Session>,
    req: &Request,
) -> Result<(u16, ResultSet)> {
    let table = catalog()
        .table(&req.table)
        .ok_or_else(|| Error::UnknownTable(req.table.clone()))?;
    validate_columns(table, req)?;

    if req.wait_condition.is_some() {
        wait::wait_for_condition(session, req, table).await;
    }

    if table.passthrough_only {
        return passthrough_query(session, req, table).await;
    }

    // Federated parents carry no tables of their own, but they are real
    // entries in the backends listing.
    let peers = select_peers(session, req, table.is_virtual);
    let plan = exec::Plan::new(table, req)?;

    // Virtual tables are served from local peer bookkeeping; everything
    // else fans out to per-peer scans over the table snapshots.
    let mut failed = BTreeMap::new();
    let mut hard_failures = 0usize;
    let mut outputs: Vec<PeerOutput> = Vec::new();
    if table.is_virtual {
        outputs.push(exec::scan_local_table(table, &plan, &peers));
    } else {
        let scans = peers.iter().map(|peer| {
            let peer = peer.clone();
            let plan = plan.clone();
            tokio::task::spawn_blocking(move || {
                let out = exec::scan_peer(&peer, &plan);
                (peer, out)
            })
        });
        for joined in join_all(scans).await {
            let (peer, out) = joined.map_err(|e| Error::Anyhow(e.into()))?;
            match out {
                Ok(output) => {
                    peer.count_query();
                    outputs.push(output);
                }
                Err(e) => {
                    // A peer that simply has not completed its first
                    // refresh is reported in the failed map but does not
                    // make the whole response a gateway error.
                    if !matches!(e, Error::PeerNotReady) {
                        hard_failures += 1;
                    }
                    failed.insert(peer.id.clone(), e.to_string());
                }
            }
        }
    }

    let all_failed = !peers.is_empty() && hard_failures == peers.len() && !table.is_virtual;
    let code = if all_failed { 502 } else { 200 };
    let result = merge_outputs(outputs, &plan, req, failed);
    Ok((code, result))
}

fn merge_outputs(
    outputs: Vec<PeerOutput>,
    plan: &exec::Plan,
    req: &Request,
    failed: BTreeMap<String, String>,
) -> ResultSet {
    if !plan.stats.is_empty() {
        return merge_stats(outputs, plan, req, failed);
    }

    let mut rows: Vec<Vec<Value>> = Vec::new();
    for output in outputs {
        if let PeerOutput::Rows(mut r) = output {
            rows.append(&mut r);
        }
    }

    if !req.sort.is_empty() {
        let keys: Vec<(usize, bool)> = req
            .sort
            .iter()
            .filter_map(|s| plan.column_pos(&s.column).map(|pos| (pos, s.desc)))
            .collect();
        rows.sort_by(|a, b| {
            for &(pos, desc) in &keys {
                let ord = a[pos].cmp_values(&b[pos]);
                let ord = if desc { ord.reverse() } else { ord };
                if !ord.is_eq() {
                    return ord;
                }
            }
            std::cmp::Ordering::Equal
        });
    }

    let total_count = rows.len();
    let rows = paginate(rows, req);
    // Strip the sort-only columns appended past the projection.
    let rows = rows
        .into_iter()
        .map(|mut row| {
            row.truncate(plan.output_len);
            row
        })
        .collect();
    ResultSet {
        columns: plan.output_names.clone(),
        rows,
        total_count,
        failed,
    }
}

fn merge_stats(
    outputs: Vec<PeerOutput>,
    plan: &exec::Plan,
    req: &Request,
    failed: BTreeMap<String, String>,
) -> ResultSet {
    let mut merged: StatsGroups = BTreeMap::new();
    for output in outputs {
        let PeerOutput::Stats(groups) = output else {
            continue;
        };
        for (key, (group_values, aggs)) in groups {
            match merged.get_mut(&key) {
                Some((_, dst)) => {
                    for (d, s) in dst.iter_mut().zip(aggs.iter()) {
                        d.merge(s);
                    }
                }
                None => {
                    merged.insert(key, (group_values, aggs));
                }
            }
        }
    }

    let mut rows: Vec<Vec<Value>> = Vec::new();
    if merged.is_empty() && plan.group_columns.is_empty() {
        // No group-by means exactly one result row, even over no matches.
        let row: Vec<Value> = plan
            .stats
            .iter()
            .map(|op| op.new_aggregator().finalize(op))
            .collect();
        rows.push(row);
    } else {
        for (_, (group_values, aggs)) in merged {
            let mut row = group_values;
            for (agg, op) in aggs.iter().zip(plan.stats.iter()) {
                row.push(agg.finalize(op));
            }
            rows.push(row);
        }
    }

    let total_count = rows.len();
    let rows = paginate(rows, req);
    let mut columns = plan.group_columns.clone();
    for (i, _) in plan.stats.iter().enumerate() {
        columns.push(format!("stats_{}", i + 1));
    }
    ResultSet {
        columns,
        rows,
        total_count,
        failed,
    }
}

fn paginate(rows: Vec<Vec<Value>>, req: &Request) -> Vec<Vec<Value>> {
    let mut iter = rows.into_iter().skip(req.offset);
    match req.limit {
        Some(limit) => iter.by_ref().take(limit).collect(),
        None => iter.collect(),
    }
}

async fn passthrough_query(
    session: &Arc<Session>,
    req: &Request,
    table: &'static Table,
) -> Result<(u16, ResultSet)> {
    let peers = select_peers(session, req, false);
    // Project every known column when the client named none, the peers
    // must agree on an explicit order for the merge to make sense.
    let columns: Vec<String> = if req.columns.is_empty() {
        table.columns.iter().map(|c| c.name.to_string()).collect()
    } else {
        req.columns.clone()
    };
    let mut backend_req = req.clone();
    backend_req.columns = columns.clone();
    let raw = backend_req.render_for_backend();

    let net_timeout = session.config().net_timeout();
    let results = join_all(peers.iter().map(|peer| {
        let peer = peer.clone();
        let raw = raw.clone();
        async move {
            let result = tokio::time::timeout(net_timeout, peer.passthrough_query(&raw)).await;
            (peer, result)
        }
    }))
    .await;

    let mut rows: Vec<Vec<Value>> = Vec::new();
    let mut failed = BTreeMap::new();
    let mut ok = 0usize;
    let total_peers = results.len();
    for (peer, result) in results {
        let result = match result {
            Ok(r) => r,
            Err(_) => Err(Error::Timeout("passthrough")),
        };
        match result.and_then(|body| decode_passthrough(&body, table, &columns)) {
            Ok(mut r) => {
                ok += 1;
                rows.append(&mut r);
            }
            Err(e) => {
                failed.insert(peer.id.clone(), e.to_string());
            }
        }
    }

    let total_count = rows.len();
    let rows = paginate(rows, req);
    let code = if ok == 0 && total_peers > 0 { 502 } else { 200 };
    Ok((
        code,
        ResultSet {
            columns,
            rows,
            total_count,
            failed,
        },
    ))
}

fn decode_passthrough(
    body: &[u8],
    table: &'static Table,
    columns: &[String],
) -> Result<Vec<Vec<Value>>> {
    let raw: Vec<Vec<serde_json::Value>> = serde_json::from_slice(body)
        .map_err(|e| Error::PeerResponseParse(format!("bad passthrough rows: {e}")))?;
    let types: Vec<_> = columns
        .iter()
        .map(|name| {
            table
                .column(name)
                .map(|c| c.data_type)
                .unwrap_or(livestatus::DataType::String)
        })
        .collect();
    Ok(raw
        .into_iter()
        .map(|row| {
            types
                .iter()
                .enumerate()
                .map(|(i, dt)| {
                    row.get(i)
                        .map(|cell| dt.value_from_json(cell))
                        .unwrap_or_else(|| dt.empty_value())
                })
                .collect()
        })
        .collect())
}

/// The peer set a request fans out to: configured order, restricted by the
/// Backends header. Federated parents hold no data of their own and only
/// take part when commands are being routed.
fn select_peers(session: &Arc<Session>, req: &Request, include_parents: bool) -> Vec<Arc<Peer>> {
    session
        .peers()
        .into_iter()
        .filter(|p| include_parents || !is_data_less_parent(p))
        .filter(|p| {
            req.backends.is_empty()
                || req.backends.iter().any(|b| b == &p.id)
                || p.parent_id
                    .as_ref()
                    .map(|parent| req.backends.iter().any(|b| b == parent))
                    .unwrap_or(false)
        })
        .sorted_by(|a, b| a.ordinal.cmp(&b.ordinal).then_with(|| a.id.cmp(&b.id)))
        .collect()
}

fn is_data_less_parent(peer: &Arc<Peer>) -> bool {
    peer.parent_id.is_none() && peer.is_http() && peer.config.has_flag("MultiBackend")
}

fn validate_columns(table: &'static Table, req: &Request) -> Result<()> {
    let check = |name: &str| -> Result<()> {
        if table.column(name).is_none() {
            return Err(Error::UnknownColumn {
                table: table.name.to_string(),
                column: name.to_string(),
            });
        }
        Ok(())
    };
    for name in &req.columns {
        check(name)?;
    }
    for sort in &req.sort {
        check(&sort.column)?;
    }
    let mut filter_columns = Vec::new();
    if let Some(f) = &req.filter {
        f.columns(&mut filter_columns);
    }
    if let Some(f) = &req.wait_condition {
        f.columns(&mut filter_columns);
    }
    for op in &req.stats {
        match op {
            StatsOp::Count(f) => f.columns(&mut filter_columns),
            other => {
                if let Some(col) = other.column() {
                    check(col)?;
                }
            }
        }
    }
    for name in &filter_columns {
        check(name)?;
    }
    Ok(())
}
