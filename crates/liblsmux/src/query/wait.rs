use std::sync::Arc;
use std::time::Duration;

use futures::future::select_all;
use livestatus::{Request, WaitTrigger};
use tokio::time::Instant;
use tracing::debug;

use super::exec::with_peer_view;
use crate::catalog::Table;
use crate::peer::Peer;
use crate::session::Session;

/// Longest nap between re-evaluations; refresh notifications usually wake
/// us much earlier.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Block until the WaitCondition matches a row, the timeout elapses, or
/// shutdown. Timeouts are not errors, the query just proceeds against
/// whatever state is there.
pub(super) async fn wait_for_condition(
    session: &Arc<Session>,
    req: &Request,
    table: &'static Table,
) {
    let Some(condition) = &req.wait_condition else {
        return;
    };
    if !table.is_fetched() {
        return;
    }
    let deadline = req
        .wait_timeout_ms
        .map(|ms| Instant::now() + Duration::from_millis(ms));
    let peers = super::select_peers(session, req, false);
    // The trigger narrows which refreshes are worth waking up early for;
    // everything else falls back to the poll cadence.
    let watched = watched_tables(req.wait_trigger, table);
    let mut last_stamp = watched.as_deref().map(|w| category_stamp(&peers, w));

    loop {
        let matched = peers.iter().any(|peer| {
            with_peer_view(peer, table, |view, count| {
                (0..count).any(|row| {
                    if let Some(object) = &req.wait_object {
                        if !object_matches(view.main.natural_key_of(row), object) {
                            return false;
                        }
                    }
                    condition.matches(&|name: &str| view.value(row, name))
                })
            })
            .unwrap_or(false)
        });
        if matched {
            return;
        }

        // Wait for a wakeup that can change the answer.
        loop {
            let mut nap = POLL_INTERVAL;
            if let Some(deadline) = deadline {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    debug!(table = table.name, "wait condition timed out");
                    return;
                }
                nap = nap.min(remaining);
            }

            if peers.is_empty() {
                tokio::time::sleep(nap).await;
                break;
            }
            let notified = select_all(
                peers
                    .iter()
                    .map(|p| Box::pin(p.refresh_notify.notified())),
            );
            tokio::select! {
                _ = notified => {
                    match (&watched, &mut last_stamp) {
                        (Some(w), Some(seen)) => {
                            let stamp = category_stamp(&peers, w);
                            if stamp != *seen {
                                *seen = stamp;
                                break;
                            }
                            // A refresh outside the triggered category,
                            // keep napping.
                        }
                        _ => break,
                    }
                }
                _ = tokio::time::sleep(nap) => break,
                _ = session.cancelled() => return,
            }
        }
    }
}

/// The tables whose refresh can change the triggered category. None means
/// every refresh counts (no trigger, `all`, or categories we hold no
/// local tables for).
fn watched_tables(
    trigger: Option<WaitTrigger>,
    target: &'static Table,
) -> Option<Vec<&'static str>> {
    match trigger? {
        WaitTrigger::All | WaitTrigger::Log => None,
        WaitTrigger::Check | WaitTrigger::State => Some(vec![target.name]),
        WaitTrigger::Command | WaitTrigger::Program => Some(vec!["status"]),
        WaitTrigger::Comment => Some(vec!["comments", target.name]),
        WaitTrigger::Downtime => Some(vec!["downtimes", target.name]),
    }
}

/// Newest refresh stamp across the watched tables of all peers.
fn category_stamp(peers: &[Arc<Peer>], tables: &[&str]) -> i64 {
    let mut stamp = 0;
    for peer in peers {
        for name in tables {
            if let Some(handle) = peer.table(name) {
                stamp = stamp.max(handle.read().last_delta_update);
            }
        }
    }
    stamp
}

/// WaitObject names one host ("web01") or one service ("web01;ping",
/// space accepted as separator too) to scope the condition to.
fn object_matches(key: String, object: &str) -> bool {
    key == object.replace(' ', ";")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::catalog;

    #[test]
    fn wait_object_separator_forms() {
        assert!(object_matches("web01".into(), "web01"));
        assert!(object_matches("web01;ping".into(), "web01;ping"));
        assert!(object_matches("web01;ping".into(), "web01 ping"));
        assert!(!object_matches("web01;ping".into(), "web01"));
    }

    #[test]
    fn trigger_maps_to_watched_tables() {
        let hosts = catalog().table("hosts").unwrap();
        assert_eq!(watched_tables(None, hosts), None);
        assert_eq!(watched_tables(Some(WaitTrigger::All), hosts), None);
        assert_eq!(
            watched_tables(Some(WaitTrigger::Check), hosts),
            Some(vec!["hosts"])
        );
        assert_eq!(
            watched_tables(Some(WaitTrigger::Program), hosts),
            Some(vec!["status"])
        );
        assert_eq!(
            watched_tables(Some(WaitTrigger::Downtime), hosts),
            Some(vec!["downtimes", "hosts"])
        );
    }
}
