use crate::bind;
use crate::call::{CallArgs, CallSpec};
use crate::cluster::{Cluster, RemoteConn, ResultSet};
use crate::config::ClusterConfig;
use crate::conn;
use crate::fsm::ConnState;
use crate::host::Host;
use crate::route;
use anyhow::{bail, Result};
use common::ScatterError;
use protocol::poll::{Interest, PollEvent};
use protocol::{ExecStatus, Link, Transport};
use smol_str::format_smolstr;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// The tick keeps timeout and cancellation checks running even when no
/// socket reports anything.
const POLL_TICK: Duration = Duration::from_secs(1);

/// Select partitions and run the call's query on them.
///
/// The cluster is exclusively held for the duration: concurrent entry
/// fails fast, and the busy flag is released on every exit path. On
/// failure all per-call state is cleared and, for a host cancellation,
/// a best-effort cancel is fanned out to the in-flight backends first.
pub fn execute<T: Transport, H: Host>(
    cluster: &mut Cluster<T>,
    host: &mut H,
    func: &CallSpec,
    args: &CallArgs,
) -> Result<ResultSet> {
    if cluster.busy {
        bail!(ScatterError::Busy(cluster.name.clone()));
    }
    cluster.busy = true;
    let outcome = run_call(cluster, host, func, args);
    if let Err(err) = &outcome {
        // A canceled or timed-out call leaves backends still working on
        // our query; tell them to stop before cleaning up.
        if matches!(
            err.downcast_ref::<ScatterError>(),
            Some(ScatterError::Canceled | ScatterError::QueryTimeout)
        ) {
            remote_cancel(cluster);
        }
        cluster.clean_results();
    }
    cluster.busy = false;
    outcome
}

fn run_call<T: Transport, H: Host>(
    cluster: &mut Cluster<T>,
    host: &mut H,
    func: &CallSpec,
    args: &CallArgs,
) -> Result<ResultSet> {
    if args.values.len() != func.arg_count {
        bail!(ScatterError::Internal(format_smolstr!(
            "argument count mismatch: {} given, {} declared",
            args.values.len(),
            func.arg_count
        )));
    }

    cluster.clean_results();
    route::prepare_and_tag(cluster, host, func, args)?;
    bind::bind_parameters(cluster, host, func, args)?;
    remote_execute(cluster, host, func)
}

/// Run the query on all tagged connections in parallel.
fn remote_execute<T: Transport, H: Host>(
    cluster: &mut Cluster<T>,
    host: &mut H,
    func: &CallSpec,
) -> Result<ResultSet> {
    let now = Instant::now();
    let mut pending = 0usize;
    {
        let Cluster {
            ref mut conns,
            ref mut transport,
            ref config,
            ..
        } = *cluster;
        for conn in conns.iter_mut() {
            if !conn.is_armed() {
                continue;
            }
            conn::prepare_conn(transport, config, conn, now)?;
            pending += 1;
            if conn.state() == ConnState::Ready {
                conn::send_query(host, config, func, conn, now)?;
            }
        }
    }

    while pending > 0 {
        host.check_interrupts()?;
        poll_conns(cluster, host, func)?;

        // Recheck every armed connection: submit on fresh Ready (login or
        // tuning finished), count what is still in flight, enforce
        // deadlines.
        pending = 0;
        let now = Instant::now();
        let Cluster {
            ref mut conns,
            ref config,
            ..
        } = *cluster;
        for conn in conns.iter_mut() {
            if !conn.is_armed() {
                continue;
            }
            if conn.state() == ConnState::Ready {
                conn::send_query(host, config, func, conn, now)?;
            }
            if conn.state() != ConnState::Done {
                pending += 1;
            }
            check_timeouts(config, conn, now)?;
        }
    }

    // Review results: the armed/result pairing must be total and
    // injective, and every result a TUPLES_OK one.
    let mut set = ResultSet::default();
    for conn in &mut cluster.conns {
        if conn.is_armed() != conn.res.is_some() {
            bail!(ScatterError::Internal("run_tag does not match result".into()));
        }
        if !conn.is_armed() {
            continue;
        }
        if conn.state() != ConnState::Done {
            bail!(ScatterError::Internal("unfinished connection".into()));
        }
        let Some(res) = conn.res.take() else {
            bail!(ScatterError::Internal("lost result".into()));
        };
        if res.status != ExecStatus::TuplesOk {
            bail!(ScatterError::Remote(func.name.clone(), res.error.clone()));
        }
        set.push(res);
        conn.reset_call_state();
    }
    debug!(
        target = "executor::execute",
        total = set.total_rows(),
        "call finished"
    );
    Ok(set)
}

/// One poll-loop iteration: wait for readiness on every armed connection
/// in an I/O state, then advance the ones that reported an event.
/// Returns 0 on an empty tick.
fn poll_conns<T: Transport, H: Host>(
    cluster: &mut Cluster<T>,
    host: &mut H,
    func: &CallSpec,
) -> Result<u32> {
    let Cluster {
        ref mut conns,
        ref mut transport,
        ..
    } = *cluster;

    let mut entries: Vec<PollEvent> = Vec::new();
    let mut owners: Vec<usize> = Vec::new();
    for (i, conn) in conns.iter().enumerate() {
        if !conn.is_armed() {
            continue;
        }
        let interest = match conn.state() {
            ConnState::ConnectRead | ConnState::QueryRead => Interest::Read,
            ConnState::ConnectWrite | ConnState::QueryWrite => Interest::Write,
            ConnState::Disconnected | ConnState::Ready | ConnState::Done => continue,
        };
        let Some(link) = conn.link.as_ref() else {
            bail!(ScatterError::Internal("armed connection without a link".into()));
        };
        entries.push(PollEvent::new(link.socket(), interest));
        owners.push(i);
    }

    if transport.wait(&mut entries, POLL_TICK)? == 0 {
        return Ok(0);
    }

    for (entry, idx) in entries.iter().zip(&owners) {
        if entry.ready {
            conn::handle_conn(host, func, &mut conns[*idx])?;
        }
    }
    Ok(1)
}

/// Abort the call when a connection sits in a phase past its deadline.
fn check_timeouts<L: Link>(
    config: &ClusterConfig,
    conn: &RemoteConn<L>,
    now: Instant,
) -> Result<()> {
    match conn.state() {
        ConnState::ConnectRead | ConnState::ConnectWrite => {
            if config.connect_timeout <= 0 {
                return Ok(());
            }
            let elapsed = conn
                .connect_time
                .map(|t| now.duration_since(t).as_secs() as i64)
                .unwrap_or(0);
            if elapsed <= config.connect_timeout {
                return Ok(());
            }
            bail!(ScatterError::ConnectTimeout(conn.connstr.clone()));
        }
        ConnState::QueryRead | ConnState::QueryWrite => {
            if config.query_timeout <= 0 {
                return Ok(());
            }
            let elapsed = conn
                .query_time
                .map(|t| now.duration_since(t).as_secs() as i64)
                .unwrap_or(0);
            if elapsed <= config.query_timeout {
                return Ok(());
            }
            bail!(ScatterError::QueryTimeout);
        }
        ConnState::Disconnected | ConnState::Ready | ConnState::Done => Ok(()),
    }
}

/// Ask every backend still working on our query to stop. Best effort:
/// failures are logged, never escalated.
fn remote_cancel<T: Transport>(cluster: &mut Cluster<T>) {
    for conn in &mut cluster.conns {
        if matches!(
            conn.state(),
            ConnState::Disconnected | ConnState::Ready | ConnState::Done
        ) {
            continue;
        }
        match conn.link.as_mut() {
            None => warn!(
                target = "executor::execute",
                connstr = %conn.connstr,
                "no link to cancel"
            ),
            Some(link) => {
                if let Err(err) = link.request_cancel() {
                    warn!(
                        target = "executor::execute",
                        connstr = %conn.connstr,
                        error = %err,
                        "cancel query failed"
                    );
                }
            }
        }
    }
}
