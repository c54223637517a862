use crate::call::CallSpec;
use crate::cluster::RemoteConn;
use crate::config::{ClusterConfig, IDLE_CONN_CHECK};
use crate::fsm::{ConnEvent, ConnState};
use crate::host::Host;
use anyhow::{bail, Result};
use common::ScatterError;
use protocol::poll::{Interest, PollEvent};
use protocol::{
    ExecStatus, FlushState, Format, Link, LinkStatus, Param, PollingStatus, Transport,
};
use smallvec::SmallVec;
use smol_str::format_smolstr;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Feed one event to the connection's state machine. A refused
/// transition is an engine bug, not a backend failure.
fn step<L: Link>(conn: &mut RemoteConn<L>, event: ConnEvent) -> Result<()> {
    match conn.fsm.consume(&event) {
        Ok(_) => Ok(()),
        Err(_) => bail!(ScatterError::Internal(format_smolstr!(
            "invalid transition {event:?} from {:?}",
            conn.state()
        ))),
    }
}

fn conn_error<L: Link>(conn: &RemoteConn<L>, desc: &str) -> anyhow::Error {
    let msg = conn
        .link
        .as_ref()
        .map(|l| l.error_message())
        .unwrap_or_default();
    ScatterError::Connection(format_smolstr!("{desc}: {msg}")).into()
}

/// Compare version strings at major.minor; the patch component and
/// anything after the second dot is ignored.
pub(crate) fn cmp_branch(this: &str, that: &str) -> bool {
    let a = this.as_bytes();
    let b = that.as_bytes();
    let mut dot = false;
    let mut i = 0;
    loop {
        let ca = a.get(i).copied().unwrap_or(0);
        let cb = b.get(i).copied().unwrap_or(0);
        if ca == 0 && cb == 0 {
            return true;
        }
        // allow a bare maj.min against maj.min.patch
        if dot && ca == b'.' && cb == 0 {
            return true;
        }
        if dot && cb == b'.' && ca == 0 {
            return true;
        }
        if ca != cb {
            return false;
        }
        if ca == b'.' {
            if dot {
                return true;
            }
            dot = true;
        }
        i += 1;
    }
}

/// Check an existing connection's health before reuse.
fn check_old_conn<T: Transport>(
    transport: &mut T,
    config: &ClusterConfig,
    conn: &RemoteConn<T::Link>,
    now: Instant,
) -> Result<bool> {
    let Some(link) = conn.link.as_ref() else {
        return Ok(false);
    };
    if link.status() != LinkStatus::Ok {
        return Ok(false);
    }

    if config.connection_lifetime > 0 {
        if let Some(connected) = conn.connect_time {
            if now.duration_since(connected).as_secs() as i64 >= config.connection_lifetime {
                return Ok(false);
            }
        }
    }

    let idle = conn
        .query_time
        .map(|t| now.duration_since(t))
        .unwrap_or(Duration::MAX);
    if idle < IDLE_CONN_CHECK {
        return Ok(true);
    }

    // Anything readable on a connection that should be idle means an
    // out-of-band event arrived; drop it.
    let mut probe = [PollEvent::new(link.socket(), Interest::Read)];
    if transport.wait(&mut probe, Duration::ZERO)? > 0 {
        warn!(
            target = "executor::conn",
            connstr = %conn.connstr,
            "detected unstable connection"
        );
        return Ok(false);
    }
    Ok(true)
}

/// Reuse a healthy connection or start a fresh login.
pub(crate) fn prepare_conn<T: Transport>(
    transport: &mut T,
    config: &ClusterConfig,
    conn: &mut RemoteConn<T::Link>,
    now: Instant,
) -> Result<()> {
    if conn.state() == ConnState::Done {
        step(conn, ConnEvent::Reuse)?;
    }
    if conn.state() == ConnState::Ready {
        if check_old_conn(transport, config, conn, now)? {
            return Ok(());
        }
    }
    if conn.state() != ConnState::Disconnected {
        debug!(
            target = "executor::conn",
            connstr = %conn.connstr,
            "dropping stale connection"
        );
        conn.disconnect();
    }

    conn.connect_time = Some(now);
    let link = transport.connect_start(&conn.connstr)?;
    conn.link = Some(link);
    step(conn, ConnEvent::StartConnect)?;
    if conn.link.as_ref().map(|l| l.status()) == Some(LinkStatus::Bad) {
        return Err(conn_error(conn, "connection start failed"));
    }
    Ok(())
}

/// Align the remote session with the local server on first use within a
/// call: note whether the backend runs the same major.minor, and force
/// the remote client_encoding to the local one when they diverge.
fn tune_connection<L: Link, H: Host>(host: &mut H, conn: &mut RemoteConn<L>) -> Result<()> {
    let (remote_ver, remote_enc) = {
        let Some(link) = conn.link.as_ref() else {
            bail!(ScatterError::Internal("tuning without a link".into()));
        };
        (
            link.parameter_status("server_version").unwrap_or_default(),
            link.parameter_status("client_encoding"),
        )
    };
    conn.same_ver = cmp_branch(&remote_ver, &host.local_version());

    let this_enc = host.local_encoding();
    let sql = match remote_enc {
        Some(enc) if enc != this_enc => Some(format!("set client_encoding = '{this_enc}'")),
        _ => None,
    };

    let Some(sql) = sql else {
        conn.tuning = false;
        return Ok(());
    };

    // A second pass through here means the previous round did not stick.
    if conn.tuning {
        bail!(ScatterError::Connection(format_smolstr!(
            "{sql} -- does not seem to apply"
        )));
    }

    trace!(target = "executor::conn", connstr = %conn.connstr, sql = %sql, "tuning session");
    conn.tuning = true;
    step(conn, ConnEvent::Submit)?;
    let sent = match conn.link.as_mut() {
        Some(link) => link.send_query(&sql, &[], Format::Text),
        None => bail!(ScatterError::Internal("tuning without a link".into())),
    };
    if sent.is_err() {
        return Err(conn_error(conn, "send query"));
    }
    flush_connection(conn)
}

/// Submit the call's query on a Ready connection. When tuning is needed
/// the tuning query goes first and the caller retries after it drains.
pub(crate) fn send_query<L: Link, H: Host>(
    host: &mut H,
    config: &ClusterConfig,
    func: &CallSpec,
    conn: &mut RemoteConn<L>,
    now: Instant,
) -> Result<()> {
    conn.query_time = Some(now);

    tune_connection(host, conn)?;
    if conn.tuning {
        return Ok(());
    }

    // Binary transfer only for a same-version backend with a receivable
    // return shape.
    let binary_result = !config.disable_binary && conn.same_ver && func.ret.binary_ok();
    let result_format = if binary_result {
        Format::Binary
    } else {
        Format::Text
    };

    if conn.params.len() != func.remote_sql.arg_count() {
        bail!(ScatterError::Internal(
            "parameters not bound before submit".into()
        ));
    }

    step(conn, ConnEvent::Submit)?;
    let sent = {
        let RemoteConn { link, params, .. } = &mut *conn;
        let Some(link) = link.as_mut() else {
            bail!(ScatterError::Internal("submit without a link".into()));
        };
        let bound: SmallVec<[Param<'_>; 8]> = params
            .iter()
            .map(|p| match p {
                Some(enc) => Param {
                    value: Some(enc.bytes.as_ref()),
                    format: enc.format,
                },
                None => Param {
                    value: None,
                    format: Format::Text,
                },
            })
            .collect();
        link.send_query(&func.remote_sql.sql, &bound, result_format)
    };
    if sent.is_err() {
        return Err(conn_error(conn, "send query"));
    }
    trace!(
        target = "executor::conn",
        connstr = %conn.connstr,
        binary = binary_result,
        "query submitted"
    );
    flush_connection(conn)
}

fn flush_connection<L: Link>(conn: &mut RemoteConn<L>) -> Result<()> {
    let flushed = match conn.link.as_mut() {
        Some(link) => link.flush(),
        None => bail!(ScatterError::Internal("flush without a link".into())),
    };
    match flushed {
        Ok(FlushState::Pending) => step(conn, ConnEvent::FlushMore),
        Ok(FlushState::Done) => step(conn, ConnEvent::FlushDone),
        Err(_) => Err(conn_error(conn, "flush")),
    }
}

/// The readiness wait reported an event for this connection; advance it.
pub(crate) fn handle_conn<L: Link, H: Host>(
    host: &mut H,
    func: &CallSpec,
    conn: &mut RemoteConn<L>,
) -> Result<()> {
    match conn.state() {
        ConnState::ConnectRead | ConnState::ConnectWrite => {
            let status = match conn.link.as_mut() {
                Some(link) => link.poll_connect(),
                None => bail!(ScatterError::Internal("connect poll without a link".into())),
            };
            match status {
                PollingStatus::Writing => step(conn, ConnEvent::PollWriting)?,
                PollingStatus::Reading => step(conn, ConnEvent::PollReading)?,
                PollingStatus::Ok => {
                    trace!(target = "executor::conn", connstr = %conn.connstr, "login finished");
                    step(conn, ConnEvent::PollOk)?;
                }
                PollingStatus::Failed | PollingStatus::Active => {
                    return Err(conn_error(conn, "connect poll"));
                }
            }
        }
        ConnState::QueryWrite => flush_connection(conn)?,
        ConnState::QueryRead => {
            let consumed = match conn.link.as_mut() {
                Some(link) => link.consume_input(),
                None => bail!(ScatterError::Internal("consume without a link".into())),
            };
            if consumed.is_err() {
                return Err(conn_error(conn, "consume input"));
            }
            // Pull results until the submission is drained or bytes run
            // short.
            loop {
                let busy = conn.link.as_ref().map(|l| l.is_busy()).unwrap_or(true);
                if busy {
                    break;
                }
                if !another_result(func, conn)? {
                    break;
                }
            }
        }
        ConnState::Disconnected | ConnState::Ready | ConnState::Done => {}
    }

    forward_notices(host, func, conn);
    Ok(())
}

/// Pull the next finished result. Returns false once the submission is
/// fully drained.
fn another_result<L: Link>(func: &CallSpec, conn: &mut RemoteConn<L>) -> Result<bool> {
    let res = match conn.link.as_mut() {
        Some(link) => link.next_result(),
        None => bail!(ScatterError::Internal("result pull without a link".into())),
    };
    let Some(res) = res else {
        if conn.tuning {
            step(conn, ConnEvent::TuningDrained)?;
        } else {
            step(conn, ConnEvent::Drained)?;
        }
        return Ok(false);
    };

    match res.status {
        ExecStatus::TuplesOk => {
            if conn.res.is_some() {
                bail!(ScatterError::Protocol("double result on one connection".into()));
            }
            conn.res = Some(res);
        }
        ExecStatus::CommandOk => {}
        ExecStatus::FatalError => {
            bail!(ScatterError::Remote(func.name.clone(), res.error.clone()));
        }
        other => bail!(ScatterError::Protocol(format_smolstr!(
            "unexpected result type: {}",
            other.name()
        ))),
    }
    Ok(true)
}

fn forward_notices<L: Link, H: Host>(host: &mut H, func: &CallSpec, conn: &mut RemoteConn<L>) {
    if let Some(link) = conn.link.as_mut() {
        for notice in link.take_notices() {
            host.notice(&func.name, &notice);
        }
    }
}
