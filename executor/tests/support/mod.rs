//! Scripted stand-ins for the backend transport and the host runtime.

use anyhow::{bail, Result};
use common::ScatterError;
use executor::call::{CallArgs, CallSpec, RetShape, RunOn};
use executor::cluster::Cluster;
use executor::config::UserKind;
use executor::host::{ClusterSource, Host, SplitRow};
use executor::query::ProxyQuery;
use protocol::poll::PollEvent;
use protocol::value::{render_text, DatumArray, EncodedParam, Value};
use protocol::{
    ExecStatus, FlushState, Format, Link, LinkStatus, Notice, Param, PollingStatus, QueryResult,
    Transport,
};
use smol_str::SmolStr;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

/// Record of one `send_query` call, with text parameters decoded.
#[derive(Clone, Debug)]
pub struct SentQuery {
    pub sql: String,
    pub params: Vec<Option<String>>,
    pub result_format: Format,
}

/// Scripted behavior and recorded traffic for one backend address.
#[derive(Debug)]
pub struct Endpoint {
    pub connect_steps: VecDeque<PollingStatus>,
    /// Login never makes progress: waits report no readiness while the
    /// link is still connecting.
    pub stall_connect: bool,
    /// The backend never answers a query: waits report no readiness,
    /// results never complete.
    pub stall: bool,
    /// Set once a login on this endpoint finished.
    pub logged_in: bool,
    /// First flush of each submission reports pending bytes.
    pub flush_pending_once: bool,
    /// Result batches served per submission; empty falls back to a
    /// single one-row TUPLES_OK result.
    pub batches: VecDeque<Vec<QueryResult>>,
    pub server_version: String,
    pub client_encoding: String,
    /// Notices delivered along with the next submission's results.
    pub notices: VecDeque<Notice>,
    /// A zero-timeout idle probe sees readable bytes.
    pub idle_junk: bool,

    pub sent: Vec<SentQuery>,
    pub connect_count: u32,
    pub cancel_count: u32,
}

impl Endpoint {
    fn new() -> Self {
        Self {
            connect_steps: VecDeque::new(),
            stall_connect: false,
            stall: false,
            logged_in: false,
            flush_pending_once: false,
            batches: VecDeque::new(),
            server_version: "16.3".into(),
            client_encoding: "UTF8".into(),
            notices: VecDeque::new(),
            idle_junk: false,
            sent: Vec::new(),
            connect_count: 0,
            cancel_count: 0,
        }
    }
}

pub type EndpointRef = Rc<RefCell<Endpoint>>;

#[derive(Debug)]
pub struct FakeLink {
    fd: RawFd,
    status: LinkStatus,
    ep: EndpointRef,
    current: VecDeque<QueryResult>,
    flush_pending: bool,
    pending_notices: Vec<Notice>,
}

impl Link for FakeLink {
    fn status(&self) -> LinkStatus {
        self.status
    }

    fn socket(&self) -> RawFd {
        self.fd
    }

    fn poll_connect(&mut self) -> PollingStatus {
        let step = self.ep.borrow_mut().connect_steps.pop_front();
        match step {
            Some(PollingStatus::Ok) | None => {
                self.status = LinkStatus::Ok;
                self.ep.borrow_mut().logged_in = true;
                PollingStatus::Ok
            }
            Some(PollingStatus::Failed) => {
                self.status = LinkStatus::Bad;
                PollingStatus::Failed
            }
            Some(other) => other,
        }
    }

    fn send_query(
        &mut self,
        sql: &str,
        params: &[Param<'_>],
        result_format: Format,
    ) -> Result<()> {
        let mut ep = self.ep.borrow_mut();
        ep.sent.push(SentQuery {
            sql: sql.to_string(),
            params: params
                .iter()
                .map(|p| p.value.map(|v| String::from_utf8_lossy(v).into_owned()))
                .collect(),
            result_format,
        });

        if let Some(enc) = sql
            .strip_prefix("set client_encoding = '")
            .and_then(|rest| rest.strip_suffix('\''))
        {
            ep.client_encoding = enc.to_string();
            self.current = VecDeque::from(vec![QueryResult {
                status: ExecStatus::CommandOk,
                error: SmolStr::default(),
                columns: 0,
                format: Format::Text,
                rows: Vec::new(),
            }]);
            return Ok(());
        }

        self.current = match ep.batches.pop_front() {
            Some(batch) => batch.into(),
            None => VecDeque::from(vec![tuples(1)]),
        };
        self.pending_notices.extend(ep.notices.drain(..));
        self.flush_pending = ep.flush_pending_once;
        Ok(())
    }

    fn flush(&mut self) -> Result<FlushState> {
        if self.flush_pending {
            self.flush_pending = false;
            return Ok(FlushState::Pending);
        }
        Ok(FlushState::Done)
    }

    fn consume_input(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_busy(&self) -> bool {
        self.ep.borrow().stall
    }

    fn next_result(&mut self) -> Option<QueryResult> {
        self.current.pop_front()
    }

    fn request_cancel(&mut self) -> Result<()> {
        self.ep.borrow_mut().cancel_count += 1;
        Ok(())
    }

    fn parameter_status(&self, name: &str) -> Option<SmolStr> {
        let ep = self.ep.borrow();
        match name {
            "server_version" => Some(ep.server_version.as_str().into()),
            "client_encoding" => Some(ep.client_encoding.as_str().into()),
            _ => None,
        }
    }

    fn error_message(&self) -> SmolStr {
        "fake backend error".into()
    }

    fn take_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.pending_notices)
    }
}

#[derive(Default, Debug)]
pub struct FakeTransport {
    endpoints: HashMap<String, EndpointRef>,
    by_fd: HashMap<RawFd, EndpointRef>,
    next_fd: RawFd,
}

impl FakeTransport {
    /// The endpoint scripted for `connstr`, created on first use.
    pub fn endpoint(&mut self, connstr: &str) -> EndpointRef {
        self.endpoints
            .entry(connstr.to_string())
            .or_insert_with(|| Rc::new(RefCell::new(Endpoint::new())))
            .clone()
    }
}

impl Transport for FakeTransport {
    type Link = FakeLink;

    fn connect_start(&mut self, connstr: &str) -> Result<FakeLink> {
        let ep = self.endpoint(connstr);
        {
            let mut ep = ep.borrow_mut();
            ep.connect_count += 1;
            ep.logged_in = false;
        }
        self.next_fd += 1;
        let fd = self.next_fd;
        self.by_fd.insert(fd, ep.clone());
        Ok(FakeLink {
            fd,
            status: LinkStatus::Connecting,
            ep,
            current: VecDeque::new(),
            flush_pending: false,
            pending_notices: Vec::new(),
        })
    }

    fn wait(&mut self, entries: &mut [PollEvent], timeout: Duration) -> Result<usize> {
        let mut ready = 0;
        for entry in entries.iter_mut() {
            let ep = self.by_fd.get(&entry.fd);
            entry.ready = match ep {
                Some(ep) if timeout.is_zero() => ep.borrow().idle_junk,
                Some(ep) => {
                    let ep = ep.borrow();
                    if ep.logged_in {
                        !ep.stall
                    } else {
                        !ep.stall_connect
                    }
                }
                None => false,
            };
            if entry.ready {
                ready += 1;
            }
        }
        if ready == 0 && !timeout.is_zero() {
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(ready)
    }
}

/// A TUPLES_OK result with `n` one-column rows.
pub fn tuples(n: usize) -> QueryResult {
    QueryResult {
        status: ExecStatus::TuplesOk,
        error: SmolStr::default(),
        columns: 1,
        format: Format::Text,
        rows: (0..n)
            .map(|i| vec![Some(i.to_string().into_bytes().into_boxed_slice())])
            .collect(),
    }
}

pub struct FakeSource {
    pub version: i64,
    pub config: Vec<(SmolStr, SmolStr)>,
    pub partitions: Vec<SmolStr>,
}

impl FakeSource {
    pub fn new(partitions: &[&str]) -> Self {
        Self {
            version: 1,
            config: Vec::new(),
            partitions: partitions.iter().map(|p| (*p).into()).collect(),
        }
    }

    pub fn with_config(mut self, pairs: &[(&str, &str)]) -> Self {
        self.config = pairs.iter().map(|(k, v)| ((*k).into(), (*v).into())).collect();
        self
    }
}

impl ClusterSource for FakeSource {
    fn cluster_version(&mut self, _cluster: &str) -> Result<i64> {
        Ok(self.version)
    }

    fn cluster_config(&mut self, _cluster: &str) -> Result<Vec<(SmolStr, SmolStr)>> {
        Ok(self.config.clone())
    }

    fn partition_list(&mut self, _cluster: &str) -> Result<Vec<SmolStr>> {
        Ok(self.partitions.clone())
    }

    fn principal(&mut self, _kind: UserKind) -> SmolStr {
        "testuser".into()
    }
}

pub struct FakeHost {
    pub encoding: SmolStr,
    pub version: SmolStr,
    /// Cancel the call after this many interrupt checks.
    pub cancel_after_checks: Option<u32>,
    pub checks: u32,
    /// When set, `run_hash` returns these rows instead of the identity
    /// hash.
    pub hash_rows: Option<Vec<Option<i64>>>,
    pub notices: Vec<(String, String)>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self {
            encoding: "UTF8".into(),
            version: "16.3".into(),
            cancel_after_checks: None,
            checks: 0,
            hash_rows: None,
            notices: Vec::new(),
        }
    }
}

fn int_of(value: &Value) -> Option<i64> {
    match value {
        Value::Int2(v) => Some(*v as i64),
        Value::Int4(v) => Some(*v as i64),
        Value::Int8(v) => Some(*v),
        _ => None,
    }
}

impl Host for FakeHost {
    fn check_interrupts(&mut self) -> Result<()> {
        self.checks += 1;
        if let Some(limit) = self.cancel_after_checks {
            if self.checks > limit {
                bail!(ScatterError::Canceled);
            }
        }
        Ok(())
    }

    fn notice(&mut self, func: &str, notice: &Notice) {
        self.notices.push((func.to_string(), notice.message.to_string()));
    }

    fn local_encoding(&self) -> SmolStr {
        self.encoding.clone()
    }

    fn local_version(&self) -> SmolStr {
        self.version.clone()
    }

    fn run_hash(
        &mut self,
        query: &ProxyQuery,
        _func: &CallSpec,
        args: &CallArgs,
        row: Option<&SplitRow<'_>>,
    ) -> Result<Vec<Option<i64>>> {
        if let Some(rows) = &self.hash_rows {
            return Ok(rows.clone());
        }
        // identity hash over the query's first argument
        let idx = *query.arg_lookup.first().expect("hash query without args");
        let value = match row.and_then(|view| view.value_for(idx)) {
            Some(elem) => elem.clone(),
            None => args.values[idx].clone(),
        };
        Ok(vec![int_of(&value)])
    }

    fn run_split_hash(
        &mut self,
        _query: &ProxyQuery,
        func: &CallSpec,
        args: &CallArgs,
    ) -> Result<Vec<(i64, i64)>> {
        // what generate_subscripts over the first split array would yield
        let first_split = func
            .split_args
            .iter()
            .position(|s| *s)
            .expect("split call without split args");
        let da = DatumArray::from_value(&args.values[first_split])?;
        Ok(da
            .values
            .iter()
            .enumerate()
            .map(|(i, v)| ((i + 1) as i64, int_of(v).unwrap_or(0)))
            .collect())
    }

    fn encode_param(
        &mut self,
        _func: &CallSpec,
        _arg: usize,
        value: &Value,
        _allow_binary: bool,
    ) -> Result<EncodedParam> {
        match render_text(value) {
            Some(text) => Ok(EncodedParam::text(text)),
            None => Ok(EncodedParam::text(String::new())),
        }
    }
}

/// A one-int-argument func: `select r from f($1)`, hash over $1.
pub fn int_call(run_on: RunOn) -> CallSpec {
    CallSpec {
        name: "public.f(integer)".into(),
        cluster: "c".into(),
        arg_count: 1,
        split_args: vec![false],
        new_split: false,
        run_on,
        remote_sql: ProxyQuery::new("select r::integer from public.f($1) r", vec![0]),
        ret: RetShape::Scalar { has_recv: true },
        returns_set: false,
    }
}

/// An int-array func with the argument split, hash over elements.
pub fn split_call(new_split: bool) -> CallSpec {
    CallSpec {
        name: "public.f_batch(integer[])".into(),
        cluster: "c".into(),
        arg_count: 1,
        split_args: vec![true],
        new_split,
        run_on: RunOn::Hash(ProxyQuery::new("select h($1)", vec![0])),
        remote_sql: ProxyQuery::new("select r::integer from public.f_batch($1) r", vec![0]),
        ret: RetShape::Scalar { has_recv: true },
        returns_set: false,
    }
}

pub fn identity_hash() -> RunOn {
    RunOn::Hash(ProxyQuery::new("select h($1)", vec![0]))
}

pub fn int_array(vals: &[i32]) -> Value {
    let mut da = DatumArray::default();
    for v in vals {
        da.push(Value::Int4(*v));
    }
    Value::Array(da)
}

/// Four partitions on distinct backends, default config.
pub fn four_part_cluster() -> Cluster<FakeTransport> {
    cluster_with(&["host=p0", "host=p1", "host=p2", "host=p3"], &[])
}

pub fn cluster_with(partitions: &[&str], config: &[(&str, &str)]) -> Cluster<FakeTransport> {
    let mut src = FakeSource::new(partitions).with_config(config);
    Cluster::load("c", &mut src, FakeTransport::default()).expect("cluster load")
}

/// The endpoint for partition `n` of the default test layout.
pub fn part_endpoint(cluster: &mut Cluster<FakeTransport>, n: usize) -> EndpointRef {
    cluster.transport.endpoint(&format!("host=p{n} user=testuser"))
}
