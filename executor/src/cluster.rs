use crate::config::ClusterConfig;
use crate::fsm::{connection, ConnState};
use crate::host::ClusterSource;
use ahash::AHashMap;
use anyhow::{bail, Result};
use common::ScatterError;
use protocol::value::{DatumArray, EncodedParam, Value};
use protocol::{dsn, Link, QueryResult, Transport};
use smallvec::SmallVec;
use smol_str::{format_smolstr, SmolStr};
use std::time::Instant;
use tracing::debug;

/// One physical backend connection, owned by exactly one cluster.
///
/// The link outlives calls; everything from `run_tag` down is per-call
/// state and is cleared before and after each execution.
#[derive(Debug)]
pub struct RemoteConn<L: Link> {
    pub connstr: SmolStr,
    pub link: Option<L>,
    pub fsm: connection::StateMachine,
    pub connect_time: Option<Instant>,
    pub query_time: Option<Instant>,
    /// Remote backend major.minor matches the local server.
    pub same_ver: bool,
    /// A session tuning query is in flight.
    pub tuning: bool,

    /// Nonzero selects this connection for the current call. Split
    /// processing stores the 1-based element index that selected it
    /// first; everything else treats it as a boolean.
    pub run_tag: u32,
    pub res: Option<QueryResult>,
    /// Per-argument sub-arrays built by the split planner; None means
    /// "use the caller's value".
    pub split_params: Vec<Option<Value>>,
    /// Split accumulation state, one builder per argument.
    pub builders: Option<Vec<DatumArray>>,
    /// Encoded parameters indexed by remote-query placeholder.
    pub params: SmallVec<[Option<EncodedParam>; 8]>,
}

impl<L: Link> RemoteConn<L> {
    pub fn new(connstr: SmolStr) -> Self {
        Self {
            connstr,
            link: None,
            fsm: connection::StateMachine::new(),
            connect_time: None,
            query_time: None,
            same_ver: false,
            tuning: false,
            run_tag: 0,
            res: None,
            split_params: Vec::new(),
            builders: None,
            params: SmallVec::new(),
        }
    }

    pub fn state(&self) -> ConnState {
        *self.fsm.state()
    }

    pub fn is_armed(&self) -> bool {
        self.run_tag != 0
    }

    /// Close the link and fall back to Disconnected.
    pub fn disconnect(&mut self) {
        self.link = None;
        self.fsm = connection::StateMachine::new();
        self.tuning = false;
        self.same_ver = false;
    }

    /// Clear everything scoped to a single call.
    pub fn reset_call_state(&mut self) {
        self.run_tag = 0;
        self.res = None;
        self.split_params.clear();
        self.builders = None;
        self.params.clear();
    }
}

/// A named set of partitions sharing one configuration.
///
/// `part_map` has power-of-two length; entries index into `conns`, with
/// duplicate connect strings deduplicated to one physical connection.
#[derive(Debug)]
pub struct Cluster<T: Transport> {
    pub name: SmolStr,
    pub version: i64,
    pub config: ClusterConfig,
    pub transport: T,
    pub conns: Vec<RemoteConn<T::Link>>,
    pub part_map: Vec<usize>,
    pub part_mask: u32,
    pub busy: bool,
}

impl<T: Transport> Cluster<T> {
    /// Load the cluster's config and partition list from the metadata
    /// collaborator.
    pub fn load(name: impl Into<SmolStr>, src: &mut impl ClusterSource, transport: T) -> Result<Self> {
        let name = name.into();
        let version = src.cluster_version(&name)?;
        let config = ClusterConfig::from_pairs(&src.cluster_config(&name)?)?;
        let connstrs = src.partition_list(&name)?;
        let (conns, part_map, part_mask) = build_partitions(&name, &config, &connstrs, src)?;
        Ok(Self {
            name,
            version,
            config,
            transport,
            conns,
            part_map,
            part_mask,
            busy: false,
        })
    }

    /// Reload config and partitions when the cluster version moved.
    /// Existing links are dropped with the old connection set.
    pub fn refresh(&mut self, src: &mut impl ClusterSource) -> Result<()> {
        let version = src.cluster_version(&self.name)?;
        if version == self.version {
            return Ok(());
        }
        debug!(
            target = "executor::cluster",
            cluster = %self.name,
            old = self.version,
            new = version,
            "cluster version changed, reloading"
        );
        let config = ClusterConfig::from_pairs(&src.cluster_config(&self.name)?)?;
        let connstrs = src.partition_list(&self.name)?;
        let (conns, part_map, part_mask) = build_partitions(&self.name, &config, &connstrs, src)?;
        self.version = version;
        self.config = config;
        self.conns = conns;
        self.part_map = part_map;
        self.part_mask = part_mask;
        Ok(())
    }

    pub fn part_count(&self) -> usize {
        self.part_map.len()
    }

    /// Clear old results and per-call state across the connection list.
    pub fn clean_results(&mut self) {
        for conn in &mut self.conns {
            conn.reset_call_state();
        }
    }

    /// Periodic upkeep between calls: free leftover results and close
    /// connections past their lifetime.
    pub fn maintenance(&mut self, now: Instant) {
        if self.busy {
            return;
        }
        let lifetime = self.config.connection_lifetime;
        for conn in &mut self.conns {
            if conn.res.is_some() {
                conn.res = None;
            }
            if lifetime > 0 {
                let expired = conn
                    .connect_time
                    .map(|t| now.duration_since(t).as_secs() as i64 >= lifetime)
                    .unwrap_or(false);
                if expired && matches!(conn.state(), ConnState::Ready | ConnState::Done) {
                    debug!(
                        target = "executor::cluster",
                        connstr = %conn.connstr,
                        "closing aged connection"
                    );
                    conn.disconnect();
                }
            }
        }
    }
}

fn build_partitions<L: Link>(
    cluster: &str,
    config: &ClusterConfig,
    connstrs: &[SmolStr],
    src: &mut impl ClusterSource,
) -> Result<(Vec<RemoteConn<L>>, Vec<usize>, u32)> {
    let part_count = connstrs.len();
    if part_count == 0 || part_count & (part_count - 1) != 0 {
        bail!(ScatterError::Config(format_smolstr!(
            "cluster {cluster}: partition count must be a power of two, got {part_count}"
        )));
    }

    let user = src.principal(config.default_user);
    let mut conns: Vec<RemoteConn<L>> = Vec::new();
    let mut by_connstr: AHashMap<SmolStr, usize> = AHashMap::new();
    let mut part_map = Vec::with_capacity(part_count);

    for raw in connstrs {
        let with_user = dsn::ensure_user(raw, &user);
        let full = dsn::append_keepalives(
            &with_user,
            config.keepalive_idle,
            config.keepalive_interval,
            config.keepalive_count,
        );
        let idx = match by_connstr.get(&full) {
            Some(idx) => *idx,
            None => {
                conns.push(RemoteConn::new(full.clone()));
                by_connstr.insert(full, conns.len() - 1);
                conns.len() - 1
            }
        };
        part_map.push(idx);
    }

    Ok((conns, part_map, (part_count - 1) as u32))
}

/// The union of a call's tuple results, in connection-index order.
///
/// Validation moves each TUPLES_OK result out of its connection into this
/// set, so connections carry no per-call state once `execute` returns.
#[derive(Debug, Default)]
pub struct ResultSet {
    results: Vec<QueryResult>,
    total: usize,
}

impl ResultSet {
    pub(crate) fn push(&mut self, res: QueryResult) {
        self.total += res.ntuples();
        self.results.push(res);
    }

    pub fn total_rows(&self) -> usize {
        self.total
    }

    pub fn results(&self) -> &[QueryResult] {
        &self.results
    }

    /// Walk every row of every result, preserving connection order.
    pub fn rows(&self) -> impl Iterator<Item = &[Option<Box<[u8]>>]> {
        self.results
            .iter()
            .flat_map(|r| r.rows.iter().map(|row| row.as_slice()))
    }
}
