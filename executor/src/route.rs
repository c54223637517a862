use crate::call::{CallArgs, CallSpec, RunOn};
use crate::cluster::{Cluster, RemoteConn};
use crate::host::{Host, SplitRow};
use crate::query;
use anyhow::{bail, Result};
use common::ScatterError;
use protocol::value::{DatumArray, Value};
use protocol::{Link, Transport};
use rand::Rng;
use smol_str::format_smolstr;
use tracing::trace;

/// Tag the partitions the call runs on and, when splitting, build the
/// per-partition sub-array parameters.
pub(crate) fn prepare_and_tag<T: Transport, H: Host>(
    cluster: &mut Cluster<T>,
    host: &mut H,
    func: &CallSpec,
    args: &CallArgs,
) -> Result<()> {
    // Deconstruct the split arrays up front, verifying the contract.
    let mut arrays: Vec<Option<DatumArray>> = vec![None; func.arg_count];
    let mut split_len: Option<usize> = None;
    let mut split_count = 0usize;
    for i in 0..func.arg_count {
        if !func.is_split_arg(i) {
            continue;
        }
        let value = args.values.get(i).unwrap_or(&Value::Null);
        let da = DatumArray::from_value(value)?;
        match split_len {
            None => split_len = Some(da.len()),
            Some(len) if len != da.len() => bail!(ScatterError::Split(
                "split arrays must be of identical lengths".into()
            )),
            _ => {}
        }
        arrays[i] = Some(da);
        split_count += 1;
    }

    if split_count == 0 {
        return tag_run_on(cluster, host, func, args, 1, None);
    }
    let split_len = split_len.unwrap_or(0);
    trace!(
        target = "executor::route",
        split_count,
        split_len,
        new_split = func.new_split,
        "splitting arrays"
    );

    if func.new_split {
        new_split_args(cluster, host, func, args, split_len, &arrays)?;
    } else {
        old_split_args(cluster, host, func, args, split_len, &arrays)?;
    }

    // Materialize each tagged partition's accumulated elements into the
    // array values the binder will encode.
    for conn in &mut cluster.conns {
        if !conn.is_armed() {
            continue;
        }
        let mut params: Vec<Option<Value>> = vec![None; func.arg_count];
        for col in 0..func.arg_count {
            if !func.is_split_arg(col) {
                continue;
            }
            let built = conn
                .builders
                .as_mut()
                .map(|b| std::mem::take(&mut b[col]))
                .unwrap_or_default();
            params[col] = Some(Value::Array(built));
        }
        conn.split_params = params;
        conn.builders = None;
    }
    Ok(())
}

/// Evaluate the run condition, tagging matching connections with `tag`.
fn tag_run_on<T: Transport, H: Host>(
    cluster: &mut Cluster<T>,
    host: &mut H,
    func: &CallSpec,
    args: &CallArgs,
    tag: u32,
    row: Option<&SplitRow<'_>>,
) -> Result<()> {
    match &func.run_on {
        RunOn::Hash(hash_sql) => {
            let rows = host.run_hash(hash_sql, func, args, row)?;
            for hashval in &rows {
                let Some(hash) = hashval else {
                    bail!(ScatterError::Split("hash function returned NULL".into()));
                };
                let part = (*hash as u32 & cluster.part_mask) as usize;
                cluster.conns[cluster.part_map[part]].run_tag = tag;
            }
            if rows.len() != 1 && !func.returns_set {
                bail!(ScatterError::Split(
                    "only a set-returning function allows a hash count other than 1".into()
                ));
            }
            Ok(())
        }
        RunOn::All => {
            for part in 0..cluster.part_count() {
                let idx = cluster.part_map[part];
                cluster.conns[idx].run_tag = tag;
            }
            Ok(())
        }
        RunOn::Exact(n) => {
            let n = *n;
            if n < 0 || n as usize >= cluster.part_count() {
                bail!(ScatterError::Config(format_smolstr!(
                    "part number out of range: {n}"
                )));
            }
            cluster.conns[cluster.part_map[n as usize]].run_tag = tag;
            Ok(())
        }
        RunOn::Any => {
            let part = (rand::thread_rng().gen::<u32>() & cluster.part_mask) as usize;
            trace!(target = "executor::route", part, "random partition chosen");
            cluster.conns[cluster.part_map[part]].run_tag = tag;
            Ok(())
        }
    }
}

/// Single-query split: one execution yields an `(i, hash)` row per
/// element. A row whose partition already carries this index is a
/// duplicate and is skipped; a new index re-tags the partition and
/// absorbs that row's elements.
fn new_split_args<T: Transport, H: Host>(
    cluster: &mut Cluster<T>,
    host: &mut H,
    func: &CallSpec,
    args: &CallArgs,
    split_len: usize,
    arrays: &[Option<DatumArray>],
) -> Result<()> {
    let RunOn::Hash(hash_sql) = &func.run_on else {
        bail!(ScatterError::Internal(
            "optimized split requires a hash run condition".into()
        ));
    };
    let split_sql = query::split_hash_query(hash_sql, &func.split_args)?;
    let rows = host.run_split_hash(&split_sql, func, args)?;
    for (idx, hash) in rows {
        if idx < 1 || idx as usize > split_len {
            bail!(ScatterError::Split(format_smolstr!(
                "split index {idx} out of range"
            )));
        }
        let part = (hash as u32 & cluster.part_mask) as usize;
        let conn = &mut cluster.conns[cluster.part_map[part]];
        if conn.run_tag == idx as u32 {
            continue;
        }
        conn.run_tag = idx as u32;
        split_value(conn, func, arrays, (idx - 1) as usize);
    }
    Ok(())
}

/// Per-row fallback: evaluate the run condition once per element with a
/// single-row view over the split arrays.
fn old_split_args<T: Transport, H: Host>(
    cluster: &mut Cluster<T>,
    host: &mut H,
    func: &CallSpec,
    args: &CallArgs,
    split_len: usize,
    arrays: &[Option<DatumArray>],
) -> Result<()> {
    for row in 0..split_len {
        let my_tag = (row + 1) as u32;
        let view = SplitRow { arrays, row };
        tag_run_on(cluster, host, func, args, my_tag, Some(&view))?;

        for conn in &mut cluster.conns {
            if conn.run_tag != my_tag {
                continue;
            }
            split_value(conn, func, arrays, row);
        }
    }
    Ok(())
}

/// Append row `row` of every split array to the partition's builders.
fn split_value<L: Link>(
    conn: &mut RemoteConn<L>,
    func: &CallSpec,
    arrays: &[Option<DatumArray>],
    row: usize,
) {
    let builders = conn
        .builders
        .get_or_insert_with(|| vec![DatumArray::default(); func.arg_count]);
    for col in 0..func.arg_count {
        let Some(da) = &arrays[col] else {
            continue;
        };
        builders[col].push(da.values[row].clone());
    }
}
