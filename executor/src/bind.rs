use crate::call::{CallArgs, CallSpec};
use crate::cluster::Cluster;
use crate::host::Host;
use anyhow::{bail, Result};
use common::ScatterError;
use protocol::value::EncodedParam;
use protocol::Transport;
use smallvec::smallvec;
use smol_str::format_smolstr;

/// Fill every armed connection's parameter vector for the remote query.
/// Non-split arguments are encoded once and the encoding is shared;
/// split arguments encode the partition's own sub-array.
pub(crate) fn bind_parameters<T: Transport, H: Host>(
    cluster: &mut Cluster<T>,
    host: &mut H,
    func: &CallSpec,
    args: &CallArgs,
) -> Result<()> {
    let query = &func.remote_sql;
    let allow_binary = !cluster.config.disable_binary;

    for conn in &mut cluster.conns {
        if conn.is_armed() {
            conn.params = smallvec![None; query.arg_count()];
        }
    }

    for i in 0..query.arg_count() {
        let idx = query.arg_lookup[i];
        if idx >= func.arg_count {
            bail!(ScatterError::Internal(format_smolstr!(
                "parameter {i} references argument {idx} of {}",
                func.arg_count
            )));
        }

        let fixed: Option<EncodedParam> = if !func.is_split_arg(idx) && !args.is_null(idx) {
            Some(host.encode_param(func, idx, &args.values[idx], allow_binary)?)
        } else {
            None
        };

        for ci in 0..cluster.conns.len() {
            if !cluster.conns[ci].is_armed() {
                continue;
            }
            let encoded = if args.is_null(idx) {
                None
            } else if func.is_split_arg(idx) {
                let Some(value) = cluster.conns[ci]
                    .split_params
                    .get(idx)
                    .cloned()
                    .flatten()
                else {
                    bail!(ScatterError::Internal(format_smolstr!(
                        "split parameter {idx} missing on tagged connection"
                    )));
                };
                Some(host.encode_param(func, idx, &value, allow_binary)?)
            } else {
                fixed.clone()
            };
            cluster.conns[ci].params[i] = encoded;
        }
    }
    Ok(())
}
