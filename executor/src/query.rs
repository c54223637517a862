use anyhow::{bail, Result};
use common::ScatterError;
use smol_str::SmolStr;

/// A SQL template with `$1..$n` placeholders and the mapping from each
/// placeholder back to the logical function argument it carries. Built
/// once per function by the SQL-parser collaborator, immutable here.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyQuery {
    pub sql: SmolStr,
    pub arg_lookup: Vec<usize>,
}

impl ProxyQuery {
    pub fn new(sql: impl Into<SmolStr>, arg_lookup: Vec<usize>) -> Self {
        Self {
            sql: sql.into(),
            arg_lookup,
        }
    }

    pub fn arg_count(&self) -> usize {
        self.arg_lookup.len()
    }
}

/// Rewrite a hash query so a single execution yields every element's
/// routing decision: `select i, <hash with split refs subscripted by [i]>
/// from generate_subscripts($k, 1) i`.
///
/// When the hash expression references no split array itself, the first
/// split argument is appended to the parameter list so the subscript
/// generator still has an array to walk.
pub fn split_hash_query(hash: &ProxyQuery, split_args: &[bool]) -> Result<ProxyQuery> {
    let sql = hash.sql.as_str();
    let body_start = if let Some(rest) = sql.strip_prefix("select * from ") {
        sql.len() - rest.len()
    } else if let Some(rest) = sql.strip_prefix("select ") {
        sql.len() - rest.len()
    } else {
        0
    };

    let mut arg_lookup = hash.arg_lookup.clone();
    let mut out = String::from("select i, ");
    let mut first_split: Option<usize> = None;

    let mut rest = &sql[body_start..];
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        out.push('$');
        let after = &rest[pos + 1..];
        let digits = after.bytes().take_while(|b| b.is_ascii_digit()).count();
        if digits == 0 {
            rest = after;
            continue;
        }
        out.push_str(&after[..digits]);
        let sql_idx: usize = after[..digits].parse().unwrap_or(0);
        if sql_idx >= 1 && sql_idx <= arg_lookup.len() {
            let fn_idx = arg_lookup[sql_idx - 1];
            if split_args.get(fn_idx).copied().unwrap_or(false) {
                out.push_str("[i]");
                if first_split.is_none() {
                    first_split = Some(sql_idx - 1);
                }
            }
        }
        rest = &after[digits..];
    }
    out.push_str(rest);

    let first_split = match first_split {
        Some(idx) => idx,
        None => {
            let Some(fn_idx) = split_args.iter().position(|s| *s) else {
                bail!(ScatterError::Internal(
                    "split hash rewrite without split arguments".into()
                ));
            };
            arg_lookup.push(fn_idx);
            arg_lookup.len() - 1
        }
    };

    out.push_str(&format!(
        " from generate_subscripts(${}, 1) i",
        first_split + 1
    ));

    Ok(ProxyQuery {
        sql: out.into(),
        arg_lookup,
    })
}
