use crate::query::ProxyQuery;
use protocol::value::Value;
use smol_str::SmolStr;

/// Where a call's query runs.
#[derive(Clone, Debug)]
pub enum RunOn {
    /// Partition(s) returned by the user's hash query.
    Hash(ProxyQuery),
    /// Every partition.
    All,
    /// Exactly the given partition number.
    Exact(i32),
    /// One partition picked at random per call.
    Any,
}

/// Shape of the remote result, as far as binary transfer is concerned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetShape {
    Scalar { has_recv: bool },
    Composite { use_binary: bool },
}

impl RetShape {
    /// Composite results go binary only when every column can.
    pub fn composite_from_cols(cols: &[bool]) -> Self {
        RetShape::Composite {
            use_binary: !cols.is_empty() && cols.iter().all(|c| *c),
        }
    }

    pub fn binary_ok(&self) -> bool {
        match self {
            RetShape::Scalar { has_recv } => *has_recv,
            RetShape::Composite { use_binary } => *use_binary,
        }
    }
}

/// Compiled description of one proxied function, produced by the external
/// SQL parser. The engine treats it as immutable.
#[derive(Clone, Debug)]
pub struct CallSpec {
    /// Fully-qualified function name, used to tag remote errors and
    /// forwarded notices.
    pub name: SmolStr,
    pub cluster: SmolStr,
    pub arg_count: usize,
    /// Which arguments fan out element-wise. Empty means no split.
    pub split_args: Vec<bool>,
    /// Opt-in to the single-query split-hash path.
    pub new_split: bool,
    pub run_on: RunOn,
    /// The query sent to selected partitions.
    pub remote_sql: ProxyQuery,
    pub ret: RetShape,
    pub returns_set: bool,
}

impl CallSpec {
    pub fn is_split_arg(&self, idx: usize) -> bool {
        self.split_args.get(idx).copied().unwrap_or(false)
    }

    pub fn has_split(&self) -> bool {
        self.split_args.iter().any(|s| *s)
    }
}

/// The caller's argument values for one invocation.
#[derive(Clone, Debug, Default)]
pub struct CallArgs {
    pub values: Vec<Value>,
}

impl CallArgs {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn is_null(&self, idx: usize) -> bool {
        self.values.get(idx).map(Value::is_null).unwrap_or(true)
    }
}
