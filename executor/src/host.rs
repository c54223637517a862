use crate::call::{CallArgs, CallSpec};
use crate::config::UserKind;
use crate::query::ProxyQuery;
use anyhow::Result;
use protocol::value::{DatumArray, EncodedParam, Value};
use protocol::Notice;
use smol_str::SmolStr;

/// Cluster metadata access, backed by whatever catalog the host keeps.
/// Fetched once per cluster version; the version probe gates reloads.
pub trait ClusterSource {
    fn cluster_version(&mut self, cluster: &str) -> Result<i64>;
    /// Raw key/value configuration pairs for the cluster.
    fn cluster_config(&mut self, cluster: &str) -> Result<Vec<(SmolStr, SmolStr)>>;
    /// Ordered partition connect strings; the length must be a power of
    /// two.
    fn partition_list(&mut self, cluster: &str) -> Result<Vec<SmolStr>>;
    /// Name of the requested principal, used to complete connect strings.
    fn principal(&mut self, kind: UserKind) -> SmolStr;
}

/// A single-row view over the split arrays: the hash query sees element
/// `row` of each split argument in place of the whole array.
pub struct SplitRow<'a> {
    pub arrays: &'a [Option<DatumArray>],
    pub row: usize,
}

impl SplitRow<'_> {
    /// The value the hash query should see for `arg`: the element for
    /// split arguments, None for everything else (caller value applies).
    pub fn value_for(&self, arg: usize) -> Option<&Value> {
        match self.arrays.get(arg) {
            Some(Some(da)) => da.values.get(self.row),
            _ => None,
        }
    }
}

/// Services the embedding runtime provides to the engine for the duration
/// of a call.
pub trait Host {
    /// Raise `ScatterError::Canceled` when the host wants the call gone.
    fn check_interrupts(&mut self) -> Result<()>;

    /// A backend notice arrived on some connection of `func`'s cluster.
    fn notice(&mut self, func: &str, notice: &Notice);

    /// The local server encoding name, for session tuning.
    fn local_encoding(&self) -> SmolStr;

    /// The local server version string, compared at major.minor.
    fn local_version(&self) -> SmolStr;

    /// Execute the hash query through the host's prepared-statement cache
    /// and return the first column of every row, NULLs preserved. Integer
    /// columns of any width are coerced to i64. With `row` set, split
    /// arguments are substituted element-wise.
    fn run_hash(
        &mut self,
        query: &ProxyQuery,
        func: &CallSpec,
        args: &CallArgs,
        row: Option<&SplitRow<'_>>,
    ) -> Result<Vec<Option<i64>>>;

    /// Execute the rewritten split-hash query, yielding `(i, hash)` rows
    /// for every element index of the split arrays.
    fn run_split_hash(
        &mut self,
        query: &ProxyQuery,
        func: &CallSpec,
        args: &CallArgs,
    ) -> Result<Vec<(i64, i64)>>;

    /// Encode one argument value with the host's send codec. Binary output
    /// is allowed only when `allow_binary` is set.
    fn encode_param(
        &mut self,
        func: &CallSpec,
        arg: usize,
        value: &Value,
        allow_binary: bool,
    ) -> Result<EncodedParam>;
}
