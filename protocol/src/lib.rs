pub mod dsn;
pub mod poll;
pub mod value;

use crate::poll::PollEvent;
use anyhow::Result;
use smol_str::SmolStr;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Progress of a non-blocking login attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollingStatus {
    Writing,
    Reading,
    Ok,
    Failed,
    Active,
}

/// Overall health of a backend link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkStatus {
    /// Login finished, link usable.
    Ok,
    /// Login still in progress.
    Connecting,
    /// Link is dead.
    Bad,
}

/// Outcome of flushing queued outgoing bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushState {
    /// Some bytes are still queued; wait for write readiness.
    Pending,
    /// Everything has been handed to the kernel.
    Done,
}

/// Result status, mirroring the backend's execution outcomes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecStatus {
    TuplesOk,
    CommandOk,
    EmptyQuery,
    CopyIn,
    CopyOut,
    BadResponse,
    FatalError,
}

impl ExecStatus {
    pub fn name(&self) -> &'static str {
        match self {
            ExecStatus::TuplesOk => "TUPLES_OK",
            ExecStatus::CommandOk => "COMMAND_OK",
            ExecStatus::EmptyQuery => "EMPTY_QUERY",
            ExecStatus::CopyIn => "COPY_IN",
            ExecStatus::CopyOut => "COPY_OUT",
            ExecStatus::BadResponse => "BAD_RESPONSE",
            ExecStatus::FatalError => "FATAL_ERROR",
        }
    }
}

/// Wire format of a parameter or result column.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Format {
    #[default]
    Text,
    Binary,
}

/// A non-error message emitted by the backend while a query runs.
#[derive(Clone, Debug)]
pub struct Notice {
    pub severity: SmolStr,
    pub message: SmolStr,
}

/// One backend result set. Cells are raw wire bytes in the result's
/// format; decoding them is the host codec's job.
#[derive(Clone, Debug)]
pub struct QueryResult {
    pub status: ExecStatus,
    /// Error text for FatalError/BadResponse results, empty otherwise.
    pub error: SmolStr,
    pub columns: usize,
    pub format: Format,
    pub rows: Vec<Vec<Option<Box<[u8]>>>>,
}

impl QueryResult {
    pub fn ntuples(&self) -> usize {
        self.rows.len()
    }
}

/// Borrowed parameter triple for `Link::send_query`.
#[derive(Clone, Copy, Debug)]
pub struct Param<'a> {
    /// None carries a SQL NULL.
    pub value: Option<&'a [u8]>,
    pub format: Format,
}

/// One physical backend connection, driven without blocking.
///
/// Every method must return promptly; readiness to actually make progress
/// comes from `Transport::wait`. The shape follows the async half of the
/// libpq API.
pub trait Link {
    fn status(&self) -> LinkStatus;
    fn socket(&self) -> RawFd;
    /// Advance a login in progress.
    fn poll_connect(&mut self) -> PollingStatus;
    /// Queue a parameterized query. `result_format` selects text or
    /// binary transfer of the result tuples.
    fn send_query(&mut self, sql: &str, params: &[Param<'_>], result_format: Format)
        -> Result<()>;
    fn flush(&mut self) -> Result<FlushState>;
    fn consume_input(&mut self) -> Result<()>;
    /// True while a result is still incomplete.
    fn is_busy(&self) -> bool;
    /// Pull the next finished result; None once the submission is drained.
    fn next_result(&mut self) -> Option<QueryResult>;
    /// Ask the backend to cancel the query in flight. Best effort.
    fn request_cancel(&mut self) -> Result<()>;
    /// Session parameter reported by the backend, e.g. `server_version`.
    fn parameter_status(&self, name: &str) -> Option<SmolStr>;
    fn error_message(&self) -> SmolStr;
    /// Drain notices buffered since the last call.
    fn take_notices(&mut self) -> Vec<Notice>;
}

/// Factory for backend links plus the readiness wait the poll loop runs on.
pub trait Transport {
    type Link: Link;

    /// Begin a non-blocking login to `connstr`.
    fn connect_start(&mut self, connstr: &str) -> Result<Self::Link>;

    /// Wait until some entry is ready or the timeout elapses. Returns the
    /// number of ready entries; 0 covers both timeout and EINTR.
    fn wait(&mut self, entries: &mut [PollEvent], timeout: Duration) -> Result<usize> {
        poll::wait_readiness(entries, timeout)
    }
}
