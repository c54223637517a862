use smol_str::SmolStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScatterError {
    #[error("invalid cluster configuration: {0}")]
    Config(SmolStr),
    #[error("split contract violated: {0}")]
    Split(SmolStr),
    #[error("connection failed: {0}")]
    Connection(SmolStr),
    #[error("protocol violation: {0}")]
    Protocol(SmolStr),
    #[error("remote error from {0}: {1}")]
    Remote(SmolStr, SmolStr),
    #[error("connect timeout to: {0}")]
    ConnectTimeout(SmolStr),
    #[error("query timeout")]
    QueryTimeout,
    #[error("query canceled")]
    Canceled,
    #[error("cluster {0} is busy")]
    Busy(SmolStr),
    #[error("internal inconsistency: {0}")]
    Internal(SmolStr),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
