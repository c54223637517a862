use anyhow::{bail, Result};
use common::ScatterError;
use smol_str::{format_smolstr, SmolStr};
use std::time::Duration;

/// Connections idle longer than this get a readability probe before reuse.
pub const IDLE_CONN_CHECK: Duration = Duration::from_secs(2);

/// Suggested period for the host's maintenance hook.
pub const MAINT_PERIOD: Duration = Duration::from_secs(120);

/// Which principal identity keys user-mapping lookup and the connection
/// cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UserKind {
    #[default]
    CurrentUser,
    SessionUser,
}

/// Per-cluster configuration snapshot. Timeouts are in seconds; a value
/// of zero or less disables the check.
#[derive(Clone, Debug, Default)]
pub struct ClusterConfig {
    pub connect_timeout: i64,
    pub query_timeout: i64,
    pub connection_lifetime: i64,
    pub disable_binary: bool,
    pub keepalive_idle: i64,
    pub keepalive_interval: i64,
    pub keepalive_count: i64,
    pub default_user: UserKind,
}

impl ClusterConfig {
    /// Build a config from the key/value pairs the metadata collaborator
    /// returns.
    pub fn from_pairs(pairs: &[(SmolStr, SmolStr)]) -> Result<Self> {
        let mut cfg = ClusterConfig::default();
        for (key, val) in pairs {
            match key.as_str() {
                "connect_timeout" => cfg.connect_timeout = parse_int(key, val)?,
                "query_timeout" => cfg.query_timeout = parse_int(key, val)?,
                "connection_lifetime" => cfg.connection_lifetime = parse_int(key, val)?,
                "disable_binary" => cfg.disable_binary = parse_int(key, val)? != 0,
                "keepalive_idle" => cfg.keepalive_idle = parse_int(key, val)?,
                "keepalive_interval" => cfg.keepalive_interval = parse_int(key, val)?,
                "keepalive_count" => cfg.keepalive_count = parse_int(key, val)?,
                "default_user" => {
                    cfg.default_user = match val.as_str() {
                        "current_user" => UserKind::CurrentUser,
                        "session_user" => UserKind::SessionUser,
                        other => bail!(ScatterError::Config(format_smolstr!(
                            "default_user must be current_user or session_user, got {other}"
                        ))),
                    }
                }
                other => bail!(ScatterError::Config(format_smolstr!(
                    "unknown cluster config key: {other}"
                ))),
            }
        }
        Ok(cfg)
    }
}

fn parse_int(key: &str, val: &str) -> Result<i64> {
    match val.trim().parse::<i64>() {
        Ok(v) => Ok(v),
        Err(_) => bail!(ScatterError::Config(format_smolstr!(
            "bad value for {key}: {val}"
        ))),
    }
}
