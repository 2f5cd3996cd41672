//! Daemon settings (everything outside the engine itself)

use anyhow::{bail, Context, Result};
use cmdexec_api_rpc::server::{DEFAULT_RPC_HOST, DEFAULT_RPC_PORT};
use cmdexec_api_rpc::RpcServerConfig;
use std::path::PathBuf;
use std::time::Duration;

pub const ENV_DB_PATH: &str = "CMDEXEC_DB_PATH";
pub const ENV_EVENT_SINK_URL: &str = "CMDEXEC_EVENT_SINK_URL";
pub const ENV_RPC_HOST: &str = "CMDEXEC_RPC_HOST";
pub const ENV_RPC_PORT: &str = "CMDEXEC_RPC_PORT";
pub const ENV_LOG_FORMAT: &str = "CMDEXEC_LOG_FORMAT";
pub const ENV_LOG_DIR: &str = "CMDEXEC_LOG_DIR";
pub const ENV_SHUTDOWN_GRACE_SECS: &str = "CMDEXEC_SHUTDOWN_GRACE_SECS";

const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, colored (development)
    Pretty,
    /// One JSON object per line (production)
    Json,
}

#[derive(Debug, Clone)]
pub struct DaemonSettings {
    /// SQLite file; `None` keeps executions in memory only
    pub db_path: Option<PathBuf>,
    /// Base URL of the external socket service
    pub event_sink_url: Option<String>,
    pub rpc: RpcServerConfig,
    pub log_format: LogFormat,
    /// Daily rolling log files are written here when set
    pub log_dir: Option<PathBuf>,
    /// How long in-flight executions get to wind down on Ctrl+C
    pub shutdown_grace: Duration,
}

impl DaemonSettings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let log_format = match get(ENV_LOG_FORMAT).as_deref() {
            None | Some("pretty") => LogFormat::Pretty,
            Some("json") => LogFormat::Json,
            Some(other) => bail!("{} must be 'pretty' or 'json', got '{}'", ENV_LOG_FORMAT, other),
        };

        let port = match get(ENV_RPC_PORT) {
            Some(raw) => raw
                .parse::<u16>()
                .with_context(|| format!("{} is not a valid port: '{}'", ENV_RPC_PORT, raw))?,
            None => DEFAULT_RPC_PORT,
        };

        let shutdown_grace = match get(ENV_SHUTDOWN_GRACE_SECS) {
            Some(raw) => Duration::from_secs(raw.parse::<u64>().with_context(|| {
                format!("{} must be a number of seconds: '{}'", ENV_SHUTDOWN_GRACE_SECS, raw)
            })?),
            None => Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
        };

        Ok(Self {
            db_path: get(ENV_DB_PATH).map(|p| expand_path(&p)),
            event_sink_url: get(ENV_EVENT_SINK_URL),
            rpc: RpcServerConfig {
                host: get(ENV_RPC_HOST).unwrap_or_else(|| DEFAULT_RPC_HOST.to_string()),
                port,
            },
            log_format,
            log_dir: get(ENV_LOG_DIR).map(|p| expand_path(&p)),
            shutdown_grace,
        })
    }
}

fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio_test::assert_err;

    fn settings(pairs: &[(&str, &str)]) -> Result<DaemonSettings> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        DaemonSettings::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let s = settings(&[]).unwrap();
        assert!(s.db_path.is_none());
        assert!(s.event_sink_url.is_none());
        assert_eq!(s.rpc.host, "127.0.0.1");
        assert_eq!(s.rpc.port, 9530);
        assert_eq!(s.log_format, LogFormat::Pretty);
        assert_eq!(s.shutdown_grace, Duration::from_secs(10));
    }

    #[test]
    fn test_overrides() {
        let s = settings(&[
            (ENV_DB_PATH, "/var/lib/cmdexec/engine.db"),
            (ENV_EVENT_SINK_URL, "http://localhost:3002"),
            (ENV_RPC_PORT, "9600"),
            (ENV_LOG_FORMAT, "json"),
        ])
        .unwrap();
        assert_eq!(s.db_path, Some(PathBuf::from("/var/lib/cmdexec/engine.db")));
        assert_eq!(s.event_sink_url.as_deref(), Some("http://localhost:3002"));
        assert_eq!(s.rpc.port, 9600);
        assert_eq!(s.log_format, LogFormat::Json);
    }

    #[test]
    fn test_tilde_expands() {
        let s = settings(&[(ENV_DB_PATH, "~/cmdexec.db")]).unwrap();
        assert!(!s.db_path.unwrap().to_string_lossy().starts_with('~'));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert_err!(settings(&[(ENV_RPC_PORT, "99999")]));
        assert_err!(settings(&[(ENV_LOG_FORMAT, "xml")]));
        assert_err!(settings(&[(ENV_SHUTDOWN_GRACE_SECS, "soon")]));
    }
}
