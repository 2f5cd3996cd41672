//! Engine configuration
//!
//! Parsed once at startup from `CMDEXEC_*` environment variables (or any
//! key lookup, for tests) and validated before anything is wired.

use crate::domain::PolicyConfig;
use crate::error::{AppError, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_ALLOWED_COMMANDS: &str = "CMDEXEC_ALLOWED_COMMANDS";
pub const ENV_DENIED_PATHS: &str = "CMDEXEC_DENIED_PATHS";
pub const ENV_ALLOWED_CHAINS: &str = "CMDEXEC_ALLOWED_CHAINS";
pub const ENV_ALLOWED_PATH_ROOTS: &str = "CMDEXEC_ALLOWED_PATH_ROOTS";
pub const ENV_POLICY_PATH: &str = "CMDEXEC_POLICY_PATH";
pub const ENV_MAX_EXECUTION_SECS: &str = "CMDEXEC_MAX_EXECUTION_SECS";
pub const ENV_MAX_OUTPUT_BYTES: &str = "CMDEXEC_MAX_OUTPUT_BYTES";
pub const ENV_OUTPUT_QUEUE_DEPTH: &str = "CMDEXEC_OUTPUT_QUEUE_DEPTH";
pub const ENV_MAX_CONCURRENT: &str = "CMDEXEC_MAX_CONCURRENT";
pub const ENV_WORK_DIR: &str = "CMDEXEC_WORK_DIR";
pub const ENV_ENV_ALLOWLIST: &str = "CMDEXEC_ENV_ALLOWLIST";
pub const ENV_RETENTION_SECS: &str = "CMDEXEC_RETENTION_SECS";
pub const ENV_RETENTION_SWEEP_SECS: &str = "CMDEXEC_RETENTION_SWEEP_SECS";

const DEFAULT_MAX_EXECUTION_SECS: u64 = 3600;
const DEFAULT_MAX_OUTPUT_BYTES: u64 = 10 * 1024 * 1024;
const DEFAULT_OUTPUT_QUEUE_DEPTH: usize = 256;
const DEFAULT_MAX_CONCURRENT: usize = 16;
const DEFAULT_RETENTION_SECS: u64 = 7 * 24 * 3600;
const DEFAULT_RETENTION_SWEEP_SECS: u64 = 3600;
const DEFAULT_ENV_ALLOWLIST: &[&str] = &["PATH", "HOME", "USER", "LANG"];

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub policy: PolicyConfig,
    pub max_execution_time: Duration,
    pub max_output_bytes: u64,
    /// Per-execution streamer queue depth, in chunks
    pub output_queue_depth: usize,
    pub max_concurrent: usize,
    /// Each execution runs in `<work_dir>/<execution_id>` when set
    pub work_dir: Option<PathBuf>,
    pub env_allowlist: Vec<String>,
    pub retention: Duration,
    pub retention_sweep_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            policy: PolicyConfig::default(),
            max_execution_time: Duration::from_secs(DEFAULT_MAX_EXECUTION_SECS),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            output_queue_depth: DEFAULT_OUTPUT_QUEUE_DEPTH,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            work_dir: None,
            env_allowlist: DEFAULT_ENV_ALLOWLIST.iter().map(|s| s.to_string()).collect(),
            retention: Duration::from_secs(DEFAULT_RETENTION_SECS),
            retention_sweep_interval: Duration::from_secs(DEFAULT_RETENTION_SWEEP_SECS),
        }
    }
}

impl EngineConfig {
    /// Load from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup
    ///
    /// Unset or blank variables keep their defaults. A policy file, when
    /// given, replaces the whole policy section.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(path) = get(ENV_POLICY_PATH) {
            config.policy = load_policy_file(Path::new(&path))?;
        }
        if let Some(v) = get(ENV_ALLOWED_COMMANDS) {
            config.policy.allowed_commands = split_list(&v);
        }
        if let Some(v) = get(ENV_DENIED_PATHS) {
            config.policy.denied_paths = split_list(&v);
        }
        if let Some(v) = get(ENV_ALLOWED_CHAINS) {
            config.policy.allowed_chains = split_list(&v);
        }
        if let Some(v) = get(ENV_ALLOWED_PATH_ROOTS) {
            config.policy.allowed_path_roots = split_list(&v);
        }

        if let Some(v) = get(ENV_MAX_EXECUTION_SECS) {
            config.max_execution_time = Duration::from_secs(parse_num(ENV_MAX_EXECUTION_SECS, &v)?);
        }
        if let Some(v) = get(ENV_MAX_OUTPUT_BYTES) {
            config.max_output_bytes = parse_num(ENV_MAX_OUTPUT_BYTES, &v)?;
        }
        if let Some(v) = get(ENV_OUTPUT_QUEUE_DEPTH) {
            config.output_queue_depth = parse_num(ENV_OUTPUT_QUEUE_DEPTH, &v)?;
        }
        if let Some(v) = get(ENV_MAX_CONCURRENT) {
            config.max_concurrent = parse_num(ENV_MAX_CONCURRENT, &v)?;
        }
        if let Some(v) = get(ENV_WORK_DIR) {
            config.work_dir = Some(PathBuf::from(v.trim()));
        }
        if let Some(v) = get(ENV_ENV_ALLOWLIST) {
            config.env_allowlist = split_list(&v);
        }
        if let Some(v) = get(ENV_RETENTION_SECS) {
            config.retention = Duration::from_secs(parse_num(ENV_RETENTION_SECS, &v)?);
        }
        if let Some(v) = get(ENV_RETENTION_SWEEP_SECS) {
            config.retention_sweep_interval =
                Duration::from_secs(parse_num(ENV_RETENTION_SWEEP_SECS, &v)?);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.policy.validate().map_err(AppError::Config)?;

        if self.max_execution_time.is_zero() {
            return Err(AppError::Config("max execution time must be > 0".to_string()));
        }
        if self.max_output_bytes == 0 {
            return Err(AppError::Config("max output bytes must be > 0".to_string()));
        }
        if self.output_queue_depth == 0 {
            return Err(AppError::Config("output queue depth must be > 0".to_string()));
        }
        if self.max_concurrent == 0 {
            return Err(AppError::Config("max concurrent executions must be > 0".to_string()));
        }
        if self.retention_sweep_interval.is_zero() {
            return Err(AppError::Config("retention sweep interval must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Read a JSON policy file (unknown fields are rejected)
pub fn load_policy_file(path: &Path) -> Result<PolicyConfig> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        AppError::Config(format!("cannot read policy file {}: {}", path.display(), e))
    })?;
    let policy: PolicyConfig = serde_json::from_str(&raw).map_err(|e| {
        AppError::Config(format!("invalid policy file {}: {}", path.display(), e))
    })?;
    policy.validate().map_err(AppError::Config)?;
    Ok(policy)
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse_num<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| AppError::Config(format!("{} must be a non-negative integer, got '{}'", key, raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_nothing_is_set() {
        let config = EngineConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.max_execution_time, Duration::from_secs(3600));
        assert_eq!(config.max_output_bytes, 10 * 1024 * 1024);
        assert!(config.policy.allowed_commands.contains(&"echo".to_string()));
    }

    #[test]
    fn test_overrides_are_parsed() {
        let config = EngineConfig::from_lookup(lookup(&[
            (ENV_ALLOWED_COMMANDS, "echo, git status ,python3*"),
            (ENV_MAX_EXECUTION_SECS, "5"),
            (ENV_OUTPUT_QUEUE_DEPTH, "8"),
            (ENV_WORK_DIR, "/tmp/cmdexec"),
            (ENV_ALLOWED_CHAINS, "ls | grep"),
        ]))
        .unwrap();

        assert_eq!(
            config.policy.allowed_commands,
            vec!["echo", "git status", "python3*"]
        );
        assert_eq!(config.max_execution_time, Duration::from_secs(5));
        assert_eq!(config.output_queue_depth, 8);
        assert_eq!(config.work_dir, Some(PathBuf::from("/tmp/cmdexec")));
        assert_eq!(config.policy.allowed_chains, vec!["ls | grep"]);
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        let err = EngineConfig::from_lookup(lookup(&[(ENV_MAX_EXECUTION_SECS, "0")])).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn test_garbage_number_is_rejected() {
        let err = EngineConfig::from_lookup(lookup(&[(ENV_MAX_OUTPUT_BYTES, "lots")])).unwrap_err();
        assert!(err.to_string().contains(ENV_MAX_OUTPUT_BYTES));
    }

    #[test]
    fn test_relative_denied_path_is_rejected() {
        let err = EngineConfig::from_lookup(lookup(&[(ENV_DENIED_PATHS, "etc")])).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn test_policy_file_replaces_policy_then_env_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"allowedCommands": ["ls", "cat"], "deniedPaths": ["/secret"]}}"#
        )
        .unwrap();

        let path = file.path().to_string_lossy().to_string();
        let config = EngineConfig::from_lookup(lookup(&[
            (ENV_POLICY_PATH, path.as_str()),
            (ENV_ALLOWED_CHAINS, "ls | cat"),
        ]))
        .unwrap();

        assert_eq!(config.policy.allowed_commands, vec!["ls", "cat"]);
        assert_eq!(config.policy.denied_paths, vec!["/secret"]);
        assert_eq!(config.policy.allowed_chains, vec!["ls | cat"]);
    }

    #[test]
    fn test_missing_policy_file_is_config_error() {
        let err = load_policy_file(Path::new("/nonexistent/cmdexec-policy.json")).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }
}
