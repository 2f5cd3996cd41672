// Policy Domain Types
// Configuration is injected; the validator itself lives in application::policy

use crate::domain::execution::CallerId;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Global command policy
///
/// Recognised fields only; unknown keys in a policy file are a load error.
/// `commands`/`paths` aliases accept the legacy allowed-commands file layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct PolicyConfig {
    /// Allowlist entries: `echo`, `git status`, `python3*`
    #[serde(alias = "commands")]
    pub allowed_commands: Vec<String>,

    /// Protected directories; any path argument under one is rejected
    #[serde(default)]
    pub denied_paths: Vec<String>,

    /// Chain shapes that may use `|`, `;`, `&&`, `||`, `&` (e.g. `ls | grep`)
    #[serde(default)]
    pub allowed_chains: Vec<String>,

    /// If non-empty, path arguments must lie under one of these roots
    #[serde(default, alias = "paths")]
    pub allowed_path_roots: Vec<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            allowed_commands: ["ls", "echo", "cat", "grep", "find", "pwd"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            denied_paths: ["/etc", "/root", "/proc", "/sys", "/dev", "/boot"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            allowed_chains: Vec::new(),
            allowed_path_roots: Vec::new(),
        }
    }
}

impl PolicyConfig {
    /// Validate at load time so a bad policy never reaches the validator
    pub fn validate(&self) -> Result<(), String> {
        if self.allowed_commands.is_empty() {
            return Err("allowed command list is empty".to_string());
        }
        if let Some(entry) = self
            .allowed_commands
            .iter()
            .find(|e| e.trim().is_empty() || e.trim() == "*")
        {
            return Err(format!("invalid allowlist entry '{}'", entry));
        }
        for path in self.denied_paths.iter().chain(&self.allowed_path_roots) {
            if !Path::new(path).is_absolute() {
                return Err(format!("policy path '{}' must be absolute", path));
            }
        }
        for chain in &self.allowed_chains {
            let has_operator = chain
                .split_whitespace()
                .any(|t| matches!(t, "|" | ";" | "&&" | "||" | "&"));
            if !has_operator {
                return Err(format!("chain '{}' contains no chaining operator", chain));
            }
        }
        Ok(())
    }
}

/// Per-caller permissions resolved by the identity provider
///
/// Narrows the global policy, never widens it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionSet {
    #[serde(default)]
    pub allowed_prefixes: Vec<String>,
    #[serde(default)]
    pub forbidden_paths: Vec<String>,
}

/// The submitter of a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub id: CallerId,
    pub permissions: PermissionSet,
}

impl Caller {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            permissions: PermissionSet::default(),
        }
    }

    pub fn with_permissions(mut self, permissions: PermissionSet) -> Self {
        self.permissions = permissions;
        self
    }
}

/// How an accepted command is launched
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    /// Argument vector, no shell involved
    Argv(Vec<String>),
    /// Allowlisted chain, run through `/bin/sh -c`
    Shell(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow(Invocation),
    Deny { reason: String },
}

impl PolicyDecision {
    pub fn deny(reason: impl Into<String>) -> Self {
        PolicyDecision::Deny {
            reason: reason.into(),
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, PolicyDecision::Allow(_))
    }

    /// `(allowed, reason)` pair; reason is empty when allowed
    pub fn as_verdict(&self) -> (bool, &str) {
        match self {
            PolicyDecision::Allow(_) => (true, ""),
            PolicyDecision::Deny { reason } => (false, reason),
        }
    }
}
