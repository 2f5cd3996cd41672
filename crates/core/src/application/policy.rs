//! Command policy validation
//!
//! A command is accepted only if every segment's leading tokens match an
//! allowlist rule, no forbidden metacharacter appears, chaining operators
//! form an allowlisted chain shape, and no path argument lies under a
//! protected directory. Deny always wins. The validator is a pure function
//! of its configuration: malformed input is a denial, never an error.

use crate::domain::{Invocation, PermissionSet, PolicyConfig, PolicyDecision};
use std::path::{Component, Path, PathBuf};

/// Characters rejected anywhere in the raw command, quoted or not
const NEVER_ALLOWED_CHARS: &[char] = &['`', '$', '<', '>', '\n', '\r', '\0'];

/// One allowlist entry, pre-tokenised
#[derive(Debug, Clone, PartialEq, Eq)]
struct AllowRule {
    tokens: Vec<String>,
    /// Last token ended in `*`: prefix match on that token
    prefix: bool,
}

impl AllowRule {
    fn parse(entry: &str) -> Option<Self> {
        let mut tokens: Vec<String> = entry.split_whitespace().map(String::from).collect();
        let last = tokens.last_mut()?;
        let prefix = last.ends_with('*');
        if prefix {
            last.pop();
            if last.is_empty() {
                tokens.pop();
            }
        }
        if tokens.is_empty() {
            return None;
        }
        Some(Self { tokens, prefix })
    }

    fn matches(&self, argv: &[String]) -> bool {
        if argv.len() < self.tokens.len() {
            return false;
        }
        let last = self.tokens.len() - 1;
        self.tokens.iter().zip(argv).enumerate().all(|(i, (rule, arg))| {
            if i == last && self.prefix {
                arg.starts_with(rule.as_str())
            } else {
                rule == arg
            }
        })
    }
}

/// Chaining operator between two command segments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChainOp {
    Pipe,
    Or,
    And,
    Background,
    Sequence,
}

impl ChainOp {
    fn as_str(&self) -> &'static str {
        match self {
            ChainOp::Pipe => "|",
            ChainOp::Or => "||",
            ChainOp::And => "&&",
            ChainOp::Background => "&",
            ChainOp::Sequence => ";",
        }
    }
}

/// Raw command split at unquoted chaining operators
#[derive(Debug)]
struct Chain {
    segments: Vec<String>,
    ops: Vec<ChainOp>,
}

/// Split at `|`, `||`, `&`, `&&`, `;` outside quotes
fn split_chain(raw: &str) -> Result<Chain, String> {
    let mut segments = Vec::new();
    let mut ops = Vec::new();
    let mut current = String::new();
    let mut chars = raw.chars().peekable();
    let mut in_single = false;
    let mut in_double = false;

    while let Some(c) = chars.next() {
        match c {
            '\\' if !in_single => {
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '\'' if !in_double => {
                in_single = !in_single;
                current.push(c);
            }
            '"' if !in_single => {
                in_double = !in_double;
                current.push(c);
            }
            '|' | '&' | ';' if !in_single && !in_double => {
                let op = match (c, chars.peek()) {
                    ('|', Some('|')) => {
                        chars.next();
                        ChainOp::Or
                    }
                    ('&', Some('&')) => {
                        chars.next();
                        ChainOp::And
                    }
                    ('|', _) => ChainOp::Pipe,
                    ('&', _) => ChainOp::Background,
                    _ => ChainOp::Sequence,
                };
                segments.push(std::mem::take(&mut current));
                ops.push(op);
            }
            _ => current.push(c),
        }
    }

    if in_single || in_double {
        return Err("unterminated quote".to_string());
    }
    segments.push(current);
    Ok(Chain { segments, ops })
}

/// Fold `.` and `..` without touching the filesystem
///
/// A relative path that climbs above its start keeps its leading `..`.
fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let can_pop = matches!(out.components().next_back(), Some(Component::Normal(_)));
                if can_pop {
                    out.pop();
                } else if !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn looks_like_path(token: &str) -> bool {
    token.starts_with('/')
        || token.starts_with('~')
        || token == "."
        || token == ".."
        || token.contains('/')
}

/// Path-bearing values of one argument
///
/// `--out=/etc/x` and `-f/etc/x` both yield `/etc/x`.
fn path_candidates(token: &str) -> Option<&str> {
    if let Some(flag) = token.strip_prefix('-') {
        if let Some((_, value)) = token.split_once('=') {
            return looks_like_path(value).then_some(value);
        }
        let start = flag.find(|c: char| matches!(c, '/' | '~' | '.'))?;
        let value = &flag[start..];
        return looks_like_path(value).then_some(value);
    }
    looks_like_path(token).then_some(token)
}

/// Stateless command checker built from a validated policy
#[derive(Debug, Clone)]
pub struct PolicyValidator {
    allow_rules: Vec<AllowRule>,
    chain_shapes: Vec<String>,
    denied_paths: Vec<PathBuf>,
    allowed_roots: Vec<PathBuf>,
    home: Option<PathBuf>,
    base_dir: Option<PathBuf>,
}

impl PolicyValidator {
    /// Build from policy configuration
    ///
    /// `~` in path arguments expands against `HOME` as seen at construction.
    /// Relative paths resolve against the process working directory, which is
    /// where children run when no per-execution directory is configured.
    pub fn new(policy: &PolicyConfig) -> Self {
        Self {
            allow_rules: policy
                .allowed_commands
                .iter()
                .filter_map(|e| AllowRule::parse(e))
                .collect(),
            chain_shapes: policy
                .allowed_chains
                .iter()
                .map(|c| c.split_whitespace().collect::<Vec<_>>().join(" "))
                .collect(),
            denied_paths: policy
                .denied_paths
                .iter()
                .map(|p| lexical_normalize(Path::new(p)))
                .collect(),
            allowed_roots: policy
                .allowed_path_roots
                .iter()
                .map(|p| lexical_normalize(Path::new(p)))
                .collect(),
            home: std::env::var_os("HOME").map(PathBuf::from),
            base_dir: std::env::current_dir()
                .ok()
                .map(|dir| lexical_normalize(&dir)),
        }
    }

    pub fn with_home(mut self, home: Option<PathBuf>) -> Self {
        self.home = home;
        self
    }

    /// Directory commands run in when `check` is used
    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(lexical_normalize(&base_dir.into()));
        self
    }

    /// Check a raw command against the policy and the caller's permissions
    pub fn check(&self, command: &str, permissions: &PermissionSet) -> PolicyDecision {
        self.evaluate(command, permissions, self.base_dir.as_deref())
    }

    /// Like `check`, resolving relative paths against the directory the command will run in
    pub fn check_in(&self, command: &str, permissions: &PermissionSet, cwd: &Path) -> PolicyDecision {
        let cwd = lexical_normalize(cwd);
        self.evaluate(command, permissions, Some(&cwd))
    }

    fn evaluate(
        &self,
        command: &str,
        permissions: &PermissionSet,
        base_dir: Option<&Path>,
    ) -> PolicyDecision {
        let command = command.trim();
        if command.is_empty() {
            return PolicyDecision::deny("empty command");
        }
        if let Some(c) = command.chars().find(|c| NEVER_ALLOWED_CHARS.contains(c)) {
            return PolicyDecision::deny(format!(
                "forbidden shell metacharacter {:?} in command",
                c
            ));
        }

        let chain = match split_chain(command) {
            Ok(chain) => chain,
            Err(e) => return PolicyDecision::deny(format!("unparseable command: {}", e)),
        };

        let mut argvs = Vec::with_capacity(chain.segments.len());
        for segment in &chain.segments {
            let argv = match shell_words::split(segment) {
                Ok(argv) => argv,
                Err(e) => return PolicyDecision::deny(format!("unparseable command: {}", e)),
            };
            if argv.is_empty() {
                return PolicyDecision::deny("empty command segment around chaining operator");
            }
            argvs.push(argv);
        }

        if !chain.ops.is_empty() {
            let shape = self.chain_shape(&argvs, &chain.ops);
            if !self.chain_shapes.iter().any(|s| *s == shape) {
                return PolicyDecision::deny(format!("command chain '{}' is not allowlisted", shape));
            }
        }

        let extra_denied: Vec<PathBuf> = permissions
            .forbidden_paths
            .iter()
            .map(|p| lexical_normalize(Path::new(p)))
            .collect();

        // the child can read its own working directory without naming it
        if let Some(cwd) = base_dir {
            if let Some(denied) = self.denied_prefix(cwd, &extra_denied) {
                return PolicyDecision::deny(format!(
                    "working directory '{}' is under protected directory '{}'",
                    cwd.display(),
                    denied.display()
                ));
            }
        }

        for argv in &argvs {
            if let Err(reason) = self.check_argv(argv, permissions, &extra_denied, base_dir) {
                return PolicyDecision::deny(reason);
            }
        }

        if chain.ops.is_empty() {
            PolicyDecision::Allow(Invocation::Argv(argvs.remove(0)))
        } else {
            PolicyDecision::Allow(Invocation::Shell(render_shell(&argvs, &chain.ops)))
        }
    }

    fn chain_shape(&self, argvs: &[Vec<String>], ops: &[ChainOp]) -> String {
        let mut shape = argvs[0][0].clone();
        for (argv, op) in argvs[1..].iter().zip(ops) {
            shape.push(' ');
            shape.push_str(op.as_str());
            shape.push(' ');
            shape.push_str(&argv[0]);
        }
        shape
    }

    fn check_argv(
        &self,
        argv: &[String],
        permissions: &PermissionSet,
        extra_denied: &[PathBuf],
        base_dir: Option<&Path>,
    ) -> Result<(), String> {
        let executable = &argv[0];
        if !self.allow_rules.iter().any(|r| r.matches(argv)) {
            return Err(format!("command '{}' is not in the allowlist", executable));
        }
        if !permissions.allowed_prefixes.is_empty() {
            let permitted = permissions
                .allowed_prefixes
                .iter()
                .filter_map(|p| AllowRule::parse(p))
                .any(|r| r.matches(argv));
            if !permitted {
                return Err(format!(
                    "command '{}' is not permitted for this caller",
                    executable
                ));
            }
        }

        for token in argv {
            if let Some(raw) = path_candidates(token) {
                self.check_path(raw, extra_denied, base_dir)?;
            }
        }
        Ok(())
    }

    fn denied_prefix<'a>(&'a self, path: &Path, extra_denied: &'a [PathBuf]) -> Option<&'a PathBuf> {
        self.denied_paths
            .iter()
            .chain(extra_denied)
            .find(|d| path.starts_with(d))
    }

    fn check_path(
        &self,
        raw: &str,
        extra_denied: &[PathBuf],
        base_dir: Option<&Path>,
    ) -> Result<(), String> {
        let expanded = match raw.strip_prefix('~') {
            Some(rest) if rest.is_empty() || rest.starts_with('/') => match &self.home {
                Some(home) => home.join(rest.trim_start_matches('/')),
                None => return Err(format!("cannot resolve home directory in '{}'", raw)),
            },
            Some(_) => return Err(format!("unsupported user home reference '{}'", raw)),
            None => PathBuf::from(raw),
        };

        let resolved = if expanded.is_absolute() {
            lexical_normalize(&expanded)
        } else {
            match base_dir {
                Some(base) => lexical_normalize(&base.join(&expanded)),
                None => {
                    return Err(format!(
                        "cannot resolve relative path '{}' without a working directory",
                        raw
                    ))
                }
            }
        };

        if let Some(denied) = self.denied_prefix(&resolved, extra_denied) {
            return Err(format!(
                "path '{}' is under protected directory '{}'",
                raw,
                denied.display()
            ));
        }

        if !self.allowed_roots.is_empty() && !self.allowed_roots.iter().any(|r| resolved.starts_with(r))
        {
            return Err(format!("path '{}' is outside the allowed roots", raw));
        }
        Ok(())
    }
}

/// Re-quote every token so the shell sees exactly the validated words
fn render_shell(argvs: &[Vec<String>], ops: &[ChainOp]) -> String {
    let mut out = shell_words::join(&argvs[0]);
    for (argv, op) in argvs[1..].iter().zip(ops) {
        out.push(' ');
        out.push_str(op.as_str());
        out.push(' ');
        out.push_str(&shell_words::join(argv));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> PolicyValidator {
        let policy = PolicyConfig {
            allowed_commands: vec![
                "echo".into(),
                "ls".into(),
                "cat".into(),
                "grep".into(),
                "sleep".into(),
                "git status".into(),
                "python3*".into(),
            ],
            denied_paths: vec!["/etc".into(), "/root".into()],
            allowed_chains: vec!["ls | grep".into(), "echo  &&  echo".into()],
            allowed_path_roots: vec![],
        };
        PolicyValidator::new(&policy)
            .with_home(Some(PathBuf::from("/root")))
            .with_base_dir("/srv/work")
    }

    fn none() -> PermissionSet {
        PermissionSet::default()
    }

    fn reason(decision: PolicyDecision) -> String {
        match decision {
            PolicyDecision::Deny { reason } => reason,
            PolicyDecision::Allow(inv) => panic!("expected denial, got {:?}", inv),
        }
    }

    #[test]
    fn test_allowlisted_command_becomes_argv() {
        let decision = validator().check("echo 'hello world'", &none());
        assert_eq!(
            decision,
            PolicyDecision::Allow(Invocation::Argv(vec![
                "echo".to_string(),
                "hello world".to_string()
            ]))
        );
        assert_eq!(decision.as_verdict(), (true, ""));
    }

    #[test]
    fn test_unknown_executable_is_rejected() {
        let r = reason(validator().check("rm -rf /", &none()));
        assert!(r.contains("'rm'"), "{}", r);
    }

    #[test]
    fn test_multi_token_and_prefix_rules() {
        let v = validator();
        assert!(v.check("git status --short", &none()).is_allowed());
        assert!(!v.check("git push", &none()).is_allowed());
        assert!(v.check("python3.11 -V", &none()).is_allowed());
        assert!(!v.check("python -V", &none()).is_allowed());
    }

    #[test]
    fn test_metacharacters_are_rejected_even_when_quoted() {
        let v = validator();
        for cmd in ["echo $HOME", "echo `id`", "echo 'a' > out", "cat < in", "echo \"$(id)\""] {
            assert!(!v.check(cmd, &none()).is_allowed(), "{}", cmd);
        }
    }

    #[test]
    fn test_chaining_requires_allowlisted_shape() {
        let v = validator();
        assert!(!v.check("ls; rm -rf /", &none()).is_allowed());
        assert!(!v.check("ls | cat", &none()).is_allowed());
        assert!(!v.check("sleep 5 &", &none()).is_allowed());

        let decision = v.check("ls -la|grep 'my file'", &none());
        assert_eq!(
            decision,
            PolicyDecision::Allow(Invocation::Shell("ls -la | grep 'my file'".to_string()))
        );
        assert!(v.check("echo a && echo b", &none()).is_allowed());
    }

    #[test]
    fn test_operator_inside_quotes_is_literal() {
        let decision = validator().check("echo 'a | b; c'", &none());
        assert_eq!(
            decision,
            PolicyDecision::Allow(Invocation::Argv(vec![
                "echo".to_string(),
                "a | b; c".to_string()
            ]))
        );
    }

    #[test]
    fn test_denied_paths_override_allowlist() {
        let v = validator();
        assert!(!v.check("cat /etc/passwd", &none()).is_allowed());
        assert!(!v.check("cat /tmp/../etc/shadow", &none()).is_allowed());
        assert!(!v.check("cat ~/.ssh/id_rsa", &none()).is_allowed());
        assert!(!v.check("grep --file=/etc/hosts x", &none()).is_allowed());
        assert!(v.check("cat /etcetera/notes", &none()).is_allowed());
        assert!(v.check("cat /tmp/notes.txt", &none()).is_allowed());
    }

    #[test]
    fn test_paths_glued_to_short_flags_are_checked() {
        let v = validator();
        assert!(!v.check("grep -f/etc/shadow x", &none()).is_allowed());
        assert!(!v.check("grep -f /etc/shadow x", &none()).is_allowed());
        assert!(!v.check("ls -I~/.ssh", &none()).is_allowed());
        assert!(!v.check("cat -n../../etc/passwd", &none()).is_allowed());
        assert!(v.check("grep -c x notes.txt", &none()).is_allowed());
        assert!(v.check("grep -f/tmp/patterns x", &none()).is_allowed());
    }

    #[test]
    fn test_relative_paths_resolve_against_process_directory_by_default() {
        let expected = std::env::current_dir().ok().map(|d| lexical_normalize(&d));
        assert_eq!(PolicyValidator::new(&PolicyConfig::default()).base_dir, expected);

        let v = validator().with_base_dir("/");
        let r = reason(v.check("cat etc/passwd", &none()));
        assert!(r.contains("protected directory '/etc'"), "{}", r);
        assert!(!v.check("cat root/.ssh/id_rsa", &none()).is_allowed());
    }

    #[test]
    fn test_working_directory_under_denied_path_is_rejected() {
        let secrets = tempfile::tempdir().unwrap();
        std::fs::create_dir(secrets.path().join("keys")).unwrap();
        std::fs::write(secrets.path().join("keys/secret"), "TOPSECRET\n").unwrap();
        let policy = PolicyConfig {
            allowed_commands: vec!["cat".into(), "echo".into()],
            denied_paths: vec![secrets.path().display().to_string()],
            ..PolicyConfig::default()
        };
        let v = PolicyValidator::new(&policy).with_base_dir(secrets.path());

        let absolute = format!("cat {}/keys/secret", secrets.path().display());
        assert!(!v.check(&absolute, &none()).is_allowed());
        let r = reason(v.check("cat keys/secret", &none()));
        assert!(r.contains("working directory"), "{}", r);
        assert!(!v.check("echo hi", &none()).is_allowed());

        let r = reason(validator().check_in("cat notes", &none(), Path::new("/root/work")));
        assert!(r.contains("working directory"), "{}", r);
    }

    #[test]
    fn test_relative_path_without_working_directory_is_rejected() {
        let mut v = validator();
        v.base_dir = None;
        let r = reason(v.check("cat notes/a.txt", &none()));
        assert!(r.contains("without a working directory"), "{}", r);
        assert!(v.check("cat /tmp/notes.txt", &none()).is_allowed());
    }

    #[test]
    fn test_relative_paths_resolve_against_base_dir() {
        let v = validator().with_base_dir("/srv/work");
        assert!(v.check("cat notes/a.txt", &none()).is_allowed());
        assert!(!v.check("cat ../../etc/passwd", &none()).is_allowed());
    }

    #[test]
    fn test_check_in_uses_execution_directory() {
        let v = validator();
        let cwd = Path::new("/srv/work/exec-1");
        assert!(v.check_in("cat ../exec-2/out.txt", &none(), cwd).is_allowed());
        assert!(!v.check_in("cat ../../../../etc/passwd", &none(), cwd).is_allowed());
    }

    #[test]
    fn test_allowed_roots_confine_paths() {
        let policy = PolicyConfig {
            allowed_path_roots: vec!["/tmp".into()],
            ..PolicyConfig::default()
        };
        let v = PolicyValidator::new(&policy).with_base_dir("/tmp");
        assert!(v.check("ls /tmp/x", &none()).is_allowed());
        let r = reason(v.check("ls /var/log", &none()));
        assert!(r.contains("allowed roots"), "{}", r);
    }

    #[test]
    fn test_caller_permissions_narrow_never_widen() {
        let v = validator();
        let perms = PermissionSet {
            allowed_prefixes: vec!["echo".into(), "rm".into()],
            forbidden_paths: vec!["/tmp/private".into()],
        };
        assert!(v.check("echo hi", &perms).is_allowed());
        assert!(!v.check("ls", &perms).is_allowed());
        assert!(!v.check("rm x", &perms).is_allowed());
        assert!(!v.check("echo /tmp/private/key", &perms).is_allowed());
    }

    #[test]
    fn test_malformed_input_is_a_denial() {
        let v = validator();
        for cmd in ["", "   ", "echo 'unterminated", "ls |", "| grep x"] {
            assert!(!v.check(cmd, &none()).is_allowed(), "{:?}", cmd);
        }
    }

    #[test]
    fn test_lexical_normalize() {
        assert_eq!(lexical_normalize(Path::new("/a/./b/../c")), PathBuf::from("/a/c"));
        assert_eq!(lexical_normalize(Path::new("/../etc")), PathBuf::from("/etc"));
        assert_eq!(lexical_normalize(Path::new("a/../../b")), PathBuf::from("../b"));
    }
}
