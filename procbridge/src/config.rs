//! Bridge configuration.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};

use crate::error::SpawnError;

pub const HANDSHAKE_TIMEOUT_ENV: &str = "PROCBRIDGE_HANDSHAKE_TIMEOUT_MS";
pub const REQUEST_TIMEOUT_ENV: &str = "PROCBRIDGE_REQUEST_TIMEOUT_MS";
pub const STOP_GRACE_ENV: &str = "PROCBRIDGE_STOP_GRACE_MS";

/// What to run as the worker.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub envs: Vec<(OsString, OsString)>,
    pub current_dir: Option<PathBuf>,
}

/// Extension point for different worker spawn strategies.
///
/// The returned child must have stdin, stdout and stderr piped.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, command: &CommandSpec) -> Result<Child, SpawnError>;
}

/// Spawns the command directly with all three stdio streams piped.
pub struct CommandSpawner;

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self, command: &CommandSpec) -> Result<Child, SpawnError> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(command.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &command.current_dir {
            cmd.current_dir(dir);
        }
        Ok(cmd.spawn()?)
    }
}

#[derive(Clone)]
pub struct BridgeConfig {
    pub command: CommandSpec,
    /// Upper bound on waiting for the alive token after spawn.
    pub handshake_timeout: Duration,
    /// Per-request deadline. `None` waits forever.
    pub request_timeout: Option<Duration>,
    /// Time between SIGINT and SIGKILL in `stop()`.
    pub stop_grace_period: Duration,
    /// Reject pending requests when the worker exits on its own.
    pub fail_pending_on_exit: bool,
    pub event_capacity: usize,
    pub spawner: Arc<dyn WorkerSpawner>,
}

impl std::fmt::Debug for BridgeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeConfig")
            .field("command", &self.command)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("stop_grace_period", &self.stop_grace_period)
            .field("fail_pending_on_exit", &self.fail_pending_on_exit)
            .field("event_capacity", &self.event_capacity)
            .finish_non_exhaustive()
    }
}

impl BridgeConfig {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            command: CommandSpec {
                program: program.into(),
                args: Vec::new(),
                envs: Vec::new(),
                current_dir: None,
            },
            handshake_timeout: Duration::from_secs(30),
            request_timeout: None,
            stop_grace_period: Duration::from_secs(5),
            fail_pending_on_exit: true,
            event_capacity: 64,
            spawner: Arc::new(CommandSpawner),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.command.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.command.envs.push((key.into(), value.into()));
        self
    }

    pub fn with_current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.command.current_dir = Some(dir.into());
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_stop_grace_period(mut self, grace: Duration) -> Self {
        self.stop_grace_period = grace;
        self
    }

    pub fn with_fail_pending_on_exit(mut self, fail: bool) -> Self {
        self.fail_pending_on_exit = fail;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    /// Apply `PROCBRIDGE_*_MS` overrides from the process environment.
    pub fn with_env_overrides(self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup. Unparsable values are logged
    /// and ignored. A request timeout of `0` disables the deadline.
    pub fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(ms) = parse_millis(&lookup, HANDSHAKE_TIMEOUT_ENV) {
            self.handshake_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_millis(&lookup, REQUEST_TIMEOUT_ENV) {
            self.request_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(ms) = parse_millis(&lookup, STOP_GRACE_ENV) {
            self.stop_grace_period = Duration::from_millis(ms);
        }
        self
    }
}

fn parse_millis(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(ms) => Some(ms),
        Err(e) => {
            tracing::warn!(key, value = %raw, error = %e, "Ignoring invalid duration override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults() {
        let config = BridgeConfig::new("worker");
        assert_eq!(config.command.program, "worker");
        assert!(config.command.args.is_empty());
        assert_eq!(config.handshake_timeout, Duration::from_secs(30));
        assert_eq!(config.request_timeout, None);
        assert_eq!(config.stop_grace_period, Duration::from_secs(5));
        assert!(config.fail_pending_on_exit);
    }

    #[test]
    fn builder_accumulates() {
        let config = BridgeConfig::new("python3")
            .with_args(["-u", "worker.py"])
            .with_env("MODE", "fast")
            .with_current_dir("/srv")
            .with_request_timeout(Some(Duration::from_secs(2)))
            .with_fail_pending_on_exit(false);
        assert_eq!(config.command.args, vec!["-u", "worker.py"]);
        assert_eq!(config.command.envs.len(), 1);
        assert_eq!(config.command.current_dir, Some(PathBuf::from("/srv")));
        assert_eq!(config.request_timeout, Some(Duration::from_secs(2)));
        assert!(!config.fail_pending_on_exit);
    }

    #[test]
    fn overrides_apply_and_ignore_garbage() {
        let vars: HashMap<&str, &str> = HashMap::from([
            (HANDSHAKE_TIMEOUT_ENV, "1500"),
            (REQUEST_TIMEOUT_ENV, "250"),
            (STOP_GRACE_ENV, "soon"),
        ]);
        let config = BridgeConfig::new("worker")
            .apply_overrides(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.handshake_timeout, Duration::from_millis(1500));
        assert_eq!(config.request_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.stop_grace_period, Duration::from_secs(5));
    }

    #[test]
    fn zero_request_timeout_disables_deadline() {
        let config = BridgeConfig::new("worker")
            .with_request_timeout(Some(Duration::from_secs(1)))
            .apply_overrides(|k| (k == REQUEST_TIMEOUT_ENV).then(|| "0".to_string()));
        assert_eq!(config.request_timeout, None);
    }
}
