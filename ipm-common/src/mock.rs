//! In-memory remote transport for tests and the mock overlay.
//!
//! [`MockRemote`] simulates a fleet of hosts, each with a small file map.
//! Commands are answered by registered rules (substring match, first match
//! wins) or by a handful of builtins (`test -e`, `cat`, `rm -f`, `mkdir -p`,
//! `echo`). Every executed command is logged so tests can assert on what the
//! engine did, e.g. that the patch tool was never launched.

use crate::remote::{CommandResult, RemoteError, RemoteExecutor, RemoteSession};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

// ── Fixtures ────────────────────────────────────────────────────────────

/// Request-supplied description of the simulated fleet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MockFixtures {
    /// Per-node behaviour keyed by hostname.
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeFixture>,
    #[serde(default)]
    pub tool: ToolFixture,
    /// Pretend another tool session is already running on the launch node.
    #[serde(default)]
    pub conflicting_session: bool,
}

impl MockFixtures {
    #[must_use]
    pub fn node(mut self, host: impl Into<String>, fixture: NodeFixture) -> Self {
        self.nodes.insert(host.into(), fixture);
        self
    }

    #[must_use]
    pub fn tool(mut self, tool: ToolFixture) -> Self {
        self.tool = tool;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeFixture {
    /// Version reported before the tool runs.
    pub version: Option<String>,
    /// Version reported after a successful tool run; defaults to `version`.
    #[serde(default)]
    pub post_version: Option<String>,
    #[serde(default = "default_true")]
    pub services_healthy: bool,
    #[serde(default = "default_true")]
    pub reachable: bool,
}

impl NodeFixture {
    pub fn at(version: impl Into<String>) -> Self {
        Self {
            version: Some(version.into()),
            post_version: None,
            services_healthy: true,
            reachable: true,
        }
    }

    #[must_use]
    pub fn becomes(mut self, version: impl Into<String>) -> Self {
        self.post_version = Some(version.into());
        self
    }

    #[must_use]
    pub fn unhealthy(mut self) -> Self {
        self.services_healthy = false;
        self
    }

    #[must_use]
    pub fn unreachable(mut self) -> Self {
        self.reachable = false;
        self
    }
}

/// How the simulated patch tool behaves once launched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolFixture {
    /// Exit status written to the terminator line.
    #[serde(default)]
    pub exit_status: i32,
    /// Console reads before the terminator line appears.
    #[serde(default = "default_polls")]
    pub polls_until_exit: u32,
    /// Never write a terminator.
    #[serde(default)]
    pub never_exits: bool,
    /// Create the notifications directory after launch.
    #[serde(default = "default_true")]
    pub acknowledges: bool,
}

impl Default for ToolFixture {
    fn default() -> Self {
        Self {
            exit_status: 0,
            polls_until_exit: default_polls(),
            never_exits: false,
            acknowledges: true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_polls() -> u32 {
    1
}

// ── Transport ───────────────────────────────────────────────────────────

/// Behaviour knobs for the mock transport.
#[derive(Debug, Clone, Default)]
pub struct MockConfig {
    /// Delay added to every command.
    pub latency: Duration,
    /// Refuse every connection.
    pub connection_failure: bool,
    /// Unknown hosts fail to connect and unknown commands exit 127.
    pub strict: bool,
}

impl MockConfig {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn connection_failure() -> Self {
        Self {
            connection_failure: true,
            ..Self::default()
        }
    }

    pub fn strict() -> Self {
        Self {
            strict: true,
            ..Self::default()
        }
    }
}

/// State of one simulated host.
#[derive(Debug, Clone)]
pub struct MockHost {
    pub reachable: bool,
    pub files: BTreeMap<String, String>,
    pub dirs: BTreeSet<String>,
    /// Remaining commands that fail with a transport error.
    pub transport_failures: u32,
    /// Free-form counters rules can use to sequence responses.
    pub counters: BTreeMap<String, u64>,
}

impl Default for MockHost {
    fn default() -> Self {
        Self {
            reachable: true,
            files: BTreeMap::new(),
            dirs: BTreeSet::new(),
            transport_failures: 0,
            counters: BTreeMap::new(),
        }
    }
}

impl MockHost {
    pub fn unreachable() -> Self {
        Self {
            reachable: false,
            ..Self::default()
        }
    }

    pub fn path_exists(&self, path: &str) -> bool {
        if self.files.contains_key(path) || self.dirs.contains(path) {
            return true;
        }
        let prefix = format!("{}/", path.trim_end_matches('/'));
        self.files.keys().any(|f| f.starts_with(&prefix))
            || self.dirs.iter().any(|d| d.starts_with(&prefix))
    }

    /// Bump a named counter and return the new value.
    pub fn bump(&mut self, counter: &str) -> u64 {
        let value = self.counters.entry(counter.to_string()).or_insert(0);
        *value += 1;
        *value
    }
}

/// One command observed by the mock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutedCommand {
    pub host: String,
    pub command: String,
}

/// Whole simulated fleet, handed to rule responders.
#[derive(Debug, Default)]
pub struct MockFleet {
    pub hosts: BTreeMap<String, MockHost>,
    pub executed: Vec<ExecutedCommand>,
}

impl MockFleet {
    pub fn host_mut(&mut self, host: &str) -> &mut MockHost {
        self.hosts.entry(host.to_string()).or_default()
    }
}

type Responder = Arc<dyn Fn(&mut MockFleet, &str, &str) -> CommandResult + Send + Sync>;

struct MockRule {
    host: Option<String>,
    pattern: String,
    respond: Responder,
}

/// Shared handle to a simulated fleet. Clones observe the same state.
#[derive(Clone)]
pub struct MockRemote {
    config: MockConfig,
    fleet: Arc<Mutex<MockFleet>>,
    rules: Arc<Mutex<Vec<MockRule>>>,
}

impl std::fmt::Debug for MockRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockRemote")
            .field("config", &self.config)
            .field("hosts", &self.fleet().hosts.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for MockRemote {
    fn default() -> Self {
        Self::new(MockConfig::success())
    }
}

impl MockRemote {
    pub fn new(config: MockConfig) -> Self {
        Self {
            config,
            fleet: Arc::new(Mutex::new(MockFleet::default())),
            rules: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn fleet(&self) -> MutexGuard<'_, MockFleet> {
        self.fleet.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn rules(&self) -> MutexGuard<'_, Vec<MockRule>> {
        self.rules.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[must_use]
    pub fn with_host(self, host: impl Into<String>, state: MockHost) -> Self {
        self.fleet().hosts.insert(host.into(), state);
        self
    }

    /// Answer any command containing `pattern` on any host.
    pub fn on<F>(&self, pattern: impl Into<String>, respond: F) -> &Self
    where
        F: Fn(&mut MockFleet, &str, &str) -> CommandResult + Send + Sync + 'static,
    {
        self.rules().push(MockRule {
            host: None,
            pattern: pattern.into(),
            respond: Arc::new(respond),
        });
        self
    }

    /// Answer commands containing `pattern` on `host` only.
    pub fn on_host<F>(&self, host: impl Into<String>, pattern: impl Into<String>, respond: F) -> &Self
    where
        F: Fn(&mut MockFleet, &str, &str) -> CommandResult + Send + Sync + 'static,
    {
        self.rules().push(MockRule {
            host: Some(host.into()),
            pattern: pattern.into(),
            respond: Arc::new(respond),
        });
        self
    }

    /// Fixed response for commands containing `pattern` on `host`.
    pub fn respond(&self, host: impl Into<String>, pattern: impl Into<String>, result: CommandResult) -> &Self {
        self.on_host(host, pattern, move |_, _, _| result.clone())
    }

    pub fn set_reachable(&self, host: &str, reachable: bool) {
        self.fleet().host_mut(host).reachable = reachable;
    }

    /// Make the next `count` commands on `host` fail with a transport error.
    pub fn fail_next(&self, host: &str, count: u32) {
        self.fleet().host_mut(host).transport_failures = count;
    }

    pub fn set_file(&self, host: &str, path: &str, contents: &str) {
        self.fleet()
            .host_mut(host)
            .files
            .insert(path.to_string(), contents.to_string());
    }

    pub fn file(&self, host: &str, path: &str) -> Option<String> {
        self.fleet().hosts.get(host).and_then(|h| h.files.get(path).cloned())
    }

    pub fn path_exists(&self, host: &str, path: &str) -> bool {
        self.fleet()
            .hosts
            .get(host)
            .is_some_and(|h| h.path_exists(path))
    }

    /// All files currently on `host`.
    pub fn files(&self, host: &str) -> BTreeMap<String, String> {
        self.fleet()
            .hosts
            .get(host)
            .map(|h| h.files.clone())
            .unwrap_or_default()
    }

    pub fn executed(&self) -> Vec<ExecutedCommand> {
        self.fleet().executed.clone()
    }

    /// Number of executed commands containing `pattern`.
    pub fn count_matching(&self, pattern: &str) -> usize {
        self.fleet()
            .executed
            .iter()
            .filter(|c| c.command.contains(pattern))
            .count()
    }

    /// Run `f` against the fleet state.
    pub fn with_fleet<R>(&self, f: impl FnOnce(&mut MockFleet) -> R) -> R {
        f(&mut self.fleet())
    }

    fn dispatch(&self, host: &str, command: &str) -> Result<CommandResult, RemoteError> {
        let responder = self
            .rules()
            .iter()
            .find(|rule| {
                rule.host.as_deref().is_none_or(|h| h == host) && command.contains(&rule.pattern)
            })
            .map(|rule| rule.respond.clone());

        let mut fleet = self.fleet();
        fleet.executed.push(ExecutedCommand {
            host: host.to_string(),
            command: command.to_string(),
        });

        let state = fleet.host_mut(host);
        if !state.reachable {
            return Err(RemoteError::Transport {
                host: host.to_string(),
                reason: "host went away".to_string(),
            });
        }
        if state.transport_failures > 0 {
            state.transport_failures -= 1;
            return Err(RemoteError::Transport {
                host: host.to_string(),
                reason: "connection reset by peer".to_string(),
            });
        }

        if let Some(respond) = responder {
            return Ok(respond(&mut fleet, host, command));
        }
        Ok(builtin(fleet.host_mut(host), command, self.config.strict))
    }
}

fn unquote(token: &str) -> String {
    token.trim_matches('\'').replace("'\\''", "'")
}

fn builtin(state: &mut MockHost, command: &str, strict: bool) -> CommandResult {
    let tokens: Vec<&str> = command.split_whitespace().collect();
    match tokens.as_slice() {
        ["test", "-e" | "-f" | "-d", path] => {
            if state.path_exists(&unquote(path)) {
                CommandResult::ok("")
            } else {
                CommandResult::failed(1, "")
            }
        }
        ["cat", path] => match state.files.get(&unquote(path)) {
            Some(contents) => CommandResult::ok(contents.clone()),
            None => CommandResult::failed(1, format!("cat: {}: No such file or directory", unquote(path))),
        },
        ["rm", flags, paths @ ..] if flags.starts_with('-') => {
            for path in paths {
                let path = unquote(path);
                let prefix = format!("{}/", path.trim_end_matches('/'));
                state.files.remove(&path);
                state.dirs.remove(&path);
                if flags.contains('r') {
                    state.files.retain(|f, _| !f.starts_with(&prefix));
                    state.dirs.retain(|d| !d.starts_with(&prefix));
                }
            }
            CommandResult::ok("")
        }
        ["mkdir", "-p", paths @ ..] => {
            for path in paths {
                state.dirs.insert(unquote(path));
            }
            CommandResult::ok("")
        }
        ["set", "-o", "noclobber;", "echo", value, ">", path] => {
            let path = unquote(path);
            if state.files.contains_key(&path) {
                CommandResult::failed(1, format!("sh: {path}: cannot overwrite existing file"))
            } else {
                state.files.insert(path, format!("{}\n", unquote(value)));
                CommandResult::ok("")
            }
        }
        ["echo", rest @ ..] => CommandResult::ok(format!("{}\n", rest.join(" "))),
        ["true"] => CommandResult::ok(""),
        _ if strict => CommandResult::failed(127, format!("mock: no rule for '{command}'")),
        _ => CommandResult::ok(""),
    }
}

#[async_trait]
impl RemoteExecutor for MockRemote {
    async fn connect(&self, host: &str) -> Result<Box<dyn RemoteSession>, RemoteError> {
        if self.config.connection_failure {
            return Err(RemoteError::Connect {
                host: host.to_string(),
                reason: "mock connection failure".to_string(),
            });
        }
        {
            let mut fleet = self.fleet();
            let known = fleet.hosts.contains_key(host);
            if !known && self.config.strict {
                return Err(RemoteError::Connect {
                    host: host.to_string(),
                    reason: "unknown mock host".to_string(),
                });
            }
            if !fleet.host_mut(host).reachable {
                return Err(RemoteError::Connect {
                    host: host.to_string(),
                    reason: "No route to host".to_string(),
                });
            }
        }
        Ok(Box::new(MockSession {
            host: host.to_string(),
            remote: self.clone(),
        }))
    }
}

struct MockSession {
    host: String,
    remote: MockRemote,
}

#[async_trait]
impl RemoteSession for MockSession {
    fn host(&self) -> &str {
        &self.host
    }

    async fn execute(&mut self, command: &str) -> Result<CommandResult, RemoteError> {
        if !self.remote.config.latency.is_zero() {
            tokio::time::sleep(self.remote.config.latency).await;
        }
        self.remote.dispatch(&self.host, command)
    }

    async fn write_file(&mut self, path: &str, contents: &str) -> Result<CommandResult, RemoteError> {
        let command = format!("write {path}");
        let mut fleet = self.remote.fleet();
        fleet.executed.push(ExecutedCommand {
            host: self.host.clone(),
            command,
        });
        let state = fleet.host_mut(&self.host);
        if !state.reachable {
            return Err(RemoteError::Transport {
                host: self.host.clone(),
                reason: "host went away".to_string(),
            });
        }
        state.files.insert(path.to_string(), contents.to_string());
        Ok(CommandResult::ok(""))
    }

    async fn disconnect(self: Box<Self>) -> Result<(), RemoteError> {
        Ok(())
    }
}
