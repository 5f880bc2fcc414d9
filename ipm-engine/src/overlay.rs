//! Mock overlay: a simulated fleet programmed from request fixtures.
//!
//! Each node keeps its simulated state in files under [`STATE_DIR`]. The
//! patch tool is emulated by rules that react to the launch command, the
//! process probe and console reads the same way a real launch node would.

use crate::handler::HandlerSettings;
use crate::handler::targets::profile;
use crate::session::PROCESS_PROBE;
use ipm_common::mock::{MockFixtures, MockFleet, MockRemote, NodeFixture};
use ipm_common::remote::CommandResult;
use ipm_common::types::{PatchRequest, TargetKind};
use tracing::debug;

pub const STATE_DIR: &str = "/.ipm-mock";

const AUTHORIZED_KEYS: &str = "~/.ssh/authorized_keys";
const TAG_PREFIX: &str = "ipm-transient-";

const RUNNING: &str = "tool_running";
const HOLD: &str = "tool_hold";
const FOREIGN: &str = "foreign_tool";
const READS: &str = "console_reads";

fn state_file(name: &str) -> String {
    format!("{STATE_DIR}/{name}")
}

fn unquote(token: &str) -> String {
    token.trim_matches('\'').to_string()
}

/// Builds simulated fleets.
pub struct MockOverlay;

impl MockOverlay {
    /// Fleet for `request`, programmed from its fixtures.
    pub fn build(request: &PatchRequest, settings: &HandlerSettings) -> MockRemote {
        let remote = MockRemote::default();
        let fixtures = request.fixtures.clone().unwrap_or_default();
        let kind = request.target_kind;
        let base = settings.patch_base.trim_end_matches('/').to_string();

        for node in &request.nodes {
            let fixture = fixtures.nodes.get(node);
            seed_node(&remote, node, fixture, &request.target_version);
        }
        for candidate in &request.launch_node_candidates {
            remote.set_file(candidate, &settings.trust_key_path, &format!("ssh-rsa AAAAB3NzaMock root@{candidate}\n"));
            remote.set_file(candidate, &format!("{base}/patchmgr"), "#!/bin/sh\n");
            if fixtures.conflicting_session {
                remote.with_fleet(|fleet| {
                    fleet.host_mut(candidate).counters.insert(FOREIGN.into(), 1);
                });
            }
            if fixtures.nodes.get(candidate).is_some_and(|f| !f.reachable) {
                remote.set_reachable(candidate, false);
            }
        }

        trust_rules(&remote);
        tool_rules(&remote, &fixtures, request.operation.changes_version());
        node_rules(&remote, kind);
        debug!(
            request_id = %request.request_id,
            nodes = request.nodes.len(),
            "Programmed mock overlay"
        );
        remote
    }

    /// Let a tool held by `neverExits` finish on its next console read.
    pub fn release_tool(remote: &MockRemote, launch_node: &str) {
        remote.with_fleet(|fleet| {
            fleet.host_mut(launch_node).counters.remove(HOLD);
        });
    }

    /// Simulated version of `node`, if any.
    pub fn node_version(remote: &MockRemote, node: &str) -> Option<String> {
        remote.file(node, &state_file("version"))
    }
}

fn seed_node(remote: &MockRemote, node: &str, fixture: Option<&NodeFixture>, target_version: &str) {
    match fixture {
        Some(fixture) => {
            if let Some(version) = &fixture.version {
                remote.set_file(node, &state_file("version"), version);
            }
            if let Some(post) = fixture.post_version.as_ref().or(fixture.version.as_ref()) {
                remote.set_file(node, &state_file("post_version"), post);
            }
            remote.set_file(node, &state_file("healthy"), if fixture.services_healthy { "1" } else { "0" });
            if !fixture.reachable {
                remote.set_reachable(node, false);
            }
        }
        None => {
            remote.set_file(node, &state_file("post_version"), target_version);
            remote.set_file(node, &state_file("healthy"), "1");
        }
    }
}

fn healthy(fleet: &mut MockFleet, host: &str) -> bool {
    fleet
        .host_mut(host)
        .files
        .get(&state_file("healthy"))
        .is_none_or(|flag| flag == "1")
}

/// Rules emulating transient key install, removal and verification.
pub fn trust_rules(remote: &MockRemote) {
    fn tag_of(command: &str) -> Option<String> {
        let start = command.find(TAG_PREFIX)?;
        Some(
            command[start..]
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || *c == '-')
                .collect(),
        )
    }

    remote.on("sed -i", |fleet, host, cmd| {
        if let Some(tag) = tag_of(cmd)
            && let Some(keys) = fleet.host_mut(host).files.get_mut(AUTHORIZED_KEYS)
        {
            *keys = keys
                .lines()
                .filter(|line| !line.contains(&tag))
                .map(|line| format!("{line}\n"))
                .collect();
        }
        CommandResult::ok("")
    });
    remote.on("grep -qF", |fleet, host, cmd| {
        let Some(tag) = tag_of(cmd) else {
            return CommandResult::failed(1, "no key tag");
        };
        let keys = fleet.host_mut(host).files.entry(AUTHORIZED_KEYS.into()).or_default();
        if !keys.contains(&tag) {
            keys.push_str(&format!("ssh-rsa AAAAB3NzaMock {tag}\n"));
        }
        CommandResult::ok("")
    });
    remote.on("ssh -o BatchMode=yes", |fleet, _, cmd| {
        let target = cmd.split_whitespace().rev().nth(1).map(unquote).unwrap_or_default();
        let state = fleet.host_mut(&target);
        let trusted = state.reachable
            && state
                .files
                .get(AUTHORIZED_KEYS)
                .is_some_and(|keys| keys.contains(TAG_PREFIX));
        if trusted {
            CommandResult::ok("")
        } else {
            CommandResult::failed(255, format!("{target}: Permission denied (publickey)"))
        }
    });
}

/// Rules emulating the detached patch tool on the launch node.
fn tool_rules(remote: &MockRemote, fixtures: &MockFixtures, changes_version: bool) {
    let tool = fixtures.tool.clone();
    remote.on("nohup ./patchmgr", move |fleet, host, cmd| {
        let tokens: Vec<&str> = cmd.split_whitespace().collect();
        let after = |word: &str, skip: usize| {
            tokens
                .iter()
                .position(|t| *t == word)
                .and_then(|i| tokens.get(i + skip))
                .map(|t| unquote(t))
        };
        let (Some(list), Some(log_dir), Some(console)) = (after("./patchmgr", 2), after("--log_dir", 1), after("&>", 1))
        else {
            return CommandResult::failed(2, "patchmgr: bad arguments");
        };

        let state = fleet.host_mut(host);
        state.files.insert(state_file("tool_list"), list);
        state.files.insert(console, "INFO: patchmgr started\nWorking: patching nodes\n".into());
        state.counters.insert(READS.into(), 0);
        if tool.never_exits {
            state.counters.insert(HOLD.into(), 1);
        }
        if tool.acknowledges {
            state.dirs.insert(format!("{log_dir}/notifications"));
            state.counters.insert(RUNNING.into(), 1);
        }
        CommandResult::ok("")
    });

    remote.on(PROCESS_PROBE, |fleet, host, _| {
        let counters = &fleet.host_mut(host).counters;
        let running = [RUNNING, FOREIGN]
            .iter()
            .any(|c| counters.get(*c).copied().unwrap_or(0) > 0);
        if running {
            CommandResult::ok("root 4242 1 0 10:00 ? 00:00:01 ./patchmgr --cells cell_group --patch\n")
        } else {
            CommandResult::failed(1, "")
        }
    });

    let tool = fixtures.tool.clone();
    remote.on("PatchmgrConsole.out", move |fleet, host, cmd| {
        let Some(path) = cmd.strip_prefix("cat ").map(|p| unquote(p.trim())) else {
            return CommandResult::ok("");
        };
        let state = fleet.host_mut(host);
        if !state.files.contains_key(&path) {
            return CommandResult::failed(1, format!("cat: {path}: No such file or directory"));
        }
        let reads = state.bump(READS);
        let running = state.counters.get(RUNNING).copied().unwrap_or(0) > 0;
        let held = state.counters.get(HOLD).copied().unwrap_or(0) > 0;
        if running && !held && reads >= u64::from(tool.polls_until_exit) {
            state.counters.insert(RUNNING.into(), 0);
            if let Some(console) = state.files.get_mut(&path) {
                console.push_str(&format!("SUCCESS: all steps done\nExit status:{}\n", tool.exit_status));
            }
            if tool.exit_status == 0 && changes_version {
                apply_post_versions(fleet, host);
            }
        }
        CommandResult::ok(fleet.host_mut(host).files.get(&path).cloned().unwrap_or_default())
    });
}

fn apply_post_versions(fleet: &mut MockFleet, launch_node: &str) {
    let launch = fleet.host_mut(launch_node);
    let Some(list) = launch.files.get(&state_file("tool_list")).cloned() else {
        return;
    };
    let nodes: Vec<String> = launch
        .files
        .get(&list)
        .map(|contents| contents.lines().map(str::trim).filter(|l| !l.is_empty()).map(String::from).collect())
        .unwrap_or_default();
    for node in nodes {
        let state = fleet.host_mut(&node);
        if let Some(post) = state.files.get(&state_file("post_version")).cloned() {
            state.files.insert(state_file("version"), post);
        }
    }
}

/// Version, health and VM state probes.
fn node_rules(remote: &MockRemote, kind: TargetKind) {
    let profile = profile(kind);
    if let Some(command) = profile.vm_state_command {
        remote.on(command, |fleet, host, _| {
            if healthy(fleet, host) {
                CommandResult::ok("vm01\n")
            } else {
                CommandResult::ok("")
            }
        });
    }

    remote.on(profile.version_command, |fleet, host, _| {
        let version = fleet.host_mut(host).files.get(&state_file("version")).cloned();
        CommandResult::ok(version.map(|v| format!("{v}\n")).unwrap_or_default())
    });

    remote.on(profile.health_command, move |fleet, host, _| {
        let up = healthy(fleet, host);
        match (kind, up) {
            (TargetKind::Dom0, true) => CommandResult::ok("active\n"),
            (TargetKind::Dom0, false) => CommandResult::ok("inactive\n"),
            (TargetKind::DomU, true) => CommandResult::ok(
                "CRS-4638: Oracle High Availability Services is online\n\
                 CRS-4537: Cluster Ready Services is online\n\
                 CRS-4529: Cluster Synchronization Services is online\n\
                 CRS-4533: Event Manager is online\n",
            ),
            (TargetKind::DomU, false) => CommandResult::ok("CRS-4535: Cannot communicate with Cluster Ready Services\n"),
            (TargetKind::Cell, true) => CommandResult::ok("\t running running running\n"),
            (TargetKind::Cell, false) => CommandResult::ok("\t running stopped running\n"),
            (_, true) => CommandResult::ok(""),
            (_, false) => CommandResult::failed(1, "switch services not running"),
        }
    });
}
