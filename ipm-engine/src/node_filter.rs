//! Partition candidate nodes into "needs the operation" and "discard".
//!
//! Versions are probed in parallel with a bounded fan-out; the partition
//! itself ([`partition`]) is a pure function over the observed versions.

use crate::error::PatchError;
use crate::handler::HandlerState;
use crate::handler::targets::TargetProfile;
use crate::reporter::{ProgressChannel, ProgressSnapshot};
use crate::transport::Transport;
use crate::version::{TargetVersion, Version};
use ipm_common::types::{NodeCandidate, Operation, PatchRequest};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Outcome of filtering, in candidate order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterResult {
    pub included: Vec<NodeCandidate>,
    pub discarded: Vec<NodeCandidate>,
}

impl FilterResult {
    pub fn included_hosts(&self) -> Vec<String> {
        self.included.iter().map(|c| c.hostname.clone()).collect()
    }
}

/// Trim, drop empties and remove duplicates, keeping first occurrences.
pub fn dedupe_hosts(hosts: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    hosts
        .iter()
        .map(|h| h.trim())
        .filter(|h| !h.is_empty())
        .filter(|h| seen.insert(h.to_string()))
        .map(str::to_string)
        .collect()
}

/// Why `observed` is already compliant for `operation`, if it is.
pub fn discard_reason(operation: Operation, observed: Option<&Version>, target: &TargetVersion) -> Option<String> {
    let (observed, target) = (observed?, target.concrete()?);
    match (operation, observed.cmp(target)) {
        (Operation::PrereqCheck | Operation::Patch, Ordering::Greater | Ordering::Equal) => Some(format!(
            "already at {observed}, at or above target {target}"
        )),
        (Operation::RollbackPrereqCheck | Operation::Rollback, Ordering::Less | Ordering::Equal) => Some(format!(
            "already at {observed}, at or below target {target}"
        )),
        _ => None,
    }
}

/// Split observed nodes by [`discard_reason`]. Nodes with no parseable
/// version are always included.
pub fn partition(observed: Vec<(String, Option<Version>)>, operation: Operation, target: &TargetVersion) -> FilterResult {
    let mut result = FilterResult::default();
    for (host, version) in observed {
        let shown = version.as_ref().map(|v| v.as_str().to_string());
        match discard_reason(operation, version.as_ref(), target) {
            Some(reason) => result.discarded.push(NodeCandidate::discarded(host, shown, reason)),
            None => result.included.push(NodeCandidate::included(host, shown)),
        }
    }
    result
}

pub struct NodeFilter {
    transport: Transport,
    profile: &'static TargetProfile,
    parallelism: usize,
    progress: Arc<dyn ProgressChannel>,
}

impl NodeFilter {
    pub fn new(
        transport: Transport,
        profile: &'static TargetProfile,
        parallelism: usize,
        progress: Arc<dyn ProgressChannel>,
    ) -> Self {
        Self {
            transport,
            profile,
            parallelism: parallelism.max(1),
            progress,
        }
    }

    /// Read the current version of every host, in input order.
    ///
    /// Any host that cannot be reached fails the whole probe with
    /// [`PatchError::NodeUnreachable`]; hosts are never dropped silently.
    pub async fn probe_versions(&self, hosts: &[String]) -> Result<Vec<(String, Option<Version>)>, PatchError> {
        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let mut tasks = JoinSet::new();

        for (index, host) in hosts.iter().enumerate() {
            let transport = self.transport.clone();
            let semaphore = semaphore.clone();
            let host = host.clone();
            let command = self.profile.version_command;
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result = transport.run(&host, command).await;
                (index, host, result)
            });
        }

        let mut observed: Vec<Option<(String, Option<Version>)>> = vec![None; hosts.len()];
        let mut unreachable = Vec::new();
        let mut first_reason = None;

        while let Some(joined) = tasks.join_next().await {
            let (index, host, result) = joined.map_err(|e| PatchError::InvalidRequest(format!("version probe task failed: {e}")))?;
            match result {
                Ok(output) if output.success() => {
                    let version = Version::find_in(&output.stdout, self.profile.kind);
                    if version.is_none() {
                        warn!(host = %host, output = %output.stdout.trim(), "No parseable version in probe output");
                    }
                    debug!(host = %host, version = ?version.as_ref().map(Version::as_str), "Probed version");
                    observed[index] = Some((host, version));
                }
                Ok(output) => {
                    warn!(host = %host, exit_code = output.exit_code, "Version probe failed");
                    observed[index] = Some((host, None));
                }
                Err(err) => {
                    warn!(host = %host, error = %err, "Node unreachable");
                    first_reason.get_or_insert_with(|| err.to_string());
                    unreachable.push(host);
                }
            }
        }

        if !unreachable.is_empty() {
            unreachable.sort();
            return Err(PatchError::NodeUnreachable {
                nodes: unreachable,
                reason: first_reason.unwrap_or_default(),
            });
        }
        Ok(observed.into_iter().flatten().collect())
    }

    /// Probe, partition and publish the result before any node is touched.
    pub async fn filter(
        &self,
        request: &PatchRequest,
        candidates: &[String],
        target: &TargetVersion,
    ) -> Result<FilterResult, PatchError> {
        let hosts = dedupe_hosts(candidates);
        let observed = self.probe_versions(&hosts).await?;
        let result = partition(observed, request.operation, target);

        info!(
            request_id = %request.request_id,
            target = %request.target_kind,
            included = result.included.len(),
            discarded = result.discarded.len(),
            "Filtered nodes"
        );
        self.progress.publish(&ProgressSnapshot {
            request_id: request.request_id,
            target_kind: request.target_kind,
            stage: HandlerState::NodesFiltered,
            included: result.included_hosts(),
            discarded: result.discarded.clone(),
            detail: None,
        });
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::targets::profile;
    use crate::reporter::EventBus;
    use ipm_common::mock::{MockHost, MockRemote};
    use ipm_common::remote::CommandResult;
    use ipm_common::retry::RetryPolicy;
    use ipm_common::types::TargetKind;
    use proptest::prelude::*;

    fn v(s: &str) -> Version {
        s.parse().unwrap()
    }

    fn target(s: &str) -> TargetVersion {
        TargetVersion::Concrete(v(s))
    }

    #[test]
    fn test_patch_discards_compliant_nodes() {
        let observed = vec![
            ("n1".to_string(), Some(v("220101.0"))),
            ("n2".to_string(), Some(v("220201.0"))),
            ("n3".to_string(), Some(v("220301.0"))),
        ];
        let result = partition(observed, Operation::Patch, &target("220201.0"));
        assert_eq!(result.included_hosts(), vec!["n1"]);
        assert_eq!(result.discarded.len(), 2);
        assert!(result.discarded[0].discard_reason.as_deref().unwrap().contains("at or above"));
    }

    #[test]
    fn test_rollback_discards_nodes_at_or_below_target() {
        let observed = vec![
            ("n1".to_string(), Some(v("220101.0"))),
            ("n2".to_string(), Some(v("220301.0"))),
        ];
        let result = partition(observed, Operation::Rollback, &target("220201.0"));
        assert_eq!(result.included_hosts(), vec!["n2"]);
        assert_eq!(result.discarded[0].hostname, "n1");
    }

    #[test]
    fn test_unknown_versions_and_latest_are_included() {
        let observed = vec![("n1".to_string(), None), ("n2".to_string(), Some(v("220101.0")))];
        let result = partition(observed.clone(), Operation::Patch, &target("220101.0"));
        assert_eq!(result.included_hosts(), vec!["n1"]);
        assert_eq!(result.included[0].observed_version, None);

        let result = partition(observed, Operation::Patch, &TargetVersion::Latest);
        assert_eq!(result.included.len(), 2);
    }

    #[test]
    fn test_postcheck_never_discards() {
        let observed = vec![("n1".to_string(), Some(v("220301.0")))];
        let result = partition(observed, Operation::Postcheck, &target("220101.0"));
        assert_eq!(result.included.len(), 1);
    }

    #[test]
    fn test_dedupe_keeps_first_occurrence() {
        let hosts = vec![" n2".into(), "n1".into(), "n2".into(), "".into()];
        assert_eq!(dedupe_hosts(&hosts), vec!["n2", "n1"]);
    }

    fn filter_over(remote: &MockRemote) -> NodeFilter {
        NodeFilter::new(
            Transport::new(Arc::new(remote.clone()), RetryPolicy::immediate(2)),
            profile(TargetKind::Cell),
            2,
            Arc::new(EventBus::default()),
        )
    }

    #[tokio::test]
    async fn test_scenario_a_filter_over_remote() {
        let remote = MockRemote::default();
        remote.respond("n1", "imageinfo -ver", CommandResult::ok("21.2.10.0.0.220301\n"));
        remote.respond("n2", "imageinfo -ver", CommandResult::ok("21.2.11.0.0.220414.1\n"));

        let request = PatchRequest::new(
            TargetKind::Cell,
            Operation::Patch,
            "21.2.11.0.0.220414.1",
            vec!["db01".into()],
            vec!["n1".into(), "n2".into()],
        );
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let filter = NodeFilter::new(
            Transport::new(Arc::new(remote.clone()), RetryPolicy::immediate(1)),
            profile(TargetKind::Cell),
            4,
            Arc::new(bus),
        );
        let result = filter
            .filter(&request, &request.nodes, &target("21.2.11.0.0.220414.1"))
            .await
            .unwrap();

        assert_eq!(result.included_hosts(), vec!["n1"]);
        assert_eq!(result.discarded[0].hostname, "n2");
        let published: serde_json::Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(published["data"]["included"], serde_json::json!(["n1"]));
    }

    #[tokio::test]
    async fn test_unreachable_nodes_fail_the_probe() {
        let remote = MockRemote::default()
            .with_host("n2", MockHost::unreachable())
            .with_host("n3", MockHost::unreachable());
        let err = filter_over(&remote)
            .probe_versions(&["n1".into(), "n3".into(), "n2".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, PatchError::NodeUnreachable { ref nodes, .. } if nodes == &["n2", "n3"]));
    }

    #[tokio::test]
    async fn test_probe_keeps_input_order_under_fan_out() {
        let remote = MockRemote::default();
        let hosts: Vec<String> = (0..10).map(|i| format!("cel{i:02}")).collect();
        for (i, host) in hosts.iter().enumerate() {
            remote.respond(host.clone(), "imageinfo", CommandResult::ok(format!("2201{i:02}.0")));
        }
        let observed = filter_over(&remote).probe_versions(&hosts).await.unwrap();
        let order: Vec<_> = observed.iter().map(|(h, _)| h.clone()).collect();
        assert_eq!(order, hosts);
        assert!(observed.iter().all(|(_, v)| v.is_some()));
    }

    proptest! {
        #[test]
        fn prop_partition_is_exact(
            versions in proptest::collection::vec(proptest::option::of(100000u64..100010), 0..20),
            build in 100000u64..100010,
            rollback in any::<bool>(),
        ) {
            let observed: Vec<(String, Option<Version>)> = versions
                .iter()
                .enumerate()
                .map(|(i, b)| (format!("n{i}"), b.map(|b| v(&b.to_string()))))
                .collect();
            let operation = if rollback { Operation::Rollback } else { Operation::Patch };
            let result = partition(observed.clone(), operation, &target(&build.to_string()));

            let included: HashSet<_> = result.included.iter().map(|c| c.hostname.clone()).collect();
            let discarded: HashSet<_> = result.discarded.iter().map(|c| c.hostname.clone()).collect();
            prop_assert!(included.is_disjoint(&discarded));
            prop_assert_eq!(included.len() + discarded.len(), observed.len());
            let all: HashSet<_> = observed.iter().map(|(h, _)| h.clone()).collect();
            prop_assert_eq!(included.union(&discarded).cloned().collect::<HashSet<_>>(), all);
        }
    }
}
