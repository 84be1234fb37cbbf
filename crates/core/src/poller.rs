use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::compute::{ComputeGateway, Instance, RequestContext};
use crate::error::{HcpError, Result};
use crate::job::CancelToken;
use crate::remote::RemoteExecutor;

/// Polling cadence for [`ReadinessPoller`]: start at `interval`, multiply by
/// `backoff` after every round up to `max_interval`, give up after `timeout`.
#[derive(Debug, Clone, PartialEq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_interval: Duration,
    pub backoff: f64,
    pub timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        PollPolicy {
            interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(30),
            backoff: 1.5,
            timeout: Duration::from_secs(20 * 60),
        }
    }
}

impl PollPolicy {
    /// Zero or inverted bounds would spin the poll and store-watch loops.
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(HcpError::Config("poll interval must be greater than zero".into()));
        }
        if self.max_interval < self.interval {
            return Err(HcpError::Config(
                "max poll interval must not be shorter than the poll interval".into(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(HcpError::Config("ready timeout must be greater than zero".into()));
        }
        Ok(())
    }

    pub fn next_interval(&self, current: Duration) -> Duration {
        current.mul_f64(self.backoff.max(1.0)).min(self.max_interval)
    }
}

/// A launched VM the poller is waiting on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingNode {
    pub name: String,
    pub instance_id: String,
    pub internal_ip: Option<String>,
    pub external_ip: Option<String>,
    pub ready: bool,
}

impl PendingNode {
    pub fn new(name: &str, instance_id: &str) -> Self {
        PendingNode {
            name: name.to_string(),
            instance_id: instance_id.to_string(),
            internal_ip: None,
            external_ip: None,
            ready: false,
        }
    }
}

pub struct ReadinessPoller {
    compute: Arc<dyn ComputeGateway>,
    executor: Arc<dyn RemoteExecutor>,
    policy: PollPolicy,
}

impl ReadinessPoller {
    pub fn new(
        compute: Arc<dyn ComputeGateway>,
        executor: Arc<dyn RemoteExecutor>,
        policy: PollPolicy,
    ) -> Self {
        ReadinessPoller {
            compute,
            executor,
            policy,
        }
    }

    /// Blocks until every node has both addresses and runs `probe_command`
    /// successfully. Probe and lookup failures only keep a node pending.
    pub async fn await_ready(
        &self,
        ctx: &RequestContext,
        nodes: &mut [PendingNode],
        probe_command: &str,
        cancel: &CancelToken,
    ) -> Result<()> {
        let started = Instant::now();
        let deadline = started + self.policy.timeout;
        let mut interval = self.policy.interval;

        loop {
            if cancel.is_cancelled() {
                return Err(HcpError::Cancelled);
            }

            self.poll_round(ctx, nodes, probe_command).await;

            let pending: Vec<String> = nodes
                .iter()
                .filter(|n| !n.ready)
                .map(|n| n.name.clone())
                .collect();
            if pending.is_empty() {
                info!(nodes = nodes.len(), "all nodes ready");
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(HcpError::ReadinessTimeout {
                    waited: now - started,
                    pending,
                });
            }

            debug!(pending = pending.len(), wait_ms = interval.as_millis() as u64, "nodes still pending");
            tokio::select! {
                _ = cancel.cancelled() => return Err(HcpError::Cancelled),
                _ = tokio::time::sleep(interval.min(deadline - now)) => {}
            }
            interval = self.policy.next_interval(interval);
        }
    }

    async fn poll_round(&self, ctx: &RequestContext, nodes: &mut [PendingNode], probe_command: &str) {
        if nodes.iter().any(|n| !n.ready && n.external_ip.is_none()) {
            match self.compute.list_instances(ctx).await {
                Ok(instances) => assign_addresses(nodes, &instances),
                Err(e) => warn!(error = %e, "instance listing failed, retrying next round"),
            }
        }

        let probes = nodes
            .iter_mut()
            .filter(|n| !n.ready && n.external_ip.is_some())
            .map(|node| self.probe(node, probe_command));
        join_all(probes).await;
    }

    async fn probe(&self, node: &mut PendingNode, probe_command: &str) {
        let Some(host) = node.external_ip.clone() else {
            return;
        };

        let mut session = match self.executor.connect(&host).await {
            Ok(session) => session,
            Err(e) => {
                debug!(node = %node.name, host = %host, error = %e, "not reachable yet");
                return;
            }
        };

        match session.run(probe_command).await {
            Ok(output) if output.code == 0 => {
                info!(node = %node.name, host = %host, "node ready");
                node.ready = true;
            }
            Ok(output) => {
                debug!(node = %node.name, code = output.code, "probe exited non-zero");
            }
            Err(e) => {
                debug!(node = %node.name, error = %e, "probe failed");
            }
        }
        session.close().await;
    }
}

/// Copies addresses from the provider listing onto nodes that lack them. A VM
/// with only its internal address is left pending.
fn assign_addresses(nodes: &mut [PendingNode], instances: &[Instance]) {
    let by_id: HashMap<&str, &Instance> = instances.iter().map(|i| (i.id.as_str(), i)).collect();
    let by_name: HashMap<&str, &Instance> =
        instances.iter().map(|i| (i.name.as_str(), i)).collect();

    for node in nodes.iter_mut().filter(|n| !n.ready && n.external_ip.is_none()) {
        let instance = by_id
            .get(node.instance_id.as_str())
            .or_else(|| by_name.get(node.name.as_str()));
        if let Some((internal, external)) = instance.and_then(|i| i.ip_pair()) {
            debug!(node = %node.name, %internal, %external, "addresses assigned");
            node.internal_ip = Some(internal);
            node.external_ip = Some(external);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_capped() {
        let policy = PollPolicy {
            interval: Duration::from_secs(4),
            max_interval: Duration::from_secs(10),
            backoff: 2.0,
            timeout: Duration::from_secs(60),
        };
        assert_eq!(policy.next_interval(Duration::from_secs(4)), Duration::from_secs(8));
        assert_eq!(policy.next_interval(Duration::from_secs(8)), Duration::from_secs(10));
    }

    #[test]
    fn degenerate_policies_are_rejected() {
        let zero = PollPolicy {
            interval: Duration::ZERO,
            ..PollPolicy::default()
        };
        let inverted = PollPolicy {
            interval: Duration::from_secs(30),
            max_interval: Duration::from_secs(5),
            ..PollPolicy::default()
        };
        let no_timeout = PollPolicy {
            timeout: Duration::ZERO,
            ..PollPolicy::default()
        };
        for policy in [zero, inverted, no_timeout] {
            assert!(matches!(policy.validate(), Err(HcpError::Config(_))), "{policy:?}");
        }
        assert!(PollPolicy::default().validate().is_ok());
    }

    #[test]
    fn internal_only_instances_stay_pending() {
        let mut nodes = vec![PendingNode::new("c1-master", "vm-1"), PendingNode::new("c1-1", "vm-2")];
        let instances = vec![
            Instance {
                id: "vm-1".into(),
                name: "c1-master".into(),
                addresses: vec!["10.0.0.2".into(), "172.24.4.2".into()],
            },
            Instance {
                id: "vm-2".into(),
                name: "c1-1".into(),
                addresses: vec!["10.0.0.3".into()],
            },
        ];

        assign_addresses(&mut nodes, &instances);

        assert_eq!(nodes[0].internal_ip.as_deref(), Some("10.0.0.2"));
        assert_eq!(nodes[0].external_ip.as_deref(), Some("172.24.4.2"));
        assert_eq!(nodes[1].external_ip, None);
    }

    #[test]
    fn instances_resolved_by_name_when_id_differs() {
        let mut nodes = vec![PendingNode::new("c1-1", "unknown")];
        let instances = vec![Instance {
            id: "vm-9".into(),
            name: "c1-1".into(),
            addresses: vec!["10.0.0.9".into(), "172.24.4.9".into()],
        }];

        assign_addresses(&mut nodes, &instances);
        assert_eq!(nodes[0].external_ip.as_deref(), Some("172.24.4.9"));
    }
}
