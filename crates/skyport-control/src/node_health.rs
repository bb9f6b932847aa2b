use std::{collections::HashSet, time::Duration};

use futures_util::future::join_all;
use serde::Serialize;
use skyport_model::{Node, NodeStatus};
use tracing::Instrument;

use crate::{error::ControlResult, node_client::NodeClient, registry::Registry};

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub probed: usize,
    pub online: usize,
    pub offline: usize,
    /// Instance ids newly suspended because their node flagged the container.
    pub suspended: Vec<String>,
}

#[derive(Clone)]
pub struct NodeHealthMonitor {
    registry: Registry,
    client: NodeClient,
}

impl NodeHealthMonitor {
    pub fn new(registry: Registry, client: NodeClient) -> Self {
        Self { registry, client }
    }

    /// Probe one node and persist the observation, whatever the outcome.
    pub async fn probe(&self, mut node: Node) -> ControlResult<Node> {
        match self.client.probe(&node.connection()).await {
            Ok(info) => {
                node.status = NodeStatus::Online;
                node.version_family = info.version_family;
                node.version_release = info.version_release;
            }
            Err(err) => {
                tracing::debug!(node = %node.id, error = %err, "node probe failed");
                node.status = NodeStatus::Offline;
            }
        }
        node.last_checked_at = Some(chrono::Utc::now());
        self.registry.put_node(&node).await?;
        Ok(node)
    }

    /// Probe every provisioned node concurrently. Unconfigured nodes have no api key
    /// yet and are returned as stored.
    pub async fn probe_all(&self) -> ControlResult<Vec<Node>> {
        let nodes = self.registry.list_nodes().await?;
        let probes = nodes.into_iter().map(|node| async move {
            if node.status == NodeStatus::Unconfigured {
                return Ok(node);
            }
            self.probe(node).await
        });
        join_all(probes).await.into_iter().collect()
    }

    /// Probe the fleet and suspend instances whose containers a node has flagged.
    pub async fn sweep(&self) -> ControlResult<SweepReport> {
        let mut report = SweepReport::default();
        for node in self.probe_all().await? {
            match node.status {
                NodeStatus::Online => report.online += 1,
                NodeStatus::Offline => report.offline += 1,
                _ => continue,
            }
            report.probed += 1;
            if node.status != NodeStatus::Online {
                continue;
            }

            let flagged = match self.client.check_all(&node.connection()).await {
                Ok(v) => v,
                Err(err) => {
                    tracing::warn!(node = %node.id, error = %err, "flagged container check failed");
                    continue;
                }
            };
            if flagged.is_empty() {
                continue;
            }

            let containers: HashSet<&str> =
                flagged.iter().map(|f| f.container_id.as_str()).collect();
            for instance in self.registry.instances_on_node(&node.id).await? {
                if instance.is_suspended() || !containers.contains(instance.container_id.as_str()) {
                    continue;
                }
                self.registry
                    .update_instance(&instance.id, |i| i.suspended = Some(true))
                    .await?;
                tracing::warn!(
                    node = %node.id,
                    instance = %instance.id,
                    container = %instance.container_id,
                    "instance suspended: container flagged by node"
                );
                report.suspended.push(instance.id);
            }
        }
        Ok(report)
    }

    pub fn spawn(self, every: Duration) {
        tokio::spawn(
            async move {
                loop {
                    if let Err(err) = self.probe_all().await {
                        tracing::warn!(error = %err, "node health tick failed");
                    }
                    tokio::time::sleep(every).await;
                }
            }
            .instrument(tracing::info_span!("node_health")),
        );
    }
}
