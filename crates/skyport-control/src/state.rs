use std::sync::Arc;

use skyport_db::KvStore;

use crate::{
    config::Config, fleet::Fleet, guard::Guard, images::ImageCatalog,
    node_client::NodeClient, node_health::NodeHealthMonitor, orchestrator::Orchestrator,
    reconcile::Reconciler, registry::Registry, scheduler::WorkflowScheduler,
    workflow_store::WorkflowFile,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Registry,
    pub guard: Guard,
    pub fleet: Fleet,
    pub health: NodeHealthMonitor,
    pub orchestrator: Orchestrator,
    pub reconciler: Reconciler,
    pub scheduler: WorkflowScheduler,
}

impl AppState {
    pub fn build(config: Config, kv: Arc<dyn KvStore>, images: ImageCatalog) -> anyhow::Result<Self> {
        let client = NodeClient::new(config.node_timeout)?;
        let registry = Registry::new(kv);
        let reconciler = Reconciler::new(registry.clone(), client.clone(), config.poll);
        let scheduler = WorkflowScheduler::new(
            registry.clone(),
            client.clone(),
            WorkflowFile::new(config.workflows_file.clone()),
        );
        let orchestrator = Orchestrator::new(
            registry.clone(),
            client.clone(),
            images,
            reconciler.clone(),
            scheduler.clone(),
        );

        Ok(Self {
            config: Arc::new(config),
            guard: Guard::new(registry.clone()),
            fleet: Fleet::new(registry.clone()),
            health: NodeHealthMonitor::new(registry.clone(), client),
            registry,
            orchestrator,
            reconciler,
            scheduler,
        })
    }
}
