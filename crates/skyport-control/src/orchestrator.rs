use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use skyport_model::{Image, Instance, InternalState, Node, NodeRef, PowerAction};

use crate::{
    error::{ControlError, ControlResult},
    images::ImageCatalog,
    node_client::{DeployPayload, HostBinding, NodeClient},
    reconcile::Reconciler,
    registry::Registry,
    scheduler::WorkflowScheduler,
};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeployRequest {
    pub image: Option<String>,
    pub memory: Option<u64>,
    pub cpu: Option<u64>,
    pub ports: Option<String>,
    pub node_id: Option<String>,
    pub name: Option<String>,
    pub user: Option<String>,
    pub primary: Option<String>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

/// Overrides for a redeploy; anything left out keeps the instance's current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RedeployRequest {
    pub image: Option<String>,
    pub memory: Option<u64>,
    pub cpu: Option<u64>,
    pub ports: Option<String>,
    pub primary: Option<String>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
struct ValidDeploy {
    image: String,
    memory: u64,
    cpu: u64,
    ports: String,
    node_id: String,
    name: String,
    user: String,
    primary: String,
}

fn required_str(
    value: Option<&str>,
    field: &str,
    errors: &mut BTreeMap<String, String>,
) -> String {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        Some(v) => v.to_string(),
        None => {
            errors.insert(field.to_string(), "required".to_string());
            String::new()
        }
    }
}

fn required_positive(value: Option<u64>, field: &str, errors: &mut BTreeMap<String, String>) -> u64 {
    match value {
        Some(v) if v > 0 => v,
        Some(_) => {
            errors.insert(field.to_string(), "must be greater than zero".to_string());
            0
        }
        None => {
            errors.insert(field.to_string(), "required".to_string());
            0
        }
    }
}

fn validate_deploy(req: &DeployRequest) -> ControlResult<ValidDeploy> {
    let mut errors = BTreeMap::new();
    let valid = ValidDeploy {
        image: required_str(req.image.as_deref(), "image", &mut errors),
        memory: required_positive(req.memory, "memory", &mut errors),
        cpu: required_positive(req.cpu, "cpu", &mut errors),
        ports: required_str(req.ports.as_deref(), "ports", &mut errors),
        node_id: required_str(req.node_id.as_deref(), "node_id", &mut errors),
        name: required_str(req.name.as_deref(), "name", &mut errors),
        user: required_str(req.user.as_deref(), "user", &mut errors),
        primary: required_str(req.primary.as_deref(), "primary", &mut errors),
    };
    if !errors.is_empty() {
        return Err(ControlError::Parameter {
            field_errors: errors,
        });
    }
    Ok(valid)
}

pub type ExposedPorts = BTreeMap<String, serde_json::Value>;
pub type PortBindings = BTreeMap<String, Vec<HostBinding>>;

/// Expand `container:host[,container:host...]` into tcp and udp entries for every pair.
pub fn expand_ports(spec: &str) -> ControlResult<(ExposedPorts, PortBindings)> {
    let mut exposed = ExposedPorts::new();
    let mut bindings = PortBindings::new();

    for pair in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let parsed = pair
            .split_once(':')
            .and_then(|(c, h)| Some((c.trim().parse::<u16>().ok()?, h.trim().parse::<u16>().ok()?)))
            .filter(|(c, h)| *c > 0 && *h > 0);
        let Some((container, host)) = parsed else {
            return Err(ControlError::parameter(
                "ports",
                format!("invalid port pair `{pair}`, expected container:host"),
            ));
        };

        for proto in ["tcp", "udp"] {
            let key = format!("{container}/{proto}");
            exposed.insert(key.clone(), serde_json::json!({}));
            bindings.entry(key).or_default().push(HostBinding {
                host_port: host.to_string(),
            });
        }
    }

    if exposed.is_empty() {
        return Err(ControlError::parameter("ports", "at least one port pair is required"));
    }
    Ok((exposed, bindings))
}

fn host_ports(bindings: &PortBindings) -> impl Iterator<Item = &str> {
    bindings.values().flatten().map(|b| b.host_port.as_str())
}

/// Apply overrides to the image's `KEY=VALUE` template, keeping template order and
/// appending keys the template does not mention.
pub fn expand_env(template: &[String], overrides: &BTreeMap<String, String>) -> Vec<String> {
    let mut out = Vec::with_capacity(template.len() + overrides.len());
    let mut used = std::collections::BTreeSet::new();

    for entry in template {
        let (key, default) = entry.split_once('=').unwrap_or((entry.as_str(), ""));
        match overrides.get(key) {
            Some(v) => {
                used.insert(key.to_string());
                out.push(format!("{key}={v}"));
            }
            None => out.push(format!("{key}={default}")),
        }
    }
    for (key, value) in overrides {
        if !used.contains(key) {
            out.push(format!("{key}={value}"));
        }
    }
    out
}

/// Parse `KEY=VALUE` entries back into a map; later entries win.
fn env_to_map(env: &[String]) -> BTreeMap<String, String> {
    env.iter()
        .map(|e| {
            let (k, v) = e.split_once('=').unwrap_or((e.as_str(), ""));
            (k.to_string(), v.to_string())
        })
        .collect()
}

struct PayloadInput<'a> {
    id: &'a str,
    name: &'a str,
    image_ref: &'a str,
    image: Option<&'a Image>,
    env: Vec<String>,
    memory: u64,
    cpu: u64,
    ports: &'a str,
    primary: &'a str,
}

fn build_payload(input: PayloadInput<'_>) -> ControlResult<DeployPayload> {
    let (exposed_ports, port_bindings) = expand_ports(input.ports)?;
    if !host_ports(&port_bindings).any(|p| p == input.primary) {
        return Err(ControlError::parameter(
            "primary",
            format!("primary port {} is not one of the bound host ports", input.primary),
        ));
    }

    Ok(DeployPayload {
        name: input.name.to_string(),
        id: input.id.to_string(),
        image: input.image_ref.to_string(),
        env: input.env,
        scripts: input
            .image
            .map(|i| i.scripts.clone())
            .unwrap_or(serde_json::Value::Null),
        memory: input.memory,
        cpu: input.cpu,
        exposed_ports,
        port_bindings,
        alt_images: input.image.map(|i| i.alt_images.clone()).unwrap_or_default(),
        stop_command: input.image.and_then(|i| i.stop_command.clone()),
        primary: input.primary.to_string(),
    })
}

fn provisioned(node: &Node) -> ControlResult<NodeRef> {
    match node.api_key.as_deref() {
        Some(key) if !key.is_empty() => Ok(node.connection()),
        _ => Err(ControlError::parameter("node_id", "node is not configured")),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PurgeReport {
    pub node_id: String,
    pub removed_instances: Vec<String>,
}

#[derive(Clone)]
pub struct Orchestrator {
    registry: Registry,
    client: NodeClient,
    images: ImageCatalog,
    reconciler: Reconciler,
    scheduler: WorkflowScheduler,
}

impl Orchestrator {
    pub fn new(
        registry: Registry,
        client: NodeClient,
        images: ImageCatalog,
        reconciler: Reconciler,
        scheduler: WorkflowScheduler,
    ) -> Self {
        Self {
            registry,
            client,
            images,
            reconciler,
            scheduler,
        }
    }

    fn lookup_image(&self, reference: &str) -> ControlResult<&Image> {
        self.images
            .find(reference)
            .ok_or_else(|| ControlError::parameter("image", format!("unknown image `{reference}`")))
    }

    /// Prefer the live node record; fall back to the snapshot taken at deploy time.
    async fn owning_node(&self, instance: &Instance) -> ControlResult<NodeRef> {
        match self.registry.get_node(&instance.node.id).await? {
            Some(node) => Ok(provisioned(&node).unwrap_or_else(|_| instance.node.clone())),
            None => Ok(instance.node.clone()),
        }
    }

    async fn hand_off(&self, instance_id: &str) {
        if let Err(err) = self.reconciler.track(instance_id).await {
            tracing::warn!(instance = %instance_id, error = %err, "failed to start reconciliation");
        }
    }

    pub async fn deploy(&self, req: DeployRequest) -> ControlResult<Instance> {
        let valid = validate_deploy(&req)?;
        let image = self.lookup_image(&valid.image)?;
        let node = self
            .registry
            .get_node(&valid.node_id)
            .await?
            .ok_or_else(|| ControlError::parameter("node_id", "unknown node"))?;
        let node_ref = provisioned(&node)?;

        let id = Instance::generate_id();
        let env = expand_env(&image.env, &req.variables);
        let payload = build_payload(PayloadInput {
            id: &id,
            name: &valid.name,
            image_ref: &image.image,
            image: Some(image),
            env: env.clone(),
            memory: valid.memory,
            cpu: valid.cpu,
            ports: &valid.ports,
            primary: &valid.primary,
        })?;

        let resp = self.client.create(&node_ref, &payload).await?;

        let instance = Instance {
            id: id.clone(),
            volume_id: id.clone(),
            container_id: resp.container_id,
            node: node_ref,
            user: valid.user,
            name: valid.name,
            image: image.image.clone(),
            alt_images: image.alt_images.clone(),
            env,
            memory: valid.memory,
            cpu: valid.cpu,
            ports: valid.ports,
            primary: valid.primary,
            internal_state: InternalState::Installing,
            suspended: Some(false),
        };
        self.registry.put_instance(&instance).await?;
        tracing::info!(instance = %id, node = %instance.node.id, "instance deployed");

        self.hand_off(&id).await;
        Ok(instance)
    }

    pub async fn redeploy(&self, instance_id: &str, req: RedeployRequest) -> ControlResult<Instance> {
        let current = self.registry.require_instance(instance_id).await?;
        let node_ref = self.owning_node(&current).await?;

        let image_ref = req.image.as_deref().unwrap_or(&current.image);
        let image = self.lookup_image(image_ref)?;
        let memory = req.memory.unwrap_or(current.memory);
        let cpu = req.cpu.unwrap_or(current.cpu);
        let ports = req.ports.clone().unwrap_or_else(|| current.ports.clone());
        let primary = req.primary.clone().unwrap_or_else(|| current.primary.clone());

        let mut vars = env_to_map(&current.env);
        vars.extend(req.variables.clone());
        let env = expand_env(&image.env, &vars);

        let check = DeployRequest {
            image: Some(image.image.clone()),
            memory: Some(memory),
            cpu: Some(cpu),
            ports: Some(ports.clone()),
            node_id: Some(node_ref.id.clone()),
            name: Some(current.name.clone()),
            user: Some(current.user.clone()),
            primary: Some(primary.clone()),
            variables: BTreeMap::new(),
        };
        validate_deploy(&check)?;

        let payload = build_payload(PayloadInput {
            id: &current.id,
            name: &current.name,
            image_ref: &image.image,
            image: Some(image),
            env: env.clone(),
            memory,
            cpu,
            ports: &ports,
            primary: &primary,
        })?;

        let resp = self
            .client
            .redeploy(&node_ref, &current.container_id, &current.id, &payload)
            .await?;

        let instance = Instance {
            container_id: resp.container_id,
            node: node_ref,
            image: image.image.clone(),
            alt_images: image.alt_images.clone(),
            env,
            memory,
            cpu,
            ports,
            primary,
            internal_state: InternalState::Installing,
            ..current
        };
        self.registry.put_instance(&instance).await?;
        tracing::info!(instance = %instance.id, container = %instance.container_id, "instance redeployed");

        self.hand_off(&instance.id).await;
        Ok(instance)
    }

    pub async fn reinstall(&self, instance_id: &str) -> ControlResult<Instance> {
        let current = self.registry.require_instance(instance_id).await?;
        let node_ref = self.owning_node(&current).await?;
        let image = self.images.find(&current.image);

        let payload = build_payload(PayloadInput {
            id: &current.id,
            name: &current.name,
            image_ref: &current.image,
            image,
            env: current.env.clone(),
            memory: current.memory,
            cpu: current.cpu,
            ports: &current.ports,
            primary: &current.primary,
        })?;

        let resp = self
            .client
            .reinstall(&node_ref, &current.container_id, &payload)
            .await?;

        let instance = Instance {
            container_id: resp.container_id,
            node: node_ref,
            internal_state: InternalState::Installing,
            ..current
        };
        self.registry.put_instance(&instance).await?;
        tracing::info!(instance = %instance.id, container = %instance.container_id, "instance reinstalled");

        self.hand_off(&instance.id).await;
        Ok(instance)
    }

    /// Remove the container on the node, then every trace of the instance locally.
    pub async fn delete(&self, instance_id: &str) -> ControlResult<Instance> {
        let instance = self.registry.require_instance(instance_id).await?;
        let node_ref = self.owning_node(&instance).await?;
        let container_id = self.known_container(&node_ref, &instance).await?;
        self.client.delete_container(&node_ref, &container_id).await?;
        self.forget_instance(instance_id).await?;
        tracing::info!(instance = %instance_id, "instance deleted");
        Ok(instance)
    }

    /// The record's container id, or the one the node reports for the volume.
    async fn known_container(&self, node_ref: &NodeRef, instance: &Instance) -> ControlResult<String> {
        if !instance.container_id.trim().is_empty() {
            return Ok(instance.container_id.clone());
        }
        let reported = self.client.state(node_ref, &instance.volume_id).await?;
        match reported.container_id.filter(|c| !c.trim().is_empty()) {
            Some(container_id) => {
                self.registry
                    .update_instance(&instance.id, |i| i.container_id = container_id.clone())
                    .await?;
                Ok(container_id)
            }
            None => Err(ControlError::Conflict(format!(
                "container for instance {} is not known yet",
                instance.id
            ))),
        }
    }

    async fn forget_instance(&self, instance_id: &str) -> ControlResult<()> {
        self.reconciler.cancel(instance_id).await?;
        self.scheduler.remove(instance_id).await?;
        self.registry.remove_instance(instance_id).await?;
        Ok(())
    }

    pub async fn power(&self, instance: &Instance, action: PowerAction) -> ControlResult<u16> {
        let node_ref = self.owning_node(instance).await?;
        let status = self
            .client
            .power(&node_ref, &instance.container_id, action)
            .await?;
        Ok(status.as_u16())
    }

    pub async fn set_suspended(&self, instance_id: &str, suspended: bool) -> ControlResult<Instance> {
        self.registry
            .update_instance(instance_id, |i| i.suspended = Some(suspended))
            .await
    }

    pub async fn rename(&self, instance_id: &str, name: &str) -> ControlResult<Instance> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ControlError::parameter("name", "required"));
        }
        self.registry
            .update_instance(instance_id, |i| i.name = name.to_string())
            .await
    }

    /// Wipe every container on a node and drop all instances that lived there.
    pub async fn purge_node(&self, node_id: &str) -> ControlResult<PurgeReport> {
        let node = self.registry.require_node(node_id).await?;
        self.client.purge_all(&provisioned(&node)?).await?;

        let mut removed = Vec::new();
        for instance in self.registry.instances_on_node(node_id).await? {
            self.forget_instance(&instance.id).await?;
            removed.push(instance.id);
        }
        tracing::warn!(node = %node_id, removed = removed.len(), "node purged");
        Ok(PurgeReport {
            node_id: node_id.to_string(),
            removed_instances: removed,
        })
    }
}
