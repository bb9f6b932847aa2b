//! Typed view over the key-value store.
//!
//! The keyed `<id>_instance` record is the only copy of an instance. The owner
//! list (`<userId>_instances`) and the global list (`instances`) hold ids and are
//! resolved through the keyed record on read, so list views always agree with it.

use std::sync::Arc;

use serde::{Serialize, de::DeserializeOwned};
use skyport_db::{KvError, KvStore};
use skyport_model::{Instance, Node, User, Workflow};
use tokio::sync::Mutex;

use crate::error::{ControlError, ControlResult};

pub const INSTANCES_KEY: &str = "instances";
pub const NODES_KEY: &str = "nodes";

pub fn instance_key(id: &str) -> String {
    format!("{id}_instance")
}

pub fn user_instances_key(user_id: &str) -> String {
    format!("{user_id}_instances")
}

pub fn node_key(id: &str) -> String {
    format!("{id}_node")
}

pub fn workflow_key(instance_id: &str) -> String {
    format!("{instance_id}_workflow")
}

pub fn user_key(id: &str) -> String {
    format!("{id}_user")
}

#[derive(Clone)]
pub struct Registry {
    kv: Arc<dyn KvStore>,
    // Serializes read-modify-write of id lists and instance records within this process.
    write_lock: Arc<Mutex<()>>,
}

impl Registry {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> ControlResult<Option<T>> {
        let Some(value) = self.kv.get(key).await? else {
            return Ok(None);
        };
        serde_json::from_value(value)
            .map(Some)
            .map_err(|source| {
                KvError::Corrupt {
                    key: key.to_string(),
                    source,
                }
                .into()
            })
    }

    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T) -> ControlResult<()> {
        let value = serde_json::to_value(value).map_err(|source| KvError::Corrupt {
            key: key.to_string(),
            source,
        })?;
        self.kv.set(key, value).await?;
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> ControlResult<()> {
        self.kv.delete(key).await?;
        Ok(())
    }

    pub async fn list_ids(&self, key: &str) -> ControlResult<Vec<String>> {
        Ok(self.get_json::<Vec<String>>(key).await?.unwrap_or_default())
    }

    pub async fn add_id(&self, key: &str, id: &str) -> ControlResult<()> {
        let _guard = self.write_lock.lock().await;
        self.add_id_locked(key, id).await
    }

    pub async fn remove_id(&self, key: &str, id: &str) -> ControlResult<()> {
        let _guard = self.write_lock.lock().await;
        self.remove_id_locked(key, id).await
    }

    async fn add_id_locked(&self, key: &str, id: &str) -> ControlResult<()> {
        let mut ids = self.list_ids(key).await?;
        if ids.iter().any(|v| v == id) {
            return Ok(());
        }
        ids.push(id.to_string());
        self.set_json(key, &ids).await
    }

    async fn remove_id_locked(&self, key: &str, id: &str) -> ControlResult<()> {
        let mut ids = self.list_ids(key).await?;
        let before = ids.len();
        ids.retain(|v| v != id);
        if ids.len() != before {
            self.set_json(key, &ids).await?;
        }
        Ok(())
    }

    // Instances

    pub async fn get_instance(&self, id: &str) -> ControlResult<Option<Instance>> {
        self.get_json(&instance_key(id)).await
    }

    pub async fn require_instance(&self, id: &str) -> ControlResult<Instance> {
        self.get_instance(id)
            .await?
            .ok_or_else(|| ControlError::not_found(format!("instance {id}")))
    }

    /// Write the record, then make sure both id lists reference it exactly once.
    pub async fn put_instance(&self, instance: &Instance) -> ControlResult<()> {
        let _guard = self.write_lock.lock().await;
        let prev = self.get_instance(&instance.id).await?;
        if let Some(prev) = prev.filter(|p| p.user != instance.user) {
            self.remove_id_locked(&user_instances_key(&prev.user), &prev.id)
                .await?;
        }

        self.set_json(&instance_key(&instance.id), instance).await?;
        self.add_id_locked(&user_instances_key(&instance.user), &instance.id)
            .await?;
        self.add_id_locked(INSTANCES_KEY, &instance.id).await
    }

    /// Load, mutate and store one record under the write lock.
    pub async fn update_instance<F>(&self, id: &str, mutate: F) -> ControlResult<Instance>
    where
        F: FnOnce(&mut Instance),
    {
        let _guard = self.write_lock.lock().await;
        let mut instance = self.require_instance(id).await?;
        let owner = instance.user.clone();
        mutate(&mut instance);
        instance.user = owner;
        self.set_json(&instance_key(id), &instance).await?;
        Ok(instance)
    }

    /// Drop the id from both lists first so no list ever points at a missing record
    /// for longer than the delete takes.
    pub async fn remove_instance(&self, id: &str) -> ControlResult<Option<Instance>> {
        let _guard = self.write_lock.lock().await;
        let Some(instance) = self.get_instance(id).await? else {
            self.remove_id_locked(INSTANCES_KEY, id).await?;
            return Ok(None);
        };

        self.remove_id_locked(&user_instances_key(&instance.user), id)
            .await?;
        self.remove_id_locked(INSTANCES_KEY, id).await?;
        self.delete(&instance_key(id)).await?;
        Ok(Some(instance))
    }

    async fn resolve_instances(&self, ids: Vec<String>) -> ControlResult<Vec<Instance>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            // A crash between writes can leave a dangling id; skip it.
            if let Some(instance) = self.get_instance(&id).await? {
                out.push(instance);
            }
        }
        Ok(out)
    }

    pub async fn list_user_instances(&self, user_id: &str) -> ControlResult<Vec<Instance>> {
        let ids = self.list_ids(&user_instances_key(user_id)).await?;
        self.resolve_instances(ids).await
    }

    pub async fn list_all_instances(&self) -> ControlResult<Vec<Instance>> {
        let ids = self.list_ids(INSTANCES_KEY).await?;
        self.resolve_instances(ids).await
    }

    pub async fn user_owns(&self, user_id: &str, instance_id: &str) -> ControlResult<bool> {
        let ids = self.list_ids(&user_instances_key(user_id)).await?;
        Ok(ids.iter().any(|id| id == instance_id))
    }

    pub async fn instances_on_node(&self, node_id: &str) -> ControlResult<Vec<Instance>> {
        let mut all = self.list_all_instances().await?;
        all.retain(|i| i.node.id == node_id);
        Ok(all)
    }

    // Nodes

    pub async fn get_node(&self, id: &str) -> ControlResult<Option<Node>> {
        self.get_json(&node_key(id)).await
    }

    pub async fn require_node(&self, id: &str) -> ControlResult<Node> {
        self.get_node(id)
            .await?
            .ok_or_else(|| ControlError::not_found(format!("node {id}")))
    }

    pub async fn put_node(&self, node: &Node) -> ControlResult<()> {
        self.set_json(&node_key(&node.id), node).await?;
        self.add_id(NODES_KEY, &node.id).await
    }

    pub async fn remove_node(&self, id: &str) -> ControlResult<()> {
        self.remove_id(NODES_KEY, id).await?;
        self.delete(&node_key(id)).await
    }

    pub async fn list_nodes(&self) -> ControlResult<Vec<Node>> {
        let mut out = Vec::new();
        for id in self.list_ids(NODES_KEY).await? {
            if let Some(node) = self.get_node(&id).await? {
                out.push(node);
            }
        }
        Ok(out)
    }

    // Users

    pub async fn get_user(&self, id: &str) -> ControlResult<Option<User>> {
        self.get_json(&user_key(id)).await
    }

    pub async fn put_user(&self, user: &User) -> ControlResult<()> {
        self.set_json(&user_key(&user.id), user).await
    }

    // Workflows

    pub async fn get_workflow(&self, instance_id: &str) -> ControlResult<Option<Workflow>> {
        self.get_json(&workflow_key(instance_id)).await
    }

    pub async fn put_workflow(&self, instance_id: &str, workflow: &Workflow) -> ControlResult<()> {
        self.set_json(&workflow_key(instance_id), workflow).await
    }

    pub async fn delete_workflow(&self, instance_id: &str) -> ControlResult<()> {
        self.delete(&workflow_key(instance_id)).await
    }
}
