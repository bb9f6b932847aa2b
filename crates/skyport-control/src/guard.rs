use skyport_model::{Instance, User};

use crate::{
    error::{ControlError, ControlResult},
    registry::Registry,
};

#[derive(Clone)]
pub struct Guard {
    registry: Registry,
}

impl Guard {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    /// Admin override, then explicit share, then ownership.
    pub async fn is_authorized(&self, user: &User, instance_id: &str) -> ControlResult<bool> {
        if user.admin {
            return Ok(true);
        }
        if user.access_to.iter().any(|id| id == instance_id) {
            return Ok(true);
        }
        self.registry.user_owns(&user.id, instance_id).await
    }

    pub async fn authorize(&self, user: &User, instance_id: &str) -> ControlResult<()> {
        if self.is_authorized(user, instance_id).await? {
            Ok(())
        } else {
            Err(ControlError::Forbidden)
        }
    }

    /// Admins bypass the hold. An instance without a flag is initialised to `false`.
    pub async fn is_suspended(&self, user: &User, instance: &Instance) -> ControlResult<bool> {
        if user.admin {
            return Ok(false);
        }
        match instance.suspended {
            Some(flag) => Ok(flag),
            None => {
                self.registry
                    .update_instance(&instance.id, |i| {
                        if i.suspended.is_none() {
                            i.suspended = Some(false);
                        }
                    })
                    .await?;
                Ok(false)
            }
        }
    }

    /// Authorization plus the suspension gate; returns the current record.
    pub async fn authorize_active(&self, user: &User, instance_id: &str) -> ControlResult<Instance> {
        self.authorize(user, instance_id).await?;
        let instance = self.registry.require_instance(instance_id).await?;
        if self.is_suspended(user, &instance).await? {
            return Err(ControlError::Suspended);
        }
        Ok(instance)
    }

    /// Like `authorize_active`, but shared access is not enough: owner or admin only.
    pub async fn authorize_owner(&self, user: &User, instance_id: &str) -> ControlResult<Instance> {
        let instance = self.authorize_active(user, instance_id).await?;
        if user.admin || instance.user == user.id {
            Ok(instance)
        } else {
            Err(ControlError::Forbidden)
        }
    }

    pub async fn grant_access(&self, user_id: &str, instance_id: &str) -> ControlResult<User> {
        self.registry.require_instance(instance_id).await?;
        let mut user = self
            .registry
            .get_user(user_id)
            .await?
            .ok_or_else(|| ControlError::not_found(format!("user {user_id}")))?;
        if !user.access_to.iter().any(|id| id == instance_id) {
            user.access_to.push(instance_id.to_string());
            self.registry.put_user(&user).await?;
        }
        Ok(user)
    }

    pub async fn revoke_access(&self, user_id: &str, instance_id: &str) -> ControlResult<User> {
        let mut user = self
            .registry
            .get_user(user_id)
            .await?
            .ok_or_else(|| ControlError::not_found(format!("user {user_id}")))?;
        let before = user.access_to.len();
        user.access_to.retain(|id| id != instance_id);
        if user.access_to.len() != before {
            self.registry.put_user(&user).await?;
        }
        Ok(user)
    }
}
