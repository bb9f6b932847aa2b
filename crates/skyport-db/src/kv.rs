use std::{collections::HashMap, sync::Arc};

use sea_orm::{DatabaseConnection, EntityTrait, Set, sea_query::OnConflict};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::entities::kv_entries;

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("db error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("corrupt value under {key}: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Opaque string-keyed store.
///
/// NOTE: No multi-key transactions. Callers must tolerate a partial sequence of writes.
#[async_trait::async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, KvError>;
    async fn set(&self, key: &str, value: Value) -> Result<(), KvError>;
    async fn delete(&self, key: &str) -> Result<(), KvError>;
}

#[derive(Clone, Default)]
pub struct MemoryKv {
    inner: Arc<RwLock<HashMap<String, Value>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Value>, KvError> {
        Ok(self.inner.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), KvError> {
        self.inner.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.inner.write().await.remove(key);
        Ok(())
    }
}

/// `kv_entries` table; values are stored as JSON text.
#[derive(Clone)]
pub struct DbKv {
    db: Arc<DatabaseConnection>,
}

impl DbKv {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

#[async_trait::async_trait]
impl KvStore for DbKv {
    async fn get(&self, key: &str) -> Result<Option<Value>, KvError> {
        let Some(row) = kv_entries::Entity::find_by_id(key.to_string())
            .one(&*self.db)
            .await?
        else {
            return Ok(None);
        };

        serde_json::from_str(&row.value)
            .map(Some)
            .map_err(|source| KvError::Corrupt {
                key: key.to_string(),
                source,
            })
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), KvError> {
        let model = kv_entries::ActiveModel {
            key: Set(key.to_string()),
            value: Set(value.to_string()),
            updated_at: Set(chrono::Utc::now().into()),
        };

        kv_entries::Entity::insert(model)
            .on_conflict(
                OnConflict::column(kv_entries::Column::Key)
                    .update_columns([kv_entries::Column::Value, kv_entries::Column::UpdatedAt])
                    .to_owned(),
            )
            .exec(&*self.db)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        kv_entries::Entity::delete_by_id(key.to_string())
            .exec(&*self.db)
            .await?;
        Ok(())
    }
}
