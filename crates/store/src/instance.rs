use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Pool, Sqlite};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InstanceStoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("malformed backend_options for instance {name:?}: {source}")]
    MalformedOptions {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

/// The durable fields of an instance, exactly as persisted in the `instances`
/// table. Runtime-only fields (status, restart_count, last_error, pid) live
/// in the in-memory `Instance` and are never written here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub name: String,
    pub backend_type: String,
    /// Opaque JSON blob interpreted only by the `CommandSpec` for `backend_type`.
    pub backend_options: serde_json::Value,
    pub auto_restart: bool,
    pub max_restarts: i64,
    pub restart_delay_seconds: i64,
    pub on_demand_start: bool,
    pub port: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Raw row shape as stored in SQLite; `backend_options` is a JSON text column.
#[derive(FromRow)]
struct InstanceRow {
    name: String,
    backend_type: String,
    backend_options: String,
    auto_restart: bool,
    max_restarts: i64,
    restart_delay_seconds: i64,
    on_demand_start: bool,
    port: i64,
    created_at: i64,
    updated_at: i64,
}

impl InstanceRow {
    fn into_record(self) -> Result<InstanceRecord, InstanceStoreError> {
        let backend_options =
            serde_json::from_str(&self.backend_options).map_err(|source| InstanceStoreError::MalformedOptions {
                name: self.name.clone(),
                source,
            })?;
        Ok(InstanceRecord {
            name: self.name,
            backend_type: self.backend_type,
            backend_options,
            auto_restart: self.auto_restart,
            max_restarts: self.max_restarts,
            restart_delay_seconds: self.restart_delay_seconds,
            on_demand_start: self.on_demand_start,
            port: self.port,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Clone)]
pub struct InstanceStore {
    pool: Pool<Sqlite>,
}

impl InstanceStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Load every persisted instance. Order is not meaningful.
    pub async fn load_all(&self) -> Result<Vec<InstanceRecord>, InstanceStoreError> {
        let rows = sqlx::query_as::<_, InstanceRow>(
            "SELECT name, backend_type, backend_options, auto_restart, max_restarts, \
             restart_delay_seconds, on_demand_start, port, created_at, updated_at FROM instances",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(InstanceRow::into_record).collect()
    }

    /// Insert or fully overwrite the record for `record.name`.
    pub async fn save(&self, record: &InstanceRecord) -> Result<(), InstanceStoreError> {
        sqlx::query(
            "INSERT INTO instances \
             (name, backend_type, backend_options, auto_restart, max_restarts, \
              restart_delay_seconds, on_demand_start, port, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(name) DO UPDATE SET \
               backend_type = excluded.backend_type, \
               backend_options = excluded.backend_options, \
               auto_restart = excluded.auto_restart, \
               max_restarts = excluded.max_restarts, \
               restart_delay_seconds = excluded.restart_delay_seconds, \
               on_demand_start = excluded.on_demand_start, \
               port = excluded.port, \
               updated_at = excluded.updated_at",
        )
        .bind(&record.name)
        .bind(&record.backend_type)
        .bind(record.backend_options.to_string())
        .bind(record.auto_restart)
        .bind(record.max_restarts)
        .bind(record.restart_delay_seconds)
        .bind(record.on_demand_start)
        .bind(record.port)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Idempotent delete; no error if the name is absent.
    pub async fn delete(&self, name: &str) -> Result<(), InstanceStoreError> {
        sqlx::query("DELETE FROM instances WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn is_empty(&self) -> Result<bool, InstanceStoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM instances")
            .fetch_one(&self.pool)
            .await?;
        Ok(count == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DBService;

    fn sample(name: &str, port: i64) -> InstanceRecord {
        InstanceRecord {
            name: name.to_string(),
            backend_type: "llama_cpp".to_string(),
            backend_options: serde_json::json!({"model_path": "/models/x.gguf"}),
            auto_restart: true,
            max_restarts: 5,
            restart_delay_seconds: 2,
            on_demand_start: true,
            port,
            created_at: 1000,
            updated_at: 1000,
        }
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let db = DBService::new_in_memory().await.unwrap();
        let store = InstanceStore::new(db.pool.clone());

        store.save(&sample("alpha", 20001)).await.unwrap();
        let all = store.load_all().await.unwrap();

        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "alpha");
        assert_eq!(all[0].port, 20001);
        assert_eq!(all[0].backend_options["model_path"], "/models/x.gguf");
    }

    #[tokio::test]
    async fn save_upserts_by_name() {
        let db = DBService::new_in_memory().await.unwrap();
        let store = InstanceStore::new(db.pool.clone());

        store.save(&sample("alpha", 20001)).await.unwrap();
        let mut updated = sample("alpha", 20002);
        updated.updated_at = 2000;
        store.save(&updated).await.unwrap();

        let all = store.load_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].port, 20002);
        assert_eq!(all[0].updated_at, 2000);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let db = DBService::new_in_memory().await.unwrap();
        let store = InstanceStore::new(db.pool.clone());

        store.delete("nonexistent").await.unwrap();
        store.save(&sample("beta", 20003)).await.unwrap();
        store.delete("beta").await.unwrap();
        store.delete("beta").await.unwrap();

        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn is_empty_reflects_store_state() {
        let db = DBService::new_in_memory().await.unwrap();
        let store = InstanceStore::new(db.pool.clone());

        assert!(store.is_empty().await.unwrap());
        store.save(&sample("gamma", 20004)).await.unwrap();
        assert!(!store.is_empty().await.unwrap());
    }
}
