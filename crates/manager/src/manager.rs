use std::{collections::HashMap, sync::Arc, time::Duration};

use store::{InstanceRecord, InstanceStore, InstanceStoreError};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::{
    instance::{Instance, InstanceError, InstanceSnapshot, Status},
    port_allocator::{PortAllocator, PortAllocatorError},
};

const NAME_MAX_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("no instance named {0:?}")]
    NotFound(String),
    #[error("an instance named {0:?} already exists")]
    DuplicateName(String),
    #[error("invalid instance name {0:?}: must match ^[A-Za-z0-9_-]+$ and be 1-64 chars")]
    InvalidName(String),
    #[error("maximum instance count ({0}) reached")]
    MaxInstances(usize),
    #[error(transparent)]
    Port(#[from] PortAllocatorError),
    #[error(transparent)]
    Store(#[from] InstanceStoreError),
    #[error(transparent)]
    Instance(#[from] InstanceError),
    #[error("instance is not ready")]
    NotReady,
    #[error("instance is in a failed state")]
    Failed,
}

/// A request to create a new instance. `port` is `None` to auto-allocate.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub name: String,
    pub backend_type: String,
    pub backend_options: serde_json::Value,
    pub auto_restart: bool,
    pub max_restarts: i64,
    pub restart_delay_seconds: i64,
    pub on_demand_start: bool,
    pub port: Option<u16>,
}

/// A request to update an existing instance's persisted fields. `None` leaves
/// the current value unchanged.
#[derive(Debug, Clone, Default)]
pub struct UpdateRequest {
    pub backend_type: Option<String>,
    pub backend_options: Option<serde_json::Value>,
    pub auto_restart: Option<bool>,
    pub max_restarts: Option<i64>,
    pub restart_delay_seconds: Option<i64>,
    pub on_demand_start: Option<bool>,
    pub port: Option<u16>,
}

pub struct ManagerConfig {
    pub max_instances: usize,
    pub startup_timeout: Duration,
    pub stop_timeout: Duration,
    pub on_demand_start_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub log_tail_capacity: usize,
}

/// The registry and coordinator: uniqueness of names, port allocation,
/// dispatch of operations to instances, on-demand start, shutdown fan-out.
///
/// Lock order is always *registry → instance*: operations that mutate a
/// single instance take a read lock on the registry just long enough to
/// resolve the `Arc<Instance>`, then operate on the instance's own mutex with
/// the registry lock released.
pub struct InstanceManager {
    registry: RwLock<HashMap<String, Arc<Instance>>>,
    ports: Arc<PortAllocator>,
    store: InstanceStore,
    http_client: reqwest::Client,
    config: ManagerConfig,
}

fn validate_name(name: &str) -> Result<(), ManagerError> {
    let valid = !name.is_empty()
        && name.len() <= NAME_MAX_LEN
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid { Ok(()) } else { Err(ManagerError::InvalidName(name.to_string())) }
}

impl InstanceManager {
    /// Load persisted records (running legacy migration first), reserve their
    /// ports, and re-materialize each as a `stopped` in-memory instance.
    pub async fn bootstrap(
        store: InstanceStore,
        ports: PortAllocator,
        instances_dir: &std::path::Path,
        config: ManagerConfig,
    ) -> Result<Self, ManagerError> {
        let migrated = store::migrate_legacy_instances(&store, instances_dir).await;
        if migrated > 0 {
            info!(count = migrated, "migrated legacy instance files into the store");
        }

        let records = store.load_all().await?;
        let ports = Arc::new(ports);
        ports.reserve_existing(records.iter().map(|r| r.port as u16));

        let http_client = reqwest::Client::new();
        let mut registry = HashMap::with_capacity(records.len());
        for record in records {
            let name = record.name.clone();
            let instance = Instance::new(record, http_client.clone(), config.log_tail_capacity);
            registry.insert(name, instance);
        }

        Ok(Self {
            registry: RwLock::new(registry),
            ports,
            store,
            http_client,
            config,
        })
    }

    pub async fn create(&self, req: CreateRequest) -> Result<InstanceSnapshot, ManagerError> {
        validate_name(&req.name)?;

        let mut registry = self.registry.write().await;
        if registry.contains_key(&req.name) {
            return Err(ManagerError::DuplicateName(req.name));
        }
        if registry.len() >= self.config.max_instances {
            return Err(ManagerError::MaxInstances(self.config.max_instances));
        }

        let port = match req.port {
            Some(p) => {
                self.ports.allocate_specific(p)?;
                p
            }
            None => self.ports.allocate()?,
        };

        let now = now_epoch_secs();
        let record = InstanceRecord {
            name: req.name.clone(),
            backend_type: req.backend_type,
            backend_options: req.backend_options,
            auto_restart: req.auto_restart,
            max_restarts: req.max_restarts,
            restart_delay_seconds: req.restart_delay_seconds,
            on_demand_start: req.on_demand_start,
            port: port as i64,
            created_at: now,
            updated_at: now,
        };

        if let Err(e) = self.store.save(&record).await {
            self.ports.release(port);
            return Err(e.into());
        }

        let instance = Instance::new(record, self.http_client.clone(), self.config.log_tail_capacity);
        let snapshot = instance.snapshot();
        registry.insert(req.name, instance);
        Ok(snapshot)
    }

    pub async fn list(&self) -> Vec<InstanceSnapshot> {
        self.registry.read().await.values().map(|i| i.snapshot()).collect()
    }

    pub async fn get(&self, name: &str) -> Result<InstanceSnapshot, ManagerError> {
        self.resolve(name).await.map(|i| i.snapshot())
    }

    async fn resolve(&self, name: &str) -> Result<Arc<Instance>, ManagerError> {
        self.registry
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ManagerError::NotFound(name.to_string()))
    }

    pub async fn start(&self, name: &str) -> Result<(), ManagerError> {
        let instance = self.resolve(name).await?;
        instance.start(self.config.startup_timeout).await?;
        Ok(())
    }

    pub async fn stop(&self, name: &str) -> Result<(), ManagerError> {
        let instance = self.resolve(name).await?;
        instance.stop(self.config.stop_timeout).await?;
        Ok(())
    }

    pub async fn restart(&self, name: &str) -> Result<(), ManagerError> {
        let instance = self.resolve(name).await?;
        instance.restart(self.config.stop_timeout, self.config.startup_timeout).await?;
        Ok(())
    }

    pub async fn tail_logs(&self, name: &str, n: usize) -> Result<Vec<String>, ManagerError> {
        let instance = self.resolve(name).await?;
        Ok(instance.tail_logs(n))
    }

    pub async fn update(&self, name: &str, req: UpdateRequest) -> Result<InstanceSnapshot, ManagerError> {
        let instance = self.resolve(name).await?;
        let was_running = matches!(instance.status(), Status::Running | Status::Starting | Status::Restarting);

        let mut record = instance.snapshot().record;
        if let Some(v) = req.backend_type {
            record.backend_type = v;
        }
        if let Some(v) = req.backend_options {
            record.backend_options = v;
        }
        if let Some(v) = req.auto_restart {
            record.auto_restart = v;
        }
        if let Some(v) = req.max_restarts {
            record.max_restarts = v;
        }
        if let Some(v) = req.restart_delay_seconds {
            record.restart_delay_seconds = v;
        }
        if let Some(v) = req.on_demand_start {
            record.on_demand_start = v;
        }

        let old_port = record.port as u16;
        if let Some(new_port) = req.port {
            if new_port != old_port {
                self.ports.allocate_specific(new_port)?;
                record.port = new_port as i64;
            }
        }

        record.updated_at = now_epoch_secs();

        if let Err(e) = self.store.save(&record).await {
            if record.port as u16 != old_port {
                self.ports.release(record.port as u16);
            }
            return Err(e.into());
        }
        if record.port as u16 != old_port {
            self.ports.release(old_port);
        }

        instance.apply_record(record);

        if was_running {
            instance.restart(self.config.stop_timeout, self.config.startup_timeout).await?;
        }

        Ok(instance.snapshot())
    }

    /// Stop the child (if any), remove the persisted record, then release the
    /// port. These three substeps form one critical section for this name.
    pub async fn delete(&self, name: &str) -> Result<(), ManagerError> {
        let mut registry = self.registry.write().await;
        let instance = registry.get(name).cloned().ok_or_else(|| ManagerError::NotFound(name.to_string()))?;

        instance.stop(self.config.stop_timeout).await?;
        self.store.delete(name).await?;
        self.ports.release(instance.port());
        registry.remove(name);
        Ok(())
    }

    /// Resolve the proxy target port for `name`, triggering an on-demand
    /// start if the instance is stopped and configured for it.
    pub async fn resolve_for_proxy(&self, name: &str) -> Result<u16, ManagerError> {
        let instance = self.resolve(name).await?;

        match instance.status() {
            Status::Running => return Ok(instance.port()),
            Status::Failed => return Err(ManagerError::Failed),
            Status::Stopped => {
                let on_demand = instance.snapshot().record.on_demand_start;
                if !on_demand {
                    return Err(ManagerError::NotReady);
                }
                instance.start_on_demand(self.config.startup_timeout).await?;
            }
            Status::Starting | Status::Restarting => {}
        }

        instance
            .wait_ready(self.config.on_demand_start_timeout)
            .await
            .map_err(|e| match e {
                InstanceError::Failed => ManagerError::Failed,
                _ => ManagerError::NotReady,
            })?;

        Ok(instance.port())
    }

    /// Stop every instance with a generous grace period, bounded overall by
    /// `shutdown_timeout`. Called on SIGINT/SIGTERM of the control plane.
    ///
    /// If the ceiling elapses before every `stop()` has returned, any
    /// instance still holding a child is force-killed directly so no
    /// process outlives this method.
    pub async fn shutdown(&self) {
        let instances: Vec<Arc<Instance>> = self.registry.read().await.values().cloned().collect();
        let stop_timeout = self.config.stop_timeout;

        let fanned_out = join_all_spawned(instances.clone().into_iter().map(|instance| {
            let stop_timeout = stop_timeout;
            async move {
                if let Err(e) = instance.stop(stop_timeout).await {
                    warn!(instance = %instance.name, error = %e, "error stopping instance during shutdown");
                }
            }
        }));

        if tokio::time::timeout(self.config.shutdown_timeout, fanned_out).await.is_err() {
            warn!("shutdown timed out waiting for all instances to stop, force-killing the rest");
            join_all_spawned(instances.into_iter().map(|instance| async move {
                instance.force_kill().await;
            }))
            .await;
        }
    }
}

fn now_epoch_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

async fn join_all_spawned<F>(futures: impl IntoIterator<Item = F>)
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let handles: Vec<_> = futures.into_iter().map(tokio::spawn).collect();
    for handle in handles {
        let _ = handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use store::DBService;

    async fn manager_with_store() -> (InstanceManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = DBService::new_in_memory().await.unwrap();
        let store = InstanceStore::new(db.pool.clone());
        let ports = PortAllocator::new(20000, 20010);
        let config = ManagerConfig {
            max_instances: 2,
            startup_timeout: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(1),
            on_demand_start_timeout: Duration::from_secs(2),
            shutdown_timeout: Duration::from_secs(5),
            log_tail_capacity: 100,
        };
        let manager = InstanceManager::bootstrap(store, ports, dir.path(), config).await.unwrap();
        (manager, dir)
    }

    fn create_req(name: &str) -> CreateRequest {
        CreateRequest {
            name: name.to_string(),
            backend_type: "llama_cpp".to_string(),
            backend_options: serde_json::json!({"model": "/m.gguf"}),
            auto_restart: false,
            max_restarts: 0,
            restart_delay_seconds: 1,
            on_demand_start: true,
            port: None,
        }
    }

    #[tokio::test]
    async fn create_rejects_invalid_name() {
        let (manager, _dir) = manager_with_store().await;
        let err = manager.create(create_req("has a space")).await.unwrap_err();
        assert!(matches!(err, ManagerError::InvalidName(_)));
    }

    #[tokio::test]
    async fn create_rejects_duplicate_name() {
        let (manager, _dir) = manager_with_store().await;
        manager.create(create_req("alpha")).await.unwrap();
        let err = manager.create(create_req("alpha")).await.unwrap_err();
        assert!(matches!(err, ManagerError::DuplicateName(_)));
    }

    #[tokio::test]
    async fn create_enforces_max_instances() {
        let (manager, _dir) = manager_with_store().await;
        manager.create(create_req("a")).await.unwrap();
        manager.create(create_req("b")).await.unwrap();
        let err = manager.create(create_req("c")).await.unwrap_err();
        assert!(matches!(err, ManagerError::MaxInstances(2)));
    }

    #[tokio::test]
    async fn get_reports_not_found_for_unknown_name() {
        let (manager, _dir) = manager_with_store().await;
        let err = manager.get("ghost").await.unwrap_err();
        assert!(matches!(err, ManagerError::NotFound(_)));
    }

    #[tokio::test]
    async fn create_allocates_distinct_ports() {
        let (manager, _dir) = manager_with_store().await;
        let a = manager.create(create_req("a")).await.unwrap();
        let b = manager.create(create_req("b")).await.unwrap();
        assert_ne!(a.record.port, b.record.port);
    }

    #[tokio::test]
    async fn delete_releases_the_port_for_reuse() {
        let (manager, _dir) = manager_with_store().await;
        let created = manager.create(create_req("alpha")).await.unwrap();
        manager.delete("alpha").await.unwrap();

        let recreated = manager.create(create_req("beta")).await.unwrap();
        assert_eq!(created.record.port, recreated.record.port);
    }

    #[tokio::test]
    async fn resolve_for_proxy_fails_not_ready_without_on_demand_start() {
        let (manager, _dir) = manager_with_store().await;
        let mut req = create_req("alpha");
        req.on_demand_start = false;
        manager.create(req).await.unwrap();

        let err = manager.resolve_for_proxy("alpha").await.unwrap_err();
        assert!(matches!(err, ManagerError::NotReady));
    }

    #[tokio::test]
    async fn shutdown_on_empty_registry_returns_promptly() {
        let (manager, _dir) = manager_with_store().await;
        manager.create(create_req("alpha")).await.unwrap();
        manager.shutdown().await;
        assert_eq!(manager.get("alpha").await.unwrap().status, Status::Stopped);
    }
}
