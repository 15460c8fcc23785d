use std::path::Path;

use tracing::warn;

use crate::instance::{InstanceRecord, InstanceStore};

/// One-time migration of legacy per-instance JSON files into the relational
/// store. Only runs when the store is empty and `instances_dir` exists;
/// never aborts startup on a single bad file.
///
/// Each `<name>.json` under `instances_dir` is parsed as an `InstanceRecord`,
/// saved, and then moved into a `.migrated` subdirectory so a repeat run is a
/// no-op (the store will no longer be empty).
pub async fn migrate_legacy_instances(store: &InstanceStore, instances_dir: &Path) -> usize {
    if !instances_dir.exists() {
        return 0;
    }

    match store.is_empty().await {
        Ok(false) => return 0,
        Err(e) => {
            warn!(error = %e, "failed to check store emptiness before legacy migration, skipping");
            return 0;
        }
        Ok(true) => {}
    }

    let entries = match std::fs::read_dir(instances_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(error = %e, dir = %instances_dir.display(), "failed to read legacy instances directory");
            return 0;
        }
    };

    let migrated_dir = instances_dir.join(".migrated");
    let mut migrated = 0usize;

    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }

        match migrate_one(store, &path).await {
            Ok(()) => {
                if let Err(e) = std::fs::create_dir_all(&migrated_dir) {
                    warn!(error = %e, "failed to create .migrated directory");
                    continue;
                }
                if let Some(file_name) = path.file_name() {
                    if let Err(e) = std::fs::rename(&path, migrated_dir.join(file_name)) {
                        warn!(error = %e, file = %path.display(), "migrated instance but failed to move source file");
                    }
                }
                migrated += 1;
            }
            Err(e) => {
                warn!(error = %e, file = %path.display(), "failed to migrate legacy instance file, skipping");
            }
        }
    }

    migrated
}

async fn migrate_one(store: &InstanceStore, path: &Path) -> Result<(), String> {
    let bytes = std::fs::read(path).map_err(|e| e.to_string())?;
    let record: InstanceRecord = serde_json::from_slice(&bytes).map_err(|e| e.to_string())?;
    store.save(&record).await.map_err(|e| e.to_string())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DBService;

    fn write_legacy_json(dir: &Path, name: &str, port: i64) {
        let record = InstanceRecord {
            name: name.to_string(),
            backend_type: "llama_cpp".to_string(),
            backend_options: serde_json::json!({"model_path": "/m.gguf"}),
            auto_restart: true,
            max_restarts: 5,
            restart_delay_seconds: 2,
            on_demand_start: true,
            port,
            created_at: 1000,
            updated_at: 1000,
        };
        std::fs::write(
            dir.join(format!("{name}.json")),
            serde_json::to_vec(&record).unwrap(),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn migrates_all_valid_files_and_moves_them() {
        let tmp = tempfile::tempdir().unwrap();
        write_legacy_json(tmp.path(), "alpha", 20001);
        write_legacy_json(tmp.path(), "beta", 20002);

        let db = DBService::new_in_memory().await.unwrap();
        let store = InstanceStore::new(db.pool.clone());

        let count = migrate_legacy_instances(&store, tmp.path()).await;
        assert_eq!(count, 2);

        let all = store.load_all().await.unwrap();
        assert_eq!(all.len(), 2);

        assert!(tmp.path().join(".migrated/alpha.json").exists());
        assert!(!tmp.path().join("alpha.json").exists());
    }

    #[tokio::test]
    async fn skips_malformed_file_without_aborting() {
        let tmp = tempfile::tempdir().unwrap();
        write_legacy_json(tmp.path(), "good", 20001);
        std::fs::write(tmp.path().join("bad.json"), b"not json").unwrap();

        let db = DBService::new_in_memory().await.unwrap();
        let store = InstanceStore::new(db.pool.clone());

        let count = migrate_legacy_instances(&store, tmp.path()).await;
        assert_eq!(count, 1);
        assert!(tmp.path().join("bad.json").exists());
    }

    #[tokio::test]
    async fn no_op_when_store_already_has_data() {
        let tmp = tempfile::tempdir().unwrap();
        write_legacy_json(tmp.path(), "alpha", 20001);

        let db = DBService::new_in_memory().await.unwrap();
        let store = InstanceStore::new(db.pool.clone());
        store
            .save(&InstanceRecord {
                name: "existing".to_string(),
                backend_type: "vllm".to_string(),
                backend_options: serde_json::json!({}),
                auto_restart: false,
                max_restarts: 0,
                restart_delay_seconds: 0,
                on_demand_start: false,
                port: 20099,
                created_at: 1,
                updated_at: 1,
            })
            .await
            .unwrap();

        let count = migrate_legacy_instances(&store, tmp.path()).await;
        assert_eq!(count, 0);
        assert!(tmp.path().join("alpha.json").exists());
    }

    #[tokio::test]
    async fn no_op_when_directory_absent() {
        let db = DBService::new_in_memory().await.unwrap();
        let store = InstanceStore::new(db.pool.clone());
        let count = migrate_legacy_instances(&store, Path::new("/nonexistent/does/not/exist")).await;
        assert_eq!(count, 0);
    }
}
