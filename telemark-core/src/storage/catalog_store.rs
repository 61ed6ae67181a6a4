use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

const REGISTRY_FILE: &str = "device_registry.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistryRecord {
    devices: Vec<String>,
    #[serde(default)]
    last_updated: Option<DateTime<Utc>>,
}

/// The process-wide device registry: every id known locally or discovered on
/// the ledger.
///
/// Mutations take the write lock for the whole merge-and-persist step, so
/// there is a single writer at a time. Readers get a cloned snapshot of the
/// set, which may be slightly stale.
pub struct DeviceCatalog {
    path: PathBuf,
    devices: RwLock<BTreeSet<String>>,
}

impl DeviceCatalog {
    /// Load the registry from `base_path`, starting empty when the file is
    /// missing or unreadable.
    pub async fn open(base_path: &Path) -> Result<Self> {
        fs::create_dir_all(base_path).await?;
        let path = base_path.join(REGISTRY_FILE);

        let devices = match fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<RegistryRecord>(&bytes) {
                Ok(record) => record.devices.into_iter().collect(),
                Err(error) => {
                    tracing::warn!(
                        "Device registry at {:?} is unreadable, starting empty: {}",
                        path,
                        error
                    );
                    BTreeSet::new()
                }
            },
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => BTreeSet::new(),
            Err(error) => return Err(error.into()),
        };

        tracing::info!("Device registry loaded with {} devices", devices.len());

        Ok(Self {
            path,
            devices: RwLock::new(devices),
        })
    }

    pub async fn snapshot(&self) -> BTreeSet<String> {
        self.devices.read().await.clone()
    }

    pub async fn contains(&self, device_id: &str) -> bool {
        self.devices.read().await.contains(device_id)
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.devices.read().await.is_empty()
    }

    /// Add every id in `device_ids`; persists only when something was new.
    /// Returns the number of ids added.
    pub async fn merge<I>(&self, device_ids: I) -> Result<usize>
    where
        I: IntoIterator<Item = String>,
    {
        let mut devices = self.devices.write().await;
        let mut added = 0usize;
        for device_id in device_ids {
            if devices.insert(device_id) {
                added += 1;
            }
        }

        if added > 0 {
            persist(&self.path, &devices).await?;
        }
        Ok(added)
    }

    pub async fn insert(&self, device_id: &str) -> Result<bool> {
        if self.contains(device_id).await {
            return Ok(false);
        }
        let added = self.merge([device_id.to_string()]).await?;
        Ok(added > 0)
    }

    pub async fn remove(&self, device_id: &str) -> Result<bool> {
        let mut devices = self.devices.write().await;
        let removed = devices.remove(device_id);
        persist(&self.path, &devices).await?;
        Ok(removed)
    }
}

async fn persist(path: &Path, devices: &BTreeSet<String>) -> Result<()> {
    let record = RegistryRecord {
        devices: devices.iter().cloned().collect(),
        last_updated: Some(Utc::now()),
    };
    let bytes = serde_json::to_vec_pretty(&record)?;

    let temp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&temp_path).await?;
    file.write_all(&bytes).await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(&temp_path, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_merge_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();

        let catalog = DeviceCatalog::open(dir.path()).await.unwrap();
        assert!(catalog.is_empty().await);

        let added = catalog
            .merge(vec!["b".to_string(), "a".to_string(), "a".to_string()])
            .await
            .unwrap();
        assert_eq!(added, 2);
        assert!(catalog.insert("c").await.unwrap());
        assert!(!catalog.insert("c").await.unwrap());

        let reopened = DeviceCatalog::open(dir.path()).await.unwrap();
        let devices: Vec<String> = reopened.snapshot().await.into_iter().collect();
        assert_eq!(devices, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_remove() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = DeviceCatalog::open(dir.path()).await.unwrap();
        catalog.insert("a").await.unwrap();

        assert!(catalog.remove("a").await.unwrap());
        assert!(!catalog.remove("a").await.unwrap());

        let reopened = DeviceCatalog::open(dir.path()).await.unwrap();
        assert_eq!(reopened.len().await, 0);
    }

    #[tokio::test]
    async fn test_corrupt_registry_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(REGISTRY_FILE), b"{not json").unwrap();

        let catalog = DeviceCatalog::open(dir.path()).await.unwrap();
        assert!(catalog.is_empty().await);
    }
}
