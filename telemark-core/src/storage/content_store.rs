use crate::model::{
    HISTORY_LIMIT, HashIndexEntry, HistoryEntry, HistoryReading, Snapshot, validate_device_id,
};
use crate::storage::canonical::canonical_json;
use crate::storage::index_store::IndexStore;
use crate::{Result, TelemarkError};
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

const LATEST_FILE: &str = "latest.json";
const LATEST_IMAGE_FILE: &str = "latest_image.jpg";
const INDEX_FILE: &str = "index.db";
const BLOBS_DIR: &str = "blobs";

#[derive(Debug, Clone)]
pub struct PutSnapshotResult {
    pub hash: String,
    /// The blob already existed and was left untouched.
    pub reused: bool,
}

/// ContentStore keeps per-device, hash-keyed snapshot blobs.
/// Layout: devices/{device_id}/blobs/{hash}.json, plus latest.json,
/// latest_image.jpg and index.db next to the blobs directory.
pub struct ContentStore {
    base_path: PathBuf,
}

impl ContentStore {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(base_path.join("devices"))?;
        Ok(Self { base_path })
    }

    /// Write the snapshot blob under `hash` unless it already exists, record
    /// the hash in the index and move the latest pointer to `snapshot`.
    pub async fn put(
        &self,
        device_id: &str,
        hash: &str,
        snapshot: &Snapshot,
    ) -> Result<PutSnapshotResult> {
        validate_device_id(device_id)?;
        validate_hash(hash)?;

        let blobs_dir = self.device_dir(device_id).join(BLOBS_DIR);
        fs::create_dir_all(&blobs_dir).await?;

        let bytes = canonical_json(snapshot)?;
        let blob_path = self.blob_path(device_id, hash);
        let reused = fs::try_exists(&blob_path).await?;
        if !reused {
            write_atomic(&blob_path, &bytes).await?;
        }

        let index = self.open_index(device_id)?;
        index.put_hash_entry(hash, snapshot.timestamp)?;

        write_atomic(&self.device_dir(device_id).join(LATEST_FILE), &bytes).await?;

        tracing::debug!(
            "Stored snapshot {} for device {} (reused={})",
            hash,
            device_id,
            reused
        );

        Ok(PutSnapshotResult {
            hash: hash.to_string(),
            reused,
        })
    }

    /// Look a snapshot up by hash. An index entry whose blob has gone missing
    /// is dropped from the index and reported as not found.
    pub async fn get(&self, device_id: &str, hash: &str) -> Result<Option<Snapshot>> {
        validate_device_id(device_id)?;
        validate_hash(hash)?;

        if !self.device_exists(device_id).await? {
            return Ok(None);
        }

        let index = self.open_index(device_id)?;
        if index.get_hash_entry(hash)?.is_none() {
            return Ok(None);
        }

        match fs::read(self.blob_path(device_id, hash)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    "Hash index entry {} for device {} points at a missing blob; removing it",
                    hash,
                    device_id
                );
                index.remove_hash_entry(hash)?;
                Ok(None)
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Read a blob straight from disk, ignoring the index. Used when the index
    /// itself may have been lost.
    pub async fn read_blob(&self, device_id: &str, hash: &str) -> Result<Option<Snapshot>> {
        validate_device_id(device_id)?;
        validate_hash(hash)?;

        match fs::read(self.blob_path(device_id, hash)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    pub async fn latest(&self, device_id: &str) -> Result<Option<Snapshot>> {
        validate_device_id(device_id)?;

        match fs::read(self.device_dir(device_id).join(LATEST_FILE)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    /// Append to the series for `T` and keep only the newest entries.
    pub async fn append_history<T: HistoryReading>(
        &self,
        device_id: &str,
        entry: &HistoryEntry<T>,
    ) -> Result<()> {
        validate_device_id(device_id)?;
        fs::create_dir_all(self.device_dir(device_id)).await?;

        let payload = serde_json::to_string(entry)?;
        let index = self.open_index(device_id)?;
        index.append_history(T::KIND, entry.timestamp, &payload, HISTORY_LIMIT)?;
        Ok(())
    }

    pub async fn history<T: HistoryReading>(&self, device_id: &str) -> Result<Vec<HistoryEntry<T>>> {
        validate_device_id(device_id)?;

        if !self.device_exists(device_id).await? {
            return Ok(Vec::new());
        }

        let index = self.open_index(device_id)?;
        let mut entries = Vec::new();
        for payload in index.list_history(T::KIND)? {
            entries.push(serde_json::from_str(&payload)?);
        }
        Ok(entries)
    }

    /// Forget the hash index and both history series of a device. Blobs and
    /// the latest pointer stay on disk.
    pub async fn reset_index(&self, device_id: &str) -> Result<()> {
        validate_device_id(device_id)?;
        fs::create_dir_all(self.device_dir(device_id)).await?;
        self.open_index(device_id)?.clear()
    }

    pub async fn hash_index(&self, device_id: &str) -> Result<Vec<HashIndexEntry>> {
        validate_device_id(device_id)?;

        if !self.device_exists(device_id).await? {
            return Ok(Vec::new());
        }

        self.open_index(device_id)?.list_hash_entries()
    }

    /// Only the most recent image is kept.
    pub async fn put_latest_image(&self, device_id: &str, image: Bytes) -> Result<()> {
        validate_device_id(device_id)?;
        let device_dir = self.device_dir(device_id);
        fs::create_dir_all(&device_dir).await?;
        write_atomic(&device_dir.join(LATEST_IMAGE_FILE), &image).await
    }

    pub async fn latest_image(&self, device_id: &str) -> Result<Option<Bytes>> {
        validate_device_id(device_id)?;

        match fs::read(self.device_dir(device_id).join(LATEST_IMAGE_FILE)).await {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    /// Remove every local artifact of a device. Returns whether anything existed.
    pub async fn delete(&self, device_id: &str) -> Result<bool> {
        validate_device_id(device_id)?;

        let device_dir = self.device_dir(device_id);
        if !fs::try_exists(&device_dir).await? {
            return Ok(false);
        }

        fs::remove_dir_all(&device_dir).await?;
        tracing::info!("Deleted local data for device {}", device_id);
        Ok(true)
    }

    pub async fn device_exists(&self, device_id: &str) -> Result<bool> {
        validate_device_id(device_id)?;
        Ok(fs::try_exists(self.device_dir(device_id)).await?)
    }

    /// Device ids that have a local directory.
    pub async fn list_device_ids(&self) -> Result<Vec<String>> {
        let devices_dir = self.devices_dir();
        if !fs::try_exists(&devices_dir).await? {
            return Ok(Vec::new());
        }

        let mut device_ids = Vec::new();
        let mut entries = fs::read_dir(&devices_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }

            let name = entry.file_name();
            let name = name.to_string_lossy();
            if validate_device_id(&name).is_err() {
                tracing::warn!("Skipping unexpected directory in devices/: {}", name);
                continue;
            }
            device_ids.push(name.to_string());
        }

        device_ids.sort();
        Ok(device_ids)
    }

    fn devices_dir(&self) -> PathBuf {
        self.base_path.join("devices")
    }

    fn device_dir(&self, device_id: &str) -> PathBuf {
        self.devices_dir().join(device_id)
    }

    fn blob_path(&self, device_id: &str, hash: &str) -> PathBuf {
        self.device_dir(device_id)
            .join(BLOBS_DIR)
            .join(format!("{}.json", hash))
    }

    fn open_index(&self, device_id: &str) -> Result<IndexStore> {
        IndexStore::open(self.device_dir(device_id).join(INDEX_FILE))
    }
}

/// Write to a temporary sibling, fsync, then rename into place.
async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&temp_path).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(&temp_path, path).await?;
    Ok(())
}

/// Hashes double as file names, so only lowercase hex SHA-256 digests are accepted.
pub fn validate_hash(hash: &str) -> Result<()> {
    let well_formed = hash.len() == 64
        && hash
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
    if !well_formed {
        return Err(TelemarkError::InvalidRequest(format!(
            "invalid content hash: {}",
            hash
        )));
    }
    Ok(())
}

/// Compute SHA256 hash of data
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
