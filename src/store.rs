use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;

/// A personal text room owned by a user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRecord {
    pub channel_id: u64,
    pub name: String,
}

/// The latest check-in of a user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckinRecord {
    pub user_tag: String,
    pub at: DateTime<Utc>,
    pub notes: String,
}

/// A user-keyed map mirrored to a pretty-printed JSON file.
pub struct JsonStore<T> {
    path: PathBuf,
    entries: RwLock<BTreeMap<u64, T>>,
}

impl<T> JsonStore<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = if path.exists() {
            let content = fs::read_to_string(&path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            BTreeMap::new()
        };

        write_atomically(&path, &entries).await?;
        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get(&self, user_id: u64) -> Option<T> {
        self.entries.read().await.get(&user_id).cloned()
    }

    // Every mutation keeps the write guard until its snapshot is on disk,
    // so file writes land in the same order as the changes.
    pub async fn insert(&self, user_id: u64, value: T) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.insert(user_id, value);
        write_atomically(&self.path, &*entries).await
    }

    pub async fn remove(&self, user_id: u64) -> Result<Option<T>> {
        let mut entries = self.entries.write().await;
        let removed = entries.remove(&user_id);
        if removed.is_some() {
            write_atomically(&self.path, &*entries).await?;
        }
        Ok(removed)
    }

    /// Drops every entry matching `pred` and returns how many went away.
    pub async fn remove_where<P>(&self, mut pred: P) -> Result<usize>
    where
        P: FnMut(&T) -> bool,
    {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, value| !pred(value));
        let removed = before - entries.len();
        if removed > 0 {
            write_atomically(&self.path, &*entries).await?;
        }
        Ok(removed)
    }

    #[cfg(test)]
    pub async fn snapshot(&self) -> BTreeMap<u64, T> {
        self.entries.read().await.clone()
    }
}

/// Writes next to `path` and renames over it, so a crash never leaves half a file.
async fn write_atomically<T: Serialize>(path: &Path, entries: &BTreeMap<u64, T>) -> Result<()> {
    let content = serde_json::to_string_pretty(entries)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, content)
        .await
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .await
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

/// Both stores the bot keeps on disk.
pub struct Stores {
    pub rooms: JsonStore<RoomRecord>,
    pub checkins: JsonStore<CheckinRecord>,
}

impl Stores {
    pub async fn open(data_dir: &Path) -> Result<Self> {
        Ok(Self {
            rooms: JsonStore::open(data_dir.join("rooms.json")).await?,
            checkins: JsonStore::open(data_dir.join("checkins.json")).await?,
        })
    }
}
