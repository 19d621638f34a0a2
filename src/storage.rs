use anyhow::Result;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Request-scoped files (downloads and merged outputs) under one
/// directory that is also served at `/temp`.
#[derive(Debug, Clone)]
pub struct TempStorage {
    dir: PathBuf,
}

impl TempStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn ensure(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        info!("Temp directory ready at {}", self.dir.display());
        Ok(())
    }

    /// Collision-free under concurrent requests: timestamp plus a random
    /// suffix.
    pub fn unique_path(&self, prefix: &str, ext: &str) -> PathBuf {
        let stamp = Utc::now().format("%Y%m%d%H%M%S%3f");
        let suffix = Uuid::new_v4().simple().to_string();
        self.dir.join(format!("{}_{}_{}.{}", prefix, stamp, &suffix[..12], ext))
    }

    /// Address a client can fetch `path` from, given the service's base URL.
    pub fn public_url(&self, base_url: &str, path: &Path) -> Option<String> {
        let name = path.file_name()?.to_str()?;
        Some(format!("{}/temp/{}", base_url.trim_end_matches('/'), name))
    }

    /// Deletes regular files last modified more than `max_age` ago.
    /// Returns how many were removed.
    pub async fn sweep_older_than(&self, max_age: Duration) -> Result<usize> {
        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let meta = match entry.metadata().await {
                Ok(meta) => meta,
                Err(e) => {
                    debug!("Skipping {}: {}", entry.path().display(), e);
                    continue;
                }
            };
            if !meta.is_file() {
                continue;
            }
            let modified = meta.modified().unwrap_or_else(|_| SystemTime::now());
            if modified > cutoff {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to delete {}: {}", entry.path().display(), e),
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn unique_paths_do_not_collide() {
        let storage = TempStorage::new("temp");
        let a = storage.unique_path("video", "mp4");
        let b = storage.unique_path("video", "mp4");
        assert_ne!(a, b);
        assert!(a.starts_with("temp"));
        assert_eq!(a.extension().and_then(|e| e.to_str()), Some("mp4"));
    }

    #[test]
    fn public_url_uses_file_name_only() {
        let storage = TempStorage::new("/var/tmp/scout");
        let url = storage.public_url("http://localhost:3000/", Path::new("/var/tmp/scout/merged_1.mp4"));
        assert_eq!(url.as_deref(), Some("http://localhost:3000/temp/merged_1.mp4"));
    }

    #[tokio::test]
    async fn sweep_removes_only_old_files() {
        let dir = tempdir().unwrap();
        let storage = TempStorage::new(dir.path());
        let file = dir.path().join("old.mp4");
        tokio::fs::write(&file, b"x").await.unwrap();
        tokio::fs::create_dir(dir.path().join("nested")).await.unwrap();

        assert_eq!(storage.sweep_older_than(Duration::from_secs(3600)).await.unwrap(), 0);
        assert!(file.exists());

        assert_eq!(storage.sweep_older_than(Duration::ZERO).await.unwrap(), 1);
        assert!(!file.exists());
        assert!(dir.path().join("nested").exists());
    }

    #[tokio::test]
    async fn sweep_of_missing_directory_is_empty() {
        let dir = tempdir().unwrap();
        let storage = TempStorage::new(dir.path().join("absent"));
        assert_eq!(storage.sweep_older_than(Duration::ZERO).await.unwrap(), 0);
    }
}
