//! Maps a grain-id embedded in a `ui-<id>`/`api-<id>` hostname to the
//! package-id the grain should boot from.
//!
//! Upstream Sandstorm resolves this through the shell's Mongo-backed
//! router; a full router/database is explicitly out of scope here (spec.md
//! §1 lists the shell as an external collaborator). This stands in for it
//! with a flat JSON index file under the data root, refreshed on every
//! lookup miss — the minimum needed to drive `startGrain`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrainDirectoryEntry {
    pub package_id: String,
    pub app_title: String,
}

/// A foreign-hostname router reply (spec.md §3's `info` tagged union),
/// together with the TTL the router advertised for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ForeignHostDirectoryEntry {
    StaticPublishing { public_id: String, ttl_secs: u64 },
    Standalone { ttl_secs: u64 },
}

/// Stands in for the router's foreign-hostname resolution (DNS TXT lookup
/// or static-publishing registration) the same way [`GrainDirectory`]
/// stands in for the shell's Mongo-backed grain lookup: a flat JSON index
/// under the data root, refreshed on every cache miss.
pub struct ForeignHostDirectory {
    index_path: PathBuf,
    cache: DashMap<String, ForeignHostDirectoryEntry>,
}

impl ForeignHostDirectory {
    pub fn new(data_root: &Path) -> Self {
        Self {
            index_path: data_root.join("foreign-hosts.json"),
            cache: DashMap::new(),
        }
    }

    /// Returns `None` when the host is unknown to the directory, which the
    /// caller treats as `ForeignHostInfo::Unknown`.
    pub async fn lookup(&self, host: &str) -> Option<ForeignHostDirectoryEntry> {
        if let Some(entry) = self.cache.get(host) {
            return Some(entry.clone());
        }
        let _ = self.reload().await;
        self.cache.get(host).map(|e| e.clone())
    }

    async fn reload(&self) -> Result<(), Error> {
        let contents = match tokio::fs::read_to_string(&self.index_path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(Error::from(e)),
        };
        let parsed: HashMap<String, ForeignHostDirectoryEntry> = serde_json::from_str(&contents)
            .map_err(|e| Error::InputInvalid(format!("foreign-hosts.json: {e}")))?;
        for (host, entry) in parsed {
            self.cache.insert(host, entry);
        }
        Ok(())
    }
}

pub struct GrainDirectory {
    index_path: PathBuf,
    cache: DashMap<String, GrainDirectoryEntry>,
}

impl GrainDirectory {
    pub fn new(data_root: &Path) -> Self {
        Self {
            index_path: data_root.join("grain-directory.json"),
            cache: DashMap::new(),
        }
    }

    pub async fn lookup(&self, grain_id: &str) -> Result<GrainDirectoryEntry, Error> {
        if let Some(entry) = self.cache.get(grain_id) {
            return Ok(entry.clone());
        }
        self.reload().await?;
        self.cache
            .get(grain_id)
            .map(|e| e.clone())
            .ok_or(Error::NotFound)
    }

    async fn reload(&self) -> Result<(), Error> {
        let contents = match tokio::fs::read_to_string(&self.index_path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(Error::from(e)),
        };
        let parsed: HashMap<String, GrainDirectoryEntry> = serde_json::from_str(&contents)
            .map_err(|e| Error::InputInvalid(format!("grain-directory.json: {e}")))?;
        for (grain_id, entry) in parsed {
            self.cache.insert(grain_id, entry);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lookup_reads_through_to_disk_on_miss() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(
            dir.path().join("grain-directory.json"),
            r#"{"grain0001": {"package_id": "abc", "app_title": "Demo"}}"#,
        )
        .await
        .unwrap();

        let directory = GrainDirectory::new(dir.path());
        let entry = directory.lookup("grain0001").await.unwrap();
        assert_eq!(entry.package_id, "abc");
    }

    #[tokio::test]
    async fn lookup_unknown_grain_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let directory = GrainDirectory::new(dir.path());
        let err = directory.lookup("nope0000").await.unwrap_err();
        assert!(matches!(err, Error::NotFound));
    }

    #[tokio::test]
    async fn foreign_host_directory_resolves_static_publishing() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(
            dir.path().join("foreign-hosts.json"),
            r#"{"aaaaaaaaaaaaaaaaaaaa": {"kind": "static_publishing", "public_id": "grain0001", "ttl_secs": 60}}"#,
        )
        .await
        .unwrap();

        let directory = ForeignHostDirectory::new(dir.path());
        let entry = directory.lookup("aaaaaaaaaaaaaaaaaaaa").await.unwrap();
        match entry {
            ForeignHostDirectoryEntry::StaticPublishing { public_id, ttl_secs } => {
                assert_eq!(public_id, "grain0001");
                assert_eq!(ttl_secs, 60);
            }
            other => panic!("unexpected entry: {other:?}"),
        }
    }

    #[tokio::test]
    async fn foreign_host_directory_unknown_host_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let directory = ForeignHostDirectory::new(dir.path());
        assert!(directory.lookup("nowhere.example").await.is_none());
    }
}
