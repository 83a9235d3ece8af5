//! Content-addressed package store (spec.md §4.2 "Package install").
//!
//! Streaming upload: `installPackage` hands back an `upload_id`; the caller
//! writes chunks via `write_chunk`, then `finish_install` verifies the SPK
//! signature, extracts the body, derives the package id, and atomically
//! renames the unpacked tree into place. A concurrent install of the same
//! package id is deduplicated by checking whether the final rename target
//! already exists before renaming over it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::error::Error;
use shared_types::spk::verify_spk;
use shared_types::{Manifest, PackageId};

pub struct PendingUpload {
    temp_path: PathBuf,
}

pub struct PackageStore {
    apps_dir: PathBuf,
    scratch_dir: PathBuf,
    pending: Mutex<HashMap<String, PendingUpload>>,
    next_upload_id: std::sync::atomic::AtomicU64,
}

#[derive(Debug)]
pub struct InstalledPackage {
    pub package_id: PackageId,
    pub manifest: Manifest,
}

impl PackageStore {
    pub fn new(apps_dir: PathBuf, scratch_dir: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            apps_dir,
            scratch_dir,
            pending: Mutex::new(HashMap::new()),
            next_upload_id: std::sync::atomic::AtomicU64::new(1),
        })
    }

    pub async fn start_install(&self) -> Result<String, Error> {
        fs::create_dir_all(&self.scratch_dir).await?;
        let id = self
            .next_upload_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            .to_string();
        let temp_path = self.scratch_dir.join(format!("upload-{id}.spk"));
        fs::File::create(&temp_path).await?;
        self.pending
            .lock()
            .await
            .insert(id.clone(), PendingUpload { temp_path });
        Ok(id)
    }

    pub async fn write_chunk(&self, upload_id: &str, chunk: &[u8]) -> Result<(), Error> {
        let path = {
            let pending = self.pending.lock().await;
            pending
                .get(upload_id)
                .map(|p| p.temp_path.clone())
                .ok_or_else(|| Error::InputInvalid(format!("unknown upload {upload_id}")))?
        };
        let mut file = fs::OpenOptions::new().append(true).open(&path).await?;
        file.write_all(chunk).await?;
        Ok(())
    }

    /// Verifies, unpacks, and installs the uploaded SPK. Returns the
    /// resolved `(packageId, manifest)`; the caller derives `appId` from the
    /// manifest's declared app id or the signing key, per spec.md's
    /// `AppIdReplacement` machinery.
    pub async fn finish_install(&self, upload_id: &str) -> Result<InstalledPackage, Error> {
        let temp_path = {
            let mut pending = self.pending.lock().await;
            pending
                .remove(upload_id)
                .ok_or_else(|| Error::InputInvalid(format!("unknown upload {upload_id}")))?
                .temp_path
        };

        let data = fs::read(&temp_path).await?;
        let verified = verify_spk(&data)?;
        let _ = fs::remove_file(&temp_path).await;

        let package_id = verified.package_id;
        let final_dir = self.apps_dir.join(package_id.to_text());

        // Dedup: another concurrent install of the identical content already
        // finished — observe the rename target rather than re-unpacking.
        if final_dir.is_dir() {
            let manifest = read_manifest(&final_dir.join("sandbox")).await?;
            return Ok(InstalledPackage {
                package_id,
                manifest,
            });
        }

        let extract_dir = self
            .scratch_dir
            .join(format!("extract-{}", package_id.to_text()));
        extract_archive(&verified.body, &extract_dir).await?;

        let manifest = read_manifest(&extract_dir.join("sandbox")).await?;

        match fs::rename(&extract_dir, &final_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists || final_dir.is_dir() => {
                // Lost the race to a concurrent identical install; discard ours.
                let _ = fs::remove_dir_all(&extract_dir).await;
            }
            Err(e) => return Err(e.into()),
        }

        Ok(InstalledPackage {
            package_id,
            manifest,
        })
    }

    pub async fn try_get_package(&self, package_id: &PackageId) -> Option<PathBuf> {
        let dir = self.apps_dir.join(package_id.to_text());
        if dir.is_dir() {
            Some(dir)
        } else {
            None
        }
    }

    pub async fn delete_package(&self, package_id: &PackageId) -> Result<(), Error> {
        let dir = self.apps_dir.join(package_id.to_text());
        fs::remove_dir_all(&dir).await.or_else(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Ok(())
            } else {
                Err(e)
            }
        })?;
        Ok(())
    }
}

async fn read_manifest(sandbox_dir: &std::path::Path) -> Result<Manifest, Error> {
    let text = fs::read_to_string(sandbox_dir.join("sandstorm-manifest")).await?;
    let manifest = Manifest::parse_toml(&text)?;
    manifest.validate()?;
    Ok(manifest)
}

/// Writes the verified SPK body (a zip archive containing a `sandbox/`
/// tree, per spec.md §4.2) to a scratch file and shells out to `unzip` to
/// extract it into `dest`, mirroring `backup.rs`'s subprocess pattern.
async fn extract_archive(body: &[u8], dest: &std::path::Path) -> Result<(), Error> {
    fs::create_dir_all(dest).await?;
    let archive_path = dest.with_extension("spk.zip");
    fs::write(&archive_path, body).await?;

    let result = async {
        let mut child = Command::new("unzip")
            .arg("-q")
            .arg("-o")
            .arg(&archive_path)
            .arg("-d")
            .arg(dest)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Spawn(e.to_string()))?;

        let status = child.wait().await?;
        if !status.success() {
            let mut stderr = String::new();
            if let Some(mut s) = child.stderr.take() {
                let _ = s.read_to_string(&mut stderr).await;
            }
            return Err(Error::Spawn(format!("unzip exited with {status}: {stderr}")));
        }
        Ok(())
    }
    .await;

    let _ = fs::remove_file(&archive_path).await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use shared_types::spk::sign_spk;

    fn which_zip() -> Result<(), ()> {
        if std::process::Command::new("zip").arg("-v").output().is_ok() {
            Ok(())
        } else {
            Err(())
        }
    }

    /// Builds a real zip archive (the SPK body format, spec.md §4.2) with a
    /// single `sandbox/sandstorm-manifest` entry, by shelling out to `zip`
    /// against a throwaway source tree.
    fn test_manifest_body() -> Vec<u8> {
        let src = tempfile::tempdir().unwrap();
        let sandbox_dir = src.path().join("sandbox");
        std::fs::create_dir_all(&sandbox_dir).unwrap();
        std::fs::write(
            sandbox_dir.join("sandstorm-manifest"),
            br#"app_title = "Test App"
mount_proc = false

[[commands]]
argv = ["/sandbox/app"]
env = []
"#,
        )
        .unwrap();

        let archive_path = src.path().join("out.zip");
        let status = std::process::Command::new("zip")
            .arg("-r")
            .arg("-q")
            .arg(&archive_path)
            .arg("sandbox")
            .current_dir(src.path())
            .status()
            .unwrap();
        assert!(status.success());
        std::fs::read(&archive_path).unwrap()
    }

    #[tokio::test]
    async fn install_roundtrip_produces_manifest() {
        let Ok(_) = which_zip() else {
            return; // zip/unzip not installed on this runner; skip.
        };

        let dir = tempfile::tempdir().unwrap();
        let store = PackageStore::new(dir.path().join("apps"), dir.path().join("scratch"));

        let mut csprng = rand::rngs::OsRng;
        let signing_key = SigningKey::generate(&mut csprng);
        let spk = sign_spk(&test_manifest_body(), &signing_key);

        let upload_id = store.start_install().await.unwrap();
        store.write_chunk(&upload_id, &spk).await.unwrap();
        let installed = store.finish_install(&upload_id).await.unwrap();

        assert_eq!(installed.manifest.app_title, "Test App");
        assert!(store
            .try_get_package(&installed.package_id)
            .await
            .is_some());
    }

    #[tokio::test]
    async fn duplicate_install_of_same_content_dedups() {
        let Ok(_) = which_zip() else {
            return; // zip/unzip not installed on this runner; skip.
        };

        let dir = tempfile::tempdir().unwrap();
        let store = PackageStore::new(dir.path().join("apps"), dir.path().join("scratch"));

        let mut csprng = rand::rngs::OsRng;
        let signing_key = SigningKey::generate(&mut csprng);
        let spk = sign_spk(&test_manifest_body(), &signing_key);

        let first_id = store.start_install().await.unwrap();
        store.write_chunk(&first_id, &spk).await.unwrap();
        let first = store.finish_install(&first_id).await.unwrap();

        let second_id = store.start_install().await.unwrap();
        store.write_chunk(&second_id, &spk).await.unwrap();
        let second = store.finish_install(&second_id).await.unwrap();

        assert_eq!(first.package_id.as_bytes(), second.package_id.as_bytes());
    }
}
