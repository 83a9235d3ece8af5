//! The grain's rolling log file (spec.md §4.1 "Log rotation").
//!
//! When the file exceeds `threshold` bytes, the last `threshold` bytes are
//! copied to `<log>.1` and the live file truncated to zero, rather than
//! renaming — the app may be holding the live fd open across the rotation
//! (it keeps appending to the same descriptor), which is why this can't
//! just be a `rename` + reopen like typical logrotate setups.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub struct LogFile {
    path: PathBuf,
    threshold: u64,
}

impl LogFile {
    pub fn open(path: impl Into<PathBuf>, threshold: u64) -> std::io::Result<Self> {
        let path = path.into();
        OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, threshold })
    }

    fn rotated_path(&self) -> PathBuf {
        let mut p = self.path.clone().into_os_string();
        p.push(".1");
        PathBuf::from(p)
    }

    pub fn read_tail(&self, max_bytes: u64) -> std::io::Result<Vec<u8>> {
        let mut file = File::open(&self.path)?;
        let len = file.metadata()?.len();
        let read_len = len.min(max_bytes);
        file.seek(SeekFrom::Start(len - read_len))?;
        let mut buf = vec![0u8; read_len as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn sync(&self) -> std::io::Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        file.sync_all()
    }

    /// Checks the current size and rotates if over threshold. Returns
    /// whether a rotation happened.
    pub fn rotate_if_needed(&self) -> std::io::Result<bool> {
        let len = std::fs::metadata(&self.path)?.len();
        if len <= self.threshold {
            return Ok(false);
        }

        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        let keep = self.threshold;
        file.seek(SeekFrom::Start(len - keep))?;
        let mut tail = vec![0u8; keep as usize];
        file.read_exact(&mut tail)?;

        let mut rotated = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(self.rotated_path())?;
        rotated.write_all(&tail)?;
        rotated.sync_all()?;

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        Ok(true)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Checks and rotates every `interval`, per spec.md §5's "Log rotation
/// check: every 5 minutes".
pub async fn run_rotation_loop(log: LogFile, interval: std::time::Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if let Err(e) = log.rotate_if_needed() {
            tracing::warn!(error = %e, "log rotation check failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotate_copies_tail_and_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        let log = LogFile::open(&path, 10).unwrap();
        std::fs::write(&path, b"0123456789ABCDEFGHIJ").unwrap(); // 21 bytes > threshold

        let rotated = log.rotate_if_needed().unwrap();
        assert!(rotated);

        let live_len = std::fs::metadata(&path).unwrap().len();
        assert_eq!(live_len, 0);

        let mut rotated_path = path.clone().into_os_string();
        rotated_path.push(".1");
        let rotated_contents = std::fs::read(rotated_path).unwrap();
        assert_eq!(rotated_contents, b"ABCDEFGHIJ");
    }

    #[test]
    fn no_rotation_below_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        let log = LogFile::open(&path, 1024).unwrap();
        std::fs::write(&path, b"short").unwrap();
        assert!(!log.rotate_if_needed().unwrap());
    }

    #[test]
    fn read_tail_returns_last_n_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        let log = LogFile::open(&path, 1024).unwrap();
        std::fs::write(&path, b"0123456789").unwrap();
        let tail = log.read_tail(4).unwrap();
        assert_eq!(tail, b"6789");
    }
}
