//! A cgroup v2 node, addressed by an open directory fd.
//!
//! Ported from `original_source/src/sandstorm/cgroup2.c++`/`.h`. The
//! `Freeze` handle is RAII: dropping it writes `0` back to `cgroup.freeze`,
//! matching the original's destructor-based unfreeze.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum CgroupError {
    #[error("failed to open cgroup directory {0}: {1}")]
    Open(PathBuf, std::io::Error),
    #[error("mkdir for cgroup child {0} failed: {1}")]
    Mkdir(PathBuf, std::io::Error),
    #[error("cgroup.procs write failed: {0}")]
    AddPid(std::io::Error),
    #[error("cgroup.freeze write failed: {0}")]
    Freeze(std::io::Error),
}

pub struct Cgroup {
    path: PathBuf,
}

impl Cgroup {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CgroupError> {
        let path = path.into();
        if !path.is_dir() {
            return Err(CgroupError::Open(
                path.clone(),
                std::io::Error::from(std::io::ErrorKind::NotFound),
            ));
        }
        Ok(Cgroup { path })
    }

    /// `mkdirat` the child if it doesn't exist yet, then open it. `EEXIST`
    /// is not an error — concurrent creation is expected when two requests
    /// race to start the same grain (spec.md §3 supervisor-record
    /// invariant).
    pub fn get_or_make_child(&self, name: &str) -> Result<Cgroup, CgroupError> {
        let child_path = self.path.join(name);
        match std::fs::create_dir(&child_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(CgroupError::Mkdir(child_path, e)),
        }
        Cgroup::open(child_path)
    }

    pub fn get_child(&self, name: &str) -> Result<Cgroup, CgroupError> {
        Cgroup::open(self.path.join(name))
    }

    pub fn remove_child(&self, name: &str) -> Result<(), CgroupError> {
        let child_path = self.path.join(name);
        std::fs::remove_dir(&child_path)
            .map_err(|e| CgroupError::Mkdir(child_path, e))
    }

    pub fn add_pid(&self, pid: i32) -> Result<(), CgroupError> {
        let mut file = OpenOptions::new()
            .write(true)
            .open(self.path.join("cgroup.procs"))
            .map_err(CgroupError::AddPid)?;
        write!(file, "{pid}").map_err(CgroupError::AddPid)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Freezes every process in this cgroup node by writing `1\n` to
    /// `cgroup.freeze`. Returns `None` if the kernel doesn't support
    /// freezing (older cgroup v2 hierarchies lack the file) — the original
    /// treats this as a soft failure, not fatal.
    pub fn freeze(&self) -> Result<Option<FreezeHandle>, CgroupError> {
        let freeze_path = self.path.join("cgroup.freeze");
        if !freeze_path.exists() {
            return Ok(None);
        }
        let mut file = OpenOptions::new()
            .write(true)
            .open(&freeze_path)
            .map_err(CgroupError::Freeze)?;
        file.write_all(b"1\n").map_err(CgroupError::Freeze)?;
        Ok(Some(FreezeHandle { file }))
    }
}

/// RAII handle: writing `0\n` to `cgroup.freeze` on drop unfreezes the
/// group, exactly mirroring `Cgroup::FreezeHandle`'s C++ destructor.
pub struct FreezeHandle {
    file: File,
}

impl Drop for FreezeHandle {
    fn drop(&mut self) {
        let _ = self.file.write_all(b"0\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_make_child_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let root = Cgroup::open(dir.path()).unwrap();
        let child1 = root.get_or_make_child("grain-abc").unwrap();
        let child2 = root.get_or_make_child("grain-abc").unwrap();
        assert_eq!(child1.path(), child2.path());
    }

    #[test]
    fn freeze_returns_none_without_cgroup_freeze_file() {
        let dir = tempfile::tempdir().unwrap();
        let root = Cgroup::open(dir.path()).unwrap();
        assert!(root.freeze().unwrap().is_none());
    }

    #[test]
    fn freeze_handle_unfreezes_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cgroup.freeze"), "0\n").unwrap();
        let root = Cgroup::open(dir.path()).unwrap();
        {
            let _handle = root.freeze().unwrap().unwrap();
            let contents = std::fs::read_to_string(dir.path().join("cgroup.freeze")).unwrap();
            assert_eq!(contents.trim(), "1");
        }
        let contents = std::fs::read_to_string(dir.path().join("cgroup.freeze")).unwrap();
        assert_eq!(contents.trim(), "0");
    }
}
