//! Sandbox assembly: the ordered sequence of namespace, mount, and
//! privilege-drop operations that turn a freshly-forked process into a
//! grain init (spec.md §4.1, "Sandbox assembly (order is load-bearing)").
//!
//! Grounded in `original_source/src/sandstorm/supervisor.h`'s private
//! method list (`unshareOuter`, `setupFilesystem`, `setupSeccomp`, …) and
//! `sandbox.c++`'s `hideUserGroupIds`. The original builds a single
//! `SupervisorMain` object with these as member functions; this crate
//! expresses the same sequence as free functions over an explicit
//! `GrainPaths` value, which is the idiomatic-Rust shape the teacher
//! (`hypervisor/src/sandbox/mod.rs`) uses for its own process-lifecycle
//! code — small, directly-testable functions over an owned config struct
//! rather than a God object with private mutable fields.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::mount::{mount, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::unistd::{pivot_root, Gid, Uid};

use crate::seccomp;

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("failed to unshare namespaces: {0}")]
    Unshare(nix::Error),
    #[error("failed to write {0}: {1}")]
    WriteProcFile(PathBuf, std::io::Error),
    #[error("mount {src} -> {dst} failed: {source}")]
    Mount {
        src: String,
        dst: String,
        source: nix::Error,
    },
    #[error("pivot_root failed: {0}")]
    PivotRoot(nix::Error),
    #[error("failed to create skeleton directory {0}: {1}")]
    Mkdir(PathBuf, std::io::Error),
    #[error("failed to drop capabilities: {0}")]
    DropCaps(String),
    #[error("failed to install seccomp filter: {0}")]
    Seccomp(String),
}

/// Absolute paths the supervisor needs to assemble one grain's filesystem
/// view (spec.md §4.1 step 4).
pub struct GrainPaths {
    /// The package's read-only unpacked tree, `apps/<pkg>/sandbox`.
    pub app_sandbox: PathBuf,
    /// The grain's mutable state directory, bind-mounted read-write at
    /// `/var` inside the sandbox.
    pub grain_var: PathBuf,
    /// Scratch tmpfs root the skeleton is built under before pivot_root.
    pub skeleton_root: PathBuf,
    pub mount_proc: bool,
}

/// Step 1: enter a new user namespace and remap uid/gid.
///
/// `randomize` selects a pseudo-random fake id derived from wall-clock
/// (dev mode) instead of the fixed 1000:1000, to catch apps that hard-code
/// the default — ported verbatim from `sandbox.c++::hideUserGroupIds`.
pub fn enter_user_namespace(randomize: bool) -> Result<(), SandboxError> {
    let real_uid = Uid::current();
    let real_gid = Gid::current();

    unshare(CloneFlags::CLONE_NEWUSER).map_err(SandboxError::Unshare)?;

    write_proc_file("/proc/self/setgroups", "deny\n")?;

    let (fake_uid, fake_gid) = if randomize {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0) as u64;
        (now * 4721 % 2000 + 1, now * 2791 % 2000 + 1)
    } else {
        (1000, 1000)
    };

    write_proc_file(
        "/proc/self/uid_map",
        &format!("{fake_uid} {real_uid} 1\n"),
    )?;
    write_proc_file(
        "/proc/self/gid_map",
        &format!("{fake_gid} {real_gid} 1\n"),
    )?;

    Ok(())
}

fn write_proc_file(path: &str, contents: &str) -> Result<(), SandboxError> {
    match std::fs::write(path, contents) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()), // setgroups absent on old kernels
        Err(e) => Err(SandboxError::WriteProcFile(PathBuf::from(path), e)),
    }
}

/// Step 2: enter the remaining namespaces.
pub fn enter_remaining_namespaces() -> Result<(), SandboxError> {
    unshare(
        CloneFlags::CLONE_NEWNS
            | CloneFlags::CLONE_NEWIPC
            | CloneFlags::CLONE_NEWUTS
            | CloneFlags::CLONE_NEWPID
            | CloneFlags::CLONE_NEWNET
            | CloneFlags::CLONE_NEWCGROUP,
    )
    .map_err(SandboxError::Unshare)
}

/// Step 3: make `/` recursively private so bind mounts built here don't leak
/// back to the host mount namespace.
pub fn make_root_private() -> Result<(), SandboxError> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| SandboxError::Mount {
        src: "none".into(),
        dst: "/".into(),
        source: e,
    })
}

fn bind_mount(src: &Path, dst: &Path, read_only: bool) -> Result<(), SandboxError> {
    mount(
        Some(src),
        dst,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| SandboxError::Mount {
        src: src.display().to_string(),
        dst: dst.display().to_string(),
        source: e,
    })?;

    if read_only {
        mount(
            Some(src),
            dst,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .map_err(|e| SandboxError::Mount {
            src: src.display().to_string(),
            dst: dst.display().to_string(),
            source: e,
        })?;
    }
    Ok(())
}

/// Step 4: construct the read-only skeleton under a tmpfs (spec.md §4.1).
pub fn build_skeleton(paths: &GrainPaths) -> Result<(), SandboxError> {
    let root = &paths.skeleton_root;
    mount(
        Some("tmpfs"),
        root,
        Some("tmpfs"),
        MsFlags::MS_NOSUID,
        Some("size=16m"),
    )
    .map_err(|e| SandboxError::Mount {
        src: "tmpfs".into(),
        dst: root.display().to_string(),
        source: e,
    })?;

    for dir in ["dev", "var", "sandbox", "proc", "oldroot"] {
        let p = root.join(dir);
        std::fs::create_dir_all(&p).map_err(|e| SandboxError::Mkdir(p, e))?;
    }

    for dev in ["null", "zero", "random", "urandom"] {
        let dst = root.join("dev").join(dev);
        std::fs::File::create(&dst).map_err(|e| SandboxError::Mkdir(dst.clone(), e))?;
        bind_mount(Path::new(&format!("/dev/{dev}")), &dst, false)?;
    }

    // The app's read-only tree; bind the package's own tree over itself
    // afterward to strip any suid bits the unpacked package might carry.
    bind_mount(&paths.app_sandbox, &root.join("sandbox"), true)?;
    bind_mount(&paths.app_sandbox, &paths.app_sandbox, true)?;

    // The grain's mutable state, read-write.
    bind_mount(&paths.grain_var, &root.join("var"), false)?;

    Ok(())
}

/// Step 5: pivot into the skeleton and detach the old root.
pub fn enter_skeleton(paths: &GrainPaths) -> Result<(), SandboxError> {
    let old_root = paths.skeleton_root.join("oldroot");
    pivot_root(&paths.skeleton_root, &old_root).map_err(SandboxError::PivotRoot)?;
    std::env::set_current_dir("/").map_err(|e| SandboxError::WriteProcFile(PathBuf::from("/"), e))?;

    mount(
        None::<&str>,
        "/oldroot",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| SandboxError::Mount {
        src: "none".into(),
        dst: "/oldroot".into(),
        source: e,
    })?;
    nix::mount::umount2("/oldroot", nix::mount::MntFlags::MNT_DETACH)
        .map_err(SandboxError::PivotRoot)?;
    let _ = std::fs::remove_dir("/oldroot");

    Ok(())
}

/// Step 6: optionally mount a private `/proc` (only if the app declared it
/// needs one).
pub fn maybe_mount_proc(paths: &GrainPaths) -> Result<(), SandboxError> {
    if !paths.mount_proc {
        return Ok(());
    }
    mount(
        Some("proc"),
        "/proc",
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None::<&str>,
    )
    .map_err(|e| SandboxError::Mount {
        src: "proc".into(),
        dst: "/proc".into(),
        source: e,
    })
}

/// Step 7: drop every Linux capability, set `no_new_privs`, install the
/// seccomp filter.
pub fn drop_privileges_and_install_seccomp() -> Result<(), SandboxError> {
    caps::clear(None, caps::CapSet::Effective).map_err(|e| SandboxError::DropCaps(e.to_string()))?;
    caps::clear(None, caps::CapSet::Permitted).map_err(|e| SandboxError::DropCaps(e.to_string()))?;
    caps::clear(None, caps::CapSet::Inheritable)
        .map_err(|e| SandboxError::DropCaps(e.to_string()))?;

    let rc = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if rc != 0 {
        return Err(SandboxError::DropCaps(
            "PR_SET_NO_NEW_PRIVS failed".to_string(),
        ));
    }

    install_seccomp_filter()
}

fn install_seccomp_filter() -> Result<(), SandboxError> {
    let program = seccomp::build_grain_filter();
    let filters: Vec<libc::sock_filter> = program
        .iter()
        .map(|f| libc::sock_filter {
            code: f.code,
            jt: f.jt,
            jf: f.jf,
            k: f.k,
        })
        .collect();

    let fprog = libc::sock_fprog {
        len: filters.len() as u16,
        filter: filters.as_ptr() as *mut libc::sock_filter,
    };

    let rc = unsafe {
        libc::prctl(
            libc::PR_SET_SECCOMP,
            libc::SECCOMP_MODE_FILTER,
            &fprog as *const _ as u64,
            0,
            0,
        )
    };
    if rc != 0 {
        return Err(SandboxError::Seccomp(
            std::io::Error::last_os_error().to_string(),
        ));
    }
    Ok(())
}

/// Marks a path's permission bits read-only, used when flattening a
/// directory tree copied for backup/restore so the produced tree can't be
/// mistaken for a writable grain var directory.
pub fn mark_read_only(path: &Path) -> std::io::Result<()> {
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o555);
    std::fs::set_permissions(path, perms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_read_only_clears_write_bits() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, b"x").unwrap();
        mark_read_only(&file).unwrap();
        let mode = std::fs::metadata(&file).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o555);
    }
}
