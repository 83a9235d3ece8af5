mod capability;
mod cgroup;
mod config;
mod logrotate;
mod sandbox_assembly;
mod seccomp;

use std::process::Stdio;
use std::sync::Arc;

use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use tokio::net::UnixListener;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use capability::Supervisor;
use config::Config;
use sandbox_assembly::GrainPaths;

/// One OS thread, one event loop, per spec.md §5's scheduling model — the
/// supervisor is a per-grain process, not a multiplexed server.
#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "supervisor=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let manifest_path = std::env::var("SANDSTORM_MANIFEST_PATH")
        .unwrap_or_else(|_| "sandstorm-manifest".to_string());
    let manifest_toml = std::fs::read_to_string(&manifest_path)
        .map_err(|e| anyhow::anyhow!("reading manifest {manifest_path}: {e}"))?;
    let manifest = shared_types::Manifest::parse_toml(&manifest_toml)?;
    manifest.validate()?;
    let command = manifest
        .main_command()
        .ok_or_else(|| anyhow::anyhow!("manifest has no commands"))?
        .clone();

    let config = Config::from_env(command)?;
    info!(grain_id = %config.grain_id, "supervisor starting");

    std::fs::create_dir_all(&config.grain_dir)?;
    let var_dir = config.grain_dir.join("var");
    std::fs::create_dir_all(&var_dir)?;
    let log_path = config.grain_dir.join("log");

    let cgroup_root = cgroup::Cgroup::open(
        config
            .cgroup_path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("cgroup path has no parent"))?,
    )
    .unwrap_or_else(|_| {
        // Cgroup v2 hierarchy not mounted (e.g. in a test container); the
        // grain still runs, just without resource isolation.
        cgroup::Cgroup::open(std::env::temp_dir()).expect("fallback cgroup dir must exist")
    });
    let grain_cgroup = cgroup_root.get_or_make_child(&config.grain_id).ok();

    let skeleton_root = std::env::temp_dir().join(format!("sandstorm-skel-{}", config.grain_id));
    std::fs::create_dir_all(&skeleton_root)?;
    let paths = GrainPaths {
        app_sandbox: config.app_sandbox_dir.clone(),
        grain_var: var_dir.clone(),
        skeleton_root,
        mount_proc: config.mount_proc,
    };

    let grain_init_pid = match unsafe { fork()? } {
        ForkResult::Child => {
            if let Err(e) = run_sandboxed_child(&paths, &config) {
                error!(error = %e, "sandbox assembly / exec failed in child");
                std::process::exit(1);
            }
            unreachable!("exec never returns on success");
        }
        ForkResult::Parent { child } => child,
    };

    if let Some(cg) = &grain_cgroup {
        if let Err(e) = cg.add_pid(grain_init_pid.as_raw()) {
            error!(error = %e, "failed to join grain cgroup");
        }
    }

    let log = logrotate::LogFile::open(&log_path, config.log_rotate_threshold_bytes)?;
    let now_nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0);
    let supervisor = Supervisor::new(
        grain_init_pid,
        logrotate::LogFile::open(&log_path, config.log_rotate_threshold_bytes)?,
        config.grain_dir.clone(),
        config.shutdown_grace,
        now_nanos,
    );

    let idle_timer = tokio::spawn(capability::run_idle_timer(
        Arc::clone(&supervisor),
        config.idle_timeout,
    ));
    let rotation_loop = tokio::spawn(logrotate::run_rotation_loop(
        log,
        config.log_rotate_interval,
    ));

    // The `Supervisor` capability is served on a named socket rather than
    // spec.md §4.1's literal fd-3 socket pair, so that the backend (and
    // later the gateway, via the backend's `getGrain`) can reconnect after a
    // transient disconnect instead of consuming a single fd once.
    if let Some(parent) = config.rpc_socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let _ = std::fs::remove_file(&config.rpc_socket_path);
    let rpc_listener = UnixListener::bind(&config.rpc_socket_path)?;
    let rpc_accept = tokio::spawn(accept_loop(rpc_listener, Arc::clone(&supervisor)));

    if let Err(e) = spawn_http_bridge(&config).await {
        warn!(error = %e, "failed to start http-bridge; WebSession calls will fail");
    }

    let reap = tokio::task::spawn_blocking(move || reap_grain_init(grain_init_pid));

    tokio::select! {
        _ = rpc_accept => info!("rpc accept loop ended"),
        _ = reap => info!("grain init exited; supervisor capability now disconnected"),
        _ = idle_timer => info!("idle timer fired shutdown"),
    }
    rotation_loop.abort();

    Ok(())
}

/// Accepts connections on the `Supervisor` capability's socket, serving each
/// on its own task (spec.md §9's dispatch loop is per-connection, not
/// per-process, now that the socket is reusable).
async fn accept_loop(listener: UnixListener, target: Arc<Supervisor>) {
    loop {
        let (stream, _addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "rpc listener accept failed");
                return;
            }
        };
        let (read_half, write_half) = stream.into_split();
        tokio::spawn(shared_types::rpc::serve(
            read_half,
            write_half,
            Arc::clone(&target),
        ));
    }
}

/// Forks `http-bridge` alongside the grain, pointed at the app's HTTP port
/// and the `WebSession` socket the gateway eventually dials through the
/// backend's `getGrain` (spec.md §4.4).
async fn spawn_http_bridge(config: &Config) -> anyhow::Result<tokio::process::Child> {
    if let Some(parent) = config.bridge_socket_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let child = tokio::process::Command::new(&config.http_bridge_binary)
        .env("SANDSTORM_APP_HTTP_ADDR", &config.app_http_addr)
        .env("SANDSTORM_BRIDGE_SOCKET_PATH", &config.bridge_socket_path)
        .env(
            "SANDSTORM_BRIDGE_WS_SOCKET_PATH",
            &config.bridge_ws_socket_path,
        )
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()?;
    Ok(child)
}

/// Runs in the forked child: assembles the sandbox per spec.md §4.1's
/// eight-step order, then execs the app's declared command. Never returns
/// on success.
fn run_sandboxed_child(paths: &GrainPaths, config: &Config) -> anyhow::Result<()> {
    sandbox_assembly::enter_user_namespace(config.dev_mode)?;
    sandbox_assembly::enter_remaining_namespaces()?;
    sandbox_assembly::make_root_private()?;
    sandbox_assembly::build_skeleton(paths)?;
    sandbox_assembly::enter_skeleton(paths)?;
    sandbox_assembly::maybe_mount_proc(paths)?;
    sandbox_assembly::drop_privileges_and_install_seccomp()?;
    // Step 8 (cgroup join) happens in the parent via `add_pid`, since the
    // child doesn't have the grain cgroup's fd inside its own namespace view.

    close_inherited_fds_above(4)?;

    let argv: Vec<std::ffi::CString> = config
        .command
        .argv
        .iter()
        .map(|s| std::ffi::CString::new(s.as_str()))
        .collect::<Result<_, _>>()?;
    let envp: Vec<std::ffi::CString> = config
        .command
        .env
        .iter()
        .map(|(k, v)| std::ffi::CString::new(format!("{k}={v}")))
        .collect::<Result<_, _>>()?;

    nix::unistd::execve(&argv[0], &argv, &envp)?;
    unreachable!("execve only returns on error, which is propagated above");
}

/// Scans `/proc/self/fd` and closes anything not close-on-exec that wasn't
/// explicitly retained, per spec.md §5 "All FDs are opened with
/// close-on-exec; the supervisor enforces this before each exec".
fn close_inherited_fds_above(keep_below: i32) -> std::io::Result<()> {
    let entries = std::fs::read_dir("/proc/self/fd")?;
    for entry in entries.flatten() {
        if let Ok(fd) = entry.file_name().to_string_lossy().parse::<i32>() {
            if fd >= keep_below {
                let _ = nix::unistd::close(fd);
            }
        }
    }
    Ok(())
}

fn reap_grain_init(pid: Pid) {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => {
                info!(code, "grain init exited");
                return;
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                info!(?sig, "grain init killed by signal");
                return;
            }
            Ok(_) => continue,
            Err(_) => return,
        }
    }
}
