//! Native Linux stage runner built on `unshare` and `chroot`.
//!
//! The snapshot's root filesystem is activated on the host, extra mounts
//! are bound beneath it, and the entry point runs through
//! `unshare --pid --fork --mount --ipc --uts --kill-child chroot <root>`
//! with a cleared environment. Cancellation sends `SIGTERM`, waits for a
//! grace period, then kills the container.

use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use recast_common::error::{RecastError, Result};
use recast_common::types::Stage;
use recast_core::filesystem::mount;
use recast_image::mount::ActiveMount;

use crate::cancel::CancelToken;
use crate::stage::{MountSpec, StageRunner, StageSpec};

const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(2);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Runs stages as chrooted processes in fresh namespaces.
#[derive(Debug, Clone)]
pub struct ChrootRunner {
    unshare: PathBuf,
    chroot: PathBuf,
    grace_period: Duration,
    poll_interval: Duration,
}

impl ChrootRunner {
    /// Locates the helper binaries and checks privileges.
    ///
    /// # Errors
    ///
    /// Returns an error if not running as root on Linux or if `unshare`
    /// or `chroot` cannot be found on `PATH`.
    pub fn new() -> Result<Self> {
        if !cfg!(target_os = "linux") {
            return Err(RecastError::Config {
                message: "stage containers require Linux".to_owned(),
            });
        }
        recast_core::capability::require_root("running stage containers")?;
        let find = |binary: &str| {
            which::which(binary).map_err(|e| RecastError::Config {
                message: format!("{binary} not found on PATH: {e}"),
            })
        };
        Ok(Self {
            unshare: find("unshare")?,
            chroot: find("chroot")?,
            grace_period: DEFAULT_GRACE_PERIOD,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    /// Returns `true` if [`ChrootRunner::new`] would succeed.
    #[must_use]
    pub fn is_available() -> bool {
        cfg!(target_os = "linux")
            && recast_core::capability::is_root()
            && which::which("unshare").is_ok()
            && which::which("chroot").is_ok()
    }

    /// Sets how long a cancelled container may take to exit after `SIGTERM`.
    #[must_use]
    pub const fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    fn command(&self, root: &Path, spec: &StageSpec) -> Command {
        let mut command = Command::new(&self.unshare);
        let _ = command.args(["--pid", "--fork", "--mount", "--ipc", "--uts", "--kill-child"]);
        if !spec.host_network {
            let _ = command.arg("--net");
        }
        let _ = command
            .arg(&self.chroot)
            .arg(root)
            .args(["/usr/bin/env", "bash", "-c"])
            .arg(spec.command_line())
            .env_clear()
            .envs(spec.env.iter().filter_map(|entry| entry.split_once('=')))
            .stdin(Stdio::null());
        command
    }

    fn wait(&self, child: &mut std::process::Child, stage: Stage, cancel: &CancelToken) -> Result<ExitStatus> {
        let launch_error = |e: std::io::Error| RecastError::StageExecution {
            stage,
            exit_code: None,
            message: format!("failed waiting for container: {e}"),
        };
        loop {
            if let Some(status) = child.try_wait().map_err(launch_error)? {
                return Ok(status);
            }
            if cancel.is_cancelled() {
                self.terminate(child);
                return Err(RecastError::Cancelled);
            }
            std::thread::sleep(self.poll_interval);
        }
    }

    fn terminate(&self, child: &mut std::process::Child) {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let pid = child.id();
        tracing::warn!(pid, "terminating stage container");
        if let Ok(raw) = i32::try_from(pid) {
            if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
                tracing::debug!(pid, error = %e, "SIGTERM failed");
            }
        }
        let deadline = Instant::now() + self.grace_period;
        while Instant::now() < deadline {
            if matches!(child.try_wait(), Ok(Some(_))) {
                return;
            }
            std::thread::sleep(self.poll_interval);
        }
        if let Err(e) = child.kill() {
            tracing::warn!(pid, error = %e, "failed to kill stage container");
        }
        let _ = child.wait();
    }
}

impl StageRunner for ChrootRunner {
    fn run(&self, spec: &StageSpec, cancel: &CancelToken) -> Result<i32> {
        let stage = spec.stage;
        let rootfs = ActiveMount::activate(&spec.rootfs)?;
        let root = rootfs.path();
        let mut guard = MountGuard::default();
        for extra in &spec.mounts {
            guard.bind(root, extra)?;
        }

        let entry = root.join(spec.entry_point.trim_start_matches('/'));
        if entry.symlink_metadata().is_err() {
            return Err(RecastError::StageExecution {
                stage,
                exit_code: None,
                message: format!("entry point {} not found in image", spec.entry_point),
            });
        }

        tracing::info!(id = %spec.id, stage = stage.as_str(), command = %spec.command_line(), "starting stage container");
        let mut child = self
            .command(root, spec)
            .spawn()
            .map_err(|e| RecastError::StageExecution {
                stage,
                exit_code: None,
                message: format!("failed to launch container: {e}"),
            })?;
        let status = self.wait(&mut child, stage, cancel)?;
        drop(guard);

        match status.code() {
            Some(code) => {
                tracing::info!(id = %spec.id, stage = stage.as_str(), code, "stage container exited");
                Ok(code)
            }
            None => Err(RecastError::StageExecution {
                stage,
                exit_code: None,
                message: format!(
                    "container killed by signal {}",
                    status.signal().unwrap_or_default()
                ),
            }),
        }
    }
}

/// Extra mounts bound under a container root, detached in reverse on drop.
/// Mount points created for the occasion are removed again so they do not
/// leak into the snapshot.
#[derive(Debug, Default)]
struct MountGuard {
    mounted: Vec<PathBuf>,
    created: Vec<PathBuf>,
}

impl MountGuard {
    fn bind(&mut self, root: &Path, spec: &MountSpec) -> Result<()> {
        let target = root.join(spec.destination.trim_start_matches('/'));
        let missing: Vec<PathBuf> = target
            .ancestors()
            .take_while(|dir| *dir != root && dir.symlink_metadata().is_err())
            .map(Path::to_path_buf)
            .collect();
        std::fs::create_dir_all(&target).map_err(|e| RecastError::io(&target, e))?;
        self.created.extend(missing.into_iter().rev());
        mount::bind_mount(&spec.source, &target, spec.readonly)?;
        tracing::debug!(source = %spec.source.display(), target = %target.display(), readonly = spec.readonly, "bound stage mount");
        self.mounted.push(target);
        Ok(())
    }
}

impl Drop for MountGuard {
    fn drop(&mut self) {
        for target in self.mounted.drain(..).rev() {
            if let Err(e) = mount::unmount(&target) {
                tracing::warn!(target = %target.display(), error = %e, "failed to unmount stage mount");
            }
        }
        for dir in self.created.drain(..).rev() {
            let _ = std::fs::remove_dir(&dir);
        }
    }
}

#[cfg(test)]
mod tests {
    use recast_common::types::ContainerId;

    use super::*;

    fn runner() -> ChrootRunner {
        ChrootRunner {
            unshare: PathBuf::from("/usr/bin/unshare"),
            chroot: PathBuf::from("/usr/sbin/chroot"),
            grace_period: Duration::from_millis(10),
            poll_interval: Duration::from_millis(1),
        }
    }

    fn spec(host_network: bool) -> StageSpec {
        StageSpec {
            id: ContainerId::generate(),
            stage: Stage::Build,
            rootfs: Vec::new(),
            mounts: Vec::new(),
            entry_point: "/recast-build".to_owned(),
            args: vec!["app".to_owned()],
            env: vec!["PATH=/usr/bin:/bin".to_owned(), "MODE=release".to_owned()],
            host_network,
        }
    }

    #[test]
    fn command_chroots_into_root_with_namespaces() {
        let command = runner().command(Path::new("/snap/root"), &spec(true));
        assert_eq!(command.get_program(), "/usr/bin/unshare");
        let args: Vec<_> = command.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            [
                "--pid",
                "--fork",
                "--mount",
                "--ipc",
                "--uts",
                "--kill-child",
                "/usr/sbin/chroot",
                "/snap/root",
                "/usr/bin/env",
                "bash",
                "-c",
                "/recast-build app",
            ]
        );
        let envs: Vec<_> = command
            .get_envs()
            .filter_map(|(k, v)| Some((k.to_str()?.to_owned(), v?.to_str()?.to_owned())))
            .collect();
        assert!(envs.contains(&("MODE".to_owned(), "release".to_owned())));
        assert!(envs.contains(&("PATH".to_owned(), "/usr/bin:/bin".to_owned())));
    }

    #[test]
    fn isolated_network_adds_net_namespace() {
        let command = runner().command(Path::new("/r"), &spec(false));
        assert!(command.get_args().any(|a| a == "--net"));
    }

    #[test]
    fn cancellation_kills_running_process() {
        let mut child = Command::new("sleep").arg("30").spawn().expect("spawn sleep");
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = runner().wait(&mut child, Stage::Build, &cancel).unwrap_err();
        assert!(matches!(err, RecastError::Cancelled));
        assert!(child.try_wait().expect("try_wait").is_some());
    }

    #[test]
    fn wait_reports_exit_status() {
        let mut child = Command::new("sh").args(["-c", "exit 3"]).spawn().expect("spawn sh");
        let status = runner()
            .wait(&mut child, Stage::Prepare, &CancelToken::new())
            .expect("wait");
        assert_eq!(status.code(), Some(3));
    }
}
