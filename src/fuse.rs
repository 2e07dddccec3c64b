//! FUSE overlay driver. Used when the caller lacks `CAP_SYS_ADMIN` and
//! had to fall back to a user namespace; the kernel overlay mount itself
//! would then also be denied, so unprivileged runs shell out to
//! `fuse-overlayfs` instead.

use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

use crate::error::{PoofError, Result};

const FUSE_OVERLAYFS_BIN: &str = "/usr/bin/fuse-overlayfs";

/// Launches `fuse-overlayfs -f` in the foreground (so the helper stays
/// alive for the sandbox's lifetime) and verifies the mount actually
/// came up. Returns the helper's pid, which the caller must retain for
/// cleanup — the mount is only valid while the helper process lives.
pub fn mount(upper: &Path, work: &Path, merged: &Path) -> Result<Pid> {
    let opts = format!(
        "lowerdir=/,upperdir={},workdir={},squash_to_root",
        upper.display(),
        work.display()
    );

    let mut child = Command::new(FUSE_OVERLAYFS_BIN)
        .arg("-f")
        .arg("-o")
        .arg(&opts)
        .arg(merged)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PoofError::FuseOverlayfsNotFound
            } else {
                PoofError::FuseOverlayfsFailed(e.to_string())
            }
        })?;

    let pid = Pid::from_raw(child.id() as i32);

    std::thread::sleep(Duration::from_millis(100));

    match nix::sys::wait::waitpid(pid, Some(nix::sys::wait::WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::Exited(_, 127)) => return Err(PoofError::FuseOverlayfsNotFound),
        Ok(WaitStatus::Exited(_, code)) => {
            return Err(PoofError::FuseOverlayfsFailed(format!(
                "exited immediately with status {code}"
            )))
        }
        Ok(WaitStatus::Signaled(_, sig, _)) => {
            return Err(PoofError::FuseOverlayfsFailed(format!(
                "killed by signal {sig}"
            )))
        }
        Ok(WaitStatus::StillAlive) => {}
        Ok(_) => {}
        Err(e) => return Err(PoofError::FuseOverlayfsFailed(format!("waitpid: {e}"))),
    }

    verify_mounted(merged)?;

    // We only needed `child` to read its pid and probe liveness; `Drop`
    // on `std::process::Child` doesn't reap, so leak the handle and let
    // the supervisor reap the pid explicitly on cleanup.
    std::mem::forget(child);

    Ok(pid)
}

/// An empty directory at `merged` after the helper reports itself alive
/// indicates the mount never actually materialized.
fn verify_mounted(merged: &Path) -> Result<()> {
    let mut entries = std::fs::read_dir(merged)
        .map_err(|e| PoofError::MountVerifyFailed(merged.to_path_buf()).context_io(e))?;
    if entries.next().is_none() {
        return Err(PoofError::MountVerifyFailed(merged.to_path_buf()));
    }
    Ok(())
}

impl PoofError {
    /// Logs the underlying io error and returns self; kept local to this
    /// module since it's only used to enrich the verify-failure path
    /// with a debug trace without changing the public error shape.
    fn context_io(self, e: std::io::Error) -> Self {
        tracing::debug!("read_dir failed while verifying fuse mount: {e}");
        self
    }
}

/// Kills and reaps the FUSE helper. Best-effort: the helper may already
/// have exited (e.g. the command under test unmounted it), in which
/// case `ESRCH`/`ECHILD` are swallowed.
pub fn teardown(pid: Pid) {
    let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM);
    let _ = nix::sys::wait::waitpid(pid, None);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_mounted_rejects_empty_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let err = verify_mounted(tmp.path()).unwrap_err();
        assert!(matches!(err, PoofError::MountVerifyFailed(_)));
    }

    #[test]
    fn verify_mounted_accepts_nonempty_dir() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("marker"), b"x").unwrap();
        assert!(verify_mounted(tmp.path()).is_ok());
    }
}
