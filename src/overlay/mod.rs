//! Overlay bring-up. Runs entirely inside the child, after namespace
//! creation, before `exec`: mount-private, lay down the overlay (kernel
//! or FUSE), build a minimal `/dev`, transition root, and remount
//! `/proc`/`/tmp`.

pub mod dev;

use std::path::{Path, PathBuf};

use nix::mount::MsFlags;

use crate::config::Config;
use crate::error::{PoofError, Result};
use crate::fuse;
use crate::planner::OverlayPlan;
use crate::sys;

/// Negotiated backend, decided once in the child from whether the
/// user-namespace fallback was taken, then dispatched on exactly once
/// here — no conditionals sprinkled through the bring-up steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Kernel,
    Fuse,
}

/// Brings the overlay all the way up. On success the calling process
/// has pivoted/chrooted into `plan.merged` and is ready to
/// `execvpe` the target command. Returns the FUSE helper's pid when the
/// FUSE backend was used, so the child can report it back to the
/// supervisor through the already-open error/status pipe before exec
/// replaces the process image.
pub fn bring_up(config: &Config, plan: &OverlayPlan, backend: Backend) -> Result<Option<nix::unistd::Pid>> {
    let host_is_overlay = sys::host_root_is_overlay();
    if host_is_overlay && matches!(config.mode, crate::config::Mode::Persistent) {
        return Err(PoofError::InvalidMode(
            "cannot use PERSISTENT mode while the host root is itself an overlayfs".into(),
        ));
    }

    if plan.is_tmpfs_base {
        let base = plan
            .temp_base
            .as_ref()
            .expect("tmpfs-base plan always carries a temp_base");
        sys::mount(None, base, Some("tmpfs"), MsFlags::empty(), None)?;
        // Recreate the three directories: the tmpfs mount we just laid
        // down shadows whatever the planner created before the mount.
        for dir in [&plan.upper, &plan.work, &plan.merged] {
            std::fs::create_dir_all(dir)
                .map_err(|e| PoofError::MakeTempDir(format!("mkdir {}: {e}", dir.display())))?;
        }
    } else {
        for dir in [&plan.upper, &plan.work, &plan.merged] {
            std::fs::create_dir_all(dir)
                .map_err(|e| PoofError::MakeTempDir(format!("mkdir {}: {e}", dir.display())))?;
        }
    }

    sys::make_tree_private(Path::new("/"))?;

    let helper_pid = match backend {
        Backend::Kernel => {
            let data = format!(
                "lowerdir=/,upperdir={},workdir={}",
                plan.upper.display(),
                plan.work.display()
            );
            sys::mount_overlay(&plan.merged, &data, host_is_overlay)?;
            None
        }
        Backend::Fuse => Some(fuse::mount(&plan.upper, &plan.work, &plan.merged)?),
    };

    dev::build(&plan.merged)?;

    match backend {
        Backend::Kernel => root_transition_pivot(&plan.merged, &config.cwd)?,
        Backend::Fuse => {
            root_transition_chroot(&plan.merged, &config.cwd)?;
            dev::link_fd_aliases(Path::new("/"));
        }
    }

    remount_proc()?;
    remount_tmp()?;

    Ok(helper_pid)
}

fn root_transition_pivot(merged: &Path, cwd: &Path) -> Result<()> {
    let old_root = merged.join(".oldroot");
    std::fs::create_dir_all(&old_root)
        .map_err(|e| PoofError::PivotOrChrootFailed(format!("mkdir {}: {e}", old_root.display())))?;
    sys::do_pivot_root(merged, &old_root)?;
    sys::chdir_or_root(cwd);
    sys::umount_detach(Path::new("/.oldroot"))?;
    let _ = std::fs::remove_dir("/.oldroot");
    Ok(())
}

fn root_transition_chroot(merged: &Path, cwd: &Path) -> Result<()> {
    sys::do_chroot(merged)?;
    sys::chdir_or_root(cwd);
    Ok(())
}

fn remount_proc() -> Result<()> {
    sys::mount(
        Some(Path::new("proc")),
        Path::new("/proc"),
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None,
    )
}

fn remount_tmp() -> Result<()> {
    sys::mount(
        Some(Path::new("tmpfs")),
        Path::new("/tmp"),
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        None,
    )
}

/// Deletes `temp_base`/`work_dir`/`merged_dir` in that order, ignoring
/// `ENOENT`. Called by the supervisor, never by
/// the child — the child's mount namespace is torn down by the kernel
/// when it exits, but the host-visible directories these paths name
/// must still be reclaimed explicitly.
pub fn cleanup_dirs(paths: &[Option<PathBuf>]) {
    for path in paths.iter().flatten() {
        if let Err(e) = std::fs::remove_dir_all(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!("cleanup {}: {e}", path.display());
            }
        }
    }
}
