//! Thin typed wrappers over the mount/namespace syscall surface.
//!
//! `nix` already gives us safe signatures for these calls; this module's
//! job is narrower: translate the handful of syscalls the bring-up
//! protocol touches into `PoofError` variants that carry enough context
//! for a useful remediation hint, instead of letting raw `Errno`s leak
//! into the orchestration code in `overlay`/`cgroup`. `do_unshare` is the
//! exception — its caller needs the raw `Errno` to decide whether to
//! retry, so it's returned as-is instead of being collapsed early.

use std::path::Path;

use nix::errno::Errno;
use nix::mount::{mount as nix_mount, umount2, MntFlags, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::unistd::{chdir, chroot as nix_chroot, pivot_root as nix_pivot_root};

use crate::error::{PoofError, Result};

/// `mount(2)`, mapping `EPERM`/`EINVAL` to the overlay-specific hints the
/// caller can refine further (stacking limit, unprivileged fallback).
pub fn mount(
    source: Option<&Path>,
    target: &Path,
    fstype: Option<&str>,
    flags: MsFlags,
    data: Option<&str>,
) -> Result<()> {
    nix_mount(source, target, fstype, flags, data).map_err(|e| {
        PoofError::MountFailed(format!(
            "mount({:?} -> {}, fstype={:?}): {e}",
            source,
            target.display(),
            fstype
        ))
    })
}

/// Mounts the overlay filesystem, translating the two overlay-specific
/// failure modes instead of the generic `MountFailed`.
pub fn mount_overlay(merged: &Path, data: &str, host_is_overlay: bool) -> Result<()> {
    match nix_mount(
        Some("overlay"),
        merged,
        Some("overlay"),
        MsFlags::empty(),
        Some(data),
    ) {
        Ok(()) => Ok(()),
        Err(Errno::EINVAL) if host_is_overlay => Err(PoofError::OverlayStackingLimit(
            "host root is already an overlayfs; stacking a second kernel overlay on top is unsupported".into(),
        )),
        Err(Errno::EPERM) => Err(PoofError::OverlayMountDenied),
        Err(e) => Err(PoofError::MountFailed(format!("mount overlay: {e}"))),
    }
}

pub fn umount_detach(target: &Path) -> Result<()> {
    match umount2(target, MntFlags::MNT_DETACH) {
        Ok(()) | Err(Errno::ENOENT) | Err(Errno::EINVAL) => Ok(()),
        Err(e) => Err(PoofError::MountFailed(format!(
            "umount2({}): {e}",
            target.display()
        ))),
    }
}

pub fn make_tree_private(root: &Path) -> Result<()> {
    nix_mount(
        None::<&str>,
        root,
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| PoofError::MountFailed(format!("mount MS_PRIVATE|MS_REC {}: {e}", root.display())))
}

/// `unshare(2)`, preserving the raw `Errno` so callers can branch on the
/// specific failure (the root-vs-EPERM retry in `child.rs` needs this;
/// collapsing to a string-only error, as the other wrappers here do,
/// would force that retry to trigger on any failure, not just `EPERM`).
pub fn do_unshare(flags: CloneFlags) -> std::result::Result<(), Errno> {
    unshare(flags)
}

pub fn do_pivot_root(new_root: &Path, put_old: &Path) -> Result<()> {
    nix_pivot_root(new_root, put_old)
        .map_err(|e| PoofError::PivotOrChrootFailed(format!("pivot_root: {e}")))
}

pub fn do_chroot(new_root: &Path) -> Result<()> {
    nix_chroot(new_root).map_err(|e| PoofError::PivotOrChrootFailed(format!("chroot: {e}")))
}

/// `chdir`, falling back to `/` if the requested working directory
/// doesn't exist inside the new root.
pub fn chdir_or_root(dir: &Path) {
    if chdir(dir).is_err() {
        let _ = chdir("/");
    }
}

pub fn prctl_die_with_parent() {
    unsafe {
        libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL);
    }
}

/// Scans `/proc/mounts` for a line whose mountpoint is `/` and fstype is
/// `overlay` — used to detect running inside an already-overlay host
/// root, which a kernel overlay mount can't stack on top of.
pub fn host_root_is_overlay() -> bool {
    std::fs::read_to_string("/proc/mounts")
        .map(|contents| root_is_overlay(&contents))
        .unwrap_or(false)
}

/// Pure parser for the `/proc/mounts` scan, split out so it can be unit
/// tested without a real procfs.
fn root_is_overlay(proc_mounts: &str) -> bool {
    proc_mounts.lines().any(|line| {
        let mut fields = line.split_whitespace();
        let _device = fields.next();
        let mountpoint = fields.next();
        let fstype = fields.next();
        mountpoint == Some("/") && fstype == Some("overlay")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_overlay_root() {
        let mounts = "overlay / overlay rw,relatime,lowerdir=/a,upperdir=/b,workdir=/c 0 0\n\
                      proc /proc proc rw,relatime 0 0\n";
        assert!(root_is_overlay(mounts));
    }

    #[test]
    fn ignores_non_root_overlay_mounts() {
        let mounts = "overlay /var/lib/docker/overlay2/abc/merged overlay rw 0 0\n\
                      ext4 / ext4 rw,relatime 0 0\n";
        assert!(!root_is_overlay(mounts));
    }

    #[test]
    fn host_root_is_overlay_does_not_panic() {
        let _ = host_root_is_overlay();
    }
}
