//! Minimal `/dev` construction.
//!
//! Overlay can't synthesize character devices, so the handful the
//! sandboxed command actually needs are built by hand under `merged`
//! before the root transition. Deliberately excludes disk devices
//! (`sd*`, `nvme*`, `mem`, `kmem`, block devices): those must never be
//! statable inside the sandbox.

use std::path::Path;

use nix::mount::{mount, MsFlags};

use crate::error::{PoofError, Result};

const DEVICE_NODES: &[&str] = &["null", "zero", "full", "random", "urandom", "tty"];

/// Builds `<merged>/dev` with the standard pseudo-devices bind-mounted
/// from the host, a `devpts` instance, and `/dev/shm`. Individual
/// device/symlink failures are logged and ignored: the sandbox proceeds
/// with whatever it could create.
pub fn build(merged: &Path) -> Result<()> {
    let dev = merged.join("dev");
    std::fs::create_dir_all(&dev)
        .map_err(|e| PoofError::MountFailed(format!("mkdir {}: {e}", dev.display())))?;

    mount(
        Some("tmpfs"),
        &dev,
        Some("tmpfs"),
        MsFlags::MS_NOSUID,
        Some("mode=755,size=64k"),
    )
    .map_err(|e| PoofError::MountFailed(format!("mount tmpfs {}: {e}", dev.display())))?;

    let pts = dev.join("pts");
    let shm = dev.join("shm");
    if let Err(e) = std::fs::create_dir_all(&pts) {
        tracing::warn!("mkdir {}: {e}", pts.display());
    }
    if let Err(e) = std::fs::create_dir_all(&shm) {
        tracing::warn!("mkdir {}: {e}", shm.display());
    }

    for name in DEVICE_NODES {
        let host_dev = Path::new("/dev").join(name);
        if !host_dev.exists() {
            continue;
        }
        let target = dev.join(name);
        if let Err(e) = std::fs::write(&target, b"") {
            tracing::warn!("touch {}: {e}", target.display());
            continue;
        }
        if let Err(e) = mount(
            Some(&host_dev),
            &target,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        ) {
            tracing::warn!("bind mount {} -> {}: {e}", host_dev.display(), target.display());
        }
    }

    if let Err(e) = mount(
        Some("devpts"),
        &pts,
        Some("devpts"),
        MsFlags::empty(),
        Some("newinstance,ptmxmode=0666"),
    ) {
        tracing::warn!("mount devpts {}: {e}", pts.display());
    } else {
        let ptmx = dev.join("ptmx");
        if let Err(e) = std::os::unix::fs::symlink("pts/ptmx", &ptmx) {
            tracing::warn!("symlink {}: {e}", ptmx.display());
        }
    }

    Ok(())
}

/// FUSE-path-only extra symlinks: `chroot` leaves `/proc/self/fd` usable
/// but shells still expect `/dev/fd` and `/dev/std{in,out,err}` to exist
/// as the conventional aliases.
pub fn link_fd_aliases(merged: &Path) {
    let dev = merged.join("dev");
    let links: &[(&str, &str)] = &[
        ("fd", "/proc/self/fd"),
        ("stdin", "/proc/self/fd/0"),
        ("stdout", "/proc/self/fd/1"),
        ("stderr", "/proc/self/fd/2"),
    ];
    for (name, target) in links {
        let link = dev.join(name);
        if let Err(e) = std::os::unix::fs::symlink(target, &link) {
            tracing::warn!("symlink {}: {e}", link.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_node_list_excludes_disk_devices() {
        for forbidden in ["sda", "sda1", "nvme0n1", "mem", "kmem"] {
            assert!(!DEVICE_NODES.contains(&forbidden));
        }
    }
}
