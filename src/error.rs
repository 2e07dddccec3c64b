use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum PoofError {
    #[error("invalid option: {0}")]
    InvalidOption(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("failed to create temporary directory: {0}")]
    MakeTempDir(String),

    #[error("cgroups v2 unavailable (/sys/fs/cgroup/cgroup.controllers not found)")]
    CgroupsUnavailable,

    #[error("failed to set up cgroup: {0}")]
    SetupCgroup(String),

    #[error(
        "unshare() denied: {0}\nhint: retry with `docker run --security-opt seccomp=unconfined`, \
         or enable `sysctl kernel.unprivileged_userns_clone=1`"
    )]
    UnshareDenied(String),

    #[error("failed to write uid/gid map: {0}")]
    UidMap(String),

    #[error(
        "overlay mount denied (EPERM): unprivileged overlay mounts require fuse-overlayfs\n\
         hint: install the `fuse-overlayfs` package"
    )]
    OverlayMountDenied,

    #[error(
        "cannot nest poof inside a container whose own root is already an overlayfs \
         (2-level overlay stacking is unsupported): {0}"
    )]
    OverlayStackingLimit(String),

    #[error("fuse-overlayfs not found at /usr/bin/fuse-overlayfs\nhint: install the `fuse-overlayfs` package")]
    FuseOverlayfsNotFound,

    #[error("fuse-overlayfs exited immediately: {0}")]
    FuseOverlayfsFailed(String),

    #[error("fuse-overlayfs mount did not materialize at {0}")]
    MountVerifyFailed(PathBuf),

    #[error("mount failed: {0}")]
    MountFailed(String),

    #[error("pivot_root/chroot failed: {0}")]
    PivotOrChrootFailed(String),

    #[error("failed to exec {0}: {1}")]
    ExecFailed(String, String),

    #[error("timed out after {0}s")]
    Timeout(u64),

    #[error("invalid mode: {0}")]
    InvalidMode(String),

    #[error("sandbox setup failed: {0}")]
    SandboxError(String),
}

pub type Result<T> = std::result::Result<T, PoofError>;

impl PoofError {
    /// Maps an error to the process exit code a caller should see.
    /// Everything that isn't a timeout or an exec failure is a generic
    /// setup failure (`1`).
    pub fn exit_code(&self) -> i32 {
        match self {
            PoofError::Timeout(_) => 124,
            PoofError::ExecFailed(_, _) | PoofError::FuseOverlayfsNotFound => 127,
            _ => 1,
        }
    }
}
