//! Cgroup v2 resource limiting.
//!
//! Creates a single `/sys/fs/cgroup/poof-<hex>` directory per run and
//! writes the two controllers we actually enforce (`memory.max`,
//! `pids.max`). No rootless systemd-slice fallback: unprivileged
//! invocations run the whole sandbox through the user-namespace path
//! instead of leaning on cgroups for isolation.

use std::path::{Path, PathBuf};

use rand::RngCore;

use crate::config::Config;
use crate::error::{PoofError, Result};

const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Handle to a cgroup created for one sandbox run. Teardown is
/// idempotent and safe to call from a signal handler — it only performs
/// best-effort writes/removals and never panics.
#[derive(Debug, Clone)]
pub struct Cgroup {
    pub path: PathBuf,
    pub original_cgroup: PathBuf,
}

fn controllers_available() -> bool {
    Path::new(CGROUP_ROOT).join("cgroup.controllers").exists()
}

/// Parses the single `0::<path>` line `/proc/self/cgroup` always has
/// under a v2-only unified hierarchy.
fn current_cgroup_path(contents: &str) -> Option<PathBuf> {
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("0::") {
            let rel = rest.trim_start_matches('/');
            return Some(Path::new(CGROUP_ROOT).join(rel));
        }
    }
    None
}

fn random_suffix() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Returns `Ok(None)` when no limits were requested and v2 is
/// unavailable (not an error — cgroups are opportunistic unless
/// the caller asked for enforcement). Returns `Ok(Some(_))` whenever a
/// cgroup was actually created, even with zero limits requested, so the
/// supervisor always has a handle it can unconditionally tear down.
pub fn setup(config: &Config) -> Result<Option<Cgroup>> {
    let wants_limits = config.memory_limit.is_some() || config.pids_limit.is_some();

    if !controllers_available() {
        if wants_limits {
            return Err(PoofError::CgroupsUnavailable);
        }
        return Ok(None);
    }
    if !wants_limits {
        return Ok(None);
    }

    let self_cgroup = std::fs::read_to_string("/proc/self/cgroup")
        .map_err(|e| PoofError::SetupCgroup(format!("read /proc/self/cgroup: {e}")))?;
    let original_cgroup = current_cgroup_path(&self_cgroup)
        .ok_or_else(|| PoofError::SetupCgroup("no 0:: entry in /proc/self/cgroup".into()))?;

    let path = Path::new(CGROUP_ROOT).join(format!("poof-{}", random_suffix()));
    std::fs::create_dir(&path)
        .map_err(|e| PoofError::SetupCgroup(format!("mkdir {}: {e}", path.display())))?;

    if let Some(mem) = config.memory_limit {
        if let Err(e) = std::fs::write(path.join("memory.max"), mem.to_string()) {
            tracing::warn!("failed to write memory.max: {e}");
        }
    }
    if let Some(pids) = config.pids_limit {
        if let Err(e) = std::fs::write(path.join("pids.max"), pids.to_string()) {
            tracing::warn!("failed to write pids.max: {e}");
        }
    }

    let pid = std::process::id();
    std::fs::write(path.join("cgroup.procs"), pid.to_string())
        .map_err(|e| PoofError::SetupCgroup(format!("join cgroup.procs: {e}")))?;

    Ok(Some(Cgroup {
        path,
        original_cgroup,
    }))
}

impl Cgroup {
    /// Moves the supervisor back to its original cgroup, then removes
    /// the one we created. Both steps are best-effort: failures are
    /// logged, never propagated, since teardown runs from signal
    /// handlers and from every exit path.
    pub fn teardown(&self) {
        let pid = std::process::id().to_string();
        if let Err(e) = std::fs::write(self.original_cgroup.join("cgroup.procs"), &pid) {
            tracing::debug!(
                "failed to rejoin {}: {e}",
                self.original_cgroup.display()
            );
        }
        if let Err(e) = std::fs::remove_dir(&self.path) {
            tracing::debug!("failed to rmdir {}: {e}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unified_hierarchy_line() {
        let contents = "0::/user.slice/user-1000.slice/session-3.scope\n";
        assert_eq!(
            current_cgroup_path(contents),
            Some(PathBuf::from(
                "/sys/fs/cgroup/user.slice/user-1000.slice/session-3.scope"
            ))
        );
    }

    #[test]
    fn parses_root_cgroup() {
        let contents = "0::/\n";
        assert_eq!(
            current_cgroup_path(contents),
            Some(PathBuf::from("/sys/fs/cgroup"))
        );
    }

    #[test]
    fn missing_unified_line_returns_none() {
        assert_eq!(current_cgroup_path("1:cpu:/\n2:memory:/\n"), None);
    }

    #[test]
    fn random_suffix_is_16_hex_chars() {
        let s = random_suffix();
        assert_eq!(s.len(), 16);
        assert!(s.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
