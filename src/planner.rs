//! Temp/path planner.
//!
//! Computes the three absolute paths every mode needs before fork, so
//! the supervisor can record them in `CleanupSlots` strictly-before the
//! child exists — the child never owns the only copy of where its own
//! upper/work/merged directories live.

use std::path::{Path, PathBuf};

use rand::RngCore;

use crate::config::{Config, Mode};
use crate::error::{PoofError, Result};

/// Three absolute paths plus the tmpfs-base flag. `work` and `upper` are
/// guaranteed to share a filesystem — for EPHEMERAL/INTERACTIVE that's
/// enforced by both living under the same newly-created temp base; for
/// PERSISTENT by deriving `.work` as a sibling of the user-supplied
/// `upper`.
#[derive(Debug, Clone)]
pub struct OverlayPlan {
    pub upper: PathBuf,
    pub work: PathBuf,
    pub merged: PathBuf,
    pub is_tmpfs_base: bool,
    /// Present only for EPHEMERAL/INTERACTIVE: the tmpfs mount point
    /// that `upper`/`work`/`merged` live under, and that gets torn down
    /// as a unit on cleanup.
    pub temp_base: Option<PathBuf>,
}

fn random_suffix() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Builds the plan and creates every directory it names, tolerating
/// pre-existing empty ones. For EPHEMERAL/INTERACTIVE this also
/// allocates `/tmp/poof-<hex>`; the tmpfs mount itself happens
/// later, inside the child (EPHEMERAL only — INTERACTIVE keeps its
/// upper on the plain tmp filesystem so it survives the child's
/// namespace teardown for later review).
pub fn plan(config: &Config) -> Result<OverlayPlan> {
    match config.mode {
        Mode::Ephemeral => {
            let base = std::env::temp_dir().join(format!("poof-{}", random_suffix()));
            create_dirs(&base)?;
            Ok(OverlayPlan {
                upper: base.join("upper"),
                work: base.join("work"),
                merged: base.join("merged"),
                is_tmpfs_base: true,
                temp_base: Some(base),
            })
        }
        Mode::Interactive => {
            let base = std::env::temp_dir().join(format!("poof-{}", random_suffix()));
            create_dirs(&base)?;
            Ok(OverlayPlan {
                upper: base.join("upper"),
                work: base.join("work"),
                merged: base.join("merged"),
                is_tmpfs_base: false,
                temp_base: Some(base),
            })
        }
        Mode::Persistent => {
            let upper = config.upper_dir.clone().ok_or_else(|| {
                PoofError::InvalidOption("PERSISTENT mode requires an upper directory".into())
            })?;
            let work = sibling(&upper, "work");
            let merged = sibling(&upper, "merged");
            std::fs::create_dir_all(&upper).map_err(|e| {
                PoofError::MakeTempDir(format!("mkdir {}: {e}", upper.display()))
            })?;
            std::fs::create_dir_all(&work).map_err(|e| {
                PoofError::MakeTempDir(format!("mkdir {}: {e}", work.display()))
            })?;
            std::fs::create_dir_all(&merged).map_err(|e| {
                PoofError::MakeTempDir(format!("mkdir {}: {e}", merged.display()))
            })?;
            Ok(OverlayPlan {
                upper,
                work,
                merged,
                is_tmpfs_base: false,
                temp_base: None,
            })
        }
    }
}

fn create_dirs(base: &Path) -> Result<()> {
    for name in ["upper", "work", "merged"] {
        std::fs::create_dir_all(base.join(name))
            .map_err(|e| PoofError::MakeTempDir(format!("mkdir {}: {e}", base.join(name).display())))?;
    }
    Ok(())
}

/// `<upper>.work`/`<upper>.merged` — siblings of `upper`, not children,
/// so they don't show up inside the reviewed tree.
fn sibling(upper: &Path, suffix: &str) -> PathBuf {
    let file_name = upper
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let sibling_name = format!("{file_name}.{suffix}");
    match upper.parent() {
        Some(parent) => parent.join(sibling_name),
        None => PathBuf::from(sibling_name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn sibling_derives_dot_suffixed_name() {
        let upper = PathBuf::from("/home/u/myproj");
        assert_eq!(sibling(&upper, "work"), PathBuf::from("/home/u/myproj.work"));
        assert_eq!(
            sibling(&upper, "merged"),
            PathBuf::from("/home/u/myproj.merged")
        );
    }

    #[test]
    fn persistent_plan_creates_three_sibling_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let upper = tmp.path().join("U");
        let config = Config {
            mode: Mode::Persistent,
            command: vec!["true".into()],
            upper_dir: Some(upper.clone()),
            memory_limit: None,
            pids_limit: None,
            timeout: None,
            cwd: tmp.path().to_path_buf(),
            interactive_target: None,
            verbose: false,
        };
        let p = plan(&config).unwrap();
        assert!(p.upper.is_dir());
        assert!(p.work.is_dir());
        assert!(p.merged.is_dir());
        assert!(!p.is_tmpfs_base);
        assert!(p.temp_base.is_none());
        assert_eq!(p.work, tmp.path().join("U.work"));
    }

    #[test]
    fn ephemeral_plan_allocates_temp_base() {
        let config = Config {
            mode: Mode::Ephemeral,
            command: vec!["true".into()],
            upper_dir: None,
            memory_limit: None,
            pids_limit: None,
            timeout: None,
            cwd: PathBuf::from("/"),
            interactive_target: None,
            verbose: false,
        };
        let p = plan(&config).unwrap();
        assert!(p.is_tmpfs_base);
        assert!(p.temp_base.is_some());
        assert!(p.upper.starts_with(p.temp_base.as_ref().unwrap()));
        std::fs::remove_dir_all(p.temp_base.unwrap()).ok();
    }
}
