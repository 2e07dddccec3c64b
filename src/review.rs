//! Change reviewer. Walks the overlay upper layer under an interactive
//! target, classifies each entry, renders a summary, and drives the
//! apply/discard/diff prompt.

use std::io::Write;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use owo_colors::OwoColorize;
use walkdir::WalkDir;

use crate::error::{PoofError, Result};

const MAX_CHANGES: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Edited,
    Deleted,
    AddedDir,
}

#[derive(Debug, Clone)]
pub struct Change {
    /// Path relative to the target, e.g. `foo/bar.txt`.
    pub path: PathBuf,
    pub kind: ChangeKind,
}

pub enum Decision {
    Applied,
    Keep,
    /// No changes were found to review: distinct from an explicit
    /// decline so the caller cleans up the (empty) upper/work/merged
    /// directories instead of preserving them as if something had been
    /// discarded.
    Skip,
}

/// Walks `<upper_dir><target>` and classifies every entry. Returns at
/// most `MAX_CHANGES` entries and reports whether the walk was
/// truncated, rather than blocking on an unbounded change set.
pub fn collect_changes(upper_dir: &Path, target: &Path) -> Result<(Vec<Change>, bool)> {
    let shadow_root = shadow_path(upper_dir, target);
    if !shadow_root.exists() {
        return Ok((Vec::new(), false));
    }

    let mut changes = Vec::new();
    let mut truncated = false;

    for entry in WalkDir::new(&shadow_root).min_depth(0).into_iter() {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::debug!("walk error: {e}");
                continue;
            }
        };
        if entry.path() == shadow_root {
            continue;
        }
        if changes.len() >= MAX_CHANGES {
            truncated = true;
            break;
        }

        let rel = entry
            .path()
            .strip_prefix(&shadow_root)
            .unwrap_or(entry.path())
            .to_path_buf();
        let file_type = entry.file_type();

        let kind = if file_type.is_dir() {
            let has_children = std::fs::read_dir(entry.path())
                .map(|mut it| it.next().is_some())
                .unwrap_or(true);
            if has_children {
                continue; // Recurse implicitly via WalkDir; non-leaf dirs aren't themselves a change.
            }
            ChangeKind::AddedDir
        } else if file_type.is_char_device() {
            ChangeKind::Deleted
        } else {
            let host_path = target.join(&rel);
            if host_path.exists() {
                ChangeKind::Edited
            } else {
                ChangeKind::Added
            }
        };

        changes.push(Change { path: rel, kind });
    }

    Ok((changes, truncated))
}

fn shadow_path(upper_dir: &Path, target: &Path) -> PathBuf {
    let rel = target.strip_prefix("/").unwrap_or(target);
    upper_dir.join(rel)
}

fn render_summary(changes: &[Change], truncated: bool) {
    for change in changes {
        let suffix = if change.kind == ChangeKind::AddedDir {
            "/"
        } else {
            ""
        };
        let line = format!("{}{suffix}", change.path.display());
        match change.kind {
            ChangeKind::Added | ChangeKind::AddedDir => println!("{} {line}", "+".green()),
            ChangeKind::Edited => println!("{} {line}", "~".yellow()),
            ChangeKind::Deleted => println!("{} {line}", "-".red()),
        }
    }
    if truncated {
        println!("(truncated at {MAX_CHANGES} entries)");
    }
    println!("(deletions are reported, not applied)");
}

/// Prompt state machine: `PROMPT -> {APPLY, DISCARD, DIFF}`, with `DIFF`
/// re-prompting with only `APPLY`/`DISCARD` afterwards. Invalid or empty
/// input means DISCARD.
pub fn run(upper_dir: &Path, target: &Path) -> Result<Decision> {
    let (changes, truncated) = collect_changes(upper_dir, target)?;
    if changes.is_empty() {
        return Ok(Decision::Skip);
    }

    render_summary(&changes, truncated);

    loop {
        print!("apply these changes? [y/N/d] ");
        std::io::stdout().flush().ok();
        let mut line = String::new();
        if std::io::stdin().read_line(&mut line).is_err() {
            return Ok(Decision::Keep);
        }
        match line.trim().to_lowercase().as_str() {
            "y" | "yes" => {
                apply(upper_dir, target)?;
                return Ok(Decision::Applied);
            }
            "d" | "diff" => {
                show_diff(upper_dir, target);
                print!("apply these changes? [y/N] ");
                std::io::stdout().flush().ok();
                let mut line2 = String::new();
                if std::io::stdin().read_line(&mut line2).is_err() {
                    return Ok(Decision::Keep);
                }
                return match line2.trim().to_lowercase().as_str() {
                    "y" | "yes" => {
                        apply(upper_dir, target)?;
                        Ok(Decision::Applied)
                    }
                    _ => Ok(Decision::Keep),
                };
            }
            _ => return Ok(Decision::Keep),
        }
    }
}

fn show_diff(upper_dir: &Path, target: &Path) {
    let shadow_root = shadow_path(upper_dir, target);
    let status = Command::new("git")
        .args(["--no-pager", "diff", "--no-index"])
        .arg(target)
        .arg(&shadow_root)
        .status();
    if let Err(e) = status {
        tracing::warn!("failed to invoke diff tool: {e}");
    }
}

/// Copies the shadow subtree over the target, overwriting existing
/// files. Whiteouts are not propagated as host deletions; applying a
/// change set never removes anything that already exists on the host.
fn apply(upper_dir: &Path, target: &Path) -> Result<()> {
    let shadow_root = shadow_path(upper_dir, target);
    let status = Command::new("cp")
        .args(["-r", "-T"])
        .arg(&shadow_root)
        .arg(target)
        .status()
        .map_err(|e| PoofError::SandboxError(format!("cp -r -T: {e}")))?;
    if !status.success() {
        return Err(PoofError::SandboxError(format!(
            "cp -r -T exited with {status}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_file(path: &Path, contents: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    #[test]
    fn classifies_added_and_edited() {
        let tmp = tempfile::tempdir().unwrap();
        let upper = tmp.path().join("upper");
        let target = tmp.path().join("target");
        std::fs::create_dir_all(&target).unwrap();

        write_file(&target.join("existing.txt"), "old");
        write_file(&upper.join("existing.txt"), "new");
        write_file(&upper.join("new.txt"), "brand new");

        let (mut changes, truncated) = collect_changes(&upper, &target).unwrap();
        changes.sort_by(|a, b| a.path.cmp(&b.path));
        assert!(!truncated);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].path, PathBuf::from("existing.txt"));
        assert_eq!(changes[0].kind, ChangeKind::Edited);
        assert_eq!(changes[1].path, PathBuf::from("new.txt"));
        assert_eq!(changes[1].kind, ChangeKind::Added);
    }

    #[test]
    fn empty_dir_is_added_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let upper = tmp.path().join("upper");
        let target = tmp.path().join("target");
        std::fs::create_dir_all(&target).unwrap();
        std::fs::create_dir_all(upper.join("D")).unwrap();

        let (changes, _) = collect_changes(&upper, &target).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path, PathBuf::from("D"));
        assert_eq!(changes[0].kind, ChangeKind::AddedDir);
    }

    #[test]
    fn no_shadow_root_means_no_changes() {
        let tmp = tempfile::tempdir().unwrap();
        let upper = tmp.path().join("upper");
        let target = tmp.path().join("target");
        std::fs::create_dir_all(&target).unwrap();
        let (changes, truncated) = collect_changes(&upper, &target).unwrap();
        assert!(changes.is_empty());
        assert!(!truncated);
    }

    #[test]
    fn shadow_path_joins_target_relative_to_root() {
        let upper = PathBuf::from("/tmp/poof-abc/upper");
        let target = PathBuf::from("/home/user/proj");
        assert_eq!(
            shadow_path(&upper, &target),
            PathBuf::from("/tmp/poof-abc/upper/home/user/proj")
        );
    }
}
