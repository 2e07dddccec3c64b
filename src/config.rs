//! Immutable run configuration plus the small layered defaults file that
//! seeds CLI flags from `~/.config/poof/poof.toml` — there is no
//! persistent daemon state, only a handful of numeric/string defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{PoofError, Result};

/// Sandbox mode, set once by the CLI layer and never mutated afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Ephemeral,
    Persistent,
    Interactive,
}

/// Immutable configuration produced by the CLI layer and consumed by the
/// supervisor. Nothing downstream of construction mutates it.
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub command: Vec<String>,
    pub upper_dir: Option<PathBuf>,
    pub memory_limit: Option<u64>,
    pub pids_limit: Option<u64>,
    pub timeout: Option<u64>,
    pub cwd: PathBuf,
    /// Set when the change reviewer should run on exit: the absolute
    /// path inside the sandbox whose shadow subtree gets reviewed. For
    /// `enter`/interactive `run` this is always `/`.
    pub interactive_target: Option<PathBuf>,
    pub verbose: bool,
}

/// Defaults loadable from `~/.config/poof/poof.toml`, merged under CLI
/// flags using `figment`'s layering on top of `toml`. Any field the CLI
/// doesn't explicitly set falls
/// back to this file, and any field this file doesn't set falls back to
/// the hardcoded default below.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DefaultsFile {
    pub memory: Option<String>,
    pub pids: Option<u64>,
    pub timeout: Option<u64>,
}

impl DefaultsFile {
    /// Loads `~/.config/poof/poof.toml` if present, else returns defaults.
    /// A missing or unreadable file is not an error — these are optional
    /// conveniences, not required configuration.
    pub fn load() -> Self {
        use figment::providers::{Format, Toml};
        use figment::Figment;

        let Some(path) = config_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }

        Figment::new()
            .merge(Toml::file(&path))
            .extract()
            .unwrap_or_else(|e| {
                tracing::warn!("ignoring malformed {}: {e}", path.display());
                Self::default()
            })
    }
}

fn config_path() -> Option<PathBuf> {
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
        .map(|p| p.join("poof/poof.toml"))
}

/// Parses a human size string (`512m`, `2G`, `1024`) into bytes.
/// Suffixes are case-insensitive; a bare number is bytes.
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(PoofError::InvalidOption("empty memory size".into()));
    }
    let (digits, mult) = match s.chars().last().unwrap() {
        'k' | 'K' => (&s[..s.len() - 1], 1024u64),
        'm' | 'M' => (&s[..s.len() - 1], 1024 * 1024),
        'g' | 'G' => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1),
    };
    let n: u64 = digits
        .trim()
        .parse()
        .map_err(|_| PoofError::InvalidOption(format!("invalid memory size: {s}")))?;
    n.checked_mul(mult)
        .ok_or_else(|| PoofError::InvalidOption(format!("memory size overflows: {s}")))
}

pub fn parse_count(s: &str) -> Result<u64> {
    s.trim()
        .parse()
        .map_err(|_| PoofError::InvalidOption(format!("invalid count: {s}")))
}

pub fn parse_timeout(s: &str) -> Result<u64> {
    s.trim()
        .parse()
        .map_err(|_| PoofError::InvalidOption(format!("invalid timeout: {s}")))
}

/// Derives the auto-generated persistent upper directory name for a
/// program invoked without `--upper`: `<cwd>/<basename(program)>`, with a
/// `.<YYYYMMDDhhmmss>` suffix appended only if that bare path already
/// exists.
pub fn auto_persistent_dir(cwd: &Path, program: &str) -> PathBuf {
    let base_name = Path::new(program)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.to_string());
    let base = cwd.join(&base_name);
    if !base.exists() {
        return base;
    }
    let stamp = chrono::Local::now().format("%Y%m%d%H%M%S");
    cwd.join(format!("{base_name}.{stamp}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_size_suffixes() {
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("1k").unwrap(), 1024);
        assert_eq!(parse_size("2M").unwrap(), 2 * 1024 * 1024);
        assert_eq!(parse_size("1G").unwrap(), 1024 * 1024 * 1024);
        assert!(parse_size("abc").is_err());
        assert!(parse_size("").is_err());
    }

    #[test]
    fn parse_count_rejects_garbage() {
        assert_eq!(parse_count("42").unwrap(), 42);
        assert!(parse_count("abc").is_err());
    }

    #[test]
    fn auto_persistent_dir_no_collision() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = auto_persistent_dir(tmp.path(), "/usr/bin/make");
        assert_eq!(dir, tmp.path().join("make"));
    }

    #[test]
    fn auto_persistent_dir_appends_timestamp_on_collision() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("make")).unwrap();
        let dir = auto_persistent_dir(tmp.path(), "make");
        assert_ne!(dir, tmp.path().join("make"));
        assert!(dir
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("make."));
    }
}
