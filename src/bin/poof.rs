use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use poof::config::{self, Config, Mode};
use poof::error::PoofError;

const KNOWN_SHELLS: &[&str] = &["bash", "zsh", "fish", "sh"];
const KNOWN_SUBCOMMANDS: &[&str] = &["exec", "run", "enter"];

#[derive(Parser)]
#[command(
    name = "poof",
    about = "ephemeral filesystem isolation for Linux commands",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Raise logging verbosity to debug.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command against a discarded, tmpfs-backed overlay (EPHEMERAL).
    Exec {
        #[arg(long)]
        timeout: Option<String>,
        #[arg(long)]
        memory: Option<String>,
        #[arg(long)]
        pids: Option<String>,
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
    /// Run a command against a persisted overlay directory (PERSISTENT),
    /// or INTERACTIVE when stdin is a tty and `--upper` is absent.
    Run {
        #[arg(long)]
        upper: Option<PathBuf>,
        #[arg(long)]
        timeout: Option<String>,
        #[arg(long)]
        memory: Option<String>,
        #[arg(long)]
        pids: Option<String>,
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
    /// Enter an interactive shell (INTERACTIVE), reviewing changes on exit.
    Enter {
        #[arg(long)]
        timeout: Option<String>,
        #[arg(long)]
        memory: Option<String>,
        #[arg(long)]
        pids: Option<String>,
        /// Accepted but unused: lets the shell-name sniffing convenience
        /// fall back to `enter` without clap rejecting stray tokens.
        #[arg(trailing_var_arg = true, hide = true)]
        _ignored: Vec<String>,
    },
}

/// Inserts the implicit subcommand a bare invocation implies, so that
/// `poof bash` behaves like `poof exec bash` and `poof` (or any
/// other bare invocation) behaves like `poof enter`. Leaves the argument
/// vector untouched when the caller already named a real subcommand.
/// `--` always terminates this scan without being treated as a flag: the
/// subcommand belongs before it, never inferred from whatever follows it.
fn normalize_args(mut args: Vec<String>) -> Vec<String> {
    // args[0] is the program name; find the first token that isn't a
    // recognized global flag, stopping at (and not past) a bare `--`.
    let mut scan_idx = None;
    for (i, a) in args.iter().enumerate().skip(1) {
        if a == "--" || !a.starts_with('-') {
            scan_idx = Some(i);
            break;
        }
    }

    let Some(idx) = scan_idx else {
        // No program/subcommand token at all: bare `poof` enters.
        args.push("enter".to_string());
        return args;
    };

    if args[idx] == "--" {
        // `--` reached before any subcommand-like token: the grammar has
        // no command to read a shell name from, so fall back to `enter`
        // inserted ahead of the marker, not after it.
        args.insert(idx, "enter".to_string());
        return args;
    }

    if KNOWN_SUBCOMMANDS.contains(&args[idx].as_str()) {
        return args;
    }

    if KNOWN_SHELLS.contains(&args[idx].as_str()) {
        args.insert(idx, "exec".to_string());
    } else {
        args.insert(idx, "enter".to_string());
    }
    args
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::EnvFilter;
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn shell_command() -> Result<Vec<String>, PoofError> {
    let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
    let path = PathBuf::from(&shell);
    if path.is_file() && is_executable(&path) {
        Ok(vec![shell])
    } else {
        if std::env::var("SHELL").is_ok() {
            tracing::warn!("$SHELL={shell} is not executable inside the sandbox, falling back to /bin/sh");
        }
        Ok(vec!["/bin/sh".to_string()])
    }
}

#[cfg(unix)]
fn is_executable(path: &std::path::Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

fn build_config(cli: Cli) -> Result<Config, PoofError> {
    let defaults = config::DefaultsFile::load();
    let cwd = std::env::current_dir().map_err(PoofError::IoError)?;

    let (mode, command, upper_dir, timeout, memory, pids) = match cli.command {
        Commands::Exec {
            timeout,
            memory,
            pids,
            command,
        } => (Mode::Ephemeral, command, None, timeout, memory, pids),
        Commands::Run {
            upper,
            timeout,
            memory,
            pids,
            command,
        } => {
            let is_tty = atty_stdin();
            let mode = if upper.is_none() && is_tty {
                Mode::Interactive
            } else {
                Mode::Persistent
            };
            (mode, command, upper, timeout, memory, pids)
        }
        Commands::Enter {
            timeout,
            memory,
            pids,
            _ignored: _,
        } => (Mode::Interactive, shell_command()?, None, timeout, memory, pids),
    };

    let memory_limit = match memory.or(defaults.memory.clone()) {
        Some(s) => Some(config::parse_size(&s)?),
        None => None,
    };
    let pids_limit = match pids {
        Some(s) => Some(config::parse_count(&s)?),
        None => defaults.pids,
    };
    let timeout_secs = match timeout {
        Some(s) => Some(config::parse_timeout(&s)?),
        None => defaults.timeout,
    };

    let upper_dir = match mode {
        Mode::Persistent => Some(upper_dir.unwrap_or_else(|| {
            config::auto_persistent_dir(&cwd, &command[0])
        })),
        _ => upper_dir,
    };

    let interactive_target = match mode {
        Mode::Interactive => Some(PathBuf::from("/")),
        _ => None,
    };

    Ok(Config {
        mode,
        command,
        upper_dir,
        memory_limit,
        pids_limit,
        timeout: timeout_secs,
        cwd,
        interactive_target,
        verbose: cli.verbose,
    })
}

fn atty_stdin() -> bool {
    unsafe { libc::isatty(libc::STDIN_FILENO) != 0 }
}

fn main() {
    let raw_args: Vec<String> = std::env::args().collect();
    let normalized = normalize_args(raw_args);
    let cli = Cli::parse_from(normalized);

    init_logging(cli.verbose);

    match try_main(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("poof: {e:#}");
            std::process::exit(exit_code_for(&e));
        }
    }
}

/// Everything past argument parsing, as one `anyhow`-flavored chain:
/// `PoofError` converts into `anyhow::Error` for free (thiserror gives it
/// a `std::error::Error` impl), and `exit_code_for` below walks the chain
/// back to find it when a specific exit code other than the generic `1`
/// is called for.
fn try_main(cli: Cli) -> anyhow::Result<i32> {
    let config = build_config(cli).context("failed to build sandbox configuration")?;
    let code = poof::supervisor::run(&config).context("sandbox run failed")?;
    Ok(code)
}

/// `PoofError::Timeout`/`ExecFailed`/`FuseOverlayfsNotFound` carry their
/// own documented exit code (124/127); everything else, including plain
/// `anyhow` context with no `PoofError` underneath, falls back to `1`.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<PoofError>())
        .map(PoofError::exit_code)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_leaves_explicit_subcommand() {
        let args = vec!["poof".into(), "exec".into(), "ls".into()];
        assert_eq!(normalize_args(args.clone()), args);
    }

    #[test]
    fn normalize_inserts_exec_for_shell_name() {
        let args = vec!["poof".into(), "bash".into()];
        assert_eq!(
            normalize_args(args),
            vec!["poof".to_string(), "exec".to_string(), "bash".to_string()]
        );
    }

    #[test]
    fn normalize_inserts_enter_for_unknown_program() {
        let args = vec!["poof".into(), "make".into()];
        assert_eq!(
            normalize_args(args),
            vec!["poof".to_string(), "enter".to_string(), "make".to_string()]
        );
    }

    #[test]
    fn normalize_handles_bare_invocation() {
        let args = vec!["poof".into()];
        assert_eq!(
            normalize_args(args),
            vec!["poof".to_string(), "enter".to_string()]
        );
    }

    #[test]
    fn normalize_skips_leading_global_flags() {
        let args = vec!["poof".into(), "-v".into(), "zsh".into()];
        assert_eq!(
            normalize_args(args),
            vec![
                "poof".to_string(),
                "-v".to_string(),
                "exec".to_string(),
                "zsh".to_string()
            ]
        );
    }

    #[test]
    fn normalize_stops_at_bare_separator() {
        let args = vec!["poof".into(), "--".into(), "ls".into(), "-la".into()];
        assert_eq!(
            normalize_args(args),
            vec![
                "poof".to_string(),
                "enter".to_string(),
                "--".to_string(),
                "ls".to_string(),
                "-la".to_string(),
            ]
        );
    }

    #[test]
    fn normalize_leaves_explicit_subcommand_with_separator() {
        let args = vec![
            "poof".into(),
            "exec".into(),
            "--".into(),
            "ls".into(),
            "--timeout".into(),
        ];
        assert_eq!(normalize_args(args.clone()), args);
    }
}
