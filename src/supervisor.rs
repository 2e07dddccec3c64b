//! Supervisor. Runs in the original process for the whole lifetime of a
//! `poof` invocation: forks the child, forwards signals, enforces the
//! timeout, translates the wait status into an exit code, reclaims the
//! terminal for the review prompt, and drives cleanup on every exit
//! path.

use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{kill, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::cgroup::Cgroup;
use crate::config::Config;
use crate::error::Result;
use crate::overlay;
use crate::planner::{self, OverlayPlan};
use crate::review;

/// Forwarded-signal mailbox. `-1` means "nothing pending". Written only
/// from the (async-signal-safe) handler, read/reset from the main wait
/// loop after an `EINTR`.
static PENDING_SIGNAL: AtomicI32 = AtomicI32::new(-1);
/// The intermediate child's pid, set once right after `fork()` returns
/// in the parent — before that point a signal simply has nothing to
/// forward to and is dropped, an acceptable narrow race given the
/// window is a handful of instructions.
static CHILD_PID: AtomicI32 = AtomicI32::new(0);

extern "C" fn forward_handler(signum: i32) {
    PENDING_SIGNAL.store(signum, Ordering::SeqCst);
}

/// Process-wide cleanup state, owned by the supervisor. The signal
/// handler itself only touches the two statics above; this struct is
/// read by the (synchronous, non-reentrant) cleanup pass that runs
/// after the wait loop returns.
struct CleanupSlots {
    temp_base: Option<PathBuf>,
    work_dir: Option<PathBuf>,
    merged_dir: Option<PathBuf>,
    cgroup: Option<Cgroup>,
    fuse_helper_pid: Option<Pid>,
}

impl CleanupSlots {
    /// Post-wait order per spec §4.5: cgroup teardown runs strictly
    /// before the change reviewer (C8), since the reviewer shells out to
    /// `git diff`/`cp` from the supervisor and those subprocesses must
    /// not inherit a `--memory`/`--pids` limit meant to constrain the
    /// sandboxed command.
    fn teardown_cgroup(&mut self) {
        if let Some(cgroup) = self.cgroup.take() {
            cgroup.teardown();
        }
    }

    /// Runs after the (optional) change review, which may have nulled
    /// `temp_base`/`work_dir`/`merged_dir` to preserve the upper tree.
    fn cleanup_dirs_and_fuse(&mut self) {
        if let Some(pid) = self.fuse_helper_pid.take() {
            crate::fuse::teardown(pid);
        }
        overlay::cleanup_dirs(&[
            self.temp_base.take(),
            self.work_dir.take(),
            self.merged_dir.take(),
        ]);
    }
}

/// Runs one full sandbox invocation and returns the process exit code.
/// This is the only entry point `main` needs.
pub fn run(config: &Config) -> Result<i32> {
    let cgroup = crate::cgroup::setup(config)?;
    let plan = planner::plan(config)?;

    let mut slots = CleanupSlots {
        temp_base: plan.temp_base.clone(),
        work_dir: Some(plan.work.clone()),
        merged_dir: Some(plan.merged.clone()),
        cgroup,
        fuse_helper_pid: None,
    };

    install_signal_handlers();

    let (err_read, err_write) = nix::unistd::pipe().map_err(|e| {
        crate::error::PoofError::SandboxError(format!("pipe: {e}"))
    })?;

    let result = match unsafe { nix::unistd::fork() } {
        Ok(nix::unistd::ForkResult::Child) => {
            drop(err_read);
            crate::child::run(config, &plan, err_write.as_raw_fd());
        }
        Ok(nix::unistd::ForkResult::Parent { child }) => {
            drop(err_write);
            CHILD_PID.store(child.as_raw(), Ordering::SeqCst);
            supervise(config, &plan, child, err_read, &mut slots)
        }
        Err(e) => {
            drop(err_read);
            drop(err_write);
            Err(crate::error::PoofError::SandboxError(format!("fork: {e}")))
        }
    };

    slots.teardown_cgroup();
    slots.cleanup_dirs_and_fuse();
    result
}

fn install_signal_handlers() {
    let action = SigAction::new(
        SigHandler::Handler(forward_handler),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for sig in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP] {
        // Safety: `forward_handler` only performs an atomic store, which
        // is async-signal-safe.
        unsafe {
            let _ = sigaction(sig, &action);
        }
    }
}

/// Drains the error/status pipe the child reports through. A `FUSE:pid`
/// line is informational (recorded into `slots`); any other non-empty
/// content is a fatal setup error reported by the child before exec.
fn drain_err_pipe(err_read: OwnedFd, slots: &mut CleanupSlots) -> Option<String> {
    use std::io::Read;
    let mut reader: std::fs::File = err_read.into();
    let mut buf = String::new();
    let _ = reader.read_to_string(&mut buf);

    let mut error_lines = Vec::new();
    for line in buf.lines() {
        if let Some(pid_str) = line.strip_prefix("FUSE:") {
            if let Ok(raw) = pid_str.trim().parse::<i32>() {
                slots.fuse_helper_pid = Some(Pid::from_raw(raw));
            }
        } else if !line.trim().is_empty() {
            error_lines.push(line.to_string());
        }
    }

    if error_lines.is_empty() {
        None
    } else {
        Some(error_lines.join("; "))
    }
}

fn supervise(
    config: &Config,
    plan: &OverlayPlan,
    child: Pid,
    err_read: OwnedFd,
    slots: &mut CleanupSlots,
) -> Result<i32> {
    let outcome = match config.timeout {
        None => wait_blocking(child),
        Some(secs) => wait_with_timeout(child, secs),
    };

    let setup_error = drain_err_pipe(err_read, slots);

    let code = match outcome {
        WaitOutcome::Exited(code) => code,
        WaitOutcome::TimedOut => 124,
        WaitOutcome::Error => 1,
    };

    if let Some(msg) = setup_error {
        if code != 0 {
            tracing::error!("sandbox setup failed: {msg}");
        }
    }

    // Cgroup teardown runs strictly before the reviewer: its `git
    // diff`/`cp` subprocesses are children of the supervisor and must
    // not inherit a `--memory`/`--pids` limit meant for the sandboxed
    // command.
    slots.teardown_cgroup();

    if let Some(target) = &config.interactive_target {
        reclaim_terminal();
        match review::run(&plan.upper, target) {
            Ok(review::Decision::Keep) => {
                // Null out cleanup slots so the upper survives.
                slots.temp_base = None;
                slots.work_dir = None;
                slots.merged_dir = None;
                println!(
                    "changes discarded; upper preserved at {}",
                    plan.upper.display()
                );
            }
            Ok(review::Decision::Applied) | Ok(review::Decision::Skip) => {}
            Err(e) => tracing::warn!("change review failed: {e}"),
        }
    }

    Ok(code)
}

enum WaitOutcome {
    Exited(i32),
    TimedOut,
    Error,
}

fn translate_status(status: WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(_, code) => Some((code) & 0xff),
        WaitStatus::Signaled(_, sig, _) => Some(128 + sig as i32),
        _ => None,
    }
}

fn wait_blocking(child: Pid) -> WaitOutcome {
    loop {
        match waitpid(child, None) {
            Ok(status) => {
                if let Some(code) = translate_status(status) {
                    return WaitOutcome::Exited(code);
                }
            }
            Err(Errno::EINTR) => {
                handle_pending_signal(child);
            }
            Err(_) => return WaitOutcome::Error,
        }
    }
}

fn wait_with_timeout(child: Pid, timeout_secs: u64) -> WaitOutcome {
    let deadline = Instant::now() + Duration::from_secs(timeout_secs);
    loop {
        match waitpid(child, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {}
            Ok(status) => {
                if let Some(code) = translate_status(status) {
                    return WaitOutcome::Exited(code);
                }
            }
            Err(Errno::EINTR) => {
                handle_pending_signal(child);
            }
            Err(_) => return WaitOutcome::Error,
        }

        if Instant::now() >= deadline {
            let _ = kill(child, Signal::SIGKILL);
            let _ = waitpid(child, None);
            return WaitOutcome::TimedOut;
        }

        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Forwards a pending signal to the child, if one was recorded by the
/// handler since the last check. Re-raising against ourselves with the
/// default disposition (the shell-convention 128+signal exit) happens
/// once the child has actually exited, which the caller's wait loop
/// naturally falls through to.
fn handle_pending_signal(child: Pid) {
    let sig = PENDING_SIGNAL.swap(-1, Ordering::SeqCst);
    if sig <= 0 {
        return;
    }
    if let Ok(signal) = Signal::try_from(sig) {
        let _ = kill(child, signal);
    }
}

/// Reclaims the controlling terminal before the review prompt reads
/// stdin: the sandboxed shell ran as foreground of its own process
/// group, so without this `tcsetpgrp` the supervisor's own reads would
/// raise `SIGTTIN`.
fn reclaim_terminal() {
    use nix::sys::signal::{SigmaskHow, SigSet};
    use nix::unistd::{getpgrp, tcsetpgrp};

    let stdin_fd = std::io::stdin().as_raw_fd();
    let mut block = SigSet::empty();
    block.add(Signal::SIGTTOU);
    block.add(Signal::SIGTTIN);
    let mut old = SigSet::empty();
    if nix::sys::signal::sigprocmask(SigmaskHow::SIG_BLOCK, Some(&block), Some(&mut old)).is_err() {
        return;
    }

    let pgrp = getpgrp();
    let fd = unsafe { std::os::fd::BorrowedFd::borrow_raw(stdin_fd) };
    let _ = tcsetpgrp(fd, pgrp);

    let _ = nix::sys::signal::sigprocmask(SigmaskHow::SIG_SETMASK, Some(&old), None);
}
