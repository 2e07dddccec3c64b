//! Child entry. Runs in the process the supervisor forked. Never
//! returns: every branch ends in `_exit`/`execvpe`. Negotiates
//! privileged (kernel overlay) versus unprivileged (user namespace +
//! FUSE) isolation before entering a second fork to become PID 1 of the
//! new PID namespace.

use std::ffi::CString;

use nix::errno::Errno;
use nix::sched::CloneFlags;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

use crate::config::Config;
use crate::overlay::{self, Backend};
use crate::planner::OverlayPlan;
use crate::sys;

const BASE_FLAGS: CloneFlags = CloneFlags::from_bits_truncate(
    CloneFlags::CLONE_NEWNS.bits()
        | CloneFlags::CLONE_NEWPID.bits()
        | CloneFlags::CLONE_NEWUTS.bits()
        | CloneFlags::CLONE_NEWIPC.bits(),
);

/// `err_fd` is the write end of the pipe the supervisor reads setup
/// errors from; it has to be used before `pivot_root` makes the
/// parent's file descriptors meaningless to report through.
pub fn run(config: &Config, plan: &OverlayPlan, err_fd: std::os::fd::RawFd) -> ! {
    sys::prctl_die_with_parent();

    let is_root = nix::unistd::getuid().is_root();
    let mut flags = BASE_FLAGS;
    if !is_root {
        flags |= CloneFlags::CLONE_NEWUSER;
    }

    let mut using_user_ns = !is_root;
    if let Err(e) = sys::do_unshare(flags) {
        if is_root && e == Errno::EPERM {
            // Container without CAP_SYS_ADMIN: retry with a user
            // namespace, same fallback an unprivileged caller takes.
            let retry_flags = flags | CloneFlags::CLONE_NEWUSER;
            if let Err(e2) = sys::do_unshare(retry_flags) {
                die(err_fd, format!("unshare (retry with NEWUSER): {e2}"));
            }
            using_user_ns = true;
        } else {
            die(err_fd, format!("unshare: {e}"));
        }
    }

    if using_user_ns {
        let uid = nix::unistd::getuid();
        let gid = nix::unistd::getgid();
        if let Err(e) = std::fs::write("/proc/self/setgroups", "deny") {
            die(err_fd, format!("write setgroups: {e}"));
        }
        if let Err(e) = std::fs::write("/proc/self/uid_map", format!("0 {uid} 1\n")) {
            die(err_fd, format!("write uid_map: {e}"));
        }
        if let Err(e) = std::fs::write("/proc/self/gid_map", format!("0 {gid} 1\n")) {
            die(err_fd, format!("write gid_map: {e}"));
        }
    }

    let backend = if using_user_ns {
        Backend::Fuse
    } else {
        Backend::Kernel
    };

    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            // Inner child: PID 1 of the new PID namespace.
            sys::prctl_die_with_parent();
            let fuse_pid = match overlay::bring_up(config, plan, backend) {
                Ok(fuse_pid) => fuse_pid,
                Err(e) => die(err_fd, e.to_string()),
            };

            // The FUSE helper's real (host-namespace) pid is only known
            // here; report it to the supervisor over the same pipe
            // errors travel on, using a distinguishable prefix so it
            // isn't mistaken for a fatal setup error.
            if let Some(pid) = fuse_pid {
                let line = format!("FUSE:{pid}\n");
                let _ = nix::unistd::write(
                    unsafe { std::os::fd::BorrowedFd::borrow_raw(err_fd) },
                    line.as_bytes(),
                );
            }

            std::env::set_var("IS_SANDBOX", "1");

            exec_target(config, err_fd);
        }
        Ok(ForkResult::Parent { child }) => {
            // Intermediate: close the error pipe (inner child owns
            // reporting responsibility now) and forward inner's status.
            let _ = nix::unistd::close(err_fd);
            let code = wait_and_translate(child);
            unsafe { libc::_exit(code) }
        }
        Err(e) => {
            die(err_fd, format!("fork (PID namespace entry): {e}"));
        }
    }
}

/// `execvpe(command[0], command, environ)`; on failure exits 127.
fn exec_target(config: &Config, err_fd: std::os::fd::RawFd) -> ! {
    let _ = nix::unistd::close(err_fd);

    let program = &config.command[0];
    let c_program = match CString::new(program.as_str()) {
        Ok(c) => c,
        Err(_) => {
            eprintln!("exec {program}: invalid program name (contains NUL)");
            unsafe { libc::_exit(127) }
        }
    };
    let mut c_args: Vec<CString> = Vec::with_capacity(config.command.len());
    for arg in &config.command {
        match CString::new(arg.as_str()) {
            Ok(c) => c_args.push(c),
            Err(_) => {
                eprintln!("exec {program}: invalid argument (contains NUL)");
                unsafe { libc::_exit(127) }
            }
        }
    }

    match nix::unistd::execvp(&c_program, &c_args) {
        Ok(infallible) => match infallible {},
        Err(e) => {
            eprintln!("exec {program}: {e}");
            unsafe { libc::_exit(127) }
        }
    }
}

/// `(status>>8)&0xff` for normal exit, `1` on fork failure / abnormal
/// wait.
fn wait_and_translate(pid: Pid) -> i32 {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return code & 0xff,
            Ok(WaitStatus::Signaled(_, sig, _)) => return 128 + sig as i32,
            Ok(WaitStatus::Stopped(..)) | Ok(WaitStatus::Continued(..)) => continue,
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(_) => return 1,
        }
    }
}

fn die(err_fd: std::os::fd::RawFd, msg: String) -> ! {
    let _ = nix::unistd::write(
        unsafe { std::os::fd::BorrowedFd::borrow_raw(err_fd) },
        msg.as_bytes(),
    );
    let _ = nix::unistd::close(err_fd);
    eprintln!("poof: {msg}");
    unsafe { libc::_exit(1) }
}
