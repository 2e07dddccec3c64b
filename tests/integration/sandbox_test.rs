//! End-to-end checks against the built `poof` binary. Every test here
//! actually creates namespaces and mounts an overlay, which requires
//! either real privilege or a kernel that allows unprivileged user
//! namespaces; all of them are `#[ignore]`d so `cargo test` stays usable
//! in unprivileged CI, and run explicitly with `cargo test -- --ignored`
//! on a host that supports it.

use std::fs;
use std::process::Command;

use assert_cmd::cargo::cargo_bin;
use predicates::prelude::*;

fn poof() -> Command {
    Command::new(cargo_bin("poof"))
}

#[test]
#[ignore]
fn exec_runs_a_command_and_exits_zero() {
    poof()
        .args(["exec", "true"])
        .assert()
        .success();
}

#[test]
#[ignore]
fn exec_propagates_target_exit_code() {
    poof()
        .args(["exec", "sh", "-c", "exit 7"])
        .assert()
        .code(7);
}

#[test]
#[ignore]
fn exec_is_discarded_on_exit() {
    let marker = "/tmp/poof-exec-marker-should-not-survive";
    let _ = fs::remove_file(marker);

    poof()
        .args(["exec", "sh", "-c", &format!("touch {marker}")])
        .assert()
        .success();

    assert!(
        !std::path::Path::new(marker).exists(),
        "ephemeral writes must not leak onto the host"
    );
}

#[test]
#[ignore]
fn exec_cannot_see_disk_devices() {
    poof()
        .args(["exec", "sh", "-c", "ls /dev/sda 2>/dev/null; test ! -e /dev/sda"])
        .assert()
        .success();
}

#[test]
#[ignore]
fn timeout_exits_124() {
    poof()
        .args(["exec", "--timeout", "1", "sleep", "30"])
        .assert()
        .code(124);
}

#[test]
#[ignore]
fn unknown_program_exits_127() {
    poof()
        .args(["exec", "this-program-does-not-exist-anywhere"])
        .assert()
        .code(127);
}

#[test]
#[ignore]
fn run_persists_changes_into_upper_dir() {
    let tmp = tempfile::tempdir().unwrap();
    let upper = tmp.path().join("upper");

    poof()
        .args(["run", "--upper"])
        .arg(&upper)
        .args(["sh", "-c", "echo hi > /root/marker.txt"])
        .assert()
        .success();

    assert!(upper.join("root/marker.txt").exists());
}

#[test]
#[ignore]
fn run_without_upper_reuses_cwd_basename() {
    let tmp = tempfile::tempdir().unwrap();

    poof()
        .current_dir(tmp.path())
        .args(["run", "true"])
        .assert()
        .success();

    assert!(tmp.path().join("true").is_dir());
}

#[test]
fn help_lists_all_subcommands() {
    poof()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("exec"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("enter"));
}
