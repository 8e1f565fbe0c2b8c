//! Argument-parsing and help-text checks that don't require a Docker daemon.

use assert_cmd::Command;
use predicates::str::contains;

fn updater() -> Command {
    Command::cargo_bin("arcane-updater").expect("locate arcane-updater binary")
}

#[test]
fn help_lists_both_subcommands() {
    updater()
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("scan"))
        .stdout(contains("apply"));
}

#[test]
fn scan_help_documents_the_dry_nature_of_the_command() {
    updater()
        .args(["scan", "--help"])
        .assert()
        .success()
        .stdout(contains("newer versions"));
}

#[test]
fn apply_help_documents_dry_run_flag() {
    updater()
        .args(["apply", "--help"])
        .assert()
        .success()
        .stdout(contains("--dry-run"));
}

#[test]
fn unknown_subcommand_is_rejected() {
    updater().arg("bogus").assert().failure();
}
