//! End-to-end checks against a real Docker daemon.
//!
//! These never run in ordinary CI: they require a reachable daemon and at least one
//! running container, and are gated behind `test-docker-interop` the same way the
//! registry/daemon interop suites are gated elsewhere in this workspace.

use color_eyre::{eyre::Context, Result};
use xshell::{cmd, Shell};

#[test_log::test(tokio::test)]
#[cfg_attr(
    not(feature = "test-docker-interop"),
    ignore = "skipping integration tests that require docker to be installed"
)]
async fn scan_against_local_daemon_runs_cleanly() -> Result<()> {
    let workspace = crate::workspace_root();

    tracing::info!(workspace = %workspace.display(), "create shell");
    let sh = Shell::new().context("create shell")?;
    sh.change_dir(&workspace);

    tracing::info!("run arcane-updater scan");
    cmd!(sh, "cargo run --bin arcane-updater -- scan").run()?;

    Ok(())
}

#[test_log::test(tokio::test)]
#[cfg_attr(
    not(feature = "test-docker-interop"),
    ignore = "skipping integration tests that require docker to be installed"
)]
async fn apply_dry_run_against_local_daemon_never_mutates_anything() -> Result<()> {
    let workspace = crate::workspace_root();

    tracing::info!(workspace = %workspace.display(), "create shell");
    let sh = Shell::new().context("create shell")?;
    sh.change_dir(&workspace);

    tracing::info!("run arcane-updater apply --dry-run");
    cmd!(sh, "cargo run --bin arcane-updater -- apply --dry-run").run()?;

    Ok(())
}
