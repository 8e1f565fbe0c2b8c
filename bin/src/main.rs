#![deny(clippy::uninlined_format_args)]
#![deny(clippy::unwrap_used)]
#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

//! Thin CLI around `arcane_core`: scan running workloads for image updates, or run
//! the full `ApplyPending` pipeline against the local Docker daemon.
//!
//! This binary is a demonstration harness, not the scheduler described in the core's
//! design: a real deployment invokes `arcane_core::Orchestrator::apply_pending` from
//! its own scheduling loop, HTTP handler, or job queue.

use std::sync::Arc;

use arcane_core::{
    credential::StaticVault,
    engine::BollardEngine,
    event::{MemoryAuditSink, TracingEventSink, TracingNotifier},
    orchestrator::{ApplyOptions, Orchestrator, ProgressTracker},
    probe::InMemoryRecordStore,
    recreate::SelfUpgrade,
    ImageReference, UpdateProbeService,
};
use clap::{
    builder::{styling::AnsiColor, Styles},
    Parser, Subcommand,
};
use color_eyre::{
    eyre::{bail, Result},
    Section,
};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{self, prelude::*};

#[derive(Debug, Parser)]
#[command(version, about, styles = style())]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Check whether locally-present images have newer versions available upstream.
    ///
    /// For each reference, every local image ID backing it is checked against the
    /// registry's current manifest digest; nothing is pulled or recreated.
    Scan(ScanArgs),

    /// Run the full update pipeline: probe, plan, pull, and recreate in dependency
    /// order every running container that needs to adopt a newer image.
    Apply(ApplyArgs),
}

#[derive(Debug, clap::Args)]
struct ScanArgs {
    /// Image references to check, e.g. `redis:7.0` or `ghcr.io/org/app:latest`.
    ///
    /// When omitted, every locally-present image with at least one tag is checked.
    images: Vec<String>,
}

#[derive(Debug, clap::Args)]
struct ApplyArgs {
    /// Compute and print the update plan without pulling or recreating anything.
    #[arg(long)]
    dry_run: bool,

    /// Image references to consider. When omitted, every image backing a running,
    /// non-opted-out container is probed.
    images: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::registry()
        .with(tracing_error::ErrorLayer::default())
        .with(
            tracing_tree::HierarchicalLayer::default()
                .with_indent_lines(true)
                .with_indent_amount(2)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_verbose_exit(false)
                .with_verbose_entry(false)
                .with_targets(false),
        )
        .with(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    match Cli::parse().command {
        Commands::Scan(args) => scan(args).await,
        Commands::Apply(args) => apply(args).await,
    }
    .with_warning(|| {
        "connection errors usually mean the Docker daemon is unreachable at its default socket or pipe"
    })
}

async fn scan(args: ScanArgs) -> Result<()> {
    let engine = Arc::new(BollardEngine::connect()?);
    let vault = Arc::new(StaticVault::new(Vec::new()));
    let store = Arc::new(InMemoryRecordStore::default());
    let service = UpdateProbeService::new(
        Arc::clone(&engine),
        vault,
        Arc::clone(&store),
        Arc::new(TracingNotifier),
    );

    let pairs = resolve_image_ids(&engine, &args.images).await?;
    let results = service
        .check_many(
            &pairs
                .into_iter()
                .map(|(reference, image_id)| (reference.to_string(), image_id))
                .collect::<Vec<_>>(),
            &[],
        )
        .await?;

    let rows: Vec<_> = results.iter().map(|r| &r.record).collect();
    println!("{}", serde_json::to_string_pretty(&serde_json::json!({
        "checked": rows.len(),
        "updates_available": rows.iter().filter(|r| r.has_update).count(),
    }))?);
    for record in rows {
        tracing::info!(
            repository = %record.repository,
            tag = %record.tag,
            has_update = record.has_update,
            auth_method = ?record.auth_method,
            "checked image",
        );
    }
    Ok(())
}

async fn apply(args: ApplyArgs) -> Result<()> {
    let engine = Arc::new(BollardEngine::connect()?);
    let vault = Arc::new(StaticVault::new(Vec::new()));
    let store: Arc<InMemoryRecordStore> = Arc::new(InMemoryRecordStore::default());
    let service = UpdateProbeService::new(
        Arc::clone(&engine),
        Arc::clone(&vault),
        Arc::clone(&store),
        Arc::new(TracingNotifier),
    );

    let pairs = resolve_image_ids(&engine, &args.images).await?;
    let results = service
        .check_many(
            &pairs
                .iter()
                .map(|(reference, image_id)| (reference.to_string(), image_id.clone()))
                .collect::<Vec<_>>(),
            &[],
        )
        .await?;

    let pending: Vec<(ImageReference, String, String)> = results
        .into_iter()
        .filter(|r| r.record.has_update)
        .filter_map(|r| {
            let reference = ImageReference::normalize(&format!("{}:{}", r.record.repository, r.record.tag)).ok()?;
            Some((reference, r.record.image_id, r.record.latest_digest.unwrap_or_default()))
        })
        .collect();

    let containers = arcane_core::discover_candidates(engine.as_ref()).await?;
    let events = TracingEventSink;
    let audit = MemoryAuditSink::default();
    let progress = ProgressTracker::default();
    let orchestrator = Orchestrator::new(engine.as_ref(), vault.as_ref(), store.as_ref(), &events, &audit, &progress);

    let result = orchestrator
        .apply_pending(&pending, &containers, ApplyOptions { dry_run: args.dry_run }, &NoSelfUpgrade)
        .await?;

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "checked": result.checked,
            "updated": result.updated,
            "failed": result.failed,
            "skipped": result.skipped,
            "plans": result.plans.len(),
        }))?
    );
    Ok(())
}

/// Resolves `refs` to `(normalized reference, local image ID)` pairs by matching
/// against the engine's image list. With no refs given, every tagged local image is
/// considered.
async fn resolve_image_ids(
    engine: &BollardEngine,
    refs: &[String],
) -> Result<Vec<(ImageReference, String)>> {
    use arcane_core::Engine as _;

    let images = engine.list_images().await?;
    let mut pairs = Vec::new();

    if refs.is_empty() {
        for image in images {
            for tag in &image.repo_tags {
                if let Ok(reference) = ImageReference::normalize(tag) {
                    pairs.push((reference, image.id.clone()));
                }
            }
        }
        return Ok(pairs);
    }

    for raw in refs {
        let reference = ImageReference::normalize(raw)?;
        let canonical = reference.to_string();
        let image_id = images
            .iter()
            .find(|image| image.repo_tags.iter().any(|tag| tag == &canonical))
            .map(|image| image.id.clone());
        match image_id {
            Some(id) => pairs.push((reference, id)),
            None => bail!("no local image found for reference {raw}"),
        }
    }
    Ok(pairs)
}

/// The demonstration binary is never the updater application itself, so the
/// self-update special case always reports an error rather than silently no-opping.
struct NoSelfUpgrade;

impl SelfUpgrade for NoSelfUpgrade {
    async fn trigger_upgrade_via_cli(&self) -> Result<()> {
        bail!("this binary has no self-upgrade mechanism; only the host application does")
    }
}

fn style() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Green.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
        .error(AnsiColor::Red.on_default())
        .invalid(AnsiColor::Red.on_default())
        .valid(AnsiColor::Blue.on_default())
}
