//! Image cache service
//!
//! Fires concurrent image requests through a single-flight downloader actor,
//! then publishes the results to a main-domain gallery in one batch.
//!
//! Usage:
//!   image-cache --callers 5 --keys 3 --latency-ms 1000
//!   image-cache --config config/runtime.toml --fail-key image-1.png

mod downloader;
mod gallery;

use downloader::{DownloaderConfig, ImageDownloader};
use gallery::Gallery;

use anyhow::{Context, Result};
use clap::Parser;
use isolation_runtime::{Runtime, TaskOptions};
use runtime_config::RuntimeSettings;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "image-cache")]
#[command(about = "Single-flight image cache running on the isolation runtime")]
#[command(version)]
struct Args {
    /// Path to a runtime settings file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter (trace, debug, info, warn, error or a directive); overrides settings
    #[arg(short, long)]
    log_level: Option<String>,

    /// Concurrent callers per image
    #[arg(long, default_value_t = 5)]
    callers: usize,

    /// Distinct images requested
    #[arg(long, default_value_t = 3)]
    keys: usize,

    /// Simulated download latency
    #[arg(long, default_value_t = 1000)]
    latency_ms: u64,

    /// Image key whose download fails, e.g. image-1.png
    #[arg(long)]
    fail_key: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let settings = RuntimeSettings::load(args.config.as_deref())
        .context("Failed to load runtime settings")?;

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&settings.log_level);
    init_logging(log_level)?;

    info!("Starting image cache");
    if let Some(path) = &args.config {
        info!("Configuration: {}", path.display());
    }

    let runtime = Runtime::from_settings(&settings).map_err(|e| {
        error!("Failed to start runtime: {}", e);
        e
    })?;

    let downloader = ImageDownloader::new(
        &runtime,
        DownloaderConfig {
            latency: Duration::from_millis(args.latency_ms),
            fail_key: args.fail_key.clone(),
        },
    )?;

    let keys: Vec<String> = (0..args.keys).map(|i| format!("image-{}.png", i)).collect();
    info!(
        callers = args.callers,
        keys = keys.len(),
        latency_ms = args.latency_ms,
        "Requesting images"
    );

    let started = Instant::now();
    let mut requests = Vec::with_capacity(args.callers * keys.len());
    for caller in 0..args.callers {
        for key in &keys {
            let downloader = downloader.clone();
            let target = key.clone();
            let options = TaskOptions::detached().label(format!("caller-{}", caller));
            let task = runtime
                .global_domain()
                .spawn_with(options, async move { downloader.fetch(target).await });
            requests.push((key.clone(), task));
        }
    }

    let mut results = Vec::with_capacity(requests.len());
    for (key, task) in requests {
        let result = task.await;
        if let Err(e) = &result {
            warn!(key = %key, error = %e, error_category = e.category(), "Request failed");
        }
        results.push((key, result));
    }
    let elapsed = started.elapsed();

    let gallery = Gallery::new(&runtime)?;
    let summary = gallery.publish(results).await?;

    let flights = downloader.cache_stats();
    let stats = runtime.stats();

    println!("Image cache summary");
    println!("  wall clock:        {:?}", elapsed);
    println!("  requests:          {}", args.callers * keys.len());
    println!("  downloads:         {}", downloader.downloads());
    println!("  cached images:     {}", downloader.cached_images().await?);
    println!("  cache hits/joins:  {}/{}", flights.hits, flights.joins);
    println!("  failed loads:      {}", flights.failures);
    println!(
        "  gallery:           revision {} with {} tiles, {} errors (published on {})",
        summary.revision,
        summary.tiles,
        summary.errors,
        summary.thread.as_deref().unwrap_or("<unnamed>")
    );
    for tile in gallery.tiles().await? {
        println!("    {} ({} bytes)", tile.key, tile.size);
    }
    for failure in gallery.errors().await? {
        println!("    failed: {}", failure);
    }
    println!("Runtime stats");
    println!("  continuations:     {}", stats.continuations_run);
    println!("  avg continuation:  {:.0}ns", stats.avg_continuation_time_ns);
    println!(
        "  tasks:             {} spawned, {} completed, {} failed, {} cancelled",
        stats.tasks_spawned, stats.tasks_completed, stats.tasks_failed, stats.tasks_cancelled
    );
    println!("  suspensions:       {}", stats.suspensions);
    println!("  actors:            {}", stats.actors_spawned);

    drop(gallery);
    drop(downloader);
    runtime.shutdown();
    info!("Image cache stopped");
    Ok(())
}

fn init_logging(filter: &str) -> Result<()> {
    let filter = EnvFilter::try_new(filter)
        .with_context(|| format!("Invalid log filter: {}", filter))?;

    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}
