mod cli;

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command};
use vastup::vastup_core::fleet;
use vastup::vastup_core::market::{MarketApi, OfferFilter, VastMarketClient};
use vastup::vastup_core::pipeline::run_worker;
use vastup::vastup_core::process::Cancel;
use vastup::vastup_core::settings::{AppSettings, resolve_settings};
use vastup::vastup_core::store::{ObjectStore, StoreConfig};
use vastup::vastup_core::watcher::watch_instance;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let cancel = Cancel::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            tracing::warn!("interrupt received; shutting down");
            cancel.cancel();
        })
        .context("failed to install interrupt handler")?;
    }

    let settings = resolve_settings(cli.config.as_deref())?;

    match cli.command {
        Command::Run { dry_run } => run_fleet(&cli, settings, dry_run, cancel),
        Command::Plan => run_fleet(&cli, settings, true, cancel),
        Command::Worker { work_dir } => run_worker(settings, work_dir, cancel),
        Command::Offers => list_offers(&cli, &settings),
        Command::Watch { instance_id } => {
            let market = market_client(&cli)?;
            let url_filter = std::env::var("VASTUP_S3_BUCKET").unwrap_or_default();
            let report = watch_instance(
                market.as_ref(),
                instance_id,
                &settings.watch,
                &url_filter,
                &cancel,
            );
            tracing::info!(
                "detached from instance {instance_id} (completed: {})",
                report.completed
            );
            Ok(())
        }
    }
}

fn market_client(cli: &Cli) -> Result<Arc<dyn MarketApi>> {
    let api_key = cli
        .api_key
        .clone()
        .context("spot-market API key required (--api-key or VASTUP_API_KEY)")?;
    Ok(Arc::new(VastMarketClient::new(&cli.market_url, api_key)?))
}

fn run_fleet(cli: &Cli, settings: AppSettings, dry_run: bool, cancel: Cancel) -> Result<()> {
    let store_config = StoreConfig::from_env()?;
    let store = ObjectStore::connect(&store_config, &settings.upload)?;

    let jobs = fleet::plan_jobs(&settings, &store, &cancel).context("planning failed")?;
    if jobs.is_empty() {
        tracing::info!("no pending inputs under {}", settings.video.input_dir);
        return Ok(());
    }

    if dry_run || settings.batch.dry_run {
        print!("{}", fleet::describe_plan(&settings, &jobs));
        return Ok(());
    }

    let market = market_client(cli)?;
    let summary = fleet::supervise_jobs(&jobs, &settings, market, &store_config, &cancel)?;

    tracing::info!(
        "fleet done: {} planned, {} launched, {} completed before detach",
        summary.planned,
        summary.launched.len(),
        summary.completed_count()
    );
    for report in &summary.reports {
        if let Some(url) = &report.result_url {
            println!("{}: {url}", report.instance_id);
        }
    }
    if !summary.all_launched() {
        bail!(
            "{} of {} job(s) failed to launch",
            summary.launch_failures.len(),
            summary.planned
        );
    }
    Ok(())
}

fn list_offers(cli: &Cli, settings: &AppSettings) -> Result<()> {
    let preset = settings
        .presets
        .get(&settings.batch.preset)
        .with_context(|| format!("preset {:?} missing from settings", settings.batch.preset))?;
    let market = market_client(cli)?;
    let offers = market.search_offers(&OfferFilter::from(preset))?;
    if offers.is_empty() {
        tracing::warn!("no offers match preset {:?}", settings.batch.preset);
        return Ok(());
    }
    println!("{:>10}  {:<20} {:>8} {:>9} {:>12}", "offer", "gpu", "vram", "$/h", "reliability");
    for offer in offers {
        println!(
            "{:>10}  {:<20} {:>6.0}GB {:>9.3} {:>12.4}",
            offer.offer_id, offer.gpu_model, offer.gpu_vram_gb, offer.price_per_hour, offer.reliability
        );
    }
    Ok(())
}
