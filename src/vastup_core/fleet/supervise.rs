use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};

use super::launch::{launch_job, select_offer};
use crate::vastup_core::domain::Job;
use crate::vastup_core::market::{MarketApi, OfferFilter};
use crate::vastup_core::process::Cancel;
use crate::vastup_core::settings::AppSettings;
use crate::vastup_core::store::StoreConfig;
use crate::vastup_core::watcher::{WatchReport, watch_instance};

#[derive(Debug, Clone)]
pub struct LaunchedJob {
    pub job_id: String,
    pub instance_id: u64,
}

/// What one fleet run did: how many jobs were planned, which launched,
/// which failed to launch, and what every watcher saw before the operator
/// detached.
#[derive(Debug)]
pub struct FleetSummary {
    pub planned: usize,
    pub launched: Vec<LaunchedJob>,
    pub launch_failures: Vec<(String, String)>,
    pub reports: Vec<WatchReport>,
}

impl FleetSummary {
    pub fn all_launched(&self) -> bool {
        self.launch_failures.is_empty()
    }

    pub fn completed_count(&self) -> usize {
        self.reports.iter().filter(|r| r.completed).count()
    }
}

/// Rent an instance per job and supervise the whole batch.
///
/// Launch failures are per-job: a job that cannot get an offer or an
/// instance is recorded and its siblings proceed. Every launched instance
/// gets its own watcher thread over the shared market client; the threads
/// run until the operator interrupt fires, then their reports are
/// collected. Interrupt never destroys instances; only jobs that were
/// observed to complete are reclaimed, and only when the config asks
/// for it.
pub fn supervise_jobs(
    jobs: &[Job],
    settings: &AppSettings,
    market: Arc<dyn MarketApi>,
    store_config: &StoreConfig,
    cancel: &Cancel,
) -> Result<FleetSummary> {
    let preset = settings
        .presets
        .get(&settings.batch.preset)
        .with_context(|| format!("preset {:?} missing from settings", settings.batch.preset))?;
    let filter = OfferFilter::from(preset);

    let mut launched = Vec::new();
    let mut launch_failures = Vec::new();
    for job in jobs {
        if cancel.is_cancelled() {
            break;
        }
        let result = select_offer(market.as_ref(), &filter)
            .map_err(anyhow::Error::from)
            .and_then(|offer| launch_job(market.as_ref(), settings, store_config, job, &offer));
        match result {
            Ok(instance_id) => launched.push(LaunchedJob {
                job_id: job.job_id.clone(),
                instance_id,
            }),
            Err(err) => {
                tracing::error!("job {} failed to launch: {err:#}", job.job_id);
                launch_failures.push((job.job_id.clone(), format!("{err:#}")));
            }
        }
    }

    let mut handles = Vec::new();
    for entry in &launched {
        let market = market.clone();
        let watch = settings.watch.clone();
        let url_filter = store_config.bucket.clone();
        let cancel = cancel.clone();
        let instance_id = entry.instance_id;
        let handle = thread::Builder::new()
            .name(format!("vastup-watch-{instance_id}"))
            .spawn(move || watch_instance(market.as_ref(), instance_id, &watch, &url_filter, &cancel))
            .with_context(|| format!("failed to spawn watcher for instance {instance_id}"))?;
        handles.push(handle);
    }

    let mut reports = Vec::new();
    for handle in handles {
        match handle.join() {
            Ok(report) => reports.push(report),
            Err(_) => tracing::error!("a watcher thread panicked"),
        }
    }

    if settings.batch.destroy_completed {
        for report in reports.iter().filter(|r| r.completed) {
            match market.destroy_instance(report.instance_id) {
                Ok(()) => tracing::info!("destroyed completed instance {}", report.instance_id),
                Err(err) => tracing::warn!(
                    "failed to destroy completed instance {}: {err}",
                    report.instance_id
                ),
            }
        }
    }

    Ok(FleetSummary {
        planned: jobs.len(),
        launched,
        launch_failures,
        reports,
    })
}
