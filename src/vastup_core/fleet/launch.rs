use anyhow::{Context, Result};

use crate::vastup_core::domain::{Job, Offer};
use crate::vastup_core::error::MarketError;
use crate::vastup_core::market::{CreateInstanceRequest, LaunchCommand, MarketApi, OfferFilter};
use crate::vastup_core::pipeline::JOB_ENV;
use crate::vastup_core::settings::AppSettings;
use crate::vastup_core::store::StoreConfig;

/// Pick the offer for one job: the first candidate after the documented
/// sort (price ascending, reliability descending). No candidate is a
/// permanent configuration problem: the preset is too strict for the
/// current market.
pub fn select_offer(market: &dyn MarketApi, filter: &OfferFilter) -> Result<Offer, MarketError> {
    let offers = market.search_offers(filter)?;
    offers.into_iter().next().ok_or_else(|| {
        MarketError::Permanent(
            "no spot offers match the configured preset; relax its filters or retry later"
                .to_string(),
        )
    })
}

/// The bootstrap script the rented box runs on start.
///
/// It must go through a shell interpreter (the runtime treats a bare
/// string as an executable path), reset any stale checkout left by a
/// previous container on the same disk, and hand control to the repo's
/// bootstrap script.
pub fn build_launch_script(settings: &AppSettings) -> String {
    format!(
        "cd /workspace && rm -rf vastup && \
         git clone --depth 1 --branch {branch} {repo} vastup && \
         bash vastup/scripts/bootstrap.sh",
        branch = settings.git_branch,
        repo = settings.git_repo,
    )
}

/// Environment baked into the instance: object-store credentials, the
/// remote config URL, and the serialized job. Market credentials stay on
/// the controller.
pub fn build_worker_env(
    settings: &AppSettings,
    store_config: &StoreConfig,
    job: &Job,
) -> Result<Vec<(String, String)>> {
    let mut env = store_config.as_worker_env();
    if let Some(url) = settings.config_url.as_deref().map(str::trim)
        && !url.is_empty()
    {
        env.push((
            crate::vastup_core::settings::CONFIG_URL_ENV.to_string(),
            url.to_string(),
        ));
    }
    let payload = serde_json::to_string(job).context("failed to serialize job for the worker")?;
    env.push((JOB_ENV.to_string(), payload));
    Ok(env)
}

/// Rent an instance for `job` against the selected offer.
pub fn launch_job(
    market: &dyn MarketApi,
    settings: &AppSettings,
    store_config: &StoreConfig,
    job: &Job,
    offer: &Offer,
) -> Result<u64> {
    let request = CreateInstanceRequest {
        offer_id: offer.offer_id,
        image: settings.instance.image.clone(),
        env: build_worker_env(settings, store_config, job)?,
        launch_command: LaunchCommand::shell(&build_launch_script(settings)),
        disk_gb: settings.instance.disk_gb,
    };
    let instance_id = market
        .create_instance(&request)
        .with_context(|| format!("failed to create instance for job {}", job.job_id))?;
    tracing::info!(
        "job {}: rented instance {instance_id} ({} at ${:.3}/h)",
        job.job_id,
        offer.gpu_model,
        offer.price_per_hour
    );
    Ok(instance_id)
}
