mod runner;
mod workspace;

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
pub use runner::{JobResult, run_job};
pub use workspace::{StageReport, Workspace};

use crate::vastup_core::domain::Job;
use crate::vastup_core::enhance::Enhancer;
use crate::vastup_core::journal::{UploadJournal, retry_pending_upload};
use crate::vastup_core::process::Cancel;
use crate::vastup_core::settings::AppSettings;
use crate::vastup_core::store::{ObjectStore, StoreConfig};
use crate::vastup_core::tools::{ToolKind, resolve_tool};

/// Env var through which the controller hands the worker its job. The
/// value is the JSON-serialized [`Job`]. Without it the worker plans its
/// own batch from the resolved config (local/standalone operation).
pub const JOB_ENV: &str = "VASTUP_JOB";

/// Env toggle that skips the hardware encoder entirely.
pub const FORCE_SOFTWARE_ENCODE_ENV: &str = "VASTUP_FORCE_SOFTWARE_ENCODE";

/// Everything the per-job pipeline needs, prepared once per worker start.
pub struct WorkerEnv {
    pub settings: AppSettings,
    pub store: ObjectStore,
    pub enhancer: Enhancer,
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    pub base_dir: PathBuf,
    pub force_software_encode: bool,
    pub cancel: Cancel,
}

impl WorkerEnv {
    pub fn prepare(
        settings: AppSettings,
        store: ObjectStore,
        base_dir: PathBuf,
        cancel: Cancel,
    ) -> Result<Self> {
        let ffmpeg = resolve_tool(ToolKind::Ffmpeg, &settings.tools)?;
        let ffprobe = resolve_tool(ToolKind::Ffprobe, &settings.tools)?;
        let enhancer = Enhancer::prepare(&settings.tools, &cancel)?;

        let force_software_encode = std::env::var(FORCE_SOFTWARE_ENCODE_ENV)
            .map(|v| v != "0" && !v.is_empty())
            .unwrap_or(false);

        Ok(Self {
            settings,
            store,
            enhancer,
            ffmpeg,
            ffprobe,
            base_dir,
            force_software_encode,
            cancel,
        })
    }
}

/// Worker entry point: recover any pending upload, then run this start's
/// job(s).
///
/// The journal retry runs before tool and accelerator preparation on
/// purpose: a previously produced artifact must get its delivery chance
/// even on a box where the model runners no longer come up.
///
/// In fleet operation the controller bakes exactly one job into the
/// instance environment. Run locally without it, the worker plans from the
/// resolved config and processes the whole surviving batch sequentially.
pub fn run_worker(settings: AppSettings, base_dir: PathBuf, cancel: Cancel) -> Result<()> {
    std::fs::create_dir_all(&base_dir)
        .with_context(|| format!("failed to create work dir {}", base_dir.display()))?;
    let store_config = StoreConfig::from_env()?;
    let store = ObjectStore::connect(&store_config, &settings.upload)?;

    let journal = UploadJournal::new(&base_dir);
    retry_pending_upload(&journal, &store, settings.upload.max_attempts, &cancel);

    let env = WorkerEnv::prepare(settings, store, base_dir, cancel)?;

    let jobs = match job_from_env()? {
        Some(job) => vec![job],
        None => crate::vastup_core::fleet::plan_jobs(&env.settings, &env.store, &env.cancel)?,
    };
    if jobs.is_empty() {
        tracing::info!("nothing to process");
        return Ok(());
    }

    let mut failed = 0usize;
    for job in &jobs {
        if env.cancel.is_cancelled() {
            bail!("interrupted before job {}", job.job_id);
        }
        match run_job(&env, job) {
            Ok(result) => {
                tracing::info!("job {} done: {}", job.job_id, result.result_url);
            }
            Err(err) => {
                failed += 1;
                tracing::error!("job {} failed: {err}", job.job_id);
            }
        }
    }

    if failed > 0 {
        bail!("{failed} of {} job(s) failed", jobs.len());
    }
    Ok(())
}

fn job_from_env() -> Result<Option<Job>> {
    match std::env::var(JOB_ENV) {
        Ok(raw) if !raw.trim().is_empty() => {
            let job: Job = serde_json::from_str(&raw)
                .with_context(|| format!("invalid {JOB_ENV} payload"))?;
            Ok(Some(job))
        }
        _ => Ok(None),
    }
}
