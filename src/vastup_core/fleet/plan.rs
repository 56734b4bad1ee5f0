use anyhow::{Context, Result};

use crate::vastup_core::domain::{Job, ProcessingMode};
use crate::vastup_core::process::Cancel;
use crate::vastup_core::settings::AppSettings;
use crate::vastup_core::store::ObjectStore;

const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "mov", "avi", "webm", "m4v", "ts"];

fn is_video_key(key: &str) -> bool {
    key.rsplit('.')
        .next()
        .map(|ext| VIDEO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn key_stem(key: &str) -> &str {
    let basename = key.rsplit('/').next().unwrap_or(key);
    basename.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(basename)
}

fn sanitize_id(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect()
}

/// Deterministic output key for an input: same input + same processing
/// parameters always map to the same object, which is what makes uploads
/// idempotent and skip-existing meaningful.
pub fn output_key_for(settings: &AppSettings, input_key: &str) -> String {
    let video = &settings.video;
    let stem = key_stem(input_key);
    let suffix = match video.mode {
        ProcessingMode::Upscale => format!("_x{}", render_scale(video.scale.unwrap_or(2.0))),
        ProcessingMode::Interp => format!("_i{}", video.interp_factor.unwrap_or(2)),
        ProcessingMode::Both => format!(
            "_i{}_x{}",
            video.interp_factor.unwrap_or(2),
            render_scale(video.scale.unwrap_or(2.0))
        ),
    };
    let prefix = video.output_dir.trim_end_matches('/');
    if prefix.is_empty() {
        format!("{stem}{suffix}.mp4")
    } else {
        format!("{prefix}/{stem}{suffix}.mp4")
    }
}

fn render_scale(scale: f64) -> String {
    if scale.fract() == 0.0 {
        format!("{}", scale as u64)
    } else {
        format!("{scale}").replace('.', "p")
    }
}

/// Enumerate inputs and build one job per surviving input.
///
/// Inputs come from the configured prefix; non-video keys are ignored.
/// With `skip_existing`, inputs whose deterministic output key already
/// exists are dropped. The batch cap applies last, after filtering.
pub fn plan_jobs(
    settings: &AppSettings,
    store: &ObjectStore,
    cancel: &Cancel,
) -> Result<Vec<Job>> {
    let video = &settings.video;
    let entries = store
        .list(&video.input_dir, cancel)
        .with_context(|| format!("failed to list inputs under {}", video.input_dir))?;

    let mut jobs = Vec::new();
    for entry in entries {
        if !is_video_key(&entry.key) {
            continue;
        }
        let output_key = output_key_for(settings, &entry.key);
        if settings.batch.skip_existing
            && store
                .exists(&output_key, cancel)
                .with_context(|| format!("failed to check for existing {output_key}"))?
        {
            tracing::info!("skipping {} (output {} already exists)", entry.key, output_key);
            continue;
        }
        jobs.push(Job {
            job_id: sanitize_id(key_stem(&entry.key)),
            input_key: entry.key,
            output_key,
            mode: video.mode,
            scale: if video.mode.wants_upscale() { video.scale } else { None },
            interp_factor: if video.mode.wants_interp() { video.interp_factor } else { None },
            strategy: if video.mode == ProcessingMode::Both { video.strategy } else { None },
            target_fps_override: video.target_fps,
        });
        if let Some(cap) = settings.batch.max_files
            && jobs.len() >= cap
        {
            tracing::info!("batch cap of {cap} reached");
            break;
        }
    }
    Ok(jobs)
}

/// Human-readable plan for dry runs.
pub fn describe_plan(settings: &AppSettings, jobs: &[Job]) -> String {
    let mut out = format!(
        "plan: {} job(s), mode {}, preset {:?}\n",
        jobs.len(),
        settings.video.mode,
        settings.batch.preset
    );
    for job in jobs {
        out.push_str(&format!(
            "  {}  {} -> {}\n",
            job.job_id, job.input_key, job.output_key
        ));
    }
    out
}
