use std::time::Instant;

use anyhow::Result;
use serde::Serialize;

use super::workspace::{StageReport, Workspace};
use crate::vastup_core::codec;
use crate::vastup_core::domain::{
    COMPLETION_MARKER,
    Fps,
    FrameSet,
    Job,
    ProcessingMode,
    StageStrategy,
    VideoMeta,
};
use crate::vastup_core::enhance::StageRole;
use crate::vastup_core::error::PipelineError;
use crate::vastup_core::journal::{PendingUploadRecord, UploadJournal};
use crate::vastup_core::pipeline::WorkerEnv;

/// Everything a finished job leaves behind besides the uploaded object.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub job_id: String,
    pub result_url: String,
    pub output_key: String,
    pub started_at: String,
    pub finished_at: String,
    pub stages: Vec<StageReport>,
}

/// Execute the full pipeline state machine for one job:
/// download -> probe -> extract -> process -> assemble -> upload.
///
/// On success the workspace is deleted, `result.json` is written next to
/// the workspace base, and the result URL plus the completion marker are
/// printed to stdout in that order. On failure the workspace is retained
/// with a diagnostics bundle, unless the failure was an operator cancel,
/// in which case the workspace is removed and nothing partial survives.
pub fn run_job(env: &WorkerEnv, job: &Job) -> Result<JobResult, PipelineError> {
    let started_at = chrono::Utc::now();
    tracing::info!("job {}: {} -> {}", job.job_id, job.input_key, job.output_key);

    let workspace = Workspace::create(&env.base_dir, &job.job_id)
        .map_err(|e| PipelineError::Config(format!("{e:#}")))?;

    let mut stages: Vec<StageReport> = Vec::new();
    let mut probe: Option<VideoMeta> = None;

    match run_stages(env, job, &workspace, &mut stages, &mut probe) {
        Ok(result_url) => {
            let result = JobResult {
                job_id: job.job_id.clone(),
                result_url: result_url.clone(),
                output_key: job.output_key.clone(),
                started_at: started_at.to_rfc3339(),
                finished_at: chrono::Utc::now().to_rfc3339(),
                stages,
            };
            write_result_json(env, &result);

            // The in-band protocol: result URL first, then the marker,
            // exactly once. The controller-side watcher keys off both.
            println!("{result_url}");
            println!("{COMPLETION_MARKER}");

            if let Err(err) = workspace.remove() {
                tracing::warn!("failed to remove workspace after success: {err:#}");
            }
            Ok(result)
        }
        Err(err) => {
            if env.cancel.is_cancelled() {
                // Operator interrupt: best-effort cleanup, no partial
                // results, no diagnostics noise.
                let _ = workspace.remove();
                return Err(PipelineError::Processing {
                    stage: "cancelled",
                    reason: "operator interrupt".to_string(),
                });
            }
            workspace.write_diagnostics(&format!("{err:#}"), &stages, probe.as_ref());
            Err(classify_failure(err))
        }
    }
}

fn classify_failure(err: anyhow::Error) -> PipelineError {
    match err.downcast::<PipelineError>() {
        Ok(pipeline) => pipeline,
        Err(other) => PipelineError::Processing {
            stage: "pipeline",
            reason: format!("{other:#}"),
        },
    }
}

fn run_stages(
    env: &WorkerEnv,
    job: &Job,
    workspace: &Workspace,
    stages: &mut Vec<StageReport>,
    probe: &mut Option<VideoMeta>,
) -> Result<String> {
    // Download.
    let input_path = workspace.input_dir.join(object_basename(&job.input_key));
    time_stage(stages, "download", || {
        env.store
            .download(&job.input_key, &input_path, &env.cancel)
            .map_err(|e| anyhow::anyhow!("download of {} failed: {e}", job.input_key))?;
        Ok(((), input_path.display().to_string()))
    })?;

    // Probe.
    let meta = time_stage(stages, "probe", || {
        let meta = codec::probe(&env.ffprobe, &input_path)?;
        let detail = format!(
            "{}x{} @ {} fps, ~{} frames",
            meta.width, meta.height, meta.fps, meta.frame_count
        );
        Ok((meta, detail))
    })?;
    *probe = Some(meta.clone());

    // Extract frames (forced 8-bit RGB) and the best-effort audio sidecar.
    let frames = time_stage(stages, "extract", || {
        let frames =
            codec::extract_frames(&env.ffmpeg, &input_path, &workspace.frames_dir, &env.cancel)?;
        let detail = format!(
            "{} frames at {}x{}",
            frames.count, frames.width, frames.height
        );
        Ok((frames, detail))
    })?;
    let audio = if meta.has_audio {
        codec::extract_audio(
            &env.ffmpeg,
            &input_path,
            &workspace.input_dir.join("audio.mka"),
            &env.cancel,
        )
    } else {
        None
    };

    // Processing stages per mode/strategy.
    let final_frames = run_processing(env, job, workspace, &frames, stages)?;

    // Assembly at the computed target fps (or the operator override, which
    // affects only this step).
    let assemble_fps = job
        .target_fps_override
        .map(Fps::from_f64_approx)
        .unwrap_or_else(|| job.target_fps(meta.fps));
    let output_path = workspace.output_dir.join(object_basename(&job.output_key));
    time_stage(stages, "assemble", || {
        let encoder = codec::assemble(
            &env.ffmpeg,
            &final_frames,
            assemble_fps,
            audio.as_deref(),
            &output_path,
            env.force_software_encode,
            &env.cancel,
        )
        .map_err(|e| processing_err("assemble", e))?;
        Ok(((), format!("{assemble_fps} fps via {}", encoder.as_str())))
    })?;

    // Final upload. A failure here persists a pending-upload record so the
    // next worker start can deliver the artifact.
    let result_url = env.store.public_url(&job.output_key);
    time_stage(stages, "upload", || {
        env.store
            .upload(&output_path, &job.output_key, &env.cancel, None)
            .map_err(|store_err| {
                let journal = UploadJournal::new(&env.base_dir);
                let record = PendingUploadRecord {
                    file_path: output_path.clone(),
                    bucket: env.store.bucket_name().to_string(),
                    key: job.output_key.clone(),
                    endpoint: env.store.endpoint().to_string(),
                    attempts: 1,
                };
                if let Err(err) = journal.write(&record) {
                    tracing::warn!("failed to persist pending-upload record: {err:#}");
                }
                anyhow::Error::new(PipelineError::Upload(store_err.to_string()))
            })?;
        Ok(((), job.output_key.clone()))
    })?;

    Ok(result_url)
}

/// Dispatch the processor stages. In `mode = both` the first stage runs as
/// an intermediate: its wrapper sets the in-band env flag that suppresses
/// the legacy runner's auto-upload and completion marker, so the watcher
/// cannot observe a premature success.
fn run_processing(
    env: &WorkerEnv,
    job: &Job,
    workspace: &Workspace,
    frames: &FrameSet,
    stages: &mut Vec<StageReport>,
) -> Result<FrameSet> {
    let scale = job.scale.unwrap_or(2.0);
    let factor = job.interp_factor.unwrap_or(2);

    let interpolate = |input: &FrameSet, role: StageRole, stages: &mut Vec<StageReport>| {
        time_stage(stages, "interpolate", || {
            let out = env
                .enhancer
                .interpolate(input, &workspace.interp_dir, factor, role, &env.cancel)
                .map_err(|e| processing_err("interpolate", e))?;
            let detail = format!("{} -> {} frames", input.count, out.count);
            Ok((out, detail))
        })
    };
    let upscale = |input: &FrameSet, role: StageRole, stages: &mut Vec<StageReport>| {
        time_stage(stages, "upscale", || {
            let out = env
                .enhancer
                .upscale(input, &workspace.upscale_dir, scale, role, &env.cancel)
                .map_err(|e| processing_err("upscale", e))?;
            let detail = format!(
                "{}x{} -> {}x{}",
                input.width, input.height, out.width, out.height
            );
            Ok((out, detail))
        })
    };

    match job.mode {
        ProcessingMode::Upscale => upscale(frames, StageRole::Final, stages),
        ProcessingMode::Interp => interpolate(frames, StageRole::Final, stages),
        ProcessingMode::Both => match job.strategy.unwrap_or_default() {
            StageStrategy::InterpThenUpscale => {
                let mid = interpolate(frames, StageRole::Intermediate, stages)?;
                upscale(&mid, StageRole::Final, stages)
            }
            StageStrategy::UpscaleThenInterp => {
                let mid = upscale(frames, StageRole::Intermediate, stages)?;
                interpolate(&mid, StageRole::Final, stages)
            }
        },
    }
}

fn processing_err(stage: &'static str, err: anyhow::Error) -> anyhow::Error {
    match err.downcast::<PipelineError>() {
        Ok(already) => anyhow::Error::new(already),
        Err(err) => anyhow::Error::new(PipelineError::Processing {
            stage,
            reason: format!("{err:#}"),
        }),
    }
}

fn object_basename(key: &str) -> String {
    key.rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or("artifact")
        .to_string()
}

fn write_result_json(env: &WorkerEnv, result: &JobResult) {
    let path = env.base_dir.join("result.json");
    if let Err(err) = crate::vastup_core::settings::write_json_file(&path, result) {
        tracing::warn!("failed to write result.json: {err:#}");
    }
}

/// Run `f` as a named stage, timing it and recording its report line.
fn time_stage<T>(
    stages: &mut Vec<StageReport>,
    name: &str,
    f: impl FnOnce() -> Result<(T, String)>,
) -> Result<T> {
    let started = Instant::now();
    tracing::info!("stage {name} started");
    match f() {
        Ok((value, detail)) => {
            let elapsed_ms = started.elapsed().as_millis() as u64;
            tracing::info!("stage {name} finished in {elapsed_ms} ms ({detail})");
            stages.push(StageReport {
                stage: name.to_string(),
                elapsed_ms,
                detail,
            });
            Ok(value)
        }
        Err(err) => {
            stages.push(StageReport {
                stage: name.to_string(),
                elapsed_ms: started.elapsed().as_millis() as u64,
                detail: format!("failed: {err:#}"),
            });
            Err(err)
        }
    }
}
