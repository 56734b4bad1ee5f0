use std::collections::BTreeMap;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::vastup_core::domain::{ProcessingMode, StageStrategy};

/// Per-video processing parameters. Field names match the config document
/// keys (`video.*`); anything this version does not recognize is preserved
/// in `extra` and carried to the worker unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoSettings {
    #[serde(default = "default_input_dir")]
    pub input_dir: String,
    /// Prefix under which deterministic output keys are written.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    #[serde(default = "default_mode")]
    pub mode: ProcessingMode,
    /// Upscale factor. Required unless mode = interp.
    #[serde(default)]
    pub scale: Option<f64>,
    /// Interpolation factor, integer >= 2. Required unless mode = upscale.
    #[serde(default)]
    pub interp_factor: Option<u32>,
    /// Stage ordering for mode = both. Defaults to interp-then-upscale.
    #[serde(default)]
    pub strategy: Option<StageStrategy>,
    /// Operator override for the assembly frame rate. Does not change
    /// processing inputs.
    #[serde(default)]
    pub target_fps: Option<f64>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

fn default_input_dir() -> String {
    "input/".to_string()
}

fn default_output_dir() -> String {
    "output/".to_string()
}

fn default_mode() -> ProcessingMode {
    ProcessingMode::Upscale
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            input_dir: default_input_dir(),
            output_dir: default_output_dir(),
            mode: default_mode(),
            scale: Some(2.0),
            interp_factor: None,
            strategy: None,
            target_fps: None,
            extra: BTreeMap::new(),
        }
    }
}

/// Batch planning knobs (`batch.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSettings {
    /// Name of the offer-filter preset used to rent instances.
    #[serde(default = "default_preset")]
    pub preset: String,
    /// Skip inputs whose deterministic output key already exists.
    #[serde(default = "default_true")]
    pub skip_existing: bool,
    /// Cap on the number of jobs planned per run. None means unlimited.
    #[serde(default)]
    pub max_files: Option<usize>,
    /// Stop after planning and print the plan instead of renting anything.
    #[serde(default)]
    pub dry_run: bool,
    /// Destroy (not just stop) instances whose job completed.
    #[serde(default)]
    pub destroy_completed: bool,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

fn default_preset() -> String {
    "budget".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            preset: default_preset(),
            skip_existing: true,
            max_files: None,
            dry_run: false,
            destroy_completed: false,
            extra: BTreeMap::new(),
        }
    }
}

/// Named bundle of offer filters, referenced by `batch.preset`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferPreset {
    #[serde(default)]
    pub min_vram_gb: f64,
    #[serde(default = "default_max_price")]
    pub max_price_per_hour: f64,
    #[serde(default)]
    pub min_reliability: f64,
    #[serde(default)]
    pub gpu_name_filter: Option<String>,
}

fn default_max_price() -> f64 {
    1.0
}

/// Instance shape used when renting (`instance.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSettings {
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_disk_gb")]
    pub disk_gb: f64,
}

fn default_image() -> String {
    "pytorch/pytorch:2.2.0-cuda12.1-cudnn8-runtime".to_string()
}

fn default_disk_gb() -> f64 {
    64.0
}

impl Default for InstanceSettings {
    fn default() -> Self {
        Self {
            image: default_image(),
            disk_gb: default_disk_gb(),
        }
    }
}

/// Log-watcher knobs (`watch.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchSettings {
    #[serde(default = "default_poll_secs")]
    pub poll_secs: u64,
    #[serde(default = "default_tail_lines")]
    pub tail_lines: u32,
}

fn default_poll_secs() -> u64 {
    5
}

fn default_tail_lines() -> u32 {
    1000
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            poll_secs: default_poll_secs(),
            tail_lines: default_tail_lines(),
        }
    }
}

/// Upload behavior (`upload.*`), covering both the in-band retry budget and
/// the pending-upload journal ceiling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSettings {
    /// Ceiling for journal-driven retries at worker start.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Internal transient-retry budget per transfer.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Objects at or above this size go through the multipart path.
    #[serde(default = "default_multipart_threshold_mb")]
    pub multipart_threshold_mb: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_attempts() -> u32 {
    4
}

fn default_multipart_threshold_mb() -> u64 {
    64
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_attempts: default_retry_attempts(),
            multipart_threshold_mb: default_multipart_threshold_mb(),
        }
    }
}

/// Explicit executable paths (`tools.*`). Empty/absent values fall back to
/// a PATH probe on the host.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolSettings {
    #[serde(default)]
    pub ffmpeg_path: Option<String>,
    #[serde(default)]
    pub ffprobe_path: Option<String>,
    #[serde(default)]
    pub upscaler_path: Option<String>,
    #[serde(default)]
    pub interpolator_path: Option<String>,
}

/// The resolved configuration for one run, shared between controller and
/// worker. The document that produced it may carry keys this version does
/// not know about; they ride along in the `extra` maps so a newer worker
/// behind an older controller still sees them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default)]
    pub video: VideoSettings,
    #[serde(default)]
    pub batch: BatchSettings,
    #[serde(default)]
    pub instance: InstanceSettings,
    #[serde(default)]
    pub watch: WatchSettings,
    #[serde(default)]
    pub upload: UploadSettings,
    #[serde(default)]
    pub tools: ToolSettings,
    #[serde(default = "default_presets")]
    pub presets: BTreeMap<String, OfferPreset>,
    /// Branch the worker launch command checks out before bootstrapping.
    #[serde(default = "default_git_branch")]
    pub git_branch: String,
    /// Repository the worker launch command clones.
    #[serde(default = "default_git_repo")]
    pub git_repo: String,
    /// Remote config document merged over this baseline at load time.
    #[serde(default)]
    pub config_url: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            video: VideoSettings::default(),
            batch: BatchSettings::default(),
            instance: InstanceSettings::default(),
            watch: WatchSettings::default(),
            upload: UploadSettings::default(),
            tools: ToolSettings::default(),
            presets: default_presets(),
            git_branch: default_git_branch(),
            git_repo: default_git_repo(),
            config_url: None,
            extra: BTreeMap::new(),
        }
    }
}

fn default_git_branch() -> String {
    "main".to_string()
}

fn default_git_repo() -> String {
    "https://github.com/vastup/vastup.git".to_string()
}

fn default_presets() -> BTreeMap<String, OfferPreset> {
    let mut presets = BTreeMap::new();
    presets.insert(
        "budget".to_string(),
        OfferPreset {
            min_vram_gb: 10.0,
            max_price_per_hour: 0.25,
            min_reliability: 0.90,
            gpu_name_filter: None,
        },
    );
    presets.insert(
        "fast".to_string(),
        OfferPreset {
            min_vram_gb: 20.0,
            max_price_per_hour: 0.80,
            min_reliability: 0.95,
            gpu_name_filter: Some("RTX_4090".to_string()),
        },
    );
    presets
}

impl AppSettings {
    /// Fill derivable gaps before validation: mode = both without an explicit
    /// strategy gets the interp-then-upscale default.
    pub fn normalize(&mut self) {
        if self.video.mode == ProcessingMode::Both && self.video.strategy.is_none() {
            self.video.strategy = Some(StageStrategy::default());
        }
    }

    /// Enforce the mode/scale/factor coupling and numeric bounds once, at
    /// load time, so the planner and pipeline never re-check them.
    pub fn validate(&self) -> Result<()> {
        let video = &self.video;
        if video.mode.wants_upscale() {
            match video.scale {
                Some(s) if s > 0.0 && s.is_finite() => {}
                Some(s) => bail!("video.scale must be a positive number, got {s}"),
                None => bail!("video.scale is required when video.mode is {}", video.mode),
            }
        }
        if video.mode.wants_interp() {
            match video.interp_factor {
                Some(f) if f >= 2 => {}
                Some(f) => bail!("video.interp_factor must be an integer >= 2, got {f}"),
                None => bail!(
                    "video.interp_factor is required when video.mode is {}",
                    video.mode
                ),
            }
        }
        if video.mode == ProcessingMode::Both && video.strategy.is_none() {
            bail!("video.strategy is required when video.mode is both");
        }
        if let Some(fps) = video.target_fps {
            if !(fps.is_finite() && fps > 0.0) {
                bail!("video.target_fps must be a positive number, got {fps}");
            }
        }
        if !self.presets.contains_key(&self.batch.preset) {
            bail!(
                "batch.preset references unknown preset {:?} (known: {})",
                self.batch.preset,
                self.presets
                    .keys()
                    .map(String::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        if self.watch.poll_secs == 0 {
            bail!("watch.poll_secs must be at least 1");
        }
        if self.upload.max_attempts == 0 {
            bail!("upload.max_attempts must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_validate() {
        let mut settings = AppSettings::default();
        settings.normalize();
        settings.validate().expect("defaults must be valid");
    }

    #[test]
    fn interp_mode_requires_factor_of_at_least_two() {
        let mut settings = AppSettings::default();
        settings.video.mode = ProcessingMode::Interp;
        settings.video.interp_factor = None;
        settings.normalize();
        let err = settings.validate().expect_err("missing factor must fail");
        assert!(err.to_string().contains("interp_factor"));

        settings.video.interp_factor = Some(1);
        let err = settings.validate().expect_err("factor below 2 must fail");
        assert!(err.to_string().contains(">= 2"));
    }

    #[test]
    fn both_mode_defaults_strategy_on_normalize() {
        let mut settings = AppSettings::default();
        settings.video.mode = ProcessingMode::Both;
        settings.video.scale = Some(2.0);
        settings.video.interp_factor = Some(2);
        assert!(settings.video.strategy.is_none());
        settings.normalize();
        assert_eq!(settings.video.strategy, Some(StageStrategy::InterpThenUpscale));
        settings.validate().expect("normalized both-mode settings are valid");
    }

    #[test]
    fn unknown_preset_reference_is_rejected() {
        let mut settings = AppSettings::default();
        settings.batch.preset = "does-not-exist".to_string();
        let err = settings.validate().expect_err("unknown preset must fail");
        assert!(err.to_string().contains("does-not-exist"));
    }

    #[test]
    fn unknown_keys_survive_a_serde_round_trip() {
        let doc = serde_json::json!({
            "video": {
                "input_dir": "clips/",
                "mode": "upscale",
                "scale": 2,
                "denoise_strength": 0.4
            },
            "experimental_flag": true
        });
        let settings: AppSettings =
            serde_json::from_value(doc).expect("deserialize with unknown keys");
        assert_eq!(settings.video.input_dir, "clips/");
        assert_eq!(
            settings.video.extra.get("denoise_strength"),
            Some(&serde_json::json!(0.4))
        );
        assert_eq!(
            settings.extra.get("experimental_flag"),
            Some(&serde_json::json!(true))
        );

        let back = serde_json::to_value(&settings).expect("serialize settings");
        assert_eq!(back["video"]["denoise_strength"], serde_json::json!(0.4));
        assert_eq!(back["experimental_flag"], serde_json::json!(true));
    }
}
