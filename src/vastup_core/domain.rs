use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// The single in-band success signal a worker prints to stdout, exactly once
/// per successful job, immediately after the final result URL line. The log
/// watcher on the controller counts occurrences of this literal; the wording
/// must never change while old worker images are still in circulation.
pub const COMPLETION_MARKER: &str = "VASTAI_PIPELINE_COMPLETED_SUCCESSFULLY";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingMode {
    Upscale,
    Interp,
    Both,
}

impl ProcessingMode {
    pub fn wants_upscale(self) -> bool {
        matches!(self, ProcessingMode::Upscale | ProcessingMode::Both)
    }

    pub fn wants_interp(self) -> bool {
        matches!(self, ProcessingMode::Interp | ProcessingMode::Both)
    }
}

impl fmt::Display for ProcessingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessingMode::Upscale => write!(f, "upscale"),
            ProcessingMode::Interp => write!(f, "interp"),
            ProcessingMode::Both => write!(f, "both"),
        }
    }
}

/// Stage ordering for `mode = both`. Interp-then-upscale is the default:
/// the upscaler dominates cost, so it should see as few pixels as possible.
/// Both orderings must yield the same final fps.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StageStrategy {
    #[serde(rename = "interp-then-upscale")]
    InterpThenUpscale,
    #[serde(rename = "upscale-then-interp")]
    UpscaleThenInterp,
}

impl Default for StageStrategy {
    fn default() -> Self {
        StageStrategy::InterpThenUpscale
    }
}

/// Exact frame rate as a rational. Kept as `num/den` end to end so 29.97
/// (30000/1001) inputs survive the round trip without drift; the assembler
/// hands the rational straight to the encoder.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Fps {
    pub num: u32,
    pub den: u32,
}

impl Fps {
    pub fn new(num: u32, den: u32) -> Self {
        Self {
            num,
            den: den.max(1),
        }
    }

    pub fn from_int(fps: u32) -> Self {
        Self { num: fps, den: 1 }
    }

    /// Parse ffprobe's `r_frame_rate` form, e.g. `24000/1001` or `25`.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if let Some((num, den)) = raw.split_once('/') {
            let num: u32 = num.trim().parse().ok()?;
            let den: u32 = den.trim().parse().ok()?;
            if num == 0 || den == 0 {
                return None;
            }
            return Some(Self { num, den });
        }
        let num: u32 = raw.parse().ok()?;
        if num == 0 {
            return None;
        }
        Some(Self { num, den: 1 })
    }

    pub fn as_f64(self) -> f64 {
        f64::from(self.num) / f64::from(self.den)
    }

    /// Rational form of an operator-supplied float override. Whole numbers
    /// stay exact; anything else is carried at millihertz precision.
    pub fn from_f64_approx(fps: f64) -> Self {
        if fps.fract() == 0.0 {
            Self::from_int(fps as u32)
        } else {
            Self {
                num: (fps * 1000.0).round() as u32,
                den: 1000,
            }
        }
    }

    /// Multiply the rate by an integer factor (interpolation by `factor`
    /// produces `factor` times the frames over the same wall clock).
    pub fn multiply(self, factor: u32) -> Self {
        Self {
            num: self.num.saturating_mul(factor),
            den: self.den,
        }
    }
}

impl fmt::Display for Fps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.den == 1 {
            write!(f, "{}", self.num)
        } else {
            write!(f, "{}/{}", self.num, self.den)
        }
    }
}

/// Result of probing an input container. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoMeta {
    pub fps: Fps,
    pub frame_count: u64,
    /// Display width after applying rotation metadata (90/270 swap).
    pub width: u32,
    /// Display height after applying rotation metadata (90/270 swap).
    pub height: u32,
    pub has_audio: bool,
    /// Rotation in degrees as declared by the container, normalized to
    /// {0, 90, 180, 270}.
    pub rotation: u32,
    pub duration_seconds: Option<f64>,
}

impl VideoMeta {
    pub fn duration_from_frames(&self) -> f64 {
        self.frame_count as f64 / self.fps.as_f64()
    }
}

/// A directory of sequentially numbered 8-bit RGB frames named
/// `frame_%06d.png`, contiguous from index 1, all with identical dimensions.
#[derive(Debug, Clone)]
pub struct FrameSet {
    pub dir: PathBuf,
    pub count: u64,
    pub width: u32,
    pub height: u32,
}

impl FrameSet {
    pub fn frame_path(&self, index: u64) -> PathBuf {
        self.dir.join(format!("frame_{index:06}.png"))
    }
}

/// Immutable description of one processing request, created by the fleet
/// planner from the resolved config plus the input listing, consumed by the
/// worker-side pipeline. Field coupling (scale/factor/strategy presence per
/// mode) is enforced when settings are loaded, so a constructed `Job` is
/// always internally consistent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub job_id: String,
    /// Object-store key of the input video.
    pub input_key: String,
    /// Deterministic object-store key for the final output.
    pub output_key: String,
    pub mode: ProcessingMode,
    /// Upscale factor, a positive rational (typically 2 or 4); present iff
    /// mode != interp.
    pub scale: Option<f64>,
    /// Interpolation factor (>= 2); present iff mode != upscale.
    pub interp_factor: Option<u32>,
    /// Stage ordering; present iff mode = both.
    pub strategy: Option<StageStrategy>,
    /// Optional operator override applied only at assembly time. Processing
    /// inputs are unaffected.
    pub target_fps_override: Option<f64>,
}

impl Job {
    /// The fps the assembler must use, given what the probe reported.
    ///
    /// Interpolation multiplies the rate by the factor so duration is
    /// preserved; keeping the original rate would produce slow motion,
    /// which is wrong. Upscaling never changes the rate.
    pub fn target_fps(&self, original: Fps) -> Fps {
        match self.mode {
            ProcessingMode::Upscale => original,
            ProcessingMode::Interp | ProcessingMode::Both => {
                original.multiply(self.interp_factor.unwrap_or(1).max(1))
            }
        }
    }
}

/// One spot-market rental candidate, consumed at most once by the planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Offer {
    pub offer_id: u64,
    pub gpu_model: String,
    pub gpu_vram_gb: f64,
    pub price_per_hour: f64,
    /// Provider-reported host reliability in [0, 1].
    pub reliability: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceStatus {
    Creating,
    Loading,
    Running,
    Exited,
    Stopped,
    Destroyed,
    /// Providers add statuses without notice; never fail parsing on one.
    Unknown(String),
}

impl InstanceStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "creating" => InstanceStatus::Creating,
            "loading" => InstanceStatus::Loading,
            "running" => InstanceStatus::Running,
            "exited" => InstanceStatus::Exited,
            "stopped" => InstanceStatus::Stopped,
            "destroyed" => InstanceStatus::Destroyed,
            other => InstanceStatus::Unknown(other.to_string()),
        }
    }

    /// True for states in which the container can no longer make progress.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Exited | InstanceStatus::Stopped | InstanceStatus::Destroyed
        )
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceStatus::Creating => write!(f, "creating"),
            InstanceStatus::Loading => write!(f, "loading"),
            InstanceStatus::Running => write!(f, "running"),
            InstanceStatus::Exited => write!(f, "exited"),
            InstanceStatus::Stopped => write!(f, "stopped"),
            InstanceStatus::Destroyed => write!(f, "destroyed"),
            InstanceStatus::Unknown(s) => write!(f, "unknown({s})"),
        }
    }
}

/// A rented worker as last reported by the provider.
#[derive(Debug, Clone)]
pub struct Instance {
    pub instance_id: u64,
    pub status: InstanceStatus,
    pub gpu_model: Option<String>,
    pub price_per_hour: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fps_parses_rational_and_integer_forms() {
        let ntsc = Fps::parse("30000/1001").expect("rational fps");
        assert_eq!(ntsc.num, 30000);
        assert_eq!(ntsc.den, 1001);
        assert!((ntsc.as_f64() - 29.97).abs() < 0.01);

        let plain = Fps::parse("24").expect("integer fps");
        assert_eq!(plain.num, 24);
        assert_eq!(plain.den, 1);

        assert!(Fps::parse("0/1").is_none());
        assert!(Fps::parse("garbage").is_none());
    }

    #[test]
    fn fps_multiply_keeps_denominator() {
        let ntsc = Fps::new(24000, 1001);
        let doubled = ntsc.multiply(2);
        assert_eq!(doubled.num, 48000);
        assert_eq!(doubled.den, 1001);
        assert_eq!(doubled.to_string(), "48000/1001");
    }

    #[test]
    fn target_fps_follows_mode_rules() {
        let original = Fps::from_int(24);

        let upscale = Job {
            job_id: "j1".into(),
            input_key: "in/a.mp4".into(),
            output_key: "out/a.mp4".into(),
            mode: ProcessingMode::Upscale,
            scale: Some(2.0),
            interp_factor: None,
            strategy: None,
            target_fps_override: None,
        };
        assert_eq!(upscale.target_fps(original), original);

        let interp = Job {
            mode: ProcessingMode::Interp,
            scale: None,
            interp_factor: Some(2),
            ..upscale.clone()
        };
        assert_eq!(interp.target_fps(original), Fps::from_int(48));

        let both = Job {
            mode: ProcessingMode::Both,
            scale: Some(2.0),
            interp_factor: Some(2),
            strategy: Some(StageStrategy::InterpThenUpscale),
            ..upscale.clone()
        };
        assert_eq!(both.target_fps(original), Fps::from_int(48));
    }

    #[test]
    fn instance_status_parse_tolerates_unknown_values() {
        assert_eq!(InstanceStatus::parse("RUNNING"), InstanceStatus::Running);
        assert_eq!(
            InstanceStatus::parse("offline"),
            InstanceStatus::Unknown("offline".to_string())
        );
        assert!(InstanceStatus::parse("stopped").is_terminal());
        assert!(!InstanceStatus::parse("loading").is_terminal());
    }

    #[test]
    fn mode_serde_uses_lowercase_names() {
        let json = serde_json::to_string(&ProcessingMode::Both).expect("serialize mode");
        assert_eq!(json, "\"both\"");
        let strategy: StageStrategy =
            serde_json::from_str("\"interp-then-upscale\"").expect("deserialize strategy");
        assert_eq!(strategy, StageStrategy::InterpThenUpscale);
    }
}
