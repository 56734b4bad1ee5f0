use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use nvml_wrapper::Nvml;

use crate::vastup_core::codec::scan_frame_set;
use crate::vastup_core::domain::FrameSet;
use crate::vastup_core::process::{Cancel, ProcessSpec, run};
use crate::vastup_core::settings::ToolSettings;
use crate::vastup_core::tools::{ToolKind, resolve_tool};

/// Env flag set on a model-runner child whose output feeds the next
/// processor rather than the assembler. The legacy runners auto-upload
/// their artifact and print the completion marker when run standalone;
/// this flag suppresses both so the controller-side watcher cannot observe
/// a premature success in `mode = both`.
pub const INTERMEDIATE_STAGE_ENV: &str = "VASTUP_INTERMEDIATE_STAGE";

/// Whether a processor invocation produces the job's final frame set or
/// an intermediate one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageRole {
    Final,
    Intermediate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuDevice {
    Cuda(u32),
    Cpu,
}

/// Accelerator plan shared by both runners for the life of the worker.
#[derive(Debug, Clone, Copy)]
pub struct GpuPlan {
    pub device: GpuDevice,
    /// Upscaler tile size, derived from free VRAM. Larger tiles are faster
    /// but blow up allocation on small cards.
    pub tile_size: u32,
    /// Interpolator processing-thread count.
    pub proc_threads: u32,
}

/// Expected interpolation output size: every input frame plus `factor - 1`
/// synthesized frames between each adjacent pair.
pub fn expected_interp_count(input_count: u64, factor: u32) -> u64 {
    let factor = u64::from(factor);
    input_count * factor - (factor - 1)
}

/// Free VRAM on device 0 in MiB, when NVML is available at all.
fn detect_free_vram_mib() -> Option<u64> {
    let nvml = Nvml::init().ok()?;
    let device = nvml.device_by_index(0).ok()?;
    let memory = device.memory_info().ok()?;
    Some(memory.free / (1024 * 1024))
}

/// Derive runner tuning from observed VRAM. The fallbacks are the most
/// conservative settings that still make progress on a 4 GiB card.
pub fn plan_for_vram(free_vram_mib: Option<u64>, device: GpuDevice) -> GpuPlan {
    let (tile_size, proc_threads) = match (device, free_vram_mib) {
        (GpuDevice::Cpu, _) => (128, 2),
        (_, Some(mib)) if mib >= 20_000 => (512, 4),
        (_, Some(mib)) if mib >= 10_000 => (384, 3),
        (_, Some(mib)) if mib >= 6_000 => (256, 2),
        _ => (128, 2),
    };
    GpuPlan {
        device,
        tile_size,
        proc_threads,
    }
}

/// Frame-batch processor wrappers. Both runners share the accelerator plan
/// decided once at preparation time.
pub struct Enhancer {
    upscaler: PathBuf,
    interpolator: PathBuf,
    plan: GpuPlan,
}

impl Enhancer {
    /// Resolve the runner binaries and settle on an accelerator.
    ///
    /// The GPU is probed by upscaling a single tiny generated frame; a
    /// rejected kernel (common on new compute capabilities with an older
    /// runtime) drops the whole worker to CPU mode rather than failing
    /// every job.
    pub fn prepare(tools: &ToolSettings, cancel: &Cancel) -> Result<Self> {
        let upscaler = resolve_tool(ToolKind::Upscaler, tools)?;
        let interpolator = resolve_tool(ToolKind::Interpolator, tools)?;

        let device = if probe_gpu(&upscaler, cancel)? {
            GpuDevice::Cuda(0)
        } else {
            tracing::warn!("accelerator probe failed; falling back to CPU processing");
            GpuDevice::Cpu
        };
        let plan = plan_for_vram(detect_free_vram_mib(), device);
        tracing::info!(
            "frame processors ready (device {:?}, tile {}, threads {})",
            plan.device,
            plan.tile_size,
            plan.proc_threads
        );

        Ok(Self {
            upscaler,
            interpolator,
            plan,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_plan(upscaler: PathBuf, interpolator: PathBuf, plan: GpuPlan) -> Self {
        Self {
            upscaler,
            interpolator,
            plan,
        }
    }

    pub fn plan(&self) -> GpuPlan {
        self.plan
    }

    /// Upscale every frame by `scale`. Output count must match the input;
    /// output dimensions must be the input's scaled by `scale`.
    pub fn upscale(
        &self,
        input: &FrameSet,
        out_dir: &Path,
        scale: f64,
        role: StageRole,
        cancel: &Cancel,
    ) -> Result<FrameSet> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create {}", out_dir.display()))?;
        let spec = upscale_spec(&self.upscaler, input, out_dir, scale, self.plan, role);
        run_stage("upscale", &spec, cancel)?;

        let output = scan_frame_set(out_dir).context("upscaler produced no usable frames")?;
        if output.count != input.count {
            bail!(
                "upscaler changed the frame count ({} in, {} out)",
                input.count,
                output.count
            );
        }
        let expected_w = (f64::from(input.width) * scale).round() as u32;
        let expected_h = (f64::from(input.height) * scale).round() as u32;
        if (output.width, output.height) != (expected_w, expected_h) {
            bail!(
                "upscaler produced {}x{} frames, expected {expected_w}x{expected_h}",
                output.width,
                output.height
            );
        }
        Ok(output)
    }

    /// Interpolate to `factor` times the motion samples. Output count obeys
    /// `n * factor - (factor - 1)`; dimensions must be exactly the input's.
    /// A padded-size output means the runner failed to crop its internal
    /// multiple-of-64 padding, which shows up as visible jumping after
    /// assembly, so it fails the stage here.
    pub fn interpolate(
        &self,
        input: &FrameSet,
        out_dir: &Path,
        factor: u32,
        role: StageRole,
        cancel: &Cancel,
    ) -> Result<FrameSet> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create {}", out_dir.display()))?;
        let spec = interpolate_spec(&self.interpolator, input, out_dir, factor, self.plan, role);
        run_stage("interpolate", &spec, cancel)?;

        let output = scan_frame_set(out_dir).context("interpolator produced no usable frames")?;
        let expected = expected_interp_count(input.count, factor);
        if output.count != expected {
            bail!(
                "interpolator produced {} frames, expected {expected} for factor {factor} over {}",
                output.count,
                input.count
            );
        }
        if (output.width, output.height) != (input.width, input.height) {
            bail!(
                "interpolator produced {}x{} frames, expected the input's {}x{} (internal padding not cropped)",
                output.width,
                output.height,
                input.width,
                input.height
            );
        }
        Ok(output)
    }
}

fn run_stage(stage: &str, spec: &ProcessSpec, cancel: &Cancel) -> Result<()> {
    tracing::info!("{stage}: {}", spec.rendered());
    let outcome = run(spec, cancel, Some(&|line: &str| tracing::debug!("{line}")))
        .with_context(|| format!("failed to spawn {stage} runner"))?;
    if outcome.cancelled {
        bail!("{stage} cancelled by operator");
    }
    if !outcome.success {
        bail!(
            "{stage} runner exited with {:?}: {}",
            outcome.exit_code,
            outcome.tail_excerpt(8)
        );
    }
    Ok(())
}

fn gpu_arg(plan: GpuPlan) -> String {
    match plan.device {
        GpuDevice::Cuda(index) => index.to_string(),
        GpuDevice::Cpu => "-1".to_string(),
    }
}

fn render_scale(scale: f64) -> String {
    if scale.fract() == 0.0 {
        format!("{}", scale as u64)
    } else {
        format!("{scale}")
    }
}

pub fn upscale_spec(
    upscaler: &Path,
    input: &FrameSet,
    out_dir: &Path,
    scale: f64,
    plan: GpuPlan,
    role: StageRole,
) -> ProcessSpec {
    let mut spec = ProcessSpec::new(upscaler)
        .arg("-i")
        .arg(input.dir.to_string_lossy())
        .arg("-o")
        .arg(out_dir.to_string_lossy())
        .arg("-s")
        .arg(render_scale(scale))
        .arg("-t")
        .arg(plan.tile_size.to_string())
        .arg("-g")
        .arg(gpu_arg(plan))
        .arg("-f")
        .arg("png");
    if role == StageRole::Intermediate {
        spec = spec.env(INTERMEDIATE_STAGE_ENV, "1");
    }
    spec
}

pub fn interpolate_spec(
    interpolator: &Path,
    input: &FrameSet,
    out_dir: &Path,
    factor: u32,
    plan: GpuPlan,
    role: StageRole,
) -> ProcessSpec {
    let target_frames = expected_interp_count(input.count, factor);
    let mut spec = ProcessSpec::new(interpolator)
        .arg("-i")
        .arg(input.dir.to_string_lossy())
        .arg("-o")
        .arg(out_dir.to_string_lossy())
        .arg("-n")
        .arg(target_frames.to_string())
        .arg("-g")
        .arg(gpu_arg(plan))
        .arg("-j")
        .arg(format!("1:{}:1", plan.proc_threads))
        .arg("-f")
        .arg("png");
    if role == StageRole::Intermediate {
        spec = spec.env(INTERMEDIATE_STAGE_ENV, "1");
    }
    spec
}

/// One-shot accelerator self test: upscale a generated 64x64 frame on the
/// GPU. Any failure (missing driver, rejected kernel) reports false.
fn probe_gpu(upscaler: &Path, cancel: &Cancel) -> Result<bool> {
    let probe_dir = std::env::temp_dir().join(format!("vastup-gpu-probe-{}", std::process::id()));
    let in_dir = probe_dir.join("in");
    let out_dir = probe_dir.join("out");
    fs::create_dir_all(&in_dir).context("failed to create GPU probe dir")?;
    fs::create_dir_all(&out_dir).context("failed to create GPU probe dir")?;
    write_probe_frame(&in_dir.join("frame_000001.png"))?;

    let spec = ProcessSpec::new(upscaler)
        .arg("-i")
        .arg(in_dir.to_string_lossy())
        .arg("-o")
        .arg(out_dir.to_string_lossy())
        .arg("-s")
        .arg("2")
        .arg("-g")
        .arg("0")
        .arg("-f")
        .arg("png");
    let ok = match run(&spec, cancel, None) {
        Ok(outcome) => outcome.success,
        Err(_) => false,
    };
    let _ = fs::remove_dir_all(&probe_dir);
    Ok(ok)
}

fn write_probe_frame(path: &Path) -> Result<()> {
    let file = fs::File::create(path)
        .with_context(|| format!("failed to create probe frame {}", path.display()))?;
    let mut encoder = png::Encoder::new(file, 64, 64);
    encoder.set_color(png::ColorType::Rgb);
    encoder.set_depth(png::BitDepth::Eight);
    let mut writer = encoder.write_header().context("probe frame header")?;
    writer
        .write_image_data(&vec![128u8; 64 * 64 * 3])
        .context("probe frame data")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vastup_core::test_support::write_test_frames;

    fn test_plan() -> GpuPlan {
        plan_for_vram(Some(24_000), GpuDevice::Cuda(0))
    }

    fn frame_set(dir: &Path, count: u64, width: u32, height: u32) -> FrameSet {
        FrameSet {
            dir: dir.to_path_buf(),
            count,
            width,
            height,
        }
    }

    #[test]
    fn interp_count_law_holds_for_known_sizes() {
        assert_eq!(expected_interp_count(145, 2), 289);
        assert_eq!(expected_interp_count(60, 2), 119);
        assert_eq!(expected_interp_count(100, 3), 298);
    }

    #[test]
    fn vram_plan_scales_with_available_memory() {
        assert_eq!(plan_for_vram(Some(24_000), GpuDevice::Cuda(0)).tile_size, 512);
        assert_eq!(plan_for_vram(Some(11_000), GpuDevice::Cuda(0)).tile_size, 384);
        assert_eq!(plan_for_vram(Some(8_000), GpuDevice::Cuda(0)).tile_size, 256);
        assert_eq!(plan_for_vram(None, GpuDevice::Cuda(0)).tile_size, 128);
        assert_eq!(plan_for_vram(Some(24_000), GpuDevice::Cpu).tile_size, 128);
    }

    #[test]
    fn intermediate_stage_sets_suppression_env_final_does_not() {
        let dir = tempfile::tempdir().expect("temp dir");
        let input = frame_set(dir.path(), 10, 640, 360);

        let first_stage = interpolate_spec(
            Path::new("rife-ncnn-vulkan"),
            &input,
            &dir.path().join("out"),
            2,
            test_plan(),
            StageRole::Intermediate,
        );
        assert!(first_stage.env_is_set(INTERMEDIATE_STAGE_ENV));

        let final_stage = upscale_spec(
            Path::new("realesrgan-ncnn-vulkan"),
            &input,
            &dir.path().join("out2"),
            2.0,
            test_plan(),
            StageRole::Final,
        );
        assert!(!final_stage.env_is_set(INTERMEDIATE_STAGE_ENV));
    }

    #[test]
    fn interpolate_spec_requests_the_law_abiding_frame_count() {
        let dir = tempfile::tempdir().expect("temp dir");
        let input = frame_set(dir.path(), 145, 1920, 1080);
        let spec = interpolate_spec(
            Path::new("rife-ncnn-vulkan"),
            &input,
            &dir.path().join("out"),
            2,
            test_plan(),
            StageRole::Final,
        );
        let n_pos = spec.args.iter().position(|a| a == "-n").expect("-n present");
        assert_eq!(spec.args[n_pos + 1], "289");
    }

    #[test]
    fn cpu_fallback_uses_device_minus_one() {
        let dir = tempfile::tempdir().expect("temp dir");
        let input = frame_set(dir.path(), 5, 64, 64);
        let spec = upscale_spec(
            Path::new("realesrgan-ncnn-vulkan"),
            &input,
            &dir.path().join("out"),
            2.0,
            plan_for_vram(None, GpuDevice::Cpu),
            StageRole::Final,
        );
        let g_pos = spec.args.iter().position(|a| a == "-g").expect("-g present");
        assert_eq!(spec.args[g_pos + 1], "-1");
    }

    #[cfg(unix)]
    #[test]
    fn interpolate_rejects_padded_output_dimensions() {
        use crate::vastup_core::test_support::write_mock_tool;

        let dir = tempfile::tempdir().expect("temp dir");
        let in_dir = dir.path().join("in");
        write_test_frames(&in_dir, 2, 100, 50);

        // Mock runner that emits the right count but at padded 128x64.
        let out_dir = dir.path().join("out");
        let tool = write_mock_tool(dir.path(), "mock-rife", "exit 0");
        std::fs::create_dir_all(&out_dir).expect("out dir");
        write_test_frames(&out_dir, 3, 128, 64);

        let enhancer = Enhancer::with_plan(tool.clone(), tool, test_plan());
        let input = crate::vastup_core::codec::scan_frame_set(&in_dir).expect("scan input");
        let err = enhancer
            .interpolate(&input, &out_dir, 2, StageRole::Final, &Cancel::new())
            .expect_err("padded output must fail");
        assert!(err.to_string().contains("padding"));
    }

    #[cfg(unix)]
    #[test]
    fn upscale_verifies_count_preservation() {
        use crate::vastup_core::test_support::write_mock_tool;

        let dir = tempfile::tempdir().expect("temp dir");
        let in_dir = dir.path().join("in");
        write_test_frames(&in_dir, 4, 32, 16);

        // Mock runner output drops a frame.
        let out_dir = dir.path().join("out");
        std::fs::create_dir_all(&out_dir).expect("out dir");
        write_test_frames(&out_dir, 3, 64, 32);

        let tool = write_mock_tool(dir.path(), "mock-esrgan", "exit 0");
        let enhancer = Enhancer::with_plan(tool.clone(), tool, test_plan());
        let input = crate::vastup_core::codec::scan_frame_set(&in_dir).expect("scan input");
        let err = enhancer
            .upscale(&input, &out_dir, 2.0, StageRole::Final, &Cancel::new())
            .expect_err("missing frame must fail");
        assert!(err.to_string().contains("frame count"));
    }
}
