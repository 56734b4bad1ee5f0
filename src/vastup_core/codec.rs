use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde_json::Value;

use crate::vastup_core::domain::{Fps, FrameSet, VideoMeta};
use crate::vastup_core::process::{Cancel, ProcessSpec, run};

/// Assembled outputs below this size are treated as failures. The hardware
/// encoder's common failure mode is a metadata-only stub of a few KiB that
/// exits with status 0.
pub const MIN_OUTPUT_BYTES: u64 = 50 * 1024;

/// Probe an input container and return its immutable metadata.
///
/// The frame rate is kept rational exactly as ffprobe reports it. Rotation
/// metadata of 90 or 270 degrees swaps the reported width/height so every
/// downstream consumer sees display dimensions.
pub fn probe(ffprobe: &Path, input: &Path) -> Result<VideoMeta> {
    // The probe output can be large (one JSON object per stream), so this
    // uses a plain buffered `output()` rather than the tail-bounded
    // supervisor; ffprobe exits quickly and needs no cancellation hook.
    let output = std::process::Command::new(ffprobe)
        .arg("-v")
        .arg("error")
        .arg("-print_format")
        .arg("json")
        .arg("-show_streams")
        .arg("-show_format")
        .arg(input.as_os_str())
        .output()
        .with_context(|| format!("failed to run ffprobe on {}", input.display()))?;
    if !output.status.success() {
        bail!(
            "ffprobe failed for {}: {}",
            input.display(),
            String::from_utf8_lossy(&output.stderr)
        );
    }

    let document: Value = serde_json::from_slice(&output.stdout)
        .with_context(|| format!("ffprobe produced invalid JSON for {}", input.display()))?;
    parse_probe_document(&document)
        .with_context(|| format!("ffprobe output missing video stream data for {}", input.display()))
}

fn parse_probe_document(document: &Value) -> Result<VideoMeta> {
    let streams = document
        .get("streams")
        .and_then(Value::as_array)
        .context("no streams array")?;

    let video = streams
        .iter()
        .find(|s| s.get("codec_type").and_then(Value::as_str) == Some("video"))
        .context("no video stream")?;
    let has_audio = streams
        .iter()
        .any(|s| s.get("codec_type").and_then(Value::as_str) == Some("audio"));

    let fps_raw = video
        .get("r_frame_rate")
        .and_then(Value::as_str)
        .context("no r_frame_rate")?;
    let fps = Fps::parse(fps_raw).with_context(|| format!("unparsable frame rate {fps_raw}"))?;

    let mut width = video
        .get("width")
        .and_then(Value::as_u64)
        .context("no width")? as u32;
    let mut height = video
        .get("height")
        .and_then(Value::as_u64)
        .context("no height")? as u32;

    let rotation = probe_rotation(video);
    if rotation == 90 || rotation == 270 {
        std::mem::swap(&mut width, &mut height);
    }

    let duration_seconds = document
        .get("format")
        .and_then(|f| f.get("duration"))
        .and_then(Value::as_str)
        .and_then(|d| d.parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0);

    // nb_frames is container-dependent; fall back to duration * fps.
    let frame_count = video
        .get("nb_frames")
        .and_then(Value::as_str)
        .and_then(|n| n.parse::<u64>().ok())
        .or_else(|| duration_seconds.map(|d| (d * fps.as_f64()).round() as u64))
        .unwrap_or(0);

    Ok(VideoMeta {
        fps,
        frame_count,
        width,
        height,
        has_audio,
        rotation,
        duration_seconds,
    })
}

/// Rotation appears either as a stream side-data entry (newer ffprobe) or
/// a legacy `rotate` tag. Values are normalized into {0, 90, 180, 270}.
fn probe_rotation(video: &Value) -> u32 {
    let side_data = video
        .get("side_data_list")
        .and_then(Value::as_array)
        .and_then(|entries| {
            entries
                .iter()
                .find_map(|e| e.get("rotation").and_then(Value::as_i64))
        });
    let tag = video
        .get("tags")
        .and_then(|t| t.get("rotate"))
        .and_then(Value::as_str)
        .and_then(|r| r.parse::<i64>().ok());

    let raw = side_data.or(tag).unwrap_or(0);
    (raw.rem_euclid(360)) as u32 / 90 * 90
}

/// Decode one frame sequence directory into a [`FrameSet`], verifying the
/// numbering is contiguous from 1 and reading dimensions off the first
/// frame's PNG header.
pub fn scan_frame_set(dir: &Path) -> Result<FrameSet> {
    let mut count: u64 = 0;
    for entry in fs::read_dir(dir)
        .with_context(|| format!("failed to read frame directory {}", dir.display()))?
    {
        let name = entry?.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("frame_") && name.ends_with(".png") {
            count += 1;
        }
    }
    if count == 0 {
        bail!("no frames found under {}", dir.display());
    }

    let first = dir.join("frame_000001.png");
    let last = dir.join(format!("frame_{count:06}.png"));
    if !first.exists() || !last.exists() {
        bail!(
            "frame sequence under {} is not contiguous from 1 to {count}",
            dir.display()
        );
    }

    let (width, height) = png_dimensions(&first)?;
    Ok(FrameSet {
        dir: dir.to_path_buf(),
        count,
        width,
        height,
    })
}

/// Read width/height from a PNG without decoding pixel data.
pub fn png_dimensions(path: &Path) -> Result<(u32, u32)> {
    let file = fs::File::open(path)
        .with_context(|| format!("failed to open frame {}", path.display()))?;
    let decoder = png::Decoder::new(file);
    let reader = decoder
        .read_info()
        .with_context(|| format!("failed to read PNG header of {}", path.display()))?;
    let info = reader.info();
    Ok((info.width, info.height))
}

/// Extract every frame of `input` into `dir` as `frame_%06d.png` from 1.
///
/// Output is forced to 8-bit RGB: the batch processors cannot ingest 16-bit
/// frames, and some decoders would otherwise emit them for 10-bit sources.
pub fn extract_frames(
    ffmpeg: &Path,
    input: &Path,
    dir: &Path,
    cancel: &Cancel,
) -> Result<FrameSet> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create frame directory {}", dir.display()))?;

    let pattern = dir.join("frame_%06d.png");
    let spec = ProcessSpec::new(ffmpeg)
        .arg("-y")
        .arg("-v")
        .arg("error")
        .arg("-i")
        .arg(input.to_string_lossy())
        .arg("-pix_fmt")
        .arg("rgb24")
        .arg("-start_number")
        .arg("1")
        .arg(pattern.to_string_lossy());
    let outcome = run(&spec, cancel, None)
        .with_context(|| format!("failed to run ffmpeg extract on {}", input.display()))?;
    if !outcome.success {
        bail!(
            "frame extraction failed for {}: {}",
            input.display(),
            outcome.tail_excerpt(5)
        );
    }

    scan_frame_set(dir)
}

/// Best-effort copy of the first audio stream into a sidecar file. Returns
/// None when the input has no audio or the copy fails; audio absence never
/// fails a job.
pub fn extract_audio(
    ffmpeg: &Path,
    input: &Path,
    sidecar: &Path,
    cancel: &Cancel,
) -> Option<PathBuf> {
    let spec = ProcessSpec::new(ffmpeg)
        .arg("-y")
        .arg("-v")
        .arg("error")
        .arg("-i")
        .arg(input.to_string_lossy())
        .arg("-vn")
        .arg("-map")
        .arg("0:a:0")
        .arg("-c:a")
        .arg("copy")
        .arg(sidecar.to_string_lossy());
    match run(&spec, cancel, None) {
        Ok(outcome) if outcome.success && sidecar.exists() => Some(sidecar.to_path_buf()),
        _ => {
            let _ = fs::remove_file(sidecar);
            None
        }
    }
}

/// Encoder selection result for the stage report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderUsed {
    Hardware,
    Software,
}

impl EncoderUsed {
    pub fn as_str(self) -> &'static str {
        match self {
            EncoderUsed::Hardware => "h264_nvenc",
            EncoderUsed::Software => "libx264",
        }
    }
}

/// Assemble a frame sequence (and optional audio sidecar) into an output
/// container at the given frame rate.
///
/// The hardware encoder is tried first unless `force_software` is set; a
/// non-zero exit or an undersized output falls back to libx264. An
/// undersized software output is a hard failure.
pub fn assemble(
    ffmpeg: &Path,
    frames: &FrameSet,
    fps: Fps,
    audio: Option<&Path>,
    output: &Path,
    force_software: bool,
    cancel: &Cancel,
) -> Result<EncoderUsed> {
    if !force_software {
        match try_assemble(ffmpeg, frames, fps, audio, output, EncoderUsed::Hardware, cancel) {
            Ok(()) => return Ok(EncoderUsed::Hardware),
            Err(err) => {
                tracing::warn!("hardware encode failed, falling back to software: {err:#}");
                let _ = fs::remove_file(output);
            }
        }
    }

    try_assemble(ffmpeg, frames, fps, audio, output, EncoderUsed::Software, cancel)?;
    Ok(EncoderUsed::Software)
}

fn try_assemble(
    ffmpeg: &Path,
    frames: &FrameSet,
    fps: Fps,
    audio: Option<&Path>,
    output: &Path,
    encoder: EncoderUsed,
    cancel: &Cancel,
) -> Result<()> {
    let pattern = frames.dir.join("frame_%06d.png");
    let mut spec = ProcessSpec::new(ffmpeg)
        .arg("-y")
        .arg("-v")
        .arg("error")
        .arg("-framerate")
        .arg(fps.to_string())
        .arg("-start_number")
        .arg("1")
        .arg("-i")
        .arg(pattern.to_string_lossy());
    if let Some(audio) = audio {
        spec = spec
            .arg("-i")
            .arg(audio.to_string_lossy())
            .arg("-map")
            .arg("0:v:0")
            .arg("-map")
            .arg("1:a:0")
            .arg("-c:a")
            .arg("aac")
            .arg("-b:a")
            .arg("192k")
            .arg("-shortest");
    }
    spec = match encoder {
        EncoderUsed::Hardware => spec
            .arg("-c:v")
            .arg("h264_nvenc")
            .arg("-preset")
            .arg("p5")
            .arg("-cq")
            .arg("19"),
        EncoderUsed::Software => spec.arg("-c:v").arg("libx264").arg("-crf").arg("18"),
    };
    spec = spec
        .arg("-pix_fmt")
        .arg("yuv420p")
        .arg(output.to_string_lossy());

    let outcome = run(&spec, cancel, None)
        .with_context(|| format!("failed to run ffmpeg assemble ({})", encoder.as_str()))?;
    if !outcome.success {
        bail!(
            "{} assembly exited with {:?}: {}",
            encoder.as_str(),
            outcome.exit_code,
            outcome.tail_excerpt(5)
        );
    }

    let size = fs::metadata(output)
        .with_context(|| format!("assembled output missing at {}", output.display()))?
        .len();
    if size < MIN_OUTPUT_BYTES {
        bail!(
            "{} produced an undersized output ({size} bytes < {MIN_OUTPUT_BYTES}); treating as failed",
            encoder.as_str()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::vastup_core::test_support::write_test_png;

    fn probe_doc(width: u32, height: u32, rotation: Option<i64>) -> Value {
        let mut video = json!({
            "codec_type": "video",
            "r_frame_rate": "24000/1001",
            "nb_frames": "145",
            "width": width,
            "height": height,
        });
        if let Some(rotation) = rotation {
            video["side_data_list"] = json!([{"rotation": rotation}]);
        }
        json!({
            "streams": [video, {"codec_type": "audio"}],
            "format": {"duration": "6.047"}
        })
    }

    #[test]
    fn probe_parses_rational_fps_and_audio_presence() {
        let meta = parse_probe_document(&probe_doc(1920, 1080, None)).expect("parse probe");
        assert_eq!(meta.fps, Fps::new(24000, 1001));
        assert_eq!(meta.frame_count, 145);
        assert_eq!((meta.width, meta.height), (1920, 1080));
        assert!(meta.has_audio);
        assert_eq!(meta.rotation, 0);
    }

    #[test]
    fn probe_swaps_dimensions_for_quarter_turn_rotation() {
        let meta = parse_probe_document(&probe_doc(1920, 1080, Some(-90))).expect("parse probe");
        assert_eq!(meta.rotation, 270);
        assert_eq!((meta.width, meta.height), (1080, 1920));

        let meta = parse_probe_document(&probe_doc(1920, 1080, Some(180))).expect("parse probe");
        assert_eq!(meta.rotation, 180);
        assert_eq!((meta.width, meta.height), (1920, 1080));
    }

    #[test]
    fn probe_estimates_frame_count_from_duration_when_missing() {
        let doc = json!({
            "streams": [{
                "codec_type": "video",
                "r_frame_rate": "30/1",
                "width": 640,
                "height": 480,
            }],
            "format": {"duration": "3.333"}
        });
        let meta = parse_probe_document(&doc).expect("parse probe");
        assert_eq!(meta.frame_count, 100);
        assert!(!meta.has_audio);
    }

    #[test]
    fn scan_frame_set_rejects_gaps() {
        let dir = tempfile::tempdir().expect("temp dir");
        write_test_png(&dir.path().join("frame_000001.png"), 4, 2);
        write_test_png(&dir.path().join("frame_000003.png"), 4, 2);
        let err = scan_frame_set(dir.path()).expect_err("gap must fail");
        assert!(err.to_string().contains("not contiguous"));
    }

    #[test]
    fn scan_frame_set_reads_count_and_dimensions() {
        let dir = tempfile::tempdir().expect("temp dir");
        for i in 1..=3u64 {
            write_test_png(&dir.path().join(format!("frame_{i:06}.png")), 4, 2);
        }
        let frames = scan_frame_set(dir.path()).expect("scan frames");
        assert_eq!(frames.count, 3);
        assert_eq!((frames.width, frames.height), (4, 2));
        assert_eq!(
            frames.frame_path(2).file_name().unwrap().to_string_lossy(),
            "frame_000002.png"
        );
    }

    #[cfg(unix)]
    #[test]
    fn assemble_falls_back_to_software_when_hardware_stubs_out() {
        use crate::vastup_core::test_support::{write_mock_tool, write_test_frames};

        let dir = tempfile::tempdir().expect("temp dir");
        let frames_dir = dir.path().join("frames");
        write_test_frames(&frames_dir, 2, 4, 2);
        let frames = scan_frame_set(&frames_dir).expect("scan frames");
        let output = dir.path().join("out.mp4");

        // Mock ffmpeg: the hardware encoder writes a tiny metadata stub
        // (the classic nvenc failure mode), the software encoder writes a
        // healthy file. The output path is the last argument.
        let body = r#"
out=""
hw=0
for arg in "$@"; do
  [ "$arg" = "h264_nvenc" ] && hw=1
  out="$arg"
done
if [ "$hw" = "1" ]; then
  head -c 1024 /dev/zero > "$out"
else
  head -c 65536 /dev/zero > "$out"
fi
exit 0
"#;
        let ffmpeg = write_mock_tool(dir.path(), "mock-ffmpeg", body);

        let encoder = assemble(
            &ffmpeg,
            &frames,
            Fps::from_int(24),
            None,
            &output,
            false,
            &Cancel::new(),
        )
        .expect("assemble with fallback");
        assert_eq!(encoder, EncoderUsed::Software);
        assert!(fs::metadata(&output).unwrap().len() >= MIN_OUTPUT_BYTES);
    }

    #[cfg(unix)]
    #[test]
    fn assemble_fails_when_even_software_output_is_undersized() {
        use crate::vastup_core::test_support::{write_mock_tool, write_test_frames};

        let dir = tempfile::tempdir().expect("temp dir");
        let frames_dir = dir.path().join("frames");
        write_test_frames(&frames_dir, 2, 4, 2);
        let frames = scan_frame_set(&frames_dir).expect("scan frames");
        let output = dir.path().join("out.mp4");

        let body = r#"
out=""
for arg in "$@"; do out="$arg"; done
head -c 100 /dev/zero > "$out"
exit 0
"#;
        let ffmpeg = write_mock_tool(dir.path(), "mock-ffmpeg-stub", body);

        let err = assemble(
            &ffmpeg,
            &frames,
            Fps::from_int(24),
            None,
            &output,
            true,
            &Cancel::new(),
        )
        .expect_err("undersized output must fail");
        assert!(err.to_string().contains("undersized"));
    }

    #[cfg(unix)]
    #[test]
    fn force_software_skips_the_hardware_attempt() {
        use crate::vastup_core::test_support::{write_mock_tool, write_test_frames};

        let dir = tempfile::tempdir().expect("temp dir");
        let frames_dir = dir.path().join("frames");
        write_test_frames(&frames_dir, 2, 4, 2);
        let frames = scan_frame_set(&frames_dir).expect("scan frames");
        let output = dir.path().join("out.mp4");

        // Mock ffmpeg that records each encoder choice it sees.
        let log = dir.path().join("calls.log");
        let body = format!(
            r#"
out=""
for arg in "$@"; do
  case "$arg" in
    h264_nvenc|libx264) echo "$arg" >> "{log}" ;;
  esac
  out="$arg"
done
head -c 65536 /dev/zero > "$out"
exit 0
"#,
            log = log.display()
        );
        let ffmpeg = write_mock_tool(dir.path(), "mock-ffmpeg-forced", &body);

        let encoder = assemble(
            &ffmpeg,
            &frames,
            Fps::from_int(30),
            None,
            &output,
            true,
            &Cancel::new(),
        )
        .expect("forced software assemble");
        assert_eq!(encoder, EncoderUsed::Software);
        let calls = fs::read_to_string(&log).expect("calls log");
        assert_eq!(calls.trim(), "libx264");
    }
}
