//! Scenario checks tying the fps rule, the frame-count law, and the
//! dimension law together the way a whole job exercises them.

use crate::vastup_core::domain::{Fps, Job, ProcessingMode, StageStrategy};
use crate::vastup_core::enhance::expected_interp_count;

fn job(mode: ProcessingMode, scale: Option<f64>, factor: Option<u32>) -> Job {
    Job {
        job_id: "scenario".to_string(),
        input_key: "input/clip.mp4".to_string(),
        output_key: "output/clip.mp4".to_string(),
        mode,
        scale,
        interp_factor: factor,
        strategy: (mode == ProcessingMode::Both).then(StageStrategy::default),
        target_fps_override: None,
    }
}

#[test]
fn interpolation_preserves_duration_at_doubled_fps() {
    // 145 frames at 24 fps, interpolated 2x.
    let input_frames: u64 = 145;
    let original = Fps::from_int(24);
    let job = job(ProcessingMode::Interp, None, Some(2));

    let output_frames = expected_interp_count(input_frames, 2);
    assert_eq!(output_frames, 289);

    let target = job.target_fps(original);
    assert_eq!(target, Fps::from_int(48));

    let input_duration = input_frames as f64 / original.as_f64();
    let output_duration = output_frames as f64 / target.as_f64();
    assert!((output_duration - 6.02).abs() < 0.01);
    // Durations match within one frame period.
    assert!((output_duration - input_duration).abs() <= 1.0 / target.as_f64());
}

#[test]
fn upscaling_changes_dimensions_but_not_timing() {
    // 100 frames at 30 fps, 640x480, upscaled 2x.
    let job = job(ProcessingMode::Upscale, Some(2.0), None);
    let scale = job.scale.unwrap();

    let (width, height) = (640.0 * scale, 480.0 * scale);
    assert_eq!((width as u32, height as u32), (1280, 960));

    let target = job.target_fps(Fps::from_int(30));
    assert_eq!(target, Fps::from_int(30));
    let duration = 100.0 / target.as_f64();
    assert!((duration - 3.33).abs() < 0.01);
}

#[test]
fn combined_mode_multiplies_fps_once_and_scales_dimensions_once() {
    // 60 frames at 24 fps, 1280x720, interp 2x then upscale 2x.
    let job = job(ProcessingMode::Both, Some(2.0), Some(2));
    assert_eq!(job.strategy, Some(StageStrategy::InterpThenUpscale));

    let interpolated = expected_interp_count(60, 2);
    assert_eq!(interpolated, 119);
    // Upscaling leaves the count alone; only dimensions change.
    let (width, height) = (1280 * 2, 720 * 2);
    assert_eq!((width, height), (2560, 1440));

    let target = job.target_fps(Fps::from_int(24));
    assert_eq!(target, Fps::from_int(48));
    let duration = interpolated as f64 / target.as_f64();
    assert!((duration - 2.48).abs() < 0.01);

    // Either strategy order must land on the same final fps.
    let swapped = Job {
        strategy: Some(StageStrategy::UpscaleThenInterp),
        ..job
    };
    assert_eq!(swapped.target_fps(Fps::from_int(24)), Fps::from_int(48));
}
