//! Shared helpers for unit tests: synthetic frames and mock tool binaries.

use std::fs;
use std::path::{Path, PathBuf};

/// Write a solid-black 8-bit RGB PNG of the given dimensions.
pub(crate) fn write_test_png(path: &Path, width: u32, height: u32) {
    let file = fs::File::create(path).expect("create png");
    let mut encoder = png::Encoder::new(file, width, height);
    encoder.set_color(png::ColorType::Rgb);
    encoder.set_depth(png::BitDepth::Eight);
    let mut writer = encoder.write_header().expect("png header");
    let data = vec![0u8; (width * height * 3) as usize];
    writer.write_image_data(&data).expect("png data");
}

/// Write a frame sequence `frame_000001.png ..= frame_<count>.png`.
pub(crate) fn write_test_frames(dir: &Path, count: u64, width: u32, height: u32) {
    fs::create_dir_all(dir).expect("create frame dir");
    for index in 1..=count {
        write_test_png(&dir.join(format!("frame_{index:06}.png")), width, height);
    }
}

/// Install an executable shell stub at `dir/<name>` with the given body.
/// Unix-only, like the workers this crate deploys to.
#[cfg(unix)]
pub(crate) fn write_mock_tool(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    {
        let mut file = fs::File::create(&path).expect("create mock tool");
        writeln!(file, "#!/bin/sh").expect("write shebang");
        writeln!(file, "{body}").expect("write body");
    }
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod mock tool");
    path
}
