use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Result, bail};
use once_cell::sync::Lazy;

use crate::vastup_core::process::{Cancel, ProcessSpec};
use crate::vastup_core::settings::ToolSettings;

/// External executables the worker drives. The codec tools come from the
/// base image or PATH; the model runners are installed by the bootstrap
/// script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolKind {
    Ffmpeg,
    Ffprobe,
    Upscaler,
    Interpolator,
}

impl ToolKind {
    fn default_program(self) -> &'static str {
        match self {
            ToolKind::Ffmpeg => "ffmpeg",
            ToolKind::Ffprobe => "ffprobe",
            ToolKind::Upscaler => "realesrgan-ncnn-vulkan",
            ToolKind::Interpolator => "rife-ncnn-vulkan",
        }
    }

    fn configured_path(self, settings: &ToolSettings) -> Option<&str> {
        let raw = match self {
            ToolKind::Ffmpeg => settings.ffmpeg_path.as_deref(),
            ToolKind::Ffprobe => settings.ffprobe_path.as_deref(),
            ToolKind::Upscaler => settings.upscaler_path.as_deref(),
            ToolKind::Interpolator => settings.interpolator_path.as_deref(),
        };
        raw.map(str::trim).filter(|p| !p.is_empty())
    }

    /// Flag that makes the tool print version/usage and exit quickly. The
    /// ncnn runners have no version flag; `-h` exits immediately instead.
    fn verify_flag(self) -> &'static str {
        match self {
            ToolKind::Ffmpeg | ToolKind::Ffprobe => "-version",
            ToolKind::Upscaler | ToolKind::Interpolator => "-h",
        }
    }
}

/// Per-process cache of verified tool paths. Resolution involves spawning
/// the binary once; every later stage reuses the cached result.
static RESOLVED_TOOLS: Lazy<Mutex<HashMap<ToolKind, PathBuf>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// The cache only ever holds already-verified paths, so it stays valid
/// even if a thread panicked mid-insert; recover the guard instead of
/// wedging every later stage behind a poisoned lock.
fn tool_cache() -> MutexGuard<'static, HashMap<ToolKind, PathBuf>> {
    RESOLVED_TOOLS.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resolve the executable for `kind`: explicit configured path first, then
/// a bare program name left to PATH lookup. Either way the binary must
/// prove it runs before the path is cached and returned.
pub fn resolve_tool(kind: ToolKind, settings: &ToolSettings) -> Result<PathBuf> {
    {
        let cache = tool_cache();
        if let Some(path) = cache.get(&kind) {
            return Ok(path.clone());
        }
    }

    let candidate: PathBuf = match kind.configured_path(settings) {
        Some(explicit) => {
            let path = PathBuf::from(explicit);
            if !path.is_file() {
                bail!(
                    "configured {kind:?} path {} does not exist",
                    path.display()
                );
            }
            path
        }
        None => PathBuf::from(kind.default_program()),
    };

    if !verify_tool_binary(&candidate, kind) {
        bail!(
            "{kind:?} binary {} is not runnable on this host",
            candidate.display()
        );
    }

    tool_cache().insert(kind, candidate.clone());
    Ok(candidate)
}

/// Spawn the binary with its cheap verification flag and report whether it
/// executed at all. Exit status is deliberately ignored: `-h` style flags
/// exit non-zero on some builds, and all we need is proof of execution.
pub fn verify_tool_binary(path: &Path, kind: ToolKind) -> bool {
    let spec = ProcessSpec::new(path).arg(kind.verify_flag());
    crate::vastup_core::process::run(&spec, &Cancel::new(), None).is_ok()
}
