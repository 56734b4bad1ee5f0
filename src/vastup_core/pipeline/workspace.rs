use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::vastup_core::domain::VideoMeta;

/// Job-scoped temporary directory on the worker.
///
/// Created at job start (clobbering any leftover from a crashed run of the
/// same job), deleted on success, retained with a diagnostics bundle on
/// failure.
pub struct Workspace {
    root: PathBuf,
    pub input_dir: PathBuf,
    pub frames_dir: PathBuf,
    pub interp_dir: PathBuf,
    pub upscale_dir: PathBuf,
    pub output_dir: PathBuf,
}

/// Per-stage record folded into result.json and the diagnostics bundle.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageReport {
    pub stage: String,
    pub elapsed_ms: u64,
    pub detail: String,
}

impl Workspace {
    pub fn create(base: &Path, job_id: &str) -> Result<Self> {
        let root = base.join(format!("job-{job_id}"));
        if root.exists() {
            fs::remove_dir_all(&root)
                .with_context(|| format!("failed to clear stale workspace {}", root.display()))?;
        }
        let workspace = Self {
            input_dir: root.join("input"),
            frames_dir: root.join("frames"),
            interp_dir: root.join("interp"),
            upscale_dir: root.join("upscale"),
            output_dir: root.join("output"),
            root,
        };
        for dir in [
            &workspace.input_dir,
            &workspace.frames_dir,
            &workspace.interp_dir,
            &workspace.upscale_dir,
            &workspace.output_dir,
        ] {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create workspace dir {}", dir.display()))?;
        }
        Ok(workspace)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Success path: the workspace has nothing left to say.
    pub fn remove(self) -> Result<()> {
        fs::remove_dir_all(&self.root)
            .with_context(|| format!("failed to remove workspace {}", self.root.display()))
    }

    /// Failure path: keep everything and add a diagnostics bundle beneath
    /// the root (stage reports, probe output, a file listing, the failure
    /// reason). Bundle-writing problems are logged, never propagated; the
    /// original failure is what matters.
    pub fn write_diagnostics(
        &self,
        failure: &str,
        stages: &[StageReport],
        probe: Option<&VideoMeta>,
    ) {
        let dir = self.root.join("diagnostics");
        if let Err(err) = fs::create_dir_all(&dir) {
            tracing::warn!("cannot create diagnostics dir: {err}");
            return;
        }

        let _ = fs::write(dir.join("failure.txt"), format!("{failure}\n"));
        if let Ok(body) = serde_json::to_string_pretty(stages) {
            let _ = fs::write(dir.join("stages.json"), body);
        }
        if let Some(probe) = probe
            && let Ok(body) = serde_json::to_string_pretty(probe)
        {
            let _ = fs::write(dir.join("probe.json"), body);
        }

        let mut listing = String::new();
        collect_filelist(&self.root, &self.root, &mut listing);
        let _ = fs::write(dir.join("filelist.txt"), listing);

        tracing::info!(
            "workspace retained for diagnostics at {}",
            self.root.display()
        );
    }
}

fn collect_filelist(root: &Path, dir: &Path, out: &mut String) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    let mut paths: Vec<PathBuf> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
    paths.sort();
    for path in paths {
        if path.is_dir() {
            collect_filelist(root, &path, out);
        } else {
            let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            let relative = path.strip_prefix(root).unwrap_or(&path);
            out.push_str(&format!("{}\t{size}\n", relative.display()));
        }
    }
}
