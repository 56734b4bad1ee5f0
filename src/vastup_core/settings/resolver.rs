use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::warn;

use super::AppSettings;
use super::io::read_json_file;

const REMOTE_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Env fallback for the remote config URL. The controller bakes this into
/// rented instances so a worker started bare (no local baseline file) still
/// resolves the same document the fleet was planned from.
pub const CONFIG_URL_ENV: &str = "VASTUP_CONFIG_URL";

/// Deep-merge `overlay` into `base`.
///
/// Mappings merge key by key, recursively. Everything else (scalars and
/// lists alike) is replaced wholesale by the overlay value. Keys present
/// only in the base survive untouched, which is what lets unknown config
/// keys ride through a partial remote document.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => {
                        base_map.insert(key, overlay_value);
                    }
                }
            }
        }
        (base_slot, overlay_value) => *base_slot = overlay_value,
    }
}

/// Fetch the remote config document and parse it as JSON first, then YAML.
///
/// The document is a single mapping; both encodings are accepted because the
/// operator-side tooling has historically produced either.
pub fn fetch_remote_document(url: &str) -> Result<Value> {
    let client = reqwest::blocking::Client::builder()
        .timeout(REMOTE_FETCH_TIMEOUT)
        .build()
        .context("failed to build HTTP client for remote config")?;
    let response = client
        .get(url)
        .send()
        .with_context(|| format!("failed to fetch remote config from {url}"))?
        .error_for_status()
        .with_context(|| format!("remote config fetch returned an error status for {url}"))?;
    let text = response
        .text()
        .context("failed to read remote config body")?;

    parse_document(&text)
}

fn parse_document(text: &str) -> Result<Value> {
    match serde_json::from_str::<Value>(text) {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(other) => anyhow::bail!("remote config must be a mapping, got {other}"),
        Err(json_err) => match serde_yaml::from_str::<Value>(text) {
            Ok(value @ Value::Object(_)) => Ok(value),
            Ok(other) => anyhow::bail!("remote config must be a mapping, got {other}"),
            Err(yaml_err) => anyhow::bail!(
                "remote config parses as neither JSON ({json_err}) nor YAML ({yaml_err})"
            ),
        },
    }
}

/// Resolve the effective settings for this run.
///
/// Starts from the local baseline file (or an empty mapping when none is
/// given), deep-merges the remote document referenced by `config_url` when
/// one is configured, then deserializes, normalizes, and validates. A remote
/// fetch or parse failure is logged and the baseline is used as-is; config
/// resolution never fails a run for remote reasons.
pub fn resolve_settings(baseline_path: Option<&Path>) -> Result<AppSettings> {
    let baseline = match baseline_path {
        Some(path) => read_json_file::<Value>(path)
            .with_context(|| format!("failed to load baseline config {}", path.display()))?,
        None => {
            let mut map = serde_json::Map::new();
            if let Ok(url) = std::env::var(CONFIG_URL_ENV)
                && !url.trim().is_empty()
            {
                map.insert("config_url".to_string(), Value::String(url));
            }
            Value::Object(map)
        }
    };
    resolve_settings_from_value(baseline)
}

/// Same as [`resolve_settings`] but starting from an in-memory baseline.
pub fn resolve_settings_from_value(mut baseline: Value) -> Result<AppSettings> {
    let config_url = baseline
        .get("config_url")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(str::to_string);

    if let Some(url) = config_url {
        match fetch_remote_document(&url) {
            Ok(remote) => deep_merge(&mut baseline, remote),
            Err(err) => {
                warn!("proceeding with baseline config; remote config unavailable: {err:#}");
            }
        }
    }

    let mut settings: AppSettings = serde_json::from_value(baseline)
        .context("resolved config document does not match the expected shape")?;
    settings.normalize();
    settings.validate()?;
    Ok(settings)
}
