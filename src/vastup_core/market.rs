use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{Value, json};

use crate::vastup_core::domain::{Instance, InstanceStatus, Offer};
use crate::vastup_core::error::MarketError;
use crate::vastup_core::settings::OfferPreset;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Numeric offer filters sent to the marketplace search endpoint.
#[derive(Debug, Clone)]
pub struct OfferFilter {
    pub min_vram_gb: f64,
    pub max_price_per_hour: f64,
    pub min_reliability: f64,
    pub gpu_name_filter: Option<String>,
}

impl From<&OfferPreset> for OfferFilter {
    fn from(preset: &OfferPreset) -> Self {
        Self {
            min_vram_gb: preset.min_vram_gb,
            max_price_per_hour: preset.max_price_per_hour,
            min_reliability: preset.min_reliability,
            gpu_name_filter: preset.gpu_name_filter.clone(),
        }
    }
}

/// A launch command that is guaranteed to be shell-wrapped.
///
/// The container runtime treats a bare command string as an executable
/// path, so the only way to construct this type is through [`shell`],
/// which produces `bash -lc '<script>'` with the script single-quoted.
///
/// [`shell`]: LaunchCommand::shell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand(String);

impl LaunchCommand {
    pub fn shell(script: &str) -> Self {
        let quoted = format!("'{}'", script.replace('\'', r"'\''"));
        Self(format!("bash -lc {quoted}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Everything needed to rent one worker.
#[derive(Debug, Clone)]
pub struct CreateInstanceRequest {
    pub offer_id: u64,
    pub image: String,
    pub env: Vec<(String, String)>,
    pub launch_command: LaunchCommand,
    pub disk_gb: f64,
}

/// The marketplace operations the orchestrator and watcher depend on.
/// The watcher takes this as a trait object so scenario tests can script
/// responses without a network.
pub trait MarketApi: Send + Sync {
    fn search_offers(&self, filter: &OfferFilter) -> Result<Vec<Offer>, MarketError>;
    fn create_instance(&self, request: &CreateInstanceRequest) -> Result<u64, MarketError>;
    fn get_instance(&self, instance_id: u64) -> Result<Option<Instance>, MarketError>;
    fn get_logs(&self, instance_id: u64, tail_lines: u32) -> Result<String, MarketError>;
    fn stop_instance(&self, instance_id: u64) -> Result<(), MarketError>;
    fn destroy_instance(&self, instance_id: u64) -> Result<(), MarketError>;
}

/// Blocking HTTP client for the Vast.ai-shaped marketplace API.
pub struct VastMarketClient {
    http: reqwest::blocking::Client,
    base_url: String,
    api_key: String,
}

impl VastMarketClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build spot-market HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}?api_key={}", self.base_url, path, self.api_key)
    }

    fn send(&self, request: reqwest::blocking::RequestBuilder) -> Result<Value, MarketError> {
        let response = request
            .send()
            .map_err(|e| MarketError::Transient(e.to_string()))?;
        let status = response.status();
        if status.as_u16() == 429 {
            return Err(MarketError::RateLimited);
        }
        if status.is_server_error() {
            return Err(MarketError::Transient(format!("HTTP {status}")));
        }
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(MarketError::Permanent(format!("HTTP {status}: {body}")));
        }
        response
            .json::<Value>()
            .map_err(|e| MarketError::Transient(format!("invalid JSON response: {e}")))
    }
}

/// Build the search query body. GPU RAM is filtered in MB on the wire.
fn search_body(filter: &OfferFilter) -> Value {
    let mut query = json!({
        "rentable": {"eq": true},
        "gpu_ram": {"gte": filter.min_vram_gb * 1024.0},
        "dph_total": {"lte": filter.max_price_per_hour},
        "reliability2": {"gte": filter.min_reliability},
        "order": [["dph_total", "asc"]],
        "type": "on-demand"
    });
    if let Some(name) = &filter.gpu_name_filter {
        query["gpu_name"] = json!({"eq": name});
    }
    json!({"q": query})
}

fn parse_offer(raw: &Value) -> Option<Offer> {
    Some(Offer {
        offer_id: raw.get("id")?.as_u64()?,
        gpu_model: raw.get("gpu_name")?.as_str()?.to_string(),
        gpu_vram_gb: raw.get("gpu_ram").and_then(Value::as_f64).unwrap_or(0.0) / 1024.0,
        price_per_hour: raw.get("dph_total").and_then(Value::as_f64)?,
        reliability: raw
            .get("reliability2")
            .or_else(|| raw.get("reliability"))
            .and_then(Value::as_f64)
            .unwrap_or(0.0),
    })
}

/// Cheapest first; among equal prices, the more reliable host wins.
fn sort_offers(offers: &mut [Offer]) {
    offers.sort_by(|a, b| {
        a.price_per_hour
            .total_cmp(&b.price_per_hour)
            .then_with(|| b.reliability.total_cmp(&a.reliability))
    });
}

fn parse_instance(raw: &Value) -> Option<Instance> {
    Some(Instance {
        instance_id: raw.get("id")?.as_u64()?,
        status: raw
            .get("actual_status")
            .and_then(Value::as_str)
            .map(InstanceStatus::parse)
            .unwrap_or(InstanceStatus::Creating),
        gpu_model: raw
            .get("gpu_name")
            .and_then(Value::as_str)
            .map(str::to_string),
        price_per_hour: raw.get("dph_total").and_then(Value::as_f64),
    })
}

impl MarketApi for VastMarketClient {
    fn search_offers(&self, filter: &OfferFilter) -> Result<Vec<Offer>, MarketError> {
        let body = self.send(
            self.http
                .post(self.url("/bundles/"))
                .json(&search_body(filter)),
        )?;
        let mut offers: Vec<Offer> = body
            .get("offers")
            .and_then(Value::as_array)
            .map(|raw| raw.iter().filter_map(parse_offer).collect())
            .unwrap_or_default();
        sort_offers(&mut offers);
        Ok(offers)
    }

    fn create_instance(&self, request: &CreateInstanceRequest) -> Result<u64, MarketError> {
        let env: serde_json::Map<String, Value> = request
            .env
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        let body = json!({
            "client_id": "me",
            "image": request.image,
            "env": env,
            "onstart_cmd": request.launch_command.as_str(),
            "disk": request.disk_gb,
        });
        let response = self.send(
            self.http
                .put(self.url(&format!("/asks/{}/", request.offer_id)))
                .json(&body),
        )?;
        response
            .get("new_contract")
            .and_then(Value::as_u64)
            .ok_or_else(|| {
                MarketError::Permanent(format!(
                    "create_instance response missing new_contract: {response}"
                ))
            })
    }

    fn get_instance(&self, instance_id: u64) -> Result<Option<Instance>, MarketError> {
        let response = match self.send(
            self.http
                .get(self.url(&format!("/instances/{instance_id}/"))),
        ) {
            Ok(response) => response,
            Err(MarketError::Permanent(msg)) if msg.starts_with("HTTP 404") => {
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        Ok(response
            .get("instances")
            .filter(|v| !v.is_null())
            .and_then(parse_instance))
    }

    fn get_logs(&self, instance_id: u64, tail_lines: u32) -> Result<String, MarketError> {
        let response = self.send(
            self.http
                .put(self.url(&format!("/instances/request_logs/{instance_id}/")))
                .json(&json!({"tail": tail_lines.to_string()})),
        )?;
        let log_url = response
            .get("result_url")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                MarketError::Transient(format!("log request missing result_url: {response}"))
            })?;

        // The provider stages the tail at a separate URL that may lag the
        // request by a moment; a miss is transient and the watcher's next
        // tick will pick it up.
        let log_response = self
            .http
            .get(log_url)
            .send()
            .map_err(|e| MarketError::Transient(e.to_string()))?;
        if !log_response.status().is_success() {
            return Err(MarketError::Transient(format!(
                "log tail not ready yet (HTTP {})",
                log_response.status()
            )));
        }
        log_response
            .text()
            .map_err(|e| MarketError::Transient(e.to_string()))
    }

    fn stop_instance(&self, instance_id: u64) -> Result<(), MarketError> {
        self.send(
            self.http
                .put(self.url(&format!("/instances/{instance_id}/")))
                .json(&json!({"state": "stopped"})),
        )?;
        Ok(())
    }

    fn destroy_instance(&self, instance_id: u64) -> Result<(), MarketError> {
        self.send(
            self.http
                .delete(self.url(&format!("/instances/{instance_id}/"))),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn launch_command_is_always_shell_wrapped() {
        let cmd = LaunchCommand::shell("cd /workspace && echo 'hi there'");
        assert!(cmd.as_str().starts_with("bash -lc '"));
        // The embedded single quotes must be escaped so the remote shell
        // sees the script intact.
        assert!(cmd.as_str().contains(r"echo '\''hi there'\''"));
    }

    #[test]
    fn search_body_carries_all_numeric_filters() {
        let filter = OfferFilter {
            min_vram_gb: 12.0,
            max_price_per_hour: 0.4,
            min_reliability: 0.95,
            gpu_name_filter: Some("RTX_3090".to_string()),
        };
        let body = search_body(&filter);
        assert_eq!(body["q"]["gpu_ram"]["gte"], json!(12288.0));
        assert_eq!(body["q"]["dph_total"]["lte"], json!(0.4));
        assert_eq!(body["q"]["reliability2"]["gte"], json!(0.95));
        assert_eq!(body["q"]["gpu_name"]["eq"], json!("RTX_3090"));

        let without_name = search_body(&OfferFilter {
            gpu_name_filter: None,
            ..filter
        });
        assert!(without_name["q"].get("gpu_name").is_none());
    }

    #[test]
    fn offers_sort_by_price_then_reliability() {
        let mut offers = vec![
            Offer {
                offer_id: 1,
                gpu_model: "A".into(),
                gpu_vram_gb: 24.0,
                price_per_hour: 0.30,
                reliability: 0.98,
            },
            Offer {
                offer_id: 2,
                gpu_model: "B".into(),
                gpu_vram_gb: 24.0,
                price_per_hour: 0.20,
                reliability: 0.90,
            },
            Offer {
                offer_id: 3,
                gpu_model: "C".into(),
                gpu_vram_gb: 24.0,
                price_per_hour: 0.20,
                reliability: 0.99,
            },
        ];
        sort_offers(&mut offers);
        let ids: Vec<u64> = offers.iter().map(|o| o.offer_id).collect();
        assert_eq!(ids, vec![3, 2, 1]);
    }

    #[test]
    fn parse_offer_converts_ram_to_gb() {
        let raw = json!({
            "id": 99,
            "gpu_name": "RTX 4090",
            "gpu_ram": 24576.0,
            "dph_total": 0.42,
            "reliability2": 0.97
        });
        let offer = parse_offer(&raw).expect("parse offer");
        assert_eq!(offer.offer_id, 99);
        assert!((offer.gpu_vram_gb - 24.0).abs() < f64::EPSILON);
        assert!((offer.reliability - 0.97).abs() < f64::EPSILON);
    }

    #[test]
    fn parse_instance_tolerates_missing_status() {
        let raw = json!({"id": 7});
        let instance = parse_instance(&raw).expect("parse instance");
        assert_eq!(instance.instance_id, 7);
        assert_eq!(instance.status, InstanceStatus::Creating);
    }
}
