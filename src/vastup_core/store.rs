use std::fs;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use s3::Bucket;
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::region::Region;

use crate::vastup_core::error::StoreError;
use crate::vastup_core::process::Cancel;
use crate::vastup_core::settings::UploadSettings;

/// One listed object.
#[derive(Debug, Clone)]
pub struct ObjectEntry {
    pub key: String,
    pub size: u64,
    pub mtime: Option<String>,
}

/// Receipt for a completed upload.
#[derive(Debug, Clone)]
pub struct UploadReceipt {
    pub size: u64,
    pub etag: Option<String>,
}

/// Progress callback: (bytes sent so far, total bytes).
pub type ProgressFn<'a> = &'a (dyn Fn(u64, u64) + Sync);

/// Connection parameters for the S3-compatible store. Credentials come from
/// the environment (or CLI flags), never from the config document.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub bucket: String,
    pub endpoint: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
}

impl StoreConfig {
    pub fn from_env() -> Result<Self> {
        let get = |key: &str| {
            std::env::var(key).with_context(|| format!("missing required environment variable {key}"))
        };
        Ok(Self {
            bucket: get("VASTUP_S3_BUCKET")?,
            endpoint: get("VASTUP_S3_ENDPOINT")?,
            region: std::env::var("VASTUP_S3_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
            access_key: get("VASTUP_S3_ACCESS_KEY")?,
            secret_key: get("VASTUP_S3_SECRET_KEY")?,
        })
    }

    /// Environment overlay handed to rented instances so the worker-side
    /// client can reach the same store.
    pub fn as_worker_env(&self) -> Vec<(String, String)> {
        vec![
            ("VASTUP_S3_BUCKET".to_string(), self.bucket.clone()),
            ("VASTUP_S3_ENDPOINT".to_string(), self.endpoint.clone()),
            ("VASTUP_S3_REGION".to_string(), self.region.clone()),
            ("VASTUP_S3_ACCESS_KEY".to_string(), self.access_key.clone()),
            ("VASTUP_S3_SECRET_KEY".to_string(), self.secret_key.clone()),
        ]
    }
}

/// Retry schedule for transient store errors.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 4,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &UploadSettings) -> Self {
        Self {
            attempts: settings.retry_attempts.max(1),
            base_delay: Duration::from_secs(2),
        }
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        // attempt is 1-based; delays double per failed attempt.
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// Run `op`, retrying transient failures per the policy. Permanent errors
/// and cancellation abort immediately.
pub fn retry_transient<T>(
    policy: RetryPolicy,
    cancel: &Cancel,
    mut op: impl FnMut() -> Result<T, StoreError>,
) -> Result<T, StoreError> {
    let mut last = None;
    for attempt in 1..=policy.attempts {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() => {
                tracing::warn!("transient store error (attempt {attempt}/{}): {err}", policy.attempts);
                last = Some(err);
                if attempt < policy.attempts
                    && !cancel.sleep(policy.delay_for_attempt(attempt))
                {
                    break;
                }
            }
            Err(err) => return Err(err),
        }
    }
    Err(StoreError::RetriesExhausted {
        attempts: policy.attempts,
        last: last.map(|e| e.to_string()).unwrap_or_else(|| "cancelled".to_string()),
    })
}

fn classify(err: S3Error) -> StoreError {
    match err {
        S3Error::HttpFailWithBody(code, body) => {
            if code == 408 || code == 429 || code >= 500 {
                StoreError::Transient(format!("HTTP {code}: {body}"))
            } else {
                StoreError::Permanent(format!("HTTP {code}: {body}"))
            }
        }
        S3Error::Credentials(err) => StoreError::Permanent(format!("credentials: {err}")),
        other => StoreError::Transient(other.to_string()),
    }
}

/// Reader adapter that reports cumulative bytes to a progress callback.
struct CountingReader<'a, R> {
    inner: R,
    sent: u64,
    total: u64,
    progress: Option<ProgressFn<'a>>,
}

impl<R: Read> Read for CountingReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.sent += n as u64;
        if let Some(progress) = self.progress {
            progress(self.sent, self.total);
        }
        Ok(n)
    }
}

/// S3-compatible client with internal transient retry.
///
/// Uploads are at-least-once at the transport level; callers get
/// idempotence by using deterministic keys, so re-putting an existing key
/// is normal operation rather than an error.
pub struct ObjectStore {
    bucket: Box<Bucket>,
    bucket_name: String,
    endpoint: String,
    policy: RetryPolicy,
    multipart_threshold: u64,
}

impl ObjectStore {
    pub fn connect(config: &StoreConfig, upload: &UploadSettings) -> Result<Self> {
        let credentials = Credentials::new(
            Some(&config.access_key),
            Some(&config.secret_key),
            None,
            None,
            None,
        )
        .context("invalid object-store credentials")?;
        let region = Region::Custom {
            region: config.region.clone(),
            endpoint: config.endpoint.clone(),
        };
        let bucket = Bucket::new(&config.bucket, region, credentials)
            .context("failed to configure object-store bucket")?
            .with_path_style();
        Ok(Self {
            bucket: Box::new(bucket),
            bucket_name: config.bucket.clone(),
            endpoint: config.endpoint.clone(),
            policy: RetryPolicy::from_settings(upload),
            multipart_threshold: upload.multipart_threshold_mb * 1024 * 1024,
        })
    }

    pub fn bucket_name(&self) -> &str {
        &self.bucket_name
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// List all objects under `prefix`.
    pub fn list(&self, prefix: &str, cancel: &Cancel) -> Result<Vec<ObjectEntry>, StoreError> {
        retry_transient(self.policy, cancel, || {
            let pages = self
                .bucket
                .list(prefix.to_string(), None)
                .map_err(classify)?;
            let mut entries = Vec::new();
            for page in pages {
                for object in page.contents {
                    entries.push(ObjectEntry {
                        key: object.key,
                        size: object.size,
                        mtime: Some(object.last_modified),
                    });
                }
            }
            Ok(entries)
        })
    }

    /// True when `key` exists in the bucket.
    pub fn exists(&self, key: &str, cancel: &Cancel) -> Result<bool, StoreError> {
        let entries = self.list(key, cancel)?;
        Ok(entries.iter().any(|entry| entry.key == key))
    }

    /// Upload a local file to `key`. Files at or above the multipart
    /// threshold stream through the multipart path; smaller files go up in
    /// one put.
    pub fn upload(
        &self,
        path: &Path,
        key: &str,
        cancel: &Cancel,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<UploadReceipt, StoreError> {
        let total = fs::metadata(path)
            .map_err(|e| StoreError::Permanent(format!("cannot stat {}: {e}", path.display())))?
            .len();

        retry_transient(self.policy, cancel, || {
            if total >= self.multipart_threshold {
                let file = fs::File::open(path).map_err(|e| {
                    StoreError::Permanent(format!("cannot open {}: {e}", path.display()))
                })?;
                let mut reader = CountingReader {
                    inner: file,
                    sent: 0,
                    total,
                    progress,
                };
                let status = self
                    .bucket
                    .put_object_stream(&mut reader, key)
                    .map_err(classify)?;
                if !(200..300).contains(&status) {
                    return Err(StoreError::Transient(format!(
                        "multipart upload of {key} returned HTTP {status}"
                    )));
                }
                Ok(UploadReceipt {
                    size: total,
                    etag: None,
                })
            } else {
                let body = fs::read(path).map_err(|e| {
                    StoreError::Permanent(format!("cannot read {}: {e}", path.display()))
                })?;
                let response = self.bucket.put_object(key, &body).map_err(classify)?;
                let status = response.status_code();
                if !(200..300).contains(&status) {
                    return Err(StoreError::Transient(format!(
                        "upload of {key} returned HTTP {status}"
                    )));
                }
                if let Some(progress) = progress {
                    progress(total, total);
                }
                let etag = response
                    .headers()
                    .get("etag")
                    .map(|value| value.trim_matches('"').to_string());
                Ok(UploadReceipt { size: total, etag })
            }
        })
    }

    /// Download `key` into `path`, creating parent directories.
    pub fn download(&self, key: &str, path: &Path, cancel: &Cancel) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                StoreError::Permanent(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        retry_transient(self.policy, cancel, || {
            let mut file = fs::File::create(path).map_err(|e| {
                StoreError::Permanent(format!("cannot create {}: {e}", path.display()))
            })?;
            let status = self
                .bucket
                .get_object_to_writer(key, &mut file)
                .map_err(classify)?;
            if !(200..300).contains(&status) {
                return Err(StoreError::Transient(format!(
                    "download of {key} returned HTTP {status}"
                )));
            }
            Ok(())
        })
    }

    /// Presigned GET URL for `key`, valid for `ttl_secs`.
    pub fn presign_get(&self, key: &str, ttl_secs: u32) -> Result<String, StoreError> {
        self.bucket
            .presign_get(key, ttl_secs, None)
            .map_err(classify)
    }

    /// Public HTTPS URL for a finished object; this is the line the worker
    /// logs and the controller-side watcher scans for.
    pub fn public_url(&self, key: &str) -> String {
        let endpoint = self.endpoint.trim_end_matches('/');
        format!("{endpoint}/{}/{key}", self.bucket_name)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn retry_policy_doubles_per_attempt() {
        let policy = RetryPolicy {
            attempts: 4,
            base_delay: Duration::from_secs(2),
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(8));
    }

    #[test]
    fn retry_transient_retries_until_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            attempts: 5,
            base_delay: Duration::from_millis(1),
        };
        let result = retry_transient(policy, &Cancel::new(), || {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(StoreError::Transient("flaky".into()))
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn retry_transient_fails_fast_on_permanent_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_transient(RetryPolicy::default(), &Cancel::new(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Permanent("denied".into()))
        });
        assert!(matches!(result, Err(StoreError::Permanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn retry_transient_reports_exhaustion() {
        let policy = RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(1),
        };
        let result: Result<(), _> = retry_transient(policy, &Cancel::new(), || {
            Err(StoreError::Transient("still down".into()))
        });
        match result {
            Err(StoreError::RetriesExhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert!(last.contains("still down"));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[test]
    fn counting_reader_reports_cumulative_progress() {
        let seen = Mutex::new(Vec::new());
        let data = vec![7u8; 10];
        let callback = |sent: u64, total: u64| seen.lock().unwrap().push((sent, total));
        let mut reader = CountingReader {
            inner: &data[..],
            sent: 0,
            total: 10,
            progress: Some(&callback),
        };
        let mut buf = [0u8; 4];
        let mut consumed = 0;
        loop {
            let n = reader.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            consumed += n;
        }
        assert_eq!(consumed, 10);
        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.last().copied(), Some((10, 10)));
        assert!(seen.windows(2).all(|w| w[0].0 <= w[1].0));
    }
}
