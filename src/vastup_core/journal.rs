use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::vastup_core::process::Cancel;
use crate::vastup_core::settings::{read_json_file, write_json_file};
use crate::vastup_core::store::ObjectStore;

/// Fixed filename under the worker workspace root. A single worker is the
/// only writer; updates go through atomic rename.
pub const JOURNAL_FILENAME: &str = "pending_upload.json";

/// On-disk marker recording a final upload that was attempted but never
/// confirmed. Present iff such an upload is outstanding; cleared only on
/// confirmed success.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PendingUploadRecord {
    pub file_path: PathBuf,
    pub bucket: String,
    pub key: String,
    pub endpoint: String,
    /// Number of failed delivery attempts so far. Monotonically increasing;
    /// at the configured ceiling the record is left in place for manual
    /// inspection and no longer retried automatically.
    pub attempts: u32,
}

impl PendingUploadRecord {
    pub fn should_auto_retry(&self, max_attempts: u32) -> bool {
        self.attempts < max_attempts
    }
}

pub struct UploadJournal {
    path: PathBuf,
}

impl UploadJournal {
    pub fn new(workspace_root: &Path) -> Self {
        Self {
            path: workspace_root.join(JOURNAL_FILENAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the outstanding record, if any. An unreadable journal is
    /// reported as absent (and logged); it will be overwritten by the next
    /// failed upload anyway.
    pub fn read(&self) -> Option<PendingUploadRecord> {
        if !self.path.exists() {
            return None;
        }
        match read_json_file::<PendingUploadRecord>(&self.path) {
            Ok(record) => Some(record),
            Err(err) => {
                tracing::warn!("ignoring unreadable pending-upload journal: {err:#}");
                None
            }
        }
    }

    pub fn write(&self, record: &PendingUploadRecord) -> Result<()> {
        write_json_file(&self.path, record)
    }

    pub fn clear(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

/// Worker-start recovery: re-attempt the recorded upload before any job
/// runs.
///
/// Success clears the journal. Failure increments `attempts`, rewrites the
/// record, and lets the primary job proceed anyway; it may succeed on its
/// own or regenerate the artifact. A record at the ceiling is skipped.
pub fn retry_pending_upload(
    journal: &UploadJournal,
    store: &ObjectStore,
    max_attempts: u32,
    cancel: &Cancel,
) {
    let Some(mut record) = journal.read() else {
        return;
    };
    if !record.should_auto_retry(max_attempts) {
        tracing::warn!(
            "pending upload for {} has reached {} attempts; leaving journal for manual handling",
            record.key,
            record.attempts
        );
        return;
    }
    if !record.file_path.exists() {
        tracing::warn!(
            "pending upload source {} no longer exists; clearing journal",
            record.file_path.display()
        );
        let _ = journal.clear();
        return;
    }

    tracing::info!(
        "retrying pending upload of {} to {} (attempt {})",
        record.file_path.display(),
        record.key,
        record.attempts + 1
    );
    match store.upload(&record.file_path, &record.key, cancel, None) {
        Ok(receipt) => {
            tracing::info!(
                "pending upload of {} delivered ({} bytes)",
                record.key,
                receipt.size
            );
            if let Err(err) = journal.clear() {
                tracing::warn!("failed to clear pending-upload journal: {err:#}");
            }
        }
        Err(err) => {
            record.attempts += 1;
            tracing::warn!(
                "pending upload of {} failed again (attempt {}): {err}",
                record.key,
                record.attempts
            );
            if let Err(err) = journal.write(&record) {
                tracing::warn!("failed to rewrite pending-upload journal: {err:#}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn record(attempts: u32) -> PendingUploadRecord {
        PendingUploadRecord {
            file_path: PathBuf::from("/work/output/final.mp4"),
            bucket: "videos".to_string(),
            key: "out/final.mp4".to_string(),
            endpoint: "https://storage.example.com".to_string(),
            attempts,
        }
    }

    #[test]
    fn journal_round_trips_and_clears() {
        let dir = tempdir().expect("temp dir");
        let journal = UploadJournal::new(dir.path());
        assert!(journal.read().is_none());

        journal.write(&record(1)).expect("write journal");
        assert_eq!(journal.read(), Some(record(1)));

        journal.clear().expect("clear journal");
        assert!(journal.read().is_none());
        // Clearing an absent journal is a no-op, not an error.
        journal.clear().expect("clear twice");
    }

    #[test]
    fn unreadable_journal_reads_as_absent() {
        let dir = tempdir().expect("temp dir");
        let journal = UploadJournal::new(dir.path());
        std::fs::write(journal.path(), b"{not json").expect("write garbage");
        assert!(journal.read().is_none());
    }

    #[test]
    fn auto_retry_stops_at_the_ceiling() {
        assert!(record(0).should_auto_retry(3));
        assert!(record(2).should_auto_retry(3));
        assert!(!record(3).should_auto_retry(3));
        assert!(!record(7).should_auto_retry(3));
    }
}
