use std::path::PathBuf;
use std::sync::Mutex;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Daily conversion counter as persisted on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaRecord {
    pub count: u32,
    pub last_reset_date: DateTime<Utc>,
}

impl QuotaRecord {
    pub fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            count: 0,
            last_reset_date: now,
        }
    }

    /// True when the record belongs to an earlier (or later) UTC calendar day than `now`
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.last_reset_date.date_naive() != now.date_naive()
    }
}

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("failed to persist quota record to {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode quota record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Storage for the single global conversion counter.
///
/// `read` never fails: a missing or corrupt record reads as a fresh one.
/// Read-modify-write sequences are not atomic across callers.
pub trait QuotaStore: Send + Sync {
    fn read(&self) -> QuotaRecord;
    fn write(&self, record: &QuotaRecord) -> Result<(), QuotaError>;
}

/// Quota record kept in a JSON file, rewritten whole on every write
#[derive(Debug)]
pub struct FileQuotaStore {
    path: PathBuf,
}

impl FileQuotaStore {
    /// Open the store, creating the record file if it does not exist yet
    pub fn open(path: impl Into<PathBuf>, now: DateTime<Utc>) -> Result<Self, QuotaError> {
        let store = Self { path: path.into() };
        if !store.path.exists() {
            info!("Creating quota record at {}", store.path.display());
            store.write(&QuotaRecord::fresh(now))?;
        }
        Ok(store)
    }

    fn try_read(&self) -> anyhow::Result<QuotaRecord> {
        let content = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

impl QuotaStore for FileQuotaStore {
    fn read(&self) -> QuotaRecord {
        match self.try_read() {
            Ok(record) => record,
            Err(e) => {
                warn!("Quota record at {} unreadable ({}), starting fresh", self.path.display(), e);
                QuotaRecord::fresh(Utc::now())
            }
        }
    }

    fn write(&self, record: &QuotaRecord) -> Result<(), QuotaError> {
        let encoded = serde_json::to_vec_pretty(record)?;
        let persist_err = |source| QuotaError::Persist {
            path: self.path.clone(),
            source,
        };

        // Write beside the target and rename so readers never see a torn file
        let mut tmp_path = self.path.clone().into_os_string();
        tmp_path.push(".tmp");
        let tmp_path = PathBuf::from(tmp_path);
        std::fs::write(&tmp_path, encoded).map_err(persist_err)?;
        std::fs::rename(&tmp_path, &self.path).map_err(persist_err)?;
        Ok(())
    }
}

/// In-process quota store, for tests and ephemeral deployments
#[derive(Debug)]
pub struct MemoryQuotaStore {
    record: Mutex<QuotaRecord>,
}

impl MemoryQuotaStore {
    pub fn new(record: QuotaRecord) -> Self {
        Self {
            record: Mutex::new(record),
        }
    }
}

impl QuotaStore for MemoryQuotaStore {
    fn read(&self) -> QuotaRecord {
        match self.record.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn write(&self, record: &QuotaRecord) -> Result<(), QuotaError> {
        match self.record.lock() {
            Ok(mut guard) => *guard = record.clone(),
            Err(poisoned) => *poisoned.into_inner() = record.clone(),
        }
        Ok(())
    }
}

/// Outcome of a quota check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Conversion may proceed; carries the record it was admitted against
    Admitted(QuotaRecord),
    /// Daily limit already reached
    Refused(QuotaRecord),
}

/// Admission and charging rules for the daily conversion limit
#[derive(Debug, Clone, Copy)]
pub struct QuotaPolicy {
    daily_limit: u32,
}

impl QuotaPolicy {
    pub fn new(daily_limit: u32) -> Self {
        Self { daily_limit }
    }

    pub fn daily_limit(&self) -> u32 {
        self.daily_limit
    }

    /// Reset the record if it belongs to another day, then compare it against the limit
    pub fn check(&self, store: &dyn QuotaStore, now: DateTime<Utc>) -> Result<Admission, QuotaError> {
        let mut record = store.read();

        if record.is_stale(now) {
            info!(
                "New quota window: resetting count {} from {} to 0",
                record.count,
                record.last_reset_date.date_naive()
            );
            record = QuotaRecord::fresh(now);
            store.write(&record)?;
        }

        if record.count >= self.daily_limit {
            debug!("Quota refused: {}/{} conversions used today", record.count, self.daily_limit);
            return Ok(Admission::Refused(record));
        }

        Ok(Admission::Admitted(record))
    }

    /// Record one successful conversion admitted against `admitted`.
    ///
    /// Re-reads the store so a late finisher never lowers a count other jobs
    /// already raised. A job admitted before the current window started charges
    /// nothing.
    pub fn charge(&self, store: &dyn QuotaStore, admitted: &QuotaRecord) -> Result<QuotaRecord, QuotaError> {
        let current = store.read();
        if current.is_stale(admitted.last_reset_date) {
            debug!(
                "Quota window moved from {} to {}; not charging",
                admitted.last_reset_date.date_naive(),
                current.last_reset_date.date_naive()
            );
            return Ok(current);
        }

        let next = QuotaRecord {
            count: current.count.max(admitted.count.saturating_add(1)),
            last_reset_date: current.last_reset_date,
        };
        store.write(&next)?;
        Ok(next)
    }
}
