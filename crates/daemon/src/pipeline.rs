//! Conversion request lifecycle.
//!
//! `Received -> Admitted | Rejected`, `Admitted -> JobRunning`,
//! `JobRunning -> JobSucceeded | JobFailed`. The job and its terminal handling
//! (quota charge and expiry registration, or input cleanup) run on their own
//! task and report back over a oneshot channel, so a caller that goes away
//! mid-conversion does not leave the job half-finished.

use std::path::PathBuf;
use std::sync::Arc;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::oneshot;
use crate::config::ConverterConfig;
use crate::expiry::ExpiryScheduler;
use crate::job::{ConvertedAsset, Job, UploadedAsset};
use crate::naming::{self, OUTPUT_CONTENT_TYPE};
use crate::quota::{Admission, QuotaError, QuotaPolicy, QuotaRecord, QuotaStore};
use crate::runner::{ConversionError, JobRunner};

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("daily conversion limit of {limit} reached")]
    QuotaExceeded { limit: u32 },

    #[error(transparent)]
    Quota(#[from] QuotaError),

    #[error("failed to store upload at {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("conversion failed: {0}")]
    Conversion(#[from] ConversionError),
}

/// A file submitted for conversion, not yet written anywhere
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub original_name: String,
    pub content_type: String,
    pub data: Bytes,
}

/// Result of a successful conversion
#[derive(Debug, Clone)]
pub struct ConversionOutcome {
    pub job_id: String,
    pub input: UploadedAsset,
    pub output: ConvertedAsset,
    /// Conversions charged today, including this one
    pub count: u32,
}

pub struct Pipeline {
    config: ConverterConfig,
    policy: QuotaPolicy,
    quota: Arc<dyn QuotaStore>,
    runner: JobRunner,
    expiry: ExpiryScheduler,
    clock: Clock,
}

impl Pipeline {
    pub fn new(
        cfg: &ConverterConfig,
        quota: Arc<dyn QuotaStore>,
        runner: JobRunner,
        expiry: ExpiryScheduler,
    ) -> Self {
        Self {
            config: cfg.clone(),
            policy: QuotaPolicy::new(cfg.daily_limit),
            quota,
            runner,
            expiry,
            clock: Arc::new(Utc::now),
        }
    }

    /// Replace the wall clock used for quota windows and upload names
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Current quota record, without resetting or charging it
    pub fn quota_status(&self) -> QuotaRecord {
        self.quota.read()
    }

    /// Resolve a client-supplied artifact name inside the output directory
    pub fn output_path_for(&self, supplied: &str) -> Option<(String, PathBuf)> {
        let name = naming::sanitize_file_name(supplied)?;
        let path = self.config.output_dir.join(&name);
        Some((name, path))
    }

    /// Admit, persist and convert one upload, waiting for its terminal outcome
    pub async fn convert(self: Arc<Self>, req: UploadRequest) -> Result<ConversionOutcome, PipelineError> {
        if !self.config.accepts_mime(&req.content_type) {
            debug!("Rejected {} with type {}", req.original_name, req.content_type);
            return Err(PipelineError::UnsupportedMediaType(req.content_type));
        }

        let now = (self.clock)();
        let admitted = match self.policy.check(self.quota.as_ref(), now)? {
            Admission::Admitted(record) => record,
            Admission::Refused(record) => {
                info!(
                    "Refused {}: {}/{} conversions used on {}",
                    req.original_name,
                    record.count,
                    self.policy.daily_limit(),
                    record.last_reset_date.date_naive()
                );
                return Err(PipelineError::QuotaExceeded {
                    limit: self.policy.daily_limit(),
                });
            }
        };

        let input = self.persist_upload(&req, now).await?;
        let output_path = self.config.output_dir.join(naming::derive_output_name(&req.original_name));
        let job = Job::new(input, output_path);
        info!(
            "Admitted job {} for {} ({} bytes, {}/{} used today)",
            job.id,
            req.original_name,
            req.data.len(),
            admitted.count,
            self.policy.daily_limit()
        );

        let (tx, rx) = oneshot::channel();
        let pipeline = self.clone();
        tokio::spawn(async move {
            let outcome = pipeline.execute(job, admitted).await;
            let _ = tx.send(outcome);
        });

        rx.await
            .unwrap_or(Err(PipelineError::Conversion(ConversionError::Lost)))
    }

    async fn persist_upload(&self, req: &UploadRequest, now: DateTime<Utc>) -> Result<UploadedAsset, PipelineError> {
        let assigned_name = naming::assign_upload_name(&req.original_name, now);
        let storage_path = self.config.upload_dir.join(&assigned_name);

        tokio::fs::write(&storage_path, &req.data)
            .await
            .map_err(|source| PipelineError::Storage {
                path: storage_path.clone(),
                source,
            })?;

        Ok(UploadedAsset {
            storage_path,
            assigned_name,
            original_name: req.original_name.clone(),
            mime_type: req.content_type.clone(),
        })
    }

    async fn execute(&self, mut job: Job, admitted: QuotaRecord) -> Result<ConversionOutcome, PipelineError> {
        if let Err(e) = self.runner.run(&mut job).await {
            match tokio::fs::remove_file(&job.input.storage_path).await {
                Ok(()) => debug!("Removed input of failed job {}", job.id),
                Err(rm) => warn!(
                    "Failed to remove input {} of failed job {}: {}",
                    job.input.storage_path.display(),
                    job.id,
                    rm
                ),
            }
            return Err(PipelineError::Conversion(e));
        }

        self.expiry.schedule_cleanup(
            vec![job.input.storage_path.clone(), job.output_path.clone()],
            self.config.retention(),
        );

        // The artifact exists either way; a failed charge is an operator problem
        let count = match self.policy.charge(self.quota.as_ref(), &admitted) {
            Ok(record) => record.count,
            Err(e) => {
                error!("Failed to charge quota for job {}: {}", job.id, e);
                admitted.count.saturating_add(1)
            }
        };

        let file_name = job
            .output_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(ConversionOutcome {
            job_id: job.id,
            output: ConvertedAsset {
                storage_path: job.output_path,
                file_name,
                content_type: OUTPUT_CONTENT_TYPE.to_string(),
            },
            input: job.input,
            count,
        })
    }
}
