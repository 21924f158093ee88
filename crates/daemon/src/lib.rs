pub mod config;
pub mod quota;
pub mod naming;
pub mod job;
pub mod runner;
pub mod expiry;
pub mod pipeline;
pub mod sweep;

pub use config::ConverterConfig;
pub use job::{ConvertedAsset, Job, JobStatus, UploadedAsset};
pub use quota::{FileQuotaStore, MemoryQuotaStore, QuotaRecord, QuotaStore};
pub use runner::{ConversionError, FfmpegTranscoder, JobRunner, Transcoder};
pub use expiry::{CleanupHandle, ExpiryScheduler};
pub use pipeline::{ConversionOutcome, Pipeline, PipelineError, UploadRequest};
