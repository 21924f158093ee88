use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Semaphore;
use crate::config::ConverterConfig;
use crate::job::Job;

/// Lines of engine stderr kept for the operator log
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("failed to start transcoder {bin}: {source}")]
    Spawn {
        bin: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("transcoder exited with code {exit_code}: {stderr}")]
    EngineFailed { exit_code: i32, stderr: String },

    #[error("transcoder error: {0}")]
    Engine(String),

    #[error("transcoder timed out after {0:?}")]
    TimedOut(Duration),

    #[error("transcoder reported success but wrote no output at {0}")]
    MissingOutput(PathBuf),

    #[error("failed to move finished output to {path}: {source}")]
    Publish {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("conversion ended without reporting an outcome")]
    Lost,
}

/// External engine turning a video file into an audio file
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn transcode(&self, input: &Path, output: &Path) -> Result<(), ConversionError>;
}

/// Transcoder backed by an ffmpeg subprocess producing MP3
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    ffmpeg_bin: PathBuf,
    audio_bitrate: String,
}

impl FfmpegTranscoder {
    pub fn new(cfg: &ConverterConfig) -> Self {
        Self {
            ffmpeg_bin: cfg.ffmpeg_bin.clone(),
            audio_bitrate: cfg.audio_bitrate.clone(),
        }
    }

    pub fn build_args(&self, input: &Path, output: &Path) -> Vec<String> {
        let mut args = Vec::new();

        args.push("-hide_banner".to_string());
        args.push("-nostdin".to_string());
        args.push("-y".to_string());

        args.push("-i".to_string());
        args.push(input.display().to_string());

        // Drop video, encode the first audio track as MP3
        args.push("-vn".to_string());
        args.push("-codec:a".to_string());
        args.push("libmp3lame".to_string());
        args.push("-b:a".to_string());
        args.push(self.audio_bitrate.clone());
        args.push("-f".to_string());
        args.push("mp3".to_string());

        args.push(output.display().to_string());
        args
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn transcode(&self, input: &Path, output: &Path) -> Result<(), ConversionError> {
        let args = self.build_args(input, output);
        debug!("ffmpeg command: {} {:?}", self.ffmpeg_bin.display(), args);

        // kill_on_drop ends the subprocess when the caller gives up (timeout)
        let output = Command::new(&self.ffmpeg_bin)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ConversionError::Spawn {
                bin: self.ffmpeg_bin.clone(),
                source,
            })?;

        if output.status.success() {
            return Ok(());
        }

        let exit_code = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(ConversionError::EngineFailed {
            exit_code,
            stderr: stderr_tail(&stderr, STDERR_TAIL_LINES),
        })
    }
}

fn stderr_tail(stderr: &str, lines: usize) -> String {
    let all: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

/// Runs conversion jobs through a transcoder, bounded in concurrency and duration
pub struct JobRunner {
    transcoder: Arc<dyn Transcoder>,
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl JobRunner {
    pub fn new(transcoder: Arc<dyn Transcoder>, max_concurrent: usize, timeout: Duration) -> Self {
        Self {
            transcoder,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            timeout,
        }
    }

    pub fn from_config(cfg: &ConverterConfig, transcoder: Arc<dyn Transcoder>) -> Self {
        Self::new(transcoder, cfg.max_concurrent_jobs, cfg.job_timeout())
    }

    /// Transcodes currently allowed to start without waiting
    pub fn available_slots(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run a pending job to its terminal state.
    ///
    /// The job's status is updated exactly once. Engine errors are logged here
    /// and returned for the caller to map onto a client-facing message.
    pub async fn run(&self, job: &mut Job) -> Result<(), ConversionError> {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ConversionError::Lost)?;

        info!(
            "Starting conversion job {}: {} -> {}",
            job.id,
            job.input.storage_path.display(),
            job.output_path.display()
        );
        let started = Instant::now();

        // Partial engine output never appears under the artifact name
        let staging = job.staging_path();
        let transcode = self.transcoder.transcode(&job.input.storage_path, &staging);
        let result = match tokio::time::timeout(self.timeout, transcode).await {
            Ok(result) => result,
            Err(_) => Err(ConversionError::TimedOut(self.timeout)),
        };
        let result = match result {
            Ok(()) => publish(&staging, &job.output_path).await,
            Err(e) => Err(e),
        };
        if result.is_err() {
            discard(&staging).await;
        }

        match &result {
            Ok(()) => {
                job.succeed();
                info!("✅ Job {} completed in {:.1}s", job.id, started.elapsed().as_secs_f64());
            }
            Err(e) => {
                job.fail(e.to_string());
                error!("❌ Job {} failed after {:.1}s: {}", job.id, started.elapsed().as_secs_f64(), e);
            }
        }

        result
    }
}

async fn publish(staging: &Path, output: &Path) -> Result<(), ConversionError> {
    match tokio::fs::metadata(staging).await {
        Ok(meta) if meta.is_file() => {}
        _ => return Err(ConversionError::MissingOutput(staging.to_path_buf())),
    }
    tokio::fs::rename(staging, output)
        .await
        .map_err(|e| ConversionError::Publish {
            path: output.to_path_buf(),
            source: e,
        })
}

async fn discard(staging: &Path) {
    match tokio::fs::remove_file(staging).await {
        Ok(()) => debug!("Discarded partial output {}", staging.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial output {}: {}", staging.display(), e),
    }
}
