use std::path::PathBuf;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// An accepted upload persisted in the upload directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedAsset {
    pub storage_path: PathBuf,
    pub assigned_name: String,
    pub original_name: String,
    pub mime_type: String,
}

/// A finished audio artifact in the output directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertedAsset {
    pub storage_path: PathBuf,
    pub file_name: String,
    pub content_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Succeeded,
    Failed,
}

/// One conversion of an upload into an audio file. Never persisted.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub input: UploadedAsset,
    pub output_path: PathBuf,
    pub status: JobStatus,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(input: UploadedAsset, output_path: PathBuf) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            input,
            output_path,
            status: JobStatus::Pending,
            reason: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Where the engine writes while the job runs; renamed onto `output_path` on success
    pub fn staging_path(&self) -> PathBuf {
        let mut name = self
            .output_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(format!(".{}.part", self.id));
        self.output_path.with_file_name(name)
    }

    pub fn is_terminal(&self) -> bool {
        self.status != JobStatus::Pending
    }

    /// Move Pending -> Succeeded. Returns false if the job already finished.
    pub fn succeed(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = JobStatus::Succeeded;
        self.finished_at = Some(Utc::now());
        true
    }

    /// Move Pending -> Failed with a reason. Returns false if the job already finished.
    pub fn fail(&mut self, reason: impl Into<String>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = JobStatus::Failed;
        self.reason = Some(reason.into());
        self.finished_at = Some(Utc::now());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new(
            UploadedAsset {
                storage_path: PathBuf::from("uploads/1-000001.mp4"),
                assigned_name: "1-000001.mp4".to_string(),
                original_name: "clip.mp4".to_string(),
                mime_type: "video/mp4".to_string(),
            },
            PathBuf::from("converted/clip.mp3"),
        )
    }

    #[test]
    fn new_job_is_pending() {
        let job = job();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(!job.is_terminal());
        assert!(job.finished_at.is_none());
    }

    #[test]
    fn terminal_transition_happens_once() {
        let mut job = job();
        assert!(job.succeed());
        assert!(!job.fail("late error"));
        assert!(!job.succeed());
        assert_eq!(job.status, JobStatus::Succeeded);
        assert!(job.reason.is_none());

        let mut job = self::job();
        assert!(job.fail("engine exited with code 1"));
        assert!(!job.succeed());
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.reason.as_deref(), Some("engine exited with code 1"));
    }

    #[test]
    fn staging_path_sits_beside_output() {
        let job = job();
        let staging = job.staging_path();
        assert_eq!(staging.parent(), job.output_path.parent());
        assert_eq!(
            staging.file_name().unwrap().to_string_lossy(),
            format!("clip.mp3.{}.part", job.id)
        );
    }

    #[test]
    fn job_ids_are_unique() {
        assert_ne!(job().id, job().id);
    }
}
