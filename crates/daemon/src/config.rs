use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration for the conversion daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConverterConfig {
    /// TCP port the HTTP server listens on
    pub port: u16,
    /// Origins permitted to make cross-origin requests
    pub allowed_origins: Vec<String>,
    /// Directory where accepted uploads are stored until expiry
    pub upload_dir: PathBuf,
    /// Directory where converted audio files are served from
    pub output_dir: PathBuf,
    /// JSON file holding the daily conversion counter
    pub quota_file: PathBuf,
    /// Successful conversions allowed per UTC calendar day
    pub daily_limit: u32,
    /// Seconds an upload/output pair is kept after a successful conversion
    pub retention_secs: u64,
    /// Upper bound on simultaneously running transcodes
    pub max_concurrent_jobs: usize,
    /// Seconds a single transcode may run before it is killed
    pub job_timeout_secs: u64,
    /// Path to the ffmpeg binary
    pub ffmpeg_bin: PathBuf,
    /// Target audio bitrate passed to the encoder (e.g., "192k")
    pub audio_bitrate: String,
    /// Declared mime types admitted for conversion
    pub accepted_mime_types: Vec<String>,
    /// Maximum request body size for uploads
    pub max_upload_bytes: usize,
    /// Base URL used for download links; derived from the request when unset
    pub public_base_url: Option<String>,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl ConverterConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            port: 5000,
            allowed_origins: vec!["http://localhost:3000".to_string()],
            upload_dir: PathBuf::from("uploads"),
            output_dir: PathBuf::from("converted"),
            quota_file: PathBuf::from("conversionCount.json"),
            daily_limit: 3,
            retention_secs: 60 * 60,
            max_concurrent_jobs: 2,
            job_timeout_secs: 10 * 60,
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            audio_bitrate: "192k".to_string(),
            accepted_mime_types: vec!["video/mp4".to_string()],
            max_upload_bytes: 500 * 1024 * 1024, // 500MB
            public_base_url: None,
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // Try JSON first, then TOML
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Override fields from environment variables, looked up through `lookup`
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("PORT") {
            self.port = port
                .trim()
                .parse()
                .with_context(|| format!("Invalid PORT value: {}", port))?;
        }
        if let Some(origins) = lookup("ALLOWED_ORIGINS") {
            self.allowed_origins = origins
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect();
        }
        if let Some(dir) = lookup("UPLOAD_DIR") {
            self.upload_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("OUTPUT_DIR") {
            self.output_dir = PathBuf::from(dir);
        }
        if let Some(file) = lookup("QUOTA_FILE") {
            self.quota_file = PathBuf::from(file);
        }
        if let Some(bin) = lookup("FFMPEG_BIN") {
            self.ffmpeg_bin = PathBuf::from(bin);
        }
        Ok(())
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    /// Whether a declared upload mime type is admitted; parameters after `;` are ignored
    pub fn accepts_mime(&self, mime: &str) -> bool {
        let essence = mime.split(';').next().unwrap_or_default().trim();
        self.accepted_mime_types.iter().any(|m| m.eq_ignore_ascii_case(essence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn env_overrides_replace_defaults() {
        let env: HashMap<&str, &str> = [
            ("PORT", "8080"),
            ("ALLOWED_ORIGINS", "https://a.example, https://b.example,"),
            ("OUTPUT_DIR", "/srv/out"),
        ]
        .into_iter()
        .collect();

        let mut cfg = ConverterConfig::default_config();
        cfg.apply_env_overrides(|k| env.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.allowed_origins, vec!["https://a.example", "https://b.example"]);
        assert_eq!(cfg.output_dir, PathBuf::from("/srv/out"));
        assert_eq!(cfg.upload_dir, PathBuf::from("uploads"));
    }

    #[test]
    fn invalid_port_is_rejected() {
        let mut cfg = ConverterConfig::default_config();
        let err = cfg.apply_env_overrides(|k| (k == "PORT").then(|| "eighty".to_string()));
        assert!(err.is_err());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vid2mp3.toml");
        std::fs::write(&path, "daily_limit = 5\nretention_secs = 30\n").unwrap();

        let cfg = ConverterConfig::load_config(Some(&path)).unwrap();
        assert_eq!(cfg.daily_limit, 5);
        assert_eq!(cfg.retention(), Duration::from_secs(30));
        assert_eq!(cfg.audio_bitrate, "192k");
    }

    #[test]
    fn mime_check_is_case_insensitive() {
        let cfg = ConverterConfig::default_config();
        assert!(cfg.accepts_mime("video/mp4"));
        assert!(cfg.accepts_mime("Video/MP4"));
        assert!(!cfg.accepts_mime("audio/mpeg"));
        assert!(!cfg.accepts_mime("image/png"));
    }

    #[test]
    fn mime_parameters_are_ignored() {
        let cfg = ConverterConfig::default_config();
        assert!(cfg.accepts_mime("video/mp4; codecs=\"avc1.42E01E, mp4a.40.2\""));
        assert!(cfg.accepts_mime(" video/mp4 ;"));
        assert!(!cfg.accepts_mime("video/mp4x; codecs=avc1"));
        assert!(!cfg.accepts_mime(""));
    }
}
