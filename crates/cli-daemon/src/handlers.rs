use axum::body::Body;
use axum::extract::{Multipart, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use axum::Json;
use chrono::{DateTime, Utc};
use daemon::naming::OUTPUT_CONTENT_TYPE;
use daemon::{ConverterConfig, UploadRequest};
use log::{debug, error, info};
use serde::Serialize;
use tokio_util::io::ReaderStream;
use crate::error::{ApiError, ApiResult};
use crate::routes::AppState;

/// Multipart field carrying the video
const FILE_FIELD: &str = "file";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvertResponse {
    pub success: bool,
    pub file_name: String,
    pub download_url: String,
    pub count: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CountResponse {
    pub total_count: u32,
    pub last_reset_date: DateTime<Utc>,
}

pub async fn health() -> &'static str {
    "vid2mp3 converter is running"
}

pub async fn convert(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> ApiResult<Json<ConvertResponse>> {
    let mut upload = None;

    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }

        let original_name = field.file_name().unwrap_or("upload").to_string();
        let content_type = field.content_type().unwrap_or_default().to_string();

        // Refuse before buffering the body
        if !state.config.accepts_mime(&content_type) {
            info!("Rejected upload {} with type {:?}", original_name, content_type);
            return Err(ApiError::BadRequest(format!(
                "Only video files are allowed, got {}",
                if content_type.is_empty() { "no content type" } else { content_type.as_str() }
            )));
        }

        let data = field.bytes().await?;
        upload = Some(UploadRequest {
            original_name,
            content_type,
            data,
        });
        break;
    }

    let upload = upload.ok_or_else(|| ApiError::BadRequest("No file uploaded".to_string()))?;
    let outcome = state.pipeline.clone().convert(upload).await?;

    let download_url = download_url(&state.config, &headers, &outcome.output.file_name);
    debug!("Job {} available at {}", outcome.job_id, download_url);

    Ok(Json(ConvertResponse {
        success: true,
        file_name: outcome.output.file_name,
        download_url,
        count: outcome.count,
    }))
}

pub async fn conversion_count(State(state): State<AppState>) -> Json<CountResponse> {
    let record = state.pipeline.quota_status();
    Json(CountResponse {
        total_count: record.count,
        last_reset_date: record.last_reset_date,
    })
}

pub async fn download(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> ApiResult<Response> {
    let (name, path) = state
        .pipeline
        .output_path_for(&filename)
        .ok_or(ApiError::NotFound)?;

    let is_file = tokio::fs::metadata(&path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false);
    if !is_file {
        debug!("Download of missing artifact {}", path.display());
        return Err(ApiError::NotFound);
    }

    let file = tokio::fs::File::open(&path).await.map_err(|e| {
        error!("Failed to open {} for download: {}", path.display(), e);
        ApiError::Internal
    })?;

    let body = Body::from_stream(ReaderStream::new(file));
    let disposition = format!("attachment; filename=\"{}\"", name.replace('"', "_"));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, OUTPUT_CONTENT_TYPE)
        .header(header::CONTENT_DISPOSITION, disposition)
        .body(body)
        .map_err(|e| {
            error!("Failed to build download response for {}: {}", name, e);
            ApiError::Internal
        })
}

/// Public link to a converted artifact.
///
/// Uses `public_base_url` when configured, otherwise the request's
/// forwarded protocol and Host header.
pub fn download_url(cfg: &ConverterConfig, headers: &HeaderMap, file_name: &str) -> String {
    let encoded = urlencoding::encode(file_name);

    if let Some(base) = &cfg.public_base_url {
        return format!("{}/download/{}", base.trim_end_matches('/'), encoded);
    }

    let proto = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("http");
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| format!("localhost:{}", cfg.port));

    format!("{}://{}/download/{}", proto, host, encoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn url_from_request_headers() {
        let cfg = ConverterConfig::default_config();
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("convert.example.com"));
        headers.insert("x-forwarded-proto", HeaderValue::from_static("https, http"));

        assert_eq!(
            download_url(&cfg, &headers, "my clip.mp3"),
            "https://convert.example.com/download/my%20clip.mp3"
        );
    }

    #[test]
    fn url_defaults_without_headers() {
        let cfg = ConverterConfig::default_config();
        assert_eq!(
            download_url(&cfg, &HeaderMap::new(), "clip.mp3"),
            "http://localhost:5000/download/clip.mp3"
        );
    }

    #[test]
    fn configured_base_url_wins() {
        let mut cfg = ConverterConfig::default_config();
        cfg.public_base_url = Some("https://cdn.example.com/".to_string());
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("internal:5000"));

        assert_eq!(
            download_url(&cfg, &headers, "clip.mp3"),
            "https://cdn.example.com/download/clip.mp3"
        );
    }
}
