use std::sync::Arc;
use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::{header, HeaderValue, Method};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use daemon::{ConverterConfig, Pipeline};
use log::warn;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{DefaultOnResponse, TraceLayer};
use tracing::Level;
use crate::error::ApiError;
use crate::handlers;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ConverterConfig>,
    pub pipeline: Arc<Pipeline>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = setup_cors(&state.config);
    let body_limit = state.config.max_upload_bytes;

    Router::new()
        .route("/", get(handlers::health))
        .route("/convert", post(handlers::convert))
        .route("/conversionCount", get(handlers::conversion_count))
        .route("/download/{filename}", get(handlers::download))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(middleware::from_fn_with_state(state.clone(), reject_disallowed_origin))
        .layer(TraceLayer::new_for_http().on_response(DefaultOnResponse::new().level(Level::INFO)))
        .with_state(state)
}

fn allows_any_origin(cfg: &ConverterConfig) -> bool {
    cfg.allowed_origins.iter().any(|o| o == "*")
}

fn setup_cors(cfg: &ConverterConfig) -> CorsLayer {
    if allows_any_origin(cfg) {
        warn!("CORS configured to allow all origins");
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers(Any);
    }

    let origins: Vec<HeaderValue> = cfg
        .allowed_origins
        .iter()
        .filter_map(|o| match o.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!("Ignoring invalid allowed origin: {}", o);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
}

/// Reject cross-origin requests from origins outside the allow-list.
/// Requests without an Origin header pass through.
async fn reject_disallowed_origin(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(origin) = request.headers().get(header::ORIGIN) {
        let allowed = allows_any_origin(&state.config)
            || origin
                .to_str()
                .map(|o| state.config.allowed_origins.iter().any(|a| a == o))
                .unwrap_or(false);
        if !allowed {
            warn!("Rejected request from origin {:?} to {}", origin, request.uri().path());
            return ApiError::OriginNotAllowed.into_response();
        }
    }
    next.run(request).await
}
