// Browser editors call the relay cross-origin. `DRAFTSYNC_RELAY_CORS_ORIGINS` takes a
// comma-separated allow list or `*`; unset falls back to local dev servers.

use std::time::Duration;

use axum::http::{header, HeaderName, HeaderValue, Method};
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::error::REQUEST_ID_HEADER;

const LOCAL_DEV_ORIGINS: &str =
    "http://localhost:3000,http://localhost:5173,http://127.0.0.1:3000,http://127.0.0.1:5173";

pub fn cors_layer(configured_origins: Option<&str>) -> CorsLayer {
    let request_id = HeaderName::from_static(REQUEST_ID_HEADER);
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE, request_id.clone()])
        .expose_headers([request_id])
        .max_age(Duration::from_secs(60 * 60));

    let origins = configured_origins.map(str::trim).filter(|value| !value.is_empty());
    if origins == Some("*") {
        // Credentials are not allowed alongside a wildcard origin.
        return layer.allow_origin(AllowOrigin::any());
    }
    layer
        .allow_origin(AllowOrigin::list(origin_list(origins.unwrap_or(LOCAL_DEV_ORIGINS))))
        .allow_credentials(true)
}

fn origin_list(raw: &str) -> Vec<HeaderValue> {
    raw.split(',')
        .filter_map(|origin| HeaderValue::from_str(origin.trim()).ok())
        .filter(|origin| !origin.is_empty())
        .collect()
}
