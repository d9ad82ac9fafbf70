// draftsync-relay library: the HTTP and channel surface. The binary wires
// configuration, storage, maintenance and signals around `build_router`.

pub mod api;
pub mod auth;
pub mod config;
pub mod cors;
pub mod db;
pub mod error;
pub mod presence;
pub mod store;
pub mod sync;
pub mod ws;

use std::{any::Any, sync::Arc};

use axum::{
    extract::{DefaultBodyLimit, Request},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use tokio::time::Instant;
use tower_http::{catch_panic::CatchPanicLayer, cors::CorsLayer};
use tracing::{error, info, info_span, Instrument};

use crate::{
    auth::jwt::JwtAccessTokenService,
    error::{
        attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope,
        ErrorCode, RelayError,
    },
    sync::service::SyncService,
};

// Content is capped at 4 MiB before base64; the envelope needs the extra third.
const MAX_REQUEST_BODY_BYTES: usize = 8 * 1024 * 1024;

pub fn build_router(tokens: Arc<JwtAccessTokenService>, sync: SyncService, cors: CorsLayer) -> Router {
    let routes = Router::new()
        .route("/healthz", get(healthz))
        .merge(ws::router(Arc::clone(&tokens), sync.clone()))
        .merge(api::router(sync, tokens))
        .layer(cors);
    with_request_layers(routes)
}

/// Layers shared by every route: body cap, request id plus access log, panic guard.
fn with_request_layers(router: Router) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn(track_request))
        .layer(CatchPanicLayer::custom(panic_response))
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

fn panic_response(payload: Box<dyn Any + Send + 'static>) -> Response {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_default();
    error!(panic = %detail, "handler panicked");
    RelayError::from_code(ErrorCode::InternalError).into_response()
}

async fn track_request(request: Request, next: Next) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());
    let span = info_span!(
        "relay.request",
        request_id = %request_id,
        method = %request.method(),
        path = %request.uri().path(),
    );
    let started = Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request))
        .instrument(span.clone())
        .await;
    attach_request_id_header(&mut response, &request_id);

    span.in_scope(|| {
        info!(
            status = response.status().as_u16(),
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "request finished"
        );
    });
    response
}
