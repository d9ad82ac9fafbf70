use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Extension, Json, Path, Query, State,
    },
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use draftsync_common::{
    payload,
    types::{
        CreateDocumentRequest, DocumentEnvelope, LoadDocumentResponse, RestoreRequest,
        RestoreResponse, SaveRequest, SaveResponse, SnapshotResponse, VersionPage, VersionPreview,
    },
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::{
    auth::{
        jwt::JwtAccessTokenService,
        middleware::{require_bearer_auth, AuthenticatedUser},
    },
    error::{ErrorCode, RelayError},
    sync::service::{SyncError, SyncService},
};

#[derive(Clone)]
struct ApiState {
    sync: SyncService,
}

#[derive(Debug, Default, Deserialize)]
struct VersionsQuery {
    page: Option<u32>,
}

enum ApiError {
    BadRequest { message: String },
    Sync(SyncError),
}

impl From<SyncError> for ApiError {
    fn from(error: SyncError) -> Self {
        Self::Sync(error)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest { message: rejection.body_text() }
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self::BadRequest { message: rejection.body_text() }
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::BadRequest { message: rejection.body_text() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::BadRequest { message } => {
                RelayError::new(ErrorCode::ValidationFailed, message).into_response()
            }
            Self::Sync(error) => sync_error_response(error),
        }
    }
}

/// Render a domain error with the relay error envelope.
fn sync_error_response(error: SyncError) -> Response {
    match error {
        SyncError::NotFound => RelayError::new(ErrorCode::NotFound, "document not found"),
        SyncError::VersionNotFound(version_number) => {
            RelayError::from_code(ErrorCode::VersionNotFound)
                .with_details(json!({ "versionNumber": version_number }))
        }
        SyncError::AccessDenied => RelayError::from_code(ErrorCode::AuthForbidden),
        SyncError::Validation(message) => RelayError::new(ErrorCode::ValidationFailed, message),
        SyncError::PayloadTooLarge { size, limit } => {
            RelayError::from_code(ErrorCode::PayloadTooLarge)
                .with_details(json!({ "size": size, "limit": limit }))
        }
        SyncError::Internal(error) => {
            tracing::error!(error = ?error, "document api internal error");
            RelayError::from_code(ErrorCode::InternalError)
        }
    }
    .into_response()
}

pub fn router(sync: SyncService, jwt_service: Arc<JwtAccessTokenService>) -> Router {
    Router::new()
        .route("/v1/documents", post(create_document))
        .route("/v1/documents/{id}", get(load_document))
        .route("/v1/documents/{id}/save", post(save_document))
        .route("/v1/documents/{id}/snapshot", post(create_snapshot))
        .route("/v1/documents/{id}/versions", get(list_versions))
        .route("/v1/documents/{id}/versions/{version_number}", get(get_version))
        .route("/v1/documents/{id}/restore", post(restore_version))
        .with_state(ApiState { sync })
        .route_layer(middleware::from_fn_with_state(jwt_service, require_bearer_auth))
}

async fn create_document(
    State(state): State<ApiState>,
    Extension(user): Extension<AuthenticatedUser>,
    payload: Result<Json<CreateDocumentRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<DocumentEnvelope>), ApiError> {
    let Json(payload) = payload?;
    let document = state.sync.create_document(&user, &payload.title).await?;

    Ok((StatusCode::CREATED, Json(DocumentEnvelope { document })))
}

async fn load_document(
    State(state): State<ApiState>,
    Extension(user): Extension<AuthenticatedUser>,
    path: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<LoadDocumentResponse>, ApiError> {
    let Path(document_id) = path?;
    Ok(Json(state.sync.load_document(document_id, &user).await?))
}

async fn save_document(
    State(state): State<ApiState>,
    Extension(user): Extension<AuthenticatedUser>,
    path: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<SaveRequest>, JsonRejection>,
) -> Result<Json<SaveResponse>, ApiError> {
    let Path(document_id) = path?;
    let Json(payload) = payload?;
    let content = payload::decode(&payload.content)
        .map_err(|error| ApiError::BadRequest { message: error.to_string() })?;

    let snapshot_created =
        state.sync.save_update(document_id, &user, content, payload.update_count).await?;

    Ok(Json(SaveResponse { snapshot_created }))
}

async fn create_snapshot(
    State(state): State<ApiState>,
    Extension(user): Extension<AuthenticatedUser>,
    path: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<SnapshotResponse>, ApiError> {
    let Path(document_id) = path?;
    state.sync.create_snapshot(document_id, &user).await?;

    Ok(Json(SnapshotResponse::default()))
}

async fn list_versions(
    State(state): State<ApiState>,
    Extension(user): Extension<AuthenticatedUser>,
    path: Result<Path<Uuid>, PathRejection>,
    query: Result<Query<VersionsQuery>, QueryRejection>,
) -> Result<Json<VersionPage>, ApiError> {
    let Path(document_id) = path?;
    let Query(query) = query?;
    let page = query.page.unwrap_or(1);

    Ok(Json(state.sync.version_history(document_id, &user, page).await?))
}

async fn get_version(
    State(state): State<ApiState>,
    Extension(user): Extension<AuthenticatedUser>,
    path: Result<Path<(Uuid, i64)>, PathRejection>,
) -> Result<Json<VersionPreview>, ApiError> {
    let Path((document_id, version_number)) = path?;
    Ok(Json(state.sync.version_content(document_id, &user, version_number).await?))
}

async fn restore_version(
    State(state): State<ApiState>,
    Extension(user): Extension<AuthenticatedUser>,
    path: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<RestoreRequest>, JsonRejection>,
) -> Result<Json<RestoreResponse>, ApiError> {
    let Path(document_id) = path?;
    let Json(payload) = payload?;
    let restored =
        state.sync.restore_to_version(document_id, &user, payload.version_number).await?;

    Ok(Json(RestoreResponse {
        content: payload::encode(&restored.content),
        version_number: restored.version_number,
    }))
}

#[cfg(test)]
mod tests {
    use super::router;
    use crate::{
        auth::jwt::JwtAccessTokenService,
        presence::PresenceHub,
        store::{DocumentStore, SharePermission},
        sync::{
            clock::SystemClock,
            service::SyncService,
            snapshot::{SnapshotPolicy, SnapshotPolicyEngine},
            ttl_store::MemoryTtlStore,
        },
    };
    use axum::{
        body::{to_bytes, Body},
        http::{header::AUTHORIZATION, Method, Request, StatusCode},
        Router,
    };
    use draftsync_common::{
        payload,
        types::{
            DocumentEnvelope, LoadDocumentResponse, RestoreResponse, SaveResponse, VersionPage,
            VersionPreview,
        },
    };
    use serde_json::{json, Value};
    use std::{sync::Arc, time::Duration};
    use tower::ServiceExt;
    use uuid::Uuid;

    const TEST_SECRET: &str = "draftsync_test_secret_that_is_definitely_long_enough";

    struct TestApp {
        router: Router,
        jwt_service: Arc<JwtAccessTokenService>,
        store: DocumentStore,
    }

    fn test_app() -> TestApp {
        let jwt_service = Arc::new(
            JwtAccessTokenService::new(TEST_SECRET).expect("jwt service should initialize"),
        );
        let store = DocumentStore::memory();
        let clock = Arc::new(SystemClock);
        let policy = SnapshotPolicyEngine::new(
            SnapshotPolicy { update_threshold: 50, interval: Duration::from_secs(10) },
            Arc::new(MemoryTtlStore::new(Duration::from_secs(3600), clock.clone())),
            clock,
        );
        let sync = SyncService::new(store.clone(), policy, PresenceHub::new(), 10);

        TestApp { router: router(sync, Arc::clone(&jwt_service)), jwt_service, store }
    }

    impl TestApp {
        fn token(&self, user_id: Uuid, name: &str) -> String {
            self.jwt_service.issue_access_token(user_id, name).expect("token should be issued")
        }

        async fn send(
            &self,
            method: Method,
            uri: &str,
            token: Option<&str>,
            body: Option<Value>,
        ) -> axum::response::Response {
            let mut builder = Request::builder().method(method).uri(uri);
            if let Some(token) = token {
                builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
            }
            let body = match body {
                Some(value) => {
                    builder = builder.header("content-type", "application/json");
                    Body::from(value.to_string())
                }
                None => Body::empty(),
            };
            self.router
                .clone()
                .oneshot(builder.body(body).expect("request should build"))
                .await
                .expect("router should respond")
        }

        async fn create_document(&self, token: &str) -> Uuid {
            let response = self
                .send(Method::POST, "/v1/documents", Some(token), Some(json!({ "title": "Plan" })))
                .await;
            assert_eq!(response.status(), StatusCode::CREATED);
            read_json::<DocumentEnvelope>(response).await.document.id
        }

        async fn save(&self, token: &str, document_id: Uuid, content: &[u8], count: u32) -> bool {
            let response = self
                .send(
                    Method::POST,
                    &format!("/v1/documents/{document_id}/save"),
                    Some(token),
                    Some(json!({ "content": payload::encode(content), "updateCount": count })),
                )
                .await;
            assert_eq!(response.status(), StatusCode::OK);
            read_json::<SaveResponse>(response).await.snapshot_created
        }
    }

    async fn read_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
        let body =
            to_bytes(response.into_body(), usize::MAX).await.expect("response body should read");
        serde_json::from_slice(&body).expect("response body should be valid json")
    }

    #[tokio::test]
    async fn document_routes_require_bearer_auth() {
        let app = test_app();
        let response =
            app.send(Method::GET, &format!("/v1/documents/{}/versions", Uuid::new_v4()), None, None).await;

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body: Value = read_json(response).await;
        assert_eq!(body["error"]["code"], "AUTH_INVALID_TOKEN");
    }

    #[tokio::test]
    async fn create_and_load_document() {
        let app = test_app();
        let token = app.token(Uuid::new_v4(), "Owner");
        let document_id = app.create_document(&token).await;

        let response =
            app.send(Method::GET, &format!("/v1/documents/{document_id}"), Some(&token), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let loaded: LoadDocumentResponse = read_json(response).await;
        assert_eq!(loaded.document.title, "Plan");
        assert_eq!(loaded.content, "");
        assert_eq!(loaded.version_number, 0);
    }

    #[tokio::test]
    async fn create_document_rejects_blank_title() {
        let app = test_app();
        let token = app.token(Uuid::new_v4(), "Owner");
        let response = app
            .send(Method::POST, "/v1/documents", Some(&token), Some(json!({ "title": "  " })))
            .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: Value = read_json(response).await;
        assert_eq!(body["error"]["code"], "VALIDATION_FAILED");
    }

    #[tokio::test]
    async fn save_reports_snapshot_creation_at_threshold() {
        let app = test_app();
        let token = app.token(Uuid::new_v4(), "Owner");
        let document_id = app.create_document(&token).await;

        assert!(!app.save(&token, document_id, b"first", 3).await);
        assert!(app.save(&token, document_id, b"second", 50).await);

        let response = app
            .send(Method::GET, &format!("/v1/documents/{document_id}/versions"), Some(&token), None)
            .await;
        let page: VersionPage = read_json(response).await;
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].version_number, 1);
        assert_eq!(page.items[0].actor.name, "Owner");
    }

    #[tokio::test]
    async fn save_rejects_invalid_base64() {
        let app = test_app();
        let token = app.token(Uuid::new_v4(), "Owner");
        let document_id = app.create_document(&token).await;

        let response = app
            .send(
                Method::POST,
                &format!("/v1/documents/{document_id}/save"),
                Some(&token),
                Some(json!({ "content": "not base64!", "updateCount": 1 })),
            )
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn malformed_path_segments_get_the_validation_envelope() {
        let app = test_app();
        let token = app.token(Uuid::new_v4(), "Owner");
        let document_id = app.create_document(&token).await;

        for uri in [
            "/v1/documents/not-a-uuid".to_string(),
            "/v1/documents/not-a-uuid/versions".to_string(),
            format!("/v1/documents/{document_id}/versions/latest"),
        ] {
            let response = app.send(Method::GET, &uri, Some(&token), None).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
            let body: Value = read_json(response).await;
            assert_eq!(body["error"]["code"], "VALIDATION_FAILED", "{uri}");
            assert_eq!(body["error"]["retryable"], false, "{uri}");
        }
    }

    #[tokio::test]
    async fn save_with_missing_fields_is_a_validation_error() {
        let app = test_app();
        let token = app.token(Uuid::new_v4(), "Owner");
        let document_id = app.create_document(&token).await;

        let response = app
            .send(
                Method::POST,
                &format!("/v1/documents/{document_id}/save"),
                Some(&token),
                Some(json!({ "content": "AQ==" })),
            )
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: Value = read_json(response).await;
        assert_eq!(body["error"]["code"], "VALIDATION_FAILED");
    }

    #[tokio::test]
    async fn viewer_cannot_save_snapshot_or_restore() {
        let app = test_app();
        let owner_id = Uuid::new_v4();
        let owner = app.token(owner_id, "Owner");
        let document_id = app.create_document(&owner).await;
        app.save(&owner, document_id, b"v1", 50).await;

        let viewer_id = Uuid::new_v4();
        app.store
            .grant_share(document_id, viewer_id, SharePermission::View)
            .await
            .expect("share should insert");
        let viewer = app.token(viewer_id, "Viewer");

        for (uri, body) in [
            (format!("/v1/documents/{document_id}/save"), json!({ "content": "AQ==", "updateCount": 1 })),
            (format!("/v1/documents/{document_id}/snapshot"), json!({})),
            (format!("/v1/documents/{document_id}/restore"), json!({ "versionNumber": 1 })),
        ] {
            let response = app.send(Method::POST, &uri, Some(&viewer), Some(body)).await;
            assert_eq!(response.status(), StatusCode::FORBIDDEN, "{uri}");
        }

        let response = app
            .send(Method::GET, &format!("/v1/documents/{document_id}/versions/1"), Some(&viewer), None)
            .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_document_is_not_found() {
        let app = test_app();
        let token = app.token(Uuid::new_v4(), "Owner");
        let response = app
            .send(Method::POST, &format!("/v1/documents/{}/snapshot", Uuid::new_v4()), Some(&token), None)
            .await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body: Value = read_json(response).await;
        assert_eq!(body["error"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn preview_and_restore_round_trip() {
        let app = test_app();
        let token = app.token(Uuid::new_v4(), "Owner");
        let document_id = app.create_document(&token).await;
        app.save(&token, document_id, b"alpha", 50).await;
        app.save(&token, document_id, b"beta", 50).await;

        let response = app
            .send(Method::GET, &format!("/v1/documents/{document_id}/versions/1"), Some(&token), None)
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let preview: VersionPreview = read_json(response).await;
        assert_eq!(payload::decode(&preview.content).expect("decode"), b"alpha");

        let response = app
            .send(
                Method::POST,
                &format!("/v1/documents/{document_id}/restore"),
                Some(&token),
                Some(json!({ "versionNumber": 1 })),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let restored: RestoreResponse = read_json(response).await;
        assert_eq!(restored.version_number, 1);
        assert_eq!(payload::decode(&restored.content).expect("decode"), b"alpha");

        let response =
            app.send(Method::GET, &format!("/v1/documents/{document_id}"), Some(&token), None).await;
        let loaded: LoadDocumentResponse = read_json(response).await;
        assert_eq!(payload::decode(&loaded.content).expect("decode"), b"alpha");
        assert_eq!(loaded.version_number, 2);
    }

    #[tokio::test]
    async fn missing_version_is_version_not_found() {
        let app = test_app();
        let token = app.token(Uuid::new_v4(), "Owner");
        let document_id = app.create_document(&token).await;

        for (method, uri, body) in [
            (Method::GET, format!("/v1/documents/{document_id}/versions/7"), None),
            (
                Method::POST,
                format!("/v1/documents/{document_id}/restore"),
                Some(json!({ "versionNumber": 7 })),
            ),
        ] {
            let response = app.send(method, &uri, Some(&token), body).await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
            let body: Value = read_json(response).await;
            assert_eq!(body["error"]["code"], "VERSION_NOT_FOUND");
            assert_eq!(body["error"]["details"]["versionNumber"], 7);
        }
    }

    #[tokio::test]
    async fn version_history_paginates_with_page_query() {
        let app = test_app();
        let token = app.token(Uuid::new_v4(), "Owner");
        let document_id = app.create_document(&token).await;
        for index in 0..11u8 {
            app.save(&token, document_id, &[index + 1], 50).await;
        }

        let response = app
            .send(
                Method::GET,
                &format!("/v1/documents/{document_id}/versions?page=2"),
                Some(&token),
                None,
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let page: VersionPage = read_json(response).await;
        assert_eq!(page.page, 2);
        assert_eq!(page.per_page, 10);
        assert_eq!(page.last_page, 2);
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].version_number, 1);

        let response = app
            .send(
                Method::GET,
                &format!("/v1/documents/{document_id}/versions?page=abc"),
                Some(&token),
                None,
            )
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn snapshot_route_returns_empty_object() {
        let app = test_app();
        let token = app.token(Uuid::new_v4(), "Owner");
        let document_id = app.create_document(&token).await;
        app.save(&token, document_id, b"draft", 1).await;

        let response = app
            .send(Method::POST, &format!("/v1/documents/{document_id}/snapshot"), Some(&token), None)
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = read_json(response).await;
        assert_eq!(body, json!({}));

        let response =
            app.send(Method::GET, &format!("/v1/documents/{document_id}"), Some(&token), None).await;
        let loaded: LoadDocumentResponse = read_json(response).await;
        assert_eq!(loaded.version_number, 1);
    }
}
