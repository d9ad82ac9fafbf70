use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};
use draftsync_common::protocol::channel::PresenceMember;
use tracing::debug;
use uuid::Uuid;

use crate::{
    auth::jwt::{JwtAccessTokenService, TokenIdentity},
    error::{ErrorCode, RelayError},
};

/// The editor behind a request, inserted as a request extension by [`require_bearer_auth`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: Uuid,
    pub display_name: String,
}

impl AuthenticatedUser {
    /// Identity stamped onto presence events and relayed whispers.
    pub fn as_member(&self) -> PresenceMember {
        PresenceMember { id: self.user_id, name: self.display_name.clone() }
    }
}

impl From<TokenIdentity> for AuthenticatedUser {
    fn from(TokenIdentity { user_id, display_name }: TokenIdentity) -> Self {
        Self { user_id, display_name }
    }
}

pub async fn require_bearer_auth(
    State(tokens): State<Arc<JwtAccessTokenService>>,
    mut request: Request,
    next: Next,
) -> Response {
    match authenticate_headers(&tokens, request.headers()) {
        Ok(user) => {
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        Err(rejection) => rejection.into_response(),
    }
}

/// Shared by the REST layer and the channel upgrade, which authenticates before upgrading.
pub fn authenticate_headers(
    tokens: &JwtAccessTokenService,
    headers: &HeaderMap,
) -> Result<AuthenticatedUser, RelayError> {
    let Some(token) = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token)
    else {
        return Err(RelayError::new(ErrorCode::AuthInvalidToken, "missing bearer token"));
    };

    tokens.validate_access_token(token).map(AuthenticatedUser::from).map_err(|error| {
        debug!(%error, "bearer token refused");
        RelayError::new(ErrorCode::AuthInvalidToken, "invalid bearer token")
    })
}

fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, rest) = header.trim_start().split_once(char::is_whitespace)?;
    let token = rest.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}
