//! HS256 access tokens. The relay only verifies them; minting lives here so tests
//! and local tooling can share the signing secret with the identity service.

use std::time::{SystemTime, UNIX_EPOCH};

use jsonwebtoken::{errors::Error as JwtError, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const ACCESS_TOKEN_TTL_SECONDS: i64 = 15 * 60;
const MIN_SECRET_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("signing secret must be at least {MIN_SECRET_LEN} characters long")]
    WeakSecret,
    #[error("access token could not be signed: {0}")]
    Encode(#[source] JwtError),
    #[error("access token rejected: {0}")]
    Invalid(#[source] JwtError),
    #[error("access token subject `{0}` is not a user id")]
    BadSubject(String),
    #[error("access token carries no display name")]
    MissingName,
    #[error("system clock reads before the unix epoch")]
    Clock,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    name: String,
    iat: i64,
    exp: i64,
}

/// Who the bearer of a verified token is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenIdentity {
    pub user_id: Uuid,
    pub display_name: String,
}

#[derive(Clone)]
pub struct JwtAccessTokenService {
    signer: EncodingKey,
    verifier: DecodingKey,
    validation: Validation,
}

impl JwtAccessTokenService {
    pub fn new(secret: &str) -> Result<Self, TokenError> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(TokenError::WeakSecret);
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        let key = secret.as_bytes();
        Ok(Self {
            signer: EncodingKey::from_secret(key),
            verifier: DecodingKey::from_secret(key),
            validation,
        })
    }

    pub fn issue_access_token(&self, user_id: Uuid, display_name: &str) -> Result<String, TokenError> {
        self.sign(user_id, display_name, unix_now()?)
    }

    fn sign(&self, user_id: Uuid, display_name: &str, issued_at: i64) -> Result<String, TokenError> {
        let claims = Claims {
            sub: user_id.to_string(),
            name: display_name.to_owned(),
            iat: issued_at,
            exp: issued_at + ACCESS_TOKEN_TTL_SECONDS,
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.signer)
            .map_err(TokenError::Encode)
    }

    pub fn validate_access_token(&self, token: &str) -> Result<TokenIdentity, TokenError> {
        let Claims { sub, name, .. } =
            jsonwebtoken::decode::<Claims>(token, &self.verifier, &self.validation)
                .map_err(TokenError::Invalid)?
                .claims;

        let user_id = Uuid::parse_str(&sub).map_err(|_| TokenError::BadSubject(sub.clone()))?;
        let display_name = name.trim();
        if display_name.is_empty() {
            return Err(TokenError::MissingName);
        }
        Ok(TokenIdentity { user_id, display_name: display_name.to_owned() })
    }
}

fn unix_now() -> Result<i64, TokenError> {
    let elapsed = SystemTime::now().duration_since(UNIX_EPOCH).map_err(|_| TokenError::Clock)?;
    i64::try_from(elapsed.as_secs()).map_err(|_| TokenError::Clock)
}
