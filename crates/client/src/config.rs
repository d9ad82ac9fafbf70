use std::net::IpAddr;

use draftsync_common::protocol::channel::PresenceMember;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

use crate::autosave::AutosavePolicy;
use crate::reconnect::ReconnectPolicy;
use crate::transport::normalize_base_url;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid relay url `{value}`: {reason}")]
    InvalidUrl { value: String, reason: String },
    #[error("relay url must use https (http is allowed only for localhost)")]
    InsecureUrl,
    #[error("access token must not be empty")]
    MissingToken,
    #[error("display name must not be empty")]
    MissingName,
}

/// Connection parameters for one user talking to one relay.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay base URL, always ending in `/`.
    pub base_url: Url,
    /// Bearer token for REST calls and the presence channel.
    pub access_token: String,
    /// The identity the relay stamps on this user's whispers.
    pub identity: PresenceMember,
    pub autosave: AutosavePolicy,
    pub reconnect: ReconnectPolicy,
}

impl ClientConfig {
    pub fn new(
        base_url: &str,
        access_token: impl Into<String>,
        user_id: Uuid,
        display_name: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let base_url = validate_base_url(base_url)?;

        let access_token = access_token.into();
        if access_token.trim().is_empty() {
            return Err(ConfigError::MissingToken);
        }
        let name = display_name.into();
        if name.trim().is_empty() {
            return Err(ConfigError::MissingName);
        }

        Ok(Self {
            base_url,
            access_token,
            identity: PresenceMember { id: user_id, name },
            autosave: AutosavePolicy::default(),
            reconnect: ReconnectPolicy::default(),
        })
    }

    pub fn with_autosave(mut self, autosave: AutosavePolicy) -> Self {
        self.autosave = autosave;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }
}

fn validate_base_url(value: &str) -> Result<Url, ConfigError> {
    let parsed = Url::parse(value).map_err(|error| ConfigError::InvalidUrl {
        value: value.to_string(),
        reason: error.to_string(),
    })?;
    match parsed.scheme() {
        "https" => {}
        "http" if is_loopback_host(parsed.host_str()) => {}
        _ => return Err(ConfigError::InsecureUrl),
    }
    Ok(normalize_base_url(parsed))
}

fn is_loopback_host(host: Option<&str>) -> bool {
    let Some(host) = host else {
        return false;
    };
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .is_ok_and(|addr| addr.is_loopback())
}
