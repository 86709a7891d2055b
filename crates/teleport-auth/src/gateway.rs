//! Sign-in against the external auth service

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::tier::{SubscriptionTier, TierTable};

const SIGN_IN_TIMEOUT: Duration = Duration::from_secs(10);

/// Authentication errors
///
/// Every variant means the control attempt is refused; none are retried.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing username or password")]
    MissingCredentials,

    #[error("Auth service rejected sign-in with status {status}")]
    Rejected { status: u16 },

    #[error("Auth service unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Malformed auth response: {0}")]
    MalformedResponse(#[from] serde_json::Error),
}

/// Username and password presented on the control handshake
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// Both values must be present and non-empty.
    pub fn new(username: Option<String>, password: Option<String>) -> Result<Self, AuthError> {
        match (username, password) {
            (Some(username), Some(password)) if !username.is_empty() && !password.is_empty() => {
                Ok(Self { username, password })
            }
            _ => Err(AuthError::MissingCredentials),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A successful sign-in
#[derive(Debug, Clone)]
pub struct SignIn {
    pub user_name: String,
    pub access_token: String,
    pub tier: SubscriptionTier,
}

/// Translates credentials into a subscription tier
#[async_trait]
pub trait AuthGateway: Send + Sync {
    async fn sign_in(&self, credentials: &Credentials) -> Result<SignIn, AuthError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SignInRequest<'a> {
    user_name: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignInResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    user_name: String,
    subscription_type: Option<String>,
}

/// `POST {base_url}/signin` with `{userName, password}`
pub struct HttpAuthGateway {
    client: reqwest::Client,
    base_url: String,
    tiers: TierTable,
}

impl HttpAuthGateway {
    pub fn new(base_url: impl Into<String>, tiers: TierTable) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder().timeout(SIGN_IN_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tiers,
        })
    }
}

#[async_trait]
impl AuthGateway for HttpAuthGateway {
    async fn sign_in(&self, credentials: &Credentials) -> Result<SignIn, AuthError> {
        let url = format!("{}/signin", self.base_url);
        debug!(user = %credentials.username, "Signing in at {}", url);

        let response = self
            .client
            .post(&url)
            .json(&SignInRequest {
                user_name: &credentials.username,
                password: &credentials.password,
            })
            .send()
            .await?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(AuthError::Rejected {
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await?;
        let parsed: SignInResponse = serde_json::from_slice(&body)?;
        let tier = self.tiers.resolve(parsed.subscription_type.as_deref());

        let user_name = if parsed.user_name.is_empty() {
            credentials.username.clone()
        } else {
            parsed.user_name
        };

        Ok(SignIn {
            user_name,
            access_token: parsed.access_token,
            tier,
        })
    }
}
