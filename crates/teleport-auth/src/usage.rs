//! Billing telemetry
//!
//! Reports are best effort. Callers log failures and carry on; a billing outage must
//! never take a tunnel down.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

const USAGE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum UsageError {
    #[error("Billing service unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Billing service returned status {0}")]
    UnexpectedStatus(u16),
}

/// Records public URL allocations and forwarded connections
#[async_trait]
pub trait UsageReporter: Send + Sync {
    /// A public URL was assigned to `user_name` at `at`.
    async fn record_public_url(
        &self,
        user_name: &str,
        url: &str,
        at: DateTime<Utc>,
    ) -> Result<(), UsageError>;

    /// One forwarded connection was admitted on `url`.
    async fn record_connection(&self, user_name: &str, url: &str) -> Result<(), UsageError>;
}

/// Discards all reports
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopUsageReporter;

#[async_trait]
impl UsageReporter for NoopUsageReporter {
    async fn record_public_url(
        &self,
        _: &str,
        _: &str,
        _: DateTime<Utc>,
    ) -> Result<(), UsageError> {
        Ok(())
    }

    async fn record_connection(&self, _: &str, _: &str) -> Result<(), UsageError> {
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UrlDetails<'a> {
    user_name: &'a str,
    url: &'a str,
    time: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Increment<'a> {
    user_name: &'a str,
    url: &'a str,
}

/// Bearer-authenticated client for `{base_url}/add` and `{base_url}/increment`
pub struct HttpUsageReporter {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpUsageReporter {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self, UsageError> {
        let client = reqwest::Client::builder().timeout(USAGE_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    async fn post<T: Serialize + Sync>(&self, path: &str, body: &T) -> Result<(), UsageError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(UsageError::UnexpectedStatus(status.as_u16()));
        }

        debug!("Usage report accepted by {}", url);
        Ok(())
    }
}

#[async_trait]
impl UsageReporter for HttpUsageReporter {
    async fn record_public_url(
        &self,
        user_name: &str,
        url: &str,
        at: DateTime<Utc>,
    ) -> Result<(), UsageError> {
        let body = UrlDetails {
            user_name,
            url,
            time: at.to_rfc3339_opts(SecondsFormat::Secs, true),
        };
        self.post("/add", &body).await
    }

    async fn record_connection(&self, user_name: &str, url: &str) -> Result<(), UsageError> {
        self.post("/increment", &Increment { user_name, url }).await
    }
}
