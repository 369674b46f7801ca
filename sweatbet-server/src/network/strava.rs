//! Strava REST Client
//!
//! Token exchange, paginated activity listing and activity detail. The
//! [`FitnessApi`] trait is the seam the OAuth handoff, the proof flow and the
//! tests program against.

use std::fmt;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, instrument};

use crate::core::config::StravaConfig;
use crate::core::time::UnixSeconds;
use crate::wager::activity::{find_qualifying_activity, lookback_start, ActivityRecord, FINDER_WINDOW_DAYS};

/// Strava access credential.
///
/// `Debug` and `Display` only show a short prefix.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessToken(String);

impl AccessToken {
    /// Wrap a raw bearer token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Raw token for the `Authorization` header.
    pub fn secret(&self) -> &str {
        &self.0
    }

    /// Loggable prefix.
    pub fn preview(&self) -> String {
        preview(&self.0)
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccessToken({})", self.preview())
    }
}

impl fmt::Display for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.preview())
    }
}

/// First 10 characters followed by `...`.
pub fn preview(secret: &str) -> String {
    let head: String = secret.chars().take(10).collect();
    format!("{}...", head)
}

/// Strava client errors.
#[derive(Debug, Error)]
pub enum StravaError {
    /// A required credential is not configured.
    #[error("{0} is not configured")]
    NotConfigured(&'static str),
    /// Transport or body decoding failure.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    /// Non-2xx response.
    #[error("strava rejected request ({status}): {message}")]
    Rejected {
        /// HTTP status.
        status: u16,
        /// Error message from the body, if any.
        message: String,
    },
}

/// Fitness-platform operations used by the handoff and the proof flow.
#[async_trait]
pub trait FitnessApi: Send + Sync {
    /// Exchange an authorization code for an access token.
    async fn exchange_code(&self, code: &str) -> Result<AccessToken, StravaError>;

    /// List the athlete's activities, optionally only those after `after`.
    async fn list_activities(
        &self,
        token: &AccessToken,
        after: Option<UnixSeconds>,
    ) -> Result<Vec<ActivityRecord>, StravaError>;

    /// Fetch one activity's detail.
    async fn get_activity(&self, token: &AccessToken, id: u64) -> Result<ActivityRecord, StravaError>;

    /// URL of the activity detail endpoint (what the prover notarizes).
    fn activity_url(&self, id: u64) -> String;
}

#[derive(Serialize)]
struct TokenRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    code: &'a str,
    grant_type: &'a str,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_at: Option<u64>,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
}

/// HTTP implementation of [`FitnessApi`].
pub struct StravaClient {
    config: StravaConfig,
    http: reqwest::Client,
}

impl StravaClient {
    /// Create a client.
    pub fn new(config: StravaConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    async fn rejected(response: reqwest::Response) -> StravaError {
        let status = response.status();
        let message = response
            .json::<ErrorBody>()
            .await
            .ok()
            .and_then(|b| b.message)
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown").to_string());
        StravaError::Rejected {
            status: status.as_u16(),
            message,
        }
    }
}

#[async_trait]
impl FitnessApi for StravaClient {
    #[instrument(skip_all)]
    async fn exchange_code(&self, code: &str) -> Result<AccessToken, StravaError> {
        let secret = self
            .config
            .client_secret
            .as_deref()
            .ok_or(StravaError::NotConfigured("STRAVA_CLIENT_SECRET"))?;

        info!(
            client_id = %self.config.client_id,
            code = %preview(code),
            "Exchanging Strava code for token"
        );

        let response = self
            .http
            .post(&self.config.token_url)
            .json(&TokenRequest {
                client_id: &self.config.client_id,
                client_secret: secret,
                code,
                grant_type: "authorization_code",
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let err = Self::rejected(response).await;
            error!("Strava token exchange failed: {}", err);
            return Err(err);
        }

        let body: TokenResponse = response.json().await?;
        info!(expires_at = ?body.expires_at, "Strava token exchange successful");
        Ok(AccessToken::new(body.access_token))
    }

    #[instrument(skip_all, fields(token = %token))]
    async fn list_activities(
        &self,
        token: &AccessToken,
        after: Option<UnixSeconds>,
    ) -> Result<Vec<ActivityRecord>, StravaError> {
        let url = format!("{}/athlete/activities", self.config.api_base);
        let per_page = self.config.page_size.max(1);
        let mut activities = Vec::new();

        for page in 1..=self.config.max_pages.max(1) {
            let mut query: Vec<(&str, String)> = vec![
                ("per_page", per_page.to_string()),
                ("page", page.to_string()),
            ];
            if let Some(after) = after {
                query.push(("after", after.to_string()));
            }

            let response = self
                .http
                .get(&url)
                .bearer_auth(token.secret())
                .query(&query)
                .send()
                .await?;

            if !response.status().is_success() {
                let err = Self::rejected(response).await;
                error!("Error fetching Strava activities: {}", err);
                return Err(err);
            }

            let batch: Vec<ActivityRecord> = response.json().await?;
            let fetched = batch.len();
            debug!(page, fetched, "Fetched activity page");
            activities.extend(batch);

            if fetched < per_page as usize {
                break;
            }
        }

        info!(count = activities.len(), "Fetched Strava activities");
        Ok(activities)
    }

    #[instrument(skip(self, token))]
    async fn get_activity(&self, token: &AccessToken, id: u64) -> Result<ActivityRecord, StravaError> {
        let response = self
            .http
            .get(self.activity_url(id))
            .bearer_auth(token.secret())
            .send()
            .await?;

        match response.status() {
            s if s.is_success() => Ok(response.json().await?),
            StatusCode::NOT_FOUND => Err(StravaError::Rejected {
                status: 404,
                message: format!("activity {} not found", id),
            }),
            _ => Err(Self::rejected(response).await),
        }
    }

    fn activity_url(&self, id: u64) -> String {
        format!("{}/activities/{}", self.config.api_base, id)
    }
}

/// Standalone finder: fetch the window ending at `deadline` and return the
/// earliest activity meeting the target.
pub async fn fetch_qualifying_activity<F: FitnessApi + ?Sized>(
    fitness: &F,
    token: &AccessToken,
    target_distance: f64,
    deadline: UnixSeconds,
    activity_type: Option<&str>,
) -> Result<Option<ActivityRecord>, StravaError> {
    let after = lookback_start(deadline, FINDER_WINDOW_DAYS);
    let activities = fitness.list_activities(token, Some(after)).await?;
    Ok(find_qualifying_activity(&activities, target_distance, deadline, activity_type).cloned())
}
