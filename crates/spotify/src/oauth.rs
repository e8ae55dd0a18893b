use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::Deserialize;
use url::Url;

use crate::api::{parse_json, SpotifyError};

/// Client for the Spotify accounts service.
#[derive(Clone)]
pub struct SpotifyOAuthClient {
    http: Client,
    base_url: Url,
    client_id: String,
    client_secret: String,
}

impl SpotifyOAuthClient {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        base_url: Url,
        http: Client,
    ) -> Self {
        Self {
            http,
            base_url,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    /// Exchanges a refresh token for a fresh access token.
    pub async fn refresh_token(
        &self,
        refresh_token: &str,
    ) -> Result<SpotifyTokenResponse, SpotifyError> {
        let url = self.base_url.join("api/token")?;
        let response = self
            .http
            .post(url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await?;

        parse_json(response).await
    }
}

/// Token response from the accounts service. Spotify may omit the refresh token
/// when the previous one stays valid.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SpotifyTokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_in: u64,
    #[serde(default)]
    pub scope: Option<String>,
    pub token_type: String,
}

impl SpotifyTokenResponse {
    /// Absolute expiry relative to `now`. Lifetimes that overflow the calendar are rejected.
    pub fn expires_at(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, SpotifyError> {
        i64::try_from(self.expires_in)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|lifetime| now.checked_add_signed(lifetime))
            .ok_or(SpotifyError::InvalidExpiry(self.expires_in))
    }
}
