use reqwest::{Client, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use thiserror::Error;
use url::Url;

/// Spotify Web API client. Bind a user token with [`SpotifyApiClient::authorized`]
/// before issuing calls.
#[derive(Clone)]
pub struct SpotifyApiClient {
    http: Client,
    base_url: Url,
}

impl SpotifyApiClient {
    pub fn new(http: Client, base_url: Url) -> Self {
        Self { http, base_url }
    }

    /// Returns a handle that issues calls on behalf of one user.
    pub fn authorized<'a>(&'a self, access_token: &'a str) -> AuthorizedSpotify<'a> {
        AuthorizedSpotify {
            client: self,
            access_token,
        }
    }
}

/// Per-request view of the API bound to a single access token.
#[derive(Clone, Copy)]
pub struct AuthorizedSpotify<'a> {
    client: &'a SpotifyApiClient,
    access_token: &'a str,
}

impl AuthorizedSpotify<'_> {
    /// Fetches track metadata by id.
    pub async fn track(&self, track_id: &str) -> Result<Track, SpotifyError> {
        let url = self
            .client
            .base_url
            .join(&format!("tracks/{track_id}"))?;
        let response = self
            .client
            .http
            .get(url)
            .bearer_auth(self.access_token)
            .send()
            .await?;

        parse_json(response).await
    }

    /// Runs a track search and returns the top hit, if any.
    pub async fn search_track(&self, query: &str) -> Result<Option<Track>, SpotifyError> {
        let mut url = self.client.base_url.join("search")?;
        url.query_pairs_mut()
            .append_pair("q", query)
            .append_pair("type", "track")
            .append_pair("limit", "1");

        let response = self
            .client
            .http
            .get(url)
            .bearer_auth(self.access_token)
            .send()
            .await?;

        let page: SearchResponse = parse_json(response).await?;
        Ok(page.tracks.items.into_iter().next())
    }

    /// Appends a track to the user's playback queue.
    pub async fn queue_track(&self, track_id: &str) -> Result<(), SpotifyError> {
        let mut url = self.client.base_url.join("me/player/queue")?;
        url.query_pairs_mut()
            .append_pair("uri", &format!("spotify:track:{track_id}"));

        let response = self
            .client
            .http
            .post(url)
            .bearer_auth(self.access_token)
            .header(reqwest::header::CONTENT_LENGTH, "0")
            .send()
            .await?;

        ensure_success(response).await
    }
}

/// Track metadata used for eligibility and chat notifications.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Track {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub artists: Vec<Artist>,
    #[serde(default)]
    pub explicit: bool,
    pub duration_ms: u64,
}

impl Track {
    /// Artist names joined for display.
    pub fn artist_names(&self) -> String {
        self.artists
            .iter()
            .map(|artist| artist.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Artist {
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    tracks: TrackPage,
}

#[derive(Debug, Deserialize)]
struct TrackPage {
    #[serde(default)]
    items: Vec<Track>,
}

/// Errors returned by the Spotify clients.
#[derive(Debug, Error)]
pub enum SpotifyError {
    #[error("failed to build url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("token lifetime of {0} seconds is out of range")]
    InvalidExpiry(u64),
}

async fn ensure_success(response: Response) -> Result<(), SpotifyError> {
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        return Err(SpotifyError::Status { status, body });
    }
    Ok(())
}

pub(crate) async fn parse_json<T>(response: Response) -> Result<T, SpotifyError>
where
    T: DeserializeOwned,
{
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        return Err(SpotifyError::Status { status, body });
    }

    Ok(response.json().await?)
}
