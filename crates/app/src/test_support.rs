use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use httpmock::prelude::*;
use httpmock::Mock;
use reqwest::Client;
use serde_json::json;
use songreq_core::{Preference, User};
use songreq_spotify::{SpotifyApiClient, SpotifyOAuthClient};
use songreq_storage::Database;
use songreq_twitch::{HelixClient, TwitchOAuthClient};
use songreq_util::LinkShapes;
use sqlx::Row;
use url::Url;

use crate::dedup::DedupCache;
use crate::pipeline::Pipeline;
use crate::resolver::TrackResolver;
use crate::router::AppState;
use crate::status::StatusReporter;
use crate::telemetry;

pub(crate) const SECRET: &str = "test-secret";
pub(crate) const BROADCASTER_ID: &str = "b-123";
pub(crate) const FIXED_NOW: &str = "2024-01-01T00:00:00Z";
pub(crate) const SHARE_HOST: &str = "open.example.com";

/// App state wired to one mock server standing in for Twitch and Spotify.
pub(crate) struct Harness {
    pub server: MockServer,
    pub database: Database,
    pub state: AppState,
    pub now: DateTime<Utc>,
}

impl Harness {
    pub async fn new() -> Self {
        let metrics = telemetry::init_metrics().expect("metrics init");
        let server = MockServer::start_async().await;
        let database = Database::connect("sqlite::memory:")
            .await
            .expect("connect");
        database.run_migrations().await.expect("migrations");

        let now = DateTime::parse_from_rfc3339(FIXED_NOW)
            .expect("fixed time")
            .with_timezone(&Utc);

        let http = Client::new();
        let url = |path: &str| Url::parse(&server.url(path)).expect("url");
        let twitch_oauth = TwitchOAuthClient::new("client", "secret", url("/oauth2/"), http.clone());
        let helix = HelixClient::new("client", url("/helix/"), http.clone());
        let spotify_oauth =
            SpotifyOAuthClient::new("spotify-id", "spotify-secret", url("/accounts/"), http.clone());
        let spotify_api = SpotifyApiClient::new(http.clone(), url("/v1/"));
        let links = LinkShapes {
            share_host: SHARE_HOST.to_string(),
            short_link_prefix: server.url("/s/"),
        };
        let resolver = TrackResolver::standard(&links, http).expect("link patterns");

        let reporter = StatusReporter::new(
            database.clone(),
            twitch_oauth,
            helix,
            false,
            Duration::from_secs(5),
        );
        let pipeline = Pipeline::new(
            database.clone(),
            spotify_oauth,
            spotify_api,
            resolver,
            reporter,
            Duration::from_secs(5),
        );

        let secret: Arc<[u8]> = Arc::from(SECRET.as_bytes());
        let state = AppState::new(metrics, secret, DedupCache::default(), pipeline)
            .with_clock(Arc::new(move || now));

        Self {
            server,
            database,
            state,
            now,
        }
    }

    pub async fn seed_user(&self) {
        self.database
            .users()
            .upsert(
                &User {
                    twitch_id: BROADCASTER_ID.to_string(),
                    twitch_access_token: "twitch-access".to_string(),
                    twitch_refresh_token: "twitch-refresh".to_string(),
                    spotify_access_token: "spotify-access".to_string(),
                    spotify_refresh_token: "spotify-refresh".to_string(),
                    spotify_expiry: Some(self.now),
                    subscribed: true,
                    subscription_id: "sub-1".to_string(),
                    email: "streamer@example.com".to_string(),
                },
                self.now,
            )
            .await
            .expect("seed user");
    }

    pub async fn seed_preference(&self, preference: Preference) {
        self.database
            .preferences()
            .upsert(&preference, self.now)
            .await
            .expect("seed preference");
    }

    pub async fn mock_spotify_refresh(&self) -> Mock<'_> {
        self.server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/accounts/api/token")
                    .x_www_form_urlencoded_tuple("refresh_token", "spotify-refresh");
                then.status(200).json_body(json!({
                    "access_token": "fresh-access",
                    "token_type": "Bearer",
                    "expires_in": 3600
                }));
            })
            .await
    }

    pub async fn mock_track(&self, id: &str, explicit: bool, duration_ms: u64) -> Mock<'_> {
        let path = format!("/v1/tracks/{id}");
        let id = id.to_string();
        self.server
            .mock_async(move |when, then| {
                when.method(GET)
                    .path(path)
                    .header("authorization", "Bearer fresh-access");
                then.status(200).json_body(json!({
                    "id": id,
                    "name": "Test Song",
                    "artists": [{ "name": "Test Artist" }],
                    "explicit": explicit,
                    "duration_ms": duration_ms
                }));
            })
            .await
    }

    pub async fn mock_queue(&self, status: u16) -> Mock<'_> {
        self.server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/me/player/queue");
                then.status(status);
            })
            .await
    }

    /// `(success, broadcaster_id, spotify_track)` for every outcome row.
    pub async fn message_rows(&self) -> Vec<(bool, String, String)> {
        sqlx::query("SELECT success, broadcaster_id, spotify_track FROM messages ORDER BY id")
            .fetch_all(self.database.pool())
            .await
            .expect("messages")
            .into_iter()
            .map(|row| {
                (
                    row.get::<i64, _>("success") != 0,
                    row.get("broadcaster_id"),
                    row.get("spotify_track"),
                )
            })
            .collect()
    }
}
