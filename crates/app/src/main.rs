mod deadline;
mod dedup;
mod pipeline;
mod problem;
mod resolver;
mod router;
mod status;
mod telemetry;
mod webhook;

#[cfg(test)]
mod test_support;

use std::{net::SocketAddr, sync::Arc};

use reqwest::Client;
use songreq_spotify::{SpotifyApiClient, SpotifyOAuthClient};
use songreq_storage::Database;
use songreq_twitch::{HelixClient, TwitchOAuthClient};
use songreq_util::{load_env_file, AppConfig};
use tracing::info;

use crate::dedup::DedupCache;
use crate::pipeline::Pipeline;
use crate::resolver::TrackResolver;
use crate::status::StatusReporter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;

    let http = Client::builder().timeout(config.pipeline_timeout).build()?;
    let twitch_oauth = TwitchOAuthClient::new(
        config.twitch_client_id.clone(),
        config.twitch_client_secret.clone(),
        config.urls.twitch_oauth.clone(),
        http.clone(),
    );
    let helix = HelixClient::new(
        config.twitch_client_id.clone(),
        config.urls.twitch_helix.clone(),
        http.clone(),
    );
    let spotify_oauth = SpotifyOAuthClient::new(
        config.spotify_client_id.clone(),
        config.spotify_client_secret.clone(),
        config.urls.spotify_accounts.clone(),
        http.clone(),
    );
    let spotify_api = SpotifyApiClient::new(http.clone(), config.urls.spotify_api.clone());
    let resolver = TrackResolver::standard(&config.links, http)?;

    let reporter = StatusReporter::new(
        database.clone(),
        twitch_oauth,
        helix,
        config.chat_notifications,
        config.pipeline_timeout,
    );
    let pipeline = Pipeline::new(
        database,
        spotify_oauth,
        spotify_api,
        resolver,
        reporter,
        config.pipeline_timeout,
    );

    let dedup = DedupCache::default();
    let _sweeper = dedup.spawn_sweeper();

    let secret: Arc<[u8]> = Arc::from(config.eventsub_secret.as_bytes());
    let state = router::AppState::new(metrics, secret, dedup, pipeline);

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .await
        .map_err(|err| err.into())
}
