use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use songreq_core::{
    check_track, is_song_request, NewMessage, PolicyViolation, Preference, RedemptionEvent,
    SpotifyTokens, TrackFacts,
};
use songreq_spotify::{SpotifyApiClient, SpotifyError, SpotifyOAuthClient, Track};
use songreq_storage::{Database, UserError};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::deadline::{Deadline, DeadlineExceeded};
use crate::resolver::{ResolveContext, ResolveError, TrackResolver};
use crate::status::{StatusReport, StatusReporter};

/// Terminal result of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Ineligible,
    AuthFailed,
    Unresolved,
    MetadataFailed,
    Rejected(PolicyViolation),
    QueueFailed,
    Queued,
}

impl PipelineOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Ineligible => "ineligible",
            Self::AuthFailed => "auth_error",
            Self::Unresolved => "resolution_error",
            Self::MetadataFailed => "metadata_error",
            Self::Rejected(violation) => violation.metric_label(),
            Self::QueueFailed => "queue_error",
            Self::Queued => "queued",
        }
    }

    /// Whether an outcome row was appended for this run.
    pub fn is_metered(&self) -> bool {
        matches!(self, Self::Queued | Self::QueueFailed)
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("failed to load user: {0}")]
    User(#[from] UserError),
    #[error("user has no spotify token pair")]
    MissingTokens,
    #[error("spotify token refresh failed: {0}")]
    Refresh(#[from] SpotifyError),
    #[error(transparent)]
    Deadline(#[from] DeadlineExceeded),
}

#[derive(Debug, Error)]
enum ProviderError {
    #[error(transparent)]
    Spotify(#[from] SpotifyError),
    #[error(transparent)]
    Deadline(#[from] DeadlineExceeded),
}

/// Everything needed to take a decoded redemption to the playback queue.
pub struct Pipeline {
    storage: Database,
    spotify_oauth: SpotifyOAuthClient,
    spotify_api: SpotifyApiClient,
    resolver: TrackResolver,
    reporter: StatusReporter,
    timeout: Duration,
}

impl Pipeline {
    pub fn new(
        storage: Database,
        spotify_oauth: SpotifyOAuthClient,
        spotify_api: SpotifyApiClient,
        resolver: TrackResolver,
        reporter: StatusReporter,
        timeout: Duration,
    ) -> Self {
        Self {
            storage,
            spotify_oauth,
            spotify_api,
            resolver,
            reporter,
            timeout,
        }
    }

    /// Runs every stage for one event. Business failures end the run and are only logged.
    pub async fn run(&self, event: RedemptionEvent, now: DateTime<Utc>) -> PipelineOutcome {
        let deadline = Deadline::after(self.timeout);
        let outcome = self.process(&event, now, deadline).await;
        counter!("pipeline_outcomes_total", "outcome" => outcome.label()).increment(1);
        info!(
            stage = "pipeline",
            event_id = %event.id,
            broadcaster_id = %event.broadcaster_id,
            outcome = outcome.label(),
            metered = outcome.is_metered(),
            "redemption processed"
        );
        outcome
    }

    async fn process(
        &self,
        event: &RedemptionEvent,
        now: DateTime<Utc>,
        deadline: Deadline,
    ) -> PipelineOutcome {
        let event_id = event.id.as_str();
        let broadcaster_id = event.broadcaster_id.as_str();

        let preference = self.load_preference(event).await;
        if !is_song_request(event, preference.as_ref()) {
            info!(
                stage = "preference",
                event_id,
                broadcaster_id,
                reward_id = %event.reward_id,
                "redemption is not a song request"
            );
            return PipelineOutcome::Ineligible;
        }

        let access_token = match self.refresh_spotify_token(broadcaster_id, now, deadline).await {
            Ok(token) => token,
            Err(err) => {
                warn!(stage = "token", event_id, broadcaster_id, error = %err, "spotify token unavailable");
                return PipelineOutcome::AuthFailed;
            }
        };
        let spotify = self.spotify_api.authorized(&access_token);

        let ctx = ResolveContext { spotify, deadline };
        let resolution = match self.resolver.resolve(&event.user_input, &ctx).await {
            Ok(resolution) => resolution,
            Err(err) => {
                let invalid = matches!(err, ResolveError::InvalidInput(_));
                warn!(stage = "resolver", event_id, broadcaster_id, invalid, error = %err, "could not resolve track");
                return PipelineOutcome::Unresolved;
            }
        };
        info!(
            stage = "resolver",
            event_id,
            broadcaster_id,
            strategy = resolution.strategy,
            input = %resolution.input,
            track_id = %resolution.track_id,
            "track resolved"
        );

        let track: Track = match deadline
            .run::<_, _, _, ProviderError>(spotify.track(&resolution.track_id))
            .await
        {
            Ok(track) => track,
            Err(err) => {
                warn!(
                    stage = "filter",
                    event_id,
                    broadcaster_id,
                    track_id = %resolution.track_id,
                    error = %err,
                    "failed to fetch track metadata"
                );
                return PipelineOutcome::MetadataFailed;
            }
        };

        let facts = TrackFacts {
            explicit: track.explicit,
            duration_millis: track.duration_ms,
        };
        if let Err(violation) = check_track(facts, preference.as_ref()) {
            info!(
                stage = "filter",
                event_id,
                broadcaster_id,
                track_id = %track.id,
                reason = violation.metric_label(),
                "track rejected by preferences"
            );
            return PipelineOutcome::Rejected(violation);
        }

        let queued = deadline
            .run::<_, _, _, ProviderError>(spotify.queue_track(&track.id))
            .await;
        let success = match &queued {
            Ok(()) => {
                info!(stage = "queue", event_id, broadcaster_id, track_id = %track.id, "track queued");
                true
            }
            Err(err) => {
                warn!(stage = "queue", event_id, broadcaster_id, track_id = %track.id, error = %err, "failed to queue track");
                false
            }
        };

        self.record(event, &track.id, success).await;

        self.reporter.spawn(StatusReport {
            event: event.clone(),
            track,
            success,
            now,
        });

        if success {
            PipelineOutcome::Queued
        } else {
            PipelineOutcome::QueueFailed
        }
    }

    async fn load_preference(&self, event: &RedemptionEvent) -> Option<Preference> {
        match self.storage.preferences().fetch(&event.broadcaster_id).await {
            Ok(preference) => preference,
            Err(err) => {
                warn!(
                    stage = "preference",
                    event_id = %event.id,
                    broadcaster_id = %event.broadcaster_id,
                    error = %err,
                    "preference lookup failed; using defaults"
                );
                None
            }
        }
    }

    /// Exchanges the stored refresh token and persists the new pair. Returns the access token.
    async fn refresh_spotify_token(
        &self,
        broadcaster_id: &str,
        now: DateTime<Utc>,
        deadline: Deadline,
    ) -> Result<String, AuthError> {
        let user = deadline
            .run::<_, _, _, AuthError>(self.storage.users().fetch(broadcaster_id))
            .await?;
        let stored = user.spotify_tokens().ok_or(AuthError::MissingTokens)?;

        let token = deadline
            .run::<_, _, _, AuthError>(self.spotify_oauth.refresh_token(&stored.refresh_token))
            .await?;

        let expiry = token.expires_at(now)?;
        let refreshed = SpotifyTokens {
            refresh_token: token
                .refresh_token
                .clone()
                .unwrap_or(stored.refresh_token),
            expiry: Some(expiry),
            access_token: token.access_token,
        };
        if let Err(err) = self
            .storage
            .users()
            .update_spotify_tokens(broadcaster_id, &refreshed, now)
            .await
        {
            warn!(stage = "token", broadcaster_id, error = %err, "failed to persist refreshed spotify token");
        }

        Ok(refreshed.access_token)
    }

    async fn record(&self, event: &RedemptionEvent, track_id: &str, success: bool) {
        let message = NewMessage {
            created_at: event.redeemed_at,
            success,
            broadcaster_id: event.broadcaster_id.clone(),
            spotify_track_id: track_id.to_string(),
        };
        if let Err(err) = self.storage.messages().append(&message).await {
            error!(
                stage = "metrics",
                event_id = %event.id,
                broadcaster_id = %event.broadcaster_id,
                error = %err,
                "failed to append outcome row"
            );
        }
    }
}
