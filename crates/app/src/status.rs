use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use songreq_core::RedemptionEvent;
use songreq_spotify::Track;
use songreq_storage::{Database, UserError};
use songreq_twitch::{
    ChatMessageRequest, HelixClient, HelixError, HelixRedemptionStatus, OAuthError,
    TwitchOAuthClient, UpdateRedemptionRequest,
};
use thiserror::Error;
use tracing::{info, warn};

/// Outcome of one queue attempt, handed to the reporter after the fact.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub event: RedemptionEvent,
    pub track: Track,
    pub success: bool,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("failed to load user: {0}")]
    User(#[from] UserError),
    #[error("user has no twitch token pair")]
    MissingTokens,
    #[error("twitch token refresh failed: {0}")]
    Refresh(#[from] OAuthError),
    #[error("redemption update failed: {0}")]
    Redemption(HelixError),
    #[error("chat message failed: {0}")]
    Chat(HelixError),
}

/// Acknowledges redemptions back to Twitch. Never affects the webhook response.
#[derive(Clone)]
pub struct StatusReporter {
    storage: Database,
    oauth: TwitchOAuthClient,
    helix: HelixClient,
    chat_enabled: bool,
    timeout: Duration,
}

impl StatusReporter {
    pub fn new(
        storage: Database,
        oauth: TwitchOAuthClient,
        helix: HelixClient,
        chat_enabled: bool,
        timeout: Duration,
    ) -> Self {
        Self {
            storage,
            oauth,
            helix,
            chat_enabled,
            timeout,
        }
    }

    /// Runs [`Self::report`] detached; errors end up in logs and metrics only.
    pub fn spawn(&self, report: StatusReport) -> tokio::task::JoinHandle<()> {
        let reporter = self.clone();
        tokio::spawn(async move {
            let event_id = report.event.id.clone();
            let broadcaster_id = report.event.broadcaster_id.clone();
            let result = match tokio::time::timeout(reporter.timeout, reporter.report(&report)).await
            {
                Ok(Ok(())) => "ok",
                Ok(Err(err)) => {
                    warn!(stage = "status", %event_id, %broadcaster_id, error = %err, "status report failed");
                    "error"
                }
                Err(_) => {
                    warn!(stage = "status", %event_id, %broadcaster_id, "status report timed out");
                    "timeout"
                }
            };
            counter!("status_reports_total", "result" => result).increment(1);
        })
    }

    pub async fn report(&self, report: &StatusReport) -> Result<(), StatusError> {
        let event = &report.event;
        let user = self.storage.users().fetch(&event.broadcaster_id).await?;
        if !user.has_twitch_tokens() {
            return Err(StatusError::MissingTokens);
        }

        let token = self.oauth.refresh_token(&user.twitch_refresh_token).await?;
        let refresh_token = token
            .refresh_token
            .as_deref()
            .unwrap_or(&user.twitch_refresh_token);
        if let Err(err) = self
            .storage
            .users()
            .update_twitch_tokens(
                &event.broadcaster_id,
                &token.access_token,
                refresh_token,
                report.now,
            )
            .await
        {
            warn!(stage = "status", event_id = %event.id, error = %err, "failed to persist twitch tokens");
        }

        let status = if report.success {
            HelixRedemptionStatus::Fulfilled
        } else {
            HelixRedemptionStatus::Canceled
        };
        let updated = self
            .helix
            .update_redemption(
                &token.access_token,
                &UpdateRedemptionRequest {
                    broadcaster_id: &event.broadcaster_id,
                    reward_id: &event.reward_id,
                    redemption_id: &event.id,
                    status,
                },
            )
            .await
            .map_err(StatusError::Redemption);
        match &updated {
            Ok(()) => info!(
                stage = "status",
                event_id = %event.id,
                status = status.as_str(),
                "redemption status updated"
            ),
            Err(err) => warn!(stage = "status", event_id = %event.id, error = %err, "redemption status update failed"),
        }

        if report.success && self.chat_enabled {
            let message = chat_message(&event.user_name, &report.track);
            self.helix
                .send_chat_message(
                    &token.access_token,
                    &ChatMessageRequest {
                        broadcaster_id: &event.broadcaster_id,
                        sender_id: &event.broadcaster_id,
                        message: &message,
                    },
                )
                .await
                .map_err(StatusError::Chat)?;
        }

        updated
    }
}

/// `@viewer Enqueued 'Song' by Artist (3:05)`. The artist clause is left out
/// when the track has no artists.
pub fn chat_message(user_name: &str, track: &Track) -> String {
    let total_secs = track.duration_ms / 1000;
    let artists = track.artist_names();
    let by = if artists.is_empty() {
        String::new()
    } else {
        format!(" by {artists}")
    };
    format!(
        "@{} Enqueued '{}'{} ({}:{:02})",
        user_name,
        track.name,
        by,
        total_secs / 60,
        total_secs % 60
    )
}
