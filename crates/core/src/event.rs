use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Channel point redemption delivered by an EventSub notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedemptionEvent {
    pub id: String,
    pub broadcaster_id: String,
    pub broadcaster_login: String,
    pub user_name: String,
    pub user_input: String,
    pub reward_id: String,
    pub reward_title: String,
    pub redeemed_at: DateTime<Utc>,
}

/// Errors raised while decoding the `event` block of a notification.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("missing event block in payload")]
    MissingEvent,
    #[error("failed to parse event: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid timestamp for field 'redeemed_at': {0}")]
    InvalidTimestamp(chrono::ParseError),
}

impl RedemptionEvent {
    /// Decodes the raw `event` JSON of a `channel.channel_points_custom_reward_redemption.add`
    /// notification.
    pub fn from_event_json(event: Option<&Value>) -> Result<Self, DecodeError> {
        let event = match event {
            Some(Value::Null) | None => return Err(DecodeError::MissingEvent),
            Some(value) => value,
        };
        let wire = WireRedemption::deserialize(event)?;

        let redeemed_at = DateTime::parse_from_rfc3339(&wire.redeemed_at)
            .map_err(DecodeError::InvalidTimestamp)?
            .with_timezone(&Utc);

        Ok(Self {
            id: wire.id,
            broadcaster_id: wire.broadcaster_user_id,
            broadcaster_login: wire.broadcaster_user_login,
            user_name: wire.user_name,
            user_input: wire.user_input,
            reward_id: wire.reward.id,
            reward_title: wire.reward.title,
            redeemed_at,
        })
    }
}

#[derive(Debug, Deserialize)]
struct WireRedemption {
    id: String,
    broadcaster_user_id: String,
    #[serde(default)]
    broadcaster_user_login: String,
    #[serde(default)]
    user_name: String,
    #[serde(default)]
    user_input: String,
    redeemed_at: String,
    reward: WireReward,
}

#[derive(Debug, Deserialize)]
struct WireReward {
    id: String,
    #[serde(default)]
    title: String,
}
