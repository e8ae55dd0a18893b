use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Account linking a Twitch broadcaster to their Spotify player.
///
/// Each token pair is either fully empty or fully populated.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct User {
    pub twitch_id: String,
    pub twitch_access_token: String,
    pub twitch_refresh_token: String,
    pub spotify_access_token: String,
    pub spotify_refresh_token: String,
    pub spotify_expiry: Option<DateTime<Utc>>,
    pub subscribed: bool,
    pub subscription_id: String,
    pub email: String,
}

impl User {
    /// Returns the stored Spotify credentials when both halves of the pair exist.
    pub fn spotify_tokens(&self) -> Option<SpotifyTokens> {
        if self.spotify_access_token.is_empty() || self.spotify_refresh_token.is_empty() {
            return None;
        }
        Some(SpotifyTokens {
            access_token: self.spotify_access_token.clone(),
            refresh_token: self.spotify_refresh_token.clone(),
            expiry: self.spotify_expiry,
        })
    }

    /// Returns `true` when the Twitch token pair is present.
    pub fn has_twitch_tokens(&self) -> bool {
        !self.twitch_access_token.is_empty() && !self.twitch_refresh_token.is_empty()
    }
}

/// Spotify OAuth token pair with its expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpotifyTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub expiry: Option<DateTime<Utc>>,
}

/// Per-broadcaster filtering rules for song requests.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Preference {
    pub twitch_id: String,
    pub explicit_songs_allowed: bool,
    pub custom_reward_id: String,
    /// Zero disables the length cap.
    pub max_song_length_millis: u64,
}

/// Outcome row appended once per terminal pipeline run that reached the queue call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub created_at: DateTime<Utc>,
    pub success: bool,
    pub broadcaster_id: String,
    pub spotify_track_id: String,
}
