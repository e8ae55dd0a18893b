use crate::{Preference, RedemptionEvent};

/// Reward title marker used before broadcasters had a dedicated custom reward.
pub const SONG_REQUEST_MARKER: &str = "TwitchSongRequests";

/// Decides whether a redemption is a song request for this broadcaster.
///
/// A configured custom reward id is authoritative. Without one, the reward
/// title must contain [`SONG_REQUEST_MARKER`].
pub fn is_song_request(event: &RedemptionEvent, preference: Option<&Preference>) -> bool {
    match preference {
        Some(pref) if !pref.custom_reward_id.is_empty() => event.reward_id == pref.custom_reward_id,
        _ => event.reward_title.contains(SONG_REQUEST_MARKER),
    }
}
