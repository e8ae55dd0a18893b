use thiserror::Error;

use crate::Preference;

/// Track attributes the eligibility rules look at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackFacts {
    pub explicit: bool,
    pub duration_millis: u64,
}

/// Reasons a resolved track is refused before it reaches the queue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyViolation {
    #[error("user does not allow adding explicit songs to the queue")]
    ExplicitSong,
    #[error("song is too long: {duration_millis}ms > {max_millis}ms")]
    SongTooLong { duration_millis: u64, max_millis: u64 },
}

impl PolicyViolation {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Self::ExplicitSong => "explicit_song",
            Self::SongTooLong { .. } => "song_too_long",
        }
    }
}

/// Applies the broadcaster's filtering rules; the first violation wins.
///
/// An absent preference disallows explicit songs and imposes no length cap.
pub fn check_track(track: TrackFacts, preference: Option<&Preference>) -> Result<(), PolicyViolation> {
    let explicit_allowed = preference.is_some_and(|pref| pref.explicit_songs_allowed);
    if track.explicit && !explicit_allowed {
        return Err(PolicyViolation::ExplicitSong);
    }

    if let Some(max_millis) = preference
        .map(|pref| pref.max_song_length_millis)
        .filter(|max| *max > 0)
    {
        if track.duration_millis > max_millis {
            return Err(PolicyViolation::SongTooLong {
                duration_millis: track.duration_millis,
                max_millis,
            });
        }
    }

    Ok(())
}
