//! Domain types and pure rules for the song-request pipeline.
//!
//! Nothing in this crate performs I/O; the app crate feeds it data loaded from
//! storage and the external APIs.

pub mod event;
pub mod gate;
pub mod links;
pub mod policy;
pub mod types;

pub use event::{DecodeError, RedemptionEvent};
pub use gate::{is_song_request, SONG_REQUEST_MARKER};
pub use links::{LinkPatternError, ShareLinkPattern, ShortLinkPattern};
pub use policy::{check_track, PolicyViolation, TrackFacts};
pub use types::{NewMessage, Preference, SpotifyTokens, User};
