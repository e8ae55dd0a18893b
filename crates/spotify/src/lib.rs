pub mod api;
pub mod oauth;

pub use api::{Artist, AuthorizedSpotify, SpotifyApiClient, SpotifyError, Track};
pub use oauth::{SpotifyOAuthClient, SpotifyTokenResponse};
