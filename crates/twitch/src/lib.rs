pub mod helix;
pub mod oauth;

pub use helix::{
    ChatMessageRequest, HelixClient, HelixError, HelixRedemptionStatus, UpdateRedemptionRequest,
};
pub use oauth::{OAuthError, TokenResponse, TwitchOAuthClient};
