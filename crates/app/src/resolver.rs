use async_trait::async_trait;
use reqwest::Client;
use songreq_core::{LinkPatternError, ShareLinkPattern, ShortLinkPattern};
use songreq_spotify::{AuthorizedSpotify, SpotifyError};
use songreq_util::LinkShapes;
use thiserror::Error;
use tokio::time::timeout_at;
use tracing::{debug, warn};

use crate::deadline::{Deadline, DeadlineExceeded};

/// Per-event inputs shared by every strategy.
pub struct ResolveContext<'a> {
    pub spotify: AuthorizedSpotify<'a>,
    pub deadline: Deadline,
}

/// A single track candidate derived from viewer input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub track_id: String,
    pub input: String,
    pub strategy: &'static str,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no track matches input {0:?}")]
    InvalidInput(String),
    #[error("spotify search failed: {0}")]
    Spotify(#[from] SpotifyError),
    #[error(transparent)]
    Deadline(#[from] DeadlineExceeded),
}

/// One way of turning viewer input into a track id. `Ok(None)` passes to the next strategy.
#[async_trait]
pub trait ResolveStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn attempt(
        &self,
        input: &str,
        ctx: &ResolveContext<'_>,
    ) -> Result<Option<String>, ResolveError>;
}

/// Ordered chain of strategies; the first one yielding an id wins.
pub struct TrackResolver {
    strategies: Vec<Box<dyn ResolveStrategy>>,
}

impl TrackResolver {
    pub fn new(strategies: Vec<Box<dyn ResolveStrategy>>) -> Self {
        Self { strategies }
    }

    /// Direct share link, then short link, then free-text search.
    pub fn standard(links: &LinkShapes, http: Client) -> Result<Self, LinkPatternError> {
        let share = ShareLinkPattern::new(&links.share_host)?;
        let short = ShortLinkPattern::new(&links.short_link_prefix)?;
        Ok(Self::new(vec![
            Box::new(DirectLink {
                pattern: share.clone(),
            }),
            Box::new(ShortLink {
                pattern: short,
                share,
                http,
            }),
            Box::new(Search),
        ]))
    }

    pub async fn resolve(
        &self,
        input: &str,
        ctx: &ResolveContext<'_>,
    ) -> Result<Resolution, ResolveError> {
        for strategy in &self.strategies {
            debug!(stage = "resolver", strategy = strategy.name(), "attempting strategy");
            if let Some(track_id) = strategy.attempt(input, ctx).await? {
                return Ok(Resolution {
                    track_id,
                    input: input.to_string(),
                    strategy: strategy.name(),
                });
            }
        }
        Err(ResolveError::InvalidInput(input.to_string()))
    }
}

pub struct DirectLink {
    pattern: ShareLinkPattern,
}

#[async_trait]
impl ResolveStrategy for DirectLink {
    fn name(&self) -> &'static str {
        "direct_link"
    }

    async fn attempt(
        &self,
        input: &str,
        _ctx: &ResolveContext<'_>,
    ) -> Result<Option<String>, ResolveError> {
        Ok(self.pattern.track_id(input).map(str::to_string))
    }
}

/// Follows a shortener link and looks for a share link in the landing page.
pub struct ShortLink {
    pattern: ShortLinkPattern,
    share: ShareLinkPattern,
    http: Client,
}

#[async_trait]
impl ResolveStrategy for ShortLink {
    fn name(&self) -> &'static str {
        "short_link"
    }

    async fn attempt(
        &self,
        input: &str,
        ctx: &ResolveContext<'_>,
    ) -> Result<Option<String>, ResolveError> {
        let Some(link) = self.pattern.find(input) else {
            return Ok(None);
        };

        let fetched = timeout_at(ctx.deadline.instant(), self.fetch(link))
            .await
            .map_err(|_| DeadlineExceeded)?;

        match fetched {
            Ok(found) => {
                if found.is_none() {
                    warn!(stage = "resolver", %link, "short link did not lead to a track");
                }
                Ok(found)
            }
            Err(err) => {
                warn!(stage = "resolver", %link, error = %err, "failed to follow short link");
                Ok(None)
            }
        }
    }
}

impl ShortLink {
    async fn fetch(&self, link: &str) -> Result<Option<String>, reqwest::Error> {
        let response = self.http.get(link).send().await?.error_for_status()?;
        if let Some(id) = self.share.track_id(response.url().as_str()) {
            return Ok(Some(id.to_string()));
        }
        let body = response.text().await?;
        Ok(self.share.track_id(&body).map(str::to_string))
    }
}

/// Last resort: top hit of a track search for the raw input.
pub struct Search;

#[async_trait]
impl ResolveStrategy for Search {
    fn name(&self) -> &'static str {
        "search"
    }

    async fn attempt(
        &self,
        input: &str,
        ctx: &ResolveContext<'_>,
    ) -> Result<Option<String>, ResolveError> {
        let query = input.trim();
        if query.is_empty() {
            return Err(ResolveError::InvalidInput(input.to_string()));
        }

        let hit = ctx
            .deadline
            .run::<_, _, SpotifyError, ResolveError>(ctx.spotify.search_track(query))
            .await?;
        match hit {
            Some(track) => Ok(Some(track.id)),
            None => Err(ResolveError::InvalidInput(input.to_string())),
        }
    }
}
