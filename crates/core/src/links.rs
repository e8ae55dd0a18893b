use regex::Regex;
use thiserror::Error;

/// Error raised when a configured link shape cannot be compiled.
#[derive(Debug, Error)]
#[error("invalid link pattern: {0}")]
pub struct LinkPatternError(#[from] regex::Error);

/// Matches direct share links such as `https://open.spotify.com/intl-de/track/<id>`.
#[derive(Debug, Clone)]
pub struct ShareLinkPattern {
    regex: Regex,
}

impl ShareLinkPattern {
    /// Builds the pattern for the given share host, e.g. `open.spotify.com`.
    pub fn new(host: &str) -> Result<Self, LinkPatternError> {
        let pattern = format!(
            r"https://{}/(?:[^/\s?#]+/)*?track/([A-Za-z0-9]+)",
            regex::escape(host)
        );
        Ok(Self {
            regex: Regex::new(&pattern)?,
        })
    }

    /// Returns the track id embedded in the first share link found in `text`.
    pub fn track_id<'a>(&self, text: &'a str) -> Option<&'a str> {
        self.regex
            .captures(text)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
    }
}

/// Matches obfuscated short links such as `https://spotify.link/<token>`.
#[derive(Debug, Clone)]
pub struct ShortLinkPattern {
    regex: Regex,
}

impl ShortLinkPattern {
    /// Builds the pattern for the given link prefix, e.g. `https://spotify.link/`.
    pub fn new(prefix: &str) -> Result<Self, LinkPatternError> {
        let pattern = format!(r"{}[A-Za-z0-9]+", regex::escape(prefix));
        Ok(Self {
            regex: Regex::new(&pattern)?,
        })
    }

    /// Returns the first short link found in `text`.
    pub fn find<'a>(&self, text: &'a str) -> Option<&'a str> {
        self.regex.find(text).map(|m| m.as_str())
    }
}
