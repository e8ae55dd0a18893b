use std::{env, fmt, net::SocketAddr, time::Duration};

use url::Url;

use super::server_bind_address;

const DEFAULT_DATABASE_URL: &str = "sqlite://songrequests.db?mode=rwc";
const DEFAULT_TWITCH_OAUTH_URL: &str = "https://id.twitch.tv/oauth2/";
const DEFAULT_TWITCH_HELIX_URL: &str = "https://api.twitch.tv/helix/";
const DEFAULT_SPOTIFY_ACCOUNTS_URL: &str = "https://accounts.spotify.com/";
const DEFAULT_SPOTIFY_API_URL: &str = "https://api.spotify.com/v1/";
const DEFAULT_SHARE_HOST: &str = "open.spotify.com";
const DEFAULT_SHORT_LINK_PREFIX: &str = "https://spotify.link/";
const DEFAULT_PIPELINE_TIMEOUT_SECS: u64 = 30;

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Base URLs of the external APIs the pipeline talks to.
#[derive(Debug, Clone)]
pub struct ServiceUrls {
    pub twitch_oauth: Url,
    pub twitch_helix: Url,
    pub spotify_accounts: Url,
    pub spotify_api: Url,
}

/// Link shapes recognised when resolving viewer input into a track.
#[derive(Debug, Clone)]
pub struct LinkShapes {
    /// Host of direct share links, e.g. `open.spotify.com`.
    pub share_host: String,
    /// Prefix of obfuscated short links, e.g. `https://spotify.link/`.
    pub short_link_prefix: String,
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    pub eventsub_secret: String,
    pub twitch_client_id: String,
    pub twitch_client_secret: String,
    pub spotify_client_id: String,
    pub spotify_client_secret: String,
    pub urls: ServiceUrls,
    pub links: LinkShapes,
    pub pipeline_timeout: Duration,
    pub chat_notifications: bool,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;

        let urls = ServiceUrls {
            twitch_oauth: url_var("TWITCH_OAUTH_BASE_URL", DEFAULT_TWITCH_OAUTH_URL)?,
            twitch_helix: url_var("TWITCH_HELIX_BASE_URL", DEFAULT_TWITCH_HELIX_URL)?,
            spotify_accounts: url_var("SPOTIFY_ACCOUNTS_BASE_URL", DEFAULT_SPOTIFY_ACCOUNTS_URL)?,
            spotify_api: url_var("SPOTIFY_API_BASE_URL", DEFAULT_SPOTIFY_API_URL)?,
        };

        let links = LinkShapes {
            share_host: optional_var("SPOTIFY_SHARE_HOST", DEFAULT_SHARE_HOST),
            short_link_prefix: optional_var("SPOTIFY_SHORT_LINK_PREFIX", DEFAULT_SHORT_LINK_PREFIX),
        };

        let timeout_raw = optional_var(
            "PIPELINE_TIMEOUT_SECS",
            &DEFAULT_PIPELINE_TIMEOUT_SECS.to_string(),
        );
        let timeout_secs = match timeout_raw.parse::<u64>() {
            Ok(0) | Err(_) => return Err(ConfigError::InvalidTimeout(timeout_raw)),
            Ok(secs) => secs,
        };

        let chat_raw = optional_var("CHAT_NOTIFICATIONS", "false");
        let chat_notifications = match chat_raw.as_str() {
            "true" | "1" => true,
            "false" | "0" => false,
            _ => return Err(ConfigError::InvalidFlag("CHAT_NOTIFICATIONS", chat_raw)),
        };

        Ok(Self {
            bind_addr,
            environment,
            database_url: optional_var("DATABASE_URL", DEFAULT_DATABASE_URL),
            eventsub_secret: required_var("TWITCH_SECRET")?,
            twitch_client_id: required_var("TWITCH_CLIENT_ID")?,
            twitch_client_secret: required_var("TWITCH_CLIENT_SECRET")?,
            spotify_client_id: required_var("SPOTIFY_CLIENT_ID")?,
            spotify_client_secret: required_var("SPOTIFY_CLIENT_SECRET")?,
            urls,
            links,
            pipeline_timeout: Duration::from_secs(timeout_secs),
            chat_notifications,
        })
    }
}

fn required_var(name: &'static str) -> Result<String, ConfigError> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::Missing(name)),
    }
}

fn optional_var(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn url_var(name: &'static str, default: &str) -> Result<Url, ConfigError> {
    let value = optional_var(name, default);
    Url::parse(&value).map_err(|err| ConfigError::InvalidUrl(name, err))
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    Missing(&'static str),
    InvalidUrl(&'static str, url::ParseError),
    InvalidTimeout(String),
    InvalidFlag(&'static str, String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::Missing(name) => write!(f, "{name} must be set"),
            Self::InvalidUrl(name, err) => write!(f, "invalid {name} value: {err}"),
            Self::InvalidTimeout(value) => write!(
                f,
                "PIPELINE_TIMEOUT_SECS must be a positive integer (got {value})"
            ),
            Self::InvalidFlag(name, value) => {
                write!(f, "{name} must be 'true' or 'false' (got {value})")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
