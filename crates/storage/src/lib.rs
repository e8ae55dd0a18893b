use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{migrate::MigrateError, sqlite::SqlitePoolOptions, Row, SqlitePool};
use thiserror::Error;

use songreq_core::{NewMessage, Preference, SpotifyTokens, User};

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(StorageError::Connect)?;

        apply_pragmas(&pool).await?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle for reading and updating linked accounts.
    pub fn users(&self) -> UserRepository {
        UserRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for broadcaster preferences.
    pub fn preferences(&self) -> PreferenceRepository {
        PreferenceRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle to the append-only outcome log.
    pub fn messages(&self) -> MessageRepository {
        MessageRepository {
            pool: self.pool.clone(),
        }
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn apply_pragmas(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::query("PRAGMA journal_mode = WAL;")
        .fetch_one(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA synchronous = NORMAL;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    Ok(())
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to apply pragma: {0}")]
    Pragma(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for the `users` table.
#[derive(Clone)]
pub struct UserRepository {
    pool: SqlitePool,
}

impl UserRepository {
    /// Loads the user linked to the given Twitch broadcaster id.
    pub async fn fetch(&self, twitch_id: &str) -> Result<User, UserError> {
        let row = sqlx::query(
            "SELECT id, twitch_access, twitch_refresh, spotify_access, spotify_refresh, \
                    spotify_expiry, subscribed, subscription_id, email \
               FROM users WHERE id = ?",
        )
        .bind(twitch_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(UserError::NotFound)?;

        let spotify_expiry = row
            .get::<Option<String>, _>("spotify_expiry")
            .map(|raw| parse_rfc3339(&raw))
            .transpose()
            .map_err(UserError::InvalidTimestamp)?;
        let subscribed: i64 = row.get("subscribed");

        Ok(User {
            twitch_id: row.get("id"),
            twitch_access_token: row.get("twitch_access"),
            twitch_refresh_token: row.get("twitch_refresh"),
            spotify_access_token: row.get("spotify_access"),
            spotify_refresh_token: row.get("spotify_refresh"),
            spotify_expiry,
            subscribed: subscribed != 0,
            subscription_id: row.get("subscription_id"),
            email: row.get("email"),
        })
    }

    /// Inserts the user or replaces every column of an existing row.
    pub async fn upsert(&self, user: &User, now: DateTime<Utc>) -> Result<(), UserError> {
        sqlx::query(
            "INSERT INTO users \
             (id, twitch_access, twitch_refresh, spotify_access, spotify_refresh, spotify_expiry, \
              subscribed, subscription_id, email, last_updated) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
               twitch_access = excluded.twitch_access, \
               twitch_refresh = excluded.twitch_refresh, \
               spotify_access = excluded.spotify_access, \
               spotify_refresh = excluded.spotify_refresh, \
               spotify_expiry = excluded.spotify_expiry, \
               subscribed = excluded.subscribed, \
               subscription_id = excluded.subscription_id, \
               email = excluded.email, \
               last_updated = excluded.last_updated",
        )
        .bind(&user.twitch_id)
        .bind(&user.twitch_access_token)
        .bind(&user.twitch_refresh_token)
        .bind(&user.spotify_access_token)
        .bind(&user.spotify_refresh_token)
        .bind(user.spotify_expiry.map(to_rfc3339))
        .bind(i64::from(user.subscribed))
        .bind(&user.subscription_id)
        .bind(&user.email)
        .bind(to_rfc3339(now))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Replaces the Spotify token pair and expiry after a refresh.
    pub async fn update_spotify_tokens(
        &self,
        twitch_id: &str,
        tokens: &SpotifyTokens,
        now: DateTime<Utc>,
    ) -> Result<(), UserError> {
        let result = sqlx::query(
            "UPDATE users \
                SET spotify_access = ?, spotify_refresh = ?, spotify_expiry = ?, last_updated = ? \
              WHERE id = ?",
        )
        .bind(&tokens.access_token)
        .bind(&tokens.refresh_token)
        .bind(tokens.expiry.map(to_rfc3339))
        .bind(to_rfc3339(now))
        .bind(twitch_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(UserError::NotFound);
        }
        Ok(())
    }

    /// Replaces the Twitch token pair after a refresh.
    pub async fn update_twitch_tokens(
        &self,
        twitch_id: &str,
        access_token: &str,
        refresh_token: &str,
        now: DateTime<Utc>,
    ) -> Result<(), UserError> {
        let result = sqlx::query(
            "UPDATE users SET twitch_access = ?, twitch_refresh = ?, last_updated = ? WHERE id = ?",
        )
        .bind(access_token)
        .bind(refresh_token)
        .bind(to_rfc3339(now))
        .bind(twitch_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(UserError::NotFound);
        }
        Ok(())
    }
}

/// Errors that can occur while reading or updating users.
#[derive(Debug, Error)]
pub enum UserError {
    #[error("user not found")]
    NotFound,
    #[error("stored timestamp is invalid: {0}")]
    InvalidTimestamp(chrono::ParseError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for the `preferences` table.
#[derive(Clone)]
pub struct PreferenceRepository {
    pool: SqlitePool,
}

impl PreferenceRepository {
    /// Loads the broadcaster's preferences; `None` when none were saved.
    pub async fn fetch(&self, twitch_id: &str) -> Result<Option<Preference>, PreferenceError> {
        let row = sqlx::query(
            "SELECT id, explicit, reward_id, max_song_length FROM preferences WHERE id = ?",
        )
        .bind(twitch_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| {
            let explicit: i64 = row.get("explicit");
            let max_song_length: i64 = row.get("max_song_length");
            Preference {
                twitch_id: row.get("id"),
                explicit_songs_allowed: explicit != 0,
                custom_reward_id: row.get("reward_id"),
                max_song_length_millis: u64::try_from(max_song_length).unwrap_or(0),
            }
        }))
    }

    /// Inserts or replaces the broadcaster's preferences.
    pub async fn upsert(
        &self,
        preference: &Preference,
        now: DateTime<Utc>,
    ) -> Result<(), PreferenceError> {
        let max_song_length = i64::try_from(preference.max_song_length_millis).unwrap_or(i64::MAX);
        sqlx::query(
            "INSERT INTO preferences (id, explicit, reward_id, max_song_length, last_updated) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
               explicit = excluded.explicit, \
               reward_id = excluded.reward_id, \
               max_song_length = excluded.max_song_length, \
               last_updated = excluded.last_updated",
        )
        .bind(&preference.twitch_id)
        .bind(i64::from(preference.explicit_songs_allowed))
        .bind(&preference.custom_reward_id)
        .bind(max_song_length)
        .bind(to_rfc3339(now))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Errors that can occur while reading preferences.
#[derive(Debug, Error)]
pub enum PreferenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for the append-only `messages` table.
#[derive(Clone)]
pub struct MessageRepository {
    pool: SqlitePool,
}

impl MessageRepository {
    /// Appends one outcome row.
    pub async fn append(&self, message: &NewMessage) -> Result<(), MessageError> {
        sqlx::query(
            "INSERT INTO messages (created_at, success, broadcaster_id, spotify_track) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(to_rfc3339(message.created_at))
        .bind(i64::from(message.success))
        .bind(&message.broadcaster_id)
        .bind(&message.spotify_track_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Errors that can occur while appending outcome rows.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_rfc3339(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(value).map(|dt| dt.with_timezone(&Utc))
}
