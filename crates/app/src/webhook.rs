use std::time::Instant;

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use metrics::{counter, histogram};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use songreq_core::RedemptionEvent;
use subtle::ConstantTimeEq;
use tracing::{error, info, warn};

use crate::problem::ProblemResponse;
use crate::router::AppState;

const HEADER_MESSAGE_ID: &str = "Twitch-Eventsub-Message-Id";
const HEADER_TIMESTAMP: &str = "Twitch-Eventsub-Message-Timestamp";
const HEADER_SIGNATURE: &str = "Twitch-Eventsub-Message-Signature";
const HEADER_MESSAGE_TYPE: &str = "Twitch-Eventsub-Message-Type";

const MAX_TIMESTAMP_SKEW_SECS: i64 = 600;

pub async fn handle(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProblemResponse> {
    let start = Instant::now();
    let message_type = MessageType::from_header(
        headers
            .get(HEADER_MESSAGE_TYPE)
            .and_then(|value| value.to_str().ok()),
    );
    let label = message_type.metric_label();

    let result = dispatch(&state, &headers, &body, message_type).await;
    histogram!("webhook_ack_latency_seconds", "type" => label)
        .record(start.elapsed().as_secs_f64());
    result
}

async fn dispatch(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
    message_type: MessageType,
) -> Result<Response, ProblemResponse> {
    let message_id = authenticate(state, headers, body).map_err(|problem| {
        counter!("eventsub_invalid_signature_total").increment(1);
        warn!(stage = "ingress", problem = problem.kind(), "webhook request rejected");
        problem
    })?;
    counter!("eventsub_ingress_total", "type" => message_type.metric_label()).increment(1);

    let envelope: Envelope = serde_json::from_slice(body).map_err(|err| {
        warn!(stage = "ingress", %message_id, error = %err, "malformed envelope");
        ProblemResponse::bad_request("invalid_json", format!("failed to parse payload: {err}"))
    })?;

    match message_type {
        MessageType::Verification => {
            // An absent challenge is echoed back as an empty body.
            let challenge = envelope.challenge.unwrap_or_default();
            info!(
                stage = "ingress",
                %message_id,
                subscription_type = envelope.subscription.as_ref().map(|sub| sub.kind.as_str()).unwrap_or(""),
                "subscription verification"
            );
            Ok((
                StatusCode::OK,
                [(header::CONTENT_TYPE, "text/plain")],
                challenge,
            )
                .into_response())
        }
        MessageType::Revocation => {
            let subscription = envelope.subscription.unwrap_or_default();
            warn!(
                stage = "ingress",
                %message_id,
                subscription_id = %subscription.id,
                status = %subscription.status,
                subscription_type = %subscription.kind,
                "subscription revoked"
            );
            Ok(accepted())
        }
        MessageType::Notification => {
            handle_notification(state, &message_id, envelope.event.as_ref()).await;
            Ok(accepted())
        }
    }
}

async fn handle_notification(state: &AppState, message_id: &str, event: Option<&Value>) {
    let event = match RedemptionEvent::from_event_json(event) {
        Ok(event) => event,
        Err(err) => {
            warn!(stage = "ingress", %message_id, error = %err, "dropping undecodable event");
            return;
        }
    };

    if !state.dedup().check_and_insert(&event.id) {
        counter!("eventsub_duplicate_total").increment(1);
        info!(
            stage = "dedup",
            %message_id,
            event_id = %event.id,
            broadcaster_id = %event.broadcaster_id,
            "duplicate delivery skipped"
        );
        return;
    }

    // Detached so a dropped request cannot abandon a half-finished pipeline.
    let pipeline = state.pipeline();
    let now = state.now();
    let event_id = event.id.clone();
    let task = tokio::spawn(async move { pipeline.run(event, now).await });
    if let Err(err) = task.await {
        error!(stage = "pipeline", %message_id, %event_id, error = %err, "pipeline task failed");
    }
}

fn accepted() -> Response {
    (StatusCode::OK, "ok").into_response()
}

/// Checks headers, replay window and HMAC. Returns the message id on success.
fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<String, ProblemResponse> {
    let message_id = required_header(headers, HEADER_MESSAGE_ID)?;
    let timestamp_raw = required_header(headers, HEADER_TIMESTAMP)?;
    let signature = required_header(headers, HEADER_SIGNATURE)?;

    let timestamp = parse_timestamp(timestamp_raw)
        .map_err(|err| ProblemResponse::unauthorized("invalid_timestamp", err))?;
    let skew = state
        .now()
        .signed_duration_since(timestamp)
        .num_seconds()
        .abs();
    if skew > MAX_TIMESTAMP_SKEW_SECS {
        return Err(ProblemResponse::unauthorized(
            "timestamp_out_of_range",
            "timestamp outside the allowed ±10 minute window",
        ));
    }

    verify_signature(state.webhook_secret(), message_id, timestamp_raw, body, signature)
        .map_err(|err| ProblemResponse::unauthorized("invalid_signature", err))?;

    Ok(message_id.to_string())
}

fn required_header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, ProblemResponse> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ProblemResponse::unauthorized("missing_header", format!("missing header {name}")))
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| format!("invalid RFC3339 timestamp: {err}"))
}

/// `sha256=` + hex(HMAC-SHA256(secret, id || timestamp || body)), compared in constant time.
fn verify_signature(
    secret: &[u8],
    message_id: &str,
    timestamp: &str,
    body: &[u8],
    provided: &str,
) -> Result<(), String> {
    let hex_part = provided
        .strip_prefix("sha256=")
        .ok_or_else(|| "signature must start with 'sha256='".to_string())?;
    let provided_bytes =
        hex::decode(hex_part).map_err(|_| "signature is not valid hex".to_string())?;

    let mut mac = Hmac::<Sha256>::new_from_slice(secret)
        .map_err(|_| "failed to initialize signature verifier".to_string())?;
    mac.update(message_id.as_bytes());
    mac.update(timestamp.as_bytes());
    mac.update(body);
    let expected = mac.finalize().into_bytes();

    if bool::from(expected.as_slice().ct_eq(provided_bytes.as_slice())) {
        Ok(())
    } else {
        Err("signature mismatch".to_string())
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    subscription: Option<Subscription>,
    #[serde(default)]
    challenge: Option<String>,
    #[serde(default)]
    event: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct Subscription {
    #[serde(default)]
    id: String,
    #[serde(default)]
    status: String,
    #[serde(default, rename = "type")]
    kind: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageType {
    Verification,
    Notification,
    Revocation,
}

impl MessageType {
    /// Anything other than the two control types is handled as a notification.
    fn from_header(value: Option<&str>) -> Self {
        match value {
            Some("webhook_callback_verification") => Self::Verification,
            Some("revocation") => Self::Revocation,
            _ => Self::Notification,
        }
    }

    fn metric_label(self) -> &'static str {
        match self {
            Self::Verification => "verification",
            Self::Notification => "notification",
            Self::Revocation => "revocation",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::time::Duration;

    use axum::{
        body::Body,
        http::{HeaderValue, Method, Request},
    };
    use http_body_util::BodyExt;
    use httpmock::prelude::*;
    use serde_json::json;
    use songreq_core::{Preference, SONG_REQUEST_MARKER};
    use tower::ServiceExt;

    use crate::router::app_router;
    use crate::test_support::{Harness, BROADCASTER_ID, FIXED_NOW, SECRET, SHARE_HOST};

    fn sign(message_id: &str, timestamp: &str, body: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(SECRET.as_bytes()).expect("hmac");
        mac.update(message_id.as_bytes());
        mac.update(timestamp.as_bytes());
        mac.update(body.as_bytes());
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    fn signed_headers(message_type: Option<&str>, message_id: &str, body: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(message_type) = message_type {
            headers.insert(
                HEADER_MESSAGE_TYPE,
                HeaderValue::from_str(message_type).expect("type header"),
            );
        }
        headers.insert(
            HEADER_MESSAGE_ID,
            HeaderValue::from_str(message_id).expect("id header"),
        );
        headers.insert(HEADER_TIMESTAMP, HeaderValue::from_static(FIXED_NOW));
        headers.insert(
            HEADER_SIGNATURE,
            HeaderValue::from_str(&sign(message_id, FIXED_NOW, body)).expect("signature header"),
        );
        headers
    }

    async fn call_webhook(state: AppState, headers: HeaderMap, body: String) -> Response {
        let mut request = Request::builder()
            .method(Method::POST)
            .uri("/callback")
            .body(Body::from(body))
            .expect("request");
        *request.headers_mut() = headers;
        request.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );

        app_router(state).oneshot(request).await.expect("response")
    }

    async fn deliver(harness: &Harness, message_id: &str, body: String) -> Response {
        let headers = signed_headers(Some("notification"), message_id, &body);
        call_webhook(harness.state.clone(), headers, body).await
    }

    async fn body_text(response: Response) -> String {
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        String::from_utf8(bytes.to_vec()).expect("utf-8")
    }

    fn redemption(event_id: &str, reward_id: &str, title: &str, input: Value) -> String {
        json!({
            "subscription": {
                "id": "sub-1",
                "status": "enabled",
                "type": "channel.channel_points_custom_reward_redemption.add",
                "version": "1",
                "condition": { "broadcaster_user_id": BROADCASTER_ID }
            },
            "event": {
                "id": event_id,
                "broadcaster_user_id": BROADCASTER_ID,
                "broadcaster_user_login": "streamer",
                "broadcaster_user_name": "Streamer",
                "user_id": "u-1",
                "user_login": "viewer",
                "user_name": "Viewer",
                "user_input": input,
                "status": "unfulfilled",
                "reward": {
                    "id": reward_id,
                    "title": title,
                    "cost": 100,
                    "prompt": "Paste a link"
                },
                "redeemed_at": FIXED_NOW
            }
        })
        .to_string()
    }

    fn song_request(event_id: &str, input: &str) -> String {
        redemption(
            event_id,
            "reward-1",
            &format!("{SONG_REQUEST_MARKER} song request"),
            json!(input),
        )
    }

    fn direct_link(track_id: &str) -> String {
        format!("https://{SHARE_HOST}/track/{track_id}")
    }

    /// Polls `condition` for up to three seconds.
    async fn eventually<F, Fut>(mut condition: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..60 {
            if condition().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[tokio::test]
    async fn verification_returns_challenge() {
        let harness = Harness::new().await;
        let queue = harness.mock_queue(204).await;
        let body = json!({
            "challenge": "abc123",
            "subscription": {
                "id": "sub-1",
                "status": "webhook_callback_verification_pending",
                "type": "channel.channel_points_custom_reward_redemption.add"
            }
        })
        .to_string();

        let headers = signed_headers(Some("webhook_callback_verification"), "msg-verify", &body);
        let response = call_webhook(harness.state.clone(), headers, body).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "abc123");
        assert_eq!(queue.hits_async().await, 0);
    }

    #[tokio::test]
    async fn verification_without_challenge_is_acknowledged() {
        let harness = Harness::new().await;
        let body = json!({
            "subscription": {
                "id": "sub-1",
                "status": "webhook_callback_verification_pending",
                "type": "channel.channel_points_custom_reward_redemption.add"
            }
        })
        .to_string();

        let headers = signed_headers(Some("webhook_callback_verification"), "msg-verify-2", &body);
        let response = call_webhook(harness.state.clone(), headers, body).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "");
    }

    #[tokio::test]
    async fn direct_link_is_queued_and_recorded() {
        let harness = Harness::new().await;
        harness.seed_user().await;
        let refresh = harness.mock_spotify_refresh().await;
        harness.mock_track("XYZ", false, 180_000).await;
        let queue = harness
            .server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/me/player/queue")
                    .query_param("uri", "spotify:track:XYZ")
                    .header("authorization", "Bearer fresh-access");
                then.status(204);
            })
            .await;

        let response = deliver(&harness, "msg-1", song_request("red-1", &direct_link("XYZ"))).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "ok");
        refresh.assert_async().await;
        queue.assert_async().await;
        assert_eq!(
            harness.message_rows().await,
            vec![(true, BROADCASTER_ID.to_string(), "XYZ".to_string())]
        );

        let user = harness.database.users().fetch(BROADCASTER_ID).await.expect("user");
        assert_eq!(user.spotify_access_token, "fresh-access");
        assert_eq!(user.spotify_refresh_token, "spotify-refresh");
        assert_eq!(
            user.spotify_expiry,
            Some(harness.now + chrono::Duration::seconds(3600))
        );
    }

    #[tokio::test]
    async fn redelivery_is_processed_once() {
        let harness = Harness::new().await;
        harness.seed_user().await;
        harness.mock_spotify_refresh().await;
        harness.mock_track("XYZ", false, 180_000).await;
        let queue = harness.mock_queue(204).await;

        let body = song_request("red-dup", &direct_link("XYZ"));
        let first = deliver(&harness, "msg-dup", body.clone()).await;
        let second = deliver(&harness, "msg-dup", body).await;

        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(queue.hits_async().await, 1);
        assert_eq!(harness.message_rows().await.len(), 1);
    }

    #[tokio::test]
    async fn dropped_request_still_records_outcome() {
        let harness = Harness::new().await;
        harness.seed_user().await;
        harness.mock_spotify_refresh().await;
        harness.mock_track("XYZ", false, 180_000).await;
        let queue = harness
            .server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/me/player/queue");
                then.status(204).delay(Duration::from_millis(800));
            })
            .await;

        // the caller gives up while the queue call is in flight
        let body = song_request("red-drop", &direct_link("XYZ"));
        let first = tokio::time::timeout(
            Duration::from_millis(300),
            deliver(&harness, "msg-drop", body.clone()),
        )
        .await;
        assert!(first.is_err());

        let rows = &harness;
        assert!(eventually(move || async move { rows.message_rows().await.len() == 1 }).await);
        assert_eq!(queue.hits_async().await, 1);
        assert_eq!(
            harness.message_rows().await,
            vec![(true, BROADCASTER_ID.to_string(), "XYZ".to_string())]
        );

        let retry = deliver(&harness, "msg-drop", body).await;
        assert_eq!(retry.status(), StatusCode::OK);
        assert_eq!(queue.hits_async().await, 1);
        assert_eq!(harness.message_rows().await.len(), 1);
    }

    #[tokio::test]
    async fn unmatched_search_is_dropped() {
        let harness = Harness::new().await;
        harness.seed_user().await;
        harness.mock_spotify_refresh().await;
        let search = harness
            .server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/v1/search")
                    .query_param("q", "some random text");
                then.status(200).json_body(json!({ "tracks": { "items": [] } }));
            })
            .await;
        let queue = harness.mock_queue(204).await;

        let response = deliver(&harness, "msg-2", song_request("red-2", "some random text")).await;

        assert_eq!(response.status(), StatusCode::OK);
        search.assert_async().await;
        assert_eq!(queue.hits_async().await, 0);
        assert!(harness.message_rows().await.is_empty());
    }

    #[tokio::test]
    async fn explicit_track_is_rejected_without_preference() {
        let harness = Harness::new().await;
        harness.seed_user().await;
        harness.mock_spotify_refresh().await;
        harness.mock_track("EXP", true, 180_000).await;
        let queue = harness.mock_queue(204).await;

        let response = deliver(&harness, "msg-3", song_request("red-3", &direct_link("EXP"))).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(queue.hits_async().await, 0);
        assert!(harness.message_rows().await.is_empty());
    }

    #[tokio::test]
    async fn overlong_track_is_rejected() {
        let harness = Harness::new().await;
        harness.seed_user().await;
        harness
            .seed_preference(Preference {
                twitch_id: BROADCASTER_ID.to_string(),
                explicit_songs_allowed: true,
                custom_reward_id: String::new(),
                max_song_length_millis: 60_000,
            })
            .await;
        harness.mock_spotify_refresh().await;
        harness.mock_track("LONG", false, 600_000).await;
        let queue = harness.mock_queue(204).await;

        let response = deliver(&harness, "msg-4", song_request("red-4", &direct_link("LONG"))).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(queue.hits_async().await, 0);
        assert!(harness.message_rows().await.is_empty());
    }

    #[tokio::test]
    async fn custom_reward_id_overrides_title() {
        let harness = Harness::new().await;
        harness.seed_user().await;
        harness
            .seed_preference(Preference {
                twitch_id: BROADCASTER_ID.to_string(),
                explicit_songs_allowed: true,
                custom_reward_id: "reward-custom".to_string(),
                max_song_length_millis: 0,
            })
            .await;
        let refresh = harness.mock_spotify_refresh().await;
        harness.mock_track("EXP", true, 180_000).await;
        let queue = harness.mock_queue(204).await;

        // marker in the title but the wrong reward
        let ignored = redemption(
            "red-5",
            "reward-other",
            SONG_REQUEST_MARKER,
            json!(direct_link("EXP")),
        );
        let response = deliver(&harness, "msg-5", ignored).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(refresh.hits_async().await, 0);

        let accepted = redemption(
            "red-6",
            "reward-custom",
            "Pick a tune",
            json!(direct_link("EXP")),
        );
        let response = deliver(&harness, "msg-6", accepted).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(queue.hits_async().await, 1);
        assert_eq!(harness.message_rows().await.len(), 1);
    }

    #[tokio::test]
    async fn failed_queue_call_is_recorded_as_failure() {
        let harness = Harness::new().await;
        harness.seed_user().await;
        harness.mock_spotify_refresh().await;
        harness.mock_track("XYZ", false, 180_000).await;
        let queue = harness.mock_queue(404).await;

        let response = deliver(&harness, "msg-7", song_request("red-7", &direct_link("XYZ"))).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(queue.hits_async().await, 1);
        assert_eq!(
            harness.message_rows().await,
            vec![(false, BROADCASTER_ID.to_string(), "XYZ".to_string())]
        );
    }

    #[tokio::test]
    async fn missing_spotify_link_skips_queue() {
        let harness = Harness::new().await;
        let refresh = harness.mock_spotify_refresh().await;
        let queue = harness.mock_queue(204).await;

        // no user row at all
        let response = deliver(&harness, "msg-8", song_request("red-8", &direct_link("XYZ"))).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(refresh.hits_async().await, 0);
        assert_eq!(queue.hits_async().await, 0);
        assert!(harness.message_rows().await.is_empty());
    }

    #[tokio::test]
    async fn revoked_spotify_grant_skips_queue() {
        let harness = Harness::new().await;
        harness.seed_user().await;
        let refresh = harness
            .server
            .mock_async(|when, then| {
                when.method(POST).path("/accounts/api/token");
                then.status(400).json_body(json!({ "error": "invalid_grant" }));
            })
            .await;
        let track = harness.mock_track("XYZ", false, 180_000).await;
        let queue = harness.mock_queue(204).await;

        let response = deliver(&harness, "msg-11", song_request("red-11", &direct_link("XYZ"))).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(refresh.hits_async().await, 1);
        assert_eq!(track.hits_async().await, 0);
        assert_eq!(queue.hits_async().await, 0);
        assert!(harness.message_rows().await.is_empty());

        let user = harness.database.users().fetch(BROADCASTER_ID).await.expect("user");
        assert_eq!(user.spotify_access_token, "spotify-access");
    }

    #[tokio::test]
    async fn out_of_range_token_lifetime_skips_queue() {
        let harness = Harness::new().await;
        harness.seed_user().await;
        harness
            .server
            .mock_async(|when, then| {
                when.method(POST).path("/accounts/api/token");
                then.status(200).json_body(json!({
                    "access_token": "fresh-access",
                    "token_type": "Bearer",
                    "expires_in": u64::MAX
                }));
            })
            .await;
        let queue = harness.mock_queue(204).await;

        let response = deliver(&harness, "msg-12", song_request("red-12", &direct_link("XYZ"))).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(queue.hits_async().await, 0);
        assert!(harness.message_rows().await.is_empty());
    }

    #[tokio::test]
    async fn token_persist_failure_still_queues() {
        let harness = Harness::new().await;
        harness.seed_user().await;
        sqlx::query(
            "CREATE TRIGGER users_read_only BEFORE UPDATE ON users \
             BEGIN SELECT RAISE(ABORT, 'users are read only'); END",
        )
        .execute(harness.database.pool())
        .await
        .expect("trigger");
        harness.mock_spotify_refresh().await;
        harness.mock_track("XYZ", false, 180_000).await;
        let queue = harness.mock_queue(204).await;

        let response = deliver(&harness, "msg-13", song_request("red-13", &direct_link("XYZ"))).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(queue.hits_async().await, 1);
        assert_eq!(
            harness.message_rows().await,
            vec![(true, BROADCASTER_ID.to_string(), "XYZ".to_string())]
        );

        let user = harness.database.users().fetch(BROADCASTER_ID).await.expect("user");
        assert_eq!(user.spotify_access_token, "spotify-access");
    }

    #[tokio::test]
    async fn preference_lookup_failure_uses_defaults() {
        let harness = Harness::new().await;
        harness.seed_user().await;
        sqlx::query("DROP TABLE preferences")
            .execute(harness.database.pool())
            .await
            .expect("drop preferences");
        harness.mock_spotify_refresh().await;
        harness.mock_track("XYZ", false, 180_000).await;
        harness.mock_track("EXP", true, 180_000).await;
        let queue = harness.mock_queue(204).await;

        // title marker still gates, explicit tracks are refused
        let clean = deliver(&harness, "msg-14", song_request("red-14", &direct_link("XYZ"))).await;
        let explicit = deliver(&harness, "msg-15", song_request("red-15", &direct_link("EXP"))).await;

        assert_eq!(clean.status(), StatusCode::OK);
        assert_eq!(explicit.status(), StatusCode::OK);
        assert_eq!(queue.hits_async().await, 1);
        assert_eq!(
            harness.message_rows().await,
            vec![(true, BROADCASTER_ID.to_string(), "XYZ".to_string())]
        );
    }

    #[tokio::test]
    async fn metadata_failure_skips_queue() {
        let harness = Harness::new().await;
        harness.seed_user().await;
        harness.mock_spotify_refresh().await;
        let track = harness
            .server
            .mock_async(|when, then| {
                when.method(GET).path("/v1/tracks/XYZ");
                then.status(500).body("upstream unavailable");
            })
            .await;
        let queue = harness.mock_queue(204).await;

        let response = deliver(&harness, "msg-16", song_request("red-16", &direct_link("XYZ"))).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(track.hits_async().await, 1);
        assert_eq!(queue.hits_async().await, 0);
        assert!(harness.message_rows().await.is_empty());
    }

    #[tokio::test]
    async fn failed_queue_call_cancels_redemption() {
        let harness = Harness::new().await;
        harness.seed_user().await;
        harness.mock_spotify_refresh().await;
        harness.mock_track("XYZ", false, 180_000).await;
        harness.mock_queue(404).await;
        let twitch_refresh = harness
            .server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/oauth2/token")
                    .x_www_form_urlencoded_tuple("refresh_token", "twitch-refresh");
                then.status(200).json_body(json!({
                    "access_token": "twitch-fresh",
                    "refresh_token": "twitch-refresh-2",
                    "expires_in": 14_000,
                    "scope": ["channel:manage:redemptions"],
                    "token_type": "bearer"
                }));
            })
            .await;
        let cancel = harness
            .server
            .mock_async(|when, then| {
                when.method(httpmock::Method::PATCH)
                    .path("/helix/channel_points/custom_rewards/redemptions")
                    .query_param("broadcaster_id", BROADCASTER_ID)
                    .query_param("reward_id", "reward-1")
                    .query_param("id", "red-17")
                    .header("authorization", "Bearer twitch-fresh")
                    .json_body(json!({ "status": "CANCELED" }));
                then.status(200).json_body(json!({ "data": [] }));
            })
            .await;

        let response = deliver(&harness, "msg-17", song_request("red-17", &direct_link("XYZ"))).await;
        assert_eq!(response.status(), StatusCode::OK);

        let update = &cancel;
        assert!(eventually(move || async move { update.hits_async().await == 1 }).await);
        assert_eq!(twitch_refresh.hits_async().await, 1);
        assert_eq!(
            harness.message_rows().await,
            vec![(false, BROADCASTER_ID.to_string(), "XYZ".to_string())]
        );
    }

    #[tokio::test]
    async fn undecodable_event_is_acknowledged() {
        let harness = Harness::new().await;
        let refresh = harness.mock_spotify_refresh().await;

        let body = redemption("red-9", "reward-1", SONG_REQUEST_MARKER, json!(42));
        let response = deliver(&harness, "msg-9", body).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(refresh.hits_async().await, 0);
    }

    #[tokio::test]
    async fn missing_type_header_is_treated_as_notification() {
        let harness = Harness::new().await;
        harness.seed_user().await;
        harness.mock_spotify_refresh().await;
        harness.mock_track("XYZ", false, 180_000).await;
        let queue = harness.mock_queue(204).await;

        let body = song_request("red-10", &direct_link("XYZ"));
        let headers = signed_headers(None, "msg-10", &body);
        let response = call_webhook(harness.state.clone(), headers, body).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(queue.hits_async().await, 1);
    }

    #[tokio::test]
    async fn revocation_is_acknowledged() {
        let harness = Harness::new().await;
        let body = json!({
            "subscription": {
                "id": "sub-1",
                "status": "authorization_revoked",
                "type": "channel.channel_points_custom_reward_redemption.add"
            }
        })
        .to_string();

        let headers = signed_headers(Some("revocation"), "msg-revoke", &body);
        let response = call_webhook(harness.state.clone(), headers, body).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "ok");
    }

    #[tokio::test]
    async fn tampered_body_is_unauthorized() {
        let harness = Harness::new().await;
        let queue = harness.mock_queue(204).await;
        let body = song_request("red-11", &direct_link("XYZ"));
        let headers = signed_headers(Some("notification"), "msg-11", &body);

        let mut tampered = body.into_bytes();
        tampered[10] ^= 0x01;
        let tampered = String::from_utf8_lossy(&tampered).into_owned();

        let response = call_webhook(harness.state.clone(), headers, tampered).await;

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/problem+json"
        );
        assert_eq!(queue.hits_async().await, 0);
    }

    #[tokio::test]
    async fn missing_signature_is_unauthorized() {
        let harness = Harness::new().await;
        let body = song_request("red-12", &direct_link("XYZ"));
        let mut headers = signed_headers(Some("notification"), "msg-12", &body);
        headers.remove(HEADER_SIGNATURE);

        let response = call_webhook(harness.state.clone(), headers, body).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn stale_timestamp_is_unauthorized() {
        let harness = Harness::new().await;
        let body = song_request("red-13", &direct_link("XYZ"));
        let stale = "2023-12-31T23:45:00Z";
        let mut headers = signed_headers(Some("notification"), "msg-13", &body);
        headers.insert(HEADER_TIMESTAMP, HeaderValue::from_static(stale));
        headers.insert(
            HEADER_SIGNATURE,
            HeaderValue::from_str(&sign("msg-13", stale, &body)).expect("signature"),
        );

        let response = call_webhook(harness.state.clone(), headers, body).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn malformed_envelope_is_bad_request() {
        let harness = Harness::new().await;
        let body = "{not json".to_string();
        let headers = signed_headers(Some("notification"), "msg-14", &body);

        let response = call_webhook(harness.state.clone(), headers, body).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn signature_round_trip_and_mutation() {
        let body = br#"{"event":{}}"#;
        let signature = sign("id", FIXED_NOW, std::str::from_utf8(body).unwrap());
        assert!(verify_signature(SECRET.as_bytes(), "id", FIXED_NOW, body, &signature).is_ok());

        for index in 0..body.len() {
            let mut mutated = body.to_vec();
            mutated[index] ^= 0x20;
            assert!(
                verify_signature(SECRET.as_bytes(), "id", FIXED_NOW, &mutated, &signature).is_err(),
                "mutation at byte {index} must fail"
            );
        }
        assert!(verify_signature(SECRET.as_bytes(), "id", FIXED_NOW, body, "deadbeef").is_err());
    }
}
