use reqwest::{Client, Method, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Client for the Helix endpoints the status reporter calls.
#[derive(Clone)]
pub struct HelixClient {
    http: Client,
    base_url: Url,
    client_id: String,
}

impl HelixClient {
    /// Creates a new Helix client with the provided configuration.
    pub fn new(client_id: impl Into<String>, base_url: Url, http: Client) -> Self {
        Self {
            http,
            base_url,
            client_id: client_id.into(),
        }
    }

    /// Issues a PATCH call to update the status of a redemption.
    pub async fn update_redemption(
        &self,
        access_token: &str,
        request: &UpdateRedemptionRequest<'_>,
    ) -> Result<(), HelixError> {
        let mut url = self
            .base_url
            .join("channel_points/custom_rewards/redemptions")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("broadcaster_id", request.broadcaster_id);
            query.append_pair("reward_id", request.reward_id);
            query.append_pair("id", request.redemption_id);
        }

        let body = serde_json::json!({ "status": request.status.as_str() });
        let response = self
            .authorized_request(Method::PATCH, url, access_token)
            .json(&body)
            .send()
            .await?;

        ensure_success(response).await
    }

    /// Sends a chat message into the broadcaster's channel.
    pub async fn send_chat_message(
        &self,
        access_token: &str,
        request: &ChatMessageRequest<'_>,
    ) -> Result<(), HelixError> {
        let url = self.base_url.join("chat/messages")?;
        let response = self
            .authorized_request(Method::POST, url, access_token)
            .json(request)
            .send()
            .await?;

        let sent = parse_json::<ChatMessageResponse>(response).await?;
        match sent.data.into_iter().next() {
            Some(result) if result.is_sent => Ok(()),
            Some(result) => Err(HelixError::Rejected(
                result
                    .drop_reason
                    .map(|reason| reason.message)
                    .unwrap_or_else(|| "message was not sent".to_string()),
            )),
            None => Err(HelixError::Rejected("empty response".to_string())),
        }
    }

    fn authorized_request(
        &self,
        method: Method,
        url: Url,
        access_token: &str,
    ) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .header("Client-Id", &self.client_id)
            .header("Authorization", format!("Bearer {access_token}"))
    }
}

/// Parameters for updating a redemption.
pub struct UpdateRedemptionRequest<'a> {
    pub broadcaster_id: &'a str,
    pub reward_id: &'a str,
    pub redemption_id: &'a str,
    pub status: HelixRedemptionStatus,
}

/// Body of a chat message sent on behalf of `sender_id`.
#[derive(Debug, Serialize)]
pub struct ChatMessageRequest<'a> {
    pub broadcaster_id: &'a str,
    pub sender_id: &'a str,
    pub message: &'a str,
}

/// Terminal statuses a redemption can be moved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelixRedemptionStatus {
    Fulfilled,
    Canceled,
}

impl HelixRedemptionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fulfilled => "FULFILLED",
            Self::Canceled => "CANCELED",
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatMessageResponse {
    data: Vec<ChatMessageResult>,
}

#[derive(Debug, Deserialize)]
struct ChatMessageResult {
    is_sent: bool,
    #[serde(default)]
    drop_reason: Option<DropReason>,
}

#[derive(Debug, Deserialize)]
struct DropReason {
    message: String,
}

/// Errors produced by the Helix client.
#[derive(Debug, Error)]
pub enum HelixError {
    #[error("failed to build url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("request rejected: {0}")]
    Rejected(String),
}

async fn ensure_success(response: Response) -> Result<(), HelixError> {
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        return Err(HelixError::Status { status, body });
    }
    Ok(())
}

async fn parse_json<T>(response: Response) -> Result<T, HelixError>
where
    T: DeserializeOwned,
{
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        return Err(HelixError::Status { status, body });
    }

    Ok(response.json().await?)
}
