//! HTTP client for the chat API.
//!
//! [`ChatClient::send_message`] backs off and retries when the server reports
//! that another client instance is still processing the same chat.

use chatgate_contracts::{
    ChatDetail, ChatListResponse, ChatRecord, ChatResponse, ErrorResponse, SendMessageResponse,
    CLIENT_INSTANCE_HEADER, REQUEST_ID_HEADER,
};
use chatgate_kernel::RetryPolicy;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::time::sleep;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Still busy after every retry. Carries the server's message.
    #[error("{0}")]
    Conflict(String),
    #[error("http {status}: {message}")]
    Http { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("decode error: {0}")]
    Decode(String),
}

pub struct ChatClient {
    base_url: String,
    token: String,
    client_instance: String,
    retry: RetryPolicy,
    http: Client,
}

impl ChatClient {
    /// `client_instance` identifies this tab or process to the admission gate.
    pub fn new(base_url: &str, token: &str, client_instance: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            client_instance: client_instance.to_string(),
            retry: RetryPolicy::default(),
            http: Client::new(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn client_instance(&self) -> &str {
        &self.client_instance
    }

    fn request(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .bearer_auth(&self.token)
            .header(CLIENT_INSTANCE_HEADER, &self.client_instance)
            .header(REQUEST_ID_HEADER, Uuid::new_v4().to_string())
    }

    pub async fn create_chat(&self, title: Option<&str>) -> Result<ChatRecord, ClientError> {
        let body = match title {
            Some(title) => json!({ "title": title }),
            None => json!({}),
        };
        let response = self
            .request(self.http.post(format!("{}/v1/chats", self.base_url)))
            .json(&body)
            .send()
            .await
            .map_err(transport)?;
        let created: ChatResponse = decode(response).await?;
        Ok(created.chat)
    }

    pub async fn list_chats(&self) -> Result<Vec<ChatRecord>, ClientError> {
        let response = self
            .request(self.http.get(format!("{}/v1/chats", self.base_url)))
            .send()
            .await
            .map_err(transport)?;
        let list: ChatListResponse = decode(response).await?;
        Ok(list.chats)
    }

    pub async fn get_chat(&self, chat_id: &str) -> Result<ChatDetail, ClientError> {
        let response = self
            .request(
                self.http
                    .get(format!("{}/v1/chats/{chat_id}", self.base_url)),
            )
            .send()
            .await
            .map_err(transport)?;
        decode(response).await
    }

    /// Sends one message, retrying on 409 per the retry policy.
    ///
    /// Each attempt carries a fresh request id.
    pub async fn send_message(
        &self,
        chat_id: &str,
        content: &str,
    ) -> Result<SendMessageResponse, ClientError> {
        let url = format!("{}/v1/chats/{chat_id}/messages", self.base_url);
        let body = json!({ "content": content });
        let mut retry = 0;
        loop {
            let response = self
                .request(self.http.post(&url))
                .json(&body)
                .send()
                .await
                .map_err(transport)?;
            if response.status() != StatusCode::CONFLICT {
                return decode(response).await;
            }

            let message = error_message(response).await;
            retry += 1;
            let Some(delay) = self.retry.delay_for(retry) else {
                warn!(chat_id, attempts = retry, "chat still busy; giving up");
                return Err(ClientError::Conflict(message));
            };
            debug!(
                chat_id,
                retry,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "chat busy; retrying"
            );
            sleep(delay).await;
        }
    }
}

fn transport(e: reqwest::Error) -> ClientError {
    ClientError::Transport(e.to_string())
}

async fn error_message(response: Response) -> String {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    serde_json::from_str::<ErrorResponse>(&text)
        .map(|e| e.error)
        .unwrap_or_else(|_| {
            if text.is_empty() {
                status.to_string()
            } else {
                text
            }
        })
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
    let status = response.status();
    if !status.is_success() {
        return Err(ClientError::Http {
            status: status.as_u16(),
            message: error_message(response).await,
        });
    }
    response
        .json()
        .await
        .map_err(|e| ClientError::Decode(e.to_string()))
}
