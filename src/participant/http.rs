use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use crate::{
    error::TransportError,
    participant::Participant,
    protocol::{check_base_url, ParticipantAction, RemoteMessage, DEFAULT_TIMEOUT},
};

const MESSAGE_PATH: &str = "message";
const BODY_EXCERPT_LIMIT: usize = 512;

#[derive(Debug, Clone)]
pub struct HttpParticipant {
    client: Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpParticipant {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TransportError> {
        let url = check_base_url(base_url).map_err(|reason| TransportError::InvalidAddress {
            address: base_url.to_string(),
            reason,
        })?;

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| TransportError::Request {
                url: url.to_string(),
                source,
            })?;

        Ok(Self {
            client,
            endpoint: format!("{}/{}", url.as_str().trim_end_matches('/'), MESSAGE_PATH),
            timeout,
        })
    }

    pub fn with_default_timeout(base_url: &str) -> Result<Self, TransportError> {
        Self::new(base_url, DEFAULT_TIMEOUT)
    }

    fn classify(&self, error: reqwest::Error) -> TransportError {
        let url = self.endpoint.clone();
        if error.is_timeout() {
            TransportError::Timeout {
                url,
                after: self.timeout,
            }
        } else if error.is_connect() {
            TransportError::Unreachable { url, source: error }
        } else {
            TransportError::Request { url, source: error }
        }
    }
}

#[async_trait]
impl Participant for HttpParticipant {
    async fn exchange(&self, message: &RemoteMessage) -> Result<ParticipantAction, TransportError> {
        tracing::debug!(endpoint = %self.endpoint, "sending observation to participant");

        let response = self
            .client
            .post(&self.endpoint)
            .json(message)
            .send()
            .await
            .map_err(|error| self.classify(error))?;

        let status = response.status();
        let body = response.text().await.map_err(|error| self.classify(error))?;

        if !status.is_success() {
            return Err(TransportError::Status {
                url: self.endpoint.clone(),
                status: status.as_u16(),
                body: excerpt(&body),
            });
        }

        let json: Value = serde_json::from_str(&body).map_err(|error| {
            TransportError::malformed(&self.endpoint, format!("body is not JSON: {error}"))
        })?;

        ParticipantAction::from_response(json)
            .map_err(|reason| TransportError::malformed(&self.endpoint, reason))
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn excerpt(body: &str) -> String {
    if body.len() <= BODY_EXCERPT_LIMIT {
        return body.to_string();
    }
    let mut end = BODY_EXCERPT_LIMIT;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}
