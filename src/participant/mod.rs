use std::future::Future;

use async_trait::async_trait;

use crate::{
    error::TransportError,
    protocol::{ParticipantAction, RemoteMessage},
};

pub mod http;
pub mod scripted;

pub use http::HttpParticipant;
pub use scripted::ScriptedParticipant;

/// The remote party under evaluation.
///
/// An exchange is a stateless function of the observation: one message out,
/// one action back, no session carried between calls.
#[async_trait]
pub trait Participant: Send + Sync {
    async fn exchange(&self, message: &RemoteMessage) -> Result<ParticipantAction, TransportError>;

    /// Where the participant lives, for logs and error reports.
    fn endpoint(&self) -> &str;
}

/// Adapts an async closure into a [`Participant`].
pub fn from_fn<F, Fut>(endpoint: impl Into<String>, exchange: F) -> FnParticipant<F>
where
    F: Fn(RemoteMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ParticipantAction, TransportError>> + Send,
{
    FnParticipant {
        endpoint: endpoint.into(),
        exchange,
    }
}

pub struct FnParticipant<F> {
    endpoint: String,
    exchange: F,
}

#[async_trait]
impl<F, Fut> Participant for FnParticipant<F>
where
    F: Fn(RemoteMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ParticipantAction, TransportError>> + Send,
{
    async fn exchange(&self, message: &RemoteMessage) -> Result<ParticipantAction, TransportError> {
        (self.exchange)(message.clone()).await
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}
