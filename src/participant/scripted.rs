use std::{collections::VecDeque, sync::Mutex};

use async_trait::async_trait;

use crate::{
    error::TransportError,
    participant::Participant,
    protocol::{ParticipantAction, RemoteMessage},
};

/// Replays a fixed list of actions. Once the script runs dry every further
/// exchange fails as a malformed response.
pub struct ScriptedParticipant {
    actions: Mutex<VecDeque<ParticipantAction>>,
    received: Mutex<Vec<RemoteMessage>>,
}

impl ScriptedParticipant {
    pub fn new<I>(actions: I) -> Self
    where
        I: IntoIterator<Item = ParticipantAction>,
    {
        Self {
            actions: Mutex::new(actions.into_iter().collect()),
            received: Mutex::new(Vec::new()),
        }
    }

    /// Messages seen so far, oldest first.
    pub fn received(&self) -> Vec<RemoteMessage> {
        self.received
            .lock()
            .map(|received| received.clone())
            .unwrap_or_default()
    }

    pub fn exchanges(&self) -> usize {
        self.received.lock().map(|received| received.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Participant for ScriptedParticipant {
    async fn exchange(&self, message: &RemoteMessage) -> Result<ParticipantAction, TransportError> {
        if let Ok(mut received) = self.received.lock() {
            received.push(message.clone());
        }

        self.actions
            .lock()
            .ok()
            .and_then(|mut actions| actions.pop_front())
            .ok_or_else(|| TransportError::malformed(self.endpoint(), "no more scripted actions"))
    }

    fn endpoint(&self) -> &str {
        "scripted"
    }
}
