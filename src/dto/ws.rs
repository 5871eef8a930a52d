use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Deserialize, Serialize, ToSchema)]
/// Messages accepted from participant WebSocket clients.
#[serde(tag = "type")]
pub enum ParticipantInboundMessage {
    /// First message on the socket; binds it to a participant.
    #[serde(rename = "identification")]
    Identification { token: String },
    /// Presence refresh over the socket instead of the HTTP route.
    #[serde(rename = "heartbeat")]
    Heartbeat,
    #[serde(other)]
    Unknown,
}

impl ParticipantInboundMessage {
    /// Token carried by an identification message.
    pub fn identification_token(&self) -> Option<&str> {
        match self {
            Self::Identification { token } => Some(token.as_str()),
            _ => None,
        }
    }
}
