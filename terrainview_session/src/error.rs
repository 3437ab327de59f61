// Error types for the session layer and their user-facing mapping.
//
// Three families:
// - `SessionError`: relay/identity/transport failures while creating,
//   joining or running a session. Every variant maps to a `UiMessage`
//   (title + message) via `SessionError::ui_message`. Join failures are
//   split so the UI can tell "check your code" apart from "try later".
// - `SyncError`: programming or authority errors inside the synchronizers
//   (writing a variable you don't own, host-only actions on a client,
//   message-kind collisions, undecodable payloads).
// - `TransportError`: the bound relay connection could not be started or
//   written to.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use terrainview_protocol::types::MessageKind;
use terrainview_protocol::unnamed::DecodeError;
use terrainview_relay::client::RelayClientError;

use crate::variables::VariableId;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("anonymous sign-in failed: {0}")]
    Identity(String),
    #[error("relay allocation failed: {0}")]
    Allocation(String),
    #[error("relay allocation quota exceeded")]
    QuotaExceeded,
    #[error("join code not found")]
    CodeNotFound,
    #[error("invalid join request: {0}")]
    InvalidRequest(String),
    #[error("a join code is required")]
    InvalidArgument,
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("session operation aborted")]
    Aborted,
    #[error("already connected to a session")]
    AlreadyConnected,
}

impl SessionError {
    /// The dialog shown to the user for this failure.
    pub fn ui_message(&self) -> UiMessage {
        match self {
            SessionError::CodeNotFound | SessionError::InvalidRequest(_) => {
                UiMessage::room_code_error()
            }
            SessionError::InvalidArgument => UiMessage::relay_code_error(),
            _ => UiMessage::relay_error(),
        }
    }
}

/// A categorized message for the UI: dialog title and body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UiMessage {
    pub title: String,
    pub message: String,
}

impl UiMessage {
    fn new(title: &str, message: &str) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
        }
    }

    pub fn room_code_error() -> Self {
        Self::new("Room Code Error", "Incorrect room code. Please try again.")
    }

    pub fn relay_code_error() -> Self {
        Self::new("Relay Code Error", "Please enter a room code.")
    }

    pub fn relay_error() -> Self {
        Self::new(
            "Relay Error",
            "Unable to connect to Relay servers. Please try again.",
        )
    }

    pub fn session_ended() -> Self {
        Self::new("Session Ended", "The host has closed the room.")
    }

    pub fn connection_lost() -> Self {
        Self::new("Connection Lost", "Lost connection to the room.")
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("only the owner may write variable {0}")]
    NotOwner(VariableId),
    #[error("only the host may do this")]
    NotHost,
    #[error("not in a session")]
    NotInSession,
    #[error("message kind {0} is already registered")]
    KindCollision(MessageKind),
    #[error("unknown variable {0}")]
    UnknownVariable(VariableId),
    #[error("unknown layer field {0:?}")]
    UnknownField(String),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Decode(DecodeError::Json(e))
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not bound to a relay allocation")]
    NotBound,
    #[error("transport is not running")]
    NotRunning,
    #[error(transparent)]
    Relay(#[from] RelayClientError),
}
