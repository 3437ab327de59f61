// Session control messages (message kind 6).
//
// Only one message today: the host announces `Ended` right before it tears
// down its transport, so clients can tell a deliberate close apart from a
// lost connection.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use terrainview_protocol::types::{MessageKind, PeerId};
use terrainview_protocol::unnamed::UnnamedMessage;

use crate::context::SessionContext;
use crate::error::SyncError;
use crate::events::SyncEvent;

pub const KIND: MessageKind = MessageKind::SESSION_CONTROL;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    Ended { reason: String },
}

/// Host: tell every client the session is over.
pub fn announce_end(ctx: &mut SessionContext, reason: &str) -> Result<(), SyncError> {
    if !ctx.is_host() {
        return Err(SyncError::NotHost);
    }
    let message = ControlMessage::Ended {
        reason: reason.to_string(),
    };
    ctx.send(UnnamedMessage::from_json(KIND, &message)?);
    Ok(())
}

pub fn on_receive(
    ctx: &mut SessionContext,
    from: PeerId,
    msg: &UnnamedMessage,
) -> Result<(), SyncError> {
    match msg.read_json::<ControlMessage>()? {
        ControlMessage::Ended { reason } if ctx.is_client() && from.is_host() => {
            info!(reason, "host ended the session");
            ctx.emit(SyncEvent::SessionEnded { reason });
        }
        ControlMessage::Ended { .. } => {
            debug!(%from, "session end from a non-host ignored");
        }
    }
    Ok(())
}
