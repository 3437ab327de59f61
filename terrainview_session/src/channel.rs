// Unnamed message channel: the kind registry in front of dispatch.
//
// All synchronizers share one raw transport channel. Each registers exactly
// one `MessageKind` when the session's components spawn and deregisters on
// despawn. Registering a kind twice is a programming error and fails with
// `SyncError::KindCollision`.
//
// `accept()` is the receive-side gate: it drops empty buffers, decodes the
// envelope, and only lets a message through if some component currently
// holds its kind. A message for an unregistered kind (another build's
// component, or anything arriving after despawn) is dropped silently.
//
// Sending lives on `SessionContext` (role-dependent routing); this module
// only decides what is delivered.

use std::collections::BTreeMap;

use tracing::{debug, trace};

use terrainview_protocol::types::MessageKind;
use terrainview_protocol::unnamed::UnnamedMessage;

use crate::error::SyncError;

#[derive(Debug, Default)]
pub struct MessageChannel {
    registered: BTreeMap<MessageKind, &'static str>,
}

impl MessageChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `kind` for the component named `owner`.
    pub fn register(&mut self, kind: MessageKind, owner: &'static str) -> Result<(), SyncError> {
        if let Some(existing) = self.registered.get(&kind) {
            debug!(%kind, existing, owner, "message kind collision");
            return Err(SyncError::KindCollision(kind));
        }
        self.registered.insert(kind, owner);
        Ok(())
    }

    pub fn deregister(&mut self, kind: MessageKind) -> bool {
        self.registered.remove(&kind).is_some()
    }

    pub fn is_registered(&self, kind: MessageKind) -> bool {
        self.registered.contains_key(&kind)
    }

    pub fn clear(&mut self) {
        self.registered.clear();
    }

    /// Decode `bytes` if a registered component should see them.
    pub fn accept(&self, bytes: &[u8]) -> Option<UnnamedMessage> {
        let message = match UnnamedMessage::decode(bytes) {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, "dropping undecodable buffer");
                return None;
            }
        };
        if !self.is_registered(message.kind) {
            trace!(kind = %message.kind, "no component for kind; ignored");
            return None;
        }
        Some(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_registration_fails() {
        let mut channel = MessageChannel::new();
        channel.register(MessageKind::PIN, "pins").unwrap();
        assert!(matches!(
            channel.register(MessageKind::PIN, "other"),
            Err(SyncError::KindCollision(MessageKind::PIN))
        ));
    }

    #[test]
    fn unregistered_kinds_are_ignored() {
        let mut channel = MessageChannel::new();
        channel.register(MessageKind::TERRAIN, "terrain").unwrap();

        let terrain = UnnamedMessage::from_string(MessageKind::TERRAIN, "u").encode();
        let layer = UnnamedMessage::from_string(MessageKind::LAYER_FIELD, "u").encode();
        assert!(channel.accept(&terrain).is_some());
        assert!(channel.accept(&layer).is_none());
        assert!(channel.accept(&[]).is_none());
    }

    #[test]
    fn nothing_delivered_after_deregistration() {
        let mut channel = MessageChannel::new();
        channel.register(MessageKind::ROSTER, "roster").unwrap();
        assert!(channel.deregister(MessageKind::ROSTER));
        assert!(!channel.deregister(MessageKind::ROSTER));

        let bytes = UnnamedMessage::new(MessageKind::ROSTER, b"{}".to_vec()).encode();
        assert!(channel.accept(&bytes).is_none());

        // The kind can be claimed again after release.
        channel.register(MessageKind::ROSTER, "roster").unwrap();
        channel.clear();
        assert!(!channel.is_registered(MessageKind::ROSTER));
    }
}
