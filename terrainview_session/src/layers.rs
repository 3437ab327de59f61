// Layer and exaggeration sync (message kind 2).
//
// One update is two consecutive kind-2 messages: the field name, then the
// value as a decimal string. The pair is not atomic on the wire, so the
// receiver keeps one pending name per sender and applies:
// - a numeric message with a pending name completes the pair;
// - a numeric message with no pending name is discarded;
// - a non-numeric message replaces any pending name (the earlier pair lost
//   its value);
// - completed pairs for unknown field names are dropped.
//
// `Exaggeration` is always known and clamped to 1..=5. Every other known
// field is a layer transparency clamped to 0..=1; zero means the layer's
// toggle is off.
//
// The host relays each completed client pair to every other client and
// sends newcomers the current value of every field.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use terrainview_protocol::types::{MessageKind, PeerId};
use terrainview_protocol::unnamed::UnnamedMessage;

use crate::context::SessionContext;
use crate::error::SyncError;
use crate::events::SyncEvent;

pub const EXAGGERATION: &str = "Exaggeration";

const EXAGGERATION_RANGE: (f32, f32) = (1.0, 5.0);
const TRANSPARENCY_RANGE: (f32, f32) = (0.0, 1.0);

#[derive(Debug)]
pub struct LayerSync {
    known: BTreeSet<String>,
    values: BTreeMap<String, f32>,
    pending: BTreeMap<PeerId, String>,
}

impl LayerSync {
    pub const KIND: MessageKind = MessageKind::LAYER_FIELD;

    pub fn new(layer_fields: impl IntoIterator<Item = String>) -> Self {
        let mut known: BTreeSet<String> = layer_fields.into_iter().collect();
        known.insert(EXAGGERATION.to_string());
        Self {
            known,
            values: BTreeMap::new(),
            pending: BTreeMap::new(),
        }
    }

    pub fn is_known(&self, field: &str) -> bool {
        self.known.contains(field)
    }

    pub fn value(&self, field: &str) -> Option<f32> {
        self.values.get(field).copied()
    }

    /// Whether a layer's toggle is on (non-zero transparency).
    pub fn enabled(&self, field: &str) -> Option<bool> {
        self.value(field).map(|v| v != 0.0)
    }

    /// Set a field locally and send the name/value pair. Returns the value
    /// actually stored after clamping.
    pub fn set_field(
        &mut self,
        ctx: &mut SessionContext,
        field: &str,
        value: f32,
    ) -> Result<f32, SyncError> {
        if !self.is_known(field) {
            return Err(SyncError::UnknownField(field.to_string()));
        }
        let value = clamp(field, value);
        self.values.insert(field.to_string(), value);
        let (name, val) = pair(field, value);
        ctx.send(name);
        ctx.send(val);
        Ok(value)
    }

    pub fn on_receive(
        &mut self,
        ctx: &mut SessionContext,
        from: PeerId,
        msg: &UnnamedMessage,
    ) -> Result<(), SyncError> {
        let text = msg.read_string()?;
        let number = text.trim().parse::<f32>().ok().filter(|v| v.is_finite());

        match (self.pending.remove(&from), number) {
            (Some(field), Some(value)) => self.apply(ctx, from, &field, value)?,
            (None, Some(_)) => {
                debug!(%from, text, "layer value without a field name; discarded");
            }
            (abandoned, None) => {
                if let Some(old) = abandoned {
                    debug!(%from, field = old, "layer field lost its value");
                }
                self.pending.insert(from, text);
            }
        }
        Ok(())
    }

    fn apply(
        &mut self,
        ctx: &mut SessionContext,
        from: PeerId,
        field: &str,
        value: f32,
    ) -> Result<(), SyncError> {
        if !self.is_known(field) {
            debug!(%from, field, "unknown layer field ignored");
            return Ok(());
        }
        let value = clamp(field, value);
        self.values.insert(field.to_string(), value);
        ctx.emit(SyncEvent::LayerChanged {
            field: field.to_string(),
            value,
            enabled: value != 0.0,
        });
        if ctx.is_host() {
            let (name, val) = pair(field, value);
            ctx.send_except(from, name)?;
            ctx.send_except(from, val)?;
        }
        Ok(())
    }

    /// Host: send every field value to a newly connected peer.
    pub fn snapshot_to(&self, ctx: &mut SessionContext, peer: PeerId) -> Result<(), SyncError> {
        for (field, value) in &self.values {
            let (name, val) = pair(field, *value);
            ctx.send_to(peer, name)?;
            ctx.send_to(peer, val)?;
        }
        Ok(())
    }

    /// Drop a departed peer's half-received pair.
    pub fn forget_peer(&mut self, peer: PeerId) {
        self.pending.remove(&peer);
    }

    /// Forget half-received pairs (session end).
    pub fn reset(&mut self) {
        self.pending.clear();
    }
}

fn clamp(field: &str, value: f32) -> f32 {
    let (lo, hi) = if field == EXAGGERATION {
        EXAGGERATION_RANGE
    } else {
        TRANSPARENCY_RANGE
    };
    value.clamp(lo, hi)
}

fn pair(field: &str, value: f32) -> (UnnamedMessage, UnnamedMessage) {
    (
        UnnamedMessage::from_string(LayerSync::KIND, field),
        UnnamedMessage::from_string(LayerSync::KIND, &value.to_string()),
    )
}

#[cfg(test)]
mod tests {
    use terrainview_protocol::types::{Guid, JoinCode};

    use super::*;
    use crate::context::Destination;

    fn code() -> JoinCode {
        JoinCode::parse("AB23CD").unwrap()
    }

    fn layers() -> LayerSync {
        LayerSync::new(["Elevation".to_string(), "Slope".to_string()])
    }

    fn text(s: &str) -> UnnamedMessage {
        UnnamedMessage::from_string(LayerSync::KIND, s)
    }

    fn client() -> SessionContext {
        SessionContext::client(PeerId(1), code(), Guid::new("c"))
    }

    #[test]
    fn set_field_sends_name_then_value() {
        let mut ctx = SessionContext::host(PeerId::HOST, code(), Guid::new("h"));
        let mut sync = layers();
        assert_eq!(sync.set_field(&mut ctx, EXAGGERATION, 9.0).unwrap(), 5.0);

        let out = ctx.drain_outbox();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].message.read_string().unwrap(), EXAGGERATION);
        assert_eq!(out[1].message.read_string().unwrap(), "5");
    }

    #[test]
    fn unknown_fields_cannot_be_set() {
        let mut ctx = client();
        let mut sync = layers();
        assert!(matches!(
            sync.set_field(&mut ctx, "Albedo", 0.5),
            Err(SyncError::UnknownField(_))
        ));
        assert!(ctx.outbox().is_empty());
    }

    #[test]
    fn pair_applies_with_clamping() {
        let mut ctx = client();
        let mut sync = layers();
        sync.on_receive(&mut ctx, PeerId::HOST, &text("Slope")).unwrap();
        sync.on_receive(&mut ctx, PeerId::HOST, &text("1.7")).unwrap();
        assert_eq!(sync.value("Slope"), Some(1.0));

        sync.on_receive(&mut ctx, PeerId::HOST, &text(EXAGGERATION)).unwrap();
        sync.on_receive(&mut ctx, PeerId::HOST, &text("0.2")).unwrap();
        assert_eq!(sync.value(EXAGGERATION), Some(1.0));
    }

    #[test]
    fn zero_reports_toggle_off() {
        let mut ctx = client();
        let mut sync = layers();
        sync.on_receive(&mut ctx, PeerId::HOST, &text("Elevation")).unwrap();
        sync.on_receive(&mut ctx, PeerId::HOST, &text("0")).unwrap();
        assert_eq!(sync.enabled("Elevation"), Some(false));
        assert_eq!(
            ctx.events(),
            &[SyncEvent::LayerChanged {
                field: "Elevation".into(),
                value: 0.0,
                enabled: false
            }]
        );
    }

    #[test]
    fn survives_a_dropped_value_message() {
        let mut ctx = client();
        let mut sync = layers();
        // "Slope" lost its value; the next name replaces it.
        sync.on_receive(&mut ctx, PeerId::HOST, &text("Slope")).unwrap();
        sync.on_receive(&mut ctx, PeerId::HOST, &text("Elevation")).unwrap();
        sync.on_receive(&mut ctx, PeerId::HOST, &text("0.4")).unwrap();
        assert_eq!(sync.value("Slope"), None);
        assert_eq!(sync.value("Elevation"), Some(0.4));
    }

    #[test]
    fn orphan_value_discarded() {
        let mut ctx = client();
        let mut sync = layers();
        sync.on_receive(&mut ctx, PeerId::HOST, &text("0.9")).unwrap();
        assert!(ctx.events().is_empty());
        // A later pair still works.
        sync.on_receive(&mut ctx, PeerId::HOST, &text("Slope")).unwrap();
        sync.on_receive(&mut ctx, PeerId::HOST, &text("0.9")).unwrap();
        assert_eq!(sync.value("Slope"), Some(0.9));
    }

    #[test]
    fn unknown_field_pair_ignored() {
        let mut ctx = client();
        let mut sync = layers();
        sync.on_receive(&mut ctx, PeerId::HOST, &text("Albedo")).unwrap();
        sync.on_receive(&mut ctx, PeerId::HOST, &text("0.5")).unwrap();
        assert_eq!(sync.value("Albedo"), None);
        assert!(ctx.events().is_empty());
    }

    #[test]
    fn pending_names_are_per_sender() {
        let mut ctx = SessionContext::host(PeerId::HOST, code(), Guid::new("h"));
        ctx.add_peer(PeerId(1));
        ctx.add_peer(PeerId(2));
        let mut sync = layers();
        // Interleaved pairs from two clients.
        sync.on_receive(&mut ctx, PeerId(1), &text("Slope")).unwrap();
        sync.on_receive(&mut ctx, PeerId(2), &text("Elevation")).unwrap();
        sync.on_receive(&mut ctx, PeerId(1), &text("0.3")).unwrap();
        sync.on_receive(&mut ctx, PeerId(2), &text("0.6")).unwrap();
        assert_eq!(sync.value("Slope"), Some(0.3));
        assert_eq!(sync.value("Elevation"), Some(0.6));

        // Each pair relayed to the other client only.
        let out = ctx.drain_outbox();
        assert_eq!(out.len(), 4);
        assert_eq!(out[0].destination, Destination::AllExcept(PeerId(1)));
        assert_eq!(out[2].destination, Destination::AllExcept(PeerId(2)));
    }

    #[test]
    fn newcomer_gets_current_values() {
        let mut ctx = SessionContext::host(PeerId::HOST, code(), Guid::new("h"));
        let mut sync = layers();
        sync.set_field(&mut ctx, "Slope", 0.25).unwrap();
        sync.set_field(&mut ctx, EXAGGERATION, 2.0).unwrap();
        ctx.drain_outbox();

        sync.snapshot_to(&mut ctx, PeerId(3)).unwrap();
        let out = ctx.drain_outbox();
        assert_eq!(out.len(), 4);
        assert!(out.iter().all(|o| o.destination == Destination::Peer(PeerId(3))));

        let mut late = layers();
        let mut lctx = SessionContext::client(PeerId(3), code(), Guid::new("l"));
        for o in &out {
            late.on_receive(&mut lctx, PeerId::HOST, &o.message).unwrap();
        }
        assert_eq!(late.value("Slope"), Some(0.25));
        assert_eq!(late.value(EXAGGERATION), Some(2.0));
    }
}
