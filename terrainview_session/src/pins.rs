// Measurement pin sync (message kind 3).
//
// The host is the only authority over the pin list. Every creation and
// removal funnels through it, so no client's list can diverge:
//
// - `request_place_pin`: solo creates a local pin; the host creates, numbers
//   and spawns the pin, then broadcasts `Spawned`; a client sends `Place`
//   and waits for the host's `Spawned` like everyone else.
// - `remove_my_pins`: solo removes local pins; a client sends `RemoveMine`
//   with its guid; the host filters its own guid.
// - `remove_pins_with_guid`: host (or solo) removal of exactly the pins a
//   guid owns. Surviving pins keep their numbers.
// - `remove_all_pins`: host (or solo) only. Clears the list and restarts
//   numbering at 1.
//
// Sequence numbers start at 1 and only ever grow while the list lives; a
// deleted pin's number is never handed out again. The UI shows "Pin #N".
//
// In a session each pin is two network objects, a marker and an info panel.
// The panel carries two host-owned variables, `data` and `sequence`.
// `disable_pins` / `enable_pins` bracket risky scene transitions: disabling
// only hides pins; enabling shows them again and, on a host in session,
// spawns objects for any pin that lacks them.
//
// Request attribution: with `verify_request_guid` on, a `Place` or
// `RemoveMine` whose claimed guid differs from the guid the roster already
// holds for that peer is rejected and logged.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use terrainview_protocol::types::{Guid, MessageKind, NetworkObjectId, PeerId};
use terrainview_protocol::unnamed::UnnamedMessage;

use crate::context::SessionContext;
use crate::error::SyncError;
use crate::events::{SyncEvent, VariableChange};
use crate::roster::Roster;
use crate::variables::{Replicated, VariableStore};

/// Field numbers of the variables on a pin's panel object.
pub mod panel_fields {
    pub const DATA: u16 = 0;
    pub const SEQUENCE: u16 = 1;
}

/// Terrain-local normalized coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TerrainPoint {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl TerrainPoint {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Pin {
    pub sequence: u32,
    pub position: TerrainPoint,
    pub data: String,
    pub owner_guid: Guid,
    pub owner_peer: PeerId,
    pub marker: Option<NetworkObjectId>,
    pub panel: Option<NetworkObjectId>,
    pub visible: bool,
}

impl Pin {
    /// Panel heading.
    pub fn label(&self) -> String {
        format!("Pin #{}", self.sequence)
    }

    fn record(&self) -> PinRecord {
        PinRecord {
            sequence: self.sequence,
            position: self.position,
            data: self.data.clone(),
            owner_guid: self.owner_guid.clone(),
            owner_peer: self.owner_peer,
            marker: self.marker,
            panel: self.panel,
        }
    }
}

/// A pin as it travels in `Spawned` and `Snapshot`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PinRecord {
    pub sequence: u32,
    pub position: TerrainPoint,
    pub data: String,
    pub owner_guid: Guid,
    pub owner_peer: PeerId,
    pub marker: Option<NetworkObjectId>,
    pub panel: Option<NetworkObjectId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PinMessage {
    /// Client → host.
    Place {
        position: TerrainPoint,
        data: String,
        guid: Guid,
    },
    /// Client → host.
    RemoveMine { guid: Guid },
    /// Host → all.
    Spawned(PinRecord),
    /// Host → all.
    Despawned { sequences: Vec<u32> },
    /// Host → all.
    Cleared,
    /// Host → newcomer.
    Snapshot { pins: Vec<PinRecord> },
}

#[derive(Debug)]
pub struct PinSync {
    pins: BTreeMap<u32, Pin>,
    next_sequence: u32,
    enabled: bool,
    verify_request_guid: bool,
}

impl PinSync {
    pub const KIND: MessageKind = MessageKind::PIN;

    pub fn new(verify_request_guid: bool) -> Self {
        Self {
            pins: BTreeMap::new(),
            next_sequence: 1,
            enabled: true,
            verify_request_guid,
        }
    }

    pub fn get(&self, sequence: u32) -> Option<&Pin> {
        self.pins.get(&sequence)
    }

    /// Pins in sequence order.
    pub fn iter(&self) -> impl Iterator<Item = &Pin> {
        self.pins.values()
    }

    pub fn sequences(&self) -> Vec<u32> {
        self.pins.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.pins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Place a pin owned by `guid`. Returns the new sequence number when the
    /// pin was created here (solo or host); `None` when the request went to
    /// the host.
    pub fn request_place_pin(
        &mut self,
        ctx: &mut SessionContext,
        vars: &mut VariableStore,
        position: TerrainPoint,
        data: &str,
        guid: &Guid,
    ) -> Result<Option<u32>, SyncError> {
        if ctx.is_client() {
            ctx.send(encode(&PinMessage::Place {
                position,
                data: data.to_string(),
                guid: guid.clone(),
            })?);
            return Ok(None);
        }
        let owner = ctx.local_peer();
        self.create(ctx, vars, position, data, guid.clone(), owner)
            .map(Some)
    }

    /// Host or solo: remove every pin and restart numbering.
    pub fn remove_all_pins(
        &mut self,
        ctx: &mut SessionContext,
        vars: &mut VariableStore,
    ) -> Result<(), SyncError> {
        if ctx.is_client() {
            return Err(SyncError::NotHost);
        }
        for pin in std::mem::take(&mut self.pins).into_values() {
            despawn_objects(ctx, vars, &pin)?;
        }
        self.next_sequence = 1;
        if ctx.is_host() {
            ctx.send(encode(&PinMessage::Cleared)?);
        }
        ctx.emit(SyncEvent::PinsCleared);
        info!("all pins removed");
        Ok(())
    }

    /// Remove the local user's pins, through the host when in a session.
    pub fn remove_my_pins(
        &mut self,
        ctx: &mut SessionContext,
        vars: &mut VariableStore,
    ) -> Result<(), SyncError> {
        let guid = ctx.local_guid().clone();
        if ctx.is_client() {
            ctx.send(encode(&PinMessage::RemoveMine { guid })?);
            return Ok(());
        }
        self.remove_pins_with_guid(ctx, vars, &guid)?;
        Ok(())
    }

    /// Host or solo: remove exactly the pins owned by `guid`. Returns the
    /// removed sequence numbers.
    pub fn remove_pins_with_guid(
        &mut self,
        ctx: &mut SessionContext,
        vars: &mut VariableStore,
        guid: &Guid,
    ) -> Result<Vec<u32>, SyncError> {
        if ctx.is_client() {
            return Err(SyncError::NotHost);
        }
        let sequences: Vec<u32> = self
            .pins
            .values()
            .filter(|p| &p.owner_guid == guid)
            .map(|p| p.sequence)
            .collect();
        if sequences.is_empty() {
            return Ok(sequences);
        }
        for sequence in &sequences {
            if let Some(pin) = self.pins.remove(sequence) {
                despawn_objects(ctx, vars, &pin)?;
            }
        }
        if ctx.is_host() {
            ctx.send(encode(&PinMessage::Despawned {
                sequences: sequences.clone(),
            })?);
        }
        ctx.emit(SyncEvent::PinsRemoved {
            sequences: sequences.clone(),
        });
        debug!(%guid, removed = sequences.len(), "pins removed by owner");
        Ok(sequences)
    }

    /// Hide all pins ahead of a scene transition.
    pub fn disable_pins(&mut self, ctx: &mut SessionContext) {
        self.enabled = false;
        for pin in self.pins.values_mut() {
            pin.visible = false;
        }
        ctx.emit(SyncEvent::PinsVisible(false));
    }

    /// Show pins again. A host in session spawns objects for pins that have
    /// none and announces them.
    pub fn enable_pins(
        &mut self,
        ctx: &mut SessionContext,
        vars: &mut VariableStore,
    ) -> Result<(), SyncError> {
        self.enabled = true;
        let spawn = ctx.is_host();
        let mut respawned = Vec::new();
        for pin in self.pins.values_mut() {
            pin.visible = true;
            if spawn && pin.marker.is_none() {
                spawn_objects(ctx, vars, pin)?;
                respawned.push(pin.record());
            }
        }
        for record in respawned {
            ctx.send(encode(&PinMessage::Spawned(record))?);
        }
        ctx.emit(SyncEvent::PinsVisible(true));
        Ok(())
    }

    /// Host: send every live pin to a newly connected peer.
    pub fn snapshot_to(&self, ctx: &mut SessionContext, peer: PeerId) -> Result<(), SyncError> {
        let pins = self.pins.values().map(Pin::record).collect();
        ctx.send_to(peer, encode(&PinMessage::Snapshot { pins })?)
    }

    /// Joining someone else's session: solo pins do not carry over.
    pub fn on_join_as_client(&mut self) {
        self.pins.clear();
        self.next_sequence = 1;
    }

    /// Leaving a session. A client's mirror is discarded; a host keeps its
    /// pins as local ones, without network objects.
    pub fn on_leave(&mut self, ctx: &SessionContext) {
        if ctx.is_client() {
            self.pins.clear();
            self.next_sequence = 1;
        } else {
            for pin in self.pins.values_mut() {
                pin.marker = None;
                pin.panel = None;
            }
        }
    }

    /// Keep a pin's text in step with its panel's `data` variable.
    pub fn apply_variable(&mut self, change: &VariableChange) {
        if change.id.field != panel_fields::DATA {
            return;
        }
        let Some(data) = change.current.as_str() else {
            return;
        };
        if let Some(pin) = self
            .pins
            .values_mut()
            .find(|p| p.panel == Some(change.id.object))
        {
            pin.data = data.to_string();
        }
    }

    pub fn on_receive(
        &mut self,
        ctx: &mut SessionContext,
        vars: &mut VariableStore,
        roster: &Roster,
        from: PeerId,
        msg: &UnnamedMessage,
    ) -> Result<(), SyncError> {
        let message: PinMessage = msg.read_json()?;
        if ctx.is_host() {
            return self.on_host_receive(ctx, vars, roster, from, message);
        }
        match message {
            PinMessage::Spawned(record) => {
                let sequence = record.sequence;
                self.upsert(record);
                ctx.emit(SyncEvent::PinPlaced { sequence });
            }
            PinMessage::Despawned { sequences } => {
                for sequence in &sequences {
                    self.pins.remove(sequence);
                }
                ctx.emit(SyncEvent::PinsRemoved { sequences });
            }
            PinMessage::Cleared => {
                self.pins.clear();
                ctx.emit(SyncEvent::PinsCleared);
            }
            PinMessage::Snapshot { pins } => {
                self.pins.clear();
                for record in pins {
                    self.upsert(record);
                }
            }
            PinMessage::Place { .. } | PinMessage::RemoveMine { .. } => {
                debug!(%from, "pin request reached a client; ignored");
            }
        }
        Ok(())
    }

    fn on_host_receive(
        &mut self,
        ctx: &mut SessionContext,
        vars: &mut VariableStore,
        roster: &Roster,
        from: PeerId,
        message: PinMessage,
    ) -> Result<(), SyncError> {
        match message {
            PinMessage::Place {
                position,
                data,
                guid,
            } => {
                if !self.attribution_ok(roster, from, &guid) {
                    return Ok(());
                }
                self.create(ctx, vars, position, &data, guid, from)?;
            }
            PinMessage::RemoveMine { guid } => {
                if !self.attribution_ok(roster, from, &guid) {
                    return Ok(());
                }
                self.remove_pins_with_guid(ctx, vars, &guid)?;
            }
            other => {
                warn!(%from, ?other, "host-only pin message from a client ignored");
            }
        }
        Ok(())
    }

    fn attribution_ok(&self, roster: &Roster, from: PeerId, claimed: &Guid) -> bool {
        if !self.verify_request_guid {
            return true;
        }
        match roster.guid_of(from) {
            Some(known) if known != claimed => {
                warn!(%from, %known, %claimed, "pin request with mismatched guid rejected");
                false
            }
            _ => true,
        }
    }

    fn create(
        &mut self,
        ctx: &mut SessionContext,
        vars: &mut VariableStore,
        position: TerrainPoint,
        data: &str,
        owner_guid: Guid,
        owner_peer: PeerId,
    ) -> Result<u32, SyncError> {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let mut pin = Pin {
            sequence,
            position,
            data: data.to_string(),
            owner_guid,
            owner_peer,
            marker: None,
            panel: None,
            visible: self.enabled,
        };
        if ctx.is_host() && self.enabled {
            spawn_objects(ctx, vars, &mut pin)?;
        }
        if ctx.is_host() {
            ctx.send(encode(&PinMessage::Spawned(pin.record()))?);
        }
        info!(sequence, owner = %pin.owner_guid, "pin placed");
        self.pins.insert(sequence, pin);
        ctx.emit(SyncEvent::PinPlaced { sequence });
        Ok(sequence)
    }

    fn upsert(&mut self, record: PinRecord) {
        let visible = self.enabled;
        self.pins.insert(
            record.sequence,
            Pin {
                sequence: record.sequence,
                position: record.position,
                data: record.data,
                owner_guid: record.owner_guid,
                owner_peer: record.owner_peer,
                marker: record.marker,
                panel: record.panel,
                visible,
            },
        );
    }
}

fn spawn_objects(
    ctx: &mut SessionContext,
    vars: &mut VariableStore,
    pin: &mut Pin,
) -> Result<(), SyncError> {
    let marker = ctx.allocate_object()?;
    let panel = ctx.allocate_object()?;
    let data: Replicated<String> = Replicated::new(panel, panel_fields::DATA);
    let sequence: Replicated<u32> = Replicated::new(panel, panel_fields::SEQUENCE);
    data.declare(vars, ctx, PeerId::HOST, &pin.data)?;
    sequence.declare(vars, ctx, PeerId::HOST, &pin.sequence)?;
    pin.marker = Some(marker);
    pin.panel = Some(panel);
    Ok(())
}

fn despawn_objects(
    ctx: &mut SessionContext,
    vars: &mut VariableStore,
    pin: &Pin,
) -> Result<(), SyncError> {
    if let Some(panel) = pin.panel {
        vars.drop_object(ctx, panel)?;
    }
    Ok(())
}

fn encode(message: &PinMessage) -> Result<UnnamedMessage, SyncError> {
    Ok(UnnamedMessage::from_json(PinSync::KIND, message)?)
}
