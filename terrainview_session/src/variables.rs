// Replicated variables: single-owner values readable by every peer.
//
// A variable lives on a network object and is addressed by `VariableId {
// object, field }`. Each slot records its owner and a version. Rules:
//
// - Only the owner may `set`. Anyone else gets `SyncError::NotOwner` and
//   nothing changes (no value change, no version bump, no message).
// - Setting the current value again is a no-op.
// - Host owner: apply, notify, broadcast `Update`. Client owner: apply,
//   notify, send `Update` to the host, which applies, notifies and relays to
//   every client except the originator.
// - Receivers apply an update only if its version is newer than what they
//   hold, so duplicates and stale retransmissions are dropped and every peer
//   sees the owner's updates in send order.
// - The host declares variables when it spawns the object that carries
//   them, sends late joiners a `Snapshot`, and drops every variable of an
//   object when it despawns.
//
// Every applied change (local or remote) is pushed into the context's event
// queue as `SyncEvent::VariableChanged` with `(previous, current)` and also
// returned to the caller so other synchronizers (roster, pins) can react.
//
// Values travel as `serde_json::Value`; `Replicated<T>` is the typed handle
// components use on top of that.

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace, warn};

use terrainview_protocol::types::{MessageKind, NetworkObjectId, PeerId};
use terrainview_protocol::unnamed::UnnamedMessage;

use crate::context::SessionContext;
use crate::error::SyncError;
use crate::events::{SyncEvent, VariableChange};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VariableId {
    pub object: NetworkObjectId,
    pub field: u16,
}

impl VariableId {
    pub const fn new(object: NetworkObjectId, field: u16) -> Self {
        Self { object, field }
    }
}

impl fmt::Display for VariableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj-{}.{}", self.object.0, self.field)
    }
}

/// Full state of one variable, as declared or snapshotted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VariableRecord {
    pub id: VariableId,
    pub owner: PeerId,
    pub version: u64,
    pub value: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum VariableMessage {
    Declare(VariableRecord),
    Update {
        id: VariableId,
        version: u64,
        value: Value,
    },
    Snapshot { variables: Vec<VariableRecord> },
    DropObject { object: NetworkObjectId },
}

#[derive(Clone, Debug)]
struct Slot {
    owner: PeerId,
    version: u64,
    value: Value,
}

#[derive(Debug, Default)]
pub struct VariableStore {
    slots: BTreeMap<VariableId, Slot>,
}

impl VariableStore {
    pub const KIND: MessageKind = MessageKind::VARIABLE;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: VariableId) -> Option<&Value> {
        self.slots.get(&id).map(|s| &s.value)
    }

    pub fn owner(&self, id: VariableId) -> Option<PeerId> {
        self.slots.get(&id).map(|s| s.owner)
    }

    pub fn version(&self, id: VariableId) -> Option<u64> {
        self.slots.get(&id).map(|s| s.version)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }

    /// Host only: create a variable at version 0 and announce it.
    pub fn declare(
        &mut self,
        ctx: &mut SessionContext,
        id: VariableId,
        owner: PeerId,
        value: Value,
    ) -> Result<VariableChange, SyncError> {
        if !ctx.is_host() {
            return Err(SyncError::NotHost);
        }
        let record = VariableRecord {
            id,
            owner,
            version: 0,
            value,
        };
        let message = encode(&VariableMessage::Declare(record.clone()))?;
        let previous = self.slots.insert(
            id,
            Slot {
                owner,
                version: 0,
                value: record.value.clone(),
            },
        );
        let change = VariableChange {
            id,
            owner,
            previous: previous.map(|s| s.value),
            current: record.value,
        };
        ctx.emit(SyncEvent::VariableChanged(change.clone()));
        ctx.send(message);
        Ok(change)
    }

    /// Write a variable this peer owns. Returns `Ok(None)` if the value was
    /// already current.
    pub fn set(
        &mut self,
        ctx: &mut SessionContext,
        id: VariableId,
        value: Value,
    ) -> Result<Option<VariableChange>, SyncError> {
        let slot = self
            .slots
            .get_mut(&id)
            .ok_or(SyncError::UnknownVariable(id))?;
        if slot.owner != ctx.local_peer() {
            return Err(SyncError::NotOwner(id));
        }
        if slot.value == value {
            return Ok(None);
        }
        let version = slot.version + 1;
        let message = encode(&VariableMessage::Update {
            id,
            version,
            value: value.clone(),
        })?;
        slot.version = version;
        let previous = std::mem::replace(&mut slot.value, value.clone());
        let change = VariableChange {
            id,
            owner: slot.owner,
            previous: Some(previous),
            current: value,
        };
        ctx.emit(SyncEvent::VariableChanged(change.clone()));
        ctx.send(message);
        Ok(Some(change))
    }

    /// Remove every variable on `object`. The host also tells the clients.
    pub fn drop_object(
        &mut self,
        ctx: &mut SessionContext,
        object: NetworkObjectId,
    ) -> Result<usize, SyncError> {
        let removed = self.remove_object(object);
        if ctx.is_host() {
            ctx.send(encode(&VariableMessage::DropObject { object })?);
        }
        Ok(removed)
    }

    /// Host only: send every live variable to a newly connected peer.
    pub fn snapshot_to(&self, ctx: &mut SessionContext, peer: PeerId) -> Result<(), SyncError> {
        let variables = self
            .slots
            .iter()
            .map(|(id, slot)| VariableRecord {
                id: *id,
                owner: slot.owner,
                version: slot.version,
                value: slot.value.clone(),
            })
            .collect();
        ctx.send_to(peer, encode(&VariableMessage::Snapshot { variables })?)
    }

    /// Apply a kind-5 message from `from`. Returns the changes applied.
    pub fn on_receive(
        &mut self,
        ctx: &mut SessionContext,
        from: PeerId,
        msg: &UnnamedMessage,
    ) -> Result<Vec<VariableChange>, SyncError> {
        let message: VariableMessage = msg.read_json()?;
        let mut changes = Vec::new();
        match message {
            VariableMessage::Update { id, version, value } => {
                let slot = self
                    .slots
                    .get_mut(&id)
                    .ok_or(SyncError::UnknownVariable(id))?;
                if ctx.is_host() && from != slot.owner {
                    warn!(%id, %from, owner = %slot.owner, "update from non-owner rejected");
                    return Err(SyncError::NotOwner(id));
                }
                if version <= slot.version {
                    trace!(%id, version, have = slot.version, "stale update ignored");
                    return Ok(changes);
                }
                slot.version = version;
                let previous = std::mem::replace(&mut slot.value, value.clone());
                let change = VariableChange {
                    id,
                    owner: slot.owner,
                    previous: Some(previous),
                    current: value.clone(),
                };
                ctx.emit(SyncEvent::VariableChanged(change.clone()));
                changes.push(change);
                if ctx.is_host() {
                    ctx.send_except(from, encode(&VariableMessage::Update { id, version, value })?)?;
                }
            }
            VariableMessage::Declare(record) => {
                changes.extend(self.install(ctx, record));
            }
            VariableMessage::Snapshot { variables } => {
                for record in variables {
                    changes.extend(self.install(ctx, record));
                }
            }
            VariableMessage::DropObject { object } => {
                let removed = self.remove_object(object);
                debug!(object = object.0, removed, "object variables dropped");
            }
        }
        Ok(changes)
    }

    /// Install a declared or snapshotted record unless we already hold the
    /// same or a newer version.
    fn install(&mut self, ctx: &mut SessionContext, record: VariableRecord) -> Option<VariableChange> {
        let previous = match self.slots.get(&record.id) {
            Some(slot) if slot.version >= record.version => return None,
            Some(slot) => Some(slot.value.clone()),
            None => None,
        };
        self.slots.insert(
            record.id,
            Slot {
                owner: record.owner,
                version: record.version,
                value: record.value.clone(),
            },
        );
        let change = VariableChange {
            id: record.id,
            owner: record.owner,
            previous,
            current: record.value,
        };
        ctx.emit(SyncEvent::VariableChanged(change.clone()));
        Some(change)
    }

    fn remove_object(&mut self, object: NetworkObjectId) -> usize {
        let before = self.slots.len();
        self.slots.retain(|id, _| id.object != object);
        before - self.slots.len()
    }
}

fn encode(message: &VariableMessage) -> Result<UnnamedMessage, SyncError> {
    Ok(UnnamedMessage::from_json(VariableStore::KIND, message)?)
}

/// Typed view of one variable.
pub struct Replicated<T> {
    id: VariableId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Replicated<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Replicated<T> {}

impl<T> fmt::Debug for Replicated<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Replicated").field(&self.id).finish()
    }
}

impl<T: Serialize + DeserializeOwned> Replicated<T> {
    pub const fn new(object: NetworkObjectId, field: u16) -> Self {
        Self {
            id: VariableId::new(object, field),
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> VariableId {
        self.id
    }

    /// Current value, or `None` if unknown here or of another type.
    pub fn get(&self, store: &VariableStore) -> Option<T> {
        store
            .get(self.id)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn declare(
        &self,
        store: &mut VariableStore,
        ctx: &mut SessionContext,
        owner: PeerId,
        value: &T,
    ) -> Result<(), SyncError> {
        store.declare(ctx, self.id, owner, serde_json::to_value(value)?)?;
        Ok(())
    }

    /// Returns true if the value changed.
    pub fn set(
        &self,
        store: &mut VariableStore,
        ctx: &mut SessionContext,
        value: &T,
    ) -> Result<bool, SyncError> {
        Ok(store.set(ctx, self.id, serde_json::to_value(value)?)?.is_some())
    }
}
