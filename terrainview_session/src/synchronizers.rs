// The session's components, owned together and dispatched by kind.
//
// `Synchronizers` holds the message channel registry, the variable store,
// the roster and the terrain, layer and pin syncs. Components never hold
// references to each other; whenever one component's output matters to
// another (variable changes feeding the roster and pins, the roster's guid
// table feeding pin attribution) the hand-off happens here.
//
// Lifecycle hooks are plain methods called by the controller:
// - `spawn` / `despawn`: claim and release every message kind.
// - `on_join`: a session started. The host seeds the active dataset and
//   spawns its own player object; a client drops its solo state.
// - `on_peer_connected` (host): catch the newcomer up, in this order:
//   variables, roster, terrain, layers, pins, then spawn its player object.
// - `on_peer_disconnected` (host): drop its roster entry.
// - `on_leave`: the session ended. A leaving host announces the end first.
//
// Receive errors are logged and swallowed: one bad message from a peer must
// not take the session down.

use tracing::{debug, warn};

use terrainview_protocol::types::{Guid, MessageKind, PeerId, VrMode};
use terrainview_protocol::unnamed::UnnamedMessage;

use crate::channel::MessageChannel;
use crate::config::SessionConfig;
use crate::context::SessionContext;
use crate::control;
use crate::error::SyncError;
use crate::events::VariableChange;
use crate::layers::LayerSync;
use crate::pins::{PinSync, TerrainPoint};
use crate::roster::{LocalIdentity, Roster};
use crate::services::DownloadState;
use crate::terrain::TerrainSync;
use crate::variables::VariableStore;

pub struct Synchronizers {
    channel: MessageChannel,
    variables: VariableStore,
    roster: Roster,
    terrain: TerrainSync,
    layers: LayerSync,
    pins: PinSync,
    identity: LocalIdentity,
}

impl Synchronizers {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            channel: MessageChannel::new(),
            variables: VariableStore::new(),
            roster: Roster::new(),
            terrain: TerrainSync::new(config.fast_path_datasets.iter().cloned()),
            layers: LayerSync::new(config.layer_fields.iter().cloned()),
            pins: PinSync::new(config.verify_request_guid),
            identity: config.identity(),
        }
    }

    pub fn variables(&self) -> &VariableStore {
        &self.variables
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn terrain(&self) -> &TerrainSync {
        &self.terrain
    }

    pub fn layers(&self) -> &LayerSync {
        &self.layers
    }

    pub fn pins(&self) -> &PinSync {
        &self.pins
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    pub fn is_spawned(&self) -> bool {
        self.channel.is_registered(VariableStore::KIND)
    }

    /// Claim every message kind. Fails on the first collision.
    pub fn spawn(&mut self) -> Result<(), SyncError> {
        let kinds: [(MessageKind, &'static str); 6] = [
            (TerrainSync::KIND, "terrain"),
            (LayerSync::KIND, "layers"),
            (PinSync::KIND, "pins"),
            (Roster::KIND, "roster"),
            (VariableStore::KIND, "variables"),
            (control::KIND, "control"),
        ];
        for (kind, owner) in kinds {
            self.channel.register(kind, owner)?;
        }
        Ok(())
    }

    pub fn despawn(&mut self) {
        self.channel.clear();
    }

    /// Route one received buffer to the component that owns its kind.
    pub fn dispatch(&mut self, ctx: &mut SessionContext, from: PeerId, bytes: &[u8]) {
        let Some(msg) = self.channel.accept(bytes) else {
            return;
        };
        let result = match msg.kind {
            MessageKind::TERRAIN => self.terrain.on_receive(ctx, from, &msg),
            MessageKind::LAYER_FIELD => self.layers.on_receive(ctx, from, &msg),
            MessageKind::PIN => {
                self.pins
                    .on_receive(ctx, &mut self.variables, &self.roster, from, &msg)
            }
            MessageKind::ROSTER => self.on_roster(ctx, from, &msg),
            MessageKind::VARIABLE => match self.variables.on_receive(ctx, from, &msg) {
                Ok(changes) => {
                    self.apply_changes(&changes);
                    Ok(())
                }
                Err(e) => Err(e),
            },
            MessageKind::SESSION_CONTROL => control::on_receive(ctx, from, &msg),
            other => {
                debug!(kind = %other, "registered kind without a handler");
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!(%from, kind = %msg.kind, error = %e, "message rejected");
        }
    }

    fn on_roster(
        &mut self,
        ctx: &mut SessionContext,
        from: PeerId,
        msg: &UnnamedMessage,
    ) -> Result<(), SyncError> {
        if let Some(object) = self.roster.on_receive(ctx, &self.variables, from, msg)? {
            debug!(object = object.0, "own player object assigned");
            self.roster
                .write_identity(ctx, &mut self.variables, &self.identity)?;
        }
        Ok(())
    }

    fn apply_changes(&mut self, changes: &[VariableChange]) {
        for change in changes {
            self.roster.apply_variable(&self.variables, change);
            self.pins.apply_variable(change);
        }
    }

    /// A session started on `ctx`.
    pub fn on_join(
        &mut self,
        ctx: &mut SessionContext,
        current_dataset: Option<String>,
    ) -> Result<(), SyncError> {
        self.variables.clear();
        self.roster.clear();
        self.layers.reset();
        if ctx.is_host() {
            if current_dataset.is_some() {
                self.terrain.init_active(current_dataset);
            }
            let local = ctx.local_peer();
            self.roster.add_peer(ctx, &mut self.variables, local)?;
            self.roster
                .write_identity(ctx, &mut self.variables, &self.identity)?;
        } else {
            self.pins.on_join_as_client();
        }
        Ok(())
    }

    /// The session on `ctx` is ending. Call before the outbox is flushed for
    /// the last time.
    pub fn on_leave(&mut self, ctx: &mut SessionContext) {
        if ctx.is_host()
            && let Err(e) = control::announce_end(ctx, "host left")
        {
            warn!(error = %e, "could not announce session end");
        }
        self.pins.on_leave(ctx);
        self.roster.clear();
        self.variables.clear();
        self.layers.reset();
        self.terrain.reset();
    }

    /// Host: a client connected.
    pub fn on_peer_connected(
        &mut self,
        ctx: &mut SessionContext,
        peer: PeerId,
    ) -> Result<(), SyncError> {
        if !ctx.is_host() {
            return Ok(());
        }
        ctx.add_peer(peer);
        self.variables.snapshot_to(ctx, peer)?;
        self.roster.snapshot_to(ctx, peer)?;
        self.terrain.on_peer_connected(ctx, peer)?;
        self.layers.snapshot_to(ctx, peer)?;
        self.pins.snapshot_to(ctx, peer)?;
        self.roster.add_peer(ctx, &mut self.variables, peer)?;
        Ok(())
    }

    /// Host: a client went away. Its pins stay.
    pub fn on_peer_disconnected(
        &mut self,
        ctx: &mut SessionContext,
        peer: PeerId,
    ) -> Result<(), SyncError> {
        if !ctx.is_host() {
            return Ok(());
        }
        ctx.remove_peer(peer);
        self.layers.forget_peer(peer);
        self.roster.remove_peer(ctx, &mut self.variables, peer)?;
        Ok(())
    }

    /// Host or solo: switch datasets. Pins belong to the old terrain and
    /// are removed.
    pub fn set_active_dataset(
        &mut self,
        ctx: &mut SessionContext,
        url: &str,
    ) -> Result<bool, SyncError> {
        let changed = self.terrain.set_active_dataset(ctx, url)?;
        if changed && !self.pins.is_empty() {
            self.pins.remove_all_pins(ctx, &mut self.variables)?;
        }
        Ok(changed)
    }

    pub fn on_download_state(&mut self, state: DownloadState) {
        self.terrain.on_download_state(state);
    }

    pub fn set_layer_field(
        &mut self,
        ctx: &mut SessionContext,
        field: &str,
        value: f32,
    ) -> Result<f32, SyncError> {
        self.layers.set_field(ctx, field, value)
    }

    pub fn request_place_pin(
        &mut self,
        ctx: &mut SessionContext,
        position: TerrainPoint,
        data: &str,
    ) -> Result<Option<u32>, SyncError> {
        let guid = ctx.local_guid().clone();
        self.pins
            .request_place_pin(ctx, &mut self.variables, position, data, &guid)
    }

    pub fn remove_all_pins(&mut self, ctx: &mut SessionContext) -> Result<(), SyncError> {
        self.pins.remove_all_pins(ctx, &mut self.variables)
    }

    pub fn remove_my_pins(&mut self, ctx: &mut SessionContext) -> Result<(), SyncError> {
        self.pins.remove_my_pins(ctx, &mut self.variables)
    }

    pub fn remove_pins_with_guid(
        &mut self,
        ctx: &mut SessionContext,
        guid: &Guid,
    ) -> Result<Vec<u32>, SyncError> {
        self.pins
            .remove_pins_with_guid(ctx, &mut self.variables, guid)
    }

    pub fn disable_pins(&mut self, ctx: &mut SessionContext) {
        self.pins.disable_pins(ctx);
    }

    pub fn enable_pins(&mut self, ctx: &mut SessionContext) -> Result<(), SyncError> {
        self.pins.enable_pins(ctx, &mut self.variables)
    }

    /// Update the local display name, writing it through when in a session.
    pub fn set_display_name(
        &mut self,
        ctx: &mut SessionContext,
        name: &str,
    ) -> Result<(), SyncError> {
        self.identity.display_name = name.to_string();
        self.write_identity_if_placed(ctx)
    }

    pub fn set_vr_mode(&mut self, ctx: &mut SessionContext, mode: VrMode) -> Result<(), SyncError> {
        self.identity.vr_mode = mode;
        self.write_identity_if_placed(ctx)
    }

    fn write_identity_if_placed(&mut self, ctx: &mut SessionContext) -> Result<(), SyncError> {
        if self.roster.local_player_object().is_none() {
            return Ok(());
        }
        self.roster
            .write_identity(ctx, &mut self.variables, &self.identity)
    }
}
