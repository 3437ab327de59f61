// Connection lifecycle controller.
//
// `ConnectionController` is the single owner of a peer's session state: the
// relay service, the transport, the scene downloader, the synchronizers and
// the current `SessionContext`. Everything runs on the caller's thread.
// Network reads happen on the transport's background reader, and `tick()`
// drains them here.
//
// State machine: `Disconnected -> Connecting -> Connected -> Disconnected`.
//
// Create: disable pins, sign in, allocate, fetch join code, bind, start
// host, abort checkpoint, set flags, spawn synchronizers, enable pins (which
// gives existing solo pins network objects), emit `SessionStarted`.
//
// Join: validate the code (an empty code fails before any network call),
// sign in, resolve the code, bind, start client, abort checkpoint, set
// flags, spawn synchronizers. The host's terrain arrives later and is
// announced with `SyncEvent::EnteredSharedView`.
//
// Every failure takes the same path (`fail`): shut the transport down,
// despawn, reset flags, re-enable pins, emit `UiEvent::Error` with the
// categorized message, and land in `Disconnected`. An abort is a failure
// that shows no dialog.
//
// `leave_session` always succeeds and may be called at any time. A host
// announces the end to its clients before its transport goes away.
//
// `tick()`:
// 1. drain transport events and feed them to the synchronizers;
// 2. flush the context outbox to the transport;
// 3. forward queued `SyncEvent`s to the downloader and UI subscribers;
// 4. feed the downloader's state to terrain sync;
// 5. if the host ended the session or the transport closed, tear down.
//
// Operations that change shared state (pins, layers, dataset, identity) are
// passthroughs that run the synchronizer call and then steps 2 and 3.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use terrainview_protocol::types::{Guid, JoinCode, VrMode};

use crate::config::SessionConfig;
use crate::context::{Role, SessionContext};
use crate::error::{SessionError, SyncError, UiMessage};
use crate::events::{EventEmitter, SubscriptionId, SyncEvent, UiEvent};
use crate::pins::TerrainPoint;
use crate::services::{RelayService, SceneDownloader, Transport, TransportEvent};
use crate::synchronizers::Synchronizers;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Membership flags the UI reads. Both are false whenever the controller
/// is not `Connected`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionFlags {
    pub in_session: bool,
    pub in_shared_view: bool,
}

/// Cancels an in-flight create or join at its next checkpoint. Cloneable
/// and `Send`, so another thread can hold it.
#[derive(Clone, Debug, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Why a running session ended from the outside.
enum RemoteEnd {
    HostClosed,
    ConnectionLost,
}

pub struct ConnectionController<R, T, D> {
    config: SessionConfig,
    relay: R,
    transport: T,
    downloader: D,
    relay_initialized: bool,
    state: ConnectionState,
    flags: SessionFlags,
    ctx: SessionContext,
    syncs: Synchronizers,
    ui: EventEmitter<UiEvent>,
    abort: AbortHandle,
}

impl<R: RelayService, T: Transport, D: SceneDownloader> ConnectionController<R, T, D> {
    pub fn new(config: SessionConfig, relay: R, transport: T, downloader: D) -> Self {
        let guid = match &config.guid {
            Some(guid) => Guid::new(guid.clone()),
            None => Guid::new(Uuid::new_v4().to_string()),
        };
        let syncs = Synchronizers::new(&config);
        Self {
            config,
            relay,
            transport,
            downloader,
            relay_initialized: false,
            state: ConnectionState::Disconnected,
            flags: SessionFlags::default(),
            ctx: SessionContext::solo(guid),
            syncs,
            ui: EventEmitter::new(),
            abort: AbortHandle::default(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn flags(&self) -> SessionFlags {
        self.flags
    }

    pub fn role(&self) -> Role {
        self.ctx.role()
    }

    pub fn join_code(&self) -> Option<&JoinCode> {
        self.ctx.join_code()
    }

    pub fn local_guid(&self) -> &Guid {
        self.ctx.local_guid()
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    pub fn synchronizers(&self) -> &Synchronizers {
        &self.syncs
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn relay(&self) -> &R {
        &self.relay
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn downloader(&self) -> &D {
        &self.downloader
    }

    pub fn downloader_mut(&mut self) -> &mut D {
        &mut self.downloader
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn subscribe(&mut self, callback: impl FnMut(&UiEvent) + Send + 'static) -> SubscriptionId {
        self.ui.subscribe(callback)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.ui.unsubscribe(id)
    }

    // -- lifecycle ----------------------------------------------------------

    /// Host a new session sized by `SessionConfig::max_peers`.
    pub fn host_session(&mut self) -> Result<JoinCode, SessionError> {
        self.create_session(self.config.max_peers)
    }

    /// Host a new session that admits up to `max_peers` clients besides the
    /// host. Returns the join code to share.
    pub fn create_session(&mut self, max_peers: u32) -> Result<JoinCode, SessionError> {
        self.begin()?;
        self.syncs.disable_pins(&mut self.ctx);
        match self.try_create(max_peers) {
            Ok(code) => Ok(code),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn try_create(&mut self, max_peers: u32) -> Result<JoinCode, SessionError> {
        self.ensure_signed_in()?;
        let allocation = self.relay.allocate(max_peers)?;
        self.checkpoint()?;
        let code = self.relay.get_join_code(allocation.allocation_id)?;
        self.checkpoint()?;
        self.transport.bind(allocation.server);
        let peer = self
            .transport
            .start_host()
            .map_err(|e| SessionError::Connection(e.to_string()))?;
        self.checkpoint()?;

        let ctx = SessionContext::host(peer, code.clone(), self.ctx.local_guid().clone());
        self.enter(ctx)?;
        self.syncs
            .enable_pins(&mut self.ctx)
            .map_err(|e| SessionError::Connection(e.to_string()))?;
        info!(%code, max_peers = allocation.max_peers, "hosting session");
        self.started();
        Ok(code)
    }

    /// Join the session behind `raw_code`. Case and surrounding whitespace
    /// do not matter.
    pub fn join_session(&mut self, raw_code: &str) -> Result<(), SessionError> {
        self.begin()?;
        match self.try_join(raw_code) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn try_join(&mut self, raw_code: &str) -> Result<(), SessionError> {
        let code = JoinCode::parse(raw_code).map_err(|_| SessionError::InvalidArgument)?;
        self.ensure_signed_in()?;
        let server = self.relay.join_allocation(&code)?;
        self.checkpoint()?;
        self.transport.bind(server);
        let peer = self
            .transport
            .start_client()
            .map_err(|e| SessionError::Connection(e.to_string()))?;
        self.checkpoint()?;

        let ctx = SessionContext::client(peer, code.clone(), self.ctx.local_guid().clone());
        self.enter(ctx)?;
        info!(%code, %peer, "joined session");
        self.started();
        Ok(())
    }

    /// Leave the current session, if any. Never fails; safe to repeat.
    pub fn leave_session(&mut self) {
        let was_connected = self.state == ConnectionState::Connected;
        if was_connected {
            self.syncs.on_leave(&mut self.ctx);
            self.flush();
            self.forward_events();
            self.ctx = SessionContext::solo(self.ctx.local_guid().clone());
        }
        self.teardown();
        if was_connected {
            info!("left session");
            self.ui.emit(&UiEvent::SessionEnded);
        }
    }

    fn begin(&mut self) -> Result<(), SessionError> {
        if self.state != ConnectionState::Disconnected {
            return Err(SessionError::AlreadyConnected);
        }
        self.abort.reset();
        self.state = ConnectionState::Connecting;
        Ok(())
    }

    fn checkpoint(&self) -> Result<(), SessionError> {
        if self.abort.is_aborted() {
            return Err(SessionError::Aborted);
        }
        Ok(())
    }

    /// Switch to a fresh session context and bring the synchronizers up.
    fn enter(&mut self, ctx: SessionContext) -> Result<(), SessionError> {
        self.forward_events();
        self.ctx = ctx;
        self.flags = SessionFlags {
            in_session: true,
            in_shared_view: true,
        };
        self.state = ConnectionState::Connected;
        let current = self.downloader.current_dataset();
        self.syncs
            .spawn()
            .map_err(|e| SessionError::Connection(e.to_string()))?;
        self.syncs
            .on_join(&mut self.ctx, current)
            .map_err(|e| SessionError::Connection(e.to_string()))
    }

    fn started(&mut self) {
        self.flush();
        if let Some(code) = self.ctx.join_code().cloned() {
            let role = self.ctx.role();
            self.ui.emit(&UiEvent::SessionStarted {
                role,
                join_code: code,
            });
        }
        self.forward_events();
    }

    fn fail(&mut self, e: SessionError) -> SessionError {
        if e == SessionError::Aborted {
            info!("session operation aborted");
        } else {
            warn!(error = %e, "session operation failed");
        }
        self.teardown();
        if e != SessionError::Aborted {
            self.ui.emit(&UiEvent::Error(e.ui_message()));
        }
        e
    }

    /// Back to solo: transport down, components despawned, flags cleared,
    /// pins visible again.
    fn teardown(&mut self) {
        self.transport.shutdown();
        if self.ctx.in_session() {
            self.syncs.on_leave(&mut self.ctx);
            self.ctx.drain_outbox();
        }
        self.syncs.despawn();
        self.forward_events();
        self.ctx = SessionContext::solo(self.ctx.local_guid().clone());
        self.flags = SessionFlags::default();
        self.state = ConnectionState::Disconnected;
        if let Err(e) = self.syncs.enable_pins(&mut self.ctx) {
            error!(error = %e, "could not re-enable pins");
        }
        self.forward_events();
    }

    /// Sign in unless already signed in. Retries with a delay; gives up only
    /// when `max_sign_in_attempts` is set and reached, or on abort.
    fn ensure_signed_in(&mut self) -> Result<(), SessionError> {
        if !self.relay_initialized {
            self.relay.initialize()?;
            self.relay_initialized = true;
        }
        let mut attempt: u32 = 0;
        while !self.relay.is_signed_in() {
            self.checkpoint()?;
            attempt += 1;
            match self.relay.sign_in_anonymously() {
                Ok(()) => break,
                Err(e) => {
                    if self
                        .config
                        .max_sign_in_attempts
                        .is_some_and(|max| attempt >= max)
                    {
                        return Err(e);
                    }
                    warn!(attempt, error = %e, "sign-in failed; retrying");
                    thread::sleep(self.config.sign_in_retry_delay());
                }
            }
        }
        Ok(())
    }

    // -- per-frame ----------------------------------------------------------

    /// Process everything that arrived since the last tick.
    pub fn tick(&mut self) {
        if self.state != ConnectionState::Connected {
            return;
        }
        let mut lost = false;
        for event in self.transport.poll() {
            match event {
                TransportEvent::PeerConnected(peer) => {
                    debug!(%peer, "peer connected");
                    if let Err(e) = self.syncs.on_peer_connected(&mut self.ctx, peer) {
                        warn!(%peer, error = %e, "could not bring peer up to date");
                    }
                }
                TransportEvent::PeerDisconnected(peer) => {
                    debug!(%peer, "peer disconnected");
                    if let Err(e) = self.syncs.on_peer_disconnected(&mut self.ctx, peer) {
                        warn!(%peer, error = %e, "could not remove peer");
                    }
                }
                TransportEvent::Data { from, bytes } => {
                    self.syncs.dispatch(&mut self.ctx, from, &bytes);
                }
                TransportEvent::Closed => {
                    lost = true;
                    break;
                }
            }
        }
        if !lost {
            self.flush();
        }
        // A `BeginDownload` from this tick must reach the downloader before
        // its state is read.
        let host_closed = self.forward_events();
        self.syncs.on_download_state(self.downloader.state());
        if host_closed {
            self.end_remote(RemoteEnd::HostClosed);
        } else if lost {
            self.end_remote(RemoteEnd::ConnectionLost);
        }
    }

    fn end_remote(&mut self, why: RemoteEnd) {
        let message = match why {
            RemoteEnd::HostClosed => UiMessage::session_ended(),
            RemoteEnd::ConnectionLost => UiMessage::connection_lost(),
        };
        warn!(title = %message.title, "session ended remotely");
        self.teardown();
        self.ui.emit(&UiEvent::SessionEnded);
        self.ui.emit(&UiEvent::Error(message));
    }

    /// Send every queued message.
    fn flush(&mut self) {
        for out in self.ctx.drain_outbox() {
            let bytes = out.message.encode();
            for target in self.ctx.targets(out.destination) {
                if let Err(e) = self.transport.send(target, &bytes) {
                    warn!(?target, kind = %out.message.kind, error = %e, "send failed");
                }
            }
        }
    }

    /// Hand queued sync events to the downloader and UI. Returns true if the
    /// host announced the end of the session.
    fn forward_events(&mut self) -> bool {
        let mut host_closed = false;
        for event in self.ctx.drain_events() {
            match &event {
                SyncEvent::LoadSample { url } => self.downloader.load_sample(url),
                SyncEvent::BeginDownload { url } => self.downloader.begin_download(url),
                SyncEvent::SessionEnded { .. } => host_closed = true,
                _ => {}
            }
            self.ui.emit(&UiEvent::Sync(event));
        }
        host_closed
    }

    /// Flush and forward after a local operation.
    fn settle(&mut self) {
        self.flush();
        if self.forward_events() {
            self.end_remote(RemoteEnd::HostClosed);
        }
    }

    // -- shared-state operations -------------------------------------------

    /// Host or solo: switch the shared terrain. Clears pins.
    pub fn set_active_dataset(&mut self, url: &str) -> Result<bool, SyncError> {
        let result = self.syncs.set_active_dataset(&mut self.ctx, url);
        self.settle();
        result
    }

    pub fn set_layer_field(&mut self, field: &str, value: f32) -> Result<f32, SyncError> {
        let result = self.syncs.set_layer_field(&mut self.ctx, field, value);
        self.settle();
        result
    }

    /// Place a pin as the local user. `Some(sequence)` when created here,
    /// `None` when the request went to the host.
    pub fn request_place_pin(
        &mut self,
        position: TerrainPoint,
        data: &str,
    ) -> Result<Option<u32>, SyncError> {
        let result = self.syncs.request_place_pin(&mut self.ctx, position, data);
        self.settle();
        result
    }

    pub fn remove_all_pins(&mut self) -> Result<(), SyncError> {
        let result = self.syncs.remove_all_pins(&mut self.ctx);
        self.settle();
        result
    }

    pub fn remove_my_pins(&mut self) -> Result<(), SyncError> {
        let result = self.syncs.remove_my_pins(&mut self.ctx);
        self.settle();
        result
    }

    pub fn remove_pins_with_guid(&mut self, guid: &Guid) -> Result<Vec<u32>, SyncError> {
        let result = self.syncs.remove_pins_with_guid(&mut self.ctx, guid);
        self.settle();
        result
    }

    pub fn disable_pins(&mut self) {
        self.syncs.disable_pins(&mut self.ctx);
        self.settle();
    }

    pub fn enable_pins(&mut self) -> Result<(), SyncError> {
        let result = self.syncs.enable_pins(&mut self.ctx);
        self.settle();
        result
    }

    pub fn set_display_name(&mut self, name: &str) -> Result<(), SyncError> {
        let result = self.syncs.set_display_name(&mut self.ctx, name);
        self.settle();
        result
    }

    pub fn set_vr_mode(&mut self, mode: VrMode) -> Result<(), SyncError> {
        let result = self.syncs.set_vr_mode(&mut self.ctx, mode);
        self.settle();
        result
    }
}
