// Terrain selection sync (message kind 1).
//
// The host owns the active dataset URL. Changing it is an explicit call
// (`set_active_dataset`) that broadcasts the new URL; the caller then clears
// pins, since they belong to the old terrain. Each newly connected peer is
// sent the current URL so late joiners catch up.
//
// On a client, receiving a URL records it and then either:
// - emits `LoadSample` if the URL is one of the pre-packaged fast-path
//   datasets, or
// - enters `Streaming` and emits `BeginDownload`; it returns to `Idle` when
//   the scene downloader reports `Done`.
// Either way it emits `EnteredSharedView`.
//
// Payload: one length-prefixed UTF-8 string.

use std::collections::BTreeSet;

use tracing::{debug, info};

use terrainview_protocol::types::{MessageKind, PeerId};
use terrainview_protocol::unnamed::UnnamedMessage;

use crate::context::SessionContext;
use crate::error::SyncError;
use crate::events::SyncEvent;
use crate::services::DownloadState;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerrainState {
    Idle,
    Streaming,
}

#[derive(Debug)]
pub struct TerrainSync {
    active_dataset: Option<String>,
    state: TerrainState,
    fast_path: BTreeSet<String>,
}

impl TerrainSync {
    pub const KIND: MessageKind = MessageKind::TERRAIN;

    pub fn new(fast_path: impl IntoIterator<Item = String>) -> Self {
        Self {
            active_dataset: None,
            state: TerrainState::Idle,
            fast_path: fast_path.into_iter().collect(),
        }
    }

    pub fn active_dataset(&self) -> Option<&str> {
        self.active_dataset.as_deref()
    }

    pub fn state(&self) -> TerrainState {
        self.state
    }

    pub fn is_fast_path(&self, url: &str) -> bool {
        self.fast_path.contains(url)
    }

    /// Seed the active dataset without announcing it (host start-up, where
    /// no client is connected yet).
    pub fn init_active(&mut self, url: Option<String>) {
        self.active_dataset = url;
    }

    /// Host or solo: switch datasets. Returns true if it actually changed.
    pub fn set_active_dataset(
        &mut self,
        ctx: &mut SessionContext,
        url: &str,
    ) -> Result<bool, SyncError> {
        if ctx.is_client() {
            return Err(SyncError::NotHost);
        }
        if self.active_dataset.as_deref() == Some(url) {
            return Ok(false);
        }
        self.active_dataset = Some(url.to_string());
        info!(url, "active dataset changed");
        ctx.send(UnnamedMessage::from_string(Self::KIND, url));
        Ok(true)
    }

    /// Host: bring a newly connected peer up to date.
    pub fn on_peer_connected(
        &self,
        ctx: &mut SessionContext,
        peer: PeerId,
    ) -> Result<(), SyncError> {
        match &self.active_dataset {
            Some(url) => ctx.send_to(peer, UnnamedMessage::from_string(Self::KIND, url)),
            None => Ok(()),
        }
    }

    pub fn on_receive(
        &mut self,
        ctx: &mut SessionContext,
        from: PeerId,
        msg: &UnnamedMessage,
    ) -> Result<(), SyncError> {
        let url = msg.read_string()?;
        if ctx.is_host() {
            debug!(%from, url, "terrain message from a client ignored");
            return Ok(());
        }
        self.active_dataset = Some(url.clone());
        if self.is_fast_path(&url) {
            debug!(url, "fast-path dataset");
            ctx.emit(SyncEvent::LoadSample { url });
        } else {
            self.state = TerrainState::Streaming;
            ctx.emit(SyncEvent::BeginDownload { url });
        }
        ctx.emit(SyncEvent::EnteredSharedView);
        Ok(())
    }

    /// Feed the downloader's state; `Streaming` ends at `Done`.
    pub fn on_download_state(&mut self, state: DownloadState) {
        if self.state == TerrainState::Streaming && state == DownloadState::Done {
            self.state = TerrainState::Idle;
        }
    }

    /// Leaving a session keeps the dataset but stops any streaming.
    pub fn reset(&mut self) {
        self.state = TerrainState::Idle;
    }
}
