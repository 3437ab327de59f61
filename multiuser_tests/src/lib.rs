// Test-only peer for multiuser integration tests.
//
// Wraps a real `ConnectionController` wired to the TCP relay (from
// `terrainview_session::relay_controller`) together with a recording scene
// downloader, and exposes a synchronous, test-friendly API for exercising
// the whole pipeline: host -> relay -> join -> request -> host broadcast ->
// every peer's synchronizers.
//
// The only test-specific code here is the polling wrappers (blocking loops
// around `ConnectionController::tick()`) and the downloader stand-in. All
// networking and sync logic uses the same code paths as the real viewer.
//
// See also: `tests/full_pipeline.rs` for the integration test scenarios.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use terrainview_session::synchronizers::Synchronizers;
use terrainview_session::{
    ConnectionState, DownloadState, RelaySessionController, SceneDownloader, SessionConfig,
    SessionError, UiEvent, UiMessage, relay_controller,
};

/// Default timeout for blocking poll operations.
const POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Sleep duration between poll attempts.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A dataset shipped with the viewer; loads without downloading.
pub const SAMPLE_DATASET: &str = "https://terrain.example/ceres.tiles";

/// Scene downloader stand-in. Remembers what it was asked to load and
/// finishes every download instantly.
#[derive(Debug, Default)]
pub struct RecordingDownloader {
    pub current: Option<String>,
    pub downloads: Vec<String>,
    pub samples: Vec<String>,
}

impl SceneDownloader for RecordingDownloader {
    fn current_dataset(&self) -> Option<String> {
        self.current.clone()
    }

    fn state(&self) -> DownloadState {
        if self.current.is_some() {
            DownloadState::Done
        } else {
            DownloadState::Idle
        }
    }

    fn begin_download(&mut self, url: &str) {
        self.downloads.push(url.to_string());
        self.current = Some(url.to_string());
    }

    fn load_sample(&mut self, url: &str) {
        self.samples.push(url.to_string());
        self.current = Some(url.to_string());
    }
}

/// One viewer instance talking to a real relay.
pub struct TestPeer {
    pub controller: RelaySessionController<RecordingDownloader>,
    ui: Arc<Mutex<Vec<UiEvent>>>,
}

impl TestPeer {
    /// A solo peer configured for the relay at `addr`. `name` doubles as the
    /// display name and the stable guid.
    pub fn new(addr: SocketAddr, name: &str) -> Self {
        let config = SessionConfig {
            relay_addr: addr.to_string(),
            sign_in_retry_delay_ms: 10,
            max_sign_in_attempts: Some(3),
            fast_path_datasets: vec![SAMPLE_DATASET.to_string()],
            layer_fields: vec!["Slope".to_string(), "Albedo".to_string()],
            display_name: name.to_string(),
            guid: Some(format!("guid-{name}")),
            ..SessionConfig::default()
        };
        let mut controller = relay_controller(config, RecordingDownloader::default());
        let ui = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&ui);
        controller.subscribe(move |event| sink.lock().unwrap().push(event.clone()));
        Self { controller, ui }
    }

    pub fn host(&mut self, max_peers: u32) -> String {
        self.controller
            .create_session(max_peers)
            .expect("create_session failed")
            .to_string()
    }

    pub fn join(&mut self, code: &str) -> Result<(), SessionError> {
        self.controller.join_session(code)
    }

    pub fn leave(&mut self) {
        self.controller.leave_session();
    }

    pub fn tick(&mut self) {
        self.controller.tick();
    }

    pub fn syncs(&self) -> &Synchronizers {
        self.controller.synchronizers()
    }

    pub fn state(&self) -> ConnectionState {
        self.controller.state()
    }

    pub fn downloader(&self) -> &RecordingDownloader {
        self.controller.downloader()
    }

    /// Every UI event seen so far.
    pub fn ui_events(&self) -> Vec<UiEvent> {
        self.ui.lock().unwrap().clone()
    }

    /// Error dialogs seen so far.
    pub fn errors(&self) -> Vec<UiMessage> {
        self.ui_events()
            .into_iter()
            .filter_map(|e| match e {
                UiEvent::Error(message) => Some(message),
                _ => None,
            })
            .collect()
    }

    pub fn session_ended_count(&self) -> usize {
        self.ui_events()
            .iter()
            .filter(|e| matches!(e, UiEvent::SessionEnded))
            .count()
    }
}

/// Blocking: tick every peer until `done` holds for them. Panics after
/// `POLL_TIMEOUT`.
pub fn tick_until(
    peers: &mut [&mut TestPeer],
    what: &str,
    mut done: impl FnMut(&[&mut TestPeer]) -> bool,
) {
    let start = Instant::now();
    loop {
        for peer in peers.iter_mut() {
            peer.tick();
        }
        if done(peers) {
            return;
        }
        assert!(start.elapsed() < POLL_TIMEOUT, "timed out waiting for {what}");
        thread::sleep(POLL_INTERVAL);
    }
}

/// Tick every peer for a short while so in-flight traffic lands. For
/// asserting that something does NOT happen.
pub fn settle(peers: &mut [&mut TestPeer]) {
    for _ in 0..20 {
        for peer in peers.iter_mut() {
            peer.tick();
        }
        thread::sleep(POLL_INTERVAL);
    }
}
