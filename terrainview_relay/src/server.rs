// TCP server and main event loop for the relay.
//
// Architecture: thread-per-reader with a central `mpsc` channel.
//
// - **Listener thread** (`TcpListener::accept()` loop): accepts new TCP
//   connections and sends `InternalEvent::NewConnection` to the main thread.
// - **Main thread**: owns the `RelayState`. For a new connection it reads
//   the first message (with a short timeout). API calls are answered and the
//   connection is closed. A successful bind hands the write half to
//   `RelayState` and spawns a reader thread.
// - **Reader threads** (one per bound connection): call `read_json()` in a
//   loop and send `InternalEvent::MessageFrom` to the main thread. On
//   `Goodbye`, error or EOF they send `InternalEvent::Disconnected`.
//
// The main thread is the only writer to TCP streams. Reader threads only
// read.
//
// Expiry: the main loop calls `RelayState::sweep` every `SWEEP_INTERVAL`
// to release reservations that were never bound.
//
// Shutdown: `RelayHandle::stop` clears `keep_running`; the main loop polls it
// every `POLL_INTERVAL`, closes every bound connection and exits.

use std::io::{BufReader, BufWriter};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use terrainview_protocol::framing::{read_json, write_json};
use terrainview_protocol::message::{ClientMessage, RelayErrorReason, ServerMessage};
use terrainview_protocol::types::{AllocationId, PeerId};

use crate::state::{DEFAULT_RESERVATION_TIMEOUT, DEFAULT_TOKEN_IDLE_TIMEOUT, RelayState};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Events sent from listener/reader threads to the main thread.
enum InternalEvent {
    NewConnection {
        stream: TcpStream,
        addr: SocketAddr,
    },
    MessageFrom {
        allocation_id: AllocationId,
        peer_id: PeerId,
        message: ClientMessage,
    },
    Disconnected {
        allocation_id: AllocationId,
        peer_id: PeerId,
    },
}

/// Handle returned by `start_relay` to control the running server.
pub struct RelayHandle {
    keep_running: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl RelayHandle {
    /// Signal the relay to stop and wait for it to shut down.
    pub fn stop(self) {
        self.keep_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread {
            let _ = handle.join();
        }
    }
}

/// Configuration for starting a relay server. Loadable from a JSON file;
/// missing fields take their defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub port: u16,
    pub bind_host: String,
    /// Allocations that may exist at once before `QuotaExceeded`.
    pub max_allocations: usize,
    /// Upper bound for `max_peers` on a single allocation.
    pub max_peers_limit: u32,
    /// Fixed seed for join-code generation. `None` seeds from the OS.
    pub code_seed: Option<u64>,
    /// Seconds an allocation waits for its host, and a join key for its
    /// client, before the slot is released.
    pub reservation_timeout_secs: u64,
    /// Seconds a sign-in token may go unused before it is forgotten.
    pub token_idle_timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 7979,
            bind_host: "127.0.0.1".into(),
            max_allocations: 64,
            max_peers_limit: 16,
            code_seed: None,
            reservation_timeout_secs: DEFAULT_RESERVATION_TIMEOUT.as_secs(),
            token_idle_timeout_secs: DEFAULT_TOKEN_IDLE_TIMEOUT.as_secs(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RelayConfigError {
    #[error("failed to read relay config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid relay config: {0}")]
    Json(#[from] serde_json::Error),
}

impl RelayConfig {
    pub fn from_json(text: &str) -> Result<Self, RelayConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, RelayConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }
}

/// Start the relay server on a background thread. Returns a handle for
/// stopping it and the actual bound address (useful when port 0 is used
/// to let the OS pick a free port).
pub fn start_relay(config: RelayConfig) -> std::io::Result<(RelayHandle, SocketAddr)> {
    let listener = TcpListener::bind((config.bind_host.as_str(), config.port))?;
    let addr = listener.local_addr()?;
    let keep_running = Arc::new(AtomicBool::new(true));
    let keep_running_clone = keep_running.clone();

    let thread = thread::Builder::new()
        .name("relay-main".into())
        .spawn(move || {
            run_relay(listener, config, keep_running_clone);
        })?;

    info!(%addr, "relay listening");
    Ok((
        RelayHandle {
            keep_running,
            thread: Some(thread),
        },
        addr,
    ))
}

/// Main relay loop. Runs until `keep_running` is set to false.
fn run_relay(listener: TcpListener, config: RelayConfig, keep_running: Arc<AtomicBool>) {
    let mut state = RelayState::new(
        config.max_allocations,
        config.max_peers_limit,
        config.code_seed,
    )
    .with_timeouts(
        Duration::from_secs(config.reservation_timeout_secs),
        Duration::from_secs(config.token_idle_timeout_secs),
    );
    let mut last_sweep = Instant::now();

    let (tx, rx): (Sender<InternalEvent>, Receiver<InternalEvent>) = mpsc::channel();

    // Non-blocking so the accept thread can check keep_running periodically.
    if let Err(e) = listener.set_nonblocking(true) {
        warn!(error = %e, "could not make listener non-blocking");
    }

    let keep_running_listener = keep_running.clone();
    let tx_listener = tx.clone();
    thread::spawn(move || {
        while keep_running_listener.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, addr)) => {
                    stream.set_nonblocking(false).ok();
                    let _ = tx_listener.send(InternalEvent::NewConnection { stream, addr });
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    warn!(error = %e, "accept failed; listener stopping");
                    break;
                }
            }
        }
    });

    while keep_running.load(Ordering::SeqCst) {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(event) => {
                handle_event(&mut state, event, &tx, &keep_running);
                // Drain any additional events that arrived during handling.
                while let Ok(event) = rx.try_recv() {
                    handle_event(&mut state, event, &tx, &keep_running);
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
        if last_sweep.elapsed() >= SWEEP_INTERVAL {
            last_sweep = Instant::now();
            state.sweep(last_sweep);
        }
    }

    state.shutdown_all();
    info!("relay stopped");
}

fn handle_event(
    state: &mut RelayState,
    event: InternalEvent,
    tx: &Sender<InternalEvent>,
    keep_running: &Arc<AtomicBool>,
) {
    match event {
        InternalEvent::NewConnection { stream, addr } => {
            handle_new_connection(state, stream, addr, tx, keep_running);
        }
        InternalEvent::MessageFrom {
            allocation_id,
            peer_id,
            message,
        } => match message {
            ClientMessage::Send { target, payload } => {
                state.forward(allocation_id, peer_id, target, payload);
            }
            other => {
                warn!(%allocation_id, %peer_id, ?other, "unexpected message on bound connection");
            }
        },
        InternalEvent::Disconnected {
            allocation_id,
            peer_id,
        } => {
            state.disconnect(allocation_id, peer_id);
        }
    }
}

/// Read the first message of a new connection. API calls are answered and
/// the connection dropped; bind requests attach it to an allocation and
/// spawn its reader thread.
fn handle_new_connection(
    state: &mut RelayState,
    stream: TcpStream,
    addr: SocketAddr,
    tx: &Sender<InternalEvent>,
    keep_running: &Arc<AtomicBool>,
) {
    stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT)).ok();

    let mut reader = match stream.try_clone() {
        Ok(s) => BufReader::new(s),
        Err(e) => {
            debug!(%addr, error = %e, "could not clone stream");
            return;
        }
    };

    let first: ClientMessage = match read_json(&mut reader) {
        Ok(msg) => msg,
        Err(e) => {
            debug!(%addr, error = %e, "connection closed before first message");
            reply_and_close(
                stream,
                &ServerMessage::Error {
                    reason: RelayErrorReason::Protocol,
                    detail: e.to_string(),
                },
            );
            return;
        }
    };

    if let Some(reply) = state.handle_api(&first) {
        reply_and_close(stream, &reply);
        return;
    }

    let write_stream = match stream.try_clone() {
        Ok(s) => s,
        Err(e) => {
            debug!(%addr, error = %e, "could not clone stream");
            return;
        }
    };

    let (allocation_id, bound) = match first {
        ClientMessage::BindHost { allocation_id, key } => {
            (allocation_id, state.bind_host(allocation_id, &key, write_stream))
        }
        ClientMessage::BindClient { allocation_id, key } => {
            (allocation_id, state.bind_client(allocation_id, &key, write_stream))
        }
        other => {
            debug!(%addr, ?other, "expected an API call or bind as first message");
            reply_and_close(
                stream,
                &ServerMessage::Error {
                    reason: RelayErrorReason::Protocol,
                    detail: "expected an API call or bind request".into(),
                },
            );
            return;
        }
    };

    match bound {
        Ok(peer_id) => {
            // Clear read timeout for the long-lived reader loop.
            stream.set_read_timeout(None).ok();
            let tx_reader = tx.clone();
            let keep_running_reader = keep_running.clone();
            thread::spawn(move || {
                reader_loop(reader, allocation_id, peer_id, tx_reader, keep_running_reader);
            });
        }
        Err((reason, detail)) => {
            debug!(%addr, %allocation_id, ?reason, %detail, "bind refused");
            reply_and_close(stream, &ServerMessage::Error { reason, detail });
        }
    }
}

fn reply_and_close(stream: TcpStream, reply: &ServerMessage) {
    let mut writer = BufWriter::new(stream);
    if let Err(e) = write_json(&mut writer, reply) {
        debug!(error = %e, "could not deliver reply");
    }
}

/// Reader loop for one bound connection. Runs in its own thread.
fn reader_loop(
    mut reader: BufReader<TcpStream>,
    allocation_id: AllocationId,
    peer_id: PeerId,
    tx: Sender<InternalEvent>,
    keep_running: Arc<AtomicBool>,
) {
    while keep_running.load(Ordering::SeqCst) {
        match read_json::<_, ClientMessage>(&mut reader) {
            Ok(ClientMessage::Goodbye) => break,
            Ok(message) => {
                let _ = tx.send(InternalEvent::MessageFrom {
                    allocation_id,
                    peer_id,
                    message,
                });
            }
            Err(e) => {
                debug!(%allocation_id, %peer_id, error = %e, "connection ended");
                break;
            }
        }
    }
    let _ = tx.send(InternalEvent::Disconnected {
        allocation_id,
        peer_id,
    });
}
