// Peer-side relay access.
//
// Two shapes, matching the two kinds of relay connection:
// - `RelayApiClient`: stateless one-shot calls (sign-in, allocation, join
//   code lookup, join). Each call opens a TCP connection, writes one request,
//   reads one reply and drops the connection.
// - `RelayConnection`: a bound, long-lived connection. `bind()` performs the
//   connect + bind handshake on the calling thread, then spawns a background
//   reader thread that pushes `RelayEvent`s into an `mpsc` channel. The
//   owner holds the `BufWriter<TcpStream>` for sending and drains events with
//   the non-blocking `poll()`.
//
// The caller's thread therefore never blocks on network reads after the
// handshake. Writes flush synchronously (messages are small).
//
// This module lives in the relay crate (not the session crate) because it is
// purely std TCP + protocol framing + mpsc, and integration tests can use it
// to drive a relay without any session semantics.

use std::io::{self, BufReader, BufWriter};
use std::net::{Shutdown, TcpStream};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, trace};

use terrainview_protocol::framing::{read_json, write_json};
use terrainview_protocol::message::{
    ClientMessage, PROTOCOL_VERSION, RelayErrorReason, ServerMessage, Target,
};
use terrainview_protocol::types::{AllocationId, ConnectionKey, JoinCode, PeerId, PlayerToken};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum RelayClientError {
    #[error("could not reach relay at {addr}: {source}")]
    Connect { addr: String, source: io::Error },
    #[error("relay connection failed: {0}")]
    Io(#[from] io::Error),
    #[error("relay refused the request ({reason:?}): {detail}")]
    Refused {
        reason: RelayErrorReason,
        detail: String,
    },
    #[error("unexpected relay reply: {0}")]
    Unexpected(String),
}

/// A freshly created allocation, as seen by its host.
#[derive(Clone, Debug, PartialEq)]
pub struct HostAllocation {
    pub allocation_id: AllocationId,
    pub key: ConnectionKey,
    pub max_peers: u32,
}

/// The result of resolving a join code.
#[derive(Clone, Debug, PartialEq)]
pub struct JoinedAllocation {
    pub allocation_id: AllocationId,
    pub key: ConnectionKey,
}

/// One-shot relay API calls.
#[derive(Clone, Debug)]
pub struct RelayApiClient {
    addr: String,
    timeout: Duration,
}

impl RelayApiClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn sign_in(&self) -> Result<PlayerToken, RelayClientError> {
        match self.call(&ClientMessage::SignIn {
            protocol_version: PROTOCOL_VERSION,
        })? {
            ServerMessage::SignedIn { token } => Ok(token),
            other => Err(unexpected(&other)),
        }
    }

    pub fn create_allocation(
        &self,
        token: &PlayerToken,
        max_peers: u32,
    ) -> Result<HostAllocation, RelayClientError> {
        match self.call(&ClientMessage::CreateAllocation {
            token: token.clone(),
            max_peers,
        })? {
            ServerMessage::AllocationCreated {
                allocation_id,
                key,
                max_peers,
            } => Ok(HostAllocation {
                allocation_id,
                key,
                max_peers,
            }),
            other => Err(unexpected(&other)),
        }
    }

    pub fn join_code(
        &self,
        token: &PlayerToken,
        allocation_id: AllocationId,
    ) -> Result<JoinCode, RelayClientError> {
        match self.call(&ClientMessage::GetJoinCode {
            token: token.clone(),
            allocation_id,
        })? {
            ServerMessage::JoinCode { join_code } => Ok(join_code),
            other => Err(unexpected(&other)),
        }
    }

    /// Resolve a join code as the user typed it. Normalization and validation
    /// happen on the relay.
    pub fn join_allocation(
        &self,
        token: &PlayerToken,
        join_code: &str,
    ) -> Result<JoinedAllocation, RelayClientError> {
        match self.call(&ClientMessage::JoinAllocation {
            token: token.clone(),
            join_code: join_code.into(),
        })? {
            ServerMessage::AllocationJoined { allocation_id, key } => {
                Ok(JoinedAllocation { allocation_id, key })
            }
            other => Err(unexpected(&other)),
        }
    }

    fn call(&self, request: &ClientMessage) -> Result<ServerMessage, RelayClientError> {
        let stream = connect(&self.addr, self.timeout)?;
        let mut reader = BufReader::new(stream.try_clone()?);
        let mut writer = BufWriter::new(stream);
        write_json(&mut writer, request)?;
        match read_json(&mut reader)? {
            ServerMessage::Error { reason, detail } => {
                Err(RelayClientError::Refused { reason, detail })
            }
            reply => Ok(reply),
        }
    }
}

/// Which side of an allocation a connection binds as.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindRole {
    Host,
    Client,
}

/// Something that arrived on a bound connection.
#[derive(Clone, Debug, PartialEq)]
pub enum RelayEvent {
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
    Packet { from: PeerId, payload: Vec<u8> },
    /// The host left; the allocation no longer exists.
    HostDisconnected,
    /// The connection closed (EOF, read error or protocol violation).
    Closed,
}

/// A bound relay connection with a background reader thread.
pub struct RelayConnection {
    writer: BufWriter<TcpStream>,
    inbox: Receiver<RelayEvent>,
    _reader_thread: Option<JoinHandle<()>>,
    peer_id: PeerId,
    role: BindRole,
    closed: bool,
}

impl RelayConnection {
    /// Connect, bind to the allocation and spawn the reader thread.
    pub fn bind(
        addr: &str,
        role: BindRole,
        allocation_id: AllocationId,
        key: &ConnectionKey,
    ) -> Result<Self, RelayClientError> {
        let stream = connect(addr, DEFAULT_TIMEOUT)?;
        let mut reader = BufReader::new(stream.try_clone()?);
        let mut writer = BufWriter::new(stream);

        let request = match role {
            BindRole::Host => ClientMessage::BindHost {
                allocation_id,
                key: key.clone(),
            },
            BindRole::Client => ClientMessage::BindClient {
                allocation_id,
                key: key.clone(),
            },
        };
        write_json(&mut writer, &request)?;

        let peer_id = match read_json(&mut reader)? {
            ServerMessage::Bound { peer_id } => peer_id,
            ServerMessage::Error { reason, detail } => {
                return Err(RelayClientError::Refused { reason, detail });
            }
            other => return Err(unexpected(&other)),
        };

        // Clear read timeout for the long-lived reader loop.
        reader.get_ref().set_read_timeout(None)?;

        let (tx, rx) = mpsc::channel();
        let reader_thread = thread::Builder::new()
            .name(format!("relay-reader-{peer_id}"))
            .spawn(move || reader_loop(reader, tx))?;
        debug!(%allocation_id, %peer_id, ?role, "bound to relay");

        Ok(Self {
            writer,
            inbox: rx,
            _reader_thread: Some(reader_thread),
            peer_id,
            role,
            closed: false,
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn role(&self) -> BindRole {
        self.role
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Forward an opaque packet through the relay.
    pub fn send(&mut self, target: Target, payload: &[u8]) -> Result<(), RelayClientError> {
        trace!(?target, len = payload.len(), "relay send");
        write_json(
            &mut self.writer,
            &ClientMessage::Send {
                target,
                payload: payload.to_vec(),
            },
        )?;
        Ok(())
    }

    /// Drain all queued events (non-blocking).
    pub fn poll(&mut self) -> Vec<RelayEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.inbox.try_recv() {
            if event == RelayEvent::Closed {
                self.closed = true;
            }
            events.push(event);
        }
        events
    }

    /// Send Goodbye and close the connection. Idempotent.
    pub fn disconnect(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = write_json(&mut self.writer, &ClientMessage::Goodbye);
        let _ = self.writer.get_ref().shutdown(Shutdown::Both);
    }
}

impl Drop for RelayConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn connect(addr: &str, timeout: Duration) -> Result<TcpStream, RelayClientError> {
    let stream = TcpStream::connect(addr).map_err(|source| RelayClientError::Connect {
        addr: addr.into(),
        source,
    })?;
    stream.set_read_timeout(Some(timeout))?;
    Ok(stream)
}

fn unexpected(reply: &ServerMessage) -> RelayClientError {
    RelayClientError::Unexpected(format!("{reply:?}"))
}

/// Reader thread: read framed messages in a loop, push events to the channel.
fn reader_loop(mut reader: BufReader<TcpStream>, tx: Sender<RelayEvent>) {
    loop {
        let event = match read_json::<_, ServerMessage>(&mut reader) {
            Ok(ServerMessage::PeerConnected { peer_id }) => RelayEvent::PeerConnected(peer_id),
            Ok(ServerMessage::PeerDisconnected { peer_id }) => {
                RelayEvent::PeerDisconnected(peer_id)
            }
            Ok(ServerMessage::Packet { from, payload }) => RelayEvent::Packet { from, payload },
            Ok(ServerMessage::HostDisconnected) => RelayEvent::HostDisconnected,
            Ok(other) => {
                debug!(?other, "ignoring unexpected message on bound connection");
                continue;
            }
            Err(e) => {
                debug!(error = %e, "relay connection ended");
                let _ = tx.send(RelayEvent::Closed);
                break;
            }
        };
        if tx.send(event).is_err() {
            break; // Owner dropped the receiver.
        }
    }
}
