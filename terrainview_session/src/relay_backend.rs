// `RelayService` and `Transport` over the TCP relay client.
//
// `RelayBackend` holds the sign-in token between calls and translates relay
// refusals into the session error taxonomy. `RelayTransport` owns at most one
// bound `RelayConnection`; host-disconnect and connection-closed both
// surface as `TransportEvent::Closed`.

use tracing::{debug, info, warn};

use terrainview_protocol::message::{RelayErrorReason, Target};
use terrainview_protocol::types::{AllocationId, JoinCode, PeerId, PlayerToken};
use terrainview_relay::client::{BindRole, RelayApiClient, RelayClientError, RelayConnection, RelayEvent};

use crate::error::{SessionError, TransportError};
use crate::services::{RelayAllocation, RelayServerData, RelayService, Transport, TransportEvent};

pub struct RelayBackend {
    api: RelayApiClient,
    token: Option<PlayerToken>,
}

impl RelayBackend {
    pub fn new(relay_addr: impl Into<String>) -> Self {
        Self {
            api: RelayApiClient::new(relay_addr),
            token: None,
        }
    }

    pub fn relay_addr(&self) -> &str {
        self.api.addr()
    }

    fn token(&self) -> Result<&PlayerToken, SessionError> {
        self.token
            .as_ref()
            .ok_or_else(|| SessionError::Identity("not signed in".into()))
    }

    /// An `Unauthorized` refusal means our token is no good; drop it so the
    /// next operation signs in again.
    fn forget_token_if_unauthorized(&mut self, e: &RelayClientError) {
        if let RelayClientError::Refused {
            reason: RelayErrorReason::Unauthorized,
            ..
        } = e
        {
            self.token = None;
        }
    }
}

impl RelayService for RelayBackend {
    fn initialize(&mut self) -> Result<(), SessionError> {
        debug!(relay = self.api.addr(), "relay service ready");
        Ok(())
    }

    fn sign_in_anonymously(&mut self) -> Result<(), SessionError> {
        let token = self
            .api
            .sign_in()
            .map_err(|e| SessionError::Identity(e.to_string()))?;
        info!("signed in anonymously");
        self.token = Some(token);
        Ok(())
    }

    fn is_signed_in(&self) -> bool {
        self.token.is_some()
    }

    fn allocate(&mut self, max_peers: u32) -> Result<RelayAllocation, SessionError> {
        let result = self.api.create_allocation(self.token()?, max_peers);
        match result {
            Ok(alloc) => Ok(RelayAllocation {
                allocation_id: alloc.allocation_id,
                server: RelayServerData {
                    allocation_id: alloc.allocation_id,
                    key: alloc.key,
                },
                max_peers: alloc.max_peers,
            }),
            Err(e) => {
                self.forget_token_if_unauthorized(&e);
                Err(allocation_error(e))
            }
        }
    }

    fn get_join_code(&mut self, allocation_id: AllocationId) -> Result<JoinCode, SessionError> {
        let result = self.api.join_code(self.token()?, allocation_id);
        result.map_err(|e| {
            self.forget_token_if_unauthorized(&e);
            allocation_error(e)
        })
    }

    fn join_allocation(&mut self, code: &JoinCode) -> Result<RelayServerData, SessionError> {
        let result = self.api.join_allocation(self.token()?, code.as_str());
        match result {
            Ok(joined) => Ok(RelayServerData {
                allocation_id: joined.allocation_id,
                key: joined.key,
            }),
            Err(e) => {
                self.forget_token_if_unauthorized(&e);
                Err(join_error(e))
            }
        }
    }
}

fn allocation_error(e: RelayClientError) -> SessionError {
    match e {
        RelayClientError::Refused {
            reason: RelayErrorReason::QuotaExceeded,
            ..
        } => SessionError::QuotaExceeded,
        other => SessionError::Allocation(other.to_string()),
    }
}

fn join_error(e: RelayClientError) -> SessionError {
    match e {
        RelayClientError::Refused { reason, detail } => match reason {
            RelayErrorReason::JoinCodeNotFound | RelayErrorReason::AllocationNotFound => {
                SessionError::CodeNotFound
            }
            RelayErrorReason::InvalidRequest => SessionError::InvalidRequest(detail),
            other => SessionError::Connection(format!("{other:?}: {detail}")),
        },
        other => SessionError::Connection(other.to_string()),
    }
}

pub struct RelayTransport {
    relay_addr: String,
    server: Option<RelayServerData>,
    connection: Option<RelayConnection>,
}

impl RelayTransport {
    pub fn new(relay_addr: impl Into<String>) -> Self {
        Self {
            relay_addr: relay_addr.into(),
            server: None,
            connection: None,
        }
    }

    fn start(&mut self, role: BindRole) -> Result<PeerId, TransportError> {
        let server = self.server.as_ref().ok_or(TransportError::NotBound)?;
        if let Some(mut old) = self.connection.take() {
            warn!("transport restarted while running; old connection dropped");
            old.disconnect();
        }
        let connection =
            RelayConnection::bind(&self.relay_addr, role, server.allocation_id, &server.key)?;
        let peer = connection.peer_id();
        self.connection = Some(connection);
        Ok(peer)
    }
}

impl Transport for RelayTransport {
    fn bind(&mut self, server: RelayServerData) {
        self.server = Some(server);
    }

    fn start_host(&mut self) -> Result<PeerId, TransportError> {
        self.start(BindRole::Host)
    }

    fn start_client(&mut self) -> Result<PeerId, TransportError> {
        self.start(BindRole::Client)
    }

    fn shutdown(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.disconnect();
            debug!("transport shut down");
        }
        self.server = None;
    }

    fn is_running(&self) -> bool {
        self.connection.as_ref().is_some_and(|c| !c.is_closed())
    }

    fn send(&mut self, target: Target, bytes: &[u8]) -> Result<(), TransportError> {
        let connection = self.connection.as_mut().ok_or(TransportError::NotRunning)?;
        connection.send(target, bytes)?;
        Ok(())
    }

    fn poll(&mut self) -> Vec<TransportEvent> {
        let Some(connection) = self.connection.as_mut() else {
            return Vec::new();
        };
        let mut events = Vec::new();
        for event in connection.poll() {
            let mapped = match event {
                RelayEvent::PeerConnected(peer) => TransportEvent::PeerConnected(peer),
                RelayEvent::PeerDisconnected(peer) => TransportEvent::PeerDisconnected(peer),
                RelayEvent::Packet { from, payload } => TransportEvent::Data {
                    from,
                    bytes: payload,
                },
                RelayEvent::HostDisconnected | RelayEvent::Closed => TransportEvent::Closed,
            };
            // HostDisconnected is followed by Closed; report the loss once.
            if mapped == TransportEvent::Closed && events.last() == Some(&TransportEvent::Closed) {
                continue;
            }
            events.push(mapped);
        }
        events
    }
}
