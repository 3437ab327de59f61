// Relay state: identities, allocations, join codes and bound connections.
//
// `RelayState` is the data structure `server.rs` drives. All mutation happens
// on the server's single main thread, so there is no internal locking.
//
// Key responsibilities:
// - Anonymous identity: `sign_in` issues a random token; every other API call
//   must present one.
// - Allocations: `create_allocation` reserves a slot for up to `max_peers`
//   client connections (the host is not counted), generates a unique join
//   code and a host connection key. A global `max_allocations` quota bounds
//   how many can exist at once.
// - Join: `join_allocation` normalizes the typed code, distinguishes
//   malformed codes (`InvalidRequest`) from unknown ones
//   (`JoinCodeNotFound`), and issues a single-use client key.
// - Binding: `bind_host` / `bind_client` attach a TCP write half to the
//   allocation. A client bind notifies the host with `PeerConnected`.
// - Forwarding: host packets go to one client or all clients; client packets
//   may only go to the host. Anything else is dropped and logged.
// - Teardown: a host leaving closes the allocation and tells every client
//   `HostDisconnected`; a client leaving tells the host `PeerDisconnected`.
// - Expiry: `sweep` drops allocations whose host never bound and client
//   keys never redeemed within the reservation timeout, and tokens idle
//   past the token timeout that own no allocation.
//
// Write errors on one connection are logged and otherwise ignored. That
// connection's reader thread will see the broken pipe and report it.

use std::collections::{BTreeMap, HashMap};
use std::io::BufWriter;
use std::net::{Shutdown, TcpStream};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};
use uuid::Uuid;

use terrainview_protocol::framing::write_json;
use terrainview_protocol::message::{
    ClientMessage, PROTOCOL_VERSION, RelayErrorReason, ServerMessage, Target,
};
use terrainview_protocol::types::{AllocationId, ConnectionKey, JoinCode, PeerId, PlayerToken};

/// A refused request: reason code plus human-readable detail.
pub type Rejection = (RelayErrorReason, String);

fn reject(reason: RelayErrorReason, detail: impl Into<String>) -> Rejection {
    (reason, detail.into())
}

/// How long an allocation may wait for its host, or a join key for its
/// client, before the slot is released.
pub const DEFAULT_RESERVATION_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a sign-in token survives without being presented.
pub const DEFAULT_TOKEN_IDLE_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// All relay-side state.
pub struct RelayState {
    /// Token -> last time it was presented.
    tokens: HashMap<PlayerToken, Instant>,
    allocations: BTreeMap<AllocationId, Allocation>,
    codes: BTreeMap<JoinCode, AllocationId>,
    next_allocation_id: u64,
    max_allocations: usize,
    max_peers_limit: u32,
    reservation_timeout: Duration,
    token_idle_timeout: Duration,
    rng: StdRng,
}

struct Allocation {
    owner: PlayerToken,
    join_code: JoinCode,
    max_peers: u32,
    host_key: ConnectionKey,
    created: Instant,
    /// Join keys not yet bound, with when they were issued.
    pending_keys: HashMap<ConnectionKey, Instant>,
    host: Option<BufWriter<TcpStream>>,
    clients: BTreeMap<PeerId, BufWriter<TcpStream>>,
    next_peer_id: u64,
}

impl RelayState {
    /// `code_seed` makes join-code generation reproducible (tests); `None`
    /// seeds from the OS.
    pub fn new(max_allocations: usize, max_peers_limit: u32, code_seed: Option<u64>) -> Self {
        let rng = match code_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            tokens: HashMap::new(),
            allocations: BTreeMap::new(),
            codes: BTreeMap::new(),
            next_allocation_id: 1,
            max_allocations,
            max_peers_limit,
            reservation_timeout: DEFAULT_RESERVATION_TIMEOUT,
            token_idle_timeout: DEFAULT_TOKEN_IDLE_TIMEOUT,
            rng,
        }
    }

    pub fn with_timeouts(mut self, reservation: Duration, token_idle: Duration) -> Self {
        self.reservation_timeout = reservation;
        self.token_idle_timeout = token_idle;
        self
    }

    /// Answer a one-shot API call. Returns `None` if `msg` is not an API call
    /// (bind requests and packets are handled elsewhere).
    pub fn handle_api(&mut self, msg: &ClientMessage) -> Option<ServerMessage> {
        let result = match msg {
            ClientMessage::SignIn { protocol_version } => self.sign_in(*protocol_version),
            ClientMessage::CreateAllocation { token, max_peers } => {
                self.create_allocation(token, *max_peers)
            }
            ClientMessage::GetJoinCode {
                token,
                allocation_id,
            } => self.join_code_of(token, *allocation_id),
            ClientMessage::JoinAllocation { token, join_code } => {
                self.join_allocation(token, join_code)
            }
            _ => return None,
        };
        Some(result.unwrap_or_else(|(reason, detail)| {
            debug!(?reason, %detail, "API request refused");
            ServerMessage::Error { reason, detail }
        }))
    }

    pub fn sign_in(&mut self, protocol_version: u32) -> Result<ServerMessage, Rejection> {
        if protocol_version != PROTOCOL_VERSION {
            return Err(reject(
                RelayErrorReason::InvalidRequest,
                format!("unsupported protocol version {protocol_version}"),
            ));
        }
        let token = PlayerToken(Uuid::new_v4().to_string());
        self.tokens.insert(token.clone(), Instant::now());
        debug!(signed_in = self.tokens.len(), "anonymous sign-in");
        Ok(ServerMessage::SignedIn { token })
    }

    pub fn create_allocation(
        &mut self,
        token: &PlayerToken,
        max_peers: u32,
    ) -> Result<ServerMessage, Rejection> {
        self.authorize(token)?;
        if max_peers == 0 || max_peers > self.max_peers_limit {
            return Err(reject(
                RelayErrorReason::InvalidRequest,
                format!(
                    "max_peers must be in 1..={}, got {max_peers}",
                    self.max_peers_limit
                ),
            ));
        }
        if self.allocations.len() >= self.max_allocations {
            return Err(reject(
                RelayErrorReason::QuotaExceeded,
                format!("relay is at its limit of {} allocations", self.max_allocations),
            ));
        }

        let allocation_id = AllocationId(self.next_allocation_id);
        self.next_allocation_id += 1;
        let join_code = self.fresh_join_code();
        let host_key = new_key();

        self.codes.insert(join_code.clone(), allocation_id);
        self.allocations.insert(
            allocation_id,
            Allocation {
                owner: token.clone(),
                join_code: join_code.clone(),
                max_peers,
                host_key: host_key.clone(),
                created: Instant::now(),
                pending_keys: HashMap::new(),
                host: None,
                clients: BTreeMap::new(),
                next_peer_id: 1,
            },
        );
        info!(%allocation_id, %join_code, max_peers, "allocation created");

        Ok(ServerMessage::AllocationCreated {
            allocation_id,
            key: host_key,
            max_peers,
        })
    }

    pub fn join_code_of(
        &mut self,
        token: &PlayerToken,
        allocation_id: AllocationId,
    ) -> Result<ServerMessage, Rejection> {
        self.authorize(token)?;
        let alloc = self.allocations.get(&allocation_id).ok_or_else(|| {
            reject(
                RelayErrorReason::AllocationNotFound,
                format!("no allocation {allocation_id}"),
            )
        })?;
        if &alloc.owner != token {
            return Err(reject(
                RelayErrorReason::Unauthorized,
                "allocation belongs to another player",
            ));
        }
        Ok(ServerMessage::JoinCode {
            join_code: alloc.join_code.clone(),
        })
    }

    pub fn join_allocation(
        &mut self,
        token: &PlayerToken,
        raw_code: &str,
    ) -> Result<ServerMessage, Rejection> {
        self.authorize(token)?;
        let code = JoinCode::parse(raw_code)
            .map_err(|e| reject(RelayErrorReason::InvalidRequest, e.to_string()))?;
        if !code.is_well_formed() {
            return Err(reject(
                RelayErrorReason::InvalidRequest,
                format!("malformed join code {code}"),
            ));
        }
        let allocation_id = *self.codes.get(&code).ok_or_else(|| {
            reject(
                RelayErrorReason::JoinCodeNotFound,
                format!("no allocation for code {code}"),
            )
        })?;
        let alloc = self.allocations.get_mut(&allocation_id).ok_or_else(|| {
            reject(
                RelayErrorReason::AllocationNotFound,
                format!("no allocation {allocation_id}"),
            )
        })?;

        let reserved = alloc.clients.len() + alloc.pending_keys.len();
        if reserved >= alloc.max_peers as usize {
            return Err(reject(
                RelayErrorReason::AllocationFull,
                format!("allocation {allocation_id} is full"),
            ));
        }
        let key = new_key();
        alloc.pending_keys.insert(key.clone(), Instant::now());
        debug!(%allocation_id, %code, "join reserved a client slot");

        Ok(ServerMessage::AllocationJoined { allocation_id, key })
    }

    /// Attach the host's connection. Sends `Bound` on success.
    pub fn bind_host(
        &mut self,
        allocation_id: AllocationId,
        key: &ConnectionKey,
        stream: TcpStream,
    ) -> Result<PeerId, Rejection> {
        let alloc = self.allocation_mut(allocation_id)?;
        if &alloc.host_key != key {
            return Err(reject(RelayErrorReason::Unauthorized, "wrong host key"));
        }
        if alloc.host.is_some() {
            return Err(reject(
                RelayErrorReason::InvalidRequest,
                "host is already bound",
            ));
        }
        let mut writer = BufWriter::new(stream);
        send_message(
            &mut writer,
            &ServerMessage::Bound {
                peer_id: PeerId::HOST,
            },
        );
        alloc.host = Some(writer);
        info!(%allocation_id, "host bound");
        Ok(PeerId::HOST)
    }

    /// Attach a client's connection. Sends `Bound` to the client and
    /// `PeerConnected` to the host.
    pub fn bind_client(
        &mut self,
        allocation_id: AllocationId,
        key: &ConnectionKey,
        stream: TcpStream,
    ) -> Result<PeerId, Rejection> {
        let alloc = self.allocation_mut(allocation_id)?;
        if alloc.host.is_none() {
            return Err(reject(
                RelayErrorReason::AllocationNotFound,
                "host has not bound to this allocation",
            ));
        }
        if alloc.pending_keys.remove(key).is_none() {
            return Err(reject(
                RelayErrorReason::Unauthorized,
                "unknown or already used connection key",
            ));
        }

        let peer_id = PeerId(alloc.next_peer_id);
        alloc.next_peer_id += 1;

        let mut writer = BufWriter::new(stream);
        send_message(&mut writer, &ServerMessage::Bound { peer_id });
        alloc.clients.insert(peer_id, writer);
        if let Some(host) = alloc.host.as_mut() {
            send_message(host, &ServerMessage::PeerConnected { peer_id });
        }
        info!(%allocation_id, %peer_id, "client bound");
        Ok(peer_id)
    }

    /// Forward a packet. Hub-and-spoke: clients may only address the host.
    pub fn forward(
        &mut self,
        allocation_id: AllocationId,
        from: PeerId,
        target: Target,
        payload: Vec<u8>,
    ) {
        let Some(alloc) = self.allocations.get_mut(&allocation_id) else {
            debug!(%allocation_id, %from, "packet for closed allocation dropped");
            return;
        };
        let packet = ServerMessage::Packet { from, payload };

        if from.is_host() {
            match target {
                Target::Broadcast => {
                    for writer in alloc.clients.values_mut() {
                        send_message(writer, &packet);
                    }
                }
                Target::Peer(peer_id) => match alloc.clients.get_mut(&peer_id) {
                    Some(writer) => send_message(writer, &packet),
                    None => debug!(%allocation_id, %peer_id, "packet for unknown peer dropped"),
                },
                Target::Host => debug!(%allocation_id, "host addressed itself; dropped"),
            }
        } else {
            match target {
                Target::Host => {
                    if let Some(host) = alloc.host.as_mut() {
                        send_message(host, &packet);
                    }
                }
                other => {
                    warn!(%allocation_id, %from, ?other, "clients may only address the host; dropped");
                }
            }
        }
    }

    /// A bound connection went away (Goodbye, EOF or read error).
    pub fn disconnect(&mut self, allocation_id: AllocationId, peer_id: PeerId) {
        if peer_id.is_host() {
            let Some(mut alloc) = self.allocations.remove(&allocation_id) else {
                return;
            };
            self.codes.remove(&alloc.join_code);
            for (_, mut writer) in std::mem::take(&mut alloc.clients) {
                send_message(&mut writer, &ServerMessage::HostDisconnected);
                close(writer);
            }
            if let Some(host) = alloc.host.take() {
                close(host);
            }
            info!(%allocation_id, "host left; allocation closed");
        } else if let Some(alloc) = self.allocations.get_mut(&allocation_id)
            && let Some(writer) = alloc.clients.remove(&peer_id)
        {
            close(writer);
            if let Some(host) = alloc.host.as_mut() {
                send_message(host, &ServerMessage::PeerDisconnected { peer_id });
            }
            info!(%allocation_id, %peer_id, "client left");
        }
    }

    /// Release reservations nobody claimed and forget idle tokens. `now` is
    /// a parameter so tests can step past the timeouts.
    pub fn sweep(&mut self, now: Instant) {
        let reservation_timeout = self.reservation_timeout;
        let expired = |since: Instant| now.saturating_duration_since(since) >= reservation_timeout;

        let abandoned: Vec<AllocationId> = self
            .allocations
            .iter()
            .filter(|(_, a)| a.host.is_none() && expired(a.created))
            .map(|(id, _)| *id)
            .collect();
        for allocation_id in abandoned {
            if let Some(alloc) = self.allocations.remove(&allocation_id) {
                self.codes.remove(&alloc.join_code);
                info!(%allocation_id, "host never bound; allocation released");
            }
        }

        for (allocation_id, alloc) in &mut self.allocations {
            let before = alloc.pending_keys.len();
            alloc.pending_keys.retain(|_, issued| !expired(*issued));
            let released = before - alloc.pending_keys.len();
            if released > 0 {
                debug!(%allocation_id, released, "unredeemed join keys released");
            }
        }

        let token_idle_timeout = self.token_idle_timeout;
        let owners: Vec<PlayerToken> = self.allocations.values().map(|a| a.owner.clone()).collect();
        let before = self.tokens.len();
        self.tokens.retain(|token, last_used| {
            owners.contains(token) || now.saturating_duration_since(*last_used) < token_idle_timeout
        });
        if self.tokens.len() < before {
            debug!(forgotten = before - self.tokens.len(), "idle tokens forgotten");
        }
    }

    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    /// Close every bound connection (relay shutdown).
    pub fn shutdown_all(&mut self) {
        let ids: Vec<AllocationId> = self.allocations.keys().copied().collect();
        for id in ids {
            self.disconnect(id, PeerId::HOST);
        }
    }

    pub fn allocation_count(&self) -> usize {
        self.allocations.len()
    }

    /// Bound connections in an allocation, host included.
    pub fn bound_count(&self, allocation_id: AllocationId) -> usize {
        self.allocations.get(&allocation_id).map_or(0, |a| {
            a.clients.len() + usize::from(a.host.is_some())
        })
    }

    /// Check a token and mark it as used now.
    fn authorize(&mut self, token: &PlayerToken) -> Result<(), Rejection> {
        match self.tokens.get_mut(token) {
            Some(last_used) => {
                *last_used = Instant::now();
                Ok(())
            }
            None => Err(reject(RelayErrorReason::Unauthorized, "unknown player token")),
        }
    }

    fn allocation_mut(&mut self, allocation_id: AllocationId) -> Result<&mut Allocation, Rejection> {
        self.allocations.get_mut(&allocation_id).ok_or_else(|| {
            reject(
                RelayErrorReason::AllocationNotFound,
                format!("no allocation {allocation_id}"),
            )
        })
    }

    fn fresh_join_code(&mut self) -> JoinCode {
        loop {
            let raw: String = (0..JoinCode::LEN)
                .map(|_| {
                    let idx = self.rng.random_range(0..JoinCode::ALPHABET.len());
                    char::from(JoinCode::ALPHABET[idx])
                })
                .collect();
            if let Ok(code) = JoinCode::parse(&raw)
                && !self.codes.contains_key(&code)
            {
                return code;
            }
        }
    }
}

fn new_key() -> ConnectionKey {
    ConnectionKey(Uuid::new_v4().to_string())
}

fn send_message(writer: &mut BufWriter<TcpStream>, msg: &ServerMessage) {
    if let Err(e) = write_json(writer, msg) {
        debug!(error = %e, "write to peer failed");
    }
}

fn close(writer: BufWriter<TcpStream>) {
    let _ = writer.get_ref().shutdown(Shutdown::Both);
}

#[cfg(test)]
mod tests {
    use std::io::BufReader;
    use std::net::TcpListener;

    use terrainview_protocol::framing::read_json;

    use super::*;

    /// Create a TCP pair: (client_stream, server_stream) on localhost.
    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    fn recv(reader: &mut BufReader<TcpStream>) -> ServerMessage {
        read_json(reader).unwrap()
    }

    fn signed_in(state: &mut RelayState) -> PlayerToken {
        match state.sign_in(PROTOCOL_VERSION).unwrap() {
            ServerMessage::SignedIn { token } => token,
            other => panic!("expected SignedIn, got {other:?}"),
        }
    }

    fn allocate(
        state: &mut RelayState,
        token: &PlayerToken,
        max_peers: u32,
    ) -> (AllocationId, ConnectionKey) {
        match state.create_allocation(token, max_peers).unwrap() {
            ServerMessage::AllocationCreated {
                allocation_id, key, ..
            } => (allocation_id, key),
            other => panic!("expected AllocationCreated, got {other:?}"),
        }
    }

    fn code_of(state: &mut RelayState, token: &PlayerToken, id: AllocationId) -> JoinCode {
        match state.join_code_of(token, id).unwrap() {
            ServerMessage::JoinCode { join_code } => join_code,
            other => panic!("expected JoinCode, got {other:?}"),
        }
    }

    fn join(state: &mut RelayState, token: &PlayerToken, code: &str) -> ConnectionKey {
        match state.join_allocation(token, code).unwrap() {
            ServerMessage::AllocationJoined { key, .. } => key,
            other => panic!("expected AllocationJoined, got {other:?}"),
        }
    }

    #[test]
    fn allocation_produces_well_formed_code() {
        let mut state = RelayState::new(4, 16, Some(7));
        let token = signed_in(&mut state);
        let (id, _) = allocate(&mut state, &token, 9);
        let code = code_of(&mut state, &token, id);
        assert!(code.is_well_formed(), "{code}");
        assert_eq!(state.allocation_count(), 1);
    }

    #[test]
    fn seeded_codes_are_reproducible() {
        let mut a = RelayState::new(4, 16, Some(42));
        let mut b = RelayState::new(4, 16, Some(42));
        let ta = signed_in(&mut a);
        let tb = signed_in(&mut b);
        let (ia, _) = allocate(&mut a, &ta, 9);
        let (ib, _) = allocate(&mut b, &tb, 9);
        assert_eq!(code_of(&mut a, &ta, ia), code_of(&mut b, &tb, ib));
    }

    #[test]
    fn wrong_protocol_version_rejected() {
        let mut state = RelayState::new(4, 16, None);
        let err = state.sign_in(PROTOCOL_VERSION + 1).unwrap_err();
        assert_eq!(err.0, RelayErrorReason::InvalidRequest);
    }

    #[test]
    fn api_calls_require_a_token() {
        let mut state = RelayState::new(4, 16, None);
        let bogus = PlayerToken("not-issued".into());
        let reply = state
            .handle_api(&ClientMessage::CreateAllocation {
                token: bogus,
                max_peers: 9,
            })
            .unwrap();
        assert!(matches!(
            reply,
            ServerMessage::Error {
                reason: RelayErrorReason::Unauthorized,
                ..
            }
        ));
    }

    #[test]
    fn handle_api_ignores_non_api_messages() {
        let mut state = RelayState::new(4, 16, None);
        assert!(state.handle_api(&ClientMessage::Goodbye).is_none());
    }

    #[test]
    fn max_peers_out_of_range_rejected() {
        let mut state = RelayState::new(4, 16, None);
        let token = signed_in(&mut state);
        let err = state.create_allocation(&token, 0).unwrap_err();
        assert_eq!(err.0, RelayErrorReason::InvalidRequest);
        let err = state.create_allocation(&token, 17).unwrap_err();
        assert_eq!(err.0, RelayErrorReason::InvalidRequest);
    }

    #[test]
    fn allocation_quota_enforced() {
        let mut state = RelayState::new(1, 16, None);
        let token = signed_in(&mut state);
        allocate(&mut state, &token, 9);
        let err = state.create_allocation(&token, 9).unwrap_err();
        assert_eq!(err.0, RelayErrorReason::QuotaExceeded);
    }

    #[test]
    fn join_code_of_checks_owner() {
        let mut state = RelayState::new(4, 16, None);
        let owner = signed_in(&mut state);
        let other = signed_in(&mut state);
        let (id, _) = allocate(&mut state, &owner, 9);
        let err = state.join_code_of(&other, id).unwrap_err();
        assert_eq!(err.0, RelayErrorReason::Unauthorized);
        let err = state.join_code_of(&owner, AllocationId(999)).unwrap_err();
        assert_eq!(err.0, RelayErrorReason::AllocationNotFound);
    }

    #[test]
    fn join_is_case_insensitive() {
        let mut state = RelayState::new(4, 16, None);
        let host = signed_in(&mut state);
        let guest = signed_in(&mut state);
        let (id, _) = allocate(&mut state, &host, 9);
        let code = code_of(&mut state, &host, id);

        let lower = code.as_str().to_ascii_lowercase();
        match state.join_allocation(&guest, &lower).unwrap() {
            ServerMessage::AllocationJoined { allocation_id, .. } => assert_eq!(allocation_id, id),
            other => panic!("expected AllocationJoined, got {other:?}"),
        }
    }

    #[test]
    fn join_distinguishes_malformed_from_unknown() {
        let mut state = RelayState::new(4, 16, None);
        let token = signed_in(&mut state);

        let err = state.join_allocation(&token, "").unwrap_err();
        assert_eq!(err.0, RelayErrorReason::InvalidRequest);
        let err = state.join_allocation(&token, "no!").unwrap_err();
        assert_eq!(err.0, RelayErrorReason::InvalidRequest);
        let err = state.join_allocation(&token, "ZZZZZZ").unwrap_err();
        assert_eq!(err.0, RelayErrorReason::JoinCodeNotFound);
    }

    #[test]
    fn allocation_full_counts_pending_joins() {
        let mut state = RelayState::new(4, 16, None);
        let host = signed_in(&mut state);
        let guest = signed_in(&mut state);
        let (id, _) = allocate(&mut state, &host, 1);
        let code = code_of(&mut state, &host, id);

        join(&mut state, &guest, code.as_str());
        let err = state.join_allocation(&guest, code.as_str()).unwrap_err();
        assert_eq!(err.0, RelayErrorReason::AllocationFull);
    }

    fn later(d: Duration) -> Instant {
        Instant::now() + d
    }

    #[test]
    fn unbound_allocation_expires_and_frees_quota() {
        let mut state = RelayState::new(1, 16, None);
        let host = signed_in(&mut state);
        let (id, host_key) = allocate(&mut state, &host, 9);
        let code = code_of(&mut state, &host, id);
        let err = state.create_allocation(&host, 9).unwrap_err();
        assert_eq!(err.0, RelayErrorReason::QuotaExceeded);

        // Still inside the window: nothing released.
        state.sweep(Instant::now());
        assert_eq!(state.allocation_count(), 1);

        state.sweep(later(DEFAULT_RESERVATION_TIMEOUT));
        assert_eq!(state.allocation_count(), 0);
        let err = state.join_allocation(&host, code.as_str()).unwrap_err();
        assert_eq!(err.0, RelayErrorReason::JoinCodeNotFound);
        let (_h, host_server) = tcp_pair();
        let err = state.bind_host(id, &host_key, host_server).unwrap_err();
        assert_eq!(err.0, RelayErrorReason::AllocationNotFound);

        allocate(&mut state, &host, 9);
    }

    #[test]
    fn bound_allocation_survives_sweep() {
        let mut state = RelayState::new(4, 16, None);
        let host = signed_in(&mut state);
        let (id, host_key) = allocate(&mut state, &host, 9);
        let (_h, host_server) = tcp_pair();
        state.bind_host(id, &host_key, host_server).unwrap();

        state.sweep(later(DEFAULT_RESERVATION_TIMEOUT * 10));
        assert_eq!(state.allocation_count(), 1);
        assert_eq!(state.bound_count(id), 1);
    }

    #[test]
    fn unredeemed_join_key_expires_and_frees_slot() {
        let mut state = RelayState::new(4, 16, None);
        let host = signed_in(&mut state);
        let guest = signed_in(&mut state);
        let (id, host_key) = allocate(&mut state, &host, 1);
        let code = code_of(&mut state, &host, id);
        let (_h, host_server) = tcp_pair();
        state.bind_host(id, &host_key, host_server).unwrap();

        let stale = join(&mut state, &guest, code.as_str());
        let err = state.join_allocation(&guest, code.as_str()).unwrap_err();
        assert_eq!(err.0, RelayErrorReason::AllocationFull);

        state.sweep(later(DEFAULT_RESERVATION_TIMEOUT));
        let fresh = join(&mut state, &guest, code.as_str());

        let (_c1, c1_server) = tcp_pair();
        let err = state.bind_client(id, &stale, c1_server).unwrap_err();
        assert_eq!(err.0, RelayErrorReason::Unauthorized);
        let (_c2, c2_server) = tcp_pair();
        assert_eq!(state.bind_client(id, &fresh, c2_server).unwrap(), PeerId(1));
    }

    #[test]
    fn idle_tokens_are_forgotten_unless_they_own_an_allocation() {
        let mut state = RelayState::new(4, 16, None).with_timeouts(
            Duration::from_secs(3600),
            Duration::from_secs(60),
        );
        let host = signed_in(&mut state);
        let idle = signed_in(&mut state);
        let (id, host_key) = allocate(&mut state, &host, 9);
        let (_h, host_server) = tcp_pair();
        state.bind_host(id, &host_key, host_server).unwrap();
        assert_eq!(state.token_count(), 2);

        state.sweep(later(Duration::from_secs(61)));
        assert_eq!(state.token_count(), 1);
        let err = state.join_code_of(&idle, id).unwrap_err();
        assert_eq!(err.0, RelayErrorReason::Unauthorized);
        assert!(state.join_code_of(&host, id).is_ok());
    }

    #[test]
    fn bind_client_notifies_host() {
        let mut state = RelayState::new(4, 16, None);
        let host = signed_in(&mut state);
        let guest = signed_in(&mut state);
        let (id, host_key) = allocate(&mut state, &host, 9);
        let code = code_of(&mut state, &host, id);
        let client_key = join(&mut state, &guest, code.as_str());

        let (host_side, host_server) = tcp_pair();
        let (client_side, client_server) = tcp_pair();

        // A client cannot bind before the host.
        let (_early, early_server) = tcp_pair();
        let err = state.bind_client(id, &client_key, early_server).unwrap_err();
        assert_eq!(err.0, RelayErrorReason::AllocationNotFound);

        assert_eq!(state.bind_host(id, &host_key, host_server).unwrap(), PeerId::HOST);
        let peer = state.bind_client(id, &client_key, client_server).unwrap();
        assert_eq!(peer, PeerId(1));
        assert_eq!(state.bound_count(id), 2);

        let mut host_reader = BufReader::new(host_side);
        assert_eq!(
            recv(&mut host_reader),
            ServerMessage::Bound {
                peer_id: PeerId::HOST
            }
        );
        assert_eq!(
            recv(&mut host_reader),
            ServerMessage::PeerConnected { peer_id: PeerId(1) }
        );

        let mut client_reader = BufReader::new(client_side);
        assert_eq!(
            recv(&mut client_reader),
            ServerMessage::Bound { peer_id: PeerId(1) }
        );
    }

    #[test]
    fn client_keys_are_single_use() {
        let mut state = RelayState::new(4, 16, None);
        let host = signed_in(&mut state);
        let guest = signed_in(&mut state);
        let (id, host_key) = allocate(&mut state, &host, 9);
        let code = code_of(&mut state, &host, id);
        let key = join(&mut state, &guest, code.as_str());

        let (_h, host_server) = tcp_pair();
        let (_c1, c1_server) = tcp_pair();
        let (_c2, c2_server) = tcp_pair();
        state.bind_host(id, &host_key, host_server).unwrap();
        state.bind_client(id, &key, c1_server).unwrap();
        let err = state.bind_client(id, &key, c2_server).unwrap_err();
        assert_eq!(err.0, RelayErrorReason::Unauthorized);
    }

    #[test]
    fn forwarding_is_hub_and_spoke() {
        let mut state = RelayState::new(4, 16, None);
        let host = signed_in(&mut state);
        let guest = signed_in(&mut state);
        let (id, host_key) = allocate(&mut state, &host, 9);
        let code = code_of(&mut state, &host, id);
        let k1 = join(&mut state, &guest, code.as_str());
        let k2 = join(&mut state, &guest, code.as_str());

        let (host_side, host_server) = tcp_pair();
        let (c1_side, c1_server) = tcp_pair();
        let (c2_side, c2_server) = tcp_pair();
        state.bind_host(id, &host_key, host_server).unwrap();
        let p1 = state.bind_client(id, &k1, c1_server).unwrap();
        let p2 = state.bind_client(id, &k2, c2_server).unwrap();

        let mut host_reader = BufReader::new(host_side);
        let mut c1_reader = BufReader::new(c1_side);
        let mut c2_reader = BufReader::new(c2_side);
        // Drain bind traffic.
        let _ = recv(&mut host_reader);
        let _ = recv(&mut host_reader);
        let _ = recv(&mut host_reader);
        let _ = recv(&mut c1_reader);
        let _ = recv(&mut c2_reader);

        // Client 1 tries to broadcast: dropped. Then addresses the host.
        state.forward(id, p1, Target::Broadcast, vec![9]);
        state.forward(id, p1, Target::Host, vec![1, 2]);
        assert_eq!(
            recv(&mut host_reader),
            ServerMessage::Packet {
                from: p1,
                payload: vec![1, 2]
            }
        );

        // Host targets client 2 only, then broadcasts.
        state.forward(id, PeerId::HOST, Target::Peer(p2), vec![3]);
        state.forward(id, PeerId::HOST, Target::Broadcast, vec![4]);
        assert_eq!(
            recv(&mut c2_reader),
            ServerMessage::Packet {
                from: PeerId::HOST,
                payload: vec![3]
            }
        );
        assert_eq!(
            recv(&mut c2_reader),
            ServerMessage::Packet {
                from: PeerId::HOST,
                payload: vec![4]
            }
        );
        // Client 1 never saw its own dropped broadcast nor the targeted packet.
        assert_eq!(
            recv(&mut c1_reader),
            ServerMessage::Packet {
                from: PeerId::HOST,
                payload: vec![4]
            }
        );
    }

    #[test]
    fn host_leaving_closes_allocation() {
        let mut state = RelayState::new(4, 16, None);
        let host = signed_in(&mut state);
        let guest = signed_in(&mut state);
        let (id, host_key) = allocate(&mut state, &host, 9);
        let code = code_of(&mut state, &host, id);
        let key = join(&mut state, &guest, code.as_str());

        let (_host_side, host_server) = tcp_pair();
        let (client_side, client_server) = tcp_pair();
        state.bind_host(id, &host_key, host_server).unwrap();
        state.bind_client(id, &key, client_server).unwrap();

        state.disconnect(id, PeerId::HOST);
        assert_eq!(state.allocation_count(), 0);

        let mut client_reader = BufReader::new(client_side);
        let _bound = recv(&mut client_reader);
        assert_eq!(recv(&mut client_reader), ServerMessage::HostDisconnected);

        // The code is released with the allocation.
        let err = state.join_allocation(&guest, code.as_str()).unwrap_err();
        assert_eq!(err.0, RelayErrorReason::JoinCodeNotFound);
    }

    #[test]
    fn client_leaving_notifies_host() {
        let mut state = RelayState::new(4, 16, None);
        let host = signed_in(&mut state);
        let guest = signed_in(&mut state);
        let (id, host_key) = allocate(&mut state, &host, 9);
        let code = code_of(&mut state, &host, id);
        let key = join(&mut state, &guest, code.as_str());

        let (host_side, host_server) = tcp_pair();
        let (_client_side, client_server) = tcp_pair();
        state.bind_host(id, &host_key, host_server).unwrap();
        let peer = state.bind_client(id, &key, client_server).unwrap();

        state.disconnect(id, peer);
        assert_eq!(state.bound_count(id), 1);

        let mut host_reader = BufReader::new(host_side);
        let _bound = recv(&mut host_reader);
        let _connected = recv(&mut host_reader);
        assert_eq!(
            recv(&mut host_reader),
            ServerMessage::PeerDisconnected { peer_id: peer }
        );
    }
}
