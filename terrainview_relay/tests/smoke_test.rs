// Integration smoke test for the relay server.
//
// Starts a relay on localhost and drives it with the crate's own client
// types: sign-in, allocation, join-code lookup, join with a lowercase code,
// host/client binding, hub-and-spoke packet forwarding, and teardown when
// the host leaves. One test also talks raw framed TCP to check that a
// connection opening with garbage gets a protocol error.
//
// Packets are opaque bytes here; no session semantics involved.

use std::io::{BufReader, BufWriter};
use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use terrainview_protocol::framing::{read_json, write_message};
use terrainview_protocol::message::{RelayErrorReason, ServerMessage, Target};
use terrainview_protocol::types::PeerId;
use terrainview_relay::client::{
    BindRole, RelayApiClient, RelayClientError, RelayConnection, RelayEvent,
};
use terrainview_relay::server::{RelayConfig, start_relay};

fn start(max_allocations: usize) -> (terrainview_relay::RelayHandle, SocketAddr) {
    let config = RelayConfig {
        port: 0,
        max_allocations,
        code_seed: Some(1),
        ..RelayConfig::default()
    };
    start_relay(config).unwrap()
}

/// Poll until `pred` matches an event or the deadline passes. Returns every
/// event seen, matching one last.
fn wait_for(
    conn: &mut RelayConnection,
    mut pred: impl FnMut(&RelayEvent) -> bool,
) -> Vec<RelayEvent> {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut seen = Vec::new();
    while Instant::now() < deadline {
        for event in conn.poll() {
            let done = pred(&event);
            seen.push(event);
            if done {
                return seen;
            }
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out; saw {seen:?}");
}

#[test]
fn host_and_client_exchange_packets() {
    let (handle, addr) = start(8);
    let api = RelayApiClient::new(addr.to_string());

    // Host side.
    let host_token = api.sign_in().unwrap();
    let alloc = api.create_allocation(&host_token, 9).unwrap();
    assert_eq!(alloc.max_peers, 9);
    let code = api.join_code(&host_token, alloc.allocation_id).unwrap();
    assert!(code.is_well_formed());
    let mut host =
        RelayConnection::bind(&addr.to_string(), BindRole::Host, alloc.allocation_id, &alloc.key)
            .unwrap();
    assert_eq!(host.peer_id(), PeerId::HOST);

    // Client side, typing the code in lowercase with stray whitespace.
    let client_token = api.sign_in().unwrap();
    let typed = format!(" {} ", code.as_str().to_ascii_lowercase());
    let joined = api.join_allocation(&client_token, &typed).unwrap();
    assert_eq!(joined.allocation_id, alloc.allocation_id);
    let mut client = RelayConnection::bind(
        &addr.to_string(),
        BindRole::Client,
        joined.allocation_id,
        &joined.key,
    )
    .unwrap();
    let client_id = client.peer_id();
    assert!(!client_id.is_host());

    wait_for(&mut host, |e| *e == RelayEvent::PeerConnected(client_id));

    // Client -> host.
    client.send(Target::Host, &[5, 1, 2, 3]).unwrap();
    wait_for(&mut host, |e| {
        *e == RelayEvent::Packet {
            from: client_id,
            payload: vec![5, 1, 2, 3],
        }
    });

    // A client broadcast is dropped; the host's broadcast goes through.
    client.send(Target::Broadcast, &[9]).unwrap();
    host.send(Target::Broadcast, &[1, 0]).unwrap();
    let seen = wait_for(&mut client, |e| matches!(e, RelayEvent::Packet { .. }));
    assert_eq!(
        seen.last(),
        Some(&RelayEvent::Packet {
            from: PeerId::HOST,
            payload: vec![1, 0],
        })
    );

    // Host leaves: the client is told and the code stops resolving.
    host.disconnect();
    wait_for(&mut client, |e| *e == RelayEvent::HostDisconnected);
    let late = api.sign_in().unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match api.join_allocation(&late, code.as_str()) {
            Err(RelayClientError::Refused {
                reason: RelayErrorReason::JoinCodeNotFound,
                ..
            }) => break,
            other if Instant::now() > deadline => panic!("code still resolves: {other:?}"),
            _ => thread::sleep(Duration::from_millis(10)),
        }
    }

    handle.stop();
}

#[test]
fn client_disconnect_reaches_host() {
    let (handle, addr) = start(8);
    let api = RelayApiClient::new(addr.to_string());
    let token = api.sign_in().unwrap();
    let alloc = api.create_allocation(&token, 2).unwrap();
    let code = api.join_code(&token, alloc.allocation_id).unwrap();
    let mut host =
        RelayConnection::bind(&addr.to_string(), BindRole::Host, alloc.allocation_id, &alloc.key)
            .unwrap();

    let joined = api.join_allocation(&token, code.as_str()).unwrap();
    let mut client = RelayConnection::bind(
        &addr.to_string(),
        BindRole::Client,
        joined.allocation_id,
        &joined.key,
    )
    .unwrap();
    let client_id = client.peer_id();
    wait_for(&mut host, |e| *e == RelayEvent::PeerConnected(client_id));

    client.disconnect();
    wait_for(&mut host, |e| *e == RelayEvent::PeerDisconnected(client_id));
    handle.stop();
}

#[test]
fn api_errors_surface_as_refusals() {
    let (handle, addr) = start(1);
    let api = RelayApiClient::new(addr.to_string());
    let token = api.sign_in().unwrap();

    let err = api.create_allocation(&token, 0).unwrap_err();
    assert!(matches!(
        err,
        RelayClientError::Refused {
            reason: RelayErrorReason::InvalidRequest,
            ..
        }
    ));

    api.create_allocation(&token, 4).unwrap();
    let err = api.create_allocation(&token, 4).unwrap_err();
    assert!(matches!(
        err,
        RelayClientError::Refused {
            reason: RelayErrorReason::QuotaExceeded,
            ..
        }
    ));

    let err = api.join_allocation(&token, "bad").unwrap_err();
    assert!(matches!(
        err,
        RelayClientError::Refused {
            reason: RelayErrorReason::InvalidRequest,
            ..
        }
    ));

    handle.stop();
}

#[test]
fn garbage_first_frame_gets_protocol_error() {
    let (handle, addr) = start(1);
    let stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let mut writer = BufWriter::new(stream);
    write_message(&mut writer, b"not json").unwrap();

    let reply: ServerMessage = read_json(&mut reader).unwrap();
    assert!(matches!(
        reply,
        ServerMessage::Error {
            reason: RelayErrorReason::Protocol,
            ..
        }
    ));
    handle.stop();
}

#[test]
fn unreachable_relay_is_a_connect_error() {
    // Bind then drop a listener to get a port nobody is listening on.
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let api = RelayApiClient::new(format!("127.0.0.1:{port}"));
    assert!(matches!(
        api.sign_in(),
        Err(RelayClientError::Connect { .. })
    ));
}

#[test]
fn abandoned_allocation_is_released() {
    let (handle, addr) = start_relay(RelayConfig {
        port: 0,
        max_allocations: 1,
        reservation_timeout_secs: 1,
        ..RelayConfig::default()
    })
    .unwrap();
    let api = RelayApiClient::new(addr.to_string());
    let token = api.sign_in().unwrap();

    // Allocated, but the host never binds.
    api.create_allocation(&token, 4).unwrap();
    assert!(matches!(
        api.create_allocation(&token, 4),
        Err(RelayClientError::Refused {
            reason: RelayErrorReason::QuotaExceeded,
            ..
        })
    ));

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match api.create_allocation(&token, 4) {
            Ok(_) => break,
            Err(e) => assert!(Instant::now() < deadline, "slot never released: {e}"),
        }
        thread::sleep(Duration::from_millis(100));
    }
    handle.stop();
}

#[test]
fn silent_relay_times_out_api_calls() {
    // Accepts connections but never answers.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let _holder = thread::spawn(move || {
        let held: Vec<_> = listener.incoming().take(1).collect();
        thread::sleep(Duration::from_secs(2));
        drop(held);
    });

    let api = RelayApiClient::new(addr.to_string()).with_timeout(Duration::from_millis(200));
    let started = Instant::now();
    assert!(matches!(api.sign_in(), Err(RelayClientError::Io(_))));
    assert!(started.elapsed() < Duration::from_secs(2));
}
