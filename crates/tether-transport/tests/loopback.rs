//! End-to-end scenarios over real loopback sockets: handshake, reliable
//! delivery, fragmentation, interception, checksums, rejection and timeouts.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tether_transport::{
    Address, Error, Event, Host, HostConfig, NotifyCode, Packet, PacketFlags, PeerHandle, PeerState,
};

const STEP: Duration = Duration::from_millis(1);
const DEADLINE: Duration = Duration::from_secs(10);

fn local_host(peer_limit: usize) -> Host {
    Host::new(HostConfig {
        address: Address::new("127.0.0.1", 0).unwrap(),
        peer_limit,
        channel_limit: 2,
        ..HostConfig::default()
    })
    .unwrap()
}

/// Drive both hosts until the client and server each observe the handshake
/// completing. Returns (client-side handle, server-side handle).
fn establish(server: &mut Host, client: &mut Host, data: u32) -> (PeerHandle, PeerHandle) {
    let target = server.socket_address();
    let client_peer = client.connect(target, 2, data).unwrap();
    let deadline = Instant::now() + DEADLINE;
    let mut server_peer = None;
    let mut client_connected = false;
    while Instant::now() < deadline && (server_peer.is_none() || !client_connected) {
        if let Some(Event::Connect { .. }) = client.service(STEP).unwrap() {
            client_connected = true;
        }
        if let Some(Event::Connect { peer, data: got }) = server.service(STEP).unwrap() {
            assert_eq!(got, data, "server sees the connect data");
            server_peer = Some(peer);
        }
    }
    let server_peer = server_peer.expect("handshake did not complete");
    assert!(client_connected, "client never reached Connected");
    assert_eq!(
        client.peer_state(client_peer).unwrap(),
        PeerState::Connected
    );
    assert_eq!(
        server.peer_state(server_peer).unwrap(),
        PeerState::Connected
    );
    (client_peer, server_peer)
}

#[test]
fn handshake_reaches_connected_on_both_sides() {
    let mut server = local_host(8);
    let mut client = local_host(8);
    let (client_peer, server_peer) = establish(&mut server, &mut client, 42);
    assert!(client.peer_round_trip_time(client_peer).is_ok());
    assert_eq!(server.peer_address(server_peer).unwrap().get_ip(), "127.0.0.1");
}

#[test]
fn ten_thousand_reliable_messages_arrive_exactly_once_in_order() {
    let mut server = local_host(8);
    let mut client = local_host(8);
    let (client_peer, _) = establish(&mut server, &mut client, 0);

    const COUNT: usize = 10_000;
    let packet = Packet::new(b"Hello".to_vec(), PacketFlags::RELIABLE).unwrap();
    for _ in 0..COUNT {
        client.send(client_peer, 0, &packet).unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(30);
    let mut received = 0usize;
    while received < COUNT && Instant::now() < deadline {
        client.service(STEP).unwrap();
        while let Some(event) = server.service(Duration::ZERO).unwrap() {
            if let Event::Receive {
                channel_id, packet, ..
            } = event
            {
                assert_eq!(channel_id, 0);
                assert_eq!(packet.data().unwrap(), b"Hello");
                received += 1;
            }
        }
    }
    assert_eq!(received, COUNT, "every reliable message exactly once");

    // Drain any straggling acks; no duplicates may surface afterwards.
    for _ in 0..50 {
        client.service(Duration::ZERO).unwrap();
        if let Some(Event::Receive { .. }) = server.service(Duration::ZERO).unwrap() {
            panic!("duplicate delivery after the stream completed");
        }
    }
}

#[test]
fn oversized_reliable_payload_fragments_and_reassembles() {
    let mut server = local_host(8);
    let mut client = local_host(8);
    let (client_peer, _) = establish(&mut server, &mut client, 0);

    let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
    let packet = Packet::new(payload.clone(), PacketFlags::RELIABLE).unwrap();
    client.send(client_peer, 1, &packet).unwrap();

    let deadline = Instant::now() + DEADLINE;
    while Instant::now() < deadline {
        client.service(STEP).unwrap();
        if let Some(Event::Receive {
            channel_id, packet, ..
        }) = server.service(STEP).unwrap()
        {
            assert_eq!(channel_id, 1);
            assert_eq!(packet.data().unwrap(), &payload[..]);
            return;
        }
    }
    panic!("fragmented message never reassembled");
}

#[test]
fn unsequenced_and_unreliable_messages_deliver() {
    let mut server = local_host(8);
    let mut client = local_host(8);
    let (client_peer, _) = establish(&mut server, &mut client, 0);

    let unseq = Packet::new(b"unsequenced".to_vec(), PacketFlags::UNSEQUENCED).unwrap();
    let loose = Packet::new(b"unreliable".to_vec(), PacketFlags::NONE).unwrap();
    client.send(client_peer, 0, &unseq).unwrap();
    client.send(client_peer, 0, &loose).unwrap();
    client.flush();

    let deadline = Instant::now() + DEADLINE;
    let mut seen = Vec::new();
    while seen.len() < 2 && Instant::now() < deadline {
        client.service(STEP).unwrap();
        if let Some(Event::Receive { packet, .. }) = server.service(STEP).unwrap() {
            seen.push((
                packet.data().unwrap().to_vec(),
                packet.flags().unwrap(),
            ));
        }
    }
    assert_eq!(seen.len(), 2);
    assert!(seen
        .iter()
        .any(|(d, f)| d == b"unsequenced" && f.contains(PacketFlags::UNSEQUENCED)));
    assert!(seen.iter().any(|(d, _)| d == b"unreliable"));
}

#[test]
fn intercept_hook_consumes_raw_datagrams() {
    let mut server = local_host(8);
    let captured: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&captured);
    server.set_intercept(Some(Box::new(move |_sender, bytes| {
        sink.lock().unwrap().push(bytes.to_vec());
        true
    })));

    let raw = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let dest: std::net::SocketAddr = server.socket_address().into();
    raw.send_to(b"Hello World", dest).unwrap();

    let deadline = Instant::now() + DEADLINE;
    while captured.lock().unwrap().is_empty() && Instant::now() < deadline {
        let event = server.service(STEP).unwrap();
        assert!(event.is_none(), "intercepted datagram must not become an event");
    }
    let captured = captured.lock().unwrap();
    assert_eq!(captured.len(), 1);
    assert_eq!(captured[0], b"Hello World");
}

#[test]
fn send_raw_shares_the_protocol_socket() {
    let mut observer = local_host(8);
    let captured: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&captured);
    observer.set_intercept(Some(Box::new(move |_sender, bytes| {
        sink.lock().unwrap().push(bytes.to_vec());
        true
    })));

    let sender = local_host(8);
    let data = b"++Hello World++";
    let observer_addr = observer.socket_address();
    // Slice off the framing the caller wants excluded.
    sender
        .send_raw(&observer_addr, &data[2..data.len() - 2])
        .unwrap();

    let deadline = Instant::now() + DEADLINE;
    while captured.lock().unwrap().is_empty() && Instant::now() < deadline {
        observer.service(STEP).unwrap();
    }
    assert_eq!(captured.lock().unwrap()[0], b"Hello World");
}

#[test]
fn full_server_notifies_connections_exceeded() {
    let mut server = local_host(0);
    let mut client = local_host(8);
    let handle = client.connect(server.socket_address(), 1, 0).unwrap();

    let deadline = Instant::now() + DEADLINE;
    let mut notified = false;
    while !notified && Instant::now() < deadline {
        server.service(STEP).unwrap();
        if let Some(Event::Notify { peer, code }) = client.service(STEP).unwrap() {
            assert_eq!(peer, handle);
            assert_eq!(code, NotifyCode::ConnectionsExceeded);
            notified = true;
        }
    }
    assert!(notified, "client never saw the rejection");
    assert_eq!(server.peer_count(), 0, "no slot allocated for the reject");
    assert_eq!(client.peer_count(), 0, "rejected slot reclaimed on dispatch");
}

#[test]
fn prevent_connections_rejects_like_a_full_table() {
    let mut server = local_host(8);
    server.prevent_connections(true);
    let mut client = local_host(8);
    client.connect(server.socket_address(), 1, 0).unwrap();

    let deadline = Instant::now() + DEADLINE;
    loop {
        assert!(Instant::now() < deadline, "client never saw the rejection");
        server.service(STEP).unwrap();
        if let Some(Event::Notify { code, .. }) = client.service(STEP).unwrap() {
            assert_eq!(code, NotifyCode::ConnectionsExceeded);
            break;
        }
    }
}

#[test]
fn unresponsive_peer_times_out_exactly_once() {
    // A bare socket that never answers stands in for a dead remote.
    let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let target = Address::from(silent.local_addr().unwrap());

    let mut client = local_host(8);
    let handle = client.connect(target, 1, 0).unwrap();
    client
        .set_timeout(
            handle,
            2,
            Duration::from_millis(200),
            Duration::from_millis(500),
        )
        .unwrap();

    let deadline = Instant::now() + DEADLINE;
    let mut timeouts = 0;
    while Instant::now() < deadline && timeouts == 0 {
        if let Some(Event::Timeout { peer }) = client.service(STEP).unwrap() {
            assert_eq!(peer, handle);
            timeouts += 1;
        }
    }
    assert_eq!(timeouts, 1);
    assert_eq!(client.peer_count(), 0, "slot reclaimed after the timeout");

    // The host stays usable: no further events, no errors.
    for _ in 0..20 {
        assert!(client.service(Duration::ZERO).unwrap().is_none());
    }
}

#[test]
fn graceful_disconnect_surfaces_on_both_sides() {
    let mut server = local_host(8);
    let mut client = local_host(8);
    let (client_peer, server_peer) = establish(&mut server, &mut client, 0);

    client.disconnect(client_peer, 7).unwrap();

    let deadline = Instant::now() + DEADLINE;
    let mut client_done = false;
    let mut server_done = false;
    while Instant::now() < deadline && !(client_done && server_done) {
        if let Some(Event::Disconnect { peer, data }) = client.service(STEP).unwrap() {
            assert_eq!(peer, client_peer);
            assert_eq!(data, 7);
            client_done = true;
        }
        if let Some(Event::Disconnect { peer, data }) = server.service(STEP).unwrap() {
            assert_eq!(peer, server_peer);
            assert_eq!(data, 7);
            server_done = true;
        }
    }
    assert!(client_done && server_done);
    assert_eq!(client.peer_count(), 0);
    assert_eq!(server.peer_count(), 0);
}

#[test]
fn graceful_disconnect_delivers_queued_reliable_data() {
    let mut server = local_host(8);
    let mut client = local_host(8);
    let (client_peer, server_peer) = establish(&mut server, &mut client, 0);

    // The teardown must not outrun data queued just before it.
    let packet = Packet::new(b"tail-data".to_vec(), PacketFlags::RELIABLE).unwrap();
    client.send(client_peer, 0, &packet).unwrap();
    client.disconnect(client_peer, 3).unwrap();

    let deadline = Instant::now() + DEADLINE;
    let mut got_data = false;
    let mut got_disconnect = false;
    while Instant::now() < deadline && !(got_data && got_disconnect) {
        client.service(STEP).unwrap();
        match server.service(STEP).unwrap() {
            Some(Event::Receive { packet, .. }) => {
                assert_eq!(packet.data().unwrap(), b"tail-data");
                assert!(!got_disconnect, "data must precede the disconnect");
                got_data = true;
            }
            Some(Event::Disconnect { peer, data }) => {
                assert_eq!(peer, server_peer);
                assert_eq!(data, 3);
                got_disconnect = true;
            }
            _ => {}
        }
    }
    assert!(got_data, "reliable data queued before disconnect() was lost");
    assert!(got_disconnect, "server never saw the disconnect");
}

#[test]
fn oversized_unsequenced_fragments_with_the_opt_in() {
    let mut server = local_host(8);
    let mut client = local_host(8);
    let (client_peer, _) = establish(&mut server, &mut client, 0);

    let payload: Vec<u8> = (0..5_000u32).map(|i| (i % 249) as u8).collect();

    // Without the fragmentation opt-in an oversized unsequenced send fails.
    let plain = Packet::new(payload.clone(), PacketFlags::UNSEQUENCED).unwrap();
    assert!(matches!(
        client.send(client_peer, 0, &plain),
        Err(Error::InvalidArgument(_))
    ));

    let fragmented = Packet::new(
        payload.clone(),
        PacketFlags::UNSEQUENCED | PacketFlags::UNRELIABLE_FRAGMENTED,
    )
    .unwrap();
    client.send(client_peer, 0, &fragmented).unwrap();
    client.flush();

    let deadline = Instant::now() + DEADLINE;
    while Instant::now() < deadline {
        client.service(STEP).unwrap();
        if let Some(Event::Receive { packet, .. }) = server.service(STEP).unwrap() {
            assert_eq!(packet.data().unwrap(), &payload[..]);
            return;
        }
    }
    panic!("fragmented unsequenced message never reassembled");
}

#[test]
fn bandwidth_capped_host_keeps_acknowledging() {
    // A 1 byte/sec budget throttles the server's own traffic almost entirely;
    // acknowledgments must still flow or the client would stall on retries.
    let mut server = Host::new(HostConfig {
        address: Address::new("127.0.0.1", 0).unwrap(),
        peer_limit: 8,
        channel_limit: 2,
        outgoing_bandwidth: 1,
        ..HostConfig::default()
    })
    .unwrap();
    let mut client = local_host(8);
    let (client_peer, _) = establish(&mut server, &mut client, 0);

    let packet = Packet::new(b"metered".to_vec(), PacketFlags::RELIABLE).unwrap();
    for _ in 0..3 {
        client.send(client_peer, 0, &packet).unwrap();
    }

    let deadline = Instant::now() + DEADLINE;
    let mut received = 0;
    while received < 3 && Instant::now() < deadline {
        client.service(STEP).unwrap();
        while let Some(event) = server.service(Duration::ZERO).unwrap() {
            if let Event::Receive { packet, .. } = event {
                assert_eq!(packet.data().unwrap(), b"metered");
                received += 1;
            }
        }
    }
    assert_eq!(received, 3, "capped host stopped acknowledging");
    let (_, outgoing) = server.bandwidth_limits();
    assert_eq!(outgoing, 1);
}

#[test]
fn checksummed_traffic_interoperates_and_rejects_garbage() {
    fn fnv(bytes: &[u8]) -> u64 {
        bytes.iter().fold(0xcbf2_9ce4_8422_2325u64, |hash, b| {
            (hash ^ u64::from(*b)).wrapping_mul(0x0000_0100_0000_01b3)
        })
    }

    let mut server = local_host(8);
    let mut client = local_host(8);
    server.set_checksum(Some(Box::new(fnv)));
    client.set_checksum(Some(Box::new(fnv)));

    let (client_peer, _) = establish(&mut server, &mut client, 0);

    // Garbage without a valid digest is dropped before parsing.
    let raw = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let dest: std::net::SocketAddr = server.socket_address().into();
    raw.send_to(&[0xA5; 40], dest).unwrap();

    let packet = Packet::new(b"checked".to_vec(), PacketFlags::RELIABLE).unwrap();
    client.send(client_peer, 0, &packet).unwrap();

    let deadline = Instant::now() + DEADLINE;
    while Instant::now() < deadline {
        client.service(STEP).unwrap();
        if let Some(Event::Receive { packet, .. }) = server.service(STEP).unwrap() {
            assert_eq!(packet.data().unwrap(), b"checked");
            return;
        }
    }
    panic!("checksummed message never arrived");
}

#[test]
fn broadcast_reaches_all_but_excluded_peers() {
    let mut server = local_host(8);
    let mut client_a = local_host(8);
    let mut client_b = local_host(8);
    let (_, server_peer_a) = establish(&mut server, &mut client_a, 0);
    let (_, _server_peer_b) = establish(&mut server, &mut client_b, 0);

    let packet = Packet::new(b"to everyone else".to_vec(), PacketFlags::RELIABLE).unwrap();
    server.broadcast_excluding(0, &packet, server_peer_a);
    server.flush();

    let deadline = Instant::now() + DEADLINE;
    let mut b_got = false;
    while Instant::now() < deadline && !b_got {
        server.service(STEP).unwrap();
        if let Some(Event::Receive { packet, .. }) = client_b.service(STEP).unwrap() {
            assert_eq!(packet.data().unwrap(), b"to everyone else");
            b_got = true;
        }
        if let Some(Event::Receive { .. }) = client_a.service(STEP).unwrap() {
            panic!("excluded peer received the broadcast");
        }
    }
    assert!(b_got);
}
