//! Listener and accept path against a scripted stack.

mod common;

use common::{mock_netstack, Recorded};
use netconn::{ConnState, ConnType, Delivery, NetconnConfig, NetconnError, Pbuf};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn peer(port: u16) -> Option<SocketAddr> {
    Some(SocketAddr::from(([192, 168, 1, 10], port)))
}

#[test]
fn test_accept_in_report_order_with_buffered_data() {
    let (netstack, bridge, mock) = mock_netstack(NetconnConfig::default());
    let listener = netstack.create(ConnType::Stream).unwrap();
    listener.bind(8080).unwrap();
    listener.listen().unwrap();
    assert_eq!(listener.state(), ConnState::Connecting);
    assert!(mock.requests().iter().any(|r| matches!(
        r,
        Recorded::Listen { port: 8080, .. }
    )));

    let a = bridge.on_accept(8080, peer(5001)).unwrap();
    let b = bridge.on_accept(8080, peer(5002)).unwrap();
    let c = bridge.on_accept(8080, peer(5003)).unwrap();
    assert_eq!(bridge.on_data(b, Pbuf::new(&b"early"[..])), Delivery::Queued);
    assert_eq!(listener.pending_accepts(), 3);

    let first = listener.accept().unwrap();
    let second = listener.accept().unwrap();
    let third = listener.accept().unwrap();
    assert_eq!(
        [first.conn_id(), second.conn_id(), third.conn_id()],
        [a, b, c]
    );
    assert_eq!(first.state(), ConnState::Connected);
    assert_eq!(second.peer_addr(), peer(5002));
    assert_eq!(second.local_port(), Some(8080));

    let early = second.receive().unwrap().unwrap();
    assert_eq!(&early.to_bytes()[..], b"early");
    early.release().unwrap();

    // Accepted clients are full handles.
    second.write(b"reply").unwrap();
    second.flush().unwrap();
    assert_eq!(mock.sent_bytes(b), b"reply");
    assert_eq!(netstack.metrics().accepted, 3);
}

#[test]
fn test_second_bind_fails_first_still_usable() {
    let (netstack, bridge, _mock) = mock_netstack(NetconnConfig::default());
    let first = netstack.create(ConnType::Stream).unwrap();
    let second = netstack.create(ConnType::Stream).unwrap();

    first.bind(9000).unwrap();
    let err = second.bind(9000).unwrap_err();
    assert!(matches!(err, NetconnError::PortInUse { port: 9000 }));
    assert_eq!(second.state(), ConnState::Idle);

    first.listen().unwrap();
    let id = bridge.on_accept(9000, None).unwrap();
    assert_eq!(first.accept().unwrap().conn_id(), id);
}

#[test]
fn test_listener_close_drops_unaccepted_clients() {
    let (netstack, bridge, mock) = mock_netstack(NetconnConfig::default());
    let listener = netstack.create(ConnType::Stream).unwrap();
    listener.bind(7000).unwrap();
    listener.listen().unwrap();

    let client = bridge.on_accept(7000, peer(1)).unwrap();
    let pbuf = Pbuf::new(&b"unread"[..]);
    let observer = pbuf.reference().unwrap();
    bridge.on_data(client, pbuf);

    listener.close().unwrap();
    assert_eq!(listener.state(), ConnState::Closed);
    assert_eq!(observer.ref_count(), 1);

    let requests = mock.requests();
    assert!(requests.contains(&Recorded::Unlisten {
        id: listener.conn_id(),
        port: 7000
    }));
    assert!(requests.contains(&Recorded::Abort { id: client }));
    assert_eq!(netstack.connection_count(), 1);

    // No more clients, and the port is free again.
    assert_eq!(bridge.on_accept(7000, peer(2)), None);
    assert!(listener.accept().unwrap_err().is_closed());
    let rebound = netstack.create(ConnType::Stream).unwrap();
    rebound.bind(7000).unwrap();

    // Idempotent.
    listener.close().unwrap();
}

#[test]
fn test_close_unblocks_parked_accept() {
    let (netstack, _bridge, _mock) = mock_netstack(NetconnConfig::default());
    let listener = Arc::new(netstack.create(ConnType::Stream).unwrap());
    listener.bind(7100).unwrap();
    listener.listen().unwrap();

    let acceptor = {
        let listener = listener.clone();
        thread::spawn(move || listener.accept_for(None))
    };
    thread::sleep(Duration::from_millis(50));
    listener.close().unwrap();

    let err = acceptor.join().unwrap().unwrap_err();
    assert!(err.is_closed());
}

#[test]
fn test_accept_timeout() {
    let (netstack, _bridge, _mock) = mock_netstack(NetconnConfig::default());
    let listener = netstack.create(ConnType::Stream).unwrap();
    listener.bind(7200).unwrap();
    listener.listen().unwrap();

    let err = listener
        .accept_for(Some(Duration::from_millis(100)))
        .unwrap_err();
    assert!(matches!(err, NetconnError::Timeout { timeout_ms: 100 }));
}

#[test]
fn test_max_conns_refuses_extra_clients() {
    let (netstack, bridge, _mock) = mock_netstack(NetconnConfig::default());
    let listener = netstack.create(ConnType::Stream).unwrap();
    listener.bind(7300).unwrap();
    listener.listen_with_max_conn(2).unwrap();

    let first = bridge.on_accept(7300, peer(1)).unwrap();
    bridge.on_accept(7300, peer(2)).unwrap();
    assert_eq!(bridge.on_accept(7300, peer(3)), None);
    assert_eq!(netstack.metrics().refused, 1);

    // Deleting a client frees its slot.
    let accepted = listener.accept().unwrap();
    assert_eq!(accepted.conn_id(), first);
    accepted.delete();
    assert!(bridge.on_accept(7300, peer(4)).is_some());
}

#[test]
fn test_accept_queue_full_refuses() {
    let config = NetconnConfig::new().accept_queue_len(2);
    let (netstack, bridge, _mock) = mock_netstack(config);
    let listener = netstack.create(ConnType::Stream).unwrap();
    listener.bind(7400).unwrap();
    listener.listen().unwrap();

    assert!(bridge.on_accept(7400, peer(1)).is_some());
    assert!(bridge.on_accept(7400, peer(2)).is_some());
    assert_eq!(bridge.on_accept(7400, peer(3)), None);
    // The refused client never lingers in the table.
    assert_eq!(netstack.connection_count(), 3);
}

#[test]
fn test_closed_unaccepted_clients_evicted_when_table_full() {
    let config = NetconnConfig::new().max_connections(3);
    let (netstack, bridge, _mock) = mock_netstack(config);
    let listener = netstack.create(ConnType::Stream).unwrap();
    listener.bind(7500).unwrap();
    listener.listen().unwrap();

    let gone = bridge.on_accept(7500, peer(1)).unwrap();
    let alive = bridge.on_accept(7500, peer(2)).unwrap();
    bridge.on_remote_closed(gone);
    assert_eq!(netstack.connection_count(), 3);

    // Table is full; the closed, unaccepted client makes room.
    let late = bridge.on_accept(7500, peer(3)).unwrap();
    assert_eq!(netstack.connection_count(), 3);

    // The evicted id is skipped by accept.
    assert_eq!(listener.accept().unwrap().conn_id(), alive);
    assert_eq!(listener.accept().unwrap().conn_id(), late);
}

#[test]
fn test_accept_on_non_listener_is_misuse() {
    let (netstack, _bridge, _mock) = mock_netstack(NetconnConfig::default());
    let conn = netstack.create(ConnType::Stream).unwrap();
    assert!(conn.accept().unwrap_err().is_misuse());
    assert!(conn.listen().unwrap_err().is_misuse());

    conn.bind(7600).unwrap();
    assert!(conn.receive().unwrap_err().is_misuse());
}

#[test]
fn test_bound_handle_close_releases_port() {
    let (netstack, _bridge, _mock) = mock_netstack(NetconnConfig::default());
    let conn = netstack.create(ConnType::Stream).unwrap();
    conn.bind(7700).unwrap();
    conn.close().unwrap();
    assert_eq!(conn.state(), ConnState::Closed);

    let other = netstack.create(ConnType::Stream).unwrap();
    other.bind(7700).unwrap();
}

#[test]
fn test_listen_rejected_by_stack() {
    let (netstack, _bridge, mock) = mock_netstack(NetconnConfig::default());
    mock.fail_listens(true);
    let listener = netstack.create(ConnType::Stream).unwrap();
    listener.bind(8080).unwrap();

    let err = listener.listen().unwrap_err();
    assert!(matches!(err, NetconnError::Stack { .. }));
    assert_eq!(listener.state(), ConnState::Closed);

    // The port is free again and the failed handle stays closed.
    let other = netstack.create(ConnType::Stream).unwrap();
    other.bind(8080).unwrap();
    assert!(listener.listen().unwrap_err().is_misuse());
    assert!(listener.accept().unwrap_err().is_closed());
    listener.close().unwrap();

    mock.fail_listens(false);
    other.listen().unwrap();
}
