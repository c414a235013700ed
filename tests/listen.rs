mod common;

use common::abstract_name;
use nix::errno::Errno;
use pipesock::{ConnectState, SocketType, UnixSocket};

#[test]
fn listen_requires_a_bound_socket() {
    let socket = UnixSocket::new(SocketType::Stream);
    assert_eq!(socket.listen(5).unwrap_err(), Errno::EDESTADDRREQ);
}

#[test]
fn datagram_sockets_cannot_listen() {
    let socket = UnixSocket::new(SocketType::Dgram);
    socket.bind(&abstract_name("dgram-listen")).unwrap();
    assert_eq!(socket.listen(5).unwrap_err(), Errno::EOPNOTSUPP);
}

#[test]
fn listen_transitions_to_listener() {
    let socket = UnixSocket::new(SocketType::Stream);
    socket.bind(&abstract_name("listener")).unwrap();
    socket.listen(5).unwrap();
    assert_eq!(socket.connect_state(), ConnectState::Listener);
    assert!(socket.canonical_handle().is_some());
}

#[test]
fn second_listen_is_address_in_use() {
    let socket = UnixSocket::new(SocketType::Stream);
    socket.bind(&abstract_name("double-listen")).unwrap();
    socket.listen(5).unwrap();
    assert_eq!(socket.listen(5).unwrap_err(), Errno::EADDRINUSE);
}

#[test]
fn listen_on_connected_socket_is_invalid() {
    let listener = UnixSocket::new(SocketType::Stream);
    let addr = abstract_name("listen-connected");
    listener.bind(&addr).unwrap();
    listener.listen(1).unwrap();

    let client = UnixSocket::new(SocketType::Stream);
    client.bind(&abstract_name("listen-connected-client")).unwrap();
    client.connect(&addr).unwrap();
    assert_eq!(client.listen(1).unwrap_err(), Errno::EINVAL);
}

#[test]
fn connect_to_own_listener_state_is_rejected() {
    let listener = UnixSocket::new(SocketType::Stream);
    let addr = abstract_name("self-connect");
    listener.bind(&addr).unwrap();
    listener.listen(1).unwrap();
    assert_eq!(listener.connect(&addr).unwrap_err(), Errno::EADDRINUSE);
}
