mod common;

use common::{abstract_name, sun_from_path_bytes};
use nix::errno::Errno;
use pipesock::{BindingState, SocketType, SunName, UnixSocket};

#[test]
fn getsockname_returns_bound_bytes_exactly() {
    let socket = UnixSocket::new(SocketType::Stream);
    let addr = abstract_name("exact");
    socket.bind(&addr).unwrap();
    assert_eq!(socket.binding_state(), BindingState::Bound);
    let bound = socket.getsockname();
    assert_eq!(bound, addr);
    assert_eq!(bound.len(), addr.len());
}

#[test]
fn embedded_nuls_survive_bind() {
    let socket = UnixSocket::new(SocketType::Stream);
    let mut path = vec![0u8];
    path.extend_from_slice(b"with\0nul\0bytes");
    path.extend_from_slice(&std::process::id().to_ne_bytes());
    let addr = sun_from_path_bytes(&path);
    socket.bind(&addr).unwrap();
    assert_eq!(socket.getsockname().path_bytes(), &path[..]);
}

#[test]
fn second_bind_is_invalid() {
    let socket = UnixSocket::new(SocketType::Stream);
    socket.bind(&abstract_name("first")).unwrap();
    assert_eq!(
        socket.bind(&abstract_name("second")).unwrap_err(),
        Errno::EINVAL
    );
}

#[test]
fn abstract_collision_is_address_in_use() {
    let a = UnixSocket::new(SocketType::Stream);
    let b = UnixSocket::new(SocketType::Stream);
    let addr = abstract_name("collide");
    a.bind(&addr).unwrap();
    assert_eq!(b.bind(&addr).unwrap_err(), Errno::EADDRINUSE);
    assert_eq!(b.binding_state(), BindingState::Unbound);
}

#[test]
fn abstract_name_is_released_on_close() {
    let addr = abstract_name("release");
    {
        let a = UnixSocket::new(SocketType::Stream);
        a.bind(&addr).unwrap();
    }
    let b = UnixSocket::new(SocketType::Stream);
    b.bind(&addr).unwrap();
}

#[test]
fn degenerate_lone_nul_is_invalid() {
    let socket = UnixSocket::new(SocketType::Stream);
    let addr = sun_from_path_bytes(&[0]);
    assert_eq!(socket.bind(&addr).unwrap_err(), Errno::EINVAL);
    assert_eq!(socket.binding_state(), BindingState::Unbound);
}

#[test]
fn wrong_family_is_invalid() {
    let mut bytes = (libc::AF_INET as libc::sa_family_t).to_ne_bytes().to_vec();
    bytes.extend_from_slice(b"\0nope");
    let addr = SunName::from_bytes(&bytes).unwrap();
    let socket = UnixSocket::new(SocketType::Stream);
    assert_eq!(socket.bind(&addr).unwrap_err(), Errno::EINVAL);
}

#[test]
fn unnamed_bind_autobinds_five_hex_digits() {
    let socket = UnixSocket::new(SocketType::Stream);
    socket.bind(&SunName::new_unnamed()).unwrap();
    let bound = socket.getsockname();
    assert_eq!(bound.len(), 8);
    let path = bound.path_bytes();
    assert_eq!(path[0], 0);
    assert_eq!(path.len(), 6);
    assert!(path[1..].iter().all(|b| b.is_ascii_hexdigit()));
}

#[test]
fn autobound_names_are_distinct() {
    let a = UnixSocket::new(SocketType::Stream);
    let b = UnixSocket::new(SocketType::Stream);
    a.bind(&SunName::new_unnamed()).unwrap();
    b.bind(&SunName::new_unnamed()).unwrap();
    assert_ne!(a.getsockname(), b.getsockname());
}

#[test]
fn pathname_bind_creates_the_backing_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sock");
    let addr =
        SunName::new_path(&std::ffi::CString::new(path.to_str().unwrap()).unwrap()).unwrap();
    let socket = UnixSocket::new(SocketType::Stream);
    socket.bind(&addr).unwrap();
    assert!(path.exists());
}

#[test]
fn pathname_collision_is_address_in_use_never_eexist() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sock");
    std::fs::write(&path, b"occupied").unwrap();
    let addr =
        SunName::new_path(&std::ffi::CString::new(path.to_str().unwrap()).unwrap()).unwrap();
    let socket = UnixSocket::new(SocketType::Stream);
    let err = socket.bind(&addr).unwrap_err();
    assert_eq!(err, Errno::EADDRINUSE);
    assert_ne!(err, Errno::EEXIST);
}

#[test]
fn dgram_bind_creates_the_pipe() {
    let socket = UnixSocket::new(SocketType::Dgram);
    socket.bind(&abstract_name("dgram-pipe")).unwrap();
    // the single datagram instance exists as soon as bind returns
    assert!(socket.canonical_handle().is_some());
}

#[test]
fn failed_bind_rolls_back_cleanly() {
    let addr = abstract_name("rollback");
    let holder = UnixSocket::new(SocketType::Dgram);
    holder.bind(&addr).unwrap();

    let socket = UnixSocket::new(SocketType::Dgram);
    assert_eq!(socket.bind(&addr).unwrap_err(), Errno::EADDRINUSE);
    assert_eq!(socket.binding_state(), BindingState::Unbound);
    // the pipe created before the publish failure was released
    assert!(socket.canonical_handle().is_none());

    // the socket is still usable with a fresh name
    socket.bind(&abstract_name("rollback-retry")).unwrap();
}
