mod common;

use common::abstract_name;
use nix::errno::Errno;
use pipesock::{SocketType, UnixSocket};

fn get_int(socket: &UnixSocket, optname: libc::c_int) -> i32 {
    let mut buf = [0u8; 4];
    let len = socket
        .getsockopt(libc::SOL_SOCKET, optname, &mut buf)
        .unwrap();
    assert_eq!(len, 4);
    i32::from_ne_bytes(buf)
}

fn set_int(socket: &UnixSocket, optname: libc::c_int, value: i32) {
    socket
        .setsockopt(libc::SOL_SOCKET, optname, &value.to_ne_bytes())
        .unwrap();
}

#[test]
fn only_sol_socket_exists() {
    let socket = UnixSocket::new(SocketType::Stream);
    let mut buf = [0u8; 4];
    assert_eq!(
        socket
            .getsockopt(libc::IPPROTO_TCP, libc::SO_TYPE, &mut buf)
            .unwrap_err(),
        Errno::ENOPROTOOPT
    );
    assert_eq!(
        socket
            .setsockopt(libc::IPPROTO_TCP, libc::SO_REUSEADDR, &1i32.to_ne_bytes())
            .unwrap_err(),
        Errno::ENOPROTOOPT
    );
}

#[test]
fn so_type_reports_the_socket_type() {
    let stream = UnixSocket::new(SocketType::Stream);
    let dgram = UnixSocket::new(SocketType::Dgram);
    assert_eq!(get_int(&stream, libc::SO_TYPE), libc::SOCK_STREAM);
    assert_eq!(get_int(&dgram, libc::SO_TYPE), libc::SOCK_DGRAM);
}

#[test]
fn so_error_starts_clear() {
    let socket = UnixSocket::new(SocketType::Stream);
    assert_eq!(get_int(&socket, libc::SO_ERROR), 0);
}

#[test]
fn reuseaddr_round_trips() {
    let socket = UnixSocket::new(SocketType::Stream);
    assert_eq!(get_int(&socket, libc::SO_REUSEADDR), 0);
    set_int(&socket, libc::SO_REUSEADDR, 1);
    assert_eq!(get_int(&socket, libc::SO_REUSEADDR), 1);
    set_int(&socket, libc::SO_REUSEADDR, 0);
    assert_eq!(get_int(&socket, libc::SO_REUSEADDR), 0);
}

#[test]
fn buffer_sizes_round_trip() {
    let socket = UnixSocket::new(SocketType::Stream);
    assert_eq!(get_int(&socket, libc::SO_RCVBUF), 262144);
    assert_eq!(get_int(&socket, libc::SO_SNDBUF), 262144);
    set_int(&socket, libc::SO_RCVBUF, 8192);
    set_int(&socket, libc::SO_SNDBUF, 16384);
    assert_eq!(get_int(&socket, libc::SO_RCVBUF), 8192);
    assert_eq!(get_int(&socket, libc::SO_SNDBUF), 16384);
}

#[test]
fn timeouts_convert_through_milliseconds() {
    let socket = UnixSocket::new(SocketType::Stream);

    let tv = libc::timeval {
        tv_sec: 2,
        tv_usec: 500_000,
    };
    let bytes = unsafe {
        std::slice::from_raw_parts(
            std::ptr::addr_of!(tv) as *const u8,
            std::mem::size_of::<libc::timeval>(),
        )
    };
    socket
        .setsockopt(libc::SOL_SOCKET, libc::SO_RCVTIMEO, bytes)
        .unwrap();

    let mut out = [0u8; std::mem::size_of::<libc::timeval>()];
    let len = socket
        .getsockopt(libc::SOL_SOCKET, libc::SO_RCVTIMEO, &mut out)
        .unwrap();
    assert_eq!(len, std::mem::size_of::<libc::timeval>());
    let back: libc::timeval = unsafe { std::ptr::read_unaligned(out.as_ptr() as *const _) };
    assert_eq!(back.tv_sec, 2);
    assert_eq!(back.tv_usec, 500_000);
}

#[test]
fn timeout_overflow_is_out_of_domain() {
    let socket = UnixSocket::new(SocketType::Stream);
    let tv = libc::timeval {
        tv_sec: -1,
        tv_usec: 0,
    };
    let bytes = unsafe {
        std::slice::from_raw_parts(
            std::ptr::addr_of!(tv) as *const u8,
            std::mem::size_of::<libc::timeval>(),
        )
    };
    assert_eq!(
        socket
            .setsockopt(libc::SOL_SOCKET, libc::SO_SNDTIMEO, bytes)
            .unwrap_err(),
        Errno::EDOM
    );
}

#[test]
fn short_option_buffers_are_invalid() {
    let socket = UnixSocket::new(SocketType::Stream);
    let mut small = [0u8; 2];
    assert_eq!(
        socket
            .getsockopt(libc::SOL_SOCKET, libc::SO_ERROR, &mut small)
            .unwrap_err(),
        Errno::EINVAL
    );
    assert_eq!(
        socket
            .setsockopt(libc::SOL_SOCKET, libc::SO_RCVTIMEO, &small)
            .unwrap_err(),
        Errno::EINVAL
    );
}

#[test]
fn linger_reads_back_zero() {
    let socket = UnixSocket::new(SocketType::Stream);
    let mut buf = [0xffu8; std::mem::size_of::<libc::linger>()];
    let len = socket
        .getsockopt(libc::SOL_SOCKET, libc::SO_LINGER, &mut buf)
        .unwrap();
    assert_eq!(len, std::mem::size_of::<libc::linger>());
    assert!(buf[..len].iter().all(|&b| b == 0));
}

#[test]
fn unknown_options_are_tolerated() {
    let socket = UnixSocket::new(SocketType::Stream);
    // accepted without effect
    socket
        .setsockopt(libc::SOL_SOCKET, libc::SO_BROADCAST, &1i32.to_ne_bytes())
        .unwrap();
    // read back zero-filled
    assert_eq!(get_int(&socket, libc::SO_BROADCAST), 0);
    // SO_PASSCRED is explicitly a no-op
    socket
        .setsockopt(libc::SOL_SOCKET, libc::SO_PASSCRED, &1i32.to_ne_bytes())
        .unwrap();
}

#[test]
fn peercred_needs_a_connection() {
    let socket = UnixSocket::new(SocketType::Stream);
    let mut buf = [0u8; std::mem::size_of::<libc::ucred>()];
    assert_eq!(
        socket
            .getsockopt(libc::SOL_SOCKET, libc::SO_PEERCRED, &mut buf)
            .unwrap_err(),
        Errno::ENOTCONN
    );
}

#[test]
fn peercred_reads_the_initialized_credentials() {
    let listener = UnixSocket::new(SocketType::Stream);
    let addr = abstract_name("peercred");
    listener.bind(&addr).unwrap();
    listener.listen(1).unwrap();
    let client = UnixSocket::new(SocketType::Stream);
    client.connect(&addr).unwrap();

    let mut buf = [0u8; std::mem::size_of::<libc::ucred>()];
    let len = client
        .getsockopt(libc::SOL_SOCKET, libc::SO_PEERCRED, &mut buf)
        .unwrap();
    assert_eq!(len, std::mem::size_of::<libc::ucred>());
    let cred: libc::ucred = unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const _) };
    assert_eq!(cred.pid, 0);
    assert_eq!(cred.uid, libc::uid_t::MAX);
    assert_eq!(cred.gid, libc::gid_t::MAX);
}

#[test]
fn unsupported_surface_is_refused_per_family() {
    let socket = UnixSocket::new(SocketType::Stream);
    assert_eq!(socket.shutdown(libc::SHUT_RD).unwrap_err(), Errno::EAFNOSUPPORT);
    assert_eq!(socket.write(b"data").unwrap_err(), Errno::EAFNOSUPPORT);
    let mut buf = [0u8; 8];
    assert_eq!(socket.read(&mut buf).unwrap_err(), Errno::EAFNOSUPPORT);
    assert_eq!(
        UnixSocket::socketpair(libc::SOCK_STREAM, 0, 0).unwrap_err(),
        Errno::EAFNOSUPPORT
    );
    assert_eq!(
        UnixSocket::socketpair(libc::SOCK_RAW, 0, 0).unwrap_err(),
        Errno::EINVAL
    );
    assert_eq!(
        UnixSocket::socket(libc::SOCK_STREAM, 17, 0).unwrap_err(),
        Errno::EPROTONOSUPPORT
    );
    assert_eq!(
        UnixSocket::socket(libc::SOCK_SEQPACKET, 0, 0).unwrap_err(),
        Errno::EINVAL
    );
}
