//! Shared helpers for the end-to-end tests.
#![allow(dead_code)] // each test binary uses its own subset

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use pipesock::{ConnectState, SunName, UnixSocket};

/// A process-unique abstract address, `\0<tag>-<n>`.
pub fn abstract_name(tag: &str) -> SunName {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let name = format!("{tag}-{}-{n}", std::process::id());
    SunName::new_abstract(name.as_bytes()).unwrap()
}

/// Build an address from raw `sun_path` bytes under AF_UNIX.
pub fn sun_from_path_bytes(path: &[u8]) -> SunName {
    let mut bytes = (libc::AF_UNIX as libc::sa_family_t).to_ne_bytes().to_vec();
    bytes.extend_from_slice(path);
    SunName::from_bytes(&bytes).unwrap()
}

/// Spin until a pending connect resolves, or panic after `timeout`.
pub fn wait_connect_settled(socket: &UnixSocket, timeout: Duration) -> ConnectState {
    let deadline = Instant::now() + timeout;
    loop {
        let state = socket.connect_state();
        if state != ConnectState::ConnectPending {
            return state;
        }
        assert!(Instant::now() < deadline, "connect never settled");
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Read `SO_ERROR`, which clears it.
pub fn so_error(socket: &UnixSocket) -> i32 {
    let mut buf = [0u8; 4];
    let len = socket
        .getsockopt(libc::SOL_SOCKET, libc::SO_ERROR, &mut buf)
        .unwrap();
    assert_eq!(len, 4);
    i32::from_ne_bytes(buf)
}
