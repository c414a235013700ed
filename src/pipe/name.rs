//! Canonical pipe names.
//!
//! Every socket is backed by one named pipe whose name is a pure function
//! of the installation key, the socket type, and the socket's unique id:
//!
//! ```text
//! cygwin-<16 hex key>-unix-<t>-<16 hex id>
//! ```
//!
//! 47 characters total. `<t>` is `s` for stream and `d` for datagram and
//! sits at character 29; it is how peers advertise their type, and address
//! resolution reads it back to reject cross-type connects.

use std::sync::atomic::{AtomicU32, Ordering};

use nix::errno::Errno;
use once_cell::sync::OnceCell;

use crate::socket::SocketType;

/// Character length of a canonical pipe name.
pub const PIPE_NAME_LEN: usize = 47;

/// Zero-based position of the socket-type character.
pub const TYPE_CHAR_POS: usize = 29;

/// Environment variable overriding the per-process installation key.
pub const INSTALLATION_KEY_ENV: &str = "PIPESOCK_INSTALLATION_KEY";

/// The installation key: 16 uppercase hex digits shared by every socket in
/// this process. Taken from [`INSTALLATION_KEY_ENV`] when it holds a valid
/// 16-digit hex value, otherwise generated once at first use.
pub fn installation_key() -> &'static str {
    static KEY: OnceCell<String> = OnceCell::new();
    KEY.get_or_init(|| {
        if let Ok(key) = std::env::var(INSTALLATION_KEY_ENV) {
            if key.len() == 16 && key.bytes().all(|b| b.is_ascii_hexdigit()) {
                return key.to_ascii_uppercase();
            }
            log::warn!("ignoring malformed {INSTALLATION_KEY_ENV}={key:?}");
        }
        format!("{:016X}", rand::random::<u64>())
    })
}

/// A fresh id, unique within this process for the life of the process.
/// The low 20 bits double as the autobind name space.
pub fn next_unique_id() -> u64 {
    static COUNTER: AtomicU32 = AtomicU32::new(1);
    let suffix = COUNTER.fetch_add(1, Ordering::Relaxed);
    ((std::process::id() as u64) << 32) | suffix as u64
}

/// Build the canonical pipe name for a socket.
pub fn pipe_name(socket_type: SocketType, unique_id: u64) -> String {
    let name = format!(
        "cygwin-{}-unix-{}-{:016X}",
        installation_key(),
        socket_type.type_char(),
        unique_id,
    );
    debug_assert_eq!(name.len(), PIPE_NAME_LEN);
    name
}

/// Read the socket type a peer advertised in its pipe name. Anything but
/// `s` or `d` at the type position is rejected.
pub fn socket_type_of(pipe_name: &str) -> Result<SocketType, Errno> {
    match pipe_name.as_bytes().get(TYPE_CHAR_POS) {
        Some(b's') => Ok(SocketType::Stream),
        Some(b'd') => Ok(SocketType::Dgram),
        _ => Err(Errno::EINVAL),
    }
}
