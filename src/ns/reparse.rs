//! Reparse-point files for pathname socket addresses.
//!
//! A pathname bind creates a regular file at the address path whose content
//! is a tagged reparse payload: the socket tag, a well-known GUID, and the
//! canonical pipe name as a length-prefixed, NUL-terminated UTF-16 string.
//! Resolution reads the payload back and refuses anything whose tag or GUID
//! does not match, so an unrelated file at the path can never be mistaken
//! for a socket.

use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use nix::errno::Errno;
use nix::sys::stat::Mode;

use crate::util::sync::Event;

/// The socket reparse tag.
pub const REPARSE_TAG: u32 = 0x0000_6379;

/// The socket reparse GUID, `efc1714d-7b19-4407-bab3-c5b1f92cb88c`, in
/// struct layout order.
pub const REPARSE_GUID: [u8; 16] = guid_bytes(
    0xefc1_714d,
    0x7b19,
    0x4407,
    [0xba, 0xb3, 0xc5, 0xb1, 0xf9, 0x2c, 0xb8, 0x8c],
);

const fn guid_bytes(d1: u32, d2: u16, d3: u16, d4: [u8; 8]) -> [u8; 16] {
    let a = d1.to_ne_bytes();
    let b = d2.to_ne_bytes();
    let c = d3.to_ne_bytes();
    [
        a[0], a[1], a[2], a[3], b[0], b[1], c[0], c[1], d4[0], d4[1], d4[2], d4[3], d4[4], d4[5],
        d4[6], d4[7],
    ]
}

// tag + guid + u16 length prefix
const PAYLOAD_HEADER_LEN: usize = 4 + 16 + 2;

/// Create the backing file with exclusive-create semantics and install the
/// reparse payload. An existing file of any kind means the address is in
/// use. On a failed install the file is deleted before returning.
pub fn create_reparse_file(path: &Path, pipe_name: &str) -> Result<(), Errno> {
    if path.symlink_metadata().is_ok() {
        return Err(Errno::EADDRINUSE);
    }
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::AlreadyExists => Errno::EADDRINUSE,
            _ => io_errno(&e),
        })?;

    match install_payload(&mut file, pipe_name) {
        Ok(()) => {
            // the handle is not kept open; the file itself is the record
            Ok(())
        }
        Err(err) => {
            drop(file);
            if let Err(e) = std::fs::remove_file(path) {
                log::debug!("removing half-made socket file {path:?} failed: {e}");
            }
            Err(err)
        }
    }
}

fn install_payload(file: &mut std::fs::File, pipe_name: &str) -> Result<(), Errno> {
    let mut payload = Vec::with_capacity(PAYLOAD_HEADER_LEN + (pipe_name.len() + 1) * 2);
    payload.extend_from_slice(&REPARSE_TAG.to_ne_bytes());
    payload.extend_from_slice(&REPARSE_GUID);
    let units: Vec<u16> = pipe_name.encode_utf16().collect();
    let length_bytes = (units.len() * 2) as u16;
    payload.extend_from_slice(&length_bytes.to_ne_bytes());
    for unit in &units {
        payload.extend_from_slice(&unit.to_ne_bytes());
    }
    payload.extend_from_slice(&0u16.to_ne_bytes());

    file.write_all(&payload).map_err(|e| io_errno(&e))?;

    let mode = Mode::from_bits_truncate(0o777) & !read_umask();
    nix::sys::stat::fchmod(file.as_raw_fd(), mode)?;
    Ok(())
}

fn read_umask() -> Mode {
    let mask = nix::sys::stat::umask(Mode::empty());
    nix::sys::stat::umask(mask);
    mask
}

/// Read the pipe name back from a reparse file. A temporarily busy file is
/// retried with a cooperative yield; a set cancel event aborts the retry
/// loop with `EINTR`.
pub fn read_reparse_file(path: &Path, cancels: &[&Event]) -> Result<String, Errno> {
    let mut file = loop {
        match std::fs::File::open(path) {
            Ok(file) => break file,
            Err(e) if is_sharing_violation(&e) => {
                if cancels.iter().any(|event| event.is_set()) {
                    return Err(Errno::EINTR);
                }
                std::thread::yield_now();
            }
            Err(e) => return Err(io_errno(&e)),
        }
    };
    let mut payload = Vec::new();
    file.read_to_end(&mut payload).map_err(|e| io_errno(&e))?;
    parse_payload(&payload)
}

fn parse_payload(payload: &[u8]) -> Result<String, Errno> {
    if payload.len() < PAYLOAD_HEADER_LEN {
        return Err(Errno::EINVAL);
    }
    let tag = u32::from_ne_bytes(payload[0..4].try_into().unwrap());
    if tag != REPARSE_TAG || payload[4..20] != REPARSE_GUID {
        return Err(Errno::EINVAL);
    }
    let length_bytes = u16::from_ne_bytes(payload[20..22].try_into().unwrap()) as usize;
    let name_bytes = payload
        .get(PAYLOAD_HEADER_LEN..PAYLOAD_HEADER_LEN + length_bytes)
        .ok_or(Errno::EINVAL)?;
    let units: Vec<u16> = name_bytes
        .chunks_exact(2)
        .map(|pair| u16::from_ne_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).map_err(|_| Errno::EINVAL)
}

fn is_sharing_violation(e: &std::io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EBUSY) | Some(libc::ETXTBSY) | Some(libc::EAGAIN)
    )
}

fn io_errno(e: &std::io::Error) -> Errno {
    e.raw_os_error().map(Errno::from_i32).unwrap_or(Errno::EIO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sock");
        create_reparse_file(&path, "cygwin-0123456789ABCDEF-unix-s-0000000000000001").unwrap();
        let name = read_reparse_file(&path, &[]).unwrap();
        assert_eq!(name, "cygwin-0123456789ABCDEF-unix-s-0000000000000001");
    }

    #[test]
    fn existing_file_is_address_in_use() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sock");
        std::fs::write(&path, b"already here").unwrap();
        assert_eq!(
            create_reparse_file(&path, "pipe").unwrap_err(),
            Errno::EADDRINUSE
        );
        // the pre-existing file is left alone
        assert_eq!(std::fs::read(&path).unwrap(), b"already here");
    }

    #[test]
    fn foreign_content_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-a-socket");
        std::fs::write(&path, b"some unrelated file content.....").unwrap();
        assert_eq!(read_reparse_file(&path, &[]).unwrap_err(), Errno::EINVAL);
    }

    #[test]
    fn tampered_guid_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sock");
        create_reparse_file(&path, "pipe-name").unwrap();
        let mut payload = std::fs::read(&path).unwrap();
        payload[7] ^= 0xff;
        std::fs::write(&path, &payload).unwrap();
        assert_eq!(read_reparse_file(&path, &[]).unwrap_err(), Errno::EINVAL);
    }

    #[test]
    fn missing_file_is_enoent() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            read_reparse_file(&dir.path().join("nope"), &[]).unwrap_err(),
            Errno::ENOENT
        );
    }

    #[test]
    fn permissions_follow_the_umask() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sock");
        let old = nix::sys::stat::umask(Mode::from_bits_truncate(0o022));
        create_reparse_file(&path, "pipe-name").unwrap();
        nix::sys::stat::umask(old);
        let mode = path.metadata().unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o755);
    }
}
