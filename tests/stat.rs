mod common;

use std::os::unix::fs::PermissionsExt;

use common::abstract_name;
use pipesock::{SocketType, SunName, UnixSocket};

fn pathname_socket(dir: &tempfile::TempDir, name: &str) -> (UnixSocket, std::path::PathBuf) {
    let path = dir.path().join(name);
    let addr =
        SunName::new_path(&std::ffi::CString::new(path.to_str().unwrap()).unwrap()).unwrap();
    let socket = UnixSocket::new(SocketType::Stream);
    socket.bind(&addr).unwrap();
    (socket, path)
}

#[test]
fn pathname_socket_stats_as_socket_with_zero_size() {
    let dir = tempfile::tempdir().unwrap();
    let (socket, path) = pathname_socket(&dir, "sock");

    // the backing file itself is a regular file with content
    assert!(path.metadata().unwrap().len() > 0);

    // but through the socket it is a zero-sized socket
    let st = socket.fstat().unwrap();
    assert_eq!(st.st_mode & libc::S_IFMT, libc::S_IFSOCK);
    assert_eq!(st.st_size, 0);
}

#[test]
fn abstract_socket_stats_synthesized() {
    let socket = UnixSocket::new(SocketType::Stream);
    socket.bind(&abstract_name("stat")).unwrap();
    let st = socket.fstat().unwrap();
    assert_eq!(st.st_mode & libc::S_IFMT, libc::S_IFSOCK);
    assert_eq!(st.st_ino, socket.ino());
}

#[test]
fn fchmod_keeps_writers_readable() {
    let dir = tempfile::tempdir().unwrap();
    let (socket, path) = pathname_socket(&dir, "sock");

    // write-only requested; the read bits come along
    socket.fchmod(0o222).unwrap();
    let mode = path.metadata().unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o666);

    socket.fchmod(0o200).unwrap();
    let mode = path.metadata().unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o600);
}

#[test]
fn fchmod_without_backing_file_is_a_no_op() {
    let socket = UnixSocket::new(SocketType::Stream);
    socket.bind(&abstract_name("chmod")).unwrap();
    socket.fchmod(0o600).unwrap();
}

#[test]
fn fchown_to_self_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let (socket, _path) = pathname_socket(&dir, "sock");
    let uid = nix::unistd::Uid::current().as_raw();
    let gid = nix::unistd::Gid::current().as_raw();
    socket.fchown(Some(uid), Some(gid)).unwrap();
}

#[test]
fn link_creates_a_second_path() {
    let dir = tempfile::tempdir().unwrap();
    let (socket, path) = pathname_socket(&dir, "sock");
    let linked = dir.path().join("sock-link");
    socket.link(&linked).unwrap();
    assert!(linked.exists());
    assert_eq!(
        std::fs::read(&path).unwrap(),
        std::fs::read(&linked).unwrap()
    );
}

#[test]
fn fstatvfs_reaches_the_backing_filesystem() {
    let dir = tempfile::tempdir().unwrap();
    let (socket, _path) = pathname_socket(&dir, "sock");
    let vfs = socket.fstatvfs().unwrap();
    assert!(vfs.blocks() > 0);
}

#[test]
fn bound_file_permissions_respect_umask() {
    use nix::sys::stat::Mode;
    let dir = tempfile::tempdir().unwrap();
    let old = nix::sys::stat::umask(Mode::from_bits_truncate(0o077));
    let (_socket, path) = pathname_socket(&dir, "sock");
    nix::sys::stat::umask(old);
    let mode = path.metadata().unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o700);
}
