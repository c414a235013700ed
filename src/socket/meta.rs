//! File-metadata passthrough.
//!
//! A pathname-bound socket is backed by a real file, so metadata
//! operations delegate to it, with two adjustments: the file type always
//! reads as a socket with zero size, and `fchmod` folds write permission
//! into read permission so anyone allowed to connect can also read the
//! backing file. Without that, resolution of the address would fail with a
//! spurious permission error for users who may legitimately connect.

use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::stat::{FchmodatFlags, Mode};

use super::UnixSocket;

impl UnixSocket {
    /// The backing file path of a pathname-bound socket.
    fn backing_path(&self) -> Option<PathBuf> {
        self.shared
            .bind
            .read()
            .unwrap()
            .sun_path
            .and_then(|sun| sun.pathname())
    }

    /// `fstat(2)`. Pathname-bound sockets report the backing file with the
    /// type forced to socket and a zero size; everything else gets a
    /// synthesized socket stat.
    pub fn fstat(&self) -> Result<libc::stat, Errno> {
        match self.backing_path() {
            Some(path) => {
                let mut st = nix::sys::stat::stat(&path)?;
                st.st_mode = (st.st_mode & !libc::S_IFMT) | libc::S_IFSOCK;
                st.st_size = 0;
                Ok(st)
            }
            None => {
                let mut st: libc::stat = unsafe { std::mem::zeroed() };
                st.st_mode = libc::S_IFSOCK | 0o777;
                st.st_ino = self.ino();
                st.st_nlink = 1;
                Ok(st)
            }
        }
    }

    /// `fstatvfs(2)` of the filesystem holding the backing file.
    pub fn fstatvfs(&self) -> Result<nix::sys::statvfs::Statvfs, Errno> {
        match self.backing_path() {
            Some(path) => nix::sys::statvfs::statvfs(&path),
            None => {
                log::warn!("fstatvfs on a socket without a backing file");
                Err(Errno::EINVAL)
            }
        }
    }

    /// `fchmod(2)` on the backing file. Write bits are propagated into the
    /// matching read bits before applying.
    pub fn fchmod(&self, mode: libc::mode_t) -> Result<(), Errno> {
        let Some(path) = self.backing_path() else {
            return Ok(());
        };
        let mode = mode | ((mode & 0o222) << 1);
        nix::sys::stat::fchmodat(
            None,
            &path,
            Mode::from_bits_truncate(mode),
            FchmodatFlags::FollowSymlink,
        )
    }

    /// `fchown(2)` on the backing file.
    pub fn fchown(
        &self,
        uid: Option<libc::uid_t>,
        gid: Option<libc::gid_t>,
    ) -> Result<(), Errno> {
        let Some(path) = self.backing_path() else {
            return Ok(());
        };
        nix::unistd::chown(
            &path,
            uid.map(nix::unistd::Uid::from_raw),
            gid.map(nix::unistd::Gid::from_raw),
        )
    }

    /// `link(2)`: hard-link the backing file to a new path.
    pub fn link(&self, newpath: &Path) -> Result<(), Errno> {
        let Some(path) = self.backing_path() else {
            return Err(Errno::EINVAL);
        };
        std::fs::hard_link(&path, newpath)
            .map_err(|e| e.raw_os_error().map(Errno::from_i32).unwrap_or(Errno::EIO))
    }
}
