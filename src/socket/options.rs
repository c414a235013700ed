//! The socket-option surface.
//!
//! Only `SOL_SOCKET` exists for this family; any other level is
//! `ENOPROTOOPT`. Unknown `SOL_SOCKET` options are silently accepted on
//! set and read back zero-filled on get, matching how AF_UNIX sockets
//! treat options they do not implement.

use std::sync::atomic::Ordering;

use libc::c_int;
use nix::errno::Errno;

use crate::util::time::{ms_to_timeval, timeval_to_ms};

use super::UnixSocket;

/// Read a native struct out of an option buffer. Short buffers are the
/// caller's error.
fn read_struct<T: Copy>(optval: &[u8]) -> Result<T, Errno> {
    if optval.len() < std::mem::size_of::<T>() {
        return Err(Errno::EINVAL);
    }
    // SAFETY: length checked above; read_unaligned has no alignment
    // requirement and T is plain old data.
    Ok(unsafe { std::ptr::read_unaligned(optval.as_ptr() as *const T) })
}

/// Write a native struct into an option buffer, returning the value length.
fn write_struct<T: Copy>(value: &T, optval: &mut [u8]) -> Result<usize, Errno> {
    let len = std::mem::size_of::<T>();
    if optval.len() < len {
        return Err(Errno::EINVAL);
    }
    // SAFETY: length checked above.
    unsafe { std::ptr::write_unaligned(optval.as_mut_ptr() as *mut T, *value) };
    Ok(len)
}

impl UnixSocket {
    /// `setsockopt(2)`.
    pub fn setsockopt(&self, level: c_int, optname: c_int, optval: &[u8]) -> Result<(), Errno> {
        if level != libc::SOL_SOCKET {
            return Err(Errno::ENOPROTOOPT);
        }
        match optname {
            libc::SO_PASSCRED => Ok(()),
            libc::SO_REUSEADDR => {
                let flag: c_int = read_struct(optval)?;
                self.shared.reuseaddr.store(flag != 0, Ordering::SeqCst);
                Ok(())
            }
            libc::SO_RCVBUF | libc::SO_SNDBUF => {
                let size: c_int = read_struct(optval)?;
                let size = size.max(0) as usize;
                if optname == libc::SO_RCVBUF {
                    self.shared.rcvbuf.store(size, Ordering::SeqCst);
                } else {
                    self.shared.sndbuf.store(size, Ordering::SeqCst);
                }
                Ok(())
            }
            libc::SO_RCVTIMEO | libc::SO_SNDTIMEO => {
                let tv: libc::timeval = read_struct(optval)?;
                let ms = timeval_to_ms(&tv)?;
                if optname == libc::SO_RCVTIMEO {
                    self.shared.rcvtimeo_ms.store(ms, Ordering::SeqCst);
                } else {
                    self.shared.sndtimeo_ms.store(ms, Ordering::SeqCst);
                }
                Ok(())
            }
            // everything else is ignored for this family
            _ => Ok(()),
        }
    }

    /// `getsockopt(2)`. Returns the length of the value written.
    pub fn getsockopt(
        &self,
        level: c_int,
        optname: c_int,
        optval: &mut [u8],
    ) -> Result<usize, Errno> {
        if level != libc::SOL_SOCKET {
            return Err(Errno::ENOPROTOOPT);
        }
        match optname {
            libc::SO_ERROR => {
                // read-and-clear
                let err: c_int = self.shared.so_error.swap(0, Ordering::SeqCst);
                write_struct(&err, optval)
            }
            libc::SO_PEERCRED => {
                let cred = self.getpeereid()?;
                let ucred = libc::ucred {
                    pid: cred.pid,
                    uid: cred.uid,
                    gid: cred.gid,
                };
                write_struct(&ucred, optval)
            }
            libc::SO_REUSEADDR => {
                let flag: c_int = self.shared.reuseaddr.load(Ordering::SeqCst) as c_int;
                write_struct(&flag, optval)
            }
            libc::SO_RCVBUF | libc::SO_SNDBUF => {
                let source = if optname == libc::SO_RCVBUF {
                    &self.shared.rcvbuf
                } else {
                    &self.shared.sndbuf
                };
                let size = source.load(Ordering::SeqCst) as c_int;
                write_struct(&size, optval)
            }
            libc::SO_RCVTIMEO | libc::SO_SNDTIMEO => {
                let ms = if optname == libc::SO_RCVTIMEO {
                    self.shared.rcvtimeo_ms.load(Ordering::SeqCst)
                } else {
                    self.shared.sndtimeo_ms.load(Ordering::SeqCst)
                };
                write_struct(&ms_to_timeval(ms), optval)
            }
            libc::SO_TYPE => {
                let type_: c_int = self.socket_type().to_raw();
                write_struct(&type_, optval)
            }
            libc::SO_LINGER => {
                let linger = libc::linger {
                    l_onoff: 0,
                    l_linger: 0,
                };
                write_struct(&linger, optval)
            }
            // unknown options read back as zero
            _ => write_struct::<c_int>(&0, optval),
        }
    }
}
