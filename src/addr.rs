//! AF_UNIX socket addresses.
//!
//! A [`SunName`] is a value-typed `sockaddr_un` together with the live
//! length the caller supplied. The bytes are preserved exactly as given,
//! embedded NUL bytes included, because abstract names use every byte of
//! `sun_path` up to the live length and `getsockname`/`getpeername` must
//! return them unchanged.

use std::ffi::{CStr, OsStr};
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use nix::errno::Errno;
use static_assertions::const_assert;

/// Offset of `sun_path` within `sockaddr_un`; also the length of an
/// unnamed address (just the family field).
pub const SUN_PATH_OFFSET: usize = std::mem::offset_of!(libc::sockaddr_un, sun_path);

/// Largest address this family accepts, in bytes.
pub const SUN_LEN_MAX: usize = std::mem::size_of::<libc::sockaddr_un>();

/// Capacity of the `sun_path` field.
const SUN_PATH_CAP: usize = SUN_LEN_MAX - SUN_PATH_OFFSET;

// The wire header stores the name length in a u8.
const_assert!(SUN_LEN_MAX <= u8::MAX as usize);

/// The three shapes an AF_UNIX address can take, distinguishable by
/// inspection alone.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AddrShape {
    /// Only the family field is present; `bind` will autobind.
    Unnamed,
    /// First path byte is NUL; the name lives in the shared namespace and
    /// has no filesystem presence.
    Abstract,
    /// A filesystem path, backed by a regular file.
    Pathname,
}

/// An owned AF_UNIX socket address.
#[derive(Clone, Copy)]
pub struct SunName {
    un: libc::sockaddr_un,
    len: libc::socklen_t,
}

impl SunName {
    /// Build an address from the raw bytes of a `sockaddr_un`, family field
    /// included. Lengths shorter than the family field or longer than
    /// `sockaddr_un` are rejected with `EINVAL`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Errno> {
        if bytes.len() < SUN_PATH_OFFSET || bytes.len() > SUN_LEN_MAX {
            return Err(Errno::EINVAL);
        }
        let mut un: libc::sockaddr_un = unsafe { std::mem::zeroed() };
        // SAFETY: sockaddr_un is a plain-old-data struct and bytes.len() was
        // checked against its size above.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                std::ptr::addr_of_mut!(un) as *mut u8,
                bytes.len(),
            );
        }
        Ok(Self {
            un,
            len: bytes.len() as libc::socklen_t,
        })
    }

    /// The unnamed address: family only, length 2.
    pub fn new_unnamed() -> Self {
        let mut un: libc::sockaddr_un = unsafe { std::mem::zeroed() };
        un.sun_family = libc::AF_UNIX as libc::sa_family_t;
        Self {
            un,
            len: SUN_PATH_OFFSET as libc::socklen_t,
        }
    }

    /// A pathname address for the given NUL-free path. Returns `None` when
    /// the path is empty or does not fit in `sun_path` with its terminator.
    pub fn new_path(path: &CStr) -> Option<Self> {
        let path = path.to_bytes();
        if path.is_empty() || path.len() >= SUN_PATH_CAP {
            return None;
        }
        let mut un: libc::sockaddr_un = unsafe { std::mem::zeroed() };
        un.sun_family = libc::AF_UNIX as libc::sa_family_t;
        un.sun_path[..path.len()].copy_from_slice(u8_to_char_slice(path));
        // the terminating NUL is included in the live length
        Some(Self {
            un,
            len: (SUN_PATH_OFFSET + path.len() + 1) as libc::socklen_t,
        })
    }

    /// An abstract address. `name` is the part after the leading NUL and may
    /// itself contain NUL bytes. Returns `None` when the name does not fit.
    pub fn new_abstract(name: &[u8]) -> Option<Self> {
        if 1 + name.len() > SUN_PATH_CAP {
            return None;
        }
        let mut un: libc::sockaddr_un = unsafe { std::mem::zeroed() };
        un.sun_family = libc::AF_UNIX as libc::sa_family_t;
        un.sun_path[1..][..name.len()].copy_from_slice(u8_to_char_slice(name));
        Some(Self {
            un,
            len: (SUN_PATH_OFFSET + 1 + name.len()) as libc::socklen_t,
        })
    }

    /// The live length, family field included.
    pub fn len(&self) -> libc::socklen_t {
        self.len
    }

    pub fn family(&self) -> libc::sa_family_t {
        self.un.sun_family
    }

    /// The live bytes of the whole address, family field included.
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: the first `len` bytes were either copied from caller input
        // or written by a constructor over a zeroed struct.
        unsafe {
            std::slice::from_raw_parts(
                std::ptr::addr_of!(self.un) as *const u8,
                self.len as usize,
            )
        }
    }

    /// The live bytes of `sun_path` (everything after the family field).
    pub fn path_bytes(&self) -> &[u8] {
        &self.as_bytes()[SUN_PATH_OFFSET..]
    }

    pub fn shape(&self) -> AddrShape {
        let path = self.path_bytes();
        if path.is_empty() {
            AddrShape::Unnamed
        } else if path[0] == 0 {
            AddrShape::Abstract
        } else {
            AddrShape::Pathname
        }
    }

    pub fn is_unnamed(&self) -> bool {
        self.shape() == AddrShape::Unnamed
    }

    /// The degenerate "a lone NUL byte" abstract address, which names
    /// nothing and is rejected wherever addresses are materialized.
    pub fn is_degenerate(&self) -> bool {
        self.len as usize == SUN_PATH_OFFSET + 1 && self.path_bytes()[0] == 0
    }

    /// For pathname addresses, the filesystem path: the `sun_path` bytes up
    /// to the first NUL (C-string convention; bytes after it are ignored).
    pub fn pathname(&self) -> Option<PathBuf> {
        if self.shape() != AddrShape::Pathname {
            return None;
        }
        let path = self.path_bytes();
        let end = path.iter().position(|&b| b == 0).unwrap_or(path.len());
        Some(PathBuf::from(OsStr::from_bytes(&path[..end])))
    }
}

impl PartialEq for SunName {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for SunName {}

impl std::fmt::Debug for SunName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.shape() {
            AddrShape::Unnamed => write!(f, "SunName {{ unnamed }}"),
            AddrShape::Pathname => f
                .debug_struct("SunName")
                .field("path", &self.pathname())
                .finish(),
            AddrShape::Abstract => {
                let name: String = self.path_bytes()[1..]
                    .iter()
                    .flat_map(|b| std::ascii::escape_default(*b))
                    .map(char::from)
                    .collect();
                f.debug_struct("SunName").field("abstract", &name).finish()
            }
        }
    }
}

/// Convert a `&[u8]` to the platform's `sun_path` character type.
fn u8_to_char_slice(s: &[u8]) -> &[libc::c_char] {
    // SAFETY: c_char is byte-sized on every supported target.
    unsafe { std::slice::from_raw_parts(s.as_ptr() as *const libc::c_char, s.len()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(path: &[u8]) -> Vec<u8> {
        let mut bytes = (libc::AF_UNIX as libc::sa_family_t).to_ne_bytes().to_vec();
        bytes.extend_from_slice(path);
        bytes
    }

    #[test]
    fn unnamed_shape() {
        let addr = SunName::from_bytes(&raw(b"")).unwrap();
        assert_eq!(addr.shape(), AddrShape::Unnamed);
        assert_eq!(addr.len(), 2);
        assert!(addr.is_unnamed());
        assert_eq!(addr, SunName::new_unnamed());
    }

    #[test]
    fn abstract_shape_preserves_embedded_nuls() {
        let name = [0u8, b'f', 0, b'o', 0, 0, b'!'];
        let addr = SunName::from_bytes(&raw(&name)).unwrap();
        assert_eq!(addr.shape(), AddrShape::Abstract);
        assert_eq!(addr.path_bytes(), &name);
        assert_eq!(addr.len() as usize, 2 + name.len());
    }

    #[test]
    fn pathname_shape() {
        let addr = SunName::from_bytes(&raw(b"/tmp/sock\0")).unwrap();
        assert_eq!(addr.shape(), AddrShape::Pathname);
        assert_eq!(addr.pathname().unwrap(), PathBuf::from("/tmp/sock"));
    }

    #[test]
    fn pathname_ignores_bytes_after_nul() {
        let addr = SunName::from_bytes(&raw(b"/tmp/sock\0junk")).unwrap();
        assert_eq!(addr.pathname().unwrap(), PathBuf::from("/tmp/sock"));
    }

    #[test]
    fn degenerate_lone_nul() {
        let addr = SunName::from_bytes(&raw(&[0u8])).unwrap();
        assert_eq!(addr.shape(), AddrShape::Abstract);
        assert!(addr.is_degenerate());
    }

    #[test]
    fn length_bounds() {
        assert_eq!(SunName::from_bytes(&[0u8]), Err(Errno::EINVAL));
        assert_eq!(SunName::from_bytes(&[0u8; SUN_LEN_MAX + 1]), Err(Errno::EINVAL));
        assert!(SunName::from_bytes(&[0u8; SUN_LEN_MAX]).is_ok());
    }

    #[test]
    fn constructors_round_trip() {
        let path = CStr::from_bytes_with_nul(b"/run/x\0").unwrap();
        let addr = SunName::new_path(path).unwrap();
        assert_eq!(addr.pathname().unwrap(), PathBuf::from("/run/x"));
        // live length includes the terminating NUL
        assert_eq!(addr.len() as usize, 2 + 6 + 1);

        let addr = SunName::new_abstract(b"ab\0cd").unwrap();
        assert_eq!(addr.shape(), AddrShape::Abstract);
        assert_eq!(addr.path_bytes(), b"\0ab\0cd");
    }

    #[test]
    fn byte_exact_equality() {
        let a = SunName::from_bytes(&raw(b"\0foo")).unwrap();
        let b = SunName::from_bytes(&raw(b"\0foo")).unwrap();
        let c = SunName::from_bytes(&raw(b"\0foo\0")).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c); // same prefix, different live length
    }
}
