//! Address publication and resolution.
//!
//! `bind` publishes an AF_UNIX address into the host namespace so peers can
//! find the backing pipe: abstract names become entries in the shared object
//! directory, pathnames become reparse-point files. `connect` resolves an
//! address back to the canonical pipe name and the socket type its owner
//! advertised in it.

pub mod abstract_dir;
pub mod reparse;

use std::path::PathBuf;

use nix::errno::Errno;

use crate::addr::{AddrShape, SunName};
use crate::pipe::name as pipe_name;
use crate::socket::SocketType;
use crate::util::sync::Event;

pub use abstract_dir::AbstractHandle;

/// What a successful publication left behind. Dropping it releases whatever
/// the publication holds open; a pathname file outlives its handle and must
/// be unlinked by the user, as with any socket file. Clones share the
/// publication, like duplicated handles.
#[derive(Clone, Debug)]
pub enum BackingFile {
    /// The open link handle keeping an abstract name alive.
    Abstract(AbstractHandle),
    /// A reparse file was created at this path; no handle is kept open.
    PathCreated(PathBuf),
}

/// The object-directory link name for an abstract address: a fixed prefix
/// plus the raw `sun_path` bytes, embedded NULs and all.
fn link_name(sun: &SunName) -> Vec<u8> {
    let mut key = b"af-unix-".to_vec();
    key.extend_from_slice(sun.path_bytes());
    key
}

fn check_shape(sun: &SunName) -> Result<AddrShape, Errno> {
    if sun.path_bytes().is_empty() || sun.is_degenerate() {
        return Err(Errno::EINVAL);
    }
    Ok(sun.shape())
}

/// Publish an address, making `pipe_name` discoverable under it.
pub fn publish(sun: &SunName, pipe_name: &str) -> Result<BackingFile, Errno> {
    match check_shape(sun)? {
        AddrShape::Unnamed => unreachable!("checked above"),
        AddrShape::Abstract => {
            let handle = abstract_dir::create_link(link_name(sun), pipe_name)?;
            Ok(BackingFile::Abstract(handle))
        }
        AddrShape::Pathname => {
            let path = sun.pathname().ok_or(Errno::EINVAL)?;
            reparse::create_reparse_file(&path, pipe_name)?;
            Ok(BackingFile::PathCreated(path))
        }
    }
}

/// Resolve an address to the advertised socket type and pipe name.
pub fn resolve(sun: &SunName, cancels: &[&Event]) -> Result<(SocketType, String), Errno> {
    let name = match check_shape(sun)? {
        AddrShape::Unnamed => unreachable!("checked above"),
        AddrShape::Abstract => {
            abstract_dir::query_link(&link_name(sun)).ok_or(Errno::ENOENT)?
        }
        AddrShape::Pathname => {
            let path = sun.pathname().ok_or(Errno::EINVAL)?;
            reparse::read_reparse_file(&path, cancels)?
        }
    };
    let socket_type = pipe_name::socket_type_of(&name)?;
    Ok((socket_type, name))
}

/// Bind-time autobind: allocate an unused abstract name of the form
/// `"\0XXXXX"` (five hex digits from a fresh 20-bit id) and publish it.
pub fn autobind(pipe_name: &str) -> Result<(SunName, BackingFile), Errno> {
    loop {
        let id = pipe_name::next_unique_id() & 0xfffff;
        let name = format!("{id:05X}");
        let sun = SunName::new_abstract(name.as_bytes()).ok_or(Errno::EINVAL)?;
        match abstract_dir::create_link(link_name(&sun), pipe_name) {
            Ok(handle) => return Ok((sun, BackingFile::Abstract(handle))),
            Err(Errno::EADDRINUSE) => continue,
            Err(err) => return Err(err),
        }
    }
}
