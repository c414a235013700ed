//! The shared object directory for abstract socket names.
//!
//! Abstract addresses have no filesystem presence. Publishing one creates a
//! symbolic-link entry in a process-wide shared directory whose content is
//! the canonical pipe name; the entry exists exactly as long as some handle
//! to it is open, so dropping the last [`AbstractHandle`] unpublishes the
//! name. The creating socket holds its handle for the socket's lifetime.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use nix::errno::Errno;
use once_cell::sync::OnceCell;

struct ObjectDir {
    links: Mutex<HashMap<Vec<u8>, String>>,
}

/// The per-process shared parent directory. Lockless after first call.
fn shared_parent_dir() -> &'static ObjectDir {
    static DIR: OnceCell<ObjectDir> = OnceCell::new();
    DIR.get_or_init(|| ObjectDir {
        links: Mutex::new(HashMap::new()),
    })
}

/// An open handle to a published abstract name. Cloning shares the handle;
/// the link disappears when the last clone drops.
#[derive(Clone)]
pub struct AbstractHandle {
    owner: Arc<LinkOwner>,
}

struct LinkOwner {
    key: Vec<u8>,
}

impl Drop for LinkOwner {
    fn drop(&mut self) {
        shared_parent_dir().links.lock().unwrap().remove(&self.key);
    }
}

impl std::fmt::Debug for AbstractHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name: String = self.owner.key.iter()
            .flat_map(|b| std::ascii::escape_default(*b))
            .map(char::from)
            .collect();
        f.debug_struct("AbstractHandle").field("link", &name).finish()
    }
}

/// Create a symbolic-link entry holding `pipe_name`. A name collision is an
/// address in use.
pub fn create_link(key: Vec<u8>, pipe_name: &str) -> Result<AbstractHandle, Errno> {
    let mut links = shared_parent_dir().links.lock().unwrap();
    match links.entry(key.clone()) {
        std::collections::hash_map::Entry::Occupied(_) => Err(Errno::EADDRINUSE),
        std::collections::hash_map::Entry::Vacant(entry) => {
            entry.insert(pipe_name.to_owned());
            Ok(AbstractHandle {
                owner: Arc::new(LinkOwner { key }),
            })
        }
    }
}

/// Read the pipe name a link points at.
pub fn query_link(key: &[u8]) -> Option<String> {
    shared_parent_dir().links.lock().unwrap().get(key).cloned()
}
