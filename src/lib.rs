//! AF_UNIX socket emulation over message-mode named pipes.
//!
//! This crate provides stream and datagram AF_UNIX sockets for a host
//! whose native IPC primitive is a message-mode named pipe and whose
//! filesystem has no socket files. The emulation has three layers:
//!
//! * **Addresses** ([`addr`], [`ns`]). An abstract address (leading NUL in
//!   `sun_path`) becomes a symbolic-link entry in a shared object
//!   directory whose content is the backing pipe's name; a pathname
//!   address becomes a regular file carrying a tagged reparse payload with
//!   the same content. Resolution reads the pipe name back and learns the
//!   owner's socket type from a fixed position inside it.
//!
//! * **Transport** ([`pipe`]). Each socket is backed by one named pipe,
//!   `cygwin-<key>-unix-[s|d]-<id>`. A listener keeps one unconnected
//!   instance pending; every accept hands the connected instance to the
//!   accepted socket and replaces it with a fresh one. Datagram pipes have
//!   a single instance.
//!
//! * **Framing** ([`packet`]). Every message on the wire carries a small
//!   header plus the sender's name, ancillary data, and payload. Freshly
//!   connected and late-bound sockets announce their local name to the
//!   peer in a one-shot, fire-and-forget packet; the accepting side reads
//!   exactly one announcement before the accepted socket is handed out.
//!
//! [`socket::UnixSocket`] ties the layers together with the
//! bind/listen/connect/accept state machines, a background waiter for
//! connects against fully busy pipes, and the socket-option and
//! file-metadata surfaces.

// https://github.com/rust-lang/rfcs/blob/master/text/2585-unsafe-block-in-unsafe-fn.md
#![deny(unsafe_op_in_unsafe_fn)]

pub mod addr;
pub mod ns;
pub mod packet;
pub mod pipe;
pub mod socket;
mod util;

pub use addr::{AddrShape, SunName};
pub use socket::{BindingState, ConnectState, Credentials, Interrupter, SocketType, UnixSocket};
