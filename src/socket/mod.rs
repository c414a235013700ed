//! AF_UNIX sockets over named pipes.
//!
//! A [`UnixSocket`] owns one pipe handle, its local and peer addresses, and
//! the connect/bind state machines. Three reader/writer locks partition the
//! mutable state: `bind` guards the binding state, local address and
//! backing publication; `conn` guards the connect state, peer address,
//! peer credentials, and is where the connect waiter publishes its outcome;
//! `io` serializes handle-mutating I/O, including the brief completion-mode
//! flip around announcement writes. The socket-level error and the
//! non-blocking flag are plain atomics.
//!
//! A connecting, bound stream socket sends its local address once after a
//! successful connect. An already-connected socket also sends it after a
//! successful late bind. These announcement packets carry no other data,
//! and the accepting side reads exactly one of them before the accepted
//! socket is handed out.

pub mod meta;
pub mod options;
mod waiter;

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use libc::c_int;
use nix::errno::Errno;

use crate::addr::{SunName, SUN_LEN_MAX};
use crate::ns::{self, BackingFile};
use crate::packet::{Packet, HEADER_LEN};
use crate::pipe::{device, name as pipe_name, CreateOptions, PipeStatus, PipeWait};
use crate::util::sync::{wait_any, Event, WaitVerdict};

use waiter::ConnectWaiter;

/// Default connect timeout, as on Linux.
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Initial size of both pipe queues, bytes.
const DEFAULT_BUF_SIZE: usize = 262144;

/// The two supported socket types.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SocketType {
    Stream,
    Dgram,
}

impl SocketType {
    /// The character advertising this type inside a canonical pipe name.
    pub fn type_char(self) -> char {
        match self {
            Self::Stream => 's',
            Self::Dgram => 'd',
        }
    }

    pub fn from_raw(raw: c_int) -> Option<Self> {
        match raw {
            libc::SOCK_STREAM => Some(Self::Stream),
            libc::SOCK_DGRAM => Some(Self::Dgram),
            _ => None,
        }
    }

    pub fn to_raw(self) -> c_int {
        match self {
            Self::Stream => libc::SOCK_STREAM,
            Self::Dgram => libc::SOCK_DGRAM,
        }
    }
}

/// Progress of `bind` on this socket.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BindingState {
    Unbound,
    /// A bind is in flight; concurrent binds get `EALREADY` and `listen`
    /// waits this interval out.
    BindPending,
    Bound,
}

/// Progress of the connection state machine.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnectState {
    Unconnected,
    ConnectPending,
    Connected,
    Listener,
    ConnectFailed,
}

/// Peer credentials, as reported by `SO_PEERCRED`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    pub pid: libc::pid_t,
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            pid: 0,
            uid: libc::uid_t::MAX,
            gid: libc::gid_t::MAX,
        }
    }
}

/// A handle that can interrupt this socket's blocking waits, standing in
/// for signal delivery to the blocked thread. The interrupted call returns
/// `EINTR` and consumes the interrupt.
#[derive(Clone)]
pub struct Interrupter {
    signal: Event,
}

impl Interrupter {
    pub fn interrupt(&self) {
        self.signal.set();
    }
}

struct BindDomain {
    state: BindingState,
    sun_path: Option<SunName>,
    backing: Option<BackingFile>,
}

pub(crate) struct ConnDomain {
    pub(crate) state: ConnectState,
    peer_sun_path: Option<SunName>,
    peer_cred: Credentials,
}

struct IoDomain {
    pipe: Option<crate::pipe::PipeHandle>,
}

pub(crate) struct Shared {
    socket_type: SocketType,
    unique_id: u64,
    pipe_path: Mutex<Option<String>>,
    bind: RwLock<BindDomain>,
    pub(crate) conn: RwLock<ConnDomain>,
    io: RwLock<IoDomain>,
    pub(crate) so_error: AtomicI32,
    nonblocking: AtomicBool,
    close_on_exec: AtomicBool,
    reuseaddr: AtomicBool,
    rcvbuf: AtomicUsize,
    sndbuf: AtomicUsize,
    rcvtimeo_ms: AtomicU32,
    sndtimeo_ms: AtomicU32,
    signal: Event,
}

/// An AF_UNIX socket emulated over a message-mode named pipe.
pub struct UnixSocket {
    shared: Arc<Shared>,
    waiter: Mutex<Option<ConnectWaiter>>,
}

impl UnixSocket {
    /// The `socket(2)` entry point. Only `SOCK_STREAM` and `SOCK_DGRAM`
    /// are supported, with the usual `SOCK_NONBLOCK`/`SOCK_CLOEXEC` flags;
    /// the protocol must be 0.
    pub fn socket(type_: c_int, protocol: c_int, flags: c_int) -> Result<Self, Errno> {
        let socket_type = SocketType::from_raw(type_).ok_or(Errno::EINVAL)?;
        if protocol != 0 {
            return Err(Errno::EPROTONOSUPPORT);
        }
        Ok(Self::build(
            socket_type,
            flags & libc::SOCK_NONBLOCK != 0,
            flags & libc::SOCK_CLOEXEC != 0,
        ))
    }

    /// Typed convenience constructor.
    pub fn new(socket_type: SocketType) -> Self {
        Self::build(socket_type, false, false)
    }

    fn build(socket_type: SocketType, nonblocking: bool, close_on_exec: bool) -> Self {
        Self {
            shared: Arc::new(Shared {
                socket_type,
                unique_id: pipe_name::next_unique_id(),
                pipe_path: Mutex::new(None),
                bind: RwLock::new(BindDomain {
                    state: BindingState::Unbound,
                    sun_path: None,
                    backing: None,
                }),
                conn: RwLock::new(ConnDomain {
                    state: ConnectState::Unconnected,
                    peer_sun_path: None,
                    peer_cred: Credentials::default(),
                }),
                io: RwLock::new(IoDomain { pipe: None }),
                so_error: AtomicI32::new(0),
                nonblocking: AtomicBool::new(nonblocking),
                close_on_exec: AtomicBool::new(close_on_exec),
                reuseaddr: AtomicBool::new(false),
                rcvbuf: AtomicUsize::new(DEFAULT_BUF_SIZE),
                sndbuf: AtomicUsize::new(DEFAULT_BUF_SIZE),
                rcvtimeo_ms: AtomicU32::new(0),
                sndtimeo_ms: AtomicU32::new(0),
                signal: Event::new(),
            }),
            waiter: Mutex::new(None),
        }
    }

    /// `socketpair(2)`: validated, then refused like the rest of the
    /// unsupported payload surface.
    pub fn socketpair(
        type_: c_int,
        protocol: c_int,
        _flags: c_int,
    ) -> Result<(Self, Self), Errno> {
        if SocketType::from_raw(type_).is_none() {
            return Err(Errno::EINVAL);
        }
        if protocol != 0 {
            return Err(Errno::EPROTONOSUPPORT);
        }
        Err(Errno::EAFNOSUPPORT)
    }

    pub fn socket_type(&self) -> SocketType {
        self.shared.socket_type
    }

    /// The inode-like identity of this socket.
    pub fn ino(&self) -> u64 {
        self.shared.unique_id
    }

    pub fn binding_state(&self) -> BindingState {
        self.shared.bind.read().unwrap().state
    }

    pub fn connect_state(&self) -> ConnectState {
        self.shared.conn.read().unwrap().state
    }

    pub fn is_nonblocking(&self) -> bool {
        self.shared.nonblocking.load(Ordering::SeqCst)
    }

    /// Flip the socket's blocking mode. The flag on the socket is
    /// authoritative; the pipe's completion mode is a cache refreshed here
    /// and around announcement writes.
    pub fn set_nonblocking(&self, nonblocking: bool) {
        let was = self.shared.nonblocking.swap(nonblocking, Ordering::SeqCst);
        if was != nonblocking {
            let io = self.shared.io.read().unwrap();
            if let Some(pipe) = io.pipe.as_ref() {
                pipe.set_nonblocking(nonblocking);
            }
        }
    }

    pub fn close_on_exec(&self) -> bool {
        self.shared.close_on_exec.load(Ordering::SeqCst)
    }

    /// The backing publication handle follows the descriptor flag.
    pub fn set_close_on_exec(&self, close_on_exec: bool) {
        self.shared
            .close_on_exec
            .store(close_on_exec, Ordering::SeqCst);
    }

    /// A handle for interrupting this socket's blocking waits.
    pub fn interrupter(&self) -> Interrupter {
        Interrupter {
            signal: self.shared.signal.clone(),
        }
    }

    /// A token identifying the pipe instance currently backing this
    /// socket, if any. Distinct instances have distinct tokens.
    pub fn canonical_handle(&self) -> Option<usize> {
        self.shared
            .io
            .read()
            .unwrap()
            .pipe
            .as_ref()
            .map(|pipe| pipe.canonical_handle())
    }

    /// `bind(2)`. Generates the canonical pipe name, publishes the address
    /// (autobinding an unnamed one), and on datagram sockets creates the
    /// single pipe instance. A bind on an already-connected socket
    /// announces the new name to the peer.
    pub fn bind(&self, name: &SunName) -> Result<(), Errno> {
        if name.family() != libc::AF_UNIX as libc::sa_family_t {
            return Err(Errno::EINVAL);
        }
        {
            let mut bind = self.shared.bind.write().unwrap();
            match bind.state {
                BindingState::BindPending => return Err(Errno::EALREADY),
                BindingState::Bound => return Err(Errno::EINVAL),
                BindingState::Unbound => bind.state = BindingState::BindPending,
            }
        }
        match self.bind_pending(name) {
            Ok(()) => {
                self.shared.bind.write().unwrap().state = BindingState::Bound;
                Ok(())
            }
            Err(err) => {
                self.shared.bind.write().unwrap().state = BindingState::Unbound;
                Err(err)
            }
        }
    }

    /// The body of `bind` while the state is pending.
    fn bind_pending(&self, name: &SunName) -> Result<(), Errno> {
        let pipe_path = pipe_name::pipe_name(self.shared.socket_type, self.shared.unique_id);
        *self.shared.pipe_path.lock().unwrap() = Some(pipe_path.clone());

        // a datagram socket is its own single-instance server
        let mut created_pipe = false;
        if self.shared.socket_type == SocketType::Dgram {
            match device().create(&pipe_path, &self.shared.pipe_create_options()) {
                Ok(handle) => {
                    self.shared.io.write().unwrap().pipe = Some(handle);
                    created_pipe = true;
                }
                Err(status) => return Err(status.to_errno()),
            }
        }

        let published = if name.is_unnamed() {
            ns::autobind(&pipe_path)
        } else {
            ns::publish(name, &pipe_path).map(|backing| (*name, backing))
        };
        let (sun, backing) = match published {
            Ok(result) => result,
            Err(err) => {
                if created_pipe {
                    self.shared.io.write().unwrap().pipe = None;
                }
                return Err(err);
            }
        };
        {
            let mut bind = self.shared.bind.write().unwrap();
            bind.sun_path = Some(sun);
            bind.backing = Some(backing);
        }
        // late bind on a connected socket: tell the peer who we are now
        if self.shared.conn.read().unwrap().state == ConnectState::Connected {
            self.shared.send_my_name();
        }
        Ok(())
    }

    /// `listen(2)`. The backlog is accepted for compatibility; a listener
    /// keeps exactly one unconnected instance pending at a time.
    pub fn listen(&self, _backlog: c_int) -> Result<(), Errno> {
        if self.shared.socket_type == SocketType::Dgram {
            return Err(Errno::EOPNOTSUPP);
        }
        // wait out a bind in flight on another thread
        loop {
            let bind = self.shared.bind.read().unwrap();
            match bind.state {
                BindingState::BindPending => {
                    drop(bind);
                    std::thread::yield_now();
                }
                BindingState::Unbound => return Err(Errno::EDESTADDRREQ),
                BindingState::Bound => break,
            }
        }
        let mut conn = self.shared.conn.write().unwrap();
        match conn.state {
            ConnectState::Unconnected | ConnectState::ConnectFailed => {}
            ConnectState::Listener => return Err(Errno::EADDRINUSE),
            _ => return Err(Errno::EINVAL),
        }
        let pipe_path = self
            .shared
            .pipe_path
            .lock()
            .unwrap()
            .clone()
            .ok_or(Errno::EINVAL)?;
        match device().create(&pipe_path, &self.shared.pipe_create_options()) {
            Ok(handle) => {
                self.shared.io.write().unwrap().pipe = Some(handle);
                conn.state = ConnectState::Listener;
                Ok(())
            }
            Err(status) => {
                conn.state = ConnectState::Unconnected;
                Err(status.to_errno())
            }
        }
    }

    /// `connect(2)`. Resolves the peer address, checks the advertised
    /// type, and for stream sockets opens the peer's pipe, falling back to
    /// the background waiter when every instance is busy. In non-blocking
    /// mode the wait surfaces as `EINPROGRESS` and the outcome lands in
    /// `SO_ERROR`.
    pub fn connect(&self, name: &SunName) -> Result<(), Errno> {
        {
            let mut conn = self.shared.conn.write().unwrap();
            match conn.state {
                ConnectState::ConnectPending => return Err(Errno::EALREADY),
                ConnectState::Listener => return Err(Errno::EADDRINUSE),
                ConnectState::Connected if self.shared.socket_type != SocketType::Dgram => {
                    return Err(Errno::EISCONN)
                }
                _ => conn.state = ConnectState::ConnectPending,
            }
        }
        // ordering errors above, shape errors here
        if name.path_bytes().is_empty() {
            return self.fail_connect_validation(Errno::EINVAL);
        }
        if name.family() != libc::AF_UNIX as libc::sa_family_t {
            return self.fail_connect_validation(Errno::EAFNOSUPPORT);
        }
        if name.is_degenerate() {
            return self.fail_connect_validation(Errno::EINVAL);
        }
        let (peer_type, pipe_path) = match ns::resolve(name, &[&self.shared.signal]) {
            Ok(resolved) => resolved,
            Err(err) => return self.fail_connect_validation(err),
        };
        if peer_type != self.shared.socket_type {
            return self.fail_connect_validation(Errno::EINVAL);
        }
        self.shared.conn.write().unwrap().peer_sun_path = Some(*name);

        if self.shared.socket_type == SocketType::Stream {
            if let Err(err) = self.connect_pipe(pipe_path) {
                if err != Errno::EINPROGRESS {
                    let mut conn = self.shared.conn.write().unwrap();
                    conn.peer_sun_path = None;
                    conn.state = ConnectState::ConnectFailed;
                }
                return Err(err);
            }
        }
        self.shared.conn.write().unwrap().state = ConnectState::Connected;
        Ok(())
    }

    /// Roll a failed argument check back to `Unconnected`.
    fn fail_connect_validation(&self, err: Errno) -> Result<(), Errno> {
        self.shared.conn.write().unwrap().state = ConnectState::Unconnected;
        Err(err)
    }

    /// Try the peer pipe directly; hand busy pipes to the waiter.
    fn connect_pipe(&self, pipe_path: String) -> Result<(), Errno> {
        let status = self.shared.open_pipe(&pipe_path);
        if status.no_instance_available() {
            return self.wait_pipe(pipe_path);
        }
        if !status.is_success() {
            let err = status.to_errno();
            self.shared.so_error.store(err as i32, Ordering::SeqCst);
            return Err(err);
        }
        self.shared.so_error.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// Spawn the connect waiter. Blocking mode parks on it with signal
    /// wake-up; non-blocking mode reports `EINPROGRESS`.
    fn wait_pipe(&self, pipe_path: String) -> Result<(), Errno> {
        let waiter = ConnectWaiter::spawn(Arc::clone(&self.shared), pipe_path)?;
        let (done, termination, error) = (
            waiter.done.clone(),
            waiter.termination.clone(),
            Arc::clone(&waiter.error),
        );
        {
            let mut slot = self.waiter.lock().unwrap();
            if let Some(stale) = slot.take() {
                stale.shutdown();
            }
            *slot = Some(waiter);
        }
        if self.is_nonblocking() {
            return Err(Errno::EINPROGRESS);
        }
        match wait_any(&[&done, &self.shared.signal], None) {
            WaitVerdict::Event(0) => {
                if let Some(finished) = self.waiter.lock().unwrap().take() {
                    finished.shutdown();
                }
                match error.load(Ordering::SeqCst) {
                    0 => Ok(()),
                    err => Err(Errno::from_i32(err)),
                }
            }
            _ => {
                // signal delivery: cancel the worker and join it before
                // returning, then consume the interrupt
                termination.set();
                if let Some(cancelled) = self.waiter.lock().unwrap().take() {
                    cancelled.shutdown();
                }
                self.shared.signal.reset();
                Err(Errno::EINTR)
            }
        }
    }

    /// `accept(2)`/`accept4(2)`. Waits for a client on the current
    /// instance, replaces it with a fresh one, and hands the connected
    /// instance to the accepted socket, which then reads the client's
    /// name announcement. Returns the accepted socket and the peer address
    /// it announced (unnamed if the peer is unbound).
    pub fn accept(&self, flags: c_int) -> Result<(UnixSocket, SunName), Errno> {
        if self.shared.socket_type != SocketType::Stream {
            return Err(Errno::EOPNOTSUPP);
        }
        if self.shared.conn.read().unwrap().state != ConnectState::Listener {
            return Err(Errno::EINVAL);
        }
        let listener = {
            let io = self.shared.io.read().unwrap();
            io.pipe.as_ref().cloned().ok_or(Errno::EINVAL)?
        };
        match listener.listen(&[&self.shared.signal]) {
            PipeWait::Complete(status) if status.is_success() => {}
            PipeWait::Complete(PipeStatus::PipeListening) => return Err(Errno::EAGAIN),
            PipeWait::Complete(status) => return Err(status.to_errno()),
            PipeWait::Cancelled(_) => {
                self.shared.signal.reset();
                return Err(Errno::EINTR);
            }
            PipeWait::TimedOut => return Err(Errno::EIO),
        }
        drop(listener);

        let pipe_path = self
            .shared
            .pipe_path
            .lock()
            .unwrap()
            .clone()
            .ok_or(Errno::EINVAL)?;

        // swap the connected instance out and a fresh one in, atomically
        // with respect to other I/O
        let accepted = {
            let mut io = self.shared.io.write().unwrap();
            let accepted = io.pipe.take().ok_or(Errno::EINVAL)?;
            match device().create_instance(&pipe_path, &self.shared.pipe_create_options()) {
                Ok(fresh) => {
                    io.pipe = Some(fresh);
                    accepted
                }
                Err(_) => {
                    // we cannot serve more clients; cut this one loose so it
                    // sees an immediate close rather than silence
                    accepted.disconnect();
                    io.pipe = Some(accepted);
                    return Err(Errno::ENOBUFS);
                }
            }
        };

        let child = self.build_accepted(flags, &pipe_path, accepted);
        match child.recv_peer_name() {
            Ok(()) => {
                let peer = child.getpeername();
                Ok((child, peer))
            }
            Err(err) => {
                let io = child.shared.io.read().unwrap();
                if let Some(pipe) = io.pipe.as_ref() {
                    pipe.disconnect();
                }
                Err(err)
            }
        }
    }

    /// Clone the listener's identity into a freshly accepted socket.
    fn build_accepted(
        &self,
        flags: c_int,
        pipe_path: &str,
        accepted: crate::pipe::PipeHandle,
    ) -> UnixSocket {
        let parent_bind = self.shared.bind.read().unwrap();
        UnixSocket {
            shared: Arc::new(Shared {
                socket_type: self.shared.socket_type,
                unique_id: pipe_name::next_unique_id(),
                pipe_path: Mutex::new(Some(pipe_path.to_owned())),
                bind: RwLock::new(BindDomain {
                    state: parent_bind.state,
                    sun_path: parent_bind.sun_path,
                    // the listener owns the published name, not the child
                    backing: None,
                }),
                conn: RwLock::new(ConnDomain {
                    state: ConnectState::Connected,
                    peer_sun_path: None,
                    peer_cred: Credentials::default(),
                }),
                io: RwLock::new(IoDomain {
                    pipe: Some(accepted),
                }),
                so_error: AtomicI32::new(0),
                nonblocking: AtomicBool::new(flags & libc::SOCK_NONBLOCK != 0),
                close_on_exec: AtomicBool::new(flags & libc::SOCK_CLOEXEC != 0),
                reuseaddr: AtomicBool::new(false),
                rcvbuf: AtomicUsize::new(self.shared.rcvbuf.load(Ordering::SeqCst)),
                sndbuf: AtomicUsize::new(self.shared.sndbuf.load(Ordering::SeqCst)),
                rcvtimeo_ms: AtomicU32::new(0),
                sndtimeo_ms: AtomicU32::new(0),
                signal: Event::new(),
            }),
            waiter: Mutex::new(None),
        }
    }

    /// Read the peer's one name announcement after an accept. Runs before
    /// the accepted socket is visible to anyone, so no locking beyond the
    /// handle itself.
    fn recv_peer_name(&self) -> Result<(), Errno> {
        let handle = {
            let io = self.shared.io.read().unwrap();
            io.pipe.as_ref().cloned().ok_or(Errno::ENOTCONN)?
        };
        handle.set_nonblocking(false);
        let mut buf = [0u8; HEADER_LEN + SUN_LEN_MAX];
        let deadline = Instant::now() + CONNECT_TIMEOUT;
        let (wait, len) = handle.read_message(&mut buf, Some(deadline), &[&self.shared.signal]);
        let result = match wait {
            PipeWait::Complete(PipeStatus::Success) => {
                Packet::parse(buf[..len].to_vec()).and_then(|packet| {
                    if let Some(peer) = packet.name()? {
                        self.shared.conn.write().unwrap().peer_sun_path = Some(peer);
                    }
                    Ok(())
                })
            }
            PipeWait::Complete(status) => Err(status.to_errno()),
            PipeWait::TimedOut => Err(Errno::ECONNABORTED),
            PipeWait::Cancelled(_) => {
                self.shared.signal.reset();
                Err(Errno::EINTR)
            }
        };
        handle.set_nonblocking(self.shared.nonblocking.load(Ordering::SeqCst));
        result
    }

    /// `getsockname(2)`: the bound address, byte for byte, or the unnamed
    /// address when unbound.
    pub fn getsockname(&self) -> SunName {
        self.shared
            .bind
            .read()
            .unwrap()
            .sun_path
            .unwrap_or_else(SunName::new_unnamed)
    }

    /// `getpeername(2)`: the connected peer's address, or the unnamed
    /// address when the peer never bound (or nothing is connected).
    ///
    /// A peer that binds after connecting announces its new name; any such
    /// announcement still sitting in the pipe is consumed here first.
    pub fn getpeername(&self) -> SunName {
        self.refresh_peer_name();
        self.shared
            .conn
            .read()
            .unwrap()
            .peer_sun_path
            .unwrap_or_else(SunName::new_unnamed)
    }

    /// Drain queued name announcements from a connected stream pipe. The
    /// payload path is not implemented for this family, so announcements
    /// are the only packets that can be waiting.
    fn refresh_peer_name(&self) {
        if self.shared.socket_type != SocketType::Stream
            || self.shared.conn.read().unwrap().state != ConnectState::Connected
        {
            return;
        }
        let mut announced = None;
        {
            let io = self.shared.io.write().unwrap();
            let Some(pipe) = io.pipe.as_ref() else {
                return;
            };
            pipe.set_nonblocking(true);
            let mut buf = [0u8; HEADER_LEN + SUN_LEN_MAX];
            loop {
                let (wait, len) = pipe.read_message(&mut buf, None, &[]);
                let PipeWait::Complete(PipeStatus::Success) = wait else {
                    break;
                };
                match Packet::parse(buf[..len].to_vec()).and_then(|p| p.name()) {
                    Ok(Some(name)) => announced = Some(name),
                    Ok(None) => {}
                    Err(err) => {
                        log::debug!("discarding unparseable packet: {err}");
                        break;
                    }
                }
            }
            pipe.set_nonblocking(self.shared.nonblocking.load(Ordering::SeqCst));
        }
        if let Some(name) = announced {
            self.shared.conn.write().unwrap().peer_sun_path = Some(name);
        }
    }

    /// Peer credentials of a connected stream socket.
    pub fn getpeereid(&self) -> Result<Credentials, Errno> {
        if self.shared.socket_type != SocketType::Stream {
            return Err(Errno::EINVAL);
        }
        let conn = self.shared.conn.read().unwrap();
        if conn.state != ConnectState::Connected {
            return Err(Errno::ENOTCONN);
        }
        Ok(conn.peer_cred)
    }

    /// `dup(2)`: a deep copy with fresh locks and no waiter; addresses are
    /// copied, the pipe handle and the published name are shared.
    pub fn dup(&self) -> UnixSocket {
        let bind = self.shared.bind.read().unwrap();
        let conn = self.shared.conn.read().unwrap();
        let io = self.shared.io.read().unwrap();
        UnixSocket {
            shared: Arc::new(Shared {
                socket_type: self.shared.socket_type,
                unique_id: self.shared.unique_id,
                pipe_path: Mutex::new(self.shared.pipe_path.lock().unwrap().clone()),
                bind: RwLock::new(BindDomain {
                    state: bind.state,
                    sun_path: bind.sun_path,
                    backing: bind.backing.clone(),
                }),
                conn: RwLock::new(ConnDomain {
                    state: conn.state,
                    peer_sun_path: conn.peer_sun_path,
                    peer_cred: conn.peer_cred,
                }),
                io: RwLock::new(IoDomain {
                    pipe: io.pipe.clone(),
                }),
                so_error: AtomicI32::new(self.shared.so_error.load(Ordering::SeqCst)),
                nonblocking: AtomicBool::new(self.is_nonblocking()),
                close_on_exec: AtomicBool::new(self.close_on_exec()),
                reuseaddr: AtomicBool::new(self.shared.reuseaddr.load(Ordering::SeqCst)),
                rcvbuf: AtomicUsize::new(self.shared.rcvbuf.load(Ordering::SeqCst)),
                sndbuf: AtomicUsize::new(self.shared.sndbuf.load(Ordering::SeqCst)),
                rcvtimeo_ms: AtomicU32::new(self.shared.rcvtimeo_ms.load(Ordering::SeqCst)),
                sndtimeo_ms: AtomicU32::new(self.shared.sndtimeo_ms.load(Ordering::SeqCst)),
                signal: Event::new(),
            }),
            waiter: Mutex::new(None),
        }
    }

    /// Fork fixup, to run in the child: the waiter thread does not exist
    /// there, and locks must never be inherited live. The backing handle
    /// here is a path, not a descriptor, so it survives the fork as-is.
    pub fn fixup_after_fork(&mut self) {
        if let Some(ghost) = self.waiter.get_mut().unwrap().take() {
            ghost.abandon();
        }
        let rebuilt = self.dup();
        *self = rebuilt;
    }

    /// Exec fixup: a close-on-exec socket releases both the pipe handle
    /// and the backing publication.
    pub fn fixup_after_exec(&self) {
        if self.close_on_exec() {
            self.shared.io.write().unwrap().pipe = None;
            self.shared.bind.write().unwrap().backing = None;
        }
    }

    /// `shutdown(2)`: the wire format reserves the header bits, but the
    /// state-machine consequences are not implemented for this family yet.
    pub fn shutdown(&self, _how: c_int) -> Result<(), Errno> {
        Err(Errno::EAFNOSUPPORT)
    }

    /// `sendmsg(2)`: payload transfer is not implemented for this family
    /// yet; only the connection machinery and framing are.
    pub fn sendmsg(
        &self,
        _iov: &[std::io::IoSlice<'_>],
        _control: &[u8],
        _flags: c_int,
        _to: Option<&SunName>,
    ) -> Result<usize, Errno> {
        Err(Errno::EAFNOSUPPORT)
    }

    /// `recvmsg(2)`: see [`Self::sendmsg`].
    pub fn recvmsg(
        &self,
        _iov: &mut [std::io::IoSliceMut<'_>],
        _control: &mut [u8],
        _flags: c_int,
    ) -> Result<(usize, Option<SunName>), Errno> {
        Err(Errno::EAFNOSUPPORT)
    }

    /// `sendto(2)` veneer over [`Self::sendmsg`].
    pub fn sendto(
        &self,
        buf: &[u8],
        flags: c_int,
        to: Option<&SunName>,
    ) -> Result<usize, Errno> {
        self.sendmsg(&[std::io::IoSlice::new(buf)], &[], flags, to)
    }

    /// `recvfrom(2)` veneer over [`Self::recvmsg`].
    pub fn recvfrom(
        &self,
        buf: &mut [u8],
        flags: c_int,
    ) -> Result<(usize, Option<SunName>), Errno> {
        self.recvmsg(&mut [std::io::IoSliceMut::new(buf)], &mut [], flags)
    }

    /// `write(2)` veneer over [`Self::sendmsg`].
    pub fn write(&self, buf: &[u8]) -> Result<usize, Errno> {
        self.sendto(buf, 0, None)
    }

    /// `read(2)` veneer over [`Self::recvmsg`].
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, Errno> {
        self.recvfrom(buf, 0).map(|(len, _)| len)
    }

    /// `writev(2)` veneer over [`Self::sendmsg`].
    pub fn writev(&self, iov: &[std::io::IoSlice<'_>]) -> Result<usize, Errno> {
        self.sendmsg(iov, &[], 0, None)
    }

    /// `readv(2)` veneer over [`Self::recvmsg`].
    pub fn readv(&self, iov: &mut [std::io::IoSliceMut<'_>]) -> Result<usize, Errno> {
        self.recvmsg(iov, &mut [], 0).map(|(len, _)| len)
    }
}

impl Shared {
    /// Pipe creation parameters for this socket: single instance for
    /// datagram, unlimited for stream, queues sized from the socket
    /// buffers.
    fn pipe_create_options(&self) -> CreateOptions {
        CreateOptions {
            max_instances: match self.socket_type {
                SocketType::Dgram => Some(1),
                SocketType::Stream => None,
            },
            nonblocking: self.nonblocking.load(Ordering::SeqCst),
            in_quota: self.rcvbuf.load(Ordering::SeqCst),
            out_quota: self.sndbuf.load(Ordering::SeqCst),
        }
    }

    /// Open the peer's pipe by name. On success the handle becomes this
    /// socket's transport and the local name is announced immediately.
    pub(crate) fn open_pipe(&self, pipe_path: &str) -> PipeStatus {
        match device().open(pipe_path, self.nonblocking.load(Ordering::SeqCst)) {
            Ok(handle) => {
                self.io.write().unwrap().pipe = Some(handle);
                self.send_my_name();
                PipeStatus::Success
            }
            Err(status) => status,
        }
    }

    /// Fire-and-forget announcement of the local name. The mode flip and
    /// the write happen under the exclusive I/O lock so no concurrent
    /// operation can observe the temporary non-blocking mode; failure is
    /// logged and ignored.
    pub(crate) fn send_my_name(&self) {
        let sun = self.bind.read().unwrap().sun_path;
        let packet = Packet::announcement(sun.as_ref());
        let io = self.io.write().unwrap();
        if let Some(pipe) = io.pipe.as_ref() {
            pipe.set_nonblocking(true);
            let wait = pipe.write_message(packet.as_bytes(), None, &[]);
            if wait != PipeWait::Complete(PipeStatus::Success) {
                log::debug!("couldn't announce local name: {wait:?}");
            }
            pipe.set_nonblocking(self.nonblocking.load(Ordering::SeqCst));
        }
    }
}

impl Drop for UnixSocket {
    fn drop(&mut self) {
        // cancel and join a racing connect waiter exactly once; handles and
        // the published name fall with the shared state
        if let Some(waiter) = self.waiter.get_mut().unwrap().take() {
            waiter.shutdown();
        }
    }
}

impl std::fmt::Debug for UnixSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnixSocket")
            .field("type", &self.shared.socket_type)
            .field("ino", &self.shared.unique_id)
            .field("binding", &self.binding_state())
            .field("connect", &self.connect_state())
            .finish()
    }
}
