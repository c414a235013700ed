//! The named-pipe device.
//!
//! This module is the small subset of a message-mode named-pipe device that
//! the socket layer depends on: named pipes made of instances, each instance
//! a bidirectional pair of message queues between a server end and a client
//! end. Servers create pipes and instances, listen for a client, and can
//! disconnect an instance to reuse it; clients open a free instance by name
//! or wait for one to appear. Blocking behavior is governed by a per-handle
//! completion mode that can be toggled on the fly.
//!
//! The device is process-wide and lazily initialized; pipe names are only
//! meaningful within it. Callers never interpret device status codes
//! themselves: [`PipeStatus::to_errno`] is the one translation point.

pub mod name;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use once_cell::sync::OnceCell;

use crate::util::sync::{wait_any, Event, WaitVerdict};

/// Default wait-for-instance timeout a pipe is created with.
pub const DEFAULT_PIPE_TIMEOUT: Duration = Duration::from_millis(50);

/// Completion status of a device operation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PipeStatus {
    Success,
    /// Listen completed because a client is attached.
    PipeConnected,
    /// Non-blocking listen found no client yet.
    PipeListening,
    /// No message available on a non-blocking read.
    PipeEmpty,
    /// A message was delivered but truncated into a short buffer.
    MoreData,
    /// The instance was disconnected under this handle.
    PipeDisconnected,
    /// The other end of the instance is gone.
    PipeClosing,
    /// The write quota is exhausted on a non-blocking handle.
    WriteQuotaExceeded,
    /// Every instance of the pipe already has a client.
    InstanceNotAvailable,
    /// Same family as [`Self::InstanceNotAvailable`]; reported by opens that
    /// lose a race for the last free instance.
    PipeBusy,
    ObjectNameNotFound,
    ObjectNameCollision,
    IoTimeout,
    InsufficientResources,
    /// A wait was abandoned because its termination event fired.
    ThreadTerminating,
    /// The operation is not valid for this end of the pipe.
    InvalidDeviceRequest,
}

impl PipeStatus {
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success | Self::PipeConnected)
    }

    /// The "no instance available" family. Several distinct codes mean the
    /// same thing to a connecting client: the pipe exists, come back later.
    pub fn no_instance_available(self) -> bool {
        matches!(self, Self::InstanceNotAvailable | Self::PipeBusy)
    }

    /// The authoritative status-to-errno translation. Callers map through
    /// this instead of inspecting device codes.
    pub fn to_errno(self) -> Errno {
        match self {
            Self::Success | Self::PipeConnected => Errno::UnknownErrno,
            Self::PipeListening | Self::PipeEmpty => Errno::EAGAIN,
            Self::MoreData => Errno::EMSGSIZE,
            Self::PipeDisconnected => Errno::EPIPE,
            Self::PipeClosing => Errno::ECONNRESET,
            Self::WriteQuotaExceeded => Errno::EAGAIN,
            Self::InstanceNotAvailable | Self::PipeBusy => Errno::EBUSY,
            Self::ObjectNameNotFound => Errno::ENOENT,
            Self::ObjectNameCollision => Errno::EEXIST,
            Self::IoTimeout => Errno::ETIMEDOUT,
            Self::InsufficientResources => Errno::ENOBUFS,
            Self::ThreadTerminating => Errno::EINTR,
            Self::InvalidDeviceRequest => Errno::EINVAL,
        }
    }
}

/// Outcome of a blocking device operation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PipeWait {
    /// The operation ran to a completion status.
    Complete(PipeStatus),
    /// The deadline passed first.
    TimedOut,
    /// The cancel event at this index in the caller's set fired first.
    Cancelled(usize),
}

/// Creation parameters for a pipe or an additional instance.
#[derive(Clone, Debug)]
pub struct CreateOptions {
    /// Instance cap; `None` is unlimited. Datagram pipes use 1.
    pub max_instances: Option<u32>,
    /// Initial completion mode of the returned handle.
    pub nonblocking: bool,
    /// Byte quota of the inbound (client-to-server) queue.
    pub in_quota: usize,
    /// Byte quota of the outbound (server-to-client) queue.
    pub out_quota: usize,
}

struct MsgQueue {
    messages: VecDeque<Vec<u8>>,
    bytes: usize,
    quota: usize,
}

impl MsgQueue {
    fn new(quota: usize) -> Self {
        Self {
            messages: VecDeque::new(),
            bytes: 0,
            quota: quota.max(1),
        }
    }

    fn has_room_for(&self, len: usize) -> bool {
        // a message larger than the whole quota is accepted into an empty
        // queue so it cannot wedge forever
        self.messages.is_empty() || self.bytes + len <= self.quota
    }

    fn clear(&mut self) {
        self.messages.clear();
        self.bytes = 0;
    }
}

struct InstanceInner {
    /// Bumped on every disconnect; client handles carry the value they were
    /// opened under and go stale when it moves on.
    session: u64,
    client_attached: bool,
    client_open: bool,
    server_handles: u32,
    client_handles: u32,
    to_server: MsgQueue,
    to_client: MsgQueue,
}

struct Instance {
    state: Mutex<InstanceInner>,
    /// Set while a client is attached.
    connected: Event,
    /// Readability of the to-server queue (or a state the server must see).
    srv_readable: Event,
    /// Readability of the to-client queue (or a state the client must see).
    cli_readable: Event,
    /// Room in the server's outgoing queue.
    srv_writable: Event,
    /// Room in the client's outgoing queue.
    cli_writable: Event,
}

impl Instance {
    fn new(opts: &CreateOptions) -> Arc<Self> {
        let inst = Arc::new(Self {
            state: Mutex::new(InstanceInner {
                session: 0,
                client_attached: false,
                client_open: false,
                server_handles: 1,
                client_handles: 0,
                to_server: MsgQueue::new(opts.in_quota),
                to_client: MsgQueue::new(opts.out_quota),
            }),
            connected: Event::new(),
            srv_readable: Event::new(),
            cli_readable: Event::new(),
            srv_writable: Event::new(),
            cli_writable: Event::new(),
        });
        inst.srv_writable.set();
        inst.cli_writable.set();
        inst
    }
}

struct EntryInner {
    instances: Vec<Arc<Instance>>,
}

struct PipeEntry {
    name: String,
    max_instances: Option<u32>,
    // Stored for fidelity with pipe creation; waits always carry their own
    // timeout in this crate.
    #[allow(dead_code)]
    default_timeout: Duration,
    inner: Mutex<EntryInner>,
    /// Set while some instance can take a client.
    available: Event,
}

impl PipeEntry {
    /// Recompute the availability event from the instance list.
    fn refresh_available(&self) {
        let inner = self.inner.lock().unwrap();
        let free = inner.instances.iter().any(|inst| {
            let st = inst.state.lock().unwrap();
            st.server_handles > 0 && !st.client_attached
        });
        drop(inner);
        if free {
            self.available.set();
        } else {
            self.available.reset();
        }
    }
}

/// Which end of an instance a handle refers to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum End {
    Server,
    Client,
}

/// A handle to one end of one pipe instance. Cloning duplicates the handle
/// (both must be dropped before the end counts as closed).
pub struct PipeHandle {
    entry: Arc<PipeEntry>,
    instance: Arc<Instance>,
    end: End,
    session: u64,
    nonblocking: AtomicBool,
}

/// The process-wide pipe device.
pub struct PipeDevice {
    entries: Mutex<HashMap<String, Arc<PipeEntry>>>,
}

/// The device singleton. Lockless after first call.
pub fn device() -> &'static PipeDevice {
    static DEVICE: OnceCell<PipeDevice> = OnceCell::new();
    DEVICE.get_or_init(|| PipeDevice {
        entries: Mutex::new(HashMap::new()),
    })
}

impl PipeDevice {
    /// Create the first instance of a pipe. The name must not exist yet.
    pub fn create(&self, name: &str, opts: &CreateOptions) -> Result<PipeHandle, PipeStatus> {
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(name) {
            return Err(PipeStatus::ObjectNameCollision);
        }
        let entry = Arc::new(PipeEntry {
            name: name.to_owned(),
            max_instances: opts.max_instances,
            default_timeout: DEFAULT_PIPE_TIMEOUT,
            inner: Mutex::new(EntryInner {
                instances: Vec::new(),
            }),
            available: Event::new(),
        });
        let instance = Instance::new(opts);
        entry.inner.lock().unwrap().instances.push(Arc::clone(&instance));
        entry.available.set();
        entries.insert(name.to_owned(), Arc::clone(&entry));
        Ok(PipeHandle {
            entry,
            instance,
            end: End::Server,
            session: 0,
            nonblocking: AtomicBool::new(opts.nonblocking),
        })
    }

    /// Create an additional instance of an existing pipe.
    pub fn create_instance(
        &self,
        name: &str,
        opts: &CreateOptions,
    ) -> Result<PipeHandle, PipeStatus> {
        let entry = self.lookup(name).ok_or(PipeStatus::ObjectNameNotFound)?;
        let instance = {
            let mut inner = entry.inner.lock().unwrap();
            if let Some(max) = entry.max_instances {
                if inner.instances.len() as u32 >= max {
                    return Err(PipeStatus::InstanceNotAvailable);
                }
            }
            let instance = Instance::new(opts);
            inner.instances.push(Arc::clone(&instance));
            instance
        };
        entry.available.set();
        Ok(PipeHandle {
            entry,
            instance,
            end: End::Server,
            session: 0,
            nonblocking: AtomicBool::new(opts.nonblocking),
        })
    }

    /// Open the client end of a free instance.
    pub fn open(&self, name: &str, nonblocking: bool) -> Result<PipeHandle, PipeStatus> {
        let entry = self.lookup(name).ok_or(PipeStatus::ObjectNameNotFound)?;
        let attached = {
            let inner = entry.inner.lock().unwrap();
            let mut found = None;
            for instance in inner.instances.iter() {
                let mut st = instance.state.lock().unwrap();
                if st.server_handles > 0 && !st.client_attached {
                    st.client_attached = true;
                    st.client_open = true;
                    st.client_handles = 1;
                    found = Some((Arc::clone(instance), st.session));
                    break;
                }
            }
            found
        };
        let Some((instance, session)) = attached else {
            return Err(PipeStatus::PipeBusy);
        };
        entry.refresh_available();
        instance.connected.set();
        Ok(PipeHandle {
            entry,
            instance,
            end: End::Client,
            session,
            nonblocking: AtomicBool::new(nonblocking),
        })
    }

    /// Wait until the named pipe has a free instance, the timeout elapses,
    /// or a cancel event fires.
    pub fn wait_for_instance(
        &self,
        name: &str,
        timeout: Duration,
        cancels: &[&Event],
    ) -> PipeWait {
        let deadline = Instant::now() + timeout;
        loop {
            let Some(entry) = self.lookup(name) else {
                return PipeWait::Complete(PipeStatus::ObjectNameNotFound);
            };
            {
                let inner = entry.inner.lock().unwrap();
                let free = inner.instances.iter().any(|inst| {
                    let st = inst.state.lock().unwrap();
                    st.server_handles > 0 && !st.client_attached
                });
                if free {
                    return PipeWait::Complete(PipeStatus::Success);
                }
            }
            let mut events: Vec<&Event> = Vec::with_capacity(1 + cancels.len());
            events.push(&entry.available);
            events.extend_from_slice(cancels);
            match wait_any(&events, Some(deadline)) {
                WaitVerdict::TimedOut => return PipeWait::TimedOut,
                WaitVerdict::Event(0) => continue,
                WaitVerdict::Event(i) => return PipeWait::Cancelled(i - 1),
            }
        }
    }

    fn lookup(&self, name: &str) -> Option<Arc<PipeEntry>> {
        self.entries.lock().unwrap().get(name).cloned()
    }

    fn remove_entry(&self, name: &str) {
        self.entries.lock().unwrap().remove(name);
    }
}

impl PipeHandle {
    /// Toggle the completion mode of this handle. The message read mode is
    /// fixed; only blocking behavior changes.
    pub fn set_nonblocking(&self, nonblocking: bool) {
        self.nonblocking.store(nonblocking, Ordering::SeqCst);
    }

    pub fn is_nonblocking(&self) -> bool {
        self.nonblocking.load(Ordering::SeqCst)
    }

    /// A token identifying the instance this handle refers to.
    pub fn canonical_handle(&self) -> usize {
        Arc::as_ptr(&self.instance) as usize
    }

    /// Wait for a client on this instance. Server end only. Completes with
    /// `PipeConnected` (possibly immediately); a non-blocking handle gets
    /// `PipeListening` when no client is pending.
    pub fn listen(&self, cancels: &[&Event]) -> PipeWait {
        if self.end != End::Server {
            return PipeWait::Complete(PipeStatus::InvalidDeviceRequest);
        }
        loop {
            {
                let st = self.instance.state.lock().unwrap();
                if st.client_attached {
                    return PipeWait::Complete(PipeStatus::PipeConnected);
                }
            }
            if self.is_nonblocking() {
                return PipeWait::Complete(PipeStatus::PipeListening);
            }
            let mut events: Vec<&Event> = Vec::with_capacity(1 + cancels.len());
            events.push(&self.instance.connected);
            events.extend_from_slice(cancels);
            match wait_any(&events, None) {
                WaitVerdict::TimedOut => unreachable!("no deadline"),
                WaitVerdict::Event(0) => continue,
                WaitVerdict::Event(i) => return PipeWait::Cancelled(i - 1),
            }
        }
    }

    /// Sever the client from this instance and make it reusable. Server end
    /// only. The former client's handles go stale immediately.
    pub fn disconnect(&self) -> PipeStatus {
        if self.end != End::Server {
            return PipeStatus::InvalidDeviceRequest;
        }
        {
            let mut st = self.instance.state.lock().unwrap();
            st.session += 1;
            st.client_attached = false;
            st.client_open = false;
            st.client_handles = 0;
            st.to_server.clear();
            st.to_client.clear();
        }
        self.instance.connected.reset();
        // wake any waiter of the old session so it observes the disconnect
        self.instance.srv_readable.reset();
        self.instance.cli_readable.set();
        self.instance.cli_writable.set();
        self.instance.srv_writable.set();
        self.entry.refresh_available();
        PipeStatus::Success
    }

    /// Write one message. A non-blocking handle reports
    /// `WriteQuotaExceeded` instead of waiting for room.
    pub fn write_message(
        &self,
        message: &[u8],
        deadline: Option<Instant>,
        cancels: &[&Event],
    ) -> PipeWait {
        let (outgoing_writable, peer_readable) = match self.end {
            End::Server => (&self.instance.srv_writable, &self.instance.cli_readable),
            End::Client => (&self.instance.cli_writable, &self.instance.srv_readable),
        };
        loop {
            {
                let mut st = self.instance.state.lock().unwrap();
                if let Some(status) = self.check_session(&st) {
                    return PipeWait::Complete(status);
                }
                let peer_open = match self.end {
                    End::Server => st.client_open,
                    End::Client => st.server_handles > 0,
                };
                if !peer_open {
                    return PipeWait::Complete(PipeStatus::PipeClosing);
                }
                let queue = match self.end {
                    End::Server => &mut st.to_client,
                    End::Client => &mut st.to_server,
                };
                if queue.has_room_for(message.len()) {
                    queue.bytes += message.len();
                    queue.messages.push_back(message.to_vec());
                    if queue.bytes >= queue.quota {
                        outgoing_writable.reset();
                    }
                    peer_readable.set();
                    return PipeWait::Complete(PipeStatus::Success);
                }
            }
            if self.is_nonblocking() {
                return PipeWait::Complete(PipeStatus::WriteQuotaExceeded);
            }
            let mut events: Vec<&Event> = Vec::with_capacity(1 + cancels.len());
            events.push(outgoing_writable);
            events.extend_from_slice(cancels);
            match wait_any(&events, deadline) {
                WaitVerdict::TimedOut => return PipeWait::TimedOut,
                WaitVerdict::Event(0) => continue,
                WaitVerdict::Event(i) => return PipeWait::Cancelled(i - 1),
            }
        }
    }

    /// Read one message into `buf`. Returns the completion and the number
    /// of bytes copied; a message longer than `buf` is truncated and
    /// reported as `MoreData`.
    pub fn read_message(
        &self,
        buf: &mut [u8],
        deadline: Option<Instant>,
        cancels: &[&Event],
    ) -> (PipeWait, usize) {
        let (incoming_readable, outgoing_writable_of_peer) = match self.end {
            End::Server => (&self.instance.srv_readable, &self.instance.cli_writable),
            End::Client => (&self.instance.cli_readable, &self.instance.srv_writable),
        };
        loop {
            {
                let mut st = self.instance.state.lock().unwrap();
                if let Some(status) = self.check_session(&st) {
                    return (PipeWait::Complete(status), 0);
                }
                let peer_open = match self.end {
                    End::Server => st.client_open,
                    End::Client => st.server_handles > 0,
                };
                let queue = match self.end {
                    End::Server => &mut st.to_server,
                    End::Client => &mut st.to_client,
                };
                if let Some(message) = queue.messages.pop_front() {
                    queue.bytes -= message.len();
                    let copied = message.len().min(buf.len());
                    buf[..copied].copy_from_slice(&message[..copied]);
                    if queue.messages.is_empty() && peer_open {
                        incoming_readable.reset();
                    }
                    if queue.bytes < queue.quota {
                        outgoing_writable_of_peer.set();
                    }
                    let status = if copied < message.len() {
                        // remainder of the message is discarded
                        PipeStatus::MoreData
                    } else {
                        PipeStatus::Success
                    };
                    return (PipeWait::Complete(status), copied);
                }
                if self.end == End::Server && !st.client_attached {
                    return (PipeWait::Complete(PipeStatus::PipeDisconnected), 0);
                }
                if !peer_open {
                    return (PipeWait::Complete(PipeStatus::PipeClosing), 0);
                }
            }
            if self.is_nonblocking() {
                return (PipeWait::Complete(PipeStatus::PipeEmpty), 0);
            }
            let mut events: Vec<&Event> = Vec::with_capacity(1 + cancels.len());
            events.push(incoming_readable);
            events.extend_from_slice(cancels);
            match wait_any(&events, deadline) {
                WaitVerdict::TimedOut => return (PipeWait::TimedOut, 0),
                WaitVerdict::Event(0) => continue,
                WaitVerdict::Event(i) => return (PipeWait::Cancelled(i - 1), 0),
            }
        }
    }

    /// `Some(status)` when this handle's session is stale.
    fn check_session(&self, st: &InstanceInner) -> Option<PipeStatus> {
        if self.end == End::Client && self.session != st.session {
            Some(PipeStatus::PipeDisconnected)
        } else {
            None
        }
    }
}

impl Clone for PipeHandle {
    fn clone(&self) -> Self {
        {
            let mut st = self.instance.state.lock().unwrap();
            match self.end {
                End::Server => st.server_handles += 1,
                End::Client => {
                    // a stale clone still needs a balanced count on drop
                    if self.session == st.session {
                        st.client_handles += 1;
                    }
                }
            }
        }
        Self {
            entry: Arc::clone(&self.entry),
            instance: Arc::clone(&self.instance),
            end: self.end,
            session: self.session,
            nonblocking: AtomicBool::new(self.is_nonblocking()),
        }
    }
}

impl Drop for PipeHandle {
    fn drop(&mut self) {
        match self.end {
            End::Server => {
                let last = {
                    let mut st = self.instance.state.lock().unwrap();
                    st.server_handles -= 1;
                    st.server_handles == 0
                };
                if last {
                    // the instance dies with its server end
                    let empty = {
                        let mut inner = self.entry.inner.lock().unwrap();
                        inner
                            .instances
                            .retain(|inst| !Arc::ptr_eq(inst, &self.instance));
                        inner.instances.is_empty()
                    };
                    // wake the client so it observes the loss
                    self.instance.cli_readable.set();
                    self.instance.cli_writable.set();
                    self.instance.connected.set();
                    if empty {
                        device().remove_entry(&self.entry.name);
                    }
                    self.entry.refresh_available();
                }
            }
            End::Client => {
                let last = {
                    let mut st = self.instance.state.lock().unwrap();
                    if self.session != st.session {
                        // already disconnected out from under us
                        return;
                    }
                    st.client_handles = st.client_handles.saturating_sub(1);
                    if st.client_handles == 0 {
                        st.client_open = false;
                    }
                    st.client_handles == 0
                };
                if last {
                    // server reads drain the queue, then observe the close
                    self.instance.srv_readable.set();
                    self.instance.srv_writable.set();
                }
            }
        }
    }
}

impl std::fmt::Debug for PipeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeHandle")
            .field("pipe", &self.entry.name)
            .field("end", &self.end)
            .field("nonblocking", &self.is_nonblocking())
            .finish()
    }
}
