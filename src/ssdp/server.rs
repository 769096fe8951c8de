//! Per-(interface, mode, role) datagram server: owns the multicast socket
//! and the receive loop, and funnels outbound datagrams through the io pool.
//!
//! The receive loop polls with a finite socket timeout; that timeout is the
//! only thing bounding cancellation latency, since closing a UDP socket from
//! another thread does not reliably unblock a pending recv. A fresh ready
//! latch per `start()` keeps `send()` from racing the multicast join.

use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};
use url::{Host, Url};

use super::message::SsdpMessage;
use super::socket::{MulticastSocket, SsdpSocket};
use super::Address;
use crate::errors::UpnpError;
use crate::net::{InterfaceBinding, NetworkInterface};
use crate::task::TaskExecutors;

/// How long a queued send waits for the receive task to become ready.
/// A missed ready is a dropped send, not an error.
const READY_WAIT: Duration = Duration::from_millis(500);

const RECEIVE_BUFFER_SIZE: usize = 1500;

/// Receives every accepted datagram, in arrival order.
pub trait Receiver: Send + Sync {
    fn on_receive(&self, source_address: SocketAddr, data: &[u8]);
}

type SocketFactory = Box<dyn Fn(u16) -> io::Result<Arc<dyn SsdpSocket>> + Send + Sync>;

enum ServerState {
    Idle,
    Open(Arc<dyn SsdpSocket>),
    Running {
        socket: Arc<dyn SsdpSocket>,
        task: Arc<ReceiveTask>,
    },
}

pub struct SsdpServer {
    executors: Arc<TaskExecutors>,
    receiver: Arc<dyn Receiver>,
    address: Address,
    binding: InterfaceBinding,
    bind_port: u16,
    state: Arc<Mutex<ServerState>>,
    socket_factory: SocketFactory,
}

impl SsdpServer {
    /// A server on an ephemeral port (search role).
    pub fn new(
        executors: Arc<TaskExecutors>,
        receiver: Arc<dyn Receiver>,
        address: Address,
        interface: &NetworkInterface,
    ) -> Result<Self, UpnpError> {
        Self::with_port(executors, receiver, address, interface, 0)
    }

    /// A server on a fixed port; 1900 is the multicast-member notify role.
    pub fn with_port(
        executors: Arc<TaskExecutors>,
        receiver: Arc<dyn Receiver>,
        address: Address,
        interface: &NetworkInterface,
        bind_port: u16,
    ) -> Result<Self, UpnpError> {
        let binding = address.find_interface_address(interface)?;
        Ok(Self::with_socket_factory(
            executors,
            receiver,
            address,
            binding.clone(),
            bind_port,
            Box::new(move |port| {
                MulticastSocket::open(address, &binding, port)
                    .map(|s| Arc::new(s) as Arc<dyn SsdpSocket>)
            }),
        ))
    }

    pub(crate) fn with_socket_factory(
        executors: Arc<TaskExecutors>,
        receiver: Arc<dyn Receiver>,
        address: Address,
        binding: InterfaceBinding,
        bind_port: u16,
        socket_factory: SocketFactory,
    ) -> Self {
        Self {
            executors,
            receiver,
            address,
            binding,
            bind_port,
            state: Arc::new(Mutex::new(ServerState::Idle)),
            socket_factory,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// The interface address this server receives on.
    pub fn interface_binding(&self) -> &InterfaceBinding {
        &self.binding
    }

    /// Create the multicast socket. Re-opening an open server closes the
    /// previous socket first.
    pub fn open(&self) -> Result<(), UpnpError> {
        let mut state = self.state.lock().unwrap();
        if !matches!(*state, ServerState::Idle) {
            Self::close_locked(&mut state);
        }
        let socket = (self.socket_factory)(self.bind_port)?;
        *state = ServerState::Open(socket);
        Ok(())
    }

    /// Stop the receive task and release the socket. Idempotent, callable
    /// from any thread.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        Self::close_locked(&mut state);
    }

    fn close_locked(state: &mut ServerState) {
        Self::stop_locked(state);
        *state = ServerState::Idle;
    }

    /// Launch the receive task on the server pool. Restarting a running
    /// server cancels the previous task first.
    pub fn start(&self) -> Result<(), UpnpError> {
        let mut state = self.state.lock().unwrap();
        let socket = match &*state {
            ServerState::Idle => return Err(UpnpError::InvalidState("socket is not open")),
            ServerState::Open(socket) => Arc::clone(socket),
            ServerState::Running { socket, task } => {
                task.cancel();
                Arc::clone(socket)
            }
        };
        let task = Arc::new(ReceiveTask::new(
            Arc::clone(&self.receiver),
            Arc::clone(&socket),
            self.bind_port != 0,
        ));
        let role = if self.bind_port != 0 { "notify" } else { "search" };
        let suffix = format!(
            "-ssdp-{}-{}-{}",
            role,
            self.binding.interface_name(),
            self.binding.simple_address_string()
        );
        let runner = Arc::clone(&task);
        if !self.executors.server(&suffix, move || runner.run()) {
            return Err(UpnpError::InvalidState("task executors are terminated"));
        }
        *state = ServerState::Running { socket, task };
        Ok(())
    }

    /// Request cancellation of the receive task and return immediately.
    /// The loop observes it within the socket read timeout. Idempotent.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        Self::stop_locked(&mut state);
    }

    fn stop_locked(state: &mut ServerState) {
        match std::mem::replace(state, ServerState::Idle) {
            ServerState::Running { socket, task } => {
                task.cancel();
                *state = ServerState::Open(socket);
            }
            other => *state = other,
        }
    }

    /// Queue a datagram for the multicast group on the io pool. The worker
    /// waits for the receive task's ready latch; without a ready task the
    /// send is dropped silently (UDP is best-effort).
    pub fn send(&self, message: SsdpMessage) {
        let state = Arc::clone(&self.state);
        let target = self.address.socket_address();
        let local = self.binding.address();
        let submitted = self.executors.io(move || {
            let (socket, task) = match &*state.lock().unwrap() {
                ServerState::Running { socket, task } => (Arc::clone(socket), Arc::clone(task)),
                _ => return,
            };
            if !task.wait_ready(READY_WAIT) {
                debug!("SSDP send dropped, receive task not ready");
                return;
            }
            trace!("send from {}:\n{}", local, message);
            if let Err(err) = socket.send_to(&message.write_data(), target) {
                warn!("Failed to send SSDP datagram to {}: {}", target, err);
            }
        });
        if !submitted {
            debug!("SSDP send dropped, io pool saturated");
        }
    }

    #[cfg(test)]
    pub(crate) fn has_socket(&self) -> bool {
        !matches!(*self.state.lock().unwrap(), ServerState::Idle)
    }

    #[cfg(test)]
    pub(crate) fn has_task(&self) -> bool {
        matches!(*self.state.lock().unwrap(), ServerState::Running { .. })
    }
}

impl Drop for SsdpServer {
    fn drop(&mut self) {
        self.close();
    }
}

/// One incarnation of the receive loop. A new task (with a fresh ready
/// latch) is built on every `start()`.
pub(crate) struct ReceiveTask {
    receiver: Arc<dyn Receiver>,
    socket: Arc<dyn SsdpSocket>,
    join_group: bool,
    cancelled: AtomicBool,
    latch: ReadyLatch,
}

impl ReceiveTask {
    fn new(receiver: Arc<dyn Receiver>, socket: Arc<dyn SsdpSocket>, join_group: bool) -> Self {
        Self {
            receiver,
            socket,
            join_group,
            cancelled: AtomicBool::new(false),
            latch: ReadyLatch::new(),
        }
    }

    pub(crate) fn run(&self) {
        if !self.cancelled.load(Ordering::Acquire) {
            if let Err(err) = self.run_inner() {
                debug!("SSDP receive task ended: {}", err);
            }
        }
        self.latch.close();
    }

    fn run_inner(&self) -> io::Result<()> {
        if self.join_group {
            self.socket.join_group()?;
        }
        self.latch.signal_ready();
        self.receive_loop();
        if self.join_group {
            if let Err(err) = self.socket.leave_group() {
                debug!("Failed to leave multicast group: {}", err);
            }
        }
        Ok(())
    }

    fn receive_loop(&self) {
        let mut buf = [0u8; RECEIVE_BUFFER_SIZE];
        while !self.cancelled.load(Ordering::Acquire) {
            match self.socket.recv_from(&mut buf) {
                Ok((len, source)) => {
                    if self.cancelled.load(Ordering::Acquire) {
                        break;
                    }
                    self.receiver.on_receive(source, &buf[..len]);
                }
                Err(err)
                    if err.kind() == io::ErrorKind::WouldBlock
                        || err.kind() == io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(err) => {
                    debug!("SSDP receive loop terminated: {}", err);
                    break;
                }
            }
        }
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub(crate) fn wait_ready(&self, timeout: Duration) -> bool {
        self.latch.wait_ready(timeout)
    }
}

enum LatchState {
    Pending,
    Ready,
    Closed,
}

/// One-shot readiness signal: Pending until the group join succeeds, then
/// Ready; Closed once the task finishes for any reason.
struct ReadyLatch {
    state: Mutex<LatchState>,
    condvar: Condvar,
}

impl ReadyLatch {
    fn new() -> Self {
        Self {
            state: Mutex::new(LatchState::Pending),
            condvar: Condvar::new(),
        }
    }

    fn signal_ready(&self) {
        let mut state = self.state.lock().unwrap();
        if matches!(*state, LatchState::Pending) {
            *state = LatchState::Ready;
        }
        self.condvar.notify_all();
    }

    fn close(&self) {
        *self.state.lock().unwrap() = LatchState::Closed;
        self.condvar.notify_all();
    }

    fn wait_ready(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            match *state {
                LatchState::Ready => return true,
                LatchState::Closed => return false,
                LatchState::Pending => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self.condvar.wait_timeout(state, deadline - now).unwrap();
            state = guard;
        }
    }
}

/// True when the message's LOCATION must not be trusted: absent, not an
/// absolute `http` URL, or resolving to an address other than the datagram
/// source. Called before treating a message as authoritative.
pub fn is_invalid_location(message: &SsdpMessage, source_address: IpAddr) -> bool {
    !is_valid_location(message, source_address)
}

fn is_valid_location(message: &SsdpMessage, source_address: IpAddr) -> bool {
    let Some(location) = message.location() else {
        return false;
    };
    let Ok(url) = Url::parse(location) else {
        return false;
    };
    if url.scheme() != "http" {
        return false;
    }
    match url.host() {
        Some(Host::Ipv4(v4)) => IpAddr::V4(v4) == source_address,
        Some(Host::Ipv6(v6)) => IpAddr::V6(v6) == source_address,
        Some(Host::Domain(domain)) => {
            let port = url.port_or_known_default().unwrap_or(80);
            match (domain, port).to_socket_addrs() {
                Ok(mut resolved) => resolved.next().map_or(false, |a| a.ip() == source_address),
                Err(_) => false,
            }
        }
        None => false,
    }
}
