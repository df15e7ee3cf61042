/*! Polymorphic real-time sockets.

One socket structure serves every family; the [`SocketKind`] tag selects
the operations, the shared core carries what all families need: the
incoming FIFO, the counted pending semaphore, the per-socket compensation
pool, the parameter lock, and the blocking-receive timeout.

A socket's pool is its budget: receive delivery *acquires* each buffer
into this pool, so a socket that stops reading exhausts only itself, and
close completes once every buffer has come home.
*/

pub mod packet;
pub mod udp;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::rtskb::{Pool, Priority, SkbQueue};
use crate::stack::Stack;
use crate::sys::{RtLock, RtSem, WaitOutcome};
use crate::time::Duration;
use crate::wire::{Endpoint, EthernetAddress, Ipv4Address};
use crate::{Error, Result};

bitflags::bitflags! {
    /// Per-call message flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MsgFlags: u32 {
        /// Never block, regardless of the socket timeout.
        const DONTWAIT = 1 << 0;
        /// Leave the datagram on the queue.
        const PEEK = 1 << 1;
    }
}

/// Which execution context invokes a configuration operation. Pool
/// changes from real-time context are refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallContext {
    Rt,
    Nrt,
}

/// Completed receive: bytes copied, source, and whether the datagram was
/// cut to the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvMsg {
    pub len: usize,
    pub from: Endpoint,
    pub truncated: bool,
}

/// Link-layer peer of a packet-socket datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkEndpoint {
    pub addr: EthernetAddress,
    pub protocol: crate::wire::EthernetProtocol,
}

/// Completed packet-socket receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkRecv {
    pub len: usize,
    pub from: LinkEndpoint,
    pub ifindex: usize,
    pub truncated: bool,
}

pub type SocketCallback = Arc<dyn Fn() + Send + Sync>;

pub(crate) struct SocketParams {
    pub priority: Priority,
    /// `<0` never block, `0` block forever, `>0` deadline in nanoseconds.
    pub timeout_ns: i64,
    pub nonblock: bool,
    pub callback: Option<SocketCallback>,
}

/// The family-independent part of every socket.
pub struct SocketCore {
    pub pool: Pool,
    pub incoming: SkbQueue,
    pub pending: RtSem,
    pub(crate) param: RtLock<SocketParams>,
    closed: AtomicBool,
}

impl SocketCore {
    fn new(pool_size: usize) -> SocketCore {
        SocketCore {
            pool: Pool::new(pool_size),
            incoming: SkbQueue::new(pool_size.max(1)),
            pending: RtSem::new(0),
            param: RtLock::new(SocketParams {
                priority: Priority::SOCK_DEF,
                timeout_ns: 0,
                nonblock: false,
                callback: None,
            }),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn priority(&self) -> Priority {
        self.param.lock().priority
    }

    /// Effective wait for one receive attempt: `None` = try only,
    /// `Some(None)` = forever, `Some(Some(d))` = bounded.
    fn wait_budget(&self, flags: MsgFlags) -> Option<Option<Duration>> {
        let param = self.param.lock();
        if param.nonblock || flags.contains(MsgFlags::DONTWAIT) || param.timeout_ns < 0 {
            None
        } else if param.timeout_ns == 0 {
            Some(None)
        } else {
            Some(Some(Duration::from_nanos(param.timeout_ns as u64)))
        }
    }

    /// Wait for the pending semaphore according to the blocking policy
    /// and map the outcome to receive errors.
    pub(crate) fn wait_pending(&self, flags: MsgFlags) -> Result<()> {
        match self.wait_budget(flags) {
            None => match self.pending.try_wait() {
                WaitOutcome::Signaled => Ok(()),
                WaitOutcome::TimedOut => Err(Error::WouldBlock),
                WaitOutcome::Closed => Err(Error::NotSocket),
            },
            Some(timeout) => match self.pending.wait(timeout) {
                WaitOutcome::Signaled => Ok(()),
                WaitOutcome::TimedOut => Err(Error::TimedOut),
                WaitOutcome::Closed => Err(Error::NotSocket),
            },
        }
    }

    /// Run the data-arrival callback, outside any lock.
    pub(crate) fn notify(&self) {
        let callback = self.param.lock().callback.clone();
        if let Some(callback) = callback {
            callback();
        }
    }
}

/// Family tag plus family state.
pub enum SocketKind {
    Udp(udp::UdpState),
    Packet(packet::PacketState),
    /// Internal family of the stack-wide ICMP reply socket; carries no
    /// user operations.
    Icmp,
}

/// The socket object shared between the user handle and the stack's
/// registries.
pub struct SocketInner {
    pub core: SocketCore,
    pub kind: SocketKind,
}

pub(crate) type SocketRef = Arc<SocketInner>;

impl SocketInner {
    pub(crate) fn new(pool_size: usize, kind: SocketKind) -> SocketRef {
        Arc::new(SocketInner {
            core: SocketCore::new(pool_size),
            kind,
        })
    }
}

/// User-facing socket handle. Dropping it closes the socket.
pub struct Socket {
    stack: Arc<Stack>,
    inner: Option<SocketRef>,
}

impl Socket {
    pub(crate) fn from_parts(stack: Arc<Stack>, inner: SocketRef) -> Socket {
        Socket {
            stack,
            inner: Some(inner),
        }
    }

    fn inner(&self) -> &SocketRef {
        self.inner.as_ref().expect("socket already closed")
    }

    /// Local endpoint of an UDP socket.
    pub fn local_endpoint(&self) -> Result<Endpoint> {
        match &self.inner().kind {
            SocketKind::Udp(state) => Ok(state.local_endpoint()),
            _ => Err(Error::Unsupported),
        }
    }

    /// Bind an UDP socket to a local address and port. Port zero keeps
    /// the automatically assigned one; explicit ports inside the reserved
    /// automatic range are rejected.
    pub fn bind(&self, addr: Ipv4Address, port: u16) -> Result<()> {
        match &self.inner().kind {
            SocketKind::Udp(_) => udp::bind(&self.stack, self.inner(), addr, port),
            _ => Err(Error::Unsupported),
        }
    }

    /// Connect an UDP socket to a fixed peer. An unspecified address
    /// resets the association.
    pub fn connect(&self, addr: Ipv4Address, port: u16) -> Result<()> {
        match &self.inner().kind {
            SocketKind::Udp(_) => udp::connect(&self.stack, self.inner(), addr, port),
            _ => Err(Error::Unsupported),
        }
    }

    /// Send a datagram, to `to` or to the connected peer.
    pub fn sendmsg(&self, buf: &[u8], to: Option<Endpoint>, flags: MsgFlags) -> Result<usize> {
        match &self.inner().kind {
            SocketKind::Udp(_) => udp::sendmsg(&self.stack, self.inner(), buf, to, flags),
            _ => Err(Error::Unsupported),
        }
    }

    /// Receive one datagram; blocking per the socket timeout policy.
    pub fn recvmsg(&self, buf: &mut [u8], flags: MsgFlags) -> Result<RecvMsg> {
        match &self.inner().kind {
            SocketKind::Udp(_) => udp::recvmsg(self.inner(), buf, flags),
            _ => Err(Error::Unsupported),
        }
    }

    /// Bind a packet socket to a link protocol and optionally a device.
    pub fn bind_link(&self, protocol: crate::wire::EthernetProtocol, ifindex: usize) -> Result<()> {
        match &self.inner().kind {
            SocketKind::Packet(_) => packet::bind(&self.stack, self.inner(), protocol, ifindex),
            _ => Err(Error::Unsupported),
        }
    }

    /// Send a raw frame to `to` through the bound device.
    pub fn send_link(&self, buf: &[u8], to: LinkEndpoint) -> Result<usize> {
        match &self.inner().kind {
            SocketKind::Packet(_) => packet::sendmsg(&self.stack, self.inner(), buf, to),
            _ => Err(Error::Unsupported),
        }
    }

    /// Receive one raw frame.
    pub fn recv_link(&self, buf: &mut [u8], flags: MsgFlags) -> Result<LinkRecv> {
        match &self.inner().kind {
            SocketKind::Packet(_) => packet::recvmsg(self.inner(), buf, flags),
            _ => Err(Error::Unsupported),
        }
    }

    /// Bound device, hardware address and protocol of a packet socket.
    pub fn link_name(&self) -> Result<(usize, EthernetAddress, crate::wire::EthernetProtocol)> {
        match &self.inner().kind {
            SocketKind::Packet(state) => packet::getsockname(&self.stack, state),
            _ => Err(Error::Unsupported),
        }
    }

    /// Set the transmit priority word.
    pub fn set_priority(&self, priority: Priority) {
        self.inner().core.param.lock().priority = priority;
    }

    /// Set the blocking-receive timeout: negative never blocks, zero
    /// blocks forever, positive is a nanosecond budget.
    pub fn set_timeout(&self, timeout_ns: i64) {
        self.inner().core.param.lock().timeout_ns = timeout_ns;
    }

    /// Force every receive on this socket to be non-blocking.
    pub fn set_nonblock(&self, nonblock: bool) {
        self.inner().core.param.lock().nonblock = nonblock;
    }

    /// Install a non-real-time data-arrival callback.
    pub fn set_callback(&self, callback: Option<SocketCallback>) {
        self.inner().core.param.lock().callback = callback;
    }

    /// Grow the compensation pool. Forbidden from real-time context.
    pub fn extend_pool(&self, ctx: CallContext, n: usize) -> Result<usize> {
        if ctx == CallContext::Rt {
            return Err(Error::AccessDenied);
        }
        let inner = self.inner();
        if inner.core.is_closed() {
            return Err(Error::NotSocket);
        }
        Ok(inner.core.pool.extend(n))
    }

    /// Shrink the compensation pool; only free buffers can leave.
    pub fn shrink_pool(&self, ctx: CallContext, n: usize) -> Result<usize> {
        if ctx == CallContext::Rt {
            return Err(Error::AccessDenied);
        }
        let inner = self.inner();
        if inner.core.is_closed() {
            return Err(Error::NotSocket);
        }
        Ok(inner.core.pool.shrink(n))
    }

    /// Close the socket: unregister, drop queued datagrams, wake blocked
    /// receivers with an error, and release the pool once its balance is
    /// zero.
    pub fn close(mut self) {
        self.close_impl();
    }

    fn close_impl(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        inner.core.closed.store(true, Ordering::Release);

        match &inner.kind {
            SocketKind::Udp(_) => udp::close(&self.stack, &inner),
            SocketKind::Packet(_) => packet::close(&self.stack, &inner),
            SocketKind::Icmp => {}
        }

        inner.core.pending.close();

        // Quiesce: buffers of this pool may still sit in discipline
        // queues, half-processed chains, or a delivery racing the close.
        // Re-drain until the balance reaches zero.
        loop {
            inner.core.incoming.purge();
            if inner.core.pool.is_full() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        inner.core.pool.release();
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.close_impl();
    }
}

impl core::fmt::Debug for Socket {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let kind = match self.inner.as_ref().map(|inner| &inner.kind) {
            Some(SocketKind::Udp(_)) => "udp",
            Some(SocketKind::Packet(_)) => "packet",
            Some(SocketKind::Icmp) => "icmp",
            None => "closed",
        };
        f.debug_struct("Socket").field("kind", &kind).finish()
    }
}
