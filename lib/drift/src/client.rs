//! Connected-client bookkeeping: the registry pairs a dense sequence of
//! client records with the readiness set the poller hands to the operating
//! system. Slot 0 of the readiness set is the listening socket; slot i + 1
//! always carries the TCP socket of client i.

use mio::unix::EventedFd;
use mio::{Poll, PollOpt, Ready, Registration, SetReadiness, Token};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

/// Readiness token of the listening socket.
pub const LISTENER_TOKEN: Token = Token(0);

/// Readiness token of the shutdown waker. `Token(usize::MAX)` is reserved
/// by mio itself.
pub const WAKE_TOKEN: Token = Token(std::usize::MAX - 1);

/// One connected client. The registry owns the authoritative reference;
/// station subscriber lists hold clones.
pub struct Client {
    stream: TcpStream,
    tcp_addr: SocketAddr,
    udp_addr: SocketAddr,
    tuned: Mutex<Option<usize>>,
}

impl Client {
    pub(crate) fn new(stream: TcpStream, tcp_addr: SocketAddr, udp_addr: SocketAddr) -> Client {
        Client {
            stream,
            tcp_addr,
            udp_addr,
            tuned: Mutex::new(None),
        }
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        self.tcp_addr
    }

    /// Where this client's station chunks are delivered: the TCP peer IP
    /// with the port announced in the client's Hello.
    pub fn udp_addr(&self) -> SocketAddr {
        self.udp_addr
    }

    /// The station this client is currently subscribed to, if any.
    pub fn tuned(&self) -> Option<usize> {
        *self.tuned.lock()
    }

    pub(crate) fn set_tuned(&self, station: Option<usize>) {
        *self.tuned.lock() = station;
    }
}

/// The dense client sequence plus the readiness set, mutated only under the
/// registry lock. The pending counter tracks control-plane jobs dispatched
/// by the poller but not yet finished.
///
/// The `Poll` handle is shared with the poller, which blocks on it without
/// holding the registry lock; the pending-zero rule guarantees no slot is
/// registered or dropped while a readiness wait is in progress.
pub struct ClientRegistry {
    poll: Arc<Poll>,
    _waker: Registration,
    clients: Vec<Arc<Client>>,
    pending: usize,
}

impl ClientRegistry {
    /// Creates the registry with the listening socket seeded in slot 0 and
    /// the shutdown waker registered alongside it. Returns the shared
    /// readiness handle the poller blocks on, and the waker that breaks it
    /// out at shutdown.
    pub fn new(
        listener: &TcpListener,
    ) -> io::Result<(ClientRegistry, Arc<Poll>, SetReadiness)> {
        let poll = Arc::new(Poll::new()?);

        let listener_fd = listener.as_raw_fd();
        poll.register(
            &EventedFd(&listener_fd),
            LISTENER_TOKEN,
            Ready::readable(),
            PollOpt::level(),
        )?;

        let (registration, waker) = Registration::new2();
        poll.register(&registration, WAKE_TOKEN, Ready::readable(), PollOpt::level())?;

        let registry = ClientRegistry {
            poll: poll.clone(),
            _waker: registration,
            clients: Vec::new(),
            pending: 0,
        };

        Ok((registry, poll, waker))
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.clients.capacity()
    }

    /// Appends a new client record and its readiness slot. The delivery
    /// address is the TCP peer IP with the port replaced by `udp_port`.
    pub fn add(
        &mut self,
        stream: TcpStream,
        udp_port: u16,
        tcp_addr: SocketAddr,
    ) -> io::Result<Arc<Client>> {
        let udp_addr = SocketAddr::new(tcp_addr.ip(), udp_port);

        let fd = stream.as_raw_fd();
        self.poll.register(
            &EventedFd(&fd),
            Token(self.clients.len() + 1),
            Ready::readable(),
            PollOpt::level(),
        )?;

        let client = Arc::new(Client::new(stream, tcp_addr, udp_addr));
        self.clients.push(client.clone());
        Ok(client)
    }

    /// Swap-with-last removal. The record that moved into `index` keeps its
    /// socket but takes over the vacated readiness slot, preserving the
    /// slot-offset invariant. The removed socket is shut down here, exactly
    /// once; station subscriber lists are the caller's responsibility.
    pub fn remove(&mut self, index: usize) {
        let client = self.clients.swap_remove(index);

        let fd = client.stream.as_raw_fd();
        let _ = self.poll.deregister(&EventedFd(&fd));

        if index < self.clients.len() {
            let survivor_fd = self.clients[index].stream.as_raw_fd();
            let _ = self.poll.reregister(
                &EventedFd(&survivor_fd),
                Token(index + 1),
                Ready::readable(),
                PollOpt::level(),
            );
        }

        let _ = client.stream.shutdown(Shutdown::Both);
    }

    /// Linear scan by socket identity.
    pub fn index_of(&self, client: &Arc<Client>) -> Option<usize> {
        self.clients
            .iter()
            .position(|candidate| Arc::ptr_eq(candidate, client))
    }

    pub fn get(&self, index: usize) -> Option<&Arc<Client>> {
        self.clients.get(index)
    }

    /// Gives spare capacity back once the population has dropped below half
    /// of it.
    pub fn maybe_shrink(&mut self) {
        if self.clients.len() < self.clients.capacity() / 2 {
            let target = self.clients.capacity() / 2;
            self.clients.shrink_to(target);
        }
    }

    /// Records `count` dispatched control-plane jobs.
    pub fn begin_jobs(&mut self, count: usize) {
        self.pending += count;
    }

    pub fn pending_jobs(&self) -> usize {
        self.pending
    }
}

/// Lock-guarded wrapper shared by the poller and the workers, carrying the
/// condition the poller uses to wait out in-flight control-plane work.
pub struct ClientControl {
    registry: Mutex<ClientRegistry>,
    quiescent: Condvar,
}

impl ClientControl {
    pub fn new(registry: ClientRegistry) -> ClientControl {
        ClientControl {
            registry: Mutex::new(registry),
            quiescent: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, ClientRegistry> {
        self.registry.lock()
    }

    /// Blocks until every dispatched control-plane job has finished, so the
    /// caller's view of the descriptor set cannot race with mutations.
    pub fn wait_quiescent(&self, registry: &mut MutexGuard<'_, ClientRegistry>) {
        while registry.pending > 0 {
            self.quiescent.wait(registry);
        }
    }

    /// Marks one dispatched job as finished, waking the poller once the
    /// count reaches zero.
    pub fn finish_job(&self) {
        let mut registry = self.registry.lock();
        registry.pending -= 1;
        if registry.pending == 0 {
            self.quiescent.notify_all();
        }
    }

    /// Removes every remaining client, shutting each socket down. Used at
    /// server teardown, after the poller has exited.
    pub fn clear(&self) {
        let mut registry = self.registry.lock();
        while !registry.is_empty() {
            let last = registry.len() - 1;
            registry.remove(last);
        }
    }
}
