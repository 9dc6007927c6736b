//! The mock backend listener.
//!
//! Owns the listening socket and an accept loop on a background thread. Each
//! accepted connection becomes a [`Session`], registered at the front of the
//! shared [`Registry`] and served by one of at most `max_sessions` worker
//! threads. Connections accepted while every worker is busy wait in a queue.

use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, info, warn};

use crate::config::MockConfig;
use crate::error::{MockError, Result};
use crate::registry::Registry;
use crate::session::{PollEvent, Session, poll_readable};

/// How often the accept loop wakes up to check whether it should stop.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Mock backend: a listener plus the sessions it accepted.
pub struct MockServer {
    inner: Arc<Inner>,
    local_addr: SocketAddr,
    accept_handle: Mutex<Option<thread::JoinHandle<()>>>,
}

/// State shared with the accept thread and the session workers.
struct Inner {
    config: Arc<MockConfig>,
    registry: Arc<Registry>,
    pool: Mutex<Pool>,
    running: AtomicBool,
    next_id: AtomicU64,
}

/// Accepted connections waiting for a worker, and how many workers are busy.
#[derive(Default)]
struct Pool {
    waiting: VecDeque<(TcpStream, SocketAddr)>,
    busy: usize,
}

impl MockServer {
    /// Bind `config.address` and start accepting in the background.
    pub fn start(config: MockConfig) -> Result<Self> {
        let listener = bind_listener(&config).map_err(|source| MockError::Bind {
            addr: config.address.clone(),
            source,
        })?;
        Self::launch(listener, config)
    }

    /// Start with the defaults and `PROXY_MOCK_*` overrides.
    pub fn start_from_env() -> Result<Self> {
        Self::start(MockConfig::from_env())
    }

    fn launch(listener: TcpListener, config: MockConfig) -> Result<Self> {
        let local_addr = listener.local_addr().map_err(|source| MockError::Bind {
            addr: config.address.clone(),
            source,
        })?;
        info!(addr = %local_addr, backlog = config.backlog, "mock listener bound");

        let inner = Arc::new(Inner {
            config: Arc::new(config),
            registry: Arc::new(Registry::new()),
            pool: Mutex::new(Pool::default()),
            running: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
        });

        let loop_inner = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name(format!("mock-accept-{}", local_addr.port()))
            .spawn(move || loop_inner.accept_loop(listener))
            .map_err(|source| MockError::Bind {
                addr: local_addr.to_string(),
                source,
            })?;

        Ok(Self {
            inner,
            local_addr,
            accept_handle: Mutex::new(Some(handle)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn config(&self) -> &MockConfig {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Live sessions, most recently active first.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.inner.registry.sessions()
    }

    pub fn session_count(&self) -> usize {
        self.inner.registry.session_count()
    }

    /// Accepted connections still waiting for a free worker.
    pub fn waiting_count(&self) -> usize {
        self.inner.lock_pool().waiting.len()
    }

    /// The most recently active session.
    pub fn latest_session(&self) -> Option<Arc<Session>> {
        self.inner.registry.latest()
    }

    /// Wait (up to `session_wait`) for any session to be accepted.
    pub fn wait_for_session(&self) -> bool {
        self.inner
            .registry
            .wait_for_session(self.inner.config.session_wait)
    }

    /// Pop the oldest received chunk without waiting.
    pub fn pop_received(&self) -> Option<Vec<u8>> {
        self.inner.registry.pop_received()
    }

    /// Pop the oldest received chunk, waiting up to `session_wait` for one.
    pub fn recv_chunk(&self) -> Option<Vec<u8>> {
        self.inner
            .registry
            .wait_and_pop(self.inner.config.session_wait)
    }

    /// True iff nothing has been received and left unconsumed.
    pub fn is_quiet(&self) -> bool {
        self.inner.registry.is_quiet()
    }

    /// Close every live session. Keeps listening for new connections.
    pub fn close_all(&self) {
        self.inner.close_all();
    }

    /// Stop accepting, close every session, and release the socket.
    /// Idempotent.
    pub fn stop(&self) {
        self.inner.teardown();
        let handle = self
            .accept_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            warn!(addr = %self.local_addr, "mock accept thread panicked");
        }
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Bind the first resolved address that accepts us, listening with
/// `config.backlog` pending connections.
fn bind_listener(config: &MockConfig) -> io::Result<TcpListener> {
    let mut last_err = None;
    for addr in config.address.to_socket_addrs()? {
        match bind_socket(addr, config.backlog) {
            Ok(listener) => return Ok(listener),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "address resolved to nothing")
    }))
}

fn bind_socket(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;
    // Non-blocking so the accept loop can notice `stop` between polls.
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

impl Inner {
    fn lock_pool(&self) -> MutexGuard<'_, Pool> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        debug!("mock accept loop running");
        while self.running.load(Ordering::SeqCst) {
            match poll_readable(&listener, ACCEPT_POLL_INTERVAL) {
                PollEvent::Idle => continue,
                PollEvent::Readable => {}
                PollEvent::ErrorCondition => {
                    let source = io::Error::other("listening socket error condition");
                    self.fail(&MockError::Accept(source));
                    break;
                }
                PollEvent::Failed(source) => {
                    self.fail(&MockError::Accept(source));
                    break;
                }
            }

            match listener.accept() {
                Ok((stream, peer)) => self.admit(stream, peer),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => {
                    self.fail(&MockError::Accept(e));
                    break;
                }
            }
        }
        debug!("mock accept loop stopped");
        // Dropping `listener` here closes the listening socket.
    }

    /// Hand a new connection to a worker, or queue it while every worker
    /// is busy.
    fn admit(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nonblocking(false) {
            warn!(%peer, error = %e, "could not configure accepted socket, dropping");
            return;
        }

        {
            let mut pool = self.lock_pool();
            if pool.busy >= self.config.max_sessions.max(1) {
                pool.waiting.push_back((stream, peer));
                debug!(
                    %peer,
                    waiting = pool.waiting.len(),
                    "mock workers busy, connection queued"
                );
                return;
            }
            pool.busy += 1;
        }

        let worker = Arc::clone(self);
        if let Err(e) = thread::Builder::new()
            .name(format!("mock-worker-{}", peer.port()))
            .spawn(move || worker.work(stream, peer))
        {
            warn!(%peer, error = %e, "could not spawn session worker, dropping connection");
            let mut pool = self.lock_pool();
            pool.busy = pool.busy.saturating_sub(1);
        }
    }

    /// Serve `stream`, then keep taking queued connections until none wait.
    fn work(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let mut next = Some((stream, peer));
        while let Some((stream, peer)) = next {
            self.serve(stream, peer);
            next = self.next_waiting();
        }
    }

    /// Pop the next queued connection, or release this worker's slot.
    fn next_waiting(&self) -> Option<(TcpStream, SocketAddr)> {
        let mut pool = self.lock_pool();
        let next = if self.running.load(Ordering::SeqCst) {
            pool.waiting.pop_front()
        } else {
            None
        };
        if next.is_none() {
            pool.busy = pool.busy.saturating_sub(1);
        }
        next
    }

    fn serve(&self, stream: TcpStream, peer: SocketAddr) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(Session::new(id, stream, Arc::downgrade(&self.registry)));
        self.registry.insert_front(Arc::clone(&session));
        debug!(session = id, %peer, "mock session registered");

        // A concurrent stop may have drained the registry before the insert.
        if !self.running.load(Ordering::SeqCst) {
            session.close();
            return;
        }
        session.run(&self.config);
    }

    fn close_all(&self) {
        let sessions = self.registry.drain_sessions();
        if !sessions.is_empty() {
            debug!(count = sessions.len(), "closing all mock sessions");
        }
        for session in sessions {
            session.close();
        }
    }

    fn teardown(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            debug!("mock listener stopping");
        }
        let dropped = self.lock_pool().waiting.drain(..).count();
        if dropped > 0 {
            debug!(count = dropped, "dropping queued connections");
        }
        self.close_all();
    }

    fn fail(&self, err: &MockError) {
        error!(error = %err, "mock listener shutting down");
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::time::Instant;

    fn test_config() -> MockConfig {
        MockConfig::ephemeral()
            .poll_timeout(Duration::from_millis(20))
            .iteration_budget(1000)
            .session_wait(Duration::from_secs(5))
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        cond()
    }

    #[test]
    fn binds_ephemeral_port() {
        let server = MockServer::start(test_config()).unwrap();
        assert!(server.port() > 0);
        assert!(server.is_running());
        assert!(server.is_quiet());
        assert_eq!(server.session_count(), 0);
    }

    #[test]
    fn bind_conflict_is_bind_error() {
        let first = MockServer::start(test_config()).unwrap();
        let taken = first.local_addr().to_string();
        let err = match MockServer::start(test_config().address(taken.clone())) {
            Ok(_) => panic!("second bind on {taken} should fail"),
            Err(e) => e,
        };
        match err {
            MockError::Bind { addr, .. } => assert_eq!(addr, taken),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn accepts_and_records_from_many_connections() {
        let server = MockServer::start(test_config()).unwrap();
        let mut clients: Vec<TcpStream> = (0..3)
            .map(|_| TcpStream::connect(server.local_addr()).unwrap())
            .collect();
        assert!(wait_until(|| server.session_count() == 3));

        for (i, client) in clients.iter_mut().enumerate() {
            client.write_all(format!("hello {i}").as_bytes()).unwrap();
            // Wait for each chunk so the inbox order is deterministic.
            let chunk = server.recv_chunk().unwrap();
            assert_eq!(chunk, format!("hello {i}").into_bytes());
        }
        assert!(server.is_quiet());
    }

    #[test]
    fn latest_session_follows_activity() {
        let server = MockServer::start(test_config()).unwrap();
        let mut first = TcpStream::connect(server.local_addr()).unwrap();
        assert!(wait_until(|| server.session_count() == 1));
        let first_id = server.latest_session().unwrap().id();

        let _second = TcpStream::connect(server.local_addr()).unwrap();
        assert!(wait_until(|| server.session_count() == 2));
        assert_ne!(server.latest_session().unwrap().id(), first_id);

        first.write_all(b"ping").unwrap();
        assert_eq!(server.recv_chunk().unwrap(), b"ping");
        assert_eq!(server.latest_session().unwrap().id(), first_id);
    }

    #[test]
    fn close_all_keeps_listening() {
        let server = MockServer::start(test_config()).unwrap();
        let mut old = TcpStream::connect(server.local_addr()).unwrap();
        assert!(wait_until(|| server.session_count() == 1));

        server.close_all();
        assert_eq!(server.session_count(), 0);
        let mut buf = [0u8; 4];
        assert_eq!(old.read(&mut buf).unwrap(), 0);

        let _fresh = TcpStream::connect(server.local_addr()).unwrap();
        assert!(wait_until(|| server.session_count() == 1));
        assert!(server.is_running());
    }

    #[test]
    fn stop_is_idempotent_and_releases_socket() {
        let server = MockServer::start(test_config()).unwrap();
        let addr = server.local_addr();
        let mut client = TcpStream::connect(addr).unwrap();
        assert!(wait_until(|| server.session_count() == 1));

        server.stop();
        server.stop();
        assert!(!server.is_running());
        assert_eq!(server.session_count(), 0);
        let mut buf = [0u8; 4];
        assert_eq!(client.read(&mut buf).unwrap(), 0);

        // The port is free again once the accept loop has exited.
        let rebound = MockServer::start(test_config().address(addr.to_string())).unwrap();
        assert_eq!(rebound.local_addr(), addr);
    }

    #[test]
    fn busy_workers_queue_extra_connections() {
        let server = MockServer::start(test_config().max_sessions(1)).unwrap();
        let kept = TcpStream::connect(server.local_addr()).unwrap();
        assert!(wait_until(|| server.session_count() == 1));
        let first_id = server.latest_session().unwrap().id();

        let mut queued = TcpStream::connect(server.local_addr()).unwrap();
        queued.write_all(b"get a\r\n").unwrap();
        assert!(wait_until(|| server.waiting_count() == 1));
        assert_eq!(server.session_count(), 1);
        assert!(server.is_quiet());

        // Freeing the slot promotes the queued connection, data intact.
        drop(kept);
        assert_eq!(server.recv_chunk().unwrap(), b"get a\r\n");
        assert_eq!(server.session_count(), 1);
        assert_eq!(server.waiting_count(), 0);
        assert_ne!(server.latest_session().unwrap().id(), first_id);
    }

    #[test]
    fn more_connections_than_workers_are_all_served() {
        let server = MockServer::start(test_config().max_sessions(2)).unwrap();
        let clients: Vec<TcpStream> = (0..5)
            .map(|_| TcpStream::connect(server.local_addr()).unwrap())
            .collect();
        assert!(wait_until(|| server.session_count() == 2 && server.waiting_count() == 3));

        for client in clients {
            drop(client);
        }
        assert!(wait_until(|| server.session_count() == 0 && server.waiting_count() == 0));
    }

    #[test]
    fn stop_drops_queued_connections() {
        let server = MockServer::start(test_config().max_sessions(1)).unwrap();
        let _kept = TcpStream::connect(server.local_addr()).unwrap();
        assert!(wait_until(|| server.session_count() == 1));
        let mut queued = TcpStream::connect(server.local_addr()).unwrap();
        assert!(wait_until(|| server.waiting_count() == 1));

        server.stop();
        assert_eq!(server.waiting_count(), 0);
        let mut buf = [0u8; 4];
        assert_eq!(queued.read(&mut buf).unwrap(), 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn backlog_is_applied_to_listener() {
        let config = test_config();
        let listener = bind_listener(&config).unwrap();
        let socket = socket2::SockRef::from(&listener);
        assert!(socket.is_listener().unwrap());
        assert!(socket.nonblocking().unwrap());
    }

    #[test]
    fn unresolvable_address_is_bind_error() {
        let err = match MockServer::start(test_config().address("not an address")) {
            Ok(_) => panic!("bogus address should not bind"),
            Err(e) => e,
        };
        assert!(matches!(err, MockError::Bind { .. }));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn accept_failure_stops_listener() {
        let config = test_config();
        let listener = bind_listener(&config).unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = listener.try_clone().unwrap();
        let server = MockServer::launch(listener, config).unwrap();

        let mut client = TcpStream::connect(addr).unwrap();
        assert!(wait_until(|| server.session_count() == 1));

        // A shut-down listening socket makes accept(2) fail with EINVAL.
        socket2::SockRef::from(&handle)
            .shutdown(std::net::Shutdown::Both)
            .unwrap();
        assert!(wait_until(|| !server.is_running()));
        assert_eq!(server.session_count(), 0);
        let mut buf = [0u8; 4];
        assert_eq!(client.read(&mut buf).unwrap(), 0);

        drop(handle);
        server.stop();
        let rebound = MockServer::start(test_config().address(addr.to_string())).unwrap();
        assert_eq!(rebound.local_addr(), addr);
    }

    #[test]
    fn registry_never_lists_closed_sessions() {
        let server = MockServer::start(test_config()).unwrap();
        let clients: Vec<TcpStream> = (0..4)
            .map(|_| TcpStream::connect(server.local_addr()).unwrap())
            .collect();
        assert!(wait_until(|| server.session_count() == 4));

        let victim = server.latest_session().unwrap();
        victim.close();
        assert!(server.sessions().iter().all(|s| !s.is_closed()));
        assert_eq!(server.session_count(), 3);

        drop(clients);
        assert!(wait_until(|| server.session_count() == 0));
    }
}
