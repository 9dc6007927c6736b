//! Drives a real client connection to the proxy under test alongside the
//! mock backend's sessions and inbox.
//!
//! Direction labels in the logs: `client->proxy`, `proxy->client`,
//! `proxy->mock`, `mock->proxy`.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::thread;
use std::time::Duration;
use tracing::debug;

use crate::config::ControllerConfig;
use crate::error::{MockError, Result};
use crate::expect::Expect;
use crate::markers;
use crate::server::MockServer;

/// Scenario driver for one client connection against one mock backend.
pub struct Controller<'a> {
    server: &'a MockServer,
    client: Option<TcpStream>,
    config: ControllerConfig,
}

impl<'a> Controller<'a> {
    /// Open the client connection to the proxy.
    pub fn connect(server: &'a MockServer, config: ControllerConfig) -> Result<Self> {
        let client =
            TcpStream::connect(&config.proxy_address).map_err(|source| MockError::Connect {
                addr: config.proxy_address.clone(),
                source,
            })?;
        debug!(proxy = %config.proxy_address, mock = %server.local_addr(), "controller connected");
        Ok(Self {
            server,
            client: Some(client),
            config,
        })
    }

    pub fn server(&self) -> &MockServer {
        self.server
    }

    /// Expand markers in `payload` and write it to the proxy.
    pub fn client_send(&mut self, payload: &str) -> Result<()> {
        let bytes = markers::expand_bytes(payload);
        debug!(direction = "client->proxy", data = ?String::from_utf8_lossy(&bytes), "send");
        let client = self.client()?;
        client
            .write_all(&bytes)
            .and_then(|()| client.flush())
            .map_err(MockError::ClientIo)
    }

    /// Expand markers in `payload` and write it on the most recently active
    /// backend session.
    pub fn mock_send(&self, payload: &str) -> Result<()> {
        let bytes = markers::expand_bytes(payload);
        let session = self
            .server
            .latest_session()
            .ok_or(MockError::NoActiveSession)?;
        debug!(
            direction = "mock->proxy",
            session = session.id(),
            data = ?String::from_utf8_lossy(&bytes),
            "send"
        );
        session.send(&bytes)
    }

    /// One bounded read from the proxy, checked against `expect`.
    /// Blocks until the proxy writes or hangs up.
    pub fn client_recv(&mut self, expect: &Expect) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.config.client_recv_len.max(1)];
        let n = self.client()?.read(&mut buf).map_err(MockError::ClientIo)?;
        buf.truncate(n);
        debug!(
            direction = "proxy->client",
            %expect,
            got = ?String::from_utf8_lossy(&buf),
            "recv"
        );
        expect.check("client", &buf)?;
        Ok(buf)
    }

    /// Pop the oldest chunk the backend received and check it against
    /// `expect`. Waits up to `session_wait` for a chunk; nothing arriving
    /// compares as empty, so expecting an empty payload always costs the
    /// full `session_wait` (10 s by default).
    pub fn mock_recv(&self, expect: &Expect) -> Result<Vec<u8>> {
        let chunk = self.server.recv_chunk().unwrap_or_default();
        debug!(
            direction = "proxy->mock",
            %expect,
            got = ?String::from_utf8_lossy(&chunk),
            "recv"
        );
        expect.check("mock", &chunk)?;
        Ok(chunk)
    }

    /// Sleep to force an interleaving.
    pub fn wait(&self, duration: Duration) {
        debug!(?duration, "wait");
        thread::sleep(duration);
    }

    /// True iff the backend has received nothing left unconsumed.
    pub fn is_quiet(&self) -> bool {
        self.server.is_quiet()
    }

    /// Simulate a backend disconnect: close every mock session.
    pub fn mock_close(&self) {
        debug!("mock close");
        self.server.close_all();
    }

    pub fn client_close(&mut self) {
        if let Some(client) = self.client.take() {
            debug!("client close");
            let _ = client.shutdown(Shutdown::Both);
        }
    }

    /// Close both ends, as after every scenario.
    pub fn teardown(&mut self) {
        self.mock_close();
        self.client_close();
    }

    fn client(&mut self) -> Result<&mut TcpStream> {
        self.client.as_mut().ok_or_else(|| {
            MockError::ClientIo(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "client connection already closed",
            ))
        })
    }
}

impl Drop for Controller<'_> {
    fn drop(&mut self) {
        self.teardown();
    }
}
