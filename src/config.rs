use std::env;
use std::time::Duration;
use tracing::{debug, warn};

/// Default mock backend port, where the proxy under test expects its backend.
pub const DEFAULT_MOCK_PORT: u16 = 11311;

/// Default port of the proxy under test.
pub const DEFAULT_PROXY_PORT: u16 = 11333;

/// Tunables for the mock listener and its sessions.
#[derive(Debug, Clone)]
pub struct MockConfig {
    /// Address the listener binds (wildcard host by default).
    pub address: String,
    /// Pending-connection queue depth passed to listen(2).
    pub backlog: u32,
    /// Sessions served at once. Further connections are accepted and wait
    /// for a free worker.
    pub max_sessions: usize,
    /// Upper bound on a single session read.
    pub recv_len: usize,
    /// How long a session waits for readability before looping.
    pub poll_timeout: Duration,
    /// Poll/read cycles a session may run before it is force-closed.
    pub iteration_budget: u32,
    /// How long `mock_recv` waits for a chunk to show up.
    pub session_wait: Duration,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            address: format!("0.0.0.0:{DEFAULT_MOCK_PORT}"),
            backlog: 5,
            max_sessions: 16,
            recv_len: 1000,
            poll_timeout: Duration::from_secs(1),
            iteration_budget: 10,
            session_wait: Duration::from_secs(10),
        }
    }
}

impl MockConfig {
    /// Defaults, overridden by `PROXY_MOCK_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(addr) = non_empty(&lookup, "PROXY_MOCK_ADDR") {
            config.address = addr;
        }
        if let Some(max) = parse_var(&lookup, "PROXY_MOCK_MAX_SESSIONS") {
            config.max_sessions = max;
        }
        if let Some(budget) = parse_var(&lookup, "PROXY_MOCK_ITERATIONS") {
            config.iteration_budget = budget;
        }
        debug!(?config, "config:mock loaded");
        config
    }

    /// Bind to an ephemeral loopback port. Used by self-contained tests.
    pub fn ephemeral() -> Self {
        Self::default().address("127.0.0.1:0")
    }

    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }

    pub fn recv_len(mut self, len: usize) -> Self {
        self.recv_len = len;
        self
    }

    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn iteration_budget(mut self, budget: u32) -> Self {
        self.iteration_budget = budget;
        self
    }

    pub fn session_wait(mut self, wait: Duration) -> Self {
        self.session_wait = wait;
        self
    }
}

/// Tunables for the controller's client connection to the proxy.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Address of the proxy under test.
    pub proxy_address: String,
    /// Upper bound on a single client read.
    pub client_recv_len: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            proxy_address: format!("127.0.0.1:{DEFAULT_PROXY_PORT}"),
            client_recv_len: 1024,
        }
    }
}

impl ControllerConfig {
    /// Defaults, with `PROXY_MOCK_PROXY_ADDR` overriding the proxy address.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(addr) = non_empty(&lookup, "PROXY_MOCK_PROXY_ADDR") {
            config.proxy_address = addr;
        }
        config
    }

    pub fn proxy_address(mut self, address: impl Into<String>) -> Self {
        self.proxy_address = address.into();
        self
    }
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key).filter(|v| !v.trim().is_empty())
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = non_empty(lookup, key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}
