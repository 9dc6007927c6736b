//! A scriptable mock backend for testing protocol-forwarding proxies.
//!
//! [`MockServer`] listens where the proxy under test expects its backend,
//! runs one [`Session`] per accepted connection, and records every chunk the
//! proxy sends into a shared inbox. A [`Controller`] drives a real client
//! connection to the proxy and, through the mock server, plays the backend's
//! side: receiving forwarded requests, injecting replies, and dropping
//! connections.
//!
//! ```no_run
//! use proxy_mock::{Controller, ControllerConfig, Expect, MockConfig, MockServer};
//!
//! # fn main() -> proxy_mock::Result<()> {
//! let server = MockServer::start(MockConfig::default())?;
//! let mut c = Controller::connect(&server, ControllerConfig::default())?;
//!
//! c.client_send("^set a 0 0 1$")?;
//! c.client_send("^1$")?;
//! c.mock_recv(&Expect::literal("^set a 0 0 1\r\n1$"))?;
//! c.mock_send("^STORED$")?;
//! c.client_recv(&Expect::literal("^STORED$"))?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod controller;
pub mod error;
pub mod expect;
pub mod logger;
pub mod markers;
pub mod registry;
pub mod scenario;
pub mod server;
pub mod session;

#[cfg(test)]
mod test_proxy;

pub use config::{ControllerConfig, MockConfig};
pub use controller::Controller;
pub use error::{MockError, Result};
pub use expect::Expect;
pub use registry::Registry;
pub use scenario::{Scenario, Step};
pub use server::MockServer;
pub use session::Session;
