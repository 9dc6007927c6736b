use std::io;

/// Errors raised by the mock backend and the scenario controller.
///
/// Connection-level failures (`Bind`, `Accept`, `SessionIo`) tear down the
/// unit that hit them. Usage and assertion failures (`NoActiveSession`,
/// `AssertionMismatch`) are returned to whoever drives the scenario.
#[derive(Debug, thiserror::Error)]
pub enum MockError {
    #[error("could not bind mock listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("mock listener accept failed: {0}")]
    Accept(#[source] io::Error),

    #[error("session {session} I/O failure: {source}")]
    SessionIo {
        session: u64,
        #[source]
        source: io::Error,
    },

    #[error("no active mock session to send on")]
    NoActiveSession,

    #[error("{target} received {actual:?}, expected {expected}")]
    AssertionMismatch {
        target: &'static str,
        expected: String,
        actual: String,
    },

    #[error("client socket I/O failure: {0}")]
    ClientIo(#[source] io::Error),

    #[error("could not connect client to proxy at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid expectation pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

pub type Result<T, E = MockError> = std::result::Result<T, E>;
