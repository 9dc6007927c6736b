//! Declarative scenario scripts.
//!
//! A scenario is a YAML document with a name and an ordered list of steps.
//! Payload strings use the same `^`/`$` markers as the controller API:
//!
//! ```yaml
//! name: simple_set
//! description: Test simple set against mock server
//! steps:
//!   - op: client_send
//!     data: "^set a 0 0 1$"
//!   - op: client_send
//!     data: "^1$"
//!   - op: mock_recv
//!     literal: "^set a 0 0 1\r\n1$"
//!   - op: mock_send
//!     data: "^STORED$"
//!   - op: client_recv
//!     literal: "^STORED$"
//! ```

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::controller::Controller;
use crate::error::MockError;
use crate::expect::Expect;

/// A named, ordered list of steps.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Scenario {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub steps: Vec<Step>,
}

/// One scripted action or assertion.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    ClientSend {
        data: String,
    },
    MockSend {
        data: String,
    },
    ClientRecv {
        #[serde(default)]
        literal: Option<String>,
        #[serde(default)]
        pattern: Option<String>,
    },
    MockRecv {
        #[serde(default)]
        literal: Option<String>,
        #[serde(default)]
        pattern: Option<String>,
    },
    Wait {
        ms: u64,
    },
    ExpectQuiet,
    MockClose,
    ClientClose,
}

impl Step {
    fn op(&self) -> &'static str {
        match self {
            Step::ClientSend { .. } => "client_send",
            Step::MockSend { .. } => "mock_send",
            Step::ClientRecv { .. } => "client_recv",
            Step::MockRecv { .. } => "mock_recv",
            Step::Wait { .. } => "wait",
            Step::ExpectQuiet => "expect_quiet",
            Step::MockClose => "mock_close",
            Step::ClientClose => "client_close",
        }
    }

    fn run(&self, controller: &mut Controller<'_>) -> Result<()> {
        match self {
            Step::ClientSend { data } => controller.client_send(data)?,
            Step::MockSend { data } => controller.mock_send(data)?,
            Step::ClientRecv { literal, pattern } => {
                let expect = build_expect(literal.as_deref(), pattern.as_deref())?;
                controller.client_recv(&expect)?;
            }
            Step::MockRecv { literal, pattern } => {
                let expect = build_expect(literal.as_deref(), pattern.as_deref())?;
                controller.mock_recv(&expect)?;
            }
            Step::Wait { ms } => controller.wait(Duration::from_millis(*ms)),
            Step::ExpectQuiet => {
                if !controller.is_quiet() {
                    let pending = controller.server().registry().received_len();
                    return Err(MockError::AssertionMismatch {
                        target: "mock",
                        expected: "no traffic".to_string(),
                        actual: format!("{pending} unconsumed chunk(s)"),
                    }
                    .into());
                }
            }
            Step::MockClose => controller.mock_close(),
            Step::ClientClose => controller.client_close(),
        }
        Ok(())
    }
}

/// Exactly one of `literal` or `pattern` must be given.
fn build_expect(literal: Option<&str>, pattern: Option<&str>) -> Result<Expect> {
    match (literal, pattern) {
        (Some(literal), None) => Ok(Expect::literal(literal)),
        (None, Some(pattern)) => Ok(Expect::pattern(pattern)?),
        (Some(_), Some(_)) => bail!("step gives both `literal` and `pattern`; choose one"),
        (None, None) => bail!("step needs one of `literal` or `pattern`"),
    }
}

impl Scenario {
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let scenario: Scenario =
            serde_yaml::from_str(contents).context("Failed to parse scenario")?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn load(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "scenario:reading file");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario at {}", path.display()))?;
        Self::from_yaml(&contents)
            .with_context(|| format!("Invalid scenario at {}", path.display()))
    }

    /// Catch malformed expectations before anything touches a socket.
    fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(anyhow!("scenario '{}' has no steps", self.name));
        }
        for (index, step) in self.steps.iter().enumerate() {
            if let Step::ClientRecv { literal, pattern } | Step::MockRecv { literal, pattern } =
                step
            {
                build_expect(literal.as_deref(), pattern.as_deref())
                    .with_context(|| format!("step {} ({})", index + 1, step.op()))?;
            }
        }
        Ok(())
    }

    /// Run every step in order, stopping at the first failure.
    pub fn run(&self, controller: &mut Controller<'_>) -> Result<()> {
        info!(scenario = %self.name, steps = self.steps.len(), "scenario:start");
        for (index, step) in self.steps.iter().enumerate() {
            debug!(scenario = %self.name, step = index + 1, op = step.op(), "scenario:step");
            step.run(controller).with_context(|| {
                format!("scenario '{}' step {} ({})", self.name, index + 1, step.op())
            })?;
        }
        info!(scenario = %self.name, "scenario:passed");
        Ok(())
    }
}
