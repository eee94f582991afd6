//! Error injection framework for the mock gateway.
//!
//! Failures are keyed by driver call name (`"lock_buffer"`, `"wait_event"`, ...)
//! and surface as [`DriverError`]s of the requested kind, so tests can exercise
//! both transport and semantic failure paths of the capture core.

use super::rng::MockRng;
use parking_lot::Mutex;
use seqcam_core::{DriverError, DriverErrorKind};
use std::collections::HashMap;
use std::sync::Arc;

/// Driver status code used for injected semantic failures.
pub const INJECTED_STATUS: i32 = -1;

/// Which driver calls fail, and how.
///
/// Clones share scenario progress, so a config handed to the gateway can
/// still be [`reset`](Self::reset) from the test.
#[derive(Clone, Debug)]
pub struct ErrorConfig {
    /// Probability per call name; `"*"` matches calls without their own entry
    failure_rates: Arc<HashMap<&'static str, f64>>,
    scenarios: Arc<Vec<ErrorScenario>>,
    rng: Arc<MockRng>,
    progress: Arc<Mutex<ScenarioProgress>>,
}

#[derive(Debug, Clone)]
pub enum ErrorScenario {
    /// Fail after N successful calls
    FailAfterN {
        operation: &'static str,
        count: u32,
    },
    /// Fail every call of this operation
    Always {
        operation: &'static str,
        kind: DriverErrorKind,
    },
    /// Fail the first call of this operation only
    Once {
        operation: &'static str,
        kind: DriverErrorKind,
    },
    /// Every call fails with a transport error once this operation is reached
    CommunicationLossAt { operation: &'static str },
}

impl ErrorScenario {
    /// Driver call this scenario is keyed on.
    pub fn operation(&self) -> &'static str {
        match self {
            ErrorScenario::FailAfterN { operation, .. }
            | ErrorScenario::Always { operation, .. }
            | ErrorScenario::Once { operation, .. }
            | ErrorScenario::CommunicationLossAt { operation } => *operation,
        }
    }
}

#[derive(Default, Debug)]
struct ScenarioProgress {
    calls_seen: HashMap<&'static str, u32>,
    fired_once: Vec<&'static str>,
    link_down: bool,
}

fn injected(operation: &'static str, kind: DriverErrorKind, message: String) -> DriverError {
    match kind {
        DriverErrorKind::Transport => DriverError::transport(operation, message),
        DriverErrorKind::Semantic => DriverError::semantic(operation, INJECTED_STATUS, message),
    }
}

impl ErrorConfig {
    /// Every call succeeds.
    pub fn none() -> Self {
        Self::build(HashMap::new(), Vec::new(), None)
    }

    /// Every call fails semantically with probability `rate`.
    pub fn random_failures_seeded(rate: f64, seed: Option<u64>) -> Self {
        Self::build(HashMap::from([("*", rate)]), Vec::new(), seed)
    }

    pub fn scenario(scenario: ErrorScenario) -> Self {
        Self::scenarios(vec![scenario])
    }

    /// Scenarios are checked in order; the first matching failure wins.
    pub fn scenarios(scenarios: Vec<ErrorScenario>) -> Self {
        Self::build(HashMap::new(), scenarios, None)
    }

    /// Random semantic failures with a probability per call name.
    pub fn with_rates(rates: HashMap<&'static str, f64>, seed: Option<u64>) -> Self {
        Self::build(rates, Vec::new(), seed)
    }

    fn build(
        rates: HashMap<&'static str, f64>,
        scenarios: Vec<ErrorScenario>,
        seed: Option<u64>,
    ) -> Self {
        Self {
            failure_rates: Arc::new(rates),
            scenarios: Arc::new(scenarios),
            rng: Arc::new(MockRng::new(seed)),
            progress: Arc::new(Mutex::new(ScenarioProgress::default())),
        }
    }

    /// Decide the fate of one call to `operation`.
    ///
    /// Once the link is down every call fails with a transport error.
    pub fn check_operation(&self, operation: &'static str) -> Result<(), DriverError> {
        let mut progress = self.progress.lock();
        if progress.link_down {
            return Err(DriverError::transport(operation, "communication lost"));
        }

        for scenario in self.scenarios.iter().filter(|s| s.operation() == operation) {
            match *scenario {
                ErrorScenario::FailAfterN { count, .. } => {
                    let seen = progress.calls_seen.entry(operation).or_default();
                    *seen += 1;
                    if *seen > count {
                        return Err(injected(
                            operation,
                            DriverErrorKind::Semantic,
                            format!("injected failure after {} calls", count),
                        ));
                    }
                }
                ErrorScenario::Always { kind, .. } => {
                    return Err(injected(operation, kind, "injected failure".to_string()));
                }
                ErrorScenario::Once { kind, .. } => {
                    if !progress.fired_once.contains(&operation) {
                        progress.fired_once.push(operation);
                        return Err(injected(operation, kind, "injected one-shot failure".to_string()));
                    }
                }
                ErrorScenario::CommunicationLossAt { .. } => {
                    progress.link_down = true;
                    tracing::debug!(operation, "mock link down");
                    return Err(DriverError::transport(operation, "communication lost"));
                }
            }
        }
        drop(progress);

        let rate = self
            .failure_rates
            .get(operation)
            .or_else(|| self.failure_rates.get("*"))
            .copied()
            .unwrap_or(0.0);
        if self.rng.chance(rate) {
            return Err(injected(
                operation,
                DriverErrorKind::Semantic,
                format!("random failure on '{}'", operation),
            ));
        }
        Ok(())
    }

    /// Forget scenario progress and bring the link back up.
    pub fn reset(&self) {
        *self.progress.lock() = ScenarioProgress::default();
    }
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self::none()
    }
}
