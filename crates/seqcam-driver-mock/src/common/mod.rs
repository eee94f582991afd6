//! Common infrastructure for the mock gateway.
//!
//! - **mode**: Operational modes (Instant, Realistic, Chaos)
//! - **timing**: Hardware-like frame timing
//! - **errors**: Error injection framework
//! - **rng**: Seeded randomness for chaos mode and failure rates

pub mod errors;
pub mod mode;
pub mod rng;
pub mod timing;

// Re-export commonly used types
pub use errors::{ErrorConfig, ErrorScenario};
pub use mode::{ChaosConfig, MockMode};
pub use rng::MockRng;
pub use timing::TimingConfig;
