// This is the core library crate for bremote-link.
// It holds the backend logic for the TX <-> RX radio link test:
// serial channels, telemetry decoding, correlation and analysis.

pub mod analyzer;     // Link quality statistics and the PASS/FAIL verdict
pub mod channel;      // Half-duplex command channels to the devices
pub mod config;       // Test configuration structures
pub mod correlation;  // Two listeners feeding a shared ledger
pub mod decoder;      // Newline-delimited JSON extraction from raw bytes
pub mod device_checks; // Per-device checks run before the link test
pub mod error;        // Error types used at setup time
pub mod ledger;       // Samples and TX/RX matching
pub mod loopback;     // Simulated TX/RX device pair
pub mod orchestrator; // Runs a full link test and builds the report
pub mod telemetry;    // Telemetry frame definitions

pub use analyzer::{analyze, FailureReason, LinkVerdict, TestResult};
pub use channel::{Channel, ChannelTarget};
pub use config::LinkTestConfig;
pub use correlation::{CorrelationEngine, EngineState};
pub use error::{ChannelError, LinkError};
pub use device_checks::{run_device_checks, DeviceReport, DeviceRole};
pub use orchestrator::{run_integration_test, run_link_test, run_link_test_on, IntegrationReport, LinkReport};
