//! Device engines: firmware bring-up, interface discovery and the bulk
//! loop-back test.

pub mod bringup;
pub mod bulk;
pub mod discovery;

pub use bringup::{BringUpError, BringUpStep, BringUpSummary, bring_up};
pub use bulk::{
    AsyncBulkTest, AsyncTestState, BulkPipes, BulkTestError, BulkTestReport, PipeRequest,
    TestMode, Transition, run_async, run_sync,
};
pub use discovery::{DiscoveredInterface, DiscoveryError, find_interface};
