//! Fixtures and harnesses for exercising runledger against real SQLite files.

pub mod fixtures;
pub mod harness;
pub mod mock;

pub use fixtures::*;
pub use harness::TestLedger;
pub use mock::{Answer, FakeProbe, RecordingAuxService, ScriptedConfirmation};
