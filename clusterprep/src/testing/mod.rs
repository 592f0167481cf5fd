//! Testing utilities.
//!
//! [`ScriptedTransport`] stands in for SSH: it answers commands from a
//! script and records every call so tests can assert on what each node saw.

mod mocks;

pub use mocks::{RecordedCall, Scripted, ScriptedTransport};
