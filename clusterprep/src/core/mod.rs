//! Core types: instructions, digests, node states and outcomes.

mod digest;
mod instruction;
mod outcome;
mod status;

pub use digest::StageDigest;
pub use instruction::{quote_remote_path, shell_quote, ExecutionResult, Instruction};
pub use outcome::NodeOutcome;
pub use status::NodeState;
