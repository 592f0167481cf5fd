//! Execution engine: retry policy, log layout and the parallel dispatcher.

mod dispatch;
mod logs;
mod retry;


pub use dispatch::{DispatchReport, DispatchRequest, NodeTask, ParallelDispatcher};
pub use logs::LogLayout;
pub use retry::{retry_blocking, Backoff, RetryConfig};
