// Deferred request scheduler: orders outbound API calls by eligible time,
// dispatches them when due and retries failures with a fixed delay.

pub mod batch;
pub mod dedup_gate;
pub mod dispatch;
pub mod executor;
pub mod owner_throttle;
pub mod priority_queue;
pub mod retry_policy;
pub mod scheduled_item;
pub mod scheduler;

// Re-export key types for convenience
pub use batch::{BatchConfig, BatchProducer, BatchSubmission, BatchTemplate};
pub use dedup_gate::{DedupConfig, DedupGate, DedupStats};
pub use dispatch::DispatchPolicy;
pub use executor::{Executor, HttpExecutor, Response, TransportError};
pub use owner_throttle::ThrottleMode;
pub use priority_queue::KeyedMinHeap;
pub use retry_policy::{RetryConfig, RetryPolicy};
pub use scheduled_item::{ItemState, Method, Outcome, ScheduledItem};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerError};
