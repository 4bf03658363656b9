//! A concurrent, in-process, read-through caching engine.
//!
//! # Features
//! - **Read-through loading**: A configured loader is invoked on miss;
//!   concurrent gets for the same key collapse onto one invocation.
//! - **Cached exceptions**: Loader failures are cached with their own expiry
//!   and rethrown, so a failing source is not hammered.
//! - **Refresh ahead**: Entries can be reloaded just before they expire, as
//!   long as they keep being accessed.
//! - **Bounded loader pool**: Background loads run on a fixed worker pool;
//!   saturation pushes work back onto the submitting thread instead of
//!   queueing unboundedly.
//! - **Entry processors**: Atomic per-key read-modify-write operations with
//!   lazy read-through.
//! - **Observability**: A detailed statistics snapshot, switchable to
//!   zero-cost no-ops.

// Public modules that form the API
pub mod builder;
pub mod completion;
pub mod error;
pub mod handle;
pub mod loader;
pub mod metrics;
pub mod policy;
pub mod processor;

// Internal, crate-only modules
mod config;
mod entry;
mod expiry;
mod pool;
mod shared;
mod store;
mod task;
mod time;

// Re-export the primary user-facing types for convenience
pub use builder::CacheBuilder;
pub use completion::{CompletionListener, CompletionWaiter};
pub use config::{ExceptionExpiryCalculator, ExpiryCalculator};
pub use error::{BuildError, CacheError, LoadError};
pub use handle::Cache;
pub use loader::{AdvancedLoader, PreviousEntry};
pub use metrics::StatisticsSnapshot;
pub use policy::{ClockPolicy, EvictionPolicy};
pub use processor::MutableEntry;
