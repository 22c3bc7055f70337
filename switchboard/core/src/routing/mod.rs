#![allow(missing_docs)]
//! Role-Based Backend Routing
//!
//! # Architecture
//!
//! ```text
//! +------------------+
//! |     Registry     |  <-- select(role) / execute(role, prompt)
//! +--------+---------+
//!          |
//!          v
//! +------------------+
//! |   RetryEngine    |  <-- bounded exponential backoff, cancellable
//! +--------+---------+
//!          |
//!    +-----+-----+
//!    |     |     |
//!    v     v     v
//! +----+ +----+ +----+
//! | A  | | B  | | C  |  <-- dyn Backend (optionally CachedBackend)
//! +----+ +----+ +----+
//! ```
//!
//! Every call reports a [`MetricEvent`] to the [`MetricsCollector`]. At
//! startup the [`ParallelValidator`] probes all backends at once.
//!
//! # Design Principles
//!
//! 1. **Static Routing Tables**: role and backend maps are fixed at construction
//! 2. **All-or-Nothing Startup**: one failed probe fails the whole registry
//! 3. **Classified Retries**: only transient error codes are retried

pub mod metrics;
pub mod registry;
pub mod retry;
pub mod validator;

pub use metrics::*;
pub use registry::*;
pub use retry::*;
pub use validator::*;
