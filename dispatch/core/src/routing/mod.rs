//! Request Routing and Admission Control
//!
//! Decides which provider and model serve a completion request, and keeps
//! traffic to each provider inside its rate and concurrency limits.
//!
//! # Architecture
//!
//! ```text
//! +------------------+
//! |      Router      |  <-- Entry point for all completion requests
//! +--------+---------+
//!          |
//!    +-----+------------------+
//!    |                        |
//!    v                        v
//! +---------------+   +------------------+
//! | FallbackChain |   |   ModelCatalog   |  <-- Scoring for single-provider mode
//! +-------+-------+   +------------------+
//!         |
//!         v
//! +------------------+   +------------------+
//! |ConcurrencyManager|-->|   RateLimiter    |  <-- Admission: permit, then token
//! +--------+---------+   +------------------+
//!          |
//!          v
//! +------------------+
//! |   LlmProvider    |  <-- Errors flow back through the classifier
//! +------------------+
//! ```
//!
//! # Design Principles
//!
//! 1. **Bounded Load**: No provider sees more in-flight calls than its limit
//! 2. **Classified Failures**: Retry decisions come from one error taxonomy
//! 3. **Graceful Degradation**: Rate-limited providers give way to the next candidate

pub mod classifier;
pub mod config;
pub mod fallback;
pub mod metrics;
pub mod policy;
pub mod rate_limit;
pub mod router;
pub mod semaphore;

pub use classifier::*;
pub use config::*;
pub use fallback::*;
pub use policy::*;
pub use rate_limit::*;
pub use router::*;
pub use semaphore::*;
