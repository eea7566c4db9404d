//! Convergence primitives shared by the deployer.
//!
//! - [`retry`]: the retry driver. Operations implement [`Retryable`] and a
//!   strategy decides when to give up (attempt count, deadline, or never).
//! - [`hash`]: deterministic hashing of JSON documents, used to fingerprint
//!   the desired state pushed to an agent.
//!
//! # Invariants
//!
//! - A strategy never calls `attempt` again after a success or after an
//!   attempt reported itself as not retryable.
//! - The error returned on give-up is the last attempt's error, wrapped with
//!   the reason the strategy stopped.

pub mod hash;
pub mod retry;

pub use hash::SpecHash;
pub use retry::{
    AttemptRetryStrategy, RetryError, Retryable, TimeoutRetryStrategy, UnlimitedRetryStrategy,
};
