//! Reconciliation engine for lockmirror.
//!
//! Brings a mirror directory and a lock file into agreement: fetches and
//! verifies archives for eligible records under bounded concurrency, removes
//! unreferenced mirror entries, and rewrites the lock file to point at the
//! local copies.

pub mod error;
pub mod fetch;
pub mod hook;
pub mod limiter;
pub mod reconcile;

pub use error::{EngineError, FetchError};
pub use fetch::Fetcher;
pub use hook::{AfterRewrite, RemoveDerivedLockfile};
pub use limiter::Limiter;
pub use reconcile::{ReconcileReport, Reconciler};
