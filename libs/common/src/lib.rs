//! Shared plumbing for domus services
//!
//! Provides the pieces every service binary needs:
//! - logging bootstrap
//! - graceful shutdown signal handling

pub mod logging;
pub mod shutdown;
