//! Logging facade over the `tracing` crate.
//!
//! With the `tracing-integration` feature enabled the event macros re-export
//! from `tracing`; without it they compile to nothing, so the hot I/O paths
//! carry no logging cost in minimal builds.
//!
//! # Usage
//!
//! ```rust,ignore
//! use tlsbridge::tracing_compat::{debug, trace, warn};
//!
//! trace!(bytes = n, "ciphertext drained");
//! warn!("zero-length kernel write observed");
//! ```

#[cfg(feature = "tracing-integration")]
pub use tracing::{debug, error, trace, warn};

#[cfg(not(feature = "tracing-integration"))]
mod noop {
    //! No-op macro bodies compiled when tracing is disabled.

    /// No-op trace-level logging macro.
    #[macro_export]
    macro_rules! trace {
        ($($arg:tt)*) => {};
    }

    /// No-op debug-level logging macro.
    #[macro_export]
    macro_rules! debug {
        ($($arg:tt)*) => {};
    }

    /// No-op warn-level logging macro.
    #[macro_export]
    macro_rules! warn {
        ($($arg:tt)*) => {};
    }

    /// No-op error-level logging macro.
    #[macro_export]
    macro_rules! error {
        ($($arg:tt)*) => {};
    }

    pub use crate::{debug, error, trace, warn};
}

#[cfg(not(feature = "tracing-integration"))]
pub use noop::*;

#[cfg(test)]
mod tests {
    #[allow(unused_imports)]
    use super::*;

    #[test]
    fn event_macros_compile() {
        trace!("trace message");
        debug!(bytes = 4, "debug with field");
        warn!("warn message");
        error!(code = 1, "error with field");
    }
}
