//! Error taxonomy and the fatal-diagnostic path.
//!
//! The hot path never threads errors back to callers: memory exhaustion in
//! the infallible API and every form of invalid free terminate the process
//! with a diagnostic. Only [`crate::Heap::try_allocate`] surfaces
//! [`AllocError`] for callers that want to back off instead of dying.

use std::error;
use std::fmt;

/// A recoverable allocation failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocError {
    /// The operating system refused to provide more anonymous memory.
    ExhaustedMemory {
        /// Bytes requested from the OS when the refusal happened.
        requested: usize,
    },
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::ExhaustedMemory { requested } => {
                write!(f, "the OS refused a mapping of {} bytes", requested)
            }
        }
    }
}

impl error::Error for AllocError {}

/// Print a diagnostic with source location and abort the process.
///
/// Used for conditions the allocator cannot recover from or report through
/// its return values: invalid frees and OOM in the infallible entry points.
macro_rules! die {
    ($($arg:tt)*) => {{
        log::error!($($arg)*);
        eprintln!(
            "emberalloc fatal error [{}:{}]: {}",
            file!(),
            line!(),
            format_args!($($arg)*)
        );
        std::process::abort();
    }};
}

pub(crate) use die;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_request() {
        let err = AllocError::ExhaustedMemory { requested: 8192 };
        assert!(err.to_string().contains("8192"));
    }
}
