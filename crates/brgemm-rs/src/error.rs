use thiserror::Error;

/// Recoverable failures of the brgemm dispatch layer.
///
/// Programmer errors (missing compiled kernel at execute time, violated
/// reference-kernel preconditions) are not represented here; they abort via
/// [`brgemm_assert!`](crate::brgemm_assert).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrgemmError {
    #[error("unsupported brgemm configuration: {message}")]
    Unsupported { message: String },
    #[error("invalid brgemm call arguments: {message}")]
    InvalidArguments { message: String },
    #[error("invalid brgemm metadata: {message}")]
    InvalidMetadata { message: String },
    #[error("brgemm kernel compilation failed: {message}")]
    Compilation { message: String },
    #[error("brgemm kernel execution failed: {message}")]
    Execution { message: String },
}

impl BrgemmError {
    pub fn unsupported(message: impl Into<String>) -> Self {
        BrgemmError::Unsupported {
            message: message.into(),
        }
    }

    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        BrgemmError::InvalidArguments {
            message: message.into(),
        }
    }

    pub fn invalid_metadata(message: impl Into<String>) -> Self {
        BrgemmError::InvalidMetadata {
            message: message.into(),
        }
    }

    pub fn compilation(message: impl Into<String>) -> Self {
        BrgemmError::Compilation {
            message: message.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        BrgemmError::Execution {
            message: message.into(),
        }
    }
}

/// Convenience alias for results returned by brgemm routines.
pub type BrgemmResult<T> = Result<T, BrgemmError>;

/// Aborts on a broken executor invariant.
///
/// These conditions indicate a construction or configuration bug upstream and
/// are never surfaced as a [`BrgemmError`].
#[macro_export]
macro_rules! brgemm_fatal {
    ($($arg:tt)+) => {
        panic!("[brgemm executor] {}", format_args!($($arg)+))
    };
}

#[macro_export]
macro_rules! brgemm_assert {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::brgemm_fatal!($($arg)+);
        }
    };
}
