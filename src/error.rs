//! Error type surfaced by the admission middleware
use std::fmt;

/// Error returned by services wrapped in [`RateLimitLayer`](crate::rate_limit::RateLimitLayer).
///
/// A denial is an ordinary outcome, not a fault: callers should map
/// `RateLimited` to a "try again later" response for the end user.
#[derive(Debug, Clone)]
pub enum AdmissionError<E> {
    /// A limiter level denied the request (or the timeout budget ran out)
    RateLimited { limiter: String },
    /// The wrapped service failed after admission
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for AdmissionError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited { limiter } => write!(f, "rate limited by '{}'", limiter),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for AdmissionError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RateLimited { .. } => None,
        }
    }
}

impl<E> AdmissionError<E> {
    /// Check if this error is an admission denial
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
    /// Check if this error wraps an inner error.
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }
    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
    /// Borrow the inner error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
    /// Name of the limiter that denied the request, if this is a denial.
    pub fn limiter(&self) -> Option<&str> {
        match self {
            Self::RateLimited { limiter } => Some(limiter),
            _ => None,
        }
    }
}
