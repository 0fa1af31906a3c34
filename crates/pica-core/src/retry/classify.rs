//! Classify fetch errors into retryable and fatal kinds.

use super::error::{ArgError, HttpStatusError};
use crate::stop::Stopped;

/// What a failed attempt looked like, for logging and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Operation timed out (connect/read).
    Timeout,
    /// Network-level failure (connection reset, DNS, interrupted body).
    Connection,
    /// HTTP status worth another attempt: 408, 409, 425, 429, or 5xx.
    RetryableStatus(u16),
    /// Stop signal; propagated unchanged, never retried.
    Stopped,
    /// Everything else: argument errors, permanent statuses, broken
    /// upstream payloads, filesystem failures.
    Fatal,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout | ErrorKind::Connection | ErrorKind::RetryableStatus(_)
        )
    }
}

/// Classify an HTTP status for retry decisions.
pub fn classify_status(status: u16) -> ErrorKind {
    match status {
        408 | 409 | 425 | 429 => ErrorKind::RetryableStatus(status),
        500..=599 => ErrorKind::RetryableStatus(status),
        _ => ErrorKind::Fatal,
    }
}

/// Classify an error chain. Typed errors (`Stopped`, `ArgError`,
/// `HttpStatusError`) are recovered by downcast; transport errors fall back
/// to the reqwest error shape.
pub fn classify(err: &anyhow::Error) -> ErrorKind {
    if err.downcast_ref::<Stopped>().is_some() {
        return ErrorKind::Stopped;
    }
    if err.downcast_ref::<ArgError>().is_some() {
        return ErrorKind::Fatal;
    }
    if let Some(status) = err.downcast_ref::<HttpStatusError>() {
        return classify_status(status.status);
    }
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<reqwest::Error>() {
            if e.is_timeout() {
                return ErrorKind::Timeout;
            }
            if e.is_connect() || e.is_body() || e.is_request() {
                return ErrorKind::Connection;
            }
            return ErrorKind::Fatal;
        }
    }
    ErrorKind::Fatal
}
