// =============================================================================
// Exchange error classification — transient vs. permanent
// =============================================================================
//
// The adapter classifies every failure so the core never has to inspect HTTP
// details. Transient errors (rate-limit, timeout, 5xx) are retried with capped
// backoff inside the adapter; permanent errors (bad argument, insufficient
// funds, min-notional breach) surface immediately and the caller adapts.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    /// Rate-limited, timed out, or server-side failure. Safe to retry.
    #[error("transient exchange error in {op}: {message}")]
    Transient { op: &'static str, message: String },

    /// The request itself is wrong (invalid symbol, insufficient funds,
    /// filter breach). Retrying is pointless.
    #[error("permanent exchange error in {op}: {message}")]
    Permanent { op: &'static str, message: String },
}

impl ExchangeError {
    pub fn transient(op: &'static str, message: impl Into<String>) -> Self {
        Self::Transient {
            op,
            message: message.into(),
        }
    }

    pub fn permanent(op: &'static str, message: impl Into<String>) -> Self {
        Self::Permanent {
            op,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Classify an HTTP status + body into the right variant.
    ///
    /// 429 (rate limit), 418 (IP ban) and all 5xx responses are transient;
    /// every other non-success status is permanent.
    pub fn from_status(op: &'static str, status: u16, body: &str) -> Self {
        let message = format!("HTTP {status}: {body}");
        if status == 429 || status == 418 || (500..600).contains(&status) {
            Self::transient(op, message)
        } else {
            Self::permanent(op, message)
        }
    }

    /// Classify a reqwest transport error. Timeouts and connection failures
    /// are transient; everything else (e.g. body decode) is permanent.
    pub fn from_reqwest(op: &'static str, err: &reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Self::transient(op, err.to_string())
        } else {
            Self::permanent(op, err.to_string())
        }
    }
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_is_transient() {
        let err = ExchangeError::from_status("place_order", 429, "Too many requests");
        assert!(err.is_transient());
    }

    #[test]
    fn server_errors_are_transient() {
        for status in [500, 502, 503, 504] {
            assert!(ExchangeError::from_status("ticker", status, "oops").is_transient());
        }
    }

    #[test]
    fn client_errors_are_permanent() {
        let err = ExchangeError::from_status("place_order", 400, "Filter failure: MIN_NOTIONAL");
        assert!(!err.is_transient());
    }

    #[test]
    fn ip_ban_is_transient() {
        assert!(ExchangeError::from_status("klines", 418, "banned").is_transient());
    }

    #[test]
    fn display_carries_operation() {
        let err = ExchangeError::permanent("cancel_order", "unknown order");
        assert!(err.to_string().contains("cancel_order"));
        assert!(err.to_string().contains("unknown order"));
    }
}
