//! Typed error taxonomy for venue and engine failures.
//!
//! Retryable vs fatal is carried in the type, never inferred from message
//! strings. Only `TransientNetwork`, `RateLimited` and `StoreBusy` are safe
//! to retry blindly; everything else is handed to the reconciler, which
//! re-derives intent from venue truth.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum VenueError {
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("IP banned until {until_ms}")]
    Banned { until_ms: i64 },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("invalid parameter (code {code}): {msg}")]
    InvalidParam { code: i64, msg: String },

    #[error("insufficient margin")]
    InsufficientBalance,

    #[error("reduce-only order rejected")]
    ReduceOnlyRejected,

    #[error("order does not exist")]
    OrderNotFound,

    #[error("position not found")]
    PositionNotFound,

    #[error("store busy")]
    StoreBusy,

    #[error("stream disconnected: {0}")]
    StreamDisconnected(String),

    #[error("configuration invalid: {0}")]
    ConfigInvalid(String),

    #[error("consistency violation: {0}")]
    ConsistencyViolation(String),

    #[error("venue error (code {code}): {msg}")]
    UnknownVenue { code: i64, msg: String },
}

impl VenueError {
    /// Whether a caller may retry this error locally with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            VenueError::TransientNetwork(_)
                | VenueError::RateLimited { .. }
                | VenueError::StoreBusy
        )
    }

    /// Map a venue error body (`{"code": -2022, "msg": "..."}`) into the
    /// closed set. Codes follow the Binance futures convention the venue
    /// speaks.
    pub fn from_code(code: i64, msg: &str) -> Self {
        match code {
            -1106 | -4164 | -1111 | -1013 => VenueError::InvalidParam {
                code,
                msg: msg.to_string(),
            },
            -2019 => VenueError::InsufficientBalance,
            -2022 => VenueError::ReduceOnlyRejected,
            -2013 => VenueError::OrderNotFound,
            -4046 | -4059 => {
                // "No need to change margin type" / "No need to change position side"
                // are surfaced as invalid-param so the caller can treat them as
                // no-ops without a dedicated variant.
                VenueError::InvalidParam {
                    code,
                    msg: msg.to_string(),
                }
            }
            -2014 | -2015 | -1022 => VenueError::Auth(msg.to_string()),
            -1003 => VenueError::RateLimited {
                retry_after_ms: 1_000,
            },
            _ => VenueError::UnknownVenue {
                code,
                msg: msg.to_string(),
            },
        }
    }

    /// True for the "no change was necessary" responses to leverage /
    /// margin-type / position-mode setup calls.
    pub fn is_no_change(&self) -> bool {
        matches!(
            self,
            VenueError::InvalidParam { code, .. } if *code == -4046 || *code == -4059
        )
    }
}

pub type VenueResult<T> = Result<T, VenueError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_mapping_covers_recognized_set() {
        assert!(matches!(
            VenueError::from_code(-2022, "ReduceOnly Order is rejected"),
            VenueError::ReduceOnlyRejected
        ));
        assert!(matches!(
            VenueError::from_code(-2019, "Margin is insufficient"),
            VenueError::InsufficientBalance
        ));
        assert!(matches!(
            VenueError::from_code(-2013, "Order does not exist"),
            VenueError::OrderNotFound
        ));
        assert!(matches!(
            VenueError::from_code(-1106, "Parameter sent when not required"),
            VenueError::InvalidParam { code: -1106, .. }
        ));
        assert!(matches!(
            VenueError::from_code(-4164, "Order's notional must be no smaller"),
            VenueError::InvalidParam { code: -4164, .. }
        ));
        assert!(matches!(
            VenueError::from_code(-9999, "whatever"),
            VenueError::UnknownVenue { .. }
        ));
    }

    #[test]
    fn retryability_is_carried_on_the_type() {
        assert!(VenueError::TransientNetwork("reset".into()).is_retryable());
        assert!(VenueError::RateLimited { retry_after_ms: 1 }.is_retryable());
        assert!(VenueError::StoreBusy.is_retryable());
        assert!(!VenueError::ReduceOnlyRejected.is_retryable());
        assert!(!VenueError::OrderNotFound.is_retryable());
        assert!(!VenueError::Auth("bad key".into()).is_retryable());
    }

    #[test]
    fn no_change_setup_errors_are_detected() {
        assert!(VenueError::from_code(-4046, "No need to change margin type.").is_no_change());
        assert!(!VenueError::from_code(-1106, "x").is_no_change());
    }
}
