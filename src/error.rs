use thiserror::Error;

/// Postgres SQLSTATEs that mean "another transaction got there first".
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";
const LOCK_NOT_AVAILABLE: &str = "55P03";
const QUERY_CANCELED: &str = "57014";

/// Every failure a core operation can report. Any error aborts the whole
/// transaction, so callers never observe a partial write.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("insufficient funds: need {required_cents} cents, have {available_cents}")]
    InsufficientFunds {
        required_cents: i64,
        available_cents: i64,
    },

    #[error("insufficient shares: want to sell {requested}, hold {held}")]
    InsufficientShares { requested: f64, held: f64 },

    #[error("trade too small: {0}")]
    TradeTooSmall(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

impl EngineError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        EngineError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// True when the request itself was fine and may succeed if sent again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Conflict(_) | EngineError::Internal(_))
    }

    /// Stable machine-readable code for the outer layer.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NotFound { .. } => "NOT_FOUND",
            EngineError::InvalidState(_) => "INVALID_STATE",
            EngineError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            EngineError::InsufficientShares { .. } => "INSUFFICIENT_SHARES",
            EngineError::TradeTooSmall(_) => "TRADE_TOO_SMALL",
            EngineError::InvalidInput(_) => "INVALID_INPUT",
            EngineError::Forbidden(_) => "FORBIDDEN",
            EngineError::Conflict(_) => "CONFLICT",
            EngineError::Internal(_) => "INTERNAL",
        }
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::PoolTimedOut = err {
            return EngineError::Internal("connection pool exhausted".to_string());
        }

        let code = err
            .as_database_error()
            .and_then(|db| db.code())
            .map(|c| c.into_owned());

        match code.as_deref() {
            Some(SERIALIZATION_FAILURE) | Some(DEADLOCK_DETECTED) | Some(LOCK_NOT_AVAILABLE) => {
                EngineError::Conflict(err.to_string())
            }
            Some(QUERY_CANCELED) => EngineError::Internal(format!("statement timed out: {}", err)),
            _ => EngineError::Internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_conflict_and_internal_are_retryable() {
        assert!(EngineError::Conflict("x".into()).is_retryable());
        assert!(EngineError::Internal("x".into()).is_retryable());
        assert!(!EngineError::TradeTooSmall("x".into()).is_retryable());
        assert!(!EngineError::not_found("market", 7).is_retryable());
        assert!(!EngineError::InsufficientFunds {
            required_cents: 10,
            available_cents: 5
        }
        .is_retryable());
    }

    #[test]
    fn pool_timeout_is_internal() {
        let err: EngineError = sqlx::Error::PoolTimedOut.into();
        assert_eq!(err.code(), "INTERNAL");
    }

    #[test]
    fn not_found_message_names_entity() {
        assert_eq!(
            EngineError::not_found("market", 42).to_string(),
            "market not found: 42"
        );
    }
}
