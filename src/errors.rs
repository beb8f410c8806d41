//! Exchange-wide error type, Binance-compatible `{"code", "msg"}` envelope.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::exchange::account::AccountError;
use crate::exchange::matching::MatchingError;

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("unknown symbol {0}")]
    UnknownSymbol(String),
    #[error("unknown order")]
    UnknownOrder,
    #[error("unauthorized")]
    Unauthorized,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("stale request: recvWindow exceeded")]
    StaleRequest,
    #[error("malformed request: {0}")]
    BadRequest(String),
    #[error("insufficient balance")]
    InsufficientBalance,
    #[error("internal error")]
    Internal,
}

impl ExchangeError {
    /// Negative error code, matching Binance's `-1xxx`/`-2xxx` conventions.
    pub fn binance_code(&self) -> i64 {
        match self {
            ExchangeError::UnknownSymbol(_) => -1121,
            ExchangeError::UnknownOrder => -2013,
            ExchangeError::Unauthorized => -2014,
            ExchangeError::InvalidSignature => -1022,
            ExchangeError::StaleRequest => -1021,
            ExchangeError::BadRequest(_) => -1100,
            ExchangeError::InsufficientBalance => -2010,
            ExchangeError::Internal => -1000,
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ExchangeError::UnknownSymbol(_) | ExchangeError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ExchangeError::UnknownOrder => StatusCode::NOT_FOUND,
            ExchangeError::Unauthorized | ExchangeError::InvalidSignature | ExchangeError::StaleRequest => {
                StatusCode::UNAUTHORIZED
            }
            ExchangeError::InsufficientBalance => StatusCode::BAD_REQUEST,
            ExchangeError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    code: i64,
    msg: String,
}

impl IntoResponse for ExchangeError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            code: self.binance_code(),
            msg: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}

impl From<MatchingError> for ExchangeError {
    fn from(err: MatchingError) -> Self {
        match err {
            MatchingError::UnknownSymbol(s) => ExchangeError::UnknownSymbol(s),
            MatchingError::UnknownOrder => ExchangeError::UnknownOrder,
            MatchingError::Unauthorized => ExchangeError::Unauthorized,
            MatchingError::Account(e) => e.into(),
        }
    }
}

impl From<AccountError> for ExchangeError {
    fn from(err: AccountError) -> Self {
        match err {
            AccountError::UnknownUser(_) => ExchangeError::Unauthorized,
            AccountError::InsufficientBalance { .. } => ExchangeError::InsufficientBalance,
            AccountError::OverRelease { .. } => ExchangeError::Internal,
        }
    }
}
