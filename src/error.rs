// ===============================
// src/error.rs
// ===============================
/*
=============================================================================
Project : finlearn_trader — live market sync & paper-trading client in Rust
Module  : error.rs
Version : 0.1.0
Author  : Kukuh Tripamungkas Wicaksono (Kukuh TW)
Email   : kukuhtw@gmail.com
WhatsApp: https://wa.me/628129893706
LinkedIn: https://id.linkedin.com/in/kukuhtw
License : MIT (see LICENSE)

Summary : Keeps a self-healing WebSocket to the FinLearn price stream,
          reconciles price snapshots into a local quote book, values the
          paper portfolio on every tick, and executes buy/sell orders
          against the backend with authoritative reconciliation.

(c) 2025 Kukuh TW. All rights reserved where applicable.
=============================================================================
*/
use reqwest::StatusCode;
use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    /// Non-2xx response; `detail` comes from the body's `detail`/`error` field.
    #[error("{detail}")]
    Http { status: StatusCode, detail: String },
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl ApiError {
    /// Message shown for a non-2xx response body.
    pub fn from_body(status: StatusCode, body: &str) -> Self {
        let detail = serde_json::from_str::<serde_json::Value>(body)
            .ok()
            .and_then(|v| {
                v.get("detail")
                    .or_else(|| v.get("error"))
                    .and_then(|x| x.as_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| format!("HTTP error {}", status.as_u16()));
        ApiError::Http { status, detail }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Http { status, .. } if *status == StatusCode::UNAUTHORIZED || *status == StatusCode::FORBIDDEN)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum PortfolioError {
    #[error("insufficient cash: have {cash}, need {required}")]
    InsufficientCash { cash: Decimal, required: Decimal },
    #[error("insufficient shares of {symbol}: have {held}, requested {requested}")]
    InsufficientShares { symbol: String, held: Decimal, requested: Decimal },
    #[error("invalid balance reported: {0}")]
    NegativeBalance(Decimal),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session storage: {0}")]
    Io(#[from] std::io::Error),
    #[error("session file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error(transparent)]
    Api(#[from] ApiError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_detail_then_error_then_status() {
        let e = ApiError::from_body(StatusCode::BAD_REQUEST, r#"{"detail":"Not allowed"}"#);
        assert_eq!(e.to_string(), "Not allowed");
        let e = ApiError::from_body(StatusCode::BAD_REQUEST, r#"{"error":"Insufficient balance"}"#);
        assert_eq!(e.to_string(), "Insufficient balance");
        let e = ApiError::from_body(StatusCode::BAD_GATEWAY, "<html>");
        assert_eq!(e.to_string(), "HTTP error 502");
        assert!(ApiError::from_body(StatusCode::UNAUTHORIZED, "{}").is_unauthorized());
    }
}
