// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : finlearn_trader — live market sync & paper-trading client in Rust
Module  : config.rs
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
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use dotenvy::dotenv;
use rust_decimal::Decimal;

use crate::channel::RetryPolicy;
use crate::domain::{Period, Side, TradeRequest};

/// One-shot order from the command line: `side:SYMBOL:shares`, e.g. `buy:AAPL:10`.
#[derive(Clone, Debug, PartialEq)]
pub struct DemoTrade {
    pub side: Side,
    pub symbol: String,
    pub shares: Decimal,
}

impl DemoTrade {
    pub fn into_request(self, user_id: Option<i64>) -> TradeRequest {
        TradeRequest::new(self.symbol, self.shares, self.side).with_user(user_id)
    }
}

impl FromStr for DemoTrade {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').map(str::trim).collect();
        let [side, symbol, shares] = parts.as_slice() else {
            return Err(format!("expected side:SYMBOL:shares, got {s:?}"));
        };
        if symbol.is_empty() {
            return Err("empty symbol".into());
        }
        let shares = shares
            .parse::<Decimal>()
            .map_err(|e| format!("bad share count {shares:?}: {e}"))?;
        Ok(DemoTrade { side: side.parse()?, symbol: symbol.to_ascii_uppercase(), shares })
    }
}

#[derive(Parser, Clone, Debug)]
#[command(name = "finlearn_trader", version, about = "FinLearn live market sync & paper-trading client")]
pub struct Args {
    /// Price stream endpoint
    #[arg(long, env = "WS_URL", default_value = "ws://localhost:8000/ws/stocks/")]
    pub ws_url: String,

    #[arg(long, env = "API_BASE_URL", default_value = "http://localhost:8000/api")]
    pub api_base_url: String,

    /// Starting cash when no profile balance is available
    #[arg(long, env = "INITIAL_CASH", default_value = "100000.00")]
    pub initial_cash: Decimal,

    // reconnect policy
    #[arg(long, env = "MAX_RETRIES", default_value_t = 5)]
    pub max_retries: u32,
    #[arg(long, env = "BACKOFF_BASE_MS", default_value_t = 1_000)]
    pub backoff_base_ms: u64,
    #[arg(long, env = "BACKOFF_CAP_MS", default_value_t = 30_000)]
    pub backoff_cap_ms: u64,
    #[arg(long, env = "BACKOFF_JITTER_PCT", default_value_t = 10)]
    pub backoff_jitter_pct: u32,

    #[arg(long, env = "HISTORY_TIMEOUT_MS", default_value_t = 10_000)]
    pub history_timeout_ms: u64,
    #[arg(long, env = "HTTP_TIMEOUT_MS", default_value_t = 15_000)]
    pub http_timeout_ms: u64,

    // files/metrics
    #[arg(long, env = "SESSION_FILE", default_value = ".finlearn/session.json")]
    pub session_file: String,
    #[arg(long, env = "RECORD_FILE")]
    pub record_file: Option<String>,
    #[arg(long, env = "METRICS_PORT")]
    pub metrics_port: Option<u16>,

    /// Symbols logged in the heartbeat: WATCH_SYMBOLS=AAPL,MSFT
    #[arg(long, env = "WATCH_SYMBOLS", value_delimiter = ',', default_value = "AAPL,MSFT,GOOGL")]
    pub watch_symbols: Vec<String>,

    /// History window loaded for each watched symbol at startup
    #[arg(long, env = "HISTORY_PERIOD", default_value = "1mo")]
    pub history_period: Period,

    /// Demo order executed once quotes are loaded
    #[arg(long, env = "TRADE")]
    pub trade: Option<DemoTrade>,

    /// Forget the stored session and exit
    #[arg(long)]
    pub logout: bool,

    // credentials, used only when no stored session can be restored
    #[arg(long, env = "FINLEARN_USERNAME")]
    pub username: Option<String>,
    #[arg(long, env = "FINLEARN_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Create the account first (needs --email)
    #[arg(long, requires = "email")]
    pub register: bool,
    #[arg(long, env = "FINLEARN_EMAIL")]
    pub email: Option<String>,
}

impl Args {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base: Duration::from_millis(self.backoff_base_ms),
            cap: Duration::from_millis(self.backoff_cap_ms),
        }
    }

    pub fn history_timeout(&self) -> Duration { Duration::from_millis(self.history_timeout_ms) }
    pub fn http_timeout(&self) -> Duration { Duration::from_millis(self.http_timeout_ms) }

    pub fn watch_symbols(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .watch_symbols
            .iter()
            .map(|s| s.trim().to_ascii_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        out.dedup();
        out
    }
}

pub fn load() -> Args {
    // .env first so clap's `env` lookups see it
    let _ = dotenv();
    Args::parse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn demo_trade_parses() {
        let t: DemoTrade = "buy:aapl:10".parse().unwrap();
        assert_eq!(t, DemoTrade { side: Side::Buy, symbol: "AAPL".into(), shares: dec!(10) });
        let req = "s:KO:2.5".parse::<DemoTrade>().unwrap().into_request(Some(3));
        assert_eq!(req.side, Side::Sell);
        assert_eq!(req.shares, dec!(2.5));
        assert_eq!(req.user_id, Some(3));

        assert!("buy:AAPL".parse::<DemoTrade>().is_err());
        assert!("hold:AAPL:1".parse::<DemoTrade>().is_err());
        assert!("buy::1".parse::<DemoTrade>().is_err());
        assert!("buy:AAPL:ten".parse::<DemoTrade>().is_err());
    }

    #[test]
    fn flags_override_defaults() {
        let args = Args::try_parse_from([
            "finlearn_trader",
            "--max-retries", "3",
            "--backoff-base-ms", "500",
            "--watch-symbols", "tsla, ko,KO",
            "--history-period", "5d",
            "--trade", "sell:XOM:1",
        ])
        .unwrap();
        let p = args.retry_policy();
        assert_eq!(p.max_retries, 3);
        assert_eq!(p.base, Duration::from_millis(500));
        assert_eq!(args.watch_symbols(), vec!["TSLA", "KO"]);
        assert_eq!(args.history_period, Period::FiveDays);
        assert_eq!(args.trade.map(|t| t.symbol), Some("XOM".to_string()));
        assert!(!args.register);
    }

    #[test]
    fn register_needs_an_email() {
        assert!(Args::try_parse_from(["finlearn_trader", "--register"]).is_err());
        let args = Args::try_parse_from(["finlearn_trader", "--register", "--email", "ana@example.com"]).unwrap();
        assert!(args.register);
        assert_eq!(args.email.as_deref(), Some("ana@example.com"));
    }
}
