// ===============================
// src/domain.rs
// ===============================
/*
=============================================================================
Project : finlearn_trader — live market sync & paper-trading client in Rust
Module  : domain.rs
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
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side { Buy, Sell }

impl Side {
    pub fn as_str(&self) -> &'static str { match self { Side::Buy => "buy", Side::Sell => "sell" } }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for Side {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buy" | "b" => Ok(Side::Buy),
            "sell" | "s" => Ok(Side::Sell),
            other => Err(format!("unknown side: {other}")),
        }
    }
}

/// History windows the price service understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Period {
    #[serde(rename = "1d")] OneDay,
    #[serde(rename = "5d")] FiveDays,
    #[serde(rename = "1mo")] OneMonth,
    #[serde(rename = "3mo")] ThreeMonths,
    #[serde(rename = "1y")] OneYear,
}

impl Period {
    pub const ALL: [Period; 5] =
        [Period::OneDay, Period::FiveDays, Period::OneMonth, Period::ThreeMonths, Period::OneYear];

    pub fn as_str(&self) -> &'static str {
        match self {
            Period::OneDay => "1d",
            Period::FiveDays => "5d",
            Period::OneMonth => "1mo",
            Period::ThreeMonths => "3mo",
            Period::OneYear => "1y",
        }
    }
}

impl Default for Period {
    fn default() -> Self { Period::OneMonth }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for Period {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Period::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == s.trim())
            .ok_or_else(|| format!("unknown period: {s}"))
    }
}

/// Latest quote for one ticker, as pushed by the stream or listed by REST.
///
/// `price_change`/`price_change_percent` sent by the server are ignored and
/// recomputed from `current_price` and `previous_close`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceQuote {
    #[serde(default)]
    pub id: i64,
    pub symbol: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub sector: String,
    pub current_price: Decimal,
    #[serde(default)]
    pub previous_close: Decimal,
    #[serde(default)]
    pub day_high: Option<Decimal>,
    #[serde(default)]
    pub day_low: Option<Decimal>,
    #[serde(default)]
    pub volume: Option<u64>,
}

impl PriceQuote {
    pub fn change(&self) -> Decimal {
        if self.previous_close.is_zero() {
            return Decimal::ZERO;
        }
        self.current_price - self.previous_close
    }

    pub fn change_percent(&self) -> Decimal {
        if self.previous_close.is_zero() {
            return Decimal::ZERO;
        }
        (self.change() / self.previous_close) * Decimal::ONE_HUNDRED
    }
}

/// One OHLCV bar of a history series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRequest {
    pub symbol: String,
    pub shares: Decimal,
    pub side: Side,
    #[serde(default)]
    pub user_id: Option<i64>,
}

impl TradeRequest {
    pub fn new(symbol: impl Into<String>, shares: Decimal, side: Side) -> Self {
        Self { symbol: symbol.into().to_ascii_uppercase(), shares, side, user_id: None }
    }

    pub fn with_user(mut self, user_id: Option<i64>) -> Self {
        self.user_id = user_id;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    pub shares: Decimal,
    pub average_cost: Decimal,
    /// Last price this holding was valued at.
    pub last_price: Decimal,
}

impl Holding {
    pub fn cost_basis(&self) -> Decimal { self.shares * self.average_cost }
    pub fn market_value(&self) -> Decimal { self.shares * self.last_price }
    pub fn gain_loss(&self) -> Decimal { self.market_value() - self.cost_basis() }

    pub fn gain_loss_percent(&self) -> Decimal {
        let cost = self.cost_basis();
        if cost.is_zero() {
            return Decimal::ZERO;
        }
        (self.gain_loss() / cost) * Decimal::ONE_HUNDRED
    }
}

/// What the backend says the affected position looks like after a fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PositionReport {
    Open { shares: Decimal, average_cost: Decimal },
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub symbol: String,
    pub side: Side,
    pub shares: Decimal,
    pub fill_price: Decimal,
    /// Authoritative cash after the fill, when the backend reports it.
    pub cash_balance: Option<Decimal>,
    /// Authoritative position after the fill, when the backend reports it.
    pub position: Option<PositionReport>,
}

impl Execution {
    pub fn notional(&self) -> Decimal { self.shares * self.fill_price }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RejectReason {
    InvalidQuantity,
    UnknownPrice,
    InsufficientShares { held: Decimal, requested: Decimal },
    InsufficientFunds { cash: Decimal, required: Decimal },
    TradeInFlight,
    Backend(String),
    Network(String),
    /// The backend filled the order but the fill could not be applied locally.
    Unreconciled(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::InvalidQuantity => f.write_str("quantity must be positive"),
            RejectReason::UnknownPrice => f.write_str("no current price for symbol"),
            RejectReason::InsufficientShares { held, requested } => {
                write!(f, "insufficient shares: have {held}, requested {requested}")
            }
            RejectReason::InsufficientFunds { cash, required } => {
                write!(f, "insufficient balance: have {cash}, need {required}")
            }
            RejectReason::TradeInFlight => f.write_str("another trade is still being submitted"),
            RejectReason::Backend(r) => write!(f, "rejected by backend: {r}"),
            RejectReason::Network(r) => write!(f, "backend unreachable: {r}"),
            RejectReason::Unreconciled(r) => write!(f, "filled by backend but not applied locally: {r}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TradeResult {
    Executed(Execution),
    Rejected(RejectReason),
}

impl TradeResult {
    pub fn is_executed(&self) -> bool { matches!(self, TradeResult::Executed(_)) }
}

// ---- Wire messages for /ws/stocks/ ----

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientMessage {
    Refresh,
    GetPrices,
    GetHistory { symbol: String, period: Period },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Prices { data: Vec<PriceQuote> },
    History { symbol: String, period: Period, data: Vec<PricePoint> },
}

// Journal events (JSONL)
#[derive(Debug, Clone, Serialize)]
pub enum Event {
    Snapshot { ts: DateTime<Utc>, quotes: usize },
    Connectivity { ts: DateTime<Utc>, connected: bool },
    TradeRequested { ts: DateTime<Utc>, request: TradeRequest },
    TradeResolved { ts: DateTime<Utc>, symbol: String, result: TradeResult },
    Note(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn quote_change_is_derived_from_previous_close() {
        let q: PriceQuote = serde_json::from_str(
            r#"{"id":1,"symbol":"AAPL","name":"Apple Inc.","sector":"Technology",
                "current_price":178.5,"previous_close":175.2,"price_change":99.0}"#,
        )
        .unwrap();
        assert_eq!(q.change(), dec!(3.3));
        assert_eq!(q.change_percent().round_dp(2), dec!(1.88));
    }

    #[test]
    fn quote_change_is_zero_without_previous_close() {
        let q: PriceQuote =
            serde_json::from_str(r#"{"symbol":"KO","current_price":"59.80"}"#).unwrap();
        assert_eq!(q.change(), Decimal::ZERO);
        assert_eq!(q.change_percent(), Decimal::ZERO);
    }

    #[test]
    fn client_messages_use_action_tag() {
        let refresh = serde_json::to_value(ClientMessage::Refresh).unwrap();
        assert_eq!(refresh, serde_json::json!({"action": "refresh"}));

        let hist = serde_json::to_value(ClientMessage::GetHistory {
            symbol: "AAPL".into(),
            period: Period::OneMonth,
        })
        .unwrap();
        assert_eq!(
            hist,
            serde_json::json!({"action": "get_history", "symbol": "AAPL", "period": "1mo"})
        );
    }

    #[test]
    fn server_history_message_decodes() {
        let msg: ServerMessage = serde_json::from_str(
            r#"{"type":"history","symbol":"MSFT","period":"5d","data":[
                {"timestamp":"2025-01-02T00:00:00+00:00","open":1.0,"high":2.0,"low":0.5,"close":1.5,"volume":10}
            ]}"#,
        )
        .unwrap();
        match msg {
            ServerMessage::History { symbol, period, data } => {
                assert_eq!(symbol, "MSFT");
                assert_eq!(period, Period::FiveDays);
                assert_eq!(data.len(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn period_and_side_parse() {
        assert_eq!("3mo".parse::<Period>().unwrap(), Period::ThreeMonths);
        assert!("2y".parse::<Period>().is_err());
        assert_eq!("SELL".parse::<Side>().unwrap(), Side::Sell);
    }

    #[test]
    fn holding_valuation() {
        let h = Holding { shares: dec!(4), average_cost: dec!(100), last_price: dec!(110) };
        assert_eq!(h.market_value(), dec!(440));
        assert_eq!(h.gain_loss(), dec!(40));
        assert_eq!(h.gain_loss_percent(), dec!(10));
    }
}
