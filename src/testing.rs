// ===============================
// src/testing.rs (test-only fakes)
// ===============================
/*
=============================================================================
Project : finlearn_trader — live market sync & paper-trading client in Rust
Module  : testing.rs
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
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use reqwest::StatusCode;
use rust_decimal::Decimal;
use tokio::sync::Notify;

use crate::api::{MarketBackend, PortfolioRow, StockRef, TradeConfirmation, TradeOrder, TransactionRow};
use crate::domain::{Period, PricePoint, PriceQuote, Side};
use crate::error::ApiError;

pub fn quote(symbol: &str, price: Decimal) -> PriceQuote {
    let id = crate::feed::sample_quotes()
        .into_iter()
        .find(|q| q.symbol == symbol)
        .map(|q| q.id)
        .unwrap_or(99);
    PriceQuote {
        id,
        symbol: symbol.to_string(),
        name: String::new(),
        sector: String::new(),
        current_price: price,
        previous_close: price,
        day_high: None,
        day_low: None,
        volume: None,
    }
}

/// In-process backend. Fills trades at the quote price and keeps its own
/// positions, like the real server.
#[derive(Default)]
pub struct FakeBackend {
    pub quotes: Vec<PriceQuote>,
    pub history: Vec<PricePoint>,
    pub offline: bool,
    /// Queued trade responses, used before the built-in fill logic.
    pub scripted: Mutex<VecDeque<Result<TradeConfirmation, ApiError>>>,
    /// When set, trades wait for a notification before answering.
    pub gate: Option<Arc<Notify>>,
    pub positions: Mutex<HashMap<i64, (Decimal, Decimal)>>,
    /// Balance handed back after a fill; `None` behaves like a guest account.
    pub balance: Option<Decimal>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeBackend {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn reject_next(&self, status: StatusCode, body: &str) {
        self.scripted.lock().unwrap().push_back(Err(ApiError::from_body(status, body)));
    }

    fn log(&self, call: String) -> Result<(), ApiError> {
        self.calls.lock().unwrap().push(call);
        if self.offline {
            return Err(ApiError::Decode("backend offline".into()));
        }
        Ok(())
    }

    fn fill(&self, order: &TradeOrder) -> Result<TradeConfirmation, ApiError> {
        let stock = self
            .quotes
            .iter()
            .find(|q| q.id == order.stock_id)
            .cloned()
            .ok_or_else(|| ApiError::from_body(StatusCode::NOT_FOUND, r#"{"detail":"Not found."}"#))?;
        let px = stock.current_price;

        let mut positions = self.positions.lock().unwrap();
        let (held, avg) = positions.get(&order.stock_id).copied().unwrap_or_default();
        let (shares, average) = match order.transaction_type {
            Side::Buy => {
                let total = held + order.shares;
                (total, (held * avg + order.shares * px) / total)
            }
            Side::Sell => {
                if order.shares > held {
                    return Err(ApiError::from_body(StatusCode::BAD_REQUEST, r#"{"error":"Insufficient shares"}"#));
                }
                (held - order.shares, avg)
            }
        };
        if shares.is_zero() {
            positions.remove(&order.stock_id);
        } else {
            positions.insert(order.stock_id, (shares, average));
        }

        Ok(TradeConfirmation {
            message: "ok".into(),
            transaction: TransactionRow {
                id: 1,
                stock: StockRef { id: stock.id, symbol: stock.symbol.clone() },
                transaction_type: order.transaction_type,
                shares: order.shares,
                price_per_share: px,
                total_amount: order.shares * px,
                executed_at: None,
            },
            portfolio: (!shares.is_zero()).then(|| PortfolioRow { stock, shares, average_buy_price: average }),
            cash_balance: None,
        })
    }
}

#[async_trait]
impl MarketBackend for FakeBackend {
    async fn list_quotes(&self) -> Result<Vec<PriceQuote>, ApiError> {
        self.log("list".into())?;
        Ok(self.quotes.clone())
    }

    async fn refresh_prices(&self) -> Result<u32, ApiError> {
        self.log("refresh".into())?;
        Ok(self.quotes.len() as u32)
    }

    async fn initialize_stocks(&self) -> Result<Vec<PriceQuote>, ApiError> {
        self.log("initialize".into())?;
        Ok(self.quotes.clone())
    }

    async fn history(&self, stock_id: i64, period: Period) -> Result<Vec<PricePoint>, ApiError> {
        self.log(format!("history:{stock_id}:{period}"))?;
        Ok(self.history.clone())
    }

    async fn execute_trade(&self, order: &TradeOrder) -> Result<TradeConfirmation, ApiError> {
        self.log(format!("trade:{}:{}:{}", order.transaction_type, order.stock_id, order.shares))?;
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        let scripted = self.scripted.lock().unwrap().pop_front();
        match scripted {
            Some(r) => r,
            None => self.fill(order),
        }
    }

    async fn balance(&self, _user_id: Option<i64>) -> Result<Option<Decimal>, ApiError> {
        if self.offline {
            return Err(ApiError::Decode("backend offline".into()));
        }
        Ok(self.balance)
    }
}
