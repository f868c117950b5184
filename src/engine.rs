// ===============================
// src/engine.rs (paper-trade execution)
// ===============================
/*
=============================================================================
Project : finlearn_trader — live market sync & paper-trading client in Rust
Module  : engine.rs
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
//
// submit(): Idle -> Validating -> Submitting -> Executed | Rejected
// The terminal phase is held until the next submit.
//
// Local pre-trade checks run before anything reaches the backend; a rejected
// check never calls the API. One trade is in flight at a time. A fill only
// counts as Executed once it is applied to the portfolio.
//

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, error, info, warn};

use crate::api::{MarketBackend, TradeOrder};
use crate::domain::{Event, RejectReason, Side, TradeRequest, TradeResult};
use crate::error::ApiError;
use crate::feed::QuoteBook;
use crate::metrics::TRADES;
use crate::portfolio::Portfolio;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TradePhase {
    Idle,
    Validating,
    Submitting,
    Executed,
    Rejected,
}

/// Pre-trade checks. On success returns the backend stock id.
fn check(req: &TradeRequest, book: &QuoteBook, portfolio: &Portfolio) -> Result<i64, RejectReason> {
    // 1) Quantity
    if req.shares <= Decimal::ZERO {
        return Err(RejectReason::InvalidQuantity);
    }

    // 2) Known price
    let quote = book.get(&req.symbol).ok_or(RejectReason::UnknownPrice)?;
    let price = book.price(&req.symbol).ok_or(RejectReason::UnknownPrice)?;

    // 3) Side-specific balance
    match req.side {
        Side::Sell => {
            let held = portfolio.shares_of(&req.symbol);
            if req.shares > held {
                return Err(RejectReason::InsufficientShares { held, requested: req.shares });
            }
        }
        Side::Buy => {
            let required = req.shares * price;
            if required > portfolio.cash() {
                return Err(RejectReason::InsufficientFunds { cash: portfolio.cash(), required });
            }
        }
    }
    Ok(quote.id)
}

/// Clears the in-flight flag however `submit` exits.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct TradeEngine {
    backend: Arc<dyn MarketBackend>,
    portfolio: Weak<RwLock<Portfolio>>,
    quotes: watch::Receiver<QuoteBook>,
    phase: watch::Sender<TradePhase>,
    in_flight: AtomicBool,
    journal: Option<mpsc::Sender<Event>>,
}

impl TradeEngine {
    pub fn new(
        backend: Arc<dyn MarketBackend>,
        portfolio: Weak<RwLock<Portfolio>>,
        quotes: watch::Receiver<QuoteBook>,
    ) -> Self {
        let (phase, _) = watch::channel(TradePhase::Idle);
        Self { backend, portfolio, quotes, phase, in_flight: AtomicBool::new(false), journal: None }
    }

    pub fn with_journal(mut self, journal: mpsc::Sender<Event>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn phase(&self) -> TradePhase { *self.phase.borrow() }
    pub fn subscribe_phase(&self) -> watch::Receiver<TradePhase> { self.phase.subscribe() }

    fn record(&self, ev: Event) {
        if let Some(tx) = &self.journal {
            let _ = tx.try_send(ev);
        }
    }

    pub async fn submit(&self, req: TradeRequest) -> TradeResult {
        if self.in_flight.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            warn!(symbol = %req.symbol, "trade rejected: another one is in flight");
            return TradeResult::Rejected(RejectReason::TradeInFlight);
        }
        let _guard = InFlight(&self.in_flight);

        self.record(Event::TradeRequested { ts: Utc::now(), request: req.clone() });
        let result = self.execute(&req).await;

        let outcome = if result.is_executed() { "executed" } else { "rejected" };
        TRADES.with_label_values(&[req.side.as_str(), outcome]).inc();
        match &result {
            TradeResult::Executed(x) => info!(
                symbol = %x.symbol, side = %x.side, shares = %x.shares, price = %x.fill_price,
                "trade executed"
            ),
            TradeResult::Rejected(r) => warn!(symbol = %req.symbol, side = %req.side, reason = %r, "trade rejected"),
        }
        self.record(Event::TradeResolved { ts: Utc::now(), symbol: req.symbol.clone(), result: result.clone() });

        self.phase.send_replace(if result.is_executed() { TradePhase::Executed } else { TradePhase::Rejected });
        result
    }

    async fn execute(&self, req: &TradeRequest) -> TradeResult {
        self.phase.send_replace(TradePhase::Validating);

        let Some(portfolio) = self.portfolio.upgrade() else {
            return TradeResult::Rejected(RejectReason::Backend("portfolio is closed".into()));
        };
        let checked = {
            let book = self.quotes.borrow().clone();
            let p = portfolio.read().await;
            check(req, &book, &p)
        };
        drop(portfolio);
        let stock_id = match checked {
            Ok(id) => id,
            Err(reason) => return TradeResult::Rejected(reason),
        };

        self.phase.send_replace(TradePhase::Submitting);
        let order = TradeOrder {
            stock_id,
            shares: req.shares,
            transaction_type: req.side,
            user_id: req.user_id,
        };
        debug!(?order, "submitting trade");

        let mut exec = match self.backend.execute_trade(&order).await {
            Ok(conf) => conf.into_execution(&req.symbol),
            Err(e @ ApiError::Network(_)) => return TradeResult::Rejected(RejectReason::Network(e.to_string())),
            Err(e) => return TradeResult::Rejected(RejectReason::Backend(e.to_string())),
        };
        if exec.cash_balance.is_none() {
            match self.backend.balance(req.user_id).await {
                Ok(balance) => exec.cash_balance = balance,
                Err(e) => warn!(%e, "post-trade balance unavailable, cash updated locally"),
            }
        }

        // the view may have been closed while the request was out
        let Some(p) = self.portfolio.upgrade() else {
            info!(symbol = %req.symbol, "portfolio closed, trade result discarded");
            return TradeResult::Executed(exec);
        };
        let result = TradeResult::Executed(exec);
        let applied = p.write().await.apply_trade_result(&result);
        match applied {
            Ok(()) => result,
            Err(e) => {
                error!(%e, symbol = %req.symbol, "fill does not reconcile with local portfolio");
                TradeResult::Rejected(RejectReason::Unreconciled(e.to_string()))
            }
        }
    }
}
