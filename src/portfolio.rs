// ===============================
// src/portfolio.rs (cash, holdings & valuation)
// ===============================
/*
=============================================================================
Project : finlearn_trader — live market sync & paper-trading client in Rust
Module  : portfolio.rs
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
// Two writers, disjoint fields:
// - `apply_trade_result` (trade engine)  -> cash, shares, average cost
// - `revalue` (quote snapshots)          -> last_price only
// Totals are computed on read.
//

use std::collections::BTreeMap;
use std::sync::Weak;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use crate::api::{ApiClient, PortfolioRow, UserProfile};
use crate::domain::{Execution, Holding, PositionReport, Side, TradeResult};
use crate::error::PortfolioError;
use crate::feed::QuoteBook;
use crate::metrics::PORTFOLIO_VALUE;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortfolioSummary {
    pub cash: Decimal,
    pub market_value: Decimal,
    pub total_value: Decimal,
    pub total_cost: Decimal,
    pub total_gain_loss: Decimal,
    pub gain_loss_percent: Decimal,
    pub holdings_count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Portfolio {
    cash: Decimal,
    holdings: BTreeMap<String, Holding>,
}

impl Portfolio {
    pub fn new(cash: Decimal) -> Self {
        Self { cash: cash.max(Decimal::ZERO), holdings: BTreeMap::new() }
    }

    /// Rebuilds the backend view: profile balance plus portfolio rows.
    pub fn from_rows(cash: Decimal, rows: Vec<PortfolioRow>) -> Self {
        let mut p = Self::new(cash);
        for row in rows {
            if row.shares <= Decimal::ZERO {
                continue;
            }
            p.holdings.insert(
                row.stock.symbol.to_ascii_uppercase(),
                Holding {
                    shares: row.shares,
                    average_cost: row.average_buy_price,
                    last_price: row.stock.current_price,
                },
            );
        }
        p
    }

    pub fn cash(&self) -> Decimal { self.cash }
    pub fn holdings(&self) -> &BTreeMap<String, Holding> { &self.holdings }
    pub fn holding(&self, symbol: &str) -> Option<&Holding> { self.holdings.get(symbol) }

    pub fn shares_of(&self, symbol: &str) -> Decimal {
        self.holdings.get(symbol).map(|h| h.shares).unwrap_or(Decimal::ZERO)
    }

    pub fn market_value(&self) -> Decimal { self.holdings.values().map(Holding::market_value).sum() }
    pub fn total_value(&self) -> Decimal { self.cash + self.market_value() }
    pub fn total_cost(&self) -> Decimal { self.holdings.values().map(Holding::cost_basis).sum() }
    pub fn total_gain_loss(&self) -> Decimal { self.market_value() - self.total_cost() }

    pub fn summary(&self) -> PortfolioSummary {
        let total_cost = self.total_cost();
        let total_gain_loss = self.total_gain_loss();
        let gain_loss_percent = if total_cost.is_zero() {
            Decimal::ZERO
        } else {
            (total_gain_loss / total_cost) * Decimal::ONE_HUNDRED
        };
        PortfolioSummary {
            cash: self.cash,
            market_value: self.market_value(),
            total_value: self.total_value(),
            total_cost,
            total_gain_loss,
            gain_loss_percent,
            holdings_count: self.holdings.len(),
        }
    }

    /// Marks held symbols to the quote book. Symbols missing from the book keep
    /// their last price. Returns how many holdings were repriced.
    pub fn revalue(&mut self, quotes: &QuoteBook) -> usize {
        let mut n = 0;
        for (symbol, h) in self.holdings.iter_mut() {
            if let Some(q) = quotes.get(symbol) {
                h.last_price = q.current_price;
                n += 1;
            }
        }
        n
    }

    /// Applies a resolved trade. Rejected is a no-op.
    ///
    /// A position reported by the backend replaces the local holding as is, and
    /// a reported cash balance replaces local cash. Without a reported balance,
    /// cash moves by the fill notional and never drops below zero. Fills with no
    /// position report are applied incrementally and must keep the cash/share
    /// invariants, otherwise the state is left untouched.
    pub fn apply_trade_result(&mut self, result: &TradeResult) -> Result<(), PortfolioError> {
        match result {
            TradeResult::Rejected(_) => Ok(()),
            TradeResult::Executed(exec) => self.apply_execution(exec),
        }
    }

    fn apply_execution(&mut self, exec: &Execution) -> Result<(), PortfolioError> {
        let symbol = exec.symbol.to_ascii_uppercase();
        let notional = exec.notional();
        let authoritative = exec.position.is_some();

        let cash = match (exec.cash_balance, exec.side) {
            (Some(c), _) if c < Decimal::ZERO => return Err(PortfolioError::NegativeBalance(c)),
            (Some(c), _) => c,
            (None, Side::Sell) => self.cash + notional,
            (None, Side::Buy) if notional <= self.cash => self.cash - notional,
            (None, Side::Buy) if authoritative => {
                warn!(%symbol, cash = %self.cash, %notional, "fill above local cash, balance floored at zero");
                Decimal::ZERO
            }
            (None, Side::Buy) => {
                return Err(PortfolioError::InsufficientCash { cash: self.cash, required: notional })
            }
        };

        let prev = self.holdings.get(&symbol);
        let holding = match &exec.position {
            Some(PositionReport::Open { shares, average_cost }) => Some(Holding {
                shares: *shares,
                average_cost: *average_cost,
                last_price: exec.fill_price,
            }),
            Some(PositionReport::Closed) => None,
            None => match exec.side {
                Side::Buy => Some(match prev {
                    Some(h) => {
                        let shares = h.shares + exec.shares;
                        Holding {
                            shares,
                            average_cost: (h.cost_basis() + notional) / shares,
                            last_price: exec.fill_price,
                        }
                    }
                    None => Holding {
                        shares: exec.shares,
                        average_cost: exec.fill_price,
                        last_price: exec.fill_price,
                    },
                }),
                Side::Sell => {
                    let held = prev.map(|h| h.shares).unwrap_or(Decimal::ZERO);
                    if exec.shares > held {
                        return Err(PortfolioError::InsufficientShares {
                            symbol,
                            held,
                            requested: exec.shares,
                        });
                    }
                    let left = held - exec.shares;
                    prev.filter(|_| !left.is_zero()).map(|h| Holding {
                        shares: left,
                        average_cost: h.average_cost,
                        last_price: exec.fill_price,
                    })
                }
            },
        };

        self.cash = cash;
        match holding {
            Some(h) => {
                self.holdings.insert(symbol, h);
            }
            None => {
                self.holdings.remove(&symbol);
            }
        }
        Ok(())
    }
}

/// Starting state: the profile's balance plus backend holdings when signed in,
/// otherwise `default_cash` and nothing held.
pub async fn bootstrap(api: &ApiClient, profile: Option<&UserProfile>, default_cash: Decimal) -> Portfolio {
    let Some(profile) = profile else {
        info!(cash = %default_cash, "no session, starting with default cash");
        return Portfolio::new(default_cash);
    };
    match api.portfolio(Some(profile.id)).await {
        Ok(rows) => {
            let p = Portfolio::from_rows(profile.virtual_balance, rows);
            info!(cash = %p.cash(), holdings = p.holdings().len(), "portfolio loaded from backend");
            p
        }
        Err(e) => {
            warn!(%e, "portfolio unavailable, holdings start empty");
            Portfolio::new(profile.virtual_balance)
        }
    }
}

pub fn value_cents(value: Decimal) -> i64 {
    (value * Decimal::ONE_HUNDRED).round().to_i64().unwrap_or(i64::MAX)
}

/// Reprices the portfolio on every quote snapshot until the book closes or the
/// portfolio is dropped.
pub async fn run_revaluation(mut quotes_rx: watch::Receiver<QuoteBook>, portfolio: Weak<RwLock<Portfolio>>) {
    loop {
        if quotes_rx.changed().await.is_err() {
            debug!("quote book closed, revaluation stopped");
            return;
        }
        let Some(p) = portfolio.upgrade() else {
            info!("portfolio dropped, revaluation stopped");
            return;
        };
        let book = quotes_rx.borrow_and_update().clone();
        let mut guard = p.write().await;
        let repriced = guard.revalue(&book);
        let total = guard.total_value();
        PORTFOLIO_VALUE.set(value_cents(total));
        debug!(repriced, total = %total, "portfolio revalued");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RejectReason;
    use crate::testing::quote;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn fill(side: Side, symbol: &str, shares: Decimal, price: Decimal) -> TradeResult {
        TradeResult::Executed(Execution {
            symbol: symbol.into(),
            side,
            shares,
            fill_price: price,
            cash_balance: None,
            position: None,
        })
    }

    #[test]
    fn buy_then_sell_aapl_scenario() {
        let mut p = Portfolio::new(dec!(100000.00));
        p.apply_trade_result(&fill(Side::Buy, "AAPL", dec!(10), dec!(178.50))).unwrap();
        assert_eq!(p.cash(), dec!(98215.00));
        assert_eq!(p.shares_of("AAPL"), dec!(10));
        assert_eq!(p.holdings().len(), 1);

        p.apply_trade_result(&fill(Side::Sell, "AAPL", dec!(10), dec!(178.50))).unwrap();
        assert_eq!(p.cash(), dec!(100000.00));
        assert!(p.holdings().is_empty());
    }

    #[test]
    fn rejected_is_a_noop() {
        let mut p = Portfolio::new(dec!(5000));
        p.apply_trade_result(&fill(Side::Buy, "KO", dec!(3), dec!(59.80))).unwrap();
        let before = p.clone();
        p.apply_trade_result(&TradeResult::Rejected(RejectReason::Backend("Insufficient balance".into())))
            .unwrap();
        assert_eq!(p, before);
    }

    #[test]
    fn partial_sell_keeps_cost_basis() {
        let mut p = Portfolio::new(dec!(10000));
        p.apply_trade_result(&fill(Side::Buy, "V", dec!(4), dec!(100))).unwrap();
        p.apply_trade_result(&fill(Side::Buy, "V", dec!(4), dec!(200))).unwrap();
        assert_eq!(p.holding("V").unwrap().average_cost, dec!(150));

        p.apply_trade_result(&fill(Side::Sell, "V", dec!(2.5), dec!(210))).unwrap();
        let h = p.holding("V").unwrap();
        assert_eq!(h.shares, dec!(5.5));
        assert_eq!(h.average_cost, dec!(150));
        assert!(h.shares >= Decimal::ZERO);
    }

    #[test]
    fn invariant_violations_leave_state_untouched() {
        let mut p = Portfolio::new(dec!(100));
        let before = p.clone();
        assert!(matches!(
            p.apply_trade_result(&fill(Side::Buy, "MSFT", dec!(1), dec!(378.90))),
            Err(PortfolioError::InsufficientCash { .. })
        ));
        assert!(matches!(
            p.apply_trade_result(&fill(Side::Sell, "MSFT", dec!(1), dec!(378.90))),
            Err(PortfolioError::InsufficientShares { .. })
        ));
        assert_eq!(p, before);
    }

    #[test]
    fn authoritative_report_overwrites_local_view() {
        let mut p = Portfolio::new(dec!(100000));
        p.apply_trade_result(&fill(Side::Buy, "TSLA", dec!(2), dec!(248.90))).unwrap();

        // backend already counted a concurrent fill; its numbers win
        let exec = Execution {
            symbol: "TSLA".into(),
            side: Side::Buy,
            shares: dec!(1),
            fill_price: dec!(250),
            cash_balance: Some(dec!(99000)),
            position: Some(PositionReport::Open { shares: dec!(4), average_cost: dec!(249) }),
        };
        p.apply_trade_result(&TradeResult::Executed(exec)).unwrap();
        assert_eq!(p.cash(), dec!(99000));
        let h = p.holding("TSLA").unwrap();
        assert_eq!(h.shares, dec!(4));
        assert_eq!(h.average_cost, dec!(249));

        let close = Execution {
            symbol: "TSLA".into(),
            side: Side::Sell,
            shares: dec!(4),
            fill_price: dec!(250),
            cash_balance: None,
            position: Some(PositionReport::Closed),
        };
        p.apply_trade_result(&TradeResult::Executed(close)).unwrap();
        assert_eq!(p.cash(), dec!(100000));
        assert!(p.holding("TSLA").is_none());
    }

    #[test]
    fn reported_position_lands_even_when_fill_exceeds_local_cash() {
        let mut p = Portfolio::new(dec!(1000));
        let exec = Execution {
            symbol: "AAPL".into(),
            side: Side::Buy,
            shares: dec!(10),
            fill_price: dec!(100.50),
            cash_balance: None,
            position: Some(PositionReport::Open { shares: dec!(10), average_cost: dec!(100.50) }),
        };
        p.apply_trade_result(&TradeResult::Executed(exec.clone())).unwrap();
        assert_eq!(p.shares_of("AAPL"), dec!(10));
        assert_eq!(p.holding("AAPL").unwrap().average_cost, dec!(100.50));
        assert_eq!(p.cash(), Decimal::ZERO);

        // a reported balance wins over local arithmetic
        let mut p = Portfolio::new(dec!(1000));
        let exec = Execution { cash_balance: Some(dec!(12.34)), ..exec };
        p.apply_trade_result(&TradeResult::Executed(exec)).unwrap();
        assert_eq!(p.cash(), dec!(12.34));
        assert_eq!(p.shares_of("AAPL"), dec!(10));
    }

    #[test]
    fn revalue_only_touches_quoted_symbols() {
        let mut p = Portfolio::new(dec!(1000));
        p.apply_trade_result(&fill(Side::Buy, "AAPL", dec!(2), dec!(100))).unwrap();
        p.apply_trade_result(&fill(Side::Buy, "XOM", dec!(1), dec!(100))).unwrap();

        let mut book = QuoteBook::default();
        book.apply_snapshot(vec![quote("AAPL", dec!(110))]);
        assert_eq!(p.revalue(&book), 1);

        assert_eq!(p.holding("AAPL").unwrap().market_value(), dec!(220));
        assert_eq!(p.holding("XOM").unwrap().market_value(), dec!(100));
        assert_eq!(p.cash(), dec!(700));
        assert_eq!(p.total_value(), dec!(1020));
        assert_eq!(p.total_gain_loss(), dec!(20));

        let s = p.summary();
        assert_eq!(s.holdings_count, 2);
        assert_eq!(s.total_cost, dec!(300));
    }

    #[tokio::test]
    async fn revaluation_task_follows_snapshots_and_stops_when_dropped() {
        let mut p = Portfolio::new(dec!(1000));
        p.apply_trade_result(&fill(Side::Buy, "JNJ", dec!(1), dec!(150))).unwrap();
        let shared = Arc::new(RwLock::new(p));

        let (tx, rx) = watch::channel(QuoteBook::default());
        let task = tokio::spawn(run_revaluation(rx, Arc::downgrade(&shared)));

        let mut book = QuoteBook::default();
        book.apply_snapshot(vec![quote("JNJ", dec!(156.20))]);
        tx.send(book).unwrap();

        for _ in 0..100 {
            if shared.read().await.holding("JNJ").unwrap().last_price == dec!(156.20) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(shared.read().await.total_value(), dec!(1006.20));

        drop(shared);
        tx.send(QuoteBook::default()).unwrap();
        task.await.unwrap();
    }
}
