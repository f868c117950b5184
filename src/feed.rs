// ===============================
// src/feed.rs
// ===============================
/*
=============================================================================
Project : finlearn_trader — live market sync & paper-trading client in Rust
Module  : feed.rs
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
// Price feed on top of the persistent channel:
// - QuoteBook           : symbol -> PriceQuote, replaced wholesale per snapshot
// - request_refresh     : WS `refresh` when connected, REST refresh otherwise
// - request_history     : WS `get_history` correlated by (symbol, period) with a
//                         timeout, then REST, then a synthetic series
// - bootstrap           : REST initialize/refresh/list, sample quotes on failure
//
// Fallback data has exactly the same shape as live data; only the channel's
// connectivity flag tells them apart.
//

use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap as HashMap;
use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::api::MarketBackend;
use crate::channel::{ChannelEvent, ChannelHandle};
use crate::domain::{ClientMessage, Event, Period, PricePoint, PriceQuote, ServerMessage};
use crate::metrics::{HISTORY_SOURCE, QUOTES, SNAPSHOTS, WS_DECODE_ERRORS};

pub const SYNTHETIC_POINTS: usize = 31;

#[derive(Debug, Clone, Default)]
pub struct QuoteBook {
    quotes: HashMap<String, PriceQuote>,
}

impl QuoteBook {
    /// Full replacement; duplicate symbols in `data` resolve last-write-wins.
    pub fn apply_snapshot(&mut self, data: Vec<PriceQuote>) {
        let mut next = HashMap::with_capacity(data.len());
        for q in data {
            next.insert(q.symbol.to_ascii_uppercase(), q);
        }
        self.quotes = next;
    }

    pub fn get(&self, symbol: &str) -> Option<&PriceQuote> {
        self.quotes.get(&symbol.to_ascii_uppercase())
    }

    pub fn price(&self, symbol: &str) -> Option<Decimal> {
        self.get(symbol).map(|q| q.current_price).filter(|p| *p > Decimal::ZERO)
    }

    pub fn len(&self) -> usize { self.quotes.len() }
    pub fn is_empty(&self) -> bool { self.quotes.is_empty() }

    /// Quotes ordered by symbol.
    pub fn sorted(&self) -> Vec<&PriceQuote> {
        let mut v: Vec<&PriceQuote> = self.quotes.values().collect();
        v.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        v
    }
}

type HistoryKey = (String, Period);

struct Inner {
    channel: ChannelHandle,
    backend: Arc<dyn MarketBackend>,
    quotes_tx: watch::Sender<QuoteBook>,
    pending: Mutex<HashMap<HistoryKey, Vec<oneshot::Sender<Vec<PricePoint>>>>>,
    history_timeout: Duration,
    stopped: watch::Sender<bool>,
    journal: Option<mpsc::Sender<Event>>,
}

#[derive(Clone)]
pub struct PriceFeed {
    inner: Arc<Inner>,
}

impl PriceFeed {
    pub fn new(
        channel: ChannelHandle,
        backend: Arc<dyn MarketBackend>,
        history_timeout: Duration,
        journal: Option<mpsc::Sender<Event>>,
    ) -> Self {
        let (quotes_tx, _) = watch::channel(QuoteBook::default());
        let (stopped, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                channel,
                backend,
                quotes_tx,
                pending: Mutex::new(HashMap::new()),
                history_timeout,
                stopped,
                journal,
            }),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<QuoteBook> { self.inner.quotes_tx.subscribe() }
    pub fn quotes(&self) -> QuoteBook { self.inner.quotes_tx.borrow().clone() }
    pub fn quote(&self, symbol: &str) -> Option<PriceQuote> { self.inner.quotes_tx.borrow().get(symbol).cloned() }
    pub fn is_connected(&self) -> bool { self.inner.channel.is_connected() }
    pub fn channel(&self) -> &ChannelHandle { &self.inner.channel }

    fn record(&self, ev: Event) {
        if let Some(tx) = &self.inner.journal {
            let _ = tx.try_send(ev);
        }
    }

    pub fn apply_snapshot(&self, data: Vec<PriceQuote>) {
        self.inner.quotes_tx.send_modify(|book| book.apply_snapshot(data));
        let n = self.inner.quotes_tx.borrow().len();
        SNAPSHOTS.inc();
        QUOTES.set(n as i64);
        debug!(quotes = n, "price snapshot applied");
        self.record(Event::Snapshot { ts: Utc::now(), quotes: n });
    }

    /// Initial quote load over REST. Returns false when the sample set was used.
    pub async fn bootstrap(&self) -> bool {
        let backend = &self.inner.backend;
        let loaded = async {
            backend.initialize_stocks().await?;
            backend.refresh_prices().await?;
            backend.list_quotes().await
        }
        .await;

        match loaded {
            Ok(quotes) if !quotes.is_empty() => {
                info!(quotes = quotes.len(), "quotes loaded from backend");
                self.apply_snapshot(quotes);
                true
            }
            Ok(_) => {
                info!("backend returned no quotes, using sample stocks");
                self.apply_snapshot(sample_quotes());
                false
            }
            Err(e) => {
                info!(%e, "using sample stocks");
                self.apply_snapshot(sample_quotes());
                false
            }
        }
    }

    /// Asks the server to resend its current prices without recomputing them.
    /// Returns false when the stream is down.
    pub fn request_prices(&self) -> bool {
        self.inner.channel.send(ClientMessage::GetPrices)
    }

    pub async fn request_refresh(&self) {
        if self.inner.channel.send(ClientMessage::Refresh) {
            return;
        }
        let backend = &self.inner.backend;
        let fetched = async {
            backend.refresh_prices().await?;
            backend.list_quotes().await
        }
        .await;

        match fetched {
            Ok(quotes) if !quotes.is_empty() => self.apply_snapshot(quotes),
            Ok(_) => debug!("refresh returned no quotes"),
            Err(e) => {
                warn!(%e, "refresh failed");
                if self.inner.quotes_tx.borrow().is_empty() {
                    self.apply_snapshot(sample_quotes());
                }
            }
        }
    }

    /// Always yields a displayable series.
    pub async fn request_history(&self, symbol: &str, period: Period) -> Vec<PricePoint> {
        let symbol = symbol.to_ascii_uppercase();
        let key: HistoryKey = (symbol.clone(), period);

        if self.inner.channel.is_connected() {
            let (tx, rx) = oneshot::channel();
            self.inner.pending.lock().await.entry(key.clone()).or_default().push(tx);

            if self.inner.channel.send(ClientMessage::GetHistory { symbol: symbol.clone(), period }) {
                match timeout(self.inner.history_timeout, rx).await {
                    Ok(Ok(points)) if !points.is_empty() => {
                        HISTORY_SOURCE.with_label_values(&["ws"]).inc();
                        return points;
                    }
                    Ok(Ok(_)) => info!(%symbol, %period, "empty history over ws"),
                    Ok(Err(_)) => debug!(%symbol, %period, "history request dropped"),
                    Err(_) => warn!(
                        %symbol, %period,
                        timeout_ms = self.inner.history_timeout.as_millis() as u64,
                        "history request timed out"
                    ),
                }
            }
            self.prune_pending(&key).await;
        }

        let quote = self.quote(&symbol);
        if let Some(q) = &quote {
            match self.inner.backend.history(q.id, period).await {
                Ok(points) if !points.is_empty() => {
                    HISTORY_SOURCE.with_label_values(&["rest"]).inc();
                    return points;
                }
                Ok(_) => info!(%symbol, %period, "empty history from backend"),
                Err(e) => info!(%e, %symbol, %period, "history fetch failed"),
            }
        }

        HISTORY_SOURCE.with_label_values(&["synthetic"]).inc();
        let anchor = quote.and_then(|q| q.current_price.to_f64()).unwrap_or(100.0);
        synthetic_series(anchor, Utc::now(), &mut rand::thread_rng())
    }

    async fn prune_pending(&self, key: &HistoryKey) {
        let mut pending = self.inner.pending.lock().await;
        if let Some(waiters) = pending.get_mut(key) {
            waiters.retain(|w| !w.is_closed());
            if waiters.is_empty() {
                pending.remove(key);
            }
        }
    }

    async fn resolve_history(&self, symbol: String, period: Period, data: Vec<PricePoint>) {
        let waiters = self.inner.pending.lock().await.remove(&(symbol.to_ascii_uppercase(), period));
        match waiters {
            Some(waiters) => {
                for w in waiters {
                    let _ = w.send(data.clone());
                }
            }
            None => debug!(%symbol, %period, "unsolicited history message"),
        }
    }

    pub async fn handle_event(&self, ev: ChannelEvent) {
        match ev {
            ChannelEvent::Message(v) => self.on_server_value(v).await,
            ChannelEvent::Connectivity(connected) => {
                info!(connected, "price stream connectivity");
                self.record(Event::Connectivity { ts: Utc::now(), connected });
            }
            ChannelEvent::DecodeError(e) => debug!(%e, "message dropped"),
            ChannelEvent::Failed => warn!("price stream offline until manual reconnect"),
        }
    }

    async fn on_server_value(&self, v: Value) {
        if let Some(err) = v.get("error").and_then(|e| e.as_str()) {
            warn!(error = %err, "price stream reported an error");
            return;
        }
        let kind = v.get("type").and_then(|t| t.as_str()).unwrap_or_default().to_string();
        match serde_json::from_value::<ServerMessage>(v) {
            Ok(ServerMessage::Prices { data }) => self.apply_snapshot(data),
            Ok(ServerMessage::History { symbol, period, data }) => self.resolve_history(symbol, period, data).await,
            Err(e) if kind == "prices" || kind == "history" => {
                WS_DECODE_ERRORS.inc();
                warn!(%e, kind = %kind, "malformed message dropped");
            }
            Err(_) => debug!(kind = %kind, "ignoring message"),
        }
    }

    /// Consumes channel events in arrival order until `shutdown`.
    pub async fn run(self, mut events: mpsc::Receiver<ChannelEvent>) {
        let mut stopped = self.inner.stopped.subscribe();
        loop {
            if *stopped.borrow() {
                break;
            }
            tokio::select! {
                _ = stopped.changed() => {}
                ev = events.recv() => match ev {
                    Some(ev) => {
                        if *stopped.borrow() {
                            break;
                        }
                        self.handle_event(ev).await;
                    }
                    None => break,
                },
            }
        }
        debug!("price feed stopped");
    }

    /// Leaves the trading view: no further events are applied and the channel
    /// is torn down.
    pub async fn shutdown(&self) {
        self.inner.stopped.send_replace(true);
        self.inner.channel.disconnect().await;
    }
}

/// Placeholder daily series ending today at `anchor`.
pub fn synthetic_series<R: Rng + ?Sized>(anchor: f64, now: DateTime<Utc>, rng: &mut R) -> Vec<PricePoint> {
    (0..SYNTHETIC_POINTS)
        .rev()
        .map(|days_back| {
            let drift = days_back as f64 * 0.5;
            let noise = if days_back == 0 { 0.0 } else { (rng.gen::<f64>() - 0.5) * 10.0 };
            let close = (anchor - drift + noise).max(0.01);
            let open = (close - rng.gen::<f64>() * 2.0).max(0.01);
            let high = close.max(open) + rng.gen::<f64>() * 3.0;
            let low = (close.min(open) - rng.gen::<f64>() * 3.0).max(0.0);
            PricePoint {
                timestamp: now - chrono::Duration::days(days_back as i64),
                open,
                high,
                low,
                close,
                volume: rng.gen_range(5_000_000..15_000_000),
            }
        })
        .collect()
}

/// The ten tracked stocks, shown while the backend is unreachable.
pub fn sample_quotes() -> Vec<PriceQuote> {
    const SAMPLE: [(i64, &str, &str, &str, i64, i64); 10] = [
        (1, "AAPL", "Apple Inc.", "Technology", 17850, 17520),
        (2, "MSFT", "Microsoft Corporation", "Technology", 37890, 38050),
        (3, "GOOGL", "Alphabet Inc.", "Technology", 14125, 13980),
        (4, "JPM", "JPMorgan Chase & Co.", "Finance", 19540, 19320),
        (5, "V", "Visa Inc.", "Finance", 27580, 27810),
        (6, "JNJ", "Johnson & Johnson", "Healthcare", 15620, 15590),
        (7, "PG", "Procter & Gamble Co.", "Consumer Goods", 14875, 14920),
        (8, "XOM", "Exxon Mobil Corporation", "Energy", 10430, 10280),
        (9, "TSLA", "Tesla Inc.", "Automotive", 24890, 25240),
        (10, "KO", "The Coca-Cola Company", "Consumer Goods", 5980, 5950),
    ];
    SAMPLE
        .iter()
        .map(|(id, symbol, name, sector, px, prev)| PriceQuote {
            id: *id,
            symbol: symbol.to_string(),
            name: name.to_string(),
            sector: sector.to_string(),
            current_price: Decimal::new(*px, 2),
            previous_close: Decimal::new(*prev, 2),
            day_high: None,
            day_low: None,
            volume: None,
        })
        .collect()
}
