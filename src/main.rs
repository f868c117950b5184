// ===============================
// src/main.rs
// ===============================
/*
 # run against a local backend, journal + metrics on
 RECORD_FILE=logs/journal.jsonl METRICS_PORT=9898 cargo run

 # one demo order once quotes are in
 TRADE=buy:AAPL:10 cargo run

 # price stream gave up after its retries: try again
 kill -USR1 $(pgrep finlearn_trader)

 curl -s localhost:9898/metrics | egrep '^(price_ws_connected|trades_total|portfolio_value_cents)'
*/
/*
=============================================================================
Project : finlearn_trader — live market sync & paper-trading client in Rust
Module  : main.rs
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
mod api;
mod channel;
mod config;
mod domain;
mod engine;
mod error;
mod feed;
mod metrics;
mod portfolio;
mod recorder;
mod session;
#[cfg(test)]
mod testing;

use std::sync::Arc;

use tokio::{
    select,
    sync::{mpsc, RwLock},
    time::{interval, timeout, Duration, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::{ApiClient, MarketBackend};
use crate::channel::ChannelState;
use crate::domain::Event;
use crate::engine::TradeEngine;
use crate::feed::PriceFeed;
use crate::session::SessionStore;

#[tokio::main]
async fn main() {
    // ---- Logging ----
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // ---- Config ----
    let args = config::load();

    // ---- Metrics ----
    metrics::init();
    if let Some(port) = args.metrics_port {
        metrics::serve_metrics(port);
    }

    info!(
        ws = %args.ws_url,
        api = %args.api_base_url,
        max_retries = args.max_retries,
        backoff_base_ms = args.backoff_base_ms,
        backoff_cap_ms = args.backoff_cap_ms,
        watch = ?args.watch_symbols(),
        "startup config"
    );

    // ---- REST client & session ----
    let api = match ApiClient::new(args.api_base_url.as_str(), args.http_timeout()) {
        Ok(a) => a,
        Err(e) => {
            error!(%e, "http client init failed");
            return;
        }
    };
    let store = SessionStore::new(&args.session_file);
    info!(path = %store.path().display(), "session file");

    if args.logout {
        match store.load().await {
            Ok(Some(s)) => {
                if let Err(e) = session::logout(&store, s).await {
                    error!(%e, "logout failed");
                }
            }
            Ok(None) => info!("no stored session"),
            Err(e) => {
                warn!(%e, "stored session unreadable, removing");
                let _ = store.clear().await;
            }
        }
        return;
    }

    let mut signed_in = session::restore(&api, &store).await;
    if signed_in.is_none() {
        if let (Some(user), Some(pass)) = (&args.username, &args.password) {
            let attempt = match (args.register, &args.email) {
                (true, Some(email)) => session::register(&api, &store, user, email, pass).await,
                _ => session::login(&api, &store, user, pass).await,
            };
            match attempt {
                Ok(s) => signed_in = Some(s),
                Err(e) => warn!(%e, "sign-in failed, continuing as guest"),
            }
        }
    }
    let api = match &signed_in {
        Some((s, _)) => api.with_session(s),
        None => api,
    };
    let user_id = signed_in.as_ref().map(|(s, _)| s.user_id);

    // ---- Journal (optional) ----
    let (rec_tx, rec_rx) = mpsc::channel::<Event>(8192);
    let recorder = args.record_file.clone().map(|path| tokio::spawn(recorder::run(rec_rx, path)));
    let journal = recorder.as_ref().map(|_| rec_tx.clone());
    drop(rec_tx);
    if let Some(tx) = &journal {
        let _ = tx.try_send(Event::Note(format!("session start, user_id={user_id:?}")));
    }

    // ---- Portfolio ----
    let profile = signed_in.as_ref().map(|(_, p)| p);
    let portfolio = Arc::new(RwLock::new(portfolio::bootstrap(&api, profile, args.initial_cash).await));

    // ---- Price stream & feed ----
    let backend: Arc<dyn MarketBackend> = Arc::new(api.clone());
    let (channel, events) = channel::spawn(args.ws_url.clone(), args.retry_policy(), args.backoff_jitter_pct);
    let feed = PriceFeed::new(channel, backend.clone(), args.history_timeout(), journal.clone());
    let live = feed.bootstrap().await;
    info!(live, quotes = feed.quotes().len(), "quote book ready");
    let feed_task = tokio::spawn(feed.clone().run(events));
    tokio::spawn(log_channel_state(feed.channel().subscribe_state()));
    #[cfg(unix)]
    reconnect_on_sigusr1(feed.clone());

    portfolio.write().await.revalue(&feed.quotes());
    tokio::spawn(portfolio::run_revaluation(feed.subscribe(), Arc::downgrade(&portfolio)));

    for symbol in args.watch_symbols() {
        let feed = feed.clone();
        let period = args.history_period;
        tokio::spawn(async move {
            let points = feed.request_history(&symbol, period).await;
            info!(
                %symbol, %period,
                points = points.len(),
                last_close = ?points.last().map(|p| p.close),
                "history loaded"
            );
        });
    }

    if let Some(uid) = user_id {
        match api.transactions(Some(uid)).await {
            Ok(rows) => info!(count = rows.len(), "transaction history"),
            Err(e) => warn!(%e, "transaction history unavailable"),
        }
    }

    // ---- Trade engine ----
    let mut engine = TradeEngine::new(backend, Arc::downgrade(&portfolio), feed.subscribe());
    if let Some(tx) = journal.clone() {
        engine = engine.with_journal(tx);
    }
    if let Some(demo) = args.trade.clone() {
        let stock_id = feed.quotes().get(&demo.symbol).map(|q| q.id);
        if let Some(id) = stock_id {
            match api.quote(id).await {
                Ok(live) => info!(symbol = %demo.symbol, %live, "provider quote"),
                Err(e) => debug!(%e, symbol = %demo.symbol, "provider quote unavailable"),
            }
        }
        let result = engine.submit(demo.into_request(user_id)).await;
        info!(executed = result.is_executed(), ?result, "demo trade");
    }

    // ---- Heartbeat until Ctrl-C ----
    let watch = args.watch_symbols();
    let mut hb = interval(Duration::from_secs(5));
    hb.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        select! {
            _ = hb.tick() => {
                let book = feed.quotes();
                let summary = portfolio.read().await.summary();
                let prices: Vec<String> = watch
                    .iter()
                    .filter_map(|s| book.get(s))
                    .map(|q| format!("{}={} ({:+.2}%)", q.symbol, q.current_price, q.change_percent().round_dp(2)))
                    .collect();
                info!(
                    connected = feed.is_connected(),
                    state = ?feed.channel().state(),
                    quotes = book.len(),
                    cash = %summary.cash,
                    total_value = %summary.total_value,
                    gain_loss = %summary.total_gain_loss,
                    holdings = summary.holdings_count,
                    ?prices,
                    "heartbeat"
                );
                if !feed.is_connected() {
                    feed.request_refresh().await;
                } else if book.is_empty() {
                    feed.request_prices();
                }
            }
            _ = &mut shutdown => {
                info!("shutdown requested");
                break;
            }
        }
    }

    // ---- Teardown ----
    feed.shutdown().await;
    let _ = feed_task.await;
    drop(engine);
    drop(feed);
    drop(journal);
    if let Some(task) = recorder {
        if timeout(Duration::from_secs(2), task).await.is_err() {
            warn!("journal did not close in time");
        }
    }
    info!("bye");
}

async fn log_channel_state(mut state_rx: tokio::sync::watch::Receiver<ChannelState>) {
    while state_rx.changed().await.is_ok() {
        let state = *state_rx.borrow_and_update();
        match state {
            ChannelState::Failed => warn!("price stream failed; send SIGUSR1 to reconnect"),
            other => debug!(state = ?other, "price stream state"),
        }
    }
}

#[cfg(unix)]
fn reconnect_on_sigusr1(feed: PriceFeed) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut usr1 = match signal(SignalKind::user_defined1()) {
        Ok(s) => s,
        Err(e) => {
            warn!(%e, "SIGUSR1 handler unavailable, manual reconnect disabled");
            return;
        }
    };
    tokio::spawn(async move {
        while usr1.recv().await.is_some() {
            info!(state = ?feed.channel().state(), "SIGUSR1: reconnecting price stream");
            feed.channel().reconnect();
        }
    });
}
