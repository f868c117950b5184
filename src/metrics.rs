// ===============================
// src/metrics.rs
// ===============================
/*
=============================================================================
Project : finlearn_trader — live market sync & paper-trading client in Rust
Module  : metrics.rs
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
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Price stream health --------
pub static WS_CONNECTED: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("price_ws_connected", "1 if the price stream is connected, 0 otherwise").unwrap()
});

pub static WS_RECONNECTS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("price_ws_reconnects_total", "scheduled reconnects to the price stream").unwrap()
});

pub static WS_DECODE_ERRORS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("price_ws_decode_errors_total", "malformed messages dropped").unwrap()
});

// -------- Quotes --------
pub static SNAPSHOTS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("price_snapshots_total", "price snapshots applied").unwrap());

pub static QUOTES: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("quotes_live", "symbols in the current quote book").unwrap());

pub static HISTORY_SOURCE: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("history_requests_total", "history series served (label: source = ws|rest|synthetic)"),
        &["source"],
    )
    .unwrap()
});

// -------- Trading --------
pub static TRADES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("trades_total", "trade outcomes (labels: side, outcome)"),
        &["side", "outcome"],
    )
    .unwrap()
});

// Portfolio value in cents
pub static PORTFOLIO_VALUE: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("portfolio_value_cents", "cash + market value of holdings (cents)").unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(WS_CONNECTED.clone())),
        REGISTRY.register(Box::new(WS_RECONNECTS.clone())),
        REGISTRY.register(Box::new(WS_DECODE_ERRORS.clone())),
        REGISTRY.register(Box::new(SNAPSHOTS.clone())),
        REGISTRY.register(Box::new(QUOTES.clone())),
        REGISTRY.register(Box::new(HISTORY_SOURCE.clone())),
        REGISTRY.register(Box::new(TRADES.clone())),
        REGISTRY.register(Box::new(PORTFOLIO_VALUE.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
pub fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

/// Status line and body for one request line, e.g. `GET /metrics HTTP/1.1`.
fn route(request_line: &str) -> (&'static str, Vec<u8>) {
    let mut parts = request_line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("GET"), Some("/" | "/metrics")) => ("200 OK", encode_metrics()),
        (Some("GET"), Some(_)) => ("404 Not Found", b"not found\n".to_vec()),
        _ => ("405 Method Not Allowed", b"GET only\n".to_vec()),
    }
}

fn respond(stream: TcpStream) -> std::io::Result<()> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut request_line = String::new();
    BufReader::new(&stream).read_line(&mut request_line)?;

    let (status, body) = route(&request_line);
    let mut out = BufWriter::new(&stream);
    write!(
        out,
        "HTTP/1.1 {status}\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )?;
    out.write_all(&body)?;
    out.flush()
}

/// `/metrics` on a dedicated OS thread, away from the tokio workers.
pub fn serve_metrics(port: u16) {
    let addr = format!("0.0.0.0:{port}");
    let listener = match TcpListener::bind(&addr) {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(%addr, ?e, "metrics bind failed, endpoint disabled");
            return;
        }
    };
    tracing::info!("metrics listening on http://{addr}/metrics");

    thread::spawn(move || {
        for conn in listener.incoming() {
            let outcome = conn.and_then(respond);
            if let Err(e) = outcome {
                tracing::debug!(?e, "metrics request failed");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_metrics_show_up_in_text_output() {
        init();
        TRADES.with_label_values(&["buy", "executed"]).inc();
        let text = String::from_utf8(encode_metrics()).unwrap();
        assert!(text.contains("trades_total"));
    }

    #[test]
    fn only_get_on_metrics_paths_is_served() {
        init();
        let (status, body) = route("GET /metrics HTTP/1.1\r\n");
        assert_eq!(status, "200 OK");
        assert!(String::from_utf8(body).unwrap().contains("price_ws_connected"));
        assert_eq!(route("GET / HTTP/1.1").0, "200 OK");
        assert_eq!(route("GET /favicon.ico HTTP/1.1").0, "404 Not Found");
        assert_eq!(route("POST /metrics HTTP/1.1").0, "405 Method Not Allowed");
        assert_eq!(route("").0, "405 Method Not Allowed");
    }
}
