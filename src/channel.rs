// ===============================
// src/channel.rs
// ===============================
/*
=============================================================================
Project : finlearn_trader — live market sync & paper-trading client in Rust
Module  : channel.rs
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
// Persistent channel ke /ws/stocks/:
// - `Channel`      : pure state machine (open/message/error/close transitions),
//                    driven by synthetic events in tests
// - `spawn`        : tokio task that drives the machine with a real WebSocket
// - `ChannelHandle`: send / reconnect / disconnect from the rest of the app
//
// Reconnect policy: delay = min(base * 2^retry, cap), at most `max_retries`
// automatic attempts, then Failed until an explicit reconnect.
//

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::Value;
use thiserror::Error;
use tokio::{
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
    time::sleep,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::domain::ClientMessage;
use crate::metrics::{WS_CONNECTED, WS_DECODE_ERRORS, WS_RECONNECTS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

#[derive(Debug, Error, PartialEq)]
pub enum ChannelError {
    #[error("WebSocket is not connected")]
    NotConnected,
    #[error("failed to decode message: {0}")]
    Decode(String),
    #[error("failed to encode message: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 5, base: Duration::from_millis(1_000), cap: Duration::from_millis(30_000) }
    }
}

impl RetryPolicy {
    /// `min(base * 2^retry, cap)`
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

/// Spread `delay` by +/- `pct` percent.
pub fn with_jitter(delay: Duration, pct: u32) -> Duration {
    if pct == 0 {
        return delay;
    }
    let ms = delay.as_millis() as i64;
    let span = ms * pct.min(100) as i64 / 100;
    let offset = rand::thread_rng().gen_range(-span..=span);
    Duration::from_millis((ms + offset).max(0) as u64)
}

/// What the driver must do after a close.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CloseAction {
    Reconnect { after: Duration, attempt: u32 },
    GiveUp,
    Stop,
}

#[derive(Debug)]
pub struct Channel {
    endpoint: String,
    state: ChannelState,
    retry_count: u32,
    policy: RetryPolicy,
    last_error: Option<String>,
    closing: bool,
}

impl Channel {
    pub fn new(endpoint: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            endpoint: endpoint.into(),
            state: ChannelState::Disconnected,
            retry_count: 0,
            policy,
            last_error: None,
            closing: false,
        }
    }

    pub fn endpoint(&self) -> &str { &self.endpoint }
    pub fn state(&self) -> ChannelState { self.state }
    pub fn retry_count(&self) -> u32 { self.retry_count }
    pub fn last_error(&self) -> Option<&str> { self.last_error.as_deref() }
    pub fn is_connected(&self) -> bool { self.state == ChannelState::Connected }

    pub fn connect(&mut self) {
        self.closing = false;
        self.state = ChannelState::Connecting;
    }

    /// Manual reconnect; the only way out of Failed.
    pub fn reconnect(&mut self) {
        self.retry_count = 0;
        self.connect();
    }

    /// Returns the connectivity flag to publish.
    pub fn on_open(&mut self) -> bool {
        self.state = ChannelState::Connected;
        self.retry_count = 0;
        self.last_error = None;
        true
    }

    pub fn on_message(&mut self, text: &str) -> Result<Value, ChannelError> {
        serde_json::from_str::<Value>(text).map_err(|e| {
            let msg = e.to_string();
            self.last_error = Some(format!("decode: {msg}"));
            ChannelError::Decode(msg)
        })
    }

    pub fn on_error(&mut self, err: impl Into<String>) {
        self.last_error = Some(err.into());
    }

    pub fn on_close(&mut self) -> CloseAction {
        if self.closing {
            self.state = ChannelState::Disconnected;
            return CloseAction::Stop;
        }
        if self.retry_count < self.policy.max_retries {
            let after = self.policy.delay(self.retry_count);
            self.retry_count += 1;
            self.state = ChannelState::Reconnecting;
            CloseAction::Reconnect { after, attempt: self.retry_count }
        } else {
            self.state = ChannelState::Failed;
            CloseAction::GiveUp
        }
    }

    /// Serialized frame for `msg`, only while Connected.
    pub fn outgoing(&self, msg: &ClientMessage) -> Result<String, ChannelError> {
        if self.state != ChannelState::Connected {
            return Err(ChannelError::NotConnected);
        }
        serde_json::to_string(msg).map_err(|e| ChannelError::Encode(e.to_string()))
    }

    /// Returns false when already disconnected.
    pub fn disconnect(&mut self) -> bool {
        if self.state == ChannelState::Disconnected && self.closing {
            return false;
        }
        self.closing = true;
        self.state = ChannelState::Disconnected;
        true
    }
}

/// Events delivered to the price feed, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Connectivity(bool),
    Message(Value),
    DecodeError(String),
    Failed,
}

#[derive(Debug)]
pub enum Command {
    Send(ClientMessage),
    Reconnect,
    Disconnect,
}

pub struct ChannelHandle {
    cmd_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<ChannelState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelHandle {
    pub(crate) fn from_parts(
        cmd_tx: mpsc::Sender<Command>,
        state_rx: watch::Receiver<ChannelState>,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self { cmd_tx, state_rx, task: Mutex::new(task) }
    }

    pub fn state(&self) -> ChannelState { *self.state_rx.borrow() }
    pub fn is_connected(&self) -> bool { self.state() == ChannelState::Connected }
    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> { self.state_rx.clone() }

    /// Fire-and-forget. Returns false (and warns) when not connected.
    pub fn send(&self, msg: ClientMessage) -> bool {
        if !self.is_connected() {
            warn!(?msg, "WebSocket is not connected");
            return false;
        }
        match self.cmd_tx.try_send(Command::Send(msg)) {
            Ok(()) => true,
            Err(e) => {
                warn!(?e, "channel command queue unavailable");
                false
            }
        }
    }

    /// Starts a fresh attempt with the retry budget reset. Ignored while connected.
    pub fn reconnect(&self) {
        if let Err(e) = self.cmd_tx.try_send(Command::Reconnect) {
            warn!(?e, "reconnect request dropped");
        }
    }

    /// Cancels pending reconnects, closes the socket and waits for the driver.
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(Command::Disconnect).await;
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                error!(?e, "channel task ended abnormally");
            }
        }
    }
}

pub fn spawn(
    endpoint: String,
    policy: RetryPolicy,
    jitter_pct: u32,
) -> (ChannelHandle, mpsc::Receiver<ChannelEvent>) {
    let (cmd_tx, cmd_rx) = mpsc::channel::<Command>(256);
    let (event_tx, event_rx) = mpsc::channel::<ChannelEvent>(4096);
    let (state_tx, state_rx) = watch::channel(ChannelState::Disconnected);

    let machine = Channel::new(endpoint, policy);
    let task = tokio::spawn(run(machine, jitter_pct, cmd_rx, event_tx, state_tx));
    (ChannelHandle::from_parts(cmd_tx, state_rx, Some(task)), event_rx)
}

enum Wait {
    Retry,
    Exit,
}

async fn run(
    mut ch: Channel,
    jitter_pct: u32,
    mut cmd_rx: mpsc::Receiver<Command>,
    event_tx: mpsc::Sender<ChannelEvent>,
    state_tx: watch::Sender<ChannelState>,
) {
    let url = match Url::parse(ch.endpoint()) {
        Ok(u) => u,
        Err(e) => {
            error!(?e, endpoint = %ch.endpoint(), "bad ws url");
            let _ = state_tx.send(ChannelState::Failed);
            let _ = event_tx.send(ChannelEvent::Failed).await;
            return;
        }
    };

    ch.connect();
    loop {
        let _ = state_tx.send(ch.state());
        info!(endpoint = %ch.endpoint(), attempt = ch.retry_count(), "connecting price stream");

        let connected = tokio::select! {
            res = connect_async(url.clone()) => res,
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Disconnect) | None => {
                    ch.disconnect();
                    let _ = state_tx.send(ch.state());
                    return;
                }
                Some(Command::Send(msg)) => {
                    warn!(?msg, "WebSocket is not connected");
                    // the connect future was dropped; start over
                    continue;
                }
                Some(Command::Reconnect) => continue,
            },
        };

        match connected {
            Ok((ws, _resp)) => {
                let up = ch.on_open();
                let _ = state_tx.send(ch.state());
                WS_CONNECTED.set(1);
                info!(endpoint = %ch.endpoint(), "WebSocket connected");
                let _ = event_tx.send(ChannelEvent::Connectivity(up)).await;

                let (mut write, mut read) = ws.split();
                loop {
                    tokio::select! {
                        frame = read.next() => match frame {
                            Some(Ok(Message::Text(txt))) => match ch.on_message(&txt) {
                                Ok(v) => { let _ = event_tx.send(ChannelEvent::Message(v)).await; }
                                Err(e) => {
                                    WS_DECODE_ERRORS.inc();
                                    warn!(%e, "failed to parse WebSocket message");
                                    let _ = event_tx.send(ChannelEvent::DecodeError(e.to_string())).await;
                                }
                            },
                            Some(Ok(Message::Ping(p))) => { let _ = write.send(Message::Pong(p)).await; }
                            Some(Ok(Message::Close(frame))) => {
                                debug!(?frame, "close frame received");
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!(?e, "WebSocket error");
                                ch.on_error(e.to_string());
                                break;
                            }
                            None => break,
                        },
                        cmd = cmd_rx.recv() => match cmd {
                            Some(Command::Send(msg)) => match ch.outgoing(&msg) {
                                Ok(txt) => {
                                    if let Err(e) = write.send(Message::Text(txt)).await {
                                        warn!(?e, "send failed");
                                        ch.on_error(e.to_string());
                                        break;
                                    }
                                }
                                Err(e) => warn!(%e, "dropping outgoing message"),
                            },
                            Some(Command::Reconnect) => debug!("already connected"),
                            Some(Command::Disconnect) | None => {
                                ch.disconnect();
                                let _ = write.send(Message::Close(None)).await;
                                WS_CONNECTED.set(0);
                                let _ = state_tx.send(ch.state());
                                info!("WebSocket closed by client");
                                return;
                            }
                        },
                    }
                }
            }
            Err(e) => {
                error!(?e, "connect failed");
                ch.on_error(e.to_string());
            }
        }

        // ---- closed ----
        WS_CONNECTED.set(0);
        let action = ch.on_close();
        let _ = state_tx.send(ch.state());
        let _ = event_tx.send(ChannelEvent::Connectivity(false)).await;
        info!(last_error = ?ch.last_error(), "WebSocket disconnected");

        let wait = match action {
            CloseAction::Reconnect { after, attempt } => {
                let delay = with_jitter(after, jitter_pct);
                info!(delay_ms = delay.as_millis() as u64, attempt, "reconnecting");
                WS_RECONNECTS.inc();
                wait_for_retry(&mut ch, &mut cmd_rx, Some(delay)).await
            }
            CloseAction::GiveUp => {
                warn!(retries = ch.retry_count(), "giving up on price stream; manual reconnect required");
                let _ = event_tx.send(ChannelEvent::Failed).await;
                wait_for_retry(&mut ch, &mut cmd_rx, None).await
            }
            CloseAction::Stop => Wait::Exit,
        };

        match wait {
            Wait::Retry => {}
            Wait::Exit => {
                let _ = state_tx.send(ch.state());
                return;
            }
        }
    }
}

/// Sleeps for `delay` (or forever when None) while still serving commands.
async fn wait_for_retry(
    ch: &mut Channel,
    cmd_rx: &mut mpsc::Receiver<Command>,
    delay: Option<Duration>,
) -> Wait {
    let timer = async {
        match delay {
            Some(d) => sleep(d).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(timer);

    loop {
        tokio::select! {
            _ = &mut timer => {
                ch.connect();
                return Wait::Retry;
            }
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Send(msg)) => warn!(?msg, "WebSocket is not connected"),
                Some(Command::Reconnect) => {
                    ch.reconnect();
                    return Wait::Retry;
                }
                Some(Command::Disconnect) | None => {
                    ch.disconnect();
                    return Wait::Exit;
                }
            },
        }
    }
}
