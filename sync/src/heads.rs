use crate::ledger::Ledger;
use futures_util::{SinkExt, Stream as FutStream, StreamExt};
use serde_json::{json, Value};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, trace, warn};
use url::Url;

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Error type for the push new-head channel.
#[derive(Error, Debug)]
pub enum HeadError {
    #[error("tungstenite error: {0}")]
    Tungstenite(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),
    #[error("invalid URL scheme: {0} (expected ws or wss)")]
    InvalidScheme(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("transport: {0}")]
    Transport(String),
}

/// Stream of new-head heights from the push channel.
pub struct HeadStream {
    receiver: mpsc::Receiver<Result<u64, HeadError>>,
    _handle: tokio::task::JoinHandle<()>,
}

impl Drop for HeadStream {
    fn drop(&mut self) {
        self._handle.abort();
    }
}

impl HeadStream {
    /// Receive the next head height.
    pub async fn next(&mut self) -> Option<Result<u64, HeadError>> {
        self.receiver.recv().await
    }
}

impl FutStream for HeadStream {
    type Item = Result<u64, HeadError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

/// A connectable source of new-head notifications.
///
/// The sync engine reconnects through this trait after transport failures.
pub trait Heads: Clone + Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    fn connect(&self) -> impl Future<Output = Result<HeadStream, Self::Error>> + Send;
}

/// WebSocket push channel (`eth_subscribe` new heads).
#[derive(Clone)]
pub struct WsHeads {
    url: Url,
}

impl WsHeads {
    pub fn new(endpoint: &str) -> Result<Self, HeadError> {
        let url = Url::parse(endpoint)?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => return Err(HeadError::InvalidScheme(other.to_string())),
        }
        Ok(Self { url })
    }
}

fn head_height(payload: &Value) -> Option<u64> {
    let number = payload
        .get("params")?
        .get("result")?
        .get("number")?
        .as_str()?;
    u64::from_str_radix(number.strip_prefix("0x").unwrap_or(number), 16).ok()
}

impl Heads for WsHeads {
    type Error = HeadError;

    async fn connect(&self) -> Result<HeadStream, HeadError> {
        let (mut ws, _) = connect_async(self.url.as_str()).await?;
        ws.send(Message::Text(
            json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "eth_subscribe",
                "params": ["newHeads"],
            })
            .to_string(),
        ))
        .await?;

        let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let handle = tokio::spawn(async move {
            let mut ws = ws;
            while let Some(message) = ws.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        let payload: Value = match serde_json::from_str(&text) {
                            Ok(payload) => payload,
                            Err(err) => {
                                warn!(%err, "undecodable head notification");
                                continue;
                            }
                        };
                        // The subscription confirmation has no params; skip it.
                        let Some(height) = head_height(&payload) else {
                            trace!("ignoring non-head frame");
                            continue;
                        };
                        if tx.send(Ok(height)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        debug!("head websocket closed");
                        let _ = tx.send(Err(HeadError::ConnectionClosed)).await;
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        error!(%err, "head websocket error");
                        let _ = tx.send(Err(err.into())).await;
                        break;
                    }
                }
            }
        });
        Ok(HeadStream {
            receiver: rx,
            _handle: handle,
        })
    }
}

/// Polling fallback when no push endpoint is configured: probes the batch
/// node's height on an interval and forwards increases.
#[derive(Clone)]
pub struct PollingHeads<L: Ledger> {
    ledger: L,
    interval: Duration,
}

impl<L: Ledger> PollingHeads<L> {
    pub fn new(ledger: L, interval: Duration) -> Self {
        Self { ledger, interval }
    }
}

impl<L: Ledger> Heads for PollingHeads<L> {
    type Error = HeadError;

    async fn connect(&self) -> Result<HeadStream, HeadError> {
        let ledger = self.ledger.clone();
        let interval = self.interval;
        let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let handle = tokio::spawn(async move {
            let mut last = None;
            loop {
                match ledger.chain_height().await {
                    Ok(height) => {
                        if last != Some(height) {
                            last = Some(height);
                            if tx.send(Ok(height)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(err) => {
                        let _ = tx
                            .send(Err(HeadError::Transport(err.to_string())))
                            .await;
                        break;
                    }
                }
                tokio::time::sleep(interval).await;
            }
        });
        Ok(HeadStream {
            receiver: rx,
            _handle: handle,
        })
    }
}
