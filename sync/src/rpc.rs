use crate::ledger::{BlockHeader, Ledger, LogFilter, Receipt};
use ember_types::{Address, RawLog, Topic, TxHash};
use serde_json::{json, Value};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use thiserror::Error;
use tracing::trace;
use url::Url;

/// Error type for JSON-RPC transport operations.
#[derive(Error, Debug)]
pub enum RpcError {
    #[error("reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("failed: {0}")]
    Failed(reqwest::StatusCode),
    #[error("node error {code}: {message}")]
    Node { code: i64, message: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),
    #[error("invalid URL scheme: {0} (expected http or https)")]
    InvalidScheme(String),
}

/// JSON-RPC ledger over HTTP. This is the batch channel: bulk reads and log
/// queries go here, never over the push socket.
#[derive(Clone)]
pub struct HttpLedger {
    client: reqwest::Client,
    url: Url,
    next_id: Arc<AtomicU64>,
}

impl HttpLedger {
    pub fn new(endpoint: &str) -> Result<Self, RpcError> {
        let url = Url::parse(endpoint)?;
        match url.scheme() {
            "http" | "https" => {}
            other => return Err(RpcError::InvalidScheme(other.to_string())),
        }
        Ok(Self {
            client: reqwest::Client::new(),
            url,
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        trace!(method, id, "rpc request");
        let response = self
            .client
            .post(self.url.clone())
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(RpcError::Failed(response.status()));
        }
        let payload: Value = response.json().await?;
        if let Some(error) = payload.get("error") {
            return Err(RpcError::Node {
                code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
            });
        }
        payload
            .get("result")
            .cloned()
            .ok_or_else(|| RpcError::InvalidResponse("missing result".into()))
    }
}

fn quantity(value: &Value) -> Result<u64, RpcError> {
    match value {
        Value::String(text) => {
            let stripped = text.strip_prefix("0x").unwrap_or(text);
            u64::from_str_radix(stripped, 16)
                .map_err(|_| RpcError::InvalidResponse(format!("bad quantity: {text}")))
        }
        Value::Number(number) => number
            .as_u64()
            .ok_or_else(|| RpcError::InvalidResponse(format!("bad quantity: {number}"))),
        other => Err(RpcError::InvalidResponse(format!("bad quantity: {other}"))),
    }
}

fn quantity_u128(value: &Value) -> Result<u128, RpcError> {
    match value {
        Value::String(text) => {
            let stripped = text.strip_prefix("0x").unwrap_or(text);
            u128::from_str_radix(stripped, 16)
                .map_err(|_| RpcError::InvalidResponse(format!("bad quantity: {text}")))
        }
        other => quantity(other).map(u128::from),
    }
}

fn bytes(value: &Value) -> Result<Vec<u8>, RpcError> {
    let text = value
        .as_str()
        .ok_or_else(|| RpcError::InvalidResponse(format!("expected hex data: {value}")))?;
    let stripped = text.strip_prefix("0x").unwrap_or(text);
    hex::decode(stripped).map_err(|err| RpcError::InvalidResponse(format!("bad hex: {err}")))
}

fn fixed<const N: usize>(value: &Value) -> Result<[u8; N], RpcError> {
    let decoded = bytes(value)?;
    let got = decoded.len();
    decoded
        .try_into()
        .map_err(|_| RpcError::InvalidResponse(format!("expected {N} bytes, got {got}")))
}

fn hex_quantity(value: u64) -> String {
    format!("0x{value:x}")
}

fn raw_log(value: &Value) -> Result<RawLog, RpcError> {
    let field = |name: &str| {
        value
            .get(name)
            .ok_or_else(|| RpcError::InvalidResponse(format!("log missing {name}")))
    };
    let topics = field("topics")?
        .as_array()
        .ok_or_else(|| RpcError::InvalidResponse("topics not an array".into()))?
        .iter()
        .map(fixed::<32>)
        .collect::<Result<Vec<Topic>, _>>()?;
    Ok(RawLog {
        block_number: quantity(field("blockNumber")?)?,
        log_index: quantity(field("logIndex")?)?,
        tx_hash: TxHash(fixed::<32>(field("transactionHash")?)?),
        address: Address(fixed::<20>(field("address")?)?),
        topics,
        data: bytes(field("data")?)?,
    })
}

impl Ledger for HttpLedger {
    type Error = RpcError;

    async fn chain_height(&self) -> Result<u64, RpcError> {
        quantity(&self.request("eth_blockNumber", json!([])).await?)
    }

    async fn latest_header(&self) -> Result<BlockHeader, RpcError> {
        let block = self
            .request("eth_getBlockByNumber", json!(["latest", false]))
            .await?;
        let field = |name: &str| {
            block
                .get(name)
                .ok_or_else(|| RpcError::InvalidResponse(format!("block missing {name}")))
        };
        Ok(BlockHeader {
            number: quantity(field("number")?)?,
            timestamp: quantity(field("timestamp")?)?,
        })
    }

    async fn account_nonce(&self, address: &Address) -> Result<u64, RpcError> {
        quantity(
            &self
                .request(
                    "eth_getTransactionCount",
                    json!([address.to_string(), "pending"]),
                )
                .await?,
        )
    }

    async fn balance(&self, address: &Address) -> Result<u128, RpcError> {
        quantity_u128(
            &self
                .request("eth_getBalance", json!([address.to_string(), "latest"]))
                .await?,
        )
    }

    async fn transaction_receipt(&self, tx_hash: &TxHash) -> Result<Option<Receipt>, RpcError> {
        let result = self
            .request("eth_getTransactionReceipt", json!([tx_hash.to_string()]))
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        let field = |name: &str| {
            result
                .get(name)
                .ok_or_else(|| RpcError::InvalidResponse(format!("receipt missing {name}")))
        };
        Ok(Some(Receipt {
            tx_hash: *tx_hash,
            block_number: quantity(field("blockNumber")?)?,
            success: quantity(field("status")?)? == 1,
        }))
    }

    async fn logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>, RpcError> {
        let addresses: Vec<String> = filter
            .addresses
            .iter()
            .map(ToString::to_string)
            .collect();
        let mut query = json!({
            "fromBlock": hex_quantity(filter.from_block),
            "toBlock": hex_quantity(filter.to_block),
            "address": addresses,
        });
        if !filter.topics.is_empty() {
            let topic0: Vec<String> = filter
                .topics
                .iter()
                .map(|topic| format!("0x{}", hex::encode(topic)))
                .collect();
            query["topics"] = json!([topic0]);
        }
        let result = self.request("eth_getLogs", json!([query])).await?;
        result
            .as_array()
            .ok_or_else(|| RpcError::InvalidResponse("logs not an array".into()))?
            .iter()
            .map(raw_log)
            .collect()
    }

    async fn call(&self, to: &Address, data: &[u8]) -> Result<Vec<u8>, RpcError> {
        let result = self
            .request(
                "eth_call",
                json!([
                    {
                        "to": to.to_string(),
                        "data": format!("0x{}", hex::encode(data)),
                    },
                    "latest",
                ]),
            )
            .await?;
        bytes(&result)
    }

    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<TxHash, RpcError> {
        let result = self
            .request(
                "eth_sendRawTransaction",
                json!([format!("0x{}", hex::encode(raw))]),
            )
            .await?;
        Ok(TxHash(fixed::<32>(&result)?))
    }
}
