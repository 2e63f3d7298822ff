//! Ethereum JSON-RPC transport.
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Context as _};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Delivery, Subscription, Transport};
use crate::{
    codec::{self, EmitCall},
    error::Error,
    logger::get_logger,
    types::{RawLog, H160, H256},
};

/// Default timeout of a single request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Value,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcLog {
    address: String,
    topics: Vec<String>,
    data: String,
    transaction_hash: Option<String>,
    #[serde(default)]
    removed: bool,
}

#[derive(Debug, Deserialize)]
struct RpcReceipt {
    logs: Vec<RpcLog>,
}

fn decode_hex(value: &str) -> anyhow::Result<Vec<u8>> {
    let value = value.strip_prefix("0x").unwrap_or(value);
    Ok(hex::decode(value)?)
}

fn decode_quantity(value: &Value) -> anyhow::Result<u64> {
    let value = value.as_str().ok_or_else(|| anyhow!("quantity is not a string"))?;
    let value = value.strip_prefix("0x").unwrap_or(value);
    Ok(u64::from_str_radix(value, 16)?)
}

fn decode_h160(value: &str) -> anyhow::Result<H160> {
    let raw = decode_hex(value)?;
    if raw.len() != H160::len_bytes() {
        return Err(anyhow!("bad address length"));
    }
    Ok(H160::from_slice(&raw))
}

fn decode_h256(value: &str) -> anyhow::Result<H256> {
    let raw = decode_hex(value)?;
    if raw.len() != H256::len_bytes() {
        return Err(anyhow!("bad hash length"));
    }
    Ok(H256::from_slice(&raw))
}

/// Decode a list of logs, each on its own so one bad entry does not hide the others.
fn decode_logs(result: Value) -> anyhow::Result<Vec<anyhow::Result<RawLog>>> {
    let logs: Vec<Value> = serde_json::from_value(result)?;
    Ok(logs
        .into_iter()
        .filter_map(|log| {
            serde_json::from_value::<RpcLog>(log)
                .map_err(anyhow::Error::from)
                .and_then(|log| {
                    if log.removed {
                        return Ok(None);
                    }
                    log.into_raw().map(Some)
                })
                .transpose()
        })
        .collect())
}

impl RpcLog {
    fn into_raw(self) -> anyhow::Result<RawLog> {
        Ok(RawLog {
            address: decode_h160(&self.address)?,
            topics: self
                .topics
                .iter()
                .map(|topic| decode_h256(topic))
                .collect::<anyhow::Result<_>>()?,
            data: decode_hex(&self.data)?,
            transaction_hash: self
                .transaction_hash
                .as_deref()
                .map(decode_h256)
                .transpose()?,
        })
    }
}

struct Inner {
    client: reqwest::Client,
    url: String,
    next_id: AtomicU64,
}

impl Inner {
    async fn call(&self, method: &str, params: Value) -> anyhow::Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        });

        let response: RpcResponse = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .with_context(|| format!("{method} request failed"))?
            .error_for_status()?
            .json()
            .await
            .with_context(|| format!("{method} returned a malformed response"))?;

        if let Some(err) = response.error {
            return Err(anyhow!("{method} failed: {} (code {})", err.message, err.code));
        }
        Ok(response.result)
    }

    async fn block_number(&self) -> anyhow::Result<u64> {
        decode_quantity(&self.call("eth_blockNumber", json!([])).await?)
    }

    async fn logs(
        &self,
        contract: H160,
        from: u64,
        to: u64,
    ) -> anyhow::Result<Vec<anyhow::Result<RawLog>>> {
        let result = self
            .call(
                "eth_getLogs",
                json!([{
                    "address": format!("{contract:?}"),
                    "fromBlock": format!("0x{from:x}"),
                    "toBlock": format!("0x{to:x}"),
                }]),
            )
            .await?;
        decode_logs(result)
    }
}

/// Transport talking to an Ethereum-compatible JSON-RPC endpoint over HTTP.
///
/// Subscriptions poll `eth_getLogs` for new blocks. Emitting uses `eth_sendTransaction` and thus
/// needs an account managed by the node (e.g. a local development network).
#[derive(Clone)]
pub struct JsonRpcTransport {
    inner: Arc<Inner>,
    from: Option<H160>,
    poll_interval: Duration,
    logger: slog::Logger,
}

impl JsonRpcTransport {
    /// Create a new transport for the given endpoint.
    pub fn new(url: &str, from: Option<H160>, poll_interval: Duration) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| Error::Transport(err.into()))?;

        Ok(Self {
            inner: Arc::new(Inner {
                client,
                url: url.to_string(),
                next_id: AtomicU64::new(1),
            }),
            from,
            poll_interval,
            logger: get_logger("transport/jsonrpc"),
        })
    }

    async fn sender(&self) -> anyhow::Result<H160> {
        if let Some(from) = self.from {
            return Ok(from);
        }
        let accounts = self.inner.call("eth_accounts", json!([])).await?;
        let account = accounts
            .as_array()
            .and_then(|accounts| accounts.first())
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("node manages no accounts, configure a sender"))?;
        decode_h160(account)
    }
}

/// Fetch logs of blocks not seen yet and advance the cursor.
///
/// The cursor only stays put when the blocks could not be fetched at all.
async fn poll_once(
    inner: &Inner,
    contract: H160,
    next_block: &mut u64,
) -> anyhow::Result<Vec<Delivery>> {
    let latest = inner.block_number().await?;
    if latest < *next_block {
        return Ok(Vec::new());
    }
    let logs = inner.logs(contract, *next_block, latest).await?;
    *next_block = latest + 1;
    Ok(logs.into_iter().map(into_delivery).collect())
}

fn into_delivery(log: anyhow::Result<RawLog>) -> Delivery {
    log.map_err(|err| Error::MalformedEvent(format!("undecodable log: {err:#}")))
}

/// Poll for new logs of a contract until cancelled or the subscriber goes away.
async fn poll_logs(
    inner: Arc<Inner>,
    contract: H160,
    mut next_block: u64,
    poll_interval: Duration,
    tx: mpsc::Sender<Delivery>,
    cancel: CancellationToken,
    logger: slog::Logger,
) {
    slog::info!(logger, "starting log poller";
        "contract" => ?contract,
        "from_block" => next_block,
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(poll_interval) => {},
        }

        let result = poll_once(&inner, contract, &mut next_block).await;

        let deliveries = match result {
            Ok(deliveries) => deliveries,
            Err(err) => vec![Err(Error::Transport(err))],
        };
        for delivery in deliveries {
            if tx.send(delivery).await.is_err() {
                slog::info!(logger, "subscriber went away");
                return;
            }
        }
    }

    slog::info!(logger, "log poller stopped");
}

#[async_trait]
impl Transport for JsonRpcTransport {
    async fn chain_id(&self) -> Result<u64, Error> {
        let result = self
            .inner
            .call("eth_chainId", json!([]))
            .await
            .map_err(Error::Transport)?;
        decode_quantity(&result).map_err(Error::Transport)
    }

    async fn public_key(&self, contract: H160) -> Result<[u8; 32], Error> {
        let result = self
            .inner
            .call(
                "eth_call",
                json!([
                    {
                        "to": format!("{contract:?}"),
                        "data": format!("0x{}", hex::encode(codec::encode_public_key_call())),
                    },
                    "latest",
                ]),
            )
            .await
            .map_err(Error::Transport)?;
        let result = result
            .as_str()
            .ok_or_else(|| Error::Transport(anyhow!("eth_call returned no data")))?;
        let data = decode_hex(result).map_err(Error::Transport)?;
        codec::decode_public_key_result(&data)
    }

    async fn receipt_logs(&self, transaction: H256) -> Result<Vec<RawLog>, Error> {
        let result = self
            .inner
            .call("eth_getTransactionReceipt", json!([format!("{transaction:?}")]))
            .await
            .map_err(Error::Transport)?;
        if result.is_null() {
            return Err(Error::Transport(anyhow!(
                "no receipt for transaction {transaction:?}"
            )));
        }
        let receipt: RpcReceipt =
            serde_json::from_value(result).map_err(|err| Error::Transport(err.into()))?;
        receipt
            .logs
            .into_iter()
            .map(RpcLog::into_raw)
            .collect::<anyhow::Result<_>>()
            .map_err(Error::Transport)
    }

    async fn subscribe(&self, contract: H160) -> Result<Subscription, Error> {
        let next_block = self
            .inner
            .block_number()
            .await
            .map_err(Error::Transport)?
            + 1;
        let (subscription, tx, cancel) = Subscription::channel();
        tokio::spawn(poll_logs(
            self.inner.clone(),
            contract,
            next_block,
            self.poll_interval,
            tx,
            cancel,
            self.logger.clone(),
        ));
        Ok(subscription)
    }

    async fn emit(&self, call: EmitCall) -> Result<H256, Error> {
        let from = self.sender().await.map_err(Error::Transport)?;
        let result = self
            .inner
            .call(
                "eth_sendTransaction",
                json!([{
                    "from": format!("{from:?}"),
                    "to": format!("{:?}", call.contract),
                    "data": format!("0x{}", hex::encode(codec::encode_emit_call(&call))),
                }]),
            )
            .await
            .map_err(Error::Transport)?;
        let hash = result
            .as_str()
            .ok_or_else(|| Error::Transport(anyhow!("eth_sendTransaction returned no hash")))?;
        let hash = decode_h256(hash).map_err(Error::Transport)?;

        slog::info!(self.logger, "submitted emitting call";
            "tx" => ?hash,
            "contract" => ?call.contract,
        );
        Ok(hash)
    }
}
