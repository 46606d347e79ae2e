//! JSON-RPC ledger adapter

use crate::ledger::{AccountData, LedgerClient, SignatureStatus};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, trace};
use weightlink_common::config::{Commitment, LedgerConfig};
use weightlink_common::{Result, WeightLinkError};
use weightlink_protocol::{Address, Hash, Signature};

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse<R> {
    result: Option<R>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

impl JsonRpcError {
    /// Preflight simulation logs, when the node attached them
    fn logs(&self) -> Vec<String> {
        self.data
            .as_ref()
            .and_then(|data| data.get("logs"))
            .and_then(Value::as_array)
            .map(|logs| {
                logs.iter()
                    .filter_map(|line| line.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl From<JsonRpcError> for WeightLinkError {
    fn from(error: JsonRpcError) -> Self {
        let logs = error.logs();
        WeightLinkError::Rpc {
            code: error.code,
            message: error.message,
            logs,
        }
    }
}

/// `{ context, value }` envelope
#[derive(Debug, Deserialize)]
struct Contextual<T> {
    value: T,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockhashValue {
    blockhash: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusValue {
    #[serde(default)]
    err: Option<Value>,
    #[serde(default)]
    confirmation_status: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionValue {
    meta: Option<TransactionMeta>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionMeta {
    #[serde(default)]
    log_messages: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountValue {
    data: (String, String),
    owner: String,
    lamports: u64,
}

/// Ledger node reached over JSON-RPC 2.0
pub struct RpcLedgerClient {
    client: Client,
    endpoint: String,
    commitment: Commitment,
    request_id: AtomicU64,
}

impl RpcLedgerClient {
    pub fn new(config: &LedgerConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(config.request_timeout().min(Duration::from_secs(10)))
            .build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            commitment: config.commitment,
            request_id: AtomicU64::new(1),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn call<R: DeserializeOwned>(&self, method: &str, params: Value) -> Result<Option<R>> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: self.request_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        trace!(method, id = request.id, "JSON-RPC request");

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    WeightLinkError::connection(format!("cannot connect to {}: {}", self.endpoint, e))
                } else {
                    WeightLinkError::Http(e)
                }
            })?;

        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            return Err(WeightLinkError::RateLimited(format!("{} throttled {}", self.endpoint, method)));
        }
        let response = response.error_for_status()?;

        let body: JsonRpcResponse<R> = response.json().await?;
        if let Some(error) = body.error {
            debug!(method, code = error.code, message = %error.message, "JSON-RPC error");
            return Err(error.into());
        }
        Ok(body.result)
    }

    async fn call_required<R: DeserializeOwned>(&self, method: &str, params: Value) -> Result<R> {
        self.call(method, params)
            .await?
            .ok_or_else(|| WeightLinkError::parse(format!("{} returned no result", method)))
    }

    fn meets_commitment(&self, status: Option<&str>) -> bool {
        match (self.commitment, status) {
            (_, Some("finalized")) => true,
            (Commitment::Confirmed, Some("confirmed")) => true,
            _ => false,
        }
    }
}

#[async_trait]
impl LedgerClient for RpcLedgerClient {
    async fn latest_blockhash(&self) -> Result<Hash> {
        let result: Contextual<BlockhashValue> = self
            .call_required(
                "getLatestBlockhash",
                json!([{ "commitment": self.commitment.as_str() }]),
            )
            .await?;
        result.value.blockhash.parse()
    }

    async fn send_transaction(&self, wire: &[u8]) -> Result<Signature> {
        let signature: String = self
            .call_required(
                "sendTransaction",
                json!([
                    BASE64.encode(wire),
                    {
                        "encoding": "base64",
                        "preflightCommitment": self.commitment.as_str(),
                    }
                ]),
            )
            .await?;
        signature.parse()
    }

    async fn signature_status(&self, signature: &Signature) -> Result<Option<SignatureStatus>> {
        let result: Contextual<Vec<Option<StatusValue>>> = self
            .call_required(
                "getSignatureStatuses",
                json!([[signature.to_string()], { "searchTransactionHistory": true }]),
            )
            .await?;

        let status = match result.value.into_iter().next().flatten() {
            None => return Ok(None),
            Some(status) => status,
        };
        Ok(Some(match status.err {
            Some(err) if !err.is_null() => SignatureStatus::Failed {
                reason: err.to_string(),
            },
            _ if self.meets_commitment(status.confirmation_status.as_deref()) => {
                SignatureStatus::Confirmed
            }
            _ => SignatureStatus::Processed,
        }))
    }

    async fn transaction_logs(&self, signature: &Signature) -> Result<Option<Vec<String>>> {
        let result: Option<TransactionValue> = self
            .call(
                "getTransaction",
                json!([
                    signature.to_string(),
                    {
                        "encoding": "json",
                        "commitment": self.commitment.as_str(),
                        "maxSupportedTransactionVersion": 0,
                    }
                ]),
            )
            .await?;
        Ok(result.map(|tx| {
            tx.meta
                .and_then(|meta| meta.log_messages)
                .unwrap_or_default()
        }))
    }

    async fn get_account(&self, address: &Address) -> Result<Option<AccountData>> {
        let result: Contextual<Option<AccountValue>> = self
            .call_required(
                "getAccountInfo",
                json!([
                    address.to_string(),
                    { "encoding": "base64", "commitment": self.commitment.as_str() }
                ]),
            )
            .await?;

        let Some(account) = result.value else {
            return Ok(None);
        };
        let (encoded, encoding) = account.data;
        if encoding != "base64" {
            return Err(WeightLinkError::parse(format!(
                "unexpected account encoding {}",
                encoding
            )));
        }
        let data = BASE64
            .decode(encoded)
            .map_err(|e| WeightLinkError::parse(format!("invalid account data: {}", e)))?;
        Ok(Some(AccountData {
            owner: account.owner.parse()?,
            lamports: account.lamports,
            data,
        }))
    }
}
