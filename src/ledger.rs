// ===============================
// src/ledger.rs
// ===============================
//
// Ledger transaction fetcher:
// - RpcLedger  : JSON-RPC (getSignaturesForAddress + getTransaction)
// - DemoLedger : synthetic transactions, only when DEMO_TRANSACTIONS is on
//
// plus `classify_logs`, the single place where program log lines are
// turned into an event kind.
//
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures_util::future::join_all;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::domain::{EventType, LedgerTx, Side};
use crate::gateway::synthetic_signature;
use crate::metrics::LEDGER_RPC_ERRORS;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("rpc transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("rpc timed out after {0:?}")]
    Timeout(Duration),
    #[error("rpc http status {0}")]
    Status(u16),
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("malformed rpc response: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait TransactionSource: Send + Sync {
    /// Most recent transactions touching `program_id`, newest first.
    async fn recent_transactions(&self, program_id: &str, limit: usize) -> Result<Vec<LedgerTx>, LedgerError>;
}

// -----------------------------------------------------------------------------
// Log classification
// -----------------------------------------------------------------------------

/// What a transaction's log lines say it did. String matching on program
/// logs is a heuristic; anything unrecognised is `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    Trade(Option<Side>),
    MarketInitialized,
    PriceUpdated,
    PauseToggled,
    /// Admin withdrawal from a market vault; only ever seen on the ledger.
    Withdraw,
    Unknown,
}

impl LogKind {
    pub fn event_type(&self) -> Option<EventType> {
        match self {
            LogKind::Trade(_) => Some(EventType::Trade),
            LogKind::MarketInitialized => Some(EventType::MarketInit),
            LogKind::PriceUpdated => Some(EventType::PriceUpdate),
            LogKind::PauseToggled => Some(EventType::MarketPause),
            LogKind::Withdraw => Some(EventType::VaultWithdraw),
            LogKind::Unknown => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogKind::Trade(Some(Side::Buy)) => "buy",
            LogKind::Trade(Some(Side::Sell)) => "sell",
            LogKind::Trade(None) => "trade",
            LogKind::MarketInitialized => "market_initialized",
            LogKind::PriceUpdated => "price_updated",
            LogKind::PauseToggled => "pause_toggled",
            LogKind::Withdraw => "withdraw",
            LogKind::Unknown => "unknown",
        }
    }
}

pub fn classify_logs(logs: &[String]) -> LogKind {
    let has = |needle: &str| logs.iter().any(|l| l.to_ascii_lowercase().contains(needle));

    if has("instruction: buy") || has("trade executed: buy") {
        return LogKind::Trade(Some(Side::Buy));
    }
    if has("instruction: sell") || has("trade executed: sell") {
        return LogKind::Trade(Some(Side::Sell));
    }
    if has("trade executed") {
        return LogKind::Trade(None);
    }
    if has("instruction: initializemarket") || has("market initialized") {
        return LogKind::MarketInitialized;
    }
    if has("instruction: updateprice") || has("price updated") {
        return LogKind::PriceUpdated;
    }
    if has("instruction: pause") || has("paused state") {
        return LogKind::PauseToggled;
    }
    if has("instruction: withdraw") {
        return LogKind::Withdraw;
    }
    LogKind::Unknown
}

// -----------------------------------------------------------------------------
// JSON-RPC
// -----------------------------------------------------------------------------
#[derive(Debug, Deserialize)]
struct RpcEnvelope<T> {
    #[serde(default = "Option::default")]
    result: Option<T>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignatureInfo {
    signature: String,
    slot: u64,
    #[serde(default)]
    err: Option<Value>,
    #[serde(default)]
    block_time: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TxResponse {
    slot: u64,
    #[serde(default)]
    block_time: Option<i64>,
    #[serde(default)]
    meta: Option<TxMeta>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TxMeta {
    #[serde(default)]
    err: Option<Value>,
    #[serde(default)]
    log_messages: Option<Vec<String>>,
}

pub struct RpcLedger {
    http: reqwest::Client,
    url: String,
    timeout: Duration,
    next_id: AtomicU64,
}

impl RpcLedger {
    pub fn new(url: String, timeout: Duration) -> Result<Self, LedgerError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, url, timeout, next_id: AtomicU64::new(1) })
    }

    /// One JSON-RPC call; `Ok(None)` when the node answers `result: null`.
    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<Option<T>, LedgerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });

        let text = timeout(self.timeout, async {
            let rsp = self.http.post(&self.url).json(&body).send().await?;
            if !rsp.status().is_success() {
                return Err(LedgerError::Status(rsp.status().as_u16()));
            }
            Ok::<String, LedgerError>(rsp.text().await?)
        })
        .await
        .map_err(|_| LedgerError::Timeout(self.timeout))??;

        let env: RpcEnvelope<T> =
            serde_json::from_str(&text).map_err(|e| LedgerError::Malformed(format!("{method}: {e}")))?;
        if let Some(err) = env.error {
            return Err(LedgerError::Rpc { code: err.code, message: err.message });
        }
        Ok(env.result)
    }

    async fn signatures(&self, program_id: &str, limit: usize) -> Result<Vec<SignatureInfo>, LedgerError> {
        let params = json!([program_id, { "limit": limit, "commitment": "confirmed" }]);
        self.call::<Vec<SignatureInfo>>("getSignaturesForAddress", params)
            .await?
            .ok_or_else(|| LedgerError::Malformed("getSignaturesForAddress: null result".into()))
    }

    async fn transaction(&self, signature: &str) -> Result<Option<TxResponse>, LedgerError> {
        let params = json!([signature, {
            "encoding": "json",
            "commitment": "confirmed",
            "maxSupportedTransactionVersion": 0
        }]);
        self.call("getTransaction", params).await
    }
}

fn err_text(v: &Option<Value>) -> Option<String> {
    v.as_ref().filter(|e| !e.is_null()).map(|e| e.to_string())
}

#[async_trait]
impl TransactionSource for RpcLedger {
    async fn recent_transactions(&self, program_id: &str, limit: usize) -> Result<Vec<LedgerTx>, LedgerError> {
        let sigs = self.signatures(program_id, limit).await.map_err(|e| {
            LEDGER_RPC_ERRORS.with_label_values(&["getSignaturesForAddress"]).inc();
            e
        })?;

        let details = join_all(sigs.iter().map(|s| self.transaction(&s.signature))).await;

        let mut out = Vec::with_capacity(sigs.len());
        for (info, detail) in sigs.into_iter().zip(details) {
            let (slot, block_time, meta) = match detail {
                Ok(Some(tx)) => (tx.slot, tx.block_time.or(info.block_time), tx.meta),
                Ok(None) => {
                    debug!(signature = %info.signature, "transaction not yet available");
                    (info.slot, info.block_time, None)
                }
                Err(e) => {
                    // keep the signature-level view; logs are missing this cycle
                    LEDGER_RPC_ERRORS.with_label_values(&["getTransaction"]).inc();
                    warn!(signature = %info.signature, %e, "getTransaction failed");
                    (info.slot, info.block_time, None)
                }
            };
            let err = meta.as_ref().and_then(|m| err_text(&m.err)).or_else(|| err_text(&info.err));
            out.push(LedgerTx {
                signature: info.signature,
                slot,
                block_time: block_time.and_then(|t| Utc.timestamp_opt(t, 0).single()),
                success: err.is_none(),
                err,
                logs: meta.and_then(|m| m.log_messages).unwrap_or_default(),
            });
        }
        Ok(out)
    }
}

// -----------------------------------------------------------------------------
// Demo
// -----------------------------------------------------------------------------

/// Synthetic program activity for local runs. Never a fallback for a failing
/// RPC: it is only constructed when explicitly configured.
pub struct DemoLedger {
    slot: AtomicU64,
}

impl Default for DemoLedger {
    fn default() -> Self { Self { slot: AtomicU64::new(250_000_000) } }
}

impl DemoLedger {
    fn batch(&self, n: usize) -> Vec<LedgerTx> {
        let mut rng = rand::thread_rng();
        (0..n)
            .map(|_| {
                let slot = self.slot.fetch_add(rng.gen_range(1..40), Ordering::Relaxed);
                let ix = if rng.gen_bool(0.5) { "Buy" } else { "Sell" };
                LedgerTx {
                    signature: format!("demo{}", &synthetic_signature()[4..]),
                    slot,
                    block_time: Some(Utc::now()),
                    success: true,
                    err: None,
                    logs: vec![
                        "Program FPrNfqSjEL59H3PAEzXK9gU9VwAFXLrMwyFeNZ3dKb7o invoke [1]".into(),
                        format!("Program log: Instruction: {ix}"),
                    ],
                }
            })
            .collect()
    }
}

#[async_trait]
impl TransactionSource for DemoLedger {
    async fn recent_transactions(&self, _program_id: &str, limit: usize) -> Result<Vec<LedgerTx>, LedgerError> {
        Ok(self.batch(limit.min(3)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{closed_addr, spawn_stub};

    fn logs(lines: &[&str]) -> Vec<String> {
        lines.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn classifies_program_logs() {
        assert_eq!(classify_logs(&logs(&["Program log: Instruction: Buy"])), LogKind::Trade(Some(Side::Buy)));
        assert_eq!(classify_logs(&logs(&["Program log: Instruction: Sell"])), LogKind::Trade(Some(Side::Sell)));
        assert_eq!(classify_logs(&logs(&["Trade executed"])), LogKind::Trade(None));
        assert_eq!(
            classify_logs(&logs(&["Program log: Market initialized at price: 1000000"])),
            LogKind::MarketInitialized
        );
        assert_eq!(classify_logs(&logs(&["Program log: Price updated to 1010000"])), LogKind::PriceUpdated);
        assert_eq!(classify_logs(&logs(&["Program log: Paused state: true"])), LogKind::PauseToggled);
        assert_eq!(classify_logs(&logs(&["Program log: Instruction: Withdraw"])), LogKind::Withdraw);
        assert_eq!(LogKind::Withdraw.event_type(), Some(EventType::VaultWithdraw));
        assert_eq!(classify_logs(&logs(&["Program log: Instruction: Transfer"])), LogKind::Unknown);
        assert_eq!(classify_logs(&[]), LogKind::Unknown);
        assert_eq!(LogKind::Unknown.event_type(), None);
    }

    #[tokio::test]
    async fn fetches_signatures_then_transactions() {
        let addr = spawn_stub(|_, body| {
            let req: Value = serde_json::from_str(body).unwrap();
            let id = req["id"].clone();
            let result = match req["method"].as_str().unwrap() {
                "getSignaturesForAddress" => json!([
                    { "signature": "sigA", "slot": 10, "err": null, "blockTime": 1_700_000_000 },
                    { "signature": "sigB", "slot": 11, "err": { "InstructionError": [0, "Custom"] }, "blockTime": null },
                    { "signature": "sigC", "slot": 12, "err": null, "blockTime": null }
                ]),
                "getTransaction" => match req["params"][0].as_str().unwrap() {
                    "sigA" => json!({ "slot": 10, "blockTime": 1_700_000_000,
                        "meta": { "err": null, "logMessages": ["Program log: Instruction: Buy"] } }),
                    "sigB" => json!({ "slot": 11, "blockTime": null,
                        "meta": { "err": { "InstructionError": [0, "Custom"] }, "logMessages": ["Program log: Instruction: Sell"] } }),
                    _ => Value::Null,
                },
                _ => Value::Null,
            };
            (200, json!({ "jsonrpc": "2.0", "id": id, "result": result }).to_string())
        });

        let rpc = RpcLedger::new(format!("http://{addr}"), Duration::from_secs(2)).unwrap();
        let txs = rpc.recent_transactions("prog", 10).await.unwrap();
        assert_eq!(txs.len(), 3);
        assert!(txs[0].success);
        assert_eq!(txs[0].logs, vec!["Program log: Instruction: Buy".to_string()]);
        assert_eq!(txs[0].block_time.unwrap().timestamp(), 1_700_000_000);
        assert!(!txs[1].success);
        assert!(txs[1].err.as_deref().unwrap().contains("InstructionError"));
        assert_eq!(txs[2].slot, 12);
        assert!(txs[2].logs.is_empty());
    }

    #[tokio::test]
    async fn rpc_failures_are_errors_not_data() {
        let addr = spawn_stub(|_, _| (500, "oops".into()));
        let rpc = RpcLedger::new(format!("http://{addr}"), Duration::from_secs(2)).unwrap();
        assert!(matches!(rpc.recent_transactions("p", 5).await, Err(LedgerError::Status(500))));

        let addr = spawn_stub(|_, _| (200, "{not json".into()));
        let rpc = RpcLedger::new(format!("http://{addr}"), Duration::from_secs(2)).unwrap();
        assert!(matches!(rpc.recent_transactions("p", 5).await, Err(LedgerError::Malformed(_))));

        let addr = spawn_stub(|_, _| {
            (200, r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32005,"message":"node is behind"}}"#.into())
        });
        let rpc = RpcLedger::new(format!("http://{addr}"), Duration::from_secs(2)).unwrap();
        assert!(matches!(rpc.recent_transactions("p", 5).await, Err(LedgerError::Rpc { code: -32005, .. })));

        let rpc = RpcLedger::new(format!("http://{}", closed_addr()), Duration::from_secs(2)).unwrap();
        assert!(rpc.recent_transactions("p", 5).await.is_err());
    }

    #[tokio::test]
    async fn demo_transactions_are_tagged() {
        let txs = DemoLedger::default().recent_transactions("p", 10).await.unwrap();
        assert_eq!(txs.len(), 3);
        assert!(txs.iter().all(|t| t.signature.starts_with("demo")));
        assert!(txs.iter().all(|t| classify_logs(&t.logs) != LogKind::Unknown));
    }
}
