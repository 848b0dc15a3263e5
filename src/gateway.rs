// ===============================
// src/gateway.rs (settlement program submission)
// ===============================
//
// Two adapters behind `SettlementProgram`:
// - MockSettlement  : accepts after a delay with a synthetic signature
// - RelaySettlement : HMAC-signed REST call to the signing relay that builds,
//                     signs and broadcasts the program instruction
//
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::metrics::ONCHAIN_SUBMITS;
use crate::signing::{sign_request, timestamp_ms, RelayAccepted, RelayFailure};

/// Instructions exposed by the bond market program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "ix", rename_all = "snake_case")]
pub enum Instruction {
    InitializeMarket { price: u128 },
    Buy { amount: u64 },
    Sell { amount: u64 },
    UpdatePrice { price: u128 },
    Pause,
}

impl Instruction {
    pub fn name(&self) -> &'static str {
        match self {
            Instruction::InitializeMarket { .. } => "initialize_market",
            Instruction::Buy { .. } => "buy",
            Instruction::Sell { .. } => "sell",
            Instruction::UpdatePrice { .. } => "update_price",
            Instruction::Pause => "pause",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub signature: String,
    pub slot: Option<u64>,
}

/// Custom errors raised by the bond market program (codes from 6000).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramError {
    MarketPaused,
    InsufficientVaultFunds,
    Unauthorized,
    MathOverflow,
}

impl ProgramError {
    const BASE: u32 = 6000;

    pub fn code(&self) -> u32 {
        Self::BASE
            + match self {
                ProgramError::MarketPaused => 0,
                ProgramError::InsufficientVaultFunds => 1,
                ProgramError::Unauthorized => 2,
                ProgramError::MathOverflow => 3,
            }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code.checked_sub(Self::BASE)? {
            0 => Some(ProgramError::MarketPaused),
            1 => Some(ProgramError::InsufficientVaultFunds),
            2 => Some(ProgramError::Unauthorized),
            3 => Some(ProgramError::MathOverflow),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProgramError::MarketPaused => "market_paused",
            ProgramError::InsufficientVaultFunds => "insufficient_vault_funds",
            ProgramError::Unauthorized => "unauthorized",
            ProgramError::MathOverflow => "math_overflow",
        }
    }

    /// Find a program error code in an error string or log line. Understands
    /// `custom program error: 0x1771`, the RPC `{"Custom":6001}` form and
    /// `Error Number: 6001` from program logs.
    pub fn decode(text: &str) -> Option<Self> {
        let lower = text.to_ascii_lowercase();
        const HEX: &str = "custom program error: 0x";
        if let Some(i) = lower.find(HEX) {
            let digits: String = lower[i + HEX.len()..].chars().take_while(|c| c.is_ascii_hexdigit()).collect();
            return u32::from_str_radix(&digits, 16).ok().and_then(Self::from_code);
        }
        for marker in ["\"custom\":", "error number:"] {
            if let Some(i) = lower.find(marker) {
                let digits: String =
                    lower[i + marker.len()..].trim_start().chars().take_while(|c| c.is_ascii_digit()).collect();
                return digits.parse().ok().and_then(Self::from_code);
            }
        }
        None
    }

    /// First decodable error across an error string and program logs.
    pub fn decode_any<'a>(texts: impl IntoIterator<Item = &'a str>) -> Option<Self> {
        texts.into_iter().find_map(Self::decode)
    }
}

/// Where a submission got to before it failed. Never retry `Unknown` with
/// the same payload blindly: the instruction may already have landed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error("instruction never submitted: {0}")]
    NotSubmitted(String),
    #[error("ledger rejected instruction: {reason}")]
    Rejected { program: Option<ProgramError>, reason: String },
    #[error("submission outcome unknown: {reason}")]
    Unknown { signature: Option<String>, reason: String },
}

impl SubmitError {
    /// Ledger rejection, with the program error decoded from the reason or logs.
    pub fn rejected(reason: impl Into<String>, logs: &[String]) -> Self {
        let reason = reason.into();
        let program = ProgramError::decode_any(std::iter::once(reason.as_str()).chain(logs.iter().map(String::as_str)));
        SubmitError::Rejected { program, reason }
    }

    fn label(&self) -> &'static str {
        match self {
            SubmitError::NotSubmitted(_) => "not_submitted",
            SubmitError::Rejected { .. } => "rejected",
            SubmitError::Unknown { .. } => "unknown",
        }
    }
}

#[async_trait]
pub trait SettlementProgram: Send + Sync {
    /// Submit `ix` against the program market account `market`, signed by `signer`.
    async fn submit(&self, market: &str, signer: &str, ix: Instruction) -> Result<Submission, SubmitError>;
}

fn record(ix: &Instruction, res: &Result<Submission, SubmitError>) {
    let label = match res {
        Ok(_) => "ok",
        Err(e) => e.label(),
    };
    ONCHAIN_SUBMITS.with_label_values(&[ix.name(), label]).inc();
}

const BASE58: &[u8] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

/// Random base58 string shaped like a ledger signature.
pub fn synthetic_signature() -> String {
    let mut rng = rand::thread_rng();
    (0..88).map(|_| BASE58[rng.gen_range(0..BASE58.len())] as char).collect()
}

// -----------------------------------------------------------------------------
// Mock
// -----------------------------------------------------------------------------
#[derive(Debug, Clone)]
enum MockMode {
    Accept,
    Reject(String),
    Unreachable,
}

pub struct MockSettlement {
    fill_ms: u64,
    mode: Mutex<MockMode>,
    fixed_signature: Mutex<Option<String>>,
    submitted: Mutex<Vec<(String, Instruction)>>,
    slot: Mutex<u64>,
}

impl MockSettlement {
    pub fn new(fill_ms: u64) -> Self {
        Self {
            fill_ms,
            mode: Mutex::new(MockMode::Accept),
            fixed_signature: Mutex::new(None),
            submitted: Mutex::new(Vec::new()),
            slot: Mutex::new(1_000),
        }
    }

    /// Every accepted submission reuses this signature.
    pub fn with_signature(self, sig: &str) -> Self {
        *self.fixed_signature.lock() = Some(sig.to_string());
        self
    }

    pub fn reject_all(&self, reason: &str) { *self.mode.lock() = MockMode::Reject(reason.to_string()); }
    pub fn unreachable(&self) { *self.mode.lock() = MockMode::Unreachable; }
    pub fn accept_all(&self) { *self.mode.lock() = MockMode::Accept; }

    pub fn submitted(&self) -> Vec<(String, Instruction)> { self.submitted.lock().clone() }
}

#[async_trait]
impl SettlementProgram for MockSettlement {
    async fn submit(&self, market: &str, _signer: &str, ix: Instruction) -> Result<Submission, SubmitError> {
        let mode = self.mode.lock().clone();
        if let MockMode::Unreachable = mode {
            let res = Err(SubmitError::NotSubmitted("mock ledger unreachable".into()));
            record(&ix, &res);
            return res;
        }

        sleep(Duration::from_millis(self.fill_ms)).await;

        let res = match (&mode, &ix) {
            (MockMode::Reject(reason), _) => Err(SubmitError::rejected(reason.clone(), &[])),
            (_, Instruction::Buy { amount: 0 } | Instruction::Sell { amount: 0 }) => {
                Err(SubmitError::rejected("zero amount", &[]))
            }
            _ => {
                let signature = self.fixed_signature.lock().clone().unwrap_or_else(synthetic_signature);
                let slot = {
                    let mut s = self.slot.lock();
                    *s += 1;
                    *s
                };
                self.submitted.lock().push((market.to_string(), ix.clone()));
                Ok(Submission { signature, slot: Some(slot) })
            }
        };
        record(&ix, &res);
        res
    }
}

// -----------------------------------------------------------------------------
// Relay
// -----------------------------------------------------------------------------
pub struct RelaySettlement {
    http: reqwest::Client,
    base: String,
    api_key: String,
    api_secret: String,
    timeout: Duration,
}

impl RelaySettlement {
    pub fn new(base: String, api_key: String, api_secret: String, timeout: Duration) -> Self {
        Self { http: reqwest::Client::new(), base, api_key, api_secret, timeout }
    }

    async fn send(&self, market: &str, signer: &str, ix: &Instruction) -> Result<Submission, SubmitError> {
        let body = json!({ "program_market": market, "signer": signer, "instruction": ix }).to_string();
        let ts = timestamp_ms();
        let sig = sign_request(&self.api_secret, ts, &body).map_err(|e| SubmitError::NotSubmitted(e.to_string()))?;
        let url = format!("{}/v1/instructions", self.base.trim_end_matches('/'));

        let resp = self
            .http
            .post(url)
            .header("X-Relay-Key", &self.api_key)
            .header("X-Relay-Timestamp", ts.to_string())
            .header("X-Relay-Signature", sig)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .timeout(self.timeout)
            .body(body)
            .send()
            .await;

        match resp {
            Ok(rsp) if rsp.status().is_success() => {
                let text = rsp.text().await.unwrap_or_default();
                match serde_json::from_str::<RelayAccepted>(&text) {
                    Ok(a) => Ok(Submission { signature: a.signature, slot: a.slot }),
                    // accepted but we cannot tell which transaction it became
                    Err(e) => Err(SubmitError::Unknown { signature: None, reason: format!("unreadable acceptance: {e}") }),
                }
            }
            Ok(rsp) => {
                let code = rsp.status();
                let text = rsp.text().await.unwrap_or_default();
                let failure: RelayFailure = serde_json::from_str(&text).unwrap_or_default();
                let reason = if failure.error.is_empty() { text } else { failure.error };
                if !failure.logs.is_empty() {
                    warn!(%code, logs = ?failure.logs, "relay returned program logs");
                }
                match code.as_u16() {
                    // simulation / program error: the ledger said no
                    409 | 422 => Err(SubmitError::rejected(reason, &failure.logs)),
                    400 | 401 | 403 | 404 => Err(SubmitError::NotSubmitted(format!("{code}: {reason}"))),
                    _ => Err(SubmitError::Unknown { signature: failure.signature, reason: format!("{code}: {reason}") }),
                }
            }
            Err(e) if e.is_connect() || e.is_builder() => {
                Err(SubmitError::NotSubmitted(e.to_string()))
            }
            Err(e) => Err(SubmitError::Unknown { signature: None, reason: e.to_string() }),
        }
    }
}

#[async_trait]
impl SettlementProgram for RelaySettlement {
    async fn submit(&self, market: &str, signer: &str, ix: Instruction) -> Result<Submission, SubmitError> {
        let res = self.send(market, signer, &ix).await;
        match &res {
            Ok(s) => info!(ix = ix.name(), %market, signature = %s.signature, "instruction submitted"),
            Err(e) => error!(ix = ix.name(), %market, %e, "instruction failed"),
        }
        record(&ix, &res);
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{closed_addr, spawn_stub};

    #[tokio::test]
    async fn mock_accepts_and_records() {
        let mock = MockSettlement::new(0);
        let s = mock.submit("mkt", "alice", Instruction::Buy { amount: 5 }).await.unwrap();
        assert_eq!(s.signature.len(), 88);
        assert_eq!(mock.submitted(), vec![("mkt".to_string(), Instruction::Buy { amount: 5 })]);

        let err = mock.submit("mkt", "alice", Instruction::Sell { amount: 0 }).await.unwrap_err();
        assert!(matches!(err, SubmitError::Rejected { program: None, .. }));
    }

    #[test]
    fn program_errors_decode_from_every_ledger_form() {
        assert_eq!(
            ProgramError::decode("Transaction simulation failed: custom program error: 0x1770"),
            Some(ProgramError::MarketPaused)
        );
        assert_eq!(
            ProgramError::decode(r#"{"InstructionError":[0,{"Custom":6001}]}"#),
            Some(ProgramError::InsufficientVaultFunds)
        );
        assert_eq!(
            ProgramError::decode("Program log: AnchorError occurred. Error Code: Unauthorized. Error Number: 6002."),
            Some(ProgramError::Unauthorized)
        );
        assert_eq!(ProgramError::decode("custom program error: 0x1773"), Some(ProgramError::MathOverflow));
        assert_eq!(ProgramError::decode("custom program error: 0x1"), None);
        assert_eq!(ProgramError::decode("custom program error: 0x1774"), None);
        assert_eq!(ProgramError::decode("blockhash not found"), None);
        for e in [
            ProgramError::MarketPaused,
            ProgramError::InsufficientVaultFunds,
            ProgramError::Unauthorized,
            ProgramError::MathOverflow,
        ] {
            assert_eq!(ProgramError::from_code(e.code()), Some(e));
        }
    }

    #[tokio::test]
    async fn relay_maps_status_codes_to_outcomes() {
        let addr = spawn_stub(|_, body| {
            let v: serde_json::Value = serde_json::from_str(body).unwrap();
            match v["instruction"]["ix"].as_str() {
                Some("buy") => (200, r#"{"signature":"5xSig","slot":77}"#.into()),
                Some("sell") => (
                    422,
                    r#"{"error":"insufficient funds in vault","logs":["Program log: AnchorError occurred. Error Code: InsufficientVaultFunds. Error Number: 6001."]}"#.into(),
                ),
                _ => (503, r#"{"error":"node behind","signature":"maybe"}"#.into()),
            }
        });
        let relay = RelaySettlement::new(format!("http://{addr}"), "k".into(), "s".into(), Duration::from_secs(2));

        let ok = relay.submit("m", "alice", Instruction::Buy { amount: 1 }).await.unwrap();
        assert_eq!(ok, Submission { signature: "5xSig".into(), slot: Some(77) });

        let rej = relay.submit("m", "alice", Instruction::Sell { amount: 1 }).await.unwrap_err();
        assert_eq!(
            rej,
            SubmitError::Rejected {
                program: Some(ProgramError::InsufficientVaultFunds),
                reason: "insufficient funds in vault".into(),
            }
        );

        let unk = relay.submit("m", "admin", Instruction::Pause).await.unwrap_err();
        assert!(matches!(unk, SubmitError::Unknown { signature: Some(ref s), .. } if s == "maybe"));
    }

    #[tokio::test]
    async fn relay_unreachable_is_never_submitted() {
        let relay = RelaySettlement::new(
            format!("http://{}", closed_addr()),
            "k".into(),
            "s".into(),
            Duration::from_secs(2),
        );
        let err = relay.submit("m", "alice", Instruction::Buy { amount: 1 }).await.unwrap_err();
        assert!(matches!(err, SubmitError::NotSubmitted(_)));
    }
}
