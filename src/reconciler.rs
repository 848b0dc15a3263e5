// ===============================
// src/reconciler.rs (off-chain records vs ledger)
// ===============================
//
// Per event: unprocessed -> {confirmed | matched | failed_on_ledger |
// content_matched | unmatched_timeout} -> processed.
//
// One ledger fetch per cycle, shared by the whole batch. A fetch failure
// aborts the cycle; a failure on one event is logged and the batch goes on.
//
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use chrono::{DateTime, Utc};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::cache::{write_status, CacheBus};
use crate::domain::{CycleStatus, Envelope, EventType, LedgerTx, LoopState, NewEvent, SystemEvent, CH_TRADES};
use crate::gateway::ProgramError;
use crate::ledger::{classify_logs, LedgerError, TransactionSource};
use crate::metrics::{
    RECON_CYCLES, RECON_EVENTS, RECON_LAST_SLOT, RECON_STALE_UNMATCHED, RECON_SYNTHESIZED, RECON_TX_CHECKED,
};
use crate::positions::apply_fill;
use crate::store::{Store, StoreError};

pub const LOOP_NAME: &str = "reconciler";

/// Event types the reconciler settles.
pub const RECONCILED_TYPES: [EventType; 4] =
    [EventType::Trade, EventType::PriceUpdate, EventType::MarketInit, EventType::MarketPause];

// A content match may not pick a transaction this much older than the event.
const CONTENT_MATCH_SLACK_SECS: i64 = 60;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("ledger fetch failed: {0}")]
    Ledger(#[from] LedgerError),
    #[error("loading events failed: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Confirmed,
    Matched,
    FailedOnLedger,
    ContentMatched,
    UnmatchedTimeout,
    Pending,
}

impl EventOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventOutcome::Confirmed => "confirmed",
            EventOutcome::Matched => "matched",
            EventOutcome::FailedOnLedger => "failed_on_ledger",
            EventOutcome::ContentMatched => "content_matched",
            EventOutcome::UnmatchedTimeout => "unmatched_timeout",
            EventOutcome::Pending => "pending",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ReconcilerCfg {
    pub program_id: String,
    pub batch_size: usize,
    pub fetch_limit: usize,
    pub stale_after: chrono::Duration,
    pub status_ttl: Duration,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileStats {
    pub events: u64,
    pub confirmed: u64,
    pub matched: u64,
    pub failed_on_ledger: u64,
    pub content_matched: u64,
    pub unmatched_timeout: u64,
    pub pending: u64,
    pub errors: u64,
    pub tx_checked: u64,
    pub synthesized: u64,
    pub last_slot: u64,
}

impl ReconcileStats {
    fn tally(&mut self, outcome: EventOutcome) {
        match outcome {
            EventOutcome::Confirmed => self.confirmed += 1,
            EventOutcome::Matched => self.matched += 1,
            EventOutcome::FailedOnLedger => self.failed_on_ledger += 1,
            EventOutcome::ContentMatched => self.content_matched += 1,
            EventOutcome::UnmatchedTimeout => self.unmatched_timeout += 1,
            EventOutcome::Pending => self.pending += 1,
        }
    }

    fn counts(&self) -> BTreeMap<String, u64> {
        BTreeMap::from([
            ("events".to_string(), self.events),
            ("confirmed".to_string(), self.confirmed),
            ("matched".to_string(), self.matched),
            ("failed_on_ledger".to_string(), self.failed_on_ledger),
            ("content_matched".to_string(), self.content_matched),
            ("unmatched_timeout".to_string(), self.unmatched_timeout),
            ("pending".to_string(), self.pending),
            ("errors".to_string(), self.errors),
            ("tx_checked".to_string(), self.tx_checked),
            ("synthesized".to_string(), self.synthesized),
            ("last_slot".to_string(), self.last_slot),
        ])
    }
}

pub struct Reconciler {
    store: Store,
    ledger: Arc<dyn TransactionSource>,
    cache: Arc<dyn CacheBus>,
    cfg: ReconcilerCfg,
}

impl Reconciler {
    pub fn new(store: Store, ledger: Arc<dyn TransactionSource>, cache: Arc<dyn CacheBus>, cfg: ReconcilerCfg) -> Self {
        Self { store, ledger, cache, cfg }
    }

    pub async fn run_cycle(&self) -> Result<ReconcileStats, ReconcileError> {
        let res = self.cycle(Utc::now()).await;
        let status = match &res {
            Ok(stats) => {
                RECON_CYCLES.with_label_values(&["ok"]).inc();
                CycleStatus { status: LoopState::Ok, last_run: Utc::now(), counts: stats.counts(), error: None }
            }
            Err(e) => {
                RECON_CYCLES.with_label_values(&["error"]).inc();
                error!(%e, "reconciliation cycle aborted");
                CycleStatus {
                    status: LoopState::Error,
                    last_run: Utc::now(),
                    counts: BTreeMap::new(),
                    error: Some(e.to_string()),
                }
            }
        };
        if let Err(e) = write_status(self.cache.as_ref(), LOOP_NAME, &status, self.cfg.status_ttl).await {
            warn!(%e, "reconciler status not written");
        }
        res
    }

    async fn cycle(&self, now: DateTime<Utc>) -> Result<ReconcileStats, ReconcileError> {
        // 1) batch
        let events = self.store.unprocessed_events(&RECONCILED_TYPES, self.cfg.batch_size).await?;

        // 2) one fetch for the whole batch
        let txs = self.ledger.recent_transactions(&self.cfg.program_id, self.cfg.fetch_limit).await?;
        let by_sig: HashMap<&str, &LedgerTx> = txs.iter().map(|t| (t.signature.as_str(), t)).collect();

        let mut stats = ReconcileStats { events: events.len() as u64, tx_checked: txs.len() as u64, ..Default::default() };
        RECON_TX_CHECKED.inc_by(txs.len() as u64);
        let mut claimed: HashSet<String> = HashSet::new();

        // 3-5) settle each event
        for ev in &events {
            match self.reconcile_event(ev, &by_sig, &txs, &mut claimed, now).await {
                Ok(outcome) => {
                    RECON_EVENTS.with_label_values(&[outcome.as_str()]).inc();
                    stats.tally(outcome);
                }
                Err(e) => {
                    RECON_EVENTS.with_label_values(&["error"]).inc();
                    warn!(event = ev.id, %e, "event reconciliation failed");
                    stats.errors += 1;
                }
            }
        }

        // 6) on-chain activity we have no record of
        for tx in &txs {
            match self.synthesize(tx, &claimed, now).await {
                Ok(true) => stats.synthesized += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(signature = %tx.signature, %e, "event synthesis failed");
                    stats.errors += 1;
                }
            }
        }

        // 7) slot cursor
        if let Some(max) = txs.iter().map(|t| t.slot).max() {
            match self.store.record_slot(max).await {
                Ok(slot) => {
                    stats.last_slot = slot;
                    RECON_LAST_SLOT.set(slot as i64);
                }
                Err(e) => {
                    warn!(slot = max, %e, "slot cursor not stored");
                    stats.errors += 1;
                }
            }
        }

        info!(
            events = stats.events, confirmed = stats.confirmed, matched = stats.matched,
            failed = stats.failed_on_ledger, content = stats.content_matched, stale = stats.unmatched_timeout,
            synthesized = stats.synthesized, tx = stats.tx_checked, errors = stats.errors,
            "reconciliation cycle done"
        );
        Ok(stats)
    }

    async fn reconcile_event(
        &self,
        ev: &SystemEvent,
        by_sig: &HashMap<&str, &LedgerTx>,
        txs: &[LedgerTx],
        claimed: &mut HashSet<String>,
        now: DateTime<Utc>,
    ) -> Result<EventOutcome, StoreError> {
        if let Some(sig) = ev.signature.as_deref() {
            if let Some(tx) = by_sig.get(sig) {
                claimed.insert(tx.signature.clone());
                return self.settle_signed(ev, tx, now).await;
            }
        } else if let Some(tx) = self.content_match(ev, txs, claimed).await? {
            // best effort: the logs only say *a* matching instruction ran
            claimed.insert(tx.signature.clone());
            self.store
                .mark_event_processed(ev.id, EventOutcome::ContentMatched.as_str(), Some(&tx.signature))
                .await?;
            debug!(event = ev.id, signature = %tx.signature, "event content-matched");
            return Ok(EventOutcome::ContentMatched);
        }

        if now - ev.created_at > self.cfg.stale_after {
            self.store.mark_event_processed(ev.id, EventOutcome::UnmatchedTimeout.as_str(), None).await?;
            RECON_STALE_UNMATCHED.inc();
            warn!(
                event = ev.id, kind = ev.event_type.as_str(), signature = ?ev.signature,
                age_secs = (now - ev.created_at).num_seconds(), "giving up on unmatched event"
            );
            return Ok(EventOutcome::UnmatchedTimeout);
        }
        Ok(EventOutcome::Pending)
    }

    async fn settle_signed(&self, ev: &SystemEvent, tx: &LedgerTx, now: DateTime<Utc>) -> Result<EventOutcome, StoreError> {
        let outcome = match (ev.event_type, tx.success) {
            (EventType::Trade, true) => {
                let at = tx.block_time.unwrap_or(now);
                let fill = self
                    .store
                    .confirm_trade(&tx.signature, tx.slot, at, |prev, trade| apply_fill(prev, trade, now))
                    .await?;
                match fill {
                    Some(fill) => {
                        info!(signature = %tx.signature, slot = tx.slot, market = %fill.trade.market_id, "trade confirmed");
                        let env = Envelope::new("trade_confirmed", json!({ "trade": fill.trade, "position": fill.position }));
                        if let Err(e) = self.cache.publish(CH_TRADES, &env).await {
                            warn!(signature = %tx.signature, %e, "confirmation not published");
                        }
                        EventOutcome::Confirmed
                    }
                    None => {
                        debug!(signature = %tx.signature, "no pending trade for signature");
                        EventOutcome::Matched
                    }
                }
            }
            (EventType::Trade, false) => {
                let raw = tx.err.as_deref().unwrap_or("transaction failed");
                let program =
                    ProgramError::decode_any(std::iter::once(raw).chain(tx.logs.iter().map(String::as_str)));
                let reason = match program {
                    Some(p) => format!("{}: {raw}", p.as_str()),
                    None => raw.to_string(),
                };
                if self.store.fail_trade(&tx.signature, tx.slot, &reason).await? {
                    warn!(signature = %tx.signature, %reason, "trade failed on ledger");
                    let env = Envelope::new(
                        "trade_failed",
                        json!({ "signature": tx.signature, "reason": reason, "program_error": program }),
                    );
                    if let Err(e) = self.cache.publish(CH_TRADES, &env).await {
                        warn!(signature = %tx.signature, %e, "failure not published");
                    }
                }
                EventOutcome::FailedOnLedger
            }
            (_, true) => EventOutcome::Matched,
            (_, false) => {
                warn!(event = ev.id, kind = ev.event_type.as_str(), signature = %tx.signature, err = ?tx.err,
                      "admin instruction failed on ledger");
                EventOutcome::FailedOnLedger
            }
        };
        self.store.mark_event_processed(ev.id, outcome.as_str(), None).await?;
        Ok(outcome)
    }

    /// First successful, unclaimed, unattributed transaction whose logs
    /// classify as this event's type.
    async fn content_match<'a>(
        &self,
        ev: &SystemEvent,
        txs: &'a [LedgerTx],
        claimed: &HashSet<String>,
    ) -> Result<Option<&'a LedgerTx>, StoreError> {
        let earliest = ev.created_at - chrono::Duration::seconds(CONTENT_MATCH_SLACK_SECS);
        for tx in txs {
            if !tx.success || claimed.contains(&tx.signature) {
                continue;
            }
            if tx.block_time.is_some_and(|t| t < earliest) {
                continue;
            }
            if classify_logs(&tx.logs).event_type() != Some(ev.event_type) {
                continue;
            }
            if self.store.has_record_for_signature(&tx.signature).await? {
                continue;
            }
            return Ok(Some(tx));
        }
        Ok(None)
    }

    async fn synthesize(&self, tx: &LedgerTx, claimed: &HashSet<String>, now: DateTime<Utc>) -> Result<bool, StoreError> {
        if claimed.contains(&tx.signature) {
            return Ok(false);
        }
        let kind = classify_logs(&tx.logs);
        let Some(event_type) = kind.event_type() else {
            return Ok(false);
        };
        if self.store.has_record_for_signature(&tx.signature).await? {
            return Ok(false);
        }

        let ev = NewEvent {
            event_type,
            market_id: None,
            signature: Some(tx.signature.clone()),
            payload: json!({
                "kind": kind.as_str(),
                "slot": tx.slot,
                "success": tx.success,
                "err": tx.err,
                "origin": "ledger",
            }),
            created_at: tx.block_time.unwrap_or(now),
        };
        self.store.insert_processed_event(&ev, "synthesized").await?;
        RECON_SYNTHESIZED.inc();
        info!(signature = %tx.signature, kind = kind.as_str(), slot = tx.slot, "synthesized event for untracked transaction");
        Ok(true)
    }
}
