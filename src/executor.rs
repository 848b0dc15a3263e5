// ===============================
// src/executor.rs (trade execution + admin market path)
// ===============================
//
// Pre-trade checks -> settlement submission -> pending trade record.
// The reconciler promotes pending trades once the ledger confirms them.
//
// No in-process lock per market: the settlement signature is the
// idempotency key and the store rejects a second row for it.
//
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::cache::{market_key, CacheBus, MARKETS_LIST_KEY};
use crate::domain::{
    Envelope, EventType, Market, NewEvent, Side, Trade, TradeStatus, CH_MARKET_STATUS, CH_TRADES,
};
use crate::gateway::{Instruction, ProgramError, SettlementProgram, SubmitError, Submission};
use crate::metrics::TRADES;
use crate::positions::total_value;
use crate::store::{Store, StoreError};

/// Signer used for admin instructions when the market carries no admin key.
pub const DEFAULT_ADMIN: &str = "admin";

#[derive(Debug, Clone)]
pub struct TradeRequest {
    pub market_id: String,
    pub trader: String,
    pub side: Side,
    pub amount: u64,
    /// Buy: maximum acceptable price. Sell: minimum.
    pub price_limit: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeReceipt {
    pub signature: String,
    pub market_id: String,
    pub side: Side,
    pub amount: i64,
    pub price: i64,
    pub total_value: i64,
    pub event_id: i64,
}

#[derive(Debug, Error)]
pub enum TradeError {
    #[error("market {0} not found")]
    MarketNotFound(String),
    #[error("market {0} is paused")]
    MarketPaused(String),
    #[error("market {0} is not active")]
    MarketInactive(String),
    #[error("invalid amount {0}")]
    InvalidAmount(u64),
    #[error("invalid price {0}")]
    InvalidPrice(i64),
    #[error("{side:?} limit {limit} violated by current price {current}")]
    PriceLimit { side: Side, current: i64, limit: i64 },
    #[error("amount x price overflows")]
    Overflow,
    #[error("never submitted: {0}")]
    NotSubmitted(String),
    #[error("rejected by ledger: {reason}")]
    Rejected { program: Option<ProgramError>, reason: String },
    #[error("submitted, outcome unknown: {reason}")]
    OutcomeUnknown { signature: Option<String>, reason: String },
    #[error("duplicate settlement signature {0}")]
    DuplicateSignature(String),
    #[error(transparent)]
    Store(StoreError),
}

impl TradeError {
    pub fn label(&self) -> &'static str {
        match self {
            TradeError::MarketNotFound(_) => "market_not_found",
            TradeError::MarketPaused(_) => "paused",
            TradeError::MarketInactive(_) => "inactive",
            TradeError::InvalidAmount(_) | TradeError::InvalidPrice(_) => "invalid",
            TradeError::PriceLimit { .. } => "price_limit",
            TradeError::Overflow => "overflow",
            TradeError::NotSubmitted(_) => "not_submitted",
            TradeError::Rejected { program: Some(p), .. } => p.as_str(),
            TradeError::Rejected { program: None, .. } => "rejected",
            TradeError::OutcomeUnknown { .. } => "unknown",
            TradeError::DuplicateSignature(_) => "duplicate",
            TradeError::Store(_) => "store",
        }
    }
}

impl From<SubmitError> for TradeError {
    fn from(e: SubmitError) -> Self {
        match e {
            SubmitError::NotSubmitted(r) => TradeError::NotSubmitted(r),
            SubmitError::Rejected { program, reason } => TradeError::Rejected { program, reason },
            SubmitError::Unknown { signature, reason } => TradeError::OutcomeUnknown { signature, reason },
        }
    }
}

impl From<StoreError> for TradeError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DuplicateSignature(s) => TradeError::DuplicateSignature(s),
            StoreError::MarketNotFound(m) => TradeError::MarketNotFound(m),
            other => TradeError::Store(other),
        }
    }
}

/// Pre-trade checks. On success returns `(amount, total_value)` in store units.
pub fn check(market: &Market, req: &TradeRequest) -> Result<(i64, i64), TradeError> {
    // 1) market state
    if market.paused {
        return Err(TradeError::MarketPaused(market.id.clone()));
    }
    if !market.active {
        return Err(TradeError::MarketInactive(market.id.clone()));
    }

    // 2) amount
    let amount = i64::try_from(req.amount).ok().filter(|a| *a > 0).ok_or(TradeError::InvalidAmount(req.amount))?;

    // 3) price limit
    if let Some(limit) = req.price_limit {
        let current = market.current_price;
        let violated = match req.side {
            Side::Buy => current > limit,
            Side::Sell => current < limit,
        };
        if violated {
            return Err(TradeError::PriceLimit { side: req.side, current, limit });
        }
    }

    // 4) notional
    let total = total_value(amount, market.current_price).ok_or(TradeError::Overflow)?;
    Ok((amount, total))
}

pub struct TradeExecutor {
    store: Store,
    program: Arc<dyn SettlementProgram>,
    cache: Arc<dyn CacheBus>,
}

impl TradeExecutor {
    pub fn new(store: Store, program: Arc<dyn SettlementProgram>, cache: Arc<dyn CacheBus>) -> Self {
        Self { store, program, cache }
    }

    async fn load_market(&self, id: &str) -> Result<Market, TradeError> {
        self.store.market(id).await?.ok_or_else(|| TradeError::MarketNotFound(id.to_string()))
    }

    async fn notify(&self, channel: &str, env: Envelope) {
        if let Err(e) = self.cache.publish(channel, &env).await {
            warn!(%channel, %e, "notification not published");
        }
    }

    async fn invalidate_market(&self, market_id: &str) {
        for key in [market_key(market_id), MARKETS_LIST_KEY.to_string()] {
            if let Err(e) = self.cache.del_prefix(&key).await {
                warn!(%key, %e, "cache invalidation failed");
            }
        }
    }

    /// Buy or sell against a market. The returned trade is `pending` until
    /// the reconciler sees its signature on the ledger.
    pub async fn execute(&self, req: &TradeRequest) -> Result<TradeReceipt, TradeError> {
        let res = self.execute_inner(req).await;
        let label = match &res {
            Ok(_) => "ok",
            Err(e) => e.label(),
        };
        TRADES.with_label_values(&[req.side.as_str(), label]).inc();
        res
    }

    async fn execute_inner(&self, req: &TradeRequest) -> Result<TradeReceipt, TradeError> {
        let market = self.load_market(&req.market_id).await?;
        let (amount, total) = check(&market, req)?;

        let ix = match req.side {
            Side::Buy => Instruction::Buy { amount: req.amount },
            Side::Sell => Instruction::Sell { amount: req.amount },
        };
        let sub = self.program.submit(market.ledger_address(), &req.trader, ix).await?;

        let now = Utc::now();
        let trade = Trade {
            signature: sub.signature.clone(),
            market_id: market.id.clone(),
            trader: req.trader.clone(),
            side: req.side,
            amount,
            price: market.current_price,
            total_value: total,
            status: TradeStatus::Pending,
            slot: None,
            confirmed_at: None,
            created_at: now,
        };
        let ev = NewEvent {
            event_type: EventType::Trade,
            market_id: Some(market.id.clone()),
            signature: Some(sub.signature.clone()),
            payload: json!({
                "trader": trade.trader,
                "side": trade.side,
                "amount": amount,
                "price": trade.price,
                "total_value": total,
                "submitted_slot": sub.slot,
            }),
            created_at: now,
        };

        let event_id = match self.store.record_pending_trade(&trade, &ev).await {
            Ok(id) => id,
            Err(e) => {
                // on the ledger but not in the store; the reconciler will
                // synthesize an event for it when it shows up
                error!(signature = %sub.signature, market = %market.id, %e, "submitted trade not recorded");
                return Err(e.into());
            }
        };

        info!(
            signature = %trade.signature, market = %market.id, trader = %trade.trader,
            side = trade.side.as_str(), amount, price = trade.price, total, "trade submitted"
        );
        self.notify(CH_TRADES, Envelope::new("trade_submitted", json!(trade))).await;

        Ok(TradeReceipt {
            signature: trade.signature,
            market_id: trade.market_id,
            side: trade.side,
            amount,
            price: trade.price,
            total_value: total,
            event_id,
        })
    }

    // ---------------- admin path ----------------

    /// Push an already-committed price to the program market.
    pub async fn update_price_onchain(&self, market: &Market, price: i64) -> Result<Submission, SubmitError> {
        let scaled = u128::try_from(price).map_err(|_| SubmitError::NotSubmitted(format!("invalid price {price}")))?;
        let signer = market.admin.as_deref().unwrap_or(DEFAULT_ADMIN);
        self.program.submit(market.ledger_address(), signer, Instruction::UpdatePrice { price: scaled }).await
    }

    /// Pause or resume trading. The program instruction toggles, so nothing
    /// is submitted when the market is already in the requested state.
    pub async fn set_paused(&self, market_id: &str, paused: bool) -> Result<Option<Submission>, TradeError> {
        let market = self.load_market(market_id).await?;
        if market.paused == paused {
            return Ok(None);
        }

        let signer = market.admin.as_deref().unwrap_or(DEFAULT_ADMIN);
        let sub = self.program.submit(market.ledger_address(), signer, Instruction::Pause).await?;

        self.store.set_paused(market_id, paused).await?;
        let ev = NewEvent::now(
            EventType::MarketPause,
            Some(market_id.to_string()),
            Some(sub.signature.clone()),
            json!({ "paused": paused }),
        );
        if let Err(e) = self.store.insert_event(&ev).await {
            warn!(market = %market_id, %e, "pause audit event not recorded");
        }

        info!(market = %market_id, paused, signature = %sub.signature, "paused state changed");
        self.invalidate_market(market_id).await;
        self.notify(
            CH_MARKET_STATUS,
            Envelope::new("market_paused", json!({ "market_id": market_id, "paused": paused })),
        )
        .await;
        Ok(Some(sub))
    }

    /// Create the program market at `market.current_price` and persist it.
    pub async fn initialize_market(&self, market: Market) -> Result<Submission, TradeError> {
        let price = u128::try_from(market.current_price)
            .ok()
            .filter(|p| *p > 0)
            .ok_or(TradeError::InvalidPrice(market.current_price))?;

        let signer = market.admin.as_deref().unwrap_or(DEFAULT_ADMIN);
        let sub = self
            .program
            .submit(market.ledger_address(), signer, Instruction::InitializeMarket { price })
            .await?;

        self.store.upsert_market(&market).await?;
        let ev = NewEvent::now(
            EventType::MarketInit,
            Some(market.id.clone()),
            Some(sub.signature.clone()),
            json!({ "bond_id": market.bond_id, "price": market.current_price }),
        );
        if let Err(e) = self.store.insert_event(&ev).await {
            warn!(market = %market.id, %e, "market init event not recorded");
        }

        info!(market = %market.id, price = market.current_price, signature = %sub.signature, "market initialized");
        self.invalidate_market(&market.id).await;
        self.notify(CH_MARKET_STATUS, Envelope::new("market_initialized", json!(market))).await;
        Ok(sub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::gateway::MockSettlement;
    use crate::store::tests::market;

    struct Rig {
        store: Store,
        mock: Arc<MockSettlement>,
        cache: Arc<MemoryCache>,
        exec: TradeExecutor,
    }

    async fn rig_with(mock: MockSettlement) -> Rig {
        let store = Store::in_memory().unwrap();
        store.upsert_market(&market("m1", 1_500_000)).await.unwrap();
        let mock = Arc::new(mock);
        let cache = Arc::new(MemoryCache::default());
        let exec = TradeExecutor::new(store.clone(), mock.clone(), cache.clone());
        Rig { store, mock, cache, exec }
    }

    fn buy(amount: u64, limit: Option<i64>) -> TradeRequest {
        TradeRequest { market_id: "m1".into(), trader: "alice".into(), side: Side::Buy, amount, price_limit: limit }
    }

    #[tokio::test]
    async fn successful_buy_records_pending_trade_and_event() {
        let r = rig_with(MockSettlement::new(0)).await;
        let mut trades_rx = r.cache.subscribe(CH_TRADES);

        let receipt = r.exec.execute(&buy(10, Some(2_000_000))).await.unwrap();
        assert_eq!(receipt.total_value, 15);

        let stored = r.store.trade(&receipt.signature).await.unwrap().unwrap();
        assert_eq!(stored.status, TradeStatus::Pending);
        assert_eq!(stored.price, 1_500_000);
        let evs = r.store.events_for_signature(&receipt.signature).await.unwrap();
        assert_eq!(evs.len(), 1);
        assert_eq!(evs[0].event_type, EventType::Trade);
        assert!(!evs[0].processed);

        let msg: serde_json::Value = serde_json::from_str(&trades_rx.recv().await.unwrap()).unwrap();
        assert_eq!(msg["type"], "trade_submitted");
        assert_eq!(r.mock.submitted().len(), 1);
    }

    #[tokio::test]
    async fn paused_and_inactive_markets_reject_before_submission() {
        let r = rig_with(MockSettlement::new(0)).await;
        let mut m = market("m1", 1_500_000);
        m.paused = true;
        r.store.upsert_market(&m).await.unwrap();
        assert!(matches!(r.exec.execute(&buy(1, None)).await, Err(TradeError::MarketPaused(_))));

        m.paused = false;
        m.active = false;
        r.store.upsert_market(&m).await.unwrap();
        assert!(matches!(r.exec.execute(&buy(1, None)).await, Err(TradeError::MarketInactive(_))));
        assert!(r.mock.submitted().is_empty());

        let missing = TradeRequest { market_id: "nope".into(), ..buy(1, None) };
        assert!(matches!(r.exec.execute(&missing).await, Err(TradeError::MarketNotFound(_))));
    }

    #[test]
    fn price_limits_by_side() {
        let m = market("m1", 1_500_000);
        assert!(matches!(check(&m, &buy(1, Some(1_400_000))), Err(TradeError::PriceLimit { .. })));
        assert!(check(&m, &buy(1, Some(1_500_000))).is_ok());

        let sell = |limit| TradeRequest { side: Side::Sell, ..buy(1, Some(limit)) };
        assert!(matches!(check(&m, &sell(1_600_000)), Err(TradeError::PriceLimit { .. })));
        assert!(check(&m, &sell(1_400_000)).is_ok());
    }

    #[test]
    fn amount_and_overflow_guards() {
        let m = market("m1", 2_000_000);
        assert!(matches!(check(&m, &buy(0, None)), Err(TradeError::InvalidAmount(0))));
        assert!(matches!(check(&m, &buy(u64::MAX, None)), Err(TradeError::InvalidAmount(_))));
        assert!(matches!(check(&m, &buy(i64::MAX as u64, None)), Err(TradeError::Overflow)));
    }

    #[tokio::test]
    async fn duplicate_signature_keeps_one_trade() {
        let r = rig_with(MockSettlement::new(0).with_signature("dup-sig")).await;
        r.exec.execute(&buy(2, None)).await.unwrap();
        let err = r.exec.execute(&buy(5, None)).await.unwrap_err();
        assert!(matches!(err, TradeError::DuplicateSignature(ref s) if s == "dup-sig"));

        let stored = r.store.trade("dup-sig").await.unwrap().unwrap();
        assert_eq!(stored.amount, 2);
        assert_eq!(r.store.events_for_signature("dup-sig").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn ledger_failures_are_typed_and_leave_no_trade() {
        let r = rig_with(MockSettlement::new(0)).await;

        r.mock.reject_all("Transaction simulation failed: custom program error: 0x1771");
        let err = r.exec.execute(&buy(1, None)).await.unwrap_err();
        assert!(matches!(err, TradeError::Rejected { program: Some(ProgramError::InsufficientVaultFunds), .. }));
        assert_eq!(err.label(), "insufficient_vault_funds");

        r.mock.reject_all("blockhash not found");
        let err = r.exec.execute(&buy(1, None)).await.unwrap_err();
        assert!(matches!(err, TradeError::Rejected { program: None, .. }));
        assert_eq!(err.label(), "rejected");

        r.mock.unreachable();
        assert!(matches!(r.exec.execute(&buy(1, None)).await, Err(TradeError::NotSubmitted(_))));

        assert!(r.store.trades_with_status(TradeStatus::Pending).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pause_toggles_once_and_notifies() {
        let r = rig_with(MockSettlement::new(0)).await;
        let mut status_rx = r.cache.subscribe(CH_MARKET_STATUS);

        let sub = r.exec.set_paused("m1", true).await.unwrap().unwrap();
        assert!(r.store.market("m1").await.unwrap().unwrap().paused);
        assert_eq!(r.store.events_for_signature(&sub.signature).await.unwrap()[0].event_type, EventType::MarketPause);
        let msg: serde_json::Value = serde_json::from_str(&status_rx.recv().await.unwrap()).unwrap();
        assert_eq!(msg["data"]["paused"], true);

        assert!(r.exec.set_paused("m1", true).await.unwrap().is_none());
        assert_eq!(r.mock.submitted(), vec![("m1".to_string(), Instruction::Pause)]);
    }

    #[tokio::test]
    async fn initialize_market_persists_and_audits() {
        let r = rig_with(MockSettlement::new(0)).await;
        let sub = r.exec.initialize_market(market("m2", 1_000_000)).await.unwrap();
        assert_eq!(r.store.market("m2").await.unwrap().unwrap().current_price, 1_000_000);
        assert_eq!(r.store.events_for_signature(&sub.signature).await.unwrap()[0].event_type, EventType::MarketInit);

        let err = r.exec.initialize_market(market_with_price("m3", 0)).await.unwrap_err();
        assert!(matches!(err, TradeError::InvalidPrice(0)));
    }

    fn market_with_price(id: &str, price: i64) -> Market {
        Market { current_price: price, ..market(id, 1) }
    }
}
