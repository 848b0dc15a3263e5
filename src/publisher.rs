// ===============================
// src/publisher.rs (price validation & publishing)
// ===============================
//
// feed -> match market to bond -> DCF candidate -> bound check ->
// atomic commit -> cache invalidation + notification -> optional on-chain push
//
// Two entry points with different ceilings:
// - UpdatePath::Feed   : periodic feed pipeline, 0.1% < move < 10%
// - UpdatePath::Oracle : direct admin/oracle call,   0% < move < 20%
//
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::cache::{bond_key, market_key, write_status, CacheBus, MARKETS_LIST_KEY};
use crate::config::PriceBounds;
use crate::domain::{
    BondRecord, CycleStatus, Envelope, EventType, LoopState, Market, NewEvent, PriceSource, CH_PRICE_UPDATES,
};
use crate::executor::TradeExecutor;
use crate::feed::BondFeed;
use crate::metrics::{ONCHAIN_PRICE_DIVERGENCE, PRICE_CHANGE_PCT, PRICE_UPDATES};
use crate::store::{PriceCommit, Store, StoreError};
use crate::valuation::value_bond;

pub const LOOP_NAME: &str = "publisher";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePath {
    Feed,
    Oracle,
}

impl UpdatePath {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdatePath::Feed => "feed",
            UpdatePath::Oracle => "oracle",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PriceRejection {
    #[error("non-positive price (current {current}, candidate {candidate})")]
    NonPositive { current: i64, candidate: i64 },
    #[error("move of {change_pct:.4}% is not above the {min}% floor")]
    TooSmall { change_pct: f64, min: f64 },
    #[error("move of {change_pct:.4}% is not below the {max}% ceiling")]
    TooLarge { change_pct: f64, max: f64 },
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("price rejected: {0}")]
    Rejected(#[from] PriceRejection),
    #[error("market {0} not found")]
    MarketNotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// |candidate - current| / current * 100
pub fn change_pct(current: i64, candidate: i64) -> f64 {
    (candidate as f64 - current as f64).abs() / current as f64 * 100.0
}

/// Accept a move only strictly inside the bounds of its entry point.
pub fn validate_move(
    current: i64,
    candidate: i64,
    bounds: &PriceBounds,
    path: UpdatePath,
) -> Result<f64, PriceRejection> {
    if current <= 0 || candidate <= 0 {
        return Err(PriceRejection::NonPositive { current, candidate });
    }
    let pct = change_pct(current, candidate);
    let (min, max) = match path {
        UpdatePath::Feed => (bounds.feed_min_move_pct, bounds.feed_max_move_pct),
        UpdatePath::Oracle => (0.0, bounds.oracle_max_move_pct),
    };
    if pct <= min {
        return Err(PriceRejection::TooSmall { change_pct: pct, min });
    }
    if pct >= max {
        return Err(PriceRejection::TooLarge { change_pct: pct, max });
    }
    Ok(pct)
}

/// Exact identifier first, then case-insensitive name containment.
pub fn match_bond<'a>(market: &Market, bonds: &'a [BondRecord]) -> Option<&'a BondRecord> {
    if let Some(b) = bonds.iter().find(|b| b.bond_id.eq_ignore_ascii_case(&market.bond_id)) {
        return Some(b);
    }
    let name = market.name.to_lowercase();
    if name.is_empty() {
        return None;
    }
    bonds.iter().find(|b| {
        let bn = b.name.to_lowercase();
        !bn.is_empty() && (name.contains(&bn) || bn.contains(&name) || name.contains(&b.bond_id.to_lowercase()))
    })
}

#[derive(Clone, Debug)]
pub struct PublisherCfg {
    pub bounds: PriceBounds,
    pub status_ttl: Duration,
    /// Allow committing prices derived from the fallback bond set.
    pub publish_fallback: bool,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PublishStats {
    pub markets: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub unmatched: u64,
    pub fallback_skipped: u64,
    pub errors: u64,
}

impl PublishStats {
    fn counts(&self) -> BTreeMap<String, u64> {
        BTreeMap::from([
            ("markets".to_string(), self.markets),
            ("accepted".to_string(), self.accepted),
            ("rejected".to_string(), self.rejected),
            ("unmatched".to_string(), self.unmatched),
            ("fallback_skipped".to_string(), self.fallback_skipped),
            ("errors".to_string(), self.errors),
        ])
    }
}

pub struct PricePublisher {
    store: Store,
    feed: Arc<dyn BondFeed>,
    cache: Arc<dyn CacheBus>,
    // Some when ONCHAIN_PRICE_UPDATES is on
    executor: Option<Arc<TradeExecutor>>,
    cfg: PublisherCfg,
}

impl PricePublisher {
    pub fn new(
        store: Store,
        feed: Arc<dyn BondFeed>,
        cache: Arc<dyn CacheBus>,
        executor: Option<Arc<TradeExecutor>>,
        cfg: PublisherCfg,
    ) -> Self {
        Self { store, feed, cache, executor, cfg }
    }

    /// One pass over every active market. Per-market failures are counted
    /// and the pass continues.
    pub async fn run_cycle(&self) -> Result<PublishStats, PublishError> {
        let res = self.cycle(Utc::now()).await;
        let status = match &res {
            Ok(stats) => CycleStatus { status: LoopState::Ok, last_run: Utc::now(), counts: stats.counts(), error: None },
            Err(e) => CycleStatus {
                status: LoopState::Error,
                last_run: Utc::now(),
                counts: BTreeMap::new(),
                error: Some(e.to_string()),
            },
        };
        if let Err(e) = write_status(self.cache.as_ref(), LOOP_NAME, &status, self.cfg.status_ttl).await {
            warn!(%e, "publisher status not written");
        }
        res
    }

    async fn cycle(&self, now: DateTime<Utc>) -> Result<PublishStats, PublishError> {
        let bonds = self.feed.fetch_bonds().await;
        let markets = self.store.markets().await?;
        let mut stats = PublishStats::default();

        for market in markets.iter().filter(|m| m.active) {
            stats.markets += 1;
            let Some(bond) = match_bond(market, &bonds) else {
                debug!(market = %market.id, bond = %market.bond_id, "no feed record for market");
                stats.unmatched += 1;
                continue;
            };
            if bond.source.is_fallback() && !self.cfg.publish_fallback {
                debug!(market = %market.id, "fallback bond data, not committing");
                stats.fallback_skipped += 1;
                continue;
            }

            let candidate = value_bond(bond, now);
            match self.commit(market, candidate, bond.source.tag(), UpdatePath::Feed, Some(&bond.bond_id)).await {
                Ok(_) => stats.accepted += 1,
                Err(PublishError::Rejected(_)) => stats.rejected += 1,
                Err(e) => {
                    error!(market = %market.id, %e, "price update failed");
                    stats.errors += 1;
                }
            }
        }

        info!(
            markets = stats.markets, accepted = stats.accepted, rejected = stats.rejected,
            unmatched = stats.unmatched, fallback_skipped = stats.fallback_skipped, errors = stats.errors,
            "publisher cycle done"
        );
        Ok(stats)
    }

    /// Direct admin/oracle price update; uses the wider oracle bound.
    pub async fn admin_update_price(
        &self,
        market_id: &str,
        new_price: i64,
        source: PriceSource,
    ) -> Result<i64, PublishError> {
        let market = self
            .store
            .market(market_id)
            .await?
            .ok_or_else(|| PublishError::MarketNotFound(market_id.to_string()))?;
        self.commit(&market, new_price, source.tag(), UpdatePath::Oracle, None).await
    }

    async fn commit(
        &self,
        market: &Market,
        candidate: i64,
        source: &str,
        path: UpdatePath,
        bond_id: Option<&str>,
    ) -> Result<i64, PublishError> {
        let old = market.current_price;
        let pct = match validate_move(old, candidate, &self.cfg.bounds, path) {
            Ok(p) => p,
            Err(rej) => {
                PRICE_UPDATES.with_label_values(&[path.as_str(), "rejected"]).inc();
                info!(market = %market.id, path = path.as_str(), old, candidate, %rej, "price move rejected");
                return Err(rej.into());
            }
        };
        PRICE_CHANGE_PCT.observe(pct);

        let at = Utc::now();
        let commit = PriceCommit {
            market_id: market.id.clone(),
            old_price: old,
            new_price: candidate,
            source: source.to_string(),
            at,
            event: NewEvent {
                event_type: EventType::PriceUpdate,
                market_id: Some(market.id.clone()),
                signature: None,
                payload: json!({
                    "old_price": old,
                    "new_price": candidate,
                    "change_pct": pct,
                    "source": source,
                    "path": path.as_str(),
                }),
                created_at: at,
            },
        };
        let event_id = match self.store.apply_price_update(&commit).await {
            Ok(id) => id,
            Err(e) => {
                PRICE_UPDATES.with_label_values(&[path.as_str(), "error"]).inc();
                return Err(e.into());
            }
        };
        PRICE_UPDATES.with_label_values(&[path.as_str(), "accepted"]).inc();
        info!(market = %market.id, path = path.as_str(), old, new = candidate, change_pct = pct, %source, "price committed");

        self.after_commit(market, bond_id.unwrap_or(&market.bond_id), old, candidate, pct, source).await;
        Ok(event_id)
    }

    async fn after_commit(&self, market: &Market, bond_id: &str, old: i64, new: i64, pct: f64, source: &str) {
        for prefix in [market_key(&market.id), bond_key(bond_id), MARKETS_LIST_KEY.to_string()] {
            if let Err(e) = self.cache.del_prefix(&prefix).await {
                warn!(%prefix, %e, "cache invalidation failed");
            }
        }

        let env = Envelope::new(
            "price_update",
            json!({
                "market_id": market.id,
                "bond_id": bond_id,
                "old_price": old,
                "new_price": new,
                "change_pct": pct,
                "source": source,
            }),
        );
        if let Err(e) = self.cache.publish(CH_PRICE_UPDATES, &env).await {
            warn!(market = %market.id, %e, "price notification not published");
        }

        let Some(exec) = &self.executor else { return };
        let gauge = ONCHAIN_PRICE_DIVERGENCE.with_label_values(&[market.id.as_str()]);
        match exec.update_price_onchain(market, new).await {
            Ok(sub) => {
                gauge.set(0);
                info!(market = %market.id, price = new, signature = %sub.signature, "on-chain price updated");
            }
            Err(e) => {
                // committed price stays; ledger lags until the next successful push
                gauge.set(1);
                error!(market = %market.id, price = new, %e, "on-chain price update failed, prices diverge");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{status_key, MemoryCache};
    use crate::gateway::MockSettlement;
    use crate::store::tests::market;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use proptest::prelude::*;

    struct FixedFeed(Vec<BondRecord>);

    #[async_trait]
    impl BondFeed for FixedFeed {
        async fn fetch_bonds(&self) -> Vec<BondRecord> { self.0.clone() }
    }

    fn cfg() -> PublisherCfg {
        PublisherCfg { bounds: PriceBounds::default(), status_ttl: Duration::from_secs(60), publish_fallback: false }
    }

    // Par bond: yield == coupon prices at face value.
    fn bond(id: &str, face: f64, source: PriceSource) -> BondRecord {
        BondRecord {
            bond_id: id.into(),
            name: format!("Bond {id}"),
            yield_pct: 5.0,
            coupon_pct: 5.0,
            maturity: Utc::now() + ChronoDuration::days(3 * 365),
            face_value: face,
            source,
        }
    }

    fn feed_src() -> PriceSource { PriceSource::Feed("acme".into()) }

    async fn publisher(bonds: Vec<BondRecord>, exec: Option<Arc<TradeExecutor>>) -> (Store, Arc<MemoryCache>, PricePublisher) {
        let store = Store::in_memory().unwrap();
        let cache = Arc::new(MemoryCache::default());
        let p = PricePublisher::new(store.clone(), Arc::new(FixedFeed(bonds)), cache.clone(), exec, cfg());
        (store, cache, p)
    }

    #[test]
    fn bounds_per_path() {
        let b = PriceBounds::default();
        assert!(validate_move(1_000_000, 1_050_000, &b, UpdatePath::Feed).is_ok());
        assert!(matches!(
            validate_move(1_000_000, 1_000_500, &b, UpdatePath::Feed),
            Err(PriceRejection::TooSmall { .. })
        ));
        assert!(validate_move(1_000_000, 1_000_500, &b, UpdatePath::Oracle).is_ok());
        assert!(matches!(
            validate_move(1_000_000, 1_000_000, &b, UpdatePath::Oracle),
            Err(PriceRejection::TooSmall { .. })
        ));
        assert!(matches!(
            validate_move(1_000_000, 1_150_000, &b, UpdatePath::Feed),
            Err(PriceRejection::TooLarge { .. })
        ));
        assert!(validate_move(1_000_000, 1_150_000, &b, UpdatePath::Oracle).is_ok());
        assert!(matches!(
            validate_move(1_000_000, 1_200_000, &b, UpdatePath::Oracle),
            Err(PriceRejection::TooLarge { .. })
        ));
        assert!(matches!(validate_move(0, 5, &b, UpdatePath::Oracle), Err(PriceRejection::NonPositive { .. })));
    }

    #[test]
    fn matches_by_id_then_name() {
        let bonds = vec![bond("B-9", 100.0, feed_src()), bond("XS123", 100.0, feed_src())];
        let mut m = market("m1", 1);
        m.bond_id = "b-9".into();
        assert_eq!(match_bond(&m, &bonds).unwrap().bond_id, "B-9");

        m.bond_id = "unknown".into();
        m.name = "Retail Bond XS123 Tranche A".into();
        assert_eq!(match_bond(&m, &bonds).unwrap().bond_id, "XS123");

        m.name = "nothing alike".into();
        assert!(match_bond(&m, &bonds).is_none());
    }

    #[tokio::test]
    async fn thirty_percent_feed_move_is_rejected_without_history() {
        // face 1.3 -> candidate 1_300_000 against current 1_000_000
        let (store, _, p) = publisher(vec![bond("BOND-m1", 1.3, feed_src())], None).await;
        store.upsert_market(&market("m1", 1_000_000)).await.unwrap();

        let stats = p.run_cycle().await.unwrap();
        assert_eq!(stats.rejected, 1);
        assert_eq!(store.market("m1").await.unwrap().unwrap().current_price, 1_000_000);
        assert!(store.price_history("m1").await.unwrap().is_empty());
        assert!(store.oracle_updates("m1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn accepted_move_commits_invalidates_and_notifies() {
        let (store, cache, p) = publisher(vec![bond("BOND-m1", 1.05, feed_src())], None).await;
        store.upsert_market(&market("m1", 1_000_000)).await.unwrap();
        cache.set(&market_key("m1"), "stale".into());
        cache.set(&bond_key("BOND-m1"), "stale".into());
        let mut rx = cache.subscribe(CH_PRICE_UPDATES);

        let stats = p.run_cycle().await.unwrap();
        assert_eq!(stats.accepted, 1);

        let price = store.market("m1").await.unwrap().unwrap().current_price;
        assert!((1_049_990..=1_050_000).contains(&price));
        let hist = store.price_history("m1").await.unwrap();
        assert_eq!(hist.len(), 1);
        assert_eq!(hist[0].source, "acme");
        assert_eq!(store.oracle_updates("m1").await.unwrap()[0].old_price, 1_000_000);
        assert_eq!(store.unprocessed_events(&[EventType::PriceUpdate], 10).await.unwrap().len(), 1);

        assert!(cache.get(&market_key("m1")).await.unwrap().is_none());
        assert!(cache.get(&bond_key("BOND-m1")).await.unwrap().is_none());
        let msg: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(msg["type"], "price_update");
        assert_eq!(msg["data"]["new_price"], price);

        let status: serde_json::Value =
            serde_json::from_str(&cache.get(&status_key(LOOP_NAME)).await.unwrap().unwrap()).unwrap();
        assert_eq!(status["status"], "ok");
        assert_eq!(status["counts"]["accepted"], 1);
    }

    #[tokio::test]
    async fn fallback_prices_are_never_committed_by_default() {
        let (store, _, p) = publisher(vec![bond("BOND-m1", 1.05, PriceSource::Fallback)], None).await;
        store.upsert_market(&market("m1", 1_000_000)).await.unwrap();

        let stats = p.run_cycle().await.unwrap();
        assert_eq!(stats.fallback_skipped, 1);
        assert!(store.price_history("m1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn oracle_path_accepts_fifteen_percent() {
        let (store, _, p) = publisher(vec![], None).await;
        store.upsert_market(&market("m1", 1_000_000)).await.unwrap();

        p.admin_update_price("m1", 1_150_000, PriceSource::Oracle).await.unwrap();
        assert_eq!(store.market("m1").await.unwrap().unwrap().current_price, 1_150_000);
        assert_eq!(store.price_history("m1").await.unwrap()[0].source, "oracle");

        let err = p.admin_update_price("m1", 1_500_000, PriceSource::Manual).await.unwrap_err();
        assert!(matches!(err, PublishError::Rejected(PriceRejection::TooLarge { .. })));
        assert!(matches!(
            p.admin_update_price("zz", 1, PriceSource::Manual).await,
            Err(PublishError::MarketNotFound(_))
        ));
    }

    #[tokio::test]
    async fn onchain_failure_keeps_committed_price() {
        let store = Store::in_memory().unwrap();
        store.upsert_market(&market("m1", 1_000_000)).await.unwrap();
        let cache = Arc::new(MemoryCache::default());
        let mock = Arc::new(MockSettlement::new(0));
        mock.unreachable();
        let exec = Arc::new(TradeExecutor::new(store.clone(), mock.clone(), cache.clone()));
        let p = PricePublisher::new(store.clone(), Arc::new(FixedFeed(vec![])), cache, Some(exec), cfg());

        p.admin_update_price("m1", 1_100_000, PriceSource::Oracle).await.unwrap();
        assert_eq!(store.market("m1").await.unwrap().unwrap().current_price, 1_100_000);
        assert_eq!(ONCHAIN_PRICE_DIVERGENCE.with_label_values(&["m1"]).get(), 1);

        mock.accept_all();
        p.admin_update_price("m1", 1_000_000, PriceSource::Oracle).await.unwrap();
        assert_eq!(ONCHAIN_PRICE_DIVERGENCE.with_label_values(&["m1"]).get(), 0);
        assert_eq!(mock.submitted().len(), 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn only_in_bound_moves_persist(current in 1i64..10_000_000_000, candidate in 1i64..10_000_000_000, oracle in any::<bool>()) {
            let path = if oracle { UpdatePath::Oracle } else { UpdatePath::Feed };
            let bounds = PriceBounds::default();
            let verdict = validate_move(current, candidate, &bounds, path);
            if let Ok(pct) = verdict {
                let max = if oracle { bounds.oracle_max_move_pct } else { bounds.feed_max_move_pct };
                prop_assert!(pct > 0.0 && pct < max);
            }

            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let persisted = rt.block_on(async {
                let (store, _, p) = publisher(vec![], None).await;
                store.upsert_market(&market("m1", current)).await.unwrap();
                let res = match path {
                    UpdatePath::Oracle => p.admin_update_price("m1", candidate, PriceSource::Oracle).await,
                    UpdatePath::Feed => {
                        let m = store.market("m1").await.unwrap().unwrap();
                        p.commit(&m, candidate, "acme", UpdatePath::Feed, None).await
                    }
                };
                let rows = store.price_history("m1").await.unwrap().len();
                let price = store.market("m1").await.unwrap().unwrap().current_price;
                (res.is_ok(), rows, price)
            });

            prop_assert_eq!(persisted.0, verdict.is_ok());
            if verdict.is_ok() {
                prop_assert_eq!(persisted.1, 1);
                prop_assert_eq!(persisted.2, candidate);
            } else {
                prop_assert_eq!(persisted.1, 0);
                prop_assert_eq!(persisted.2, current);
            }
        }
    }
}
