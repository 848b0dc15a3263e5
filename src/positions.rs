// ===============================
// src/positions.rs (holdings & cost basis)
// ===============================
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::domain::{Position, Side, Trade, PRICE_SCALE};

/// Fold one confirmed trade into the trader's holding.
///
/// Buys move the volume-weighted average cost; sells release cost basis at
/// the current average. Returns `None` when the holding is flat and the row
/// should be removed.
pub fn apply_fill(prev: Option<&Position>, trade: &Trade, at: DateTime<Utc>) -> Option<Position> {
    let (qty, avg, basis) = prev.map(|p| (p.quantity, p.avg_cost, p.cost_basis)).unwrap_or((0, 0, 0));
    let fill = trade.amount.max(0);

    let (new_qty, new_avg, new_basis) = match trade.side {
        Side::Buy => {
            let q = qty + fill;
            // weighted average, computed wide to avoid overflow on large holdings
            let a = if q == 0 {
                0
            } else {
                ((avg as i128 * qty as i128 + trade.price as i128 * fill as i128) / q as i128) as i64
            };
            (q, a, basis + trade.total_value)
        }
        Side::Sell => {
            if fill > qty {
                warn!(trader = %trade.trader, market = %trade.market_id, held = qty, sold = fill,
                      "sell exceeds recorded holding, clamping");
            }
            let closed = fill.min(qty);
            let q = qty - closed;
            let b = if qty == 0 { 0 } else { (basis as i128 * q as i128 / qty as i128) as i64 };
            (q, if q == 0 { 0 } else { avg }, b)
        }
    };

    if new_qty <= 0 {
        return None;
    }
    Some(Position {
        trader: trade.trader.clone(),
        market_id: trade.market_id.clone(),
        quantity: new_qty,
        avg_cost: new_avg,
        cost_basis: new_basis,
        updated_at: at,
    })
}

/// Scaled notional: floor(amount * price / PRICE_SCALE), None on overflow.
pub fn total_value(amount: i64, price: i64) -> Option<i64> {
    let v = (amount as i128).checked_mul(price as i128)? / PRICE_SCALE as i128;
    i64::try_from(v).ok()
}
