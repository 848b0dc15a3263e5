// ===============================
// src/valuation.rs
// ===============================
//
// Simplified bond fair value: annual-compounding discounted cash flow.
// Known approximation: no day-count convention, no accrued interest, coupon
// paid once a year. Prices are returned on the PRICE_SCALE fixed-point grid.
//
use chrono::{DateTime, Utc};

use crate::domain::{BondRecord, PRICE_SCALE};

const MS_PER_YEAR: f64 = 365.25 * 86_400_000.0;

pub fn years_to_maturity(maturity: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    (maturity - now).num_milliseconds() as f64 / MS_PER_YEAR
}

fn scale(v: f64) -> i64 {
    (v * PRICE_SCALE as f64).floor() as i64
}

/// Present value of the remaining coupons plus principal, scaled.
///
/// Matured bonds (maturity <= now) price at par. Any arithmetic failure
/// (zero yield, non-finite or non-positive result) also falls back to par.
pub fn fair_price(
    yield_pct: f64,
    coupon_pct: f64,
    maturity: DateTime<Utc>,
    face_value: f64,
    now: DateTime<Utc>,
) -> i64 {
    let par = scale(face_value);
    let n = years_to_maturity(maturity, now);
    if n <= 0.0 {
        return par;
    }

    let r = yield_pct / 100.0;
    let c = coupon_pct / 100.0 * face_value;
    if r == 0.0 || !r.is_finite() || !c.is_finite() {
        return par;
    }

    let discount = (1.0 + r).powf(n);
    let price = c * (1.0 - 1.0 / discount) / r + face_value / discount;
    if !price.is_finite() || price <= 0.0 {
        return par;
    }
    scale(price)
}

pub fn value_bond(bond: &BondRecord, now: DateTime<Utc>) -> i64 {
    fair_price(bond.yield_pct, bond.coupon_pct, bond.maturity, bond.face_value, now)
}
