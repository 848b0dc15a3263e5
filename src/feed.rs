// ===============================
// src/feed.rs
// ===============================
//
// External bond price feed:
// - FeedClient       : one HTTP GET, nested JSON walked for bond records
// - fallback_bonds() : fixed set tagged `fallback`, used when the feed is
//                      unconfigured or failing so the pipeline stays exercisable
//
// Fallback records are never mistaken for live data: they carry
// PriceSource::Fallback and are counted separately in FEED_FETCHES.
//
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::{BondRecord, PriceSource};
use crate::metrics::FEED_FETCHES;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("feed not configured")]
    NotConfigured,
    #[error("feed transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("feed http status {0}")]
    Status(u16),
    #[error("feed payload: {0}")]
    Payload(String),
}

#[async_trait]
pub trait BondFeed: Send + Sync {
    /// Live records when available, the tagged fallback set otherwise.
    async fn fetch_bonds(&self) -> Vec<BondRecord>;
}

pub struct FeedClient {
    http: reqwest::Client,
    url: Option<String>,
    api_key: Option<String>,
    name: String,
}

impl FeedClient {
    pub fn new(url: Option<String>, api_key: Option<String>, name: String, timeout: Duration) -> Result<Self, FeedError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, url, api_key, name })
    }

    fn request_url(&self) -> Result<String, FeedError> {
        let base = self.url.as_deref().ok_or(FeedError::NotConfigured)?;
        Ok(match &self.api_key {
            Some(k) => {
                let sep = if base.contains('?') { '&' } else { '?' };
                format!("{base}{sep}api_key={}", urlencoding::encode(k))
            }
            None => base.to_string(),
        })
    }

    pub async fn fetch_live(&self) -> Result<Vec<BondRecord>, FeedError> {
        let url = self.request_url()?;
        let rsp = self.http.get(&url).send().await?;
        if !rsp.status().is_success() {
            return Err(FeedError::Status(rsp.status().as_u16()));
        }
        let body: Value = rsp.json().await?;
        let bonds = parse_bonds(&body, &PriceSource::Feed(self.name.clone()));
        if bonds.is_empty() {
            return Err(FeedError::Payload("no bond records found".into()));
        }
        Ok(bonds)
    }
}

#[async_trait]
impl BondFeed for FeedClient {
    async fn fetch_bonds(&self) -> Vec<BondRecord> {
        match self.fetch_live().await {
            Ok(bonds) => {
                FEED_FETCHES.with_label_values(&["live"]).inc();
                info!(feed = %self.name, count = bonds.len(), "feed fetched");
                bonds
            }
            Err(FeedError::NotConfigured) => {
                FEED_FETCHES.with_label_values(&["fallback"]).inc();
                debug!("no feed configured, using fallback bonds");
                fallback_bonds()
            }
            Err(e) => {
                FEED_FETCHES.with_label_values(&["fallback"]).inc();
                warn!(feed = %self.name, %e, "feed failed, using fallback bonds");
                fallback_bonds()
            }
        }
    }
}

// ---- payload walking ----

const LIST_KEYS: [&str; 4] = ["data", "bonds", "results", "items"];

/// First array found at the top level or under one of the list keys
/// (searched depth-first, so `{"data":{"bonds":[...]}}` works).
fn find_list(v: &Value) -> Option<&Vec<Value>> {
    if let Some(arr) = v.as_array() {
        return Some(arr);
    }
    let obj = v.as_object()?;
    LIST_KEYS.iter().filter_map(|k| obj.get(*k)).find_map(find_list)
}

fn field<'a>(obj: &'a serde_json::Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| obj.get(*k).filter(|v| !v.is_null()))
}

fn num(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches('%').parse().ok(),
        _ => None,
    }
    .filter(|x: &f64| x.is_finite())
}

fn text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn date(v: &Value) -> Option<DateTime<Utc>> {
    let s = v.as_str()?.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    let d = NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()?;
    Utc.from_local_datetime(&d.and_hms_opt(0, 0, 0)?).single()
}

fn parse_record(v: &Value, source: &PriceSource) -> Option<BondRecord> {
    let obj = v.as_object()?;
    let bond_id = field(obj, &["isin", "bond_id", "id", "symbol"]).and_then(text)?;
    let name = field(obj, &["name", "description", "title"]).and_then(text).unwrap_or_else(|| bond_id.clone());
    let yield_pct = field(obj, &["yield", "yield_pct", "ytm"]).and_then(num)?;
    let coupon_pct = field(obj, &["coupon", "coupon_rate", "coupon_pct"]).and_then(num)?;
    let maturity = field(obj, &["maturity", "maturity_date"]).and_then(date)?;
    let Some(face_value) = field(obj, &["face_value", "par", "par_value"]).and_then(num).filter(|f| *f > 0.0) else {
        warn!(bond = %bond_id, "feed record without a usable face value, skipped");
        return None;
    };
    Some(BondRecord { bond_id, name, yield_pct, coupon_pct, maturity, face_value, source: source.clone() })
}

/// Extract every well-formed record; malformed entries are skipped.
pub fn parse_bonds(body: &Value, source: &PriceSource) -> Vec<BondRecord> {
    let Some(list) = find_list(body) else {
        return Vec::new();
    };
    let out: Vec<BondRecord> = list.iter().filter_map(|v| parse_record(v, source)).collect();
    if out.len() < list.len() {
        debug!(skipped = list.len() - out.len(), "feed entries without usable fields");
    }
    out
}

fn ymd(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).single().unwrap_or_default()
}

/// Canned records; every one is tagged `fallback`.
pub fn fallback_bonds() -> Vec<BondRecord> {
    [
        ("IN0020230085", "GOI 7.18% 2033", 7.12, 7.18, ymd(2033, 8, 14), 100.0),
        ("IN0020220060", "GOI 7.26% 2032", 7.05, 7.26, ymd(2032, 8, 22), 100.0),
        ("IN0020190016", "GOI 6.45% 2029", 6.88, 6.45, ymd(2029, 10, 7), 100.0),
    ]
    .into_iter()
    .map(|(id, name, y, c, maturity, face)| BondRecord {
        bond_id: id.to_string(),
        name: name.to_string(),
        yield_pct: y,
        coupon_pct: c,
        maturity,
        face_value: face,
        source: PriceSource::Fallback,
    })
    .collect()
}
