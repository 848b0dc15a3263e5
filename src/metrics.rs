// ===============================
// src/metrics.rs
// ===============================
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{header, Body, Request, Response, Server, StatusCode};
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry, TextEncoder,
};
use tracing::{error, info};

use crate::cache::{status_key, CacheBus};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Reconciliation --------
pub static RECON_CYCLES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("recon_cycles_total", "reconciliation cycles (label: result)"),
        &["result"],
    )
    .unwrap()
});

pub static RECON_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("recon_events_total", "system events by reconciliation outcome"),
        &["outcome"],
    )
    .unwrap()
});

// Liveness trade-off: events given up on without a ledger match
pub static RECON_STALE_UNMATCHED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("recon_stale_unmatched_total", "events marked processed without a match").unwrap()
});

pub static RECON_SYNTHESIZED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("recon_synthesized_events_total", "events synthesized for unknown on-chain activity").unwrap()
});

pub static RECON_TX_CHECKED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("recon_transactions_checked_total", "ledger transactions examined").unwrap());

pub static RECON_LAST_SLOT: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("recon_last_slot", "highest ledger slot seen").unwrap());

pub static LEDGER_RPC_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("ledger_rpc_errors_total", "ledger rpc failures"), &["call"]).unwrap()
});

pub static MALFORMED_ROWS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("store_malformed_rows_total", "rows skipped as malformed"), &["table"]).unwrap()
});

// -------- Pricing --------
pub static FEED_FETCHES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("feed_fetches_total", "price feed fetches (label: source = live|fallback)"),
        &["source"],
    )
    .unwrap()
});

pub static PRICE_UPDATES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("price_updates_total", "price update attempts (labels: path, result)"),
        &["path", "result"],
    )
    .unwrap()
});

pub static PRICE_CHANGE_PCT: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(
        HistogramOpts::new("price_change_pct", "absolute candidate move in percent")
            .buckets(vec![0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 50.0]),
    )
    .unwrap()
});

// 1 while the committed price has not reached the ledger
pub static ONCHAIN_PRICE_DIVERGENCE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("onchain_price_divergence", "1 if on-chain price lags the committed price"),
        &["market"],
    )
    .unwrap()
});

// -------- Settlement / trading --------
pub static ONCHAIN_SUBMITS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("onchain_submits_total", "settlement instructions (labels: instruction, result)"),
        &["instruction", "result"],
    )
    .unwrap()
});

pub static TRADES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("trades_total", "trade attempts (labels: side, result)"), &["side", "result"])
        .unwrap()
});

// -------- Loops --------
pub static CYCLE_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(HistogramOpts::new("loop_cycle_seconds", "loop cycle duration"), &["loop"]).unwrap()
});

pub static CYCLES_SKIPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("loop_cycles_skipped_total", "ticks skipped because a cycle was in flight"),
        &["loop"],
    )
    .unwrap()
});

// ---- Config visibility ----
pub static CONFIG_LEDGER_MODE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("config_ledger_mode", "ledger mode (label: mode)"), &["mode"]).unwrap()
});

pub static CONFIG_SWITCH: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("config_switch", "boolean switches (label: name)"), &["name"]).unwrap()
});

pub fn init() {
    for m in [
        REGISTRY.register(Box::new(RECON_CYCLES.clone())),
        REGISTRY.register(Box::new(RECON_EVENTS.clone())),
        REGISTRY.register(Box::new(RECON_STALE_UNMATCHED.clone())),
        REGISTRY.register(Box::new(RECON_SYNTHESIZED.clone())),
        REGISTRY.register(Box::new(RECON_TX_CHECKED.clone())),
        REGISTRY.register(Box::new(RECON_LAST_SLOT.clone())),
        REGISTRY.register(Box::new(LEDGER_RPC_ERRORS.clone())),
        REGISTRY.register(Box::new(MALFORMED_ROWS.clone())),
        REGISTRY.register(Box::new(FEED_FETCHES.clone())),
        REGISTRY.register(Box::new(PRICE_UPDATES.clone())),
        REGISTRY.register(Box::new(PRICE_CHANGE_PCT.clone())),
        REGISTRY.register(Box::new(ONCHAIN_PRICE_DIVERGENCE.clone())),
        REGISTRY.register(Box::new(ONCHAIN_SUBMITS.clone())),
        REGISTRY.register(Box::new(TRADES.clone())),
        REGISTRY.register(Box::new(CYCLE_SECONDS.clone())),
        REGISTRY.register(Box::new(CYCLES_SKIPPED.clone())),
        REGISTRY.register(Box::new(CONFIG_LEDGER_MODE.clone())),
        REGISTRY.register(Box::new(CONFIG_SWITCH.clone())),
    ] {
        if let Err(e) = m {
            error!(?e, "metric registration failed");
        }
    }
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

pub const STATUS_LOOPS: [&str; 2] = ["reconciler", "publisher"];

/// `{loop: status|null}`; healthy only when every loop has a fresh record.
async fn status_body(cache: &dyn CacheBus) -> (StatusCode, String) {
    let mut out = serde_json::Map::new();
    let mut healthy = true;
    for name in STATUS_LOOPS {
        let v = match cache.get(&status_key(name)).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or(serde_json::Value::Null),
            _ => serde_json::Value::Null,
        };
        if v.is_null() || v["status"] != "ok" {
            healthy = false;
        }
        out.insert(name.to_string(), v);
    }
    let code = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (code, serde_json::Value::Object(out).to_string())
}

async fn handle(req: Request<Body>, cache: Arc<dyn CacheBus>) -> Result<Response<Body>, Infallible> {
    let rsp = match req.uri().path() {
        "/" | "/metrics" => Response::builder()
            .header(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")
            .body(Body::from(encode_metrics())),
        "/status" => {
            let (code, body) = status_body(cache.as_ref()).await;
            Response::builder()
                .status(code)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body))
        }
        _ => Response::builder().status(StatusCode::NOT_FOUND).body(Body::empty()),
    };
    Ok(rsp.unwrap_or_else(|_| Response::new(Body::empty())))
}

/// Serve `/metrics` and `/status` until the task is dropped.
pub async fn serve(port: u16, cache: Arc<dyn CacheBus>) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let make_svc = make_service_fn(move |_conn| {
        let cache = cache.clone();
        async move { Ok::<_, Infallible>(service_fn(move |req| handle(req, cache.clone()))) }
    });
    let server = match Server::try_bind(&addr) {
        Ok(b) => b.serve(make_svc),
        Err(e) => {
            error!(?e, %addr, "metrics bind failed");
            return;
        }
    };
    info!(%addr, "metrics listening on /metrics and /status");
    if let Err(e) = server.await {
        error!(?e, "metrics server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use std::time::Duration;

    #[tokio::test]
    async fn status_is_unhealthy_until_both_loops_report() {
        let cache = MemoryCache::default();
        let (code, body) = status_body(&cache).await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body.contains("\"reconciler\":null"));

        let ok = r#"{"status":"ok","last_run":"2026-01-01T00:00:00Z","counts":{},"error":null}"#;
        for name in STATUS_LOOPS {
            cache.set_ex(&status_key(name), ok.into(), Duration::from_secs(60)).await.unwrap();
        }
        let (code, _) = status_body(&cache).await;
        assert_eq!(code, StatusCode::OK);
    }
}
