// ===============================
// src/main.rs
// ===============================
/*
 # health & activity
curl -s localhost:9898/status | jq
curl -s localhost:9898/metrics | egrep '^(recon_|price_updates_total|onchain_)'

 # one pass of each loop against a local validator
LEDGER_MODE=devnet RPC_URL=http://127.0.0.1:8899 cargo run -- --once

 # operator actions
cargo run -- trade --market mkt-in0020230085 --trader alice --side buy --amount 10 --limit 1010000
cargo run -- set-price --market mkt-in0020230085 --price 1002000 --source oracle
cargo run -- pause --market mkt-in0020230085
*/
/*
=============================================================================
Project : bond_settle_core — settlement reconciliation & bond pricing core
Module  : main.rs
Version : 0.1.0
Author  : Kukuh Tripamungkas Wicaksono (Kukuh TW)
Email   : kukuhtw@gmail.com
WhatsApp: https://wa.me/628129893706
LinkedIn: https://id.linkedin.com/in/kukuhtw
License : MIT (see LICENSE)

Summary : Reconciles off-chain trades/positions against on-chain settlement
          of the bond market program, prices bonds from an external feed
          with a DCF model, publishes bounded price updates, exposes
          Prometheus metrics + loop status, and records JSONL notifications.

(c) 2025 Kukuh TW. All rights reserved where applicable.
=============================================================================
*/
use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use bond_settle_core::{config, metrics, publisher, reconciler, recorder, scheduler, valuation};
use bond_settle_core::cache::{CacheBus, MemoryCache};
use bond_settle_core::config::{Cli, Command, LedgerMode};
use bond_settle_core::domain::{Market, TradeStatus, CH_MARKET_STATUS, CH_PRICE_UPDATES, CH_TRADES};
use bond_settle_core::executor::{TradeExecutor, TradeRequest};
use bond_settle_core::feed::{fallback_bonds, FeedClient};
use bond_settle_core::gateway::{MockSettlement, RelaySettlement, SettlementProgram};
use bond_settle_core::ledger::{DemoLedger, RpcLedger, TransactionSource};
use bond_settle_core::publisher::{PricePublisher, PublisherCfg};
use bond_settle_core::reconciler::{Reconciler, ReconcilerCfg};
use bond_settle_core::store::Store;

/// Seed one market per canned bond when a demo store is empty, slightly
/// below fair value so the first publishing pass has a move to make.
async fn seed_demo_markets(store: &Store, exec: &TradeExecutor) {
    match store.markets().await {
        Ok(m) if !m.is_empty() => return,
        Ok(_) => {}
        Err(e) => {
            error!(%e, "demo seeding: cannot list markets");
            return;
        }
    }
    let now = Utc::now();
    for bond in fallback_bonds() {
        let fair = valuation::value_bond(&bond, now);
        let market = Market {
            id: format!("mkt-{}", bond.bond_id.to_ascii_lowercase()),
            bond_id: bond.bond_id.clone(),
            name: bond.name.clone(),
            current_price: fair - fair / 50,
            paused: false,
            active: true,
            program_market: None,
            vault_bond: None,
            vault_usdc: None,
            admin: None,
            updated_at: now,
        };
        if let Err(e) = exec.initialize_market(market).await {
            warn!(bond = %bond.bond_id, %e, "demo seeding: market not initialized");
        }
    }
}

/// One operator action; prints the result as JSON. Returns false on failure.
async fn run_command(cmd: Command, exec: &TradeExecutor, publisher: &PricePublisher) -> bool {
    let res: Result<Value, String> = match cmd {
        Command::Trade { market, trader, side, amount, limit } => {
            let req = TradeRequest { market_id: market, trader, side, amount, price_limit: limit };
            exec.execute(&req).await.map(|r| json!(r)).map_err(|e| format!("{} ({})", e, e.label()))
        }
        Command::SetPrice { market, price, source } => publisher
            .admin_update_price(&market, price, source)
            .await
            .map(|event_id| json!({ "market_id": market, "price": price, "event_id": event_id }))
            .map_err(|e| e.to_string()),
        Command::Pause { market } => set_paused(exec, market, true).await,
        Command::Resume { market } => set_paused(exec, market, false).await,
    };
    match res {
        Ok(v) => {
            println!("{v}");
            true
        }
        Err(e) => {
            error!(%e, "command failed");
            false
        }
    }
}

async fn set_paused(exec: &TradeExecutor, market: String, paused: bool) -> Result<Value, String> {
    let sub = exec.set_paused(&market, paused).await.map_err(|e| e.to_string())?;
    Ok(json!({
        "market_id": market,
        "paused": paused,
        "changed": sub.is_some(),
        "signature": sub.map(|s| s.signature),
    }))
}

#[tokio::main]
async fn main() {
    // ---- Logging ----
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ---- Config ----
    let cli = Cli::parse();
    let (args, limits) = config::load(&cli);

    // ---- Metrics + config visibility ----
    metrics::init();
    metrics::CONFIG_LEDGER_MODE.with_label_values(&[args.ledger_mode.as_str()]).set(1);
    for (name, on) in [
        ("demo_transactions", args.demo_transactions),
        ("relay_settlement", args.relay_url.is_some()),
        ("onchain_price_updates", args.onchain_price_updates),
        ("publish_fallback_prices", args.publish_fallback_prices),
    ] {
        metrics::CONFIG_SWITCH.with_label_values(&[name]).set(on as i64);
    }

    info!(
        ledger_mode = args.ledger_mode.as_str(),
        rpc = %args.rpc_url,
        program = %args.program_id,
        demo_transactions = args.demo_transactions,
        relay = ?args.relay_url,
        feed = ?args.feed_url,
        db = %args.db_path,
        reconcile_every_s = args.reconcile_interval.as_secs(),
        publish_every_s = args.publish_interval.as_secs(),
        feed_bounds = ?(limits.price.feed_min_move_pct, limits.price.feed_max_move_pct),
        oracle_max_move_pct = limits.price.oracle_max_move_pct,
        "startup config"
    );

    // ---- Cache / pub-sub + status endpoint ----
    let memory_cache = Arc::new(MemoryCache::default());
    let cache: Arc<dyn CacheBus> = memory_cache.clone();
    if cli.command.is_none() {
        tokio::spawn(metrics::serve(args.metrics_port, cache.clone()));
    }

    // ---- Recorder (optional) ----
    if let Some(path) = args.record_file.clone() {
        let (rec_tx, rec_rx) = mpsc::channel::<recorder::Record>(8192);
        tokio::spawn(recorder::run(rec_rx, path));
        for ch in [CH_PRICE_UPDATES, CH_TRADES, CH_MARKET_STATUS] {
            tokio::spawn(recorder::forward(ch, memory_cache.subscribe(ch), rec_tx.clone()));
        }
    }

    // ---- Store ----
    let store = match Store::open(&args.db_path) {
        Ok(s) => s,
        Err(e) => {
            error!(%e, path = %args.db_path, "cannot open store");
            return;
        }
    };
    match store.trades_with_status(TradeStatus::Pending).await {
        Ok(p) if !p.is_empty() => info!(pending = p.len(), "trades awaiting ledger confirmation"),
        Ok(_) => {}
        Err(e) => warn!(%e, "cannot count pending trades"),
    }

    // ---- Ledger ----
    let ledger: Arc<dyn TransactionSource> = if args.demo_transactions {
        warn!("DEMO_TRANSACTIONS on: reconciling against synthetic ledger activity");
        Arc::new(DemoLedger::default())
    } else {
        match RpcLedger::new(args.rpc_url.clone(), args.rpc_timeout) {
            Ok(l) => Arc::new(l),
            Err(e) => {
                error!(%e, "cannot build rpc client");
                return;
            }
        }
    };

    // ---- Settlement program ----
    let program: Arc<dyn SettlementProgram> = match &args.relay_url {
        Some(url) => Arc::new(RelaySettlement::new(
            url.clone(),
            args.relay_api_key.clone(),
            args.relay_api_secret.clone(),
            args.relay_timeout,
        )),
        None => {
            if args.ledger_mode != LedgerMode::Demo {
                warn!(mode = args.ledger_mode.as_str(), "no RELAY_URL: submissions go to the mock settlement program");
            }
            Arc::new(MockSettlement::new(250))
        }
    };
    let executor = Arc::new(TradeExecutor::new(store.clone(), program, cache.clone()));

    if args.ledger_mode == LedgerMode::Demo {
        seed_demo_markets(&store, &executor).await;
    }

    // ---- Feed ----
    let feed = match FeedClient::new(args.feed_url.clone(), args.feed_api_key.clone(), args.feed_name.clone(), args.feed_timeout) {
        Ok(f) => Arc::new(f),
        Err(e) => {
            error!(%e, "cannot build feed client");
            return;
        }
    };

    // ---- Reconciler + publisher ----
    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        ledger,
        cache.clone(),
        ReconcilerCfg {
            program_id: args.program_id.clone(),
            batch_size: limits.batch_size,
            fetch_limit: args.signature_limit,
            stale_after: limits.stale_after,
            status_ttl: limits.status_ttl_for(args.reconcile_interval),
        },
    ));
    let publisher = Arc::new(PricePublisher::new(
        store.clone(),
        feed,
        cache.clone(),
        args.onchain_price_updates.then(|| executor.clone()),
        PublisherCfg {
            bounds: limits.price.clone(),
            status_ttl: limits.status_ttl_for(args.publish_interval),
            publish_fallback: args.publish_fallback_prices,
        },
    ));

    if let Some(cmd) = cli.command.clone() {
        if !run_command(cmd, &executor, &publisher).await {
            std::process::exit(1);
        }
        return;
    }

    if cli.once {
        // outcomes are logged and written to the status keys
        let _ = reconciler.run_cycle().await;
        if let Err(e) = publisher.run_cycle().await {
            error!(%e, "publisher cycle failed");
        }
        return;
    }

    let loops = [
        scheduler::spawn_loop(reconciler::LOOP_NAME, args.reconcile_interval, {
            let reconciler = reconciler.clone();
            move || {
                let reconciler = reconciler.clone();
                async move {
                    let _ = reconciler.run_cycle().await;
                }
            }
        }),
        scheduler::spawn_loop(publisher::LOOP_NAME, args.publish_interval, {
            let publisher = publisher.clone();
            move || {
                let publisher = publisher.clone();
                async move {
                    if let Err(e) = publisher.run_cycle().await {
                        error!(%e, "publisher cycle failed");
                    }
                }
            }
        }),
    ];

    // ---- Run until Ctrl-C ----
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(?e, "ctrl_c listener failed, shutting down");
    }
    info!("shutdown requested");
    let [recon_loop, publish_loop] = loops;
    // settle whatever the ledger already confirmed before going down
    if recon_loop.run_now().await {
        info!("final reconciliation pass done");
    }
    for l in [recon_loop, publish_loop] {
        if l.is_running() {
            info!(loop_name = l.name(), "waiting for in-flight cycle");
        }
        l.stop().await;
    }
    info!("bye");
}
