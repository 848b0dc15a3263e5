// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : bond_settle_core — settlement reconciliation & bond pricing core
Module  : config.rs
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
use std::env;
use std::str::FromStr;
use std::time::Duration;

use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use tracing::warn;
use url::Url;

use crate::domain::{PriceSource, Side};

/// Command-line overrides; everything else comes from the environment.
#[derive(Debug, Clone, Parser)]
#[command(name = "bond_settle_core", about = "Settlement reconciliation & bond price publishing")]
pub struct Cli {
    /// Run one reconciliation cycle and one publishing cycle, then exit
    #[arg(long)]
    pub once: bool,
    /// SQLite database path (overrides DB_PATH)
    #[arg(long)]
    pub db_path: Option<String>,
    /// Metrics/status port (overrides METRICS_PORT)
    #[arg(long)]
    pub metrics_port: Option<u16>,
    /// One-shot operator action instead of the service loops
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Submit a buy or sell; the trade stays pending until reconciled
    Trade {
        #[arg(long)]
        market: String,
        #[arg(long)]
        trader: String,
        #[arg(long, value_parser = parse_side)]
        side: Side,
        #[arg(long)]
        amount: u64,
        /// Buy: highest acceptable price, sell: lowest (1e6 scale)
        #[arg(long)]
        limit: Option<i64>,
    },
    /// Set a market price directly (oracle bound applies, 1e6 scale)
    SetPrice {
        #[arg(long)]
        market: String,
        #[arg(long)]
        price: i64,
        /// oracle | manual
        #[arg(long, default_value = "manual", value_parser = parse_admin_source)]
        source: PriceSource,
    },
    /// Pause trading on a market
    Pause {
        #[arg(long)]
        market: String,
    },
    /// Resume trading on a paused market
    Resume {
        #[arg(long)]
        market: String,
    },
}

fn parse_side(s: &str) -> Result<Side, String> {
    Side::parse(&s.to_ascii_lowercase()).ok_or_else(|| format!("side must be buy or sell, got {s:?}"))
}

fn parse_admin_source(s: &str) -> Result<PriceSource, String> {
    match s.to_ascii_lowercase().as_str() {
        "oracle" => Ok(PriceSource::Oracle),
        "manual" => Ok(PriceSource::Manual),
        other => Err(format!("source must be oracle or manual, got {other:?}")),
    }
}

/// Which ledger cluster we talk to
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LedgerMode {
    Demo,
    Devnet,
    Mainnet,
}

impl LedgerMode {
    fn parse(raw: &str) -> Option<LedgerMode> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "demo"    => Some(LedgerMode::Demo),
            "devnet"  => Some(LedgerMode::Devnet),
            "mainnet" => Some(LedgerMode::Mainnet),
            _ => None,
        }
    }

    pub fn default_rpc_url(&self) -> &'static str {
        match self {
            LedgerMode::Demo    => "http://127.0.0.1:8899",
            LedgerMode::Devnet  => "https://api.devnet.solana.com",
            LedgerMode::Mainnet => "https://api.mainnet-beta.solana.com",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerMode::Demo    => "demo",
            LedgerMode::Devnet  => "devnet",
            LedgerMode::Mainnet => "mainnet",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Args {
    // storage / observability
    pub db_path: String,
    pub metrics_port: u16,
    pub record_file: Option<String>,

    // ledger
    pub ledger_mode: LedgerMode,
    pub rpc_url: String,
    pub program_id: String,
    pub rpc_timeout: Duration,
    pub signature_limit: usize,
    pub demo_transactions: bool,

    // settlement relay (absent -> mock settlement)
    pub relay_url: Option<String>,
    pub relay_api_key: String,
    pub relay_api_secret: String,
    pub relay_timeout: Duration,

    // price feed
    pub feed_url: Option<String>,
    pub feed_api_key: Option<String>,
    pub feed_name: String,
    pub feed_timeout: Duration,

    // loops
    pub reconcile_interval: Duration,
    pub publish_interval: Duration,

    // publishing switches
    pub onchain_price_updates: bool,
    pub publish_fallback_prices: bool,
}

/// Thresholds for accepting a price move. The feed pipeline and the direct
/// admin/oracle entry point carry different ceilings; both are kept.
#[derive(Clone, Debug, PartialEq)]
pub struct PriceBounds {
    pub feed_min_move_pct: f64,
    pub feed_max_move_pct: f64,
    pub oracle_max_move_pct: f64,
}

impl Default for PriceBounds {
    fn default() -> Self {
        Self { feed_min_move_pct: 0.1, feed_max_move_pct: 10.0, oracle_max_move_pct: 20.0 }
    }
}

// slack on top of two loop periods before a status record may expire
const STATUS_GRACE: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct Limits {
    pub price: PriceBounds,
    pub batch_size: usize,
    pub stale_after: chrono::Duration,
    /// Floor for status record TTLs; see `status_ttl_for`.
    pub status_ttl: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            price: PriceBounds::default(),
            batch_size: 100,
            stale_after: chrono::Duration::seconds(3600),
            status_ttl: Duration::from_secs(120),
        }
    }
}

impl Limits {
    /// TTL for the status record of a loop ticking every `interval`. It must
    /// outlive the gap between two writes: one period plus a slow cycle.
    pub fn status_ttl_for(&self, interval: Duration) -> Duration {
        self.status_ttl.max(interval * 2 + STATUS_GRACE)
    }
}

/// Key lookup over some variable source (the process environment in `load`).
struct Vars<F>(F);

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn opt(&self, key: &str) -> Option<String> {
        (self.0)(key).map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> T {
        self.opt(key).and_then(|s| s.parse().ok()).unwrap_or(default)
    }

    fn flag(&self, key: &str, default: bool) -> bool {
        match self.opt(key).unwrap_or_default().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        }
    }

    fn ledger_mode(&self, key: &str, default_mode: LedgerMode) -> LedgerMode {
        match self.opt(key) {
            None => default_mode,
            Some(raw) => LedgerMode::parse(&raw).unwrap_or_else(|| {
                warn!(%key, %raw, default = default_mode.as_str(), "unknown ledger mode");
                default_mode
            }),
        }
    }
}

/// Drop URLs that do not parse so the client falls back instead of failing every call.
fn checked_url(key: &str, raw: Option<String>) -> Option<String> {
    let raw = raw?;
    match Url::parse(&raw) {
        Ok(_) => Some(raw),
        Err(e) => {
            warn!(%key, %raw, ?e, "ignoring malformed url");
            None
        }
    }
}

pub fn load(cli: &Cli) -> (Args, Limits) {
    // .env first so every key below sees it
    let _ = dotenv();
    load_from(cli, |key| env::var(key).ok())
}

fn load_from(cli: &Cli, get: impl Fn(&str) -> Option<String>) -> (Args, Limits) {
    let vars = Vars(get);

    // a real cluster unless demo is asked for; synthetic ledger data only
    // ever behind DEMO_TRANSACTIONS
    let ledger_mode = vars.ledger_mode("LEDGER_MODE", LedgerMode::Devnet);
    let rpc_url = checked_url("RPC_URL", vars.opt("RPC_URL"))
        .unwrap_or_else(|| ledger_mode.default_rpc_url().to_string());

    let args = Args {
        db_path: cli.db_path.clone().unwrap_or_else(|| vars.parse("DB_PATH", "bond_settle.db".to_string())),
        metrics_port: cli.metrics_port.unwrap_or_else(|| vars.parse("METRICS_PORT", 9898)),
        record_file: vars.opt("RECORD_FILE"),

        demo_transactions: vars.flag("DEMO_TRANSACTIONS", false),
        ledger_mode,
        rpc_url,
        program_id: vars.parse("PROGRAM_ID", "FPrNfqSjEL59H3PAEzXK9gU9VwAFXLrMwyFeNZ3dKb7o".to_string()),
        rpc_timeout: Duration::from_millis(vars.parse("RPC_TIMEOUT_MS", 8_000)),
        signature_limit: vars.parse("SIGNATURE_LIMIT", 50),

        relay_url: checked_url("RELAY_URL", vars.opt("RELAY_URL")),
        relay_api_key: vars.opt("RELAY_API_KEY").unwrap_or_default(),
        relay_api_secret: vars.opt("RELAY_API_SECRET").unwrap_or_default(),
        relay_timeout: Duration::from_millis(vars.parse("RELAY_TIMEOUT_MS", 15_000)),

        feed_url: checked_url("FEED_URL", vars.opt("FEED_URL")),
        feed_api_key: vars.opt("FEED_API_KEY"),
        feed_name: vars.parse("FEED_NAME", "bond_feed".to_string()),
        feed_timeout: Duration::from_millis(vars.parse("FEED_TIMEOUT_MS", 10_000)),

        reconcile_interval: Duration::from_secs(vars.parse("RECONCILE_INTERVAL_SECS", 30)),
        publish_interval: Duration::from_secs(vars.parse("PUBLISH_INTERVAL_SECS", 300)),

        onchain_price_updates: vars.flag("ONCHAIN_PRICE_UPDATES", false),
        publish_fallback_prices: vars.flag("PUBLISH_FALLBACK_PRICES", false),
    };

    let defaults = Limits::default();
    let limits = Limits {
        price: PriceBounds {
            feed_min_move_pct: vars.parse("FEED_MIN_MOVE_PCT", defaults.price.feed_min_move_pct),
            feed_max_move_pct: vars.parse("FEED_MAX_MOVE_PCT", defaults.price.feed_max_move_pct),
            oracle_max_move_pct: vars.parse("ORACLE_MAX_MOVE_PCT", defaults.price.oracle_max_move_pct),
        },
        batch_size: vars.parse("BATCH_SIZE", defaults.batch_size).max(1),
        stale_after: chrono::Duration::seconds(vars.parse("STALE_AFTER_SECS", 3600_i64)),
        status_ttl: Duration::from_secs(vars.parse("STATUS_TTL_SECS", defaults.status_ttl.as_secs())),
    };

    (args, limits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_bounds_keep_both_ceilings() {
        let b = PriceBounds::default();
        assert_eq!(b.feed_min_move_pct, 0.1);
        assert_eq!(b.feed_max_move_pct, 10.0);
        assert_eq!(b.oracle_max_move_pct, 20.0);
    }

    #[test]
    fn malformed_url_is_dropped() {
        assert_eq!(checked_url("X", Some("not a url".into())), None);
        assert_eq!(
            checked_url("X", Some("https://feed.example.com/v1".into())).as_deref(),
            Some("https://feed.example.com/v1")
        );
        assert_eq!(checked_url("X", None), None);
    }

    fn bare_cli() -> Cli {
        Cli::parse_from(["bond_settle_core"])
    }

    #[test]
    fn empty_environment_targets_a_real_cluster() {
        let (args, _) = load_from(&bare_cli(), |_| None);
        assert_eq!(args.ledger_mode, LedgerMode::Devnet);
        assert!(!args.demo_transactions);
        assert_eq!(args.rpc_url, LedgerMode::Devnet.default_rpc_url());
        assert!(args.relay_url.is_none());
    }

    #[test]
    fn demo_mode_alone_does_not_enable_synthetic_transactions() {
        let (args, _) = load_from(&bare_cli(), |k| (k == "LEDGER_MODE").then(|| "demo".to_string()));
        assert_eq!(args.ledger_mode, LedgerMode::Demo);
        assert!(!args.demo_transactions);

        let (args, _) = load_from(&bare_cli(), |k| match k {
            "LEDGER_MODE" => Some("Demo".into()),
            "DEMO_TRANSACTIONS" => Some("on".into()),
            _ => None,
        });
        assert!(args.demo_transactions);

        let (args, _) = load_from(&bare_cli(), |k| (k == "LEDGER_MODE").then(|| "testnet".to_string()));
        assert_eq!(args.ledger_mode, LedgerMode::Devnet);
    }

    #[test]
    fn status_records_outlive_their_loop_period() {
        let (args, limits) = load_from(&bare_cli(), |_| None);
        for interval in [args.reconcile_interval, args.publish_interval] {
            let ttl = limits.status_ttl_for(interval);
            assert!(ttl > interval + args.feed_timeout, "ttl {ttl:?} vs interval {interval:?}");
        }

        // an explicit floor above the derived value wins
        let (_, limits) = load_from(&bare_cli(), |k| (k == "STATUS_TTL_SECS").then(|| "3600".to_string()));
        assert_eq!(limits.status_ttl_for(Duration::from_secs(30)), Duration::from_secs(3600));
    }

    #[test]
    fn cli_parses_operator_commands() {
        let cli = Cli::parse_from([
            "bond_settle_core", "trade", "--market", "m1", "--trader", "alice", "--side", "SELL", "--amount", "5",
        ]);
        assert!(matches!(
            cli.command,
            Some(Command::Trade { ref market, side: Side::Sell, amount: 5, limit: None, .. }) if market == "m1"
        ));

        let cli = Cli::parse_from(["bond_settle_core", "set-price", "--market", "m1", "--price", "1010000"]);
        assert!(matches!(cli.command, Some(Command::SetPrice { price: 1_010_000, source: PriceSource::Manual, .. })));

        assert!(Cli::try_parse_from(["bond_settle_core", "set-price", "--market", "m1", "--price", "1", "--source", "fallback"]).is_err());
        assert!(Cli::try_parse_from(["bond_settle_core", "trade", "--market", "m1", "--trader", "a", "--side", "hold", "--amount", "1"]).is_err());
        assert!(matches!(Cli::parse_from(["bond_settle_core", "pause", "--market", "m1"]).command, Some(Command::Pause { .. })));
    }

    #[test]
    fn cli_parses_once_flag() {
        let cli = Cli::parse_from(["bond_settle_core", "--once", "--metrics-port", "9100"]);
        assert!(cli.once);
        assert_eq!(cli.metrics_port, Some(9100));
        assert!(cli.db_path.is_none());
    }
}
