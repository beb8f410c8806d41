//! Configuration loading: optional TOML file, `EXCHANGE_*` environment
//! overrides (`.env` loaded via `dotenv`), and `clap`-parsed CLI flags.
//! Mirrors the teacher's `Config::from_env` style (`dotenv::dotenv().ok()`
//! then `env::var(...)` reads), generalized to also accept a TOML file and
//! CLI flags since this crate is a standalone server rather than a strategy
//! runner with hardcoded defaults.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;

#[derive(Debug, Parser)]
#[command(name = "exchange", about = "Virtual spot exchange with deterministic backtesting")]
pub struct Cli {
    /// Path to an optional TOML config file.
    #[arg(long, env = "EXCHANGE_CONFIG_PATH")]
    pub config: Option<PathBuf>,

    /// Address the REST/WS server listens on.
    #[arg(long, env = "EXCHANGE_LISTEN_ADDR")]
    pub listen_addr: Option<SocketAddr>,

    /// Run in backtest mode from process start.
    #[arg(long, env = "EXCHANGE_BACKTEST")]
    pub backtest: bool,

    /// Path to a CSV of OHLCV bars to replay on startup (implies `--backtest`).
    #[arg(long, env = "EXCHANGE_REPLAY_CSV")]
    pub replay_csv: Option<PathBuf>,

    /// Symbol the `--replay-csv` bars belong to.
    #[arg(long, env = "EXCHANGE_REPLAY_SYMBOL")]
    pub replay_symbol: Option<String>,
}

/// Replay sub-config: which pacing mode a replay run starts in and whether
/// callback dispatch batches across worker threads.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// One of `backtest`, `stepped`, `realtime`, `accelerated`.
    pub mode: String,
    pub speed_factor: f64,
    pub batch_callbacks: bool,
    pub memory_optimized: bool,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            mode: "backtest".to_string(),
            speed_factor: 1.0,
            batch_callbacks: false,
            memory_optimized: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub maker_fee_rate: Decimal,
    pub taker_fee_rate: Decimal,
    /// Request `timestamp` must satisfy `|now - timestamp| <= timestamp_skew_ms`.
    pub recv_window_ms: i64,
    pub snapshot_path: Option<PathBuf>,
    pub backtest_start_ms: i64,
    /// 0 means unlimited subscribers per symbol.
    pub max_clients_per_symbol: u32,
    pub recent_trades_capacity: usize,
    pub archive_retention_days: u32,
    pub depth_default_limit: usize,
    pub replay: ReplayConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".parse().unwrap(),
            maker_fee_rate: dec!(0.0010),
            taker_fee_rate: dec!(0.0010),
            recv_window_ms: 10_000,
            snapshot_path: None,
            backtest_start_ms: 0,
            max_clients_per_symbol: 0,
            recent_trades_capacity: 1_000,
            archive_retention_days: 90,
            depth_default_limit: 100,
            replay: ReplayConfig::default(),
        }
    }
}

impl Config {
    /// Load defaults, overlay an optional TOML file, then overlay CLI flags
    /// (which themselves fall back to `EXCHANGE_*` environment variables via
    /// `clap`'s `env` attribute, after `dotenv` has populated the process
    /// environment from `.env`).
    pub fn load(cli: &Cli) -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let mut config = match &cli.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                toml::from_str(&raw)?
            }
            None => Config::default(),
        };

        if let Some(addr) = cli.listen_addr {
            config.listen_addr = addr;
        }

        Ok(config)
    }
}
