//! Virtual spot exchange server entry point.
//!
//! Wires `Config::load`, constructs the `VirtualExchange`, registers the
//! configured symbols, and serves the REST/WS surface over axum. Mirrors
//! the teacher's `main.rs` bootstrap shape (`tracing_subscriber` init,
//! `dotenv`, `TcpListener::bind` + `axum::serve` with graceful shutdown on
//! `tokio::signal::ctrl_c`), generalized from its Polymarket scraper/signal
//! wiring to the exchange's account/matching/replay composition.

use std::sync::Arc;

use clap::Parser;
use rust_decimal_macros::dec;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use virtual_exchange::config::{Cli, Config};
use virtual_exchange::exchange::replay::{CsvKlineSource, ReplayController, ReplayMode};
use virtual_exchange::exchange::types::{LotFilter, PriceFilter, SymbolFilters, SymbolSpec};
use virtual_exchange::exchange::{ClockMode, VirtualExchange};
use virtual_exchange::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli)?;

    let mode = if cli.backtest || cli.replay_csv.is_some() { ClockMode::Backtest } else { ClockMode::Live };
    let exchange = VirtualExchange::new(mode, config.maker_fee_rate, config.taker_fee_rate)
        .with_archive_retention_days(config.archive_retention_days)
        .with_recent_trades_capacity(config.recent_trades_capacity);
    if mode == ClockMode::Backtest {
        exchange.clock.set_backtest_time(config.backtest_start_ms).expect("initial backtest time");
    }
    let exchange = Arc::new(exchange);

    let state = AppState::new(exchange.clone(), config.clone());
    state.register_symbol(default_symbol("BTCUSDT", "BTC", "USDT"));
    state.register_symbol(default_symbol("ETHUSDT", "ETH", "USDT"));

    let _replay_controller = match &cli.replay_csv {
        Some(path) => {
            let symbol = cli.replay_symbol.clone().unwrap_or_else(|| "BTCUSDT".to_string());
            let source = CsvKlineSource::open(path, symbol)?;
            let controller = Arc::new(ReplayController::new(exchange.clock.clone()));
            controller.add_source(Box::new(source));
            controller.set_mode(replay_mode_from_str(&config.replay.mode));
            controller.set_speed_factor(config.replay.speed_factor);
            controller.set_batch_callbacks(config.replay.batch_callbacks);
            controller.set_memory_optimized(config.replay.memory_optimized);
            exchange.attach_replay(&controller);
            controller.start();
            tracing::info!(?path, "replay started");
            Some(controller)
        }
        None => None,
    };

    let app = virtual_exchange::rest::routes::router(state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, "virtual exchange listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

fn replay_mode_from_str(mode: &str) -> ReplayMode {
    match mode {
        "stepped" => ReplayMode::Stepped,
        "realtime" => ReplayMode::Realtime,
        "accelerated" => ReplayMode::Accelerated,
        _ => ReplayMode::Backtest,
    }
}

fn default_symbol(symbol: &str, base: &str, quote: &str) -> SymbolSpec {
    SymbolSpec {
        symbol: symbol.to_string(),
        base_asset: base.to_string(),
        quote_asset: quote.to_string(),
        base_precision: 8,
        quote_precision: 8,
        filters: SymbolFilters {
            price: PriceFilter { min: dec!(0.01), max: dec!(1000000), tick: dec!(0.01) },
            lot: LotFilter { min: dec!(0.00001), max: dec!(9000), step: dec!(0.00001) },
            min_notional: dec!(10),
        },
    }
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.expect("install ctrl_c handler");
    tracing::info!("shutdown signal received");
}
