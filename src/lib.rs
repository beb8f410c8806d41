//! Virtual spot exchange: deterministic matching engine, account manager,
//! virtual time manager, and replay controller, fronted by a Binance Spot
//! v3-compatible REST/WS surface.

pub mod config;
pub mod errors;
pub mod exchange;
pub mod rest;
pub mod ws;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;

use config::Config;
use exchange::facade::{MarketEvent, UserEvent};
use exchange::types::SymbolSpec;
use exchange::VirtualExchange;

/// Shared application state handed to every axum handler via `State<AppState>`.
#[derive(Clone)]
pub struct AppState {
    pub exchange: Arc<VirtualExchange>,
    pub symbol_specs: Arc<RwLock<HashMap<String, SymbolSpec>>>,
    pub config: Arc<Config>,
    pub market_broadcast: broadcast::Sender<MarketEvent>,
    pub user_broadcast: broadcast::Sender<(u64, UserEvent)>,
    /// Live WS subscriber count per symbol, enforcing `max_clients_per_symbol`.
    pub symbol_subscriber_counts: Arc<RwLock<HashMap<String, u32>>>,
}

impl AppState {
    pub fn new(exchange: Arc<VirtualExchange>, config: Config) -> Self {
        let (market_broadcast, _) = broadcast::channel(4096);
        let (user_broadcast, _) = broadcast::channel(4096);
        ws::server::bridge_exchange_events(&exchange, market_broadcast.clone(), user_broadcast.clone());
        Self {
            exchange,
            symbol_specs: Arc::new(RwLock::new(HashMap::new())),
            config: Arc::new(config),
            market_broadcast,
            user_broadcast,
            symbol_subscriber_counts: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn register_symbol(&self, spec: SymbolSpec) {
        self.symbol_specs.write().unwrap().insert(spec.symbol.clone(), spec.clone());
        self.exchange.register_symbol(spec);
    }
}
