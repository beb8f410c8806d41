//! `VirtualExchange`: thin composition root wiring the time, account,
//! matching, and replay components together and exposing the operation
//! surface the REST/WS façades call into.
//!
//! Grounded on the teacher's `main.rs` top-level wiring (one shared
//! `AppState` handed to every axum handler) generalized from a single
//! strategy-runner state struct to the full exchange composition spec'd
//! here.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use rust_decimal::Decimal;
use tracing::{info, warn};

use super::account::{AccountError, AccountManager, AccountSnapshot};
use super::matching::{MatchingEngine, MatchingError, OrderLookup, OrderRequest, SubmitOutcome};
use super::replay::{KlinePayload, ReplayController};
use super::time::{ClockMode, TimeManager};
use super::types::{Order, SymbolSpec, Trade, UserId};

pub type MarketCallback = Box<dyn Fn(&str, &MarketEvent) + Send + Sync>;
pub type UserCallback = Box<dyn Fn(UserId, &UserEvent) + Send + Sync>;

/// Bound on each subscriber's pending-event backlog. Sized well above one
/// matching burst's fan-out so an ordinarily-prompt subscriber never drops
/// anything; a subscriber that falls behind this far is the one the policy
/// below is for.
const SUBSCRIBER_QUEUE_CAPACITY: usize = 4_096;

/// Per-subscriber mailbox implementing the drop-oldest backpressure policy:
/// when full, the oldest droppable (non order/trade) entry is evicted to
/// make room; if every queued entry is priority, the bound still wins and
/// the oldest entry goes regardless. A dedicated thread drains this and
/// calls the subscriber's callback, so one slow callback never blocks the
/// matching thread that produced the event.
struct Mailbox<E> {
    queue: Mutex<VecDeque<E>>,
    cvar: Condvar,
    stopping: AtomicBool,
}

impl<E> Mailbox<E> {
    fn new() -> Self {
        Self { queue: Mutex::new(VecDeque::new()), cvar: Condvar::new(), stopping: AtomicBool::new(false) }
    }

    fn push(&self, event: E, is_priority: impl Fn(&E) -> bool) {
        let mut q = self.queue.lock().unwrap();
        if q.len() >= SUBSCRIBER_QUEUE_CAPACITY {
            match q.iter().position(|e| !is_priority(e)) {
                Some(idx) => {
                    q.remove(idx);
                }
                None => {
                    q.pop_front();
                }
            }
        }
        q.push_back(event);
        self.cvar.notify_one();
    }

    fn recv(&self) -> Option<E> {
        let mut q = self.queue.lock().unwrap();
        loop {
            if let Some(event) = q.pop_front() {
                return Some(event);
            }
            if self.stopping.load(Ordering::SeqCst) {
                return None;
            }
            q = self.cvar.wait_timeout(q, Duration::from_millis(200)).unwrap().0;
        }
    }

    fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.cvar.notify_all();
    }
}

struct MarketSubscription {
    mailbox: Arc<Mailbox<(String, MarketEvent)>>,
    worker: JoinHandle<()>,
}

struct UserSubscription {
    mailbox: Arc<Mailbox<(UserId, UserEvent)>>,
    worker: JoinHandle<()>,
}

/// Market events a slow subscriber may lose first: rollups a client can
/// reconstruct from the next snapshot (depth diffs, ticker prints). Trades
/// are never dropped.
fn market_event_is_priority(event: &(String, MarketEvent)) -> bool {
    matches!(event.1, MarketEvent::Trade(_))
}

/// Per spec: order and trade updates are always kept; account-balance
/// snapshots are the droppable "non order-update" entry, since the next
/// snapshot supersedes a dropped one anyway.
fn user_event_is_priority(event: &(UserId, UserEvent)) -> bool {
    !matches!(event.1, UserEvent::AccountUpdate(_))
}

/// Public market-data notification fanned out to `subscribe_market` callbacks.
#[derive(Debug, Clone)]
pub enum MarketEvent {
    Trade(Trade),
    DepthUpdate {
        symbol: String,
        first_update_id: u64,
        last_update_id: u64,
        bids: Vec<(Decimal, Decimal)>,
        asks: Vec<(Decimal, Decimal)>,
    },
    Ticker {
        symbol: String,
        last_price: Decimal,
    },
}

/// Private per-user notification fanned out to `subscribe_user` callbacks.
#[derive(Debug, Clone)]
pub enum UserEvent {
    OrderUpdate(Order),
    TradeUpdate(Trade),
    AccountUpdate(AccountSnapshot),
}

struct Kline {
    open_time: i64,
    close_time: i64,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume: Decimal,
}

struct SymbolRuntime {
    klines: Vec<Kline>,
    trades: std::collections::VecDeque<Trade>,
}

pub struct VirtualExchange {
    pub clock: Arc<TimeManager>,
    pub accounts: Arc<AccountManager>,
    pub matching: Arc<MatchingEngine>,
    symbol_runtime: RwLock<HashMap<String, SymbolRuntime>>,
    market_subscribers: RwLock<Vec<(String, MarketSubscription)>>,
    user_subscribers: RwLock<Vec<UserSubscription>>,
    recent_trades_capacity: usize,
}

const DEFAULT_RECENT_TRADES_CAPACITY: usize = 1_000;

impl VirtualExchange {
    pub fn new(mode: ClockMode, maker_fee_rate: Decimal, taker_fee_rate: Decimal) -> Self {
        let clock = Arc::new(TimeManager::new(mode));
        let accounts = Arc::new(AccountManager::new());
        let matching = Arc::new(MatchingEngine::new(
            accounts.clone(),
            clock.clone(),
            maker_fee_rate,
            taker_fee_rate,
        ));
        Self {
            clock,
            accounts,
            matching,
            symbol_runtime: RwLock::new(HashMap::new()),
            market_subscribers: RwLock::new(Vec::new()),
            user_subscribers: RwLock::new(Vec::new()),
            recent_trades_capacity: DEFAULT_RECENT_TRADES_CAPACITY,
        }
    }

    /// Overrides how long the matching engine's per-symbol cold archive keeps
    /// a terminal order before evicting it by age. Must be called before this
    /// `VirtualExchange` is shared across threads (i.e. right after `new`).
    pub fn with_archive_retention_days(mut self, days: u32) -> Self {
        let engine = Arc::get_mut(&mut self.matching)
            .expect("with_archive_retention_days must run before the engine is shared");
        engine.set_archive_retention_days(days);
        self
    }

    /// Overrides the public recent-trades ring buffer size per symbol.
    pub fn with_recent_trades_capacity(mut self, capacity: usize) -> Self {
        self.recent_trades_capacity = capacity;
        self
    }

    pub fn register_user(&self) -> (UserId, String) {
        self.accounts.register_user()
    }

    pub fn deposit(&self, user_id: UserId, asset: &str, amount: Decimal) -> Result<(), AccountError> {
        self.accounts.deposit(user_id, asset, amount, self.clock.now_ms())?;
        self.notify_account_update(user_id);
        Ok(())
    }

    pub fn withdraw(&self, user_id: UserId, asset: &str, amount: Decimal) -> Result<(), AccountError> {
        self.accounts.withdraw(user_id, asset, amount, self.clock.now_ms())?;
        self.notify_account_update(user_id);
        Ok(())
    }

    pub fn register_symbol(&self, spec: SymbolSpec) {
        let symbol = spec.symbol.clone();
        self.matching.register_symbol(spec);
        self.symbol_runtime
            .write()
            .unwrap()
            .insert(symbol, SymbolRuntime { klines: Vec::new(), trades: std::collections::VecDeque::new() });
    }

    pub fn submit_order(&self, req: OrderRequest) -> Result<SubmitOutcome, MatchingError> {
        let symbol = req.symbol.clone();
        let first_update_id = self.matching.last_update_id(&symbol).unwrap_or(0);
        let outcome = self.matching.submit_order(req)?;
        self.update_klines(&outcome.order.symbol, &outcome.trades);
        self.notify_order(&outcome.order);
        for trade in &outcome.trades {
            self.notify_trade(trade);
        }
        if !outcome.trades.is_empty() {
            self.notify_depth_and_ticker(&symbol, first_update_id, &outcome.trades);
        }
        Ok(outcome)
    }

    pub fn cancel_order(&self, user_id: UserId, symbol: &str, lookup: OrderLookup) -> Result<Order, MatchingError> {
        let order = self.matching.cancel_order(user_id, symbol, lookup)?;
        self.notify_order(&order);
        self.notify_account_update(user_id);
        Ok(order)
    }

    pub fn query_order(&self, symbol: &str, lookup: OrderLookup) -> Result<Order, MatchingError> {
        self.matching.query_order(symbol, lookup)
    }

    pub fn open_orders(&self, user_id: UserId, symbol: &str) -> Result<Vec<Order>, MatchingError> {
        self.matching.open_orders(user_id, symbol)
    }

    /// `symbol = None` scans every registered symbol, matching Binance's
    /// `/openOrders` behavior when the `symbol` query param is omitted.
    pub fn open_orders_any(&self, user_id: UserId, symbol: Option<&str>) -> Result<Vec<Order>, MatchingError> {
        match symbol {
            Some(symbol) => self.matching.open_orders(user_id, symbol),
            None => {
                let mut out = Vec::new();
                for name in self.matching.symbol_names() {
                    out.extend(self.matching.open_orders(user_id, &name)?);
                }
                Ok(out)
            }
        }
    }

    pub fn account_info(&self, user_id: UserId) -> Result<AccountSnapshot, AccountError> {
        self.accounts.snapshot(user_id)
    }

    pub fn market_depth(&self, symbol: &str, limit: usize) -> Result<(Vec<(Decimal, Decimal)>, Vec<(Decimal, Decimal)>), MatchingError> {
        self.matching.depth(symbol, limit)
    }

    /// Public recent-trades feed for a symbol (most recent last).
    pub fn recent_trades(&self, symbol: &str, limit: usize) -> Vec<Trade> {
        let runtime = self.symbol_runtime.read().unwrap();
        match runtime.get(symbol) {
            Some(rt) => rt.trades.iter().rev().take(limit).rev().cloned().collect(),
            None => Vec::new(),
        }
    }

    pub fn klines(&self, symbol: &str, limit: usize) -> Vec<(i64, i64, Decimal, Decimal, Decimal, Decimal, Decimal)> {
        let runtime = self.symbol_runtime.read().unwrap();
        match runtime.get(symbol) {
            Some(rt) => rt
                .klines
                .iter()
                .rev()
                .take(limit)
                .rev()
                .map(|k| (k.open_time, k.close_time, k.open, k.high, k.low, k.close, k.volume))
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn ticker(&self, symbol: &str) -> Option<Decimal> {
        let runtime = self.symbol_runtime.read().unwrap();
        runtime.get(symbol).and_then(|rt| rt.klines.last().map(|k| k.close))
    }

    pub fn avg_price(&self, symbol: &str, window: usize) -> Option<Decimal> {
        let runtime = self.symbol_runtime.read().unwrap();
        let rt = runtime.get(symbol)?;
        let slice: Vec<&Kline> = rt.klines.iter().rev().take(window).collect();
        if slice.is_empty() {
            return None;
        }
        let sum: Decimal = slice.iter().map(|k| k.close).sum();
        Some(sum / Decimal::from(slice.len() as u64))
    }

    /// Registers a market-data subscriber behind a bounded mailbox (see
    /// `Mailbox`): `notify_*` enqueues onto it instead of calling `cb`
    /// directly, and a dedicated thread drains it into `cb` so a slow
    /// subscriber backpressures via dropped depth/ticker entries rather than
    /// stalling the matching thread that produced the event.
    pub fn subscribe_market(&self, symbol: &str, cb: MarketCallback) {
        let mailbox = Arc::new(Mailbox::new());
        let worker_mailbox = mailbox.clone();
        let worker = std::thread::spawn(move || {
            while let Some((symbol, event)) = worker_mailbox.recv() {
                cb(&symbol, &event);
            }
        });
        self.market_subscribers.write().unwrap().push((symbol.to_string(), MarketSubscription { mailbox, worker }));
    }

    pub fn subscribe_user(&self, cb: UserCallback) {
        let mailbox = Arc::new(Mailbox::new());
        let worker_mailbox = mailbox.clone();
        let worker = std::thread::spawn(move || {
            while let Some((user_id, event)) = worker_mailbox.recv() {
                cb(user_id, &event);
            }
        });
        self.user_subscribers.write().unwrap().push(UserSubscription { mailbox, worker });
    }

    fn notify_order(&self, order: &Order) {
        for sub in self.user_subscribers.read().unwrap().iter() {
            sub.mailbox.push((order.user_id, UserEvent::OrderUpdate(order.clone())), user_event_is_priority);
        }
    }

    fn notify_account_update(&self, user_id: UserId) {
        let Ok(snapshot) = self.accounts.snapshot(user_id) else { return };
        for sub in self.user_subscribers.read().unwrap().iter() {
            sub.mailbox.push((user_id, UserEvent::AccountUpdate(snapshot.clone())), user_event_is_priority);
        }
    }

    fn notify_trade(&self, trade: &Trade) {
        for (symbol, sub) in self.market_subscribers.read().unwrap().iter() {
            if symbol.is_empty() || symbol == &trade.symbol {
                sub.mailbox.push((trade.symbol.clone(), MarketEvent::Trade(trade.clone())), market_event_is_priority);
            }
        }
        for sub in self.user_subscribers.read().unwrap().iter() {
            sub.mailbox.push((trade.buy_user_id, UserEvent::TradeUpdate(trade.clone())), user_event_is_priority);
            sub.mailbox.push((trade.sell_user_id, UserEvent::TradeUpdate(trade.clone())), user_event_is_priority);
        }
        self.notify_account_update(trade.buy_user_id);
        self.notify_account_update(trade.sell_user_id);
    }

    /// Emits one `@depth` diff spanning every book mutation this match made
    /// (`first_update_id` from before the call, `last_update_id` after) plus
    /// one `@ticker` carrying the final trade's price, mirroring how a real
    /// matching engine batches its depth diffs per incoming order rather
    /// than per individual resting-order mutation.
    fn notify_depth_and_ticker(&self, symbol: &str, first_update_id: u64, trades: &[Trade]) {
        let Ok(last_update_id) = self.matching.last_update_id(symbol) else { return };
        let Ok((bids, asks)) = self.matching.depth(symbol, 20) else { return };
        let depth_event = MarketEvent::DepthUpdate {
            symbol: symbol.to_string(),
            first_update_id: first_update_id + 1,
            last_update_id,
            bids,
            asks,
        };
        let ticker_event = MarketEvent::Ticker {
            symbol: symbol.to_string(),
            last_price: trades.last().expect("checked non-empty by caller").price,
        };
        for (sub_symbol, sub) in self.market_subscribers.read().unwrap().iter() {
            if sub_symbol.is_empty() || sub_symbol == symbol {
                sub.mailbox.push((symbol.to_string(), depth_event.clone()), market_event_is_priority);
                sub.mailbox.push((symbol.to_string(), ticker_event.clone()), market_event_is_priority);
            }
        }
    }

    fn update_klines(&self, symbol: &str, trades: &[Trade]) {
        if trades.is_empty() {
            return;
        }
        const BUCKET_MS: i64 = 60_000;
        let mut runtime = self.symbol_runtime.write().unwrap();
        let Some(rt) = runtime.get_mut(symbol) else { return };
        for trade in trades {
            rt.trades.push_back(trade.clone());
            while rt.trades.len() > self.recent_trades_capacity {
                rt.trades.pop_front();
            }
            let bucket_start = trade.timestamp - (trade.timestamp % BUCKET_MS);
            match rt.klines.last_mut() {
                Some(k) if k.open_time == bucket_start => {
                    k.high = k.high.max(trade.price);
                    k.low = k.low.min(trade.price);
                    k.close = trade.price;
                    k.close_time = trade.timestamp;
                    k.volume += trade.quantity;
                }
                _ => rt.klines.push(Kline {
                    open_time: bucket_start,
                    close_time: trade.timestamp,
                    open: trade.price,
                    high: trade.price,
                    low: trade.price,
                    close: trade.price,
                    volume: trade.quantity,
                }),
            }
        }
    }

    /// Wires a kline replay feed into this exchange: every emitted bar moves
    /// the virtual clock (done by the controller itself), updates the
    /// symbol's kline/ticker rollup, and is ingested as the symbol's last
    /// trade price so parked conditional orders can trigger against it
    /// exactly as they would against a live print. Call `controller.start()`
    /// (or `step`/`process_all_sync`) afterwards to actually drive playback.
    pub fn attach_replay(self: &Arc<Self>, controller: &Arc<ReplayController<KlinePayload>>) {
        let exchange = Arc::clone(self);
        controller.register_callback(move |_source_id, kline: &KlinePayload| {
            exchange.ingest_replay_bar(kline);
        });
    }

    fn ingest_replay_bar(&self, kline: &KlinePayload) {
        {
            let mut runtime = self.symbol_runtime.write().unwrap();
            if let Some(rt) = runtime.get_mut(&kline.symbol) {
                rt.klines.push(Kline {
                    open_time: kline.close_time_ms,
                    close_time: kline.close_time_ms,
                    open: kline.open,
                    high: kline.high,
                    low: kline.low,
                    close: kline.close,
                    volume: kline.volume,
                });
            }
        }
        match self.matching.ingest_external_price(&kline.symbol, kline.close) {
            Ok(trades) => {
                for trade in &trades {
                    self.update_klines(&kline.symbol, std::slice::from_ref(trade));
                    self.notify_trade(trade);
                }
            }
            Err(err) => warn!(?err, symbol = %kline.symbol, "replay bar ingestion failed"),
        }
        for (sub_symbol, sub) in self.market_subscribers.read().unwrap().iter() {
            if sub_symbol.is_empty() || sub_symbol == &kline.symbol {
                let event = MarketEvent::Ticker { symbol: kline.symbol.clone(), last_price: kline.close };
                sub.mailbox.push((kline.symbol.clone(), event), market_event_is_priority);
            }
        }
    }

    /// Graceful drain: no further orders are accepted after this returns in
    /// spirit, though enforcement of that lives in the REST/WS façade, which
    /// stops routing new requests before calling this. Stops every
    /// subscriber mailbox's drain thread after it empties its backlog.
    pub fn shutdown(&self) {
        info!("virtual exchange shutting down");
        for (_, sub) in self.market_subscribers.write().unwrap().drain(..) {
            sub.mailbox.stop();
            let _ = sub.worker.join();
        }
        for sub in self.user_subscribers.write().unwrap().drain(..) {
            sub.mailbox.stop();
            let _ = sub.worker.join();
        }
    }
}
