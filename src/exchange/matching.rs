//! Matching engine: authoritative owner of order lifecycles for every symbol.
//!
//! The validate → reserve → match → settle → disposition pipeline and the
//! four self-trade-prevention modes are grounded on the teacher's
//! `backtest_v2::matching::LimitOrderBook::submit_order` /
//! `collect_match_actions` / `apply_fill`, generalized from the teacher's
//! single-sided prediction-market book (one asset, price bounded to
//! `[0.01, 0.99]`) to a conventional base/quote spot book with `Decimal`
//! prices and a real `AccountManager` settling each fill.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};

use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{debug, warn};

use super::account::{AccountError, AccountManager};
use super::book::OrderBook;
use super::time::TimeManager;
use super::types::{
    Order, OrderId, OrderStatus, OrderType, PriceMatch, Side, SelfTradePrevention, SymbolSpec,
    TimeInForce, Trade, TradeId, UserId,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MatchingError {
    #[error("unknown symbol {0}")]
    UnknownSymbol(String),
    #[error("unknown order")]
    UnknownOrder,
    #[error("unauthorized")]
    Unauthorized,
    #[error("account error: {0}")]
    Account(#[from] AccountError),
}

/// How a caller identifies an existing order: by server id or by the
/// client-supplied id it was submitted with.
#[derive(Debug, Clone)]
pub enum OrderLookup {
    Id(OrderId),
    ClientId(String),
}

/// A fully-specified inbound order request; field meaning mirrors `Order`.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub user_id: UserId,
    pub side: Side,
    pub order_type: OrderType,
    pub time_in_force: TimeInForce,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub quote_order_qty: Option<Decimal>,
    pub quantity: Option<Decimal>,
    pub self_trade_prevention: SelfTradePrevention,
    pub price_match: PriceMatch,
}

/// Upper-bound slippage applied when reserving quote for a BUY MARKET order
/// sized in base quantity (no explicit price to reserve against).
const MARKET_BUY_SLIPPAGE_BUFFER: Decimal = Decimal::from_parts(5, 0, 0, false, 2); // 0.05

fn next_trade_id(counter: &std::sync::atomic::AtomicU64) -> TradeId {
    counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst)
}

struct SymbolBook {
    spec: SymbolSpec,
    book: OrderBook,
    /// Archive of terminal orders, newest last, for `query_order`/`all_orders`.
    archive: VecDeque<Order>,
    client_order_ids: HashSet<String>,
    parked_conditional: Vec<Order>,
    last_trade_price: Option<Decimal>,
}

impl SymbolBook {
    fn new(spec: SymbolSpec) -> Self {
        Self {
            spec,
            book: OrderBook::new(),
            archive: VecDeque::new(),
            client_order_ids: HashSet::new(),
            parked_conditional: Vec::new(),
            last_trade_price: None,
        }
    }

    /// Appends a terminal order to the cold archive and evicts anything
    /// older than `retention_ms` (the hot/cold split spec'd in the design
    /// notes: matching-path lookups never scan the full retention window).
    /// `MAX_ARCHIVE` is a defensive memory cap only — retention age is the
    /// primary eviction policy.
    fn archive_order(&mut self, order: Order, now_ms: i64, retention_ms: i64) {
        const MAX_ARCHIVE: usize = 200_000;
        self.archive.push_back(order);
        while let Some(front) = self.archive.front() {
            if now_ms - front.update_time > retention_ms || self.archive.len() > MAX_ARCHIVE {
                self.archive.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Default age at which a terminal order is evicted from the cold archive.
const DEFAULT_ARCHIVE_RETENTION_MS: i64 = 90 * 24 * 60 * 60 * 1000;

/// Per-symbol matching engine collection; owns one `OrderBook` per symbol.
pub struct MatchingEngine {
    symbols: RwLock<HashMap<String, RwLock<SymbolBook>>>,
    accounts: Arc<AccountManager>,
    clock: Arc<TimeManager>,
    next_order_id: std::sync::atomic::AtomicU64,
    next_trade_id: std::sync::atomic::AtomicU64,
    maker_fee_rate: Decimal,
    taker_fee_rate: Decimal,
    archive_retention_ms: i64,
}

/// Result of a single `submit_order` call.
pub struct SubmitOutcome {
    pub order: Order,
    pub trades: Vec<Trade>,
}

impl MatchingEngine {
    pub fn new(accounts: Arc<AccountManager>, clock: Arc<TimeManager>, maker_fee_rate: Decimal, taker_fee_rate: Decimal) -> Self {
        Self {
            symbols: RwLock::new(HashMap::new()),
            accounts,
            clock,
            next_order_id: std::sync::atomic::AtomicU64::new(1),
            next_trade_id: std::sync::atomic::AtomicU64::new(1),
            maker_fee_rate,
            taker_fee_rate,
            archive_retention_ms: DEFAULT_ARCHIVE_RETENTION_MS,
        }
    }

    /// Overrides the default 90-day archive retention window.
    pub fn with_archive_retention_days(mut self, days: u32) -> Self {
        self.set_archive_retention_days(days);
        self
    }

    /// In-place form of `with_archive_retention_days`, for callers that only
    /// hold a `&mut MatchingEngine` (e.g. before it's wrapped in an `Arc`).
    pub fn set_archive_retention_days(&mut self, days: u32) {
        self.archive_retention_ms = i64::from(days) * 24 * 60 * 60 * 1000;
    }

    pub fn register_symbol(&self, spec: SymbolSpec) {
        self.symbols
            .write()
            .unwrap()
            .insert(spec.symbol.clone(), RwLock::new(SymbolBook::new(spec)));
    }

    pub fn has_symbol(&self, symbol: &str) -> bool {
        self.symbols.read().unwrap().contains_key(symbol)
    }

    pub fn symbol_names(&self) -> Vec<String> {
        self.symbols.read().unwrap().keys().cloned().collect()
    }

    fn next_order_id(&self) -> OrderId {
        self.next_order_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst)
    }

    fn reject(&self, req: &OrderRequest, reason: &str) -> Order {
        warn!(symbol = %req.symbol, user_id = req.user_id, reason, "order rejected");
        Order {
            order_id: self.next_order_id(),
            client_order_id: req.client_order_id.clone(),
            symbol: req.symbol.clone(),
            user_id: req.user_id,
            side: req.side,
            order_type: req.order_type,
            time_in_force: req.time_in_force,
            price: req.price,
            stop_price: req.stop_price,
            quote_order_qty: req.quote_order_qty,
            quantity: req.quantity.unwrap_or(Decimal::ZERO),
            filled_quantity: Decimal::ZERO,
            filled_quote_quantity: Decimal::ZERO,
            status: OrderStatus::Rejected,
            self_trade_prevention: req.self_trade_prevention,
            price_match: req.price_match,
            timestamp: self.clock.now_ms(),
            update_time: self.clock.now_ms(),
            reserved_asset: String::new(),
            reserved_amount: Decimal::ZERO,
        }
    }

    /// Validate, reserve, match, settle, and dispose of an incoming order.
    pub fn submit_order(&self, req: OrderRequest) -> Result<SubmitOutcome, MatchingError> {
        let symbols = self.symbols.read().unwrap();
        let symbol_lock = symbols
            .get(&req.symbol)
            .ok_or_else(|| MatchingError::UnknownSymbol(req.symbol.clone()))?;
        let mut sym = symbol_lock.write().unwrap();

        // --- 1. validate -----------------------------------------------
        if let Some(reason) = self.validate(&sym, &req) {
            return Ok(SubmitOutcome {
                order: self.reject(&req, reason),
                trades: vec![],
            });
        }

        // --- 2. price-match resolution -----------------------------------
        let mut effective_price = req.price;
        if req.order_type == OrderType::Limit && req.price_match != PriceMatch::None {
            let reference_side = match req.price_match {
                PriceMatch::Opponent => req.side.opposite(),
                PriceMatch::Queue => req.side,
                PriceMatch::None => unreachable!(),
            };
            match sym.book.best_price(reference_side) {
                Some(p) => effective_price = Some(p),
                None => {
                    return Ok(SubmitOutcome {
                        order: self.reject(&req, "no reference price"),
                        trades: vec![],
                    })
                }
            }
        }

        // LIMIT_MAKER crossing check happens before reservation: it must
        // reject, not partially reserve, if it would take liquidity.
        if req.order_type == OrderType::LimitMaker {
            let price = effective_price.expect("limit_maker requires a price");
            if would_cross(&sym.book, req.side, price) {
                return Ok(SubmitOutcome {
                    order: self.reject(&req, "would take liquidity"),
                    trades: vec![],
                });
            }
        }

        // FOK pre-simulation against the book snapshot before any mutation.
        if req.time_in_force == TimeInForce::Fok {
            let qty = req.quantity.unwrap_or(Decimal::ZERO);
            if !can_fully_fill(&sym.book, req.side, effective_price, qty) {
                return Ok(SubmitOutcome {
                    order: Order {
                        order_id: self.next_order_id(),
                        client_order_id: req.client_order_id.clone(),
                        symbol: req.symbol.clone(),
                        user_id: req.user_id,
                        side: req.side,
                        order_type: req.order_type,
                        time_in_force: req.time_in_force,
                        price: effective_price,
                        stop_price: req.stop_price,
                        quote_order_qty: req.quote_order_qty,
                        quantity: qty,
                        filled_quantity: Decimal::ZERO,
                        filled_quote_quantity: Decimal::ZERO,
                        status: OrderStatus::Expired,
                        self_trade_prevention: req.self_trade_prevention,
                        price_match: req.price_match,
                        timestamp: self.clock.now_ms(),
                        update_time: self.clock.now_ms(),
                        reserved_asset: String::new(),
                        reserved_amount: Decimal::ZERO,
                    },
                    trades: vec![],
                });
            }
        }

        // --- 3. reserve funds --------------------------------------------
        let quantity = req.quantity.unwrap_or(Decimal::ZERO);
        let (reserved_asset, reserved_amount) = match self.reserve_for(&sym, &req, effective_price, quantity) {
            Some(v) => v,
            None => {
                return Ok(SubmitOutcome {
                    order: self.reject(&req, "insufficient balance"),
                    trades: vec![],
                })
            }
        };

        // --- 4. assign -----------------------------------------------------
        let now = self.clock.now_ms();
        let mut order = Order {
            order_id: self.next_order_id(),
            client_order_id: req.client_order_id.clone(),
            symbol: req.symbol.clone(),
            user_id: req.user_id,
            side: req.side,
            order_type: req.order_type,
            time_in_force: req.time_in_force,
            price: effective_price,
            stop_price: req.stop_price,
            quote_order_qty: req.quote_order_qty,
            quantity,
            filled_quantity: Decimal::ZERO,
            filled_quote_quantity: Decimal::ZERO,
            status: OrderStatus::New,
            self_trade_prevention: req.self_trade_prevention,
            price_match: req.price_match,
            timestamp: now,
            update_time: now,
            reserved_asset: reserved_asset.clone(),
            reserved_amount,
        };
        if let Some(coid) = &order.client_order_id {
            sym.client_order_ids.insert(coid.clone());
        }

        // --- 5. match ------------------------------------------------------
        // Stop/take-profit variants never match on arrival — they park until
        // a later trade touches `stop_price`, then re-enter as their
        // underlying type via `trigger_conditional_orders`.
        let mut trades = if order.order_type.is_conditional() {
            Vec::new()
        } else {
            let budget = quote_budget_for(&order);
            self.run_match(&mut sym, &mut order, budget)
        };

        // --- 6. post-match disposition --------------------------------------
        self.dispose(&mut sym, &mut order, &reserved_asset);

        // --- 7. conditional-order trigger check ------------------------------
        trades.extend(self.trigger_conditional_orders(&mut sym));

        Ok(SubmitOutcome { order, trades })
    }

    fn validate(&self, sym: &SymbolBook, req: &OrderRequest) -> Option<&'static str> {
        let qty = req.quantity.unwrap_or(Decimal::ZERO);
        if qty <= Decimal::ZERO && req.quote_order_qty.is_none() {
            return Some("quantity must be positive");
        }
        if matches!(
            req.order_type,
            OrderType::Limit | OrderType::LimitMaker | OrderType::StopLossLimit | OrderType::TakeProfitLimit
        ) {
            match req.price {
                Some(p) if p > Decimal::ZERO => {}
                _ => return Some("price must be positive"),
            }
        }
        if req.order_type.is_conditional() {
            match req.stop_price {
                Some(p) if p > Decimal::ZERO => {}
                _ => return Some("stop_price must be positive"),
            }
        }
        if let Some(price) = req.price {
            let filters = &sym.spec.filters;
            if price < filters.price.min || price > filters.price.max {
                return Some("price outside filter bounds");
            }
            if !is_multiple_of(price - filters.price.min, filters.price.tick) {
                return Some("price does not conform to tick size");
            }
        }
        if qty > Decimal::ZERO {
            let filters = &sym.spec.filters;
            if qty < filters.lot.min || qty > filters.lot.max {
                return Some("quantity outside filter bounds");
            }
            if !is_multiple_of(qty - filters.lot.min, filters.lot.step) {
                return Some("quantity does not conform to step size");
            }
            if req.order_type == OrderType::Limit {
                if let Some(price) = req.price {
                    if price * qty < sym.spec.filters.min_notional {
                        return Some("notional below minimum");
                    }
                }
            }
        }
        if let Some(coid) = &req.client_order_id {
            if sym.client_order_ids.contains(coid) {
                return Some("client_order_id already active");
            }
        }
        None
    }

    fn reserve_for(
        &self,
        sym: &SymbolBook,
        req: &OrderRequest,
        effective_price: Option<Decimal>,
        quantity: Decimal,
    ) -> Option<(String, Decimal)> {
        match req.side {
            Side::Buy => {
                let (asset, amount) = if req.order_type == OrderType::Market {
                    if let Some(quote_qty) = req.quote_order_qty {
                        (sym.spec.quote_asset.clone(), quote_qty)
                    } else {
                        let reference = sym
                            .book
                            .best_price(Side::Sell)
                            .or(sym.last_trade_price)
                            .unwrap_or(Decimal::ZERO);
                        let estimate = reference * quantity * (Decimal::ONE + MARKET_BUY_SLIPPAGE_BUFFER);
                        (sym.spec.quote_asset.clone(), estimate)
                    }
                } else {
                    let price = effective_price.unwrap_or(Decimal::ZERO);
                    (sym.spec.quote_asset.clone(), price * quantity)
                };
                self.accounts.reserve(req.user_id, &asset, amount).ok()?.then_some((asset, amount))
            }
            Side::Sell => {
                let asset = sym.spec.base_asset.clone();
                self.accounts
                    .reserve(req.user_id, &asset, quantity)
                    .ok()?
                    .then_some((asset, quantity))
            }
        }
    }

    /// Runs the price-time-priority matching loop, settling each trade via
    /// the account manager and applying self-trade prevention in place.
    ///
    /// `quote_budget` drives a BUY MARKET order sized by `quote_order_qty`:
    /// such an order has no base `quantity` target (it is left at zero), so
    /// the loop must terminate on spendable quote remaining rather than on
    /// `taker.remaining()`, and each fill's size is capped by what's left to
    /// spend at that level's price rather than by base quantity.
    fn run_match(&self, sym: &mut SymbolBook, taker: &mut Order, quote_budget: Option<Decimal>) -> Vec<Trade> {
        let mut trades = Vec::new();
        loop {
            let has_room = match quote_budget {
                Some(budget) => budget - taker.filled_quote_quantity > Decimal::ZERO,
                None => taker.remaining() > Decimal::ZERO,
            };
            if !has_room {
                break;
            }
            let opposite = taker.side.opposite();
            let level_price = match sym.book.best_price(opposite) {
                Some(p) => p,
                None => break,
            };
            if taker.order_type != OrderType::Market {
                let limit = taker.price.unwrap_or(Decimal::ZERO);
                let crosses = match taker.side {
                    Side::Buy => level_price <= limit,
                    Side::Sell => level_price >= limit,
                };
                if !crosses {
                    break;
                }
            }

            let self_trade = sym
                .book
                .front_opposite_mut(taker.side)
                .map(|resting| resting.user_id == taker.user_id)
                .unwrap_or(false);

            // `NONE` (the default) permits the trade — fall through to the
            // normal trade path instead of entering the STP branch, which
            // for a self-crossing order never removes or trades against the
            // resting order and would otherwise `continue` forever against
            // the same front order.
            if self_trade && taker.self_trade_prevention != SelfTradePrevention::None {
                match self.apply_self_trade_prevention(sym, taker) {
                    StpOutcome::StopTaker => break,
                    StpOutcome::ContinueMatching => continue,
                }
            }

            let resting_remaining = sym
                .book
                .front_opposite_mut(taker.side)
                .map(|r| r.remaining())
                .unwrap_or(Decimal::ZERO);
            let trade_price = level_price;
            let trade_qty = match quote_budget {
                Some(budget) => {
                    let remaining_quote = budget - taker.filled_quote_quantity;
                    resting_remaining.min(remaining_quote / trade_price)
                }
                None => taker.remaining().min(resting_remaining),
            };
            if trade_qty <= Decimal::ZERO {
                break;
            }

            let (resting_user, resting_order_id, resting_filled_after) = {
                let resting = sym.book.front_opposite_mut(taker.side).expect("checked above");
                resting.filled_quantity += trade_qty;
                resting.filled_quote_quantity += trade_qty * trade_price;
                (resting.user_id, resting.order_id, resting.remaining())
            };

            taker.filled_quantity += trade_qty;
            taker.filled_quote_quantity += trade_qty * trade_price;

            let (buy_user, sell_user, buy_order_id, sell_order_id) = match taker.side {
                Side::Buy => (taker.user_id, resting_user, taker.order_id, resting_order_id),
                Side::Sell => (resting_user, taker.user_id, resting_order_id, taker.order_id),
            };

            let (maker_rate, taker_rate) = (self.maker_fee_rate, self.taker_fee_rate);
            let (buy_rate, sell_rate) = match taker.side {
                Side::Buy => (taker_rate, maker_rate),
                Side::Sell => (maker_rate, taker_rate),
            };

            if let Err(err) = self.accounts.settle_fill(
                buy_user,
                sell_user,
                &sym.spec.base_asset,
                &sym.spec.quote_asset,
                trade_price,
                trade_qty,
                buy_rate,
                sell_rate,
                self.clock.now_ms(),
            ) {
                warn!(?err, "settle_fill failed mid-match");
            }

            // Commission mirrors whichever leg of `settle_fill` credits the
            // taker: buy-side fees are charged in base (on `trade_qty` at
            // `buy_rate`), sell-side fees are charged in quote (on the
            // notional at `sell_rate`) — same split `settle_fill` applies.
            let (commission, commission_asset) = if taker.side == Side::Buy {
                (trade_qty * buy_rate, sym.spec.base_asset.clone())
            } else {
                (trade_price * trade_qty * sell_rate, sym.spec.quote_asset.clone())
            };

            trades.push(Trade {
                trade_id: next_trade_id(&self.next_trade_id),
                symbol: sym.spec.symbol.clone(),
                price: trade_price,
                quantity: trade_qty,
                quote_quantity: trade_price * trade_qty,
                timestamp: self.clock.now_ms(),
                buy_order_id,
                sell_order_id,
                buy_user_id: buy_user,
                sell_user_id: sell_user,
                maker_side: opposite,
                commission,
                commission_asset,
            });

            sym.last_trade_price = Some(trade_price);

            if resting_filled_after <= Decimal::ZERO {
                if let Some(resting) = sym.book.pop_best(taker.side.opposite()) {
                    self.finalize_resting_fill(sym, resting);
                }
            } else {
                sym.book.reduce_best_front(taker.side.opposite(), trade_qty);
            }
        }
        taker.filled_quantity = taker.quantity - taker.remaining();
        trades
    }

    fn finalize_resting_fill(&self, sym: &mut SymbolBook, mut resting: Order) {
        resting.status = OrderStatus::Filled;
        resting.update_time = self.clock.now_ms();
        if let Some(coid) = &resting.client_order_id {
            sym.client_order_ids.remove(coid);
        }
        debug!(order_id = resting.order_id, symbol = %sym.spec.symbol, "resting order fully filled");
        sym.archive_order(resting, self.clock.now_ms(), self.archive_retention_ms);
    }

    fn apply_self_trade_prevention(&self, sym: &mut SymbolBook, taker: &mut Order) -> StpOutcome {
        match taker.self_trade_prevention {
            SelfTradePrevention::None => StpOutcome::ContinueMatching,
            SelfTradePrevention::ExpireTaker => {
                taker.status = OrderStatus::ExpiredInMatch;
                debug!(order_id = taker.order_id, "STP triggered: taker expired");
                StpOutcome::StopTaker
            }
            SelfTradePrevention::ExpireMaker => {
                if let Some(resting) = sym.book.pop_best(taker.side.opposite()) {
                    self.expire_and_release(sym, resting, "STP triggered");
                }
                StpOutcome::ContinueMatching
            }
            SelfTradePrevention::ExpireBoth => {
                if let Some(resting) = sym.book.pop_best(taker.side.opposite()) {
                    self.expire_and_release(sym, resting, "STP triggered");
                }
                taker.status = OrderStatus::ExpiredInMatch;
                debug!(order_id = taker.order_id, "STP triggered: both expired");
                StpOutcome::StopTaker
            }
        }
    }

    fn expire_and_release(&self, sym: &mut SymbolBook, mut order: Order, reason: &str) {
        order.status = OrderStatus::ExpiredInMatch;
        order.update_time = self.clock.now_ms();
        if let Some(coid) = &order.client_order_id {
            sym.client_order_ids.remove(coid);
        }
        let release_amount = remaining_reservation(&order);
        if release_amount > Decimal::ZERO {
            if let Err(err) = self.accounts.release(order.user_id, &order.reserved_asset, release_amount) {
                warn!(?err, "failed to release reservation on STP expiry");
            }
        }
        debug!(order_id = order.order_id, reason, "order expired in match");
        sym.archive_order(order, self.clock.now_ms(), self.archive_retention_ms);
    }

    /// Check parked stop/take-profit orders against the latest trade price
    /// and re-submit any that have triggered as their underlying (non-stop)
    /// type: run the matching loop for each, settle any resulting trades,
    /// and dispose of it exactly as a freshly-submitted order would be. Only
    /// orders already parked at the time of this call are considered — a
    /// trade produced by a just-triggered order does not cascade into a
    /// second trigger pass within the same call (single wave per event).
    fn trigger_conditional_orders(&self, sym: &mut SymbolBook) -> Vec<Trade> {
        let Some(last_price) = sym.last_trade_price else { return Vec::new() };
        let mut triggered = Vec::new();
        sym.parked_conditional.retain(|order| {
            let stop = order.stop_price.unwrap_or(Decimal::ZERO);
            let hit = match order.side {
                Side::Buy => last_price >= stop,
                Side::Sell => last_price <= stop,
            };
            if hit {
                triggered.push(order.clone());
                false
            } else {
                true
            }
        });
        let mut trades = Vec::new();
        for mut order in triggered {
            order.order_type = order.order_type.triggered_type();
            order.status = OrderStatus::New;
            let budget = quote_budget_for(&order);
            trades.extend(self.run_match(sym, &mut order, budget));
            let reserved_asset = order.reserved_asset.clone();
            self.dispose(sym, &mut order, &reserved_asset);
        }
        trades
    }

    fn dispose(&self, sym: &mut SymbolBook, order: &mut Order, reserved_asset: &str) {
        order.update_time = self.clock.now_ms();

        // `quantity` stays zero for the lifetime of a quote_order_qty MARKET
        // BUY, so the generic `remaining() <= 0` check below would read it as
        // fully filled from the moment it's submitted and skip releasing
        // whatever quote the order never spent. Settle those here instead,
        // off `filled_quote_quantity` rather than `remaining()`.
        if order.quote_order_qty.is_some() && order.order_type == OrderType::Market {
            let leftover = (order.reserved_amount - order.filled_quote_quantity).max(Decimal::ZERO);
            if leftover > Decimal::ZERO {
                let _ = self.accounts.release(order.user_id, reserved_asset, leftover);
            }
            order.status = if order.filled_quantity > Decimal::ZERO {
                OrderStatus::Filled
            } else {
                OrderStatus::Expired
            };
            if let Some(coid) = &order.client_order_id {
                sym.client_order_ids.remove(coid);
            }
            sym.archive_order(order.clone(), self.clock.now_ms(), self.archive_retention_ms);
            return;
        }

        if order.status == OrderStatus::ExpiredInMatch {
            let release_amount = remaining_reservation(order);
            if release_amount > Decimal::ZERO {
                let _ = self.accounts.release(order.user_id, reserved_asset, release_amount);
            }
            if let Some(coid) = &order.client_order_id {
                sym.client_order_ids.remove(coid);
            }
            sym.archive_order(order.clone(), self.clock.now_ms(), self.archive_retention_ms);
            return;
        }

        if order.remaining() <= Decimal::ZERO {
            order.status = OrderStatus::Filled;
            if let Some(coid) = &order.client_order_id {
                sym.client_order_ids.remove(coid);
            }
            sym.archive_order(order.clone(), self.clock.now_ms(), self.archive_retention_ms);
            return;
        }

        if order.filled_quantity > Decimal::ZERO {
            order.status = OrderStatus::PartiallyFilled;
        }

        match (order.order_type, order.time_in_force) {
            (OrderType::Market, _) => {
                order.status = OrderStatus::Expired;
                let release_amount = remaining_reservation(order);
                if release_amount > Decimal::ZERO {
                    let _ = self.accounts.release(order.user_id, reserved_asset, release_amount);
                }
                if let Some(coid) = &order.client_order_id {
                    sym.client_order_ids.remove(coid);
                }
                sym.archive_order(order.clone(), self.clock.now_ms(), self.archive_retention_ms);
            }
            (_, TimeInForce::Ioc) => {
                order.status = OrderStatus::Canceled;
                let release_amount = remaining_reservation(order);
                if release_amount > Decimal::ZERO {
                    let _ = self.accounts.release(order.user_id, reserved_asset, release_amount);
                }
                if let Some(coid) = &order.client_order_id {
                    sym.client_order_ids.remove(coid);
                }
                sym.archive_order(order.clone(), self.clock.now_ms(), self.archive_retention_ms);
            }
            _ if order.order_type.is_conditional() => {
                sym.parked_conditional.push(order.clone());
            }
            _ => {
                // LIMIT GTC (and LIMIT_MAKER, already verified non-crossing): rest it.
                order.status = if order.filled_quantity > Decimal::ZERO {
                    OrderStatus::PartiallyFilled
                } else {
                    OrderStatus::New
                };
                sym.book.insert(order.clone());
            }
        }
    }

    pub fn cancel_order(&self, user_id: UserId, symbol: &str, lookup: OrderLookup) -> Result<Order, MatchingError> {
        let symbols = self.symbols.read().unwrap();
        let symbol_lock = symbols.get(symbol).ok_or_else(|| MatchingError::UnknownSymbol(symbol.to_string()))?;
        let mut sym = symbol_lock.write().unwrap();
        let order_id = match lookup {
            OrderLookup::Id(id) => id,
            OrderLookup::ClientId(coid) => sym
                .book
                .iter_orders()
                .find(|o| o.client_order_id.as_deref() == Some(coid.as_str()))
                .map(|o| o.order_id)
                .ok_or(MatchingError::UnknownOrder)?,
        };
        let mut order = sym.book.remove(order_id).ok_or(MatchingError::UnknownOrder)?;
        if order.user_id != user_id {
            // put it back; cancellation attempt by a non-owner must not mutate state
            sym.book.insert(order);
            return Err(MatchingError::Unauthorized);
        }
        order.status = OrderStatus::Canceled;
        order.update_time = self.clock.now_ms();
        let release_amount = remaining_reservation(&order);
        if release_amount > Decimal::ZERO {
            self.accounts.release(order.user_id, &order.reserved_asset, release_amount)?;
        }
        if let Some(coid) = &order.client_order_id {
            sym.client_order_ids.remove(coid);
        }
        sym.archive_order(order.clone(), self.clock.now_ms(), self.archive_retention_ms);
        Ok(order)
    }

    pub fn query_order(&self, symbol: &str, lookup: OrderLookup) -> Result<Order, MatchingError> {
        let symbols = self.symbols.read().unwrap();
        let symbol_lock = symbols.get(symbol).ok_or_else(|| MatchingError::UnknownSymbol(symbol.to_string()))?;
        let sym = symbol_lock.read().unwrap();
        let matches = |o: &&Order| match &lookup {
            OrderLookup::Id(id) => o.order_id == *id,
            OrderLookup::ClientId(coid) => o.client_order_id.as_deref() == Some(coid.as_str()),
        };
        if let Some(found) = sym.book.iter_orders().find(matches) {
            return Ok(found.clone());
        }
        if let Some(found) = sym.parked_conditional.iter().find(matches) {
            return Ok(found.clone());
        }
        if let Some(found) = sym.archive.iter().find(matches) {
            return Ok(found.clone());
        }
        Err(MatchingError::UnknownOrder)
    }

    pub fn open_orders(&self, user_id: UserId, symbol: &str) -> Result<Vec<Order>, MatchingError> {
        let symbols = self.symbols.read().unwrap();
        let symbol_lock = symbols.get(symbol).ok_or_else(|| MatchingError::UnknownSymbol(symbol.to_string()))?;
        let sym = symbol_lock.read().unwrap();
        let mut out: Vec<Order> = sym
            .book
            .iter_orders()
            .filter(|o| o.user_id == user_id)
            .cloned()
            .collect();
        out.extend(sym.parked_conditional.iter().filter(|o| o.user_id == user_id).cloned());
        out.retain(|o| !o.status.is_terminal());
        Ok(out)
    }

    pub fn all_orders(
        &self,
        symbol: &str,
        user_id: UserId,
        from_id: Option<OrderId>,
        start: Option<i64>,
        end: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Order>, MatchingError> {
        let symbols = self.symbols.read().unwrap();
        let symbol_lock = symbols.get(symbol).ok_or_else(|| MatchingError::UnknownSymbol(symbol.to_string()))?;
        let sym = symbol_lock.read().unwrap();
        Ok(sym
            .archive
            .iter()
            .filter(|o| o.user_id == user_id)
            .filter(|o| from_id.map_or(true, |id| o.order_id >= id))
            .filter(|o| start.map_or(true, |s| o.timestamp >= s))
            .filter(|o| end.map_or(true, |e| o.timestamp <= e))
            .rev()
            .take(limit.min(1000))
            .cloned()
            .collect())
    }

    pub fn depth(&self, symbol: &str, n: usize) -> Result<(Vec<(Decimal, Decimal)>, Vec<(Decimal, Decimal)>), MatchingError> {
        let symbols = self.symbols.read().unwrap();
        let symbol_lock = symbols.get(symbol).ok_or_else(|| MatchingError::UnknownSymbol(symbol.to_string()))?;
        Ok(symbol_lock.read().unwrap().book.depth(n))
    }

    pub fn last_update_id(&self, symbol: &str) -> Result<u64, MatchingError> {
        let symbols = self.symbols.read().unwrap();
        let symbol_lock = symbols.get(symbol).ok_or_else(|| MatchingError::UnknownSymbol(symbol.to_string()))?;
        Ok(symbol_lock.read().unwrap().book.last_update_id())
    }

    /// Records an externally-observed price (e.g. a replayed kline close) as
    /// the symbol's last trade price and checks parked conditional orders
    /// against it, without itself generating a trade. This is how a replay
    /// feed — which carries bars, not this engine's own matches — can still
    /// trigger stop/take-profit orders while driving BACKTEST mode.
    pub fn ingest_external_price(&self, symbol: &str, price: Decimal) -> Result<Vec<Trade>, MatchingError> {
        let symbols = self.symbols.read().unwrap();
        let symbol_lock = symbols.get(symbol).ok_or_else(|| MatchingError::UnknownSymbol(symbol.to_string()))?;
        let mut sym = symbol_lock.write().unwrap();
        sym.last_trade_price = Some(price);
        Ok(self.trigger_conditional_orders(&mut sym))
    }
}

enum StpOutcome {
    StopTaker,
    ContinueMatching,
}

/// The spendable-quote budget for orders sized by `quote_order_qty` (a BUY
/// MARKET order has no base `quantity` target in that case, so `run_match`
/// must be driven off quote remaining instead).
fn quote_budget_for(order: &Order) -> Option<Decimal> {
    if order.order_type == OrderType::Market && order.side == Side::Buy {
        order.quote_order_qty
    } else {
        None
    }
}

fn remaining_reservation(order: &Order) -> Decimal {
    // Proportional: reserved_amount was sized for `quantity`; the unused
    // share is what's left to release once the filled portion has settled.
    if order.quantity <= Decimal::ZERO {
        return order.reserved_amount;
    }
    order.reserved_amount * order.remaining() / order.quantity
}

fn is_multiple_of(value: Decimal, step: Decimal) -> bool {
    if step <= Decimal::ZERO {
        return true;
    }
    (value / step).fract() == Decimal::ZERO
}

fn would_cross(book: &OrderBook, side: Side, price: Decimal) -> bool {
    match book.best_price(side.opposite()) {
        Some(best) => match side {
            Side::Buy => best <= price,
            Side::Sell => best >= price,
        },
        None => false,
    }
}

/// Pre-match simulation for FOK: can this order be entirely filled against
/// the current book snapshot without mutating anything?
fn can_fully_fill(book: &OrderBook, side: Side, price: Option<Decimal>, quantity: Decimal) -> bool {
    let (bids, asks) = book.depth(usize::MAX);
    let levels: &[(Decimal, Decimal)] = match side {
        Side::Buy => &asks,
        Side::Sell => &bids,
    };
    let mut remaining = quantity;
    for (level_price, level_qty) in levels {
        if let Some(limit) = price {
            let crosses = match side {
                Side::Buy => *level_price <= limit,
                Side::Sell => *level_price >= limit,
            };
            if !crosses {
                break;
            }
        }
        remaining -= *level_qty;
        if remaining <= Decimal::ZERO {
            return true;
        }
    }
    false
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::types::{LotFilter, PriceFilter, SymbolFilters};
    use rust_decimal_macros::dec;

    fn setup() -> (MatchingEngine, UserId, UserId) {
        let accounts = Arc::new(AccountManager::new());
        let clock = Arc::new(TimeManager::live());
        let engine = MatchingEngine::new(accounts.clone(), clock, dec!(0), dec!(0.001));
        engine.register_symbol(SymbolSpec {
            symbol: "BTCUSDT".into(),
            base_asset: "BTC".into(),
            quote_asset: "USDT".into(),
            base_precision: 8,
            quote_precision: 8,
            filters: SymbolFilters {
                price: PriceFilter { min: dec!(0.01), max: dec!(1000000), tick: dec!(0.01) },
                lot: LotFilter { min: dec!(0.00001), max: dec!(9000), step: dec!(0.00001) },
                min_notional: dec!(1),
            },
        });
        let (buyer, _) = accounts.register_user();
        let (seller, _) = accounts.register_user();
        accounts.deposit(buyer, "USDT", dec!(100000), 0).unwrap();
        accounts.deposit(seller, "BTC", dec!(100), 0).unwrap();
        (engine, buyer, seller)
    }

    fn limit_req(user: UserId, side: Side, price: Decimal, qty: Decimal) -> OrderRequest {
        OrderRequest {
            client_order_id: None,
            symbol: "BTCUSDT".into(),
            user_id: user,
            side,
            order_type: OrderType::Limit,
            time_in_force: TimeInForce::Gtc,
            price: Some(price),
            stop_price: None,
            quote_order_qty: None,
            quantity: Some(qty),
            self_trade_prevention: SelfTradePrevention::None,
            price_match: PriceMatch::None,
        }
    }

    #[test]
    fn resting_limit_order_enters_book() {
        let (engine, buyer, _seller) = setup();
        let outcome = engine.submit_order(limit_req(buyer, Side::Buy, dec!(100), dec!(1))).unwrap();
        assert_eq!(outcome.order.status, OrderStatus::New);
        assert!(outcome.trades.is_empty());
    }

    #[test]
    fn crossing_orders_match_at_maker_price() {
        let (engine, buyer, seller) = setup();
        engine.submit_order(limit_req(seller, Side::Sell, dec!(100), dec!(1))).unwrap();
        let outcome = engine.submit_order(limit_req(buyer, Side::Buy, dec!(101), dec!(1))).unwrap();
        assert_eq!(outcome.trades.len(), 1);
        assert_eq!(outcome.trades[0].price, dec!(100));
        assert_eq!(outcome.order.status, OrderStatus::Filled);
    }

    #[test]
    fn partial_fill_leaves_remainder_resting() {
        let (engine, buyer, seller) = setup();
        engine.submit_order(limit_req(seller, Side::Sell, dec!(100), dec!(1))).unwrap();
        let outcome = engine.submit_order(limit_req(buyer, Side::Buy, dec!(100), dec!(2))).unwrap();
        assert_eq!(outcome.trades.len(), 1);
        assert_eq!(outcome.order.status, OrderStatus::PartiallyFilled);
        assert_eq!(outcome.order.remaining(), dec!(1));
    }

    /// A taker that only partially consumes a larger resting order must
    /// advance the resting order's `filled_quantity` by exactly the traded
    /// amount once, and leave the rest of the resting size matchable.
    #[test]
    fn partial_resting_fill_credits_filled_quantity_exactly_once() {
        let (engine, buyer, seller) = setup();
        let resting = engine.submit_order(limit_req(seller, Side::Sell, dec!(100), dec!(10))).unwrap();
        engine.submit_order(limit_req(buyer, Side::Buy, dec!(100), dec!(5))).unwrap();

        let resting_order = engine
            .query_order(&resting.order.symbol, OrderLookup::Id(resting.order.order_id))
            .unwrap();
        assert_eq!(resting_order.filled_quantity, dec!(5));
        assert_eq!(resting_order.remaining(), dec!(5));
        assert_eq!(engine.depth("BTCUSDT", 5).unwrap().1, vec![(dec!(100), dec!(5))]);

        // the remaining 5 must still be fully matchable, not phantom liquidity
        let second = engine.submit_order(limit_req(buyer, Side::Buy, dec!(100), dec!(5))).unwrap();
        assert_eq!(second.trades.len(), 1);
        assert_eq!(second.trades[0].quantity, dec!(5));
        assert!(engine.depth("BTCUSDT", 5).unwrap().1.is_empty());
    }

    #[test]
    fn insufficient_balance_rejects_without_book_change() {
        let (engine, buyer, _seller) = setup();
        let outcome = engine
            .submit_order(limit_req(buyer, Side::Buy, dec!(1000000), dec!(9000)))
            .unwrap();
        assert_eq!(outcome.order.status, OrderStatus::Rejected);
    }

    #[test]
    fn ioc_cancels_unfilled_remainder() {
        let (engine, buyer, seller) = setup();
        engine.submit_order(limit_req(seller, Side::Sell, dec!(100), dec!(1))).unwrap();
        let mut req = limit_req(buyer, Side::Buy, dec!(100), dec!(5));
        req.time_in_force = TimeInForce::Ioc;
        let outcome = engine.submit_order(req).unwrap();
        assert_eq!(outcome.order.status, OrderStatus::Canceled);
        assert_eq!(outcome.trades.len(), 1);
    }

    #[test]
    fn fok_expires_when_book_cannot_cover_full_size() {
        let (engine, buyer, seller) = setup();
        engine.submit_order(limit_req(seller, Side::Sell, dec!(100), dec!(1))).unwrap();
        let mut req = limit_req(buyer, Side::Buy, dec!(100), dec!(5));
        req.time_in_force = TimeInForce::Fok;
        let outcome = engine.submit_order(req).unwrap();
        assert_eq!(outcome.order.status, OrderStatus::Expired);
        assert!(outcome.trades.is_empty());
    }

    #[test]
    fn limit_maker_rejects_if_it_would_cross() {
        let (engine, buyer, seller) = setup();
        engine.submit_order(limit_req(seller, Side::Sell, dec!(100), dec!(1))).unwrap();
        let mut req = limit_req(buyer, Side::Buy, dec!(101), dec!(1));
        req.order_type = OrderType::LimitMaker;
        let outcome = engine.submit_order(req).unwrap();
        assert_eq!(outcome.order.status, OrderStatus::Rejected);
    }

    #[test]
    fn self_trade_prevention_expire_taker_stops_match() {
        let (engine, buyer, _seller) = setup();
        engine.submit_order(limit_req(buyer, Side::Sell, dec!(100), dec!(1))).unwrap();
        let mut req = limit_req(buyer, Side::Buy, dec!(100), dec!(1));
        req.self_trade_prevention = SelfTradePrevention::ExpireTaker;
        let outcome = engine.submit_order(req).unwrap();
        assert_eq!(outcome.order.status, OrderStatus::ExpiredInMatch);
        assert!(outcome.trades.is_empty());
    }

    /// `NONE` is the default STP mode and must permit a self-crossing order
    /// to trade normally rather than looping forever against its own resting
    /// order or silently refusing to match.
    #[test]
    fn self_trade_prevention_none_permits_the_trade() {
        let (engine, buyer, _seller) = setup();
        engine.submit_order(limit_req(buyer, Side::Sell, dec!(100), dec!(1))).unwrap();
        let outcome = engine.submit_order(limit_req(buyer, Side::Buy, dec!(100), dec!(1))).unwrap();
        assert_eq!(outcome.trades.len(), 1);
        assert_eq!(outcome.order.status, OrderStatus::Filled);
        assert!(engine.depth("BTCUSDT", 5).unwrap().1.is_empty());
    }

    #[test]
    fn stop_loss_limit_parks_without_matching_even_if_it_would_cross() {
        let (engine, buyer, seller) = setup();
        engine.submit_order(limit_req(seller, Side::Sell, dec!(100), dec!(1))).unwrap();
        let mut req = limit_req(buyer, Side::Buy, dec!(101), dec!(1));
        req.order_type = OrderType::StopLossLimit;
        req.stop_price = Some(dec!(100));
        let outcome = engine.submit_order(req).unwrap();
        assert!(outcome.trades.is_empty());
        assert_eq!(outcome.order.status, OrderStatus::New);
        // still resting in the book as a sell, untouched by the parked stop
        assert_eq!(engine.depth("BTCUSDT", 5).unwrap().1, vec![(dec!(100), dec!(1))]);
    }

    #[test]
    fn stop_loss_limit_triggers_and_matches_once_stop_price_is_touched() {
        let (engine, buyer, seller) = setup();
        engine.submit_order(limit_req(seller, Side::Sell, dec!(100), dec!(2))).unwrap();

        // buyer parks a stop-buy that should trigger once price trades at/above 100.
        let mut stop_req = limit_req(buyer, Side::Buy, dec!(101), dec!(1));
        stop_req.order_type = OrderType::StopLossLimit;
        stop_req.stop_price = Some(dec!(100));
        let parked = engine.submit_order(stop_req).unwrap();
        assert_eq!(parked.order.status, OrderStatus::New);
        assert!(parked.trades.is_empty());

        // buyer's own plain limit buy trades at the stop price, which should
        // trigger the parked order in the same call and let it match too.
        let outcome = engine.submit_order(limit_req(buyer, Side::Buy, dec!(100), dec!(1))).unwrap();
        assert_eq!(outcome.trades.len(), 2);
        assert!(outcome.trades.iter().all(|t| t.price == dec!(100)));
        assert!(engine.depth("BTCUSDT", 5).unwrap().0.is_empty());
        assert!(engine.depth("BTCUSDT", 5).unwrap().1.is_empty());
    }

    #[test]
    fn external_price_ingestion_triggers_parked_conditional_orders() {
        let (engine, buyer, _seller) = setup();
        let mut stop_req = limit_req(buyer, Side::Buy, dec!(101), dec!(1));
        stop_req.order_type = OrderType::StopLossLimit;
        stop_req.stop_price = Some(dec!(100));
        engine.submit_order(stop_req).unwrap();

        let trades = engine.ingest_external_price("BTCUSDT", dec!(100)).unwrap();
        assert!(trades.is_empty());
        // triggered order now rests in the book as a plain limit buy at 101
        assert_eq!(engine.depth("BTCUSDT", 5).unwrap().0, vec![(dec!(101), dec!(1))]);
    }

    #[test]
    fn cancel_releases_reservation_and_removes_from_book() {
        let (engine, buyer, _seller) = setup();
        let outcome = engine.submit_order(limit_req(buyer, Side::Buy, dec!(100), dec!(1))).unwrap();
        let cancelled = engine.cancel_order(buyer, "BTCUSDT", OrderLookup::Id(outcome.order.order_id)).unwrap();
        assert_eq!(cancelled.status, OrderStatus::Canceled);
    }

    #[test]
    fn cancel_by_non_owner_is_unauthorized_and_does_not_mutate() {
        let (engine, buyer, seller) = setup();
        let outcome = engine.submit_order(limit_req(buyer, Side::Buy, dec!(100), dec!(1))).unwrap();
        let err = engine.cancel_order(seller, "BTCUSDT", OrderLookup::Id(outcome.order.order_id)).unwrap_err();
        assert_eq!(err, MatchingError::Unauthorized);
        // still cancellable by the rightful owner afterwards
        assert!(engine.cancel_order(buyer, "BTCUSDT", OrderLookup::Id(outcome.order.order_id)).is_ok());
    }

    /// `setup()` deliberately gives maker and taker different rates
    /// (`maker=0`, `taker=0.001`); the buyer here is the taker, so its fee
    /// must be charged at the taker rate, not a flat maker rate.
    #[test]
    fn trade_commission_uses_the_taker_rate_not_a_flat_maker_rate() {
        let (engine, buyer, seller) = setup();
        engine.submit_order(limit_req(seller, Side::Sell, dec!(100), dec!(1))).unwrap();
        let outcome = engine.submit_order(limit_req(buyer, Side::Buy, dec!(100), dec!(1))).unwrap();
        assert_eq!(outcome.trades.len(), 1);
        assert_eq!(outcome.trades[0].commission, dec!(1) * dec!(0.001));
        assert_eq!(outcome.trades[0].commission_asset, "BTC");
    }

    fn market_quote_req(user: UserId, quote_qty: Decimal) -> OrderRequest {
        OrderRequest {
            client_order_id: None,
            symbol: "BTCUSDT".into(),
            user_id: user,
            side: Side::Buy,
            order_type: OrderType::Market,
            time_in_force: TimeInForce::Gtc,
            price: None,
            stop_price: None,
            quote_order_qty: Some(quote_qty),
            quantity: None,
            self_trade_prevention: SelfTradePrevention::None,
            price_match: PriceMatch::None,
        }
    }

    #[test]
    fn market_buy_by_quote_order_qty_spends_exactly_the_requested_quote() {
        let (engine, buyer, seller) = setup();
        engine.submit_order(limit_req(seller, Side::Sell, dec!(100), dec!(10))).unwrap();

        let usdt_before = engine.accounts.balance_of(buyer, "USDT").unwrap();
        let outcome = engine.submit_order(market_quote_req(buyer, dec!(500))).unwrap();

        assert!(!outcome.trades.is_empty(), "quote_order_qty market buy must actually match resting liquidity");
        assert_eq!(outcome.order.status, OrderStatus::Filled);
        assert_eq!(outcome.order.filled_quote_quantity, dec!(500));

        let spent: Decimal = outcome.trades.iter().map(|t| t.quantity).sum();
        assert_eq!(spent, dec!(5)); // 500 USDT / 100 per BTC

        let usdt_after = engine.accounts.balance_of(buyer, "USDT").unwrap();
        assert_eq!(usdt_before.free - usdt_after.free, dec!(500));
        assert_eq!(usdt_after.locked, dec!(0), "no quote reservation should remain locked after a filled market order");
    }

    #[test]
    fn market_buy_by_quote_order_qty_releases_unspent_quote_when_book_runs_dry() {
        let (engine, buyer, seller) = setup();
        // Only 1 BTC resting at 100 USDT/BTC = 100 USDT of liquidity, but the
        // order asks to spend 500 USDT worth.
        engine.submit_order(limit_req(seller, Side::Sell, dec!(100), dec!(1))).unwrap();

        let usdt_before = engine.accounts.balance_of(buyer, "USDT").unwrap();
        let outcome = engine.submit_order(market_quote_req(buyer, dec!(500))).unwrap();

        assert_eq!(outcome.trades.len(), 1);
        assert_eq!(outcome.order.filled_quote_quantity, dec!(100));
        assert_eq!(outcome.order.status, OrderStatus::Filled);

        let usdt_after = engine.accounts.balance_of(buyer, "USDT").unwrap();
        assert_eq!(usdt_before.free - usdt_after.free, dec!(100));
        assert_eq!(usdt_after.locked, dec!(0), "the unspent 400 USDT reservation must be released, not locked forever");
    }
}
