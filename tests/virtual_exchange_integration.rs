//! End-to-end scenarios against the public `VirtualExchange` surface,
//! exercising the full matching/account/replay stack together rather than
//! any single component in isolation. Each test below corresponds to one of
//! the worked scenarios in the system's end-to-end scenario catalog.

use std::sync::{Arc, Mutex};

use virtual_exchange::exchange::matching::{OrderLookup, OrderRequest};
use virtual_exchange::exchange::replay::{ReplayController, VecSource};
use virtual_exchange::exchange::time::TimeManager;
use virtual_exchange::exchange::types::{
    LotFilter, OrderStatus, OrderType, PriceFilter, PriceMatch, Side, SelfTradePrevention,
    SymbolFilters, SymbolSpec, TimeInForce,
};
use virtual_exchange::exchange::{ClockMode, VirtualExchange};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

fn btcusdt_spec() -> SymbolSpec {
    SymbolSpec {
        symbol: "BTCUSDT".into(),
        base_asset: "BTC".into(),
        quote_asset: "USDT".into(),
        base_precision: 8,
        quote_precision: 8,
        filters: SymbolFilters {
            price: PriceFilter { min: dec!(0.01), max: dec!(1000000), tick: dec!(0.01) },
            lot: LotFilter { min: dec!(0.00001), max: dec!(9000), step: dec!(0.00001) },
            min_notional: dec!(10),
        },
    }
}

fn exchange() -> Arc<VirtualExchange> {
    let exchange = Arc::new(VirtualExchange::new(ClockMode::Live, dec!(0), dec!(0)));
    exchange.register_symbol(btcusdt_spec());
    exchange
}

fn limit(user: u64, side: Side, price: Decimal, qty: Decimal) -> OrderRequest {
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

fn market_buy(user: u64, qty: Decimal) -> OrderRequest {
    OrderRequest {
        client_order_id: None,
        symbol: "BTCUSDT".into(),
        user_id: user,
        side: Side::Buy,
        order_type: OrderType::Market,
        time_in_force: TimeInForce::Gtc,
        price: None,
        stop_price: None,
        quote_order_qty: None,
        quantity: Some(qty),
        self_trade_prevention: SelfTradePrevention::None,
        price_match: PriceMatch::None,
    }
}

/// Scenario 1: partial fill followed by a market order completing the rest.
#[test]
fn partial_then_full_fill_settles_both_sides_and_empties_the_book() {
    let exchange = exchange();
    let (u1, _) = exchange.register_user();
    let (u2, _) = exchange.register_user();
    exchange.deposit(u1, "USDT", dec!(10000)).unwrap();
    exchange.deposit(u2, "BTC", dec!(1)).unwrap();

    exchange.submit_order(limit(u2, Side::Sell, dec!(50000), dec!(1))).unwrap();

    let first = exchange.submit_order(limit(u1, Side::Buy, dec!(50000), dec!(0.4))).unwrap();
    assert_eq!(first.trades.len(), 1);
    assert_eq!(first.trades[0].quantity, dec!(0.4));
    assert_eq!(first.order.status, OrderStatus::Filled);

    let u1_btc = exchange.accounts.balance_of(u1, "BTC").unwrap();
    assert_eq!(u1_btc.free, dec!(0.4));

    let second = exchange.submit_order(market_buy(u1, dec!(0.6))).unwrap();
    assert_eq!(second.trades.len(), 1);
    assert_eq!(second.trades[0].quantity, dec!(0.6));

    let u1_btc_final = exchange.accounts.balance_of(u1, "BTC").unwrap();
    assert_eq!(u1_btc_final.free, dec!(1.0));

    let (bids, asks) = exchange.market_depth("BTCUSDT", 10).unwrap();
    assert!(bids.is_empty());
    assert!(asks.is_empty());
}

/// Scenario 2: an IOC buy takes what is available and cancels the remainder.
#[test]
fn ioc_buy_cancels_unfilled_remainder() {
    let exchange = exchange();
    let (u1, _) = exchange.register_user();
    let (u2, _) = exchange.register_user();
    exchange.deposit(u1, "USDT", dec!(100000)).unwrap();
    exchange.deposit(u2, "BTC", dec!(1)).unwrap();

    exchange.submit_order(limit(u2, Side::Sell, dec!(50000), dec!(1))).unwrap();

    let mut req = limit(u1, Side::Buy, dec!(50000), dec!(2));
    req.time_in_force = TimeInForce::Ioc;
    let outcome = exchange.submit_order(req).unwrap();

    assert_eq!(outcome.trades.len(), 1);
    assert_eq!(outcome.order.status, OrderStatus::Canceled);
    assert_eq!(outcome.order.filled_quantity, dec!(1));
}

/// Scenario 3: a FOK buy that cannot be entirely filled trades nothing.
#[test]
fn fok_buy_expires_with_zero_trades_when_book_cannot_cover_it() {
    let exchange = exchange();
    let (u1, _) = exchange.register_user();
    let (u2, _) = exchange.register_user();
    exchange.deposit(u1, "USDT", dec!(100000)).unwrap();
    exchange.deposit(u2, "BTC", dec!(1)).unwrap();

    exchange.submit_order(limit(u2, Side::Sell, dec!(50000), dec!(1))).unwrap();

    let u1_before = exchange.accounts.balance_of(u1, "USDT").unwrap();

    let mut req = limit(u1, Side::Buy, dec!(50000), dec!(2));
    req.time_in_force = TimeInForce::Fok;
    let outcome = exchange.submit_order(req).unwrap();

    assert!(outcome.trades.is_empty());
    assert_eq!(outcome.order.status, OrderStatus::Expired);
    let u1_after = exchange.accounts.balance_of(u1, "USDT").unwrap();
    assert_eq!(u1_before.free, u1_after.free);
}

/// Scenario 4: self-trade prevention in EXPIRE_TAKER mode cancels the taker
/// without touching the resting maker order.
#[test]
fn stp_expire_taker_cancels_incoming_order_leaving_resting_order_untouched() {
    let exchange = exchange();
    let (u1, _) = exchange.register_user();
    exchange.deposit(u1, "BTC", dec!(1)).unwrap();
    exchange.deposit(u1, "USDT", dec!(100000)).unwrap();

    let resting = exchange.submit_order(limit(u1, Side::Sell, dec!(50000), dec!(1))).unwrap();
    assert_eq!(resting.order.status, OrderStatus::New);

    let mut req = limit(u1, Side::Buy, dec!(50000), dec!(0.5));
    req.self_trade_prevention = SelfTradePrevention::ExpireTaker;
    let outcome = exchange.submit_order(req).unwrap();

    assert!(outcome.trades.is_empty());
    assert_eq!(outcome.order.status, OrderStatus::ExpiredInMatch);

    let (_, asks) = exchange.market_depth("BTCUSDT", 10).unwrap();
    assert_eq!(asks, vec![(dec!(50000), dec!(1))]);
}

/// Scenario 5: price-match OPPONENT resolves to the opposite side's best
/// price before reservation and matching.
#[test]
fn price_match_opponent_trades_at_best_ask() {
    let exchange = exchange();
    let (u1, _) = exchange.register_user();
    let (u2, _) = exchange.register_user();
    exchange.deposit(u1, "USDT", dec!(1000000)).unwrap();
    exchange.deposit(u2, "BTC", dec!(100)).unwrap();

    exchange.submit_order(limit(u2, Side::Sell, dec!(50010), dec!(10))).unwrap();
    exchange.submit_order(limit(u2, Side::Sell, dec!(50015), dec!(5))).unwrap();

    let mut req = limit(u1, Side::Buy, dec!(0), dec!(3));
    req.price = None;
    req.price_match = PriceMatch::Opponent;
    let outcome = exchange.submit_order(req).unwrap();

    assert_eq!(outcome.trades.len(), 1);
    assert_eq!(outcome.trades[0].price, dec!(50010));
    assert_eq!(outcome.trades[0].quantity, dec!(3));
}

/// Scenario 6: deterministic replay — two independently registered callbacks
/// observe the identical merged sequence, and the virtual clock tracks the
/// replay cursor at every emission.
#[test]
fn replay_drives_virtual_clock_and_fans_out_identically_to_every_callback() {
    let clock = Arc::new(TimeManager::backtest(0));
    let controller: ReplayController<(&'static str, i64)> = ReplayController::new(clock.clone());
    controller.add_source(Box::new(VecSource::new(vec![
        (1_000, ("tick", 1)),
        (2_000, ("tick", 2)),
        (3_000, ("tick", 3)),
    ])));

    let seen_a = Arc::new(Mutex::new(Vec::new()));
    let seen_b = Arc::new(Mutex::new(Vec::new()));
    let clock_a = clock.clone();
    let clock_b = clock.clone();
    let seen_a_clone = seen_a.clone();
    let seen_b_clone = seen_b.clone();

    controller.register_callback(move |_src, payload: &(&'static str, i64)| {
        seen_a_clone.lock().unwrap().push((payload.1, clock_a.now_ms()));
    });
    controller.register_callback(move |_src, payload: &(&'static str, i64)| {
        seen_b_clone.lock().unwrap().push((payload.1, clock_b.now_ms()));
    });

    let emitted = controller.process_all_sync();
    assert_eq!(emitted.len(), 3);

    let a = seen_a.lock().unwrap().clone();
    let b = seen_b.lock().unwrap().clone();
    assert_eq!(a, b);
    assert_eq!(a, vec![(1, 1_000), (2, 2_000), (3, 3_000)]);
    assert_eq!(clock.now_ms(), 3_000);
}

/// Cancelling a `LIMIT` order returns exactly the reserved-but-unfilled
/// portion of the quote asset, per the round-trip law in the scenario
/// catalog.
#[test]
fn cancelling_a_partially_filled_buy_releases_only_the_unfilled_reservation() {
    let exchange = exchange();
    let (u1, _) = exchange.register_user();
    let (u2, _) = exchange.register_user();
    exchange.deposit(u1, "USDT", dec!(100000)).unwrap();
    exchange.deposit(u2, "BTC", dec!(1)).unwrap();

    let free_before = exchange.accounts.balance_of(u1, "USDT").unwrap().free;

    exchange.submit_order(limit(u2, Side::Sell, dec!(50000), dec!(0.4))).unwrap();
    let outcome = exchange.submit_order(limit(u1, Side::Buy, dec!(50000), dec!(1))).unwrap();
    assert_eq!(outcome.order.status, OrderStatus::PartiallyFilled);

    exchange
        .cancel_order(u1, "BTCUSDT", OrderLookup::Id(outcome.order.order_id))
        .unwrap();

    let free_after = exchange.accounts.balance_of(u1, "USDT").unwrap().free;
    assert_eq!(free_before - free_after, dec!(50000) * dec!(0.4));
}
