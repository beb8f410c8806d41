//! Price-time-priority limit order book.
//!
//! Two price-keyed ordered maps (bids descending, asks ascending), each
//! holding a FIFO of resting orders at that price. Grounded on the teacher's
//! `backtest_v2::matching::LimitOrderBook` / `PriceLevel` shape, adapted from
//! an integer-tick price representation to `rust_decimal::Decimal` directly
//! (ordered natively, no tick-conversion table needed) and from the
//! teacher's standalone `BookOrder` to this crate's full `Order`.

use std::collections::{BTreeMap, VecDeque};

use rust_decimal::Decimal;

use super::types::{Order, OrderId, Side};

/// A single price level: the FIFO of resting orders and their aggregate size.
#[derive(Debug, Default)]
pub struct PriceLevel {
    pub orders: VecDeque<Order>,
    pub total_remaining: Decimal,
}

impl PriceLevel {
    fn push_back(&mut self, order: Order) {
        self.total_remaining += order.remaining();
        self.orders.push_back(order);
    }

    fn front(&self) -> Option<&Order> {
        self.orders.front()
    }

    fn front_mut(&mut self) -> Option<&mut Order> {
        self.orders.front_mut()
    }

    /// Remove the front order unconditionally (fully filled or cancelled).
    fn pop_front(&mut self) -> Option<Order> {
        let order = self.orders.pop_front()?;
        self.total_remaining -= order.remaining();
        Some(order)
    }

    fn remove(&mut self, order_id: OrderId) -> Option<Order> {
        let idx = self.orders.iter().position(|o| o.order_id == order_id)?;
        let order = self.orders.remove(idx)?;
        self.total_remaining -= order.remaining();
        Some(order)
    }

    fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }
}

/// Reverse-ordered key so bid prices iterate highest-first in a `BTreeMap`,
/// which otherwise only offers ascending iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct BidKey(std::cmp::Reverse<Decimal>);

impl BidKey {
    fn new(price: Decimal) -> Self {
        BidKey(std::cmp::Reverse(price))
    }

    fn price(&self) -> Decimal {
        self.0 .0
    }
}

#[derive(Debug, Clone, Copy)]
struct OrderLocation {
    side: Side,
    price: Decimal,
}

/// Resting-order book for a single symbol.
#[derive(Debug, Default)]
pub struct OrderBook {
    bids: BTreeMap<BidKey, PriceLevel>,
    asks: BTreeMap<Decimal, PriceLevel>,
    locations: std::collections::HashMap<OrderId, OrderLocation>,
    last_update_id: u64,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn last_update_id(&self) -> u64 {
        self.last_update_id
    }

    fn bump(&mut self) -> u64 {
        self.last_update_id += 1;
        self.last_update_id
    }

    /// Insert a resting order. Caller must set `price` to the effective
    /// (possibly price-matched) limit price before calling.
    pub fn insert(&mut self, order: Order) {
        let price = order.price.expect("resting order must carry a price");
        let side = order.side;
        self.locations.insert(
            order.order_id,
            OrderLocation { side, price },
        );
        match side {
            Side::Buy => self
                .bids
                .entry(BidKey::new(price))
                .or_default()
                .push_back(order),
            Side::Sell => self.asks.entry(price).or_default().push_back(order),
        }
        self.bump();
    }

    /// Remove an order by id, wherever it rests. Returns it if found.
    pub fn remove(&mut self, order_id: OrderId) -> Option<Order> {
        let loc = self.locations.remove(&order_id)?;
        let removed = match loc.side {
            Side::Buy => {
                let key = BidKey::new(loc.price);
                let level = self.bids.get_mut(&key)?;
                let order = level.remove(order_id);
                if level.is_empty() {
                    self.bids.remove(&key);
                }
                order
            }
            Side::Sell => {
                let level = self.asks.get_mut(&loc.price)?;
                let order = level.remove(order_id);
                if level.is_empty() {
                    self.asks.remove(&loc.price);
                }
                order
            }
        };
        if removed.is_some() {
            self.bump();
        }
        removed
    }

    /// Best (highest bid / lowest ask) price on a side, if any.
    pub fn best_price(&self, side: Side) -> Option<Decimal> {
        match side {
            Side::Buy => self.bids.keys().next().map(|k| k.price()),
            Side::Sell => self.asks.keys().next().copied(),
        }
    }

    /// Mutable access to the resting front order opposite `side`, i.e. the
    /// order the matching loop would trade against next.
    pub fn front_opposite_mut(&mut self, side: Side) -> Option<&mut Order> {
        match side.opposite() {
            Side::Buy => self.bids.values_mut().next()?.front_mut(),
            Side::Sell => self.asks.values_mut().next()?.front_mut(),
        }
    }

    pub fn best_level_price(&self, side: Side) -> Option<Decimal> {
        self.best_price(side)
    }

    /// Pop the front resting order at the best level on `side` (used once it
    /// has been fully filled during matching).
    pub fn pop_best(&mut self, side: Side) -> Option<Order> {
        let popped = match side {
            Side::Buy => {
                let key = *self.bids.keys().next()?;
                let level = self.bids.get_mut(&key)?;
                let order = level.pop_front();
                if level.is_empty() {
                    self.bids.remove(&key);
                }
                order
            }
            Side::Sell => {
                let price = *self.asks.keys().next()?;
                let level = self.asks.get_mut(&price)?;
                let order = level.pop_front();
                if level.is_empty() {
                    self.asks.remove(&price);
                }
                order
            }
        };
        if let Some(ref o) = popped {
            self.locations.remove(&o.order_id);
            self.bump();
        }
        popped
    }

    /// Decrement the level's aggregate remaining size on `side` by `qty`
    /// without removing the front order (partial fill). The front order's
    /// own `filled_quantity` is the caller's responsibility — it already
    /// mutated it via `front_opposite_mut` before calling this, so this
    /// only reconciles the level-aggregate view of resting size.
    pub fn reduce_best_front(&mut self, side: Side, filled_qty: Decimal) {
        let level = match side {
            Side::Buy => self.bids.values_mut().next(),
            Side::Sell => self.asks.values_mut().next(),
        };
        if let Some(level) = level {
            level.total_remaining -= filled_qty;
        }
        self.bump();
    }

    pub fn is_empty_side(&self, side: Side) -> bool {
        match side {
            Side::Buy => self.bids.is_empty(),
            Side::Sell => self.asks.is_empty(),
        }
    }

    /// Top `n` levels per side as `(price, total_remaining)`, price-ordered
    /// (bids descending, asks ascending).
    pub fn depth(&self, n: usize) -> (Vec<(Decimal, Decimal)>, Vec<(Decimal, Decimal)>) {
        let bids = self
            .bids
            .iter()
            .take(n)
            .map(|(k, l)| (k.price(), l.total_remaining))
            .collect();
        let asks = self
            .asks
            .iter()
            .take(n)
            .map(|(p, l)| (*p, l.total_remaining))
            .collect();
        (bids, asks)
    }

    pub fn order_count(&self) -> usize {
        self.locations.len()
    }

    /// Every resting order across both sides, in no particular cross-side
    /// order (each side is still price-time ordered within itself). Used by
    /// `open_orders` queries, which need per-order identity that `depth`
    /// deliberately discards.
    pub fn iter_orders(&self) -> impl Iterator<Item = &Order> {
        self.bids
            .values()
            .flat_map(|level| level.orders.iter())
            .chain(self.asks.values().flat_map(|level| level.orders.iter()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::types::{OrderStatus, OrderType, PriceMatch, SelfTradePrevention, TimeInForce};
    use rust_decimal_macros::dec;

    fn order(id: OrderId, side: Side, price: Decimal, qty: Decimal) -> Order {
        Order {
            order_id: id,
            client_order_id: None,
            symbol: "BTCUSDT".into(),
            user_id: 1,
            side,
            order_type: OrderType::Limit,
            time_in_force: TimeInForce::Gtc,
            price: Some(price),
            stop_price: None,
            quote_order_qty: None,
            quantity: qty,
            filled_quantity: Decimal::ZERO,
            filled_quote_quantity: Decimal::ZERO,
            status: OrderStatus::New,
            self_trade_prevention: SelfTradePrevention::None,
            price_match: PriceMatch::None,
            timestamp: 0,
            update_time: 0,
            reserved_asset: "USDT".into(),
            reserved_amount: Decimal::ZERO,
        }
    }

    #[test]
    fn bids_iterate_highest_first() {
        let mut book = OrderBook::new();
        book.insert(order(1, Side::Buy, dec!(100), dec!(1)));
        book.insert(order(2, Side::Buy, dec!(101), dec!(1)));
        book.insert(order(3, Side::Buy, dec!(99), dec!(1)));
        assert_eq!(book.best_price(Side::Buy), Some(dec!(101)));
    }

    #[test]
    fn asks_iterate_lowest_first() {
        let mut book = OrderBook::new();
        book.insert(order(1, Side::Sell, dec!(100), dec!(1)));
        book.insert(order(2, Side::Sell, dec!(98), dec!(1)));
        assert_eq!(book.best_price(Side::Sell), Some(dec!(98)));
    }

    #[test]
    fn remove_clears_empty_level() {
        let mut book = OrderBook::new();
        book.insert(order(1, Side::Buy, dec!(100), dec!(1)));
        book.remove(1);
        assert!(book.is_empty_side(Side::Buy));
        assert_eq!(book.order_count(), 0);
    }

    #[test]
    fn depth_sums_remaining_per_level() {
        let mut book = OrderBook::new();
        book.insert(order(1, Side::Buy, dec!(100), dec!(1)));
        book.insert(order(2, Side::Buy, dec!(100), dec!(2)));
        let (bids, _) = book.depth(5);
        assert_eq!(bids, vec![(dec!(100), dec!(3))]);
    }

    #[test]
    fn last_update_id_increases_monotonically() {
        let mut book = OrderBook::new();
        let before = book.last_update_id();
        book.insert(order(1, Side::Buy, dec!(100), dec!(1)));
        assert!(book.last_update_id() > before);
        book.remove(1);
        assert!(book.last_update_id() > before + 1);
    }

    #[test]
    fn fifo_within_a_price_level() {
        let mut book = OrderBook::new();
        book.insert(order(1, Side::Buy, dec!(100), dec!(1)));
        book.insert(order(2, Side::Buy, dec!(100), dec!(1)));
        let popped = book.pop_best(Side::Buy).unwrap();
        assert_eq!(popped.order_id, 1);
    }
}
