//! Core data model: orders, trades, symbols, and balances.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub type OrderId = u64;
pub type UserId = u64;
pub type TradeId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    #[inline]
    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Limit,
    Market,
    StopLoss,
    StopLossLimit,
    TakeProfit,
    TakeProfitLimit,
    LimitMaker,
}

impl OrderType {
    /// Stop/take-profit variants are parked until their trigger price is touched.
    pub fn is_conditional(&self) -> bool {
        matches!(
            self,
            OrderType::StopLoss
                | OrderType::StopLossLimit
                | OrderType::TakeProfit
                | OrderType::TakeProfitLimit
        )
    }

    /// The concrete type a conditional order is resubmitted as once triggered.
    pub fn triggered_type(&self) -> OrderType {
        match self {
            OrderType::StopLoss | OrderType::TakeProfit => OrderType::Market,
            OrderType::StopLossLimit | OrderType::TakeProfitLimit => OrderType::Limit,
            other => *other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    Gtc,
    Ioc,
    Fok,
}

impl Default for TimeInForce {
    fn default() -> Self {
        TimeInForce::Gtc
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelfTradePrevention {
    None,
    ExpireTaker,
    ExpireMaker,
    ExpireBoth,
}

impl Default for SelfTradePrevention {
    fn default() -> Self {
        SelfTradePrevention::None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriceMatch {
    None,
    Opponent,
    Queue,
}

impl Default for PriceMatch {
    fn default() -> Self {
        PriceMatch::None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
    ExpiredInMatch,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Canceled
                | OrderStatus::Rejected
                | OrderStatus::Expired
                | OrderStatus::ExpiredInMatch
        )
    }
}

/// A resting or archived order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: OrderId,
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub user_id: UserId,
    pub side: Side,
    pub order_type: OrderType,
    pub time_in_force: TimeInForce,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub quote_order_qty: Option<Decimal>,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    pub filled_quote_quantity: Decimal,
    pub status: OrderStatus,
    pub self_trade_prevention: SelfTradePrevention,
    pub price_match: PriceMatch,
    pub timestamp: i64,
    pub update_time: i64,
    /// Reservation the AccountManager is holding for this order, in the
    /// asset it was reserved from (quote for BUY, base for SELL). Needed so
    /// `cancel_order`/IOC/MARKET can release exactly the unused portion.
    pub reserved_asset: String,
    pub reserved_amount: Decimal,
}

impl Order {
    #[inline]
    pub fn remaining(&self) -> Decimal {
        self.quantity - self.filled_quantity
    }

    #[inline]
    pub fn is_buy(&self) -> bool {
        matches!(self.side, Side::Buy)
    }
}

/// An executed trade between a maker and a taker order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: TradeId,
    pub symbol: String,
    pub price: Decimal,
    pub quantity: Decimal,
    pub quote_quantity: Decimal,
    pub timestamp: i64,
    pub buy_order_id: OrderId,
    pub sell_order_id: OrderId,
    pub buy_user_id: UserId,
    pub sell_user_id: UserId,
    pub maker_side: Side,
    pub commission: Decimal,
    pub commission_asset: String,
}

/// Filter rules constraining price granularity, quantity granularity and
/// minimum notional value for a symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceFilter {
    pub min: Decimal,
    pub max: Decimal,
    pub tick: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LotFilter {
    pub min: Decimal,
    pub max: Decimal,
    pub step: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolFilters {
    pub price: PriceFilter,
    pub lot: LotFilter,
    pub min_notional: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolSpec {
    pub symbol: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub base_precision: u32,
    pub quote_precision: u32,
    pub filters: SymbolFilters,
}

/// Per-asset balance for a user: `free` is spendable, `locked` is reserved.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Balance {
    pub free: Decimal,
    pub locked: Decimal,
}

impl Balance {
    #[inline]
    pub fn total(&self) -> Decimal {
        self.free + self.locked
    }
}

pub type AssetMap = HashMap<String, Balance>;
