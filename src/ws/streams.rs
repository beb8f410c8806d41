//! Binance-shaped WebSocket payload types for public market-data streams
//! and private order/account/trade update streams.

use serde::Serialize;

use crate::exchange::types::{Order, OrderStatus, Trade};
use crate::rest::handlers::{order_type_str, tif_str};

fn d(value: rust_decimal::Decimal) -> String {
    value.normalize().to_string()
}

/// `<symbol>@trade` stream payload.
#[derive(Debug, Clone, Serialize)]
pub struct TradeStreamPayload {
    pub e: &'static str,
    #[serde(rename = "E")]
    pub event_time: i64,
    pub s: String,
    pub t: u64,
    pub p: String,
    pub q: String,
    #[serde(rename = "T")]
    pub trade_time: i64,
    pub m: bool,
}

impl TradeStreamPayload {
    pub fn from_trade(trade: &Trade) -> Self {
        Self {
            e: "trade",
            event_time: trade.timestamp,
            s: trade.symbol.clone(),
            t: trade.trade_id,
            p: d(trade.price),
            q: d(trade.quantity),
            trade_time: trade.timestamp,
            m: trade.maker_side == crate::exchange::types::Side::Buy,
        }
    }
}

/// `<symbol>@depth` diff-depth stream payload.
#[derive(Debug, Clone, Serialize)]
pub struct DepthStreamPayload {
    pub e: &'static str,
    #[serde(rename = "E")]
    pub event_time: i64,
    pub s: String,
    #[serde(rename = "U")]
    pub first_update_id: u64,
    pub u: u64,
    pub b: Vec<[String; 2]>,
    pub a: Vec<[String; 2]>,
}

/// `<symbol>@ticker` stream payload (abbreviated 24hr ticker).
#[derive(Debug, Clone, Serialize)]
pub struct TickerStreamPayload {
    pub e: &'static str,
    #[serde(rename = "E")]
    pub event_time: i64,
    pub s: String,
    pub c: String,
}

/// Private order-update stream payload. `c_t` is the change type spec'd
/// alongside the full order snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct OrderUpdatePayload {
    pub e: &'static str,
    #[serde(rename = "E")]
    pub event_time: i64,
    pub s: String,
    pub i: u64,
    pub c: Option<String>,
    #[serde(rename = "S")]
    pub side: String,
    pub o: String,
    pub f: String,
    pub q: String,
    pub p: String,
    pub z: String,
    pub x: String,
    #[serde(rename = "c_t")]
    pub change_type: &'static str,
}

impl OrderUpdatePayload {
    pub fn from_order(order: &Order, now_ms: i64) -> Self {
        let change_type = status_to_change_type(order.status);
        Self {
            e: "executionReport",
            event_time: now_ms,
            s: order.symbol.clone(),
            i: order.order_id,
            c: order.client_order_id.clone(),
            side: if order.is_buy() { "BUY".into() } else { "SELL".into() },
            o: order_type_str(order.order_type).to_string(),
            f: tif_str(order.time_in_force).to_string(),
            q: d(order.quantity),
            p: order.price.map(d).unwrap_or_else(|| "0".to_string()),
            z: d(order.filled_quantity),
            x: change_type.to_string(),
            change_type,
        }
    }
}

/// Maps an order's terminal/non-terminal status to the spec's `c_t`
/// change-type enum (distinct from Binance's own `x` execution-type field,
/// which this crate's single-pass-per-match discipline keeps identical to it).
pub fn status_to_change_type(status: OrderStatus) -> &'static str {
    match status {
        OrderStatus::New => "NEW",
        OrderStatus::PartiallyFilled => "TRADE",
        OrderStatus::Filled => "TRADE",
        OrderStatus::Canceled => "CANCELED",
        OrderStatus::Rejected => "REJECTED",
        OrderStatus::Expired => "EXPIRED",
        OrderStatus::ExpiredInMatch => "EXPIRED_IN_MATCH",
    }
}

/// Private account (balance) update stream payload.
#[derive(Debug, Clone, Serialize)]
pub struct AccountUpdatePayload {
    pub e: &'static str,
    #[serde(rename = "E")]
    pub event_time: i64,
    pub balances: Vec<BalanceUpdate>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BalanceUpdate {
    pub a: String,
    pub f: String,
    pub l: String,
}
