//! REST handlers for the Binance Spot v3-compatible surface.
//!
//! Handler signatures follow the teacher's `api::routes` convention
//! (`Query<T>`/`State<AppState>` extractors, `Result<Json<T>, ExchangeError>`
//! returns) generalized from their signal/backtest endpoints to the
//! exchange's order/account/market-data endpoints.

use std::collections::HashMap;

use axum::extract::{Query, State};
use axum::Json;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::ExchangeError;
use crate::exchange::types::{OrderType, PriceMatch, Side, SelfTradePrevention, TimeInForce};
use crate::exchange::matching::OrderRequest;
use crate::AppState;

use super::auth::verify_signed_request;

fn d(value: Decimal) -> String {
    value.normalize().to_string()
}

#[derive(Serialize)]
pub struct PingResponse {}

pub async fn ping() -> Json<PingResponse> {
    Json(PingResponse {})
}

#[derive(Serialize)]
pub struct ServerTimeResponse {
    #[serde(rename = "serverTime")]
    server_time: i64,
}

pub async fn server_time(State(state): State<AppState>) -> Json<ServerTimeResponse> {
    Json(ServerTimeResponse {
        server_time: state.exchange.clock.now_ms(),
    })
}

#[derive(Serialize)]
pub struct SymbolInfo {
    symbol: String,
    #[serde(rename = "baseAsset")]
    base_asset: String,
    #[serde(rename = "quoteAsset")]
    quote_asset: String,
}

#[derive(Serialize)]
pub struct ExchangeInfoResponse {
    #[serde(rename = "serverTime")]
    server_time: i64,
    symbols: Vec<SymbolInfo>,
}

pub async fn exchange_info(State(state): State<AppState>) -> Json<ExchangeInfoResponse> {
    let symbols = state
        .symbol_specs
        .read()
        .unwrap()
        .values()
        .map(|spec| SymbolInfo {
            symbol: spec.symbol.clone(),
            base_asset: spec.base_asset.clone(),
            quote_asset: spec.quote_asset.clone(),
        })
        .collect();
    Json(ExchangeInfoResponse {
        server_time: state.exchange.clock.now_ms(),
        symbols,
    })
}

#[derive(Deserialize)]
pub struct SymbolQuery {
    pub symbol: String,
}

#[derive(Serialize)]
pub struct TickerPriceResponse {
    symbol: String,
    price: String,
}

pub async fn ticker_price(
    Query(q): Query<SymbolQuery>,
    State(state): State<AppState>,
) -> Result<Json<TickerPriceResponse>, ExchangeError> {
    let price = state
        .exchange
        .ticker(&q.symbol)
        .ok_or_else(|| ExchangeError::UnknownSymbol(q.symbol.clone()))?;
    Ok(Json(TickerPriceResponse {
        symbol: q.symbol,
        price: d(price),
    }))
}

#[derive(Deserialize)]
pub struct DepthQuery {
    pub symbol: String,
    pub limit: Option<usize>,
}

#[derive(Serialize)]
pub struct DepthResponse {
    #[serde(rename = "lastUpdateId")]
    last_update_id: u64,
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

pub async fn depth(
    Query(q): Query<DepthQuery>,
    State(state): State<AppState>,
) -> Result<Json<DepthResponse>, ExchangeError> {
    let limit = q.limit.unwrap_or(state.config.depth_default_limit).min(5000);
    let (bids, asks) = state.exchange.market_depth(&q.symbol, limit)?;
    Ok(Json(DepthResponse {
        last_update_id: state.exchange.matching.last_update_id(&q.symbol)?,
        bids: bids.into_iter().map(|(p, q)| [d(p), d(q)]).collect(),
        asks: asks.into_iter().map(|(p, q)| [d(p), d(q)]).collect(),
    }))
}

#[derive(Deserialize)]
pub struct TradesQuery {
    pub symbol: String,
    pub limit: Option<usize>,
}

#[derive(Serialize)]
pub struct TradeEntry {
    id: u64,
    price: String,
    qty: String,
    #[serde(rename = "quoteQty")]
    quote_qty: String,
    time: i64,
    #[serde(rename = "isBuyerMaker")]
    is_buyer_maker: bool,
}

pub async fn recent_trades(Query(q): Query<TradesQuery>, State(state): State<AppState>) -> Json<Vec<TradeEntry>> {
    let limit = q.limit.unwrap_or(500).min(1000);
    let trades = state.exchange.recent_trades(&q.symbol, limit);
    Json(
        trades
            .into_iter()
            .map(|t| TradeEntry {
                id: t.trade_id,
                price: d(t.price),
                qty: d(t.quantity),
                quote_qty: d(t.quote_quantity),
                time: t.timestamp,
                is_buyer_maker: t.maker_side == Side::Buy,
            })
            .collect(),
    )
}

#[derive(Deserialize)]
pub struct AvgPriceQuery {
    pub symbol: String,
}

#[derive(Serialize)]
pub struct AvgPriceResponse {
    mins: u32,
    price: String,
}

pub async fn avg_price(
    Query(q): Query<AvgPriceQuery>,
    State(state): State<AppState>,
) -> Result<Json<AvgPriceResponse>, ExchangeError> {
    let price = state
        .exchange
        .avg_price(&q.symbol, 5)
        .ok_or_else(|| ExchangeError::UnknownSymbol(q.symbol.clone()))?;
    Ok(Json(AvgPriceResponse { mins: 5, price: d(price) }))
}

#[derive(Serialize)]
pub struct Ticker24hrResponse {
    symbol: String,
    #[serde(rename = "lastPrice")]
    last_price: String,
    #[serde(rename = "openPrice")]
    open_price: String,
    #[serde(rename = "highPrice")]
    high_price: String,
    #[serde(rename = "lowPrice")]
    low_price: String,
    volume: String,
}

pub async fn ticker_24hr(
    Query(q): Query<SymbolQuery>,
    State(state): State<AppState>,
) -> Result<Json<Ticker24hrResponse>, ExchangeError> {
    const ONE_DAY_BARS: usize = 1440;
    let rows = state.exchange.klines(&q.symbol, ONE_DAY_BARS);
    if rows.is_empty() {
        return Err(ExchangeError::UnknownSymbol(q.symbol));
    }
    let open = rows.first().map(|r| r.2).unwrap_or_default();
    let last = rows.last().map(|r| r.5).unwrap_or_default();
    let high = rows.iter().map(|r| r.3).fold(Decimal::MIN, Decimal::max);
    let low = rows.iter().map(|r| r.4).fold(Decimal::MAX, Decimal::min);
    let volume: Decimal = rows.iter().map(|r| r.6).sum();
    Ok(Json(Ticker24hrResponse {
        symbol: q.symbol,
        last_price: d(last),
        open_price: d(open),
        high_price: d(high),
        low_price: d(low),
        volume: d(volume),
    }))
}

#[derive(Deserialize)]
pub struct KlinesQuery {
    pub symbol: String,
    pub interval: Option<String>,
    pub limit: Option<usize>,
}

pub async fn klines(Query(q): Query<KlinesQuery>, State(state): State<AppState>) -> Json<Vec<[String; 12]>> {
    let limit = q.limit.unwrap_or(500).min(1000);
    let rows = state.exchange.klines(&q.symbol, limit);
    let out = rows
        .into_iter()
        .map(|(open_time, close_time, open, high, low, close, volume)| {
            [
                open_time.to_string(),
                d(open),
                d(high),
                d(low),
                d(close),
                d(volume),
                close_time.to_string(),
                "0".to_string(),
                "0".to_string(),
                "0".to_string(),
                "0".to_string(),
                "0".to_string(),
            ]
        })
        .collect();
    Json(out)
}

fn signed_user(
    state: &AppState,
    headers: &HashMap<String, String>,
    query_without_signature: &str,
    signature: &str,
    timestamp: i64,
) -> Result<u64, ExchangeError> {
    let api_key = headers
        .get("x-mbx-apikey")
        .ok_or(ExchangeError::InvalidSignature)?;
    verify_signed_request(
        &state.exchange.accounts,
        api_key,
        api_key,
        query_without_signature,
        signature,
        timestamp,
        state.exchange.clock.now_ms(),
        state.config.recv_window_ms,
    )
}

#[derive(Deserialize)]
pub struct AccountQuery {
    pub timestamp: i64,
    pub signature: String,
}

#[derive(Serialize)]
pub struct BalanceEntry {
    asset: String,
    free: String,
    locked: String,
}

#[derive(Serialize)]
pub struct AccountResponse {
    #[serde(rename = "makerCommission")]
    maker_commission: i32,
    #[serde(rename = "takerCommission")]
    taker_commission: i32,
    #[serde(rename = "updateTime")]
    update_time: i64,
    balances: Vec<BalanceEntry>,
}

pub async fn account(
    axum::extract::RawQuery(raw_query): axum::extract::RawQuery,
    headers: axum::http::HeaderMap,
    Query(q): Query<AccountQuery>,
    State(state): State<AppState>,
) -> Result<Json<AccountResponse>, ExchangeError> {
    let header_map = header_map_to_lower(&headers);
    let without_sig = strip_signature(raw_query.as_deref().unwrap_or(""));
    let user_id = signed_user(&state, &header_map, &without_sig, &q.signature, q.timestamp)?;
    let snapshot = state.exchange.account_info(user_id)?;
    Ok(Json(AccountResponse {
        maker_commission: (state.config.maker_fee_rate * Decimal::from(10_000u32)).to_i32().unwrap_or(0),
        taker_commission: (state.config.taker_fee_rate * Decimal::from(10_000u32)).to_i32().unwrap_or(0),
        update_time: snapshot.update_time,
        balances: snapshot
            .balances
            .into_iter()
            .map(|(asset, bal)| BalanceEntry {
                asset,
                free: d(bal.free),
                locked: d(bal.locked),
            })
            .collect(),
    }))
}

#[derive(Deserialize)]
pub struct NewOrderRequest {
    pub symbol: String,
    pub side: String,
    #[serde(rename = "type")]
    pub order_type: String,
    #[serde(rename = "timeInForce")]
    pub time_in_force: Option<String>,
    pub price: Option<Decimal>,
    #[serde(rename = "stopPrice")]
    pub stop_price: Option<Decimal>,
    pub quantity: Option<Decimal>,
    #[serde(rename = "quoteOrderQty")]
    pub quote_order_qty: Option<Decimal>,
    #[serde(rename = "newClientOrderId")]
    pub new_client_order_id: Option<String>,
    #[serde(rename = "selfTradePreventionMode")]
    pub self_trade_prevention_mode: Option<String>,
    #[serde(rename = "priceMatch")]
    pub price_match: Option<String>,
    pub timestamp: i64,
    pub signature: String,
}

#[derive(Serialize)]
pub struct OrderResponse {
    symbol: String,
    #[serde(rename = "orderId")]
    order_id: u64,
    #[serde(rename = "orderListId")]
    order_list_id: i64,
    #[serde(rename = "clientOrderId")]
    client_order_id: String,
    #[serde(rename = "transactTime")]
    transact_time: i64,
    price: String,
    #[serde(rename = "origQty")]
    orig_qty: String,
    #[serde(rename = "executedQty")]
    executed_qty: String,
    status: String,
    #[serde(rename = "timeInForce")]
    time_in_force: String,
    #[serde(rename = "type")]
    order_type: String,
    side: String,
    fills: Vec<FillEntry>,
}

#[derive(Serialize)]
pub struct FillEntry {
    price: String,
    qty: String,
    commission: String,
    #[serde(rename = "commissionAsset")]
    commission_asset: String,
}

pub async fn new_order(
    axum::extract::RawQuery(raw_query): axum::extract::RawQuery,
    headers: axum::http::HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<NewOrderRequest>,
) -> Result<Json<OrderResponse>, ExchangeError> {
    let header_map = header_map_to_lower(&headers);
    let without_sig = strip_signature(raw_query.as_deref().unwrap_or(""));
    let user_id = signed_user(&state, &header_map, &without_sig, &req.signature, req.timestamp)?;

    let side = match req.side.as_str() {
        "BUY" => Side::Buy,
        "SELL" => Side::Sell,
        _ => return Err(ExchangeError::BadRequest("invalid side".into())),
    };
    let order_type = parse_order_type(&req.order_type)?;
    let time_in_force = match req.time_in_force.as_deref() {
        Some("IOC") => TimeInForce::Ioc,
        Some("FOK") => TimeInForce::Fok,
        _ => TimeInForce::Gtc,
    };
    let stp = match req.self_trade_prevention_mode.as_deref() {
        Some("EXPIRE_TAKER") => SelfTradePrevention::ExpireTaker,
        Some("EXPIRE_MAKER") => SelfTradePrevention::ExpireMaker,
        Some("EXPIRE_BOTH") => SelfTradePrevention::ExpireBoth,
        _ => SelfTradePrevention::None,
    };
    let price_match = match req.price_match.as_deref() {
        Some("OPPONENT") => PriceMatch::Opponent,
        Some("QUEUE") => PriceMatch::Queue,
        _ => PriceMatch::None,
    };

    let order_req = OrderRequest {
        client_order_id: req.new_client_order_id.clone(),
        symbol: req.symbol.clone(),
        user_id,
        side,
        order_type,
        time_in_force,
        price: req.price,
        stop_price: req.stop_price,
        quote_order_qty: req.quote_order_qty,
        quantity: req.quantity,
        self_trade_prevention: stp,
        price_match,
    };

    let outcome = state.exchange.submit_order(order_req)?;
    let order = outcome.order;
    Ok(Json(OrderResponse {
        symbol: order.symbol.clone(),
        order_id: order.order_id,
        order_list_id: -1,
        client_order_id: order.client_order_id.clone().unwrap_or_default(),
        transact_time: order.timestamp,
        price: d(order.price.unwrap_or_default()),
        orig_qty: d(order.quantity),
        executed_qty: d(order.filled_quantity),
        status: status_str(order.status).to_string(),
        time_in_force: req.time_in_force.unwrap_or_else(|| "GTC".into()),
        order_type: req.order_type,
        side: req.side,
        fills: outcome
            .trades
            .into_iter()
            .map(|t| FillEntry {
                price: d(t.price),
                qty: d(t.quantity),
                commission: d(t.commission),
                commission_asset: t.commission_asset,
            })
            .collect(),
    }))
}

fn parse_order_type(raw: &str) -> Result<OrderType, ExchangeError> {
    Ok(match raw {
        "LIMIT" => OrderType::Limit,
        "MARKET" => OrderType::Market,
        "STOP_LOSS" => OrderType::StopLoss,
        "STOP_LOSS_LIMIT" => OrderType::StopLossLimit,
        "TAKE_PROFIT" => OrderType::TakeProfit,
        "TAKE_PROFIT_LIMIT" => OrderType::TakeProfitLimit,
        "LIMIT_MAKER" => OrderType::LimitMaker,
        other => return Err(ExchangeError::BadRequest(format!("unknown order type {other}"))),
    })
}

pub(crate) fn order_type_str(order_type: OrderType) -> &'static str {
    match order_type {
        OrderType::Limit => "LIMIT",
        OrderType::Market => "MARKET",
        OrderType::StopLoss => "STOP_LOSS",
        OrderType::StopLossLimit => "STOP_LOSS_LIMIT",
        OrderType::TakeProfit => "TAKE_PROFIT",
        OrderType::TakeProfitLimit => "TAKE_PROFIT_LIMIT",
        OrderType::LimitMaker => "LIMIT_MAKER",
    }
}

pub(crate) fn tif_str(tif: TimeInForce) -> &'static str {
    match tif {
        TimeInForce::Gtc => "GTC",
        TimeInForce::Ioc => "IOC",
        TimeInForce::Fok => "FOK",
    }
}

fn status_str(status: crate::exchange::types::OrderStatus) -> &'static str {
    use crate::exchange::types::OrderStatus::*;
    match status {
        New => "NEW",
        PartiallyFilled => "PARTIALLY_FILLED",
        Filled => "FILLED",
        Canceled => "CANCELED",
        Rejected => "REJECTED",
        Expired => "EXPIRED",
        ExpiredInMatch => "EXPIRED_IN_MATCH",
    }
}

#[derive(Deserialize)]
pub struct OrderQuery {
    pub symbol: String,
    #[serde(rename = "orderId")]
    pub order_id: Option<u64>,
    #[serde(rename = "origClientOrderId")]
    pub orig_client_order_id: Option<String>,
    pub timestamp: i64,
    pub signature: String,
}

fn resolve_lookup(q: &OrderQuery) -> Result<crate::exchange::matching::OrderLookup, ExchangeError> {
    use crate::exchange::matching::OrderLookup;
    match (q.order_id, &q.orig_client_order_id) {
        (Some(id), _) => Ok(OrderLookup::Id(id)),
        (None, Some(coid)) => Ok(OrderLookup::ClientId(coid.clone())),
        (None, None) => Err(ExchangeError::BadRequest(
            "either orderId or origClientOrderId is required".into(),
        )),
    }
}

fn render_order(order: &crate::exchange::types::Order) -> OrderResponse {
    OrderResponse {
        symbol: order.symbol.clone(),
        order_id: order.order_id,
        order_list_id: -1,
        client_order_id: order.client_order_id.clone().unwrap_or_default(),
        transact_time: order.update_time,
        price: d(order.price.unwrap_or_default()),
        orig_qty: d(order.quantity),
        executed_qty: d(order.filled_quantity),
        status: status_str(order.status).to_string(),
        time_in_force: tif_str(order.time_in_force).to_string(),
        order_type: order_type_str(order.order_type).to_string(),
        side: if order.is_buy() { "BUY".into() } else { "SELL".into() },
        fills: vec![],
    }
}

pub async fn query_order(
    axum::extract::RawQuery(raw_query): axum::extract::RawQuery,
    headers: axum::http::HeaderMap,
    Query(q): Query<OrderQuery>,
    State(state): State<AppState>,
) -> Result<Json<OrderResponse>, ExchangeError> {
    let header_map = header_map_to_lower(&headers);
    let without_sig = strip_signature(raw_query.as_deref().unwrap_or(""));
    let _user_id = signed_user(&state, &header_map, &without_sig, &q.signature, q.timestamp)?;
    let order = state.exchange.query_order(&q.symbol, resolve_lookup(&q)?)?;
    Ok(Json(render_order(&order)))
}

pub async fn cancel_order(
    axum::extract::RawQuery(raw_query): axum::extract::RawQuery,
    headers: axum::http::HeaderMap,
    Query(q): Query<OrderQuery>,
    State(state): State<AppState>,
) -> Result<Json<OrderResponse>, ExchangeError> {
    let header_map = header_map_to_lower(&headers);
    let without_sig = strip_signature(raw_query.as_deref().unwrap_or(""));
    let user_id = signed_user(&state, &header_map, &without_sig, &q.signature, q.timestamp)?;
    let order = state.exchange.cancel_order(user_id, &q.symbol, resolve_lookup(&q)?)?;
    Ok(Json(render_order(&order)))
}

#[derive(Deserialize)]
pub struct OpenOrdersQuery {
    pub symbol: Option<String>,
    pub timestamp: i64,
    pub signature: String,
}

pub async fn open_orders(
    axum::extract::RawQuery(raw_query): axum::extract::RawQuery,
    headers: axum::http::HeaderMap,
    Query(q): Query<OpenOrdersQuery>,
    State(state): State<AppState>,
) -> Result<Json<Vec<OrderResponse>>, ExchangeError> {
    let header_map = header_map_to_lower(&headers);
    let without_sig = strip_signature(raw_query.as_deref().unwrap_or(""));
    let user_id = signed_user(&state, &header_map, &without_sig, &q.signature, q.timestamp)?;
    let orders = state.exchange.open_orders_any(user_id, q.symbol.as_deref())?;
    Ok(Json(orders.iter().map(render_order).collect()))
}

#[derive(Deserialize)]
pub struct AllOrdersQuery {
    pub symbol: String,
    #[serde(rename = "orderId")]
    pub from_id: Option<u64>,
    #[serde(rename = "startTime")]
    pub start_time: Option<i64>,
    #[serde(rename = "endTime")]
    pub end_time: Option<i64>,
    pub limit: Option<usize>,
    pub timestamp: i64,
    pub signature: String,
}

pub async fn all_orders(
    axum::extract::RawQuery(raw_query): axum::extract::RawQuery,
    headers: axum::http::HeaderMap,
    Query(q): Query<AllOrdersQuery>,
    State(state): State<AppState>,
) -> Result<Json<Vec<OrderResponse>>, ExchangeError> {
    let header_map = header_map_to_lower(&headers);
    let without_sig = strip_signature(raw_query.as_deref().unwrap_or(""));
    let user_id = signed_user(&state, &header_map, &without_sig, &q.signature, q.timestamp)?;
    let orders = state.exchange.matching.all_orders(
        &q.symbol,
        user_id,
        q.from_id,
        q.start_time,
        q.end_time,
        q.limit.unwrap_or(500),
    )?;
    Ok(Json(orders.iter().map(render_order).collect()))
}

fn header_map_to_lower(headers: &axum::http::HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_lowercase(), v.to_string())))
        .collect()
}

/// Binance clients sign the full query string then append `&signature=...`;
/// verification covers everything before that trailing parameter.
fn strip_signature(raw_query: &str) -> String {
    match raw_query.rfind("&signature=") {
        Some(idx) => raw_query[..idx].to_string(),
        None => match raw_query.strip_prefix("signature=") {
            Some(_) => String::new(),
            None => raw_query.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_signature_removes_trailing_param() {
        assert_eq!(strip_signature("symbol=BTCUSDT&timestamp=1&signature=abc"), "symbol=BTCUSDT&timestamp=1");
    }

    #[test]
    fn strip_signature_handles_signature_only() {
        assert_eq!(strip_signature("signature=abc"), "");
    }
}
