//! WebSocket upgrade handler and per-connection subscription management.
//!
//! Grounded on the teacher's `main.rs::websocket_handler`/`handle_socket`:
//! `ws.on_upgrade` into a loop that `tokio::select!`s between a broadcast
//! receiver and inbound client frames, replying to `{"type":"ping",...}`
//! with a matching pong. Generalized from the teacher's single implicit
//! "subscribe to everything" stream to Binance's explicit
//! `SUBSCRIBE`/`UNSUBSCRIBE` method frames over per-stream-name channels.

use std::collections::HashSet;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

use crate::exchange::facade::{MarketEvent, UserEvent};
use crate::exchange::types::UserId;
use crate::AppState;

use super::streams::{AccountUpdatePayload, BalanceUpdate, OrderUpdatePayload, TradeStreamPayload};

/// Private user-data streams authenticate by passing the account's API key
/// as a query parameter on the upgrade request, e.g. `/ws?apiKey=...`,
/// mirroring the teacher's own query-param-authenticated upgrade in
/// `main.rs::websocket_handler` (adapted there from a single shared scraper
/// token to Binance's per-user API key).
#[derive(Debug, Deserialize)]
pub struct WsAuthQuery {
    #[serde(rename = "apiKey")]
    pub api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "method", rename_all = "UPPERCASE")]
enum ClientRequest {
    Subscribe { params: Vec<String>, id: u64 },
    Unsubscribe { params: Vec<String>, id: u64 },
}

#[derive(Debug, Serialize)]
struct AckResponse {
    result: Option<Vec<String>>,
    id: u64,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorBody,
    id: u64,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: i32,
    msg: String,
}

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(auth): Query<WsAuthQuery>,
    State(state): State<AppState>,
) -> Response {
    let user_id = auth
        .api_key
        .as_deref()
        .and_then(|key| state.exchange.accounts.resolve_api_key(key));
    ws.on_upgrade(move |socket| handle_socket(socket, state, user_id))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, user_id: Option<UserId>) {
    let mut subscriptions: HashSet<String> = HashSet::new();
    let mut market_rx = state.market_broadcast.subscribe();
    let mut user_rx = state.user_broadcast.subscribe();

    loop {
        tokio::select! {
            Ok(event) = market_rx.recv() => {
                if let Some(text) = render_market_event(&event, &subscriptions, state.exchange.clock.now_ms()) {
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
            }
            Ok((event_user_id, event)) = user_rx.recv(), if user_id.is_some() => {
                if Some(event_user_id) != user_id {
                    continue;
                }
                if let Some(text) = render_user_event(&event, state.exchange.clock.now_ms()) {
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if !handle_client_text(&mut socket, &text, &mut subscriptions, &state).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(?err, "websocket receive error");
                        break;
                    }
                }
            }
        }
    }

    release_subscriptions(&state, &subscriptions);
}

/// The symbol a stream name like `btcusdt@trade` or `btcusdt@kline_1m`
/// subscribes to, lowercased to match the registry keys used elsewhere.
fn stream_symbol(stream: &str) -> &str {
    stream.split('@').next().unwrap_or(stream)
}

/// Attempts to admit one more subscriber to `stream`'s symbol, honoring
/// `max_clients_per_symbol` (0 = unlimited). Returns whether admission
/// succeeded; on success the caller now owns one slot it must later release
/// via `release_subscriptions`.
fn try_admit_subscriber(state: &AppState, stream: &str) -> bool {
    let limit = state.config.max_clients_per_symbol;
    if limit == 0 {
        return true;
    }
    let mut counts = state.symbol_subscriber_counts.write().unwrap();
    let count = counts.entry(stream_symbol(stream).to_string()).or_insert(0);
    if *count >= limit {
        return false;
    }
    *count += 1;
    true
}

fn release_subscriptions(state: &AppState, subscriptions: &HashSet<String>) {
    if state.config.max_clients_per_symbol == 0 {
        return;
    }
    let mut counts = state.symbol_subscriber_counts.write().unwrap();
    for stream in subscriptions {
        if let Some(count) = counts.get_mut(stream_symbol(stream)) {
            *count = count.saturating_sub(1);
        }
    }
}

/// Handles one inbound text frame. Returns `false` if the connection should close.
async fn handle_client_text(
    socket: &mut WebSocket,
    text: &str,
    subscriptions: &mut HashSet<String>,
    state: &AppState,
) -> bool {
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(text) {
        if json.get("type").and_then(|t| t.as_str()) == Some("ping") {
            let timestamp = json
                .get("data")
                .and_then(|d| d.get("timestamp"))
                .and_then(|t| t.as_i64())
                .unwrap_or(0);
            let pong = serde_json::json!({"type": "pong", "data": {"timestamp": timestamp}});
            return socket.send(Message::Text(pong.to_string())).await.is_ok();
        }
        if let Ok(req) = serde_json::from_value::<ClientRequest>(json) {
            match req {
                ClientRequest::Subscribe { params, id } => {
                    for p in &params {
                        if subscriptions.contains(p) {
                            continue;
                        }
                        if !try_admit_subscriber(state, p) {
                            let err = ErrorResponse {
                                error: ErrorBody {
                                    code: -1003,
                                    msg: format!("max_clients_per_symbol exceeded for {p}"),
                                },
                                id,
                            };
                            if socket
                                .send(Message::Text(serde_json::to_string(&err).unwrap_or_default()))
                                .await
                                .is_err()
                            {
                                return false;
                            }
                            continue;
                        }
                        subscriptions.insert(p.clone());
                    }
                    let ack = AckResponse { result: None, id };
                    return socket
                        .send(Message::Text(serde_json::to_string(&ack).unwrap_or_default()))
                        .await
                        .is_ok();
                }
                ClientRequest::Unsubscribe { params, id } => {
                    for p in &params {
                        if subscriptions.remove(p) {
                            release_subscriptions(state, &HashSet::from([p.clone()]));
                        }
                    }
                    let ack = AckResponse { result: None, id };
                    return socket
                        .send(Message::Text(serde_json::to_string(&ack).unwrap_or_default()))
                        .await
                        .is_ok();
                }
            }
        }
    } else if text == "ping" {
        return socket.send(Message::Text("pong".to_string())).await.is_ok();
    }
    true
}

fn render_market_event(event: &MarketEvent, subscriptions: &HashSet<String>, now_ms: i64) -> Option<String> {
    match event {
        MarketEvent::Trade(trade) => {
            let stream = format!("{}@trade", trade.symbol.to_lowercase());
            if !subscriptions.contains(&stream) {
                return None;
            }
            let payload = TradeStreamPayload::from_trade(trade);
            serde_json::to_string(&envelope(&stream, &payload)).ok()
        }
        MarketEvent::DepthUpdate { symbol, first_update_id, last_update_id, bids, asks } => {
            let stream = format!("{}@depth", symbol.to_lowercase());
            if !subscriptions.contains(&stream) {
                return None;
            }
            let payload = super::streams::DepthStreamPayload {
                e: "depthUpdate",
                event_time: now_ms,
                s: symbol.clone(),
                first_update_id: *first_update_id,
                u: *last_update_id,
                b: bids.iter().map(|(p, q)| [fmt_dec(*p), fmt_dec(*q)]).collect(),
                a: asks.iter().map(|(p, q)| [fmt_dec(*p), fmt_dec(*q)]).collect(),
            };
            serde_json::to_string(&envelope(&stream, &payload)).ok()
        }
        MarketEvent::Ticker { symbol, last_price } => {
            let stream = format!("{}@ticker", symbol.to_lowercase());
            if !subscriptions.contains(&stream) {
                return None;
            }
            let payload = super::streams::TickerStreamPayload {
                e: "24hrTicker",
                event_time: now_ms,
                s: symbol.clone(),
                c: fmt_dec(*last_price),
            };
            serde_json::to_string(&envelope(&stream, &payload)).ok()
        }
    }
}

fn fmt_dec(value: rust_decimal::Decimal) -> String {
    value.normalize().to_string()
}

fn envelope<T: Serialize>(stream: &str, data: &T) -> serde_json::Value {
    serde_json::json!({ "stream": stream, "data": data })
}

/// Renders a private per-user event onto the single user-data channel.
/// Unlike public streams, subscription isn't required: once connected with
/// a resolved `apiKey`, a user receives every `executionReport`/trade update
/// for their own orders, matching Binance's real user-data-stream semantics
/// (one implicit channel, not per-stream-name `SUBSCRIBE`).
fn render_user_event(event: &UserEvent, now_ms: i64) -> Option<String> {
    match event {
        UserEvent::OrderUpdate(order) => {
            let payload = OrderUpdatePayload::from_order(order, now_ms);
            serde_json::to_string(&envelope("executionReport", &payload)).ok()
        }
        UserEvent::TradeUpdate(trade) => {
            let payload = TradeStreamPayload::from_trade(trade);
            serde_json::to_string(&envelope("trade", &payload)).ok()
        }
        UserEvent::AccountUpdate(snapshot) => {
            let payload = AccountUpdatePayload {
                e: "outboundAccountPosition",
                event_time: now_ms,
                balances: snapshot
                    .balances
                    .iter()
                    .map(|(asset, bal)| BalanceUpdate { a: asset.clone(), f: fmt_dec(bal.free), l: fmt_dec(bal.locked) })
                    .collect(),
            };
            serde_json::to_string(&envelope("outboundAccountPosition", &payload)).ok()
        }
    }
}

/// Spawned once per `VirtualExchange`; bridges its callback-based
/// `subscribe_market`/`subscribe_user` fan-out into a `tokio::broadcast`
/// channel WS connections can each subscribe to independently.
pub fn bridge_exchange_events(
    exchange: &crate::exchange::VirtualExchange,
    market_tx: broadcast::Sender<MarketEvent>,
    user_tx: broadcast::Sender<(u64, UserEvent)>,
) {
    exchange.subscribe_market(
        "",
        Box::new(move |_symbol, event| {
            let _ = market_tx.send(event.clone());
        }),
    );
    exchange.subscribe_user(Box::new(move |user_id, event| {
        let _ = user_tx.send((user_id, event.clone()));
    }));
}
