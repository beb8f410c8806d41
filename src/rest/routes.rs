//! REST router assembly: `axum::Router` + `CorsLayer` + `TraceLayer`,
//! matching the teacher's `main.rs` router composition
//! (`Router::new().route(...).layer(CorsLayer::permissive())`).

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::AppState;

use super::handlers;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v3/ping", get(handlers::ping))
        .route("/api/v3/time", get(handlers::server_time))
        .route("/api/v3/exchangeInfo", get(handlers::exchange_info))
        .route("/api/v3/ticker/price", get(handlers::ticker_price))
        .route("/api/v3/ticker/24hr", get(handlers::ticker_24hr))
        .route("/api/v3/depth", get(handlers::depth))
        .route("/api/v3/trades", get(handlers::recent_trades))
        .route("/api/v3/klines", get(handlers::klines))
        .route("/api/v3/avgPrice", get(handlers::avg_price))
        .route("/api/v3/account", get(handlers::account))
        .route(
            "/api/v3/order",
            post(handlers::new_order)
                .get(handlers::query_order)
                .delete(handlers::cancel_order),
        )
        .route("/api/v3/openOrders", get(handlers::open_orders))
        .route("/api/v3/allOrders", get(handlers::all_orders))
        .route("/ws", get(crate::ws::server::websocket_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
