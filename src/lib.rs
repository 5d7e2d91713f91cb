//! Real-time price alerting: Binance ticker feed, threshold detection against the
//! last seen price, and a WebSocket fan-out of the resulting alerts.

pub mod alerts;
pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod server;
pub mod shutdown;
