//! Book Mirror Library
//!
//! Keeps a consistent, low-latency mirror of many order books fed by one
//! multiplexed WebSocket connection. Exposes the pipeline for the binary
//! and tests.

pub mod api;
pub mod config;
pub mod mirror;
pub mod models;

pub use config::MirrorConfig;
pub use mirror::{BookMirror, BookStore, SubscriptionDiff, TradeNotice, TransportState};
pub use models::{AssetSubscription, BookState, ConnectionStatus, Intent, LastTrade, OrderLevel};
