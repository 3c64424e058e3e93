//! Swing trading engine
//!
//! Turns scanner plans into sized, risk-gated trades, routes their orders to
//! brokers (or records them in paper mode), and manages every open position
//! until exit while keeping the capital ledger consistent.

pub mod api;
pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod persistence;
