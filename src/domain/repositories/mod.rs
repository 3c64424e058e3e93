pub mod broker_client;
pub mod market_data;
pub mod signal_source;
