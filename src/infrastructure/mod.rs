pub mod broker_registry;
pub mod file_signal_source;
pub mod http_market_data;
pub mod mock;
pub mod rest_broker;
