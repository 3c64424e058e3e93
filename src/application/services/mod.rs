pub mod decision_engine;
pub mod market_data;
pub mod order_gateway;
pub mod position_monitor;
