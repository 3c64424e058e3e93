pub mod order;
pub mod plan;
pub mod run_state;
pub mod settings;
pub mod trade;
