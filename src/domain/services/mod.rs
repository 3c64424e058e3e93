pub mod circuit_breaker;
pub mod confidence;
pub mod exit_rules;
pub mod retry;
pub mod risk;
