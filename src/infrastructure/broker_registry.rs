//! Broker Registry
//!
//! Broker clients in routing priority order, each paired with its own
//! circuit breaker. Built once at startup from configuration and shared by
//! the order gateway; routing never branches on broker names.

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::BrokerEndpoint;
use crate::domain::repositories::broker_client::BrokerClient;
use crate::domain::services::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::infrastructure::rest_broker::{RestBroker, RestBrokerConfig};

#[derive(Clone)]
pub struct RegisteredBroker {
    pub client: Arc<dyn BrokerClient>,
    pub breaker: CircuitBreaker,
}

impl RegisteredBroker {
    pub fn name(&self) -> &str {
        self.client.name()
    }
}

pub struct BrokerRegistry {
    breaker_config: CircuitBreakerConfig,
    brokers: Vec<RegisteredBroker>,
}

impl BrokerRegistry {
    pub fn new(breaker_config: CircuitBreakerConfig) -> Self {
        Self {
            breaker_config,
            brokers: Vec::new(),
        }
    }

    /// Append a broker at the lowest priority. A second registration under
    /// the same name replaces the first in place.
    pub fn register(&mut self, client: Arc<dyn BrokerClient>) {
        let entry = RegisteredBroker {
            client,
            breaker: CircuitBreaker::new(self.breaker_config.clone()),
        };
        match self
            .brokers
            .iter_mut()
            .find(|b| b.name().eq_ignore_ascii_case(entry.name()))
        {
            Some(existing) => {
                warn!("Broker {} registered twice, replacing", entry.name());
                *existing = entry;
            }
            None => self.brokers.push(entry),
        }
    }

    /// Create REST clients for every endpoint that carries connection details
    pub fn from_endpoints(
        endpoints: &[BrokerEndpoint],
        breaker_config: CircuitBreakerConfig,
        timeout: Duration,
    ) -> Self {
        let mut registry = Self::new(breaker_config);

        for endpoint in endpoints {
            let (Some(base_url), Some(api_key), Some(api_secret)) = (
                endpoint.base_url.clone(),
                endpoint.api_key.clone(),
                endpoint.api_secret.clone(),
            ) else {
                warn!("{}: base URL or credentials not set, broker not created", endpoint.name);
                continue;
            };

            match RestBroker::new(RestBrokerConfig {
                name: endpoint.name.clone(),
                base_url,
                api_key,
                api_secret,
                timeout,
            }) {
                Ok(client) => {
                    info!("✓ {} broker client created successfully", endpoint.name);
                    registry.register(Arc::new(client));
                }
                Err(e) => error!("✗ Failed to create {} broker client: {}", endpoint.name, e),
            }
        }

        info!("BrokerRegistry created {} broker clients", registry.len());
        registry
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredBroker> {
        self.brokers.iter().find(|b| b.name().eq_ignore_ascii_case(name))
    }

    /// Brokers in priority order
    pub fn iter(&self) -> impl Iterator<Item = &RegisteredBroker> {
        self.brokers.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.brokers.iter().map(|b| b.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.brokers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.brokers.is_empty()
    }
}
