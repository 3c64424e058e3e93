//! Generic REST broker adapter
//!
//! Speaks a small signed JSON protocol:
//! - `POST /session` opens a trading session and returns a bearer token
//! - `GET /instruments/{symbol}` maps a symbol to the broker's instrument id
//! - `POST /orders` places a market order
//! - `GET /holdings` lists settled positions
//!
//! Every request carries an HMAC-SHA256 signature over
//! `timestamp + method + path + body`, base64 encoded.

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::domain::repositories::broker_client::{
    BrokerClient, BrokerError, BrokerResult, Holding, OrderAck, OrderRequest,
};

const USER_AGENT: &str = "swingcore/0.1.0";

#[derive(Debug, Clone)]
pub struct RestBrokerConfig {
    pub name: String,
    pub base_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct InstrumentResponse {
    instrument_id: String,
}

#[derive(Debug, Serialize)]
struct OrderPayload<'a> {
    instrument_id: &'a str,
    symbol: &'a str,
    side: &'a str,
    quantity: i64,
    order_type: &'static str,
    product: &'static str,
    tag: &'a str,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    order_id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

pub struct RestBroker {
    client: Client,
    config: RestBrokerConfig,
    session: RwLock<Option<String>>,
}

impl RestBroker {
    pub fn new(config: RestBrokerConfig) -> Result<Self, String> {
        if config.api_key.is_empty() || config.api_secret.is_empty() {
            return Err(format!("{}: API key and secret are required", config.name));
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| format!("Failed to build HTTP client: {}", e))?;

        Ok(Self {
            client,
            config: RestBrokerConfig {
                base_url: config.base_url.trim_end_matches('/').to_string(),
                ..config
            },
            session: RwLock::new(None),
        })
    }

    /// Authentication headers for one request
    fn auth_headers(&self, method: &str, path: &str, body: &str) -> BrokerResult<HashMap<String, String>> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| BrokerError::Authentication(format!("Clock error: {}", e)))?
            .as_secs();

        let message = format!("{}{}{}{}", timestamp, method, path, body);

        type HmacSha256 = Hmac<Sha256>;
        let mut mac = HmacSha256::new_from_slice(self.config.api_secret.as_bytes())
            .map_err(|e| BrokerError::Authentication(format!("Invalid secret: {}", e)))?;
        mac.update(message.as_bytes());
        let signature = general_purpose::STANDARD.encode(mac.finalize().into_bytes());

        let mut headers = HashMap::new();
        headers.insert("X-API-KEY".to_string(), self.config.api_key.clone());
        headers.insert("X-SIGNATURE".to_string(), signature);
        headers.insert("X-TIMESTAMP".to_string(), timestamp.to_string());
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        Ok(headers)
    }

    async fn send(&self, method: Method, path: &str, body: Option<String>) -> BrokerResult<reqwest::Response> {
        let url = format!("{}{}", self.config.base_url, path);
        let body = body.unwrap_or_default();
        let headers = self.auth_headers(method.as_str(), path, &body)?;

        let mut request = self
            .client
            .request(method, &url)
            .header("User-Agent", USER_AGENT);
        for (key, value) in headers {
            request = request.header(&key, value);
        }
        if let Some(token) = self.session.read().await.as_ref() {
            request = request.bearer_auth(token);
        }
        if !body.is_empty() {
            request = request.body(body);
        }

        request.send().await.map_err(|e| {
            if e.is_timeout() {
                BrokerError::Timeout
            } else {
                BrokerError::Network(e.to_string())
            }
        })
    }

    async fn error_for(response: reqwest::Response) -> BrokerError {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        classify_status(status, text)
    }
}

/// Map an HTTP failure status onto the broker error taxonomy
fn classify_status(status: StatusCode, text: String) -> BrokerError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            BrokerError::Authentication(format!("{} - {}", status, text))
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => BrokerError::Timeout,
        s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
            BrokerError::Network(format!("{} - {}", status, text))
        }
        _ => BrokerError::Rejected(format!("{} - {}", status, text)),
    }
}

#[async_trait]
impl BrokerClient for RestBroker {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn login(&self) -> BrokerResult<()> {
        let response = self.send(Method::POST, "/session", None).await?;
        if !response.status().is_success() {
            return Err(match Self::error_for(response).await {
                BrokerError::Rejected(msg) => BrokerError::Authentication(msg),
                other => other,
            });
        }

        let session: SessionResponse = response
            .json()
            .await
            .map_err(|e| BrokerError::InvalidResponse(format!("session: {}", e)))?;
        *self.session.write().await = Some(session.token);

        info!("✓ {} session established", self.config.name);
        Ok(())
    }

    async fn resolve_instrument(&self, symbol: &str) -> BrokerResult<Option<String>> {
        let path = format!("/instruments/{}", symbol);
        let response = self.send(Method::GET, &path, None).await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }

        let instrument: InstrumentResponse = response
            .json()
            .await
            .map_err(|e| BrokerError::InvalidResponse(format!("instrument: {}", e)))?;
        Ok(Some(instrument.instrument_id))
    }

    async fn place_order(&self, request: &OrderRequest) -> BrokerResult<OrderAck> {
        let payload = OrderPayload {
            instrument_id: &request.instrument_id,
            symbol: &request.symbol,
            side: request.side.as_str(),
            quantity: request.quantity,
            order_type: "MARKET",
            product: "CNC",
            tag: &request.tag,
        };
        let body = serde_json::to_string(&payload)
            .map_err(|e| BrokerError::InvalidResponse(format!("Failed to serialize order: {}", e)))?;

        debug!("{} placing {} {} x{}", self.config.name, payload.side, payload.symbol, payload.quantity);
        let response = self.send(Method::POST, "/orders", Some(body)).await?;
        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }

        let raw: serde_json::Value = response
            .json()
            .await
            .map_err(|e| BrokerError::InvalidResponse(format!("order: {}", e)))?;
        let parsed: OrderResponse = serde_json::from_value(raw.clone())
            .map_err(|e| BrokerError::InvalidResponse(format!("order: {}", e)))?;

        if parsed
            .status
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case("rejected"))
        {
            return Err(BrokerError::Rejected(
                parsed.message.unwrap_or_else(|| "rejected by broker".to_string()),
            ));
        }

        Ok(OrderAck {
            order_id: parsed.order_id,
            raw,
        })
    }

    async fn get_holdings(&self) -> BrokerResult<Vec<Holding>> {
        let response = self.send(Method::GET, "/holdings", None).await?;
        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }
        response
            .json()
            .await
            .map_err(|e| BrokerError::InvalidResponse(format!("holdings: {}", e)))
    }
}
