//! Order audit trail
//!
//! One `order_audit` row per order attempt, finalized exactly once, plus the
//! per-broker `broker_trades` outcomes and missing-instrument tracking.

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error, warn};

use super::models::{convert_all, BrokerTradeRecord, MissingInstrumentRecord, OrderAuditRecord};
use super::DbPool;
use crate::domain::entities::order::{
    BrokerTrade, OrderAudit, OrderAuditStatus, OrderMode, OrderPurpose, OrderSide,
};
use crate::domain::errors::StoreError;

/// Audit row as opened by the gateway, before any broker answered
#[derive(Debug, Clone)]
pub struct NewOrderAudit {
    pub trade_id: i64,
    pub symbol: String,
    pub broker: String,
    pub mode: OrderMode,
    pub purpose: OrderPurpose,
    pub side: OrderSide,
    pub quantity: i64,
    pub request: Value,
}

/// Terminal outcome written onto an audit row
#[derive(Debug, Clone)]
pub struct AuditResult {
    pub status: OrderAuditStatus,
    pub instrument_id: Option<String>,
    pub response: Option<Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewBrokerTrade {
    pub audit_id: i64,
    pub trade_id: i64,
    pub broker: String,
    pub purpose: OrderPurpose,
    pub side: OrderSide,
    pub quantity: i64,
    pub order_id: Option<String>,
    pub status: OrderAuditStatus,
    pub error: Option<String>,
}

pub struct OrderAuditRepository {
    pool: DbPool,
}

impl OrderAuditRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Open an `ATTEMPTED` audit row and return its id
    pub async fn begin(&self, audit: &NewOrderAudit) -> Result<i64, StoreError> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO order_audit (
                trade_id, symbol, broker, mode, purpose, side, quantity,
                status, request, created_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'ATTEMPTED', ?8, ?9)
            RETURNING id
            "#,
        )
        .bind(audit.trade_id)
        .bind(&audit.symbol)
        .bind(&audit.broker)
        .bind(audit.mode.as_str())
        .bind(audit.purpose.as_str())
        .bind(audit.side.as_str())
        .bind(audit.quantity)
        .bind(serde_json::to_string(&audit.request)?)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to open audit row for trade {}: {}", audit.trade_id, e);
            StoreError::Database(e)
        })?;

        debug!(
            "Audit {} opened: {} {} {} x{} via {}",
            id,
            audit.purpose.as_str(),
            audit.side,
            audit.symbol,
            audit.quantity,
            audit.broker
        );
        Ok(id)
    }

    /// Move an `ATTEMPTED` row to its terminal status.
    ///
    /// Returns `false` if the row was already finalized; the first result wins.
    pub async fn finalize(&self, audit_id: i64, result: &AuditResult) -> Result<bool, StoreError> {
        if !result.status.is_terminal() {
            return Err(StoreError::InvariantViolation(format!(
                "audit {} cannot be finalized as {}",
                audit_id,
                result.status.as_str()
            )));
        }

        let response = match &result.response {
            Some(value) => Some(serde_json::to_string(value)?),
            None => None,
        };

        let updated = sqlx::query(
            r#"
            UPDATE order_audit
            SET status = ?1, instrument_id = COALESCE(?2, instrument_id),
                response = ?3, error = ?4, completed_at = ?5
            WHERE id = ?6 AND status = 'ATTEMPTED'
            "#,
        )
        .bind(result.status.as_str())
        .bind(result.instrument_id.as_deref())
        .bind(response)
        .bind(result.error.as_deref())
        .bind(Utc::now())
        .bind(audit_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            warn!("Audit {} already finalized, {} ignored", audit_id, result.status.as_str());
        }
        Ok(updated > 0)
    }

    pub async fn record_broker_trade(&self, trade: &NewBrokerTrade) -> Result<i64, StoreError> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO broker_trades (
                audit_id, trade_id, broker, purpose, side, quantity,
                order_id, status, error, created_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            RETURNING id
            "#,
        )
        .bind(trade.audit_id)
        .bind(trade.trade_id)
        .bind(&trade.broker)
        .bind(trade.purpose.as_str())
        .bind(trade.side.as_str())
        .bind(trade.quantity)
        .bind(trade.order_id.as_deref())
        .bind(trade.status.as_str())
        .bind(trade.error.as_deref())
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    /// Brokers that successfully executed the entry of `trade_id`, in execution order
    pub async fn executing_brokers(&self, trade_id: i64) -> Result<Vec<String>, StoreError> {
        let brokers: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT broker FROM broker_trades
            WHERE trade_id = ?1 AND purpose = 'ENTRY' AND status = 'SUCCESS'
            GROUP BY broker
            ORDER BY MIN(id)
            "#,
        )
        .bind(trade_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(brokers)
    }

    pub async fn record_missing_instrument(&self, broker: &str, symbol: &str) -> Result<(), StoreError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO missing_instruments (broker, symbol, miss_count, first_seen, last_seen)
            VALUES (?1, ?2, 1, ?3, ?3)
            ON CONFLICT (broker, symbol)
            DO UPDATE SET miss_count = miss_count + 1, last_seen = excluded.last_seen
            "#,
        )
        .bind(broker)
        .bind(symbol)
        .bind(now)
        .execute(&self.pool)
        .await?;

        warn!("Instrument not found: {} on {}", symbol, broker);
        Ok(())
    }

    pub async fn missing_instruments(&self) -> Result<Vec<MissingInstrumentRecord>, StoreError> {
        let rows = sqlx::query_as::<_, MissingInstrumentRecord>(
            "SELECT * FROM missing_instruments ORDER BY last_seen DESC, symbol",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Latest audit rows, newest first
    pub async fn fetch_order_audit(&self, limit: i64) -> Result<Vec<OrderAudit>, StoreError> {
        let records = sqlx::query_as::<_, OrderAuditRecord>(
            "SELECT * FROM order_audit ORDER BY id DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        convert_all(records)
    }

    pub async fn for_trade(&self, trade_id: i64) -> Result<Vec<OrderAudit>, StoreError> {
        let records = sqlx::query_as::<_, OrderAuditRecord>(
            "SELECT * FROM order_audit WHERE trade_id = ?1 ORDER BY id",
        )
        .bind(trade_id)
        .fetch_all(&self.pool)
        .await?;
        convert_all(records)
    }

    pub async fn broker_trades_for(&self, trade_id: i64) -> Result<Vec<BrokerTrade>, StoreError> {
        let records = sqlx::query_as::<_, BrokerTradeRecord>(
            "SELECT * FROM broker_trades WHERE trade_id = ?1 ORDER BY id",
        )
        .bind(trade_id)
        .fetch_all(&self.pool)
        .await?;
        convert_all(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::test_pool;
    use serde_json::json;

    fn audit(trade_id: i64, purpose: OrderPurpose) -> NewOrderAudit {
        NewOrderAudit {
            trade_id,
            symbol: "INFY".to_string(),
            broker: "dhan".to_string(),
            mode: OrderMode::Live,
            purpose,
            side: OrderSide::Buy,
            quantity: 10,
            request: json!({"symbol": "INFY", "qty": 10}),
        }
    }

    fn broker_trade(audit_id: i64, broker: &str, status: OrderAuditStatus) -> NewBrokerTrade {
        NewBrokerTrade {
            audit_id,
            trade_id: 1,
            broker: broker.to_string(),
            purpose: OrderPurpose::Entry,
            side: OrderSide::Buy,
            quantity: 10,
            order_id: Some(format!("{}-1", broker)),
            status,
            error: None,
        }
    }

    #[tokio::test]
    async fn test_audit_finalizes_exactly_once() {
        let repo = OrderAuditRepository::new(test_pool().await);
        let id = repo.begin(&audit(1, OrderPurpose::Entry)).await.unwrap();

        let success = AuditResult {
            status: OrderAuditStatus::Success,
            instrument_id: Some("1594".into()),
            response: Some(json!({"order_id": "A1"})),
            error: None,
        };
        assert!(repo.finalize(id, &success).await.unwrap());

        let failure = AuditResult {
            status: OrderAuditStatus::Failed,
            instrument_id: None,
            response: None,
            error: Some("late".into()),
        };
        assert!(!repo.finalize(id, &failure).await.unwrap());

        let rows = repo.for_trade(1).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, OrderAuditStatus::Success);
        assert_eq!(rows[0].instrument_id.as_deref(), Some("1594"));
        assert_eq!(rows[0].request["qty"], 10);
        assert!(rows[0].completed_at.is_some());
    }

    #[tokio::test]
    async fn test_attempted_is_not_a_terminal_result() {
        let repo = OrderAuditRepository::new(test_pool().await);
        let id = repo.begin(&audit(1, OrderPurpose::Entry)).await.unwrap();
        let result = AuditResult {
            status: OrderAuditStatus::Attempted,
            instrument_id: None,
            response: None,
            error: None,
        };
        assert!(matches!(
            repo.finalize(id, &result).await,
            Err(StoreError::InvariantViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_executing_brokers_only_successful_entries() {
        let repo = OrderAuditRepository::new(test_pool().await);
        let id = repo.begin(&audit(1, OrderPurpose::Entry)).await.unwrap();

        repo.record_broker_trade(&broker_trade(id, "angel", OrderAuditStatus::Failed))
            .await
            .unwrap();
        repo.record_broker_trade(&broker_trade(id, "dhan", OrderAuditStatus::Success))
            .await
            .unwrap();
        repo.record_broker_trade(&broker_trade(id, "zerodha", OrderAuditStatus::Success))
            .await
            .unwrap();

        assert_eq!(repo.executing_brokers(1).await.unwrap(), vec!["dhan", "zerodha"]);
        assert!(repo.executing_brokers(2).await.unwrap().is_empty());
        assert_eq!(repo.broker_trades_for(1).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_missing_instruments_are_counted() {
        let repo = OrderAuditRepository::new(test_pool().await);
        repo.record_missing_instrument("dhan", "XYZ").await.unwrap();
        repo.record_missing_instrument("dhan", "XYZ").await.unwrap();
        repo.record_missing_instrument("angel", "XYZ").await.unwrap();

        let rows = repo.missing_instruments().await.unwrap();
        assert_eq!(rows.len(), 2);
        let dhan = rows.iter().find(|r| r.broker == "dhan").unwrap();
        assert_eq!(dhan.miss_count, 2);
    }
}
