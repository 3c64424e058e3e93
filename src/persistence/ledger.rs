//! Capital & Risk Ledger
//!
//! Owns the settings singleton. `adjust_available_capital` is the only code
//! path that changes the available swing capital counter; it runs on the
//! caller's connection so the adjustment commits or rolls back together
//! with the trade row mutation that caused it.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use tracing::{debug, error, info, warn};

use super::models::SettingsRecord;
use super::DbPool;
use crate::domain::entities::settings::{PriceBracket, RiskProfile};
use crate::domain::errors::{SizingError, StoreError};
use crate::domain::services::risk::{self, Exposure, PositionSize, RiskCheck};

/// Rounding tolerance for capital comparisons
pub const CAPITAL_EPSILON: f64 = 1e-6;

/// Consistent read of settings and current exposure, used by the decision engine
#[derive(Debug, Clone, Serialize)]
pub struct LedgerSnapshot {
    pub profile: RiskProfile,
    pub exposure: Exposure,
}

impl LedgerSnapshot {
    pub fn size_position(&self, entry: f64, stop: f64) -> Result<PositionSize, SizingError> {
        risk::size_position(&self.profile, entry, stop)
    }

    pub fn can_take_trade(&self, position_value: f64, entry_price: f64) -> RiskCheck {
        risk::can_take_trade(&self.profile, &self.exposure, position_value, entry_price)
    }
}

/// Limits an operator may change at runtime
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LimitsUpdate {
    pub total_capital: f64,
    pub max_swing_capital: f64,
    pub per_trade_cap: f64,
    pub risk_percent: f64,
    pub max_open_trades: i64,
    pub price_brackets: Vec<PriceBracket>,
}

pub struct CapitalLedger {
    pool: DbPool,
}

impl CapitalLedger {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Seed the settings row if it does not exist yet and return the stored profile.
    ///
    /// An existing row is never overwritten: its available capital reflects live trades.
    pub async fn ensure_settings(&self, seed: &RiskProfile) -> Result<RiskProfile, StoreError> {
        let brackets = serde_json::to_string(&seed.price_brackets)?;
        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO settings (
                id, total_capital, max_swing_capital, per_trade_cap, risk_percent,
                max_open_trades, price_brackets, available_swing_capital, updated_at
            )
            VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?2, ?7)
            "#,
        )
        .bind(seed.total_capital)
        .bind(seed.max_swing_capital)
        .bind(seed.per_trade_cap)
        .bind(seed.risk_percent)
        .bind(seed.max_open_trades)
        .bind(brackets)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to seed settings: {}", e);
            StoreError::Database(e)
        })?
        .rows_affected();

        if inserted > 0 {
            info!(
                "✓ Settings seeded: swing capital {:.2}, risk {}%",
                seed.max_swing_capital, seed.risk_percent
            );
        }

        self.settings().await
    }

    pub async fn settings(&self) -> Result<RiskProfile, StoreError> {
        let record = sqlx::query_as::<_, SettingsRecord>(
            r#"
            SELECT total_capital, max_swing_capital, per_trade_cap, risk_percent,
                   max_open_trades, price_brackets, available_swing_capital, updated_at
            FROM settings WHERE id = 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound {
            entity: "settings",
            id: 1,
        })?;

        RiskProfile::try_from(record)
    }

    /// Replace the configurable limits.
    ///
    /// Moving `max_swing_capital` shifts the available counter by the same
    /// delta so the capital invariant keeps holding. A new maximum below the
    /// capital already locked in live trades is refused.
    pub async fn update_limits(&self, update: &LimitsUpdate) -> Result<RiskProfile, StoreError> {
        let brackets = serde_json::to_string(&update.price_brackets)?;
        let mut tx = self.pool.begin().await?;

        let (max_swing, available): (f64, f64) = sqlx::query_as(
            "SELECT max_swing_capital, available_swing_capital FROM settings WHERE id = 1",
        )
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::NotFound {
            entity: "settings",
            id: 1,
        })?;

        let in_use = max_swing - available;
        if !update.max_swing_capital.is_finite() || update.max_swing_capital + CAPITAL_EPSILON < in_use {
            warn!(
                "Refusing max swing capital {:.2}: {:.2} is locked in live trades",
                update.max_swing_capital, in_use
            );
            return Err(StoreError::InvariantViolation(format!(
                "max swing capital {:.2} is below the {:.2} in use",
                update.max_swing_capital, in_use
            )));
        }

        let record = sqlx::query_as::<_, SettingsRecord>(
            r#"
            UPDATE settings
            SET available_swing_capital = ?2 - (max_swing_capital - available_swing_capital),
                total_capital = ?1, max_swing_capital = ?2, per_trade_cap = ?3,
                risk_percent = ?4, max_open_trades = ?5, price_brackets = ?6, updated_at = ?7
            WHERE id = 1
            RETURNING total_capital, max_swing_capital, per_trade_cap, risk_percent,
                      max_open_trades, price_brackets, available_swing_capital, updated_at
            "#,
        )
        .bind(update.total_capital)
        .bind(update.max_swing_capital)
        .bind(update.per_trade_cap)
        .bind(update.risk_percent)
        .bind(update.max_open_trades)
        .bind(brackets)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        info!(
            "✓ Risk limits updated: swing capital {:.2}, {:.2} available",
            record.max_swing_capital, record.available_swing_capital
        );
        RiskProfile::try_from(record)
    }

    /// Add `delta` to the available swing capital (negative locks, positive releases).
    ///
    /// Returns the new balance. A result below zero or above `max_swing_capital`
    /// is an invariant violation; the caller's transaction must then be dropped.
    pub async fn adjust_available_capital(
        conn: &mut SqliteConnection,
        delta: f64,
    ) -> Result<f64, StoreError> {
        let (available, max_swing): (f64, f64) = sqlx::query_as(
            r#"
            UPDATE settings
            SET available_swing_capital = available_swing_capital + ?1, updated_at = ?2
            WHERE id = 1
            RETURNING available_swing_capital, max_swing_capital
            "#,
        )
        .bind(delta)
        .bind(Utc::now())
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(StoreError::NotFound {
            entity: "settings",
            id: 1,
        })?;

        if available < -CAPITAL_EPSILON || available > max_swing + CAPITAL_EPSILON {
            error!(
                "Capital adjustment {:.2} would leave available at {:.2} (max {:.2})",
                delta, available, max_swing
            );
            return Err(StoreError::InvariantViolation(format!(
                "available {:.2} outside [0, {:.2}] after adjusting by {:.2}",
                available, max_swing, delta
            )));
        }

        debug!("Available swing capital adjusted by {:.2} -> {:.2}", delta, available);
        Ok(available)
    }

    /// Current available capital as seen by `conn`
    pub async fn available_capital(conn: &mut SqliteConnection) -> Result<f64, StoreError> {
        sqlx::query_scalar::<_, f64>("SELECT available_swing_capital FROM settings WHERE id = 1")
            .fetch_optional(&mut *conn)
            .await?
            .ok_or(StoreError::NotFound {
                entity: "settings",
                id: 1,
            })
    }

    async fn exposure_on(conn: &mut SqliteConnection) -> Result<Exposure, StoreError> {
        let (open_trades, used_capital): (i64, f64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(position_value), 0.0) FROM trades",
        )
        .fetch_one(&mut *conn)
        .await?;

        Ok(Exposure {
            open_trades,
            used_capital,
        })
    }

    pub async fn exposure(&self) -> Result<Exposure, StoreError> {
        let mut conn = self.pool.acquire().await?;
        Self::exposure_on(&mut conn).await
    }

    pub async fn snapshot(&self) -> Result<LedgerSnapshot, StoreError> {
        let profile = self.settings().await?;
        let exposure = self.exposure().await?;
        Ok(LedgerSnapshot { profile, exposure })
    }

    /// Drift of the capital invariant: `max_swing - available - sum(live position_value)`.
    ///
    /// Zero (within rounding) in every consistent state.
    pub async fn verify_invariant(&self) -> Result<f64, StoreError> {
        let snapshot = self.snapshot().await?;
        let drift = snapshot.profile.max_swing_capital
            - snapshot.profile.available_swing_capital
            - snapshot.exposure.used_capital;

        if drift.abs() > 0.01 {
            error!("Capital invariant drift detected: {:.4}", drift);
        }
        Ok(drift)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::test_pool;

    async fn seeded() -> (DbPool, CapitalLedger) {
        let pool = test_pool().await;
        let ledger = CapitalLedger::new(pool.clone());
        ledger
            .ensure_settings(&RiskProfile::new(100_000.0, 50_000.0, 20_000.0, 1.0, 5))
            .await
            .unwrap();
        (pool, ledger)
    }

    #[tokio::test]
    async fn test_seed_is_applied_once() {
        let (_pool, ledger) = seeded().await;
        let profile = ledger
            .ensure_settings(&RiskProfile::new(1.0, 1.0, 1.0, 1.0, 1))
            .await
            .unwrap();
        assert_eq!(profile.total_capital, 100_000.0);
        assert_eq!(profile.available_swing_capital, 50_000.0);
    }

    #[tokio::test]
    async fn test_settings_missing_is_not_found() {
        let ledger = CapitalLedger::new(test_pool().await);
        assert!(matches!(
            ledger.settings().await,
            Err(StoreError::NotFound { entity: "settings", .. })
        ));
    }

    #[tokio::test]
    async fn test_adjust_locks_and_releases() {
        let (pool, ledger) = seeded().await;
        let mut conn = pool.acquire().await.unwrap();

        let after_lock = CapitalLedger::adjust_available_capital(&mut conn, -12_500.0)
            .await
            .unwrap();
        assert_eq!(after_lock, 37_500.0);

        let after_release = CapitalLedger::adjust_available_capital(&mut conn, 2_500.0)
            .await
            .unwrap();
        assert_eq!(after_release, 40_000.0);
        drop(conn);

        assert_eq!(ledger.settings().await.unwrap().available_swing_capital, 40_000.0);
    }

    #[tokio::test]
    async fn test_adjust_outside_bounds_rolls_back_with_transaction() {
        let (pool, ledger) = seeded().await;

        let mut tx = pool.begin().await.unwrap();
        let result = CapitalLedger::adjust_available_capital(&mut tx, -60_000.0).await;
        assert!(matches!(result, Err(StoreError::InvariantViolation(_))));
        tx.rollback().await.unwrap();

        let mut tx = pool.begin().await.unwrap();
        let result = CapitalLedger::adjust_available_capital(&mut tx, 1.0).await;
        assert!(matches!(result, Err(StoreError::InvariantViolation(_))));
        tx.rollback().await.unwrap();

        assert_eq!(ledger.settings().await.unwrap().available_swing_capital, 50_000.0);
    }

    #[tokio::test]
    async fn test_update_limits_preserves_invariant() {
        let (pool, ledger) = seeded().await;
        {
            let mut conn = pool.acquire().await.unwrap();
            CapitalLedger::adjust_available_capital(&mut conn, -10_000.0)
                .await
                .unwrap();
        }

        let profile = ledger
            .update_limits(&LimitsUpdate {
                total_capital: 200_000.0,
                max_swing_capital: 80_000.0,
                per_trade_cap: 30_000.0,
                risk_percent: 0.5,
                max_open_trades: 4,
                price_brackets: vec![PriceBracket {
                    min_price: 10.0,
                    max_price: 500.0,
                    enabled: true,
                }],
            })
            .await
            .unwrap();

        assert_eq!(profile.max_swing_capital, 80_000.0);
        assert_eq!(profile.available_swing_capital, 70_000.0);
        assert_eq!(profile.price_brackets.len(), 1);
        assert_eq!(profile.risk_amount(), 1_000.0);
    }

    #[tokio::test]
    async fn test_snapshot_and_empty_exposure() {
        let (_pool, ledger) = seeded().await;
        let snapshot = ledger.snapshot().await.unwrap();
        assert_eq!(snapshot.exposure, Exposure::default());

        let size = snapshot.size_position(100.0, 95.0).unwrap();
        assert_eq!(size.quantity, 200);
        assert!(snapshot.can_take_trade(size.position_value, 100.0).allowed);

        assert!(ledger.verify_invariant().await.unwrap().abs() < CAPITAL_EPSILON);
    }

    #[tokio::test]
    async fn test_update_limits_refuses_max_below_capital_in_use() {
        let (pool, ledger) = seeded().await;
        {
            let mut conn = pool.acquire().await.unwrap();
            CapitalLedger::adjust_available_capital(&mut conn, -30_000.0)
                .await
                .unwrap();
        }

        let before = ledger.settings().await.unwrap();
        let limits = |max_swing_capital: f64| LimitsUpdate {
            total_capital: before.total_capital,
            max_swing_capital,
            per_trade_cap: before.per_trade_cap,
            risk_percent: before.risk_percent,
            max_open_trades: before.max_open_trades,
            price_brackets: Vec::new(),
        };

        let result = ledger.update_limits(&limits(20_000.0)).await;
        assert!(matches!(result, Err(StoreError::InvariantViolation(_))));

        let after = ledger.settings().await.unwrap();
        assert_eq!(after.max_swing_capital, 50_000.0);
        assert_eq!(after.available_swing_capital, 20_000.0);

        // Shrinking exactly to the capital in use leaves nothing available
        let profile = ledger.update_limits(&limits(30_000.0)).await.unwrap();
        assert_eq!(profile.available_swing_capital, 0.0);
    }
}
