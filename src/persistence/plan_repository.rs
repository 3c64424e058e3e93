//! Swing plan and watchlist persistence

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{QueryBuilder, Sqlite};
use tracing::{debug, error, info, warn};

use super::models::{convert_all, PlanRecord};
use super::DbPool;
use crate::domain::entities::plan::{
    ConfidenceInputs, PlanProposal, PlanStatus, SwingPlan, WatchlistEntry,
};
use crate::domain::errors::StoreError;

/// Fields recorded alongside a status change
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransitionDetails {
    pub reason: Option<String>,
    pub confidence: Option<i64>,
    pub planned_qty: Option<i64>,
}

impl TransitionDetails {
    pub fn reason(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::default()
        }
    }
}

pub struct PlanRepository {
    pool: DbPool,
}

impl PlanRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Store a scanner proposal as a new `PLANNED` plan
    pub async fn insert_plan(
        &self,
        proposal: &PlanProposal,
        created_at: DateTime<Utc>,
        default_expiry_days: i64,
    ) -> Result<SwingPlan, StoreError> {
        let inputs = serde_json::to_string(&proposal.inputs)?;
        let record = sqlx::query_as::<_, PlanRecord>(
            r#"
            INSERT INTO swing_plans (
                symbol, strategy, side, entry_price, stop_loss, target, risk_reward,
                status, inputs, created_at, expires_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'PLANNED', ?8, ?9, ?10, ?9)
            RETURNING *
            "#,
        )
        .bind(&proposal.symbol)
        .bind(&proposal.strategy)
        .bind(proposal.side.as_str())
        .bind(proposal.entry)
        .bind(proposal.sl)
        .bind(proposal.target)
        .bind(proposal.rr)
        .bind(inputs)
        .bind(created_at)
        .bind(proposal.expires_at(created_at, default_expiry_days))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to create plan for {}: {}", proposal.symbol, e);
            StoreError::Database(e)
        })?;

        debug!("Created plan {} for {}", record.id, record.symbol);
        SwingPlan::try_from(record)
    }

    pub async fn get(&self, plan_id: i64) -> Result<Option<SwingPlan>, StoreError> {
        let record = sqlx::query_as::<_, PlanRecord>("SELECT * FROM swing_plans WHERE id = ?1")
            .bind(plan_id)
            .fetch_optional(&self.pool)
            .await?;
        record.map(SwingPlan::try_from).transpose()
    }

    /// Plans still awaiting a decision or a trigger (`PLANNED`, `APPROVED`, `HOLD`)
    pub async fn fetch_active_plans(&self) -> Result<Vec<SwingPlan>, StoreError> {
        self.fetch_by_status(&PlanStatus::ACTIVE).await
    }

    pub async fn fetch_by_status(&self, statuses: &[PlanStatus]) -> Result<Vec<SwingPlan>, StoreError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let mut query = QueryBuilder::<Sqlite>::new("SELECT * FROM swing_plans WHERE status IN (");
        let mut values = query.separated(", ");
        for status in statuses {
            values.push_bind(status.as_str());
        }
        values.push_unseparated(") ORDER BY id");

        let records = query
            .build_query_as::<PlanRecord>()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to fetch plans: {}", e);
                StoreError::Database(e)
            })?;

        convert_all(records)
    }

    pub async fn has_active_plan(&self, symbol: &str, strategy: &str) -> Result<bool, StoreError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM swing_plans
            WHERE symbol = ?1 AND strategy = ?2 AND status IN ('PLANNED', 'APPROVED', 'HOLD')
            "#,
        )
        .bind(symbol)
        .bind(strategy)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    /// Move a plan to `to`, recording the decision details.
    ///
    /// The update is conditional on the status read beforehand, so a plan
    /// changed concurrently (or already terminal) is never overwritten.
    pub async fn transition(
        &self,
        plan_id: i64,
        to: PlanStatus,
        details: TransitionDetails,
    ) -> Result<SwingPlan, StoreError> {
        let current = self.get(plan_id).await?.ok_or(StoreError::NotFound {
            entity: "plan",
            id: plan_id,
        })?;

        if !current.status.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                from: current.status.to_string(),
                to: to.to_string(),
            });
        }

        let record = sqlx::query_as::<_, PlanRecord>(
            r#"
            UPDATE swing_plans
            SET status = ?1,
                reason = COALESCE(?2, reason),
                confidence = COALESCE(?3, confidence),
                planned_qty = COALESCE(?4, planned_qty),
                updated_at = ?5
            WHERE id = ?6 AND status = ?7
            RETURNING *
            "#,
        )
        .bind(to.as_str())
        .bind(details.reason)
        .bind(details.confidence)
        .bind(details.planned_qty)
        .bind(Utc::now())
        .bind(plan_id)
        .bind(current.status.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            warn!("Plan {} changed concurrently, {} not applied", plan_id, to);
            StoreError::InvalidTransition {
                from: current.status.to_string(),
                to: to.to_string(),
            }
        })?;

        debug!("Plan {} {} -> {}", plan_id, current.status, to);
        SwingPlan::try_from(record)
    }

    /// Replace the confidence inputs of a live plan
    pub async fn update_inputs(&self, plan_id: i64, inputs: &ConfidenceInputs) -> Result<(), StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE swing_plans SET inputs = ?1, updated_at = ?2
            WHERE id = ?3 AND status IN ('PLANNED', 'APPROVED', 'HOLD')
            "#,
        )
        .bind(serde_json::to_string(inputs)?)
        .bind(Utc::now())
        .bind(plan_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(StoreError::NotFound {
                entity: "plan",
                id: plan_id,
            });
        }
        Ok(())
    }

    /// Mark every non-terminal plan past its expiry as `EXPIRED`. Returns how many changed.
    pub async fn expire_stale(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let stale: Vec<SwingPlan> = self
            .fetch_active_plans()
            .await?
            .into_iter()
            .filter(|plan| plan.is_expired_at(now))
            .collect();

        let mut expired = 0;
        for plan in stale {
            let updated = sqlx::query(
                r#"
                UPDATE swing_plans SET status = 'EXPIRED', reason = 'Expired', updated_at = ?1
                WHERE id = ?2 AND status = ?3
                "#,
            )
            .bind(now)
            .bind(plan.id)
            .bind(plan.status.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();
            expired += updated;
        }

        if expired > 0 {
            info!("Expired {} stale plan(s)", expired);
        }
        Ok(expired)
    }

    /// Store the scanner watchlist for `scan_date`, replacing rows already saved for that day
    pub async fn save_watchlist(
        &self,
        scan_date: NaiveDate,
        entries: &[WatchlistEntry],
    ) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO watchlist (scan_date, symbol, strategy, bias, score, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT (scan_date, symbol, strategy)
                DO UPDATE SET bias = excluded.bias, score = excluded.score
                "#,
            )
            .bind(scan_date)
            .bind(&entry.symbol)
            .bind(&entry.strategy)
            .bind(&entry.bias)
            .bind(entry.score)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(entries.len())
    }

    pub async fn fetch_watchlist(&self, scan_date: NaiveDate) -> Result<Vec<WatchlistEntry>, StoreError> {
        let rows: Vec<(String, String, String, f64)> = sqlx::query_as(
            r#"
            SELECT symbol, strategy, bias, score FROM watchlist
            WHERE scan_date = ?1 ORDER BY score DESC, symbol
            "#,
        )
        .bind(scan_date)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(symbol, strategy, bias, score)| WatchlistEntry {
                symbol,
                strategy,
                bias,
                score,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::trade::Side;
    use crate::persistence::test_pool;
    use chrono::Duration;

    fn proposal(symbol: &str) -> PlanProposal {
        PlanProposal {
            symbol: symbol.to_string(),
            strategy: "pullback".to_string(),
            side: Side::Long,
            entry: 50.0,
            sl: 48.0,
            target: 54.0,
            rr: 2.0,
            expiry: None,
            inputs: ConfidenceInputs {
                htf_trend_bullish: true,
                favorable_location: true,
                rsi: Some(55.0),
                volume_ratio: Some(1.5),
            },
        }
    }

    #[tokio::test]
    async fn test_insert_and_fetch_active() {
        let repo = PlanRepository::new(test_pool().await);
        let now = Utc::now();
        let plan = repo.insert_plan(&proposal("INFY"), now, 7).await.unwrap();

        assert_eq!(plan.status, PlanStatus::Planned);
        let drift = plan.expires_at - (now + Duration::days(7));
        assert!(drift.num_milliseconds().abs() < 1);
        assert_eq!(plan.inputs.rsi, Some(55.0));
        assert!(repo.has_active_plan("INFY", "pullback").await.unwrap());
        assert!(!repo.has_active_plan("INFY", "breakout").await.unwrap());
        assert_eq!(repo.fetch_active_plans().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transition_records_decision() {
        let repo = PlanRepository::new(test_pool().await);
        let plan = repo.insert_plan(&proposal("INFY"), Utc::now(), 7).await.unwrap();

        let approved = repo
            .transition(
                plan.id,
                PlanStatus::Approved,
                TransitionDetails {
                    reason: Some("Approved".into()),
                    confidence: Some(8),
                    planned_qty: Some(500),
                },
            )
            .await
            .unwrap();
        assert_eq!(approved.status, PlanStatus::Approved);
        assert_eq!(approved.confidence, Some(8));
        assert_eq!(approved.planned_qty, Some(500));

        // Reason-only transitions keep the frozen score
        let held = repo
            .transition(plan.id, PlanStatus::Hold, TransitionDetails::reason("Confidence regressed"))
            .await
            .unwrap();
        assert_eq!(held.confidence, Some(8));
        assert_eq!(held.reason.as_deref(), Some("Confidence regressed"));
    }

    #[tokio::test]
    async fn test_terminal_plans_never_change() {
        let repo = PlanRepository::new(test_pool().await);
        let plan = repo.insert_plan(&proposal("INFY"), Utc::now(), 7).await.unwrap();
        repo.transition(plan.id, PlanStatus::Rejected, TransitionDetails::reason("Low confidence"))
            .await
            .unwrap();

        let err = repo
            .transition(plan.id, PlanStatus::Approved, TransitionDetails::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        let err = repo
            .transition(999, PlanStatus::Approved, TransitionDetails::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { entity: "plan", .. }));
    }

    #[tokio::test]
    async fn test_expire_stale_skips_terminal_and_fresh() {
        let repo = PlanRepository::new(test_pool().await);
        let old = Utc::now() - Duration::days(10);
        let stale = repo.insert_plan(&proposal("INFY"), old, 7).await.unwrap();
        let triggered = repo.insert_plan(&proposal("TCS"), old, 7).await.unwrap();
        repo.transition(triggered.id, PlanStatus::Triggered, TransitionDetails::default())
            .await
            .unwrap();
        let fresh = repo.insert_plan(&proposal("WIPRO"), Utc::now(), 7).await.unwrap();

        assert_eq!(repo.expire_stale(Utc::now()).await.unwrap(), 1);
        assert_eq!(repo.get(stale.id).await.unwrap().unwrap().status, PlanStatus::Expired);
        assert_eq!(repo.get(triggered.id).await.unwrap().unwrap().status, PlanStatus::Triggered);
        assert_eq!(repo.get(fresh.id).await.unwrap().unwrap().status, PlanStatus::Planned);

        assert_eq!(repo.expire_stale(Utc::now()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_update_inputs_only_for_live_plans() {
        let repo = PlanRepository::new(test_pool().await);
        let plan = repo.insert_plan(&proposal("INFY"), Utc::now(), 7).await.unwrap();

        let weaker = ConfidenceInputs::default();
        repo.update_inputs(plan.id, &weaker).await.unwrap();
        assert_eq!(repo.get(plan.id).await.unwrap().unwrap().inputs, weaker);

        repo.transition(plan.id, PlanStatus::Expired, TransitionDetails::default())
            .await
            .unwrap();
        assert!(repo.update_inputs(plan.id, &weaker).await.is_err());
    }

    #[tokio::test]
    async fn test_watchlist_upserts_per_day() {
        let repo = PlanRepository::new(test_pool().await);
        let day = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        let entry = |symbol: &str, score: f64| WatchlistEntry {
            symbol: symbol.to_string(),
            strategy: "pullback".to_string(),
            bias: "LONG".to_string(),
            score,
        };

        repo.save_watchlist(day, &[entry("INFY", 7.0), entry("TCS", 8.0)])
            .await
            .unwrap();
        repo.save_watchlist(day, &[entry("INFY", 9.0)]).await.unwrap();

        let rows = repo.fetch_watchlist(day).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].symbol, "INFY");
        assert_eq!(rows[0].score, 9.0);
    }

    #[tokio::test]
    async fn test_fetch_by_status_ignores_other_rows() {
        let pool = test_pool().await;
        let repo = PlanRepository::new(pool.clone());
        let live = repo.insert_plan(&proposal("INFY"), Utc::now(), 7).await.unwrap();
        let old = repo.insert_plan(&proposal("TCS"), Utc::now(), 7).await.unwrap();
        repo.transition(old.id, PlanStatus::Rejected, TransitionDetails::reason("Low confidence"))
            .await
            .unwrap();

        // A damaged historical row must not break queries for live plans
        sqlx::query("UPDATE swing_plans SET inputs = 'not json' WHERE id = ?1")
            .bind(old.id)
            .execute(&pool)
            .await
            .unwrap();

        let active = repo.fetch_active_plans().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, live.id);
        assert!(repo.fetch_by_status(&[]).await.unwrap().is_empty());
        assert!(repo.fetch_by_status(&[PlanStatus::Rejected]).await.is_err());
    }
}
