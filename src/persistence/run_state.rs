//! Persisted scheduler run state (single JSON row)

use chrono::Utc;
use tracing::{debug, warn};

use super::DbPool;
use crate::domain::entities::run_state::RunState;
use crate::domain::errors::StoreError;

pub struct RunStateRepository {
    pool: DbPool,
}

impl RunStateRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Load the stored run state, or the empty state on first start.
    ///
    /// An unreadable row is logged and treated as empty rather than
    /// blocking the scheduler.
    pub async fn load(&self) -> Result<RunState, StoreError> {
        let raw: Option<String> = sqlx::query_scalar("SELECT state FROM run_state WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;

        match raw {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(state) => Ok(state),
                Err(e) => {
                    warn!("Discarding unreadable run state: {}", e);
                    Ok(RunState::default())
                }
            },
            None => Ok(RunState::default()),
        }
    }

    pub async fn save(&self, state: &RunState) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO run_state (id, state, updated_at) VALUES (1, ?1, ?2)
            ON CONFLICT (id) DO UPDATE SET state = excluded.state, updated_at = excluded.updated_at
            "#,
        )
        .bind(serde_json::to_string(state)?)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        debug!("Run state saved: {:?}", state);
        Ok(())
    }
}
