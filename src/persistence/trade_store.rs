//! Trade Lifecycle Store
//!
//! Live trades, their archive and the realized PnL ledger.
//!
//! Every mutation runs under a process-wide write guard and a single SQLite
//! transaction that covers both the row change and the matching capital
//! adjustment. Two concurrent exits on the same trade therefore serialize,
//! and the second one observes the first one's result instead of
//! releasing capital again.

use chrono::{DateTime, Local, Utc};
use sqlx::SqliteConnection;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::ledger::{CapitalLedger, CAPITAL_EPSILON};
use super::models::{convert_all, RealizedPnlRecord, TradeHistoryRecord, TradeRecord};
use super::DbPool;
use crate::domain::entities::trade::{
    pnl_buckets, ExitReason, NewTrade, RealizedPnl, Trade, TradeHistory,
};
use crate::domain::errors::StoreError;

/// Result of `mark_partial_exit`
#[derive(Debug, Clone, PartialEq)]
pub enum PartialExit {
    Applied {
        remaining_qty: i64,
        released_capital: f64,
        /// Trade as it was before the exit
        trade: Trade,
    },
    /// Trade gone, or quantity outside `0 < qty < remaining`
    NoOp,
}

/// Result of `close_and_archive`
#[derive(Debug, Clone, PartialEq)]
pub enum CloseOutcome {
    Archived {
        released_capital: f64,
        /// Trade as it was before the close
        trade: Trade,
    },
    AlreadyClosed,
}

/// Result of `finalize_exit`: the store mutation plus its PnL row
#[derive(Debug, Clone, PartialEq)]
pub enum ExitOutcome {
    Partial {
        remaining_qty: i64,
        released_capital: f64,
        pnl: RealizedPnl,
    },
    Closed {
        released_capital: f64,
        pnl: RealizedPnl,
    },
    NoOp,
}

impl ExitOutcome {
    pub fn is_applied(&self) -> bool {
        !matches!(self, ExitOutcome::NoOp)
    }
}

pub struct TradeStore {
    pool: DbPool,
    write_guard: Mutex<()>,
}

impl TradeStore {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            write_guard: Mutex::new(()),
        }
    }

    /// Lock capital for a new trade, then insert it.
    ///
    /// Fails with `InsufficientCapital` without side effects when the
    /// available counter cannot cover the position value. If the insert
    /// fails after the lock, the transaction is rolled back so the lock is
    /// undone before the error propagates.
    pub async fn save_trade(&self, new: &NewTrade) -> Result<Trade, StoreError> {
        if new.quantity <= 0 || !(new.entry_price > 0.0) {
            return Err(StoreError::InvariantViolation(format!(
                "cannot open {} with qty {} at {}",
                new.symbol, new.quantity, new.entry_price
            )));
        }

        let _guard = self.write_guard.lock().await;
        let mut tx = self.pool.begin().await?;

        let position_value = new.position_value();
        let available = CapitalLedger::available_capital(&mut tx).await?;
        if position_value > available + CAPITAL_EPSILON {
            tx.rollback().await?;
            warn!(
                "Insufficient swing capital for {}: required {:.2}, available {:.2}",
                new.symbol, position_value, available
            );
            return Err(StoreError::InsufficientCapital {
                required: position_value,
                available,
            });
        }

        CapitalLedger::adjust_available_capital(&mut tx, -position_value).await?;

        let now = Utc::now();
        let inserted = sqlx::query_as::<_, TradeRecord>(
            r#"
            INSERT INTO trades (
                plan_id, symbol, strategy, side, entry_price, stop_loss, trailing_stop,
                target, initial_qty, remaining_qty, position_value, risk_amount,
                risk_per_unit, confidence, status, hold_mode, entry_day, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?7, ?8, ?8, ?9, ?10, ?11, ?12, 'OPEN', 0, ?13, ?14, ?14)
            RETURNING *
            "#,
        )
        .bind(new.plan_id)
        .bind(&new.symbol)
        .bind(&new.strategy)
        .bind(new.side.as_str())
        .bind(new.entry_price)
        .bind(new.stop_loss)
        .bind(new.target)
        .bind(new.quantity)
        .bind(position_value)
        .bind(new.risk_amount())
        .bind(new.risk_per_unit())
        .bind(new.confidence)
        .bind(new.entry_day)
        .bind(now)
        .fetch_one(&mut *tx)
        .await;

        let record = match inserted {
            Ok(record) => record,
            Err(e) => {
                error!(
                    "Failed to insert trade for {}: {}; releasing {:.2} locked capital",
                    new.symbol, e, position_value
                );
                tx.rollback().await?;
                return Err(StoreError::Database(e));
            }
        };

        let trade = Trade::try_from(record)?;
        tx.commit().await?;

        info!(
            "✓ Trade {} opened: {} {} x{} @ {:.2} (locked {:.2})",
            trade.id,
            trade.side,
            trade.symbol,
            trade.initial_qty,
            trade.entry_price,
            position_value
        );
        Ok(trade)
    }

    /// Book part of a trade: requires `0 < exit_qty < remaining_qty`
    pub async fn mark_partial_exit(&self, trade_id: i64, exit_qty: i64) -> Result<PartialExit, StoreError> {
        let _guard = self.write_guard.lock().await;
        let mut tx = self.pool.begin().await?;
        let outcome = Self::partial_in(&mut tx, trade_id, exit_qty).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// Release all remaining capital, archive the trade and delete the live row.
    ///
    /// Calling it again for the same id is a no-op.
    pub async fn close_and_archive(
        &self,
        trade_id: i64,
        exit_price: f64,
        exit_reason: ExitReason,
    ) -> Result<CloseOutcome, StoreError> {
        let _guard = self.write_guard.lock().await;
        let mut tx = self.pool.begin().await?;
        let outcome = Self::close_in(&mut tx, trade_id, exit_price, exit_reason, Utc::now()).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// Apply a confirmed exit fill: partial or full close plus its PnL row, in one transaction.
    ///
    /// `exit_qty == remaining_qty` closes the trade; anything smaller books a
    /// partial. A missing trade or out-of-range quantity is a no-op, so a
    /// retried exit never double-counts PnL or capital.
    pub async fn finalize_exit(
        &self,
        trade_id: i64,
        exit_qty: i64,
        exit_price: f64,
        exit_reason: ExitReason,
    ) -> Result<ExitOutcome, StoreError> {
        let _guard = self.write_guard.lock().await;
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let Some(trade) = Self::fetch_in(&mut tx, trade_id).await? else {
            debug!("Exit for trade {} ignored: already closed", trade_id);
            tx.rollback().await?;
            return Ok(ExitOutcome::NoOp);
        };

        let outcome = if exit_qty == trade.remaining_qty {
            match Self::close_in(&mut tx, trade_id, exit_price, exit_reason, now).await? {
                CloseOutcome::Archived {
                    released_capital,
                    trade,
                } => {
                    let pnl = Self::insert_pnl_in(&mut tx, &trade, exit_qty, exit_price, exit_reason, now).await?;
                    ExitOutcome::Closed {
                        released_capital,
                        pnl,
                    }
                }
                CloseOutcome::AlreadyClosed => ExitOutcome::NoOp,
            }
        } else {
            match Self::partial_in(&mut tx, trade_id, exit_qty).await? {
                PartialExit::Applied {
                    remaining_qty,
                    released_capital,
                    trade,
                } => {
                    let pnl = Self::insert_pnl_in(&mut tx, &trade, exit_qty, exit_price, exit_reason, now).await?;
                    ExitOutcome::Partial {
                        remaining_qty,
                        released_capital,
                        pnl,
                    }
                }
                PartialExit::NoOp => ExitOutcome::NoOp,
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    /// Undo a trade whose entry order never went out: release capital and
    /// delete the row without archiving it or writing PnL.
    pub async fn discard_trade(&self, trade_id: i64) -> Result<bool, StoreError> {
        let _guard = self.write_guard.lock().await;
        let mut tx = self.pool.begin().await?;

        let Some(trade) = Self::fetch_in(&mut tx, trade_id).await? else {
            tx.rollback().await?;
            return Ok(false);
        };

        sqlx::query("DELETE FROM trades WHERE id = ?1")
            .bind(trade_id)
            .execute(&mut *tx)
            .await?;
        CapitalLedger::adjust_available_capital(&mut tx, trade.position_value).await?;
        tx.commit().await?;

        warn!(
            "Trade {} for {} discarded, released {:.2}",
            trade_id, trade.symbol, trade.position_value
        );
        Ok(true)
    }

    /// Ratchet the trailing stop.
    ///
    /// Only a level strictly more favorable than the current effective stop
    /// is written; anything else is ignored and reported as `false`.
    pub async fn update_sl(&self, trade_id: i64, new_sl: f64) -> Result<bool, StoreError> {
        if !(new_sl.is_finite() && new_sl > 0.0) {
            return Ok(false);
        }

        let _guard = self.write_guard.lock().await;
        let mut tx = self.pool.begin().await?;

        let Some(trade) = Self::fetch_in(&mut tx, trade_id).await? else {
            tx.rollback().await?;
            return Ok(false);
        };

        let current = trade.effective_stop();
        if !trade.side.is_more_favorable(new_sl, current) {
            tx.rollback().await?;
            debug!(
                "Stop update for trade {} ignored: {:.2} does not improve {:.2}",
                trade_id, new_sl, current
            );
            return Ok(false);
        }

        sqlx::query("UPDATE trades SET trailing_stop = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(new_sl)
            .bind(Utc::now())
            .bind(trade_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!(
            "Trailing stop for {} (trade {}) moved {:.2} -> {:.2}",
            trade.symbol, trade_id, current, new_sl
        );
        Ok(true)
    }

    pub async fn get(&self, trade_id: i64) -> Result<Option<Trade>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        Self::fetch_in(&mut conn, trade_id).await
    }

    pub async fn fetch_open_trades(&self) -> Result<Vec<Trade>, StoreError> {
        let records = sqlx::query_as::<_, TradeRecord>("SELECT * FROM trades ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to fetch open trades: {}", e);
                StoreError::Database(e)
            })?;
        convert_all(records)
    }

    pub async fn has_open_trade(&self, symbol: &str) -> Result<bool, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM trades WHERE symbol = ?1")
            .bind(symbol)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    /// Most recently closed trades, newest first
    pub async fn fetch_recent_closed(&self, limit: i64) -> Result<Vec<TradeHistory>, StoreError> {
        let records = sqlx::query_as::<_, TradeHistoryRecord>(
            "SELECT * FROM trade_history ORDER BY id DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        convert_all(records)
    }

    pub async fn fetch_history(&self, trade_id: i64) -> Result<Option<TradeHistory>, StoreError> {
        let record = sqlx::query_as::<_, TradeHistoryRecord>(
            "SELECT * FROM trade_history WHERE trade_id = ?1",
        )
        .bind(trade_id)
        .fetch_optional(&self.pool)
        .await?;
        record.map(TradeHistory::try_from).transpose()
    }

    /// Latest realized PnL rows, newest first
    pub async fn fetch_realized_pnl(&self, limit: i64) -> Result<Vec<RealizedPnl>, StoreError> {
        let records = sqlx::query_as::<_, RealizedPnlRecord>(
            "SELECT * FROM realized_pnl ORDER BY id DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        convert_all(records)
    }

    pub async fn pnl_for_trade(&self, trade_id: i64) -> Result<Vec<RealizedPnl>, StoreError> {
        let records = sqlx::query_as::<_, RealizedPnlRecord>(
            "SELECT * FROM realized_pnl WHERE trade_id = ?1 ORDER BY id",
        )
        .bind(trade_id)
        .fetch_all(&self.pool)
        .await?;
        convert_all(records)
    }

    pub async fn total_realized_pnl(&self) -> Result<f64, StoreError> {
        let total: f64 = sqlx::query_scalar("SELECT COALESCE(SUM(pnl), 0.0) FROM realized_pnl")
            .fetch_one(&self.pool)
            .await?;
        Ok(total)
    }

    async fn fetch_in(conn: &mut SqliteConnection, trade_id: i64) -> Result<Option<Trade>, StoreError> {
        let record = sqlx::query_as::<_, TradeRecord>("SELECT * FROM trades WHERE id = ?1")
            .bind(trade_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| {
                error!("Failed to get trade {}: {}", trade_id, e);
                StoreError::Database(e)
            })?;
        record.map(Trade::try_from).transpose()
    }

    async fn partial_in(
        conn: &mut SqliteConnection,
        trade_id: i64,
        exit_qty: i64,
    ) -> Result<PartialExit, StoreError> {
        let Some(trade) = Self::fetch_in(conn, trade_id).await? else {
            debug!("Partial exit for trade {} ignored: not live", trade_id);
            return Ok(PartialExit::NoOp);
        };

        if exit_qty <= 0 || exit_qty >= trade.remaining_qty {
            warn!(
                "Partial exit of {} for trade {} ignored (remaining {})",
                exit_qty, trade_id, trade.remaining_qty
            );
            return Ok(PartialExit::NoOp);
        }

        let remaining_qty = trade.remaining_qty - exit_qty;
        let position_value = remaining_qty as f64 * trade.entry_price;
        let released_capital = trade.position_value - position_value;

        let updated = sqlx::query(
            r#"
            UPDATE trades
            SET remaining_qty = ?1, position_value = ?2, status = 'PARTIAL',
                hold_mode = 1, updated_at = ?3
            WHERE id = ?4 AND remaining_qty = ?5
            "#,
        )
        .bind(remaining_qty)
        .bind(position_value)
        .bind(Utc::now())
        .bind(trade_id)
        .bind(trade.remaining_qty)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        if updated == 0 {
            return Ok(PartialExit::NoOp);
        }

        CapitalLedger::adjust_available_capital(conn, released_capital).await?;

        info!(
            "Partial exit on {} (trade {}): {} booked, {} remaining, released {:.2}",
            trade.symbol, trade_id, exit_qty, remaining_qty, released_capital
        );
        Ok(PartialExit::Applied {
            remaining_qty,
            released_capital,
            trade,
        })
    }

    async fn close_in(
        conn: &mut SqliteConnection,
        trade_id: i64,
        exit_price: f64,
        exit_reason: ExitReason,
        closed_at: DateTime<Utc>,
    ) -> Result<CloseOutcome, StoreError> {
        let Some(trade) = Self::fetch_in(conn, trade_id).await? else {
            debug!("Close for trade {} ignored: already closed", trade_id);
            return Ok(CloseOutcome::AlreadyClosed);
        };

        sqlx::query(
            r#"
            INSERT INTO trade_history (
                trade_id, symbol, strategy, side, entry_price, exit_price, stop_loss,
                target, initial_qty, closed_qty, initial_position_value, risk_amount,
                confidence, exit_reason, entry_day, opened_at, closed_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
            "#,
        )
        .bind(trade.id)
        .bind(&trade.symbol)
        .bind(&trade.strategy)
        .bind(trade.side.as_str())
        .bind(trade.entry_price)
        .bind(exit_price)
        .bind(trade.stop_loss)
        .bind(trade.target)
        .bind(trade.initial_qty)
        .bind(trade.remaining_qty)
        .bind(trade.initial_qty as f64 * trade.entry_price)
        .bind(trade.risk_amount)
        .bind(trade.confidence)
        .bind(exit_reason.as_str())
        .bind(trade.entry_day)
        .bind(trade.created_at)
        .bind(closed_at)
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            error!("Failed to archive trade {}: {}", trade_id, e);
            StoreError::Database(e)
        })?;

        sqlx::query("DELETE FROM trades WHERE id = ?1")
            .bind(trade_id)
            .execute(&mut *conn)
            .await?;

        let released_capital = trade.position_value;
        CapitalLedger::adjust_available_capital(conn, released_capital).await?;

        info!(
            "✓ Trade {} closed: {} @ {:.2} ({}), released {:.2}",
            trade_id, trade.symbol, exit_price, exit_reason, released_capital
        );
        Ok(CloseOutcome::Archived {
            released_capital,
            trade,
        })
    }

    async fn insert_pnl_in(
        conn: &mut SqliteConnection,
        trade: &Trade,
        quantity: i64,
        exit_price: f64,
        exit_reason: ExitReason,
        exit_time: DateTime<Utc>,
    ) -> Result<RealizedPnl, StoreError> {
        let pnl = trade.side.signed_pnl(trade.entry_price, exit_price, quantity);
        let day = exit_time.with_timezone(&Local).date_naive();
        let (week, month) = pnl_buckets(day);

        let record = sqlx::query_as::<_, RealizedPnlRecord>(
            r#"
            INSERT INTO realized_pnl (
                trade_id, symbol, side, quantity, entry_price, exit_price, pnl,
                exit_reason, exit_time, day, week, month
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            RETURNING *
            "#,
        )
        .bind(trade.id)
        .bind(&trade.symbol)
        .bind(trade.side.as_str())
        .bind(quantity)
        .bind(trade.entry_price)
        .bind(exit_price)
        .bind(pnl)
        .bind(exit_reason.as_str())
        .bind(exit_time)
        .bind(day)
        .bind(week)
        .bind(month)
        .fetch_one(&mut *conn)
        .await?;

        debug!("Realized PnL {:.2} on {} x{}", pnl, trade.symbol, quantity);
        RealizedPnl::try_from(record)
    }
}
