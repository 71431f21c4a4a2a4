use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, info};
use uuid::Uuid;

use super::models::*;
use super::store::SettlementStore;
use crate::error::{AppError, AppResult, LedgerError};
use crate::fees::models::{FeeDirection, FeeEvent, FeeEventRow};

const RUN_COLUMNS: &str = r#"
    r.id, r.wallet_key, r.state, r.last_good_state,
    ARRAY(SELECT e.id FROM fee_events e WHERE e.run_id = r.id ORDER BY e.id) AS event_ids,
    r.net_amount, r.unsigned_tx, r.tx_hash, r.failure_reason, r.ledger_reported,
    r.claim_id, r.created_at, r.updated_at
"#;

/// Settlement ledger storage - THE source of truth for run state
pub struct PgSettlementStore {
    pub pool: PgPool,
}

impl PgSettlementStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_runs(&self, filter: &str, wallet_key: Option<&str>) -> AppResult<Vec<SettlementRun>> {
        let sql = format!(
            "SELECT {} FROM settlement_runs r WHERE {} ORDER BY r.created_at",
            RUN_COLUMNS, filter
        );
        let mut query = sqlx::query_as::<_, SettlementRunRow>(&sql);
        if let Some(wallet_key) = wallet_key {
            query = query.bind(wallet_key);
        }

        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(SettlementRun::from).collect())
    }
}

fn signed_delta(event: &FeeEvent) -> AppResult<i64> {
    let amount = i64::try_from(event.amount).map_err(|_| {
        AppError::InvalidAmount(format!("fee {} amount {} out of range", event.id, event.amount))
    })?;

    Ok(match event.direction {
        FeeDirection::Debit => amount,
        FeeDirection::Credit => -amount,
    })
}

#[async_trait]
impl SettlementStore for PgSettlementStore {
    // ========== EVENT OPERATIONS ==========

    async fn attach_event(&self, wallet_key: &str, event: &FeeEvent) -> AppResult<AttachOutcome> {
        if event.wallet_key != wallet_key {
            return Err(LedgerError::WalletMismatch {
                fee_id: event.id,
                owner: event.wallet_key.clone(),
                wallet: wallet_key.to_string(),
            }
            .into());
        }
        if event.collected {
            return Err(LedgerError::EventAlreadyCollected(event.id).into());
        }
        let delta = signed_delta(event)?;

        let mut tx = self.pool.begin().await?;

        // Serializes attaches per wallet so two loaders cannot both create a Draft
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(wallet_key)
            .execute(&mut *tx)
            .await?;

        let existing = sqlx::query_as::<_, (Uuid, String)>(
            "SELECT run_id, wallet_key FROM fee_events WHERE id = $1",
        )
        .bind(event.id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some((run_id, owner)) = existing {
            tx.commit().await?;
            if owner != wallet_key {
                return Err(LedgerError::WalletMismatch {
                    fee_id: event.id,
                    owner,
                    wallet: wallet_key.to_string(),
                }
                .into());
            }
            return Ok(AttachOutcome::AlreadyAttached { run_id });
        }

        let open = sqlx::query_as::<_, (Uuid, RunState)>(
            r#"
            SELECT id, state
            FROM settlement_runs
            WHERE wallet_key = $1 AND state NOT IN ('confirmed', 'failed')
            FOR UPDATE
            "#,
        )
        .bind(wallet_key)
        .fetch_optional(&mut *tx)
        .await?;

        let run_id = match open {
            Some((run_id, RunState::Draft)) => run_id,
            Some((run_id, state)) => {
                tx.commit().await?;
                return Ok(AttachOutcome::Deferred { run_id, state });
            }
            None => {
                let run_id = Uuid::new_v4();
                sqlx::query(
                    r#"
                    INSERT INTO settlement_runs (id, wallet_key, state)
                    VALUES ($1, $2, 'draft')
                    "#,
                )
                .bind(run_id)
                .bind(wallet_key)
                .execute(&mut *tx)
                .await?;

                info!(wallet = %wallet_key, run_id = %run_id, "📝 Opened draft settlement run");
                run_id
            }
        };

        sqlx::query(
            r#"
            INSERT INTO fee_events (id, wallet_key, run_id, amount, direction, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(event.id)
        .bind(wallet_key)
        .bind(run_id)
        .bind(delta.abs())
        .bind(event.direction)
        .bind(event.created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE settlement_runs
            SET net_amount = net_amount + $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(run_id)
        .bind(delta)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(wallet = %wallet_key, run_id = %run_id, fee_id = event.id, "Attached fee event");
        Ok(AttachOutcome::Attached { run_id })
    }

    async fn run_events(&self, run_id: Uuid) -> AppResult<Vec<FeeEvent>> {
        let rows = sqlx::query_as::<_, FeeEventRow>(
            r#"
            SELECT id, wallet_key, amount, direction, collected, created_at
            FROM fee_events
            WHERE run_id = $1
            ORDER BY id
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(FeeEventRow::into_event).collect())
    }

    // ========== RUN QUERIES ==========

    async fn get_run(&self, run_id: Uuid) -> AppResult<Option<SettlementRun>> {
        let sql = format!("SELECT {} FROM settlement_runs r WHERE r.id = $1", RUN_COLUMNS);
        let row = sqlx::query_as::<_, SettlementRunRow>(&sql)
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(SettlementRun::from))
    }

    async fn open_run(&self, wallet_key: &str) -> AppResult<Option<SettlementRun>> {
        let runs = self
            .fetch_runs(
                "r.wallet_key = $1 AND r.state NOT IN ('confirmed', 'failed')",
                Some(wallet_key),
            )
            .await?;

        Ok(runs.into_iter().next())
    }

    async fn runs_for_wallet(&self, wallet_key: &str, limit: i64) -> AppResult<Vec<SettlementRun>> {
        let sql = format!(
            "SELECT {} FROM settlement_runs r WHERE r.wallet_key = $1 ORDER BY r.created_at DESC LIMIT $2",
            RUN_COLUMNS
        );
        let rows = sqlx::query_as::<_, SettlementRunRow>(&sql)
            .bind(wallet_key)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(SettlementRun::from).collect())
    }

    async fn runs_in_state(&self, state: RunState) -> AppResult<Vec<SettlementRun>> {
        let sql = format!(
            "SELECT {} FROM settlement_runs r WHERE r.state = $1 ORDER BY r.updated_at",
            RUN_COLUMNS
        );
        let rows = sqlx::query_as::<_, SettlementRunRow>(&sql)
            .bind(state)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(SettlementRun::from).collect())
    }

    async fn stale_claims(&self, older_than: DateTime<Utc>) -> AppResult<Vec<SettlementRun>> {
        let sql = format!(
            r#"
            SELECT {} FROM settlement_runs r
            WHERE r.state IN ('transacting', 'signed') AND r.updated_at < $1
            ORDER BY r.updated_at
            "#,
            RUN_COLUMNS
        );
        let rows = sqlx::query_as::<_, SettlementRunRow>(&sql)
            .bind(older_than)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(SettlementRun::from).collect())
    }

    async fn collected_unreported(&self) -> AppResult<Vec<SettlementRun>> {
        self.fetch_runs(
            r#"
            NOT r.ledger_reported
            AND (
                r.state IN ('collected', 'broadcast', 'confirmed')
                OR (r.state = 'failed' AND r.last_good_state IN ('collected', 'broadcast'))
            )
            "#,
            None,
        )
        .await
    }

    // ========== STATE TRANSITIONS ==========

    async fn claim_draft(&self, wallet_key: &str) -> AppResult<Option<SettlementRun>> {
        // Conditional update: at most one concurrent claimer sees a row
        let claimed = sqlx::query_as::<_, (Uuid,)>(
            r#"
            UPDATE settlement_runs
            SET state = 'transacting', claim_id = $2, updated_at = NOW()
            WHERE wallet_key = $1 AND state = 'draft'
            RETURNING id
            "#,
        )
        .bind(wallet_key)
        .bind(Uuid::new_v4())
        .fetch_optional(&self.pool)
        .await?;

        match claimed {
            Some((run_id,)) => self.get_run(run_id).await,
            None => Ok(None),
        }
    }

    async fn compare_and_set(
        &self,
        run_id: Uuid,
        expected: RunState,
        next: RunState,
        update: RunUpdate,
        claim_id: Option<Uuid>,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE settlement_runs
            SET state = $3,
                unsigned_tx = COALESCE($4, unsigned_tx),
                tx_hash = COALESCE($5, tx_hash),
                failure_reason = COALESCE($6, failure_reason),
                last_good_state = COALESCE($7, last_good_state),
                updated_at = NOW()
            WHERE id = $1 AND state = $2
              AND ($8::uuid IS NULL OR claim_id = $8)
            "#,
        )
        .bind(run_id)
        .bind(expected)
        .bind(next)
        .bind(update.unsigned_tx)
        .bind(update.tx_hash)
        .bind(update.failure_reason)
        .bind(update.last_good_state)
        .bind(claim_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn collect_events(&self, run_id: Uuid, claim_id: Option<Uuid>) -> AppResult<bool> {
        let mut tx = self.pool.begin().await?;

        let moved = sqlx::query(
            r#"
            UPDATE settlement_runs
            SET state = 'collected', updated_at = NOW()
            WHERE id = $1 AND state = 'signed'
              AND ($2::uuid IS NULL OR claim_id = $2)
            "#,
        )
        .bind(run_id)
        .bind(claim_id)
        .execute(&mut *tx)
        .await?;

        if moved.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        let flipped = sqlx::query(
            r#"
            UPDATE fee_events
            SET collected = TRUE, collected_at = NOW()
            WHERE run_id = $1 AND NOT collected
            "#,
        )
        .bind(run_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(run_id = %run_id, "🧾 Marked {} fee events collected", flipped.rows_affected());
        Ok(true)
    }

    async fn set_ledger_reported(&self, run_id: Uuid) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE settlement_runs
            SET ledger_reported = TRUE, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::RunNotFound(run_id).into());
        }

        Ok(())
    }

    async fn reset_to_draft(&self, run_id: Uuid, expected: RunState) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE settlement_runs
            SET state = 'draft', unsigned_tx = NULL, claim_id = NULL, updated_at = NOW()
            WHERE id = $1 AND state = $2 AND state IN ('transacting', 'signed')
            "#,
        )
        .bind(run_id)
        .bind(expected)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
