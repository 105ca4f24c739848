use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{types::Json, PgPool, Postgres, Transaction as PgTransaction};
use uuid::Uuid;

use super::models::*;
use crate::error::{AppResult, EscrowError};

const TASK_COLS: &str = "id, client_id, steward_id, status, agreed_price, currency, expires_at, \
     is_expired, is_system, actual_end, metadata, created_at, updated_at";

const TX_COLS: &str = "id, task_id, milestone_id, amount, platform_fee, tx_type, status, \
     provider_reference, provider_transaction_id, metadata, created_at, updated_at";

const DISPUTE_COLS: &str =
    "id, task_id, transaction_id, raised_by, reason, status, resolution, created_at, resolved_at";

const MILESTONE_COLS: &str =
    "id, task_id, title, amount, order_index, status, created_at, updated_at";

const PAYOUT_RECORD_SQL: &str = "SELECT t.amount, t.status, \
     EXISTS (SELECT 1 FROM disputes d \
             WHERE d.task_id = t.task_id \
               AND d.status IN ('open', 'under_review')) AS dispute_active \
     FROM transactions t \
     JOIN tasks k ON k.id = t.task_id \
     WHERE t.tx_type = 'payout' AND k.steward_id = $1";

/// New ledger entry, inserted inside the caller's transaction.
pub struct NewTransaction {
    pub id: Uuid,
    pub task_id: Option<Uuid>,
    pub milestone_id: Option<Uuid>,
    pub amount: Decimal,
    pub platform_fee: Decimal,
    pub tx_type: TransactionType,
    pub status: TransactionStatus,
    pub metadata: TransactionMetadata,
}

/// Ledger repository - THE source of truth for all money state.
///
/// Every multi-record effect runs inside a single `sqlx::Transaction`; reads
/// that feed a mutation use `FOR UPDATE` so the integrity check and the write
/// see the same row under concurrency.
pub struct LedgerRepository {
    pub pool: PgPool,
}

impl LedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn begin_tx(&self) -> AppResult<PgTransaction<'static, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    // ========== TASK OPERATIONS ==========

    pub async fn get_task(&self, task_id: Uuid) -> AppResult<Option<Task>> {
        let sql = format!("SELECT {} FROM tasks WHERE id = $1", TASK_COLS);
        let task = sqlx::query_as::<_, Task>(&sql)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(task)
    }

    pub async fn get_task_for_update(
        &self,
        tx: &mut PgTransaction<'_, Postgres>,
        task_id: Uuid,
    ) -> AppResult<Option<Task>> {
        let sql = format!("SELECT {} FROM tasks WHERE id = $1 FOR UPDATE", TASK_COLS);
        let task = sqlx::query_as::<_, Task>(&sql)
            .bind(task_id)
            .fetch_optional(&mut **tx)
            .await?;
        Ok(task)
    }

    pub async fn update_task_status(
        &self,
        tx: &mut PgTransaction<'_, Postgres>,
        task_id: Uuid,
        to: TaskStatus,
    ) -> AppResult<()> {
        sqlx::query("UPDATE tasks SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(task_id)
            .bind(to)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Mark a task DONE, setting `actual_end` only if it was unset.
    pub async fn mark_task_done(
        &self,
        tx: &mut PgTransaction<'_, Postgres>,
        task_id: Uuid,
    ) -> AppResult<()> {
        sqlx::query(
            "UPDATE tasks SET status = 'done', actual_end = COALESCE(actual_end, NOW()), \
             updated_at = NOW() WHERE id = $1",
        )
        .bind(task_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn set_task_metadata(
        &self,
        tx: &mut PgTransaction<'_, Postgres>,
        task_id: Uuid,
        metadata: &TaskMetadata,
    ) -> AppResult<()> {
        sqlx::query("UPDATE tasks SET metadata = $2, updated_at = NOW() WHERE id = $1")
            .bind(task_id)
            .bind(Json(metadata))
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// The task is expired regardless of how the refund attempt went.
    pub async fn mark_task_expired(
        &self,
        tx: &mut PgTransaction<'_, Postgres>,
        task_id: Uuid,
    ) -> AppResult<()> {
        sqlx::query(
            "UPDATE tasks SET status = 'expired', is_expired = TRUE, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(task_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Find or lazily create the synthetic "system withdrawal" task that
    /// cash-out PAYOUTs attach to. One per steward.
    pub async fn ensure_withdrawal_task(
        &self,
        steward_id: Uuid,
        currency: &str,
    ) -> AppResult<Task> {
        let sql = format!(
            "SELECT {} FROM tasks WHERE steward_id = $1 AND is_system = TRUE",
            TASK_COLS
        );
        if let Some(task) = sqlx::query_as::<_, Task>(&sql)
            .bind(steward_id)
            .fetch_optional(&self.pool)
            .await?
        {
            return Ok(task);
        }

        let sql = format!(
            "INSERT INTO tasks (id, client_id, steward_id, status, agreed_price, currency, \
             is_expired, is_system, metadata) \
             VALUES ($1, $2, $2, 'done', 0, $3, FALSE, TRUE, '{{}}') \
             ON CONFLICT (steward_id) WHERE is_system DO NOTHING \
             RETURNING {}",
            TASK_COLS
        );
        if let Some(task) = sqlx::query_as::<_, Task>(&sql)
            .bind(Uuid::new_v4())
            .bind(steward_id)
            .bind(currency)
            .fetch_optional(&self.pool)
            .await?
        {
            return Ok(task);
        }

        // Concurrent creation won the race; re-read.
        let sql = format!(
            "SELECT {} FROM tasks WHERE steward_id = $1 AND is_system = TRUE",
            TASK_COLS
        );
        let task = sqlx::query_as::<_, Task>(&sql)
            .bind(steward_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(task)
    }

    pub async fn list_expired_open_tasks(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> AppResult<Vec<Task>> {
        let sql = format!(
            "SELECT {} FROM tasks \
             WHERE status = 'open' AND is_expired = FALSE AND is_system = FALSE \
               AND expires_at IS NOT NULL AND expires_at < $1 \
             ORDER BY expires_at ASC LIMIT $2",
            TASK_COLS
        );
        let tasks = sqlx::query_as::<_, Task>(&sql)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(tasks)
    }

    // ========== TRANSACTION OPERATIONS ==========

    pub async fn insert_transaction(
        &self,
        tx: &mut PgTransaction<'_, Postgres>,
        new: NewTransaction,
    ) -> AppResult<Transaction> {
        let sql = format!(
            "INSERT INTO transactions \
             (id, task_id, milestone_id, amount, platform_fee, tx_type, status, \
              provider_reference, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             RETURNING {}",
            TX_COLS
        );
        let row = sqlx::query_as::<_, Transaction>(&sql)
            .bind(new.id)
            .bind(new.task_id)
            .bind(new.milestone_id)
            .bind(new.amount)
            .bind(new.platform_fee)
            .bind(new.tx_type)
            .bind(new.status)
            .bind(new.id.to_string())
            .bind(Json(&new.metadata))
            .fetch_one(&mut **tx)
            .await?;
        Ok(row)
    }

    pub async fn get_transaction(&self, id: Uuid) -> AppResult<Option<Transaction>> {
        let sql = format!("SELECT {} FROM transactions WHERE id = $1", TX_COLS);
        let row = sqlx::query_as::<_, Transaction>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn get_transaction_for_update(
        &self,
        tx: &mut PgTransaction<'_, Postgres>,
        id: Uuid,
    ) -> AppResult<Option<Transaction>> {
        let sql = format!("SELECT {} FROM transactions WHERE id = $1 FOR UPDATE", TX_COLS);
        let row = sqlx::query_as::<_, Transaction>(&sql)
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?;
        Ok(row)
    }

    pub async fn get_by_reference_for_update(
        &self,
        tx: &mut PgTransaction<'_, Postgres>,
        reference: &str,
        tx_type: TransactionType,
    ) -> AppResult<Option<Transaction>> {
        let sql = format!(
            "SELECT {} FROM transactions WHERE provider_reference = $1 AND tx_type = $2 FOR UPDATE",
            TX_COLS
        );
        let row = sqlx::query_as::<_, Transaction>(&sql)
            .bind(reference)
            .bind(tx_type)
            .fetch_optional(&mut **tx)
            .await?;
        Ok(row)
    }

    /// Count charges still holding client money (HELD or DISPUTED) for a
    /// task. Read inside the caller's transaction so the count and the
    /// subsequent write cannot race.
    pub async fn count_escrowed_charges(
        &self,
        tx: &mut PgTransaction<'_, Postgres>,
        task_id: Uuid,
    ) -> AppResult<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM transactions \
             WHERE task_id = $1 AND tx_type = 'charge' AND status IN ('held', 'disputed')",
        )
        .bind(task_id)
        .fetch_one(&mut **tx)
        .await?;
        Ok(count)
    }

    pub async fn count_held_charges(
        &self,
        tx: &mut PgTransaction<'_, Postgres>,
        task_id: Uuid,
    ) -> AppResult<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM transactions \
             WHERE task_id = $1 AND tx_type = 'charge' AND status = 'held'",
        )
        .bind(task_id)
        .fetch_one(&mut **tx)
        .await?;
        Ok(count)
    }

    /// Guarded status flip. `rows_affected == 0` means another actor moved
    /// the row first; that surfaces as InvalidStateTransition, never as a
    /// silent overwrite.
    pub async fn update_transaction_status_guarded(
        &self,
        tx: &mut PgTransaction<'_, Postgres>,
        id: Uuid,
        from: TransactionStatus,
        to: TransactionStatus,
    ) -> AppResult<()> {
        let result = sqlx::query(
            "UPDATE transactions SET status = $3, updated_at = NOW() \
             WHERE id = $1 AND status = $2",
        )
        .bind(id)
        .bind(from)
        .bind(to)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EscrowError::InvalidStateTransition {
                current: "unknown".to_string(),
                requested: from.to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// PENDING → HELD with provider metadata, guarded on PENDING.
    /// Returns false when the row was not PENDING (idempotent re-delivery).
    pub async fn confirm_charge_held(
        &self,
        tx: &mut PgTransaction<'_, Postgres>,
        id: Uuid,
        provider_transaction_id: &str,
        metadata: &TransactionMetadata,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE transactions \
             SET status = 'held', provider_transaction_id = $2, metadata = $3, updated_at = NOW() \
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .bind(provider_transaction_id)
        .bind(Json(metadata))
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Record a completed charge (milestone flow), guarded on PENDING.
    pub async fn complete_charge(
        &self,
        tx: &mut PgTransaction<'_, Postgres>,
        id: Uuid,
        provider_transaction_id: &str,
        metadata: &TransactionMetadata,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE transactions \
             SET status = 'completed', provider_transaction_id = $2, metadata = $3, \
                 updated_at = NOW() \
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .bind(provider_transaction_id)
        .bind(Json(metadata))
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn fail_pending_transaction(
        &self,
        tx: &mut PgTransaction<'_, Postgres>,
        id: Uuid,
        metadata: &TransactionMetadata,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE transactions SET status = 'failed', metadata = $2, updated_at = NOW() \
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .bind(Json(metadata))
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Reconcile a withdrawal PAYOUT from a provider transfer event. PENDING
    /// flips either way; COMPLETED may still flip to FAILED on reversal.
    pub async fn update_payout_transfer(
        &self,
        tx: &mut PgTransaction<'_, Postgres>,
        id: Uuid,
        to: TransactionStatus,
        provider_transfer_id: &str,
        metadata: &TransactionMetadata,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE transactions \
             SET status = $2, provider_transaction_id = $3, metadata = $4, updated_at = NOW() \
             WHERE id = $1 AND tx_type = 'payout' AND status IN ('pending', 'completed')",
        )
        .bind(id)
        .bind(to)
        .bind(provider_transfer_id)
        .bind(Json(metadata))
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// HELD charges on DONE tasks, unmoved since before the cutoff.
    pub async fn list_stale_held_charges(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> AppResult<Vec<Transaction>> {
        let cols: Vec<String> = TX_COLS.split(", ").map(|c| format!("t.{}", c)).collect();
        let sql = format!(
            "SELECT {} FROM transactions t \
             JOIN tasks k ON k.id = t.task_id \
             WHERE t.tx_type = 'charge' AND t.status = 'held' \
               AND t.updated_at < $1 AND k.status = 'done' \
             ORDER BY t.updated_at ASC LIMIT $2",
            cols.join(", ")
        );
        let rows = sqlx::query_as::<_, Transaction>(&sql)
            .bind(cutoff)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Latest charge still carrying client money for an expiring task.
    pub async fn find_refundable_charge(&self, task_id: Uuid) -> AppResult<Option<Transaction>> {
        let sql = format!(
            "SELECT {} FROM transactions \
             WHERE task_id = $1 AND tx_type = 'charge' AND status IN ('held', 'completed') \
             ORDER BY created_at DESC LIMIT 1",
            TX_COLS
        );
        let row = sqlx::query_as::<_, Transaction>(&sql)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    // ========== WALLET PROJECTION ==========

    /// Every PAYOUT linked to a task where the user is steward - the
    /// synthetic withdrawal task included - with a flag for whether the task
    /// has an open or under-review dispute. Input to the pure balance
    /// derivation; no balance is ever persisted.
    pub async fn list_payout_records(&self, steward_id: Uuid) -> AppResult<Vec<PayoutRecord>> {
        let rows = sqlx::query_as::<_, PayoutRecord>(PAYOUT_RECORD_SQL)
            .bind(steward_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Same projection, read on the caller's transaction. Used by the
    /// withdrawal path so the balance it validates against and the PAYOUT it
    /// writes sit inside one transaction boundary.
    pub async fn list_payout_records_in_tx(
        &self,
        tx: &mut PgTransaction<'_, Postgres>,
        steward_id: Uuid,
    ) -> AppResult<Vec<PayoutRecord>> {
        let rows = sqlx::query_as::<_, PayoutRecord>(PAYOUT_RECORD_SQL)
            .bind(steward_id)
            .fetch_all(&mut **tx)
            .await?;
        Ok(rows)
    }

    pub async fn steward_currency(&self, steward_id: Uuid) -> AppResult<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT currency FROM tasks \
             WHERE steward_id = $1 AND is_system = FALSE \
             ORDER BY created_at ASC LIMIT 1",
        )
        .bind(steward_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(c,)| c))
    }

    // ========== DISPUTE OPERATIONS ==========

    pub async fn insert_dispute(
        &self,
        tx: &mut PgTransaction<'_, Postgres>,
        task_id: Uuid,
        transaction_id: Uuid,
        raised_by: Uuid,
        reason: &str,
    ) -> AppResult<Dispute> {
        let sql = format!(
            "INSERT INTO disputes (id, task_id, transaction_id, raised_by, reason, status) \
             VALUES ($1, $2, $3, $4, $5, 'open') \
             RETURNING {}",
            DISPUTE_COLS
        );
        let row = sqlx::query_as::<_, Dispute>(&sql)
            .bind(Uuid::new_v4())
            .bind(task_id)
            .bind(transaction_id)
            .bind(raised_by)
            .bind(reason)
            .fetch_one(&mut **tx)
            .await?;
        Ok(row)
    }

    pub async fn get_dispute(&self, id: Uuid) -> AppResult<Option<Dispute>> {
        let sql = format!("SELECT {} FROM disputes WHERE id = $1", DISPUTE_COLS);
        let row = sqlx::query_as::<_, Dispute>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn active_dispute_for_task(&self, task_id: Uuid) -> AppResult<Option<Dispute>> {
        let sql = format!(
            "SELECT {} FROM disputes \
             WHERE task_id = $1 AND status IN ('open', 'under_review') LIMIT 1",
            DISPUTE_COLS
        );
        let row = sqlx::query_as::<_, Dispute>(&sql)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Guarded on the dispute still being open/under review.
    pub async fn resolve_dispute(
        &self,
        tx: &mut PgTransaction<'_, Postgres>,
        id: Uuid,
        resolution: &str,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE disputes SET status = 'resolved', resolution = $2, resolved_at = NOW() \
             WHERE id = $1 AND status IN ('open', 'under_review')",
        )
        .bind(id)
        .bind(resolution)
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // ========== MILESTONE OPERATIONS ==========

    pub async fn task_has_milestones(&self, task_id: Uuid) -> AppResult<bool> {
        let (exists,): (bool,) =
            sqlx::query_as("SELECT EXISTS (SELECT 1 FROM payment_milestones WHERE task_id = $1)")
                .bind(task_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    pub async fn insert_milestone(
        &self,
        tx: &mut PgTransaction<'_, Postgres>,
        task_id: Uuid,
        title: &str,
        amount: Decimal,
        order_index: i32,
    ) -> AppResult<PaymentMilestone> {
        let sql = format!(
            "INSERT INTO payment_milestones (id, task_id, title, amount, order_index, status) \
             VALUES ($1, $2, $3, $4, $5, 'pending') \
             RETURNING {}",
            MILESTONE_COLS
        );
        let row = sqlx::query_as::<_, PaymentMilestone>(&sql)
            .bind(Uuid::new_v4())
            .bind(task_id)
            .bind(title)
            .bind(amount)
            .bind(order_index)
            .fetch_one(&mut **tx)
            .await?;
        Ok(row)
    }

    pub async fn get_milestone(&self, id: Uuid) -> AppResult<Option<PaymentMilestone>> {
        let sql = format!("SELECT {} FROM payment_milestones WHERE id = $1", MILESTONE_COLS);
        let row = sqlx::query_as::<_, PaymentMilestone>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn list_milestones(&self, task_id: Uuid) -> AppResult<Vec<PaymentMilestone>> {
        let sql = format!(
            "SELECT {} FROM payment_milestones WHERE task_id = $1 ORDER BY order_index ASC",
            MILESTONE_COLS
        );
        let rows = sqlx::query_as::<_, PaymentMilestone>(&sql)
            .bind(task_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn update_milestone_status_guarded(
        &self,
        tx: &mut PgTransaction<'_, Postgres>,
        id: Uuid,
        from: MilestoneStatus,
        to: MilestoneStatus,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE payment_milestones SET status = $3, updated_at = NOW() \
             WHERE id = $1 AND status = $2",
        )
        .bind(id)
        .bind(from)
        .bind(to)
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn latest_charge_for_milestone(
        &self,
        milestone_id: Uuid,
    ) -> AppResult<Option<Transaction>> {
        let sql = format!(
            "SELECT {} FROM transactions \
             WHERE milestone_id = $1 AND tx_type = 'charge' \
             ORDER BY created_at DESC LIMIT 1",
            TX_COLS
        );
        let row = sqlx::query_as::<_, Transaction>(&sql)
            .bind(milestone_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn milestone_has_completed_charge(&self, milestone_id: Uuid) -> AppResult<bool> {
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM transactions \
             WHERE milestone_id = $1 AND tx_type = 'charge' AND status = 'completed')",
        )
        .bind(milestone_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    // ========== SECURITY EVENTS ==========

    /// Append-only. Written on the pool, not the caller's transaction, so an
    /// aborted money mutation still leaves its audit row behind.
    pub async fn record_security_event(
        &self,
        event_type: SecurityEventType,
        actor: &str,
        task_id: Option<Uuid>,
        transaction_id: Option<Uuid>,
        details: serde_json::Value,
    ) -> AppResult<SecurityEvent> {
        let row = sqlx::query_as::<_, SecurityEvent>(
            "INSERT INTO security_events (id, event_type, actor, task_id, transaction_id, details) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING id, event_type, actor, task_id, transaction_id, details, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(event_type)
        .bind(actor)
        .bind(task_id)
        .bind(transaction_id)
        .bind(Json(details))
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }
}
