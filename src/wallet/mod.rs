pub mod balance;

use std::sync::Arc;

use uuid::Uuid;

use crate::error::AppResult;
use crate::ledger::LedgerRepository;

pub use balance::{derive_balance, WalletBalance};

/// Read-only wallet projection: fetch the steward's PAYOUT rows and active
/// dispute flags, then run the pure derivation. Nothing here ever writes.
pub struct WalletEngine {
    ledger: Arc<LedgerRepository>,
    default_currency: String,
}

impl WalletEngine {
    pub fn new(ledger: Arc<LedgerRepository>, default_currency: String) -> Self {
        Self {
            ledger,
            default_currency,
        }
    }

    pub async fn get_balance(&self, steward_id: Uuid) -> AppResult<WalletBalance> {
        let records = self.ledger.list_payout_records(steward_id).await?;
        let currency = self.currency_for(steward_id).await?;
        Ok(derive_balance(&records, currency))
    }

    /// Balance read on the caller's transaction. The withdrawal processor
    /// uses this after taking a row lock so the numbers it validates cannot
    /// change before its own write commits.
    pub async fn get_balance_in_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        steward_id: Uuid,
    ) -> AppResult<WalletBalance> {
        let records = self.ledger.list_payout_records_in_tx(tx, steward_id).await?;
        let currency = self.currency_for(steward_id).await?;
        Ok(derive_balance(&records, currency))
    }

    pub async fn currency_for(&self, steward_id: Uuid) -> AppResult<String> {
        Ok(self
            .ledger
            .steward_currency(steward_id)
            .await?
            .unwrap_or_else(|| self.default_currency.clone()))
    }
}
