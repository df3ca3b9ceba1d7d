use std::sync::Arc;

use async_trait::async_trait;
use claimwatch_domain::{
    model::{NewDeposit, TransferEvent},
    storage::DepositStore,
};
use metrics::counter;
use tracing::{info, warn};

use crate::dispatcher::{DepositHandler, HandlerError};

/// Deposit handler that records every dispatched transfer in the deposit
/// store. A signature the store already holds is treated as handled.
pub struct StoringDepositHandler<S> {
    store: Arc<S>,
}

impl<S> StoringDepositHandler<S>
where
    S: DepositStore,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S> DepositHandler for StoringDepositHandler<S>
where
    S: DepositStore + 'static,
{
    async fn handle_deposit(&self, event: &TransferEvent) -> Result<(), HandlerError> {
        let inserted = self
            .store
            .insert_deposit(NewDeposit::from(event))
            .await
            .map_err(HandlerError::from_source)?;

        if inserted {
            counter!("monitor_deposits_stored_total", "result" => "persisted").increment(1);
            info!(
                signature = %event.signature,
                amount = event.amount,
                "deposit recorded"
            );
        } else {
            counter!("monitor_deposits_stored_total", "result" => "existing").increment(1);
            warn!(signature = %event.signature, "deposit already recorded");
        }
        Ok(())
    }
}
