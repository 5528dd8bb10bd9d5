//! Factory-driven creation of new wallet instances
//!
//! Creation submits the factory call and reports the deployed address, but
//! never touches the registry: the new instance enters local state only
//! through its creation event arriving on the ordered stream, the same path
//! as instances created by anyone else.

use crate::coordination::validate_owner_config;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::events::{indexed_address, topics};
use crate::tx::TransactionSender;

use ethers::types::{Address, TransactionReceipt, U256};
use std::sync::Arc;
use tracing::info;

/// Submits factory `create` calls and resolves the deployed instance.
pub struct CreationCoordinator {
    factory: Address,
    sender: Arc<TransactionSender>,
}

impl CreationCoordinator {
    pub fn new(factory: Address, sender: Arc<TransactionSender>) -> Self {
        Self { factory, sender }
    }

    /// Create a new wallet instance. Validates the owner configuration
    /// locally before spending gas, then returns the deployed address read
    /// from the factory's creation event in the receipt.
    pub async fn create_instance(
        &self,
        owners: &[String],
        signatures_required: u64,
        funding: U256,
    ) -> CoordinatorResult<Address> {
        let parsed = validate_owner_config(owners, signatures_required)?;

        let receipt = self
            .sender
            .submit_create(self.factory, &parsed, signatures_required, funding)
            .await?;

        let instance = Self::instance_from_receipt(&receipt)?;
        info!(
            "Created wallet instance {:?} ({} owners, threshold {})",
            instance,
            parsed.len(),
            signatures_required
        );

        Ok(instance)
    }

    fn instance_from_receipt(receipt: &TransactionReceipt) -> CoordinatorResult<Address> {
        receipt
            .logs
            .iter()
            .find(|log| log.topics.first() == Some(&*topics::WALLET_CREATED))
            .ok_or_else(|| {
                CoordinatorError::EventParsing(format!(
                    "create tx {:?} mined without a creation event",
                    receipt.transaction_hash
                ))
            })
            .and_then(|log| indexed_address(log, 1))
    }
}
