//! Signed transaction submission
//!
//! One attempt per call: a submission either produces a mined receipt, a
//! `Revert` with the extracted reason, or a `Timeout`. Whether and when to
//! retry is the caller's decision, because re-sending a multisig execution
//! blindly can burn gas against an already-consumed nonce.

use crate::chain::binding::{encode_create_call, encode_execute_call};
use crate::chain::{ChainProvider, GasPrice};
use crate::config::CoordinatorConfig;
use crate::coordination::proposal::Proposal;
use crate::error::{CoordinatorError, CoordinatorResult};

use ethers::middleware::SignerMiddleware;
use ethers::prelude::*;
use ethers::signers::LocalWallet;
use ethers::types::transaction::eip2718::TypedTransaction;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Builds, signs, and lands transactions on the configured chain.
pub struct TransactionSender {
    provider: Arc<ChainProvider>,
    client: SignerMiddleware<Provider<Http>, LocalWallet>,
    submission_timeout: Duration,
}

impl TransactionSender {
    pub fn new(
        provider: Arc<ChainProvider>,
        wallet: LocalWallet,
        config: &CoordinatorConfig,
    ) -> Self {
        let wallet = wallet.with_chain_id(provider.chain_id());
        let client = SignerMiddleware::new(provider.http().clone(), wallet);
        Self {
            provider,
            client,
            submission_timeout: Duration::from_secs(config.submission_timeout_secs),
        }
    }

    pub fn sender_address(&self) -> Address {
        self.client.signer().address()
    }

    /// Submit a threshold-complete proposal as an `executeTransaction` call
    /// against its wallet instance.
    pub async fn submit_execute(&self, proposal: &Proposal) -> CoordinatorResult<TransactionReceipt> {
        let calldata = encode_execute_call(
            proposal.payload.to,
            proposal.payload.value,
            &proposal.payload.data,
            proposal.signature_list(),
        )?;

        info!(
            "Submitting proposal {} ({} signatures)",
            proposal.key,
            proposal.signatures.len()
        );

        self.send(proposal.key.instance, U256::zero(), calldata).await
    }

    /// Submit a factory `create` call, optionally funding the new instance.
    pub async fn submit_create(
        &self,
        factory: Address,
        owners: &[Address],
        signatures_required: u64,
        funding: U256,
    ) -> CoordinatorResult<TransactionReceipt> {
        let calldata = encode_create_call(self.provider.chain_id(), owners, signatures_required)?;

        info!(
            "Submitting factory create: {} owners, threshold {}, funding {} wei",
            owners.len(),
            signatures_required,
            funding
        );

        self.send(factory, funding, calldata).await
    }

    /// Build, sign, send, and await one transaction.
    async fn send(
        &self,
        to: Address,
        value: U256,
        calldata: Bytes,
    ) -> CoordinatorResult<TransactionReceipt> {
        let from = self.sender_address();
        let account_nonce = self
            .client
            .get_transaction_count(from, Some(BlockNumber::Pending.into()))
            .await
            .map_err(|e| CoordinatorError::ChainConnection(e.to_string()))?;

        let mut tx = self.build_transaction(to, value, calldata.clone()).await?;
        tx.set_from(from);
        tx.set_nonce(account_nonce);

        let gas = self.provider.estimate_gas(&tx).await?;
        // 20% headroom over the estimate
        tx.set_gas(gas * 120 / 100);

        debug!(
            "Sending tx to {:?}: nonce {}, gas limit {}",
            to,
            account_nonce,
            gas * 120 / 100
        );

        let pending = self
            .client
            .send_transaction(tx.clone(), None)
            .await
            .map_err(|e| CoordinatorError::ChainConnection(e.to_string()))?;

        let tx_hash = *pending;
        let confirmations = self.provider.confirmation_blocks() as usize;

        let receipt = tokio::time::timeout(
            self.submission_timeout,
            pending.confirmations(confirmations),
        )
        .await
        .map_err(|_| CoordinatorError::Timeout {
            operation: format!("confirmation of {:?}", tx_hash),
        })?
        .map_err(|e| CoordinatorError::ChainConnection(e.to_string()))?
        .ok_or_else(|| CoordinatorError::ChainConnection(format!("tx {:?} dropped", tx_hash)))?;

        if receipt.status == Some(U64::zero()) {
            let reason = self.extract_revert_reason(&tx, receipt.block_number).await;
            warn!("Tx {:?} reverted: {}", tx_hash, reason);
            return Err(CoordinatorError::Revert(reason));
        }

        info!(
            "Tx {:?} mined in block {:?}",
            tx_hash,
            receipt.block_number.unwrap_or_default()
        );

        Ok(receipt)
    }

    async fn build_transaction(
        &self,
        to: Address,
        value: U256,
        calldata: Bytes,
    ) -> CoordinatorResult<TypedTransaction> {
        let tx = match self.provider.get_gas_price().await? {
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => TypedTransaction::Eip1559(
                Eip1559TransactionRequest::new()
                    .to(to)
                    .value(value)
                    .data(calldata)
                    .max_fee_per_gas(max_fee_per_gas)
                    .max_priority_fee_per_gas(max_priority_fee_per_gas),
            ),
            GasPrice::Legacy(price) => TypedTransaction::Legacy(
                TransactionRequest::new()
                    .to(to)
                    .value(value)
                    .data(calldata)
                    .gas_price(price),
            ),
        };
        Ok(tx)
    }

    /// Replay a reverted transaction as an `eth_call` at its mined block to
    /// recover the revert string.
    async fn extract_revert_reason(
        &self,
        tx: &TypedTransaction,
        block: Option<U64>,
    ) -> String {
        match self
            .client
            .call(tx, block.map(|b| BlockNumber::Number(b).into()))
            .await
        {
            Ok(_) => "reverted without reason".to_string(),
            Err(e) => e.to_string(),
        }
    }
}
