//! Contract handles bound to the active wallet instance
//!
//! A [`ContractBinding`] owns the read handle (and, when a signer is
//! configured, the write handle) for exactly one wallet instance. Bindings
//! are rebuilt atomically on instance switch through [`BindingManager`], so
//! a latency-delayed call against a previously active instance can never be
//! answered by a stale handle.

use crate::chain::ChainProvider;
use crate::error::{CoordinatorError, CoordinatorResult};

use ethers::abi::{parse_abi, Abi};
use ethers::contract::Contract;
use ethers::prelude::*;
use lazy_static::lazy_static;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

lazy_static! {
    /// Wallet instance surface consumed by the coordinator.
    pub static ref WALLET_ABI: Abi = parse_abi(&[
        "function signaturesRequired() view returns (uint256)",
        "function nonce() view returns (uint256)",
        "function executeTransaction(address to, uint256 value, bytes data, bytes[] signatures) returns (bytes)",
        "function updateOwners(address[] owners, uint256 signaturesRequired)",
    ])
    .expect("static wallet ABI");

    /// Factory surface for instance creation.
    pub static ref FACTORY_ABI: Abi = parse_abi(&[
        "function create(uint256 chainId, address[] owners, uint256 signaturesRequired) payable",
    ])
    .expect("static factory ABI");
}

/// Live view-call handle for a single wallet instance. Writes go through
/// the transaction sender with encoded calldata, so the binding stays
/// read-only.
pub struct ContractBinding {
    instance: Address,
    read: Contract<Provider<Http>>,
}

impl ContractBinding {
    fn new(provider: &ChainProvider, instance: Address) -> Self {
        let read_client = Arc::new(provider.http().clone());
        let read = Contract::new(instance, WALLET_ABI.clone(), read_client);
        Self { instance, read }
    }

    pub fn instance(&self) -> Address {
        self.instance
    }

    /// Read `signaturesRequired()` from the instance contract.
    pub async fn signatures_required(&self) -> CoordinatorResult<u64> {
        let value: U256 = self
            .read
            .method("signaturesRequired", ())
            .map_err(|e| CoordinatorError::Internal(e.to_string()))?
            .call()
            .await
            .map_err(|e| CoordinatorError::ChainConnection(e.to_string()))?;
        Ok(value.as_u64())
    }

    /// Read the current execution `nonce()` from the instance contract.
    pub async fn execution_nonce(&self) -> CoordinatorResult<u64> {
        let value: U256 = self
            .read
            .method("nonce", ())
            .map_err(|e| CoordinatorError::Internal(e.to_string()))?
            .call()
            .await
            .map_err(|e| CoordinatorError::ChainConnection(e.to_string()))?;
        Ok(value.as_u64())
    }
}

/// Encode an `executeTransaction` call against a wallet instance.
pub fn encode_execute_call(
    to: Address,
    value: U256,
    data: &[u8],
    signatures: Vec<Vec<u8>>,
) -> CoordinatorResult<Bytes> {
    let func = WALLET_ABI
        .function("executeTransaction")
        .map_err(|e| CoordinatorError::Internal(e.to_string()))?;

    let sig_tokens = signatures
        .into_iter()
        .map(ethers::abi::Token::Bytes)
        .collect();

    let calldata = func
        .encode_input(&[
            ethers::abi::Token::Address(to),
            ethers::abi::Token::Uint(value),
            ethers::abi::Token::Bytes(data.to_vec()),
            ethers::abi::Token::Array(sig_tokens),
        ])
        .map_err(|e| CoordinatorError::Internal(e.to_string()))?;

    Ok(calldata.into())
}

/// Encode an `updateOwners` self-call, the payload for an ownership
/// rotation proposal.
pub fn encode_update_owners_call(
    owners: &[Address],
    signatures_required: u64,
) -> CoordinatorResult<Bytes> {
    let func = WALLET_ABI
        .function("updateOwners")
        .map_err(|e| CoordinatorError::Internal(e.to_string()))?;

    let owner_tokens = owners
        .iter()
        .map(|a| ethers::abi::Token::Address(*a))
        .collect();

    let calldata = func
        .encode_input(&[
            ethers::abi::Token::Array(owner_tokens),
            ethers::abi::Token::Uint(U256::from(signatures_required)),
        ])
        .map_err(|e| CoordinatorError::Internal(e.to_string()))?;

    Ok(calldata.into())
}

/// Encode a factory `create` call for a new wallet instance.
pub fn encode_create_call(
    chain_id: u64,
    owners: &[Address],
    signatures_required: u64,
) -> CoordinatorResult<Bytes> {
    let func = FACTORY_ABI
        .function("create")
        .map_err(|e| CoordinatorError::Internal(e.to_string()))?;

    let owner_tokens = owners
        .iter()
        .map(|a| ethers::abi::Token::Address(*a))
        .collect();

    let calldata = func
        .encode_input(&[
            ethers::abi::Token::Uint(U256::from(chain_id)),
            ethers::abi::Token::Array(owner_tokens),
            ethers::abi::Token::Uint(U256::from(signatures_required)),
        ])
        .map_err(|e| CoordinatorError::Internal(e.to_string()))?;

    Ok(calldata.into())
}

/// Owns the one live binding and rebuilds it on instance switch.
pub struct BindingManager {
    provider: Arc<ChainProvider>,
    current: RwLock<Option<Arc<ContractBinding>>>,
}

impl BindingManager {
    pub fn new(provider: Arc<ChainProvider>) -> Self {
        Self {
            provider,
            current: RwLock::new(None),
        }
    }

    /// Bind handles to `instance`. Idempotent: binding the already-active
    /// address reuses the existing handles. Binding a different address
    /// tears down the prior handles before the new binding becomes visible.
    pub async fn bind(&self, instance: Address) -> CoordinatorResult<Arc<ContractBinding>> {
        let mut current = self.current.write().await;

        if let Some(existing) = current.as_ref() {
            if existing.instance() == instance {
                debug!("Binding for {:?} already live, reusing", instance);
                return Ok(existing.clone());
            }
            info!(
                "Tearing down binding for {:?}, rebinding to {:?}",
                existing.instance(),
                instance
            );
        }

        let binding = Arc::new(ContractBinding::new(&self.provider, instance));

        // Old handles drop here, while the write lock is still held: no
        // window where readers observe the previous instance under the new
        // active address.
        *current = Some(binding.clone());

        Ok(binding)
    }

    /// Currently bound instance handles, if any.
    pub async fn active(&self) -> Option<Arc<ContractBinding>> {
        self.current.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::utils::keccak256;

    #[test]
    fn test_execute_calldata_carries_selector() {
        let calldata = encode_execute_call(
            Address::repeat_byte(0x11),
            U256::from(1_000u64),
            &[0xde, 0xad],
            vec![vec![0x01; 65], vec![0x02; 65]],
        )
        .unwrap();

        let selector =
            &keccak256("executeTransaction(address,uint256,bytes,bytes[])".as_bytes())[..4];
        assert_eq!(&calldata[..4], selector);
    }

    #[test]
    fn test_create_calldata_roundtrips_owner_list() {
        let owners = vec![Address::repeat_byte(0xa1), Address::repeat_byte(0xb2)];
        let calldata = encode_create_call(31337, &owners, 2).unwrap();

        let func = FACTORY_ABI.function("create").unwrap();
        let tokens = func.decode_input(&calldata[4..]).unwrap();
        assert_eq!(tokens[0].clone().into_uint().unwrap(), U256::from(31337));
        assert_eq!(tokens[2].clone().into_uint().unwrap(), U256::from(2));
    }
}
