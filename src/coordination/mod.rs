//! Multisig coordination core
//!
//! The coordination module owns everything between raw wallet events and
//! on-chain submission:
//! 1. Instance discovery and active-instance selection (registry)
//! 2. Event-sourced projection of owner set, threshold, and nonce (projector)
//! 3. The proposal state machine and signature collection (proposal)
//! 4. New-instance creation through the factory (creation)
//! 5. The orchestration loop tying them together (engine)

pub mod creation;
pub mod engine;
pub mod projector;
pub mod proposal;
pub mod registry;

pub use creation::CreationCoordinator;
pub use engine::MultisigCoordinator;
pub use projector::{WalletInstance, WalletStateProjector};
pub use proposal::{Proposal, ProposalBook, ProposalKey, ProposalPayload, ProposalStatus};
pub use registry::InstanceRegistry;

use crate::error::{CoordinatorError, CoordinatorResult};
use ethers::types::Address;
use std::collections::HashSet;
use std::str::FromStr;

/// Validate an owner list and signature threshold for owner-set-affecting
/// payloads (wallet creation, ownership rotation).
///
/// Every address must be well-formed and unique; hex case differences do not
/// distinguish owners. The threshold must satisfy
/// `1 <= signatures_required <= owner count`.
pub fn validate_owner_config(
    owners: &[String],
    signatures_required: u64,
) -> CoordinatorResult<Vec<Address>> {
    if owners.is_empty() {
        return Err(CoordinatorError::Validation(
            "owner list is empty".to_string(),
        ));
    }

    if signatures_required == 0 {
        return Err(CoordinatorError::Validation(
            "signaturesRequired must be at least 1".to_string(),
        ));
    }

    if signatures_required > owners.len() as u64 {
        return Err(CoordinatorError::Validation(format!(
            "signaturesRequired {} exceeds owner count {}",
            signatures_required,
            owners.len()
        )));
    }

    let mut parsed = Vec::with_capacity(owners.len());
    let mut seen = HashSet::new();

    for raw in owners {
        // Address parsing normalizes hex case, so the dedup below is
        // case-insensitive.
        let address = Address::from_str(raw.trim())
            .map_err(|_| CoordinatorError::Validation(format!("malformed owner address {}", raw)))?;

        if !seen.insert(address) {
            return Err(CoordinatorError::Validation(format!(
                "duplicate owner address {}",
                raw
            )));
        }

        parsed.push(address);
    }

    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    const OWNER_A: &str = "0x34aA3F359A9D614239015126635CE7732c18fDF3";
    const OWNER_B: &str = "0xaB5801a7D398351b8bE11C439e05C5B3259aeC9B";

    #[test]
    fn test_accepts_valid_config() {
        let parsed =
            validate_owner_config(&[OWNER_A.to_string(), OWNER_B.to_string()], 2).unwrap();
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn test_rejects_zero_threshold() {
        let err = validate_owner_config(&[OWNER_A.to_string()], 0).unwrap_err();
        assert!(matches!(err, CoordinatorError::Validation(_)));
    }

    #[test]
    fn test_rejects_threshold_above_owner_count() {
        let err =
            validate_owner_config(&[OWNER_A.to_string(), OWNER_B.to_string()], 3).unwrap_err();
        assert!(matches!(err, CoordinatorError::Validation(_)));
    }

    #[test]
    fn test_rejects_case_insensitive_duplicates() {
        let err = validate_owner_config(
            &[OWNER_A.to_string(), OWNER_A.to_lowercase()],
            1,
        )
        .unwrap_err();
        assert!(matches!(err, CoordinatorError::Validation(_)));
    }

    #[test]
    fn test_rejects_malformed_address() {
        let err = validate_owner_config(&["not-an-address".to_string()], 1).unwrap_err();
        assert!(matches!(err, CoordinatorError::Validation(_)));
    }
}
