//! Proposal state machine and signature collection
//!
//! A proposal moves through
//! `Draft -> Collecting -> ThresholdReached -> Submitting -> Confirmed | Failed`,
//! with `Stale` reachable from any non-terminal state when the active
//! instance switches or the on-chain nonce advances past the proposal's.
//! A stale proposal is never submitted.
//!
//! Proposals are keyed by (instance, proposed nonce, payload hash), so two
//! owners proposing the identical call for the same nonce converge on one
//! record whose signature sets merge instead of racing as duplicates.

use crate::coordination::validate_owner_config;
use crate::error::{CoordinatorError, CoordinatorResult};

use chrono::{DateTime, Utc};
use ethers::types::{Address, Bytes, H256, U256};
use sha3::{Digest, Keccak256};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The call a proposal wants the wallet to execute.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposalPayload {
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
}

impl ProposalPayload {
    pub fn new(to: Address, value: U256, data: Bytes) -> Self {
        Self { to, value, data }
    }

    /// Build an ownership-rotation payload targeting the wallet itself.
    /// Runs the shared owner-set field validation before encoding.
    pub fn owner_change(
        wallet: Address,
        owners: &[String],
        signatures_required: u64,
    ) -> CoordinatorResult<Self> {
        let parsed = validate_owner_config(owners, signatures_required)?;
        let data = crate::chain::binding::encode_update_owners_call(&parsed, signatures_required)?;
        Ok(Self {
            to: wallet,
            value: U256::zero(),
            data,
        })
    }

    /// keccak256(to || value || data): the payload component of the
    /// proposal key.
    pub fn hash(&self) -> H256 {
        let mut hasher = Keccak256::new();
        hasher.update(self.to.as_bytes());
        let mut value_bytes = [0u8; 32];
        self.value.to_big_endian(&mut value_bytes);
        hasher.update(value_bytes);
        hasher.update(&self.data);
        H256::from_slice(&hasher.finalize())
    }
}

/// Identity of a proposal: two clients building the same call for the same
/// instance and nonce produce the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProposalKey {
    pub instance: Address,
    pub nonce: u64,
    pub payload_hash: H256,
}

impl ProposalKey {
    pub fn new(instance: Address, nonce: u64, payload: &ProposalPayload) -> Self {
        Self {
            instance,
            nonce,
            payload_hash: payload.hash(),
        }
    }
}

impl fmt::Display for ProposalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}:{}:{}",
            self.instance,
            self.nonce,
            hex::encode(&self.payload_hash.as_bytes()[..8])
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposalStatus {
    Draft,
    Collecting,
    ThresholdReached,
    Submitting,
    Confirmed,
    Failed,
    Stale,
}

impl ProposalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalStatus::Draft => "draft",
            ProposalStatus::Collecting => "collecting",
            ProposalStatus::ThresholdReached => "threshold_reached",
            ProposalStatus::Submitting => "submitting",
            ProposalStatus::Confirmed => "confirmed",
            ProposalStatus::Failed => "failed",
            ProposalStatus::Stale => "stale",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProposalStatus::Confirmed | ProposalStatus::Failed | ProposalStatus::Stale
        )
    }
}

/// One tracked proposal and its collected signatures.
#[derive(Debug, Clone)]
pub struct Proposal {
    pub id: Uuid,
    pub key: ProposalKey,
    pub payload: ProposalPayload,
    /// owner -> signature bytes; keys unique by construction.
    pub signatures: BTreeMap<Address, Vec<u8>>,
    pub status: ProposalStatus,
    /// Revert/timeout reason for `Failed`, preserved verbatim.
    pub failure_reason: Option<String>,
    /// Why the proposal went `Stale`, so callers can observe what happened.
    pub stale_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Proposal {
    fn new(key: ProposalKey, payload: ProposalPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            key,
            payload,
            signatures: BTreeMap::new(),
            status: ProposalStatus::Draft,
            failure_reason: None,
            stale_reason: None,
            created_at: Utc::now(),
        }
    }

    /// Ordered signature bytes for on-chain submission.
    pub fn signature_list(&self) -> Vec<Vec<u8>> {
        self.signatures.values().cloned().collect()
    }
}

/// Holds every tracked proposal and enforces the state machine.
///
/// The book is synchronous; the engine serializes access and handles relay
/// and chain I/O around it.
#[derive(Default)]
pub struct ProposalBook {
    proposals: HashMap<ProposalKey, Proposal>,
    /// Instances with an in-flight submission. At most one proposal may be
    /// `Submitting` per instance; a second concurrent submit is rejected,
    /// not queued, to avoid nonce races.
    submitting: HashSet<Address>,
}

impl ProposalBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a proposal. An identical key already `Draft`/`Collecting`
    /// is reused (signature sets will merge) instead of creating a second
    /// record for the same (instance, nonce, payload).
    pub fn register(&mut self, key: ProposalKey, payload: ProposalPayload) -> &Proposal {
        let entry = self.proposals.entry(key).or_insert_with(|| {
            info!("Tracking proposal {}", key);
            Proposal::new(key, payload)
        });
        entry
    }

    /// Draft -> Collecting, once the relay has accepted the proposal.
    pub fn mark_collecting(&mut self, key: &ProposalKey) -> CoordinatorResult<()> {
        let proposal = self.get_mut(key)?;
        if proposal.status == ProposalStatus::Draft {
            proposal.status = ProposalStatus::Collecting;
        }
        Ok(())
    }

    /// Verify a proposal is still actionable against the live active
    /// instance and projected nonce. On violation the proposal transitions
    /// to `Stale` and the call fails with `StaleProposal`.
    pub fn ensure_live(
        &mut self,
        key: &ProposalKey,
        active_instance: Option<Address>,
        live_nonce: u64,
    ) -> CoordinatorResult<()> {
        let proposal = self.get_mut(key)?;

        if proposal.status.is_terminal() {
            return Err(CoordinatorError::StaleProposal {
                key: key.to_string(),
                reason: format!("proposal is {}", proposal.status.as_str()),
            });
        }

        if active_instance != Some(key.instance) {
            let reason = "active instance changed".to_string();
            Self::transition_stale(proposal, &reason);
            return Err(CoordinatorError::StaleProposal {
                key: key.to_string(),
                reason,
            });
        }

        if key.nonce != live_nonce {
            let reason = format!(
                "on-chain nonce advanced to {} past proposed {}",
                live_nonce, key.nonce
            );
            Self::transition_stale(proposal, &reason);
            return Err(CoordinatorError::StaleProposal {
                key: key.to_string(),
                reason,
            });
        }

        Ok(())
    }

    /// Record one owner's signature and re-evaluate the threshold.
    pub fn add_signature(
        &mut self,
        key: &ProposalKey,
        owner: Address,
        signature: Vec<u8>,
        owner_set: &BTreeSet<Address>,
        signatures_required: u64,
    ) -> CoordinatorResult<ProposalStatus> {
        let proposal = self.get_mut(key)?;

        if !matches!(
            proposal.status,
            ProposalStatus::Collecting | ProposalStatus::ThresholdReached
        ) {
            return Err(CoordinatorError::StaleProposal {
                key: key.to_string(),
                reason: format!("cannot sign while {}", proposal.status.as_str()),
            });
        }

        if !owner_set.contains(&owner) {
            return Err(CoordinatorError::UnauthorizedSigner {
                instance: format!("{:?}", key.instance),
                owner: format!("{:?}", owner),
            });
        }

        if proposal.signatures.contains_key(&owner) {
            return Err(CoordinatorError::DuplicateSignature {
                key: key.to_string(),
                owner: format!("{:?}", owner),
            });
        }

        proposal.signatures.insert(owner, signature);
        Self::evaluate_threshold(proposal, signatures_required);

        Ok(proposal.status)
    }

    /// Merge a signature set fetched from the relay into the local record.
    /// Unauthorized signers are dropped with a warning; duplicates are
    /// silently ignored (the relay echoes back what we posted).
    pub fn merge_signatures(
        &mut self,
        key: &ProposalKey,
        fetched: BTreeMap<Address, Vec<u8>>,
        owner_set: &BTreeSet<Address>,
        signatures_required: u64,
    ) -> CoordinatorResult<ProposalStatus> {
        let proposal = self.get_mut(key)?;

        if !matches!(
            proposal.status,
            ProposalStatus::Collecting | ProposalStatus::ThresholdReached
        ) {
            return Ok(proposal.status);
        }

        for (owner, signature) in fetched {
            if !owner_set.contains(&owner) {
                warn!(
                    "Relay returned signature from non-owner {:?} for {}",
                    owner, key
                );
                continue;
            }
            proposal.signatures.entry(owner).or_insert(signature);
        }

        Self::evaluate_threshold(proposal, signatures_required);
        Ok(proposal.status)
    }

    /// ThresholdReached -> Submitting, holding the per-instance submission
    /// guard.
    pub fn begin_submit(&mut self, key: &ProposalKey) -> CoordinatorResult<()> {
        if self.submitting.contains(&key.instance) {
            return Err(CoordinatorError::SubmissionInProgress {
                instance: format!("{:?}", key.instance),
            });
        }

        let proposal = self.get_mut(key)?;
        match proposal.status {
            ProposalStatus::ThresholdReached => {
                proposal.status = ProposalStatus::Submitting;
                self.submitting.insert(key.instance);
                Ok(())
            }
            ProposalStatus::Confirmed | ProposalStatus::Failed | ProposalStatus::Stale => {
                Err(CoordinatorError::StaleProposal {
                    key: key.to_string(),
                    reason: format!("cannot submit while {}", proposal.status.as_str()),
                })
            }
            other => Err(CoordinatorError::Validation(format!(
                "proposal {} not ready for submission (status {})",
                key,
                other.as_str()
            ))),
        }
    }

    /// Submitting -> Confirmed. Releases the submission guard.
    pub fn confirm_submit(&mut self, key: &ProposalKey) -> CoordinatorResult<()> {
        self.submitting.remove(&key.instance);
        let proposal = self.get_mut(key)?;
        if proposal.status == ProposalStatus::Submitting {
            proposal.status = ProposalStatus::Confirmed;
            info!("Proposal {} confirmed", key);
        }
        Ok(())
    }

    /// Submitting -> Failed, preserving the underlying reason verbatim.
    /// Failure is terminal: the caller decides whether to re-propose.
    pub fn fail_submit(&mut self, key: &ProposalKey, reason: String) -> CoordinatorResult<()> {
        self.submitting.remove(&key.instance);
        let proposal = self.get_mut(key)?;
        if proposal.status == ProposalStatus::Submitting {
            warn!("Proposal {} failed: {}", key, reason);
            proposal.status = ProposalStatus::Failed;
            proposal.failure_reason = Some(reason);
        }
        Ok(())
    }

    /// Mark every non-terminal proposal for `instance` stale, e.g. when the
    /// active instance switches away. Returns the affected keys so callers
    /// can surface why the proposals disappeared.
    pub fn mark_instance_stale(&mut self, instance: Address, reason: &str) -> Vec<ProposalKey> {
        let mut affected = Vec::new();
        for (key, proposal) in self.proposals.iter_mut() {
            if key.instance == instance && !proposal.status.is_terminal() {
                Self::transition_stale(proposal, reason);
                affected.push(*key);
            }
        }
        self.submitting.remove(&instance);
        affected
    }

    /// Mark proposals for `instance` whose nonce fell behind the live
    /// projection stale. Called after each projected execution.
    pub fn mark_outpaced_stale(&mut self, instance: Address, live_nonce: u64) -> Vec<ProposalKey> {
        let mut affected = Vec::new();
        for (key, proposal) in self.proposals.iter_mut() {
            if key.instance == instance
                && key.nonce < live_nonce
                && !proposal.status.is_terminal()
            {
                Self::transition_stale(
                    proposal,
                    &format!("on-chain nonce advanced to {}", live_nonce),
                );
                affected.push(*key);
            }
        }
        affected
    }

    pub fn get(&self, key: &ProposalKey) -> Option<&Proposal> {
        self.proposals.get(key)
    }

    pub fn proposals(&self) -> impl Iterator<Item = &Proposal> {
        self.proposals.values()
    }

    pub fn count_by_status(&self, status: ProposalStatus) -> usize {
        self.proposals
            .values()
            .filter(|p| p.status == status)
            .count()
    }

    fn get_mut(&mut self, key: &ProposalKey) -> CoordinatorResult<&mut Proposal> {
        self.proposals
            .get_mut(key)
            .ok_or_else(|| CoordinatorError::Internal(format!("unknown proposal {}", key)))
    }

    fn evaluate_threshold(proposal: &mut Proposal, signatures_required: u64) {
        if proposal.status == ProposalStatus::Collecting
            && proposal.signatures.len() as u64 >= signatures_required
        {
            info!(
                "Proposal {} reached threshold ({} signatures)",
                proposal.key,
                proposal.signatures.len()
            );
            proposal.status = ProposalStatus::ThresholdReached;
        }
    }

    fn transition_stale(proposal: &mut Proposal, reason: &str) {
        debug!("Proposal {} stale: {}", proposal.key, reason);
        proposal.status = ProposalStatus::Stale;
        proposal.stale_reason = Some(reason.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(b: u8) -> Address {
        Address::repeat_byte(b)
    }

    fn payload() -> ProposalPayload {
        ProposalPayload::new(addr(0xee), U256::from(1000u64), Bytes::from(vec![0xde, 0xad]))
    }

    fn owners() -> BTreeSet<Address> {
        [addr(0xa1), addr(0xb2), addr(0xc3)].into_iter().collect()
    }

    fn setup(nonce: u64) -> (ProposalBook, ProposalKey) {
        let mut book = ProposalBook::new();
        let key = ProposalKey::new(addr(0x77), nonce, &payload());
        book.register(key, payload());
        book.mark_collecting(&key).unwrap();
        (book, key)
    }

    fn sig(b: u8) -> Vec<u8> {
        vec![b; 65]
    }

    #[test]
    fn test_identical_payload_same_key() {
        let a = ProposalKey::new(addr(0x77), 5, &payload());
        let b = ProposalKey::new(addr(0x77), 5, &payload());
        assert_eq!(a, b);

        let other = ProposalPayload::new(addr(0xee), U256::from(1001u64), Bytes::new());
        let c = ProposalKey::new(addr(0x77), 5, &other);
        assert_ne!(a, c);
    }

    #[test]
    fn test_owner_change_payload_targets_wallet() {
        let wallet = addr(0x77);
        let payload = ProposalPayload::owner_change(
            wallet,
            &[
                "0x1111111111111111111111111111111111111111".to_string(),
                "0x2222222222222222222222222222222222222222".to_string(),
            ],
            2,
        )
        .unwrap();

        assert_eq!(payload.to, wallet);
        assert_eq!(payload.value, U256::zero());
        assert!(!payload.data.is_empty());

        // Threshold above owner count is caught before encoding.
        let err = ProposalPayload::owner_change(
            wallet,
            &["0x1111111111111111111111111111111111111111".to_string()],
            2,
        )
        .unwrap_err();
        assert!(matches!(err, CoordinatorError::Validation(_)));
    }

    #[test]
    fn test_threshold_boundary() {
        let (mut book, key) = setup(5);

        // signatures_required = 2: one signer keeps it collecting.
        let status = book
            .add_signature(&key, addr(0xa1), sig(1), &owners(), 2)
            .unwrap();
        assert_eq!(status, ProposalStatus::Collecting);

        let status = book
            .add_signature(&key, addr(0xb2), sig(2), &owners(), 2)
            .unwrap();
        assert_eq!(status, ProposalStatus::ThresholdReached);
    }

    #[test]
    fn test_duplicate_signature_rejected_and_single_record() {
        let (mut book, key) = setup(5);
        book.add_signature(&key, addr(0xa1), sig(1), &owners(), 3)
            .unwrap();

        let err = book
            .add_signature(&key, addr(0xa1), sig(9), &owners(), 3)
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::DuplicateSignature { .. }));

        let proposal = book.get(&key).unwrap();
        assert_eq!(proposal.signatures.len(), 1);
        assert_eq!(proposal.signatures[&addr(0xa1)], sig(1));
        assert_eq!(proposal.status, ProposalStatus::Collecting);
    }

    #[test]
    fn test_unauthorized_signer_rejected() {
        let (mut book, key) = setup(5);
        let err = book
            .add_signature(&key, addr(0xff), sig(1), &owners(), 2)
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::UnauthorizedSigner { .. }));
    }

    #[test]
    fn test_submit_lifecycle_and_resubmit_rejected() {
        let (mut book, key) = setup(5);
        book.add_signature(&key, addr(0xa1), sig(1), &owners(), 2)
            .unwrap();
        book.add_signature(&key, addr(0xb2), sig(2), &owners(), 2)
            .unwrap();

        book.begin_submit(&key).unwrap();
        assert_eq!(book.get(&key).unwrap().status, ProposalStatus::Submitting);

        book.confirm_submit(&key).unwrap();
        assert_eq!(book.get(&key).unwrap().status, ProposalStatus::Confirmed);

        // A second submit on the confirmed proposal is an explicit error,
        // never a silent repeat.
        let err = book.begin_submit(&key).unwrap_err();
        assert!(matches!(err, CoordinatorError::StaleProposal { .. }));
    }

    #[test]
    fn test_one_submission_per_instance() {
        let mut book = ProposalBook::new();
        let first = ProposalKey::new(addr(0x77), 5, &payload());
        let other_payload = ProposalPayload::new(addr(0xef), U256::zero(), Bytes::new());
        let second = ProposalKey::new(addr(0x77), 5, &other_payload);

        for (key, p) in [(first, payload()), (second, other_payload)] {
            book.register(key, p);
            book.mark_collecting(&key).unwrap();
            book.add_signature(&key, addr(0xa1), sig(1), &owners(), 1)
                .unwrap();
        }

        book.begin_submit(&first).unwrap();
        let err = book.begin_submit(&second).unwrap_err();
        assert!(matches!(err, CoordinatorError::SubmissionInProgress { .. }));

        // Guard releases once the first submission resolves.
        book.fail_submit(&first, "execution reverted: nonce mismatch".into())
            .unwrap();
        book.begin_submit(&second).unwrap();
    }

    #[test]
    fn test_failure_preserves_reason() {
        let (mut book, key) = setup(5);
        book.add_signature(&key, addr(0xa1), sig(1), &owners(), 1)
            .unwrap();
        book.begin_submit(&key).unwrap();
        book.fail_submit(&key, "execution reverted: below threshold".into())
            .unwrap();

        let proposal = book.get(&key).unwrap();
        assert_eq!(proposal.status, ProposalStatus::Failed);
        assert_eq!(
            proposal.failure_reason.as_deref(),
            Some("execution reverted: below threshold")
        );
    }

    #[test]
    fn test_instance_switch_marks_collecting_stale() {
        let (mut book, key) = setup(5);
        book.add_signature(&key, addr(0xa1), sig(1), &owners(), 2)
            .unwrap();

        let affected = book.mark_instance_stale(addr(0x77), "active instance changed");
        assert_eq!(affected, vec![key]);

        let proposal = book.get(&key).unwrap();
        assert_eq!(proposal.status, ProposalStatus::Stale);
        assert!(proposal.stale_reason.is_some());

        // Any subsequent action fails with StaleProposal.
        let err = book
            .add_signature(&key, addr(0xb2), sig(2), &owners(), 2)
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::StaleProposal { .. }));
        let err = book.begin_submit(&key).unwrap_err();
        assert!(matches!(err, CoordinatorError::StaleProposal { .. }));
    }

    #[test]
    fn test_nonce_advance_marks_outpaced_stale() {
        let (mut book, key) = setup(5);

        let affected = book.mark_outpaced_stale(addr(0x77), 6);
        assert_eq!(affected, vec![key]);
        assert_eq!(book.get(&key).unwrap().status, ProposalStatus::Stale);
    }

    #[test]
    fn test_ensure_live_detects_nonce_drift() {
        let (mut book, key) = setup(5);

        // Live nonce matches: fine.
        book.ensure_live(&key, Some(addr(0x77)), 5).unwrap();

        // Nonce advanced underneath the proposal.
        let err = book.ensure_live(&key, Some(addr(0x77)), 6).unwrap_err();
        assert!(matches!(err, CoordinatorError::StaleProposal { .. }));
        assert_eq!(book.get(&key).unwrap().status, ProposalStatus::Stale);
    }

    #[test]
    fn test_merge_converges_concurrent_signature_sets() {
        let (mut book, key) = setup(5);
        book.add_signature(&key, addr(0xa1), sig(1), &owners(), 2)
            .unwrap();

        // Relay returns our own signature plus one collected elsewhere and
        // one from a non-owner.
        let fetched: BTreeMap<Address, Vec<u8>> = [
            (addr(0xa1), sig(1)),
            (addr(0xb2), sig(2)),
            (addr(0xff), sig(9)),
        ]
        .into_iter()
        .collect();

        let status = book.merge_signatures(&key, fetched, &owners(), 2).unwrap();
        assert_eq!(status, ProposalStatus::ThresholdReached);

        let proposal = book.get(&key).unwrap();
        assert_eq!(proposal.signatures.len(), 2);
        assert!(!proposal.signatures.contains_key(&addr(0xff)));
    }
}
