//! Event-sourced projection of wallet instance state
//!
//! The projector folds instance-scoped events in ordering-key order into the
//! derived `WalletInstance` record: owner set, signature threshold, and
//! execution nonce. Derived fields are recomputed from events, never mutated
//! directly. Nonces must be contiguous; a gap means a missed event and
//! raises [`CoordinatorError::ProjectionGap`] so the caller forces a full
//! replay from the creation event instead of continuing silently.

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::events::{OrderingKey, WalletEvent, WalletEventKind};

use ethers::types::Address;
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// Derived state of one wallet instance.
#[derive(Debug, Clone, PartialEq)]
pub struct WalletInstance {
    pub address: Address,
    pub owner_set: BTreeSet<Address>,
    pub signatures_required: u64,
    pub execution_nonce: u64,
}

/// Folds instance-scoped events into the current `WalletInstance`.
pub struct WalletStateProjector {
    instance: Address,
    state: Option<WalletInstance>,
    last_applied: Option<OrderingKey>,
}

impl WalletStateProjector {
    pub fn new(instance: Address) -> Self {
        Self {
            instance,
            state: None,
            last_applied: None,
        }
    }

    /// Pure projection: fold a complete, instance-scoped event slice into a
    /// `WalletInstance`.
    pub fn project(
        instance: Address,
        events: &[WalletEvent],
    ) -> CoordinatorResult<WalletInstance> {
        let mut projector = Self::new(instance);
        for event in events {
            projector.apply(event)?;
        }
        projector
            .state()
            .cloned()
            .ok_or_else(|| CoordinatorError::ProjectionGap {
                instance: format!("{:?}", instance),
                expected: 0,
                observed: 0,
            })
    }

    pub fn instance(&self) -> Address {
        self.instance
    }

    /// Latest successful projection. Threshold and nonce reads used for
    /// proposal checks must come from here, never from a cached copy taken
    /// before an instance switch.
    pub fn state(&self) -> Option<&WalletInstance> {
        self.state.as_ref()
    }

    /// Apply one event. Events for other instances are ignored; events at or
    /// below the last applied ordering key are skipped, which makes replay
    /// idempotent.
    pub fn apply(&mut self, event: &WalletEvent) -> CoordinatorResult<()> {
        if event.instance != self.instance {
            return Ok(());
        }

        if let Some(last) = self.last_applied {
            if event.key <= last {
                debug!("Skipping already-applied event at {:?}", event.key);
                return Ok(());
            }
        }

        self.fold(event)?;
        self.last_applied = Some(event.key);
        Ok(())
    }

    fn fold(&mut self, event: &WalletEvent) -> CoordinatorResult<()> {
        match &event.kind {
            WalletEventKind::WalletCreated {
                owners,
                signatures_required,
            } => {
                if self.state.is_some() {
                    warn!(
                        "Anomaly: duplicate WalletCreated for {:?}, ignoring",
                        self.instance
                    );
                    return Ok(());
                }
                self.state = Some(WalletInstance {
                    address: self.instance,
                    owner_set: owners.iter().copied().collect(),
                    signatures_required: *signatures_required,
                    execution_nonce: 0,
                });
            }

            WalletEventKind::OwnerAdded { owner } => {
                let Some(state) = self.state.as_mut() else {
                    warn!("Anomaly: OwnerAdded before WalletCreated on {:?}", self.instance);
                    return Ok(());
                };
                if !state.owner_set.insert(*owner) {
                    warn!("Anomaly: OwnerAdded for existing owner {:?}", owner);
                }
            }

            WalletEventKind::OwnerRemoved { owner } => {
                let Some(state) = self.state.as_mut() else {
                    warn!("Anomaly: OwnerRemoved before WalletCreated on {:?}", self.instance);
                    return Ok(());
                };
                if !state.owner_set.remove(owner) {
                    warn!("Anomaly: OwnerRemoved for non-member {:?}", owner);
                }
            }

            WalletEventKind::ExecuteTransaction { nonce, .. } => {
                let Some(state) = self.state.as_mut() else {
                    // Execution without a seen creation event: history is
                    // incomplete, resync required.
                    return Err(CoordinatorError::ProjectionGap {
                        instance: format!("{:?}", self.instance),
                        expected: 0,
                        observed: *nonce,
                    });
                };

                let expected = state.execution_nonce;
                if *nonce == expected {
                    state.execution_nonce = expected + 1;
                } else if *nonce < expected {
                    // Already accounted for, either by replay or by a local
                    // confirmation that ran ahead of the log.
                    debug!(
                        "Execution nonce {} already projected (at {})",
                        nonce, expected
                    );
                } else {
                    return Err(CoordinatorError::ProjectionGap {
                        instance: format!("{:?}", self.instance),
                        expected,
                        observed: *nonce,
                    });
                }
            }
        }

        Ok(())
    }

    /// Advance the nonce expectation after a locally confirmed execution.
    /// The corresponding `ExecuteTransaction` event, once it arrives, is
    /// absorbed as a no-op by the `nonce < expected` branch above.
    pub fn note_confirmed_execution(&mut self, consumed_nonce: u64) {
        if let Some(state) = self.state.as_mut() {
            if state.execution_nonce <= consumed_nonce {
                state.execution_nonce = consumed_nonce + 1;
            }
        }
    }

    /// Discard all derived state ahead of a full replay from the creation
    /// event.
    pub fn reset(&mut self) {
        self.state = None;
        self.last_applied = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::{H256, U256};

    fn addr(b: u8) -> Address {
        Address::repeat_byte(b)
    }

    fn instance() -> Address {
        addr(0x77)
    }

    fn event(block: u64, kind: WalletEventKind) -> WalletEvent {
        WalletEvent {
            instance: instance(),
            kind,
            key: OrderingKey::new(block, 0),
            tx_hash: H256::repeat_byte(block as u8),
        }
    }

    fn created(block: u64, owners: Vec<Address>, threshold: u64) -> WalletEvent {
        event(
            block,
            WalletEventKind::WalletCreated {
                owners,
                signatures_required: threshold,
            },
        )
    }

    fn executed(block: u64, nonce: u64) -> WalletEvent {
        event(
            block,
            WalletEventKind::ExecuteTransaction {
                owner: addr(0xaa),
                to: addr(0xee),
                value: U256::zero(),
                nonce,
            },
        )
    }

    fn owner_added(block: u64, owner: Address) -> WalletEvent {
        event(block, WalletEventKind::OwnerAdded { owner })
    }

    fn owner_removed(block: u64, owner: Address) -> WalletEvent {
        event(block, WalletEventKind::OwnerRemoved { owner })
    }

    #[test]
    fn test_created_seeds_owner_set_and_threshold() {
        let state = WalletStateProjector::project(
            instance(),
            &[created(1, vec![addr(0xaa), addr(0xbb)], 2)],
        )
        .unwrap();

        assert_eq!(state.owner_set.len(), 2);
        assert_eq!(state.signatures_required, 2);
        assert_eq!(state.execution_nonce, 0);
    }

    #[test]
    fn test_replaying_owner_events_twice_is_idempotent() {
        let events = vec![
            created(1, vec![addr(0xaa)], 1),
            owner_added(2, addr(0xbb)),
            owner_removed(3, addr(0xaa)),
            owner_added(4, addr(0xcc)),
        ];

        let mut projector = WalletStateProjector::new(instance());
        for e in &events {
            projector.apply(e).unwrap();
        }
        let first = projector.state().unwrap().clone();

        // Second replay of the same slice must not double-apply anything.
        for e in &events {
            projector.apply(e).unwrap();
        }
        assert_eq!(projector.state().unwrap(), &first);

        let expected: BTreeSet<Address> = [addr(0xbb), addr(0xcc)].into_iter().collect();
        assert_eq!(first.owner_set, expected);
    }

    #[test]
    fn test_duplicate_add_and_unknown_remove_are_noops() {
        let mut projector = WalletStateProjector::new(instance());
        projector.apply(&created(1, vec![addr(0xaa)], 1)).unwrap();
        projector.apply(&owner_added(2, addr(0xaa))).unwrap();
        projector.apply(&owner_removed(3, addr(0xdd))).unwrap();

        let state = projector.state().unwrap();
        assert_eq!(state.owner_set.len(), 1);
        assert!(state.owner_set.contains(&addr(0xaa)));
    }

    #[test]
    fn test_contiguous_executions_advance_nonce() {
        let mut projector = WalletStateProjector::new(instance());
        projector.apply(&created(1, vec![addr(0xaa)], 1)).unwrap();
        projector.apply(&executed(2, 0)).unwrap();
        projector.apply(&executed(3, 1)).unwrap();

        assert_eq!(projector.state().unwrap().execution_nonce, 2);
    }

    #[test]
    fn test_nonce_gap_raises_projection_gap() {
        let mut projector = WalletStateProjector::new(instance());
        projector.apply(&created(1, vec![addr(0xaa)], 1)).unwrap();

        // Nonces 0..=4 executed, then 5 arrives, then 7 (6 missing).
        for (block, nonce) in (2..7).zip(0..5) {
            projector.apply(&executed(block, nonce)).unwrap();
        }
        projector.apply(&executed(7, 5)).unwrap();
        let err = projector.apply(&executed(8, 7)).unwrap_err();

        match err {
            CoordinatorError::ProjectionGap {
                expected, observed, ..
            } => {
                assert_eq!(expected, 6);
                assert_eq!(observed, 7);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_events_for_other_instances_ignored() {
        let mut projector = WalletStateProjector::new(instance());
        projector.apply(&created(1, vec![addr(0xaa)], 1)).unwrap();

        let mut foreign = owner_added(2, addr(0xbb));
        foreign.instance = addr(0x99);
        projector.apply(&foreign).unwrap();

        assert_eq!(projector.state().unwrap().owner_set.len(), 1);
    }

    #[test]
    fn test_confirmed_execution_absorbs_late_event() {
        let mut projector = WalletStateProjector::new(instance());
        projector.apply(&created(1, vec![addr(0xaa)], 1)).unwrap();

        // Local submission confirmed before the log caught up.
        projector.note_confirmed_execution(0);
        assert_eq!(projector.state().unwrap().execution_nonce, 1);

        // The event for nonce 0 arrives afterwards: no double increment.
        projector.apply(&executed(2, 0)).unwrap();
        assert_eq!(projector.state().unwrap().execution_nonce, 1);
    }
}
