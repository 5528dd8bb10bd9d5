//! Instance registry: which wallet instances an owner belongs to
//!
//! Membership is derived exclusively from factory `WalletCreated` events:
//! the registry is the single writer of instance membership and is always
//! event-sourced. Selecting an instance bumps an epoch counter; async work
//! started under an older epoch is discarded by its caller, which is what
//! makes a switch atomic from the consumers' point of view.

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::events::{WalletEvent, WalletEventKind};

use ethers::types::Address;
use tracing::info;

/// Tracks discovered wallet instances and the active selection.
pub struct InstanceRegistry {
    /// Owner this client coordinates for.
    owner: Address,
    /// Instances containing `owner`, in discovery (block) order, deduped.
    instances: Vec<Address>,
    /// Currently selected instance.
    active: Option<Address>,
    /// Bumped whenever the active instance changes.
    epoch: u64,
}

impl InstanceRegistry {
    pub fn new(owner: Address) -> Self {
        Self {
            owner,
            instances: Vec::new(),
            active: None,
            epoch: 0,
        }
    }

    /// Derive the instance set for `owner` from a slice of creation events:
    /// filter events whose owner list contains `owner`, dedup by instance
    /// address, keep discovery order.
    pub fn derive_instances(owner: Address, creation_events: &[WalletEvent]) -> Vec<Address> {
        let mut derived = Vec::new();
        for event in creation_events {
            if let WalletEventKind::WalletCreated { owners, .. } = &event.kind {
                if owners.contains(&owner) && !derived.contains(&event.instance) {
                    derived.push(event.instance);
                }
            }
        }
        derived
    }

    /// Feed one factory event into the registry. Returns the newly
    /// discovered instance when the event names one this owner belongs to.
    ///
    /// Discovery only records membership. Making the discovered instance
    /// active is the caller's decision through [`select_active`], so the
    /// activation side effects (rebind, rescope, proposal staling) always
    /// run alongside the pointer change.
    ///
    /// [`select_active`]: InstanceRegistry::select_active
    pub fn observe_creation(&mut self, event: &WalletEvent) -> Option<Address> {
        let owners = match &event.kind {
            WalletEventKind::WalletCreated { owners, .. } => owners,
            _ => return None,
        };

        if !owners.contains(&self.owner) || self.instances.contains(&event.instance) {
            return None;
        }

        self.instances.push(event.instance);
        info!(
            "Discovered wallet instance {:?} for owner {:?}",
            event.instance, self.owner
        );

        Some(event.instance)
    }

    /// Change the active selection. Rejects addresses outside the derived
    /// set. Re-selecting the current instance keeps the epoch unchanged.
    pub fn select_active(&mut self, instance: Address) -> CoordinatorResult<u64> {
        if !self.instances.contains(&instance) {
            return Err(CoordinatorError::UnknownInstance {
                address: format!("{:?}", instance),
            });
        }

        if self.active != Some(instance) {
            self.active = Some(instance);
            self.epoch += 1;
            info!("Active instance switched to {:?} (epoch {})", instance, self.epoch);
        }

        Ok(self.epoch)
    }

    pub fn active(&self) -> Option<Address> {
        self.active
    }

    /// Current selection epoch. Consumers snapshot this before async work
    /// and drop results if it moved.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn instances(&self) -> &[Address] {
        &self.instances
    }

    pub fn owner(&self) -> Address {
        self.owner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::OrderingKey;
    use ethers::types::H256;

    fn creation(block: u64, instance: Address, owners: Vec<Address>) -> WalletEvent {
        WalletEvent {
            instance,
            kind: WalletEventKind::WalletCreated {
                owners,
                signatures_required: 1,
            },
            key: OrderingKey::new(block, 0),
            tx_hash: H256::repeat_byte(block as u8),
        }
    }

    fn addr(b: u8) -> Address {
        Address::repeat_byte(b)
    }

    #[test]
    fn test_derive_filters_and_dedups_in_discovery_order() {
        let me = addr(0xaa);
        let other = addr(0xbb);
        let events = vec![
            creation(1, addr(0x01), vec![me, other]),
            creation(2, addr(0x02), vec![other]),
            creation(3, addr(0x03), vec![other, me]),
            creation(4, addr(0x01), vec![me]), // same instance announced twice
        ];

        let derived = InstanceRegistry::derive_instances(me, &events);
        assert_eq!(derived, vec![addr(0x01), addr(0x03)]);
    }

    #[test]
    fn test_discovery_records_membership_without_selecting() {
        let me = addr(0xaa);
        let mut registry = InstanceRegistry::new(me);

        let discovered = registry.observe_creation(&creation(1, addr(0x01), vec![me]));
        assert_eq!(discovered, Some(addr(0x01)));
        // Selection stays with the caller so activation side effects run.
        assert_eq!(registry.active(), None);

        registry.observe_creation(&creation(2, addr(0x02), vec![me]));
        assert_eq!(registry.instances(), &[addr(0x01), addr(0x02)]);

        // Re-announcing a known instance is not a discovery.
        assert_eq!(
            registry.observe_creation(&creation(3, addr(0x01), vec![me])),
            None
        );

        let epoch = registry.select_active(addr(0x02)).unwrap();
        assert_eq!(registry.active(), Some(addr(0x02)));
        assert_eq!(epoch, 1);
    }

    #[test]
    fn test_select_unknown_instance_rejected() {
        let me = addr(0xaa);
        let mut registry = InstanceRegistry::new(me);
        registry.observe_creation(&creation(1, addr(0x01), vec![me]));

        let err = registry.select_active(addr(0x99)).unwrap_err();
        assert!(matches!(err, CoordinatorError::UnknownInstance { .. }));
    }

    #[test]
    fn test_switching_bumps_epoch_reselect_does_not() {
        let me = addr(0xaa);
        let mut registry = InstanceRegistry::new(me);
        registry.observe_creation(&creation(1, addr(0x01), vec![me]));
        registry.observe_creation(&creation(2, addr(0x02), vec![me]));

        let epoch = registry.epoch();
        let after_switch = registry.select_active(addr(0x01)).unwrap();
        assert_eq!(after_switch, epoch + 1);

        let after_reselect = registry.select_active(addr(0x01)).unwrap();
        assert_eq!(after_reselect, after_switch);
    }
}
