//! Wallet lifecycle event types, log parsing, and ordering
//!
//! Events emitted by the MultisigWalletFactory and MultisigWallet contracts
//! are the single source of truth for instance membership and projected
//! wallet state. Delivery order from the transport is not trusted: every
//! event carries an ordering key (block number, log index) and consumers
//! apply events strictly in key order.

use crate::error::{CoordinatorError, CoordinatorResult};

use ethers::abi::{self, ParamType, Token};
use ethers::prelude::*;
use ethers::utils::keccak256;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Total order for event application: block number, then log index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OrderingKey {
    pub block_number: u64,
    pub log_index: u64,
}

impl OrderingKey {
    pub fn new(block_number: u64, log_index: u64) -> Self {
        Self {
            block_number,
            log_index,
        }
    }
}

/// What happened on a wallet instance (or, for `WalletCreated`, the factory).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalletEventKind {
    /// Factory deployed a new wallet instance.
    WalletCreated {
        owners: Vec<Address>,
        signatures_required: u64,
    },
    OwnerAdded {
        owner: Address,
    },
    OwnerRemoved {
        owner: Address,
    },
    /// A proposal executed on-chain, consuming `nonce`.
    ExecuteTransaction {
        owner: Address,
        to: Address,
        value: U256,
        nonce: u64,
    },
}

/// Immutable record of a single wallet lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletEvent {
    /// Wallet instance the event is scoped to.
    pub instance: Address,
    pub kind: WalletEventKind,
    pub key: OrderingKey,
    pub tx_hash: H256,
}

impl WalletEvent {
    /// Event name for logging and metrics
    pub fn name(&self) -> &'static str {
        match self.kind {
            WalletEventKind::WalletCreated { .. } => "wallet_created",
            WalletEventKind::OwnerAdded { .. } => "owner_added",
            WalletEventKind::OwnerRemoved { .. } => "owner_removed",
            WalletEventKind::ExecuteTransaction { .. } => "execute_transaction",
        }
    }

    /// Whether this is a factory-level event (instance discovery) rather
    /// than an instance-scoped one.
    pub fn is_factory_event(&self) -> bool {
        matches!(self.kind, WalletEventKind::WalletCreated { .. })
    }
}

/// Event topic signatures (keccak256 of the event signature)
pub mod topics {
    use super::*;

    lazy_static! {
        pub static ref WALLET_CREATED: H256 =
            H256::from(keccak256("WalletCreated(address,address[],uint256)"));
        pub static ref OWNER: H256 = H256::from(keccak256("Owner(address,bool)"));
        pub static ref EXECUTE_TRANSACTION: H256 = H256::from(keccak256(
            "ExecuteTransaction(address,address,uint256,bytes,uint256,bytes32,bytes)"
        ));
    }
}

/// Parses raw logs from the factory and wallet instance contracts.
pub struct EventParser {
    factory_address: Address,
}

impl EventParser {
    pub fn new(factory_address: Address) -> Self {
        Self { factory_address }
    }

    /// Parse a log entry. Returns `Ok(None)` for topics this client does not
    /// track (the contracts emit more than the coordinator consumes).
    pub fn parse_log(&self, log: &Log) -> CoordinatorResult<Option<WalletEvent>> {
        let topic = match log.topics.first() {
            Some(t) => *t,
            None => return Ok(None),
        };

        let key = OrderingKey::new(
            log.block_number
                .ok_or_else(|| CoordinatorError::EventParsing("log missing block number".into()))?
                .as_u64(),
            log.log_index
                .ok_or_else(|| CoordinatorError::EventParsing("log missing log index".into()))?
                .as_u64(),
        );
        let tx_hash = log.transaction_hash.unwrap_or_default();

        if topic == *topics::WALLET_CREATED {
            // Only the configured factory may announce new instances.
            if log.address != self.factory_address {
                return Ok(None);
            }
            return self.parse_wallet_created(log, key, tx_hash).map(Some);
        }

        if topic == *topics::OWNER {
            return self.parse_owner(log, key, tx_hash).map(Some);
        }

        if topic == *topics::EXECUTE_TRANSACTION {
            return self.parse_execute(log, key, tx_hash).map(Some);
        }

        Ok(None)
    }

    /// `WalletCreated(address indexed contractAddress, address[] owners, uint256 signaturesRequired)`
    fn parse_wallet_created(
        &self,
        log: &Log,
        key: OrderingKey,
        tx_hash: H256,
    ) -> CoordinatorResult<WalletEvent> {
        let instance = indexed_address(log, 1)?;

        let tokens = abi::decode(
            &[
                ParamType::Array(Box::new(ParamType::Address)),
                ParamType::Uint(256),
            ],
            &log.data,
        )
        .map_err(|e| CoordinatorError::EventParsing(format!("WalletCreated data: {}", e)))?;

        let owners = match &tokens[0] {
            Token::Array(items) => items
                .iter()
                .filter_map(|t| t.clone().into_address())
                .collect(),
            _ => Vec::new(),
        };
        let signatures_required = tokens[1]
            .clone()
            .into_uint()
            .map(|u| u.as_u64())
            .unwrap_or(0);

        Ok(WalletEvent {
            instance,
            kind: WalletEventKind::WalletCreated {
                owners,
                signatures_required,
            },
            key,
            tx_hash,
        })
    }

    /// `Owner(address indexed owner, bool added)`
    fn parse_owner(
        &self,
        log: &Log,
        key: OrderingKey,
        tx_hash: H256,
    ) -> CoordinatorResult<WalletEvent> {
        let owner = indexed_address(log, 1)?;

        let tokens = abi::decode(&[ParamType::Bool], &log.data)
            .map_err(|e| CoordinatorError::EventParsing(format!("Owner data: {}", e)))?;
        let added = tokens[0].clone().into_bool().unwrap_or(false);

        let kind = if added {
            WalletEventKind::OwnerAdded { owner }
        } else {
            WalletEventKind::OwnerRemoved { owner }
        };

        Ok(WalletEvent {
            instance: log.address,
            kind,
            key,
            tx_hash,
        })
    }

    /// `ExecuteTransaction(address indexed owner, address to, uint256 value,
    /// bytes data, uint256 nonce, bytes32 hash, bytes result)`
    fn parse_execute(
        &self,
        log: &Log,
        key: OrderingKey,
        tx_hash: H256,
    ) -> CoordinatorResult<WalletEvent> {
        let owner = indexed_address(log, 1)?;

        let tokens = abi::decode(
            &[
                ParamType::Address,
                ParamType::Uint(256),
                ParamType::Bytes,
                ParamType::Uint(256),
                ParamType::FixedBytes(32),
                ParamType::Bytes,
            ],
            &log.data,
        )
        .map_err(|e| CoordinatorError::EventParsing(format!("ExecuteTransaction data: {}", e)))?;

        let to = tokens[0].clone().into_address().unwrap_or_default();
        let value = tokens[1].clone().into_uint().unwrap_or_default();
        let nonce = tokens[3]
            .clone()
            .into_uint()
            .map(|u| u.as_u64())
            .unwrap_or(0);

        Ok(WalletEvent {
            instance: log.address,
            kind: WalletEventKind::ExecuteTransaction {
                owner,
                to,
                value,
                nonce,
            },
            key,
            tx_hash,
        })
    }
}

pub(crate) fn indexed_address(log: &Log, topic_idx: usize) -> CoordinatorResult<Address> {
    log.topics
        .get(topic_idx)
        .map(|t| Address::from_slice(&t.0[12..32]))
        .ok_or_else(|| {
            CoordinatorError::EventParsing(format!("log missing indexed topic {}", topic_idx))
        })
}

/// Reorders and deduplicates events before they reach consumers.
///
/// The transport may deliver logs out of order or redeliver them after a
/// reconnect. Consumers only ever see each ordering key once, in ascending
/// order; anything at or below the last delivered key is dropped.
#[derive(Debug, Default)]
pub struct EventBuffer {
    pending: BTreeMap<OrderingKey, WalletEvent>,
    last_delivered: Option<OrderingKey>,
}

impl EventBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer an event. Duplicates and already-delivered keys are ignored.
    pub fn push(&mut self, event: WalletEvent) {
        if let Some(last) = self.last_delivered {
            if event.key <= last {
                return;
            }
        }
        self.pending.entry(event.key).or_insert(event);
    }

    /// Drain all buffered events in ordering-key order, advancing the
    /// delivery watermark.
    pub fn drain_ordered(&mut self) -> Vec<WalletEvent> {
        let drained: Vec<WalletEvent> = std::mem::take(&mut self.pending).into_values().collect();
        if let Some(last) = drained.last() {
            self.last_delivered = Some(last.key);
        }
        drained
    }

    /// Reset the watermark, e.g. before a full replay from the creation event.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.last_delivered = None;
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(block: u64, index: u64) -> WalletEvent {
        WalletEvent {
            instance: Address::repeat_byte(0x11),
            kind: WalletEventKind::OwnerAdded {
                owner: Address::repeat_byte(0xaa),
            },
            key: OrderingKey::new(block, index),
            tx_hash: H256::repeat_byte(block as u8),
        }
    }

    #[test]
    fn test_buffer_orders_out_of_order_delivery() {
        let mut buf = EventBuffer::new();
        buf.push(event(7, 0));
        buf.push(event(5, 2));
        buf.push(event(5, 1));

        let drained = buf.drain_ordered();
        let keys: Vec<_> = drained.iter().map(|e| e.key).collect();
        assert_eq!(
            keys,
            vec![
                OrderingKey::new(5, 1),
                OrderingKey::new(5, 2),
                OrderingKey::new(7, 0)
            ]
        );
    }

    #[test]
    fn test_buffer_drops_redelivered_events() {
        let mut buf = EventBuffer::new();
        buf.push(event(5, 1));
        buf.push(event(5, 1));
        assert_eq!(buf.pending_count(), 1);

        assert_eq!(buf.drain_ordered().len(), 1);

        // Redelivery after the watermark advanced is ignored.
        buf.push(event(5, 1));
        buf.push(event(4, 9));
        assert_eq!(buf.pending_count(), 0);
    }

    #[test]
    fn test_parse_wallet_created_log() {
        let factory = Address::repeat_byte(0xfa);
        let instance = Address::repeat_byte(0x22);
        let owner_a = Address::repeat_byte(0xa1);
        let owner_b = Address::repeat_byte(0xb2);

        let data = abi::encode(&[
            Token::Array(vec![Token::Address(owner_a), Token::Address(owner_b)]),
            Token::Uint(U256::from(2)),
        ]);

        let log = Log {
            address: factory,
            topics: vec![*topics::WALLET_CREATED, H256::from(instance)],
            data: data.into(),
            block_number: Some(42.into()),
            log_index: Some(3.into()),
            transaction_hash: Some(H256::repeat_byte(0x99)),
            ..Default::default()
        };

        let parser = EventParser::new(factory);
        let event = parser.parse_log(&log).unwrap().expect("recognized event");

        assert_eq!(event.instance, instance);
        assert_eq!(event.key, OrderingKey::new(42, 3));
        match event.kind {
            WalletEventKind::WalletCreated {
                owners,
                signatures_required,
            } => {
                assert_eq!(owners, vec![owner_a, owner_b]);
                assert_eq!(signatures_required, 2);
            }
            other => panic!("unexpected kind: {:?}", other),
        }
    }

    #[test]
    fn test_parse_ignores_foreign_factory() {
        let parser = EventParser::new(Address::repeat_byte(0xfa));
        let log = Log {
            address: Address::repeat_byte(0xde),
            topics: vec![*topics::WALLET_CREATED, H256::from(Address::zero())],
            data: abi::encode(&[Token::Array(vec![]), Token::Uint(U256::one())]).into(),
            block_number: Some(1.into()),
            log_index: Some(0.into()),
            ..Default::default()
        };

        assert!(parser.parse_log(&log).unwrap().is_none());
    }
}
