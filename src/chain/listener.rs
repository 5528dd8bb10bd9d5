//! On-chain event stream: polling log ingestion with ordering and dedup
//!
//! The stream watches two addresses: the wallet factory (always) and the
//! active wallet instance (when one is selected). Logs are parsed into
//! [`WalletEvent`]s, deduplicated by (block, log index), sorted into
//! ordering-key order, and fanned out over a broadcast channel. Consumers
//! never see an event twice or out of order within a poll batch.

use crate::config::ChainConfig;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::events::{EventBuffer, EventParser, WalletEvent};

use super::ChainProvider;

use dashmap::DashSet;
use ethers::prelude::*;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Maximum block span per log query, to keep RPC responses bounded.
const MAX_BLOCK_RANGE: u64 = 1000;

/// Streams factory and instance events from the chain.
pub struct EventStream {
    config: ChainConfig,
    poll_interval: Duration,
    provider: Arc<ChainProvider>,
    event_tx: broadcast::Sender<WalletEvent>,
    parser: EventParser,
    factory_address: Address,
    /// Active instance whose events are in scope, if any.
    instance_scope: RwLock<Option<Address>>,
    /// Next block to poll from.
    last_processed_block: RwLock<u64>,
    /// (block number, log index) pairs already emitted.
    seen: DashSet<(u64, u64)>,
    buffer: Mutex<EventBuffer>,
}

impl EventStream {
    pub fn new(
        config: ChainConfig,
        poll_interval_ms: u64,
        provider: Arc<ChainProvider>,
    ) -> CoordinatorResult<Self> {
        let factory_address = Address::from_str(&config.factory_address)
            .map_err(|e| CoordinatorError::Config(format!("Invalid factory address: {}", e)))?;

        let (event_tx, _) = broadcast::channel(10000);
        let parser = EventParser::new(factory_address);

        // Replay starts at factory deployment so instance discovery is
        // complete. Projected state is rebuilt from the log, never loaded.
        let start_block = config.factory_deploy_block;

        Ok(Self {
            config,
            poll_interval: Duration::from_millis(poll_interval_ms),
            provider,
            event_tx,
            parser,
            factory_address,
            instance_scope: RwLock::new(None),
            last_processed_block: RwLock::new(start_block),
            seen: DashSet::new(),
            buffer: Mutex::new(EventBuffer::new()),
        })
    }

    /// Subscribe to the ordered event feed.
    pub fn subscribe(&self) -> broadcast::Receiver<WalletEvent> {
        self.event_tx.subscribe()
    }

    pub fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    /// Point the stream at a new active instance and re-emit its full
    /// history, factory events included. Downstream consumers replay the
    /// history idempotently, so redelivering events already seen for a
    /// previous scope is safe; dropping an out-of-order historical event
    /// is not.
    pub async fn rescope(&self, instance: Option<Address>) -> CoordinatorResult<()> {
        let previous = {
            let mut scope = self.instance_scope.write().await;
            std::mem::replace(&mut *scope, instance)
        };

        if previous == instance {
            return Ok(());
        }

        if let Some(addr) = instance {
            info!("Event stream rescoped to instance {:?}", addr);
            self.replay_history(addr).await?;
        }

        Ok(())
    }

    /// Re-emit the full factory and instance history. The dedup set and
    /// ordering watermark are cleared first: backfilled events carry keys
    /// below anything already delivered, and the buffer would otherwise
    /// discard them as redeliveries.
    async fn replay_history(&self, instance: Address) -> CoordinatorResult<()> {
        self.seen.clear();
        self.buffer.lock().await.reset();

        let to_block = *self.last_processed_block.read().await;
        self.backfill(self.factory_address, self.config.factory_deploy_block, to_block)
            .await?;
        self.backfill(instance, self.config.factory_deploy_block, to_block)
            .await
    }

    /// Fetch and emit historical logs for one address over a block range.
    async fn backfill(&self, address: Address, from: u64, to: u64) -> CoordinatorResult<()> {
        let mut start = from;
        while start <= to {
            let end = std::cmp::min(to, start + MAX_BLOCK_RANGE);
            let filter = Filter::new().address(address).from_block(start).to_block(end);

            let logs = self.provider.get_logs(&filter).await?;
            self.emit_logs(logs).await;

            start = end + 1;
        }
        Ok(())
    }

    /// Main polling loop
    pub async fn run(&self) -> CoordinatorResult<()> {
        let poll_interval = self.poll_interval;

        info!(
            "Event stream started for chain {} from block {}",
            self.config.chain_id,
            *self.last_processed_block.read().await
        );

        loop {
            let current_block = match self.provider.get_block_number().await {
                Ok(b) => b,
                Err(e) => {
                    warn!("Failed to get block number: {}", e);
                    tokio::time::sleep(poll_interval).await;
                    continue;
                }
            };

            let last_block = *self.last_processed_block.read().await;
            if current_block <= last_block {
                tokio::time::sleep(poll_interval).await;
                continue;
            }

            let from_block = last_block + 1;
            let to_block = std::cmp::min(current_block, from_block + MAX_BLOCK_RANGE);

            debug!(
                "Chain {}: processing blocks {} to {}",
                self.config.chain_id, from_block, to_block
            );

            let mut addresses = vec![self.factory_address];
            if let Some(instance) = *self.instance_scope.read().await {
                addresses.push(instance);
            }

            let filter = Filter::new()
                .address(addresses)
                .from_block(from_block)
                .to_block(to_block);

            match self.provider.get_logs(&filter).await {
                Ok(logs) => {
                    self.emit_logs(logs).await;
                    *self.last_processed_block.write().await = to_block;
                    crate::metrics::record_blocks_processed(self.config.chain_id, to_block);
                }
                Err(e) => {
                    // Watermark untouched, the range is retried next tick.
                    warn!("Failed to get logs: {}", e);
                }
            }

            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Re-emit the full history of one instance after a detected projection
    /// gap. Clears the dedup set and ordering watermark first so the replay
    /// actually reaches subscribers, then backfills from factory deployment.
    pub async fn replay(&self, instance: Address) -> CoordinatorResult<()> {
        warn!("Replaying full history for instance {:?}", instance);
        self.replay_history(instance).await
    }

    /// Parse, dedup, order, and broadcast a batch of logs.
    async fn emit_logs(&self, logs: Vec<Log>) {
        let mut buffer = self.buffer.lock().await;

        for log in logs {
            let event = match self.parser.parse_log(&log) {
                Ok(Some(event)) => event,
                Ok(None) => continue,
                Err(e) => {
                    error!("Failed to parse log: {}", e);
                    continue;
                }
            };

            if !self.seen.insert((event.key.block_number, event.key.log_index)) {
                continue;
            }

            crate::metrics::record_event(&event);
            buffer.push(event);
        }

        for event in buffer.drain_ordered() {
            debug!("Chain {} event: {}", self.config.chain_id, event.name());
            // Send fails only when no receiver is subscribed yet.
            let _ = self.event_tx.send(event);
        }
    }

    #[cfg(test)]
    pub(crate) fn broadcast_for_tests(&self, event: WalletEvent) {
        let _ = self.event_tx.send(event);
    }
}
