//! Coordination engine tying the event stream to instance, projection, and
//! proposal state
//!
//! All mutable coordinator state lives behind one lock, so every event,
//! relay merge, and user action observes a consistent (registry, projection,
//! proposal book) triple. Chain and relay I/O happens outside the lock.

use crate::chain::{BindingManager, ChainProvider, EventStream};
use crate::config::Settings;
use crate::coordination::creation::CreationCoordinator;
use crate::coordination::projector::WalletStateProjector;
use crate::coordination::proposal::{
    Proposal, ProposalBook, ProposalKey, ProposalPayload, ProposalStatus,
};
use crate::coordination::registry::InstanceRegistry;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::events::{WalletEvent, WalletEventKind};
use crate::relay::{PoolProposal, SignaturePool};
use crate::tx::TransactionSender;

use ethers::types::{Address, Bytes, U256};
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

/// Registry, projection, and proposal book, mutated together.
struct CoordinatorState {
    registry: InstanceRegistry,
    projector: Option<WalletStateProjector>,
    proposals: ProposalBook,
}

/// Snapshot served by the status API.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub owner: String,
    pub active_instance: Option<String>,
    pub epoch: u64,
    pub instances: Vec<String>,
    pub owners: Vec<String>,
    pub signatures_required: Option<u64>,
    pub execution_nonce: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProposalSnapshot {
    pub id: String,
    pub instance: String,
    pub nonce: u64,
    pub to: String,
    pub value: String,
    pub status: String,
    pub signatures: usize,
    pub failure_reason: Option<String>,
    pub stale_reason: Option<String>,
}

impl ProposalSnapshot {
    fn from_proposal(p: &Proposal) -> Self {
        Self {
            id: p.id.to_string(),
            instance: format!("{:?}", p.key.instance),
            nonce: p.key.nonce,
            to: format!("{:?}", p.payload.to),
            value: p.payload.value.to_string(),
            status: p.status.as_str().to_string(),
            signatures: p.signatures.len(),
            failure_reason: p.failure_reason.clone(),
            stale_reason: p.stale_reason.clone(),
        }
    }
}

/// The coordination engine.
pub struct MultisigCoordinator {
    provider: Arc<ChainProvider>,
    stream: Arc<EventStream>,
    bindings: Arc<BindingManager>,
    relay: Arc<dyn SignaturePool>,
    sender: Option<Arc<TransactionSender>>,
    creation: Option<CreationCoordinator>,
    state: Mutex<CoordinatorState>,
    /// Subscription opened at construction, consumed by [`run`]. Subscribing
    /// this early means events broadcast before the run loop starts are
    /// buffered instead of lost.
    events: Mutex<Option<tokio::sync::broadcast::Receiver<WalletEvent>>>,
    relay_poll_interval: Duration,
    shutdown_tx: watch::Sender<bool>,
}

impl MultisigCoordinator {
    pub fn new(
        settings: &Settings,
        provider: Arc<ChainProvider>,
        stream: Arc<EventStream>,
        bindings: Arc<BindingManager>,
        relay: Arc<dyn SignaturePool>,
        sender: Option<Arc<TransactionSender>>,
    ) -> CoordinatorResult<Self> {
        let owner = Address::from_str(&settings.coordinator.owner_address)
            .map_err(|e| CoordinatorError::Config(format!("Invalid owner address: {}", e)))?;
        let factory = Address::from_str(&settings.chain.factory_address)
            .map_err(|e| CoordinatorError::Config(format!("Invalid factory address: {}", e)))?;

        let creation = sender
            .as_ref()
            .map(|s| CreationCoordinator::new(factory, s.clone()));

        let (shutdown_tx, _) = watch::channel(false);
        let events = stream.subscribe();

        Ok(Self {
            provider,
            stream,
            bindings,
            relay,
            sender,
            creation,
            state: Mutex::new(CoordinatorState {
                registry: InstanceRegistry::new(owner),
                projector: None,
                proposals: ProposalBook::new(),
            }),
            events: Mutex::new(Some(events)),
            relay_poll_interval: Duration::from_millis(settings.coordinator.relay_poll_interval_ms),
            shutdown_tx,
        })
    }

    /// Main loop: consume ordered chain events and periodically reconcile
    /// with the relay pool, until shutdown.
    pub async fn run(&self) -> CoordinatorResult<()> {
        let mut events = self.events.lock().await.take().ok_or_else(|| {
            CoordinatorError::Internal("event subscription already consumed".to_string())
        })?;
        let mut relay_tick = tokio::time::interval(self.relay_poll_interval);
        let mut shutdown = self.shutdown_tx.subscribe();

        info!("Coordinator running on chain {}", self.provider.chain_id());

        loop {
            tokio::select! {
                received = events.recv() => match received {
                    Ok(event) => {
                        if let Err(e) = self.handle_event(&event).await {
                            if e.forces_resync() {
                                warn!("Event handling requires resync: {}", e);
                                self.resync().await;
                            } else {
                                error!("Event handling failed: {}", e);
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        // Dropped events mean the projection may have holes.
                        warn!("Event consumer lagged by {} events, resyncing", n);
                        self.resync().await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        warn!("Event stream closed");
                        return Ok(());
                    }
                },
                _ = relay_tick.tick() => {
                    if let Err(e) = self.poll_relay().await {
                        debug!("Relay poll failed: {}", e);
                    }
                },
                _ = shutdown.changed() => {
                    info!("Coordinator shutting down");
                    return Ok(());
                }
            }
        }
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Route one ordered event into registry or projection state.
    async fn handle_event(&self, event: &WalletEvent) -> CoordinatorResult<()> {
        if event.is_factory_event() {
            let activated = {
                let mut guard = self.state.lock().await;
                let state = &mut *guard;
                // A newly discovered instance owned by us becomes active,
                // the most recent creation wins.
                let epoch = match state.registry.observe_creation(event) {
                    Some(instance) if state.registry.active() != Some(instance) => {
                        Some(Self::prepare_activation(state, instance)?)
                    }
                    _ => None,
                };
                // The creation event doubles as the projection seed, so the
                // owner set and threshold are known before any backfill.
                if let Some(projector) = state.projector.as_mut() {
                    if projector.instance() == event.instance {
                        projector.apply(event)?;
                    }
                }
                epoch
            };
            if let Some(epoch) = activated {
                self.finish_activation(event.instance, epoch).await?;
            }
            return Ok(());
        }

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let Some(projector) = state.projector.as_mut() else {
            return Ok(());
        };
        if projector.instance() != event.instance {
            return Ok(());
        }

        // Projection gaps propagate to the run loop, which resyncs.
        projector.apply(event)?;

        if let WalletEventKind::ExecuteTransaction { .. } = &event.kind {
            let live_nonce = projector
                .state()
                .map(|s| s.execution_nonce)
                .unwrap_or_default();
            let outpaced = state
                .proposals
                .mark_outpaced_stale(event.instance, live_nonce);
            for key in &outpaced {
                info!("Proposal {} outpaced by on-chain execution", key);
                crate::metrics::record_proposal_outcome("stale");
            }
        }

        Ok(())
    }

    /// Rebuild the projection from a full replay of the active instance's
    /// history.
    async fn resync(&self) {
        crate::metrics::record_resync();

        let instance = {
            let mut state = self.state.lock().await;
            if let Some(projector) = state.projector.as_mut() {
                projector.reset();
            }
            state.registry.active()
        };

        if let Some(instance) = instance {
            if let Err(e) = self.stream.replay(instance).await {
                error!("History replay for {:?} failed: {}", instance, e);
            }
        }
    }

    /// Make `instance` the active one: stale out the old instance's
    /// proposals, rebind contract handles, rescope the stream, and start a
    /// fresh projection. All under one epoch bump.
    async fn activate(&self, instance: Address) -> CoordinatorResult<()> {
        let epoch = {
            let mut state = self.state.lock().await;

            if state.registry.active() == Some(instance) {
                return Ok(());
            }

            Self::prepare_activation(&mut state, instance)?
        };

        self.finish_activation(instance, epoch).await
    }

    /// State half of an instance switch, performed under the lock: the
    /// previous instance's proposals go stale, the pointer moves, and a
    /// fresh projection starts. Returns the new epoch.
    fn prepare_activation(
        state: &mut CoordinatorState,
        instance: Address,
    ) -> CoordinatorResult<u64> {
        if let Some(previous) = state.registry.active() {
            let stale = state
                .proposals
                .mark_instance_stale(previous, "active instance changed");
            for key in &stale {
                info!("Proposal {} invalidated by instance switch", key);
                crate::metrics::record_proposal_outcome("stale");
            }
        }

        let epoch = state.registry.select_active(instance)?;
        state.projector = Some(WalletStateProjector::new(instance));
        Ok(epoch)
    }

    /// I/O half of an instance switch: rebind contract handles and point the
    /// stream at the new instance's history.
    async fn finish_activation(&self, instance: Address, epoch: u64) -> CoordinatorResult<()> {
        self.bindings.bind(instance).await?;
        self.stream.rescope(Some(instance)).await?;

        crate::metrics::record_instance_switch(epoch);
        info!("Instance {:?} active (epoch {})", instance, epoch);
        Ok(())
    }

    /// Explicitly select a known instance as active.
    pub async fn select_instance(&self, instance: Address) -> CoordinatorResult<()> {
        {
            let state = self.state.lock().await;
            if !state.registry.instances().contains(&instance) {
                return Err(CoordinatorError::UnknownInstance {
                    address: format!("{:?}", instance),
                });
            }
        }
        self.activate(instance).await
    }

    /// Propose a call for `instance` at its current projected nonce, and
    /// announce it to the relay pool. The instance must be the active one.
    pub async fn create_proposal(
        &self,
        instance: Address,
        to: Address,
        value: U256,
        data: Bytes,
    ) -> CoordinatorResult<ProposalKey> {
        let payload = ProposalPayload::new(to, value, data);
        let (key, wire) = {
            let mut state = self.state.lock().await;
            let (active, nonce) = Self::active_context(&state)?;
            if instance != active {
                return Err(CoordinatorError::InstanceMismatch {
                    active: format!("{:?}", active),
                    requested: format!("{:?}", instance),
                });
            }
            let key = ProposalKey::new(instance, nonce, &payload);
            state.proposals.register(key, payload.clone());
            (key, PoolProposal::from_local(&key, &payload))
        };

        self.relay.post_proposal(&wire).await?;

        let mut state = self.state.lock().await;
        state.proposals.mark_collecting(&key)?;
        crate::metrics::record_proposal_outcome("created");
        Ok(key)
    }

    /// Record one owner's signature locally and share it through the relay.
    pub async fn sign_proposal(
        &self,
        key: ProposalKey,
        owner: Address,
        signature: Vec<u8>,
    ) -> CoordinatorResult<ProposalStatus> {
        let status = {
            let mut state = self.state.lock().await;
            let (active, nonce) = Self::active_context(&state)?;
            // An outdated instance surfaces as a stale proposal here, not as
            // a mismatch: the proposal was valid when created.
            state.proposals.ensure_live(&key, Some(active), nonce)?;

            let (owner_set, threshold) = Self::instance_rules(&state)?;
            let status =
                state
                    .proposals
                    .add_signature(&key, owner, signature.clone(), &owner_set, threshold)?;
            crate::metrics::record_signature();
            status
        };

        // Best effort: a relay outage must not lose the local signature.
        if let Err(e) = self.relay.post_signature(&key, owner, &signature).await {
            warn!("Failed to share signature for {}: {}", key, e);
        }

        Ok(status)
    }

    /// Submit a threshold-complete proposal on chain.
    ///
    /// The on-chain nonce is re-read immediately before submission; a
    /// projection that silently fell behind surfaces here as a stale
    /// proposal instead of a gas-burning revert.
    pub async fn submit_proposal(&self, key: ProposalKey) -> CoordinatorResult<()> {
        let sender = self
            .sender
            .clone()
            .ok_or_else(|| CoordinatorError::Wallet("no signing key configured".to_string()))?;

        let binding = self
            .bindings
            .active()
            .await
            .ok_or_else(|| CoordinatorError::Validation("no active instance".to_string()))?;
        let chain_nonce = binding.execution_nonce().await?;
        let chain_threshold = binding.signatures_required().await?;

        let proposal = {
            let mut state = self.state.lock().await;
            let (active, projected_nonce) = Self::active_context(&state)?;
            if projected_nonce != chain_nonce {
                warn!(
                    "Projection nonce {} behind chain nonce {}, trusting chain",
                    projected_nonce, chain_nonce
                );
            }
            state.proposals.ensure_live(&key, Some(active), chain_nonce)?;

            // The contract's threshold may have moved since projection, and
            // a short signature set reverts on-chain. Catch it here instead.
            let proposal = state
                .proposals
                .get(&key)
                .cloned()
                .ok_or_else(|| CoordinatorError::Internal(format!("unknown proposal {}", key)))?;
            if (proposal.signatures.len() as u64) < chain_threshold {
                return Err(CoordinatorError::Validation(format!(
                    "proposal {} has {} signatures, contract requires {}",
                    key,
                    proposal.signatures.len(),
                    chain_threshold
                )));
            }

            state.proposals.begin_submit(&key)?;
            proposal
        };

        match sender.submit_execute(&proposal).await {
            Ok(_receipt) => {
                let mut state = self.state.lock().await;
                if let Some(projector) = state.projector.as_mut() {
                    projector.note_confirmed_execution(key.nonce);
                }
                state.proposals.confirm_submit(&key)?;
                crate::metrics::record_proposal_outcome("confirmed");
                Ok(())
            }
            Err(e) => {
                let mut state = self.state.lock().await;
                state.proposals.fail_submit(&key, e.to_string())?;
                crate::metrics::record_proposal_outcome("failed");
                Err(e)
            }
        }
    }

    /// Create a brand-new wallet instance through the factory. The instance
    /// becomes active only once its creation event arrives on the stream.
    pub async fn create_instance(
        &self,
        owners: &[String],
        signatures_required: u64,
        funding: U256,
    ) -> CoordinatorResult<Address> {
        let creation = self
            .creation
            .as_ref()
            .ok_or_else(|| CoordinatorError::Wallet("no signing key configured".to_string()))?;
        creation
            .create_instance(owners, signatures_required, funding)
            .await
    }

    /// Pull the relay pool and merge anything relevant to the active
    /// instance at its current nonce.
    async fn poll_relay(&self) -> CoordinatorResult<()> {
        let instance = {
            let state = self.state.lock().await;
            match state.registry.active() {
                Some(i) => i,
                None => return Ok(()),
            }
        };

        let fetched = self.relay.fetch_proposals(instance).await?;
        if fetched.is_empty() {
            return Ok(());
        }

        let mut state = self.state.lock().await;
        let (active, nonce) = match Self::active_context(&state) {
            Ok(ctx) => ctx,
            Err(_) => return Ok(()),
        };
        if active != instance {
            // Active instance changed while the fetch was in flight.
            return Ok(());
        }
        let (owner_set, threshold) = Self::instance_rules(&state)?;

        for wire in fetched {
            let key = match wire.key() {
                Ok(key) => key,
                Err(e) => {
                    warn!("Dropping malformed pool proposal: {}", e);
                    continue;
                }
            };
            // Pool entries for consumed nonces are dead, skip them.
            if key.nonce != nonce {
                continue;
            }

            if state.proposals.get(&key).is_none() {
                let payload = match wire.payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!("Dropping pool proposal {} with bad payload: {}", key, e);
                        continue;
                    }
                };
                if ProposalKey::new(key.instance, key.nonce, &payload) != key {
                    warn!("Pool proposal {} hash does not match payload", key);
                    continue;
                }
                state.proposals.register(key, payload);
                state.proposals.mark_collecting(&key)?;
            }

            let signatures = match wire.signature_map() {
                Ok(map) => map,
                Err(e) => {
                    warn!("Dropping signatures for {}: {}", key, e);
                    continue;
                }
            };
            if let Err(e) = state
                .proposals
                .merge_signatures(&key, signatures, &owner_set, threshold)
            {
                // Background reconciliation: bad pool input is logged and
                // skipped, anything else aborts the poll.
                if e.is_input_error() {
                    debug!("Skipping pool entry {}: {}", key, e);
                } else {
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    /// Status snapshot for the read-only API.
    pub async fn status(&self) -> StatusSnapshot {
        let state = self.state.lock().await;
        let projection = state.projector.as_ref().and_then(|p| p.state());

        StatusSnapshot {
            owner: format!("{:?}", state.registry.owner()),
            active_instance: state.registry.active().map(|a| format!("{:?}", a)),
            epoch: state.registry.epoch(),
            instances: state
                .registry
                .instances()
                .iter()
                .map(|a| format!("{:?}", a))
                .collect(),
            owners: projection
                .map(|s| s.owner_set.iter().map(|a| format!("{:?}", a)).collect())
                .unwrap_or_default(),
            signatures_required: projection.map(|s| s.signatures_required),
            execution_nonce: projection.map(|s| s.execution_nonce),
        }
    }

    /// Proposal snapshots for the read-only API.
    pub async fn proposal_snapshots(&self) -> Vec<ProposalSnapshot> {
        let state = self.state.lock().await;
        let mut snapshots: Vec<_> = state
            .proposals
            .proposals()
            .map(ProposalSnapshot::from_proposal)
            .collect();
        snapshots.sort_by(|a, b| (a.nonce, &a.id).cmp(&(b.nonce, &b.id)));
        snapshots
    }

    fn active_context(state: &CoordinatorState) -> CoordinatorResult<(Address, u64)> {
        let instance = state
            .registry
            .active()
            .ok_or_else(|| CoordinatorError::Validation("no active instance".to_string()))?;
        let nonce = state
            .projector
            .as_ref()
            .and_then(|p| p.state())
            .map(|s| s.execution_nonce)
            .ok_or_else(|| {
                CoordinatorError::Validation("instance state not yet projected".to_string())
            })?;
        Ok((instance, nonce))
    }

    fn instance_rules(
        state: &CoordinatorState,
    ) -> CoordinatorResult<(std::collections::BTreeSet<Address>, u64)> {
        let projection = state
            .projector
            .as_ref()
            .and_then(|p| p.state())
            .ok_or_else(|| {
                CoordinatorError::Validation("instance state not yet projected".to_string())
            })?;
        Ok((projection.owner_set.clone(), projection.signatures_required))
    }
}
