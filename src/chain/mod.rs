//! Chain module - provider access, contract binding, and event streaming
//!
//! This module provides:
//! - Multi-RPC provider management with automatic failover
//! - Polling log ingestion with ordering and dedup
//! - View-call contract handles scoped to the active wallet instance

pub mod binding;
pub mod listener;
pub mod provider;

pub use binding::{BindingManager, ContractBinding};
pub use listener::EventStream;
pub use provider::{ChainProvider, GasPrice};
