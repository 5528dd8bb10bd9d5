//! Off-chain signature relay client
//!
//! The relay is a dumb shared pool: clients post proposals and signatures
//! and periodically fetch what other owners' clients have contributed. All
//! authorization and threshold logic stays local; the relay's contents are
//! treated as untrusted input and re-validated on merge.

use crate::coordination::proposal::{ProposalKey, ProposalPayload};
use crate::error::{CoordinatorError, CoordinatorResult};

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Wire form of a proposal in the shared pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolProposal {
    pub instance: String,
    pub nonce: u64,
    pub payload_hash: String,
    pub to: String,
    pub value: String,
    pub data: String,
    #[serde(default)]
    pub signatures: Vec<PoolSignature>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSignature {
    pub owner: String,
    pub signature: String,
}

impl PoolProposal {
    pub fn from_local(key: &ProposalKey, payload: &ProposalPayload) -> Self {
        Self {
            instance: format!("{:?}", key.instance),
            nonce: key.nonce,
            payload_hash: format!("{:?}", key.payload_hash),
            to: format!("{:?}", payload.to),
            value: payload.value.to_string(),
            data: format!("0x{}", hex::encode(&payload.data)),
            signatures: Vec::new(),
        }
    }

    pub fn key(&self) -> CoordinatorResult<ProposalKey> {
        Ok(ProposalKey {
            instance: parse_address(&self.instance)?,
            nonce: self.nonce,
            payload_hash: H256::from_str(&self.payload_hash)
                .map_err(|e| CoordinatorError::Relay(format!("bad payload hash: {}", e)))?,
        })
    }

    pub fn payload(&self) -> CoordinatorResult<ProposalPayload> {
        let value = U256::from_dec_str(&self.value)
            .map_err(|e| CoordinatorError::Relay(format!("bad value: {}", e)))?;
        let data = hex::decode(self.data.trim_start_matches("0x"))
            .map_err(|e| CoordinatorError::Relay(format!("bad calldata hex: {}", e)))?;
        Ok(ProposalPayload::new(
            parse_address(&self.to)?,
            value,
            Bytes::from(data),
        ))
    }

    /// Decode the carried signatures into owner-keyed form. Entries that do
    /// not parse are reported, not silently dropped.
    pub fn signature_map(&self) -> CoordinatorResult<BTreeMap<Address, Vec<u8>>> {
        let mut map = BTreeMap::new();
        for entry in &self.signatures {
            let owner = parse_address(&entry.owner)?;
            let bytes = hex::decode(entry.signature.trim_start_matches("0x"))
                .map_err(|e| CoordinatorError::Relay(format!("bad signature hex: {}", e)))?;
            map.insert(owner, bytes);
        }
        Ok(map)
    }
}

fn parse_address(s: &str) -> CoordinatorResult<Address> {
    Address::from_str(s).map_err(|e| CoordinatorError::Relay(format!("bad address {}: {}", s, e)))
}

/// Transport seam to the shared pool.
#[async_trait]
pub trait SignaturePool: Send + Sync {
    /// Announce a proposal to the pool.
    async fn post_proposal(&self, proposal: &PoolProposal) -> CoordinatorResult<()>;

    /// Attach one owner's signature to an announced proposal.
    async fn post_signature(
        &self,
        key: &ProposalKey,
        owner: Address,
        signature: &[u8],
    ) -> CoordinatorResult<()>;

    /// Fetch every pool proposal scoped to one wallet instance.
    async fn fetch_proposals(&self, instance: Address) -> CoordinatorResult<Vec<PoolProposal>>;
}

/// HTTP relay client. Transport failures surface as `Relay` errors with the
/// underlying message preserved.
pub struct HttpRelay {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRelay {
    pub fn new(base_url: String, request_timeout_ms: u64) -> CoordinatorResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(request_timeout_ms))
            .build()
            .map_err(|e| CoordinatorError::Relay(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn check(response: reqwest::Response) -> CoordinatorResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(CoordinatorError::Relay(format!(
                "relay returned {}: {}",
                status, body
            )))
        }
    }
}

#[async_trait]
impl SignaturePool for HttpRelay {
    async fn post_proposal(&self, proposal: &PoolProposal) -> CoordinatorResult<()> {
        let url = format!("{}/proposals", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(proposal)
            .send()
            .await
            .map_err(|e| CoordinatorError::Relay(e.to_string()))?;
        Self::check(response).await?;
        debug!(
            "Announced proposal {}:{} to relay",
            proposal.instance, proposal.nonce
        );
        Ok(())
    }

    async fn post_signature(
        &self,
        key: &ProposalKey,
        owner: Address,
        signature: &[u8],
    ) -> CoordinatorResult<()> {
        let url = format!(
            "{}/proposals/{:?}/{}/{:?}/signatures",
            self.base_url, key.instance, key.nonce, key.payload_hash
        );
        let body = PoolSignature {
            owner: format!("{:?}", owner),
            signature: format!("0x{}", hex::encode(signature)),
        };
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| CoordinatorError::Relay(e.to_string()))?;
        Self::check(response).await?;
        Ok(())
    }

    async fn fetch_proposals(&self, instance: Address) -> CoordinatorResult<Vec<PoolProposal>> {
        let url = format!("{}/proposals?instance={:?}", self.base_url, instance);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| CoordinatorError::Relay(e.to_string()))?;
        Self::check(response)
            .await?
            .json::<Vec<PoolProposal>>()
            .await
            .map_err(|e| CoordinatorError::Relay(e.to_string()))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_proposal_roundtrip() {
        let payload = ProposalPayload::new(
            Address::repeat_byte(0xee),
            U256::from(42u64),
            Bytes::from(vec![0xca, 0xfe]),
        );
        let key = ProposalKey::new(Address::repeat_byte(0x77), 3, &payload);

        let wire = PoolProposal::from_local(&key, &payload);
        assert_eq!(wire.key().unwrap(), key);
        assert_eq!(wire.payload().unwrap(), payload);
    }

    #[test]
    fn test_malformed_signature_hex_reported() {
        let payload = ProposalPayload::new(Address::zero(), U256::zero(), Bytes::new());
        let key = ProposalKey::new(Address::repeat_byte(0x77), 0, &payload);
        let mut wire = PoolProposal::from_local(&key, &payload);
        wire.signatures.push(PoolSignature {
            owner: format!("{:?}", Address::repeat_byte(0xa1)),
            signature: "0xzz".to_string(),
        });

        assert!(matches!(
            wire.signature_map().unwrap_err(),
            CoordinatorError::Relay(_)
        ));
    }
}
