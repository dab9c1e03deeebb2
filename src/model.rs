//! Data model shared by every pipeline stage.
//!
//! A [`Deployment`] is enriched in place as it flows extractor → classifier →
//! attribution client → persistence, becoming first a [`ClassifiedDeployment`]
//! then an [`AttributedDeployment`] before it is turned into a [`ContractRow`].

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a contract came to exist: created directly by a transaction, or by
/// another contract's `CREATE`/`CREATE2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentKind {
    Direct,
    Factory,
}

impl DeploymentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentKind::Direct => "direct",
            DeploymentKind::Factory => "factory",
        }
    }
}

/// A newly observed contract creation, not yet classified or attributed.
#[derive(Debug, Clone)]
pub struct Deployment {
    pub contract_address: String,
    pub chain: String,
    pub deployer_address: String,
    pub block_number: u64,
    pub tx_index: u64,
    pub log_index: Option<u64>,
    pub transaction_hash: String,
    pub kind: DeploymentKind,
    pub factory_address: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Deployment {
    /// Ordering key used to sort deployments within an extracted range:
    /// ascending by block, then tx index, then log index (direct deployments
    /// sort before any factory deployment from the same transaction because
    /// `log_index` is `None` for them).
    pub fn order_key(&self) -> (u64, u64, Option<u64>) {
        (self.block_number, self.tx_index, self.log_index)
    }
}

/// The interface tags the classifier can assign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ContractType {
    Erc20,
    Erc721,
    Erc1155,
    Router,
    Pool,
    Proxy,
    Staking,
    Multisig,
    Timelock,
    Unknown,
    Error,
}

impl ContractType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContractType::Erc20 => "ERC20",
            ContractType::Erc721 => "ERC721",
            ContractType::Erc1155 => "ERC1155",
            ContractType::Router => "Router",
            ContractType::Pool => "Pool",
            ContractType::Proxy => "Proxy",
            ContractType::Staking => "Staking",
            ContractType::Multisig => "Multisig",
            ContractType::Timelock => "Timelock",
            ContractType::Unknown => "Unknown",
            ContractType::Error => "Error",
        }
    }

    /// Tie-break order when multiple interfaces tie on confidence: lower rank wins.
    pub fn tie_break_rank(&self) -> u8 {
        match self {
            ContractType::Erc20 => 0,
            ContractType::Erc721 => 1,
            ContractType::Erc1155 => 2,
            ContractType::Router => 3,
            ContractType::Pool => 4,
            ContractType::Proxy => 5,
            ContractType::Staking => 6,
            ContractType::Multisig => 7,
            ContractType::Timelock => 8,
            ContractType::Unknown => 9,
            ContractType::Error => 10,
        }
    }
}

/// Type-specific metadata extracted via view calls. Absent fields mean the
/// corresponding call failed or was not applicable; they never abort
/// classification.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContractMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decimals: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_supply: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_token0: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_token1: Option<String>,
}

impl ContractMetadata {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.symbol.is_none()
            && self.decimals.is_none()
            && self.total_supply.is_none()
            && self.pool_token0.is_none()
            && self.pool_token1.is_none()
    }
}

/// A [`Deployment`] enriched with interface classification.
#[derive(Debug, Clone)]
pub struct ClassifiedDeployment {
    pub deployment: Deployment,
    pub primary_type: ContractType,
    pub matched_types: BTreeSet<ContractType>,
    pub confidence: f64,
    pub bytecode_size: usize,
    pub metadata: ContractMetadata,
}

/// A [`ClassifiedDeployment`] enriched with entity attribution for the deployer.
#[derive(Debug, Clone)]
pub struct AttributedDeployment {
    pub classified: ClassifiedDeployment,
    pub entity_name: Option<String>,
    pub entity_id: Option<String>,
}

/// The fully enriched, persistable row.
#[derive(Debug, Clone)]
pub struct ContractRow {
    pub network: String,
    pub contract_address: String,
    pub deployer_address: String,
    pub entity_name: Option<String>,
    pub entity_id: Option<String>,
    pub block_number: u64,
    pub transaction_hash: String,
    pub contract_type: ContractType,
    pub contract_info: ContractMetadata,
    pub factory_address: Option<String>,
    pub deployment_type: DeploymentKind,
    pub timestamp: DateTime<Utc>,
}

impl From<AttributedDeployment> for ContractRow {
    fn from(a: AttributedDeployment) -> Self {
        let d = a.classified.deployment;
        ContractRow {
            network: d.chain,
            contract_address: d.contract_address,
            deployer_address: d.deployer_address,
            entity_name: a.entity_name,
            entity_id: a.entity_id,
            block_number: d.block_number,
            transaction_hash: d.transaction_hash,
            contract_type: a.classified.primary_type,
            contract_info: a.classified.metadata,
            factory_address: d.factory_address,
            deployment_type: d.kind,
            timestamp: Utc::now(),
        }
    }
}

/// The durable per-chain scan cursor: the highest block fully processed.
#[derive(Debug, Clone, Copy)]
pub struct ChainCursor {
    pub last_processed_block: u64,
}
