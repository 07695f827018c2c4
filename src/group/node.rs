//! Contracts of the upstream node collaborators.
//!
//! The gateway consumes these handles but never implements them; the host
//! process supplies concrete clients for each node of the cluster.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::types::{Block, BlockNumber, NodeInfo, RpcError};

#[async_trait]
pub trait Ledger: Send + Sync {
	async fn block_number(&self) -> Result<BlockNumber, RpcError>;
	/// Block with transactions and receipts; drives the event walker.
	async fn block_by_number(&self, number: BlockNumber) -> Result<Block, RpcError>;
	async fn block_by_hash(&self, hash: &str) -> Result<Block, RpcError>;
	async fn block_hash_by_number(&self, number: BlockNumber) -> Result<String, RpcError>;
	async fn transaction(&self, hash: &str) -> Result<Value, RpcError>;
	async fn transaction_receipt(&self, hash: &str) -> Result<Value, RpcError>;
	async fn code(&self, address: &str) -> Result<String, RpcError>;
	async fn system_config_by_key(&self, key: &str) -> Result<Value, RpcError>;
	async fn total_transaction_count(&self) -> Result<Value, RpcError>;
}

#[async_trait]
pub trait Scheduler: Send + Sync {
	async fn call(&self, to: &str, data: &str) -> Result<Value, RpcError>;
}

#[async_trait]
pub trait TxPool: Send + Sync {
	async fn submit(&self, data: &str) -> Result<Value, RpcError>;
	async fn pending_tx_size(&self) -> Result<u64, RpcError>;
}

#[async_trait]
pub trait Consensus: Send + Sync {
	async fn sealer_list(&self) -> Result<Value, RpcError>;
	async fn observer_list(&self) -> Result<Value, RpcError>;
	async fn pbft_view(&self) -> Result<u64, RpcError>;
}

#[async_trait]
pub trait BlockSync: Send + Sync {
	async fn sync_status(&self) -> Result<Value, RpcError>;
}

/// Bundle of RPC handles to one node; owned by the directory, borrowed by
/// other components for the duration of a single operation.
#[derive(Clone)]
pub struct NodeService {
	pub name: String,
	pub ledger: Arc<dyn Ledger>,
	pub scheduler: Arc<dyn Scheduler>,
	pub txpool: Arc<dyn TxPool>,
	pub consensus: Arc<dyn Consensus>,
	pub sync: Arc<dyn BlockSync>,
}

/// Service discovery collaborator that turns node metadata into a live
/// [`NodeService`] bundle.
#[async_trait]
pub trait NodeServiceFactory: Send + Sync {
	async fn build(
		&self,
		chain_id: &str,
		group_id: &str,
		node: &NodeInfo,
	) -> Result<NodeService, RpcError>;
}
