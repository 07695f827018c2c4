//! JSON-RPC 2.0 dispatcher shared by the HTTP POST endpoint and RPC_REQUEST
//! frames. Method bodies are pass-throughs to the node collaborators selected
//! through the group directory; collaborator errors surface verbatim.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::amop::PeerGateway;
use crate::group::{GroupDirectory, NodeService};
use crate::types::{RpcError, StatusCode};

const JSONRPC_VERSION: &str = "2.0";
const PARSE_ERROR: i64 = -32700;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;

#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
	#[serde(default)]
	pub jsonrpc: String,
	#[serde(default)]
	pub id: Value,
	pub method: String,
	#[serde(default)]
	pub params: Value,
}

#[derive(Debug, Serialize)]
struct JsonRpcResponse {
	jsonrpc: &'static str,
	id: Value,
	#[serde(skip_serializing_if = "Option::is_none")]
	result: Option<Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	error: Option<JsonRpcErrorObject>,
}

#[derive(Debug, Serialize)]
struct JsonRpcErrorObject {
	code: i64,
	message: String,
}

pub struct JsonRpcDispatcher {
	directory: Arc<GroupDirectory>,
	gateway: Arc<dyn PeerGateway>,
}

impl JsonRpcDispatcher {
	pub fn new(directory: Arc<GroupDirectory>, gateway: Arc<dyn PeerGateway>) -> Self {
		JsonRpcDispatcher { directory, gateway }
	}

	/// Dispatches a request body and always yields a response document.
	pub async fn dispatch(&self, body: &str) -> String {
		let request: JsonRpcRequest = match serde_json::from_str(body) {
			Ok(request) => request,
			Err(error) => {
				warn!(%error, "Malformed JSON-RPC request");
				return respond_error(
					Value::Null,
					RpcError::new(PARSE_ERROR, format!("parse error: {error}")),
				);
			},
		};

		let id = request.id.clone();
		debug!(method = request.method, "Dispatching JSON-RPC request");
		match self.handle(request).await {
			Ok(result) => {
				serde_json::to_string(&JsonRpcResponse {
					jsonrpc: JSONRPC_VERSION,
					id,
					result: Some(result),
					error: None,
				})
				.unwrap_or_else(|error| {
					respond_error(Value::Null, RpcError::new(PARSE_ERROR, error.to_string()))
				})
			},
			Err(error) => respond_error(id, error),
		}
	}

	async fn handle(&self, request: JsonRpcRequest) -> Result<Value, RpcError> {
		let params = &request.params;
		match request.method.as_str() {
			"call" => {
				let service = self.select(params)?;
				let to = param_str(params, 2, "to")?;
				let data = param_str(params, 3, "data")?;
				service.scheduler.call(&to, &data).await
			},
			"sendTransaction" => {
				let service = self.select(params)?;
				let data = param_str(params, 2, "data")?;
				service.txpool.submit(&data).await
			},
			"getTransaction" => {
				let service = self.select(params)?;
				let hash = param_str(params, 2, "transactionHash")?;
				service.ledger.transaction(&hash).await
			},
			"getTransactionReceipt" => {
				let service = self.select(params)?;
				let hash = param_str(params, 2, "transactionHash")?;
				service.ledger.transaction_receipt(&hash).await
			},
			"getBlockByHash" => {
				let service = self.select(params)?;
				let hash = param_str(params, 2, "blockHash")?;
				let block = service.ledger.block_by_hash(&hash).await?;
				serde_json::to_value(block).map_err(internal)
			},
			"getBlockByNumber" => {
				let service = self.select(params)?;
				let number = param_i64(params, 2, "blockNumber")?;
				let block = service.ledger.block_by_number(number).await?;
				serde_json::to_value(block).map_err(internal)
			},
			"getBlockHashByNumber" => {
				let service = self.select(params)?;
				let number = param_i64(params, 2, "blockNumber")?;
				service
					.ledger
					.block_hash_by_number(number)
					.await
					.map(Value::from)
			},
			"getBlockNumber" => {
				let service = self.select(params)?;
				service.ledger.block_number().await.map(Value::from)
			},
			"getCode" => {
				let service = self.select(params)?;
				let address = param_str(params, 2, "contractAddress")?;
				service.ledger.code(&address).await.map(Value::from)
			},
			"getSealerList" => self.select(params)?.consensus.sealer_list().await,
			"getObserverList" => self.select(params)?.consensus.observer_list().await,
			"getPbftView" => {
				let service = self.select(params)?;
				service.consensus.pbft_view().await.map(Value::from)
			},
			"getPendingTxSize" => {
				let service = self.select(params)?;
				service.txpool.pending_tx_size().await.map(Value::from)
			},
			"getSyncStatus" => self.select(params)?.sync.sync_status().await,
			"getSystemConfigByKey" => {
				let service = self.select(params)?;
				let key = param_str(params, 2, "key")?;
				service.ledger.system_config_by_key(&key).await
			},
			"getTotalTransactionCount" => {
				self.select(params)?.ledger.total_transaction_count().await
			},
			"getPeers" => self.gateway.peer_info().await,
			"getNodeInfo" => Ok(json!({
				"chainId": self.directory.chain_id(),
				"groupList": self.directory.group_list(),
			})),
			"getGroupList" => Ok(json!({ "groupList": self.directory.group_list() })),
			"getGroupInfo" => {
				let group = param_str(params, 0, "groupId")?;
				let info = self
					.directory
					.group_info(&group)
					.ok_or_else(|| group_not_exist(&group))?;
				serde_json::to_value(info).map_err(internal)
			},
			"getGroupInfoList" => {
				serde_json::to_value(self.directory.group_info_list()).map_err(internal)
			},
			method => Err(RpcError::new(
				METHOD_NOT_FOUND,
				format!("method not found: {method}"),
			)),
		}
	}

	/// Picks the node service addressed by the leading `[group, node]` params.
	fn select(&self, params: &Value) -> Result<NodeService, RpcError> {
		let group = param_str(params, 0, "groupId")?;
		let node = params
			.get(1)
			.and_then(Value::as_str)
			.filter(|name| !name.is_empty());
		self.directory
			.select_node(&group, node)
			.ok_or_else(|| group_not_exist(&group))
	}
}

fn respond_error(id: Value, error: RpcError) -> String {
	serde_json::to_string(&JsonRpcResponse {
		jsonrpc: JSONRPC_VERSION,
		id,
		result: None,
		error: Some(JsonRpcErrorObject {
			code: error.code,
			message: error.message,
		}),
	})
	.expect("error response serialization cannot fail")
}

fn param_str(params: &Value, index: usize, name: &str) -> Result<String, RpcError> {
	params
		.get(index)
		.and_then(Value::as_str)
		.map(ToString::to_string)
		.ok_or_else(|| RpcError::new(INVALID_PARAMS, format!("missing param {name}")))
}

fn param_i64(params: &Value, index: usize, name: &str) -> Result<i64, RpcError> {
	params
		.get(index)
		.and_then(Value::as_i64)
		.ok_or_else(|| RpcError::new(INVALID_PARAMS, format!("missing param {name}")))
}

fn group_not_exist(group: &str) -> RpcError {
	RpcError::new(
		StatusCode::GroupNotExist.code() as i64,
		format!("group does not exist: {group}"),
	)
}

fn internal(error: serde_json::Error) -> RpcError {
	RpcError::new(-32603, error.to_string())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::amop::tests::MockGateway;
	use crate::group::tests::{group_info, StaticFactory};
	use crate::types::Block;
	use test_case::test_case;

	async fn dispatcher_with_head(head: i64) -> JsonRpcDispatcher {
		let blocks = vec![Block {
			number: head,
			hash: "0xhead".to_string(),
			transactions: vec![],
			receipts: vec![],
		}];
		let directory = Arc::new(GroupDirectory::new(
			"chain0",
			Arc::new(StaticFactory::new(head, blocks)),
		));
		directory.update_group_info(group_info("g1", &["n1"])).await;
		JsonRpcDispatcher::new(directory, MockGateway::new())
	}

	#[tokio::test]
	async fn get_block_number_passthrough() {
		let dispatcher = dispatcher_with_head(42).await;
		let response = dispatcher
			.dispatch(r#"{"jsonrpc":"2.0","method":"getBlockNumber","params":["g1","n1"],"id":7}"#)
			.await;
		assert_eq!(response, r#"{"jsonrpc":"2.0","id":7,"result":42}"#);
	}

	#[tokio::test]
	async fn unknown_group_is_reported() {
		let dispatcher = dispatcher_with_head(42).await;
		let response = dispatcher
			.dispatch(r#"{"jsonrpc":"2.0","method":"getBlockNumber","params":["nope"],"id":1}"#)
			.await;
		let value: Value = serde_json::from_str(&response).unwrap();
		assert_eq!(value["error"]["code"], 11);
	}

	#[tokio::test]
	async fn unknown_method_is_reported() {
		let dispatcher = dispatcher_with_head(42).await;
		let response = dispatcher
			.dispatch(r#"{"jsonrpc":"2.0","method":"mineFaster","params":[],"id":2}"#)
			.await;
		let value: Value = serde_json::from_str(&response).unwrap();
		assert_eq!(value["error"]["code"], METHOD_NOT_FOUND);
		assert_eq!(value["id"], 2);
	}

	#[test_case("not json at all")]
	#[test_case(r#"{"jsonrpc":"2.0","params":[]}"# ; "missing method")]
	#[tokio::test]
	async fn malformed_body_yields_parse_error(body: &str) {
		let dispatcher = dispatcher_with_head(42).await;
		let response = dispatcher.dispatch(body).await;
		let value: Value = serde_json::from_str(&response).unwrap();
		assert_eq!(value["error"]["code"], PARSE_ERROR);
		assert_eq!(value["id"], Value::Null);
	}

	#[tokio::test]
	async fn missing_params_are_reported() {
		let dispatcher = dispatcher_with_head(42).await;
		let response = dispatcher
			.dispatch(r#"{"jsonrpc":"2.0","method":"getCode","params":["g1","n1"],"id":3}"#)
			.await;
		let value: Value = serde_json::from_str(&response).unwrap();
		assert_eq!(value["error"]["code"], INVALID_PARAMS);
	}

	#[tokio::test]
	async fn block_by_number_serializes_block() {
		let dispatcher = dispatcher_with_head(42).await;
		let response = dispatcher
			.dispatch(
				r#"{"jsonrpc":"2.0","method":"getBlockByNumber","params":["g1","n1",42],"id":4}"#,
			)
			.await;
		let value: Value = serde_json::from_str(&response).unwrap();
		assert_eq!(value["result"]["number"], 42);
		assert_eq!(value["result"]["hash"], "0xhead");
	}

	#[tokio::test]
	async fn collaborator_error_surfaces_verbatim() {
		let dispatcher = dispatcher_with_head(42).await;
		// StaticLedger reports -1 for blocks it does not hold
		let response = dispatcher
			.dispatch(
				r#"{"jsonrpc":"2.0","method":"getBlockByNumber","params":["g1","n1",7],"id":5}"#,
			)
			.await;
		let value: Value = serde_json::from_str(&response).unwrap();
		assert_eq!(value["error"]["code"], -1);
		assert_eq!(value["error"]["message"], "block 7 not found");
	}

	#[tokio::test]
	async fn node_info_and_group_management_reads() {
		let dispatcher = dispatcher_with_head(42).await;

		let response = dispatcher
			.dispatch(r#"{"jsonrpc":"2.0","method":"getNodeInfo","params":[],"id":6}"#)
			.await;
		let value: Value = serde_json::from_str(&response).unwrap();
		assert_eq!(value["result"]["chainId"], "chain0");
		assert_eq!(value["result"]["groupList"][0], "g1");

		let response = dispatcher
			.dispatch(r#"{"jsonrpc":"2.0","method":"getGroupInfo","params":["g1"],"id":7}"#)
			.await;
		let value: Value = serde_json::from_str(&response).unwrap();
		assert_eq!(value["result"]["groupId"], "g1");

		let response = dispatcher
			.dispatch(r#"{"jsonrpc":"2.0","method":"getGroupList","params":[],"id":8}"#)
			.await;
		let value: Value = serde_json::from_str(&response).unwrap();
		assert_eq!(value["result"]["groupList"], json!(["g1"]));
	}

	#[tokio::test]
	async fn send_transaction_passthrough() {
		let dispatcher = dispatcher_with_head(42).await;
		let response = dispatcher
			.dispatch(
				r#"{"jsonrpc":"2.0","method":"sendTransaction","params":["g1","n1","0xdead"],"id":9}"#,
			)
			.await;
		let value: Value = serde_json::from_str(&response).unwrap();
		assert_eq!(value["result"]["status"], 0);
	}
}
