//! Shared gateway structs and enums.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use thiserror::Error;

pub type BlockNumber = i64;

/// Status codes shared by frame headers, AMOP responses and event responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
	Success,
	InvalidParams,
	GroupNotExist,
	PushCompleted,
	NoSubscriber,
	NoSubscriberAfterRetry,
	Timeout,
	Disconnected,
	MethodNotFound,
	Internal,
}

impl StatusCode {
	pub fn code(&self) -> i16 {
		match self {
			StatusCode::Success => 0,
			StatusCode::InvalidParams => 10,
			StatusCode::GroupNotExist => 11,
			StatusCode::PushCompleted => 12,
			StatusCode::NoSubscriber => 13,
			StatusCode::NoSubscriberAfterRetry => 14,
			StatusCode::Timeout => 15,
			StatusCode::Disconnected => 16,
			StatusCode::MethodNotFound => 17,
			StatusCode::Internal => 18,
		}
	}
}

impl Display for StatusCode {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.code())
	}
}

/// Gateway-level failure surfaced to clients, carrying the wire status code.
#[derive(Debug, Error)]
pub enum GatewayError {
	#[error("protocol error: {0}")]
	Protocol(String),
	#[error("invalid params: {0}")]
	InvalidParams(String),
	#[error("group does not exist: {0}")]
	GroupNotExist(String),
	#[error("no node or client subscribes the topic: {0}")]
	NoSubscriber(String),
	#[error("no subscriber responded after retrying all candidates: {0}")]
	NoSubscriberAfterRetry(String),
	#[error("request timed out")]
	Timeout,
	#[error("session disconnected")]
	Disconnected,
	#[error("method not found: {0}")]
	MethodNotFound(String),
	#[error("internal error: {0}")]
	Internal(String),
}

impl GatewayError {
	pub fn status(&self) -> StatusCode {
		match self {
			GatewayError::Protocol(_) => StatusCode::InvalidParams,
			GatewayError::InvalidParams(_) => StatusCode::InvalidParams,
			GatewayError::GroupNotExist(_) => StatusCode::GroupNotExist,
			GatewayError::NoSubscriber(_) => StatusCode::NoSubscriber,
			GatewayError::NoSubscriberAfterRetry(_) => StatusCode::NoSubscriberAfterRetry,
			GatewayError::Timeout => StatusCode::Timeout,
			GatewayError::Disconnected => StatusCode::Disconnected,
			GatewayError::MethodNotFound(_) => StatusCode::MethodNotFound,
			GatewayError::Internal(_) => StatusCode::Internal,
		}
	}
}

/// Error reported by an external collaborator; its code and message surface
/// verbatim on the JSON-RPC response.
#[derive(Debug, Clone, Error)]
#[error("collaborator error {code}: {message}")]
pub struct RpcError {
	pub code: i64,
	pub message: String,
}

impl RpcError {
	pub fn new(code: i64, message: impl Into<String>) -> Self {
		RpcError {
			code,
			message: message.into(),
		}
	}

	pub fn no_subscriber(message: impl Into<String>) -> Self {
		RpcError::new(StatusCode::NoSubscriber.code() as i64, message)
	}

	pub fn is_no_subscriber(&self) -> bool {
		self.code == StatusCode::NoSubscriber.code() as i64
	}
}

/// One event log entry pushed to a subscriber.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
	pub address: String,
	pub topics: Vec<String>,
	pub data: String,
	pub block_number: BlockNumber,
	pub transaction_hash: String,
}

/// Event log as recorded in a transaction receipt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventLog {
	pub address: String,
	pub topics: Vec<String>,
	pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
	pub transaction_hash: String,
	pub status: i32,
	#[serde(default)]
	pub logs: Vec<EventLog>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionEntry {
	pub hash: String,
	#[serde(default)]
	pub from: String,
	#[serde(default)]
	pub to: String,
}

/// Block with transactions and receipts, as served by the ledger collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
	pub number: BlockNumber,
	pub hash: String,
	#[serde(default)]
	pub transactions: Vec<TransactionEntry>,
	#[serde(default)]
	pub receipts: Vec<Receipt>,
}

/// Metadata of one node of a group, as published by the registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
	pub name: String,
	#[serde(default)]
	pub service_endpoint: String,
}

/// Group metadata merged into the directory on registry notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupInfo {
	pub group_id: String,
	#[serde(default)]
	pub nodes: HashMap<String, NodeInfo>,
}
