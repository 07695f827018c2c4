//! Event log subscriptions: per-group block walkers pushing matched logs
//! back over the subscriber's session.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use crate::group::GroupDirectory;
use crate::types::{BlockNumber, LogEntry, StatusCode};

pub mod group;
pub mod matcher;

pub use group::{EventGroup, EventTask, MAX_BLOCK_PROCESS_PER_LOOP};

/// Delivery side of one subscription. Implementations resolve the owning
/// session per push and report `false` once it is gone; pushing an empty
/// result with a success status is a pure liveness probe.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
	async fn push(&self, id: &str, status: StatusCode, result: &[LogEntry]) -> bool;
}

/// Filter of one subscription. `fromBlock = -1` means "current head at
/// subscribe time"; `toBlock = -1` leaves the subscription open-ended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct EventFilterParams {
	pub from_block: BlockNumber,
	pub to_block: BlockNumber,
	pub addresses: Vec<String>,
	pub topics: Vec<Vec<String>>,
}

impl Default for EventFilterParams {
	fn default() -> Self {
		EventFilterParams {
			from_block: -1,
			to_block: -1,
			addresses: vec![],
			topics: vec![],
		}
	}
}

/// `{"id": …, "group": …, "params": {…}}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSubRequest {
	pub id: String,
	pub group: String,
	#[serde(default)]
	pub params: EventFilterParams,
}

/// `{"id": …, "group": …}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventUnsubRequest {
	pub id: String,
	#[serde(default)]
	pub group: String,
}

/// `{"id": …, "status": …, "result": […]}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPushPayload {
	pub id: String,
	pub status: i16,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub result: Option<Vec<LogEntry>>,
}

pub struct EventService {
	directory: Arc<GroupDirectory>,
	groups: RwLock<HashMap<String, Arc<EventGroup>>>,
	running: AtomicBool,
}

impl EventService {
	pub fn new(directory: Arc<GroupDirectory>) -> Self {
		EventService {
			directory,
			groups: RwLock::new(HashMap::new()),
			running: AtomicBool::new(false),
		}
	}

	pub fn start(&self) {
		if self.running.swap(true, Ordering::SeqCst) {
			info!("Event service is already running");
			return;
		}
		let groups = self.groups.read().expect("lock poisoned");
		for group in groups.values() {
			group.start();
		}
		info!("Started event service");
	}

	pub fn stop(&self) {
		if !self.running.swap(false, Ordering::SeqCst) {
			return;
		}
		let groups = self.groups.read().expect("lock poisoned");
		for group in groups.values() {
			group.stop();
		}
		info!("Stopped event service");
	}

	/// Group walker for `group_id`, created and started on first use.
	pub fn ensure_group(&self, group_id: &str) -> Arc<EventGroup> {
		{
			let groups = self.groups.read().expect("lock poisoned");
			if let Some(group) = groups.get(group_id) {
				return group.clone();
			}
		}
		let mut groups = self.groups.write().expect("lock poisoned");
		let group = groups
			.entry(group_id.to_string())
			.or_insert_with(|| EventGroup::new(group_id, self.directory.clone()))
			.clone();
		if self.running.load(Ordering::SeqCst) {
			group.start();
		}
		group
	}

	/// Stops the group's walker; its tasks are drained and dropped.
	pub fn remove_group(&self, group_id: &str) {
		let removed = {
			let mut groups = self.groups.write().expect("lock poisoned");
			groups.remove(group_id)
		};
		if let Some(group) = removed {
			group.stop();
			info!(group = group_id, "Removed event group");
		}
	}

	pub fn set_latest_block(&self, group_id: &str, block_number: BlockNumber) {
		let groups = self.groups.read().expect("lock poisoned");
		if let Some(group) = groups.get(group_id) {
			group.set_latest_block(block_number);
		}
	}

	/// Registers a subscription and returns the response status. The cursor
	/// starts at `fromBlock`, or at the group's current head for `-1`.
	pub fn subscribe(&self, request: EventSubRequest, sink: Arc<dyn EventSink>) -> StatusCode {
		if request.id.is_empty() {
			return StatusCode::InvalidParams;
		}
		if request.params.to_block >= 0 && request.params.from_block > request.params.to_block {
			return StatusCode::InvalidParams;
		}
		let head = self.directory.latest_block_number(&request.group);
		if head < 0 {
			warn!(group = request.group, id = request.id, "Subscribe to unknown group");
			return StatusCode::GroupNotExist;
		}

		let cursor = if request.params.from_block >= 0 {
			request.params.from_block
		} else {
			head
		};
		let group = self.ensure_group(&request.group);
		group.set_latest_block(head);
		group.submit(Arc::new(EventTask::new(
			request.id,
			request.group,
			request.params,
			cursor,
			sink,
		)));
		StatusCode::Success
	}

	pub fn unsubscribe(&self, request: EventUnsubRequest) -> StatusCode {
		if request.id.is_empty() {
			return StatusCode::InvalidParams;
		}
		let groups = self.groups.read().expect("lock poisoned");
		match groups.get(&request.group) {
			Some(group) => {
				group.cancel(&request.id);
				StatusCode::Success
			},
			None => StatusCode::GroupNotExist,
		}
	}
}
