//! Per-group event walker.
//!
//! One long-lived worker task per group drains the pending add/cancel queues
//! and advances every active task through newly sealed blocks, at most
//! [`MAX_BLOCK_PROCESS_PER_LOOP`] blocks per task and loop iteration.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::event::{matcher, EventFilterParams, EventSink};
use crate::group::GroupDirectory;
use crate::types::{BlockNumber, StatusCode};
use crate::utils::spawn_in_span;

pub const MAX_BLOCK_PROCESS_PER_LOOP: i64 = 10;
const WORKER_YIELD: Duration = Duration::from_millis(1);

/// A long-lived subscription walking blocks on behalf of one client.
pub struct EventTask {
	pub id: String,
	pub group: String,
	pub params: EventFilterParams,
	/// Next block to process; advances monotonically.
	cursor: AtomicI64,
	/// True exactly while a batch advance is in flight.
	working: AtomicBool,
	pub sink: Arc<dyn EventSink>,
}

impl EventTask {
	pub fn new(
		id: String,
		group: String,
		params: EventFilterParams,
		cursor: BlockNumber,
		sink: Arc<dyn EventSink>,
	) -> Self {
		EventTask {
			id,
			group,
			params,
			cursor: AtomicI64::new(cursor),
			working: AtomicBool::new(false),
			sink,
		}
	}

	pub fn cursor(&self) -> BlockNumber {
		self.cursor.load(Ordering::SeqCst)
	}

	fn advance_cursor(&self, processed: BlockNumber) {
		self.cursor.store(processed + 1, Ordering::SeqCst);
	}

	pub fn is_working(&self) -> bool {
		self.working.load(Ordering::SeqCst)
	}

	/// The task is complete once the cursor has passed a bounded `toBlock`;
	/// an open-ended task (`toBlock < 0`) never completes.
	pub fn is_completed(&self) -> bool {
		self.params.to_block >= 0 && self.cursor() > self.params.to_block
	}
}

pub struct EventGroup {
	group: String,
	directory: Arc<GroupDirectory>,
	latest_block: AtomicI64,
	running: AtomicBool,
	tasks: Mutex<HashMap<String, Arc<EventTask>>>,
	pending_add: Mutex<Vec<Arc<EventTask>>>,
	add_count: AtomicUsize,
	pending_cancel: Mutex<Vec<String>>,
	cancel_count: AtomicUsize,
}

impl EventGroup {
	pub fn new(group: impl Into<String>, directory: Arc<GroupDirectory>) -> Arc<Self> {
		Arc::new(EventGroup {
			group: group.into(),
			directory,
			latest_block: AtomicI64::new(-1),
			running: AtomicBool::new(false),
			tasks: Mutex::new(HashMap::new()),
			pending_add: Mutex::new(Vec::new()),
			add_count: AtomicUsize::new(0),
			pending_cancel: Mutex::new(Vec::new()),
			cancel_count: AtomicUsize::new(0),
		})
	}

	pub fn group(&self) -> &str {
		&self.group
	}

	/// Spawns the worker. The initial head is taken from the ledger; later
	/// heads arrive out of band through [`EventGroup::set_latest_block`].
	pub fn start(self: &Arc<Self>) {
		if self.running.swap(true, Ordering::SeqCst) {
			info!(group = self.group, "Event group is already running");
			return;
		}

		spawn_in_span({
			let group = self.clone();
			async move {
				if let Some(service) = group.directory.select_node(&group.group, None) {
					match service.ledger.block_number().await {
						Ok(head) => group.set_latest_block(head),
						Err(error) => {
							error!(group = group.group, %error, "Failed to fetch initial block number")
						},
					}
				}
				group.run().await;
			}
		});
		info!(group = self.group, "Started event group worker");
	}

	/// Stops the worker after its current iteration and cancels every task.
	pub fn stop(&self) {
		if !self.running.swap(false, Ordering::SeqCst) {
			return;
		}
		info!(group = self.group, "Stopping event group worker");
	}

	pub fn set_latest_block(&self, block_number: BlockNumber) {
		self.latest_block.fetch_max(block_number, Ordering::SeqCst);
	}

	pub fn latest_block(&self) -> BlockNumber {
		self.latest_block.load(Ordering::SeqCst)
	}

	pub fn submit(&self, task: Arc<EventTask>) {
		info!(group = self.group, id = task.id, cursor = task.cursor(), "Queued event task");
		self.pending_add.lock().expect("lock poisoned").push(task);
		self.add_count.fetch_add(1, Ordering::SeqCst);
	}

	pub fn cancel(&self, id: &str) {
		info!(group = self.group, id, "Queued event task cancel");
		self.pending_cancel
			.lock()
			.expect("lock poisoned")
			.push(id.to_string());
		self.cancel_count.fetch_add(1, Ordering::SeqCst);
	}

	pub fn task_count(&self) -> usize {
		self.tasks.lock().expect("lock poisoned").len()
	}

	async fn run(self: Arc<Self>) {
		while self.running.load(Ordering::SeqCst) {
			self.drain_cancels();
			self.drain_adds();
			self.execute_tasks().await;
			sleep(WORKER_YIELD).await;
		}
		// drain, then drop every remaining task
		self.drain_cancels();
		self.drain_adds();
		self.tasks.lock().expect("lock poisoned").clear();
		info!(group = self.group, "Event group worker terminated");
	}

	fn drain_adds(&self) {
		if self.add_count.load(Ordering::SeqCst) == 0 {
			return;
		}
		let pending = {
			let mut pending_add = self.pending_add.lock().expect("lock poisoned");
			self.add_count.store(0, Ordering::SeqCst);
			std::mem::take(&mut *pending_add)
		};
		let mut tasks = self.tasks.lock().expect("lock poisoned");
		for task in pending {
			let id = task.id.clone();
			if tasks.contains_key(&id) {
				error!(group = self.group, id, "Event task already exists");
				continue;
			}
			info!(group = self.group, id, "Activated event task");
			tasks.insert(id, task);
		}
	}

	fn drain_cancels(&self) {
		if self.cancel_count.load(Ordering::SeqCst) == 0 {
			return;
		}
		let pending = {
			let mut pending_cancel = self.pending_cancel.lock().expect("lock poisoned");
			self.cancel_count.store(0, Ordering::SeqCst);
			std::mem::take(&mut *pending_cancel)
		};
		let mut tasks = self.tasks.lock().expect("lock poisoned");
		for id in pending {
			if tasks.remove(&id).is_some() {
				info!(group = self.group, id, "Removed event task");
			} else {
				warn!(group = self.group, id, "Cancel for unknown event task");
			}
		}
	}

	async fn execute_tasks(self: &Arc<Self>) {
		let snapshot: Vec<Arc<EventTask>> = {
			let tasks = self.tasks.lock().expect("lock poisoned");
			tasks.values().cloned().collect()
		};
		for task in snapshot {
			self.execute_task(task).await;
		}
	}

	async fn execute_task(self: &Arc<Self>, task: Arc<EventTask>) {
		// probe the session before doing any work
		let alive = task.sink.push(&task.id, StatusCode::Success, &[]).await;
		if !alive {
			debug!(group = self.group, id = task.id, "Session gone, cancelling task");
			self.cancel(&task.id);
			return;
		}

		if task.is_completed() {
			task.sink
				.push(&task.id, StatusCode::PushCompleted, &[])
				.await;
			info!(
				group = self.group,
				id = task.id,
				to_block = task.params.to_block,
				"Event task completed"
			);
			self.cancel(&task.id);
			return;
		}

		if task.is_working() {
			return;
		}

		let head = self.latest_block();
		if head < task.cursor() {
			// wait for the next sealed block
			return;
		}

		task.working.store(true, Ordering::SeqCst);
		spawn_in_span({
			let group = self.clone();
			async move {
				group.advance_batch(&task, head).await;
				task.working.store(false, Ordering::SeqCst);
			}
		});
	}

	/// Walks blocks `[cursor, end]` sequentially; the cursor advances past a
	/// block only after its logs are delivered. A ledger failure aborts the
	/// batch and the same block is retried on a later iteration.
	async fn advance_batch(&self, task: &EventTask, head: BlockNumber) {
		let cursor = task.cursor();
		let mut end = (cursor + MAX_BLOCK_PROCESS_PER_LOOP - 1).min(head);
		if task.params.to_block >= 0 {
			end = end.min(task.params.to_block);
		}

		let Some(service) = self.directory.select_node(&self.group, None) else {
			warn!(group = self.group, id = task.id, "No node service available for batch");
			return;
		};

		for number in cursor..=end {
			let block = match service.ledger.block_by_number(number).await {
				Ok(block) => block,
				Err(error) => {
					error!(
						group = self.group,
						id = task.id,
						block = number,
						%error,
						"Failed to fetch block, batch aborted"
					);
					return;
				},
			};

			let entries = matcher::matches(&task.params, &block);
			if !entries.is_empty() {
				debug!(
					group = self.group,
					id = task.id,
					block = number,
					count = entries.len(),
					"Pushing matched event logs"
				);
				if !task.sink.push(&task.id, StatusCode::Success, &entries).await {
					// session went away mid-batch; the liveness probe of the
					// next iteration cancels the task
					return;
				}
			}
			task.advance_cursor(number);
		}
	}
}
