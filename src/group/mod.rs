//! Group and node directory with a latest-block-aware node selector.

use rand::{seq::SliceRandom, thread_rng};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use crate::types::{BlockNumber, GroupInfo, NodeInfo};

mod node;
pub use node::{BlockSync, Consensus, Ledger, NodeService, NodeServiceFactory, Scheduler, TxPool};

struct Services {
	groups: HashMap<String, GroupInfo>,
	node_services: HashMap<String, NodeService>,
}

struct BlockIndex {
	latest: HashMap<String, BlockNumber>,
	nodes_at_latest: HashMap<String, HashSet<String>>,
}

pub struct GroupDirectory {
	chain_id: String,
	factory: Arc<dyn NodeServiceFactory>,
	services: RwLock<Services>,
	block_index: RwLock<BlockIndex>,
}

impl GroupDirectory {
	pub fn new(chain_id: impl Into<String>, factory: Arc<dyn NodeServiceFactory>) -> Self {
		GroupDirectory {
			chain_id: chain_id.into(),
			factory,
			services: RwLock::new(Services {
				groups: HashMap::new(),
				node_services: HashMap::new(),
			}),
			block_index: RwLock::new(BlockIndex {
				latest: HashMap::new(),
				nodes_at_latest: HashMap::new(),
			}),
		}
	}

	pub fn chain_id(&self) -> &str {
		&self.chain_id
	}

	/// Merges group metadata; a service bundle is built for every previously
	/// unseen node. Services are built outside the lock.
	pub async fn update_group_info(&self, group_info: GroupInfo) {
		let group_id = group_info.group_id.clone();
		let unseen: Vec<NodeInfo> = {
			let services = self.services.read().expect("lock poisoned");
			group_info
				.nodes
				.values()
				.filter(|node| !services.node_services.contains_key(&node.name))
				.cloned()
				.collect()
		};

		let mut built = Vec::with_capacity(unseen.len());
		for node in &unseen {
			match self.factory.build(&self.chain_id, &group_id, node).await {
				Ok(service) => {
					info!(group = group_id, node = node.name, "Built node service for started node");
					built.push((node.name.clone(), service));
				},
				Err(error) => {
					warn!(group = group_id, node = node.name, %error, "Failed to build node service");
				},
			}
		}

		let mut services = self.services.write().expect("lock poisoned");
		for (name, service) in built {
			services.node_services.insert(name, service);
		}
		match services.groups.entry(group_id) {
			Entry::Occupied(mut entry) => entry.get_mut().nodes.extend(group_info.nodes),
			Entry::Vacant(entry) => {
				entry.insert(group_info);
			},
		}
	}

	/// Forgets a group; its block index entry goes with it. Node services
	/// shared with other groups are kept.
	pub fn remove_group(&self, group_id: &str) {
		let mut services = self.services.write().expect("lock poisoned");
		let Some(removed) = services.groups.remove(group_id) else {
			return;
		};
		let still_used: HashSet<String> = services
			.groups
			.values()
			.flat_map(|group| group.nodes.values().map(|node| node.name.clone()))
			.collect();
		for node in removed.nodes.values() {
			if !still_used.contains(&node.name) {
				services.node_services.remove(&node.name);
			}
		}
		drop(services);

		let mut index = self.block_index.write().expect("lock poisoned");
		index.latest.remove(group_id);
		index.nodes_at_latest.remove(group_id);
		info!(group = group_id, "Removed group from directory");
	}

	/// Selects the node service for an operation. A named node is returned
	/// directly; otherwise nodes at the group's latest observed block are
	/// preferred, with uniform random tie-breaks.
	pub fn select_node(&self, group_id: &str, node_name: Option<&str>) -> Option<NodeService> {
		let services = self.services.read().expect("lock poisoned");
		if let Some(name) = node_name.filter(|name| !name.is_empty()) {
			return services.node_services.get(name).cloned();
		}

		let group = services.groups.get(group_id)?;
		let members: Vec<&str> = group.nodes.values().map(|node| node.name.as_str()).collect();
		if members.is_empty() {
			return None;
		}

		let index = self.block_index.read().expect("lock poisoned");
		let candidates: Vec<&str> = index
			.nodes_at_latest
			.get(group_id)
			.map(|at_latest| {
				members
					.iter()
					.copied()
					.filter(|name| at_latest.contains(*name))
					.collect()
			})
			.unwrap_or_default();

		let pool = if candidates.is_empty() { &members } else { &candidates };
		let chosen = pool.choose(&mut thread_rng())?;
		services.node_services.get(*chosen).cloned()
	}

	/// Copy-on-write update of the latest-block index: a strictly greater
	/// block replaces the node set, an equal block joins it, a smaller one is
	/// ignored. Idempotent for repeated notifications.
	pub fn update_group_block_info(
		&self,
		group_id: &str,
		node_name: &str,
		block_number: BlockNumber,
	) {
		{
			let index = self.block_index.read().expect("lock poisoned");
			if let Some(&stored) = index.latest.get(group_id) {
				if stored > block_number {
					return;
				}
				if stored == block_number
					&& index
						.nodes_at_latest
						.get(group_id)
						.is_some_and(|nodes| nodes.contains(node_name))
				{
					return;
				}
			}
		}

		let mut index = self.block_index.write().expect("lock poisoned");
		let stored = index.latest.get(group_id).copied().unwrap_or(-1);
		if stored > block_number {
			return;
		}
		if stored < block_number {
			index.latest.insert(group_id.to_string(), block_number);
			index
				.nodes_at_latest
				.insert(group_id.to_string(), HashSet::new());
		}
		index
			.nodes_at_latest
			.entry(group_id.to_string())
			.or_default()
			.insert(node_name.to_string());
		debug!(
			group = group_id,
			node = node_name,
			block = block_number,
			"Updated latest block index"
		);
	}

	/// Latest block observed for the group from any node, or -1 when the
	/// group is unknown.
	pub fn latest_block_number(&self, group_id: &str) -> BlockNumber {
		let index = self.block_index.read().expect("lock poisoned");
		index.latest.get(group_id).copied().unwrap_or(-1)
	}

	pub fn is_known_group(&self, group_id: &str) -> bool {
		let services = self.services.read().expect("lock poisoned");
		services.groups.contains_key(group_id)
	}

	pub fn group_list(&self) -> Vec<String> {
		let services = self.services.read().expect("lock poisoned");
		let mut groups: Vec<String> = services.groups.keys().cloned().collect();
		groups.sort();
		groups
	}

	pub fn group_info(&self, group_id: &str) -> Option<GroupInfo> {
		let services = self.services.read().expect("lock poisoned");
		services.groups.get(group_id).cloned()
	}

	pub fn group_info_list(&self) -> Vec<GroupInfo> {
		let services = self.services.read().expect("lock poisoned");
		let mut groups: Vec<GroupInfo> = services.groups.values().cloned().collect();
		groups.sort_by(|a, b| a.group_id.cmp(&b.group_id));
		groups
	}
}
