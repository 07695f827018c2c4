//! Topic bookkeeping for AMOP routing.
//!
//! Two views are maintained: the topics subscribed by locally connected
//! clients (keyed by session endpoint) and the last gossiped topic snapshot
//! of every peer node. A monotonic `topic_seq` changes whenever the local
//! view changes; peers use it as a cheap invalidation token.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use tracing::{debug, info};

use crate::types::GatewayError;

/// `{"topics": ["t1", …]}` — client subscribe payload.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubTopicsPayload {
	pub topics: Vec<String>,
}

/// `{"topicSeq": …, "topicItems": ["t1", …]}` — gossiped topic snapshot.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicSnapshot {
	pub topic_seq: u32,
	pub topic_items: Vec<String>,
}

struct LocalTopics {
	topic_seq: u32,
	clients: HashMap<String, HashSet<String>>,
}

struct PeerTopics {
	topic_seq: u32,
	topics: HashSet<String>,
}

pub struct TopicManager {
	local: RwLock<LocalTopics>,
	peers: RwLock<HashMap<String, PeerTopics>>,
}

impl TopicManager {
	pub fn new() -> Self {
		TopicManager {
			local: RwLock::new(LocalTopics {
				topic_seq: 0,
				clients: HashMap::new(),
			}),
			peers: RwLock::new(HashMap::new()),
		}
	}

	pub fn topic_seq(&self) -> u32 {
		self.local.read().expect("lock poisoned").topic_seq
	}

	/// Replaces the client's topic set. The sequence is bumped only when the
	/// set actually changes, so re-subscribing the current set is a no-op.
	pub fn subscribe_client(&self, client: &str, topics: HashSet<String>) {
		let mut local = self.local.write().expect("lock poisoned");
		if local.clients.get(client) == Some(&topics) {
			debug!(client, "Topic set unchanged, keeping current sequence");
			return;
		}
		local.clients.insert(client.to_string(), topics);
		local.topic_seq = local.topic_seq.wrapping_add(1);
		info!(
			client,
			topic_seq = local.topic_seq,
			"Replaced client topic set"
		);
	}

	pub fn unsubscribe_client(&self, client: &str) {
		let mut local = self.local.write().expect("lock poisoned");
		if local.clients.remove(client).is_none() {
			return;
		}
		local.topic_seq = local.topic_seq.wrapping_add(1);
		info!(
			client,
			topic_seq = local.topic_seq,
			"Released client topics"
		);
	}

	pub fn client_topics(&self, client: &str) -> Option<HashSet<String>> {
		let local = self.local.read().expect("lock poisoned");
		local.clients.get(client).cloned()
	}

	/// Snapshot served to peers; the sequence and the topic union are read
	/// under one lock so the snapshot always reflects the current sequence.
	pub fn export_local_topics(&self) -> TopicSnapshot {
		let local = self.local.read().expect("lock poisoned");
		let mut topic_items: Vec<String> = local
			.clients
			.values()
			.flatten()
			.cloned()
			.collect::<HashSet<_>>()
			.into_iter()
			.collect();
		topic_items.sort();
		TopicSnapshot {
			topic_seq: local.topic_seq,
			topic_items,
		}
	}

	/// Local clients subscribed to `topic`, by endpoint.
	pub fn clients_for_topic(&self, topic: &str) -> Vec<String> {
		let local = self.local.read().expect("lock poisoned");
		local
			.clients
			.iter()
			.filter(|(_, topics)| topics.contains(topic))
			.map(|(client, _)| client.clone())
			.collect()
	}

	/// Topics of `client` that no other local client subscribes to.
	pub fn exclusive_topics(&self, client: &str) -> Vec<String> {
		let local = self.local.read().expect("lock poisoned");
		let Some(topics) = local.clients.get(client) else {
			return vec![];
		};
		topics
			.iter()
			.filter(|topic| {
				!local
					.clients
					.iter()
					.any(|(other, other_topics)| other != client && other_topics.contains(*topic))
			})
			.cloned()
			.collect()
	}

	/// True when the peer's advertised sequence differs from the stored one,
	/// i.e. its full topic list should be pulled.
	pub fn check_peer_seq(&self, node: &str, topic_seq: u32) -> bool {
		let peers = self.peers.read().expect("lock poisoned");
		peers.get(node).map(|peer| peer.topic_seq) != Some(topic_seq)
	}

	/// Stores a peer's snapshot. Stale or duplicate sequences are ignored, so
	/// the stored peer sequence is monotonically non-decreasing.
	pub fn ingest_peer_topics(&self, node: &str, topic_seq: u32, topics: HashSet<String>) {
		let mut peers = self.peers.write().expect("lock poisoned");
		if let Some(peer) = peers.get(node) {
			if peer.topic_seq >= topic_seq {
				debug!(node, topic_seq, stored = peer.topic_seq, "Stale peer snapshot ignored");
				return;
			}
		}
		peers.insert(node.to_string(), PeerTopics {
			topic_seq,
			topics,
		});
		info!(node, topic_seq, "Updated peer topic snapshot");
	}

	/// Peer nodes whose last snapshot contains `topic`.
	pub fn nodes_for_topic(&self, topic: &str) -> Vec<String> {
		let peers = self.peers.read().expect("lock poisoned");
		peers
			.iter()
			.filter(|(_, peer)| peer.topics.contains(topic))
			.map(|(node, _)| node.clone())
			.collect()
	}

	/// Purges the state of peers absent from the current membership.
	pub fn on_peer_membership(&self, nodes: &[String]) {
		let mut peers = self.peers.write().expect("lock poisoned");
		let before = peers.len();
		peers.retain(|node, _| nodes.iter().any(|n| n == node));
		let removed = before - peers.len();
		if removed > 0 {
			info!(removed, "Purged offline peers from topic state");
		}
	}

	pub fn parse_sub_topics(data: &[u8]) -> Result<HashSet<String>, GatewayError> {
		let payload: SubTopicsPayload = serde_json::from_slice(data)
			.map_err(|error| GatewayError::Protocol(format!("invalid topic list: {error}")))?;
		Ok(payload
			.topics
			.into_iter()
			.filter(|topic| !topic.is_empty())
			.collect())
	}

	pub fn parse_topic_snapshot(data: &[u8]) -> Result<(u32, HashSet<String>), GatewayError> {
		let snapshot: TopicSnapshot = serde_json::from_slice(data)
			.map_err(|error| GatewayError::Protocol(format!("invalid topic snapshot: {error}")))?;
		let topics = snapshot
			.topic_items
			.into_iter()
			.filter(|topic| !topic.is_empty())
			.collect();
		Ok((snapshot.topic_seq, topics))
	}
}

impl Default for TopicManager {
	fn default() -> Self {
		Self::new()
	}
}
