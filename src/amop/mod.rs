//! Topic-routed application messaging between clients and peer nodes.
//!
//! The plane keeps the distributed topic map fresh by periodic topic-sequence
//! gossip, routes unicast requests with shuffle-and-failover across candidate
//! peers, fans broadcasts out to peers and local subscribers, and bridges
//! requests arriving from the mesh to a randomly chosen local session.

use async_trait::async_trait;
use rand::{seq::SliceRandom, thread_rng, Rng};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::message::{Frame, FrameType};
use crate::session::{Session, SessionRegistry, DEFAULT_REQUEST_TIMEOUT};
use crate::shutdown::Controller;
use crate::topic::TopicManager;
use crate::types::{GatewayError, RpcError};
use crate::utils::spawn_in_span;

pub mod message;

pub use message::{AmopCodecError, AmopMessage, AmopMsgType};

/// Period of the topic-sequence gossip.
pub const GOSSIP_INTERVAL: Duration = Duration::from_millis(2000);
/// Response timeout of requests bridged to a local client session.
pub const CLIENT_RESPONSE_TIMEOUT: Duration = DEFAULT_REQUEST_TIMEOUT;

/// Peer gateway collaborator: the mesh of sibling gateways fronting other
/// nodes, plus the per-client topic registration it maintains.
#[async_trait]
pub trait PeerGateway: Send + Sync {
	/// Request/response exchange with one peer.
	async fn send_to_peer(&self, node: &str, message: AmopMessage) -> Result<AmopMessage, RpcError>;
	/// Fire-and-forget message to one peer.
	async fn post_to_peer(&self, node: &str, message: AmopMessage) -> Result<(), RpcError>;
	/// Fire-and-forget message to every peer.
	async fn broadcast_to_peers(&self, message: AmopMessage) -> Result<(), RpcError>;
	/// Registers a client's full topic set on every gateway endpoint.
	async fn subscribe_topics(&self, client: &str, topics: Vec<String>) -> Result<(), RpcError>;
	/// Withdraws topics that lost their last local subscriber.
	async fn remove_topics(&self, client: &str, topics: Vec<String>) -> Result<(), RpcError>;
	/// Peer information served by `getPeers`.
	async fn peer_info(&self) -> Result<Value, RpcError>;
}

pub struct AmopService {
	topics: Arc<TopicManager>,
	registry: Arc<SessionRegistry>,
	gateway: Arc<dyn PeerGateway>,
	shutdown: Controller<String>,
	running: AtomicBool,
}

impl AmopService {
	pub fn new(
		topics: Arc<TopicManager>,
		registry: Arc<SessionRegistry>,
		gateway: Arc<dyn PeerGateway>,
		shutdown: Controller<String>,
	) -> Arc<Self> {
		Arc::new(AmopService {
			topics,
			registry,
			gateway,
			shutdown,
			running: AtomicBool::new(false),
		})
	}

	/// Starts the gossip loop; every tick advertises the current local topic
	/// sequence to all peers. The loop ends on shutdown.
	pub fn start(self: &Arc<Self>) {
		if self.running.swap(true, Ordering::SeqCst) {
			info!("AMOP service is already running");
			return;
		}

		spawn_in_span({
			let service = self.clone();
			async move {
				let mut interval = tokio::time::interval(GOSSIP_INTERVAL);
				interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
				let shutdown = service.shutdown.triggered_shutdown();
				tokio::pin!(shutdown);
				loop {
					tokio::select! {
						_ = interval.tick() => {
							let message = AmopMessage::topic_seq(service.topics.topic_seq());
							debug!(topic_seq = service.topics.topic_seq(), "Gossiping topic sequence");
							if let Err(error) = service.gateway.broadcast_to_peers(message).await {
								debug!(%error, "Topic sequence gossip failed");
							}
						},
						_ = &mut shutdown => break,
					}
				}
				info!("AMOP gossip loop stopped");
			}
		});
		info!("Started AMOP service");
	}

	pub fn stop(&self) {
		self.running.store(false, Ordering::SeqCst);
	}

	/// Handles a message arriving from the peer mesh; the returned message,
	/// if any, is the direct reply to the sender.
	pub async fn on_peer_message(
		self: &Arc<Self>,
		node: &str,
		message: AmopMessage,
	) -> Result<Option<AmopMessage>, GatewayError> {
		match message.msg_type {
			AmopMsgType::TopicSeq => {
				let advertised: u32 = String::from_utf8_lossy(&message.data)
					.parse()
					.map_err(|_| GatewayError::Protocol("invalid topic sequence".to_string()))?;
				if self.topics.check_peer_seq(node, advertised) {
					info!(node, topic_seq = advertised, "Peer topic sequence changed, pulling topics");
					self.pull_peer_topics(node.to_string());
				}
				Ok(None)
			},
			AmopMsgType::RequestTopic => {
				let snapshot = self.topics.export_local_topics();
				let data = serde_json::to_vec(&snapshot)
					.map_err(|error| GatewayError::Internal(error.to_string()))?;
				Ok(Some(AmopMessage::new(AmopMsgType::ResponseTopic, "", data)))
			},
			AmopMsgType::ResponseTopic => {
				self.ingest_snapshot(node, &message.data)?;
				Ok(None)
			},
			AmopMsgType::Request => {
				let response = self
					.deliver_to_local_client(&message.topic, &message.data)
					.await?;
				Ok(Some(AmopMessage::new(
					AmopMsgType::Response,
					message.topic,
					response.data,
				)))
			},
			AmopMsgType::Broadcast => {
				self.broadcast_to_local_sessions(&message.topic, &message);
				Ok(None)
			},
			AmopMsgType::Response => {
				warn!(node, "Unsolicited AMOP response dropped");
				Ok(None)
			},
		}
	}

	fn pull_peer_topics(self: &Arc<Self>, node: String) {
		spawn_in_span({
			let service = self.clone();
			async move {
				let request = AmopMessage::new(AmopMsgType::RequestTopic, "", vec![]);
				match service.gateway.send_to_peer(&node, request).await {
					Ok(response) if response.msg_type == AmopMsgType::ResponseTopic => {
						if let Err(error) = service.ingest_snapshot(&node, &response.data) {
							error!(node, %error, "Failed to ingest peer topic snapshot");
						}
					},
					Ok(response) => {
						warn!(node, response_type = ?response.msg_type, "Unexpected topic pull response");
					},
					Err(error) => {
						warn!(node, %error, "Topic pull failed");
					},
				}
			}
		});
	}

	fn ingest_snapshot(&self, node: &str, data: &[u8]) -> Result<(), GatewayError> {
		let (topic_seq, topics) = TopicManager::parse_topic_snapshot(data)?;
		self.topics.ingest_peer_topics(node, topic_seq, topics);
		Ok(())
	}

	/// Client subscribe: replaces the client's topic set and pushes it to
	/// every peer gateway endpoint.
	pub fn on_client_subscribe(
		self: &Arc<Self>,
		endpoint: &str,
		data: &[u8],
	) -> Result<(), GatewayError> {
		let topics = TopicManager::parse_sub_topics(data)?;
		let mut topic_list: Vec<String> = topics.iter().cloned().collect();
		topic_list.sort();
		self.topics.subscribe_client(endpoint, topics);

		spawn_in_span({
			let service = self.clone();
			let endpoint = endpoint.to_string();
			async move {
				if let Err(error) = service.gateway.subscribe_topics(&endpoint, topic_list).await {
					warn!(endpoint, %error, "Failed to propagate topic subscription");
				}
			}
		});
		Ok(())
	}

	/// Client disconnect: releases the client's topics and withdraws the
	/// ones that lost their last local subscriber from the peer gateways.
	pub fn on_client_disconnect(self: &Arc<Self>, endpoint: &str) {
		let mut orphaned = self.topics.exclusive_topics(endpoint);
		orphaned.sort();
		self.topics.unsubscribe_client(endpoint);
		if orphaned.is_empty() {
			return;
		}

		spawn_in_span({
			let service = self.clone();
			let endpoint = endpoint.to_string();
			async move {
				if let Err(error) = service.gateway.remove_topics(&endpoint, orphaned).await {
					warn!(endpoint, %error, "Failed to withdraw orphaned topics");
				}
			}
		});
	}

	/// Unicast request with failover: candidates are shuffled and tried in
	/// order; a remote NO_SUBSCRIBER triggers a local attempt before moving
	/// on, and local delivery is the last resort after the candidates are
	/// exhausted.
	pub async fn unicast(&self, topic: &str, data: &[u8]) -> Result<Vec<u8>, GatewayError> {
		let mut candidates = self.topics.nodes_for_topic(topic);
		if candidates.is_empty() {
			return Err(GatewayError::NoSubscriber(topic.to_string()));
		}
		candidates.shuffle(&mut thread_rng());

		let message = AmopMessage::new(AmopMsgType::Request, topic, data.to_vec());
		for node in &candidates {
			match self.gateway.send_to_peer(node, message.clone()).await {
				Ok(response) => {
					debug!(node, topic, "Unicast delivered to peer");
					return Ok(response.data);
				},
				Err(error) => {
					debug!(node, topic, %error, "Peer delivery failed, trying next candidate");
					if error.is_no_subscriber() {
						if let Ok(response) = self.deliver_to_local_client(topic, data).await {
							return Ok(response.data);
						}
					}
				},
			}
		}

		match self.deliver_to_local_client(topic, data).await {
			Ok(response) => Ok(response.data),
			Err(_) => Err(GatewayError::NoSubscriberAfterRetry(topic.to_string())),
		}
	}

	/// Entry point of requests originated by a local client: the peer mesh is
	/// tried first; when no peer subscribes the topic, a subscriber connected
	/// to this gateway still gets the message.
	pub async fn client_request(&self, topic: &str, data: &[u8]) -> Result<Vec<u8>, GatewayError> {
		match self.unicast(topic, data).await {
			Ok(response) => Ok(response),
			Err(GatewayError::NoSubscriber(_)) => self
				.deliver_to_local_client(topic, data)
				.await
				.map(|frame| frame.data)
				.map_err(|_| GatewayError::NoSubscriber(topic.to_string())),
			Err(error) => Err(error),
		}
	}

	/// Broadcast to every candidate peer and every locally subscribed
	/// session; fire-and-forget, so an empty candidate set is a no-op.
	pub async fn broadcast(&self, topic: &str, data: &[u8]) {
		let message = AmopMessage::new(AmopMsgType::Broadcast, topic, data.to_vec());
		let nodes = self.topics.nodes_for_topic(topic);
		if nodes.is_empty() {
			debug!(topic, "No peer subscribes the topic");
		}
		for node in &nodes {
			if let Err(error) = self.gateway.post_to_peer(node, message.clone()).await {
				debug!(node, topic, %error, "Peer broadcast failed");
			}
		}
		self.broadcast_to_local_sessions(topic, &message);
	}

	fn broadcast_to_local_sessions(&self, topic: &str, message: &AmopMessage) {
		for client in self.topics.clients_for_topic(topic) {
			let Some(session) = self.registry.get(&client) else {
				continue;
			};
			let frame = Frame::new(FrameType::AmopBroadcast, message.encode().to_vec());
			if let Err(error) = session.send(&frame) {
				debug!(client, topic, %error, "Local broadcast delivery failed");
			}
		}
	}

	/// Picks a uniformly random connected session among the topic's local
	/// subscribers (retrying up to the subscriber count to skip dead ones)
	/// and forwards the request with the client response timeout.
	async fn deliver_to_local_client(
		&self,
		topic: &str,
		data: &[u8],
	) -> Result<Frame, GatewayError> {
		let clients = self.topics.clients_for_topic(topic);
		if clients.is_empty() {
			return Err(GatewayError::NoSubscriber(topic.to_string()));
		}

		let mut chosen: Option<Session> = None;
		for _ in 0..clients.len() {
			let index = thread_rng().gen_range(0..clients.len());
			if let Some(session) = self.registry.get(&clients[index]) {
				if session.is_connected() {
					chosen = Some(session);
					break;
				}
			}
		}
		let Some(session) = chosen else {
			return Err(GatewayError::NoSubscriber(topic.to_string()));
		};

		let payload = AmopMessage::new(AmopMsgType::Request, topic, data.to_vec());
		let frame = Frame::new(FrameType::AmopRequest, payload.encode().to_vec());
		debug!(
			topic,
			client = session.endpoint(),
			"Bridging AMOP request to local session"
		);
		session.request(&frame, CLIENT_RESPONSE_TIMEOUT).await
	}
}

#[cfg(test)]
pub(crate) mod tests {
	use super::*;
	use crate::types::StatusCode;
	use std::collections::HashSet;
	use std::sync::Mutex;
	use std::time::Duration;
	use tokio::time::{sleep, timeout};

	/// Scriptable peer gateway: per-node unicast outcomes plus call records.
	pub struct MockGateway {
		pub unicast_outcomes: Mutex<std::collections::HashMap<String, Result<Vec<u8>, RpcError>>>,
		pub sent_to: Mutex<Vec<String>>,
		pub posted_to: Mutex<Vec<String>>,
		pub broadcasts: Mutex<Vec<AmopMessage>>,
		pub subscriptions: Mutex<Vec<(String, Vec<String>)>>,
		pub removals: Mutex<Vec<(String, Vec<String>)>>,
		pub topic_snapshot: Mutex<Option<Vec<u8>>>,
	}

	impl MockGateway {
		pub fn new() -> Arc<Self> {
			Arc::new(MockGateway {
				unicast_outcomes: Mutex::new(std::collections::HashMap::new()),
				sent_to: Mutex::new(Vec::new()),
				posted_to: Mutex::new(Vec::new()),
				broadcasts: Mutex::new(Vec::new()),
				subscriptions: Mutex::new(Vec::new()),
				removals: Mutex::new(Vec::new()),
				topic_snapshot: Mutex::new(None),
			})
		}

		pub fn script_unicast(&self, node: &str, outcome: Result<Vec<u8>, RpcError>) {
			self.unicast_outcomes
				.lock()
				.unwrap()
				.insert(node.to_string(), outcome);
		}

		pub fn set_topic_snapshot(&self, snapshot: &[u8]) {
			*self.topic_snapshot.lock().unwrap() = Some(snapshot.to_vec());
		}
	}

	#[async_trait]
	impl PeerGateway for MockGateway {
		async fn send_to_peer(
			&self,
			node: &str,
			message: AmopMessage,
		) -> Result<AmopMessage, RpcError> {
			self.sent_to.lock().unwrap().push(node.to_string());
			match message.msg_type {
				AmopMsgType::RequestTopic => {
					let snapshot = self
						.topic_snapshot
						.lock()
						.unwrap()
						.clone()
						.ok_or_else(|| RpcError::new(-1, "no snapshot scripted"))?;
					Ok(AmopMessage::new(AmopMsgType::ResponseTopic, "", snapshot))
				},
				_ => {
					let outcomes = self.unicast_outcomes.lock().unwrap();
					match outcomes.get(node) {
						Some(Ok(data)) => Ok(AmopMessage::new(
							AmopMsgType::Response,
							message.topic,
							data.clone(),
						)),
						Some(Err(error)) => Err(error.clone()),
						None => Err(RpcError::new(-1, format!("node {node} not scripted"))),
					}
				},
			}
		}

		async fn post_to_peer(&self, node: &str, _message: AmopMessage) -> Result<(), RpcError> {
			self.posted_to.lock().unwrap().push(node.to_string());
			Ok(())
		}

		async fn broadcast_to_peers(&self, message: AmopMessage) -> Result<(), RpcError> {
			self.broadcasts.lock().unwrap().push(message);
			Ok(())
		}

		async fn subscribe_topics(&self, client: &str, topics: Vec<String>) -> Result<(), RpcError> {
			self.subscriptions
				.lock()
				.unwrap()
				.push((client.to_string(), topics));
			Ok(())
		}

		async fn remove_topics(&self, client: &str, topics: Vec<String>) -> Result<(), RpcError> {
			self.removals
				.lock()
				.unwrap()
				.push((client.to_string(), topics));
			Ok(())
		}

		async fn peer_info(&self) -> Result<Value, RpcError> {
			Ok(serde_json::json!([]))
		}
	}

	pub fn service_with(gateway: Arc<MockGateway>) -> (Arc<AmopService>, Arc<TopicManager>) {
		let topics = Arc::new(TopicManager::new());
		let registry = Arc::new(SessionRegistry::new());
		let service = AmopService::new(
			topics.clone(),
			registry,
			gateway,
			Controller::new(),
		);
		(service, topics)
	}

	fn topic_set(names: &[&str]) -> HashSet<String> {
		names.iter().map(|name| name.to_string()).collect()
	}

	async fn wait_until<F: Fn() -> bool>(condition: F) {
		timeout(Duration::from_secs(5), async {
			while !condition() {
				sleep(Duration::from_millis(5)).await;
			}
		})
		.await
		.expect("condition not reached in time");
	}

	#[tokio::test]
	async fn gossip_convergence_pulls_changed_peers_only() {
		let gateway = MockGateway::new();
		gateway.set_topic_snapshot(br#"{"topicSeq":5,"topicItems":["a","b"]}"#);
		let (service, topics) = service_with(gateway.clone());

		// advertised sequence differs from the stored one: a pull is emitted
		service
			.on_peer_message("p1", AmopMessage::topic_seq(5))
			.await
			.unwrap();
		wait_until(|| !topics.nodes_for_topic("a").is_empty()).await;
		assert_eq!(topics.nodes_for_topic("a"), vec!["p1"]);
		assert_eq!(gateway.sent_to.lock().unwrap().len(), 1);

		// the same sequence again is ignored: no further pull
		service
			.on_peer_message("p1", AmopMessage::topic_seq(5))
			.await
			.unwrap();
		sleep(Duration::from_millis(20)).await;
		assert_eq!(gateway.sent_to.lock().unwrap().len(), 1);
	}

	#[tokio::test]
	async fn request_topic_is_answered_with_local_snapshot() {
		let (service, topics) = service_with(MockGateway::new());
		topics.subscribe_client("c1", topic_set(&["t1"]));

		let reply = service
			.on_peer_message("p1", AmopMessage::new(AmopMsgType::RequestTopic, "", vec![]))
			.await
			.unwrap()
			.expect("snapshot reply");
		assert_eq!(reply.msg_type, AmopMsgType::ResponseTopic);
		assert_eq!(reply.data, br#"{"topicSeq":1,"topicItems":["t1"]}"#);
	}

	#[tokio::test]
	async fn pushed_response_topic_is_ingested() {
		let (service, topics) = service_with(MockGateway::new());
		service
			.on_peer_message(
				"p1",
				AmopMessage::new(
					AmopMsgType::ResponseTopic,
					"",
					br#"{"topicSeq":3,"topicItems":["x"]}"#.to_vec(),
				),
			)
			.await
			.unwrap();
		assert_eq!(topics.nodes_for_topic("x"), vec!["p1"]);
	}

	#[tokio::test]
	async fn unicast_without_candidates_fails_fast() {
		let (service, _topics) = service_with(MockGateway::new());
		let outcome = service.unicast("t", b"payload").await;
		assert!(matches!(outcome, Err(GatewayError::NoSubscriber(_))));
	}

	#[tokio::test]
	async fn unicast_fails_over_to_next_candidate() {
		let gateway = MockGateway::new();
		gateway.script_unicast("n1", Ok(b"OK".to_vec()));
		gateway.script_unicast("n2", Err(RpcError::no_subscriber("no client")));
		gateway.script_unicast("n3", Err(RpcError::new(-1, "connection refused")));
		let (service, topics) = service_with(gateway.clone());
		for node in ["n1", "n2", "n3"] {
			topics.ingest_peer_topics(node, 1, topic_set(&["t"]));
		}

		let outcome = service.unicast("t", b"payload").await.unwrap();
		assert_eq!(outcome, b"OK");

		// the winning node is tried last at worst; nothing is contacted
		// after a success
		let sent = gateway.sent_to.lock().unwrap().clone();
		assert_eq!(sent.last().map(String::as_str), Some("n1"));
		assert!(sent.len() <= 3);
	}

	#[tokio::test]
	async fn unicast_exhausting_candidates_reports_retry_failure() {
		let gateway = MockGateway::new();
		gateway.script_unicast("n1", Err(RpcError::no_subscriber("no client")));
		gateway.script_unicast("n2", Err(RpcError::new(-1, "connection refused")));
		let (service, topics) = service_with(gateway.clone());
		topics.ingest_peer_topics("n1", 1, topic_set(&["t"]));
		topics.ingest_peer_topics("n2", 1, topic_set(&["t"]));

		let outcome = service.unicast("t", b"payload").await;
		assert!(matches!(
			outcome,
			Err(GatewayError::NoSubscriberAfterRetry(_))
		));
		assert_eq!(gateway.sent_to.lock().unwrap().len(), 2);
	}

	#[tokio::test]
	async fn broadcast_without_subscribers_sends_nothing() {
		let gateway = MockGateway::new();
		let (service, _topics) = service_with(gateway.clone());

		service.broadcast("x", b"payload").await;
		assert!(gateway.posted_to.lock().unwrap().is_empty());
	}

	#[tokio::test]
	async fn broadcast_reaches_every_candidate_peer() {
		let gateway = MockGateway::new();
		let (service, topics) = service_with(gateway.clone());
		topics.ingest_peer_topics("n1", 1, topic_set(&["t"]));
		topics.ingest_peer_topics("n2", 1, topic_set(&["t"]));

		service.broadcast("t", b"payload").await;
		let mut posted = gateway.posted_to.lock().unwrap().clone();
		posted.sort();
		assert_eq!(posted, vec!["n1", "n2"]);
	}

	#[tokio::test]
	async fn client_subscribe_propagates_topic_set() {
		let gateway = MockGateway::new();
		let (service, topics) = service_with(gateway.clone());

		service
			.on_client_subscribe("127.0.0.1:9", br#"{"topics":["t1","t2"]}"#)
			.unwrap();
		wait_until(|| !gateway.subscriptions.lock().unwrap().is_empty()).await;
		assert_eq!(topics.client_topics("127.0.0.1:9"), Some(topic_set(&["t1", "t2"])));

		let subscriptions = gateway.subscriptions.lock().unwrap().clone();
		assert_eq!(subscriptions.len(), 1);
		assert_eq!(subscriptions[0].0, "127.0.0.1:9");
		assert_eq!(subscriptions[0].1, vec!["t1", "t2"]);
	}

	#[tokio::test]
	async fn disconnect_withdraws_only_orphaned_topics() {
		let gateway = MockGateway::new();
		let (service, topics) = service_with(gateway.clone());
		topics.subscribe_client("c1", topic_set(&["a", "b"]));
		topics.subscribe_client("c2", topic_set(&["b"]));

		service.on_client_disconnect("c1");
		wait_until(|| !gateway.removals.lock().unwrap().is_empty()).await;

		let removals = gateway.removals.lock().unwrap().clone();
		assert_eq!(removals[0].1, vec!["a"]);
		assert_eq!(topics.client_topics("c1"), None);
	}

	#[tokio::test]
	async fn client_request_falls_back_to_local_subscriber() {
		let topics = Arc::new(TopicManager::new());
		let registry = Arc::new(SessionRegistry::new());
		let service = AmopService::new(
			topics.clone(),
			registry.clone(),
			MockGateway::new(),
			Controller::new(),
		);

		// one local subscriber, no peers
		let (session, mut outbound) = crate::session::Session::new("127.0.0.1:7");
		registry.add(session.clone());
		topics.subscribe_client("127.0.0.1:7", topic_set(&["t"]));

		// answer the bridged request like a client SDK would
		tokio::spawn(async move {
			let encoded = outbound.recv().await.unwrap();
			let frame = Frame::decode(&encoded).unwrap();
			let request = AmopMessage::decode(&frame.data).unwrap();
			assert_eq!(request.topic, "t");
			assert_eq!(request.data, b"ping");
			let reply = frame.reply(StatusCode::Success, b"pong".to_vec());
			assert!(session.handle_inbound(reply).is_none());
		});

		let response = service.client_request("t", b"ping").await.unwrap();
		assert_eq!(response, b"pong");
	}

	#[tokio::test]
	async fn peer_request_without_local_subscriber_is_rejected() {
		let (service, _topics) = service_with(MockGateway::new());
		let outcome = service
			.on_peer_message("p1", AmopMessage::new(AmopMsgType::Request, "t", b"x".to_vec()))
			.await;
		assert!(matches!(outcome, Err(GatewayError::NoSubscriber(_))));
	}
}
