//! Facade tying the gateway components together and receiving the
//! out-of-band notifications from the host process.

use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::amop::{AmopMessage, AmopService, PeerGateway};
use crate::configuration::GatewayConfig;
use crate::event::EventService;
use crate::group::{GroupDirectory, NodeServiceFactory};
use crate::jsonrpc::JsonRpcDispatcher;
use crate::message::{Frame, FrameType};
use crate::router::Router;
use crate::session::SessionRegistry;
use crate::shutdown::Controller;
use crate::topic::TopicManager;
use crate::types::{BlockNumber, GatewayError, GroupInfo};
use crate::utils::spawn_in_span;

const STATUS_LOOP_INTERVAL: Duration = Duration::from_secs(10);

pub struct RpcService {
	config: GatewayConfig,
	registry: Arc<SessionRegistry>,
	topics: Arc<TopicManager>,
	directory: Arc<GroupDirectory>,
	amop: Arc<AmopService>,
	events: Arc<EventService>,
	jsonrpc: Arc<JsonRpcDispatcher>,
	router: Arc<Router>,
	shutdown: Controller<String>,
	running: AtomicBool,
}

impl RpcService {
	/// Assembles the component graph from the configuration and the external
	/// collaborators. Session disconnects release the client's topic state
	/// and withdraw orphaned topics from the peer gateways.
	pub fn new(
		config: GatewayConfig,
		chain_id: impl Into<String>,
		factory: Arc<dyn NodeServiceFactory>,
		gateway: Arc<dyn PeerGateway>,
	) -> Arc<Self> {
		let shutdown = Controller::new();
		let registry = Arc::new(SessionRegistry::new());
		let topics = Arc::new(TopicManager::new());
		let directory = Arc::new(GroupDirectory::new(chain_id, factory));
		let amop = AmopService::new(
			topics.clone(),
			registry.clone(),
			gateway.clone(),
			shutdown.clone(),
		);
		let events = Arc::new(EventService::new(directory.clone()));
		let jsonrpc = Arc::new(JsonRpcDispatcher::new(directory.clone(), gateway));
		let router = Router::new(
			registry.clone(),
			directory.clone(),
			amop.clone(),
			events.clone(),
			jsonrpc.clone(),
		);

		registry.register_disconnect_hook({
			let amop = amop.clone();
			move |endpoint| amop.on_client_disconnect(endpoint)
		});

		Arc::new(RpcService {
			config,
			registry,
			topics,
			directory,
			amop,
			events,
			jsonrpc,
			router,
			shutdown,
			running: AtomicBool::new(false),
		})
	}

	pub fn start(&self) {
		if self.running.swap(true, Ordering::SeqCst) {
			info!("RPC service is already running");
			return;
		}
		self.amop.start();
		self.events.start();

		spawn_in_span({
			let registry = self.registry.clone();
			let shutdown = self.shutdown.clone();
			async move {
				let mut interval = tokio::time::interval(STATUS_LOOP_INTERVAL);
				let triggered = shutdown.triggered_shutdown();
				tokio::pin!(triggered);
				loop {
					tokio::select! {
						_ = interval.tick() => {
							info!(sessions = registry.sessions().len(), "Connected client sessions");
						},
						_ = &mut triggered => break,
					}
				}
			}
		});
		info!("Started RPC service");
	}

	pub fn stop(&self) {
		if !self.running.swap(false, Ordering::SeqCst) {
			return;
		}
		self.events.stop();
		self.amop.stop();
		let _ = self.shutdown.trigger_shutdown("RPC service stopped".to_string());
		info!("Stopped RPC service");
	}

	/// Block notification from a node: updates the latest-block index, wakes
	/// the group's event walker and pushes BLOCK_NOTIFY to every session.
	pub fn notify_block_number(
		&self,
		group_id: &str,
		node_name: &str,
		block_number: BlockNumber,
	) {
		self.directory
			.update_group_block_info(group_id, node_name, block_number);
		self.events.set_latest_block(group_id, block_number);

		let payload = json!({
			"group": group_id,
			"nodeName": node_name,
			"blockNumber": block_number,
		});
		let sessions = self.registry.sessions();
		for session in &sessions {
			let frame = Frame::new(FrameType::BlockNotify, payload.to_string().into_bytes());
			if let Err(error) = session.send(&frame) {
				warn!(endpoint = session.endpoint(), %error, "Block notify delivery failed");
			}
		}
		info!(
			group = group_id,
			node = node_name,
			block = block_number,
			sessions = sessions.len(),
			"Pushed block notification"
		);
	}

	/// Group membership notification from the registry: merges metadata and
	/// makes sure the group's event walker exists.
	pub async fn notify_group_info(&self, group_info: GroupInfo) {
		let group_id = group_info.group_id.clone();
		self.directory.update_group_info(group_info).await;
		self.events.ensure_group(&group_id);
	}

	/// Removal of a group: its event walker stops and its tasks are dropped.
	pub fn notify_group_removal(&self, group_id: &str) {
		self.events.remove_group(group_id);
		self.directory.remove_group(group_id);
	}

	/// Inbound message from the peer mesh; the returned bytes, if any, are
	/// the direct reply to the sending peer.
	pub async fn notify_peer_message(
		&self,
		node: &str,
		data: &[u8],
	) -> Result<Option<Vec<u8>>, GatewayError> {
		let message = AmopMessage::decode(data)
			.map_err(|error| GatewayError::Protocol(error.to_string()))?;
		let reply = self.amop.on_peer_message(node, message).await?;
		Ok(reply.map(|message| message.encode().to_vec()))
	}

	/// Peer membership change: purges topic state of offline peers.
	pub fn notify_peer_membership(&self, nodes: &[String]) {
		self.topics.on_peer_membership(nodes);
	}

	pub fn config(&self) -> &GatewayConfig {
		&self.config
	}

	pub fn registry(&self) -> &Arc<SessionRegistry> {
		&self.registry
	}

	pub fn topics(&self) -> &Arc<TopicManager> {
		&self.topics
	}

	pub fn router(&self) -> &Arc<Router> {
		&self.router
	}

	pub fn jsonrpc(&self) -> &Arc<JsonRpcDispatcher> {
		&self.jsonrpc
	}

	pub fn directory(&self) -> &Arc<GroupDirectory> {
		&self.directory
	}

	pub fn shutdown(&self) -> &Controller<String> {
		&self.shutdown
	}
}

impl Drop for RpcService {
	fn drop(&mut self) {
		self.stop();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::amop::tests::MockGateway;
	use crate::amop::{AmopMessage, AmopMsgType};
	use crate::group::tests::{group_info, StaticFactory};

	fn service() -> (Arc<RpcService>, Arc<MockGateway>) {
		let gateway = MockGateway::new();
		let service = RpcService::new(
			GatewayConfig::default(),
			"chain0",
			Arc::new(StaticFactory::new(42, vec![])),
			gateway.clone(),
		);
		(service, gateway)
	}

	#[tokio::test]
	async fn start_and_stop_are_idempotent() {
		let (service, _gateway) = service();
		service.start();
		service.start();
		service.stop();
		service.stop();
		assert!(service.shutdown().is_shutdown_triggered());
	}

	#[tokio::test]
	async fn block_notification_updates_directory_and_selector() {
		let (service, _gateway) = service();
		service.notify_group_info(group_info("g1", &["n1", "n2"])).await;

		service.notify_block_number("g1", "n1", 100);
		service.notify_block_number("g1", "n2", 99);
		assert_eq!(service.directory().latest_block_number("g1"), 100);
		assert_eq!(service.directory().select_node("g1", None).unwrap().name, "n1");
	}

	#[tokio::test]
	async fn peer_topic_request_is_answered() {
		let (service, _gateway) = service();
		let request = AmopMessage::new(AmopMsgType::RequestTopic, "", vec![]);
		let reply = service
			.notify_peer_message("p1", &request.encode())
			.await
			.unwrap()
			.expect("snapshot reply");
		let reply = AmopMessage::decode(&reply).unwrap();
		assert_eq!(reply.msg_type, AmopMsgType::ResponseTopic);
	}

	#[tokio::test]
	async fn malformed_peer_message_is_a_protocol_error() {
		let (service, _gateway) = service();
		let outcome = service.notify_peer_message("p1", &[0x00]).await;
		assert!(matches!(outcome, Err(GatewayError::Protocol(_))));
	}

	#[tokio::test]
	async fn peer_membership_purges_topic_state() {
		let (service, _gateway) = service();
		service
			.notify_peer_message(
				"p1",
				&AmopMessage::new(
					AmopMsgType::ResponseTopic,
					"",
					br#"{"topicSeq":1,"topicItems":["t"]}"#.to_vec(),
				)
				.encode(),
			)
			.await
			.unwrap();
		assert_eq!(service.topics().nodes_for_topic("t"), vec!["p1"]);

		service.notify_peer_membership(&[]);
		assert!(service.topics().nodes_for_topic("t").is_empty());
	}
}
