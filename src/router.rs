//! Frame-type dispatch of inbound client frames.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::amop::{AmopMessage, AmopService};
use crate::event::{
	EventPushPayload, EventService, EventSink, EventSubRequest, EventUnsubRequest,
};
use crate::group::GroupDirectory;
use crate::jsonrpc::JsonRpcDispatcher;
use crate::message::{Frame, FrameType};
use crate::session::{Session, SessionRegistry};
use crate::types::{GatewayError, LogEntry, StatusCode};

pub struct Router {
	registry: Arc<SessionRegistry>,
	directory: Arc<GroupDirectory>,
	amop: Arc<AmopService>,
	events: Arc<EventService>,
	jsonrpc: Arc<JsonRpcDispatcher>,
}

impl Router {
	pub fn new(
		registry: Arc<SessionRegistry>,
		directory: Arc<GroupDirectory>,
		amop: Arc<AmopService>,
		events: Arc<EventService>,
		jsonrpc: Arc<JsonRpcDispatcher>,
	) -> Arc<Self> {
		Arc::new(Router {
			registry,
			directory,
			amop,
			events,
			jsonrpc,
		})
	}

	/// Dispatches one inbound frame. Unknown frame types are logged and
	/// dropped; only malformed frames are session-fatal, and those never
	/// reach the router.
	pub async fn handle_frame(&self, session: Session, frame: Frame) {
		let Some(kind) = frame.kind() else {
			warn!(
				endpoint = session.endpoint(),
				frame_type = frame.frame_type,
				seq = frame.seq_string(),
				"Unrecognized frame type dropped"
			);
			return;
		};

		debug!(
			endpoint = session.endpoint(),
			frame_type = frame.frame_type,
			seq = frame.seq_string(),
			"Dispatching frame"
		);
		match kind {
			FrameType::Handshake => self.on_handshake(&session, &frame).await,
			FrameType::RpcRequest => self.on_rpc_request(&session, &frame).await,
			FrameType::AmopSubTopic => self.on_sub_topics(&session, &frame),
			FrameType::AmopRequest => self.on_amop_request(&session, &frame).await,
			FrameType::AmopBroadcast => self.on_amop_broadcast(&frame).await,
			FrameType::EventSubscribe => self.on_event_subscribe(&session, &frame),
			FrameType::EventUnsubscribe => self.on_event_unsubscribe(&session, &frame),
			FrameType::BlockNotify | FrameType::EventLogPush | FrameType::AmopResponse => {
				warn!(
					endpoint = session.endpoint(),
					frame_type = frame.frame_type,
					"Server-push frame type received from client, dropped"
				);
			},
		}
	}

	/// Replies with the gateway identity and the current block number of the
	/// ledger, so the SDK can resume where it left off.
	async fn on_handshake(&self, session: &Session, frame: &Frame) {
		let groups = self.directory.group_list();
		let mut block_number = -1;
		for group in &groups {
			if let Some(service) = self.directory.select_node(group, None) {
				match service.ledger.block_number().await {
					Ok(number) => {
						block_number = block_number.max(number);
					},
					Err(error) => {
						error!(group, %error, "Failed to get block number for handshake");
					},
				}
			}
		}

		let payload = json!({
			"chainId": self.directory.chain_id(),
			"groupList": groups,
			"blockNumber": block_number,
		});
		let reply = frame.reply(StatusCode::Success, payload.to_string().into_bytes());
		self.send(session, &reply);
	}

	async fn on_rpc_request(&self, session: &Session, frame: &Frame) {
		let body = String::from_utf8_lossy(&frame.data);
		let response = self.jsonrpc.dispatch(&body).await;
		let reply = frame.reply(StatusCode::Success, response.into_bytes());
		self.send(session, &reply);
	}

	fn on_sub_topics(&self, session: &Session, frame: &Frame) {
		if let Err(error) = self.amop.on_client_subscribe(session.endpoint(), &frame.data) {
			warn!(endpoint = session.endpoint(), %error, "Invalid topic subscription");
		}
	}

	/// Routes the request over the AMOP plane and correlates the outcome back
	/// on the request's `seq` as an AMOP_RESPONSE frame.
	async fn on_amop_request(&self, session: &Session, frame: &Frame) {
		let reply = match AmopMessage::decode(&frame.data) {
			Ok(request) => match self.amop.client_request(&request.topic, &request.data).await {
				Ok(response) => frame.reply_as(FrameType::AmopResponse, StatusCode::Success, response),
				Err(error) => {
					warn!(
						endpoint = session.endpoint(),
						topic = request.topic,
						%error,
						"AMOP request failed"
					);
					frame.reply_as(
						FrameType::AmopResponse,
						error.status(),
						error.to_string().into_bytes(),
					)
				},
			},
			Err(error) => {
				warn!(endpoint = session.endpoint(), %error, "Malformed AMOP request payload");
				frame.reply_as(
					FrameType::AmopResponse,
					StatusCode::InvalidParams,
					error.to_string().into_bytes(),
				)
			},
		};
		self.send(session, &reply);
	}

	async fn on_amop_broadcast(&self, frame: &Frame) {
		match AmopMessage::decode(&frame.data) {
			Ok(request) => self.amop.broadcast(&request.topic, &request.data).await,
			Err(error) => warn!(%error, "Malformed AMOP broadcast payload"),
		}
	}

	fn on_event_subscribe(&self, session: &Session, frame: &Frame) {
		let (id, status) = match serde_json::from_slice::<EventSubRequest>(&frame.data) {
			Ok(request) => {
				let id = request.id.clone();
				let sink = Arc::new(SessionSink {
					registry: self.registry.clone(),
					endpoint: session.endpoint().to_string(),
				});
				(id, self.events.subscribe(request, sink))
			},
			Err(error) => {
				warn!(endpoint = session.endpoint(), %error, "Malformed event subscribe request");
				(String::new(), StatusCode::InvalidParams)
			},
		};
		self.send_event_response(session, frame, &id, status);
	}

	fn on_event_unsubscribe(&self, session: &Session, frame: &Frame) {
		let (id, status) = match serde_json::from_slice::<EventUnsubRequest>(&frame.data) {
			Ok(request) => {
				let id = request.id.clone();
				(id, self.events.unsubscribe(request))
			},
			Err(error) => {
				warn!(endpoint = session.endpoint(), %error, "Malformed event unsubscribe request");
				(String::new(), StatusCode::InvalidParams)
			},
		};
		self.send_event_response(session, frame, &id, status);
	}

	fn send_event_response(&self, session: &Session, frame: &Frame, id: &str, status: StatusCode) {
		let payload = json!({ "id": id, "status": status.code() });
		let reply = frame.reply(status, payload.to_string().into_bytes());
		self.send(session, &reply);
	}

	fn send(&self, session: &Session, frame: &Frame) {
		if let Err(error) = session.send(frame) {
			warn!(endpoint = session.endpoint(), %error, "Failed to queue outbound frame");
		}
	}
}

/// Delivery side of an event task: resolves the owning session by endpoint
/// per push, so a torn-down session is observed as `false` on the next probe.
pub struct SessionSink {
	registry: Arc<SessionRegistry>,
	endpoint: String,
}

#[async_trait]
impl EventSink for SessionSink {
	async fn push(&self, id: &str, status: StatusCode, result: &[LogEntry]) -> bool {
		let Some(session) = self.registry.get(&self.endpoint) else {
			return false;
		};
		if !session.is_connected() {
			return false;
		}

		if status == StatusCode::PushCompleted {
			let payload = EventPushPayload {
				id: id.to_string(),
				status: status.code(),
				result: None,
			};
			return self.push_frame(&session, &payload);
		}

		// an empty successful push is a pure liveness probe
		if result.is_empty() {
			return true;
		}

		let payload = EventPushPayload {
			id: id.to_string(),
			status: status.code(),
			result: Some(result.to_vec()),
		};
		self.push_frame(&session, &payload)
	}
}

impl SessionSink {
	fn push_frame(&self, session: &Session, payload: &EventPushPayload) -> bool {
		let Ok(data) = serde_json::to_vec(payload) else {
			return true;
		};
		match session.send(&Frame::new(FrameType::EventLogPush, data)) {
			Ok(()) => true,
			Err(GatewayError::Disconnected) => false,
			Err(_) => true,
		}
	}
}
